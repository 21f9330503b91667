use std::collections::BTreeMap;

use reqwest::Url;
use serde::Serialize;
use serde_json::Value;

use crate::api::Request;
use crate::error::{Result, WikiError};
use crate::login::TokenKind;
use crate::site::Site;
use crate::title::Title;

const TOPIC_NAMESPACE_PREFIX: &str = "Topic:";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModerationState {
    Delete,
    Hide,
    Suppress,
    Restore,
}

impl ModerationState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Delete => "delete",
            Self::Hide => "hide",
            Self::Suppress => "suppress",
            Self::Restore => "restore",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Post {
    pub uuid: String,
    pub topic: String,
    pub creator: Option<String>,
    pub content: Option<String>,
    /// Moderation state, `None` for unmoderated posts.
    pub moderation: Option<String>,
    pub replies: Vec<String>,
}

impl Post {
    fn from_revision(uuid: &str, topic: &str, revision: &Value) -> Self {
        let content = revision
            .get("content")
            .and_then(|content| content.get("content"))
            .and_then(Value::as_str)
            .map(ToString::to_string);
        let moderated = revision
            .get("isModerated")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        Self {
            uuid: uuid.to_string(),
            topic: topic.to_string(),
            creator: revision
                .get("creator")
                .and_then(|creator| creator.get("name"))
                .and_then(Value::as_str)
                .map(ToString::to_string),
            content,
            moderation: revision
                .get("moderateState")
                .and_then(Value::as_str)
                .filter(|_| moderated)
                .map(ToString::to_string),
            replies: revision
                .get("replies")
                .and_then(Value::as_array)
                .map(|items| {
                    items
                        .iter()
                        .filter_map(Value::as_str)
                        .map(ToString::to_string)
                        .collect()
                })
                .unwrap_or_default(),
        }
    }

    pub fn load(site: &mut Site, topic: &str, uuid: &str) -> Result<Self> {
        let payload = site.submit(
            &Request::new("flow")
                .set("submodule", "view-post")
                .set("page", topic)
                .set("vppostId", uuid)
                .set("vpformat", "wikitext"),
        )?;
        let block = flow_result(&payload, "view-post")?
            .get("topic")
            .ok_or_else(|| WikiError::Unexpected("view-post without topic block".to_string()))?;
        parse_posts(block, topic)
            .remove(uuid)
            .ok_or_else(|| WikiError::Unexpected(format!("post {uuid} not in response")))
    }

    pub fn reply(&self, site: &mut Site, content: &str) -> Result<Post> {
        let post_id = submit_reply(site, &self.topic, &self.uuid, content)?;
        Post::load(site, &self.topic, &post_id)
    }

    pub fn moderate(&mut self, site: &mut Site, state: ModerationState, reason: &str) -> Result<()> {
        let request = Request::new("flow")
            .set("submodule", "moderate-post")
            .set("page", self.topic.as_str())
            .set("mppostId", self.uuid.as_str())
            .set("mpmoderationState", state.as_str())
            .set("mpreason", reason);
        site.submit_write(request, TokenKind::Csrf)?;
        self.moderation = match state {
            ModerationState::Restore => None,
            other => Some(other.as_str().to_string()),
        };
        Ok(())
    }
}

fn flow_result<'a>(payload: &'a Value, submodule: &str) -> Result<&'a Value> {
    payload
        .get("flow")
        .and_then(|flow| flow.get(submodule))
        .and_then(|module| module.get("result"))
        .ok_or_else(|| WikiError::Unexpected(format!("missing flow {submodule} result")))
}

fn committed<'a>(payload: &'a Value, submodule: &str) -> Option<&'a Value> {
    payload
        .get("flow")
        .and_then(|flow| flow.get(submodule))
        .and_then(|module| module.get("committed"))
}

fn parse_posts(block: &Value, topic: &str) -> BTreeMap<String, Post> {
    let mut posts = BTreeMap::new();
    let (Some(post_revisions), Some(revisions)) = (
        block.get("posts").and_then(Value::as_object),
        block.get("revisions").and_then(Value::as_object),
    ) else {
        return posts;
    };
    for (uuid, revision_ids) in post_revisions {
        let latest = revision_ids
            .as_array()
            .and_then(|ids| ids.first())
            .and_then(Value::as_str)
            .and_then(|id| revisions.get(id));
        if let Some(revision) = latest {
            posts.insert(uuid.clone(), Post::from_revision(uuid, topic, revision));
        }
    }
    posts
}

fn roots(block: &Value) -> Vec<String> {
    block
        .get("roots")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(ToString::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn root_flags(block: &Value, root: &str) -> (bool, bool) {
    let revision = block
        .get("posts")
        .and_then(|posts| posts.get(root))
        .and_then(Value::as_array)
        .and_then(|ids| ids.first())
        .and_then(Value::as_str)
        .and_then(|id| block.get("revisions").and_then(|revisions| revisions.get(id)));
    let flag = |name: &str| {
        revision
            .and_then(|revision| revision.get(name))
            .and_then(Value::as_bool)
            .unwrap_or(false)
    };
    (flag("isLocked"), flag("isModerated"))
}

fn submit_reply(site: &mut Site, topic: &str, reply_to: &str, content: &str) -> Result<String> {
    let request = Request::new("flow")
        .set("submodule", "reply")
        .set("page", topic)
        .set("repreplyTo", reply_to)
        .set("repcontent", content)
        .set("repformat", "wikitext");
    let payload = site.submit_write(request, TokenKind::Csrf)?;
    committed(&payload, "reply")
        .and_then(|committed| committed.get("topic"))
        .and_then(|topic| topic.get("post-id"))
        .and_then(Value::as_str)
        .map(ToString::to_string)
        .ok_or_else(|| WikiError::Unexpected("reply response has no post id".to_string()))
}

#[derive(Debug, Clone, Serialize)]
pub struct Topic {
    /// `Topic:<uuid>`.
    pub page: String,
    pub root: String,
    pub posts: BTreeMap<String, Post>,
    pub locked: bool,
    pub moderated: bool,
}

impl Topic {
    pub fn load(site: &mut Site, page: &str) -> Result<Self> {
        let page = if page.starts_with(TOPIC_NAMESPACE_PREFIX) {
            page.to_string()
        } else {
            format!("{TOPIC_NAMESPACE_PREFIX}{page}")
        };
        let payload = site.submit(
            &Request::new("flow")
                .set("submodule", "view-topic")
                .set("page", page.as_str())
                .set("vtformat", "wikitext"),
        )?;
        let block = flow_result(&payload, "view-topic")?
            .get("topic")
            .ok_or_else(|| WikiError::Unexpected("view-topic without topic block".to_string()))?;
        Self::from_block(block, &page)
    }

    fn from_block(block: &Value, page: &str) -> Result<Self> {
        let root = roots(block)
            .into_iter()
            .next()
            .ok_or_else(|| WikiError::NoPage(page.to_string()))?;
        let (locked, moderated) = root_flags(block, &root);
        Ok(Self {
            page: page.to_string(),
            posts: parse_posts(block, page),
            root,
            locked,
            moderated,
        })
    }

    /// Topic subject, stored as the root post's content.
    pub fn title(&self) -> Option<&str> {
        self.root_post().and_then(|post| post.content.as_deref())
    }

    pub fn root_post(&self) -> Option<&Post> {
        self.posts.get(&self.root)
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    pub fn is_moderated(&self) -> bool {
        self.moderated
    }

    /// Direct replies to the topic, freshly loaded.
    pub fn replies(&mut self, site: &mut Site) -> Result<Vec<Post>> {
        *self = Topic::load(site, &self.page)?;
        let Some(root) = self.root_post() else {
            return Ok(Vec::new());
        };
        Ok(root
            .replies
            .iter()
            .filter_map(|uuid| self.posts.get(uuid).cloned())
            .collect())
    }

    pub fn reply(&self, site: &mut Site, content: &str) -> Result<Post> {
        let post_id = submit_reply(site, &self.page, &self.root, content)?;
        Post::load(site, &self.page, &post_id)
    }

    fn set_lock(&mut self, site: &mut Site, state: &str, reason: &str) -> Result<()> {
        let request = Request::new("flow")
            .set("submodule", "lock-topic")
            .set("page", self.page.as_str())
            .set("cotmoderationState", state)
            .set("cotreason", reason);
        site.submit_write(request, TokenKind::Csrf)?;
        self.locked = state == "lock";
        Ok(())
    }

    pub fn lock(&mut self, site: &mut Site, reason: &str) -> Result<()> {
        self.set_lock(site, "lock", reason)
    }

    pub fn unlock(&mut self, site: &mut Site, reason: &str) -> Result<()> {
        self.set_lock(site, "unlock", reason)
    }

    pub fn moderate(&mut self, site: &mut Site, state: ModerationState, reason: &str) -> Result<()> {
        let request = Request::new("flow")
            .set("submodule", "moderate-topic")
            .set("page", self.page.as_str())
            .set("mtmoderationState", state.as_str())
            .set("mtreason", reason);
        site.submit_write(request, TokenKind::Csrf)?;
        self.moderated = state != ModerationState::Restore;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct Board {
    title: Title,
}

impl Board {
    pub fn new(title: Title) -> Self {
        Self { title }
    }

    pub fn title(&self) -> &Title {
        &self.title
    }

    /// Topics newest first, following the board's pagination links.
    pub fn topics(&self, site: &mut Site, limit: Option<usize>) -> Result<Vec<Topic>> {
        let mut topics = Vec::new();
        let mut offset: Vec<(String, String)> = Vec::new();
        loop {
            let mut request = Request::new("flow")
                .set("submodule", "view-topiclist")
                .set("page", self.title.full_title())
                .set("vtlformat", "wikitext")
                .set("vtllimit", "50");
            for (key, value) in &offset {
                request = request.set(key, value.as_str());
            }
            let payload = site.submit(&request)?;
            let list = flow_result(&payload, "view-topiclist")?
                .get("topiclist")
                .ok_or_else(|| WikiError::Unexpected("view-topiclist without topiclist".to_string()))?;

            let root_ids = roots(list);
            if root_ids.is_empty() {
                break;
            }
            for root in root_ids {
                let page = format!("{TOPIC_NAMESPACE_PREFIX}{root}");
                let (locked, moderated) = root_flags(list, &root);
                topics.push(Topic {
                    posts: parse_posts(list, &page),
                    page,
                    root,
                    locked,
                    moderated,
                });
                if limit.is_some_and(|limit| topics.len() >= limit) {
                    return Ok(topics);
                }
            }

            let next = next_page_params(list);
            if next.is_empty() || next == offset {
                break;
            }
            offset = next;
        }
        Ok(topics)
    }

    pub fn new_topic(&self, site: &mut Site, subject: &str, content: &str) -> Result<Topic> {
        let request = Request::new("flow")
            .set("submodule", "new-topic")
            .set("page", self.title.full_title())
            .set("nttopic", subject)
            .set("ntcontent", content)
            .set("ntformat", "wikitext");
        let payload = site.submit_write(request, TokenKind::Csrf)?;
        let topic_id = committed(&payload, "new-topic")
            .and_then(|committed| committed.get("topiclist"))
            .and_then(|list| list.get("topic-id"))
            .and_then(Value::as_str)
            .ok_or_else(|| WikiError::Unexpected("new-topic response has no topic id".to_string()))?;
        tracing::info!(board = %self.title, topic = topic_id, "topic created");
        Topic::load(site, topic_id)
    }
}

/// `vtl*` offset parameters from the forward pagination link.
fn next_page_params(list: &Value) -> Vec<(String, String)> {
    let Some(url) = list
        .get("links")
        .and_then(|links| links.get("pagination"))
        .and_then(|pagination| pagination.get("fwd"))
        .and_then(|forward| forward.get("url"))
        .and_then(Value::as_str)
    else {
        return Vec::new();
    };
    let parsed = match Url::parse(url).or_else(|_| Url::parse(&format!("https://localhost{url}"))) {
        Ok(parsed) => parsed,
        Err(_) => return Vec::new(),
    };
    parsed
        .query_pairs()
        .filter_map(|(key, value)| {
            key.strip_prefix("topiclist_")
                .map(|rest| (format!("vtl{rest}"), value.to_string()))
        })
        .filter(|(key, _)| key != "vtlformat")
        .collect()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::testing::{MockTransport, mock_site};

    fn topic_block(root: &str, locked: bool) -> Value {
        json!({
            "roots": [root],
            "posts": {root: ["r1"], "p2": ["r2"]},
            "revisions": {
                "r1": {"content": {"content": "Subject", "format": "wikitext"},
                       "isLocked": locked, "isModerated": false, "replies": ["p2"],
                       "creator": {"name": "Alice"}},
                "r2": {"content": {"content": "First reply", "format": "wikitext"},
                       "isModerated": true, "moderateState": "hide", "replies": [],
                       "creator": {"name": "Bob"}}
            }
        })
    }

    #[test]
    fn topic_load_parses_posts() {
        let transport = MockTransport::new();
        transport.push_json(json!({"flow": {"view-topic": {"result": {"topic": topic_block("t1", true)}}}}));
        let mut site = mock_site(&transport);
        let topic = Topic::load(&mut site, "t1").expect("topic");
        assert_eq!(topic.page, "Topic:t1");
        assert_eq!(topic.title(), Some("Subject"));
        assert!(topic.is_locked());
        let reply = &topic.posts["p2"];
        assert_eq!(reply.creator.as_deref(), Some("Bob"));
        assert_eq!(reply.moderation.as_deref(), Some("hide"));
        assert_eq!(transport.request(0).param("page"), Some("Topic:t1"));
    }

    #[test]
    fn board_topics_follow_pagination() {
        let transport = MockTransport::new();
        let mut first = topic_block("t1", false);
        first["links"] = json!({"pagination": {"fwd": {"url":
            "/w/index.php?title=Talk:Foo&topiclist_offset-id=abc&topiclist_offset-dir=fwd&topiclist_format=wikitext"}}});
        transport.push_json(json!({"flow": {"view-topiclist": {"result": {"topiclist": first}}}}));
        transport.push_json(json!({"flow": {"view-topiclist": {"result": {"topiclist": topic_block("t2", false)}}}}));
        let mut site = mock_site(&transport);
        let board = Board::new(site.parse_title("Talk:Foo").expect("title"));
        let topics = board.topics(&mut site, None).expect("topics");
        assert_eq!(
            topics.iter().map(|topic| topic.root.as_str()).collect::<Vec<_>>(),
            vec!["t1", "t2"]
        );
        let second = transport.request(1);
        assert_eq!(second.param("vtloffset-id"), Some("abc"));
        assert_eq!(second.param("vtloffset-dir"), Some("fwd"));
        assert_eq!(second.param("vtlformat"), Some("wikitext"));
    }

    #[test]
    fn new_topic_and_reply() {
        let transport = MockTransport::new();
        transport.push_json(json!({"query": {"tokens": {"csrftoken": "t+\\"}}}));
        transport.push_json(json!({"flow": {"new-topic": {"status": "ok",
            "committed": {"topiclist": {"topic-id": "t9", "post-id": "t9"}}}}}));
        transport.push_json(json!({"flow": {"view-topic": {"result": {"topic": topic_block("t9", false)}}}}));
        transport.push_json(json!({"flow": {"reply": {"status": "ok",
            "committed": {"topic": {"post-id": "p2"}}}}}));
        transport.push_json(json!({"flow": {"view-post": {"result": {"topic": topic_block("t9", false)}}}}));
        let mut site = mock_site(&transport);
        let board = Board::new(site.parse_title("Talk:Foo").expect("title"));
        let topic = board.new_topic(&mut site, "Subject", "Body").expect("topic");
        assert_eq!(topic.root, "t9");
        assert_eq!(transport.request(1).param("nttopic"), Some("Subject"));

        let post = topic.reply(&mut site, "First reply").expect("reply");
        assert_eq!(post.uuid, "p2");
        assert_eq!(transport.request(3).param("repreplyTo"), Some("t9"));
    }

    #[test]
    fn lock_and_moderate_update_state() {
        let transport = MockTransport::new();
        transport.push_json(json!({"flow": {"view-topic": {"result": {"topic": topic_block("t1", false)}}}}));
        transport.push_json(json!({"query": {"tokens": {"csrftoken": "t+\\"}}}));
        transport.push_json(json!({"flow": {"lock-topic": {"status": "ok"}}}));
        transport.push_json(json!({"flow": {"moderate-topic": {"status": "ok"}}}));
        let mut site = mock_site(&transport);
        let mut topic = Topic::load(&mut site, "Topic:t1").expect("topic");
        topic.lock(&mut site, "done").expect("lock");
        assert!(topic.is_locked());
        assert_eq!(transport.request(2).param("cotmoderationState"), Some("lock"));
        topic
            .moderate(&mut site, ModerationState::Hide, "spam")
            .expect("moderate");
        assert!(topic.is_moderated());
        assert_eq!(transport.request(3).param("mtmoderationState"), Some("hide"));
    }
}
