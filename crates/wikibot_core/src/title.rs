use std::fmt;

use serde::Serialize;

use crate::error::{Result, WikiError};
use crate::namespace::{CaseMode, NS_CATEGORY, NS_FILE, NS_MAIN, NamespaceMap};

const ILLEGAL_TITLE_CHARS: &[char] = &['<', '>', '[', ']', '{', '}', '|'];

/// A normalized page title: namespace id, the local prefix used to display
/// it, and the text after the prefix.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Title {
    namespace: i32,
    prefix: String,
    text: String,
    fragment: Option<String>,
}

impl Title {
    /// Build a title from already-normalized parts.
    pub fn new(namespace: i32, prefix: &str, text: &str) -> Self {
        Self {
            namespace,
            prefix: prefix.to_string(),
            text: text.to_string(),
            fragment: None,
        }
    }

    pub fn parse(raw: &str, namespaces: &NamespaceMap) -> Result<Self> {
        let mut value = collapse_whitespace(&raw.replace('_', " "));
        if let Some(stripped) = value.strip_prefix(':') {
            value = stripped.trim_start().to_string();
        }

        let mut fragment = None;
        if let Some((head, tail)) = value.split_once('#') {
            let tail = tail.trim();
            if !tail.is_empty() {
                fragment = Some(tail.to_string());
            }
            value = head.trim_end().to_string();
        }

        let mut namespace = NS_MAIN;
        let mut prefix = String::new();
        let mut case = namespaces
            .get(NS_MAIN)
            .map(|ns| ns.case)
            .unwrap_or(CaseMode::FirstLetter);
        if let Some((head, tail)) = value.split_once(':')
            && let Some(found) = namespaces.lookup(head)
        {
            namespace = found.id;
            prefix = found.name.clone();
            case = found.case;
            value = tail.trim_start().to_string();
        }

        if value.is_empty() {
            return Err(WikiError::InvalidTitle(raw.to_string()));
        }
        if value.contains(ILLEGAL_TITLE_CHARS) || value.contains("~~~") {
            return Err(WikiError::InvalidTitle(raw.to_string()));
        }
        if value.chars().any(char::is_control) {
            return Err(WikiError::InvalidTitle(raw.to_string()));
        }

        if case == CaseMode::FirstLetter {
            value = uppercase_first(&value);
        }

        Ok(Self {
            namespace,
            prefix,
            text: value,
            fragment,
        })
    }

    pub fn namespace(&self) -> i32 {
        self.namespace
    }

    /// Title without its namespace prefix.
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn fragment(&self) -> Option<&str> {
        self.fragment.as_deref()
    }

    pub fn full_title(&self) -> String {
        if self.prefix.is_empty() {
            self.text.clone()
        } else {
            format!("{}:{}", self.prefix, self.text)
        }
    }

    pub fn with_fragment(mut self, fragment: Option<&str>) -> Self {
        self.fragment = fragment.map(ToString::to_string);
        self
    }

    pub fn without_fragment(&self) -> Self {
        Self {
            fragment: None,
            ..self.clone()
        }
    }

    pub fn is_talk(&self) -> bool {
        self.namespace > NS_MAIN && self.namespace % 2 == 1
    }

    pub fn talk_page(&self, namespaces: &NamespaceMap) -> Option<Self> {
        if self.namespace < NS_MAIN {
            return None;
        }
        if self.is_talk() {
            return Some(self.without_fragment());
        }
        self.moved_to_namespace(self.namespace + 1, namespaces)
    }

    pub fn subject_page(&self, namespaces: &NamespaceMap) -> Option<Self> {
        if self.namespace < NS_MAIN {
            return None;
        }
        if !self.is_talk() {
            return Some(self.without_fragment());
        }
        self.moved_to_namespace(self.namespace - 1, namespaces)
    }

    fn moved_to_namespace(&self, namespace: i32, namespaces: &NamespaceMap) -> Option<Self> {
        let target = namespaces.get(namespace)?;
        Some(Self {
            namespace,
            prefix: target.name.clone(),
            text: self.text.clone(),
            fragment: None,
        })
    }

    /// Wikitext link to this title. Category and file links get a leading
    /// colon so they render as links instead of tagging the page.
    pub fn as_link(&self) -> String {
        let mut target = self.full_title();
        if let Some(fragment) = &self.fragment {
            target.push('#');
            target.push_str(fragment);
        }
        if matches!(self.namespace, NS_CATEGORY | NS_FILE) {
            format!("[[:{target}]]")
        } else {
            format!("[[{target}]]")
        }
    }

    /// The underscored form used in URLs.
    pub fn url_fragment(&self) -> String {
        self.full_title().replace(' ', "_")
    }
}

impl fmt::Display for Title {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.full_title())
    }
}

fn collapse_whitespace(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn uppercase_first(value: &str) -> String {
    let mut chars = value.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::namespace::{NS_CATEGORY_TALK, NS_TALK, NS_USER};

    fn ns() -> NamespaceMap {
        NamespaceMap::builtin()
    }

    #[test]
    fn parse_normalizes_spacing_and_case() {
        let title = Title::parse("  foo_bar   baz ", &ns()).expect("title");
        assert_eq!(title.full_title(), "Foo bar baz");
        assert_eq!(title.namespace(), NS_MAIN);
    }

    #[test]
    fn parse_resolves_namespace_prefixes() {
        let title = Title::parse("category:living_people", &ns()).expect("title");
        assert_eq!(title.namespace(), NS_CATEGORY);
        assert_eq!(title.text(), "Living people");
        assert_eq!(title.full_title(), "Category:Living people");

        let title = Title::parse("Image:Example.jpg", &ns()).expect("title");
        assert_eq!(title.full_title(), "File:Example.jpg");
    }

    #[test]
    fn unknown_prefix_stays_in_main_namespace() {
        let title = Title::parse("Star Wars: Episode IV", &ns()).expect("title");
        assert_eq!(title.namespace(), NS_MAIN);
        assert_eq!(title.text(), "Star Wars: Episode IV");
    }

    #[test]
    fn parse_splits_fragment_and_leading_colon() {
        let title = Title::parse(":Category:Foo#History", &ns()).expect("title");
        assert_eq!(title.namespace(), NS_CATEGORY);
        assert_eq!(title.fragment(), Some("History"));
        assert_eq!(title.as_link(), "[[:Category:Foo#History]]");
    }

    #[test]
    fn parse_rejects_invalid_titles() {
        for raw in ["", "  ", "Foo|Bar", "A[b]", "Sig ~~~", "Category:", "#only"] {
            assert!(
                matches!(Title::parse(raw, &ns()), Err(WikiError::InvalidTitle(_))),
                "expected invalid: {raw:?}"
            );
        }
    }

    #[test]
    fn talk_and_subject_pages_swap_namespace() {
        let map = ns();
        let title = Title::parse("Category:Foo", &map).expect("title");
        let talk = title.talk_page(&map).expect("talk");
        assert_eq!(talk.namespace(), NS_CATEGORY_TALK);
        assert_eq!(talk.full_title(), "Category talk:Foo");
        assert_eq!(talk.subject_page(&map), Some(title.clone()));

        let article = Title::parse("Foo", &map).expect("title");
        assert_eq!(article.talk_page(&map).map(|t| t.namespace()), Some(NS_TALK));

        let special = Title::parse("Special:Random", &map).expect("title");
        assert!(special.talk_page(&map).is_none());
    }

    #[test]
    fn url_fragment_uses_underscores() {
        let title = Title::parse("User:Some body", &ns()).expect("title");
        assert_eq!(title.namespace(), NS_USER);
        assert_eq!(title.url_fragment(), "User:Some_body");
    }
}
