use regex::Regex;

use super::PageTransform;
use crate::error::{Result, WikiError};
use crate::page::Page;
use crate::site::Site;
use crate::textlib::{self, Position};
use crate::title::Title;

/// Adds a fixed piece of wikitext to each page.
pub struct AddText {
    pub text: String,
    pub position: Position,
    /// Pages whose text matches are left alone.
    pub skip_if: Option<Regex>,
    /// Edit the talk page of each title instead, creating it if needed.
    pub talk_page: bool,
}

impl AddText {
    pub fn new(text: &str) -> Self {
        Self {
            text: text.to_string(),
            position: Position::default(),
            skip_if: None,
            talk_page: false,
        }
    }

    /// The pages this transform edits for `titles`.
    pub fn target_titles(&self, site: &Site, titles: &[Title]) -> Result<Vec<Title>> {
        if !self.talk_page {
            return Ok(titles.to_vec());
        }
        titles
            .iter()
            .map(|title| {
                if title.is_talk() {
                    return Ok(title.clone());
                }
                title.talk_page(site.namespaces()).ok_or_else(|| {
                    WikiError::InvalidTitle(format!("{title} has no talk page"))
                })
            })
            .collect()
    }
}

impl PageTransform for AddText {
    fn summary(&self) -> String {
        let preview = self.text.chars().take(60).collect::<String>();
        format!("Adding text: {}", preview.replace('\n', " "))
    }

    fn transform(&mut self, site: &mut Site, page: &mut Page, text: &str) -> Result<Option<String>> {
        let addition = self.text.trim_matches('\n');
        if !addition.is_empty() && text.contains(addition) {
            tracing::debug!(title = %page.title(), "text already present");
            return Ok(None);
        }
        if let Some(skip) = &self.skip_if
            && skip.is_match(text)
        {
            tracing::info!(title = %page.title(), pattern = skip.as_str(), "skip pattern matched");
            return Ok(None);
        }
        Ok(Some(textlib::add_text(
            text,
            addition,
            self.position,
            site.namespaces(),
        )))
    }

    fn create_missing(&self) -> bool {
        self.talk_page
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::bot::{BotOptions, PageStatus, run_bot};
    use crate::testing::{MockTransport, mock_site};

    #[test]
    fn skips_present_text_and_skip_pattern() {
        let transport = MockTransport::new();
        let mut site = mock_site(&transport);
        let mut page = site.page("Alpha").expect("page");
        let mut add = AddText::new("{{Stub}}");
        assert_eq!(
            add.transform(&mut site, &mut page, "Body {{Stub}}").expect("transform"),
            None
        );
        add.skip_if = Some(Regex::new(r"(?i)\{\{\s*disambig").expect("regex"));
        assert_eq!(
            add.transform(&mut site, &mut page, "{{Disambig}}").expect("transform"),
            None
        );
        assert_eq!(
            add.transform(&mut site, &mut page, "Body\n\n[[Category:X]]")
                .expect("transform")
                .as_deref(),
            Some("Body\n{{Stub}}\n\n[[Category:X]]")
        );
    }

    #[test]
    fn talk_page_mode_creates_missing_pages() {
        let transport = MockTransport::new();
        transport.push_json(json!({"curtimestamp": "2026-01-01T00:00:00Z",
            "query": {"pages": [{"ns": 1, "title": "Talk:Alpha", "missing": true}]}}));
        transport.push_json(json!({"query": {"tokens": {"csrftoken": "t+\\"}}}));
        transport.push_json(json!({"edit": {"result": "Success", "title": "Talk:Alpha", "newrevid": 2}}));
        let mut site = mock_site(&transport);
        let mut add = AddText::new("{{WikiProject Example}}");
        add.position = Position::Top;
        add.talk_page = true;
        let subjects = vec![site.parse_title("Alpha").expect("title")];
        let titles = add.target_titles(&site, &subjects).expect("talk pages");
        assert_eq!(titles[0].full_title(), "Talk:Alpha");

        let report = run_bot(&mut site, &titles, &mut add, &BotOptions::default()).expect("run");
        assert_eq!(report.outcomes[0].status, PageStatus::Saved { revid: Some(2) });
        let edit = transport.request(2);
        assert_eq!(edit.param("text"), Some("{{WikiProject Example}}"));
        assert_eq!(edit.param("createonly"), Some("1"));
    }
}
