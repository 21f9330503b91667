use anyhow::{Context, Result};
use serde::Serialize;

use super::{BotOptions, BotReport, PageTransform, all_members, category_title, run_bot};
use crate::category::Category;
use crate::error::{self, WikiError};
use crate::namespace::NS_CATEGORY;
use crate::page::{Page, SaveOptions};
use crate::site::{MemberType, MoveOptions, Site};
use crate::textlib;
use crate::title::Title;

pub struct CategoryAdd {
    pub category: Title,
    pub sort_key: Option<String>,
}

impl PageTransform for CategoryAdd {
    fn summary(&self) -> String {
        format!("Adding {}", self.category.as_link())
    }

    fn transform(
        &mut self,
        site: &mut Site,
        _page: &mut Page,
        text: &str,
    ) -> error::Result<Option<String>> {
        let updated = textlib::add_category(
            text,
            &self.category,
            self.sort_key.as_deref(),
            site.namespaces(),
        );
        Ok((updated != text).then_some(updated))
    }
}

pub struct CategoryRemove {
    pub category: Title,
}

impl PageTransform for CategoryRemove {
    fn summary(&self) -> String {
        format!("Removing {}", self.category.as_link())
    }

    fn transform(
        &mut self,
        site: &mut Site,
        _page: &mut Page,
        text: &str,
    ) -> error::Result<Option<String>> {
        let updated =
            textlib::replace_category_in_place(text, &self.category, None, site.namespaces());
        Ok((updated != text).then_some(updated))
    }
}

pub struct CategoryReplace {
    pub old: Title,
    pub new: Title,
}

impl PageTransform for CategoryReplace {
    fn summary(&self) -> String {
        format!(
            "Moving from {} to {}",
            self.old.as_link(),
            self.new.as_link()
        )
    }

    fn transform(
        &mut self,
        site: &mut Site,
        _page: &mut Page,
        text: &str,
    ) -> error::Result<Option<String>> {
        let updated = textlib::replace_category_in_place(
            text,
            &self.old,
            Some(&self.new),
            site.namespaces(),
        );
        Ok((updated != text).then_some(updated))
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CategoryMoveReport {
    /// The category page itself was moved.
    pub moved: bool,
    /// The description was copied because the page could not be moved.
    pub recreated: bool,
    pub redirect_left: bool,
    pub members: BotReport,
}

fn redirect_text(site: &Site, target: &Title) -> String {
    let template = site
        .family()
        .category_redirect_templates(site.code())
        .into_iter()
        .next()
        .unwrap_or_else(|| "Category redirect".to_string());
    format!("{{{{{template}|{}}}}}", target.full_title())
}

/// Moves `old` to `new`: the description page moves (or is copied when the
/// move is refused), a category redirect is left behind and every member is
/// recategorized.
pub fn move_category(
    site: &mut Site,
    old: &str,
    new: &str,
    options: &BotOptions,
) -> Result<CategoryMoveReport> {
    let old = category_title(site, old)?;
    let new = category_title(site, new)?;
    let reason = options.summary.clone().unwrap_or_else(|| {
        format!("Moving {} to {}", old.as_link(), new.as_link())
    });
    let mut report = CategoryMoveReport::default();

    let mut old_page = Page::new(old.clone());
    let mut new_page = Page::new(new.clone());
    let old_exists = old_page.exists(site)?;
    let new_exists = new_page.exists(site)?;

    if old_exists && !new_exists {
        if options.dry_run {
            tracing::info!(from = %old, to = %new, "dry run, not moving category page");
        } else {
            let move_options = MoveOptions {
                move_talk: true,
                no_redirect: true,
                ..MoveOptions::default()
            };
            match old_page.move_to(site, &new, &reason, &move_options) {
                Ok(_) => report.moved = true,
                Err(WikiError::PermissionDenied(info)) => {
                    tracing::warn!(%info, "cannot move category page, copying its text");
                    let text = old_page.text(site)?;
                    new_page
                        .save(site, &text, &reason, &SaveOptions::default())
                        .with_context(|| format!("failed to create [[{new}]]"))?;
                    report.recreated = true;
                }
                Err(error) => {
                    return Err(error).with_context(|| format!("failed to move [[{old}]]"));
                }
            }
        }
    }

    let redirect = redirect_text(site, &new);
    if options.dry_run {
        tracing::info!(title = %old, text = redirect.as_str(), "dry run, not leaving redirect");
    } else {
        let mut redirect_page = Page::new(old.clone());
        redirect_page
            .save(
                site,
                &redirect,
                &reason,
                &SaveOptions {
                    force: true,
                    ..SaveOptions::default()
                },
            )
            .with_context(|| format!("failed to leave a redirect on [[{old}]]"))?;
        report.redirect_left = true;
    }

    let members = all_members(site, &old)?;
    let mut replace = CategoryReplace { old, new };
    let member_options = BotOptions {
        summary: Some(reason),
        ..options.clone()
    };
    report.members = run_bot(site, &members, &mut replace, &member_options)?;
    Ok(report)
}

/// Bulleted wikitext list of a category's members, saved to `target` unless
/// this is a dry run.
pub fn listify_category(
    site: &mut Site,
    category: &str,
    target: Option<&str>,
    include_subcategories: bool,
    options: &BotOptions,
) -> Result<String> {
    let category = site.category(category)?;
    let mut types = vec![MemberType::Page, MemberType::File];
    if include_subcategories {
        types.push(MemberType::Subcat);
    }
    let members = category.members(site, &types, &[], options.limit)?;
    let list = members
        .iter()
        .map(|title| format!("* {}", title.as_link()))
        .collect::<Vec<_>>()
        .join("\n");

    if let Some(target) = target {
        let target = site.parse_title(target)?;
        if options.dry_run {
            tracing::info!(title = %target, items = members.len(), "dry run, not saving list");
        } else {
            let summary = options.summary.clone().unwrap_or_else(|| {
                format!("Listing members of {}", category.title().as_link())
            });
            Page::new(target.clone())
                .save(
                    site,
                    &list,
                    &summary,
                    &SaveOptions {
                        minor: options.minor,
                        force: true,
                        ..SaveOptions::default()
                    },
                )
                .with_context(|| format!("failed to save list to [[{target}]]"))?;
        }
    }
    Ok(list)
}

#[derive(Debug, Clone, Serialize)]
pub struct RedirectFix {
    pub from: String,
    pub to: String,
    pub members: BotReport,
}

/// Moves the members of every soft-redirected category to its target.
pub fn fix_category_redirects(site: &mut Site, options: &BotOptions) -> Result<Vec<RedirectFix>> {
    let templates = site.family().category_redirect_templates(site.code());
    let mut redirected = Vec::new();
    for template in templates {
        let template = site.parse_title(&format!("Template:{template}"))?;
        for title in site.embedded_in(&template, &[NS_CATEGORY], None)? {
            if !redirected.contains(&title) {
                redirected.push(title);
            }
        }
    }

    let mut fixes = Vec::new();
    for title in redirected {
        let mut category = Category::new(title.clone())?;
        let target = match category.category_redirect_target(site) {
            Ok(target) => target,
            Err(
                error @ (WikiError::CircularRedirect(_)
                | WikiError::IsNotRedirectPage(_)
                | WikiError::InvalidTitle(_)
                | WikiError::Unexpected(_)),
            ) => {
                tracing::warn!(category = %title, %error, "skipping category redirect");
                continue;
            }
            Err(error) => return Err(error.into()),
        };
        let members = all_members(site, &title)?;
        if members.is_empty() {
            tracing::debug!(category = %title, "redirected category is empty");
            continue;
        }
        let mut replace = CategoryReplace {
            old: title.clone(),
            new: target.title().clone(),
        };
        let report = run_bot(site, &members, &mut replace, options)?;
        fixes.push(RedirectFix {
            from: title.full_title(),
            to: target.title().full_title(),
            members: report,
        });
    }
    Ok(fixes)
}

#[cfg(test)]
mod tests {
    use serde_json::{Value, json};

    use super::*;
    use crate::bot::PageStatus;
    use crate::testing::{MockTransport, mock_site};

    fn page(title: &str, ns: i32, text: &str) -> Value {
        json!({"curtimestamp": "2026-01-01T00:00:00Z", "query": {"pages": [{
            "pageid": 3, "ns": ns, "title": title,
            "revisions": [{"revid": 9, "timestamp": "2025-01-01T00:00:00Z",
                "slots": {"main": {"content": text}}}]
        }]}})
    }

    fn missing(title: &str, ns: i32) -> Value {
        json!({"curtimestamp": "2026-01-01T00:00:00Z",
            "query": {"pages": [{"ns": ns, "title": title, "missing": true}]}})
    }

    #[test]
    fn replace_transform_keeps_sort_key() {
        let transport = MockTransport::new();
        let mut site = mock_site(&transport);
        let mut replace = CategoryReplace {
            old: site.parse_title("Category:Old").expect("title"),
            new: site.parse_title("Category:New").expect("title"),
        };
        let mut page = site.page("Alpha").expect("page");
        let updated = replace
            .transform(&mut site, &mut page, "Text\n[[Category:Old|Key]]")
            .expect("transform");
        assert_eq!(updated.as_deref(), Some("Text\n[[Category:New|Key]]"));
        let unchanged = replace
            .transform(&mut site, &mut page, "Text")
            .expect("transform");
        assert_eq!(unchanged, None);
        assert_eq!(replace.summary(), "Moving from [[:Category:Old]] to [[:Category:New]]");
    }

    #[test]
    fn add_and_remove_transforms() {
        let transport = MockTransport::new();
        let mut site = mock_site(&transport);
        let mut page = site.page("Alpha").expect("page");
        let mut add = CategoryAdd {
            category: site.parse_title("Category:Extra").expect("title"),
            sort_key: None,
        };
        let added = add
            .transform(&mut site, &mut page, "Body\n\n[[Category:First]]")
            .expect("add")
            .expect("changed");
        assert_eq!(added, "Body\n\n[[Category:First]]\n[[Category:Extra]]");

        let mut remove = CategoryRemove {
            category: site.parse_title("Category:First").expect("title"),
        };
        let removed = remove
            .transform(&mut site, &mut page, &added)
            .expect("remove")
            .expect("changed");
        assert_eq!(removed, "Body\n\n[[Category:Extra]]");
    }

    #[test]
    fn dry_run_move_touches_nothing() {
        let transport = MockTransport::new();
        transport.push_json(page("Category:Old", 14, "Old description"));
        transport.push_json(missing("Category:New", 14));
        transport.push_json(json!({"query": {"categorymembers": [{"ns": 0, "title": "Alpha"}]}}));
        transport.push_json(page("Alpha", 0, "Alpha text\n[[Category:Old]]"));
        let mut site = mock_site(&transport);
        let options = BotOptions {
            dry_run: true,
            ..BotOptions::default()
        };
        let report = move_category(&mut site, "Old", "Category:New", &options).expect("move");
        assert!(!report.moved);
        assert!(!report.redirect_left);
        assert_eq!(report.members.outcomes[0].status, PageStatus::WouldSave);
        assert!(
            report.members.outcomes[0]
                .diff
                .as_deref()
                .is_some_and(|diff| diff.contains("+[[Category:New]]"))
        );
        assert_eq!(transport.remaining(), 0);
    }

    #[test]
    fn move_falls_back_to_copy() {
        let transport = MockTransport::new();
        transport.push_json(page("Category:Old", 14, "Old description"));
        transport.push_json(missing("Category:New", 14));
        transport.push_json(json!({"query": {"tokens": {"csrftoken": "t+\\"}}}));
        transport.push_json(json!({"error": {"code": "cantmove", "info": "no move right"}}));
        transport.push_json(page("Category:Old", 14, "Old description"));
        transport.push_json(json!({"edit": {"result": "Success", "title": "Category:New", "newrevid": 20}}));
        transport.push_json(page("Category:Old", 14, "Old description"));
        transport.push_json(json!({"edit": {"result": "Success", "title": "Category:Old", "newrevid": 21}}));
        transport.push_json(json!({"query": {"categorymembers": []}}));
        let mut site = mock_site(&transport);
        let report = move_category(&mut site, "Old", "New", &BotOptions::default()).expect("move");
        assert!(report.recreated);
        assert!(report.redirect_left);
        assert_eq!(transport.request(5).param("createonly"), Some("1"));
        assert_eq!(transport.request(5).param("text"), Some("Old description"));
        assert_eq!(
            transport.request(7).param("text"),
            Some("{{Category redirect|Category:New}}")
        );
    }

    #[test]
    fn listify_builds_bullets() {
        let transport = MockTransport::new();
        transport.push_json(json!({"query": {"categorymembers": [
            {"ns": 0, "title": "Alpha"}, {"ns": 14, "title": "Category:Sub"}]}}));
        let mut site = mock_site(&transport);
        let options = BotOptions {
            dry_run: true,
            ..BotOptions::default()
        };
        let list = listify_category(&mut site, "Things", Some("List of things"), true, &options)
            .expect("list");
        assert_eq!(list, "* [[Alpha]]\n* [[:Category:Sub]]");
        assert_eq!(transport.request(0).param("cmtype"), Some("page|file|subcat"));
    }
}
