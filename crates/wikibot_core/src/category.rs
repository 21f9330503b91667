use std::collections::{BTreeSet, VecDeque};

use serde::{Deserialize, Serialize};

use crate::api::{QueryGenerator, Request};
use crate::error::{Result, WikiError};
use crate::namespace::{NS_CATEGORY, NS_FILE};
use crate::page::Page;
use crate::site::{MemberType, Site};
use crate::textlib;
use crate::title::Title;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryInfo {
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub pages: u64,
    #[serde(default)]
    pub subcats: u64,
    #[serde(default)]
    pub files: u64,
    #[serde(default)]
    pub hidden: bool,
}

#[derive(Debug, Clone)]
pub struct Category {
    page: Page,
    info: Option<CategoryInfo>,
}

impl Category {
    pub fn new(title: Title) -> Result<Self> {
        if title.namespace() != NS_CATEGORY {
            return Err(WikiError::InvalidTitle(format!("{title} is not a category")));
        }
        Ok(Self {
            page: Page::new(title),
            info: None,
        })
    }

    pub fn title(&self) -> &Title {
        self.page.title()
    }

    pub fn page_mut(&mut self) -> &mut Page {
        &mut self.page
    }

    pub fn members(
        &self,
        site: &mut Site,
        types: &[MemberType],
        namespaces: &[i32],
        limit: Option<usize>,
    ) -> Result<Vec<Title>> {
        site.category_members(self.title(), types, namespaces, limit)
    }

    pub fn articles(
        &self,
        site: &mut Site,
        namespaces: &[i32],
        limit: Option<usize>,
    ) -> Result<Vec<Title>> {
        self.members(site, &[MemberType::Page], namespaces, limit)
    }

    pub fn files(&self, site: &mut Site, limit: Option<usize>) -> Result<Vec<Title>> {
        self.members(site, &[MemberType::File], &[NS_FILE], limit)
    }

    /// Subcategories down to `depth` further levels (0 lists direct children
    /// only). Each category is reported once, so cycles terminate.
    pub fn subcategories(&self, site: &mut Site, depth: usize) -> Result<Vec<Title>> {
        let mut seen = BTreeSet::from([self.title().clone()]);
        let mut found = Vec::new();
        let mut queue = VecDeque::from([(self.title().clone(), 0usize)]);
        while let Some((current, level)) = queue.pop_front() {
            let children =
                site.category_members(&current, &[MemberType::Subcat], &[NS_CATEGORY], None)?;
            for child in children {
                if !seen.insert(child.clone()) {
                    tracing::debug!(category = %child, "category already visited");
                    continue;
                }
                if level < depth {
                    queue.push_back((child.clone(), level + 1));
                }
                found.push(child);
            }
        }
        Ok(found)
    }

    pub fn info(&mut self, site: &mut Site) -> Result<CategoryInfo> {
        if let Some(info) = self.info {
            return Ok(info);
        }
        let request = Request::query()
            .set("titles", self.title().full_title())
            .set("prop", "categoryinfo");
        let pages = QueryGenerator::pages(request, None).collect(site.api_mut())?;
        let info = pages
            .iter()
            .find_map(|page| page.get("categoryinfo"))
            .cloned()
            .map(serde_json::from_value::<CategoryInfo>)
            .transpose()?
            .unwrap_or_default();
        self.info = Some(info);
        Ok(info)
    }

    pub fn is_empty(&mut self, site: &mut Site) -> Result<bool> {
        Ok(self.info(site)?.size == 0)
    }

    pub fn is_hidden(&mut self, site: &mut Site) -> Result<bool> {
        Ok(self.info(site)?.hidden)
    }

    fn redirect_template(&mut self, site: &mut Site) -> Result<Option<textlib::Template>> {
        let names = site
            .family()
            .category_redirect_templates(site.code())
            .iter()
            .map(|name| template_key(name))
            .collect::<Vec<_>>();
        let text = match self.page.get(site, true) {
            Ok(text) => text,
            Err(WikiError::NoPage(_)) => return Ok(None),
            Err(error) => return Err(error),
        };
        Ok(textlib::extract_templates(&text)
            .into_iter()
            .find(|template| names.contains(&template_key(&template.name))))
    }

    /// Whether the page carries one of the wiki's soft category redirect
    /// templates.
    pub fn is_category_redirect(&mut self, site: &mut Site) -> Result<bool> {
        Ok(self.redirect_template(site)?.is_some())
    }

    pub fn category_redirect_target(&mut self, site: &mut Site) -> Result<Category> {
        let template = self
            .redirect_template(site)?
            .ok_or_else(|| WikiError::IsNotRedirectPage(self.title().full_title()))?;
        let target = template
            .param("1")
            .map(str::trim)
            .filter(|target| !target.is_empty())
            .ok_or_else(|| {
                WikiError::Unexpected(format!(
                    "category redirect on {} has no target",
                    self.title()
                ))
            })?;
        let target = match site.parse_title(target)? {
            title if title.namespace() == NS_CATEGORY => title,
            title => site.parse_title(&format!("Category:{}", title.full_title()))?,
        };
        if &target == self.title() {
            return Err(WikiError::CircularRedirect(target.full_title()));
        }
        Category::new(target)
    }
}

impl Site {
    /// Category by name, with or without the namespace prefix.
    pub fn category(&self, name: &str) -> Result<Category> {
        let title = self.parse_title(name)?;
        if title.namespace() == NS_CATEGORY {
            return Category::new(title);
        }
        Category::new(self.parse_title(&format!("Category:{}", title.full_title()))?)
    }
}

fn template_key(name: &str) -> String {
    let name = name.trim().replace('_', " ");
    let name = name.strip_prefix("Template:").unwrap_or(&name);
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
