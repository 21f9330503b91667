use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const NS_MEDIA: i32 = -2;
pub const NS_SPECIAL: i32 = -1;
pub const NS_MAIN: i32 = 0;
pub const NS_TALK: i32 = 1;
pub const NS_USER: i32 = 2;
pub const NS_USER_TALK: i32 = 3;
pub const NS_PROJECT: i32 = 4;
pub const NS_PROJECT_TALK: i32 = 5;
pub const NS_FILE: i32 = 6;
pub const NS_FILE_TALK: i32 = 7;
pub const NS_MEDIAWIKI: i32 = 8;
pub const NS_MEDIAWIKI_TALK: i32 = 9;
pub const NS_TEMPLATE: i32 = 10;
pub const NS_TEMPLATE_TALK: i32 = 11;
pub const NS_HELP: i32 = 12;
pub const NS_HELP_TALK: i32 = 13;
pub const NS_CATEGORY: i32 = 14;
pub const NS_CATEGORY_TALK: i32 = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CaseMode {
    FirstLetter,
    CaseSensitive,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Namespace {
    pub id: i32,
    pub canonical: String,
    pub name: String,
    pub aliases: Vec<String>,
    pub case: CaseMode,
    pub content: bool,
    pub subpages: bool,
}

impl Namespace {
    fn new(id: i32, name: &str) -> Self {
        Self {
            id,
            canonical: name.to_string(),
            name: name.to_string(),
            aliases: Vec::new(),
            case: CaseMode::FirstLetter,
            content: id == NS_MAIN,
            subpages: (id > NS_MAIN && id % 2 == 1) || id == NS_USER,
        }
    }

    pub fn is_talk(&self) -> bool {
        self.id > NS_MAIN && self.id % 2 == 1
    }

    /// Every name this namespace answers to.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.name.as_str())
            .chain(std::iter::once(self.canonical.as_str()))
            .chain(self.aliases.iter().map(String::as_str))
            .filter(|name| !name.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamespaceMap {
    by_id: BTreeMap<i32, Namespace>,
}

impl Default for NamespaceMap {
    fn default() -> Self {
        Self::builtin()
    }
}

impl NamespaceMap {
    /// The standard namespaces every MediaWiki install has, with English names.
    pub fn builtin() -> Self {
        let names = [
            (NS_MEDIA, "Media"),
            (NS_SPECIAL, "Special"),
            (NS_MAIN, ""),
            (NS_TALK, "Talk"),
            (NS_USER, "User"),
            (NS_USER_TALK, "User talk"),
            (NS_PROJECT, "Project"),
            (NS_PROJECT_TALK, "Project talk"),
            (NS_FILE, "File"),
            (NS_FILE_TALK, "File talk"),
            (NS_MEDIAWIKI, "MediaWiki"),
            (NS_MEDIAWIKI_TALK, "MediaWiki talk"),
            (NS_TEMPLATE, "Template"),
            (NS_TEMPLATE_TALK, "Template talk"),
            (NS_HELP, "Help"),
            (NS_HELP_TALK, "Help talk"),
            (NS_CATEGORY, "Category"),
            (NS_CATEGORY_TALK, "Category talk"),
        ];
        let mut by_id = BTreeMap::new();
        for (id, name) in names {
            let mut namespace = Namespace::new(id, name);
            match id {
                NS_FILE => namespace.aliases.push("Image".to_string()),
                NS_FILE_TALK => namespace.aliases.push("Image talk".to_string()),
                _ => {}
            }
            by_id.insert(id, namespace);
        }
        Self { by_id }
    }

    /// Build from a formatversion=2 `siteinfo` payload (`query` object).
    pub fn from_siteinfo(query: &Value) -> Option<Self> {
        let namespaces = query.get("namespaces")?.as_object()?;
        let mut by_id = BTreeMap::new();
        for entry in namespaces.values() {
            let parsed: SiteinfoNamespace = match serde_json::from_value(entry.clone()) {
                Ok(parsed) => parsed,
                Err(_) => continue,
            };
            let canonical = parsed.canonical.unwrap_or_else(|| parsed.name.clone());
            by_id.insert(
                parsed.id,
                Namespace {
                    id: parsed.id,
                    canonical,
                    name: parsed.name,
                    aliases: Vec::new(),
                    case: if parsed.case.as_deref() == Some("case-sensitive") {
                        CaseMode::CaseSensitive
                    } else {
                        CaseMode::FirstLetter
                    },
                    content: parsed.content,
                    subpages: parsed.subpages,
                },
            );
        }
        if let Some(aliases) = query.get("namespacealiases").and_then(Value::as_array) {
            for alias in aliases {
                let id = alias.get("id").and_then(Value::as_i64);
                let name = alias.get("alias").and_then(Value::as_str);
                if let (Some(id), Some(name)) = (id, name)
                    && let Some(namespace) = i32::try_from(id).ok().and_then(|id| by_id.get_mut(&id))
                    && !namespace.aliases.iter().any(|existing| existing == name)
                {
                    namespace.aliases.push(name.to_string());
                }
            }
        }
        if by_id.is_empty() {
            return None;
        }
        Some(Self { by_id })
    }

    pub fn get(&self, id: i32) -> Option<&Namespace> {
        self.by_id.get(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Namespace> {
        self.by_id.values()
    }

    /// Resolve a title prefix (`"category"`, `"User_talk"`, an alias) to its namespace.
    pub fn lookup(&self, prefix: &str) -> Option<&Namespace> {
        let wanted = normalize_name(prefix);
        if wanted.is_empty() {
            return None;
        }
        self.by_id.values().find(|namespace| {
            namespace
                .names()
                .any(|name| normalize_name(name) == wanted)
        })
    }

    pub fn category_prefixes(&self) -> Vec<String> {
        self.prefixes_for(NS_CATEGORY)
    }

    pub fn file_prefixes(&self) -> Vec<String> {
        self.prefixes_for(NS_FILE)
    }

    fn prefixes_for(&self, id: i32) -> Vec<String> {
        let mut prefixes = Vec::new();
        if let Some(namespace) = self.get(id) {
            for name in namespace.names() {
                if !prefixes.iter().any(|existing: &String| existing == name) {
                    prefixes.push(name.to_string());
                }
            }
        }
        prefixes
    }
}

fn normalize_name(value: &str) -> String {
    value
        .trim()
        .replace('_', " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

#[derive(Debug, Deserialize)]
struct SiteinfoNamespace {
    id: i32,
    #[serde(default)]
    name: String,
    canonical: Option<String>,
    case: Option<String>,
    #[serde(default)]
    content: bool,
    #[serde(default)]
    subpages: bool,
}
