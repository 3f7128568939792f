use serde::Deserialize;
use serde_json::Value;

use crate::{Profile, ProfileProvider};

/// Fields searched when the profile declares nothing.
pub const DEFAULT_SEARCH_FIELDS: [&str; 3] = ["title", "label", "name"];

#[derive(Debug, Deserialize)]
struct LayoutField {
    field: Option<String>,
    #[serde(default)]
    search: bool,
}

/// Where the searchable field list came from.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SearchFieldSource {
    Layout,
    Declared,
    Default,
}

/// Resolves the searchable property paths, first match wins:
/// 1. layout entries flagged `search: true` (`panels.detail.layout`, then `layout`),
/// 2. `search.searchFields` (or a top-level `searchFields`),
/// 3. [`DEFAULT_SEARCH_FIELDS`].
pub fn resolve_search_fields(profile: &impl ProfileProvider) -> (SearchFieldSource, Vec<String>) {
    for path in ["panels.detail.layout", "layout"] {
        let fields = layout_search_fields(profile.get(path));
        if !fields.is_empty() {
            return (SearchFieldSource::Layout, fields);
        }
    }

    for path in ["search.searchFields", "searchFields"] {
        let fields = string_list(profile.get(path));
        if !fields.is_empty() {
            return (SearchFieldSource::Declared, fields);
        }
    }

    (
        SearchFieldSource::Default,
        DEFAULT_SEARCH_FIELDS.iter().map(|s| s.to_string()).collect(),
    )
}

fn layout_search_fields(layout: Option<&Value>) -> Vec<String> {
    let Some(Value::Array(entries)) = layout else {
        return Vec::new();
    };
    entries
        .iter()
        .filter_map(|entry| serde_json::from_value::<LayoutField>(entry.clone()).ok())
        .filter(|entry| entry.search)
        .filter_map(|entry| entry.field)
        .filter(|field| !field.trim().is_empty())
        .collect()
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    let Some(Value::Array(items)) = value else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(Value::as_str)
        .filter(|s| !s.trim().is_empty())
        .map(str::to_string)
        .collect()
}

impl Profile {
    pub fn search_fields(&self) -> Vec<String> {
        resolve_search_fields(self).1
    }
}
