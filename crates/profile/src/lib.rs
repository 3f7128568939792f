//! Profile (JSON configuration bundle) access.
//!
//! A profile declares the layers of a map deployment, their clustering and
//! zoom rules, the searchable fields and a few engine settings. Components
//! receive a [`ProfileProvider`] instead of reaching into a global.

pub mod layer;
pub mod search;
pub mod settings;

use std::fs;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde_json::Value;

pub use layer::*;
pub use search::*;
pub use settings::*;

#[derive(Debug, thiserror::Error)]
pub enum ProfileError {
    #[error("failed to read profile {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("profile is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid profile section `{name}`: {message}")]
    Section { name: String, message: String },
}

/// Synchronous read access to parsed profile JSON.
pub trait ProfileProvider {
    /// Walks a dot-separated path (`"search.searchFields"`). Array elements
    /// are addressed by index (`"layers.0.id"`).
    fn get(&self, path: &str) -> Option<&Value>;

    /// Top-level subtree.
    fn get_section(&self, name: &str) -> Option<&Value>;
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Profile {
    root: Value,
}

impl Profile {
    pub fn from_value(root: Value) -> Self {
        Self { root }
    }

    pub fn from_json_str(text: &str) -> Result<Self, ProfileError> {
        Ok(Self::from_value(serde_json::from_str(text)?))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ProfileError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ProfileError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let profile = Self::from_json_str(&text)?;
        tracing::info!("loaded profile {}", path.display());
        Ok(profile)
    }

    pub fn root(&self) -> &Value {
        &self.root
    }

    /// Deserializes the value at `path`, or `T::default()` when absent.
    pub fn typed<T: DeserializeOwned + Default>(&self, path: &str) -> Result<T, ProfileError> {
        match self.get(path) {
            None | Some(Value::Null) => Ok(T::default()),
            Some(v) => serde_json::from_value(v.clone()).map_err(|e| ProfileError::Section {
                name: path.to_string(),
                message: e.to_string(),
            }),
        }
    }
}

impl ProfileProvider for Profile {
    fn get(&self, path: &str) -> Option<&Value> {
        lookup_path(&self.root, path)
    }

    fn get_section(&self, name: &str) -> Option<&Value> {
        self.root.get(name)
    }
}

/// Dot-path lookup; numeric segments index into arrays.
pub fn lookup_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(root);
    }
    let mut cur = root;
    for segment in path.split('.') {
        cur = match cur {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(cur)
}
