use serde::{Deserialize, Serialize};

use crate::{Profile, ProfileError};

/// Global POI clustering defaults (`poi` section).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PoiSettings {
    pub clustering: bool,
    pub shared_cluster: bool,
    pub shared_cluster_key: String,
}

impl Default for PoiSettings {
    fn default() -> Self {
        Self {
            clustering: true,
            shared_cluster: true,
            shared_cluster_key: "poi".to_string(),
        }
    }
}

/// Engine tuning (`engine` section).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineSettings {
    pub reconcile_window_ms: u64,
    /// Recent events kept for batch readers of the event log.
    pub event_log_limit: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            reconcile_window_ms: 250,
            event_log_limit: 256,
        }
    }
}

/// Column list for the feature table (`table` section).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TableSettings {
    pub columns: Vec<String>,
}

impl Default for TableSettings {
    fn default() -> Self {
        Self {
            columns: vec!["title".to_string(), "name".to_string()],
        }
    }
}

impl Profile {
    pub fn poi_settings(&self) -> Result<PoiSettings, ProfileError> {
        self.typed("poi")
    }

    pub fn engine_settings(&self) -> Result<EngineSettings, ProfileError> {
        self.typed("engine")
    }

    pub fn table_settings(&self) -> Result<TableSettings, ProfileError> {
        self.typed("table")
    }
}

#[cfg(test)]
mod tests {
    use crate::Profile;
    use serde_json::json;

    #[test]
    fn sections_default_when_absent() {
        let p = Profile::default();
        let poi = p.poi_settings().unwrap();
        assert!(poi.clustering);
        assert_eq!(poi.shared_cluster_key, "poi");
        assert_eq!(p.engine_settings().unwrap().reconcile_window_ms, 250);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let p = Profile::from_value(json!({
            "poi": { "sharedCluster": false },
            "engine": { "reconcileWindowMs": 40 }
        }));
        let poi = p.poi_settings().unwrap();
        assert!(poi.clustering);
        assert!(!poi.shared_cluster);
        let engine = p.engine_settings().unwrap();
        assert_eq!(engine.reconcile_window_ms, 40);
        assert_eq!(engine.event_log_limit, 256);
    }
}
