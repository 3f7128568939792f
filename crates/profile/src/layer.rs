use foundation::{GeometryType, LayerId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Profile, ProfileError};

/// Per-layer clustering override. Unset fields inherit the profile's POI
/// settings (see [`crate::PoiSettings`]).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClusteringConfig {
    pub enabled: Option<bool>,
    /// `true` joins the shared POI cluster pool, `false` gets a private group.
    pub shared: Option<bool>,
}

/// Inclusive zoom range in which a layer is drawn. Missing bounds are open.
#[derive(Debug, Copy, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ZoomThresholds {
    pub min: Option<f64>,
    pub max: Option<f64>,
}

impl ZoomThresholds {
    pub fn new(min: Option<f64>, max: Option<f64>) -> Self {
        Self { min, max }
    }

    pub fn is_bounded(&self) -> bool {
        self.min.is_some() || self.max.is_some()
    }

    pub fn contains(&self, zoom: f64) -> bool {
        self.min.is_none_or(|min| zoom >= min) && self.max.is_none_or(|max| zoom <= max)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SearchConfig {
    /// `false` exempts the layer from filtering: its features always pass.
    pub enabled: bool,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// Behavior switches of a layer. Immutable once the layer is registered,
/// except for `style`, which theme application may replace.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LayerConfig {
    pub clustering: ClusteringConfig,
    #[serde(alias = "zoomThresholds")]
    pub zoom: Option<ZoomThresholds>,
    pub search: SearchConfig,
    pub style: Option<Value>,
}

impl LayerConfig {
    pub fn is_filter_exempt(&self) -> bool {
        !self.search.enabled
    }
}

/// A layer as the profile declares it, before any data is loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LayerDeclaration {
    pub id: LayerId,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default = "default_geometry")]
    pub geometry: GeometryType,
    /// Loaded on first `show()` rather than up front.
    #[serde(default)]
    pub lazy: bool,
    #[serde(flatten)]
    pub config: LayerConfig,
}

fn default_geometry() -> GeometryType {
    GeometryType::Mixed
}

impl LayerDeclaration {
    pub fn new(id: impl Into<LayerId>, geometry: GeometryType) -> Self {
        Self {
            id: id.into(),
            label: None,
            geometry,
            lazy: false,
            config: LayerConfig::default(),
        }
    }

    pub fn with_config(mut self, config: LayerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn lazy(mut self) -> Self {
        self.lazy = true;
        self
    }

    pub fn display_label(&self) -> &str {
        self.label.as_deref().unwrap_or(self.id.as_str())
    }
}

impl Profile {
    /// The `layers` section. Absent means no declared layers.
    pub fn layer_declarations(&self) -> Result<Vec<LayerDeclaration>, ProfileError> {
        self.typed("layers")
    }
}

#[cfg(test)]
mod tests {
    use super::{LayerDeclaration, ZoomThresholds};
    use crate::Profile;
    use foundation::GeometryType;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn zoom_thresholds_are_inclusive_and_open_ended() {
        let z = ZoomThresholds::new(Some(10.0), Some(14.0));
        assert!(z.contains(10.0));
        assert!(z.contains(14.0));
        assert!(!z.contains(9.5));
        assert!(!z.contains(15.0));
        assert!(ZoomThresholds::new(None, Some(3.0)).contains(-1.0));
        assert!(!ZoomThresholds::default().is_bounded());
    }

    #[test]
    fn parses_declarations_with_defaults() {
        let p = Profile::from_value(json!({
            "layers": [
                {
                    "id": "parks",
                    "label": "Parks",
                    "geometry": "poi",
                    "clustering": { "shared": false },
                    "zoomThresholds": { "min": 12 },
                    "search": { "enabled": false }
                },
                { "id": "trails", "geometry": "route", "lazy": true }
            ]
        }));
        let decls = p.layer_declarations().unwrap();
        assert_eq!(decls.len(), 2);

        let parks = &decls[0];
        assert_eq!(parks.geometry, GeometryType::Point);
        assert_eq!(parks.config.clustering.shared, Some(false));
        assert_eq!(parks.config.zoom, Some(ZoomThresholds::new(Some(12.0), None)));
        assert!(parks.config.is_filter_exempt());

        let trails: &LayerDeclaration = &decls[1];
        assert!(trails.lazy);
        assert!(!trails.config.is_filter_exempt());
        assert_eq!(trails.display_label(), "trails");
    }
}
