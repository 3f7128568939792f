//! Stable feature ids.
//!
//! Source data carries ids under several names depending on where it was
//! exported from. The lookup order is part of the data contract: existing
//! datasets rely on it, so new sources are appended, never inserted.

use serde_json::Value;

/// Where a feature id was found, in lookup order.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum IdSource {
    /// GeoJSON `feature.id`.
    Feature,
    /// `properties.id`.
    PropertiesId,
    /// `properties.fid` (OGR exports).
    Fid,
    /// `properties.osm_id` (OpenStreetMap extracts).
    OsmId,
    /// `properties.OBJECTID` (ArcGIS exports).
    ObjectId,
}

pub const ID_SOURCES: [IdSource; 5] = [
    IdSource::Feature,
    IdSource::PropertiesId,
    IdSource::Fid,
    IdSource::OsmId,
    IdSource::ObjectId,
];

impl IdSource {
    pub fn extract(self, feature: &Value) -> Option<String> {
        let raw = match self {
            Self::Feature => feature.get("id"),
            Self::PropertiesId => property(feature, "id"),
            Self::Fid => property(feature, "fid"),
            Self::OsmId => property(feature, "osm_id"),
            Self::ObjectId => property(feature, "OBJECTID"),
        }?;
        id_text(raw)
    }
}

fn property<'a>(feature: &'a Value, name: &str) -> Option<&'a Value> {
    feature.get("properties")?.get(name)
}

fn id_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// First id found along [`ID_SOURCES`].
pub fn resolve_feature_id(feature: &Value) -> Option<(IdSource, String)> {
    ID_SOURCES
        .iter()
        .find_map(|source| source.extract(feature).map(|id| (*source, id)))
}

/// Synthetic id for features without one. Scoped to a load pass so repeated
/// loads of the same layer never collide.
pub fn synthetic_feature_id(layer: &str, pass: u64, index: usize) -> String {
    format!("{layer}-{pass}-{index}")
}
