use std::collections::BTreeMap;

use foundation::{FeatureId, FeatureKey, GeometryType, LayerId};
use profile::LayerConfig;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::error::{GeometryError, StoreError};
use crate::feature::{Feature, Geometry, LabelState};
use crate::ids::{resolve_feature_id, synthetic_feature_id};

/// A registered layer and its features, kept in load order.
#[derive(Debug, Clone)]
pub struct LayerRecord {
    id: LayerId,
    geometry_type: GeometryType,
    config: LayerConfig,
    features: BTreeMap<FeatureId, Feature>,
    order: Vec<FeatureId>,
    passes: u64,
}

impl LayerRecord {
    fn new(id: LayerId, geometry_type: GeometryType, config: LayerConfig) -> Self {
        Self {
            id,
            geometry_type,
            config,
            features: BTreeMap::new(),
            order: Vec::new(),
            passes: 0,
        }
    }

    pub fn id(&self) -> &LayerId {
        &self.id
    }

    pub fn geometry_type(&self) -> GeometryType {
        self.geometry_type
    }

    pub fn config(&self) -> &LayerConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn feature(&self, id: &FeatureId) -> Option<&Feature> {
        self.features.get(id)
    }

    /// Features in load order.
    pub fn features(&self) -> impl Iterator<Item = &Feature> {
        self.order.iter().filter_map(|id| self.features.get(id))
    }

    pub fn feature_ids(&self) -> &[FeatureId] {
        &self.order
    }
}

/// Outcome of one `add_features` pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddReport {
    pub added: Vec<FeatureId>,
    pub skipped: usize,
    pub synthesized: usize,
}

/// Selection used by read projections.
///
/// Unset fields select everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeatureQuery {
    pub geometry_types: Option<Vec<GeometryType>>,
    pub layer_ids: Option<Vec<LayerId>>,
}

impl FeatureQuery {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn layers(ids: impl IntoIterator<Item = impl Into<LayerId>>) -> Self {
        Self {
            layer_ids: Some(ids.into_iter().map(Into::into).collect()),
            ..Self::default()
        }
    }

    /// Geometry selection by name; aliases (`poi`, `route`, `area`) are
    /// normalized and unknown names ignored.
    pub fn with_geometry_names<'a>(mut self, names: impl IntoIterator<Item = &'a str>) -> Self {
        self.geometry_types = Some(names.into_iter().filter_map(GeometryType::parse).collect());
        self
    }

    pub fn with_geometry_types(mut self, types: impl IntoIterator<Item = GeometryType>) -> Self {
        self.geometry_types = Some(types.into_iter().collect());
        self
    }

    pub fn matches_layer(&self, layer: &LayerId) -> bool {
        self.layer_ids
            .as_ref()
            .is_none_or(|ids| ids.iter().any(|id| id == layer))
    }

    pub fn matches_feature(&self, feature: &Feature) -> bool {
        let kind = feature.geometry_type();
        self.geometry_types
            .as_ref()
            .is_none_or(|types| types.iter().any(|t| t.matches(kind)))
    }
}

/// Canonical set of loaded features, keyed by layer id and feature id.
///
/// Each feature carries its own [`crate::VisibilityState`], created with
/// `logical = true` when the feature is added and purged with its layer.
#[derive(Debug, Default)]
pub struct FeatureStore {
    layers: BTreeMap<LayerId, LayerRecord>,
}

impl FeatureStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_layer(
        &mut self,
        id: LayerId,
        geometry_type: GeometryType,
        config: LayerConfig,
    ) -> Result<(), StoreError> {
        if self.layers.contains_key(&id) {
            return Err(StoreError::DuplicateLayer(id));
        }
        self.layers
            .insert(id.clone(), LayerRecord::new(id, geometry_type, config));
        Ok(())
    }

    pub fn contains_layer(&self, id: &LayerId) -> bool {
        self.layers.contains_key(id)
    }

    pub fn layer(&self, id: &LayerId) -> Option<&LayerRecord> {
        self.layers.get(id)
    }

    /// Layers in id order.
    pub fn layers(&self) -> impl Iterator<Item = &LayerRecord> {
        self.layers.values()
    }

    /// Stores the parseable features of `raw` and skips the rest with a warning.
    ///
    /// Ids are taken from the source (see [`crate::ids::ID_SOURCES`]) or
    /// synthesized for this pass. A feature whose id is already taken in the
    /// layer is skipped.
    pub fn add_features(
        &mut self,
        layer: &LayerId,
        raw: Vec<Value>,
    ) -> Result<AddReport, StoreError> {
        let record = self
            .layers
            .get_mut(layer)
            .ok_or_else(|| StoreError::UnknownLayer(layer.clone()))?;

        let pass = record.passes;
        record.passes += 1;

        let mut report = AddReport::default();
        for (index, value) in raw.into_iter().enumerate() {
            let (feature, synthesized) = match build_feature(record, pass, index, value) {
                Ok(built) => built,
                Err(err) => {
                    warn!(layer = %layer, index, "skipping feature: {err}");
                    report.skipped += 1;
                    continue;
                }
            };

            let id = feature.id().clone();
            if record.features.contains_key(&id) {
                warn!(layer = %layer, index, feature = %id, "skipping feature: duplicate id");
                report.skipped += 1;
                continue;
            }

            if synthesized {
                report.synthesized += 1;
            }
            record.features.insert(id.clone(), feature);
            record.order.push(id.clone());
            report.added.push(id);
        }

        debug!(
            layer = %layer,
            added = report.added.len(),
            skipped = report.skipped,
            "features added"
        );
        Ok(report)
    }

    pub fn feature(&self, layer: &LayerId, id: &FeatureId) -> Option<&Feature> {
        self.layers.get(layer)?.features.get(id)
    }

    pub fn feature_by_key(&self, key: &FeatureKey) -> Option<&Feature> {
        self.feature(&key.layer, &key.feature)
    }

    pub fn feature_mut(&mut self, key: &FeatureKey) -> Option<&mut Feature> {
        self.layers.get_mut(&key.layer)?.features.get_mut(&key.feature)
    }

    /// Features of one layer in load order; empty for unknown layers.
    pub fn features(&self, layer: &LayerId) -> impl Iterator<Item = &Feature> {
        self.layers.get(layer).into_iter().flat_map(LayerRecord::features)
    }

    pub fn features_mut(&mut self, layer: &LayerId) -> impl Iterator<Item = &mut Feature> {
        self.layers
            .get_mut(layer)
            .into_iter()
            .flat_map(|record| record.features.values_mut())
    }

    pub fn all_features(&self, query: &FeatureQuery) -> Vec<&Feature> {
        self.layers
            .values()
            .filter(|record| query.matches_layer(&record.id))
            .flat_map(LayerRecord::features)
            .filter(|feature| query.matches_feature(feature))
            .collect()
    }

    pub fn keys(&self, query: &FeatureQuery) -> Vec<FeatureKey> {
        self.all_features(query).into_iter().map(Feature::key).collect()
    }

    /// Purges the layer with all of its features and their visibility state.
    pub fn remove_layer(&mut self, layer: &LayerId) -> Option<LayerRecord> {
        self.layers.remove(layer)
    }

    pub fn set_feature_style(&mut self, key: &FeatureKey, style: Option<Value>) -> bool {
        let Some(feature) = self.feature_mut(key) else {
            return false;
        };
        feature.set_style(style);
        true
    }

    pub fn set_feature_label(&mut self, key: &FeatureKey, label: LabelState) -> bool {
        let Some(feature) = self.feature_mut(key) else {
            return false;
        };
        feature.set_label(label);
        true
    }

    /// Replaces the layer style and resets every feature's cached style to it.
    pub fn update_layer_style(
        &mut self,
        layer: &LayerId,
        style: Option<Value>,
    ) -> Result<(), StoreError> {
        let record = self
            .layers
            .get_mut(layer)
            .ok_or_else(|| StoreError::UnknownLayer(layer.clone()))?;
        record.config.style = style.clone();
        for feature in record.features.values_mut() {
            feature.set_style(style.clone());
        }
        Ok(())
    }

    pub fn feature_count(&self) -> usize {
        self.layers.values().map(LayerRecord::len).sum()
    }
}

fn build_feature(
    record: &LayerRecord,
    pass: u64,
    index: usize,
    value: Value,
) -> Result<(Feature, bool), GeometryError> {
    let (id, synthesized) = match resolve_feature_id(&value) {
        Some((_source, id)) => (id, false),
        None => (synthetic_feature_id(record.id.as_str(), pass, index), true),
    };

    let Value::Object(mut obj) = value else {
        return Err(GeometryError::NotAnObject);
    };

    let geometry = match obj.get("geometry") {
        None | Some(Value::Null) => return Err(GeometryError::Missing),
        Some(g) => Geometry::from_geojson(g)?,
    };

    let properties = match obj.remove("properties") {
        Some(Value::Object(map)) => map,
        _ => Map::new(),
    };

    let mut feature = Feature::new(
        FeatureId::new(id),
        record.id.clone(),
        geometry,
        properties,
    );
    feature.set_style(record.config.style.clone());
    Ok((feature, synthesized))
}

#[cfg(test)]
mod tests {
    use super::{FeatureQuery, FeatureStore};
    use crate::error::StoreError;
    use foundation::{FeatureId, GeometryType, LayerId};
    use pretty_assertions::assert_eq;
    use profile::LayerConfig;
    use serde_json::{Value, json};

    fn point(id: Option<&str>, lng: f64, lat: f64) -> Value {
        let mut f = json!({
            "type": "Feature",
            "geometry": { "type": "Point", "coordinates": [lng, lat] },
            "properties": { "name": "x" }
        });
        if let Some(id) = id {
            f["id"] = json!(id);
        }
        f
    }

    fn line(id: &str) -> Value {
        json!({
            "type": "Feature",
            "id": id,
            "geometry": { "type": "LineString", "coordinates": [[0.0, 0.0], [1.0, 1.0]] },
            "properties": {}
        })
    }

    #[test]
    fn duplicate_layer_is_rejected() {
        let mut store = FeatureStore::new();
        let id = LayerId::new("parks");
        store
            .register_layer(id.clone(), GeometryType::Point, LayerConfig::default())
            .unwrap();
        let err = store
            .register_layer(id.clone(), GeometryType::Point, LayerConfig::default())
            .unwrap_err();
        assert_eq!(err, StoreError::DuplicateLayer(id));
    }

    #[test]
    fn add_features_skips_malformed_and_synthesizes_ids() {
        let mut store = FeatureStore::new();
        let layer = LayerId::new("parks");
        store
            .register_layer(layer.clone(), GeometryType::Point, LayerConfig::default())
            .unwrap();

        let report = store
            .add_features(
                &layer,
                vec![
                    point(Some("p1"), 2.0, 48.0),
                    json!({ "type": "Feature", "geometry": null }),
                    json!(42),
                    point(None, 3.0, 49.0),
                    point(Some("p1"), 4.0, 47.0),
                ],
            )
            .unwrap();

        assert_eq!(
            report.added,
            vec![FeatureId::new("p1"), FeatureId::new("parks-0-3")]
        );
        assert_eq!(report.skipped, 3);
        assert_eq!(report.synthesized, 1);

        let p1 = store.feature(&layer, &FeatureId::new("p1")).unwrap();
        assert!(p1.visibility().logical());
        assert_eq!(p1.property("name"), Some(&json!("x")));
    }

    #[test]
    fn unknown_layer_is_an_error() {
        let mut store = FeatureStore::new();
        let err = store
            .add_features(&LayerId::new("nope"), vec![])
            .unwrap_err();
        assert_eq!(err, StoreError::UnknownLayer(LayerId::new("nope")));
    }

    #[test]
    fn all_features_filters_by_layer_and_geometry_alias() {
        let mut store = FeatureStore::new();
        let mixed = LayerId::new("mixed");
        let other = LayerId::new("other");
        store
            .register_layer(mixed.clone(), GeometryType::Mixed, LayerConfig::default())
            .unwrap();
        store
            .register_layer(other.clone(), GeometryType::Point, LayerConfig::default())
            .unwrap();
        store
            .add_features(&mixed, vec![point(Some("a"), 0.0, 0.0), line("b")])
            .unwrap();
        store
            .add_features(&other, vec![point(Some("c"), 0.0, 0.0)])
            .unwrap();

        let routes = store.all_features(&FeatureQuery::all().with_geometry_names(["route"]));
        let ids: Vec<&str> = routes.iter().map(|f| f.id().as_str()).collect();
        assert_eq!(ids, vec!["b"]);

        let pois = store.all_features(&FeatureQuery::layers(["mixed"]).with_geometry_names(["poi"]));
        let ids: Vec<&str> = pois.iter().map(|f| f.id().as_str()).collect();
        assert_eq!(ids, vec!["a"]);

        assert_eq!(store.all_features(&FeatureQuery::all()).len(), 3);
    }

    #[test]
    fn remove_layer_purges_features() {
        let mut store = FeatureStore::new();
        let layer = LayerId::new("parks");
        store
            .register_layer(layer.clone(), GeometryType::Point, LayerConfig::default())
            .unwrap();
        store
            .add_features(&layer, vec![point(Some("p1"), 0.0, 0.0)])
            .unwrap();
        assert!(store.remove_layer(&layer).is_some());
        assert_eq!(store.feature_count(), 0);
        assert!(store.feature(&layer, &FeatureId::new("p1")).is_none());
    }

    #[test]
    fn layer_style_update_resets_feature_styles() {
        let mut store = FeatureStore::new();
        let layer = LayerId::new("parks");
        let config = LayerConfig {
            style: Some(json!({ "color": "green" })),
            ..LayerConfig::default()
        };
        store
            .register_layer(layer.clone(), GeometryType::Point, config)
            .unwrap();
        store
            .add_features(&layer, vec![point(Some("p1"), 0.0, 0.0)])
            .unwrap();
        let p1 = store.feature(&layer, &FeatureId::new("p1")).unwrap();
        assert_eq!(p1.style(), Some(&json!({ "color": "green" })));

        store
            .update_layer_style(&layer, Some(json!({ "color": "red" })))
            .unwrap();
        let p1 = store.feature(&layer, &FeatureId::new("p1")).unwrap();
        assert_eq!(p1.style(), Some(&json!({ "color": "red" })));
    }
}
