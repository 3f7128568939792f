//! Legend and table views derived from lifecycle state.
//!
//! Projections never touch the map surface. They rebuild only after a
//! [`LayerEvent`] arrived and write back through [`ToggleCommand`]s.

use std::cell::Cell;
use std::rc::Rc;

use foundation::{FeatureId, FeatureKey, GeometryType, LayerId};
use runtime::SubscriptionId;
use scene::FeatureQuery;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::events::LayerEvent;
use crate::lifecycle::{LayerInfo, LayerLifecycle, LayerState};

/// `{layerId, featureId?}`; without `featureId` the whole layer toggles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToggleCommand {
    pub layer_id: LayerId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feature_id: Option<FeatureId>,
}

impl ToggleCommand {
    pub fn layer(id: impl Into<LayerId>) -> Self {
        Self {
            layer_id: id.into(),
            feature_id: None,
        }
    }

    pub fn feature(key: FeatureKey) -> Self {
        Self {
            layer_id: key.layer,
            feature_id: Some(key.feature),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LegendEntry {
    pub id: LayerId,
    pub label: String,
    pub geometry_type: GeometryType,
    pub checked: bool,
    /// Off while the layer loads or after its load failed.
    pub enabled: bool,
    pub loading: bool,
    pub feature_count: usize,
    pub visible_count: usize,
    pub error: Option<String>,
}

impl LegendEntry {
    pub fn from_info(info: &LayerInfo) -> Self {
        Self {
            id: info.id.clone(),
            label: info.label.clone(),
            geometry_type: info.geometry_type,
            checked: info.logical_visible,
            enabled: !info.loading && info.last_error.is_none(),
            loading: info.loading,
            feature_count: info.feature_count,
            visible_count: info.visible_count,
            error: info.last_error.clone(),
        }
    }

    pub fn toggle_command(&self) -> ToggleCommand {
        ToggleCommand::layer(self.id.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TableRow {
    pub layer_id: LayerId,
    pub feature_id: FeatureId,
    /// One cell per configured column; `null` when the feature lacks it.
    pub cells: Vec<Value>,
}

impl TableRow {
    pub fn toggle_command(&self) -> ToggleCommand {
        ToggleCommand::feature(FeatureKey::new(
            self.layer_id.clone(),
            self.feature_id.clone(),
        ))
    }
}

/// Dirty flag flipped by an event-bus subscription.
#[derive(Debug)]
struct Invalidation {
    dirty: Rc<Cell<bool>>,
    subscription: SubscriptionId,
}

impl Invalidation {
    fn subscribe(lifecycle: &mut LayerLifecycle, relevant: fn(&LayerEvent) -> bool) -> Self {
        let dirty = Rc::new(Cell::new(true));
        let flag = Rc::clone(&dirty);
        let subscription = lifecycle.subscribe(move |event| {
            if relevant(event) {
                flag.set(true);
            }
        });
        Self {
            dirty,
            subscription,
        }
    }

    fn take(&self) -> bool {
        self.dirty.replace(false)
    }
}

pub fn legend_entries(lifecycle: &LayerLifecycle) -> Vec<LegendEntry> {
    lifecycle.layers().iter().map(LegendEntry::from_info).collect()
}

/// Features of displayed layers that the user wants and the filter lets
/// through, in layer then load order. Zoom does not remove rows.
pub fn table_rows(
    lifecycle: &LayerLifecycle,
    query: &FeatureQuery,
    columns: &[String],
) -> Vec<TableRow> {
    lifecycle
        .store()
        .all_features(query)
        .into_iter()
        .filter(|feature| lifecycle.state(feature.layer_id()) == Some(LayerState::Displayed))
        .filter(|feature| {
            let v = feature.visibility();
            v.logical() && !v.filtered_out()
        })
        .map(|feature| TableRow {
            layer_id: feature.layer_id().clone(),
            feature_id: feature.id().clone(),
            cells: columns
                .iter()
                .map(|column| feature.property(column).cloned().unwrap_or(Value::Null))
                .collect(),
        })
        .collect()
}

#[derive(Debug)]
pub struct LegendProjection {
    invalidation: Invalidation,
    entries: Vec<LegendEntry>,
    renders: u64,
}

impl LegendProjection {
    pub fn attach(lifecycle: &mut LayerLifecycle) -> Self {
        Self {
            invalidation: Invalidation::subscribe(lifecycle, |event| {
                !matches!(event, LayerEvent::FilterApplied { .. })
            }),
            entries: Vec::new(),
            renders: 0,
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.invalidation.dirty.get()
    }

    /// Rebuilds if an event arrived since the last render.
    pub fn render(&mut self, lifecycle: &LayerLifecycle) -> &[LegendEntry] {
        if self.invalidation.take() {
            self.entries = legend_entries(lifecycle);
            self.renders += 1;
        }
        &self.entries
    }

    pub fn renders(&self) -> u64 {
        self.renders
    }

    pub fn detach(self, lifecycle: &mut LayerLifecycle) -> bool {
        lifecycle.unsubscribe(self.invalidation.subscription)
    }
}

#[derive(Debug)]
pub struct TableProjection {
    invalidation: Invalidation,
    columns: Vec<String>,
    query: FeatureQuery,
    rows: Vec<TableRow>,
    renders: u64,
}

impl TableProjection {
    pub fn attach(lifecycle: &mut LayerLifecycle, columns: Vec<String>, query: FeatureQuery) -> Self {
        Self {
            invalidation: Invalidation::subscribe(lifecycle, |_| true),
            columns,
            query,
            rows: Vec::new(),
            renders: 0,
        }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn is_dirty(&self) -> bool {
        self.invalidation.dirty.get()
    }

    pub fn render(&mut self, lifecycle: &LayerLifecycle) -> &[TableRow] {
        if self.invalidation.take() {
            self.rows = table_rows(lifecycle, &self.query, &self.columns);
            self.renders += 1;
        }
        &self.rows
    }

    pub fn renders(&self) -> u64 {
        self.renders
    }

    pub fn detach(self, lifecycle: &mut LayerLifecycle) -> bool {
        lifecycle.unsubscribe(self.invalidation.subscription)
    }
}
