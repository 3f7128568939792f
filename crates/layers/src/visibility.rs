use std::collections::BTreeSet;
use std::fmt;

use foundation::{FeatureKey, GeometryType, LayerId, Millis};
use profile::{EngineSettings, LayerConfig};
use runtime::{DebouncedBatch, EventBus};
use scene::FeatureStore;
use tracing::{debug, warn};

use crate::cluster::{ClusterCoordinator, ClusterStrategy};
use crate::events::LayerEvent;
use crate::filter::FilterResult;
use crate::surface::{AttachError, MapSurface, SurfaceObject};

/// Attach/detach calls issued by one reconcile pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcileReport {
    pub detached: Vec<FeatureKey>,
    pub attached: Vec<FeatureKey>,
    pub failed: Vec<(FeatureKey, AttachError)>,
}

impl ReconcileReport {
    pub fn is_empty(&self) -> bool {
        self.detached.is_empty() && self.attached.is_empty() && self.failed.is_empty()
    }

    fn changed_layers(&self) -> Vec<LayerId> {
        let layers: BTreeSet<&LayerId> = self
            .detached
            .iter()
            .chain(&self.attached)
            .map(|key| &key.layer)
            .collect();
        layers.into_iter().cloned().collect()
    }
}

/// Keeps each feature's visibility state and its physical attachment in step.
///
/// State transitions update [`scene::VisibilityState`] right away and queue
/// the feature for reconciliation. Reconciliation compares the desired state
/// (`current` and the layer is mounted, i.e. displayed) with what is attached and issues the
/// minimal calls: all detaches of a batch run before any attach. A rejected
/// call is logged and the feature keeps its last known-good attachment.
///
/// This is the only writer of the map surface and the cluster groups.
pub struct VisibilityManager {
    surface: Box<dyn MapSurface>,
    clusters: ClusterCoordinator,
    mounted: BTreeSet<LayerId>,
    panes: BTreeSet<LayerId>,
    direct: BTreeSet<FeatureKey>,
    pending: DebouncedBatch<FeatureKey>,
    bus: EventBus<LayerEvent>,
}

impl fmt::Debug for VisibilityManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VisibilityManager")
            .field("clusters", &self.clusters)
            .field("mounted", &self.mounted)
            .field("direct", &self.direct.len())
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}

impl VisibilityManager {
    pub fn new(
        surface: Box<dyn MapSurface>,
        clusters: ClusterCoordinator,
        engine: &EngineSettings,
    ) -> Self {
        Self {
            surface,
            clusters,
            mounted: BTreeSet::new(),
            panes: BTreeSet::new(),
            direct: BTreeSet::new(),
            pending: DebouncedBatch::new(engine.reconcile_window_ms),
            bus: EventBus::with_log_limit(engine.event_log_limit),
        }
    }

    pub fn bus(&self) -> &EventBus<LayerEvent> {
        &self.bus
    }

    pub fn bus_mut(&mut self) -> &mut EventBus<LayerEvent> {
        &mut self.bus
    }

    pub fn publish(&mut self, event: LayerEvent) {
        self.bus.emit(event);
    }

    pub fn clusters(&self) -> &ClusterCoordinator {
        &self.clusters
    }

    pub fn surface(&self) -> &dyn MapSurface {
        self.surface.as_ref()
    }

    pub fn pending(&self) -> &DebouncedBatch<FeatureKey> {
        &self.pending
    }

    pub fn is_mounted(&self, layer: &LayerId) -> bool {
        self.mounted.contains(layer)
    }

    pub fn is_attached(&self, key: &FeatureKey) -> bool {
        self.direct.contains(key) || self.clusters.is_attached(key)
    }

    pub fn attached_count(&self, layer: &LayerId) -> usize {
        let direct = self.direct.iter().filter(|key| &key.layer == layer).count();
        direct + self.clusters.attached_keys(layer).len()
    }

    /// Fixes the layer's cluster strategy once its data is loaded.
    pub fn prepare_layer(&mut self, layer: &LayerId, store: &FeatureStore) -> ClusterStrategy {
        match store.layer(layer) {
            Some(record) => {
                let config: &LayerConfig = record.config();
                self.clusters
                    .decide(layer, record.geometry_type(), &config.clustering)
            }
            None => ClusterStrategy::Unclustered,
        }
    }

    /// Makes the layer eligible for attachment: creates its pane on first use,
    /// opens its cluster group and queues all of its features.
    pub fn mount(&mut self, store: &FeatureStore, layer: &LayerId, now: Millis) {
        if self.panes.insert(layer.clone()) {
            self.surface.create_pane(&pane_name(layer));
        }
        self.clusters.open_layer(layer, self.surface.as_mut());
        self.mounted.insert(layer.clone());
        self.pending
            .schedule_all(store.features(layer).map(|f| f.key()), now);
    }

    /// Takes the layer off the map but keeps its pane and cluster group. Its
    /// features are queued so the next reconcile detaches them, and nothing
    /// of the layer attaches until it is mounted again.
    pub fn unmount(&mut self, store: &FeatureStore, layer: &LayerId, now: Millis) {
        if self.mounted.remove(layer) {
            self.pending
                .schedule_all(store.features(layer).map(|f| f.key()), now);
        }
    }

    /// Detaches every feature of the layer right away and closes its cluster
    /// group. Run before the layer's features are purged.
    pub fn release_layer(&mut self, layer: &LayerId) -> ReconcileReport {
        self.mounted.remove(layer);
        self.pending.retain(|key| &key.layer != layer);

        let mut report = ReconcileReport::default();
        let direct: Vec<FeatureKey> = self
            .direct
            .iter()
            .filter(|key| &key.layer == layer)
            .cloned()
            .collect();
        for key in direct {
            match self.detach(&key) {
                Ok(true) => report.detached.push(key),
                Ok(false) => {}
                Err(err) => {
                    warn!(feature = %key, "detach failed: {err}");
                    report.failed.push((key, err));
                }
            }
        }
        let clustered = self.clusters.attached_keys(layer);
        let closed = self.clusters.close_layer(layer, self.surface.as_mut());
        report
            .detached
            .extend(clustered.into_iter().filter(|key| !self.clusters.is_attached(key)));
        debug!(layer = %layer, detached = report.detached.len(), closed, "layer released");
        self.panes.remove(layer);
        self.announce(&report);
        report
    }

    pub fn set_logical(
        &mut self,
        store: &mut FeatureStore,
        key: &FeatureKey,
        value: bool,
        now: Millis,
    ) -> bool {
        let Some(feature) = store.feature_mut(key) else {
            return false;
        };
        let changed = feature.visibility_mut().set_logical(value);
        if changed {
            self.pending.schedule(key.clone(), now);
        }
        changed
    }

    /// Sets the logical state of every feature of the layer. Returns how many
    /// features changed `current`.
    pub fn set_layer_logical(
        &mut self,
        store: &mut FeatureStore,
        layer: &LayerId,
        value: bool,
        now: Millis,
    ) -> usize {
        let mut changed = 0;
        for feature in store.features_mut(layer) {
            if feature.visibility_mut().set_logical(value) {
                self.pending.schedule(feature.key(), now);
                changed += 1;
            }
        }
        changed
    }

    pub fn apply_filter_outcome(
        &mut self,
        store: &mut FeatureStore,
        key: &FeatureKey,
        passed: bool,
        now: Millis,
    ) -> bool {
        let Some(feature) = store.feature_mut(key) else {
            return false;
        };
        let changed = feature.visibility_mut().set_filtered_out(!passed);
        if changed {
            self.pending.schedule(key.clone(), now);
        }
        changed
    }

    pub fn apply_filter_result(
        &mut self,
        store: &mut FeatureStore,
        result: &FilterResult,
        now: Millis,
    ) -> usize {
        let mut changed = 0;
        for (key, passed) in result.iter() {
            if self.apply_filter_outcome(store, key, passed, now) {
                changed += 1;
            }
        }
        changed
    }

    /// Bulk zoom verdict for a layer. Logical state is left alone.
    pub fn apply_zoom_policy(
        &mut self,
        store: &mut FeatureStore,
        layer: &LayerId,
        within: bool,
        now: Millis,
    ) -> usize {
        let mut changed = 0;
        for feature in store.features_mut(layer) {
            if feature.visibility_mut().set_within_zoom(within) {
                self.pending.schedule(feature.key(), now);
                changed += 1;
            }
        }
        changed
    }

    /// Debounced path: reconciles the pending batch once its window elapsed.
    pub fn poll(&mut self, store: &FeatureStore, now: Millis) -> Option<ReconcileReport> {
        let keys = self.pending.take_due(now)?;
        Some(self.reconcile_keys(store, keys))
    }

    /// Immediate path: reconciles whatever is pending now.
    pub fn flush(&mut self, store: &FeatureStore) -> ReconcileReport {
        let keys = self.pending.take_now();
        self.reconcile_keys(store, keys)
    }

    /// Reconciles one feature immediately, outside the batch.
    pub fn reconcile(&mut self, store: &FeatureStore, key: &FeatureKey) -> ReconcileReport {
        self.reconcile_keys(store, vec![key.clone()])
    }

    fn desired(&self, store: &FeatureStore, key: &FeatureKey) -> bool {
        self.mounted.contains(&key.layer)
            && store
                .feature_by_key(key)
                .is_some_and(|feature| feature.visibility().current())
    }

    fn reconcile_keys(&mut self, store: &FeatureStore, keys: Vec<FeatureKey>) -> ReconcileReport {
        let mut to_detach = Vec::new();
        let mut to_attach = Vec::new();
        for key in keys {
            match (self.desired(store, &key), self.is_attached(&key)) {
                (true, false) => to_attach.push(key),
                (false, true) => to_detach.push(key),
                _ => {}
            }
        }

        let mut report = ReconcileReport::default();
        for key in to_detach {
            match self.detach(&key) {
                Ok(_) => report.detached.push(key),
                Err(err) => {
                    warn!(feature = %key, "detach failed: {err}");
                    report.failed.push((key, err));
                }
            }
        }
        for key in to_attach {
            match self.attach(store, &key) {
                Ok(_) => report.attached.push(key),
                Err(err) => {
                    warn!(feature = %key, "attach failed: {err}");
                    report.failed.push((key, err));
                }
            }
        }

        if !report.is_empty() {
            debug!(
                attached = report.attached.len(),
                detached = report.detached.len(),
                failed = report.failed.len(),
                "reconciled"
            );
        }
        self.announce(&report);
        report
    }

    /// Points of a clustered layer go to its cluster group; lines and
    /// polygons always go straight to the surface.
    fn attach(&mut self, store: &FeatureStore, key: &FeatureKey) -> Result<bool, AttachError> {
        let point = store
            .feature_by_key(key)
            .is_some_and(|feature| feature.geometry_type() == GeometryType::Point);
        if point && self.clusters.is_clustered(&key.layer) {
            return self.clusters.attach(key);
        }
        if self.direct.contains(key) {
            return Ok(false);
        }
        self.surface
            .add_layer(&SurfaceObject::Feature(key.clone()))?;
        self.direct.insert(key.clone());
        Ok(true)
    }

    fn detach(&mut self, key: &FeatureKey) -> Result<bool, AttachError> {
        if self.clusters.is_attached(key) {
            return self.clusters.detach(key);
        }
        if !self.direct.contains(key) {
            return Ok(false);
        }
        self.surface
            .remove_layer(&SurfaceObject::Feature(key.clone()))?;
        self.direct.remove(key);
        Ok(true)
    }

    fn announce(&mut self, report: &ReconcileReport) {
        let layers = report.changed_layers();
        if !layers.is_empty() {
            self.bus.emit(LayerEvent::LayersChanged { layers });
        }
    }
}

/// Pane that holds a layer's features on the map surface.
pub fn pane_name(layer: &LayerId) -> String {
    format!("geoleaf-{layer}")
}
