//! Layer lifecycle: `unloaded -> loading -> loaded -> displayed <-> hidden`,
//! and back to `unloaded`.
//!
//! [`LayerLifecycle`] owns the feature store, the visibility manager and the
//! zoom policy and is the only public way to change what is shown. UI
//! projections read its summaries and write back through `show`, `hide`,
//! `toggle` and `apply_toggle`.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use foundation::{Clock, FeatureKey, GeometryType, LayerId, Millis};
use profile::{EngineSettings, LayerDeclaration, PoiSettings, Profile, ProfileError};
use runtime::SubscriptionId;
use scene::{
    AddReport, DataError, Feature, FeatureQuery, FeatureStore, LabelState, StoreError,
};
use serde::Serialize;
use serde_json::Value;
use streaming::{BeginKind, InFlightLoads, LayerLoader, LoadError, LoadOutcome, PendingLoad, Request};
use tracing::{debug, info, warn};

use crate::cluster::ClusterCoordinator;
use crate::events::LayerEvent;
use crate::filter::{FilterEngine, FilterResult, FilterState, FilterSummary, ValidationError};
use crate::projections::ToggleCommand;
use crate::surface::{ClusterEngine, MapSurface};
use crate::visibility::{ReconcileReport, VisibilityManager};
use crate::zoom::ZoomVisibilityPolicy;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LayerState {
    Unloaded,
    Loading,
    Loaded,
    Displayed,
    Hidden,
}

impl fmt::Display for LayerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unloaded => "unloaded",
            Self::Loading => "loading",
            Self::Loaded => "loaded",
            Self::Displayed => "displayed",
            Self::Hidden => "hidden",
        };
        f.write_str(name)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error(transparent)]
    Data(#[from] DataError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Load(#[from] LoadError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Profile(#[from] ProfileError),
    #[error("unknown layer `{0}`")]
    UnknownLayer(LayerId),
    #[error("layer `{0}` is loading")]
    Busy(LayerId),
    #[error("layer `{0}` failed to load: {1}")]
    Failed(LayerId, String),
}

/// Result of [`LayerLifecycle::show`].
#[derive(Debug)]
pub enum ShowTicket {
    /// The layer reached this state synchronously.
    Ready(LayerState),
    /// A lazy load is in flight. Await it and hand the outcome to
    /// [`LayerLifecycle::settle_load`], or use [`LayerLifecycle::show_and_wait`].
    Pending(PendingLoad),
}

/// Engine-wide settings, usually read from the profile.
#[derive(Debug, Clone, PartialEq)]
pub struct LifecycleSettings {
    pub poi: PoiSettings,
    pub engine: EngineSettings,
    pub search_fields: Vec<String>,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self {
            poi: PoiSettings::default(),
            engine: EngineSettings::default(),
            search_fields: FilterEngine::default().search_fields().to_vec(),
        }
    }
}

impl LifecycleSettings {
    pub fn from_profile(profile: &Profile) -> Result<Self, ProfileError> {
        Ok(Self {
            poi: profile.poi_settings()?,
            engine: profile.engine_settings()?,
            search_fields: FilterEngine::from_profile(profile).search_fields().to_vec(),
        })
    }
}

/// Read-only layer summary for legends and tables.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LayerInfo {
    pub id: LayerId,
    pub label: String,
    pub geometry_type: GeometryType,
    pub state: LayerState,
    pub feature_count: usize,
    /// Features attached to the map surface or a cluster group.
    pub visible_count: usize,
    pub logical_visible: bool,
    pub loading: bool,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone)]
struct LayerSlot {
    declaration: LayerDeclaration,
    state: LayerState,
    last_error: Option<String>,
}

#[derive(Debug, Clone)]
struct ActiveFilter {
    state: FilterState,
    query: FeatureQuery,
}

pub struct LayerLifecycle {
    store: FeatureStore,
    visibility: VisibilityManager,
    zoom: ZoomVisibilityPolicy,
    filter: FilterEngine,
    loads: InFlightLoads,
    loader: Option<Rc<dyn LayerLoader>>,
    clock: Rc<dyn Clock>,
    slots: BTreeMap<LayerId, LayerSlot>,
    active_filter: Option<ActiveFilter>,
}

impl fmt::Debug for LayerLifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LayerLifecycle")
            .field("layers", &self.slots.keys().collect::<Vec<_>>())
            .field("visibility", &self.visibility)
            .field("loads", &self.loads)
            .field("has_loader", &self.loader.is_some())
            .finish_non_exhaustive()
    }
}

impl LayerLifecycle {
    pub fn new(
        surface: Box<dyn MapSurface>,
        cluster_engine: Box<dyn ClusterEngine>,
        clock: Rc<dyn Clock>,
        settings: LifecycleSettings,
    ) -> Self {
        let clusters = ClusterCoordinator::new(cluster_engine, settings.poi);
        Self {
            store: FeatureStore::new(),
            visibility: VisibilityManager::new(surface, clusters, &settings.engine),
            zoom: ZoomVisibilityPolicy::new(),
            filter: FilterEngine::new(settings.search_fields),
            loads: InFlightLoads::new(),
            loader: None,
            clock,
            slots: BTreeMap::new(),
            active_filter: None,
        }
    }

    pub fn with_loader(mut self, loader: Rc<dyn LayerLoader>) -> Self {
        self.loader = Some(loader);
        self
    }

    pub fn store(&self) -> &FeatureStore {
        &self.store
    }

    pub fn visibility(&self) -> &VisibilityManager {
        &self.visibility
    }

    pub fn zoom_policy(&self) -> &ZoomVisibilityPolicy {
        &self.zoom
    }

    pub fn filter_engine(&self) -> &FilterEngine {
        &self.filter
    }

    /// The most recent events, at most `engine.event_log_limit` of them.
    pub fn events(&self) -> &[LayerEvent] {
        self.visibility.bus().events()
    }

    pub fn subscribe(&mut self, listener: impl FnMut(&LayerEvent) + 'static) -> SubscriptionId {
        self.visibility.bus_mut().subscribe(listener)
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.visibility.bus_mut().unsubscribe(id)
    }

    pub fn fetches_started(&self) -> u64 {
        self.loads.fetches_started()
    }

    pub fn is_loading(&self, layer: &LayerId) -> bool {
        self.loads.is_loading(layer)
    }

    pub fn state(&self, layer: &LayerId) -> Option<LayerState> {
        self.slots.get(layer).map(|slot| slot.state)
    }

    /// Registers a known layer in `unloaded` state.
    pub fn declare(&mut self, declaration: LayerDeclaration) -> Result<(), LifecycleError> {
        let id = declaration.id.clone();
        if self.slots.contains_key(&id) {
            return Err(StoreError::DuplicateLayer(id).into());
        }
        self.zoom.register(&id, declaration.config.zoom);
        debug!(layer = %id, "layer declared");
        self.slots.insert(
            id,
            LayerSlot {
                declaration,
                state: LayerState::Unloaded,
                last_error: None,
            },
        );
        Ok(())
    }

    /// Declares every layer listed in the profile. Returns how many were added.
    pub fn declare_from_profile(&mut self, profile: &Profile) -> Result<usize, LifecycleError> {
        let declarations = profile.layer_declarations()?;
        let count = declarations.len();
        for declaration in declarations {
            self.declare(declaration)?;
        }
        Ok(count)
    }

    /// Parses `source` into a declared layer and leaves it `loaded`.
    ///
    /// A source that is not GeoJSON at all fails the whole layer with
    /// [`DataError`] and puts it back to `unloaded`. Malformed individual
    /// features are skipped.
    pub fn load(&mut self, layer: &LayerId, source: &str) -> Result<AddReport, LifecycleError> {
        match self.slot(layer)?.state {
            LayerState::Unloaded => {}
            LayerState::Loading => return Err(LifecycleError::Busy(layer.clone())),
            _ => return Err(StoreError::DuplicateLayer(layer.clone()).into()),
        }
        self.set_state(layer, LayerState::Loading);
        self.ingest(layer, source)
    }

    /// Declares the layer if needed, then loads it.
    pub fn load_declaration(
        &mut self,
        declaration: LayerDeclaration,
        source: &str,
    ) -> Result<AddReport, LifecycleError> {
        let id = declaration.id.clone();
        if !self.slots.contains_key(&id) {
            self.declare(declaration)?;
        }
        self.load(&id, source)
    }

    /// Displays the layer, loading it on demand first when a loader is set.
    /// Showing a displayed layer changes nothing.
    pub fn show(&mut self, layer: &LayerId) -> Result<ShowTicket, LifecycleError> {
        match self.slot(layer)?.state {
            LayerState::Unloaded => {
                let Some(loader) = &self.loader else {
                    return Err(LoadError::NoLoader(layer.clone()).into());
                };
                let (pending, kind) = self.loads.begin(layer, loader.as_ref());
                if kind == BeginKind::Started {
                    info!(layer = %layer, request = pending.request().0, "lazy load started");
                }
                self.set_state(layer, LayerState::Loading);
                Ok(ShowTicket::Pending(pending))
            }
            LayerState::Loading => match self.loads.pending(layer) {
                Some(pending) => {
                    debug!(layer = %layer, "show joins in-flight load");
                    Ok(ShowTicket::Pending(pending))
                }
                None => Err(LifecycleError::Busy(layer.clone())),
            },
            LayerState::Loaded | LayerState::Hidden | LayerState::Displayed => {
                Ok(ShowTicket::Ready(self.display(layer)))
            }
        }
    }

    /// `show`, awaiting a lazy load if one is needed.
    ///
    /// The lifecycle is borrowed only between awaits, so several of these can
    /// run concurrently on one event loop; they share a single fetch.
    pub async fn show_and_wait(
        cell: &RefCell<LayerLifecycle>,
        layer: &LayerId,
    ) -> Result<LayerState, LifecycleError> {
        let ticket = cell.borrow_mut().show(layer)?;
        match ticket {
            ShowTicket::Ready(state) => Ok(state),
            ShowTicket::Pending(pending) => {
                let request = pending.request();
                let outcome = pending.await;
                cell.borrow_mut().settle_load(layer, request, outcome)
            }
        }
    }

    /// Completes a lazy load. Only the first settle of the current request
    /// ingests data; later or stale calls report the outcome and the current
    /// state without side effects. A layer the first settle failed to ingest
    /// reports that failure here too.
    pub fn settle_load(
        &mut self,
        layer: &LayerId,
        request: Request,
        outcome: LoadOutcome,
    ) -> Result<LayerState, LifecycleError> {
        if !self.loads.finish(layer, request) {
            outcome?;
            let slot = self.slot(layer)?;
            return match (&slot.state, &slot.last_error) {
                (LayerState::Unloaded, Some(message)) => {
                    Err(LifecycleError::Failed(layer.clone(), message.clone()))
                }
                (state, _) => Ok(*state),
            };
        }
        match outcome {
            Ok(source) => {
                self.ingest(layer, &source)?;
                Ok(self.display(layer))
            }
            Err(err) => {
                self.fail(layer, err.to_string());
                Err(err.into())
            }
        }
    }

    /// Hides every feature of the layer. Hiding a hidden or unloaded layer
    /// changes nothing.
    pub fn hide(&mut self, layer: &LayerId) -> Result<LayerState, LifecycleError> {
        match self.slot(layer)?.state {
            LayerState::Loading => Err(LifecycleError::Busy(layer.clone())),
            LayerState::Unloaded => Ok(LayerState::Unloaded),
            LayerState::Hidden => Ok(LayerState::Hidden),
            LayerState::Loaded | LayerState::Displayed => {
                let now = self.now();
                self.visibility
                    .set_layer_logical(&mut self.store, layer, false, now);
                self.visibility.unmount(&self.store, layer, now);
                self.visibility.flush(&self.store);
                self.set_state(layer, LayerState::Hidden);
                Ok(LayerState::Hidden)
            }
        }
    }

    /// Inverts the layer's aggregate logical state.
    pub fn toggle(&mut self, layer: &LayerId) -> Result<ShowTicket, LifecycleError> {
        match self.slot(layer)?.state {
            LayerState::Loading => Err(LifecycleError::Busy(layer.clone())),
            LayerState::Displayed if self.any_logical(layer) => {
                self.hide(layer).map(ShowTicket::Ready)
            }
            _ => self.show(layer),
        }
    }

    /// Shows or hides a single feature of a loaded layer and reconciles it
    /// right away. Nothing is drawn unless the layer is displayed; the flag
    /// takes effect when it is.
    pub fn set_feature_visible(
        &mut self,
        key: &FeatureKey,
        visible: bool,
    ) -> Result<bool, LifecycleError> {
        if self.store.feature_by_key(key).is_none() {
            return Err(self.missing(key));
        }
        let now = self.now();
        let changed = self
            .visibility
            .set_logical(&mut self.store, key, visible, now);
        self.visibility.flush(&self.store);
        Ok(changed)
    }

    /// Applies a UI toggle command: a whole layer, or one feature when
    /// `featureId` is present.
    pub fn apply_toggle(&mut self, command: &ToggleCommand) -> Result<ShowTicket, LifecycleError> {
        let Some(feature) = &command.feature_id else {
            return self.toggle(&command.layer_id);
        };
        let state = self.slot(&command.layer_id)?.state;
        if state == LayerState::Loading {
            return Err(LifecycleError::Busy(command.layer_id.clone()));
        }
        let key = FeatureKey::new(command.layer_id.clone(), feature.clone());
        let logical = self
            .store
            .feature_by_key(&key)
            .map(|f| f.visibility().logical())
            .ok_or_else(|| self.missing(&key))?;
        self.set_feature_visible(&key, !logical)?;
        Ok(ShowTicket::Ready(state))
    }

    /// Aborts any in-flight load, detaches everything and purges the layer's
    /// features. The declaration is kept so the layer can be shown again.
    pub fn unload(&mut self, layer: &LayerId) -> Result<LayerState, LifecycleError> {
        self.slot(layer)?;
        if self.loads.cancel(layer) {
            info!(layer = %layer, "in-flight load aborted by unload");
        }
        self.visibility.release_layer(layer);
        if self.store.remove_layer(layer).is_some() {
            info!(layer = %layer, "layer unloaded");
        }
        self.set_state(layer, LayerState::Unloaded);
        Ok(LayerState::Unloaded)
    }

    /// Map zoom-end. Recomputes `within_zoom` for every loaded layer with
    /// thresholds; reconciliation goes through the debounced batch.
    pub fn on_zoom_end(&mut self, zoom: f64) -> usize {
        let now = self.now();
        let mut changed = 0;
        for (layer, within) in self.zoom.on_zoom_end(zoom) {
            if self.store.contains_layer(&layer) {
                changed += self
                    .visibility
                    .apply_zoom_policy(&mut self.store, &layer, within, now);
            }
        }
        debug!(zoom, changed, "zoom policy applied");
        changed
    }

    /// Evaluates `state` over the features selected by `query` and marks the
    /// failures filtered out. The filter stays active for layers loaded later.
    pub fn apply_filter(
        &mut self,
        state: &FilterState,
        query: &FeatureQuery,
    ) -> Result<FilterSummary, LifecycleError> {
        let result = self.filter.evaluate_store(&self.store, query, state)?;
        self.active_filter = Some(ActiveFilter {
            state: state.clone(),
            query: query.clone(),
        });
        Ok(self.commit_filter(&result))
    }

    /// Filters by an arbitrary predicate. Exempt layers always pass.
    pub fn filter_features(
        &mut self,
        predicate: impl Fn(&Feature) -> bool,
        query: &FeatureQuery,
    ) -> FilterSummary {
        let outcomes = self
            .store
            .all_features(query)
            .into_iter()
            .map(|feature| {
                let exempt = self
                    .store
                    .layer(feature.layer_id())
                    .is_some_and(|record| record.config().is_filter_exempt());
                (feature.key(), exempt || predicate(feature))
            })
            .collect();
        self.active_filter = None;
        self.commit_filter(&FilterResult::from_outcomes(outcomes))
    }

    /// Lifts every filter in scope; afterwards `visible == total`.
    pub fn clear_feature_filter(&mut self, query: &FeatureQuery) -> FilterSummary {
        let outcomes = self
            .store
            .keys(query)
            .into_iter()
            .map(|key| (key, true))
            .collect();
        self.active_filter = None;
        self.commit_filter(&FilterResult::from_outcomes(outcomes))
    }

    /// Debounced reconcile, driven by the injected clock.
    pub fn poll(&mut self) -> Option<ReconcileReport> {
        let now = self.now();
        self.visibility.poll(&self.store, now)
    }

    /// Immediate reconcile of everything pending.
    pub fn flush(&mut self) -> ReconcileReport {
        self.visibility.flush(&self.store)
    }

    pub fn update_layer_style(
        &mut self,
        layer: &LayerId,
        style: Option<Value>,
    ) -> Result<(), LifecycleError> {
        self.store.update_layer_style(layer, style)?;
        self.visibility.publish(LayerEvent::LayersChanged {
            layers: vec![layer.clone()],
        });
        Ok(())
    }

    pub fn set_feature_style(&mut self, key: &FeatureKey, style: Option<Value>) -> bool {
        self.store.set_feature_style(key, style)
    }

    pub fn set_feature_label(&mut self, key: &FeatureKey, label: LabelState) -> bool {
        self.store.set_feature_label(key, label)
    }

    /// Summaries of every declared layer, in id order.
    pub fn layers(&self) -> Vec<LayerInfo> {
        self.slots
            .iter()
            .map(|(id, slot)| self.info(id, slot))
            .collect()
    }

    pub fn layer(&self, id: &LayerId) -> Option<LayerInfo> {
        self.slots.get(id).map(|slot| self.info(id, slot))
    }

    fn info(&self, id: &LayerId, slot: &LayerSlot) -> LayerInfo {
        let feature_count = self.store.layer(id).map_or(0, |record| record.len());
        LayerInfo {
            id: id.clone(),
            label: slot.declaration.display_label().to_string(),
            geometry_type: slot.declaration.geometry,
            state: slot.state,
            feature_count,
            visible_count: self.visibility.attached_count(id),
            logical_visible: slot.state == LayerState::Displayed && self.any_logical(id),
            loading: slot.state == LayerState::Loading,
            last_error: slot.last_error.clone(),
        }
    }

    fn now(&self) -> Millis {
        self.clock.now()
    }

    fn slot(&self, layer: &LayerId) -> Result<&LayerSlot, LifecycleError> {
        self.slots
            .get(layer)
            .ok_or_else(|| LifecycleError::UnknownLayer(layer.clone()))
    }

    fn missing(&self, key: &FeatureKey) -> LifecycleError {
        if self.store.contains_layer(&key.layer) {
            StoreError::UnknownFeature(key.clone()).into()
        } else {
            StoreError::UnknownLayer(key.layer.clone()).into()
        }
    }

    fn any_logical(&self, layer: &LayerId) -> bool {
        self.store
            .features(layer)
            .any(|feature| feature.visibility().logical())
    }

    fn set_state(&mut self, layer: &LayerId, state: LayerState) {
        let Some(slot) = self.slots.get_mut(layer) else {
            return;
        };
        if slot.state == state {
            return;
        }
        if state == LayerState::Loading {
            slot.last_error = None;
        }
        info!(layer = %layer, from = %slot.state, to = %state, "layer state");
        slot.state = state;
        self.visibility.publish(LayerEvent::StateChanged {
            layer: layer.clone(),
            state,
        });
    }

    fn fail(&mut self, layer: &LayerId, message: String) {
        warn!(layer = %layer, "layer failed to load: {message}");
        self.set_state(layer, LayerState::Unloaded);
        if let Some(slot) = self.slots.get_mut(layer) {
            slot.last_error = Some(message.clone());
        }
        self.visibility.publish(LayerEvent::LoadFailed {
            layer: layer.clone(),
            message,
        });
    }

    fn ingest(&mut self, layer: &LayerId, source: &str) -> Result<AddReport, LifecycleError> {
        let declaration = self.slot(layer)?.declaration.clone();
        let raw = match scene::geojson::parse_features(source) {
            Ok(raw) => raw,
            Err(err) => {
                self.fail(layer, err.to_string());
                return Err(err.into());
            }
        };
        if let Err(err) =
            self.store
                .register_layer(layer.clone(), declaration.geometry, declaration.config)
        {
            self.fail(layer, err.to_string());
            return Err(err.into());
        }
        let report = self.store.add_features(layer, raw)?;
        self.visibility.prepare_layer(layer, &self.store);
        self.reapply_filter(layer);
        info!(
            layer = %layer,
            features = report.added.len(),
            skipped = report.skipped,
            "layer loaded"
        );
        self.set_state(layer, LayerState::Loaded);
        Ok(report)
    }

    /// Marks the layer displayed: logical state on, last zoom replayed,
    /// reconciled immediately.
    fn display(&mut self, layer: &LayerId) -> LayerState {
        let now = self.now();
        self.visibility
            .set_layer_logical(&mut self.store, layer, true, now);
        if let Some(within) = self.zoom.replay(layer) {
            self.visibility
                .apply_zoom_policy(&mut self.store, layer, within, now);
        }
        self.visibility.mount(&self.store, layer, now);
        self.visibility.flush(&self.store);
        self.set_state(layer, LayerState::Displayed);
        LayerState::Displayed
    }

    fn reapply_filter(&mut self, layer: &LayerId) {
        let Some(active) = &self.active_filter else {
            return;
        };
        if !active.query.matches_layer(layer) {
            return;
        }
        let query = FeatureQuery {
            layer_ids: Some(vec![layer.clone()]),
            geometry_types: active.query.geometry_types.clone(),
        };
        match self.filter.evaluate_store(&self.store, &query, &active.state) {
            Ok(result) => {
                let now = self.now();
                self.visibility
                    .apply_filter_result(&mut self.store, &result, now);
            }
            Err(err) => warn!(layer = %layer, "active filter not applied: {err}"),
        }
    }

    fn commit_filter(&mut self, result: &FilterResult) -> FilterSummary {
        let now = self.now();
        let changed = self
            .visibility
            .apply_filter_result(&mut self.store, result, now);
        let summary = result.summary();
        debug!(changed, ?summary, "filter applied");
        self.visibility
            .publish(LayerEvent::FilterApplied { summary });
        summary
    }
}

#[cfg(test)]
mod tests {
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;
    use std::sync::Arc;

    use super::{LayerLifecycle, LayerState, LifecycleError, LifecycleSettings, ShowTicket};
    use crate::events::LayerEvent;
    use crate::filter::FilterState;
    use crate::projections::{ToggleCommand, table_rows};
    use crate::surface::{HeadlessClusterEngine, HeadlessSurface, SurfaceObject};
    use foundation::{FeatureKey, GeometryType, LayerId, ManualClock};
    use futures_util::FutureExt;
    use futures_util::future::{self, LocalBoxFuture};
    use pretty_assertions::assert_eq;
    use profile::{
        ClusteringConfig, EngineSettings, LayerConfig, LayerDeclaration, Profile, ZoomThresholds,
    };
    use scene::{FeatureQuery, LabelState, StoreError};
    use serde_json::json;
    use streaming::{LayerLoader, LoadError, LoadOutcome};
    use tokio::sync::Notify;

    const PARKS: &str = r#"{
        "type": "FeatureCollection",
        "features": [
            { "type": "Feature", "id": "p1",
              "geometry": { "type": "Point", "coordinates": [2.35, 48.85] },
              "properties": { "name": "Dog park", "tags": ["dog"], "attrs": { "rating": 4 } } },
            { "type": "Feature", "id": "p2",
              "geometry": { "type": "Point", "coordinates": [2.36, 48.86] },
              "properties": { "name": "Picnic lawn", "tags": ["picnic"], "attrs": { "rating": 2 } } }
        ]
    }"#;

    struct Harness {
        lifecycle: LayerLifecycle,
        surface: HeadlessSurface,
        clock: Rc<ManualClock>,
    }

    fn harness() -> Harness {
        let surface = HeadlessSurface::new();
        let clock = Rc::new(ManualClock::new(0));
        let lifecycle = LayerLifecycle::new(
            Box::new(surface.clone()),
            Box::new(HeadlessClusterEngine::new()),
            clock.clone(),
            LifecycleSettings::default(),
        );
        Harness {
            lifecycle,
            surface,
            clock,
        }
    }

    fn unclustered() -> LayerConfig {
        LayerConfig {
            clustering: ClusteringConfig {
                enabled: Some(false),
                ..ClusteringConfig::default()
            },
            ..LayerConfig::default()
        }
    }

    fn parks_declaration(config: LayerConfig) -> LayerDeclaration {
        LayerDeclaration::new("parks", GeometryType::Point).with_config(config)
    }

    fn loaded_parks(config: LayerConfig) -> Harness {
        let mut h = harness();
        h.lifecycle
            .load_declaration(parks_declaration(config), PARKS)
            .unwrap();
        h
    }

    fn parks() -> LayerId {
        LayerId::new("parks")
    }

    fn key(id: &str) -> FeatureKey {
        FeatureKey::new("parks", id)
    }

    fn current(lc: &LayerLifecycle, id: &str) -> bool {
        lc.store()
            .feature_by_key(&key(id))
            .unwrap()
            .visibility()
            .current()
    }

    fn logical(lc: &LayerLifecycle, id: &str) -> bool {
        lc.store()
            .feature_by_key(&key(id))
            .unwrap()
            .visibility()
            .logical()
    }

    fn ready(ticket: ShowTicket) -> LayerState {
        match ticket {
            ShowTicket::Ready(state) => state,
            ShowTicket::Pending(p) => panic!("unexpected pending load {p:?}"),
        }
    }

    /// Loader whose fetches wait for `gate` (or never finish when `hang`).
    struct GatedLoader {
        calls: Cell<u32>,
        gate: Arc<Notify>,
        source: Result<String, LoadError>,
        hang: bool,
    }

    impl GatedLoader {
        fn new(source: Result<String, LoadError>) -> Rc<Self> {
            Rc::new(Self {
                calls: Cell::new(0),
                gate: Arc::new(Notify::new()),
                source,
                hang: false,
            })
        }

        fn hanging() -> Rc<Self> {
            Rc::new(Self {
                calls: Cell::new(0),
                gate: Arc::new(Notify::new()),
                source: Ok(String::new()),
                hang: true,
            })
        }
    }

    impl LayerLoader for GatedLoader {
        fn fetch(&self, _layer: &LayerId) -> LocalBoxFuture<'static, LoadOutcome> {
            self.calls.set(self.calls.get() + 1);
            if self.hang {
                return future::pending().boxed_local();
            }
            let gate = self.gate.clone();
            let source = self.source.clone();
            async move {
                gate.notified().await;
                source
            }
            .boxed_local()
        }
    }

    fn lazy_harness(loader: Rc<GatedLoader>) -> (RefCell<LayerLifecycle>, HeadlessSurface) {
        let h = harness();
        let mut lifecycle = h.lifecycle.with_loader(loader);
        lifecycle
            .declare(parks_declaration(unclustered()).lazy())
            .unwrap();
        (RefCell::new(lifecycle), h.surface)
    }

    #[test]
    fn show_is_idempotent() {
        let mut h = loaded_parks(unclustered());
        assert_eq!(ready(h.lifecycle.show(&parks()).unwrap()), LayerState::Displayed);
        let attached = h.surface.attached();
        let adds = h.surface.add_calls();
        let events = h.lifecycle.events().len();

        assert_eq!(ready(h.lifecycle.show(&parks()).unwrap()), LayerState::Displayed);
        assert_eq!(h.surface.attached(), attached);
        assert_eq!(h.surface.add_calls(), adds);
        assert_eq!(h.lifecycle.events().len(), events);
        assert!(logical(&h.lifecycle, "p1") && current(&h.lifecycle, "p1"));
    }

    #[test]
    fn hide_and_toggle_flip_logical_state() {
        let mut h = loaded_parks(unclustered());
        h.lifecycle.show(&parks()).unwrap();
        assert_eq!(h.lifecycle.hide(&parks()).unwrap(), LayerState::Hidden);
        assert!(!logical(&h.lifecycle, "p1"));
        assert!(!h.surface.is_attached(&SurfaceObject::Feature(key("p1"))));

        assert_eq!(ready(h.lifecycle.toggle(&parks()).unwrap()), LayerState::Displayed);
        assert!(h.surface.is_attached(&SurfaceObject::Feature(key("p1"))));
        assert_eq!(ready(h.lifecycle.toggle(&parks()).unwrap()), LayerState::Hidden);
    }

    #[test]
    fn feature_toggle_command_targets_one_feature() {
        let mut h = loaded_parks(unclustered());
        h.lifecycle.show(&parks()).unwrap();
        let command: ToggleCommand =
            serde_json::from_value(json!({ "layerId": "parks", "featureId": "p2" })).unwrap();
        h.lifecycle.apply_toggle(&command).unwrap();

        assert!(logical(&h.lifecycle, "p1"));
        assert!(!logical(&h.lifecycle, "p2"));
        assert!(!h.surface.is_attached(&SurfaceObject::Feature(key("p2"))));
        assert_eq!(h.lifecycle.layer(&parks()).unwrap().visible_count, 1);
    }

    #[test]
    fn feature_toggle_on_a_hidden_layer_draws_nothing() {
        let mut h = loaded_parks(unclustered());
        h.lifecycle.show(&parks()).unwrap();
        h.lifecycle.hide(&parks()).unwrap();

        let state = ready(
            h.lifecycle
                .apply_toggle(&ToggleCommand::feature(key("p1")))
                .unwrap(),
        );
        assert_eq!(state, LayerState::Hidden);
        assert!(logical(&h.lifecycle, "p1"));
        assert!(!h.surface.is_attached(&SurfaceObject::Feature(key("p1"))));
        let info = h.lifecycle.layer(&parks()).unwrap();
        assert!(!info.logical_visible);
        assert_eq!(info.visible_count, 0);
        assert!(table_rows(&h.lifecycle, &FeatureQuery::all(), &[]).is_empty());

        assert_eq!(ready(h.lifecycle.show(&parks()).unwrap()), LayerState::Displayed);
        assert!(h.surface.is_attached(&SurfaceObject::Feature(key("p1"))));
        assert_eq!(h.lifecycle.layer(&parks()).unwrap().visible_count, 2);
    }

    #[test]
    fn missing_feature_is_reported_as_such() {
        let mut h = loaded_parks(unclustered());
        let err = h
            .lifecycle
            .apply_toggle(&ToggleCommand::feature(key("p9")))
            .unwrap_err();
        assert!(matches!(
            err,
            LifecycleError::Store(StoreError::UnknownFeature(k)) if k == key("p9")
        ));

        let err = h
            .lifecycle
            .set_feature_visible(&FeatureKey::new("trails", "t1"), true)
            .unwrap_err();
        assert!(matches!(err, LifecycleError::Store(StoreError::UnknownLayer(_))));
    }

    #[test]
    fn label_updates_leave_identity_alone() {
        let mut h = loaded_parks(unclustered());
        let label = LabelState {
            visible: true,
            text: Some("Dog park".to_string()),
        };
        assert!(h.lifecycle.set_feature_label(&key("p1"), label.clone()));
        assert!(!h.lifecycle.set_feature_label(&key("p9"), label.clone()));

        let feature = h.lifecycle.store().feature_by_key(&key("p1")).unwrap();
        assert_eq!(feature.label(), &label);
        assert_eq!(feature.id().as_str(), "p1");
        assert_eq!(feature.property("name"), Some(&json!("Dog park")));
    }

    #[test]
    fn event_log_stays_bounded_over_a_long_session() {
        let mut h = loaded_parks(unclustered());
        for _ in 0..1_000 {
            h.lifecycle.toggle(&parks()).unwrap();
        }
        let limit = EngineSettings::default().event_log_limit;
        assert_eq!(h.lifecycle.events().len(), limit);
        assert!(matches!(
            h.lifecycle.events().last(),
            Some(LayerEvent::StateChanged { .. })
        ));
    }

    #[test]
    fn zoom_changes_current_but_never_logical() {
        let config = LayerConfig {
            zoom: Some(ZoomThresholds::new(Some(12.0), Some(16.0))),
            ..unclustered()
        };
        let mut h = loaded_parks(config);
        h.lifecycle.show(&parks()).unwrap();

        h.lifecycle.on_zoom_end(8.0);
        assert!(logical(&h.lifecycle, "p1"));
        assert!(!current(&h.lifecycle, "p1"));
        // Still inside the coalescing window.
        assert!(h.lifecycle.poll().is_none());
        h.clock.advance(250);
        let report = h.lifecycle.poll().unwrap();
        assert_eq!(report.detached.len(), 2);

        h.lifecycle.on_zoom_end(13.0);
        h.clock.advance(250);
        h.lifecycle.poll().unwrap();
        assert!(logical(&h.lifecycle, "p1") && current(&h.lifecycle, "p1"));
        assert!(h.surface.is_attached(&SurfaceObject::Feature(key("p1"))));
    }

    #[test]
    fn hidden_layer_stays_hidden_across_zoom() {
        let config = LayerConfig {
            zoom: Some(ZoomThresholds::new(Some(12.0), None)),
            ..unclustered()
        };
        let mut h = loaded_parks(config);
        h.lifecycle.show(&parks()).unwrap();
        h.lifecycle.hide(&parks()).unwrap();

        h.lifecycle.on_zoom_end(5.0);
        h.lifecycle.on_zoom_end(14.0);
        h.lifecycle.flush();
        assert!(!logical(&h.lifecycle, "p1"));
        assert!(!current(&h.lifecycle, "p1"));
        assert_eq!(h.lifecycle.layer(&parks()).unwrap().visible_count, 0);
    }

    #[test]
    fn last_zoom_is_replayed_when_a_layer_is_displayed() {
        let config = LayerConfig {
            zoom: Some(ZoomThresholds::new(Some(12.0), None)),
            ..unclustered()
        };
        let mut h = loaded_parks(config);
        h.lifecycle.on_zoom_end(5.0);
        h.lifecycle.show(&parks()).unwrap();
        assert!(logical(&h.lifecycle, "p1"));
        assert!(!current(&h.lifecycle, "p1"));
        assert!(h.surface.attached().is_empty());
        assert_eq!(h.surface.panes(), vec!["geoleaf-parks".to_string()]);
    }

    #[test]
    fn filter_then_clear_restores_every_feature() {
        let mut h = loaded_parks(unclustered());
        h.lifecycle.show(&parks()).unwrap();
        let state = FilterState::from_value(json!({
            "hasTags": true,
            "selectedTags": ["dog"],
            "hasMinRating": true,
            "minRating": 3
        }))
        .unwrap();

        let summary = h.lifecycle.apply_filter(&state, &FeatureQuery::all()).unwrap();
        assert_eq!((summary.filtered, summary.total, summary.visible), (1, 2, 1));
        assert!(current(&h.lifecycle, "p1"));
        assert!(!current(&h.lifecycle, "p2"));
        h.lifecycle.flush();
        assert!(!h.surface.is_attached(&SurfaceObject::Feature(key("p2"))));

        let cleared = h.lifecycle.clear_feature_filter(&FeatureQuery::all());
        assert_eq!(cleared.visible, cleared.total);
        h.lifecycle.flush();
        assert_eq!(h.lifecycle.layer(&parks()).unwrap().visible_count, 2);
    }

    #[test]
    fn zero_matches_is_an_empty_result_not_an_error() {
        let mut h = loaded_parks(unclustered());
        let summary = h
            .lifecycle
            .filter_features(|_| false, &FeatureQuery::all());
        assert_eq!((summary.visible, summary.total), (0, 2));
    }

    #[test]
    fn active_filter_applies_to_layers_loaded_later() {
        let mut h = harness();
        let state = FilterState::from_value(json!({ "selectedTags": ["dog"] })).unwrap();
        h.lifecycle.apply_filter(&state, &FeatureQuery::all()).unwrap();
        h.lifecycle
            .load_declaration(parks_declaration(unclustered()), PARKS)
            .unwrap();
        assert!(current(&h.lifecycle, "p1"));
        assert!(!current(&h.lifecycle, "p2"));
    }

    #[test]
    fn failed_attach_leaves_feature_detached_and_pipeline_running() {
        let mut h = loaded_parks(unclustered());
        h.surface.reject(SurfaceObject::Feature(key("p1")));
        assert_eq!(ready(h.lifecycle.show(&parks()).unwrap()), LayerState::Displayed);
        assert!(!h.surface.is_attached(&SurfaceObject::Feature(key("p1"))));
        assert!(h.surface.is_attached(&SurfaceObject::Feature(key("p2"))));
        assert_eq!(h.lifecycle.layer(&parks()).unwrap().visible_count, 1);
    }

    #[test]
    fn malformed_source_fails_only_that_layer() {
        let mut h = loaded_parks(unclustered());
        let err = h
            .lifecycle
            .load_declaration(LayerDeclaration::new("broken", GeometryType::Line), "{ nope")
            .unwrap_err();
        assert!(matches!(err, LifecycleError::Data(_)));

        let broken = h.lifecycle.layer(&LayerId::new("broken")).unwrap();
        assert_eq!(broken.state, LayerState::Unloaded);
        assert!(broken.last_error.is_some());
        assert_eq!(h.lifecycle.state(&parks()), Some(LayerState::Loaded));
        assert!(h.lifecycle.events().iter().any(|e| matches!(
            e,
            LayerEvent::LoadFailed { layer, .. } if layer.as_str() == "broken"
        )));
    }

    #[test]
    fn loading_twice_is_a_duplicate() {
        let mut h = loaded_parks(unclustered());
        let err = h.lifecycle.load(&parks(), PARKS).unwrap_err();
        assert!(matches!(err, LifecycleError::Store(_)));
    }

    #[test]
    fn unload_detaches_then_purges() {
        let mut h = loaded_parks(LayerConfig::default());
        h.lifecycle.show(&parks()).unwrap();
        assert_eq!(h.lifecycle.layer(&parks()).unwrap().visible_count, 2);

        assert_eq!(h.lifecycle.unload(&parks()).unwrap(), LayerState::Unloaded);
        assert_eq!(h.lifecycle.store().feature_count(), 0);
        assert_eq!(h.lifecycle.visibility().clusters().groups().count(), 0);
        assert!(h.surface.attached().is_empty());
    }

    #[test]
    fn show_without_loader_reports_it() {
        let mut h = harness();
        h.lifecycle
            .declare(parks_declaration(unclustered()).lazy())
            .unwrap();
        let err = h.lifecycle.show(&parks()).unwrap_err();
        assert!(matches!(err, LifecycleError::Load(LoadError::NoLoader(_))));
        assert_eq!(h.lifecycle.state(&parks()), Some(LayerState::Unloaded));
    }

    #[test]
    fn profile_declarations_become_unloaded_layers() {
        let mut h = harness();
        let profile = Profile::from_value(json!({
            "layers": [
                { "id": "parks", "label": "Parks", "geometry": "poi" },
                { "id": "trails", "geometry": "route", "lazy": true }
            ]
        }));
        assert_eq!(h.lifecycle.declare_from_profile(&profile).unwrap(), 2);
        let layers = h.lifecycle.layers();
        assert_eq!(layers.len(), 2);
        assert_eq!(layers[0].label, "Parks");
        assert_eq!(layers[1].geometry_type, GeometryType::Line);
        assert!(layers.iter().all(|l| l.state == LayerState::Unloaded));
    }

    #[tokio::test]
    async fn concurrent_lazy_shows_share_one_fetch() {
        let loader = GatedLoader::new(Ok(PARKS.to_string()));
        let (cell, surface) = lazy_harness(loader.clone());
        let id = parks();

        let release = async {
            tokio::task::yield_now().await;
            assert_eq!(cell.borrow().state(&id), Some(LayerState::Loading));
            assert!(cell.borrow().layer(&id).unwrap().loading);
            loader.gate.notify_one();
        };
        let (a, b, ()) = futures_util::join!(
            LayerLifecycle::show_and_wait(&cell, &id),
            LayerLifecycle::show_and_wait(&cell, &id),
            release
        );

        assert_eq!(a.unwrap(), LayerState::Displayed);
        assert_eq!(b.unwrap(), LayerState::Displayed);
        assert_eq!(loader.calls.get(), 1);
        assert_eq!(cell.borrow().fetches_started(), 1);
        assert_eq!(surface.attached().len(), 2);

        let transitions: Vec<LayerState> = cell
            .borrow()
            .events()
            .iter()
            .filter_map(|e| match e {
                LayerEvent::StateChanged { state, .. } => Some(*state),
                _ => None,
            })
            .collect();
        assert_eq!(
            transitions,
            vec![LayerState::Loading, LayerState::Loaded, LayerState::Displayed]
        );
    }

    #[tokio::test]
    async fn failed_lazy_load_returns_to_unloaded() {
        let loader = GatedLoader::new(Err(LoadError::Fetch("503".to_string())));
        let (cell, _surface) = lazy_harness(loader.clone());
        let id = parks();

        loader.gate.notify_one();
        let err = LayerLifecycle::show_and_wait(&cell, &id).await.unwrap_err();
        assert!(matches!(err, LifecycleError::Load(LoadError::Fetch(_))));

        let info = cell.borrow().layer(&id).unwrap();
        assert_eq!(info.state, LayerState::Unloaded);
        assert!(!info.loading);
        assert!(info.last_error.is_some());
    }

    #[tokio::test]
    async fn coalesced_waiters_all_see_a_malformed_source() {
        let loader = GatedLoader::new(Ok("{ nope".to_string()));
        let (cell, _surface) = lazy_harness(loader.clone());
        let id = parks();

        let release = async {
            tokio::task::yield_now().await;
            loader.gate.notify_one();
        };
        let (a, b, ()) = futures_util::join!(
            LayerLifecycle::show_and_wait(&cell, &id),
            LayerLifecycle::show_and_wait(&cell, &id),
            release
        );

        let errors = [a.unwrap_err(), b.unwrap_err()];
        assert!(errors.iter().any(|e| matches!(e, LifecycleError::Data(_))));
        assert!(errors.iter().any(|e| matches!(e, LifecycleError::Failed(..))));
        assert_eq!(loader.calls.get(), 1);
        assert_eq!(cell.borrow().state(&id), Some(LayerState::Unloaded));
    }

    #[tokio::test]
    async fn unload_aborts_an_in_flight_load() {
        let loader = GatedLoader::hanging();
        let (cell, surface) = lazy_harness(loader.clone());
        let id = parks();

        let unload = async {
            tokio::task::yield_now().await;
            assert!(cell.borrow().is_loading(&id));
            cell.borrow_mut().unload(&id).unwrap();
        };
        let (shown, ()) = futures_util::join!(LayerLifecycle::show_and_wait(&cell, &id), unload);

        assert!(matches!(shown, Err(LifecycleError::Load(LoadError::Aborted))));
        let lc = cell.borrow();
        assert_eq!(lc.state(&id), Some(LayerState::Unloaded));
        assert!(!lc.is_loading(&id));
        assert_eq!(lc.store().feature_count(), 0);
        assert!(surface.attached().is_empty());
    }

    #[test]
    fn toggling_a_loading_layer_is_refused() {
        let loader = GatedLoader::hanging();
        let (cell, _surface) = lazy_harness(loader);
        let id = parks();
        let ticket = cell.borrow_mut().show(&id).unwrap();
        assert!(matches!(ticket, ShowTicket::Pending(_)));
        assert!(matches!(
            cell.borrow_mut().toggle(&id),
            Err(LifecycleError::Busy(_))
        ));
        let joined = cell.borrow_mut().show(&id).unwrap();
        assert!(matches!(joined, ShowTicket::Pending(_)));
        assert_eq!(cell.borrow().fetches_started(), 1);
    }
}
