use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use foundation::{FeatureKey, GeometryType, LayerId};
use profile::{ClusteringConfig, PoiSettings};
use tracing::{debug, warn};

use crate::surface::{AttachError, ClusterEngine, MapSurface, SurfaceObject};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ClusterGroupId {
    /// Pool shared by every layer that opts into it, keyed by pool name.
    Shared(String),
    /// Group owned by a single layer.
    Private(LayerId),
}

impl fmt::Display for ClusterGroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Shared(key) => write!(f, "shared:{key}"),
            Self::Private(layer) => write!(f, "layer:{layer}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterStrategy {
    Unclustered,
    Shared(String),
    Private,
}

impl ClusterStrategy {
    /// Layer config wins over the global POI settings; only point (or mixed)
    /// layers are ever clustered.
    pub fn decide(geometry: GeometryType, config: &ClusteringConfig, poi: &PoiSettings) -> Self {
        if !matches!(geometry, GeometryType::Point | GeometryType::Mixed) {
            return Self::Unclustered;
        }
        if !config.enabled.unwrap_or(poi.clustering) {
            return Self::Unclustered;
        }
        if config.shared.unwrap_or(poi.shared_cluster) {
            Self::Shared(poi.shared_cluster_key.clone())
        } else {
            Self::Private
        }
    }

    pub fn group_id(&self, layer: &LayerId) -> Option<ClusterGroupId> {
        match self {
            Self::Unclustered => None,
            Self::Shared(key) => Some(ClusterGroupId::Shared(key.clone())),
            Self::Private => Some(ClusterGroupId::Private(layer.clone())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterGroup {
    id: ClusterGroupId,
    layers: BTreeSet<LayerId>,
    members: BTreeSet<FeatureKey>,
}

impl ClusterGroup {
    fn new(id: ClusterGroupId) -> Self {
        Self {
            id,
            layers: BTreeSet::new(),
            members: BTreeSet::new(),
        }
    }

    pub fn id(&self) -> &ClusterGroupId {
        &self.id
    }

    pub fn shared_key(&self) -> Option<&str> {
        match &self.id {
            ClusterGroupId::Shared(key) => Some(key),
            ClusterGroupId::Private(_) => None,
        }
    }

    pub fn layers(&self) -> &BTreeSet<LayerId> {
        &self.layers
    }

    pub fn members(&self) -> &BTreeSet<FeatureKey> {
        &self.members
    }
}

/// Owns cluster groups and the authoritative feature -> group membership.
///
/// `attach`/`detach` are idempotent and only reach the engine when membership
/// actually has to change. A feature is a member of at most one group.
pub struct ClusterCoordinator {
    engine: Box<dyn ClusterEngine>,
    settings: PoiSettings,
    strategies: BTreeMap<LayerId, ClusterStrategy>,
    groups: BTreeMap<ClusterGroupId, ClusterGroup>,
    membership: BTreeMap<FeatureKey, ClusterGroupId>,
}

impl fmt::Debug for ClusterCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterCoordinator")
            .field("settings", &self.settings)
            .field("strategies", &self.strategies)
            .field("groups", &self.groups.keys().collect::<Vec<_>>())
            .field("members", &self.membership.len())
            .finish_non_exhaustive()
    }
}

impl ClusterCoordinator {
    pub fn new(engine: Box<dyn ClusterEngine>, settings: PoiSettings) -> Self {
        Self {
            engine,
            settings,
            strategies: BTreeMap::new(),
            groups: BTreeMap::new(),
            membership: BTreeMap::new(),
        }
    }

    /// Fixes the layer's strategy. Called once per load.
    pub fn decide(
        &mut self,
        layer: &LayerId,
        geometry: GeometryType,
        config: &ClusteringConfig,
    ) -> ClusterStrategy {
        let strategy = ClusterStrategy::decide(geometry, config, &self.settings);
        debug!(layer = %layer, ?strategy, "cluster strategy");
        self.strategies.insert(layer.clone(), strategy.clone());
        strategy
    }

    pub fn strategy(&self, layer: &LayerId) -> Option<&ClusterStrategy> {
        self.strategies.get(layer)
    }

    pub fn group_id_for(&self, layer: &LayerId) -> Option<ClusterGroupId> {
        self.strategies.get(layer)?.group_id(layer)
    }

    pub fn is_clustered(&self, layer: &LayerId) -> bool {
        self.group_id_for(layer).is_some()
    }

    pub fn group(&self, id: &ClusterGroupId) -> Option<&ClusterGroup> {
        self.groups.get(id)
    }

    pub fn groups(&self) -> impl Iterator<Item = &ClusterGroup> {
        self.groups.values()
    }

    pub fn is_attached(&self, key: &FeatureKey) -> bool {
        self.membership.contains_key(key)
    }

    /// Keys of the layer that are currently members of a group.
    pub fn attached_keys(&self, layer: &LayerId) -> Vec<FeatureKey> {
        self.membership
            .keys()
            .filter(|key| &key.layer == layer)
            .cloned()
            .collect()
    }

    /// Creates the layer's group on first display and puts it on the map.
    pub fn open_layer(
        &mut self,
        layer: &LayerId,
        surface: &mut dyn MapSurface,
    ) -> Option<ClusterGroupId> {
        let id = self.group_id_for(layer)?;
        let group = self
            .groups
            .entry(id.clone())
            .or_insert_with(|| ClusterGroup::new(id.clone()));
        group.layers.insert(layer.clone());

        let object = SurfaceObject::ClusterGroup(id.clone());
        if !surface.has_layer(&object)
            && let Err(err) = surface.add_layer(&object)
        {
            warn!(group = %id, "cluster group not attached: {err}");
        }
        Some(id)
    }

    /// Detaches the layer's members and drops the layer from its group. The
    /// group itself is destroyed once no layer and no member is left.
    pub fn close_layer(&mut self, layer: &LayerId, surface: &mut dyn MapSurface) -> usize {
        let mut detached = 0;
        for key in self.attached_keys(layer) {
            match self.detach(&key) {
                Ok(true) => detached += 1,
                Ok(false) => {}
                Err(err) => warn!(feature = %key, "detach failed while closing layer: {err}"),
            }
        }

        if let Some(id) = self.group_id_for(layer)
            && let Some(group) = self.groups.get_mut(&id)
        {
            group.layers.remove(layer);
            if group.layers.is_empty() && group.members.is_empty() {
                self.groups.remove(&id);
                if let Err(err) = surface.remove_layer(&SurfaceObject::ClusterGroup(id.clone())) {
                    warn!(group = %id, "cluster group not removed: {err}");
                }
            }
        }
        self.strategies.remove(layer);
        detached
    }

    /// Adds the feature to its layer's group. `Ok(false)` when there was
    /// nothing to do.
    pub fn attach(&mut self, key: &FeatureKey) -> Result<bool, AttachError> {
        let Some(target) = self.group_id_for(&key.layer) else {
            return Ok(false);
        };
        if let Some(current) = self.membership.get(key) {
            if *current == target {
                return Ok(false);
            }
            self.detach(key)?;
        }

        self.engine.add_layer(&target, key)?;
        self.groups
            .entry(target.clone())
            .or_insert_with(|| ClusterGroup::new(target.clone()))
            .members
            .insert(key.clone());
        self.membership.insert(key.clone(), target);
        Ok(true)
    }

    /// Removes the feature from whatever group holds it. `Ok(false)` when it
    /// was not a member.
    pub fn detach(&mut self, key: &FeatureKey) -> Result<bool, AttachError> {
        let Some(group) = self.membership.get(key).cloned() else {
            return Ok(false);
        };
        self.engine.remove_layer(&group, key)?;
        self.membership.remove(key);
        if let Some(g) = self.groups.get_mut(&group) {
            g.members.remove(key);
        }
        Ok(true)
    }
}
