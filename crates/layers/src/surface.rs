//! Seams to the map-rendering engine.
//!
//! The engine itself is out of scope; these traits are what the visibility
//! manager drives. Only the visibility manager (directly or through the
//! cluster coordinator) may call them.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::rc::Rc;

use foundation::FeatureKey;

use crate::cluster::ClusterGroupId;

/// Something that can be attached to the map surface.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SurfaceObject {
    Feature(FeatureKey),
    ClusterGroup(ClusterGroupId),
}

impl fmt::Display for SurfaceObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Feature(key) => write!(f, "feature {key}"),
            Self::ClusterGroup(group) => write!(f, "cluster group {group}"),
        }
    }
}

/// The engine refused an add/remove.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AttachError {
    #[error("map surface rejected {object}: {reason}")]
    Surface { object: SurfaceObject, reason: String },
    #[error("cluster group {group} rejected {feature}: {reason}")]
    Cluster {
        group: ClusterGroupId,
        feature: FeatureKey,
        reason: String,
    },
}

/// Map surface adapter.
///
/// `remove_layer` on an object that is not attached must be a no-op, not an
/// error.
pub trait MapSurface {
    fn add_layer(&mut self, object: &SurfaceObject) -> Result<(), AttachError>;
    fn remove_layer(&mut self, object: &SurfaceObject) -> Result<(), AttachError>;
    fn has_layer(&self, object: &SurfaceObject) -> bool;
    fn create_pane(&mut self, name: &str);
}

/// Marker-cluster engine adapter.
pub trait ClusterEngine {
    fn add_layer(&mut self, group: &ClusterGroupId, marker: &FeatureKey) -> Result<(), AttachError>;
    fn remove_layer(
        &mut self,
        group: &ClusterGroupId,
        marker: &FeatureKey,
    ) -> Result<(), AttachError>;
}

/// One recorded adapter call, in issue order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdapterCall {
    Add(SurfaceObject),
    Remove(SurfaceObject),
}

#[derive(Debug, Default)]
struct HeadlessSurfaceState {
    attached: BTreeSet<SurfaceObject>,
    calls: Vec<AdapterCall>,
    panes: Vec<String>,
    rejected: BTreeSet<SurfaceObject>,
    add_calls: usize,
    remove_calls: usize,
}

/// In-memory map surface for headless runs and tests.
///
/// Clones share state, so a caller can keep a handle after boxing one copy
/// into the engine.
#[derive(Debug, Clone, Default)]
pub struct HeadlessSurface {
    state: Rc<RefCell<HeadlessSurfaceState>>,
}

impl HeadlessSurface {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every later add/remove of `object` fail.
    pub fn reject(&self, object: SurfaceObject) {
        self.state.borrow_mut().rejected.insert(object);
    }

    pub fn accept(&self, object: &SurfaceObject) {
        self.state.borrow_mut().rejected.remove(object);
    }

    pub fn attached(&self) -> Vec<SurfaceObject> {
        self.state.borrow().attached.iter().cloned().collect()
    }

    pub fn is_attached(&self, object: &SurfaceObject) -> bool {
        self.state.borrow().attached.contains(object)
    }

    pub fn panes(&self) -> Vec<String> {
        self.state.borrow().panes.clone()
    }

    pub fn add_calls(&self) -> usize {
        self.state.borrow().add_calls
    }

    pub fn remove_calls(&self) -> usize {
        self.state.borrow().remove_calls
    }

    pub fn calls(&self) -> Vec<AdapterCall> {
        self.state.borrow().calls.clone()
    }
}

impl MapSurface for HeadlessSurface {
    fn add_layer(&mut self, object: &SurfaceObject) -> Result<(), AttachError> {
        let mut state = self.state.borrow_mut();
        state.add_calls += 1;
        state.calls.push(AdapterCall::Add(object.clone()));
        if state.rejected.contains(object) {
            return Err(AttachError::Surface {
                object: object.clone(),
                reason: "rejected by headless surface".to_string(),
            });
        }
        state.attached.insert(object.clone());
        Ok(())
    }

    fn remove_layer(&mut self, object: &SurfaceObject) -> Result<(), AttachError> {
        let mut state = self.state.borrow_mut();
        state.remove_calls += 1;
        state.calls.push(AdapterCall::Remove(object.clone()));
        if state.rejected.contains(object) {
            return Err(AttachError::Surface {
                object: object.clone(),
                reason: "rejected by headless surface".to_string(),
            });
        }
        state.attached.remove(object);
        Ok(())
    }

    fn has_layer(&self, object: &SurfaceObject) -> bool {
        self.is_attached(object)
    }

    fn create_pane(&mut self, name: &str) {
        let mut state = self.state.borrow_mut();
        if !state.panes.iter().any(|p| p == name) {
            state.panes.push(name.to_string());
        }
    }
}

#[derive(Debug, Default)]
struct HeadlessClusterState {
    members: BTreeMap<ClusterGroupId, BTreeSet<FeatureKey>>,
    calls: Vec<AdapterCall>,
    rejected: BTreeSet<FeatureKey>,
    add_calls: usize,
    remove_calls: usize,
}

/// In-memory cluster engine; clones share state like [`HeadlessSurface`].
#[derive(Debug, Clone, Default)]
pub struct HeadlessClusterEngine {
    state: Rc<RefCell<HeadlessClusterState>>,
}

impl HeadlessClusterEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reject(&self, marker: FeatureKey) {
        self.state.borrow_mut().rejected.insert(marker);
    }

    pub fn accept(&self, marker: &FeatureKey) {
        self.state.borrow_mut().rejected.remove(marker);
    }

    pub fn members(&self, group: &ClusterGroupId) -> Vec<FeatureKey> {
        self.state
            .borrow()
            .members
            .get(group)
            .map(|m| m.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Groups currently holding `marker`.
    pub fn groups_of(&self, marker: &FeatureKey) -> Vec<ClusterGroupId> {
        self.state
            .borrow()
            .members
            .iter()
            .filter(|(_, members)| members.contains(marker))
            .map(|(group, _)| group.clone())
            .collect()
    }

    pub fn add_calls(&self) -> usize {
        self.state.borrow().add_calls
    }

    pub fn remove_calls(&self) -> usize {
        self.state.borrow().remove_calls
    }

    /// Marker adds/removes in issue order, recorded as feature objects.
    pub fn calls(&self) -> Vec<AdapterCall> {
        self.state.borrow().calls.clone()
    }
}

impl ClusterEngine for HeadlessClusterEngine {
    fn add_layer(&mut self, group: &ClusterGroupId, marker: &FeatureKey) -> Result<(), AttachError> {
        let mut state = self.state.borrow_mut();
        state.add_calls += 1;
        state.calls.push(AdapterCall::Add(SurfaceObject::Feature(marker.clone())));
        if state.rejected.contains(marker) {
            return Err(AttachError::Cluster {
                group: group.clone(),
                feature: marker.clone(),
                reason: "rejected by headless cluster engine".to_string(),
            });
        }
        state
            .members
            .entry(group.clone())
            .or_default()
            .insert(marker.clone());
        Ok(())
    }

    fn remove_layer(
        &mut self,
        group: &ClusterGroupId,
        marker: &FeatureKey,
    ) -> Result<(), AttachError> {
        let mut state = self.state.borrow_mut();
        state.remove_calls += 1;
        state.calls.push(AdapterCall::Remove(SurfaceObject::Feature(marker.clone())));
        if state.rejected.contains(marker) {
            return Err(AttachError::Cluster {
                group: group.clone(),
                feature: marker.clone(),
                reason: "rejected by headless cluster engine".to_string(),
            });
        }
        if let Some(members) = state.members.get_mut(group) {
            members.remove(marker);
        }
        Ok(())
    }
}
