use std::collections::BTreeMap;

use foundation::LayerId;
use profile::ZoomThresholds;

/// Declared min/max zoom per layer plus the last zoom-end seen.
///
/// The policy only answers "within threshold?"; it never touches logical
/// visibility. Layers without bounds are always within range and are not
/// tracked.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ZoomVisibilityPolicy {
    thresholds: BTreeMap<LayerId, ZoomThresholds>,
    last_zoom: Option<f64>,
}

impl ZoomVisibilityPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, layer: &LayerId, thresholds: Option<ZoomThresholds>) {
        match thresholds.filter(ZoomThresholds::is_bounded) {
            Some(t) => {
                self.thresholds.insert(layer.clone(), t);
            }
            None => {
                self.thresholds.remove(layer);
            }
        }
    }

    pub fn thresholds(&self, layer: &LayerId) -> Option<&ZoomThresholds> {
        self.thresholds.get(layer)
    }

    pub fn last_zoom(&self) -> Option<f64> {
        self.last_zoom
    }

    pub fn within(&self, layer: &LayerId, zoom: f64) -> bool {
        self.thresholds
            .get(layer)
            .is_none_or(|t| t.contains(zoom))
    }

    /// Records the zoom and returns `(layer, within)` for every bounded layer.
    pub fn on_zoom_end(&mut self, zoom: f64) -> Vec<(LayerId, bool)> {
        self.last_zoom = Some(zoom);
        self.thresholds
            .iter()
            .map(|(layer, t)| (layer.clone(), t.contains(zoom)))
            .collect()
    }

    /// Verdict for a layer displayed after the last zoom-end, if any applies.
    pub fn replay(&self, layer: &LayerId) -> Option<bool> {
        let zoom = self.last_zoom?;
        let t = self.thresholds.get(layer)?;
        Some(t.contains(zoom))
    }
}
