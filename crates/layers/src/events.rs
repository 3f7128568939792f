use foundation::LayerId;

use crate::filter::FilterSummary;
use crate::lifecycle::LayerState;

/// Published state changes. UI projections re-render on these and never
/// read the map surface directly.
#[derive(Debug, Clone, PartialEq)]
pub enum LayerEvent {
    /// A reconcile batch changed what is drawn for these layers.
    LayersChanged { layers: Vec<LayerId> },
    StateChanged { layer: LayerId, state: LayerState },
    LoadFailed { layer: LayerId, message: String },
    FilterApplied { summary: FilterSummary },
}
