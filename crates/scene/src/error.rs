use foundation::{FeatureKey, LayerId};

/// A layer source that cannot be turned into features at all.
#[derive(Debug, thiserror::Error)]
pub enum DataError {
    #[error("layer source is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unsupported GeoJSON root: expected FeatureCollection, Feature or array, got {0}")]
    UnsupportedRoot(String),
    #[error("FeatureCollection has no `features` array")]
    MissingFeatures,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("layer `{0}` is already registered")]
    DuplicateLayer(LayerId),
    #[error("unknown layer `{0}`")]
    UnknownLayer(LayerId),
    #[error("unknown feature `{0}`")]
    UnknownFeature(FeatureKey),
}

/// Why a single feature was skipped while loading.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GeometryError {
    #[error("feature is not a JSON object")]
    NotAnObject,
    #[error("feature has no geometry")]
    Missing,
    #[error("unsupported geometry type `{0}`")]
    UnsupportedType(String),
    #[error("malformed coordinates for {0}")]
    Coordinates(&'static str),
}
