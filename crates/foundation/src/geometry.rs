use std::fmt;

use serde::{Deserialize, Serialize};

/// Geometry family of a layer or a feature.
///
/// Profiles may use the aliases `poi`, `route` and `area`; see
/// [`GeometryType::parse`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GeometryType {
    #[serde(alias = "poi")]
    Point,
    #[serde(alias = "route")]
    Line,
    #[serde(alias = "area")]
    Polygon,
    Mixed,
}

impl GeometryType {
    /// Parses a geometry name, normalizing aliases (`poi` -> point,
    /// `route` -> line, `area` -> polygon). Case-insensitive.
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "point" | "points" | "poi" | "marker" => Some(Self::Point),
            "line" | "lines" | "route" | "routes" | "linestring" => Some(Self::Line),
            "polygon" | "polygons" | "area" | "areas" => Some(Self::Polygon),
            "mixed" => Some(Self::Mixed),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Point => "point",
            Self::Line => "line",
            Self::Polygon => "polygon",
            Self::Mixed => "mixed",
        }
    }

    /// Whether a feature of geometry `other` belongs to a selection of `self`.
    ///
    /// `Mixed` matches everything.
    pub fn matches(self, other: Self) -> bool {
        self == Self::Mixed || other == Self::Mixed || self == other
    }
}

impl fmt::Display for GeometryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
