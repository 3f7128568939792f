use foundation::{FeatureId, FeatureKey, GeometryType, LatLng, LayerId};
use serde_json::{Map, Value};

use crate::error::GeometryError;
use crate::visibility::VisibilityState;

/// Parsed GeoJSON geometry. Positions are stored as `LatLng` (GeoJSON order
/// is `[lng, lat]`).
#[derive(Debug, Clone, PartialEq)]
pub enum Geometry {
    Point(LatLng),
    MultiPoint(Vec<LatLng>),
    LineString(Vec<LatLng>),
    MultiLineString(Vec<Vec<LatLng>>),
    Polygon(Vec<Vec<LatLng>>),
    MultiPolygon(Vec<Vec<Vec<LatLng>>>),
}

impl Geometry {
    pub fn geometry_type(&self) -> GeometryType {
        match self {
            Self::Point(_) | Self::MultiPoint(_) => GeometryType::Point,
            Self::LineString(_) | Self::MultiLineString(_) => GeometryType::Line,
            Self::Polygon(_) | Self::MultiPolygon(_) => GeometryType::Polygon,
        }
    }

    /// First vertex, used as the feature's anchor when nothing better exists.
    pub fn first_position(&self) -> Option<LatLng> {
        match self {
            Self::Point(p) => Some(*p),
            Self::MultiPoint(ps) | Self::LineString(ps) => ps.first().copied(),
            Self::MultiLineString(lines) | Self::Polygon(lines) => {
                lines.iter().find_map(|l| l.first().copied())
            }
            Self::MultiPolygon(polys) => polys
                .iter()
                .flat_map(|rings| rings.iter())
                .find_map(|r| r.first().copied()),
        }
    }

    pub fn from_geojson(value: &Value) -> Result<Self, GeometryError> {
        let Some(obj) = value.as_object() else {
            return Err(GeometryError::Missing);
        };
        let kind = obj
            .get("type")
            .and_then(Value::as_str)
            .ok_or(GeometryError::Missing)?;
        let coords = obj.get("coordinates");

        match kind {
            "Point" => Ok(Self::Point(
                coords.and_then(position).ok_or(GeometryError::Coordinates("Point"))?,
            )),
            "MultiPoint" => Ok(Self::MultiPoint(
                coords
                    .and_then(positions)
                    .ok_or(GeometryError::Coordinates("MultiPoint"))?,
            )),
            "LineString" => {
                let line = coords
                    .and_then(positions)
                    .filter(|l| l.len() >= 2)
                    .ok_or(GeometryError::Coordinates("LineString"))?;
                Ok(Self::LineString(line))
            }
            "MultiLineString" => Ok(Self::MultiLineString(
                coords
                    .and_then(|c| nested(c, positions))
                    .ok_or(GeometryError::Coordinates("MultiLineString"))?,
            )),
            "Polygon" => Ok(Self::Polygon(
                coords
                    .and_then(|c| nested(c, positions))
                    .filter(|rings| !rings.is_empty())
                    .ok_or(GeometryError::Coordinates("Polygon"))?,
            )),
            "MultiPolygon" => Ok(Self::MultiPolygon(
                coords
                    .and_then(|c| nested(c, |p| nested(p, positions)))
                    .ok_or(GeometryError::Coordinates("MultiPolygon"))?,
            )),
            other => Err(GeometryError::UnsupportedType(other.to_string())),
        }
    }
}

fn position(value: &Value) -> Option<LatLng> {
    let arr = value.as_array()?;
    if arr.len() < 2 {
        return None;
    }
    let lng = arr[0].as_f64()?;
    let lat = arr[1].as_f64()?;
    let p = LatLng::new(lat, lng);
    p.is_valid().then_some(p)
}

fn positions(value: &Value) -> Option<Vec<LatLng>> {
    nested(value, position)
}

fn nested<T>(value: &Value, inner: impl Fn(&Value) -> Option<T>) -> Option<Vec<T>> {
    value.as_array()?.iter().map(inner).collect()
}

/// Cached label display state, refreshed by theme application.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelState {
    pub visible: bool,
    pub text: Option<String>,
}

/// One loaded feature.
///
/// Identity (`id`, `layer_id`, `geometry`, `properties`) is fixed at load
/// time; only style, label and visibility state change afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct Feature {
    id: FeatureId,
    layer_id: LayerId,
    geometry: Geometry,
    properties: Map<String, Value>,
    style: Option<Value>,
    label: LabelState,
    visibility: VisibilityState,
}

impl Feature {
    pub fn new(
        id: FeatureId,
        layer_id: LayerId,
        geometry: Geometry,
        properties: Map<String, Value>,
    ) -> Self {
        Self {
            id,
            layer_id,
            geometry,
            properties,
            style: None,
            label: LabelState::default(),
            visibility: VisibilityState::new(),
        }
    }

    pub fn id(&self) -> &FeatureId {
        &self.id
    }

    pub fn layer_id(&self) -> &LayerId {
        &self.layer_id
    }

    pub fn key(&self) -> FeatureKey {
        FeatureKey::new(self.layer_id.clone(), self.id.clone())
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    pub fn geometry_type(&self) -> GeometryType {
        self.geometry.geometry_type()
    }

    pub fn properties(&self) -> &Map<String, Value> {
        &self.properties
    }

    pub fn property(&self, name: &str) -> Option<&Value> {
        self.properties.get(name)
    }

    pub fn style(&self) -> Option<&Value> {
        self.style.as_ref()
    }

    pub fn set_style(&mut self, style: Option<Value>) {
        self.style = style;
    }

    pub fn label(&self) -> &LabelState {
        &self.label
    }

    pub fn set_label(&mut self, label: LabelState) {
        self.label = label;
    }

    pub fn visibility(&self) -> &VisibilityState {
        &self.visibility
    }

    /// Mutable visibility state. Reserved for the visibility manager; other
    /// callers go through the lifecycle's show/hide operations.
    pub fn visibility_mut(&mut self) -> &mut VisibilityState {
        &mut self.visibility
    }
}

#[cfg(test)]
mod tests {
    use super::Geometry;
    use crate::error::GeometryError;
    use foundation::{GeometryType, LatLng};
    use serde_json::json;

    #[test]
    fn parses_point_in_lng_lat_order() {
        let g = Geometry::from_geojson(&json!({ "type": "Point", "coordinates": [2.35, 48.85] }))
            .unwrap();
        assert_eq!(g, Geometry::Point(LatLng::new(48.85, 2.35)));
        assert_eq!(g.geometry_type(), GeometryType::Point);
    }

    #[test]
    fn parses_polygon_and_reports_first_position() {
        let g = Geometry::from_geojson(&json!({
            "type": "Polygon",
            "coordinates": [[[0.0, 0.0], [1.0, 0.0], [1.0, 1.0], [0.0, 0.0]]]
        }))
        .unwrap();
        assert_eq!(g.geometry_type(), GeometryType::Polygon);
        assert_eq!(g.first_position(), Some(LatLng::new(0.0, 0.0)));
    }

    #[test]
    fn rejects_degenerate_lines_and_bad_positions() {
        let line = json!({ "type": "LineString", "coordinates": [[0.0, 0.0]] });
        assert_eq!(
            Geometry::from_geojson(&line),
            Err(GeometryError::Coordinates("LineString"))
        );

        let out_of_range = json!({ "type": "Point", "coordinates": [0.0, 120.0] });
        assert!(Geometry::from_geojson(&out_of_range).is_err());

        let unknown = json!({ "type": "Circle", "coordinates": [0.0, 0.0] });
        assert_eq!(
            Geometry::from_geojson(&unknown),
            Err(GeometryError::UnsupportedType("Circle".to_string()))
        );
    }
}
