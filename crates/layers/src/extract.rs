//! Ordered field extractors for loosely shaped feature properties.
//!
//! Source data spells coordinates, ratings and taxonomy in several ways. Each
//! lookup is an explicit list of sources tried in order; the first one that
//! resolves wins. The order is part of the data contract.

use foundation::{GeometryType, LatLng};
use scene::Feature;
use serde_json::{Map, Value};

/// Containers that may hold nested attribute objects.
const ATTRIBUTE_KEYS: [&str; 2] = ["attributes", "attrs"];

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CoordinateSource {
    /// `latlng` as `[lat, lng]` or `{lat, lng}`.
    LatLngField,
    /// Flattened `lat` / `lng`.
    FlatLatLng,
    /// Flattened `latitude` / `longitude`.
    FlatLatitudeLongitude,
    /// Flattened `lat` / `lon`.
    FlatLatLon,
    /// First position of the GeoJSON geometry.
    Geometry,
}

pub const COORDINATE_SOURCES: [CoordinateSource; 5] = [
    CoordinateSource::LatLngField,
    CoordinateSource::FlatLatLng,
    CoordinateSource::FlatLatitudeLongitude,
    CoordinateSource::FlatLatLon,
    CoordinateSource::Geometry,
];

impl CoordinateSource {
    pub fn extract(self, feature: &Feature) -> Option<LatLng> {
        let props = feature.properties();
        let position = match self {
            Self::LatLngField => match props.get("latlng")? {
                Value::Array(pair) if pair.len() >= 2 => {
                    LatLng::new(number(&pair[0])?, number(&pair[1])?)
                }
                Value::Object(obj) => LatLng::new(number(obj.get("lat")?)?, number(obj.get("lng")?)?),
                _ => return None,
            },
            Self::FlatLatLng => flat_pair(props, "lat", "lng")?,
            Self::FlatLatitudeLongitude => flat_pair(props, "latitude", "longitude")?,
            Self::FlatLatLon => flat_pair(props, "lat", "lon")?,
            Self::Geometry => feature.geometry().first_position()?,
        };
        position.is_valid().then_some(position)
    }
}

pub fn resolve_coordinates(feature: &Feature) -> Option<(CoordinateSource, LatLng)> {
    COORDINATE_SOURCES
        .iter()
        .find_map(|source| source.extract(feature).map(|pos| (*source, pos)))
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RatingSource {
    /// `{rating}` object under `attributes` or `attrs`.
    AttributeObject,
    /// Mean of a `reviews: [{rating}]` array, top level or under attributes.
    ReviewAverage,
    /// Scalar `rating` property (number or numeric string).
    Scalar,
}

pub const RATING_SOURCES: [RatingSource; 3] = [
    RatingSource::AttributeObject,
    RatingSource::ReviewAverage,
    RatingSource::Scalar,
];

impl RatingSource {
    pub fn extract(self, feature: &Feature) -> Option<f64> {
        let props = feature.properties();
        match self {
            Self::AttributeObject => attribute_objects(props).find_map(|attrs| number(attrs.get("rating")?)),
            Self::ReviewAverage => std::iter::once(props)
                .chain(attribute_objects(props))
                .find_map(|obj| average_rating(obj.get("reviews")?)),
            Self::Scalar => number(props.get("rating")?),
        }
    }
}

pub fn resolve_rating(feature: &Feature) -> Option<(RatingSource, f64)> {
    RATING_SOURCES
        .iter()
        .find_map(|source| source.extract(feature).map(|rating| (*source, rating)))
}

/// Tags from `tags`, falling back to `attributes.tags` / `attrs.tags`.
pub fn tags(feature: &Feature) -> Vec<String> {
    let props = feature.properties();
    std::iter::once(props)
        .chain(attribute_objects(props))
        .find_map(|obj| tag_list(obj.get("tags")?))
        .unwrap_or_default()
}

pub fn category(feature: &Feature) -> Option<String> {
    first_text(feature.properties(), &["categoryId", "category"])
}

pub fn subcategory(feature: &Feature) -> Option<String> {
    first_text(
        feature.properties(),
        &["subCategoryId", "subcategory", "subCategory"],
    )
}

/// Line geometries are routes; everything else counts as a POI.
pub fn is_route(feature: &Feature) -> bool {
    feature.geometry_type() == GeometryType::Line
}

/// Text of a searchable field. Dotted names walk nested objects.
pub fn field_text(feature: &Feature, field: &str) -> Option<String> {
    let mut parts = field.split('.');
    let mut value = feature.properties().get(parts.next()?)?;
    for part in parts {
        value = value.get(part)?;
    }
    text(value)
}

fn attribute_objects(props: &Map<String, Value>) -> impl Iterator<Item = &Map<String, Value>> {
    ATTRIBUTE_KEYS
        .iter()
        .filter_map(|key| props.get(*key)?.as_object())
}

fn first_text(props: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    std::iter::once(props)
        .chain(attribute_objects(props))
        .find_map(|obj| keys.iter().find_map(|key| text(obj.get(*key)?)))
}

fn flat_pair(props: &Map<String, Value>, lat: &str, lng: &str) -> Option<LatLng> {
    Some(LatLng::new(number(props.get(lat)?)?, number(props.get(lng)?)?))
}

fn average_rating(reviews: &Value) -> Option<f64> {
    let ratings: Vec<f64> = reviews
        .as_array()?
        .iter()
        .filter_map(|review| number(review.get("rating")?))
        .collect();
    if ratings.is_empty() {
        return None;
    }
    Some(ratings.iter().sum::<f64>() / ratings.len() as f64)
}

fn tag_list(value: &Value) -> Option<Vec<String>> {
    let tags: Vec<String> = match value {
        Value::Array(items) => items.iter().filter_map(text).collect(),
        Value::String(s) => s.split(',').map(str::to_string).collect(),
        _ => return None,
    };
    Some(
        tags.into_iter()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect(),
    )
}

fn number(value: &Value) -> Option<f64> {
    let n = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse().ok()?,
        _ => return None,
    };
    n.is_finite().then_some(n)
}

fn text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}
