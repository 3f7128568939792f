use serde_json::Value;

use crate::error::DataError;

/// Splits a layer source into raw feature values.
///
/// Accepts a `FeatureCollection`, a single `Feature`, or a bare array of
/// features. Individual features are validated later, when stored.
pub fn split_features(root: Value) -> Result<Vec<Value>, DataError> {
    match root {
        Value::Array(items) => Ok(items),
        Value::Object(mut obj) => match obj.get("type").and_then(Value::as_str) {
            Some("FeatureCollection") => match obj.remove("features") {
                Some(Value::Array(items)) => Ok(items),
                _ => Err(DataError::MissingFeatures),
            },
            Some("Feature") => Ok(vec![Value::Object(obj)]),
            Some(other) => Err(DataError::UnsupportedRoot(other.to_string())),
            None => Err(DataError::UnsupportedRoot("object without `type`".to_string())),
        },
        other => Err(DataError::UnsupportedRoot(json_kind(&other).to_string())),
    }
}

pub fn parse_features(text: &str) -> Result<Vec<Value>, DataError> {
    split_features(serde_json::from_str(text)?)
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
