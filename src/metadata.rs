//! Schema-less metadata attached to alerts and profiles.

use serde::{Deserialize, Serialize};

use std::collections::BTreeMap;
use std::fmt;

pub type Metadata = BTreeMap<String, MetaValue>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetaValue {
    Bool(bool),
    Number(f64),
    Text(String),
}

impl fmt::Display for MetaValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(v) => write!(f, "{v}"),
            Self::Number(v) => write!(f, "{v}"),
            Self::Text(v) => f.write_str(v),
        }
    }
}

impl From<bool> for MetaValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<f64> for MetaValue {
    fn from(value: f64) -> Self {
        Self::Number(value)
    }
}

impl From<u64> for MetaValue {
    fn from(value: u64) -> Self {
        Self::Number(value as f64)
    }
}

impl From<u32> for MetaValue {
    fn from(value: u32) -> Self {
        Self::Number(f64::from(value))
    }
}

impl From<&str> for MetaValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for MetaValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

/// Builds a metadata map from `(key, value)` pairs.
pub fn metadata<K, V, I>(pairs: I) -> Metadata
where
    K: Into<String>,
    V: Into<MetaValue>,
    I: IntoIterator<Item = (K, V)>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn untagged_values_keep_their_json_shape() {
        let meta = metadata([
            ("version", MetaValue::from("1.4.0")),
            ("batch", MetaValue::from(32u64)),
            ("warm", MetaValue::from(true)),
        ]);
        let json = serde_json::to_value(&meta).expect("json");
        assert_eq!(json["version"], "1.4.0");
        assert_eq!(json["batch"], 32.0);
        assert_eq!(json["warm"], true);

        let back: Metadata = serde_json::from_value(json).expect("parse");
        assert_eq!(back, meta);
    }

    #[test]
    fn integer_json_reads_as_number() {
        let back: Metadata = serde_json::from_str(r#"{"n": 7}"#).expect("parse");
        assert_eq!(back.get("n"), Some(&MetaValue::Number(7.0)));
    }
}
