//! The store's native document identifier.
//!
//! Inside the store an identifier is held in its extended form `{"$oid": "<24 hex>"}`.
//! Exports carry the portable form, the bare hex string.
//!

use core::{fmt, str::FromStr};

use chrono::Utc;
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

/// The key of an identifier in its extended form.
pub const OID_KEY: &str = "$oid";

/// A 12 byte document identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId([u8; 12]);

impl ObjectId {
    /// Generate a new identifier: a 4 byte big endian timestamp then 8 random bytes.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        let timestamp = u32::try_from(Utc::now().timestamp()).unwrap_or(u32::MAX);
        let random = Uuid::new_v4();

        let mut bytes = [0u8; 12];
        let (head, tail) = bytes.split_at_mut(4);
        head.copy_from_slice(&timestamp.to_be_bytes());
        tail.copy_from_slice(random.as_bytes().split_at(8).0);

        Self(bytes)
    }

    /// If `value` is the portable representation of an identifier.
    pub fn is_valid(value: &str) -> bool {
        value.len() == 24 && value.bytes().all(|byte| byte.is_ascii_hexdigit())
    }

    /// The identifier as lowercase hex.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// The identifier in its extended form.
    pub fn to_value(&self) -> Value {
        let mut object = Map::new();
        object.insert(OID_KEY.to_string(), Value::String(self.to_hex()));
        Value::Object(object)
    }

    /// Read an identifier held in its extended form.
    pub fn from_value(value: &Value) -> Option<Self> {
        let object = value.as_object()?;
        if object.len() != 1 {
            return None;
        }

        object.get(OID_KEY)?.as_str()?.parse().ok()
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl FromStr for ObjectId {
    type Err = ParseObjectIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if !Self::is_valid(s) {
            return Err(ParseObjectIdError(s.to_string()));
        }

        let mut bytes = [0u8; 12];
        hex::decode_to_slice(s, &mut bytes).map_err(|_| ParseObjectIdError(s.to_string()))?;

        Ok(Self(bytes))
    }
}

#[allow(missing_docs)]
#[derive(Debug, Error)]
#[error("'{0}' is not a valid object id")]
pub struct ParseObjectIdError(pub String);

/// Replace every extended identifier inside `value` with its portable form.
pub fn to_portable(value: Value) -> Value {
    if let Some(id) = ObjectId::from_value(&value) {
        return Value::String(id.to_hex());
    }

    match value {
        Value::Object(object) => Value::Object(
            object
                .into_iter()
                .map(|(key, value)| (key, to_portable(value)))
                .collect(),
        ),
        Value::Array(values) => Value::Array(values.into_iter().map(to_portable).collect()),
        other => other,
    }
}

/// Replace a portable identifier with its extended form.
///
/// Arrays are converted element by element, anything that is not a valid identifier string is left
/// untouched.
pub fn reconstruct(value: &mut Value) {
    match value {
        Value::String(string) => {
            if let Ok(id) = string.parse::<ObjectId>() {
                *value = id.to_value();
            }
        }
        Value::Array(values) => values.iter_mut().for_each(reconstruct),
        _ => {}
    }
}

/// A human readable form of a document identifier.
pub fn display_id(value: &Value) -> String {
    if let Some(id) = ObjectId::from_value(value) {
        return id.to_hex();
    }

    match value {
        Value::String(string) => string.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn generated_ids_are_valid_and_unique() {
        let a = ObjectId::new();
        let b = ObjectId::new();

        assert_ne!(a, b);
        assert!(ObjectId::is_valid(&a.to_hex()));
        assert_eq!(a.to_hex().parse::<ObjectId>().unwrap(), a);
    }

    #[test]
    fn rejects_invalid_strings() {
        assert!("not-an-id".parse::<ObjectId>().is_err());
        assert!("507f1f77bcf86cd79943901".parse::<ObjectId>().is_err());
        assert!("507f1f77bcf86cd79943901z".parse::<ObjectId>().is_err());
    }

    #[test]
    fn portable_then_reconstruct() {
        let id = ObjectId::new();
        let portable = to_portable(json!({ "a": id.to_value(), "b": [id.to_value()] }));
        assert_eq!(portable, json!({ "a": id.to_hex(), "b": [id.to_hex()] }));

        let mut leaf = portable["a"].clone();
        reconstruct(&mut leaf);
        assert_eq!(leaf, id.to_value());

        let mut name = json!("Jane");
        reconstruct(&mut name);
        assert_eq!(name, json!("Jane"));
    }
}
