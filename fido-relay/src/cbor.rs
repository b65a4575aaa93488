//! Integer-keyed CBOR maps as used by CTAP2 requests and responses
//!
//! Only the handful of shapes the PIN/UV ceremony needs are covered; command
//! payloads are otherwise opaque to this crate.

use crate::error::{Error, Result};

use ciborium::Value;

/// Build a CBOR map with integer keys
#[derive(Debug, Default)]
pub struct MapBuilder {
    entries: Vec<(Value, Value)>,
}

impl MapBuilder {
    /// Create a new map builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an arbitrary value
    pub fn insert(mut self, key: i64, value: Value) -> Self {
        self.entries.push((Value::Integer(key.into()), value));
        self
    }

    /// Insert an integer
    pub fn insert_int(self, key: i64, value: i64) -> Self {
        self.insert(key, Value::Integer(value.into()))
    }

    /// Insert bytes directly (avoids array serialization)
    pub fn insert_bytes(self, key: i64, bytes: &[u8]) -> Self {
        self.insert(key, Value::Bytes(bytes.to_vec()))
    }

    /// Insert a text string only if present
    pub fn insert_text_opt(self, key: i64, text: Option<&str>) -> Self {
        match text {
            Some(text) => self.insert(key, Value::Text(text.to_string())),
            None => self,
        }
    }

    /// Build the map as a CBOR Value
    pub fn build_value(self) -> Value {
        Value::Map(self.entries)
    }

    /// Build the map and encode to CBOR bytes
    pub fn build(self) -> Result<Vec<u8>> {
        let mut buffer = Vec::new();
        ciborium::into_writer(&self.build_value(), &mut buffer)
            .map_err(|_| Error::InvalidCbor("map encoding failed"))?;
        Ok(buffer)
    }
}

/// Parse a CBOR map with integer keys
#[derive(Debug)]
pub struct MapParser {
    entries: Vec<(i128, Value)>,
}

impl MapParser {
    /// Parse from CBOR bytes
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let value: Value =
            ciborium::from_reader(data).map_err(|_| Error::InvalidCbor("malformed CBOR"))?;
        Self::from_value(value)
    }

    /// Parse from a CBOR Value
    pub fn from_value(value: Value) -> Result<Self> {
        let Value::Map(pairs) = value else {
            return Err(Error::InvalidCbor("expected a map"));
        };
        let entries = pairs
            .into_iter()
            .map(|(k, v)| match k {
                Value::Integer(key) => Ok((key.into(), v)),
                _ => Err(Error::InvalidCbor("map key is not an integer")),
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { entries })
    }

    /// Get raw value
    pub fn get_raw(&self, key: i64) -> Option<&Value> {
        self.entries
            .iter()
            .find(|(k, _)| *k == key as i128)
            .map(|(_, v)| v)
    }

    /// Get a required byte string
    pub fn get_bytes(&self, key: i64) -> Result<&[u8]> {
        match self.get_raw(key) {
            Some(Value::Bytes(bytes)) => Ok(bytes),
            Some(_) => Err(Error::InvalidCbor("expected a byte string")),
            None => Err(Error::InvalidCbor("missing parameter")),
        }
    }

    /// Get a required integer
    pub fn get_int(&self, key: i64) -> Result<i128> {
        match self.get_raw(key) {
            Some(Value::Integer(value)) => Ok((*value).into()),
            Some(_) => Err(Error::InvalidCbor("expected an integer")),
            None => Err(Error::InvalidCbor("missing parameter")),
        }
    }

    /// Get a required nested map
    pub fn get_map(&self, key: i64) -> Result<MapParser> {
        match self.get_raw(key) {
            Some(value @ Value::Map(_)) => Self::from_value(value.clone()),
            Some(_) => Err(Error::InvalidCbor("expected a map")),
            None => Err(Error::InvalidCbor("missing parameter")),
        }
    }
}
