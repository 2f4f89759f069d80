//! Type inference and text encoding for reply rows.
//!
//! Row values are `serde_json::Value`s. Each value is described as a wire
//! type (OID and `typlen`) and encoded in the text format. Values that cannot
//! be described or encoded are left out of the row instead of failing it.

use bytes::Bytes;
use serde_json::{Number, Value};
use thiserror::Error;

use crate::protocol::type_oid;

/// Errors produced while encoding a value in the text format.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EncodeError {
    #[error("value {0} has no wire type")]
    Unsupported(String),
    #[error("value {value} does not fit type {type_name}")]
    OutOfRange {
        value: String,
        type_name: &'static str,
    },
}

/// A wire data type known to the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataType {
    pub name: &'static str,
    pub oid: i32,
    /// `pg_type.typlen`: byte width, or -1 for variable-width types
    pub size: i16,
}

/// Kind of host value a [`DataType`] is chosen for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Bool,
    Integer,
    Float,
    String,
}

/// Table of wire types the mapper may emit.
///
/// Owned by whoever builds the [`TypeMapper`], so two sessions never share
/// type state.
#[derive(Debug, Clone)]
pub struct TypeRegistry {
    entries: Vec<(ValueKind, DataType)>,
}

impl TypeRegistry {
    pub const BOOL: DataType = DataType {
        name: "bool",
        oid: type_oid::BOOL,
        size: 1,
    };
    pub const INT8: DataType = DataType {
        name: "int8",
        oid: type_oid::INT8,
        size: 8,
    };
    pub const FLOAT8: DataType = DataType {
        name: "float8",
        oid: type_oid::FLOAT8,
        size: 8,
    };
    pub const NUMERIC: DataType = DataType {
        name: "numeric",
        oid: type_oid::NUMERIC,
        size: -1,
    };
    pub const TEXT: DataType = DataType {
        name: "text",
        oid: type_oid::TEXT,
        size: -1,
    };

    /// An empty registry; every value is unsupported.
    pub fn empty() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Registers (or replaces) the wire type used for `kind`.
    pub fn register(mut self, kind: ValueKind, data_type: DataType) -> Self {
        self.entries.retain(|(k, _)| *k != kind);
        self.entries.push((kind, data_type));
        self
    }

    pub fn lookup(&self, kind: ValueKind) -> Option<DataType> {
        self.entries
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, data_type)| *data_type)
    }
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::empty()
            .register(ValueKind::Bool, Self::BOOL)
            .register(ValueKind::Integer, Self::INT8)
            .register(ValueKind::Float, Self::FLOAT8)
            .register(ValueKind::String, Self::TEXT)
    }
}

/// A value together with the wire type it will be sent as.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldValue<'a> {
    pub value: &'a Value,
    pub data_type: DataType,
}

/// Maps row values to wire types and text-format bytes.
#[derive(Debug, Clone, Default)]
pub struct TypeMapper {
    registry: TypeRegistry,
}

impl TypeMapper {
    pub fn new(registry: TypeRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &TypeRegistry {
        &self.registry
    }

    /// Infers the wire type of `value`.
    ///
    /// Returns `None` for `null`, arrays, objects, and any kind the registry
    /// has no entry for.
    pub fn describe<'a>(&self, value: &'a Value) -> Option<FieldValue<'a>> {
        let kind = value_kind(value)?;
        let data_type = self.registry.lookup(kind)?;
        Some(FieldValue { value, data_type })
    }

    /// Encodes `value` in the text format of its inferred wire type.
    pub fn encode(&self, value: &Value) -> Result<Bytes, EncodeError> {
        let field = self
            .describe(value)
            .ok_or_else(|| EncodeError::Unsupported(value.to_string()))?;
        encode_text(field.value, field.data_type)
    }
}

fn value_kind(value: &Value) -> Option<ValueKind> {
    match value {
        Value::Bool(_) => Some(ValueKind::Bool),
        Value::Number(n) if n.is_i64() || n.is_u64() => Some(ValueKind::Integer),
        Value::Number(_) => Some(ValueKind::Float),
        Value::String(_) => Some(ValueKind::String),
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}

fn encode_text(value: &Value, data_type: DataType) -> Result<Bytes, EncodeError> {
    let out_of_range = || EncodeError::OutOfRange {
        value: value.to_string(),
        type_name: data_type.name,
    };

    let text = match (value, data_type.oid) {
        (Value::Bool(b), type_oid::BOOL) => (if *b { "t" } else { "f" }).to_string(),
        (Value::Number(n), type_oid::INT8) => n.as_i64().ok_or_else(out_of_range)?.to_string(),
        (Value::Number(n), type_oid::FLOAT8) => encode_float8(n).ok_or_else(out_of_range)?,
        (Value::Number(n), type_oid::NUMERIC) => n.to_string(),
        (Value::String(s), type_oid::TEXT) => s.clone(),
        (Value::Bool(_) | Value::Number(_), type_oid::TEXT) => value.to_string(),
        _ => return Err(out_of_range()),
    };
    Ok(Bytes::from(text))
}

fn encode_float8(n: &Number) -> Option<String> {
    let f = n.as_f64()?;
    if f.is_infinite() {
        let text = if f > 0.0 { "Infinity" } else { "-Infinity" };
        return Some(text.to_string());
    }
    Some(f.to_string())
}
