//! Typed atom field values
//!
//! One `FieldValue` per wire field. Floats hash and compare by bit pattern
//! so projections of any field can key a map.

use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

/// The type tag of a field value, used in error reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Int,
    Long,
    Float,
    Bool,
    Str,
    Bytes,
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FieldKind::Int => "int32",
            FieldKind::Long => "int64",
            FieldKind::Float => "float",
            FieldKind::Bool => "bool",
            FieldKind::Str => "string",
            FieldKind::Bytes => "bytes",
        };
        f.write_str(name)
    }
}

/// A single typed field of an atom
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum FieldValue {
    Int(i32),
    Long(i64),
    Float(f32),
    Bool(bool),
    Str(String),
    Bytes(Vec<u8>),
}

impl FieldValue {
    /// The kind tag of this value
    pub fn kind(&self) -> FieldKind {
        match self {
            FieldValue::Int(_) => FieldKind::Int,
            FieldValue::Long(_) => FieldKind::Long,
            FieldValue::Float(_) => FieldKind::Float,
            FieldValue::Bool(_) => FieldKind::Bool,
            FieldValue::Str(_) => FieldKind::Str,
            FieldValue::Bytes(_) => FieldKind::Bytes,
        }
    }

    /// Widening numeric view: `Int` and `Long` both read as i64
    pub fn as_long(&self) -> Option<i64> {
        match self {
            FieldValue::Int(v) => Some(i64::from(*v)),
            FieldValue::Long(v) => Some(*v),
            _ => None,
        }
    }

    /// Numeric view including floats, for value aggregation
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Int(v) => Some(f64::from(*v)),
            FieldValue::Long(v) => Some(*v as f64),
            FieldValue::Float(v) => Some(f64::from(*v)),
            _ => None,
        }
    }
}

impl PartialEq for FieldValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (FieldValue::Int(a), FieldValue::Int(b)) => a == b,
            (FieldValue::Long(a), FieldValue::Long(b)) => a == b,
            // Bitwise so that NaN == NaN and the impl can be Eq.
            (FieldValue::Float(a), FieldValue::Float(b)) => a.to_bits() == b.to_bits(),
            (FieldValue::Bool(a), FieldValue::Bool(b)) => a == b,
            (FieldValue::Str(a), FieldValue::Str(b)) => a == b,
            (FieldValue::Bytes(a), FieldValue::Bytes(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for FieldValue {}

impl Hash for FieldValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            FieldValue::Int(v) => v.hash(state),
            FieldValue::Long(v) => v.hash(state),
            FieldValue::Float(v) => v.to_bits().hash(state),
            FieldValue::Bool(v) => v.hash(state),
            FieldValue::Str(v) => v.hash(state),
            FieldValue::Bytes(v) => v.hash(state),
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Int(v) => write!(f, "{v}"),
            FieldValue::Long(v) => write!(f, "{v}"),
            FieldValue::Float(v) => write!(f, "{v}"),
            FieldValue::Bool(v) => write!(f, "{v}"),
            FieldValue::Str(v) => write!(f, "{v:?}"),
            FieldValue::Bytes(v) => write!(f, "<{} bytes>", v.len()),
        }
    }
}
