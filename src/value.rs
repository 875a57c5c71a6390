//! Runtime values, container keys and datum type descriptors.

use std::fmt;
use std::sync::Arc;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::core::DatumId;
use crate::error::DataError;

/// A script-level value as stored in a closed slot or a container member.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
    Blob(Vec<u8>),
    /// A file handle, identified by its path.
    File(Utf8PathBuf),
    /// A reference to another datum.
    Ref(DatumId),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Bool(_) => "bool",
            Value::Str(_) => "string",
            Value::Blob(_) => "blob",
            Value::File(_) => "file",
            Value::Ref(_) => "ref",
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_ref_id(&self) -> Option<DatumId> {
        match self {
            Value::Ref(id) => Some(*id),
            _ => None,
        }
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Str(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Str(value)
    }
}

impl From<DatumId> for Value {
    fn from(value: DatumId) -> Self {
        Value::Ref(value)
    }
}

/// Subscript of a container level.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Key {
    Int(i64),
    Str(Arc<str>),
    Bool(bool),
}

impl Key {
    pub fn key_type(&self) -> KeyType {
        match self {
            Key::Int(_) => KeyType::Int,
            Key::Str(_) => KeyType::Str,
            Key::Bool(_) => KeyType::Bool,
        }
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Int(i) => write!(f, "{i}"),
            Key::Str(s) => write!(f, "{s:?}"),
            Key::Bool(b) => write!(f, "{b}"),
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl From<i64> for Key {
    fn from(value: i64) -> Self {
        Key::Int(value)
    }
}

impl From<bool> for Key {
    fn from(value: bool) -> Self {
        Key::Bool(value)
    }
}

impl From<&str> for Key {
    fn from(value: &str) -> Self {
        Key::Str(value.into())
    }
}

impl From<String> for Key {
    fn from(value: String) -> Self {
        Key::Str(value.into())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyType {
    Int,
    Str,
    Bool,
}

/// Commutative, associative merge operator of an updateable datum.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MergeOp {
    /// Addition.
    Incr,
    Min,
    Max,
    /// Multiplication.
    Scale,
}

impl MergeOp {
    /// Merge `operand` into `current`.
    ///
    /// Integer accumulators only accept integer operands; float accumulators
    /// accept both and promote integers.
    pub fn apply(self, current: &Value, operand: &Value) -> Result<Value, DataError> {
        match (current, operand) {
            (Value::Int(a), Value::Int(b)) => Ok(Value::Int(match self {
                MergeOp::Incr => a.wrapping_add(*b),
                MergeOp::Min => *a.min(b),
                MergeOp::Max => *a.max(b),
                MergeOp::Scale => a.wrapping_mul(*b),
            })),
            (Value::Float(a), Value::Float(_) | Value::Int(_)) => {
                let b = operand.as_float().unwrap_or_default();
                Ok(Value::Float(match self {
                    MergeOp::Incr => a + b,
                    MergeOp::Min => a.min(b),
                    MergeOp::Max => a.max(b),
                    MergeOp::Scale => a * b,
                }))
            }
            _ => Err(DataError::TypeMismatch {
                expected: current.type_name(),
                actual: operand.type_name(),
            }),
        }
    }
}

/// Shape of a datum, fixed at creation.
#[derive(Clone, Debug, PartialEq)]
pub enum DatumType {
    /// Single-assignment cell.
    Scalar,
    /// Keyed container. `ordered` containers iterate in insertion order.
    Container { key: KeyType, ordered: bool },
    /// String-keyed container with a fixed set of fields.
    Struct { fields: Vec<Arc<str>> },
    /// Unkeyed, append-only bag.
    Multiset,
    /// Accumulator merged with `op`, starting from `init`.
    Updateable { op: MergeOp, init: Value },
}

impl DatumType {
    pub fn map(key: KeyType) -> Self {
        DatumType::Container {
            key,
            ordered: false,
        }
    }

    pub fn range(key: KeyType) -> Self {
        DatumType::Container { key, ordered: true }
    }

    pub fn structure<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<Arc<str>>,
    {
        DatumType::Struct {
            fields: fields.into_iter().map(Into::into).collect(),
        }
    }

    pub fn updateable(op: MergeOp, init: impl Into<Value>) -> Self {
        DatumType::Updateable {
            op,
            init: init.into(),
        }
    }

    pub fn is_compound(&self) -> bool {
        matches!(
            self,
            DatumType::Container { .. } | DatumType::Struct { .. } | DatumType::Multiset
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_int() {
        let v = MergeOp::Incr.apply(&Value::Int(2), &Value::Int(3)).unwrap();
        assert_eq!(v, Value::Int(5));
        let v = MergeOp::Min.apply(&Value::Int(2), &Value::Int(-3)).unwrap();
        assert_eq!(v, Value::Int(-3));
        let v = MergeOp::Max.apply(&Value::Int(2), &Value::Int(-3)).unwrap();
        assert_eq!(v, Value::Int(2));
        let v = MergeOp::Scale.apply(&Value::Int(2), &Value::Int(3)).unwrap();
        assert_eq!(v, Value::Int(6));
    }

    #[test]
    fn test_merge_float_promotes_int_operand() {
        let v = MergeOp::Scale
            .apply(&Value::Float(1.5), &Value::Int(2))
            .unwrap();
        assert_eq!(v, Value::Float(3.0));
    }

    #[test]
    fn test_merge_rejects_float_into_int() {
        let err = MergeOp::Incr
            .apply(&Value::Int(1), &Value::Float(1.0))
            .unwrap_err();
        assert!(matches!(err, DataError::TypeMismatch { .. }));
    }

    #[test]
    fn test_key_ordering_and_type() {
        let mut keys = vec![Key::from(3), Key::from(1), Key::from(2)];
        keys.sort();
        assert_eq!(keys, vec![Key::from(1), Key::from(2), Key::from(3)]);
        assert_eq!(Key::from("a").key_type(), KeyType::Str);
        assert_eq!(Key::from(true).key_type(), KeyType::Bool);
    }
}
