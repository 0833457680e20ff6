use crate::error::StoreError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Trace time in nanoseconds.
pub type Timestamp = i64;

/// Snapshot of every attribute at one point in time, indexed by quark.
pub type FullState = Arc<[Interval]>;

/// Stable handle for a hierarchical attribute path inside a state system.
///
/// Quarks are allocated by the store and are only meaningful to the store
/// that issued them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Quark(pub u32);

impl Quark {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for Quark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Value held by an attribute over an interval. `Null` means absent.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum StateValue {
    #[default]
    Null,
    Int(i32),
    Long(i64),
    Double(f64),
    Str(String),
}

impl StateValue {
    pub fn is_null(&self) -> bool {
        matches!(self, StateValue::Null)
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            StateValue::Null => "null",
            StateValue::Int(_) => "int",
            StateValue::Long(_) => "long",
            StateValue::Double(_) => "double",
            StateValue::Str(_) => "string",
        }
    }

    pub fn unbox_int(&self) -> Result<i32, StoreError> {
        match self {
            StateValue::Int(v) => Ok(*v),
            other => Err(other.mismatch("int")),
        }
    }

    /// Integer-valued states widen to `i64`.
    pub fn unbox_long(&self) -> Result<i64, StoreError> {
        match self {
            StateValue::Long(v) => Ok(*v),
            StateValue::Int(v) => Ok(i64::from(*v)),
            other => Err(other.mismatch("long")),
        }
    }

    pub fn unbox_double(&self) -> Result<f64, StoreError> {
        match self {
            StateValue::Double(v) => Ok(*v),
            other => Err(other.mismatch("double")),
        }
    }

    pub fn unbox_str(&self) -> Result<&str, StoreError> {
        match self {
            StateValue::Str(v) => Ok(v),
            other => Err(other.mismatch("string")),
        }
    }

    fn mismatch(&self, expected: &'static str) -> StoreError {
        StoreError::ValueType {
            expected,
            found: self.type_name(),
        }
    }
}

/// The value an attribute held over `[start, end]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Interval {
    pub quark: Quark,
    pub start: Timestamp,
    pub end: Timestamp,
    pub value: StateValue,
}

impl Interval {
    pub fn null(quark: Quark, start: Timestamp, end: Timestamp) -> Self {
        Self {
            quark,
            start,
            end,
            value: StateValue::Null,
        }
    }

    pub fn contains(&self, t: Timestamp) -> bool {
        self.start <= t && t <= self.end
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unbox_matches_variant() {
        assert_eq!(StateValue::Double(1.5).unbox_double().unwrap(), 1.5);
        assert_eq!(StateValue::Int(7).unbox_long().unwrap(), 7);
        assert_eq!(StateValue::Str("x".into()).unbox_str().unwrap(), "x");
    }

    #[test]
    fn test_unbox_mismatch_reports_types() {
        let err = StateValue::Null.unbox_double().unwrap_err();
        assert_eq!(
            err,
            StoreError::ValueType {
                expected: "double",
                found: "null"
            }
        );
    }

    #[test]
    fn test_state_value_serializes_tagged() {
        let json = serde_json::to_value(StateValue::Long(3)).unwrap();
        assert_eq!(json, serde_json::json!({"type": "long", "value": 3}));
    }
}
