use crate::error::IngestError;
use crate::storage::Timestamp;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Attribute root for variable metadata.
pub const CONTEXTS_ROOT: &str = "contexts";
/// Attribute root for the static call tree.
pub const CALLPATH_ROOT: &str = "callpath";
/// Attribute root for periodic value summaries.
pub const VALUES_ROOT: &str = "values";

/// Numeric fields carried by every value event, in emission order.
pub const VALUE_FIELDS: [&str; 6] = ["mean", "min", "max", "median", "std", "significant_digits"];

/// Sub-attribute of `values/<id>` holding the callpath id of the sample.
pub const PARENT_FIELD: &str = "parent";

/// One line of a trace, before validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEvent {
    pub name: String,
    pub timestamp: Timestamp,
    #[serde(default)]
    pub fields: Map<String, Value>,
}

impl RawEvent {
    pub fn new(name: impl Into<String>, timestamp: Timestamp, fields: Map<String, Value>) -> Self {
        Self {
            name: name.into(),
            timestamp,
            fields,
        }
    }
}

/// Static metadata for a traced variable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextEvent {
    pub id: u64,
    pub file: String,
    pub function: String,
    pub line: i32,
    pub name: String,
    /// The `type` field exactly as received; a string-encoded byte size.
    pub type_repr: String,
    pub type_size: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallpathEvent {
    pub id: i64,
    pub parent: i64,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueEvent {
    pub context: u64,
    pub parent: i64,
    pub mean: f64,
    pub min: f64,
    pub max: f64,
    pub median: f64,
    pub std: f64,
    pub significant_digits: f64,
}

impl ValueEvent {
    /// `(field name, value)` pairs in [`VALUE_FIELDS`] order
    pub fn fields(&self) -> [(&'static str, f64); 6] {
        [
            ("mean", self.mean),
            ("min", self.min),
            ("max", self.max),
            ("median", self.median),
            ("std", self.std),
            ("significant_digits", self.significant_digits),
        ]
    }
}

/// A validated trace event.
#[derive(Debug, Clone, PartialEq)]
pub enum TraceEvent {
    Context(ContextEvent),
    Callpath(CallpathEvent),
    Value(ValueEvent),
}

impl TraceEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            TraceEvent::Context(_) => "context",
            TraceEvent::Callpath(_) => "callpath",
            TraceEvent::Value(_) => "value",
        }
    }

    /// Validate a raw event. Missing or unparseable required fields fail
    /// with [`IngestError::MalformedField`]; unknown names with
    /// [`IngestError::UnknownEventKind`].
    pub fn from_raw(raw: &RawEvent) -> Result<Self, IngestError> {
        let f = Fields {
            event: "",
            map: &raw.fields,
        };
        match raw.name.as_str() {
            "context" => {
                let f = Fields {
                    event: "context",
                    ..f
                };
                let type_repr = f.type_string("type")?;
                let type_size = type_repr.trim().parse::<i32>().map_err(|e| {
                    f.malformed("type", format!("'{}' is not an integer: {}", type_repr, e))
                })?;
                let line = f.i64("line")?;
                let line = i32::try_from(line)
                    .map_err(|_| f.malformed("line", format!("{} does not fit in 32 bits", line)))?;
                Ok(TraceEvent::Context(ContextEvent {
                    id: f.id("id")?,
                    file: f.string("file")?,
                    function: f.string("function")?,
                    line,
                    name: f.string("name")?,
                    type_repr,
                    type_size,
                }))
            }
            "callpath" => {
                let f = Fields {
                    event: "callpath",
                    ..f
                };
                Ok(TraceEvent::Callpath(CallpathEvent {
                    id: f.i64("id")?,
                    parent: f.i64("parent")?,
                    name: f.string("name")?,
                }))
            }
            "value" => {
                let f = Fields { event: "value", ..f };
                Ok(TraceEvent::Value(ValueEvent {
                    context: f.id("context")?,
                    parent: f.i64("parent")?,
                    mean: f.f64("mean")?,
                    min: f.f64("min")?,
                    max: f.f64("max")?,
                    median: f.f64("median")?,
                    std: f.f64("std")?,
                    significant_digits: f.f64("significant_digits")?,
                }))
            }
            other => Err(IngestError::UnknownEventKind(other.to_string())),
        }
    }

    /// Render back to the wire representation.
    pub fn into_raw(self, timestamp: Timestamp) -> RawEvent {
        let mut fields = Map::new();
        let name = self.kind();
        match self {
            TraceEvent::Context(c) => {
                fields.insert("id".into(), c.id.into());
                fields.insert("file".into(), c.file.into());
                fields.insert("function".into(), c.function.into());
                fields.insert("line".into(), c.line.into());
                fields.insert("name".into(), c.name.into());
                fields.insert("type".into(), c.type_repr.into());
            }
            TraceEvent::Callpath(c) => {
                fields.insert("id".into(), c.id.into());
                fields.insert("parent".into(), c.parent.into());
                fields.insert("name".into(), c.name.into());
            }
            TraceEvent::Value(v) => {
                fields.insert("context".into(), v.context.into());
                fields.insert("parent".into(), v.parent.into());
                for (field, value) in v.fields() {
                    fields.insert(field.into(), value.into());
                }
            }
        }
        RawEvent::new(name, timestamp, fields)
    }
}

struct Fields<'a> {
    event: &'static str,
    map: &'a Map<String, Value>,
}

impl Fields<'_> {
    fn malformed(&self, field: &'static str, reason: impl Into<String>) -> IngestError {
        IngestError::MalformedField {
            event: self.event,
            field,
            reason: reason.into(),
        }
    }

    fn get(&self, field: &'static str) -> Result<&Value, IngestError> {
        self.map
            .get(field)
            .ok_or_else(|| self.malformed(field, "missing"))
    }

    fn string(&self, field: &'static str) -> Result<String, IngestError> {
        self.get(field)?
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| self.malformed(field, "expected a string"))
    }

    /// Strings as-is; bare integers are accepted and rendered.
    fn type_string(&self, field: &'static str) -> Result<String, IngestError> {
        match self.get(field)? {
            Value::String(s) => Ok(s.clone()),
            Value::Number(n) if n.is_i64() || n.is_u64() => Ok(n.to_string()),
            _ => Err(self.malformed(field, "expected a string-encoded integer")),
        }
    }

    fn i64(&self, field: &'static str) -> Result<i64, IngestError> {
        self.get(field)?
            .as_i64()
            .ok_or_else(|| self.malformed(field, "expected a signed 64-bit integer"))
    }

    /// Variable ids are 64-bit hashes; negative encodings are reinterpreted.
    fn id(&self, field: &'static str) -> Result<u64, IngestError> {
        let value = self.get(field)?;
        value
            .as_u64()
            .or_else(|| value.as_i64().map(|v| v as u64))
            .ok_or_else(|| self.malformed(field, "expected an integer id"))
    }

    fn f64(&self, field: &'static str) -> Result<f64, IngestError> {
        self.get(field)?
            .as_f64()
            .ok_or_else(|| self.malformed(field, "expected a number"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(value: serde_json::Value) -> RawEvent {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_parse_context_event() {
        let event = raw(json!({
            "name": "context",
            "timestamp": 0,
            "fields": {"id": 42, "file": "a.c", "function": "f", "line": 10, "name": "x", "type": "8"}
        }));
        match TraceEvent::from_raw(&event).unwrap() {
            TraceEvent::Context(c) => {
                assert_eq!(c.id, 42);
                assert_eq!(c.line, 10);
                assert_eq!(c.type_size, 8);
                assert_eq!(c.type_repr, "8");
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_non_numeric_type_is_malformed() {
        let event = raw(json!({
            "name": "context",
            "timestamp": 0,
            "fields": {"id": 1, "file": "a.c", "function": "f", "line": 1, "name": "x", "type": "double"}
        }));
        let err = TraceEvent::from_raw(&event).unwrap_err();
        assert!(matches!(
            err,
            IngestError::MalformedField {
                event: "context",
                field: "type",
                ..
            }
        ));
    }

    #[test]
    fn test_missing_value_field_is_malformed() {
        let event = raw(json!({
            "name": "value",
            "timestamp": 5,
            "fields": {"context": 1, "parent": 1, "mean": 1.0, "min": 1.0, "max": 1.0, "median": 1.0, "std": 0.0}
        }));
        let err = TraceEvent::from_raw(&event).unwrap_err();
        assert!(matches!(
            err,
            IngestError::MalformedField {
                field: "significant_digits",
                ..
            }
        ));
    }

    #[test]
    fn test_unknown_kind() {
        let event = RawEvent::new("lttng_ust_statedump:start", 0, Map::new());
        assert_eq!(
            TraceEvent::from_raw(&event).unwrap_err(),
            IngestError::UnknownEventKind("lttng_ust_statedump:start".into())
        );
    }

    #[test]
    fn test_integer_fields_accepted_as_doubles() {
        let event = raw(json!({
            "name": "value",
            "timestamp": 5,
            "fields": {"context": 1, "parent": 2, "mean": 1, "min": 0, "max": 2, "median": 1, "std": 0, "significant_digits": 6}
        }));
        let TraceEvent::Value(v) = TraceEvent::from_raw(&event).unwrap() else {
            panic!("expected a value event");
        };
        assert_eq!(v.significant_digits, 6.0);
        assert_eq!(v.parent, 2);
    }

    #[test]
    fn test_into_raw_preserves_wire_names() {
        let event = TraceEvent::Callpath(CallpathEvent {
            id: 3,
            parent: 1,
            name: "solve".into(),
        });
        let raw = event.clone().into_raw(0);
        assert_eq!(raw.name, "callpath");
        assert_eq!(raw.fields["parent"], json!(1));
        assert_eq!(TraceEvent::from_raw(&raw).unwrap(), event);
    }
}
