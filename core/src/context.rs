use crate::error::StoreError;
use crate::event::CONTEXTS_ROOT;
use crate::storage::{Quark, StateSystem};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

const SINGLE_NAME: &str = "binary32";
const DOUBLE_NAME: &str = "binary64";

/// Immutable metadata describing a traced variable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Context {
    /// Usually a hash of the variable, shared with its value events.
    pub id: u64,
    pub file: String,
    pub function: String,
    pub line: i32,
    pub name: String,
    /// Size in bytes of the variable's floating-point type.
    pub type_size: i32,
}

impl Context {
    pub fn new(
        id: u64,
        file: impl Into<String>,
        function: impl Into<String>,
        line: i32,
        name: impl Into<String>,
        type_size: i32,
    ) -> Self {
        Self {
            id,
            file: file.into(),
            function: function.into(),
            line,
            name: name.into(),
            type_size,
        }
    }

    pub fn type_name(&self) -> &'static str {
        type_name(self.type_size)
    }

    /// Read the context rooted at `quark` (a child of `contexts/`).
    ///
    /// Contexts never change in trace time, so they are read at the store's
    /// current end time.
    pub fn extract_from_store(store: &dyn StateSystem, quark: Quark) -> Result<Self, StoreError> {
        let at = store.current_end_time();
        let attr = store.attribute_name(quark)?;
        let id = attr.parse::<u64>().map_err(|_| StoreError::AttributeNotFound {
            path: format!("{}/{}", CONTEXTS_ROOT, attr),
        })?;
        let read = |field: &str| -> Result<_, StoreError> {
            let child = store.quark_relative(quark, field)?;
            Ok(store.query_single_state(at, child)?.value)
        };

        let type_size = read("type")?
            .unbox_str()?
            .trim()
            .parse::<i32>()
            .map_err(|_| StoreError::ValueType {
                expected: "integer string",
                found: "string",
            })?;

        Ok(Self {
            id,
            file: read("file")?.unbox_str()?.to_string(),
            function: read("function")?.unbox_str()?.to_string(),
            line: read("line")?.unbox_int()?,
            name: read("name")?.unbox_str()?.to_string(),
            type_size,
        })
    }
}

/// Printable floating-point format for a byte size.
pub fn type_name(type_size: i32) -> &'static str {
    match type_size {
        4 => SINGLE_NAME,
        8 => DOUBLE_NAME,
        _ => "",
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    /// First record for this id.
    Inserted,
    /// Same id, identical content.
    Duplicate,
    /// Same id, different content; the first record was kept.
    Conflict,
}

/// Flat id -> [`Context`] table owned by one trace's ingestion.
#[derive(Debug, Default)]
pub struct ContextRegistry {
    contexts: HashMap<u64, Context>,
}

impl ContextRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a context. The first record for an id wins.
    pub fn record(&mut self, context: Context) -> RecordOutcome {
        match self.contexts.get(&context.id) {
            None => {
                self.contexts.insert(context.id, context);
                RecordOutcome::Inserted
            }
            Some(existing) if *existing == context => RecordOutcome::Duplicate,
            Some(existing) => {
                tracing::warn!(
                    id = context.id,
                    kept = %existing.name,
                    ignored = %context.name,
                    "context redefined with different content, keeping the first definition"
                );
                RecordOutcome::Conflict
            }
        }
    }

    pub fn lookup(&self, id: u64) -> Option<&Context> {
        self.contexts.get(&id)
    }

    pub fn clear(&mut self) {
        self.contexts.clear();
    }

    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Context> {
        self.contexts.values()
    }

    /// Rebuild the table from `contexts/*`. Unreadable entries are skipped.
    pub fn rehydrate(&mut self, store: &dyn StateSystem) -> usize {
        self.contexts.clear();
        for quark in store.quarks(&[CONTEXTS_ROOT, "*"]) {
            match Context::extract_from_store(store, quark) {
                Ok(context) => {
                    self.contexts.insert(context.id, context);
                }
                Err(e) => tracing::debug!(%quark, "skipping unreadable context: {}", e),
            }
        }
        self.contexts.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryStateSystem, StateValue};

    fn sample() -> Context {
        Context::new(42, "a.c", "f", 10, "x", 8)
    }

    #[test]
    fn test_record_and_lookup() {
        let mut registry = ContextRegistry::new();
        assert_eq!(registry.record(sample()), RecordOutcome::Inserted);
        assert_eq!(registry.record(sample()), RecordOutcome::Duplicate);
        assert_eq!(registry.lookup(42), Some(&sample()));
        assert_eq!(registry.lookup(7), None);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_conflicting_record_keeps_first() {
        let mut registry = ContextRegistry::new();
        registry.record(sample());
        let other = Context::new(42, "b.c", "g", 99, "y", 4);
        assert_eq!(registry.record(other), RecordOutcome::Conflict);

        // Stable across repeated lookups
        for _ in 0..3 {
            assert_eq!(registry.lookup(42), Some(&sample()));
        }
    }

    #[test]
    fn test_type_name() {
        assert_eq!(type_name(4), "binary32");
        assert_eq!(type_name(8), "binary64");
        assert_eq!(type_name(16), "");
        assert_eq!(sample().type_name(), "binary64");
    }

    #[test]
    fn test_rehydrate_from_store() {
        let store = MemoryStateSystem::new(0);
        let root = store.quark_absolute_and_add(&[CONTEXTS_ROOT, "42"]);
        let write = |field: &str, value: StateValue| {
            let q = store.quark_relative_and_add(root, field).unwrap();
            store.modify_attribute(0, value, q).unwrap();
        };
        write("file", StateValue::Str("a.c".into()));
        write("function", StateValue::Str("f".into()));
        write("line", StateValue::Int(10));
        write("name", StateValue::Str("x".into()));
        write("type", StateValue::Str("8".into()));
        // Incomplete context is skipped
        store.quark_absolute_and_add(&[CONTEXTS_ROOT, "7", "file"]);

        let mut registry = ContextRegistry::new();
        registry.record(Context::new(1, "old.c", "old", 1, "old", 4));
        assert_eq!(registry.rehydrate(&store), 1);
        assert_eq!(registry.lookup(42), Some(&sample()));
        assert_eq!(registry.lookup(1), None);
    }

    #[test]
    fn test_unparseable_type_is_a_value_type_error() {
        let store = MemoryStateSystem::new(0);
        let root = store.quark_absolute_and_add(&[CONTEXTS_ROOT, "9"]);
        for (field, value) in [
            ("file", StateValue::Str("b.c".into())),
            ("function", StateValue::Str("g".into())),
            ("line", StateValue::Int(3)),
            ("name", StateValue::Str("z".into())),
            ("type", StateValue::Str("double".into())),
        ] {
            let q = store.quark_relative_and_add(root, field).unwrap();
            store.modify_attribute(0, value, q).unwrap();
        }

        assert_eq!(
            Context::extract_from_store(&store, root).unwrap_err(),
            StoreError::ValueType {
                expected: "integer string",
                found: "string"
            }
        );
        let mut registry = ContextRegistry::new();
        assert_eq!(registry.rehydrate(&store), 0);
    }
}
