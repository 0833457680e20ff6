use crate::callpath::CallpathResolver;
use crate::context::{Context, ContextRegistry, RecordOutcome};
use crate::error::{IngestError, StoreError};
use crate::event::{
    CallpathEvent, ContextEvent, RawEvent, TraceEvent, ValueEvent, CONTEXTS_ROOT, PARENT_FIELD,
    VALUES_ROOT,
};
use crate::storage::{StateSystem, StateValue, Timestamp};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Layout version of the attributes written by [`StateProvider`]. Bump it
/// whenever the attribute tree changes shape.
pub const PROVIDER_VERSION: u32 = 3;

/// Counters kept by a [`StateProvider`] over one trace.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestStats {
    pub events: u64,
    pub contexts: u64,
    pub callpaths: u64,
    pub values: u64,
    pub unknown_kinds: u64,
    pub missing_parents: u64,
    pub malformed: u64,
    pub conflicts: u64,
    pub store_errors: u64,
}

impl IngestStats {
    /// Events that were dropped for any reason. A conflicting redefinition
    /// is dropped too, since the first definition wins.
    pub fn dropped(&self) -> u64 {
        self.unknown_kinds
            + self.missing_parents
            + self.malformed
            + self.conflicts
            + self.store_errors
    }

    fn count_error(&mut self, err: &IngestError) {
        match err {
            IngestError::MissingParent { .. } => self.missing_parents += 1,
            IngestError::UnknownEventKind(_) => self.unknown_kinds += 1,
            IngestError::MalformedField { .. } => self.malformed += 1,
            IngestError::CallpathConflict { .. } => self.conflicts += 1,
            IngestError::Store(_) => self.store_errors += 1,
        }
    }
}

/// Sole writer of one trace's state system.
///
/// Consumes events in arrival order and dispatches them by kind. No single
/// event can abort ingestion: failures are logged, counted and skipped.
pub struct StateProvider {
    store: Arc<dyn StateSystem>,
    contexts: ContextRegistry,
    callpaths: CallpathResolver,
    stats: IngestStats,
}

impl StateProvider {
    pub fn new(store: Arc<dyn StateSystem>) -> Self {
        Self {
            store,
            contexts: ContextRegistry::new(),
            callpaths: CallpathResolver::new(),
            stats: IngestStats::default(),
        }
    }

    /// Process one raw event, never failing.
    pub fn process(&mut self, raw: &RawEvent) {
        self.stats.events += 1;
        if let Err(e) = self.handle(raw) {
            self.stats.count_error(&e);
            match &e {
                IngestError::UnknownEventKind(kind) => {
                    tracing::debug!(kind = %kind, "dropping event of unknown kind")
                }
                _ => tracing::warn!(
                    event = %raw.name,
                    timestamp = raw.timestamp,
                    "dropping event: {}",
                    e
                ),
            }
        }
    }

    /// Validate and apply one raw event.
    pub fn handle(&mut self, raw: &RawEvent) -> Result<(), IngestError> {
        match TraceEvent::from_raw(raw)? {
            TraceEvent::Context(event) => self.handle_context(event),
            TraceEvent::Callpath(event) => self.handle_callpath(event),
            TraceEvent::Value(event) => self.handle_value(event, raw.timestamp),
        }
    }

    fn handle_context(&mut self, event: ContextEvent) -> Result<(), IngestError> {
        let context = Context::new(
            event.id,
            event.file,
            event.function,
            event.line,
            event.name,
            event.type_size,
        );
        match self.contexts.record(context.clone()) {
            RecordOutcome::Inserted => {}
            RecordOutcome::Duplicate => return Ok(()),
            RecordOutcome::Conflict => {
                self.stats.conflicts += 1;
                return Ok(());
            }
        }

        let store = self.store.as_ref();
        let at = store.start_time();
        let root = store.quark_absolute_and_add(&[CONTEXTS_ROOT, &context.id.to_string()]);
        let fields = [
            ("file", StateValue::Str(context.file)),
            ("function", StateValue::Str(context.function)),
            ("line", StateValue::Int(context.line)),
            ("name", StateValue::Str(context.name)),
            ("type", StateValue::Str(event.type_repr)),
        ];
        for (field, value) in fields {
            let quark = store.quark_relative_and_add(root, field)?;
            store.modify_attribute(at, value, quark)?;
        }

        self.stats.contexts += 1;
        tracing::debug!(id = context.id, "context recorded");
        Ok(())
    }

    fn handle_callpath(&mut self, event: CallpathEvent) -> Result<(), IngestError> {
        let quark =
            self.callpaths
                .resolve(self.store.as_ref(), event.id, event.parent, &event.name)?;
        self.stats.callpaths += 1;
        tracing::debug!(id = event.id, parent = event.parent, %quark, "callpath resolved");
        Ok(())
    }

    fn handle_value(&mut self, event: ValueEvent, timestamp: Timestamp) -> Result<(), IngestError> {
        let store = self.store.as_ref();
        let variable = store.quark_absolute_and_add(&[VALUES_ROOT, &event.context.to_string()]);

        for (field, value) in event.fields() {
            let quark = store.quark_relative_and_add(variable, field)?;
            store.modify_attribute(timestamp, StateValue::Double(value), quark)?;
        }
        let parent = store.quark_relative_and_add(variable, PARENT_FIELD)?;
        store.modify_attribute(timestamp, StateValue::Long(event.parent), parent)?;

        self.stats.values += 1;
        Ok(())
    }

    /// Mark the history complete. Never moves the end time backwards.
    pub fn finish(&mut self, end_time: Timestamp) {
        let end = end_time.max(self.store.current_end_time());
        self.store.close_history(end);
        tracing::info!(
            end_time = end,
            events = self.stats.events,
            dropped = self.stats.dropped(),
            "ingestion finished"
        );
    }

    /// Drop both side tables and rebuild them from the store.
    pub fn rehydrate(&mut self) -> Result<(), StoreError> {
        self.contexts.rehydrate(self.store.as_ref());
        self.callpaths.rehydrate(self.store.as_ref())?;
        Ok(())
    }

    pub fn stats(&self) -> &IngestStats {
        &self.stats
    }

    pub fn contexts(&self) -> &ContextRegistry {
        &self.contexts
    }

    pub fn callpaths(&self) -> &CallpathResolver {
        &self.callpaths
    }

    pub fn store(&self) -> Arc<dyn StateSystem> {
        Arc::clone(&self.store)
    }
}
