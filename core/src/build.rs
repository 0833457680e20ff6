//! Incremental visual tree construction.
//!
//! [`VisualTreeBuilder`] follows a state system while it is still being
//! written: it waits for progress with a bounded timeout, then extends the
//! tree over the newly available time range only. Callpath entries are
//! created once per callpath node, variable entries once per tracked
//! variable, and samples are appended bucket by bucket.

use crate::config::BuildConfig;
use crate::context::{Context, ContextRegistry};
use crate::error::{BuildError, StoreError};
use crate::event::{CALLPATH_ROOT, PARENT_FIELD, VALUES_ROOT};
use crate::query::{self, Bucket};
use crate::storage::{Quark, StateSystem, Timestamp};
use futures::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Cooperative cancellation shared between a build and its owner.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// At most one in-flight build per trace.
#[derive(Debug, Clone, Default)]
pub struct BuildSlot(Arc<AtomicBool>);

impl BuildSlot {
    pub fn acquire(&self) -> Result<BuildGuard, BuildError> {
        self.0
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| BuildError::AlreadyRunning)?;
        Ok(BuildGuard(Arc::clone(&self.0)))
    }

    pub fn is_running(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Releases its [`BuildSlot`] on drop.
#[derive(Debug)]
pub struct BuildGuard(Arc<AtomicBool>);

impl Drop for BuildGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildState {
    Idle,
    WaitingForProgress,
    Extending,
    Complete,
    Cancelled,
}

impl BuildState {
    pub fn is_terminal(self) -> bool {
        matches!(self, BuildState::Complete | BuildState::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    TraceRoot,
    Callpath,
    Variable,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisualEntry {
    pub quark: Option<Quark>,
    pub name: String,
    pub kind: EntryKind,
    pub parent: Option<usize>,
    pub callpath_id: Option<i64>,
    pub context_id: Option<u64>,
    pub type_size: i32,
    pub line: i32,
    pub file: String,
    pub start_time: Timestamp,
    pub end_time: Timestamp,
    pub samples: Vec<Bucket>,
    pub children: Vec<usize>,
}

impl VisualEntry {
    fn new(kind: EntryKind, name: String, start_time: Timestamp, end_time: Timestamp) -> Self {
        Self {
            quark: None,
            name,
            kind,
            parent: None,
            callpath_id: None,
            context_id: None,
            type_size: 0,
            line: 0,
            file: String::new(),
            start_time,
            end_time,
            samples: Vec::new(),
            children: Vec::new(),
        }
    }

    fn apply_context(&mut self, context: &Context) {
        self.name = context.name.clone();
        self.type_size = context.type_size;
        self.line = context.line;
        self.file = context.file.clone();
    }

    pub fn is_variable(&self) -> bool {
        self.kind == EntryKind::Variable
    }
}

/// Arena of entries; index 0 is the trace root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisualTree {
    pub(crate) entries: Vec<VisualEntry>,
}

impl VisualTree {
    pub const ROOT: usize = 0;

    pub fn new(trace_name: impl Into<String>, start_time: Timestamp) -> Self {
        Self {
            entries: vec![VisualEntry::new(
                EntryKind::TraceRoot,
                trace_name.into(),
                start_time,
                start_time,
            )],
        }
    }

    pub fn root(&self) -> &VisualEntry {
        &self.entries[Self::ROOT]
    }

    pub fn get(&self, index: usize) -> Option<&VisualEntry> {
        self.entries.get(index)
    }

    pub fn entries(&self) -> &[VisualEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.len() <= 1
    }

    pub fn children(&self, index: usize) -> impl Iterator<Item = &VisualEntry> {
        self.entries
            .get(index)
            .map(|e| e.children.as_slice())
            .unwrap_or(&[])
            .iter()
            .filter_map(|&i| self.entries.get(i))
    }

    /// First entry named `name`, in creation order.
    pub fn find(&self, name: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.name == name)
    }

    pub fn parent(&self, index: usize) -> Option<&VisualEntry> {
        self.entries
            .get(index)
            .and_then(|e| e.parent)
            .and_then(|p| self.entries.get(p))
    }

    /// Names from just below the root down to `index`.
    pub fn path(&self, index: usize) -> Vec<&str> {
        let mut names = Vec::new();
        let mut cursor = Some(index);
        while let Some(i) = cursor {
            let Some(entry) = self.entries.get(i) else {
                break;
            };
            if entry.kind == EntryKind::TraceRoot {
                break;
            }
            names.push(entry.name.as_str());
            cursor = entry.parent;
        }
        names.reverse();
        names
    }

    pub fn variables(&self) -> impl Iterator<Item = &VisualEntry> {
        self.entries.iter().filter(|e| e.is_variable())
    }

    fn push(&mut self, parent: usize, mut entry: VisualEntry) -> usize {
        let index = self.entries.len();
        entry.parent = Some(parent);
        self.entries.push(entry);
        if let Some(p) = self.entries.get_mut(parent) {
            p.children.push(index);
        }
        index
    }

    /// Indented outline, one entry per line.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let mut stack = vec![(Self::ROOT, 0usize)];
        while let Some((index, depth)) = stack.pop() {
            let Some(entry) = self.entries.get(index) else {
                continue;
            };
            let _ = write!(out, "{}{}", "  ".repeat(depth), entry.name);
            if entry.is_variable() {
                let _ = write!(out, " ({}:{}, {} samples)", entry.file, entry.line, entry.samples.len());
            }
            out.push('\n');
            stack.extend(entry.children.iter().rev().map(|&c| (c, depth + 1)));
        }
        out
    }
}

/// Incremental updates emitted while building.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum VisualEvent {
    EntryAdded {
        index: usize,
        parent: Option<usize>,
        name: String,
        kind: EntryKind,
    },
    EntryExtended {
        index: usize,
        end_time: Timestamp,
    },
    SamplesAdded {
        index: usize,
        buckets: Vec<Bucket>,
    },
    StateChanged {
        from: BuildState,
        to: BuildState,
    },
}

pub struct VisualTreeBuilder {
    store: Arc<dyn StateSystem>,
    config: BuildConfig,
    cancel: CancellationFlag,
    _guard: Option<BuildGuard>,
    state: BuildState,
    last_seen: Timestamp,
    passes: u64,
    tree: VisualTree,
    contexts: ContextRegistry,
    callpath_entries: HashMap<Quark, usize>,
    callpath_ids: HashMap<i64, usize>,
    variable_entries: Vec<usize>,
    variable_index: HashMap<Quark, usize>,
    unnamed: HashSet<usize>,
    pending: VecDeque<VisualEvent>,
    error: Option<StoreError>,
}

impl VisualTreeBuilder {
    pub fn new(
        store: Arc<dyn StateSystem>,
        config: BuildConfig,
        trace_name: impl Into<String>,
    ) -> Self {
        let start = store.start_time();
        Self {
            tree: VisualTree::new(trace_name, start),
            store,
            config,
            cancel: CancellationFlag::new(),
            _guard: None,
            state: BuildState::Idle,
            last_seen: start,
            passes: 0,
            contexts: ContextRegistry::new(),
            callpath_entries: HashMap::new(),
            callpath_ids: HashMap::new(),
            variable_entries: Vec::new(),
            variable_index: HashMap::new(),
            unnamed: HashSet::new(),
            pending: VecDeque::new(),
            error: None,
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationFlag) -> Self {
        self.cancel = cancel;
        self
    }

    /// Hold `guard` until this builder is dropped.
    pub fn with_guard(mut self, guard: BuildGuard) -> Self {
        self._guard = Some(guard);
        self
    }

    pub fn state(&self) -> BuildState {
        self.state
    }

    pub fn tree(&self) -> &VisualTree {
        &self.tree
    }

    pub fn cancellation(&self) -> CancellationFlag {
        self.cancel.clone()
    }

    /// Next incremental update, or `None` once the build is over.
    pub async fn next_event(&mut self) -> Option<VisualEvent> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Some(event);
            }
            if self.state.is_terminal() {
                return None;
            }
            self.step().await;
        }
    }

    /// Drive the build to its end, discarding the updates.
    pub async fn run(&mut self) -> Result<BuildState, BuildError> {
        while self.next_event().await.is_some() {}
        match self.error.take() {
            Some(e) => Err(e.into()),
            None => Ok(self.state),
        }
    }

    /// Lazy stream of updates. Dropping it stops the build.
    pub fn into_stream(self) -> impl Stream<Item = VisualEvent> + Send {
        stream::unfold(self, |mut builder| async move {
            let event = builder.next_event().await?;
            Some((event, builder))
        })
    }

    fn transition(&mut self, to: BuildState) {
        if self.state != to {
            tracing::debug!(from = ?self.state, to = ?to, "visual tree build");
            self.pending.push_back(VisualEvent::StateChanged {
                from: self.state,
                to,
            });
            self.state = to;
        }
    }

    async fn step(&mut self) {
        match self.state {
            BuildState::Idle => {
                let root = self.tree.root();
                self.pending.push_back(VisualEvent::EntryAdded {
                    index: VisualTree::ROOT,
                    parent: None,
                    name: root.name.clone(),
                    kind: root.kind,
                });
                self.transition(BuildState::WaitingForProgress);
            }
            BuildState::WaitingForProgress | BuildState::Extending => {
                let timeout = Duration::from_millis(self.config.update_timeout_ms);
                let complete = self.store.wait_until_built(timeout).await;
                if self.cancel.is_cancelled() || self.store.is_cancelled() {
                    self.transition(BuildState::Cancelled);
                    return;
                }

                let end = self.store.current_end_time();
                if end == self.last_seen && !complete {
                    return;
                }

                self.transition(BuildState::Extending);
                if let Err(e) = self.extend(end) {
                    tracing::warn!("visual tree build stopped: {}", e);
                    self.error = Some(e);
                    self.transition(BuildState::Cancelled);
                    return;
                }
                self.passes += 1;

                if complete {
                    tracing::info!(
                        entries = self.tree.len(),
                        passes = self.passes,
                        "visual tree complete"
                    );
                    self.transition(BuildState::Complete);
                } else {
                    self.last_seen = end;
                    self.transition(BuildState::WaitingForProgress);
                }
            }
            BuildState::Complete | BuildState::Cancelled => {}
        }
    }

    /// One pass over `(last_seen, new_end]`.
    fn extend(&mut self, new_end: Timestamp) -> Result<(), StoreError> {
        if let Some(root) = self.tree.entries.get_mut(VisualTree::ROOT) {
            root.end_time = new_end;
        }
        self.add_callpaths(new_end)?;
        self.contexts.rehydrate(self.store.as_ref());
        let fresh = self.add_variables(new_end);
        self.name_variables();
        self.populate(new_end, &fresh);
        Ok(())
    }

    fn add_entry(&mut self, parent: usize, entry: VisualEntry) -> usize {
        let name = entry.name.clone();
        let kind = entry.kind;
        let index = self.tree.push(parent, entry);
        self.pending.push_back(VisualEvent::EntryAdded {
            index,
            parent: Some(parent),
            name,
            kind,
        });
        index
    }

    /// Create entries for callpath nodes not represented yet. A node whose id
    /// is not readable yet is left, with its subtree, for a later pass.
    fn add_callpaths(&mut self, new_end: Timestamp) -> Result<(), StoreError> {
        let store = Arc::clone(&self.store);
        let Ok(root) = store.quark_absolute(&[CALLPATH_ROOT]) else {
            return Ok(());
        };
        let start = store.start_time();
        let mut stack: Vec<(Quark, usize)> = store
            .sub_attributes(root, false)?
            .into_iter()
            .rev()
            .map(|q| (q, VisualTree::ROOT))
            .collect();

        while let Some((quark, parent)) = stack.pop() {
            let index = match self.callpath_entries.get(&quark) {
                Some(&index) => index,
                None => {
                    let Ok(id) = store.query_single_state(start, quark)?.value.unbox_long() else {
                        continue;
                    };
                    let mut entry = VisualEntry::new(
                        EntryKind::Callpath,
                        store.attribute_name(quark)?,
                        start,
                        new_end,
                    );
                    entry.quark = Some(quark);
                    entry.callpath_id = Some(id);
                    let index = self.add_entry(parent, entry);
                    self.callpath_entries.insert(quark, index);
                    self.callpath_ids.insert(id, index);
                    index
                }
            };
            if let Some(entry) = self.tree.entries.get_mut(index) {
                entry.end_time = new_end;
            }
            stack.extend(
                store
                    .sub_attributes(quark, false)?
                    .into_iter()
                    .rev()
                    .map(|q| (q, index)),
            );
        }
        Ok(())
    }

    /// Create entries for variables seen for the first time; returns them.
    fn add_variables(&mut self, new_end: Timestamp) -> HashSet<usize> {
        let store = Arc::clone(&self.store);
        let at = store.current_end_time();
        let mut fresh = HashSet::new();

        for quark in store.quarks(&[VALUES_ROOT, "*"]) {
            if self.variable_index.contains_key(&quark) {
                continue;
            }
            let Some(parent_id) = store
                .quark_relative(quark, PARENT_FIELD)
                .ok()
                .and_then(|q| store.query_single_state(at, q).ok())
                .and_then(|interval| interval.value.unbox_long().ok())
            else {
                // The value event is still being written.
                continue;
            };
            let parent = self
                .callpath_ids
                .get(&parent_id)
                .copied()
                .unwrap_or(VisualTree::ROOT);

            let context_id = query::context_id_of(store.as_ref(), quark);
            let name = store.attribute_name(quark).unwrap_or_default();
            let mut entry = VisualEntry::new(EntryKind::Variable, name, store.start_time(), new_end);
            entry.quark = Some(quark);
            entry.context_id = context_id;
            let context = context_id.and_then(|id| self.contexts.lookup(id));
            if let Some(context) = context {
                entry.apply_context(context);
            }
            let named = context.is_some();

            let index = self.add_entry(parent, entry);
            self.variable_index.insert(quark, index);
            self.variable_entries.push(index);
            if !named {
                self.unnamed.insert(index);
            }
            fresh.insert(index);
        }
        fresh
    }

    /// Fill in metadata for variables whose context has become known.
    fn name_variables(&mut self) {
        let contexts = &self.contexts;
        let entries = &mut self.tree.entries;
        self.unnamed.retain(|&index| {
            let Some(entry) = entries.get_mut(index) else {
                return false;
            };
            match entry.context_id.and_then(|id| contexts.lookup(id)) {
                Some(context) => {
                    entry.apply_context(context);
                    false
                }
                None => true,
            }
        });
    }

    fn populate(&mut self, new_end: Timestamp, fresh: &HashSet<usize>) {
        let store = Arc::clone(&self.store);
        for &index in &self.variable_entries {
            let is_fresh = fresh.contains(&index);
            let Some(entry) = self.tree.entries.get_mut(index) else {
                continue;
            };
            let Some(quark) = entry.quark else {
                continue;
            };
            entry.end_time = new_end;
            self.pending.push_back(VisualEvent::EntryExtended {
                index,
                end_time: new_end,
            });

            let from = if is_fresh { store.start_time() } else { self.last_seen };
            if from >= new_end && !is_fresh {
                continue;
            }
            let width = query::bucket_width(
                from,
                new_end,
                self.config.display_width,
                self.config.bucket_multiplier,
            );
            let buckets = query::series(
                store.as_ref(),
                quark,
                &self.config.sample_field,
                from,
                new_end,
                width,
            )
            .collect_buckets();
            if buckets.is_empty() {
                continue;
            }
            entry.samples.extend_from_slice(&buckets);
            self.pending
                .push_back(VisualEvent::SamplesAdded { index, buckets });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::RawEvent;
    use crate::ingest::StateProvider;
    use crate::storage::{MemoryStateSystem, StateValue};
    use futures::StreamExt;
    use serde_json::json;

    fn config() -> BuildConfig {
        BuildConfig {
            update_timeout_ms: 20,
            display_width: 10,
            ..BuildConfig::default()
        }
    }

    fn raw(value: serde_json::Value) -> RawEvent {
        serde_json::from_value(value).unwrap()
    }

    fn scenario(provider: &mut StateProvider) {
        provider.process(&raw(json!({
            "name": "context", "timestamp": 0,
            "fields": {"id": 42, "file": "a.c", "function": "f", "line": 10, "name": "x", "type": "8"}
        })));
        provider.process(&raw(json!({
            "name": "callpath", "timestamp": 0,
            "fields": {"id": 1, "parent": 0, "name": "main"}
        })));
        provider.process(&raw(json!({
            "name": "value", "timestamp": 100,
            "fields": {"context": 42, "parent": 1, "mean": 1.0, "min": 0.5, "max": 2.0,
                       "median": 1.0, "std": 0.1, "significant_digits": 6.0}
        })));
    }

    /// Events up to the end of the first extending pass.
    async fn first_pass(builder: &mut VisualTreeBuilder) -> Vec<VisualEvent> {
        let mut events = Vec::new();
        while let Some(event) = builder.next_event().await {
            let done = event
                == VisualEvent::StateChanged {
                    from: BuildState::Extending,
                    to: BuildState::WaitingForProgress,
                };
            events.push(event);
            if done {
                break;
            }
        }
        events
    }

    fn added(events: &[VisualEvent]) -> Vec<&str> {
        events
            .iter()
            .filter_map(|e| match e {
                VisualEvent::EntryAdded { name, .. } => Some(name.as_str()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_builds_callpath_and_variable() {
        let store = Arc::new(MemoryStateSystem::new(0));
        let mut provider = StateProvider::new(store.clone());
        scenario(&mut provider);
        provider.finish(100);

        let mut builder = VisualTreeBuilder::new(store, config(), "trace");
        assert_eq!(builder.run().await.unwrap(), BuildState::Complete);

        let tree = builder.tree();
        let x = tree.find("x").unwrap();
        assert_eq!(tree.path(x), vec!["main", "x"]);
        let entry = tree.get(x).unwrap();
        assert_eq!(entry.type_size, 8);
        assert_eq!(entry.file, "a.c");
        assert_eq!(entry.samples.last().unwrap().value, 6.0);
        assert!(tree.render().contains("  main\n    x (a.c:10"));
    }

    #[tokio::test]
    async fn test_variable_without_known_callpath_goes_under_root() {
        let store = Arc::new(MemoryStateSystem::new(0));
        let mut provider = StateProvider::new(store.clone());
        provider.process(&raw(json!({
            "name": "value", "timestamp": 10,
            "fields": {"context": 5, "parent": 77, "mean": 1.0, "min": 0.5, "max": 2.0,
                       "median": 1.0, "std": 0.1, "significant_digits": 2.0}
        })));
        provider.finish(10);

        let mut builder = VisualTreeBuilder::new(store, config(), "trace");
        builder.run().await.unwrap();
        let tree = builder.tree();
        let v = tree.find("5").unwrap();
        assert_eq!(tree.get(v).unwrap().parent, Some(VisualTree::ROOT));
    }

    #[tokio::test]
    async fn test_incremental_passes_extend_entries_once() {
        let store = Arc::new(MemoryStateSystem::new(0));
        let mut provider = StateProvider::new(store.clone());
        scenario(&mut provider);

        let mut builder = VisualTreeBuilder::new(store.clone(), config(), "trace");
        let mut events = first_pass(&mut builder).await;

        provider.process(&raw(json!({
            "name": "value", "timestamp": 200,
            "fields": {"context": 42, "parent": 1, "mean": 1.0, "min": 0.5, "max": 2.0,
                       "median": 1.0, "std": 0.1, "significant_digits": 1.0}
        })));
        provider.finish(200);
        while let Some(event) = builder.next_event().await {
            events.push(event);
        }

        assert_eq!(added(&events), vec!["trace", "main", "x"]);
        assert_eq!(builder.state(), BuildState::Complete);

        let tree = builder.tree();
        let x = tree.get(tree.find("x").unwrap()).unwrap();
        assert_eq!(x.end_time, 200);
        assert_eq!(x.samples.last().unwrap().value, 1.0);
        assert!(x.samples.windows(2).all(|w| w[0].start <= w[1].start));
    }

    #[tokio::test]
    async fn test_value_without_parent_waits_for_a_later_pass() {
        let store = Arc::new(MemoryStateSystem::new(0));
        let mut provider = StateProvider::new(store.clone());
        provider.process(&raw(json!({
            "name": "context", "timestamp": 0,
            "fields": {"id": 42, "file": "a.c", "function": "f", "line": 10, "name": "x", "type": "8"}
        })));
        provider.process(&raw(json!({
            "name": "callpath", "timestamp": 0,
            "fields": {"id": 1, "parent": 0, "name": "main"}
        })));
        // A value whose fields are only partly written.
        let variable = store.quark_absolute_and_add(&[VALUES_ROOT, "42"]);
        let digits = store
            .quark_relative_and_add(variable, "significant_digits")
            .unwrap();
        store
            .modify_attribute(10, StateValue::Double(3.0), digits)
            .unwrap();

        let mut builder = VisualTreeBuilder::new(store.clone(), config(), "trace");
        let mut events = first_pass(&mut builder).await;
        assert_eq!(added(&events), vec!["trace", "main"]);
        assert!(builder.tree().find("x").is_none());

        let parent = store.quark_relative_and_add(variable, PARENT_FIELD).unwrap();
        store.modify_attribute(20, StateValue::Long(1), parent).unwrap();
        store.close_history(20);
        while let Some(event) = builder.next_event().await {
            events.push(event);
        }

        assert_eq!(builder.state(), BuildState::Complete);
        assert_eq!(added(&events), vec!["trace", "main", "x"]);
        let tree = builder.tree();
        let x = tree.find("x").unwrap();
        assert_eq!(tree.path(x), vec!["main", "x"]);
        let entry = tree.get(x).unwrap();
        assert_eq!(entry.end_time, 20);
        assert!(entry.samples.iter().any(|b| b.value == 3.0));
    }

    #[tokio::test]
    async fn test_variable_keeps_its_first_parent() {
        let store = Arc::new(MemoryStateSystem::new(0));
        let mut provider = StateProvider::new(store.clone());
        scenario(&mut provider);

        let mut builder = VisualTreeBuilder::new(store.clone(), config(), "trace");
        let mut events = first_pass(&mut builder).await;

        provider.process(&raw(json!({
            "name": "callpath", "timestamp": 0,
            "fields": {"id": 2, "parent": 1, "name": "solve"}
        })));
        provider.process(&raw(json!({
            "name": "value", "timestamp": 200,
            "fields": {"context": 42, "parent": 2, "mean": 1.0, "min": 0.5, "max": 2.0,
                       "median": 1.0, "std": 0.1, "significant_digits": 2.0}
        })));
        provider.finish(200);
        while let Some(event) = builder.next_event().await {
            events.push(event);
        }

        assert_eq!(added(&events), vec!["trace", "main", "x", "solve"]);
        let tree = builder.tree();
        assert_eq!(tree.entries.iter().filter(|e| e.name == "x").count(), 1);
        let x = tree.find("x").unwrap();
        assert_eq!(tree.path(x), vec!["main", "x"]);
        assert_eq!(tree.path(tree.find("solve").unwrap()), vec!["main", "solve"]);
        let entry = tree.get(x).unwrap();
        assert_eq!(entry.end_time, 200);
        assert_eq!(entry.samples.last().unwrap().value, 2.0);
    }

    #[tokio::test]
    async fn test_cancellation_keeps_built_entries() {
        let store = Arc::new(MemoryStateSystem::new(0));
        let mut provider = StateProvider::new(store.clone());
        scenario(&mut provider);

        let cancel = CancellationFlag::new();
        let mut builder =
            VisualTreeBuilder::new(store, config(), "trace").with_cancellation(cancel.clone());
        while let Some(event) = builder.next_event().await {
            if let VisualEvent::StateChanged {
                to: BuildState::WaitingForProgress,
                from: BuildState::Extending,
            } = event
            {
                cancel.cancel();
            }
        }
        assert_eq!(builder.state(), BuildState::Cancelled);
        assert!(builder.tree().find("x").is_some());
    }

    #[tokio::test]
    async fn test_second_build_is_rejected() {
        let slot = BuildSlot::default();
        let guard = slot.acquire().unwrap();
        assert_eq!(slot.acquire().unwrap_err(), BuildError::AlreadyRunning);

        let store = Arc::new(MemoryStateSystem::new(0));
        store.close_history(0);
        let builder = VisualTreeBuilder::new(store, config(), "trace").with_guard(guard);
        assert!(slot.is_running());
        let events: Vec<_> = builder.into_stream().collect().await;
        assert!(matches!(
            events.last(),
            Some(VisualEvent::StateChanged {
                to: BuildState::Complete,
                ..
            })
        ));
        assert!(!slot.is_running());
        assert!(slot.acquire().is_ok());
    }

    #[tokio::test]
    async fn test_disposed_store_cancels_build() {
        let store = Arc::new(MemoryStateSystem::new(0));
        store.dispose();
        let mut builder = VisualTreeBuilder::new(store, config(), "trace");
        assert_eq!(builder.run().await.unwrap(), BuildState::Cancelled);
    }
}
