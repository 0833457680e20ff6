use super::storage_trait::StateSystem;
use super::types::{FullState, Interval, Quark, StateValue, Timestamp};
use crate::config::StoreConfig;
use crate::error::StoreError;
use async_trait::async_trait;
use lru::LruCache;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::sync::Notify;

const DEFAULT_SNAPSHOT_CACHE_CAPACITY: usize = 64;

#[derive(Debug)]
struct AttributeNode {
    name: String,
    parent: Option<Quark>,
    children: Vec<Quark>,
    child_index: HashMap<String, Quark>,
}

/// Attribute hierarchy. Top-level attributes hang off an implicit root.
#[derive(Debug, Default)]
struct AttributeTree {
    nodes: Vec<AttributeNode>,
    roots: Vec<Quark>,
    root_index: HashMap<String, Quark>,
}

impl AttributeTree {
    fn node(&self, quark: Quark) -> Result<&AttributeNode, StoreError> {
        self.nodes
            .get(quark.index())
            .ok_or(StoreError::InvalidQuark(quark))
    }

    fn child(&self, parent: Option<Quark>, name: &str) -> Option<Quark> {
        match parent {
            None => self.root_index.get(name).copied(),
            Some(p) => self
                .nodes
                .get(p.index())
                .and_then(|node| node.child_index.get(name).copied()),
        }
    }

    fn children(&self, parent: Option<Quark>) -> &[Quark] {
        match parent {
            None => &self.roots,
            Some(p) => self
                .nodes
                .get(p.index())
                .map(|node| node.children.as_slice())
                .unwrap_or(&[]),
        }
    }

    fn push(&mut self, parent: Option<Quark>, name: &str) -> Quark {
        let quark = Quark(self.nodes.len() as u32);
        self.nodes.push(AttributeNode {
            name: name.to_string(),
            parent,
            children: Vec::new(),
            child_index: HashMap::new(),
        });
        match parent {
            None => {
                self.roots.push(quark);
                self.root_index.insert(name.to_string(), quark);
            }
            Some(p) => {
                let node = &mut self.nodes[p.index()];
                node.children.push(quark);
                node.child_index.insert(name.to_string(), quark);
            }
        }
        quark
    }

    fn path(&self, quark: Quark) -> Result<String, StoreError> {
        let mut parts = Vec::new();
        let mut cursor = Some(quark);
        while let Some(q) = cursor {
            let node = self.node(q)?;
            parts.push(node.name.as_str());
            cursor = node.parent;
        }
        parts.reverse();
        Ok(parts.join("/"))
    }
}

/// State changes of one attribute, sorted by time.
#[derive(Debug, Default)]
struct History {
    changes: Vec<(Timestamp, StateValue)>,
}

impl History {
    fn interval_at(
        &self,
        quark: Quark,
        time: Timestamp,
        start_time: Timestamp,
        end_time: Timestamp,
    ) -> Interval {
        let idx = self.changes.partition_point(|(t, _)| *t <= time);
        let end = self
            .changes
            .get(idx)
            .map(|(next, _)| next - 1)
            .unwrap_or(end_time);
        match idx.checked_sub(1).and_then(|i| self.changes.get(i)) {
            Some((start, value)) => Interval {
                quark,
                start: *start,
                end,
                value: value.clone(),
            },
            None => Interval::null(quark, start_time, end),
        }
    }
}

/// Pure in-memory state system.
///
/// The attribute tree and the per-attribute histories live behind separate
/// locks (always taken tree first). Full-state snapshots are memoized in an
/// LRU keyed by timestamp and tagged with the write generation they were
/// computed at, so any later write makes them stale.
pub struct MemoryStateSystem {
    start_time: Timestamp,
    end_time: AtomicI64,
    tree: RwLock<AttributeTree>,
    histories: RwLock<Vec<History>>,
    generation: AtomicU64,
    snapshots: Mutex<LruCache<Timestamp, (u64, FullState)>>,
    built: AtomicBool,
    cancelled: AtomicBool,
    disposed: AtomicBool,
    progress: Notify,
}

impl MemoryStateSystem {
    pub fn new(start_time: Timestamp) -> Self {
        Self::with_capacity(start_time, DEFAULT_SNAPSHOT_CACHE_CAPACITY)
    }

    pub fn with_config(start_time: Timestamp, config: &StoreConfig) -> Self {
        Self::with_capacity(start_time, config.snapshot_cache_capacity)
    }

    fn with_capacity(start_time: Timestamp, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            start_time,
            end_time: AtomicI64::new(start_time),
            tree: RwLock::new(AttributeTree::default()),
            histories: RwLock::new(Vec::new()),
            generation: AtomicU64::new(0),
            snapshots: Mutex::new(LruCache::new(capacity)),
            built: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            progress: Notify::new(),
        }
    }

    fn read_tree(&self) -> RwLockReadGuard<'_, AttributeTree> {
        self.tree.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_tree(&self) -> RwLockWriteGuard<'_, AttributeTree> {
        self.tree.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn read_histories(&self) -> RwLockReadGuard<'_, Vec<History>> {
        self.histories.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_histories(&self) -> RwLockWriteGuard<'_, Vec<History>> {
        self.histories.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_live(&self) -> Result<(), StoreError> {
        if self.disposed.load(Ordering::Acquire) {
            Err(StoreError::Disposed)
        } else {
            Ok(())
        }
    }

    fn check_time(&self, time: Timestamp) -> Result<(), StoreError> {
        let end = self.current_end_time();
        if time < self.start_time || time > end {
            return Err(StoreError::TimeRange {
                time,
                start: self.start_time,
                end,
            });
        }
        Ok(())
    }

    fn get_or_add(&self, parent: Option<Quark>, name: &str) -> Quark {
        if let Some(quark) = self.read_tree().child(parent, name) {
            return quark;
        }
        let mut tree = self.write_tree();
        // Another writer may have raced us between the two locks.
        if let Some(quark) = tree.child(parent, name) {
            return quark;
        }
        let quark = tree.push(parent, name);
        self.write_histories().push(History::default());
        quark
    }

    fn wake_waiters(&self) {
        self.progress.notify_waiters();
    }
}

#[async_trait]
impl StateSystem for MemoryStateSystem {
    fn quark_absolute_and_add(&self, path: &[&str]) -> Quark {
        let mut parent = None;
        for name in path {
            parent = Some(self.get_or_add(parent, name));
        }
        // An empty path resolves to the first top-level attribute slot.
        parent.unwrap_or_else(|| self.get_or_add(None, ""))
    }

    fn quark_relative_and_add(&self, parent: Quark, name: &str) -> Result<Quark, StoreError> {
        self.read_tree().node(parent)?;
        Ok(self.get_or_add(Some(parent), name))
    }

    fn quark_absolute(&self, path: &[&str]) -> Result<Quark, StoreError> {
        let tree = self.read_tree();
        let mut parent = None;
        for name in path {
            parent = Some(tree.child(parent, name).ok_or_else(|| {
                StoreError::AttributeNotFound {
                    path: path.join("/"),
                }
            })?);
        }
        parent.ok_or(StoreError::AttributeNotFound {
            path: String::new(),
        })
    }

    fn quark_relative(&self, parent: Quark, name: &str) -> Result<Quark, StoreError> {
        let tree = self.read_tree();
        tree.node(parent)?;
        tree.child(Some(parent), name)
            .ok_or_else(|| StoreError::AttributeNotFound {
                path: format!("{}/{}", tree.path(parent).unwrap_or_default(), name),
            })
    }

    fn quarks(&self, pattern: &[&str]) -> Vec<Quark> {
        if pattern.is_empty() {
            return Vec::new();
        }
        let tree = self.read_tree();
        let mut frontier: Vec<Option<Quark>> = vec![None];
        for element in pattern {
            let mut next = Vec::new();
            for parent in &frontier {
                if *element == "*" {
                    next.extend(tree.children(*parent).iter().copied().map(Some));
                } else if let Some(child) = tree.child(*parent, element) {
                    next.push(Some(child));
                }
            }
            frontier = next;
        }
        frontier.into_iter().flatten().collect()
    }

    fn sub_attributes(&self, quark: Quark, recursive: bool) -> Result<Vec<Quark>, StoreError> {
        let tree = self.read_tree();
        let node = tree.node(quark)?;
        if !recursive {
            return Ok(node.children.clone());
        }
        let mut out = Vec::new();
        let mut stack: Vec<Quark> = node.children.iter().rev().copied().collect();
        while let Some(q) = stack.pop() {
            out.push(q);
            stack.extend(tree.node(q)?.children.iter().rev().copied());
        }
        Ok(out)
    }

    fn attribute_name(&self, quark: Quark) -> Result<String, StoreError> {
        Ok(self.read_tree().node(quark)?.name.clone())
    }

    fn full_attribute_path(&self, quark: Quark) -> Result<String, StoreError> {
        self.read_tree().path(quark)
    }

    fn attribute_count(&self) -> usize {
        self.read_tree().nodes.len()
    }

    fn modify_attribute(
        &self,
        time: Timestamp,
        value: StateValue,
        quark: Quark,
    ) -> Result<(), StoreError> {
        self.ensure_live()?;
        if time < self.start_time {
            return Err(StoreError::TimeRange {
                time,
                start: self.start_time,
                end: self.current_end_time(),
            });
        }

        let out_of_order = {
            let mut histories = self.write_histories();
            let history = histories
                .get_mut(quark.index())
                .ok_or(StoreError::InvalidQuark(quark))?;
            match history.changes.last_mut() {
                Some((last, _)) if time < *last => Some(*last),
                Some((last, slot)) if time == *last => {
                    *slot = value;
                    None
                }
                _ => {
                    history.changes.push((time, value));
                    None
                }
            }
        };

        if let Some(last) = out_of_order {
            return Err(StoreError::OutOfOrder {
                path: self.full_attribute_path(quark)?,
                time,
                last,
            });
        }

        self.end_time.fetch_max(time, Ordering::AcqRel);
        self.generation.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn close_history(&self, end_time: Timestamp) {
        self.end_time.fetch_max(end_time, Ordering::AcqRel);
        self.built.store(true, Ordering::Release);
        tracing::debug!(end_time, "state system history closed");
        self.wake_waiters();
    }

    fn query_single_state(&self, time: Timestamp, quark: Quark) -> Result<Interval, StoreError> {
        self.ensure_live()?;
        self.check_time(time)?;
        let end = self.current_end_time();
        let histories = self.read_histories();
        let history = histories
            .get(quark.index())
            .ok_or(StoreError::InvalidQuark(quark))?;
        Ok(history.interval_at(quark, time, self.start_time, end))
    }

    fn query_full_state(&self, time: Timestamp) -> Result<FullState, StoreError> {
        self.ensure_live()?;
        self.check_time(time)?;

        let generation = self.generation.load(Ordering::Acquire);
        {
            let mut cache = self.snapshots.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some((cached_at, state)) = cache.get(&time) {
                if *cached_at == generation {
                    return Ok(state.clone());
                }
            }
        }

        let end = self.current_end_time();
        let state: FullState = {
            let histories = self.read_histories();
            histories
                .iter()
                .enumerate()
                .map(|(i, h)| h.interval_at(Quark(i as u32), time, self.start_time, end))
                .collect()
        };

        self.snapshots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .put(time, (generation, state.clone()));
        Ok(state)
    }

    fn start_time(&self) -> Timestamp {
        self.start_time
    }

    fn current_end_time(&self) -> Timestamp {
        self.end_time.load(Ordering::Acquire)
    }

    async fn wait_until_built(&self, timeout: Duration) -> bool {
        if self.is_built() || self.is_cancelled() {
            return self.is_built();
        }
        let notified = self.progress.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        // Re-check after registering so a close between the two checks is not lost.
        if self.is_built() || self.is_cancelled() {
            return self.is_built();
        }
        let _ = tokio::time::timeout(timeout, notified).await;
        self.is_built()
    }

    fn is_built(&self) -> bool {
        self.built.load(Ordering::Acquire)
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.wake_waiters();
    }

    fn dispose(&self) {
        self.disposed.store(true, Ordering::Release);
        self.cancel();
    }
}
