use crate::build::{
    BuildSlot, BuildState, CancellationFlag, VisualEvent, VisualTree, VisualTreeBuilder,
};
use crate::capture::EventCapture;
use crate::config::Config;
use crate::event::RawEvent;
use crate::ingest::{IngestStats, StateProvider};
use crate::storage::{create_state_system, StateSystem, Timestamp};
use anyhow::Result;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::task;
use uuid::Uuid;

/// One trace: its store, capture queue, and the tasks feeding and reading it.
pub struct TraceSession {
    id: Uuid,
    name: String,
    created_at: DateTime<Utc>,
    store: Arc<dyn StateSystem>,
    capture: Arc<EventCapture>,
    closing: AtomicBool,
    end_hint: AtomicI64,
    cancel: CancellationFlag,
    build_slot: BuildSlot,
    stats: RwLock<IngestStats>,
    build_state: RwLock<BuildState>,
    tree: RwLock<Arc<VisualTree>>,
    finished_at: RwLock<Option<DateTime<Utc>>>,
}

/// Serializable view of a [`TraceSession`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceSummary {
    pub id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub closed: bool,
    pub built: bool,
    pub build_state: BuildState,
    pub start_time: Timestamp,
    pub end_time: Timestamp,
    pub attributes: usize,
    pub queued: usize,
    pub stats: IngestStats,
}

impl TraceSession {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn store(&self) -> Arc<dyn StateSystem> {
        Arc::clone(&self.store)
    }

    pub fn is_closed(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    pub async fn stats(&self) -> IngestStats {
        self.stats.read().await.clone()
    }

    pub async fn build_state(&self) -> BuildState {
        *self.build_state.read().await
    }

    /// Latest published visual tree.
    pub async fn tree(&self) -> Arc<VisualTree> {
        Arc::clone(&*self.tree.read().await)
    }

    pub async fn summary(&self) -> TraceSummary {
        TraceSummary {
            id: self.id,
            name: self.name.clone(),
            created_at: self.created_at,
            finished_at: *self.finished_at.read().await,
            closed: self.is_closed(),
            built: self.store.is_built(),
            build_state: self.build_state().await,
            start_time: self.store.start_time(),
            end_time: self.store.current_end_time(),
            attributes: self.store.attribute_count(),
            queued: self.capture.len(),
            stats: self.stats().await,
        }
    }

    fn submit(&self, events: Vec<RawEvent>) -> Result<usize> {
        if self.is_closed() {
            anyhow::bail!("Trace {} is closed", self.id);
        }
        self.capture.capture_batch(events)
    }

    fn close(&self, end_time: Option<Timestamp>) {
        if let Some(end) = end_time {
            self.end_hint.fetch_max(end, Ordering::AcqRel);
        }
        self.closing.store(true, Ordering::Release);
    }

    fn cancel(&self) {
        self.closing.store(true, Ordering::Release);
        self.cancel.cancel();
        self.store.dispose();
    }
}

/// Owns every open trace and drives their ingestion and visual tree builds
pub struct VeritraceEngine {
    config: Config,
    sessions: DashMap<Uuid, Arc<TraceSession>>,
}

impl VeritraceEngine {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            sessions: DashMap::new(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Open a trace and start its ingestion and background build tasks.
    /// Must be called from within a tokio runtime.
    pub fn open_trace(
        &self,
        name: impl Into<String>,
        start_time: Timestamp,
    ) -> Result<Arc<TraceSession>> {
        let name = name.into();
        let store = create_state_system(&self.config.store, start_time)?;
        let session = Arc::new(TraceSession {
            id: Uuid::new_v4(),
            tree: RwLock::new(Arc::new(VisualTree::new(name.clone(), start_time))),
            name,
            created_at: Utc::now(),
            store: Arc::clone(&store),
            capture: Arc::new(EventCapture::new(self.config.engine.buffer_size)),
            closing: AtomicBool::new(false),
            end_hint: AtomicI64::new(start_time),
            cancel: CancellationFlag::new(),
            build_slot: BuildSlot::default(),
            stats: RwLock::new(IngestStats::default()),
            build_state: RwLock::new(BuildState::Idle),
            finished_at: RwLock::new(None),
        });

        let provider = StateProvider::new(store);
        let ingest_session = Arc::clone(&session);
        let engine_config = self.config.engine.clone();
        task::spawn(async move {
            Self::process_events(ingest_session, provider, engine_config).await;
        });

        // The published tree has its own builder; the build slot is left to
        // callers of `build_visual_tree`.
        let builder = VisualTreeBuilder::new(
            session.store(),
            self.config.build.clone(),
            session.name.clone(),
        )
        .with_cancellation(session.cancel.clone());
        let build_session = Arc::clone(&session);
        task::spawn(async move {
            Self::publish_build(build_session, builder).await;
        });

        tracing::info!(trace = %session.id, name = %session.name, start_time, "trace opened");
        self.sessions.insert(session.id, Arc::clone(&session));
        Ok(session)
    }

    /// Drain the capture queue in batches into the provider until the trace
    /// is closed and the queue is empty, or the trace is cancelled.
    async fn process_events(
        session: Arc<TraceSession>,
        mut provider: StateProvider,
        config: crate::config::EngineConfig,
    ) {
        let receiver = session.capture.get_receiver();
        let flush = tokio::time::Duration::from_millis(config.flush_interval_ms);

        loop {
            if session.cancel.is_cancelled() {
                tracing::debug!(trace = %session.id, "ingestion cancelled");
                break;
            }

            let mut batch = Vec::with_capacity(config.batch_size);
            for _ in 0..config.batch_size {
                match receiver.try_recv() {
                    Ok(event) => batch.push(event),
                    Err(_) => break,
                }
            }

            if batch.is_empty() {
                if session.is_closed() {
                    *session.stats.write().await = provider.stats().clone();
                    *session.finished_at.write().await = Some(Utc::now());
                    provider.finish(session.end_hint.load(Ordering::Acquire));
                    break;
                }
                tokio::time::sleep(flush).await;
                continue;
            }

            for event in &batch {
                session.end_hint.fetch_max(event.timestamp, Ordering::AcqRel);
                provider.process(event);
            }
            *session.stats.write().await = provider.stats().clone();
        }
    }

    /// Run the background build, publishing a tree snapshot after each pass.
    async fn publish_build(session: Arc<TraceSession>, mut builder: VisualTreeBuilder) {
        while let Some(event) = builder.next_event().await {
            if let VisualEvent::StateChanged { to, .. } = event {
                // Tree first, so a terminal state always comes with the final tree.
                if to == BuildState::WaitingForProgress || to.is_terminal() {
                    *session.tree.write().await = Arc::new(builder.tree().clone());
                }
                *session.build_state.write().await = to;
            }
        }
        tracing::debug!(trace = %session.id, state = ?builder.state(), "background build finished");
    }

    pub fn session(&self, id: &Uuid) -> Option<Arc<TraceSession>> {
        self.sessions.get(id).map(|s| Arc::clone(s.value()))
    }

    pub async fn sessions(&self) -> Vec<TraceSummary> {
        let sessions: Vec<_> = self.sessions.iter().map(|s| Arc::clone(s.value())).collect();
        let mut out = Vec::with_capacity(sessions.len());
        for session in sessions {
            out.push(session.summary().await);
        }
        out.sort_by_key(|s| s.created_at);
        out
    }

    pub fn trace_count(&self) -> usize {
        self.sessions.len()
    }

    /// Queue a batch of events for ingestion. Either the whole batch is
    /// queued or none of it: fails once the trace is closed or when the
    /// batch does not fit in the queue.
    pub fn submit(&self, id: &Uuid, events: Vec<RawEvent>) -> Result<usize> {
        let session = self
            .session(id)
            .ok_or_else(|| anyhow::anyhow!("Trace not found: {}", id))?;
        session.submit(events)
    }

    /// Stop accepting events; the history is closed once the queue drains.
    pub fn close_trace(&self, id: &Uuid, end_time: Option<Timestamp>) -> Result<()> {
        let session = self
            .session(id)
            .ok_or_else(|| anyhow::anyhow!("Trace not found: {}", id))?;
        session.close(end_time);
        tracing::info!(trace = %id, "trace closed");
        Ok(())
    }

    /// Cancel ingestion and build, then forget the trace.
    pub fn remove_trace(&self, id: &Uuid) -> bool {
        match self.sessions.remove(id) {
            Some((_, session)) => {
                session.cancel();
                tracing::info!(trace = %id, "trace removed");
                true
            }
            None => false,
        }
    }

    /// Start a fresh visual tree build for a trace, usable while the trace is
    /// still being ingested. Fails with
    /// [`BuildError::AlreadyRunning`](crate::error::BuildError) while another
    /// caller's build of the same trace is in flight.
    pub fn build_visual_tree(&self, id: &Uuid) -> Result<impl Stream<Item = VisualEvent> + Send> {
        let session = self
            .session(id)
            .ok_or_else(|| anyhow::anyhow!("Trace not found: {}", id))?;
        let guard = session.build_slot.acquire()?;
        Ok(
            VisualTreeBuilder::new(session.store(), self.config.build.clone(), session.name.clone())
                .with_cancellation(session.cancel.clone())
                .with_guard(guard)
                .into_stream(),
        )
    }

    /// Wait until the trace's history is complete.
    pub async fn wait_until_built(&self, id: &Uuid, timeout: std::time::Duration) -> bool {
        match self.session(id) {
            Some(session) => session.store.wait_until_built(timeout).await,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BuildError;
    use futures::StreamExt;
    use serde_json::json;
    use std::time::Duration;

    fn test_config() -> Config {
        let mut config = Config::default();
        config.engine.flush_interval_ms = 1;
        config.build.update_timeout_ms = 10;
        config
    }

    fn raw(value: serde_json::Value) -> RawEvent {
        serde_json::from_value(value).unwrap()
    }

    fn events() -> Vec<RawEvent> {
        vec![
            raw(json!({"name": "context", "timestamp": 0,
                "fields": {"id": 42, "file": "a.c", "function": "f", "line": 10, "name": "x", "type": "8"}})),
            raw(json!({"name": "callpath", "timestamp": 0,
                "fields": {"id": 1, "parent": 0, "name": "main"}})),
            raw(json!({"name": "value", "timestamp": 100,
                "fields": {"context": 42, "parent": 1, "mean": 1.0, "min": 0.5, "max": 2.0,
                           "median": 1.0, "std": 0.1, "significant_digits": 6.0}})),
        ]
    }

    async fn wait_for_build(session: &TraceSession) {
        for _ in 0..500 {
            if session.build_state().await.is_terminal() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("build did not finish");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_trace_lifecycle() {
        let engine = VeritraceEngine::new(test_config());
        let session = engine.open_trace("run-1", 0).unwrap();
        let id = session.id();

        assert_eq!(engine.submit(&id, events()).unwrap(), 3);
        engine.close_trace(&id, None).unwrap();
        assert!(engine.wait_until_built(&id, Duration::from_secs(5)).await);
        assert!(engine.submit(&id, events()).is_err());

        wait_for_build(&session).await;
        assert_eq!(session.build_state().await, BuildState::Complete);
        let tree = session.tree().await;
        let x = tree.find("x").unwrap();
        assert_eq!(tree.path(x), vec!["main", "x"]);

        let summary = session.summary().await;
        assert!(summary.closed && summary.built);
        assert_eq!(summary.end_time, 100);
        assert_eq!(summary.stats.events, 3);
        assert!(summary.finished_at.is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_build_streams_during_ingestion() {
        let engine = VeritraceEngine::new(test_config());
        let session = engine.open_trace("run-2", 0).unwrap();
        let id = session.id();

        // The background build is running, but callers may still build.
        let mut stream = Box::pin(engine.build_visual_tree(&id).unwrap());
        let err = engine.build_visual_tree(&id).err().unwrap();
        assert_eq!(
            err.downcast_ref::<BuildError>(),
            Some(&BuildError::AlreadyRunning)
        );

        let mut added = Vec::new();
        let mut fed = false;
        while let Some(event) = stream.next().await {
            match event {
                VisualEvent::EntryAdded { name, .. } => added.push(name),
                VisualEvent::StateChanged {
                    to: BuildState::WaitingForProgress,
                    ..
                } if !fed => {
                    engine.submit(&id, events()).unwrap();
                    engine.close_trace(&id, Some(150)).unwrap();
                    fed = true;
                }
                _ => {}
            }
        }
        assert_eq!(added, vec!["run-2", "main", "x"]);
        assert_eq!(session.store().current_end_time(), 150);
        drop(stream);

        // A finished build frees the slot; a fresh build restarts from scratch.
        let rebuilt: Vec<_> = engine.build_visual_tree(&id).unwrap().collect().await;
        assert_eq!(
            rebuilt
                .iter()
                .filter(|e| matches!(e, VisualEvent::EntryAdded { .. }))
                .count(),
            3
        );
        wait_for_build(&session).await;
        assert_eq!(session.build_state().await, BuildState::Complete);
        assert!(session.tree().await.find("x").is_some());
    }

    #[tokio::test]
    async fn test_batch_that_does_not_fit_is_not_queued() {
        let mut config = test_config();
        config.engine.buffer_size = 2;
        let engine = VeritraceEngine::new(config);
        let session = engine.open_trace("run-4", 0).unwrap();
        let id = session.id();

        assert!(engine.submit(&id, events()).is_err());
        assert!(session.capture.is_empty());

        let two: Vec<_> = events().into_iter().take(2).collect();
        assert_eq!(engine.submit(&id, two).unwrap(), 2);
        assert_eq!(session.capture.len(), 2);
    }

    #[tokio::test]
    async fn test_remove_cancels_trace() {
        let engine = VeritraceEngine::new(test_config());
        let session = engine.open_trace("run-3", 0).unwrap();
        let id = session.id();
        assert_eq!(engine.trace_count(), 1);

        assert!(engine.remove_trace(&id));
        assert!(!engine.remove_trace(&id));
        assert!(engine.session(&id).is_none());
        assert!(session.store().is_cancelled());
        wait_for_build(&session).await;
        assert_eq!(session.build_state().await, BuildState::Cancelled);
    }

    #[tokio::test]
    async fn test_unknown_trace() {
        let engine = VeritraceEngine::new(test_config());
        let id = Uuid::new_v4();
        assert!(engine.submit(&id, events()).is_err());
        assert!(engine.close_trace(&id, None).is_err());
        assert!(!engine.wait_until_built(&id, Duration::from_millis(1)).await);
    }
}
