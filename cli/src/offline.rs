//! Loading a trace file straight into a store, without the server.

use anyhow::{Context as _, Result};
use std::path::Path;
use std::sync::Arc;
use veritrace_core::{
    create_state_system, BuildState, Config, IngestStats, StateProvider, StateSystem, TraceFile,
    VisualTree, VisualTreeBuilder,
};

/// A trace file fully ingested into a closed store.
pub struct LoadedTrace {
    pub name: String,
    pub store: Arc<dyn StateSystem>,
    pub stats: IngestStats,
    pub contexts: usize,
    pub callpaths: usize,
}

impl LoadedTrace {
    /// Build the complete visual tree of this trace.
    pub async fn build_tree(&self, config: &Config) -> Result<(BuildState, VisualTree)> {
        let mut builder = VisualTreeBuilder::new(
            Arc::clone(&self.store),
            config.build.clone(),
            self.name.clone(),
        );
        let state = builder.run().await?;
        Ok((state, builder.tree().clone()))
    }
}

/// Read `path` and feed every event to a fresh provider.
pub fn load_trace(config: &Config, path: &Path) -> Result<LoadedTrace> {
    let trace = TraceFile::open(path, config.ingest.require_domain_header)
        .with_context(|| format!("Failed to read trace {:?}", path))?;
    let name = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "trace".to_string());
    ingest(config, name, &trace)
}

pub fn ingest(config: &Config, name: String, trace: &TraceFile) -> Result<LoadedTrace> {
    let store = create_state_system(&config.store, trace.start_time())?;
    let mut provider = StateProvider::new(Arc::clone(&store));
    for event in &trace.events {
        provider.process(event);
    }
    provider.finish(trace.end_time());

    Ok(LoadedTrace {
        name,
        store,
        stats: provider.stats().clone(),
        contexts: provider.contexts().len(),
        callpaths: provider.callpaths().len(),
    })
}
