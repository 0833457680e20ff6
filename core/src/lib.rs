pub mod build;
pub mod callpath;
pub mod capture;
pub mod color;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod event;
pub mod filter;
pub mod ingest;
pub mod query;
pub mod storage;
pub mod trace_file;

pub use build::{
    BuildSlot, BuildState, CancellationFlag, EntryKind, VisualEntry, VisualEvent, VisualTree,
    VisualTreeBuilder,
};
pub use callpath::{CallpathNode, CallpathResolver};
pub use capture::EventCapture;
pub use color::{state_index, ColorMap, Rgb};
pub use config::Config;
pub use context::{Context, ContextRegistry, RecordOutcome};
pub use engine::{TraceSession, TraceSummary, VeritraceEngine};
pub use error::{BuildError, IngestError, StoreError, TraceFileError};
pub use event::{RawEvent, TraceEvent};
pub use filter::FilterInterval;
pub use ingest::{IngestStats, StateProvider, PROVIDER_VERSION};
pub use query::{get_values_range, range_value, series, Bucket, Series, VariableDescription};
pub use storage::{create_state_system, MemoryStateSystem, Quark, StateSystem, StateValue, Timestamp};
pub use trace_file::{TraceFile, TraceReader};
