//! JSON-lines trace files.
//!
//! ```text
//! {"env": {"domain": "veritrace", "tracer_version": "1.2"}}
//! {"name": "context", "timestamp": 0, "fields": {...}}
//! {"name": "value", "timestamp": 100, "fields": {...}}
//! ```
//!
//! The environment header is optional; when present its domain must be
//! [`TRACE_DOMAIN`].

use crate::error::TraceFileError;
use crate::event::RawEvent;
use crate::storage::Timestamp;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

pub const TRACE_DOMAIN: &str = "veritrace";

/// Environment header of a trace.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TraceEnv {
    pub domain: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A fully loaded trace.
#[derive(Debug, Clone, Default)]
pub struct TraceFile {
    pub env: Option<TraceEnv>,
    pub events: Vec<RawEvent>,
}

impl TraceFile {
    pub fn open<P: AsRef<Path>>(path: P, require_header: bool) -> Result<Self, TraceFileError> {
        let file = File::open(path.as_ref())?;
        Self::from_reader(BufReader::new(file), require_header)
    }

    pub fn from_reader<R: BufRead>(reader: R, require_header: bool) -> Result<Self, TraceFileError> {
        let mut reader = TraceReader::new(reader, require_header);
        let events = reader.by_ref().collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            env: reader.env,
            events,
        })
    }

    /// Earliest event timestamp, used as the store start time.
    pub fn start_time(&self) -> Timestamp {
        self.events.iter().map(|e| e.timestamp).min().unwrap_or(0)
    }

    pub fn end_time(&self) -> Timestamp {
        self.events.iter().map(|e| e.timestamp).max().unwrap_or(0)
    }
}

/// Streaming reader yielding one event per non-empty line.
pub struct TraceReader<R> {
    lines: std::io::Lines<R>,
    line: usize,
    require_header: bool,
    checked_header: bool,
    pending: Option<RawEvent>,
    env: Option<TraceEnv>,
}

impl<R: BufRead> TraceReader<R> {
    pub fn new(reader: R, require_header: bool) -> Self {
        Self {
            lines: reader.lines(),
            line: 0,
            require_header,
            checked_header: false,
            pending: None,
            env: None,
        }
    }

    pub fn env(&self) -> Option<&TraceEnv> {
        self.env.as_ref()
    }

    fn next_value(&mut self) -> Option<Result<Value, TraceFileError>> {
        loop {
            let line = match self.lines.next()? {
                Ok(line) => line,
                Err(e) => return Some(Err(e.into())),
            };
            self.line += 1;
            if line.trim().is_empty() {
                continue;
            }
            return Some(
                serde_json::from_str(&line).map_err(|source| TraceFileError::Json {
                    line: self.line,
                    source,
                }),
            );
        }
    }

    fn to_event(&self, value: Value) -> Result<RawEvent, TraceFileError> {
        serde_json::from_value(value).map_err(|source| TraceFileError::Json {
            line: self.line,
            source,
        })
    }

    /// Inspect the first line; returns the first event if it was not a header.
    fn check_header(&mut self) -> Result<Option<RawEvent>, TraceFileError> {
        self.checked_header = true;
        let Some(first) = self.next_value().transpose()? else {
            if self.require_header {
                return Err(TraceFileError::WrongDomain { domain: None });
            }
            return Ok(None);
        };

        match first.get("env") {
            Some(env) => {
                let env: TraceEnv =
                    serde_json::from_value(env.clone()).map_err(|source| TraceFileError::Json {
                        line: self.line,
                        source,
                    })?;
                if env.domain.as_deref() != Some(TRACE_DOMAIN) {
                    return Err(TraceFileError::WrongDomain { domain: env.domain });
                }
                self.env = Some(env);
                Ok(None)
            }
            None if self.require_header => Err(TraceFileError::WrongDomain { domain: None }),
            None => self.to_event(first).map(Some),
        }
    }
}

impl<R: BufRead> Iterator for TraceReader<R> {
    type Item = Result<RawEvent, TraceFileError>;

    fn next(&mut self) -> Option<Self::Item> {
        if !self.checked_header {
            match self.check_header() {
                Ok(Some(event)) => self.pending = Some(event),
                Ok(None) => {}
                Err(e) => return Some(Err(e)),
            }
        }
        if let Some(event) = self.pending.take() {
            return Some(Ok(event));
        }
        let value = match self.next_value()? {
            Ok(value) => value,
            Err(e) => return Some(Err(e)),
        };
        Some(self.to_event(value))
    }
}
