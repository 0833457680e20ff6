use crate::build::{VisualEntry, VisualTree};
use crate::query::Bucket;
use serde::{Deserialize, Serialize};

/// Closed interval of significant-digit values to keep on display.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FilterInterval {
    pub down: f64,
    pub up: f64,
}

impl FilterInterval {
    pub fn new(down: f64, up: f64) -> Self {
        Self { down, up }
    }

    pub fn evaluate(&self, value: f64) -> bool {
        self.down <= value && value <= self.up
    }
}

impl VisualEntry {
    /// Whether any sample of this variable falls below `limit`.
    pub fn is_problematic(&self, limit: f64) -> bool {
        self.is_variable() && self.samples.iter().any(|b| b.value < limit)
    }

    pub fn visible_samples<'a>(
        &'a self,
        filter: Option<&'a FilterInterval>,
    ) -> impl Iterator<Item = &'a Bucket> + 'a {
        self.samples
            .iter()
            .filter(move |b| filter.map_or(true, |f| f.evaluate(b.value)))
    }
}

impl VisualTree {
    pub fn problematic(&self, limit: f64) -> Vec<&VisualEntry> {
        self.variables().filter(|e| e.is_problematic(limit)).collect()
    }

    /// Drop every sample the filter hides.
    pub fn retain_samples(&mut self, filter: &FilterInterval) {
        for entry in self.entries.iter_mut() {
            entry.samples.retain(|b| filter.evaluate(b.value));
        }
    }
}
