use super::types::{FullState, Interval, Quark, StateValue, Timestamp};
use crate::error::StoreError;
use async_trait::async_trait;
use std::time::Duration;

/// Timestamped, hierarchical key -> value interval storage.
///
/// One builder writes, any number of readers query while the history is
/// still being built. Implementations serialize internally; callers never
/// see a lock.
#[async_trait]
pub trait StateSystem: Send + Sync {
    // ========================================================================
    // Attribute tree
    // ========================================================================

    /// Resolve an absolute path, creating missing attributes along the way
    fn quark_absolute_and_add(&self, path: &[&str]) -> Quark;

    /// Resolve `name` under `parent`, creating it if missing
    fn quark_relative_and_add(&self, parent: Quark, name: &str) -> Result<Quark, StoreError>;

    /// Resolve an absolute path without creating anything
    fn quark_absolute(&self, path: &[&str]) -> Result<Quark, StoreError>;

    /// Resolve `name` under `parent` without creating anything
    fn quark_relative(&self, parent: Quark, name: &str) -> Result<Quark, StoreError>;

    /// Resolve a path pattern where a `*` element matches any single child.
    /// Unknown fixed elements yield an empty list.
    fn quarks(&self, pattern: &[&str]) -> Vec<Quark>;

    /// Children of `quark`, in creation order (depth-first when recursive)
    fn sub_attributes(&self, quark: Quark, recursive: bool) -> Result<Vec<Quark>, StoreError>;

    fn attribute_name(&self, quark: Quark) -> Result<String, StoreError>;

    /// Slash-joined path from the root to `quark`
    fn full_attribute_path(&self, quark: Quark) -> Result<String, StoreError>;

    fn attribute_count(&self) -> usize;

    // ========================================================================
    // Writes (single builder)
    // ========================================================================

    /// Set the value of `quark` from `time` onwards.
    ///
    /// Times must be non-decreasing per attribute; an earlier time fails with
    /// [`StoreError::OutOfOrder`]. Writing the same time again replaces it.
    fn modify_attribute(
        &self,
        time: Timestamp,
        value: StateValue,
        quark: Quark,
    ) -> Result<(), StoreError>;

    /// Mark the history as complete up to `end_time`
    fn close_history(&self, end_time: Timestamp);

    // ========================================================================
    // Queries
    // ========================================================================

    /// The interval of `quark` containing `time`
    fn query_single_state(&self, time: Timestamp, quark: Quark) -> Result<Interval, StoreError>;

    /// One interval per attribute, indexed by quark
    fn query_full_state(&self, time: Timestamp) -> Result<FullState, StoreError>;

    fn start_time(&self) -> Timestamp;

    /// Latest time known to the store; keeps advancing while building
    fn current_end_time(&self) -> Timestamp;

    // ========================================================================
    // Build progress & lifecycle
    // ========================================================================

    /// Wait until the history is complete or `timeout` elapses.
    /// Returns `true` once the history is complete.
    async fn wait_until_built(&self, timeout: Duration) -> bool;

    fn is_built(&self) -> bool;

    fn is_cancelled(&self) -> bool;

    /// Abort the build; waiters wake up and observe `is_cancelled()`
    fn cancel(&self);

    /// Release the store; every later query fails with [`StoreError::Disposed`]
    fn dispose(&self);
}
