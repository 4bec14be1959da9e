//! Process-wide "current cluster" slot.
//!
//! The slot holds the serialised record of the cluster whose body is running.
//! [`ClusterScope`] sets it and restores the previous value when dropped, so
//! the restore happens on every exit path. Child processes cannot see the slot
//! and read [`CLUSTER_ENV_VAR`] instead; callers export it via
//! [`ClusterContext::env`].

use std::env;
use std::sync::{Mutex, PoisonError};

use super::{ClusterRecord, RecordError};

/// Environment variable carrying the serialised current cluster to child
/// processes.
pub const CLUSTER_ENV_VAR: &str = "COVEY_CLUSTER";

static CURRENT: Mutex<Option<String>> = Mutex::new(None);

/// Returns the serialised current cluster, if any.
///
/// The in-process slot wins; otherwise [`CLUSTER_ENV_VAR`] is consulted.
#[must_use]
pub fn current_cluster() -> Option<String> {
    let slot = CURRENT
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clone();
    slot.or_else(|| env::var(CLUSTER_ENV_VAR).ok())
}

/// An assembled cluster handed to an allocation body.
#[derive(Clone, Debug, PartialEq)]
pub struct ClusterContext {
    record: ClusterRecord,
    serialized: String,
}

impl ClusterContext {
    /// Captures `record` together with its serialised form.
    ///
    /// # Errors
    ///
    /// Returns [`RecordError::Serialise`] when the record cannot be encoded.
    pub fn new(record: ClusterRecord) -> Result<Self, RecordError> {
        let serialized = record.to_json()?;
        Ok(Self { record, serialized })
    }

    /// The assembled record.
    #[must_use]
    pub const fn record(&self) -> &ClusterRecord {
        &self.record
    }

    /// The record as JSON, exactly as stored in the slot.
    #[must_use]
    pub fn serialized(&self) -> &str {
        &self.serialized
    }

    /// Environment pair to export to child processes.
    #[must_use]
    pub fn env(&self) -> (&'static str, &str) {
        (CLUSTER_ENV_VAR, &self.serialized)
    }

    /// Consumes the context and returns the record.
    #[must_use]
    pub fn into_record(self) -> ClusterRecord {
        self.record
    }
}

/// Guard that scopes the current-cluster slot.
///
/// Dropping the guard restores whatever the slot held before
/// [`ClusterScope::enter`]. Nested scopes restore in reverse order.
#[derive(Debug)]
#[must_use = "the cluster scope ends as soon as the guard is dropped"]
pub struct ClusterScope {
    previous: Option<String>,
}

impl ClusterScope {
    /// Makes `context` the current cluster until the guard is dropped.
    pub fn enter(context: &ClusterContext) -> Self {
        let mut slot = CURRENT.lock().unwrap_or_else(PoisonError::into_inner);
        let previous = slot.replace(context.serialized.clone());
        Self { previous }
    }
}

impl Drop for ClusterScope {
    fn drop(&mut self) {
        let mut slot = CURRENT.lock().unwrap_or_else(PoisonError::into_inner);
        *slot = self.previous.take();
    }
}
