//! Caller-facing pending operations.
//!
//! A pending operation is opened when a turn starts, receives progress strings
//! ("Thinking...", "Calling tool lookup", ...) while the turn runs, and is
//! finally completed with a [`TurnResult`] or cancelled with a reason. Progress
//! is advisory: the engine logs and ignores sink failures.

use crate::types::{OperationId, TurnResult};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;

/// Where the engine reports progress and terminal results.
#[async_trait]
pub trait OperationSink: Send + Sync {
    /// Open a pending operation.
    ///
    /// # Errors
    /// Returns an error if the operation cannot be created.
    async fn begin(&self, id: &OperationId) -> Result<()>;

    /// Replace the operation's human-readable status.
    ///
    /// # Errors
    /// Returns an error if the update cannot be delivered.
    async fn update(&self, id: &OperationId, status: &str) -> Result<()>;

    /// Complete the operation with its result.
    ///
    /// # Errors
    /// Returns an error if the result cannot be delivered.
    async fn complete(&self, id: &OperationId, result: &TurnResult) -> Result<()>;

    /// Cancel the operation with a failure description.
    ///
    /// # Errors
    /// Returns an error if the cancellation cannot be delivered.
    async fn cancel(&self, id: &OperationId, reason: &str) -> Result<()>;
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum OperationStatus {
    Pending,
    Completed { result: TurnResult },
    Cancelled { reason: String },
}

impl OperationStatus {
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// Everything reported against one operation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OperationRecord {
    pub status: OperationStatus,
    pub progress: Vec<String>,
}

/// In-memory [`OperationSink`] that keeps every operation's history.
///
/// Terminal transitions happen once; later completions or cancellations of
/// the same operation are ignored.
#[derive(Default)]
pub struct InMemoryOperations {
    records: RwLock<HashMap<String, OperationRecord>>,
}

impl InMemoryOperations {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of one operation.
    ///
    /// # Errors
    /// Returns an error if the internal lock is poisoned.
    pub fn get(&self, id: &OperationId) -> Result<Option<OperationRecord>> {
        let records = self.records.read().ok().context("lock poisoned")?;
        Ok(records.get(&id.0).cloned())
    }

    fn finish(&self, id: &OperationId, status: OperationStatus) -> Result<()> {
        let mut records = self.records.write().ok().context("lock poisoned")?;
        let record = records
            .entry(id.0.clone())
            .or_insert_with(|| OperationRecord {
                status: OperationStatus::Pending,
                progress: Vec::new(),
            });
        if record.status.is_terminal() {
            log::debug!("Ignoring second terminal transition (operation_id={id})");
            return Ok(());
        }
        record.status = status;
        Ok(())
    }
}

#[async_trait]
impl OperationSink for InMemoryOperations {
    async fn begin(&self, id: &OperationId) -> Result<()> {
        self.records
            .write()
            .ok()
            .context("lock poisoned")?
            .entry(id.0.clone())
            .or_insert_with(|| OperationRecord {
                status: OperationStatus::Pending,
                progress: Vec::new(),
            });
        Ok(())
    }

    async fn update(&self, id: &OperationId, status: &str) -> Result<()> {
        let mut records = self.records.write().ok().context("lock poisoned")?;
        let record = records
            .get_mut(&id.0)
            .with_context(|| format!("unknown operation: {id}"))?;
        record.progress.push(status.to_string());
        Ok(())
    }

    async fn complete(&self, id: &OperationId, result: &TurnResult) -> Result<()> {
        self.finish(
            id,
            OperationStatus::Completed {
                result: result.clone(),
            },
        )
    }

    async fn cancel(&self, id: &OperationId, reason: &str) -> Result<()> {
        self.finish(
            id,
            OperationStatus::Cancelled {
                reason: reason.to_string(),
            },
        )
    }
}
