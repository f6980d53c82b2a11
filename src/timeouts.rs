//! Scheduling of wait-window timeouts for suspended turns.
//!
//! The engine only asks for a wake-up; whoever receives the wake-up calls
//! [`TurnEngine::on_timeout`](crate::TurnEngine::on_timeout). At most one
//! timeout is active per conversation.

use crate::types::ConversationId;
use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{debug, warn};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

/// Registers and clears per-conversation wake-ups.
#[async_trait]
pub trait TimeoutScheduler: Send + Sync {
    /// Schedule a wake-up after `after`, superseding any existing one.
    ///
    /// # Errors
    /// Returns an error if the wake-up cannot be registered.
    async fn schedule(&self, conversation_id: &ConversationId, after: Duration) -> Result<()>;

    /// Cancel the wake-up. Clearing an absent timeout is a no-op.
    ///
    /// # Errors
    /// Returns an error if the wake-up cannot be cleared.
    async fn clear(&self, conversation_id: &ConversationId) -> Result<()>;
}

struct ScheduledTimeout {
    generation: u64,
    handle: AbortHandle,
}

#[derive(Default)]
struct TimeoutTable {
    next_generation: u64,
    entries: HashMap<String, ScheduledTimeout>,
}

/// In-process scheduler backed by tokio timers.
///
/// Fired conversation ids are sent on the channel returned by
/// [`TokioTimeoutScheduler::new`].
pub struct TokioTimeoutScheduler {
    table: Arc<Mutex<TimeoutTable>>,
    fired: mpsc::UnboundedSender<ConversationId>,
}

impl TokioTimeoutScheduler {
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ConversationId>) {
        let (fired, rx) = mpsc::unbounded_channel();
        (
            Self {
                table: Arc::new(Mutex::new(TimeoutTable::default())),
                fired,
            },
            rx,
        )
    }

    /// Whether a wake-up is pending for the conversation.
    ///
    /// # Errors
    /// Returns an error if the internal lock is poisoned.
    pub fn is_scheduled(&self, conversation_id: &ConversationId) -> Result<bool> {
        let table = self.table.lock().ok().context("lock poisoned")?;
        Ok(table.entries.contains_key(&conversation_id.0))
    }
}

#[async_trait]
impl TimeoutScheduler for TokioTimeoutScheduler {
    async fn schedule(&self, conversation_id: &ConversationId, after: Duration) -> Result<()> {
        let mut table = self.table.lock().ok().context("lock poisoned")?;
        table.next_generation += 1;
        let generation = table.next_generation;

        let task_table = Arc::clone(&self.table);
        let fired = self.fired.clone();
        let id = conversation_id.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            {
                let Ok(mut table) = task_table.lock() else {
                    warn!("Timeout table lock poisoned, dropping wake-up (conversation_id={id})");
                    return;
                };
                // A newer schedule replaced us while we slept
                if table
                    .entries
                    .get(&id.0)
                    .is_none_or(|entry| entry.generation != generation)
                {
                    return;
                }
                table.entries.remove(&id.0);
            }
            debug!("Timeout fired (conversation_id={id})");
            if let Err(e) = fired.send(id) {
                warn!("Timeout receiver dropped, wake-up lost (conversation_id={})", e.0);
            }
        });

        let previous = table.entries.insert(
            conversation_id.0.clone(),
            ScheduledTimeout {
                generation,
                handle: task.abort_handle(),
            },
        );
        if let Some(previous) = previous {
            previous.handle.abort();
        }
        debug!(
            "Timeout scheduled (conversation_id={conversation_id}, after_ms={})",
            after.as_millis()
        );
        Ok(())
    }

    async fn clear(&self, conversation_id: &ConversationId) -> Result<()> {
        let removed = self
            .table
            .lock()
            .ok()
            .context("lock poisoned")?
            .entries
            .remove(&conversation_id.0);
        if let Some(entry) = removed {
            entry.handle.abort();
            debug!("Timeout cleared (conversation_id={conversation_id})");
        }
        Ok(())
    }
}
