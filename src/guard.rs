//! Conversation-scoped advisory lock between the timeout path and the
//! asynchronous result path.

use crate::stores::TurnStore;
use crate::types::ConversationId;
use anyhow::Result;
use log::{debug, warn};
use std::future::Future;
use std::time::Duration;

/// Short-lived, self-expiring lock held while a timeout is reconciled.
pub struct RaceGuard<'a, S: ?Sized> {
    store: &'a S,
    ttl: Duration,
}

impl<'a, S> RaceGuard<'a, S>
where
    S: TurnStore + ?Sized,
{
    #[must_use]
    pub const fn new(store: &'a S, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    /// Whether another path currently holds the guard.
    ///
    /// # Errors
    /// Returns an error if the store cannot be read.
    pub async fn is_held(&self, conversation_id: &ConversationId) -> Result<bool> {
        self.store.is_guard_held(conversation_id).await
    }

    /// Run `body` while holding the guard.
    ///
    /// Returns `Ok(None)` without running `body` if the guard is already held.
    /// The guard is released after `body` finishes, whatever it returned. A
    /// lease that expired while `body` ran is left to its new holder.
    ///
    /// # Errors
    /// Returns an error if the guard cannot be acquired.
    pub async fn scoped<F, Fut, T>(
        &self,
        conversation_id: &ConversationId,
        body: F,
    ) -> Result<Option<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let Some(owner) = self.store.try_acquire_guard(conversation_id, self.ttl).await? else {
            debug!("Race guard busy (conversation_id={conversation_id})");
            return Ok(None);
        };

        let output = body().await;

        match self.store.release_guard(conversation_id, owner).await {
            Ok(true) => {}
            Ok(false) => warn!(
                "Race guard lease expired before release (conversation_id={conversation_id}, ttl_ms={})",
                self.ttl.as_millis()
            ),
            // The ttl frees it eventually
            Err(e) => warn!(
                "Failed to release race guard (conversation_id={conversation_id}, error={e})"
            ),
        }
        Ok(Some(output))
    }
}
