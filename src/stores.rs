//! Durable storage for suspended turns.
//!
//! Everything the engine needs to resume a turn in another process lives
//! behind [`TurnStore`]:
//!
//! - turn state, keyed by conversation
//! - tool result fragments, keyed by (conversation, turn, tool call)
//! - the race guard, keyed by conversation
//!
//! # Built-in Implementation
//!
//! [`InMemoryTurnStore`] is suitable for testing and single-process
//! deployments. For production, implement the trait over a shared store
//! (e.g. Redis, Postgres) with the same write-once and compare-and-delete
//! semantics.

use crate::types::{ConversationId, ToolResultFragment, TurnState};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

/// Keyed durable store for turn state, fragments and the race guard.
#[async_trait]
pub trait TurnStore: Send + Sync {
    /// Persist the state of a suspended turn, replacing any previous state.
    ///
    /// # Errors
    /// Returns an error if the state cannot be stored.
    async fn save_turn_state(&self, state: &TurnState, ttl: Option<Duration>) -> Result<()>;

    /// Load the suspended turn for a conversation.
    ///
    /// # Errors
    /// Returns an error if the state cannot be read.
    async fn load_turn_state(&self, conversation_id: &ConversationId)
    -> Result<Option<TurnState>>;

    /// Atomically remove and return the state, but only if it is still the
    /// given turn. Whoever gets `Some` owns the resumption.
    ///
    /// # Errors
    /// Returns an error if the state cannot be read or removed.
    async fn take_turn_state(
        &self,
        conversation_id: &ConversationId,
        turn: u32,
    ) -> Result<Option<TurnState>>;

    /// Delete the state for a conversation. Deleting absent state is a no-op.
    ///
    /// # Errors
    /// Returns an error if the state cannot be removed.
    async fn delete_turn_state(&self, conversation_id: &ConversationId) -> Result<()>;

    /// Store a fragment unless one already exists for the same
    /// (conversation, turn, tool call). Returns `true` if it was written.
    ///
    /// # Errors
    /// Returns an error if the fragment cannot be stored.
    async fn store_fragment(
        &self,
        conversation_id: &ConversationId,
        fragment: ToolResultFragment,
        ttl: Duration,
    ) -> Result<bool>;

    /// All live fragments written under exactly this turn.
    ///
    /// # Errors
    /// Returns an error if the fragments cannot be read.
    async fn list_fragments(
        &self,
        conversation_id: &ConversationId,
        turn: u32,
    ) -> Result<Vec<ToolResultFragment>>;

    /// Take the race guard if nobody holds it.
    ///
    /// Returns the owner token of the new lease, or `None` if the guard is
    /// held.
    ///
    /// # Errors
    /// Returns an error if the guard cannot be written.
    async fn try_acquire_guard(
        &self,
        conversation_id: &ConversationId,
        ttl: Duration,
    ) -> Result<Option<Uuid>>;

    /// Release the race guard, but only if `owner` still holds it. Returns
    /// `false` when the lease expired or was taken over by someone else.
    ///
    /// # Errors
    /// Returns an error if the guard cannot be removed.
    async fn release_guard(&self, conversation_id: &ConversationId, owner: Uuid)
    -> Result<bool>;

    /// Whether the race guard is currently held.
    ///
    /// # Errors
    /// Returns an error if the guard cannot be read.
    async fn is_guard_held(&self, conversation_id: &ConversationId) -> Result<bool>;
}

struct Expiring<T> {
    value: T,
    expires_at: Option<Instant>,
}

impl<T> Expiring<T> {
    fn new(value: T, ttl: Option<Duration>) -> Self {
        Self {
            value,
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        }
    }

    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| now < at)
    }
}

type FragmentKey = (String, u32, String);

/// In-memory implementation of [`TurnStore`].
///
/// Expired entries are invisible to reads and are purged from a map whenever
/// that map is written.
#[derive(Default)]
pub struct InMemoryTurnStore {
    states: RwLock<HashMap<String, Expiring<TurnState>>>,
    fragments: RwLock<HashMap<FragmentKey, Expiring<ToolResultFragment>>>,
    guards: RwLock<HashMap<String, Expiring<Uuid>>>,
}

impl InMemoryTurnStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TurnStore for InMemoryTurnStore {
    async fn save_turn_state(&self, state: &TurnState, ttl: Option<Duration>) -> Result<()> {
        let now = Instant::now();
        let mut states = self.states.write().ok().context("lock poisoned")?;
        states.retain(|_, entry| entry.is_live(now));
        states.insert(
            state.conversation_id.0.clone(),
            Expiring::new(state.clone(), ttl),
        );
        Ok(())
    }

    async fn load_turn_state(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Option<TurnState>> {
        let now = Instant::now();
        let states = self.states.read().ok().context("lock poisoned")?;
        Ok(states
            .get(&conversation_id.0)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.value.clone()))
    }

    async fn take_turn_state(
        &self,
        conversation_id: &ConversationId,
        turn: u32,
    ) -> Result<Option<TurnState>> {
        let now = Instant::now();
        let mut states = self.states.write().ok().context("lock poisoned")?;
        let claimable = states
            .get(&conversation_id.0)
            .is_some_and(|entry| entry.is_live(now) && entry.value.turn == turn);
        if !claimable {
            return Ok(None);
        }
        Ok(states.remove(&conversation_id.0).map(|entry| entry.value))
    }

    async fn delete_turn_state(&self, conversation_id: &ConversationId) -> Result<()> {
        self.states
            .write()
            .ok()
            .context("lock poisoned")?
            .remove(&conversation_id.0);
        Ok(())
    }

    async fn store_fragment(
        &self,
        conversation_id: &ConversationId,
        fragment: ToolResultFragment,
        ttl: Duration,
    ) -> Result<bool> {
        let now = Instant::now();
        let key = (
            conversation_id.0.clone(),
            fragment.turn,
            fragment.tool_call_id.clone(),
        );
        let mut fragments = self.fragments.write().ok().context("lock poisoned")?;
        fragments.retain(|_, entry| entry.is_live(now));
        if fragments.contains_key(&key) {
            return Ok(false);
        }
        fragments.insert(key, Expiring::new(fragment, Some(ttl)));
        Ok(true)
    }

    async fn list_fragments(
        &self,
        conversation_id: &ConversationId,
        turn: u32,
    ) -> Result<Vec<ToolResultFragment>> {
        let now = Instant::now();
        let fragments = self.fragments.read().ok().context("lock poisoned")?;
        Ok(fragments
            .iter()
            .filter(|((conversation, fragment_turn, _), entry)| {
                conversation == &conversation_id.0 && *fragment_turn == turn && entry.is_live(now)
            })
            .map(|(_, entry)| entry.value.clone())
            .collect())
    }

    async fn try_acquire_guard(
        &self,
        conversation_id: &ConversationId,
        ttl: Duration,
    ) -> Result<Option<Uuid>> {
        let now = Instant::now();
        let mut guards = self.guards.write().ok().context("lock poisoned")?;
        guards.retain(|_, entry| entry.is_live(now));
        if guards.contains_key(&conversation_id.0) {
            return Ok(None);
        }
        let owner = Uuid::new_v4();
        guards.insert(conversation_id.0.clone(), Expiring::new(owner, Some(ttl)));
        Ok(Some(owner))
    }

    async fn release_guard(&self, conversation_id: &ConversationId, owner: Uuid) -> Result<bool> {
        let now = Instant::now();
        let mut guards = self.guards.write().ok().context("lock poisoned")?;
        let owned = guards
            .get(&conversation_id.0)
            .is_some_and(|entry| entry.is_live(now) && entry.value == owner);
        if owned {
            guards.remove(&conversation_id.0);
        }
        Ok(owned)
    }

    async fn is_guard_held(&self, conversation_id: &ConversationId) -> Result<bool> {
        let now = Instant::now();
        let guards = self.guards.read().ok().context("lock poisoned")?;
        Ok(guards
            .get(&conversation_id.0)
            .is_some_and(|entry| entry.is_live(now)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelParams;
    use crate::llm::Message;
    use crate::types::{OperationId, TokenUsage};
    use serde_json::json;
    use time::OffsetDateTime;

    fn state(conversation_id: &ConversationId, turn: u32) -> TurnState {
        TurnState {
            conversation_id: conversation_id.clone(),
            caller_id: OperationId::from_string("op_1"),
            messages: vec![Message::user("Hello")],
            outstanding: vec!["call_1".to_string()],
            turn,
            params: ModelParams::default(),
            tools: Vec::new(),
            mcp_servers: Vec::new(),
            schema: None,
            max_retries: 3,
            usage: TokenUsage::default(),
            created_at: OffsetDateTime::now_utc(),
        }
    }

    #[tokio::test]
    async fn test_turn_state_round_trip() -> Result<()> {
        let store = InMemoryTurnStore::new();
        let conversation_id = ConversationId::new();

        assert!(store.load_turn_state(&conversation_id).await?.is_none());

        store.save_turn_state(&state(&conversation_id, 1), None).await?;
        let loaded = store.load_turn_state(&conversation_id).await?;
        assert_eq!(loaded.map(|s| s.turn), Some(1));

        store.delete_turn_state(&conversation_id).await?;
        assert!(store.load_turn_state(&conversation_id).await?.is_none());

        // Deleting again is harmless
        store.delete_turn_state(&conversation_id).await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_take_turn_state_only_once_and_only_for_matching_turn() -> Result<()> {
        let store = InMemoryTurnStore::new();
        let conversation_id = ConversationId::new();
        store.save_turn_state(&state(&conversation_id, 2), None).await?;

        assert!(store.take_turn_state(&conversation_id, 1).await?.is_none());
        assert!(store.load_turn_state(&conversation_id).await?.is_some());

        let taken = store.take_turn_state(&conversation_id, 2).await?;
        assert_eq!(taken.map(|s| s.turn), Some(2));
        assert!(store.take_turn_state(&conversation_id, 2).await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_fragments_are_write_once() -> Result<()> {
        let store = InMemoryTurnStore::new();
        let conversation_id = ConversationId::new();
        let ttl = Duration::from_secs(60);

        let first = ToolResultFragment::new("call_1", 1, json!("first"));
        let second = ToolResultFragment::new("call_1", 1, json!("second"));
        assert!(store.store_fragment(&conversation_id, first, ttl).await?);
        assert!(!store.store_fragment(&conversation_id, second, ttl).await?);

        let fragments = store.list_fragments(&conversation_id, 1).await?;
        assert_eq!(fragments.len(), 1);
        assert_eq!(fragments[0].payload, json!("first"));
        Ok(())
    }

    #[tokio::test]
    async fn test_fragments_scoped_to_turn_and_conversation() -> Result<()> {
        let store = InMemoryTurnStore::new();
        let conversation_id = ConversationId::new();
        let other = ConversationId::new();
        let ttl = Duration::from_secs(60);

        store
            .store_fragment(&conversation_id, ToolResultFragment::new("a", 1, json!(1)), ttl)
            .await?;
        store
            .store_fragment(&conversation_id, ToolResultFragment::new("b", 2, json!(2)), ttl)
            .await?;
        store
            .store_fragment(&other, ToolResultFragment::new("c", 1, json!(3)), ttl)
            .await?;

        let turn_one = store.list_fragments(&conversation_id, 1).await?;
        assert_eq!(turn_one.len(), 1);
        assert_eq!(turn_one[0].tool_call_id, "a");
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_fragments_expire() -> Result<()> {
        let store = InMemoryTurnStore::new();
        let conversation_id = ConversationId::new();
        store
            .store_fragment(
                &conversation_id,
                ToolResultFragment::new("a", 1, json!("x")),
                Duration::from_secs(60),
            )
            .await?;

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(store.list_fragments(&conversation_id, 1).await?.is_empty());

        // An expired fragment no longer blocks a fresh write
        assert!(
            store
                .store_fragment(
                    &conversation_id,
                    ToolResultFragment::new("a", 1, json!("y")),
                    Duration::from_secs(60),
                )
                .await?
        );
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_guard_is_exclusive_and_self_expiring() -> Result<()> {
        let store = InMemoryTurnStore::new();
        let conversation_id = ConversationId::new();
        let ttl = Duration::from_secs(120);

        let owner = store.try_acquire_guard(&conversation_id, ttl).await?;
        assert!(owner.is_some());
        assert!(store.is_guard_held(&conversation_id).await?);
        assert!(store.try_acquire_guard(&conversation_id, ttl).await?.is_none());

        if let Some(owner) = owner {
            assert!(store.release_guard(&conversation_id, owner).await?);
        }
        assert!(!store.is_guard_held(&conversation_id).await?);

        assert!(store.try_acquire_guard(&conversation_id, ttl).await?.is_some());
        tokio::time::advance(Duration::from_secs(121)).await;
        assert!(!store.is_guard_held(&conversation_id).await?);
        assert!(store.try_acquire_guard(&conversation_id, ttl).await?.is_some());
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_holder_cannot_release_new_lease() -> Result<()> {
        let store = InMemoryTurnStore::new();
        let conversation_id = ConversationId::new();

        let first = store
            .try_acquire_guard(&conversation_id, Duration::from_secs(1))
            .await?
            .context("first acquire")?;
        tokio::time::advance(Duration::from_secs(2)).await;
        let second = store
            .try_acquire_guard(&conversation_id, Duration::from_secs(60))
            .await?
            .context("second acquire")?;

        assert!(!store.release_guard(&conversation_id, first).await?);
        assert!(store.is_guard_held(&conversation_id).await?);

        assert!(store.release_guard(&conversation_id, second).await?);
        assert!(!store.is_guard_held(&conversation_id).await?);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entries_are_purged_on_write() -> Result<()> {
        let store = InMemoryTurnStore::new();
        let short = Duration::from_secs(1);

        for i in 0..100 {
            let conversation_id = ConversationId::new();
            store
                .store_fragment(
                    &conversation_id,
                    ToolResultFragment::new(format!("call_{i}"), 1, json!(i)),
                    short,
                )
                .await?;
            store.try_acquire_guard(&conversation_id, short).await?;
            store
                .save_turn_state(&state(&conversation_id, 1), Some(short))
                .await?;
        }
        tokio::time::advance(Duration::from_secs(10)).await;

        let conversation_id = ConversationId::new();
        let ttl = Duration::from_secs(60);
        store
            .store_fragment(&conversation_id, ToolResultFragment::new("a", 1, json!("x")), ttl)
            .await?;
        store.try_acquire_guard(&conversation_id, ttl).await?;
        store.save_turn_state(&state(&conversation_id, 1), Some(ttl)).await?;

        assert_eq!(store.fragments.read().ok().context("lock poisoned")?.len(), 1);
        assert_eq!(store.guards.read().ok().context("lock poisoned")?.len(), 1);
        assert_eq!(store.states.read().ok().context("lock poisoned")?.len(), 1);
        Ok(())
    }
}
