//! In-process store for tests and single-node development.
//!
//! Each key has its own async mutex. A [`KeyScope`] works on a copy of the
//! key's slice and writes it back on commit, so an abandoned scope leaves no
//! trace.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::future::ready;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::OwnedMutexGuard;
use uuid::Uuid;

use super::{
    AttemptOutcome, AttemptRecord, BlockEntry, ContextStore, KeyScope, OutboxMessage, ScopeKey, SignInEvent,
    StoreError, StoreResult, VerificationToken,
};
use crate::engine::BoxFuture;
use crate::engine::context::{AccountId, TrustedContext};

#[derive(Clone, Debug, Default)]
struct Slice {
    trusted: Option<TrustedContext>,
    attempts: Option<AttemptRecord>,
    block: Option<BlockEntry>,
    tokens: Vec<VerificationToken>,
}

impl Slice {
    fn is_empty(&self) -> bool {
        self.trusted.is_none() && self.attempts.is_none() && self.block.is_none() && self.tokens.is_empty()
    }
}

#[derive(Default)]
struct State {
    slices: HashMap<ScopeKey, Slice>,
    preferences: HashMap<AccountId, bool>,
    events: Vec<SignInEvent>,
    outbox: Vec<OutboxMessage>,
}

#[derive(Default)]
struct Inner {
    state: Mutex<State>,
    locks: Mutex<HashMap<ScopeKey, Arc<tokio::sync::Mutex<()>>>>,
    unavailable: AtomicBool,
    fail_writes: AtomicBool,
    fail_events: AtomicBool,
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

fn poisoned<T>(_: T) -> StoreError {
    StoreError::Unavailable("memory store lock poisoned".to_string())
}

fn boxed<'a, T: Send + 'a>(value: T) -> BoxFuture<'a, T> {
    Box::pin(ready(value))
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> StoreResult<MutexGuard<'_, State>> {
        self.inner.state.lock().map_err(poisoned)
    }

    fn available(&self) -> StoreResult<()> {
        if self.inner.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store offline".to_string()));
        }
        Ok(())
    }

    fn writable(&self) -> StoreResult<()> {
        if self.inner.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Write("memory store rejected write".to_string()));
        }
        Ok(())
    }

    /// Make every lock and read fail as if the store were down.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Make every write inside a scope fail.
    pub fn fail_writes(&self, fail: bool) {
        self.inner.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Make audit writes fail.
    pub fn fail_events(&self, fail: bool) {
        self.inner.fail_events.store(fail, Ordering::SeqCst);
    }

    /// Insert a trusted context directly, replacing the one for its device key.
    ///
    /// # Errors
    /// Returns an error if the state lock is poisoned.
    pub fn seed_trusted(&self, context: TrustedContext) -> StoreResult<()> {
        let key = ScopeKey::new(context.account, context.device_key.clone());
        self.state()?.slices.entry(key).or_default().trusted = Some(context);
        Ok(())
    }

    /// Insert a block entry directly.
    ///
    /// # Errors
    /// Returns an error if the state lock is poisoned.
    pub fn seed_block(&self, entry: BlockEntry) -> StoreResult<()> {
        let key = ScopeKey::new(entry.account, entry.device_key.clone());
        self.state()?.slices.entry(key).or_default().block = Some(entry);
        Ok(())
    }

    /// # Errors
    /// Returns an error if the state lock is poisoned.
    pub fn set_context_auth(&self, account: AccountId, enabled: bool) -> StoreResult<()> {
        self.state()?.preferences.insert(account, enabled);
        Ok(())
    }

    /// # Errors
    /// Returns an error if the state lock is poisoned.
    pub fn events(&self) -> StoreResult<Vec<SignInEvent>> {
        Ok(self.state()?.events.clone())
    }

    /// Messages from committed scopes, oldest first.
    ///
    /// # Errors
    /// Returns an error if the state lock is poisoned.
    pub fn outbox(&self) -> StoreResult<Vec<OutboxMessage>> {
        Ok(self.state()?.outbox.clone())
    }

    /// True when no per-key state, events or messages have been written.
    ///
    /// # Errors
    /// Returns an error if the state lock is poisoned.
    pub fn is_empty(&self) -> StoreResult<bool> {
        let state = self.state()?;
        Ok(state.slices.values().all(Slice::is_empty) && state.events.is_empty() && state.outbox.is_empty())
    }

    fn slice(&self, key: &ScopeKey) -> StoreResult<Slice> {
        self.available()?;
        Ok(self.state()?.slices.get(key).cloned().unwrap_or_default())
    }

    fn account_contexts(&self, account: AccountId, except: Option<&ScopeKey>) -> StoreResult<Vec<TrustedContext>> {
        self.available()?;
        let state = self.state()?;
        Ok(state
            .slices
            .iter()
            .filter(|(key, _)| key.account == account && Some(*key) != except)
            .filter_map(|(_, slice)| slice.trusted.clone())
            .collect())
    }

    fn find_token(&self, code_hash: &[u8]) -> StoreResult<Option<VerificationToken>> {
        self.available()?;
        let state = self.state()?;
        Ok(state
            .slices
            .values()
            .flat_map(|slice| slice.tokens.iter())
            .find(|token| token.code_hash == code_hash)
            .cloned())
    }

    fn write_back(&self, key: &ScopeKey, slice: Slice, outbox: Vec<OutboxMessage>) -> StoreResult<()> {
        self.writable()?;
        let mut state = self.state()?;
        if slice.is_empty() {
            state.slices.remove(key);
        } else {
            state.slices.insert(key.clone(), slice);
        }
        state.outbox.extend(outbox);
        Ok(())
    }
}

impl ContextStore for MemoryStore {
    fn lock<'a>(&'a self, key: &'a ScopeKey) -> BoxFuture<'a, StoreResult<Box<dyn KeyScope>>> {
        Box::pin(async move {
            self.available()?;
            let mutex = self
                .inner
                .locks
                .lock()
                .map_err(poisoned)?
                .entry(key.clone())
                .or_default()
                .clone();
            let guard = mutex.lock_owned().await;
            let slice = self.slice(key)?;
            let scope: Box<dyn KeyScope> = Box::new(MemoryScope {
                store: self.clone(),
                key: key.clone(),
                slice,
                outbox: Vec::new(),
                _guard: guard,
            });
            Ok(scope)
        })
    }

    fn trusted_contexts(&self, account: AccountId) -> BoxFuture<'_, StoreResult<Vec<TrustedContext>>> {
        boxed(self.account_contexts(account, None))
    }

    fn attempt_record<'a>(&'a self, key: &'a ScopeKey) -> BoxFuture<'a, StoreResult<Option<AttemptRecord>>> {
        boxed(self.slice(key).map(|slice| slice.attempts))
    }

    fn block_entry<'a>(&'a self, key: &'a ScopeKey) -> BoxFuture<'a, StoreResult<Option<BlockEntry>>> {
        boxed(self.slice(key).map(|slice| slice.block))
    }

    fn token_by_code_hash<'a>(
        &'a self,
        code_hash: &'a [u8],
    ) -> BoxFuture<'a, StoreResult<Option<VerificationToken>>> {
        boxed(self.find_token(code_hash))
    }

    fn context_auth_enabled(&self, account: AccountId) -> BoxFuture<'_, StoreResult<bool>> {
        let result = self
            .available()
            .and_then(|()| self.state())
            .map(|state| state.preferences.get(&account).copied().unwrap_or(true));
        boxed(result)
    }

    fn record_event<'a>(&'a self, event: &'a SignInEvent) -> BoxFuture<'a, StoreResult<()>> {
        let result = if self.inner.fail_events.load(Ordering::SeqCst) {
            Err(StoreError::Write("memory store rejected event".to_string()))
        } else {
            self.state().map(|mut state| state.events.push(event.clone()))
        };
        boxed(result)
    }

    fn ping(&self) -> BoxFuture<'_, StoreResult<()>> {
        boxed(self.available())
    }
}

struct MemoryScope {
    store: MemoryStore,
    key: ScopeKey,
    slice: Slice,
    outbox: Vec<OutboxMessage>,
    _guard: OwnedMutexGuard<()>,
}

impl MemoryScope {
    fn confirm(&mut self, id: Uuid, at: DateTime<Utc>) -> StoreResult<()> {
        self.store.writable()?;
        match self.slice.trusted.as_mut() {
            Some(context) if context.id == id => context.last_confirmed_at = at,
            _ => {
                let mut state = self.store.state()?;
                if let Some(context) = state
                    .slices
                    .values_mut()
                    .filter_map(|slice| slice.trusted.as_mut())
                    .find(|context| context.id == id)
                {
                    context.last_confirmed_at = at;
                }
            }
        }
        Ok(())
    }

    fn upsert(&mut self, context: &TrustedContext) -> StoreResult<TrustedContext> {
        self.store.writable()?;
        let stored = match &self.slice.trusted {
            Some(existing) => TrustedContext {
                id: existing.id,
                first_seen_at: existing.first_seen_at,
                ..context.clone()
            },
            None => context.clone(),
        };
        self.slice.trusted = Some(stored.clone());
        Ok(stored)
    }

    fn increment(&mut self, at: DateTime<Utc>) -> StoreResult<AttemptRecord> {
        self.store.writable()?;
        let record = match self.slice.attempts.take() {
            Some(mut record) => {
                record.attempt_count = record.attempt_count.saturating_add(1);
                record
            }
            None => AttemptRecord {
                account: self.key.account,
                device_key: self.key.device_key.clone(),
                attempt_count: 1,
                first_attempt_at: at,
                last_outcome: AttemptOutcome::Mismatch,
            },
        };
        self.slice.attempts = Some(record.clone());
        Ok(record)
    }

    fn with_write<T>(&mut self, apply: impl FnOnce(&mut Slice) -> T) -> StoreResult<T> {
        self.store.writable()?;
        Ok(apply(&mut self.slice))
    }
}

impl KeyScope for MemoryScope {
    fn key(&self) -> &ScopeKey {
        &self.key
    }

    fn block(&mut self) -> BoxFuture<'_, StoreResult<Option<BlockEntry>>> {
        boxed(self.store.available().map(|()| self.slice.block.clone()))
    }

    fn trusted_contexts(&mut self) -> BoxFuture<'_, StoreResult<Vec<TrustedContext>>> {
        let result = self
            .store
            .account_contexts(self.key.account, Some(&self.key))
            .map(|mut contexts| {
                contexts.extend(self.slice.trusted.clone());
                contexts.sort_by_key(|context| context.first_seen_at);
                contexts
            });
        boxed(result)
    }

    fn confirm_trusted(&mut self, id: Uuid, at: DateTime<Utc>) -> BoxFuture<'_, StoreResult<()>> {
        boxed(self.confirm(id, at))
    }

    fn upsert_trusted<'a>(
        &'a mut self,
        context: &'a TrustedContext,
    ) -> BoxFuture<'a, StoreResult<TrustedContext>> {
        boxed(self.upsert(context))
    }

    fn attempts(&mut self) -> BoxFuture<'_, StoreResult<Option<AttemptRecord>>> {
        boxed(self.store.available().map(|()| self.slice.attempts.clone()))
    }

    fn increment_attempts(&mut self, at: DateTime<Utc>) -> BoxFuture<'_, StoreResult<AttemptRecord>> {
        boxed(self.increment(at))
    }

    fn set_attempt_outcome(&mut self, outcome: AttemptOutcome) -> BoxFuture<'_, StoreResult<()>> {
        boxed(self.with_write(|slice| {
            if let Some(record) = slice.attempts.as_mut() {
                record.last_outcome = outcome;
            }
        }))
    }

    fn reset_attempts(&mut self) -> BoxFuture<'_, StoreResult<()>> {
        boxed(self.with_write(|slice| slice.attempts = None))
    }

    fn put_block<'a>(&'a mut self, entry: &'a BlockEntry) -> BoxFuture<'a, StoreResult<()>> {
        boxed(self.with_write(|slice| {
            let keeps_permanent = slice.block.as_ref().is_some_and(|existing| existing.permanent);
            if !keeps_permanent || entry.permanent {
                slice.block = Some(entry.clone());
            }
        }))
    }

    fn clear_temporary_block(&mut self) -> BoxFuture<'_, StoreResult<()>> {
        boxed(self.with_write(|slice| {
            if slice.block.as_ref().is_some_and(|entry| !entry.permanent) {
                slice.block = None;
            }
        }))
    }

    fn live_token(&mut self, now: DateTime<Utc>) -> BoxFuture<'_, StoreResult<Option<VerificationToken>>> {
        let result = self.store.available().map(|()| {
            self.slice
                .tokens
                .iter()
                .filter(|token| token.is_live(now))
                .max_by_key(|token| token.issued_at)
                .cloned()
        });
        boxed(result)
    }

    fn insert_token<'a>(&'a mut self, token: &'a VerificationToken) -> BoxFuture<'a, StoreResult<()>> {
        boxed(self.with_write(|slice| slice.tokens.push(token.clone())))
    }

    fn consume_token(
        &mut self,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> BoxFuture<'_, StoreResult<Option<VerificationToken>>> {
        boxed(self.with_write(|slice| {
            slice
                .tokens
                .iter_mut()
                .find(|token| token.id == id && token.is_live(now))
                .map(|token| {
                    token.consumed_at = Some(now);
                    token.clone()
                })
        }))
    }

    fn enqueue_message<'a>(&'a mut self, message: &'a OutboxMessage) -> BoxFuture<'a, StoreResult<()>> {
        let result = self.store.writable().map(|()| self.outbox.push(message.clone()));
        boxed(result)
    }

    fn commit(self: Box<Self>) -> BoxFuture<'static, StoreResult<()>> {
        let scope = *self;
        let result = scope.store.write_back(&scope.key, scope.slice, scope.outbox);
        boxed(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::test_support::attributes;
    use chrono::Duration;

    fn key_for(account: AccountId) -> ScopeKey {
        ScopeKey::new(account, attributes("US", "D1", "macOS", "Chrome").device_key())
    }

    #[tokio::test]
    async fn dropped_scope_discards_writes() -> anyhow::Result<()> {
        let store = MemoryStore::new();
        let key = key_for(Uuid::now_v7());

        let mut scope = store.lock(&key).await?;
        scope.increment_attempts(Utc::now()).await?;
        drop(scope);

        assert_eq!(store.attempt_record(&key).await?, None);
        assert!(store.is_empty()?);
        Ok(())
    }

    #[tokio::test]
    async fn upsert_keeps_identity() -> anyhow::Result<()> {
        let store = MemoryStore::new();
        let account = Uuid::now_v7();
        let key = key_for(account);
        let first_seen = Utc::now() - Duration::days(30);
        let original = TrustedContext::new(account, attributes("US", "D1", "macOS", "Chrome"), first_seen);
        store.seed_trusted(original.clone())?;

        let mut scope = store.lock(&key).await?;
        let refreshed = TrustedContext::new(account, attributes("FR", "D1", "macOS", "Chrome"), Utc::now());
        let stored = scope.upsert_trusted(&refreshed).await?;
        scope.commit().await?;

        assert_eq!(stored.id, original.id);
        assert_eq!(stored.first_seen_at, first_seen);
        assert_eq!(stored.attributes.country, "FR");
        assert_eq!(store.trusted_contexts(account).await?, vec![stored]);
        Ok(())
    }

    #[tokio::test]
    async fn scope_sees_every_device_of_the_account() -> anyhow::Result<()> {
        let store = MemoryStore::new();
        let account = Uuid::now_v7();
        store.seed_trusted(TrustedContext::new(
            account,
            attributes("US", "D2", "Windows", "Edge"),
            Utc::now(),
        ))?;
        store.seed_trusted(TrustedContext::new(
            Uuid::now_v7(),
            attributes("US", "D1", "macOS", "Chrome"),
            Utc::now(),
        ))?;

        let mut scope = store.lock(&key_for(account)).await?;
        let contexts = scope.trusted_contexts().await?;
        assert_eq!(contexts.len(), 1);
        assert_eq!(contexts[0].attributes.device, "D2");
        Ok(())
    }

    #[tokio::test]
    async fn token_is_consumed_once() -> anyhow::Result<()> {
        let store = MemoryStore::new();
        let account = Uuid::now_v7();
        let key = key_for(account);
        let now = Utc::now();
        let token = VerificationToken {
            id: Uuid::now_v7(),
            account,
            device_key: key.device_key.clone(),
            code_hash: vec![7; 32],
            issued_at: now,
            expires_at: now + Duration::hours(1),
            consumed_at: None,
            pending: attributes("US", "D1", "macOS", "Chrome"),
        };

        let mut scope = store.lock(&key).await?;
        scope.insert_token(&token).await?;
        assert_eq!(scope.live_token(now).await?.map(|t| t.id), Some(token.id));
        assert!(scope.consume_token(token.id, now).await?.is_some());
        assert!(scope.consume_token(token.id, now).await?.is_none());
        assert_eq!(scope.live_token(now).await?, None);
        scope.commit().await?;

        let stored = store.token_by_code_hash(&[7; 32]).await?;
        assert_eq!(stored.and_then(|t| t.consumed_at), Some(now));
        Ok(())
    }

    #[tokio::test]
    async fn outbox_messages_wait_for_commit() -> anyhow::Result<()> {
        let store = MemoryStore::new();
        let account = Uuid::now_v7();
        let message = OutboxMessage {
            account,
            template: "context_verification".to_string(),
            payload: serde_json::json!({ "reason": "test" }),
        };

        let mut scope = store.lock(&key_for(account)).await?;
        scope.enqueue_message(&message).await?;
        drop(scope);
        assert!(store.outbox()?.is_empty());

        let mut scope = store.lock(&key_for(account)).await?;
        scope.enqueue_message(&message).await?;
        scope.commit().await?;
        assert_eq!(store.outbox()?, vec![message]);
        Ok(())
    }

    #[tokio::test]
    async fn preference_defaults_to_enabled() -> anyhow::Result<()> {
        let store = MemoryStore::new();
        let account = Uuid::now_v7();
        assert!(store.context_auth_enabled(account).await?);
        store.set_context_auth(account, false)?;
        assert!(!store.context_auth_enabled(account).await?);
        Ok(())
    }

    #[tokio::test]
    async fn offline_store_refuses_locks() {
        let store = MemoryStore::new();
        store.set_unavailable(true);
        assert!(matches!(
            store.lock(&key_for(Uuid::now_v7())).await,
            Err(StoreError::Unavailable(_))
        ));
    }
}
