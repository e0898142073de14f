//! PostgreSQL store.
//!
//! A [`KeyScope`] is a transaction holding
//! `pg_advisory_xact_lock(hashtextextended('<account>:<device key>', 0))`.
//! The lock is released by commit or rollback, so every instance sharing the
//! database serializes on the same key. The schema lives in `sql/schema.sql`.

use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::{Decode, Executor, Postgres, Row, Transaction, Type};
use std::net::IpAddr;
use tracing::{Instrument, Span, info_span};
use uuid::Uuid;

use super::{
    AttemptOutcome, AttemptRecord, BlockEntry, ContextStore, KeyScope, OutboxMessage, ScopeKey, SignInEvent,
    StoreError, StoreResult, VerificationToken,
};
use crate::engine::BoxFuture;
use crate::engine::context::{AccountId, ContextAttributes, DeviceKey, TrustedContext};

const TRUSTED_COLUMNS: &str = "id, account_id, device_key, host(ip) AS ip, country, city, device, \
     device_type, os, platform, browser, first_seen_at, last_confirmed_at";

#[derive(Clone, Debug)]
pub struct PgContextStore {
    pool: PgPool,
}

impl PgContextStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn db_span(operation: &'static str, statement: &str) -> Span {
    info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = operation,
        db.statement = statement
    )
}

fn classify(err: sqlx::Error, otherwise: fn(String) -> StoreError) -> StoreError {
    match err {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) | sqlx::Error::Tls(_) => {
            StoreError::Unavailable(err.to_string())
        }
        other => otherwise(other.to_string()),
    }
}

fn read_error(err: sqlx::Error) -> StoreError {
    classify(err, StoreError::Read)
}

fn write_error(err: sqlx::Error) -> StoreError {
    classify(err, StoreError::Write)
}

fn column<'r, T>(row: &'r PgRow, name: &str) -> StoreResult<T>
where
    T: Decode<'r, Postgres> + Type<Postgres>,
{
    row.try_get(name)
        .map_err(|err| StoreError::Read(format!("column {name}: {err}")))
}

fn parse_ip(value: &str) -> StoreResult<IpAddr> {
    value
        .parse()
        .map_err(|err| StoreError::Read(format!("invalid stored address {value}: {err}")))
}

fn trusted_from_row(row: &PgRow) -> StoreResult<TrustedContext> {
    let ip: String = column(row, "ip")?;
    Ok(TrustedContext {
        id: column(row, "id")?,
        account: column(row, "account_id")?,
        device_key: DeviceKey::from_stored(column(row, "device_key")?),
        attributes: ContextAttributes {
            ip: parse_ip(&ip)?,
            country: column(row, "country")?,
            city: column(row, "city")?,
            device: column(row, "device")?,
            device_type: column(row, "device_type")?,
            os: column(row, "os")?,
            platform: column(row, "platform")?,
            browser: column(row, "browser")?,
        },
        first_seen_at: column(row, "first_seen_at")?,
        last_confirmed_at: column(row, "last_confirmed_at")?,
    })
}

fn attempt_from_row(row: &PgRow) -> StoreResult<AttemptRecord> {
    let count: i32 = column(row, "attempt_count")?;
    let outcome: String = column(row, "last_outcome")?;
    Ok(AttemptRecord {
        account: column(row, "account_id")?,
        device_key: DeviceKey::from_stored(column(row, "device_key")?),
        attempt_count: u32::try_from(count)
            .map_err(|_| StoreError::Read(format!("negative attempt count {count}")))?,
        first_attempt_at: column(row, "first_attempt_at")?,
        last_outcome: outcome.parse()?,
    })
}

fn block_from_row(row: &PgRow) -> StoreResult<BlockEntry> {
    Ok(BlockEntry {
        account: column(row, "account_id")?,
        device_key: DeviceKey::from_stored(column(row, "device_key")?),
        blocked_at: column(row, "blocked_at")?,
        permanent: column(row, "permanent")?,
        reason: column(row, "reason")?,
    })
}

fn token_from_row(row: &PgRow) -> StoreResult<VerificationToken> {
    let pending: String = column(row, "pending")?;
    Ok(VerificationToken {
        id: column(row, "id")?,
        account: column(row, "account_id")?,
        device_key: DeviceKey::from_stored(column(row, "device_key")?),
        code_hash: column(row, "code_hash")?,
        issued_at: column(row, "issued_at")?,
        expires_at: column(row, "expires_at")?,
        consumed_at: column(row, "consumed_at")?,
        pending: serde_json::from_str(&pending)
            .map_err(|err| StoreError::Read(format!("invalid pending context: {err}")))?,
    })
}

async fn fetch_trusted<'e, E>(executor: E, account: AccountId) -> StoreResult<Vec<TrustedContext>>
where
    E: Executor<'e, Database = Postgres>,
{
    let query = format!(
        "SELECT {TRUSTED_COLUMNS} FROM trusted_contexts WHERE account_id = $1 ORDER BY first_seen_at"
    );
    let rows = sqlx::query(&query)
        .bind(account)
        .fetch_all(executor)
        .instrument(db_span("SELECT", &query))
        .await
        .map_err(read_error)?;
    rows.iter().map(trusted_from_row).collect()
}

async fn fetch_attempts<'e, E>(executor: E, key: &ScopeKey) -> StoreResult<Option<AttemptRecord>>
where
    E: Executor<'e, Database = Postgres>,
{
    let query = r"
        SELECT account_id, device_key, attempt_count, first_attempt_at, last_outcome
        FROM signin_attempts
        WHERE account_id = $1 AND device_key = $2
    ";
    let row = sqlx::query(query)
        .bind(key.account)
        .bind(key.device_key.as_str())
        .fetch_optional(executor)
        .instrument(db_span("SELECT", query))
        .await
        .map_err(read_error)?;
    row.as_ref().map(attempt_from_row).transpose()
}

async fn fetch_block<'e, E>(executor: E, key: &ScopeKey) -> StoreResult<Option<BlockEntry>>
where
    E: Executor<'e, Database = Postgres>,
{
    let query = r"
        SELECT account_id, device_key, blocked_at, permanent, reason
        FROM device_blocks
        WHERE account_id = $1 AND device_key = $2
    ";
    let row = sqlx::query(query)
        .bind(key.account)
        .bind(key.device_key.as_str())
        .fetch_optional(executor)
        .instrument(db_span("SELECT", query))
        .await
        .map_err(read_error)?;
    row.as_ref().map(block_from_row).transpose()
}

impl ContextStore for PgContextStore {
    fn lock<'a>(&'a self, key: &'a ScopeKey) -> BoxFuture<'a, StoreResult<Box<dyn KeyScope>>> {
        Box::pin(async move {
            let mut tx = self
                .pool
                .begin()
                .await
                .map_err(|err| classify(err, StoreError::Unavailable))?;

            let query = "SELECT pg_advisory_xact_lock(hashtextextended($1, 0))";
            sqlx::query(query)
                .bind(key.to_string())
                .execute(&mut *tx)
                .instrument(db_span("SELECT", query))
                .await
                .map_err(|err| classify(err, StoreError::Unavailable))?;

            let scope: Box<dyn KeyScope> = Box::new(PgScope {
                tx,
                key: key.clone(),
            });
            Ok(scope)
        })
    }

    fn trusted_contexts(&self, account: AccountId) -> BoxFuture<'_, StoreResult<Vec<TrustedContext>>> {
        Box::pin(fetch_trusted(&self.pool, account))
    }

    fn attempt_record<'a>(&'a self, key: &'a ScopeKey) -> BoxFuture<'a, StoreResult<Option<AttemptRecord>>> {
        Box::pin(fetch_attempts(&self.pool, key))
    }

    fn block_entry<'a>(&'a self, key: &'a ScopeKey) -> BoxFuture<'a, StoreResult<Option<BlockEntry>>> {
        Box::pin(fetch_block(&self.pool, key))
    }

    fn token_by_code_hash<'a>(
        &'a self,
        code_hash: &'a [u8],
    ) -> BoxFuture<'a, StoreResult<Option<VerificationToken>>> {
        Box::pin(async move {
            let query = r"
                SELECT id, account_id, device_key, code_hash, issued_at, expires_at, consumed_at,
                       pending::text AS pending
                FROM context_verification_tokens
                WHERE code_hash = $1
            ";
            let row = sqlx::query(query)
                .bind(code_hash)
                .fetch_optional(&self.pool)
                .instrument(db_span("SELECT", query))
                .await
                .map_err(read_error)?;
            row.as_ref().map(token_from_row).transpose()
        })
    }

    fn context_auth_enabled(&self, account: AccountId) -> BoxFuture<'_, StoreResult<bool>> {
        Box::pin(async move {
            let query = "SELECT context_auth_enabled FROM account_preferences WHERE account_id = $1";
            let enabled: Option<bool> = sqlx::query_scalar(query)
                .bind(account)
                .fetch_optional(&self.pool)
                .instrument(db_span("SELECT", query))
                .await
                .map_err(read_error)?;
            Ok(enabled.unwrap_or(true))
        })
    }

    fn record_event<'a>(&'a self, event: &'a SignInEvent) -> BoxFuture<'a, StoreResult<()>> {
        Box::pin(async move {
            let query = r"
                INSERT INTO signin_events
                    (id, account_id, device_key, ip, kind, level, message, created_at)
                VALUES ($1, $2, $3, $4::inet, $5, $6, $7, $8)
            ";
            sqlx::query(query)
                .bind(Uuid::now_v7())
                .bind(event.account)
                .bind(event.device_key.as_ref().map(DeviceKey::as_str))
                .bind(event.ip.map(|ip| ip.to_string()))
                .bind(event.kind.as_str())
                .bind(event.level.as_str())
                .bind(&event.message)
                .bind(event.at)
                .execute(&self.pool)
                .instrument(db_span("INSERT", query))
                .await
                .map_err(write_error)?;
            Ok(())
        })
    }

    fn ping(&self) -> BoxFuture<'_, StoreResult<()>> {
        Box::pin(async move {
            let query = "SELECT 1";
            sqlx::query(query)
                .execute(&self.pool)
                .instrument(db_span("SELECT", query))
                .await
                .map_err(|err| classify(err, StoreError::Unavailable))?;
            Ok(())
        })
    }
}

struct PgScope {
    tx: Transaction<'static, Postgres>,
    key: ScopeKey,
}

impl KeyScope for PgScope {
    fn key(&self) -> &ScopeKey {
        &self.key
    }

    fn block(&mut self) -> BoxFuture<'_, StoreResult<Option<BlockEntry>>> {
        Box::pin(async move { fetch_block(&mut *self.tx, &self.key).await })
    }

    fn trusted_contexts(&mut self) -> BoxFuture<'_, StoreResult<Vec<TrustedContext>>> {
        Box::pin(async move { fetch_trusted(&mut *self.tx, self.key.account).await })
    }

    fn confirm_trusted(&mut self, id: Uuid, at: DateTime<Utc>) -> BoxFuture<'_, StoreResult<()>> {
        Box::pin(async move {
            let query = "UPDATE trusted_contexts SET last_confirmed_at = $2 WHERE id = $1";
            sqlx::query(query)
                .bind(id)
                .bind(at)
                .execute(&mut *self.tx)
                .instrument(db_span("UPDATE", query))
                .await
                .map_err(write_error)?;
            Ok(())
        })
    }

    fn upsert_trusted<'a>(
        &'a mut self,
        context: &'a TrustedContext,
    ) -> BoxFuture<'a, StoreResult<TrustedContext>> {
        Box::pin(async move {
            let query = format!(
                r"
                INSERT INTO trusted_contexts
                    (id, account_id, device_key, ip, country, city, device, device_type, os,
                     platform, browser, first_seen_at, last_confirmed_at)
                VALUES ($1, $2, $3, $4::inet, $5, $6, $7, $8, $9, $10, $11, $12, $13)
                ON CONFLICT (account_id, device_key) DO UPDATE
                SET ip = EXCLUDED.ip,
                    country = EXCLUDED.country,
                    city = EXCLUDED.city,
                    device = EXCLUDED.device,
                    device_type = EXCLUDED.device_type,
                    os = EXCLUDED.os,
                    platform = EXCLUDED.platform,
                    browser = EXCLUDED.browser,
                    last_confirmed_at = EXCLUDED.last_confirmed_at
                RETURNING {TRUSTED_COLUMNS}
            "
            );
            let attributes = &context.attributes;
            let row = sqlx::query(&query)
                .bind(context.id)
                .bind(context.account)
                .bind(context.device_key.as_str())
                .bind(attributes.ip.to_string())
                .bind(&attributes.country)
                .bind(&attributes.city)
                .bind(&attributes.device)
                .bind(&attributes.device_type)
                .bind(&attributes.os)
                .bind(&attributes.platform)
                .bind(&attributes.browser)
                .bind(context.first_seen_at)
                .bind(context.last_confirmed_at)
                .fetch_one(&mut *self.tx)
                .instrument(db_span("INSERT", &query))
                .await
                .map_err(write_error)?;
            trusted_from_row(&row)
        })
    }

    fn attempts(&mut self) -> BoxFuture<'_, StoreResult<Option<AttemptRecord>>> {
        Box::pin(async move { fetch_attempts(&mut *self.tx, &self.key).await })
    }

    fn increment_attempts(&mut self, at: DateTime<Utc>) -> BoxFuture<'_, StoreResult<AttemptRecord>> {
        Box::pin(async move {
            let query = r"
                INSERT INTO signin_attempts
                    (account_id, device_key, attempt_count, first_attempt_at, last_outcome)
                VALUES ($1, $2, 1, $3, 'mismatch')
                ON CONFLICT (account_id, device_key) DO UPDATE
                SET attempt_count = signin_attempts.attempt_count + 1
                RETURNING account_id, device_key, attempt_count, first_attempt_at, last_outcome
            ";
            let row = sqlx::query(query)
                .bind(self.key.account)
                .bind(self.key.device_key.as_str())
                .bind(at)
                .fetch_one(&mut *self.tx)
                .instrument(db_span("INSERT", query))
                .await
                .map_err(write_error)?;
            attempt_from_row(&row)
        })
    }

    fn set_attempt_outcome(&mut self, outcome: AttemptOutcome) -> BoxFuture<'_, StoreResult<()>> {
        Box::pin(async move {
            let query = r"
                UPDATE signin_attempts
                SET last_outcome = $3
                WHERE account_id = $1 AND device_key = $2
            ";
            sqlx::query(query)
                .bind(self.key.account)
                .bind(self.key.device_key.as_str())
                .bind(outcome.as_str())
                .execute(&mut *self.tx)
                .instrument(db_span("UPDATE", query))
                .await
                .map_err(write_error)?;
            Ok(())
        })
    }

    fn reset_attempts(&mut self) -> BoxFuture<'_, StoreResult<()>> {
        Box::pin(async move {
            let query = "DELETE FROM signin_attempts WHERE account_id = $1 AND device_key = $2";
            sqlx::query(query)
                .bind(self.key.account)
                .bind(self.key.device_key.as_str())
                .execute(&mut *self.tx)
                .instrument(db_span("DELETE", query))
                .await
                .map_err(write_error)?;
            Ok(())
        })
    }

    fn put_block<'a>(&'a mut self, entry: &'a BlockEntry) -> BoxFuture<'a, StoreResult<()>> {
        Box::pin(async move {
            // The WHERE clause keeps an existing permanent row from being downgraded.
            let query = r"
                INSERT INTO device_blocks (account_id, device_key, blocked_at, permanent, reason)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (account_id, device_key) DO UPDATE
                SET blocked_at = EXCLUDED.blocked_at,
                    permanent = EXCLUDED.permanent,
                    reason = EXCLUDED.reason
                WHERE NOT device_blocks.permanent OR EXCLUDED.permanent
            ";
            sqlx::query(query)
                .bind(entry.account)
                .bind(entry.device_key.as_str())
                .bind(entry.blocked_at)
                .bind(entry.permanent)
                .bind(&entry.reason)
                .execute(&mut *self.tx)
                .instrument(db_span("INSERT", query))
                .await
                .map_err(write_error)?;
            Ok(())
        })
    }

    fn clear_temporary_block(&mut self) -> BoxFuture<'_, StoreResult<()>> {
        Box::pin(async move {
            let query = r"
                DELETE FROM device_blocks
                WHERE account_id = $1 AND device_key = $2 AND NOT permanent
            ";
            sqlx::query(query)
                .bind(self.key.account)
                .bind(self.key.device_key.as_str())
                .execute(&mut *self.tx)
                .instrument(db_span("DELETE", query))
                .await
                .map_err(write_error)?;
            Ok(())
        })
    }

    fn live_token(&mut self, now: DateTime<Utc>) -> BoxFuture<'_, StoreResult<Option<VerificationToken>>> {
        Box::pin(async move {
            let query = r"
                SELECT id, account_id, device_key, code_hash, issued_at, expires_at, consumed_at,
                       pending::text AS pending
                FROM context_verification_tokens
                WHERE account_id = $1
                  AND device_key = $2
                  AND consumed_at IS NULL
                  AND expires_at > $3
                ORDER BY issued_at DESC
                LIMIT 1
            ";
            let row = sqlx::query(query)
                .bind(self.key.account)
                .bind(self.key.device_key.as_str())
                .bind(now)
                .fetch_optional(&mut *self.tx)
                .instrument(db_span("SELECT", query))
                .await
                .map_err(read_error)?;
            row.as_ref().map(token_from_row).transpose()
        })
    }

    fn insert_token<'a>(&'a mut self, token: &'a VerificationToken) -> BoxFuture<'a, StoreResult<()>> {
        Box::pin(async move {
            let pending = serde_json::to_string(&token.pending)
                .map_err(|err| StoreError::Write(format!("failed to encode pending context: {err}")))?;
            let query = r"
                INSERT INTO context_verification_tokens
                    (id, account_id, device_key, code_hash, issued_at, expires_at, pending)
                VALUES ($1, $2, $3, $4, $5, $6, $7::jsonb)
            ";
            sqlx::query(query)
                .bind(token.id)
                .bind(token.account)
                .bind(token.device_key.as_str())
                .bind(&token.code_hash)
                .bind(token.issued_at)
                .bind(token.expires_at)
                .bind(pending)
                .execute(&mut *self.tx)
                .instrument(db_span("INSERT", query))
                .await
                .map_err(write_error)?;
            Ok(())
        })
    }

    fn consume_token(
        &mut self,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> BoxFuture<'_, StoreResult<Option<VerificationToken>>> {
        Box::pin(async move {
            let query = r"
                UPDATE context_verification_tokens
                SET consumed_at = $2
                WHERE id = $1 AND consumed_at IS NULL AND expires_at > $2
                RETURNING id, account_id, device_key, code_hash, issued_at, expires_at, consumed_at,
                          pending::text AS pending
            ";
            let row = sqlx::query(query)
                .bind(id)
                .bind(now)
                .fetch_optional(&mut *self.tx)
                .instrument(db_span("UPDATE", query))
                .await
                .map_err(write_error)?;
            row.as_ref().map(token_from_row).transpose()
        })
    }

    fn enqueue_message<'a>(&'a mut self, message: &'a OutboxMessage) -> BoxFuture<'a, StoreResult<()>> {
        Box::pin(async move {
            let query = r"
                INSERT INTO email_outbox
                    (id, account_id, template, payload_json, status, next_attempt_at, created_at)
                VALUES ($1, $2, $3, $4::jsonb, 'pending', NOW(), NOW())
            ";
            sqlx::query(query)
                .bind(Uuid::now_v7())
                .bind(message.account)
                .bind(&message.template)
                .bind(message.payload.to_string())
                .execute(&mut *self.tx)
                .instrument(db_span("INSERT", query))
                .await
                .map_err(write_error)?;
            Ok(())
        })
    }

    fn commit(self: Box<Self>) -> BoxFuture<'static, StoreResult<()>> {
        let scope = *self;
        Box::pin(async move { scope.tx.commit().await.map_err(write_error) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_errors_read_as_unavailable() {
        assert!(matches!(
            read_error(sqlx::Error::PoolTimedOut),
            StoreError::Unavailable(_)
        ));
        assert!(matches!(
            write_error(sqlx::Error::RowNotFound),
            StoreError::Write(_)
        ));
    }

    #[test]
    fn stored_addresses_parse() {
        assert!(parse_ip("203.0.113.10").is_ok());
        assert!(parse_ip("2001:db8::1").is_ok());
        assert!(parse_ip("203.0.113.10/32").is_err());
    }

    use crate::engine::notifier::hash_secret;
    use crate::engine::test_support::attributes;
    use crate::store::container;
    use anyhow::{Result, anyhow};
    use chrono::{SubsecRound, TimeDelta};
    use std::sync::Arc;

    async fn store() -> Result<Option<PgContextStore>> {
        if let Err(err) = container::ensure_container_runtime() {
            eprintln!("Skipping integration test: {err}");
            return Ok(None);
        }
        Ok(Some(PgContextStore::new(container::test_pool().await?)))
    }

    fn now() -> DateTime<Utc> {
        Utc::now().trunc_subsecs(6)
    }

    fn mac() -> ContextAttributes {
        attributes("US", "Mac", "macOS", "Chrome")
    }

    fn fresh_key() -> ScopeKey {
        ScopeKey::new(Uuid::now_v7(), mac().device_key())
    }

    fn block(key: &ScopeKey, permanent: bool, reason: &str) -> BlockEntry {
        BlockEntry {
            account: key.account,
            device_key: key.device_key.clone(),
            blocked_at: now(),
            permanent,
            reason: reason.to_string(),
        }
    }

    fn token(key: &ScopeKey, expires_in: TimeDelta) -> VerificationToken {
        let issued_at = now();
        VerificationToken {
            id: Uuid::now_v7(),
            account: key.account,
            device_key: key.device_key.clone(),
            code_hash: hash_secret(&Uuid::new_v4().to_string()),
            issued_at,
            expires_at: issued_at + expires_in,
            consumed_at: None,
            pending: mac(),
        }
    }

    async fn outbox_rows(store: &PgContextStore, account: AccountId) -> Result<i64> {
        let count = sqlx::query_scalar("SELECT COUNT(*) FROM email_outbox WHERE account_id = $1")
            .bind(account)
            .fetch_one(store.pool())
            .await?;
        Ok(count)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_increments_count_every_attempt() -> Result<()> {
        let Some(store) = store().await? else {
            return Ok(());
        };
        let store = Arc::new(store);
        let key = fresh_key();

        let mut tasks = Vec::new();
        for _ in 0..12 {
            let store = store.clone();
            let key = key.clone();
            tasks.push(tokio::spawn(async move {
                let mut scope = store.lock(&key).await?;
                let record = scope.increment_attempts(Utc::now()).await?;
                scope.commit().await?;
                Ok::<u32, StoreError>(record.attempt_count)
            }));
        }

        let mut counts = Vec::new();
        for task in tasks {
            counts.push(task.await??);
        }
        counts.sort_unstable();
        assert_eq!(counts, (1..=12).collect::<Vec<u32>>());

        let record = store.attempt_record(&key).await?.ok_or_else(|| anyhow!("no attempts"))?;
        assert_eq!(record.attempt_count, 12);
        assert_eq!(record.last_outcome, AttemptOutcome::Mismatch);
        Ok(())
    }

    #[tokio::test]
    async fn permanent_block_is_never_downgraded() -> Result<()> {
        let Some(store) = store().await? else {
            return Ok(());
        };
        let key = fresh_key();

        let mut scope = store.lock(&key).await?;
        scope.put_block(&block(&key, false, "temporary")).await?;
        scope.put_block(&block(&key, true, "permanent")).await?;
        scope.commit().await?;

        let mut scope = store.lock(&key).await?;
        scope.put_block(&block(&key, false, "retry")).await?;
        scope.clear_temporary_block().await?;
        scope.commit().await?;

        let entry = store.block_entry(&key).await?.ok_or_else(|| anyhow!("block vanished"))?;
        assert!(entry.permanent);
        assert_eq!(entry.reason, "permanent");

        let other = fresh_key();
        let mut scope = store.lock(&other).await?;
        scope.put_block(&block(&other, false, "temporary")).await?;
        scope.clear_temporary_block().await?;
        scope.commit().await?;
        assert!(store.block_entry(&other).await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn token_is_consumed_only_once() -> Result<()> {
        let Some(store) = store().await? else {
            return Ok(());
        };
        let key = fresh_key();
        let live = token(&key, TimeDelta::hours(24));
        let expired = token(&key, TimeDelta::seconds(-1));

        let mut scope = store.lock(&key).await?;
        scope.insert_token(&expired).await?;
        scope.insert_token(&live).await?;
        assert_eq!(scope.live_token(Utc::now()).await?.map(|t| t.id), Some(live.id));
        scope.commit().await?;

        let mut scope = store.lock(&key).await?;
        let consumed = scope.consume_token(live.id, Utc::now()).await?;
        assert_eq!(consumed.as_ref().map(|t| &t.pending), Some(&live.pending));
        assert!(scope.consume_token(live.id, Utc::now()).await?.is_none());
        assert!(scope.consume_token(expired.id, Utc::now()).await?.is_none());
        scope.commit().await?;

        let mut scope = store.lock(&key).await?;
        assert!(scope.consume_token(live.id, Utc::now()).await?.is_none());
        assert!(scope.live_token(Utc::now()).await?.is_none());
        drop(scope);

        let stored = store
            .token_by_code_hash(&live.code_hash)
            .await?
            .ok_or_else(|| anyhow!("token missing"))?;
        assert!(stored.is_consumed());
        Ok(())
    }

    #[tokio::test]
    async fn upsert_keeps_id_and_first_seen() -> Result<()> {
        let Some(store) = store().await? else {
            return Ok(());
        };
        let key = fresh_key();
        let first = TrustedContext::new(key.account, mac(), now() - TimeDelta::days(30));

        let mut scope = store.lock(&key).await?;
        assert_eq!(scope.upsert_trusted(&first).await?, first);
        scope.commit().await?;

        let mut moved = mac();
        moved.city = "Dallas".to_string();
        moved.ip = "198.51.100.23".parse()?;
        let later = now();
        let second = TrustedContext::new(key.account, moved.clone(), later);
        assert_ne!(second.id, first.id);

        let mut scope = store.lock(&key).await?;
        let stored = scope.upsert_trusted(&second).await?;
        scope.commit().await?;

        assert_eq!(stored.id, first.id);
        assert_eq!(stored.first_seen_at, first.first_seen_at);
        assert_eq!(stored.last_confirmed_at, later);
        assert_eq!(stored.attributes, moved);
        assert_eq!(store.trusted_contexts(key.account).await?, vec![stored]);
        Ok(())
    }

    #[tokio::test]
    async fn addresses_survive_inet_storage() -> Result<()> {
        let Some(store) = store().await? else {
            return Ok(());
        };
        let account = Uuid::now_v7();
        let mut phone = attributes("US", "iPhone", "iOS", "Safari");
        phone.ip = "2001:db8::17".parse()?;
        let mut laptop = mac();
        laptop.ip = "203.0.113.10".parse()?;

        for attributes in [laptop, phone] {
            let context = TrustedContext::new(account, attributes, now());
            let key = ScopeKey::new(account, context.device_key.clone());
            let mut scope = store.lock(&key).await?;
            let stored = scope.upsert_trusted(&context).await?;
            scope.commit().await?;
            assert_eq!(stored.attributes.ip, context.attributes.ip);
        }

        let mut addresses: Vec<String> = store
            .trusted_contexts(account)
            .await?
            .iter()
            .map(|context| context.attributes.ip.to_string())
            .collect();
        addresses.sort();
        assert_eq!(addresses, vec!["2001:db8::17", "203.0.113.10"]);
        Ok(())
    }

    #[tokio::test]
    async fn dropped_scope_discards_token_and_message() -> Result<()> {
        let Some(store) = store().await? else {
            return Ok(());
        };
        let key = fresh_key();
        let issued = token(&key, TimeDelta::hours(1));
        let message = OutboxMessage {
            account: key.account,
            template: "context_verification".to_string(),
            payload: serde_json::json!({ "deviceKey": key.device_key.as_str() }),
        };

        let mut scope = store.lock(&key).await?;
        scope.insert_token(&issued).await?;
        scope.enqueue_message(&message).await?;
        drop(scope);

        assert!(store.token_by_code_hash(&issued.code_hash).await?.is_none());
        assert_eq!(outbox_rows(&store, key.account).await?, 0);

        let mut scope = store.lock(&key).await?;
        scope.insert_token(&issued).await?;
        scope.enqueue_message(&message).await?;
        scope.commit().await?;

        assert!(store.token_by_code_hash(&issued.code_hash).await?.is_some());
        assert_eq!(outbox_rows(&store, key.account).await?, 1);
        Ok(())
    }
}
