//! Session issuance backed by `account_sessions`.

use anyhow::{Context, Result};
use chrono::{TimeDelta, Utc};
use secrecy::SecretString;
use sqlx::PgPool;
use tracing::{Instrument, info_span};
use uuid::Uuid;

use crate::engine::BoxFuture;
use crate::engine::context::AccountId;
use crate::engine::notifier::{generate_secret, hash_secret};
use crate::engine::orchestrator::{SessionGrant, SessionIssuer};

pub const DEFAULT_SESSION_TTL_SECONDS: u32 = 43_200;

/// Random 32-byte session tokens; the table only keeps their SHA-256.
#[derive(Clone, Debug)]
pub struct PgSessionIssuer {
    pool: PgPool,
    ttl: TimeDelta,
}

impl PgSessionIssuer {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            ttl: TimeDelta::seconds(i64::from(DEFAULT_SESSION_TTL_SECONDS)),
        }
    }

    #[must_use]
    pub fn with_ttl_seconds(mut self, seconds: u32) -> Self {
        self.ttl = TimeDelta::seconds(i64::from(seconds.max(1)));
        self
    }

    #[must_use]
    pub fn ttl(&self) -> TimeDelta {
        self.ttl
    }

    async fn insert(&self, account: AccountId) -> Result<SessionGrant> {
        let token = generate_secret().context("failed to generate session token")?;
        let created_at = Utc::now();
        let expires_at = created_at + self.ttl;

        let query = r"
            INSERT INTO account_sessions (id, account_id, token_hash, created_at, expires_at)
            VALUES ($1, $2, $3, $4, $5)
        ";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "INSERT",
            db.statement = query
        );
        sqlx::query(query)
            .bind(Uuid::now_v7())
            .bind(account)
            .bind(hash_secret(&token))
            .bind(created_at)
            .bind(expires_at)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to insert session")?;

        Ok(SessionGrant {
            account,
            token: SecretString::from(token),
            expires_at,
        })
    }
}

impl SessionIssuer for PgSessionIssuer {
    fn issue(&self, account: AccountId) -> BoxFuture<'_, Result<SessionGrant>> {
        Box::pin(self.insert(account))
    }
}
