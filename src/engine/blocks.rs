//! Block registry.
//!
//! Temporary entries mark a device waiting for email verification and are
//! lifted by a full match or a consumed code. Permanent entries are never
//! cleared here.

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::store::{BlockEntry, KeyScope, StoreResult};

pub const REASON_SUSPICIOUS: &str = "repeated context mismatch; email verification pending";
pub const REASON_PERMANENT: &str = "block threshold reached without verification";

pub async fn permanent(scope: &mut dyn KeyScope) -> StoreResult<Option<BlockEntry>> {
    Ok(scope.block().await?.filter(|entry| entry.permanent))
}

pub async fn suspend(scope: &mut dyn KeyScope, at: DateTime<Utc>) -> StoreResult<BlockEntry> {
    let entry = entry(scope, at, false, REASON_SUSPICIOUS);
    scope.put_block(&entry).await?;
    Ok(entry)
}

pub async fn block_permanently(scope: &mut dyn KeyScope, at: DateTime<Utc>) -> StoreResult<BlockEntry> {
    let entry = entry(scope, at, true, REASON_PERMANENT);
    scope.put_block(&entry).await?;
    warn!(key = %scope.key(), "device permanently blocked");
    Ok(entry)
}

pub async fn lift_suspension(scope: &mut dyn KeyScope) -> StoreResult<()> {
    scope.clear_temporary_block().await
}

fn entry(scope: &dyn KeyScope, at: DateTime<Utc>, permanent: bool, reason: &str) -> BlockEntry {
    let key = scope.key();
    BlockEntry {
        account: key.account,
        device_key: key.device_key.clone(),
        blocked_at: at,
        permanent,
        reason: reason.to_string(),
    }
}
