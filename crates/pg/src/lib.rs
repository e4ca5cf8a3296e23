//! PostgreSQL store backend.
//!
//! One transaction per protocol operation, wrapped in deadlock retry.
//! Cluster-wide invariants lean on PostgreSQL advisory locks: one
//! namespace for the per-execution recompute lock, another for the
//! per-sweep-type singleton lock.

use std::time::Duration;

use rand::Rng;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use rill_core::{ExecutionId, StoreError};

mod rows;
mod store;

/// Advisory-lock namespace reserved for the recompute engine, keyed per
/// execution.
pub(crate) const RECOMPUTE_LOCK_NS: i32 = 7301;

/// Advisory-lock namespace reserved for sweep singletons, keyed per sweep
/// type.
pub(crate) const SWEEP_LOCK_NS: i32 = 7302;

/// Deadlock retries before an operation reports `Unavailable`.
pub(crate) const DEADLOCK_RETRIES: u32 = 3;

pub(crate) const ERROR_DETAILS_MAX: usize = 1000;

const SCHEMA: &str = include_str!("schema.sql");

#[derive(Clone)]
pub struct PgWorkflowStore {
    pub(crate) pool: PgPool,
}

impl PgWorkflowStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(16)
            .connect(url)
            .await
            .map_err(map_sqlx_err)?;

        Ok(Self::new(pool))
    }

    /// Apply the embedded DDL. Idempotent.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_err)?;

        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Stable 32-bit advisory key for an execution: the uuid's leading bytes.
pub(crate) fn execution_lock_key(id: ExecutionId) -> i32 {
    let bytes = id.0.as_bytes();
    i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

pub(crate) fn is_deadlock(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .and_then(|db| db.code())
        .map(|code| code == "40P01" || code == "40001")
        .unwrap_or(false)
}

pub(crate) fn map_sqlx_err(err: sqlx::Error) -> StoreError {
    match &err {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            StoreError::Unavailable(err.to_string())
        }
        _ => StoreError::Internal(err.to_string()),
    }
}

/// Exponential backoff with uniform jitter: base 500·2ⁿ ms plus a random
/// addition in `[0, base]`.
pub(crate) async fn backoff_sleep(attempt: u32) {
    let base = 500u64.saturating_mul(1 << attempt.min(6));
    let jitter = rand::rng().random_range(0..=base);

    tokio::time::sleep(Duration::from_millis(base + jitter)).await;
}

/// Error type flowing inside a retried transaction body: database errors
/// stay distinguishable so the deadlock check can see them.
pub(crate) enum TxError {
    Sqlx(sqlx::Error),
    Store(StoreError),
}

impl From<sqlx::Error> for TxError {
    fn from(err: sqlx::Error) -> Self {
        TxError::Sqlx(err)
    }
}

impl From<StoreError> for TxError {
    fn from(err: StoreError) -> Self {
        TxError::Store(err)
    }
}

impl TxError {
    pub(crate) fn is_deadlock(&self) -> bool {
        match self {
            TxError::Sqlx(err) => is_deadlock(err),
            TxError::Store(_) => false,
        }
    }

    pub(crate) fn into_store(self) -> StoreError {
        match self {
            TxError::Sqlx(err) => map_sqlx_err(err),
            TxError::Store(err) => err,
        }
    }
}

/// Run a transaction body with deadlock retry. The body borrows the
/// transaction as `$tx` and yields `Result<T, TxError>`; the commit is
/// part of the retried unit.
macro_rules! with_tx_retry {
    ($store:expr, |$tx:ident| $body:block) => {{
        let mut attempt: u32 = 0;

        loop {
            #[allow(unused_mut)]
            let mut $tx = $store
                .pool
                .begin()
                .await
                .map_err($crate::map_sqlx_err)?;

            let result: Result<_, $crate::TxError> = async { $body }.await;

            match result {
                Ok(value) => match $tx.commit().await {
                    Ok(()) => break Ok(value),
                    Err(err)
                        if $crate::is_deadlock(&err) && attempt < $crate::DEADLOCK_RETRIES =>
                    {
                        attempt += 1;
                        tracing::warn!(attempt, "deadlock on commit, retrying transaction");
                        $crate::backoff_sleep(attempt).await;
                    }
                    Err(err) => break Err($crate::map_sqlx_err(err)),
                },
                Err(err) if err.is_deadlock() && attempt < $crate::DEADLOCK_RETRIES => {
                    drop($tx);
                    attempt += 1;
                    tracing::warn!(attempt, "deadlock detected, retrying transaction");
                    $crate::backoff_sleep(attempt).await;
                }
                Err(err) => break Err(err.into_store()),
            }
        }
    }};
}

pub(crate) use with_tx_retry;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn execution_lock_key_is_stable() {
        let id = ExecutionId::parse("6f2a0a54-3c8f-4f5e-9f62-0a54b1c2d3e4").unwrap();

        assert_eq!(execution_lock_key(id), execution_lock_key(id));
        assert_eq!(execution_lock_key(id), i32::from_be_bytes([0x6f, 0x2a, 0x0a, 0x54]));
    }
}
