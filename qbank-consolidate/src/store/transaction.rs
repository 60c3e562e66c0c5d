//! Monitored store transactions
//!
//! Wraps an sqlx transaction and logs how long the connection was held,
//! so long-running consolidation batches show up in the logs.

use qbank_common::{Error, Result};
use sqlx::{Sqlite, SqliteConnection, SqlitePool, Transaction};
use std::time::Instant;

/// Transaction wrapper that logs acquisition and release timing
pub struct MonitoredTransaction<'c> {
    tx: Option<Transaction<'c, Sqlite>>,
    caller: &'static str,
    acquired_at: Instant,
}

impl<'c> MonitoredTransaction<'c> {
    /// Connection to run statements on
    pub fn conn(&mut self) -> Result<&mut SqliteConnection> {
        self.tx
            .as_deref_mut()
            .ok_or_else(|| Error::Internal(format!("{}: transaction already consumed", self.caller)))
    }

    /// Commit and log release timing
    pub async fn commit(mut self) -> Result<()> {
        let held_ms = self.acquired_at.elapsed().as_millis();
        let tx = self
            .tx
            .take()
            .ok_or_else(|| Error::Internal(format!("{}: transaction already consumed", self.caller)))?;

        tx.commit().await?;

        if held_ms > 2000 {
            tracing::warn!(
                caller = self.caller,
                held_ms,
                "LONG TRANSACTION - batch held the writer for an extended period"
            );
        } else if held_ms > 1000 {
            tracing::info!(
                caller = self.caller,
                held_ms,
                "Transaction held longer than expected (>1s)"
            );
        } else {
            tracing::debug!(caller = self.caller, held_ms, "Connection released (commit)");
        }

        Ok(())
    }

    /// Roll back and log release timing
    pub async fn rollback(mut self) -> Result<()> {
        let held_ms = self.acquired_at.elapsed().as_millis();
        let tx = self
            .tx
            .take()
            .ok_or_else(|| Error::Internal(format!("{}: transaction already consumed", self.caller)))?;

        tx.rollback().await?;

        tracing::debug!(caller = self.caller, held_ms, "Connection released (rollback)");

        Ok(())
    }
}

impl Drop for MonitoredTransaction<'_> {
    fn drop(&mut self) {
        if self.tx.is_some() {
            // sqlx rolls back a dropped transaction
            tracing::debug!(
                caller = self.caller,
                held_ms = self.acquired_at.elapsed().as_millis(),
                "Connection released (drop)"
            );
        }
    }
}

/// Begin a monitored transaction, logging slow connection acquisition
pub async fn begin_monitored<'c>(
    pool: &'c SqlitePool,
    caller: &'static str,
) -> Result<MonitoredTransaction<'c>> {
    let start = Instant::now();

    let tx = pool.begin().await?;

    let wait_ms = start.elapsed().as_millis();
    if wait_ms > 1000 {
        tracing::warn!(
            caller,
            wait_ms,
            "SLOW CONNECTION ACQUISITION - pool may be saturated"
        );
    } else {
        tracing::debug!(caller, wait_ms, "Connection acquired");
    }

    Ok(MonitoredTransaction {
        tx: Some(tx),
        caller,
        acquired_at: Instant::now(),
    })
}
