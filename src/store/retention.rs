//! Retention and compression maintenance for the time-partitioned tables.
//! Runs from the `retention_maintenance` job; the write path never deletes.

use super::schema::RETENTION;
use super::TickStore;
use crate::error::Result;
use tracing::{info, warn};

/// Summary of one maintenance pass, for the job log.
#[derive(Debug, Default)]
pub struct RetentionReport {
    pub chunks_compressed: u64,
    pub tables_trimmed: u64,
    pub rows_deleted: u64,
}

impl TickStore {
    /// Apply the declared compress-at / delete-at horizons. Chunk-level
    /// operations need TimescaleDB; when they fail (plain Postgres) the
    /// delete horizon is still enforced with row deletes.
    pub async fn apply_retention(&self) -> Result<RetentionReport> {
        let mut report = RetentionReport::default();

        for policy in RETENTION {
            if let Some(days) = policy.compress_after_days {
                let compress = format!(
                    "SELECT compress_chunk(c, TRUE) FROM show_chunks('{}', older_than => INTERVAL '{} days') c",
                    policy.table, days
                );
                match sqlx::query(&compress).execute(self.pool()).await {
                    Ok(result) => report.chunks_compressed += result.rows_affected(),
                    Err(e) => warn!("compress pass for {} skipped: {}", policy.table, e),
                }
            }

            let dropped = format!(
                "SELECT drop_chunks('{}', INTERVAL '{} days')",
                policy.table, policy.delete_after_days
            );
            match sqlx::query(&dropped).execute(self.pool()).await {
                Ok(_) => report.tables_trimmed += 1,
                Err(_) => {
                    // Not a hypertable (match_live_frame, or Timescale
                    // missing): fall back to a bounded row delete.
                    let time_column = if policy.table == "match_live_frame" {
                        "bucket_start"
                    } else {
                        "instant"
                    };
                    let delete = format!(
                        "DELETE FROM {} WHERE {} < now() - INTERVAL '{} days'",
                        policy.table, time_column, policy.delete_after_days
                    );
                    match sqlx::query(&delete).execute(self.pool()).await {
                        Ok(result) => {
                            report.rows_deleted += result.rows_affected();
                            report.tables_trimmed += 1;
                        }
                        Err(e) => warn!("retention delete for {} failed: {}", policy.table, e),
                    }
                }
            }
        }

        info!(
            "retention pass done: {} chunks compressed, {} tables trimmed, {} rows deleted",
            report.chunks_compressed, report.tables_trimmed, report.rows_deleted
        );
        Ok(report)
    }
}
