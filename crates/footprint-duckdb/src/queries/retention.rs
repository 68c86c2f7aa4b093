use anyhow::Result;
use chrono::{DateTime, Utc};
use tracing::info;

use footprint_core::store::RetentionReport;

use crate::backend::fmt_ts;
use crate::DuckDbBackend;

/// Delete every session whose last activity is before `cutoff`, together with
/// its pageviews and events. Children go first; all in one transaction.
/// The merge log is never pruned.
pub(crate) async fn delete_before_inner(
    db: &DuckDbBackend,
    cutoff: DateTime<Utc>,
) -> Result<RetentionReport> {
    let cutoff_str = fmt_ts(cutoff);
    let mut conn = db.conn.lock().await;
    let tx = conn.transaction()?;

    let events_deleted = tx.execute(
        "DELETE FROM events WHERE session_id IN (
             SELECT id FROM sessions WHERE last_activity < ?1
         )",
        duckdb::params![cutoff_str],
    )?;
    let pageviews_deleted = tx.execute(
        "DELETE FROM pageviews WHERE session_id IN (
             SELECT id FROM sessions WHERE last_activity < ?1
         )",
        duckdb::params![cutoff_str],
    )?;
    let sessions_deleted = tx.execute(
        "DELETE FROM sessions WHERE last_activity < ?1",
        duckdb::params![cutoff_str],
    )?;

    tx.commit()?;
    info!(
        cutoff = %cutoff_str,
        sessions_deleted,
        pageviews_deleted,
        events_deleted,
        "deleted expired sessions"
    );
    Ok(RetentionReport {
        events_deleted: events_deleted as i64,
        pageviews_deleted: pageviews_deleted as i64,
        sessions_deleted: sessions_deleted as i64,
    })
}
