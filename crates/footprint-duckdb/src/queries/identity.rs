use anyhow::Result;
use tracing::debug;

use footprint_core::event::{IdentitySignals, IDENTIFY_EVENT};
use footprint_core::identity::MergeRecord;
use footprint_core::store::{FingerprintSummary, MergeOutcome, SignalObservation};
use footprint_core::window::CohortWindow;

use crate::backend::{fmt_ts, ts_from_ms};
use crate::DuckDbBackend;

/// Identify-class events in `window`, attributed to the current owner of their session.
pub(crate) async fn identify_signals_inner(
    db: &DuckDbBackend,
    site_id: i64,
    window: &CohortWindow,
) -> Result<Vec<SignalObservation>> {
    let conn = db.conn.lock().await;
    let mut stmt = conn.prepare(
        "SELECT s.fingerprint, e.data, epoch_ms(e.created_at)
         FROM events e
         JOIN sessions s ON s.id = e.session_id
         WHERE e.site_id = ?1
           AND e.created_at >= ?2 AND e.created_at < ?3
           AND e.data IS NOT NULL
           AND (lower(e.name) = ?4 OR lower(coalesce(e.category, '')) = ?4)
         ORDER BY e.created_at ASC, e.id ASC",
    )?;
    let rows = stmt.query_map(
        duckdb::params![
            site_id,
            fmt_ts(window.start),
            fmt_ts(window.end),
            IDENTIFY_EVENT,
        ],
        |row| {
            let data: Option<String> = row.get(1)?;
            Ok(SignalObservation {
                fingerprint: row.get(0)?,
                signals: IdentitySignals::from_json(data.as_deref()),
                observed_at: ts_from_ms(row.get(2)?),
            })
        },
    )?;

    let mut observations = Vec::new();
    for row in rows {
        let obs = row?;
        if !obs.signals.is_empty() {
            observations.push(obs);
        }
    }
    Ok(observations)
}

pub(crate) async fn fingerprint_summary_inner(
    db: &DuckDbBackend,
    site_id: i64,
    fingerprint: &str,
) -> Result<Option<FingerprintSummary>> {
    let conn = db.conn.lock().await;
    let (count, first_visit_ms): (i64, Option<i64>) = conn
        .prepare(
            "SELECT COUNT(*), epoch_ms(MIN(first_visit)) FROM sessions \
             WHERE site_id = ?1 AND fingerprint = ?2",
        )?
        .query_row(duckdb::params![site_id, fingerprint], |row| {
            Ok((row.get(0)?, row.get(1)?))
        })?;

    Ok(match (count, first_visit_ms) {
        (n, Some(ms)) if n > 0 => Some(FingerprintSummary {
            fingerprint: fingerprint.to_string(),
            session_count: n,
            first_visit: ts_from_ms(ms),
        }),
        _ => None,
    })
}

/// Apply one merge in a single transaction.
///
/// Re-checks the secondary's session count first; on a mismatch the
/// transaction is dropped (rolled back) without writing anything.
pub(crate) async fn apply_merge_inner(
    db: &DuckDbBackend,
    record: &MergeRecord,
    expected_sessions: i64,
) -> Result<MergeOutcome> {
    let mut conn = db.conn.lock().await;
    let tx = conn.transaction()?;

    let found: i64 = tx
        .prepare("SELECT COUNT(*) FROM sessions WHERE site_id = ?1 AND fingerprint = ?2")?
        .query_row(duckdb::params![record.site_id, record.secondary], |row| {
            row.get(0)
        })?;
    if found != expected_sessions {
        debug!(
            site_id = record.site_id,
            secondary = %record.secondary,
            expected = expected_sessions,
            found,
            "merge precondition failed; rolling back"
        );
        return Ok(MergeOutcome::Conflict {
            expected: expected_sessions,
            found,
        });
    }

    // Rows already tagged at ingestion keep the fingerprint they arrived under.
    let pageviews_tagged = tx.execute(
        "UPDATE pageviews SET merged_from = COALESCE(merged_from, ?2)
         WHERE session_id IN (
             SELECT id FROM sessions WHERE site_id = ?1 AND fingerprint = ?2
         )",
        duckdb::params![record.site_id, record.secondary],
    )?;
    let events_tagged = tx.execute(
        "UPDATE events SET merged_from = COALESCE(merged_from, ?2)
         WHERE session_id IN (
             SELECT id FROM sessions WHERE site_id = ?1 AND fingerprint = ?2
         )",
        duckdb::params![record.site_id, record.secondary],
    )?;
    let sessions_moved = tx.execute(
        "UPDATE sessions SET fingerprint = ?3 WHERE site_id = ?1 AND fingerprint = ?2",
        duckdb::params![record.site_id, record.secondary, record.primary],
    )?;

    // Keep the alias projection flat: everything the secondary owned now points at the primary.
    tx.execute(
        "UPDATE fingerprint_aliases SET canonical = ?3 WHERE site_id = ?1 AND canonical = ?2",
        duckdb::params![record.site_id, record.secondary, record.primary],
    )?;
    tx.execute(
        "INSERT INTO fingerprint_aliases (site_id, fingerprint, canonical) VALUES (?1, ?2, ?3)",
        duckdb::params![record.site_id, record.secondary, record.primary],
    )?;
    tx.execute(
        "INSERT INTO identity_merges (
            id, site_id, primary_fingerprint, secondary_fingerprint, reason, merged_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        duckdb::params![
            record.id,
            record.site_id,
            record.primary,
            record.secondary,
            record.reason,
            fmt_ts(record.merged_at),
        ],
    )?;

    tx.commit()?;
    Ok(MergeOutcome::Applied {
        sessions_moved: sessions_moved as i64,
        pageviews_tagged: pageviews_tagged as i64,
        events_tagged: events_tagged as i64,
    })
}

/// The site's merge log, oldest first.
pub(crate) async fn merge_log_inner(db: &DuckDbBackend, site_id: i64) -> Result<Vec<MergeRecord>> {
    let conn = db.conn.lock().await;
    let mut stmt = conn.prepare(
        "SELECT id, site_id, primary_fingerprint, secondary_fingerprint, reason, epoch_ms(merged_at)
         FROM identity_merges
         WHERE site_id = ?1
         ORDER BY merged_at ASC, id ASC",
    )?;
    let rows = stmt.query_map(duckdb::params![site_id], |row| {
        Ok(MergeRecord {
            id: row.get(0)?,
            site_id: row.get(1)?,
            primary: row.get(2)?,
            secondary: row.get(3)?,
            reason: row.get(4)?,
            merged_at: ts_from_ms(row.get(5)?),
        })
    })?;

    let mut records = Vec::new();
    for row in rows {
        records.push(row?);
    }
    Ok(records)
}
