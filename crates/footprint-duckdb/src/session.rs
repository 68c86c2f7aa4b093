use anyhow::Result;
use chrono::{DateTime, Utc};
use duckdb::Connection;

use footprint_core::event::DeviceInfo;
use footprint_core::session::Session;
use footprint_core::store::ActivityRow;

use crate::backend::{fmt_ts, ts_from_ms};
use crate::queries::events;
use crate::DuckDbBackend;

/// Column list matching [`session_from_row`].
pub(crate) const SESSION_COLUMNS: &str = "id, site_id, fingerprint, origin_fingerprint, \
     epoch_ms(first_visit), epoch_ms(last_activity), entry_page, exit_page, \
     page_count, is_bounce, device_type, browser, os, country";

pub(crate) fn session_from_row(row: &duckdb::Row<'_>) -> duckdb::Result<Session> {
    Ok(Session {
        id: row.get(0)?,
        site_id: row.get(1)?,
        fingerprint: row.get(2)?,
        origin_fingerprint: row.get(3)?,
        first_visit: ts_from_ms(row.get(4)?),
        last_activity: ts_from_ms(row.get(5)?),
        entry_page: row.get(6)?,
        exit_page: row.get(7)?,
        page_count: row.get(8)?,
        is_bounce: row.get(9)?,
        device: DeviceInfo {
            device_type: row.get(10)?,
            browser: row.get(11)?,
            os: row.get(12)?,
            country: row.get(13)?,
        },
    })
}

/// Current owner of `fingerprint`; a fingerprint never merged away owns itself.
pub(crate) async fn canonical_fingerprint_inner(
    db: &DuckDbBackend,
    site_id: i64,
    fingerprint: &str,
) -> Result<String> {
    let conn = db.conn.lock().await;
    let mut stmt = conn.prepare(
        "SELECT canonical FROM fingerprint_aliases WHERE site_id = ?1 AND fingerprint = ?2",
    )?;
    let mut rows = stmt.query_map(duckdb::params![site_id, fingerprint], |row| {
        row.get::<_, String>(0)
    })?;
    Ok(rows
        .next()
        .transpose()?
        .unwrap_or_else(|| fingerprint.to_string()))
}

pub(crate) async fn latest_session_inner(
    db: &DuckDbBackend,
    site_id: i64,
    fingerprint: &str,
) -> Result<Option<Session>> {
    let conn = db.conn.lock().await;
    let sql = format!(
        "SELECT {SESSION_COLUMNS} FROM sessions \
         WHERE site_id = ?1 AND fingerprint = ?2 \
         ORDER BY last_activity DESC, id DESC LIMIT 1"
    );
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query_map(duckdb::params![site_id, fingerprint], session_from_row)?;
    Ok(rows.next().transpose()?)
}

fn insert_session(conn: &Connection, session: &Session) -> Result<()> {
    conn.execute(
        "INSERT INTO sessions (
            id, site_id, fingerprint, origin_fingerprint, first_visit, last_activity,
            entry_page, exit_page, page_count, is_bounce,
            device_type, browser, os, country
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
        duckdb::params![
            session.id,
            session.site_id,
            session.fingerprint,
            session.origin_fingerprint,
            fmt_ts(session.first_visit),
            fmt_ts(session.last_activity),
            session.entry_page,
            session.exit_page,
            session.page_count,
            session.is_bounce,
            session.device.device_type,
            session.device.browser,
            session.device.os,
            session.device.country,
        ],
    )?;
    Ok(())
}

/// Persist the mutable fields of a session. Ownership is left alone; only a
/// merge moves a session between fingerprints.
fn update_session(conn: &Connection, session: &Session) -> Result<()> {
    let updated = conn.execute(
        "UPDATE sessions
         SET first_visit = ?1, last_activity = ?2, entry_page = ?3, exit_page = ?4,
             page_count = ?5, is_bounce = ?6
         WHERE id = ?7 AND site_id = ?8",
        duckdb::params![
            fmt_ts(session.first_visit),
            fmt_ts(session.last_activity),
            session.entry_page,
            session.exit_page,
            session.page_count,
            session.is_bounce,
            session.id,
            session.site_id,
        ],
    )?;
    if updated == 0 {
        anyhow::bail!("session {} does not exist", session.id);
    }
    Ok(())
}

/// Write a session and the row it absorbed in one transaction. Dropping the
/// transaction on an early return rolls both back.
pub(crate) async fn record_activity_inner(
    db: &DuckDbBackend,
    session: &Session,
    is_new: bool,
    row: &ActivityRow,
) -> Result<()> {
    let mut conn = db.conn.lock().await;
    let tx = conn.transaction()?;

    if is_new {
        insert_session(&tx, session)?;
    } else {
        update_session(&tx, session)?;
    }
    match row {
        ActivityRow::Pageview(pv) => events::insert_pageview(&tx, pv)?,
        ActivityRow::Event(ev) => events::insert_custom_event(&tx, ev)?,
    }

    tx.commit()?;
    Ok(())
}

pub(crate) async fn sessions_for_fingerprint_inner(
    db: &DuckDbBackend,
    site_id: i64,
    fingerprint: &str,
) -> Result<Vec<Session>> {
    let conn = db.conn.lock().await;
    let sql = format!(
        "SELECT {SESSION_COLUMNS} FROM sessions \
         WHERE site_id = ?1 AND fingerprint = ?2 \
         ORDER BY first_visit ASC, id ASC"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(duckdb::params![site_id, fingerprint], session_from_row)?;

    let mut sessions = Vec::new();
    for row in rows {
        sessions.push(row?);
    }
    Ok(sessions)
}

/// Sessions with activity at or after `since`, most recent first.
pub(crate) async fn active_sessions_inner(
    db: &DuckDbBackend,
    site_id: i64,
    since: DateTime<Utc>,
) -> Result<Vec<Session>> {
    let conn = db.conn.lock().await;
    let sql = format!(
        "SELECT {SESSION_COLUMNS} FROM sessions \
         WHERE site_id = ?1 AND last_activity >= ?2 \
         ORDER BY last_activity DESC, id ASC"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(duckdb::params![site_id, fmt_ts(since)], session_from_row)?;

    let mut sessions = Vec::new();
    for row in rows {
        sessions.push(row?);
    }
    Ok(sessions)
}

pub(crate) async fn sites_inner(db: &DuckDbBackend) -> Result<Vec<i64>> {
    let conn = db.conn.lock().await;
    let mut stmt = conn.prepare("SELECT DISTINCT site_id FROM sessions ORDER BY site_id")?;
    let rows = stmt.query_map([], |row| row.get::<_, i64>(0))?;

    let mut sites = Vec::new();
    for row in rows {
        sites.push(row?);
    }
    Ok(sites)
}
