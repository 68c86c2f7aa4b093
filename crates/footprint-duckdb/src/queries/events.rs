use anyhow::Result;
use duckdb::Connection;

use footprint_core::event::{CustomEvent, IdentitySignals, PageviewEvent};

use crate::backend::{fmt_ts, ts_from_ms};
use crate::queries::placeholders;
use crate::DuckDbBackend;

pub(crate) fn insert_pageview(conn: &Connection, pv: &PageviewEvent) -> Result<()> {
    conn.execute(
        "INSERT INTO pageviews (id, session_id, site_id, url, referrer, merged_from, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        duckdb::params![
            pv.id,
            pv.session_id,
            pv.site_id,
            pv.url,
            pv.referrer,
            pv.merged_from,
            fmt_ts(pv.created_at),
        ],
    )?;
    Ok(())
}

pub(crate) fn insert_custom_event(conn: &Connection, ev: &CustomEvent) -> Result<()> {
    conn.execute(
        "INSERT INTO events (
            id, session_id, site_id, url, name, category, action, label, value,
            data, merged_from, created_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        duckdb::params![
            ev.id,
            ev.session_id,
            ev.site_id,
            ev.url,
            ev.name,
            ev.category,
            ev.action,
            ev.label,
            ev.value,
            ev.data.to_json(),
            ev.merged_from,
            fmt_ts(ev.created_at),
        ],
    )?;
    Ok(())
}

fn session_params(site_id: i64, session_ids: &[String]) -> Vec<Box<dyn duckdb::types::ToSql>> {
    let mut params: Vec<Box<dyn duckdb::types::ToSql>> = Vec::with_capacity(session_ids.len() + 1);
    params.push(Box::new(site_id));
    for id in session_ids {
        params.push(Box::new(id.clone()));
    }
    params
}

/// Pageviews of the given sessions, oldest first.
pub(crate) async fn pageviews_for_sessions_inner(
    db: &DuckDbBackend,
    site_id: i64,
    session_ids: &[String],
) -> Result<Vec<PageviewEvent>> {
    if session_ids.is_empty() {
        return Ok(Vec::new());
    }
    let conn = db.conn.lock().await;
    let sql = format!(
        "SELECT id, session_id, site_id, url, referrer, merged_from, epoch_ms(created_at) \
         FROM pageviews \
         WHERE site_id = ?1 AND session_id IN ({}) \
         ORDER BY created_at ASC, id ASC",
        placeholders(2, session_ids.len())
    );
    let params = session_params(site_id, session_ids);
    let param_refs: Vec<&dyn duckdb::types::ToSql> = params.iter().map(|p| p.as_ref()).collect();
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(param_refs.as_slice(), |row| {
        Ok(PageviewEvent {
            id: row.get(0)?,
            session_id: row.get(1)?,
            site_id: row.get(2)?,
            url: row.get(3)?,
            referrer: row.get(4)?,
            merged_from: row.get(5)?,
            created_at: ts_from_ms(row.get(6)?),
        })
    })?;

    let mut pageviews = Vec::new();
    for row in rows {
        pageviews.push(row?);
    }
    Ok(pageviews)
}

/// Custom events of the given sessions, oldest first.
pub(crate) async fn events_for_sessions_inner(
    db: &DuckDbBackend,
    site_id: i64,
    session_ids: &[String],
) -> Result<Vec<CustomEvent>> {
    if session_ids.is_empty() {
        return Ok(Vec::new());
    }
    let conn = db.conn.lock().await;
    let sql = format!(
        "SELECT id, session_id, site_id, url, name, category, action, label, value, \
                data, merged_from, epoch_ms(created_at) \
         FROM events \
         WHERE site_id = ?1 AND session_id IN ({}) \
         ORDER BY created_at ASC, id ASC",
        placeholders(2, session_ids.len())
    );
    let params = session_params(site_id, session_ids);
    let param_refs: Vec<&dyn duckdb::types::ToSql> = params.iter().map(|p| p.as_ref()).collect();
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(param_refs.as_slice(), |row| {
        let data: Option<String> = row.get(9)?;
        Ok(CustomEvent {
            id: row.get(0)?,
            session_id: row.get(1)?,
            site_id: row.get(2)?,
            url: row.get(3)?,
            name: row.get(4)?,
            category: row.get(5)?,
            action: row.get(6)?,
            label: row.get(7)?,
            value: row.get(8)?,
            data: IdentitySignals::from_json(data.as_deref()),
            merged_from: row.get(10)?,
            created_at: ts_from_ms(row.get(11)?),
        })
    })?;

    let mut events = Vec::new();
    for row in rows {
        events.push(row?);
    }
    Ok(events)
}
