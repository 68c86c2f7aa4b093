use std::collections::{BTreeMap, BTreeSet};

use anyhow::Result;

use footprint_core::store::SessionActivity;
use footprint_core::window::CohortWindow;

use crate::backend::fmt_ts;
use crate::DuckDbBackend;

// Row kinds emitted by the cohort query; 0 marks the bare session row.
const KIND_PAGE: i32 = 1;
const KIND_EVENT: i32 = 2;

/// One keyset page of the cohort: sessions that started in `window`, ordered
/// by id, strictly after `after`, with their distinct pages and event names.
///
/// The page of session ids is fixed in a CTE, so a session and all of its
/// activity always come back together.
pub(crate) async fn cohort_page_inner(
    db: &DuckDbBackend,
    site_id: i64,
    window: &CohortWindow,
    after: Option<&str>,
    limit: usize,
) -> Result<Vec<SessionActivity>> {
    let conn = db.conn.lock().await;
    let mut stmt = conn.prepare(
        "WITH cohort AS (
             SELECT id FROM sessions
             WHERE site_id = ?1
               AND first_visit >= ?2 AND first_visit < ?3
               AND id > ?4
             ORDER BY id
             LIMIT ?5
         )
         SELECT c.id, 0 AS kind, NULL AS value FROM cohort c
         UNION ALL
         SELECT DISTINCT p.session_id, 1, p.url
         FROM pageviews p JOIN cohort c ON c.id = p.session_id
         UNION ALL
         SELECT DISTINCT e.session_id, 2, e.name
         FROM events e JOIN cohort c ON c.id = e.session_id",
    )?;
    let rows = stmt.query_map(
        duckdb::params![
            site_id,
            fmt_ts(window.start),
            fmt_ts(window.end),
            after.unwrap_or(""),
            limit as i64,
        ],
        |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i32>(1)?,
                row.get::<_, Option<String>>(2)?,
            ))
        },
    )?;

    let mut by_session: BTreeMap<String, (BTreeSet<String>, BTreeSet<String>)> = BTreeMap::new();
    for row in rows {
        let (session_id, kind, value) = row?;
        let entry = by_session.entry(session_id).or_default();
        match (kind, value) {
            (KIND_PAGE, Some(url)) => {
                entry.0.insert(url);
            }
            (KIND_EVENT, Some(name)) => {
                entry.1.insert(name);
            }
            _ => {}
        }
    }

    Ok(by_session
        .into_iter()
        .map(|(session_id, (pages, events))| SessionActivity {
            session_id,
            pages: pages.into_iter().collect(),
            event_names: events.into_iter().collect(),
        })
        .collect())
}
