use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::EngineError;
use crate::event::{CustomEvent, DeviceInfo, PageviewEvent, TrackingPayload, TrackingRow};
use crate::locks::{KeyedLocks, MAX_RESOLVE_ATTEMPTS};
use crate::store::{ActivityRow, EventStore};

/// A time-bounded run of activity from one fingerprint on one site.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub site_id: i64,
    /// Current owner. Rewritten when a merge re-owns the session.
    pub fingerprint: String,
    /// Fingerprint the session was first recorded under.
    pub origin_fingerprint: String,
    pub first_visit: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub entry_page: String,
    pub exit_page: String,
    pub page_count: i64,
    pub is_bounce: bool,
    #[serde(default)]
    pub device: DeviceInfo,
}

impl Session {
    pub fn duration_seconds(&self) -> i64 {
        (self.last_activity - self.first_visit).num_seconds().max(0)
    }
}

/// Result of attaching one tracking row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IngestOutcome {
    pub session_id: String,
    /// Canonical fingerprint the row was attached to.
    pub fingerprint: String,
    pub is_new_session: bool,
}

/// Deterministic session id.
///
/// `session_id = sha256(site_id + fingerprint + entry_page + first_visit_ms)[0:16]`
pub fn compute_session_id(
    site_id: i64,
    fingerprint: &str,
    entry_page: &str,
    first_visit_ms: i64,
) -> String {
    let input = format!("{site_id}{fingerprint}{entry_page}{first_visit_ms}");
    let hash = Sha256::digest(input.as_bytes());
    hex::encode(&hash[..8])
}

/// Groups raw tracking rows into sessions keyed by (site, canonical fingerprint).
pub struct SessionAssembler {
    store: Arc<dyn EventStore>,
    locks: Arc<KeyedLocks>,
    timeout: Duration,
}

impl SessionAssembler {
    pub fn new(store: Arc<dyn EventStore>, locks: Arc<KeyedLocks>, timeout: Duration) -> Self {
        Self {
            store,
            locks,
            timeout,
        }
    }

    /// Attach `row` to its session, creating one when the previous session of
    /// the fingerprint timed out.
    ///
    /// The row's fingerprint is resolved through the merge projection first and
    /// re-resolved once the key lock is held, so a row racing a merge always
    /// lands on the surviving fingerprint.
    pub async fn ingest(&self, row: &TrackingRow) -> Result<IngestOutcome, EngineError> {
        row.validate()?;
        let site_id = row.site_id;

        for _ in 0..MAX_RESOLVE_ATTEMPTS {
            let canonical = self
                .store
                .canonical_fingerprint(site_id, &row.fingerprint)
                .await?;
            let _guard = self.locks.lock(site_id, &canonical).await;
            let current = self
                .store
                .canonical_fingerprint(site_id, &row.fingerprint)
                .await?;
            if current != canonical {
                debug!(
                    site_id,
                    fingerprint = %row.fingerprint,
                    stale = %canonical,
                    current = %current,
                    "fingerprint merged while waiting; re-resolving"
                );
                continue;
            }
            return self.ingest_locked(row, &canonical).await;
        }

        Err(EngineError::Conflict(format!(
            "fingerprint {} kept moving during ingestion",
            row.fingerprint
        )))
    }

    async fn ingest_locked(
        &self,
        row: &TrackingRow,
        canonical: &str,
    ) -> Result<IngestOutcome, EngineError> {
        let site_id = row.site_id;
        let latest = self.store.latest_session(site_id, canonical).await?;

        let (session, is_new) = match latest {
            Some(mut session) if within_session(&session, row.timestamp, self.timeout) => {
                extend_session(&mut session, row);
                (session, false)
            }
            _ => (open_session(row, canonical), true),
        };

        let merged_from = (row.fingerprint != canonical).then(|| row.fingerprint.clone());
        let activity = activity_row(row, &session.id, merged_from);
        self.store.record_activity(&session, is_new, &activity).await?;

        Ok(IngestOutcome {
            session_id: session.id,
            fingerprint: canonical.to_string(),
            is_new_session: is_new,
        })
    }
}

/// Whether a row at `at` belongs to `session`: no later than `timeout` after
/// its last activity and no earlier than `timeout` before its first visit.
fn within_session(session: &Session, at: DateTime<Utc>, timeout: Duration) -> bool {
    at - session.last_activity <= timeout && session.first_visit - at <= timeout
}

fn activity_row(row: &TrackingRow, session_id: &str, merged_from: Option<String>) -> ActivityRow {
    let id = uuid::Uuid::new_v4().to_string();
    match &row.payload {
        TrackingPayload::Pageview { url, referrer } => ActivityRow::Pageview(PageviewEvent {
            id,
            session_id: session_id.to_string(),
            site_id: row.site_id,
            url: url.clone(),
            referrer: referrer.clone(),
            merged_from,
            created_at: row.timestamp,
        }),
        TrackingPayload::Event {
            url,
            name,
            category,
            action,
            label,
            value,
            data,
        } => ActivityRow::Event(CustomEvent {
            id,
            session_id: session_id.to_string(),
            site_id: row.site_id,
            url: url.clone(),
            name: name.clone(),
            category: category.clone(),
            action: action.clone(),
            label: label.clone(),
            value: *value,
            data: data.clone(),
            merged_from,
            created_at: row.timestamp,
        }),
    }
}

fn open_session(row: &TrackingRow, canonical: &str) -> Session {
    let page_count = i64::from(row.is_pageview());
    Session {
        id: compute_session_id(
            row.site_id,
            canonical,
            row.url(),
            row.timestamp.timestamp_millis(),
        ),
        site_id: row.site_id,
        fingerprint: canonical.to_string(),
        origin_fingerprint: row.fingerprint.clone(),
        first_visit: row.timestamp,
        last_activity: row.timestamp,
        entry_page: row.url().to_string(),
        exit_page: row.url().to_string(),
        page_count,
        is_bounce: page_count <= 1,
        device: row.device.clone(),
    }
}

/// Apply one row to an open session. Rows may arrive slightly out of order:
/// an older row within the timeout widens `first_visit` but never moves the
/// exit page backwards.
fn extend_session(session: &mut Session, row: &TrackingRow) {
    if row.is_pageview() {
        session.page_count += 1;
        session.is_bounce = session.page_count <= 1;
        if row.timestamp >= session.last_activity {
            session.exit_page = row.url().to_string();
        }
    }
    if row.timestamp < session.first_visit {
        session.first_visit = row.timestamp;
        if row.is_pageview() {
            session.entry_page = row.url().to_string();
        }
    }
    if row.timestamp > session.last_activity {
        session.last_activity = row.timestamp;
    }
}
