//! Per-person journeys and the live-visitor window.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{EngineError, Operation};
use crate::event::{CustomEvent, DeviceInfo, PageviewEvent};
use crate::session::Session;
use crate::store::EventStore;

/// One entry of a journey timeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TimelineEntry {
    SessionStart {
        session_id: String,
        at: DateTime<Utc>,
        entry_page: String,
    },
    Pageview {
        session_id: String,
        at: DateTime<Utc>,
        url: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        merged_from: Option<String>,
    },
    Event {
        session_id: String,
        at: DateTime<Utc>,
        name: String,
        category: Option<String>,
        action: Option<String>,
        label: Option<String>,
        value: Option<f64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        merged_from: Option<String>,
    },
    SessionEnd {
        session_id: String,
        at: DateTime<Utc>,
        exit_page: String,
    },
}

impl TimelineEntry {
    pub fn at(&self) -> DateTime<Utc> {
        match self {
            TimelineEntry::SessionStart { at, .. }
            | TimelineEntry::Pageview { at, .. }
            | TimelineEntry::Event { at, .. }
            | TimelineEntry::SessionEnd { at, .. } => *at,
        }
    }

    pub fn session_id(&self) -> &str {
        match self {
            TimelineEntry::SessionStart { session_id, .. }
            | TimelineEntry::Pageview { session_id, .. }
            | TimelineEntry::Event { session_id, .. }
            | TimelineEntry::SessionEnd { session_id, .. } => session_id,
        }
    }

    /// Tie-break order for entries sharing a timestamp.
    fn rank(&self) -> u8 {
        match self {
            TimelineEntry::SessionStart { .. } => 0,
            TimelineEntry::Pageview { .. } => 1,
            TimelineEntry::Event { .. } => 2,
            TimelineEntry::SessionEnd { .. } => 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JourneyAggregates {
    pub session_count: usize,
    pub total_duration_seconds: i64,
    /// Fraction (0..=1) of sessions with exactly one pageview.
    pub bounce_rate: f64,
    pub devices: BTreeMap<String, u64>,
    pub browsers: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Journey {
    pub person_id: String,
    pub site_id: i64,
    pub sessions: Vec<Session>,
    pub timeline: Vec<TimelineEntry>,
    pub aggregates: JourneyAggregates,
}

/// A session active inside the live window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveJourney {
    pub session_id: String,
    pub person_id: String,
    pub current_page: String,
    pub page_count: i64,
    pub session_start: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub device: DeviceInfo,
}

const UNKNOWN: &str = "unknown";

fn aggregate(sessions: &[Session]) -> JourneyAggregates {
    let mut devices = BTreeMap::new();
    let mut browsers = BTreeMap::new();
    for session in sessions {
        let device = session.device.device_type.as_deref().unwrap_or(UNKNOWN);
        let browser = session.device.browser.as_deref().unwrap_or(UNKNOWN);
        *devices.entry(device.to_string()).or_insert(0) += 1;
        *browsers.entry(browser.to_string()).or_insert(0) += 1;
    }
    let bounces = sessions.iter().filter(|s| s.page_count == 1).count();
    JourneyAggregates {
        session_count: sessions.len(),
        total_duration_seconds: sessions.iter().map(Session::duration_seconds).sum(),
        bounce_rate: if sessions.is_empty() {
            0.0
        } else {
            bounces as f64 / sessions.len() as f64
        },
        devices,
        browsers,
    }
}

/// Merge sessions, pageviews and events into one ascending timeline.
///
/// A `session_end` is synthesized at `last_activity` when the gap after the
/// session (to the next session's start, or to `now` for the newest one)
/// exceeds `timeout`. Rows whose session is not in `sessions` are dropped.
pub fn assemble_journey(
    person_id: &str,
    site_id: i64,
    mut sessions: Vec<Session>,
    pageviews: Vec<PageviewEvent>,
    events: Vec<CustomEvent>,
    now: DateTime<Utc>,
    timeout: Duration,
) -> Journey {
    sessions.sort_by(|a, b| a.first_visit.cmp(&b.first_visit).then(a.id.cmp(&b.id)));
    let known: std::collections::HashSet<&str> = sessions.iter().map(|s| s.id.as_str()).collect();

    let mut timeline = Vec::with_capacity(sessions.len() * 2 + pageviews.len() + events.len());
    for (idx, session) in sessions.iter().enumerate() {
        timeline.push(TimelineEntry::SessionStart {
            session_id: session.id.clone(),
            at: session.first_visit,
            entry_page: session.entry_page.clone(),
        });
        let gap_end = sessions
            .get(idx + 1)
            .map(|next| next.first_visit)
            .unwrap_or(now);
        if gap_end - session.last_activity > timeout {
            timeline.push(TimelineEntry::SessionEnd {
                session_id: session.id.clone(),
                at: session.last_activity,
                exit_page: session.exit_page.clone(),
            });
        }
    }
    for pv in pageviews {
        if known.contains(pv.session_id.as_str()) {
            timeline.push(TimelineEntry::Pageview {
                session_id: pv.session_id,
                at: pv.created_at,
                url: pv.url,
                merged_from: pv.merged_from,
            });
        }
    }
    for ev in events {
        if known.contains(ev.session_id.as_str()) {
            timeline.push(TimelineEntry::Event {
                session_id: ev.session_id,
                at: ev.created_at,
                name: ev.name,
                category: ev.category,
                action: ev.action,
                label: ev.label,
                value: ev.value,
                merged_from: ev.merged_from,
            });
        }
    }
    // Stable sort keeps insertion order for rows that tie on both keys.
    timeline.sort_by(|a, b| a.at().cmp(&b.at()).then(a.rank().cmp(&b.rank())));

    let aggregates = aggregate(&sessions);
    Journey {
        person_id: person_id.to_string(),
        site_id,
        sessions,
        timeline,
        aggregates,
    }
}

/// Sessions whose last activity falls inside the trailing `window` before `now`.
pub fn live_journeys(
    sessions: &[Session],
    now: DateTime<Utc>,
    window: Duration,
) -> Vec<LiveJourney> {
    let cutoff = now - window;
    let mut live: Vec<LiveJourney> = sessions
        .iter()
        .filter(|s| s.last_activity >= cutoff)
        .map(|s| LiveJourney {
            session_id: s.id.clone(),
            person_id: s.fingerprint.clone(),
            current_page: s.exit_page.clone(),
            page_count: s.page_count,
            session_start: s.first_visit,
            last_activity: s.last_activity,
            device: s.device.clone(),
        })
        .collect();
    live.sort_by(|a, b| b.last_activity.cmp(&a.last_activity));
    live
}

pub struct JourneyBuilder {
    store: Arc<dyn EventStore>,
    session_timeout: Duration,
    live_window: Duration,
}

impl JourneyBuilder {
    pub fn new(
        store: Arc<dyn EventStore>,
        session_timeout: Duration,
        live_window: Duration,
    ) -> Self {
        Self {
            store,
            session_timeout,
            live_window,
        }
    }

    /// Build the journey of `person_id` on `site_id`.
    ///
    /// A person with no sessions on the site is `NotFound`, never an empty journey.
    pub async fn build_journey(
        &self,
        person_id: &str,
        site_id: i64,
    ) -> Result<Journey, EngineError> {
        self.build_journey_at(person_id, site_id, Utc::now()).await
    }

    pub async fn build_journey_at(
        &self,
        person_id: &str,
        site_id: i64,
        now: DateTime<Utc>,
    ) -> Result<Journey, EngineError> {
        if person_id.trim().is_empty() {
            return Err(EngineError::Validation("person id is required".into()));
        }
        let sessions = self.store.sessions_for_fingerprint(site_id, person_id).await?;
        if sessions.is_empty() {
            return Err(EngineError::NotFound(format!(
                "person {person_id} has no sessions on site {site_id}"
            )));
        }
        let ids: Vec<String> = sessions.iter().map(|s| s.id.clone()).collect();
        let pageviews = self.store.pageviews_for_sessions(site_id, &ids).await?;
        let events = self.store.events_for_sessions(site_id, &ids).await?;
        Ok(assemble_journey(
            person_id,
            site_id,
            sessions,
            pageviews,
            events,
            now,
            self.session_timeout,
        ))
    }

    /// Journey or `None`; storage failures are logged instead of propagated.
    pub async fn journey_or_none(&self, person_id: &str, site_id: i64) -> Option<Journey> {
        match self.build_journey(person_id, site_id).await {
            Ok(journey) => Some(journey),
            Err(EngineError::NotFound(_)) => None,
            Err(e) => {
                warn!(
                    site_id,
                    person_id,
                    error = %e,
                    message = %e.public_message(Operation::Journey),
                    "journey build failed"
                );
                None
            }
        }
    }

    /// Sessions active in the trailing live window, read fresh on every call.
    pub async fn build_live_journeys(&self, site_id: i64) -> Result<Vec<LiveJourney>, EngineError> {
        self.build_live_journeys_at(site_id, Utc::now()).await
    }

    pub async fn build_live_journeys_at(
        &self,
        site_id: i64,
        now: DateTime<Utc>,
    ) -> Result<Vec<LiveJourney>, EngineError> {
        let sessions = self
            .store
            .active_sessions(site_id, now - self.live_window)
            .await?;
        Ok(live_journeys(&sessions, now, self.live_window))
    }
}
