//! Record-store abstraction the engine computes over.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::event::{CustomEvent, IdentitySignals, PageviewEvent};
use crate::identity::MergeRecord;
use crate::session::Session;
use crate::window::CohortWindow;

/// One identify-class event, attributed to the fingerprint that currently owns its session.
#[derive(Debug, Clone, PartialEq)]
pub struct SignalObservation {
    pub fingerprint: String,
    pub signals: IdentitySignals,
    pub observed_at: DateTime<Utc>,
}

/// Per-fingerprint session summary used for merge checks and primary selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FingerprintSummary {
    pub fingerprint: String,
    pub session_count: i64,
    pub first_visit: DateTime<Utc>,
}

/// Distinct pages and event names seen in one cohort session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionActivity {
    pub session_id: String,
    pub pages: Vec<String>,
    pub event_names: Vec<String>,
}

/// What a merge transaction did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    Applied {
        sessions_moved: i64,
        pageviews_tagged: i64,
        events_tagged: i64,
    },
    /// The secondary's session count changed between the check and the
    /// transaction; nothing was written.
    Conflict { expected: i64, found: i64 },
}

/// The stored row produced by one tracking row.
#[derive(Debug, Clone, PartialEq)]
pub enum ActivityRow {
    Pageview(PageviewEvent),
    Event(CustomEvent),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionReport {
    pub events_deleted: i64,
    pub pageviews_deleted: i64,
    pub sessions_deleted: i64,
}

/// Storage backend for sessions, pageviews, custom events and the merge log.
///
/// The engine owns all analytics semantics; implementations only filter and
/// persist rows. `apply_merge` must be atomic: either every effect of the
/// merge is visible or none is.
#[async_trait::async_trait]
pub trait EventStore: Send + Sync + 'static {
    /// Follow the merge projection from `fingerprint` to its current owner.
    /// Returns `fingerprint` itself when it was never merged away.
    async fn canonical_fingerprint(&self, site_id: i64, fingerprint: &str) -> Result<String>;

    /// The session of `fingerprint` with the latest `last_activity`, if any.
    async fn latest_session(&self, site_id: i64, fingerprint: &str) -> Result<Option<Session>>;

    /// Write `session` and the row it absorbed in one transaction.
    ///
    /// `is_new` inserts the session; otherwise its mutable columns are
    /// updated. On any failure neither the session nor the row changes.
    async fn record_activity(&self, session: &Session, is_new: bool, row: &ActivityRow)
        -> Result<()>;

    /// All sessions currently owned by `fingerprint`, oldest first.
    async fn sessions_for_fingerprint(&self, site_id: i64, fingerprint: &str)
        -> Result<Vec<Session>>;

    async fn pageviews_for_sessions(
        &self,
        site_id: i64,
        session_ids: &[String],
    ) -> Result<Vec<PageviewEvent>>;

    async fn events_for_sessions(
        &self,
        site_id: i64,
        session_ids: &[String],
    ) -> Result<Vec<CustomEvent>>;

    /// Identify-class events with a non-empty payload inside `window`.
    async fn identify_signals(
        &self,
        site_id: i64,
        window: &CohortWindow,
    ) -> Result<Vec<SignalObservation>>;

    /// `None` when `fingerprint` owns no sessions on the site.
    async fn fingerprint_summary(
        &self,
        site_id: i64,
        fingerprint: &str,
    ) -> Result<Option<FingerprintSummary>>;

    /// Move every session of `record.secondary` to `record.primary`, tag the
    /// moved pageviews and events, update the owner projection and append
    /// `record` to the merge log, all in one transaction.
    ///
    /// `expected_sessions` is the secondary's session count observed before
    /// the call; a different count inside the transaction yields
    /// [`MergeOutcome::Conflict`] and no writes.
    async fn apply_merge(&self, record: &MergeRecord, expected_sessions: i64)
        -> Result<MergeOutcome>;

    /// The append-only merge log of a site, oldest first.
    async fn merge_log(&self, site_id: i64) -> Result<Vec<MergeRecord>>;

    /// One page of the cohort: sessions with `first_visit` inside `window`,
    /// ordered by session id, strictly after `after`.
    async fn cohort_page(
        &self,
        site_id: i64,
        window: &CohortWindow,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<SessionActivity>>;

    /// Sessions with `last_activity >= since`, most recent first.
    async fn active_sessions(&self, site_id: i64, since: DateTime<Utc>) -> Result<Vec<Session>>;

    /// Site ids that own at least one session.
    async fn sites(&self) -> Result<Vec<i64>>;

    /// Delete sessions whose `last_activity` is before `cutoff`, with their rows.
    async fn delete_before(&self, cutoff: DateTime<Utc>) -> Result<RetentionReport>;
}
