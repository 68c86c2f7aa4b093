use async_trait::async_trait;
use chrono::{DateTime, Utc};

use footprint_core::event::{CustomEvent, PageviewEvent};
use footprint_core::identity::MergeRecord;
use footprint_core::session::Session;
use footprint_core::store::{
    ActivityRow, EventStore, FingerprintSummary, MergeOutcome, RetentionReport, SessionActivity,
    SignalObservation,
};
use footprint_core::window::CohortWindow;

use crate::queries::{events, funnels, identity, retention};
use crate::session;
use crate::DuckDbBackend;

#[async_trait]
impl EventStore for DuckDbBackend {
    async fn canonical_fingerprint(
        &self,
        site_id: i64,
        fingerprint: &str,
    ) -> anyhow::Result<String> {
        session::canonical_fingerprint_inner(self, site_id, fingerprint).await
    }

    async fn latest_session(
        &self,
        site_id: i64,
        fingerprint: &str,
    ) -> anyhow::Result<Option<Session>> {
        session::latest_session_inner(self, site_id, fingerprint).await
    }

    async fn record_activity(
        &self,
        session: &Session,
        is_new: bool,
        row: &ActivityRow,
    ) -> anyhow::Result<()> {
        session::record_activity_inner(self, session, is_new, row).await
    }

    async fn sessions_for_fingerprint(
        &self,
        site_id: i64,
        fingerprint: &str,
    ) -> anyhow::Result<Vec<Session>> {
        session::sessions_for_fingerprint_inner(self, site_id, fingerprint).await
    }

    async fn pageviews_for_sessions(
        &self,
        site_id: i64,
        session_ids: &[String],
    ) -> anyhow::Result<Vec<PageviewEvent>> {
        events::pageviews_for_sessions_inner(self, site_id, session_ids).await
    }

    async fn events_for_sessions(
        &self,
        site_id: i64,
        session_ids: &[String],
    ) -> anyhow::Result<Vec<CustomEvent>> {
        events::events_for_sessions_inner(self, site_id, session_ids).await
    }

    async fn identify_signals(
        &self,
        site_id: i64,
        window: &CohortWindow,
    ) -> anyhow::Result<Vec<SignalObservation>> {
        identity::identify_signals_inner(self, site_id, window).await
    }

    async fn fingerprint_summary(
        &self,
        site_id: i64,
        fingerprint: &str,
    ) -> anyhow::Result<Option<FingerprintSummary>> {
        identity::fingerprint_summary_inner(self, site_id, fingerprint).await
    }

    async fn apply_merge(
        &self,
        record: &MergeRecord,
        expected_sessions: i64,
    ) -> anyhow::Result<MergeOutcome> {
        identity::apply_merge_inner(self, record, expected_sessions).await
    }

    async fn merge_log(&self, site_id: i64) -> anyhow::Result<Vec<MergeRecord>> {
        identity::merge_log_inner(self, site_id).await
    }

    async fn cohort_page(
        &self,
        site_id: i64,
        window: &CohortWindow,
        after: Option<&str>,
        limit: usize,
    ) -> anyhow::Result<Vec<SessionActivity>> {
        funnels::cohort_page_inner(self, site_id, window, after, limit).await
    }

    async fn active_sessions(
        &self,
        site_id: i64,
        since: DateTime<Utc>,
    ) -> anyhow::Result<Vec<Session>> {
        session::active_sessions_inner(self, site_id, since).await
    }

    async fn sites(&self) -> anyhow::Result<Vec<i64>> {
        session::sites_inner(self).await
    }

    async fn delete_before(&self, cutoff: DateTime<Utc>) -> anyhow::Result<RetentionReport> {
        retention::delete_before_inner(self, cutoff).await
    }
}
