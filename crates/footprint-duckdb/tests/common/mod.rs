#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use footprint_core::engine::Engine;
use footprint_core::event::{CustomEvent, PageviewEvent, TrackingRow};
use footprint_core::identity::MergeRecord;
use footprint_core::locks::KeyedLocks;
use footprint_core::session::Session;
use footprint_core::store::{
    ActivityRow, EventStore, FingerprintSummary, MergeOutcome, RetentionReport, SessionActivity,
    SignalObservation,
};
use footprint_core::window::CohortWindow;
use footprint_duckdb::DuckDbBackend;

/// A merge applied behind the resolver's back on the second lookup of `trigger`.
struct RacingMerge {
    trigger: String,
    lookups: usize,
    record: MergeRecord,
}

/// Delegates to DuckDB, with switchable failures and hooks for racing merges.
pub struct TestStore {
    inner: Arc<DuckDbBackend>,
    fail_merges_of: Option<String>,
    fail_cohort: bool,
    locks: Option<Arc<KeyedLocks>>,
    racing: Mutex<Option<RacingMerge>>,
    side_write: Mutex<Option<(Engine, TrackingRow)>>,
    unheld: Mutex<Vec<String>>,
}

impl TestStore {
    pub fn new(inner: Arc<DuckDbBackend>) -> Self {
        Self {
            inner,
            fail_merges_of: None,
            fail_cohort: false,
            locks: None,
            racing: Mutex::new(None),
            side_write: Mutex::new(None),
            unheld: Mutex::new(Vec::new()),
        }
    }

    /// Fail every merge whose secondary is `fingerprint`.
    pub fn failing_merges_of(mut self, fingerprint: &str) -> Self {
        self.fail_merges_of = Some(fingerprint.to_string());
        self
    }

    pub fn failing_cohort(mut self) -> Self {
        self.fail_cohort = true;
        self
    }

    /// Record every merge applied while one of its keys in `locks` is free.
    pub fn checking_locks(mut self, locks: Arc<KeyedLocks>) -> Self {
        self.locks = Some(locks);
        self
    }

    /// Apply `record` straight to DuckDB the second time `trigger` is resolved.
    pub fn racing_merge(self, trigger: &str, record: MergeRecord) -> Self {
        *self.racing.lock().expect("racing") = Some(RacingMerge {
            trigger: trigger.to_string(),
            lookups: 0,
            record,
        });
        self
    }

    /// Ingest `row` through `writer` right before the next merge is applied.
    pub fn writing_before_merge(self, writer: Engine, row: TrackingRow) -> Self {
        *self.side_write.lock().expect("side write") = Some((writer, row));
        self
    }

    /// Keys that were not held when a merge touching them was applied.
    pub fn unheld_keys(&self) -> Vec<String> {
        self.unheld.lock().expect("unheld").clone()
    }

    fn take_due_race(&self, fingerprint: &str) -> Option<MergeRecord> {
        let mut slot = self.racing.lock().expect("racing");
        let due = match slot.as_mut() {
            Some(race) if race.trigger == fingerprint => {
                race.lookups += 1;
                race.lookups == 2
            }
            _ => false,
        };
        if due {
            slot.take().map(|race| race.record)
        } else {
            None
        }
    }
}

#[async_trait]
impl EventStore for TestStore {
    async fn canonical_fingerprint(&self, site_id: i64, fp: &str) -> anyhow::Result<String> {
        if let Some(record) = self.take_due_race(fp) {
            let expected = self
                .inner
                .fingerprint_summary(record.site_id, &record.secondary)
                .await?
                .map_or(0, |s| s.session_count);
            self.inner.apply_merge(&record, expected).await?;
        }
        self.inner.canonical_fingerprint(site_id, fp).await
    }
    async fn latest_session(&self, site_id: i64, fp: &str) -> anyhow::Result<Option<Session>> {
        self.inner.latest_session(site_id, fp).await
    }
    async fn record_activity(
        &self,
        session: &Session,
        is_new: bool,
        row: &ActivityRow,
    ) -> anyhow::Result<()> {
        self.inner.record_activity(session, is_new, row).await
    }
    async fn sessions_for_fingerprint(
        &self,
        site_id: i64,
        fp: &str,
    ) -> anyhow::Result<Vec<Session>> {
        self.inner.sessions_for_fingerprint(site_id, fp).await
    }
    async fn pageviews_for_sessions(
        &self,
        site_id: i64,
        ids: &[String],
    ) -> anyhow::Result<Vec<PageviewEvent>> {
        self.inner.pageviews_for_sessions(site_id, ids).await
    }
    async fn events_for_sessions(
        &self,
        site_id: i64,
        ids: &[String],
    ) -> anyhow::Result<Vec<CustomEvent>> {
        self.inner.events_for_sessions(site_id, ids).await
    }
    async fn identify_signals(
        &self,
        site_id: i64,
        window: &CohortWindow,
    ) -> anyhow::Result<Vec<SignalObservation>> {
        self.inner.identify_signals(site_id, window).await
    }
    async fn fingerprint_summary(
        &self,
        site_id: i64,
        fp: &str,
    ) -> anyhow::Result<Option<FingerprintSummary>> {
        self.inner.fingerprint_summary(site_id, fp).await
    }
    async fn apply_merge(
        &self,
        record: &MergeRecord,
        expected: i64,
    ) -> anyhow::Result<MergeOutcome> {
        if self.fail_merges_of.as_deref() == Some(record.secondary.as_str()) {
            anyhow::bail!("disk full");
        }
        let side_write = self.side_write.lock().expect("side write").take();
        if let Some((writer, row)) = side_write {
            writer.sessions.ingest(&row).await?;
        }
        if let Some(locks) = &self.locks {
            for key in [&record.primary, &record.secondary] {
                let free = tokio::time::timeout(
                    Duration::from_millis(20),
                    locks.lock(record.site_id, key),
                )
                .await
                .is_ok();
                if free {
                    self.unheld.lock().expect("unheld").push(key.clone());
                }
            }
        }
        self.inner.apply_merge(record, expected).await
    }
    async fn merge_log(&self, site_id: i64) -> anyhow::Result<Vec<MergeRecord>> {
        self.inner.merge_log(site_id).await
    }
    async fn cohort_page(
        &self,
        site_id: i64,
        window: &CohortWindow,
        after: Option<&str>,
        limit: usize,
    ) -> anyhow::Result<Vec<SessionActivity>> {
        if self.fail_cohort {
            anyhow::bail!("Binder Error: Referenced column \"sesion_id\" not found");
        }
        self.inner.cohort_page(site_id, window, after, limit).await
    }
    async fn active_sessions(
        &self,
        site_id: i64,
        since: DateTime<Utc>,
    ) -> anyhow::Result<Vec<Session>> {
        self.inner.active_sessions(site_id, since).await
    }
    async fn sites(&self) -> anyhow::Result<Vec<i64>> {
        self.inner.sites().await
    }
    async fn delete_before(&self, cutoff: DateTime<Utc>) -> anyhow::Result<RetentionReport> {
        self.inner.delete_before(cutoff).await
    }
}
