use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info, warn};

use footprint_core::config::EngineConfig;
use footprint_core::engine::Engine;
use footprint_core::error::EngineError;
use footprint_core::identity::SweepReport;
use footprint_core::store::RetentionReport;
use footprint_core::window::CohortWindow;
use footprint_duckdb::DuckDbBackend;

/// Result of one sweep over one site.
#[derive(Debug, Serialize)]
pub struct SiteSweep {
    pub site_id: i64,
    #[serde(flatten)]
    pub report: SweepReport,
}

/// Shared state of the worker process: the store and the engine built over it.
pub struct WorkerState {
    pub db: Arc<DuckDbBackend>,
    pub engine: Engine,
}

impl WorkerState {
    pub fn new(db: DuckDbBackend, config: EngineConfig) -> Self {
        let db = Arc::new(db);
        let engine = Engine::new(db.clone(), config);
        Self { db, engine }
    }

    /// Run the auto-merge sweep once for every configured site.
    ///
    /// A site whose sweep fails is logged and skipped; the remaining sites
    /// still run.
    pub async fn sweep_merges_once(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<SiteSweep>, EngineError> {
        let window = CohortWindow::trailing_days(now, self.engine.config.merge_sweep_window_days);
        let mut sweeps = Vec::new();
        for site_id in self.engine.sweep_sites().await? {
            match self.engine.identity.auto_merge_sweep(site_id, &window).await {
                Ok(report) => sweeps.push(SiteSweep { site_id, report }),
                Err(e) => warn!(site_id, error = %e, "merge sweep failed for site; skipping"),
            }
        }
        Ok(sweeps)
    }

    pub async fn enforce_retention_once(
        &self,
        now: DateTime<Utc>,
    ) -> Result<RetentionReport, EngineError> {
        self.engine.enforce_retention_at(now).await
    }

    /// Background loop: auto-merge sweep on a fixed interval.
    ///
    /// A failed pass is logged and the loop waits for the next tick.
    pub async fn run_merge_sweep_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.engine.config.merge_sweep_interval());
        loop {
            ticker.tick().await;
            match self.sweep_merges_once(Utc::now()).await {
                Ok(sweeps) => {
                    let merged: usize = sweeps.iter().map(|s| s.report.merged).sum();
                    let failures: usize = sweeps.iter().map(|s| s.report.failures.len()).sum();
                    info!(sites = sweeps.len(), merged, failures, "merge sweep pass finished");
                }
                Err(e) => error!(error = %e, "merge sweep pass failed"),
            }
        }
    }

    /// Background loop: enforce retention once a day, at midnight UTC.
    pub async fn run_retention_loop(self: Arc<Self>) {
        loop {
            tokio::time::sleep(until_next_midnight(Utc::now())).await;
            if let Err(e) = self.enforce_retention_once(Utc::now()).await {
                error!(error = %e, "retention sweep failed; keeping data until next run");
            }
        }
    }
}

fn until_next_midnight(now: DateTime<Utc>) -> std::time::Duration {
    let tomorrow = now.date_naive() + chrono::Duration::days(1);
    let secs = match tomorrow.and_hms_opt(0, 0, 0) {
        Some(midnight) => (midnight.and_utc() - now).num_seconds().max(1),
        None => 24 * 60 * 60,
    };
    std::time::Duration::from_secs(secs as u64)
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone};

    use footprint_core::event::{DeviceInfo, IdentitySignals, TrackingPayload, TrackingRow};
    use footprint_core::store::EventStore;

    use super::*;

    fn identify(site_id: i64, fp: &str, email: &str, at: DateTime<Utc>) -> TrackingRow {
        TrackingRow {
            site_id,
            fingerprint: fp.to_string(),
            timestamp: at,
            device: DeviceInfo::default(),
            payload: TrackingPayload::Event {
                url: "/login".to_string(),
                name: "identify".to_string(),
                category: None,
                action: None,
                label: None,
                value: None,
                data: IdentitySignals {
                    email: Some(email.to_string()),
                    ..IdentitySignals::default()
                },
            },
        }
    }

    #[test]
    fn next_midnight_is_within_a_day() {
        let now = Utc.with_ymd_and_hms(2026, 7, 1, 23, 59, 30).unwrap();
        assert_eq!(until_next_midnight(now), std::time::Duration::from_secs(30));
        let now = Utc.with_ymd_and_hms(2026, 7, 1, 0, 0, 0).unwrap();
        assert_eq!(until_next_midnight(now), std::time::Duration::from_secs(86_400));
    }

    #[tokio::test]
    async fn sweep_covers_every_site_with_sessions() {
        let db = DuckDbBackend::open_in_memory().expect("db");
        let state = WorkerState::new(db, EngineConfig::default());
        let now = Utc.with_ymd_and_hms(2026, 7, 1, 12, 0, 0).unwrap();

        for site_id in [1, 2] {
            state
                .engine
                .sessions
                .ingest(&identify(site_id, "first", "a@example.com", now - Duration::days(2)))
                .await
                .expect("ingest");
            state
                .engine
                .sessions
                .ingest(&identify(site_id, "second", "a@example.com", now - Duration::days(1)))
                .await
                .expect("ingest");
        }

        let sweeps = state.sweep_merges_once(now).await.expect("sweep");
        assert_eq!(sweeps.len(), 2);
        assert!(sweeps.iter().all(|s| s.report.merged == 1));
        for site_id in [1, 2] {
            assert_eq!(
                state
                    .db
                    .canonical_fingerprint(site_id, "second")
                    .await
                    .expect("canonical"),
                "first"
            );
        }
    }

    #[tokio::test]
    async fn configured_sites_limit_the_sweep() {
        let db = DuckDbBackend::open_in_memory().expect("db");
        let config = EngineConfig {
            sites: vec![2],
            ..EngineConfig::default()
        };
        let state = WorkerState::new(db, config);
        let now = Utc.with_ymd_and_hms(2026, 7, 1, 12, 0, 0).unwrap();
        for (fp, days) in [("x", 3), ("y", 2)] {
            state
                .engine
                .sessions
                .ingest(&identify(1, fp, "b@example.com", now - Duration::days(days)))
                .await
                .expect("ingest");
        }

        let sweeps = state.sweep_merges_once(now).await.expect("sweep");
        assert_eq!(sweeps.len(), 1);
        assert_eq!(sweeps[0].site_id, 2);
        assert_eq!(sweeps[0].report.groups, 0);
        assert_eq!(
            state.db.canonical_fingerprint(1, "y").await.expect("canonical"),
            "y"
        );
    }
}
