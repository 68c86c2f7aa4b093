use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::info;

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::funnel::FunnelMatcher;
use crate::identity::IdentityResolver;
use crate::journey::JourneyBuilder;
use crate::locks::KeyedLocks;
use crate::session::SessionAssembler;
use crate::store::{EventStore, RetentionReport};

/// The four components wired over one store and one shared lock table.
///
/// Ingestion and merges must share the same [`KeyedLocks`]; building the
/// components through `Engine` guarantees that.
pub struct Engine {
    pub store: Arc<dyn EventStore>,
    pub config: EngineConfig,
    pub sessions: SessionAssembler,
    pub identity: IdentityResolver,
    pub funnels: FunnelMatcher,
    pub journeys: JourneyBuilder,
}

impl Engine {
    pub fn new(store: Arc<dyn EventStore>, config: EngineConfig) -> Self {
        let locks = Arc::new(KeyedLocks::new());
        Self {
            sessions: SessionAssembler::new(
                Arc::clone(&store),
                Arc::clone(&locks),
                config.session_timeout(),
            ),
            identity: IdentityResolver::new(Arc::clone(&store), locks),
            funnels: FunnelMatcher::new(Arc::clone(&store), config.funnel_page_size),
            journeys: JourneyBuilder::new(
                Arc::clone(&store),
                config.session_timeout(),
                config.live_window(),
            ),
            store,
            config,
        }
    }

    /// Sites to sweep: the configured list, or every site with sessions.
    pub async fn sweep_sites(&self) -> Result<Vec<i64>, EngineError> {
        if !self.config.sites.is_empty() {
            return Ok(self.config.sites.clone());
        }
        Ok(self.store.sites().await?)
    }

    /// Delete rows older than the configured retention period.
    pub async fn enforce_retention(&self) -> Result<RetentionReport, EngineError> {
        self.enforce_retention_at(Utc::now()).await
    }

    pub async fn enforce_retention_at(
        &self,
        now: DateTime<Utc>,
    ) -> Result<RetentionReport, EngineError> {
        let cutoff = now - Duration::days(i64::from(self.config.retention_days));
        let report = self.store.delete_before(cutoff).await?;
        info!(
            cutoff = %cutoff,
            sessions = report.sessions_deleted,
            pageviews = report.pageviews_deleted,
            events = report.events_deleted,
            "retention enforced"
        );
        Ok(report)
    }
}
