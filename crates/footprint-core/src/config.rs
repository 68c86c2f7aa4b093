use std::time::Duration;

/// Engine and worker configuration, read from `FOOTPRINT_*` environment variables.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub data_dir: String,
    pub duckdb_memory_limit: String,
    pub session_timeout_minutes: i64,
    pub live_window_seconds: i64,
    pub funnel_page_size: usize,
    pub retention_days: u32,
    pub merge_sweep_interval_secs: u64,
    pub merge_sweep_window_days: i64,
    /// Sites the worker sweeps. Empty means "every site with sessions".
    pub sites: Vec<i64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: "./data".to_string(),
            duckdb_memory_limit: "1GB".to_string(),
            session_timeout_minutes: 30,
            live_window_seconds: 300,
            funnel_page_size: 5000,
            retention_days: 365,
            merge_sweep_interval_secs: 3600,
            merge_sweep_window_days: 30,
            sites: Vec::new(),
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Result<Self, String> {
        let defaults = Self::default();
        Ok(Self {
            data_dir: std::env::var("FOOTPRINT_DATA_DIR").unwrap_or(defaults.data_dir),
            duckdb_memory_limit: std::env::var("FOOTPRINT_DUCKDB_MEMORY")
                .unwrap_or(defaults.duckdb_memory_limit),
            session_timeout_minutes: std::env::var("FOOTPRINT_SESSION_TIMEOUT_MINUTES")
                .unwrap_or_else(|_| "30".to_string())
                .parse()
                .map_err(|e| format!("invalid session timeout: {e}"))?,
            live_window_seconds: std::env::var("FOOTPRINT_LIVE_WINDOW_SECONDS")
                .unwrap_or_else(|_| "300".to_string())
                .parse()
                .map_err(|e| format!("invalid live window: {e}"))?,
            funnel_page_size: std::env::var("FOOTPRINT_FUNNEL_PAGE_SIZE")
                .unwrap_or_else(|_| "5000".to_string())
                .parse()
                .unwrap_or(defaults.funnel_page_size)
                .max(1),
            retention_days: std::env::var("FOOTPRINT_RETENTION_DAYS")
                .unwrap_or_else(|_| "365".to_string())
                .parse()
                .unwrap_or(defaults.retention_days),
            merge_sweep_interval_secs: std::env::var("FOOTPRINT_MERGE_SWEEP_INTERVAL_SECS")
                .unwrap_or_else(|_| "3600".to_string())
                .parse()
                .unwrap_or(defaults.merge_sweep_interval_secs),
            merge_sweep_window_days: std::env::var("FOOTPRINT_MERGE_SWEEP_WINDOW_DAYS")
                .unwrap_or_else(|_| "30".to_string())
                .parse()
                .unwrap_or(defaults.merge_sweep_window_days),
            sites: match std::env::var("FOOTPRINT_SITES") {
                Ok(raw) => parse_sites(&raw)?,
                Err(_) => Vec::new(),
            },
        })
    }

    pub fn session_timeout(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.session_timeout_minutes)
    }

    pub fn live_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.live_window_seconds)
    }

    pub fn merge_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.merge_sweep_interval_secs.max(1))
    }
}

fn parse_sites(raw: &str) -> Result<Vec<i64>, String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse().map_err(|e| format!("invalid site id {s:?}: {e}")))
        .collect()
}
