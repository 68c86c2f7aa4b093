use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use tracing::info;

use footprint_core::config::EngineConfig;
use footprint_duckdb::DuckDbBackend;
use footprint_worker::state::WorkerState;

/// `footprint [sweep-merges | retention | check]`
///
/// Without a subcommand the worker runs the merge sweep and retention loops
/// until Ctrl-C. The subcommands run one pass, print the JSON report and exit.
#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("footprint=info".parse()?),
        )
        .json()
        .init();

    let cfg = EngineConfig::from_env().map_err(|e| anyhow::anyhow!(e))?;

    std::fs::create_dir_all(&cfg.data_dir)?;
    let db_path = format!("{}/footprint.db", cfg.data_dir);
    let db = DuckDbBackend::open(&db_path, &cfg.duckdb_memory_limit)?;

    let args: Vec<String> = std::env::args().collect();
    let state = Arc::new(WorkerState::new(db, cfg));

    match args.get(1).map(|s| s.as_str()) {
        Some("check") => {
            state.db.ping().await?;
            info!(db_path = %db_path, "database reachable");
            return Ok(());
        }
        Some("sweep-merges") => {
            let sweeps = state.sweep_merges_once(Utc::now()).await?;
            println!("{}", serde_json::to_string_pretty(&sweeps)?);
            return Ok(());
        }
        Some("retention") => {
            let report = state.enforce_retention_once(Utc::now()).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            return Ok(());
        }
        Some(other) => {
            anyhow::bail!("unknown command {other:?}; expected sweep-merges, retention or check")
        }
        None => {}
    }

    {
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            state.run_merge_sweep_loop().await;
        });
    }
    {
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            state.run_retention_loop().await;
        });
    }

    info!(
        interval_secs = state.engine.config.merge_sweep_interval_secs,
        retention_days = state.engine.config.retention_days,
        "footprint worker running"
    );
    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    Ok(())
}
