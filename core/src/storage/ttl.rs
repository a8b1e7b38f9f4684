//! Retention sweeper
//!
//! Periodically prunes expired steps, memory rows, and calibration
//! artifacts. Runs as a background task and stops when the engine's
//! cancellation token fires.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::Settings;
use crate::errors::Result;
use crate::storage::{now_epoch, DbPool};

const DAY_SECONDS: f64 = 86_400.0;

/// One sweep pass; returns rows deleted per table.
pub fn sweep_once(pool: &DbPool, settings: &Settings) -> Result<(usize, usize, usize)> {
    let conn = pool.get()?;
    let now = now_epoch();
    let steps = conn.execute(
        "DELETE FROM steps WHERE ts < ?1",
        [now - f64::from(settings.steps_ttl_days) * DAY_SECONDS],
    )?;
    let memory = conn.execute(
        "DELETE FROM memory WHERE ts < ?1",
        [now - f64::from(settings.memory_ttl_days) * DAY_SECONDS],
    )?;
    // Calibration artifacts are kept at least 90 days regardless of config.
    let artifact_days = settings.cp_artifacts_ttl_days.max(90);
    let artifacts = conn.execute(
        "DELETE FROM cp_artifacts WHERE ts < ?1",
        [now - f64::from(artifact_days) * DAY_SECONDS],
    )?;
    Ok((steps, memory, artifacts))
}

/// Spawn the sweeper loop.
pub fn spawn_sweeper(
    pool: DbPool,
    settings: Settings,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let interval = Duration::from_secs(settings.ttl_sweep_interval_seconds.max(60));
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
            let pool = pool.clone();
            let settings = settings.clone();
            let result =
                tokio::task::spawn_blocking(move || sweep_once(&pool, &settings)).await;
            match result {
                Ok(Ok((steps, memory, artifacts))) => {
                    debug!(steps, memory, artifacts, "ttl sweep complete");
                }
                Ok(Err(e)) => warn!(error = %e, "ttl sweep failed"),
                Err(e) => warn!(error = %e, "ttl sweep panicked"),
            }
        }
    })
}
