//! Match sync orchestration: duplicate cleanup and the adaptive live-update loop.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use statsfut_storage::PgMatchStore;
use tracing::info;

mod config;
mod dedup;
mod poller;
mod updater;

pub use config::{PollerConfig, StatsfutConfig};
pub use dedup::{plan_dedup, DedupCommand, DedupPlan, DedupReport, DuplicateGroup};
pub use poller::{CycleOutcome, PollMode, PollerState, SmartPoller};
pub use updater::{CommandUpdater, MatchUpdater, UpdateError, UpdateMode};

pub const CRATE_NAME: &str = "statsfut-sync";

pub async fn connect_store(config: &StatsfutConfig) -> Result<PgMatchStore> {
    PgMatchStore::connect(&config.database_url, config.match_table.clone())
        .await
        .with_context(|| format!("connecting to match table {}", config.match_table))
}

pub fn command_updater(config: &StatsfutConfig) -> CommandUpdater {
    CommandUpdater::new(config.update_program.clone(), config.update_args.clone())
        .with_timeout(config.update_timeout)
}

pub async fn run_dedup_from_env(dry_run: bool) -> Result<DedupReport> {
    let config = StatsfutConfig::from_env();
    let store = connect_store(&config).await?;
    DedupCommand::new(dry_run).run(&store).await
}

/// Runs the poller against the configured database. With `once`, a single
/// cycle runs and its outcome is returned instead of looping until Ctrl-C.
pub async fn run_poller_from_env(once: bool) -> Result<Option<CycleOutcome>> {
    let config = StatsfutConfig::from_env();
    let store = connect_store(&config).await?;
    let updater = command_updater(&config);
    let mut poller = SmartPoller::new(Arc::new(store), Arc::new(updater), config.poller);

    if once {
        let outcome = poller.cycle(Utc::now()).await?;
        return Ok(Some(outcome));
    }
    poller.run_until_shutdown().await;
    Ok(None)
}

pub async fn run_update_from_env(mode: UpdateMode) -> Result<()> {
    let config = StatsfutConfig::from_env();
    let updater = command_updater(&config);
    info!(%mode, command = %updater.command_line(mode), "running external update");
    updater
        .run(mode)
        .await
        .with_context(|| format!("running {mode} update"))
}

pub async fn migrate_from_env() -> Result<()> {
    let config = StatsfutConfig::from_env();
    let store = connect_store(&config).await?;
    store.migrate().await.context("applying match table migrations")
}
