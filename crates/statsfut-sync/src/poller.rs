use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use statsfut_storage::MatchStore;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::PollerConfig;
use crate::updater::{MatchUpdater, UpdateMode};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollMode {
    /// Live or imminent fixtures: refresh every cycle.
    Active,
    /// Nothing going on: only check occasionally.
    Idle,
}

impl PollMode {
    pub fn label(self) -> &'static str {
        match self {
            PollMode::Active => "ACTIVE",
            PollMode::Idle => "IDLE",
        }
    }
}

/// Everything the loop remembers between cycles. Lost on restart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollerState {
    last_full_sync: Option<DateTime<Utc>>,
    mode: PollMode,
}

impl Default for PollerState {
    fn default() -> Self {
        Self {
            last_full_sync: None,
            mode: PollMode::Idle,
        }
    }
}

impl PollerState {
    pub fn mode(&self) -> PollMode {
        self.mode
    }

    pub fn last_full_sync(&self) -> Option<DateTime<Utc>> {
        self.last_full_sync
    }

    pub fn full_sync_due(&self, now: DateTime<Utc>, interval: chrono::Duration) -> bool {
        match self.last_full_sync {
            None => true,
            Some(last) => now - last > interval,
        }
    }

    pub fn record_full_sync(&mut self, at: DateTime<Utc>) {
        self.last_full_sync = Some(at);
    }

    /// Folds one predicate reading into the mode. Returns the new mode only
    /// when it differs from the previous one.
    pub fn observe(&mut self, has_active: bool) -> Option<PollMode> {
        let next = if has_active {
            PollMode::Active
        } else {
            PollMode::Idle
        };
        if next == self.mode {
            return None;
        }
        self.mode = next;
        Some(next)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleOutcome {
    pub full_sync_attempted: bool,
    pub full_sync_succeeded: bool,
    pub live_update_attempted: bool,
    pub mode: PollMode,
    pub mode_changed: bool,
    pub sleep_for: Duration,
}

/// Adaptive refresh loop: hourly full syncs, live updates only while
/// something is being played or about to kick off.
pub struct SmartPoller {
    store: Arc<dyn MatchStore>,
    updater: Arc<dyn MatchUpdater>,
    config: PollerConfig,
    state: PollerState,
}

impl SmartPoller {
    pub fn new(
        store: Arc<dyn MatchStore>,
        updater: Arc<dyn MatchUpdater>,
        config: PollerConfig,
    ) -> Self {
        Self {
            store,
            updater,
            config,
            state: PollerState::default(),
        }
    }

    pub fn state(&self) -> &PollerState {
        &self.state
    }

    pub fn interval_for(&self, mode: PollMode) -> Duration {
        match mode {
            PollMode::Active => self.config.active_interval,
            PollMode::Idle => self.config.idle_interval,
        }
    }

    /// Runs one iteration against the given wall-clock time. Only a failure
    /// to read match activity is returned; updater failures are logged and
    /// retried next cycle.
    pub async fn cycle(&mut self, now: DateTime<Utc>) -> Result<CycleOutcome> {
        let mut full_sync_attempted = false;
        let mut full_sync_succeeded = false;

        if self.state.full_sync_due(now, self.config.full_sync_interval) {
            full_sync_attempted = true;
            info!("starting full sync (results + calendar)");
            match self.updater.run(UpdateMode::Upcoming).await {
                Ok(()) => {
                    self.state.record_full_sync(now);
                    full_sync_succeeded = true;
                    info!("full sync finished");
                }
                Err(err) => error!(error = %err, "full sync failed"),
            }
        }

        let has_active = self
            .store
            .has_active_matches(now, self.config.upcoming_buffer)
            .await
            .context("checking for live or upcoming matches")?;

        let live_update_attempted = has_active;
        if has_active {
            info!("active matches detected, running live update");
            if let Err(err) = self.updater.run(UpdateMode::Live).await {
                error!(error = %err, "live update failed");
            }
        } else {
            info!("no live or upcoming matches, skipping API call");
        }

        let changed = self.state.observe(has_active);
        let mode = self.state.mode();
        let sleep_for = self.interval_for(mode);
        if let Some(entered) = changed {
            info!(
                mode = entered.label(),
                interval_secs = sleep_for.as_secs(),
                "entering {} mode",
                entered.label()
            );
        }

        Ok(CycleOutcome {
            full_sync_attempted,
            full_sync_succeeded,
            live_update_attempted,
            mode,
            mode_changed: changed.is_some(),
            sleep_for,
        })
    }

    /// Loops until Ctrl-C.
    pub async fn run_until_shutdown(&mut self) {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = %err, "could not listen for Ctrl-C; running until killed");
                std::future::pending::<()>().await;
            }
        })
        .await
    }

    /// Loops until `shutdown` resolves. A failed cycle is followed by the
    /// fixed fatal backoff instead of the regular interval.
    pub async fn run_until<F>(&mut self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        self.log_banner();
        let fatal_backoff = self.config.fatal_backoff;
        tokio::pin!(shutdown);

        loop {
            let cycle_id = Uuid::new_v4();
            let span = info_span!("poll_cycle", %cycle_id);
            let pause = tokio::select! {
                _ = &mut shutdown => break,
                result = self.cycle(Utc::now()).instrument(span) => match result {
                    Ok(outcome) => outcome.sleep_for,
                    Err(err) => {
                        error!(
                            %cycle_id,
                            error = %format!("{err:#}"),
                            backoff_secs = fatal_backoff.as_secs(),
                            "poll cycle failed, backing off"
                        );
                        fatal_backoff
                    }
                },
            };

            tokio::select! {
                _ = &mut shutdown => break,
                _ = tokio::time::sleep(pause) => {}
            }
        }

        info!("smart poller stopped");
    }

    fn log_banner(&self) {
        info!(
            idle_interval_secs = self.config.idle_interval.as_secs(),
            active_interval_secs = self.config.active_interval.as_secs(),
            full_sync_interval_secs = self.config.full_sync_interval.num_seconds(),
            upcoming_buffer_minutes = self.config.upcoming_buffer.num_minutes(),
            "smart poller starting"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use statsfut_core::{MatchRecord, MatchStatus};
    use statsfut_storage::{MemoryMatchStore, StoreError};
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
    use std::sync::Mutex;

    use crate::updater::UpdateError;

    #[derive(Default)]
    struct RecordingUpdater {
        calls: Mutex<Vec<UpdateMode>>,
        fail_upcoming: bool,
    }

    impl RecordingUpdater {
        fn calls(&self) -> Vec<UpdateMode> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl MatchUpdater for RecordingUpdater {
        async fn run(&self, mode: UpdateMode) -> Result<(), UpdateError> {
            self.calls.lock().unwrap().push(mode);
            if self.fail_upcoming && mode == UpdateMode::Upcoming {
                return Err(UpdateError::TimedOut {
                    command: "fake".into(),
                    timeout: Duration::from_secs(1),
                });
            }
            Ok(())
        }
    }

    /// Fails every activity check and counts how often it was asked.
    #[derive(Default)]
    struct BrokenStore {
        checks: AtomicUsize,
    }

    impl BrokenStore {
        fn checks(&self) -> usize {
            self.checks.load(AtomicOrdering::SeqCst)
        }
    }

    #[async_trait]
    impl MatchStore for BrokenStore {
        async fn duplicate_candidates(&self) -> Result<Vec<MatchRecord>, StoreError> {
            Err(StoreError::InvalidTableName("gone".into()))
        }

        async fn delete_matches(&self, _ids: &[i64]) -> Result<u64, StoreError> {
            Err(StoreError::InvalidTableName("gone".into()))
        }

        async fn has_active_matches(
            &self,
            _now: DateTime<Utc>,
            _upcoming_buffer: chrono::Duration,
        ) -> Result<bool, StoreError> {
            self.checks.fetch_add(1, AtomicOrdering::SeqCst);
            Err(StoreError::InvalidTableName("gone".into()))
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 6, 14, 12, 0, 0).single().unwrap()
    }

    fn fixture(id: i64, status: MatchStatus, kickoff: DateTime<Utc>) -> MatchRecord {
        MatchRecord {
            id,
            home_team: "Atletico-MG".into(),
            away_team: "Cruzeiro".into(),
            date: kickoff,
            status,
            api_id: Some(format!("api-{id}")),
        }
    }

    fn poller(store: Arc<dyn MatchStore>, updater: Arc<RecordingUpdater>) -> SmartPoller {
        SmartPoller::new(store, updater, PollerConfig::default())
    }

    #[test]
    fn full_sync_due_on_first_cycle_then_after_interval() {
        let interval = chrono::Duration::seconds(3600);
        let mut state = PollerState::default();
        assert!(state.full_sync_due(t0(), interval));

        state.record_full_sync(t0());
        assert!(!state.full_sync_due(t0() + chrono::Duration::seconds(1800), interval));
        assert!(!state.full_sync_due(t0() + chrono::Duration::seconds(3600), interval));
        assert!(state.full_sync_due(t0() + chrono::Duration::seconds(3601), interval));
    }

    #[test]
    fn mode_changes_are_reported_once() {
        let mut state = PollerState::default();
        let readings = [false, true, true, true, false, false, true];
        let changes = readings
            .iter()
            .map(|active| state.observe(*active))
            .collect::<Vec<_>>();
        assert_eq!(
            changes,
            vec![
                None,
                Some(PollMode::Active),
                None,
                None,
                Some(PollMode::Idle),
                None,
                Some(PollMode::Active),
            ]
        );
    }

    #[tokio::test]
    async fn idle_cycle_skips_live_update_and_sleeps_long() {
        let store = Arc::new(MemoryMatchStore::new(vec![fixture(
            1,
            MatchStatus::Scheduled,
            t0() + chrono::Duration::hours(5),
        )]));
        let updater = Arc::new(RecordingUpdater::default());
        let mut poller = poller(store, updater.clone());

        let outcome = poller.cycle(t0()).await.unwrap();
        assert!(outcome.full_sync_attempted);
        assert!(outcome.full_sync_succeeded);
        assert!(!outcome.live_update_attempted);
        assert_eq!(outcome.mode, PollMode::Idle);
        assert!(!outcome.mode_changed);
        assert_eq!(outcome.sleep_for, Duration::from_secs(300));
        assert_eq!(updater.calls(), vec![UpdateMode::Upcoming]);
    }

    #[tokio::test]
    async fn active_cycle_runs_live_update_and_sleeps_short() {
        let store = Arc::new(MemoryMatchStore::new(vec![fixture(
            1,
            MatchStatus::SecondHalf,
            t0() - chrono::Duration::hours(1),
        )]));
        let updater = Arc::new(RecordingUpdater::default());
        let mut poller = poller(store, updater.clone());

        let first = poller.cycle(t0()).await.unwrap();
        assert!(first.mode_changed);
        assert_eq!(first.mode, PollMode::Active);
        assert_eq!(first.sleep_for, Duration::from_secs(60));

        let second = poller
            .cycle(t0() + chrono::Duration::seconds(60))
            .await
            .unwrap();
        assert!(!second.full_sync_attempted);
        assert!(!second.mode_changed);
        assert_eq!(
            updater.calls(),
            vec![UpdateMode::Upcoming, UpdateMode::Live, UpdateMode::Live]
        );
    }

    #[tokio::test]
    async fn failed_full_sync_is_retried_next_cycle() {
        let store = Arc::new(MemoryMatchStore::default());
        let updater = Arc::new(RecordingUpdater {
            fail_upcoming: true,
            ..Default::default()
        });
        let mut poller = poller(store, updater.clone());

        let first = poller.cycle(t0()).await.unwrap();
        assert!(first.full_sync_attempted);
        assert!(!first.full_sync_succeeded);
        assert_eq!(poller.state().last_full_sync(), None);

        let second = poller
            .cycle(t0() + chrono::Duration::seconds(300))
            .await
            .unwrap();
        assert!(second.full_sync_attempted);
    }

    #[tokio::test]
    async fn store_failure_fails_the_cycle() {
        let updater = Arc::new(RecordingUpdater::default());
        let mut poller = poller(Arc::new(BrokenStore::default()), updater.clone());
        let err = poller.cycle(t0()).await.unwrap_err();
        assert!(format!("{err:#}").contains("checking for live or upcoming matches"));
        // The full sync still ran before the activity check.
        assert_eq!(updater.calls(), vec![UpdateMode::Upcoming]);
    }

    async fn cycles_before_shutdown(fatal_backoff: Duration) -> (usize, Vec<UpdateMode>) {
        let store = Arc::new(BrokenStore::default());
        let updater = Arc::new(RecordingUpdater::default());
        let config = PollerConfig {
            fatal_backoff,
            ..PollerConfig::default()
        };
        let mut poller = SmartPoller::new(store.clone(), updater.clone(), config);
        poller
            .run_until(tokio::time::sleep(Duration::from_secs(150)))
            .await;
        (store.checks(), updater.calls())
    }

    #[tokio::test(start_paused = true)]
    async fn failed_cycles_wait_the_fatal_backoff() {
        // Cycles at t=0, 60 and 120; shutdown lands during the third pause.
        let (cycles, calls) = cycles_before_shutdown(Duration::from_secs(60)).await;
        assert_eq!(cycles, 3);
        // Wall-clock time barely moves, so only the first cycle syncs.
        assert_eq!(calls, vec![UpdateMode::Upcoming]);
    }

    #[tokio::test(start_paused = true)]
    async fn longer_backoff_means_fewer_cycles() {
        let (cycles, _) = cycles_before_shutdown(Duration::from_secs(300)).await;
        assert_eq!(cycles, 1);
    }
}
