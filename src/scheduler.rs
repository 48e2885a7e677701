//! The poll loop: one fetch, map and publish cycle per interval tick, plus the
//! sign-of-life timer, multiplexed on a single task.

use crate::bus::{paths, AttributeValue, DeviceBus};
use crate::config::BridgeConfig;
use crate::device_client::{FetchError, StatusSource};
use crate::liveness::LivenessReporter;
use crate::publisher::{PublishError, Publisher};
use crate::status_mapper::{map_status, DeviceIdentity, MappingConfig};
use std::fmt;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Polling,
    Degraded,
}

impl fmt::Display for SchedulerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedulerState::Polling => f.write_str("polling"),
            SchedulerState::Degraded => f.write_str("degraded"),
        }
    }
}

/// Bookkeeping across poll cycles.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PollCycleState {
    pub last_poll: Option<Instant>,
    pub last_success: Option<Instant>,
    pub consecutive_failures: u32,
    pub success_count: u64,
    pub failure_count: u64,
    pub last_failure: Option<String>,
}

impl PollCycleState {
    pub fn record_success(&mut self, at: Instant) {
        self.last_success = Some(at);
        self.consecutive_failures = 0;
        self.success_count = self.success_count.saturating_add(1);
    }

    pub fn record_failure(&mut self, reason: String) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.failure_count = self.failure_count.saturating_add(1);
        self.last_failure = Some(reason);
    }
}

#[derive(Debug, Error)]
pub enum CycleError {
    #[error("fetch failed: {0}")]
    Fetch(#[from] FetchError),
    #[error("publish failed: {0}")]
    Publish(#[from] PublishError),
    #[error("device identity changed from {expected} to {found}")]
    IdentityChanged { expected: String, found: String },
}

impl CycleError {
    pub fn is_persistent(&self) -> bool {
        match self {
            CycleError::Fetch(err) => err.is_persistent(),
            CycleError::Publish(_) => false,
            CycleError::IdentityChanged { .. } => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerSettings {
    pub poll_interval: Duration,
    pub degraded_threshold: u32,
    pub sign_of_life: Option<Duration>,
}

impl SchedulerSettings {
    pub fn from_config(config: &BridgeConfig) -> Self {
        Self {
            poll_interval: config.poll_interval,
            degraded_threshold: config.degraded_threshold,
            sign_of_life: config.sign_of_life,
        }
    }
}

pub struct Scheduler<S: StatusSource, B: DeviceBus> {
    source: S,
    publisher: Publisher<B>,
    mapping: MappingConfig,
    settings: SchedulerSettings,
    identity: Option<DeviceIdentity>,
    state: SchedulerState,
    cycle: PollCycleState,
    liveness: LivenessReporter,
}

impl<S: StatusSource, B: DeviceBus> Scheduler<S, B> {
    pub fn new(
        source: S,
        publisher: Publisher<B>,
        mapping: MappingConfig,
        settings: SchedulerSettings,
    ) -> Self {
        Self {
            source,
            publisher,
            mapping,
            settings,
            identity: None,
            state: SchedulerState::Polling,
            cycle: PollCycleState::default(),
            liveness: LivenessReporter::new(settings.sign_of_life),
        }
    }

    /// Polls until `shutdown` resolves. A tick that is in flight when shutdown
    /// arrives is dropped, abandoning its HTTP request.
    pub async fn run<F>(&mut self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let mut poll = interval(self.settings.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut sign_of_life = self.liveness.ticker();
        tokio::pin!(shutdown);

        info!(
            interval_ms = self.settings.poll_interval.as_millis() as u64,
            degraded_threshold = self.settings.degraded_threshold,
            sign_of_life_secs = ?self.liveness.period().map(|p| p.as_secs()),
            "Starting poll loop"
        );

        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => break,
                _ = LivenessReporter::wait(&mut sign_of_life) => self.report_liveness(),
                _ = poll.tick() => {
                    tokio::select! {
                        biased;
                        _ = &mut shutdown => {
                            info!("Shutdown during poll, abandoning request");
                            break;
                        }
                        _ = self.tick() => {}
                    }
                }
            }
        }

        info!(
            successes = self.cycle.success_count,
            failures = self.cycle.failure_count,
            "Poll loop stopped"
        );
    }

    /// Runs one poll cycle and updates the failure bookkeeping. Returns the
    /// number of attributes that changed on the bus.
    pub async fn tick(&mut self) -> Result<usize, CycleError> {
        self.cycle.last_poll = Some(Instant::now());
        match self.poll_once().await {
            Ok(changed) => {
                self.on_success();
                Ok(changed)
            }
            Err(err) => {
                self.on_failure(&err);
                Err(err)
            }
        }
    }

    async fn poll_once(&mut self) -> Result<usize, CycleError> {
        let status = self.source.fetch_status().await?;

        let identity = DeviceIdentity::from_hardware_id(&status.hardware_id);
        match &self.identity {
            Some(expected) if *expected != identity => {
                return Err(CycleError::IdentityChanged {
                    expected: expected.serial().to_string(),
                    found: identity.serial().to_string(),
                });
            }
            Some(_) => {}
            None => {
                info!(serial = identity.serial(), "Device identified");
                self.identity = Some(identity.clone());
            }
        }

        let values = map_status(&status, &self.mapping, &identity);

        if !self.publisher.is_registered() {
            warn!("Bus attachment lost, registering again");
            self.publisher.register().map_err(PublishError::from)?;
        }
        let changed = self.publisher.publish(&values)?;
        debug!(changed, power = status.power, "Poll cycle complete");
        Ok(changed)
    }

    fn on_success(&mut self) {
        let failures = self.cycle.consecutive_failures;
        self.cycle.record_success(Instant::now());
        if self.state == SchedulerState::Degraded {
            self.state = SchedulerState::Polling;
            info!(failures, "Device recovered, back to polling");
        }
    }

    fn on_failure(&mut self, err: &CycleError) {
        self.cycle.record_failure(err.to_string());
        let consecutive = self.cycle.consecutive_failures;

        if self.state == SchedulerState::Polling && consecutive >= self.settings.degraded_threshold {
            self.state = SchedulerState::Degraded;
            warn!(
                consecutive_failures = consecutive,
                "Entering degraded state"
            );
        }

        if err.is_persistent() || self.state == SchedulerState::Degraded {
            error!(
                state = %self.state,
                consecutive_failures = consecutive,
                reason = %err,
                "Poll failed"
            );
        } else {
            warn!(
                state = %self.state,
                consecutive_failures = consecutive,
                reason = %err,
                "Poll failed"
            );
        }
    }

    fn report_liveness(&mut self) {
        let last_power = self
            .publisher
            .value(paths::AC_POWER)
            .and_then(AttributeValue::as_f64);
        self.liveness.report(self.state, &self.cycle, last_power);
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    pub fn cycle(&self) -> &PollCycleState {
        &self.cycle
    }

    pub fn identity(&self) -> Option<&DeviceIdentity> {
        self.identity.as_ref()
    }

    pub fn liveness(&self) -> &LivenessReporter {
        &self.liveness
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn publisher(&self) -> &Publisher<B> {
        &self.publisher
    }

    pub fn publisher_mut(&mut self) -> &mut Publisher<B> {
        &mut self.publisher
    }
}
