use crate::scheduler::{PollCycleState, SchedulerState};
use std::future;
use std::time::Duration;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::info;

/// What one sign-of-life record said.
#[derive(Debug, Clone, PartialEq)]
pub struct LivenessSummary {
    pub state: SchedulerState,
    pub success_count: u64,
    pub failure_count: u64,
    pub consecutive_failures: u32,
    pub last_failure: Option<String>,
    /// `None` until the first successful poll.
    pub since_last_success: Option<Duration>,
    pub last_power: Option<f64>,
}

/// Periodic summary of the poll loop. Reads scheduler state, never changes it.
#[derive(Debug)]
pub struct LivenessReporter {
    period: Option<Duration>,
    reports: u64,
    last_summary: Option<LivenessSummary>,
}

impl LivenessReporter {
    /// `None` disables reporting.
    pub fn new(period: Option<Duration>) -> Self {
        Self {
            period: period.filter(|p| !p.is_zero()),
            reports: 0,
            last_summary: None,
        }
    }

    pub fn period(&self) -> Option<Duration> {
        self.period
    }

    /// Timer whose first tick is one full period from now.
    pub fn ticker(&self) -> Option<Interval> {
        self.period.map(|period| {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        })
    }

    /// Waits for the next tick, or forever when reporting is disabled.
    pub async fn wait(ticker: &mut Option<Interval>) {
        match ticker {
            Some(ticker) => {
                ticker.tick().await;
            }
            None => future::pending::<()>().await,
        }
    }

    pub fn report(
        &mut self,
        state: SchedulerState,
        cycle: &PollCycleState,
        last_power: Option<f64>,
    ) -> &LivenessSummary {
        let summary = LivenessSummary {
            state,
            success_count: cycle.success_count,
            failure_count: cycle.failure_count,
            consecutive_failures: cycle.consecutive_failures,
            last_failure: cycle.last_failure.clone(),
            since_last_success: cycle.last_success.map(|at| at.elapsed()),
            last_power,
        };
        self.reports += 1;

        info!(
            state = %summary.state,
            successes = summary.success_count,
            failures = summary.failure_count,
            consecutive_failures = summary.consecutive_failures,
            last_failure = summary.last_failure.as_deref().unwrap_or("none"),
            secs_since_success = ?summary.since_last_success.map(|d| d.as_secs()),
            last_power = ?summary.last_power,
            "Sign of life"
        );
        self.last_summary.insert(summary)
    }

    pub fn reports(&self) -> u64 {
        self.reports
    }

    pub fn last_summary(&self) -> Option<&LivenessSummary> {
        self.last_summary.as_ref()
    }
}
