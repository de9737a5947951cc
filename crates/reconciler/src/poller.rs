//! Runstate poller.
//!
//! Blocks the calling task until a refreshed resource reaches a target label,
//! enters a label outside the pending and target sets, or runs out of time.
//! Refresh errors end the wait at once; the transport has already had its
//! chance to retry.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use labsync_remote::Runstate;
use tracing::debug;

use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::stop::StopSignal;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_secs(10);

const PRESENT: &str = "present";
const ABSENT: &str = "absent";

/// Pending and target runstates for one kind of transition.
#[derive(Debug, Clone, Copy)]
pub struct RunstateSets {
    pub pending: &'static [Runstate],
    pub target: &'static [Runstate],
}

impl RunstateSets {
    /// After a create, only `running` counts as settled.
    pub const CREATE: Self = Self {
        pending: &[Runstate::Busy],
        target: &[Runstate::Running],
    };

    /// An update may legitimately leave a resource stopped or suspended.
    pub const UPDATE: Self = Self {
        pending: &[Runstate::Busy],
        target: &[Runstate::Running, Runstate::Stopped, Runstate::Suspended],
    };
}

/// One wait: label sets, timing, and the overall budget.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaitConfig {
    pub pending: Vec<String>,
    pub target: Vec<String>,
    pub poll_interval: Duration,
    pub initial_delay: Duration,
    pub timeout: Duration,
}

impl WaitConfig {
    pub fn new<P, T>(pending: P, target: T, timeout: Duration) -> Self
    where
        P: IntoIterator,
        P::Item: Into<String>,
        T: IntoIterator,
        T::Item: Into<String>,
    {
        Self {
            pending: pending.into_iter().map(Into::into).collect(),
            target: target.into_iter().map(Into::into).collect(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            initial_delay: DEFAULT_INITIAL_DELAY,
            timeout,
        }
    }

    /// Wait for one of a runstate transition's target labels.
    #[must_use]
    pub fn runstates(sets: RunstateSets, timeout: Duration) -> Self {
        Self::new(
            sets.pending.iter().map(Runstate::as_str),
            sets.target.iter().map(Runstate::as_str),
            timeout,
        )
    }

    /// Wait for a deleted resource to stop being readable.
    #[must_use]
    pub fn absence(timeout: Duration) -> Self {
        Self::new([PRESENT], [ABSENT], timeout)
    }

    #[must_use]
    pub const fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    #[must_use]
    pub const fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }
}

/// A refreshed value and the label it is judged by.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation<T> {
    pub value: T,
    pub label: String,
}

impl<T> Observation<T> {
    pub fn new(value: T, label: impl Into<String>) -> Self {
        Self {
            value,
            label: label.into(),
        }
    }
}

/// Drives refresh functions until they settle.
#[derive(Clone)]
pub struct StateWaiter {
    clock: Arc<dyn Clock>,
    stop: StopSignal,
}

impl StateWaiter {
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>, stop: StopSignal) -> Self {
        Self { clock, stop }
    }

    /// Poll `refresh` until its label is in `config.target`.
    ///
    /// # Errors
    ///
    /// - the refresh error, unchanged, as soon as one occurs
    /// - [`Error::UnexpectedState`] for a label outside both sets
    /// - [`Error::Timeout`] once the budget is spent while still pending
    /// - [`Error::Cancelled`] when the stop signal fires
    pub async fn await_state<T, F, Fut>(&self, config: &WaitConfig, mut refresh: F) -> Result<T>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<Observation<T>>> + Send,
        T: Send,
    {
        self.check_stop()?;
        let started = self.clock.now();
        if !config.initial_delay.is_zero() {
            self.pause(config.initial_delay).await?;
        }

        let mut refreshes = 0_u32;
        loop {
            self.check_stop()?;
            let observation = refresh().await?;
            refreshes = refreshes.saturating_add(1);
            debug!(
                label = %observation.label,
                refreshes,
                "Polled state"
            );
            self.check_stop()?;

            if config.target.contains(&observation.label) {
                return Ok(observation.value);
            }
            if !config.pending.contains(&observation.label) {
                return Err(Error::unexpected_state(observation.label));
            }

            let elapsed = self.clock.now().saturating_duration_since(started);
            if elapsed >= config.timeout {
                return Err(Error::timeout(elapsed));
            }
            let remaining = config.timeout.saturating_sub(elapsed);
            self.pause(config.poll_interval.min(remaining)).await?;
        }
    }

    /// Poll `presence` until it reports the resource gone.
    pub async fn await_absence<F, Fut>(&self, config: &WaitConfig, mut presence: F) -> Result<()>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<bool>> + Send,
    {
        self.await_state(config, || {
            let check = presence();
            async move {
                let present = check.await?;
                Ok(Observation::new((), if present { PRESENT } else { ABSENT }))
            }
        })
        .await
    }

    fn check_stop(&self) -> Result<()> {
        if self.stop.is_stopped() {
            return Err(Error::Cancelled);
        }
        Ok(())
    }

    async fn pause(&self, duration: Duration) -> Result<()> {
        tokio::select! {
            biased;
            () = self.stop.stopped() => Err(Error::Cancelled),
            () = self.clock.sleep(duration) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::stop::Stopper;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Refresh function replaying a fixed script of labels.
    fn scripted(
        labels: &[&str],
    ) -> (
        Arc<AtomicUsize>,
        impl FnMut() -> futures::future::Ready<Result<Observation<String>>> + Send + use<>,
    ) {
        let calls = Arc::new(AtomicUsize::new(0));
        let script = Mutex::new(labels.iter().map(|l| (*l).to_string()).collect::<VecDeque<_>>());
        let counter = Arc::clone(&calls);
        let refresh = move || {
            counter.fetch_add(1, Ordering::SeqCst);
            let label = script
                .lock()
                .ok()
                .and_then(|mut s| if s.len() > 1 { s.pop_front() } else { s.front().cloned() })
                .unwrap_or_default();
            futures::future::ready(Ok(Observation::new(label.clone(), label)))
        };
        (calls, refresh)
    }

    fn waiter(clock: &Arc<ManualClock>) -> StateWaiter {
        StateWaiter::new(clock.clone(), StopSignal::never())
    }

    fn busy_running(timeout: Duration) -> WaitConfig {
        WaitConfig::new(["busy"], ["running"], timeout)
    }

    /// Given a refresh sequence busy, busy, running with a zero interval
    /// When waiting for running
    /// Then the running value is returned after exactly three refreshes
    #[tokio::test]
    async fn reaches_target_after_pending_refreshes() {
        let clock = Arc::new(ManualClock::new());
        let (calls, refresh) = scripted(&["busy", "busy", "running"]);
        let config = busy_running(Duration::from_secs(60))
            .with_poll_interval(Duration::ZERO)
            .with_initial_delay(Duration::ZERO);

        let result = waiter(&clock).await_state(&config, refresh).await;

        assert_eq!(result, Ok("running".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    /// Given a refresh sequence busy, error-state
    /// When waiting for running
    /// Then the wait fails with the offending label and never refreshes again
    #[tokio::test]
    async fn unexpected_state_stops_immediately() {
        let clock = Arc::new(ManualClock::new());
        let (calls, refresh) = scripted(&["busy", "error-state", "running"]);
        let config = busy_running(Duration::from_secs(60)).with_initial_delay(Duration::ZERO);

        let result = waiter(&clock).await_state(&config, refresh).await;

        assert_eq!(result, Err(Error::unexpected_state("error-state")));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    /// Given a refresh that is always busy, timeout 50ms and interval 10ms
    /// When waiting for running
    /// Then the wait times out after at least 50ms with at most six refreshes
    #[tokio::test]
    async fn always_pending_times_out() {
        let clock = Arc::new(ManualClock::new());
        let (calls, refresh) = scripted(&["busy"]);
        let config = busy_running(Duration::from_millis(50))
            .with_poll_interval(Duration::from_millis(10))
            .with_initial_delay(Duration::ZERO);

        let result = waiter(&clock).await_state(&config, refresh).await;

        assert!(
            matches!(result, Err(Error::Timeout { elapsed }) if elapsed >= Duration::from_millis(50)),
            "expected timeout, got {result:?}"
        );
        assert!(calls.load(Ordering::SeqCst) <= 6);
        assert!(clock.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn last_sleep_is_clamped_to_remaining_budget() {
        let clock = Arc::new(ManualClock::new());
        let (_, refresh) = scripted(&["busy"]);
        let config = busy_running(Duration::from_secs(25)).with_initial_delay(Duration::ZERO);

        let _ = waiter(&clock).await_state(&config, refresh).await;

        assert_eq!(
            clock.sleeps(),
            vec![
                Duration::from_secs(10),
                Duration::from_secs(10),
                Duration::from_secs(5)
            ]
        );
    }

    #[tokio::test]
    async fn initial_delay_precedes_first_refresh() {
        let clock = Arc::new(ManualClock::new());
        let (calls, refresh) = scripted(&["running"]);
        let config = busy_running(Duration::from_secs(60));

        let result = waiter(&clock).await_state(&config, refresh).await;

        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(clock.sleeps(), vec![DEFAULT_INITIAL_DELAY]);
    }

    #[tokio::test]
    async fn refresh_error_propagates_unchanged() {
        let clock = Arc::new(ManualClock::new());
        let config = busy_running(Duration::from_secs(60)).with_initial_delay(Duration::ZERO);

        let result: Result<()> = waiter(&clock)
            .await_state(&config, || async { Err(Error::request("get", "502 bad gateway")) })
            .await;

        assert_eq!(result, Err(Error::request("get", "502 bad gateway")));
    }

    #[tokio::test]
    async fn stop_before_entry_cancels_without_refresh() {
        let clock = Arc::new(ManualClock::new());
        let stopper = Stopper::new();
        let signal = stopper.signal();
        stopper.stop();
        let (calls, refresh) = scripted(&["running"]);

        let result = StateWaiter::new(clock, signal)
            .await_state(&busy_running(Duration::from_secs(60)), refresh)
            .await;

        assert_eq!(result, Err(Error::Cancelled));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    /// Given a real clock and a long poll interval
    /// When the stopper fires mid-sleep
    /// Then the wait returns Cancelled without finishing the sleep
    #[tokio::test]
    async fn stop_interrupts_sleep() {
        let stopper = Stopper::new();
        let waiter = StateWaiter::new(Arc::new(crate::clock::TokioClock), stopper.signal());
        let config = busy_running(Duration::from_secs(3600)).with_initial_delay(Duration::ZERO);
        let (_, refresh) = scripted(&["busy"]);

        let handle = tokio::spawn(async move { waiter.await_state(&config, refresh).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        stopper.stop();

        let joined = tokio::time::timeout(Duration::from_secs(2), handle).await;
        assert!(matches!(joined, Ok(Ok(Err(Error::Cancelled)))));
    }

    #[tokio::test]
    async fn absence_completes_once_gone() {
        let clock = Arc::new(ManualClock::new());
        let reads = Arc::new(AtomicUsize::new(0));
        let config = WaitConfig::absence(Duration::from_secs(60)).with_initial_delay(Duration::ZERO);

        let result = waiter(&clock)
            .await_absence(&config, || {
                let reads = Arc::clone(&reads);
                async move { Ok(reads.fetch_add(1, Ordering::SeqCst) < 2) }
            })
            .await;

        assert!(result.is_ok());
        assert_eq!(reads.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn update_targets_are_a_superset_of_create_targets() {
        for state in RunstateSets::CREATE.target {
            assert!(RunstateSets::UPDATE.target.contains(state));
        }
        let config = WaitConfig::runstates(RunstateSets::UPDATE, Duration::from_secs(1));
        assert_eq!(config.target, vec!["running", "stopped", "suspended"]);
    }
}
