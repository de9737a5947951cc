//! Explicit provider context handed to every reconciler call.

use std::sync::Arc;
use std::time::Duration;

use labsync_core::{OperationTimeouts, ProviderConfig, TimeoutOverrides};
use labsync_remote::RemoteService;

use crate::clock::{Clock, TokioClock};
use crate::poller::{
    DEFAULT_INITIAL_DELAY, DEFAULT_POLL_INTERVAL, RunstateSets, StateWaiter, WaitConfig,
};
use crate::stop::StopSignal;
use crate::types::ResourceKind;

/// Shared, read-only collaborators for reconciliation.
///
/// Cloning is cheap; the remote service is the only shared resource and is
/// safe for concurrent use.
#[derive(Clone)]
pub struct ProviderContext {
    service: Arc<dyn RemoteService>,
    timeouts: TimeoutOverrides,
    poll_interval: Duration,
    initial_delay: Duration,
    clock: Arc<dyn Clock>,
    stop: StopSignal,
}

impl ProviderContext {
    /// Context with default timing and a real clock.
    pub fn new(service: Arc<dyn RemoteService>) -> Self {
        Self {
            service,
            timeouts: TimeoutOverrides::default(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            initial_delay: DEFAULT_INITIAL_DELAY,
            clock: Arc::new(TokioClock),
            stop: StopSignal::never(),
        }
    }

    /// Context whose timing comes from provider configuration.
    pub fn from_config(service: Arc<dyn RemoteService>, config: &ProviderConfig) -> Self {
        Self {
            timeouts: config.timeouts.clone(),
            poll_interval: config.poll_interval(),
            initial_delay: config.initial_delay(),
            ..Self::new(service)
        }
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn with_stop(mut self, stop: StopSignal) -> Self {
        self.stop = stop;
        self
    }

    #[must_use]
    pub const fn with_poll_timing(mut self, poll_interval: Duration, initial_delay: Duration) -> Self {
        self.poll_interval = poll_interval;
        self.initial_delay = initial_delay;
        self
    }

    #[must_use]
    pub fn with_timeouts(mut self, timeouts: TimeoutOverrides) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn service(&self) -> &dyn RemoteService {
        self.service.as_ref()
    }

    #[must_use]
    pub fn timeouts(&self, kind: ResourceKind) -> OperationTimeouts {
        self.timeouts.for_kind(kind.as_str())
    }

    #[must_use]
    pub fn waiter(&self) -> StateWaiter {
        StateWaiter::new(Arc::clone(&self.clock), self.stop.clone())
    }

    /// Wait configuration for a runstate transition with this context's timing.
    #[must_use]
    pub fn runstate_wait(&self, sets: RunstateSets, timeout: Duration) -> WaitConfig {
        self.timed(WaitConfig::runstates(sets, timeout))
    }

    /// Wait configuration for a delete with this context's timing.
    #[must_use]
    pub fn absence_wait(&self, timeout: Duration) -> WaitConfig {
        self.timed(WaitConfig::absence(timeout))
    }

    fn timed(&self, config: WaitConfig) -> WaitConfig {
        config
            .with_poll_interval(self.poll_interval)
            .with_initial_delay(self.initial_delay)
    }
}
