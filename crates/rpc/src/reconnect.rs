//! Client-side reconnect loop and its retry policy.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::connection::{Connection, ConnectionConfig};
use crate::session::Session;
use crate::transport::Connector;

/// A connection that ends sooner than this counts as a failed attempt.
pub const MIN_HEALTHY_UPTIME: Duration = Duration::from_secs(5);

/// Maps a retry count to a sleep before the next attempt.
///
/// Steps are `(tries, sleep)` pairs kept in ascending order of `tries`; the
/// first step with `retry < tries` wins. Past the last step the default sleep
/// applies, and without one the driver stops.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    steps: Vec<(u32, Duration)>,
    default_sleep: Option<Duration>,
}

impl RetryPolicy {
    /// Build a policy from steps in any order.
    pub fn new(
        steps: impl IntoIterator<Item = (u32, Duration)>,
        default_sleep: Option<Duration>,
    ) -> Self {
        let mut steps: Vec<_> = steps.into_iter().collect();
        steps.sort_by_key(|(tries, _)| *tries);
        Self {
            steps,
            default_sleep,
        }
    }

    /// Give up after the first failure.
    #[must_use]
    pub const fn never() -> Self {
        Self {
            steps: Vec::new(),
            default_sleep: None,
        }
    }

    /// Always sleep `sleep` between attempts.
    #[must_use]
    pub const fn constant(sleep: Duration) -> Self {
        Self {
            steps: Vec::new(),
            default_sleep: Some(sleep),
        }
    }

    /// Sleep before attempt number `retry`, or `None` to give up.
    #[must_use]
    pub fn sleep_for(&self, retry: u32) -> Option<Duration> {
        self.steps
            .iter()
            .find(|(tries, _)| retry < *tries)
            .map(|(_, sleep)| *sleep)
            .or(self.default_sleep)
    }

    /// Steps in ascending order of tries.
    #[must_use]
    pub fn steps(&self) -> &[(u32, Duration)] {
        &self.steps
    }

    /// Sleep once every step is exhausted.
    #[must_use]
    pub const fn default_sleep(&self) -> Option<Duration> {
        self.default_sleep
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(
            [(3, Duration::from_secs(1)), (6, Duration::from_secs(3))],
            None,
        )
    }
}

/// How a connection attempt went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// Connected and stayed up for at least the minimum uptime.
    Healthy,
    /// Never connected, or dropped too soon.
    Failed,
}

impl AttemptOutcome {
    /// Classify an attempt by whether it connected and how long it lasted.
    #[must_use]
    pub fn classify(connected: bool, uptime: Duration, min_uptime: Duration) -> Self {
        if connected && uptime >= min_uptime {
            Self::Healthy
        } else {
            Self::Failed
        }
    }
}

/// Retry counter driven by a [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: RetryPolicy,
    retry: u32,
}

impl Backoff {
    /// Start with no failures recorded.
    #[must_use]
    pub const fn new(policy: RetryPolicy) -> Self {
        Self { policy, retry: 0 }
    }

    /// Consecutive failures so far.
    #[must_use]
    pub const fn retry(&self) -> u32 {
        self.retry
    }

    /// Record an attempt and return how long to wait before the next one.
    ///
    /// A healthy attempt resets the counter and retries immediately. `None`
    /// means the policy gave up.
    pub fn record(&mut self, outcome: AttemptOutcome) -> Option<Duration> {
        match outcome {
            AttemptOutcome::Healthy => {
                self.retry = 0;
                Some(Duration::ZERO)
            }
            AttemptOutcome::Failed => {
                self.retry = self.retry.saturating_add(1);
                self.policy.sleep_for(self.retry)
            }
        }
    }
}

/// Why [`ReconnectDriver::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverExit {
    /// The retry policy ran out of steps.
    PolicyExhausted,
    /// The shutdown token fired.
    Shutdown,
}

/// Keeps a session connected to one address.
#[derive(Debug)]
pub struct ReconnectDriver {
    address: Url,
    connector: Arc<dyn Connector>,
    session: Arc<Session>,
    policy: RetryPolicy,
    connection_config: ConnectionConfig,
    min_uptime: Duration,
}

impl ReconnectDriver {
    /// Create a driver with the default policy.
    #[must_use]
    pub fn new(address: Url, connector: Arc<dyn Connector>, session: Arc<Session>) -> Self {
        Self {
            address,
            connector,
            session,
            policy: RetryPolicy::default(),
            connection_config: ConnectionConfig::default(),
            min_uptime: MIN_HEALTHY_UPTIME,
        }
    }

    /// Set the retry policy.
    #[must_use]
    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Set the configuration of each connection.
    #[must_use]
    pub fn with_connection_config(mut self, config: ConnectionConfig) -> Self {
        self.connection_config = config;
        self
    }

    /// Set the uptime below which an attempt counts as failed.
    #[must_use]
    pub const fn with_min_uptime(mut self, min_uptime: Duration) -> Self {
        self.min_uptime = min_uptime;
        self
    }

    /// The session kept connected.
    #[must_use]
    pub const fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Connect once and run the connection to completion.
    ///
    /// Returns whether the connection was established.
    pub async fn connect_and_run(&self) -> bool {
        let mut connection =
            Connection::new(Arc::clone(&self.session), self.connection_config.clone());

        if let Err(e) = connection
            .connect(self.connector.as_ref(), &self.address)
            .await
        {
            info!("Connection failed: {}", e);
            return false;
        }
        info!("Connected to {}", self.address);

        match connection.run().await {
            Ok(()) => info!("Disconnected from server"),
            Err(e) => info!("Disconnected from server: {}", e),
        }
        connection.close().await;
        true
    }

    /// Reconnect until the policy gives up or `shutdown` fires.
    pub async fn run(&self, shutdown: CancellationToken) -> DriverExit {
        let mut backoff = Backoff::new(self.policy.clone());

        loop {
            let started = Instant::now();
            let connected = tokio::select! {
                () = shutdown.cancelled() => return DriverExit::Shutdown,
                connected = self.connect_and_run() => connected,
            };

            let outcome = AttemptOutcome::classify(connected, started.elapsed(), self.min_uptime);
            debug!("Attempt finished: {:?}", outcome);

            match backoff.record(outcome) {
                None => {
                    warn!("Giving up after {} failed attempts", backoff.retry());
                    return DriverExit::PolicyExhausted;
                }
                Some(delay) if delay.is_zero() => {}
                Some(delay) => {
                    info!("Reconnecting in {:?} (retry {})", delay, backoff.retry());
                    tokio::select! {
                        () = shutdown.cancelled() => return DriverExit::Shutdown,
                        () = sleep(delay) => {}
                    }
                }
            }
        }
    }
}
