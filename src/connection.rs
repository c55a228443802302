//! Logical connection lifecycle and reconnect scheduling

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

use crate::retry::{RetryConfig, RetryPolicy, RetryPolicyKind};

/// How often the pump loop repeats the `Failed` warning
pub const FAILED_REPORT_INTERVAL: Duration = Duration::from_secs(60);

/// Where the client is in its connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Never connected, or nothing has asked for a connection yet
    Disconnected,
    /// The transport has been asked to open
    Connecting,
    /// The transport reported the connection as up
    Connected,
    /// Waiting for the retry policy delay before the next attempt
    RetryWait,
    /// Retrying gave up, only an explicit reconnect leaves this state
    Failed,
    /// The client was torn down
    Destroyed,
}

/// Why the connection state changed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionStatusReason {
    /// Normal progress, e.g. a successful connect or a scheduled retry
    Ok,
    /// The network is unreachable
    NoNetwork,
    /// The connection broke after being established or failed to establish
    CommunicationError,
    /// The hub rejected an expired token
    ExpiredSasToken,
    /// The device is disabled in the hub registry
    DeviceDisabled,
    /// The hub rejected the credentials
    BadCredential,
    /// The hub stopped answering keep-alives
    NoPingResponse,
    /// The retry policy timeout ceiling was reached
    RetryExpired,
    /// The client was destroyed
    ClientClosed,
}

/// A single state change, reported once to the connection status callback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    /// State before the change
    pub from: ConnectionState,
    /// State after the change
    pub to: ConnectionState,
    /// Reason reported with the change
    pub reason: ConnectionStatusReason,
}

/// What the pump loop must do after advancing the machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Step {
    /// Nothing to do
    Idle,
    /// Ask the transport to open a connection
    Open,
}

#[derive(Debug)]
pub(crate) struct ConnectionStateMachine {
    state: ConnectionState,
    policy: RetryPolicy,
    config: RetryConfig,
    attempt: u32,
    retry_started: Option<Instant>,
    retry_at: Option<Instant>,
    connect_requested: bool,
    reset_requested: bool,
    last_failed_report: Option<Instant>,
}

impl ConnectionStateMachine {
    pub(crate) fn new(policy: RetryPolicy, config: RetryConfig) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            policy,
            config,
            attempt: 0,
            retry_started: None,
            retry_at: None,
            connect_requested: false,
            reset_requested: false,
            last_failed_report: None,
        }
    }

    pub(crate) fn state(&self) -> ConnectionState {
        self.state
    }

    pub(crate) fn policy(&self) -> RetryPolicy {
        self.policy
    }

    pub(crate) fn set_policy(&mut self, policy: RetryPolicy) {
        debug!("Retry policy set to {} ({}s limit)", policy.kind, policy.timeout_limit_seconds);
        self.policy = policy;
    }

    pub(crate) fn config(&self) -> &RetryConfig {
        &self.config
    }

    pub(crate) fn set_config(&mut self, config: RetryConfig) -> crate::Result<()> {
        config.validate()?;
        self.config = config;
        Ok(())
    }

    pub(crate) fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Something needs the connection: a send, a subscription, or an explicit connect
    pub(crate) fn request_connect(&mut self) {
        self.connect_requested = true;
    }

    /// Explicit reset, the only way out of `Failed`
    pub(crate) fn reconnect(&mut self) {
        self.connect_requested = true;
        if self.state == ConnectionState::Failed {
            self.reset_requested = true;
        }
    }

    /// Advance the machine by one pump cycle
    pub(crate) fn step(&mut self, now: Instant) -> (Option<Transition>, Step) {
        match self.state {
            ConnectionState::Disconnected if self.connect_requested => (
                Some(self.transition(ConnectionState::Connecting, ConnectionStatusReason::Ok)),
                Step::Open,
            ),
            ConnectionState::RetryWait => {
                if self.limit_exceeded(now, Duration::ZERO) {
                    return (Some(self.fail(ConnectionStatusReason::RetryExpired)), Step::Idle);
                }
                match self.retry_at {
                    // None: the wait overflowed the clock and never comes due
                    Some(at) if now >= at => {
                        self.retry_at = None;
                        trace!("Retry delay elapsed, attempt {}", self.attempt);
                        (
                            Some(self.transition(
                                ConnectionState::Connecting,
                                ConnectionStatusReason::Ok,
                            )),
                            Step::Open,
                        )
                    }
                    _ => (None, Step::Idle),
                }
            }
            ConnectionState::Failed if self.reset_requested => {
                self.reset_requested = false;
                self.reset_retry();
                (
                    Some(self.transition(ConnectionState::Connecting, ConnectionStatusReason::Ok)),
                    Step::Open,
                )
            }
            ConnectionState::Failed => {
                let due = self
                    .last_failed_report
                    .map_or(true, |last| now.duration_since(last) >= FAILED_REPORT_INTERVAL);
                if due {
                    warn!("Connection is FAILED, call reconnect to try again");
                    self.last_failed_report = Some(now);
                }
                (None, Step::Idle)
            }
            _ => (None, Step::Idle),
        }
    }

    /// The transport reported the connection as established
    pub(crate) fn on_connected(&mut self) -> Option<Transition> {
        match self.state {
            ConnectionState::Connecting | ConnectionState::RetryWait => {
                self.reset_retry();
                Some(self.transition(ConnectionState::Connected, ConnectionStatusReason::Ok))
            }
            state => {
                warn!("Ignoring connected report while {:?}", state);
                None
            }
        }
    }

    /// The transport reported a failed attempt or a dropped connection
    pub(crate) fn on_disconnected<R: Rng + ?Sized>(
        &mut self,
        reason: ConnectionStatusReason,
        now: Instant,
        rng: &mut R,
    ) -> Option<Transition> {
        if !matches!(
            self.state,
            ConnectionState::Connecting | ConnectionState::Connected
        ) {
            debug!("Ignoring disconnect ({:?}) while {:?}", reason, self.state);
            return None;
        }

        let Some(delay) = self
            .config
            .delay_for_attempt(self.policy.kind, self.attempt, rng)
        else {
            debug!("Retry policy {} does not retry", RetryPolicyKind::None);
            return Some(self.fail(reason));
        };

        self.retry_started.get_or_insert(now);
        // Give up as soon as the next wait would cross the ceiling instead of waiting it out
        if self.limit_exceeded(now, delay) {
            return Some(self.fail(ConnectionStatusReason::RetryExpired));
        }

        debug!(
            "Connection lost ({:?}), retry attempt {} in {:?}",
            reason, self.attempt, delay
        );
        self.attempt += 1;
        self.retry_at = now.checked_add(delay);
        Some(self.transition(ConnectionState::RetryWait, reason))
    }

    pub(crate) fn destroy(&mut self) -> Option<Transition> {
        if self.state == ConnectionState::Destroyed {
            return None;
        }
        Some(self.transition(
            ConnectionState::Destroyed,
            ConnectionStatusReason::ClientClosed,
        ))
    }

    fn limit_exceeded(&self, now: Instant, next_wait: Duration) -> bool {
        match (self.policy.timeout_limit(), self.retry_started) {
            (Some(limit), Some(started)) => {
                now.duration_since(started).saturating_add(next_wait) > limit
            }
            _ => false,
        }
    }

    fn reset_retry(&mut self) {
        self.attempt = 0;
        self.retry_started = None;
        self.retry_at = None;
        self.last_failed_report = None;
    }

    fn fail(&mut self, reason: ConnectionStatusReason) -> Transition {
        self.retry_at = None;
        self.connect_requested = false;
        self.transition(ConnectionState::Failed, reason)
    }

    fn transition(&mut self, to: ConnectionState, reason: ConnectionStatusReason) -> Transition {
        let from = self.state;
        self.state = to;
        debug!("Connection state {:?} -> {:?} ({:?})", from, to, reason);
        Transition { from, to, reason }
    }
}
