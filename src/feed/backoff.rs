//! Reconnect Strategy and Feed State Machine
//!
//! ```text
//!  DISCONNECTED ──Start──▶ CONNECTING ──Connected──▶ STREAMING ◀─┐
//!                            ▲    │                    │  │      │
//!                            │    │ConnectFailed       │  └Event─┘ (attempt = 0)
//!                RetryElapsed│    ▼                    │
//!                            └─ RECONNECT_WAIT ◀───────┘ StreamError / StreamEnded
//! ```
//!
//! The machine is pure: it only decides the next state and, when entering
//! `RECONNECT_WAIT`, which attempt the wait belongs to. The watcher task
//! turns that into a sleep.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Reconnect settings of the change feed watcher
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeFeedConfig {
    /// Delay before the first reconnect attempt
    pub base_delay: Duration,
    /// Upper bound of the exponential delay
    pub max_delay: Duration,
    /// Symmetric jitter applied after the cap (0.0 - 1.0)
    pub jitter_ratio: f64,
}

impl Default for ChangeFeedConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter_ratio: 0.1,
        }
    }
}

impl ChangeFeedConfig {
    pub fn validate(&self) -> Result<()> {
        if self.base_delay.is_zero() {
            return Err(Error::Config("feed reconnect base delay must be positive".into()));
        }
        if self.base_delay > self.max_delay {
            return Err(Error::Config(format!(
                "feed reconnect base delay {:?} exceeds max delay {:?}",
                self.base_delay, self.max_delay
            )));
        }
        if !(0.0..=1.0).contains(&self.jitter_ratio) {
            return Err(Error::Config(format!(
                "feed reconnect jitter must be within 0.0 - 1.0, got {}",
                self.jitter_ratio
            )));
        }
        Ok(())
    }

    /// Un-jittered delay before reconnect attempt `attempt` (0-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        reconnect_delay(self.base_delay, self.max_delay, attempt)
    }

    /// Apply jitter to a capped delay
    pub fn jittered(&self, delay: Duration) -> Duration {
        if self.jitter_ratio <= 0.0 || delay.is_zero() {
            return delay;
        }
        let spread = delay.as_secs_f64() * self.jitter_ratio;
        let offset = rand::thread_rng().gen_range(-spread..=spread);
        Duration::from_secs_f64((delay.as_secs_f64() + offset).max(0.0))
    }

    /// Longest a reconnect wait can last
    pub fn worst_case_delay(&self) -> Duration {
        if self.jitter_ratio <= 0.0 {
            return self.max_delay;
        }
        self.max_delay + self.max_delay.mul_f64(self.jitter_ratio)
    }
}

/// `min(base × 2^attempt, max)`
pub fn reconnect_delay(base: Duration, max: Duration, attempt: u32) -> Duration {
    2u32.checked_pow(attempt)
        .and_then(|factor| base.checked_mul(factor))
        .map_or(max, |delay| delay.min(max))
}

// =============================================================================
// State Machine
// =============================================================================

/// Connection state of the change feed watcher
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatcherState {
    Disconnected,
    Connecting,
    Streaming,
    ReconnectWait,
}

impl WatcherState {
    /// Whether invalidations are currently flowing
    pub fn is_live(&self) -> bool {
        matches!(self, WatcherState::Streaming)
    }
}

impl std::fmt::Display for WatcherState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            WatcherState::Disconnected => "DISCONNECTED",
            WatcherState::Connecting => "CONNECTING",
            WatcherState::Streaming => "STREAMING",
            WatcherState::ReconnectWait => "RECONNECT_WAIT",
        };
        f.write_str(name)
    }
}

/// Input to the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedSignal {
    Start,
    Connected,
    ConnectFailed,
    EventReceived,
    StreamError,
    StreamEnded,
    RetryElapsed,
    Stop,
}

/// Result of applying one signal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: WatcherState,
    pub to: WatcherState,
    /// Set when entering `ReconnectWait`: the un-jittered wait
    pub wait: Option<Duration>,
    /// Consecutive failed attempts so far
    pub attempt: u32,
}

impl Transition {
    pub fn changed(&self) -> bool {
        self.from != self.to
    }
}

/// Pure change feed state machine
#[derive(Debug, Clone)]
pub struct FeedStateMachine {
    state: WatcherState,
    attempt: u32,
    config: ChangeFeedConfig,
}

impl FeedStateMachine {
    pub fn new(config: ChangeFeedConfig) -> Self {
        Self {
            state: WatcherState::Disconnected,
            attempt: 0,
            config,
        }
    }

    pub fn state(&self) -> WatcherState {
        self.state
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn apply(&mut self, signal: FeedSignal) -> Transition {
        use FeedSignal as S;
        use WatcherState as W;

        let from = self.state;
        let mut wait = None;

        let to = match (from, signal) {
            (_, S::Stop) => W::Disconnected,
            (W::Disconnected, S::Start) => W::Connecting,
            (W::Connecting, S::Connected) => W::Streaming,
            (W::Connecting, S::ConnectFailed)
            | (W::Streaming, S::StreamError)
            | (W::Streaming, S::StreamEnded) => {
                wait = Some(self.config.delay(self.attempt));
                self.attempt = self.attempt.saturating_add(1);
                W::ReconnectWait
            }
            (W::Streaming, S::EventReceived) => {
                self.attempt = 0;
                W::Streaming
            }
            (W::ReconnectWait, S::RetryElapsed) => W::Connecting,
            (state, _) => state,
        };

        self.state = to;
        Transition {
            from,
            to,
            wait,
            attempt: self.attempt,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ChangeFeedConfig {
        ChangeFeedConfig {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter_ratio: 0.0,
        }
    }

    #[test]
    fn test_delay_doubles_and_caps() {
        let cfg = config();
        let delays: Vec<_> = (0..7).map(|a| cfg.delay(a).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30]);
        // Huge attempts saturate at the cap instead of overflowing
        assert_eq!(cfg.delay(200), Duration::from_secs(30));
    }

    #[test]
    fn test_jitter_stays_within_ratio() {
        let cfg = ChangeFeedConfig {
            jitter_ratio: 0.2,
            ..config()
        };
        for _ in 0..100 {
            let d = cfg.jittered(Duration::from_secs(10));
            assert!(d >= Duration::from_secs(8) && d <= Duration::from_secs(12));
        }
        assert_eq!(config().jittered(Duration::from_secs(10)), Duration::from_secs(10));
    }

    #[test]
    fn test_happy_path() {
        let mut machine = FeedStateMachine::new(config());
        assert_eq!(machine.state(), WatcherState::Disconnected);

        assert_eq!(machine.apply(FeedSignal::Start).to, WatcherState::Connecting);
        assert_eq!(machine.apply(FeedSignal::Connected).to, WatcherState::Streaming);
        let t = machine.apply(FeedSignal::EventReceived);
        assert_eq!(t.to, WatcherState::Streaming);
        assert!(!t.changed());
    }

    #[test]
    fn test_backoff_grows_until_an_event_arrives() {
        let mut machine = FeedStateMachine::new(config());
        machine.apply(FeedSignal::Start);

        let mut waits = Vec::new();
        for _ in 0..3 {
            let t = machine.apply(FeedSignal::ConnectFailed);
            assert_eq!(t.to, WatcherState::ReconnectWait);
            waits.push(t.wait.unwrap().as_secs());
            assert_eq!(machine.apply(FeedSignal::RetryElapsed).to, WatcherState::Connecting);
        }
        assert_eq!(waits, vec![1, 2, 4]);

        // Connecting alone does not reset the counter
        machine.apply(FeedSignal::Connected);
        assert_eq!(machine.attempt(), 3);
        let t = machine.apply(FeedSignal::StreamError);
        assert_eq!(t.wait, Some(Duration::from_secs(8)));

        machine.apply(FeedSignal::RetryElapsed);
        machine.apply(FeedSignal::Connected);
        machine.apply(FeedSignal::EventReceived);
        assert_eq!(machine.attempt(), 0);

        let t = machine.apply(FeedSignal::StreamEnded);
        assert_eq!(t.wait, Some(Duration::from_secs(1)));
    }

    #[test]
    fn test_stop_from_any_state() {
        for signals in [
            vec![],
            vec![FeedSignal::Start],
            vec![FeedSignal::Start, FeedSignal::Connected],
            vec![FeedSignal::Start, FeedSignal::ConnectFailed],
        ] {
            let mut machine = FeedStateMachine::new(config());
            for s in signals {
                machine.apply(s);
            }
            assert_eq!(machine.apply(FeedSignal::Stop).to, WatcherState::Disconnected);
        }
    }

    #[test]
    fn test_irrelevant_signals_are_ignored() {
        let mut machine = FeedStateMachine::new(config());
        let t = machine.apply(FeedSignal::EventReceived);
        assert_eq!(t.to, WatcherState::Disconnected);
        assert!(!t.changed());

        machine.apply(FeedSignal::Start);
        assert_eq!(machine.apply(FeedSignal::RetryElapsed).to, WatcherState::Connecting);
    }

    #[test]
    fn test_config_validation() {
        assert!(ChangeFeedConfig::default().validate().is_ok());
        let bad = ChangeFeedConfig {
            base_delay: Duration::from_secs(60),
            ..ChangeFeedConfig::default()
        };
        assert!(bad.validate().is_err());
        let bad = ChangeFeedConfig {
            jitter_ratio: 1.5,
            ..ChangeFeedConfig::default()
        };
        assert!(bad.validate().is_err());
    }
}
