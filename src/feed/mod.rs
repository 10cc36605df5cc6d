//! Change Feed Consumption
//!
//! - **Backoff** (`backoff.rs`) - Reconnect delay strategy and the pure
//!   connection state machine
//! - **Watcher** (`watcher.rs`) - Background task turning change events into
//!   cascade invalidations

pub mod backoff;
pub mod watcher;

pub use backoff::{
    reconnect_delay, ChangeFeedConfig, FeedSignal, FeedStateMachine, Transition, WatcherState,
};
pub use watcher::{ChangeFeedWatcher, WatcherStats};
