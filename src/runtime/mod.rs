//! Single-threaded readiness-based runtime.
//!
//! Components, leaves first:
//! - `Notifier`: wraps epoll/kqueue through mio; the only blocking call
//! - `Listener`: passive socket producing new connections
//! - `Connection`: per-client line-reversal state machine
//! - `Server`: the scheduler loop tying them together

pub mod connection;
pub mod event_loop;
pub mod listener;
pub mod notifier;

pub use event_loop::{Server, ShutdownHandle};
pub use listener::{AcceptError, BindError};
pub use notifier::NotifierError;

use crate::config::Config;
use thiserror::Error;

/// Failures that stop the whole service.
///
/// Per-connection errors never surface here.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Bind(#[from] BindError),
    #[error(transparent)]
    Notifier(#[from] NotifierError),
}

/// Bind and serve until the notifier fails.
pub fn run(config: Config) -> Result<(), ServerError> {
    Server::bind(&config)?.run()
}
