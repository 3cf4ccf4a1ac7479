//! Readiness notifier.
//!
//! Thin wrapper over `mio::Poll` (epoll on Linux, kqueue on macOS). Waiting
//! here is the only blocking call the server makes. The notifier routes
//! events by token and owns none of the sockets registered with it.

use mio::event::Source;
use mio::{Events, Interest, Poll, Token, Waker};
use std::io;
use std::time::Duration;
use thiserror::Error;

/// The readiness primitive itself failed. Nothing can make progress after this.
#[derive(Debug, Error)]
#[error("readiness notifier failed: {0}")]
pub struct NotifierError(#[from] pub io::Error);

/// One ready handle from a wait batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Readiness {
    pub token: Token,
    pub readable: bool,
    pub writable: bool,
    /// Error or hang-up reported alongside the readiness.
    pub closed: bool,
}

pub struct Notifier {
    poll: Poll,
    events: Events,
}

impl Notifier {
    /// Create a notifier that reports at most `capacity` events per wait.
    pub fn new(capacity: usize) -> Result<Self, NotifierError> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(capacity),
        })
    }

    /// Start watching `source` for `interest`.
    pub fn register<S>(&self, source: &mut S, token: Token, interest: Interest) -> io::Result<()>
    where
        S: Source + ?Sized,
    {
        self.poll.registry().register(source, token, interest)
    }

    /// Replace the interest of an already registered `source`.
    pub fn reregister<S>(&self, source: &mut S, token: Token, interest: Interest) -> io::Result<()>
    where
        S: Source + ?Sized,
    {
        self.poll.registry().reregister(source, token, interest)
    }

    pub fn deregister<S>(&self, source: &mut S) -> io::Result<()>
    where
        S: Source + ?Sized,
    {
        self.poll.registry().deregister(source)
    }

    /// Create a waker that produces an event for `token` from another thread.
    pub fn waker(&self, token: Token) -> Result<Waker, NotifierError> {
        Ok(Waker::new(self.poll.registry(), token)?)
    }

    /// Block until at least one handle is ready or `timeout` elapses.
    ///
    /// The whole batch is appended to `ready`. A signal interrupting the
    /// wait yields an empty batch rather than an error.
    pub fn wait(
        &mut self,
        ready: &mut Vec<Readiness>,
        timeout: Option<Duration>,
    ) -> Result<(), NotifierError> {
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(e.into()),
        }

        ready.extend(self.events.iter().map(|event| Readiness {
            token: event.token(),
            readable: event.is_readable(),
            writable: event.is_writable(),
            closed: event.is_error() || event.is_read_closed() || event.is_write_closed(),
        }));
        Ok(())
    }
}
