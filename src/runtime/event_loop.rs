//! Single-threaded scheduler loop.
//!
//! Readiness-based model: the notifier tells us which sockets are ready,
//! then each ready connection runs its state machine until the socket would
//! block again. Nothing else in the loop blocks.

use crate::config::Config;
use crate::runtime::connection::{
    Connection, ConnectionError, ConnectionRegistry, ConnectionSettings, Wait,
};
use crate::runtime::listener::Listener;
use crate::runtime::notifier::{Notifier, NotifierError, Readiness};
use crate::runtime::ServerError;
use mio::net::TcpStream;
use mio::{Interest, Token, Waker};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

const LISTENER_TOKEN: Token = Token(usize::MAX);
const SHUTDOWN_TOKEN: Token = Token(usize::MAX - 1);

/// Shortest wait between idle sweeps.
const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(10);

/// Wait bound while connections may be queued behind a failed accept.
const ACCEPT_RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// Asks a running [`Server`] to stop from another thread.
#[derive(Clone)]
pub struct ShutdownHandle {
    waker: Arc<Waker>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        if let Err(e) = self.waker.wake() {
            error!(error = %e, "Failed to wake event loop for shutdown");
        }
    }
}

pub struct Server {
    notifier: Notifier,
    listener: Listener,
    connections: ConnectionRegistry<TcpStream>,
    settings: ConnectionSettings,
    idle_timeout: Option<Duration>,
    events_capacity: usize,
    waker: Arc<Waker>,
    /// An accept failed, so the listen queue may hold connections that no
    /// new readiness event will report.
    accept_pending: bool,
}

impl Server {
    /// Bind the listener and set up the notifier. Nothing is served until
    /// [`Server::run`] is called.
    pub fn bind(config: &Config) -> Result<Self, ServerError> {
        let notifier = Notifier::new(config.events_capacity)?;
        let mut listener = Listener::bind(config.listen)?;
        listener
            .register(&notifier, LISTENER_TOKEN)
            .map_err(NotifierError)?;
        let waker = Arc::new(notifier.waker(SHUTDOWN_TOKEN)?);

        info!(
            addr = %listener.local_addr(),
            read_buffer = config.read_buffer_size,
            write_buffer = config.write_buffer_size,
            max_line = ?config.max_line_length,
            max_connections = config.max_connections,
            "Listening"
        );

        Ok(Self {
            notifier,
            listener,
            connections: ConnectionRegistry::new(config.max_connections),
            settings: ConnectionSettings::from(config),
            idle_timeout: config.idle_timeout,
            events_capacity: config.events_capacity,
            waker,
            accept_pending: false,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.listener.local_addr()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            waker: Arc::clone(&self.waker),
        }
    }

    /// Serve connections until shut down or the notifier fails.
    pub fn run(mut self) -> Result<(), ServerError> {
        let mut ready: Vec<Readiness> = Vec::with_capacity(self.events_capacity);
        let sweep = self
            .idle_timeout
            .map(|idle| (idle / 2).max(MIN_SWEEP_INTERVAL));

        loop {
            let retry_accept = self.accept_pending;
            let timeout = if retry_accept {
                Some(sweep.map_or(ACCEPT_RETRY_INTERVAL, |t| t.min(ACCEPT_RETRY_INTERVAL)))
            } else {
                sweep
            };

            ready.clear();
            self.notifier.wait(&mut ready, timeout)?;

            let mut stopping = false;
            for event in &ready {
                match event.token {
                    LISTENER_TOKEN => self.accept_connections(),
                    SHUTDOWN_TOKEN => stopping = true,
                    Token(conn_id) => {
                        trace!(
                            conn_id,
                            readable = event.readable,
                            writable = event.writable,
                            closed = event.closed,
                            "Ready"
                        );
                        self.drive_connection(conn_id);
                    }
                }
            }

            // Edge-triggered: the listener will not report the queue again.
            if retry_accept && self.accept_pending {
                self.accept_connections();
            }

            if stopping {
                self.close_all();
                info!("Server stopped");
                return Ok(());
            }

            if let Some(idle) = self.idle_timeout {
                self.reap_idle(idle);
            }
        }
    }

    fn accept_connections(&mut self) {
        self.accept_pending = false;
        loop {
            let (mut stream, peer) = match self.listener.accept() {
                Ok(Some(pair)) => pair,
                Ok(None) => break,
                Err(e) => {
                    error!(error = %e, "Accept error");
                    self.accept_pending = true;
                    break;
                }
            };

            if let Err(e) = stream.set_nodelay(true) {
                debug!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
            }

            let conn_id = match self
                .connections
                .insert(Connection::new(stream, self.settings))
            {
                Ok(id) => id,
                Err(_) => {
                    // Dropping the rejected connection closes its socket.
                    warn!(peer = %peer, "Connection limit reached");
                    continue;
                }
            };

            let registered = match self.connections.get_mut(conn_id) {
                Some(conn) => set_interest(&self.notifier, conn, Token(conn_id), Wait::Readable),
                None => continue,
            };
            if let Err(e) = registered {
                error!(conn_id, error = %e, "Failed to register connection");
                self.connections.remove(conn_id);
                continue;
            }

            debug!(conn_id, peer = %peer, "Accepted connection");
        }
    }

    fn drive_connection(&mut self, conn_id: usize) {
        // Closed earlier in this batch.
        let Some(conn) = self.connections.get_mut(conn_id) else {
            return;
        };

        let result = conn.drive().and_then(|wait| {
            set_interest(&self.notifier, conn, Token(conn_id), wait).map_err(ConnectionError::Io)
        });

        match result {
            Ok(()) => {}
            Err(ConnectionError::PeerClosed) => {
                debug!(conn_id, "Connection closed by peer");
                self.close_connection(conn_id);
            }
            Err(e) => {
                debug!(conn_id, error = %e, "Connection error");
                self.close_connection(conn_id);
            }
        }
    }

    fn reap_idle(&mut self, idle: Duration) {
        for conn_id in self.connections.idle_ids(Instant::now(), idle) {
            info!(conn_id, timeout = ?idle, "Closing idle connection");
            self.close_connection(conn_id);
        }
    }

    fn close_all(&mut self) {
        if self.connections.is_empty() {
            return;
        }
        info!(count = self.connections.len(), "Closing open connections");
        for conn_id in self.connections.ids() {
            self.close_connection(conn_id);
        }
    }

    fn close_connection(&mut self, conn_id: usize) {
        if let Some(mut conn) = self.connections.remove(conn_id) {
            if conn.registered().is_some() {
                if let Err(e) = self.notifier.deregister(conn.stream_mut()) {
                    debug!(conn_id, error = %e, "Failed to deregister connection");
                }
            }
            debug!(conn_id, lines = conn.lines(), "Connection closed");
        }
    }
}

fn interest(wait: Wait) -> Interest {
    match wait {
        Wait::Readable => Interest::READABLE,
        Wait::Writable => Interest::WRITABLE,
    }
}

/// Keep exactly one interest registered, matching what the connection waits for.
fn set_interest(
    notifier: &Notifier,
    conn: &mut Connection<TcpStream>,
    token: Token,
    wait: Wait,
) -> std::io::Result<()> {
    match conn.registered() {
        Some(current) if current == wait => return Ok(()),
        Some(_) => notifier.reregister(conn.stream_mut(), token, interest(wait))?,
        None => notifier.register(conn.stream_mut(), token, interest(wait))?,
    }
    conn.set_registered(wait);
    Ok(())
}
