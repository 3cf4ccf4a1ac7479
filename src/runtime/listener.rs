//! Passive listening socket.

use crate::runtime::notifier::Notifier;
use mio::net::{TcpListener, TcpStream};
use mio::{Interest, Token};
use std::io;
use std::net::SocketAddr;
use thiserror::Error;

/// The listening socket could not be set up. Fatal at startup.
#[derive(Debug, Error)]
#[error("failed to bind {addr}: {source}")]
pub struct BindError {
    pub addr: SocketAddr,
    #[source]
    pub source: io::Error,
}

/// A single accept attempt failed. The listener keeps serving.
#[derive(Debug, Error)]
#[error("accept failed: {0}")]
pub struct AcceptError(#[from] pub io::Error);

pub struct Listener {
    inner: TcpListener,
    local_addr: SocketAddr,
    /// Accept attempts that fail before touching the socket.
    #[cfg(test)]
    failures: std::cell::Cell<usize>,
}

impl Listener {
    /// Bind a non-blocking listening socket on `addr`.
    pub fn bind(addr: SocketAddr) -> Result<Self, BindError> {
        let bind_err = |source| BindError { addr, source };

        let inner = TcpListener::from_std(create_listener(addr).map_err(bind_err)?);
        let local_addr = inner.local_addr().map_err(bind_err)?;
        Ok(Self {
            inner,
            local_addr,
            #[cfg(test)]
            failures: std::cell::Cell::new(0),
        })
    }

    /// Address actually bound, with the port filled in when 0 was requested.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn register(&mut self, notifier: &Notifier, token: Token) -> io::Result<()> {
        notifier.register(&mut self.inner, token, Interest::READABLE)
    }

    /// Accept one pending connection without blocking.
    ///
    /// `Ok(None)` means nothing is pending.
    pub fn accept(&self) -> Result<Option<(TcpStream, SocketAddr)>, AcceptError> {
        if self.take_failure() {
            return Err(io::Error::other("simulated accept failure").into());
        }

        loop {
            match self.inner.accept() {
                Ok(pair) => return Ok(Some(pair)),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }
}

#[cfg(test)]
impl Listener {
    /// Make the next `n` accept attempts fail, leaving pending connections queued.
    pub(crate) fn fail_next_accepts(&self, n: usize) {
        self.failures.set(n);
    }

    fn take_failure(&self) -> bool {
        let left = self.failures.get();
        if left > 0 {
            self.failures.set(left - 1);
        }
        left > 0
    }
}

#[cfg(not(test))]
impl Listener {
    #[inline(always)]
    fn take_failure(&self) -> bool {
        false
    }
}

/// Create a non-blocking TCP listener with SO_REUSEADDR.
fn create_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        socket2::Domain::for_address(addr),
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;

    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_ephemeral_port() {
        let listener = Listener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        assert_ne!(listener.local_addr().port(), 0);
        assert!(listener.accept().unwrap().is_none());
    }

    #[test]
    fn test_bind_in_use() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = taken.local_addr().unwrap();

        let err = Listener::bind(addr).err().unwrap();
        assert_eq!(err.addr, addr);
        assert_eq!(err.source.kind(), io::ErrorKind::AddrInUse);
    }

    #[test]
    fn test_failed_accept_leaves_connection_queued() {
        let listener = Listener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let _client = std::net::TcpStream::connect(listener.local_addr()).unwrap();

        listener.fail_next_accepts(1);
        assert!(listener.accept().is_err());

        let mut accepted = false;
        for _ in 0..100 {
            if listener.accept().unwrap().is_some() {
                accepted = true;
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        assert!(accepted);
    }

    #[test]
    fn test_accept_pending_connection() {
        let listener = Listener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let client = std::net::TcpStream::connect(listener.local_addr()).unwrap();

        // The handshake completes in the kernel; poll until it is queued.
        let mut accepted = None;
        for _ in 0..100 {
            if let Some(pair) = listener.accept().unwrap() {
                accepted = Some(pair);
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }

        let (_, peer) = accepted.expect("connection was not accepted");
        assert_eq!(peer, client.local_addr().unwrap());
    }
}
