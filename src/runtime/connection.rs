//! Connection state machine for the line-reversal protocol.
//!
//! Each connection owns its socket, two small fixed-size buffers and the
//! bytes of the line collected so far. [`Connection::drive`] runs the machine
//! until the socket would block, then reports which readiness it waits for.

use slab::Slab;
use std::io::{self, Read, Write};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::trace;

/// Current state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Waiting for the socket to become readable.
    Reading,
    /// Scanning the read buffer for a line terminator.
    ProcessingRead,
    /// Moving reversed bytes from the pending line into the write buffer.
    ProcessingWrite,
    /// Waiting for the socket to become writable.
    Writing,
    /// Terminal. The socket is released when the connection is dropped.
    Closed,
}

/// Readiness a suspended connection is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wait {
    Readable,
    Writable,
}

/// Reasons a connection moves to [`ConnState::Closed`].
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("peer closed the connection")]
    PeerClosed,
    #[error("write returned 0")]
    WriteZero,
    #[error("line exceeds {limit} bytes without a terminator")]
    OversizedLine { limit: usize },
    #[error("connection already closed")]
    Closed,
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Buffer sizing shared by every connection of a server.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionSettings {
    pub read_buffer_size: usize,
    pub write_buffer_size: usize,
    /// Longest line accepted, terminator included. `None` disables the check.
    pub max_line_length: Option<usize>,
}

impl From<&crate::config::Config> for ConnectionSettings {
    fn from(config: &crate::config::Config) -> Self {
        Self {
            read_buffer_size: config.read_buffer_size,
            write_buffer_size: config.write_buffer_size,
            max_line_length: config.max_line_length,
        }
    }
}

/// Fixed-capacity byte buffer.
///
/// Bytes are appended at `end` and consumed from `start`; once everything is
/// consumed the buffer is cleared and both marks return to zero.
#[derive(Debug)]
struct FixedBuf {
    data: Box<[u8]>,
    start: usize,
    end: usize,
}

impl FixedBuf {
    fn new(capacity: usize) -> Self {
        debug_assert!(capacity > 0, "buffer capacity must be non-zero");
        Self {
            data: vec![0u8; capacity].into_boxed_slice(),
            start: 0,
            end: 0,
        }
    }

    fn pending(&self) -> &[u8] {
        &self.data[self.start..self.end]
    }

    fn spare_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.end..]
    }

    /// Mark `n` bytes of the spare region as filled.
    fn commit(&mut self, n: usize) {
        self.end += n;
    }

    /// Mark `n` pending bytes as consumed.
    fn advance(&mut self, n: usize) {
        self.start += n;
    }

    fn push(&mut self, byte: u8) {
        self.data[self.end] = byte;
        self.end += 1;
    }

    fn pop_front(&mut self) -> Option<u8> {
        if self.start == self.end {
            return None;
        }
        let byte = self.data[self.start];
        self.start += 1;
        Some(byte)
    }

    fn is_full(&self) -> bool {
        self.end == self.data.len()
    }

    fn is_empty(&self) -> bool {
        self.start == self.end
    }

    fn clear(&mut self) {
        self.start = 0;
        self.end = 0;
    }
}

/// A line ends at CR or LF.
pub fn is_terminator(byte: u8) -> bool {
    byte == b'\r' || byte == b'\n'
}

/// Remove and return the next byte of the reversed output.
///
/// Takes the second-to-last byte while more than one remains, so the
/// terminator stays in place and comes out last.
pub fn next_reversed_byte(line: &mut Vec<u8>) -> Option<u8> {
    match line.len() {
        0 => None,
        1 => line.pop(),
        n => Some(line.remove(n - 2)),
    }
}

/// A single client connection.
#[derive(Debug)]
pub struct Connection<S> {
    stream: S,
    state: ConnState,
    read_buf: FixedBuf,
    write_buf: FixedBuf,
    line: Vec<u8>,
    max_line_length: Option<usize>,
    /// Interest currently registered with the notifier.
    registered: Option<Wait>,
    last_active: Instant,
    lines: u64,
}

impl<S: Read + Write> Connection<S> {
    /// Create a new connection in the initial reading state.
    pub fn new(stream: S, settings: ConnectionSettings) -> Self {
        Self {
            stream,
            state: ConnState::Reading,
            read_buf: FixedBuf::new(settings.read_buffer_size),
            write_buf: FixedBuf::new(settings.write_buffer_size),
            line: Vec::new(),
            max_line_length: settings.max_line_length,
            registered: None,
            last_active: Instant::now(),
            lines: 0,
        }
    }

    /// Run the state machine until the socket would block.
    ///
    /// Any error leaves the connection in [`ConnState::Closed`]; the caller
    /// is expected to deregister and drop it.
    pub fn drive(&mut self) -> Result<Wait, ConnectionError> {
        let result = self.run();
        if result.is_err() {
            self.state = ConnState::Closed;
        }
        result
    }

    fn run(&mut self) -> Result<Wait, ConnectionError> {
        loop {
            match self.state {
                ConnState::Reading => {
                    debug_assert!(self.read_buf.is_empty());
                    match self.stream.read(self.read_buf.spare_mut()) {
                        Ok(0) => return Err(ConnectionError::PeerClosed),
                        Ok(n) => {
                            self.read_buf.commit(n);
                            self.last_active = Instant::now();
                            self.state = ConnState::ProcessingRead;
                        }
                        Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                            return Ok(Wait::Readable);
                        }
                        Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                        Err(e) => return Err(e.into()),
                    }
                }
                ConnState::ProcessingRead => self.process_read()?,
                ConnState::ProcessingWrite => self.process_write(),
                ConnState::Writing => match self.stream.write(self.write_buf.pending()) {
                    Ok(0) => return Err(ConnectionError::WriteZero),
                    Ok(n) => {
                        self.write_buf.advance(n);
                        self.last_active = Instant::now();
                        if self.write_buf.is_empty() {
                            self.write_buf.clear();
                            self.state = ConnState::ProcessingWrite;
                        }
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                        return Ok(Wait::Writable);
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) => return Err(e.into()),
                },
                ConnState::Closed => return Err(ConnectionError::Closed),
            }
        }
    }

    fn process_read(&mut self) -> Result<(), ConnectionError> {
        while let Some(byte) = self.read_buf.pop_front() {
            self.line.push(byte);
            if is_terminator(byte) {
                self.lines += 1;
                trace!(len = self.line.len(), "Line complete");
                self.state = ConnState::ProcessingWrite;
                return Ok(());
            }
            if let Some(limit) = self.max_line_length {
                if self.line.len() >= limit {
                    return Err(ConnectionError::OversizedLine { limit });
                }
            }
        }
        self.read_buf.clear();
        self.state = ConnState::Reading;
        Ok(())
    }

    fn process_write(&mut self) {
        if self.line.is_empty() {
            // Bytes after the terminator may still be in the read buffer.
            self.state = ConnState::ProcessingRead;
            return;
        }
        while !self.write_buf.is_full() {
            match next_reversed_byte(&mut self.line) {
                Some(byte) => self.write_buf.push(byte),
                None => break,
            }
        }
        self.state = ConnState::Writing;
    }
}

impl<S> Connection<S> {
    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn stream_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    pub fn registered(&self) -> Option<Wait> {
        self.registered
    }

    pub fn set_registered(&mut self, wait: Wait) {
        self.registered = Some(wait);
    }

    /// Number of complete lines received.
    pub fn lines(&self) -> u64 {
        self.lines
    }

    /// Time since the last successful read or write.
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_active)
    }
}

/// Registry of active connections using slab allocation.
///
/// Slab keys double as notifier tokens.
pub struct ConnectionRegistry<S> {
    connections: Slab<Connection<S>>,
    max_connections: usize,
}

impl<S> ConnectionRegistry<S> {
    /// Create a new registry with specified maximum capacity.
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: Slab::with_capacity(max_connections),
            max_connections,
        }
    }

    /// Insert a new connection into the registry.
    ///
    /// Hands the connection back if the registry is at capacity.
    pub fn insert(&mut self, conn: Connection<S>) -> Result<usize, Connection<S>> {
        if self.connections.len() >= self.max_connections {
            return Err(conn);
        }
        Ok(self.connections.insert(conn))
    }

    pub fn get_mut(&mut self, id: usize) -> Option<&mut Connection<S>> {
        self.connections.get_mut(id)
    }

    pub fn remove(&mut self, id: usize) -> Option<Connection<S>> {
        self.connections.try_remove(id)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Ids of connections idle for longer than `timeout`.
    pub fn idle_ids(&self, now: Instant, timeout: Duration) -> Vec<usize> {
        self.connections
            .iter()
            .filter(|(_, conn)| conn.idle_for(now) > timeout)
            .map(|(id, _)| id)
            .collect()
    }

    /// Ids of every active connection.
    pub fn ids(&self) -> Vec<usize> {
        self.connections.iter().map(|(id, _)| id).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    #[derive(Debug)]
    enum ReadStep {
        Data(Vec<u8>),
        WouldBlock,
        Interrupted,
        Eof,
    }

    /// In-memory stream with a scripted read side and a throttled write side.
    #[derive(Debug)]
    struct ScriptedStream {
        reads: VecDeque<ReadStep>,
        written: Vec<u8>,
        /// Bytes accepted before writes start to block.
        write_budget: usize,
        write_zero: bool,
    }

    impl ScriptedStream {
        fn new() -> Self {
            Self {
                reads: VecDeque::new(),
                written: Vec::new(),
                write_budget: usize::MAX,
                write_zero: false,
            }
        }

        fn data(mut self, bytes: &[u8]) -> Self {
            self.reads.push_back(ReadStep::Data(bytes.to_vec()));
            self
        }

        fn then(mut self, step: ReadStep) -> Self {
            self.reads.push_back(step);
            self
        }
    }

    impl Read for ScriptedStream {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.reads.pop_front() {
                Some(ReadStep::Data(mut data)) => {
                    let n = data.len().min(buf.len());
                    buf[..n].copy_from_slice(&data[..n]);
                    if n < data.len() {
                        self.reads.push_front(ReadStep::Data(data.split_off(n)));
                    }
                    Ok(n)
                }
                Some(ReadStep::Interrupted) => Err(io::ErrorKind::Interrupted.into()),
                Some(ReadStep::Eof) => Ok(0),
                Some(ReadStep::WouldBlock) | None => Err(io::ErrorKind::WouldBlock.into()),
            }
        }
    }

    impl Write for ScriptedStream {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.write_zero {
                return Ok(0);
            }
            if self.write_budget == 0 {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let n = buf.len().min(self.write_budget);
            self.written.extend_from_slice(&buf[..n]);
            self.write_budget -= n;
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn settings() -> ConnectionSettings {
        ConnectionSettings {
            read_buffer_size: 4,
            write_buffer_size: 5,
            max_line_length: None,
        }
    }

    fn reverse_all(input: &[u8]) -> Vec<u8> {
        let mut conn = Connection::new(ScriptedStream::new().data(input), settings());
        assert_eq!(conn.drive().unwrap(), Wait::Readable);
        conn.stream_mut().written.clone()
    }

    #[test]
    fn test_positional_rule() {
        let mut line = b"ab\n".to_vec();
        let order: Vec<u8> = std::iter::from_fn(|| next_reversed_byte(&mut line)).collect();
        assert_eq!(order, b"ba\n");
        assert!(line.is_empty());
    }

    #[test]
    fn test_reverses_lines() {
        assert_eq!(reverse_all(b"hello\n"), b"olleh\n");
        assert_eq!(reverse_all(b"ab\n"), b"ba\n");
        assert_eq!(reverse_all(b"a\r"), b"a\r");
        assert_eq!(reverse_all(b"\n"), b"\n");
    }

    #[test]
    fn test_multiple_lines_in_one_read() {
        assert_eq!(reverse_all(b"ab\ncd\rxyz\n"), b"ba\ndc\rzyx\n");
        // CR LF is two lines, the second one empty.
        assert_eq!(reverse_all(b"abc\r\n"), b"cba\r\n");
    }

    #[test]
    fn test_reversing_twice_restores_line() {
        let once = reverse_all(b"the quick brown fox\n");
        assert_eq!(reverse_all(&once), b"the quick brown fox\n");
    }

    #[test]
    fn test_output_independent_of_chunking() {
        let input = b"a longer line than any buffer\nand one more\r";

        let mut stream = ScriptedStream::new();
        for byte in input {
            stream = stream.data(&[*byte]).then(ReadStep::WouldBlock);
        }
        let mut conn = Connection::new(stream, settings());
        for _ in 0..input.len() {
            assert_eq!(conn.drive().unwrap(), Wait::Readable);
        }

        assert_eq!(conn.stream_mut().written, reverse_all(input));
        assert_eq!(conn.lines(), 2);
    }

    #[test]
    fn test_partial_line_waits_for_more() {
        let mut conn = Connection::new(
            ScriptedStream::new().data(b"abc").then(ReadStep::WouldBlock).data(b"d\n"),
            settings(),
        );

        assert_eq!(conn.drive().unwrap(), Wait::Readable);
        assert_eq!(conn.state(), ConnState::Reading);
        assert!(conn.stream_mut().written.is_empty());

        assert_eq!(conn.drive().unwrap(), Wait::Readable);
        assert_eq!(conn.stream_mut().written, b"dcba\n");
    }

    #[test]
    fn test_eof_mid_line_writes_nothing() {
        let mut conn = Connection::new(
            ScriptedStream::new().data(b"abc").then(ReadStep::Eof),
            settings(),
        );

        assert!(matches!(conn.drive(), Err(ConnectionError::PeerClosed)));
        assert_eq!(conn.state(), ConnState::Closed);
        assert!(conn.stream_mut().written.is_empty());
        assert!(matches!(conn.drive(), Err(ConnectionError::Closed)));
    }

    #[test]
    fn test_write_backpressure() {
        let mut stream = ScriptedStream::new().data(b"hello\n");
        stream.write_budget = 3;
        let mut conn = Connection::new(stream, settings());

        assert_eq!(conn.drive().unwrap(), Wait::Writable);
        assert_eq!(conn.state(), ConnState::Writing);
        assert_eq!(conn.stream_mut().written, b"oll");

        conn.stream_mut().write_budget = usize::MAX;
        assert_eq!(conn.drive().unwrap(), Wait::Readable);
        assert_eq!(conn.stream_mut().written, b"olleh\n");
    }

    #[test]
    fn test_write_zero_closes() {
        let mut stream = ScriptedStream::new().data(b"hi\n");
        stream.write_zero = true;
        let mut conn = Connection::new(stream, settings());

        assert!(matches!(conn.drive(), Err(ConnectionError::WriteZero)));
        assert_eq!(conn.state(), ConnState::Closed);
    }

    #[test]
    fn test_interrupted_read_is_retried() {
        let mut conn = Connection::new(
            ScriptedStream::new().then(ReadStep::Interrupted).data(b"ab\n"),
            settings(),
        );
        assert_eq!(conn.drive().unwrap(), Wait::Readable);
        assert_eq!(conn.stream_mut().written, b"ba\n");
    }

    #[test]
    fn test_oversized_line() {
        let limited = ConnectionSettings {
            max_line_length: Some(4),
            ..settings()
        };

        let mut conn = Connection::new(ScriptedStream::new().data(b"abcde"), limited);
        assert!(matches!(
            conn.drive(),
            Err(ConnectionError::OversizedLine { limit: 4 })
        ));
        assert!(conn.stream_mut().written.is_empty());

        // Exactly at the limit, terminator included.
        let mut conn = Connection::new(ScriptedStream::new().data(b"abc\n"), limited);
        assert_eq!(conn.drive().unwrap(), Wait::Readable);
        assert_eq!(conn.stream_mut().written, b"cba\n");
    }

    #[test]
    fn test_connection_registry() {
        let mut registry = ConnectionRegistry::new(2);

        let id1 = registry
            .insert(Connection::new(ScriptedStream::new(), settings()))
            .unwrap();
        let id2 = registry
            .insert(Connection::new(ScriptedStream::new(), settings()))
            .unwrap();

        // At capacity
        assert!(registry
            .insert(Connection::new(ScriptedStream::new(), settings()))
            .is_err());

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.ids(), vec![id1, id2]);

        registry.remove(id1);
        assert!(registry.get_mut(id1).is_none());
        assert!(registry.remove(id1).is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_idle_ids() {
        let mut registry = ConnectionRegistry::new(4);
        let id = registry
            .insert(Connection::new(ScriptedStream::new(), settings()))
            .unwrap();

        let now = Instant::now();
        assert!(registry.idle_ids(now, Duration::from_secs(60)).is_empty());

        let later = now + Duration::from_secs(61);
        assert_eq!(registry.idle_ids(later, Duration::from_secs(60)), vec![id]);
    }
}
