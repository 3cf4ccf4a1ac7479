//! line-reverser: a single-threaded TCP line-reversal server
//!
//! Every line a client sends (ending at CR or LF) is written back with its
//! content reversed and the terminator left in place. All clients are served
//! from one thread driven by readiness notifications.
//!
//! Features:
//! - Explicit per-connection state machine over non-blocking sockets
//! - Small fixed-size buffers per connection
//! - Bounded line length and optional idle timeout
//! - Configuration via CLI arguments or TOML file

pub mod config;
pub mod runtime;
