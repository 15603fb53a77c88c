//! Netstring transport to the database proxy.
//!
//! Requests and responses travel as typed netstring frames, `(code, payload)` pairs framed
//! as `<length>:<code> <payload>,`. Frames with code `0` are containers whose payload is
//! itself a run of netstrings; they are flattened left to right on the way in.
//!
//! # Key Components
//!
//! - [`codec`]: encoding, a full-buffer parser and a restartable streaming [`Decoder`].
//! - [`NetstringConnection`]: buffered writes with optional container nesting, and a
//!   queue-backed `read()` that never blocks on the socket itself.
//! - [`pump`]: the one background reader per connection feeding that queue.
//!
//! # Failure Model
//!
//! When the socket dies the pump hands the error to one waiting reader and records it, so
//! later readers fail fast instead of waiting out the timeout. The next read replaces the
//! pump (re-dialing the peer when the connection was opened with
//! [`NetstringConnection::connect`]). Timeouts are reported as
//! [`ConnectionError::Timeout`], never as an empty frame.
pub mod codec;
pub mod codes;
mod connection;
pub mod pump;

pub use codec::{Decoder, Frame, ParseError};
pub use codes::Protocol;
pub use connection::{ConnectionError, DEFAULT_READ_TIMEOUT, NetStream, NetstringConnection};
pub use pump::PumpError;
