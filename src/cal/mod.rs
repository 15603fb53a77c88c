//! CAL logging client.
//!
//! CAL records (events, heartbeats, transactions, SQL statements) are short text lines
//! behind a 12 byte binary header, streamed to a local logging daemon over TCP.
//!
//! # Key Components
//!
//! - [`CalClient`]: the object application code logs through. It is created explicitly,
//!   there is no process wide instance.
//! - [`Transaction`]: scope guard reporting a timed span with its outcome.
//! - [`message`]: record kinds, text bodies and the binary framing.
//! - [`sender`]: the background connection to the daemon.
//! - [`aliaser`] and [`overflow`]: squeezing any number of concurrent callers into the
//!   16 bits of caller identity the header has room for.
//!
//! # Example
//! ```rust,no_run
//! use hera_client::{cal::CalClient, config::ClientConfig};
//!
//! let client = CalClient::new(ClientConfig::default())?;
//! client.event("URL", "home", "0", "user=42");
//! {
//!     let mut t = client.trans("ORACLE", "select_user");
//!     t.add_data("rows", 1);
//! }
//! client.close();
//! # Ok::<(), std::io::Error>(())
//! ```
pub mod aliaser;
mod client;
pub mod corr_id;
pub mod message;
pub mod overflow;
pub mod sender;
mod transaction;

pub use client::CalClient;
pub use corr_id::{CorrelationIdProvider, FixedCorrelationId, HashedCorrelationIds};
pub use message::{CalFrame, Message, MessageError, MessageKind, Status};
pub use sender::{FrameSink, MemorySink, NullSink, SocketSender};
pub use transaction::{Cancelled, EXCEPTION_STATUS, StatusError, Transaction};
