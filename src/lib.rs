pub mod cal;
pub mod config;
pub mod netstring;

pub use cal::{CalClient, Transaction};
pub use config::{ClientConfig, ConfigError};
pub use netstring::{ConnectionError, Frame, NetstringConnection, ParseError};
