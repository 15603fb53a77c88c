//! Reserved netstring codes shared with the proxy.

/// Frame whose payload is a sequence of nested netstrings.
pub const CONTAINER: u32 = 0;

pub const SERVER_CHALLENGE: u32 = 1001;
pub const SERVER_CONNECTION_ACCEPTED: u32 = 1002;
pub const SERVER_CONNECTION_REJECTED_PROTOCOL: u32 = 1003;
pub const SERVER_CONNECTION_REJECTED_UNKNOWN_USER: u32 = 1004;
pub const SERVER_CONNECTION_REJECTED_FAILED_AUTH: u32 = 1005;
pub const SERVER_PING_COMMAND: u32 = 1008;
/// Keep-alive sent by the server while a request is in flight.
pub const SERVER_ALIVE: u32 = 1009;
pub const SERVER_CONNECTION_REJECTED_CLIENT_TIME: u32 = 1010;

pub const CLIENT_PROTOCOL_NAME_NOAUTH: u32 = 2001;
pub const CLIENT_PROTOCOL_NAME: u32 = 2002;
pub const CLIENT_USERNAME: u32 = 2003;
pub const CLIENT_CHALLENGE_RESPONSE: u32 = 2004;
pub const CLIENT_CURRENT_CLIENT_TIME: u32 = 2005;
pub const CLIENT_CAL_CORRELATION_ID: u32 = 2006;

/// Protocol variant spoken over a connection.
///
/// Only the default proxy protocol swallows keep-alives; other variants expect to see them.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Protocol {
    #[default]
    Occ,
    Named(String),
}

impl Protocol {
    pub const OCC_NAME: &'static str = "occ 1";

    pub fn name(&self) -> &str {
        match self {
            Protocol::Occ => Self::OCC_NAME,
            Protocol::Named(name) => name,
        }
    }

    /// Whether a frame with `code` should reach readers.
    pub fn delivers(&self, code: u32) -> bool {
        code != SERVER_ALIVE || *self != Protocol::Occ
    }
}

impl From<&str> for Protocol {
    fn from(value: &str) -> Self {
        if value == Self::OCC_NAME {
            Protocol::Occ
        } else {
            Protocol::Named(value.to_string())
        }
    }
}
