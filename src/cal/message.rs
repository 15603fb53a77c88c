//! CAL binary message framing.
//!
//! Every message on the wire is a 12 byte block header followed by a text body:
//!
//! ```text
//! [thread id: u32 BE][seconds since epoch: u32 BE][body length: u32 BE][body]
//! ```
//!
//! The body starts with a one byte [`MessageKind`] tag, followed (for most kinds) by the
//! local time and tab separated fields, and always ends with `\r\n`. Newlines inside a body
//! are escaped before it is cut down to [`MAX_BODY_LEN`].
use std::fmt;

use bincode::{
    Decode, Encode,
    config::{BigEndian, Configuration, Fixint},
};
use chrono::{Local, Timelike, Utc};
use thiserror::Error;

/// Byte length of the block header.
pub const HEADER_LEN: usize = 12;
/// Offset of the kind tag inside a packed message.
pub const KIND_OFFSET: usize = HEADER_LEN;
/// Longest body kept before the trailing `\r\n`.
pub const MAX_BODY_LEN: usize = 4094;
/// Thread id used for heartbeats and in place of an explicit `0`.
pub const DEFAULT_THREAD_ID: u32 = 7;

const THREAD_ID_MASK: u32 = 0x7FFF_FFFF;

#[derive(Debug, Error)]
pub enum MessageError {
    #[error("failed to encode block header: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    #[error("failed to decode block header: {0}")]
    Decode(#[from] bincode::error::DecodeError),

    #[error("message truncated, expected {expected} bytes got {actual}")]
    Truncated { expected: usize, actual: usize },
}

fn header_config() -> Configuration<BigEndian, Fixint> {
    bincode::config::standard()
        .with_big_endian()
        .with_fixed_int_encoding()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Heartbeat,
    Event,
    StartTransaction,
    DataChunk,
    EndTransaction,
    AtomicTransaction,
    Sql,
}

impl MessageKind {
    pub const fn tag(self) -> u8 {
        match self {
            MessageKind::Heartbeat => b'H',
            MessageKind::Event => b'E',
            MessageKind::StartTransaction => b't',
            MessageKind::DataChunk => b'F',
            MessageKind::EndTransaction => b'T',
            MessageKind::AtomicTransaction => b'A',
            MessageKind::Sql => b'$',
        }
    }

    pub const fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            b'H' => Some(MessageKind::Heartbeat),
            b'E' => Some(MessageKind::Event),
            b't' => Some(MessageKind::StartTransaction),
            b'F' => Some(MessageKind::DataChunk),
            b'T' => Some(MessageKind::EndTransaction),
            b'A' => Some(MessageKind::AtomicTransaction),
            b'$' => Some(MessageKind::Sql),
            _ => None,
        }
    }
}

/// CAL status code.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Status {
    #[default]
    Success,
    Critical,
    Error,
    Warning,
    Unknown,
    Other(String),
}

impl Status {
    pub fn as_str(&self) -> &str {
        match self {
            Status::Success => "0",
            Status::Critical => "1",
            Status::Error => "2",
            Status::Warning => "3",
            Status::Unknown => "U",
            Status::Other(s) => s,
        }
    }

    /// Success and warning codes; anything else already reports a failure.
    pub fn is_benign(&self) -> bool {
        matches!(self.as_str().as_bytes().first(), Some(b'0' | b'3'))
    }
}

impl From<&str> for Status {
    fn from(value: &str) -> Self {
        match value {
            "0" => Status::Success,
            "1" => Status::Critical,
            "2" => Status::Error,
            "3" => Status::Warning,
            "U" => Status::Unknown,
            s => Status::Other(s.to_string()),
        }
    }
}

impl From<u32> for Status {
    fn from(value: u32) -> Self {
        Status::from(value.to_string().as_str())
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A CAL record before framing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Heartbeat {
        cal_type: String,
        name: String,
        status: Status,
        data: String,
    },
    Event {
        cal_type: String,
        name: String,
        status: Status,
        data: String,
    },
    StartTransaction {
        cal_type: String,
        name: String,
    },
    DataChunk(String),
    EndTransaction {
        cal_type: String,
        name: String,
        status: Status,
        duration: String,
        data: String,
    },
    AtomicTransaction {
        cal_type: String,
        name: String,
        status: Status,
        duration: String,
        data: String,
    },
    Sql {
        hash: u32,
        query: String,
    },
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Heartbeat { .. } => MessageKind::Heartbeat,
            Message::Event { .. } => MessageKind::Event,
            Message::StartTransaction { .. } => MessageKind::StartTransaction,
            Message::DataChunk(_) => MessageKind::DataChunk,
            Message::EndTransaction { .. } => MessageKind::EndTransaction,
            Message::AtomicTransaction { .. } => MessageKind::AtomicTransaction,
            Message::Sql { .. } => MessageKind::Sql,
        }
    }

    pub fn status(&self) -> Option<&Status> {
        match self {
            Message::Heartbeat { status, .. }
            | Message::Event { status, .. }
            | Message::EndTransaction { status, .. }
            | Message::AtomicTransaction { status, .. } => Some(status),
            _ => None,
        }
    }

    /// Text body including the kind tag and trailing `\r\n`.
    pub fn body(&self) -> String {
        let tag = char::from(self.kind().tag());
        match self {
            Message::Heartbeat {
                cal_type,
                name,
                status,
                data,
            }
            | Message::Event {
                cal_type,
                name,
                status,
                data,
            } => timed(
                tag,
                &[cal_type.as_str(), name.as_str(), status.as_str(), data.as_str()],
            ),
            Message::StartTransaction { cal_type, name } => {
                timed(tag, &[cal_type.as_str(), name.as_str()])
            }
            Message::EndTransaction {
                cal_type,
                name,
                status,
                duration,
                data,
            }
            | Message::AtomicTransaction {
                cal_type,
                name,
                status,
                duration,
                data,
            } => timed(
                tag,
                &[
                    cal_type.as_str(),
                    name.as_str(),
                    status.as_str(),
                    duration.as_str(),
                    data.as_str(),
                ],
            ),
            Message::DataChunk(data) => format!("{tag}{data}\r\n"),
            Message::Sql { hash, query } => format!("{tag}{hash}\t{query}\r\n"),
        }
    }
}

fn timed(tag: char, fields: &[&str]) -> String {
    let mut out = String::new();
    out.push(tag);
    out.push_str(&timestamp());
    for field in fields {
        out.push('\t');
        out.push_str(field);
    }
    out.push_str("\r\n");
    out
}

/// Local wall clock as `HH:MM:SS.cc`.
pub fn timestamp() -> String {
    let now = Local::now();
    let centis = now.nanosecond() % 1_000_000_000 / 10_000_000;
    format!("{}{centis:02}", now.format("%H:%M:%S."))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub struct BlockHeader {
    pub thread_id: u32,
    pub timestamp: u32,
    pub length: u32,
}

/// Frames `body` for the wire under `thread_id`.
///
/// A trailing `\r\n` on `body` is optional; it is stripped and re-added after escaping and
/// truncation. Only the machine header is sent with `escape` unset.
pub fn pack_message(body: &str, thread_id: u32, escape: bool) -> Result<Vec<u8>, MessageError> {
    let body = body.strip_suffix("\r\n").unwrap_or(body);
    let mut text = if escape {
        body.replace('\n', "\\n").replace('\r', "\\r")
    } else {
        body.to_string()
    };
    truncate_at_char(&mut text, MAX_BODY_LEN);
    text.push_str("\r\n");

    let header = BlockHeader {
        thread_id: thread_id & THREAD_ID_MASK,
        timestamp: Utc::now().timestamp() as u32,
        length: text.len() as u32,
    };
    let mut out = vec![0_u8; HEADER_LEN];
    bincode::encode_into_slice(header, &mut out, header_config())?;
    out.extend_from_slice(text.as_bytes());
    Ok(out)
}

fn truncate_at_char(text: &mut String, max: usize) {
    if text.len() <= max {
        return;
    }
    let mut cut = max;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    text.truncate(cut);
}

/// Kind tag of a packed message, if it has one.
pub fn packed_kind(packed: &[u8]) -> Option<MessageKind> {
    packed.get(KIND_OFFSET).copied().and_then(MessageKind::from_tag)
}

/// A packed message read back off the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalFrame {
    pub header: BlockHeader,
    pub body: String,
}

impl CalFrame {
    /// Decodes the first frame in `bytes`, returning it with the bytes consumed.
    pub fn decode(bytes: &[u8]) -> Result<(Self, usize), MessageError> {
        if bytes.len() < HEADER_LEN {
            return Err(MessageError::Truncated {
                expected: HEADER_LEN,
                actual: bytes.len(),
            });
        }
        let (header, _): (BlockHeader, usize) =
            bincode::decode_from_slice(&bytes[..HEADER_LEN], header_config())?;

        let end = HEADER_LEN + header.length as usize;
        if bytes.len() < end {
            return Err(MessageError::Truncated {
                expected: end,
                actual: bytes.len(),
            });
        }
        let body = String::from_utf8_lossy(&bytes[HEADER_LEN..end]).into_owned();
        Ok((Self { header, body }, end))
    }

    /// Decodes every frame in `bytes`.
    pub fn decode_all(mut bytes: &[u8]) -> Result<Vec<Self>, MessageError> {
        let mut frames = Vec::new();
        while !bytes.is_empty() {
            let (frame, used) = Self::decode(bytes)?;
            frames.push(frame);
            bytes = &bytes[used..];
        }
        Ok(frames)
    }

    pub fn kind(&self) -> Option<MessageKind> {
        self.body.bytes().next().and_then(MessageKind::from_tag)
    }

    /// Tab separated fields after the tag, without the trailing `\r\n`. The first field of
    /// timed kinds is the timestamp.
    pub fn fields(&self) -> Vec<&str> {
        let text = self.body.strip_suffix("\r\n").unwrap_or(&self.body);
        text.get(1..).unwrap_or_default().split('\t').collect()
    }
}

/// Connection banner sent once per thread id before its first message.
pub fn machine_header(pool: &str, environment: &str, ip: &str, label: &str, start: &str) -> String {
    let host = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "localhost".to_string());

    [
        format!("SQLLog for {pool}:{host}:{ip}"),
        format!("Environment: {environment}"),
        format!("Label: {label}"),
        format!("Start: {start}"),
    ]
    .join("\r\n")
}

/// Start time in the format the machine header expects.
pub fn start_time() -> String {
    Local::now().format("%d-%m-%Y %H:%M:%S").to_string()
}

pub fn heartbeat() -> Message {
    Message::Heartbeat {
        cal_type: "STATE".to_string(),
        name: "LOG".to_string(),
        status: Status::Success,
        data: "(no-data)".to_string(),
    }
}

/// 32 bit hash identifying a SQL statement: 64 bit FNV-1a folded onto itself.
pub fn sql_hash(query: &str) -> u32 {
    let mut h: u64 = 0x8422_2325_cbf2_9ce4;
    for c in query.chars() {
        h ^= u64::from(u32::from(c));
        h = h.wrapping_mul(0x0100_0000_01b3);
    }
    ((h >> 32) ^ (h & 0xFFFF_FFFF)) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(data: &str) -> Message {
        Message::Event {
            cal_type: "URL".to_string(),
            name: "home".to_string(),
            status: Status::Success,
            data: data.to_string(),
        }
    }

    #[test]
    fn header_is_big_endian_and_masked() {
        let packed = pack_message("Ebody\r\n", 0xFFFF_FFFF, true).unwrap();
        let (frame, used) = CalFrame::decode(&packed).unwrap();

        assert_eq!(used, packed.len());
        assert_eq!(&packed[..4], &[0x7F, 0xFF, 0xFF, 0xFF]);
        assert_eq!(&packed[8..12], &7_u32.to_be_bytes());
        assert_eq!(frame.header.thread_id, 0x7FFF_FFFF);
        assert_eq!(frame.body, "Ebody\r\n");
        assert_eq!(packed_kind(&packed), Some(MessageKind::Event));
    }

    #[test]
    fn event_body_fields() {
        let packed = pack_message(&event("a=1&b=2").body(), 3, true).unwrap();
        let (frame, _) = CalFrame::decode(&packed).unwrap();

        let fields = frame.fields();
        assert_eq!(frame.kind(), Some(MessageKind::Event));
        assert_eq!(fields.len(), 5);
        assert_eq!(fields[0].len(), "12:00:00.00".len());
        assert_eq!(&fields[1..], &["URL", "home", "0", "a=1&b=2"]);
    }

    #[test]
    fn newlines_are_escaped_before_truncation() {
        let data = format!("line\nnext\r{}", "x".repeat(5000));
        let packed = pack_message(&event(&data).body(), 3, true).unwrap();
        let (frame, _) = CalFrame::decode(&packed).unwrap();

        assert!(frame.body.contains("line\\nnext\\r"));
        assert_eq!(frame.body.len(), MAX_BODY_LEN + 2);
        assert!(frame.body.ends_with("x\r\n"));
        assert_eq!(frame.body.matches('\n').count(), 1);
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let body = format!("E{}", "é".repeat(3000));
        let packed = pack_message(&body, 3, true).unwrap();
        let (frame, _) = CalFrame::decode(&packed).unwrap();

        assert!(frame.body.len() <= MAX_BODY_LEN + 2);
        assert!(frame.body.ends_with("é\r\n"));
    }

    #[test]
    fn machine_header_keeps_line_breaks() {
        let header = machine_header("pool", "dev", "10.0.0.1", "rust;***;default", "01-02-2024 10:00:00");
        let packed = pack_message(&header, 5, false).unwrap();
        let (frame, _) = CalFrame::decode(&packed).unwrap();

        let lines: Vec<&str> = frame.body.trim_end().split("\r\n").collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[0].starts_with("SQLLog for pool:"));
        assert!(lines[0].ends_with(":10.0.0.1"));
        assert_eq!(lines[1], "Environment: dev");
        assert_eq!(lines[3], "Start: 01-02-2024 10:00:00");
    }

    #[test]
    fn message_bodies_by_kind() {
        let start = Message::StartTransaction {
            cal_type: "ORACLE".to_string(),
            name: "query".to_string(),
        };
        assert!(start.body().starts_with('t'));
        assert_eq!(start.body().split('\t').count(), 3);

        let end = Message::EndTransaction {
            cal_type: "ORACLE".to_string(),
            name: "query".to_string(),
            status: Status::Error,
            duration: "1.50".to_string(),
            data: "k=v".to_string(),
        };
        assert!(end.body().starts_with('T'));
        assert!(end.body().ends_with("\tORACLE\tquery\t2\t1.50\tk=v\r\n"));

        assert_eq!(Message::DataChunk("chunk".to_string()).body(), "Fchunk\r\n");
        let sql = Message::Sql {
            hash: 42,
            query: "select 1".to_string(),
        };
        assert_eq!(sql.body(), "$42\tselect 1\r\n");
    }

    #[test]
    fn decode_reports_truncation() {
        let packed = pack_message("Ebody", 1, true).unwrap();
        assert!(matches!(
            CalFrame::decode(&packed[..5]),
            Err(MessageError::Truncated { expected: 12, .. })
        ));
        assert!(matches!(
            CalFrame::decode(&packed[..14]),
            Err(MessageError::Truncated { .. })
        ));
    }

    #[test]
    fn status_codes() {
        assert_eq!(Status::from("2"), Status::Error);
        assert_eq!(Status::from(1_u32),Status::Critical);
        assert_eq!(Status::from("0.1").as_str(), "0.1");
        assert!(Status::Warning.is_benign());
        assert!(!Status::Unknown.is_benign());
        assert!(Status::from("0.1").is_benign());
    }

    #[test]
    fn sql_hash_is_stable() {
        assert_eq!(sql_hash("select 1"), sql_hash("select 1"));
        assert_ne!(sql_hash("select 1"), sql_hash("select 2"));
        assert_eq!(sql_hash(""), (0x8422_2325_u64 ^ 0xcbf2_9ce4_u64) as u32);
    }
}
