//! Scoped CAL transactions.
//!
//! A [`Transaction`] sends its start record when it is opened (atomic transactions skip it)
//! and its closing record exactly once, either from [`Transaction::end`] or when the guard
//! goes out of scope. The closing record carries the elapsed milliseconds, the status, and
//! the url-encoded data.
//!
//! Errors handed to [`Transaction::capture`] raise a benign status to [`EXCEPTION_STATUS`]
//! and append their trace to the data. An error whose source chain contains [`Cancelled`]
//! is not a failure: it clears whatever was captured and marks the record `green_exit`.
//!
//! # Example
//! ```rust
//! use hera_client::cal::{CalClient, MemorySink};
//! use hera_client::config::ClientConfig;
//! use std::sync::Arc;
//!
//! let client = CalClient::with_sink(ClientConfig::default(), Arc::new(MemorySink::new()));
//! let result: Result<u32, std::io::Error> = client.trans("ORACLE", "query").run(|t| {
//!     t.add_data("rows", 3);
//!     Ok(3)
//! });
//! assert_eq!(result.unwrap(), 3);
//! ```
use std::{
    any,
    error::Error,
    fmt::Display,
    thread,
    time::Instant,
};

use log::trace;
use thiserror::Error;

use super::{client::CalClient, message::Status};

/// Status a transaction is raised to when it fails.
pub const EXCEPTION_STATUS: Status = Status::Critical;

/// Cooperative cancellation. Ending a transaction because of it is not a failure.
#[derive(Debug, Error, Clone, Copy, Default, PartialEq, Eq)]
#[error("operation cancelled")]
pub struct Cancelled;

/// Wraps an error with the CAL status (and optionally the `m_err` value) it should be
/// reported with.
#[derive(Debug, Error)]
#[error("{source}")]
pub struct StatusError {
    pub status: Status,
    pub m_err: Option<String>,
    source: Box<dyn Error + Send + Sync>,
}

impl StatusError {
    pub fn new<E>(status: impl Into<Status>, source: E) -> Self
    where
        E: Into<Box<dyn Error + Send + Sync>>,
    {
        Self {
            status: status.into(),
            m_err: None,
            source: source.into(),
        }
    }

    pub fn with_m_err(mut self, m_err: impl Into<String>) -> Self {
        self.m_err = Some(m_err.into());
        self
    }
}

#[derive(Debug)]
struct Failure {
    m_err: String,
    status: Option<Status>,
}

pub struct Transaction<'a> {
    client: &'a CalClient,
    cal_type: String,
    name: String,
    status: Status,
    atomic: bool,
    data: Vec<(String, String)>,
    message: Option<String>,
    started: Instant,
    failure: Option<Failure>,
    traces: Vec<String>,
    green_exit: bool,
    finished: bool,
}

impl<'a> Transaction<'a> {
    pub(crate) fn open(client: &'a CalClient, cal_type: &str, name: &str, atomic: bool) -> Self {
        let cal_type = cal_type.to_uppercase();
        if !atomic {
            client.start_trans(&cal_type, name);
        }
        Self {
            client,
            cal_type,
            name: name.to_string(),
            status: Status::Success,
            atomic,
            data: Vec::new(),
            message: None,
            started: Instant::now(),
            failure: None,
            traces: Vec::new(),
            green_exit: false,
            finished: false,
        }
    }

    pub fn cal_type(&self) -> &str {
        &self.cal_type
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn status(&self) -> &Status {
        &self.status
    }

    pub fn set_status(&mut self, status: impl Into<Status>) -> &mut Self {
        self.status = status.into();
        self
    }

    /// Adds a `key=value` pair, replacing an earlier value for the same key.
    pub fn add_data(&mut self, key: impl Into<String>, value: impl Display) -> &mut Self {
        let key = key.into();
        let value = value.to_string();
        match self.data.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.data.push((key, value)),
        }
        self
    }

    /// Sends `message` verbatim as the data field instead of the key/value pairs.
    pub fn set_message(&mut self, message: impl Into<String>) -> &mut Self {
        self.message = Some(message.into());
        self
    }

    /// Records a failure. Later captures are chained after earlier ones.
    pub fn capture<E>(&mut self, err: &E)
    where
        E: Error + 'static,
    {
        let mut status = None;
        let mut m_err = None;
        let mut chain: Option<&(dyn Error + 'static)> = Some(err);
        while let Some(e) = chain {
            if e.is::<Cancelled>() {
                self.cancel();
                return;
            }
            if let Some(s) = e.downcast_ref::<StatusError>() {
                status.get_or_insert_with(|| s.status.clone());
                if m_err.is_none() {
                    m_err = s.m_err.clone();
                }
            }
            chain = e.source();
        }

        let kind = short_type_name::<E>();
        self.traces.push(format_trace(kind, err));
        self.failure = Some(Failure {
            m_err: m_err.unwrap_or_else(|| kind.to_string()),
            status,
        });
        trace!("{} {} captured {kind}", self.cal_type, self.name);
    }

    /// Marks the transaction as cancelled, dropping any captured failure.
    pub fn cancel(&mut self) {
        self.failure = None;
        self.traces.clear();
        self.green_exit = true;
    }

    /// Runs `f` inside the transaction and ends it, capturing the error if `f` fails.
    pub fn run<T, E, F>(mut self, f: F) -> Result<T, E>
    where
        E: Error + 'static,
        F: FnOnce(&mut Self) -> Result<T, E>,
    {
        let result = f(&mut self);
        if let Err(e) = &result {
            self.capture(e);
        }
        self.end();
        result
    }

    pub fn end(mut self) {
        self.finish();
    }

    fn finish(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;

        if thread::panicking() && self.failure.is_none() && !self.green_exit {
            self.traces.push("panic: thread panicked inside transaction".to_string());
            self.failure = Some(Failure {
                m_err: "panic".to_string(),
                status: None,
            });
        }

        let duration = format!("{:.2}", self.started.elapsed().as_secs_f64() * 1000.0);
        let data = match self.message.take() {
            Some(message) => message,
            None => {
                if let Some(failure) = &self.failure {
                    if !self.data.iter().any(|(k, _)| k == "m_err") {
                        self.data.push(("m_err".to_string(), failure.m_err.clone()));
                    }
                }
                if self.green_exit {
                    self.data.push(("green_exit".to_string(), "true".to_string()));
                }
                url_encode(&self.data)
            }
        };
        let mut data = self.client.with_corr_id(&data);

        if let Some(failure) = self.failure.take() {
            match failure.status {
                Some(status) => self.status = status,
                None if self.status.is_benign() => self.status = EXCEPTION_STATUS,
                None => {}
            }
            if !data.is_empty() {
                data.push('&');
            }
            data.push_str("\n\tmsg=");
            data.push_str(&self.traces.join("\n").replace('\n', "\n\t"));
        }

        let status = self.status.clone();
        if self.atomic {
            self.client
                .atomic_trans(&self.cal_type, &self.name, status, &duration, &data, None);
        } else {
            self.client
                .end_trans(&self.cal_type, &self.name, status, &duration, &data);
        }
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        self.finish();
    }
}

fn url_encode(pairs: &[(String, String)]) -> String {
    pairs
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&")
}

/// Last path segment of a type name, without generic arguments.
fn short_type_name<T: ?Sized>() -> &'static str {
    let full = any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}

/// Source chain deepest cause first, ending with `kind: err`.
fn format_trace(kind: &str, err: &(dyn Error + 'static)) -> String {
    let mut causes = Vec::new();
    let mut source = err.source();
    while let Some(cause) = source {
        causes.push(format!("caused by: {cause}"));
        source = cause.source();
    }
    causes.reverse();
    causes.push(format!("{kind}: {err}"));
    causes.join("\n")
}

#[cfg(test)]
mod tests {
    use std::{io, panic, sync::Arc, thread, time::Duration};

    use super::*;
    use crate::{
        cal::{
            corr_id::FixedCorrelationId,
            message::{CalFrame, MessageKind},
            sender::MemorySink,
        },
        config::ClientConfig,
    };

    #[derive(Debug, Error)]
    #[error("{0}")]
    struct QueryError(&'static str);

    #[derive(Debug, Error)]
    #[error("request failed")]
    struct RequestError(#[source] Cancelled);

    fn client() -> (CalClient, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::new());
        let client = CalClient::with_sink(ClientConfig::default(), sink.clone())
            .with_correlation_ids(FixedCorrelationId("c0ffee".to_string()));
        (client, sink)
    }

    fn frames(sink: &MemorySink) -> Vec<CalFrame> {
        sink.take()
            .iter()
            .map(|p| CalFrame::decode(p).unwrap().0)
            .collect()
    }

    /// cal type, name, status, duration, data of a closing record. Data may itself
    /// contain tabs from an appended trace.
    fn closing(frame: &CalFrame) -> (String, String, String, f64, String) {
        let f = frame.fields();
        (
            f[1].to_string(),
            f[2].to_string(),
            f[3].to_string(),
            f[4].parse().unwrap(),
            f[5..].join("\t"),
        )
    }

    #[test]
    fn failing_transaction_reports_trace_ending_in_message() {
        let (client, sink) = client();
        let result: Result<(), QueryError> =
            client.trans("ORACLE", "query").run(|_| Err(QueryError("boom")));
        assert!(result.is_err());

        let frames = frames(&sink);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].kind(), Some(MessageKind::StartTransaction));
        assert_eq!(frames[1].kind(), Some(MessageKind::EndTransaction));

        let (cal_type, name, status, _, data) = closing(&frames[1]);
        assert_eq!((cal_type.as_str(), name.as_str()), ("ORACLE", "query"));
        assert_eq!(status, EXCEPTION_STATUS.as_str());
        assert!(data.starts_with("m_err=QueryError&corr_id_=c0ffee&"));
        assert!(data.ends_with("\\n\tmsg=QueryError: boom"));
    }

    #[test]
    fn successful_transaction_keeps_data_and_duration() {
        let (client, sink) = client();
        {
            let mut t = client.trans("url", "home");
            t.add_data("a", 1).add_data("b", "two").add_data("a", 3);
            thread::sleep(Duration::from_millis(5));
        }

        let frames = frames(&sink);
        let (cal_type, _, status, duration, data) = closing(&frames[1]);
        assert_eq!(cal_type, "URL");
        assert_eq!(status, "0");
        assert!(duration >= 5.0);
        assert_eq!(data, "a=3&b=two&corr_id_=c0ffee");
    }

    #[test]
    fn atomic_transaction_sends_single_record() {
        let (client, sink) = client();
        let mut t = client.atomic("API", "ping");
        t.set_status("3");
        t.end();

        let frames = frames(&sink);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].kind(), Some(MessageKind::AtomicTransaction));
        assert_eq!(closing(&frames[0]).2, "3");
    }

    #[test]
    fn cancellation_in_source_chain_is_not_a_failure() {
        let (client, sink) = client();
        let mut t = client.trans("JOB", "work");
        t.capture(&QueryError("earlier"));
        t.capture(&RequestError(Cancelled));
        t.end();

        let (_, _, status, _, data) = closing(&frames(&sink)[1]);
        assert_eq!(status, "0");
        assert_eq!(data, "green_exit=true&corr_id_=c0ffee");
    }

    #[test]
    fn status_error_overrides_status_and_m_err() {
        let (client, sink) = client();
        let err = StatusError::new("2", io::Error::other("disk full")).with_m_err("DISK");
        let result: Result<(), StatusError> = client.trans("IO", "write").run(|_| Err(err));
        assert!(result.is_err());

        let (_, _, status, _, data) = closing(&frames(&sink)[1]);
        assert_eq!(status, "2");
        assert!(data.starts_with("m_err=DISK&"));
        assert!(data.contains("caused by: disk full"));
        assert!(data.ends_with("StatusError: disk full"));
    }

    #[test]
    fn failure_keeps_non_benign_status_and_chains_traces() {
        let (client, sink) = client();
        let mut t = client.trans("DB", "tx");
        t.set_status("2");
        t.capture(&QueryError("first"));
        t.capture(&QueryError("second"));
        t.end();

        let (_, _, status, _, data) = closing(&frames(&sink)[1]);
        assert_eq!(status, "2");
        assert!(data.contains("QueryError: first\\n\tQueryError: second"));
    }

    #[test]
    fn raw_message_replaces_pairs() {
        let (client, sink) = client();
        let mut t = client.trans("DB", "tx");
        t.add_data("ignored", 1).set_message("free text");
        t.end();

        assert_eq!(closing(&frames(&sink)[1]).4, "free text&corr_id_=c0ffee");
    }

    #[test]
    fn panic_inside_scope_still_closes_transaction() {
        let (client, sink) = client();
        let outcome = panic::catch_unwind(panic::AssertUnwindSafe(|| {
            let _t = client.trans("JOB", "explode");
            panic!("kaboom");
        }));
        assert!(outcome.is_err());

        let frames = frames(&sink);
        assert_eq!(frames.len(), 2);
        let (_, _, status, _, data) = closing(&frames[1]);
        assert_eq!(status, "1");
        assert!(data.starts_with("m_err=panic&"));
    }

    #[test]
    fn short_type_names() {
        assert_eq!(short_type_name::<QueryError>(), "QueryError");
        assert_eq!(short_type_name::<io::Error>(), "Error");
        assert_eq!(short_type_name::<Box<dyn Error>>(), "Box");
    }
}
