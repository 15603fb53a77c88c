//! The CAL logging client.
//!
//! A [`CalClient`] is constructed explicitly and passed to whatever code logs through it.
//! Each call resolves the caller's wire thread id, frames the message and hands it to a
//! [`FrameSink`]. Logging never fails from the caller's point of view: problems are
//! reported through the `log` facade and the record is dropped.
//!
//! # Thread ids
//!
//! The wire id is `(pid << 16) + alias`, where the alias comes from an [`Aliaser`] keyed by
//! the calling thread. Aliases above the configured overflow threshold share one wire id
//! (low 16 bits all set) and go out through [`OverflowBuckets`] so their transactions are
//! never interleaved.
use std::{
    fmt::Display,
    io, process,
    sync::Arc,
};

use log::{debug, info};

use super::{
    aliaser::{Aliaser, Caller},
    corr_id::{CorrelationIdProvider, HashedCorrelationIds},
    message::{DEFAULT_THREAD_ID, Message, Status, pack_message, sql_hash},
    overflow::OverflowBuckets,
    sender::{FrameSink, NullSink, SocketSender},
    transaction::Transaction,
};
use crate::config::ClientConfig;

const ALIAS_MASK: u32 = 0xFFFF;

pub struct CalClient {
    config: ClientConfig,
    sink: Arc<dyn FrameSink>,
    aliaser: Aliaser,
    overflow: OverflowBuckets,
    corr_ids: Box<dyn CorrelationIdProvider>,
}

impl CalClient {
    /// Connects to the daemon named in `config`, or builds a client that drops everything
    /// when CAL is disabled.
    pub fn new(config: ClientConfig) -> io::Result<Self> {
        let sink: Arc<dyn FrameSink> = if config.enabled {
            Arc::new(SocketSender::new(config.clone())?)
        } else {
            info!("cal disabled, records will be dropped");
            Arc::new(NullSink)
        };
        Ok(Self::with_sink(config, sink))
    }

    pub fn with_sink(config: ClientConfig, sink: Arc<dyn FrameSink>) -> Self {
        let overflow = OverflowBuckets::new(config.overflow_backstop);
        Self {
            config,
            sink,
            aliaser: Aliaser::new(),
            overflow,
            corr_ids: Box::new(HashedCorrelationIds),
        }
    }

    pub fn with_correlation_ids<P>(mut self, provider: P) -> Self
    where
        P: CorrelationIdProvider + 'static,
    {
        self.corr_ids = Box::new(provider);
        self
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Wire thread id of `caller`.
    pub fn thread_id_for(&self, caller: &Caller) -> u32 {
        (process::id() << 16).wrapping_add(self.aliaser.get(caller))
    }

    /// Wire thread id of the calling thread.
    pub fn current_thread_id(&self) -> u32 {
        self.thread_id_for(&Caller::current())
    }

    /// Frees the calling thread's alias, e.g. before it idles for a long time.
    pub fn release_thread_id(&self) -> Option<u32> {
        self.aliaser.release(&Caller::current())
    }

    pub fn correlation_id(&self) -> String {
        self.corr_ids.get()
    }

    /// Appends `corr_id_=<id>` to `data` unless it already carries one.
    pub fn with_corr_id(&self, data: &str) -> String {
        if data.contains("corr_id_") {
            return data.to_string();
        }
        let id = self.correlation_id();
        if id.is_empty() {
            return data.to_string();
        }
        if data.is_empty() {
            format!("corr_id_={id}")
        } else {
            format!("{data}&corr_id_={id}")
        }
    }

    /// Frames and sends one record. `thread_id` defaults to the calling thread's id.
    pub fn send(&self, message: Message, thread_id: Option<u32>) {
        if let Message::Event { status, .. } = &message {
            let min = self.config.min_status.as_str();
            if min != "0" && status.as_str() > min {
                return;
            }
        }

        let thread_id = match thread_id {
            None => self.current_thread_id(),
            Some(0) => DEFAULT_THREAD_ID,
            Some(id) => id,
        };

        let overflowed = thread_id & ALIAS_MASK > self.config.overflow_threshold;
        let wire_id = if overflowed {
            thread_id | ALIAS_MASK
        } else {
            thread_id
        };
        let packed = match pack_message(&message.body(), wire_id, true) {
            Ok(packed) => packed,
            Err(e) => {
                debug!("failed to pack cal record: {e}");
                return;
            }
        };

        let out = if overflowed {
            self.overflow.route(thread_id, packed)
        } else {
            vec![packed]
        };

        for packed in out {
            self.sink.submit(packed);
        }
    }

    pub fn event(&self, cal_type: &str, name: &str, status: impl Into<Status>, data: &str) {
        self.send(
            Message::Event {
                cal_type: cal_type.to_string(),
                name: name.to_string(),
                status: status.into(),
                data: data.to_string(),
            },
            None,
        );
    }

    pub fn heartbeat(&self, cal_type: &str, name: &str, status: impl Into<Status>, data: &str) {
        self.send(
            Message::Heartbeat {
                cal_type: cal_type.to_string(),
                name: name.to_string(),
                status: status.into(),
                data: data.to_string(),
            },
            None,
        );
    }

    pub fn start_trans(&self, cal_type: &str, name: &str) {
        self.send(
            Message::StartTransaction {
                cal_type: cal_type.to_string(),
                name: name.to_string(),
            },
            None,
        );
    }

    pub fn end_trans(
        &self,
        cal_type: &str,
        name: &str,
        status: impl Into<Status>,
        duration: &str,
        data: &str,
    ) {
        let data = if self.config.environment == "PayPal" {
            self.with_corr_id(data)
        } else {
            data.to_string()
        };
        self.send(
            Message::EndTransaction {
                cal_type: cal_type.to_string(),
                name: name.to_string(),
                status: status.into(),
                duration: duration.to_string(),
                data,
            },
            None,
        );
    }

    pub fn atomic_trans(
        &self,
        cal_type: &str,
        name: &str,
        status: impl Into<Status>,
        duration: &str,
        data: &str,
        thread_id: Option<u32>,
    ) {
        self.send(
            Message::AtomicTransaction {
                cal_type: cal_type.to_string(),
                name: name.to_string(),
                status: status.into(),
                duration: duration.to_string(),
                data: data.to_string(),
            },
            thread_id,
        );
    }

    pub fn data_trans(&self, data: &str) {
        self.send(Message::DataChunk(data.to_string()), None);
    }

    pub fn sql(&self, query: &str) {
        self.sql_with_hash(query, sql_hash(query));
    }

    pub fn sql_with_hash(&self, query: &str, hash: u32) {
        self.send(
            Message::Sql {
                hash,
                query: query.to_string(),
            },
            None,
        );
    }

    /// Reports `value` through the duration field of an atomic `METRIC` transaction.
    pub fn metric(&self, name: &str, value: impl Display) {
        self.atomic_trans("METRIC", name, Status::Success, &value.to_string(), "", None);
    }

    pub fn biz_event(&self, name: &str, data: &str) {
        self.event("BIZ", name, Status::Success, data);
    }

    /// Opens a transaction. The start record is sent now, the end record when the guard
    /// is ended or dropped.
    pub fn trans(&self, cal_type: &str, name: &str) -> Transaction<'_> {
        Transaction::open(self, cal_type, name, false)
    }

    /// Like [`CalClient::trans`] but reported as one atomic record when it ends.
    pub fn atomic(&self, cal_type: &str, name: &str) -> Transaction<'_> {
        Transaction::open(self, cal_type, name, true)
    }

    /// Flushes queued records and stops the sender.
    pub fn close(&self) {
        self.sink.close();
    }
}
