//! Background socket reader.
//!
//! A [`Pump`] owns the read half of a connection. It turns blocking reads into decoded
//! frames on the connection's queue, so callers block on the queue and never on the
//! socket. Transport failures are pushed onto the queue once, for whichever reader is
//! waiting, and also parked in [`PumpState`] for readers that show up after the queue
//! has drained.
use std::{
    collections::VecDeque,
    io::{self, Read},
    sync::{
        Arc, Condvar, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Instant,
};

use log::{debug, info, trace};
use thiserror::Error;

use super::{
    codec::{Decoder, Frame, ParseError},
    codes::Protocol,
};

/// Bytes requested from the socket per read.
pub const READ_CHUNK: usize = 2048;

pub type Item = Result<Frame, PumpError>;

/// Failure that stopped a pump.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PumpError {
    #[error("transport failed ({kind:?}): {message}")]
    Transport { kind: io::ErrorKind, message: String },

    #[error("malformed netstring from peer: {0}")]
    Protocol(#[from] ParseError),
}

impl From<io::Error> for PumpError {
    fn from(value: io::Error) -> Self {
        PumpError::Transport {
            kind: value.kind(),
            message: value.to_string(),
        }
    }
}

/// State shared between a connection and its pumps.
#[derive(Debug, Default)]
pub struct PumpState {
    fatal: Mutex<Option<PumpError>>,
}

impl PumpState {
    pub fn fatal(&self) -> Option<PumpError> {
        self.fatal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn take_fatal(&self) -> Option<PumpError> {
        self.fatal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn record(&self, err: PumpError) {
        *self.fatal.lock().unwrap_or_else(PoisonError::into_inner) = Some(err);
    }
}

/// Frames waiting for readers. Any number of threads may wait on it, each against its
/// own deadline.
#[derive(Debug, Default)]
pub struct FrameQueue {
    items: Mutex<VecDeque<Item>>,
    ready: Condvar,
}

impl FrameQueue {
    pub fn push(&self, item: Item) {
        self.lock().push_back(item);
        self.ready.notify_one();
    }

    pub fn try_pop(&self) -> Option<Item> {
        self.lock().pop_front()
    }

    /// Blocks until an item arrives or `deadline` passes.
    pub fn pop_until(&self, deadline: Instant) -> Option<Item> {
        let mut items = self.lock();
        loop {
            if let Some(item) = items.pop_front() {
                return Some(item);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            items = self
                .ready
                .wait_timeout(items, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Item>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Cooperative stop signal checked by the pump between reads.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
pub struct Pump {
    id: usize,
    cancel: CancelToken,
    running: Arc<AtomicBool>,
    thread: thread::JoinHandle<()>,
}

impl Pump {
    pub fn spawn<R>(
        id: usize,
        reader: R,
        queue: Arc<FrameQueue>,
        state: Arc<PumpState>,
        protocol: Protocol,
    ) -> io::Result<Self>
    where
        R: Read + Send + 'static,
    {
        let cancel = CancelToken::default();
        let running = Arc::new(AtomicBool::new(true));

        let worker = Worker {
            id,
            reader,
            queue,
            state,
            protocol,
            cancel: cancel.clone(),
            running: Arc::clone(&running),
        };
        let thread = thread::Builder::new()
            .name(format!("netstring-pump-{id}"))
            .spawn(move || worker.run())?;

        info!("pump {id} started");
        Ok(Self {
            id,
            cancel,
            running,
            thread,
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// A pump counts as dead as soon as it has given up reading, even if its thread is
    /// still unwinding.
    pub fn is_alive(&self) -> bool {
        self.running.load(Ordering::SeqCst) && !self.thread.is_finished()
    }

    /// Signals the pump to exit. The caller still has to unblock a pending read, usually
    /// by shutting the socket down.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn join(self) {
        if self.thread.join().is_err() {
            debug!("pump {} panicked", self.id);
        }
    }
}

struct Worker<R> {
    id: usize,
    reader: R,
    queue: Arc<FrameQueue>,
    state: Arc<PumpState>,
    protocol: Protocol,
    cancel: CancelToken,
    running: Arc<AtomicBool>,
}

impl<R: Read> Worker<R> {
    fn run(mut self) {
        let mut decoder = Decoder::new();
        let mut chunk = [0_u8; READ_CHUNK];

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            let read = match self.reader.read(&mut chunk) {
                Ok(0) => Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "EOF on netstring socket",
                )),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                res => res,
            };

            let n = match read {
                Ok(n) => n,
                Err(e) => return self.fail(e.into()),
            };
            trace!("pump {} read {n} bytes", self.id);
            decoder.extend(&chunk[..n]);

            loop {
                match decoder.next_frame() {
                    Ok(Some(frame)) if self.protocol.delivers(frame.code) => {
                        trace!("pump {} queued code {}", self.id, frame.code);
                        self.queue.push(Ok(frame));
                    }
                    Ok(Some(_)) => trace!("pump {} dropped keep-alive", self.id),
                    Ok(None) => break,
                    Err(e) => return self.fail(e.into()),
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
        debug!("pump {} cancelled", self.id);
    }

    fn fail(self, err: PumpError) {
        self.running.store(false, Ordering::SeqCst);
        if self.cancel.is_cancelled() {
            debug!("pump {} stopped after disconnect", self.id);
            return;
        }

        info!("pump {} failed: {err}", self.id);
        self.state.record(err.clone());
        self.queue.push(Err(err));
    }
}
