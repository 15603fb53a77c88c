//! Delivery of packed CAL frames to the logging daemon.
//!
//! Callers never touch the socket. [`SocketSender::submit`] hands a frame to a background
//! actor thread which owns the connection, and returns immediately. The actor:
//!
//! - connects lazily and reconnects after any write failure, sleeping
//!   `backoff_base * 2^min(attempt, 10)` between attempts and giving up on a frame after
//!   `max_send_attempts`;
//! - sends the machine header before the first frame of every thread id on a connection;
//! - emits a heartbeat when nothing has been sent for `heartbeat_interval`.
//!
//! A forked child inherits the parent's socket but not its threads, so the sender checks
//! the process id on every submit and starts a fresh actor when it changes.
use std::{
    collections::HashSet,
    io::{self, Write},
    mem,
    net::{TcpStream, ToSocketAddrs},
    process,
    sync::{
        Arc, Mutex, PoisonError,
        mpsc::{self, RecvTimeoutError, Sender},
    },
    thread,
    time::Duration,
};

use log::{debug, info, trace, warn};

use super::message::{
    DEFAULT_THREAD_ID, HEADER_LEN, heartbeat, machine_header, pack_message, start_time,
};
use crate::config::ClientConfig;

/// Upper bound on the backoff exponent.
const MAX_BACKOFF_SHIFT: u32 = 10;

/// Destination for packed frames.
pub trait FrameSink: Send + Sync {
    /// Queues a frame. Never blocks on the network and never fails.
    fn submit(&self, packed: Vec<u8>);

    /// Flushes what is queued and stops accepting frames.
    fn close(&self) {}
}

/// Sink for a disabled client.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl FrameSink for NullSink {
    fn submit(&self, _packed: Vec<u8>) {}
}

/// Sink keeping frames in memory, for inspecting what a client would have sent.
#[derive(Debug, Default)]
pub struct MemorySink {
    frames: Mutex<Vec<Vec<u8>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Removes and returns everything submitted so far.
    pub fn take(&self) -> Vec<Vec<u8>> {
        mem::take(&mut *self.frames.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

impl FrameSink for MemorySink {
    fn submit(&self, packed: Vec<u8>) {
        self.frames
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(packed);
    }
}

/// Delay before retry number `attempt` (starting at 0).
pub fn backoff(base: Duration, attempt: u32) -> Duration {
    base * (1_u32 << attempt.min(MAX_BACKOFF_SHIFT))
}

#[derive(Debug)]
struct Actor {
    pid: u32,
    tx: Sender<Vec<u8>>,
    thread: thread::JoinHandle<()>,
}

impl Actor {
    fn spawn(config: Arc<ClientConfig>, pid: u32) -> io::Result<Self> {
        let (tx, rx) = mpsc::channel::<Vec<u8>>();
        let interval = config.heartbeat_interval;
        let mut transport = Transport::new(config);

        let thread = thread::Builder::new()
            .name(format!("cal-sender-{pid}"))
            .spawn(move || {
                loop {
                    let next = if interval.is_zero() {
                        rx.recv().map_err(|_| RecvTimeoutError::Disconnected)
                    } else {
                        rx.recv_timeout(interval)
                    };
                    match next {
                        Ok(packed) => transport.send(&packed),
                        Err(RecvTimeoutError::Timeout) => transport.heartbeat(),
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                debug!("cal sender for pid {pid} stopped");
            })?;

        info!("cal sender started for pid {pid}");
        Ok(Self { pid, tx, thread })
    }
}

/// Frame sink backed by a TCP connection to the daemon.
#[derive(Debug)]
pub struct SocketSender {
    config: Arc<ClientConfig>,
    actor: Mutex<Option<Actor>>,
}

impl SocketSender {
    pub fn new(config: ClientConfig) -> io::Result<Self> {
        let config = Arc::new(config);
        let actor = Actor::spawn(Arc::clone(&config), process::id())?;
        Ok(Self {
            config,
            actor: Mutex::new(Some(actor)),
        })
    }

    /// Replaces the actor when `pid` differs from the one it was started under. Returns
    /// whether a new actor was started.
    pub fn ensure_pid(&self, pid: u32) -> bool {
        let mut slot = self.actor.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(actor) = slot.as_ref() else {
            return false;
        };
        if actor.pid == pid {
            return false;
        }

        info!("pid changed from {} to {pid}, restarting cal sender", actor.pid);
        let fresh = match Actor::spawn(Arc::clone(&self.config), pid) {
            Ok(fresh) => fresh,
            Err(e) => {
                warn!("failed to restart cal sender: {e}");
                return false;
            }
        };
        if let Some(old) = slot.replace(fresh) {
            // After a real fork the old thread does not exist in this process, so its
            // handle must be neither joined nor detached.
            drop(old.tx);
            mem::forget(old.thread);
        }
        true
    }
}

impl FrameSink for SocketSender {
    fn submit(&self, packed: Vec<u8>) {
        self.ensure_pid(process::id());
        let slot = self.actor.lock().unwrap_or_else(PoisonError::into_inner);
        match slot.as_ref() {
            Some(actor) => {
                if actor.tx.send(packed).is_err() {
                    debug!("cal sender gone, frame dropped");
                }
            }
            None => trace!("cal sender closed, frame dropped"),
        }
    }

    fn close(&self) {
        let actor = self
            .actor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(actor) = actor {
            drop(actor.tx);
            if actor.thread.join().is_err() {
                warn!("cal sender panicked");
            }
        }
    }
}

impl Drop for SocketSender {
    fn drop(&mut self) {
        self.close();
    }
}

/// Connection state owned by the actor thread.
struct Transport {
    config: Arc<ClientConfig>,
    stream: Option<TcpStream>,
    inited: HashSet<[u8; 4]>,
    start: String,
}

impl Transport {
    fn new(config: Arc<ClientConfig>) -> Self {
        Self {
            config,
            stream: None,
            inited: HashSet::new(),
            start: start_time(),
        }
    }

    fn heartbeat(&mut self) {
        match pack_message(&heartbeat().body(), DEFAULT_THREAD_ID, true) {
            Ok(packed) => self.send(&packed),
            Err(e) => debug!("failed to pack heartbeat: {e}"),
        }
    }

    fn send(&mut self, packed: &[u8]) {
        if packed.len() < HEADER_LEN {
            warn!("dropping {} byte cal frame without block header", packed.len());
            return;
        }
        let attempts = self.config.max_send_attempts;
        for attempt in 0..attempts {
            match self.try_send(packed) {
                Ok(()) => return,
                Err(e) => {
                    debug!("cal send attempt {attempt} failed: {e}");
                    self.stream = None;
                    if attempt + 1 < attempts {
                        thread::sleep(backoff(self.config.backoff_base, attempt));
                    }
                }
            }
        }
        warn!(
            "dropping cal frame after {} attempts",
            self.config.max_send_attempts
        );
    }

    fn try_send(&mut self, packed: &[u8]) -> io::Result<()> {
        if self.stream.is_none() {
            self.connect()?;
        }
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "no cal connection"))?;

        let key = [packed[0], packed[1], packed[2], packed[3]];
        if !self.inited.contains(&key) {
            let ip = stream.local_addr()?.ip().to_string();
            let config = &self.config;
            let header = machine_header(
                &config.pool,
                &config.environment,
                &ip,
                &config.build_label,
                &self.start,
            );
            let packed_header = pack_message(&header, u32::from_be_bytes(key), false)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            stream.write_all(&packed_header)?;
            self.inited.insert(key);
        }
        stream.write_all(packed)
    }

    fn connect(&mut self) -> io::Result<()> {
        let address = self.config.address();
        let addr = address.to_socket_addrs()?.next().ok_or_else(|| {
            io::Error::new(io::ErrorKind::AddrNotAvailable, format!("cannot resolve {address}"))
        })?;
        let stream = TcpStream::connect_timeout(&addr, self.config.connect_timeout)?;
        stream.set_nodelay(true)?;

        info!("connected to cal daemon at {addr}");
        self.inited.clear();
        self.stream = Some(stream);
        Ok(())
    }
}
