use std::{
    io::{self, Read, Write},
    net::{Shutdown, SocketAddr, TcpStream},
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use log::{debug, info, trace};
use thiserror::Error;

use super::{
    codec::{Frame, MAX_LENGTH, ParseError, encode, payload_len},
    codes::{CONTAINER, Protocol},
    pump::{FrameQueue, Pump, PumpError, PumpState},
};

pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("connection io error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Transport(#[from] PumpError),

    #[error("invalid netstring: {0}")]
    Protocol(#[from] ParseError),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("connection closed")]
    Closed,

    #[error("netstring api misuse: {0}")]
    Nesting(&'static str),
}

/// Byte stream a [`NetstringConnection`] can run over.
pub trait NetStream: Read + Write + Send + Sized + 'static {
    /// Handle onto the same stream for the pump to read from.
    fn try_clone_stream(&self) -> io::Result<Self>;

    fn shutdown_both(&self) -> io::Result<()>;
}

impl NetStream for TcpStream {
    fn try_clone_stream(&self) -> io::Result<Self> {
        self.try_clone()
    }

    fn shutdown_both(&self) -> io::Result<()> {
        self.shutdown(Shutdown::Both)
    }
}

#[cfg(unix)]
impl NetStream for std::os::unix::net::UnixStream {
    fn try_clone_stream(&self) -> io::Result<Self> {
        self.try_clone()
    }

    fn shutdown_both(&self) -> io::Result<()> {
        self.shutdown(Shutdown::Both)
    }
}

/// Rejects frames whose encoded payload would not fit a nine-digit length prefix.
fn check_len(code: u32, value_len: Option<usize>) -> Result<(), ConnectionError> {
    if payload_len(code, value_len) > MAX_LENGTH {
        return Err(ParseError::TooLong.into());
    }
    Ok(())
}

type Dialer<S> = Box<dyn Fn() -> io::Result<S> + Send + Sync>;

#[derive(Debug, Default)]
struct WriteState {
    nested: bool,
    nestings: Vec<u8>,
    pending: Vec<u8>,
    last_send: Option<Instant>,
}

/// Netstring connection to the proxy.
///
/// Writes are buffered until [`flush`](Self::flush). Reads come off a queue filled by a
/// background [`Pump`]; exactly one pump is alive per connection and a dead one is replaced
/// on the next read. Any number of threads may call [`read`](Self::read) at once, each
/// waiting at most the configured timeout.
pub struct NetstringConnection<S: NetStream = TcpStream> {
    stream: Mutex<S>,
    dialer: Option<Dialer<S>>,
    protocol: Protocol,
    writes: Mutex<WriteState>,
    queue: Arc<FrameQueue>,
    state: Arc<PumpState>,
    pump: Mutex<Option<Pump>>,
    pumps_spawned: AtomicUsize,
    timeout: Mutex<Duration>,
    live: AtomicBool,
}

impl NetstringConnection<TcpStream> {
    /// Dials `address`. The same address is re-dialed whenever a pump has to be replaced
    /// after a transport failure.
    pub fn connect(address: SocketAddr, protocol: Protocol) -> Result<Self, ConnectionError> {
        let stream = TcpStream::connect(address)?;
        info!("connected to {address}");

        let dialer: Dialer<TcpStream> = Box::new(move || {
            info!("reconnecting to {address}");
            TcpStream::connect(address)
        });
        Self::build(stream, Some(dialer), protocol)
    }
}

impl<S: NetStream> NetstringConnection<S> {
    /// Wraps an established stream. Without a dialer, a replacement pump keeps reading the
    /// same stream after a transport failure. After a malformed frame the stream position
    /// is lost, so the connection stops reading and later reads fail with
    /// [`ConnectionError::Closed`].
    pub fn from_stream(stream: S, protocol: Protocol) -> Result<Self, ConnectionError> {
        Self::build(stream, None, protocol)
    }

    fn build(
        stream: S,
        dialer: Option<Dialer<S>>,
        protocol: Protocol,
    ) -> Result<Self, ConnectionError> {
        let conn = Self {
            stream: Mutex::new(stream),
            dialer,
            protocol,
            writes: Mutex::new(WriteState::default()),
            queue: Default::default(),
            state: Default::default(),
            pump: Mutex::new(None),
            pumps_spawned: AtomicUsize::new(0),
            timeout: Mutex::new(DEFAULT_READ_TIMEOUT),
            live: AtomicBool::new(true),
        };
        conn.spawn_pump_if_needed()?;
        Ok(conn)
    }

    pub fn protocol(&self) -> &Protocol {
        &self.protocol
    }

    pub fn timeout(&self) -> Duration {
        *self.timeout.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_timeout(&self, timeout: Duration) {
        *self.timeout.lock().unwrap_or_else(PoisonError::into_inner) = timeout;
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    /// Time of the last flush that actually hit the socket.
    pub fn last_send(&self) -> Option<Instant> {
        self.lock_writes().last_send
    }

    /// Buffers a frame. Inside [`start_netstring`](Self::start_netstring) the frame joins
    /// the pending container instead.
    ///
    /// Fails with [`ParseError::TooLong`] if the frame, or the container it would grow,
    /// cannot be length-prefixed. A rejected frame leaves the buffers untouched.
    pub fn write(&self, code: u32, value: Option<&[u8]>) -> Result<(), ConnectionError> {
        check_len(code, value.map(<[u8]>::len))?;
        trace!(
            "netstring buffering code {code}, {{{}}}",
            String::from_utf8_lossy(value.unwrap_or_default())
        );

        let ns = encode(code, value);
        let mut writes = self.lock_writes();
        if writes.nested {
            check_len(CONTAINER, Some(writes.nestings.len() + ns.len()))?;
            writes.nestings.extend_from_slice(&ns);
        } else {
            writes.pending.extend_from_slice(&ns);
        }
        Ok(())
    }

    pub fn start_netstring(&self) -> Result<(), ConnectionError> {
        let mut writes = self.lock_writes();
        if writes.nested {
            return Err(ConnectionError::Nesting("can't nest nested netstrings"));
        }
        writes.nested = true;
        Ok(())
    }

    /// Closes the pending container and queues it for the next flush. Its size was
    /// checked as frames were added.
    pub fn stop_netstring(&self) -> Result<(), ConnectionError> {
        let mut writes = self.lock_writes();
        if !writes.nested {
            return Err(ConnectionError::Nesting("no nested netstring started"));
        }
        writes.nested = false;

        let nestings = std::mem::take(&mut writes.nestings);
        let value = (!nestings.is_empty()).then_some(nestings.as_slice());
        let container = encode(CONTAINER, value);
        writes.pending.extend_from_slice(&container);
        Ok(())
    }

    /// Sends everything buffered in one write. A no-op while a container is open.
    pub fn flush(&self) -> Result<(), ConnectionError> {
        if !self.is_live() {
            return Err(ConnectionError::Closed);
        }

        let mut writes = self.lock_writes();
        if writes.nested {
            trace!("skipping flush for nested netstring");
            return Ok(());
        }
        if writes.pending.is_empty() {
            return Ok(());
        }

        let out = std::mem::take(&mut writes.pending);
        writes.last_send = Some(Instant::now());
        drop(writes);

        debug!("netstring flushing {} bytes", out.len());
        let mut stream = self.lock_stream();
        stream.write_all(&out)?;
        stream.flush()?;
        Ok(())
    }

    /// Next frame from the peer.
    ///
    /// Fails fast with the recorded transport error if the pump has died and nothing is
    /// queued, and with [`ConnectionError::Timeout`] if nothing arrives in time.
    pub fn read(&self) -> Result<Frame, ConnectionError> {
        if !self.is_live() {
            return Err(ConnectionError::Closed);
        }

        if let Some(item) = self.queue.try_pop() {
            return Ok(item?);
        }
        self.fail_fast()?;

        let timeout = self.timeout();
        trace!("waiting on queue for {timeout:?}");
        match self.queue.pop_until(Instant::now() + timeout) {
            Some(item) => Ok(item?),
            None => {
                self.fail_fast()?;
                Err(ConnectionError::Timeout(timeout))
            }
        }
    }

    fn fail_fast(&self) -> Result<(), ConnectionError> {
        let fatal = self.state.fatal();
        self.spawn_pump_if_needed()?;
        match fatal {
            Some(err) => Err(err.into()),
            None => Ok(()),
        }
    }

    /// Starts a pump unless a live one exists. If this connection knows how, the peer is
    /// re-dialed after a fatal error. The error stays recorded until a replacement pump has
    /// a stream to read, so a failed dial is retried on the next call.
    fn spawn_pump_if_needed(&self) -> Result<(), ConnectionError> {
        let mut slot = self.pump.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(pump) = slot.as_ref() {
            if pump.is_alive() {
                trace!("not restarting live pump {}", pump.id());
                return Ok(());
            }
        }
        if !self.is_live() {
            return Err(ConnectionError::Closed);
        }

        // A dead pump publishes its error before its thread ends.
        if let Some(old) = slot.take() {
            old.join();
        }

        let failed = self.state.fatal();
        let mut stream = self.lock_stream();
        match (&failed, self.dialer.as_ref()) {
            (Some(err), Some(dial)) => {
                debug!("replacing stream after: {err}");
                let fresh = dial()?;
                if let Err(e) = stream.shutdown_both() {
                    trace!("old stream shutdown: {e}");
                }
                *stream = fresh;
            }
            (Some(PumpError::Protocol(e)), None) => {
                debug!("stream out of sync after {e}, not restarting pump");
                return Err(ConnectionError::Closed);
            }
            _ => {}
        }
        let reader = stream.try_clone_stream()?;
        drop(stream);
        self.state.take_fatal();

        let id = self.pumps_spawned.fetch_add(1, Ordering::SeqCst);
        let pump = Pump::spawn(
            id,
            reader,
            Arc::clone(&self.queue),
            Arc::clone(&self.state),
            self.protocol.clone(),
        )?;
        *slot = Some(pump);
        Ok(())
    }

    /// Closes the connection. The pump is cancelled and exits without reporting an error.
    pub fn disconnect(&self) {
        if !self.live.swap(false, Ordering::SeqCst) {
            return;
        }

        let pump = self
            .pump
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(pump) = pump.as_ref() {
            pump.cancel();
        }
        if let Err(e) = self.lock_stream().shutdown_both() {
            // Peer may have gone already.
            debug!("shutdown on disconnect: {e}");
        }
        if let Some(pump) = pump {
            pump.join();
        }
        info!("netstring connection closed");
    }

    fn lock_writes(&self) -> MutexGuard<'_, WriteState> {
        self.writes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_stream(&self) -> MutexGuard<'_, S> {
        self.stream.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<S: NetStream> Drop for NetstringConnection<S> {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io::{BufRead, BufReader},
        net::TcpListener,
        thread,
    };

    use crate::netstring::{
        codec::{encode_container, parse},
        codes::SERVER_ALIVE,
    };

    use super::*;

    fn pair() -> (TcpListener, NetstringConnection, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let conn =
            NetstringConnection::connect(listener.local_addr().unwrap(), Protocol::Occ).unwrap();
        let (server, _) = listener.accept().unwrap();
        (listener, conn, server)
    }

    fn read_exactly(server: &mut TcpStream, len: usize) -> Vec<u8> {
        let mut buf = vec![0; len];
        server.read_exact(&mut buf).unwrap();
        buf
    }

    #[test]
    fn flush_sends_buffered_frames_in_one_write() {
        let (_listener, conn, mut server) = pair();

        conn.write(25, Some(b"select 1 from dual")).unwrap();
        conn.write(4, None).unwrap();
        conn.flush().unwrap();

        let expected = [encode(25, Some(b"select 1 from dual")), encode(4, None)].concat();
        assert_eq!(read_exactly(&mut server, expected.len()), expected);
        assert!(conn.last_send().is_some());
    }

    #[test]
    fn nested_writes_flush_as_one_container() {
        let (_listener, conn, mut server) = pair();

        conn.start_netstring().unwrap();
        conn.write(1, Some(b"A")).unwrap();
        conn.write(2, Some(b"B")).unwrap();
        conn.flush().unwrap();
        assert!(conn.last_send().is_none());

        conn.stop_netstring().unwrap();
        conn.write(3, Some(b"C")).unwrap();
        conn.flush().unwrap();

        let container = encode_container([encode(1, Some(b"A")), encode(2, Some(b"B"))]);
        let expected = [container, encode(3, Some(b"C"))].concat();
        let received = read_exactly(&mut server, expected.len());
        assert_eq!(received, expected);
        assert_eq!(parse(&received).unwrap().len(), 3);
    }

    #[test]
    fn nesting_misuse_is_rejected() {
        let (_listener, conn, _server) = pair();

        assert!(matches!(
            conn.stop_netstring(),
            Err(ConnectionError::Nesting(_))
        ));
        conn.start_netstring().unwrap();
        assert!(matches!(
            conn.start_netstring(),
            Err(ConnectionError::Nesting(_))
        ));
    }

    #[test]
    fn read_returns_frames_in_wire_order() {
        let (_listener, conn, mut server) = pair();

        let mut wire = encode(SERVER_ALIVE, None);
        wire.extend(encode_container([encode(1, Some(b"A")), encode(2, None)]));
        wire.extend(encode(3, Some(b"C")));
        // Split mid-frame to exercise reassembly.
        server.write_all(&wire[..7]).unwrap();
        server.flush().unwrap();
        thread::sleep(Duration::from_millis(20));
        server.write_all(&wire[7..]).unwrap();

        assert_eq!(conn.read().unwrap(), Frame::new(1, Some(b"A".to_vec())));
        assert_eq!(conn.read().unwrap(), Frame::new(2, None));
        assert_eq!(conn.read().unwrap(), Frame::new(3, Some(b"C".to_vec())));
    }

    #[test]
    fn read_times_out_distinctly() {
        let (_listener, conn, _server) = pair();
        conn.set_timeout(Duration::from_millis(50));

        let res = conn.read();
        assert!(matches!(res, Err(ConnectionError::Timeout(t)) if t == Duration::from_millis(50)));
    }

    #[test]
    fn dead_socket_fails_blocked_reader_once_then_reconnects() {
        let (listener, conn, server) = pair();
        let conn = Arc::new(conn);

        let reader = {
            let conn = Arc::clone(&conn);
            thread::spawn(move || conn.read())
        };
        thread::sleep(Duration::from_millis(50));
        drop(server);

        let first = reader.join().unwrap();
        assert!(matches!(first, Err(ConnectionError::Transport(_))));
        // Only one error was queued for waiting readers.
        assert!(conn.queue.is_empty());

        // Late caller sees the recorded failure without blocking, and a new pump dials out.
        conn.set_timeout(Duration::from_secs(5));
        let started = Instant::now();
        assert!(matches!(conn.read(), Err(ConnectionError::Transport(_))));
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(conn.pumps_spawned.load(Ordering::SeqCst), 2);

        let (mut server, _) = listener.accept().unwrap();
        server.write_all(&encode(7, Some(b"back"))).unwrap();
        assert_eq!(conn.read().unwrap(), Frame::new(7, Some(b"back".to_vec())));

        conn.write(8, None).unwrap();
        conn.flush().unwrap();
        let mut line = Vec::new();
        BufReader::new(server)
            .read_until(b',', &mut line)
            .unwrap();
        assert_eq!(line, encode(8, None));
    }

    #[test]
    fn live_pump_is_never_duplicated() {
        let (_listener, conn, _server) = pair();

        for _ in 0..5 {
            conn.spawn_pump_if_needed().unwrap();
        }
        assert_eq!(conn.pumps_spawned.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn disconnect_stops_pump_quietly() {
        let (_listener, conn, _server) = pair();

        conn.disconnect();
        assert!(!conn.is_live());
        assert!(conn.state.fatal().is_none());
        assert!(matches!(conn.read(), Err(ConnectionError::Closed)));
        assert!(matches!(conn.flush(), Err(ConnectionError::Closed)));
    }

    #[test]
    fn stream_without_dialer_reports_eof() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        let conn = NetstringConnection::from_stream(client, Protocol::Occ).unwrap();
        conn.set_timeout(Duration::from_secs(5));
        drop(server);

        let err = conn.read().unwrap_err();
        assert!(matches!(
            err,
            ConnectionError::Transport(PumpError::Transport {
                kind: io::ErrorKind::UnexpectedEof,
                ..
            })
        ));
    }

    #[test]
    fn refused_redial_is_retried_on_next_read() {
        let (listener, conn, server) = pair();
        let address = listener.local_addr().unwrap();
        conn.set_timeout(Duration::from_secs(5));
        drop(server);
        drop(listener);
        thread::sleep(Duration::from_millis(50));

        assert!(matches!(conn.read(), Err(ConnectionError::Transport(_))));
        assert!(matches!(
            conn.read(),
            Err(ConnectionError::Io(e)) if e.kind() == io::ErrorKind::ConnectionRefused
        ));
        assert!(conn.state.fatal().is_some());

        let listener = TcpListener::bind(address).unwrap();
        assert!(matches!(conn.read(), Err(ConnectionError::Transport(_))));
        assert_eq!(conn.pumps_spawned.load(Ordering::SeqCst), 2);
        assert!(conn.state.fatal().is_none());

        listener.set_nonblocking(true).unwrap();
        let (mut server, _) = listener.accept().unwrap();
        server.set_nonblocking(false).unwrap();
        server.write_all(&encode(7, Some(b"again"))).unwrap();
        assert_eq!(conn.read().unwrap(), Frame::new(7, Some(b"again".to_vec())));
    }

    #[test]
    fn concurrent_readers_each_wait_one_timeout() {
        let (_listener, conn, _server) = pair();
        let conn = Arc::new(conn);
        let timeout = Duration::from_millis(300);
        conn.set_timeout(timeout);

        let readers: Vec<_> = (0..3)
            .map(|_| {
                let conn = Arc::clone(&conn);
                thread::spawn(move || {
                    let started = Instant::now();
                    let res = conn.read();
                    (res, started.elapsed())
                })
            })
            .collect();

        for reader in readers {
            let (res, waited) = reader.join().unwrap();
            assert!(matches!(res, Err(ConnectionError::Timeout(_))));
            assert!(waited >= timeout);
            assert!(waited < Duration::from_millis(550), "waited {waited:?}");
        }
    }

    #[test]
    fn concurrent_readers_share_arriving_frames() {
        let (_listener, conn, mut server) = pair();
        let conn = Arc::new(conn);
        conn.set_timeout(Duration::from_secs(5));

        let readers: Vec<_> = (0..3)
            .map(|_| {
                let conn = Arc::clone(&conn);
                thread::spawn(move || conn.read())
            })
            .collect();
        thread::sleep(Duration::from_millis(50));
        for code in 1..=3 {
            server.write_all(&encode(code, None)).unwrap();
        }

        let mut codes: Vec<u32> = readers
            .into_iter()
            .map(|r| r.join().unwrap().unwrap().code)
            .collect();
        codes.sort_unstable();
        assert_eq!(codes, vec![1, 2, 3]);
    }

    #[test]
    fn size_guard_counts_the_whole_payload() {
        // "12 " plus the value
        assert!(check_len(12, Some(MAX_LENGTH - 3)).is_ok());
        assert!(matches!(
            check_len(12, Some(MAX_LENGTH - 2)),
            Err(ConnectionError::Protocol(ParseError::TooLong))
        ));
        assert!(check_len(CONTAINER, Some(MAX_LENGTH - 2)).is_ok());
        assert!(matches!(
            check_len(CONTAINER, Some(MAX_LENGTH - 1)),
            Err(ConnectionError::Protocol(ParseError::TooLong))
        ));
        assert!(check_len(u32::MAX, None).is_ok());
    }

    #[test]
    fn stream_without_dialer_closes_after_malformed_input() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (mut server, _) = listener.accept().unwrap();
        let conn = NetstringConnection::from_stream(client, Protocol::Occ).unwrap();
        conn.set_timeout(Duration::from_secs(5));

        let mut wire = encode(1, None);
        wire.extend(b"3:3 ab");
        wire.extend(encode(2, None));
        server.write_all(&wire).unwrap();

        assert_eq!(conn.read().unwrap(), Frame::new(1, None));
        assert!(matches!(
            conn.read(),
            Err(ConnectionError::Transport(PumpError::Protocol(ParseError::NoComma)))
        ));
        assert!(matches!(conn.read(), Err(ConnectionError::Closed)));
        assert_eq!(conn.pumps_spawned.load(Ordering::SeqCst), 1);
    }
}
