//! Router-style server endpoint.
//!
//! One [`ServerSocket`] accepts any number of peers. A dedicated poll
//! thread owns the listener, every accepted connection and a
//! [`mio::Waker`] that other threads use to nudge it. Inbound messages
//! are tagged with the sender's address frame and handed to the
//! registered handler as a [`RequestContext`]; replies are routed back by
//! that address rather than through a stored connection.
//!
//! `send` never touches a socket. It queues the message and wakes the
//! poll thread, which moves queued messages into per-peer write buffers,
//! adds write interest while a buffer is non-empty and drops back to
//! read interest once it drains.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, ToSocketAddrs};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use bytes::{Buf, Bytes, BytesMut};
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};
use parking_lot::{Mutex, ReentrantMutex, RwLock};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{ProtocolError, TransportError};
use crate::frame::{FrameCodec, Group};
use crate::poll::Backoff;

const LISTENER: Token = Token(0);
const WAKER: Token = Token(1);
const FIRST_PEER: usize = 2;
const READ_CHUNK: usize = 16 * 1024;

/// Port to bind.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Port {
    Fixed(u16),
    /// Let the OS pick; the bound port is reported by `local_addr`.
    Ephemeral,
}

impl Port {
    /// Interpret a raw port number where `-1` requests an ephemeral port.
    pub fn from_raw(port: i32) -> Option<Self> {
        if port < 0 {
            Some(Port::Ephemeral)
        } else {
            u16::try_from(port).ok().map(Port::Fixed)
        }
    }

    fn number(self) -> u16 {
        match self {
            Port::Fixed(p) => p,
            Port::Ephemeral => 0,
        }
    }
}

/// Callback invoked on the poll thread for every inbound message.
pub type Handler = Arc<dyn Fn(RequestContext) + Send + Sync>;

struct Shared {
    addr: SocketAddr,
    /// Re-entrant: code already holding the outbox may queue more replies.
    outbox: ReentrantMutex<RefCell<VecDeque<Group>>>,
    waker: Waker,
    running: AtomicBool,
    handler: RwLock<Option<Handler>>,
}

impl Shared {
    fn enqueue(&self, group: Group) -> Result<(), TransportError> {
        if !self.running.load(Ordering::Acquire) {
            return Err(TransportError::Closed(format!("server socket {}", self.addr)));
        }
        {
            let outbox = self.outbox.lock();
            outbox.borrow_mut().push_back(group);
        }
        self.waker.wake().map_err(TransportError::from)
    }

    fn take_outbox(&self) -> VecDeque<Group> {
        let outbox = self.outbox.lock();
        let mut queue = outbox.borrow_mut();
        std::mem::take(&mut *queue)
    }
}

/// One inbound message plus the means to answer it.
///
/// The payload can be taken exactly once. The context is `Send`, so it
/// may be answered from a thread other than the poll thread.
pub struct RequestContext {
    source: Bytes,
    payload: Option<Bytes>,
    shared: Arc<Shared>,
}

impl RequestContext {
    /// Address frame of the sender.
    pub fn source(&self) -> &Bytes {
        &self.source
    }

    /// Take the payload. A second call fails.
    pub fn recv(&mut self) -> Result<Bytes, ProtocolError> {
        self.payload.take().ok_or(ProtocolError::AlreadyConsumed)
    }

    /// Queue a reply to the sender.
    pub fn send(&self, reply: Bytes) -> Result<(), TransportError> {
        self.shared
            .enqueue(Group::routed(self.source.clone(), reply))
    }
}

impl fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestContext")
            .field("source", &self.source)
            .field("consumed", &self.payload.is_none())
            .finish()
    }
}

/// Handle to a bound router endpoint. Clones share the same socket.
#[derive(Clone)]
pub struct ServerSocket {
    shared: Arc<Shared>,
    thread: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl ServerSocket {
    /// Bind `host` and start the poll thread.
    pub fn bind(host: &str, port: Port, config: &Config) -> Result<Self, TransportError> {
        let display = format!("{host}:{}", port.number());
        let bind_err = |reason: String| TransportError::Bind {
            addr: display.clone(),
            reason,
        };

        let addr = (host, port.number())
            .to_socket_addrs()
            .map_err(|e| bind_err(e.to_string()))?
            .next()
            .ok_or_else(|| bind_err("host did not resolve".into()))?;
        let mut listener = TcpListener::bind(addr).map_err(|e| bind_err(e.to_string()))?;
        let local = listener.local_addr().map_err(|e| bind_err(e.to_string()))?;

        let poll = Poll::new().map_err(|e| bind_err(e.to_string()))?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)
            .map_err(|e| bind_err(e.to_string()))?;
        let waker = Waker::new(poll.registry(), WAKER).map_err(|e| bind_err(e.to_string()))?;

        let shared = Arc::new(Shared {
            addr: local,
            outbox: ReentrantMutex::new(RefCell::new(VecDeque::new())),
            waker,
            running: AtomicBool::new(true),
            handler: RwLock::new(None),
        });

        let poll_loop = PollLoop {
            poll,
            listener,
            shared: shared.clone(),
            peers: HashMap::new(),
            next_token: FIRST_PEER,
            codec: FrameCodec::new(config.max_frame_len),
            held: VecDeque::new(),
            backoff: Backoff::from_config(config),
        };
        let handle = thread::Builder::new()
            .name(format!("tessel-poll-{}", local.port()))
            .spawn(move || poll_loop.run())
            .map_err(|e| bind_err(e.to_string()))?;

        info!(addr = %local, "server socket bound");
        Ok(Self {
            shared,
            thread: Arc::new(Mutex::new(Some(handle))),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.shared.addr
    }

    pub fn port(&self) -> u16 {
        self.shared.addr.port()
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Queue a routed message (`[address, payload...]`). Never blocks on I/O.
    pub fn send(&self, group: Group) -> Result<(), TransportError> {
        self.shared.enqueue(group)
    }

    /// Install the inbound message callback.
    ///
    /// Messages that arrived earlier are delivered once it is installed.
    pub fn register_handler<F>(&self, handler: F)
    where
        F: Fn(RequestContext) + Send + Sync + 'static,
    {
        *self.shared.handler.write() = Some(Arc::new(handler));
        if let Err(e) = self.shared.waker.wake() {
            warn!(addr = %self.shared.addr, "failed to wake poll thread: {e}");
        }
    }

    /// Stop the poll loop after its current iteration and release the socket.
    ///
    /// Joins the poll thread unless called from it.
    pub fn close(&self) {
        if self.shared.running.swap(false, Ordering::AcqRel) {
            let _ = self.shared.waker.wake();
        }
        let handle = self.thread.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                warn!(addr = %self.shared.addr, "poll thread panicked");
            }
        }
        self.shared.handler.write().take();
    }
}

fn address_frame(token: Token) -> Bytes {
    Bytes::copy_from_slice(&(token.0 as u64).to_be_bytes())
}

fn token_of(address: &[u8]) -> Option<Token> {
    let raw: [u8; 8] = address.try_into().ok()?;
    Some(Token(u64::from_be_bytes(raw) as usize))
}

struct Peer {
    stream: TcpStream,
    addr: SocketAddr,
    read_buf: BytesMut,
    write_buf: BytesMut,
    writing: bool,
}

struct PollLoop {
    poll: Poll,
    listener: TcpListener,
    shared: Arc<Shared>,
    peers: HashMap<Token, Peer>,
    next_token: usize,
    codec: FrameCodec,
    /// Messages received before a handler was installed.
    held: VecDeque<RequestContext>,
    backoff: Backoff,
}

impl PollLoop {
    fn run(mut self) {
        let mut events = Events::with_capacity(256);
        while self.shared.running.load(Ordering::Acquire) {
            if let Err(e) = self.poll.poll(&mut events, Some(self.backoff.timeout())) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                warn!(addr = %self.shared.addr, "poll failed: {e}");
                break;
            }

            let mut active = false;
            let mut inbound = Vec::new();
            for event in events.iter() {
                active = true;
                match event.token() {
                    LISTENER => self.accept(),
                    WAKER => {}
                    token => {
                        let mut closed = false;
                        if event.is_readable() || event.is_read_closed() || event.is_error() {
                            closed |= self.read_peer(token, &mut inbound);
                        }
                        if event.is_writable() {
                            closed |= self.flush_peer(token);
                        }
                        if closed {
                            self.drop_peer(token);
                        }
                    }
                }
            }

            active |= self.deliver(inbound);
            active |= self.route_outbox();
            if active {
                self.backoff.on_activity();
            } else {
                self.backoff.on_idle();
            }
        }

        self.route_outbox();
        info!(addr = %self.shared.addr, peers = self.peers.len(), "poll loop stopped");
    }

    fn accept(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((mut stream, addr)) => {
                    let token = Token(self.next_token);
                    self.next_token += 1;
                    if let Err(e) =
                        self.poll
                            .registry()
                            .register(&mut stream, token, Interest::READABLE)
                    {
                        warn!(peer = %addr, "failed to register connection: {e}");
                        continue;
                    }
                    let _ = stream.set_nodelay(true);
                    debug!(addr = %self.shared.addr, peer = %addr, "accepted connection");
                    self.peers.insert(
                        token,
                        Peer {
                            stream,
                            addr,
                            read_buf: BytesMut::new(),
                            write_buf: BytesMut::new(),
                            writing: false,
                        },
                    );
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(addr = %self.shared.addr, "accept failed: {e}");
                    break;
                }
            }
        }
    }

    /// Read until the socket would block. Returns true if the peer is gone.
    fn read_peer(&mut self, token: Token, inbound: &mut Vec<(Token, Group)>) -> bool {
        let Some(peer) = self.peers.get_mut(&token) else {
            return false;
        };
        let mut chunk = [0u8; READ_CHUNK];
        let mut closed = false;
        loop {
            match peer.stream.read(&mut chunk) {
                Ok(0) => {
                    closed = true;
                    break;
                }
                Ok(n) => peer.read_buf.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!(peer = %peer.addr, "read failed: {e}");
                    closed = true;
                    break;
                }
            }
        }
        loop {
            match self.codec.decode(&mut peer.read_buf) {
                Ok(Some(group)) => inbound.push((token, group)),
                Ok(None) => break,
                Err(e) => {
                    warn!(peer = %peer.addr, "dropping connection: {e}");
                    closed = true;
                    break;
                }
            }
        }
        closed
    }

    /// Write buffered output and fix up interest. Returns true if the peer is gone.
    fn flush_peer(&mut self, token: Token) -> bool {
        let Some(peer) = self.peers.get_mut(&token) else {
            return false;
        };
        while !peer.write_buf.is_empty() {
            match peer.stream.write(&peer.write_buf) {
                Ok(0) => return true,
                Ok(n) => peer.write_buf.advance(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!(peer = %peer.addr, "write failed: {e}");
                    return true;
                }
            }
        }
        let want_write = !peer.write_buf.is_empty();
        if want_write != peer.writing {
            let interest = if want_write {
                Interest::READABLE | Interest::WRITABLE
            } else {
                Interest::READABLE
            };
            if let Err(e) = self
                .poll
                .registry()
                .reregister(&mut peer.stream, token, interest)
            {
                debug!(peer = %peer.addr, "reregister failed: {e}");
                return true;
            }
            peer.writing = want_write;
        }
        false
    }

    fn drop_peer(&mut self, token: Token) {
        if let Some(mut peer) = self.peers.remove(&token) {
            let _ = self.poll.registry().deregister(&mut peer.stream);
            debug!(addr = %self.shared.addr, peer = %peer.addr, "connection closed");
        }
    }

    fn context(&self, token: Token, group: Group) -> Option<RequestContext> {
        match group.into_single() {
            Ok(payload) => Some(RequestContext {
                source: address_frame(token),
                payload: Some(payload),
                shared: self.shared.clone(),
            }),
            Err(e) => {
                warn!(addr = %self.shared.addr, "discarding message: {e}");
                None
            }
        }
    }

    fn deliver(&mut self, inbound: Vec<(Token, Group)>) -> bool {
        let contexts: Vec<RequestContext> = inbound
            .into_iter()
            .filter_map(|(token, group)| self.context(token, group))
            .collect();
        let handler = self.shared.handler.read().clone();
        let Some(handler) = handler else {
            self.held.extend(contexts);
            return false;
        };

        let mut delivered = false;
        for ctx in self.held.drain(..).chain(contexts) {
            delivered = true;
            if panic::catch_unwind(AssertUnwindSafe(|| handler(ctx))).is_err() {
                warn!(addr = %self.shared.addr, "request handler panicked");
            }
        }
        delivered
    }

    /// Move queued replies into peer buffers and start writing them.
    fn route_outbox(&mut self) -> bool {
        let pending = self.shared.take_outbox();
        if pending.is_empty() {
            return false;
        }
        let mut touched = Vec::new();
        for group in pending {
            let (address, rest) = match group.split_route() {
                Ok(split) => split,
                Err(e) => {
                    warn!(addr = %self.shared.addr, "unroutable message: {e}");
                    continue;
                }
            };
            let Some(token) = token_of(&address) else {
                warn!(addr = %self.shared.addr, "bad address frame of {} bytes", address.len());
                continue;
            };
            let Some(peer) = self.peers.get_mut(&token) else {
                debug!(addr = %self.shared.addr, "dropping message for departed peer");
                continue;
            };
            if let Err(e) = self.codec.encode(&rest, &mut peer.write_buf) {
                warn!(peer = %peer.addr, "cannot encode message: {e}");
                continue;
            }
            touched.push(token);
        }
        touched.sort_unstable();
        touched.dedup();
        for token in touched {
            if self.flush_peer(token) {
                self.drop_peer(token);
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpStream as StdStream;
    use std::sync::mpsc;
    use std::time::Duration;

    fn write_message(stream: &mut StdStream, payload: &'static [u8]) {
        let mut codec = FrameCodec::new(1024);
        let mut buf = BytesMut::new();
        codec
            .encode(&Group::single(Bytes::from_static(payload)), &mut buf)
            .unwrap();
        stream.write_all(&buf).unwrap();
    }

    fn read_message(stream: &mut StdStream) -> Bytes {
        let mut codec = FrameCodec::new(1024);
        let mut buf = BytesMut::new();
        let mut chunk = [0u8; 256];
        loop {
            if let Some(group) = codec.decode(&mut buf).unwrap() {
                return group.into_single().unwrap();
            }
            let n = stream.read(&mut chunk).unwrap();
            assert!(n > 0, "server closed the connection");
            buf.extend_from_slice(&chunk[..n]);
        }
    }

    #[test]
    fn port_sentinel() {
        assert_eq!(Port::from_raw(-1), Some(Port::Ephemeral));
        assert_eq!(Port::from_raw(8080), Some(Port::Fixed(8080)));
        assert_eq!(Port::from_raw(70000), None);
    }

    #[test]
    fn ephemeral_bind_reports_real_port() {
        let server = ServerSocket::bind("127.0.0.1", Port::Ephemeral, &Config::default()).unwrap();
        assert!(server.port() >= 1024);
        assert!(StdStream::connect(server.local_addr()).is_ok());
        server.close();
    }

    #[test]
    fn second_bind_on_same_port_fails() {
        let config = Config::default();
        let first = ServerSocket::bind("127.0.0.1", Port::Ephemeral, &config).unwrap();
        let err = ServerSocket::bind("127.0.0.1", Port::Fixed(first.port()), &config)
            .err()
            .unwrap();
        assert!(matches!(err, TransportError::Bind { .. }));
        first.close();
    }

    #[test]
    fn payload_is_consumed_once_and_reply_is_routed() {
        let server = ServerSocket::bind("127.0.0.1", Port::Ephemeral, &Config::default()).unwrap();
        let (tx, rx) = mpsc::channel();
        server.register_handler(move |mut ctx: RequestContext| {
            let first = ctx.recv();
            let second = ctx.recv();
            ctx.send(Bytes::from_static(b"pong")).unwrap();
            tx.send((first, second)).unwrap();
        });

        let mut client = StdStream::connect(server.local_addr()).unwrap();
        write_message(&mut client, b"ping");
        let (first, second) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(&first.unwrap()[..], b"ping");
        assert_eq!(second, Err(ProtocolError::AlreadyConsumed));
        assert_eq!(&read_message(&mut client)[..], b"pong");
        server.close();
    }

    #[test]
    fn messages_before_handler_are_held_in_order() {
        let server = ServerSocket::bind("127.0.0.1", Port::Ephemeral, &Config::default()).unwrap();
        let mut client = StdStream::connect(server.local_addr()).unwrap();
        for payload in [&b"m1"[..], b"m2", b"m3"] {
            let mut codec = FrameCodec::new(1024);
            let mut buf = BytesMut::new();
            codec
                .encode(&Group::single(Bytes::copy_from_slice(payload)), &mut buf)
                .unwrap();
            client.write_all(&buf).unwrap();
        }
        thread::sleep(Duration::from_millis(50));

        let (tx, rx) = mpsc::channel();
        server.register_handler(move |mut ctx: RequestContext| {
            tx.send(ctx.recv().unwrap()).unwrap();
        });
        let got: Vec<Bytes> = (0..3)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        assert_eq!(got, vec![&b"m1"[..], b"m2", b"m3"]);
        server.close();
    }

    #[test]
    fn send_after_close_fails() {
        let server = ServerSocket::bind("127.0.0.1", Port::Ephemeral, &Config::default()).unwrap();
        server.close();
        assert!(!server.is_running());
        let err = server
            .send(Group::routed(address_frame(Token(9)), Bytes::new()))
            .unwrap_err();
        assert!(matches!(err, TransportError::Closed(_)));
    }
}
