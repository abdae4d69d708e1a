//! Client-side sockets and the event loop that drives them.
//!
//! An [`EventLoop`] belongs to the thread that created it: it is built on
//! `Rc` and is therefore neither `Send` nor `Sync`, so handing a loop or a
//! [`ClientSocket`] to another thread is rejected at compile time. Each
//! thread that talks to workers creates its own loop and connects its
//! sockets against it.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream as StdStream, ToSocketAddrs};
use std::rc::{Rc, Weak};
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token};
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::TransportError;
use crate::frame::{FrameCodec, Group};

const READ_CHUNK: usize = 16 * 1024;

/// What a client socket observed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClientEvent {
    Message(Bytes),
    /// The connection is gone; no further events follow.
    Closed(TransportError),
}

type ClientHandler = Rc<dyn Fn(ClientEvent)>;

struct Conn {
    stream: TcpStream,
    addr: SocketAddr,
    read_buf: BytesMut,
    write_buf: BytesMut,
    writing: bool,
    handler: Option<ClientHandler>,
    held: VecDeque<ClientEvent>,
    closed: bool,
}

impl Conn {
    /// Write as much buffered output as the socket takes.
    fn flush(&mut self) -> io::Result<()> {
        while !self.write_buf.is_empty() {
            match self.stream.write(&self.write_buf) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => self.write_buf.advance(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Classify an I/O failure; a peer that went away reports `Closed`.
    fn io_error(&self, e: io::Error) -> TransportError {
        match e.kind() {
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::WriteZero => {
                TransportError::Closed(format!("connection to {}", self.addr))
            }
            _ => e.into(),
        }
    }

    fn close_with(&mut self, err: TransportError) {
        if !self.closed {
            self.closed = true;
            self.held.push_back(ClientEvent::Closed(err));
        }
    }
}

struct LoopInner {
    poll: Poll,
    events: Events,
    conns: HashMap<Token, Conn>,
    next_token: usize,
    codec: FrameCodec,
}

impl LoopInner {
    fn update_interest(&mut self, token: Token) -> io::Result<()> {
        let Some(conn) = self.conns.get_mut(&token) else {
            return Ok(());
        };
        let want_write = !conn.write_buf.is_empty();
        if want_write != conn.writing {
            let interest = if want_write {
                Interest::READABLE | Interest::WRITABLE
            } else {
                Interest::READABLE
            };
            self.poll
                .registry()
                .reregister(&mut conn.stream, token, interest)?;
            conn.writing = want_write;
        }
        Ok(())
    }

    fn read(&mut self, token: Token) {
        let Some(conn) = self.conns.get_mut(&token) else {
            return;
        };
        let mut chunk = [0u8; READ_CHUNK];
        let mut gone = None;
        loop {
            match conn.stream.read(&mut chunk) {
                Ok(0) => {
                    gone = Some(TransportError::Closed(format!("connection to {}", conn.addr)));
                    break;
                }
                Ok(n) => conn.read_buf.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    gone = Some(conn.io_error(e));
                    break;
                }
            }
        }
        loop {
            match self.codec.decode(&mut conn.read_buf) {
                Ok(Some(group)) => match group.into_single() {
                    Ok(payload) => conn.held.push_back(ClientEvent::Message(payload)),
                    Err(e) => warn!(peer = %conn.addr, "discarding message: {e}"),
                },
                Ok(None) => break,
                Err(e) => {
                    gone = Some(TransportError::Io(e.to_string()));
                    break;
                }
            }
        }
        if let Some(err) = gone {
            debug!(peer = %conn.addr, "client connection closed: {err}");
            conn.close_with(err);
            let _ = self.poll.registry().deregister(&mut conn.stream);
        }
    }

    fn write(&mut self, token: Token) {
        let Some(conn) = self.conns.get_mut(&token) else {
            return;
        };
        if let Err(e) = conn.flush() {
            let err = conn.io_error(e);
            conn.close_with(err);
            let _ = self.poll.registry().deregister(&mut conn.stream);
            return;
        }
        if let Err(e) = self.update_interest(token) {
            warn!("failed to update interest: {e}");
        }
    }

    /// Events ready for delivery, removing connections that reported closure.
    fn take_ready(&mut self) -> Vec<(ClientHandler, ClientEvent)> {
        let mut ready = Vec::new();
        let mut finished = Vec::new();
        for (token, conn) in self.conns.iter_mut() {
            let Some(handler) = conn.handler.clone() else {
                continue;
            };
            while let Some(event) = conn.held.pop_front() {
                ready.push((handler.clone(), event));
            }
            if conn.closed {
                finished.push(*token);
            }
        }
        for token in finished {
            self.conns.remove(&token);
        }
        ready
    }

    fn has_ready(&self) -> bool {
        self.conns
            .values()
            .any(|c| c.handler.is_some() && !c.held.is_empty())
    }
}

/// Per-thread loop multiplexing every client socket created against it.
#[derive(Clone)]
pub struct EventLoop {
    inner: Rc<RefCell<LoopInner>>,
}

impl EventLoop {
    pub fn new(config: &Config) -> Result<Self, TransportError> {
        Ok(Self {
            inner: Rc::new(RefCell::new(LoopInner {
                poll: Poll::new()?,
                events: Events::with_capacity(256),
                conns: HashMap::new(),
                next_token: 0,
                codec: FrameCodec::new(config.max_frame_len),
            })),
        })
    }

    /// Number of live connections.
    pub fn connections(&self) -> usize {
        self.inner.borrow().conns.len()
    }

    /// Poll once, waiting at most `timeout`, and run handlers for whatever
    /// arrived. Returns the number of events delivered.
    ///
    /// Handlers run after the loop's internal state is released, so they
    /// may send, connect or even turn the loop again.
    pub fn turn(&self, timeout: Duration) -> Result<usize, TransportError> {
        let ready = {
            let mut guard = self.inner.borrow_mut();
            let inner = &mut *guard;
            let timeout = if inner.has_ready() {
                Duration::ZERO
            } else {
                timeout
            };
            match inner.poll.poll(&mut inner.events, Some(timeout)) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
            let tokens: Vec<(Token, bool, bool)> = inner
                .events
                .iter()
                .map(|ev| {
                    (
                        ev.token(),
                        ev.is_readable() || ev.is_read_closed() || ev.is_error(),
                        ev.is_writable(),
                    )
                })
                .collect();
            for (token, readable, writable) in tokens {
                if readable {
                    inner.read(token);
                }
                if writable {
                    inner.write(token);
                }
            }
            inner.take_ready()
        };

        let delivered = ready.len();
        for (handler, event) in ready {
            handler(event);
        }
        Ok(delivered)
    }
}

/// Connection to one server endpoint, driven by the loop it was created on.
pub struct ClientSocket {
    token: Token,
    addr: SocketAddr,
    event_loop: Weak<RefCell<LoopInner>>,
}

impl ClientSocket {
    /// Connect to `host:port` and register with `event_loop`.
    pub fn connect(event_loop: &EventLoop, host: &str, port: u16) -> Result<Self, TransportError> {
        let display = format!("{host}:{port}");
        let connect_err = |reason: String| TransportError::Connect {
            addr: display.clone(),
            reason,
        };
        let addr = (host, port)
            .to_socket_addrs()
            .map_err(|e| connect_err(e.to_string()))?
            .next()
            .ok_or_else(|| connect_err("host did not resolve".into()))?;
        let std_stream = StdStream::connect(addr).map_err(|e| connect_err(e.to_string()))?;
        std_stream
            .set_nodelay(true)
            .and_then(|_| std_stream.set_nonblocking(true))
            .map_err(|e| connect_err(e.to_string()))?;
        let mut stream = TcpStream::from_std(std_stream);

        let mut inner = event_loop.inner.borrow_mut();
        let token = Token(inner.next_token);
        inner.next_token += 1;
        inner
            .poll
            .registry()
            .register(&mut stream, token, Interest::READABLE)
            .map_err(|e| connect_err(e.to_string()))?;
        inner.conns.insert(
            token,
            Conn {
                stream,
                addr,
                read_buf: BytesMut::new(),
                write_buf: BytesMut::new(),
                writing: false,
                handler: None,
                held: VecDeque::new(),
                closed: false,
            },
        );
        debug!(peer = %addr, "client connected");
        Ok(Self {
            token,
            addr,
            event_loop: Rc::downgrade(&event_loop.inner),
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Install the callback for this connection's events.
    pub fn set_handler<F>(&self, handler: F)
    where
        F: Fn(ClientEvent) + 'static,
    {
        if let Some(inner) = self.event_loop.upgrade() {
            if let Some(conn) = inner.borrow_mut().conns.get_mut(&self.token) {
                conn.handler = Some(Rc::new(handler));
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        match self.event_loop.upgrade() {
            Some(inner) => inner
                .borrow()
                .conns
                .get(&self.token)
                .map_or(true, |c| c.closed),
            None => true,
        }
    }

    /// Send one payload, writing immediately as far as the socket allows.
    ///
    /// Whatever does not fit is flushed by later turns of the loop.
    pub fn send(&self, payload: Bytes) -> Result<(), TransportError> {
        let closed = || TransportError::Closed(format!("connection to {}", self.addr));
        let inner = self.event_loop.upgrade().ok_or_else(closed)?;
        let mut guard = inner.borrow_mut();
        let inner = &mut *guard;
        let conn = match inner.conns.get_mut(&self.token) {
            Some(conn) if !conn.closed => conn,
            _ => return Err(closed()),
        };
        inner
            .codec
            .encode(&Group::single(payload), &mut conn.write_buf)
            .map_err(|e| TransportError::Io(e.to_string()))?;
        if let Err(e) = conn.flush() {
            let err = conn.io_error(e);
            conn.close_with(err.clone());
            let _ = inner.poll.registry().deregister(&mut conn.stream);
            return Err(err);
        }
        inner.update_interest(self.token)?;
        Ok(())
    }

    /// Drop the connection without waiting for buffered output.
    pub fn close(&self) {
        if let Some(inner) = self.event_loop.upgrade() {
            if let Ok(mut inner) = inner.try_borrow_mut() {
                if let Some(mut conn) = inner.conns.remove(&self.token) {
                    let _ = inner.poll.registry().deregister(&mut conn.stream);
                }
            }
        }
    }
}

impl Drop for ClientSocket {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::{Port, RequestContext, ServerSocket};
    use std::cell::RefCell;
    use std::time::Instant;

    fn turn_until(event_loop: &EventLoop, mut done: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done() {
            assert!(Instant::now() < deadline, "timed out");
            event_loop.turn(Duration::from_millis(10)).unwrap();
        }
    }

    #[test]
    fn messages_arrive_in_send_order() {
        let config = Config::default();
        let server = ServerSocket::bind("127.0.0.1", Port::Ephemeral, &config).unwrap();
        server.register_handler(|mut ctx: RequestContext| {
            let payload = ctx.recv().unwrap();
            ctx.send(payload).unwrap();
        });

        let event_loop = EventLoop::new(&config).unwrap();
        let client = ClientSocket::connect(&event_loop, "127.0.0.1", server.port()).unwrap();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        client.set_handler(move |event| {
            if let ClientEvent::Message(m) = event {
                sink.borrow_mut().push(m);
            }
        });
        for m in ["m1", "m2", "m3"] {
            client.send(Bytes::from(m)).unwrap();
        }
        turn_until(&event_loop, || seen.borrow().len() == 3);
        assert_eq!(*seen.borrow(), vec!["m1", "m2", "m3"]);
        server.close();
    }

    #[test]
    fn connect_to_closed_port_fails() {
        let config = Config::default();
        let server = ServerSocket::bind("127.0.0.1", Port::Ephemeral, &config).unwrap();
        let port = server.port();
        server.close();

        let event_loop = EventLoop::new(&config).unwrap();
        let err = ClientSocket::connect(&event_loop, "127.0.0.1", port)
            .err()
            .unwrap();
        assert!(matches!(err, TransportError::Connect { .. }));
    }

    #[test]
    fn server_close_is_reported() {
        let config = Config::default();
        let server = ServerSocket::bind("127.0.0.1", Port::Ephemeral, &config).unwrap();
        let event_loop = EventLoop::new(&config).unwrap();
        let client = ClientSocket::connect(&event_loop, "127.0.0.1", server.port()).unwrap();
        let closed = Rc::new(RefCell::new(false));
        let flag = closed.clone();
        client.set_handler(move |event| {
            if let ClientEvent::Closed(_) = event {
                *flag.borrow_mut() = true;
            }
        });
        server.close();
        turn_until(&event_loop, || *closed.borrow());
        assert!(client.is_closed());
        assert!(client.send(Bytes::from_static(b"late")).is_err());
    }
}
