//! Request/response routing over client sockets.
//!
//! An [`RpcClient`] owns one connection to one worker. Each call gets a
//! fresh request id and a oneshot channel; the connection's handler
//! resolves the matching channel when the reply arrives and fails every
//! outstanding call when the connection closes. Futures are driven by
//! turning the caller's [`EventLoop`].

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;
use std::time::{Duration, Instant};

use futures::channel::oneshot;
use tracing::{debug, warn};

use crate::client::{ClientEvent, ClientSocket, EventLoop};
use crate::cluster::{WorkerId, WorkerSpec};
use crate::error::{Error, TransportError};
use crate::protocol::{Envelope, Request, Response};

type Reply = Result<Response, Error>;
type Pending = Rc<RefCell<HashMap<u64, oneshot::Sender<Reply>>>>;

/// Connection to one worker, bound to the loop it was created on.
pub struct RpcClient {
    worker: WorkerId,
    socket: ClientSocket,
    pending: Pending,
    next_id: Cell<u64>,
}

impl RpcClient {
    pub fn connect(
        event_loop: &EventLoop,
        worker: WorkerId,
        spec: &WorkerSpec,
    ) -> Result<Self, Error> {
        let socket = ClientSocket::connect(event_loop, &spec.host, spec.port)?;
        let pending: Pending = Rc::new(RefCell::new(HashMap::new()));

        let table = pending.clone();
        socket.set_handler(move |event| match event {
            ClientEvent::Message(bytes) => match Envelope::<Response>::from_bytes(&bytes) {
                Ok(envelope) => {
                    let waiter = table.borrow_mut().remove(&envelope.id);
                    match waiter {
                        Some(tx) => {
                            let _ = tx.send(Ok(envelope.body));
                        }
                        None => debug!(%worker, id = envelope.id, "reply for abandoned request"),
                    }
                }
                Err(e) => warn!(%worker, "undecodable reply: {e}"),
            },
            ClientEvent::Closed(err) => {
                let waiters: Vec<_> = table.borrow_mut().drain().collect();
                if !waiters.is_empty() {
                    warn!(%worker, outstanding = waiters.len(), "connection lost: {err}");
                }
                for (_, tx) in waiters {
                    let _ = tx.send(Err(err.clone().into()));
                }
            }
        });

        Ok(Self {
            worker,
            socket,
            pending,
            next_id: Cell::new(1),
        })
    }

    pub fn worker(&self) -> WorkerId {
        self.worker
    }

    pub fn is_closed(&self) -> bool {
        self.socket.is_closed()
    }

    /// Number of calls awaiting a reply.
    pub fn outstanding(&self) -> usize {
        self.pending.borrow().len()
    }

    /// Send a request; the future resolves with the raw response.
    pub fn call(&self, request: Request) -> Future<Response> {
        self.call_map(request, Ok)
    }

    /// Send a request and convert the reply with `map` once it arrives.
    pub fn call_map<T>(&self, request: Request, map: fn(Response) -> Result<T, Error>) -> Future<T> {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        let kind = request.kind();

        let bytes = match Envelope::new(id, request).to_bytes() {
            Ok(bytes) => bytes,
            Err(e) => return Future::failed(e.into()),
        };
        let (tx, rx) = oneshot::channel();
        self.pending.borrow_mut().insert(id, tx);
        if let Err(e) = self.socket.send(bytes) {
            self.pending.borrow_mut().remove(&id);
            return Future::failed(e.into());
        }
        debug!(worker = %self.worker, id, kind, "request sent");
        Future {
            state: State::Waiting {
                rx,
                map,
                what: format!("{kind} reply from {}", self.worker),
            },
        }
    }
}

enum State<T> {
    Ready(Result<T, Error>),
    Waiting {
        rx: oneshot::Receiver<Reply>,
        map: fn(Response) -> Result<T, Error>,
        what: String,
    },
}

/// Handle to a pending result that resolves exactly once.
pub struct Future<T> {
    state: State<T>,
}

impl<T> Future<T> {
    pub fn ready(value: T) -> Self {
        Self {
            state: State::Ready(Ok(value)),
        }
    }

    pub fn failed(err: Error) -> Self {
        Self {
            state: State::Ready(Err(err)),
        }
    }

    /// Check for the reply without blocking. Returns true once resolved.
    pub fn poll(&mut self) -> bool {
        let resolved = match &mut self.state {
            State::Ready(_) => return true,
            State::Waiting { rx, map, what } => match rx.try_recv() {
                Ok(None) => return false,
                Ok(Some(Ok(response))) => map(response),
                Ok(Some(Err(e))) => Err(e),
                Err(_) => Err(TransportError::Closed(what.clone()).into()),
            },
        };
        self.state = State::Ready(resolved);
        true
    }

    /// Block, turning `event_loop`, until the result arrives or `timeout`
    /// passes.
    pub fn wait(mut self, event_loop: &EventLoop, timeout: Duration) -> Result<T, Error> {
        let deadline = Instant::now() + timeout;
        while !self.poll() {
            let now = Instant::now();
            if now >= deadline {
                return Err(TransportError::Timeout(self.describe()).into());
            }
            event_loop.turn(deadline - now)?;
        }
        self.into_result()
    }

    fn describe(&self) -> String {
        match &self.state {
            State::Waiting { what, .. } => what.clone(),
            State::Ready(_) => "resolved future".into(),
        }
    }

    fn into_result(self) -> Result<T, Error> {
        match self.state {
            State::Ready(result) => result,
            State::Waiting { what, .. } => Err(TransportError::Timeout(what).into()),
        }
    }
}

/// Several futures waited on together.
pub struct FutureGroup<T> {
    futures: Vec<Future<T>>,
}

impl<T> Default for FutureGroup<T> {
    fn default() -> Self {
        Self {
            futures: Vec::new(),
        }
    }
}

impl<T> FutureGroup<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, future: Future<T>) {
        self.futures.push(future);
    }

    pub fn extend(&mut self, other: FutureGroup<T>) {
        self.futures.extend(other.futures);
    }

    pub fn len(&self) -> usize {
        self.futures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.futures.is_empty()
    }

    /// Wait for every future, in issue order.
    ///
    /// Fails fast: the first error observed is returned without waiting
    /// for the rest.
    pub fn wait_all(self, event_loop: &EventLoop, timeout: Duration) -> Result<Vec<T>, Error> {
        let deadline = Instant::now() + timeout;
        let mut results: Vec<Option<T>> = Vec::with_capacity(self.futures.len());
        results.resize_with(self.futures.len(), || None);
        let mut waiting: Vec<(usize, Future<T>)> = self.futures.into_iter().enumerate().collect();

        loop {
            let mut i = 0;
            while i < waiting.len() {
                if waiting[i].1.poll() {
                    let (slot, future) = waiting.swap_remove(i);
                    results[slot] = Some(future.into_result()?);
                } else {
                    i += 1;
                }
            }
            if waiting.is_empty() {
                break;
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(TransportError::Timeout(format!(
                    "{} outstanding replies, first: {}",
                    waiting.len(),
                    waiting[0].1.describe()
                ))
                .into());
            }
            event_loop.turn(deadline - now)?;
        }
        Ok(results.into_iter().flatten().collect())
    }

    /// Wait until every future has resolved, then return the results in
    /// issue order or the first failure in issue order.
    ///
    /// Unlike [`wait_all`](Self::wait_all) nothing is left in flight when
    /// this returns, unless the deadline passes.
    pub fn settle_all(self, event_loop: &EventLoop, timeout: Duration) -> Result<Vec<T>, Error> {
        let deadline = Instant::now() + timeout;
        let mut futures = self.futures;
        loop {
            let mut outstanding = 0;
            for future in futures.iter_mut() {
                if !future.poll() {
                    outstanding += 1;
                }
            }
            if outstanding == 0 {
                break;
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(TransportError::Timeout(format!(
                    "{outstanding} outstanding replies"
                ))
                .into());
            }
            event_loop.turn(deadline - now)?;
        }
        futures.into_iter().map(Future::into_result).collect()
    }
}

impl<T> From<Future<T>> for FutureGroup<T> {
    fn from(future: Future<T>) -> Self {
        Self {
            futures: vec![future],
        }
    }
}

impl<T> FromIterator<Future<T>> for FutureGroup<T> {
    fn from_iter<I: IntoIterator<Item = Future<T>>>(iter: I) -> Self {
        Self {
            futures: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::error::KernelError;
    use crate::server::{Port, RequestContext, ServerSocket};
    use tessel_array::Extent;

    fn echo_server(config: &Config) -> ServerSocket {
        let server = ServerSocket::bind("127.0.0.1", Port::Ephemeral, config).unwrap();
        server.register_handler(|mut ctx: RequestContext| {
            let bytes = ctx.recv().unwrap();
            let env: Envelope<Request> = Envelope::from_bytes(&bytes).unwrap();
            let body = match env.body {
                Request::Ping(n) => Response::Pong(n),
                _ => Response::Error(
                    KernelError {
                        kernel: "k".into(),
                        extent: Extent::scalar(),
                        worker: WorkerId(0),
                        message: "nope".into(),
                    }
                    .into(),
                ),
            };
            ctx.send(Envelope::new(env.id, body).to_bytes().unwrap()).unwrap();
        });
        server
    }

    #[test]
    fn replies_resolve_matching_calls() {
        let config = Config::default();
        let server = echo_server(&config);
        let event_loop = EventLoop::new(&config).unwrap();
        let spec = WorkerSpec::new("127.0.0.1", server.port(), 1);
        let client = RpcClient::connect(&event_loop, WorkerId(0), &spec).unwrap();

        let group: FutureGroup<u64> = (0..5)
            .map(|n| client.call_map(Request::Ping(n), Response::into_pong))
            .collect();
        let pongs = group.wait_all(&event_loop, Duration::from_secs(5)).unwrap();
        assert_eq!(pongs, vec![0, 1, 2, 3, 4]);
        assert_eq!(client.outstanding(), 0);
        server.close();
    }

    #[test]
    fn group_fails_fast_on_remote_error() {
        let config = Config::default();
        let server = echo_server(&config);
        let event_loop = EventLoop::new(&config).unwrap();
        let spec = WorkerSpec::new("127.0.0.1", server.port(), 1);
        let client = RpcClient::connect(&event_loop, WorkerId(0), &spec).unwrap();

        let mut group = FutureGroup::new();
        group.push(client.call_map(Request::Ping(1), Response::into_ack));
        group.push(client.call_map(Request::Shutdown, Response::into_ack));
        let err = group
            .wait_all(&event_loop, Duration::from_secs(5))
            .unwrap_err();
        assert!(matches!(err, Error::Kernel(_) | Error::Protocol(_)));
        server.close();
    }

    #[test]
    fn settle_waits_for_every_reply() {
        let config = Config::default();
        let server = echo_server(&config);
        let event_loop = EventLoop::new(&config).unwrap();
        let spec = WorkerSpec::new("127.0.0.1", server.port(), 1);
        let client = RpcClient::connect(&event_loop, WorkerId(0), &spec).unwrap();

        let mut group = FutureGroup::new();
        group.push(client.call_map(Request::Shutdown, Response::into_pong));
        for n in 0..4 {
            group.push(client.call_map(Request::Ping(n), Response::into_pong));
        }
        let err = group
            .settle_all(&event_loop, Duration::from_secs(5))
            .unwrap_err();
        assert!(matches!(err, Error::Kernel(_)));
        assert_eq!(client.outstanding(), 0);
        server.close();
    }

    #[test]
    fn closing_the_server_fails_outstanding_calls() {
        let config = Config::default();
        let server = ServerSocket::bind("127.0.0.1", Port::Ephemeral, &config).unwrap();
        server.register_handler(|_ctx: RequestContext| {});
        let event_loop = EventLoop::new(&config).unwrap();
        let spec = WorkerSpec::new("127.0.0.1", server.port(), 1);
        let client = RpcClient::connect(&event_loop, WorkerId(3), &spec).unwrap();

        let future = client.call(Request::Ping(9));
        server.close();
        let err = future
            .wait(&event_loop, Duration::from_secs(5))
            .unwrap_err();
        assert!(matches!(err, Error::Transport(TransportError::Closed(_))));
    }

    #[test]
    fn ready_futures_need_no_loop_turns() {
        let event_loop = EventLoop::new(&Config::default()).unwrap();
        let mut group = FutureGroup::new();
        group.push(Future::ready(1));
        group.push(Future::ready(2));
        assert_eq!(group.wait_all(&event_loop, Duration::ZERO).unwrap(), vec![1, 2]);
    }
}
