//! Single-threaded event loop multiplexing a disjoint subset of
//! connections.
//!
//! Each reactor owns one OS thread blocking in [`mio::Poll::poll`], with the
//! poll timeout derived from the nearest pending call deadline. Work arrives
//! from other threads (clients, acceptors, service workers) through a
//! submission queue paired with a [`mio::Waker`]; everything else — frame
//! I/O, deadline expiry, completion callbacks — runs on the reactor's own
//! thread, which is what makes per-connection state single-threaded by
//! construction.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use mio::event::Event;
use mio::net::TcpStream;
use mio::{Events, Poll, Token, Waker};
use parking_lot::Mutex;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::connection::{Connection, FrameCtx, initial_interest};
use crate::error::RpcError;
use crate::messenger::MessengerShared;
use crate::outbound_call::{CallState, OutboundCall};
use crate::protocol::ResponseEnvelope;

const WAKER_TOKEN: Token = Token(usize::MAX);
const EVENT_CAPACITY: usize = 256;

/// Work submitted to a reactor from another thread.
pub(crate) enum ReactorOp {
    /// A newly issued outbound call to send.
    AssignOutbound(OutboundCall),
    /// A newly accepted inbound connection to adopt.
    AssignInbound {
        stream: std::net::TcpStream,
        peer: SocketAddr,
    },
    /// A completed service response to write back.
    Respond {
        token: Token,
        envelope: ResponseEnvelope,
    },
    /// Stop the reactor, cancelling everything in flight.
    Shutdown,
}

/// Thread-safe handle for submitting ops to a reactor and waking its poll
/// loop.
#[derive(Clone)]
pub(crate) struct ReactorSender {
    ops: flume::Sender<ReactorOp>,
    waker: Arc<Waker>,
}

impl ReactorSender {
    /// Submit an op, returning it on failure so the caller can dispose of
    /// it (e.g. fail the contained call).
    pub(crate) fn submit(&self, op: ReactorOp) -> Result<(), ReactorOp> {
        match self.ops.send(op) {
            Ok(()) => {
                let _ = self.waker.wake();
                Ok(())
            }
            Err(flume::SendError(op)) => Err(op),
        }
    }
}

/// Routes a service response back to the reactor owning the connection the
/// request arrived on.
pub(crate) struct Responder {
    reactor: ReactorSender,
    token: Token,
}

impl Responder {
    pub(crate) fn new(reactor: ReactorSender, token: Token) -> Self {
        Self { reactor, token }
    }

    /// Returns false if the reactor is gone and the response was dropped.
    pub(crate) fn respond(self, envelope: ResponseEnvelope) -> bool {
        self.reactor
            .submit(ReactorOp::Respond {
                token: self.token,
                envelope,
            })
            .is_ok()
    }
}

/// Owning handle for one reactor thread, held by the messenger.
pub(crate) struct ReactorHandle {
    name: String,
    sender: ReactorSender,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl ReactorHandle {
    /// Spawn a reactor thread with its own poll instance.
    pub(crate) fn spawn(name: String, shared: Arc<MessengerShared>) -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        let (ops_tx, ops_rx) = flume::unbounded();
        let sender = ReactorSender {
            ops: ops_tx,
            waker,
        };

        let mut reactor = Reactor {
            name: name.clone(),
            poll,
            ops: ops_rx,
            sender: sender.clone(),
            shared,
            conns: HashMap::new(),
            outbound_index: HashMap::new(),
            deadlines: BinaryHeap::new(),
            next_token: 0,
        };
        let join = thread::Builder::new()
            .name(name.clone())
            .spawn(move || reactor.run())?;

        Ok(Self {
            name,
            sender,
            join: Mutex::new(Some(join)),
        })
    }

    pub(crate) fn submit(&self, op: ReactorOp) -> Result<(), ReactorOp> {
        self.sender.submit(op)
    }

    /// Stop the reactor thread and wait for it to exit. Idempotent.
    pub(crate) fn shutdown(&self) {
        let _ = self.sender.submit(ReactorOp::Shutdown);
        if let Some(join) = self.join.lock().take() {
            if join.join().is_err() {
                error!(reactor = %self.name, "reactor thread panicked");
            }
        }
    }
}

/// Entry in the deadline min-heap. Ordered by expiry time first.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
struct DeadlineEntry {
    when: Instant,
    token: Token,
    call_id: Uuid,
    timeout: Duration,
}

struct Reactor {
    name: String,
    poll: Poll,
    ops: flume::Receiver<ReactorOp>,
    sender: ReactorSender,
    shared: Arc<MessengerShared>,
    conns: HashMap<Token, Connection>,
    /// Open client connections by remote address, for reuse.
    outbound_index: HashMap<SocketAddr, Token>,
    deadlines: BinaryHeap<Reverse<DeadlineEntry>>,
    next_token: usize,
}

impl Reactor {
    fn run(&mut self) {
        debug!(reactor = %self.name, "reactor thread running");
        let mut events = Events::with_capacity(EVENT_CAPACITY);
        loop {
            let timeout = self.poll_timeout();
            if let Err(e) = self.poll.poll(&mut events, timeout) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!(reactor = %self.name, "poll failed: {e}");
                break;
            }
            for event in events.iter() {
                if event.token() != WAKER_TOKEN {
                    self.handle_event(event);
                }
            }
            if self.drain_ops() {
                break;
            }
            self.expire_deadlines();
        }
        self.teardown();
    }

    /// Block until the nearest deadline; block indefinitely when none is
    /// pending (the waker interrupts either way).
    fn poll_timeout(&self) -> Option<Duration> {
        self.deadlines
            .peek()
            .map(|Reverse(entry)| entry.when.saturating_duration_since(Instant::now()))
    }

    fn handle_event(&mut self, event: &Event) {
        let token = event.token();
        if let Err(e) = self.drive_conn(token, event) {
            self.close_conn(token, &e);
        }
    }

    fn drive_conn(&mut self, token: Token, event: &Event) -> io::Result<()> {
        let Some(conn) = self.conns.get_mut(&token) else {
            return Ok(());
        };
        let ctx = FrameCtx {
            shared: &*self.shared,
            reactor_tx: &self.sender,
        };

        if conn.is_connecting() {
            if !conn.on_connect_ready()? {
                return Ok(());
            }
        }
        if event.is_readable() || event.is_read_closed() {
            conn.on_readable(&ctx)?;
        }
        conn.flush()?;
        conn.update_registration(self.poll.registry())
    }

    /// Returns true once a shutdown op has been received.
    fn drain_ops(&mut self) -> bool {
        let mut shutdown = false;
        while let Ok(op) = self.ops.try_recv() {
            match op {
                ReactorOp::AssignOutbound(call) => self.assign_outbound(call),
                ReactorOp::AssignInbound { stream, peer } => self.assign_inbound(stream, peer),
                ReactorOp::Respond { token, envelope } => self.queue_response(token, &envelope),
                ReactorOp::Shutdown => shutdown = true,
            }
        }
        shutdown
    }

    fn assign_outbound(&mut self, mut call: OutboundCall) {
        call.set_state(CallState::OnOutboundQueue);
        let remote = call.remote();
        let token = match self.outbound_token(remote) {
            Ok(token) => token,
            Err(e) => {
                call.finish(Err(RpcError::ConnectionFailed {
                    addr: remote,
                    detail: e.to_string(),
                }));
                return;
            }
        };
        // Armed at enqueue time so the deadline also covers queueing and
        // connection establishment.
        if let Some(when) = call.deadline() {
            self.deadlines.push(Reverse(DeadlineEntry {
                when,
                token,
                call_id: call.call_id(),
                timeout: call.timeout(),
            }));
        }
        let Some(conn) = self.conns.get_mut(&token) else {
            return;
        };
        conn.submit_call(call);
        if let Err(e) = conn
            .flush()
            .and_then(|()| conn.update_registration(self.poll.registry()))
        {
            self.close_conn(token, &e);
        }
    }

    /// Find or open the client connection for a remote.
    fn outbound_token(&mut self, remote: SocketAddr) -> io::Result<Token> {
        if let Some(token) = self.outbound_index.get(&remote) {
            return Ok(*token);
        }
        let mut stream = TcpStream::connect(remote)?;
        let token = self.alloc_token();
        self.poll
            .registry()
            .register(&mut stream, token, initial_interest(true))?;
        debug!(reactor = %self.name, %remote, ?token, "opening connection");
        self.conns
            .insert(token, Connection::outbound(token, stream, remote));
        self.outbound_index.insert(remote, token);
        Ok(token)
    }

    fn assign_inbound(&mut self, stream: std::net::TcpStream, peer: SocketAddr) {
        let mut stream = TcpStream::from_std(stream);
        let token = self.alloc_token();
        if let Err(e) = self
            .poll
            .registry()
            .register(&mut stream, token, initial_interest(false))
        {
            warn!(reactor = %self.name, %peer, "failed to register inbound connection: {e}");
            return;
        }
        debug!(reactor = %self.name, %peer, ?token, "adopted inbound connection");
        self.conns
            .insert(token, Connection::inbound(token, stream, peer));
    }

    fn queue_response(&mut self, token: Token, envelope: &ResponseEnvelope) {
        let Some(conn) = self.conns.get_mut(&token) else {
            debug!(
                reactor = %self.name,
                call_id = %envelope.call_id,
                "connection gone; dropping response"
            );
            return;
        };
        conn.queue_response(envelope);
        if let Err(e) = conn
            .flush()
            .and_then(|()| conn.update_registration(self.poll.registry()))
        {
            self.close_conn(token, &e);
        }
    }

    fn expire_deadlines(&mut self) {
        let now = Instant::now();
        loop {
            match self.deadlines.peek() {
                Some(Reverse(entry)) if entry.when <= now => {}
                _ => return,
            }
            let Some(Reverse(entry)) = self.deadlines.pop() else {
                return;
            };
            // Stale entries for already-finished calls simply miss here.
            let Some(conn) = self.conns.get_mut(&entry.token) else {
                continue;
            };
            let Some(call) = conn.take_call(entry.call_id) else {
                continue;
            };
            debug!(
                reactor = %self.name,
                call_id = %entry.call_id,
                method = %call.method(),
                "expiring call past its deadline"
            );
            call.finish(Err(RpcError::TimedOut(entry.timeout)));
        }
    }

    fn close_conn(&mut self, token: Token, error: &io::Error) {
        let Some(mut conn) = self.conns.remove(&token) else {
            return;
        };
        let _ = self.poll.registry().deregister(conn.stream_mut());
        if conn.is_outbound() && self.outbound_index.get(&conn.peer()) == Some(&token) {
            self.outbound_index.remove(&conn.peer());
        }
        let detail = error.to_string();
        debug!(reactor = %self.name, peer = %conn.peer(), "closing connection: {detail}");
        conn.fail_all(
            &RpcError::ConnectionFailed {
                addr: conn.peer(),
                detail: detail.clone(),
            },
            &RpcError::ConnectionTornDown {
                addr: conn.peer(),
                detail,
            },
        );
    }

    /// Cancel everything and release the connection set. Runs once, as the
    /// last act of the reactor thread.
    fn teardown(&mut self) {
        debug!(reactor = %self.name, conns = self.conns.len(), "reactor shutting down");
        for (_, mut conn) in self.conns.drain() {
            let _ = self.poll.registry().deregister(conn.stream_mut());
            conn.fail_all(&RpcError::Aborted, &RpcError::Aborted);
        }
        self.outbound_index.clear();
        while let Ok(op) = self.ops.try_recv() {
            if let ReactorOp::AssignOutbound(call) = op {
                call.finish(Err(RpcError::Aborted));
            }
        }
    }

    fn alloc_token(&mut self) -> Token {
        // Tokens are never reused, so a stale responder can never address a
        // different connection.
        let token = Token(self.next_token);
        self.next_token += 1;
        token
    }
}
