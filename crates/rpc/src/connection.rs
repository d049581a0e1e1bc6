//! Per-connection state, owned and driven by exactly one reactor thread.
//!
//! A connection is either client-outbound (carrying outbound calls and
//! matching their responses by call id) or server-inbound (decoding request
//! frames and feeding the service queue). All read/write state mutation
//! happens on the owning reactor's thread.

use std::collections::{HashMap, VecDeque};
use std::io::{self, Read, Write};
use std::net::SocketAddr;

use bytes::{Buf, Bytes, BytesMut};
use flume::TrySendError;
use mio::net::TcpStream;
use mio::{Interest, Registry, Token};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::error::RpcError;
use crate::messenger::MessengerShared;
use crate::outbound_call::{CallState, OutboundCall};
use crate::protocol::{
    self, ErrorCode, Frame, FrameCodec, FrameType, RequestEnvelope, ResponseEnvelope,
};
use crate::reactor::{ReactorSender, Responder};
use crate::service::InboundCall;

const READ_CHUNK: usize = 8 * 1024;

/// Reactor-owned context handed to frame dispatch: the route into the
/// service queue and the handle workers use to send responses back.
pub(crate) struct FrameCtx<'a> {
    pub(crate) shared: &'a MessengerShared,
    pub(crate) reactor_tx: &'a ReactorSender,
}

#[derive(Clone, Copy)]
enum ConnState {
    /// Outbound connection with a non-blocking connect still in progress.
    Connecting,
    /// Established in both directions.
    Open,
}

pub(crate) struct Connection {
    token: Token,
    stream: TcpStream,
    peer: SocketAddr,
    outbound: bool,
    state: ConnState,
    codec: FrameCodec,
    read_buf: BytesMut,
    write_buf: BytesMut,
    /// Outbound calls queued behind connection establishment.
    pending: VecDeque<OutboundCall>,
    /// Outbound calls whose request has been written, keyed by call id.
    awaiting: HashMap<Uuid, OutboundCall>,
    registered: Interest,
}

impl Connection {
    pub(crate) fn outbound(token: Token, stream: TcpStream, peer: SocketAddr) -> Self {
        Self::new(token, stream, peer, true, ConnState::Connecting)
    }

    pub(crate) fn inbound(token: Token, stream: TcpStream, peer: SocketAddr) -> Self {
        Self::new(token, stream, peer, false, ConnState::Open)
    }

    fn new(
        token: Token,
        stream: TcpStream,
        peer: SocketAddr,
        outbound: bool,
        state: ConnState,
    ) -> Self {
        Self {
            token,
            stream,
            peer,
            outbound,
            state,
            codec: FrameCodec::new(),
            read_buf: BytesMut::new(),
            write_buf: BytesMut::new(),
            pending: VecDeque::new(),
            awaiting: HashMap::new(),
            registered: initial_interest(outbound),
        }
    }

    pub(crate) fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub(crate) fn is_outbound(&self) -> bool {
        self.outbound
    }

    pub(crate) fn is_connecting(&self) -> bool {
        matches!(self.state, ConnState::Connecting)
    }

    pub(crate) fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    /// Queue an outbound call on this connection, sending it immediately if
    /// the connection is established.
    pub(crate) fn submit_call(&mut self, call: OutboundCall) {
        match self.state {
            ConnState::Connecting => self.pending.push_back(call),
            ConnState::Open => self.send_call(call),
        }
    }

    fn send_call(&mut self, mut call: OutboundCall) {
        let bytes = match call.encode_request() {
            Ok(bytes) => bytes,
            Err(e) => {
                call.finish(Err(RpcError::ConnectionFailed {
                    addr: self.peer,
                    detail: format!("failed to encode request: {e}"),
                }));
                return;
            }
        };
        let frame = Frame::new(FrameType::Request, bytes);
        if let Err(e) = self.codec.encode(&frame, &mut self.write_buf) {
            call.finish(Err(RpcError::ConnectionFailed {
                addr: self.peer,
                detail: format!("failed to frame request: {e}"),
            }));
            return;
        }
        call.set_state(CallState::Sent);
        call.set_state(CallState::InFlight);
        self.awaiting.insert(call.call_id(), call);
    }

    /// Progress a non-blocking connect. Returns true once established, at
    /// which point any queued calls are written out.
    pub(crate) fn on_connect_ready(&mut self) -> io::Result<bool> {
        if let Some(e) = self.stream.take_error()? {
            return Err(e);
        }
        match self.stream.peer_addr() {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotConnected => return Ok(false),
            Err(e) => return Err(e),
        }
        debug!(peer = %self.peer, "connection established");
        self.state = ConnState::Open;
        while let Some(call) = self.pending.pop_front() {
            self.send_call(call);
        }
        Ok(true)
    }

    /// Drain readable bytes and dispatch every complete frame.
    pub(crate) fn on_readable(&mut self, ctx: &FrameCtx<'_>) -> io::Result<()> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "connection closed by peer",
                    ));
                }
                Ok(n) => self.read_buf.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }

        loop {
            let frame = self
                .codec
                .decode(&mut self.read_buf)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            match frame {
                Some(frame) => self.dispatch_frame(frame, ctx)?,
                None => return Ok(()),
            }
        }
    }

    fn dispatch_frame(&mut self, frame: Frame, ctx: &FrameCtx<'_>) -> io::Result<()> {
        match frame.frame_type {
            FrameType::Request if !self.outbound => self.handle_request(&frame, ctx),
            FrameType::Response | FrameType::Error if self.outbound => {
                self.handle_response(&frame)
            }
            other => {
                warn!(
                    peer = %self.peer,
                    frame_type = ?other,
                    outbound = self.outbound,
                    "ignoring unexpected frame type"
                );
                Ok(())
            }
        }
    }

    fn handle_request(&mut self, frame: &Frame, ctx: &FrameCtx<'_>) -> io::Result<()> {
        let envelope: RequestEnvelope = protocol::envelope::decode(&frame.payload)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        let call = InboundCall::new(
            envelope.call_id,
            envelope.method,
            Bytes::from(envelope.payload),
            self.peer,
            Responder::new(ctx.reactor_tx.clone(), self.token),
        );

        let Some(queue) = ctx.shared.service_queue() else {
            self.reject_call(call.call_id(), "no service registered");
            return Ok(());
        };
        match queue.try_send(call) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(call)) => {
                warn!(
                    peer = %self.peer,
                    method = %call.method(),
                    "service queue full; rejecting call"
                );
                self.reject_call(call.call_id(), "service queue is full");
                Ok(())
            }
            Err(TrySendError::Disconnected(call)) => {
                self.reject_call(call.call_id(), "service is shutting down");
                Ok(())
            }
        }
    }

    fn reject_call(&mut self, call_id: Uuid, message: &str) {
        let envelope = ResponseEnvelope::failure(call_id, ErrorCode::ServerTooBusy, message);
        self.queue_response(&envelope);
    }

    fn handle_response(&mut self, frame: &Frame) -> io::Result<()> {
        let envelope: ResponseEnvelope = protocol::envelope::decode(&frame.payload)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        match self.awaiting.remove(&envelope.call_id) {
            Some(call) => match envelope.error {
                Some(info) => call.finish(Err(info.into())),
                None => call.finish(Ok(Bytes::from(envelope.payload))),
            },
            // A response past its call's timeout must not be matched to the
            // stale call.
            None => debug!(
                peer = %self.peer,
                call_id = %envelope.call_id,
                "discarding response for unknown or expired call"
            ),
        }
        Ok(())
    }

    /// Serialize a response envelope onto the write buffer.
    pub(crate) fn queue_response(&mut self, envelope: &ResponseEnvelope) {
        let frame_type = if envelope.error.is_some() {
            FrameType::Error
        } else {
            FrameType::Response
        };
        let bytes = match protocol::envelope::encode(envelope) {
            Ok(bytes) => Bytes::from(bytes),
            Err(e) => {
                error!(peer = %self.peer, call_id = %envelope.call_id, "failed to encode response: {e}");
                return;
            }
        };
        let frame = Frame::new(frame_type, bytes);
        if let Err(e) = self.codec.encode(&frame, &mut self.write_buf) {
            error!(peer = %self.peer, call_id = %envelope.call_id, "failed to frame response: {e}");
        }
    }

    /// Write buffered bytes until the socket would block.
    pub(crate) fn flush(&mut self) -> io::Result<()> {
        while !self.write_buf.is_empty() {
            match self.stream.write(&self.write_buf) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "connection closed while writing",
                    ));
                }
                Ok(n) => self.write_buf.advance(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Remove an outbound call by id, wherever it currently sits.
    pub(crate) fn take_call(&mut self, call_id: Uuid) -> Option<OutboundCall> {
        if let Some(call) = self.awaiting.remove(&call_id) {
            return Some(call);
        }
        let idx = self
            .pending
            .iter()
            .position(|call| call.call_id() == call_id)?;
        self.pending.remove(idx)
    }

    /// Fail every call on this connection: `pending_err` for calls never
    /// sent, `in_flight_err` for calls awaiting a response.
    pub(crate) fn fail_all(&mut self, pending_err: &RpcError, in_flight_err: &RpcError) {
        for call in self.pending.drain(..) {
            call.finish(Err(pending_err.clone()));
        }
        for (_, call) in self.awaiting.drain() {
            call.finish(Err(in_flight_err.clone()));
        }
    }

    fn desired_interest(&self) -> Interest {
        if !self.write_buf.is_empty() || self.is_connecting() {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        }
    }

    /// Reconcile poll registration with the connection's current needs.
    pub(crate) fn update_registration(&mut self, registry: &Registry) -> io::Result<()> {
        let desired = self.desired_interest();
        if desired != self.registered {
            registry.reregister(&mut self.stream, self.token, desired)?;
            self.registered = desired;
        }
        Ok(())
    }
}

pub(crate) fn initial_interest(outbound: bool) -> Interest {
    if outbound {
        Interest::READABLE | Interest::WRITABLE
    } else {
        Interest::READABLE
    }
}
