// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Per-endpoint protocol engine.
//!
//! A `Presentation` owns one transport connection and all requests to one
//! RTSP resource. Outbound requests pass through three queues: pending
//! (submitted, not yet written), active (written, awaiting the matching
//! response), and, for replies to server-initiated requests, a pending
//! response queue. Responses match the active queue strictly in order; with
//! pipelining enabled one writable turn drains the whole pending queue into
//! a single write, and the ordering still holds.
//!
//! On datagram transports a request that hasn't seen the first byte of its
//! response within the configured timeout is re-sent, byte-identical, on the
//! next writable turn.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::{Duration, Instant};

use bytes::{BufMut, Bytes, BytesMut};
use log::{debug, trace, warn};

use super::parse::{Classified, MessageReader, ParseError};
use super::session::{Session, SessionOp, SessionState};
use super::Sinks;
use crate::error::ErrorInt;
use crate::event_loop::{ConnectProgress, PollInfo, PollState};
use crate::message::{Message, Request, Response};
use crate::socket::{ConnectPoll, Socket, SocketState, TransportKind};
use crate::Error;

/// The `Accept` value stamped on `DESCRIBE` requests that don't set one.
pub const DEFAULT_ACCEPT: &str = "application/sdp, application/rtsl, application/mheg";

/// Engine lifecycle of one presentation, driven by the event loop.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PresentationState {
    /// Not registered, or terminated.
    Uninitialised,
    /// Queued for admission or connecting.
    Initializing,
    /// Connected and idle.
    Initialized,
    SendingRequest,
    ReceivingResponse,
    ReceivingRequest,
    SendingResponse,
}

/// How a request ended: its response, or the error that killed it.
#[derive(Debug)]
pub enum Outcome {
    Success(Response),
    Failure(Error),
}

/// Per-request completion sink. Invoked exactly once, after any internal
/// session bookkeeping for the same response.
pub type Completion = Box<dyn FnOnce(Outcome, &mut Presentation)>;

/// Handler for server-initiated requests; reply via
/// [`Presentation::send_response`].
pub type ServerRequestHandler = Box<dyn FnMut(Request, &mut Presentation)>;

/// Internal bookkeeping examined when a request completes.
#[derive(Copy, Clone, Debug)]
enum RequestTag {
    Plain,
    Session { session: usize, op: SessionOp },
}

struct OutboundRequest {
    msg: Request,

    /// Cached wire form; retransmissions resend these exact bytes.
    wire: Option<Bytes>,

    time_sent: Option<Instant>,

    /// Set once the first byte of this request's response start line has
    /// been parsed; an acknowledged request is never retransmitted.
    acknowledged: bool,

    tag: RequestTag,
    completion: Option<Completion>,
}

impl OutboundRequest {
    fn new(msg: Request, tag: RequestTag, completion: Option<Completion>) -> Self {
        Self {
            msg,
            wire: None,
            time_sent: None,
            acknowledged: false,
            tag,
            completion,
        }
    }

    fn wire(&mut self) -> Bytes {
        match &self.wire {
            Some(w) => w.clone(),
            None => {
                let w = self.msg.serialise();
                self.wire = Some(w.clone());
                w
            }
        }
    }
}

pub struct Presentation {
    id: usize,
    uri: String,
    socket: Socket,
    state: PresentationState,

    /// Next CSeq to stamp; strictly monotonic from 1.
    next_cseq: u32,

    pending_requests: VecDeque<OutboundRequest>,
    pending_responses: VecDeque<Response>,

    /// Requests written and awaiting their response, in send order.
    active: VecDeque<OutboundRequest>,

    pipelining: bool,
    buffer_size: usize,
    timeout: Duration,

    /// Blocking interface: submissions round-trip synchronously.
    blocking: bool,

    reader: MessageReader,
    user_agent: String,
    sessions: Vec<Session>,
    on_server_request: Option<ServerRequestHandler>,
    sinks: Rc<RefCell<Sinks>>,
}

impl Presentation {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: usize,
        kind: TransportKind,
        host: impl Into<String>,
        port: u16,
        uri: impl Into<String>,
        blocking: bool,
        timeout: Duration,
        buffer_size: usize,
        pipelining: bool,
        user_agent: impl Into<String>,
        sinks: Rc<RefCell<Sinks>>,
    ) -> Self {
        Self {
            id,
            uri: uri.into(),
            socket: Socket::new(kind, host, port),
            state: PresentationState::Uninitialised,
            next_cseq: 1,
            pending_requests: VecDeque::new(),
            pending_responses: VecDeque::new(),
            active: VecDeque::new(),
            pipelining,
            buffer_size,
            timeout,
            blocking,
            reader: MessageReader::new(buffer_size),
            user_agent: user_agent.into(),
            sessions: Vec::new(),
            on_server_request: None,
            sinks,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn state(&self) -> PresentationState {
        self.state
    }

    pub fn transport(&self) -> TransportKind {
        self.socket.kind()
    }

    /// Toggles pipelining: whether one writable turn may drain the whole
    /// pending queue before any response arrives.
    pub fn set_pipelining(&mut self, pipelining: bool) {
        self.pipelining = pipelining;
    }

    pub fn set_server_request_handler(&mut self, handler: ServerRequestHandler) {
        self.on_server_request = Some(handler);
    }

    /// The transport's last network error, if any.
    pub fn last_network_error(&self) -> Option<&str> {
        self.socket.last_error()
    }

    pub fn session(&self, sid: usize) -> Option<&Session> {
        self.sessions.get(sid)
    }

    pub fn session_mut(&mut self, sid: usize) -> Option<&mut Session> {
        self.sessions.get_mut(sid)
    }

    pub(crate) fn pending_len(&self) -> usize {
        self.pending_requests.len()
    }

    pub(crate) fn active_len(&self) -> usize {
        self.active.len()
    }

    // Convenience operations. Each wraps its arguments in a Request and goes
    // through send_request.

    pub fn options(&mut self, completion: Option<Completion>) -> Result<(), Error> {
        self.send_request(Request::new("OPTIONS", "*"), completion)
    }

    pub fn describe(&mut self, completion: Option<Completion>) -> Result<(), Error> {
        self.send_request(Request::new("DESCRIBE", "*"), completion)
    }

    pub fn announce(
        &mut self,
        sdp: Option<Bytes>,
        completion: Option<Completion>,
    ) -> Result<(), Error> {
        let mut req = Request::new("ANNOUNCE", "*");
        if let Some(sdp) = sdp {
            req.headers.set("Content-Type", "application/sdp");
            req.set_body(sdp);
        }
        self.send_request(req, completion)
    }

    pub fn get_parameter(
        &mut self,
        body: Option<Bytes>,
        completion: Option<Completion>,
    ) -> Result<(), Error> {
        let mut req = Request::new("GET_PARAMETER", "*");
        if let Some(b) = body {
            req.set_body(b);
        }
        self.send_request(req, completion)
    }

    pub fn set_parameter(
        &mut self,
        body: Option<Bytes>,
        completion: Option<Completion>,
    ) -> Result<(), Error> {
        let mut req = Request::new("SET_PARAMETER", "*");
        if let Some(b) = body {
            req.set_body(b);
        }
        self.send_request(req, completion)
    }

    /// Submits a request. In the event-driven interface this enqueues and
    /// returns; completion arrives through `completion` once the response is
    /// matched. In the blocking interface the whole round trip happens here.
    pub fn send_request(
        &mut self,
        req: Request,
        completion: Option<Completion>,
    ) -> Result<(), Error> {
        self.submit(req, RequestTag::Plain, completion)
    }

    /// Synchronous round trip: writes the request and reads until its
    /// response is assembled.
    pub fn send_request_blocking(&mut self, mut req: Request) -> Result<Response, Error> {
        self.fill_request(&mut req);
        self.roundtrip(&mut req)
    }

    /// Queues a reply to a server-initiated request (written on the next
    /// writable turn; immediately in the blocking interface).
    pub fn send_response(&mut self, mut resp: Response) -> Result<(), Error> {
        if self.state == PresentationState::Uninitialised {
            crate::bail!(ErrorInt::FailedPrecondition(
                "presentation is not initialised".to_owned()
            ));
        }
        if self.blocking {
            let wire = resp.serialise();
            self.socket.write_blocking(&wire, self.timeout)?;
            return Ok(());
        }
        self.pending_responses.push_back(resp);
        Ok(())
    }

    /// Creates an `Inactive` session for `uri` (the presentation URI when
    /// `None`) and submits its `SETUP`. The session leaves `Inactive` when
    /// the response arrives with a `Session` id; requests submitted through
    /// it before then are buffered.
    pub fn setup_session(
        &mut self,
        uri: Option<&str>,
        transport: Option<&str>,
        completion: Option<Completion>,
    ) -> Result<usize, Error> {
        let uri = uri.unwrap_or(&self.uri).to_owned();
        let sid = self.sessions.len();
        self.sessions.push(Session::new(&uri));
        let mut req = Request::new("SETUP", uri);
        if let Some(t) = transport {
            req.headers.set("Transport", t);
        }
        self.submit(
            req,
            RequestTag::Session {
                session: sid,
                op: SessionOp::Setup,
            },
            completion,
        )?;
        Ok(sid)
    }

    pub fn play(&mut self, sid: usize, completion: Option<Completion>) -> Result<(), Error> {
        self.session_request_op(sid, Request::new("PLAY", "*"), SessionOp::Play, completion)
    }

    pub fn pause(&mut self, sid: usize, completion: Option<Completion>) -> Result<(), Error> {
        self.session_request_op(sid, Request::new("PAUSE", "*"), SessionOp::Pause, completion)
    }

    pub fn record(&mut self, sid: usize, completion: Option<Completion>) -> Result<(), Error> {
        self.session_request_op(sid, Request::new("RECORD", "*"), SessionOp::Record, completion)
    }

    pub fn teardown(&mut self, sid: usize, completion: Option<Completion>) -> Result<(), Error> {
        self.session_request_op(
            sid,
            Request::new("TEARDOWN", "*"),
            SessionOp::Teardown,
            completion,
        )
    }

    /// Submits an arbitrary request through a session: buffered while the
    /// session is `Inactive`, annotated with its `Session` header otherwise.
    pub fn session_request(
        &mut self,
        sid: usize,
        req: Request,
        completion: Option<Completion>,
    ) -> Result<(), Error> {
        self.session_request_op(sid, req, SessionOp::Other, completion)
    }

    fn session_request_op(
        &mut self,
        sid: usize,
        mut req: Request,
        op: SessionOp,
        completion: Option<Completion>,
    ) -> Result<(), Error> {
        let sess = match self.sessions.get_mut(sid) {
            Some(s) => s,
            None => crate::bail!(ErrorInt::InvalidArgument(format!("no session {sid}"))),
        };
        if req.uri() == "*" {
            req.set_uri(sess.uri().to_owned());
        }
        if sess.state() == SessionState::Inactive {
            trace!("session {sid} inactive; buffering {}", req.method());
            sess.buffer(req, op, completion);
            return Ok(());
        }
        if let Some(id) = sess.id() {
            req.headers.set("Session", id.to_owned());
        }
        self.submit(req, RequestTag::Session { session: sid, op }, completion)
    }

    /// Terminates the presentation: disconnects the socket and moves to
    /// `Uninitialised`. The event loop drops it on its next sweep.
    pub fn terminate(&mut self) {
        debug!("terminating presentation {} ({})", self.id, self.uri);
        self.socket.disconnect();
        self.state = PresentationState::Uninitialised;
    }

    // Submission internals.

    /// Stamps CSeq (respecting a caller-set one), User-Agent, the
    /// presentation URI for `*` targets, and the default DESCRIBE Accept.
    fn fill_request(&mut self, req: &mut Request) {
        if req.uri() == "*" {
            req.set_uri(self.uri.clone());
        }
        if !req.headers.is_set("CSeq") {
            req.headers.add("CSeq", self.next_cseq.to_string());
            self.next_cseq += 1;
        }
        if !req.headers.is_set("User-Agent") {
            req.headers.add("User-Agent", self.user_agent.clone());
        }
        if req.method() == "DESCRIBE" && !req.headers.is_set("Accept") {
            req.headers.add("Accept", DEFAULT_ACCEPT);
        }
    }

    fn submit(
        &mut self,
        mut req: Request,
        tag: RequestTag,
        completion: Option<Completion>,
    ) -> Result<(), Error> {
        if self.state == PresentationState::Uninitialised && !self.blocking {
            crate::bail!(ErrorInt::FailedPrecondition(
                "presentation is not initialised".to_owned()
            ));
        }
        self.fill_request(&mut req);
        if self.blocking {
            return match self.roundtrip(&mut req) {
                Ok(resp) => {
                    self.deliver(tag, completion, Outcome::Success(resp));
                    Ok(())
                }
                Err(e) => {
                    self.deliver(tag, completion, Outcome::Failure(e.clone()));
                    Err(e)
                }
            };
        }
        trace!("queueing {} {} CSeq={:?}", req.method(), req.uri(), req.cseq());
        self.pending_requests
            .push_back(OutboundRequest::new(req, tag, completion));
        Ok(())
    }

    /// Blocking round trip. On a datagram transport, performs one
    /// retransmission: if nothing is readable within the timeout after the
    /// first send, the identical bytes go out once more.
    fn roundtrip(&mut self, req: &mut Request) -> Result<Response, Error> {
        if !self.socket.is_connected() {
            self.connect_now()?;
        }
        let wire = req.serialise();
        self.state = PresentationState::SendingRequest;
        self.socket.write_blocking(&wire, self.timeout)?;
        self.state = PresentationState::ReceivingResponse;
        if self.socket.kind() == TransportKind::Datagram
            && !self.socket.wait_readable(self.timeout)?
        {
            debug!(
                "no response to {} within {:?}; retransmitting",
                req.method(),
                self.timeout
            );
            self.socket.write_blocking(&wire, self.timeout)?;
        }
        loop {
            let n = self.read_size();
            let mut buf = vec![0u8; n];
            let got = match self.socket.read_blocking(&mut buf, n, 0, self.timeout) {
                Ok(got) => got,
                Err(e) => {
                    self.state = PresentationState::Initialized;
                    return Err(e);
                }
            };
            match self.reader.advance(&buf[..got]) {
                Ok(p) => {
                    if p.unread > 0 {
                        self.socket.unread(&buf[got - p.unread..got]);
                    }
                    match p.message {
                        Some(Message::Response(resp)) => {
                            self.state = PresentationState::Initialized;
                            return Ok(resp);
                        }
                        // A server-initiated request may interleave with the
                        // response we're waiting on.
                        Some(Message::Request(r)) => self.finish_server_request(r),
                        None => {}
                    }
                }
                Err(pe) => {
                    self.state = PresentationState::Initialized;
                    return Err(self.framing_error(pe, &buf[..got], got));
                }
            }
        }
    }

    fn framing_error(&mut self, pe: ParseError, chunk: &[u8], got: usize) -> Error {
        if pe.unread > 0 {
            self.socket.unread(&chunk[got - pe.unread..got]);
        }
        let e = crate::wrap!(ErrorInt::FramingError {
            conn_ctx: self.socket.connection_context(),
            msg_ctx: self.reader.message_context(),
            description: pe.description,
        });
        self.reader.reset();
        self.sinks.borrow_mut().error(&e.to_string());
        e
    }

    // Event-loop turns.

    /// Marks the presentation registered with an event loop, so submissions
    /// queue instead of failing while the connect is still pending.
    pub(crate) fn mark_registered(&mut self) {
        self.state = PresentationState::Initializing;
    }

    /// Admission turn: starts the non-blocking connect.
    pub(crate) fn handle_connectable(&mut self) {
        self.socket.set_state(SocketState::Connectable);
        self.state = PresentationState::Initializing;
        if let Err(e) = self.socket.connect_nonblocking(self.timeout) {
            self.fail_everything(e);
        }
    }

    /// Polling view for the event loop.
    pub(crate) fn poll_info(&self) -> Option<PollInfo> {
        let fd = self.socket.raw_fd()?;
        let state = match self.socket.state() {
            SocketState::Connecting => PollState::Connecting,
            s if s.is_established() => PollState::Connected,
            _ => return None,
        };
        Some(PollInfo {
            fd,
            state,
            buffered_input: self.socket.has_pushback(),
        })
    }

    /// Drives an in-flight connect one step.
    pub(crate) fn poll_connect_step(&mut self) -> ConnectProgress {
        match self.socket.poll_connect() {
            ConnectPoll::Pending => ConnectProgress::Pending,
            ConnectPoll::Ready => {
                self.handle_connected();
                ConnectProgress::Connected
            }
            ConnectPoll::Failed(msg) => {
                let e = crate::wrap!(ErrorInt::ConnectError(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    msg,
                )));
                self.fail_everything(e);
                ConnectProgress::Failed
            }
        }
    }

    fn handle_connected(&mut self) {
        debug!("{} connected", self.uri);
        self.state = PresentationState::Initialized;
    }

    /// Blocking connect, used by the blocking interface and by round trips
    /// on a presentation that was never admitted to a loop.
    pub(crate) fn connect_now(&mut self) -> Result<(), Error> {
        self.state = PresentationState::Initializing;
        match self.socket.connect_blocking(self.timeout) {
            Ok(()) => {
                self.handle_connected();
                Ok(())
            }
            Err(e) => {
                self.state = PresentationState::Uninitialised;
                self.sinks.borrow_mut().error(&e.to_string());
                Err(e)
            }
        }
    }

    /// One recv gets one datagram; a size-bounded read of a larger datagram
    /// would silently discard its tail. Datagram reads therefore always
    /// offer the full configured buffer and let the parser push back what a
    /// phase didn't need.
    fn read_size(&self) -> usize {
        match self.socket.kind() {
            TransportKind::Stream => self.reader.next_read_size(),
            TransportKind::Datagram => self.buffer_size.max(self.reader.next_read_size()),
        }
    }

    /// One readable turn: a single transport read fed through the parser.
    /// Returns whether any bytes were consumed.
    pub(crate) fn handle_readable(&mut self) -> bool {
        let n = self.read_size();
        let mut buf = vec![0u8; n];
        let got = match self.socket.read_nonblocking(&mut buf, n, 0) {
            Ok(0) => return false,
            Ok(got) => got,
            Err(e) => {
                self.network_failure(e);
                return true;
            }
        };
        match self.reader.advance(&buf[..got]) {
            Ok(p) => {
                if p.unread > 0 {
                    self.socket.unread(&buf[got - p.unread..got]);
                }
                match p.classified {
                    Some(Classified::Response) => {
                        self.state = PresentationState::ReceivingResponse;
                        if let Some(head) = self.active.front_mut() {
                            head.acknowledged = true;
                        }
                    }
                    Some(Classified::Request) => {
                        self.state = PresentationState::ReceivingRequest;
                    }
                    None => {}
                }
                match p.message {
                    Some(Message::Response(resp)) => self.finish_response(resp),
                    Some(Message::Request(req)) => self.finish_server_request(req),
                    None => {}
                }
                true
            }
            Err(pe) => {
                let receiving_response = self.state == PresentationState::ReceivingResponse
                    || !self.active.is_empty();
                let e = self.framing_error(pe, &buf[..got], got);
                // Protocol errors fail the head in-flight request but leave
                // the connection up.
                if receiving_response {
                    self.fail_head_active(e);
                }
                self.state = PresentationState::Initialized;
                true
            }
        }
    }

    /// One writable turn: drain one pending response, retransmit timed-out
    /// datagram requests, then dispatch pending requests (all of them under
    /// pipelining, one otherwise). Returns whether anything was written.
    pub(crate) fn handle_writable(&mut self) -> bool {
        let mut progress = false;
        if let Some(mut resp) = self.pending_responses.pop_front() {
            self.state = PresentationState::SendingResponse;
            let wire = resp.serialise();
            match self.socket.write_nonblocking(&wire) {
                Ok(0) => {
                    self.pending_responses.push_front(resp);
                    return progress;
                }
                Ok(_) => {
                    progress = true;
                    self.state = PresentationState::Initialized;
                }
                Err(e) => {
                    self.network_failure(e);
                    return true;
                }
            }
        }
        if self.socket.kind() == TransportKind::Datagram && self.retransmit_expired() {
            progress = true;
        }
        if self.pending_requests.is_empty() {
            return progress;
        }
        if self.pipelining {
            self.dispatch_all() || progress
        } else {
            // The next request waits for the head response.
            if !self.active.is_empty() {
                return progress;
            }
            self.dispatch_one() || progress
        }
    }

    /// Re-sends every unacknowledged active request older than the timeout.
    fn retransmit_expired(&mut self) -> bool {
        let mut any = false;
        for i in 0..self.active.len() {
            let due = {
                let or = &self.active[i];
                !or.acknowledged
                    && or
                        .time_sent
                        .map(|t| t.elapsed() >= self.timeout)
                        .unwrap_or(false)
            };
            if !due {
                continue;
            }
            let wire = self.active[i].wire();
            debug!(
                "retransmitting {} CSeq={:?}",
                self.active[i].msg.method(),
                self.active[i].msg.cseq()
            );
            match self.socket.write_nonblocking(&wire) {
                Ok(0) => break,
                Ok(_) => {
                    self.active[i].time_sent = Some(Instant::now());
                    any = true;
                }
                Err(e) => {
                    self.network_failure(e);
                    return true;
                }
            }
        }
        any
    }

    /// Pipelining drain: the entire pending queue in one concatenated write.
    fn dispatch_all(&mut self) -> bool {
        let mut wire = BytesMut::new();
        for or in &mut self.pending_requests {
            wire.put_slice(&or.wire());
        }
        self.state = PresentationState::SendingRequest;
        match self.socket.write_nonblocking(&wire) {
            Ok(0) => {
                self.state = PresentationState::Initialized;
                false
            }
            Ok(_) => {
                let now = Instant::now();
                while let Some(mut or) = self.pending_requests.pop_front() {
                    or.time_sent = Some(now);
                    self.active.push_back(or);
                }
                self.state = PresentationState::ReceivingResponse;
                true
            }
            Err(e) => {
                self.network_failure(e);
                true
            }
        }
    }

    fn dispatch_one(&mut self) -> bool {
        let mut or = match self.pending_requests.pop_front() {
            Some(or) => or,
            None => return false,
        };
        let wire = or.wire();
        self.state = PresentationState::SendingRequest;
        match self.socket.write_nonblocking(&wire) {
            Ok(0) => {
                self.state = PresentationState::Initialized;
                self.pending_requests.push_front(or);
                false
            }
            Ok(_) => {
                trace!("sent {} CSeq={:?}", or.msg.method(), or.msg.cseq());
                or.time_sent = Some(Instant::now());
                self.active.push_back(or);
                self.state = PresentationState::ReceivingResponse;
                true
            }
            Err(e) => {
                self.network_failure(e);
                true
            }
        }
    }

    // Completion paths.

    fn finish_response(&mut self, resp: Response) {
        match self.active.pop_front() {
            Some(or) => {
                trace!(
                    "{} {} completes {} CSeq={:?}",
                    resp.status(),
                    resp.reason(),
                    or.msg.method(),
                    or.msg.cseq()
                );
                if self.active.is_empty() {
                    self.state = PresentationState::Initialized;
                }
                self.deliver(or.tag, or.completion, Outcome::Success(resp));
            }
            None => {
                let msg = format!(
                    "response {} {} with no request awaiting it",
                    resp.status(),
                    resp.reason()
                );
                self.state = PresentationState::Initialized;
                self.sinks.borrow_mut().warning(&msg);
            }
        }
    }

    fn finish_server_request(&mut self, req: Request) {
        // Subsequent client-issued requests skip past the server's sequence
        // number.
        self.next_cseq += 1;
        self.state = PresentationState::Initialized;
        let mut handler = self.on_server_request.take();
        match &mut handler {
            Some(h) => h(req, self),
            None => warn!(
                "server-initiated {} on {} with no handler registered",
                req.method(),
                self.uri
            ),
        }
        // The handler may have registered a replacement.
        if self.on_server_request.is_none() {
            self.on_server_request = handler;
        }
    }

    /// Applies internal session bookkeeping, then the caller's completion.
    fn deliver(&mut self, tag: RequestTag, completion: Option<Completion>, outcome: Outcome) {
        if let (RequestTag::Session { session, op }, Outcome::Success(resp)) = (&tag, &outcome) {
            self.session_response(*session, *op, resp);
        }
        if let Some(cb) = completion {
            cb(outcome, self);
        }
    }

    fn session_response(&mut self, sid: usize, op: SessionOp, resp: &Response) {
        if !resp.is_ok() {
            self.sinks.borrow_mut().warning(&format!(
                "session {sid} {op:?} got {} {}",
                resp.status(),
                resp.reason()
            ));
            return;
        }
        match op {
            SessionOp::Setup => {
                let id = resp
                    .headers
                    .get("Session")
                    .map(|v| v.split(';').next().unwrap_or(v).trim().to_owned());
                match id {
                    Some(id) => self.activate_session(sid, id),
                    None => self
                        .sinks
                        .borrow_mut()
                        .error("SETUP response carries no Session header"),
                }
            }
            op => {
                if let Some(s) = self.sessions.get_mut(sid) {
                    s.apply_success(op);
                }
            }
        }
    }

    /// Records the server's id and drains the session's buffered requests in
    /// submission order, each annotated with the `Session` header.
    fn activate_session(&mut self, sid: usize, id: String) {
        let buffered = match self.sessions.get_mut(sid) {
            Some(s) => {
                debug!("session {sid} ready with id {id:?}");
                s.set_ready(id.clone());
                s.take_buffered()
            }
            None => return,
        };
        for b in buffered {
            let mut req = b.req;
            req.headers.set("Session", id.clone());
            if let Err(e) = self.submit(
                req,
                RequestTag::Session {
                    session: sid,
                    op: b.op,
                },
                b.completion,
            ) {
                self.sinks.borrow_mut().error(&e.to_string());
            }
        }
    }

    // Failure paths.

    /// A transport-level failure: recorded, surfaced, and charged to the
    /// head in-flight request. The connection is gone.
    fn network_failure(&mut self, e: Error) {
        self.sinks.borrow_mut().error(&e.to_string());
        self.fail_head_active(e);
        self.socket.disconnect();
        self.state = PresentationState::Uninitialised;
    }

    fn fail_head_active(&mut self, e: Error) {
        if let Some(or) = self.active.pop_front() {
            self.deliver(or.tag, or.completion, Outcome::Failure(e));
        }
    }

    /// Connect never happened; every queued request fails.
    fn fail_everything(&mut self, e: Error) {
        self.sinks.borrow_mut().error(&e.to_string());
        while let Some(or) = self.pending_requests.pop_front() {
            self.deliver(or.tag, or.completion, Outcome::Failure(e.clone()));
        }
        while let Some(or) = self.active.pop_front() {
            self.deliver(or.tag, or.completion, Outcome::Failure(e.clone()));
        }
        self.socket.disconnect();
        self.state = PresentationState::Uninitialised;
    }

    /// Sends a keepalive `GET_PARAMETER` for each `Playing` session whose
    /// period has elapsed. Returns whether any was sent.
    pub(crate) fn service_keepalives(&mut self) -> bool {
        let due: Vec<usize> = (0..self.sessions.len())
            .filter(|&i| self.sessions[i].keepalive_due())
            .collect();
        for &sid in &due {
            trace!("keepalive for session {sid}");
            let r = self.session_request_op(
                sid,
                Request::new("GET_PARAMETER", "*"),
                SessionOp::Other,
                None,
            );
            if let Err(e) = r {
                self.sinks.borrow_mut().error(&e.to_string());
            }
        }
        !due.is_empty()
    }
}

impl std::fmt::Debug for Presentation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Presentation")
            .field("id", &self.id)
            .field("uri", &self.uri)
            .field("state", &self.state)
            .field("next_cseq", &self.next_cseq)
            .field("pending", &self.pending_requests.len())
            .field("active", &self.active.len())
            .field("sessions", &self.sessions)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::{TcpListener, UdpSocket};

    fn sinks() -> Rc<RefCell<Sinks>> {
        Rc::new(RefCell::new(Sinks::default()))
    }

    fn stream_presentation(port: u16, pipelining: bool) -> Presentation {
        Presentation::new(
            0,
            TransportKind::Stream,
            "127.0.0.1",
            port,
            format!("rtsp://127.0.0.1:{port}/stream"),
            false,
            Duration::from_secs(5),
            4096,
            pipelining,
            "rtsp-engine",
            sinks(),
        )
    }

    /// Runs readable turns until `done` or a deadline.
    fn pump(p: &mut Presentation, mut done: impl FnMut(&Presentation) -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done(p) {
            assert!(Instant::now() < deadline, "timed out; {p:?}");
            if !p.handle_readable() {
                std::thread::sleep(Duration::from_millis(1));
            }
        }
    }

    fn completion_log() -> (Rc<RefCell<Vec<String>>>, impl Fn(&str) -> Option<Completion>) {
        let log = Rc::new(RefCell::new(Vec::new()));
        let log2 = log.clone();
        let make = move |name: &str| -> Option<Completion> {
            let log = log2.clone();
            let name = name.to_owned();
            Some(Box::new(move |outcome: Outcome, _p: &mut Presentation| {
                let entry = match outcome {
                    Outcome::Success(r) => format!("{name}: {}", r.status()),
                    Outcome::Failure(e) => format!("{name}: err {e}"),
                };
                log.borrow_mut().push(entry);
            }))
        };
        (log, make)
    }

    #[test]
    fn pipelined_pair_one_write_ordered_completions() {
        let l = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = l.local_addr().unwrap().port();
        let mut p = stream_presentation(port, true);
        p.connect_now().unwrap();
        let (mut peer, _) = l.accept().unwrap();

        let (log, cb) = completion_log();
        p.options(cb("options")).unwrap();
        p.describe(cb("describe")).unwrap();
        assert!(p.handle_writable());

        // Both requests arrive in one concatenated write, in order.
        std::thread::sleep(Duration::from_millis(20));
        let mut buf = vec![0u8; 4096];
        let n = peer.read(&mut buf).unwrap();
        let text = String::from_utf8_lossy(&buf[..n]);
        let opt_at = text.find("OPTIONS").unwrap();
        let desc_at = text.find("DESCRIBE").unwrap();
        assert!(opt_at < desc_at, "got: {text}");
        assert!(text.contains("CSeq: 1"), "got: {text}");
        assert!(text.contains("CSeq: 2"), "got: {text}");
        assert!(
            text.contains("Accept: application/sdp, application/rtsl, application/mheg"),
            "got: {text}"
        );

        peer.write_all(b"RTSP/1.0 200 OK\r\nCSeq: 1\r\nPublic: OPTIONS, DESCRIBE\r\n\r\n")
            .unwrap();
        peer.write_all(b"RTSP/1.0 404 Not Found\r\nCSeq: 2\r\n\r\n")
            .unwrap();
        pump(&mut p, |p| p.active_len() == 0);
        assert_eq!(*log.borrow(), vec!["options: 200", "describe: 404"]);
        assert_eq!(p.state(), PresentationState::Initialized);
    }

    #[test]
    fn without_pipelining_second_request_waits() {
        let l = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = l.local_addr().unwrap().port();
        let mut p = stream_presentation(port, false);
        p.connect_now().unwrap();
        let (mut peer, _) = l.accept().unwrap();

        let (log, cb) = completion_log();
        p.options(cb("options")).unwrap();
        p.describe(cb("describe")).unwrap();
        p.handle_writable();
        // Only OPTIONS went out; DESCRIBE waits on its response.
        assert_eq!(p.active_len(), 1);
        assert_eq!(p.pending_len(), 1);
        p.handle_writable();
        assert_eq!(p.active_len(), 1);

        std::thread::sleep(Duration::from_millis(20));
        let mut buf = vec![0u8; 4096];
        let n = peer.read(&mut buf).unwrap();
        let text = String::from_utf8_lossy(&buf[..n]);
        assert!(text.contains("OPTIONS"));
        assert!(!text.contains("DESCRIBE"));

        peer.write_all(b"RTSP/1.0 200 OK\r\nCSeq: 1\r\n\r\n").unwrap();
        pump(&mut p, |p| p.active_len() == 0);
        p.handle_writable();
        assert_eq!(p.active_len(), 1);
        peer.write_all(b"RTSP/1.0 200 OK\r\nCSeq: 2\r\n\r\n").unwrap();
        pump(&mut p, |p| p.active_len() == 0);
        assert_eq!(*log.borrow(), vec!["options: 200", "describe: 200"]);
    }

    #[test]
    fn udp_retransmits_identical_bytes_once_per_timeout() {
        let peer = UdpSocket::bind("127.0.0.1:0").unwrap();
        let port = peer.local_addr().unwrap().port();
        let mut p = Presentation::new(
            0,
            TransportKind::Datagram,
            "127.0.0.1",
            port,
            format!("rtspu://127.0.0.1:{port}/stream"),
            false,
            Duration::from_millis(50),
            4096,
            false,
            "rtsp-engine",
            sinks(),
        );
        p.connect_now().unwrap();

        let (log, cb) = completion_log();
        p.describe(cb("describe")).unwrap();
        p.handle_writable();
        let mut first = vec![0u8; 2048];
        let (n1, from) = peer.recv_from(&mut first).unwrap();

        // Nothing acknowledged; once the timeout passes the next writable
        // turn re-sends the same bytes.
        p.handle_writable();
        std::thread::sleep(Duration::from_millis(80));
        p.handle_writable();
        let mut second = vec![0u8; 2048];
        let (n2, _) = peer.recv_from(&mut second).unwrap();
        assert_eq!(&first[..n1], &second[..n2]);

        peer.send_to(b"RTSP/1.0 200 OK\r\nCSeq: 1\r\n\r\n", from).unwrap();
        pump(&mut p, |p| p.active_len() == 0);
        assert_eq!(*log.borrow(), vec!["describe: 200"]);

        // Acknowledged and completed; no further retransmission.
        std::thread::sleep(Duration::from_millis(80));
        p.handle_writable();
        peer.set_read_timeout(Some(Duration::from_millis(50))).unwrap();
        assert!(peer.recv_from(&mut first).is_err());
    }

    #[test]
    fn server_initiated_request_reaches_handler() {
        let l = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = l.local_addr().unwrap().port();
        let mut p = stream_presentation(port, false);
        p.connect_now().unwrap();
        let (mut peer, _) = l.accept().unwrap();

        let seen = Rc::new(RefCell::new(Vec::new()));
        let s = seen.clone();
        p.set_server_request_handler(Box::new(move |req, _p| {
            s.borrow_mut()
                .push((req.method().to_owned(), req.cseq()));
        }));
        peer.write_all(b"ANNOUNCE rtsp://h/a RTSP/1.0\r\nCSeq: 7\r\nContent-Length: 0\r\n\r\n")
            .unwrap();
        pump(&mut p, |_| !seen.borrow().is_empty());
        assert_eq!(*seen.borrow(), vec![("ANNOUNCE".to_owned(), Some(7))]);

        // The server's sequence number bumps the client's counter.
        p.options(None).unwrap();
        p.handle_writable();
        std::thread::sleep(Duration::from_millis(20));
        let mut buf = vec![0u8; 2048];
        let n = peer.read(&mut buf).unwrap();
        let text = String::from_utf8_lossy(&buf[..n]);
        assert!(text.contains("CSeq: 2"), "got: {text}");
    }

    #[test]
    fn session_buffers_until_setup_response() {
        let l = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = l.local_addr().unwrap().port();
        let mut p = stream_presentation(port, false);
        p.connect_now().unwrap();
        let (mut peer, _) = l.accept().unwrap();

        let sid = p
            .setup_session(None, Some("RTP/AVP;unicast;client_port=4588-4589"), None)
            .unwrap();
        let (log, cb) = completion_log();
        p.play(sid, cb("play")).unwrap();
        assert_eq!(p.session(sid).unwrap().state(), SessionState::Inactive);
        assert_eq!(p.session(sid).unwrap().buffered_len(), 1);

        // Only the SETUP is written; the buffered PLAY stays put.
        p.handle_writable();
        std::thread::sleep(Duration::from_millis(20));
        let mut buf = vec![0u8; 4096];
        let n = peer.read(&mut buf).unwrap();
        let text = String::from_utf8_lossy(&buf[..n]);
        assert!(text.starts_with("SETUP "), "got: {text}");
        assert!(!text.contains("PLAY"), "got: {text}");

        peer.write_all(
            b"RTSP/1.0 200 OK\r\nCSeq: 1\r\nSession: ABC123;timeout=60\r\n\r\n",
        )
        .unwrap();
        pump(&mut p, |p| {
            p.session(sid).map(|s| s.state()) == Some(SessionState::Ready)
        });
        assert_eq!(p.session(sid).unwrap().id(), Some("ABC123"));

        // The drained PLAY now goes out, annotated with the session id.
        p.handle_writable();
        std::thread::sleep(Duration::from_millis(20));
        let n = peer.read(&mut buf).unwrap();
        let text = String::from_utf8_lossy(&buf[..n]);
        assert!(text.starts_with("PLAY "), "got: {text}");
        assert!(text.contains("Session: ABC123"), "got: {text}");

        peer.write_all(b"RTSP/1.0 200 OK\r\nCSeq: 2\r\nSession: ABC123\r\n\r\n")
            .unwrap();
        pump(&mut p, |p| !log.borrow().is_empty());
        assert_eq!(*log.borrow(), vec!["play: 200"]);
        assert_eq!(p.session(sid).unwrap().state(), SessionState::Playing);
    }

    #[test]
    fn cseq_is_strictly_monotonic_and_respects_presets() {
        let l = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = l.local_addr().unwrap().port();
        let mut p = stream_presentation(port, true);
        p.connect_now().unwrap();
        let (mut peer, _) = l.accept().unwrap();

        p.options(None).unwrap();
        let mut preset = Request::new("OPTIONS", "*");
        preset.headers.add("CSeq", "99");
        p.send_request(preset, None).unwrap();
        p.options(None).unwrap();
        p.handle_writable();

        std::thread::sleep(Duration::from_millis(20));
        let mut buf = vec![0u8; 4096];
        let n = peer.read(&mut buf).unwrap();
        let text = String::from_utf8_lossy(&buf[..n]);
        let cseqs: Vec<&str> = text
            .lines()
            .filter_map(|l| l.trim_end().strip_prefix("CSeq: "))
            .collect();
        assert_eq!(cseqs, ["1", "99", "2"]);
    }

    #[test]
    fn blocking_describe_round_trip() {
        let l = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = l.local_addr().unwrap().port();
        let server = std::thread::spawn(move || {
            let (mut peer, _) = l.accept().unwrap();
            let mut buf = Vec::new();
            let mut b = [0u8; 1];
            while !buf.ends_with(b"\r\n\r\n") {
                peer.read_exact(&mut b).unwrap();
                buf.push(b[0]);
            }
            let text = String::from_utf8(buf).unwrap();
            assert!(text.starts_with("DESCRIBE rtsp://"));
            assert!(text.contains("CSeq: 1"));
            assert!(text.contains("Accept: application/sdp, application/rtsl, application/mheg"));
            peer.write_all(
                b"RTSP/1.0 200 OK\r\nCSeq: 1\r\nContent-Length: 12\r\n\r\nv=0\r\no=x y\r\n",
            )
            .unwrap();
        });

        let mut p = Presentation::new(
            0,
            TransportKind::Stream,
            "127.0.0.1",
            port,
            format!("rtsp://127.0.0.1:{port}/stream"),
            true,
            Duration::from_secs(5),
            4096,
            false,
            "rtsp-engine",
            sinks(),
        );
        let resp = p
            .send_request_blocking(Request::new("DESCRIBE", "*"))
            .unwrap();
        assert_eq!(resp.version(), "1.0");
        assert_eq!(resp.status(), 200);
        assert_eq!(resp.reason(), "OK");
        assert_eq!(&resp.body().unwrap()[..], b"v=0\r\no=x y\r\n");
        server.join().unwrap();
    }

    #[test]
    fn framing_error_fails_head_request_but_keeps_connection() {
        let l = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = l.local_addr().unwrap().port();
        let mut p = stream_presentation(port, false);
        p.connect_now().unwrap();
        let (mut peer, _) = l.accept().unwrap();

        let (log, cb) = completion_log();
        p.options(cb("options")).unwrap();
        p.handle_writable();
        peer.write_all(b"garbage that is not RTSP\r\n").unwrap();
        pump(&mut p, |_| !log.borrow().is_empty());
        assert!(log.borrow()[0].contains("err"), "log: {:?}", log.borrow());
        assert_eq!(p.active_len(), 0);

        // The connection survives a protocol error.
        let (log2, cb2) = completion_log();
        p.options(cb2("retry")).unwrap();
        p.handle_writable();
        std::thread::sleep(Duration::from_millis(20));
        let mut buf = vec![0u8; 2048];
        peer.read(&mut buf).unwrap();
        peer.write_all(b"RTSP/1.0 200 OK\r\nCSeq: 2\r\n\r\n").unwrap();
        pump(&mut p, |_| !log2.borrow().is_empty());
        assert_eq!(*log2.borrow(), vec!["retry: 200"]);
    }

    #[test]
    fn peer_close_fails_head_request() {
        let l = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = l.local_addr().unwrap().port();
        let mut p = stream_presentation(port, false);
        p.connect_now().unwrap();
        let (peer, _) = l.accept().unwrap();

        let (log, cb) = completion_log();
        p.options(cb("options")).unwrap();
        p.handle_writable();
        drop(peer);
        pump(&mut p, |_| !log.borrow().is_empty());
        assert!(log.borrow()[0].starts_with("options: err"));
        assert_eq!(p.state(), PresentationState::Uninitialised);
        assert!(p.poll_info().is_none());
    }
}
