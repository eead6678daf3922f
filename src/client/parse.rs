// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Incremental assembly of incoming RTSP messages.
//!
//! The reader is a three-phase state machine fed by whatever bytes the
//! transport produced for one readable turn:
//!
//! 1. start line, in reads of up to 128 bytes;
//! 2. header block, in reads of up to 1024 bytes, unfolding continuations;
//! 3. body, in reads of `min(buffer_size, remaining)` bytes.
//!
//! Each phase may read past the boundary it needed; [`Progress::unread`]
//! tells the caller how many trailing bytes of the chunk to push back onto
//! the transport for the next phase. The reader itself never touches a
//! socket, which keeps it drivable from fixtures.

use bytes::{Bytes, BytesMut};

use crate::message::{self, Message, Request, Response, StartLine};
use crate::RtspMessageContext;

/// Cap on one start-line read.
const START_LINE_READ: usize = 128;

/// Cap on one header-block read.
const HEADER_READ: usize = 1024;

/// Which kind of message the start line announced. Reported as soon as the
/// line parses, before headers or body arrive; response correlation uses it
/// to mark the head in-flight request acknowledged.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum Classified {
    Request,
    Response,
}

/// Outcome of feeding one chunk.
#[derive(Debug, Default)]
pub(crate) struct Progress {
    /// Number of trailing bytes of the chunk that belong to a later phase or
    /// message; the caller must push them back onto the transport.
    pub(crate) unread: usize,

    /// Set when the chunk completed a message.
    pub(crate) message: Option<Message>,

    /// Set when the chunk completed the start line.
    pub(crate) classified: Option<Classified>,
}

/// A malformed message. The connection survives; the caller drops the
/// offending line, reports, and resumes parsing at the pushback boundary.
#[derive(Debug)]
pub(crate) struct ParseError {
    pub(crate) description: String,

    /// Trailing chunk bytes to push back, as in [`Progress::unread`].
    pub(crate) unread: usize,
}

enum Partial {
    Req(Request),
    Resp(Response),
}

enum Phase {
    StartLine { buf: Vec<u8> },
    Headers { buf: Vec<u8>, msg: Partial },
    Body { msg: Partial, body: BytesMut, remaining: usize },
}

pub(crate) struct MessageReader {
    phase: Phase,
    buffer_size: usize,

    /// Total bytes consumed from the stream, excluding pushed-back ones.
    pos: u64,

    /// `pos` at the first byte of the in-progress message.
    msg_start: u64,
}

impl MessageReader {
    pub(crate) fn new(buffer_size: usize) -> Self {
        Self {
            phase: Phase::StartLine { buf: Vec::new() },
            buffer_size,
            pos: 0,
            msg_start: 0,
        }
    }

    /// Drops any partial message, e.g. after a framing error.
    pub(crate) fn reset(&mut self) {
        self.phase = Phase::StartLine { buf: Vec::new() };
    }

    /// How many bytes the next read should request from the transport.
    pub(crate) fn next_read_size(&self) -> usize {
        match &self.phase {
            Phase::StartLine { .. } => START_LINE_READ,
            Phase::Headers { .. } => HEADER_READ,
            Phase::Body { remaining, .. } => self.buffer_size.min(*remaining).max(1),
        }
    }

    /// Context naming the start of the in-progress (or just-completed)
    /// message within the input stream.
    pub(crate) fn message_context(&self) -> RtspMessageContext {
        RtspMessageContext::new(self.msg_start)
    }

    /// Feeds one chunk through the current phase.
    pub(crate) fn advance(&mut self, chunk: &[u8]) -> Result<Progress, ParseError> {
        if chunk.is_empty() {
            return Ok(Progress::default());
        }
        match &mut self.phase {
            Phase::StartLine { buf } => {
                if buf.is_empty() {
                    self.msg_start = self.pos;
                }
                self.start_line(chunk)
            }
            Phase::Headers { .. } => self.headers(chunk),
            Phase::Body { .. } => self.body(chunk),
        }
    }

    fn consume(&mut self, chunk: &[u8], unread: usize) -> usize {
        self.pos += (chunk.len() - unread) as u64;
        unread
    }

    fn start_line(&mut self, chunk: &[u8]) -> Result<Progress, ParseError> {
        let buf = match &mut self.phase {
            Phase::StartLine { buf } => buf,
            _ => unreachable!(),
        };
        buf.extend_from_slice(chunk);
        // Some servers pad between messages; a start line never begins with
        // CRLF, so blank lines here are noise.
        while buf.starts_with(b"\r\n") {
            buf.drain(..2);
        }
        if buf.is_empty() {
            self.pos += chunk.len() as u64;
            return Ok(Progress::default());
        }
        let crlf = match find(buf, b"\r\n") {
            Some(i) => i,
            None => {
                self.pos += chunk.len() as u64;
                return Ok(Progress::default());
            }
        };
        // The terminator can straddle an earlier read, but everything past it
        // arrived in this chunk; it goes back to the transport for the
        // header phase.
        let unread = buf.len() - (crlf + 2);
        debug_assert!(unread <= chunk.len());
        let line = buf[..crlf].to_vec();
        self.reset();
        let unread = self.consume(chunk, unread);
        let line = std::str::from_utf8(&line).map_err(|_| ParseError {
            description: format!(
                "non-UTF-8 start line:\n{:#?}",
                crate::hex::LimitedHex::new(&line, 128)
            ),
            unread,
        })?;
        let start = StartLine::parse(line).map_err(|description| ParseError {
            description,
            unread,
        })?;
        let (msg, classified) = match start {
            StartLine::Request {
                method,
                uri,
                version,
            } => {
                let mut r = Request::new(method, uri);
                r.set_version(version);
                (Partial::Req(r), Classified::Request)
            }
            StartLine::Response {
                version,
                status,
                reason,
            } => {
                let mut r = Response::new(status, reason);
                r.set_version(version);
                (Partial::Resp(r), Classified::Response)
            }
        };
        self.phase = Phase::Headers {
            buf: Vec::new(),
            msg,
        };
        Ok(Progress {
            unread,
            message: None,
            classified: Some(classified),
        })
    }

    fn headers(&mut self, chunk: &[u8]) -> Result<Progress, ParseError> {
        let buf = match &mut self.phase {
            Phase::Headers { buf, .. } => buf,
            _ => unreachable!(),
        };
        buf.extend_from_slice(chunk);
        // The block either terminates immediately (no headers at all) or at
        // the first CRLF immediately following a CRLF.
        let consumed_at = if buf.starts_with(b"\r\n") {
            2
        } else {
            match find(buf, b"\r\n\r\n") {
                Some(i) => i + 4,
                None => {
                    self.pos += chunk.len() as u64;
                    return Ok(Progress::default());
                }
            }
        };
        let unread = buf.len() - consumed_at;
        debug_assert!(unread <= chunk.len());
        let block = buf[..consumed_at.saturating_sub(2)].to_vec();
        let mut msg = match std::mem::replace(
            &mut self.phase,
            Phase::StartLine { buf: Vec::new() },
        ) {
            Phase::Headers { msg, .. } => msg,
            _ => unreachable!(),
        };
        let unread = self.consume(chunk, unread);
        let parse = std::str::from_utf8(&block)
            .map_err(|_| "non-UTF-8 header block".to_owned())
            .and_then(|block| {
                message::parse_header_block(block, headers_mut(&mut msg)).map(|()| block)
            });
        if let Err(description) = parse {
            return Err(ParseError {
                description: format!(
                    "{description}; block:\n{:#?}",
                    crate::hex::LimitedHex::new(&block, 256)
                ),
                unread,
            });
        }
        let remaining = message::content_length(headers_mut(&mut msg)).map_err(|description| {
            ParseError {
                description,
                unread,
            }
        })?;
        if remaining == 0 {
            return Ok(Progress {
                unread,
                message: Some(finalize(msg, None)),
                classified: None,
            });
        }
        self.phase = Phase::Body {
            msg,
            body: BytesMut::with_capacity(remaining),
            remaining,
        };
        Ok(Progress {
            unread,
            message: None,
            classified: None,
        })
    }

    fn body(&mut self, chunk: &[u8]) -> Result<Progress, ParseError> {
        let (body, remaining) = match &mut self.phase {
            Phase::Body {
                body, remaining, ..
            } => (body, remaining),
            _ => unreachable!(),
        };
        let take = (*remaining).min(chunk.len());
        body.extend_from_slice(&chunk[..take]);
        *remaining -= take;
        let done = *remaining == 0;
        let unread = self.consume(chunk, chunk.len() - take);
        if !done {
            return Ok(Progress::default());
        }
        let (msg, body) = match std::mem::replace(
            &mut self.phase,
            Phase::StartLine { buf: Vec::new() },
        ) {
            Phase::Body { msg, body, .. } => (msg, body.freeze()),
            _ => unreachable!(),
        };
        Ok(Progress {
            unread,
            message: Some(finalize(msg, Some(body))),
            classified: None,
        })
    }
}

fn headers_mut(msg: &mut Partial) -> &mut crate::HeaderStore {
    match msg {
        Partial::Req(r) => &mut r.headers,
        Partial::Resp(r) => &mut r.headers,
    }
}

fn finalize(msg: Partial, body: Option<Bytes>) -> Message {
    match msg {
        Partial::Req(mut r) => {
            if let Some(b) = body {
                r.set_body(b);
            }
            Message::Request(r)
        }
        Partial::Resp(mut r) => {
            if let Some(b) = body {
                r.set_body(b);
            }
            Message::Response(r)
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|w| w == needle)
}
