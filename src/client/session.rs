// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Session lifecycle within a presentation.
//!
//! A session is created by `SETUP` and identified by the server's `Session`
//! header. Until that response arrives the session is `Inactive` and every
//! request submitted through it is buffered, not written; the buffer drains
//! in submission order once the id is known, each request annotated with the
//! `Session` header. `PLAY`/`PAUSE`/`RECORD`/`TEARDOWN` move the state on
//! success.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use super::presentation::Completion;
use crate::message::Request;

/// Interval between keepalive `GET_PARAMETER` requests while `Playing`, when
/// keepalive is enabled.
pub const KEEPALIVE_DURATION: Duration = Duration::from_secs(30);

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// `SETUP` sent (or not yet sent); no server-assigned id.
    Inactive,
    /// `SETUP` response received; id assigned.
    Ready,
    Playing,
    Paused,
    Recording,
}

/// Which session operation a request performs, for the state transition on
/// its success.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum SessionOp {
    Setup,
    Play,
    Pause,
    Record,
    Teardown,
    Other,
}

pub(crate) struct Buffered {
    pub(crate) req: Request,
    pub(crate) op: SessionOp,
    pub(crate) completion: Option<Completion>,
}

pub struct Session {
    uri: String,
    state: SessionState,
    id: Option<String>,

    /// Requests submitted while `Inactive`, in submission order.
    buffered: VecDeque<Buffered>,

    keepalive_period: Option<Duration>,
    last_keepalive: Instant,
}

impl Session {
    pub(crate) fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            state: SessionState::Inactive,
            id: None,
            buffered: VecDeque::new(),
            keepalive_period: None,
            last_keepalive: Instant::now(),
        }
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// The server-assigned session id, once `SETUP` has completed.
    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    /// Enables (or disables) periodic keepalive `GET_PARAMETER` requests
    /// while `Playing`. `None` period means [`KEEPALIVE_DURATION`].
    pub fn set_keepalive(&mut self, enabled: bool, period: Option<Duration>) {
        self.keepalive_period = enabled.then(|| period.unwrap_or(KEEPALIVE_DURATION));
        self.last_keepalive = Instant::now();
    }

    pub(crate) fn buffer(&mut self, req: Request, op: SessionOp, completion: Option<Completion>) {
        self.buffered.push_back(Buffered {
            req,
            op,
            completion,
        });
    }

    pub(crate) fn buffered_len(&self) -> usize {
        self.buffered.len()
    }

    /// Records the server's id and leaves `Inactive`. The caller drains
    /// [`Session::take_buffered`] next.
    pub(crate) fn set_ready(&mut self, id: impl Into<String>) {
        self.id = Some(id.into());
        self.state = SessionState::Ready;
        self.last_keepalive = Instant::now();
    }

    pub(crate) fn take_buffered(&mut self) -> VecDeque<Buffered> {
        std::mem::take(&mut self.buffered)
    }

    /// State transition for a successful session operation.
    ///
    /// Pause, record, and teardown apply from any state; play is only
    /// defined out of `Ready` or `Paused`, and a play response arriving in
    /// any other state leaves the state alone.
    pub(crate) fn apply_success(&mut self, op: SessionOp) {
        match op {
            SessionOp::Play => {
                if matches!(self.state, SessionState::Ready | SessionState::Paused) {
                    self.state = SessionState::Playing;
                }
            }
            SessionOp::Pause => self.state = SessionState::Paused,
            SessionOp::Record => self.state = SessionState::Recording,
            SessionOp::Teardown => {
                self.state = SessionState::Inactive;
                self.id = None;
            }
            // Setup runs through set_ready; Other doesn't transition.
            SessionOp::Setup | SessionOp::Other => {}
        }
    }

    /// True when a keepalive is due; resets the stamp when it fires.
    pub(crate) fn keepalive_due(&mut self) -> bool {
        let period = match self.keepalive_period {
            Some(p) if self.state == SessionState::Playing => p,
            _ => return false,
        };
        if self.last_keepalive.elapsed() < period {
            return false;
        }
        self.last_keepalive = Instant::now();
        true
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("uri", &self.uri)
            .field("state", &self.state)
            .field("id", &self.id)
            .field("buffered", &self.buffered.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transitions() {
        let mut s = Session::new("rtsp://h/a");
        assert_eq!(s.state(), SessionState::Inactive);
        s.set_ready("ABC123");
        assert_eq!(s.state(), SessionState::Ready);
        assert_eq!(s.id(), Some("ABC123"));
        s.apply_success(SessionOp::Play);
        assert_eq!(s.state(), SessionState::Playing);
        s.apply_success(SessionOp::Pause);
        assert_eq!(s.state(), SessionState::Paused);
        s.apply_success(SessionOp::Record);
        assert_eq!(s.state(), SessionState::Recording);
        s.apply_success(SessionOp::Teardown);
        assert_eq!(s.state(), SessionState::Inactive);
        assert_eq!(s.id(), None);
    }

    #[test]
    fn play_only_applies_from_ready_or_paused() {
        let mut s = Session::new("rtsp://h/a");
        // No SETUP response yet; a stray play success changes nothing.
        s.apply_success(SessionOp::Play);
        assert_eq!(s.state(), SessionState::Inactive);

        s.set_ready("ABC123");
        s.apply_success(SessionOp::Record);
        assert_eq!(s.state(), SessionState::Recording);
        s.apply_success(SessionOp::Play);
        assert_eq!(s.state(), SessionState::Recording);

        s.apply_success(SessionOp::Pause);
        s.apply_success(SessionOp::Play);
        assert_eq!(s.state(), SessionState::Playing);
    }

    #[test]
    fn buffer_preserves_submission_order() {
        let mut s = Session::new("rtsp://h/a");
        s.buffer(Request::new("PLAY", "*"), SessionOp::Play, None);
        s.buffer(Request::new("PAUSE", "*"), SessionOp::Pause, None);
        assert_eq!(s.buffered_len(), 2);
        let drained = s.take_buffered();
        let methods: Vec<_> = drained.iter().map(|b| b.req.method().to_owned()).collect();
        assert_eq!(methods, ["PLAY", "PAUSE"]);
        assert_eq!(s.buffered_len(), 0);
    }

    #[test]
    fn keepalive_only_fires_when_playing() {
        let mut s = Session::new("rtsp://h/a");
        s.set_keepalive(true, Some(Duration::ZERO));
        assert!(!s.keepalive_due());
        s.set_ready("X");
        assert!(!s.keepalive_due());
        s.apply_success(SessionOp::Play);
        assert!(s.keepalive_due());
    }
}
