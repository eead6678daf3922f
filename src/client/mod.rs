// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Public client facade.
//!
//! A [`Client`] owns one [`EventLoop`] and a set of [`Presentation`]s, one
//! per RTSP resource. In the event-driven interface, submissions enqueue and
//! the caller drives everything by pumping [`Client::run_cycle`] (or
//! [`Client::run`]); in the blocking interface each submission round-trips
//! synchronously on its own socket and the loop is unused. Both interfaces
//! share the wire layer, and a blocking call never stalls other
//! presentations because it only ever touches its own connection.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use log::{debug, warn};
use url::Url;

mod parse;
pub mod presentation;
pub mod session;

pub use presentation::{
    Completion, Outcome, Presentation, PresentationState, ServerRequestHandler, DEFAULT_ACCEPT,
};
pub use session::{Session, SessionState, KEEPALIVE_DURATION};

use crate::error::ErrorInt;
use crate::event_loop::{AfterId, ConnectProgress, EventLoop, Mux, PollInfo};
use crate::headers::normalize_name;
use crate::socket::TransportKind;
use crate::Error;

/// Which mode submissions use.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Interface {
    /// Submissions enqueue; the event loop completes them via callbacks.
    EventDriven,
    /// Each submission round-trips synchronously.
    Blocking,
}

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_BUFFER_SIZE: usize = 4096;
const DEFAULT_MAX_CONNECTIONS: usize = 12;
const DEFAULT_USER_AGENT: &str = "rtsp-engine";

/// One configurable reporting sink: an optional callback, an enable toggle,
/// and the last message for later retrieval. A disabled sink still records
/// but produces no side effects.
#[derive(Default)]
pub(crate) struct Sink {
    cb: Option<Box<dyn FnMut(&str)>>,
    disabled: bool,
    last: Option<String>,
}

impl Sink {
    fn report(&mut self, msg: &str) {
        self.last = Some(msg.to_owned());
        if self.disabled {
            return;
        }
        if let Some(cb) = &mut self.cb {
            cb(msg);
        }
    }
}

/// The error/warning sink pair, threaded to every presentation explicitly.
#[derive(Default)]
pub(crate) struct Sinks {
    error: Sink,
    warning: Sink,
}

impl Sinks {
    pub(crate) fn error(&mut self, msg: &str) {
        warn!("{msg}");
        self.error.report(msg);
    }

    pub(crate) fn warning(&mut self, msg: &str) {
        debug!("{msg}");
        self.warning.report(msg);
    }
}

/// The presentations driven by one client; also the context scheduled
/// callbacks receive.
#[derive(Default)]
pub struct PresentationSet {
    presentations: Vec<Option<Presentation>>,
}

impl PresentationSet {
    pub fn presentation(&self, id: usize) -> Option<&Presentation> {
        self.presentations.get(id)?.as_ref()
    }

    pub fn presentation_mut(&mut self, id: usize) -> Option<&mut Presentation> {
        self.presentations.get_mut(id)?.as_mut()
    }

    fn insert(&mut self, make: impl FnOnce(usize) -> Presentation) -> usize {
        let id = self.presentations.len();
        self.presentations.push(Some(make(id)));
        id
    }

    fn remove(&mut self, id: usize) -> Option<Presentation> {
        self.presentations.get_mut(id)?.take()
    }

    fn service_keepalives(&mut self) -> bool {
        let mut any = false;
        for p in self.presentations.iter_mut().flatten() {
            if p.service_keepalives() {
                any = true;
            }
        }
        any
    }
}

impl Mux for PresentationSet {
    fn connectable(&mut self, tok: usize) {
        if let Some(p) = self.presentation_mut(tok) {
            p.handle_connectable();
        }
    }

    fn poll_info(&self, tok: usize) -> Option<PollInfo> {
        self.presentation(tok)?.poll_info()
    }

    fn poll_connect(&mut self, tok: usize) -> ConnectProgress {
        match self.presentation_mut(tok) {
            Some(p) => p.poll_connect_step(),
            None => ConnectProgress::Failed,
        }
    }

    fn readable(&mut self, tok: usize) -> bool {
        match self.presentation_mut(tok) {
            Some(p) => p.handle_readable(),
            None => false,
        }
    }

    fn writable(&mut self, tok: usize) -> bool {
        match self.presentation_mut(tok) {
            Some(p) => p.handle_writable(),
            None => false,
        }
    }
}

/// The top-level RTSP client engine.
pub struct Client {
    interface: Interface,
    timeout: Duration,
    buffer_size: usize,
    pipelining: bool,
    user_agent: String,
    event_loop: EventLoop<PresentationSet>,
    set: PresentationSet,
    sinks: Rc<RefCell<Sinks>>,
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}

impl Client {
    pub fn new() -> Self {
        let mut event_loop = EventLoop::new(DEFAULT_MAX_CONNECTIONS);
        // Session keepalives ride the per-cycle hook list.
        event_loop.add_hook(PresentationSet::service_keepalives);
        Self {
            interface: Interface::EventDriven,
            timeout: DEFAULT_TIMEOUT,
            buffer_size: DEFAULT_BUFFER_SIZE,
            pipelining: false,
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            event_loop,
            set: PresentationSet::default(),
            sinks: Rc::new(RefCell::new(Sinks::default())),
        }
    }

    // Typed configuration. Applies to presentations opened afterwards.

    pub fn set_interface(&mut self, interface: Interface) {
        self.interface = interface;
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    pub fn set_buffer_size(&mut self, buffer_size: usize) {
        self.buffer_size = buffer_size;
    }

    pub fn set_max_connections(&mut self, max: usize) {
        self.event_loop.set_max_connections(max);
    }

    pub fn set_pipelining(&mut self, pipelining: bool) {
        self.pipelining = pipelining;
    }

    pub fn set_user_agent(&mut self, user_agent: impl Into<String>) {
        self.user_agent = user_agent.into();
    }

    /// Sets a recognised option by its operator-facing name. Names match
    /// irrespective of case, separators, and a leading dash (`Timeout`,
    /// `timeout`, `-time_out` are all the same option); unknown names are
    /// ignored with a warning.
    pub fn set_option(&mut self, name: &str, value: &str) -> Result<(), Error> {
        match normalize_name(name).as_str() {
            "interface" => match normalize_name(value).as_str() {
                "eventdriven" => self.interface = Interface::EventDriven,
                "blocking" => self.interface = Interface::Blocking,
                _ => crate::bail!(ErrorInt::InvalidArgument(format!(
                    "unknown interface type {value:?}"
                ))),
            },
            "timeout" => {
                let secs: u64 = parse_option(name, value)?;
                self.timeout = Duration::from_secs(secs);
            }
            "buffersize" => self.buffer_size = parse_option(name, value)?,
            "maxactiveconnections" => {
                let max = parse_option(name, value)?;
                self.event_loop.set_max_connections(max);
            }
            "pipelining" => self.pipelining = parse_flag(name, value)?,
            "useerrorcallback" => {
                self.sinks.borrow_mut().error.disabled = !parse_flag(name, value)?
            }
            "usewarningcallback" => {
                self.sinks.borrow_mut().warning.disabled = !parse_flag(name, value)?
            }
            _ => {
                self.sinks
                    .borrow_mut()
                    .warning(&format!("ignoring unknown option {name:?}"));
            }
        }
        Ok(())
    }

    pub fn set_error_callback(&mut self, cb: impl FnMut(&str) + 'static) {
        self.sinks.borrow_mut().error.cb = Some(Box::new(cb));
    }

    pub fn set_warning_callback(&mut self, cb: impl FnMut(&str) + 'static) {
        self.sinks.borrow_mut().warning.cb = Some(Box::new(cb));
    }

    pub fn use_error_callback(&mut self, enabled: bool) {
        self.sinks.borrow_mut().error.disabled = !enabled;
    }

    pub fn use_warning_callback(&mut self, enabled: bool) {
        self.sinks.borrow_mut().warning.disabled = !enabled;
    }

    /// The most recent error string, whatever the sink configuration.
    pub fn last_error(&self) -> Option<String> {
        self.sinks.borrow().error.last.clone()
    }

    pub fn last_warning(&self) -> Option<String> {
        self.sinks.borrow().warning.last.clone()
    }

    /// Opens a presentation for `uri` and returns its id.
    ///
    /// `rtsp://` means stream transport and `rtspu://` datagram; a missing
    /// scheme is treated as `rtsp://`, and any other scheme produces a
    /// warning and is still attempted over a stream. In the event-driven
    /// interface the connect starts on a later cycle; in the blocking
    /// interface it happens here.
    pub fn open(&mut self, uri: &str) -> Result<usize, Error> {
        let (kind, host, port, uri) = self.parse_target(uri)?;
        let blocking = self.interface == Interface::Blocking;
        let (timeout, buffer_size, pipelining) = (self.timeout, self.buffer_size, self.pipelining);
        let user_agent = self.user_agent.clone();
        let sinks = self.sinks.clone();
        let id = self.set.insert(|id| {
            Presentation::new(
                id,
                kind,
                host,
                port,
                uri,
                blocking,
                timeout,
                buffer_size,
                pipelining,
                user_agent,
                sinks,
            )
        });
        if blocking {
            let p = self.set.presentation_mut(id).expect("just inserted");
            if let Err(e) = p.connect_now() {
                self.set.remove(id);
                return Err(e);
            }
        } else {
            let p = self.set.presentation_mut(id).expect("just inserted");
            p.mark_registered();
            self.event_loop.add_socket(id);
        }
        Ok(id)
    }

    fn parse_target(&mut self, uri: &str) -> Result<(TransportKind, String, u16, String), Error> {
        let with_scheme = if uri.contains("://") {
            uri.to_owned()
        } else {
            format!("rtsp://{uri}")
        };
        let url = match Url::parse(&with_scheme) {
            Ok(u) => u,
            Err(e) => crate::bail!(ErrorInt::InvalidArgument(format!("bad URI {uri:?}: {e}"))),
        };
        let kind = match url.scheme() {
            "rtsp" => TransportKind::Stream,
            "rtspu" => TransportKind::Datagram,
            other => {
                self.sinks.borrow_mut().warning(&format!(
                    "unsupported scheme {other:?} in {uri:?}; attempting stream transport"
                ));
                TransportKind::Stream
            }
        };
        let host = match url.host_str() {
            Some(h) if !h.is_empty() => h.to_owned(),
            _ => crate::bail!(ErrorInt::InvalidArgument(format!("no host in {uri:?}"))),
        };
        let port = url.port().unwrap_or(554);
        Ok((kind, host, port, url.to_string()))
    }

    pub fn presentation(&self, id: usize) -> Option<&Presentation> {
        self.set.presentation(id)
    }

    pub fn presentation_mut(&mut self, id: usize) -> Option<&mut Presentation> {
        self.set.presentation_mut(id)
    }

    /// Terminates a presentation and forgets it.
    pub fn close(&mut self, id: usize) {
        self.event_loop.remove_socket(id);
        if let Some(mut p) = self.set.remove(id) {
            p.terminate();
        }
    }

    /// Runs one event-loop cycle; returns the number of events produced.
    pub fn run_cycle(&mut self) -> u64 {
        self.event_loop.run_cycle(&mut self.set)
    }

    /// Runs until no admitted, pending, or scheduled work remains.
    pub fn run(&mut self) {
        self.event_loop.run(&mut self.set)
    }

    /// Schedules a one-shot callback `delay` from now; it runs on a cycle
    /// with the presentation set as context.
    pub fn schedule_after(
        &mut self,
        delay: Duration,
        cb: impl FnOnce(&mut PresentationSet) + 'static,
    ) -> AfterId {
        self.event_loop.schedule_after(delay, cb)
    }

    pub fn cancel_after(&mut self, id: AfterId) -> bool {
        self.event_loop.cancel_after(id)
    }
}


fn parse_option<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, Error> {
    match value.parse() {
        Ok(v) => Ok(v),
        Err(_) => crate::bail!(ErrorInt::InvalidArgument(format!(
            "bad value {value:?} for option {name:?}"
        ))),
    }
}

fn parse_flag(name: &str, value: &str) -> Result<bool, Error> {
    match value {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => crate::bail!(ErrorInt::InvalidArgument(format!(
            "bad value {value:?} for flag {name:?}"
        ))),
    }
}
