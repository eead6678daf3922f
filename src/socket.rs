// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Unified TCP/UDP endpoint.
//!
//! One type covers both transports so the protocol engine above it doesn't
//! care whether a presentation rides `rtsp://` (stream) or `rtspu://`
//! (datagram). The notable piece is the pushback buffer: the incremental
//! parser routinely reads past the boundary it needed and deposits the
//! excess back via [`Socket::unread`]. Every read drains that buffer before
//! touching the kernel; skipping the drain would lose bytes across parse
//! states.

use std::io;
use std::mem::MaybeUninit;
use std::net::{SocketAddr, ToSocketAddrs};
use std::os::fd::{AsRawFd, RawFd};
use std::time::{Duration, Instant};

use socket2::{Domain, Socket as SysSocket, Type};

use crate::error::ErrorInt;
use crate::{ConnectionContext, Error};

/// Transport kind, chosen by URI scheme.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TransportKind {
    /// TCP; `rtsp://`.
    Stream,
    /// UDP; `rtspu://`.
    Datagram,
}

/// Connection lifecycle plus the transient I/O states the event loop
/// observes while dispatching readiness.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum SocketState {
    Disconnected,
    Connectable,
    Connecting,
    Connected,
    Readable,
    Reading,
    Writable,
    Writing,
}

impl SocketState {
    /// True in any state where the handle is open and connected (or believed
    /// to be).
    pub(crate) fn is_established(self) -> bool {
        !matches!(
            self,
            SocketState::Disconnected | SocketState::Connectable | SocketState::Connecting
        )
    }
}

/// Result of polling an in-flight non-blocking connect.
#[derive(Debug)]
pub(crate) enum ConnectPoll {
    Pending,
    Ready,
    Failed(String),
}

pub(crate) struct Socket {
    inner: Option<SysSocket>,
    kind: TransportKind,
    host: String,
    port: u16,
    state: SocketState,

    /// Monotonic stamp of the last successful operation.
    last_active: Instant,

    connect_deadline: Option<Instant>,

    /// Bytes a consumer read but did not yet process; drained before any
    /// system read, newest prepend first.
    pushback: Vec<u8>,

    last_error: Option<String>,
    conn_ctx: Option<ConnectionContext>,
}

impl Socket {
    pub(crate) fn new(kind: TransportKind, host: impl Into<String>, port: u16) -> Self {
        Self {
            inner: None,
            kind,
            host: host.into(),
            port,
            state: SocketState::Disconnected,
            last_active: Instant::now(),
            connect_deadline: None,
            pushback: Vec::new(),
            last_error: None,
            conn_ctx: None,
        }
    }

    pub(crate) fn kind(&self) -> TransportKind {
        self.kind
    }

    pub(crate) fn host(&self) -> &str {
        &self.host
    }

    pub(crate) fn port(&self) -> u16 {
        self.port
    }

    pub(crate) fn state(&self) -> SocketState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: SocketState) {
        self.state = state;
    }

    pub(crate) fn raw_fd(&self) -> Option<RawFd> {
        self.inner.as_ref().map(|s| s.as_raw_fd())
    }

    pub(crate) fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub(crate) fn has_pushback(&self) -> bool {
        !self.pushback.is_empty()
    }

    /// The connection context for error reporting; present once connected.
    pub(crate) fn connection_context(&self) -> ConnectionContext {
        self.conn_ctx.unwrap_or_else(ConnectionContext::dummy)
    }

    fn record_error(&mut self, msg: String) -> String {
        log::debug!("socket {}:{}: {}", self.host, self.port, msg);
        self.last_error = Some(msg.clone());
        msg
    }

    fn resolve(&self) -> io::Result<SocketAddr> {
        (self.host.as_str(), self.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("no addresses for {}", self.host),
                )
            })
    }

    fn make_socket(&self, addr: SocketAddr) -> io::Result<SysSocket> {
        let ty = match self.kind {
            TransportKind::Stream => Type::STREAM,
            TransportKind::Datagram => Type::DGRAM,
        };
        SysSocket::new(Domain::for_address(addr), ty, None)
    }

    fn established(&mut self) {
        self.last_active = Instant::now();
        self.connect_deadline = None;
        self.state = SocketState::Connected;
        self.conn_ctx = self.inner.as_ref().and_then(|s| {
            let local = s.local_addr().ok()?.as_socket()?;
            let peer = s.peer_addr().ok()?.as_socket()?;
            Some(ConnectionContext::new(local, peer))
        });
    }

    /// Connects synchronously, waiting up to `timeout` for a stream to
    /// establish. Datagram "connects" only set the default peer and don't
    /// wait.
    pub(crate) fn connect_blocking(&mut self, timeout: Duration) -> Result<(), Error> {
        let addr = self.resolve().map_err(|e| self.connect_err(e))?;
        let sock = self.make_socket(addr).map_err(|e| self.connect_err(e))?;
        let r = match self.kind {
            TransportKind::Stream => sock.connect_timeout(&addr.into(), timeout),
            TransportKind::Datagram => sock.connect(&addr.into()),
        };
        if let Err(e) = r {
            if e.kind() == io::ErrorKind::TimedOut {
                self.record_error(format!("Connect to {}:{} timed out", self.host, self.port));
                crate::bail!(ErrorInt::ConnectTimeout {
                    host: self.host.clone(),
                    port: self.port,
                });
            }
            return Err(self.connect_err(e));
        }
        self.inner = Some(sock);
        self.established();
        Ok(())
    }

    /// Starts a non-blocking connect. On return the state is `Connecting`
    /// (stream connect in progress; poll with [`Socket::poll_connect`]) or
    /// `Connected` (immediate success, typical for datagrams).
    ///
    /// The socket is placed in non-blocking mode before `connect` and
    /// switched back once established, so higher layers see straightforward
    /// byte counts from subsequent syscalls.
    pub(crate) fn connect_nonblocking(&mut self, timeout: Duration) -> Result<(), Error> {
        let addr = self.resolve().map_err(|e| self.connect_err(e))?;
        let sock = self.make_socket(addr).map_err(|e| self.connect_err(e))?;
        sock.set_nonblocking(true).map_err(|e| self.connect_err(e))?;
        match sock.connect(&addr.into()) {
            Ok(()) => {
                sock.set_nonblocking(false)
                    .map_err(|e| self.connect_err(e))?;
                self.inner = Some(sock);
                self.established();
            }
            Err(e)
                if e.raw_os_error() == Some(libc::EINPROGRESS)
                    || e.kind() == io::ErrorKind::WouldBlock =>
            {
                self.inner = Some(sock);
                self.last_active = Instant::now();
                self.connect_deadline = Some(Instant::now() + timeout);
                self.state = SocketState::Connecting;
            }
            Err(e) => return Err(self.connect_err(e)),
        }
        Ok(())
    }

    fn connect_err(&mut self, e: io::Error) -> Error {
        self.record_error(format!("Connect to {}:{} failed: {e}", self.host, self.port));
        self.state = SocketState::Disconnected;
        self.inner = None;
        crate::wrap!(ErrorInt::ConnectError(e))
    }

    /// Polls an in-flight non-blocking connect: checks the deadline against
    /// the last-active stamp, then asks the kernel whether the connect
    /// finished. On success the socket reverts to blocking mode.
    pub(crate) fn poll_connect(&mut self) -> ConnectPoll {
        debug_assert_eq!(self.state, SocketState::Connecting);
        if let Some(deadline) = self.connect_deadline {
            if Instant::now() >= deadline {
                let msg =
                    self.record_error(format!("Connect to {}:{} timed out", self.host, self.port));
                self.disconnect();
                return ConnectPoll::Failed(msg);
            }
        }
        let fd = match self.raw_fd() {
            Some(fd) => fd,
            None => return ConnectPoll::Failed("connect lost its handle".to_owned()),
        };
        match wait_ready(fd, libc::POLLOUT, Duration::ZERO) {
            Ok(false) => ConnectPoll::Pending,
            Ok(true) => {
                let sock = self.inner.as_ref().expect("fd implies inner");
                match sock.take_error() {
                    Ok(None) => {
                        if let Err(e) = sock.set_nonblocking(false) {
                            let msg = self.record_error(format!("Connect failed: {e}"));
                            self.disconnect();
                            return ConnectPoll::Failed(msg);
                        }
                        self.established();
                        ConnectPoll::Ready
                    }
                    Ok(Some(e)) | Err(e) => {
                        let msg = self.record_error(format!(
                            "Connect to {}:{} failed: {e}",
                            self.host, self.port
                        ));
                        self.disconnect();
                        ConnectPoll::Failed(msg)
                    }
                }
            }
            Err(e) => {
                let msg = self.record_error(format!("Connect poll failed: {e}"));
                self.disconnect();
                ConnectPoll::Failed(msg)
            }
        }
    }

    /// Closes the handle and records the time. The pushback buffer survives;
    /// `Disconnected` only promises the handle is gone.
    pub(crate) fn disconnect(&mut self) {
        self.inner = None;
        self.connect_deadline = None;
        self.last_active = Instant::now();
        self.state = SocketState::Disconnected;
    }

    /// True when the state says connected and the kernel agrees.
    pub(crate) fn is_connected(&self) -> bool {
        self.state != SocketState::Disconnected
            && self
                .inner
                .as_ref()
                .map(|s| s.peer_addr().is_ok())
                .unwrap_or(false)
    }

    /// Prepends bytes to the pushback buffer; the next read returns them
    /// before anything from the kernel.
    pub(crate) fn unread(&mut self, bytes: &[u8]) {
        self.pushback.splice(0..0, bytes.iter().copied());
    }

    fn drain_pushback(&mut self, buf: &mut [u8], size: usize, offset: usize) -> Option<usize> {
        if self.pushback.is_empty() {
            return None;
        }
        let n = size.min(self.pushback.len()).min(buf.len() - offset);
        buf[offset..offset + n].copy_from_slice(&self.pushback[..n]);
        self.pushback.drain(..n);
        self.last_active = Instant::now();
        Some(n)
    }

    /// Waits for readability up to `timeout`.
    pub(crate) fn wait_readable(&mut self, timeout: Duration) -> Result<bool, Error> {
        if self.has_pushback() {
            return Ok(true);
        }
        let fd = self.require_fd()?;
        wait_ready(fd, libc::POLLIN, timeout).map_err(|e| {
            self.record_error(format!("Readiness poll failed: {e}"));
            crate::wrap!(ErrorInt::ReadError {
                conn_ctx: self.connection_context(),
                msg_ctx: crate::RtspMessageContext::new(0),
                source: e,
            })
        })
    }

    /// Reads up to `size` bytes into `buf[offset..]`, waiting up to
    /// `timeout` for readiness first. Fails with "Read timed out" if the
    /// deadline passes with nothing to read.
    pub(crate) fn read_blocking(
        &mut self,
        buf: &mut [u8],
        size: usize,
        offset: usize,
        timeout: Duration,
    ) -> Result<usize, Error> {
        if let Some(n) = self.drain_pushback(buf, size, offset) {
            return Ok(n);
        }
        if !self.wait_readable(timeout)? {
            self.record_error("Read timed out".to_owned());
            crate::bail!(ErrorInt::ReadTimeout {
                conn_ctx: self.connection_context(),
            });
        }
        self.read_ready(buf, size, offset, 0)
    }

    /// Reads up to `size` bytes into `buf[offset..]` without waiting.
    /// Returns `Ok(0)` when nothing is available.
    pub(crate) fn read_nonblocking(
        &mut self,
        buf: &mut [u8],
        size: usize,
        offset: usize,
    ) -> Result<usize, Error> {
        if let Some(n) = self.drain_pushback(buf, size, offset) {
            return Ok(n);
        }
        self.read_ready(buf, size, offset, libc::MSG_DONTWAIT)
    }

    fn read_ready(
        &mut self,
        buf: &mut [u8],
        size: usize,
        offset: usize,
        flags: libc::c_int,
    ) -> Result<usize, Error> {
        self.require_fd()?;
        let end = (offset + size).min(buf.len());
        let dst = &mut buf[offset..end];
        self.state = SocketState::Reading;
        // recv never reads uninitialized memory out of dst; the cast only
        // satisfies socket2's signature.
        let uninit =
            unsafe { &mut *(dst as *mut [u8] as *mut [MaybeUninit<u8>]) };
        let sock = self.inner.as_ref().expect("require_fd checked");
        let r = retry_eintr(|| sock.recv_with_flags(uninit, flags));
        self.state = SocketState::Connected;
        match r {
            Ok(0) if self.kind == TransportKind::Stream && !dst.is_empty() => {
                let e = io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed by peer");
                Err(self.read_err(e))
            }
            Ok(n) => {
                self.last_active = Instant::now();
                Ok(n)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(self.read_err(e)),
        }
    }

    fn read_err(&mut self, e: io::Error) -> Error {
        self.record_error(format!("Read failed: {e}"));
        crate::wrap!(ErrorInt::ReadError {
            conn_ctx: self.connection_context(),
            msg_ctx: crate::RtspMessageContext::new(0),
            source: e,
        })
    }

    /// Waits for writability up to `timeout`, then writes. A short write is
    /// a network error; callers never resume partial writes.
    pub(crate) fn write_blocking(&mut self, buf: &[u8], timeout: Duration) -> Result<usize, Error> {
        let fd = self.require_fd()?;
        let ready = wait_ready(fd, libc::POLLOUT, timeout).map_err(|e| self.write_err(e))?;
        if !ready {
            let e = io::Error::new(io::ErrorKind::TimedOut, "write timed out");
            self.record_error("Write timed out".to_owned());
            crate::bail!(ErrorInt::WriteError {
                conn_ctx: self.connection_context(),
                source: e,
            });
        }
        self.write_ready(buf, 0)
    }

    /// Writes without waiting. Returns `Ok(0)` if the kernel would block
    /// before accepting anything; a partial acceptance is a network error.
    pub(crate) fn write_nonblocking(&mut self, buf: &[u8]) -> Result<usize, Error> {
        self.require_fd()?;
        self.write_ready(buf, libc::MSG_DONTWAIT)
    }

    fn write_ready(&mut self, buf: &[u8], flags: libc::c_int) -> Result<usize, Error> {
        let sock = self.inner.as_ref().expect("require_fd checked");
        self.state = SocketState::Writing;
        let r = retry_eintr(|| sock.send_with_flags(buf, flags));
        self.state = SocketState::Connected;
        match r {
            Ok(n) if n == buf.len() => {
                self.last_active = Instant::now();
                Ok(n)
            }
            Ok(n) => {
                self.record_error(format!(
                    "Data partially written to {}:{}: {n} of {} bytes",
                    self.host,
                    self.port,
                    buf.len()
                ));
                crate::bail!(ErrorInt::ShortWrite {
                    conn_ctx: self.connection_context(),
                    wrote: n,
                    expected: buf.len(),
                });
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(self.write_err(e)),
        }
    }

    fn write_err(&mut self, e: io::Error) -> Error {
        self.record_error(format!("Write failed: {e}"));
        crate::wrap!(ErrorInt::WriteError {
            conn_ctx: self.connection_context(),
            source: e,
        })
    }

    fn require_fd(&mut self) -> Result<RawFd, Error> {
        match self.raw_fd() {
            Some(fd) => Ok(fd),
            None => {
                self.record_error("socket is not connected".to_owned());
                crate::bail!(ErrorInt::FailedPrecondition(
                    "socket is not connected".to_owned()
                ))
            }
        }
    }
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Socket")
            .field("kind", &self.kind)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("state", &self.state)
            .field("pushback", &self.pushback.len())
            .finish()
    }
}

fn retry_eintr<T>(mut f: impl FnMut() -> io::Result<T>) -> io::Result<T> {
    loop {
        match f() {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            r => return r,
        }
    }
}

/// Polls one fd for the given events, retrying on signal interruption until
/// `timeout` elapses. Returns whether the fd became ready.
pub(crate) fn wait_ready(
    fd: RawFd,
    events: libc::c_short,
    timeout: Duration,
) -> io::Result<bool> {
    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let ms = remaining.as_millis().min(i32::MAX as u128) as libc::c_int;
        let mut pfd = libc::pollfd {
            fd,
            events,
            revents: 0,
        };
        let n = unsafe { libc::poll(&mut pfd, 1, ms) };
        if n < 0 {
            let e = io::Error::last_os_error();
            if e.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(e);
        }
        if n > 0 {
            return Ok(true);
        }
        if Instant::now() >= deadline {
            return Ok(false);
        }
    }
}
