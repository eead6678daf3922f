// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Single-threaded readiness multiplexer.
//!
//! The loop admits endpoints from a FIFO into a bounded active set, sweeps
//! the active set with a zero-timeout `poll(2)`, and dispatches at most one
//! readable and one writable turn per endpoint per cycle. It also runs a
//! heap of scheduled one-shot callbacks (at most one per cycle) and a list of
//! per-cycle hooks. It never blocks: a cycle that finds nothing to do
//! returns control to the caller, so a `Connecting` socket can't starve
//! anyone.
//!
//! The loop doesn't own sockets. The driving context implements [`Mux`],
//! which resolves an opaque token to the polling view of its endpoint and
//! receives the readiness turns. That keeps the ownership graph acyclic:
//! the engine owns presentations, presentations own sockets, and the loop
//! holds only tokens.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::os::fd::RawFd;
use std::time::{Duration, Instant};

/// Handle for a scheduled callback, usable with
/// [`EventLoop::cancel_after`].
pub type AfterId = u64;

/// What [`Mux::poll_connect`] reports about an in-flight connect.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ConnectProgress {
    Pending,
    Connected,
    Failed,
}

/// Lifecycle view the loop needs for one endpoint.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PollState {
    Connecting,
    Connected,
}

/// Polling view of one endpoint.
#[derive(Copy, Clone, Debug)]
pub struct PollInfo {
    pub fd: RawFd,
    pub state: PollState,

    /// True when input is already buffered above the kernel (e.g. parser
    /// pushback), so the endpoint must get a readable turn even if `poll`
    /// reports nothing. `poll` is level-triggered only for kernel buffers.
    pub buffered_input: bool,
}

/// The context driven by an [`EventLoop`]: resolves tokens to endpoints and
/// receives their readiness turns.
pub trait Mux {
    /// Called once at admission; starts the endpoint's non-blocking connect.
    fn connectable(&mut self, tok: usize);

    /// Returns the endpoint's polling view, or `None` once it has no open
    /// handle (the loop then drops it from the active set).
    fn poll_info(&self, tok: usize) -> Option<PollInfo>;

    /// Drives an in-flight connect one step.
    fn poll_connect(&mut self, tok: usize) -> ConnectProgress;

    /// A readable turn. Returns whether any progress was made.
    fn readable(&mut self, tok: usize) -> bool;

    /// A writable turn. Returns whether any progress was made.
    fn writable(&mut self, tok: usize) -> bool;
}

type AfterCallback<C> = Box<dyn FnOnce(&mut C)>;

/// A readiness multiplexer over a bounded active set, with an admission
/// queue, scheduled callbacks, and per-cycle hooks.
pub struct EventLoop<C> {
    /// Endpoints awaiting admission, FIFO.
    pending: VecDeque<usize>,

    /// Admitted endpoints, keyed by fd. Iteration order doubles as the
    /// round-robin order.
    active: BTreeMap<RawFd, usize>,

    max_connections: usize,

    /// Scheduled callbacks by id; `schedule` orders them by due time.
    /// Cancellation removes from this map, leaving a stale heap entry to be
    /// skipped on pop.
    after: HashMap<AfterId, AfterCallback<C>>,
    schedule: std::collections::BinaryHeap<std::cmp::Reverse<(Instant, AfterId)>>,
    next_after_id: AfterId,

    hooks: Vec<Box<dyn FnMut(&mut C) -> bool>>,

    /// Total events produced over the loop's lifetime.
    events: u64,
}

impl<C> EventLoop<C> {
    pub fn new(max_connections: usize) -> Self {
        Self {
            pending: VecDeque::new(),
            active: BTreeMap::new(),
            max_connections,
            after: HashMap::new(),
            schedule: std::collections::BinaryHeap::new(),
            next_after_id: 1,
            hooks: Vec::new(),
            events: 0,
        }
    }

    /// Appends an endpoint to the admission queue. It is admitted, connected,
    /// and polled on subsequent cycles.
    pub fn add_socket(&mut self, tok: usize) {
        self.pending.push_back(tok);
    }

    /// Forgets an endpoint, whether admitted or still pending.
    pub fn remove_socket(&mut self, tok: usize) {
        self.pending.retain(|&t| t != tok);
        self.active.retain(|_, &mut t| t != tok);
    }

    /// Schedules `cb` to run once, `delay` from now. Returns a handle for
    /// [`EventLoop::cancel_after`].
    pub fn schedule_after(
        &mut self,
        delay: Duration,
        cb: impl FnOnce(&mut C) + 'static,
    ) -> AfterId {
        let id = self.next_after_id;
        self.next_after_id += 1;
        let due = Instant::now() + delay;
        self.after.insert(id, Box::new(cb));
        self.schedule.push(std::cmp::Reverse((due, id)));
        id
    }

    /// Cancels a scheduled callback. Returns whether it was still pending;
    /// cancelling an already-fired or unknown id is a no-op.
    pub fn cancel_after(&mut self, id: AfterId) -> bool {
        self.after.remove(&id).is_some()
    }

    /// Registers a hook invoked once per cycle; its return value reports
    /// whether it made progress.
    pub fn add_hook(&mut self, hook: impl FnMut(&mut C) -> bool + 'static) {
        self.hooks.push(Box::new(hook));
    }

    /// Changes the active-set bound. Already-admitted endpoints stay; the
    /// new bound applies to subsequent admissions.
    pub fn set_max_connections(&mut self, max: usize) {
        self.max_connections = max;
    }

    pub fn active_len(&self) -> usize {
        self.active.len()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// True while anything remains queued, admitted, or scheduled.
    pub fn has_work(&self) -> bool {
        !(self.pending.is_empty() && self.active.is_empty() && self.after.is_empty())
    }
}

impl<C: Mux> EventLoop<C> {
    /// Runs one cycle and returns the number of events produced.
    pub fn run_cycle(&mut self, ctx: &mut C) -> u64 {
        let before = self.events;
        self.fire_one_due_callback(ctx);
        self.admit(ctx);
        self.sweep(ctx);
        self.run_hooks(ctx);
        self.events - before
    }

    /// Repeats cycles until the admission queue, active set, and schedule are
    /// all empty. Idle cycles yield briefly so a lone `Connecting` socket
    /// doesn't spin a core.
    pub fn run(&mut self, ctx: &mut C) {
        while self.has_work() {
            if self.run_cycle(ctx) == 0 {
                std::thread::sleep(Duration::from_millis(1));
            }
        }
    }

    /// Pops and invokes at most one due scheduled callback, skipping
    /// cancelled entries.
    fn fire_one_due_callback(&mut self, ctx: &mut C) {
        let now = Instant::now();
        while let Some(&std::cmp::Reverse((due, id))) = self.schedule.peek() {
            if due > now {
                return;
            }
            self.schedule.pop();
            if let Some(cb) = self.after.remove(&id) {
                cb(ctx);
                self.events += 1;
                return;
            }
            // Cancelled; keep looking for a live one.
        }
    }

    /// Shifts endpoints from the admission queue while the active set has
    /// room. Admission starts the connect; an endpoint that reports
    /// `Connecting` or `Connected` joins the active set.
    fn admit(&mut self, ctx: &mut C) {
        while self.active.len() < self.max_connections {
            let tok = match self.pending.pop_front() {
                Some(t) => t,
                None => return,
            };
            ctx.connectable(tok);
            match ctx.poll_info(tok) {
                Some(info) => {
                    self.active.insert(info.fd, tok);
                    self.events += 1;
                }
                // The connect failed synchronously; the mux has already
                // surfaced it.
                None => {}
            }
        }
    }

    /// Zero-timeout readiness sweep over the active set.
    fn sweep(&mut self, ctx: &mut C) {
        if self.active.is_empty() {
            return;
        }
        let entries: Vec<(RawFd, usize)> = self.active.iter().map(|(&fd, &t)| (fd, t)).collect();
        let mut pollfds: Vec<libc::pollfd> = entries
            .iter()
            .map(|&(fd, _)| libc::pollfd {
                fd,
                events: libc::POLLIN | libc::POLLOUT,
                revents: 0,
            })
            .collect();
        let n = unsafe { libc::poll(pollfds.as_mut_ptr(), pollfds.len() as libc::nfds_t, 0) };
        if n < 0 {
            // EINTR or a bad fd snuck in; readiness polling never raises.
            // Stale entries wash out below via poll_info.
            log::debug!("poll failed: {}", std::io::Error::last_os_error());
        }
        for (&(fd, tok), pfd) in entries.iter().zip(&pollfds) {
            let mut info = match ctx.poll_info(tok) {
                Some(i) => i,
                None => {
                    self.active.remove(&fd);
                    continue;
                }
            };
            if info.state == PollState::Connecting {
                match ctx.poll_connect(tok) {
                    ConnectProgress::Pending => continue,
                    ConnectProgress::Connected => self.events += 1,
                    ConnectProgress::Failed => {
                        self.events += 1;
                        self.active.remove(&fd);
                        continue;
                    }
                }
                info = match ctx.poll_info(tok) {
                    Some(i) => i,
                    None => {
                        self.active.remove(&fd);
                        continue;
                    }
                };
            }
            let readable = pfd.revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) != 0
                || info.buffered_input;
            if info.state == PollState::Connected && readable && ctx.readable(tok) {
                self.events += 1;
            }
            match ctx.poll_info(tok) {
                Some(info)
                    if info.state == PollState::Connected
                        && pfd.revents & libc::POLLOUT != 0 =>
                {
                    if ctx.writable(tok) {
                        self.events += 1;
                    }
                }
                Some(_) => {}
                None => {
                    self.active.remove(&fd);
                    continue;
                }
            }
            if ctx.poll_info(tok).is_none() {
                self.active.remove(&fd);
            }
        }
    }

    fn run_hooks(&mut self, ctx: &mut C) {
        let mut hooks = std::mem::take(&mut self.hooks);
        for h in &mut hooks {
            if h(ctx) {
                self.events += 1;
            }
        }
        // A hook may itself have registered hooks; keep both.
        hooks.append(&mut self.hooks);
        self.hooks = hooks;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::net::UdpSocket;
    use std::rc::Rc;

    /// Endpoints backed by connected UDP sockets: always writable, readable
    /// only when a datagram is queued, never in `Connecting`.
    struct FakeMux {
        conns: Vec<Option<UdpSocket>>,
        log: Rc<RefCell<Vec<String>>>,
    }

    impl FakeMux {
        fn new(log: Rc<RefCell<Vec<String>>>) -> Self {
            Self { conns: Vec::new(), log }
        }

        fn add_conn(&mut self) -> usize {
            let s = UdpSocket::bind("127.0.0.1:0").unwrap();
            let addr = s.local_addr().unwrap();
            s.connect(addr).unwrap();
            self.conns.push(Some(s));
            self.conns.len() - 1
        }
    }

    impl Mux for FakeMux {
        fn connectable(&mut self, tok: usize) {
            self.log.borrow_mut().push(format!("connectable {tok}"));
        }

        fn poll_info(&self, tok: usize) -> Option<PollInfo> {
            use std::os::fd::AsRawFd;
            let s = self.conns.get(tok)?.as_ref()?;
            Some(PollInfo {
                fd: s.as_raw_fd(),
                state: PollState::Connected,
                buffered_input: false,
            })
        }

        fn poll_connect(&mut self, _tok: usize) -> ConnectProgress {
            ConnectProgress::Connected
        }

        fn readable(&mut self, tok: usize) -> bool {
            self.log.borrow_mut().push(format!("readable {tok}"));
            let s = self.conns[tok].as_ref().unwrap();
            let mut buf = [0u8; 64];
            s.recv(&mut buf).is_ok()
        }

        fn writable(&mut self, tok: usize) -> bool {
            self.log.borrow_mut().push(format!("writable {tok}"));
            false
        }
    }

    #[test]
    fn active_set_respects_max_connections() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut mux = FakeMux::new(log.clone());
        let toks: Vec<usize> = (0..3).map(|_| mux.add_conn()).collect();
        let mut el = EventLoop::new(2);
        for &t in &toks {
            el.add_socket(t);
        }
        el.run_cycle(&mut mux);
        assert_eq!(el.active_len(), 2);
        assert_eq!(el.pending_len(), 1);

        // Freeing a slot admits the straggler.
        el.remove_socket(toks[0]);
        el.run_cycle(&mut mux);
        assert_eq!(el.active_len(), 2);
        assert_eq!(el.pending_len(), 0);
    }

    #[test]
    fn readable_turn_fires_on_queued_datagram() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut mux = FakeMux::new(log.clone());
        let tok = mux.add_conn();
        mux.conns[tok].as_ref().unwrap().send(b"x").unwrap();
        let mut el = EventLoop::new(4);
        el.add_socket(tok);
        el.run_cycle(&mut mux);
        // Admission happens on the first cycle; readiness on the next sweep.
        el.run_cycle(&mut mux);
        assert!(
            log.borrow().iter().any(|l| l == "readable 0"),
            "log: {:?}",
            log.borrow()
        );
    }

    /// A mux with no endpoints at all, for exercising the schedule.
    struct NoConns;

    impl Mux for NoConns {
        fn connectable(&mut self, _: usize) {}
        fn poll_info(&self, _: usize) -> Option<PollInfo> {
            None
        }
        fn poll_connect(&mut self, _: usize) -> ConnectProgress {
            ConnectProgress::Failed
        }
        fn readable(&mut self, _: usize) -> bool {
            false
        }
        fn writable(&mut self, _: usize) -> bool {
            false
        }
    }

    #[test]
    fn scheduled_callbacks_fire_once_and_cancel() {
        let fired = Rc::new(RefCell::new(Vec::new()));
        let mut el = EventLoop::<NoConns>::new(4);
        let f = fired.clone();
        let _a = el.schedule_after(Duration::from_millis(20), move |_| {
            f.borrow_mut().push("a");
        });
        let f = fired.clone();
        let b = el.schedule_after(Duration::from_millis(10), move |_| {
            f.borrow_mut().push("b");
        });
        assert!(el.cancel_after(b));
        assert!(!el.cancel_after(b));

        std::thread::sleep(Duration::from_millis(40));
        let mut ctx = NoConns;
        el.run_cycle(&mut ctx);
        el.run_cycle(&mut ctx);
        assert_eq!(*fired.borrow(), vec!["a"]);
        assert!(!el.has_work());
    }

    #[test]
    fn one_due_callback_per_cycle() {
        let fired = Rc::new(RefCell::new(0u32));
        let mut el = EventLoop::<NoConns>::new(4);
        for _ in 0..2 {
            let f = fired.clone();
            el.schedule_after(Duration::ZERO, move |_| *f.borrow_mut() += 1);
        }
        std::thread::sleep(Duration::from_millis(5));
        let mut ctx = NoConns;
        assert_eq!(el.run_cycle(&mut ctx), 1);
        assert_eq!(*fired.borrow(), 1);
        assert_eq!(el.run_cycle(&mut ctx), 1);
        assert_eq!(*fired.borrow(), 2);
    }

    #[test]
    fn hooks_run_every_cycle() {
        let count = Rc::new(RefCell::new(0u32));
        let mut el = EventLoop::<NoConns>::new(4);
        let c = count.clone();
        el.add_hook(move |_| {
            *c.borrow_mut() += 1;
            true
        });
        let mut ctx = NoConns;
        assert_eq!(el.run_cycle(&mut ctx), 1);
        el.run_cycle(&mut ctx);
        assert_eq!(*count.borrow(), 2);
    }
}
