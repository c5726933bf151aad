//! Level-triggered epoll dispatcher: descriptors in, handler callbacks out.
//!
//! The reactor performs no I/O of its own. Each ready descriptor is looked
//! up in the handler table and its handler runs synchronously on the reactor
//! thread; handlers change the registration table through the [`Scope`] they
//! are given, and those changes apply between dispatches, so a handler may
//! safely delete the very descriptor it is running for.

use std::collections::HashMap;
use std::io;
use std::ops::BitOr;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{ChatError, Result};

/// Readiness bits delivered to handlers, mirroring the epoll event mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventSet(u32);

impl EventSet {
    pub const READABLE: EventSet = EventSet(libc::EPOLLIN as u32);
    pub const WRITABLE: EventSet = EventSet(libc::EPOLLOUT as u32);
    /// Peer shut down its write side (EPOLLRDHUP).
    pub const READ_CLOSED: EventSet = EventSet(libc::EPOLLRDHUP as u32);
    pub const HANGUP: EventSet = EventSet(libc::EPOLLHUP as u32);
    pub const ERROR: EventSet = EventSet(libc::EPOLLERR as u32);

    /// True when any bit of `other` is set in `self`.
    pub fn intersects(self, other: EventSet) -> bool {
        self.0 & other.0 != 0
    }

    fn bits(self) -> u32 {
        self.0
    }

    fn from_bits(bits: u32) -> EventSet {
        EventSet(bits)
    }
}

impl BitOr for EventSet {
    type Output = EventSet;

    fn bitor(self, rhs: EventSet) -> EventSet {
        EventSet(self.0 | rhs.0)
    }
}

/// A handler runs with exclusive access to the shared state `S` and a
/// [`Scope`] for registration changes. Returning an error is fatal: it
/// aborts [`Reactor::run`] and takes the server down.
pub type Handler<S> = Box<dyn FnMut(&mut S, EventSet, &mut Scope<S>) -> Result<()> + Send>;

enum Op<S> {
    Add {
        fd: RawFd,
        interest: EventSet,
        handler: Handler<S>,
    },
    Del {
        fd: RawFd,
    },
}

/// Deferred registration changes requested from inside a handler.
pub struct Scope<S> {
    ops: Vec<Op<S>>,
}

impl<S> Scope<S> {
    fn new() -> Self {
        Self { ops: Vec::new() }
    }

    pub fn add<H>(&mut self, fd: RawFd, interest: EventSet, handler: H)
    where
        H: FnMut(&mut S, EventSet, &mut Scope<S>) -> Result<()> + Send + 'static,
    {
        self.ops.push(Op::Add {
            fd,
            interest,
            handler: Box::new(handler),
        });
    }

    pub fn del(&mut self, fd: RawFd) {
        self.ops.push(Op::Del { fd });
    }
}

/// Cloneable handle that stops the loop from any thread: it raises the stop
/// flag and kicks the reactor's internal wake eventfd so a blocked
/// `epoll_wait` returns.
#[derive(Clone)]
pub struct ReactorHandle {
    stop: Arc<AtomicBool>,
    wake_fd: Arc<OwnedFd>,
}

impl ReactorHandle {
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        let one: u64 = 1;
        unsafe {
            libc::write(
                self.wake_fd.as_raw_fd(),
                &one as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            );
        }
    }
}

pub struct Reactor<S> {
    epoll_fd: OwnedFd,
    wake_fd: Arc<OwnedFd>,
    stop: Arc<AtomicBool>,
    max_events: usize,
    handlers: HashMap<RawFd, Handler<S>>,
}

impl<S> Reactor<S> {
    pub fn new(max_events: usize) -> Result<Self> {
        let epoll_fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epoll_fd < 0 {
            return Err(ChatError::Reactor(io::Error::last_os_error()));
        }
        let epoll_fd = unsafe { OwnedFd::from_raw_fd(epoll_fd) };

        let wake_fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
        if wake_fd < 0 {
            return Err(ChatError::Reactor(io::Error::last_os_error()));
        }
        let wake_fd = Arc::new(unsafe { OwnedFd::from_raw_fd(wake_fd) });

        let reactor = Self {
            epoll_fd,
            wake_fd,
            stop: Arc::new(AtomicBool::new(false)),
            max_events: max_events.max(1),
            handlers: HashMap::new(),
        };
        reactor.register(reactor.wake_fd.as_raw_fd(), EventSet::READABLE)?;
        Ok(reactor)
    }

    /// Registers `handler` for `interest` on `fd`. Adding a descriptor that
    /// is already registered replaces its handler and interest.
    pub fn add<H>(&mut self, fd: RawFd, interest: EventSet, handler: H) -> Result<()>
    where
        H: FnMut(&mut S, EventSet, &mut Scope<S>) -> Result<()> + Send + 'static,
    {
        self.insert(fd, interest, Box::new(handler))
    }

    /// Deregisters `fd`; no further events are delivered for it.
    pub fn del(&mut self, fd: RawFd) -> Result<()> {
        self.handlers.remove(&fd);
        let ret = unsafe {
            libc::epoll_ctl(
                self.epoll_fd.as_raw_fd(),
                libc::EPOLL_CTL_DEL,
                fd,
                ptr::null_mut(),
            )
        };
        if ret < 0 {
            let err = io::Error::last_os_error();
            // A descriptor that was closed in the meantime has already left
            // the epoll set on its own.
            match err.raw_os_error() {
                Some(libc::ENOENT) | Some(libc::EBADF) => {}
                _ => return Err(ChatError::Reactor(err)),
            }
        }
        Ok(())
    }

    pub fn handle(&self) -> ReactorHandle {
        ReactorHandle {
            stop: Arc::clone(&self.stop),
            wake_fd: Arc::clone(&self.wake_fd),
        }
    }

    /// Blocks dispatching events until [`ReactorHandle::stop`] is called or
    /// a handler fails. The loop exits after finishing the current batch.
    pub fn run(&mut self, state: &mut S) -> Result<()> {
        let mut events = self.event_buffer();
        while !self.stop.load(Ordering::SeqCst) {
            self.turn(state, -1, &mut events)?;
        }
        Ok(())
    }

    fn event_buffer(&self) -> Vec<libc::epoll_event> {
        (0..self.max_events)
            .map(|_| libc::epoll_event { events: 0, u64: 0 })
            .collect()
    }

    // One epoll_wait plus dispatch of everything it returned.
    fn turn(
        &mut self,
        state: &mut S,
        timeout_ms: i32,
        events: &mut [libc::epoll_event],
    ) -> Result<()> {
        let n = unsafe {
            libc::epoll_wait(
                self.epoll_fd.as_raw_fd(),
                events.as_mut_ptr(),
                events.len() as i32,
                timeout_ms,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(ChatError::Reactor(err));
        }

        for event in &events[..n as usize] {
            let fd = event.u64 as RawFd;
            if fd == self.wake_fd.as_raw_fd() {
                self.drain_wake();
                continue;
            }

            let mut scope = Scope::new();
            if let Some(handler) = self.handlers.get_mut(&fd) {
                handler(state, EventSet::from_bits(event.events), &mut scope)?;
            }
            self.apply(scope)?;
        }
        Ok(())
    }

    fn apply(&mut self, scope: Scope<S>) -> Result<()> {
        for op in scope.ops {
            match op {
                Op::Add {
                    fd,
                    interest,
                    handler,
                } => self.insert(fd, interest, handler)?,
                Op::Del { fd } => self.del(fd)?,
            }
        }
        Ok(())
    }

    fn insert(&mut self, fd: RawFd, interest: EventSet, handler: Handler<S>) -> Result<()> {
        match self.ctl(libc::EPOLL_CTL_ADD, fd, interest) {
            Ok(()) => {}
            Err(err) if err.raw_os_error() == Some(libc::EEXIST) => {
                self.ctl(libc::EPOLL_CTL_MOD, fd, interest)
                    .map_err(ChatError::Reactor)?;
            }
            Err(err) => return Err(ChatError::Reactor(err)),
        }
        self.handlers.insert(fd, handler);
        Ok(())
    }

    fn register(&self, fd: RawFd, interest: EventSet) -> Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, interest)
            .map_err(ChatError::Reactor)
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, interest: EventSet) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: interest.bits(),
            u64: fd as u64,
        };
        let ret = unsafe { libc::epoll_ctl(self.epoll_fd.as_raw_fd(), op, fd, &mut event) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn drain_wake(&self) {
        let mut token: u64 = 0;
        unsafe {
            libc::read(
                self.wake_fd.as_raw_fd(),
                &mut token as *mut u64 as *mut libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
    }
}
