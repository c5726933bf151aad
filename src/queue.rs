//! Thread-safe FIFO whose depth is mirrored by an eventfd, so a poller can
//! treat "queue has data" like any other readiness event.

use std::collections::VecDeque;
use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

use crate::error::{ChatError, Result};

/// The eventfd runs in semaphore mode: every push adds one readable token,
/// every pop consumes one. At any quiescent moment the number of readable
/// tokens equals `len()`, which is what makes a level-triggered poller on
/// [`NotifyQueue::notify_fd`] immune to lost wake-ups.
pub struct NotifyQueue<T> {
    state: Mutex<State<T>>,
    available: Condvar,
    event_fd: OwnedFd,
}

struct State<T> {
    items: VecDeque<T>,
    closed: bool,
}

impl<T> NotifyQueue<T> {
    pub fn new() -> Result<Self> {
        let fd = unsafe {
            libc::eventfd(
                0,
                libc::EFD_SEMAPHORE | libc::EFD_CLOEXEC | libc::EFD_NONBLOCK,
            )
        };
        if fd < 0 {
            return Err(ChatError::Queue(io::Error::last_os_error()));
        }
        let event_fd = unsafe { OwnedFd::from_raw_fd(fd) };

        Ok(Self {
            state: Mutex::new(State {
                items: VecDeque::new(),
                closed: false,
            }),
            available: Condvar::new(),
            event_fd,
        })
    }

    /// Appends `item`, makes the notify fd readable, and wakes one blocked
    /// [`NotifyQueue::wait_pop`]. Pushes onto a closed queue are dropped.
    pub fn push(&self, item: T) {
        let mut state = self.lock();
        if state.closed {
            return;
        }
        state.items.push_back(item);
        self.add_token();
        drop(state);
        self.available.notify_one();
    }

    /// Removes and returns the head, consuming one notification token, or
    /// returns `None` when the queue is empty.
    pub fn try_pop(&self) -> Option<T> {
        let mut state = self.lock();
        let item = state.items.pop_front()?;
        self.consume_token();
        Some(item)
    }

    /// Blocks until an item is available and pops it. Returns `None` only
    /// after [`NotifyQueue::close`] once the queue has drained.
    pub fn wait_pop(&self) -> Option<T> {
        let mut state = self.lock();
        loop {
            if let Some(item) = state.items.pop_front() {
                self.consume_token();
                return Some(item);
            }
            if state.closed {
                return None;
            }
            state = self
                .available
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Marks the queue closed and wakes every blocked waiter. Items already
    /// queued can still be popped.
    pub fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        drop(state);
        self.available.notify_all();
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }

    /// Descriptor that is readable whenever at least one unconsumed item is
    /// queued. Intended to be registered with a readiness poller.
    pub fn notify_fd(&self) -> RawFd {
        self.event_fd.as_raw_fd()
    }

    fn lock(&self) -> MutexGuard<'_, State<T>> {
        // Queue state stays consistent even if a producer panicked while
        // holding the lock.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // Token bookkeeping happens under the state lock so the token count and
    // queue depth never diverge observably.
    fn add_token(&self) {
        let one: u64 = 1;
        let ret = unsafe {
            libc::write(
                self.event_fd.as_raw_fd(),
                &one as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        debug_assert_eq!(ret, std::mem::size_of::<u64>() as isize);
    }

    fn consume_token(&self) {
        let mut token: u64 = 0;
        unsafe {
            libc::read(
                self.event_fd.as_raw_fd(),
                &mut token as *mut u64 as *mut libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
    }
}
