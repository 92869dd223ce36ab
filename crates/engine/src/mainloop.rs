//! Cooperative single-threaded main loop
//!
//! Sources take part in every iteration in three phases:
//!
//! 1. `prepare` returns how long the source is willing to let the loop block
//! 2. the loop polls every registered [`PollEntry`] for at most the smallest
//!    of those timeouts, then writes the signaled events back into each entry
//! 3. `check` decides whether the source is ready, and ready sources get
//!    `dispatch`
//!
//! Poll entries are shared (`Rc`) between a source and the loop, so the source
//! reads readiness directly from the entries it registered.

use common::Result;
use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use slab::Slab;
use std::cell::{Cell, RefCell};
use std::ops::ControlFlow;
use std::os::fd::{BorrowedFd, RawFd};
use std::rc::{Rc, Weak};
use tracing::{debug, trace, warn};

/// How long a source lets the loop block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    Infinite,
    Millis(u64),
}

impl Timeout {
    fn min(self, other: Timeout) -> Timeout {
        match (self, other) {
            (Timeout::Infinite, t) | (t, Timeout::Infinite) => t,
            (Timeout::Millis(a), Timeout::Millis(b)) => Timeout::Millis(a.min(b)),
        }
    }

    fn to_poll_timeout(self) -> PollTimeout {
        match self {
            Timeout::Infinite => PollTimeout::NONE,
            Timeout::Millis(ms) => PollTimeout::try_from(ms).unwrap_or(PollTimeout::MAX),
        }
    }
}

/// One descriptor watched by the loop
#[derive(Debug)]
pub struct PollEntry {
    fd: RawFd,
    events: PollFlags,
    revents: Cell<PollFlags>,
}

impl PollEntry {
    pub fn new(fd: RawFd, events: PollFlags) -> Self {
        Self {
            fd,
            events,
            revents: Cell::new(PollFlags::empty()),
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn events(&self) -> PollFlags {
        self.events
    }

    /// Events signaled by the most recent poll
    pub fn revents(&self) -> PollFlags {
        self.revents.get()
    }

    pub fn set_revents(&self, revents: PollFlags) {
        self.revents.set(revents);
    }
}

/// A participant in the main loop
pub trait Source {
    fn prepare(&self) -> Timeout;

    fn check(&self) -> bool;

    /// `ControlFlow::Break` removes the source from the loop.
    fn dispatch(&self) -> Result<ControlFlow<()>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourceId(usize);

struct SourceEntry {
    source: Rc<dyn Source>,
    polls: Vec<Rc<PollEntry>>,
}

#[derive(Default)]
struct LoopInner {
    sources: RefCell<Slab<SourceEntry>>,
}

impl LoopInner {
    fn add_source(&self, source: Rc<dyn Source>) -> SourceId {
        let id = SourceId(self.sources.borrow_mut().insert(SourceEntry {
            source,
            polls: Vec::new(),
        }));
        debug!("Added source {:?}", id);
        id
    }
}

pub struct MainLoop {
    inner: Rc<LoopInner>,
}

/// Non-owning handle for registering with a [`MainLoop`]
///
/// Every operation is a no-op once the loop is gone.
#[derive(Clone)]
pub struct LoopHandle {
    inner: Weak<LoopInner>,
}

impl MainLoop {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(LoopInner::default()),
        }
    }

    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            inner: Rc::downgrade(&self.inner),
        }
    }

    pub fn add_source(&self, source: Rc<dyn Source>) -> SourceId {
        self.inner.add_source(source)
    }

    pub fn source_count(&self) -> usize {
        self.inner.sources.borrow().len()
    }

    /// Run one prepare/poll/check/dispatch cycle.
    ///
    /// With `may_block` false the poll returns immediately. Returns whether
    /// any source was dispatched. The first dispatch error stops the
    /// iteration and is returned.
    pub fn iteration(&self, may_block: bool) -> Result<bool> {
        // sources may add or remove entries while being called
        let snapshot: Vec<(SourceId, Rc<dyn Source>, Vec<Rc<PollEntry>>)> = self
            .inner
            .sources
            .borrow()
            .iter()
            .map(|(key, entry)| (SourceId(key), entry.source.clone(), entry.polls.clone()))
            .collect();

        let mut timeout = if may_block {
            Timeout::Infinite
        } else {
            Timeout::Millis(0)
        };
        for (_, source, _) in &snapshot {
            timeout = timeout.min(source.prepare());
        }

        let entries: Vec<&Rc<PollEntry>> = snapshot.iter().flat_map(|(_, _, polls)| polls).collect();
        for entry in &entries {
            entry.set_revents(PollFlags::empty());
        }

        // SAFETY: registered descriptors stay open while registered; their
        // owner removes them from the loop before closing them
        let mut fds: Vec<PollFd<'_>> = entries
            .iter()
            .map(|entry| PollFd::new(unsafe { BorrowedFd::borrow_raw(entry.fd) }, entry.events))
            .collect();

        trace!("Polling {} descriptors, timeout {:?}", fds.len(), timeout);
        match poll(&mut fds, timeout.to_poll_timeout()) {
            Ok(_) => {}
            Err(Errno::EINTR) => {
                trace!("Poll interrupted");
                return Ok(false);
            }
            Err(e) => return Err(std::io::Error::from(e).into()),
        }

        for (entry, fd) in entries.iter().zip(&fds) {
            entry.set_revents(fd.revents().unwrap_or(PollFlags::empty()));
        }

        let mut dispatched = false;
        for (id, source, _) in &snapshot {
            // an earlier dispatch may have removed it
            let registered = self.inner.sources.borrow().contains(id.0);
            if !registered || !source.check() {
                continue;
            }
            dispatched = true;
            if source.dispatch()?.is_break() {
                self.handle().remove_source(*id);
            }
        }

        Ok(dispatched)
    }

    /// Iterate until `done` returns true.
    pub fn run_until(&self, mut done: impl FnMut() -> bool) -> Result<()> {
        while !done() {
            self.iteration(true)?;
        }
        Ok(())
    }
}

impl Default for MainLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopHandle {
    /// Remove a source together with its poll entries.
    pub fn remove_source(&self, id: SourceId) -> bool {
        let Some(inner) = self.inner.upgrade() else {
            return false;
        };
        let removed = inner.sources.borrow_mut().try_remove(id.0);
        if removed.is_some() {
            debug!("Removed source {:?}", id);
        }
        removed.is_some()
    }

    pub fn add_poll(&self, id: SourceId, entry: Rc<PollEntry>) -> bool {
        let Some(inner) = self.inner.upgrade() else {
            return false;
        };
        let mut sources = inner.sources.borrow_mut();
        match sources.get_mut(id.0) {
            Some(source) => {
                trace!("Watching fd {} for {:?}", entry.fd, entry.events);
                source.polls.push(entry);
                true
            }
            None => {
                warn!("Adding fd {} to unknown source {:?}", entry.fd, id);
                false
            }
        }
    }

    /// Remove `entry` (matched by identity, not by descriptor).
    pub fn remove_poll(&self, id: SourceId, entry: &Rc<PollEntry>) -> bool {
        let Some(inner) = self.inner.upgrade() else {
            return false;
        };
        let mut sources = inner.sources.borrow_mut();
        let Some(source) = sources.get_mut(id.0) else {
            return false;
        };
        match source.polls.iter().position(|p| Rc::ptr_eq(p, entry)) {
            Some(index) => {
                source.polls.remove(index);
                trace!("Stopped watching fd {}", entry.fd);
                true
            }
            None => false,
        }
    }

    pub fn is_alive(&self) -> bool {
        self.inner.strong_count() > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;

    struct Counter {
        timeout: Timeout,
        polls: RefCell<Vec<Rc<PollEntry>>>,
        dispatches: Cell<usize>,
        stop_after: usize,
    }

    impl Counter {
        fn new(timeout: Timeout, stop_after: usize) -> Rc<Self> {
            Rc::new(Self {
                timeout,
                polls: RefCell::new(Vec::new()),
                dispatches: Cell::new(0),
                stop_after,
            })
        }
    }

    impl Source for Counter {
        fn prepare(&self) -> Timeout {
            self.timeout
        }

        fn check(&self) -> bool {
            self.polls.borrow().iter().any(|p| !p.revents().is_empty())
        }

        fn dispatch(&self) -> Result<ControlFlow<()>> {
            self.dispatches.set(self.dispatches.get() + 1);
            if self.dispatches.get() >= self.stop_after {
                Ok(ControlFlow::Break(()))
            } else {
                Ok(ControlFlow::Continue(()))
            }
        }
    }

    #[test]
    fn test_timeout_min() {
        assert_eq!(Timeout::Infinite.min(Timeout::Millis(5)), Timeout::Millis(5));
        assert_eq!(Timeout::Millis(7).min(Timeout::Infinite), Timeout::Millis(7));
        assert_eq!(Timeout::Millis(7).min(Timeout::Millis(3)), Timeout::Millis(3));
        assert_eq!(Timeout::Infinite.min(Timeout::Infinite), Timeout::Infinite);
    }

    #[test]
    fn test_idle_source_not_dispatched() {
        let main_loop = MainLoop::new();
        let source = Counter::new(Timeout::Millis(0), usize::MAX);
        main_loop.add_source(source.clone());

        assert!(!main_loop.iteration(true).unwrap());
        assert_eq!(source.dispatches.get(), 0);
    }

    #[test]
    fn test_readable_fd_dispatches_until_break() {
        let (mut tx, rx) = UnixStream::pair().unwrap();
        let main_loop = MainLoop::new();
        let handle = main_loop.handle();
        let source = Counter::new(Timeout::Infinite, 2);
        let id = main_loop.add_source(source.clone());

        let entry = Rc::new(PollEntry::new(rx.as_raw_fd(), PollFlags::POLLIN));
        source.polls.borrow_mut().push(entry.clone());
        assert!(handle.add_poll(id, entry.clone()));

        tx.write_all(b"x").unwrap();
        assert!(main_loop.iteration(true).unwrap());
        assert!(entry.revents().contains(PollFlags::POLLIN));
        assert_eq!(main_loop.source_count(), 1);

        assert!(main_loop.iteration(true).unwrap());
        assert_eq!(source.dispatches.get(), 2);
        assert_eq!(main_loop.source_count(), 0);
    }

    #[test]
    fn test_remove_poll_by_identity() {
        let (_tx, rx) = UnixStream::pair().unwrap();
        let main_loop = MainLoop::new();
        let handle = main_loop.handle();
        let id = main_loop.add_source(Counter::new(Timeout::Infinite, 1));

        let first = Rc::new(PollEntry::new(rx.as_raw_fd(), PollFlags::POLLIN));
        let second = Rc::new(PollEntry::new(rx.as_raw_fd(), PollFlags::POLLIN));
        handle.add_poll(id, first.clone());
        handle.add_poll(id, second.clone());

        assert!(handle.remove_poll(id, &second));
        assert!(!handle.remove_poll(id, &second));
        assert!(handle.remove_poll(id, &first));
    }

    #[test]
    fn test_handle_outlives_loop() {
        let main_loop = MainLoop::new();
        let handle = main_loop.handle();
        let id = main_loop.add_source(Counter::new(Timeout::Infinite, 1));
        drop(main_loop);

        assert!(!handle.is_alive());
        assert!(!handle.remove_source(id));
    }
}
