//! Event source bridging the transfer library into a [`MainLoop`]
//!
//! The library publishes a set of descriptors it wants polled and a deadline
//! for its next internal timeout. [`UsbSource`] keeps an exact mirror of that
//! descriptor set (updated through the library's add/remove notifications),
//! feeds the deadline into the loop's prepare phase, and runs the library's
//! non-blocking event processing whenever a mirrored descriptor is signaled.

use crate::library::{EventLibrary, PollfdNotifier};
use crate::mainloop::{LoopHandle, MainLoop, PollEntry, Source, SourceId, Timeout};
use common::{IntegrityError, Result};
use nix::poll::PollFlags;
use std::cell::RefCell;
use std::ops::ControlFlow;
use std::os::fd::RawFd;
use std::rc::{Rc, Weak};
use std::time::Duration;
use tracing::{debug, error, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceState {
    Unattached,
    Attached,
    /// The loop the source was attached to is gone
    Released,
}

struct Attachment {
    handle: LoopHandle,
    id: SourceId,
}

struct SourceInner<L: EventLibrary> {
    library: Rc<L>,
    pollfds: RefCell<Vec<Rc<PollEntry>>>,
    attachment: RefCell<Option<Attachment>>,
    /// Integrity violation raised inside a notification, reported by the
    /// next dispatch
    pending_error: RefCell<Option<IntegrityError>>,
}

/// USB event source
///
/// Dropping it uninstalls the library notifications and removes it (and
/// every mirrored descriptor) from the loop.
pub struct UsbSource<L: EventLibrary> {
    inner: Rc<SourceInner<L>>,
}

impl<L: EventLibrary> UsbSource<L> {
    pub fn new(library: Rc<L>) -> Self {
        let pollfds: Vec<Rc<PollEntry>> = library
            .pollfds()
            .into_iter()
            .map(|interest| Rc::new(PollEntry::new(interest.fd, interest.events)))
            .collect();
        debug!("USB event source watching {} descriptors", pollfds.len());

        let inner = Rc::new(SourceInner {
            library,
            pollfds: RefCell::new(pollfds),
            attachment: RefCell::new(None),
            pending_error: RefCell::new(None),
        });

        let weak: Weak<SourceInner<L>> = Rc::downgrade(&inner);
        let notifier: Weak<dyn PollfdNotifier> = weak;
        inner.library.set_pollfd_notifier(Some(notifier));

        Self { inner }
    }

    /// Register with `main_loop`. A source attaches at most once.
    pub fn attach(&self, main_loop: &MainLoop) -> Result<()> {
        if self.inner.attachment.borrow().is_some() {
            return Err(IntegrityError::AlreadyAttached.into());
        }

        let handle = main_loop.handle();
        let source: Rc<dyn Source> = self.inner.clone();
        let id = main_loop.add_source(source);
        for entry in self.inner.pollfds.borrow().iter() {
            handle.add_poll(id, entry.clone());
        }

        *self.inner.attachment.borrow_mut() = Some(Attachment { handle, id });
        debug!("USB event source attached as {:?}", id);
        Ok(())
    }

    pub fn state(&self) -> SourceState {
        match self.inner.attachment.borrow().as_ref() {
            None => SourceState::Unattached,
            Some(attachment) if attachment.handle.is_alive() => SourceState::Attached,
            Some(_) => SourceState::Released,
        }
    }

    /// Number of mirrored descriptors
    pub fn pollfd_count(&self) -> usize {
        self.inner.pollfds.borrow().len()
    }

    /// Mirrored descriptors, in the order they were added
    pub fn pollfds(&self) -> Vec<(RawFd, PollFlags)> {
        self.inner
            .pollfds
            .borrow()
            .iter()
            .map(|entry| (entry.fd(), entry.events()))
            .collect()
    }
}

impl<L: EventLibrary> Drop for UsbSource<L> {
    fn drop(&mut self) {
        self.inner.library.set_pollfd_notifier(None);
        if let Some(attachment) = self.inner.attachment.borrow_mut().take() {
            attachment.handle.remove_source(attachment.id);
        }
        debug!("USB event source released");
    }
}

impl<L: EventLibrary> PollfdNotifier for SourceInner<L> {
    fn pollfd_added(&self, fd: RawFd, events: PollFlags) {
        let entry = Rc::new(PollEntry::new(fd, events));
        if let Some(attachment) = self.attachment.borrow().as_ref() {
            attachment.handle.add_poll(attachment.id, entry.clone());
        }
        self.pollfds.borrow_mut().push(entry);
        trace!("Library added fd {} ({:?})", fd, events);
    }

    fn pollfd_removed(&self, fd: RawFd) {
        let removed = {
            let mut pollfds = self.pollfds.borrow_mut();
            pollfds
                .iter()
                .rposition(|entry| entry.fd() == fd)
                .map(|index| pollfds.remove(index))
        };

        match removed {
            Some(entry) => {
                if let Some(attachment) = self.attachment.borrow().as_ref() {
                    attachment.handle.remove_poll(attachment.id, &entry);
                }
                trace!("Library removed fd {}", fd);
            }
            None => {
                error!("Library removed fd {} which was never added", fd);
                let mut pending = self.pending_error.borrow_mut();
                if pending.is_none() {
                    *pending = Some(IntegrityError::UnknownDescriptor(fd));
                }
            }
        }
    }
}

impl<L: EventLibrary> Source for SourceInner<L> {
    fn prepare(&self) -> Timeout {
        match self.library.next_timeout() {
            Ok(None) => Timeout::Infinite,
            Ok(Some(timeout)) => Timeout::Millis(duration_to_millis(timeout)),
            Err(e) => {
                warn!("{}, blocking without a deadline", e);
                Timeout::Infinite
            }
        }
    }

    fn check(&self) -> bool {
        self.pending_error.borrow().is_some()
            || self
                .pollfds
                .borrow()
                .iter()
                .any(|entry| !entry.revents().is_empty())
    }

    fn dispatch(&self) -> Result<ControlFlow<()>> {
        self.library.handle_events()?;

        let pending = self.pending_error.borrow_mut().take();
        match pending {
            Some(err) => Err(err.into()),
            None => Ok(ControlFlow::Continue(())),
        }
    }
}

/// Milliseconds rounded up, saturating
///
/// A deadline less than a millisecond away must still block until it has
/// passed instead of polling with a zero timeout.
fn duration_to_millis(duration: Duration) -> u64 {
    let millis = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
    if duration.subsec_nanos() % 1_000_000 != 0 {
        millis.saturating_add(1)
    } else {
        millis
    }
}
