//! Transfer library surface
//!
//! The engine and the event source never talk to libusb directly. They go
//! through the two traits here, which the libusb backend
//! ([`crate::libusb::Libusb`]) and the test mock
//! ([`crate::test_utils::MockLibrary`]) implement.
//!
//! Completion is delivered out-of-band: the library holds a
//! [`CompletionTarget`] for every in-flight transfer and calls
//! [`CompletionTarget::complete`] from inside its event processing.

use crate::claim::ClaimInterface;
use common::{CompletionStatus, EndpointKey, Error, Result};
use nix::poll::PollFlags;
use std::os::fd::RawFd;
use std::rc::{Rc, Weak};
use std::time::Duration;
use tracing::debug;

/// What the library reports for one finished operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletionEvent {
    pub status: CompletionStatus,
    pub actual_length: usize,
}

/// Receiver side of a completion, implemented by the transfer engine
pub(crate) trait CompletionHandler {
    fn on_complete(&self, endpoint: EndpointKey, event: CompletionEvent) -> Result<()>;
}

/// Completion record owned by an in-flight transfer's native user data.
///
/// Holds only a weak reference to the engine, so a transfer outliving its
/// interface completes into nothing.
#[derive(Clone)]
pub struct CompletionTarget {
    handler: Weak<dyn CompletionHandler>,
    endpoint: EndpointKey,
}

impl CompletionTarget {
    pub(crate) fn new(handler: Weak<dyn CompletionHandler>, endpoint: EndpointKey) -> Self {
        Self { handler, endpoint }
    }

    pub fn endpoint(&self) -> EndpointKey {
        self.endpoint
    }

    /// Deliver a completion to the owning engine.
    ///
    /// Errors are resubmission failures (or a panicking user callback) and
    /// must be propagated by the caller, not dropped.
    pub fn complete(&self, event: CompletionEvent) -> Result<()> {
        match self.handler.upgrade() {
            Some(handler) => handler.on_complete(self.endpoint, event),
            None => {
                debug!("Completion on {} after interface was closed", self.endpoint);
                Ok(())
            }
        }
    }
}

/// Native transfer object
///
/// Dropping it frees the transfer and its buffer. If the transfer is still
/// in flight, the library must defer the free until it has reported the
/// (cancelled) completion.
pub trait RawTransfer {
    /// Access the transfer buffer. Only valid while not in flight.
    fn with_buffer<R>(&mut self, f: impl FnOnce(&mut [u8]) -> R) -> R;
}

/// Submission and cancellation of single non-blocking operations
pub trait TransferLibrary: 'static {
    /// Device handle transfers are bound to
    type Device: ClaimInterface + 'static;

    type Transfer: RawTransfer + 'static;

    /// Allocate a transfer bound to `endpoint` that owns `buffer`.
    ///
    /// The transfer has no per-operation deadline.
    fn alloc_transfer(
        &self,
        device: &Rc<Self::Device>,
        endpoint: EndpointKey,
        buffer: Vec<u8>,
        target: CompletionTarget,
    ) -> std::result::Result<Self::Transfer, rusb::Error>;

    /// Hand the transfer to the library. Returns immediately.
    fn submit(&self, transfer: &mut Self::Transfer) -> std::result::Result<(), rusb::Error>;

    /// Request cancellation. Failures are logged, never returned.
    fn cancel(&self, transfer: &mut Self::Transfer);
}

/// One descriptor the library wants monitored
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollInterest {
    pub fd: RawFd,
    pub events: PollFlags,
}

/// Receiver of interest-set change notifications
pub trait PollfdNotifier {
    fn pollfd_added(&self, fd: RawFd, events: PollFlags);
    fn pollfd_removed(&self, fd: RawFd);
}

/// Readiness-driven event processing side of the library
pub trait EventLibrary: 'static {
    /// Current interest set
    fn pollfds(&self) -> Vec<PollInterest>;

    /// Install (or with `None`, clear) the interest-change notifier.
    fn set_pollfd_notifier(&self, notifier: Option<Weak<dyn PollfdNotifier>>);

    /// Time until the library's next internal timeout, `None` if there is
    /// nothing pending.
    fn next_timeout(&self) -> Result<Option<Duration>>;

    /// Process pending events without blocking. May run any number of
    /// completion callbacks; the first error any of them produced is
    /// returned after all have run.
    fn handle_events(&self) -> Result<()>;
}

/// Collects completion-path errors raised inside library callbacks until
/// event processing returns.
#[derive(Default)]
pub(crate) struct ErrorSink {
    errors: std::cell::RefCell<Vec<Error>>,
}

impl ErrorSink {
    pub(crate) fn push(&self, err: Error) {
        self.errors.borrow_mut().push(err);
    }

    /// Take the first collected error; the rest are logged.
    pub(crate) fn take(&self) -> Result<()> {
        let mut errors = std::mem::take(&mut *self.errors.borrow_mut()).into_iter();
        match errors.next() {
            None => Ok(()),
            Some(first) => {
                for other in errors {
                    tracing::error!("Additional completion error: {}", other);
                }
                Err(first)
            }
        }
    }
}
