//! Test utilities for the transfer engine
//!
//! Provides an in-memory transfer library and device so the engine and the
//! event source can be driven without USB hardware.
//!
//! # Example
//!
//! ```
//! use common::EndpointKey;
//! use engine::Interface;
//! use engine::test_utils::{MockDevice, MockLibrary};
//! use std::rc::Rc;
//!
//! let library = Rc::new(MockLibrary::new());
//! let interface = Interface::open(library.clone(), Rc::new(MockDevice::new()), 0, false).unwrap();
//! interface.submit_read(1, 8, |done| done.data().len() == 8).unwrap();
//!
//! let key = EndpointKey::input(1).unwrap();
//! library.complete_read(key, &[0; 8]).unwrap();
//! assert_eq!(library.submissions(key), 2);
//! ```

use crate::claim::ClaimInterface;
use crate::library::{
    CompletionEvent, CompletionTarget, EventLibrary, PollInterest, PollfdNotifier, RawTransfer,
    TransferLibrary,
};
use common::{CompletionStatus, EndpointKey, Error, IntegrityError, Result};
use nix::poll::PollFlags;
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet, VecDeque};
use std::os::fd::RawFd;
use std::rc::{Rc, Weak};
use std::time::Duration;

#[derive(Default)]
struct Counters {
    allocated: Cell<usize>,
    freed: Cell<usize>,
    cancelled: Cell<usize>,
}

/// Transfer allocated by [`MockLibrary`]
pub struct MockTransfer {
    endpoint: EndpointKey,
    buffer: Rc<RefCell<Vec<u8>>>,
    target: CompletionTarget,
    counters: Rc<Counters>,
}

impl RawTransfer for MockTransfer {
    fn with_buffer<R>(&mut self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        f(&mut self.buffer.borrow_mut())
    }
}

impl Drop for MockTransfer {
    fn drop(&mut self) {
        self.counters.freed.set(self.counters.freed.get() + 1);
    }
}

struct InFlight {
    buffer: Rc<RefCell<Vec<u8>>>,
    target: CompletionTarget,
}

/// In-memory transfer library
///
/// Submitted transfers stay in flight until the test completes them with
/// [`MockLibrary::complete_read`] / [`MockLibrary::complete_write`] or queues
/// a completion for the next [`EventLibrary::handle_events`].
#[derive(Default)]
pub struct MockLibrary {
    counters: Rc<Counters>,
    in_flight: RefCell<HashMap<EndpointKey, InFlight>>,
    submissions: RefCell<Vec<(EndpointKey, Vec<u8>)>>,
    submit_error: Cell<Option<rusb::Error>>,
    queued: RefCell<VecDeque<(EndpointKey, CompletionStatus, Vec<u8>)>>,
    pollfds: RefCell<Vec<PollInterest>>,
    notifier: RefCell<Option<Weak<dyn PollfdNotifier>>>,
    next_timeout: Cell<Option<Duration>>,
    timeout_error: Cell<bool>,
    handle_events_calls: Cell<usize>,
}

impl MockLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next submission (or resubmission) fail with `error`.
    pub fn fail_next_submit(&self, error: rusb::Error) {
        self.submit_error.set(Some(error));
    }

    /// Complete the in-flight read on `endpoint` with `data`.
    ///
    /// Returns whatever the engine's completion path returned.
    pub fn complete_read(&self, endpoint: EndpointKey, data: &[u8]) -> Result<()> {
        self.complete(endpoint, CompletionStatus::Completed, data)
    }

    /// Complete the in-flight write on `endpoint` in full.
    pub fn complete_write(&self, endpoint: EndpointKey) -> Result<()> {
        let length = self
            .in_flight
            .borrow()
            .get(&endpoint)
            .map(|transfer| transfer.buffer.borrow().len())
            .ok_or(IntegrityError::EndpointNotFound(endpoint))?;
        self.complete_with_length(endpoint, CompletionStatus::Completed, length)
    }

    /// Complete the in-flight transfer on `endpoint` with `status`, copying
    /// `data` into its buffer first.
    pub fn complete(&self, endpoint: EndpointKey, status: CompletionStatus, data: &[u8]) -> Result<()> {
        let length = {
            let in_flight = self.in_flight.borrow();
            let transfer = in_flight
                .get(&endpoint)
                .ok_or(IntegrityError::EndpointNotFound(endpoint))?;
            let mut buffer = transfer.buffer.borrow_mut();
            let length = data.len().min(buffer.len());
            buffer[..length].copy_from_slice(&data[..length]);
            length
        };
        self.complete_with_length(endpoint, status, length)
    }

    fn complete_with_length(
        &self,
        endpoint: EndpointKey,
        status: CompletionStatus,
        actual_length: usize,
    ) -> Result<()> {
        let transfer = self
            .in_flight
            .borrow_mut()
            .remove(&endpoint)
            .ok_or(IntegrityError::EndpointNotFound(endpoint))?;
        transfer.target.complete(CompletionEvent {
            status,
            actual_length,
        })
    }

    /// Queue a completion for the next `handle_events` call.
    pub fn queue_completion(&self, endpoint: EndpointKey, status: CompletionStatus, data: &[u8]) {
        self.queued
            .borrow_mut()
            .push_back((endpoint, status, data.to_vec()));
    }

    /// Completion target of the in-flight transfer on `endpoint`
    pub fn target(&self, endpoint: EndpointKey) -> Option<CompletionTarget> {
        self.in_flight
            .borrow()
            .get(&endpoint)
            .map(|transfer| transfer.target.clone())
    }

    pub fn is_in_flight(&self, endpoint: EndpointKey) -> bool {
        self.in_flight.borrow().contains_key(&endpoint)
    }

    /// Number of submissions (including resubmissions) on `endpoint`
    pub fn submissions(&self, endpoint: EndpointKey) -> usize {
        self.submissions
            .borrow()
            .iter()
            .filter(|(key, _)| *key == endpoint)
            .count()
    }

    /// Buffer contents at each submission on `endpoint`
    pub fn submitted_data(&self, endpoint: EndpointKey) -> Vec<Vec<u8>> {
        self.submissions
            .borrow()
            .iter()
            .filter(|(key, _)| *key == endpoint)
            .map(|(_, data)| data.clone())
            .collect()
    }

    pub fn allocated(&self) -> usize {
        self.counters.allocated.get()
    }

    pub fn freed(&self) -> usize {
        self.counters.freed.get()
    }

    pub fn cancelled(&self) -> usize {
        self.counters.cancelled.get()
    }

    /// Add `fd` to the interest set and notify.
    pub fn add_pollfd(&self, fd: RawFd, events: PollFlags) {
        self.pollfds.borrow_mut().push(PollInterest { fd, events });
        if let Some(notifier) = self.notifier() {
            notifier.pollfd_added(fd, events);
        }
    }

    /// Remove `fd` from the interest set and notify, whether or not it was
    /// in the set.
    pub fn remove_pollfd(&self, fd: RawFd) {
        {
            let mut pollfds = self.pollfds.borrow_mut();
            if let Some(index) = pollfds.iter().rposition(|p| p.fd == fd) {
                pollfds.remove(index);
            }
        }
        if let Some(notifier) = self.notifier() {
            notifier.pollfd_removed(fd);
        }
    }

    pub fn has_notifier(&self) -> bool {
        self.notifier.borrow().is_some()
    }

    pub fn set_next_timeout(&self, timeout: Option<Duration>) {
        self.next_timeout.set(timeout);
    }

    /// Make the next timeout query fail.
    pub fn fail_next_timeout(&self) {
        self.timeout_error.set(true);
    }

    pub fn handle_events_calls(&self) -> usize {
        self.handle_events_calls.get()
    }

    fn notifier(&self) -> Option<Rc<dyn PollfdNotifier>> {
        self.notifier.borrow().as_ref()?.upgrade()
    }
}

impl TransferLibrary for MockLibrary {
    type Device = MockDevice;
    type Transfer = MockTransfer;

    fn alloc_transfer(
        &self,
        _device: &Rc<MockDevice>,
        endpoint: EndpointKey,
        buffer: Vec<u8>,
        target: CompletionTarget,
    ) -> std::result::Result<MockTransfer, rusb::Error> {
        self.counters
            .allocated
            .set(self.counters.allocated.get() + 1);
        Ok(MockTransfer {
            endpoint,
            buffer: Rc::new(RefCell::new(buffer)),
            target,
            counters: self.counters.clone(),
        })
    }

    fn submit(&self, transfer: &mut MockTransfer) -> std::result::Result<(), rusb::Error> {
        if let Some(error) = self.submit_error.take() {
            return Err(error);
        }
        self.submissions
            .borrow_mut()
            .push((transfer.endpoint, transfer.buffer.borrow().clone()));
        self.in_flight.borrow_mut().insert(
            transfer.endpoint,
            InFlight {
                buffer: transfer.buffer.clone(),
                target: transfer.target.clone(),
            },
        );
        Ok(())
    }

    fn cancel(&self, transfer: &mut MockTransfer) {
        self.counters
            .cancelled
            .set(self.counters.cancelled.get() + 1);
        self.in_flight.borrow_mut().remove(&transfer.endpoint);
    }
}

impl EventLibrary for MockLibrary {
    fn pollfds(&self) -> Vec<PollInterest> {
        self.pollfds.borrow().clone()
    }

    fn set_pollfd_notifier(&self, notifier: Option<Weak<dyn PollfdNotifier>>) {
        *self.notifier.borrow_mut() = notifier;
    }

    fn next_timeout(&self) -> Result<Option<Duration>> {
        if self.timeout_error.replace(false) {
            return Err(Error::TimeoutQuery(rusb::Error::Other));
        }
        Ok(self.next_timeout.get())
    }

    fn handle_events(&self) -> Result<()> {
        self.handle_events_calls
            .set(self.handle_events_calls.get() + 1);

        let mut first_error = None;
        loop {
            let next = self.queued.borrow_mut().pop_front();
            let Some((endpoint, status, data)) = next else {
                break;
            };
            if let Err(e) = self.complete(endpoint, status, &data) {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

/// In-memory device for interface claim tests
#[derive(Default)]
pub struct MockDevice {
    busy: RefCell<HashSet<u8>>,
    claim_errors: HashMap<u8, rusb::Error>,
    detach_error: Option<rusb::Error>,
    release_error: Option<rusb::Error>,
    claimed: RefCell<Vec<u8>>,
    released: RefCell<Vec<u8>>,
    detach_calls: Cell<usize>,
}

impl MockDevice {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims of `interface` fail with `Busy` until a kernel driver detach.
    pub fn with_busy_interface(self, interface: u8) -> Self {
        self.busy.borrow_mut().insert(interface);
        self
    }

    pub fn with_detach_error(mut self, error: rusb::Error) -> Self {
        self.detach_error = Some(error);
        self
    }

    pub fn with_claim_error(mut self, interface: u8, error: rusb::Error) -> Self {
        self.claim_errors.insert(interface, error);
        self
    }

    pub fn with_release_error(mut self, error: rusb::Error) -> Self {
        self.release_error = Some(error);
        self
    }

    pub fn claimed(&self) -> Vec<u8> {
        self.claimed.borrow().clone()
    }

    pub fn released(&self) -> Vec<u8> {
        self.released.borrow().clone()
    }

    pub fn detach_calls(&self) -> usize {
        self.detach_calls.get()
    }
}

impl ClaimInterface for MockDevice {
    fn claim_interface(&self, interface: u8) -> rusb::Result<()> {
        if let Some(error) = self.claim_errors.get(&interface) {
            return Err(*error);
        }
        if self.busy.borrow().contains(&interface) {
            return Err(rusb::Error::Busy);
        }
        self.claimed.borrow_mut().push(interface);
        Ok(())
    }

    fn release_interface(&self, interface: u8) -> rusb::Result<()> {
        if let Some(error) = self.release_error {
            return Err(error);
        }
        self.claimed.borrow_mut().retain(|&i| i != interface);
        self.released.borrow_mut().push(interface);
        Ok(())
    }

    fn detach_kernel_driver(&self, interface: u8) -> rusb::Result<()> {
        self.detach_calls.set(self.detach_calls.get() + 1);
        if let Some(error) = self.detach_error {
            return Err(error);
        }
        self.busy.borrow_mut().remove(&interface);
        Ok(())
    }
}
