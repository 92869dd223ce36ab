//! Transfer engine for one claimed interface
//!
//! Every open interface keeps a registry from (endpoint, direction) to at
//! most one in-flight transfer. Transfers are created by `submit_*`, driven
//! by completion callbacks (which decide between resubmission and teardown),
//! and destroyed by `cancel_*` or when the interface is dropped.
//!
//! While a completion callback runs, its transfer is checked out of the
//! registry and the slot is marked as completing. The callback is therefore
//! free to call back into the interface (cancel its own endpoint, submit on
//! others) without any transfer being freed twice.

use crate::claim::{self, ClaimInterface};
use crate::library::{CompletionEvent, CompletionHandler, CompletionTarget, TransferLibrary};
use crate::transfer::{Completion, ReadCompletion, Transfer, WriteCompletion};
use common::{EndpointKey, Error, IntegrityError, Result, SubmitError, TransferStatus};
use std::cell::RefCell;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::rc::{Rc, Weak};
use tracing::{debug, error, trace, warn};

enum Slot<T> {
    Live(Transfer<T>),
    /// Transfer is checked out while its completion callback runs
    Completing,
    /// `cancel_*` was called from inside the running completion callback
    Cancelled,
}

struct Shared<L: TransferLibrary> {
    library: Rc<L>,
    device: Rc<L::Device>,
    number: u8,
    registry: RefCell<HashMap<EndpointKey, Slot<L::Transfer>>>,
}

/// A claimed interface and the transfers running on it
///
/// Dropping the interface cancels and frees every registered transfer, then
/// releases the claim.
pub struct Interface<L: TransferLibrary> {
    shared: Rc<Shared<L>>,
}

impl<L: TransferLibrary> Interface<L> {
    /// Claim `interface` on `device`.
    ///
    /// With `try_detach`, a busy interface gets one kernel-driver detach and
    /// a second claim attempt.
    pub fn open(library: Rc<L>, device: Rc<L::Device>, interface: u8, try_detach: bool) -> Result<Self> {
        claim::claim(&*device, interface, try_detach)?;

        Ok(Self {
            shared: Rc::new(Shared {
                library,
                device,
                number: interface,
                registry: RefCell::new(HashMap::new()),
            }),
        })
    }

    /// Interface number
    pub fn number(&self) -> u8 {
        self.shared.number
    }

    /// Start a read of `length` bytes on IN `endpoint`.
    ///
    /// `callback` gets the completion status and the received bytes.
    /// Returning `true` resubmits the same transfer for continuous streaming;
    /// `false` ends it.
    pub fn submit_read<F>(&self, endpoint: u8, length: usize, callback: F) -> Result<()>
    where
        F: FnMut(&ReadCompletion<'_>) -> bool + 'static,
    {
        let key = EndpointKey::input(endpoint).ok_or(IntegrityError::InvalidEndpoint(endpoint))?;
        self.submit(key, vec![0; length], Completion::Read(Box::new(callback)))
    }

    /// Start a write of `data` on OUT `endpoint`.
    ///
    /// `data` is copied; the caller keeps its buffer. Returning `true` from
    /// `callback` resubmits the (possibly refreshed) transfer buffer.
    pub fn submit_write<F>(&self, endpoint: u8, data: &[u8], callback: F) -> Result<()>
    where
        F: FnMut(&mut WriteCompletion<'_>) -> bool + 'static,
    {
        let key = EndpointKey::output(endpoint).ok_or(IntegrityError::InvalidEndpoint(endpoint))?;
        self.submit(key, data.to_vec(), Completion::Write(Box::new(callback)))
    }

    pub fn cancel_read(&self, endpoint: u8) -> Result<()> {
        let key = EndpointKey::input(endpoint).ok_or(IntegrityError::InvalidEndpoint(endpoint))?;
        self.cancel(key)
    }

    pub fn cancel_write(&self, endpoint: u8) -> Result<()> {
        let key = EndpointKey::output(endpoint).ok_or(IntegrityError::InvalidEndpoint(endpoint))?;
        self.cancel(key)
    }

    /// Number of endpoints with a live transfer
    pub fn active_transfers(&self) -> usize {
        self.shared
            .registry
            .borrow()
            .values()
            .filter(|slot| !matches!(slot, Slot::Cancelled))
            .count()
    }

    pub fn is_active(&self, endpoint: EndpointKey) -> bool {
        self.shared.is_occupied(endpoint)
    }

    pub fn transfer_status(&self, endpoint: EndpointKey) -> Option<TransferStatus> {
        match self.shared.registry.borrow().get(&endpoint)? {
            Slot::Live(transfer) => Some(transfer.status),
            Slot::Completing => Some(TransferStatus::Completed),
            Slot::Cancelled => Some(TransferStatus::Cancelled),
        }
    }

    fn submit(&self, endpoint: EndpointKey, buffer: Vec<u8>, completion: Completion) -> Result<()> {
        if self.shared.is_occupied(endpoint) {
            return Err(IntegrityError::EndpointBusy(endpoint).into());
        }

        let length = buffer.len();
        let weak: Weak<Shared<L>> = Rc::downgrade(&self.shared);
        let handler: Weak<dyn CompletionHandler> = weak;
        let target = CompletionTarget::new(handler, endpoint);

        let library = &self.shared.library;
        let mut raw = library
            .alloc_transfer(&self.shared.device, endpoint, buffer, target)
            .map_err(|source| SubmitError { endpoint, source })?;

        if let Err(source) = library.submit(&mut raw) {
            warn!("Failed to submit transfer on {}: {}", endpoint, source);
            drop(raw);
            return Err(SubmitError { endpoint, source }.into());
        }

        trace!("Submitted {} byte transfer on {}", length, endpoint);
        self.shared
            .registry
            .borrow_mut()
            .insert(endpoint, Slot::Live(Transfer::new(endpoint, raw, length, completion)));
        Ok(())
    }

    fn cancel(&self, endpoint: EndpointKey) -> Result<()> {
        let slot = self.shared.registry.borrow_mut().remove(&endpoint);
        match slot {
            Some(Slot::Live(mut transfer)) => {
                self.shared.library.cancel(&mut transfer.raw);
                drop(transfer);
                debug!("Cancelled transfer on {}", endpoint);
                Ok(())
            }
            Some(Slot::Completing) => {
                // freed by the completion path once the callback returns
                self.shared
                    .registry
                    .borrow_mut()
                    .insert(endpoint, Slot::Cancelled);
                debug!("Cancelled transfer on {} from its own callback", endpoint);
                Ok(())
            }
            Some(Slot::Cancelled) => {
                self.shared
                    .registry
                    .borrow_mut()
                    .insert(endpoint, Slot::Cancelled);
                Err(IntegrityError::EndpointNotFound(endpoint).into())
            }
            None => Err(IntegrityError::EndpointNotFound(endpoint).into()),
        }
    }
}

impl<L: TransferLibrary> Shared<L> {
    fn is_occupied(&self, endpoint: EndpointKey) -> bool {
        matches!(
            self.registry.borrow().get(&endpoint),
            Some(Slot::Live(_) | Slot::Completing)
        )
    }

    fn checkout(&self, endpoint: EndpointKey) -> Option<Transfer<L::Transfer>> {
        let mut registry = self.registry.borrow_mut();
        match registry.remove(&endpoint) {
            Some(Slot::Live(transfer)) => {
                registry.insert(endpoint, Slot::Completing);
                Some(transfer)
            }
            Some(other) => {
                registry.insert(endpoint, other);
                None
            }
            None => None,
        }
    }

    /// Clear the completing marker. Returns `false` if the transfer was
    /// cancelled while its callback ran.
    fn checkin(&self, endpoint: EndpointKey) -> bool {
        let mut registry = self.registry.borrow_mut();
        match registry.remove(&endpoint) {
            Some(Slot::Completing) => true,
            Some(Slot::Live(newer)) => {
                // cancelled and replaced from inside the callback
                registry.insert(endpoint, Slot::Live(newer));
                false
            }
            Some(Slot::Cancelled) | None => false,
        }
    }
}

impl<L: TransferLibrary> CompletionHandler for Shared<L> {
    fn on_complete(&self, endpoint: EndpointKey, event: CompletionEvent) -> Result<()> {
        let Some(mut transfer) = self.checkout(endpoint) else {
            warn!("Completion on {} without a live transfer", endpoint);
            return Ok(());
        };
        trace!(
            "Completion on {}: {:?}, {} bytes",
            endpoint, event.status, event.actual_length
        );

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| transfer.run_callback(event)));
        let still_registered = self.checkin(endpoint);

        let resubmit = match outcome {
            Ok(resubmit) => resubmit,
            Err(_) => {
                error!("Completion callback on {} panicked, dropping transfer", endpoint);
                return Err(Error::CallbackPanicked(endpoint));
            }
        };

        if !still_registered {
            debug!("Transfer on {} cancelled during its callback", endpoint);
            return Ok(());
        }

        if !resubmit {
            debug!("Transfer on {} finished, tearing down", endpoint);
            return Ok(());
        }

        transfer.actual_length = 0;
        match self.library.submit(&mut transfer.raw) {
            Ok(()) => {
                transfer.status = TransferStatus::Submitted;
                trace!("Resubmitted transfer on {}", endpoint);
                self.registry
                    .borrow_mut()
                    .insert(endpoint, Slot::Live(transfer));
                Ok(())
            }
            Err(source) => {
                error!("Failed to resubmit transfer on {}: {}", endpoint, source);
                Err(SubmitError { endpoint, source }.into())
            }
        }
    }
}

impl<L: TransferLibrary> Drop for Interface<L> {
    fn drop(&mut self) {
        self.shared.close();
    }
}

impl<L: TransferLibrary> Shared<L> {
    /// Cancel and free every transfer, then release the claim.
    ///
    /// A transfer whose callback is running is freed by the completion path
    /// once the callback returns, since its slot is gone.
    fn close(&self) {
        let registry = std::mem::take(&mut *self.registry.borrow_mut());
        for (endpoint, slot) in registry {
            if let Slot::Live(mut transfer) = slot {
                self.library.cancel(&mut transfer.raw);
                debug!("Cancelled transfer on {} at interface close", endpoint);
            }
        }

        match self.device.release_interface(self.number) {
            Ok(()) => debug!("Released interface {}", self.number),
            Err(e) => warn!("Failed to release interface {}: {}", self.number, e),
        }
    }
}
