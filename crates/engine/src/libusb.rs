//! libusb backend
//!
//! Drives libusb's asynchronous transfer API through `rusb::ffi` on an
//! explicit context. Completions arrive in [`transfer_callback`] from inside
//! `handle_events`; errors raised by the engine there are collected and
//! returned once event processing finishes.
//!
//! A transfer dropped while still in flight cannot be freed on the spot. It
//! is cancelled and marked abandoned, and the completion trampoline frees it
//! when libusb reports the cancellation.

use crate::library::{
    CompletionEvent, CompletionTarget, ErrorSink, EventLibrary, PollInterest, PollfdNotifier,
    RawTransfer, TransferLibrary,
};
use common::{CompletionStatus, EndpointKey, Error, Result};
use libc::{c_int, c_short, c_void, timeval};
use nix::poll::PollFlags;
use rusb::ffi::{self, constants::*};
use rusb::{Context, DeviceHandle, UsbContext};
use std::any::Any;
use std::cell::{Cell, RefCell};
use std::os::fd::RawFd;
use std::panic::{self, AssertUnwindSafe};
use std::ptr::{self, NonNull};
use std::rc::{Rc, Weak};
use std::time::Duration;
use tracing::{debug, error, trace, warn};

/// Transfer library backed by a libusb context
pub struct Libusb {
    context: Context,
    /// Boxed so libusb can hold a thin pointer to it
    notifier: RefCell<Option<Box<Weak<dyn PollfdNotifier>>>>,
    errors: Rc<ErrorSink>,
}

impl Libusb {
    pub fn new(context: Context) -> Self {
        Self {
            context,
            notifier: RefCell::new(None),
            errors: Rc::new(ErrorSink::default()),
        }
    }

    pub fn context(&self) -> &Context {
        &self.context
    }
}

impl Drop for Libusb {
    fn drop(&mut self) {
        if self.notifier.get_mut().is_some() {
            // SAFETY: clearing the notifiers on our own live context
            unsafe {
                ffi::libusb_set_pollfd_notifiers(self.context.as_raw(), None, None, ptr::null_mut());
            }
        }
    }
}

struct TransferState {
    /// Keeps the device open while libusb may still touch the transfer
    _device: Rc<dyn Any>,
    buffer: Vec<u8>,
    target: CompletionTarget,
    errors: Rc<ErrorSink>,
    in_flight: Cell<bool>,
    abandoned: Cell<bool>,
}

/// libusb transfer plus the state its `user_data` points at
pub struct LibusbTransfer {
    raw: NonNull<ffi::libusb_transfer>,
    state: NonNull<TransferState>,
}

impl LibusbTransfer {
    /// Allocate and fill an interrupt transfer with no deadline.
    ///
    /// # Safety
    ///
    /// `dev_handle` must be null or an open handle kept alive by `device`.
    unsafe fn new(
        device: Rc<dyn Any>,
        dev_handle: *mut ffi::libusb_device_handle,
        endpoint: EndpointKey,
        buffer: Vec<u8>,
        target: CompletionTarget,
        errors: Rc<ErrorSink>,
    ) -> std::result::Result<Self, rusb::Error> {
        let length = c_int::try_from(buffer.len()).map_err(|_| rusb::Error::InvalidParam)?;

        // SAFETY: plain allocation, checked for null below
        let raw = NonNull::new(unsafe { ffi::libusb_alloc_transfer(0) }).ok_or(rusb::Error::NoMem)?;

        let state = Box::leak(Box::new(TransferState {
            _device: device,
            buffer,
            target,
            errors,
            in_flight: Cell::new(false),
            abandoned: Cell::new(false),
        }));
        let buffer_ptr = state.buffer.as_mut_ptr();
        let state = NonNull::from(state);

        // SAFETY: the buffer lives in `state`, which outlives the transfer
        unsafe {
            ffi::libusb_fill_interrupt_transfer(
                raw.as_ptr(),
                dev_handle,
                endpoint.address(),
                buffer_ptr,
                length,
                transfer_callback,
                state.as_ptr().cast::<c_void>(),
                0,
            );
        }

        Ok(Self { raw, state })
    }

    /// Ask libusb to cancel. A transfer without a device handle was never
    /// submitted and reports `LIBUSB_ERROR_NOT_FOUND`.
    fn cancel_raw(&self) -> c_int {
        // SAFETY: `raw` stays allocated until this transfer is freed
        unsafe {
            if (*self.raw.as_ptr()).dev_handle.is_null() {
                return LIBUSB_ERROR_NOT_FOUND;
            }
            ffi::libusb_cancel_transfer(self.raw.as_ptr())
        }
    }

    fn state(&self) -> &TransferState {
        // SAFETY: state is owned by this transfer until it is freed
        unsafe { self.state.as_ref() }
    }
}

impl RawTransfer for LibusbTransfer {
    fn with_buffer<R>(&mut self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        // SAFETY: not in flight, so libusb does not access the buffer
        let state = unsafe { self.state.as_mut() };
        f(&mut state.buffer)
    }
}

impl Drop for LibusbTransfer {
    fn drop(&mut self) {
        let state = self.state();
        if state.in_flight.get() {
            trace!("Abandoning in-flight transfer on {}", state.target.endpoint());
            state.abandoned.set(true);
            // the trampoline frees it once libusb reports the cancellation
            self.cancel_raw();
            return;
        }

        // SAFETY: not in flight, so libusb holds no reference to either
        unsafe { free_transfer(self.raw, self.state) }
    }
}

/// # Safety
///
/// `raw` and `state` must come from one `LibusbTransfer::new` call, must not be
/// in flight, and must not be used afterwards.
unsafe fn free_transfer(raw: NonNull<ffi::libusb_transfer>, state: NonNull<TransferState>) {
    unsafe {
        ffi::libusb_free_transfer(raw.as_ptr());
        drop(Box::from_raw(state.as_ptr()));
    }
}

extern "system" fn transfer_callback(transfer: *mut ffi::libusb_transfer) {
    // SAFETY: libusb passes back a transfer filled by `LibusbTransfer::new`,
    // whose user_data is its `TransferState`
    let (raw, state) = unsafe {
        (
            NonNull::new_unchecked(transfer),
            NonNull::new_unchecked((*transfer).user_data.cast::<TransferState>()),
        )
    };

    let abandoned = {
        // SAFETY: see above
        let state = unsafe { state.as_ref() };
        state.in_flight.set(false);
        state.abandoned.get()
    };
    if abandoned {
        // SAFETY: no longer in flight and no owner remains
        unsafe { free_transfer(raw, state) };
        return;
    }

    let (target, errors, event) = {
        // SAFETY: see above
        let (transfer, state) = unsafe { (raw.as_ref(), state.as_ref()) };
        let event = CompletionEvent {
            status: completion_status_from_libusb(transfer.status),
            actual_length: usize::try_from(transfer.actual_length).unwrap_or(0),
        };
        (state.target.clone(), state.errors.clone(), event)
    };

    // the engine may free the transfer from inside `complete`
    let endpoint = target.endpoint();
    match panic::catch_unwind(AssertUnwindSafe(|| target.complete(event))) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => errors.push(e),
        Err(_) => {
            error!("Panic in completion handler for {}", endpoint);
            errors.push(Error::CallbackPanicked(endpoint));
        }
    }
}

impl TransferLibrary for Libusb {
    type Device = DeviceHandle<Context>;
    type Transfer = LibusbTransfer;

    fn alloc_transfer(
        &self,
        device: &Rc<DeviceHandle<Context>>,
        endpoint: EndpointKey,
        buffer: Vec<u8>,
        target: CompletionTarget,
    ) -> std::result::Result<LibusbTransfer, rusb::Error> {
        let keep_alive: Rc<dyn Any> = device.clone();
        // SAFETY: `keep_alive` holds the handle open for the transfer's life
        unsafe {
            LibusbTransfer::new(
                keep_alive,
                device.as_raw(),
                endpoint,
                buffer,
                target,
                self.errors.clone(),
            )
        }
    }

    fn submit(&self, transfer: &mut LibusbTransfer) -> std::result::Result<(), rusb::Error> {
        // SAFETY: filled by `alloc_transfer` and not in flight
        match unsafe { ffi::libusb_submit_transfer(transfer.raw.as_ptr()) } {
            0 => {
                transfer.state().in_flight.set(true);
                Ok(())
            }
            rc => Err(map_libusb_error(rc)),
        }
    }

    fn cancel(&self, transfer: &mut LibusbTransfer) {
        if !transfer.state().in_flight.get() {
            return;
        }
        let rc = transfer.cancel_raw();
        if rc != 0 && rc != LIBUSB_ERROR_NOT_FOUND {
            warn!(
                "Failed to cancel transfer on {}: {}",
                transfer.state().target.endpoint(),
                map_libusb_error(rc)
            );
        }
    }
}

extern "system" fn pollfd_added(fd: c_int, events: c_short, user_data: *mut c_void) {
    // SAFETY: user_data is the boxed notifier owned by `Libusb`, which stays
    // installed until it is replaced or cleared
    let notifier = unsafe { &*user_data.cast::<Weak<dyn PollfdNotifier>>() };
    if let Some(notifier) = notifier.upgrade() {
        notifier.pollfd_added(fd, PollFlags::from_bits_truncate(events));
    }
}

extern "system" fn pollfd_removed(fd: c_int, user_data: *mut c_void) {
    // SAFETY: as in `pollfd_added`
    let notifier = unsafe { &*user_data.cast::<Weak<dyn PollfdNotifier>>() };
    if let Some(notifier) = notifier.upgrade() {
        notifier.pollfd_removed(fd);
    }
}

impl EventLibrary for Libusb {
    fn pollfds(&self) -> Vec<PollInterest> {
        // SAFETY: explicit live context
        let list = unsafe { ffi::libusb_get_pollfds(self.context.as_raw()) };
        if list.is_null() {
            warn!("libusb_get_pollfds returned no descriptors");
            return Vec::new();
        }

        let mut pollfds = Vec::new();
        // SAFETY: null-terminated array owned by libusb until freed below
        unsafe {
            let mut cursor = list;
            while !(*cursor).is_null() {
                let pollfd = &**cursor;
                pollfds.push(PollInterest {
                    fd: pollfd.fd as RawFd,
                    events: PollFlags::from_bits_truncate(pollfd.events),
                });
                cursor = cursor.add(1);
            }
            ffi::libusb_free_pollfds(list);
        }

        debug!("libusb is watching {} descriptors", pollfds.len());
        pollfds
    }

    fn set_pollfd_notifier(&self, notifier: Option<Weak<dyn PollfdNotifier>>) {
        let boxed = notifier.map(Box::new);
        let ctx = self.context.as_raw();

        // SAFETY: user_data points into `boxed`, which is stored in
        // `self.notifier` below and outlives its registration
        unsafe {
            match &boxed {
                Some(notifier) => {
                    let user_data: *const Weak<dyn PollfdNotifier> = &**notifier;
                    ffi::libusb_set_pollfd_notifiers(
                        ctx,
                        Some(pollfd_added),
                        Some(pollfd_removed),
                        user_data.cast_mut().cast::<c_void>(),
                    );
                }
                None => ffi::libusb_set_pollfd_notifiers(ctx, None, None, ptr::null_mut()),
            }
        }

        // the previous notifier is no longer registered
        *self.notifier.borrow_mut() = boxed;
    }

    fn next_timeout(&self) -> Result<Option<Duration>> {
        let mut tv = timeval {
            tv_sec: 0,
            tv_usec: 0,
        };
        // SAFETY: explicit live context, valid out pointer
        match unsafe { ffi::libusb_get_next_timeout(self.context.as_raw(), &mut tv) } {
            0 => Ok(None),
            rc if rc < 0 => Err(Error::TimeoutQuery(map_libusb_error(rc))),
            _ => Ok(Some(timeval_to_duration(&tv))),
        }
    }

    fn handle_events(&self) -> Result<()> {
        let result = self.context.handle_events(Some(Duration::ZERO));
        self.errors.take()?;

        match result {
            Ok(()) => Ok(()),
            Err(rusb::Error::Interrupted) => {
                debug!("USB event handling interrupted");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

fn timeval_to_duration(tv: &timeval) -> Duration {
    let secs = u64::try_from(tv.tv_sec).unwrap_or(0);
    let micros = u64::try_from(tv.tv_usec).unwrap_or(0);
    Duration::from_secs(secs) + Duration::from_micros(micros)
}

/// Map a negative libusb return code to a rusb error
pub fn map_libusb_error(code: c_int) -> rusb::Error {
    match code {
        LIBUSB_ERROR_IO => rusb::Error::Io,
        LIBUSB_ERROR_INVALID_PARAM => rusb::Error::InvalidParam,
        LIBUSB_ERROR_ACCESS => rusb::Error::Access,
        LIBUSB_ERROR_NO_DEVICE => rusb::Error::NoDevice,
        LIBUSB_ERROR_NOT_FOUND => rusb::Error::NotFound,
        LIBUSB_ERROR_BUSY => rusb::Error::Busy,
        LIBUSB_ERROR_TIMEOUT => rusb::Error::Timeout,
        LIBUSB_ERROR_OVERFLOW => rusb::Error::Overflow,
        LIBUSB_ERROR_PIPE => rusb::Error::Pipe,
        LIBUSB_ERROR_INTERRUPTED => rusb::Error::Interrupted,
        LIBUSB_ERROR_NO_MEM => rusb::Error::NoMem,
        LIBUSB_ERROR_NOT_SUPPORTED => rusb::Error::NotSupported,
        _ => rusb::Error::Other,
    }
}

fn completion_status_from_libusb(status: c_int) -> CompletionStatus {
    match status {
        LIBUSB_TRANSFER_COMPLETED => CompletionStatus::Completed,
        LIBUSB_TRANSFER_TIMED_OUT => CompletionStatus::TimedOut,
        LIBUSB_TRANSFER_CANCELLED => CompletionStatus::Cancelled,
        LIBUSB_TRANSFER_STALL => CompletionStatus::Stall,
        LIBUSB_TRANSFER_NO_DEVICE => CompletionStatus::NoDevice,
        LIBUSB_TRANSFER_OVERFLOW => CompletionStatus::Overflow,
        _ => CompletionStatus::Error,
    }
}
