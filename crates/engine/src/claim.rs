//! Interface claim helper
//!
//! Claim policy: claim; if the interface is busy and detaching is permitted,
//! detach the kernel driver once and claim again. This is a one-shot
//! fallback, not a retry loop.

use common::ClaimError;
use rusb::{DeviceHandle, UsbContext};
use tracing::{debug, warn};

/// Device-level operations needed to acquire and release an interface
pub trait ClaimInterface {
    fn claim_interface(&self, interface: u8) -> rusb::Result<()>;
    fn release_interface(&self, interface: u8) -> rusb::Result<()>;
    fn detach_kernel_driver(&self, interface: u8) -> rusb::Result<()>;
}

impl<T: UsbContext> ClaimInterface for DeviceHandle<T> {
    fn claim_interface(&self, interface: u8) -> rusb::Result<()> {
        DeviceHandle::claim_interface(self, interface)
    }

    fn release_interface(&self, interface: u8) -> rusb::Result<()> {
        DeviceHandle::release_interface(self, interface)
    }

    fn detach_kernel_driver(&self, interface: u8) -> rusb::Result<()> {
        DeviceHandle::detach_kernel_driver(self, interface)
    }
}

/// Claim `interface`, detaching a conflicting kernel driver if permitted
pub fn claim<D: ClaimInterface + ?Sized>(
    device: &D,
    interface: u8,
    try_detach: bool,
) -> Result<(), ClaimError> {
    match device.claim_interface(interface) {
        Ok(()) => {
            debug!("Claimed interface {}", interface);
            Ok(())
        }
        Err(rusb::Error::Busy) if try_detach => {
            debug!(
                "Interface {} busy, detaching kernel driver and retrying",
                interface
            );
            device
                .detach_kernel_driver(interface)
                .map_err(|source| {
                    warn!(
                        "Failed to detach kernel driver from interface {}: {}",
                        interface, source
                    );
                    ClaimError::DetachFailed { interface, source }
                })?;

            device
                .claim_interface(interface)
                .map_err(|source| ClaimError::Other { interface, source })?;
            debug!("Claimed interface {} after detaching kernel driver", interface);
            Ok(())
        }
        Err(rusb::Error::Busy) => Err(ClaimError::Busy { interface }),
        Err(source) => Err(ClaimError::Other { interface, source }),
    }
}
