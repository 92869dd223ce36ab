//! Common error types

use crate::usb_types::EndpointKey;
use std::os::fd::RawFd;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Claim(#[from] ClaimError),

    #[error(transparent)]
    Submit(#[from] SubmitError),

    #[error("integrity violation: {0}")]
    Integrity(#[from] IntegrityError),

    /// Next-timeout query failed. Non-fatal: logged by the event source,
    /// which then blocks indefinitely.
    #[error("failed to query next USB timeout: {0}")]
    TimeoutQuery(rusb::Error),

    #[error("completion callback for {0} panicked")]
    CallbackPanicked(EndpointKey),

    #[error("USB error: {0}")]
    Usb(#[from] rusb::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Interface acquisition failed
#[derive(Debug, Error)]
pub enum ClaimError {
    /// Interface is in use and detaching the kernel driver was not permitted
    #[error("interface {interface} is busy")]
    Busy { interface: u8 },

    /// Interface is in use and detaching the kernel driver failed
    #[error("error detaching kernel driver from interface {interface}: {source}")]
    DetachFailed { interface: u8, source: rusb::Error },

    #[error("error claiming interface {interface}: {source}")]
    Other { interface: u8, source: rusb::Error },
}

/// The transfer library rejected a submission or resubmission
#[derive(Debug, Error)]
#[error("failed to submit transfer on {endpoint}: {source}")]
pub struct SubmitError {
    pub endpoint: EndpointKey,
    pub source: rusb::Error,
}

/// Programming-contract violations
#[derive(Debug, Error, PartialEq, Eq)]
pub enum IntegrityError {
    #[error("{0} already has a transfer in flight")]
    EndpointBusy(EndpointKey),

    #[error("{0} not found")]
    EndpointNotFound(EndpointKey),

    #[error("invalid endpoint number {0}")]
    InvalidEndpoint(u8),

    #[error("descriptor {0} removed but never added")]
    UnknownDescriptor(RawFd),

    #[error("event source is already attached")]
    AlreadyAttached,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_submit_error_display() {
        let err = SubmitError {
            endpoint: EndpointKey::input(1).unwrap(),
            source: rusb::Error::NoDevice,
        };
        let msg = err.to_string();
        assert!(msg.contains("endpoint 1 IN"));
    }

    #[test]
    fn test_claim_error_display() {
        let err = ClaimError::DetachFailed {
            interface: 3,
            source: rusb::Error::Access,
        };
        assert!(err.to_string().contains("interface 3"));
    }

    #[test]
    fn test_integrity_into_error() {
        let err: Error = IntegrityError::AlreadyAttached.into();
        assert!(matches!(err, Error::Integrity(IntegrityError::AlreadyAttached)));
    }
}
