//! Common utilities for usb-streamer
//!
//! This crate provides the pieces shared between the transfer engine and the
//! streamer binary: endpoint and status types, the error taxonomy, and
//! logging setup.

pub mod error;
pub mod logging;
pub mod usb_types;

pub use error::{ClaimError, Error, IntegrityError, Result, SubmitError};
pub use logging::setup_logging;
pub use usb_types::{CompletionStatus, Direction, EndpointKey, TransferStatus};
