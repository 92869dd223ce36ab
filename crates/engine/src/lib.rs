//! Asynchronous USB transfer engine
//!
//! This crate provides:
//! - [`Interface`]: per-endpoint submit/cancel/resubmit of interrupt
//!   transfers on a claimed interface
//! - [`UsbSource`]: an event source mirroring the transfer library's
//!   descriptor set and timeouts into a [`MainLoop`]
//! - [`Libusb`]: the libusb backend for both
//!
//! Everything here is single-threaded and runs on the loop thread.

pub mod claim;
pub mod interface;
pub mod library;
pub mod libusb;
pub mod mainloop;
pub mod source;
pub mod test_utils;
mod transfer;

pub use claim::{ClaimInterface, claim};
pub use interface::Interface;
pub use library::{
    CompletionEvent, CompletionTarget, EventLibrary, PollInterest, PollfdNotifier, RawTransfer,
    TransferLibrary,
};
pub use libusb::{Libusb, LibusbTransfer};
pub use mainloop::{LoopHandle, MainLoop, PollEntry, Source, SourceId, Timeout};
pub use source::{SourceState, UsbSource};
pub use transfer::{ReadCompletion, WriteCompletion};
