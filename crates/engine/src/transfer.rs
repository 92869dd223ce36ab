//! Transfer records owned by an interface's registry

use crate::library::{CompletionEvent, RawTransfer};
use common::{CompletionStatus, Direction, EndpointKey, TransferStatus};

pub(crate) type ReadCallback = Box<dyn FnMut(&ReadCompletion<'_>) -> bool>;
pub(crate) type WriteCallback = Box<dyn FnMut(&mut WriteCompletion<'_>) -> bool>;

/// User callback, tagged by transfer direction
pub(crate) enum Completion {
    Read(ReadCallback),
    Write(WriteCallback),
}

/// Completed read handed to a read callback
///
/// `data` is empty unless some bytes arrived; check [`ReadCompletion::status`]
/// to tell a stalled or failed endpoint from an empty report.
pub struct ReadCompletion<'a> {
    endpoint: EndpointKey,
    status: CompletionStatus,
    data: &'a [u8],
}

impl ReadCompletion<'_> {
    pub fn endpoint(&self) -> EndpointKey {
        self.endpoint
    }

    pub fn status(&self) -> CompletionStatus {
        self.status
    }

    /// Bytes received, `actual_length` long
    pub fn data(&self) -> &[u8] {
        self.data
    }
}

/// Completed write handed to a write callback
///
/// Returning `true` from the callback resubmits the same buffer, so refresh
/// its contents through [`WriteCompletion::buffer_mut`] first.
pub struct WriteCompletion<'a> {
    endpoint: EndpointKey,
    status: CompletionStatus,
    actual_length: usize,
    buffer: &'a mut [u8],
}

impl WriteCompletion<'_> {
    pub fn endpoint(&self) -> EndpointKey {
        self.endpoint
    }

    pub fn status(&self) -> CompletionStatus {
        self.status
    }

    /// Bytes the device accepted
    pub fn actual_length(&self) -> usize {
        self.actual_length
    }

    pub fn buffer(&self) -> &[u8] {
        self.buffer
    }

    pub fn buffer_mut(&mut self) -> &mut [u8] {
        self.buffer
    }
}

/// One in-flight operation and everything it owns
pub(crate) struct Transfer<T> {
    pub(crate) endpoint: EndpointKey,
    pub(crate) raw: T,
    pub(crate) length: usize,
    pub(crate) actual_length: usize,
    pub(crate) status: TransferStatus,
    completion: Completion,
}

impl<T: RawTransfer> Transfer<T> {
    pub(crate) fn new(endpoint: EndpointKey, raw: T, length: usize, completion: Completion) -> Self {
        debug_assert_eq!(
            matches!(completion, Completion::Read(_)),
            endpoint.direction() == Direction::In
        );
        Self {
            endpoint,
            raw,
            length,
            actual_length: 0,
            status: TransferStatus::Submitted,
            completion,
        }
    }

    /// Record the completion and run the user callback.
    ///
    /// Returns the callback's resubmission decision.
    pub(crate) fn run_callback(&mut self, event: CompletionEvent) -> bool {
        self.status = TransferStatus::Completed;
        self.actual_length = event.actual_length.min(self.length);

        let endpoint = self.endpoint;
        let actual_length = self.actual_length;
        match &mut self.completion {
            Completion::Read(callback) => self.raw.with_buffer(|buffer| {
                callback(&ReadCompletion {
                    endpoint,
                    status: event.status,
                    data: &buffer[..actual_length],
                })
            }),
            Completion::Write(callback) => self.raw.with_buffer(|buffer| {
                let mut done = WriteCompletion {
                    endpoint,
                    status: event.status,
                    actual_length,
                    buffer,
                };
                callback(&mut done)
            }),
        }
    }
}
