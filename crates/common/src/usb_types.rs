//! USB endpoint and transfer state types

use std::fmt;

/// Direction bit of an endpoint address (bit 7 = 1 means IN)
pub const ENDPOINT_DIR_IN: u8 = 0x80;

/// Mask for the endpoint number part of an endpoint address
pub const ENDPOINT_NUMBER_MASK: u8 = 0x0f;

/// Transfer direction relative to the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Direction {
    /// Device to host
    In,
    /// Host to device
    Out,
}

/// Registry key: endpoint number combined with a direction
///
/// At most one transfer may be live per key on an open interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EndpointKey {
    number: u8,
    direction: Direction,
}

impl EndpointKey {
    /// Create a key from an endpoint number (0-15) and direction.
    ///
    /// Returns `None` if the number does not fit in the endpoint number field.
    pub fn new(number: u8, direction: Direction) -> Option<Self> {
        if number & !ENDPOINT_NUMBER_MASK != 0 {
            return None;
        }
        Some(Self { number, direction })
    }

    /// IN key for an endpoint number
    pub fn input(number: u8) -> Option<Self> {
        Self::new(number, Direction::In)
    }

    /// OUT key for an endpoint number
    pub fn output(number: u8) -> Option<Self> {
        Self::new(number, Direction::Out)
    }

    pub fn number(&self) -> u8 {
        self.number
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Endpoint address byte as used on the wire
    pub fn address(&self) -> u8 {
        match self.direction {
            Direction::In => self.number | ENDPOINT_DIR_IN,
            Direction::Out => self.number,
        }
    }
}

impl fmt::Display for EndpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dir = match self.direction {
            Direction::In => "IN",
            Direction::Out => "OUT",
        };
        write!(f, "endpoint {} {} ({:#04x})", self.number, dir, self.address())
    }
}

/// Lifecycle state of a registered transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    /// Handed to the transfer library, completion pending
    Submitted,
    /// Completed; the completion callback is deciding whether to resubmit
    Completed,
    /// Cancellation was requested while the completion callback was running
    Cancelled,
}

/// Outcome reported by the transfer library for one completed operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionStatus {
    Completed,
    Error,
    TimedOut,
    Cancelled,
    Stall,
    NoDevice,
    Overflow,
}

impl CompletionStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, CompletionStatus::Completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_address() {
        assert_eq!(EndpointKey::input(1).unwrap().address(), 0x81);
        assert_eq!(EndpointKey::output(2).unwrap().address(), 0x02);
    }

    #[test]
    fn test_endpoint_number_out_of_range() {
        assert!(EndpointKey::input(16).is_none());
        assert!(EndpointKey::output(0x81).is_none());
        assert!(EndpointKey::input(15).is_some());
    }

    #[test]
    fn test_same_number_different_direction() {
        assert_ne!(EndpointKey::input(1), EndpointKey::output(1));
    }

    #[test]
    fn test_display() {
        let key = EndpointKey::input(1).unwrap();
        assert_eq!(key.to_string(), "endpoint 1 IN (0x81)");
    }
}
