// Copyright (c) 2025 HazardQueue Contributors

use thiserror::Error;

/// Errors surfaced by the fallible public API.
///
/// The queue operations themselves never fail: an empty queue is an
/// `Option::None`, payloads are owned values, and handle validity is
/// enforced by the type system. What remains fallible is the checked
/// hazard-slot surface used when embedding the registry under other
/// structures.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    #[error("hazard slot {0} is out of range for this thread's slot set")]
    SlotOutOfRange(usize),
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::SlotOutOfRange(7);
        assert!(err.to_string().contains("slot 7"));
    }
}
