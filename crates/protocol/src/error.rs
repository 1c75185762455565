//! Descriptor validation errors

use thiserror::Error;

/// A descriptor field that failed validation while being copied out of the
/// host's representation
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DescriptorError {
    /// bLength too small for the descriptor kind
    #[error("{kind} descriptor too short: bLength {length} (need {minimum})")]
    TooShort {
        kind: &'static str,
        length: u8,
        minimum: u8,
    },

    /// bDescriptorType does not match the descriptor kind
    #[error("{kind} descriptor has wrong type {actual:#04x} (expected {expected:#04x})")]
    WrongType {
        kind: &'static str,
        actual: u8,
        expected: u8,
    },

    /// A declared child count disagrees with the children actually present
    #[error("{kind} declares {declared} children but {actual} were read")]
    CountMismatch {
        kind: &'static str,
        declared: u8,
        actual: usize,
    },

    /// Interface/alternate numbering does not match its position in the tree
    #[error("interface {interface} alternate {alternate} stored at position {position}")]
    Misnumbered {
        interface: u8,
        alternate: u8,
        position: usize,
    },
}

/// Type alias for descriptor validation results
pub type Result<T> = std::result::Result<T, DescriptorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DescriptorError::WrongType {
            kind: "endpoint",
            actual: 0x04,
            expected: 0x05,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("endpoint"));
        assert!(msg.contains("0x04"));
        assert!(msg.contains("0x05"));
    }

    #[test]
    fn test_count_mismatch_display() {
        let err = DescriptorError::CountMismatch {
            kind: "interface",
            declared: 2,
            actual: 1,
        };
        assert!(format!("{}", err).contains("declares 2"));
    }
}
