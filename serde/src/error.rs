use thiserror::Error;

/// Errors that can occur while reading a byte stream
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SerdeErr {
    /// The reader ran out of bytes before the value was complete
    #[error("Unexpected end of stream: needed {needed} byte(s), {remaining} remaining")]
    UnexpectedEnd { needed: usize, remaining: usize },

    /// A packed integer used more continuation bytes than its width allows
    #[error("Packed integer overflowed after {bytes} byte(s)")]
    IntegerOverflow { bytes: usize },

    /// A value was read that is not valid for the target type
    #[error("Invalid value {value} for type {type_name}")]
    InvalidValue { type_name: &'static str, value: u64 },
}
