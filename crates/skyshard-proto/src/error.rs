//! Wire protocol error types

use thiserror::Error;

/// Errors raised while framing, encoding or decoding protocol messages
#[derive(Debug, Error)]
pub enum ProtoError {
    /// Frame length prefix exceeds the configured maximum
    #[error("Frame of {length} bytes exceeds maximum of {max} bytes")]
    FrameTooLarge { length: usize, max: usize },

    /// Payload ended before the message was fully decoded
    #[error("Truncated payload while decoding {context}")]
    Truncated { context: &'static str },

    /// First payload byte does not name a known message type
    #[error("Unknown message tag: {tag:#04x}")]
    UnknownTag { tag: u8 },

    /// A length-prefixed string was not valid UTF-8
    #[error("Invalid UTF-8 in {context}")]
    InvalidUtf8 { context: &'static str },

    /// A field carried a value outside its legal range
    #[error("Invalid value for {context}: {value}")]
    InvalidValue { context: &'static str, value: u64 },

    /// Underlying socket error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for protocol operations
pub type ProtoResult<T> = Result<T, ProtoError>;
