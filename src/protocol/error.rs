//! Protocol error types
//!
//! Every error in this module is fatal to the connection that produced it.

use thiserror::Error;

use super::frame::close_code;

/// Errors raised while decoding frames or reassembling messages
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// RSV1-3 set without a negotiated extension
    #[error("Reserved bits set in frame header: {0:#04x}")]
    ReservedBits(u8),

    /// Opcode outside the RFC 6455 set
    #[error("Unknown opcode: {0:#x}")]
    UnknownOpcode(u8),

    /// Extended length marker present but its bytes are missing
    #[error("Truncated {width}-byte length field ({available} bytes available)")]
    TruncatedLength { width: usize, available: usize },

    /// 64-bit length with the most significant bit set
    #[error("64-bit payload length has the most significant bit set")]
    LengthOverflow,

    /// Control frames must fit in a single frame
    #[error("Control frame must not be fragmented")]
    FragmentedControl,

    /// Control frames carry at most 125 bytes
    #[error("Control frame payload too large: {0} bytes")]
    ControlTooLarge(u64),

    /// Declared frame or reassembled message is over the configured limit
    #[error("Payload of {len} bytes exceeds limit of {limit} bytes")]
    PayloadTooLarge { len: u64, limit: u64 },

    /// Continuation frame with nothing to continue
    #[error("Continuation frame without a message in progress")]
    UnexpectedContinuation,

    /// Text or binary frame arrived before the previous message finished
    #[error("New data frame while a fragmented message is in progress")]
    InterleavedMessage,

    /// Text message is not valid UTF-8
    #[error("Text payload is not valid UTF-8")]
    InvalidUtf8,
}

/// Reasons an HTTP upgrade request is refused
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    /// Request could not be parsed as HTTP
    #[error("Malformed upgrade request: {0}")]
    MalformedRequest(String),

    /// Header block grew past the size limit without terminating
    #[error("Handshake request exceeds {0} bytes")]
    RequestTooLarge(usize),

    /// No Sec-WebSocket-Key header
    #[error("Missing Sec-WebSocket-Key header")]
    MissingKey,

    /// Sec-WebSocket-Version present but not 13
    #[error("Unsupported WebSocket version: {0}")]
    UnsupportedVersion(String),

    /// Origin header not in the allow-list
    #[error("Origin not allowed: {0}")]
    OriginNotAllowed(String),
}

/// Connection-fatal protocol violation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("Handshake error: {0}")]
    Handshake(#[from] HandshakeError),
}

impl ProtocolError {
    /// Close status code to send before dropping the connection
    pub fn close_code(&self) -> u16 {
        match self {
            ProtocolError::Frame(FrameError::PayloadTooLarge { .. }) => close_code::MESSAGE_TOO_BIG,
            ProtocolError::Frame(FrameError::InvalidUtf8) => close_code::INVALID_PAYLOAD,
            _ => close_code::PROTOCOL_ERROR,
        }
    }
}

/// Result type for protocol operations
pub type ProtocolResult<T> = Result<T, ProtocolError>;
