//! WebSocket Wire Protocol
//!
//! RFC 6455 building blocks, all free of I/O:
//!
//! - **frame**: frame encode/decode, masking, length encodings
//! - **message**: reassembly of fragmented messages
//! - **handshake**: HTTP Upgrade validation and accept-key derivation
//! - **error**: connection-fatal protocol errors
//!
//! # Example
//!
//! ```rust
//! use pubsock::protocol::{decode, encode, Decoded, OpCode};
//!
//! let bytes = encode(b"hello", OpCode::Text, true);
//! match decode(&bytes) {
//!     Decoded::Complete { frame, consumed } => {
//!         assert_eq!(frame.payload, b"hello");
//!         assert_eq!(consumed, bytes.len());
//!     }
//!     _ => unreachable!(),
//! }
//! ```

pub mod error;
pub mod frame;
pub mod handshake;
pub mod message;

pub use error::{FrameError, HandshakeError, ProtocolError, ProtocolResult};
pub use frame::{close_code, decode, decode_with_limit, encode, encode_masked, Decoded, Frame, OpCode};
pub use handshake::{
    accept_key, find_header_end, perform_handshake, AllowedOrigins, Handshake, UpgradeRequest,
    MAX_HANDSHAKE_SIZE, WEBSOCKET_GUID,
};
pub use message::{Message, MessageAssembler};
