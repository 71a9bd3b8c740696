//! Handshake Engine
//!
//! Validates an HTTP/1.1 Upgrade request and produces the
//! `101 Switching Protocols` response. Works on the bytes it is given only.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Deserializer};
use sha1::{Digest, Sha1};
use std::collections::HashMap;

use super::error::HandshakeError;

/// GUID appended to the client key before hashing (RFC 6455 section 1.3)
pub const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Largest header block accepted before the blank line
pub const MAX_HANDSHAKE_SIZE: usize = 8192;

/// The only protocol version this server speaks
pub const WEBSOCKET_VERSION: &str = "13";

/// Origins permitted to open connections
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum AllowedOrigins {
    /// `*`: every origin, and requests without one
    #[default]
    Any,
    List(Vec<String>),
}

impl AllowedOrigins {
    /// Parse `*` or a comma-separated list
    pub fn parse(value: &str) -> Self {
        let origins: Vec<String> = value
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        Self::from_list(origins)
    }

    fn from_list(origins: Vec<String>) -> Self {
        if origins.is_empty() || origins.iter().any(|o| o == "*") {
            AllowedOrigins::Any
        } else {
            AllowedOrigins::List(origins)
        }
    }

    pub fn allows(&self, origin: &str) -> bool {
        match self {
            AllowedOrigins::Any => true,
            AllowedOrigins::List(list) => list.iter().any(|o| o == origin),
        }
    }
}

impl<'de> Deserialize<'de> for AllowedOrigins {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            One(String),
            Many(Vec<String>),
        }

        Ok(match Raw::deserialize(deserializer)? {
            Raw::One(value) => AllowedOrigins::parse(&value),
            Raw::Many(list) => AllowedOrigins::from_list(list),
        })
    }
}

/// Parsed request line and headers of an upgrade request
#[derive(Debug, Clone)]
pub struct UpgradeRequest {
    pub request_line: String,
    headers: HashMap<String, String>,
}

impl UpgradeRequest {
    /// Parse a raw request; header names are matched case-insensitively
    pub fn parse(raw: &[u8]) -> Result<Self, HandshakeError> {
        let text = std::str::from_utf8(raw)
            .map_err(|_| HandshakeError::MalformedRequest("request is not valid UTF-8".into()))?;

        let mut lines = text.split("\r\n");
        let request_line = lines
            .next()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .ok_or_else(|| HandshakeError::MalformedRequest("missing request line".into()))?
            .to_string();

        let mut headers = HashMap::new();
        for line in lines {
            if line.is_empty() {
                break;
            }
            // a lone CR or LF would let a header value split the reply
            if line.contains(['\r', '\n']) {
                return Err(HandshakeError::MalformedRequest(
                    "bare line break in header".into(),
                ));
            }
            let line = line.trim();
            if let Some((name, value)) = line.split_once(':') {
                headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
            }
        }

        Ok(Self {
            request_line,
            headers,
        })
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }
}

/// A successful handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub accept_key: String,
    pub origin: Option<String>,
    /// Full `101` response, ready to write
    pub response: String,
}

/// Validate an upgrade request and build the switching-protocols response
pub fn perform_handshake(
    raw: &[u8],
    allowed_origins: &AllowedOrigins,
) -> Result<Handshake, HandshakeError> {
    let request = UpgradeRequest::parse(raw)?;

    let key = request
        .header("Sec-WebSocket-Key")
        .filter(|key| !key.is_empty())
        .ok_or(HandshakeError::MissingKey)?;

    if let Some(version) = request.header("Sec-WebSocket-Version") {
        if version != WEBSOCKET_VERSION {
            return Err(HandshakeError::UnsupportedVersion(version.to_string()));
        }
    }

    let origin = request.header("Origin").map(str::to_string);
    if let Some(origin) = &origin {
        if !allowed_origins.allows(origin) {
            return Err(HandshakeError::OriginNotAllowed(origin.clone()));
        }
    }

    let accept_key = accept_key(key);

    let mut response = String::with_capacity(256);
    response.push_str("HTTP/1.1 101 Switching Protocols\r\n");
    response.push_str("Upgrade: websocket\r\n");
    response.push_str("Connection: Upgrade\r\n");
    response.push_str(&format!("Sec-WebSocket-Accept: {}\r\n", accept_key));
    if let Some(origin) = &origin {
        response.push_str(&format!("Access-Control-Allow-Origin: {}\r\n", origin));
    }
    response.push_str(&format!("Sec-WebSocket-Version: {}\r\n\r\n", WEBSOCKET_VERSION));

    Ok(Handshake {
        accept_key,
        origin,
        response,
    })
}

/// `base64(SHA1(key + GUID))`
pub fn accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WEBSOCKET_GUID.as_bytes());
    STANDARD.encode(hasher.finalize())
}

/// Offset just past the `\r\n\r\n` that ends the header block
pub fn find_header_end(buffer: &[u8]) -> Option<usize> {
    buffer
        .windows(4)
        .position(|window| window == b"\r\n\r\n")
        .map(|pos| pos + 4)
}

impl HandshakeError {
    /// HTTP reply sent before closing a rejected connection
    pub fn http_response(&self) -> String {
        let (status, extra) = match self {
            HandshakeError::UnsupportedVersion(_) => (
                "426 Upgrade Required",
                format!("Sec-WebSocket-Version: {}\r\n", WEBSOCKET_VERSION),
            ),
            HandshakeError::OriginNotAllowed(_) => ("403 Forbidden", String::new()),
            HandshakeError::RequestTooLarge(_) => {
                ("431 Request Header Fields Too Large", String::new())
            }
            HandshakeError::MalformedRequest(_) | HandshakeError::MissingKey => {
                ("400 Bad Request", String::new())
            }
        };

        let body = self.to_string();
        format!(
            "HTTP/1.1 {}\r\n{}Content-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            status,
            extra,
            body.len(),
            body
        )
    }
}
