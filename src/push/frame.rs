//! Binary frame codec for the legacy gateway protocol.
//!
//! Outbound notifications use the enhanced format (command 1), which carries
//! an identifier and an expiry so the gateway can name the failing
//! notification in an error response:
//!
//! ```text
//! command(1)=1 | identifier(4) | expiry(4) | token_len(2)=32 | token(32) | payload_len(2) | payload
//! ```
//!
//! The gateway answers only on failure, with a six-byte error response:
//!
//! ```text
//! command(1)=8 | status(1) | identifier(4)
//! ```
//!
//! All integers are big-endian.

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};

/// Command byte of an enhanced notification frame.
pub const NOTIFICATION_COMMAND: u8 = 1;

/// Command byte of an error-response frame.
pub const ERROR_RESPONSE_COMMAND: u8 = 8;

/// Size of a binary device token.
pub const DEVICE_TOKEN_SIZE: usize = 32;

/// Maximum payload accepted by the gateway.
pub const MAX_PAYLOAD_SIZE: usize = 256;

/// Size of an error-response frame.
pub const ERROR_RESPONSE_SIZE: usize = 6;

/// Fixed part of a notification frame preceding the payload.
pub const NOTIFICATION_HEADER_SIZE: usize = 1 + 4 + 4 + 2 + DEVICE_TOKEN_SIZE + 2;

/// Number of hex characters shown when a token is logged.
const TOKEN_LOG_PREFIX: usize = 8;

/// A 32-byte device token.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceToken([u8; DEVICE_TOKEN_SIZE]);

impl DeviceToken {
    /// Parse a hex device token, ignoring any whitespace inside it.
    ///
    /// Tokens are commonly copied with spaces every eight characters, so all
    /// whitespace is stripped before decoding.
    pub fn from_hex(input: &str) -> Result<Self> {
        let cleaned: String = input.chars().filter(|c| !c.is_whitespace()).collect();
        let mut bytes = [0u8; DEVICE_TOKEN_SIZE];
        hex::decode_to_slice(&cleaned, &mut bytes).map_err(|e| match e {
            hex::FromHexError::InvalidStringLength | hex::FromHexError::OddLength => {
                Error::TokenFormat(format!(
                    "expected {} hex characters, got {}",
                    DEVICE_TOKEN_SIZE * 2,
                    cleaned.len()
                ))
            }
            other => Error::TokenFormat(other.to_string()),
        })?;
        Ok(Self(bytes))
    }

    /// Raw token bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; DEVICE_TOKEN_SIZE] {
        &self.0
    }

    /// Lowercase hex form of the token.
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl From<[u8; DEVICE_TOKEN_SIZE]> for DeviceToken {
    fn from(bytes: [u8; DEVICE_TOKEN_SIZE]) -> Self {
        Self(bytes)
    }
}

// Tokens identify devices, keep them out of logs.
impl fmt::Debug for DeviceToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = self.to_hex();
        write!(f, "DeviceToken({}…)", &hex[..TOKEN_LOG_PREFIX])
    }
}

/// One notification ready to be framed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    token: DeviceToken,
    payload: Bytes,
    identifier: u32,
    expiry: u32,
}

impl Notification {
    /// Create a notification, rejecting payloads over [`MAX_PAYLOAD_SIZE`].
    pub fn new(token: DeviceToken, payload: Bytes, identifier: u32, expiry: u32) -> Result<Self> {
        check_payload_size(payload.len())?;
        Ok(Self {
            token,
            payload,
            identifier,
            expiry,
        })
    }

    /// Encode into a complete wire frame.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(NOTIFICATION_HEADER_SIZE + self.payload.len());
        buf.put_u8(NOTIFICATION_COMMAND);
        buf.put_u32(self.identifier);
        buf.put_u32(self.expiry);
        buf.put_u16(DEVICE_TOKEN_SIZE as u16);
        buf.put_slice(&self.token.0);
        // Bounded by MAX_PAYLOAD_SIZE at construction.
        buf.put_u16(self.payload.len() as u16);
        buf.put_slice(&self.payload);
        buf.freeze()
    }
}

/// Parse a hex token and encode the frame in one step.
///
/// Fails with [`Error::TokenFormat`] for a malformed token and
/// [`Error::PayloadTooLarge`] for an oversized payload.
pub fn encode_notification(
    token_hex: &str,
    payload: &Bytes,
    identifier: u32,
    expiry: u32,
) -> Result<Bytes> {
    let token = DeviceToken::from_hex(token_hex)?;
    Ok(Notification::new(token, payload.clone(), identifier, expiry)?.encode())
}

/// Reject payloads the gateway would drop.
pub fn check_payload_size(size: usize) -> Result<()> {
    if size > MAX_PAYLOAD_SIZE {
        return Err(Error::PayloadTooLarge {
            size,
            max: MAX_PAYLOAD_SIZE,
        });
    }
    Ok(())
}

/// Status code carried by an error response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorStatus {
    NoErrors,
    ProcessingError,
    MissingDeviceToken,
    MissingTopic,
    MissingPayload,
    InvalidTokenSize,
    InvalidTopicSize,
    InvalidPayloadSize,
    InvalidToken,
    Shutdown,
    Unknown,
    /// Code not defined by the protocol.
    Other(u8),
}

impl ErrorStatus {
    /// Wire value of the status.
    #[must_use]
    pub fn code(self) -> u8 {
        match self {
            ErrorStatus::NoErrors => 0,
            ErrorStatus::ProcessingError => 1,
            ErrorStatus::MissingDeviceToken => 2,
            ErrorStatus::MissingTopic => 3,
            ErrorStatus::MissingPayload => 4,
            ErrorStatus::InvalidTokenSize => 5,
            ErrorStatus::InvalidTopicSize => 6,
            ErrorStatus::InvalidPayloadSize => 7,
            ErrorStatus::InvalidToken => 8,
            ErrorStatus::Shutdown => 10,
            ErrorStatus::Unknown => 255,
            ErrorStatus::Other(code) => code,
        }
    }

    /// Short label, used for logs and metric labels.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorStatus::NoErrors => "no_errors",
            ErrorStatus::ProcessingError => "processing_error",
            ErrorStatus::MissingDeviceToken => "missing_device_token",
            ErrorStatus::MissingTopic => "missing_topic",
            ErrorStatus::MissingPayload => "missing_payload",
            ErrorStatus::InvalidTokenSize => "invalid_token_size",
            ErrorStatus::InvalidTopicSize => "invalid_topic_size",
            ErrorStatus::InvalidPayloadSize => "invalid_payload_size",
            ErrorStatus::InvalidToken => "invalid_token",
            ErrorStatus::Shutdown => "shutdown",
            ErrorStatus::Unknown => "unknown",
            ErrorStatus::Other(_) => "other",
        }
    }
}

impl From<u8> for ErrorStatus {
    fn from(code: u8) -> Self {
        match code {
            0 => ErrorStatus::NoErrors,
            1 => ErrorStatus::ProcessingError,
            2 => ErrorStatus::MissingDeviceToken,
            3 => ErrorStatus::MissingTopic,
            4 => ErrorStatus::MissingPayload,
            5 => ErrorStatus::InvalidTokenSize,
            6 => ErrorStatus::InvalidTopicSize,
            7 => ErrorStatus::InvalidPayloadSize,
            8 => ErrorStatus::InvalidToken,
            10 => ErrorStatus::Shutdown,
            255 => ErrorStatus::Unknown,
            other => ErrorStatus::Other(other),
        }
    }
}

impl fmt::Display for ErrorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.as_str(), self.code())
    }
}

/// Error response sent by the gateway before it closes the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorResponse {
    pub status: ErrorStatus,
    /// Identifier of the first notification the gateway rejected.
    pub identifier: u32,
}

impl ErrorResponse {
    /// Decode an error-response frame.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != ERROR_RESPONSE_SIZE {
            return Err(Error::MalformedFrame(format!(
                "expected {ERROR_RESPONSE_SIZE} bytes, got {}",
                bytes.len()
            )));
        }
        if bytes[0] != ERROR_RESPONSE_COMMAND {
            return Err(Error::MalformedFrame(format!(
                "unexpected command byte {}",
                bytes[0]
            )));
        }
        let identifier = u32::from_be_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]);
        Ok(Self {
            status: ErrorStatus::from(bytes[1]),
            identifier,
        })
    }

    /// Encode as the gateway would send it.
    #[cfg(test)]
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(ERROR_RESPONSE_SIZE);
        buf.put_u8(ERROR_RESPONSE_COMMAND);
        buf.put_u8(self.status.code());
        buf.put_u32(self.identifier);
        buf.freeze()
    }
}
