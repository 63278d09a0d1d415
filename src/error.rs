//! # Error Types
//!
//! This module defines all error types used throughout the library.
//!
//! ## Error Hierarchy
//!
//! The main [`Error`] enum covers every failure a caller can observe:
//!
//! | Variant | Cause | Recoverable? |
//! |---------|-------|--------------|
//! | [`Error::Io`] | OS-level failure (signal registration etc.) | Maybe |
//! | [`Error::Config`] | Invalid configuration or transport init failure | No (fix config) |
//! | [`Error::Codec`] | Payload could not be decoded | No (peer bug/incompatibility) |
//! | [`Error::Timeout`] | No response within the request timeout | Yes (retry) |
//! | [`Error::SubscriptionRejected`] | Server NACKed the subscription | No retry is attempted |
//! | [`Error::ServiceUnavailable`] | No service instance latched yet | Yes (wait for availability) |
//! | [`Error::Remote`] | Server answered with a non-OK return code | Depends on the code |
//! | [`Error::Stopped`] | The lifecycle/client was stopped | No |
//!
//! Two narrower enums sit below it:
//!
//! - [`CodecError`]: why a byte sequence is not a valid payload.
//! - [`RequestError`]: why the service refused a request; each variant maps
//!   to a distinct [`ReturnCode`] via [`RequestError::return_code`]. These never
//!   abort the service, the request is still answered.

use std::fmt;
use std::io;

use crate::ReturnCode;

/// Result type alias using the library's [`Error`] type.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type for all library operations.
#[derive(Debug)]
pub enum Error {
    /// I/O error (e.g. installing the Ctrl+C handler).
    Io(io::Error),

    /// Configuration error.
    ///
    /// Also returned when the transport refuses to initialize, which is the
    /// only fatal start-up condition.
    Config(ConfigError),

    /// A payload could not be decoded.
    Codec(CodecError),

    /// The request was sent but no response arrived in time.
    Timeout,

    /// Subscription was rejected by the server.
    ///
    /// The client does not retry.
    SubscriptionRejected,

    /// No matching service instance is currently available.
    ServiceUnavailable,

    /// The server answered with a non-OK return code.
    Remote(ReturnCode),

    /// The component was stopped while the operation was pending.
    Stopped,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::Config(e) => write!(f, "Configuration error: {}", e.message),
            Self::Codec(e) => write!(f, "Codec error: {e}"),
            Self::Timeout => write!(f, "Request timed out"),
            Self::SubscriptionRejected => write!(f, "Subscription rejected by server"),
            Self::ServiceUnavailable => write!(f, "Service unavailable"),
            Self::Remote(code) => write!(f, "Service returned error: {code:?}"),
            Self::Stopped => write!(f, "Stopped"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Codec(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<ConfigError> for Error {
    fn from(e: ConfigError) -> Self {
        Self::Config(e)
    }
}

impl From<CodecError> for Error {
    fn from(e: CodecError) -> Self {
        Self::Codec(e)
    }
}

/// Configuration error details
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError {
    pub message: String,
}

impl ConfigError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for ConfigError {}

/// Why a byte sequence could not be decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecError {
    /// Fewer bytes remain than a fixed-size field needs.
    TruncatedInput { needed: usize, remaining: usize },
    /// A length prefix is zero or claims more bytes than remain.
    MalformedLength { length: u32, remaining: usize },
    /// An event payload is shorter than its fixed size.
    ShortPayload { len: usize },
    /// The event's timer tag does not name a known timer.
    UnknownTimerTag(u8),
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TruncatedInput { needed, remaining } => {
                write!(f, "truncated input: need {needed} bytes, {remaining} remain")
            }
            Self::MalformedLength { length, remaining } => {
                write!(f, "malformed length {length} ({remaining} bytes remain)")
            }
            Self::ShortPayload { len } => write!(f, "event payload too short ({len} bytes)"),
            Self::UnknownTimerTag(tag) => write!(f, "unknown timer tag {tag}"),
        }
    }
}

impl std::error::Error for CodecError {}

/// Why the service refused a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestError {
    UnknownProtocolVersion(u8),
    UnknownService(u16),
    WrongInterfaceVersion { got: u8, expected: u8 },
    UnknownInstance(u16),
    UnknownMethod(u16),
    Malformed(CodecError),
}

impl RequestError {
    /// The return code sent back to the caller for this refusal.
    pub fn return_code(&self) -> ReturnCode {
        match self {
            Self::UnknownProtocolVersion(_) => ReturnCode::WrongProtocolVersion,
            Self::UnknownService(_) => ReturnCode::UnknownService,
            Self::WrongInterfaceVersion { .. } => ReturnCode::WrongInterfaceVersion,
            Self::UnknownInstance(_) => ReturnCode::Unknown,
            Self::UnknownMethod(_) => ReturnCode::UnknownMethod,
            Self::Malformed(_) => ReturnCode::MalformedMessage,
        }
    }
}

impl fmt::Display for RequestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownProtocolVersion(v) => write!(f, "unknown protocol version 0x{v:02x}"),
            Self::UnknownService(s) => write!(f, "unknown service 0x{s:04x}"),
            Self::WrongInterfaceVersion { got, expected } => {
                write!(f, "wrong interface version 0x{got:02x}, expected 0x{expected:02x}")
            }
            Self::UnknownInstance(i) => write!(f, "unknown instance 0x{i:04x}"),
            Self::UnknownMethod(m) => write!(f, "unknown method 0x{m:04x}"),
            Self::Malformed(e) => write!(f, "malformed payload: {e}"),
        }
    }
}

impl std::error::Error for RequestError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Malformed(e) => Some(e),
            _ => None,
        }
    }
}

/// A rejected token in a timer specification string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerSpecError {
    /// The offending token, trimmed
    pub token: String,
    pub reason: &'static str,
}

impl fmt::Display for TimerSpecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid timer token '{}': {}", self.token, self.reason)
    }
}

impl std::error::Error for TimerSpecError {}
