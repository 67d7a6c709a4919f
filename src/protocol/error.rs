//! Protocol error types
//!
//! Decoding failures are split in two: structural violations of the wire
//! grammar, and well-formed messages whose shape this client does not know.

use std::fmt;

/// Protocol error type
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
	/// Structural violation of the wire grammar, or a field read with the wrong accessor
	MalformedMessage { reason: String },
	/// Well-formed message of an unknown kind
	NotImplemented { what: String },
}

/// Result type for decoding operations
pub type ProtocolResult<T> = Result<T, ProtocolError>;

impl ProtocolError {
	pub fn malformed<S: Into<String>>(reason: S) -> Self {
		ProtocolError::MalformedMessage { reason: reason.into() }
	}

	pub fn not_implemented<S: Into<String>>(what: S) -> Self {
		ProtocolError::NotImplemented { what: what.into() }
	}

	pub fn is_malformed(&self) -> bool {
		matches!(self, ProtocolError::MalformedMessage { .. })
	}
}

impl fmt::Display for ProtocolError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			ProtocolError::MalformedMessage { reason } => write!(f, "Malformed message: {}", reason),
			ProtocolError::NotImplemented { what } => write!(f, "Not implemented: {}", what),
		}
	}
}

impl std::error::Error for ProtocolError {}

impl From<std::str::Utf8Error> for ProtocolError {
	fn from(e: std::str::Utf8Error) -> Self {
		ProtocolError::malformed(format!("invalid UTF-8: {}", e))
	}
}

impl From<std::string::FromUtf8Error> for ProtocolError {
	fn from(e: std::string::FromUtf8Error) -> Self {
		ProtocolError::malformed(format!("invalid UTF-8: {}", e))
	}
}

// vim: ts=4
