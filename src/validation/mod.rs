//! Input checks shared by the CLI and the client
//!
//! Settings are checked once after the configuration layers are merged.
//! Remote paths are checked whenever a user supplied path enters the
//! client.

use std::error::Error;
use std::fmt;

pub mod config;
pub mod path;

pub use config::*;
pub use path::*;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
	/// A configuration value is out of range
	Setting { name: &'static str, reason: String },
	/// A remote path cannot be used as given
	RemotePath { path: String, reason: &'static str },
}

impl fmt::Display for ValidationError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			ValidationError::Setting { name, reason } => write!(f, "setting `{}` {}", name, reason),
			ValidationError::RemotePath { path, reason } => {
				write!(f, "remote path \"{}\" {}", path, reason)
			}
		}
	}
}

impl Error for ValidationError {}

/// Implemented by settings that can be rejected before connecting
pub trait Validator {
	fn validate(&self) -> Result<(), ValidationError>;
}


// vim: ts=4
