//! Error types for Zyn client operations

use std::error::Error;
use std::fmt;
use std::io;
use std::time::Duration;

use crate::protocol::error::ProtocolError;
use crate::protocol::error_codes;

/// Main error type for client operations
#[derive(Debug)]
pub enum ClientError {
	/// Both the local copy and the remote file changed since the last sync
	UnresolvedConflict { path: String },

	/// Path is not tracked by this client
	NotTracked { path: String },

	/// Path is already tracked by this client
	AlreadyTracked { path: String },

	/// Parent directory of a path is not tracked
	ParentNotTracked { path: String },

	/// Tracked element is missing from the local data directory
	LocalMissing { path: String },

	/// Tracked element no longer exists on the server
	RemoteMissing { path: String },

	/// Local copy exists and overwriting was not requested
	LocalExists { path: String },

	/// Remote path is malformed
	InvalidPath { path: String, message: String },

	/// Server rejected an edit because the file moved past the local revision
	RevisionTooOld { path: String, local: u64, remote: u64 },

	/// Directory still has tracked children
	DirectoryHasTrackedChildren { path: String },

	/// Caller passed an unusable argument
	InvalidArgument { message: String },

	/// Invalid configuration
	InvalidConfig { message: String },

	/// Connection error (nested)
	Connection(ConnectionError),

	/// Server-reported error (nested)
	Server(ServerError),

	/// Protocol error (nested)
	Protocol(ProtocolError),

	/// State error (nested)
	State(StateError),

	/// I/O error
	Io(io::Error),
}

impl ClientError {
	pub fn invalid_argument<S: Into<String>>(message: S) -> Self {
		ClientError::InvalidArgument { message: message.into() }
	}

	/// Server error code, if the server reported the failure
	pub fn server_code(&self) -> Option<u64> {
		match self {
			ClientError::Server(e) => Some(e.code),
			_ => None,
		}
	}
}

impl fmt::Display for ClientError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			ClientError::UnresolvedConflict { path } => {
				write!(f, "Conflict: both local and remote file changed: {}", path)
			}
			ClientError::NotTracked { path } => write!(f, "Not tracked: {}", path),
			ClientError::AlreadyTracked { path } => write!(f, "Already tracked: {}", path),
			ClientError::ParentNotTracked { path } => {
				write!(f, "Parent directory is not tracked: {}", path)
			}
			ClientError::LocalMissing { path } => {
				write!(f, "Local copy does not exist: {}", path)
			}
			ClientError::RemoteMissing { path } => {
				write!(f, "Element does not exist on the server: {}", path)
			}
			ClientError::LocalExists { path } => {
				write!(f, "Local copy already exists, not overwriting: {}", path)
			}
			ClientError::InvalidPath { path, message } => {
				write!(f, "Invalid path '{}': {}", path, message)
			}
			ClientError::RevisionTooOld { path, local, remote } => write!(
				f,
				"Remote file changed during edit: {} (local revision {}, remote revision {})",
				path, local, remote
			),
			ClientError::DirectoryHasTrackedChildren { path } => {
				write!(f, "Directory has tracked children: {}", path)
			}
			ClientError::InvalidArgument { message } => write!(f, "Invalid argument: {}", message),
			ClientError::InvalidConfig { message } => {
				write!(f, "Invalid configuration: {}", message)
			}
			ClientError::Connection(e) => write!(f, "Connection error: {}", e),
			ClientError::Server(e) => write!(f, "Server error: {}", e),
			ClientError::Protocol(e) => write!(f, "Protocol error: {}", e),
			ClientError::State(e) => write!(f, "State error: {}", e),
			ClientError::Io(e) => write!(f, "I/O error: {}", e),
		}
	}
}

impl Error for ClientError {
	fn source(&self) -> Option<&(dyn Error + 'static)> {
		match self {
			ClientError::Connection(e) => Some(e),
			ClientError::Server(e) => Some(e),
			ClientError::Protocol(e) => Some(e),
			ClientError::State(e) => Some(e),
			ClientError::Io(e) => Some(e),
			_ => None,
		}
	}
}

impl From<io::Error> for ClientError {
	fn from(e: io::Error) -> Self {
		ClientError::Io(e)
	}
}

impl From<ConnectionError> for ClientError {
	fn from(e: ConnectionError) -> Self {
		ClientError::Connection(e)
	}
}

impl From<ServerError> for ClientError {
	fn from(e: ServerError) -> Self {
		ClientError::Server(e)
	}
}

impl From<ProtocolError> for ClientError {
	fn from(e: ProtocolError) -> Self {
		ClientError::Protocol(e)
	}
}

impl From<StateError> for ClientError {
	fn from(e: StateError) -> Self {
		ClientError::State(e)
	}
}

/// Result type for client operations
pub type ClientResult<T> = Result<T, ClientError>;

/// Transport and framing errors
#[derive(Debug)]
pub enum ConnectionError {
	/// Peer closed the stream
	ConnectionLost,

	/// No complete message within the bound
	Timeout { waited: Duration },

	/// Socket I/O failed
	Io(io::Error),

	/// A message arrived where a different kind was expected
	UnexpectedMessage { message: String },

	/// Message could not be decoded
	Protocol(ProtocolError),

	/// Streamed upload did not match its announced size
	SizeMismatch { expected: u64, sent: u64 },
}

impl fmt::Display for ConnectionError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			ConnectionError::ConnectionLost => write!(f, "Connection lost"),
			ConnectionError::Timeout { waited } => {
				write!(f, "Timeout after {:.1}s", waited.as_secs_f64())
			}
			ConnectionError::Io(e) => write!(f, "I/O error: {}", e),
			ConnectionError::UnexpectedMessage { message } => {
				write!(f, "Unexpected message: {}", message)
			}
			ConnectionError::Protocol(e) => write!(f, "{}", e),
			ConnectionError::SizeMismatch { expected, sent } => {
				write!(f, "Sent {} bytes, announced {}", sent, expected)
			}
		}
	}
}

impl Error for ConnectionError {
	fn source(&self) -> Option<&(dyn Error + 'static)> {
		match self {
			ConnectionError::Io(e) => Some(e),
			ConnectionError::Protocol(e) => Some(e),
			_ => None,
		}
	}
}

impl From<io::Error> for ConnectionError {
	fn from(e: io::Error) -> Self {
		ConnectionError::Io(e)
	}
}

impl From<ProtocolError> for ConnectionError {
	fn from(e: ProtocolError) -> Self {
		ConnectionError::Protocol(e)
	}
}

/// Result type for connection operations
pub type ConnectionResult<T> = Result<T, ConnectionError>;

/// Error code reported by the server in a response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerError {
	pub code: u64,
	pub operation: String,
	pub path: Option<String>,
	/// Zero-based index of the rejected batch operation
	pub operation_index: Option<u64>,
	pub revision: Option<u64>,
}

impl ServerError {
	pub fn new<S: Into<String>>(code: u64, operation: S) -> Self {
		ServerError {
			code,
			operation: operation.into(),
			path: None,
			operation_index: None,
			revision: None,
		}
	}

	pub fn with_path<S: Into<String>>(mut self, path: S) -> Self {
		self.path = Some(path.into());
		self
	}

	pub fn with_operation_index(mut self, index: u64) -> Self {
		self.operation_index = Some(index);
		self
	}

	pub fn with_revision(mut self, revision: u64) -> Self {
		self.revision = Some(revision);
		self
	}

	pub fn description(&self) -> String {
		error_codes::describe_or_unknown(self.code)
	}
}

impl fmt::Display for ServerError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{} failed: {} ({})", self.operation, self.description(), self.code)?;
		if let Some(path) = &self.path {
			write!(f, ", path: {}", path)?;
		}
		if let Some(index) = self.operation_index {
			write!(f, ", operation index: {}", index)?;
		}
		if let Some(revision) = self.revision {
			write!(f, ", revision: {}", revision)?;
		}
		Ok(())
	}
}

impl Error for ServerError {}

/// State management errors
#[derive(Debug)]
pub enum StateError {
	/// Failed to load state
	LoadFailed { source: Box<dyn Error + Send + Sync> },

	/// Failed to save state
	SaveFailed { source: Box<dyn Error + Send + Sync> },

	/// Lock acquisition failed
	LockFailed { message: String },

	/// State file is corrupted
	Corrupted { message: String },

	/// State file was written by an incompatible version
	UnsupportedFormat { found: u64, expected: u64 },
}

impl fmt::Display for StateError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			StateError::LoadFailed { source } => write!(f, "Failed to load state: {}", source),
			StateError::SaveFailed { source } => write!(f, "Failed to save state: {}", source),
			StateError::LockFailed { message } => write!(f, "Lock failed: {}", message),
			StateError::Corrupted { message } => write!(f, "State corrupted: {}", message),
			StateError::UnsupportedFormat { found, expected } => {
				write!(f, "Unsupported state format {}, expected {}", found, expected)
			}
		}
	}
}

impl Error for StateError {
	fn source(&self) -> Option<&(dyn Error + 'static)> {
		match self {
			StateError::LoadFailed { source } | StateError::SaveFailed { source } => Some(&**source),
			_ => None,
		}
	}
}


// vim: ts=4
