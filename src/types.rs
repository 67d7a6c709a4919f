//! Shared protocol-level value types

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::protocol::error::{ProtocolError, ProtocolResult};

/// Kind of a remote file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FileType {
	/// Supports partial writes, inserts and deletes at any offset
	RandomAccess,
	/// Only whole-content, block-sequential rewrites
	Blob,
}

impl FileType {
	pub fn code(self) -> u64 {
		match self {
			FileType::RandomAccess => 0,
			FileType::Blob => 1,
		}
	}

	pub fn from_code(code: u64) -> ProtocolResult<Self> {
		match code {
			0 => Ok(FileType::RandomAccess),
			1 => Ok(FileType::Blob),
			other => Err(ProtocolError::malformed(format!("unknown file type {}", other))),
		}
	}
}

impl fmt::Display for FileType {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			FileType::RandomAccess => write!(f, "random-access"),
			FileType::Blob => write!(f, "blob"),
		}
	}
}

/// Kind of a remote filesystem element
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementType {
	File,
	Directory,
}

impl ElementType {
	pub fn from_code(code: u64) -> ProtocolResult<Self> {
		match code {
			0 => Ok(ElementType::File),
			1 => Ok(ElementType::Directory),
			other => Err(ProtocolError::malformed(format!("unknown element type {}", other))),
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
	Read,
	Write,
}

impl OpenMode {
	pub fn code(self) -> u64 {
		match self {
			OpenMode::Read => 0,
			OpenMode::Write => 1,
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthorityKind {
	User,
	Group,
}

impl AuthorityKind {
	pub fn code(self) -> u64 {
		match self {
			AuthorityKind::User => 0,
			AuthorityKind::Group => 1,
		}
	}

	pub fn from_code(code: u64) -> ProtocolResult<Self> {
		match code {
			0 => Ok(AuthorityKind::User),
			1 => Ok(AuthorityKind::Group),
			other => Err(ProtocolError::malformed(format!("unknown authority type {}", other))),
		}
	}
}

/// A principal: user or group
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authority {
	pub kind: AuthorityKind,
	pub name: String,
}

impl fmt::Display for Authority {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self.kind {
			AuthorityKind::User => write!(f, "USER:{}", self.name),
			AuthorityKind::Group => write!(f, "GROUP:{}", self.name),
		}
	}
}

/// Addresses a remote element either by node id or by absolute path
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileDescriptor {
	NodeId(u64),
	Path(String),
}

impl From<u64> for FileDescriptor {
	fn from(node_id: u64) -> Self {
		FileDescriptor::NodeId(node_id)
	}
}

impl From<&str> for FileDescriptor {
	fn from(path: &str) -> Self {
		FileDescriptor::Path(path.to_string())
	}
}

impl fmt::Display for FileDescriptor {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			FileDescriptor::NodeId(id) => write!(f, "node {}", id),
			FileDescriptor::Path(path) => write!(f, "{}", path),
		}
	}
}

/// Attribute change for MOD-USER-GROUP
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserGroupChange {
	Password(String),
	/// Expiration timestamp, 0 means never
	Expiration(u64),
}

pub const EXPIRATION_NEVER_EXPIRE: u64 = 0;


// vim: ts=4
