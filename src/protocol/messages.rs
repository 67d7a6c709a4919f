//! Responses and notifications
//!
//! Every message starts with the protocol version and ends with the
//! end-of-message tag. The second node decides the message kind:
//! `RSP`/`RSP-BATCH` for responses, `NOTIFICATION` for notifications.

use std::fmt;

use super::error::{ProtocolError, ProtocolResult};
use super::field::Field;
use super::tree::*;
use crate::error::ServerError;

pub const PROTOCOL_VERSION: u64 = 1;

/// A decoded message
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
	Response(Response),
	Notification(Notification),
}

/// Decode a complete message, including its end-of-message tag
pub fn decode_message(input: &[u8]) -> ProtocolResult<Message> {
	let tree = parse_tree(input)?;
	let body = message_body(&tree)?;
	match body[0].tag() {
		Some(TAG_RESPONSE) | Some(TAG_BATCH_RESPONSE) => {
			Ok(Message::Response(Response::from_nodes(body)?))
		}
		Some(TAG_NOTIFICATION) => {
			let raw = RawNotification::from_nodes(&body[1..])?;
			Ok(Message::Notification(Notification::from_raw(&raw)?))
		}
		Some(other) => Err(ProtocolError::not_implemented(format!("message kind '{}'", other))),
		None => Err(ProtocolError::malformed("message kind is not tagged")),
	}
}

/// Checks version and end-of-message, returns the nodes in between
fn message_body(tree: &Tree) -> ProtocolResult<&[Node]> {
	let nodes = &tree.nodes;
	if nodes.len() < 3 {
		return Err(ProtocolError::malformed("message is too short"));
	}
	let version = Field::new(&nodes[0]).as_protocol_version()?;
	if version != PROTOCOL_VERSION {
		return Err(ProtocolError::malformed(format!("unsupported protocol version {}", version)));
	}
	if nodes[nodes.len() - 1].tag() != Some(TAG_END_OF_MESSAGE) {
		return Err(ProtocolError::malformed("missing end of message"));
	}
	Ok(&nodes[1..nodes.len() - 1])
}

// ============================================================================
// RESPONSE
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct Response {
	transaction_id: u64,
	error_code: u64,
	batch: bool,
	fields: Vec<Node>,
}

impl Response {
	fn from_nodes(body: &[Node]) -> ProtocolResult<Self> {
		let header = &body[0];
		let batch = header.tag() == Some(TAG_BATCH_RESPONSE);
		let parts = header.parts();
		if parts.len() != 2 {
			return Err(ProtocolError::malformed(
				"response header must hold transaction id and error code",
			));
		}
		let transaction_id = Field::new(parts[0]).as_transaction_id()?;
		let error_code = Field::new(parts[1]).as_uint()?;
		Ok(Response { transaction_id, error_code, batch, fields: body[1..].to_vec() })
	}

	pub fn transaction_id(&self) -> u64 {
		self.transaction_id
	}

	pub fn error_code(&self) -> u64 {
		self.error_code
	}

	pub fn is_error(&self) -> bool {
		self.error_code != 0
	}

	/// Sent by the server during a batch edit
	pub fn is_batch(&self) -> bool {
		self.batch
	}

	pub fn number_of_fields(&self) -> usize {
		self.fields.len()
	}

	pub fn field(&self, index: usize) -> ProtocolResult<Field<'_>> {
		self.fields.get(index).map(Field::new).ok_or_else(|| {
			ProtocolError::malformed(format!(
				"response has {} fields, field {} requested",
				self.fields.len(),
				index
			))
		})
	}

	pub(crate) fn expect_fields(&self, count: usize, what: &str) -> ProtocolResult<()> {
		if self.fields.len() != count {
			return Err(ProtocolError::malformed(format!(
				"{} response must have {} fields, got {}",
				what,
				count,
				self.fields.len()
			)));
		}
		Ok(())
	}

	/// Turn a server-reported error into a `ServerError` for `operation`
	pub fn check(&self, operation: &str) -> Result<(), ServerError> {
		if self.is_error() {
			return Err(ServerError::new(self.error_code, operation));
		}
		Ok(())
	}
}

// ============================================================================
// NOTIFICATIONS
// ============================================================================

pub const KIND_MODIFIED: &str = "F-MOD";
pub const KIND_INSERTED: &str = "F-INS";
pub const KIND_DELETED: &str = "F-DEL";
pub const KIND_DISCONNECTED: &str = "DISCONNECTED";
pub const KIND_CLOSED: &str = "F-CLOSED";

/// Notification before its kind is interpreted
#[derive(Debug, Clone, PartialEq)]
pub struct RawNotification {
	pub kind: String,
	pub fields: Vec<Node>,
}

impl RawNotification {
	/// `nodes` starts at the kind node. Fields are either nested inside it
	/// (`F-MOD:N:..;U:..;BL:..;;`) or follow it (`F-MOD:;N:..;U:..;BL:..;`).
	fn from_nodes(nodes: &[Node]) -> ProtocolResult<Self> {
		let kind_node =
			nodes.first().ok_or_else(|| ProtocolError::malformed("notification without kind"))?;
		let kind = kind_node
			.tag()
			.ok_or_else(|| ProtocolError::malformed("notification kind is not tagged"))?
			.to_string();
		let nested: Vec<Node> = kind_node.parts().into_iter().cloned().collect();
		let fields = if nested.is_empty() { nodes[1..].to_vec() } else { nested };
		Ok(RawNotification { kind, fields })
	}

	/// Decode only as far as the kind, for kinds this client does not interpret
	pub fn decode(input: &[u8]) -> ProtocolResult<Self> {
		let tree = parse_tree(input)?;
		let body = message_body(&tree)?;
		if body[0].tag() != Some(TAG_NOTIFICATION) {
			return Err(ProtocolError::malformed("message is not a notification"));
		}
		RawNotification::from_nodes(&body[1..])
	}

	pub fn number_of_fields(&self) -> usize {
		self.fields.len()
	}

	pub fn field(&self, index: usize) -> ProtocolResult<Field<'_>> {
		self.fields
			.get(index)
			.map(Field::new)
			.ok_or_else(|| ProtocolError::malformed(format!("notification field {} missing", index)))
	}
}

/// Byte range of a file changed by another client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileChange {
	pub node_id: u64,
	pub revision: u64,
	pub offset: u64,
	pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
	Disconnected { reason: String },
	Modified(FileChange),
	Inserted(FileChange),
	Deleted(FileChange),
	Closed { node_id: u64 },
}

impl Notification {
	pub fn from_raw(raw: &RawNotification) -> ProtocolResult<Self> {
		match raw.kind.as_str() {
			KIND_DISCONNECTED => {
				if raw.number_of_fields() != 1 {
					return Err(ProtocolError::malformed("disconnect notification needs a reason"));
				}
				Ok(Notification::Disconnected { reason: raw.field(0)?.as_string()? })
			}
			KIND_MODIFIED => Ok(Notification::Modified(Self::file_change(raw)?)),
			KIND_INSERTED => Ok(Notification::Inserted(Self::file_change(raw)?)),
			KIND_DELETED => Ok(Notification::Deleted(Self::file_change(raw)?)),
			KIND_CLOSED => {
				if raw.number_of_fields() != 1 {
					return Err(ProtocolError::malformed("close notification needs a node id"));
				}
				Ok(Notification::Closed { node_id: raw.field(0)?.as_node_id()? })
			}
			other => Err(ProtocolError::not_implemented(format!("notification kind '{}'", other))),
		}
	}

	fn file_change(raw: &RawNotification) -> ProtocolResult<FileChange> {
		if raw.number_of_fields() != 3 {
			return Err(ProtocolError::malformed(format!(
				"'{}' notification must have 3 fields, got {}",
				raw.kind,
				raw.number_of_fields()
			)));
		}
		let node_id = raw.field(0)?.as_node_id()?;
		let revision = raw.field(1)?.as_uint()?;
		let (offset, size) = raw.field(2)?.as_block()?;
		Ok(FileChange { node_id, revision, offset, size })
	}

	/// Change carried by modified/inserted/deleted notifications
	pub fn file_change_ref(&self) -> Option<&FileChange> {
		match self {
			Notification::Modified(c) | Notification::Inserted(c) | Notification::Deleted(c) => {
				Some(c)
			}
			_ => None,
		}
	}
}

impl fmt::Display for Notification {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Notification::Disconnected { reason } => write!(f, "disconnected: {}", reason),
			Notification::Modified(c) => {
				write!(f, "modified node={} rev={} [{}+{}]", c.node_id, c.revision, c.offset, c.size)
			}
			Notification::Inserted(c) => {
				write!(f, "inserted node={} rev={} [{}+{}]", c.node_id, c.revision, c.offset, c.size)
			}
			Notification::Deleted(c) => {
				write!(f, "deleted node={} rev={} [{}+{}]", c.node_id, c.revision, c.offset, c.size)
			}
			Notification::Closed { node_id } => write!(f, "closed node={}", node_id),
		}
	}
}


// vim: ts=4
