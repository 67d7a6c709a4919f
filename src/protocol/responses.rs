//! Typed views over successful responses
//!
//! Each view checks the number and tags of the fields it reads and fails
//! with a malformed-message error when the server sent a different shape.

use std::collections::BTreeMap;
use std::convert::TryFrom;

use super::error::{ProtocolError, ProtocolResult};
use super::field::{Field, ListElement};
use super::messages::Response;
use super::tree::{TAG_TIMESTAMP, TAG_UINT};
use crate::types::{Authority, ElementType, FileType};

/// CREATE-FILE and CREATE-DIRECTORY
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreateResponse {
	pub node_id: u64,
	pub revision: Option<u64>,
}

impl TryFrom<&Response> for CreateResponse {
	type Error = ProtocolError;

	fn try_from(rsp: &Response) -> ProtocolResult<Self> {
		match rsp.number_of_fields() {
			1 => Ok(CreateResponse { node_id: rsp.field(0)?.as_node_id()?, revision: None }),
			2 => Ok(CreateResponse {
				node_id: rsp.field(0)?.as_node_id()?,
				revision: Some(rsp.field(1)?.as_uint()?),
			}),
			n => Err(ProtocolError::malformed(format!("create response has {} fields", n))),
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenResponse {
	pub node_id: u64,
	pub revision: u64,
	pub size: u64,
	pub block_size: u64,
	pub file_type: FileType,
}

impl TryFrom<&Response> for OpenResponse {
	type Error = ProtocolError;

	fn try_from(rsp: &Response) -> ProtocolResult<Self> {
		rsp.expect_fields(5, "open")?;
		Ok(OpenResponse {
			node_id: rsp.field(0)?.as_node_id()?,
			revision: rsp.field(1)?.as_uint()?,
			size: rsp.field(2)?.as_uint()?,
			block_size: rsp.field(3)?.as_uint()?,
			file_type: FileType::from_code(rsp.field(4)?.as_uint()?)?,
		})
	}
}

/// Final response of writes, inserts and deletes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RevisionResponse {
	pub revision: u64,
}

impl TryFrom<&Response> for RevisionResponse {
	type Error = ProtocolError;

	fn try_from(rsp: &Response) -> ProtocolResult<Self> {
		rsp.expect_fields(1, "edit")?;
		Ok(RevisionResponse { revision: rsp.field(0)?.as_uint()? })
	}
}

/// Header of a read; `size` raw bytes follow on the stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadResponse {
	pub revision: u64,
	pub offset: u64,
	pub size: u64,
}

impl TryFrom<&Response> for ReadResponse {
	type Error = ProtocolError;

	fn try_from(rsp: &Response) -> ProtocolResult<Self> {
		rsp.expect_fields(2, "read")?;
		let revision = rsp.field(0)?.as_uint()?;
		let (offset, size) = rsp.field(1)?.as_block()?;
		Ok(ReadResponse { revision, offset, size })
	}
}

/// Per-operation answer inside a batch edit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchEditResponse {
	pub operation_index: u64,
	pub revision: u64,
}

impl TryFrom<&Response> for BatchEditResponse {
	type Error = ProtocolError;

	fn try_from(rsp: &Response) -> ProtocolResult<Self> {
		if !rsp.is_batch() {
			return Err(ProtocolError::malformed("expected a batch response"));
		}
		rsp.expect_fields(2, "batch edit")?;
		Ok(BatchEditResponse {
			operation_index: rsp.field(0)?.as_uint()?,
			revision: rsp.field(1)?.as_uint()?,
		})
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocateTokenResponse {
	pub token: String,
}

impl TryFrom<&Response> for AllocateTokenResponse {
	type Error = ProtocolError;

	fn try_from(rsp: &Response) -> ProtocolResult<Self> {
		rsp.expect_fields(1, "allocate token")?;
		Ok(AllocateTokenResponse { token: rsp.field(0)?.as_string()? })
	}
}

// ============================================================================
// FILESYSTEM QUERIES
// ============================================================================

/// One entry of a Q-FS-C listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteChild {
	File {
		name: String,
		node_id: u64,
		revision: u64,
		file_type: FileType,
		size: u64,
		is_open: bool,
	},
	Directory {
		name: String,
		node_id: u64,
		read: Authority,
		write: Authority,
	},
}

impl RemoteChild {
	pub fn name(&self) -> &str {
		match self {
			RemoteChild::File { name, .. } | RemoteChild::Directory { name, .. } => name,
		}
	}

	pub fn node_id(&self) -> u64 {
		match self {
			RemoteChild::File { node_id, .. } | RemoteChild::Directory { node_id, .. } => *node_id,
		}
	}

	pub fn is_directory(&self) -> bool {
		matches!(self, RemoteChild::Directory { .. })
	}

	fn from_element(element: &ListElement<'_>) -> ProtocolResult<Self> {
		let fields = element.fields();
		let field = |i: usize| {
			fields.get(i).copied().ok_or_else(|| {
				ProtocolError::malformed(format!("child description is missing field {}", i))
			})
		};
		match ElementType::from_code(field(0)?.as_uint()?)? {
			ElementType::File => {
				if fields.len() != 7 {
					return Err(ProtocolError::malformed("file description must have 7 fields"));
				}
				Ok(RemoteChild::File {
					name: field(1)?.as_string()?,
					node_id: field(2)?.as_node_id()?,
					revision: field(3)?.as_uint()?,
					file_type: FileType::from_code(field(4)?.as_uint()?)?,
					size: field(5)?.as_uint()?,
					is_open: field(6)?.as_uint()? == 1,
				})
			}
			ElementType::Directory => {
				if fields.len() != 5 {
					return Err(ProtocolError::malformed("directory description must have 5 fields"));
				}
				Ok(RemoteChild::Directory {
					name: field(1)?.as_string()?,
					node_id: field(2)?.as_node_id()?,
					read: field(3)?.as_authority()?,
					write: field(4)?.as_authority()?,
				})
			}
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildrenResponse {
	pub elements: Vec<RemoteChild>,
}

impl TryFrom<&Response> for ChildrenResponse {
	type Error = ProtocolError;

	fn try_from(rsp: &Response) -> ProtocolResult<Self> {
		rsp.expect_fields(1, "query children")?;
		let elements = rsp
			.field(0)?
			.as_list()?
			.iter()
			.map(RemoteChild::from_element)
			.collect::<ProtocolResult<Vec<_>>>()?;
		Ok(ChildrenResponse { elements })
	}
}

/// Older servers send timestamps as plain unsigned values
fn uint_or_timestamp(field: Field<'_>) -> ProtocolResult<u64> {
	match field.tag() {
		Some(TAG_TIMESTAMP) => field.as_timestamp(),
		Some(TAG_UINT) => field.as_uint(),
		_ => Err(ProtocolError::malformed("expected an unsigned or timestamp value")),
	}
}

fn lookup<'m, 'a>(
	map: &'m BTreeMap<String, Field<'a>>,
	key: &str,
) -> ProtocolResult<Field<'a>> {
	map.get(key)
		.copied()
		.ok_or_else(|| ProtocolError::malformed(format!("missing key '{}'", key)))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElementDetails {
	File {
		created_by: Authority,
		modified_by: Authority,
		read_access: Authority,
		write_access: Authority,
		block_size: u64,
		size: u64,
		revision: u64,
		file_type: FileType,
	},
	Directory {
		read_access: Authority,
		write_access: Authority,
	},
}

/// Q-FS-E: full description of one element
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElementDescription {
	pub node_id: u64,
	pub created_at: u64,
	pub modified_at: u64,
	pub details: ElementDetails,
}

impl ElementDescription {
	pub fn is_file(&self) -> bool {
		matches!(self.details, ElementDetails::File { .. })
	}

	pub fn revision(&self) -> Option<u64> {
		match &self.details {
			ElementDetails::File { revision, .. } => Some(*revision),
			ElementDetails::Directory { .. } => None,
		}
	}

	pub fn file_type(&self) -> Option<FileType> {
		match &self.details {
			ElementDetails::File { file_type, .. } => Some(*file_type),
			ElementDetails::Directory { .. } => None,
		}
	}
}

impl TryFrom<&Response> for ElementDescription {
	type Error = ProtocolError;

	fn try_from(rsp: &Response) -> ProtocolResult<Self> {
		rsp.expect_fields(1, "query element")?;
		let field = rsp.field(0)?;
		let desc = field.key_value_list_to_map()?;
		let element_type = ElementType::from_code(lookup(&desc, "type")?.as_uint()?)?;
		let details = match element_type {
			ElementType::File => ElementDetails::File {
				created_by: lookup(&desc, "created-by")?.as_authority()?,
				modified_by: lookup(&desc, "modified-by")?.as_authority()?,
				read_access: lookup(&desc, "parent-read-authority")?.as_authority()?,
				write_access: lookup(&desc, "parent-write-authority")?.as_authority()?,
				block_size: lookup(&desc, "page-size")?.as_uint()?,
				size: lookup(&desc, "size")?.as_uint()?,
				revision: lookup(&desc, "revision")?.as_uint()?,
				file_type: FileType::from_code(lookup(&desc, "file-type")?.as_uint()?)?,
			},
			ElementType::Directory => ElementDetails::Directory {
				read_access: lookup(&desc, "read-authority")?.as_authority()?,
				write_access: lookup(&desc, "write-authority")?.as_authority()?,
			},
		};
		Ok(ElementDescription {
			node_id: lookup(&desc, "node-id")?.as_uint()?,
			created_at: uint_or_timestamp(lookup(&desc, "created-at")?)?,
			modified_at: uint_or_timestamp(lookup(&desc, "modified-at")?)?,
			details,
		})
	}
}

/// Q-FS-P: element properties as seen from its parent
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElementProperties {
	File { name: String, node_id: u64, revision: u64, size: u64, file_type: FileType },
	Directory { name: String, node_id: u64 },
}

impl TryFrom<&Response> for ElementProperties {
	type Error = ProtocolError;

	fn try_from(rsp: &Response) -> ProtocolResult<Self> {
		match ElementType::from_code(rsp.field(0)?.as_uint()?)? {
			ElementType::File => {
				rsp.expect_fields(6, "file properties")?;
				Ok(ElementProperties::File {
					name: rsp.field(1)?.as_string()?,
					node_id: rsp.field(2)?.as_node_id()?,
					revision: rsp.field(3)?.as_uint()?,
					size: rsp.field(4)?.as_uint()?,
					file_type: FileType::from_code(rsp.field(5)?.as_uint()?)?,
				})
			}
			ElementType::Directory => {
				rsp.expect_fields(3, "directory properties")?;
				Ok(ElementProperties::Directory {
					name: rsp.field(1)?.as_string()?,
					node_id: rsp.field(2)?.as_node_id()?,
				})
			}
		}
	}
}

// ============================================================================
// SERVER QUERIES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CountersResponse {
	pub active_connections: u64,
	pub number_of_files: u64,
	pub number_of_open_files: u64,
}

impl TryFrom<&Response> for CountersResponse {
	type Error = ProtocolError;

	fn try_from(rsp: &Response) -> ProtocolResult<Self> {
		rsp.expect_fields(1, "query counters")?;
		let field = rsp.field(0)?;
		let desc = field.key_value_list_to_map()?;
		if desc.len() != 3 {
			return Err(ProtocolError::malformed(format!("expected 3 counters, got {}", desc.len())));
		}
		Ok(CountersResponse {
			active_connections: lookup(&desc, "active-connections")?.as_uint()?,
			number_of_files: lookup(&desc, "number-of-files")?.as_uint()?,
			number_of_open_files: lookup(&desc, "number-of-open-files")?.as_uint()?,
		})
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemResponse {
	pub started_at: u64,
	pub server_id: u64,
	pub max_open_files_per_connection: u64,
	pub number_of_open_files: u64,
	/// Only sent to administrators
	pub is_admin: Option<String>,
}

impl TryFrom<&Response> for SystemResponse {
	type Error = ProtocolError;

	fn try_from(rsp: &Response) -> ProtocolResult<Self> {
		rsp.expect_fields(1, "query system")?;
		let field = rsp.field(0)?;
		let desc = field.key_value_list_to_map()?;
		let is_admin = match desc.len() {
			4 => None,
			5 => Some(lookup(&desc, "is-admin")?.as_string()?),
			n => {
				return Err(ProtocolError::malformed(format!(
					"system description has {} entries",
					n
				)))
			}
		};
		Ok(SystemResponse {
			started_at: lookup(&desc, "started-at")?.as_timestamp()?,
			server_id: lookup(&desc, "server-id")?.as_uint()?,
			max_open_files_per_connection: lookup(
				&desc,
				"max-number-of-open-files-per-connection",
			)?
			.as_uint()?,
			number_of_open_files: lookup(&desc, "number-of-open-files")?.as_uint()?,
			is_admin,
		})
	}
}


// vim: ts=4
