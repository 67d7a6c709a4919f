//! Request encoding
//!
//! Requests are built front to back into a byte buffer. Each request is
//! `V:1;<TAG>:T:U:<id>;;<fields>;E:;`; the builder writes the prefix on
//! creation and the closing `;E:;` in `finish`.

use crate::types::{AuthorityKind, FileDescriptor, FileType, OpenMode, UserGroupChange};

use super::tree::*;

/// Sent without a transaction and never answered
pub const HEARTBEAT: &[u8] = b"V:1;HB:E:;";

pub const BATCH_OPERATION_DELETE: u64 = 1;
pub const BATCH_OPERATION_INSERT: u64 = 2;
pub const BATCH_OPERATION_WRITE: u64 = 3;

#[derive(Debug, Clone)]
pub struct RequestBuilder {
	buf: Vec<u8>,
}

impl RequestBuilder {
	/// Starts `V:1;<tag>:T:U:<transaction_id>;;`
	pub fn new(tag: &str, transaction_id: u64) -> Self {
		let mut builder = RequestBuilder { buf: Vec::with_capacity(64) };
		builder.buf.extend_from_slice(b"V:1;");
		builder.open(tag);
		builder.transaction(transaction_id)
	}

	fn push_str(&mut self, s: &str) {
		self.buf.extend_from_slice(s.as_bytes());
	}

	fn open(&mut self, tag: &str) {
		self.push_str(tag);
		self.buf.push(b':');
	}

	fn close(&mut self) {
		self.buf.push(b';');
	}

	fn transaction(mut self, transaction_id: u64) -> Self {
		self.open(TAG_TRANSACTION_ID);
		self = self.unsigned(transaction_id);
		self.close();
		self
	}

	pub fn unsigned(mut self, value: u64) -> Self {
		self.push_str(&format!("{}:{};", TAG_UINT, value));
		self
	}

	pub fn node_id(mut self, node_id: u64) -> Self {
		self.open(TAG_NODE_ID);
		self = self.unsigned(node_id);
		self.close();
		self
	}

	pub fn block(mut self, offset: u64, size: u64) -> Self {
		self.open(TAG_BLOCK);
		self = self.unsigned(offset).unsigned(size);
		self.close();
		self
	}

	/// `S:U:<len>;B:<bytes>;;`, length counted in bytes
	pub fn string<B: AsRef<[u8]>>(mut self, content: B) -> Self {
		let content = content.as_ref();
		self.open(TAG_STRING);
		self = self.unsigned(content.len() as u64);
		self.open(TAG_BYTES);
		self.buf.extend_from_slice(content);
		self.close();
		self.close();
		self
	}

	pub fn file_descriptor(mut self, descriptor: &FileDescriptor) -> Self {
		self.open("F");
		self = match descriptor {
			FileDescriptor::NodeId(node_id) => self.node_id(*node_id),
			FileDescriptor::Path(path) => {
				self.open("P");
				let mut inner = self.string(path);
				inner.close();
				inner
			}
		};
		self.close();
		self
	}

	/// Fields written by `f` are nested under `tag`
	pub fn nested<F>(mut self, tag: &str, f: F) -> Self
	where
		F: FnOnce(Self) -> Self,
	{
		self.open(tag);
		let mut inner = f(self);
		inner.close();
		inner
	}

	/// `KVP:S(key)<value>;`
	pub fn key_value<F>(self, key: &str, value: F) -> Self
	where
		F: FnOnce(Self) -> Self,
	{
		self.nested(TAG_KEY_VALUE, |b| value(b.string(key)))
	}

	/// `L:U:<n>;LE:<e>;...;`
	pub fn list<T, F>(mut self, elements: &[T], mut element: F) -> Self
	where
		F: FnMut(Self, &T) -> Self,
	{
		self.open(TAG_LIST);
		self = self.unsigned(elements.len() as u64);
		for e in elements {
			self.open(TAG_LIST_ELEMENT);
			self = element(self, e);
			self.close();
		}
		self.close();
		self
	}

	pub fn finish(mut self) -> Vec<u8> {
		self.close();
		self.push_str("E:;");
		self.buf
	}
}

// ============================================================================
// REQUESTS
// ============================================================================

pub fn authenticate(transaction_id: u64, username: &str, password: &str) -> Vec<u8> {
	RequestBuilder::new("A", transaction_id)
		.nested(TAG_LIST, |b| b.string(username).string(password))
		.finish()
}

pub fn authenticate_with_token(transaction_id: u64, token: &str) -> Vec<u8> {
	RequestBuilder::new("A", transaction_id).nested("TOKEN", |b| b.string(token)).finish()
}

pub fn allocate_authentication_token(transaction_id: u64) -> Vec<u8> {
	RequestBuilder::new("ALLOCATE-AUTH-TOKEN", transaction_id).finish()
}

pub fn create_file(
	transaction_id: u64,
	parent: &FileDescriptor,
	name: &str,
	file_type: FileType,
	block_size: Option<u64>,
) -> Vec<u8> {
	let mut builder = RequestBuilder::new("CREATE-FILE", transaction_id)
		.file_descriptor(parent)
		.string(name)
		.unsigned(file_type.code());
	if let Some(block_size) = block_size {
		builder = builder.unsigned(block_size);
	}
	builder.finish()
}

pub fn create_directory(transaction_id: u64, parent: &FileDescriptor, name: &str) -> Vec<u8> {
	RequestBuilder::new("CREATE-DIRECTORY", transaction_id)
		.file_descriptor(parent)
		.string(name)
		.finish()
}

pub fn delete(transaction_id: u64, descriptor: &FileDescriptor) -> Vec<u8> {
	RequestBuilder::new("DELETE", transaction_id).file_descriptor(descriptor).finish()
}

pub fn open(transaction_id: u64, descriptor: &FileDescriptor, mode: OpenMode) -> Vec<u8> {
	RequestBuilder::new("O", transaction_id)
		.file_descriptor(descriptor)
		.unsigned(mode.code())
		.finish()
}

pub fn close(transaction_id: u64, node_id: u64) -> Vec<u8> {
	RequestBuilder::new("CLOSE", transaction_id).node_id(node_id).finish()
}

pub fn blob_write(
	transaction_id: u64,
	node_id: u64,
	revision: u64,
	size: u64,
	block_size: u64,
) -> Vec<u8> {
	RequestBuilder::new("BLOB-W", transaction_id)
		.node_id(node_id)
		.unsigned(revision)
		.unsigned(size)
		.unsigned(block_size)
		.finish()
}

fn random_access_edit(
	tag: &str,
	transaction_id: u64,
	node_id: u64,
	revision: u64,
	offset: u64,
	size: u64,
) -> Vec<u8> {
	RequestBuilder::new(tag, transaction_id)
		.node_id(node_id)
		.unsigned(revision)
		.block(offset, size)
		.finish()
}

pub fn ra_write(transaction_id: u64, node_id: u64, revision: u64, offset: u64, size: u64) -> Vec<u8> {
	random_access_edit("RA-W", transaction_id, node_id, revision, offset, size)
}

pub fn ra_insert(transaction_id: u64, node_id: u64, revision: u64, offset: u64, size: u64) -> Vec<u8> {
	random_access_edit("RA-I", transaction_id, node_id, revision, offset, size)
}

pub fn ra_delete(transaction_id: u64, node_id: u64, revision: u64, offset: u64, size: u64) -> Vec<u8> {
	random_access_edit("RA-D", transaction_id, node_id, revision, offset, size)
}

pub fn read(transaction_id: u64, node_id: u64, offset: u64, size: u64) -> Vec<u8> {
	RequestBuilder::new("R", transaction_id).node_id(node_id).block(offset, size).finish()
}

pub fn batch_edit(
	transaction_id: u64,
	node_id: u64,
	revision: u64,
	number_of_operations: u64,
) -> Vec<u8> {
	RequestBuilder::new("RA-BATCH-EDIT", transaction_id)
		.node_id(node_id)
		.unsigned(revision)
		.unsigned(number_of_operations)
		.finish()
}

/// Header of one batch operation: `U:<type>;BL:U:<offset>;U:<size>;;E:;`
pub fn batch_operation(operation_type: u64, offset: u64, size: u64) -> Vec<u8> {
	format!(
		"{}:{};{}:{}:{};{}:{};;{}:;",
		TAG_UINT,
		operation_type,
		TAG_BLOCK,
		TAG_UINT,
		offset,
		TAG_UINT,
		size,
		TAG_END_OF_MESSAGE
	)
	.into_bytes()
}

pub fn query_children(transaction_id: u64, descriptor: &FileDescriptor) -> Vec<u8> {
	RequestBuilder::new("Q-FS-C", transaction_id).file_descriptor(descriptor).finish()
}

pub fn query_element(transaction_id: u64, descriptor: &FileDescriptor) -> Vec<u8> {
	RequestBuilder::new("Q-FS-E", transaction_id).file_descriptor(descriptor).finish()
}

pub fn query_element_properties(
	transaction_id: u64,
	descriptor: &FileDescriptor,
	parent: &FileDescriptor,
) -> Vec<u8> {
	RequestBuilder::new("Q-FS-P", transaction_id)
		.file_descriptor(descriptor)
		.file_descriptor(parent)
		.finish()
}

pub fn query_counters(transaction_id: u64) -> Vec<u8> {
	RequestBuilder::new("Q-COUNTERS", transaction_id).finish()
}

pub fn query_system(transaction_id: u64) -> Vec<u8> {
	RequestBuilder::new("Q-SYSTEM", transaction_id).finish()
}

pub fn add_user_group(transaction_id: u64, kind: AuthorityKind, name: &str) -> Vec<u8> {
	RequestBuilder::new("ADD-USER-GROUP", transaction_id)
		.unsigned(kind.code())
		.string(name)
		.finish()
}

pub fn modify_user_group(
	transaction_id: u64,
	kind: AuthorityKind,
	name: &str,
	changes: &[UserGroupChange],
) -> Vec<u8> {
	RequestBuilder::new("MOD-USER-GROUP", transaction_id)
		.unsigned(kind.code())
		.string(name)
		.list(changes, |b, change| match change {
			UserGroupChange::Password(password) => b.key_value("password", |v| v.string(password)),
			UserGroupChange::Expiration(at) => b.key_value("expiration", |v| v.unsigned(*at)),
		})
		.finish()
}

#[cfg(test)]
mod tests {
	use super::*;

	fn text(bytes: Vec<u8>) -> String {
		String::from_utf8(bytes).unwrap()
	}

	#[test]
	fn test_authenticate() {
		assert_eq!(
			text(authenticate(1, "admin", "admin")),
			"V:1;A:T:U:1;;L:S:U:5;B:admin;;S:U:5;B:admin;;;;E:;"
		);
	}

	#[test]
	fn test_file_descriptors() {
		assert_eq!(text(delete(3, &FileDescriptor::NodeId(7))), "V:1;DELETE:T:U:3;;F:N:U:7;;;;E:;");
		assert_eq!(
			text(delete(4, &FileDescriptor::from("/a"))),
			"V:1;DELETE:T:U:4;;F:P:S:U:2;B:/a;;;;;E:;"
		);
	}

	#[test]
	fn test_create_file_optional_block_size() {
		let parent = FileDescriptor::NodeId(1);
		assert_eq!(
			text(create_file(2, &parent, "f", FileType::Blob, None)),
			"V:1;CREATE-FILE:T:U:2;;F:N:U:1;;;S:U:1;B:f;;U:1;;E:;"
		);
		assert_eq!(
			text(create_file(2, &parent, "f", FileType::Blob, Some(1024))),
			"V:1;CREATE-FILE:T:U:2;;F:N:U:1;;;S:U:1;B:f;;U:1;U:1024;;E:;"
		);
	}

	#[test]
	fn test_ra_write() {
		assert_eq!(
			text(ra_write(5, 2, 1, 0, 4)),
			"V:1;RA-W:T:U:5;;N:U:2;;U:1;BL:U:0;U:4;;;E:;"
		);
	}

	#[test]
	fn test_batch_operation_header() {
		assert_eq!(text(batch_operation(BATCH_OPERATION_WRITE, 6, 7)), "U:3;BL:U:6;U:7;;E:;");
	}

	#[test]
	fn test_modify_user_group_list() {
		let req = modify_user_group(
			9,
			AuthorityKind::User,
			"bob",
			&[UserGroupChange::Expiration(0)],
		);
		assert_eq!(
			text(req),
			"V:1;MOD-USER-GROUP:T:U:9;;U:0;S:U:3;B:bob;;L:U:1;LE:KVP:S:U:10;B:expiration;;U:0;;;;;E:;"
		);
	}

	#[test]
	fn test_string_with_delimiters_decodes() {
		let req = RequestBuilder::new("Q", 1).string("a;b:c").finish();
		let tree = parse_tree(&req).unwrap();
		let field = super::super::field::Field::new(&tree.nodes[1].children()[1]);
		assert_eq!(field.as_string().unwrap(), "a;b:c");
	}
}

// vim: ts=4
