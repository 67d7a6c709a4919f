//! In-memory Zyn server for integration tests
//!
//! Speaks the wire protocol over `tokio::io::duplex` pipes. Every
//! connection gets its own session task; the filesystem, revisions and the
//! set of open files are shared, so edits through one connection fan out
//! as notifications to the others.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use filetime::FileTime;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;

use zyn::connection::{Connection, Timeouts};
use zyn::filesystem::LocalFilesystem;
use zyn::protocol::error_codes::*;
use zyn::protocol::{parse_tree, Field, Node, Tree};
use zyn::state::ClientState;
use zyn::sync::ZynClient;
use zyn::types::FileType;

pub const USERNAME: &str = "admin";
pub const PASSWORD: &str = "admin";
pub const SERVER_ID: u64 = 7;
pub const STARTED_AT: u64 = 1500000000;

const ROOT: u64 = 0;
const PARENT_IS_NOT_DIRECTORY: u64 = 206;
const NODE_IS_NOT_FILE: u64 = 207;
const NODE_IS_NOT_DIRECTORY: u64 = 208;

const BATCH_DELETE: u64 = 1;
const BATCH_INSERT: u64 = 2;
const BATCH_WRITE: u64 = 3;

const MUTATING_REQUESTS: &[&str] = &[
	"CREATE-FILE",
	"CREATE-DIRECTORY",
	"DELETE",
	"RA-W",
	"RA-I",
	"RA-D",
	"BLOB-W",
	"RA-BATCH-EDIT",
	"ADD-USER-GROUP",
	"MOD-USER-GROUP",
];

pub fn test_timeouts() -> Timeouts {
	Timeouts {
		response: Duration::from_secs(5),
		data: Duration::from_secs(5),
		block: Duration::from_secs(5),
		batch: Duration::from_secs(5),
		heartbeat_interval: Duration::from_secs(60),
	}
}

// ============================================================================
// ENCODING
// ============================================================================

fn uint(value: u64) -> String {
	format!("U:{};", value)
}

fn node(id: u64) -> String {
	format!("N:U:{};;", id)
}

fn string(s: &str) -> String {
	format!("S:U:{};B:{};;", s.len(), s)
}

fn block(offset: u64, size: u64) -> String {
	format!("BL:U:{};U:{};;", offset, size)
}

fn timestamp(value: u64) -> String {
	format!("TS:{};", value)
}

fn admin() -> String {
	format!("AUTHORITY:U:0;{};", string(USERNAME))
}

fn list(elements: &[String]) -> String {
	let mut out = format!("L:U:{};", elements.len());
	for element in elements {
		out.push_str(&format!("LE:{};", element));
	}
	out.push(';');
	out
}

fn kvp(key: &str, value: String) -> String {
	format!("KVP:{}{};", string(key), value)
}

fn response(transaction_id: u64, code: u64, fields: &str) -> Vec<u8> {
	format!("V:1;RSP:T:U:{};;U:{};;{}E:;", transaction_id, code, fields).into_bytes()
}

fn batch_response(transaction_id: u64, code: u64, index: u64, revision: u64) -> Vec<u8> {
	format!(
		"V:1;RSP-BATCH:T:U:{};;U:{};;{}{}E:;",
		transaction_id,
		code,
		uint(index),
		uint(revision)
	)
	.into_bytes()
}

fn change_notification(kind: &str, node_id: u64, revision: u64, offset: u64, size: u64) -> Vec<u8> {
	format!(
		"V:1;NOTIFICATION:;{}:;{}{}{}E:;",
		kind,
		node(node_id),
		uint(revision),
		block(offset, size)
	)
	.into_bytes()
}

fn disconnected_notification(reason: &str) -> Vec<u8> {
	format!("V:1;NOTIFICATION:;DISCONNECTED:;{}E:;", string(reason)).into_bytes()
}

// ============================================================================
// REQUEST DECODING
// ============================================================================

enum Target {
	Node(u64),
	Path(String),
}

struct Request<'a> {
	tag: &'a str,
	transaction_id: u64,
	args: Vec<&'a Node>,
}

impl<'a> Request<'a> {
	fn parse(tree: &'a Tree) -> Option<Self> {
		let body = tree.nodes.get(1)?;
		let tag = body.tag()?;
		let parts = body.parts();
		let transaction_id = Field::new(parts.first()?).as_transaction_id().ok()?;
		Some(Request { tag, transaction_id, args: parts[1..].to_vec() })
	}

	fn field(&self, index: usize) -> Result<Field<'a>, u64> {
		self.args.get(index).map(|n| Field::new(*n)).ok_or(MALFORMED_MESSAGE)
	}

	fn uint(&self, index: usize) -> Result<u64, u64> {
		self.field(index)?.as_uint().map_err(|_| MALFORMED_MESSAGE)
	}

	fn node_id(&self, index: usize) -> Result<u64, u64> {
		self.field(index)?.as_node_id().map_err(|_| MALFORMED_MESSAGE)
	}

	fn string(&self, index: usize) -> Result<String, u64> {
		self.field(index)?.as_string().map_err(|_| MALFORMED_MESSAGE)
	}

	fn block(&self, index: usize) -> Result<(u64, u64), u64> {
		self.field(index)?.as_block().map_err(|_| MALFORMED_MESSAGE)
	}

	fn target(&self, index: usize) -> Result<Target, u64> {
		let descriptor = self.args.get(index).ok_or(MALFORMED_MESSAGE)?;
		if descriptor.tag() != Some("F") {
			return Err(MALFORMED_MESSAGE);
		}
		let parts = descriptor.parts();
		let inner = parts.first().ok_or(MALFORMED_MESSAGE)?;
		match inner.tag() {
			Some("N") => Ok(Target::Node(Field::new(inner).as_node_id().map_err(|_| MALFORMED_MESSAGE)?)),
			Some("P") => {
				let path = inner.parts();
				let path = path.first().ok_or(MALFORMED_MESSAGE)?;
				Ok(Target::Path(Field::new(path).as_string().map_err(|_| MALFORMED_MESSAGE)?))
			}
			_ => Err(MALFORMED_MESSAGE),
		}
	}
}

/// Drain one `...E:;` frame from the front of `buffer`
fn take_frame(buffer: &mut Vec<u8>) -> Option<Vec<u8>> {
	let end = buffer.windows(3).position(|w| w == b"E:;")? + 3;
	Some(buffer.drain(..end).collect())
}

// ============================================================================
// SERVER STATE
// ============================================================================

#[derive(Debug, Clone)]
enum Entry {
	File { file_type: FileType, revision: u64, content: Vec<u8>, block_size: u64 },
	Directory { children: BTreeMap<String, u64> },
}

#[derive(Debug, Clone)]
struct ServerNode {
	name: String,
	parent: Option<u64>,
	entry: Entry,
}

struct SessionHandle {
	notifications: mpsc::UnboundedSender<Vec<u8>>,
	/// Node id to write mode
	open: BTreeMap<u64, bool>,
}

struct ServerState {
	nodes: BTreeMap<u64, ServerNode>,
	next_node_id: u64,
	server_id: u64,
	started_at: u64,
	default_block_size: u64,
	sessions: BTreeMap<u64, SessionHandle>,
	next_session_id: u64,
	heartbeats: u64,
	mutating_requests: u64,
}

/// Response fields, raw bytes after the response and the next session stage
struct Reply {
	fields: String,
	trailer: Vec<u8>,
	stage: Stage,
}

impl Reply {
	fn fields<S: Into<String>>(fields: S) -> Self {
		Reply { fields: fields.into(), trailer: Vec::new(), stage: Stage::Idle }
	}

	fn empty() -> Self {
		Reply::fields("")
	}
}

fn root_node() -> ServerNode {
	ServerNode { name: String::new(), parent: None, entry: Entry::Directory { children: BTreeMap::new() } }
}

impl ServerState {
	fn new() -> Self {
		let mut nodes = BTreeMap::new();
		nodes.insert(ROOT, root_node());
		ServerState {
			nodes,
			next_node_id: 1,
			server_id: SERVER_ID,
			started_at: STARTED_AT,
			default_block_size: 4096,
			sessions: BTreeMap::new(),
			next_session_id: 1,
			heartbeats: 0,
			mutating_requests: 0,
		}
	}

	fn lookup_path(&self, path: &str) -> Result<u64, u64> {
		if !path.starts_with('/') {
			return Err(INVALID_PATH);
		}
		let mut id = ROOT;
		for name in path.split('/').filter(|n| !n.is_empty()) {
			id = match &self.nodes[&id].entry {
				Entry::Directory { children } => *children.get(name).ok_or(UNKNOWN_FILE)?,
				Entry::File { .. } => return Err(PARENT_IS_NOT_DIRECTORY),
			};
		}
		Ok(id)
	}

	fn resolve(&self, target: &Target) -> Result<u64, u64> {
		match target {
			Target::Node(id) if self.nodes.contains_key(id) => Ok(*id),
			Target::Node(_) => Err(INVALID_NODE_ID),
			Target::Path(path) => self.lookup_path(path),
		}
	}

	fn is_open_anywhere(&self, node_id: u64) -> bool {
		self.sessions.values().any(|s| s.open.contains_key(&node_id))
	}

	fn number_of_open_files(&self) -> u64 {
		self.sessions.values().map(|s| s.open.len() as u64).sum()
	}

	fn notify_others(&self, session: u64, node_id: u64, message: Vec<u8>) {
		for (id, handle) in &self.sessions {
			if *id != session && handle.open.contains_key(&node_id) {
				let _ = handle.notifications.send(message.clone());
			}
		}
	}

	fn add_node(&mut self, parent: u64, name: &str, entry: Entry) -> Result<u64, u64> {
		match &self.nodes.get(&parent).ok_or(INVALID_NODE_ID)?.entry {
			Entry::Directory { children } if children.contains_key(name) => {
				return Err(ELEMENT_WITH_NAME_ALREADY_EXISTS)
			}
			Entry::Directory { .. } => {}
			Entry::File { .. } => return Err(PARENT_IS_NOT_DIRECTORY),
		}
		let id = self.next_node_id;
		self.next_node_id += 1;
		self.nodes.insert(id, ServerNode { name: name.to_string(), parent: Some(parent), entry });
		if let Some(ServerNode { entry: Entry::Directory { children }, .. }) = self.nodes.get_mut(&parent) {
			children.insert(name.to_string(), id);
		}
		Ok(id)
	}

	fn file_mut(&mut self, node_id: u64) -> Result<(&mut u64, &mut Vec<u8>, FileType), u64> {
		match &mut self.nodes.get_mut(&node_id).ok_or(INVALID_NODE_ID)?.entry {
			Entry::File { revision, content, file_type, .. } => Ok((revision, content, *file_type)),
			Entry::Directory { .. } => Err(NODE_IS_NOT_FILE),
		}
	}

	/// Checks shared by every edit of an open file
	fn check_edit(&mut self, session: u64, node_id: u64, revision: u64, file_type: FileType) -> Result<(), u64> {
		match self.sessions.get(&session).and_then(|s| s.open.get(&node_id)) {
			None => return Err(FILE_IS_NOT_OPEN),
			Some(false) => return Err(FILE_OPENED_IN_READ_MODE),
			Some(true) => {}
		}
		let (current, _, actual_type) = self.file_mut(node_id)?;
		if actual_type != file_type {
			return Err(OPERATION_NOT_PERMITTED_FOR_FILE_TYPE);
		}
		if revision != *current {
			return Err(REVISION_TOO_OLD);
		}
		Ok(())
	}

	fn write(&mut self, node_id: u64, offset: u64, data: &[u8]) -> Result<u64, u64> {
		let (revision, content, _) = self.file_mut(node_id)?;
		let offset = offset as usize;
		if offset > content.len() {
			return Err(OFFSET_AND_SIZE_DO_NOT_MAP_TO_PART_OF_FILE);
		}
		let end = (offset + data.len()).min(content.len());
		content.splice(offset..end, data.iter().copied());
		*revision += 1;
		Ok(*revision)
	}

	fn insert(&mut self, node_id: u64, offset: u64, data: &[u8]) -> Result<u64, u64> {
		let (revision, content, _) = self.file_mut(node_id)?;
		let offset = offset as usize;
		if offset > content.len() {
			return Err(OFFSET_AND_SIZE_DO_NOT_MAP_TO_PART_OF_FILE);
		}
		content.splice(offset..offset, data.iter().copied());
		*revision += 1;
		Ok(*revision)
	}

	fn delete_range(&mut self, node_id: u64, offset: u64, size: u64) -> Result<u64, u64> {
		let (revision, content, _) = self.file_mut(node_id)?;
		let (offset, size) = (offset as usize, size as usize);
		if offset + size > content.len() {
			return Err(OFFSET_AND_SIZE_DO_NOT_MAP_TO_PART_OF_FILE);
		}
		content.drain(offset..offset + size);
		*revision += 1;
		Ok(*revision)
	}

	fn describe_child(&self, id: u64) -> String {
		let n = &self.nodes[&id];
		match &n.entry {
			Entry::File { file_type, revision, content, .. } => format!(
				"{}{}{}{}{}{}{}",
				uint(0),
				string(&n.name),
				node(id),
				uint(*revision),
				uint(file_type.code()),
				uint(content.len() as u64),
				uint(self.is_open_anywhere(id) as u64)
			),
			Entry::Directory { .. } => {
				format!("{}{}{}{}{}", uint(1), string(&n.name), node(id), admin(), admin())
			}
		}
	}

	fn describe_element(&self, id: u64) -> String {
		let n = &self.nodes[&id];
		let mut entries = vec![
			kvp("node-id", uint(id)),
			kvp("created-at", timestamp(STARTED_AT)),
			kvp("modified-at", timestamp(STARTED_AT)),
		];
		match &n.entry {
			Entry::File { file_type, revision, content, block_size } => {
				entries.push(kvp("type", uint(0)));
				entries.push(kvp("created-by", admin()));
				entries.push(kvp("modified-by", admin()));
				entries.push(kvp("parent-read-authority", admin()));
				entries.push(kvp("parent-write-authority", admin()));
				entries.push(kvp("page-size", uint(*block_size)));
				entries.push(kvp("size", uint(content.len() as u64)));
				entries.push(kvp("revision", uint(*revision)));
				entries.push(kvp("file-type", uint(file_type.code())));
			}
			Entry::Directory { .. } => {
				entries.push(kvp("type", uint(1)));
				entries.push(kvp("read-authority", admin()));
				entries.push(kvp("write-authority", admin()));
			}
		}
		list(&entries)
	}

	// ========================================================================
	// REQUESTS
	// ========================================================================

	fn dispatch(&mut self, session: u64, request: &Request<'_>) -> Result<Reply, u64> {
		let transaction_id = request.transaction_id;
		if MUTATING_REQUESTS.contains(&request.tag) {
			self.mutating_requests += 1;
		}
		match request.tag {
			"Q-FS-C" => {
				let id = self.resolve(&request.target(0)?)?;
				let children: Vec<u64> = match &self.nodes[&id].entry {
					Entry::Directory { children } => children.values().copied().collect(),
					Entry::File { .. } => return Err(NODE_IS_NOT_DIRECTORY),
				};
				let described: Vec<String> = children.iter().map(|c| self.describe_child(*c)).collect();
				Ok(Reply::fields(list(&described)))
			}
			"Q-FS-E" => {
				let id = self.resolve(&request.target(0)?)?;
				Ok(Reply::fields(self.describe_element(id)))
			}
			"CREATE-FILE" => {
				let parent = self.resolve(&request.target(0)?)?;
				let name = request.string(1)?;
				let file_type = FileType::from_code(request.uint(2)?).map_err(|_| MALFORMED_MESSAGE)?;
				let block_size = request.uint(3).unwrap_or(self.default_block_size);
				let entry = Entry::File { file_type, revision: 0, content: Vec::new(), block_size };
				let id = self.add_node(parent, &name, entry)?;
				Ok(Reply::fields(format!("{}{}", node(id), uint(0))))
			}
			"CREATE-DIRECTORY" => {
				let parent = self.resolve(&request.target(0)?)?;
				let name = request.string(1)?;
				let id = self.add_node(parent, &name, Entry::Directory { children: BTreeMap::new() })?;
				Ok(Reply::fields(node(id)))
			}
			"DELETE" => {
				let id = self.resolve(&request.target(0)?)?;
				if id == ROOT {
					return Err(UNAUTHORIZED_OPERATION);
				}
				if let Entry::Directory { children } = &self.nodes[&id].entry {
					if !children.is_empty() {
						return Err(DIRECTORY_IS_NOT_EMPTY);
					}
				}
				let removed = self.nodes.remove(&id).ok_or(INVALID_NODE_ID)?;
				if let Some(parent) = removed.parent {
					if let Some(ServerNode { entry: Entry::Directory { children }, .. }) = self.nodes.get_mut(&parent) {
						children.remove(&removed.name);
					}
				}
				for handle in self.sessions.values_mut() {
					handle.open.remove(&id);
				}
				Ok(Reply::empty())
			}
			"O" => {
				let id = self.resolve(&request.target(0)?)?;
				let write = request.uint(1)? == 1;
				let (revision, size, block_size, file_type) = match &self.nodes[&id].entry {
					Entry::File { revision, content, block_size, file_type } => {
						(*revision, content.len() as u64, *block_size, *file_type)
					}
					Entry::Directory { .. } => return Err(NODE_IS_NOT_FILE),
				};
				if let Some(handle) = self.sessions.get_mut(&session) {
					handle.open.insert(id, write);
				}
				Ok(Reply::fields(format!(
					"{}{}{}{}{}",
					node(id),
					uint(revision),
					uint(size),
					uint(block_size),
					uint(file_type.code())
				)))
			}
			"CLOSE" => {
				let id = request.node_id(0)?;
				let handle = self.sessions.get_mut(&session).ok_or(FILE_IS_NOT_OPEN)?;
				handle.open.remove(&id).ok_or(FILE_IS_NOT_OPEN)?;
				Ok(Reply::empty())
			}
			"R" => {
				let id = request.node_id(0)?;
				let (offset, size) = request.block(1)?;
				if !self.sessions.get(&session).map_or(false, |s| s.open.contains_key(&id)) {
					return Err(FILE_IS_NOT_OPEN);
				}
				let (revision, content, _) = self.file_mut(id)?;
				let offset = offset as usize;
				if offset > content.len() {
					return Err(OFFSET_AND_SIZE_DO_NOT_MAP_TO_PART_OF_FILE);
				}
				let end = (offset + size as usize).min(content.len());
				let data = content[offset..end].to_vec();
				Ok(Reply {
					fields: format!("{}{}", uint(*revision), block(offset as u64, data.len() as u64)),
					trailer: data,
					stage: Stage::Idle,
				})
			}
			"RA-W" | "RA-I" => {
				let id = request.node_id(0)?;
				let revision = request.uint(1)?;
				let (offset, size) = request.block(2)?;
				self.check_edit(session, id, revision, FileType::RandomAccess)?;
				let (_, content, _) = self.file_mut(id)?;
				if offset > content.len() as u64 {
					return Err(OFFSET_AND_SIZE_DO_NOT_MAP_TO_PART_OF_FILE);
				}
				Ok(Reply {
					fields: String::new(),
					trailer: Vec::new(),
					stage: Stage::Upload {
						transaction_id,
						node_id: id,
						offset,
						size,
						insert: request.tag == "RA-I",
					},
				})
			}
			"RA-D" => {
				let id = request.node_id(0)?;
				let revision = request.uint(1)?;
				let (offset, size) = request.block(2)?;
				self.check_edit(session, id, revision, FileType::RandomAccess)?;
				let revision = self.delete_range(id, offset, size)?;
				self.notify_others(session, id, change_notification("F-DEL", id, revision, offset, size));
				Ok(Reply::fields(uint(revision)))
			}
			"BLOB-W" => {
				let id = request.node_id(0)?;
				let revision = request.uint(1)?;
				let size = request.uint(2)?;
				let block_size = request.uint(3)?;
				self.check_edit(session, id, revision, FileType::Blob)?;
				if size == 0 {
					let revision = self.commit_blob(id, Vec::new())?;
					return Ok(Reply {
						fields: String::new(),
						trailer: response(transaction_id, NO_ERROR, &uint(revision)),
						stage: Stage::Idle,
					});
				}
				if block_size == 0 {
					return Err(MALFORMED_MESSAGE);
				}
				Ok(Reply {
					fields: String::new(),
					trailer: Vec::new(),
					stage: Stage::Blob { transaction_id, node_id: id, size, block_size, received: Vec::new() },
				})
			}
			"RA-BATCH-EDIT" => {
				let id = request.node_id(0)?;
				let revision = request.uint(1)?;
				let operations = request.uint(2)?;
				self.check_edit(session, id, revision, FileType::RandomAccess)?;
				let stage = if operations == 0 {
					Stage::Idle
				} else {
					Stage::Batch(BatchState {
						transaction_id,
						node_id: id,
						revision,
						remaining: operations,
						index: 0,
						latest_edit_end: 0,
						shift_negative: 0,
						shift_positive: 0,
						pending: None,
					})
				};
				Ok(Reply { fields: String::new(), trailer: Vec::new(), stage })
			}
			"Q-SYSTEM" => Ok(Reply::fields(list(&[
				kvp("started-at", timestamp(self.started_at)),
				kvp("server-id", uint(self.server_id)),
				kvp("max-number-of-open-files-per-connection", uint(16)),
				kvp("number-of-open-files", uint(self.number_of_open_files())),
			]))),
			"Q-COUNTERS" => {
				let files = self.nodes.values().filter(|n| matches!(n.entry, Entry::File { .. })).count();
				Ok(Reply::fields(list(&[
					kvp("active-connections", uint(self.sessions.len() as u64)),
					kvp("number-of-files", uint(files as u64)),
					kvp("number-of-open-files", uint(self.number_of_open_files())),
				])))
			}
			_ => Err(MALFORMED_MESSAGE),
		}
	}

	fn commit_blob(&mut self, node_id: u64, data: Vec<u8>) -> Result<u64, u64> {
		let (revision, content, _) = self.file_mut(node_id)?;
		*content = data;
		*revision += 1;
		Ok(*revision)
	}

	fn finish_upload(&mut self, session: u64, node_id: u64, offset: u64, data: &[u8], insert: bool) -> Result<u64, u64> {
		let (revision, kind) = if insert {
			(self.insert(node_id, offset, data)?, "F-INS")
		} else {
			(self.write(node_id, offset, data)?, "F-MOD")
		};
		self.notify_others(session, node_id, change_notification(kind, node_id, revision, offset, data.len() as u64));
		Ok(revision)
	}
}

// ============================================================================
// SESSIONS
// ============================================================================

struct BatchState {
	transaction_id: u64,
	node_id: u64,
	revision: u64,
	remaining: u64,
	index: u64,
	/// Offsets are given in pre-batch coordinates and must not go back
	latest_edit_end: u64,
	shift_negative: u64,
	shift_positive: u64,
	/// Operation type, offset and size still waiting for its data
	pending: Option<(u64, u64, u64)>,
}

enum Stage {
	Idle,
	/// RA-W or RA-I acknowledged, waiting for the data
	Upload { transaction_id: u64, node_id: u64, offset: u64, size: u64, insert: bool },
	Blob { transaction_id: u64, node_id: u64, size: u64, block_size: u64, received: Vec<u8> },
	Batch(BatchState),
}

struct Session {
	id: u64,
	authenticated: bool,
	buffer: Vec<u8>,
	stage: Stage,
}

impl Session {
	fn new(id: u64) -> Self {
		Session { id, authenticated: false, buffer: Vec::new(), stage: Stage::Idle }
	}

	/// Consume as much buffered input as possible, returning everything to send
	fn process(&mut self, server: &FakeServer) -> Vec<u8> {
		let mut out = Vec::new();
		loop {
			let stage = std::mem::replace(&mut self.stage, Stage::Idle);
			let progressed = match stage {
				Stage::Idle => match take_frame(&mut self.buffer) {
					Some(frame) => {
						self.handle_frame(&frame, server, &mut out);
						true
					}
					None => false,
				},
				Stage::Upload { transaction_id, node_id, offset, size, insert } => {
					if (self.buffer.len() as u64) < size {
						self.stage = Stage::Upload { transaction_id, node_id, offset, size, insert };
						false
					} else {
						let data: Vec<u8> = self.buffer.drain(..size as usize).collect();
						let result = server.state().finish_upload(self.id, node_id, offset, &data, insert);
						match result {
							Ok(revision) => out.extend(response(transaction_id, NO_ERROR, &uint(revision))),
							Err(code) => out.extend(response(transaction_id, code, "")),
						}
						true
					}
				}
				Stage::Blob { transaction_id, node_id, size, block_size, mut received } => {
					let wanted = block_size.min(size - received.len() as u64) as usize;
					if self.buffer.len() < wanted {
						self.stage = Stage::Blob { transaction_id, node_id, size, block_size, received };
						false
					} else {
						received.extend(self.buffer.drain(..wanted));
						out.extend(response(transaction_id, NO_ERROR, ""));
						if received.len() as u64 == size {
							match server.state().commit_blob(node_id, received) {
								Ok(revision) => out.extend(response(transaction_id, NO_ERROR, &uint(revision))),
								Err(code) => out.extend(response(transaction_id, code, "")),
							}
						} else {
							self.stage = Stage::Blob { transaction_id, node_id, size, block_size, received };
						}
						true
					}
				}
				Stage::Batch(batch) => self.process_batch(batch, server, &mut out),
			};
			if !progressed {
				break;
			}
		}
		out
	}

	fn handle_frame(&mut self, frame: &[u8], server: &FakeServer, out: &mut Vec<u8>) {
		if frame.starts_with(b"V:1;HB:") {
			server.state().heartbeats += 1;
			return;
		}
		let tree = match parse_tree(frame) {
			Ok(tree) => tree,
			Err(_) => {
				out.extend(response(0, MALFORMED_MESSAGE, ""));
				return;
			}
		};
		let request = match Request::parse(&tree) {
			Some(request) => request,
			None => {
				out.extend(response(0, MALFORMED_MESSAGE, ""));
				return;
			}
		};
		let transaction_id = request.transaction_id;

		if request.tag == "A" {
			let credentials = request.args.first().map(|l| l.parts()).unwrap_or_default();
			let field = |i: usize| credentials.get(i).and_then(|n| Field::new(n).as_string().ok());
			let code = match (field(0), field(1)) {
				(Some(user), Some(password)) if user == USERNAME && password == PASSWORD => {
					self.authenticated = true;
					NO_ERROR
				}
				_ => INVALID_USERNAME_PASSWORD,
			};
			out.extend(response(transaction_id, code, ""));
			return;
		}
		if !self.authenticated {
			out.extend(response(transaction_id, UNAUTHORIZED_OPERATION, ""));
			return;
		}

		let result = server.state().dispatch(self.id, &request);
		match result {
			Ok(reply) => {
				out.extend(response(transaction_id, NO_ERROR, &reply.fields));
				out.extend(reply.trailer);
				self.stage = reply.stage;
			}
			Err(code) => out.extend(response(transaction_id, code, "")),
		}
	}

	fn process_batch(&mut self, mut batch: BatchState, server: &FakeServer, out: &mut Vec<u8>) -> bool {
		let (operation, offset, size) = match batch.pending.take() {
			Some(pending) => pending,
			None => {
				let frame = match take_frame(&mut self.buffer) {
					Some(frame) => frame,
					None => {
						self.stage = Stage::Batch(batch);
						return false;
					}
				};
				let header = parse_tree(&frame).ok().and_then(|tree| {
					let operation = Field::new(tree.nodes.get(0)?).as_uint().ok()?;
					let (offset, size) = Field::new(tree.nodes.get(1)?).as_block().ok()?;
					Some((operation, offset, size))
				});
				match header {
					Some(header) => header,
					None => {
						out.extend(batch_response(batch.transaction_id, MALFORMED_MESSAGE, batch.index, batch.revision));
						return true;
					}
				}
			}
		};

		// Data of a rejected operation is still on the wire
		let has_data = operation == BATCH_INSERT || operation == BATCH_WRITE;
		let data: Vec<u8> = if !has_data {
			Vec::new()
		} else if (self.buffer.len() as u64) < size {
			batch.pending = Some((operation, offset, size));
			self.stage = Stage::Batch(batch);
			return false;
		} else {
			self.buffer.drain(..size as usize).collect()
		};

		let rejected = if !has_data && operation != BATCH_DELETE {
			Some(INVALID_BATCH_OPERATION)
		} else if offset < batch.latest_edit_end {
			Some(BATCH_EDIT_OPERATION_NOT_SEQUENTIAL)
		} else {
			None
		};
		if let Some(code) = rejected {
			out.extend(batch_response(batch.transaction_id, code, batch.index, batch.revision));
			return true;
		}

		let corrected = offset + batch.shift_positive - batch.shift_negative;
		let mut state = server.state();
		let result = match operation {
			BATCH_DELETE => state.delete_range(batch.node_id, corrected, size).map(|r| (r, "F-DEL")),
			BATCH_INSERT => state.insert(batch.node_id, corrected, &data).map(|r| (r, "F-INS")),
			_ => state.write(batch.node_id, corrected, &data).map(|r| (r, "F-MOD")),
		};
		match result {
			Ok((revision, kind)) => {
				state.notify_others(
					self.id,
					batch.node_id,
					change_notification(kind, batch.node_id, revision, corrected, size),
				);
				match operation {
					BATCH_DELETE => batch.shift_negative += size,
					BATCH_INSERT => batch.shift_positive += size,
					_ => {}
				}
				batch.latest_edit_end = offset + size;
				batch.revision = revision;
				out.extend(batch_response(batch.transaction_id, NO_ERROR, batch.index, revision));
				batch.index += 1;
				batch.remaining -= 1;
				if batch.remaining > 0 {
					self.stage = Stage::Batch(batch);
				}
			}
			Err(code) => {
				out.extend(batch_response(batch.transaction_id, code, batch.index, batch.revision));
			}
		}
		true
	}
}

async fn run_session(
	server: FakeServer,
	id: u64,
	stream: DuplexStream,
	mut notifications: mpsc::UnboundedReceiver<Vec<u8>>,
) {
	let (mut reader, mut writer) = tokio::io::split(stream);
	let mut session = Session::new(id);
	let mut chunk = vec![0u8; 64 * 1024];
	loop {
		tokio::select! {
			read = reader.read(&mut chunk) => {
				let n = match read {
					Ok(0) | Err(_) => break,
					Ok(n) => n,
				};
				session.buffer.extend_from_slice(&chunk[..n]);
				let output = session.process(&server);
				if !output.is_empty() && writer.write_all(&output).await.is_err() {
					break;
				}
			}
			notification = notifications.recv() => {
				match notification {
					Some(message) => {
						if writer.write_all(&message).await.is_err() {
							break;
						}
					}
					None => break,
				}
			}
		}
	}
	server.state().sessions.remove(&id);
}

// ============================================================================
// PUBLIC HANDLE
// ============================================================================

#[derive(Clone)]
pub struct FakeServer {
	inner: Arc<Mutex<ServerState>>,
}

impl FakeServer {
	pub fn new() -> Self {
		FakeServer { inner: Arc::new(Mutex::new(ServerState::new())) }
	}

	fn state(&self) -> MutexGuard<'_, ServerState> {
		self.inner.lock().unwrap()
	}

	/// New unauthenticated connection
	pub fn connect(&self) -> Connection {
		let (client, server_side) = tokio::io::duplex(1 << 16);
		let (sender, receiver) = mpsc::unbounded_channel();
		let id = {
			let mut state = self.state();
			let id = state.next_session_id;
			state.next_session_id += 1;
			state.sessions.insert(id, SessionHandle { notifications: sender, open: BTreeMap::new() });
			id
		};
		tokio::spawn(run_session(self.clone(), id, server_side, receiver));
		Connection::from_io(client).with_timeouts(test_timeouts())
	}

	pub async fn connect_authenticated(&self) -> Connection {
		let mut connection = self.connect();
		let rsp = connection.authenticate(USERNAME, PASSWORD).await.unwrap();
		assert!(!rsp.is_error(), "authentication failed");
		connection
	}

	/// Client bound to this server with `root` as its data directory
	pub async fn client(&self, root: &Path) -> ZynClient {
		let connection = self.connect_authenticated().await;
		let state = ClientState::new(USERNAME, "127.0.0.1", 8080, LocalFilesystem::new(root));
		let mut client = ZynClient::new(connection, state);
		client.update_remote_info().await.unwrap();
		client
	}

	pub fn set_default_block_size(&self, block_size: u64) {
		self.state().default_block_size = block_size;
	}

	fn split(path: &str) -> (&str, &str) {
		let index = path.rfind('/').unwrap();
		let parent = if index == 0 { "/" } else { &path[..index] };
		(parent, &path[index + 1..])
	}

	pub fn create_directory(&self, path: &str) -> u64 {
		let mut state = self.state();
		let (parent, name) = Self::split(path);
		let parent = state.lookup_path(parent).unwrap();
		state.add_node(parent, name, Entry::Directory { children: BTreeMap::new() }).unwrap()
	}

	pub fn create_file(&self, path: &str, file_type: FileType, content: &[u8]) -> u64 {
		let block_size = self.state().default_block_size;
		self.create_file_with_block_size(path, file_type, content, block_size)
	}

	/// Seed a file; a file with content starts at revision 1
	pub fn create_file_with_block_size(&self, path: &str, file_type: FileType, content: &[u8], block_size: u64) -> u64 {
		let mut state = self.state();
		let (parent, name) = Self::split(path);
		let parent = state.lookup_path(parent).unwrap();
		let revision = if content.is_empty() { 0 } else { 1 };
		let entry = Entry::File { file_type, revision, content: content.to_vec(), block_size };
		state.add_node(parent, name, entry).unwrap()
	}

	/// Replace content as another client would, without notifications
	pub fn modify(&self, path: &str, content: &[u8]) -> u64 {
		let mut state = self.state();
		let id = state.lookup_path(path).unwrap();
		state.commit_blob(id, content.to_vec()).unwrap()
	}

	pub fn delete(&self, path: &str) {
		let mut state = self.state();
		let id = state.lookup_path(path).unwrap();
		let removed = state.nodes.remove(&id).unwrap();
		if let Some(ServerNode { entry: Entry::Directory { children }, .. }) =
			removed.parent.and_then(|p| state.nodes.get_mut(&p))
		{
			children.remove(&removed.name);
		}
	}

	pub fn node_id(&self, path: &str) -> Option<u64> {
		self.state().lookup_path(path).ok()
	}

	pub fn exists(&self, path: &str) -> bool {
		self.node_id(path).is_some()
	}

	pub fn content(&self, path: &str) -> Option<Vec<u8>> {
		let state = self.state();
		let id = state.lookup_path(path).ok()?;
		match &state.nodes[&id].entry {
			Entry::File { content, .. } => Some(content.clone()),
			Entry::Directory { .. } => None,
		}
	}

	pub fn revision(&self, path: &str) -> Option<u64> {
		let state = self.state();
		let id = state.lookup_path(path).ok()?;
		match &state.nodes[&id].entry {
			Entry::File { revision, .. } => Some(*revision),
			Entry::Directory { .. } => None,
		}
	}

	pub fn heartbeats(&self) -> u64 {
		self.state().heartbeats
	}

	/// Requests that create, delete or edit something, accepted or not
	pub fn mutating_requests(&self) -> u64 {
		self.state().mutating_requests
	}

	/// Move an element as another client would; the node id is kept
	pub fn rename(&self, from: &str, to: &str) {
		let mut state = self.state();
		let id = state.lookup_path(from).unwrap();
		let (new_parent, new_name) = Self::split(to);
		let new_parent = state.lookup_path(new_parent).unwrap();
		let node = state.nodes.get_mut(&id).unwrap();
		let old_parent = node.parent.unwrap();
		let old_name = std::mem::replace(&mut node.name, new_name.to_string());
		node.parent = Some(new_parent);
		if let Some(ServerNode { entry: Entry::Directory { children }, .. }) = state.nodes.get_mut(&old_parent) {
			children.remove(&old_name);
		}
		if let Some(ServerNode { entry: Entry::Directory { children }, .. }) = state.nodes.get_mut(&new_parent) {
			children.insert(new_name.to_string(), id);
		}
	}

	pub fn open_files(&self) -> u64 {
		self.state().number_of_open_files()
	}

	/// Simulate a new server instance; `wipe` also drops the filesystem
	pub fn restart(&self, wipe: bool) {
		let mut state = self.state();
		state.server_id += 1;
		state.started_at += 3600;
		if wipe {
			state.nodes.clear();
			state.nodes.insert(ROOT, root_node());
		}
	}

	pub fn send_disconnect(&self, reason: &str) {
		for handle in self.state().sessions.values() {
			let _ = handle.notifications.send(disconnected_notification(reason));
		}
	}

	/// Close every connection from the server side
	pub fn drop_connections(&self) {
		self.state().sessions.clear();
	}
}

// ============================================================================
// LOCAL FILE HELPERS
// ============================================================================

/// Write `content` and move the mtime forward so the change is always visible
pub fn edit_local(path: &Path, content: &[u8]) {
	let previous = std::fs::metadata(path).ok().map(|m| FileTime::from_last_modification_time(&m));
	std::fs::write(path, content).unwrap();
	if let Some(previous) = previous {
		let later = FileTime::from_unix_time(previous.unix_seconds() + 10, 0);
		filetime::set_file_mtime(path, later).unwrap();
	}
}

pub fn read_local(path: &Path) -> Vec<u8> {
	std::fs::read(path).unwrap()
}

// vim: ts=4
