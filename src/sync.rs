//! Synchronization engine
//!
//! `ZynClient` keeps a local mirror consistent with the server. Every
//! operation is explicit: nothing is polled in the background. A file is
//! compared on two axes, the remote revision against the last synchronized
//! revision and the on-disk metadata against the snapshot taken after the
//! last synchronization. Changes on both sides are reported as a conflict
//! and never merged.

use std::collections::BTreeMap;
use std::convert::TryFrom;
use std::io;
use std::path::Path;

use tracing::{debug, info, warn};

use crate::connection::{Connection, StreamOutcome};
use crate::error::{ClientError, ClientResult};
use crate::filesystem::{LocalElement, LocalFilesystem, LocalKind, UntrackedElement, ROOT_NODE_ID};
use crate::local_metadata::FileSnapshot;
use crate::protocol::error_codes;
use crate::protocol::{
	ChildrenResponse, CreateResponse, ElementDescription, OpenResponse, RemoteChild, RevisionResponse,
	SystemResponse,
};
use crate::remote_edit::edit_random_access_file;
use crate::state::{ClientState, ServerIdentity};
use crate::types::{FileDescriptor, FileType};
use crate::validation::{join_remote_paths, normalized_remote_path, split_remote_path, REMOTE_ROOT};

/// Read size used when the server reports no block size
const DEFAULT_BLOCK_SIZE: u64 = 64 * 1024;

/// Remote description joined with local tracking state
#[derive(Debug, Clone, PartialEq)]
pub struct Element<R> {
	pub remote: R,
	pub local: Option<LocalElement>,
}

impl<R> Element<R> {
	pub fn is_tracked(&self) -> bool {
		self.local.is_some()
	}
}

/// What synchronizing one element did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncAction {
	UpToDate,
	Fetched { revision: u64 },
	Pushed { revision: u64 },
	/// Element no longer exists remotely and was untracked
	Untracked,
}

#[derive(Debug, Default)]
pub struct SyncReport {
	pub actions: Vec<(String, SyncAction)>,
	pub failures: Vec<(String, ClientError)>,
}

impl SyncReport {
	pub fn is_up_to_date(&self) -> bool {
		self.failures.is_empty() && self.actions.iter().all(|(_, a)| *a == SyncAction::UpToDate)
	}

	pub fn changed(&self) -> impl Iterator<Item = &(String, SyncAction)> {
		self.actions.iter().filter(|(_, a)| *a != SyncAction::UpToDate)
	}
}

/// Result of comparing the connected server with the one seen before
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerIdentityCheck {
	pub expected: Option<ServerIdentity>,
	pub actual: ServerIdentity,
}

impl ServerIdentityCheck {
	pub fn matches(&self) -> bool {
		self.expected == Some(self.actual)
	}
}

fn invalid_path(path: &str, error: impl ToString) -> ClientError {
	ClientError::InvalidPath { path: path.to_string(), message: error.to_string() }
}

pub(crate) fn normalize(path: &str) -> ClientResult<String> {
	normalized_remote_path(path).map_err(|e| invalid_path(path, e))
}

/// Errors that leave the connection unusable end compound operations
fn is_fatal(error: &ClientError) -> bool {
	matches!(error, ClientError::Connection(_) | ClientError::Protocol(_))
}

pub struct ZynClient {
	pub(crate) connection: Connection,
	pub(crate) state: ClientState,
}

impl ZynClient {
	pub fn new(connection: Connection, state: ClientState) -> Self {
		ZynClient { connection, state }
	}

	pub fn connection(&mut self) -> &mut Connection {
		&mut self.connection
	}

	pub fn state(&self) -> &ClientState {
		&self.state
	}

	pub fn filesystem(&self) -> &LocalFilesystem {
		&self.state.filesystem
	}

	pub fn into_parts(self) -> (Connection, ClientState) {
		(self.connection, self.state)
	}

	pub fn is_empty(&self) -> bool {
		self.state.filesystem.is_empty()
	}

	// ========================================================================
	// SERVER IDENTITY
	// ========================================================================

	async fn query_system(&mut self) -> ClientResult<SystemResponse> {
		let rsp = self.connection.query_system().await?;
		rsp.check("query system")?;
		Ok(SystemResponse::try_from(&rsp)?)
	}

	/// Record the identity of the connected server
	pub async fn update_remote_info(&mut self) -> ClientResult<ServerIdentity> {
		let system = self.query_system().await?;
		let identity = ServerIdentity { server_id: system.server_id, started_at: system.started_at };
		self.state.set_server_identity(identity);
		Ok(identity)
	}

	/// Compare the connected server with the recorded identity
	pub async fn validate_remote_matches_expected(&mut self) -> ClientResult<ServerIdentityCheck> {
		let system = self.query_system().await?;
		Ok(ServerIdentityCheck {
			expected: self.state.server_identity(),
			actual: ServerIdentity { server_id: system.server_id, started_at: system.started_at },
		})
	}

	// ========================================================================
	// QUERIES
	// ========================================================================

	fn descriptor(&self, node_id: u64) -> FileDescriptor {
		match self.state.filesystem.element(node_id) {
			Some(e) if e.node_id == ROOT_NODE_ID => FileDescriptor::Path(REMOTE_ROOT.to_string()),
			_ => FileDescriptor::NodeId(node_id),
		}
	}

	async fn query_children(&mut self, descriptor: &FileDescriptor, path: &str) -> ClientResult<ChildrenResponse> {
		let rsp = self.connection.query_children(descriptor).await?;
		rsp.check("query children").map_err(|e| e.with_path(path))?;
		Ok(ChildrenResponse::try_from(&rsp)?)
	}

	/// Look up an element by listing its parent
	async fn remote_child(&mut self, path: &str) -> ClientResult<RemoteChild> {
		let (parent, name) = split_remote_path(path).map_err(|e| invalid_path(path, e))?;
		let children = self.query_children(&FileDescriptor::Path(parent), path).await?;
		children
			.elements
			.into_iter()
			.find(|c| c.name() == name)
			.ok_or_else(|| ClientError::RemoteMissing { path: path.to_string() })
	}

	pub async fn query_element(&mut self, path: &str) -> ClientResult<Element<ElementDescription>> {
		let path = normalize(path)?;
		let rsp = self.connection.query_element(&FileDescriptor::Path(path.clone())).await?;
		rsp.check("query element").map_err(|e| e.with_path(&path))?;
		let remote = ElementDescription::try_from(&rsp)?;
		let local = self.state.filesystem.element(remote.node_id).cloned();
		Ok(Element { remote, local })
	}

	/// Describe a directory and each of its remote children
	pub async fn query_directory(
		&mut self,
		path: &str,
	) -> ClientResult<(Element<ElementDescription>, Vec<Element<RemoteChild>>)> {
		let directory = self.query_element(path).await?;
		if directory.remote.is_file() {
			return Err(ClientError::invalid_argument(format!("{} is not a directory", path)));
		}
		let path = normalize(path)?;
		let children = self.query_children(&FileDescriptor::NodeId(directory.remote.node_id), &path).await?;
		let children = children
			.elements
			.into_iter()
			.map(|remote| {
				let local = self.state.filesystem.element(remote.node_id()).cloned();
				Element { remote, local }
			})
			.collect();
		Ok((directory, children))
	}

	pub async fn untracked_children(&self, path: &str) -> ClientResult<Vec<UntrackedElement>> {
		let path = normalize(path)?;
		let node_id = self.state.filesystem.require_path(&path)?.node_id;
		self.state.filesystem.untracked_children(node_id).await
	}

	// ========================================================================
	// FILE TRANSFER
	// ========================================================================

	pub(crate) async fn close_file(&mut self, node_id: u64, path: &str) -> ClientResult<()> {
		let rsp = self.connection.close(node_id).await?;
		rsp.check("close").map_err(|e| e.with_path(path))?;
		Ok(())
	}

	pub(crate) async fn open_file(&mut self, node_id: u64, path: &str, write: bool) -> ClientResult<OpenResponse> {
		let descriptor = FileDescriptor::NodeId(node_id);
		let rsp = if write {
			self.connection.open_write(&descriptor).await?
		} else {
			self.connection.open_read(&descriptor).await?
		};
		rsp.check("open").map_err(|e| e.with_path(path))?;
		Ok(OpenResponse::try_from(&rsp)?)
	}

	/// Download a whole file; returns the revision of the downloaded content
	async fn download(&mut self, node_id: u64, path: &str, local: &Path) -> ClientResult<u64> {
		let open = self.open_file(node_id, path, false).await?;
		let result = self.download_open_file(&open, path, local).await;
		let closed = self.close_file(open.node_id, path).await;
		let revision = result?;
		closed?;
		Ok(revision)
	}

	async fn download_open_file(&mut self, open: &OpenResponse, path: &str, local: &Path) -> ClientResult<u64> {
		let block_size = if open.block_size == 0 { DEFAULT_BLOCK_SIZE } else { open.block_size };
		let mut file = tokio::fs::File::create(local).await?;
		let outcome =
			self.connection.read_file_stream(open.node_id, 0, open.size, block_size, &mut file).await?;
		match outcome {
			StreamOutcome::Complete { bytes, revision } => {
				debug!("Downloaded {} bytes of {}", bytes, path);
				Ok(revision.unwrap_or(open.revision))
			}
			StreamOutcome::Failed(rsp) => {
				rsp.check("read").map_err(|e| e.with_path(path))?;
				Err(ClientError::invalid_argument(format!("read of {} failed", path)))
			}
		}
	}

	pub(crate) async fn read_remote_content(&mut self, open: &OpenResponse, path: &str) -> ClientResult<Vec<u8>> {
		let block_size = if open.block_size == 0 { DEFAULT_BLOCK_SIZE } else { open.block_size };
		let mut content = Vec::with_capacity(open.size as usize);
		match self.connection.read_file_stream(open.node_id, 0, open.size, block_size, &mut content).await? {
			StreamOutcome::Complete { .. } => Ok(content),
			StreamOutcome::Failed(rsp) => {
				rsp.check("read").map_err(|e| e.with_path(path))?;
				Err(ClientError::invalid_argument(format!("read of {} failed", path)))
			}
		}
	}

	/// Upload the whole local content of a tracked file
	async fn push_to_remote(&mut self, node_id: u64) -> ClientResult<u64> {
		let element = self.state.filesystem.require_node(node_id)?.clone();
		let open = self.open_file(node_id, &element.path, true).await?;
		let result = self.upload_open_file(&element, &open).await;
		let closed = self.close_file(node_id, &element.path).await;
		let revision = result?;
		closed?;
		Ok(revision)
	}

	async fn upload_open_file(&mut self, element: &LocalElement, open: &OpenResponse) -> ClientResult<u64> {
		let path = element.path.as_str();
		let (file_type, local_revision) = match &element.kind {
			LocalKind::File { file_type, revision, .. } => (*file_type, *revision),
			LocalKind::Directory { .. } => {
				return Err(ClientError::invalid_argument(format!("{} is not a file", path)))
			}
		};
		if open.revision != local_revision {
			return Err(ClientError::RevisionTooOld {
				path: path.to_string(),
				local: local_revision,
				remote: open.revision,
			});
		}

		let local = self.state.filesystem.local_path(path);
		let mut revision = open.revision;
		match file_type {
			FileType::Blob => {
				let mut file = tokio::fs::File::open(&local).await?;
				let size = file.metadata().await?.len();
				if size > 0 || open.size > 0 {
					let rsp = self
						.connection
						.blob_write_stream(element.node_id, revision, &mut file, size, Some(open.block_size))
						.await?;
					rsp.check("write").map_err(|e| e.with_path(path))?;
					revision = RevisionResponse::try_from(&rsp)?.revision;
				}
			}
			FileType::RandomAccess => {
				let data = tokio::fs::read(&local).await?;
				let length = data.len() as u64;
				if open.size > length {
					let rsp = self
						.connection
						.ra_delete(element.node_id, revision, length, open.size - length)
						.await?;
					rsp.check("delete").map_err(|e| e.with_path(path))?;
					revision = RevisionResponse::try_from(&rsp)?.revision;
				}
				if !data.is_empty() {
					let rsp = self.connection.ra_write(element.node_id, revision, 0, &data).await?;
					rsp.check("write").map_err(|e| e.with_path(path))?;
					revision = RevisionResponse::try_from(&rsp)?.revision;
				}
			}
		}
		let snapshot = FileSnapshot::capture(&local).await?;
		self.state.filesystem.update_file(element.node_id, revision, snapshot);
		info!("Pushed {}, revision {}", path, revision);
		Ok(revision)
	}

	/// Send local edits of a file whose remote copy has not changed
	async fn push_changes(&mut self, element: &LocalElement) -> ClientResult<u64> {
		let open = self.open_file(element.node_id, &element.path, true).await?;
		let result = match element.file_type() {
			Some(FileType::RandomAccess) => self.push_random_access_changes(element, &open).await,
			_ => self.upload_open_file(element, &open).await,
		};
		let closed = self.close_file(element.node_id, &element.path).await;
		let revision = result?;
		closed?;
		Ok(revision)
	}

	pub(crate) async fn push_random_access_changes(
		&mut self,
		element: &LocalElement,
		open: &OpenResponse,
	) -> ClientResult<u64> {
		let local_revision = element.revision().unwrap_or(0);
		if open.revision != local_revision {
			return Err(ClientError::RevisionTooOld {
				path: element.path.clone(),
				local: local_revision,
				remote: open.revision,
			});
		}
		let local = self.state.filesystem.local_path(&element.path);
		let remote_content = self.read_remote_content(open, &element.path).await?;
		let local_content = tokio::fs::read(&local).await?;

		let mut revision = open.revision;
		let edited = edit_random_access_file(
			&mut self.connection,
			element.node_id,
			&mut revision,
			&remote_content,
			&local_content,
		)
		.await;
		if let Err(e) = edited {
			self.state.filesystem.set_revision(element.node_id, revision);
			return Err(e);
		}
		let snapshot = FileSnapshot::capture(&local).await?;
		self.state.filesystem.update_file(element.node_id, revision, snapshot);
		info!("Pushed changes of {}, revision {}", element.path, revision);
		Ok(revision)
	}

	// ========================================================================
	// ADD
	// ========================================================================

	async fn create_remote(
		&mut self,
		parent_id: u64,
		name: &str,
		path: &str,
		file_type: Option<FileType>,
	) -> ClientResult<CreateResponse> {
		let parent = self.descriptor(parent_id);
		let rsp = match file_type {
			Some(file_type) => self.connection.create_file(&parent, name, file_type, None).await?,
			None => self.connection.create_directory(&parent, name).await?,
		};
		rsp.check("create").map_err(|e| e.with_path(path))?;
		Ok(CreateResponse::try_from(&rsp)?)
	}

	async fn cleanup_failed_create(&mut self, path: &str, error: &ClientError) {
		if is_fatal(error)
			|| error.server_code() == Some(error_codes::ELEMENT_WITH_NAME_ALREADY_EXISTS)
		{
			return;
		}
		warn!("Creating {} on the server failed, trying to clean up", path);
		match self.connection.delete(&FileDescriptor::Path(path.to_string())).await {
			Ok(rsp) => {
				if let Err(e) = rsp.check("delete") {
					warn!("Cleanup failed: {}", e);
				}
			}
			Err(e) => warn!("Cleanup failed: {}", e),
		}
	}

	/// Start tracking an on-disk file or directory and create it on the server
	///
	/// Files require a file type, directories must not be given one.
	pub async fn add(&mut self, path: &str, file_type: Option<FileType>) -> ClientResult<LocalElement> {
		let path = normalize(path)?;
		if self.state.filesystem.is_tracked_path(&path) {
			return Err(ClientError::AlreadyTracked { path });
		}
		let (parent_path, name) = split_remote_path(&path).map_err(|e| invalid_path(&path, e))?;
		let parent_id = match self.state.filesystem.element_by_path(&parent_path) {
			Some(parent) if parent.is_directory() => parent.node_id,
			Some(_) => return Err(invalid_path(&path, "parent is not a directory")),
			None => return Err(ClientError::ParentNotTracked { path }),
		};

		let local = self.state.filesystem.local_path(&path);
		let metadata = match tokio::fs::metadata(&local).await {
			Ok(m) => m,
			Err(e) if e.kind() == io::ErrorKind::NotFound => {
				return Err(ClientError::LocalMissing { path })
			}
			Err(e) => return Err(e.into()),
		};
		if metadata.is_dir() && file_type.is_some() {
			return Err(ClientError::invalid_argument("a file type must not be given for a directory"));
		}
		if metadata.is_file() && file_type.is_none() {
			return Err(ClientError::invalid_argument(
				"a file type is required for files: random-access or blob",
			));
		}
		if !metadata.is_dir() && !metadata.is_file() {
			return Err(ClientError::invalid_argument(format!("{} is not a file or directory", path)));
		}

		let created = match self.create_remote(parent_id, &name, &path, file_type).await {
			Ok(c) => c,
			Err(e) => {
				self.cleanup_failed_create(&path, &e).await;
				return Err(e);
			}
		};
		let kind = match file_type {
			Some(file_type) => LocalKind::File {
				file_type,
				revision: created.revision.unwrap_or(0),
				snapshot: FileSnapshot::default(),
			},
			None => LocalKind::new_directory(),
		};
		self.state.filesystem.register(&path, created.node_id, kind)?;
		if file_type.is_some() {
			self.push_to_remote(created.node_id).await?;
		}
		Ok(self.state.filesystem.require_node(created.node_id)?.clone())
	}

	// ========================================================================
	// FETCH
	// ========================================================================

	async fn fetch_element(
		&mut self,
		parent_id: u64,
		path: &str,
		remote: &RemoteChild,
		overwrite: bool,
	) -> ClientResult<()> {
		debug!("Fetching {}, overwrite={}", path, overwrite);
		let local = self.state.filesystem.local_path(path);
		match remote {
			RemoteChild::File { node_id, file_type, .. } => {
				if !overwrite && local.exists() {
					return Err(ClientError::LocalExists { path: path.to_string() });
				}
				let existed = local.exists();
				self.register_child(parent_id, path, *node_id, LocalKind::File {
					file_type: *file_type,
					revision: 0,
					snapshot: FileSnapshot::default(),
				})?;
				let downloaded: ClientResult<(u64, FileSnapshot)> = match self.download(*node_id, path, &local).await {
					Ok(revision) => FileSnapshot::capture(&local).await.map(|s| (revision, s)).map_err(Into::into),
					Err(e) => Err(e),
				};
				match downloaded {
					Ok((revision, snapshot)) => self.state.filesystem.update_file(*node_id, revision, snapshot),
					Err(e) => {
						self.forget_failed_fetch(*node_id, &local, !existed).await;
						return Err(e);
					}
				}
			}
			RemoteChild::Directory { node_id, .. } => {
				let create = match tokio::fs::metadata(&local).await {
					Ok(m) if m.is_dir() && overwrite => false,
					Ok(_) => return Err(ClientError::LocalExists { path: path.to_string() }),
					Err(e) if e.kind() == io::ErrorKind::NotFound => true,
					Err(e) => return Err(e.into()),
				};
				self.register_child(parent_id, path, *node_id, LocalKind::new_directory())?;
				if create {
					if let Err(e) = tokio::fs::create_dir(&local).await {
						self.forget_failed_fetch(*node_id, &local, false).await;
						return Err(e.into());
					}
				}
			}
		}
		Ok(())
	}

	/// Undo the tracking of an element whose download failed
	async fn forget_failed_fetch(&mut self, node_id: u64, local: &Path, remove_local: bool) {
		if let Err(e) = self.state.filesystem.unregister(node_id) {
			warn!("Failed to untrack node {} after a failed fetch: {}", node_id, e);
		}
		if remove_local {
			if let Err(e) = tokio::fs::remove_file(local).await {
				if e.kind() != io::ErrorKind::NotFound {
					warn!("Failed to remove partial download {}: {}", local.display(), e);
				}
			}
		}
	}

	fn register_child(&mut self, parent_id: u64, path: &str, node_id: u64, kind: LocalKind) -> ClientResult<()> {
		debug_assert!(self.state.filesystem.is_tracked_node(parent_id));
		self.state.filesystem.register(path, node_id, kind)?;
		Ok(())
	}

	/// Fetch every untracked descendant of a tracked directory
	///
	/// A child that fails is logged and skipped.
	async fn fetch_children(&mut self, directory_id: u64, overwrite: bool, fetched: &mut Vec<String>) -> ClientResult<()> {
		let mut pending = vec![directory_id];
		while let Some(id) = pending.pop() {
			let directory_path = self.state.filesystem.require_node(id)?.path.clone();
			let descriptor = self.descriptor(id);
			let children = self.query_children(&descriptor, &directory_path).await?;
			for child in children.elements {
				let path = join_remote_paths(&[&directory_path, child.name()]);
				if let Some(existing) = self.state.filesystem.element_by_path(&path) {
					if existing.is_directory() && child.is_directory() {
						pending.push(existing.node_id);
					}
					continue;
				}
				match self.fetch_element(id, &path, &child, overwrite).await {
					Ok(()) => {
						if child.is_directory() {
							pending.push(child.node_id());
						}
						fetched.push(path);
					}
					Err(e) if is_fatal(&e) => return Err(e),
					Err(e) => warn!("Failed to fetch {}: {}", path, e),
				}
			}
		}
		Ok(())
	}

	/// Download a remote element and start tracking it
	///
	/// Directories are fetched recursively. Fetching a tracked directory
	/// fetches its untracked children; a tracked file is an error.
	/// Returns the paths that were fetched.
	pub async fn fetch(&mut self, path: &str, overwrite: bool) -> ClientResult<Vec<String>> {
		let path = normalize(path)?;
		let mut fetched = Vec::new();

		let directory_id = if path == REMOTE_ROOT {
			ROOT_NODE_ID
		} else {
			let remote = self.remote_child(&path).await?;
			match self.state.filesystem.element_by_path(&path) {
				Some(e) if e.is_file() => return Err(ClientError::AlreadyTracked { path }),
				Some(e) => e.node_id,
				None => {
					let (parent_path, _) = split_remote_path(&path).map_err(|e| invalid_path(&path, e))?;
					let parent_id = self
						.state
						.filesystem
						.element_by_path(&parent_path)
						.map(|p| p.node_id)
						.ok_or_else(|| ClientError::ParentNotTracked { path: path.clone() })?;
					self.fetch_element(parent_id, &path, &remote, overwrite).await?;
					fetched.push(path.clone());
					if !remote.is_directory() {
						return Ok(fetched);
					}
					remote.node_id()
				}
			}
		};
		self.fetch_children(directory_id, overwrite, &mut fetched).await?;
		Ok(fetched)
	}

	// ========================================================================
	// SYNC
	// ========================================================================

	async fn refetch(&mut self, element: &LocalElement) -> ClientResult<u64> {
		let local = self.state.filesystem.local_path(&element.path);
		let revision = self.download(element.node_id, &element.path, &local).await?;
		let snapshot = FileSnapshot::capture(&local).await?;
		self.state.filesystem.update_file(element.node_id, revision, snapshot);
		info!("Fetched {}, revision {}", element.path, revision);
		Ok(revision)
	}

	/// Bring one tracked file up to date with `remote_revision`
	///
	/// With `discard_local_changes` local edits are replaced by the remote
	/// content instead of being pushed or reported as a conflict.
	pub async fn synchronize_file(
		&mut self,
		node_id: u64,
		remote_revision: u64,
		discard_local_changes: bool,
	) -> ClientResult<SyncAction> {
		let element = self.state.filesystem.require_node(node_id)?.clone();
		let (revision, snapshot) = match &element.kind {
			LocalKind::File { revision, snapshot, .. } => (*revision, *snapshot),
			LocalKind::Directory { .. } => {
				return Err(ClientError::invalid_argument(format!("{} is not a file", element.path)))
			}
		};
		let local = self.state.filesystem.local_path(&element.path);
		let local_changed = match snapshot.has_changed(&local).await {
			Ok(changed) => changed,
			Err(e) if e.kind() == io::ErrorKind::NotFound && discard_local_changes => true,
			Err(e) if e.kind() == io::ErrorKind::NotFound => {
				return Err(ClientError::LocalMissing { path: element.path })
			}
			Err(e) => return Err(e.into()),
		};
		let remote_changed = remote_revision > revision;
		debug!(
			"Synchronizing {}: local_changed={}, remote_changed={}",
			element.path, local_changed, remote_changed
		);

		match (local_changed, remote_changed) {
			(false, false) => Ok(SyncAction::UpToDate),
			(true, _) if discard_local_changes => {
				Ok(SyncAction::Fetched { revision: self.refetch(&element).await? })
			}
			(false, true) => Ok(SyncAction::Fetched { revision: self.refetch(&element).await? }),
			(true, true) => Err(ClientError::UnresolvedConflict { path: element.path }),
			(true, false) => Ok(SyncAction::Pushed { revision: self.push_changes(&element).await? }),
		}
	}

	/// Untrack an element and everything tracked below it
	fn untrack_tree(&mut self, node_id: u64) -> ClientResult<()> {
		let mut order = Vec::new();
		let mut pending = vec![node_id];
		while let Some(id) = pending.pop() {
			order.push(id);
			pending.extend(self.state.filesystem.children(id).iter().map(|c| c.node_id));
		}
		for id in order.into_iter().rev() {
			self.state.filesystem.unregister(id)?;
		}
		Ok(())
	}

	/// Synchronize tracked children of `directory_id`, only `only` when given
	async fn sync_directory(
		&mut self,
		directory_id: u64,
		only: Option<u64>,
		discard_local_changes: bool,
		report: &mut SyncReport,
	) -> ClientResult<()> {
		let mut pending = vec![directory_id];
		while let Some(id) = pending.pop() {
			let directory_path = self.state.filesystem.require_node(id)?.path.clone();
			let descriptor = self.descriptor(id);
			let children = self.query_children(&descriptor, &directory_path).await?;
			let remote: BTreeMap<u64, RemoteChild> =
				children.elements.into_iter().map(|c| (c.node_id(), c)).collect();

			let tracked: Vec<(u64, String, bool)> = self
				.state
				.filesystem
				.children(id)
				.into_iter()
				.filter(|c| only.map_or(true, |n| n == c.node_id))
				.map(|c| (c.node_id, c.path.clone(), c.is_directory()))
				.collect();

			for (node_id, path, is_directory) in tracked {
				match remote.get(&node_id) {
					None => {
						info!("{} no longer exists on the server, untracking", path);
						self.untrack_tree(node_id)?;
						report.actions.push((path, SyncAction::Untracked));
					}
					Some(RemoteChild::File { revision, .. }) if !is_directory => {
						match self.synchronize_file(node_id, *revision, discard_local_changes).await {
							Ok(action) => report.actions.push((path, action)),
							Err(e) if only.is_some() || is_fatal(&e) => return Err(e),
							Err(e) => {
								warn!("Failed to synchronize {}: {}", path, e);
								report.failures.push((path, e));
							}
						}
					}
					Some(RemoteChild::Directory { .. }) if is_directory => pending.push(node_id),
					Some(_) => {
						let error = ClientError::invalid_argument(format!(
							"{} changed between file and directory on the server",
							path
						));
						if only.is_some() {
							return Err(error);
						}
						report.failures.push((path, error));
					}
				}
			}
		}
		Ok(())
	}

	/// Synchronize a tracked file, or every tracked file below a directory
	pub async fn sync(&mut self, path: &str, discard_local_changes: bool) -> ClientResult<SyncReport> {
		let path = normalize(path)?;
		let (node_id, parent, is_file) = {
			let element = self.state.filesystem.require_path(&path)?;
			(element.node_id, element.parent, element.is_file())
		};
		let mut report = SyncReport::default();
		match (is_file, parent) {
			(true, Some(parent)) => {
				self.sync_directory(parent, Some(node_id), discard_local_changes, &mut report).await?
			}
			(true, None) => return Err(invalid_path(&path, "tracked file has no parent")),
			(false, _) => self.sync_directory(node_id, None, discard_local_changes, &mut report).await?,
		}
		Ok(report)
	}

	// ========================================================================
	// REMOVE
	// ========================================================================

	/// Stop tracking an element, optionally deleting its local and remote copies
	pub async fn remove(&mut self, path: &str, delete_local: bool, delete_remote: bool) -> ClientResult<()> {
		let path = normalize(path)?;
		let element = self.state.filesystem.require_path(&path)?.clone();
		if element.node_id == ROOT_NODE_ID {
			return Err(ClientError::invalid_argument("the root directory cannot be removed"));
		}
		if element.children().map_or(false, |c| !c.is_empty()) {
			return Err(ClientError::DirectoryHasTrackedChildren { path });
		}

		let local = self.state.filesystem.local_path(&path);
		if delete_local {
			remove_local(&local, &element).await?;
		}
		if delete_remote {
			let rsp = self.connection.delete(&FileDescriptor::NodeId(element.node_id)).await?;
			rsp.check("delete").map_err(|e| e.with_path(&path))?;
		}
		self.state.filesystem.unregister(element.node_id)?;
		Ok(())
	}

	// ========================================================================
	// INITIAL SYNCHRONIZATION
	// ========================================================================

	/// Rebuild the tracked model against a server instance that has not seen it
	///
	/// Elements that exist remotely by name are rebound to their remote node
	/// ids; file revisions restart at 0 so the next sync compares them again.
	/// Missing elements are created and files uploaded. Returns the paths
	/// that were created.
	pub async fn initial_synchronization(&mut self) -> ClientResult<Vec<String>> {
		info!("Initial synchronization");
		let previous = self.state.filesystem.take();
		let mut created = Vec::new();
		let mut pending: Vec<(u64, u64)> = vec![(ROOT_NODE_ID, ROOT_NODE_ID)];

		while let Some((old_id, new_id)) = pending.pop() {
			let directory = match previous.get(&old_id) {
				Some(d) => d,
				None => continue,
			};
			let descriptor = self.descriptor(new_id);
			let remote = self.query_children(&descriptor, &directory.path).await?;
			let by_name: BTreeMap<&str, &RemoteChild> =
				remote.elements.iter().map(|c| (c.name(), c)).collect();

			for child_id in directory.children().into_iter().flatten() {
				let child = match previous.get(child_id) {
					Some(c) => c,
					None => continue,
				};
				match by_name.get(child.name()) {
					Some(remote) if remote.is_directory() == child.is_directory() => {
						let kind = match &child.kind {
							LocalKind::File { file_type, snapshot, .. } => LocalKind::File {
								file_type: *file_type,
								revision: 0,
								snapshot: *snapshot,
							},
							LocalKind::Directory { .. } => LocalKind::new_directory(),
						};
						debug!("Rebinding {} to node {}", child.path, remote.node_id());
						self.state.filesystem.register(&child.path, remote.node_id(), kind)?;
						if child.is_directory() {
							pending.push((child.node_id, remote.node_id()));
						}
					}
					Some(_) => {
						warn!("{} changed between file and directory on the server, dropping", child.path);
					}
					None => {
						debug!("{} not found on the server, creating", child.path);
						let file_type = child.file_type();
						let response =
							self.create_remote(new_id, child.name(), &child.path, file_type).await?;
						let kind = match file_type {
							Some(file_type) => LocalKind::File {
								file_type,
								revision: response.revision.unwrap_or(0),
								snapshot: FileSnapshot::default(),
							},
							None => LocalKind::new_directory(),
						};
						self.state.filesystem.register(&child.path, response.node_id, kind)?;
						if file_type.is_some() {
							self.push_to_remote(response.node_id).await?;
						} else {
							pending.push((child.node_id, response.node_id));
						}
						created.push(child.path.clone());
					}
				}
			}
		}
		Ok(created)
	}
}

async fn remove_local(local: &Path, element: &LocalElement) -> ClientResult<()> {
	if element.is_directory() {
		let mut entries = match tokio::fs::read_dir(local).await {
			Ok(entries) => entries,
			Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
			Err(e) => return Err(e.into()),
		};
		if entries.next_entry().await?.is_some() {
			return Err(ClientError::invalid_argument(format!(
				"local directory is not empty: {}",
				element.path
			)));
		}
		tokio::fs::remove_dir(local).await?;
	} else {
		match tokio::fs::remove_file(local).await {
			Ok(()) => {}
			Err(e) if e.kind() == io::ErrorKind::NotFound => {
				debug!("Local copy of {} was already removed", element.path)
			}
			Err(e) => return Err(e.into()),
		}
	}
	Ok(())
}

// vim: ts=4
