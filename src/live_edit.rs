//! Live editing of random-access files
//!
//! Files stay open for write while the loop runs. Each iteration applies
//! change notifications from other clients to the in-memory copy and the
//! local file, then pushes local edits made since the previous iteration.
//! The loop suspends only while waiting for notifications and between
//! iterations, where it calls the injected `Sleeper`.

use std::collections::BTreeMap;
use std::convert::TryFrom;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::error::{ClientError, ClientResult, ConnectionError};
use crate::filesystem::LocalKind;
use crate::local_metadata::FileSnapshot;
use crate::protocol::{FileChange, Notification, ReadResponse};
use crate::remote_edit::edit_random_access_file;
use crate::sync::{normalize, ZynClient};
use crate::types::FileType;
use crate::utils::ShutdownFlag;

#[async_trait]
pub trait Sleeper: Send + Sync {
	async fn sleep(&self, duration: Duration);
}

pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
	async fn sleep(&self, duration: Duration) {
		tokio::time::sleep(duration).await
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LiveEditOptions {
	pub sleep_interval: Duration,
	/// Stop after this many iterations
	pub max_iterations: Option<u64>,
	/// How long the first notification read of an iteration may wait
	pub notification_wait: Duration,
}

impl Default for LiveEditOptions {
	fn default() -> Self {
		LiveEditOptions {
			sleep_interval: Duration::from_secs(1),
			max_iterations: None,
			notification_wait: Duration::from_millis(100),
		}
	}
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LiveEditSummary {
	pub iterations: u64,
	pub notifications_applied: u64,
	pub pushes: u64,
}

/// A tracked file held open for write with its last synchronized content
struct OpenLocalFile {
	node_id: u64,
	path: String,
	local: PathBuf,
	revision: u64,
	snapshot: FileSnapshot,
	content: Vec<u8>,
}

fn splice(content: &mut Vec<u8>, offset: usize, remove: usize, data: &[u8]) {
	let start = offset.min(content.len());
	let end = offset.saturating_add(remove).min(content.len());
	content.splice(start..end, data.iter().copied());
}

/// Replay a remote change on the cached content
///
/// A modification replaces the announced range even when fewer bytes came
/// back from the read.
fn apply_remote_bytes(content: &mut Vec<u8>, kind: ChangeKind, offset: usize, size: usize, data: &[u8]) {
	match kind {
		ChangeKind::Modified => splice(content, offset, size, data),
		ChangeKind::Inserted => splice(content, offset, 0, data),
		ChangeKind::Deleted => splice(content, offset, size, &[]),
	}
}

impl ZynClient {
	/// Keep random-access files synchronized until interrupted
	///
	/// Every opened file is closed on the way out, whether the loop ended
	/// normally, hit its iteration bound, was interrupted or failed.
	pub async fn open(
		&mut self,
		paths: &[&str],
		options: &LiveEditOptions,
		sleeper: &dyn Sleeper,
		shutdown: &ShutdownFlag,
	) -> ClientResult<LiveEditSummary> {
		let mut files = BTreeMap::new();
		let result = self.live_edit(paths, options, sleeper, shutdown, &mut files).await;
		for file in files.values() {
			if let Err(e) = self.close_file(file.node_id, &file.path).await {
				warn!("Failed to close {}: {}", file.path, e);
			}
		}
		result
	}

	async fn live_edit(
		&mut self,
		paths: &[&str],
		options: &LiveEditOptions,
		sleeper: &dyn Sleeper,
		shutdown: &ShutdownFlag,
		files: &mut BTreeMap<u64, OpenLocalFile>,
	) -> ClientResult<LiveEditSummary> {
		let mut node_ids = Vec::with_capacity(paths.len());
		for path in paths {
			let path = normalize(path)?;
			let element = self.state.filesystem.require_path(&path)?;
			if element.file_type() != Some(FileType::RandomAccess) {
				return Err(ClientError::invalid_argument(format!(
					"only random access files can be opened: {}",
					path
				)));
			}
			node_ids.push(element.node_id);
		}
		for node_id in node_ids {
			self.open_and_sync(node_id, files).await?;
		}

		let mut summary = LiveEditSummary::default();
		loop {
			if shutdown.is_requested() {
				info!("Live edit interrupted");
				break;
			}
			summary.iterations += 1;
			debug!("Live edit iteration {}", summary.iterations);

			let mut wait = options.notification_wait;
			while let Some(notification) = self.connection.pop_notification(wait).await? {
				wait = Duration::from_millis(0);
				match notification {
					Notification::Disconnected { reason } => {
						warn!("Server disconnected: {}", reason);
						return Err(ConnectionError::ConnectionLost.into());
					}
					Notification::Closed { node_id } => {
						if let Some(file) = files.remove(&node_id) {
							warn!("Server closed {}", file.path);
						}
					}
					Notification::Modified(change) => {
						if self.apply_change(files, &change, ChangeKind::Modified).await? {
							summary.notifications_applied += 1;
						}
					}
					Notification::Inserted(change) => {
						if self.apply_change(files, &change, ChangeKind::Inserted).await? {
							summary.notifications_applied += 1;
						}
					}
					Notification::Deleted(change) => {
						if self.apply_change(files, &change, ChangeKind::Deleted).await? {
							summary.notifications_applied += 1;
						}
					}
				}
			}

			for file in files.values_mut() {
				if self.push_local_changes(file).await? {
					summary.pushes += 1;
				}
			}

			if options.max_iterations.map_or(false, |max| summary.iterations >= max) {
				break;
			}
			sleeper.sleep(options.sleep_interval).await;
		}
		Ok(summary)
	}

	async fn open_and_sync(&mut self, node_id: u64, files: &mut BTreeMap<u64, OpenLocalFile>) -> ClientResult<()> {
		let element = self.state.filesystem.require_node(node_id)?.clone();
		let open = self.open_file(node_id, &element.path, true).await?;
		let local = self.state.filesystem.local_path(&element.path);
		files.insert(node_id, OpenLocalFile {
			node_id,
			path: element.path.clone(),
			local: local.clone(),
			revision: open.revision,
			snapshot: FileSnapshot::default(),
			content: Vec::new(),
		});

		let (revision, snapshot) = match &element.kind {
			LocalKind::File { revision, snapshot, .. } => (*revision, *snapshot),
			LocalKind::Directory { .. } => {
				return Err(ClientError::invalid_argument(format!("{} is not a file", element.path)))
			}
		};
		let local_changed = snapshot.has_changed(&local).await?;
		let remote_changed = open.revision > revision;
		match (local_changed, remote_changed) {
			(true, true) => return Err(ClientError::UnresolvedConflict { path: element.path }),
			(false, true) => {
				let content = self.read_remote_content(&open, &element.path).await?;
				tokio::fs::write(&local, &content).await?;
				let snapshot = FileSnapshot::capture(&local).await?;
				self.state.filesystem.update_file(node_id, open.revision, snapshot);
			}
			(true, false) => {
				self.push_random_access_changes(&element, &open).await?;
			}
			(false, false) => {}
		}

		let (revision, snapshot) = match self.state.filesystem.require_node(node_id)?.kind {
			LocalKind::File { revision, snapshot, .. } => (revision, snapshot),
			LocalKind::Directory { .. } => (open.revision, FileSnapshot::default()),
		};
		let content = tokio::fs::read(&local).await?;
		if let Some(file) = files.get_mut(&node_id) {
			file.revision = revision;
			file.snapshot = snapshot;
			file.content = content;
		}
		info!("Opened {} at revision {}", element.path, revision);
		Ok(())
	}

	/// Apply a change made by another client; false if it was not for an open file
	async fn apply_change(
		&mut self,
		files: &mut BTreeMap<u64, OpenLocalFile>,
		change: &FileChange,
		kind: ChangeKind,
	) -> ClientResult<bool> {
		let file = match files.get_mut(&change.node_id) {
			Some(f) => f,
			None => return Ok(false),
		};
		if change.revision <= file.revision {
			debug!("Ignoring stale change of {} at revision {}", file.path, change.revision);
			return Ok(false);
		}
		if file.snapshot.has_changed(&file.local).await? {
			return Err(ClientError::UnresolvedConflict { path: file.path.clone() });
		}

		let data = match kind {
			ChangeKind::Modified | ChangeKind::Inserted => {
				let (rsp, data) = self.connection.read_file(change.node_id, change.offset, change.size).await?;
				rsp.check("read").map_err(|e| e.with_path(&file.path))?;
				ReadResponse::try_from(&rsp)?;
				data
			}
			ChangeKind::Deleted => Vec::new(),
		};
		apply_remote_bytes(&mut file.content, kind, change.offset as usize, change.size as usize, &data);

		tokio::fs::write(&file.local, &file.content).await?;
		file.revision = change.revision;
		file.snapshot = FileSnapshot::capture(&file.local).await?;
		self.state.filesystem.update_file(file.node_id, file.revision, file.snapshot);
		debug!("Applied remote change to {}, revision {}", file.path, file.revision);
		Ok(true)
	}

	/// Push edits made to the local file since the last iteration
	async fn push_local_changes(&mut self, file: &mut OpenLocalFile) -> ClientResult<bool> {
		if !file.snapshot.has_changed(&file.local).await? {
			return Ok(false);
		}
		let edited = tokio::fs::read(&file.local).await?;
		let result = edit_random_access_file(
			&mut self.connection,
			file.node_id,
			&mut file.revision,
			&file.content,
			&edited,
		)
		.await;
		if let Err(e) = result {
			self.state.filesystem.set_revision(file.node_id, file.revision);
			return Err(e);
		}
		file.content = edited;
		file.snapshot = FileSnapshot::capture(&file.local).await?;
		self.state.filesystem.update_file(file.node_id, file.revision, file.snapshot);
		info!("Pushed local changes of {}, revision {}", file.path, file.revision);
		Ok(true)
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChangeKind {
	Modified,
	Inserted,
	Deleted,
}


// vim: ts=4
