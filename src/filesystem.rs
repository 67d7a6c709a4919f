//! Local model of tracked remote elements
//!
//! Elements are indexed by node id and by remote path; both indexes are
//! kept in step by `register` and `unregister`. The root directory is
//! always present with node id 0.

use std::collections::{BTreeMap, BTreeSet};
use std::convert::TryFrom;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{ClientError, ClientResult, StateError};
use crate::local_metadata::FileSnapshot;
use crate::types::FileType;
use crate::validation::{join_remote_paths, split_remote_path, REMOTE_ROOT};

pub const ROOT_NODE_ID: u64 = 0;
pub const FILESYSTEM_DATA_FORMAT: u64 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "kind")]
pub enum LocalKind {
	#[serde(rename_all = "kebab-case")]
	File { file_type: FileType, revision: u64, snapshot: FileSnapshot },
	Directory { children: BTreeSet<u64> },
}

impl LocalKind {
	pub fn new_file(file_type: FileType) -> Self {
		LocalKind::File { file_type, revision: 0, snapshot: FileSnapshot::default() }
	}

	pub fn new_directory() -> Self {
		LocalKind::Directory { children: BTreeSet::new() }
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct LocalElement {
	pub path: String,
	pub node_id: u64,
	pub parent: Option<u64>,
	#[serde(flatten)]
	pub kind: LocalKind,
}

impl LocalElement {
	pub fn name(&self) -> &str {
		match self.path.rfind('/') {
			Some(i) => &self.path[i + 1..],
			None => &self.path,
		}
	}

	pub fn is_file(&self) -> bool {
		matches!(self.kind, LocalKind::File { .. })
	}

	pub fn is_directory(&self) -> bool {
		matches!(self.kind, LocalKind::Directory { .. })
	}

	pub fn file_type(&self) -> Option<FileType> {
		match &self.kind {
			LocalKind::File { file_type, .. } => Some(*file_type),
			LocalKind::Directory { .. } => None,
		}
	}

	pub fn revision(&self) -> Option<u64> {
		match &self.kind {
			LocalKind::File { revision, .. } => Some(*revision),
			LocalKind::Directory { .. } => None,
		}
	}

	pub fn snapshot(&self) -> Option<FileSnapshot> {
		match &self.kind {
			LocalKind::File { snapshot, .. } => Some(*snapshot),
			LocalKind::Directory { .. } => None,
		}
	}

	pub fn children(&self) -> Option<&BTreeSet<u64>> {
		match &self.kind {
			LocalKind::Directory { children } => Some(children),
			LocalKind::File { .. } => None,
		}
	}
}

/// On-disk entry of a tracked directory that is not tracked itself
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UntrackedElement {
	pub path: String,
	pub is_directory: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "FilesystemData", into = "FilesystemData")]
pub struct LocalFilesystem {
	root: PathBuf,
	elements: BTreeMap<u64, LocalElement>,
	paths: BTreeMap<String, u64>,
}

/// Persisted form of `LocalFilesystem`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct FilesystemData {
	data_format: u64,
	local_data_root: PathBuf,
	elements: Vec<LocalElement>,
}

impl From<LocalFilesystem> for FilesystemData {
	fn from(fs: LocalFilesystem) -> Self {
		FilesystemData {
			data_format: FILESYSTEM_DATA_FORMAT,
			local_data_root: fs.root,
			elements: fs.elements.into_iter().map(|(_, e)| e).collect(),
		}
	}
}

impl TryFrom<FilesystemData> for LocalFilesystem {
	type Error = StateError;

	fn try_from(data: FilesystemData) -> Result<Self, StateError> {
		if data.data_format != FILESYSTEM_DATA_FORMAT {
			return Err(StateError::UnsupportedFormat {
				found: data.data_format,
				expected: FILESYSTEM_DATA_FORMAT,
			});
		}
		let mut elements = BTreeMap::new();
		let mut paths = BTreeMap::new();
		for element in data.elements {
			if paths.insert(element.path.clone(), element.node_id).is_some() {
				return Err(StateError::Corrupted {
					message: format!("duplicate path {}", element.path),
				});
			}
			elements.insert(element.node_id, element);
		}
		match elements.get(&ROOT_NODE_ID) {
			Some(root) if root.is_directory() && root.path == REMOTE_ROOT => {}
			_ => {
				return Err(StateError::Corrupted { message: "root directory missing".to_string() })
			}
		}
		for element in elements.values() {
			if let Some(parent) = element.parent {
				let linked = elements
					.get(&parent)
					.and_then(|p| p.children())
					.map_or(false, |c| c.contains(&element.node_id));
				if !linked {
					return Err(StateError::Corrupted {
						message: format!("{} is not linked to its parent", element.path),
					});
				}
			}
		}
		Ok(LocalFilesystem { root: data.local_data_root, elements, paths })
	}
}

fn root_element() -> LocalElement {
	LocalElement {
		path: REMOTE_ROOT.to_string(),
		node_id: ROOT_NODE_ID,
		parent: None,
		kind: LocalKind::new_directory(),
	}
}

impl LocalFilesystem {
	pub fn new<P: Into<PathBuf>>(root: P) -> Self {
		let root = root.into();
		debug!("Initialized local filesystem, root={:?}", root);
		let mut fs = LocalFilesystem { root, elements: BTreeMap::new(), paths: BTreeMap::new() };
		fs.reset();
		fs
	}

	/// Forget everything except the root
	pub fn reset(&mut self) {
		self.elements.clear();
		self.paths.clear();
		self.elements.insert(ROOT_NODE_ID, root_element());
		self.paths.insert(REMOTE_ROOT.to_string(), ROOT_NODE_ID);
	}

	/// Take every tracked element out, leaving only the root
	pub fn take(&mut self) -> BTreeMap<u64, LocalElement> {
		let elements = std::mem::take(&mut self.elements);
		self.reset();
		elements
	}

	pub fn local_data_root(&self) -> &Path {
		&self.root
	}

	/// Tracks nothing but the root
	pub fn is_empty(&self) -> bool {
		self.elements.len() == 1
	}

	pub fn len(&self) -> usize {
		self.elements.len()
	}

	pub fn local_path(&self, remote_path: &str) -> PathBuf {
		let relative = remote_path.trim_start_matches('/');
		if relative.is_empty() {
			self.root.clone()
		} else {
			self.root.join(relative)
		}
	}

	pub fn is_tracked_path(&self, path: &str) -> bool {
		self.paths.contains_key(path)
	}

	pub fn is_tracked_node(&self, node_id: u64) -> bool {
		self.elements.contains_key(&node_id)
	}

	pub fn element(&self, node_id: u64) -> Option<&LocalElement> {
		self.elements.get(&node_id)
	}

	pub fn element_by_path(&self, path: &str) -> Option<&LocalElement> {
		self.paths.get(path).and_then(|id| self.elements.get(id))
	}

	pub fn require_path(&self, path: &str) -> ClientResult<&LocalElement> {
		self.element_by_path(path).ok_or_else(|| ClientError::NotTracked { path: path.to_string() })
	}

	pub fn require_node(&self, node_id: u64) -> ClientResult<&LocalElement> {
		self.elements
			.get(&node_id)
			.ok_or_else(|| ClientError::NotTracked { path: format!("node {}", node_id) })
	}

	pub fn elements(&self) -> impl Iterator<Item = &LocalElement> {
		self.elements.values()
	}

	/// Tracked children of a directory, ordered by node id
	pub fn children(&self, node_id: u64) -> Vec<&LocalElement> {
		self.elements
			.get(&node_id)
			.and_then(|e| e.children())
			.map(|ids| ids.iter().filter_map(|id| self.elements.get(id)).collect())
			.unwrap_or_default()
	}

	/// Start tracking `path` as `node_id`
	pub fn register(&mut self, path: &str, node_id: u64, kind: LocalKind) -> ClientResult<&LocalElement> {
		if self.paths.contains_key(path) || self.elements.contains_key(&node_id) {
			return Err(ClientError::AlreadyTracked { path: path.to_string() });
		}
		let (parent_path, _) = split_remote_path(path)
			.map_err(|e| ClientError::InvalidPath { path: path.to_string(), message: e.to_string() })?;
		let parent_id = *self
			.paths
			.get(&parent_path)
			.ok_or_else(|| ClientError::ParentNotTracked { path: path.to_string() })?;
		match self.elements.get_mut(&parent_id).map(|p| &mut p.kind) {
			Some(LocalKind::Directory { children }) => {
				children.insert(node_id);
			}
			_ => {
				return Err(ClientError::InvalidPath {
					path: path.to_string(),
					message: "parent is not a directory".to_string(),
				})
			}
		}
		info!("Tracking {} as node {}", path, node_id);
		self.paths.insert(path.to_string(), node_id);
		self.elements.insert(
			node_id,
			LocalElement { path: path.to_string(), node_id, parent: Some(parent_id), kind },
		);
		self.require_node(node_id)
	}

	/// Stop tracking `node_id`; directories must have no tracked children
	pub fn unregister(&mut self, node_id: u64) -> ClientResult<LocalElement> {
		let element = self.require_node(node_id)?;
		if node_id == ROOT_NODE_ID {
			return Err(ClientError::invalid_argument("the root directory cannot be untracked"));
		}
		if element.children().map_or(false, |c| !c.is_empty()) {
			return Err(ClientError::DirectoryHasTrackedChildren { path: element.path.clone() });
		}
		let parent = element.parent;
		let element = match self.elements.remove(&node_id) {
			Some(e) => e,
			None => return Err(ClientError::NotTracked { path: format!("node {}", node_id) }),
		};
		self.paths.remove(&element.path);
		if let Some(LocalKind::Directory { children }) =
			parent.and_then(|p| self.elements.get_mut(&p)).map(|p| &mut p.kind)
		{
			children.remove(&node_id);
		}
		info!("Untracked {}", element.path);
		Ok(element)
	}

	/// Record a completed synchronization of a file
	pub fn update_file(&mut self, node_id: u64, new_revision: u64, new_snapshot: FileSnapshot) {
		if let Some(LocalKind::File { revision, snapshot, .. }) =
			self.elements.get_mut(&node_id).map(|e| &mut e.kind)
		{
			*revision = new_revision;
			*snapshot = new_snapshot;
		}
	}

	pub fn set_revision(&mut self, node_id: u64, new_revision: u64) {
		if let Some(LocalKind::File { revision, .. }) =
			self.elements.get_mut(&node_id).map(|e| &mut e.kind)
		{
			*revision = new_revision;
		}
	}

	/// On-disk entries of a tracked directory that are not tracked
	pub async fn untracked_children(&self, node_id: u64) -> ClientResult<Vec<UntrackedElement>> {
		let directory = self.require_node(node_id)?;
		if !directory.is_directory() {
			return Err(ClientError::invalid_argument(format!(
				"{} is not a directory",
				directory.path
			)));
		}
		let mut untracked = Vec::new();
		let mut entries = tokio::fs::read_dir(self.local_path(&directory.path)).await?;
		while let Some(entry) = entries.next_entry().await? {
			let name = entry.file_name().to_string_lossy().into_owned();
			let path = join_remote_paths(&[&directory.path, &name]);
			if self.is_tracked_path(&path) {
				continue;
			}
			let metadata = tokio::fs::metadata(entry.path()).await?;
			if metadata.is_dir() {
				untracked.push(UntrackedElement { path, is_directory: true });
			} else if metadata.is_file() {
				untracked.push(UntrackedElement { path, is_directory: false });
			}
		}
		untracked.sort_by(|a, b| a.path.cmp(&b.path));
		Ok(untracked)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use tempfile::TempDir;

	#[test]
	fn test_register_and_lookup() {
		let mut fs = LocalFilesystem::new("/data");
		assert!(fs.is_empty());
		fs.register("/dir", 1, LocalKind::new_directory()).unwrap();
		fs.register("/dir/file", 2, LocalKind::new_file(FileType::Blob)).unwrap();
		assert_eq!(fs.element_by_path("/dir/file").unwrap().node_id, 2);
		assert_eq!(fs.element(1).unwrap().children().unwrap().len(), 1);
		assert_eq!(fs.local_path("/dir/file"), PathBuf::from("/data/dir/file"));
		assert_eq!(fs.element(2).unwrap().name(), "file");
	}

	#[test]
	fn test_register_errors() {
		let mut fs = LocalFilesystem::new("/data");
		fs.register("/f", 1, LocalKind::new_file(FileType::Blob)).unwrap();
		assert!(matches!(
			fs.register("/f", 5, LocalKind::new_directory()),
			Err(ClientError::AlreadyTracked { .. })
		));
		assert!(matches!(
			fs.register("/missing/f", 6, LocalKind::new_directory()),
			Err(ClientError::ParentNotTracked { .. })
		));
		assert!(matches!(
			fs.register("/f/g", 7, LocalKind::new_directory()),
			Err(ClientError::InvalidPath { .. })
		));
		assert!(matches!(
			fs.register("/../escape", 8, LocalKind::new_file(FileType::Blob)),
			Err(ClientError::InvalidPath { .. })
		));
		assert!(!fs.is_tracked_path("/../escape"));
	}

	#[test]
	fn test_unregister_directory_with_children_fails() {
		let mut fs = LocalFilesystem::new("/data");
		fs.register("/d", 1, LocalKind::new_directory()).unwrap();
		fs.register("/d/f", 2, LocalKind::new_file(FileType::RandomAccess)).unwrap();
		assert!(matches!(fs.unregister(1), Err(ClientError::DirectoryHasTrackedChildren { .. })));
		fs.unregister(2).unwrap();
		fs.unregister(1).unwrap();
		assert!(fs.is_empty());
		assert!(fs.unregister(ROOT_NODE_ID).is_err());
	}

	#[test]
	fn test_serde_round_trip_keeps_indexes() {
		let mut fs = LocalFilesystem::new("/data");
		fs.register("/d", 1, LocalKind::new_directory()).unwrap();
		fs.register("/d/f", 2, LocalKind::new_file(FileType::Blob)).unwrap();
		fs.set_revision(2, 9);
		let json = serde_json::to_string(&fs).unwrap();
		let restored: LocalFilesystem = serde_json::from_str(&json).unwrap();
		assert_eq!(restored, fs);
		assert_eq!(restored.element_by_path("/d/f").unwrap().revision(), Some(9));
	}

	#[test]
	fn test_unsupported_data_format_is_rejected() {
		let json = r#"{"data-format":2,"local-data-root":"/data","elements":[]}"#;
		assert!(serde_json::from_str::<LocalFilesystem>(json).is_err());
	}

	#[tokio::test]
	async fn test_untracked_children() {
		let dir = TempDir::new().unwrap();
		tokio::fs::write(dir.path().join("tracked"), b"a").await.unwrap();
		tokio::fs::write(dir.path().join("new"), b"b").await.unwrap();
		tokio::fs::create_dir(dir.path().join("sub")).await.unwrap();

		let mut fs = LocalFilesystem::new(dir.path());
		fs.register("/tracked", 1, LocalKind::new_file(FileType::Blob)).unwrap();
		let untracked = fs.untracked_children(ROOT_NODE_ID).await.unwrap();
		assert_eq!(
			untracked,
			vec![
				UntrackedElement { path: "/new".to_string(), is_directory: false },
				UntrackedElement { path: "/sub".to_string(), is_directory: true },
			]
		);
	}
}

// vim: ts=4
