//! On-disk change detection for tracked files
//!
//! A file counts as changed when its size or modification time differs
//! from the snapshot taken after the last synchronization.

use std::io;
use std::path::Path;
use std::time::UNIX_EPOCH;

use serde::{Deserialize, Serialize};

/// Size and mtime of a local file; empty until first captured
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct FileSnapshot {
	pub modified_secs: Option<u64>,
	pub modified_nanos: Option<u32>,
	pub size: Option<u64>,
}

impl FileSnapshot {
	pub async fn capture(path: &Path) -> io::Result<Self> {
		let metadata = tokio::fs::metadata(path).await?;
		let (secs, nanos) = match metadata.modified()?.duration_since(UNIX_EPOCH) {
			Ok(d) => (d.as_secs(), d.subsec_nanos()),
			Err(_) => (0, 0),
		};
		Ok(FileSnapshot {
			modified_secs: Some(secs),
			modified_nanos: Some(nanos),
			size: Some(metadata.len()),
		})
	}

	pub async fn has_changed(&self, path: &Path) -> io::Result<bool> {
		Ok(FileSnapshot::capture(path).await? != *self)
	}
}


// vim: ts=4
