//! Persisted client state
//!
//! The state of one local mirror lives in a JSON file inside its state
//! directory: the server identity seen at the last connection and the
//! complete model of tracked elements.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::StateError;
use crate::filesystem::LocalFilesystem;

pub const STATE_DATA_FORMAT: u64 = 1;
pub const STATE_FILE_NAME: &str = "zyn-state.json";
const LOCK_FILE_NAME: &str = ".zyn-lock";

/// Server instance identity reported by Q-SYSTEM
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerIdentity {
	pub server_id: u64,
	pub started_at: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ClientState {
	pub data_format: u64,
	pub username: String,
	pub address: String,
	pub port: u16,
	#[serde(rename = "server_id")]
	pub server_id: Option<u64>,
	#[serde(rename = "server_started_at")]
	pub server_started_at: Option<u64>,
	pub filesystem: LocalFilesystem,
}

impl ClientState {
	pub fn new<S: Into<String>>(username: S, address: S, port: u16, filesystem: LocalFilesystem) -> Self {
		ClientState {
			data_format: STATE_DATA_FORMAT,
			username: username.into(),
			address: address.into(),
			port,
			server_id: None,
			server_started_at: None,
			filesystem,
		}
	}

	pub fn server_identity(&self) -> Option<ServerIdentity> {
		match (self.server_id, self.server_started_at) {
			(Some(server_id), Some(started_at)) => Some(ServerIdentity { server_id, started_at }),
			_ => None,
		}
	}

	pub fn set_server_identity(&mut self, identity: ServerIdentity) {
		self.server_id = Some(identity.server_id);
		self.server_started_at = Some(identity.started_at);
	}
}

/// Loads and stores `ClientState` for one state directory
pub struct StateManager {
	state_dir: PathBuf,
}

impl StateManager {
	pub fn new<P: Into<PathBuf>>(state_dir: P) -> Self {
		StateManager { state_dir: state_dir.into() }
	}

	pub fn state_path(&self) -> PathBuf {
		self.state_dir.join(STATE_FILE_NAME)
	}

	pub fn exists(&self) -> bool {
		self.state_path().exists()
	}

	/// Load saved state; `None` when nothing was saved yet
	pub async fn load(&self) -> Result<Option<ClientState>, StateError> {
		let path = self.state_path();
		if !path.exists() {
			return Ok(None);
		}

		let contents = tokio::fs::read_to_string(&path)
			.await
			.map_err(|e| StateError::LoadFailed { source: Box::new(e) })?;

		let state: ClientState = serde_json::from_str(&contents).map_err(|e| StateError::Corrupted {
			message: format!("Failed to parse state JSON: {}", e),
		})?;
		if state.data_format != STATE_DATA_FORMAT {
			return Err(StateError::UnsupportedFormat {
				found: state.data_format,
				expected: STATE_DATA_FORMAT,
			});
		}
		debug!("Loaded state of {} tracked elements from {}", state.filesystem.len(), path.display());
		Ok(Some(state))
	}

	/// Write state through a temporary file so a crash leaves the old copy intact
	pub async fn save(&self, state: &ClientState) -> Result<(), StateError> {
		let path = self.state_path();
		tokio::fs::create_dir_all(&self.state_dir)
			.await
			.map_err(|e| StateError::SaveFailed { source: Box::new(e) })?;

		let json = serde_json::to_string_pretty(state)
			.map_err(|e| StateError::SaveFailed { source: Box::new(e) })?;

		let temporary = path.with_extension("json.tmp");
		tokio::fs::write(&temporary, json)
			.await
			.map_err(|e| StateError::SaveFailed { source: Box::new(e) })?;
		tokio::fs::rename(&temporary, &path)
			.await
			.map_err(|e| StateError::SaveFailed { source: Box::new(e) })?;
		debug!("Saved state to {}", path.display());
		Ok(())
	}

	/// Acquire an exclusive lock on the state directory
	pub async fn lock(&self) -> Result<StateLock, StateError> {
		let lock_path = self.state_dir.join(LOCK_FILE_NAME);
		tokio::fs::create_dir_all(&self.state_dir).await.map_err(|e| StateError::LockFailed {
			message: format!("Failed to create state directory: {}", e),
		})?;

		if lock_path.exists() {
			return Err(StateError::LockFailed {
				message: format!(
					"Another client is using this directory. If stale, delete: {}",
					lock_path.display()
				),
			});
		}

		let pid = std::process::id();
		tokio::fs::write(&lock_path, pid.to_string()).await.map_err(|e| {
			StateError::LockFailed { message: format!("Failed to create lock file: {}", e) }
		})?;

		Ok(StateLock { path: lock_path })
	}
}

/// Lock file guard, removed on drop
pub struct StateLock {
	path: PathBuf,
}

impl StateLock {
	pub fn path(&self) -> &Path {
		&self.path
	}
}

impl Drop for StateLock {
	fn drop(&mut self) {
		let _ = std::fs::remove_file(&self.path);
	}
}


// vim: ts=4
