//! Client configuration
//!
//! The configuration follows a priority chain:
//! 1. Built-in defaults (Config::default())
//! 2. Config file (`zyn.toml` or `zyn.json` in the state directory, or `--config`)
//! 3. Environment variables (ZYN_* prefix)
//! 4. CLI flags (highest priority)

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::connection::Timeouts;
use crate::error::ClientError;
use crate::live_edit::LiveEditOptions;
use crate::validation::{validate_interval_ms, validate_port, validate_timeout_secs, ValidationError, Validator};

// ============================================================================
// MAIN CONFIGURATION STRUCT
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
	// ========================================================================
	// SERVER
	// ========================================================================
	pub address: String,
	pub port: u16,
	pub username: String,

	/// Only read from the environment, never written to disk
	#[serde(skip_serializing)]
	pub password: Option<String>,

	// ========================================================================
	// LOCAL MIRROR
	// ========================================================================
	/// Directory holding the local copies of tracked files
	pub data_dir: PathBuf,

	/// Directory holding the persisted client state and its lock
	pub state_dir: PathBuf,

	// ========================================================================
	// TIMEOUTS (seconds)
	// ========================================================================
	pub response_timeout_secs: u64,
	pub data_timeout_secs: u64,
	pub block_timeout_secs: u64,
	pub batch_timeout_secs: u64,

	// ========================================================================
	// CONNECTION
	// ========================================================================
	pub heartbeat: bool,
	pub heartbeat_interval_secs: u64,

	/// Trace every request and message
	pub debug_protocol: bool,

	// ========================================================================
	// LIVE EDIT
	// ========================================================================
	pub live_edit_interval_ms: u64,
}

impl Default for Config {
	fn default() -> Self {
		let timeouts = Timeouts::default();
		Config {
			address: "127.0.0.1".to_string(),
			port: 8080,
			username: "admin".to_string(),
			password: None,
			data_dir: PathBuf::from("."),
			state_dir: PathBuf::from(".zyn"),
			response_timeout_secs: timeouts.response.as_secs(),
			data_timeout_secs: timeouts.data.as_secs(),
			block_timeout_secs: timeouts.block.as_secs(),
			batch_timeout_secs: timeouts.batch.as_secs(),
			heartbeat: true,
			heartbeat_interval_secs: timeouts.heartbeat_interval.as_secs(),
			debug_protocol: false,
			live_edit_interval_ms: 1000,
		}
	}
}

impl Config {
	/// Parse a TOML or JSON file, chosen by extension
	pub fn from_file(path: &Path) -> Result<Self, ClientError> {
		let contents = std::fs::read_to_string(path)?;
		let config = match path.extension().and_then(|e| e.to_str()) {
			Some("json") => serde_json::from_str(&contents).map_err(|e| ClientError::InvalidConfig {
				message: format!("{}: {}", path.display(), e),
			})?,
			_ => toml::from_str(&contents).map_err(|e| ClientError::InvalidConfig {
				message: format!("{}: {}", path.display(), e),
			})?,
		};
		debug!("Loaded configuration from {}", path.display());
		Ok(config)
	}

	/// Defaults overlaid with `path` if given, else with the first config
	/// file found in `state_dir`
	pub fn load(path: Option<&Path>, state_dir: &Path) -> Result<Self, ClientError> {
		let mut config = match path {
			Some(path) => Config::from_file(path)?,
			None => {
				let found = ["zyn.toml", "zyn.json"]
					.iter()
					.map(|name| state_dir.join(name))
					.find(|candidate| candidate.exists());
				match found {
					Some(candidate) => Config::from_file(&candidate)?,
					None => Config { state_dir: state_dir.to_path_buf(), ..Config::default() },
				}
			}
		};
		config.apply_env(|key| std::env::var(key).ok())?;
		Ok(config)
	}

	/// Overlay ZYN_* variables looked up through `var`
	pub fn apply_env<F>(&mut self, var: F) -> Result<(), ClientError>
	where
		F: Fn(&str) -> Option<String>,
	{
		if let Some(address) = var("ZYN_ADDRESS") {
			self.address = address;
		}
		if let Some(port) = var("ZYN_PORT") {
			self.port = port.parse().map_err(|_| ClientError::InvalidConfig {
				message: format!("ZYN_PORT is not a port number: {}", port),
			})?;
		}
		if let Some(username) = var("ZYN_USERNAME") {
			self.username = username;
		}
		if let Some(password) = var("ZYN_PASSWORD") {
			self.password = Some(password);
		}
		if let Some(data_dir) = var("ZYN_DATA_DIR") {
			self.data_dir = PathBuf::from(data_dir);
		}
		Ok(())
	}

	pub fn timeouts(&self) -> Timeouts {
		Timeouts {
			response: Duration::from_secs(self.response_timeout_secs),
			data: Duration::from_secs(self.data_timeout_secs),
			block: Duration::from_secs(self.block_timeout_secs),
			batch: Duration::from_secs(self.batch_timeout_secs),
			heartbeat_interval: Duration::from_secs(self.heartbeat_interval_secs),
		}
	}

	pub fn live_edit_options(&self) -> LiveEditOptions {
		LiveEditOptions {
			sleep_interval: Duration::from_millis(self.live_edit_interval_ms),
			..LiveEditOptions::default()
		}
	}
}

impl Validator for Config {
	fn validate(&self) -> Result<(), ValidationError> {
		if self.address.is_empty() {
			return Err(ValidationError::Setting { name: "address", reason: "is empty".to_string() });
		}
		validate_port(self.port)?;
		validate_timeout_secs("response_timeout_secs", self.response_timeout_secs)?;
		validate_timeout_secs("data_timeout_secs", self.data_timeout_secs)?;
		validate_timeout_secs("block_timeout_secs", self.block_timeout_secs)?;
		validate_timeout_secs("batch_timeout_secs", self.batch_timeout_secs)?;
		if self.heartbeat {
			validate_timeout_secs("heartbeat_interval_secs", self.heartbeat_interval_secs)?;
		}
		validate_interval_ms("live_edit_interval_ms", self.live_edit_interval_ms)
	}
}


// vim: ts=4
