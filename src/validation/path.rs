//! Remote path functions
//!
//! Remote paths are POSIX style and absolute. A normalized path has no
//! duplicate separators, no `.` or `..` components and no trailing
//! separator unless it is the root.

use super::ValidationError;

pub const REMOTE_ROOT: &str = "/";

fn rejected(path: &str, reason: &'static str) -> ValidationError {
	ValidationError::RemotePath { path: path.to_string(), reason }
}

fn collapse(path: &str) -> String {
	let mut parts: Vec<&str> = Vec::new();
	for component in path.split('/') {
		match component {
			"" | "." => {}
			".." => {
				parts.pop();
			}
			other => parts.push(other),
		}
	}
	format!("/{}", parts.join("/"))
}

/// Normalize user input into an absolute remote path
///
/// Backslashes are treated as separators and relative input is taken
/// relative to the root.
pub fn normalized_remote_path(path: &str) -> Result<String, ValidationError> {
	if path.is_empty() {
		return Err(rejected(path, "is empty"));
	}
	Ok(collapse(&path.replace('\\', "/")))
}

/// Split a normalized path into parent directory and name
pub fn split_remote_path(path: &str) -> Result<(String, String), ValidationError> {
	if path.contains("//") {
		return Err(rejected(path, "is not normalized"));
	}
	if !path.starts_with('/') {
		return Err(rejected(path, "is not absolute"));
	}
	if path.len() > 1 && path.ends_with('/') {
		return Err(rejected(path, "ends in a separator"));
	}
	if path.split('/').any(|c| c == "." || c == "..") {
		return Err(rejected(path, "contains a relative component"));
	}
	let slash = path.rfind('/').unwrap_or(0);
	let name = &path[slash + 1..];
	if name.is_empty() {
		return Err(rejected(path, "has no name to split off"));
	}
	let parent = if slash == 0 { REMOTE_ROOT } else { &path[..slash] };
	Ok((parent.to_string(), name.to_string()))
}

/// Join path segments into a normalized absolute path
pub fn join_remote_paths(parts: &[&str]) -> String {
	collapse(&parts.join("/"))
}


// vim: ts=4
