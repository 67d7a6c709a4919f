//! Range checks for numeric settings

use super::ValidationError;

/// Longest wait accepted for any timeout, in seconds
pub const MAX_WAIT_SECS: u64 = 3600;

fn setting(name: &'static str, reason: String) -> ValidationError {
	ValidationError::Setting { name, reason }
}

/// A timeout or heartbeat interval must be positive and at most an hour
pub fn validate_timeout_secs(name: &'static str, secs: u64) -> Result<(), ValidationError> {
	match secs {
		0 => Err(setting(name, "must not be zero".to_string())),
		s if s > MAX_WAIT_SECS => {
			Err(setting(name, format!("is {} seconds, above the limit of {}", s, MAX_WAIT_SECS)))
		}
		_ => Ok(()),
	}
}

pub fn validate_port(port: u16) -> Result<(), ValidationError> {
	if port == 0 {
		return Err(setting("port", "must not be zero".to_string()));
	}
	Ok(())
}

/// The live edit pause, same bounds as a timeout but in milliseconds
pub fn validate_interval_ms(name: &'static str, ms: u64) -> Result<(), ValidationError> {
	match ms {
		0 => Err(setting(name, "must not be zero".to_string())),
		m if m > MAX_WAIT_SECS * 1000 => {
			Err(setting(name, format!("is {} ms, above the limit of {} s", m, MAX_WAIT_SECS)))
		}
		_ => Ok(()),
	}
}


// vim: ts=4
