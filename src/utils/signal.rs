//! Cooperative cancellation on SIGINT/SIGTERM

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, warn};

/// Shared flag set once termination was requested
#[derive(Debug, Clone, Default)]
pub struct ShutdownFlag {
	requested: Arc<AtomicBool>,
}

impl ShutdownFlag {
	pub fn new() -> Self {
		ShutdownFlag::default()
	}

	pub fn request(&self) {
		self.requested.store(true, Ordering::SeqCst);
	}

	pub fn is_requested(&self) -> bool {
		self.requested.load(Ordering::SeqCst)
	}
}

/// Set `flag` on the first SIGINT or SIGTERM, exit on the second
pub fn setup_signal_handlers(flag: ShutdownFlag) {
	tokio::spawn(async move {
		use tokio::signal;

		let mut sigterm = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
			Ok(stream) => stream,
			Err(e) => {
				warn!("Failed to setup SIGTERM handler: {}", e);
				return;
			}
		};

		let mut sigint = match signal::unix::signal(signal::unix::SignalKind::interrupt()) {
			Ok(stream) => stream,
			Err(e) => {
				warn!("Failed to setup SIGINT handler: {}", e);
				return;
			}
		};

		loop {
			let code = tokio::select! {
				_ = sigterm.recv() => 143,
				_ = sigint.recv() => 130,
			};
			if flag.is_requested() {
				debug!("Second termination signal, exiting");
				std::process::exit(code);
			}
			debug!("Termination requested, finishing current iteration");
			flag.request();
		}
	});
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_flag_is_shared_between_clones() {
		let flag = ShutdownFlag::new();
		let clone = flag.clone();
		assert!(!clone.is_requested());
		flag.request();
		assert!(clone.is_requested());
	}
}

// vim: ts=4
