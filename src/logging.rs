//! Logging setup
//!
//! Logs go to stderr through `tracing-subscriber`. The level defaults to
//! `info` (or `debug` with `--verbose`) and can be set with `RUST_LOG`:
//!
//! ```bash
//! RUST_LOG=debug zyn sync /
//! RUST_LOG=zyn::connection=trace zyn open /notes.txt
//! ```

use tracing_subscriber::EnvFilter;

fn default_filter(verbose: bool) -> &'static str {
	if verbose {
		"debug"
	} else {
		"info"
	}
}

/// Initialize the tracing subscriber with environment filter support
pub fn init_tracing(verbose: bool) {
	let filter = EnvFilter::try_from_default_env()
		.unwrap_or_else(|_| EnvFilter::new(default_filter(verbose)));
	let _ = tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).try_init();
}


// vim: ts=4
