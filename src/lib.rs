//! # Zyn - Remote File Synchronization Client
//!
//! Client side of the Zyn protocol: a tagged text wire format, a
//! request/response connection with out-of-band notifications, and a
//! synchronization engine that keeps a local mirror consistent with the
//! server under revision-based concurrency control.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use zyn::connection::Connection;
//! use zyn::filesystem::LocalFilesystem;
//! use zyn::state::ClientState;
//! use zyn::sync::ZynClient;
//! use zyn::transport::connect_tcp;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut connection = Connection::new(std::sync::Arc::new(connect_tcp("127.0.0.1", 8080).await?));
//!     connection.authenticate("admin", "admin").await?.check("authenticate")?;
//!     let state = ClientState::new("admin", "127.0.0.1", 8080, LocalFilesystem::new("./data"));
//!     let mut client = ZynClient::new(connection, state);
//!     client.fetch("/", false).await?;
//!     let report = client.sync("/", false).await?;
//!     println!("up to date: {}", report.is_up_to_date());
//!     Ok(())
//! }
//! ```

pub mod batch;
pub mod config;
pub mod connection;
pub mod diff;
pub mod error;
pub mod filesystem;
pub mod live_edit;
pub mod local_metadata;
pub mod logging;
pub mod protocol;
pub mod remote_edit;
pub mod state;
pub mod sync;
pub mod transport;
pub mod types;
pub mod utils;
pub mod validation;

// Re-export commonly used types and functions
pub use config::Config;
pub use connection::{Connection, Timeouts};
pub use error::{ClientError, ClientResult, ConnectionError, ServerError, StateError};
pub use sync::{SyncAction, SyncReport, ZynClient};
pub use types::{FileDescriptor, FileType};

// vim: ts=4
