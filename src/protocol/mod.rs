//! Zyn wire protocol
//!
//! The protocol is a tagged text format (`TAG:payload;`) carrying requests,
//! responses and server notifications. File content never travels inside a
//! message: it is streamed as raw bytes right after the message that
//! announces its size.
//!
//! # Example
//!
//! ```
//! use zyn::protocol::{decode_message, encoder, Message};
//!
//! let request = encoder::authenticate(1, "admin", "admin");
//! assert_eq!(&request[..], &b"V:1;A:T:U:1;;L:S:U:5;B:admin;;S:U:5;B:admin;;;;E:;"[..]);
//!
//! match decode_message(b"V:1;RSP:T:U:1;;U:0;;E:;").unwrap() {
//!     Message::Response(rsp) => assert!(!rsp.is_error()),
//!     Message::Notification(_) => unreachable!(),
//! }
//! ```

pub mod encoder;
pub mod error;
pub mod error_codes;
pub mod field;
pub mod messages;
pub mod responses;
pub mod tree;

pub use error::{ProtocolError, ProtocolResult};
pub use field::{Field, ListElement};
pub use messages::{decode_message, FileChange, Message, Notification, RawNotification, Response};
pub use responses::*;
pub use tree::{parse_tree, Node, Tree};

// vim: ts=4
