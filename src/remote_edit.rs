//! Translate local edits of a random-access file into remote operations
//!
//! Each opcode becomes individual RA-D/RA-I requests. Offsets are shifted
//! by the net size change of every operation already applied, so each
//! request addresses the file as the server currently holds it.

use std::convert::TryFrom;

use tracing::{debug, trace};

use crate::connection::Connection;
use crate::diff::{opcodes, Tag};
use crate::error::ClientResult;
use crate::protocol::RevisionResponse;

/// Apply the difference between `original` and `edited` to a file open for write
///
/// `revision` is advanced after every acknowledged operation; when a later
/// operation fails it holds the revision of the last one that succeeded.
pub async fn edit_random_access_file(
	connection: &mut Connection,
	node_id: u64,
	revision: &mut u64,
	original: &[u8],
	edited: &[u8],
) -> ClientResult<()> {
	let mut adjustment: i64 = 0;
	let mut operations = 0usize;
	for code in opcodes(original, edited) {
		let offset = (code.a.start as i64 + adjustment) as u64;
		let removed = code.a.len() as u64;
		let added = &edited[code.b.clone()];
		match code.tag {
			Tag::Equal => continue,
			Tag::Delete => {
				remote_delete(connection, node_id, revision, offset, removed).await?;
				operations += 1;
			}
			Tag::Insert => {
				remote_insert(connection, node_id, revision, offset, added).await?;
				operations += 1;
			}
			Tag::Replace => {
				remote_delete(connection, node_id, revision, offset, removed).await?;
				remote_insert(connection, node_id, revision, offset, added).await?;
				operations += 2;
			}
		}
		adjustment += added.len() as i64 - removed as i64;
	}
	debug!("Applied {} edits to node {}, revision {}", operations, node_id, revision);
	Ok(())
}

async fn remote_delete(
	connection: &mut Connection,
	node_id: u64,
	revision: &mut u64,
	offset: u64,
	size: u64,
) -> ClientResult<()> {
	trace!("Deleting {} bytes at {} of node {}", size, offset, node_id);
	let rsp = connection.ra_delete(node_id, *revision, offset, size).await?;
	rsp.check("delete")?;
	*revision = RevisionResponse::try_from(&rsp)?.revision;
	Ok(())
}

async fn remote_insert(
	connection: &mut Connection,
	node_id: u64,
	revision: &mut u64,
	offset: u64,
	data: &[u8],
) -> ClientResult<()> {
	trace!("Inserting {} bytes at {} of node {}", data.len(), offset, node_id);
	let rsp = connection.ra_insert(node_id, *revision, offset, data).await?;
	rsp.check("insert")?;
	*revision = RevisionResponse::try_from(&rsp)?.revision;
	Ok(())
}

// vim: ts=4
