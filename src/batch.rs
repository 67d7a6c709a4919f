//! Batched random-access edits
//!
//! A batch collects edits for one file and sends them in a single exchange:
//! a header announcing the number of operations, then each operation's
//! header and data without waiting in between for anything but its own
//! response. Offsets must be sequential in submission order; the server
//! rejects the first operation that is not and reports its index.

use std::convert::TryFrom;

use tracing::debug;

use crate::connection::Connection;
use crate::error::{ConnectionResult, ServerError};
use crate::protocol::encoder;
use crate::protocol::BatchEditResponse;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOperation {
	Delete { offset: u64, size: u64 },
	Insert { offset: u64, data: Vec<u8> },
	Write { offset: u64, data: Vec<u8> },
}

impl BatchOperation {
	fn header(&self) -> Vec<u8> {
		match self {
			BatchOperation::Delete { offset, size } => {
				encoder::batch_operation(encoder::BATCH_OPERATION_DELETE, *offset, *size)
			}
			BatchOperation::Insert { offset, data } => {
				encoder::batch_operation(encoder::BATCH_OPERATION_INSERT, *offset, data.len() as u64)
			}
			BatchOperation::Write { offset, data } => {
				encoder::batch_operation(encoder::BATCH_OPERATION_WRITE, *offset, data.len() as u64)
			}
		}
	}

	fn data(&self) -> Option<&[u8]> {
		match self {
			BatchOperation::Delete { .. } => None,
			BatchOperation::Insert { data, .. } | BatchOperation::Write { data, .. } => Some(data),
		}
	}
}

/// Edits collected for one open random-access file
pub struct BatchEdit<'c> {
	connection: &'c mut Connection,
	node_id: u64,
	revision: u64,
	operations: Vec<BatchOperation>,
}

impl<'c> BatchEdit<'c> {
	pub fn new(connection: &'c mut Connection, node_id: u64, revision: u64) -> Self {
		BatchEdit { connection, node_id, revision, operations: Vec::new() }
	}

	pub fn delete(&mut self, offset: u64, size: u64) -> &mut Self {
		self.operations.push(BatchOperation::Delete { offset, size });
		self
	}

	pub fn insert<D: Into<Vec<u8>>>(&mut self, offset: u64, data: D) -> &mut Self {
		self.operations.push(BatchOperation::Insert { offset, data: data.into() });
		self
	}

	pub fn write<D: Into<Vec<u8>>>(&mut self, offset: u64, data: D) -> &mut Self {
		self.operations.push(BatchOperation::Write { offset, data: data.into() });
		self
	}

	pub fn number_of_operations(&self) -> usize {
		self.operations.len()
	}

	/// Send all operations; returns the revision after the last one
	///
	/// A rejected operation ends the batch. The returned `ServerError`
	/// carries the index of that operation and the revision the server
	/// reported with it.
	pub async fn commit(self) -> ConnectionResult<Result<u64, ServerError>> {
		let BatchEdit { connection, node_id, revision, operations } = self;
		let id = connection.next_request_id();
		let timeouts = *connection.timeouts();
		let _guard = connection.lock_writes().await;

		let header =
			encoder::batch_edit(id, node_id, revision, operations.len() as u64);
		connection.write(&header).await?;
		let rsp = connection.read_response(timeouts.response).await?;
		if let Err(e) = rsp.check("batch edit") {
			return Ok(Err(e));
		}

		let mut latest = revision;
		for (index, operation) in operations.iter().enumerate() {
			connection.write(&operation.header()).await?;
			if let Some(data) = operation.data() {
				connection.write_data(data).await?;
			}
			let rsp = connection.read_response(timeouts.batch).await?;
			if rsp.is_error() {
				let mut error = ServerError::new(rsp.error_code(), "batch edit");
				match BatchEditResponse::try_from(&rsp) {
					Ok(reply) => {
						error = error
							.with_operation_index(reply.operation_index)
							.with_revision(reply.revision);
					}
					Err(_) => error = error.with_operation_index(index as u64),
				}
				debug!("Batch edit of node {} rejected: {}", node_id, error);
				return Ok(Err(error));
			}
			latest = BatchEditResponse::try_from(&rsp)?.revision;
		}
		Ok(Ok(latest))
	}
}

impl Connection {
	/// Start collecting a batch for `node_id` at `revision`
	pub fn batch_edit(&mut self, node_id: u64, revision: u64) -> BatchEdit<'_> {
		BatchEdit::new(self, node_id, revision)
	}
}


// vim: ts=4
