//! Request/response exchange over a byte stream
//!
//! A `Connection` owns the transaction counter, the input buffer and the
//! queue of notifications that arrived while a response was awaited. Only
//! one request is in flight at a time; the optional heartbeat task is the
//! only other writer and shares the write lock with every exchange.

use std::collections::VecDeque;
use std::convert::TryFrom;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{oneshot, Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::error::{ConnectionError, ConnectionResult};
use crate::protocol::encoder;
use crate::protocol::error::ProtocolError;
use crate::protocol::{decode_message, Message, Notification, ReadResponse, Response};
use crate::transport::{ByteStream, IoStream, Received};
use crate::types::{AuthorityKind, FileDescriptor, FileType, OpenMode, UserGroupChange};

const END_OF_MESSAGE: &[u8] = b"E:;";
const RECEIVE_CHUNK: usize = 64 * 1024;

/// Bounds for every kind of wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
	/// Control responses
	pub response: Duration,
	/// Raw data following a read response
	pub data: Duration,
	/// Acknowledgement of one uploaded blob block
	pub block: Duration,
	/// Response to one batch edit operation
	pub batch: Duration,
	pub heartbeat_interval: Duration,
}

impl Default for Timeouts {
	fn default() -> Self {
		Timeouts {
			response: Duration::from_secs(10),
			data: Duration::from_secs(60),
			block: Duration::from_secs(300),
			batch: Duration::from_secs(120),
			heartbeat_interval: Duration::from_secs(60),
		}
	}
}

/// Result of streaming a file range into a sink
#[derive(Debug, Clone, PartialEq)]
pub enum StreamOutcome {
	Complete { bytes: u64, revision: Option<u64> },
	/// Server rejected one of the reads; nothing after it was written
	Failed(Response),
}

struct Heartbeat {
	stop: Option<oneshot::Sender<()>>,
	handle: JoinHandle<()>,
}

impl Heartbeat {
	fn start(stream: Arc<dyn ByteStream>, write_lock: Arc<Mutex<()>>, period: Duration) -> Self {
		let (stop, mut stopped) = oneshot::channel::<()>();
		let handle = tokio::spawn(async move {
			let mut interval = tokio::time::interval_at(Instant::now() + period, period);
			loop {
				tokio::select! {
					_ = &mut stopped => break,
					_ = interval.tick() => {
						let _guard = write_lock.lock().await;
						trace!("Sending heartbeat");
						if let Err(e) = stream.send(encoder::HEARTBEAT).await {
							warn!("Heartbeat failed, stopping: {}", e);
							break;
						}
					}
				}
			}
		});
		Heartbeat { stop: Some(stop), handle }
	}

	fn stop(&mut self) {
		if let Some(stop) = self.stop.take() {
			let _ = stop.send(());
		}
		self.handle.abort();
	}
}

pub struct Connection {
	stream: Arc<dyn ByteStream>,
	write_lock: Arc<Mutex<()>>,
	next_transaction_id: u64,
	transaction_override: Option<u64>,
	buffer: Vec<u8>,
	notifications: VecDeque<Notification>,
	timeouts: Timeouts,
	debug_protocol: bool,
	heartbeat: Option<Heartbeat>,
}

impl Connection {
	pub fn new(stream: Arc<dyn ByteStream>) -> Self {
		Connection {
			stream,
			write_lock: Arc::new(Mutex::new(())),
			next_transaction_id: 1,
			transaction_override: None,
			buffer: Vec::new(),
			notifications: VecDeque::new(),
			timeouts: Timeouts::default(),
			debug_protocol: false,
			heartbeat: None,
		}
	}

	/// Wrap any tokio stream
	pub fn from_io<S>(stream: S) -> Self
	where
		S: AsyncRead + AsyncWrite + Send + 'static,
	{
		Connection::new(Arc::new(IoStream::new(stream)))
	}

	pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
		self.timeouts = timeouts;
		self
	}

	pub fn timeouts(&self) -> &Timeouts {
		&self.timeouts
	}

	/// Log every request and message at trace level
	pub fn enable_debug_messages(&mut self) {
		self.debug_protocol = true;
	}

	/// Id the next request will carry
	pub fn transaction_id(&self) -> u64 {
		self.transaction_override.unwrap_or(self.next_transaction_id)
	}

	/// Use `id` for the next request instead of the counter
	pub fn override_next_transaction_id(&mut self, id: u64) {
		self.transaction_override = Some(id);
	}

	fn consume_transaction_id(&mut self) -> u64 {
		if let Some(id) = self.transaction_override.take() {
			return id;
		}
		let id = self.next_transaction_id;
		self.next_transaction_id += 1;
		id
	}

	// ========================================================================
	// LIFECYCLE
	// ========================================================================

	pub fn start_heartbeat(&mut self) {
		if self.heartbeat.is_some() {
			return;
		}
		let period = self.timeouts.heartbeat_interval;
		info!("Starting heartbeat with interval of {}s", period.as_secs());
		self.heartbeat =
			Some(Heartbeat::start(Arc::clone(&self.stream), Arc::clone(&self.write_lock), period));
	}

	pub fn stop_heartbeat(&mut self) {
		if let Some(mut heartbeat) = self.heartbeat.take() {
			heartbeat.stop();
		}
	}

	pub async fn disconnect(&mut self) -> ConnectionResult<()> {
		self.stop_heartbeat();
		let _guard = self.lock_writes().await;
		self.stream.close().await?;
		Ok(())
	}

	// ========================================================================
	// FRAMING
	// ========================================================================

	/// Held for a whole exchange so the heartbeat cannot interleave
	pub(crate) async fn lock_writes(&self) -> OwnedMutexGuard<()> {
		Arc::clone(&self.write_lock).lock_owned().await
	}

	pub(crate) async fn write(&mut self, data: &[u8]) -> ConnectionResult<()> {
		if self.debug_protocol {
			trace!("Write: {}", String::from_utf8_lossy(data));
		}
		self.stream.send(data).await?;
		Ok(())
	}

	/// Raw bytes following a request header
	pub(crate) async fn write_data(&mut self, data: &[u8]) -> ConnectionResult<()> {
		if self.debug_protocol {
			trace!("Write {} data bytes", data.len());
		}
		self.stream.send(data).await?;
		Ok(())
	}

	fn take_buffered_message(&mut self) -> ConnectionResult<Option<Message>> {
		let end = match find(&self.buffer, END_OF_MESSAGE) {
			Some(i) => i + END_OF_MESSAGE.len(),
			None => return Ok(None),
		};
		let frame: Vec<u8> = self.buffer.drain(..end).collect();
		if self.debug_protocol {
			trace!("Read message: {}", String::from_utf8_lossy(&frame));
		}
		Ok(Some(decode_message(&frame)?))
	}

	/// Next complete message, or `None` if none arrived within `timeout`
	pub async fn read_message(&mut self, timeout: Duration) -> ConnectionResult<Option<Message>> {
		let deadline = Instant::now() + timeout;
		loop {
			if let Some(message) = self.take_buffered_message()? {
				return Ok(Some(message));
			}
			let remaining = deadline.saturating_duration_since(Instant::now());
			match self.stream.receive(RECEIVE_CHUNK, remaining).await? {
				Received::Data(data) => self.buffer.extend_from_slice(&data),
				Received::Timeout => return Ok(None),
				Received::Closed => return Err(ConnectionError::ConnectionLost),
			}
		}
	}

	/// Next response; notifications received meanwhile are queued
	pub async fn read_response(&mut self, timeout: Duration) -> ConnectionResult<Response> {
		let deadline = Instant::now() + timeout;
		loop {
			let remaining = deadline.saturating_duration_since(Instant::now());
			match self.read_message(remaining).await? {
				Some(Message::Response(rsp)) => return Ok(rsp),
				Some(Message::Notification(notification)) => {
					debug!("Queued notification: {}", notification);
					self.notifications.push_back(notification);
				}
				None => return Err(ConnectionError::Timeout { waited: timeout }),
			}
		}
	}

	/// Exactly `length` raw bytes, buffered bytes first
	pub async fn read_data(&mut self, length: usize, timeout: Duration) -> ConnectionResult<Vec<u8>> {
		let take = length.min(self.buffer.len());
		let mut data: Vec<u8> = self.buffer.drain(..take).collect();
		let deadline = Instant::now() + timeout;
		while data.len() < length {
			let remaining = deadline.saturating_duration_since(Instant::now());
			let wanted = (length - data.len()).min(RECEIVE_CHUNK);
			match self.stream.receive(wanted, remaining).await? {
				Received::Data(chunk) => data.extend_from_slice(&chunk),
				Received::Timeout => return Err(ConnectionError::Timeout { waited: timeout }),
				Received::Closed => return Err(ConnectionError::ConnectionLost),
			}
		}
		Ok(data)
	}

	async fn send_receive(&mut self, request: Vec<u8>) -> ConnectionResult<Response> {
		let _guard = self.lock_writes().await;
		self.write(&request).await?;
		self.read_response(self.timeouts.response).await
	}

	// ========================================================================
	// NOTIFICATIONS
	// ========================================================================

	async fn read_notification(&mut self, timeout: Duration) -> ConnectionResult<bool> {
		match self.read_message(timeout).await? {
			Some(Message::Notification(notification)) => {
				self.notifications.push_back(notification);
				Ok(true)
			}
			Some(Message::Response(rsp)) => Err(ConnectionError::UnexpectedMessage {
				message: format!(
					"response to transaction {} while waiting for notifications",
					rsp.transaction_id()
				),
			}),
			None => Ok(false),
		}
	}

	/// True if a notification is queued or arrives within `timeout`
	pub async fn check_for_notifications(&mut self, timeout: Duration) -> ConnectionResult<bool> {
		if !self.notifications.is_empty() {
			return Ok(true);
		}
		self.read_notification(timeout).await
	}

	pub async fn pop_notification(
		&mut self,
		timeout: Duration,
	) -> ConnectionResult<Option<Notification>> {
		if self.notifications.is_empty() {
			self.read_notification(timeout).await?;
		}
		Ok(self.notifications.pop_front())
	}

	pub fn queued_notifications(&self) -> usize {
		self.notifications.len()
	}

	// ========================================================================
	// AUTHENTICATION
	// ========================================================================

	pub async fn heartbeat(&mut self) -> ConnectionResult<()> {
		let _guard = self.lock_writes().await;
		self.write(encoder::HEARTBEAT).await
	}

	pub async fn authenticate(&mut self, username: &str, password: &str) -> ConnectionResult<Response> {
		let id = self.consume_transaction_id();
		self.send_receive(encoder::authenticate(id, username, password)).await
	}

	pub async fn authenticate_with_token(&mut self, token: &str) -> ConnectionResult<Response> {
		let id = self.consume_transaction_id();
		self.send_receive(encoder::authenticate_with_token(id, token)).await
	}

	pub async fn allocate_authentication_token(&mut self) -> ConnectionResult<Response> {
		let id = self.consume_transaction_id();
		self.send_receive(encoder::allocate_authentication_token(id)).await
	}

	// ========================================================================
	// FILESYSTEM
	// ========================================================================

	pub async fn create_file(
		&mut self,
		parent: &FileDescriptor,
		name: &str,
		file_type: FileType,
		block_size: Option<u64>,
	) -> ConnectionResult<Response> {
		let id = self.consume_transaction_id();
		self.send_receive(encoder::create_file(id, parent, name, file_type, block_size)).await
	}

	pub async fn create_directory(
		&mut self,
		parent: &FileDescriptor,
		name: &str,
	) -> ConnectionResult<Response> {
		let id = self.consume_transaction_id();
		self.send_receive(encoder::create_directory(id, parent, name)).await
	}

	pub async fn delete(&mut self, descriptor: &FileDescriptor) -> ConnectionResult<Response> {
		let id = self.consume_transaction_id();
		self.send_receive(encoder::delete(id, descriptor)).await
	}

	pub async fn open(
		&mut self,
		descriptor: &FileDescriptor,
		mode: OpenMode,
	) -> ConnectionResult<Response> {
		let id = self.consume_transaction_id();
		self.send_receive(encoder::open(id, descriptor, mode)).await
	}

	pub async fn open_read(&mut self, descriptor: &FileDescriptor) -> ConnectionResult<Response> {
		self.open(descriptor, OpenMode::Read).await
	}

	pub async fn open_write(&mut self, descriptor: &FileDescriptor) -> ConnectionResult<Response> {
		self.open(descriptor, OpenMode::Write).await
	}

	pub async fn close(&mut self, node_id: u64) -> ConnectionResult<Response> {
		let id = self.consume_transaction_id();
		self.send_receive(encoder::close(id, node_id)).await
	}

	pub async fn query_children(&mut self, descriptor: &FileDescriptor) -> ConnectionResult<Response> {
		let id = self.consume_transaction_id();
		self.send_receive(encoder::query_children(id, descriptor)).await
	}

	pub async fn query_element(&mut self, descriptor: &FileDescriptor) -> ConnectionResult<Response> {
		let id = self.consume_transaction_id();
		self.send_receive(encoder::query_element(id, descriptor)).await
	}

	pub async fn query_element_properties(
		&mut self,
		descriptor: &FileDescriptor,
		parent: &FileDescriptor,
	) -> ConnectionResult<Response> {
		let id = self.consume_transaction_id();
		self.send_receive(encoder::query_element_properties(id, descriptor, parent)).await
	}

	// ========================================================================
	// FILE CONTENT
	// ========================================================================

	/// Upload `data` as the whole content of a blob file
	pub async fn blob_write(
		&mut self,
		node_id: u64,
		revision: u64,
		data: &[u8],
		block_size: Option<u64>,
	) -> ConnectionResult<Response> {
		let mut reader = data;
		self.blob_write_stream(node_id, revision, &mut reader, data.len() as u64, block_size).await
	}

	/// Upload `size` bytes from `reader` in blocks, each acknowledged by the server
	pub async fn blob_write_stream<R>(
		&mut self,
		node_id: u64,
		revision: u64,
		reader: &mut R,
		size: u64,
		block_size: Option<u64>,
	) -> ConnectionResult<Response>
	where
		R: AsyncRead + Unpin + Send,
	{
		let block_size = match block_size {
			Some(b) if b > 0 && b < size => b,
			_ => size,
		};
		let id = self.consume_transaction_id();
		let _guard = self.lock_writes().await;
		self.write(&encoder::blob_write(id, node_id, revision, size, block_size)).await?;
		let rsp = self.read_response(self.timeouts.response).await?;
		if rsp.is_error() {
			return Ok(rsp);
		}

		let mut sent = 0u64;
		let mut block = vec![0u8; block_size as usize];
		while sent < size {
			let wanted = block_size.min(size - sent) as usize;
			let n = read_up_to(reader, &mut block[..wanted]).await?;
			if n == 0 {
				break;
			}
			self.write_data(&block[..n]).await?;
			sent += n as u64;
			let ack = self.read_response(self.timeouts.block).await?;
			if ack.is_error() {
				return Ok(ack);
			}
		}
		if sent != size {
			return Err(ConnectionError::SizeMismatch { expected: size, sent });
		}
		self.read_response(self.timeouts.block).await
	}

	async fn random_access_upload(&mut self, request: Vec<u8>, data: &[u8]) -> ConnectionResult<Response> {
		let _guard = self.lock_writes().await;
		self.write(&request).await?;
		let rsp = self.read_response(self.timeouts.response).await?;
		if rsp.is_error() {
			return Ok(rsp);
		}
		self.write_data(data).await?;
		self.read_response(self.timeouts.response).await
	}

	pub async fn ra_write(
		&mut self,
		node_id: u64,
		revision: u64,
		offset: u64,
		data: &[u8],
	) -> ConnectionResult<Response> {
		let id = self.consume_transaction_id();
		let request = encoder::ra_write(id, node_id, revision, offset, data.len() as u64);
		self.random_access_upload(request, data).await
	}

	pub async fn ra_insert(
		&mut self,
		node_id: u64,
		revision: u64,
		offset: u64,
		data: &[u8],
	) -> ConnectionResult<Response> {
		let id = self.consume_transaction_id();
		let request = encoder::ra_insert(id, node_id, revision, offset, data.len() as u64);
		self.random_access_upload(request, data).await
	}

	pub async fn ra_delete(
		&mut self,
		node_id: u64,
		revision: u64,
		offset: u64,
		size: u64,
	) -> ConnectionResult<Response> {
		let id = self.consume_transaction_id();
		self.send_receive(encoder::ra_delete(id, node_id, revision, offset, size)).await
	}

	/// Read a range; data is empty when the server reports an error
	pub async fn read_file(
		&mut self,
		node_id: u64,
		offset: u64,
		size: u64,
	) -> ConnectionResult<(Response, Vec<u8>)> {
		let id = self.consume_transaction_id();
		let _guard = self.lock_writes().await;
		self.write(&encoder::read(id, node_id, offset, size)).await?;
		let rsp = self.read_response(self.timeouts.response).await?;
		if rsp.is_error() {
			return Ok((rsp, Vec::new()));
		}
		let header = ReadResponse::try_from(&rsp)?;
		let data = self.read_data(header.size as usize, self.timeouts.data).await?;
		Ok((rsp, data))
	}

	/// Download `size` bytes starting at `offset` into `sink`, `block_size` bytes per read
	pub async fn read_file_stream<W>(
		&mut self,
		node_id: u64,
		offset: u64,
		size: u64,
		block_size: u64,
		sink: &mut W,
	) -> ConnectionResult<StreamOutcome>
	where
		W: AsyncWrite + Unpin + Send,
	{
		let block_size = block_size.max(1);
		let end = offset.checked_add(size).ok_or_else(|| {
			ProtocolError::malformed(format!("read range {}+{} does not fit in 64 bits", offset, size))
		})?;
		let mut position = offset;
		let mut revision = None;
		while position < end {
			let wanted = block_size.min(end - position);
			let (rsp, data) = self.read_file(node_id, position, wanted).await?;
			if rsp.is_error() {
				return Ok(StreamOutcome::Failed(rsp));
			}
			revision = Some(ReadResponse::try_from(&rsp)?.revision);
			if data.is_empty() {
				debug!("Server returned no data at offset {} of node {}", position, node_id);
				break;
			}
			let wanted = wanted as usize;
			let data = if data.len() > wanted { &data[..wanted] } else { &data[..] };
			sink.write_all(data).await?;
			position += data.len() as u64;
		}
		sink.flush().await?;
		Ok(StreamOutcome::Complete { bytes: position - offset, revision })
	}

	// ========================================================================
	// SERVER
	// ========================================================================

	pub async fn query_counters(&mut self) -> ConnectionResult<Response> {
		let id = self.consume_transaction_id();
		self.send_receive(encoder::query_counters(id)).await
	}

	pub async fn query_system(&mut self) -> ConnectionResult<Response> {
		let id = self.consume_transaction_id();
		self.send_receive(encoder::query_system(id)).await
	}

	pub async fn add_user_group(&mut self, kind: AuthorityKind, name: &str) -> ConnectionResult<Response> {
		let id = self.consume_transaction_id();
		self.send_receive(encoder::add_user_group(id, kind, name)).await
	}

	pub async fn modify_user_group(
		&mut self,
		kind: AuthorityKind,
		name: &str,
		changes: &[UserGroupChange],
	) -> ConnectionResult<Response> {
		let id = self.consume_transaction_id();
		self.send_receive(encoder::modify_user_group(id, kind, name, changes)).await
	}

	pub(crate) fn next_request_id(&mut self) -> u64 {
		self.consume_transaction_id()
	}
}

impl Drop for Connection {
	fn drop(&mut self) {
		self.stop_heartbeat();
	}
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
	haystack.windows(needle.len()).position(|w| w == needle)
}

/// Fill `buf` unless the reader ends first
async fn read_up_to<R>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize>
where
	R: AsyncRead + Unpin,
{
	let mut filled = 0;
	while filled < buf.len() {
		let n = reader.read(&mut buf[filled..]).await?;
		if n == 0 {
			break;
		}
		filled += n;
	}
	Ok(filled)
}


// vim: ts=4
