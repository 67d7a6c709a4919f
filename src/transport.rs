//! Byte stream underneath a connection
//!
//! The connection layer only needs to send bytes, receive up to a number of
//! bytes with a timeout, and close. Anything implementing tokio's
//! `AsyncRead + AsyncWrite` can be wrapped with `IoStream`.

use std::io;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::debug;

/// Outcome of a single receive
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Received {
	Data(Vec<u8>),
	/// Nothing arrived within the timeout
	Timeout,
	/// Peer closed the stream
	Closed,
}

#[async_trait]
pub trait ByteStream: Send + Sync {
	/// Write all of `data`
	async fn send(&self, data: &[u8]) -> io::Result<()>;

	/// Read at most `max_bytes`. A zero timeout polls without waiting.
	async fn receive(&self, max_bytes: usize, timeout: Duration) -> io::Result<Received>;

	async fn close(&self) -> io::Result<()>;
}

/// `ByteStream` over any tokio stream
pub struct IoStream<S> {
	reader: Mutex<ReadHalf<S>>,
	writer: Mutex<WriteHalf<S>>,
}

impl<S> IoStream<S>
where
	S: AsyncRead + AsyncWrite + Send + 'static,
{
	pub fn new(stream: S) -> Self {
		let (reader, writer) = tokio::io::split(stream);
		IoStream { reader: Mutex::new(reader), writer: Mutex::new(writer) }
	}
}

#[async_trait]
impl<S> ByteStream for IoStream<S>
where
	S: AsyncRead + AsyncWrite + Send + 'static,
{
	async fn send(&self, data: &[u8]) -> io::Result<()> {
		let mut writer = self.writer.lock().await;
		writer.write_all(data).await?;
		writer.flush().await
	}

	async fn receive(&self, max_bytes: usize, timeout: Duration) -> io::Result<Received> {
		let mut reader = self.reader.lock().await;
		let mut buf = vec![0u8; max_bytes.max(1)];
		match tokio::time::timeout(timeout, reader.read(&mut buf)).await {
			Err(_) => Ok(Received::Timeout),
			Ok(Ok(0)) => Ok(Received::Closed),
			Ok(Ok(n)) => {
				buf.truncate(n);
				Ok(Received::Data(buf))
			}
			Ok(Err(e)) => Err(e),
		}
	}

	async fn close(&self) -> io::Result<()> {
		let mut writer = self.writer.lock().await;
		writer.shutdown().await
	}
}

/// Connect to a Zyn server over plain TCP
pub async fn connect_tcp(address: &str, port: u16) -> io::Result<IoStream<TcpStream>> {
	debug!("Connecting to {}:{}", address, port);
	let stream = TcpStream::connect((address, port)).await?;
	stream.set_nodelay(true)?;
	Ok(IoStream::new(stream))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn test_receive_data_and_close() {
		let (client, mut server) = tokio::io::duplex(64);
		let stream = IoStream::new(client);

		server.write_all(b"hello").await.unwrap();
		let received = stream.receive(16, Duration::from_secs(1)).await.unwrap();
		assert_eq!(received, Received::Data(b"hello".to_vec()));

		drop(server);
		let received = stream.receive(16, Duration::from_secs(1)).await.unwrap();
		assert_eq!(received, Received::Closed);
	}

	#[tokio::test]
	async fn test_receive_timeout() {
		let (client, _server) = tokio::io::duplex(64);
		let stream = IoStream::new(client);
		let received = stream.receive(16, Duration::from_millis(20)).await.unwrap();
		assert_eq!(received, Received::Timeout);
		let received = stream.receive(16, Duration::from_secs(0)).await.unwrap();
		assert_eq!(received, Received::Timeout);
	}

	#[tokio::test]
	async fn test_send_reaches_peer() {
		let (client, mut server) = tokio::io::duplex(64);
		let stream = IoStream::new(client);
		stream.send(b"V:1;HB:E:;").await.unwrap();
		let mut buf = [0u8; 10];
		server.read_exact(&mut buf).await.unwrap();
		assert_eq!(&buf, b"V:1;HB:E:;");
	}
}

// vim: ts=4
