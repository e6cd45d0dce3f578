// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

use std::io;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

/// Byte-stream abstraction the Reader/Writer loops drive.
///
/// Deliberately narrow: the supervisor only ever needs to push bytes out and pull bytes
/// in, in order. TLS, websocket framing and proxy negotiation all happen below this trait,
/// during connection establishment, not across it.
#[async_trait::async_trait]
pub trait Transport: Send {
    async fn write_all(&mut self, buf: &[u8]) -> io::Result<()>;

    /// Reads whatever is immediately available into `buf`, returning the number of bytes
    /// read. Returns `Ok(0)` when the peer has closed the stream.
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Splits the transport into independent read and write halves so the Reader and
    /// Writer loops can make progress concurrently instead of contending for one lock.
    fn split(self: Box<Self>) -> (Box<dyn TransportReader>, Box<dyn TransportWriter>);
}

/// Read half produced by [`Transport::split`]. Driven exclusively by the Reader loop.
#[async_trait::async_trait]
pub trait TransportReader: Send {
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

/// Write half produced by [`Transport::split`]. Shared by the Writer and Publish-Writer
/// loops, which never need to read, so the only lock left is over writes.
#[async_trait::async_trait]
pub trait TransportWriter: Send {
    async fn write_all(&mut self, buf: &[u8]) -> io::Result<()>;
}

/// Plain TCP transport, the only one a broker connection needs once proxying and TLS
/// handshakes have already produced a connected socket.
pub struct TcpTransport {
    stream: TcpStream,
}

impl TcpTransport {
    #[must_use]
    pub const fn new(stream: TcpStream) -> Self {
        Self { stream }
    }

    /// # Errors
    ///
    /// Returns error if the TCP connection cannot be established.
    pub async fn connect(addr: std::net::SocketAddr) -> io::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Self::new(stream))
    }
}

#[async_trait::async_trait]
impl Transport for TcpTransport {
    async fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.stream.write_all(buf).await
    }

    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf).await
    }

    fn split(self: Box<Self>) -> (Box<dyn TransportReader>, Box<dyn TransportWriter>) {
        let (read_half, write_half) = self.stream.into_split();
        (
            Box::new(TcpReadHalf { read_half }),
            Box::new(TcpWriteHalf { write_half }),
        )
    }
}

struct TcpReadHalf {
    read_half: OwnedReadHalf,
}

#[async_trait::async_trait]
impl TransportReader for TcpReadHalf {
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read_half.read(buf).await
    }
}

struct TcpWriteHalf {
    write_half: OwnedWriteHalf,
}

#[async_trait::async_trait]
impl TransportWriter for TcpWriteHalf {
    async fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.write_half.write_all(buf).await
    }
}

/// In-memory transport backed by `tokio::io::duplex`, used by tests to drive the
/// Reader/Writer/Handler loops against scripted broker byte sequences without a socket.
pub struct DuplexTransport {
    inner: tokio::io::DuplexStream,
}

impl DuplexTransport {
    #[must_use]
    pub const fn new(inner: tokio::io::DuplexStream) -> Self {
        Self { inner }
    }

    /// Builds a connected pair: one end for the engine under test, one end standing in
    /// for the broker so the test can write ConnAck/PubAck bytes and read what the
    /// engine sent.
    #[must_use]
    pub fn pair(max_buf_size: usize) -> (Self, Self) {
        let (a, b) = tokio::io::duplex(max_buf_size);
        (Self::new(a), Self::new(b))
    }
}

#[async_trait::async_trait]
impl Transport for DuplexTransport {
    async fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.inner.write_all(buf).await
    }

    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf).await
    }

    fn split(self: Box<Self>) -> (Box<dyn TransportReader>, Box<dyn TransportWriter>) {
        let (read_half, write_half) = tokio::io::split(self.inner);
        (
            Box::new(DuplexReadHalf { read_half }),
            Box::new(DuplexWriteHalf { write_half }),
        )
    }
}

struct DuplexReadHalf {
    read_half: ReadHalf<tokio::io::DuplexStream>,
}

#[async_trait::async_trait]
impl TransportReader for DuplexReadHalf {
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read_half.read(buf).await
    }
}

struct DuplexWriteHalf {
    write_half: WriteHalf<tokio::io::DuplexStream>,
}

#[async_trait::async_trait]
impl TransportWriter for DuplexWriteHalf {
    async fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.write_half.write_all(buf).await
    }
}

/// A write half shared between the Writer and Publish-Writer loops, the only two that
/// ever write to the transport. The Reader owns its half outright and never contends for
/// this lock, which is what makes the deadlock the single shared mutex used to produce
/// structurally impossible now.
pub type SharedWriter = Arc<Mutex<Box<dyn TransportWriter>>>;

#[must_use]
pub fn shared_writer(writer: Box<dyn TransportWriter>) -> SharedWriter {
    Arc::new(Mutex::new(writer))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_duplex_pair_round_trip() {
        let (mut client, mut broker) = DuplexTransport::pair(64);
        client.write_all(b"hello").await.unwrap();
        let mut buf = [0_u8; 5];
        let n = broker.read(&mut buf).await.unwrap();
        assert_eq!(n, 5);
        assert_eq!(&buf, b"hello");
    }

    #[tokio::test]
    async fn test_split_allows_independent_concurrent_read_and_write() {
        let (engine_side, mut broker_side) = DuplexTransport::pair(64);
        let (mut reader, writer) = Box::new(engine_side).split();
        let writer = shared_writer(writer);

        // Reader is blocked waiting for bytes the broker has not sent yet; with a
        // single shared lock this would starve the writer below forever.
        let read_task = tokio::spawn(async move {
            let mut buf = [0_u8; 5];
            reader.read(&mut buf).await.unwrap();
            buf
        });

        tokio::task::yield_now().await;
        writer.lock().await.write_all(b"ready").await.unwrap();

        let mut probe = [0_u8; 5];
        broker_side.read(&mut probe).await.unwrap();
        assert_eq!(&probe, b"ready");

        broker_side.write_all(b"later").await.unwrap();
        let buf = read_task.await.unwrap();
        assert_eq!(&buf, b"later");
    }
}
