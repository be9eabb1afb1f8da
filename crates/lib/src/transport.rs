//! Framed message links used by both channels.
//!
//! A link delivers whole frames (single-line JSON texts) in order over a
//! reliable point-to-point stream, and reports peer hangup as an error
//! rather than an empty read.

use crate::error::{ClientError, Result};
use async_trait::async_trait;
use std::io;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

/// One reliable frame channel (command or event side).
#[async_trait]
pub trait MessageLink: Send {
    /// Write one frame.
    async fn send(&mut self, frame: &[u8]) -> io::Result<()>;
    /// Read the next frame. EOF is an error: the peer hung up.
    async fn recv(&mut self) -> io::Result<Vec<u8>>;
}

/// Newline-delimited framing over any byte stream. Tests run it over
/// `tokio::io::duplex` pairs; production traffic uses [`TcpLink`].
pub struct FramedLink<S> {
    stream: BufReader<S>,
    /// Bytes of a frame whose delimiter has not arrived yet. Both channels
    /// wrap `recv` in a bounded timeout; keeping the partial frame here makes
    /// a timed-out receive lose nothing.
    partial: Vec<u8>,
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send> FramedLink<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream: BufReader::new(stream),
            partial: Vec::new(),
        }
    }
}

#[async_trait]
impl<S: AsyncRead + AsyncWrite + Unpin + Send> MessageLink for FramedLink<S> {
    async fn send(&mut self, frame: &[u8]) -> io::Result<()> {
        let writer = self.stream.get_mut();
        writer.write_all(frame).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await
    }

    async fn recv(&mut self) -> io::Result<Vec<u8>> {
        let n = self.stream.read_until(b'\n', &mut self.partial).await?;
        if n == 0 || self.partial.last() != Some(&b'\n') {
            // Clean hangup, or EOF inside a frame.
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "peer closed the connection",
            ));
        }
        let mut frame = std::mem::take(&mut self.partial);
        while frame.last() == Some(&b'\n') || frame.last() == Some(&b'\r') {
            frame.pop();
        }
        Ok(frame)
    }
}

/// A framed link over TCP.
pub type TcpLink = FramedLink<TcpStream>;

/// Dial a `tcp://host:port` endpoint.
pub async fn connect(endpoint: &str) -> Result<TcpLink> {
    let addr = endpoint.strip_prefix("tcp://").ok_or_else(|| {
        ClientError::Connection(format!(
            "unsupported endpoint {endpoint} (expected tcp://host:port)"
        ))
    })?;
    let stream = TcpStream::connect(addr)
        .await
        .map_err(|e| ClientError::Connection(format!("connecting to {endpoint}: {e}")))?;
    Ok(FramedLink::new(stream))
}
