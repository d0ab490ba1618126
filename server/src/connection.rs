//! Line-oriented connection handles
//!
//! A [`Connection`] is owned by exactly one session worker. Its send side, a
//! [`PeerHandle`], is cloned into the session registry so that other sessions
//! can deliver broadcast lines to it.

use log::debug;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{self, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

/// Server-assigned identifier, unique for the lifetime of the process
pub type ConnectionId = u64;

type LineSource = BufReader<Box<dyn AsyncRead + Send + Unpin>>;
type LineSink = Box<dyn AsyncWrite + Send + Unpin>;

/// Write side of a connection.
///
/// Cloning is cheap and every clone writes to the same socket. Writes are
/// serialized by an async mutex so concurrent broadcasts never interleave
/// bytes inside a line.
#[derive(Clone)]
pub struct PeerHandle {
    id: ConnectionId,
    addr: SocketAddr,
    sink: Arc<Mutex<LineSink>>,
}

impl PeerHandle {
    pub fn new<W>(id: ConnectionId, addr: SocketAddr, writer: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            id,
            addr,
            sink: Arc::new(Mutex::new(Box::new(writer))),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Writes `line` followed by `\n` and flushes
    pub async fn send_line(&self, line: &str) -> io::Result<()> {
        let mut sink = self.sink.lock().await;
        sink.write_all(line.as_bytes()).await?;
        sink.write_all(b"\n").await?;
        sink.flush().await
    }

    /// Shuts down the write direction, signalling end-of-stream to the peer
    pub async fn shutdown(&self) -> io::Result<()> {
        self.sink.lock().await.shutdown().await
    }
}

impl fmt::Debug for PeerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerHandle")
            .field("id", &self.id)
            .field("addr", &self.addr)
            .finish()
    }
}

/// One accepted client: a line reader plus the shared write side
pub struct Connection {
    id: ConnectionId,
    addr: SocketAddr,
    reader: LineSource,
    /// Bytes of a line whose read was interrupted by a deadline
    pending: Vec<u8>,
    peer: PeerHandle,
}

impl Connection {
    /// Wraps a freshly accepted TCP stream
    pub fn accepted(id: ConnectionId, stream: TcpStream, addr: SocketAddr) -> Self {
        let (reader, writer) = stream.into_split();
        Self::from_parts(id, addr, reader, writer)
    }

    /// Builds a connection from any reader/writer pair
    pub fn from_parts<R, W>(id: ConnectionId, addr: SocketAddr, reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let reader: Box<dyn AsyncRead + Send + Unpin> = Box::new(reader);
        Self {
            id,
            addr,
            reader: BufReader::new(reader),
            pending: Vec::new(),
            peer: PeerHandle::new(id, addr, writer),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn peer(&self) -> &PeerHandle {
        &self.peer
    }

    /// Reads the next line without its terminator; `None` at end-of-stream.
    ///
    /// Invalid UTF-8 is replaced with U+FFFD rather than failing the read.
    /// Cancel safe, so it can be raced against a deadline: bytes already
    /// consumed stay buffered for the next call.
    pub async fn read_line(&mut self) -> io::Result<Option<String>> {
        let read = self.reader.read_until(b'\n', &mut self.pending).await?;
        if read == 0 && self.pending.is_empty() {
            return Ok(None);
        }

        let mut line = std::mem::take(&mut self.pending);
        if line.last() == Some(&b'\n') {
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
        }
        Ok(Some(String::from_utf8_lossy(&line).into_owned()))
    }

    pub async fn write_line(&mut self, line: &str) -> io::Result<()> {
        self.peer.send_line(line).await
    }

    /// Closes the write direction. The read half is released on drop.
    pub async fn close(&mut self) {
        if let Err(e) = self.peer.shutdown().await {
            debug!("Error closing connection {} ({}): {}", self.id, self.addr, e);
        }
    }
}
