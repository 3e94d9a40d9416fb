//! Purpose: Track live stream connections and surface their lines as one event stream.
//! Exports: `ConnId`, `ConnEvent`, `Registry`.
//! Role: Binary-side registry; exclusively owns every accepted stream connection.
//! Invariants: End-of-stream and read errors are reported exactly once per connection.
//! Invariants: Nothing here blocks beyond the readiness wait itself.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader, Lines, ReadBuf};
use tokio::net::{TcpStream, UnixStream, tcp, unix};
use tokio_stream::{Stream, StreamExt, StreamMap};
use tracing::debug;

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct ConnId(u64);

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug)]
pub enum ConnEvent {
    Line(String),
    Eof,
    Failed(io::Error),
}

enum ReadHalf {
    Tcp(tcp::OwnedReadHalf),
    Unix(unix::OwnedReadHalf),
}

impl AsyncRead for ReadHalf {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(half) => Pin::new(half).poll_read(cx, buf),
            Self::Unix(half) => Pin::new(half).poll_read(cx, buf),
        }
    }
}

enum ConnWriter {
    Tcp(tcp::OwnedWriteHalf),
    Unix(unix::OwnedWriteHalf),
}

impl ConnWriter {
    async fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        match self {
            Self::Tcp(half) => half.write_all(data).await,
            Self::Unix(half) => half.write_all(data).await,
        }
    }
}

/// Line reader that reports EOF as an event of its own. `StreamMap` silently
/// drops a stream the moment it yields `None`, which would otherwise hide
/// disconnects from the reactor.
struct ConnReader {
    lines: Lines<BufReader<ReadHalf>>,
    done: bool,
}

impl ConnReader {
    fn new(read: ReadHalf) -> Self {
        Self {
            lines: BufReader::new(read).lines(),
            done: false,
        }
    }
}

impl Stream for ConnReader {
    type Item = ConnEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<ConnEvent>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }
        match Pin::new(&mut this.lines).poll_next_line(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(Some(line))) => Poll::Ready(Some(ConnEvent::Line(line))),
            Poll::Ready(Ok(None)) => {
                this.done = true;
                Poll::Ready(Some(ConnEvent::Eof))
            }
            Poll::Ready(Err(err)) => {
                this.done = true;
                Poll::Ready(Some(ConnEvent::Failed(err)))
            }
        }
    }
}

struct Connection {
    writer: ConnWriter,
    peer: String,
}

/// Owner of every live stream connection, keyed by `ConnId`. The read halves
/// feed one merged readiness stream; the write halves stay addressable for
/// replies and the shutdown broadcast.
pub struct Registry {
    readers: StreamMap<ConnId, ConnReader>,
    writers: HashMap<ConnId, Connection>,
    next_id: u64,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            readers: StreamMap::new(),
            writers: HashMap::new(),
            next_id: 1,
        }
    }

    pub fn insert_tcp(&mut self, stream: TcpStream, peer: String) -> ConnId {
        let (read, write) = stream.into_split();
        self.insert(ReadHalf::Tcp(read), ConnWriter::Tcp(write), peer)
    }

    pub fn insert_unix(&mut self, stream: UnixStream, peer: String) -> ConnId {
        let (read, write) = stream.into_split();
        self.insert(ReadHalf::Unix(read), ConnWriter::Unix(write), peer)
    }

    fn insert(&mut self, read: ReadHalf, writer: ConnWriter, peer: String) -> ConnId {
        let id = ConnId(self.next_id);
        self.next_id += 1;
        self.readers.insert(id, ConnReader::new(read));
        self.writers.insert(id, Connection { writer, peer });
        id
    }

    pub fn len(&self) -> usize {
        self.writers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.writers.is_empty()
    }

    /// Next line, EOF, or failure from any live connection; `None` while the
    /// registry is empty.
    pub async fn next_event(&mut self) -> Option<(ConnId, ConnEvent)> {
        self.readers.next().await
    }

    /// Writes a reply to one connection. The caller decides whether a failed
    /// write closes the connection.
    pub async fn send(&mut self, id: ConnId, reply: &str) -> io::Result<()> {
        match self.writers.get_mut(&id) {
            Some(conn) => conn.writer.write_all(reply.as_bytes()).await,
            None => Ok(()),
        }
    }

    /// Best-effort write to every live connection, used for the shutdown
    /// notice. Failures are logged and skipped; the sockets are about to be
    /// closed anyway.
    pub async fn broadcast(&mut self, message: &str) {
        for (id, conn) in self.writers.iter_mut() {
            if let Err(err) = conn.writer.write_all(message.as_bytes()).await {
                debug!(conn = %id, error = %err, "broadcast write failed");
            }
        }
    }

    /// Drops both halves of a connection and returns its peer label.
    pub fn remove(&mut self, id: ConnId) -> Option<String> {
        self.readers.remove(&id);
        self.writers.remove(&id).map(|conn| conn.peer)
    }
}
