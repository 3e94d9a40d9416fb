//! Purpose: `atomstock-client` line-oriented requester for an atomstock server.
//! Role: Companion binary; forwards stdin lines and prints server replies.
//! Invariants: Exactly one transport flag selects the connection mode.
//! Invariants: A reply containing a shutdown phrase ends the session cleanly.
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpStream, UdpSocket, UnixDatagram, UnixStream};

use atomstock::core::error::{Error, ErrorKind, to_exit_code};

/// How long to wait for a datagram reply before giving up on it.
const REPLY_WAIT: Duration = Duration::from_secs(5);

/// After stdin closes, how long a stream connection waits for trailing
/// replies before disconnecting. Reset by every reply that arrives.
const DRAIN_WINDOW: Duration = Duration::from_millis(200);

#[derive(Parser)]
#[command(
    name = "atomstock-client",
    version,
    about = "Send inventory requests to an atomstock server",
    after_help = r#"EXAMPLES
  $ atomstock-client --tcp 127.0.0.1:5555
  $ echo "ADD CARBON 10" | atomstock-client --udp 127.0.0.1:5556
  $ atomstock-client --stream /tmp/atoms.stream
  $ atomstock-client --datagram /tmp/atoms.dgram

NOTES
  - Requests are read from stdin, one per line; replies go to stdout.
  - The session ends at stdin EOF or when the server announces shutdown."#
)]
struct Cli {
    #[arg(
        long,
        value_name = "HOST:PORT",
        help = "Connect to a TCP endpoint",
        help_heading = "Transport"
    )]
    tcp: Option<String>,
    #[arg(
        long,
        value_name = "HOST:PORT",
        help = "Send datagrams to a UDP endpoint",
        help_heading = "Transport"
    )]
    udp: Option<String>,
    #[arg(
        long,
        value_name = "PATH",
        help = "Connect to a Unix stream socket",
        help_heading = "Transport"
    )]
    stream: Option<PathBuf>,
    #[arg(
        long,
        value_name = "PATH",
        help = "Send datagrams to a Unix socket",
        help_heading = "Transport"
    )]
    datagram: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Transport {
    Tcp(String),
    Udp(String),
    UnixStream(PathBuf),
    UnixDatagram(PathBuf),
}

fn main() {
    let exit_code = match run() {
        Ok(()) => 0,
        Err(err) => {
            emit_error(&err);
            to_exit_code(err.kind())
        }
    };
    std::process::exit(exit_code);
}

fn run() -> Result<(), Error> {
    let cli = Cli::parse();
    let transport = select_transport(&cli)?;
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|err| {
            Error::new(ErrorKind::Internal)
                .with_message("failed to start async runtime")
                .with_source(err)
        })?;
    runtime.block_on(session(transport))
}

fn emit_error(err: &Error) {
    eprintln!("atomstock-client: {err}");
    if let Some(hint) = err.hint() {
        eprintln!("hint: {hint}");
    }
}

fn select_transport(cli: &Cli) -> Result<Transport, Error> {
    let mut picked = Vec::new();
    if let Some(addr) = &cli.tcp {
        picked.push(Transport::Tcp(addr.clone()));
    }
    if let Some(addr) = &cli.udp {
        picked.push(Transport::Udp(addr.clone()));
    }
    if let Some(path) = &cli.stream {
        picked.push(Transport::UnixStream(path.clone()));
    }
    if let Some(path) = &cli.datagram {
        picked.push(Transport::UnixDatagram(path.clone()));
    }
    if picked.len() == 1 {
        return Ok(picked.remove(0));
    }
    let message = if picked.is_empty() {
        "no transport selected"
    } else {
        "multiple transports selected"
    };
    Err(Error::new(ErrorKind::Usage)
        .with_message(message)
        .with_hint("Pass exactly one of --tcp, --udp, --stream, --datagram."))
}

async fn session(transport: Transport) -> Result<(), Error> {
    match transport {
        Transport::Tcp(addr) => {
            let stream = TcpStream::connect(&addr).await.map_err(|err| {
                Error::new(ErrorKind::Io)
                    .with_message(format!("failed to connect to tcp {addr}"))
                    .with_source(err)
            })?;
            let (read, write) = stream.into_split();
            stream_session(read, write).await
        }
        Transport::UnixStream(path) => {
            let stream = UnixStream::connect(&path).await.map_err(|err| {
                Error::new(ErrorKind::Io)
                    .with_message("failed to connect to unix stream socket")
                    .with_path(&path)
                    .with_source(err)
            })?;
            let (read, write) = stream.into_split();
            stream_session(read, write).await
        }
        Transport::Udp(addr) => {
            let socket = UdpSocket::bind("0.0.0.0:0").await.map_err(|err| {
                Error::new(ErrorKind::Io)
                    .with_message("failed to bind local udp socket")
                    .with_source(err)
            })?;
            socket.connect(&addr).await.map_err(|err| {
                Error::new(ErrorKind::Io)
                    .with_message(format!("failed to reach udp {addr}"))
                    .with_source(err)
            })?;
            datagram_session(DatagramSocket::Udp(socket)).await
        }
        Transport::UnixDatagram(path) => {
            let reply = ReplySocket::bind()?;
            reply.socket.connect(&path).map_err(|err| {
                Error::new(ErrorKind::Io)
                    .with_message("failed to reach unix datagram socket")
                    .with_path(&path)
                    .with_source(err)
            })?;
            datagram_session(DatagramSocket::Unix(reply)).await
        }
    }
}

/// Stream session: multiplex stdin requests with server replies until one
/// side closes. After stdin EOF the connection lingers for `DRAIN_WINDOW`
/// so replies to the last request still arrive.
async fn stream_session<R, W>(read: R, mut write: W) -> Result<(), Error>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut replies = BufReader::new(read).lines();
    let mut console = BufReader::new(tokio::io::stdin()).lines();
    let mut console_open = true;
    loop {
        tokio::select! {
            line = replies.next_line() => match line {
                Ok(Some(reply)) => {
                    println!("{reply}");
                    if is_shutdown_message(&reply) {
                        return Ok(());
                    }
                }
                Ok(None) => return Ok(()),
                Err(err) => {
                    return Err(Error::new(ErrorKind::Io)
                        .with_message("connection to server lost")
                        .with_source(err));
                }
            },
            line = console.next_line(), if console_open => match line {
                Ok(Some(request)) => {
                    let framed = format!("{request}\n");
                    write.write_all(framed.as_bytes()).await.map_err(|err| {
                        Error::new(ErrorKind::Io)
                            .with_message("failed to send request")
                            .with_source(err)
                    })?;
                }
                Ok(None) => console_open = false,
                Err(err) => {
                    return Err(Error::new(ErrorKind::Io)
                        .with_message("failed to read stdin")
                        .with_source(err));
                }
            },
            _ = tokio::time::sleep(DRAIN_WINDOW), if !console_open => return Ok(()),
        }
    }
}

enum DatagramSocket {
    Udp(UdpSocket),
    Unix(ReplySocket),
}

impl DatagramSocket {
    async fn send(&self, payload: &[u8]) -> std::io::Result<usize> {
        match self {
            DatagramSocket::Udp(socket) => socket.send(payload).await,
            DatagramSocket::Unix(reply) => reply.socket.send(payload).await,
        }
    }

    async fn recv(&self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            DatagramSocket::Udp(socket) => socket.recv(buf).await,
            DatagramSocket::Unix(reply) => reply.socket.recv(buf).await,
        }
    }
}

/// Datagram session: strict request/reply. Each stdin line is sent as one
/// datagram; a reply that fails to arrive within `REPLY_WAIT` is reported
/// and the session moves on.
async fn datagram_session(socket: DatagramSocket) -> Result<(), Error> {
    let mut console = BufReader::new(tokio::io::stdin()).lines();
    let mut buf = vec![0u8; 2048];
    loop {
        let request = match console.next_line().await {
            Ok(Some(request)) => request,
            Ok(None) => return Ok(()),
            Err(err) => {
                return Err(Error::new(ErrorKind::Io)
                    .with_message("failed to read stdin")
                    .with_source(err));
            }
        };
        socket.send(request.as_bytes()).await.map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("failed to send request")
                .with_source(err)
        })?;
        match tokio::time::timeout(REPLY_WAIT, socket.recv(&mut buf)).await {
            Ok(Ok(len)) => {
                let reply = String::from_utf8_lossy(&buf[..len]);
                print!("{reply}");
                if is_shutdown_message(&reply) {
                    return Ok(());
                }
            }
            Ok(Err(err)) => {
                return Err(Error::new(ErrorKind::Io)
                    .with_message("failed to receive reply")
                    .with_source(err));
            }
            Err(_) => {
                eprintln!(
                    "atomstock-client: no reply within {}s",
                    REPLY_WAIT.as_secs()
                );
            }
        }
    }
}

/// Local endpoint for unix datagram replies. The server answers to the
/// sender's bound path, so an unbound socket would never hear back.
struct ReplySocket {
    socket: UnixDatagram,
    path: PathBuf,
}

impl ReplySocket {
    fn bind() -> Result<Self, Error> {
        let path = std::env::temp_dir().join(format!("atomstock-client-{}.sock", std::process::id()));
        // A crashed earlier run with a recycled pid may have left the path behind.
        if let Err(err) = std::fs::remove_file(&path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                return Err(Error::new(ErrorKind::Io)
                    .with_message("failed to clear stale reply socket")
                    .with_path(&path)
                    .with_source(err));
            }
        }
        let socket = UnixDatagram::bind(&path).map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("failed to bind reply socket")
                .with_path(&path)
                .with_source(err)
        })?;
        Ok(Self { socket, path })
    }
}

impl Drop for ReplySocket {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

fn is_shutdown_message(reply: &str) -> bool {
    ["shutting down", "shutdown", "closing"]
        .iter()
        .any(|phrase| reply.contains(phrase))
}
