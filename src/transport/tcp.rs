//! The reference [`Transport`] implementation over a TCP stream.

use std::{
    fmt,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, Weak,
    },
};

use bytes::{Bytes, BytesMut};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
    sync::mpsc,
};

use crate::{
    connection::Connection,
    error::{Error, Result},
    runtime::{self, AsyncJoinHandle},
    transport::Transport,
};

const READ_CHUNK_SIZE: usize = 8 * 1024;

/// The next value handed out by [`next_socket_id`].
static NEXT_SOCKET_ID: AtomicU64 = AtomicU64::new(1);

fn next_socket_id() -> u64 {
    NEXT_SOCKET_ID.fetch_add(1, Ordering::SeqCst)
}

enum Command {
    Write(Bytes),
    Close,
}

/// A [`Transport`] over a `tokio` TCP stream.
///
/// Two background tasks drive the stream: a reader pushing inbound chunks
/// into [`Connection::data_received`], and a writer draining the queue fed
/// by [`write`](Transport::write) so that writes stay synchronous for the
/// caller. Every kind of closure (graceful, aborted, peer reset, a framing
/// violation raised by the connection) funnels into one teardown that
/// reports [`Connection::connection_lost`].
pub struct TcpTransport {
    address: Option<SocketAddr>,
    socket_id: u64,
    commands: mpsc::UnboundedSender<Command>,
    closing: AtomicBool,
    finished: AtomicBool,
    close_exc: Mutex<Option<Error>>,
    connection: Mutex<Weak<Connection>>,
    reader: Mutex<Option<AsyncJoinHandle<()>>>,
    writer: Mutex<Option<AsyncJoinHandle<()>>>,
}

impl TcpTransport {
    /// Wires `stream` to `connection` and starts the reader and writer
    /// tasks. The returned transport has already been bound via
    /// [`Connection::connection_made`].
    pub fn start(stream: TcpStream, connection: Arc<Connection>) -> Arc<Self> {
        let address = stream.peer_addr().ok();
        let (read_half, write_half) = stream.into_split();
        let (commands, command_receiver) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            address,
            socket_id: next_socket_id(),
            commands,
            closing: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            close_exc: Mutex::new(None),
            connection: Mutex::new(Arc::downgrade(&connection)),
            reader: Mutex::new(None),
            writer: Mutex::new(None),
        });
        connection.connection_made(transport.clone());
        let writer = runtime::spawn(write_loop(
            write_half,
            command_receiver,
            transport.clone(),
        ));
        let reader = runtime::spawn(read_loop(read_half, connection, transport.clone()));
        *transport.writer.lock().unwrap() = Some(writer);
        *transport.reader.lock().unwrap() = Some(reader);
        transport
    }

    /// Tears the transport down once: stops both tasks and reports the
    /// closure to the connection. The first caller wins; the reason is the
    /// stashed close error, falling back to `error`.
    fn finish(&self, error: Option<Error>) {
        if self.finished.swap(true, Ordering::SeqCst) {
            return;
        }
        self.closing.store(true, Ordering::SeqCst);
        let _ = self.commands.send(Command::Close);
        if let Some(reader) = self.reader.lock().unwrap().take() {
            reader.abort();
        }
        if let Some(writer) = self.writer.lock().unwrap().take() {
            writer.abort();
        }
        let exc = self.close_exc.lock().unwrap().take().or(error);
        if let Some(connection) = self.connection.lock().unwrap().upgrade() {
            connection.connection_lost(exc);
        }
    }
}

impl Transport for TcpTransport {
    fn write(&self, data: Bytes) -> Result<()> {
        if self.closing.load(Ordering::SeqCst) {
            return Err(std::io::ErrorKind::NotConnected.into());
        }
        self.commands
            .send(Command::Write(data))
            .map_err(|_| std::io::ErrorKind::NotConnected.into())
    }

    fn close(&self, graceful: bool, exc: Option<Error>) {
        if let Some(exc) = exc {
            self.close_exc.lock().unwrap().get_or_insert(exc);
        }
        self.closing.store(true, Ordering::SeqCst);
        if graceful {
            // The writer drains pending writes, shuts the stream down and
            // finishes the teardown.
            let _ = self.commands.send(Command::Close);
        } else {
            self.finish(None);
        }
    }

    fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    fn address(&self) -> Option<SocketAddr> {
        self.address
    }

    fn socket_id(&self) -> Option<u64> {
        Some(self.socket_id)
    }
}

impl fmt::Debug for TcpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpTransport")
            .field("address", &self.address)
            .field("socket_id", &self.socket_id)
            .field("closing", &self.is_closing())
            .finish()
    }
}

async fn read_loop(
    mut read_half: OwnedReadHalf,
    connection: Arc<Connection>,
    transport: Arc<TcpTransport>,
) {
    let mut buffer = BytesMut::with_capacity(READ_CHUNK_SIZE);
    let error = loop {
        match read_half.read_buf(&mut buffer).await {
            Ok(0) => break None,
            Ok(_) => {
                let chunk = buffer.split().freeze();
                if let Err(error) = connection.data_received(chunk) {
                    // Structural violations fail loudly: sever the transport
                    // and surface the error through connection_lost.
                    tracing::error!(connection = %connection, error = %error, "closing connection");
                    break Some(error);
                }
            }
            Err(error) => break Some(error.into()),
        }
    };
    transport.finish(error);
}

async fn write_loop(
    mut write_half: OwnedWriteHalf,
    mut commands: mpsc::UnboundedReceiver<Command>,
    transport: Arc<TcpTransport>,
) {
    let mut error = None;
    while let Some(command) = commands.recv().await {
        match command {
            Command::Write(data) => {
                if let Err(e) = write_half.write_all(&data).await {
                    error = Some(e.into());
                    break;
                }
            }
            Command::Close => break,
        }
    }
    let _ = write_half.shutdown().await;
    transport.finish(error);
}
