//! A TCP server producing one [`Connection`] per accepted socket.


use std::{
    net::SocketAddr,
    sync::{Arc, Mutex, Weak},
    time::Duration,
};

use tokio::net::TcpListener;
use typed_builder::TypedBuilder;

use crate::{
    connection::{Connection, ConsumerFactory},
    error::Result,
    event::{Event, EventData, EventHub},
    producer::{ConnectionFactory, ConnectionProducer, Producer, ProducerOptions},
    runtime::{self, AsyncJoinHandle},
    transport::tcp::TcpTransport,
};

/// Options used to construct a [`Server`].
#[derive(Clone, TypedBuilder)]
pub struct ServerOptions {
    /// Factory of the consumers handling the server sockets.
    pub consumer_factory: ConsumerFactory,

    /// The address to listen on. Defaults to localhost.
    #[builder(default = String::from("127.0.0.1"), setter(into))]
    pub host: String,

    /// The port to listen on. Zero (the default) picks an ephemeral port.
    #[builder(default)]
    pub port: u16,

    /// The server name, used in log output.
    #[builder(default, setter(strip_option, into))]
    pub name: Option<String>,

    /// The idle timeout handed to every connection.
    #[builder(default, setter(strip_option))]
    pub timeout: Option<Duration>,

    /// Maximum number of connections accepted over the server lifetime.
    /// Zero (the default) means no limit.
    #[builder(default, setter(strip_option))]
    pub max_connections: Option<u32>,

    /// The connection factory. Defaults to [`Connection::new`].
    #[builder(default, setter(strip_option))]
    pub connection_factory: Option<ConnectionFactory>,
}

struct ListenerState {
    local_addr: Option<SocketAddr>,
    accept_task: Option<AsyncJoinHandle<()>>,
}

/// A server listening on a socket.
///
/// A server is a producer of connections: every accepted socket goes through
/// [`protocol_factory`](Server::protocol_factory), which enforces the
/// admission cap, and is wired to a
/// [`TcpTransport`](crate::transport::tcp::TcpTransport).
///
/// It has two one-time events, `start` (the server is ready to accept
/// connections) and `stop` (the server stopped accepting; a stopped server
/// cannot be reused), and four many-time events fanned out to every
/// connection: `connection_made`, `pre_request`, `post_request` and
/// `connection_lost`.
pub struct Server {
    weak_self: Weak<Server>,
    producer: Arc<ConnectionProducer>,
    consumer_factory: ConsumerFactory,
    name: String,
    host: String,
    port: u16,
    state: Mutex<ListenerState>,
}

impl Server {
    /// Creates a server. The listening socket is bound by
    /// [`start`](Server::start).
    pub fn new(options: ServerOptions) -> Arc<Self> {
        let events = EventHub::new(
            &[Event::Start, Event::Stop],
            &[
                Event::ConnectionMade,
                Event::PreRequest,
                Event::PostRequest,
                Event::ConnectionLost,
            ],
        );
        let producer = ConnectionProducer::with_events(
            Some(ProducerOptions {
                connection_factory: options.connection_factory,
                timeout: options.timeout,
                max_connections: options.max_connections,
            }),
            events,
        );
        Arc::new_cyclic(|weak_self| Self {
            weak_self: weak_self.clone(),
            producer,
            consumer_factory: options.consumer_factory,
            name: options.name.unwrap_or_else(|| String::from("Server")),
            host: options.host,
            port: options.port,
            state: Mutex::new(ListenerState {
                local_addr: None,
                accept_task: None,
            }),
        })
    }

    /// The server name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The server address, where clients send requests to. Available once
    /// the server has started.
    pub fn address(&self) -> Option<SocketAddr> {
        self.state.lock().unwrap().local_addr
    }

    /// The supervisor of this server's connections.
    pub fn producer(&self) -> &Arc<ConnectionProducer> {
        &self.producer
    }

    /// Creates a new connection for an accepted socket, enforcing the
    /// admission cap.
    pub fn protocol_factory(&self) -> Result<Arc<Connection>> {
        let producer: Weak<dyn Producer> = self.weak_self.clone();
        self.producer
            .new_connection(self.consumer_factory.clone(), Some(producer))
    }

    /// Binds the listening socket, fires the `start` event and begins
    /// accepting connections in the background. Returns the bound address.
    pub async fn start(&self) -> Result<SocketAddr> {
        let listener = TcpListener::bind((self.host.as_str(), self.port)).await?;
        let address = listener.local_addr()?;
        tracing::info!(server = %self.name, %address, "listening");
        self.events().fire(Event::Start, EventData::Null);
        let server = self.weak_self.clone();
        let accept_task = runtime::spawn(accept_loop(server, listener));
        {
            let mut state = self.state.lock().unwrap();
            state.local_addr = Some(address);
            state.accept_task = Some(accept_task);
        }
        Ok(address)
    }

    /// Stops accepting connections, fires the `stop` event and closes the
    /// outstanding connections, resolving once they are gone.
    pub async fn stop(&self) {
        let accept_task = self.state.lock().unwrap().accept_task.take();
        if let Some(task) = accept_task {
            task.abort();
        }
        tracing::info!(server = %self.name, "stopped");
        self.events().fire(Event::Stop, EventData::Null);
        self.producer.close_connections(None, true).await;
    }
}

impl Producer for Server {
    fn events(&self) -> &EventHub {
        self.producer.events()
    }

    fn timeout(&self) -> Duration {
        Producer::timeout(self.producer.as_ref())
    }

    fn max_connections(&self) -> u32 {
        Producer::max_connections(self.producer.as_ref())
    }
}

async fn accept_loop(server: Weak<Server>, listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let Some(server) = server.upgrade() else {
                    break;
                };
                match server.protocol_factory() {
                    Ok(connection) => {
                        TcpTransport::start(stream, connection);
                    }
                    Err(error) => {
                        tracing::warn!(%peer, error = %error, "rejecting connection");
                    }
                }
            }
            Err(error) => {
                tracing::warn!(error = %error, "accept failed");
            }
        }
    }
}
