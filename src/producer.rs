//! Producers: factories and supervisors of connections.


use std::{
    collections::HashMap,
    sync::{Arc, Mutex, Weak},
    time::Duration,
};

use futures_util::future::join_all;
use typed_builder::TypedBuilder;

use crate::{
    connection::{Connection, ConsumerFactory},
    error::{Error, Result},
    event::{Event, EventData, EventHub},
    BoxFuture,
};

/// `max_connections` of zero means no limit; internally the limit is
/// represented by this sentinel so the admission check stays a plain
/// comparison.
const UNLIMITED_CONNECTIONS: u32 = 1 << 31;

/// A callable producing connections.
///
/// Invoked with the session id, the consumer factory, the producer of the
/// connection and the idle timeout.
pub type ConnectionFactory = Arc<
    dyn Fn(u64, ConsumerFactory, Weak<dyn Producer>, Duration) -> Arc<Connection> + Send + Sync,
>;

/// A producer of connections with remote servers or clients.
///
/// Implemented by [`ConnectionProducer`], [`Server`](crate::server::Server)
/// and client connection pools.
pub trait Producer: Send + Sync {
    /// The events of this producer.
    fn events(&self) -> &EventHub;

    /// Number of seconds to keep alive an idle connection, passed to the
    /// connection factory. Zero disables the idle timeout.
    fn timeout(&self) -> Duration;

    /// Maximum number of connections allowed.
    fn max_connections(&self) -> u32;

    /// Checks if `connection` can be reused for another request. `response`
    /// is the outcome of the request that just finished on it. By default it
    /// returns `true`; client pools may override.
    fn can_reuse_connection(
        &self,
        _connection: &Arc<Connection>,
        _response: Option<&EventData>,
    ) -> bool {
        true
    }
}

/// Options used to construct a [`ConnectionProducer`].
#[derive(Clone, TypedBuilder)]
pub struct ProducerOptions {
    /// The connection factory. Defaults to [`Connection::new`].
    #[builder(default, setter(strip_option))]
    pub connection_factory: Option<ConnectionFactory>,

    /// The idle timeout handed to every connection. Defaults to none.
    #[builder(default, setter(strip_option))]
    pub timeout: Option<Duration>,

    /// Maximum number of connections. Zero (the default) means no limit.
    #[builder(default, setter(strip_option))]
    pub max_connections: Option<u32>,
}

struct ProducerState {
    /// Total number of connections created; the source of session ids.
    received: u64,
    /// The live connections: present from `connection_made` until
    /// `connection_lost`.
    connections: HashMap<u64, Arc<Connection>>,
}

/// A supervisor of [`Connection`]s: creates them with strictly increasing
/// session ids, enforces the admission cap, propagates producer-level event
/// subscribers to every connection it births and tracks which connections
/// are currently live.
pub struct ConnectionProducer {
    weak_self: Weak<ConnectionProducer>,
    connection_factory: ConnectionFactory,
    timeout: Duration,
    max_connections: u32,
    events: EventHub,
    state: Mutex<ProducerState>,
}

impl ConnectionProducer {
    /// Creates a producer with the default supervision event set: many-time
    /// `connection_made`, `pre_request`, `post_request` and
    /// `connection_lost`.
    pub fn new(options: Option<ProducerOptions>) -> Arc<Self> {
        Self::with_events(
            options,
            EventHub::new(
                &[],
                &[
                    Event::ConnectionMade,
                    Event::PreRequest,
                    Event::PostRequest,
                    Event::ConnectionLost,
                ],
            ),
        )
    }

    /// Creates a producer with a custom event set. Used by components that
    /// extend the supervision events with their own, e.g.
    /// [`Server`](crate::server::Server).
    pub fn with_events(options: Option<ProducerOptions>, events: EventHub) -> Arc<Self> {
        let connection_factory = options
            .as_ref()
            .and_then(|options| options.connection_factory.clone())
            .unwrap_or_else(|| {
                Arc::new(|session, factory, producer, timeout| {
                    Connection::new(session, factory, producer, timeout)
                })
            });
        let timeout = options
            .as_ref()
            .and_then(|options| options.timeout)
            .unwrap_or(Duration::ZERO);
        let max_connections = options
            .as_ref()
            .and_then(|options| options.max_connections)
            .filter(|&max| max > 0)
            .unwrap_or(UNLIMITED_CONNECTIONS);
        Arc::new_cyclic(|weak_self| Self {
            weak_self: weak_self.clone(),
            connection_factory,
            timeout,
            max_connections,
            events,
            state: Mutex::new(ProducerState {
                received: 0,
                connections: HashMap::new(),
            }),
        })
    }

    /// Total number of connections created by this producer.
    pub fn received(&self) -> u64 {
        self.state.lock().unwrap().received
    }

    /// Number of concurrent active connections.
    pub fn concurrent_connections(&self) -> usize {
        self.state.lock().unwrap().connections.len()
    }

    /// A snapshot of the live connections.
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.state
            .lock()
            .unwrap()
            .connections
            .values()
            .cloned()
            .collect()
    }

    /// Creates a new connection.
    ///
    /// Fails with a `TooManyConnections` error when the number of
    /// connections created has reached
    /// [`max_connections`](Producer::max_connections); the session counter
    /// is not consumed by a rejected call. Otherwise the connection is built
    /// by the connection factory with the next session id, hooked into the
    /// live set (added on `connection_made`, removed on `connection_lost`)
    /// and handed the producer's many-time subscribers.
    ///
    /// `producer` is the producer of the connection; it defaults to this
    /// one. Its events are the ones fanned out to the connection.
    pub fn new_connection(
        &self,
        consumer_factory: ConsumerFactory,
        producer: Option<Weak<dyn Producer>>,
    ) -> Result<Arc<Connection>> {
        let session = {
            let mut state = self.state.lock().unwrap();
            if state.received >= u64::from(self.max_connections) {
                return Err(Error::too_many_connections());
            }
            state.received += 1;
            state.received
        };
        let producer = producer.unwrap_or_else(|| {
            let weak_self: Weak<dyn Producer> = self.weak_self.clone();
            weak_self
        });
        let connection =
            (self.connection_factory)(session, consumer_factory, producer.clone(), self.timeout);

        // Track the connection while its transport is alive. Both hooks
        // capture weak references: the subscriber list lives inside the
        // connection itself.
        let supervisor = self.weak_self.clone();
        let tracked = Arc::downgrade(&connection);
        connection.events().bind(
            Event::ConnectionMade,
            Arc::new(move |_| {
                if let (Some(supervisor), Some(connection)) =
                    (supervisor.upgrade(), tracked.upgrade())
                {
                    supervisor
                        .state
                        .lock()
                        .unwrap()
                        .connections
                        .insert(connection.session(), connection);
                }
                Ok(())
            }),
        );
        if let Some(producer) = producer.upgrade() {
            connection.copy_many_times_events(producer.events());
        }
        let supervisor = self.weak_self.clone();
        let session_id = connection.session();
        connection.events().bind(
            Event::ConnectionLost,
            Arc::new(move |_| {
                if let Some(supervisor) = supervisor.upgrade() {
                    supervisor
                        .state
                        .lock()
                        .unwrap()
                        .connections
                        .remove(&session_id);
                }
                Ok(())
            }),
        );
        Ok(connection)
    }

    /// Closes `connection` if given, otherwise every live connection, and
    /// returns a future resolved once the matching `connection_lost` events
    /// have fired.
    pub fn close_connections(
        &self,
        connection: Option<Arc<Connection>>,
        graceful: bool,
    ) -> BoxFuture<'static, Vec<EventData>> {
        let targets = match connection {
            Some(connection) => vec![connection],
            None => self.connections(),
        };
        let mut lost = Vec::with_capacity(targets.len());
        for connection in targets {
            if let Some(cell) = connection.events().cell(Event::ConnectionLost) {
                lost.push(cell);
            }
            if graceful {
                connection.close(None);
            } else {
                connection.abort(None);
            }
        }
        Box::pin(async move {
            join_all(lost.iter().map(|cell| cell.wait())).await
        })
    }
}

impl Producer for ConnectionProducer {
    fn events(&self) -> &EventHub {
        &self.events
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn max_connections(&self) -> u32 {
        self.max_connections
    }
}
