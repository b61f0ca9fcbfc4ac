//! Connections: the bridge between a transport and its protocol consumers.

#[cfg(test)]
mod test;

use std::{
    fmt,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, Weak,
    },
    time::Duration,
};

use bytes::Bytes;

use crate::{
    consumer::ProtocolConsumer,
    error::{log_failure, Error, Result},
    event::{Event, EventData, EventHub},
    producer::Producer,
    runtime::{self, AsyncJoinHandle},
    transport::Transport,
};

/// A factory of [`ProtocolConsumer`] instances.
///
/// The returned consumer must be freshly constructed and not yet bound to
/// any connection; the caller binds it via [`Connection::set_consumer`].
pub type ConsumerFactory = Arc<dyn Fn(&Arc<Connection>) -> Arc<ProtocolConsumer> + Send + Sync>;

/// A client or server connection with an end-point.
///
/// A connection owns a [`Transport`] (bound by
/// [`connection_made`](Connection::connection_made)) and routes inbound data
/// to its current [`ProtocolConsumer`], at most one at a time. When the
/// consumer slot is empty and a `timeout` is configured, an idle timer closes
/// the transport after that many seconds without traffic.
///
/// A connection has two one-time events, `connection_made` and
/// `connection_lost`, and three many-time events mirroring the one-time
/// events of the consumers it hosts: `pre_request`, `finish` and
/// `post_request`. Subscribers of the many-time events are copied onto each
/// consumer as it is bound, which is how producer-level observers see every
/// request on every connection.
pub struct Connection {
    weak_self: Weak<Connection>,
    session: u64,
    consumer_factory: Mutex<ConsumerFactory>,
    producer: Weak<dyn Producer>,
    timeout: Mutex<Duration>,
    transport: Mutex<Option<Arc<dyn Transport>>>,
    current_consumer: Mutex<Option<Arc<ProtocolConsumer>>>,
    processed: AtomicU64,
    idle_timer: Mutex<Option<AsyncJoinHandle<()>>>,
    events: EventHub,
}

impl Connection {
    /// Creates a connection, not yet bound to a transport.
    ///
    /// `session` is assigned by the producer creating this connection and
    /// identifies it for the producer's lifetime. A zero `timeout` disables
    /// the idle timer.
    pub fn new(
        session: u64,
        consumer_factory: ConsumerFactory,
        producer: Weak<dyn Producer>,
        timeout: Duration,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            weak_self: weak_self.clone(),
            session,
            consumer_factory: Mutex::new(consumer_factory),
            producer,
            timeout: Mutex::new(timeout),
            transport: Mutex::new(None),
            current_consumer: Mutex::new(None),
            processed: AtomicU64::new(0),
            idle_timer: Mutex::new(None),
            events: EventHub::new(
                &[Event::ConnectionMade, Event::ConnectionLost],
                &[Event::PreRequest, Event::Finish, Event::PostRequest],
            ),
        })
    }

    /// Connection session number, assigned by the producer.
    pub fn session(&self) -> u64 {
        self.session
    }

    /// The events of this connection.
    pub fn events(&self) -> &EventHub {
        &self.events
    }

    /// The transport of this connection, available once
    /// [`connection_made`](Connection::connection_made) has been called.
    pub fn transport(&self) -> Option<Arc<dyn Transport>> {
        self.transport.lock().unwrap().clone()
    }

    /// The producer of this connection, if still alive.
    pub fn producer(&self) -> Option<Arc<dyn Producer>> {
        self.producer.upgrade()
    }

    /// The current factory of protocol consumers.
    pub fn consumer_factory(&self) -> ConsumerFactory {
        self.consumer_factory.lock().unwrap().clone()
    }

    /// The consumer currently handling inbound data, if any.
    pub fn current_consumer(&self) -> Option<Arc<ProtocolConsumer>> {
        self.current_consumer.lock().unwrap().clone()
    }

    /// Number of separate consumers processed by this connection.
    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::SeqCst)
    }

    /// Number of seconds this connection is kept alive while idle. Zero
    /// means no timeout.
    pub fn timeout(&self) -> Duration {
        *self.timeout.lock().unwrap()
    }

    /// The peer address of this connection.
    pub fn address(&self) -> Option<SocketAddr> {
        self.transport().and_then(|transport| transport.address())
    }

    /// The identity of the underlying socket, if the transport exposes one.
    pub fn socket_id(&self) -> Option<u64> {
        self.transport().and_then(|transport| transport.socket_id())
    }

    /// Whether the transport is closed or was never bound.
    pub fn closed(&self) -> bool {
        self.transport()
            .map_or(true, |transport| transport.is_closing())
    }

    /// Whether this connection is no longer usable for new requests.
    pub fn is_stale(&self) -> bool {
        self.transport()
            .map_or(true, |transport| transport.is_stale())
    }

    /// Sets a new idle `timeout`, cancelling and re-arming any pending timer.
    pub fn set_timeout(&self, timeout: Duration) {
        self.cancel_idle_timer();
        *self.timeout.lock().unwrap() = timeout;
        self.arm_idle_timer();
    }

    /// Closes the connection by gracefully closing its transport.
    pub fn close(&self, exc: Option<Error>) {
        if let Some(transport) = self.transport() {
            transport.close(true, exc);
        }
    }

    /// Aborts the connection by closing its transport immediately.
    pub fn abort(&self, exc: Option<Error>) {
        if let Some(transport) = self.transport() {
            transport.close(false, exc);
        }
    }

    /// Binds `consumer` as the current consumer of this connection.
    ///
    /// Fails if the consumer slot is occupied. Unless the consumer replaces
    /// an upgraded consumer that kept the same connection, the connection's
    /// many-time subscribers are copied onto the consumer and the
    /// `processed` counter is incremented; either way the
    /// [`Protocol::connection_made`](crate::consumer::Protocol::connection_made)
    /// hook runs last.
    pub fn set_consumer(&self, consumer: &Arc<ProtocolConsumer>) -> Result<()> {
        {
            let mut current = self.current_consumer.lock().unwrap();
            if current.is_some() {
                return Err(Error::internal(format!(
                    "{} already has a consumer",
                    self
                )));
            }
            *current = Some(consumer.clone());
        }
        consumer.bind_connection(self.weak_self.clone());
        if consumer.counts_as_new_request() {
            consumer.events().copy_many_times_events(&self.events);
            self.processed.fetch_add(1, Ordering::SeqCst);
        }
        consumer.run_connection_made();
        Ok(())
    }

    /// Binds `transport`, fires the `connection_made` event and arms the
    /// idle timer.
    ///
    /// Re-binding a transport that wraps the same underlying socket as the
    /// current one (a TLS upgrade re-wrapping the same descriptor) only
    /// re-arms the idle timer.
    pub fn connection_made(&self, transport: Arc<dyn Transport>) {
        let old = self.transport.lock().unwrap().replace(transport.clone());
        if let Some(old) = old {
            self.cancel_idle_timer();
            if let (Some(old_id), Some(new_id)) = (old.socket_id(), transport.socket_id()) {
                if old_id == new_id {
                    self.arm_idle_timer();
                    return;
                }
            }
        }
        // let everyone know we have a connection with the end-point
        self.events.fire(Event::ConnectionMade, EventData::Null);
        self.arm_idle_timer();
    }

    /// Delegates an inbound buffer to the current consumer, creating one via
    /// the consumer factory when the slot is empty (the server path).
    ///
    /// A consumer may hand back a residual (the unconsumed suffix of the
    /// buffer) only if the same call retired it; a non-empty residual from
    /// a consumer that is still bound fails with a protocol error. Residuals
    /// are fed to the next consumer until the buffer is exhausted.
    pub fn data_received(&self, data: Bytes) -> Result<()> {
        self.cancel_idle_timer();
        let mut data = data;
        while !data.is_empty() {
            let consumer = match self.current_consumer() {
                Some(consumer) => consumer,
                None => {
                    // New consumer; this path is used by server connections.
                    let Some(this) = self.weak_self.upgrade() else {
                        return Ok(());
                    };
                    let consumer = (self.consumer_factory())(&this);
                    self.set_consumer(&consumer)?;
                    consumer.start(None)?;
                    consumer
                }
            };
            let residual = consumer.handle_data(data)?;
            match residual {
                Some(residual) if !residual.is_empty() => {
                    if self.current_consumer().is_some() {
                        return Err(Error::protocol("current consumer not done."));
                    }
                    data = residual;
                }
                _ => break,
            }
        }
        self.arm_idle_timer();
        Ok(())
    }

    /// Called by the transport when it is closed.
    ///
    /// Only the first call has any effect: it fires the `connection_lost`
    /// event with `exc`, cancels the idle timer and forwards `exc` to the
    /// current consumer if one is bound.
    pub fn connection_lost(&self, exc: Option<Error>) {
        let data = exc
            .clone()
            .map_or(EventData::Null, EventData::Failure);
        if self.events.fire(Event::ConnectionLost, data) {
            self.cancel_idle_timer();
            match self.current_consumer() {
                Some(consumer) => consumer.connection_lost(exc),
                None => {
                    if let Some(error) = exc {
                        log_failure(&error);
                    }
                }
            }
        }
    }

    /// Upgrades the consumer factory mid-stream, preserving the in-flight
    /// `post_request` completion.
    ///
    /// This is used when the protocol specification changes during a
    /// response, e.g. a WebSocket handshake or HTTP tunneling. If the current
    /// consumer's `post_request` is still unresolved, its completion cell is
    /// detached and re-homed onto the consumer the new factory will build,
    /// so observers that subscribed before the upgrade see exactly one
    /// resolution: when the replacement consumer retires.
    ///
    /// With `new_connection` set, the replacement consumer starts a new
    /// framing session on the same transport; otherwise it is a continuation
    /// of the current one and does not count towards
    /// [`processed`](Connection::processed).
    pub fn upgrade(
        &self,
        consumer_factory: Option<ConsumerFactory>,
        new_connection: bool,
    ) -> Result<()> {
        let mut factory = consumer_factory;
        if let Some(consumer) = self.current_consumer() {
            if !consumer.events().is_done(Event::PostRequest) {
                if !consumer.events().is_done(Event::PreRequest) {
                    return Err(Error::protocol(
                        "cannot upgrade a consumer before pre_request",
                    ));
                }
                let post_request = consumer
                    .events()
                    .pop_cell(Event::PostRequest)
                    .ok_or_else(|| Error::internal("consumer has no post_request event"))?;
                consumer.set_new_connection(new_connection);
                let inner = factory
                    .take()
                    .unwrap_or_else(|| self.consumer_factory());
                let upgraded = consumer.clone();
                factory = Some(Arc::new(move |connection: &Arc<Connection>| {
                    let next = inner(connection);
                    next.set_upgraded_from(&upgraded);
                    next.events().adopt_cell(Event::PostRequest, post_request.clone());
                    next
                }));
            }
        }
        if let Some(factory) = factory {
            *self.consumer_factory.lock().unwrap() = factory;
        }
        Ok(())
    }

    /// Copies many-time subscribers of `source` onto this connection.
    pub fn copy_many_times_events(&self, source: &EventHub) {
        self.events.copy_many_times_events(source);
    }

    /// Releases the consumer slot if `consumer` currently holds it.
    pub(crate) fn release_consumer(&self, consumer: &ProtocolConsumer) {
        let mut current = self.current_consumer.lock().unwrap();
        if let Some(bound) = current.as_deref() {
            if std::ptr::eq(bound, consumer) {
                *current = None;
            }
        }
    }

    fn arm_idle_timer(&self) {
        let timeout = self.timeout();
        if timeout.is_zero() || self.closed() {
            return;
        }
        if self.current_consumer.lock().unwrap().is_some() {
            return;
        }
        let mut timer = self.idle_timer.lock().unwrap();
        if timer.is_some() {
            return;
        }
        let connection = self.weak_self.clone();
        *timer = Some(runtime::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(connection) = connection.upgrade() {
                connection.timed_out();
            }
        }));
    }

    fn cancel_idle_timer(&self) {
        if let Some(timer) = self.idle_timer.lock().unwrap().take() {
            timer.abort();
        }
    }

    fn timed_out(&self) {
        let timeout = self.timeout();
        tracing::info!(
            connection = %self,
            seconds = timeout.as_secs_f64(),
            "connection idle, closing"
        );
        self.idle_timer.lock().unwrap().take();
        self.close(Some(Error::timed_out(format!(
            "{} idle for {:.1} seconds",
            self,
            timeout.as_secs_f64()
        ))));
    }
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.address() {
            Some(address) => write!(f, "{} session {}", address, self.session),
            None => write!(f, "<pending-connection> session {}", self.session),
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("session", &self.session)
            .field("processed", &self.processed())
            .field("timeout", &self.timeout())
            .field("closed", &self.closed())
            .finish()
    }
}
