//! Per-request protocol consumers.

#[cfg(test)]
mod test;

use std::{
    fmt,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
        Arc, Mutex, Weak,
    },
};

use bytes::Bytes;

use crate::{
    connection::Connection,
    error::{log_failure, Error, Result},
    event::{Event, EventCell, EventData, EventHub},
    producer::Producer,
    transport::Transport,
};

/// The parsing logic of a [`ProtocolConsumer`].
///
/// Implementations decode one logical message from the inbound byte stream
/// and, possibly, write back through the consumer's transport.
///
/// For server consumers, [`data_received`](Protocol::data_received) is the
/// only method to implement. Client consumers should also implement
/// [`start_request`](Protocol::start_request).
pub trait Protocol: Send + 'static {
    /// Called when the consumer is bound to a connection. Does nothing by
    /// default.
    fn connection_made(&mut self, _consumer: &Arc<ProtocolConsumer>) {}

    /// Called when some data is received.
    ///
    /// Returns the *residual*: the suffix of `data` this consumer did not
    /// consume, or `None` when the buffer was consumed in full. A non-empty
    /// residual may only be returned if the call also retired the consumer
    /// by calling [`ProtocolConsumer::finished`]; anything else is a
    /// protocol violation reported by the owning connection.
    fn data_received(&mut self, consumer: &Arc<ProtocolConsumer>, data: Bytes) -> Result<Option<Bytes>>;

    /// Starts a new request. Invoked by [`ProtocolConsumer::start`] when a
    /// request payload is present; client consumers typically write the
    /// encoded request into the transport here. Does nothing by default.
    fn start_request(&mut self, _consumer: &Arc<ProtocolConsumer>) -> Result<()> {
        Ok(())
    }
}

/// The consumer of data for a server or client [`Connection`].
///
/// A consumer is a per-request automaton: it receives inbound bytes from its
/// connection, hands them to its [`Protocol`] and signals its lifecycle
/// through three one-time events:
///
/// * `pre_request`, fired by [`start`](ProtocolConsumer::start);
/// * `finish`, fired by [`finished`](ProtocolConsumer::finished), at which
///   point the connection releases the consumer slot;
/// * `post_request`, normally fired back-to-back with `finish`. The
///   exception is a consumer that has been upgraded via
///   [`Connection::upgrade`], whose `post_request` resolves only when the
///   replacement consumer retires.
///
/// It also has two many-time events, `data_received` and `data_processed`,
/// fired around each [`Protocol::data_received`] call.
pub struct ProtocolConsumer {
    weak_self: Weak<ProtocolConsumer>,
    events: EventHub,
    protocol: Mutex<Box<dyn Protocol>>,
    connection: Mutex<Weak<Connection>>,
    request: Mutex<Option<Bytes>>,
    data_received_count: AtomicU64,
    // Number of times the consumer has tried to reconnect (clients only).
    reconnect_retries: AtomicU32,
    upgraded_from: Mutex<Option<Arc<ProtocolConsumer>>>,
    // Set on the *old* consumer by an upgrade; consulted through
    // `upgraded_from` when its replacement is bound.
    new_connection: AtomicBool,
}

impl ProtocolConsumer {
    /// Creates a consumer driving `protocol`, not yet bound to a connection.
    pub fn new<P: Protocol>(protocol: P) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            weak_self: weak_self.clone(),
            events: EventHub::new(
                &[Event::PreRequest, Event::Finish, Event::PostRequest],
                &[Event::DataReceived, Event::DataProcessed],
            ),
            protocol: Mutex::new(Box::new(protocol)),
            connection: Mutex::new(Weak::new()),
            request: Mutex::new(None),
            data_received_count: AtomicU64::new(0),
            reconnect_retries: AtomicU32::new(0),
            upgraded_from: Mutex::new(None),
            new_connection: AtomicBool::new(false),
        })
    }

    /// The events of this consumer.
    pub fn events(&self) -> &EventHub {
        &self.events
    }

    /// The [`Connection`] of this consumer, once bound.
    pub fn connection(&self) -> Option<Arc<Connection>> {
        self.connection.lock().unwrap().upgrade()
    }

    /// The transport of this consumer's connection.
    pub fn transport(&self) -> Option<Arc<dyn Transport>> {
        self.connection().and_then(|conn| conn.transport())
    }

    /// The producer of this consumer's connection.
    pub fn producer(&self) -> Option<Arc<dyn Producer>> {
        self.connection().and_then(|conn| conn.producer())
    }

    /// The peer address of this consumer's connection.
    pub fn address(&self) -> Option<SocketAddr> {
        self.connection().and_then(|conn| conn.address())
    }

    /// The request payload (used by clients only).
    pub fn request(&self) -> Option<Bytes> {
        self.request.lock().unwrap().clone()
    }

    /// Number of times data has been delivered to this consumer.
    pub fn data_received_count(&self) -> u64 {
        self.data_received_count.load(Ordering::SeqCst)
    }

    /// Number of reconnect attempts recorded by
    /// [`can_reconnect`](ProtocolConsumer::can_reconnect). Reset to zero on
    /// every successful byte delivery.
    pub fn reconnect_retries(&self) -> u32 {
        self.reconnect_retries.load(Ordering::SeqCst)
    }

    /// The consumer this one replaced through an upgrade, if any.
    pub fn upgraded_from(&self) -> Option<Arc<ProtocolConsumer>> {
        self.upgraded_from.lock().unwrap().clone()
    }

    /// The completion cell resolved when this consumer has finished
    /// consuming data.
    pub fn on_finished(&self) -> EventCell {
        self.events.cell(Event::Finish).unwrap_or_default()
    }

    /// The completion cell resolved once the request is done.
    pub fn request_done(&self) -> EventCell {
        self.events.cell(Event::PostRequest).unwrap_or_default()
    }

    /// Whether the `finish` event has fired.
    pub fn has_finished(&self) -> bool {
        self.events.is_done(Event::Finish)
    }

    /// Starts processing a request.
    ///
    /// Fires `pre_request` with `request` as payload. When a request payload
    /// is present (clients), the [`Protocol::start_request`] hook runs next;
    /// a failure there is converted into [`finished`](ProtocolConsumer::finished)
    /// with the error, routing it through the normal retirement path.
    ///
    /// Fails if the consumer has no connection or the connection has no
    /// transport.
    pub fn start(&self, request: Option<Bytes>) -> Result<()> {
        let connection = self
            .connection()
            .ok_or_else(|| Error::internal("cannot start a new request without a connection"))?;
        if connection.transport().is_none() {
            return Err(Error::internal(format!("{} has no transport", connection)));
        }
        *self.request.lock().unwrap() = request.clone();
        self.events
            .fire(Event::PreRequest, EventData::bytes(request.clone()));
        if request.is_some() {
            if let Some(this) = self.weak_self.upgrade() {
                let started = self.protocol.lock().unwrap().start_request(&this);
                if let Err(error) = started {
                    self.finished(EventData::Failure(error));
                }
            }
        }
        Ok(())
    }

    /// Retires this consumer.
    ///
    /// Releases the connection's consumer slot if this consumer currently
    /// holds it, then fires `finish` and `post_request` with `result`. When
    /// the consumer was upgraded, the `post_request` fired here resolves a
    /// fresh cell; the original completion has been re-homed onto the
    /// replacement consumer.
    pub fn finished(&self, result: EventData) {
        if let Some(connection) = self.connection() {
            connection.release_consumer(self);
        }
        self.events.fire(Event::Finish, result.clone());
        self.events.fire(Event::PostRequest, result);
    }

    /// Called by the connection when the transport is closed. Logs `exc` and
    /// delegates to [`finished`](ProtocolConsumer::finished).
    pub fn connection_lost(&self, exc: Option<Error>) {
        match exc {
            Some(error) => {
                log_failure(&error);
                self.finished(EventData::Failure(error));
            }
            None => self.finished(EventData::Null),
        }
    }

    /// Decides whether a failed request should be retried (clients only) and
    /// returns the number of attempts to try next, `0` meaning give up.
    ///
    /// A connection that has already processed earlier consumers but
    /// delivered no bytes to this one is classified as a stale keep-alive
    /// connection: the request is retried once without counting against the
    /// reconnect budget, and `exc` is marked logged to suppress duplicate
    /// output.
    pub fn can_reconnect(&self, max_reconnect: u32, exc: &mut Error) -> u32 {
        if let Some(connection) = self.connection() {
            if self.data_received_count() == 0 && connection.processed() > 1 {
                exc.set_logged(true);
                return 1;
            }
        }
        if self.reconnect_retries.load(Ordering::SeqCst) < max_reconnect {
            let retries = self.reconnect_retries.fetch_add(1, Ordering::SeqCst) + 1;
            exc.log();
            retries
        } else {
            0
        }
    }

    /// Called by the connection for every inbound buffer: updates the
    /// counters, fires `data_received`, invokes the protocol's parser and
    /// fires `data_processed`, returning the parser's residual.
    pub(crate) fn handle_data(&self, data: Bytes) -> Result<Option<Bytes>> {
        self.data_received_count.fetch_add(1, Ordering::SeqCst);
        self.reconnect_retries.store(0, Ordering::SeqCst);
        self.events
            .fire(Event::DataReceived, EventData::Bytes(data.clone()));
        let residual = match self.weak_self.upgrade() {
            Some(this) => self
                .protocol
                .lock()
                .unwrap()
                .data_received(&this, data.clone())?,
            None => None,
        };
        self.events.fire(Event::DataProcessed, EventData::Bytes(data));
        Ok(residual)
    }

    pub(crate) fn bind_connection(&self, connection: Weak<Connection>) {
        *self.connection.lock().unwrap() = connection;
    }

    pub(crate) fn run_connection_made(&self) {
        if let Some(this) = self.weak_self.upgrade() {
            self.protocol.lock().unwrap().connection_made(&this);
        }
    }

    pub(crate) fn set_upgraded_from(&self, old: &Arc<ProtocolConsumer>) {
        *self.upgraded_from.lock().unwrap() = Some(old.clone());
    }

    pub(crate) fn set_new_connection(&self, new_connection: bool) {
        self.new_connection.store(new_connection, Ordering::SeqCst);
    }

    /// Whether binding this consumer counts as a new request cycle on its
    /// connection. True unless the consumer replaces an upgraded consumer
    /// that kept the same connection.
    pub(crate) fn counts_as_new_request(&self) -> bool {
        match self.upgraded_from() {
            Some(old) => old.new_connection.load(Ordering::SeqCst),
            None => true,
        }
    }
}

impl fmt::Debug for ProtocolConsumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProtocolConsumer")
            .field("data_received_count", &self.data_received_count())
            .field("reconnect_retries", &self.reconnect_retries())
            .field("has_finished", &self.has_finished())
            .finish()
    }
}
