use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use bytes::Bytes;
use pretty_assertions::assert_eq;

use super::{Protocol, ProtocolConsumer};
use crate::{
    error::{Error, Result},
    event::{Event, EventData},
    test::{event_log, factory_of, labels, log_subscriber, make_connection, Swallow, TakeOne},
};

/// Records when the parser hook runs, so event ordering around it can be
/// asserted.
struct Labelled {
    log: Arc<Mutex<Vec<(String, EventData)>>>,
}

impl Protocol for Labelled {
    fn data_received(
        &mut self,
        _consumer: &Arc<ProtocolConsumer>,
        data: Bytes,
    ) -> Result<Option<Bytes>> {
        self.log
            .lock()
            .unwrap()
            .push(("parser".into(), EventData::Bytes(data)));
        Ok(None)
    }
}

struct FailingStart;

impl Protocol for FailingStart {
    fn data_received(
        &mut self,
        _consumer: &Arc<ProtocolConsumer>,
        _data: Bytes,
    ) -> Result<Option<Bytes>> {
        Ok(None)
    }

    fn start_request(&mut self, _consumer: &Arc<ProtocolConsumer>) -> Result<()> {
        Err(Error::internal("request could not be written"))
    }
}

#[tokio::test]
async fn data_events_fire_around_the_parser() {
    let log = event_log();
    let parser_log = log.clone();
    let (connection, _transport) = make_connection(
        Arc::new(move |_connection: &Arc<crate::connection::Connection>| {
            ProtocolConsumer::new(Labelled {
                log: parser_log.clone(),
            })
        }),
        Duration::ZERO,
    );
    connection.data_received(Bytes::from_static(b"abc")).unwrap();
    assert_eq!(labels(&log), vec!["parser"]);

    let consumer = connection.current_consumer().unwrap();
    consumer
        .events()
        .bind(Event::DataReceived, log_subscriber("received", &log));
    consumer
        .events()
        .bind(Event::DataProcessed, log_subscriber("processed", &log));
    // The consumer's many-time events wrap the parser call.
    connection.data_received(Bytes::from_static(b"def")).unwrap();
    assert_eq!(
        labels(&log),
        vec!["parser", "received", "parser", "processed"]
    );
}

#[tokio::test]
async fn delivery_counters_track_buffers() {
    let (connection, _transport) = make_connection(factory_of(|| Swallow), Duration::ZERO);
    connection.data_received(Bytes::from_static(b"one")).unwrap();
    let consumer = connection.current_consumer().unwrap();
    assert_eq!(consumer.data_received_count(), 1);
    connection.data_received(Bytes::from_static(b"two")).unwrap();
    assert_eq!(consumer.data_received_count(), 2);
}

#[tokio::test]
async fn reconnect_retries_reset_on_delivery() {
    let (connection, _transport) = make_connection(factory_of(|| Swallow), Duration::ZERO);
    connection.data_received(Bytes::from_static(b"x")).unwrap();
    let consumer = connection.current_consumer().unwrap();

    let mut exc = Error::internal("boom");
    assert_eq!(consumer.can_reconnect(3, &mut exc), 1);
    assert_eq!(consumer.can_reconnect(3, &mut exc), 2);
    assert_eq!(consumer.reconnect_retries(), 2);

    connection.data_received(Bytes::from_static(b"y")).unwrap();
    assert_eq!(consumer.reconnect_retries(), 0);
}

#[tokio::test]
async fn reconnect_budget_exhausts() {
    let (connection, _transport) = make_connection(factory_of(|| Swallow), Duration::ZERO);
    connection.data_received(Bytes::from_static(b"x")).unwrap();
    let consumer = connection.current_consumer().unwrap();

    let mut exc = Error::internal("boom");
    assert_eq!(consumer.can_reconnect(1, &mut exc), 1);
    assert_eq!(consumer.can_reconnect(1, &mut exc), 0);
}

#[tokio::test]
async fn stale_keepalive_connection_gets_one_free_retry() {
    let (connection, _transport) = make_connection(factory_of(|| TakeOne), Duration::ZERO);
    // Retire a few consumers so the connection looks like a reused
    // keep-alive connection.
    connection.data_received(Bytes::from_static(b"abc")).unwrap();
    assert_eq!(connection.processed(), 3);

    // A fresh consumer that never saw a byte fails: classified stale.
    let consumer = ProtocolConsumer::new(Swallow);
    connection.set_consumer(&consumer).unwrap();
    let mut exc = Error::internal("connection reset by peer");
    assert_eq!(consumer.can_reconnect(0, &mut exc), 1);
    assert!(exc.logged());
}

#[tokio::test]
async fn start_fires_pre_request_with_the_request() {
    let (connection, _transport) = make_connection(factory_of(|| Swallow), Duration::ZERO);
    let consumer = ProtocolConsumer::new(Swallow);
    connection.set_consumer(&consumer).unwrap();

    let log = event_log();
    consumer
        .events()
        .bind(Event::PreRequest, log_subscriber("pre", &log));
    consumer.start(Some(Bytes::from_static(b"GET /"))).unwrap();

    let entries = log.lock().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].1.as_bytes(), Some(&Bytes::from_static(b"GET /")));
    drop(entries);
    assert_eq!(consumer.request(), Some(Bytes::from_static(b"GET /")));
}

#[tokio::test]
async fn failing_start_request_retires_through_finished() {
    let (connection, _transport) = make_connection(factory_of(|| Swallow), Duration::ZERO);
    let consumer = ProtocolConsumer::new(FailingStart);
    connection.set_consumer(&consumer).unwrap();

    consumer.start(Some(Bytes::from_static(b"req"))).unwrap();

    assert!(consumer.has_finished());
    assert!(connection.current_consumer().is_none());
    let outcome = consumer.request_done().result().unwrap();
    assert!(outcome.as_failure().is_some());
}

#[test]
fn start_without_a_connection_fails() {
    let consumer = ProtocolConsumer::new(Swallow);
    assert!(consumer.start(None).is_err());
}

#[tokio::test]
async fn connection_lost_retires_with_the_failure() {
    let (connection, _transport) = make_connection(factory_of(|| Swallow), Duration::ZERO);
    connection.data_received(Bytes::from_static(b"x")).unwrap();
    let consumer = connection.current_consumer().unwrap();

    consumer.connection_lost(Some(Error::internal("reset")));
    assert!(consumer.has_finished());
    assert!(connection.current_consumer().is_none());
    assert!(consumer.on_finished().result().unwrap().as_failure().is_some());
}
