use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use pretty_assertions::assert_eq;

use crate::{
    consumer::ProtocolConsumer,
    error::Error,
    event::{Event, EventData},
    test::{
        event_log, factory_of, labels, log_subscriber, make_connection, pending_connection,
        Echo, MockTransport, Sticky, Swallow, TakeOne,
    },
};

#[tokio::test]
async fn serial_requests_share_one_buffer() {
    let (connection, _transport) = make_connection(factory_of(|| TakeOne), Duration::ZERO);
    let log = event_log();
    {
        let events = connection.events();
        events.bind(Event::PreRequest, log_subscriber("pre", &log));
        events.bind(Event::Finish, log_subscriber("finish", &log));
        events.bind(Event::PostRequest, log_subscriber("post", &log));
    }

    connection.data_received(Bytes::from_static(b"AB")).unwrap();

    // Two consumers each consumed one byte and retired mid-buffer.
    assert_eq!(connection.processed(), 2);
    assert!(connection.current_consumer().is_none());
    // pre_request for consumer n+1 fires strictly after post_request for
    // consumer n.
    assert_eq!(
        labels(&log),
        vec!["pre", "finish", "post", "pre", "finish", "post"]
    );
}

#[tokio::test]
async fn consumers_write_back_through_the_transport() {
    let (connection, transport) = make_connection(factory_of(|| Echo), Duration::ZERO);
    connection.data_received(Bytes::from_static(b"ping")).unwrap();
    assert_eq!(transport.writes(), vec![Bytes::from_static(b"ping")]);
    assert_eq!(connection.processed(), 1);
}

#[tokio::test]
async fn residual_from_a_bound_consumer_is_a_protocol_error() {
    let (connection, _transport) = make_connection(factory_of(|| Sticky), Duration::ZERO);
    let error = connection
        .data_received(Bytes::from_static(b"X"))
        .unwrap_err();
    assert!(error.is_protocol());
    assert_eq!(error.to_string(), "protocol error: current consumer not done.");
}

#[tokio::test]
async fn consumer_slot_is_serial() {
    let (connection, _transport) = make_connection(factory_of(|| Swallow), Duration::ZERO);
    connection.data_received(Bytes::from_static(b"x")).unwrap();
    let second = ProtocolConsumer::new(Swallow);
    assert!(connection.set_consumer(&second).is_err());

    // Retiring the bound consumer frees the slot.
    connection.current_consumer().unwrap().finished(EventData::Null);
    assert!(connection.set_consumer(&second).is_ok());
}

#[tokio::test]
async fn upgrade_preserves_post_request() {
    let (connection, _transport) = make_connection(factory_of(|| Swallow), Duration::ZERO);
    connection.data_received(Bytes::from_static(b"GET")).unwrap();
    let first = connection.current_consumer().unwrap();

    // An observer subscribing after pre_request, before the upgrade.
    let log = event_log();
    first
        .events()
        .bind(Event::PostRequest, log_subscriber("observer", &log));

    connection.upgrade(Some(factory_of(|| TakeOne)), false).unwrap();

    // The old consumer retires; its own post_request is a fresh cell, so
    // the observer stays pending.
    first.finished(EventData::Null);
    assert!(labels(&log).is_empty());

    // The next buffer builds the replacement through the upgraded factory.
    connection.data_received(Bytes::from_static(b"Z")).unwrap();
    let entries = log.lock().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].1.as_bytes(), Some(&Bytes::from_static(b"Z")));
}

#[tokio::test]
async fn same_connection_upgrade_is_a_continuation() {
    let (connection, _transport) = make_connection(factory_of(|| Swallow), Duration::ZERO);
    connection.data_received(Bytes::from_static(b"GET")).unwrap();
    let first = connection.current_consumer().unwrap();
    assert_eq!(connection.processed(), 1);

    connection.upgrade(Some(factory_of(|| Swallow)), false).unwrap();
    first.finished(EventData::Null);
    connection.data_received(Bytes::from_static(b"ws")).unwrap();

    let second = connection.current_consumer().unwrap();
    assert!(Arc::ptr_eq(&second.upgraded_from().unwrap(), &first));
    // The upgraded consumer continues the same framing session.
    assert_eq!(connection.processed(), 1);
}

#[tokio::test]
async fn new_connection_upgrade_counts_a_new_request() {
    let (connection, _transport) = make_connection(factory_of(|| Swallow), Duration::ZERO);
    connection.data_received(Bytes::from_static(b"CONNECT")).unwrap();
    let first = connection.current_consumer().unwrap();

    connection.upgrade(Some(factory_of(|| Swallow)), true).unwrap();
    first.finished(EventData::Null);
    connection.data_received(Bytes::from_static(b"tunnelled")).unwrap();

    assert_eq!(connection.processed(), 2);
}

#[tokio::test]
async fn connection_lost_dispatches_exactly_once() {
    let (connection, _transport) = make_connection(factory_of(|| Swallow), Duration::ZERO);
    connection.data_received(Bytes::from_static(b"x")).unwrap();
    let consumer = connection.current_consumer().unwrap();

    let log = event_log();
    consumer
        .events()
        .bind(Event::Finish, log_subscriber("finish", &log));

    connection.connection_lost(Some(Error::internal("reset")));
    connection.connection_lost(Some(Error::internal("reset again")));

    assert_eq!(labels(&log), vec!["finish"]);
    let lost = connection.events().cell(Event::ConnectionLost).unwrap();
    assert!(lost.is_done());
}

#[tokio::test]
async fn rebinding_the_same_socket_fires_connection_made_once() {
    let connection = pending_connection(7, factory_of(|| Swallow), Duration::ZERO);
    let log = event_log();
    connection
        .events()
        .bind(Event::ConnectionMade, log_subscriber("made", &log));

    let transport = MockTransport::new(42);
    transport.bind(&connection);
    // A re-wrap of the same underlying socket, e.g. after a TLS handshake.
    let rewrapped = MockTransport::new(42);
    rewrapped.bind(&connection);

    assert_eq!(labels(&log), vec!["made"]);
    assert_eq!(connection.socket_id(), Some(42));
}

#[tokio::test(start_paused = true)]
async fn idle_timeout_closes_the_transport() {
    let (connection, transport) =
        make_connection(factory_of(|| Swallow), Duration::from_millis(50));
    assert_eq!(transport.close_count(), 0);

    tokio::time::sleep(Duration::from_millis(60)).await;

    assert_eq!(transport.close_count(), 1);
    assert!(connection.closed());
    let lost = connection.events().cell(Event::ConnectionLost).unwrap();
    let outcome = lost.result().unwrap();
    assert!(outcome.as_failure().unwrap().is_timed_out());
}

#[tokio::test(start_paused = true)]
async fn idle_timer_is_not_armed_while_a_consumer_is_bound() {
    let (connection, transport) =
        make_connection(factory_of(|| Swallow), Duration::from_millis(50));
    // The consumer swallows the buffer without retiring, so the slot stays
    // occupied and the timer must stay off.
    connection.data_received(Bytes::from_static(b"partial frame")).unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(transport.close_count(), 0);

    // Retiring the consumer re-arms the timer on the next delivery cycle.
    connection.current_consumer().unwrap().finished(EventData::Null);
    connection.set_timeout(Duration::from_millis(50));
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(transport.close_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn inbound_data_disarms_the_idle_timer() {
    let (connection, transport) =
        make_connection(factory_of(|| TakeOne), Duration::from_millis(50));

    for _ in 0..4 {
        tokio::time::sleep(Duration::from_millis(30)).await;
        connection.data_received(Bytes::from_static(b"A")).unwrap();
    }
    // 120ms elapsed, but no idle window ever reached 50ms.
    assert_eq!(transport.close_count(), 0);

    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(transport.close_count(), 1);
}

#[tokio::test]
async fn close_and_abort_forward_to_the_transport() {
    let (connection, transport) = make_connection(factory_of(|| Swallow), Duration::ZERO);
    connection.close(None);
    assert!(connection.closed());
    assert_eq!(transport.close_count(), 1);

    let (connection, transport) = make_connection(factory_of(|| Swallow), Duration::ZERO);
    connection.abort(None);
    assert_eq!(transport.close_count(), 1);
    assert!(connection.is_stale());
}

#[tokio::test]
async fn display_shows_the_address_once_bound() {
    let connection = pending_connection(3, factory_of(|| Swallow), Duration::ZERO);
    assert_eq!(connection.to_string(), "<pending-connection> session 3");
    MockTransport::new(1).bind(&connection);
    assert_eq!(connection.to_string(), "127.0.0.1:4000 session 3");
}
