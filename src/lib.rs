#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]
#![warn(clippy::cast_possible_truncation)]

pub use bytes;

pub mod connection;
pub mod consumer;
pub mod error;
pub mod event;
pub mod producer;
pub mod server;
pub mod transport;

pub(crate) mod runtime;


pub use crate::{
    connection::{Connection, ConsumerFactory},
    consumer::{Protocol, ProtocolConsumer},
    error::{Error, ErrorKind, Result},
    event::{Event, EventCell, EventData, EventHub, Subscriber},
    producer::{ConnectionFactory, ConnectionProducer, Producer, ProducerOptions},
    server::{Server, ServerOptions},
    transport::{tcp::TcpTransport, Transport},
};

/// A boxed future.
pub type BoxFuture<'a, T> = std::pin::Pin<Box<dyn std::future::Future<Output = T> + Send + 'a>>;
