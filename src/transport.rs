//! The byte-oriented transport interface consumed by [`Connection`] and a
//! reference TCP implementation.
//!
//! The core never touches sockets directly: a transport pushes inbound bytes
//! by calling [`Connection::data_received`] and reports closure through
//! [`Connection::connection_lost`], while the connection writes back and
//! closes through this trait.
//!
//! [`Connection`]: crate::connection::Connection
//! [`Connection::data_received`]: crate::connection::Connection::data_received
//! [`Connection::connection_lost`]: crate::connection::Connection::connection_lost

pub mod tcp;


use std::{fmt::Debug, net::SocketAddr};

use bytes::Bytes;

use crate::error::{Error, Result};

/// A byte-oriented transport bound to a [`Connection`].
///
/// [`Connection`]: crate::connection::Connection
pub trait Transport: Debug + Send + Sync {
    /// Queues `data` for delivery to the peer.
    fn write(&self, data: Bytes) -> Result<()>;

    /// Closes the transport.
    ///
    /// A graceful close flushes pending writes first; otherwise the transport
    /// is torn down immediately. `exc` is the reason for the closure and is
    /// forwarded to [`Connection::connection_lost`], which the transport must
    /// arrange to be called exactly once when the closure completes.
    ///
    /// [`Connection::connection_lost`]: crate::connection::Connection::connection_lost
    fn close(&self, graceful: bool, exc: Option<Error>);

    /// Whether a close has been initiated or observed.
    fn is_closing(&self) -> bool;

    /// Whether the underlying link is no longer usable for new requests.
    fn is_stale(&self) -> bool {
        self.is_closing()
    }

    /// The peer address, if known.
    fn address(&self) -> Option<SocketAddr>;

    /// A stable identity for the underlying socket.
    ///
    /// Two transports wrapping the same socket (e.g. a stream re-wrapped
    /// after a TLS handshake) must report the same id, which lets
    /// [`Connection::connection_made`] treat the re-bind as a no-op.
    ///
    /// [`Connection::connection_made`]: crate::connection::Connection::connection_made
    fn socket_id(&self) -> Option<u64> {
        None
    }
}
