//! TCP listeners, connectors and sockets, with optional TLS.
//!
//! Everything runs within a [NetContext]: create listeners and
//! connectors from it, and shut it down to close them all.

pub mod config;
mod connector;
mod context;
pub mod error;
pub mod hostport;
mod listener;
mod metrics;
mod socket;
pub mod tls;

#[cfg(any(test, feature = "testing"))]
pub mod testing;


pub use connector::Connector;
pub use context::NetContext;
pub use error::{BindError, ConnectError, FileError, SocketError, TlsConfigError, TlsError};
pub use listener::Listener;
pub use netsock_types::AddressInfo;
pub use socket::{SendFile, Socket, SocketReader, SocketWriter};
