//! Node-side networking: the command connection to the hub, its line
//! framing, and DNS-SD advertisement/discovery.
//!
//! The [`ConnectionManager`] owns the only outbound command socket and is the
//! single writer of [`ConnectionState`]. Everything it observes (inbound
//! lines, connects, losses) is delivered as [`ConnectionEvent`] messages;
//! it never interprets command semantics.

pub mod connection;
pub mod discovery;
pub mod error;
pub mod transport;

pub use connection::{
	ConnectionConfig, ConnectionEvent, ConnectionManager, ConnectionState, ConnectionStatus, RemoteEndpoint, RetryPolicy,
};
pub use discovery::{Browser, DEVICE_ID_PROPERTY, DiscoveredService, Discovery, DiscoveryEvent};
pub use error::{Error, Result};
pub use transport::{LineReader, LineTransport, LineWriter};
