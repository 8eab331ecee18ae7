//! Wire types for the hub/node command protocol.
//!
//! The command connection carries one JSON object per `\n`-terminated line.
//! The hub sends [`Command`]s, the node answers each with exactly one
//! [`Response`] carrying the same `ack_id`, and pushes [`Envelope`]s
//! (heartbeats, asynchronous acks, rejoin notices) on its own initiative.
//! File transfers use a separate connection that starts with a
//! [`TransferHeader`] line.
//!
//! # Main Types
//!
//! - [`Command`] / [`CommandKind`] - parsed inbound commands
//! - [`DecodeError`] - why a line could not become a command
//! - [`Response`] / [`Status`] - one reply per command
//! - [`Envelope`] - node-initiated messages
//! - [`TransferHeader`] - first line of a file-transfer connection

pub mod clock;
pub mod command;
pub mod envelope;
pub mod response;
pub mod transfer;

pub use clock::now_nanos;
pub use command::{Command, CommandKind, DecodeError, DecodeErrorKind};
pub use envelope::{Envelope, PROTOCOL_VERSION};
pub use response::{Response, Status};
pub use transfer::{TransferHeader, archive_filename};

/// DNS-SD service type advertised by nodes and browsed by hubs.
pub const DEFAULT_SERVICE_TYPE: &str = "_gsr-controller._tcp.local.";

/// DNS-SD service type advertised by hubs and browsed by nodes.
pub const DEFAULT_HUB_SERVICE_TYPE: &str = "_sensorhub._tcp.local.";

/// Upper bound for a single framed line, in bytes (newline excluded).
pub const MAX_LINE_LEN: usize = 1024 * 1024;
