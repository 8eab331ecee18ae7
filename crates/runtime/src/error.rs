//! Error types for the node runtime.

use thiserror::Error;

/// Result type alias for runtime operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur on the command connection or during discovery.
#[derive(Debug, Error)]
pub enum Error {
	/// No live command connection.
	#[error("Not connected")]
	NotConnected,

	/// Connecting to the hub failed.
	#[error("Failed to connect to {endpoint}: {reason}")]
	ConnectFailed { endpoint: String, reason: String },

	/// A newer connect/disconnect call replaced this attempt.
	#[error("Connection attempt to {0} was superseded")]
	Superseded(String),

	/// Timeout waiting for a socket operation.
	#[error("Timeout: {0}")]
	Timeout(String),

	/// A line violated the newline framing rules.
	#[error("Framing error: {0}")]
	Framing(String),

	/// Service advertisement or browsing failed.
	#[error("Discovery error: {0}")]
	Discovery(String),

	/// Invalid endpoint string.
	#[error("Invalid endpoint '{0}': expected HOST:PORT")]
	InvalidEndpoint(String),

	/// I/O error.
	#[error("I/O error: {0}")]
	Io(#[from] std::io::Error),

	/// JSON serialization error.
	#[error("JSON error: {0}")]
	Json(#[from] serde_json::Error),
}

impl Error {
	/// Returns true for errors caused by a timeout.
	pub fn is_timeout(&self) -> bool {
		match self {
			Error::Timeout(_) => true,
			Error::Io(err) => err.kind() == std::io::ErrorKind::TimedOut,
			_ => false,
		}
	}

	/// Returns true when the error means the socket is unusable.
	pub fn is_connection_loss(&self) -> bool {
		matches!(self, Error::NotConnected | Error::Io(_) | Error::Timeout(_))
	}
}
