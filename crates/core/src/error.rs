use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for node operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error for the node library.
///
/// `Display` output is what the hub sees in the `error` field of a response.
#[derive(Debug, Error)]
pub enum Error {
	#[error("Invalid parameters: {0}")]
	InvalidParams(String),

	#[error("node is already running")]
	AlreadyRunning,

	#[error("data directory {path} is unusable: {source}")]
	DataDir {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},

	#[error(transparent)]
	Session(#[from] SessionError),

	#[error(transparent)]
	Transfer(#[from] TransferError),

	#[error(transparent)]
	Runtime(#[from] nodelink_runtime::Error),

	#[error("I/O error: {0}")]
	Io(#[from] std::io::Error),

	#[error("JSON error: {0}")]
	Json(#[from] serde_json::Error),
}

/// Failures of the recording state machine.
#[derive(Debug, Error)]
pub enum SessionError {
	#[error("session already active")]
	AlreadyActive,

	#[error("recorders can only be changed while idle")]
	NotIdle,

	#[error("invalid session id '{id}': {reason}")]
	InvalidId { id: String, reason: &'static str },

	#[error("session not found: {0}")]
	NotFound(String),

	#[error("recorder '{name}' failed to start: {reason}")]
	StartFailed { name: String, reason: String },

	#[error("session start cancelled")]
	Cancelled,

	#[error("failed to create session directory {path}: {source}")]
	Layout {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},
}

/// Failures of a single file transfer job.
#[derive(Debug, Error)]
pub enum TransferError {
	#[error("session not found: {0}")]
	SessionNotFound(String),

	#[error("transfer already in progress for session {0}")]
	AlreadyRunning(String),

	#[error("could not resolve {0}")]
	Resolve(String),

	#[error("connect to {endpoint} failed: {reason}")]
	Connect { endpoint: String, reason: String },

	#[error("I/O error: {0}")]
	Io(#[from] std::io::Error),

	#[error("JSON error: {0}")]
	Json(#[from] serde_json::Error),

	#[error("transfer task failed: {0}")]
	Task(String),
}
