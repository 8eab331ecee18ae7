//! The capability interface every sensor module implements.
//!
//! The orchestrator never looks inside a recorder. It creates the directory,
//! calls [`SensorRecorder::start`] and later [`SensorRecorder::stop`], and
//! treats a returned error as "not ready" or "did not finalize cleanly".

use std::path::Path;

use async_trait::async_trait;
use thiserror::Error;

/// Error reported by a recorder.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct RecorderError(pub String);

impl RecorderError {
	pub fn new(message: impl Into<String>) -> Self {
		Self(message.into())
	}
}

impl From<std::io::Error> for RecorderError {
	fn from(err: std::io::Error) -> Self {
		Self(err.to_string())
	}
}

/// A source of data for one sensing modality.
///
/// Both methods must be idempotent: `start` on a running recorder and `stop`
/// on a stopped one are no-ops that succeed.
#[async_trait]
pub trait SensorRecorder: Send + Sync {
	/// Begins capturing into `directory`, which already exists.
	async fn start(&self, directory: &Path) -> Result<(), RecorderError>;

	/// Finalizes output and releases the device.
	async fn stop(&self) -> Result<(), RecorderError>;
}
