//! A recorder that needs no hardware.
//!
//! It writes `metadata.json` into its session directory when started and
//! rewrites it with the stop time when stopped, so a node started with
//! `--recorder` produces real, transferable sessions.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use nodelink::protocol::now_nanos;
use nodelink::{RecorderError, SensorRecorder};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

pub const METADATA_FILE: &str = "metadata.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordingMetadata {
	pub recorder: String,
	pub device_id: String,
	pub started_at_ns: u64,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub stopped_at_ns: Option<u64>,
}

struct Running {
	path: PathBuf,
	metadata: RecordingMetadata,
}

pub struct MetadataRecorder {
	name: String,
	device_id: String,
	running: Mutex<Option<Running>>,
}

impl MetadataRecorder {
	pub fn new(name: impl Into<String>, device_id: impl Into<String>) -> Self {
		Self {
			name: name.into(),
			device_id: device_id.into(),
			running: Mutex::new(None),
		}
	}

	pub fn shared(name: impl Into<String>, device_id: impl Into<String>) -> Arc<dyn SensorRecorder> {
		Arc::new(Self::new(name, device_id))
	}
}

async fn write_metadata(path: &Path, metadata: &RecordingMetadata) -> Result<(), RecorderError> {
	let body = serde_json::to_vec_pretty(metadata).map_err(|err| RecorderError::new(err.to_string()))?;
	tokio::fs::write(path, body).await?;
	Ok(())
}

#[async_trait]
impl SensorRecorder for MetadataRecorder {
	async fn start(&self, directory: &Path) -> Result<(), RecorderError> {
		if self.running.lock().is_some() {
			return Ok(());
		}

		let path = directory.join(METADATA_FILE);
		let metadata = RecordingMetadata {
			recorder: self.name.clone(),
			device_id: self.device_id.clone(),
			started_at_ns: now_nanos(),
			stopped_at_ns: None,
		};
		write_metadata(&path, &metadata).await?;
		debug!(target = "nodelink.recorder", recorder = %self.name, path = %path.display(), "metadata recorder started");
		*self.running.lock() = Some(Running { path, metadata });
		Ok(())
	}

	async fn stop(&self) -> Result<(), RecorderError> {
		let Some(Running { path, mut metadata }) = self.running.lock().take() else {
			return Ok(());
		};
		metadata.stopped_at_ns = Some(now_nanos());
		write_metadata(&path, &metadata).await?;
		debug!(target = "nodelink.recorder", recorder = %self.name, "metadata recorder stopped");
		Ok(())
	}
}
