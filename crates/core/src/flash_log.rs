//! Append-only log of flash-sync timestamps, plus live fan-out to listeners.
//!
//! The CSV lives in the node data root rather than in a session, so it spans
//! sessions and is shipped alongside every transfer.

use std::path::{Path, PathBuf};

use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, broadcast};
use tracing::{debug, trace};

pub const FLASH_LOG_FILE: &str = "flash_sync_events.csv";
const HEADER: &str = "timestamp_ns,session_id\n";

/// One captured flash-sync instant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlashEvent {
	pub timestamp_ns: u64,
	pub session_id: Option<String>,
}

pub struct FlashLog {
	path: PathBuf,
	write_lock: Mutex<()>,
	events: broadcast::Sender<FlashEvent>,
}

impl FlashLog {
	pub fn new(data_root: &Path) -> Self {
		let (events, _) = broadcast::channel(64);
		Self {
			path: data_root.join(FLASH_LOG_FILE),
			write_lock: Mutex::new(()),
			events,
		}
	}

	pub fn path(&self) -> &Path {
		&self.path
	}

	/// Live flash events; lagging receivers lose the oldest ones.
	pub fn subscribe(&self) -> broadcast::Receiver<FlashEvent> {
		self.events.subscribe()
	}

	/// Signals listeners, then appends the event to the CSV.
	pub async fn record(&self, event: FlashEvent) -> std::io::Result<()> {
		let listeners = self.events.send(event.clone()).unwrap_or(0);
		trace!(target = "nodelink.engine", listeners, "flash event broadcast");

		let _guard = self.write_lock.lock().await;
		if let Some(parent) = self.path.parent() {
			tokio::fs::create_dir_all(parent).await?;
		}
		let mut file = tokio::fs::OpenOptions::new().create(true).append(true).open(&self.path).await?;
		let mut row = String::new();
		if file.metadata().await?.len() == 0 {
			row.push_str(HEADER);
		}
		row.push_str(&format!("{},{}\n", event.timestamp_ns, event.session_id.as_deref().unwrap_or("")));
		file.write_all(row.as_bytes()).await?;
		file.flush().await?;
		debug!(target = "nodelink.engine", timestamp_ns = event.timestamp_ns, path = %self.path.display(), "flash sync logged");
		Ok(())
	}
}
