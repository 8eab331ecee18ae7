//! Background shipping of recorded sessions to the hub.
//!
//! Each transfer gets its own TCP connection and runs on the blocking pool.
//! Jobs are tracked by session id; finished jobs stay in the registry until
//! replaced by a new transfer of the same session.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use nodelink_protocol::{TransferHeader, now_nanos};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::error::TransferError;
use crate::session::resolve_session_dir;

pub mod archive;

pub use archive::TransferTimeouts;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransferStatus {
	Pending,
	Streaming,
	Complete,
	Failed,
}

impl TransferStatus {
	pub fn is_finished(self) -> bool {
		matches!(self, TransferStatus::Complete | TransferStatus::Failed)
	}
}

/// Snapshot of one transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransferJob {
	pub session_id: String,
	pub host: String,
	pub port: u16,
	pub directory: PathBuf,
	pub filename: String,
	pub status: TransferStatus,
	pub bytes_sent: u64,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub error: Option<String>,
	/// `ack_id` of the command that requested the transfer.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub ack_id: Option<String>,
	pub started_at_ns: u64,
}

struct JobEntry {
	job: TransferJob,
	sent: Arc<AtomicU64>,
}

impl JobEntry {
	fn snapshot(&self) -> TransferJob {
		let mut job = self.job.clone();
		if !job.status.is_finished() {
			job.bytes_sent = self.sent.load(Ordering::Relaxed);
		}
		job
	}
}

/// Starts transfers and remembers their outcome.
pub struct TransferService {
	device_id: String,
	sessions_root: PathBuf,
	side_file: Option<PathBuf>,
	timeouts: TransferTimeouts,
	jobs: Arc<DashMap<String, JobEntry>>,
	completions: mpsc::UnboundedSender<TransferJob>,
}

impl TransferService {
	/// Returns the service and the stream of finished jobs.
	pub fn new(
		device_id: impl Into<String>,
		sessions_root: impl Into<PathBuf>,
		side_file: Option<PathBuf>,
		timeouts: TransferTimeouts,
	) -> (Self, mpsc::UnboundedReceiver<TransferJob>) {
		let (completions, rx) = mpsc::unbounded_channel();
		let service = Self {
			device_id: device_id.into(),
			sessions_root: sessions_root.into(),
			side_file,
			timeouts,
			jobs: Arc::new(DashMap::new()),
			completions,
		};
		(service, rx)
	}

	pub fn device_id(&self) -> &str {
		&self.device_id
	}

	/// Validates the request and launches the transfer in the background.
	///
	/// Fails fast when the session directory does not exist or a transfer for
	/// the same session is still pending or streaming. Must be called inside a
	/// Tokio runtime.
	pub fn transfer(&self, session_id: &str, host: &str, port: u16, ack_id: Option<String>) -> Result<TransferJob, TransferError> {
		let directory =
			resolve_session_dir(&self.sessions_root, session_id).map_err(|_| TransferError::SessionNotFound(session_id.to_string()))?;
		let header = TransferHeader::new(session_id, self.device_id.clone());

		let job = TransferJob {
			session_id: session_id.to_string(),
			host: host.to_string(),
			port,
			directory: directory.clone(),
			filename: header.filename.clone(),
			status: TransferStatus::Pending,
			bytes_sent: 0,
			error: None,
			ack_id,
			started_at_ns: now_nanos(),
		};
		let sent = Arc::new(AtomicU64::new(0));

		match self.jobs.entry(session_id.to_string()) {
			Entry::Occupied(existing) if !existing.get().job.status.is_finished() => {
				return Err(TransferError::AlreadyRunning(session_id.to_string()));
			}
			Entry::Occupied(mut existing) => {
				existing.insert(JobEntry {
					job: job.clone(),
					sent: sent.clone(),
				});
			}
			Entry::Vacant(slot) => {
				slot.insert(JobEntry {
					job: job.clone(),
					sent: sent.clone(),
				});
			}
		}

		info!(
			target = "nodelink.transfer",
			session = %session_id,
			dest = %format!("{host}:{port}"),
			file = %header.filename,
			"transfer queued"
		);

		let jobs = self.jobs.clone();
		let completions = self.completions.clone();
		let side_file = self.side_file.clone();
		let timeouts = self.timeouts;
		let key = session_id.to_string();
		let host = host.to_string();

		let blocking = tokio::task::spawn_blocking({
			let jobs = jobs.clone();
			let key = key.clone();
			move || {
				set_status(&jobs, &key, TransferStatus::Streaming);
				archive::send_session(&host, port, &header, &directory, side_file.as_deref(), timeouts, &sent)
			}
		});

		tokio::spawn(async move {
			let result = match blocking.await {
				Ok(result) => result,
				Err(join_err) => Err(TransferError::Task(join_err.to_string())),
			};
			let finished = finish(&jobs, &key, result);
			if let Some(job) = finished {
				let _ = completions.send(job);
			}
		});

		Ok(job)
	}

	/// Latest known state of the transfer for `session_id`.
	pub fn job(&self, session_id: &str) -> Option<TransferJob> {
		self.jobs.get(session_id).map(|entry| entry.snapshot())
	}

	/// All tracked transfers, ordered by start time.
	pub fn jobs(&self) -> Vec<TransferJob> {
		let mut jobs: Vec<_> = self.jobs.iter().map(|entry| entry.snapshot()).collect();
		jobs.sort_by_key(|job| job.started_at_ns);
		jobs
	}

	pub fn side_file(&self) -> Option<&Path> {
		self.side_file.as_deref()
	}
}

fn set_status(jobs: &DashMap<String, JobEntry>, key: &str, status: TransferStatus) {
	if let Some(mut entry) = jobs.get_mut(key) {
		entry.job.status = status;
	}
}

fn finish(jobs: &DashMap<String, JobEntry>, key: &str, result: Result<u64, TransferError>) -> Option<TransferJob> {
	let mut entry = jobs.get_mut(key)?;
	entry.job.bytes_sent = entry.sent.load(Ordering::Relaxed);
	match result {
		Ok(bytes) => {
			entry.job.status = TransferStatus::Complete;
			info!(target = "nodelink.transfer", session = %key, bytes, "transfer complete");
		}
		Err(err) => {
			entry.job.status = TransferStatus::Failed;
			entry.job.error = Some(err.to_string());
			warn!(target = "nodelink.transfer", session = %key, error = %err, "transfer failed");
		}
	}
	Some(entry.job.clone())
}
