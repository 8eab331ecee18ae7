//! Recording state machine across all registered recorders.
//!
//! ```text
//! IDLE --start--> PREPARING --(all ready)--> RECORDING --stop--> STOPPING --> IDLE
//!                     any non-idle state --fault--> ERROR --stop/reset--> IDLE
//! ```
//!
//! The state lock is only held for transitions, never across a recorder
//! call. A start while PREPARING is rejected at once, and a stop while
//! PREPARING cancels the start and waits for its rollback. The published
//! [`SessionSnapshot`] can be read at any time.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use nodelink_protocol::now_nanos;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::SessionError;
use crate::recorder::SensorRecorder;

pub mod layout;
#[cfg(test)]
mod tests;

pub use layout::{resolve_session_dir, validate_session_id};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
	Idle,
	Preparing,
	Recording,
	Stopping,
	Error,
}

impl SessionStatus {
	/// Preparing or recording: a start request must be rejected.
	pub fn is_active(self) -> bool {
		matches!(self, SessionStatus::Preparing | SessionStatus::Recording)
	}
}

/// Read-only view of the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSnapshot {
	pub status: SessionStatus,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub session_id: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub directory: Option<PathBuf>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub started_at_ns: Option<u64>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub last_error: Option<String>,
	pub sensors: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecorderFailure {
	pub recorder: String,
	pub error: String,
}

/// Result of a stop: the session that ended and any recorder that did not stop cleanly.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StopOutcome {
	pub session_id: Option<String>,
	pub failures: Vec<RecorderFailure>,
}

impl StopOutcome {
	pub fn is_clean(&self) -> bool {
		self.failures.is_empty()
	}
}

struct ActiveSession {
	id: String,
	directory: PathBuf,
	started_at_ns: u64,
}

struct State {
	status: SessionStatus,
	recorders: Vec<(String, Arc<dyn SensorRecorder>)>,
	active: Option<ActiveSession>,
	last_error: Option<String>,
	/// Set while PREPARING; flipping it to true cancels the start.
	cancel: Option<watch::Sender<bool>>,
	/// Stop failures of the last cancelled start, handed to the stop that cancelled it.
	rollback: Vec<RecorderFailure>,
}

type Recorders = Vec<(String, Arc<dyn SensorRecorder>)>;

enum StopPlan {
	Idle,
	Recorders(Option<String>, Recorders),
	AwaitRollback(Option<String>, watch::Receiver<SessionStatus>),
	AwaitStop(Option<String>, watch::Receiver<SessionStatus>),
}

/// Owns the recorder registry and the single active session.
pub struct SessionOrchestrator {
	root: PathBuf,
	start_timeout: Duration,
	stop_timeout: Duration,
	state: Mutex<State>,
	snapshot: Mutex<SessionSnapshot>,
	status_tx: watch::Sender<SessionStatus>,
	last_session: Mutex<Option<String>>,
}

impl SessionOrchestrator {
	pub const DEFAULT_START_TIMEOUT: Duration = Duration::from_secs(10);

	/// Creates an idle orchestrator writing sessions under `sessions_root`.
	pub fn new(sessions_root: impl Into<PathBuf>, stop_timeout: Duration) -> Self {
		let (status_tx, _) = watch::channel(SessionStatus::Idle);
		Self {
			root: sessions_root.into(),
			start_timeout: Self::DEFAULT_START_TIMEOUT,
			stop_timeout,
			state: Mutex::new(State {
				status: SessionStatus::Idle,
				recorders: Vec::new(),
				active: None,
				last_error: None,
				cancel: None,
				rollback: Vec::new(),
			}),
			snapshot: Mutex::new(SessionSnapshot {
				status: SessionStatus::Idle,
				session_id: None,
				directory: None,
				started_at_ns: None,
				last_error: None,
				sensors: Vec::new(),
			}),
			status_tx,
			last_session: Mutex::new(None),
		}
	}

	/// Bounds each recorder's `start` call.
	pub fn with_start_timeout(mut self, timeout: Duration) -> Self {
		self.start_timeout = timeout;
		self
	}

	pub fn sessions_root(&self) -> &Path {
		&self.root
	}

	/// Adds or replaces a recorder. Only allowed while idle.
	pub async fn register(&self, name: impl Into<String>, recorder: Arc<dyn SensorRecorder>) -> Result<(), SessionError> {
		let name = name.into();
		validate_session_id(&name).map_err(|_| SessionError::InvalidId {
			id: name.clone(),
			reason: "recorder names must be a single path component",
		})?;

		let mut state = self.state.lock();
		if state.status != SessionStatus::Idle {
			return Err(SessionError::NotIdle);
		}
		match state.recorders.iter_mut().find(|(existing, _)| *existing == name) {
			Some(slot) => {
				debug!(target = "nodelink.session", recorder = %name, "replacing recorder");
				slot.1 = recorder;
			}
			None => {
				debug!(target = "nodelink.session", recorder = %name, "registering recorder");
				state.recorders.push((name, recorder));
			}
		}
		self.publish(&state);
		Ok(())
	}

	/// Removes a recorder. Only allowed while idle. Returns whether it existed.
	pub async fn unregister(&self, name: &str) -> Result<bool, SessionError> {
		let mut state = self.state.lock();
		if state.status != SessionStatus::Idle {
			return Err(SessionError::NotIdle);
		}
		let before = state.recorders.len();
		state.recorders.retain(|(existing, _)| existing != name);
		let removed = state.recorders.len() != before;
		self.publish(&state);
		Ok(removed)
	}

	/// Starts a session on every recorder in registration order.
	///
	/// If the start does not complete, the recorders already started are
	/// stopped and the orchestrator returns to idle.
	pub async fn start_session(&self, session_id: Option<String>) -> Result<String, SessionError> {
		let (id, directory, recorders, mut cancel_rx) = {
			let mut state = self.state.lock();
			if state.status != SessionStatus::Idle {
				return Err(SessionError::AlreadyActive);
			}

			let id = match session_id {
				Some(id) => {
					validate_session_id(&id)?;
					id
				}
				None => layout::generate_session_id(&self.root),
			};
			let directory = self.root.join(&id);
			let (cancel_tx, cancel_rx) = watch::channel(false);

			state.status = SessionStatus::Preparing;
			state.last_error = None;
			state.cancel = Some(cancel_tx);
			state.rollback.clear();
			state.active = Some(ActiveSession {
				id: id.clone(),
				directory: directory.clone(),
				started_at_ns: now_nanos(),
			});
			self.publish(&state);
			info!(target = "nodelink.session", session = %id, recorders = state.recorders.len(), "starting session");
			(id, directory, state.recorders.clone(), cancel_rx)
		};

		let names: Vec<String> = recorders.iter().map(|(name, _)| name.clone()).collect();
		if let Err(err) = layout::create_layout(&directory, &names).await {
			warn!(target = "nodelink.session", session = %id, error = %err, "session layout failed");
			return Err(self.abort_start(&id, &[], err).await);
		}

		let mut started: Recorders = Vec::with_capacity(recorders.len());
		for (name, recorder) in &recorders {
			let recorder_dir = directory.join(name);
			let attempt = tokio::select! {
				biased;
				_ = cancelled(&mut cancel_rx) => None,
				result = tokio::time::timeout(self.start_timeout, recorder.start(&recorder_dir)) => Some(result),
			};
			let reason = match attempt {
				Some(Ok(Ok(()))) => {
					debug!(target = "nodelink.session", session = %id, recorder = %name, "recorder started");
					started.push((name.clone(), recorder.clone()));
					continue;
				}
				Some(Ok(Err(err))) => err.to_string(),
				Some(Err(_)) => {
					// A recorder that never answered may be half started.
					started.push((name.clone(), recorder.clone()));
					format!("start timed out after {}ms", self.start_timeout.as_millis())
				}
				None => {
					info!(target = "nodelink.session", session = %id, recorder = %name, "session start cancelled");
					started.push((name.clone(), recorder.clone()));
					return Err(self.abort_start(&id, &started, SessionError::Cancelled).await);
				}
			};
			warn!(
				target = "nodelink.session",
				session = %id,
				recorder = %name,
				error = %reason,
				"recorder failed to start; rolling back"
			);
			let err = SessionError::StartFailed {
				name: name.clone(),
				reason,
			};
			return Err(self.abort_start(&id, &started, err).await);
		}

		{
			let mut state = self.state.lock();
			if state.status == SessionStatus::Preparing {
				state.status = SessionStatus::Recording;
				state.cancel = None;
				*self.last_session.lock() = Some(id.clone());
				self.publish(&state);
				info!(target = "nodelink.session", session = %id, "recording");
				return Ok(id);
			}
		}
		// A stop or fault arrived after the last recorder started.
		Err(self.abort_start(&id, &started, SessionError::Cancelled).await)
	}

	/// Stops the active session. A no-op success when idle.
	///
	/// Every recorder is stopped in registration order even if earlier ones
	/// fail or time out; the failures are returned in the outcome. A stop
	/// while preparing cancels the start and reports its rollback.
	pub async fn stop_session(&self) -> StopOutcome {
		let plan = {
			let mut state = self.state.lock();
			let session_id = state.active.as_ref().map(|active| active.id.clone());
			match state.status {
				SessionStatus::Idle => StopPlan::Idle,
				SessionStatus::Stopping => StopPlan::AwaitStop(session_id, self.status_tx.subscribe()),
				SessionStatus::Preparing => {
					state.status = SessionStatus::Stopping;
					if let Some(cancel) = &state.cancel {
						cancel.send_replace(true);
					}
					let status = self.status_tx.subscribe();
					self.publish(&state);
					StopPlan::AwaitRollback(session_id, status)
				}
				SessionStatus::Recording | SessionStatus::Error => {
					state.status = SessionStatus::Stopping;
					self.publish(&state);
					StopPlan::Recorders(session_id, state.recorders.clone())
				}
			}
		};

		match plan {
			StopPlan::Idle => StopOutcome::default(),
			StopPlan::AwaitStop(session_id, mut status) => {
				wait_for_idle(&mut status).await;
				StopOutcome {
					session_id,
					failures: Vec::new(),
				}
			}
			StopPlan::AwaitRollback(session_id, mut status) => {
				info!(target = "nodelink.session", session = ?session_id, "cancelling session start");
				wait_for_idle(&mut status).await;
				let failures = std::mem::take(&mut self.state.lock().rollback);
				StopOutcome { session_id, failures }
			}
			StopPlan::Recorders(session_id, recorders) => {
				info!(target = "nodelink.session", session = ?session_id, "stopping session");
				let failures = self.stop_all(&recorders).await;
				for failure in &failures {
					warn!(
						target = "nodelink.session",
						recorder = %failure.recorder,
						error = %failure.error,
						"recorder did not stop cleanly"
					);
				}
				self.return_to_idle(&mut self.state.lock());
				info!(target = "nodelink.session", session = ?session_id, failures = failures.len(), "session stopped");
				StopOutcome { session_id, failures }
			}
		}
	}

	/// Leaves the error state by force-stopping every recorder.
	pub async fn reset(&self) -> StopOutcome {
		self.stop_session().await
	}

	/// Moves an active session to the error state, e.g. when a recorder
	/// reports a fault mid-session. A fault while preparing aborts the
	/// start. Ignored when idle or already stopping.
	pub async fn fail_session(&self, reason: impl Into<String>) {
		let reason = reason.into();
		let mut state = self.state.lock();
		if matches!(state.status, SessionStatus::Idle | SessionStatus::Stopping) {
			return;
		}
		warn!(target = "nodelink.session", %reason, "session entered error state");
		if let Some(cancel) = &state.cancel {
			cancel.send_replace(true);
		}
		state.status = SessionStatus::Error;
		state.last_error = Some(reason);
		self.publish(&state);
	}

	pub fn status(&self) -> SessionSnapshot {
		self.snapshot.lock().clone()
	}

	pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
		self.status_tx.subscribe()
	}

	/// Registered recorder names in registration order.
	pub fn registered_sensors(&self) -> Vec<String> {
		self.snapshot.lock().sensors.clone()
	}

	/// Directory of an existing session under the sessions root.
	pub fn session_dir(&self, session_id: &str) -> Result<PathBuf, SessionError> {
		resolve_session_dir(&self.root, session_id)
	}

	/// The most recent session that reached the recording state.
	pub fn last_session_id(&self) -> Option<String> {
		self.last_session.lock().clone()
	}

	/// Rolls back a failed or cancelled start. A fault raised meanwhile
	/// keeps the session in ERROR until reset.
	async fn abort_start(&self, id: &str, started: &[(String, Arc<dyn SensorRecorder>)], err: SessionError) -> SessionError {
		let failures = self.stop_all(started).await;
		for failure in &failures {
			warn!(
				target = "nodelink.session",
				session = %id,
				recorder = %failure.recorder,
				error = %failure.error,
				"rollback stop failed"
			);
		}

		let mut state = self.state.lock();
		state.cancel = None;
		if state.status == SessionStatus::Error {
			return err;
		}
		state.rollback = failures;
		self.return_to_idle(&mut state);
		err
	}

	async fn stop_all(&self, recorders: &[(String, Arc<dyn SensorRecorder>)]) -> Vec<RecorderFailure> {
		let mut failures = Vec::new();
		for (name, recorder) in recorders {
			let error = match tokio::time::timeout(self.stop_timeout, recorder.stop()).await {
				Ok(Ok(())) => {
					debug!(target = "nodelink.session", recorder = %name, "recorder stopped");
					continue;
				}
				Ok(Err(err)) => err.to_string(),
				Err(_) => format!("stop timed out after {}ms", self.stop_timeout.as_millis()),
			};
			failures.push(RecorderFailure {
				recorder: name.clone(),
				error,
			});
		}
		failures
	}

	fn return_to_idle(&self, state: &mut State) {
		state.status = SessionStatus::Idle;
		state.active = None;
		state.cancel = None;
		self.publish(state);
	}

	fn publish(&self, state: &State) {
		let snapshot = SessionSnapshot {
			status: state.status,
			session_id: state.active.as_ref().map(|a| a.id.clone()),
			directory: state.active.as_ref().map(|a| a.directory.clone()),
			started_at_ns: state.active.as_ref().map(|a| a.started_at_ns),
			last_error: state.last_error.clone(),
			sensors: state.recorders.iter().map(|(name, _)| name.clone()).collect(),
		};
		*self.snapshot.lock() = snapshot;
		self.status_tx.send_replace(state.status);
	}
}

/// Resolves once the flag is raised. Never resolves if the sender is gone.
async fn cancelled(rx: &mut watch::Receiver<bool>) {
	while !*rx.borrow_and_update() {
		if rx.changed().await.is_err() {
			std::future::pending::<()>().await;
		}
	}
}

async fn wait_for_idle(status: &mut watch::Receiver<SessionStatus>) {
	while *status.borrow_and_update() != SessionStatus::Idle {
		if status.changed().await.is_err() {
			return;
		}
	}
}
