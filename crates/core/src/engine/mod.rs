//! Command decoding and dispatch.
//!
//! Every decoded or undecodable line yields exactly one [`Response`] with the
//! command's `ack_id`, except heartbeats, which yield none. Long-running
//! effects (transfers) are launched and acknowledged immediately.

use std::sync::Arc;

use nodelink_protocol::{Command, CommandKind, Response, now_nanos};
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::error::{Error, Result, SessionError};
use crate::flash_log::{FlashEvent, FlashLog};
use crate::session::SessionOrchestrator;
use crate::transfer::TransferService;


/// Maps commands onto the orchestrator, transfer service, and flash log.
pub struct Engine {
	device_id: String,
	sessions: Arc<SessionOrchestrator>,
	transfers: Arc<TransferService>,
	flash: Arc<FlashLog>,
}

impl Engine {
	pub fn new(device_id: impl Into<String>, sessions: Arc<SessionOrchestrator>, transfers: Arc<TransferService>, flash: Arc<FlashLog>) -> Self {
		Self {
			device_id: device_id.into(),
			sessions,
			transfers,
			flash,
		}
	}

	pub fn device_id(&self) -> &str {
		&self.device_id
	}

	pub fn sessions(&self) -> &Arc<SessionOrchestrator> {
		&self.sessions
	}

	pub fn transfers(&self) -> &Arc<TransferService> {
		&self.transfers
	}

	pub fn flash_log(&self) -> &Arc<FlashLog> {
		&self.flash
	}

	/// Decodes and dispatches one inbound line.
	pub async fn handle_line(&self, line: &str) -> Option<Response> {
		let received_ns = now_nanos();
		match Command::parse(line) {
			Ok(command) => self.dispatch(command, received_ns).await,
			Err(err) => {
				warn!(target = "nodelink.engine", ack_id = %err.ack_id, error = %err, "rejected command");
				Some(Response::error(err.ack_id.clone(), err.to_string()))
			}
		}
	}

	/// Runs a decoded command. `received_ns` is when its line arrived.
	pub async fn dispatch(&self, command: Command, received_ns: u64) -> Option<Response> {
		if !command.kind.expects_reply() {
			debug!(target = "nodelink.engine", command = %command.kind, "no reply expected");
			return None;
		}

		debug!(target = "nodelink.engine", command = %command.kind, ack_id = %command.ack_id, "dispatching");
		let ack_id = command.ack_id.clone();
		let result = match command.kind {
			CommandKind::StartRecording => self.start_recording(&command).await,
			CommandKind::StopRecording => self.stop_recording(&command).await,
			CommandKind::FlashSync => self.flash_sync(&command).await,
			CommandKind::QueryCapabilities => Ok(Response::ok(&ack_id, "Capabilities").with_field("capabilities", self.capabilities())),
			CommandKind::TransferFiles => self.transfer_files(&command),
			CommandKind::TimeSync => Ok(self.time_sync(&command, received_ns)),
			CommandKind::QueryStatus => self.query_status(&command),
			CommandKind::Heartbeat => return None,
		};

		Some(result.unwrap_or_else(|err| {
			warn!(target = "nodelink.engine", command = %command.kind, ack_id = %ack_id, error = %err, "command failed");
			Response::error(ack_id, err.to_string())
		}))
	}

	/// Registered sensors and the supported command set.
	pub fn capabilities(&self) -> Value {
		let commands: Vec<&str> = CommandKind::ALL
			.iter()
			.filter(|kind| kind.expects_reply())
			.map(|kind| kind.as_str())
			.collect();
		json!({
			"device_id": self.device_id,
			"sensors": self.sessions.registered_sensors(),
			"commands": commands,
			"time_sync": true,
		})
	}

	async fn start_recording(&self, command: &Command) -> Result<Response> {
		let session_id = self.sessions.start_session(command.session_id.clone()).await.map_err(|err| match err {
			SessionError::InvalidId { .. } => Error::InvalidParams(err.to_string()),
			other => Error::Session(other),
		})?;
		info!(target = "nodelink.engine", session = %session_id, "recording started");
		Ok(Response::ok(&command.ack_id, "Recording started").with_field("session_id", session_id))
	}

	async fn stop_recording(&self, command: &Command) -> Result<Response> {
		let outcome = self.sessions.stop_session().await;
		let message = if outcome.is_clean() {
			"Recording stopped".to_string()
		} else {
			format!("Recording stopped with {} recorder error(s)", outcome.failures.len())
		};

		let mut response = Response::ok(&command.ack_id, message);
		if let Some(session_id) = outcome.session_id.clone() {
			response = response.with_field("session_id", session_id);
		}
		if !outcome.is_clean() {
			response = response.with_field("failures", serde_json::to_value(&outcome.failures)?);
		}
		Ok(response)
	}

	async fn flash_sync(&self, command: &Command) -> Result<Response> {
		let timestamp_ns = now_nanos();
		let session_id = self.sessions.status().session_id;
		let event = FlashEvent { timestamp_ns, session_id };
		if let Err(err) = self.flash.record(event).await {
			warn!(target = "nodelink.engine", error = %err, "flash sync not persisted");
		}
		Ok(Response::ok(&command.ack_id, "Flash sync recorded").with_timestamp(timestamp_ns))
	}

	fn transfer_files(&self, command: &Command) -> Result<Response> {
		let host = command
			.str_field("host")
			.map(str::trim)
			.filter(|host| !host.is_empty())
			.ok_or_else(|| Error::InvalidParams("missing 'host'".into()))?;
		let port = match command.field("port") {
			None => return Err(Error::InvalidParams("missing 'port'".into())),
			Some(_) => command
				.u64_field("port")
				.and_then(|port| u16::try_from(port).ok())
				.filter(|port| *port != 0)
				.ok_or_else(|| Error::InvalidParams("'port' must be an integer in 1..=65535".into()))?,
		};
		let session_id = command
			.session_id
			.as_deref()
			.ok_or_else(|| Error::InvalidParams("missing 'session_id'".into()))?;

		let snapshot = self.sessions.status();
		if snapshot.status.is_active() && snapshot.session_id.as_deref() == Some(session_id) {
			warn!(target = "nodelink.engine", session = %session_id, "transferring a session that is still recording");
		}

		let ack_id = Some(command.ack_id.clone()).filter(|id| !id.is_empty());
		let job = self.transfers.transfer(session_id, host, port, ack_id)?;
		Ok(Response::ok(&command.ack_id, "Transfer started")
			.with_field("session_id", job.session_id)
			.with_field("filename", job.filename))
	}

	fn time_sync(&self, command: &Command, received_ns: u64) -> Response {
		let mut response = Response::ok(&command.ack_id, "Time sync").with_field("t1", received_ns);
		if let Some(t0) = command.u64_field("t0") {
			response = response.with_field("t0", t0);
		}
		let t2 = now_nanos();
		response.with_field("t2", t2).with_timestamp(t2)
	}

	fn query_status(&self, command: &Command) -> Result<Response> {
		Ok(Response::ok(&command.ack_id, "Status")
			.with_field("device_id", self.device_id.clone())
			.with_field("session", serde_json::to_value(self.sessions.status())?)
			.with_field("transfers", serde_json::to_value(self.transfers.jobs())?))
	}
}
