//! Node-initiated messages on the command connection.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::clock::now_nanos;
use crate::response::Status;

/// Version tag carried in the `v` field of every envelope.
pub const PROTOCOL_VERSION: &str = "2.0";

/// Messages the node sends without being asked.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope {
	/// Keep-alive; the hub does not reply.
	Heartbeat { v: String, timestamp: u64 },
	/// Asynchronous status push for an earlier command, e.g. a finished transfer.
	Ack {
		v: String,
		status: Status,
		ack_message_id: String,
		#[serde(default)]
		data: Value,
	},
	/// Command issued by the node to the hub. Only `rejoin_session` is used.
	Cmd {
		v: String,
		command: String,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		session_id: Option<String>,
		device_id: String,
		recording: bool,
		timestamp: u64,
	},
}

impl Envelope {
	pub fn heartbeat() -> Self {
		Envelope::Heartbeat {
			v: PROTOCOL_VERSION.to_string(),
			timestamp: now_nanos(),
		}
	}

	pub fn ack(ack_message_id: impl Into<String>, status: Status, data: Value) -> Self {
		Envelope::Ack {
			v: PROTOCOL_VERSION.to_string(),
			status,
			ack_message_id: ack_message_id.into(),
			data,
		}
	}

	/// Tells the hub which session this node holds after a (re)connect.
	pub fn rejoin(session_id: Option<String>, device_id: impl Into<String>, recording: bool) -> Self {
		Envelope::Cmd {
			v: PROTOCOL_VERSION.to_string(),
			command: "rejoin_session".to_string(),
			session_id,
			device_id: device_id.into(),
			recording,
			timestamp: now_nanos(),
		}
	}

	pub fn to_line(&self) -> serde_json::Result<String> {
		serde_json::to_string(self)
	}
}
