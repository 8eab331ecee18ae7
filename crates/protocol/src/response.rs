//! Command responses.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::clock::now_nanos;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
	Ok,
	Error,
}

/// Reply to exactly one command, correlated by `ack_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
	pub ack_id: String,
	pub status: Status,
	/// Nanoseconds from [`now_nanos`] when the response was built.
	pub timestamp: u64,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub message: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub error: Option<String>,
	/// Command-specific result fields, flattened into the top-level object.
	#[serde(flatten)]
	pub extra: Map<String, Value>,
}

impl Response {
	pub fn ok(ack_id: impl Into<String>, message: impl Into<String>) -> Self {
		Self {
			ack_id: ack_id.into(),
			status: Status::Ok,
			timestamp: now_nanos(),
			message: Some(message.into()),
			error: None,
			extra: Map::new(),
		}
	}

	pub fn error(ack_id: impl Into<String>, error: impl Into<String>) -> Self {
		Self {
			ack_id: ack_id.into(),
			status: Status::Error,
			timestamp: now_nanos(),
			message: None,
			error: Some(error.into()),
			extra: Map::new(),
		}
	}

	/// Adds a result field. Reserved keys are left untouched.
	pub fn with_field(mut self, key: &str, value: impl Into<Value>) -> Self {
		if !matches!(key, "ack_id" | "status" | "timestamp" | "message" | "error") {
			self.extra.insert(key.to_string(), value.into());
		}
		self
	}

	/// Overrides the response timestamp, e.g. with the instant a flash sync was captured.
	pub fn with_timestamp(mut self, nanos: u64) -> Self {
		self.timestamp = nanos;
		self
	}

	pub fn is_ok(&self) -> bool {
		self.status == Status::Ok
	}

	/// Serializes to a single line without the trailing newline.
	pub fn to_line(&self) -> serde_json::Result<String> {
		serde_json::to_string(self)
	}
}
