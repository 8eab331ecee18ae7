//! Inbound commands and their decoding.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Every command name the node understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
	StartRecording,
	StopRecording,
	FlashSync,
	QueryCapabilities,
	TransferFiles,
	TimeSync,
	QueryStatus,
	/// Liveness ping from the hub. Never answered.
	Heartbeat,
}

impl CommandKind {
	pub const ALL: [CommandKind; 8] = [
		CommandKind::StartRecording,
		CommandKind::StopRecording,
		CommandKind::FlashSync,
		CommandKind::QueryCapabilities,
		CommandKind::TransferFiles,
		CommandKind::TimeSync,
		CommandKind::QueryStatus,
		CommandKind::Heartbeat,
	];

	pub fn as_str(self) -> &'static str {
		match self {
			CommandKind::StartRecording => "start_recording",
			CommandKind::StopRecording => "stop_recording",
			CommandKind::FlashSync => "flash_sync",
			CommandKind::QueryCapabilities => "query_capabilities",
			CommandKind::TransferFiles => "transfer_files",
			CommandKind::TimeSync => "time_sync",
			CommandKind::QueryStatus => "query_status",
			CommandKind::Heartbeat => "heartbeat",
		}
	}

	pub fn from_name(name: &str) -> Option<Self> {
		Self::ALL.into_iter().find(|kind| kind.as_str() == name)
	}

	/// Whether a response is expected for this command.
	pub fn expects_reply(self) -> bool {
		!matches!(self, CommandKind::Heartbeat)
	}
}

impl fmt::Display for CommandKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// A parsed command. Immutable once decoded.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
	pub kind: CommandKind,
	/// Correlation token echoed in the response; may be empty.
	pub ack_id: String,
	pub session_id: Option<String>,
	/// Every field of the original object except `command`, `ack_id` and `session_id`.
	pub payload: Map<String, Value>,
}

/// Failure to turn a line into a [`Command`].
///
/// Carries whatever `ack_id` could be recovered so the error response can
/// still be correlated.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodeError {
	pub ack_id: String,
	pub kind: DecodeErrorKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DecodeErrorKind {
	/// Not JSON, not an object, or no usable `command` field.
	Malformed(String),
	/// Well-formed, but the command name is not supported.
	UnknownCommand(String),
}

impl fmt::Display for DecodeError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match &self.kind {
			DecodeErrorKind::Malformed(detail) => write!(f, "Invalid command format: {detail}"),
			DecodeErrorKind::UnknownCommand(name) => write!(f, "Unknown command: {name}"),
		}
	}
}

impl std::error::Error for DecodeError {}

impl Command {
	/// Decodes one framed line.
	///
	/// Accepts `ack_id` as a string or number, falling back to the legacy `id`
	/// field. An object without `command` but with `"type":"heartbeat"` is a
	/// heartbeat.
	pub fn parse(line: &str) -> Result<Self, DecodeError> {
		let value: Value = serde_json::from_str(line.trim()).map_err(|err| DecodeError {
			ack_id: String::new(),
			kind: DecodeErrorKind::Malformed(err.to_string()),
		})?;

		let Value::Object(mut object) = value else {
			return Err(DecodeError {
				ack_id: String::new(),
				kind: DecodeErrorKind::Malformed("expected a JSON object".to_string()),
			});
		};

		let ack_id = take_ack_id(&mut object);
		let malformed = |detail: &str| DecodeError {
			ack_id: ack_id.clone(),
			kind: DecodeErrorKind::Malformed(detail.to_string()),
		};

		let name = match object.remove("command") {
			Some(Value::String(name)) => name,
			Some(_) => return Err(malformed("'command' must be a string")),
			None if object.get("type").and_then(Value::as_str) == Some("heartbeat") => CommandKind::Heartbeat.as_str().to_string(),
			None => return Err(malformed("missing 'command' field")),
		};

		let Some(kind) = CommandKind::from_name(&name) else {
			return Err(DecodeError {
				ack_id,
				kind: DecodeErrorKind::UnknownCommand(name),
			});
		};

		let session_id = match object.remove("session_id") {
			Some(Value::String(id)) if !id.is_empty() => Some(id),
			Some(Value::String(_)) | Some(Value::Null) | None => None,
			Some(_) => return Err(malformed("'session_id' must be a string")),
		};

		Ok(Self {
			kind,
			ack_id,
			session_id,
			payload: object,
		})
	}

	pub fn field(&self, key: &str) -> Option<&Value> {
		self.payload.get(key)
	}

	pub fn str_field(&self, key: &str) -> Option<&str> {
		self.payload.get(key).and_then(Value::as_str)
	}

	/// Reads an unsigned integer given either as a JSON number or a numeric string.
	pub fn u64_field(&self, key: &str) -> Option<u64> {
		match self.payload.get(key)? {
			Value::Number(n) => n.as_u64(),
			Value::String(s) => s.trim().parse().ok(),
			_ => None,
		}
	}
}

fn take_ack_id(object: &mut Map<String, Value>) -> String {
	let raw = object.remove("ack_id").or_else(|| object.remove("id"));
	match raw {
		Some(Value::String(s)) => s,
		Some(Value::Number(n)) => n.to_string(),
		_ => String::new(),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_parses_start_recording_with_session() {
		let cmd = Command::parse(r#"{"command":"start_recording","ack_id":"a1","session_id":"s-1"}"#).unwrap();
		assert_eq!(cmd.kind, CommandKind::StartRecording);
		assert_eq!(cmd.ack_id, "a1");
		assert_eq!(cmd.session_id.as_deref(), Some("s-1"));
		assert!(cmd.payload.is_empty());
	}

	#[test]
	fn test_numeric_and_legacy_ids_become_strings() {
		let cmd = Command::parse(r#"{"command":"flash_sync","ack_id":42}"#).unwrap();
		assert_eq!(cmd.ack_id, "42");

		let legacy = Command::parse(r#"{"v":1,"id":7,"type":"cmd","command":"query_capabilities"}"#).unwrap();
		assert_eq!(legacy.ack_id, "7");
		assert_eq!(legacy.kind, CommandKind::QueryCapabilities);
	}

	#[test]
	fn test_empty_session_id_is_absent() {
		let cmd = Command::parse(r#"{"command":"start_recording","ack_id":"","session_id":""}"#).unwrap();
		assert_eq!(cmd.session_id, None);
	}

	#[test]
	fn test_unknown_command_keeps_ack_id() {
		let err = Command::parse(r#"{"command":"bogus","ack_id":"7"}"#).unwrap_err();
		assert_eq!(err.ack_id, "7");
		assert_eq!(err.kind, DecodeErrorKind::UnknownCommand("bogus".to_string()));
		assert_eq!(err.to_string(), "Unknown command: bogus");
	}

	#[test]
	fn test_non_json_is_malformed_with_empty_ack_id() {
		let err = Command::parse("this is not json").unwrap_err();
		assert_eq!(err.ack_id, "");
		assert!(err.to_string().starts_with("Invalid command format: "));
	}

	#[test]
	fn test_missing_command_recovers_ack_id() {
		let err = Command::parse(r#"{"ack_id":"9"}"#).unwrap_err();
		assert_eq!(err.ack_id, "9");
		assert!(matches!(err.kind, DecodeErrorKind::Malformed(_)));
	}

	#[test]
	fn test_array_is_malformed() {
		let err = Command::parse("[1,2,3]").unwrap_err();
		assert!(matches!(err.kind, DecodeErrorKind::Malformed(_)));
	}

	#[test]
	fn test_heartbeat_envelope_is_a_command() {
		let cmd = Command::parse(r#"{"v":"2.0","type":"heartbeat","timestamp":1}"#).unwrap();
		assert_eq!(cmd.kind, CommandKind::Heartbeat);
		assert!(!cmd.kind.expects_reply());
	}

	#[test]
	fn test_field_accessors_accept_strings_and_numbers() {
		let cmd = Command::parse(r#"{"command":"transfer_files","host":"10.0.0.2","port":"8082","t0":5}"#).unwrap();
		assert_eq!(cmd.str_field("host"), Some("10.0.0.2"));
		assert_eq!(cmd.u64_field("port"), Some(8082));
		assert_eq!(cmd.u64_field("t0"), Some(5));
		assert_eq!(cmd.u64_field("missing"), None);
	}

	#[test]
	fn test_kind_names_round_trip() {
		for kind in CommandKind::ALL {
			assert_eq!(CommandKind::from_name(kind.as_str()), Some(kind));
		}
	}
}
