//! Header for the file-transfer connection.

use serde::{Deserialize, Serialize};

/// First line on a transfer connection; the archive bytes follow it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferHeader {
	pub session_id: String,
	/// Stable identifier of the sending node.
	pub device_id: String,
	/// Logical name of the archive that follows.
	pub filename: String,
}

impl TransferHeader {
	pub fn new(session_id: impl Into<String>, device_id: impl Into<String>) -> Self {
		let session_id = session_id.into();
		let device_id = device_id.into();
		let filename = archive_filename(&device_id, &session_id);
		Self {
			session_id,
			device_id,
			filename,
		}
	}

	/// Serializes to a single line, newline included.
	pub fn to_line(&self) -> serde_json::Result<String> {
		let mut line = serde_json::to_string(self)?;
		line.push('\n');
		Ok(line)
	}
}

/// Name of the archive shipped for `session_id` by `device_id`.
pub fn archive_filename(device_id: &str, session_id: &str) -> String {
	format!("{device_id}_{session_id}.zip")
}
