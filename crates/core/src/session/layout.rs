//! On-disk session layout: `<sessions_root>/<session_id>/<recorder>/...`.

use std::path::{Path, PathBuf};

use nodelink_protocol::now_nanos;

use crate::error::SessionError;

const MAX_ID_LEN: usize = 128;

/// Accepts ids that are a single, portable path component.
pub fn validate_session_id(id: &str) -> Result<(), SessionError> {
	let reject = |reason| {
		Err(SessionError::InvalidId {
			id: id.to_string(),
			reason,
		})
	};

	if id.is_empty() {
		return reject("must not be empty");
	}
	if id.len() > MAX_ID_LEN {
		return reject("longer than 128 bytes");
	}
	if id == "." || id == ".." {
		return reject("reserved path component");
	}
	if !id.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')) {
		return reject("only letters, digits, '-', '_' and '.' are allowed");
	}
	Ok(())
}

/// Picks an unused `session_<unix_ms>` id under `root`.
pub fn generate_session_id(root: &Path) -> String {
	let base = format!("session_{}", now_nanos() / 1_000_000);
	let mut candidate = base.clone();
	let mut suffix = 1u32;
	while root.join(&candidate).exists() {
		candidate = format!("{base}_{suffix}");
		suffix += 1;
	}
	candidate
}

/// Resolves an existing session directory.
pub fn resolve_session_dir(root: &Path, id: &str) -> Result<PathBuf, SessionError> {
	validate_session_id(id)?;
	let dir = root.join(id);
	if dir.is_dir() {
		Ok(dir)
	} else {
		Err(SessionError::NotFound(id.to_string()))
	}
}

/// Creates the session root and one subdirectory per recorder.
pub async fn create_layout(session_dir: &Path, recorders: &[String]) -> Result<(), SessionError> {
	let mkdir = |path: PathBuf| async move {
		tokio::fs::create_dir_all(&path)
			.await
			.map_err(|source| SessionError::Layout { path, source })
	};

	mkdir(session_dir.to_path_buf()).await?;
	for name in recorders {
		mkdir(session_dir.join(name)).await?;
	}
	Ok(())
}
