use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, CliError>;

#[derive(Debug, Error)]
pub enum CliError {
	#[error("config file not found: {}", path.display())]
	ConfigNotFound { path: PathBuf },

	#[error("failed to read config file {}", path.display())]
	ConfigRead {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},

	#[error("invalid config file {}", path.display())]
	ConfigParse {
		path: PathBuf,
		#[source]
		source: serde_json::Error,
	},

	#[error("invalid configuration: {0}")]
	InvalidConfig(String),

	#[error(transparent)]
	Node(#[from] nodelink::Error),

	#[error(transparent)]
	Runtime(#[from] nodelink::runtime::Error),

	#[error(transparent)]
	Io(#[from] std::io::Error),

	#[error(transparent)]
	Json(#[from] serde_json::Error),

	#[error(transparent)]
	Anyhow(#[from] anyhow::Error),
}
