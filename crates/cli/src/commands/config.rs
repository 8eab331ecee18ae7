use std::path::Path;

use crate::cli::ConfigAction;
use crate::config::{NodeConfig, resolve_config_path};
use crate::error::{CliError, Result};

pub fn execute(action: ConfigAction, explicit: Option<&Path>) -> Result<()> {
	match action {
		ConfigAction::Show => {
			let (config, _) = NodeConfig::load(explicit)?;
			println!("{}", serde_json::to_string_pretty(&config.effective())?);
		}
		ConfigAction::Path => {
			let path = resolve_config_path(explicit)
				.ok_or_else(|| CliError::InvalidConfig("no config directory on this platform".into()))?;
			println!("{}", path.display());
		}
	}
	Ok(())
}
