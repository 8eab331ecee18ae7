mod config;
mod discover;
mod run;

use crate::cli::{Cli, Commands};
use crate::error::Result;

pub async fn dispatch(cli: Cli) -> Result<()> {
	let config_path = cli.config.as_deref();
	match cli.command {
		Commands::Run(args) => run::execute(args, config_path).await,
		Commands::Discover(args) => discover::execute(args, config_path).await,
		Commands::Config { action } => config::execute(action, config_path),
	}
}
