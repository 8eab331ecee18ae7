use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use nodelink::runtime::RemoteEndpoint;

#[derive(Parser, Debug)]
#[command(name = "nodelink")]
#[command(about = "Sensor node controller: records sessions and ships them to a hub")]
#[command(version)]
pub struct Cli {
	/// Increase verbosity (-v info, -vv debug)
	#[arg(short, long, global = true, action = clap::ArgAction::Count)]
	pub verbose: u8,

	/// Config file (defaults to $XDG_CONFIG_HOME/nodelink/config.json)
	#[arg(short, long, global = true, value_name = "FILE")]
	pub config: Option<PathBuf>,

	#[command(subcommand)]
	pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
	/// Run the node until Ctrl+C or SIGTERM
	Run(RunArgs),

	/// List hubs advertising on the local network
	Discover(DiscoverArgs),

	/// Inspect configuration
	Config {
		#[command(subcommand)]
		action: ConfigAction,
	},
}

#[derive(Args, Debug, Default, Clone)]
pub struct RunArgs {
	/// Hub to connect to; disables hub discovery
	#[arg(long, value_name = "HOST:PORT", value_parser = parse_endpoint)]
	pub hub: Option<RemoteEndpoint>,

	/// Identifier reported to the hub
	#[arg(long, value_name = "ID")]
	pub device_id: Option<String>,

	/// Root directory for sessions and the flash-sync log
	#[arg(long, value_name = "DIR")]
	pub data_dir: Option<PathBuf>,

	/// Do not advertise this node over mDNS
	#[arg(long)]
	pub no_advertise: bool,

	/// Register a metadata recorder under NAME (repeatable)
	#[arg(long = "recorder", value_name = "NAME")]
	pub recorders: Vec<String>,
}

#[derive(Args, Debug, Clone)]
pub struct DiscoverArgs {
	/// How long to browse before printing results
	#[arg(long, value_name = "N", default_value_t = 3000)]
	pub timeout_ms: u64,

	/// Service type to browse for (defaults to the configured hub type)
	#[arg(long, value_name = "TYPE")]
	pub service_type: Option<String>,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigAction {
	/// Print the effective configuration as JSON
	Show,
	/// Print the config file path that would be used
	Path,
}

fn parse_endpoint(value: &str) -> Result<RemoteEndpoint, String> {
	value.parse::<RemoteEndpoint>().map_err(|err| err.to_string())
}
