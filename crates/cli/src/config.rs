//! `config.json` handling.
//!
//! Resolution order for the file is `--config`, then
//! `$XDG_CONFIG_HOME/nodelink/config.json`, then built-in defaults. Flags
//! given to `nodelink run` override whatever the file says.

use std::path::{Path, PathBuf};
use std::time::Duration;

use nodelink::NodeOptions;
use nodelink::TransferTimeouts;
use nodelink::protocol::{DEFAULT_HUB_SERVICE_TYPE, DEFAULT_SERVICE_TYPE};
use nodelink::runtime::{ConnectionConfig, RemoteEndpoint, RetryPolicy};
use serde::{Deserialize, Serialize};

use crate::cli::RunArgs;
use crate::error::{CliError, Result};

const CONFIG_DIR: &str = "nodelink";
const CONFIG_FILE: &str = "config.json";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NodeConfig {
	#[serde(skip_serializing_if = "Option::is_none")]
	pub device_id: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub data_dir: Option<PathBuf>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub hub: Option<HubConfig>,
	pub service: ServiceConfig,
	pub connection: ConnectionSettings,
	pub session: SessionSettings,
	pub transfer: TransferSettings,
	/// Names of metadata recorders to register at startup.
	#[serde(skip_serializing_if = "Vec::is_empty")]
	pub recorders: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HubConfig {
	pub host: String,
	pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServiceConfig {
	#[serde(rename = "type")]
	pub service_type: String,
	/// Service type browsed for hubs.
	#[serde(rename = "hubType")]
	pub hub_service_type: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub name: Option<String>,
	pub port: u16,
	pub advertise: bool,
	/// Browse for a hub when none is configured.
	pub discover: bool,
}

impl Default for ServiceConfig {
	fn default() -> Self {
		Self {
			service_type: DEFAULT_SERVICE_TYPE.to_string(),
			hub_service_type: DEFAULT_HUB_SERVICE_TYPE.to_string(),
			name: None,
			port: 8080,
			advertise: true,
			discover: true,
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConnectionSettings {
	pub connect_timeout_ms: u64,
	pub read_timeout_ms: u64,
	pub health_check_interval_ms: u64,
	pub auto_reconnect: bool,
	pub max_attempts: u32,
	pub base_delay_ms: u64,
}

impl Default for ConnectionSettings {
	fn default() -> Self {
		let defaults = ConnectionConfig::default();
		Self {
			connect_timeout_ms: millis(defaults.connect_timeout),
			read_timeout_ms: millis(defaults.read_timeout),
			health_check_interval_ms: millis(defaults.health_check_interval),
			auto_reconnect: defaults.auto_reconnect,
			max_attempts: defaults.retry.max_attempts,
			base_delay_ms: millis(defaults.retry.base_delay),
		}
	}
}

impl From<&ConnectionSettings> for ConnectionConfig {
	fn from(settings: &ConnectionSettings) -> Self {
		Self {
			connect_timeout: Duration::from_millis(settings.connect_timeout_ms),
			read_timeout: Duration::from_millis(settings.read_timeout_ms),
			health_check_interval: Duration::from_millis(settings.health_check_interval_ms),
			auto_reconnect: settings.auto_reconnect,
			retry: RetryPolicy::new(Duration::from_millis(settings.base_delay_ms), settings.max_attempts),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionSettings {
	pub recorder_start_timeout_ms: u64,
	pub recorder_stop_timeout_ms: u64,
}

impl Default for SessionSettings {
	fn default() -> Self {
		Self {
			recorder_start_timeout_ms: 10_000,
			recorder_stop_timeout_ms: 5_000,
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TransferSettings {
	pub connect_timeout_ms: u64,
	pub io_timeout_ms: u64,
}

impl Default for TransferSettings {
	fn default() -> Self {
		let defaults = TransferTimeouts::default();
		Self {
			connect_timeout_ms: millis(defaults.connect),
			io_timeout_ms: millis(defaults.io),
		}
	}
}

/// `$XDG_CONFIG_HOME/nodelink/config.json`, or the platform equivalent.
pub fn default_config_path() -> Option<PathBuf> {
	dirs::config_dir().map(|dir| dir.join(CONFIG_DIR).join(CONFIG_FILE))
}

/// The file that [`NodeConfig::load`] would read, if any.
pub fn resolve_config_path(explicit: Option<&Path>) -> Option<PathBuf> {
	match explicit {
		Some(path) => Some(path.to_path_buf()),
		None => default_config_path(),
	}
}

impl NodeConfig {
	/// Loads the config file. An explicit path must exist; the default
	/// location is optional. Returns the path actually read.
	pub fn load(explicit: Option<&Path>) -> Result<(Self, Option<PathBuf>)> {
		if let Some(path) = explicit {
			if !path.is_file() {
				return Err(CliError::ConfigNotFound { path: path.to_path_buf() });
			}
			return Ok((Self::read(path)?, Some(path.to_path_buf())));
		}

		match default_config_path() {
			Some(path) if path.is_file() => Ok((Self::read(&path)?, Some(path))),
			_ => Ok((Self::default(), None)),
		}
	}

	pub fn read(path: &Path) -> Result<Self> {
		let contents = std::fs::read_to_string(path).map_err(|source| CliError::ConfigRead {
			path: path.to_path_buf(),
			source,
		})?;
		serde_json::from_str(&contents).map_err(|source| CliError::ConfigParse {
			path: path.to_path_buf(),
			source,
		})
	}

	/// Flags win over file values. Recorder names are merged.
	pub fn apply_run_args(&mut self, args: &RunArgs) {
		if let Some(hub) = &args.hub {
			self.hub = Some(HubConfig {
				host: hub.host.clone(),
				port: hub.port,
			});
		}
		if let Some(device_id) = &args.device_id {
			self.device_id = Some(device_id.clone());
		}
		if let Some(data_dir) = &args.data_dir {
			self.data_dir = Some(data_dir.clone());
		}
		if args.no_advertise {
			self.service.advertise = false;
		}
		for name in &args.recorders {
			if !self.recorders.contains(name) {
				self.recorders.push(name.clone());
			}
		}
	}

	pub fn resolved_device_id(&self) -> String {
		self.device_id
			.clone()
			.filter(|id| !id.trim().is_empty())
			.unwrap_or_else(default_device_id)
	}

	pub fn resolved_data_dir(&self) -> PathBuf {
		self.data_dir.clone().unwrap_or_else(|| {
			dirs::data_dir()
				.map(|dir| dir.join(CONFIG_DIR))
				.unwrap_or_else(|| PathBuf::from("nodelink-data"))
		})
	}

	/// Fills every defaulted field so `config show` prints what the node
	/// will actually use.
	pub fn effective(&self) -> Self {
		let mut config = self.clone();
		config.device_id = Some(self.resolved_device_id());
		config.data_dir = Some(self.resolved_data_dir());
		config
	}

	pub fn to_node_options(&self) -> Result<NodeOptions> {
		if self.service.service_type.trim().is_empty() {
			return Err(CliError::InvalidConfig("service.type must not be empty".into()));
		}
		if self.service.hub_service_type.trim().is_empty() {
			return Err(CliError::InvalidConfig("service.hubType must not be empty".into()));
		}
		if let Some(hub) = &self.hub {
			if hub.host.trim().is_empty() || hub.port == 0 {
				return Err(CliError::InvalidConfig(format!("invalid hub address {}:{}", hub.host, hub.port)));
			}
		}

		let mut options = NodeOptions::new(self.resolved_device_id(), self.resolved_data_dir());
		options.hub = self.hub.as_ref().map(|hub| RemoteEndpoint::new(hub.host.clone(), hub.port));
		options.service_type = self.service.service_type.clone();
		options.hub_service_type = self.service.hub_service_type.clone();
		options.service_name = self.service.name.clone();
		options.service_port = self.service.port;
		options.advertise = self.service.advertise;
		options.discover = self.service.discover;
		options.connection = ConnectionConfig::from(&self.connection);
		options.recorder_start_timeout = Duration::from_millis(self.session.recorder_start_timeout_ms);
		options.recorder_stop_timeout = Duration::from_millis(self.session.recorder_stop_timeout_ms);
		options.transfer = TransferTimeouts {
			connect: Duration::from_millis(self.transfer.connect_timeout_ms),
			io: Duration::from_millis(self.transfer.io_timeout_ms),
		};
		Ok(options)
	}
}

fn millis(duration: Duration) -> u64 {
	u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Host name reduced to characters that are safe in file and service names.
fn default_device_id() -> String {
	let raw = std::env::var("HOSTNAME")
		.ok()
		.or_else(|| std::env::var("COMPUTERNAME").ok())
		.or_else(|| std::fs::read_to_string("/etc/hostname").ok())
		.unwrap_or_default();
	sanitize_device_id(&raw)
}

fn sanitize_device_id(raw: &str) -> String {
	let host = raw.trim().split('.').next().unwrap_or_default();
	let cleaned: String = host
		.chars()
		.map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '-' })
		.collect();
	let cleaned = cleaned.trim_matches('-');
	if cleaned.is_empty() {
		"nodelink-node".to_string()
	} else {
		cleaned.to_string()
	}
}
