//! Config file loading, merging with flags, and the `config` subcommand.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use nodelink::runtime::RemoteEndpoint;
use nodelink_cli::cli::RunArgs;
use nodelink_cli::config::{NodeConfig, resolve_config_path};
use nodelink_cli::error::CliError;
use serde_json::{Value, json};

fn nodelink_binary() -> PathBuf {
	let mut path = std::env::current_exe().unwrap();
	path.pop();
	path.pop();
	path.push("nodelink");
	path
}

fn write_config(dir: &Path, value: Value) -> PathBuf {
	let path = dir.join("config.json");
	std::fs::write(&path, serde_json::to_vec_pretty(&value).unwrap()).unwrap();
	path
}

#[test]
fn test_partial_file_keeps_defaults() {
	let tmp = tempfile::tempdir().unwrap();
	let path = write_config(
		tmp.path(),
		json!({
			"deviceId": "lab-node",
			"connection": { "baseDelayMs": 500, "maxAttempts": 3 },
			"service": { "advertise": false }
		}),
	);

	let (config, source) = NodeConfig::load(Some(&path)).unwrap();
	assert_eq!(source, Some(path));
	assert_eq!(config.device_id.as_deref(), Some("lab-node"));
	assert!(!config.service.advertise);
	assert_eq!(config.service.port, 8080);

	let options = config.to_node_options().unwrap();
	assert_eq!(options.device_id, "lab-node");
	assert_eq!(options.connection.retry.base_delay, Duration::from_millis(500));
	assert_eq!(options.connection.retry.max_attempts, 3);
	assert_eq!(options.connection.read_timeout, Duration::from_secs(10));
	assert_eq!(options.recorder_start_timeout, Duration::from_secs(10));
	assert_eq!(options.recorder_stop_timeout, Duration::from_secs(5));
	assert_eq!(options.hub_service_type, "_sensorhub._tcp.local.");
	assert!(!options.advertise);
}

#[test]
fn test_hub_type_and_start_timeout_from_file() {
	let tmp = tempfile::tempdir().unwrap();
	let path = write_config(
		tmp.path(),
		json!({
			"service": { "hubType": "_lab-hub._tcp.local." },
			"session": { "recorderStartTimeoutMs": 2500 }
		}),
	);
	let (config, _) = NodeConfig::load(Some(&path)).unwrap();
	let options = config.to_node_options().unwrap();
	assert_eq!(options.hub_service_type, "_lab-hub._tcp.local.");
	assert_eq!(options.service_type, "_gsr-controller._tcp.local.");
	assert_eq!(options.recorder_start_timeout, Duration::from_millis(2500));

	let blank: NodeConfig = serde_json::from_value(json!({ "service": { "hubType": " " } })).unwrap();
	assert!(matches!(blank.to_node_options(), Err(CliError::InvalidConfig(_))));
}

#[test]
fn test_flags_override_file() {
	let tmp = tempfile::tempdir().unwrap();
	let path = write_config(
		tmp.path(),
		json!({
			"deviceId": "from-file",
			"dataDir": "/srv/file",
			"hub": { "host": "hub.local", "port": 9000 },
			"recorders": ["gsr"]
		}),
	);
	let (mut config, _) = NodeConfig::load(Some(&path)).unwrap();

	config.apply_run_args(&RunArgs {
		hub: Some(RemoteEndpoint::new("10.1.1.1", 7000)),
		device_id: Some("from-flag".into()),
		data_dir: None,
		no_advertise: true,
		recorders: vec!["gsr".into(), "camera".into()],
	});

	let options = config.to_node_options().unwrap();
	assert_eq!(options.device_id, "from-flag");
	assert_eq!(options.data_dir, PathBuf::from("/srv/file"));
	assert_eq!(options.hub, Some(RemoteEndpoint::new("10.1.1.1", 7000)));
	assert!(!options.advertise);
	assert_eq!(config.recorders, vec!["gsr", "camera"]);
}

#[test]
fn test_missing_explicit_file_is_an_error() {
	let tmp = tempfile::tempdir().unwrap();
	let err = NodeConfig::load(Some(&tmp.path().join("absent.json"))).unwrap_err();
	assert!(matches!(err, CliError::ConfigNotFound { .. }));
}

#[test]
fn test_malformed_file_reports_path() {
	let tmp = tempfile::tempdir().unwrap();
	let path = tmp.path().join("config.json");
	std::fs::write(&path, "{ not json").unwrap();
	let err = NodeConfig::load(Some(&path)).unwrap_err();
	assert!(matches!(err, CliError::ConfigParse { .. }));
	assert!(err.to_string().contains("config.json"));
}

#[test]
fn test_invalid_hub_rejected() {
	let config: NodeConfig = serde_json::from_value(json!({ "hub": { "host": "", "port": 9000 } })).unwrap();
	assert!(matches!(config.to_node_options(), Err(CliError::InvalidConfig(_))));
}

#[test]
fn test_effective_config_fills_identity() {
	let effective = NodeConfig::default().effective();
	assert!(effective.device_id.is_some_and(|id| !id.is_empty()));
	assert!(effective.data_dir.is_some());
}

#[test]
fn test_explicit_path_wins_resolution() {
	let path = Path::new("/opt/nodelink.json");
	assert_eq!(resolve_config_path(Some(path)), Some(path.to_path_buf()));
}

#[test]
fn test_config_show_prints_effective_json() {
	let tmp = tempfile::tempdir().unwrap();
	let path = write_config(
		tmp.path(),
		json!({ "deviceId": "shown", "dataDir": tmp.path().join("data") }),
	);

	let output = Command::new(nodelink_binary())
		.args(["config", "show", "--config"])
		.arg(&path)
		.output()
		.expect("failed to execute nodelink");
	assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));

	let shown: Value = serde_json::from_slice(&output.stdout).unwrap();
	assert_eq!(shown["deviceId"], "shown");
	assert_eq!(shown["service"]["type"], "_gsr-controller._tcp.local.");
	assert_eq!(shown["service"]["hubType"], "_sensorhub._tcp.local.");
	assert_eq!(shown["session"]["recorderStartTimeoutMs"], 10000);
	assert_eq!(shown["connection"]["baseDelayMs"], 2000);
	assert_eq!(shown["transfer"]["ioTimeoutMs"], 5000);
}

#[test]
fn test_config_path_echoes_explicit_file() {
	let output = Command::new(nodelink_binary())
		.args(["config", "path", "--config", "/nowhere/config.json"])
		.output()
		.expect("failed to execute nodelink");
	assert!(output.status.success());
	assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "/nowhere/config.json");
}

#[test]
fn test_missing_config_exits_nonzero() {
	let output = Command::new(nodelink_binary())
		.args(["config", "show", "--config", "/nowhere/config.json"])
		.output()
		.expect("failed to execute nodelink");
	assert!(!output.status.success());
	assert!(String::from_utf8_lossy(&output.stderr).contains("config file not found"));
}
