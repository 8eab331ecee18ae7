use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use nodelink::Node;
use tracing::info;

use crate::cli::RunArgs;
use crate::config::NodeConfig;
use crate::error::Result;
use crate::recorder::MetadataRecorder;

pub async fn execute(args: RunArgs, explicit: Option<&Path>) -> Result<()> {
	let (mut config, source) = NodeConfig::load(explicit)?;
	config.apply_run_args(&args);
	let options = config.to_node_options()?;

	info!(
		target = "nodelink.cli",
		config = ?source,
		device = %options.device_id,
		data_dir = %options.data_dir.display(),
		hub = ?options.hub,
		"starting node"
	);

	let node = Arc::new(Node::new(options).context("failed to initialise node")?);
	for name in &config.recorders {
		let recorder = MetadataRecorder::shared(name.clone(), node.options().device_id.clone());
		node.sessions()
			.register(name.clone(), recorder)
			.await
			.with_context(|| format!("failed to register recorder {name}"))?;
	}

	let result = tokio::select! {
		result = node.run() => result.map_err(Into::into),
		signal = wait_for_signal() => signal,
	};
	node.shutdown().await;
	result
}

#[cfg(unix)]
async fn wait_for_signal() -> Result<()> {
	use tokio::signal::unix::{SignalKind, signal};

	let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
	let mut sigint = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;
	tokio::select! {
		_ = sigterm.recv() => info!(target = "nodelink.cli", "received SIGTERM, shutting down"),
		_ = sigint.recv() => info!(target = "nodelink.cli", "received SIGINT, shutting down"),
	}
	Ok(())
}

#[cfg(not(unix))]
async fn wait_for_signal() -> Result<()> {
	if let Err(err) = tokio::signal::ctrl_c().await {
		tracing::warn!(target = "nodelink.cli", error = %err, "Ctrl+C handler unavailable");
		return Err(err.into());
	}
	info!(target = "nodelink.cli", "received Ctrl+C, shutting down");
	Ok(())
}
