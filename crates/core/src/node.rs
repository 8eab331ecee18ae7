//! The node event loop.
//!
//! [`Node`] owns the connection manager and the engine. It reacts to
//! connection events, dispatches each inbound line on its own task, pushes
//! transfer completions to the hub, and keeps the connection healthy.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use nodelink_protocol::{DEFAULT_HUB_SERVICE_TYPE, DEFAULT_SERVICE_TYPE, Envelope, Status};
use nodelink_runtime::{
	Browser, ConnectionConfig, ConnectionEvent, ConnectionManager, DEVICE_ID_PROPERTY, DiscoveredService, Discovery, DiscoveryEvent,
	RemoteEndpoint,
};
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::flash_log::FlashLog;
use crate::session::SessionOrchestrator;
use crate::transfer::{TransferJob, TransferService, TransferStatus, TransferTimeouts};

/// Everything needed to build a [`Node`].
#[derive(Debug, Clone)]
pub struct NodeOptions {
	pub device_id: String,
	/// Root for sessions and the flash-sync log.
	pub data_dir: PathBuf,
	/// Fixed hub address. When absent the node browses for one.
	pub hub: Option<RemoteEndpoint>,
	/// Service type this node advertises under.
	pub service_type: String,
	/// Service type browsed for hubs. Services of any other type are ignored.
	pub hub_service_type: String,
	/// Advertised instance name; defaults to the device id.
	pub service_name: Option<String>,
	pub service_port: u16,
	pub advertise: bool,
	pub discover: bool,
	pub connection: ConnectionConfig,
	pub recorder_start_timeout: Duration,
	pub recorder_stop_timeout: Duration,
	pub transfer: TransferTimeouts,
}

impl NodeOptions {
	pub fn new(device_id: impl Into<String>, data_dir: impl Into<PathBuf>) -> Self {
		Self {
			device_id: device_id.into(),
			data_dir: data_dir.into(),
			hub: None,
			service_type: DEFAULT_SERVICE_TYPE.to_string(),
			hub_service_type: DEFAULT_HUB_SERVICE_TYPE.to_string(),
			service_name: None,
			service_port: 8080,
			advertise: true,
			discover: true,
			connection: ConnectionConfig::default(),
			recorder_start_timeout: SessionOrchestrator::DEFAULT_START_TIMEOUT,
			recorder_stop_timeout: Duration::from_secs(5),
			transfer: TransferTimeouts::default(),
		}
	}

	pub fn sessions_root(&self) -> PathBuf {
		self.data_dir.join("sessions")
	}

	pub fn instance_name(&self) -> &str {
		self.service_name.as_deref().unwrap_or(&self.device_id)
	}
}

struct Inbox {
	connection: mpsc::UnboundedReceiver<ConnectionEvent>,
	transfers: mpsc::UnboundedReceiver<TransferJob>,
}

pub struct Node {
	options: NodeOptions,
	engine: Arc<Engine>,
	connection: ConnectionManager,
	discovery: Mutex<Option<Arc<Discovery>>>,
	inbox: Mutex<Option<Inbox>>,
	shutdown_tx: watch::Sender<bool>,
}

impl Node {
	/// Builds the node. Fails only when the data directory cannot be created.
	///
	/// Must be called inside a Tokio runtime.
	pub fn new(options: NodeOptions) -> Result<Self> {
		let sessions_root = options.sessions_root();
		std::fs::create_dir_all(&sessions_root).map_err(|source| Error::DataDir {
			path: sessions_root.clone(),
			source,
		})?;

		let flash = Arc::new(FlashLog::new(&options.data_dir));
		let sessions = Arc::new(
			SessionOrchestrator::new(&sessions_root, options.recorder_stop_timeout).with_start_timeout(options.recorder_start_timeout),
		);
		let (transfers, transfer_rx) = TransferService::new(
			options.device_id.clone(),
			&sessions_root,
			Some(flash.path().to_path_buf()),
			options.transfer,
		);
		let engine = Arc::new(Engine::new(options.device_id.clone(), sessions, Arc::new(transfers), flash));
		let (connection, connection_rx) = ConnectionManager::new(options.connection.clone());
		let (shutdown_tx, _) = watch::channel(false);

		Ok(Self {
			options,
			engine,
			connection,
			discovery: Mutex::new(None),
			inbox: Mutex::new(Some(Inbox {
				connection: connection_rx,
				transfers: transfer_rx,
			})),
			shutdown_tx,
		})
	}

	pub fn options(&self) -> &NodeOptions {
		&self.options
	}

	pub fn engine(&self) -> &Arc<Engine> {
		&self.engine
	}

	pub fn sessions(&self) -> &Arc<SessionOrchestrator> {
		self.engine.sessions()
	}

	pub fn flash_log(&self) -> &Arc<FlashLog> {
		self.engine.flash_log()
	}

	pub fn connection(&self) -> &ConnectionManager {
		&self.connection
	}

	/// Runs until [`Node::shutdown`] is called. Can only be run once.
	pub async fn run(&self) -> Result<()> {
		let Some(mut inbox) = self.inbox.lock().take() else {
			return Err(Error::AlreadyRunning);
		};
		let mut shutdown = self.shutdown_tx.subscribe();

		let mut browser = self.start_discovery();
		if let Some(hub) = self.options.hub.clone() {
			let connection = self.connection.clone();
			tokio::spawn(async move {
				// Failures are retried by the manager.
				let _ = connection.connect(hub).await;
			});
		}

		let period = self.options.connection.health_check_interval.max(Duration::from_millis(100));
		let mut health = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
		health.set_missed_tick_behavior(MissedTickBehavior::Delay);

		info!(target = "nodelink.node", device = %self.options.device_id, "node running");
		loop {
			tokio::select! {
				_ = shutdown.wait_for(|stop| *stop) => break,
				Some(event) = inbox.connection.recv() => self.on_connection_event(event),
				Some(job) = inbox.transfers.recv() => self.on_transfer_finished(job),
				event = next_discovery(&mut browser) => match event {
					Some(event) => self.on_discovery_event(event),
					None => browser = None,
				},
				_ = health.tick() => {
					let connection = self.connection.clone();
					tokio::spawn(async move {
						connection.check_health().await;
					});
				}
			}
		}

		if let Some(browser) = browser {
			browser.stop();
		}
		info!(target = "nodelink.node", "node loop stopped");
		Ok(())
	}

	/// Stops the session, disconnects, and withdraws advertisements. Also
	/// ends a running [`Node::run`].
	pub async fn shutdown(&self) {
		self.shutdown_tx.send_replace(true);

		let outcome = self.engine.sessions().stop_session().await;
		if let Some(session) = outcome.session_id {
			info!(target = "nodelink.node", %session, failures = outcome.failures.len(), "session stopped for shutdown");
		}
		self.connection.forget().await;
		if let Some(discovery) = self.discovery.lock().take() {
			discovery.shutdown();
		}
		info!(target = "nodelink.node", "node shut down");
	}

	fn start_discovery(&self) -> Option<Browser> {
		let wants_browse = self.options.discover && self.options.hub.is_none();
		if !self.options.advertise && !wants_browse {
			return None;
		}

		let discovery = match Discovery::new() {
			Ok(discovery) => Arc::new(discovery),
			Err(err) => {
				warn!(target = "nodelink.node", error = %err, "mDNS unavailable; advertisement and discovery disabled");
				return None;
			}
		};

		if self.options.advertise {
			let properties = HashMap::from([(DEVICE_ID_PROPERTY.to_string(), self.options.device_id.clone())]);
			if let Err(err) = discovery.advertise(
				&self.options.service_type,
				self.options.instance_name(),
				self.options.service_port,
				properties,
			) {
				warn!(target = "nodelink.node", error = %err, "service advertisement failed");
			}
		}

		let browser = if wants_browse {
			match discovery.discover(&self.options.hub_service_type) {
				Ok(browser) => Some(browser),
				Err(err) => {
					warn!(target = "nodelink.node", error = %err, "hub discovery failed");
					None
				}
			}
		} else {
			None
		};

		*self.discovery.lock() = Some(discovery);
		browser
	}

	fn on_connection_event(&self, event: ConnectionEvent) {
		match event {
			ConnectionEvent::Message(line) => {
				if line.trim().is_empty() {
					return;
				}
				let engine = self.engine.clone();
				let connection = self.connection.clone();
				tokio::spawn(async move {
					let Some(response) = engine.handle_line(&line).await else {
						return;
					};
					match response.to_line() {
						Ok(reply) => {
							if let Err(err) = connection.send(&reply).await {
								warn!(target = "nodelink.node", ack_id = %response.ack_id, error = %err, "response not delivered");
							}
						}
						Err(err) => warn!(target = "nodelink.node", error = %err, "failed to encode response"),
					}
				});
			}
			ConnectionEvent::Connected(endpoint) => {
				info!(target = "nodelink.node", %endpoint, "hub connected");
				self.send_rejoin();
			}
			ConnectionEvent::Lost { endpoint, reason } => {
				info!(target = "nodelink.node", %endpoint, %reason, "hub connection lost");
			}
			ConnectionEvent::RetriesExhausted(endpoint) => {
				warn!(target = "nodelink.node", %endpoint, "hub unreachable; waiting for health check to re-arm");
			}
		}
	}

	/// Tells the hub which session this node holds, if any.
	fn send_rejoin(&self) {
		let snapshot = self.engine.sessions().status();
		let recording = snapshot.status.is_active();
		let session_id = snapshot.session_id.or_else(|| self.engine.sessions().last_session_id());
		if session_id.is_none() {
			return;
		}

		let envelope = Envelope::rejoin(session_id, self.options.device_id.clone(), recording);
		let connection = self.connection.clone();
		tokio::spawn(async move {
			match connection.send_json(&envelope).await {
				Ok(()) => debug!(target = "nodelink.node", "rejoin sent"),
				Err(err) => warn!(target = "nodelink.node", error = %err, "rejoin not delivered"),
			}
		});
	}

	fn on_transfer_finished(&self, job: TransferJob) {
		let (status, event) = match job.status {
			TransferStatus::Complete => (Status::Ok, "transfer_complete"),
			_ => (Status::Error, "transfer_failed"),
		};
		let ack_id = job.ack_id.clone().unwrap_or_else(|| job.session_id.clone());
		let data = json!({
			"event": event,
			"session_id": job.session_id,
			"filename": job.filename,
			"bytes_sent": job.bytes_sent,
			"error": job.error,
		});
		let envelope = Envelope::ack(ack_id, status, data);

		let connection = self.connection.clone();
		tokio::spawn(async move {
			if let Err(err) = connection.send_json(&envelope).await {
				debug!(target = "nodelink.node", error = %err, "transfer result not pushed; still visible via query_status");
			}
		});
	}

	fn on_discovery_event(&self, event: DiscoveryEvent) {
		match event {
			DiscoveryEvent::Found(service) => {
				let Some(endpoint) = hub_endpoint(&self.options, &service) else {
					return;
				};
				let status = self.connection.status();
				if status.state.is_busy() {
					debug!(target = "nodelink.node", name = %service.name, "already connected; ignoring discovered hub");
					return;
				}
				info!(target = "nodelink.node", name = %service.name, %endpoint, "connecting to discovered hub");
				let connection = self.connection.clone();
				tokio::spawn(async move {
					let _ = connection.connect(endpoint).await;
				});
			}
			DiscoveryEvent::Lost { name } => {
				debug!(target = "nodelink.node", %name, "hub advertisement withdrawn");
			}
		}
	}
}

/// Where to dial a discovered service, or `None` when it is not a hub.
fn hub_endpoint(options: &NodeOptions, service: &DiscoveredService) -> Option<RemoteEndpoint> {
	if service.service_type != options.hub_service_type {
		debug!(target = "nodelink.node", name = %service.name, service_type = %service.service_type, "ignoring non-hub service");
		return None;
	}
	if let Some(device_id) = &service.device_id {
		debug!(target = "nodelink.node", name = %service.name, %device_id, "ignoring peer node");
		return None;
	}
	if service.name == options.instance_name() {
		return None;
	}
	let endpoint = service.endpoint();
	if endpoint.is_none() {
		debug!(target = "nodelink.node", name = %service.name, "discovered service has no address");
	}
	endpoint
}

async fn next_discovery(browser: &mut Option<Browser>) -> Option<DiscoveryEvent> {
	match browser {
		Some(browser) => browser.next().await,
		None => std::future::pending().await,
	}
}
