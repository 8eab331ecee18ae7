//! DNS-SD advertisement of the node and discovery of hubs.
//!
//! Backed by the `mdns-sd` responder, which runs its own thread. Browse
//! results arrive on a blocking channel; a blocking task forwards them to a
//! Tokio channel as [`DiscoveryEvent`]s.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::connection::RemoteEndpoint;
use crate::error::{Error, Result};

const BROWSE_POLL: Duration = Duration::from_millis(250);

/// TXT property carrying a node's device id. Hubs do not set it.
pub const DEVICE_ID_PROPERTY: &str = "device_id";

/// A resolved service instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredService {
	/// Instance name without the service type suffix.
	pub name: String,
	pub service_type: String,
	pub addresses: Vec<IpAddr>,
	pub port: u16,
	/// Set when the instance is a node rather than a hub.
	pub device_id: Option<String>,
}

impl DiscoveredService {
	/// Endpoint to dial, preferring IPv4 addresses.
	pub fn endpoint(&self) -> Option<RemoteEndpoint> {
		let address = self
			.addresses
			.iter()
			.find(|addr| addr.is_ipv4())
			.or_else(|| self.addresses.first())?;
		Some(RemoteEndpoint::new(address.to_string(), self.port))
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
	Found(DiscoveredService),
	Lost { name: String },
}

/// Advertises this node and browses for peers.
pub struct Discovery {
	daemon: ServiceDaemon,
	registered: Mutex<Vec<String>>,
}

impl Discovery {
	pub fn new() -> Result<Self> {
		let daemon = ServiceDaemon::new().map_err(|e| Error::Discovery(e.to_string()))?;
		Ok(Self {
			daemon,
			registered: Mutex::new(Vec::new()),
		})
	}

	/// Registers `instance_name` under `service_type` on `port`.
	///
	/// Failure is reported to the caller, which is expected to log it and
	/// carry on without advertisement.
	pub fn advertise(&self, service_type: &str, instance_name: &str, port: u16, properties: HashMap<String, String>) -> Result<()> {
		let host_name = format!("{}.local.", sanitize_host_label(instance_name));
		let info = ServiceInfo::new(service_type, instance_name, &host_name, "", port, properties)
			.map_err(|e| Error::Discovery(e.to_string()))?
			.enable_addr_auto();
		let fullname = info.get_fullname().to_string();

		self.daemon.register(info).map_err(|e| Error::Discovery(e.to_string()))?;
		info!(target = "nodelink.discovery", service = %fullname, port, "advertising service");
		self.registered.lock().push(fullname);
		Ok(())
	}

	/// Withdraws every advertisement made through this handle.
	pub fn withdraw_all(&self) {
		let names = std::mem::take(&mut *self.registered.lock());
		for fullname in names {
			match self.daemon.unregister(&fullname) {
				Ok(_) => debug!(target = "nodelink.discovery", service = %fullname, "advertisement withdrawn"),
				Err(err) => warn!(target = "nodelink.discovery", service = %fullname, error = %err, "failed to withdraw advertisement"),
			}
		}
	}

	/// Starts browsing for `service_type`.
	pub fn discover(&self, service_type: &str) -> Result<Browser> {
		let receiver = self.daemon.browse(service_type).map_err(|e| Error::Discovery(e.to_string()))?;
		let (tx, rx) = mpsc::unbounded_channel();
		let stop = Arc::new(AtomicBool::new(false));
		let suffix = format!(".{service_type}");

		let stop_flag = stop.clone();
		tokio::task::spawn_blocking(move || {
			while !stop_flag.load(Ordering::Relaxed) {
				let event = match receiver.recv_timeout(BROWSE_POLL) {
					Ok(event) => event,
					Err(_) if receiver.is_disconnected() => break,
					Err(_) => continue,
				};
				let forwarded = match event {
					ServiceEvent::ServiceResolved(info) => {
						let service = DiscoveredService {
							name: instance_name(info.get_fullname(), &suffix),
							service_type: info.get_type().to_string(),
							addresses: info.get_addresses().iter().copied().collect(),
							port: info.get_port(),
							device_id: info.get_property_val_str(DEVICE_ID_PROPERTY).map(str::to_string),
						};
						debug!(target = "nodelink.discovery", name = %service.name, port = service.port, "service resolved");
						DiscoveryEvent::Found(service)
					}
					ServiceEvent::ServiceRemoved(_, fullname) => {
						let name = instance_name(&fullname, &suffix);
						debug!(target = "nodelink.discovery", %name, "service removed");
						DiscoveryEvent::Lost { name }
					}
					_ => continue,
				};
				if tx.send(forwarded).is_err() {
					break;
				}
			}
		});

		info!(target = "nodelink.discovery", service_type, "browsing");
		Ok(Browser {
			events: rx,
			stop,
			daemon: self.daemon.clone(),
			service_type: service_type.to_string(),
		})
	}

	/// Withdraws advertisements and stops the responder thread.
	pub fn shutdown(&self) {
		self.withdraw_all();
		if let Err(err) = self.daemon.shutdown() {
			debug!(target = "nodelink.discovery", error = %err, "responder shutdown failed");
		}
	}
}

/// Stream of browse results for one service type.
pub struct Browser {
	events: mpsc::UnboundedReceiver<DiscoveryEvent>,
	stop: Arc<AtomicBool>,
	daemon: ServiceDaemon,
	service_type: String,
}

impl Browser {
	pub async fn next(&mut self) -> Option<DiscoveryEvent> {
		self.events.recv().await
	}

	pub fn stop(&self) {
		if !self.stop.swap(true, Ordering::Relaxed) {
			let _ = self.daemon.stop_browse(&self.service_type);
		}
	}
}

impl Drop for Browser {
	fn drop(&mut self) {
		self.stop();
	}
}

fn instance_name(fullname: &str, suffix: &str) -> String {
	fullname.strip_suffix(suffix).unwrap_or(fullname).to_string()
}

/// DNS host labels allow letters, digits, and hyphens.
fn sanitize_host_label(name: &str) -> String {
	let label: String = name
		.chars()
		.map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '-' })
		.collect();
	let label = label.trim_matches('-');
	if label.is_empty() { "nodelink".to_string() } else { label.to_string() }
}
