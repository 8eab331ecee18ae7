//! Resilient command connection to the hub.
//!
//! [`ConnectionManager`] is a cheap, cloneable handle around shared state. It
//! owns at most one TCP socket at a time, a reader task that turns inbound
//! lines into [`ConnectionEvent::Message`], and a single retry task that runs
//! reconnection timers one after another. Timers carry the epoch at which they
//! were scheduled; `connect`, `disconnect`, and a successful connection bump
//! the epoch so a stale timer wakes up and does nothing.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use nodelink_protocol::Envelope;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::error::{Error, Result};
use crate::transport::{LineReader, LineWriter, validate_line};

mod retry;
#[cfg(test)]
mod tests;

pub use retry::RetryPolicy;

/// Lifecycle of the command connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
	Disconnected,
	Connecting,
	Connected,
	Error,
}

impl ConnectionState {
	/// Connected or about to be; a new connect would replace a working link.
	pub fn is_busy(self) -> bool {
		matches!(self, ConnectionState::Connecting | ConnectionState::Connected)
	}
}

impl fmt::Display for ConnectionState {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let name = match self {
			ConnectionState::Disconnected => "disconnected",
			ConnectionState::Connecting => "connecting",
			ConnectionState::Connected => "connected",
			ConnectionState::Error => "error",
		};
		f.write_str(name)
	}
}

/// Host and port of the hub's command listener.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RemoteEndpoint {
	pub host: String,
	pub port: u16,
}

impl RemoteEndpoint {
	pub fn new(host: impl Into<String>, port: u16) -> Self {
		Self { host: host.into(), port }
	}
}

impl fmt::Display for RemoteEndpoint {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		if self.host.contains(':') {
			write!(f, "[{}]:{}", self.host, self.port)
		} else {
			write!(f, "{}:{}", self.host, self.port)
		}
	}
}

impl FromStr for RemoteEndpoint {
	type Err = Error;

	fn from_str(s: &str) -> Result<Self> {
		let (host, port) = s.rsplit_once(':').ok_or_else(|| Error::InvalidEndpoint(s.to_string()))?;
		let host = host.trim_start_matches('[').trim_end_matches(']');
		if host.is_empty() {
			return Err(Error::InvalidEndpoint(s.to_string()));
		}
		let port = port.parse().map_err(|_| Error::InvalidEndpoint(s.to_string()))?;
		Ok(Self::new(host, port))
	}
}

/// Timeouts and reconnection behaviour.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
	pub connect_timeout: Duration,
	/// Idle time on the socket before a health check runs. Also bounds writes.
	pub read_timeout: Duration,
	/// Silence after which a health check sends a heartbeat.
	pub health_check_interval: Duration,
	pub auto_reconnect: bool,
	pub retry: RetryPolicy,
}

impl Default for ConnectionConfig {
	fn default() -> Self {
		Self {
			connect_timeout: Duration::from_secs(10),
			read_timeout: Duration::from_secs(10),
			health_check_interval: Duration::from_secs(30),
			auto_reconnect: true,
			retry: RetryPolicy::default(),
		}
	}
}

/// What the manager observed. Consumers receive these in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
	Connected(RemoteEndpoint),
	/// One inbound line, terminator stripped.
	Message(String),
	Lost { endpoint: RemoteEndpoint, reason: String },
	/// The retry budget ran out; the manager stays disconnected until re-armed.
	RetriesExhausted(RemoteEndpoint),
}

/// Point-in-time view of the connection, suitable for status replies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionStatus {
	pub state: ConnectionState,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub endpoint: Option<RemoteEndpoint>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub last_error: Option<String>,
	pub retry_attempt: u32,
	pub retries_exhausted: bool,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub idle_ms: Option<u64>,
}

type SharedWriter = Arc<tokio::sync::Mutex<LineWriter<OwnedWriteHalf>>>;

struct Link {
	endpoint: Option<RemoteEndpoint>,
	state: ConnectionState,
	last_error: Option<String>,
	retry_attempt: u32,
	retries_exhausted: bool,
	/// Bumped for every socket so late reports from an old one are ignored.
	generation: u64,
	writer: Option<SharedWriter>,
	reader: Option<JoinHandle<()>>,
	last_activity: Option<Instant>,
}

struct RetryTimer {
	epoch: u64,
	delay: Duration,
	endpoint: RemoteEndpoint,
}

struct Inner {
	config: ConnectionConfig,
	link: Mutex<Link>,
	state_tx: watch::Sender<ConnectionState>,
	retry_epoch: watch::Sender<u64>,
	retry_tx: mpsc::UnboundedSender<RetryTimer>,
	events: mpsc::UnboundedSender<ConnectionEvent>,
	connect_attempts: AtomicU32,
}

/// Handle to the node's command connection.
#[derive(Clone)]
pub struct ConnectionManager {
	inner: Arc<Inner>,
}

impl fmt::Debug for ConnectionManager {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("ConnectionManager").field("status", &self.status()).finish()
	}
}

enum HealthAction {
	Heartbeat,
	Rearm(RemoteEndpoint),
	Report(bool),
}

impl ConnectionManager {
	/// Creates a disconnected manager and the receiver for its events.
	///
	/// Must be called inside a Tokio runtime; the retry task is spawned here.
	pub fn new(config: ConnectionConfig) -> (Self, mpsc::UnboundedReceiver<ConnectionEvent>) {
		let (events_tx, events_rx) = mpsc::unbounded_channel();
		let (retry_tx, retry_rx) = mpsc::unbounded_channel();
		let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
		let (retry_epoch, epoch_rx) = watch::channel(0u64);

		let inner = Arc::new(Inner {
			config,
			link: Mutex::new(Link {
				endpoint: None,
				state: ConnectionState::Disconnected,
				last_error: None,
				retry_attempt: 0,
				retries_exhausted: false,
				generation: 0,
				writer: None,
				reader: None,
				last_activity: None,
			}),
			state_tx,
			retry_epoch,
			retry_tx,
			events: events_tx,
			connect_attempts: AtomicU32::new(0),
		});

		tokio::spawn(retry_loop(Arc::downgrade(&inner), retry_rx, epoch_rx));
		(Self { inner }, events_rx)
	}

	pub fn config(&self) -> &ConnectionConfig {
		&self.inner.config
	}

	/// Connects to `endpoint`, replacing any current connection.
	///
	/// Cancels a pending reconnection timer and resets the retry budget. On
	/// failure the manager schedules its own reconnection when auto-reconnect
	/// is enabled, so callers may ignore the error.
	pub async fn connect(&self, endpoint: RemoteEndpoint) -> Result<()> {
		let epoch = self.bump_epoch();
		let (writer, reader) = {
			let mut link = self.inner.link.lock();
			link.retry_attempt = 0;
			link.retries_exhausted = false;
			link.generation += 1;
			(link.writer.take(), link.reader.take())
		};
		if let Some(reader) = reader {
			reader.abort();
		}
		drop(writer);

		info!(target = "nodelink.conn", %endpoint, "connecting");
		self.establish(&endpoint, epoch).await
	}

	/// Closes the connection and cancels any pending reconnection. Idempotent.
	pub async fn disconnect(&self) {
		self.bump_epoch();
		let (writer, reader, was) = {
			let mut link = self.inner.link.lock();
			let was = link.state;
			link.retry_attempt = 0;
			link.retries_exhausted = false;
			link.generation += 1;
			link.last_activity = None;
			let parts = (link.writer.take(), link.reader.take(), was);
			self.set_state(&mut link, ConnectionState::Disconnected);
			parts
		};

		if let Some(reader) = reader {
			reader.abort();
		}
		if let Some(writer) = writer {
			let mut writer = writer.lock().await;
			let _ = tokio::time::timeout(self.inner.config.read_timeout, writer.shutdown()).await;
		}
		if was != ConnectionState::Disconnected {
			info!(target = "nodelink.conn", previous = %was, "disconnected");
		}
	}

	/// Disconnects and drops the remembered endpoint, so health checks no
	/// longer re-arm reconnection.
	pub async fn forget(&self) {
		self.disconnect().await;
		self.inner.link.lock().endpoint = None;
	}

	/// Writes one line. Fails fast with [`Error::NotConnected`].
	///
	/// A write failure or timeout marks the connection lost and schedules a
	/// reconnection.
	pub async fn send(&self, line: &str) -> Result<()> {
		validate_line(line, nodelink_protocol::MAX_LINE_LEN)?;

		let (writer, generation) = {
			let link = self.inner.link.lock();
			match (&link.writer, link.state) {
				(Some(writer), ConnectionState::Connected) => (writer.clone(), link.generation),
				_ => return Err(Error::NotConnected),
			}
		};

		let result = {
			let mut writer = writer.lock().await;
			tokio::time::timeout(self.inner.config.read_timeout, writer.send_line(line)).await
		};

		match result {
			Ok(Ok(())) => {
				self.touch(generation);
				Ok(())
			}
			Ok(Err(err)) => {
				self.mark_lost(generation, format!("write failed: {err}"));
				Err(err)
			}
			Err(_) => {
				let timeout_ms = self.inner.config.read_timeout.as_millis();
				self.mark_lost(generation, format!("write timed out after {timeout_ms}ms"));
				Err(Error::Timeout(format!("write did not complete within {timeout_ms}ms")))
			}
		}
	}

	/// Serializes `value` and sends it as one line.
	pub async fn send_json<T: Serialize>(&self, value: &T) -> Result<()> {
		let line = serde_json::to_string(value)?;
		self.send(&line).await
	}

	/// Probes the connection and reports whether it is healthy.
	///
	/// Sends a heartbeat when connected and idle for longer than the health
	/// check interval. When disconnected with an exhausted retry budget and a
	/// known endpoint, re-arms reconnection instead.
	pub async fn check_health(&self) -> bool {
		let action = {
			let link = self.inner.link.lock();
			match link.state {
				ConnectionState::Connected => {
					let idle = link.last_activity.map(|t| t.elapsed());
					if idle.is_none_or(|idle| idle >= self.inner.config.health_check_interval) {
						HealthAction::Heartbeat
					} else {
						HealthAction::Report(true)
					}
				}
				ConnectionState::Disconnected if link.retries_exhausted && self.inner.config.auto_reconnect => match &link.endpoint {
					Some(endpoint) => HealthAction::Rearm(endpoint.clone()),
					None => HealthAction::Report(false),
				},
				_ => HealthAction::Report(false),
			}
		};

		match action {
			HealthAction::Report(healthy) => healthy,
			HealthAction::Heartbeat => {
				let line = match Envelope::heartbeat().to_line() {
					Ok(line) => line,
					Err(err) => {
						warn!(target = "nodelink.conn", error = %err, "failed to encode heartbeat");
						return false;
					}
				};
				match self.send(&line).await {
					Ok(()) => {
						debug!(target = "nodelink.conn", "heartbeat sent");
						true
					}
					Err(err) => {
						warn!(target = "nodelink.conn", error = %err, "heartbeat failed");
						false
					}
				}
			}
			HealthAction::Rearm(endpoint) => {
				self.rearm(endpoint);
				false
			}
		}
	}

	pub fn state(&self) -> ConnectionState {
		self.inner.link.lock().state
	}

	pub fn is_connected(&self) -> bool {
		self.state() == ConnectionState::Connected
	}

	pub fn endpoint(&self) -> Option<RemoteEndpoint> {
		self.inner.link.lock().endpoint.clone()
	}

	/// Watches state transitions.
	pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
		self.inner.state_tx.subscribe()
	}

	pub fn status(&self) -> ConnectionStatus {
		let link = self.inner.link.lock();
		ConnectionStatus {
			state: link.state,
			endpoint: link.endpoint.clone(),
			last_error: link.last_error.clone(),
			retry_attempt: link.retry_attempt,
			retries_exhausted: link.retries_exhausted,
			idle_ms: link
				.last_activity
				.filter(|_| link.state == ConnectionState::Connected)
				.map(|t| t.elapsed().as_millis() as u64),
		}
	}

	/// Total TCP connection attempts made by this manager.
	pub fn connect_attempts(&self) -> u32 {
		self.inner.connect_attempts.load(Ordering::SeqCst)
	}

	async fn establish(&self, endpoint: &RemoteEndpoint, epoch: u64) -> Result<()> {
		self.inner.connect_attempts.fetch_add(1, Ordering::SeqCst);
		{
			let mut link = self.inner.link.lock();
			link.endpoint = Some(endpoint.clone());
			self.set_state(&mut link, ConnectionState::Connecting);
		}

		let timeout = self.inner.config.connect_timeout;
		let stream = match tokio::time::timeout(timeout, TcpStream::connect((endpoint.host.as_str(), endpoint.port))).await {
			Ok(Ok(stream)) => stream,
			Ok(Err(err)) => return Err(self.connect_failed(endpoint, epoch, err.to_string())),
			Err(_) => return Err(self.connect_failed(endpoint, epoch, format!("timed out after {}ms", timeout.as_millis()))),
		};
		if let Err(err) = stream.set_nodelay(true) {
			debug!(target = "nodelink.conn", error = %err, "failed to set TCP_NODELAY");
		}

		let (read_half, write_half) = stream.into_split();
		{
			let mut link = self.inner.link.lock();
			if self.current_epoch() != epoch {
				debug!(target = "nodelink.conn", %endpoint, "dropping superseded connection");
				return Err(Error::Superseded(endpoint.to_string()));
			}
			link.generation += 1;
			let generation = link.generation;
			if let Some(previous) = link.reader.take() {
				previous.abort();
			}
			link.writer = Some(Arc::new(tokio::sync::Mutex::new(LineWriter::new(write_half))));
			link.retry_attempt = 0;
			link.retries_exhausted = false;
			link.last_error = None;
			link.last_activity = Some(Instant::now());
			self.set_state(&mut link, ConnectionState::Connected);
			link.reader = Some(tokio::spawn(read_loop(self.clone(), LineReader::new(read_half), generation)));
		}
		// Nothing should still be queued for this endpoint.
		self.bump_epoch();

		info!(target = "nodelink.conn", %endpoint, "connected");
		let _ = self.inner.events.send(ConnectionEvent::Connected(endpoint.clone()));
		Ok(())
	}

	fn connect_failed(&self, endpoint: &RemoteEndpoint, epoch: u64, reason: String) -> Error {
		let error = Error::ConnectFailed {
			endpoint: endpoint.to_string(),
			reason: reason.clone(),
		};
		if self.current_epoch() != epoch {
			return error;
		}
		{
			let mut link = self.inner.link.lock();
			link.last_error = Some(reason.clone());
			self.set_state(&mut link, ConnectionState::Error);
		}
		warn!(target = "nodelink.conn", %endpoint, %reason, "connection attempt failed");
		self.schedule_retry(endpoint.clone());
		error
	}

	fn mark_lost(&self, generation: u64, reason: String) {
		let endpoint = {
			let mut link = self.inner.link.lock();
			if link.generation != generation || link.state != ConnectionState::Connected {
				return;
			}
			link.writer = None;
			if let Some(reader) = link.reader.take() {
				reader.abort();
			}
			link.last_error = Some(reason.clone());
			link.last_activity = None;
			self.set_state(&mut link, ConnectionState::Error);
			link.endpoint.clone()
		};

		let Some(endpoint) = endpoint else {
			return;
		};
		warn!(target = "nodelink.conn", %endpoint, %reason, "connection lost");
		let _ = self.inner.events.send(ConnectionEvent::Lost {
			endpoint: endpoint.clone(),
			reason,
		});
		self.schedule_retry(endpoint);
	}

	fn schedule_retry(&self, endpoint: RemoteEndpoint) {
		let config = &self.inner.config;
		if !config.auto_reconnect {
			return;
		}

		let mut link = self.inner.link.lock();
		if !config.retry.allows(link.retry_attempt) {
			link.retries_exhausted = true;
			self.set_state(&mut link, ConnectionState::Disconnected);
			drop(link);
			warn!(
				target = "nodelink.conn",
				%endpoint,
				attempts = config.retry.max_attempts,
				"reconnection attempts exhausted"
			);
			let _ = self.inner.events.send(ConnectionEvent::RetriesExhausted(endpoint));
			return;
		}

		link.retry_attempt += 1;
		let attempt = link.retry_attempt;
		drop(link);

		let delay = config.retry.delay_for(attempt);
		info!(
			target = "nodelink.conn",
			%endpoint,
			attempt,
			max_attempts = config.retry.max_attempts,
			delay_ms = delay.as_millis() as u64,
			"scheduling reconnection"
		);
		self.enqueue(RetryTimer {
			epoch: self.current_epoch(),
			delay,
			endpoint,
		});
	}

	fn rearm(&self, endpoint: RemoteEndpoint) {
		{
			let mut link = self.inner.link.lock();
			link.retry_attempt = 0;
			link.retries_exhausted = false;
		}
		info!(target = "nodelink.conn", %endpoint, "re-arming reconnection");
		self.enqueue(RetryTimer {
			epoch: self.current_epoch(),
			delay: Duration::ZERO,
			endpoint,
		});
	}

	fn enqueue(&self, timer: RetryTimer) {
		if self.inner.retry_tx.send(timer).is_err() {
			debug!(target = "nodelink.conn", "retry task gone; reconnection skipped");
		}
	}

	fn touch(&self, generation: u64) {
		let mut link = self.inner.link.lock();
		if link.generation == generation {
			link.last_activity = Some(Instant::now());
		}
	}

	fn set_state(&self, link: &mut Link, state: ConnectionState) {
		if link.state != state {
			trace!(target = "nodelink.conn", from = %link.state, to = %state, "state change");
		}
		link.state = state;
		self.inner.state_tx.send_replace(state);
	}

	fn current_epoch(&self) -> u64 {
		*self.inner.retry_epoch.borrow()
	}

	fn bump_epoch(&self) -> u64 {
		let mut next = 0;
		self.inner.retry_epoch.send_modify(|epoch| {
			*epoch += 1;
			next = *epoch;
		});
		next
	}
}

/// Runs reconnection timers one at a time, so at most one is ever pending.
async fn retry_loop(inner: Weak<Inner>, mut timers: mpsc::UnboundedReceiver<RetryTimer>, mut epoch: watch::Receiver<u64>) {
	while let Some(timer) = timers.recv().await {
		let superseded = tokio::select! {
			_ = tokio::time::sleep(timer.delay) => false,
			_ = epoch.wait_for(|current| *current != timer.epoch) => true,
		};
		if superseded {
			debug!(target = "nodelink.conn", endpoint = %timer.endpoint, "reconnection timer cancelled");
			continue;
		}

		let Some(inner) = inner.upgrade() else {
			break;
		};
		let manager = ConnectionManager { inner };
		if manager.current_epoch() != timer.epoch {
			continue;
		}
		debug!(target = "nodelink.conn", endpoint = %timer.endpoint, "reconnecting");
		let _ = manager.establish(&timer.endpoint, timer.epoch).await;
	}
}

async fn read_loop(manager: ConnectionManager, mut reader: LineReader<OwnedReadHalf>, generation: u64) {
	let read_timeout = manager.inner.config.read_timeout;
	loop {
		match tokio::time::timeout(read_timeout, reader.next_line()).await {
			Err(_) => {
				trace!(target = "nodelink.conn", "read idle; checking health");
				manager.check_health().await;
			}
			Ok(Ok(Some(line))) => {
				manager.touch(generation);
				if manager.inner.events.send(ConnectionEvent::Message(line)).is_err() {
					debug!(target = "nodelink.conn", "event receiver dropped; stopping reader");
					break;
				}
			}
			Ok(Ok(None)) => {
				manager.mark_lost(generation, "connection closed by peer".to_string());
				break;
			}
			Ok(Err(err)) => {
				manager.mark_lost(generation, err.to_string());
				break;
			}
		}
	}
}
