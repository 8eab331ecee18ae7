use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::*;
use crate::recorder::RecorderError;

/// Shared call log across recorders, to check ordering.
type CallLog = Arc<Mutex<Vec<String>>>;

#[derive(Default)]
struct MockRecorder {
	name: String,
	log: CallLog,
	fail_start: bool,
	hang_start: bool,
	fail_stop: bool,
	hang_stop: bool,
	starts: AtomicUsize,
	stops: AtomicUsize,
	dirs: Mutex<Vec<PathBuf>>,
}

impl MockRecorder {
	fn new(name: &str, log: &CallLog) -> Self {
		Self {
			name: name.to_string(),
			log: log.clone(),
			..Default::default()
		}
	}
}

#[async_trait]
impl SensorRecorder for MockRecorder {
	async fn start(&self, directory: &Path) -> Result<(), RecorderError> {
		self.log.lock().push(format!("start:{}", self.name));
		self.starts.fetch_add(1, Ordering::SeqCst);
		self.dirs.lock().push(directory.to_path_buf());
		if self.hang_start {
			tokio::time::sleep(Duration::from_secs(60)).await;
		}
		if self.fail_start {
			return Err(RecorderError::new("device unavailable"));
		}
		Ok(())
	}

	async fn stop(&self) -> Result<(), RecorderError> {
		self.log.lock().push(format!("stop:{}", self.name));
		self.stops.fetch_add(1, Ordering::SeqCst);
		if self.hang_stop {
			tokio::time::sleep(Duration::from_secs(60)).await;
		}
		if self.fail_stop {
			return Err(RecorderError::new("flush failed"));
		}
		Ok(())
	}
}

fn orchestrator(root: &Path) -> SessionOrchestrator {
	SessionOrchestrator::new(root.join("sessions"), Duration::from_millis(200))
}

/// Orchestrator with a fast recorder followed by one whose start never returns.
async fn stalled_start(root: &Path, log: &CallLog) -> (Arc<SessionOrchestrator>, Arc<MockRecorder>, Arc<MockRecorder>) {
	let orch = Arc::new(orchestrator(root));
	let fast = Arc::new(MockRecorder::new("fast", log));
	let slow = Arc::new(MockRecorder {
		hang_start: true,
		..MockRecorder::new("slow", log)
	});
	orch.register("fast", fast.clone()).await.unwrap();
	orch.register("slow", slow.clone()).await.unwrap();
	(orch, fast, slow)
}

async fn wait_for_status(orch: &SessionOrchestrator, wanted: SessionStatus) {
	let mut status = orch.subscribe();
	tokio::time::timeout(Duration::from_secs(5), status.wait_for(|s| *s == wanted))
		.await
		.expect("status not reached")
		.unwrap();
}

#[tokio::test]
async fn test_start_and_stop_in_registration_order() {
	let tmp = tempfile::tempdir().unwrap();
	let log = CallLog::default();
	let orch = orchestrator(tmp.path());
	let a = Arc::new(MockRecorder::new("rgb", &log));
	let b = Arc::new(MockRecorder::new("gsr", &log));
	orch.register("rgb", a.clone()).await.unwrap();
	orch.register("gsr", b.clone()).await.unwrap();

	let id = orch.start_session(Some("s1".into())).await.unwrap();
	assert_eq!(id, "s1");
	let snapshot = orch.status();
	assert_eq!(snapshot.status, SessionStatus::Recording);
	assert_eq!(snapshot.session_id.as_deref(), Some("s1"));
	assert!(snapshot.started_at_ns.is_some());

	let session_dir = tmp.path().join("sessions").join("s1");
	assert!(session_dir.join("rgb").is_dir());
	assert!(session_dir.join("gsr").is_dir());
	assert_eq!(a.dirs.lock().as_slice(), &[session_dir.join("rgb")]);

	let outcome = orch.stop_session().await;
	assert!(outcome.is_clean());
	assert_eq!(outcome.session_id.as_deref(), Some("s1"));
	assert_eq!(orch.status().status, SessionStatus::Idle);
	assert_eq!(*log.lock(), vec!["start:rgb", "start:gsr", "stop:rgb", "stop:gsr"]);
	assert_eq!(orch.last_session_id().as_deref(), Some("s1"));
}

#[tokio::test]
async fn test_stop_when_idle_touches_no_recorder() {
	let tmp = tempfile::tempdir().unwrap();
	let log = CallLog::default();
	let orch = orchestrator(tmp.path());
	let a = Arc::new(MockRecorder::new("rgb", &log));
	orch.register("rgb", a.clone()).await.unwrap();

	let outcome = orch.stop_session().await;
	assert_eq!(outcome, StopOutcome::default());
	assert_eq!(a.stops.load(Ordering::SeqCst), 0);
	assert_eq!(orch.status().status, SessionStatus::Idle);
}

#[tokio::test]
async fn test_second_start_is_rejected() {
	let tmp = tempfile::tempdir().unwrap();
	let orch = orchestrator(tmp.path());

	orch.start_session(Some("first".into())).await.unwrap();
	let err = orch.start_session(Some("second".into())).await.unwrap_err();
	assert!(matches!(err, SessionError::AlreadyActive));
	assert_eq!(err.to_string(), "session already active");
	assert_eq!(orch.status().session_id.as_deref(), Some("first"));
}

#[tokio::test]
async fn test_partial_start_failure_rolls_back() {
	let tmp = tempfile::tempdir().unwrap();
	let log = CallLog::default();
	let orch = orchestrator(tmp.path());
	let a = Arc::new(MockRecorder::new("a", &log));
	let b = Arc::new(MockRecorder {
		fail_start: true,
		..MockRecorder::new("b", &log)
	});
	orch.register("a", a.clone()).await.unwrap();
	orch.register("b", b.clone()).await.unwrap();

	let err = orch.start_session(None).await.unwrap_err();
	assert!(matches!(err, SessionError::StartFailed { ref name, .. } if name == "b"));

	assert_eq!(orch.status().status, SessionStatus::Idle);
	assert_eq!(a.stops.load(Ordering::SeqCst), 1);
	assert_eq!(b.stops.load(Ordering::SeqCst), 0);
	assert_eq!(orch.last_session_id(), None);

	// The node is usable again.
	orch.unregister("b").await.unwrap();
	orch.start_session(None).await.unwrap();
}

#[tokio::test]
async fn test_stop_continues_past_failures_and_timeouts() {
	let tmp = tempfile::tempdir().unwrap();
	let log = CallLog::default();
	let orch = orchestrator(tmp.path());
	let failing = Arc::new(MockRecorder {
		fail_stop: true,
		..MockRecorder::new("failing", &log)
	});
	let stuck = Arc::new(MockRecorder {
		hang_stop: true,
		..MockRecorder::new("stuck", &log)
	});
	let fine = Arc::new(MockRecorder::new("fine", &log));
	orch.register("failing", failing).await.unwrap();
	orch.register("stuck", stuck).await.unwrap();
	orch.register("fine", fine.clone()).await.unwrap();

	orch.start_session(Some("s2".into())).await.unwrap();
	let outcome = orch.stop_session().await;

	assert_eq!(orch.status().status, SessionStatus::Idle);
	assert_eq!(fine.stops.load(Ordering::SeqCst), 1);
	let failed: Vec<_> = outcome.failures.iter().map(|f| f.recorder.as_str()).collect();
	assert_eq!(failed, vec!["failing", "stuck"]);
	assert!(outcome.failures[1].error.contains("timed out"));
}

#[tokio::test]
async fn test_registration_only_while_idle() {
	let tmp = tempfile::tempdir().unwrap();
	let log = CallLog::default();
	let orch = orchestrator(tmp.path());
	orch.start_session(None).await.unwrap();

	let late = Arc::new(MockRecorder::new("late", &log));
	assert!(matches!(orch.register("late", late).await, Err(SessionError::NotIdle)));
	assert!(matches!(orch.unregister("late").await, Err(SessionError::NotIdle)));
}

#[tokio::test]
async fn test_reregistering_replaces_in_place() {
	let tmp = tempfile::tempdir().unwrap();
	let log = CallLog::default();
	let orch = orchestrator(tmp.path());
	let old = Arc::new(MockRecorder::new("old", &log));
	let new = Arc::new(MockRecorder::new("new", &log));

	orch.register("cam", old.clone()).await.unwrap();
	orch.register("gsr", Arc::new(MockRecorder::new("gsr", &log))).await.unwrap();
	orch.register("cam", new.clone()).await.unwrap();
	assert_eq!(orch.registered_sensors(), vec!["cam", "gsr"]);

	orch.start_session(None).await.unwrap();
	assert_eq!(old.starts.load(Ordering::SeqCst), 0);
	assert_eq!(new.starts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_error_state_requires_reset() {
	let tmp = tempfile::tempdir().unwrap();
	let log = CallLog::default();
	let orch = orchestrator(tmp.path());
	let a = Arc::new(MockRecorder::new("a", &log));
	orch.register("a", a.clone()).await.unwrap();

	orch.start_session(Some("s3".into())).await.unwrap();
	orch.fail_session("recorder a disconnected").await;
	let snapshot = orch.status();
	assert_eq!(snapshot.status, SessionStatus::Error);
	assert_eq!(snapshot.last_error.as_deref(), Some("recorder a disconnected"));
	assert!(matches!(orch.start_session(None).await, Err(SessionError::AlreadyActive)));

	let outcome = orch.reset().await;
	assert_eq!(outcome.session_id.as_deref(), Some("s3"));
	assert_eq!(a.stops.load(Ordering::SeqCst), 1);
	assert_eq!(orch.status().status, SessionStatus::Idle);
}

#[tokio::test]
async fn test_invalid_session_id_is_rejected_before_any_start() {
	let tmp = tempfile::tempdir().unwrap();
	let log = CallLog::default();
	let orch = orchestrator(tmp.path());
	let a = Arc::new(MockRecorder::new("a", &log));
	orch.register("a", a.clone()).await.unwrap();

	let err = orch.start_session(Some("../escape".into())).await.unwrap_err();
	assert!(matches!(err, SessionError::InvalidId { .. }));
	assert_eq!(a.starts.load(Ordering::SeqCst), 0);
	assert_eq!(orch.status().status, SessionStatus::Idle);
}

#[tokio::test]
async fn test_status_watch_sees_recording() {
	let tmp = tempfile::tempdir().unwrap();
	let orch = orchestrator(tmp.path());
	let mut status = orch.subscribe();

	orch.start_session(None).await.unwrap();
	assert_eq!(*status.borrow_and_update(), SessionStatus::Recording);
	orch.stop_session().await;
	assert_eq!(*status.borrow_and_update(), SessionStatus::Idle);
}

#[tokio::test]
async fn test_session_dir_resolution() {
	let tmp = tempfile::tempdir().unwrap();
	let orch = orchestrator(tmp.path());
	orch.start_session(Some("kept".into())).await.unwrap();
	orch.stop_session().await;

	assert_eq!(orch.session_dir("kept").unwrap(), tmp.path().join("sessions").join("kept"));
	assert!(matches!(orch.session_dir("gone"), Err(SessionError::NotFound(_))));
}

#[tokio::test]
async fn test_start_while_preparing_is_rejected_immediately() {
	let tmp = tempfile::tempdir().unwrap();
	let log = CallLog::default();
	let (orch, _fast, slow) = stalled_start(tmp.path(), &log).await;

	let pending = tokio::spawn({
		let orch = orch.clone();
		async move { orch.start_session(Some("s1".into())).await }
	});
	wait_for_status(&orch, SessionStatus::Preparing).await;
	while slow.starts.load(Ordering::SeqCst) == 0 {
		tokio::task::yield_now().await;
	}

	let second = tokio::time::timeout(Duration::from_millis(500), orch.start_session(Some("s2".into())))
		.await
		.expect("second start must not wait for the first");
	assert!(matches!(second, Err(SessionError::AlreadyActive)));
	assert_eq!(orch.status().session_id.as_deref(), Some("s1"));
	assert_eq!(slow.starts.load(Ordering::SeqCst), 1);

	orch.stop_session().await;
	assert!(matches!(pending.await.unwrap(), Err(SessionError::Cancelled)));
}

#[tokio::test]
async fn test_stop_while_preparing_cancels_start() {
	let tmp = tempfile::tempdir().unwrap();
	let log = CallLog::default();
	let (orch, fast, slow) = stalled_start(tmp.path(), &log).await;

	let pending = tokio::spawn({
		let orch = orch.clone();
		async move { orch.start_session(Some("s1".into())).await }
	});
	wait_for_status(&orch, SessionStatus::Preparing).await;
	while slow.starts.load(Ordering::SeqCst) == 0 {
		tokio::task::yield_now().await;
	}

	let outcome = tokio::time::timeout(Duration::from_secs(2), orch.stop_session())
		.await
		.expect("stop must not wait for the stalled start");
	assert_eq!(outcome.session_id.as_deref(), Some("s1"));
	assert!(outcome.is_clean());
	assert_eq!(orch.status().status, SessionStatus::Idle);

	assert!(matches!(pending.await.unwrap(), Err(SessionError::Cancelled)));
	assert_eq!(fast.stops.load(Ordering::SeqCst), 1);
	assert_eq!(slow.stops.load(Ordering::SeqCst), 1);
	assert_eq!(orch.last_session_id(), None);

	// The node is usable again.
	orch.unregister("slow").await.unwrap();
	orch.start_session(Some("s2".into())).await.unwrap();
}

#[tokio::test]
async fn test_start_timeout_rolls_back() {
	let tmp = tempfile::tempdir().unwrap();
	let log = CallLog::default();
	let orch = orchestrator(tmp.path()).with_start_timeout(Duration::from_millis(50));
	let fast = Arc::new(MockRecorder::new("fast", &log));
	let slow = Arc::new(MockRecorder {
		hang_start: true,
		..MockRecorder::new("slow", &log)
	});
	orch.register("fast", fast.clone()).await.unwrap();
	orch.register("slow", slow.clone()).await.unwrap();

	let err = orch.start_session(None).await.unwrap_err();
	match err {
		SessionError::StartFailed { name, reason } => {
			assert_eq!(name, "slow");
			assert!(reason.contains("timed out"), "{reason}");
		}
		other => panic!("unexpected error: {other}"),
	}
	assert_eq!(orch.status().status, SessionStatus::Idle);
	assert_eq!(*log.lock(), vec!["start:fast", "start:slow", "stop:fast", "stop:slow"]);
}

#[tokio::test]
async fn test_fault_while_preparing_aborts_into_error() {
	let tmp = tempfile::tempdir().unwrap();
	let log = CallLog::default();
	let (orch, fast, _slow) = stalled_start(tmp.path(), &log).await;

	let pending = tokio::spawn({
		let orch = orch.clone();
		async move { orch.start_session(Some("s1".into())).await }
	});
	wait_for_status(&orch, SessionStatus::Preparing).await;
	orch.fail_session("camera unplugged").await;

	assert!(matches!(pending.await.unwrap(), Err(SessionError::Cancelled)));
	assert_eq!(fast.stops.load(Ordering::SeqCst), 1);
	let snapshot = orch.status();
	assert_eq!(snapshot.status, SessionStatus::Error);
	assert_eq!(snapshot.last_error.as_deref(), Some("camera unplugged"));

	orch.reset().await;
	assert_eq!(orch.status().status, SessionStatus::Idle);
}
