//! Sensor-node controller.
//!
//! A node records data from a set of [`SensorRecorder`]s into per-session
//! directories, takes commands from a hub over a line-JSON connection, and
//! ships finished sessions back as compressed archives.
//!
//! ```text
//!   hub ──line JSON──▶ ConnectionManager ──events──▶ Node ──▶ Engine
//!                                                           ├─▶ SessionOrchestrator ──▶ recorders
//!                                                           ├─▶ FlashLog
//!                                                           └─▶ TransferService ──zip──▶ hub
//! ```

pub mod engine;
pub mod error;
pub mod flash_log;
pub mod node;
pub mod recorder;
pub mod session;
pub mod transfer;

pub use engine::Engine;
pub use error::{Error, Result, SessionError, TransferError};
pub use flash_log::{FLASH_LOG_FILE, FlashEvent, FlashLog};
pub use node::{Node, NodeOptions};
pub use nodelink_protocol as protocol;
pub use nodelink_runtime as runtime;
pub use recorder::{RecorderError, SensorRecorder};
pub use session::{SessionOrchestrator, SessionSnapshot, SessionStatus, StopOutcome};
pub use transfer::{TransferJob, TransferService, TransferStatus, TransferTimeouts};
