//! Nanosecond timestamps shared by responses, heartbeats and flash sync.

use std::sync::OnceLock;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

static ANCHOR: OnceLock<(u64, Instant)> = OnceLock::new();

/// Returns nanoseconds since the Unix epoch from a monotonic source.
///
/// The wall clock is sampled once; later readings advance with [`Instant`],
/// so values never go backwards even if the system clock is adjusted, while
/// staying comparable with the hub's wall-clock nanoseconds.
pub fn now_nanos() -> u64 {
	let (wall, instant) = ANCHOR.get_or_init(|| {
		let wall = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_nanos() as u64;
		(wall, Instant::now())
	});
	wall.saturating_add(instant.elapsed().as_nanos() as u64)
}
