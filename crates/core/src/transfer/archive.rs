//! Blocking archive streaming for one transfer.
//!
//! The wire format is a JSON header line followed by a ZIP stream. Entries
//! are written with data descriptors, so the archive never needs to seek and
//! goes straight to the socket. Everything here runs on the blocking pool
//! with socket timeouts.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use nodelink_protocol::TransferHeader;
use tracing::{debug, warn};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, DateTime, ZipWriter};

use crate::error::TransferError;

/// Counts bytes handed to the socket.
struct CountingWriter<'a, W> {
	inner: W,
	written: &'a AtomicU64,
}

impl<W: Write> Write for CountingWriter<'_, W> {
	fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
		let n = self.inner.write(buf)?;
		self.written.fetch_add(n as u64, Ordering::Relaxed);
		Ok(n)
	}

	fn flush(&mut self) -> io::Result<()> {
		self.inner.flush()
	}
}

/// Writes the ZIP of `session_dir` (plus `side_file` at the archive root, if present).
pub fn write_archive<W: Write>(writer: W, session_dir: &Path, side_file: Option<&Path>) -> io::Result<W> {
	let mut zip = ZipWriter::new_stream(writer);

	let files = append_tree(&mut zip, session_dir, session_dir)?;
	debug!(target = "nodelink.transfer", files, dir = %session_dir.display(), "session files archived");

	if let Some(side_file) = side_file {
		append_side_file(&mut zip, side_file)?;
	}

	let mut writer = zip.finish().map_err(io::Error::other)?.into_inner();
	writer.flush()?;
	Ok(writer)
}

/// Depth-first walk adding each regular file by its `/`-separated path relative to `root`.
fn append_tree<W: Write>(zip: &mut ZipWriter<zip::write::StreamWriter<W>>, root: &Path, dir: &Path) -> io::Result<usize> {
	let mut entries = std::fs::read_dir(dir)?.collect::<io::Result<Vec<_>>>()?;
	entries.sort_by_key(|entry| entry.file_name());

	let mut files = 0;
	for entry in entries {
		let path = entry.path();
		let file_type = entry.file_type()?;
		if file_type.is_dir() {
			files += append_tree(zip, root, &path)?;
		} else if file_type.is_file() {
			let relative = path.strip_prefix(root).map_err(io::Error::other)?;
			let name = relative
				.components()
				.map(|component| component.as_os_str().to_string_lossy())
				.collect::<Vec<_>>()
				.join("/");
			append_file(zip, &name, &mut File::open(&path)?)?;
			files += 1;
		}
	}
	Ok(files)
}

fn append_file<W: Write>(zip: &mut ZipWriter<zip::write::StreamWriter<W>>, name: &str, file: &mut File) -> io::Result<()> {
	let metadata = file.metadata()?;
	let modified = metadata.modified().map(zip_datetime).unwrap_or_default();
	let options = SimpleFileOptions::default()
		.compression_method(CompressionMethod::Deflated)
		.last_modified_time(modified)
		.large_file(metadata.len() >= u64::from(u32::MAX));

	zip.start_file(name, options).map_err(io::Error::other)?;
	io::copy(file, zip)?;
	Ok(())
}

/// Adds the side file when it can be opened. A missing file is not an error.
fn append_side_file<W: Write>(zip: &mut ZipWriter<zip::write::StreamWriter<W>>, path: &Path) -> io::Result<()> {
	let Some(name) = path.file_name() else {
		return Ok(());
	};
	let mut file = match File::open(path) {
		Ok(file) => file,
		Err(err) if err.kind() == io::ErrorKind::NotFound => {
			debug!(target = "nodelink.transfer", path = %path.display(), "no side file to include");
			return Ok(());
		}
		Err(err) => {
			warn!(target = "nodelink.transfer", path = %path.display(), error = %err, "side file skipped");
			return Ok(());
		}
	};
	append_file(zip, &name.to_string_lossy(), &mut file)
}

/// ZIP timestamps are UTC calendar fields at two-second resolution. Times
/// before 1980 clamp to the format's epoch.
pub(crate) fn zip_datetime(time: SystemTime) -> DateTime {
	let secs = time.duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0);
	let (year, month, day) = civil_from_days((secs / 86_400) as i64);
	let of_day = secs % 86_400;
	let (hour, minute, second) = ((of_day / 3600) as u8, (of_day % 3600 / 60) as u8, (of_day % 60) as u8);
	u16::try_from(year)
		.ok()
		.and_then(|year| DateTime::from_date_and_time(year, month, day, hour, minute, second).ok())
		.unwrap_or_default()
}

/// Days since 1970-01-01 to a proleptic Gregorian (year, month, day).
fn civil_from_days(days: i64) -> (i64, u8, u8) {
	let z = days + 719_468;
	let era = z.div_euclid(146_097);
	let doe = z.rem_euclid(146_097);
	let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
	let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
	let mp = (5 * doy + 2) / 153;
	let day = (doy - (153 * mp + 2) / 5 + 1) as u8;
	let month = (if mp < 10 { mp + 3 } else { mp - 9 }) as u8;
	let year = yoe + era * 400 + i64::from(month <= 2);
	(year, month, day)
}

/// Socket timeouts for one transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferTimeouts {
	pub connect: Duration,
	pub io: Duration,
}

impl Default for TransferTimeouts {
	fn default() -> Self {
		Self {
			connect: Duration::from_secs(2),
			io: Duration::from_secs(5),
		}
	}
}

fn connect(host: &str, port: u16, timeout: Duration) -> Result<TcpStream, TransferError> {
	let endpoint = format!("{host}:{port}");
	let addrs: Vec<SocketAddr> = (host, port)
		.to_socket_addrs()
		.map_err(|err| TransferError::Resolve(format!("{endpoint}: {err}")))?
		.collect();
	if addrs.is_empty() {
		return Err(TransferError::Resolve(endpoint));
	}

	let mut last_error = None;
	for addr in addrs {
		match TcpStream::connect_timeout(&addr, timeout) {
			Ok(stream) => return Ok(stream),
			Err(err) => last_error = Some(err),
		}
	}
	Err(TransferError::Connect {
		endpoint,
		reason: last_error.map(|err| err.to_string()).unwrap_or_default(),
	})
}

/// Connects to the receiver, sends the header and the archive, and returns
/// the number of bytes written. `sent` is updated as bytes go out.
pub fn send_session(
	host: &str,
	port: u16,
	header: &TransferHeader,
	session_dir: &Path,
	side_file: Option<&Path>,
	timeouts: TransferTimeouts,
	sent: &AtomicU64,
) -> Result<u64, TransferError> {
	let stream = connect(host, port, timeouts.connect)?;
	stream.set_read_timeout(Some(timeouts.io))?;
	stream.set_write_timeout(Some(timeouts.io))?;
	stream.set_nodelay(true)?;

	let mut writer = BufWriter::new(CountingWriter {
		inner: &stream,
		written: sent,
	});
	writer.write_all(header.to_line()?.as_bytes())?;
	let mut writer = write_archive(writer, session_dir, side_file)?;
	writer.flush()?;
	drop(writer);

	if let Err(err) = stream.shutdown(Shutdown::Write) {
		debug!(target = "nodelink.transfer", error = %err, "socket shutdown failed");
	}
	Ok(sent.load(Ordering::Relaxed))
}
