//! Newline-delimited framing over any async byte stream.
//!
//! Every message is one UTF-8 line terminated by `\n`. A trailing `\r` is
//! tolerated on input. Lines longer than the configured maximum are a
//! framing error and the connection should be dropped; there is no way to
//! resynchronise mid-line.

use nodelink_protocol::MAX_LINE_LEN;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::trace;

use crate::error::{Error, Result};


/// Rejects text that cannot be sent as a single frame.
pub fn validate_line(line: &str, max_line_len: usize) -> Result<()> {
	if line.contains('\n') {
		return Err(Error::Framing("message contains an embedded newline".into()));
	}
	if line.len() > max_line_len {
		return Err(Error::Framing(format!("message is {} bytes, limit is {max_line_len}", line.len())));
	}
	Ok(())
}

/// A bidirectional line transport split into independently owned halves.
pub struct LineTransport<R, W> {
	reader: LineReader<R>,
	writer: LineWriter<W>,
}

impl<R, W> LineTransport<R, W>
where
	R: AsyncRead + Unpin,
	W: AsyncWrite + Unpin,
{
	pub fn new(reader: R, writer: W) -> Self {
		Self::with_max_line_len(reader, writer, MAX_LINE_LEN)
	}

	pub fn with_max_line_len(reader: R, writer: W, max_line_len: usize) -> Self {
		Self {
			reader: LineReader::with_max_line_len(reader, max_line_len),
			writer: LineWriter::with_max_line_len(writer, max_line_len),
		}
	}

	/// Splits into reader and writer so they can live on different tasks.
	pub fn into_parts(self) -> (LineReader<R>, LineWriter<W>) {
		(self.reader, self.writer)
	}
}

/// Reads newline-terminated frames.
pub struct LineReader<R> {
	inner: BufReader<R>,
	pending: Vec<u8>,
	max_line_len: usize,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
	pub fn new(reader: R) -> Self {
		Self::with_max_line_len(reader, MAX_LINE_LEN)
	}

	pub fn with_max_line_len(reader: R, max_line_len: usize) -> Self {
		Self {
			inner: BufReader::new(reader),
			pending: Vec::new(),
			max_line_len,
		}
	}

	/// Returns the next line without its terminator, or `None` on a clean EOF.
	///
	/// Cancel safe: bytes of a partially received line are kept across calls,
	/// so this can sit inside `tokio::time::timeout` or `select!`.
	pub async fn next_line(&mut self) -> Result<Option<String>> {
		loop {
			let available = self.inner.fill_buf().await?;
			if available.is_empty() {
				if self.pending.is_empty() {
					return Ok(None);
				}
				return Err(Error::Framing(format!("stream closed after {} bytes of an unterminated line", self.pending.len())));
			}

			let (consumed, complete) = match available.iter().position(|b| *b == b'\n') {
				Some(pos) => {
					self.pending.extend_from_slice(&available[..pos]);
					(pos + 1, true)
				}
				None => {
					self.pending.extend_from_slice(available);
					(available.len(), false)
				}
			};
			self.inner.consume(consumed);

			if self.pending.len() > self.max_line_len {
				let len = self.pending.len();
				self.pending.clear();
				return Err(Error::Framing(format!("line exceeds {} bytes (got at least {len})", self.max_line_len)));
			}

			if complete {
				let mut line = std::mem::take(&mut self.pending);
				if line.last() == Some(&b'\r') {
					line.pop();
				}
				trace!(target = "nodelink.transport", len = line.len(), "line received");
				return Ok(Some(String::from_utf8_lossy(&line).into_owned()));
			}
		}
	}
}

/// Writes newline-terminated frames.
pub struct LineWriter<W> {
	inner: W,
	max_line_len: usize,
}

impl<W: AsyncWrite + Unpin> LineWriter<W> {
	pub fn new(writer: W) -> Self {
		Self::with_max_line_len(writer, MAX_LINE_LEN)
	}

	pub fn with_max_line_len(writer: W, max_line_len: usize) -> Self {
		Self { inner: writer, max_line_len }
	}

	/// Writes `line` plus the terminator as one buffer and flushes.
	pub async fn send_line(&mut self, line: &str) -> Result<()> {
		validate_line(line, self.max_line_len)?;

		let mut frame = Vec::with_capacity(line.len() + 1);
		frame.extend_from_slice(line.as_bytes());
		frame.push(b'\n');

		self.inner.write_all(&frame).await?;
		self.inner.flush().await?;
		trace!(target = "nodelink.transport", len = line.len(), "line sent");
		Ok(())
	}

	pub async fn shutdown(&mut self) -> Result<()> {
		self.inner.shutdown().await?;
		Ok(())
	}

	pub fn into_inner(self) -> W {
		self.inner
	}
}
