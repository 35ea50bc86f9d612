//! Per-channel diagnostic log for transcoder output.
//!
//! ffmpeg rewrites its progress line with `\r`, so output is split into
//! records on either `\n` or `\r`. Each record is appended to
//! `<output_dir>/transcoder.log` and kept in a bounded in-memory ring that
//! backs `tail`.

use std::collections::VecDeque;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Local;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, warn};

/// File name of the diagnostic log inside a channel's output directory.
pub const LOG_FILE_NAME: &str = "transcoder.log";

/// Once the log would grow past this it is moved to `transcoder.log.1` and reopened.
const LOG_ROTATE_BYTES: u64 = 4 * 1024 * 1024;

/// Bounded, tail-queryable log of one channel's transcoder output.
#[derive(Clone)]
pub struct LogSink {
    inner: Arc<LogSinkInner>,
}

struct LogSinkInner {
    channel_id: String,
    path: PathBuf,
    capacity: usize,
    rotate_bytes: u64,
    lines: Mutex<VecDeque<String>>,
}

impl LogSink {
    pub fn new(channel_id: impl Into<String>, output_dir: &Path, capacity: usize) -> Self {
        Self::with_rotate_bytes(channel_id, output_dir, capacity, LOG_ROTATE_BYTES)
    }

    fn with_rotate_bytes(
        channel_id: impl Into<String>,
        output_dir: &Path,
        capacity: usize,
        rotate_bytes: u64,
    ) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Arc::new(LogSinkInner {
                channel_id: channel_id.into(),
                path: output_dir.join(LOG_FILE_NAME),
                capacity,
                rotate_bytes: rotate_bytes.max(1),
                lines: Mutex::new(VecDeque::with_capacity(capacity)),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Record a line in the in-memory ring, evicting the oldest when full.
    pub fn push(&self, line: impl Into<String>) {
        let mut lines = self.inner.lines.lock();
        if lines.len() == self.inner.capacity {
            lines.pop_front();
        }
        lines.push_back(line.into());
    }

    /// Up to `n` most recent lines, oldest first.
    pub fn tail(&self, n: usize) -> Vec<String> {
        let lines = self.inner.lines.lock();
        let skip = lines.len().saturating_sub(n);
        lines.iter().skip(skip).cloned().collect()
    }

    /// Note a lifecycle event (start, exit, restart) in both the ring and the file.
    pub async fn note(&self, message: &str) {
        let line = format!("[{}] {}", Local::now().format("%Y-%m-%dT%H:%M:%S%.3f"), message);
        self.push(line.clone());
        if let Err(e) = self.append(&[line]).await {
            debug!(
                channel_id = %self.inner.channel_id,
                error = %e,
                "Failed to append to transcoder log"
            );
        }
    }

    /// Copy records from `reader` into the sink until it reaches EOF.
    ///
    /// The reader is a transcoder's stderr, so this ends when the process
    /// exits (or closes the stream).
    pub async fn pump<R>(self, reader: R)
    where
        R: AsyncRead + Unpin,
    {
        let mut written = 0u64;
        let mut file = match self.open_for_append().await {
            Ok((file, len)) => {
                written = len;
                Some(file)
            }
            Err(e) => {
                warn!(
                    channel_id = %self.inner.channel_id,
                    path = %self.inner.path.display(),
                    error = %e,
                    "Transcoder log file unavailable, keeping output in memory only"
                );
                None
            }
        };

        let mut records = OutputRecordReader::new(reader);
        loop {
            match records.next_record().await {
                Ok(Some(record)) => {
                    if record.contains("Error") || record.contains("error") {
                        debug!(channel_id = %self.inner.channel_id, "ffmpeg: {}", record);
                    }
                    let mut bytes = record.clone().into_bytes();
                    bytes.push(b'\n');
                    let len = bytes.len() as u64;

                    if written > 0 && written + len > self.inner.rotate_bytes {
                        if let Some(mut f) = file.take() {
                            let _ = f.flush().await;
                            drop(f);
                            match self.rotate_and_reopen().await {
                                Ok((reopened, current)) => {
                                    written = current;
                                    file = Some(reopened);
                                }
                                Err(e) => warn!(
                                    channel_id = %self.inner.channel_id,
                                    error = %e,
                                    "Failed to rotate transcoder log, continuing in memory"
                                ),
                            }
                        }
                    }

                    if let Some(f) = file.as_mut() {
                        match f.write_all(&bytes).await {
                            Ok(()) => written += len,
                            Err(e) => {
                                warn!(
                                    channel_id = %self.inner.channel_id,
                                    error = %e,
                                    "Failed to write transcoder log, continuing in memory"
                                );
                                file = None;
                            }
                        }
                    }
                    self.push(record);
                }
                Ok(None) => break,
                Err(e) => {
                    debug!(
                        channel_id = %self.inner.channel_id,
                        error = %e,
                        "Error reading transcoder output"
                    );
                    break;
                }
            }
        }

        if let Some(mut f) = file {
            let _ = f.flush().await;
        }
    }

    async fn append(&self, lines: &[String]) -> io::Result<()> {
        let (mut file, _) = self.open_for_append().await?;
        for line in lines {
            file.write_all(line.as_bytes()).await?;
            file.write_all(b"\n").await?;
        }
        file.flush().await
    }

    fn rotated_path(&self) -> PathBuf {
        let mut rotated = self.inner.path.as_os_str().to_owned();
        rotated.push(".1");
        PathBuf::from(rotated)
    }

    async fn rotate_and_reopen(&self) -> io::Result<(tokio::fs::File, u64)> {
        tokio::fs::rename(&self.inner.path, self.rotated_path()).await?;
        self.open_for_append().await
    }

    /// Open the log for appending, rotating it first when it has reached the
    /// size limit. Returns the file and its current length.
    async fn open_for_append(&self) -> io::Result<(tokio::fs::File, u64)> {
        let path = &self.inner.path;
        if let Ok(meta) = tokio::fs::metadata(path).await {
            if meta.len() >= self.inner.rotate_bytes {
                tokio::fs::rename(path, self.rotated_path()).await?;
            }
        }

        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        let len = file.metadata().await?.len();
        Ok((file, len))
    }
}

/// Reads an async stream and yields text records delimited by `\n` or `\r`.
struct OutputRecordReader<R> {
    reader: BufReader<R>,
    pending: Vec<u8>,
    scratch: [u8; 4096],
}

impl<R> OutputRecordReader<R>
where
    R: AsyncRead + Unpin,
{
    fn new(reader: R) -> Self {
        Self {
            reader: BufReader::new(reader),
            pending: Vec::new(),
            scratch: [0u8; 4096],
        }
    }

    /// Next non-empty record; consecutive delimiters are skipped.
    async fn next_record(&mut self) -> io::Result<Option<String>> {
        loop {
            if let Some(idx) = self.pending.iter().position(|&b| is_delimiter(b)) {
                let record: Vec<u8> = self.pending.drain(..idx).collect();
                let delimiters = self
                    .pending
                    .iter()
                    .take_while(|&&b| is_delimiter(b))
                    .count();
                self.pending.drain(..delimiters);

                let record = String::from_utf8_lossy(&record).trim().to_string();
                if !record.is_empty() {
                    return Ok(Some(record));
                }
                continue;
            }

            let n = self.reader.read(&mut self.scratch).await?;
            if n == 0 {
                let record = String::from_utf8_lossy(&self.pending).trim().to_string();
                self.pending.clear();
                return Ok((!record.is_empty()).then_some(record));
            }
            self.pending.extend_from_slice(&self.scratch[..n]);
        }
    }
}

fn is_delimiter(b: u8) -> bool {
    matches!(b, b'\n' | b'\r')
}
