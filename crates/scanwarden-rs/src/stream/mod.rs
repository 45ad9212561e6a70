//! Incremental tailing of job log artifacts.
//!
//! Each call to [`tail_log`] owns its own cursor, so any number of observers
//! can follow the same job without affecting one another.

use std::{
    io::SeekFrom,
    path::{Path, PathBuf},
    time::Duration,
};

use async_stream::stream;
use futures::Stream;
use tokio::{
    fs::File,
    io::{AsyncReadExt, AsyncSeekExt},
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy)]
pub struct TailOptions {
    pub poll_interval: Duration,
    /// How long to wait for the artifact to appear before giving up.
    pub open_grace: Duration,
}

impl Default for TailOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            open_grace: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogEvent {
    Chunk(String),
    /// The artifact never appeared. Terminal.
    NotFound(String),
    /// The artifact disappeared while being followed. Terminal.
    Closed,
}

impl LogEvent {
    /// Text carried in the event's `data` field.
    pub fn payload(&self) -> String {
        match self {
            Self::Chunk(text) => text.clone(),
            Self::NotFound(job_id) => format!("Log file not found for {job_id}"),
            Self::Closed => "log closed".to_string(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Chunk(_))
    }
}

/// Follows `path` from the beginning, emitting each newly appended region
/// as one [`LogEvent::Chunk`]. Stops when the artifact goes away, when
/// `cancel` fires, or when the stream is dropped.
pub fn tail_log(
    job_id: String,
    path: PathBuf,
    opts: TailOptions,
    cancel: CancellationToken,
) -> impl Stream<Item = LogEvent> + Send + 'static {
    stream! {
        let deadline = Instant::now() + opts.open_grace;
        while !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            if Instant::now() >= deadline {
                debug!(job_id = %job_id, "log artifact not found");
                yield LogEvent::NotFound(job_id.clone());
                return;
            }
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(opts.poll_interval) => {}
            }
        }

        let mut cursor: u64 = 0;
        let mut carry: Vec<u8> = Vec::new();
        loop {
            let len = match tokio::fs::metadata(&path).await {
                Ok(meta) => meta.len(),
                Err(e) => {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        warn!(job_id = %job_id, error = %e, "log artifact unreadable");
                    }
                    yield LogEvent::Closed;
                    return;
                }
            };
            if len < cursor {
                // truncated underneath us; start over
                cursor = 0;
                carry.clear();
            }
            if len > cursor {
                match read_range(&path, cursor, len - cursor).await {
                    Ok(bytes) => {
                        cursor += bytes.len() as u64;
                        carry.extend_from_slice(&bytes);
                        let text = take_utf8(&mut carry);
                        if !text.is_empty() {
                            yield LogEvent::Chunk(text);
                        }
                    }
                    Err(e) => {
                        if e.kind() != std::io::ErrorKind::NotFound {
                            warn!(job_id = %job_id, error = %e, "log artifact unreadable");
                        }
                        yield LogEvent::Closed;
                        return;
                    }
                }
            }
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(opts.poll_interval) => {}
            }
        }
    }
}

async fn read_range(path: &Path, start: u64, len: u64) -> std::io::Result<Vec<u8>> {
    let mut file = File::open(path).await?;
    file.seek(SeekFrom::Start(start)).await?;
    let mut buf = Vec::with_capacity(len as usize);
    file.take(len).read_to_end(&mut buf).await?;
    Ok(buf)
}

/// Drains the longest valid UTF-8 prefix of `buf`. An incomplete sequence
/// at the end stays for the next read; invalid bytes are replaced.
fn take_utf8(buf: &mut Vec<u8>) -> String {
    match std::str::from_utf8(buf) {
        Ok(text) => {
            let text = text.to_string();
            buf.clear();
            text
        }
        Err(e) if e.error_len().is_none() => {
            let rest = buf.split_off(e.valid_up_to());
            let text = String::from_utf8_lossy(buf).into_owned();
            *buf = rest;
            text
        }
        Err(_) => {
            let text = String::from_utf8_lossy(buf).into_owned();
            buf.clear();
            text
        }
    }
}

#[cfg(test)]
mod tests {
    use futures::{pin_mut, StreamExt};
    use tokio::io::AsyncWriteExt;

    use super::*;

    fn fast() -> TailOptions {
        TailOptions {
            poll_interval: Duration::from_millis(10),
            open_grace: Duration::from_millis(50),
        }
    }

    async fn append(path: &PathBuf, bytes: &[u8]) {
        let mut f = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .unwrap();
        f.write_all(bytes).await.unwrap();
        f.flush().await.unwrap();
    }

    #[test]
    fn incomplete_sequences_are_carried() {
        let mut buf = vec![b'a', 0xC3];
        assert_eq!(take_utf8(&mut buf), "a");
        assert_eq!(buf, vec![0xC3]);
        buf.extend_from_slice(&[0xA9, b'!']);
        assert_eq!(take_utf8(&mut buf), "é!");
        assert!(buf.is_empty());
    }

    #[test]
    fn invalid_bytes_are_replaced_not_held() {
        let mut buf = vec![b'a', 0xFF, b'b'];
        assert_eq!(take_utf8(&mut buf), "a\u{FFFD}b");
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn observers_have_independent_cursors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("job.log");
        append(&path, b"hello\n").await;

        let first = tail_log("job".into(), path.clone(), fast(), CancellationToken::new());
        let second = tail_log("job".into(), path.clone(), fast(), CancellationToken::new());
        pin_mut!(first);
        pin_mut!(second);

        assert_eq!(first.next().await, Some(LogEvent::Chunk("hello\n".into())));
        append(&path, b"world\n").await;
        assert_eq!(first.next().await, Some(LogEvent::Chunk("world\n".into())));

        // the second observer starts from the beginning regardless
        assert_eq!(second.next().await, Some(LogEvent::Chunk("hello\nworld\n".into())));
    }

    #[tokio::test]
    async fn missing_artifact_yields_one_terminal_event() {
        let dir = tempfile::tempdir().unwrap();
        let events: Vec<LogEvent> = tail_log(
            "ghost".into(),
            dir.path().join("ghost.log"),
            fast(),
            CancellationToken::new(),
        )
        .collect()
        .await;
        assert_eq!(events, vec![LogEvent::NotFound("ghost".into())]);
        assert_eq!(events[0].payload(), "Log file not found for ghost");
    }

    #[tokio::test]
    async fn removal_closes_the_stream() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("job.log");
        append(&path, b"line\n").await;

        let s = tail_log("job".into(), path.clone(), fast(), CancellationToken::new());
        pin_mut!(s);
        assert_eq!(s.next().await, Some(LogEvent::Chunk("line\n".into())));
        tokio::fs::remove_file(&path).await.unwrap();
        assert_eq!(s.next().await, Some(LogEvent::Closed));
        assert_eq!(s.next().await, None);
    }

    #[tokio::test]
    async fn split_characters_arrive_whole() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("job.log");
        append(&path, &[b'a', 0xC3]).await;

        let s = tail_log("job".into(), path.clone(), fast(), CancellationToken::new());
        pin_mut!(s);
        assert_eq!(s.next().await, Some(LogEvent::Chunk("a".into())));
        append(&path, &[0xA9, b'\n']).await;
        assert_eq!(s.next().await, Some(LogEvent::Chunk("é\n".into())));
    }

    #[tokio::test]
    async fn cancellation_ends_the_stream() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("job.log");
        append(&path, b"").await;

        let cancel = CancellationToken::new();
        let s = tail_log("job".into(), path, fast(), cancel.clone());
        pin_mut!(s);
        cancel.cancel();
        assert_eq!(s.next().await, None);
    }
}
