//! Console output tailing.
//!
//! The spawned process writes straight into an append-only file, so the
//! supervisor never holds a pipe: output survives supervisor restarts and an
//! adopted orphan can be tailed the same way as a fresh child. A filesystem
//! watcher triggers a read of only the newly appended byte range; there is no
//! polling loop. A transient read error is swallowed and retried on the next
//! change notification.

use std::collections::VecDeque;
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use notify::{RecursiveMode, Watcher as _};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::Result;

/// Per-instance line callback registered by log/chat-parsing collaborators.
pub type LineCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Sink the tailer feeds each complete, already-redacted line into.
pub(crate) type LineSink = Arc<dyn Fn(String) + Send + Sync>;

/// Bounded in-memory ring of recent console lines.
pub struct LogBuffer {
    capacity: usize,
    lines: Mutex<VecDeque<String>>,
}

impl LogBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            lines: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn push(&self, line: String) {
        let mut lines = self.lines.lock().unwrap_or_else(|e| e.into_inner());
        if lines.len() == self.capacity {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    /// Ordered snapshot, oldest first.
    pub fn snapshot(&self) -> Vec<String> {
        let lines = self.lines.lock().unwrap_or_else(|e| e.into_inner());
        lines.iter().cloned().collect()
    }
}

/// Running tailer for one instance's console file. Dropping it stops the
/// watcher and the reader task.
pub(crate) struct LogTailer {
    task: JoinHandle<()>,
}

impl Drop for LogTailer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Start tailing `path`. With `start_at_end` the current contents are
/// skipped, which is what orphan adoption wants.
pub(crate) fn spawn_tailer(path: PathBuf, sink: LineSink, start_at_end: bool) -> Result<LogTailer> {
    let (tx, mut rx) = mpsc::channel::<()>(8);

    let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
        if res.is_ok() {
            // A full channel already has a pending wakeup; dropping the
            // notification is fine because every read drains to EOF.
            let _ = tx.try_send(());
        }
    })?;
    watcher.watch(&path, RecursiveMode::NonRecursive)?;

    let mut offset = if start_at_end {
        std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0)
    } else {
        0
    };

    let task = tokio::spawn(async move {
        // The watcher must live as long as the reader.
        let _watcher = watcher;
        let mut partial = String::new();

        while rx.recv().await.is_some() {
            match read_appended(&path, offset) {
                Ok((chunk, new_offset)) => {
                    offset = new_offset;
                    partial.push_str(&chunk);
                    while let Some(newline) = partial.find('\n') {
                        let line: String = partial.drain(..=newline).collect();
                        let line = line.trim_end_matches(['\n', '\r']);
                        if !line.is_empty() {
                            sink(line.to_string());
                        }
                    }
                }
                Err(e) => {
                    // Retried on the next change notification.
                    log::debug!("Transient console read error on {:?}: {}", path, e);
                }
            }
        }
    });

    Ok(LogTailer { task })
}

/// Read the byte range appended since `offset`. A shrunken file means the log
/// was rotated; reading restarts from the top. Decoding is lossy: a stray
/// invalid byte must not stall the offset and kill tailing for good.
fn read_appended(path: &PathBuf, offset: u64) -> std::io::Result<(String, u64)> {
    let mut file = std::fs::File::open(path)?;
    let len = file.metadata()?.len();
    let start = if len < offset { 0 } else { offset };

    file.seek(SeekFrom::Start(start))?;
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes)?;
    // The offset advances by input bytes, not by the decoded length.
    let consumed = bytes.len() as u64;
    let chunk = String::from_utf8_lossy(&bytes).into_owned();
    Ok((chunk, start + consumed))
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use super::{spawn_tailer, LogBuffer};

    #[test]
    fn ring_buffer_drops_oldest() {
        let buffer = LogBuffer::new(3);
        for i in 0..5 {
            buffer.push(format!("line {i}"));
        }
        assert_eq!(buffer.snapshot(), vec!["line 2", "line 3", "line 4"]);
    }

    #[tokio::test]
    async fn tails_appended_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("console.log");
        std::fs::write(&path, "before\n").unwrap();

        let seen = Arc::new(Mutex::new(Vec::<String>::new()));
        let sink = {
            let seen = Arc::clone(&seen);
            Arc::new(move |line: String| {
                seen.lock().unwrap().push(line);
            })
        };

        let _tailer = spawn_tailer(path.clone(), sink, true).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(file, "first").unwrap();
        writeln!(file, "second").unwrap();
        file.sync_all().unwrap();

        let mut waited = Duration::ZERO;
        loop {
            if seen.lock().unwrap().len() >= 2 {
                break;
            }
            assert!(waited < Duration::from_secs(5), "tailer never saw output");
            tokio::time::sleep(Duration::from_millis(50)).await;
            waited += Duration::from_millis(50);
        }

        let lines = seen.lock().unwrap().clone();
        // Only the appended range is read; pre-existing content is skipped.
        assert_eq!(lines, vec!["first", "second"]);
    }

    #[tokio::test]
    async fn survives_invalid_utf8_in_output() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("console.log");
        std::fs::write(&path, "").unwrap();

        let seen = Arc::new(Mutex::new(Vec::<String>::new()));
        let sink = {
            let seen = Arc::clone(&seen);
            Arc::new(move |line: String| {
                seen.lock().unwrap().push(line);
            })
        };

        let _tailer = spawn_tailer(path.clone(), sink, false).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        // A garbage byte mid-stream must not wedge the reader.
        file.write_all(b"\xff\n").unwrap();
        writeln!(file, "after garbage").unwrap();
        writeln!(file, "still tailing").unwrap();
        file.sync_all().unwrap();

        let mut waited = Duration::ZERO;
        loop {
            let lines = seen.lock().unwrap().clone();
            if lines.iter().any(|l| l == "still tailing") {
                assert!(lines.iter().any(|l| l == "after garbage"));
                break;
            }
            assert!(waited < Duration::from_secs(5), "tailer stalled: {lines:?}");
            tokio::time::sleep(Duration::from_millis(50)).await;
            waited += Duration::from_millis(50);
        }
    }
}
