//! Per-execution-log batching writer (spec.md §4.8). Grounded on the
//! teacher's `idle_monitor.rs` ticker-loop shape (`tokio::time::interval`
//! driving periodic work) combined with `stream_json.rs`'s `LineBuffer`
//! accumulate-then-flush idiom, recombined into the batched append
//! contract spec.md requires: a bounded line buffer flushed either at
//! batch size or on a 1s ticker, with one `AppendLog` call per flush.

use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration};

use crate::models::ExecutionLogId;
use crate::repositories::ExecutionLogRepository;

const MAX_FLUSH_BYTES: usize = 10 * 1024 * 1024;
const TRUNCATION_MARKER: &str = "\n...[truncated, flush exceeded 10MiB]...\n";

struct Inner {
    buffer: Mutex<Vec<String>>,
}

/// Cheap to clone: every clone shares the same buffer, flush channel, and
/// background flusher task. `close` is idempotent across clones — the
/// first caller joins the flusher, later callers observe it already gone.
#[derive(Clone)]
pub struct BatchLogSink {
    inner: Arc<Inner>,
    flush_tx: mpsc::UnboundedSender<FlushReason>,
    flusher: Arc<Mutex<Option<JoinHandle<()>>>>,
    batch_size: usize,
}

enum FlushReason {
    Tick,
    Close,
}

impl BatchLogSink {
    pub fn new<R>(repo: Arc<R>, exec_log_id: ExecutionLogId, batch_size: usize, flush_interval: Duration) -> Self
    where
        R: ExecutionLogRepository + 'static,
    {
        let inner = Arc::new(Inner {
            buffer: Mutex::new(Vec::new()),
        });
        let (flush_tx, mut flush_rx) = mpsc::unbounded_channel::<FlushReason>();

        let ticker_tx = flush_tx.clone();
        tokio::spawn(async move {
            let mut tick = interval(flush_interval);
            tick.tick().await; // first tick fires immediately; skip it
            loop {
                tick.tick().await;
                if ticker_tx.send(FlushReason::Tick).is_err() {
                    break;
                }
            }
        });

        let flusher_inner = inner.clone();
        let flusher = tokio::spawn(async move {
            while let Some(reason) = flush_rx.recv().await {
                flush_once(&flusher_inner, &repo, exec_log_id).await;
                if matches!(reason, FlushReason::Close) {
                    break;
                }
            }
        });

        Self {
            inner,
            flush_tx,
            flusher: Arc::new(Mutex::new(Some(flusher))),
            batch_size,
        }
    }

    /// Append a line to the buffer. Flushes immediately if the buffer has
    /// reached `batch_size`.
    pub async fn append(&self, line: String) {
        let should_flush = {
            let mut buf = self.inner.buffer.lock().await;
            buf.push(line);
            buf.len() >= self.batch_size
        };
        if should_flush {
            let _ = self.flush_tx.send(FlushReason::Tick);
        }
    }

    /// Stops the ticker, performs a final flush, and joins the flusher.
    /// Safe to call from any clone; only the first call actually waits.
    pub async fn close(&self) {
        let _ = self.flush_tx.send(FlushReason::Close);
        let handle = self.flusher.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

async fn flush_once<R: ExecutionLogRepository>(inner: &Inner, repo: &R, exec_log_id: ExecutionLogId) {
    let lines = {
        let mut buf = inner.buffer.lock().await;
        if buf.is_empty() {
            return;
        }
        std::mem::take(&mut *buf)
    };
    let mut blob = lines.concat();
    if blob.len() > MAX_FLUSH_BYTES {
        blob.truncate(MAX_FLUSH_BYTES);
        blob.push_str(TRUNCATION_MARKER);
    }
    if let Err(e) = repo.append_log(exec_log_id, &blob).await {
        tracing::error!(exec_log_id, error = %e, "failed to append execution log batch");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repositories::testing::InMemoryRepos;
    use std::sync::Arc;

    #[tokio::test]
    async fn appending_fewer_lines_than_batch_size_flushes_on_close() {
        let repo = Arc::new(InMemoryRepos::new());
        repo.logs.lock().unwrap().insert(
            1,
            crate::models::ExecutionLog {
                id: 1,
                conversation_id: 1,
                execution_logs: String::new(),
                docker_command: None,
                error_message: None,
                started_at: None,
                completed_at: None,
            },
        );
        let sink = BatchLogSink::new(repo.clone(), 1, 50, Duration::from_secs(3600));
        for i in 0..10 {
            sink.append(format!("line {i}\n")).await;
        }
        sink.close().await;

        let log = repo.logs.lock().unwrap().get(&1).unwrap().clone();
        let count = log.execution_logs.lines().count();
        assert_eq!(count, 10);
        for i in 0..10 {
            assert!(log.execution_logs.contains(&format!("line {i}")));
        }
    }

    #[tokio::test]
    async fn reaching_batch_size_flushes_immediately() {
        let repo = Arc::new(InMemoryRepos::new());
        repo.logs.lock().unwrap().insert(
            1,
            crate::models::ExecutionLog {
                id: 1,
                conversation_id: 1,
                execution_logs: String::new(),
                docker_command: None,
                error_message: None,
                started_at: None,
                completed_at: None,
            },
        );
        let sink = BatchLogSink::new(repo.clone(), 1, 3, Duration::from_secs(3600));
        for i in 0..3 {
            sink.append(format!("line {i}\n")).await;
        }
        // Give the background flusher a moment to process the signal.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let log = repo.logs.lock().unwrap().get(&1).unwrap().clone();
        assert_eq!(log.execution_logs.lines().count(), 3);
        sink.close().await;
    }

    #[tokio::test]
    async fn n_lines_through_sink_produce_exactly_n_lines_in_order() {
        let repo = Arc::new(InMemoryRepos::new());
        repo.logs.lock().unwrap().insert(
            1,
            crate::models::ExecutionLog {
                id: 1,
                conversation_id: 1,
                execution_logs: String::new(),
                docker_command: None,
                error_message: None,
                started_at: None,
                completed_at: None,
            },
        );
        let sink = BatchLogSink::new(repo.clone(), 1, 7, Duration::from_millis(20));
        const N: usize = 123;
        for i in 0..N {
            sink.append(format!("[{i:04}] line\n")).await;
        }
        sink.close().await;

        let log = repo.logs.lock().unwrap().get(&1).unwrap().clone();
        let lines: Vec<&str> = log.execution_logs.lines().collect();
        assert_eq!(lines.len(), N);
        for (i, line) in lines.iter().enumerate() {
            assert!(line.starts_with(&format!("[{i:04}]")));
        }
    }
}
