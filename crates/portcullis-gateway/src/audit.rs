//! Audit sink.
//!
//! Batched append-only JSON-lines log of every verdict. Producers enqueue
//! records onto a bounded queue; a background writer drains it and flushes
//! either on the configured interval or when the batch reaches the high
//! watermark, whichever comes first.
//!
//! Failure policy: write errors are retried with bounded backoff and the
//! failed batch is retained, never dropped. Sustained failure flips the
//! sink into a degraded state surfaced through [`AuditSink::is_degraded`]
//! while the gateway keeps serving. When the queue saturates, producers
//! block briefly on the bounded channel rather than lose records. Shutdown
//! drains and flushes before returning.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use portcullis_types::analysis::{AuditRecord, Verdict};
use portcullis_types::config::AuditConfig;
use portcullis_types::errors::GatewayError;

/// Write retry attempts per flush before declaring the sink degraded.
const FLUSH_ATTEMPTS: u32 = 3;

/// Base backoff between write retries.
const BACKOFF_BASE: Duration = Duration::from_millis(50);

/// Backoff ceiling.
const BACKOFF_CAP: Duration = Duration::from_secs(2);

/// Counters exposed by the sink.
#[derive(Debug, Clone, Serialize)]
pub struct AuditStats {
    /// Records successfully written to disk.
    pub records_written: u64,
    /// Individual write attempts that failed.
    pub write_errors: u64,
    /// Records currently queued in memory.
    pub queued: usize,
}

/// Pagination and filters for the read surface.
#[derive(Debug, Clone, Default)]
pub struct AuditQuery {
    /// Maximum records to return (0 means no limit).
    pub limit: usize,
    /// Records to skip from the most recent end.
    pub offset: usize,
    /// Only records with this verdict.
    pub verdict: Option<Verdict>,
    /// Only records finalized at or after this time.
    pub since: Option<DateTime<Utc>>,
}

struct SinkShared {
    degraded: AtomicBool,
    records_written: AtomicU64,
    write_errors: AtomicU64,
}

/// Batched append-only audit sink.
pub struct AuditSink {
    tx: Mutex<Option<mpsc::Sender<AuditRecord>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
    shared: Arc<SinkShared>,
    queue_capacity: usize,
    log_path: PathBuf,
}

impl AuditSink {
    /// Create the log directory, spawn the background writer, and return the
    /// producer-side handle.
    pub fn spawn(config: &AuditConfig) -> Result<Self, GatewayError> {
        let log_path = PathBuf::from(&config.log_path);
        if let Some(parent) = log_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    GatewayError::Audit(format!(
                        "failed to create audit directory {}: {e}",
                        parent.display()
                    ))
                })?;
            }
        }

        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let shared = Arc::new(SinkShared {
            degraded: AtomicBool::new(false),
            records_written: AtomicU64::new(0),
            write_errors: AtomicU64::new(0),
        });

        let writer = tokio::spawn(writer_loop(
            rx,
            log_path.clone(),
            Duration::from_millis(config.flush_interval_ms.max(1)),
            config.high_watermark.max(1),
            shared.clone(),
        ));

        info!(path = %log_path.display(), "audit sink started");

        Ok(Self {
            tx: Mutex::new(Some(tx)),
            writer: Mutex::new(Some(writer)),
            shared,
            queue_capacity: config.queue_capacity.max(1),
            log_path,
        })
    }

    /// Enqueue a record.
    ///
    /// Blocks (bounded by queue drain) when the queue is saturated rather
    /// than dropping the record.
    pub async fn record(&self, record: AuditRecord) {
        let tx = {
            let guard = match self.tx.lock() {
                Ok(g) => g,
                Err(poisoned) => poisoned.into_inner(),
            };
            guard.clone()
        };
        match tx {
            Some(tx) => {
                if tx.send(record).await.is_err() {
                    error!("audit writer is gone, record lost");
                    self.shared.degraded.store(true, Ordering::Relaxed);
                }
            }
            None => {
                error!("audit sink is shut down, record lost");
                self.shared.degraded.store(true, Ordering::Relaxed);
            }
        }
    }

    /// Whether the sink is failing to persist records.
    pub fn is_degraded(&self) -> bool {
        self.shared.degraded.load(Ordering::Relaxed)
    }

    /// Counter snapshot for the health surface.
    pub fn stats(&self) -> AuditStats {
        let queued = {
            let guard = match self.tx.lock() {
                Ok(g) => g,
                Err(poisoned) => poisoned.into_inner(),
            };
            guard
                .as_ref()
                .map(|tx| self.queue_capacity - tx.capacity())
                .unwrap_or(0)
        };
        AuditStats {
            records_written: self.shared.records_written.load(Ordering::Relaxed),
            write_errors: self.shared.write_errors.load(Ordering::Relaxed),
            queued,
        }
    }

    /// Flush everything and stop the writer. Idempotent.
    pub async fn shutdown(&self) {
        let tx = {
            let mut guard = match self.tx.lock() {
                Ok(g) => g,
                Err(poisoned) => poisoned.into_inner(),
            };
            guard.take()
        };
        drop(tx);

        let writer = {
            let mut guard = match self.writer.lock() {
                Ok(g) => g,
                Err(poisoned) => poisoned.into_inner(),
            };
            guard.take()
        };
        if let Some(handle) = writer {
            let _ = handle.await;
        }
        info!("audit sink shut down");
    }

    /// Paginated query over the on-disk log, most recent records first.
    ///
    /// Records still queued in memory are not visible until flushed.
    pub async fn query(&self, query: &AuditQuery) -> Result<Vec<AuditRecord>, GatewayError> {
        let content = match tokio::fs::read_to_string(&self.log_path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(GatewayError::Audit(format!(
                    "failed to read audit log: {e}"
                )))
            }
        };

        let matches = content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| serde_json::from_str::<AuditRecord>(line).ok())
            .filter(|record| match query.verdict {
                Some(verdict) => record.verdict == verdict,
                None => true,
            })
            .filter(|record| match query.since {
                Some(since) => record.finalized_at >= since,
                None => true,
            });

        let mut results: Vec<AuditRecord> = matches.collect();
        results.reverse();

        let results: Vec<AuditRecord> = results
            .into_iter()
            .skip(query.offset)
            .take(if query.limit == 0 {
                usize::MAX
            } else {
                query.limit
            })
            .collect();

        Ok(results)
    }
}

/// Background drain loop: batch, flush on interval or watermark, retry on
/// error, final flush on channel close.
async fn writer_loop(
    mut rx: mpsc::Receiver<AuditRecord>,
    path: PathBuf,
    flush_interval: Duration,
    high_watermark: usize,
    shared: Arc<SinkShared>,
) {
    let mut batch: Vec<AuditRecord> = Vec::new();
    let mut ticker = tokio::time::interval(flush_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            received = rx.recv() => match received {
                Some(record) => {
                    batch.push(record);
                    if batch.len() >= high_watermark {
                        flush(&path, &mut batch, &shared).await;
                    }
                }
                None => {
                    flush(&path, &mut batch, &shared).await;
                    debug!("audit writer exiting");
                    return;
                }
            },
            _ = ticker.tick() => {
                if !batch.is_empty() {
                    flush(&path, &mut batch, &shared).await;
                }
            }
        }
    }
}

/// Append the batch as JSON lines. On success the batch is cleared; on
/// sustained failure it is retained for the next flush trigger and the sink
/// is marked degraded.
async fn flush(path: &Path, batch: &mut Vec<AuditRecord>, shared: &SinkShared) {
    if batch.is_empty() {
        return;
    }

    let mut payload = Vec::with_capacity(batch.len() * 256);
    for record in batch.iter() {
        match serde_json::to_vec(record) {
            Ok(line) => {
                payload.extend_from_slice(&line);
                payload.push(b'\n');
            }
            Err(e) => error!(error = %e, "unserializable audit record skipped"),
        }
    }

    for attempt in 0..FLUSH_ATTEMPTS {
        match append(path, &payload).await {
            Ok(()) => {
                shared
                    .records_written
                    .fetch_add(batch.len() as u64, Ordering::Relaxed);
                shared.degraded.store(false, Ordering::Relaxed);
                batch.clear();
                return;
            }
            Err(e) => {
                shared.write_errors.fetch_add(1, Ordering::Relaxed);
                warn!(attempt, error = %e, "audit write failed");
                let backoff = BACKOFF_BASE
                    .saturating_mul(1u32 << attempt.min(5))
                    .min(BACKOFF_CAP);
                tokio::time::sleep(backoff).await;
            }
        }
    }

    // Batch retained; the next interval tick or watermark hit retries it.
    shared.degraded.store(true, Ordering::Relaxed);
    error!(
        retained = batch.len(),
        "audit sink degraded, batch retained for retry"
    );
}

async fn append(path: &Path, payload: &[u8]) -> std::io::Result<()> {
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(payload).await?;
    file.flush().await?;
    Ok(())
}
