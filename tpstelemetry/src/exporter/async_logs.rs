use super::{Exporter, LogExporter};
use crate::error::{ExportError, ExportResult};
use crate::runtime::{self, BackgroundTask};
use crate::self_metrics::{signal, SelfMetrics};
use crate::{tps_debug, tps_warn};
use opentelemetry_proto::tonic::logs::v1::LogRecord;
use serde::Deserialize;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::SendTimeoutError, error::TrySendError};

/// Settings of [`AsyncLogExporter`].
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct AsyncLogConfig {
    /// Number of worker tasks, at least one.
    pub workers: usize,
    /// Batches each worker can hold before the queue is full.
    pub queue_size: usize,
    /// Wait for room instead of dropping when a queue is full.
    pub block: bool,
    /// Timeout of each export issued by a worker, zero for none.
    #[serde(with = "crate::config::duration_ms")]
    pub export_timeout: Duration,
}

impl Default for AsyncLogConfig {
    fn default() -> Self {
        AsyncLogConfig {
            workers: 4,
            queue_size: 64,
            block: false,
            export_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Default)]
enum Phase {
    #[default]
    Idle,
    Running {
        queues: Vec<mpsc::Sender<Vec<LogRecord>>>,
        tasks: Vec<BackgroundTask>,
    },
    Stopped,
}

/// Hands log batches to worker tasks so `export` returns without waiting for
/// the collector.
///
/// Batches are spread round-robin over the workers' bounded queues. When a
/// queue is full the batch is dropped and counted in `dropped_total{signal="logs"}`,
/// or with `block` set the caller waits for room up to its timeout.
pub struct AsyncLogExporter {
    inner: Arc<LogExporter>,
    config: AsyncLogConfig,
    next: AtomicUsize,
    phase: Mutex<Phase>,
    metrics: SelfMetrics,
}

impl fmt::Debug for AsyncLogExporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncLogExporter")
            .field("inner", &self.inner)
            .field("config", &self.config)
            .finish()
    }
}

impl AsyncLogExporter {
    /// Wraps `inner`.
    pub fn new(inner: LogExporter, config: AsyncLogConfig) -> Self {
        Self::with_self_metrics(inner, config, SelfMetrics::global().clone())
    }

    /// Wraps `inner`, counting drops into `metrics`.
    pub fn with_self_metrics(inner: LogExporter, config: AsyncLogConfig, metrics: SelfMetrics) -> Self {
        AsyncLogExporter {
            inner: Arc::new(inner),
            config,
            next: AtomicUsize::new(0),
            phase: Mutex::new(Phase::Idle),
            metrics,
        }
    }

    fn pick_queue(&self) -> Result<mpsc::Sender<Vec<LogRecord>>, ExportError> {
        let phase = self.phase.lock().map_err(|_| ExportError::Stopped)?;
        match &*phase {
            Phase::Idle => Err(ExportError::NotStarted),
            Phase::Stopped => Err(ExportError::Stopped),
            Phase::Running { queues, .. } => {
                let index = self.next.fetch_add(1, Ordering::Relaxed) % queues.len();
                Ok(queues[index].clone())
            }
        }
    }

    fn drop_batch(&self, records: usize) {
        self.metrics.dropped(signal::LOGS, records as u64);
        tps_warn!(name: "AsyncLogExporter.QueueFull", dropped = records);
    }
}

async fn worker(
    inner: Arc<LogExporter>,
    mut queue: mpsc::Receiver<Vec<LogRecord>>,
    timeout: Option<Duration>,
) {
    while let Some(batch) = queue.recv().await {
        if let Err(err) = inner.export(batch, timeout).await {
            tps_debug!(name: "AsyncLogExporter.ExportFailed", error = format!("{err}"));
        }
    }
}

impl Exporter for AsyncLogExporter {
    type Item = LogRecord;

    async fn start(&self) -> ExportResult {
        {
            let phase = self.phase.lock().map_err(|_| ExportError::Stopped)?;
            match &*phase {
                Phase::Running { .. } => return Err(ExportError::AlreadyStarted),
                Phase::Stopped => return Err(ExportError::Stopped),
                Phase::Idle => {}
            }
        }
        self.inner.start().await?;

        let timeout = (!self.config.export_timeout.is_zero()).then_some(self.config.export_timeout);
        let (queues, tasks): (Vec<_>, Vec<_>) = (0..self.config.workers.max(1))
            .map(|_| {
                let (tx, rx) = mpsc::channel(self.config.queue_size.max(1));
                let task = runtime::spawn("tps-async-log-worker", worker(self.inner.clone(), rx, timeout));
                (tx, task)
            })
            .unzip();

        let mut phase = self.phase.lock().map_err(|_| ExportError::Stopped)?;
        *phase = Phase::Running { queues, tasks };
        Ok(())
    }

    async fn export(&self, batch: Vec<LogRecord>, timeout: Option<Duration>) -> ExportResult {
        if batch.is_empty() {
            return Ok(());
        }
        let queue = self.pick_queue()?;
        let records = batch.len();

        if !self.config.block {
            return match queue.try_send(batch) {
                Ok(()) => Ok(()),
                Err(TrySendError::Full(_)) => {
                    self.drop_batch(records);
                    Ok(())
                }
                Err(TrySendError::Closed(_)) => Err(ExportError::Stopped),
            };
        }

        match timeout {
            Some(timeout) => match queue.send_timeout(batch, timeout).await {
                Ok(()) => Ok(()),
                Err(SendTimeoutError::Timeout(_)) => {
                    self.drop_batch(records);
                    Err(ExportError::Timeout(timeout))
                }
                Err(SendTimeoutError::Closed(_)) => Err(ExportError::Stopped),
            },
            None => queue.send(batch).await.map_err(|_| ExportError::Stopped),
        }
    }

    async fn shutdown(&self) -> ExportResult {
        let previous = {
            let mut phase = self.phase.lock().map_err(|_| ExportError::Stopped)?;
            std::mem::replace(&mut *phase, Phase::Stopped)
        };
        if let Phase::Running { queues, tasks } = previous {
            // closing the queues lets the workers drain and exit
            drop(queues);
            for task in tasks {
                if let Err(err) = task.join().await {
                    tps_warn!(name: "AsyncLogExporter.WorkerLost", error = err);
                }
            }
        }
        self.inner.shutdown().await
    }
}
