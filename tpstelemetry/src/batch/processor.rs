use super::BatchConfig;
use crate::error::{BatchError, BatchResult, ExportError, ExportResult};
use crate::exporter::Exporter;
use crate::runtime;
use crate::self_metrics::{BatchTrigger, SelfMetrics};
use crate::{tps_debug, tps_warn};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::mpsc::{self, error::SendTimeoutError, error::TrySendError};
use tokio::sync::oneshot;
use tokio::time::Instant;

/// Messages exchanged between the producers and the worker.
#[allow(clippy::large_enum_variant)]
#[derive(Debug)]
enum BatchMessage<T> {
    /// An item with its encoded size.
    Item(T, usize),
    /// Export what is pending, then acknowledge.
    Flush(oneshot::Sender<()>),
}

type ShutdownReply = oneshot::Sender<ExportResult>;

/// Generic batching core behind the per-signal processors.
///
/// The worker task is the only owner of the pending batch. It starts the
/// exporter before the first export and shuts it down after draining the queue.
pub struct BatchProcessor<T> {
    sender: mpsc::Sender<BatchMessage<T>>,
    stop: Mutex<Option<oneshot::Sender<ShutdownReply>>>,
    is_shutdown: AtomicBool,
    dropped: AtomicUsize,
    blocking: bool,
    signal: &'static str,
    metrics: SelfMetrics,
}

impl<T> fmt::Debug for BatchProcessor<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchProcessor")
            .field("signal", &self.signal)
            .field("blocking", &self.blocking)
            .field("is_shutdown", &self.is_shutdown.load(Ordering::Relaxed))
            .finish()
    }
}

impl<T: Send + 'static> BatchProcessor<T> {
    /// Spawns the worker for `exporter`.
    pub fn new<E>(exporter: E, config: BatchConfig, signal: &'static str, metrics: SelfMetrics) -> Self
    where
        E: Exporter<Item = T>,
    {
        let (sender, receiver) = mpsc::channel(config.max_queue_size.max(1));
        let (stop, stopped) = oneshot::channel();
        let blocking = config.blocking;

        let worker = Worker {
            batch: Vec::with_capacity(config.max_export_batch_size),
            bytes: 0,
            deadline: Instant::now() + config.batch_timeout,
            exporter,
            config,
            signal,
            metrics: metrics.clone(),
        };
        // completion is reported through the shutdown reply
        drop(runtime::spawn("tps-batch-worker", worker.run(receiver, stopped)));

        BatchProcessor {
            sender,
            stop: Mutex::new(Some(stop)),
            is_shutdown: AtomicBool::new(false),
            dropped: AtomicUsize::new(0),
            blocking,
            signal,
            metrics,
        }
    }

    /// Hands `item` to the worker without waiting, unless the processor is
    /// configured as blocking. Ignored after shutdown.
    pub fn submit(&self, item: T, size: usize) {
        if self.is_shutdown.load(Ordering::Relaxed) {
            return;
        }
        let message = BatchMessage::Item(item, size);
        if !self.blocking {
            self.try_submit(message);
            return;
        }

        match Handle::try_current() {
            Err(_) => {
                if self.sender.blocking_send(message).is_err() {
                    tps_debug!(name: "BatchProcessor.QueueClosed", signal = self.signal);
                }
            }
            Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
                let sender = self.sender.clone();
                let sent = tokio::task::block_in_place(|| handle.block_on(sender.send(message)));
                if sent.is_err() {
                    tps_debug!(name: "BatchProcessor.QueueClosed", signal = self.signal);
                }
            }
            // a current-thread runtime cannot wait for its own worker
            Ok(_) => self.try_submit(message),
        }
    }

    /// Hands `item` to the worker, waiting up to `timeout` for room in the queue.
    pub async fn enqueue(&self, item: T, size: usize, timeout: Duration) -> BatchResult {
        if self.is_shutdown.load(Ordering::Relaxed) {
            return Err(BatchError::AlreadyShutdown);
        }
        match self
            .sender
            .send_timeout(BatchMessage::Item(item, size), timeout)
            .await
        {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(_)) => {
                self.record_drop();
                Err(BatchError::Timeout(timeout))
            }
            Err(SendTimeoutError::Closed(_)) => {
                Err(BatchError::WorkerGone("queue closed".to_string()))
            }
        }
    }

    /// Exports everything enqueued before this call.
    pub async fn force_flush(&self, timeout: Duration) -> BatchResult {
        if self.is_shutdown.load(Ordering::Relaxed) {
            return Err(BatchError::AlreadyShutdown);
        }
        let deadline = Instant::now() + timeout;
        let (ack, acked) = oneshot::channel();

        tokio::time::timeout_at(deadline, self.sender.send(BatchMessage::Flush(ack)))
            .await
            .map_err(|_| BatchError::Timeout(timeout))?
            .map_err(|_| BatchError::WorkerGone("queue closed".to_string()))?;

        tokio::time::timeout_at(deadline, acked)
            .await
            .map_err(|_| BatchError::Timeout(timeout))?
            .map_err(|_| BatchError::WorkerGone("flush was not acknowledged".to_string()))
    }

    /// Drains the queue, exports and shuts the exporter down. A second call
    /// returns `Ok`. On timeout the worker keeps draining in the background.
    pub async fn shutdown(&self, timeout: Duration) -> BatchResult {
        if self.is_shutdown.swap(true, Ordering::Relaxed) {
            return Ok(());
        }
        let dropped = self.dropped.load(Ordering::Relaxed);
        if dropped > 0 {
            tps_warn!(name: "BatchProcessor.DroppedOnQueueFull", signal = self.signal, dropped = dropped);
        }

        let stop = self
            .stop
            .lock()
            .map_err(|err| BatchError::WorkerGone(err.to_string()))?
            .take();
        let Some(stop) = stop else {
            return Ok(());
        };
        let (reply, replied) = oneshot::channel();
        stop.send(reply)
            .map_err(|_| BatchError::WorkerGone("worker exited".to_string()))?;

        match tokio::time::timeout(timeout, replied).await {
            Err(_) => Err(BatchError::Timeout(timeout)),
            Ok(Err(_)) => Err(BatchError::WorkerGone("worker exited".to_string())),
            Ok(Ok(result)) => result.map_err(BatchError::from),
        }
    }

    /// Number of items dropped because the queue was full.
    pub fn dropped_count(&self) -> usize {
        self.dropped.load(Ordering::Relaxed)
    }

    fn try_submit(&self, message: BatchMessage<T>) {
        match self.sender.try_send(message) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => self.record_drop(),
            Err(TrySendError::Closed(_)) => {
                tps_debug!(name: "BatchProcessor.QueueClosed", signal = self.signal);
            }
        }
    }

    fn record_drop(&self) {
        self.metrics.dropped(self.signal, 1);
        // The first drop is logged, the total is logged at shutdown.
        if self.dropped.fetch_add(1, Ordering::Relaxed) == 0 {
            tps_warn!(
                name: "BatchProcessor.DroppingStarted",
                signal = self.signal,
                message = "queue full, dropping items until shutdown reports the total"
            );
        }
    }
}

struct Worker<E: Exporter> {
    batch: Vec<E::Item>,
    bytes: usize,
    deadline: Instant,
    exporter: E,
    config: BatchConfig,
    signal: &'static str,
    metrics: SelfMetrics,
}

impl<E: Exporter> Worker<E> {
    async fn run(
        mut self,
        mut receiver: mpsc::Receiver<BatchMessage<E::Item>>,
        mut stopped: oneshot::Receiver<ShutdownReply>,
    ) {
        match self.exporter.start().await {
            Ok(()) | Err(ExportError::AlreadyStarted) => {}
            Err(err) => {
                tps_warn!(name: "BatchProcessor.ExporterStartFailed", signal = self.signal, error = format!("{err}"));
            }
        }
        let timer_enabled = !self.config.batch_timeout.is_zero();

        loop {
            tokio::select! {
                biased;
                reply = &mut stopped => {
                    let result = self.drain(&mut receiver).await;
                    if let Ok(reply) = reply {
                        let _ = reply.send(result);
                    }
                    return;
                }
                message = receiver.recv() => match message {
                    Some(BatchMessage::Item(item, size)) => self.push(item, size).await,
                    Some(BatchMessage::Flush(ack)) => {
                        self.export(BatchTrigger::Flush).await;
                        let _ = ack.send(());
                    }
                    None => {
                        let _ = self.drain(&mut receiver).await;
                        return;
                    }
                },
                _ = tokio::time::sleep_until(self.deadline), if timer_enabled => {
                    self.export(BatchTrigger::Timer).await;
                }
            }
        }
    }

    async fn push(&mut self, item: E::Item, size: usize) {
        self.batch.push(item);
        self.bytes += size;
        if self.batch.len() >= self.config.max_export_batch_size {
            self.export(BatchTrigger::Size).await;
        } else if self.config.max_packet_size > 0 && self.bytes >= self.config.max_packet_size {
            self.export(BatchTrigger::Bytes).await;
        }
    }

    async fn drain(&mut self, receiver: &mut mpsc::Receiver<BatchMessage<E::Item>>) -> ExportResult {
        while let Ok(message) = receiver.try_recv() {
            match message {
                BatchMessage::Item(item, size) => {
                    self.batch.push(item);
                    self.bytes += size;
                    if self.batch.len() >= self.config.max_export_batch_size {
                        self.export(BatchTrigger::Shutdown).await;
                    }
                }
                BatchMessage::Flush(ack) => {
                    self.export(BatchTrigger::Flush).await;
                    let _ = ack.send(());
                }
            }
        }
        self.export(BatchTrigger::Shutdown).await;
        self.exporter.shutdown().await
    }

    async fn export(&mut self, trigger: BatchTrigger) {
        if self.batch.is_empty() {
            self.deadline = Instant::now() + self.config.batch_timeout;
            return;
        }
        let batch = std::mem::replace(
            &mut self.batch,
            Vec::with_capacity(self.config.max_export_batch_size),
        );
        self.bytes = 0;
        let items = batch.len();
        self.metrics.batched(self.signal, trigger);

        let export_timeout = self.config.export_timeout;
        let result = if export_timeout.is_zero() {
            self.exporter.export(batch, None).await
        } else {
            tokio::time::timeout(export_timeout, self.exporter.export(batch, Some(export_timeout)))
                .await
                .unwrap_or(Err(ExportError::Timeout(export_timeout)))
        };

        self.metrics.batch_processed(self.signal, result.is_ok());
        match result {
            Ok(()) => {
                tps_debug!(name: "BatchProcessor.Exported", signal = self.signal, trigger = trigger.as_str(), items = items);
            }
            Err(err) => {
                tps_warn!(name: "BatchProcessor.ExportFailed", signal = self.signal, items = items, error = format!("{err}"));
            }
        }
        self.deadline = Instant::now() + self.config.batch_timeout;
    }
}

#[cfg(test)]
pub(crate) mod test_utils {
    use super::*;
    use std::sync::Arc;

    /// Exporter recording every batch it receives.
    #[derive(Clone, Debug, Default)]
    pub(crate) struct RecordingExporter {
        pub(crate) batches: Arc<Mutex<Vec<Vec<u32>>>>,
        pub(crate) started: Arc<AtomicUsize>,
        pub(crate) shutdowns: Arc<AtomicUsize>,
        pub(crate) fail: bool,
        pub(crate) delay: Option<Duration>,
    }

    impl RecordingExporter {
        pub(crate) fn batch_sizes(&self) -> Vec<usize> {
            self.batches.lock().unwrap().iter().map(Vec::len).collect()
        }

        pub(crate) fn items(&self) -> Vec<u32> {
            self.batches.lock().unwrap().concat()
        }
    }

    impl Exporter for RecordingExporter {
        type Item = u32;

        async fn start(&self) -> ExportResult {
            self.started.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn export(&self, batch: Vec<u32>, _timeout: Option<Duration>) -> ExportResult {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.batches.lock().unwrap().push(batch);
            if self.fail {
                Err(ExportError::from(tonic::Status::invalid_argument("rejected")))
            } else {
                Ok(())
            }
        }

        async fn shutdown(&self) -> ExportResult {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_utils::RecordingExporter;
    use super::*;
    use crate::batch::BatchConfigBuilder;
    use crate::self_metrics::signal;
    use prometheus::Registry;

    fn config(batch_size: usize, queue_size: usize, timeout: Duration) -> BatchConfig {
        BatchConfigBuilder::from(BatchConfig::default())
            .with_max_queue_size(queue_size)
            .with_max_export_batch_size(batch_size)
            .with_batch_timeout(timeout)
            .build()
    }

    fn metrics() -> SelfMetrics {
        SelfMetrics::new(&Registry::new())
    }

    #[tokio::test]
    async fn exports_in_batches_of_max_size() {
        let exporter = RecordingExporter::default();
        let metrics = metrics();
        let processor = BatchProcessor::new(
            exporter.clone(),
            config(10, 100, Duration::from_secs(3600)),
            signal::TRACE,
            metrics.clone(),
        );

        for i in 0..25 {
            processor.submit(i, 1);
        }
        processor.shutdown(Duration::from_secs(5)).await.unwrap();

        // ceil(25 / 10) export calls, order preserved
        assert_eq!(exporter.batch_sizes(), vec![10, 10, 5]);
        assert_eq!(exporter.items(), (0..25).collect::<Vec<_>>());
        assert_eq!(exporter.started.load(Ordering::SeqCst), 1);
        assert_eq!(exporter.shutdowns.load(Ordering::SeqCst), 1);
        assert_eq!(metrics.batch_processed_count(signal::TRACE, true), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exports_on_timer() {
        let exporter = RecordingExporter::default();
        let metrics = metrics();
        let processor = BatchProcessor::new(
            exporter.clone(),
            config(100, 100, Duration::from_millis(200)),
            signal::TRACE,
            metrics.clone(),
        );

        processor.submit(1, 1);
        processor.submit(2, 1);
        tokio::time::sleep(Duration::from_millis(250)).await;

        assert_eq!(exporter.batch_sizes(), vec![2]);
        assert_eq!(metrics.batched_count(signal::TRACE, BatchTrigger::Timer), 1);
        processor.shutdown(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn exports_when_packet_size_is_reached() {
        let exporter = RecordingExporter::default();
        let metrics = metrics();
        let config = BatchConfigBuilder::from(config(100, 100, Duration::from_secs(3600)))
            .with_max_packet_size(100)
            .build();
        let processor = BatchProcessor::new(exporter.clone(), config, signal::LOGS, metrics.clone());

        processor.submit(1, 60);
        processor.submit(2, 60);
        processor.submit(3, 10);
        processor.force_flush(Duration::from_secs(5)).await.unwrap();

        assert_eq!(exporter.batch_sizes(), vec![2, 1]);
        assert_eq!(metrics.batched_count(signal::LOGS, BatchTrigger::Bytes), 1);
        assert_eq!(metrics.batched_count(signal::LOGS, BatchTrigger::Flush), 1);
        processor.shutdown(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test(flavor = "current_thread")]
    async fn full_queue_drops_exactly_the_overflow() {
        let exporter = RecordingExporter::default();
        let metrics = metrics();
        let processor = BatchProcessor::new(
            exporter.clone(),
            config(100, 4, Duration::from_secs(3600)),
            signal::LOGS,
            metrics.clone(),
        );

        // the worker does not run until this task yields
        for i in 0..5 {
            processor.submit(i, 1);
        }
        assert_eq!(processor.dropped_count(), 1);
        assert_eq!(metrics.dropped_count(signal::LOGS), 1);

        processor.shutdown(Duration::from_secs(5)).await.unwrap();
        assert_eq!(exporter.items(), vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn shutdown_is_idempotent_and_stops_intake() {
        let exporter = RecordingExporter::default();
        let processor = BatchProcessor::new(
            exporter.clone(),
            config(10, 10, Duration::from_secs(3600)),
            signal::METRICS,
            metrics(),
        );
        processor.submit(1, 1);
        processor.shutdown(Duration::from_secs(5)).await.unwrap();
        processor.shutdown(Duration::from_secs(5)).await.unwrap();

        processor.submit(2, 1);
        assert!(matches!(
            processor.force_flush(Duration::from_secs(1)).await,
            Err(BatchError::AlreadyShutdown)
        ));
        assert_eq!(exporter.items(), vec![1]);
        assert_eq!(exporter.shutdowns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_batches_are_counted_and_dropped() {
        let exporter = RecordingExporter {
            fail: true,
            ..Default::default()
        };
        let metrics = metrics();
        let processor = BatchProcessor::new(
            exporter.clone(),
            config(2, 10, Duration::from_secs(3600)),
            signal::TRACE,
            metrics.clone(),
        );
        for i in 0..4 {
            processor.submit(i, 1);
        }
        processor.shutdown(Duration::from_secs(5)).await.unwrap();
        assert_eq!(metrics.batch_processed_count(signal::TRACE, false), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_times_out_on_slow_exporter() {
        let exporter = RecordingExporter {
            delay: Some(Duration::from_secs(60)),
            ..Default::default()
        };
        let config = BatchConfigBuilder::from(config(10, 10, Duration::from_secs(3600)))
            .with_export_timeout(Duration::ZERO)
            .build();
        let processor = BatchProcessor::new(exporter, config, signal::TRACE, metrics());
        processor.submit(1, 1);

        let result = processor.shutdown(Duration::from_millis(100)).await;
        assert!(matches!(result, Err(BatchError::Timeout(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn blocking_mode_waits_for_room() {
        let exporter = RecordingExporter::default();
        let config = BatchConfigBuilder::from(config(1, 1, Duration::from_secs(3600)))
            .with_blocking(true)
            .build();
        let processor = BatchProcessor::new(exporter.clone(), config, signal::TRACE, metrics());
        for i in 0..20 {
            processor.submit(i, 1);
        }
        processor.shutdown(Duration::from_secs(5)).await.unwrap();
        assert_eq!(exporter.items(), (0..20).collect::<Vec<_>>());
        assert_eq!(processor.dropped_count(), 0);
    }
}
