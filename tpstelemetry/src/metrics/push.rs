use super::guard::CardinalityGuard;
use super::transform::{families_to_metrics, Timestamps};
use crate::batch::BatchMetricProcessor;
use crate::runtime::{self, BackgroundTask};
use crate::transform::to_nanos;
use crate::tps_debug;
use opentelemetry_proto::tonic::metrics::v1::Metric;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::watch;

/// Destination of converted metrics.
pub trait MetricSink: Send + Sync + fmt::Debug + 'static {
    /// Takes one metric. Must not block.
    fn push(&self, metric: Metric);
}

impl MetricSink for BatchMetricProcessor {
    fn push(&self, metric: Metric) {
        BatchMetricProcessor::push(self, metric)
    }
}

impl<S: MetricSink> MetricSink for Arc<S> {
    fn push(&self, metric: Metric) {
        S::push(self, metric)
    }
}

#[derive(Debug)]
struct Collect {
    guard: CardinalityGuard,
    sink: Box<dyn MetricSink>,
    start: SystemTime,
}

impl Collect {
    fn run(&self) -> usize {
        let families = self.guard.gather();
        let metrics = families_to_metrics(
            &families,
            Timestamps {
                start_unix_nano: to_nanos(self.start),
                time_unix_nano: to_nanos(SystemTime::now()),
            },
        );
        let count = metrics.len();
        for metric in metrics {
            self.sink.push(metric);
        }
        count
    }
}

/// Periodically gathers a guarded registry and pushes the result as OTLP
/// metrics.
///
/// The first collection happens one interval after [`MetricPusher::start`].
/// Collection time is not counted towards the interval.
#[derive(Debug)]
pub struct MetricPusher {
    collect: Arc<Collect>,
    stop: watch::Sender<bool>,
    task: Option<BackgroundTask>,
}

impl MetricPusher {
    /// Starts pushing every `interval`.
    pub fn start(guard: CardinalityGuard, sink: impl MetricSink, interval: Duration) -> Self {
        let collect = Arc::new(Collect {
            guard,
            sink: Box::new(sink),
            start: SystemTime::now(),
        });
        let (stop, mut stopped) = watch::channel(false);
        let worker = collect.clone();
        let task = runtime::spawn("tps-metric-push", async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        let pushed = worker.run();
                        tps_debug!(name: "MetricPusher.Collected", metrics = pushed);
                    }
                    _ = stopped.changed() => break,
                }
            }
        });
        MetricPusher {
            collect,
            stop,
            task: Some(task),
        }
    }

    /// Collects and pushes immediately, returning how many metrics were pushed.
    pub fn push_now(&self) -> usize {
        self.collect.run()
    }

    /// Stops the timer and pushes one last collection. A second call does
    /// nothing.
    pub async fn shutdown(&mut self) {
        let Some(task) = self.task.take() else {
            return;
        };
        let _ = self.stop.send(true);
        let _ = task.join().await;
        self.collect.run();
    }
}

impl Drop for MetricPusher {
    fn drop(&mut self) {
        let _ = self.stop.send(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::self_metrics::SelfMetrics;
    use prometheus::{IntCounter, Registry};
    use std::sync::Mutex;

    #[derive(Debug, Default)]
    struct MemorySink(Mutex<Vec<Metric>>);

    impl MetricSink for MemorySink {
        fn push(&self, metric: Metric) {
            self.0.lock().unwrap().push(metric);
        }
    }

    fn guard() -> (CardinalityGuard, IntCounter) {
        let registry = Registry::new();
        let counter = IntCounter::new("requests_total", "Requests.").unwrap();
        registry.register(Box::new(counter.clone())).unwrap();
        let guard = CardinalityGuard::new(registry, 10, 100)
            .with_self_metrics(SelfMetrics::new(&Registry::new()));
        (guard, counter)
    }

    #[tokio::test(start_paused = true)]
    async fn pushes_on_every_interval() {
        let (guard, counter) = guard();
        counter.inc();
        let sink = Arc::new(MemorySink::default());
        let mut pusher = MetricPusher::start(guard, sink.clone(), Duration::from_secs(60));

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(sink.0.lock().unwrap().is_empty());

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(sink.0.lock().unwrap().len(), 1);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(sink.0.lock().unwrap().len(), 2);

        pusher.shutdown().await;
        assert_eq!(sink.0.lock().unwrap().len(), 3);
        pusher.shutdown().await;
        assert_eq!(sink.0.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn push_now_returns_pushed_count() {
        let (guard, _counter) = guard();
        let sink = Arc::new(MemorySink::default());
        let mut pusher = MetricPusher::start(guard, sink.clone(), Duration::from_secs(3600));
        // an untouched counter still has its one series
        assert_eq!(pusher.push_now(), 1);
        assert_eq!(sink.0.lock().unwrap()[0].name, "requests_total");
        pusher.shutdown().await;
    }
}
