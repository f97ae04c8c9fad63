use super::TracezMessage;
use futures_util::future::BoxFuture;
use opentelemetry::trace::SpanContext;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tpstelemetry::error::BatchResult;
use tpstelemetry::tps_debug;
use tpstelemetry::trace::{SpanData, SpanProcessor};

/// Span processor feeding the tracez aggregator.
///
/// Never blocks: when the aggregator falls behind, spans are skipped.
#[derive(Debug)]
pub struct TracezProcessor {
    sender: mpsc::Sender<TracezMessage>,
}

impl TracezProcessor {
    pub(super) fn new(sender: mpsc::Sender<TracezMessage>) -> Self {
        TracezProcessor { sender }
    }

    fn forward(&self, message: TracezMessage) {
        match self.sender.try_send(message) {
            Ok(()) | Err(TrySendError::Closed(_)) => {}
            Err(TrySendError::Full(_)) => {
                tps_debug!(name: "TracezProcessor.QueueFull");
            }
        }
    }
}

impl SpanProcessor for TracezProcessor {
    fn on_start(&self, span: &SpanData, _parent: Option<&SpanContext>) {
        self.forward(TracezMessage::SpanStart(span.clone()));
    }

    fn on_end(&self, span: SpanData) {
        self.forward(TracezMessage::SpanEnd(span));
    }

    fn force_flush(&self, _timeout: Duration) -> BoxFuture<'_, BatchResult> {
        Box::pin(async { Ok(()) })
    }

    fn shutdown(&self, _timeout: Duration) -> BoxFuture<'_, BatchResult> {
        self.forward(TracezMessage::ShutDown);
        Box::pin(async { Ok(()) })
    }
}

#[cfg(test)]
mod tests {
    use crate::tracez::test_utils::span;
    use crate::tracez::{tracez, TracezConfig, TracezQuery, TracezResponse};
    use crate::AdminError;
    use std::time::Duration;
    use tpstelemetry::trace::SpanProcessor;

    #[tokio::test]
    async fn spans_flow_to_the_querier() {
        let (processor, querier) = tracez(&TracezConfig::default());
        let running = span("charge", 1, Duration::ZERO, false);
        processor.on_start(&running, None);
        processor.on_start(&span("charge", 2, Duration::ZERO, false), None);
        processor.on_end(span("charge", 2, Duration::from_millis(30), false));

        let response = querier.query(TracezQuery::Aggregation).await.unwrap();
        let TracezResponse::Aggregation(summaries) = response else {
            panic!("unexpected response {response:?}");
        };
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].running, 1);
        assert_eq!(summaries[0].latency[4], 1);
    }

    #[tokio::test]
    async fn shutdown_stops_the_aggregator() {
        let (processor, querier) = tracez(&TracezConfig::default());
        processor.shutdown(Duration::from_secs(1)).await.unwrap();
        processor.shutdown(Duration::from_secs(1)).await.unwrap();

        let result = querier.query(TracezQuery::Aggregation).await;
        assert!(matches!(result, Err(AdminError::TracezGone)));
        // spans after shutdown are dropped silently
        processor.on_end(span("charge", 3, Duration::ZERO, false));
    }

    #[tokio::test]
    async fn full_queue_drops_spans() {
        let config = TracezConfig {
            queue_size: 1,
            ..Default::default()
        };
        let (processor, querier) = tracez(&config);
        // the aggregator task has not been polled yet on the current-thread runtime
        for id in 0..10 {
            processor.on_end(span("charge", id, Duration::ZERO, false));
        }

        let response = querier.query(TracezQuery::Aggregation).await.unwrap();
        let TracezResponse::Aggregation(summaries) = response else {
            panic!("unexpected response {response:?}");
        };
        assert_eq!(summaries[0].latency[0], 1);
    }
}
