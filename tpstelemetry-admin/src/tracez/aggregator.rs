use super::{
    latency_bucket, TracezMessage, TracezQuery, TracezResponse, TracezSummary,
    LATENCY_BUCKET_COUNT,
};
use opentelemetry::trace::{SpanId, Status};
use std::collections::{BTreeMap, VecDeque};
use tokio::sync::mpsc;
use tpstelemetry::trace::SpanData;

/// Ring of the most recent samples.
#[derive(Debug)]
struct Samples {
    spans: VecDeque<SpanData>,
    capacity: usize,
}

impl Samples {
    fn new(capacity: usize) -> Self {
        Samples {
            spans: VecDeque::new(),
            capacity,
        }
    }

    fn push(&mut self, span: SpanData) {
        if self.spans.len() == self.capacity {
            self.spans.pop_front();
        }
        self.spans.push_back(span);
    }

    fn remove(&mut self, span_id: SpanId) {
        self.spans.retain(|span| span.span_context.span_id() != span_id);
    }

    fn to_vec(&self) -> Vec<SpanData> {
        self.spans.iter().cloned().collect()
    }
}

#[derive(Debug)]
struct SpanSummary {
    running_num: usize,
    running_samples: Samples,
    error_num: usize,
    error_samples: Samples,
    latency: [usize; LATENCY_BUCKET_COUNT],
    latency_samples: [Samples; LATENCY_BUCKET_COUNT],
}

impl SpanSummary {
    fn new(capacity: usize) -> Self {
        SpanSummary {
            running_num: 0,
            running_samples: Samples::new(capacity),
            error_num: 0,
            error_samples: Samples::new(capacity),
            latency: [0; LATENCY_BUCKET_COUNT],
            latency_samples: std::array::from_fn(|_| Samples::new(capacity)),
        }
    }
}

/// Owns the per-name summaries. Runs as a single task, so no locking.
#[derive(Debug)]
pub(super) struct SpanAggregator {
    receiver: mpsc::Receiver<TracezMessage>,
    summaries: BTreeMap<String, SpanSummary>,
    samples_per_bucket: usize,
}

impl SpanAggregator {
    pub(super) fn new(receiver: mpsc::Receiver<TracezMessage>, samples_per_bucket: usize) -> Self {
        SpanAggregator {
            receiver,
            summaries: BTreeMap::new(),
            samples_per_bucket,
        }
    }

    pub(super) async fn process(mut self) {
        while let Some(message) = self.receiver.recv().await {
            match message {
                TracezMessage::SpanStart(span) => self.on_start(span),
                TracezMessage::SpanEnd(span) => self.on_end(span),
                TracezMessage::Query { query, reply } => {
                    let _ = reply.send(self.answer(&query));
                }
                TracezMessage::ShutDown => break,
            }
        }
        self.receiver.close();
    }

    fn summary(&mut self, name: &str) -> &mut SpanSummary {
        let capacity = self.samples_per_bucket;
        self.summaries
            .entry(name.to_string())
            .or_insert_with(|| SpanSummary::new(capacity))
    }

    fn on_start(&mut self, span: SpanData) {
        let summary = self.summary(&span.name);
        summary.running_num += 1;
        summary.running_samples.push(span);
    }

    fn on_end(&mut self, span: SpanData) {
        let summary = self.summary(&span.name);
        // the start may have been skipped on a full channel
        summary.running_num = summary.running_num.saturating_sub(1);
        summary.running_samples.remove(span.span_context.span_id());

        if matches!(span.status, Status::Error { .. }) {
            summary.error_num += 1;
            summary.error_samples.push(span);
        } else {
            let bucket = latency_bucket(span.duration());
            summary.latency[bucket] += 1;
            summary.latency_samples[bucket].push(span);
        }
    }

    fn answer(&self, query: &TracezQuery) -> TracezResponse {
        match query {
            TracezQuery::Aggregation => TracezResponse::Aggregation(
                self.summaries
                    .iter()
                    .map(|(name, summary)| TracezSummary {
                        span_name: name.clone(),
                        running: summary.running_num,
                        errors: summary.error_num,
                        latency: summary.latency,
                    })
                    .collect(),
            ),
            TracezQuery::Running { span_name } => self.samples(span_name, |s| &s.running_samples),
            TracezQuery::Error { span_name } => self.samples(span_name, |s| &s.error_samples),
            TracezQuery::Latency { span_name, bucket } => match self.summaries.get(span_name) {
                Some(summary) if *bucket < LATENCY_BUCKET_COUNT => {
                    TracezResponse::Spans(summary.latency_samples[*bucket].to_vec())
                }
                _ => TracezResponse::Spans(Vec::new()),
            },
        }
    }

    fn samples<F>(&self, span_name: &str, pick: F) -> TracezResponse
    where
        F: Fn(&SpanSummary) -> &Samples,
    {
        TracezResponse::Spans(
            self.summaries
                .get(span_name)
                .map(|summary| pick(summary).to_vec())
                .unwrap_or_default(),
        )
    }
}
