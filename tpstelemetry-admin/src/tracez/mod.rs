//! # Tracez
//!
//! In-process view of recent spans, grouped by span name. The
//! [`TracezProcessor`] sits in the tracer provider next to the batch processor
//! and forwards span starts and ends over a bounded channel to an aggregator
//! task, which keeps per name:
//!
//! * the number of running spans and a few running samples,
//! * the number of error spans and the latest error samples,
//! * a latency histogram over [`LATENCY_BUCKETS`] with samples per bucket.
//!
//! A [`TracezQuerier`] answers the `/debug/tracez` page. Nothing here blocks
//! the instrumented code: when the channel is full the span is skipped.
use crate::error::AdminError;
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tpstelemetry::trace::SpanData;

mod aggregator;
mod processor;
pub mod render;

pub use processor::TracezProcessor;

use aggregator::SpanAggregator;

/// Number of latency buckets.
pub const LATENCY_BUCKET_COUNT: usize = 9;

/// Lower bounds of the latency buckets. The last bucket is open-ended.
pub const LATENCY_BUCKETS: [Duration; LATENCY_BUCKET_COUNT] = [
    Duration::from_micros(0),
    Duration::from_micros(10),
    Duration::from_micros(100),
    Duration::from_millis(1),
    Duration::from_millis(10),
    Duration::from_millis(100),
    Duration::from_secs(1),
    Duration::from_secs(10),
    Duration::from_secs(100),
];

/// Index of the latency bucket `latency` falls in.
pub fn latency_bucket(latency: Duration) -> usize {
    LATENCY_BUCKETS
        .iter()
        .rposition(|bound| *bound <= latency)
        .unwrap_or(0)
}

/// Tracez buffer sizes.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TracezConfig {
    /// Capacity of the channel between the processor and the aggregator.
    pub queue_size: usize,
    /// Samples kept per span name and category.
    pub samples_per_bucket: usize,
}

impl Default for TracezConfig {
    fn default() -> Self {
        TracezConfig {
            queue_size: 2048,
            samples_per_bucket: 8,
        }
    }
}

/// What the tracez page asks for.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TracezQuery {
    /// Counts for every span name.
    Aggregation,
    /// Running samples of one span name.
    Running {
        /// Span name.
        span_name: String,
    },
    /// Error samples of one span name.
    Error {
        /// Span name.
        span_name: String,
    },
    /// Samples of one span name in one latency bucket.
    Latency {
        /// Span name.
        span_name: String,
        /// Bucket index, below [`LATENCY_BUCKET_COUNT`].
        bucket: usize,
    },
}

/// Counts for one span name.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TracezSummary {
    /// Span name.
    pub span_name: String,
    /// Spans started and not yet ended.
    pub running: usize,
    /// Ended spans with an error status.
    pub errors: usize,
    /// Ended spans without an error status, per latency bucket.
    pub latency: [usize; LATENCY_BUCKET_COUNT],
}

/// Answer to a [`TracezQuery`].
#[derive(Clone, Debug, PartialEq)]
pub enum TracezResponse {
    /// One summary per span name, sorted by name.
    Aggregation(Vec<TracezSummary>),
    /// Sampled spans, oldest first.
    Spans(Vec<SpanData>),
}

#[derive(Debug)]
pub(crate) enum TracezMessage {
    SpanStart(SpanData),
    SpanEnd(SpanData),
    Query {
        query: TracezQuery,
        reply: oneshot::Sender<TracezResponse>,
    },
    ShutDown,
}

/// Handle used by the admin server to read the aggregated spans.
#[derive(Clone, Debug)]
pub struct TracezQuerier {
    sender: mpsc::Sender<TracezMessage>,
}

impl TracezQuerier {
    /// Sends `query` to the aggregator and waits for the answer.
    pub async fn query(&self, query: TracezQuery) -> Result<TracezResponse, AdminError> {
        let (reply, response) = oneshot::channel();
        self.sender
            .send(TracezMessage::Query { query, reply })
            .await
            .map_err(|_| AdminError::TracezGone)?;
        response.await.map_err(|_| AdminError::TracezGone)
    }
}

/// Creates a tracez processor and its querier, and spawns the aggregator on
/// the current tokio runtime.
///
/// The aggregator stops when the processor is shut down or when every
/// processor and querier has been dropped.
pub fn tracez(config: &TracezConfig) -> (TracezProcessor, TracezQuerier) {
    let (sender, receiver) = mpsc::channel(config.queue_size.max(1));
    let aggregator = SpanAggregator::new(receiver, config.samples_per_bucket.max(1));
    tokio::spawn(aggregator.process());
    (
        TracezProcessor::new(sender.clone()),
        TracezQuerier { sender },
    )
}
