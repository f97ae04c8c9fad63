//! Conversion of gathered prometheus families to OTLP metrics.
//!
//! Everything is cumulative since the process started: counters become
//! monotonic sums, histograms keep their bounds with per-bucket counts.
use crate::transform::string_attribute;
use opentelemetry_proto::tonic::common::v1::KeyValue;
use opentelemetry_proto::tonic::metrics::v1::{
    metric, number_data_point, summary_data_point::ValueAtQuantile, AggregationTemporality, Gauge,
    Histogram, HistogramDataPoint, Metric, NumberDataPoint, Sum, Summary, SummaryDataPoint,
};
use prometheus::proto::{LabelPair, MetricFamily, MetricType};

/// Timestamps stamped on every data point.
#[derive(Clone, Copy, Debug)]
pub struct Timestamps {
    /// Start of the cumulative window, in nanoseconds since the epoch.
    pub start_unix_nano: u64,
    /// Collection time, in nanoseconds since the epoch.
    pub time_unix_nano: u64,
}

/// Converts one family. Families without series yield `None`.
pub fn family_to_metric(family: &MetricFamily, ts: Timestamps) -> Option<Metric> {
    let series = family.get_metric();
    if series.is_empty() {
        return None;
    }
    let data = match family.get_field_type() {
        MetricType::COUNTER => metric::Data::Sum(Sum {
            data_points: series
                .iter()
                .map(|m| number_point(m.get_label(), m.counter.value(), ts))
                .collect(),
            aggregation_temporality: AggregationTemporality::Cumulative as i32,
            is_monotonic: true,
        }),
        MetricType::GAUGE => metric::Data::Gauge(Gauge {
            data_points: series
                .iter()
                .map(|m| number_point(m.get_label(), m.gauge.value(), ts))
                .collect(),
        }),
        MetricType::HISTOGRAM => metric::Data::Histogram(Histogram {
            data_points: series.iter().map(|m| histogram_point(m, ts)).collect(),
            aggregation_temporality: AggregationTemporality::Cumulative as i32,
        }),
        MetricType::SUMMARY => metric::Data::Summary(Summary {
            data_points: series.iter().map(|m| summary_point(m, ts)).collect(),
        }),
        _ => metric::Data::Gauge(Gauge {
            data_points: series
                .iter()
                .map(|m| number_point(m.get_label(), m.untyped.value(), ts))
                .collect(),
        }),
    };
    Some(Metric {
        name: family.name().to_string(),
        description: family.help().to_string(),
        data: Some(data),
        ..Default::default()
    })
}

/// Converts every family that has series.
pub fn families_to_metrics(families: &[MetricFamily], ts: Timestamps) -> Vec<Metric> {
    families
        .iter()
        .filter_map(|family| family_to_metric(family, ts))
        .collect()
}

fn attributes(labels: &[LabelPair]) -> Vec<KeyValue> {
    labels
        .iter()
        .map(|label| string_attribute(label.name(), label.value()))
        .collect()
}

fn number_point(labels: &[LabelPair], value: f64, ts: Timestamps) -> NumberDataPoint {
    NumberDataPoint {
        attributes: attributes(labels),
        start_time_unix_nano: ts.start_unix_nano,
        time_unix_nano: ts.time_unix_nano,
        value: Some(number_data_point::Value::AsDouble(value)),
        ..Default::default()
    }
}

fn histogram_point(m: &prometheus::proto::Metric, ts: Timestamps) -> HistogramDataPoint {
    let histogram = m.get_histogram();
    let mut explicit_bounds = Vec::with_capacity(histogram.get_bucket().len());
    let mut bucket_counts = Vec::with_capacity(histogram.get_bucket().len() + 1);
    let mut previous = 0;
    for bucket in histogram.get_bucket() {
        if bucket.upper_bound().is_infinite() {
            continue;
        }
        explicit_bounds.push(bucket.upper_bound());
        bucket_counts.push(bucket.cumulative_count().saturating_sub(previous));
        previous = bucket.cumulative_count();
    }
    // overflow bucket
    bucket_counts.push(histogram.sample_count().saturating_sub(previous));

    HistogramDataPoint {
        attributes: attributes(m.get_label()),
        start_time_unix_nano: ts.start_unix_nano,
        time_unix_nano: ts.time_unix_nano,
        count: histogram.sample_count(),
        sum: Some(histogram.sample_sum()),
        bucket_counts,
        explicit_bounds,
        ..Default::default()
    }
}

fn summary_point(m: &prometheus::proto::Metric, ts: Timestamps) -> SummaryDataPoint {
    let summary = m.get_summary();
    SummaryDataPoint {
        attributes: attributes(m.get_label()),
        start_time_unix_nano: ts.start_unix_nano,
        time_unix_nano: ts.time_unix_nano,
        count: summary.sample_count(),
        sum: summary.sample_sum(),
        quantile_values: summary
            .get_quantile()
            .iter()
            .map(|q| ValueAtQuantile {
                quantile: q.quantile(),
                value: q.value(),
            })
            .collect(),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus::{HistogramOpts, HistogramVec, IntCounter, IntGauge, Registry};

    const TS: Timestamps = Timestamps {
        start_unix_nano: 1,
        time_unix_nano: 2,
    };

    fn gather(registry: &Registry) -> Vec<Metric> {
        families_to_metrics(&registry.gather(), TS)
    }

    #[test]
    fn counter_becomes_cumulative_monotonic_sum() {
        let registry = Registry::new();
        let counter = IntCounter::new("jobs_total", "Jobs run.").unwrap();
        registry.register(Box::new(counter.clone())).unwrap();
        counter.inc_by(3);

        let metrics = gather(&registry);
        assert_eq!(metrics[0].name, "jobs_total");
        assert_eq!(metrics[0].description, "Jobs run.");
        let Some(metric::Data::Sum(sum)) = &metrics[0].data else {
            panic!("expected a sum");
        };
        assert!(sum.is_monotonic);
        assert_eq!(sum.aggregation_temporality, AggregationTemporality::Cumulative as i32);
        assert_eq!(sum.data_points[0].value, Some(number_data_point::Value::AsDouble(3.0)));
        assert_eq!(sum.data_points[0].start_time_unix_nano, 1);
        assert_eq!(sum.data_points[0].time_unix_nano, 2);
    }

    #[test]
    fn gauge_keeps_value() {
        let registry = Registry::new();
        let gauge = IntGauge::new("queue_depth", "Depth.").unwrap();
        registry.register(Box::new(gauge.clone())).unwrap();
        gauge.set(-4);

        let metrics = gather(&registry);
        let Some(metric::Data::Gauge(g)) = &metrics[0].data else {
            panic!("expected a gauge");
        };
        assert_eq!(g.data_points[0].value, Some(number_data_point::Value::AsDouble(-4.0)));
    }

    #[test]
    fn histogram_buckets_are_decumulated() {
        let registry = Registry::new();
        let histogram = HistogramVec::new(
            HistogramOpts::new("latency_seconds", "Latency.").buckets(vec![0.1, 1.0]),
            &["route"],
        )
        .unwrap();
        registry.register(Box::new(histogram.clone())).unwrap();
        for value in [0.0625, 0.5, 0.75, 3.0] {
            histogram.with_label_values(&["/a"]).observe(value);
        }

        let metrics = gather(&registry);
        let Some(metric::Data::Histogram(h)) = &metrics[0].data else {
            panic!("expected a histogram");
        };
        let point = &h.data_points[0];
        assert_eq!(point.explicit_bounds, [0.1, 1.0]);
        assert_eq!(point.bucket_counts, [1, 2, 1]);
        assert_eq!(point.count, 4);
        assert_eq!(point.sum, Some(4.3125));
        assert_eq!(point.attributes[0].key, "route");
    }

    fn family(name: &str, metric_type: MetricType, metric: prometheus::proto::Metric) -> MetricFamily {
        let mut label = prometheus::proto::LabelPair::default();
        label.set_name("shard".to_string());
        label.set_value("7".to_string());
        let mut metric = metric;
        metric.set_label(vec![label]);

        let mut mf = MetricFamily::default();
        mf.set_name(name.to_string());
        mf.set_help("Collected elsewhere.".to_string());
        mf.set_field_type(metric_type);
        mf.set_metric(vec![metric]);
        mf
    }

    #[test]
    fn untyped_becomes_gauge() {
        let mut untyped = prometheus::proto::Untyped::default();
        untyped.set_value(5.5);
        let mut metric = prometheus::proto::Metric::default();
        metric.untyped = Some(untyped).into();

        let converted = family_to_metric(&family("legacy", MetricType::UNTYPED, metric), TS).unwrap();
        assert_eq!(converted.description, "Collected elsewhere.");
        let Some(metric::Data::Gauge(g)) = &converted.data else {
            panic!("expected a gauge");
        };
        assert_eq!(g.data_points[0].value, Some(number_data_point::Value::AsDouble(5.5)));
        assert_eq!(g.data_points[0].attributes[0].key, "shard");
    }

    #[test]
    fn summary_keeps_quantiles() {
        let mut quantile = prometheus::proto::Quantile::default();
        quantile.set_quantile(0.99);
        quantile.set_value(0.25);
        let mut summary = prometheus::proto::Summary::default();
        summary.set_sample_count(12);
        summary.set_sample_sum(1.5);
        summary.set_quantile(vec![quantile]);
        let mut metric = prometheus::proto::Metric::default();
        metric.set_summary(summary);

        let converted = family_to_metric(&family("gc_pause", MetricType::SUMMARY, metric), TS).unwrap();
        let Some(metric::Data::Summary(s)) = &converted.data else {
            panic!("expected a summary");
        };
        let point = &s.data_points[0];
        assert_eq!(point.count, 12);
        assert_eq!(point.sum, 1.5);
        assert_eq!(point.quantile_values[0].quantile, 0.99);
        assert_eq!(point.quantile_values[0].value, 0.25);
    }
}
