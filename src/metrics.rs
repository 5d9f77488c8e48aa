//! Prometheus instrumentation, same shape as the teacher's three
//! `Lazy`-registered vectors, plus one gauge for outstanding publisher
//! confirms that the teacher's fire-and-forget publisher had no use for.

use once_cell::sync::Lazy;
use prometheus::{
    opts, register_histogram_vec, register_int_gauge_vec, Histogram, HistogramVec, IntGauge,
    IntGaugeVec,
};

const EXPONENTIAL_SECONDS: &[f64] = &[0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0];

static STAT_CONCURRENT_TASKS: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        opts!("amqp_consumer_concurrent_tasks", "Current number of in-flight consumer callbacks"),
        &["connection", "consumer_tag"],
    )
    .unwrap()
});

static STAT_CONSUMER_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "amqp_consumer_duration",
        "Duration of one consumer callback invocation",
        &["connection", "queue"],
        EXPONENTIAL_SECONDS.to_vec(),
    )
    .unwrap()
});

static STAT_PUBLISHER_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "amqp_publisher_duration",
        "Duration of one publish call, including the confirm wait when requested",
        &["connection", "exchange", "routing_key"],
        EXPONENTIAL_SECONDS.to_vec(),
    )
    .unwrap()
});

static STAT_PENDING_CONFIRMS: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        opts!("amqp_pending_confirms", "Number of publishes awaiting a broker confirm"),
        &["connection"],
    )
    .unwrap()
});

pub fn consumer_started(connection: &str, consumer_tag: &str) {
    STAT_CONCURRENT_TASKS.with_label_values(&[connection, consumer_tag]).inc();
}

pub fn consumer_stopped(connection: &str, consumer_tag: &str) {
    STAT_CONCURRENT_TASKS.with_label_values(&[connection, consumer_tag]).set(0);
}

pub fn consumer_duration(connection: &str, queue: &str) -> Histogram {
    STAT_CONSUMER_DURATION.with_label_values(&[connection, queue])
}

pub fn publisher_duration(connection: &str, exchange: &str, routing_key: &str) -> Histogram {
    STAT_PUBLISHER_DURATION.with_label_values(&[connection, exchange, routing_key])
}

pub fn pending_confirms(connection: &str) -> IntGauge {
    STAT_PENDING_CONFIRMS.with_label_values(&[connection])
}
