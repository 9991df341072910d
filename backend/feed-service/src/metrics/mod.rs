//! Feed Service Metrics
//!
//! Prometheus metrics for the read path, fan-out and background jobs

use once_cell::sync::Lazy;
use prometheus::{
    register_histogram_vec, register_int_counter, register_int_counter_vec, register_int_gauge,
    HistogramVec, IntCounter, IntCounterVec, IntGauge,
};
use std::time::Duration;

static FEED_REQUESTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "feed_requests_total",
        "Feed page requests by feed type and outcome",
        &["feed_type", "outcome"]
    )
    .expect("Failed to register feed requests metric")
});

static FEED_ITEMS_DEDUPED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "feed_items_deduped_total",
        "Feed candidates dropped because the viewer already saw them"
    )
    .expect("Failed to register feed dedup metric")
});

static FANOUT_PUSHES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "feed_fanout_pushes_total",
        "Published videos by delivery mode (push/broker)",
        &["mode"]
    )
    .expect("Failed to register fanout pushes metric")
});

static FANOUT_TIMELINES_WRITTEN_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "feed_fanout_timelines_written_total",
        "Follower timelines written by fan-out"
    )
    .expect("Failed to register fanout timelines metric")
});

static FANOUT_BATCH_FAILURES_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "feed_fanout_batch_failures_total",
        "Follower batches skipped after a failed timeline write"
    )
    .expect("Failed to register fanout batch failures metric")
});

static JOB_RUNS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "feed_job_runs_total",
        "Background job cycles (success/error)",
        &["job", "status"]
    )
    .expect("Failed to register job runs metric")
});

static JOB_DURATION_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "feed_job_duration_seconds",
        "Duration of background job cycles",
        &["job"],
        vec![0.001, 0.01, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0]
    )
    .expect("Failed to register job duration metric")
});

static HOT_POOL_SIZE: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!("feed_hot_pool_size", "Entries written by the last hot pool refresh")
        .expect("Failed to register hot pool size metric")
});

static COUNTER_USERS_SYNCED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "feed_counter_users_synced_total",
        "Users whose counters were persisted by the sync job"
    )
    .expect("Failed to register counter sync metric")
});

static BATCHER_FLUSHES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "feed_batcher_flushes_total",
        "Bounded batcher flush cycles (success/error)",
        &["status"]
    )
    .expect("Failed to register batcher flushes metric")
});

/// Record a feed request outcome (ok/error)
pub fn record_feed_request(feed_type: &str, outcome: &str) {
    FEED_REQUESTS_TOTAL
        .with_label_values(&[feed_type, outcome])
        .inc();
}

pub fn record_deduped_items(count: usize) {
    FEED_ITEMS_DEDUPED_TOTAL.inc_by(count as u64);
}

/// Record a fan-out decision (push/broker)
pub fn record_fanout(mode: &str) {
    FANOUT_PUSHES_TOTAL.with_label_values(&[mode]).inc();
}

pub fn record_timelines_written(count: usize) {
    FANOUT_TIMELINES_WRITTEN_TOTAL.inc_by(count as u64);
}

pub fn record_fanout_batch_failure() {
    FANOUT_BATCH_FAILURES_TOTAL.inc();
}

/// Record a background job cycle and its duration
pub fn record_job_run(job: &str, status: &str, duration: Duration) {
    JOB_RUNS_TOTAL.with_label_values(&[job, status]).inc();
    JOB_DURATION_SECONDS
        .with_label_values(&[job])
        .observe(duration.as_secs_f64());
}

pub fn set_hot_pool_size(size: usize) {
    HOT_POOL_SIZE.set(size as i64);
}

pub fn record_users_synced(count: usize) {
    COUNTER_USERS_SYNCED_TOTAL.inc_by(count as u64);
}

pub fn record_batcher_flush(status: &str) {
    BATCHER_FLUSHES_TOTAL.with_label_values(&[status]).inc();
}
