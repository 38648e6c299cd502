//! Process-wide Prometheus instruments.
//!
//! Builds and launches have very different characteristic times and buckets
//! are not free, so the two histograms carry separate boundary sets.

use once_cell::sync::Lazy;
use prometheus::{
    HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry,
};

use crate::types::RepoLabels;

const BUILD_BUCKETS: &[f64] = &[60.0, 120.0, 300.0, 600.0, 1800.0, 3600.0, 7200.0];
const LAUNCH_BUCKETS: &[f64] = &[2.0, 5.0, 10.0, 20.0, 30.0, 60.0, 120.0, 300.0, 600.0];

pub struct Metrics {
    registry: Registry,

    pub build_time: HistogramVec,
    pub launch_time: HistogramVec,
    pub build_count: IntCounterVec,
    pub launch_count: IntCounterVec,
    pub builds_inprogress: IntGauge,
    pub launches_inprogress: IntGauge,
}

impl Metrics {
    fn new() -> Self {
        let registry = Registry::new();

        let build_time = HistogramVec::new(
            HistogramOpts::new("bindery_build_time_seconds", "Histogram of build times")
                .buckets(BUILD_BUCKETS.to_vec()),
            &["status"],
        )
        .expect("failed to create build_time metric");

        let launch_time = HistogramVec::new(
            HistogramOpts::new("bindery_launch_time_seconds", "Histogram of launch times")
                .buckets(LAUNCH_BUCKETS.to_vec()),
            &["status", "retries"],
        )
        .expect("failed to create launch_time metric");

        let build_count = IntCounterVec::new(
            Opts::new("bindery_build_count", "Counter of builds by repo"),
            &["status", "provider", "repo"],
        )
        .expect("failed to create build_count metric");

        let launch_count = IntCounterVec::new(
            Opts::new("bindery_launch_count", "Counter of launches by repo"),
            &["status", "provider", "repo"],
        )
        .expect("failed to create launch_count metric");

        let builds_inprogress =
            IntGauge::new("bindery_inprogress_builds", "Builds currently in progress")
                .expect("failed to create inprogress_builds metric");

        let launches_inprogress = IntGauge::new(
            "bindery_inprogress_launches",
            "Launches currently in progress",
        )
        .expect("failed to create inprogress_launches metric");

        let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
            Box::new(build_time.clone()),
            Box::new(launch_time.clone()),
            Box::new(build_count.clone()),
            Box::new(launch_count.clone()),
            Box::new(builds_inprogress.clone()),
            Box::new(launches_inprogress.clone()),
        ];
        for c in collectors {
            registry.register(c).expect("failed to register metric");
        }

        Self {
            registry,
            build_time,
            launch_time,
            build_count,
            launch_count,
            builds_inprogress,
            launches_inprogress,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_build(&self, status: &str, labels: &RepoLabels, seconds: f64) {
        self.build_time.with_label_values(&[status]).observe(seconds);
        self.build_count
            .with_label_values(&[status, &labels.provider, &labels.repo])
            .inc();
    }
}

static METRICS: Lazy<Metrics> = Lazy::new(Metrics::new);

/// The one process-wide metrics registry. Initialized on first use, never
/// replaced.
pub fn metrics() -> &'static Metrics {
    &METRICS
}

/// Holds an in-progress gauge up for its lifetime; decrements on every exit
/// path, including cancellation and panics.
pub struct InprogressGuard {
    gauge: &'static IntGauge,
}

impl InprogressGuard {
    pub fn builds() -> Self {
        metrics().builds_inprogress.inc();
        Self {
            gauge: &metrics().builds_inprogress,
        }
    }

    pub fn launches() -> Self {
        metrics().launches_inprogress.inc();
        Self {
            gauge: &metrics().launches_inprogress,
        }
    }
}

impl Drop for InprogressGuard {
    fn drop(&mut self) {
        self.gauge.dec();
    }
}
