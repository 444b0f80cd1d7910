// Copyright © 2024 The distq contributors
//
// This file is part of distq, distributed under the GPLv3. For full terms
// see the included LICENSE file.

//! The observability surface every public queue operation reports into
//! (spec §4.1 "Statistics", §6 "Observability surface").
//!
//! Every public operation on `base-queue`/`rrq` wraps its body in a timer
//! keyed by `<directory>_<operation>` (wait variants get `_wait<millis>` or
//! `_wait_forever` appended) and increments a success or failure counter.
//! The queue-length and watcher-count gauges are refreshed on every remote
//! child-list fetch.
//!
//! Not part of spec.md's core (metrics sinks are listed as an external
//! collaborator in §1), but the ambient instrumentation every other crate
//! in this workspace's teacher carries is still expected here.

use std::time::Instant;

use prometheus::{
    exponential_buckets, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry,
};

/// Prometheus collectors for one work-queue instance.
pub struct QueueMetrics {
    op_duration: HistogramVec,
    op_success: IntCounterVec,
    op_failure: IntCounterVec,
    queue_length: IntGaugeVec,
    watcher_count: IntGaugeVec,
    registry: Registry,
}

impl QueueMetrics {
    /// A fresh set of collectors registered against their own
    /// [`Registry`]; embed it into the host process's registry via
    /// [`QueueMetrics::registry`] if it runs one.
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let op_duration = HistogramVec::new(
            prometheus::HistogramOpts::new(
                "queue_operation_duration_seconds",
                "Time spent in a queue operation, labeled by directory and operation",
            )
            .buckets(exponential_buckets(0.0005, 2.0, 16)?),
            &["directory", "operation"],
        )?;
        let op_success = IntCounterVec::new(
            Opts::new("queue_operation_success_total", "Successful queue operations"),
            &["directory", "operation"],
        )?;
        let op_failure = IntCounterVec::new(
            Opts::new("queue_operation_failure_total", "Failed queue operations"),
            &["directory", "operation"],
        )?;
        let queue_length = IntGaugeVec::new(
            Opts::new("queue_length", "Last observed child count of the queue directory"),
            &["directory"],
        )?;
        let watcher_count = IntGaugeVec::new(
            Opts::new("queue_watcher_count", "Outstanding child-list watches"),
            &["directory"],
        )?;

        registry.register(Box::new(op_duration.clone()))?;
        registry.register(Box::new(op_success.clone()))?;
        registry.register(Box::new(op_failure.clone()))?;
        registry.register(Box::new(queue_length.clone()))?;
        registry.register(Box::new(watcher_count.clone()))?;

        Ok(Self {
            op_duration,
            op_success,
            op_failure,
            queue_length,
            watcher_count,
            registry,
        })
    }

    /// The registry these collectors live in, for a host process to merge
    /// into its own.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Start timing `operation` against `directory`. Call
    /// [`OpTimer::success`] or [`OpTimer::failure`] exactly once on the
    /// result.
    pub fn timer<'a>(&'a self, directory: &'a str, operation: &'a str) -> OpTimer<'a> {
        OpTimer {
            metrics: self,
            directory,
            operation,
            start: Instant::now(),
        }
    }

    pub fn set_queue_length(&self, directory: &str, len: usize) {
        self.queue_length
            .with_label_values(&[directory])
            .set(len as i64);
    }

    pub fn set_watcher_count(&self, directory: &str, count: i64) {
        self.watcher_count
            .with_label_values(&[directory])
            .set(count);
    }
}

impl Default for QueueMetrics {
    fn default() -> Self {
        Self::new().expect("static metric descriptors are always valid")
    }
}

/// An in-flight timing of one queue operation.
#[must_use = "call `success` or `failure` to record the outcome"]
pub struct OpTimer<'a> {
    metrics: &'a QueueMetrics,
    directory: &'a str,
    operation: &'a str,
    start: Instant,
}

impl<'a> OpTimer<'a> {
    fn record(self, counter: &IntCounterVec) {
        let elapsed = self.start.elapsed().as_secs_f64();
        self.metrics
            .op_duration
            .with_label_values(&[self.directory, self.operation])
            .observe(elapsed);
        counter
            .with_label_values(&[self.directory, self.operation])
            .inc();
    }

    pub fn success(self) {
        let success = self.metrics.op_success.clone();
        self.record(&success);
    }

    pub fn failure(self) {
        let failure = self.metrics.op_failure.clone();
        self.record(&failure);
    }
}

/// Format the operation label for a bounded wait, per §6:
/// `<op>_wait<millis>` or `<op>_wait_forever`.
pub fn wait_op_label(op: &str, wait: Option<std::time::Duration>) -> String {
    match wait {
        None => format!("{op}_wait_forever"),
        Some(d) => format!("{op}_wait{}", d.as_millis()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_and_failure_increment_distinct_counters() {
        let metrics = QueueMetrics::new().unwrap();
        metrics.timer("/queue", "poll").success();
        metrics.timer("/queue", "poll").failure();

        let families = metrics.registry().gather();
        let success = families
            .iter()
            .find(|f| f.get_name() == "queue_operation_success_total")
            .unwrap();
        let failure = families
            .iter()
            .find(|f| f.get_name() == "queue_operation_failure_total")
            .unwrap();
        assert_eq!(success.get_metric()[0].get_counter().get_value(), 1.0);
        assert_eq!(failure.get_metric()[0].get_counter().get_value(), 1.0);
    }

    #[test]
    fn wait_op_label_matches_spec_format() {
        assert_eq!(wait_op_label("peek", None), "peek_wait_forever");
        assert_eq!(
            wait_op_label("peek", Some(std::time::Duration::from_millis(500))),
            "peek_wait500"
        );
    }
}
