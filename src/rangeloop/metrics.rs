//! Completed pass metrics
//!
//! [`PassMetricsRegistry`] is created once at process start, shared with the
//! service through an `Arc`, updated at the end of every pass and read at any
//! time by an exporter. It keeps the last completed pass for callers that want
//! structured data and mirrors it into a Prometheus registry for scraping.

use chrono::{DateTime, Utc};
use prometheus::{
    Encoder, Gauge, GaugeVec, IntCounter, Opts, Registry, TextEncoder,
    register_gauge_vec_with_registry, register_gauge_with_registry,
    register_int_counter_with_registry,
};
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use crate::rangeloop::error::{LoopError, LoopResult};
use crate::rangeloop::observer::ObserverDuration;

/// Outcome of the most recent pass that ran to completion
#[derive(Debug, Clone, PartialEq)]
pub struct CompletedPass {
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
    pub observers: Vec<ObserverDuration>,
}

pub struct PassMetricsRegistry {
    registry: Registry,
    last_pass: RwLock<Option<CompletedPass>>,
    observer_duration: GaugeVec,
    pass_duration: Gauge,
    passes_total: IntCounter,
    pass_failures_total: IntCounter,
}

fn registration_error(e: prometheus::Error) -> LoopError {
    LoopError::configuration(format!("failed to register pass metrics: {}", e))
}

/// Metric label per observer. Names shared by several observers get their
/// registration index appended, `CountObserver#0`, `CountObserver#1`.
fn observer_labels(observers: &[ObserverDuration]) -> Vec<String> {
    let mut occurrences: HashMap<&str, usize> = HashMap::new();
    for observer in observers {
        *occurrences.entry(observer.observer.as_str()).or_default() += 1;
    }
    observers
        .iter()
        .enumerate()
        .map(|(index, observer)| match occurrences.get(observer.observer.as_str()) {
            Some(&count) if count > 1 => format!("{}#{}", observer.observer, index),
            _ => observer.observer.clone(),
        })
        .collect()
}

impl PassMetricsRegistry {
    pub fn new() -> LoopResult<Self> {
        let registry = Registry::new();

        let observer_duration = register_gauge_vec_with_registry!(
            Opts::new(
                "rangeloop_observer_duration_seconds",
                "Processing time of each observer in the last completed pass, -1 when it failed"
            ),
            &["observer"],
            registry
        )
        .map_err(registration_error)?;

        let pass_duration = register_gauge_with_registry!(
            Opts::new(
                "rangeloop_pass_duration_seconds",
                "Wall clock time of the last completed pass"
            ),
            registry
        )
        .map_err(registration_error)?;

        let passes_total = register_int_counter_with_registry!(
            Opts::new("rangeloop_passes_total", "Passes that ran to completion"),
            registry
        )
        .map_err(registration_error)?;

        let pass_failures_total = register_int_counter_with_registry!(
            Opts::new(
                "rangeloop_pass_failures_total",
                "Passes aborted by an infrastructure error or cancellation"
            ),
            registry
        )
        .map_err(registration_error)?;

        Ok(Self {
            registry,
            last_pass: RwLock::new(None),
            observer_duration,
            pass_duration,
            passes_total,
            pass_failures_total,
        })
    }

    /// Replace the last completed pass
    pub fn record_pass(&self, pass: CompletedPass) {
        // observers that left the set must not keep reporting old values
        self.observer_duration.reset();
        for (label, observer) in observer_labels(&pass.observers).iter().zip(&pass.observers) {
            self.observer_duration
                .with_label_values(&[label.as_str()])
                .set(observer.seconds());
        }
        self.pass_duration.set(pass.duration.as_secs_f64());
        self.passes_total.inc();

        match self.last_pass.write() {
            Ok(mut last_pass) => *last_pass = Some(pass),
            Err(poisoned) => *poisoned.into_inner() = Some(pass),
        }
    }

    pub fn record_failure(&self) {
        self.pass_failures_total.inc();
    }

    pub fn last_pass(&self) -> Option<CompletedPass> {
        match self.last_pass.read() {
            Ok(last_pass) => last_pass.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn passes_total(&self) -> u64 {
        self.passes_total.get()
    }

    pub fn pass_failures_total(&self) -> u64 {
        self.pass_failures_total.get()
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render all metrics in the Prometheus text exposition format
    pub fn gather_text(&self) -> LoopResult<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| LoopError::configuration(format!("failed to encode metrics: {}", e)))?;
        String::from_utf8(buffer)
            .map_err(|e| LoopError::configuration(format!("invalid UTF-8 in metrics: {}", e)))
    }
}
