//! Metrics for registry rewriter observability
//!
//! Handlers record through the [`MetricsSink`] trait so tests can run
//! without a meter provider. [`OtelMetrics`] is the production sink backed by
//! OpenTelemetry instruments on the global meter:
//! - Mutations performed (by namespace and source/target registry)
//! - Mutation handling duration
//! - Active rule count
//! - Rule cache hits and misses

use std::time::Instant;

use once_cell::sync::Lazy;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Gauge, Histogram, Meter};
use opentelemetry::KeyValue;

/// Global meter for registry rewriter metrics
static METER: Lazy<Meter> = Lazy::new(|| global::meter("registry_rewriter"));

/// Counter of image mutations
///
/// Labels:
/// - `namespace`: Pod namespace
/// - `source_registry`: registry of the normalized original image
/// - `target_registry`: registry of the rewritten image
/// - `status`: success, unchanged
static MUTATIONS_TOTAL: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("registry_rewriter_mutations_total")
        .with_description("Total number of mutations performed")
        .with_unit("{mutations}")
        .build()
});

/// Histogram of admission handling duration
///
/// Labels:
/// - `namespace`: Pod namespace
static MUTATION_DURATION: Lazy<Histogram<f64>> = Lazy::new(|| {
    METER
        .f64_histogram("registry_rewriter_mutation_duration_seconds")
        .with_description("Duration of mutation operations")
        .with_unit("s")
        .build()
});

/// Gauge of compiled rules currently cached
static RULES_COUNT: Lazy<Gauge<i64>> = Lazy::new(|| {
    METER
        .i64_gauge("registry_rewriter_rules_count")
        .with_description("Current number of active rules")
        .with_unit("{rules}")
        .build()
});

static CACHE_HITS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("registry_rewriter_cache_hits_total")
        .with_description("Total number of cache hits")
        .build()
});

static CACHE_MISSES: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("registry_rewriter_cache_misses_total")
        .with_description("Total number of cache misses")
        .build()
});

/// Result label for a mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationStatus {
    /// A rule matched and changed the image
    Success,
    /// A rule matched but produced the same image
    Unchanged,
}

impl MutationStatus {
    /// Convert to label value
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Unchanged => "unchanged",
        }
    }
}

/// Destination for webhook and cache metrics
///
/// Recording is purely observational and must never fail.
pub trait MetricsSink: Send + Sync {
    /// Record one image matched by a rule
    fn record_mutation(
        &self,
        namespace: &str,
        source_registry: &str,
        target_registry: &str,
        status: MutationStatus,
    );

    /// Record how long one admission request took
    fn record_duration(&self, namespace: &str, seconds: f64);

    /// Set the number of compiled rules currently active
    fn set_active_rules(&self, count: usize);

    /// Record a rule cache hit
    fn record_cache_hit(&self);

    /// Record a rule cache miss
    fn record_cache_miss(&self);
}

/// Sink that discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn record_mutation(&self, _: &str, _: &str, _: &str, _: MutationStatus) {}
    fn record_duration(&self, _: &str, _: f64) {}
    fn set_active_rules(&self, _: usize) {}
    fn record_cache_hit(&self) {}
    fn record_cache_miss(&self) {}
}

/// Sink backed by OpenTelemetry instruments on the global meter
#[derive(Debug, Default, Clone, Copy)]
pub struct OtelMetrics;

impl MetricsSink for OtelMetrics {
    fn record_mutation(
        &self,
        namespace: &str,
        source_registry: &str,
        target_registry: &str,
        status: MutationStatus,
    ) {
        MUTATIONS_TOTAL.add(
            1,
            &[
                KeyValue::new("namespace", namespace.to_string()),
                KeyValue::new("source_registry", source_registry.to_string()),
                KeyValue::new("target_registry", target_registry.to_string()),
                KeyValue::new("status", status.as_str()),
            ],
        );
    }

    fn record_duration(&self, namespace: &str, seconds: f64) {
        MUTATION_DURATION.record(
            seconds,
            &[KeyValue::new("namespace", namespace.to_string())],
        );
    }

    fn set_active_rules(&self, count: usize) {
        RULES_COUNT.record(count as i64, &[]);
    }

    fn record_cache_hit(&self) {
        CACHE_HITS.add(1, &[]);
    }

    fn record_cache_miss(&self) {
        CACHE_MISSES.add(1, &[]);
    }
}

/// Times one admission request
pub struct MutationTimer {
    namespace: String,
    start: Instant,
}

impl MutationTimer {
    /// Start timing a request for a Pod in `namespace`
    pub fn start(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            start: Instant::now(),
        }
    }

    /// Record the elapsed time to `sink`
    pub fn finish(self, sink: &dyn MetricsSink) {
        sink.record_duration(&self.namespace, self.start.elapsed().as_secs_f64());
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::atomic::{AtomicU64, Ordering};

    use parking_lot::Mutex;

    use super::*;

    /// Sink that remembers what was recorded
    #[derive(Debug, Default)]
    pub struct RecordingMetrics {
        pub hits: AtomicU64,
        pub misses: AtomicU64,
        pub active_rules: Mutex<Option<usize>>,
        pub mutations: Mutex<Vec<(String, String, String, MutationStatus)>>,
        pub durations: Mutex<Vec<String>>,
    }

    impl RecordingMetrics {
        pub fn hits(&self) -> u64 {
            self.hits.load(Ordering::SeqCst)
        }

        pub fn misses(&self) -> u64 {
            self.misses.load(Ordering::SeqCst)
        }
    }

    impl MetricsSink for RecordingMetrics {
        fn record_mutation(
            &self,
            namespace: &str,
            source_registry: &str,
            target_registry: &str,
            status: MutationStatus,
        ) {
            self.mutations.lock().push((
                namespace.to_string(),
                source_registry.to_string(),
                target_registry.to_string(),
                status,
            ));
        }

        fn record_duration(&self, namespace: &str, _seconds: f64) {
            self.durations.lock().push(namespace.to_string());
        }

        fn set_active_rules(&self, count: usize) {
            *self.active_rules.lock() = Some(count);
        }

        fn record_cache_hit(&self) {
            self.hits.fetch_add(1, Ordering::SeqCst);
        }

        fn record_cache_miss(&self) {
            self.misses.fetch_add(1, Ordering::SeqCst);
        }
    }
}
