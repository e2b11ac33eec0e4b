//! Metrics for the registry cache extension
//!
//! Instruments are created lazily on the global meter; without an OTLP
//! endpoint they are no-ops.

use once_cell::sync::Lazy;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Histogram, Meter};
use opentelemetry::KeyValue;

static METER: Lazy<Meter> = Lazy::new(|| global::meter("registry_cache"));

/// Histogram of actuator operation duration
///
/// Labels:
/// - `operation`: reconcile, delete, force_delete, migrate, restore
/// - `result`: success, error
pub static RECONCILE_DURATION: Lazy<Histogram<f64>> = Lazy::new(|| {
    METER
        .f64_histogram("registry_cache_reconcile_duration_seconds")
        .with_description("Duration of extension operations in seconds")
        .with_unit("s")
        .build()
});

/// Counter of actuator operation errors
///
/// Labels:
/// - `operation`: reconcile, delete, force_delete, migrate, restore
/// - `error_type`: see `Error::kind`
pub static RECONCILE_ERRORS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("registry_cache_reconcile_errors_total")
        .with_description("Total number of failed extension operations")
        .with_unit("{errors}")
        .build()
});

/// Counter of admission requests
///
/// Labels:
/// - `webhook`: shoot-validator, osc-mutator
/// - `allowed`: true, false
pub static ADMISSION_REQUESTS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("registry_cache_admission_requests_total")
        .with_description("Total number of admission requests handled")
        .with_unit("{requests}")
        .build()
});

/// Times one actuator operation
pub struct OperationTimer {
    operation: &'static str,
    start: std::time::Instant,
}

impl OperationTimer {
    /// Start timing `operation`
    pub fn start(operation: &'static str) -> Self {
        Self {
            operation,
            start: std::time::Instant::now(),
        }
    }

    /// Record successful completion
    pub fn success(self) {
        RECONCILE_DURATION.record(
            self.start.elapsed().as_secs_f64(),
            &[
                KeyValue::new("operation", self.operation),
                KeyValue::new("result", "success"),
            ],
        );
    }

    /// Record failed completion
    pub fn error(self, error_type: &'static str) {
        RECONCILE_DURATION.record(
            self.start.elapsed().as_secs_f64(),
            &[
                KeyValue::new("operation", self.operation),
                KeyValue::new("result", "error"),
            ],
        );
        RECONCILE_ERRORS.add(
            1,
            &[
                KeyValue::new("operation", self.operation),
                KeyValue::new("error_type", error_type),
            ],
        );
    }
}

/// Record one admission decision
pub fn record_admission(webhook: &'static str, allowed: bool) {
    ADMISSION_REQUESTS.add(
        1,
        &[
            KeyValue::new("webhook", webhook),
            KeyValue::new("allowed", allowed.to_string()),
        ],
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timers_record_without_exporter() {
        OperationTimer::start("reconcile").success();
        OperationTimer::start("delete").error("timeout");
        record_admission("shoot-validator", false);
    }
}
