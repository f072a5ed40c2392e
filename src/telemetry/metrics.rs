//! Metric instrument factories for txbulk.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created from the versioned `txbulk` scope. Workers build
//! one [`BulkInstruments`] each instead of calling the factories per event.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for txbulk instruments.
fn meter() -> Meter {
    opentelemetry::global::meter_with_scope(super::scope())
}

/// Counter: transactions opened successfully.
/// Labels: `worker`.
pub fn tx_opened() -> Counter<u64> {
    meter()
        .u64_counter("txbulk.tx.opened")
        .with_description("Number of backend transactions opened")
        .build()
}

/// Counter: transaction open failures.
pub fn tx_open_failures() -> Counter<u64> {
    meter()
        .u64_counter("txbulk.tx.open_failures")
        .with_description("Number of backend transaction opens that failed")
        .build()
}

/// Counter: items executed inside transactions.
/// Labels: `worker`.
pub fn items_executed() -> Counter<u64> {
    meter()
        .u64_counter("txbulk.items.executed")
        .with_description("Number of work items executed")
        .build()
}

/// Counter: fatal work source errors.
pub fn source_errors() -> Counter<u64> {
    meter()
        .u64_counter("txbulk.source.errors")
        .with_description("Number of fatal work source errors")
        .build()
}

/// Histogram: items packed into one transaction.
pub fn tx_items() -> Histogram<u64> {
    meter()
        .u64_histogram("txbulk.tx.items")
        .with_description("Items packed per transaction")
        .build()
}

/// Histogram: bulk run duration in milliseconds.
/// Labels: `result` ("ok" | "error").
pub fn bulk_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("txbulk.bulk.duration_ms")
        .with_description("Bulk run duration in milliseconds")
        .with_unit("ms")
        .build()
}

/// The per-worker instrument set.
#[derive(Clone)]
pub struct BulkInstruments {
    pub tx_opened: Counter<u64>,
    pub tx_open_failures: Counter<u64>,
    pub items_executed: Counter<u64>,
    pub source_errors: Counter<u64>,
    pub tx_items: Histogram<u64>,
}

impl BulkInstruments {
    pub fn new() -> Self {
        Self {
            tx_opened: tx_opened(),
            tx_open_failures: tx_open_failures(),
            items_executed: items_executed(),
            source_errors: source_errors(),
            tx_items: tx_items(),
        }
    }
}

impl Default for BulkInstruments {
    fn default() -> Self {
        Self::new()
    }
}
