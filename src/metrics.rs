//! Prometheus metrics, exposed by the API listener.

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge, register_gauge_vec, CounterVec, Gauge, GaugeVec,
};

lazy_static! {
    pub static ref BLOCKS_PROCESSED: CounterVec = register_counter_vec!(
        "custody_blocks_processed_total",
        "Total number of blocks processed",
        &["chain"]
    )
    .unwrap();

    pub static ref LATEST_BLOCK: GaugeVec = register_gauge_vec!(
        "custody_latest_block",
        "Latest block number processed",
        &["chain"]
    )
    .unwrap();

    pub static ref DEPOSITS_DETECTED: CounterVec = register_counter_vec!(
        "custody_deposits_detected_total",
        "Total number of deposits detected",
        &["chain"]
    )
    .unwrap();

    pub static ref SENDS_BROADCAST: CounterVec = register_counter_vec!(
        "custody_sends_broadcast_total",
        "Total number of transactions broadcast",
        &["chain", "status"]
    )
    .unwrap();

    pub static ref ERRORS: CounterVec = register_counter_vec!(
        "custody_errors_total",
        "Total number of step errors",
        &["component"]
    )
    .unwrap();

    pub static ref UP: Gauge = register_gauge!(
        "custody_up",
        "Whether the operator is up and running"
    )
    .unwrap();
}

/// Record a block processed.
pub fn record_block_processed(chain: &str, block_number: u64) {
    BLOCKS_PROCESSED.with_label_values(&[chain]).inc();
    LATEST_BLOCK
        .with_label_values(&[chain])
        .set(block_number as f64);
}

/// Record a deposit detected.
pub fn record_deposit_detected(chain: &str) {
    DEPOSITS_DETECTED.with_label_values(&[chain]).inc();
}

/// Record a broadcast attempt.
pub fn record_broadcast(chain: &str, success: bool) {
    let status = if success { "success" } else { "failure" };
    SENDS_BROADCAST.with_label_values(&[chain, status]).inc();
}

/// Record a step error.
pub fn record_error(component: &str) {
    ERRORS.with_label_values(&[component]).inc();
}
