//! Intake counters exposed at `/metrics` in Prometheus text format.

use lazy_static::lazy_static;
use prometheus::{register_int_counter_vec, Encoder, IntCounterVec, TextEncoder};

lazy_static! {
    pub static ref SUBMISSIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "crucible_submissions_total",
        "Jobs accepted at intake, by language.",
        &["language"]
    )
    .unwrap();
    pub static ref INTAKE_REJECTIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "crucible_intake_rejections_total",
        "Submissions refused before enqueue, by reason.",
        &["reason"]
    )
    .unwrap();
    pub static ref CANCELLATIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "crucible_cancellations_total",
        "Cancellation requests, by outcome.",
        &["outcome"]
    )
    .unwrap();
}

pub fn render() -> Result<Vec<u8>, prometheus::Error> {
    let mut buffer = Vec::new();
    TextEncoder::new().encode(&prometheus::gather(), &mut buffer)?;
    Ok(buffer)
}
