// Prometheus metrics for the api.

use lazy_static::lazy_static;
use prometheus::{register_int_counter_vec, IntCounterVec, TextEncoder};
use tracing::error;

lazy_static! {
    pub static ref REGISTRATIONS: IntCounterVec = register_int_counter_vec!(
        "psjudge_api_registrations_total",
        "Registration requests by kind and outcome",
        &["kind", "outcome"]
    )
    .expect("metric can be registered");
}

pub fn render() -> Option<String> {
    match TextEncoder::new().encode_to_string(&prometheus::gather()) {
        Ok(body) => Some(body),
        Err(e) => {
            error!(error = %e, "Failed to encode metrics");
            None
        }
    }
}
