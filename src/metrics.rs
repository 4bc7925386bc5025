use lazy_static::lazy_static;
use prometheus::{
    register_int_counter, register_int_gauge, Encoder, IntCounter, IntGauge, TextEncoder,
};

lazy_static! {
    pub static ref ACTIVE_ROOMS: IntGauge =
        register_int_gauge!("tandem_active_rooms", "Number of currently active rooms").unwrap();
    pub static ref ACTIVE_PEERS: IntGauge = register_int_gauge!(
        "tandem_active_peers",
        "Number of currently connected peer servers"
    )
    .unwrap();
    pub static ref KEYFRAMES_REQUESTED_TOTAL: IntCounter = register_int_counter!(
        "tandem_keyframes_requested_total",
        "Total number of PLIs (keyframe requests) sent to publishers"
    )
    .unwrap();
    pub static ref SIGNALING_ROUNDS_TOTAL: IntCounter = register_int_counter!(
        "tandem_signaling_rounds_total",
        "Total number of global SDP signaling rounds"
    )
    .unwrap();
    pub static ref ROOMS_ENDED_TOTAL: IntCounter = register_int_counter!(
        "tandem_rooms_ended_total",
        "Total number of rooms that reached their countdown end"
    )
    .unwrap();
}

pub fn register_metrics() {
    // Force initialization of lazy_statics
    let _ = ACTIVE_ROOMS.get();
    let _ = ACTIVE_PEERS.get();
    let _ = KEYFRAMES_REQUESTED_TOTAL.get();
    let _ = SIGNALING_ROUNDS_TOTAL.get();
    let _ = ROOMS_ENDED_TOTAL.get();
}

/// Encode the default registry in Prometheus text format for the /metrics route.
pub fn render() -> String {
    let encoder = TextEncoder::new();
    let families = prometheus::gather();
    let mut out = Vec::new();
    if encoder.encode(&families, &mut out).is_err() {
        return String::new();
    }
    String::from_utf8(out).unwrap_or_default()
}
