use crate::types::{DerivedSample, RawSample};

/// Bytes in one megabit.
const BYTES_PER_MEGABIT: f64 = 125_000.0;

/// Lower bound for ping, in seconds. Applied when the server-reported time
/// swallows the whole time to first byte.
pub const MIN_PING_SECS: f64 = 0.001;

/// Turn raw probe timings into rounded latency and throughput figures.
pub fn derive(raw: &RawSample) -> DerivedSample {
    let server_timing = raw.server_timing.as_secs_f64();
    let ttfb = raw.ttfb.as_secs_f64();
    let ttlb = raw.ttlb.as_secs_f64();

    let mut ping = ttfb - server_timing;
    if ping <= 0.0 {
        ping = MIN_PING_SECS;
    }

    let transfer_duration = ping + ttlb;
    let payload_megabits = raw.payload_size_bytes as f64 / BYTES_PER_MEGABIT;
    let speed_mbps = payload_megabits / transfer_duration;

    DerivedSample {
        direction: raw.direction,
        payload_size_bytes: raw.payload_size_bytes,
        server_timing: round3(server_timing),
        ping: round3(ping),
        transfer_duration: round3(transfer_duration),
        speed_mbps: round3(speed_mbps),
        ttfb: round3(ttfb),
        ttlb: round3(ttlb),
    }
}

/// Round half away from zero to three decimal places.
pub fn round3(value: f64) -> f64 {
    (value * 1_000.0).round() / 1_000.0
}
