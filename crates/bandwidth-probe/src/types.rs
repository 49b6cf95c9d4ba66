use serde::{Deserialize, Serialize};
use std::{fmt, time::Duration};
use tabled::Tabled;

/// Which way the payload travels during a probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Upload,
    Download,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Upload => write!(f, "upload"),
            Direction::Download => write!(f, "download"),
        }
    }
}

/// One row of the test plan: probe `iterations` times with a payload of
/// `payload_size_bytes` in the given direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCase {
    pub payload_size_bytes: u64,
    pub iterations: u32,
    pub direction: Direction,
}

impl TestCase {
    pub const fn download(payload_size_bytes: u64, iterations: u32) -> Self {
        Self {
            payload_size_bytes,
            iterations,
            direction: Direction::Download,
        }
    }

    pub const fn upload(payload_size_bytes: u64, iterations: u32) -> Self {
        Self {
            payload_size_bytes,
            iterations,
            direction: Direction::Upload,
        }
    }
}

/// Timings captured for a single probe, straight off the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawSample {
    pub direction: Direction,
    /// Connection ready to first response byte
    pub ttfb: Duration,
    /// Connection ready to response body fully drained
    pub ttlb: Duration,
    /// Processing time reported by the server
    pub server_timing: Duration,
    pub payload_size_bytes: u64,
    pub token: String,
}

/// Metrics derived from a [`RawSample`]. Times are seconds, speed is Mbps, all
/// rounded to three decimal places.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Tabled)]
#[serde(rename_all = "camelCase")]
pub struct DerivedSample {
    #[tabled(rename = "Direction")]
    pub direction: Direction,
    #[tabled(rename = "Bytes")]
    pub payload_size_bytes: u64,
    #[tabled(rename = "Server (s)")]
    pub server_timing: f64,
    #[tabled(rename = "Ping (s)")]
    pub ping: f64,
    #[tabled(rename = "Transfer (s)")]
    pub transfer_duration: f64,
    #[tabled(rename = "Speed (Mbps)")]
    pub speed_mbps: f64,
    #[tabled(rename = "TTFB (s)")]
    pub ttfb: f64,
    #[tabled(rename = "TTLB (s)")]
    pub ttlb: f64,
}

/// Nearest-rank 90th percentiles over the samples collected so far. A field is
/// `None` until at least one relevant sample exists.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PercentileSummary {
    pub ping: Option<f64>,
    pub download_speed_mbps: Option<f64>,
    pub upload_speed_mbps: Option<f64>,
}

/// Context about the measuring client as reported by the metadata endpoint.
/// The pipeline carries it through untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConnectionMetadata {
    pub hostname: Option<String>,
    pub client_ip: Option<String>,
    pub http_protocol: Option<String>,
    pub asn: Option<u32>,
    pub as_organization: Option<String>,
    pub colo: Option<String>,
    pub country: Option<String>,
    pub city: Option<String>,
    pub region: Option<String>,
    pub postal_code: Option<String>,
    pub latitude: Option<String>,
    pub longitude: Option<String>,
}

/// Snapshot emitted by the aggregator after every sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub metadata: ConnectionMetadata,
    pub bandwidth: PercentileSummary,
    pub test_results: Vec<DerivedSample>,
}
