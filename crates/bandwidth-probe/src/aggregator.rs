use crate::{
    Error, calculator,
    types::{ConnectionMetadata, DerivedSample, Direction, PercentileSummary, RawSample, SessionSummary},
};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

pub const SUMMARY_PERCENTILE: u32 = 90;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregatorState {
    Listening,
    Closed,
}

/// How a listening session ended. `error` is set when the producer reported a
/// fatal failure; `last` is the final summary emitted before the end, if any.
#[derive(Debug)]
pub struct AggregatorOutcome {
    pub last: Option<SessionSummary>,
    pub error: Option<Error>,
}

/// Accumulates derived samples and publishes a fresh [`SessionSummary`] after
/// each one. The accumulated results are owned here and nowhere else.
pub struct PercentileAggregator {
    metadata: ConnectionMetadata,
    results: Vec<DerivedSample>,
    state: AggregatorState,
    summaries: mpsc::Sender<SessionSummary>,
}

impl PercentileAggregator {
    pub fn new(metadata: ConnectionMetadata, summaries: mpsc::Sender<SessionSummary>) -> Self {
        Self {
            metadata,
            results: Vec::new(),
            state: AggregatorState::Listening,
            summaries,
        }
    }

    pub fn state(&self) -> AggregatorState {
        self.state
    }

    pub fn results(&self) -> &[DerivedSample] {
        &self.results
    }

    /// Derive metrics for `raw`, append them and return the updated snapshot.
    /// Returns `None` once the aggregator is closed.
    pub fn ingest(&mut self, raw: &RawSample) -> Option<SessionSummary> {
        if self.state == AggregatorState::Closed {
            return None;
        }

        let derived = calculator::derive(raw);
        metrics::histogram!(
            "bandwidth_probe_speed_mbps",
            "direction" => derived.direction.to_string()
        )
        .record(derived.speed_mbps);
        self.results.push(derived);

        Some(self.snapshot())
    }

    pub fn close(&mut self) {
        self.state = AggregatorState::Closed;
    }

    /// Percentiles over everything accumulated so far.
    pub fn summarize(&self) -> PercentileSummary {
        let mut pings = Vec::with_capacity(self.results.len());
        let mut downloads = Vec::new();
        let mut uploads = Vec::new();

        for result in &self.results {
            pings.push(result.ping);
            match result.direction {
                Direction::Download => downloads.push(result.speed_mbps),
                Direction::Upload => uploads.push(result.speed_mbps),
            }
        }

        PercentileSummary {
            ping: percentile_nearest_rank(&pings, SUMMARY_PERCENTILE),
            download_speed_mbps: percentile_nearest_rank(&downloads, SUMMARY_PERCENTILE),
            upload_speed_mbps: percentile_nearest_rank(&uploads, SUMMARY_PERCENTILE),
        }
    }

    pub fn snapshot(&self) -> SessionSummary {
        SessionSummary {
            metadata: self.metadata.clone(),
            bandwidth: self.summarize(),
            test_results: self.results.clone(),
        }
    }

    /// Consume samples until the producer closes the sample channel or reports
    /// a fatal error. A reported error wins over samples still queued.
    pub async fn listen(
        mut self,
        mut samples: mpsc::Receiver<RawSample>,
        mut errors: oneshot::Receiver<Error>,
    ) -> AggregatorOutcome {
        let mut last = None;
        let mut errors_open = true;

        loop {
            tokio::select! {
                biased;
                received = &mut errors, if errors_open => match received {
                    Ok(err) => {
                        warn!(
                            error = %err,
                            samples = self.results.len(),
                            "fatal probe error received; closing aggregator"
                        );
                        self.close();
                        return AggregatorOutcome { last, error: Some(err) };
                    }
                    // Producer finished without reporting an error
                    Err(_) => errors_open = false,
                },
                sample = samples.recv() => match sample {
                    Some(raw) => {
                        let Some(summary) = self.ingest(&raw) else {
                            continue;
                        };
                        debug!(
                            direction = %raw.direction,
                            bytes = raw.payload_size_bytes,
                            count = summary.test_results.len(),
                            "sample aggregated"
                        );
                        if self.summaries.send(summary.clone()).await.is_err() {
                            debug!("summary receiver dropped; continuing without live updates");
                        }
                        last = Some(summary);
                    }
                    None => {
                        info!(samples = self.results.len(), "sample stream closed; aggregation complete");
                        self.close();
                        return AggregatorOutcome { last, error: None };
                    }
                },
            }
        }
    }
}

/// Nearest-rank percentile: the value at 1-indexed rank `ceil(p/100 * n)` of the
/// ascending order. `None` for an empty input or a percentile outside 1..=100.
pub fn percentile_nearest_rank(values: &[f64], percentile: u32) -> Option<f64> {
    if values.is_empty() || percentile == 0 || percentile > 100 {
        return None;
    }

    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);

    let rank = (percentile as usize * sorted.len()).div_ceil(100);
    sorted.get(rank.max(1) - 1).copied()
}
