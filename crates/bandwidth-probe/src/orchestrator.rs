use crate::{
    Error, Result,
    aggregator::{AggregatorOutcome, PercentileAggregator},
    plan::TestPlan,
    sampler::Probe,
    types::{ConnectionMetadata, Direction, PercentileSummary, RawSample, SessionSummary, TestCase},
    urls::UrlProvider,
};
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

/// Final state of a session.
#[derive(Debug)]
pub enum SessionOutcome {
    /// Every planned probe succeeded.
    Completed(SessionSummary),
    /// A probe failed or the probe task died; `last` is the final summary
    /// emitted before that.
    Aborted {
        last: Option<SessionSummary>,
        error: Error,
    },
}

impl SessionOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, SessionOutcome::Completed(_))
    }

    pub fn summary(&self) -> Option<&SessionSummary> {
        match self {
            SessionOutcome::Completed(summary) => Some(summary),
            SessionOutcome::Aborted { last, .. } => last.as_ref(),
        }
    }

    pub fn error(&self) -> Option<&Error> {
        match self {
            SessionOutcome::Completed(_) => None,
            SessionOutcome::Aborted { error, .. } => Some(error),
        }
    }
}

/// Runs a test plan through a sampler and streams the results into a
/// [`PercentileAggregator`].
pub struct TestOrchestrator<P> {
    sampler: P,
    urls: UrlProvider,
    plan: TestPlan,
    test_id: u64,
}

impl<P> TestOrchestrator<P>
where
    P: Probe + 'static,
{
    pub fn new(sampler: P, urls: UrlProvider, plan: TestPlan, test_id: u64) -> Self {
        Self {
            sampler,
            urls,
            plan,
            test_id,
        }
    }

    /// Spawn the producer and aggregator tasks. Summaries are available from
    /// the returned [`Session`] as each sample is aggregated.
    pub fn start(self, metadata: ConnectionMetadata, cancel: CancellationToken) -> Session {
        let total = self.plan.total_iterations();
        info!(
            test_id = self.test_id,
            cases = self.plan.cases().len(),
            downloads = self.plan.iterations_for(Direction::Download),
            uploads = self.plan.iterations_for(Direction::Upload),
            total_iterations = total,
            "starting measurement session"
        );

        // Sized to the whole plan so neither task ever waits on a slow consumer
        let (sample_tx, sample_rx) = mpsc::channel(total);
        let (summary_tx, summary_rx) = mpsc::channel(total);
        let (error_tx, error_rx) = oneshot::channel();

        let aggregator = PercentileAggregator::new(metadata.clone(), summary_tx);
        let aggregator = tokio::spawn(aggregator.listen(sample_rx, error_rx));

        let producer = Producer {
            sampler: self.sampler,
            urls: self.urls,
            plan: self.plan,
            test_id: self.test_id,
            samples: sample_tx,
            errors: error_tx,
        };
        let producer = tokio::spawn(producer.run(cancel));

        Session {
            summaries: summary_rx,
            producer,
            aggregator,
            metadata,
        }
    }

    /// Run the whole plan, logging each intermediate summary.
    pub async fn run(
        self,
        metadata: ConnectionMetadata,
        cancel: CancellationToken,
    ) -> Result<SessionOutcome> {
        let mut session = self.start(metadata, cancel);
        while let Some(summary) = session.next_summary().await {
            log_progress(&summary.bandwidth, summary.test_results.len());
        }
        session.finish().await
    }
}

/// Handle to a running session.
pub struct Session {
    summaries: mpsc::Receiver<SessionSummary>,
    producer: JoinHandle<()>,
    aggregator: JoinHandle<AggregatorOutcome>,
    metadata: ConnectionMetadata,
}

impl Session {
    /// The next live summary; `None` once the aggregator has closed.
    pub async fn next_summary(&mut self) -> Option<SessionSummary> {
        self.summaries.recv().await
    }

    /// Wait for both tasks and report how the session ended. A producer that
    /// died without reporting still yields the summaries aggregated so far.
    pub async fn finish(self) -> Result<SessionOutcome> {
        let (producer, aggregator) = tokio::join!(self.producer, self.aggregator);
        let AggregatorOutcome { last, error } = aggregator?;

        let error = match (error, producer) {
            (Some(error), _) => Some(error),
            (None, Err(join_err)) => {
                error!(%join_err, "probe task ended abnormally");
                Some(Error::Task(join_err))
            }
            (None, Ok(())) => None,
        };

        let outcome = match error {
            Some(error) => {
                let cause = if error.is_probe_failure() {
                    "probe"
                } else {
                    "pipeline"
                };
                metrics::counter!("bandwidth_probe_session_aborted", "cause" => cause).increment(1);
                warn!(
                    %error,
                    completed = last.as_ref().map_or(0, |s| s.test_results.len()),
                    "measurement session aborted"
                );
                SessionOutcome::Aborted { last, error }
            }
            None => {
                let summary = last.unwrap_or_else(|| SessionSummary {
                    metadata: self.metadata,
                    bandwidth: PercentileSummary::default(),
                    test_results: Vec::new(),
                });
                info!(
                    samples = summary.test_results.len(),
                    "measurement session completed"
                );
                SessionOutcome::Completed(summary)
            }
        };

        Ok(outcome)
    }
}

/// Issues the planned probes one after another. Owns both senders, so the
/// sample stream and the error signal are each closed exactly once, when this
/// is dropped.
struct Producer<P> {
    sampler: P,
    urls: UrlProvider,
    plan: TestPlan,
    test_id: u64,
    samples: mpsc::Sender<RawSample>,
    errors: oneshot::Sender<Error>,
}

impl<P: Probe> Producer<P> {
    async fn run(self, cancel: CancellationToken) {
        let Producer {
            sampler,
            urls,
            plan,
            test_id,
            samples,
            errors,
        } = self;

        for (case_idx, case) in plan.cases().iter().enumerate() {
            let url = match endpoint(&urls, test_id, case) {
                Ok(url) => url,
                Err(err) => {
                    error!(%err, case = case_idx, "failed to build probe url");
                    report_failure(errors, err);
                    return;
                }
            };

            debug!(
                case = case_idx,
                direction = %case.direction,
                bytes = case.payload_size_bytes,
                iterations = case.iterations,
                "running test case"
            );

            for iteration in 0..case.iterations {
                match sampler
                    .probe(&cancel, &url, case.direction, case.payload_size_bytes)
                    .await
                {
                    Ok(sample) => {
                        metrics::counter!(
                            "bandwidth_probe_probe_completed",
                            "direction" => case.direction.to_string()
                        )
                        .increment(1);
                        if samples.send(sample).await.is_err() {
                            warn!("aggregator is gone; halting remaining probes");
                            return;
                        }
                    }
                    Err(err) => {
                        metrics::counter!(
                            "bandwidth_probe_probe_failed",
                            "direction" => case.direction.to_string()
                        )
                        .increment(1);
                        error!(
                            %err,
                            case = case_idx,
                            iteration,
                            "probe failed; aborting session"
                        );
                        report_failure(errors, err);
                        return;
                    }
                }
            }
        }

        debug!("all probes issued; closing sample stream");
    }
}

fn report_failure(errors: oneshot::Sender<Error>, err: Error) {
    if errors.send(err).is_err() {
        warn!("aggregator is gone; probe error dropped");
    }
}

fn endpoint(urls: &UrlProvider, test_id: u64, case: &TestCase) -> Result<Url> {
    match case.direction {
        Direction::Download => urls.download_url(test_id, case.payload_size_bytes),
        Direction::Upload => urls.upload_url(test_id),
    }
}

fn log_progress(bandwidth: &PercentileSummary, samples: usize) {
    info!(
        samples,
        ping_p90 = bandwidth.ping,
        download_p90_mbps = bandwidth.download_speed_mbps,
        upload_p90_mbps = bandwidth.upload_speed_mbps,
        "summary updated"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sampler::MockProbe;
    use std::{
        sync::{
            Arc,
            atomic::{AtomicUsize, Ordering},
        },
        time::Duration,
    };

    fn sample(direction: Direction, payload_size_bytes: u64) -> RawSample {
        RawSample {
            direction,
            ttfb: Duration::from_millis(40),
            ttlb: Duration::from_millis(200),
            server_timing: Duration::from_millis(5),
            payload_size_bytes,
            token: "tok".to_string(),
        }
    }

    fn plan() -> TestPlan {
        TestPlan::new(vec![
            TestCase::download(1_000, 3),
            TestCase::upload(2_000, 2),
        ])
        .unwrap()
    }

    #[tokio::test]
    async fn test_successful_session_emits_one_summary_per_probe() {
        let mut sampler = MockProbe::new();
        sampler
            .expect_probe()
            .times(5)
            .returning(|_, _, direction, bytes| Ok(sample(direction, bytes)));

        let orchestrator =
            TestOrchestrator::new(sampler, UrlProvider::default(), plan(), 1);
        let mut session = orchestrator.start(ConnectionMetadata::default(), CancellationToken::new());

        let mut emitted = Vec::new();
        while let Some(summary) = session.next_summary().await {
            emitted.push(summary);
        }
        let outcome = session.finish().await.unwrap();

        assert_eq!(emitted.len(), 5);
        for (idx, summary) in emitted.iter().enumerate() {
            assert_eq!(summary.test_results.len(), idx + 1);
        }
        assert!(outcome.is_completed());
        assert!(outcome.error().is_none());

        let summary = outcome.summary().unwrap();
        let directions: Vec<_> = summary.test_results.iter().map(|r| r.direction).collect();
        assert_eq!(
            directions,
            vec![
                Direction::Download,
                Direction::Download,
                Direction::Download,
                Direction::Upload,
                Direction::Upload,
            ]
        );
        assert!(summary.bandwidth.download_speed_mbps.is_some());
        assert!(summary.bandwidth.upload_speed_mbps.is_some());
    }

    #[tokio::test]
    async fn test_probes_follow_plan_order_and_urls() {
        let calls = Arc::new(std::sync::Mutex::new(Vec::new()));
        let recorded = calls.clone();
        let mut sampler = MockProbe::new();
        sampler
            .expect_probe()
            .times(5)
            .returning(move |_, url, direction, bytes| {
                recorded.lock().unwrap().push(url.to_string());
                Ok(sample(direction, bytes))
            });

        let orchestrator = TestOrchestrator::new(sampler, UrlProvider::default(), plan(), 77);
        let outcome = orchestrator
            .run(ConnectionMetadata::default(), CancellationToken::new())
            .await
            .unwrap();

        assert!(outcome.is_completed());
        let calls = calls.lock().unwrap();
        assert_eq!(
            calls[0],
            "https://speed.cloudflare.com/__down?measId=77&bytes=1000"
        );
        assert_eq!(calls[3], "https://speed.cloudflare.com/__up?measId=77");
        assert_eq!(calls.len(), 5);
    }

    #[tokio::test]
    async fn test_first_failure_halts_remaining_probes() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        let mut sampler = MockProbe::new();
        sampler
            .expect_probe()
            .returning(move |_, _, direction, bytes| {
                let attempt = counter.fetch_add(1, Ordering::SeqCst);
                if attempt == 2 {
                    Err(Error::TokenExtraction { segments: 1 })
                } else {
                    Ok(sample(direction, bytes))
                }
            });

        let orchestrator = TestOrchestrator::new(sampler, UrlProvider::default(), plan(), 1);
        let mut session = orchestrator.start(ConnectionMetadata::default(), CancellationToken::new());

        let mut emitted = 0;
        while session.next_summary().await.is_some() {
            emitted += 1;
        }
        let outcome = session.finish().await.unwrap();

        // The failing probe is the last one ever issued
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert!(!outcome.is_completed());
        assert!(matches!(
            outcome.error(),
            Some(Error::TokenExtraction { segments: 1 })
        ));
        let summarized = outcome.summary().map_or(0, |s| s.test_results.len());
        assert_eq!(summarized, emitted);
        assert!(emitted <= 2);
    }

    #[tokio::test]
    async fn test_cancellation_aborts_through_error_path() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();

        let mut sampler = MockProbe::new();
        sampler
            .expect_probe()
            .returning(move |cancel, _, direction, bytes| {
                counter.fetch_add(1, Ordering::SeqCst);
                if cancel.is_cancelled() {
                    return Err(Error::Cancelled);
                }
                // Cancel while the first probe is "in flight"
                trigger.cancel();
                Ok(sample(direction, bytes))
            });

        let orchestrator = TestOrchestrator::new(sampler, UrlProvider::default(), plan(), 1);
        let outcome = orchestrator
            .run(ConnectionMetadata::default(), cancel)
            .await
            .unwrap();

        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        let error = outcome.error().unwrap();
        assert!(error.is_connection_failure());
        // Samples aggregated before the cancellation are kept
        assert!(outcome.summary().map_or(0, |s| s.test_results.len()) <= 1);
    }

    struct CrashingProbe {
        attempts: Arc<AtomicUsize>,
        crash_at: usize,
    }

    #[async_trait::async_trait]
    impl Probe for CrashingProbe {
        async fn probe(
            &self,
            _cancel: &CancellationToken,
            _url: &Url,
            direction: Direction,
            payload_size_bytes: u64,
        ) -> Result<RawSample> {
            if self.attempts.fetch_add(1, Ordering::SeqCst) == self.crash_at {
                panic!("sampler blew up");
            }
            Ok(sample(direction, payload_size_bytes))
        }
    }

    #[tokio::test]
    async fn test_crashed_producer_keeps_partial_results() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let sampler = CrashingProbe {
            attempts: attempts.clone(),
            crash_at: 2,
        };

        let orchestrator = TestOrchestrator::new(sampler, UrlProvider::default(), plan(), 1);
        let outcome = orchestrator
            .run(ConnectionMetadata::default(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert!(!outcome.is_completed());
        assert!(matches!(outcome.error(), Some(Error::Task(_))));
        // Both samples were queued before the crash and nothing outranks them
        assert_eq!(outcome.summary().unwrap().test_results.len(), 2);
    }

    #[tokio::test]
    async fn test_single_probe_plan() {
        let mut sampler = MockProbe::new();
        sampler
            .expect_probe()
            .times(1)
            .returning(|_, _, direction, bytes| Ok(sample(direction, bytes)));

        let plan = TestPlan::new(vec![TestCase::upload(125_000, 1)]).unwrap();
        let outcome = TestOrchestrator::new(sampler, UrlProvider::default(), plan, 9)
            .run(ConnectionMetadata::default(), CancellationToken::new())
            .await
            .unwrap();

        let summary = outcome.summary().unwrap();
        assert_eq!(summary.test_results.len(), 1);
        assert_eq!(summary.bandwidth.download_speed_mbps, None);
        assert_eq!(
            summary.bandwidth.upload_speed_mbps,
            Some(summary.test_results[0].speed_mbps)
        );
    }
}
