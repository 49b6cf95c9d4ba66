use crate::{
    Error, Result,
    settings::HttpSettings,
    transport::{ConnectClock, build_client},
    types::{Direction, RawSample},
};
use async_trait::async_trait;
use mockall::automock;
use reqwest::{Client, Response};
use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

const SERVER_TIMING: &str = "server-timing";
const TOKEN_DELIMITER: &[u8] = b"___";
const FILLER_BYTE: u8 = b'0';

/// Longest completion token accepted in a response body.
pub const MAX_TOKEN_LEN: usize = 4_096;

/// Bytes a download may carry beyond the requested payload: delimiter plus token.
const BODY_ALLOWANCE: u64 = (MAX_TOKEN_LEN + TOKEN_DELIMITER.len()) as u64;

/// A single timed exchange against a speed-test endpoint.
#[automock]
#[async_trait]
pub trait Probe: Send + Sync {
    async fn probe(
        &self,
        cancel: &CancellationToken,
        url: &Url,
        direction: Direction,
        payload_size_bytes: u64,
    ) -> Result<RawSample>;
}

/// Issues probes over a shared keep-alive client and times them from the
/// moment a connection is ready.
#[derive(Debug, Clone)]
pub struct BandwidthSampler {
    client: Client,
    clock: Arc<ConnectClock>,
}

impl BandwidthSampler {
    pub fn new(settings: &HttpSettings) -> Result<Self> {
        let clock = Arc::new(ConnectClock::new());
        let client = build_client(settings, clock.clone())?;
        Ok(Self { client, clock })
    }

    /// The underlying client, shared with other requests of the session.
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Connection-ready instants observed by this sampler's client.
    pub fn connect_clock(&self) -> &ConnectClock {
        &self.clock
    }

    async fn exchange(
        &self,
        url: &Url,
        direction: Direction,
        payload_size_bytes: u64,
    ) -> Result<RawSample> {
        let request = match direction {
            Direction::Download => self.client.get(url.clone()),
            Direction::Upload => self
                .client
                .post(url.clone())
                .body(filler_body(payload_size_bytes)),
        };

        let issued = Instant::now();
        let response = request.send().await.map_err(connection_failure)?;
        let first_byte = Instant::now();

        let response = response.error_for_status().map_err(connection_failure)?;
        let timing_header = response
            .headers()
            .get(SERVER_TIMING)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned);

        let (payload_size_bytes, token) = match direction {
            Direction::Download => read_download(response, payload_size_bytes).await?,
            // The upload endpoint does not echo the payload back
            Direction::Upload => (payload_size_bytes, read_reply(response).await?),
        };
        let last_byte = Instant::now();

        let ready = self.clock.ready_since(issued);
        let ttfb = first_byte.saturating_duration_since(ready);
        let ttlb = last_byte.saturating_duration_since(ready);

        let server_timing = timing_header
            .as_deref()
            .and_then(parse_server_timing)
            .ok_or_else(|| Error::TimingHeaderMissing(timing_header.clone()))?;

        debug!(
            %direction,
            %url,
            bytes = payload_size_bytes,
            ttfb_ms = ttfb.as_millis() as u64,
            ttlb_ms = ttlb.as_millis() as u64,
            server_ms = server_timing.as_millis() as u64,
            "probe complete"
        );

        Ok(RawSample {
            direction,
            ttfb,
            ttlb,
            server_timing,
            payload_size_bytes,
            token,
        })
    }
}

#[async_trait]
impl Probe for BandwidthSampler {
    async fn probe(
        &self,
        cancel: &CancellationToken,
        url: &Url,
        direction: Direction,
        payload_size_bytes: u64,
    ) -> Result<RawSample> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            result = self.exchange(url, direction, payload_size_bytes) => result,
        }
    }
}

fn connection_failure(err: reqwest::Error) -> Error {
    Error::ConnectionFailure(Box::new(err))
}

fn body_read_failure(err: reqwest::Error) -> Error {
    Error::BodyReadFailure(Box::new(err))
}

fn check_declared_length(response: &Response, limit: u64) -> Result<()> {
    match response.content_length() {
        Some(declared) if declared > limit => Err(Error::BodyTooLarge {
            limit,
            received: declared,
        }),
        _ => Ok(()),
    }
}

/// Count the download body and pull the token out of it without buffering the
/// payload.
async fn read_download(mut response: Response, payload_size_bytes: u64) -> Result<(u64, String)> {
    let limit = payload_size_bytes.saturating_add(BODY_ALLOWANCE);
    check_declared_length(&response, limit)?;

    let mut received = 0u64;
    let mut scanner = TokenScanner::default();
    while let Some(chunk) = response.chunk().await.map_err(body_read_failure)? {
        received += chunk.len() as u64;
        if received > limit {
            return Err(Error::BodyTooLarge { limit, received });
        }
        scanner.feed(&chunk)?;
    }

    Ok((received, scanner.finish()?))
}

/// The upload endpoint answers with a short token-like body.
async fn read_reply(mut response: Response) -> Result<String> {
    check_declared_length(&response, BODY_ALLOWANCE)?;

    let mut body = Vec::new();
    while let Some(chunk) = response.chunk().await.map_err(body_read_failure)? {
        body.extend_from_slice(&chunk);
        if body.len() as u64 > BODY_ALLOWANCE {
            return Err(Error::BodyTooLarge {
                limit: BODY_ALLOWANCE,
                received: body.len() as u64,
            });
        }
    }

    Ok(String::from_utf8_lossy(&body).into_owned())
}

fn filler_body(payload_size_bytes: u64) -> Vec<u8> {
    vec![FILLER_BYTE; payload_size_bytes as usize]
}

/// Extract the `dur` parameter (milliseconds) of the first server-timing
/// metric that carries one, rounded to the nearest whole millisecond.
///
/// Returns `None` when no metric has a `dur` parameter or its value is not a
/// finite, non-negative number.
pub fn parse_server_timing(value: &str) -> Option<Duration> {
    let raw = value
        .split(',')
        .flat_map(|metric| metric.split(';').skip(1))
        .filter_map(|param| param.split_once('='))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("dur"))
        .map(|(_, dur)| dur.trim().trim_matches('"'))?;

    let millis: f64 = raw.parse().ok()?;
    if !millis.is_finite() || millis < 0.0 {
        return None;
    }

    Some(Duration::from_millis(millis.round() as u64))
}

/// Incremental search for the completion token: the bytes between the first
/// and second `___` of a body, or up to its end when there is no second one.
#[derive(Debug, Default)]
pub struct TokenScanner {
    // Unmatched tail kept while looking for the opening delimiter
    carry: Vec<u8>,
    token: Option<Vec<u8>>,
    closed: bool,
}

impl TokenScanner {
    pub fn feed(&mut self, chunk: &[u8]) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        if self.token.is_some() {
            return self.append_token(chunk);
        }

        self.carry.extend_from_slice(chunk);
        let Some(at) = find(&self.carry, TOKEN_DELIMITER) else {
            let keep_from = self.carry.len().saturating_sub(TOKEN_DELIMITER.len() - 1);
            self.carry.drain(..keep_from);
            return Ok(());
        };

        let rest = self.carry.split_off(at + TOKEN_DELIMITER.len());
        self.carry.clear();
        self.token = Some(Vec::new());
        self.append_token(&rest)
    }

    fn append_token(&mut self, bytes: &[u8]) -> Result<()> {
        let Some(token) = self.token.as_mut() else {
            return Ok(());
        };

        // A closing delimiter may straddle the previous chunk
        let from = token.len().saturating_sub(TOKEN_DELIMITER.len() - 1);
        token.extend_from_slice(bytes);
        if let Some(at) = find(&token[from..], TOKEN_DELIMITER) {
            token.truncate(from + at);
            self.closed = true;
        } else if token.len() > MAX_TOKEN_LEN {
            return Err(Error::TokenTooLong {
                limit: MAX_TOKEN_LEN,
            });
        }

        Ok(())
    }

    pub fn finish(self) -> Result<String> {
        match self.token {
            Some(token) => Ok(String::from_utf8_lossy(&token).into_owned()),
            None => Err(Error::TokenExtraction { segments: 1 }),
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// The completion token trails a download body after a `___` delimiter.
pub fn extract_token(body: &[u8]) -> Result<String> {
    let mut scanner = TokenScanner::default();
    scanner.feed(body)?;
    scanner.finish()
}
