//! HTTP transport shared by the sampler and the metadata client.
//!
//! Connection establishment is observed through a connector layer so probe
//! timings can start at the moment a connection is usable instead of the moment
//! the request was issued.

use crate::{Error, Result, settings::HttpSettings};
use futures::future::BoxFuture;
use reqwest::{
    Client,
    header::{CACHE_CONTROL, CONNECTION, CONTENT_TYPE, HeaderMap, HeaderValue},
};
use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    task::{Context, Poll},
    time::{Duration, Instant},
};
use tower::{Layer, Service};

/// Records when the most recent connection finished establishing.
#[derive(Debug)]
pub struct ConnectClock {
    origin: Instant,
    // Nanoseconds since `origin`; zero until the first connection is made.
    last_ready_nanos: AtomicU64,
}

impl ConnectClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            last_ready_nanos: AtomicU64::new(0),
        }
    }

    pub fn mark_ready(&self) {
        self.mark_ready_at(Instant::now());
    }

    fn mark_ready_at(&self, at: Instant) {
        let nanos = u64::try_from(at.saturating_duration_since(self.origin).as_nanos())
            .unwrap_or(u64::MAX)
            .max(1);
        self.last_ready_nanos.store(nanos, Ordering::Release);
    }

    pub fn last_ready(&self) -> Option<Instant> {
        match self.last_ready_nanos.load(Ordering::Acquire) {
            0 => None,
            nanos => Some(self.origin + Duration::from_nanos(nanos)),
        }
    }

    /// Start of the measurement window for a request issued at `issued`: the
    /// instant a connection established after `issued` became ready, or
    /// `issued` itself when a pooled connection was reused.
    pub fn ready_since(&self, issued: Instant) -> Instant {
        match self.last_ready() {
            Some(ready) if ready > issued => ready,
            _ => issued,
        }
    }
}

impl Default for ConnectClock {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct ConnectTimingLayer {
    clock: Arc<ConnectClock>,
}

impl ConnectTimingLayer {
    pub fn new(clock: Arc<ConnectClock>) -> Self {
        Self { clock }
    }
}

impl<S> Layer<S> for ConnectTimingLayer {
    type Service = ConnectTiming<S>;

    fn layer(&self, inner: S) -> Self::Service {
        ConnectTiming {
            inner,
            clock: self.clock.clone(),
        }
    }
}

/// Connector wrapper that stamps the [`ConnectClock`] once a new connection
/// (including any TLS handshake) is handed to the pool.
#[derive(Debug, Clone)]
pub struct ConnectTiming<S> {
    inner: S,
    clock: Arc<ConnectClock>,
}

impl<S, R> Service<R> for ConnectTiming<S>
where
    S: Service<R>,
    S::Future: Send + 'static,
    S::Response: Send + 'static,
    S::Error: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, std::result::Result<S::Response, S::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: R) -> Self::Future {
        let clock = self.clock.clone();
        let connecting = self.inner.call(req);
        Box::pin(async move {
            let conn = connecting.await?;
            clock.mark_ready();
            Ok(conn)
        })
    }
}

/// Build the keep-alive client used for every request of a session.
pub fn build_client(settings: &HttpSettings, clock: Arc<ConnectClock>) -> Result<Client> {
    let mut headers = HeaderMap::new();
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
    headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain;charset=UTF-8"),
    );

    Client::builder()
        .user_agent(settings.user_agent.as_str())
        .default_headers(headers)
        .pool_max_idle_per_host(settings.pool_max_idle_per_host)
        .timeout(settings.timeout())
        .connector_layer(ConnectTimingLayer::new(clock))
        .build()
        .map_err(|err| Error::HttpClient(Box::new(err)))
}
