//! Serialized, rate-limited request dispatcher.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::request::{Credentials, FetchOptions, OutboundRequest};
use super::transport::{HttpTransport, Transport};
use crate::config::{DispatcherConfig, QuotagateConfig};
use crate::error::{DispatchError, Result};
use crate::ratelimit::{LimiterPolicy, RateLimiter};

/// A call waiting in the execution queue.
struct Job {
    id: Uuid,
    /// Request identity, credentials excluded
    url: String,
    outbound: OutboundRequest,
    retry_count: u32,
    reply: oneshot::Sender<Result<Value>>,
}

/// Releases a pending identity when dropped, so every exit path clears it.
struct PendingRelease<'a> {
    limiter: &'a RateLimiter,
    url: &'a str,
}

impl Drop for PendingRelease<'_> {
    fn drop(&mut self) {
        self.limiter.release_pending(self.url);
    }
}

/// Dispatches GET requests to a quota-constrained upstream.
///
/// Calls are queued FIFO and executed one at a time by a single worker task.
/// The worker asks the [`RateLimiter`] for an admission delay when a call
/// reaches the head of the queue, sleeps it off, issues the request, and
/// retries with exponential backoff while the upstream answers 429.
pub struct RequestDispatcher {
    queue: mpsc::Sender<Job>,
    limiter: Arc<RateLimiter>,
    default_timeout: Option<Duration>,
    shutdown: watch::Sender<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl RequestDispatcher {
    /// Create a dispatcher with default queue settings.
    ///
    /// Spawns the worker, so this must be called from a tokio runtime.
    pub fn new(limiter: Arc<RateLimiter>, transport: Arc<dyn Transport>) -> Self {
        Self::with_parts(limiter, transport, &DispatcherConfig::default())
    }

    /// Create a dispatcher with an HTTP transport and limiter built from configuration.
    pub fn from_config(config: &QuotagateConfig) -> Result<Self> {
        let limiter = Arc::new(RateLimiter::with_policy(LimiterPolicy::from(&config.limiter)));
        let transport = Arc::new(HttpTransport::new(&config.dispatcher)?);
        Ok(Self::with_parts(limiter, transport, &config.dispatcher))
    }

    /// Create a dispatcher from its collaborators.
    pub fn with_parts(
        limiter: Arc<RateLimiter>,
        transport: Arc<dyn Transport>,
        config: &DispatcherConfig,
    ) -> Self {
        let (queue, jobs) = mpsc::channel(config.queue_capacity);
        let (shutdown, shutdown_rx) = watch::channel(false);

        let worker = Worker {
            limiter: limiter.clone(),
            transport,
        };
        let handle = tokio::spawn(worker.run(jobs, shutdown_rx));

        info!(
            queue_capacity = config.queue_capacity,
            max_retries = limiter.max_retries(),
            "Request dispatcher started"
        );

        Self {
            queue,
            limiter,
            default_timeout: config.call_timeout(),
            shutdown,
            worker: Mutex::new(Some(handle)),
        }
    }

    /// The limiter this dispatcher consults.
    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Fetch `url` and decode the body as JSON.
    pub async fn fetch(&self, url: &str, credentials: &Credentials) -> Result<Value> {
        self.fetch_with(url, credentials, FetchOptions::default()).await
    }

    /// Fetch `url` and decode the body into `T`.
    pub async fn fetch_json<T: DeserializeOwned>(
        &self,
        url: &str,
        credentials: &Credentials,
    ) -> Result<T> {
        let value = self.fetch(url, credentials).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Fetch `url` with explicit per-call options.
    pub async fn fetch_with(
        &self,
        url: &str,
        credentials: &Credentials,
        options: FetchOptions,
    ) -> Result<Value> {
        let outbound = credentials.apply(url)?;
        let (reply, result) = oneshot::channel();
        let job = Job {
            id: Uuid::new_v4(),
            url: url.to_string(),
            outbound,
            retry_count: options.retry_count,
            reply,
        };

        let call = async {
            self.queue
                .send(job)
                .await
                .map_err(|_| DispatchError::Cancelled)?;
            result.await.map_err(|_| DispatchError::Cancelled)?
        };

        match options.timeout.or(self.default_timeout) {
            Some(after) => tokio::time::timeout(after, call).await.unwrap_or_else(|_| {
                warn!(url = %url, timeout_ms = after.as_millis() as u64, "Caller deadline elapsed");
                Err(DispatchError::TimedOut {
                    url: url.to_string(),
                    after,
                })
            }),
            None => call.await,
        }
    }

    /// Stop the worker. Queued and in-flight calls resolve to `Cancelled`.
    ///
    /// An in-flight backoff timer is dropped with its call. Timers of other
    /// dispatchers sharing the limiter keep running.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);

        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "Dispatcher worker failed");
            }
            info!("Request dispatcher stopped");
        }
    }
}

impl Drop for RequestDispatcher {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

/// Drains the execution queue one job at a time.
struct Worker {
    limiter: Arc<RateLimiter>,
    transport: Arc<dyn Transport>,
}

impl Worker {
    async fn run(self, mut jobs: mpsc::Receiver<Job>, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }

            let job = tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                job = jobs.recv() => match job {
                    Some(job) => job,
                    None => break,
                },
            };

            self.process(job, &mut shutdown).await;
        }

        jobs.close();
        let mut cancelled = 0usize;
        while let Ok(job) = jobs.try_recv() {
            let _ = job.reply.send(Err(DispatchError::Cancelled));
            cancelled += 1;
        }
        debug!(cancelled = cancelled, "Dispatcher worker exiting");
    }

    async fn process(&self, job: Job, shutdown: &mut watch::Receiver<bool>) {
        let Job {
            id,
            url,
            outbound,
            retry_count,
            mut reply,
        } = job;

        if reply.is_closed() {
            debug!(request_id = %id, url = %url, "Caller gone before start, skipping");
            return;
        }

        let result = tokio::select! {
            result = self.execute(id, &url, &outbound, retry_count) => result,
            _ = reply.closed() => {
                debug!(request_id = %id, url = %url, "Caller gone, abandoning request");
                return;
            }
            _ = shutdown.changed() => Err(DispatchError::Cancelled),
        };

        let _ = reply.send(result);
    }

    #[instrument(skip_all, fields(request_id = %id, url = %url))]
    async fn execute(
        &self,
        id: Uuid,
        url: &str,
        outbound: &OutboundRequest,
        mut retry: u32,
    ) -> Result<Value> {
        let max_retries = self.limiter.max_retries();
        let mut attempts = 0u32;

        loop {
            // Held through the network call so limiter-sharing dispatchers never overlap
            let turn = self.limiter.admission_turn().await;
            let delay = self.limiter.admission_delay(url, retry).await;
            let pending = PendingRelease {
                limiter: &self.limiter,
                url,
            };
            if !delay.is_zero() {
                debug!(delay_ms = delay.as_millis() as u64, retry = retry, "Waiting for admission");
                tokio::time::sleep(delay).await;
            }

            self.limiter.note_admitted();
            attempts += 1;
            let response = self.transport.get(outbound).await.map_err(|e| {
                error!(error = %e, "Transport failed");
                e
            })?;
            drop(turn);

            if response.is_throttled() {
                if retry >= max_retries {
                    warn!(attempts = attempts, retry = retry, "Rate limit retries exhausted");
                    return Err(DispatchError::RateLimitExhausted {
                        url: url.to_string(),
                        attempts,
                    });
                }

                let timer = self.limiter.backoff_delay(url, retry);
                warn!(
                    retry = retry,
                    backoff_ms = timer.delay().as_millis() as u64,
                    "Upstream throttled request, backing off"
                );
                timer.wait().await?;
                drop(pending);
                retry += 1;
                continue;
            }

            drop(pending);

            if !response.is_success() {
                let err = DispatchError::status(response.status, response.status_text());
                error!(status = response.status, "Upstream returned an error status");
                return Err(err);
            }

            return serde_json::from_slice(&response.body).map_err(|e| {
                error!(error = %e, "Response body is not valid JSON");
                DispatchError::from(e)
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::TransportResponse;
    use async_trait::async_trait;
    use serde::Deserialize;
    use std::collections::VecDeque;
    use tokio::time::Instant;
    use tokio_test::{assert_err, assert_ok};

    const SECOND: Duration = Duration::from_secs(1);

    /// A transport call as observed by the scripted transport.
    #[derive(Debug, Clone)]
    struct Call {
        url: String,
        started: Instant,
        finished: Instant,
    }

    /// Replays scripted responses and records every call.
    struct ScriptedTransport {
        script: Mutex<VecDeque<Result<TransportResponse>>>,
        fallback: TransportResponse,
        latency: Duration,
        calls: Mutex<Vec<Call>>,
    }

    impl ScriptedTransport {
        fn always(response: TransportResponse) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(VecDeque::new()),
                fallback: response,
                latency: Duration::from_millis(250),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn scripted(script: Vec<Result<TransportResponse>>, then: TransportResponse) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                fallback: then,
                latency: Duration::from_millis(250),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<Call> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn get(&self, request: &OutboundRequest) -> Result<TransportResponse> {
            let started = Instant::now();
            tokio::time::sleep(self.latency).await;
            let mut url = request.url.clone();
            url.set_query(None);
            self.calls.lock().push(Call {
                url: url.to_string(),
                started,
                finished: Instant::now(),
            });
            let next = self.script.lock().pop_front();
            next.unwrap_or_else(|| Ok(self.fallback.clone()))
        }
    }

    fn ok_json(body: &str) -> TransportResponse {
        TransportResponse::new(200, "OK", body)
    }

    fn throttled() -> TransportResponse {
        TransportResponse::new(429, "Too Many Requests", "")
    }

    fn dispatcher(transport: Arc<ScriptedTransport>) -> RequestDispatcher {
        RequestDispatcher::new(Arc::new(RateLimiter::new()), transport)
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_decodes_json() {
        let transport = ScriptedTransport::always(ok_json(r#"{"symbol":"AAPL","price":190.5}"#));
        let dispatcher = dispatcher(transport.clone());

        let value = assert_ok!(
            dispatcher
                .fetch("https://api.example.com/quote/AAPL", &Credentials::None)
                .await
        );

        assert_eq!(value["symbol"], "AAPL");
        assert_eq!(transport.calls().len(), 1);
        assert_eq!(dispatcher.limiter().snapshot().pending, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_json_typed() {
        #[derive(Debug, Deserialize)]
        struct Quote {
            symbol: String,
            price: f64,
        }

        let transport = ScriptedTransport::always(ok_json(r#"[{"symbol":"MSFT","price":410.0}]"#));
        let dispatcher = dispatcher(transport);

        let quotes: Vec<Quote> = dispatcher
            .fetch_json("https://api.example.com/quote/MSFT", &Credentials::api_key("k"))
            .await
            .unwrap();

        assert_eq!(quotes.len(), 1);
        assert_eq!(quotes[0].symbol, "MSFT");
        assert_eq!(quotes[0].price, 410.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_back_to_back_calls_are_spaced() {
        let transport = ScriptedTransport::always(ok_json("{}"));
        let dispatcher = dispatcher(transport.clone());

        let urls: Vec<String> = (0..4)
            .map(|i| format!("https://api.example.com/item/{}", i))
            .collect();
        let results = futures::future::join_all(
            urls.iter().map(|url| dispatcher.fetch(url, &Credentials::None)),
        )
        .await;
        assert!(results.iter().all(|r| r.is_ok()));

        let calls = transport.calls();
        assert_eq!(calls.len(), 4);
        for pair in calls.windows(2) {
            assert!(pair[1].started - pair[0].started >= 3 * SECOND);
            assert!(pair[1].started >= pair[0].finished);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_success() {
        let k = 3;
        let script = (0..k).map(|_| Ok(throttled())).collect();
        let transport = ScriptedTransport::scripted(script, ok_json(r#"{"ok":true}"#));
        let dispatcher = dispatcher(transport.clone());

        let value = dispatcher
            .fetch("https://api.example.com/search?q=ap", &Credentials::None)
            .await
            .unwrap();

        assert_eq!(value["ok"], true);
        assert_eq!(transport.calls().len(), k + 1);
        assert_eq!(dispatcher.limiter().snapshot().pending, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_always_throttled_exhausts_retries() {
        let transport = ScriptedTransport::always(throttled());
        let dispatcher = dispatcher(transport.clone());

        let result = dispatcher
            .fetch("https://api.example.com/profile/AAPL", &Credentials::None)
            .await;

        match result {
            Err(DispatchError::RateLimitExhausted { attempts, .. }) => assert_eq!(attempts, 6),
            other => panic!("expected RateLimitExhausted, got {:?}", other),
        }
        assert_eq!(transport.calls().len(), 5 + 1);
        assert_eq!(dispatcher.limiter().snapshot().pending, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_error_is_not_retried() {
        let transport =
            ScriptedTransport::always(TransportResponse::new(500, "Internal Server Error", "oops"));
        let dispatcher = dispatcher(transport.clone());

        let result = dispatcher
            .fetch("https://api.example.com/news", &Credentials::None)
            .await;

        match result {
            Err(DispatchError::Transport { status, message }) => {
                assert_eq!(status, Some(500));
                assert!(message.contains("Internal Server Error"));
            }
            other => panic!("expected Transport error, got {:?}", other),
        }
        assert_eq!(transport.calls().len(), 1);
        let snapshot = dispatcher.limiter().snapshot();
        assert_eq!(snapshot.waiting_time, Duration::ZERO);
        assert_eq!(snapshot.pending, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_network_failure_is_not_retried() {
        let transport = ScriptedTransport::scripted(
            vec![Err(DispatchError::network("connection reset"))],
            ok_json("{}"),
        );
        let dispatcher = dispatcher(transport.clone());

        let result = dispatcher
            .fetch("https://api.example.com/news", &Credentials::None)
            .await;

        assert!(matches!(result, Err(DispatchError::Transport { status: None, .. })));
        assert_eq!(transport.calls().len(), 1);
        assert_eq!(dispatcher.limiter().snapshot().pending, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_body_is_decode_error() {
        let transport = ScriptedTransport::always(ok_json("<html>maintenance</html>"));
        let dispatcher = dispatcher(transport.clone());

        let result = dispatcher
            .fetch("https://api.example.com/quote/AAPL", &Credentials::None)
            .await;

        assert!(matches!(result, Err(DispatchError::Decode(_))));
        assert_eq!(transport.calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_calls_reach_transport_in_order() {
        let transport = ScriptedTransport::always(ok_json("{}"));
        let dispatcher = dispatcher(transport.clone());

        let a = dispatcher.fetch("https://api.example.com/A", &Credentials::None);
        let b = dispatcher.fetch("https://api.example.com/B", &Credentials::None);
        let (a, b) = tokio::join!(a, b);
        assert_ok!(a);
        assert_ok!(b);

        let calls = transport.calls();
        assert_eq!(calls[0].url, "https://api.example.com/A");
        assert_eq!(calls[1].url, "https://api.example.com/B");
        assert!(calls[1].started >= calls[0].finished + 3 * SECOND);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shared_limiter_never_overlaps_same_identity() {
        let limiter = Arc::new(RateLimiter::new());
        let transport = ScriptedTransport::always(ok_json("{}"));
        let first = RequestDispatcher::new(limiter.clone(), transport.clone());
        let second = RequestDispatcher::new(limiter.clone(), transport.clone());

        let url = "https://api.example.com/quote/AAPL";
        let (a, b) = tokio::join!(
            first.fetch(url, &Credentials::None),
            second.fetch(url, &Credentials::None)
        );
        assert_ok!(a);
        assert_ok!(b);

        let calls = transport.calls();
        assert_eq!(calls.len(), 2);
        assert!(calls[1].started >= calls[0].finished);
        assert_eq!(limiter.snapshot().pending, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shared_limiter_spaces_distinct_identities() {
        let limiter = Arc::new(RateLimiter::new());
        let transport = ScriptedTransport::always(ok_json("{}"));
        let first = RequestDispatcher::new(limiter.clone(), transport.clone());
        let second = RequestDispatcher::new(limiter.clone(), transport.clone());

        let (a, b) = tokio::join!(
            first.fetch("https://api.example.com/A", &Credentials::None),
            second.fetch("https://api.example.com/B", &Credentials::None)
        );
        assert_ok!(a);
        assert_ok!(b);

        let calls = transport.calls();
        assert_eq!(calls.len(), 2);
        assert!(calls[1].started >= calls[0].finished);
        assert!(calls[1].started - calls[0].started >= 3 * SECOND);
        // One request per window: the second waits out the first's window
        assert!(calls[1].started - calls[0].started >= 55 * SECOND);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shared_limiter_recovers_both_throttled_callers() {
        // Roomy budget so both backoff timers are live at the same time
        let limiter = Arc::new(RateLimiter::with_policy(LimiterPolicy {
            max_requests: 10,
            retry_base_delay: 10 * SECOND,
            ..LimiterPolicy::default()
        }));
        let transport =
            ScriptedTransport::scripted(vec![Ok(throttled()), Ok(throttled())], ok_json("{}"));
        let first = RequestDispatcher::new(limiter.clone(), transport.clone());
        let second = RequestDispatcher::new(limiter.clone(), transport.clone());

        let (a, b) = tokio::join!(
            first.fetch("https://api.example.com/A", &Credentials::None),
            second.fetch("https://api.example.com/B", &Credentials::None)
        );
        assert_ok!(a);
        assert_ok!(b);

        let calls = transport.calls();
        assert_eq!(calls.len(), 4);
        // B's throttled call lands while A is still backing off
        assert!(calls[1].finished < calls[0].finished + 10 * SECOND);
        for pair in calls.windows(2) {
            assert!(pair[1].started - pair[0].started >= 3 * SECOND);
        }
        assert_eq!(limiter.snapshot().pending, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_starting_retry_count_limits_attempts() {
        let transport = ScriptedTransport::always(throttled());
        let dispatcher = dispatcher(transport.clone());

        let result = dispatcher
            .fetch_with(
                "https://api.example.com/profile/AAPL",
                &Credentials::None,
                FetchOptions {
                    retry_count: 3,
                    ..FetchOptions::default()
                },
            )
            .await;

        match result {
            Err(DispatchError::RateLimitExhausted { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("expected RateLimitExhausted, got {:?}", other),
        }
        assert_eq!(transport.calls().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_caller_deadline_abandons_queued_call() {
        let transport = ScriptedTransport::always(ok_json("{}"));
        let dispatcher = dispatcher(transport.clone());

        let result = dispatcher
            .fetch_with(
                "https://api.example.com/slow",
                &Credentials::None,
                FetchOptions::with_timeout(SECOND),
            )
            .await;

        assert!(matches!(result, Err(DispatchError::TimedOut { .. })));
        tokio::time::sleep(10 * SECOND).await;
        assert!(transport.calls().is_empty());
        assert_eq!(dispatcher.limiter().snapshot().pending, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_configured_default_deadline() {
        let transport = ScriptedTransport::always(ok_json("{}"));
        let config = DispatcherConfig {
            call_timeout_secs: Some(1),
            ..DispatcherConfig::default()
        };
        let dispatcher =
            RequestDispatcher::with_parts(Arc::new(RateLimiter::new()), transport, &config);

        let result = dispatcher
            .fetch("https://api.example.com/slow", &Credentials::None)
            .await;

        assert_err!(&result);
        assert!(matches!(result, Err(DispatchError::TimedOut { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_queued_calls() {
        let transport = ScriptedTransport::always(ok_json("{}"));
        let dispatcher = Arc::new(dispatcher(transport.clone()));

        let calls: Vec<_> = ["A", "B"]
            .into_iter()
            .map(|name| {
                let dispatcher = dispatcher.clone();
                tokio::spawn(async move {
                    dispatcher
                        .fetch(&format!("https://api.example.com/{}", name), &Credentials::None)
                        .await
                })
            })
            .collect();

        // Both queued, the first sleeping off its admission delay
        tokio::time::sleep(SECOND).await;
        dispatcher.shutdown().await;

        for call in calls {
            assert!(matches!(call.await.unwrap(), Err(DispatchError::Cancelled)));
        }
        assert!(transport.calls().is_empty());

        let after = dispatcher
            .fetch("https://api.example.com/C", &Credentials::None)
            .await;
        assert!(matches!(after, Err(DispatchError::Cancelled)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_url_fails_before_queueing() {
        let transport = ScriptedTransport::always(ok_json("{}"));
        let dispatcher = dispatcher(transport.clone());

        let result = dispatcher.fetch("::not a url::", &Credentials::None).await;

        assert!(matches!(result, Err(DispatchError::InvalidUrl(_))));
        assert!(transport.calls().is_empty());
    }
}
