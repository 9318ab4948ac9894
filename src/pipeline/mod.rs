//! Pipeline Executor (§4.3): drives one caller operation through location
//! selection, signing, dispatch, and retry until it succeeds, is exhausted, or
//! its deadline elapses.

pub mod retry;
pub mod transport;

use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::auth;
use crate::config::{ClientConfig, Location, LocationMode, RequestLocationMode, RequestOptions};
use crate::credential::Credential;
use crate::error::{ErrorKind, StorageClientError, StorageClientResult};
use crate::request::{FinalizedRequest, RequestBuilder};
use crate::response::{self, NormalizedResponse};
use retry::RetryPolicy;
use transport::{DigestingReader, HttpTransport, RawResponse, ResponseBody};

/// Per-attempt state carried across a single operation's retry loop (§4.3).
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub operation_id: String,
    pub start_time: Instant,
    pub deadline: Option<Instant>,
    pub current_location: Location,
    pub location_mode: LocationMode,
    pub request_location_mode: RequestLocationMode,
    pub attempt_count: u32,
    pub last_error: Option<Arc<StorageClientError>>,
    pub retry_interval_ms: u64,
}

/// Observation-only lifecycle hooks a caller can attach around every attempt
/// (§4.3 "request-finalized", "about-to-send", "response-headers-received",
/// "response-complete"). None may alter the request's signature-affecting
/// fields — [`FinalizedRequest`] simply doesn't expose mutators for them.
#[async_trait::async_trait]
pub trait Filter: Send + Sync {
    async fn on_request(&self, _req: &FinalizedRequest, _ctx: &ExecutionContext) -> StorageClientResult<()> {
        Ok(())
    }

    async fn on_response(&self, _resp: &RawResponse, _ctx: &ExecutionContext) -> StorageClientResult<()> {
        Ok(())
    }
}

/// Drives request construction, signing, dispatch, and retry for one logical
/// operation (§4.3). Stateless across operations; one instance is shared by a
/// whole client.
pub struct PipelineExecutor {
    credential: Credential,
    retry_policy: RetryPolicy,
    transport: Arc<dyn HttpTransport>,
    filters: Vec<Arc<dyn Filter>>,
}

impl PipelineExecutor {
    pub fn new(credential: Credential, retry_policy: RetryPolicy, transport: Arc<dyn HttpTransport>) -> Self {
        Self { credential, retry_policy, transport, filters: Vec::new() }
    }

    pub fn with_filter(mut self, filter: Arc<dyn Filter>) -> Self {
        self.filters.push(filter);
        self
    }

    fn resolve_initial_location(options: &RequestOptions) -> StorageClientResult<Location> {
        let location = options
            .request_location_mode
            .forced_location()
            .unwrap_or_else(|| options.location_mode.initial_location());
        if !options.location_mode.allows(location) {
            return Err(StorageClientError::new(
                ErrorKind::LocationConstraintViolation,
                format!(
                    "request location mode {:?} is incompatible with client location mode {:?}",
                    options.request_location_mode, options.location_mode
                ),
            ));
        }
        Ok(location)
    }

    /// Runs `build` (re-invoked on every attempt, since a signed request can't
    /// be replayed as-is) to completion, retrying per policy and rotating
    /// location on `*-then-*` modes (§4.3, §4.7).
    pub async fn execute(
        &self,
        config: &ClientConfig,
        options: &RequestOptions,
        mut build: impl FnMut() -> StorageClientResult<RequestBuilder>,
    ) -> StorageClientResult<NormalizedResponse> {
        let start_time = Instant::now();
        let deadline = options
            .maximum_execution_time_ms
            .map(|ms| start_time + Duration::from_millis(ms));

        let mut ctx = ExecutionContext {
            operation_id: Uuid::new_v4().to_string(),
            start_time,
            deadline,
            current_location: Self::resolve_initial_location(options)?,
            location_mode: options.location_mode,
            request_location_mode: options.request_location_mode,
            attempt_count: 0,
            last_error: None,
            retry_interval_ms: 0,
        };

        let span = tracing::info_span!("storage_client_request", request_id = %ctx.operation_id);
        let _entered = span.enter();

        loop {
            ctx.attempt_count += 1;

            if let Some(deadline) = ctx.deadline {
                if Instant::now() >= deadline {
                    warn!(attempt = ctx.attempt_count, "maximum execution time exceeded before dispatch");
                    let mut err = StorageClientError::new(
                        ErrorKind::DeadlineExceeded,
                        "maximum execution time exceeded",
                    )
                    .with_request_id(ctx.operation_id.clone());
                    if let Some(last_error) = ctx.last_error.clone() {
                        err = err.with_cause(LastAttemptError(last_error));
                    }
                    return Err(err);
                }
            }

            match self.attempt_once(config, options, &mut build, &ctx).await {
                Ok(resp) => return Ok(resp),
                Err(outcome) => match outcome {
                    AttemptOutcome::Fatal(err) => return Err(err),
                    AttemptOutcome::Retry { error, delay_ms, next_location } => {
                        debug!(
                            attempt = ctx.attempt_count,
                            delay_ms,
                            next_location = ?next_location,
                            kind = ?error.kind,
                            "retrying after attempt failure"
                        );
                        ctx.last_error = Some(Arc::new(error));
                        ctx.retry_interval_ms = delay_ms;
                        if let Some(next) = next_location {
                            ctx.current_location = next;
                        }
                        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                    }
                },
            }
        }
    }

    #[instrument(skip_all, fields(request_id = %ctx.operation_id, attempt = ctx.attempt_count, location = ?ctx.current_location))]
    async fn attempt_once(
        &self,
        config: &ClientConfig,
        options: &RequestOptions,
        build: &mut impl FnMut() -> StorageClientResult<RequestBuilder>,
        ctx: &ExecutionContext,
    ) -> Result<NormalizedResponse, AttemptOutcome> {
        let builder = build().map_err(AttemptOutcome::Fatal)?;
        let mut req = builder
            .finalize(config, ctx.current_location, options.client_request_id.as_deref())
            .map_err(AttemptOutcome::Fatal)?;
        let raw_response = req.is_raw_response();

        for filter in &self.filters {
            filter.on_request(&req, ctx).await.map_err(AttemptOutcome::Fatal)?;
        }

        auth::sign(&mut req, &self.credential).await.map_err(|err| {
            warn!(error = %err, "request signing failed");
            AttemptOutcome::Fatal(err)
        })?;

        let sent = self.transport.send(req).await;

        match sent {
            Ok(mut resp) => {
                // Step 5: headers-only responses stream their body; tee it
                // through a running MD5/length accumulator so the result is
                // available to the caller once the stream is drained (§4.3).
                resp.body = match resp.body {
                    ResponseBody::Stream(reader) if !options.disable_content_md5_validation => {
                        let slot = Arc::new(StdMutex::new(None));
                        resp.transport_digest = Some(slot.clone());
                        ResponseBody::Stream(Box::pin(DigestingReader::new(reader, slot)))
                    }
                    other => other,
                };

                for filter in &self.filters {
                    filter.on_response(&resp, ctx).await.map_err(AttemptOutcome::Fatal)?;
                }

                let status = resp.status;
                let after_lagging_write = status == 404 && ctx.current_location == Location::Secondary;

                // Step 6: invoke the response normalizer and attach the
                // location this attempt actually targeted (§4.3).
                match response::normalize(resp, raw_response, ctx.current_location).await {
                    Ok(normalized) => Ok(normalized),
                    Err(error) => {
                        let decision = self.retry_policy.evaluate(
                            ctx.attempt_count,
                            error.kind,
                            error.status_code,
                            after_lagging_write,
                            ctx.location_mode,
                            ctx.current_location,
                        );
                        if !decision.retry {
                            return Err(AttemptOutcome::Fatal(error));
                        }
                        Err(AttemptOutcome::Retry {
                            error,
                            delay_ms: decision.delay_ms,
                            next_location: decision.next_location_hint,
                        })
                    }
                }
            }
            Err(error) => {
                let decision = self.retry_policy.evaluate(
                    ctx.attempt_count,
                    error.kind,
                    error.status_code,
                    false,
                    ctx.location_mode,
                    ctx.current_location,
                );
                if !decision.retry {
                    return Err(AttemptOutcome::Fatal(error));
                }
                Err(AttemptOutcome::Retry {
                    error,
                    delay_ms: decision.delay_ms,
                    next_location: decision.next_location_hint,
                })
            }
        }
    }
}

enum AttemptOutcome {
    Fatal(StorageClientError),
    Retry { error: StorageClientError, delay_ms: u64, next_location: Option<Location> },
}

/// Wraps the last observed transient error as the `cause` of a `DeadlineExceeded`
/// failure (§7): `StorageClientError` has no blanket `Error` impl through `Arc`.
#[derive(Debug)]
struct LastAttemptError(Arc<StorageClientError>);

impl std::fmt::Display for LastAttemptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

impl std::error::Error for LastAttemptError {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfigBuilder;
    use crate::pipeline::transport::fake::{FakeTransport, ScriptedResponse};
    use http::Method;
    use url::Url;

    fn test_config() -> ClientConfig {
        ClientConfigBuilder::new()
            .account("acct")
            .primary_host(Url::parse("https://acct.blob.core.example/").unwrap())
            .secondary_host(Url::parse("https://acct-secondary.blob.core.example/").unwrap())
            .build()
            .unwrap()
    }

    fn credential() -> Credential {
        Credential::SharedKey {
            account: "acct".to_string(),
            key: crate::config::EMULATOR_ACCOUNT_KEY.to_string(),
            path_style: false,
        }
    }

    #[tokio::test]
    async fn succeeds_on_first_attempt() {
        let transport = Arc::new(FakeTransport::new(vec![ScriptedResponse { status: 200, headers: vec![], body: b"" }]));
        let executor = PipelineExecutor::new(credential(), RetryPolicy::None, transport.clone());
        let config = test_config();
        let options = RequestOptions::default();
        let resp = executor
            .execute(&config, &options, || Ok(RequestBuilder::new(Method::GET, "/container")))
            .await
            .unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn retries_server_busy_then_succeeds() {
        let transport = Arc::new(FakeTransport::new(vec![
            ScriptedResponse { status: 503, headers: vec![], body: b"" },
            ScriptedResponse { status: 200, headers: vec![], body: b"" },
        ]));
        let policy = RetryPolicy::ExponentialBackoff { base_ms: 1, min_ms: 1, max_ms: 5, max_attempts: 3 };
        let executor = PipelineExecutor::new(credential(), policy, transport.clone());
        let config = test_config();
        let mut options = RequestOptions::default();
        options.location_mode = LocationMode::PrimaryThenSecondary;
        let resp = executor
            .execute(&config, &options, || Ok(RequestBuilder::new(Method::GET, "/container")))
            .await
            .unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test]
    async fn location_rotates_to_secondary_on_retry() {
        let transport = Arc::new(FakeTransport::new(vec![
            ScriptedResponse { status: 503, headers: vec![], body: b"" },
            ScriptedResponse { status: 200, headers: vec![], body: b"" },
        ]));
        let policy = RetryPolicy::ExponentialBackoff { base_ms: 1, min_ms: 1, max_ms: 5, max_attempts: 3 };
        let executor = PipelineExecutor::new(credential(), policy, transport.clone());
        let config = test_config();
        let mut options = RequestOptions::default();
        options.location_mode = LocationMode::PrimaryThenSecondary;
        executor
            .execute(&config, &options, || Ok(RequestBuilder::new(Method::GET, "/container")))
            .await
            .unwrap();
        let seen = transport.seen.lock().unwrap();
        assert!(seen[0].1.contains("acct.blob"));
        assert!(seen[1].1.contains("acct-secondary.blob"));
    }

    #[tokio::test]
    async fn exhausting_retries_surfaces_the_last_error() {
        let transport = Arc::new(FakeTransport::new(vec![
            ScriptedResponse { status: 503, headers: vec![], body: b"" },
            ScriptedResponse { status: 503, headers: vec![], body: b"" },
        ]));
        let policy = RetryPolicy::ExponentialBackoff { base_ms: 1, min_ms: 1, max_ms: 5, max_attempts: 1 };
        let executor = PipelineExecutor::new(credential(), policy, transport.clone());
        let config = test_config();
        let options = RequestOptions::default();
        let err = executor
            .execute(&config, &options, || Ok(RequestBuilder::new(Method::GET, "/container")))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::ServerBusy);
    }

    #[tokio::test]
    async fn location_constraint_violation_is_rejected_before_any_attempt() {
        let transport = Arc::new(FakeTransport::new(vec![ScriptedResponse { status: 200, headers: vec![], body: b"" }]));
        let executor = PipelineExecutor::new(credential(), RetryPolicy::None, transport.clone());
        let config = test_config();
        let mut options = RequestOptions::default();
        options.location_mode = LocationMode::PrimaryOnly;
        options.request_location_mode = RequestLocationMode::SecondaryOnly;
        let err = executor
            .execute(&config, &options, || Ok(RequestBuilder::new(Method::GET, "/container")))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::LocationConstraintViolation);
        assert_eq!(transport.calls(), 0);
    }

    #[tokio::test]
    async fn deadline_in_the_past_fails_before_dispatch() {
        let transport = Arc::new(FakeTransport::new(vec![ScriptedResponse { status: 200, headers: vec![], body: b"" }]));
        let executor = PipelineExecutor::new(credential(), RetryPolicy::None, transport.clone());
        let config = test_config();
        let mut options = RequestOptions::default();
        options.maximum_execution_time_ms = Some(0);
        tokio::time::sleep(Duration::from_millis(5)).await;
        let err = executor
            .execute(&config, &options, || Ok(RequestBuilder::new(Method::GET, "/container")))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::DeadlineExceeded);
    }
}
