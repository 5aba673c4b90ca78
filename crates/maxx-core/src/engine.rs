use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use time::OffsetDateTime;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use maxx_common::{AttemptStatus, Dialect, RequestStatus, UsageTotals};
use maxx_provider::{
    AdapterBody, AdapterResponse, AntigravityAdapter, AttemptCtx, ClientRequest, CustomAdapter,
    ErrorKind, ProviderConfig, UpstreamAdapter, UpstreamError, UpstreamResult,
};
use maxx_storage::{
    MappingScope, ProviderRow, ProxyAttemptRow, ProxyRequestRow, RetryConfigRow, RouteRow,
};

use crate::binding::BindingOutcome;
use crate::events::Event;
use crate::router;
use crate::state::AppState;
use crate::usage::extract_usage;

/// Captured request/response bodies are truncated at this size before
/// persistence.
const MAX_CAPTURE_BYTES: usize = 4 * 1024 * 1024;
/// Bound on the asynchronous quota-lookup side task.
const QUOTA_PROBE_TIMEOUT: Duration = Duration::from_secs(15);

/// One incoming client call, classified by the HTTP surface.
pub struct ProxyRequestSpec {
    pub dialect: Dialect,
    pub path: String,
    pub query: Option<String>,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
    pub stream: bool,
    pub model: String,
    pub session_id: Option<String>,
    pub project_id: Option<i64>,
    pub token_id: Option<i64>,
    pub cancel: CancellationToken,
}

pub enum EngineBody {
    Bytes(Bytes),
    Stream(ReceiverStream<UpstreamResult<Bytes>>),
}

pub struct EngineResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: EngineBody,
}

/// Builds an adapter from a provider snapshot. Swappable for tests.
pub trait AdapterFactory: Send + Sync {
    fn build(
        &self,
        provider: &ProviderRow,
        state: &AppState,
    ) -> Result<Arc<dyn UpstreamAdapter>, UpstreamError>;
}

pub struct DefaultAdapterFactory;

impl AdapterFactory for DefaultAdapterFactory {
    fn build(
        &self,
        provider: &ProviderRow,
        state: &AppState,
    ) -> Result<Arc<dyn UpstreamAdapter>, UpstreamError> {
        match ProviderConfig::parse(&provider.config_json)? {
            ProviderConfig::Custom(config) => Ok(Arc::new(CustomAdapter::new(
                provider.id,
                config,
                state.signatures.clone(),
            ))),
            ProviderConfig::Antigravity(config) => Ok(Arc::new(AntigravityAdapter::new(
                provider.id,
                config,
                state.tokens.clone(),
                state.signatures.clone(),
            ))),
        }
    }
}

#[derive(Clone)]
pub struct ProxyEngine {
    state: Arc<AppState>,
    adapters: Arc<dyn AdapterFactory>,
}

impl ProxyEngine {
    pub fn new(state: Arc<AppState>) -> Self {
        Self::with_adapter_factory(state, Arc::new(DefaultAdapterFactory))
    }

    pub fn with_adapter_factory(state: Arc<AppState>, adapters: Arc<dyn AdapterFactory>) -> Self {
        Self { state, adapters }
    }

    pub fn state(&self) -> &Arc<AppState> {
        &self.state
    }

    pub async fn execute(&self, spec: ProxyRequestSpec) -> EngineResponse {
        let now = OffsetDateTime::now_utc();
        let mut record = ProxyRequestRow {
            id: format!("req_{}", uuid::Uuid::new_v4().simple()),
            dialect: spec.dialect,
            session_id: spec.session_id.clone(),
            project_id: spec.project_id,
            original_model: spec.model.clone(),
            final_model: None,
            status: RequestStatus::Pending,
            started_at: now,
            ended_at: None,
            attempt_count: 0,
            request_body: Some(truncate(&spec.body)),
            response_body: None,
            usage: UsageTotals::default(),
            cost_micro_usd: 0,
            error: None,
        };
        self.store_request(&record, true).await;
        self.state
            .events
            .emit(Event::RequestCreated {
                request_id: record.id.clone(),
                dialect: spec.dialect,
                model: spec.model.clone(),
                at: now,
            })
            .await;

        // Project binding waiter for project-less requests.
        let mut project_id = spec.project_id;
        if project_id.is_none() && self.state.force_project_binding() {
            let session = spec
                .session_id
                .clone()
                .unwrap_or_else(|| record.id.clone());
            let timeout = self.state.force_project_timeout();
            match self
                .state
                .binding
                .wait_for_binding(&session, timeout, &spec.cancel)
                .await
            {
                BindingOutcome::Bound(bound) => {
                    project_id = Some(bound);
                    record.project_id = Some(bound);
                }
                BindingOutcome::TimedOut => {
                    self.finish_request(
                        &mut record,
                        RequestStatus::Rejected,
                        Some("project binding timeout"),
                    )
                    .await;
                    return error_response(spec.dialect, 403, "project binding timeout");
                }
                BindingOutcome::Cancelled => {
                    self.finish_request(&mut record, RequestStatus::Cancelled, None)
                        .await;
                    return error_response(spec.dialect, 499, "request cancelled");
                }
            }
        }

        let snapshot = self.state.snapshot.load_full();
        let routes = router::candidate_routes(&snapshot, spec.dialect, project_id);
        if routes.is_empty() {
            self.finish_request(&mut record, RequestStatus::Failed, Some("no routes"))
                .await;
            return error_response(spec.dialect, 503, "no routes configured for this dialect");
        }

        record.status = RequestStatus::InProgress;
        self.store_request(&record, false).await;
        self.state
            .events
            .emit(Event::RequestStarted {
                request_id: record.id.clone(),
                at: OffsetDateTime::now_utc(),
            })
            .await;

        // Cooling routes are deferred behind healthy ones, not dropped.
        let mut cooling = Vec::new();
        for route in &routes {
            if self
                .state
                .cooldowns
                .is_cooling(route.provider_id, spec.dialect)
                .await
            {
                cooling.push(route.provider_id);
            }
        }
        let ordered = router::defer_cooling_routes(routes, &cooling);

        let client_request = ClientRequest {
            path: spec.path.clone(),
            query: spec.query.clone(),
            headers: spec.headers.clone(),
            body: spec.body.clone(),
        };

        let mut last_error: Option<UpstreamError> = None;
        for route in ordered {
            let Some(provider) = snapshot
                .providers
                .iter()
                .find(|p| p.id == route.provider_id)
            else {
                continue;
            };

            let scope = MappingScope {
                dialect: Some(spec.dialect),
                provider_id: Some(provider.id),
                project_id,
                route_id: Some(route.id),
                token_id: spec.token_id,
            };
            let mapped_model = router::map_model(&spec.model, &snapshot.model_mappings, &scope);
            let retry = resolve_retry_config(&snapshot, &route);

            let adapter = match self.adapters.build(provider, &self.state) {
                Ok(adapter) => adapter,
                Err(err) => {
                    last_error = Some(err);
                    continue;
                }
            };

            let mut attempt_index: u32 = 0;
            loop {
                record.attempt_count += 1;
                let attempt = ProxyAttemptRow {
                    id: format!("att_{}", uuid::Uuid::new_v4().simple()),
                    request_id: record.id.clone(),
                    route_id: route.id,
                    provider_id: provider.id,
                    dialect: spec.dialect,
                    mapped_model: mapped_model.clone(),
                    status: AttemptStatus::InProgress,
                    started_at: OffsetDateTime::now_utc(),
                    ended_at: None,
                    upstream_request: None,
                    upstream_response: None,
                    usage: UsageTotals::default(),
                    cost_micro_usd: 0,
                    error: None,
                };
                if let Err(err) = self.state.storage.insert_proxy_attempt(&attempt).await {
                    tracing::warn!(error = %err, "failed to record attempt");
                }
                self.store_request(&record, false).await;
                self.state
                    .events
                    .emit(Event::AttemptStarted {
                        request_id: record.id.clone(),
                        attempt_id: attempt.id.clone(),
                        route_id: route.id,
                        provider_id: provider.id,
                        attempt_no: record.attempt_count as u32,
                        at: attempt.started_at,
                    })
                    .await;

                let ctx = AttemptCtx {
                    request_id: record.id.clone(),
                    attempt_no: record.attempt_count as u32,
                    dialect: spec.dialect,
                    mapped_model: mapped_model.clone(),
                    stream: spec.stream,
                    session_id: spec.session_id.clone(),
                    cancel: spec.cancel.clone(),
                    outbound_proxy: self.state.config.proxy.clone(),
                };

                // The guard moves the attempt out of IN_PROGRESS even if
                // this task unwinds or falls through without finishing it.
                let mut guard = AttemptGuard::new(self.state.storage.clone(), attempt);

                match adapter.execute(&ctx, &client_request).await {
                    Ok(response) => {
                        let attempt = guard.disarm();
                        record.final_model = Some(mapped_model.clone());
                        return self
                            .finish_success(record, attempt, response, &route, spec.dialect)
                            .await;
                    }
                    Err(err) => {
                        let mut attempt = guard.disarm();
                        let cancelled =
                            err.kind == ErrorKind::Cancelled || spec.cancel.is_cancelled();
                        attempt.status = if cancelled {
                            AttemptStatus::Cancelled
                        } else {
                            AttemptStatus::Failed
                        };
                        attempt.ended_at = Some(OffsetDateTime::now_utc());
                        attempt.error = Some(err.to_string());
                        self.store_attempt(&attempt).await;
                        self.emit_attempt_finished(&attempt).await;

                        if cancelled {
                            self.finish_request(&mut record, RequestStatus::Cancelled, None)
                                .await;
                            return error_response(spec.dialect, 499, "request cancelled");
                        }

                        self.apply_cooldown(&err, provider.id, spec.dialect, &adapter, &ctx)
                            .await;

                        if err.retryable && attempt_index < retry.max_retries {
                            let delay = err
                                .retry_after
                                .unwrap_or_else(|| backoff_delay(&retry, attempt_index));
                            tokio::select! {
                                _ = spec.cancel.cancelled() => {
                                    self.finish_request(
                                        &mut record,
                                        RequestStatus::Cancelled,
                                        None,
                                    )
                                    .await;
                                    return error_response(
                                        spec.dialect,
                                        499,
                                        "request cancelled",
                                    );
                                }
                                _ = tokio::time::sleep(delay) => {}
                            }
                            attempt_index += 1;
                            continue;
                        }

                        last_error = Some(err);
                        break;
                    }
                }
            }
        }

        let err = last_error
            .unwrap_or_else(|| UpstreamError::unsupported("no usable providers for this request"));
        let message = err.to_string();
        self.finish_request(&mut record, RequestStatus::Failed, Some(&message))
            .await;
        let status = err.status.filter(|s| *s >= 400).unwrap_or(502);
        error_response(spec.dialect, status, &message)
    }

    /// Cooldown is applied here, never inside adapters, so one policy
    /// governs all providers.
    async fn apply_cooldown(
        &self,
        err: &UpstreamError,
        provider_id: i64,
        dialect: Dialect,
        adapter: &Arc<dyn UpstreamAdapter>,
        ctx: &AttemptCtx,
    ) {
        let Some(reason) = err.cooldown_reason() else {
            return;
        };
        let quota_probe = reason == maxx_common::CooldownReason::QuotaExhausted
            && err.cooldown_until.is_none()
            && adapter.can_resolve_quota_reset();
        let explicit = err
            .cooldown_until
            .or_else(|| {
                err.retry_after
                    .map(|delay| OffsetDateTime::now_utc() + delay)
            })
            // A quota failure the probe will resolve gets a short hold
            // instead of the full policy duration.
            .or_else(|| {
                quota_probe.then(|| OffsetDateTime::now_utc() + Duration::from_secs(60))
            });
        self.state
            .cooldowns
            .record_failure(provider_id, dialect, reason, explicit)
            .await;

        if quota_probe {
            let adapter = adapter.clone();
            let cooldowns = self.state.cooldowns.clone();
            let mut probe_ctx = ctx.clone();
            probe_ctx.cancel = CancellationToken::new();
            tokio::spawn(async move {
                let probed =
                    tokio::time::timeout(QUOTA_PROBE_TIMEOUT, adapter.resolve_quota_reset(&probe_ctx))
                        .await
                        .ok()
                        .flatten();
                if let Some(until) = probed {
                    cooldowns.update_cooldown(provider_id, dialect, until).await;
                }
            });
        }
    }

    async fn finish_success(
        &self,
        mut record: ProxyRequestRow,
        mut attempt: ProxyAttemptRow,
        response: AdapterResponse,
        route: &RouteRow,
        dialect: Dialect,
    ) -> EngineResponse {
        attempt.upstream_request = response.upstream_request.map(|body| truncate(&body));
        let model = record.final_model.clone().unwrap_or_default();

        match response.body {
            AdapterBody::Bytes(bytes) => {
                let usage = extract_usage(dialect, &bytes, false).unwrap_or_default();
                let cost = self.state.pricing.cost_micro_usd(&model, &usage);
                let now = OffsetDateTime::now_utc();

                attempt.status = AttemptStatus::Completed;
                attempt.ended_at = Some(now);
                attempt.usage = usage;
                attempt.cost_micro_usd = cost;
                attempt.upstream_response = Some(truncate(&bytes));
                self.store_attempt(&attempt).await;
                self.emit_attempt_finished(&attempt).await;

                record.status = RequestStatus::Completed;
                record.ended_at = Some(now);
                record.response_body = Some(truncate(&bytes));
                record.usage = usage;
                record.cost_micro_usd = cost;
                self.store_request(&record, false).await;
                self.state
                    .events
                    .emit(Event::RequestFinished {
                        request_id: record.id.clone(),
                        status: RequestStatus::Completed,
                        at: now,
                    })
                    .await;
                self.state
                    .cooldowns
                    .record_success(route.provider_id, dialect)
                    .await;

                EngineResponse {
                    status: response.status,
                    headers: response.headers,
                    body: EngineBody::Bytes(bytes),
                }
            }
            AdapterBody::Stream(mut upstream) => {
                let (tx, rx) = tokio::sync::mpsc::channel::<UpstreamResult<Bytes>>(16);
                let state = self.state.clone();
                let provider_id = route.provider_id;
                let model = model.clone();

                tokio::spawn(async move {
                    let mut capture = BytesMut::new();
                    let mut failure: Option<UpstreamError> = None;
                    let mut client_gone = false;

                    while let Some(item) = upstream.next().await {
                        match item {
                            Ok(chunk) => {
                                if capture.len() < MAX_CAPTURE_BYTES {
                                    let room = MAX_CAPTURE_BYTES - capture.len();
                                    capture
                                        .extend_from_slice(&chunk[..chunk.len().min(room)]);
                                }
                                if tx.send(Ok(chunk)).await.is_err() {
                                    client_gone = true;
                                    break;
                                }
                            }
                            Err(err) => {
                                let _ = tx.send(Err(err.clone())).await;
                                failure = Some(err);
                                break;
                            }
                        }
                    }
                    drop(tx);

                    let now = OffsetDateTime::now_utc();
                    let captured = capture.freeze();
                    // Token counts come from the client-visible capture.
                    let usage = extract_usage(dialect, &captured, true).unwrap_or_default();
                    let cost = state.pricing.cost_micro_usd(&model, &usage);

                    let cancelled = client_gone
                        || failure
                            .as_ref()
                            .is_some_and(|err| err.kind == ErrorKind::Cancelled);
                    let (attempt_status, request_status) = if cancelled {
                        (AttemptStatus::Cancelled, RequestStatus::Cancelled)
                    } else if failure.is_some() {
                        (AttemptStatus::Failed, RequestStatus::Failed)
                    } else {
                        (AttemptStatus::Completed, RequestStatus::Completed)
                    };

                    attempt.status = attempt_status;
                    attempt.ended_at = Some(now);
                    attempt.usage = usage;
                    attempt.cost_micro_usd = cost;
                    attempt.upstream_response = Some(captured.to_vec());
                    attempt.error = failure.as_ref().map(|err| err.to_string());
                    if let Err(err) = state.storage.update_proxy_attempt(&attempt).await {
                        tracing::warn!(error = %err, "failed to update attempt");
                    }
                    state
                        .events
                        .emit(Event::AttemptFinished {
                            request_id: attempt.request_id.clone(),
                            attempt_id: attempt.id.clone(),
                            status: attempt.status,
                            error: attempt.error.clone(),
                            at: now,
                        })
                        .await;

                    record.status = request_status;
                    record.ended_at = Some(now);
                    record.response_body = Some(captured.to_vec());
                    record.usage = usage;
                    record.cost_micro_usd = cost;
                    record.error = failure.as_ref().map(|err| err.to_string());
                    if let Err(err) = state.storage.update_proxy_request(&record).await {
                        tracing::warn!(error = %err, "failed to update request");
                    }
                    state
                        .events
                        .emit(Event::RequestFinished {
                            request_id: record.id.clone(),
                            status: request_status,
                            at: now,
                        })
                        .await;

                    if request_status == RequestStatus::Completed {
                        state.cooldowns.record_success(provider_id, dialect).await;
                    }
                });

                EngineResponse {
                    status: response.status,
                    headers: response.headers,
                    body: EngineBody::Stream(ReceiverStream::new(rx)),
                }
            }
        }
    }

    async fn finish_request(
        &self,
        record: &mut ProxyRequestRow,
        status: RequestStatus,
        error: Option<&str>,
    ) {
        record.status = status;
        record.ended_at = Some(OffsetDateTime::now_utc());
        record.error = error.map(str::to_string);
        self.store_request(record, false).await;
        self.state
            .events
            .emit(Event::RequestFinished {
                request_id: record.id.clone(),
                status,
                at: record.ended_at.unwrap_or_else(OffsetDateTime::now_utc),
            })
            .await;
    }

    async fn store_request(&self, record: &ProxyRequestRow, insert: bool) {
        let result = if insert {
            self.state.storage.insert_proxy_request(record).await
        } else {
            self.state.storage.update_proxy_request(record).await
        };
        if let Err(err) = result {
            tracing::warn!(error = %err, request_id = %record.id, "failed to persist request");
        }
    }

    async fn store_attempt(&self, attempt: &ProxyAttemptRow) {
        if let Err(err) = self.state.storage.update_proxy_attempt(attempt).await {
            tracing::warn!(error = %err, attempt_id = %attempt.id, "failed to persist attempt");
        }
    }

    async fn emit_attempt_finished(&self, attempt: &ProxyAttemptRow) {
        self.state
            .events
            .emit(Event::AttemptFinished {
                request_id: attempt.request_id.clone(),
                attempt_id: attempt.id.clone(),
                status: attempt.status,
                error: attempt.error.clone(),
                at: attempt.ended_at.unwrap_or_else(OffsetDateTime::now_utc),
            })
            .await;
    }
}

/// Transitions an abandoned attempt out of IN_PROGRESS on panic,
/// cancellation, or fall-through.
struct AttemptGuard {
    storage: Arc<dyn maxx_storage::Storage>,
    attempt: Option<ProxyAttemptRow>,
}

impl AttemptGuard {
    fn new(storage: Arc<dyn maxx_storage::Storage>, attempt: ProxyAttemptRow) -> Self {
        Self {
            storage,
            attempt: Some(attempt),
        }
    }

    fn disarm(&mut self) -> ProxyAttemptRow {
        self.attempt.take().expect("attempt guard disarmed twice")
    }
}

impl Drop for AttemptGuard {
    fn drop(&mut self) {
        let Some(mut attempt) = self.attempt.take() else {
            return;
        };
        attempt.status = AttemptStatus::Failed;
        attempt.ended_at = Some(OffsetDateTime::now_utc());
        attempt.error = Some("attempt abandoned".to_string());
        let storage = self.storage.clone();
        tokio::spawn(async move {
            let _ = storage.update_proxy_attempt(&attempt).await;
        });
    }
}

fn resolve_retry_config(
    snapshot: &maxx_storage::StorageSnapshot,
    route: &RouteRow,
) -> RetryConfigRow {
    route
        .retry_config_id
        .and_then(|id| snapshot.retry_configs.iter().find(|c| c.id == id))
        .or_else(|| snapshot.retry_configs.iter().find(|c| c.is_default))
        .cloned()
        .unwrap_or_else(RetryConfigRow::none)
}

fn backoff_delay(retry: &RetryConfigRow, attempt_index: u32) -> Duration {
    let base = retry.initial_interval_ms as f64;
    let factor = retry.backoff_rate.max(1.0).powi(attempt_index as i32);
    let millis = (base * factor).min(retry.max_interval_ms.max(retry.initial_interval_ms) as f64);
    Duration::from_millis(millis as u64)
}

fn truncate(body: &[u8]) -> Vec<u8> {
    body[..body.len().min(MAX_CAPTURE_BYTES)].to_vec()
}

fn error_response(dialect: Dialect, status: u16, message: &str) -> EngineResponse {
    let body = match dialect {
        Dialect::Claude => serde_json::json!({
            "type": "error",
            "error": {"type": error_label(status), "message": message}
        }),
        Dialect::OpenAI | Dialect::Codex => serde_json::json!({
            "error": {"message": message, "type": error_label(status)}
        }),
        Dialect::Gemini => serde_json::json!({
            "error": {"code": status, "message": message, "status": gemini_status(status)}
        }),
    };
    EngineResponse {
        status,
        headers: vec![("content-type".to_string(), "application/json".to_string())],
        body: EngineBody::Bytes(Bytes::from(body.to_string())),
    }
}

fn error_label(status: u16) -> &'static str {
    match status {
        400 => "invalid_request_error",
        401 | 403 => "permission_error",
        404 => "not_found_error",
        429 => "rate_limit_error",
        499 => "request_cancelled",
        _ => "api_error",
    }
}

fn gemini_status(status: u16) -> &'static str {
    match status {
        400 => "INVALID_ARGUMENT",
        401 | 403 => "PERMISSION_DENIED",
        404 => "NOT_FOUND",
        429 => "RESOURCE_EXHAUSTED",
        _ => "UNAVAILABLE",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use maxx_common::{CooldownReason, GatewayConfig, ProviderKind, settings};
    use maxx_storage::{MemoryStorage, ProviderRow, RouteRow, Storage};

    use crate::pricing::StaticPriceTable;

    struct ScriptedAdapter {
        provider_id: i64,
        script: Mutex<Vec<Result<Bytes, UpstreamError>>>,
    }

    #[async_trait]
    impl UpstreamAdapter for ScriptedAdapter {
        fn provider_id(&self) -> i64 {
            self.provider_id
        }

        async fn execute(
            &self,
            _ctx: &AttemptCtx,
            _request: &ClientRequest,
        ) -> Result<AdapterResponse, UpstreamError> {
            let next = self
                .script
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| Err(UpstreamError::unsupported("script exhausted")));
            next.map(|bytes| AdapterResponse {
                status: 200,
                headers: vec![("content-type".to_string(), "application/json".to_string())],
                body: AdapterBody::Bytes(bytes),
                upstream_request: Some(b"{}".to_vec()),
            })
        }
    }

    #[derive(Default)]
    struct ScriptedFactory {
        scripts: Mutex<HashMap<i64, Vec<Result<Bytes, UpstreamError>>>>,
    }

    impl ScriptedFactory {
        fn script(&self, provider_id: i64, mut results: Vec<Result<Bytes, UpstreamError>>) {
            // Stored reversed so pop() yields them in order.
            results.reverse();
            self.scripts.lock().unwrap().insert(provider_id, results);
        }
    }

    impl AdapterFactory for ScriptedFactory {
        fn build(
            &self,
            provider: &ProviderRow,
            _state: &AppState,
        ) -> Result<Arc<dyn UpstreamAdapter>, UpstreamError> {
            let script = self
                .scripts
                .lock()
                .unwrap()
                .remove(&provider.id)
                .unwrap_or_default();
            Ok(Arc::new(ScriptedAdapter {
                provider_id: provider.id,
                script: Mutex::new(script),
            }))
        }
    }

    fn claude_message_body() -> Bytes {
        Bytes::from(
            serde_json::json!({
                "id": "msg_1",
                "type": "message",
                "role": "assistant",
                "model": "claude-sonnet-4-5",
                "content": [{"type": "text", "text": "hi"}],
                "stop_reason": "end_turn",
                "usage": {"input_tokens": 11, "output_tokens": 4}
            })
            .to_string(),
        )
    }

    async fn seed_provider(storage: &MemoryStorage, id: i64) {
        let now = OffsetDateTime::now_utc();
        storage
            .upsert_provider(&ProviderRow {
                id,
                name: format!("p{id}"),
                kind: ProviderKind::Custom,
                config_json: serde_json::json!({
                    "type": "custom",
                    "base_url": "https://upstream.example",
                    "api_key": "k",
                    "native_dialects": ["claude"]
                }),
                enabled: true,
                deleted_at: None,
                created_at: now,
                updated_at: now,
            })
            .await
            .unwrap();
    }

    async fn seed_route(storage: &MemoryStorage, id: i64, provider_id: i64, position: i32) {
        storage
            .upsert_route(&RouteRow {
                id,
                project_id: 0,
                dialect: Dialect::Claude,
                provider_id,
                position,
                enabled: true,
                native: true,
                retry_config_id: None,
                updated_at: OffsetDateTime::now_utc(),
            })
            .await
            .unwrap();
    }

    async fn engine_with(
        storage: Arc<MemoryStorage>,
        factory: Arc<ScriptedFactory>,
    ) -> ProxyEngine {
        let state = AppState::bootstrap(
            GatewayConfig {
                host: "127.0.0.1".to_string(),
                port: 0,
                dsn: "memory".to_string(),
                proxy: None,
            },
            storage,
            Arc::new(StaticPriceTable::default()),
        )
        .await
        .unwrap();
        ProxyEngine::with_adapter_factory(state, factory)
    }

    fn spec() -> ProxyRequestSpec {
        ProxyRequestSpec {
            dialect: Dialect::Claude,
            path: "/v1/messages".to_string(),
            query: None,
            headers: Vec::new(),
            body: Bytes::from(r#"{"model":"claude-sonnet-4-5","messages":[]}"#),
            stream: false,
            model: "claude-sonnet-4-5".to_string(),
            session_id: Some("session-1".to_string()),
            project_id: None,
            token_id: None,
            cancel: CancellationToken::new(),
        }
    }

    fn body_bytes(response: EngineResponse) -> Bytes {
        match response.body {
            EngineBody::Bytes(bytes) => bytes,
            EngineBody::Stream(_) => panic!("expected bytes body"),
        }
    }

    #[tokio::test]
    async fn successful_request_completes_with_usage_and_cost() {
        let storage = Arc::new(MemoryStorage::new());
        seed_provider(&storage, 1).await;
        seed_route(&storage, 1, 1, 1).await;

        let factory = Arc::new(ScriptedFactory::default());
        factory.script(1, vec![Ok(claude_message_body())]);
        let engine = engine_with(storage.clone(), factory).await;

        let mut events = engine.state().events.subscribe();
        let response = engine.execute(spec()).await;
        assert_eq!(response.status, 200);
        let body = body_bytes(response);
        assert!(std::str::from_utf8(&body).unwrap().contains("\"hi\""));

        let mut request_id = None;
        while let Ok(event) = events.try_recv() {
            if let Event::RequestFinished { request_id: id, status, .. } = event {
                assert_eq!(status, RequestStatus::Completed);
                request_id = Some(id);
            }
        }
        let request_id = request_id.expect("request finished event");

        let record = storage
            .get_proxy_request(&request_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.status, RequestStatus::Completed);
        assert_eq!(record.attempt_count, 1);
        assert_eq!(record.usage.input_tokens, 11);
        assert_eq!(record.usage.output_tokens, 4);
        assert!(record.cost_micro_usd > 0);
        assert_eq!(record.final_model.as_deref(), Some("claude-sonnet-4-5"));

        let attempts = storage.list_proxy_attempts(&request_id).await.unwrap();
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].status, AttemptStatus::Completed);
    }

    #[tokio::test]
    async fn failed_provider_falls_through_to_next_route() {
        let storage = Arc::new(MemoryStorage::new());
        seed_provider(&storage, 1).await;
        seed_provider(&storage, 2).await;
        seed_route(&storage, 1, 1, 1).await;
        seed_route(&storage, 2, 2, 2).await;

        let factory = Arc::new(ScriptedFactory::default());
        factory.script(1, vec![Err(UpstreamError::server(503, "down"))]);
        factory.script(2, vec![Ok(claude_message_body())]);
        let engine = engine_with(storage.clone(), factory).await;

        let response = engine.execute(spec()).await;
        assert_eq!(response.status, 200);

        // The failing provider is quarantined for this dialect.
        assert!(
            engine
                .state()
                .cooldowns
                .is_cooling(1, Dialect::Claude)
                .await
        );
        assert!(
            !engine
                .state()
                .cooldowns
                .is_cooling(2, Dialect::Claude)
                .await
        );
    }

    #[tokio::test]
    async fn retry_config_drives_second_attempt_on_same_route() {
        let storage = Arc::new(MemoryStorage::new());
        seed_provider(&storage, 1).await;
        storage
            .upsert_retry_config(&maxx_storage::RetryConfigRow {
                id: 5,
                name: "fast".to_string(),
                max_retries: 1,
                initial_interval_ms: 1,
                backoff_rate: 2.0,
                max_interval_ms: 4,
                is_default: false,
            })
            .await
            .unwrap();
        storage
            .upsert_route(&RouteRow {
                id: 1,
                project_id: 0,
                dialect: Dialect::Claude,
                provider_id: 1,
                position: 1,
                enabled: true,
                native: true,
                retry_config_id: Some(5),
                updated_at: OffsetDateTime::now_utc(),
            })
            .await
            .unwrap();

        let factory = Arc::new(ScriptedFactory::default());
        factory.script(
            1,
            vec![
                Err(UpstreamError::server(500, "hiccup")),
                Ok(claude_message_body()),
            ],
        );
        let engine = engine_with(storage.clone(), factory).await;

        let response = engine.execute(spec()).await;
        assert_eq!(response.status, 200);
    }

    #[tokio::test]
    async fn non_retryable_error_skips_retry_loop() {
        let storage = Arc::new(MemoryStorage::new());
        seed_provider(&storage, 1).await;
        storage
            .upsert_retry_config(&maxx_storage::RetryConfigRow {
                id: 5,
                name: "fast".to_string(),
                max_retries: 3,
                initial_interval_ms: 1,
                backoff_rate: 2.0,
                max_interval_ms: 4,
                is_default: true,
            })
            .await
            .unwrap();
        seed_route(&storage, 1, 1, 1).await;

        let factory = Arc::new(ScriptedFactory::default());
        factory.script(1, vec![Err(UpstreamError::protocol("bad body"))]);
        let engine = engine_with(storage.clone(), factory).await;

        let response = engine.execute(spec()).await;
        assert_eq!(response.status, 502);
    }

    #[tokio::test]
    async fn no_routes_fails_with_503() {
        let storage = Arc::new(MemoryStorage::new());
        let factory = Arc::new(ScriptedFactory::default());
        let engine = engine_with(storage, factory).await;

        let response = engine.execute(spec()).await;
        assert_eq!(response.status, 503);
        let body = body_bytes(response);
        assert!(std::str::from_utf8(&body).unwrap().contains("no routes"));
    }

    #[tokio::test]
    async fn forced_binding_timeout_rejects() {
        let storage = Arc::new(MemoryStorage::new());
        seed_provider(&storage, 1).await;
        seed_route(&storage, 1, 1, 1).await;
        storage
            .set_setting(settings::FORCE_PROJECT_BINDING, "true")
            .await
            .unwrap();
        storage
            .set_setting(settings::FORCE_PROJECT_TIMEOUT, "0")
            .await
            .unwrap();

        let factory = Arc::new(ScriptedFactory::default());
        let engine = engine_with(storage, factory).await;

        let response = engine.execute(spec()).await;
        assert_eq!(response.status, 403);
        let body = body_bytes(response);
        assert!(
            std::str::from_utf8(&body)
                .unwrap()
                .contains("project binding timeout")
        );
    }

    #[tokio::test]
    async fn cooling_provider_deferred_behind_healthy_one() {
        let storage = Arc::new(MemoryStorage::new());
        seed_provider(&storage, 1).await;
        seed_provider(&storage, 2).await;
        seed_route(&storage, 1, 1, 1).await;
        seed_route(&storage, 2, 2, 2).await;

        let factory = Arc::new(ScriptedFactory::default());
        // Provider 1 would fail if called; provider 2 succeeds.
        factory.script(1, vec![Err(UpstreamError::server(500, "should not be called"))]);
        factory.script(2, vec![Ok(claude_message_body())]);
        let engine = engine_with(storage.clone(), factory).await;

        engine
            .state()
            .cooldowns
            .record_failure(
                1,
                Dialect::Claude,
                CooldownReason::QuotaExhausted,
                Some(OffsetDateTime::now_utc() + time::Duration::hours(1)),
            )
            .await;

        let response = engine.execute(spec()).await;
        assert_eq!(response.status, 200);
    }

    #[tokio::test]
    async fn success_resets_failure_counters() {
        let storage = Arc::new(MemoryStorage::new());
        seed_provider(&storage, 1).await;
        seed_route(&storage, 1, 1, 1).await;

        storage
            .increment_failure_count(
                1,
                Dialect::Claude,
                CooldownReason::ServerError,
                OffsetDateTime::now_utc(),
            )
            .await
            .unwrap();

        let factory = Arc::new(ScriptedFactory::default());
        factory.script(1, vec![Ok(claude_message_body())]);
        let engine = engine_with(storage.clone(), factory).await;

        let response = engine.execute(spec()).await;
        assert_eq!(response.status, 200);

        let counter = storage
            .get_failure_count(1, Dialect::Claude, CooldownReason::ServerError)
            .await
            .unwrap();
        assert!(counter.is_none());
    }
}
