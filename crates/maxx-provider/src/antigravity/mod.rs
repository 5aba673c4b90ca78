use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use time::OffsetDateTime;
use tokio_stream::wrappers::ReceiverStream;

use maxx_common::Dialect;
use maxx_protocol::claude::request::CreateMessageRequest;
use maxx_protocol::claude::stream::StreamEvent;
use maxx_protocol::gemini::response::GenerateContentResponse;
use maxx_protocol::sse::{SseParser, format_data, format_event};
use maxx_transform::SignatureCache;
use maxx_transform::claude2gemini::sanitize::deep_clean_undefined;
use maxx_transform::claude2gemini::{
    ConvertOptions, GeminiToClaudeStream, transform_request, transform_response,
};
use maxx_transform::stream2nostream::ClaudeStreamCollector;

use crate::adapter::{AdapterBody, AdapterResponse, AttemptCtx, ClientRequest, UpstreamAdapter};
use crate::config::AntigravityConfig;
use crate::custom::send_claude_event;
use crate::error::{UpstreamError, UpstreamResult, classify_http, stream_error_is_retryable};
use crate::http_client::client_for_proxy;

mod oauth;
mod quota;

pub use oauth::TokenCache;

const DEFAULT_BASE_URL: &str = "https://cloudcode-pa.googleapis.com";
const ANTIGRAVITY_USER_AGENT: &str = "antigravity";
const DEFAULT_CLAUDE_MODEL: &str = "claude-sonnet-4-5";
const IMAGE_MODEL_PREFIX: &str = "gemini-3-pro-image";

const ASPECT_RATIOS: [&str; 8] = ["1x1", "2x3", "3x2", "3x4", "4x3", "9x16", "16x9", "21x9"];
const IMAGE_SIZES: [&str; 3] = ["hd", "2k", "4k"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestType {
    Agent,
    WebSearch,
    ImageGen,
}

impl RequestType {
    fn as_str(&self) -> &'static str {
        match self {
            RequestType::Agent => "agent",
            RequestType::WebSearch => "web_search",
            RequestType::ImageGen => "image_gen",
        }
    }
}

/// Adapter for Google's v1internal Cloud-Code endpoint.
///
/// Requests are Gemini-shaped regardless of the client dialect; Claude-native
/// models answer with a Claude SSE stream that is collected or passed through.
pub struct AntigravityAdapter {
    provider_id: i64,
    config: AntigravityConfig,
    tokens: Arc<TokenCache>,
    signatures: Arc<SignatureCache>,
}

impl AntigravityAdapter {
    pub fn new(
        provider_id: i64,
        config: AntigravityConfig,
        tokens: Arc<TokenCache>,
        signatures: Arc<SignatureCache>,
    ) -> Self {
        Self {
            provider_id,
            config,
            tokens,
            signatures,
        }
    }

    fn base_url(&self) -> &str {
        self.config
            .base_url
            .as_deref()
            .unwrap_or(DEFAULT_BASE_URL)
    }

    /// Haiku override plus alias normalisation. Gemini and thinking models
    /// pass through verbatim; anything else lands on the default Claude
    /// model the endpoint emulates.
    fn map_model(&self, mapped: &str) -> String {
        let lower = mapped.to_ascii_lowercase();
        if lower.contains("haiku") {
            return self
                .config
                .haiku_target
                .clone()
                .unwrap_or_else(|| DEFAULT_CLAUDE_MODEL.to_string());
        }
        if mapped.starts_with("gemini-") || lower.contains("thinking") {
            return mapped.to_string();
        }
        DEFAULT_CLAUDE_MODEL.to_string()
    }

    async fn bearer(&self, client: &wreq::Client) -> UpstreamResult<String> {
        self.tokens
            .access_token(self.provider_id, &self.config, client)
            .await
    }

    async fn send_internal(
        &self,
        ctx: &AttemptCtx,
        client: &wreq::Client,
        url: &str,
        body: &[u8],
    ) -> UpstreamResult<wreq::Response> {
        let mut refreshed = false;
        loop {
            let token = self.bearer(client).await?;
            let builder = client
                .post(url)
                .header("content-type", "application/json")
                .header("accept", "application/json")
                .header("authorization", format!("Bearer {token}"))
                .header("user-agent", ANTIGRAVITY_USER_AGENT)
                .body(body.to_vec());

            let response = tokio::select! {
                _ = ctx.cancel.cancelled() => return Err(UpstreamError::cancelled()),
                result = builder.send() => {
                    result.map_err(|err| UpstreamError::network(err.to_string()))?
                }
            };

            // One refresh + retry on 401, then surface the failure.
            if response.status().as_u16() == 401 && !refreshed {
                refreshed = true;
                self.tokens.invalidate(self.provider_id).await;
                continue;
            }
            return Ok(response);
        }
    }
}

#[async_trait]
impl UpstreamAdapter for AntigravityAdapter {
    fn provider_id(&self) -> i64 {
        self.provider_id
    }

    async fn execute(
        &self,
        ctx: &AttemptCtx,
        request: &ClientRequest,
    ) -> Result<AdapterResponse, UpstreamError> {
        if ctx.cancel.is_cancelled() {
            return Err(UpstreamError::cancelled());
        }

        let plan = self.plan_request(ctx, request)?;
        let stream_upstream = ctx.stream || plan.claude_native;
        let url = format!(
            "{}{}",
            self.base_url().trim_end_matches('/'),
            if stream_upstream {
                "/v1internal:streamGenerateContent?alt=sse"
            } else {
                "/v1internal:generateContent"
            }
        );

        let envelope = serde_json::json!({
            "project": self.config.project_id,
            "requestId": format!("agent-{}", uuid::Uuid::new_v4()),
            "request": plan.inner,
            "model": plan.model,
            "userAgent": ANTIGRAVITY_USER_AGENT,
            "requestType": plan.request_type.as_str(),
        });
        let body = serde_json::to_vec(&envelope)
            .map_err(|err| UpstreamError::protocol(err.to_string()))?;

        let client = client_for_proxy(ctx.outbound_proxy.as_deref())?;
        let response = self.send_internal(ctx, &client, &url, &body).await?;
        let status = response.status().as_u16();
        let headers = collect_headers(&response);

        if !(200..300).contains(&status) {
            let error_body = response
                .bytes()
                .await
                .map_err(|err| UpstreamError::network(err.to_string()))?;
            return Err(classify_http(status, &headers, &error_body, ctx.dialect));
        }

        if !stream_upstream {
            let bytes = response
                .bytes()
                .await
                .map_err(|err| UpstreamError::network(err.to_string()))?;
            let inner = unwrap_internal(&bytes)?;
            let out = match ctx.dialect {
                Dialect::Claude => {
                    let gemini: GenerateContentResponse = serde_json::from_value(inner)
                        .map_err(|err| {
                            UpstreamError::protocol(format!("invalid gemini response: {err}"))
                        })?;
                    let message = transform_response(gemini, &ctx.mapped_model);
                    serde_json::to_vec(&message)
                        .map_err(|err| UpstreamError::protocol(err.to_string()))?
                }
                _ => serde_json::to_vec(&inner)
                    .map_err(|err| UpstreamError::protocol(err.to_string()))?,
            };
            return Ok(AdapterResponse {
                status,
                headers: vec![("content-type".to_string(), "application/json".to_string())],
                body: AdapterBody::Bytes(Bytes::from(out)),
                upstream_request: Some(body),
            });
        }

        // Claude-native upstream + non-streaming client: collect the SSE
        // stream into a single message before answering.
        if plan.claude_native && !ctx.stream {
            let message = collect_claude_stream(response, ctx).await?;
            let out = serde_json::to_vec(&message)
                .map_err(|err| UpstreamError::protocol(err.to_string()))?;
            return Ok(AdapterResponse {
                status,
                headers: vec![("content-type".to_string(), "application/json".to_string())],
                body: AdapterBody::Bytes(Bytes::from(out)),
                upstream_request: Some(body),
            });
        }

        let stream = match (ctx.dialect, plan.claude_native) {
            (Dialect::Claude, false) => gemini_to_claude_stream(
                response,
                ctx,
                &plan.model,
                self.signatures.clone(),
            ),
            (Dialect::Claude, true) => claude_passthrough_stream(response, ctx),
            _ => unwrap_passthrough_stream(response, ctx),
        };

        Ok(AdapterResponse {
            status,
            headers: vec![("content-type".to_string(), "text/event-stream".to_string())],
            body: AdapterBody::Stream(stream),
            upstream_request: Some(body),
        })
    }

    fn can_resolve_quota_reset(&self) -> bool {
        true
    }

    async fn resolve_quota_reset(&self, ctx: &AttemptCtx) -> Option<OffsetDateTime> {
        let client = client_for_proxy(ctx.outbound_proxy.as_deref()).ok()?;
        let token = self.bearer(&client).await.ok()?;
        quota::lookup_quota_reset(&client, self.base_url(), &token, ANTIGRAVITY_USER_AGENT).await
    }
}

struct RequestPlan {
    inner: serde_json::Value,
    model: String,
    request_type: RequestType,
    claude_native: bool,
}

impl AntigravityAdapter {
    fn plan_request(
        &self,
        ctx: &AttemptCtx,
        request: &ClientRequest,
    ) -> UpstreamResult<RequestPlan> {
        match ctx.dialect {
            Dialect::Claude => {
                let claude_request: CreateMessageRequest =
                    serde_json::from_slice(&request.body).map_err(|err| {
                        UpstreamError::protocol(format!("invalid claude request: {err}"))
                    })?;
                let mapped = self.map_model(&ctx.mapped_model);
                let converted = transform_request(
                    claude_request,
                    &ConvertOptions {
                        mapped_model: &mapped,
                        session_id: ctx.session_id.as_deref(),
                    },
                    &self.signatures,
                );
                let mut inner = serde_json::to_value(&converted.body)
                    .map_err(|err| UpstreamError::protocol(err.to_string()))?;
                deep_clean_undefined(&mut inner);

                let (model, request_type) =
                    finalize_model(&converted.model, converted.web_search, &mut inner);
                let claude_native = model.starts_with("claude");
                Ok(RequestPlan {
                    inner,
                    model,
                    request_type,
                    claude_native,
                })
            }
            Dialect::Gemini => {
                let mut inner: serde_json::Value = serde_json::from_slice(&request.body)
                    .map_err(|err| {
                        UpstreamError::protocol(format!("invalid gemini request: {err}"))
                    })?;
                deep_clean_undefined(&mut inner);
                let mapped = self.map_model(&ctx.mapped_model);
                let web_search = gemini_body_requests_search(&inner);
                let (model, request_type) = finalize_model(&mapped, web_search, &mut inner);
                let claude_native = model.starts_with("claude");
                Ok(RequestPlan {
                    inner,
                    model,
                    request_type,
                    claude_native,
                })
            }
            other => Err(UpstreamError::unsupported(format!(
                "antigravity does not accept {other} requests"
            ))),
        }
    }
}

/// Resolve image-generation models and the request type tag.
fn finalize_model(
    model: &str,
    web_search: bool,
    inner: &mut serde_json::Value,
) -> (String, RequestType) {
    if model.starts_with(IMAGE_MODEL_PREFIX) {
        let (base, aspect_ratio, image_size) = parse_image_model(model);
        prepare_image_request(inner, aspect_ratio, image_size);
        return (base, RequestType::ImageGen);
    }
    if web_search {
        return (model.to_string(), RequestType::WebSearch);
    }
    (model.to_string(), RequestType::Agent)
}

/// `gemini-3-pro-image-16x9-4k` → (`gemini-3-pro-image`, `16:9`, `4K`).
fn parse_image_model(model: &str) -> (String, Option<String>, Option<String>) {
    let mut base = model.to_string();
    let mut aspect_ratio = None;
    let mut image_size = None;

    loop {
        let Some((head, tail)) = base.rsplit_once('-') else {
            break;
        };
        let token = tail.to_ascii_lowercase();
        if IMAGE_SIZES.contains(&token.as_str()) && image_size.is_none() {
            image_size = Some(if token == "hd" {
                "HD".to_string()
            } else {
                token.to_ascii_uppercase()
            });
            base = head.to_string();
            continue;
        }
        if ASPECT_RATIOS.contains(&token.as_str()) && aspect_ratio.is_none() {
            aspect_ratio = Some(token.replace('x', ":"));
            base = head.to_string();
            continue;
        }
        break;
    }

    (base, aspect_ratio, image_size)
}

/// Image requests carry no tools or thinking and get an `imageConfig`.
fn prepare_image_request(
    inner: &mut serde_json::Value,
    aspect_ratio: Option<String>,
    image_size: Option<String>,
) {
    let Some(object) = inner.as_object_mut() else {
        return;
    };
    object.remove("tools");
    object.remove("toolConfig");
    object.remove("systemInstruction");

    let config = object
        .entry("generationConfig")
        .or_insert_with(|| serde_json::Value::Object(Default::default()));
    if let Some(config) = config.as_object_mut() {
        config.remove("thinkingConfig");
        config.remove("responseMimeType");
        config.remove("responseModalities");
        let mut image_config = serde_json::Map::new();
        if let Some(aspect_ratio) = aspect_ratio {
            image_config.insert(
                "aspectRatio".to_string(),
                serde_json::Value::String(aspect_ratio),
            );
        }
        if let Some(image_size) = image_size {
            image_config.insert(
                "imageSize".to_string(),
                serde_json::Value::String(image_size),
            );
        }
        config.insert(
            "imageConfig".to_string(),
            serde_json::Value::Object(image_config),
        );
    }
}

fn gemini_body_requests_search(inner: &serde_json::Value) -> bool {
    inner
        .get("tools")
        .and_then(|tools| tools.as_array())
        .is_some_and(|tools| {
            tools
                .iter()
                .any(|tool| tool.get("googleSearch").is_some())
        })
}

/// Every v1internal payload wraps the Gemini body as `{"response": inner}`.
fn unwrap_internal(bytes: &[u8]) -> UpstreamResult<serde_json::Value> {
    let mut value: serde_json::Value = serde_json::from_slice(bytes)
        .map_err(|err| UpstreamError::protocol(format!("invalid upstream body: {err}")))?;
    if let Some(inner) = value.get_mut("response") {
        return Ok(inner.take());
    }
    Ok(value)
}

fn unwrap_internal_line(data: &str) -> Option<serde_json::Value> {
    let mut value: serde_json::Value = serde_json::from_str(data).ok()?;
    if let Some(inner) = value.get_mut("response") {
        return Some(inner.take());
    }
    Some(value)
}

fn collect_headers(response: &wreq::Response) -> Vec<(String, String)> {
    let mut out = Vec::new();
    for (name, value) in response.headers() {
        if let Ok(value) = value.to_str() {
            out.push((name.as_str().to_string(), value.to_string()));
        }
    }
    out
}

/// Drain a Claude-native SSE stream into one message for a non-streaming
/// client.
async fn collect_claude_stream(
    response: wreq::Response,
    ctx: &AttemptCtx,
) -> UpstreamResult<maxx_protocol::claude::response::MessageResponse> {
    let mut upstream = response.bytes_stream();
    let mut parser = SseParser::new();
    let mut collector = ClaudeStreamCollector::new();

    loop {
        let item = tokio::select! {
            _ = ctx.cancel.cancelled() => return Err(UpstreamError::cancelled()),
            item = upstream.next() => item,
        };
        let Some(item) = item else {
            break;
        };
        let chunk = item.map_err(|err| UpstreamError::network(err.to_string()))?;
        for event in parser.push_bytes(&chunk) {
            if let Some(message) = push_collected_event(&mut collector, &event.data)? {
                return Ok(message);
            }
        }
    }

    for event in parser.finish() {
        if let Some(message) = push_collected_event(&mut collector, &event.data)? {
            return Ok(message);
        }
    }
    collector
        .finalize_on_eof()
        .ok_or_else(|| UpstreamError::protocol("upstream stream ended before message_start"))
}

fn push_collected_event(
    collector: &mut ClaudeStreamCollector,
    data: &str,
) -> UpstreamResult<Option<maxx_protocol::claude::response::MessageResponse>> {
    if data.is_empty() || data == "[DONE]" {
        return Ok(None);
    }
    let Some(inner) = unwrap_internal_line(data) else {
        return Ok(None);
    };
    let Ok(event) = serde_json::from_value::<StreamEvent>(inner) else {
        return Ok(None);
    };
    if let StreamEvent::Error { error } = &event {
        let message = error.message.clone().unwrap_or_default();
        let mut err = UpstreamError::protocol(message.clone());
        err.retryable = stream_error_is_retryable(error.kind.as_deref(), Some(&message));
        return Err(err);
    }
    Ok(collector.push_event(event))
}

/// Gemini-model stream for a Claude client: unwrap, translate, re-frame.
fn gemini_to_claude_stream(
    response: wreq::Response,
    ctx: &AttemptCtx,
    upstream_model: &str,
    signatures: Arc<SignatureCache>,
) -> futures_util::stream::BoxStream<'static, UpstreamResult<Bytes>> {
    let cancel = ctx.cancel.clone();
    let mut state =
        GeminiToClaudeStream::new(upstream_model, ctx.session_id.as_deref(), signatures);
    let (tx, rx) = tokio::sync::mpsc::channel::<UpstreamResult<Bytes>>(16);

    tokio::spawn(async move {
        let mut upstream = response.bytes_stream();
        let mut parser = SseParser::new();

        'outer: loop {
            let item = tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = tx.send(Err(UpstreamError::cancelled())).await;
                    return;
                }
                item = upstream.next() => item,
            };
            let Some(item) = item else {
                break;
            };
            let chunk = match item {
                Ok(chunk) => chunk,
                Err(err) => {
                    let _ = tx.send(Err(UpstreamError::network(err.to_string()))).await;
                    return;
                }
            };
            for event in parser.push_bytes(&chunk) {
                if event.data.is_empty() || event.data == "[DONE]" {
                    continue;
                }
                let Some(inner) = unwrap_internal_line(&event.data) else {
                    continue;
                };
                let Ok(gemini) = serde_json::from_value::<GenerateContentResponse>(inner) else {
                    continue;
                };
                for out in state.transform_chunk(gemini) {
                    if send_claude_event(&tx, &out).await.is_err() {
                        break 'outer;
                    }
                }
            }
        }

        for out in state.finish() {
            if send_claude_event(&tx, &out).await.is_err() {
                return;
            }
        }
    });

    Box::pin(ReceiverStream::new(rx))
}

/// Claude-native stream for a Claude client: unwrap and re-frame verbatim.
fn claude_passthrough_stream(
    response: wreq::Response,
    ctx: &AttemptCtx,
) -> futures_util::stream::BoxStream<'static, UpstreamResult<Bytes>> {
    let cancel = ctx.cancel.clone();
    let (tx, rx) = tokio::sync::mpsc::channel::<UpstreamResult<Bytes>>(16);

    tokio::spawn(async move {
        let mut upstream = response.bytes_stream();
        let mut parser = SseParser::new();

        'outer: loop {
            let item = tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = tx.send(Err(UpstreamError::cancelled())).await;
                    return;
                }
                item = upstream.next() => item,
            };
            let Some(item) = item else {
                break;
            };
            let chunk = match item {
                Ok(chunk) => chunk,
                Err(err) => {
                    let _ = tx.send(Err(UpstreamError::network(err.to_string()))).await;
                    return;
                }
            };
            for event in parser.push_bytes(&chunk) {
                if event.data.is_empty() {
                    continue;
                }
                let Some(inner) = unwrap_internal_line(&event.data) else {
                    let framed = format_data(&event.data);
                    if tx.send(Ok(Bytes::from(framed))).await.is_err() {
                        break 'outer;
                    }
                    continue;
                };
                let label = inner
                    .get("type")
                    .and_then(|t| t.as_str())
                    .unwrap_or("message")
                    .to_string();
                let data = inner.to_string();
                let framed = format_event(&label, &data);
                if tx.send(Ok(Bytes::from(framed))).await.is_err() {
                    break 'outer;
                }
            }
        }
    });

    Box::pin(ReceiverStream::new(rx))
}

/// Gemini client: unwrap each wrapped data line and re-emit it.
fn unwrap_passthrough_stream(
    response: wreq::Response,
    ctx: &AttemptCtx,
) -> futures_util::stream::BoxStream<'static, UpstreamResult<Bytes>> {
    let cancel = ctx.cancel.clone();
    let (tx, rx) = tokio::sync::mpsc::channel::<UpstreamResult<Bytes>>(16);

    tokio::spawn(async move {
        let mut upstream = response.bytes_stream();
        let mut parser = SseParser::new();

        'outer: loop {
            let item = tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = tx.send(Err(UpstreamError::cancelled())).await;
                    return;
                }
                item = upstream.next() => item,
            };
            let Some(item) = item else {
                break;
            };
            let chunk = match item {
                Ok(chunk) => chunk,
                Err(err) => {
                    let _ = tx.send(Err(UpstreamError::network(err.to_string()))).await;
                    return;
                }
            };
            for event in parser.push_bytes(&chunk) {
                if event.data.is_empty() {
                    continue;
                }
                // Non-JSON payloads pass through unchanged, re-terminated.
                let framed = match unwrap_internal_line(&event.data) {
                    Some(inner) => format_data(&inner.to_string()),
                    None => format_data(&event.data),
                };
                if tx.send(Ok(Bytes::from(framed))).await.is_err() {
                    break 'outer;
                }
            }
        }
    });

    Box::pin(ReceiverStream::new(rx))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn adapter(haiku_target: Option<&str>) -> AntigravityAdapter {
        AntigravityAdapter::new(
            1,
            AntigravityConfig {
                refresh_token: "1//refresh".to_string(),
                project_id: "proj".to_string(),
                base_url: None,
                haiku_target: haiku_target.map(str::to_string),
                email: None,
            },
            Arc::new(TokenCache::new()),
            Arc::new(SignatureCache::new(8)),
        )
    }

    #[test]
    fn haiku_models_remapped_to_target() {
        let adapter = adapter(Some("gemini-3-pro-high"));
        assert_eq!(adapter.map_model("claude-haiku-4-5"), "gemini-3-pro-high");
        assert_eq!(adapter.map_model("Claude-HAIKU"), "gemini-3-pro-high");
    }

    #[test]
    fn gemini_and_thinking_models_pass_through() {
        let adapter = adapter(None);
        assert_eq!(adapter.map_model("gemini-2.5-flash"), "gemini-2.5-flash");
        assert_eq!(
            adapter.map_model("claude-opus-4-5-thinking"),
            "claude-opus-4-5-thinking"
        );
    }

    #[test]
    fn other_aliases_fall_back_to_sonnet() {
        let adapter = adapter(None);
        assert_eq!(adapter.map_model("claude-3-5-sonnet-latest"), DEFAULT_CLAUDE_MODEL);
        assert_eq!(adapter.map_model("gpt-4o"), DEFAULT_CLAUDE_MODEL);
    }

    #[test]
    fn image_model_suffixes_parsed() {
        let (base, aspect, size) = parse_image_model("gemini-3-pro-image-16x9-4k");
        assert_eq!(base, "gemini-3-pro-image");
        assert_eq!(aspect.as_deref(), Some("16:9"));
        assert_eq!(size.as_deref(), Some("4K"));

        let (base, aspect, size) = parse_image_model("gemini-3-pro-image-hd");
        assert_eq!(base, "gemini-3-pro-image");
        assert_eq!(aspect, None);
        assert_eq!(size.as_deref(), Some("HD"));

        let (base, aspect, size) = parse_image_model("gemini-3-pro-image");
        assert_eq!(base, "gemini-3-pro-image");
        assert_eq!(aspect, None);
        assert_eq!(size, None);
    }

    #[test]
    fn image_request_strips_tools_and_thinking() {
        let mut inner = json!({
            "contents": [],
            "tools": [{"functionDeclarations": []}],
            "systemInstruction": {"parts": [{"text": "x"}]},
            "generationConfig": {
                "thinkingConfig": {"includeThoughts": true},
                "responseMimeType": "application/json",
                "maxOutputTokens": 64000
            }
        });
        prepare_image_request(&mut inner, Some("16:9".to_string()), Some("4K".to_string()));
        assert!(inner.get("tools").is_none());
        assert!(inner.get("systemInstruction").is_none());
        let config = inner.get("generationConfig").unwrap();
        assert!(config.get("thinkingConfig").is_none());
        assert!(config.get("responseMimeType").is_none());
        assert_eq!(config["imageConfig"]["aspectRatio"], "16:9");
        assert_eq!(config["imageConfig"]["imageSize"], "4K");
        assert_eq!(config["maxOutputTokens"], 64000);
    }

    #[test]
    fn wrapped_payload_unwraps() {
        let inner = unwrap_internal(br#"{"response": {"candidates": []}}"#).unwrap();
        assert_eq!(inner, json!({"candidates": []}));
        let bare = unwrap_internal(br#"{"candidates": []}"#).unwrap();
        assert_eq!(bare, json!({"candidates": []}));
    }

    #[test]
    fn google_search_tool_detected_in_gemini_body() {
        let body = json!({"tools": [{"googleSearch": {}}]});
        assert!(gemini_body_requests_search(&body));
        let body = json!({"tools": [{"functionDeclarations": []}]});
        assert!(!gemini_body_requests_search(&body));
    }
}
