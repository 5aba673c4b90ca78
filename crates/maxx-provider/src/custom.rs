use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use tokio_stream::wrappers::ReceiverStream;

use maxx_common::Dialect;
use maxx_protocol::claude::request::CreateMessageRequest;
use maxx_protocol::gemini::response::GenerateContentResponse;
use maxx_protocol::sse::{SseParser, format_event};
use maxx_transform::SignatureCache;
use maxx_transform::claude2gemini::sanitize::deep_clean_undefined;
use maxx_transform::claude2gemini::{
    ConvertOptions, GeminiToClaudeStream, transform_request, transform_response,
};

use crate::adapter::{AdapterBody, AdapterResponse, AttemptCtx, ClientRequest, UpstreamAdapter};
use crate::error::{UpstreamError, UpstreamResult, classify_http};
use crate::http_client::client_for_proxy;

/// Inbound headers never forwarded upstream. Host and content-length are
/// recomputed by the HTTP client.
const STRIPPED_HEADERS: [&str; 18] = [
    "host",
    "content-length",
    "connection",
    "x-forwarded-for",
    "x-forwarded-host",
    "x-forwarded-proto",
    "x-real-ip",
    "true-client-ip",
    "cf-connecting-ip",
    "cf-ray",
    "cf-ipcountry",
    "cf-visitor",
    "cdn-loop",
    "traceparent",
    "tracestate",
    "x-maxx-project-id",
    "x-api-key",
    "x-goog-api-key",
];

/// Pass-through (or converted) adapter for an arbitrary HTTP endpoint
/// speaking one of the four dialects.
pub struct CustomAdapter {
    provider_id: i64,
    config: crate::config::CustomConfig,
    signatures: Arc<SignatureCache>,
}

impl CustomAdapter {
    pub fn new(
        provider_id: i64,
        config: crate::config::CustomConfig,
        signatures: Arc<SignatureCache>,
    ) -> Self {
        Self {
            provider_id,
            config,
            signatures,
        }
    }

    async fn forward_native(
        &self,
        ctx: &AttemptCtx,
        request: &ClientRequest,
    ) -> UpstreamResult<AdapterResponse> {
        let base = self.config.base_url_for(ctx.dialect).trim_end_matches('/');
        let path = match ctx.dialect {
            Dialect::Gemini => rewrite_gemini_model_path(&request.path, &ctx.mapped_model),
            _ => request.path.clone(),
        };
        let mut url = format!("{base}{path}");
        if let Some(query) = &request.query {
            url.push('?');
            url.push_str(query);
        }

        let body = match ctx.dialect {
            Dialect::Gemini => request.body.to_vec(),
            _ => rewrite_body_model(&request.body, &ctx.mapped_model)?,
        };

        let client = client_for_proxy(ctx.outbound_proxy.as_deref())?;
        let mut builder = client.post(&url);
        for (name, value) in filter_headers(&request.headers) {
            builder = builder.header(name, value);
        }
        builder = apply_auth(builder, ctx.dialect, &self.config.api_key);
        builder = builder.header("content-type", "application/json");

        let response = send_with_cancel(builder.body(body.clone()), ctx).await?;
        let status = response.status().as_u16();
        let headers = response_headers(&response);

        if !(200..300).contains(&status) {
            let error_body = response
                .bytes()
                .await
                .map_err(|err| UpstreamError::network(err.to_string()))?;
            return Err(classify_http(status, &headers, &error_body, ctx.dialect));
        }

        let body_out = if ctx.stream {
            AdapterBody::Stream(passthrough_stream(response, ctx))
        } else {
            let bytes = response
                .bytes()
                .await
                .map_err(|err| UpstreamError::network(err.to_string()))?;
            AdapterBody::Bytes(bytes)
        };

        Ok(AdapterResponse {
            status,
            headers,
            body: body_out,
            upstream_request: Some(body),
        })
    }

    async fn forward_converted_claude(
        &self,
        ctx: &AttemptCtx,
        request: &ClientRequest,
    ) -> UpstreamResult<AdapterResponse> {
        let claude_request: CreateMessageRequest = serde_json::from_slice(&request.body)
            .map_err(|err| UpstreamError::protocol(format!("invalid claude request: {err}")))?;

        let converted = transform_request(
            claude_request,
            &ConvertOptions {
                mapped_model: &ctx.mapped_model,
                session_id: ctx.session_id.as_deref(),
            },
            &self.signatures,
        );

        let mut body_value = serde_json::to_value(&converted.body)
            .map_err(|err| UpstreamError::protocol(err.to_string()))?;
        deep_clean_undefined(&mut body_value);
        let body = serde_json::to_vec(&body_value)
            .map_err(|err| UpstreamError::protocol(err.to_string()))?;

        let base = self.config.base_url_for(Dialect::Gemini).trim_end_matches('/');
        let verb = if ctx.stream {
            "streamGenerateContent?alt=sse"
        } else {
            "generateContent"
        };
        let url = format!("{base}/v1beta/models/{}:{verb}", converted.model);

        let client = client_for_proxy(ctx.outbound_proxy.as_deref())?;
        let builder = client
            .post(&url)
            .header("x-goog-api-key", &self.config.api_key)
            .header("content-type", "application/json")
            .header("accept", "application/json");

        let response = send_with_cancel(builder.body(body.clone()), ctx).await?;
        let status = response.status().as_u16();
        let headers = response_headers(&response);

        if !(200..300).contains(&status) {
            let error_body = response
                .bytes()
                .await
                .map_err(|err| UpstreamError::network(err.to_string()))?;
            return Err(classify_http(status, &headers, &error_body, Dialect::Claude));
        }

        if ctx.stream {
            let stream = convert_gemini_stream(
                response,
                ctx,
                &converted.model,
                self.signatures.clone(),
            );
            Ok(AdapterResponse {
                status,
                headers: vec![("content-type".to_string(), "text/event-stream".to_string())],
                body: AdapterBody::Stream(stream),
                upstream_request: Some(body),
            })
        } else {
            let bytes = response
                .bytes()
                .await
                .map_err(|err| UpstreamError::network(err.to_string()))?;
            let gemini: GenerateContentResponse = serde_json::from_slice(&bytes)
                .map_err(|err| UpstreamError::protocol(format!("invalid gemini response: {err}")))?;
            let message = transform_response(gemini, &ctx.mapped_model);
            let out = serde_json::to_vec(&message)
                .map_err(|err| UpstreamError::protocol(err.to_string()))?;
            Ok(AdapterResponse {
                status,
                headers: vec![("content-type".to_string(), "application/json".to_string())],
                body: AdapterBody::Bytes(Bytes::from(out)),
                upstream_request: Some(body),
            })
        }
    }
}

#[async_trait]
impl UpstreamAdapter for CustomAdapter {
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

        if self.config.is_native(ctx.dialect) {
            return self.forward_native(ctx, request).await;
        }
        if ctx.dialect == Dialect::Claude && self.config.is_native(Dialect::Gemini) {
            return self.forward_converted_claude(ctx, request).await;
        }

        Err(UpstreamError::unsupported(format!(
            "no conversion from {} to this provider's dialects",
            ctx.dialect
        )))
    }
}

async fn send_with_cancel(
    builder: wreq::RequestBuilder,
    ctx: &AttemptCtx,
) -> UpstreamResult<wreq::Response> {
    tokio::select! {
        _ = ctx.cancel.cancelled() => Err(UpstreamError::cancelled()),
        result = builder.send() => {
            result.map_err(|err| UpstreamError::network(err.to_string()))
        }
    }
}

fn filter_headers(headers: &[(String, String)]) -> Vec<(String, String)> {
    headers
        .iter()
        .filter(|(name, _)| {
            let name = name.to_ascii_lowercase();
            !STRIPPED_HEADERS.contains(&name.as_str())
                && name != "authorization"
                && name != "content-type"
        })
        .cloned()
        .collect()
}

fn apply_auth(
    builder: wreq::RequestBuilder,
    dialect: Dialect,
    api_key: &str,
) -> wreq::RequestBuilder {
    match dialect {
        Dialect::Claude => builder.header("x-api-key", api_key),
        Dialect::OpenAI | Dialect::Codex => {
            builder.header("authorization", format!("Bearer {api_key}"))
        }
        Dialect::Gemini => builder.header("x-goog-api-key", api_key),
    }
}

fn response_headers(response: &wreq::Response) -> Vec<(String, String)> {
    let mut out = Vec::new();
    for (name, value) in response.headers() {
        let name = name.as_str();
        if matches!(name, "content-length" | "transfer-encoding" | "connection") {
            continue;
        }
        if let Ok(value) = value.to_str() {
            out.push((name.to_string(), value.to_string()));
        }
    }
    out
}

pub(crate) fn rewrite_body_model(body: &Bytes, model: &str) -> UpstreamResult<Vec<u8>> {
    let mut value: serde_json::Value = serde_json::from_slice(body)
        .map_err(|err| UpstreamError::protocol(format!("invalid request body: {err}")))?;
    if let Some(object) = value.as_object_mut() {
        object.insert(
            "model".to_string(),
            serde_json::Value::String(model.to_string()),
        );
    }
    serde_json::to_vec(&value).map_err(|err| UpstreamError::protocol(err.to_string()))
}

/// Substitute the mapped model in `/v1{beta,internal}/models/<model>:<verb>`.
pub(crate) fn rewrite_gemini_model_path(path: &str, model: &str) -> String {
    let Some((prefix, action)) = path.rsplit_once(':') else {
        return path.to_string();
    };
    let Some((head, _)) = prefix.rsplit_once('/') else {
        return path.to_string();
    };
    format!("{head}/{model}:{action}")
}

fn passthrough_stream(
    response: wreq::Response,
    ctx: &AttemptCtx,
) -> futures_util::stream::BoxStream<'static, UpstreamResult<Bytes>> {
    let cancel = ctx.cancel.clone();
    let (tx, rx) = tokio::sync::mpsc::channel::<UpstreamResult<Bytes>>(16);
    tokio::spawn(async move {
        let mut stream = response.bytes_stream();
        loop {
            let item = tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = tx.send(Err(UpstreamError::cancelled())).await;
                    break;
                }
                item = stream.next() => item,
            };
            let Some(item) = item else {
                break;
            };
            match item {
                Ok(chunk) => {
                    if tx.send(Ok(chunk)).await.is_err() {
                        break;
                    }
                }
                Err(err) => {
                    let _ = tx.send(Err(UpstreamError::network(err.to_string()))).await;
                    break;
                }
            }
        }
    });
    Box::pin(ReceiverStream::new(rx))
}

fn convert_gemini_stream(
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
                let Ok(gemini) = serde_json::from_str::<GenerateContentResponse>(&event.data)
                else {
                    continue;
                };
                for out in state.transform_chunk(gemini) {
                    if send_claude_event(&tx, &out).await.is_err() {
                        break 'outer;
                    }
                }
            }
        }

        for event in parser.finish() {
            if let Ok(gemini) = serde_json::from_str::<GenerateContentResponse>(&event.data) {
                for out in state.transform_chunk(gemini) {
                    if send_claude_event(&tx, &out).await.is_err() {
                        return;
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

pub(crate) async fn send_claude_event(
    tx: &tokio::sync::mpsc::Sender<UpstreamResult<Bytes>>,
    event: &maxx_protocol::claude::stream::StreamEvent,
) -> Result<(), ()> {
    let data = serde_json::to_string(event).map_err(|_| ())?;
    let framed = format_event(event.label(), &data);
    tx.send(Ok(Bytes::from(framed))).await.map_err(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gemini_path_model_substituted() {
        assert_eq!(
            rewrite_gemini_model_path(
                "/v1beta/models/gemini-2.5-flash:generateContent",
                "gemini-2.5-pro"
            ),
            "/v1beta/models/gemini-2.5-pro:generateContent"
        );
        assert_eq!(
            rewrite_gemini_model_path(
                "/v1beta/models/gemini-2.5-flash:streamGenerateContent",
                "gemini-2.5-pro"
            ),
            "/v1beta/models/gemini-2.5-pro:streamGenerateContent"
        );
    }

    #[test]
    fn non_model_paths_left_alone() {
        assert_eq!(
            rewrite_gemini_model_path("/v1beta/models", "gemini-2.5-pro"),
            "/v1beta/models"
        );
    }

    #[test]
    fn body_model_rewritten() {
        let body = Bytes::from_static(b"{\"model\":\"claude-haiku\",\"messages\":[]}");
        let out = rewrite_body_model(&body, "claude-sonnet-4-5").unwrap();
        let value: serde_json::Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(value["model"], "claude-sonnet-4-5");
    }

    #[test]
    fn ip_and_trace_headers_stripped() {
        let headers = vec![
            ("X-Forwarded-For".to_string(), "1.2.3.4".to_string()),
            ("traceparent".to_string(), "00-abc".to_string()),
            ("x-api-key".to_string(), "client-key".to_string()),
            ("anthropic-version".to_string(), "2023-06-01".to_string()),
        ];
        let filtered = filter_headers(&headers);
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].0, "anthropic-version");
    }
}
