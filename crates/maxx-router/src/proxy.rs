use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::extract::{Path, RawQuery, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::Response;
use axum::routing::post;
use bytes::Bytes;
use futures_util::StreamExt;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;

use maxx_common::Dialect;
use maxx_core::{EngineBody, EngineResponse, ProxyEngine, ProxyRequestSpec};
use maxx_storage::SessionRow;

/// Header set internally once a project slug resolves. Never trusted from
/// the client.
pub const PROJECT_HEADER: &str = "x-maxx-project-id";

#[derive(Clone)]
struct ProxyState {
    engine: Arc<ProxyEngine>,
}

pub fn proxy_router(engine: Arc<ProxyEngine>) -> Router {
    let state = ProxyState { engine };

    Router::new()
        .route("/v1/messages", post(claude_messages))
        .route("/v1/chat/completions", post(openai_chat))
        .route("/responses", post(codex_responses))
        .route("/v1beta/models/{*model}", post(gemini_generate))
        // Project-scoped variants; the first segment selects the namespace.
        .route("/{slug}/v1/messages", post(scoped_claude_messages))
        .route("/{slug}/v1/chat/completions", post(scoped_openai_chat))
        .route("/{slug}/responses", post(scoped_codex_responses))
        .route(
            "/{slug}/v1beta/models/{*model}",
            post(scoped_gemini_generate),
        )
        .with_state(state)
}

async fn claude_messages(
    State(state): State<ProxyState>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    dispatch_body_dialect(state, Dialect::Claude, "/v1/messages", None, query, headers, body).await
}

async fn scoped_claude_messages(
    State(state): State<ProxyState>,
    Path(slug): Path<String>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    dispatch_body_dialect(
        state,
        Dialect::Claude,
        "/v1/messages",
        Some(slug),
        query,
        headers,
        body,
    )
    .await
}

async fn openai_chat(
    State(state): State<ProxyState>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    dispatch_body_dialect(
        state,
        Dialect::OpenAI,
        "/v1/chat/completions",
        None,
        query,
        headers,
        body,
    )
    .await
}

async fn scoped_openai_chat(
    State(state): State<ProxyState>,
    Path(slug): Path<String>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    dispatch_body_dialect(
        state,
        Dialect::OpenAI,
        "/v1/chat/completions",
        Some(slug),
        query,
        headers,
        body,
    )
    .await
}

async fn codex_responses(
    State(state): State<ProxyState>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    dispatch_body_dialect(state, Dialect::Codex, "/responses", None, query, headers, body).await
}

async fn scoped_codex_responses(
    State(state): State<ProxyState>,
    Path(slug): Path<String>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    dispatch_body_dialect(
        state,
        Dialect::Codex,
        "/responses",
        Some(slug),
        query,
        headers,
        body,
    )
    .await
}

async fn gemini_generate(
    State(state): State<ProxyState>,
    Path(model): Path<String>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    dispatch_gemini(state, None, model, query, headers, body).await
}

async fn scoped_gemini_generate(
    State(state): State<ProxyState>,
    Path((slug, model)): Path<(String, String)>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    dispatch_gemini(state, Some(slug), model, query, headers, body).await
}

/// Dialects whose model and stream flag live in the JSON body.
#[allow(clippy::too_many_arguments)]
async fn dispatch_body_dialect(
    state: ProxyState,
    dialect: Dialect,
    path: &str,
    slug: Option<String>,
    query: Option<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Ok(parsed) = serde_json::from_slice::<serde_json::Value>(&body) else {
        return error_response(StatusCode::BAD_REQUEST, "invalid json body");
    };
    let Some(model) = parsed.get("model").and_then(|m| m.as_str()) else {
        return error_response(StatusCode::BAD_REQUEST, "missing model");
    };
    let stream = parsed
        .get("stream")
        .and_then(|s| s.as_bool())
        .unwrap_or(false);
    let session_id = session_from_request(dialect, &parsed, &headers);

    dispatch(
        state,
        dialect,
        path.to_string(),
        slug,
        query,
        headers,
        body,
        model.to_string(),
        stream,
        session_id,
    )
    .await
}

/// Gemini carries model and verb in the path: `{model}:{verb}`.
async fn dispatch_gemini(
    state: ProxyState,
    slug: Option<String>,
    model_action: String,
    query: Option<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some((model, action)) = model_action.split_once(':') else {
        return error_response(StatusCode::NOT_FOUND, "missing model action");
    };
    let stream = match action {
        "generateContent" => false,
        "streamGenerateContent" => true,
        _ => return error_response(StatusCode::NOT_FOUND, "unknown gemini action"),
    };
    let path = format!("/v1beta/models/{model_action}");
    let session_id = header_string(&headers, "x-session-id");

    dispatch(
        state,
        Dialect::Gemini,
        path,
        slug,
        query,
        headers,
        body,
        model.to_string(),
        stream,
        session_id,
    )
    .await
}

#[allow(clippy::too_many_arguments)]
async fn dispatch(
    state: ProxyState,
    dialect: Dialect,
    path: String,
    slug: Option<String>,
    query: Option<String>,
    headers: HeaderMap,
    body: Bytes,
    model: String,
    stream: bool,
    session_id: Option<String>,
) -> Response {
    let app = state.engine.state().clone();
    let snapshot = app.snapshot.load_full();

    // Project resolution: path slug first, then the session's binding.
    let mut project_id = None;
    if let Some(slug) = &slug {
        match snapshot.projects.iter().find(|p| &p.slug == slug) {
            Some(project) => project_id = Some(project.id),
            None => return error_response(StatusCode::NOT_FOUND, "unknown project"),
        }
    }

    if let Some(session_id) = &session_id {
        let now = OffsetDateTime::now_utc();
        match app.storage.get_session(session_id).await {
            Ok(Some(mut session)) => {
                if project_id.is_none() {
                    project_id = session.project_id;
                }
                session.last_seen_at = now;
                let _ = app.storage.upsert_session(&session).await;
            }
            Ok(None) => {
                let _ = app
                    .storage
                    .upsert_session(&SessionRow {
                        id: session_id.clone(),
                        project_id,
                        created_at: now,
                        last_seen_at: now,
                    })
                    .await;
            }
            Err(err) => {
                tracing::warn!(error = %err, "session lookup failed");
            }
        }
    }

    let token_id = bearer_token(&headers, dialect)
        .and_then(|token| {
            snapshot
                .api_tokens
                .iter()
                .find(|row| row.enabled && row.token == token)
        })
        .map(|row| row.id);

    let mut header_pairs: Vec<(String, String)> = headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect();
    if let Some(project_id) = project_id {
        header_pairs.push((PROJECT_HEADER.to_string(), project_id.to_string()));
    }

    let cancel = CancellationToken::new();
    let spec = ProxyRequestSpec {
        dialect,
        path,
        query,
        headers: header_pairs,
        body,
        stream,
        model,
        session_id,
        project_id,
        token_id,
        cancel: cancel.clone(),
    };

    let response = state.engine.execute(spec).await;
    into_http_response(response, cancel)
}

fn session_from_request(
    dialect: Dialect,
    body: &serde_json::Value,
    headers: &HeaderMap,
) -> Option<String> {
    if dialect == Dialect::Claude
        && let Some(user_id) = body
            .get("metadata")
            .and_then(|m| m.get("user_id"))
            .and_then(|u| u.as_str())
    {
        return Some(user_id.to_string());
    }
    header_string(headers, "x-session-id")
}

fn bearer_token(headers: &HeaderMap, dialect: Dialect) -> Option<String> {
    match dialect {
        Dialect::Claude => header_string(headers, "x-api-key"),
        Dialect::OpenAI | Dialect::Codex => header_string(headers, "authorization")
            .and_then(|value| value.strip_prefix("Bearer ").map(str::to_string)),
        Dialect::Gemini => header_string(headers, "x-goog-api-key"),
    }
}

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

fn into_http_response(response: EngineResponse, cancel: CancellationToken) -> Response {
    let mut builder = Response::builder().status(response.status);
    for (name, value) in &response.headers {
        builder = builder.header(name, value);
    }

    let body = match response.body {
        EngineBody::Bytes(bytes) => {
            let _ = cancel;
            Body::from(bytes)
        }
        EngineBody::Stream(stream) => {
            // Dropping the response body (client disconnect) cancels the
            // in-flight attempt.
            let guard = cancel.drop_guard();
            let stream = stream.map(move |item| {
                let _hold = &guard;
                item.map_err(|err| std::io::Error::other(err.to_string()))
            });
            Body::from_stream(stream)
        }
    };

    builder
        .body(body)
        .unwrap_or_else(|_| Response::new(Body::from("internal error")))
}

fn error_response(status: StatusCode, message: &str) -> Response {
    let body = serde_json::json!({
        "type": "error",
        "error": {"type": "invalid_request_error", "message": message}
    });
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap_or_else(|_| Response::new(Body::from("internal error")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gemini_model_action_split() {
        assert_eq!(
            "gemini-2.5-flash:generateContent".split_once(':'),
            Some(("gemini-2.5-flash", "generateContent"))
        );
    }

    #[test]
    fn bearer_token_extraction_per_dialect() {
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", "claude-key".parse().unwrap());
        headers.insert("authorization", "Bearer openai-key".parse().unwrap());
        headers.insert("x-goog-api-key", "gemini-key".parse().unwrap());

        assert_eq!(
            bearer_token(&headers, Dialect::Claude).as_deref(),
            Some("claude-key")
        );
        assert_eq!(
            bearer_token(&headers, Dialect::OpenAI).as_deref(),
            Some("openai-key")
        );
        assert_eq!(
            bearer_token(&headers, Dialect::Gemini).as_deref(),
            Some("gemini-key")
        );
    }

    #[test]
    fn claude_session_comes_from_metadata_user_id() {
        let body = serde_json::json!({"metadata": {"user_id": "session-abc"}});
        let session = session_from_request(Dialect::Claude, &body, &HeaderMap::new());
        assert_eq!(session.as_deref(), Some("session-abc"));
    }
}
