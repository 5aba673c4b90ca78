use std::fmt;
use std::time::Duration;

use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use maxx_common::{CooldownReason, Dialect};

pub type UpstreamResult<T> = Result<T, UpstreamError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Network,
    Server,
    RateLimit,
    QuotaExhausted,
    ConcurrentLimit,
    Protocol,
    Auth,
    Cancelled,
    Unsupported,
}

/// Rate-limit details attached to a 429 classification.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitInfo {
    pub kind: Option<String>,
    pub quota_reset_time: Option<OffsetDateTime>,
    pub dialect: Dialect,
}

/// Classified upstream failure carried through the engine's retry loop.
#[derive(Debug, Clone)]
pub struct UpstreamError {
    pub kind: ErrorKind,
    pub message: String,
    pub status: Option<u16>,
    pub retryable: bool,
    pub retry_after: Option<Duration>,
    pub rate_limit: Option<RateLimitInfo>,
    pub cooldown_until: Option<OffsetDateTime>,
}

impl fmt::Display for UpstreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(status) => write!(f, "{} ({status}): {}", kind_label(self.kind), self.message),
            None => write!(f, "{}: {}", kind_label(self.kind), self.message),
        }
    }
}

impl std::error::Error for UpstreamError {}

fn kind_label(kind: ErrorKind) -> &'static str {
    match kind {
        ErrorKind::Network => "network error",
        ErrorKind::Server => "upstream server error",
        ErrorKind::RateLimit => "rate limited",
        ErrorKind::QuotaExhausted => "quota exhausted",
        ErrorKind::ConcurrentLimit => "concurrency limited",
        ErrorKind::Protocol => "protocol error",
        ErrorKind::Auth => "authentication failed",
        ErrorKind::Cancelled => "cancelled",
        ErrorKind::Unsupported => "unsupported",
    }
}

impl UpstreamError {
    pub fn network(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Network,
            message: message.into(),
            status: None,
            retryable: true,
            retry_after: None,
            rate_limit: None,
            cooldown_until: None,
        }
    }

    pub fn server(status: u16, message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Server,
            message: message.into(),
            status: Some(status),
            retryable: true,
            retry_after: None,
            rate_limit: None,
            cooldown_until: None,
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Protocol,
            message: message.into(),
            status: None,
            retryable: false,
            retry_after: None,
            rate_limit: None,
            cooldown_until: None,
        }
    }

    pub fn auth(status: u16, message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Auth,
            message: message.into(),
            status: Some(status),
            retryable: false,
            retry_after: None,
            rate_limit: None,
            cooldown_until: None,
        }
    }

    pub fn cancelled() -> Self {
        Self {
            kind: ErrorKind::Cancelled,
            message: "request cancelled".to_string(),
            status: None,
            retryable: false,
            retry_after: None,
            rate_limit: None,
            cooldown_until: None,
        }
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Unsupported,
            message: message.into(),
            status: None,
            retryable: false,
            retry_after: None,
            rate_limit: None,
            cooldown_until: None,
        }
    }

    /// The cooldown bucket this failure feeds, if any.
    pub fn cooldown_reason(&self) -> Option<CooldownReason> {
        match self.kind {
            ErrorKind::Network => Some(CooldownReason::NetworkError),
            ErrorKind::Server => Some(CooldownReason::ServerError),
            ErrorKind::RateLimit => Some(CooldownReason::RateLimit),
            ErrorKind::QuotaExhausted => Some(CooldownReason::QuotaExhausted),
            ErrorKind::ConcurrentLimit => Some(CooldownReason::ConcurrentLimit),
            ErrorKind::Protocol | ErrorKind::Auth | ErrorKind::Cancelled
            | ErrorKind::Unsupported => None,
        }
    }
}

/// Classify a non-success upstream HTTP response.
pub fn classify_http(
    status: u16,
    headers: &[(String, String)],
    body: &[u8],
    dialect: Dialect,
) -> UpstreamError {
    let text = String::from_utf8_lossy(body);
    let snippet: String = text.chars().take(512).collect();

    if status == 401 {
        return UpstreamError::auth(status, snippet);
    }
    if status == 429 {
        return classify_429(headers, &text, dialect);
    }
    if status >= 500 {
        return UpstreamError::server(status, snippet);
    }

    UpstreamError {
        kind: ErrorKind::Protocol,
        message: snippet,
        status: Some(status),
        retryable: false,
        retry_after: None,
        rate_limit: None,
        cooldown_until: None,
    }
}

fn classify_429(headers: &[(String, String)], body: &str, dialect: Dialect) -> UpstreamError {
    let retry_after = header_value(headers, "retry-after").and_then(parse_retry_after);
    let parsed: Option<serde_json::Value> = serde_json::from_str(body).ok();

    let error_type = parsed
        .as_ref()
        .and_then(|v| v.get("error"))
        .and_then(|e| e.get("type"))
        .and_then(|t| t.as_str())
        .map(str::to_string);
    let error_status = parsed
        .as_ref()
        .and_then(|v| v.get("error"))
        .and_then(|e| e.get("status"))
        .and_then(|s| s.as_str())
        .unwrap_or_default()
        .to_string();

    let lowered = body.to_ascii_lowercase();
    let quota_reset = parse_quota_reset_details(parsed.as_ref());
    let is_quota = quota_reset.is_some()
        || error_status == "RESOURCE_EXHAUSTED"
        || error_type.as_deref() == Some("insufficient_quota")
        || lowered.contains("quota");
    let is_concurrent = lowered.contains("concurrent");

    let retry_after = retry_after.or_else(|| parse_retry_phrase(&lowered));
    let now = OffsetDateTime::now_utc();
    let reset_time = quota_reset
        .or_else(|| retry_after.map(|delay| now + delay));

    let kind = if is_quota {
        ErrorKind::QuotaExhausted
    } else if is_concurrent {
        ErrorKind::ConcurrentLimit
    } else {
        ErrorKind::RateLimit
    };

    UpstreamError {
        kind,
        message: body.chars().take(512).collect(),
        status: Some(429),
        retryable: true,
        retry_after,
        rate_limit: Some(RateLimitInfo {
            kind: error_type,
            quota_reset_time: reset_time,
            dialect,
        }),
        cooldown_until: quota_reset,
    }
}

/// `Retry-After` header value: delta-seconds or an HTTP-date.
pub fn parse_retry_after(value: String) -> Option<Duration> {
    let value = value.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }
    let when = httpdate::parse_http_date(value).ok()?;
    when.duration_since(std::time::SystemTime::now()).ok()
}

/// Human-readable "in N seconds/minutes/hours" phrasing.
pub fn parse_retry_phrase(lowered: &str) -> Option<Duration> {
    let idx = lowered.find("in ")?;
    let rest = &lowered[idx + 3..];
    let mut words = rest.split_whitespace();
    let amount: u64 = words.next()?.trim_matches(|c: char| !c.is_ascii_digit()).parse().ok()?;
    let unit = words.next()?;
    let seconds = if unit.starts_with("second") {
        amount
    } else if unit.starts_with("minute") {
        amount * 60
    } else if unit.starts_with("hour") {
        amount * 3600
    } else {
        return None;
    };
    Some(Duration::from_secs(seconds))
}

/// `error.details[]` entry with reason QUOTA_EXHAUSTED and an RFC 3339
/// `quotaResetTimeStamp`.
pub fn parse_quota_reset_details(payload: Option<&serde_json::Value>) -> Option<OffsetDateTime> {
    let details = payload?
        .get("error")?
        .get("details")?
        .as_array()?;
    for detail in details {
        let reason = detail.get("reason").and_then(|r| r.as_str());
        if reason != Some("QUOTA_EXHAUSTED") {
            continue;
        }
        let stamp = detail
            .get("metadata")
            .and_then(|m| m.get("quotaResetTimeStamp"))
            .or_else(|| detail.get("quotaResetTimeStamp"))
            .and_then(|v| v.as_str())?;
        if let Ok(when) = OffsetDateTime::parse(stamp, &Rfc3339) {
            return Some(when);
        }
    }
    None
}

/// SSE `error` events that still warrant another attempt on a fresh route.
pub fn stream_error_is_retryable(kind: Option<&str>, message: Option<&str>) -> bool {
    if matches!(kind, Some("server_error") | Some("overloaded_error")) {
        return true;
    }
    let Some(message) = message else {
        return false;
    };
    let lowered = message.to_ascii_lowercase();
    ["upstream", "timeout", "overloaded", "temporarily", "rate limit"]
        .iter()
        .any(|needle| lowered.contains(needle))
}

pub fn header_value(headers: &[(String, String)], name: &str) -> Option<String> {
    headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn status_5xx_is_retryable_server_error() {
        let err = classify_http(503, &[], b"overloaded", Dialect::Claude);
        assert_eq!(err.kind, ErrorKind::Server);
        assert!(err.retryable);
        assert_eq!(err.cooldown_reason(), Some(CooldownReason::ServerError));
    }

    #[test]
    fn status_400_is_terminal_protocol_error() {
        let err = classify_http(400, &[], b"bad request", Dialect::Claude);
        assert_eq!(err.kind, ErrorKind::Protocol);
        assert!(!err.retryable);
        assert_eq!(err.cooldown_reason(), None);
    }

    #[test]
    fn retry_after_seconds_parsed() {
        let headers = vec![("Retry-After".to_string(), "30".to_string())];
        let err = classify_http(429, &headers, b"{}", Dialect::OpenAI);
        assert_eq!(err.kind, ErrorKind::RateLimit);
        assert_eq!(err.retry_after, Some(Duration::from_secs(30)));
    }

    #[test]
    fn rate_limit_error_type_detected() {
        let body = json!({"error": {"type": "rate_limit_error", "message": "slow down"}});
        let err = classify_http(429, &[], body.to_string().as_bytes(), Dialect::Claude);
        assert_eq!(err.kind, ErrorKind::RateLimit);
        assert_eq!(
            err.rate_limit.as_ref().unwrap().kind.as_deref(),
            Some("rate_limit_error")
        );
    }

    #[test]
    fn insufficient_quota_maps_to_quota_exhausted() {
        let body = json!({"error": {"type": "insufficient_quota", "message": "no more"}});
        let err = classify_http(429, &[], body.to_string().as_bytes(), Dialect::OpenAI);
        assert_eq!(err.kind, ErrorKind::QuotaExhausted);
    }

    #[test]
    fn quota_reset_timestamp_drives_cooldown_until() {
        let body = json!({
            "error": {
                "status": "RESOURCE_EXHAUSTED",
                "details": [{
                    "reason": "QUOTA_EXHAUSTED",
                    "metadata": {"quotaResetTimeStamp": "2025-01-01T12:00:00Z"}
                }]
            }
        });
        let err = classify_http(429, &[], body.to_string().as_bytes(), Dialect::Claude);
        assert_eq!(err.kind, ErrorKind::QuotaExhausted);
        let until = err.cooldown_until.unwrap();
        assert_eq!(until.year(), 2025);
        assert_eq!(until.hour(), 12);
    }

    #[test]
    fn retry_phrase_parsed_from_message() {
        let body = r#"{"error": {"message": "Please retry in 2 minutes."}}"#;
        let err = classify_http(429, &[], body.as_bytes(), Dialect::Gemini);
        assert_eq!(err.retry_after, Some(Duration::from_secs(120)));
    }

    #[test]
    fn stream_error_classification() {
        assert!(stream_error_is_retryable(Some("server_error"), None));
        assert!(stream_error_is_retryable(None, Some("Upstream connection reset")));
        assert!(stream_error_is_retryable(None, Some("model overloaded, temporarily unavailable")));
        assert!(!stream_error_is_retryable(Some("invalid_request_error"), Some("bad tool schema")));
    }
}
