use std::time::Duration;

use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

/// How long the deferred quota-API lookup may run.
pub const QUOTA_LOOKUP_TIMEOUT: Duration = Duration::from_secs(10);

/// Earliest reset among models whose remaining quota is zero.
///
/// The quota payload comes from `v1internal:fetchAvailableModels`, which
/// reports per-model `quotaInfo { remainingFraction, resetTime }`.
pub fn earliest_exhausted_reset(payload: &serde_json::Value) -> Option<OffsetDateTime> {
    let mut earliest: Option<OffsetDateTime> = None;

    let mut visit = |meta: &serde_json::Value| {
        let Some(quota) = meta.get("quotaInfo") else {
            return;
        };
        let remaining = quota
            .get("remainingFraction")
            .and_then(|v| v.as_f64())
            .unwrap_or(1.0);
        if remaining > 0.0 {
            return;
        }
        let Some(reset) = quota
            .get("resetTime")
            .and_then(|v| v.as_str())
            .and_then(|s| OffsetDateTime::parse(s, &Rfc3339).ok())
        else {
            return;
        };
        earliest = Some(match earliest {
            Some(current) if current <= reset => current,
            _ => reset,
        });
    };

    match payload.get("models") {
        Some(serde_json::Value::Object(models)) => {
            for meta in models.values() {
                visit(meta);
            }
        }
        Some(serde_json::Value::Array(models)) => {
            for meta in models {
                visit(meta);
            }
        }
        _ => {}
    }

    earliest
}

pub async fn lookup_quota_reset(
    client: &wreq::Client,
    base_url: &str,
    access_token: &str,
    user_agent: &str,
) -> Option<OffsetDateTime> {
    let url = format!(
        "{}/v1internal:fetchAvailableModels",
        base_url.trim_end_matches('/')
    );
    let request = client
        .post(url)
        .header("authorization", format!("Bearer {access_token}"))
        .header("user-agent", user_agent)
        .header("content-type", "application/json")
        .body("{}")
        .send();

    let response = tokio::time::timeout(QUOTA_LOOKUP_TIMEOUT, request)
        .await
        .ok()?
        .ok()?;
    if !response.status().is_success() {
        return None;
    }
    let body = tokio::time::timeout(QUOTA_LOOKUP_TIMEOUT, response.bytes())
        .await
        .ok()?
        .ok()?;
    let payload: serde_json::Value = serde_json::from_slice(&body).ok()?;
    earliest_exhausted_reset(&payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn exhausted_model_with_reset_found() {
        let payload = json!({
            "models": {
                "gemini-3-pro": {
                    "quotaInfo": {"remainingFraction": 0.0, "resetTime": "2025-06-01T08:00:00Z"}
                },
                "gemini-2.5-flash": {
                    "quotaInfo": {"remainingFraction": 0.4, "resetTime": "2025-06-01T02:00:00Z"}
                }
            }
        });
        let reset = earliest_exhausted_reset(&payload).unwrap();
        assert_eq!(reset.hour(), 8);
    }

    #[test]
    fn earliest_of_multiple_exhausted_models_wins() {
        let payload = json!({
            "models": {
                "a": {"quotaInfo": {"remainingFraction": 0.0, "resetTime": "2025-06-01T09:00:00Z"}},
                "b": {"quotaInfo": {"remainingFraction": 0.0, "resetTime": "2025-06-01T07:00:00Z"}}
            }
        });
        let reset = earliest_exhausted_reset(&payload).unwrap();
        assert_eq!(reset.hour(), 7);
    }

    #[test]
    fn no_exhausted_models_yields_none() {
        let payload = json!({
            "models": {
                "a": {"quotaInfo": {"remainingFraction": 0.9, "resetTime": "2025-06-01T09:00:00Z"}}
            }
        });
        assert!(earliest_exhausted_reset(&payload).is_none());
    }

    #[test]
    fn unparseable_reset_times_skipped() {
        let payload = json!({
            "models": {
                "a": {"quotaInfo": {"remainingFraction": 0.0, "resetTime": "soon"}}
            }
        });
        assert!(earliest_exhausted_reset(&payload).is_none());
    }
}
