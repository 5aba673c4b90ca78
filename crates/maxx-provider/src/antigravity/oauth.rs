use std::collections::HashMap;
use std::sync::Arc;

use serde::Deserialize;
use time::OffsetDateTime;
use tokio::sync::{Mutex, RwLock};

use crate::config::AntigravityConfig;
use crate::error::{UpstreamError, UpstreamResult};

pub const TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const CLIENT_ID: &str =
    "1071006060591-tmhssin2h21lcre235vtolojh4g403ep.apps.googleusercontent.com";
const CLIENT_SECRET: &str = "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";
/// Refresh this long before the reported expiry.
const EXPIRY_SAFETY_SECS: i64 = 60;

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
}

#[derive(Debug, Clone)]
struct CachedToken {
    access_token: String,
    expires_at: OffsetDateTime,
}

impl CachedToken {
    fn is_fresh(&self) -> bool {
        self.expires_at > OffsetDateTime::now_utc()
    }
}

/// One access token per provider, refreshed via the refresh-token grant.
///
/// Reads are lock-free after warm-up; a per-provider mutex makes concurrent
/// callers share one in-flight refresh.
pub struct TokenCache {
    tokens: RwLock<HashMap<i64, CachedToken>>,
    refresh_locks: Mutex<HashMap<i64, Arc<Mutex<()>>>>,
}

impl Default for TokenCache {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenCache {
    pub fn new() -> Self {
        Self {
            tokens: RwLock::new(HashMap::new()),
            refresh_locks: Mutex::new(HashMap::new()),
        }
    }

    pub async fn access_token(
        &self,
        provider_id: i64,
        config: &AntigravityConfig,
        client: &wreq::Client,
    ) -> UpstreamResult<String> {
        if let Some(token) = self.tokens.read().await.get(&provider_id)
            && token.is_fresh()
        {
            return Ok(token.access_token.clone());
        }

        let refresh_lock = {
            let mut locks = self.refresh_locks.lock().await;
            locks
                .entry(provider_id)
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let _guard = refresh_lock.lock().await;

        // Another caller may have finished the refresh while we waited.
        if let Some(token) = self.tokens.read().await.get(&provider_id)
            && token.is_fresh()
        {
            return Ok(token.access_token.clone());
        }

        let token = refresh_access_token(config, client).await?;
        let access = token.access_token.clone();
        self.tokens.write().await.insert(provider_id, token);
        Ok(access)
    }

    /// Drop the cached token after an upstream 401.
    pub async fn invalidate(&self, provider_id: i64) {
        self.tokens.write().await.remove(&provider_id);
    }
}

async fn refresh_access_token(
    config: &AntigravityConfig,
    client: &wreq::Client,
) -> UpstreamResult<CachedToken> {
    tracing::debug!("refreshing antigravity access token");
    let form = format!(
        "grant_type=refresh_token&refresh_token={}&client_id={}&client_secret={}",
        urlencoding::encode(&config.refresh_token),
        urlencoding::encode(CLIENT_ID),
        urlencoding::encode(CLIENT_SECRET),
    );

    let response = client
        .post(TOKEN_URL)
        .header("content-type", "application/x-www-form-urlencoded")
        .body(form)
        .send()
        .await
        .map_err(|err| UpstreamError::network(format!("token refresh failed: {err}")))?;

    let status = response.status().as_u16();
    let body = response
        .bytes()
        .await
        .map_err(|err| UpstreamError::network(err.to_string()))?;
    if !(200..300).contains(&status) {
        return Err(UpstreamError::auth(
            status,
            format!(
                "token refresh rejected: {}",
                String::from_utf8_lossy(&body).chars().take(256).collect::<String>()
            ),
        ));
    }

    let token: TokenResponse = serde_json::from_slice(&body)
        .map_err(|err| UpstreamError::protocol(format!("invalid token response: {err}")))?;
    let expires_in = token.expires_in.unwrap_or(3600);
    Ok(CachedToken {
        access_token: token.access_token,
        expires_at: OffsetDateTime::now_utc()
            + time::Duration::seconds((expires_in - EXPIRY_SAFETY_SECS).max(0)),
    })
}
