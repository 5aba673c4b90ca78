use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};

use crate::error::{UpstreamError, UpstreamResult};

static CLIENT_CACHE: OnceLock<Mutex<HashMap<Option<String>, wreq::Client>>> = OnceLock::new();

/// Shared upstream HTTP client, keyed by outbound proxy.
pub fn client_for_proxy(proxy: Option<&str>) -> UpstreamResult<wreq::Client> {
    let key = normalize_proxy(proxy);

    let cache = CLIENT_CACHE.get_or_init(|| Mutex::new(HashMap::new()));
    let mut guard = cache
        .lock()
        .map_err(|_| UpstreamError::protocol("http client cache lock failed"))?;

    if let Some(client) = guard.get(&key) {
        return Ok(client.clone());
    }

    let client = build_client(key.as_deref())?;
    guard.insert(key, client.clone());
    Ok(client)
}

fn build_client(proxy: Option<&str>) -> UpstreamResult<wreq::Client> {
    let mut builder = wreq::Client::builder();
    if let Some(proxy_url) = proxy {
        builder = builder.proxy(
            wreq::Proxy::all(proxy_url)
                .map_err(|err| UpstreamError::protocol(err.to_string()))?,
        );
    }
    builder
        .build()
        .map_err(|err| UpstreamError::protocol(err.to_string()))
}

fn normalize_proxy(value: Option<&str>) -> Option<String> {
    value
        .map(|item| item.trim().to_string())
        .filter(|item| !item.is_empty())
}
