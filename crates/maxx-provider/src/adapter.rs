use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;

use maxx_common::Dialect;

use crate::error::{UpstreamError, UpstreamResult};

/// Immutable execution context for one upstream attempt.
#[derive(Debug, Clone)]
pub struct AttemptCtx {
    pub request_id: String,
    pub attempt_no: u32,
    pub dialect: Dialect,
    /// Model after route mapping; adapters may remap further (haiku target).
    pub mapped_model: String,
    pub stream: bool,
    pub session_id: Option<String>,
    pub cancel: CancellationToken,
    pub outbound_proxy: Option<String>,
}

/// The client call as received, before any upstream shaping.
#[derive(Debug, Clone)]
pub struct ClientRequest {
    pub path: String,
    pub query: Option<String>,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

pub enum AdapterBody {
    Bytes(Bytes),
    Stream(BoxStream<'static, UpstreamResult<Bytes>>),
}

pub struct AdapterResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: AdapterBody,
    /// Upstream-shaped request body, captured for the attempt record.
    pub upstream_request: Option<Vec<u8>>,
}

/// One upstream execution strategy (custom HTTP endpoint or antigravity).
///
/// Adapters only classify failures; cooldown application stays in the
/// engine so one policy governs every provider.
#[async_trait]
pub trait UpstreamAdapter: Send + Sync {
    fn provider_id(&self) -> i64;

    async fn execute(
        &self,
        ctx: &AttemptCtx,
        request: &ClientRequest,
    ) -> Result<AdapterResponse, UpstreamError>;

    /// Whether this adapter can resolve quota resets after the fact.
    fn can_resolve_quota_reset(&self) -> bool {
        false
    }

    /// Deferred quota-reset resolution after a quota failure without an
    /// explicit reset timestamp. Bounded by the adapter's own timeout.
    async fn resolve_quota_reset(&self, _ctx: &AttemptCtx) -> Option<OffsetDateTime> {
        None
    }
}
