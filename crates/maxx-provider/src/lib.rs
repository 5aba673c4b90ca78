pub mod adapter;
pub mod antigravity;
pub mod config;
pub mod custom;
pub mod error;
pub mod http_client;

pub use adapter::{AdapterBody, AdapterResponse, AttemptCtx, ClientRequest, UpstreamAdapter};
pub use antigravity::{AntigravityAdapter, TokenCache};
pub use config::{AntigravityConfig, CustomConfig, ProviderConfig};
pub use custom::CustomAdapter;
pub use error::{ErrorKind, RateLimitInfo, UpstreamError, UpstreamResult};
