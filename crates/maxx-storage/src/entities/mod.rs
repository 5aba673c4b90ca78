pub mod antigravity_quotas;
pub mod api_tokens;
pub mod cooldowns;
pub mod failure_counts;
pub mod model_mappings;
pub mod projects;
pub mod providers;
pub mod proxy_attempts;
pub mod proxy_requests;
pub mod retry_configs;
pub mod routes;
pub mod sessions;
pub mod settings;

pub use antigravity_quotas::Entity as AntigravityQuotas;
pub use api_tokens::Entity as ApiTokens;
pub use cooldowns::Entity as Cooldowns;
pub use failure_counts::Entity as FailureCounts;
pub use model_mappings::Entity as ModelMappings;
pub use projects::Entity as Projects;
pub use providers::Entity as Providers;
pub use proxy_attempts::Entity as ProxyAttempts;
pub use proxy_requests::Entity as ProxyRequests;
pub use retry_configs::Entity as RetryConfigs;
pub use routes::Entity as Routes;
pub use sessions::Entity as Sessions;
pub use settings::Entity as Settings;
