use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;

use maxx_common::{GatewayConfig, settings};
use maxx_provider::TokenCache;
use maxx_storage::{ProviderRow, Storage, StorageSnapshot};
use maxx_transform::SignatureCache;

use crate::binding::BindingHub;
use crate::cooldown::{CooldownController, CooldownPolicy};
use crate::events::EventHub;
use crate::pricing::PriceCalculator;

const SIGNATURE_CACHE_SESSIONS: usize = 1024;
const DEFAULT_PROJECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Process-wide shared state.
///
/// Route/mapping/settings reads go through the `ArcSwap` snapshot; admin
/// writes reload it atomically.
pub struct AppState {
    pub config: GatewayConfig,
    pub snapshot: ArcSwap<StorageSnapshot>,
    pub storage: Arc<dyn Storage>,
    pub events: EventHub,
    pub cooldowns: Arc<CooldownController>,
    pub signatures: Arc<SignatureCache>,
    pub tokens: Arc<TokenCache>,
    pub pricing: Arc<dyn PriceCalculator>,
    pub binding: BindingHub,
}

impl AppState {
    pub async fn bootstrap(
        config: GatewayConfig,
        storage: Arc<dyn Storage>,
        pricing: Arc<dyn PriceCalculator>,
    ) -> anyhow::Result<Arc<Self>> {
        storage.sync().await?;
        let snapshot = storage.load_snapshot().await?;
        let events = EventHub::new(256);
        let policy = CooldownPolicy::from_settings(&snapshot);
        let cooldowns = Arc::new(CooldownController::new(
            storage.clone(),
            events.clone(),
            policy,
        ));
        cooldowns.load().await?;

        Ok(Arc::new(Self {
            config,
            snapshot: ArcSwap::from_pointee(snapshot),
            storage,
            events,
            cooldowns,
            signatures: Arc::new(SignatureCache::new(SIGNATURE_CACHE_SESSIONS)),
            tokens: Arc::new(TokenCache::new()),
            pricing,
            binding: BindingHub::new(),
        }))
    }

    /// Atomically refresh the read-mostly caches after an admin write.
    pub async fn reload_snapshot(&self) -> anyhow::Result<()> {
        let snapshot = self.storage.load_snapshot().await?;
        self.snapshot.store(Arc::new(snapshot));
        Ok(())
    }

    pub fn provider(&self, provider_id: i64) -> Option<ProviderRow> {
        self.snapshot
            .load()
            .providers
            .iter()
            .find(|p| p.id == provider_id)
            .cloned()
    }

    pub fn force_project_binding(&self) -> bool {
        self.snapshot
            .load()
            .setting(settings::FORCE_PROJECT_BINDING)
            .map(|value| value == "true")
            .unwrap_or(false)
    }

    pub fn force_project_timeout(&self) -> Duration {
        self.snapshot
            .load()
            .setting(settings::FORCE_PROJECT_TIMEOUT)
            .and_then(|value| value.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_PROJECT_TIMEOUT)
    }
}
