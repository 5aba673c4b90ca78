pub mod binding;
pub mod cooldown;
pub mod engine;
pub mod events;
pub mod pricing;
pub mod router;
pub mod state;
pub mod usage;

pub use binding::{BindingHub, BindingOutcome};
pub use cooldown::{CooldownController, CooldownPolicy};
pub use engine::{
    AdapterFactory, DefaultAdapterFactory, EngineBody, EngineResponse, ProxyEngine,
    ProxyRequestSpec,
};
pub use events::{Event, EventHub, EventSink};
pub use pricing::{PriceCalculator, StaticPriceTable};
pub use state::AppState;
