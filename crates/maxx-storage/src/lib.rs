pub mod entities;
pub mod memory;
pub mod rows;
pub mod seaorm;
pub mod storage;

pub use memory::MemoryStorage;
pub use rows::{
    AntigravityQuotaRow, ApiTokenRow, CooldownRow, FailureCountRow, MappingScope, ModelMappingRow,
    ProjectRow, ProviderRow, ProxyAttemptRow, ProxyRequestRow, RetryConfigRow, RouteRow,
    SessionRow, StorageSnapshot,
};
pub use seaorm::SeaOrmStorage;
pub use storage::{Storage, StorageError, StorageResult};
