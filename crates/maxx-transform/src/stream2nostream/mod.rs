pub mod claude;

pub use claude::ClaudeStreamCollector;
