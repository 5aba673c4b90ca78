pub mod request;
pub mod response;
pub mod sanitize;
pub mod schema;
pub mod stream;

pub use request::{ConvertOptions, ConvertedRequest, transform_request};
pub use response::transform_response;
pub use stream::GeminiToClaudeStream;

/// The only model the v1internal endpoint accepts googleSearch with.
pub const WEB_SEARCH_MODEL: &str = "gemini-2.5-flash";
