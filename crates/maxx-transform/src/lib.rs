pub mod claude2gemini;
pub mod signature;
pub mod stream2nostream;

pub use signature::{MIN_SIGNATURE_LEN, SignatureCache, is_valid_signature};

#[cfg(test)]
mod tests;
