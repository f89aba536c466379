//! Concrete provider strategies, one per caching archetype in spec §4.3.

pub mod anthropic;
pub mod byteplus;
pub mod gemini;
pub mod openai;

pub use anthropic::AnthropicProvider;
pub use byteplus::BytePlusProvider;
pub use gemini::GeminiProvider;
pub use openai::OpenAiProvider;
