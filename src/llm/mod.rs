pub mod anthropic_provider;
pub mod gemini_provider;
pub mod openai_provider;
pub mod provider;
pub mod types;

pub use anthropic_provider::AnthropicProvider;
pub use gemini_provider::GeminiProvider;
pub use openai_provider::OpenAIProvider;
pub use provider::{LLMProvider, LLMProviderFactory};
pub use types::*;
