pub mod models;
pub mod provider;
pub mod traits;

// Re-export public APIs
pub use models::ProviderConfig;
pub use provider::OpenAIProvider;
pub use traits::{ChatMessage, ChatResponder};
