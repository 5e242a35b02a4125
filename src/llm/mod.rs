pub mod client;
pub mod types;

pub use client::{CompletionClient, StaticCompletionClient};
pub use types::{CompletionRequest, CompletionResponse, Message, MessageRole, TokenUsage};
