//! LLM 层：客户端抽象与实现（OpenAI 兼容 / Mock）

pub mod message;
pub mod mock;
pub mod openai;
pub mod traits;

use std::sync::Arc;
use std::time::Duration;

use crate::config::LlmSection;

pub use message::{Message, Role};
pub use mock::MockLlmClient;
pub use openai::{OpenAiClient, TokenUsage};
pub use traits::LlmClient;

/// 按 [llm] 段创建客户端：provider = openai 走 OpenAI 兼容端点，其余一律 mock
pub fn create_llm_from_config(section: &LlmSection) -> Arc<dyn LlmClient> {
    match section.provider.as_str() {
        "openai" => {
            let api_key = std::env::var("OPENAI_API_KEY").ok();
            tracing::info!(model = %section.model, "Using OpenAI-compatible LLM");
            Arc::new(OpenAiClient::new(
                section.base_url.as_deref(),
                &section.model,
                api_key.as_deref(),
                Duration::from_secs(section.request_timeout_secs),
            ))
        }
        other => {
            if other != "mock" {
                tracing::warn!(provider = %other, "Unknown LLM provider, falling back to mock");
            }
            Arc::new(MockLlmClient::new())
        }
    }
}
