//! LLM 层：客户端抽象与实现（OpenAI 兼容 / 脚本化 Mock）

pub mod message;
pub mod mock;
pub mod openai;
pub mod traits;

use std::sync::Arc;
use std::time::Duration;

pub use message::{Message, Role};
pub use mock::ScriptedLlmClient;
pub use openai::{OpenAiClient, TokenUsage};
pub use traits::LlmClient;

use crate::config::LlmSection;

/// 按 [llm] 配置创建客户端：provider = mock 时使用脚本化客户端（全部回复 IGNORE）
pub fn create_llm_from_config(section: &LlmSection) -> Arc<dyn LlmClient> {
    match section.provider.as_str() {
        "mock" => {
            tracing::warn!("Using scripted mock LLM, every verdict will be IGNORE");
            Arc::new(ScriptedLlmClient::default())
        }
        _ => Arc::new(
            OpenAiClient::new(
                section.base_url.as_deref(),
                &section.model,
                section.api_key.as_deref(),
            )
            .with_timeout(Duration::from_secs(section.request_timeout_secs)),
        ),
    }
}
