//! LLM 客户端抽象
//!
//! 生成内容、给出互动判定、分析实时记录都通过 LlmClient::complete 完成；
//! 核心逻辑把它当作不可信的外部服务，输出一律经严格解析。

use async_trait::async_trait;

use super::Message;
use crate::core::Result;

/// LLM 客户端 trait：非流式完成
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, messages: &[Message]) -> Result<String>;

    /// 获取累计 token 使用统计：(prompt_tokens, completion_tokens, total_tokens)
    /// 默认返回 (0, 0, 0)，具体实现可覆盖
    fn token_usage(&self) -> (u64, u64, u64) {
        (0, 0, 0)
    }
}
