//! 变更记录的下游处理

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use super::protocol::ChangeRecord;
use crate::core::{BuzzError, Result};
use crate::llm::{LlmClient, Message};
use crate::memory::MemoryStore;

/// 每个 key 同时至多一个 handle 在执行；返回错误只会被记录为事件
#[async_trait]
pub trait RecordHandler: Send + Sync {
    async fn handle(&self, change: &ChangeRecord) -> Result<()>;
}

pub const ANALYSIS_TEMPLATE: &str = "\
A record in table {table} finished processing. Analyse it and reply with a single JSON object \
containing at least \"summary\" (string), \"topics\" (array of strings) and \"sentiment\" \
(\"positive\", \"neutral\" or \"negative\").

Record:
{record}";

/// 调用 LLM 生成 JSON 分析并写入记忆存储
///
/// 已有分析结果的 key 不会重复分析。
pub struct AnalysisHandler {
    llm: Arc<dyn LlmClient>,
    store: Arc<dyn MemoryStore>,
}

impl AnalysisHandler {
    pub fn new(llm: Arc<dyn LlmClient>, store: Arc<dyn MemoryStore>) -> Self {
        Self { llm, store }
    }

    fn prompt(change: &ChangeRecord) -> String {
        let record = serde_json::to_string_pretty(&change.record).unwrap_or_default();
        ANALYSIS_TEMPLATE
            .replace("{table}", &change.table)
            .replace("{record}", &record)
    }
}

#[async_trait]
impl RecordHandler for AnalysisHandler {
    async fn handle(&self, change: &ChangeRecord) -> Result<()> {
        let key = change.key();
        if self.store.get_analysis(&key).await?.is_some() {
            tracing::debug!(%key, "Record already analysed, skipping");
            return Ok(());
        }

        let reply = self
            .llm
            .complete(&[Message::user(Self::prompt(change))])
            .await?;
        let analysis = parse_analysis(&reply)?;
        self.store.save_analysis(&key, &analysis).await?;
        tracing::info!(%key, "Record analysis saved");
        Ok(())
    }
}

/// 从 LLM 输出中提取 JSON 对象（允许 ```json 包裹或前后夹杂文字）
pub fn parse_analysis(output: &str) -> Result<Value> {
    let trimmed = output.trim();
    let json_str = if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        rest.find("```").map(|end| rest[..end].trim()).unwrap_or(rest.trim())
    } else if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}')) {
        if start < end {
            &trimmed[start..=end]
        } else {
            trimmed
        }
    } else {
        trimmed
    };

    let value: Value = serde_json::from_str(json_str)
        .map_err(|e| BuzzError::MalformedResponse(format!("analysis is not JSON: {e}")))?;
    if !value.is_object() {
        return Err(BuzzError::MalformedResponse(
            "analysis is not a JSON object".into(),
        ));
    }
    Ok(value)
}
