//! 脚本化 LLM 客户端（用于测试与干跑，无需 API）
//!
//! 按「prompt 包含某关键字 → 固定回复」的规则作答；无匹配时依次弹出排队回复，都没有则回复默认值。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::core::{BuzzError, Result};
use crate::llm::{LlmClient, Message};

/// 脚本化客户端：记录调用次数与收到的最后一条 prompt
pub struct ScriptedLlmClient {
    rules: Vec<(String, String)>,
    queued: Mutex<VecDeque<Result<String>>>,
    fallback: String,
    calls: AtomicUsize,
    last_prompt: Mutex<Option<String>>,
}

impl ScriptedLlmClient {
    pub fn new(fallback: impl Into<String>) -> Self {
        Self {
            rules: Vec::new(),
            queued: Mutex::new(VecDeque::new()),
            fallback: fallback.into(),
            calls: AtomicUsize::new(0),
            last_prompt: Mutex::new(None),
        }
    }

    /// prompt 中出现 needle 时回复 reply（按添加顺序匹配）
    pub fn on(mut self, needle: impl Into<String>, reply: impl Into<String>) -> Self {
        self.rules.push((needle.into(), reply.into()));
        self
    }

    pub fn push_reply(&self, reply: impl Into<String>) {
        self.lock_queue().push_back(Ok(reply.into()));
    }

    pub fn push_error(&self, message: impl Into<String>) {
        self.lock_queue().push_back(Err(BuzzError::Llm(message.into())));
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_prompt(&self) -> Option<String> {
        self.last_prompt
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn lock_queue(&self) -> std::sync::MutexGuard<'_, VecDeque<Result<String>>> {
        self.queued.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for ScriptedLlmClient {
    fn default() -> Self {
        Self::new("IGNORE")
    }
}

#[async_trait]
impl LlmClient for ScriptedLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let prompt = messages
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        *self.last_prompt.lock().unwrap_or_else(|e| e.into_inner()) = Some(prompt.clone());

        if let Some((_, reply)) = self.rules.iter().find(|(needle, _)| prompt.contains(needle)) {
            return Ok(reply.clone());
        }
        if let Some(next) = self.lock_queue().pop_front() {
            return next;
        }
        Ok(self.fallback.clone())
    }
}
