//! 回复决策流水线
//!
//! 先走确定性规则，再询问外部判定服务：
//! 1. 自己发的独立帖子（无 parent、线程只有一条）→ STOP，不调用判定服务
//! 2. 祖先中有自己发的帖子 → 强制 RESPOND；正文含停止词时改为询问判定服务
//! 3. 其余情况渲染线程上下文，交给判定服务，回复经严格解析映射为 RESPOND / IGNORE / STOP

use std::sync::Arc;

use regex::{Regex, RegexBuilder};

use super::prompt;
use super::verdict::{parse_actions, parse_verdict, ActionSet, EngagementVerdict, Verdict, VerdictReason};
use crate::core::{BuzzError, Result};
use crate::llm::{LlmClient, Message};
use crate::platform::{ConversationThread, Post};

/// 停止词匹配器：按单词边界、大小写不敏感
#[derive(Debug, Clone)]
pub struct StopKeywords {
    pattern: Option<Regex>,
}

impl StopKeywords {
    pub fn new<S: AsRef<str>>(keywords: &[S]) -> Result<Self> {
        let alternatives: Vec<String> = keywords
            .iter()
            .map(|k| k.as_ref().trim())
            .filter(|k| !k.is_empty())
            .map(regex::escape)
            .collect();
        if alternatives.is_empty() {
            return Ok(Self { pattern: None });
        }
        let pattern = RegexBuilder::new(&format!(r"\b(?:{})\b", alternatives.join("|")))
            .case_insensitive(true)
            .build()
            .map_err(|e| BuzzError::Config(format!("invalid stop keyword: {e}")))?;
        Ok(Self {
            pattern: Some(pattern),
        })
    }

    pub fn matches(&self, text: &str) -> bool {
        self.pattern.as_ref().is_some_and(|re| re.is_match(text))
    }
}

pub struct ResponseDecisionPipeline {
    llm: Arc<dyn LlmClient>,
    stop_keywords: StopKeywords,
}

impl ResponseDecisionPipeline {
    pub fn new(llm: Arc<dyn LlmClient>, stop_keywords: StopKeywords) -> Self {
        Self { llm, stop_keywords }
    }

    /// 给出对 post 的互动判定；仅在调用判定服务失败时返回错误
    pub async fn decide(
        &self,
        post: &Post,
        thread: &ConversationThread,
        owner_handle: &str,
    ) -> Result<EngagementVerdict> {
        if post.is_authored_by(owner_handle) && !post.is_reply() && thread.len() <= 1 {
            tracing::debug!(post_id = %post.id, "Own standalone post, not engaging");
            return Ok(EngagementVerdict::new(Verdict::Stop, VerdictReason::OwnStandalone));
        }

        let in_owned_thread = thread
            .ancestors()
            .iter()
            .any(|ancestor| ancestor.id != post.id && ancestor.is_authored_by(owner_handle));

        if in_owned_thread {
            if !self.stop_keywords.matches(&post.body_text) {
                tracing::debug!(post_id = %post.id, "Post is inside an owned thread, forcing RESPOND");
                return Ok(EngagementVerdict::new(Verdict::Respond, VerdictReason::OwnedThread));
            }
            tracing::info!(post_id = %post.id, "Stop keyword in owned thread, deferring to judgment");
        }

        let prompt = prompt::should_respond_prompt(owner_handle, post, thread);
        let reply = self.llm.complete(&[Message::user(prompt)]).await?;
        let verdict = parse_verdict(&reply);
        tracing::debug!(post_id = %post.id, %verdict, "Judgment verdict");
        Ok(EngagementVerdict::new(verdict, VerdictReason::Judgment))
    }

    /// 询问次级动作；未明确给出的动作一律视为不满足
    pub async fn decide_actions(
        &self,
        post: &Post,
        thread: &ConversationThread,
        owner_handle: &str,
    ) -> Result<ActionSet> {
        if post.is_authored_by(owner_handle) {
            return Ok(ActionSet::default());
        }
        let prompt = prompt::actions_prompt(owner_handle, post, thread);
        let reply = self.llm.complete(&[Message::user(prompt)]).await?;
        Ok(parse_actions(&reply))
    }

    /// 生成文本（回复 / 引用 / 新帖），去掉包裹的引号；空结果视为畸形响应
    pub async fn generate(&self, prompt: String) -> Result<String> {
        let text = prompt::clean_generated(&self.llm.complete(&[Message::user(prompt)]).await?);
        if text.is_empty() {
            return Err(BuzzError::MalformedResponse("empty generation".into()));
        }
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedLlmClient;

    const OWNER: &str = "buzz";

    fn pipeline(llm: Arc<ScriptedLlmClient>) -> ResponseDecisionPipeline {
        let keywords = StopKeywords::new(&["stop", "leave me alone"]).unwrap();
        ResponseDecisionPipeline::new(llm, keywords)
    }

    fn owned_thread(reply_text: &str) -> (Post, ConversationThread) {
        let root = Post::new("1", "buzz", "a thought");
        let reply = Post::new("2", "alice", reply_text).reply_to("1");
        let thread = ConversationThread::from_posts(vec![root, reply.clone()]).unwrap();
        (reply, thread)
    }

    #[tokio::test]
    async fn test_own_standalone_post_stops_without_judgment() {
        let llm = Arc::new(ScriptedLlmClient::new("RESPOND"));
        let p = pipeline(llm.clone());
        let post = Post::new("1", "@Buzz", "hello world");
        let thread = ConversationThread::from_posts(vec![post.clone()]).unwrap();

        let verdict = p.decide(&post, &thread, OWNER).await.unwrap();
        assert_eq!(verdict.verdict, Verdict::Stop);
        assert_eq!(verdict.reason, VerdictReason::OwnStandalone);
        assert_eq!(llm.calls(), 0);
    }

    #[tokio::test]
    async fn test_owned_thread_forces_respond_regardless_of_judgment() {
        let llm = Arc::new(ScriptedLlmClient::new("STOP"));
        let p = pipeline(llm.clone());
        let (post, thread) = owned_thread("interesting, tell me more");

        let verdict = p.decide(&post, &thread, OWNER).await.unwrap();
        assert_eq!(verdict.verdict, Verdict::Respond);
        assert_eq!(verdict.reason, VerdictReason::OwnedThread);
        assert_eq!(llm.calls(), 0);
    }

    #[tokio::test]
    async fn test_stop_keyword_defers_to_judgment() {
        let llm = Arc::new(ScriptedLlmClient::new("STOP"));
        let p = pipeline(llm.clone());
        let (post, thread) = owned_thread("Please STOP replying to me");

        let verdict = p.decide(&post, &thread, OWNER).await.unwrap();
        assert_eq!(verdict.verdict, Verdict::Stop);
        assert_eq!(verdict.reason, VerdictReason::Judgment);
        assert_eq!(llm.calls(), 1);
    }

    #[tokio::test]
    async fn test_stop_keyword_matches_whole_words_only() {
        let keywords = StopKeywords::new(&["stop"]).unwrap();
        assert!(keywords.matches("STOP it"));
        assert!(keywords.matches("please stop."));
        assert!(!keywords.matches("unstoppable"));
        assert!(!StopKeywords::new::<&str>(&[]).unwrap().matches("stop"));
    }

    #[tokio::test]
    async fn test_unrelated_thread_uses_judgment() {
        let llm = Arc::new(ScriptedLlmClient::new("I think RESPOND"));
        let p = pipeline(llm.clone());
        let root = Post::new("1", "carol", "root");
        let post = Post::new("2", "dave", "@buzz what about this?").reply_to("1");
        let thread = ConversationThread::from_posts(vec![root, post.clone()]).unwrap();

        let verdict = p.decide(&post, &thread, OWNER).await.unwrap();
        assert_eq!(verdict.verdict, Verdict::Respond);
        assert_eq!(verdict.reason, VerdictReason::Judgment);
        let prompt = llm.last_prompt().unwrap();
        assert!(prompt.contains("@carol [1]: root"));
    }

    #[tokio::test]
    async fn test_garbage_judgment_maps_to_ignore() {
        let llm = Arc::new(ScriptedLlmClient::new("¯\\_(ツ)_/¯ sure why not"));
        let p = pipeline(llm);
        let post = Post::new("9", "erin", "hey @buzz");
        let thread = ConversationThread::from_posts(vec![post.clone()]).unwrap();
        let verdict = p.decide(&post, &thread, OWNER).await.unwrap();
        assert_eq!(verdict.verdict, Verdict::Ignore);
    }

    #[tokio::test]
    async fn test_judgment_failure_propagates() {
        let llm = Arc::new(ScriptedLlmClient::new("RESPOND"));
        llm.push_error("upstream down");
        let p = pipeline(llm);
        let post = Post::new("9", "erin", "hey @buzz");
        let thread = ConversationThread::from_posts(vec![post.clone()]).unwrap();
        assert!(p.decide(&post, &thread, OWNER).await.is_err());
    }

    #[tokio::test]
    async fn test_actions_only_explicit() {
        let llm = Arc::new(ScriptedLlmClient::new("[LIKE]\nmaybe a retweet too"));
        let p = pipeline(llm);
        let post = Post::new("5", "frank", "great launch today");
        let thread = ConversationThread::from_posts(vec![post.clone()]).unwrap();
        let actions = p.decide_actions(&post, &thread, OWNER).await.unwrap();
        assert!(actions.like);
        assert!(!actions.retweet);
    }

    #[tokio::test]
    async fn test_empty_generation_is_malformed() {
        let llm = Arc::new(ScriptedLlmClient::new("  \"\"  "));
        let p = pipeline(llm);
        assert!(matches!(
            p.generate("write".into()).await,
            Err(BuzzError::MalformedResponse(_))
        ));
    }
}
