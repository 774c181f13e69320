//! 互动智能体：四个定时循环的循环体
//!
//! - posting：生成并发布一条新帖
//! - search：按话题 / 目标用户搜索，每轮至多互动一个候选
//! - interactions：轮询提及，重建线程、判定、回复
//! - timeline：浏览时间线，按判定执行点赞 / 转发 / 引用 / 回复
//!
//! 单条内容失败不影响同轮其他内容；瞬时网络错误直接结束本轮，等待下一次调度。

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;

use crate::config::AppConfig;
use crate::core::scheduler::LoopTask;
use crate::core::{BuzzError, Result};
use crate::engagement::{
    prompt, ActionSet, ActionTag, ConversationThreadResolver, EngagementVerdict,
    ResponseDecisionPipeline, Verdict, VerdictReason,
};
use crate::events::{EngagementEvent, EventBus};
use crate::memory::{ArtifactWriter, DedupMemoryGuard, Transcript};
use crate::platform::{compare_ids, ConversationThread, OutboundPost, Post, QueuedPlatform};

const MENTIONS_CURSOR: &str = "mentions";
const FETCH_LIMIT: usize = 20;
const RECENT_OWN_POSTS: usize = 5;
/// search 循环每轮最多评估的候选数
const MAX_SEARCH_EVALUATIONS: usize = 5;

/// 智能体行为参数
#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub owner_handle: String,
    pub dry_run: bool,
    pub max_post_length: usize,
    pub target_users: Vec<String>,
    pub search_topics: Vec<String>,
}

impl AgentSettings {
    pub fn from_config(cfg: &AppConfig) -> Self {
        Self {
            owner_handle: cfg.agent.handle.clone(),
            dry_run: cfg.agent.dry_run,
            max_post_length: cfg.agent.max_post_length,
            target_users: cfg.agent.target_users.clone(),
            search_topics: cfg.agent.search_topics.clone(),
        }
    }
}

/// 单条内容的处理结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
    Engaged,
    Declined,
    Skipped(&'static str),
}

pub struct EngagementAgent {
    settings: AgentSettings,
    platform: QueuedPlatform,
    guard: Arc<DedupMemoryGuard>,
    resolver: ConversationThreadResolver,
    pipeline: ResponseDecisionPipeline,
    artifacts: ArtifactWriter,
    events: EventBus,
}

impl EngagementAgent {
    pub fn new(
        settings: AgentSettings,
        platform: QueuedPlatform,
        guard: Arc<DedupMemoryGuard>,
        resolver: ConversationThreadResolver,
        pipeline: ResponseDecisionPipeline,
        artifacts: ArtifactWriter,
        events: EventBus,
    ) -> Self {
        Self {
            settings,
            platform,
            guard,
            resolver,
            pipeline,
            artifacts,
            events,
        }
    }

    fn owner(&self) -> &str {
        &self.settings.owner_handle
    }

    // ---- posting ----

    /// 生成一条新帖并发布（超长时拆成自回复链）
    pub async fn publish_original(&self) -> Result<Vec<String>> {
        let recent = match self
            .platform
            .fetch_user_posts(self.owner(), RECENT_OWN_POSTS)
            .await
        {
            Ok(posts) => posts,
            Err(e) if e.is_transient() => return Err(e),
            Err(e) => {
                tracing::warn!(error = %e, "Could not load recent own posts, generating without them");
                Vec::new()
            }
        };
        let text = self
            .pipeline
            .generate(prompt::new_post_prompt(
                self.owner(),
                &self.settings.search_topics,
                &recent,
            ))
            .await?;
        let ids = self.publish(OutboundPost::original(text)).await?;
        if let Some(first) = ids.first() {
            self.events.emit(EngagementEvent::PostPublished {
                post_id: first.clone(),
                dry_run: self.settings.dry_run,
            });
        }
        Ok(ids)
    }

    // ---- search ----

    /// 按话题与目标用户收集候选，依次评估，第一次真正回复后结束本轮
    pub async fn engage_search(&self) -> Result<Option<String>> {
        let mut candidates: Vec<Post> = Vec::new();
        for topic in &self.settings.search_topics {
            match self.platform.search(topic, FETCH_LIMIT).await {
                Ok(posts) => candidates.extend(posts),
                Err(e) if e.is_transient() => return Err(e),
                Err(e) => tracing::warn!(%topic, error = %e, "Search failed"),
            }
        }
        for user in &self.settings.target_users {
            match self.platform.fetch_user_posts(user, RECENT_OWN_POSTS).await {
                Ok(posts) => candidates.extend(posts),
                Err(e) if e.is_transient() => return Err(e),
                Err(e) => tracing::warn!(%user, error = %e, "Fetching target user posts failed"),
            }
        }
        let mut seen = std::collections::HashSet::new();
        candidates.retain(|p| seen.insert(p.id.clone()));
        self.artifacts.write_snapshot("search", &candidates).await;

        let mut evaluated = 0usize;
        for post in &candidates {
            if evaluated >= MAX_SEARCH_EVALUATIONS {
                break;
            }
            if post.is_authored_by(self.owner()) || self.guard.has_been_handled(&post.id).await? {
                continue;
            }
            evaluated += 1;
            match self.guarded(post, self.handle_conversation(post, "search")).await? {
                ItemOutcome::Engaged => return Ok(Some(post.id.clone())),
                ItemOutcome::Declined | ItemOutcome::Skipped(_) => {}
            }
        }
        Ok(None)
    }

    // ---- interactions ----

    /// 轮询提及；返回实际回复的条数
    pub async fn poll_interactions(&self) -> Result<usize> {
        let store = self.guard.store();
        let cursor = store.get_cursor(MENTIONS_CURSOR).await?;
        let mut mentions = self
            .platform
            .fetch_mentions(self.owner(), cursor.as_deref(), FETCH_LIMIT)
            .await?;
        self.artifacts.write_snapshot("mentions", &mentions).await;
        mentions.sort_by(|a, b| a.created_at.cmp(&b.created_at));

        let mut replied = 0usize;
        let mut newest = cursor;
        for post in &mentions {
            let outcome = self
                .guarded(post, self.handle_conversation(post, "mention"))
                .await;
            // 游标只越过已经处理完（或被跳过）的提及
            match outcome {
                Ok(outcome) => {
                    if outcome == ItemOutcome::Engaged {
                        replied += 1;
                    }
                    newest = Some(newer_id(newest.as_deref(), &post.id));
                }
                Err(e) => {
                    self.save_cursor(newest.as_deref()).await;
                    return Err(e);
                }
            }
        }
        self.save_cursor(newest.as_deref()).await;
        Ok(replied)
    }

    async fn save_cursor(&self, value: Option<&str>) {
        let Some(value) = value else { return };
        if let Err(e) = self.guard.store().set_cursor(MENTIONS_CURSOR, value).await {
            tracing::warn!(error = %e, "Failed to persist mention cursor");
        }
    }

    /// 单条会话内容：去重、重建线程、判定、回复、记录
    async fn handle_conversation(&self, post: &Post, source: &str) -> Result<ItemOutcome> {
        if post.is_authored_by(self.owner()) {
            return Ok(ItemOutcome::Skipped("own post"));
        }
        if self.guard.has_been_handled(&post.id).await? {
            return Ok(ItemOutcome::Skipped("already handled"));
        }
        let Some(_held) = self.guard.acquire(&post.id) else {
            return Ok(ItemOutcome::Skipped("in flight"));
        };

        let thread = self.resolver.resolve_default(post).await;
        let verdict = self.pipeline.decide(post, &thread, self.owner()).await?;
        tracing::info!(post_id = %post.id, verdict = %verdict.verdict, reason = ?verdict.reason, "Engagement verdict");

        let response = if verdict.should_respond() {
            let text = self
                .pipeline
                .generate(prompt::reply_prompt(self.owner(), post, &thread))
                .await?;
            let ids = self
                .publish(OutboundPost::reply(text.clone(), post.id.clone()))
                .await?;
            self.events.emit(EngagementEvent::ReplySent {
                in_reply_to: post.id.clone(),
                post_ids: ids,
                dry_run: self.settings.dry_run,
            });
            Some(text)
        } else {
            None
        };

        self.guard.mark_handled(&post.id).await?;
        self.record(post, source, &thread, &verdict, response.clone())
            .await;

        if response.is_some() {
            Ok(ItemOutcome::Engaged)
        } else {
            self.events.emit(EngagementEvent::ItemSkipped {
                item_id: post.id.clone(),
                reason: format!("verdict {}", verdict.verdict),
            });
            Ok(ItemOutcome::Declined)
        }
    }

    // ---- timeline ----

    /// 浏览时间线执行次级动作；返回执行的动作数
    pub async fn process_timeline(&self) -> Result<usize> {
        let timeline = self.platform.fetch_timeline(FETCH_LIMIT).await?;
        self.artifacts.write_snapshot("timeline", &timeline).await;

        let mut performed = 0usize;
        for post in &timeline {
            if let ItemOutcome::Engaged = self.guarded(post, self.handle_timeline_post(post, &mut performed)).await? {
                tracing::debug!(post_id = %post.id, "Timeline post engaged");
            }
        }
        Ok(performed)
    }

    async fn handle_timeline_post(&self, post: &Post, performed: &mut usize) -> Result<ItemOutcome> {
        if post.is_authored_by(self.owner()) {
            return Ok(ItemOutcome::Skipped("own post"));
        }
        if self.guard.has_been_handled(&post.id).await? {
            return Ok(ItemOutcome::Skipped("already handled"));
        }
        let Some(_held) = self.guard.acquire(&post.id) else {
            return Ok(ItemOutcome::Skipped("in flight"));
        };

        let thread = self.resolver.resolve_default(post).await;
        let actions = self
            .pipeline
            .decide_actions(post, &thread, self.owner())
            .await?;
        // 先落下已处理记录：后续某个动作失败时，已完成的动作不会在下一轮重放
        self.guard.mark_handled(&post.id).await?;
        let mut done = Vec::new();
        let mut response = None;
        for tag in actions.satisfied() {
            match tag {
                ActionTag::Like => {
                    if !self.settings.dry_run {
                        self.platform.like(&post.id).await?;
                    }
                }
                ActionTag::Retweet => {
                    if !self.settings.dry_run {
                        self.platform.repost(&post.id).await?;
                    }
                }
                ActionTag::Quote => {
                    let text = self
                        .pipeline
                        .generate(prompt::quote_prompt(self.owner(), post))
                        .await?;
                    self.publish(OutboundPost::quote(text, post.id.clone()))
                        .await?;
                }
                ActionTag::Reply => {
                    let text = self
                        .pipeline
                        .generate(prompt::reply_prompt(self.owner(), post, &thread))
                        .await?;
                    let ids = self
                        .publish(OutboundPost::reply(text.clone(), post.id.clone()))
                        .await?;
                    self.events.emit(EngagementEvent::ReplySent {
                        in_reply_to: post.id.clone(),
                        post_ids: ids,
                        dry_run: self.settings.dry_run,
                    });
                    response = Some(text);
                }
            }
            tracing::info!(post_id = %post.id, action = tag.token(), dry_run = self.settings.dry_run, "Action performed");
            self.events.emit(EngagementEvent::ActionPerformed {
                post_id: post.id.clone(),
                action: tag.token().to_string(),
                dry_run: self.settings.dry_run,
            });
            done.push(tag);
            *performed += 1;
        }

        let verdict = EngagementVerdict::new(
            if done.is_empty() {
                Verdict::Ignore
            } else {
                Verdict::Respond
            },
            VerdictReason::Judgment,
        )
        .with_actions(actions);
        self.record(post, "timeline", &thread, &verdict, response).await;

        Ok(if done.is_empty() {
            ItemOutcome::Declined
        } else {
            ItemOutcome::Engaged
        })
    }

    // ---- shared ----

    /// 单条内容的错误边界：瞬时错误结束本轮，其余错误只跳过该条
    async fn guarded(
        &self,
        post: &Post,
        work: impl std::future::Future<Output = Result<ItemOutcome>>,
    ) -> Result<ItemOutcome> {
        match work.await {
            Ok(ItemOutcome::Skipped(reason)) => {
                tracing::debug!(post_id = %post.id, reason, "Item skipped");
                Ok(ItemOutcome::Skipped(reason))
            }
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                self.events.emit(EngagementEvent::ItemFailed {
                    item_id: post.id.clone(),
                    error: e.to_string(),
                });
                if e.is_transient() {
                    tracing::warn!(post_id = %post.id, error = %e, "Transient failure, ending this run");
                    Err(e)
                } else {
                    tracing::warn!(post_id = %post.id, error = %e, "Item failed, skipping");
                    Ok(ItemOutcome::Skipped("failed"))
                }
            }
        }
    }

    /// 发布一条内容，超长时拆成回复链；干跑模式只记日志并返回本地 id
    async fn publish(&self, outbound: OutboundPost) -> Result<Vec<String>> {
        let chunks = split_for_posting(&outbound.text, self.settings.max_post_length);
        if chunks.is_empty() {
            return Err(BuzzError::MalformedResponse("nothing to publish".into()));
        }

        let mut ids = Vec::with_capacity(chunks.len());
        let mut parent = outbound.in_reply_to.clone();
        let mut quote_of = outbound.quote_of.clone();
        for chunk in chunks {
            let next = OutboundPost {
                text: chunk,
                in_reply_to: parent.clone(),
                quote_of: quote_of.take(),
            };
            let id = if self.settings.dry_run {
                let id = format!("dry-run-{}", uuid::Uuid::new_v4());
                tracing::info!(
                    id = %id,
                    in_reply_to = ?next.in_reply_to,
                    quote_of = ?next.quote_of,
                    text = %next.text,
                    "Dry run, not sending"
                );
                id
            } else {
                let sent = self.platform.send_post(next).await?;
                tracing::info!(post_id = %sent.id, in_reply_to = ?sent.parent_id, "Post sent");
                sent.id
            };
            parent = Some(id.clone());
            ids.push(id);
        }
        Ok(ids)
    }

    async fn record(
        &self,
        post: &Post,
        source: &str,
        thread: &ConversationThread,
        verdict: &EngagementVerdict,
        response: Option<String>,
    ) {
        let transcript = Transcript {
            item_id: post.id.clone(),
            source: source.to_string(),
            author: post.author_handle.clone(),
            context: prompt::render_thread(thread),
            verdict: verdict.verdict.to_string(),
            actions: action_tokens(&verdict.actions),
            response,
            recorded_at: Utc::now(),
        };
        self.artifacts.write_transcript(&transcript).await;
    }
}

fn action_tokens(actions: &ActionSet) -> Vec<String> {
    actions
        .satisfied()
        .into_iter()
        .map(|tag| tag.token().to_string())
        .collect()
}

/// 两个 id 中较新的一个
pub fn newer_id(current: Option<&str>, candidate: &str) -> String {
    let Some(current) = current else {
        return candidate.to_string();
    };
    if compare_ids(candidate, current).is_gt() {
        candidate
    } else {
        current
    }
    .to_string()
}

/// 按空白拆分为不超过 max_chars 个字符的片段；单个超长词按字符硬切。max_chars 为 0 时不拆
pub fn split_for_posting(text: &str, max_chars: usize) -> Vec<String> {
    let text = text.trim();
    if text.is_empty() {
        return Vec::new();
    }
    if max_chars == 0 || text.chars().count() <= max_chars {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_len = 0usize;
    for word in text.split_whitespace() {
        let word_len = word.chars().count();
        if word_len > max_chars {
            if !current.is_empty() {
                chunks.push(std::mem::take(&mut current));
                current_len = 0;
            }
            let chars: Vec<char> = word.chars().collect();
            for piece in chars.chunks(max_chars) {
                chunks.push(piece.iter().collect());
            }
            continue;
        }
        let needed = if current.is_empty() { word_len } else { current_len + 1 + word_len };
        if needed > max_chars {
            chunks.push(std::mem::take(&mut current));
            current_len = 0;
        }
        if !current.is_empty() {
            current.push(' ');
            current_len += 1;
        }
        current.push_str(word);
        current_len += word_len;
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// 可注册到调度器的循环类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopKind {
    Posting,
    Search,
    Interactions,
    Timeline,
}

impl LoopKind {
    pub const ALL: [LoopKind; 4] = [
        LoopKind::Posting,
        LoopKind::Search,
        LoopKind::Interactions,
        LoopKind::Timeline,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            LoopKind::Posting => "posting",
            LoopKind::Search => "search",
            LoopKind::Interactions => "interactions",
            LoopKind::Timeline => "timeline",
        }
    }
}

/// 把智能体的某个循环体适配为 LoopTask
pub struct AgentLoop {
    agent: Arc<EngagementAgent>,
    kind: LoopKind,
}

impl AgentLoop {
    pub fn new(agent: Arc<EngagementAgent>, kind: LoopKind) -> Self {
        Self { agent, kind }
    }
}

#[async_trait]
impl LoopTask for AgentLoop {
    async fn run(&self) -> Result<()> {
        match self.kind {
            LoopKind::Posting => {
                self.agent.publish_original().await?;
            }
            LoopKind::Search => {
                if let Some(id) = self.agent.engage_search().await? {
                    tracing::info!(post_id = %id, "Search engagement done");
                }
            }
            LoopKind::Interactions => {
                let replied = self.agent.poll_interactions().await?;
                tracing::info!(replied, "Interaction poll done");
            }
            LoopKind::Timeline => {
                let performed = self.agent.process_timeline().await?;
                tracing::info!(performed, "Timeline pass done");
            }
        }
        Ok(())
    }
}
