//! 内存平台（用于测试与本地干跑，无需真实 API）
//!
//! 持有帖子图、时间线、提及列表与已发送记录；可注入抓取失败。

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;

use super::client::PlatformClient;
use super::types::{compare_ids, OutboundPost, Post};
use crate::core::{BuzzError, Result};

#[derive(Default)]
struct PlatformState {
    posts: HashMap<String, Post>,
    timeline: Vec<String>,
    sent: Vec<OutboundPost>,
    likes: Vec<String>,
    reposts: Vec<String>,
    failing: HashSet<String>,
    fetch_counts: HashMap<String, usize>,
    next_id: u64,
    own_handle: Option<String>,
}

/// 内存平台：所有帖子存于 HashMap，发出的帖子也会加入其中
#[derive(Default)]
pub struct InMemoryPlatform {
    state: Mutex<PlatformState>,
}

impl InMemoryPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, post: Post) {
        let mut state = self.lock();
        state.posts.insert(post.id.clone(), post);
    }

    pub fn with_posts(posts: impl IntoIterator<Item = Post>) -> Self {
        let platform = Self::new();
        for post in posts {
            platform.insert(post);
        }
        platform
    }

    /// 发出的帖子以该 handle 作为作者
    pub fn set_own_handle(&self, handle: &str) {
        self.lock().own_handle = Some(handle.to_string());
    }

    /// 放入首页时间线（同时登记为帖子）
    pub fn push_timeline(&self, post: Post) {
        let mut state = self.lock();
        state.timeline.push(post.id.clone());
        state.posts.insert(post.id.clone(), post);
    }

    /// 之后对该 id 的抓取均返回网络错误
    pub fn fail_fetch(&self, id: &str) {
        self.lock().failing.insert(id.to_string());
    }

    pub fn sent(&self) -> Vec<OutboundPost> {
        self.lock().sent.clone()
    }

    pub fn likes(&self) -> Vec<String> {
        self.lock().likes.clone()
    }

    pub fn reposts(&self) -> Vec<String> {
        self.lock().reposts.clone()
    }

    pub fn fetch_count(&self, id: &str) -> usize {
        self.lock().fetch_counts.get(id).copied().unwrap_or(0)
    }

    pub fn total_fetches(&self) -> usize {
        self.lock().fetch_counts.values().sum()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PlatformState> {
        // 测试替身：锁中毒时沿用内部状态
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn newest_first(mut posts: Vec<Post>) -> Vec<Post> {
    posts.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(compare_ids(&b.id, &a.id)));
    posts
}

#[async_trait]
impl PlatformClient for InMemoryPlatform {
    async fn fetch_post(&self, id: &str) -> Result<Post> {
        let mut state = self.lock();
        *state.fetch_counts.entry(id.to_string()).or_default() += 1;
        if state.failing.contains(id) {
            return Err(BuzzError::Network(format!("fetch {id} failed")));
        }
        state
            .posts
            .get(id)
            .cloned()
            .ok_or_else(|| BuzzError::NotFound(id.to_string()))
    }

    async fn search(&self, query: &str, limit: usize) -> Result<Vec<Post>> {
        let query = query.to_lowercase();
        let state = self.lock();
        let hits = state
            .posts
            .values()
            .filter(|p| p.body_text.to_lowercase().contains(&query))
            .cloned()
            .collect();
        Ok(newest_first(hits).into_iter().take(limit).collect())
    }

    async fn fetch_mentions(
        &self,
        handle: &str,
        since_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Post>> {
        let needle = format!("@{}", super::types::normalize_handle(handle));
        let state = self.lock();
        let hits = state
            .posts
            .values()
            .filter(|p| p.body_text.to_lowercase().contains(&needle))
            .filter(|p| !p.is_authored_by(handle))
            .filter(|p| since_id.map_or(true, |since| compare_ids(&p.id, since).is_gt()))
            .cloned()
            .collect();
        Ok(newest_first(hits).into_iter().take(limit).collect())
    }

    async fn fetch_timeline(&self, limit: usize) -> Result<Vec<Post>> {
        let state = self.lock();
        Ok(state
            .timeline
            .iter()
            .rev()
            .filter_map(|id| state.posts.get(id).cloned())
            .take(limit)
            .collect())
    }

    async fn fetch_user_posts(&self, handle: &str, limit: usize) -> Result<Vec<Post>> {
        let state = self.lock();
        let hits = state
            .posts
            .values()
            .filter(|p| p.is_authored_by(handle))
            .cloned()
            .collect();
        Ok(newest_first(hits).into_iter().take(limit).collect())
    }

    async fn send_post(&self, outbound: &OutboundPost) -> Result<Post> {
        let mut state = self.lock();
        state.next_id += 1;
        let author = state.own_handle.clone().unwrap_or_else(|| "buzz".to_string());
        let mut post = Post::new(format!("sent-{}", state.next_id), author, outbound.text.clone());
        post.parent_id = outbound.in_reply_to.clone();
        state.sent.push(outbound.clone());
        state.posts.insert(post.id.clone(), post.clone());
        Ok(post)
    }

    async fn like(&self, id: &str) -> Result<()> {
        self.lock().likes.push(id.to_string());
        Ok(())
    }

    async fn repost(&self, id: &str) -> Result<()> {
        self.lock().reposts.push(id.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fetch_counts_and_failures() {
        let platform = InMemoryPlatform::with_posts([Post::new("a", "x", "hello")]);
        assert!(platform.fetch_post("a").await.is_ok());
        assert!(matches!(
            platform.fetch_post("missing").await,
            Err(BuzzError::NotFound(_))
        ));
        platform.fail_fetch("a");
        assert!(matches!(
            platform.fetch_post("a").await,
            Err(BuzzError::Network(_))
        ));
        assert_eq!(platform.fetch_count("a"), 2);
    }

    #[tokio::test]
    async fn test_mentions_exclude_self() {
        let platform = InMemoryPlatform::with_posts([
            Post::new("1", "alice", "hey @buzz"),
            Post::new("2", "buzz", "talking to @buzz myself"),
            Post::new("3", "bob", "unrelated"),
        ]);
        let mentions = platform.fetch_mentions("buzz", None, 10).await.unwrap();
        assert_eq!(mentions.len(), 1);
        assert_eq!(mentions[0].id, "1");
    }

    #[tokio::test]
    async fn test_since_id_compares_numerically() {
        let platform = InMemoryPlatform::with_posts([
            Post::new("9", "alice", "@buzz nine"),
            Post::new("10", "bob", "@buzz ten"),
            Post::new("11", "carol", "@buzz eleven"),
        ]);
        let mut ids: Vec<_> = platform
            .fetch_mentions("buzz", Some("9"), 10)
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.id)
            .collect();
        ids.sort();
        assert_eq!(ids, vec!["10", "11"]);
    }

    #[tokio::test]
    async fn test_sent_posts_join_the_graph() {
        let platform = InMemoryPlatform::new();
        platform.set_own_handle("helper");
        let sent = platform
            .send_post(&OutboundPost::reply("thanks", "7"))
            .await
            .unwrap();
        assert_eq!(sent.author_handle, "helper");
        assert_eq!(sent.parent_id.as_deref(), Some("7"));
        assert_eq!(platform.fetch_post(&sent.id).await.unwrap().body_text, "thanks");

        platform.repost("7").await.unwrap();
        assert_eq!(platform.reposts(), vec!["7".to_string()]);
    }
}
