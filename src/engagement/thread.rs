//! 会话线程重建
//!
//! 从叶子帖子沿 parent_id 向上逐跳抓取，结果根在前。遇到以下任一情况即停止：
//! 没有 parent（到达根）、已走满 max_depth 跳、parent 抓取失败（返回已得部分）、parent 已访问过（环）。
//! 已持久化的帖子直接使用缓存，不再抓取也不重复写入；新抓取的帖子在线程确定后统一写入记忆存储。

use std::collections::HashSet;
use std::sync::Arc;

use crate::memory::DedupMemoryGuard;
use crate::platform::{ConversationThread, Post, QueuedPlatform};

pub struct ConversationThreadResolver {
    platform: QueuedPlatform,
    guard: Arc<DedupMemoryGuard>,
    default_max_depth: usize,
}

impl ConversationThreadResolver {
    pub fn new(platform: QueuedPlatform, guard: Arc<DedupMemoryGuard>, default_max_depth: usize) -> Self {
        Self {
            platform,
            guard,
            default_max_depth,
        }
    }

    pub fn default_max_depth(&self) -> usize {
        self.default_max_depth
    }

    /// 使用配置的默认深度
    pub async fn resolve_default(&self, leaf: &Post) -> ConversationThread {
        self.resolve(leaf, self.default_max_depth).await
    }

    /// 重建 leaf 的祖先链；至多 max_depth 次抓取，结果 id 不重复
    pub async fn resolve(&self, leaf: &Post, max_depth: usize) -> ConversationThread {
        let mut chain = vec![leaf.clone()];
        let mut visited: HashSet<String> = HashSet::from([leaf.id.clone()]);
        let mut fresh: Vec<Post> = Vec::new();
        let mut next_parent = leaf.parent_id.clone();
        let mut hops = 0usize;

        if self.guard.cached_post(&leaf.id).await.is_none() {
            fresh.push(leaf.clone());
        }

        while let Some(parent_id) = next_parent.take() {
            if hops >= max_depth {
                tracing::debug!(leaf = %leaf.id, max_depth, "Thread depth limit reached");
                break;
            }
            if visited.contains(&parent_id) {
                tracing::warn!(leaf = %leaf.id, parent = %parent_id, "Cycle detected in reply chain, stopping");
                break;
            }
            hops += 1;

            let parent = match self.guard.cached_post(&parent_id).await {
                Some(cached) => cached,
                None => match self.platform.fetch_post(&parent_id).await {
                    Ok(post) => {
                        fresh.push(post.clone());
                        post
                    }
                    Err(e) => {
                        tracing::warn!(
                            leaf = %leaf.id,
                            parent = %parent_id,
                            error = %e,
                            "Failed to fetch parent post, returning partial thread"
                        );
                        break;
                    }
                },
            };

            if parent.id != parent_id {
                tracing::warn!(expected = %parent_id, got = %parent.id, "Fetched post id mismatch, stopping");
                fresh.retain(|p| p.id != parent.id);
                break;
            }

            visited.insert(parent.id.clone());
            next_parent = parent.parent_id.clone();
            chain.push(parent);
        }

        chain.reverse();
        self.remember(&fresh).await;
        ConversationThread::from_chain_unchecked(chain)
    }

    async fn remember(&self, posts: &[Post]) {
        for post in posts {
            if let Err(e) = self.guard.remember_post(post).await {
                tracing::warn!(post_id = %post.id, error = %e, "Failed to persist post");
            }
        }
    }
}
