//! 平台数据模型：Post（帖子）与 ConversationThread（根到叶的祖先链）

use std::cmp::Ordering;
use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 媒体附件引用
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub url: String,
    #[serde(default)]
    pub media_type: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

/// 平台上的一条内容；抓取后只读
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Post {
    pub id: String,
    pub author_handle: String,
    pub body_text: String,
    pub created_at: DateTime<Utc>,
    /// 被回复的帖子 id
    #[serde(default)]
    pub parent_id: Option<String>,
    /// 会话根 id；根帖子等于自身 id
    #[serde(default)]
    pub conversation_root_id: Option<String>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

impl Post {
    pub fn new(id: impl Into<String>, author: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            author_handle: author.into(),
            body_text: body.into(),
            created_at: Utc::now(),
            parent_id: None,
            conversation_root_id: None,
            attachments: Vec::new(),
        }
    }

    pub fn reply_to(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    pub fn is_reply(&self) -> bool {
        self.parent_id.is_some()
    }

    /// handle 比较忽略大小写与前导 @
    pub fn is_authored_by(&self, handle: &str) -> bool {
        normalize_handle(&self.author_handle) == normalize_handle(handle)
    }
}

pub fn normalize_handle(handle: &str) -> String {
    handle.trim().trim_start_matches('@').to_lowercase()
}

/// 帖子 id 的先后：都是数字时按数值比较，否则按 (长度, 字典序)
pub fn compare_ids(a: &str, b: &str) -> Ordering {
    match (a.parse::<u128>(), b.parse::<u128>()) {
        (Ok(x), Ok(y)) => x.cmp(&y),
        _ => (a.len(), a).cmp(&(b.len(), b)),
    }
}

/// 要发出的新内容（原创 / 回复 / 引用）
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundPost {
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub in_reply_to: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quote_of: Option<String>,
}

impl OutboundPost {
    pub fn original(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }

    pub fn reply(text: impl Into<String>, parent_id: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            in_reply_to: Some(parent_id.into()),
            quote_of: None,
        }
    }

    pub fn quote(text: impl Into<String>, quoted_id: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            in_reply_to: None,
            quote_of: Some(quoted_id.into()),
        }
    }
}

/// 从会话根到目标叶子的有序帖子序列（根在前）
///
/// 不变式：id 不重复；每个非根元素的 parent_id 等于前一个元素的 id。
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConversationThread {
    posts: Vec<Post>,
}

impl ConversationThread {
    /// 由根在前的序列构造；违反不变式时返回 None
    pub fn from_posts(posts: Vec<Post>) -> Option<Self> {
        let mut seen = HashSet::new();
        for (i, post) in posts.iter().enumerate() {
            if !seen.insert(post.id.as_str()) {
                return None;
            }
            if i > 0 && post.parent_id.as_deref() != Some(posts[i - 1].id.as_str()) {
                return None;
            }
        }
        Some(Self { posts })
    }

    pub(crate) fn from_chain_unchecked(posts: Vec<Post>) -> Self {
        Self { posts }
    }

    pub fn posts(&self) -> &[Post] {
        &self.posts
    }

    pub fn len(&self) -> usize {
        self.posts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.posts.is_empty()
    }

    pub fn root(&self) -> Option<&Post> {
        self.posts.first()
    }

    pub fn leaf(&self) -> Option<&Post> {
        self.posts.last()
    }

    /// 叶子之前的所有元素
    pub fn ancestors(&self) -> &[Post] {
        match self.posts.split_last() {
            Some((_, rest)) => rest,
            None => &[],
        }
    }

    pub fn ids(&self) -> Vec<&str> {
        self.posts.iter().map(|p| p.id.as_str()).collect()
    }

    pub fn into_posts(self) -> Vec<Post> {
        self.posts
    }
}
