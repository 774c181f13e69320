//! 平台层：帖子数据模型、客户端抽象与实现（REST 桥接 / 内存）

pub mod client;
pub mod mock;
pub mod queued;
pub mod types;

pub use client::{HttpPlatformClient, PlatformClient};
pub use mock::InMemoryPlatform;
pub use queued::QueuedPlatform;
pub use types::{compare_ids, normalize_handle, Attachment, ConversationThread, OutboundPost, Post};
