//! 经请求队列访问平台：所有网络调用都通过 RequestQueue 串行化

use std::sync::Arc;

use super::client::PlatformClient;
use super::types::{OutboundPost, Post};
use crate::core::{RequestQueue, Result};

/// PlatformClient 的队列化包装；可廉价克隆
#[derive(Clone)]
pub struct QueuedPlatform {
    queue: Arc<RequestQueue>,
    client: Arc<dyn PlatformClient>,
}

impl QueuedPlatform {
    pub fn new(queue: Arc<RequestQueue>, client: Arc<dyn PlatformClient>) -> Self {
        Self { queue, client }
    }

    pub fn queue(&self) -> &Arc<RequestQueue> {
        &self.queue
    }

    pub async fn fetch_post(&self, id: &str) -> Result<Post> {
        let client = Arc::clone(&self.client);
        let id = id.to_string();
        self.queue
            .enqueue(move || async move { client.fetch_post(&id).await })
            .await
    }

    pub async fn search(&self, query: &str, limit: usize) -> Result<Vec<Post>> {
        let client = Arc::clone(&self.client);
        let query = query.to_string();
        self.queue
            .enqueue(move || async move { client.search(&query, limit).await })
            .await
    }

    pub async fn fetch_mentions(
        &self,
        handle: &str,
        since_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Post>> {
        let client = Arc::clone(&self.client);
        let handle = handle.to_string();
        let since_id = since_id.map(str::to_string);
        self.queue
            .enqueue(move || async move {
                client
                    .fetch_mentions(&handle, since_id.as_deref(), limit)
                    .await
            })
            .await
    }

    pub async fn fetch_timeline(&self, limit: usize) -> Result<Vec<Post>> {
        let client = Arc::clone(&self.client);
        self.queue
            .enqueue(move || async move { client.fetch_timeline(limit).await })
            .await
    }

    pub async fn fetch_user_posts(&self, handle: &str, limit: usize) -> Result<Vec<Post>> {
        let client = Arc::clone(&self.client);
        let handle = handle.to_string();
        self.queue
            .enqueue(move || async move { client.fetch_user_posts(&handle, limit).await })
            .await
    }

    pub async fn send_post(&self, post: OutboundPost) -> Result<Post> {
        let client = Arc::clone(&self.client);
        self.queue
            .enqueue(move || async move { client.send_post(&post).await })
            .await
    }

    pub async fn like(&self, id: &str) -> Result<()> {
        let client = Arc::clone(&self.client);
        let id = id.to_string();
        self.queue
            .enqueue(move || async move { client.like(&id).await })
            .await
    }

    pub async fn repost(&self, id: &str) -> Result<()> {
        let client = Arc::clone(&self.client);
        let id = id.to_string();
        self.queue
            .enqueue(move || async move { client.repost(&id).await })
            .await
    }
}
