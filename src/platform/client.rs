//! 平台客户端抽象
//!
//! 所有读写平台内容的操作都经 PlatformClient 完成；核心逻辑只通过 RequestQueue 调用它。
//! HttpPlatformClient 对接一个 REST 桥接服务（路径见下方各方法）。

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use super::types::{OutboundPost, Post};
use crate::config::PlatformSection;
use crate::core::{BuzzError, Result};

/// 平台客户端 trait：抓取帖子 / 搜索 / 提及 / 时间线，发帖与点赞转发
#[async_trait]
pub trait PlatformClient: Send + Sync {
    /// 按 id 抓取单条帖子；不存在时返回 NotFound
    async fn fetch_post(&self, id: &str) -> Result<Post>;

    async fn search(&self, query: &str, limit: usize) -> Result<Vec<Post>>;

    /// 提及 handle 的帖子；since_id 为上次处理到的位置
    async fn fetch_mentions(&self, handle: &str, since_id: Option<&str>, limit: usize)
        -> Result<Vec<Post>>;

    async fn fetch_timeline(&self, limit: usize) -> Result<Vec<Post>>;

    async fn fetch_user_posts(&self, handle: &str, limit: usize) -> Result<Vec<Post>>;

    /// 发帖，返回平台生成的帖子
    async fn send_post(&self, post: &OutboundPost) -> Result<Post>;

    async fn like(&self, id: &str) -> Result<()>;

    async fn repost(&self, id: &str) -> Result<()>;
}

#[derive(Debug, Deserialize)]
struct PostList {
    posts: Vec<Post>,
}

/// REST 桥接客户端
pub struct HttpPlatformClient {
    client: reqwest::Client,
    base_url: String,
    api_token: Option<String>,
}

impl HttpPlatformClient {
    pub fn new(base_url: &str, api_token: Option<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_token,
        })
    }

    pub fn from_config(section: &PlatformSection) -> Result<Self> {
        Self::new(
            &section.base_url,
            section.api_token.clone(),
            Duration::from_secs(section.request_timeout_secs),
        )
    }

    /// 逐段拼接路径；每段都会做百分号编码，id 中的 / ? # 不会改变路由
    fn url(&self, segments: &[&str]) -> Result<reqwest::Url> {
        let mut url = reqwest::Url::parse(&self.base_url)
            .map_err(|e| BuzzError::Config(format!("invalid platform base_url {}: {e}", self.base_url)))?;
        url.path_segments_mut()
            .map_err(|_| BuzzError::Config(format!("platform base_url cannot be a base: {}", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        let response = self.authorized(request).send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        if status.as_u16() == 404 {
            return Err(BuzzError::NotFound(response.url().path().to_string()));
        }
        if status.as_u16() == 429 {
            let retry_after_ms = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(|secs| secs * 1000)
                .unwrap_or(60_000);
            return Err(BuzzError::RateLimited { retry_after_ms });
        }
        let message = response.text().await.unwrap_or_default();
        Err(BuzzError::Platform {
            status: status.as_u16(),
            message,
        })
    }

    async fn get_list(&self, segments: &[&str], query: &[(&str, String)]) -> Result<Vec<Post>> {
        let response = self.send(self.client.get(self.url(segments)?).query(query)).await?;
        let list: PostList = response.json().await?;
        Ok(list.posts)
    }
}

#[async_trait]
impl PlatformClient for HttpPlatformClient {
    async fn fetch_post(&self, id: &str) -> Result<Post> {
        let response = self.send(self.client.get(self.url(&["posts", id])?)).await?;
        Ok(response.json().await?)
    }

    async fn search(&self, query: &str, limit: usize) -> Result<Vec<Post>> {
        self.get_list(
            &["search"],
            &[("q", query.to_string()), ("limit", limit.to_string())],
        )
        .await
    }

    async fn fetch_mentions(
        &self,
        handle: &str,
        since_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Post>> {
        let mut query = vec![("handle", handle.to_string()), ("limit", limit.to_string())];
        if let Some(since) = since_id {
            query.push(("since_id", since.to_string()));
        }
        self.get_list(&["mentions"], &query).await
    }

    async fn fetch_timeline(&self, limit: usize) -> Result<Vec<Post>> {
        self.get_list(&["timeline"], &[("limit", limit.to_string())]).await
    }

    async fn fetch_user_posts(&self, handle: &str, limit: usize) -> Result<Vec<Post>> {
        self.get_list(
            &["users", handle, "posts"],
            &[("limit", limit.to_string())],
        )
        .await
    }

    async fn send_post(&self, post: &OutboundPost) -> Result<Post> {
        let response = self
            .send(self.client.post(self.url(&["posts"])?).json(post))
            .await?;
        Ok(response.json().await?)
    }

    async fn like(&self, id: &str) -> Result<()> {
        self.send(self.client.post(self.url(&["posts", id, "like"])?))
            .await?;
        Ok(())
    }

    async fn repost(&self, id: &str) -> Result<()> {
        self.send(self.client.post(self.url(&["posts", id, "repost"])?))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_segments_are_encoded() {
        let client =
            HttpPlatformClient::new("http://127.0.0.1:8787/api/", None, Duration::from_secs(1)).unwrap();
        assert_eq!(
            client.url(&["posts", "a/b?c#d", "like"]).unwrap().as_str(),
            "http://127.0.0.1:8787/api/posts/a%2Fb%3Fc%23d/like"
        );
        assert_eq!(
            client.url(&["users", "some one", "posts"]).unwrap().path(),
            "/api/users/some%20one/posts"
        );
    }

    #[test]
    fn test_invalid_base_url_is_config_error() {
        let client = HttpPlatformClient::new("not a url", None, Duration::from_secs(1)).unwrap();
        assert!(matches!(client.url(&["posts"]), Err(BuzzError::Config(_))));
    }
}
