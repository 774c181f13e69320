//! 持久记忆存储：已处理记录、帖子缓存、分析结果、轮询游标
//!
//! MemoryStore 是外部协作者的接口边界；LocalMemoryStore 提供内存版与单文件 JSON 版两种实现。
//! JSON 版每次写入都整体重写文件（先写临时文件再 rename），写入经同一把异步锁串行化。
//! 帖子缓存有容量上限，超出后按写入先后淘汰最旧的帖子；已处理记录与分析结果不淘汰。

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex as AsyncMutex;

use crate::core::Result;
use crate::platform::Post;

/// 记忆存储 trait
#[async_trait]
pub trait MemoryStore: Send + Sync {
    /// 已缓存的帖子
    async fn get_post(&self, id: &str) -> Result<Option<Post>>;

    async fn save_post(&self, post: &Post) -> Result<()>;

    /// 该 key 是否已被处理过（跨轮询窗口的幂等记录）
    async fn is_handled(&self, key: &str) -> Result<bool>;

    async fn mark_handled(&self, key: &str) -> Result<()>;

    async fn save_analysis(&self, key: &str, analysis: &serde_json::Value) -> Result<()>;

    async fn get_analysis(&self, key: &str) -> Result<Option<serde_json::Value>>;

    async fn get_cursor(&self, name: &str) -> Result<Option<String>>;

    async fn set_cursor(&self, name: &str, value: &str) -> Result<()>;

    /// 关闭前落盘；默认无操作
    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct StoreData {
    #[serde(default)]
    posts: BTreeMap<String, Post>,
    /// 帖子缓存的写入顺序，用于淘汰
    #[serde(default)]
    post_order: VecDeque<String>,
    #[serde(default)]
    handled: BTreeSet<String>,
    #[serde(default)]
    analyses: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    cursors: BTreeMap<String, String>,
}

impl StoreData {
    fn cache_post(&mut self, post: Post, capacity: usize) {
        if self.posts.insert(post.id.clone(), post.clone()).is_some() {
            self.post_order.retain(|id| id != &post.id);
        }
        self.post_order.push_back(post.id);
        while self.posts.len() > capacity {
            match self.post_order.pop_front() {
                Some(oldest) => {
                    self.posts.remove(&oldest);
                }
                None => break,
            }
        }
    }

    /// 旧文件没有 post_order 时按 id 顺序补齐
    fn repair_order(&mut self) {
        if self.post_order.len() != self.posts.len() {
            self.post_order = self.posts.keys().cloned().collect();
        }
    }
}

/// 默认最多缓存的帖子数
pub const DEFAULT_MAX_CACHED_POSTS: usize = 2000;

/// 本地记忆存储：path 为 None 时只存于内存
pub struct LocalMemoryStore {
    data: RwLock<StoreData>,
    path: Option<PathBuf>,
    /// 快照、写文件、rename 整个过程持有，保证落盘顺序与内存修改顺序一致
    write_lock: AsyncMutex<()>,
    max_cached_posts: usize,
    post_writes: AtomicUsize,
}

impl LocalMemoryStore {
    pub fn in_memory() -> Self {
        Self::with_data(StoreData::default(), None)
    }

    fn with_data(data: StoreData, path: Option<PathBuf>) -> Self {
        Self {
            data: RwLock::new(data),
            path,
            write_lock: AsyncMutex::new(()),
            max_cached_posts: DEFAULT_MAX_CACHED_POSTS,
            post_writes: AtomicUsize::new(0),
        }
    }

    /// 帖子缓存容量（至少 1）
    pub fn with_max_cached_posts(mut self, max: usize) -> Self {
        self.max_cached_posts = max.max(1);
        self
    }

    /// 打开 JSON 文件存储；文件不存在时从空开始
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut data: StoreData = if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            serde_json::from_str(&raw)?
        } else {
            StoreData::default()
        };
        data.repair_order();
        tracing::info!(path = %path.display(), posts = data.posts.len(), "Memory store opened");
        Ok(Self::with_data(data, Some(path)))
    }

    pub fn cached_post_count(&self) -> usize {
        self.read().posts.len()
    }

    /// save_post 被调用的次数
    pub fn post_writes(&self) -> usize {
        self.post_writes.load(Ordering::SeqCst)
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, StoreData> {
        self.data.read().unwrap_or_else(|e| e.into_inner())
    }

    /// 修改数据后（若有文件）整体落盘
    async fn mutate(&self, f: impl FnOnce(&mut StoreData)) -> Result<()> {
        let _writing = self.write_lock.lock().await;
        let snapshot = {
            let mut data = self.data.write().unwrap_or_else(|e| e.into_inner());
            f(&mut data);
            match self.path {
                Some(_) => Some(serde_json::to_string_pretty(&*data)?),
                None => None,
            }
        };
        if let (Some(path), Some(json)) = (&self.path, snapshot) {
            write_atomic(path, &json).await?;
        }
        Ok(())
    }
}

async fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    let tmp = path.with_extension(format!("{}.tmp", uuid::Uuid::new_v4().simple()));
    tokio::fs::write(&tmp, contents).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

#[async_trait]
impl MemoryStore for LocalMemoryStore {
    async fn get_post(&self, id: &str) -> Result<Option<Post>> {
        Ok(self.read().posts.get(id).cloned())
    }

    async fn save_post(&self, post: &Post) -> Result<()> {
        self.post_writes.fetch_add(1, Ordering::SeqCst);
        let post = post.clone();
        let capacity = self.max_cached_posts;
        self.mutate(move |d| d.cache_post(post, capacity))
        .await
    }

    async fn is_handled(&self, key: &str) -> Result<bool> {
        Ok(self.read().handled.contains(key))
    }

    async fn mark_handled(&self, key: &str) -> Result<()> {
        let key = key.to_string();
        self.mutate(move |d| {
            d.handled.insert(key);
        })
        .await
    }

    async fn save_analysis(&self, key: &str, analysis: &serde_json::Value) -> Result<()> {
        let key = key.to_string();
        let analysis = analysis.clone();
        self.mutate(move |d| {
            d.analyses.insert(key, analysis);
        })
        .await
    }

    async fn get_analysis(&self, key: &str) -> Result<Option<serde_json::Value>> {
        Ok(self.read().analyses.get(key).cloned())
    }

    async fn get_cursor(&self, name: &str) -> Result<Option<String>> {
        Ok(self.read().cursors.get(name).cloned())
    }

    async fn set_cursor(&self, name: &str, value: &str) -> Result<()> {
        let name = name.to_string();
        let value = value.to_string();
        self.mutate(move |d| {
            d.cursors.insert(name, value);
        })
        .await
    }

    async fn flush(&self) -> Result<()> {
        self.mutate(|_| {}).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_roundtrip() {
        let store = LocalMemoryStore::in_memory();
        assert!(!store.is_handled("k").await.unwrap());
        store.mark_handled("k").await.unwrap();
        assert!(store.is_handled("k").await.unwrap());

        store.save_post(&Post::new("1", "alice", "hello")).await.unwrap();
        assert_eq!(store.get_post("1").await.unwrap().unwrap().author_handle, "alice");
        assert_eq!(store.post_writes(), 1);
    }

    #[tokio::test]
    async fn test_file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("memory").join("store.json");
        {
            let store = LocalMemoryStore::open(&path).unwrap();
            store.mark_handled("mention:42").await.unwrap();
            store.set_cursor("mentions", "42").await.unwrap();
            store
                .save_analysis("evt-1", &serde_json::json!({"summary": "ok"}))
                .await
                .unwrap();
        }
        let reopened = LocalMemoryStore::open(&path).unwrap();
        assert!(reopened.is_handled("mention:42").await.unwrap());
        assert_eq!(
            reopened.get_cursor("mentions").await.unwrap().as_deref(),
            Some("42")
        );
        assert_eq!(
            reopened.get_analysis("evt-1").await.unwrap().unwrap()["summary"],
            "ok"
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_mutations_keep_file_valid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        let store = std::sync::Arc::new(LocalMemoryStore::open(&path).unwrap());

        let mut tasks = Vec::new();
        for i in 0..64 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                store.mark_handled(&format!("key-{i}")).await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let reopened = LocalMemoryStore::open(&path).unwrap();
        for i in 0..64 {
            assert!(reopened.is_handled(&format!("key-{i}")).await.unwrap());
        }
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_post_cache_is_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        let store = LocalMemoryStore::open(&path).unwrap().with_max_cached_posts(3);
        for i in 0..5 {
            store
                .save_post(&Post::new(format!("{i}"), "alice", "hi"))
                .await
                .unwrap();
        }
        // 再次写入 "2" 使它变成最新
        store.save_post(&Post::new("2", "alice", "hi")).await.unwrap();
        store.save_post(&Post::new("5", "alice", "hi")).await.unwrap();

        assert_eq!(store.cached_post_count(), 3);
        assert!(store.get_post("0").await.unwrap().is_none());
        assert!(store.get_post("3").await.unwrap().is_none());
        for id in ["2", "4", "5"] {
            assert!(store.get_post(id).await.unwrap().is_some());
        }

        let reopened = LocalMemoryStore::open(&path).unwrap().with_max_cached_posts(3);
        assert_eq!(reopened.cached_post_count(), 3);
    }
}
