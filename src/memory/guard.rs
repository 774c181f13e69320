//! 去重与幂等守卫
//!
//! 两套互相独立的记录：
//! - **进行中集合**（内存）：try_acquire / release，保证同一 key 同时至多一个处理者
//! - **已处理记录**（MemoryStore 持久化）：has_been_handled / mark_handled，让重复扫描同一轮询窗口时保持幂等
//!
//! 单进程协作式调度下用互斥锁实现 test-and-set 即可；多进程部署需要换成共享存储上的 CAS。

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use crate::core::Result;
use crate::memory::MemoryStore;
use crate::platform::Post;

pub struct DedupMemoryGuard {
    in_flight: Mutex<HashSet<String>>,
    store: Arc<dyn MemoryStore>,
}

impl DedupMemoryGuard {
    pub fn new(store: Arc<dyn MemoryStore>) -> Self {
        Self {
            in_flight: Mutex::new(HashSet::new()),
            store,
        }
    }

    pub fn store(&self) -> &Arc<dyn MemoryStore> {
        &self.store
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.in_flight.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// key 空闲时标记为进行中并返回 true；否则返回 false 且不产生副作用
    pub fn try_acquire(&self, key: &str) -> bool {
        self.lock().insert(key.to_string())
    }

    /// 无条件移除 key
    pub fn release(&self, key: &str) {
        self.lock().remove(key);
    }

    /// try_acquire 的 RAII 版本：返回的守卫在 drop 时 release，任何退出路径都不会泄漏
    pub fn acquire(self: &Arc<Self>, key: &str) -> Option<InFlightGuard> {
        if self.try_acquire(key) {
            Some(InFlightGuard {
                owner: Arc::clone(self),
                key: key.to_string(),
            })
        } else {
            None
        }
    }

    pub fn is_in_flight(&self, key: &str) -> bool {
        self.lock().contains(key)
    }

    pub fn in_flight_count(&self) -> usize {
        self.lock().len()
    }

    pub async fn has_been_handled(&self, key: &str) -> Result<bool> {
        self.store.is_handled(key).await
    }

    pub async fn mark_handled(&self, key: &str) -> Result<()> {
        self.store.mark_handled(key).await
    }

    /// 已持久化的帖子记录；查询失败视为未缓存
    pub async fn cached_post(&self, id: &str) -> Option<Post> {
        match self.store.get_post(id).await {
            Ok(post) => post,
            Err(e) => {
                tracing::warn!(post_id = id, error = %e, "Memory lookup failed, treating as uncached");
                None
            }
        }
    }

    pub async fn remember_post(&self, post: &Post) -> Result<()> {
        self.store.save_post(post).await
    }
}

/// 持有期间 key 处于进行中状态
#[must_use = "dropping the guard releases the key immediately"]
pub struct InFlightGuard {
    owner: Arc<DedupMemoryGuard>,
    key: String,
}

impl InFlightGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.owner.release(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::LocalMemoryStore;

    fn guard() -> Arc<DedupMemoryGuard> {
        Arc::new(DedupMemoryGuard::new(Arc::new(LocalMemoryStore::in_memory())))
    }

    #[test]
    fn test_second_acquire_fails_until_release() {
        let g = guard();
        assert!(g.try_acquire("k"));
        assert!(!g.try_acquire("k"));
        assert!(g.try_acquire("other"));
        g.release("k");
        assert!(g.try_acquire("k"));
    }

    #[test]
    fn test_release_of_free_key_is_noop() {
        let g = guard();
        g.release("never");
        assert_eq!(g.in_flight_count(), 0);
    }

    #[test]
    fn test_interleaved_sequence_never_double_admits() {
        let g = guard();
        let keys = ["a", "b", "a", "c", "b", "a"];
        let mut held: HashSet<&str> = HashSet::new();
        for (step, key) in keys.iter().cycle().take(60).enumerate() {
            if step % 3 == 2 {
                g.release(key);
                held.remove(key);
                continue;
            }
            let admitted = g.try_acquire(key);
            assert_eq!(admitted, !held.contains(key), "step {step} key {key}");
            if admitted {
                held.insert(key);
            }
        }
    }

    #[test]
    fn test_raii_guard_releases_on_drop() {
        let g = guard();
        {
            let held = g.acquire("evt").unwrap();
            assert_eq!(held.key(), "evt");
            assert!(g.acquire("evt").is_none());
        }
        assert!(!g.is_in_flight("evt"));
    }

    #[tokio::test]
    async fn test_raii_guard_releases_on_panic() {
        let g = guard();
        let g2 = Arc::clone(&g);
        let result = tokio::spawn(async move {
            let _held = g2.acquire("boom").unwrap();
            panic!("handler exploded");
        })
        .await;
        assert!(result.is_err());
        assert!(!g.is_in_flight("boom"));
    }

    #[tokio::test]
    async fn test_handled_record_is_independent_of_in_flight() {
        let g = guard();
        assert!(!g.has_been_handled("m1").await.unwrap());
        g.mark_handled("m1").await.unwrap();
        assert!(g.has_been_handled("m1").await.unwrap());
        assert!(g.try_acquire("m1"));
    }
}
