//! 出站请求队列：串行化并节流所有平台调用
//!
//! 任务按入队顺序取出，由 Semaphore 限制同时执行数（默认 1，即严格 FIFO）。
//! 相邻两次任务启动之间至少间隔 min_spacing + 随机抖动，避免触发平台限流。
//! 任务失败只返回给该任务的调用方，队列继续执行后续任务；队列本身不做重试。

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::time::Instant;

use crate::config::QueueSection;
use crate::core::{BuzzError, Result};

type Job = Pin<Box<dyn Future<Output = ()> + Send>>;

/// 队列参数
#[derive(Debug, Clone, Copy)]
pub struct QueueLimits {
    /// 同时执行的任务数；>1 时任务之间不保证完成顺序
    pub concurrency: usize,
    pub min_spacing: Duration,
    pub jitter: Duration,
}

impl QueueLimits {
    /// 不节流的串行队列（测试常用）
    pub fn serial() -> Self {
        Self {
            concurrency: 1,
            min_spacing: Duration::ZERO,
            jitter: Duration::ZERO,
        }
    }

    fn spacing(&self) -> Duration {
        if self.jitter.is_zero() {
            return self.min_spacing;
        }
        let extra = rand::thread_rng().gen_range(0..=self.jitter.as_millis() as u64);
        self.min_spacing + Duration::from_millis(extra)
    }
}

impl From<&QueueSection> for QueueLimits {
    fn from(section: &QueueSection) -> Self {
        Self {
            concurrency: section.concurrency.max(1),
            min_spacing: Duration::from_millis(section.min_spacing_ms),
            jitter: Duration::from_millis(section.jitter_ms),
        }
    }
}

/// 请求队列：enqueue 返回该任务自己的结果
pub struct RequestQueue {
    tx: mpsc::UnboundedSender<Job>,
    pending: Arc<AtomicUsize>,
    limits: QueueLimits,
}

impl RequestQueue {
    /// 创建队列并在当前 tokio 运行时中启动执行器
    pub fn new(limits: QueueLimits) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_worker(rx, limits));
        Self {
            tx,
            pending: Arc::new(AtomicUsize::new(0)),
            limits,
        }
    }

    /// 已入队但尚未完成的任务数
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// 入队一个出站操作，等待它执行完毕并返回其结果
    pub async fn enqueue<T, F, Fut>(&self, task: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let (done_tx, done_rx) = oneshot::channel();
        let pending = Arc::clone(&self.pending);
        pending.fetch_add(1, Ordering::SeqCst);

        let job: Job = Box::pin(async move {
            let result = task().await;
            pending.fetch_sub(1, Ordering::SeqCst);
            let _ = done_tx.send(result);
        });

        if self.tx.send(job).is_err() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            return Err(BuzzError::QueueClosed);
        }

        done_rx.await.map_err(|_| BuzzError::QueueClosed)?
    }
}

async fn run_worker(mut rx: mpsc::UnboundedReceiver<Job>, limits: QueueLimits) {
    let semaphore = Arc::new(Semaphore::new(limits.concurrency.max(1)));
    let mut last_start: Option<Instant> = None;

    while let Some(job) = rx.recv().await {
        let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
            break;
        };

        if let Some(last) = last_start {
            let spacing = limits.spacing();
            let elapsed = last.elapsed();
            if elapsed < spacing {
                tokio::time::sleep(spacing - elapsed).await;
            }
        }
        last_start = Some(Instant::now());

        // 每个任务在独立 task 中执行：panic 只影响该任务（调用方收到 QueueClosed）
        tokio::spawn(async move {
            let _permit = permit;
            job.await;
        });
    }

    tracing::debug!("Request queue worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[tokio::test]
    async fn test_fifo_order_with_single_slot() {
        let queue = Arc::new(RequestQueue::new(QueueLimits::serial()));
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for i in 0..5u64 {
            let queue = Arc::clone(&queue);
            let order = Arc::clone(&order);
            handles.push(tokio::spawn(async move {
                queue
                    .enqueue(move || async move {
                        // 越早入队睡得越久：若并发执行则顺序会被打乱
                        tokio::time::sleep(Duration::from_millis(25 - i * 5)).await;
                        order.lock().unwrap().push(i);
                        Ok(i)
                    })
                    .await
            }));
            // 保证入队顺序
            tokio::task::yield_now().await;
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        for (i, handle) in handles.into_iter().enumerate() {
            assert_eq!(handle.await.unwrap().unwrap(), i as u64);
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_failure_is_isolated_to_its_caller() {
        let queue = RequestQueue::new(QueueLimits::serial());

        let failed: Result<u32> = queue
            .enqueue(|| async { Err(BuzzError::Network("boom".into())) })
            .await;
        assert!(matches!(failed, Err(BuzzError::Network(_))));

        let ok = queue.enqueue(|| async { Ok(7u32) }).await.unwrap();
        assert_eq!(ok, 7);
        assert_eq!(queue.pending(), 0);
    }

    #[tokio::test]
    async fn test_bounded_concurrency() {
        let queue = Arc::new(RequestQueue::new(QueueLimits {
            concurrency: 2,
            min_spacing: Duration::ZERO,
            jitter: Duration::ZERO,
        }));
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..6 {
            let queue = Arc::clone(&queue);
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            handles.push(tokio::spawn(async move {
                queue
                    .enqueue(move || async move {
                        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        running.fetch_sub(1, Ordering::SeqCst);
                        Ok(())
                    })
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_spacing_between_task_starts() {
        let queue = RequestQueue::new(QueueLimits {
            concurrency: 1,
            min_spacing: Duration::from_secs(2),
            jitter: Duration::ZERO,
        });
        let start = Instant::now();
        queue.enqueue(|| async { Ok(()) }).await.unwrap();
        queue.enqueue(|| async { Ok(()) }).await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(2));
    }
}
