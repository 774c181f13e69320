//! 运行事件：循环调度、互动结果、实时连接与记录处理
//!
//! 通过 broadcast 通道发布，外部观察者订阅；没有订阅者时事件直接丢弃。

use serde::Serialize;
use tokio::sync::broadcast;

use crate::realtime::ConnectionState;

/// 单个运行事件（可序列化为 JSON）
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngagementEvent {
    LoopStarted { name: String },
    LoopFinished { name: String, ok: bool },
    /// 上一轮仍在执行或处于冷却期
    LoopSkipped { name: String, reason: String },
    PostPublished { post_id: String, dry_run: bool },
    ReplySent {
        in_reply_to: String,
        post_ids: Vec<String>,
        dry_run: bool,
    },
    ActionPerformed {
        post_id: String,
        action: String,
        dry_run: bool,
    },
    ItemSkipped { item_id: String, reason: String },
    ItemFailed { item_id: String, error: String },
    ConnectionChanged { state: ConnectionState },
    RecordProcessed { key: String },
    RecordFailed { key: String, error: String },
    /// 同一 key 已在处理中，本次投递被丢弃
    RecordDropped { key: String },
}

/// 事件总线；克隆共享同一通道
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngagementEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn emit(&self, event: EngagementEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngagementEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
