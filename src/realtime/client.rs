//! 实时事件接入客户端
//!
//! 状态机：Disconnected → Connecting → Connected → (关闭 / 出错) → Disconnected → (退避) → Connecting …
//! 连上后立即发送 join 订阅，并按固定周期发送心跳；心跳发送失败即视为断线。
//! 入站变更经过滤后按 key 交给 RecordHandler，同一 key 同时只有一个处理者，重复投递直接丢弃。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::handler::RecordHandler;
use super::protocol::{extract_change, ChangeRecord, OutboundFrame};
use super::transport::{Connection, Transport};
use crate::config::{BackoffKind, RealtimeSection};
use crate::core::{BuzzError, Result};
use crate::events::{EngagementEvent, EventBus};
use crate::memory::DedupMemoryGuard;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// 重连退避
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// 每次等待相同时长
    Flat { delay: Duration },
    /// base * 2^(n-1)，不超过 max；成功连上后从头计
    Exponential { base: Duration, max: Duration },
}

impl Backoff {
    pub fn from_section(section: &RealtimeSection) -> Self {
        let delay = Duration::from_secs(section.reconnect_delay_secs);
        match section.backoff {
            BackoffKind::Flat => Backoff::Flat { delay },
            BackoffKind::Exponential => Backoff::Exponential {
                base: delay,
                max: Duration::from_secs(section.max_reconnect_delay_secs).max(delay),
            },
        }
    }

    /// 第 attempt 次（从 1 开始）连续失败后的等待时长
    pub fn delay(&self, attempt: u32) -> Duration {
        match *self {
            Backoff::Flat { delay } => delay,
            Backoff::Exponential { base, max } => {
                let exp = attempt.saturating_sub(1).min(16);
                base.saturating_mul(1u32 << exp).min(max)
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct RealtimeOptions {
    pub url: String,
    pub topic: String,
    pub schema: String,
    pub table: String,
    pub heartbeat: Duration,
    pub backoff: Backoff,
}

impl RealtimeOptions {
    pub fn from_section(section: &RealtimeSection) -> Self {
        let url = match &section.api_key {
            Some(key) => {
                let sep = if section.url.contains('?') { '&' } else { '?' };
                format!("{}{sep}apikey={key}&vsn=1.0.0", section.url)
            }
            None => section.url.clone(),
        };
        Self {
            url,
            topic: section.topic.clone(),
            schema: section.schema.clone(),
            table: section.table.clone(),
            heartbeat: Duration::from_secs(section.heartbeat_secs.max(1)),
            backoff: Backoff::from_section(section),
        }
    }
}

enum SessionEnd {
    Cancelled,
    Lost(String),
}

pub struct RealtimeIngestionClient {
    options: RealtimeOptions,
    transport: Arc<dyn Transport>,
    guard: Arc<DedupMemoryGuard>,
    handler: Arc<dyn RecordHandler>,
    events: EventBus,
    state_tx: watch::Sender<ConnectionState>,
    next_ref: AtomicU64,
}

impl RealtimeIngestionClient {
    pub fn new(
        options: RealtimeOptions,
        transport: Arc<dyn Transport>,
        guard: Arc<DedupMemoryGuard>,
        handler: Arc<dyn RecordHandler>,
        events: EventBus,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            options,
            transport,
            guard,
            handler,
            events,
            state_tx,
            next_ref: AtomicU64::new(1),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            tracing::info!(?state, "Realtime connection state changed");
            self.events
                .emit(EngagementEvent::ConnectionChanged { state });
        }
    }

    /// 连接 / 重连循环，直到 token 被取消
    pub async fn run(self: Arc<Self>, token: CancellationToken) {
        let mut failures: u32 = 0;

        loop {
            self.set_state(ConnectionState::Connecting);
            let connected = tokio::select! {
                _ = token.cancelled() => break,
                result = self.transport.connect(&self.options.url) => result,
            };

            match connected {
                Ok(conn) => {
                    self.set_state(ConnectionState::Connected);
                    failures = 0;
                    match self.session(conn, &token).await {
                        SessionEnd::Cancelled => break,
                        SessionEnd::Lost(reason) => {
                            tracing::warn!(%reason, "Realtime connection lost");
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Realtime connect failed");
                }
            }

            self.set_state(ConnectionState::Disconnected);
            failures = failures.saturating_add(1);
            let delay = self.options.backoff.delay(failures);
            tracing::info!(delay_ms = delay.as_millis() as u64, attempt = failures, "Scheduling reconnect");
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.set_state(ConnectionState::Disconnected);
        tracing::info!("Realtime ingestion stopped");
    }

    async fn session(&self, mut conn: Box<dyn Connection>, token: &CancellationToken) -> SessionEnd {
        let reference = self.next_ref.fetch_add(1, Ordering::Relaxed);
        let join = OutboundFrame::join(
            &self.options.topic,
            &self.options.schema,
            &self.options.table,
            reference,
        );
        if let Err(e) = send_frame(conn.as_mut(), &join).await {
            return SessionEnd::Lost(format!("join failed: {e}"));
        }
        tracing::info!(topic = %self.options.topic, table = %self.options.table, "Subscribed to realtime changes");

        let period = self.options.heartbeat;
        let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);

        loop {
            tokio::select! {
                _ = token.cancelled() => return SessionEnd::Cancelled,
                _ = heartbeat.tick() => {
                    if let Err(e) = send_frame(conn.as_mut(), &OutboundFrame::Heartbeat).await {
                        return SessionEnd::Lost(format!("heartbeat failed: {e}"));
                    }
                    tracing::trace!("Heartbeat sent");
                }
                frame = conn.recv() => match frame {
                    None => return SessionEnd::Lost("closed by server".into()),
                    Some(Err(e)) => return SessionEnd::Lost(e.to_string()),
                    Some(Ok(text)) => self.dispatch(&text),
                },
            }
        }
    }

    fn dispatch(&self, text: &str) {
        match extract_change(text) {
            Ok(Some(change)) => self.dispatch_change(change),
            Ok(None) => tracing::trace!("Ignoring non-forwarded frame"),
            Err(BuzzError::MissingField(field)) => {
                tracing::warn!(field, "Change record without identifier, discarding");
            }
            Err(e) => tracing::warn!(error = %e, "Unparsable realtime frame, discarding"),
        }
    }

    fn dispatch_change(&self, change: ChangeRecord) {
        let key = change.key();
        let Some(held) = self.guard.acquire(&key) else {
            tracing::debug!(%key, "Record already in flight, dropping delivery");
            self.events.emit(EngagementEvent::RecordDropped { key });
            return;
        };

        let handler = Arc::clone(&self.handler);
        let events = self.events.clone();
        tokio::spawn(async move {
            let _held = held;
            match handler.handle(&change).await {
                Ok(()) => events.emit(EngagementEvent::RecordProcessed { key }),
                Err(e) => {
                    tracing::warn!(%key, error = %e, "Record handler failed");
                    events.emit(EngagementEvent::RecordFailed {
                        key,
                        error: e.to_string(),
                    });
                }
            }
        });
    }
}

async fn send_frame(conn: &mut dyn Connection, frame: &OutboundFrame) -> Result<()> {
    conn.send(frame.to_text()?).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::LocalMemoryStore;
    use crate::realtime::transport::{ChannelTransport, ServerEnd};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;
    use tokio::sync::{mpsc, Notify};

    #[derive(Default)]
    struct Recording {
        seen: Mutex<Vec<String>>,
        gate: Option<Arc<Notify>>,
        fail: bool,
    }

    #[async_trait]
    impl RecordHandler for Recording {
        async fn handle(&self, change: &ChangeRecord) -> Result<()> {
            self.seen
                .lock()
                .unwrap()
                .push(change.id.clone());
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            if self.fail {
                return Err(BuzzError::MalformedResponse("bad analysis".into()));
            }
            Ok(())
        }
    }

    struct Harness {
        client: Arc<RealtimeIngestionClient>,
        transport: Arc<ChannelTransport>,
        accept: mpsc::UnboundedReceiver<ServerEnd>,
        guard: Arc<DedupMemoryGuard>,
        events: EventBus,
        token: CancellationToken,
    }

    fn options() -> RealtimeOptions {
        RealtimeOptions {
            url: "ws://test".into(),
            topic: "realtime:public:documents".into(),
            schema: "public".into(),
            table: "documents".into(),
            heartbeat: Duration::from_secs(30),
            backoff: Backoff::Flat {
                delay: Duration::from_secs(5),
            },
        }
    }

    fn harness(handler: Arc<dyn RecordHandler>) -> Harness {
        let (transport, accept) = ChannelTransport::new();
        let transport = Arc::new(transport);
        let guard = Arc::new(DedupMemoryGuard::new(Arc::new(LocalMemoryStore::in_memory())));
        let events = EventBus::default();
        let client = Arc::new(RealtimeIngestionClient::new(
            options(),
            transport.clone(),
            guard.clone(),
            handler,
            events.clone(),
        ));
        Harness {
            client,
            transport,
            accept,
            guard,
            events,
            token: CancellationToken::new(),
        }
    }

    impl Harness {
        fn start(&self) -> tokio::task::JoinHandle<()> {
            tokio::spawn(Arc::clone(&self.client).run(self.token.clone()))
        }

        async fn accept(&mut self) -> ServerEnd {
            let mut server = self.accept.recv().await.unwrap();
            let join = server.next_sent().await.unwrap();
            assert!(join.contains("\"type\":\"join\""));
            server
        }
    }

    fn completed(id: &str) -> String {
        update(id, "completed")
    }

    fn update(id: &str, stage: &str) -> String {
        json!({
            "event": "postgres_changes",
            "payload": {"data": {
                "type": "UPDATE",
                "table": "documents",
                "schema": "public",
                "record": {"id": id, "processing_stage": stage},
                "old_record": {},
                "commit_timestamp": "2024-05-01T10:00:00Z"
            }}
        })
        .to_string()
    }

    async fn wait_for(rx: &mut tokio::sync::broadcast::Receiver<EngagementEvent>, want: &EngagementEvent) {
        loop {
            if &rx.recv().await.unwrap() == want {
                return;
            }
        }
    }

    fn states(rx: &mut tokio::sync::broadcast::Receiver<EngagementEvent>) -> Vec<ConnectionState> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let EngagementEvent::ConnectionChanged { state } = event {
                out.push(state);
            }
        }
        out
    }

    #[test]
    fn test_backoff_delays() {
        let flat = Backoff::Flat {
            delay: Duration::from_secs(5),
        };
        assert_eq!(flat.delay(1), Duration::from_secs(5));
        assert_eq!(flat.delay(50), Duration::from_secs(5));

        let exp = Backoff::Exponential {
            base: Duration::from_secs(5),
            max: Duration::from_secs(60),
        };
        assert_eq!(exp.delay(1), Duration::from_secs(5));
        assert_eq!(exp.delay(2), Duration::from_secs(10));
        assert_eq!(exp.delay(4), Duration::from_secs(40));
        assert_eq!(exp.delay(5), Duration::from_secs(60));
        assert_eq!(exp.delay(u32::MAX), Duration::from_secs(60));
    }

    #[test]
    fn test_options_append_api_key() {
        let section = RealtimeSection {
            api_key: Some("k".into()),
            ..RealtimeSection::default()
        };
        let opts = RealtimeOptions::from_section(&section);
        assert!(opts.url.ends_with("?apikey=k&vsn=1.0.0"));
        assert_eq!(opts.backoff, Backoff::Flat { delay: Duration::from_secs(5) });
    }

    #[tokio::test(start_paused = true)]
    async fn test_state_transitions_and_reconnect_after_backoff() {
        let mut h = harness(Arc::new(Recording::default()));
        let mut rx = h.events.subscribe();
        let task = h.start();

        let server = h.accept().await;
        assert_eq!(h.client.state(), ConnectionState::Connected);
        assert_eq!(
            states(&mut rx),
            vec![ConnectionState::Connecting, ConnectionState::Connected]
        );

        let closed_at = Instant::now();
        server.close();
        let _server = h.accept().await;
        assert!(closed_at.elapsed() >= Duration::from_secs(5));
        assert_eq!(
            states(&mut rx),
            vec![
                ConnectionState::Disconnected,
                ConnectionState::Connecting,
                ConnectionState::Connected
            ]
        );
        assert_eq!(h.transport.attempts(), 2);

        h.token.cancel();
        task.await.unwrap();
        assert_eq!(h.client.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refused_connects_retry_with_flat_backoff() {
        let mut h = harness(Arc::new(Recording::default()));
        h.transport.refuse_next(2);
        let started = Instant::now();
        let task = h.start();

        let _server = h.accept().await;
        assert_eq!(h.transport.attempts(), 3);
        assert!(started.elapsed() >= Duration::from_secs(10));

        h.token.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_sent_on_period() {
        let mut h = harness(Arc::new(Recording::default()));
        let task = h.start();
        let mut server = h.accept().await;

        tokio::time::sleep(Duration::from_secs(61)).await;
        let sent = server.drain_sent();
        assert_eq!(sent, vec![r#"{"type":"heartbeat"}"#; 2]);

        h.token.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_failure_disconnects() {
        let mut h = harness(Arc::new(Recording::default()));
        let mut state = h.client.watch_state();
        let task = h.start();
        let mut server = h.accept().await;

        server.stop_reading();
        state
            .wait_for(|s| *s == ConnectionState::Disconnected)
            .await
            .unwrap();
        assert!(!server.push(completed("1")));

        h.token.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_duplicate_key_runs_once_while_in_flight() {
        let gate = Arc::new(Notify::new());
        let handler = Arc::new(Recording {
            gate: Some(gate.clone()),
            ..Recording::default()
        });
        let mut h = harness(handler.clone());
        let mut rx = h.events.subscribe();
        let task = h.start();
        let server = h.accept().await;

        server.push(completed("42"));
        server.push(completed("42"));
        wait_for(&mut rx, &EngagementEvent::RecordDropped { key: "documents:42".into() }).await;
        assert!(h.guard.is_in_flight("documents:42"));
        while handler.seen.lock().unwrap().is_empty() {
            tokio::task::yield_now().await;
        }
        assert_eq!(handler.seen.lock().unwrap().len(), 1);

        gate.notify_one();
        wait_for(&mut rx, &EngagementEvent::RecordProcessed { key: "documents:42".into() }).await;
        assert!(!h.guard.is_in_flight("documents:42"));

        server.push(completed("42"));
        gate.notify_one();
        wait_for(&mut rx, &EngagementEvent::RecordProcessed { key: "documents:42".into() }).await;
        assert_eq!(handler.seen.lock().unwrap().len(), 2);

        h.token.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_only_completed_stage_is_forwarded() {
        let handler = Arc::new(Recording::default());
        let mut h = harness(handler.clone());
        let mut rx = h.events.subscribe();
        let task = h.start();
        let server = h.accept().await;

        server.push(update("1", "processing"));
        server.push(r#"{"event":"postgres_changes","payload":{"data":{"type":"UPDATE","record":{"processing_stage":"completed"}}}}"#);
        server.push("garbage");
        server.push(completed("2"));
        wait_for(&mut rx, &EngagementEvent::RecordProcessed { key: "documents:2".into() }).await;
        assert_eq!(*handler.seen.lock().unwrap(), vec!["2".to_string()]);
        assert_eq!(h.client.state(), ConnectionState::Connected);

        h.token.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_handler_failure_is_reported_and_key_released() {
        let handler = Arc::new(Recording {
            fail: true,
            ..Recording::default()
        });
        let mut h = harness(handler);
        let mut rx = h.events.subscribe();
        let task = h.start();
        let server = h.accept().await;

        server.push(completed("9"));
        loop {
            if let EngagementEvent::RecordFailed { key, error } = rx.recv().await.unwrap() {
                assert_eq!(key, "documents:9");
                assert!(error.contains("bad analysis"));
                break;
            }
        }
        tokio::task::yield_now().await;
        assert!(!h.guard.is_in_flight("documents:9"));
        assert_eq!(h.client.state(), ConnectionState::Connected);

        h.token.cancel();
        task.await.unwrap();
    }
}
