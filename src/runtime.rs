//! 进程级运行时：按配置装配全部组件
//!
//! 每个进程一个实例，由启动代码显式创建并传递，不存在全局单例。
//! start() 布置所有启用的循环并建立实时连接，重复调用只记警告；
//! stop() 取消全部定时器与连接，已发出的请求自然完成。

use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::agent::{AgentLoop, AgentSettings, EngagementAgent, LoopKind};
use crate::config::{AppConfig, LoopSection};
use crate::core::{
    EngagementScheduler, LoopSpec, QueueLimits, RequestQueue, Result, RunOutcome, ShutdownManager,
};
use crate::engagement::{ConversationThreadResolver, ResponseDecisionPipeline, StopKeywords};
use crate::events::{EngagementEvent, EventBus};
use crate::llm::{create_llm_from_config, LlmClient};
use crate::memory::{ArtifactWriter, DedupMemoryGuard, LocalMemoryStore, MemoryStore};
use crate::platform::{HttpPlatformClient, PlatformClient, QueuedPlatform};
use crate::realtime::{
    AnalysisHandler, ConnectionState, RealtimeIngestionClient, RealtimeOptions, Transport,
    WebSocketTransport,
};

/// 可替换的外部依赖；测试中注入内存实现
pub struct RuntimeParts {
    pub platform: Arc<dyn PlatformClient>,
    pub llm: Arc<dyn LlmClient>,
    pub store: Arc<dyn MemoryStore>,
    /// None 时不建立实时连接
    pub transport: Option<Arc<dyn Transport>>,
}

impl RuntimeParts {
    /// 真实客户端：HTTP 平台、OpenAI 兼容 LLM、JSON 文件（或内存）存储、WebSocket
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let store = match &config.memory.path {
            Some(path) => LocalMemoryStore::open(path)?,
            None => LocalMemoryStore::in_memory(),
        };
        let store: Arc<dyn MemoryStore> =
            Arc::new(store.with_max_cached_posts(config.memory.max_cached_posts));
        let transport: Option<Arc<dyn Transport>> = if config.realtime.enabled {
            Some(Arc::new(WebSocketTransport))
        } else {
            None
        };
        Ok(Self {
            platform: Arc::new(HttpPlatformClient::from_config(&config.platform)?),
            llm: create_llm_from_config(&config.llm),
            store,
            transport,
        })
    }
}

#[derive(Default)]
struct RunState {
    token: Option<CancellationToken>,
    ingestion_task: Option<JoinHandle<()>>,
}

pub struct BuzzRuntime {
    events: EventBus,
    store: Arc<dyn MemoryStore>,
    guard: Arc<DedupMemoryGuard>,
    scheduler: EngagementScheduler,
    ingestion: Option<Arc<RealtimeIngestionClient>>,
    shutdown: Arc<ShutdownManager>,
    state: Mutex<RunState>,
}

impl BuzzRuntime {
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let parts = RuntimeParts::from_config(config)?;
        Self::with_parts(config, parts)
    }

    /// 必须在 tokio 运行时内调用（请求队列会启动工作任务）
    pub fn with_parts(config: &AppConfig, parts: RuntimeParts) -> Result<Self> {
        let events = EventBus::default();
        let guard = Arc::new(DedupMemoryGuard::new(Arc::clone(&parts.store)));

        let limits = QueueLimits::from(&config.queue);
        if limits.concurrency > 1 {
            tracing::warn!(
                concurrency = limits.concurrency,
                "Outbound queue runs with concurrency > 1, request order is not guaranteed"
            );
        }
        let queue = Arc::new(RequestQueue::new(limits));
        let platform = QueuedPlatform::new(queue, parts.platform);

        let resolver = ConversationThreadResolver::new(
            platform.clone(),
            Arc::clone(&guard),
            config.thread.max_depth,
        );
        let pipeline = ResponseDecisionPipeline::new(
            Arc::clone(&parts.llm),
            StopKeywords::new(&config.agent.stop_keywords)?,
        );
        let agent = Arc::new(EngagementAgent::new(
            AgentSettings::from_config(config),
            platform,
            Arc::clone(&guard),
            resolver,
            pipeline,
            ArtifactWriter::new(config.agent.artifacts_dir.clone()),
            events.clone(),
        ));

        let mut scheduler = EngagementScheduler::new(events.clone());
        for kind in LoopKind::ALL {
            let section = loop_section(config, kind);
            if !section.enabled {
                tracing::info!(loop_name = kind.name(), "Loop disabled by config");
                continue;
            }
            scheduler.register(
                LoopSpec::from_section(kind.name(), section),
                Arc::new(AgentLoop::new(Arc::clone(&agent), kind)),
            );
        }

        let ingestion = parts.transport.map(|transport| {
            let handler = Arc::new(AnalysisHandler::new(
                Arc::clone(&parts.llm),
                Arc::clone(&parts.store),
            ));
            Arc::new(RealtimeIngestionClient::new(
                RealtimeOptions::from_section(&config.realtime),
                transport,
                Arc::clone(&guard),
                handler,
                events.clone(),
            ))
        });

        Ok(Self {
            events,
            store: parts.store,
            guard,
            scheduler,
            ingestion,
            shutdown: Arc::new(ShutdownManager::new()),
            state: Mutex::new(RunState::default()),
        })
    }

    /// 布置定时循环并建立实时连接；已启动时为空操作，返回 false
    pub fn start(&self) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.token.is_some() {
            tracing::warn!("Runtime already started, ignoring start()");
            return false;
        }

        let token = self.shutdown.token().child_token();
        self.scheduler.start(&token);
        if let Some(client) = &self.ingestion {
            state.ingestion_task = Some(tokio::spawn(Arc::clone(client).run(token.clone())));
        }
        state.token = Some(token);
        tracing::info!(
            loops = ?self.scheduler.loop_names(),
            realtime = self.ingestion.is_some(),
            "Runtime started"
        );
        true
    }

    /// 取消所有定时器并断开实时连接；未启动时为空操作
    pub async fn stop(&self) {
        let (token, task) = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            (state.token.take(), state.ingestion_task.take())
        };
        let Some(token) = token else {
            return;
        };
        token.cancel();
        self.scheduler.stop();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Ingestion task ended abnormally");
            }
        }
        tracing::info!("Runtime stopped");
    }

    pub fn is_started(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .token
            .is_some()
    }

    /// 立即执行一次指定循环
    pub async fn trigger(&self, name: &str) -> Option<RunOutcome> {
        self.scheduler.trigger(name).await
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<EngagementEvent> {
        self.events.subscribe()
    }

    pub fn scheduler(&self) -> &EngagementScheduler {
        &self.scheduler
    }

    pub fn guard(&self) -> &Arc<DedupMemoryGuard> {
        &self.guard
    }

    pub fn store(&self) -> &Arc<dyn MemoryStore> {
        &self.store
    }

    pub fn shutdown_manager(&self) -> &Arc<ShutdownManager> {
        &self.shutdown
    }

    pub fn connection_state(&self) -> Option<ConnectionState> {
        self.ingestion.as_ref().map(|client| client.state())
    }
}

fn loop_section(config: &AppConfig, kind: LoopKind) -> &LoopSection {
    match kind {
        LoopKind::Posting => &config.scheduler.posting,
        LoopKind::Search => &config.scheduler.search,
        LoopKind::Interactions => &config.scheduler.interactions,
        LoopKind::Timeline => &config.scheduler.timeline,
    }
}
