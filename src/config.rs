//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `BUZZ__*` 覆盖（双下划线表示嵌套，如 `BUZZ__AGENT__DRY_RUN=true`）。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub agent: AgentSection,
    pub llm: LlmSection,
    pub platform: PlatformSection,
    pub queue: QueueSection,
    pub thread: ThreadSection,
    pub scheduler: SchedulerSection,
    pub realtime: RealtimeSection,
    pub memory: MemorySection,
}

/// [agent] 段：身份、干跑、发帖长度、搜索目标、停止词
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    /// 智能体自身的账号 handle（不含 @）
    pub handle: String,
    /// 干跑：所有写操作只记录日志与事件，不真正发送
    pub dry_run: bool,
    /// 单条帖子最大字符数，超出时拆成回复链
    pub max_post_length: usize,
    /// 搜索互动循环额外关注的账号
    pub target_users: Vec<String>,
    /// 搜索互动循环使用的话题
    pub search_topics: Vec<String>,
    /// 出现即不强制回复的关键词（大小写不敏感）
    pub stop_keywords: Vec<String>,
    /// 调试产物目录（最近抓取快照、逐条处理记录）
    pub artifacts_dir: Option<PathBuf>,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            handle: "buzz".to_string(),
            dry_run: false,
            max_post_length: 280,
            target_users: Vec::new(),
            search_topics: Vec::new(),
            stop_keywords: vec!["stop".into(), "unsubscribe".into(), "leave me alone".into()],
            artifacts_dir: None,
        }
    }
}

/// [llm] 段：判定 / 生成服务
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    /// openai / mock
    pub provider: String,
    pub model: String,
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    /// 单次请求超时（秒）
    pub request_timeout_secs: u64,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            model: "gpt-4o-mini".to_string(),
            base_url: None,
            api_key: None,
            request_timeout_secs: 60,
        }
    }
}

/// [platform] 段：平台 REST 桥接
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PlatformSection {
    pub base_url: String,
    pub api_token: Option<String>,
    pub request_timeout_secs: u64,
}

impl Default for PlatformSection {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8787".to_string(),
            api_token: None,
            request_timeout_secs: 30,
        }
    }
}

/// [queue] 段：出站请求并发与节流
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueSection {
    /// 1 = 严格 FIFO 串行；>1 时任务间不保证顺序
    pub concurrency: usize,
    /// 相邻两个任务启动之间的最小间隔（毫秒）
    pub min_spacing_ms: u64,
    /// 在最小间隔上叠加的随机抖动上限（毫秒）
    pub jitter_ms: u64,
}

impl Default for QueueSection {
    fn default() -> Self {
        Self {
            concurrency: 1,
            min_spacing_ms: 1500,
            jitter_ms: 2000,
        }
    }
}

/// [thread] 段：会话线程重建
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ThreadSection {
    pub max_depth: usize,
}

impl Default for ThreadSection {
    fn default() -> Self {
        Self { max_depth: 10 }
    }
}

/// 单个定时循环的配置；只覆盖部分键时其余取默认值
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoopSection {
    pub enabled: bool,
    pub min_interval_secs: u64,
    pub max_interval_secs: u64,
    /// 两次成功完成之间的最小间隔；None 表示不限制
    pub cooldown_secs: Option<u64>,
}

impl Default for LoopSection {
    fn default() -> Self {
        Self::new(15 * 60, 30 * 60, None)
    }
}

impl LoopSection {
    fn new(min: u64, max: u64, cooldown_secs: Option<u64>) -> Self {
        Self {
            enabled: true,
            min_interval_secs: min,
            max_interval_secs: max,
            cooldown_secs,
        }
    }

    pub fn min_interval(&self) -> Duration {
        Duration::from_secs(self.min_interval_secs)
    }

    pub fn max_interval(&self) -> Duration {
        Duration::from_secs(self.max_interval_secs.max(self.min_interval_secs))
    }

    pub fn cooldown(&self) -> Option<Duration> {
        self.cooldown_secs.map(Duration::from_secs)
    }
}

/// [scheduler] 段：四个独立定时循环
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerSection {
    pub posting: LoopSection,
    pub search: LoopSection,
    pub interactions: LoopSection,
    pub timeline: LoopSection,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            posting: LoopSection::new(90 * 60, 180 * 60, None),
            search: LoopSection::new(60 * 60, 120 * 60, None),
            interactions: LoopSection::new(2 * 60, 5 * 60, None),
            timeline: LoopSection::new(15 * 60, 30 * 60, Some(10 * 60)),
        }
    }
}

/// 重连退避策略
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    #[default]
    Flat,
    Exponential,
}

/// [realtime] 段：实时事件源订阅
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RealtimeSection {
    pub enabled: bool,
    pub url: String,
    pub api_key: Option<String>,
    pub topic: String,
    pub schema: String,
    pub table: String,
    pub heartbeat_secs: u64,
    pub backoff: BackoffKind,
    pub reconnect_delay_secs: u64,
    pub max_reconnect_delay_secs: u64,
}

impl Default for RealtimeSection {
    fn default() -> Self {
        Self {
            enabled: false,
            url: "ws://127.0.0.1:4000/realtime/v1/websocket".to_string(),
            api_key: None,
            topic: "realtime:public:events".to_string(),
            schema: "public".to_string(),
            table: "events".to_string(),
            heartbeat_secs: 30,
            backoff: BackoffKind::Flat,
            reconnect_delay_secs: 5,
            max_reconnect_delay_secs: 300,
        }
    }
}

/// [memory] 段：持久化存储位置；未设置时仅存于内存
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MemorySection {
    pub path: Option<PathBuf>,
    /// 帖子缓存上限，超出后淘汰最早写入的帖子
    pub max_cached_posts: usize,
}

impl Default for MemorySection {
    fn default() -> Self {
        Self {
            path: None,
            max_cached_posts: crate::memory::store::DEFAULT_MAX_CACHED_POSTS,
        }
    }
}

/// 从 config 目录加载配置，环境变量 BUZZ__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 BUZZ__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("BUZZ")
            .separator("__")
            .list_separator(",")
            .with_list_parse_key("agent.target_users")
            .with_list_parse_key("agent.search_topics")
            .with_list_parse_key("agent.stop_keywords")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
