//! 错误类型
//!
//! 所有组件共用 BuzzError；is_transient() 区分「本轮放弃、下轮继续」的瞬时错误与其它错误。
//! 核心逻辑不会因任何错误终止进程：循环体 / 事件处理器在各自边界捕获并转为日志与事件。

use thiserror::Error;

/// 社交智能体运行过程中的错误（网络、平台、判定响应、连接、缺字段等）
#[derive(Error, Debug)]
pub enum BuzzError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Network timeout")]
    NetworkTimeout,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("Platform error ({status}): {message}")]
    Platform { status: u16, message: String },

    /// 外部判定 / 分析服务返回了无法解析的内容
    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    #[error("LLM error: {0}")]
    Llm(String),

    #[error("Connection error: {0}")]
    Connection(String),

    /// 入站数据缺少必需的标识字段（如 id）
    #[error("Missing field: {0}")]
    MissingField(&'static str),

    #[error("Request queue closed")]
    QueueClosed,

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl BuzzError {
    /// 瞬时网络 / 平台错误：当前迭代提前结束，下一次调度不受影响
    pub fn is_transient(&self) -> bool {
        match self {
            BuzzError::Network(_)
            | BuzzError::NetworkTimeout
            | BuzzError::RateLimited { .. }
            | BuzzError::Connection(_) => true,
            BuzzError::Platform { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for BuzzError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            return BuzzError::NetworkTimeout;
        }
        match e.status() {
            Some(status) if status.as_u16() == 404 => BuzzError::NotFound(e.to_string()),
            Some(status) => BuzzError::Platform {
                status: status.as_u16(),
                message: e.to_string(),
            },
            None => BuzzError::Network(e.to_string()),
        }
    }
}

impl From<config::ConfigError> for BuzzError {
    fn from(e: config::ConfigError) -> Self {
        BuzzError::Config(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, BuzzError>;
