//! Buzz - Rust 社交智能体
//!
//! 模块划分：
//! - **agent**: 四个定时循环的循环体（发帖、搜索互动、提及轮询、时间线动作）
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误、出站请求队列、循环调度器、优雅关闭
//! - **engagement**: 会话线程重建、回复判定、提示词渲染
//! - **events**: 运行事件广播
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / 脚本化 Mock）
//! - **memory**: 去重守卫、持久化记忆存储、调试产物
//! - **platform**: 社交平台客户端（HTTP / 内存）与排队封装
//! - **realtime**: 实时事件订阅、心跳、重连与按 key 分发
//! - **runtime**: 进程级装配与启停

pub mod agent;
pub mod config;
pub mod core;
pub mod engagement;
pub mod events;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod platform;
pub mod realtime;
pub mod runtime;

pub use core::{BuzzError, Result};
pub use runtime::{BuzzRuntime, RuntimeParts};
