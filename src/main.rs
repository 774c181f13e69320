//! Buzz - Rust 社交智能体
//!
//! 入口：初始化日志、加载配置、装配运行时，运行到收到关闭信号后执行清理。

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use buzz::config::load_config;
use buzz::core::{MemoryFlushCleanup, ShutdownCoordinator};
use buzz::{observability, BuzzRuntime};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    // 可选参数：配置文件路径
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let cfg = load_config(config_path).context("Failed to load config")?;
    if cfg.agent.dry_run {
        tracing::warn!("Dry run enabled, nothing will be posted");
    }

    let runtime = BuzzRuntime::from_config(&cfg).context("Failed to build runtime")?;
    let shutdown = Arc::clone(runtime.shutdown_manager());
    shutdown.install_signal_handlers();

    let mut coordinator = ShutdownCoordinator::new(Arc::clone(&shutdown)).with_timeout(10);
    coordinator.register(MemoryFlushCleanup::new(Arc::clone(runtime.store())));

    runtime.start();
    tracing::info!(handle = %cfg.agent.handle, "Buzz is running, press Ctrl+C to stop");

    shutdown.wait_for_shutdown().await;
    runtime.stop().await;
    coordinator.run_cleanup().await;

    Ok(())
}
