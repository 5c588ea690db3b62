//! 可观测性：tracing-subscriber 初始化
//!
//! RUST_LOG 优先；未设置时默认 info，`agent.verbose = true` 时默认 debug。

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::AgentSection;

pub fn default_directive(agent: &AgentSection) -> &'static str {
    if agent.verbose {
        "debug"
    } else {
        "info"
    }
}

/// 只应在进程入口调用一次；重复调用时忽略
pub fn init(agent: &AgentSection) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(agent)));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .try_init();
}
