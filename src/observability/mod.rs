//! 可观测性：tracing 订阅器
//!
//! 日志一律写 stderr；stdio JSON-RPC 模式下 stdout 只承载协议消息。

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// 默认级别 info，可用 RUST_LOG 覆盖；重复调用时保留已安装的订阅器
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .try_init();
}
