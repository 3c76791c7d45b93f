// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! tracing 日志初始化

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// 安装全局 subscriber, `RUST_LOG` 控制过滤级别 (默认 info). 重复调用无副作用.
pub fn init() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(false)
                .with_thread_names(true)
                .with_timer(fmt::time::uptime()),
        )
        .with(env_filter)
        .try_init();
}
