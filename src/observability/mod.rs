//! 可观测性：tracing 订阅者
//!
//! 默认 info，可通过 RUST_LOG 覆盖（如 `RUST_LOG=bee_planner=debug`）。
//! 关键字段：task_id、node、attempt、category。

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}

/// 安装全局订阅者；重复调用时忽略
pub fn init() {
    init_with("info");
}

pub fn init_with(default_level: &str) {
    let _ = tracing_subscriber::registry()
        .with(filter(default_level))
        .with(fmt::layer().with_target(true))
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_twice_is_harmless() {
        init_with("warn");
        init();
        tracing::info!(task_id = "task_x", "still works");
    }
}
