//! 可观测性模块
//!
//! 日志初始化 (env_logger) 与 Prometheus 指标

pub mod metrics;

pub use metrics::*;

/// 初始化日志; `RUST_LOG` 优先, 否则使用 `default_filter`
///
/// 重复调用安全 (测试中多次初始化只生效一次)。
pub fn init_logging(default_filter: &str) {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .format_timestamp_millis()
        .try_init();
}
