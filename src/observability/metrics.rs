//! Prometheus 指标
//!
//! 提供查询执行的计数与耗时:
//! - 数据源拉取 / 输出行数
//! - 缓存命中、未命中、写入
//! - 行级求值错误 (按错误种类)
//! - 单次查询耗时

use lazy_static::lazy_static;
use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry};

lazy_static! {
    /// 全局 Prometheus Registry
    pub static ref REGISTRY: Registry = Registry::new();

    // ═══════════════════════════════════════════════════════════════════
    // 流水线指标
    // ═══════════════════════════════════════════════════════════════════

    /// 从数据源拉取的原始记录数 (含缓存回放)
    pub static ref ROWS_PULLED: IntCounter = IntCounter::with_opts(
        Opts::new("rows_pulled_total", "Total number of raw records pulled from sources")
            .namespace("jira_select")
    ).expect("Failed to create ROWS_PULLED metric");

    /// 输出行数
    pub static ref ROWS_EMITTED: IntCounter = IntCounter::with_opts(
        Opts::new("rows_emitted_total", "Total number of output rows emitted")
            .namespace("jira_select")
    ).expect("Failed to create ROWS_EMITTED metric");

    /// 行级求值错误 (记录后按 NULL 处理)
    pub static ref EVALUATION_ERRORS: IntCounterVec = IntCounterVec::new(
        Opts::new("evaluation_errors_total", "Recovered per-row expression evaluation errors")
            .namespace("jira_select"),
        &["kind"]
    ).expect("Failed to create EVALUATION_ERRORS metric");

    /// 单次查询耗时 (毫秒)
    pub static ref QUERY_LATENCY: Histogram = Histogram::with_opts(
        HistogramOpts::new("query_latency_ms", "Query execution time in milliseconds")
            .namespace("jira_select")
            .buckets(vec![1.0, 5.0, 10.0, 50.0, 100.0, 500.0, 1000.0, 5000.0, 30000.0])
    ).expect("Failed to create QUERY_LATENCY metric");

    // ═══════════════════════════════════════════════════════════════════
    // 缓存指标
    // ═══════════════════════════════════════════════════════════════════

    pub static ref CACHE_HITS: IntCounter = IntCounter::with_opts(
        Opts::new("cache_hits_total", "Total number of cache hits")
            .namespace("jira_select")
    ).expect("Failed to create CACHE_HITS metric");

    pub static ref CACHE_MISSES: IntCounter = IntCounter::with_opts(
        Opts::new("cache_misses_total", "Total number of cache misses")
            .namespace("jira_select")
    ).expect("Failed to create CACHE_MISSES metric");

    pub static ref CACHE_WRITES: IntCounter = IntCounter::with_opts(
        Opts::new("cache_writes_total", "Total number of cache entries written")
            .namespace("jira_select")
    ).expect("Failed to create CACHE_WRITES metric");
}

/// 初始化所有指标到 Registry
pub fn init_metrics() {
    REGISTRY.register(Box::new(ROWS_PULLED.clone())).ok();
    REGISTRY.register(Box::new(ROWS_EMITTED.clone())).ok();
    REGISTRY.register(Box::new(EVALUATION_ERRORS.clone())).ok();
    REGISTRY.register(Box::new(QUERY_LATENCY.clone())).ok();

    REGISTRY.register(Box::new(CACHE_HITS.clone())).ok();
    REGISTRY.register(Box::new(CACHE_MISSES.clone())).ok();
    REGISTRY.register(Box::new(CACHE_WRITES.clone())).ok();

    log::debug!("Prometheus metrics initialized");
}

/// 导出指标为 Prometheus 文本格式
pub fn gather_metrics() -> String {
    use prometheus::Encoder;
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        log::warn!("Failed to encode metrics: {}", e);
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

/// 计时器: drop 前调用 observe 记录毫秒数
pub struct Timer {
    start: std::time::Instant,
    histogram: Histogram,
}

impl Timer {
    pub fn new(histogram: Histogram) -> Self {
        Self {
            start: std::time::Instant::now(),
            histogram,
        }
    }

    pub fn observe(self) {
        let elapsed = self.start.elapsed().as_secs_f64() * 1000.0;
        self.histogram.observe(elapsed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_export() {
        init_metrics();

        ROWS_PULLED.inc();
        ROWS_EMITTED.inc_by(2);
        EVALUATION_ERRORS.with_label_values(&["AttributeError"]).inc();
        CACHE_HITS.inc();

        let output = gather_metrics();
        assert!(output.contains("jira_select_rows_emitted_total"));
        assert!(output.contains("jira_select_evaluation_errors_total"));
        assert!(output.contains("jira_select_cache_hits_total"));
    }

    #[test]
    fn test_timer() {
        init_metrics();
        let before = QUERY_LATENCY.get_sample_count();
        Timer::new(QUERY_LATENCY.clone()).observe();
        assert_eq!(QUERY_LATENCY.get_sample_count(), before + 1);
    }
}
