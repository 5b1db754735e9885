//! # JIRA-SELECT
//!
//! 面向分页、字段不固定的工单数据源的类 SQL 查询引擎
//!
//! ## 核心能力
//!
//! - **查询定义**: select/from/where/filter/group_by/having/sort_by/limit/cap/expand/cache
//! - **表达式求值**: 受限表达式语言 (pest 语法 + 沙箱解释器), 字段别名与参数插值
//! - **结果模型**: 单条记录 / 分组记录统一求值接口 (分组时聚合成员值, 跳过 NULL)
//! - **数据源契约**: 可插拔的分页数据源 (issues / boards / sprints)
//! - **结果缓存**: 按查询指纹持久化, 读取时按最小新鲜度判定是否失效
//! - **执行流水线**: source → calculate → filter → group_by → having → sort_by → select
//!
//! ## 架构设计
//!
//! ```text
//! QueryDefinition (query/types)
//!     ↓
//! Executor (query/engine) ──→ MinimumRecencyCache (cache/)
//!     ↓
//! Source (source/) ← IssueTracker (外部连接)
//!     ↓
//! Stages (query/stages) ──→ Evaluator (dsl/)
//!     ↓
//! 输出行 (column → value)
//! ```

#![allow(dead_code)]

// ============================================================================
// 外部依赖
// ============================================================================

// 序列化
pub use serde;
pub use serde_json;

// 日志
pub use log;

// 错误处理
pub use thiserror;

// ============================================================================
// 内部模块
// ============================================================================

/// 表达式 DSL (语法/AST/解释器/函数表)
pub mod dsl;

/// 查询定义、结果模型与执行流水线
pub mod query;

/// 可插拔数据源
pub mod source;

/// 最小新鲜度缓存
pub mod cache;

/// 工具模块 (配置)
pub mod utils;

/// 可观测性 (日志 + Prometheus 指标)
pub mod observability;

// ============================================================================
// 重导出常用类型
// ============================================================================

pub use dsl::Value;
pub use query::{Executor, ExecutorBuilder, Query, QueryDefinition};
pub use source::tracker::{IssueTracker, StaticTracker};

/// 版本号 (参与缓存键计算, 升级后旧缓存自动失效)
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// 应用名称
pub const APP_NAME: &str = "jira-select";

// ============================================================================
// 全局错误类型
// ============================================================================

/// 查询错误类型
#[derive(Debug, thiserror::Error)]
pub enum SelectError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Query error: {0}")]
    Query(String),

    #[error("Field {0} does not exist.")]
    FieldName(String),

    #[error("Parameter {{params.{0}}} found in expression, but no parameter was specified!")]
    ParameterMissing(String),

    #[error("Evaluation error: {0}")]
    Evaluation(String),

    #[error("Source error: {0}")]
    Source(String),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl SelectError {
    /// 是否为用户查询错误 (只中止当前查询, 不影响进程)
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            SelectError::Query(_)
                | SelectError::FieldName(_)
                | SelectError::ParameterMissing(_)
                | SelectError::Evaluation(_)
        )
    }
}

impl From<serde_json::Error> for SelectError {
    fn from(e: serde_json::Error) -> Self {
        SelectError::Serialization(e.to_string())
    }
}

impl From<serde_yaml::Error> for SelectError {
    fn from(e: serde_yaml::Error) -> Self {
        SelectError::Serialization(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SelectError>;

// ============================================================================
// 测试模块
// ============================================================================
