// 查询模块
//
// ┌─────────────────────────────────────────────────────────────┐
// │                        Query Layer                          │
// │                                                             │
// │  QueryDefinition ──→ Query ──→ Executor                     │
// │   (types.rs)      (definition.rs)  (engine.rs)              │
// │                                      │                      │
// │        source ─→ calculate ─→ filter ─→ group_by ─→         │
// │        having ─→ sort_by ─→ select      (stages.rs)         │
// │                                      │                      │
// │        CounterChannel / Progress  (channel.rs, progress.rs) │
// │        SingleResult / GroupedResult    (result.rs)          │
// └─────────────────────────────────────────────────────────────┘

pub mod channel;
pub mod definition;
pub mod engine;
pub mod functions;
pub mod progress;
pub mod result;
pub mod stages;
pub mod types;

pub use channel::{CounterChannel, FieldNameMap, Parameters};
pub use definition::{parse_select_definition, parse_sort_by_definition, Query, ALL_FIELDS};
pub use engine::{Executor, ExecutorBuilder, OutputRow, Rows};
pub use progress::{NullProgress, Progress, ProgressTracker, ProgressUpdate, TaskId};
pub use result::{GroupedResult, ResultRow, SingleResult};
pub use types::*;
