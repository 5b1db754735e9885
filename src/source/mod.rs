//! 数据源契约
//!
//! 一个数据源由 [`SourceFactory`] 描述 (名称、schema、打开方式),
//! 打开后得到按页拉取原始 JSON 记录的迭代器。数据源负责:
//! - 总数已知时立即 `update_count`
//! - 每产出一条记录 `update_progress(advance=1)`
//! - 命中缓存时由执行器调用 `remove_progress`
//!
//! `open` 只做校验 (where/order_by/expand 的形状、参数是否齐全), 不发生 I/O;
//! 第一次拉取时才开始分页。

pub mod boards;
pub mod issues;
pub mod record;
pub mod sprints;
pub mod tracker;

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use serde_json::Value as JsonValue;

use crate::query::channel::{CounterChannel, Parameters};
use crate::query::progress::{Progress, ProgressUpdate, TaskId};
use crate::query::types::{SchemaRow, SelectFieldDefinition, WhereClause};
use crate::query::Query;
use crate::{Result, SelectError};

use self::record::Record;
use self::tracker::{IssueTracker, Page};

/// `limit` 未设置 (或为 0) 时的上限
pub const UNLIMITED: u64 = 1 << 32;

/// 单页最大条数
pub const PAGE_SIZE: u64 = 100;

// ═══════════════════════════════════════════════════════════════════════════
// 数据源上下文
// ═══════════════════════════════════════════════════════════════════════════

/// 数据源运行上下文: 查询、连接、参数、进度任务与输出计数通道
#[derive(Clone)]
pub struct SourceContext {
    query: Arc<Query>,
    tracker: Arc<dyn IssueTracker>,
    parameters: Parameters,
    progress: Arc<dyn Progress>,
    task: TaskId,
    out_channel: CounterChannel,
}

impl SourceContext {
    pub fn new(
        query: Arc<Query>,
        tracker: Arc<dyn IssueTracker>,
        parameters: Parameters,
        progress: Arc<dyn Progress>,
        task: TaskId,
        out_channel: CounterChannel,
    ) -> Self {
        Self {
            query,
            tracker,
            parameters,
            progress,
            task,
            out_channel,
        }
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    pub fn tracker(&self) -> &Arc<dyn IssueTracker> {
        &self.tracker
    }

    pub fn parameters(&self) -> &Parameters {
        &self.parameters
    }

    pub fn update_count(&self, value: u64) {
        self.out_channel.set(value);
    }

    pub fn update_progress(&self, update: ProgressUpdate) {
        self.progress.update(self.task, update);
    }

    pub fn remove_progress(&self) {
        self.progress.remove_task(self.task);
    }

    /// `limit` (0 视为未设置)
    pub fn result_limit(&self) -> u64 {
        self.query.limit().filter(|l| *l > 0).unwrap_or(UNLIMITED)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// 数据源接口
// ═══════════════════════════════════════════════════════════════════════════

/// 已打开的数据源: 按源分页顺序产出原始记录
pub trait Source: Iterator<Item = Result<JsonValue>> {
    fn context(&self) -> &SourceContext;
}

/// 数据源定义
pub trait SourceFactory: Send + Sync {
    fn name(&self) -> &str;

    /// 固定字段
    fn base_schema(&self) -> Vec<SchemaRow>;

    /// 完整 schema (可向连接查询自定义字段)
    fn schema(&self, _tracker: &dyn IssueTracker) -> Result<Vec<SchemaRow>> {
        Ok(self.base_schema())
    }

    /// 校验查询并返回惰性迭代器
    fn open(&self, context: SourceContext) -> Result<Box<dyn Source>>;

    /// 把原始记录 (实时拉取或缓存) 还原为记录
    fn rehydrate(&self, raw: JsonValue) -> Record {
        Record::from_json(raw)
    }
}

/// 数据源注册表
#[derive(Clone, Default)]
pub struct SourceRegistry {
    factories: BTreeMap<String, Arc<dyn SourceFactory>>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// issues / boards / sprints
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(issues::IssuesFactory);
        registry.register(boards::BoardsFactory);
        registry.register(sprints::SprintsFactory);
        registry
    }

    pub fn register<F: SourceFactory + 'static>(&mut self, factory: F) {
        self.factories
            .insert(factory.name().to_string(), Arc::new(factory));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn SourceFactory>> {
        self.factories.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.factories.keys().cloned().collect()
    }
}

impl std::fmt::Debug for SourceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceRegistry")
            .field("sources", &self.names())
            .finish()
    }
}

/// `select: "*"` 展开: schema 中的每个字段 id 原样作为列
pub fn all_fields(schema: &[SchemaRow]) -> Vec<SelectFieldDefinition> {
    schema
        .iter()
        .map(|row| SelectFieldDefinition::new(row.id.clone(), row.id.clone()))
        .collect()
}

// ═══════════════════════════════════════════════════════════════════════════
// 通用分页
// ═══════════════════════════════════════════════════════════════════════════

type PageFetcher = Box<dyn FnMut(&dyn IssueTracker, u64, u64) -> Result<Page>>;

/// 按 startAt/maxResults 分页直到 min(total, limit)
pub struct PagedSource {
    context: SourceContext,
    fetch: PageFetcher,
    limit: u64,
    start_at: u64,
    max_results: u64,
    count: u64,
    buffer: VecDeque<JsonValue>,
    started: bool,
    done: bool,
}

impl PagedSource {
    pub fn new(context: SourceContext, fetch: PageFetcher) -> Self {
        let limit = context.result_limit();
        Self {
            context,
            fetch,
            limit,
            start_at: 0,
            max_results: UNLIMITED,
            count: 0,
            buffer: VecDeque::new(),
            started: false,
            done: false,
        }
    }
}

impl Iterator for PagedSource {
    type Item = Result<JsonValue>;

    fn next(&mut self) -> Option<Self::Item> {
        if !self.started {
            self.started = true;
            self.context
                .update_progress(ProgressUpdate::default().completed(0).total(1).visible(true));
        }

        loop {
            if self.done {
                return None;
            }

            if let Some(value) = self.buffer.pop_front() {
                self.context
                    .update_progress(ProgressUpdate::advance(1).total(self.count).visible(true));
                self.start_at += 1;
                if self.start_at >= self.limit {
                    self.done = true;
                }
                return Some(Ok(value));
            }

            if self.start_at >= self.max_results.min(self.limit) {
                self.done = true;
                return None;
            }

            let page_size = self.limit.min(PAGE_SIZE);
            let tracker = Arc::clone(self.context.tracker());
            match (self.fetch)(tracker.as_ref(), self.start_at, page_size) {
                Ok(page) => {
                    self.max_results = page.total;
                    self.count = page.total.min(self.limit);
                    self.context.update_count(self.count);
                    if page.values.is_empty() {
                        self.done = true;
                    }
                    self.buffer.extend(page.values);
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

impl Source for PagedSource {
    fn context(&self) -> &SourceContext {
        &self.context
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// where 参数映射
// ═══════════════════════════════════════════════════════════════════════════

/// 从 where 映射中取出允许的键; 剩余键报错
pub(crate) fn take_where_params<const N: usize>(
    where_clause: &WhereClause,
    keys: [&str; N],
    shape_error: &str,
) -> Result<[Option<String>; N]> {
    let mut remaining = match where_clause {
        WhereClause::Params(map) => map.clone(),
        WhereClause::Fragments(items) if items.is_empty() => serde_json::Map::new(),
        WhereClause::Fragments(_) => return Err(SelectError::Query(shape_error.to_string())),
    };

    let mut taken: [Option<String>; N] = std::array::from_fn(|_| None);
    for (slot, key) in taken.iter_mut().zip(keys) {
        *slot = remaining.remove(key).and_then(|value| match value {
            JsonValue::Null => None,
            JsonValue::String(s) => Some(s),
            other => Some(other.to_string()),
        });
    }

    if !remaining.is_empty() {
        return Err(SelectError::Query(format!(
            "Unexpected 'where' parameters: {}.",
            JsonValue::Object(remaining)
        )));
    }
    Ok(taken)
}

/// 不支持 order_by / expand 的数据源统一校验
pub(crate) fn reject_order_by_and_expand(query: &Query, label: &str) -> Result<()> {
    if !query.order_by().is_empty() {
        return Err(SelectError::Query(format!(
            "{} query 'order_by' expressions are not supported. Use 'sort_by' instead.",
            label
        )));
    }
    if !query.expand().is_empty() {
        return Err(SelectError::Query(format!(
            "{} query 'expand' expressions are not supported.",
            label
        )));
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::query::progress::ProgressTracker;
    use crate::query::types::QueryDefinition;

    /// 基于 YAML 查询与连接构造上下文
    pub fn context(
        yaml: &str,
        tracker: Arc<dyn IssueTracker>,
        parameters: Parameters,
    ) -> (SourceContext, Arc<ProgressTracker>, CounterChannel) {
        let query = Arc::new(Query::new(
            QueryDefinition::from_yaml(yaml).expect("valid query"),
        ));
        let progress = Arc::new(ProgressTracker::new());
        let task = progress.add_task("source", false);
        let channel = CounterChannel::new();
        let context = SourceContext::new(
            query,
            tracker,
            parameters,
            progress.clone(),
            task,
            channel.clone(),
        );
        (context, progress, channel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::types::QueryDefinition;
    use serde_json::json;

    #[test]
    fn test_builtin_registry() {
        let registry = SourceRegistry::builtin();
        assert_eq!(registry.names(), vec!["boards", "issues", "sprints"]);
        assert!(registry.get("worklogs").is_none());
    }

    #[test]
    fn test_where_params() {
        let definition = QueryDefinition::from_json(
            r#"{"select": ["id"], "from": "boards", "where": {"type": "scrum", "id": 4}}"#,
        )
        .unwrap();
        let result = take_where_params(&definition.where_clause, ["type", "name"], "shape");
        match result {
            Err(SelectError::Query(msg)) => assert!(msg.contains("\"id\":4")),
            other => panic!("unexpected {:?}", other.map(|_| ())),
        }

        let definition = QueryDefinition::from_json(
            r#"{"select": ["id"], "from": "boards", "where": {"type": "scrum"}}"#,
        )
        .unwrap();
        let [kind, name] =
            take_where_params(&definition.where_clause, ["type", "name"], "shape").unwrap();
        assert_eq!(kind.as_deref(), Some("scrum"));
        assert!(name.is_none());
    }

    #[test]
    fn test_default_rehydrate() {
        let record = boards::BoardsFactory.rehydrate(json!({"id": 1, "name": "Alpha"}));
        assert_eq!(record.get("name"), Some(&crate::Value::from("Alpha")));
    }
}
