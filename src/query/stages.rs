// 流水线阶段
//
// source(+cache) → calculate → filter → group_by → having → sort_by
//
// 每个阶段消费上游迭代器并产出新的迭代器; 子句为空的阶段不插入。
// 相邻阶段之间共享一个计数通道: 上游写入预计条数, 下游据此刷新进度总数。

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;

use log::{debug, warn};
use once_cell::unsync::OnceCell;
use serde_json::Value as JsonValue;

use crate::cache::{CachedResults, MinimumRecencyCache};
use crate::dsl::executor::ExpressionEngine;
use crate::dsl::value::Value;
use crate::observability::metrics::ROWS_PULLED;
use crate::source::tracker::IssueTracker;
use crate::source::{Source, SourceContext, SourceFactory};
use crate::Result;

use super::channel::{CounterChannel, FieldNameMap, Parameters};
use super::definition::Query;
use super::progress::{Progress, ProgressUpdate, TaskId};
use super::result::{GroupedResult, ResultRow, SingleResult};
use super::types::SchemaRow;

/// 阶段间传递的行流
pub type RowStream = Box<dyn Iterator<Item = Result<ResultRow>>>;

// ═══════════════════════════════════════════════════════════════════════════
// 求值作用域
// ═══════════════════════════════════════════════════════════════════════════

/// 一次执行内各阶段共享的求值环境
///
/// schema 在数据源阶段首次拉取时确定 (实时获取或来自缓存),
/// 字段别名表在第一次求值时据此构建。
pub struct PipelineScope {
    engine: ExpressionEngine,
    group_by: Vec<String>,
    parameters: Parameters,
    tracker: Arc<dyn IssueTracker>,
    factory: Arc<dyn SourceFactory>,
    schema: RefCell<Option<Vec<SchemaRow>>>,
    names: OnceCell<FieldNameMap>,
}

impl PipelineScope {
    pub fn new(
        engine: ExpressionEngine,
        group_by: Vec<String>,
        parameters: Parameters,
        tracker: Arc<dyn IssueTracker>,
        factory: Arc<dyn SourceFactory>,
        schema: Option<Vec<SchemaRow>>,
    ) -> Self {
        Self {
            engine,
            group_by,
            parameters,
            tracker,
            factory,
            schema: RefCell::new(schema),
            names: OnceCell::new(),
        }
    }

    pub fn engine(&self) -> &ExpressionEngine {
        &self.engine
    }

    /// 数据源 schema (未设置时向连接获取一次)
    pub fn schema(&self) -> Result<Vec<SchemaRow>> {
        if let Some(schema) = self.schema.borrow().as_ref() {
            return Ok(schema.clone());
        }
        let schema = self.factory.schema(self.tracker.as_ref())?;
        *self.schema.borrow_mut() = Some(schema.clone());
        Ok(schema)
    }

    /// 使用缓存中保存的 schema
    pub fn set_schema(&self, schema: Vec<SchemaRow>) {
        *self.schema.borrow_mut() = Some(schema);
    }

    pub fn field_name_map(&self) -> Result<&FieldNameMap> {
        self.names
            .get_or_try_init(|| Ok(FieldNameMap::new(&self.schema()?, &self.parameters)))
    }

    /// 对一行求值 (带分组键强制与字段别名)
    pub fn evaluate(&self, row: &ResultRow, expression: &str) -> Result<Value> {
        row.evaluate_expression(expression, &self.group_by, self.field_name_map()?, &self.engine)
    }
}

/// 阶段的进度任务与输入/输出计数通道
#[derive(Clone)]
pub struct StageContext {
    progress: Arc<dyn Progress>,
    task: TaskId,
    input: CounterChannel,
    output: CounterChannel,
}

impl StageContext {
    pub fn new(
        progress: Arc<dyn Progress>,
        task: TaskId,
        input: CounterChannel,
        output: CounterChannel,
    ) -> Self {
        Self {
            progress,
            task,
            input,
            output,
        }
    }

    /// 按输入通道刷新总数
    fn refresh_total(&self) {
        self.progress.update(
            self.task,
            ProgressUpdate::default().total(self.input.get()).visible(true),
        );
    }

    fn advance(&self) {
        self.progress.update(self.task, ProgressUpdate::advance(1));
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// 阶段列表
// ═══════════════════════════════════════════════════════════════════════════

/// 可选阶段 (按执行顺序)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageKind {
    Calculate,
    Filter,
    GroupBy,
    Having,
    SortBy,
}

impl StageKind {
    pub const PIPELINE: [StageKind; 5] = [
        StageKind::Calculate,
        StageKind::Filter,
        StageKind::GroupBy,
        StageKind::Having,
        StageKind::SortBy,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            StageKind::Calculate => "calculate",
            StageKind::Filter => "filter",
            StageKind::GroupBy => "group_by",
            StageKind::Having => "having",
            StageKind::SortBy => "sort_by",
        }
    }

    /// 对应子句非空时才插入
    pub fn is_active(&self, query: &Query) -> bool {
        match self {
            StageKind::Calculate => !query.calculate().is_empty(),
            StageKind::Filter => !query.filter().is_empty(),
            StageKind::GroupBy => !query.group_by().is_empty(),
            StageKind::Having => !query.having().is_empty(),
            StageKind::SortBy => !query.sort_by().is_empty(),
        }
    }

    /// 包装上游
    pub fn apply(
        &self,
        upstream: RowStream,
        query: &Query,
        scope: Rc<PipelineScope>,
        context: StageContext,
    ) -> RowStream {
        match self {
            StageKind::Calculate => Box::new(CalculateStage {
                upstream,
                columns: query
                    .calculate()
                    .into_iter()
                    .map(|f| (f.expression, f.column))
                    .collect(),
                scope,
                context,
            }),
            StageKind::Filter => Box::new(FilterStage::new(upstream, query.filter(), scope, context)),
            StageKind::GroupBy => Box::new(GroupByStage::new(upstream, query.group_by(), scope, context)),
            StageKind::Having => Box::new(FilterStage::new(upstream, query.having(), scope, context)),
            StageKind::SortBy => Box::new(SortByStage::new(upstream, query.sort_by(), scope, context)),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// source + cache
// ═══════════════════════════════════════════════════════════════════════════

/// 缓存读写设置
pub struct CachePolicy {
    pub cache: MinimumRecencyCache,
    pub key: String,
    /// 读取时的最小新鲜度; None 表示不读
    pub read_recency: Option<u64>,
    /// 写入过期时间; None 表示不写
    pub max_store: Option<u64>,
}

enum SourceState {
    Pending(Box<dyn Source>),
    Replaying(std::vec::IntoIter<JsonValue>),
    Streaming {
        source: Box<dyn Source>,
        recorded: Option<Vec<JsonValue>>,
    },
    Done,
}

/// 数据源阶段: 命中缓存时回放, 否则实时拉取并 (可选) 写入缓存
pub struct SourceStage {
    state: SourceState,
    context: SourceContext,
    factory: Arc<dyn SourceFactory>,
    scope: Rc<PipelineScope>,
    cache: Option<CachePolicy>,
}

impl SourceStage {
    pub fn new(
        source: Box<dyn Source>,
        context: SourceContext,
        factory: Arc<dyn SourceFactory>,
        scope: Rc<PipelineScope>,
        cache: Option<CachePolicy>,
    ) -> Self {
        Self {
            state: SourceState::Pending(source),
            context,
            factory,
            scope,
            cache,
        }
    }

    /// 首次拉取: 决定回放还是实时拉取
    fn start(&mut self, source: Box<dyn Source>) -> Result<SourceState> {
        if let Some(policy) = &self.cache {
            if let Some(min_recency) = policy.read_recency {
                if let Some(cached) = policy.cache.get::<CachedResults>(&policy.key, min_recency) {
                    debug!(
                        "Replaying {} cached rows for source {}",
                        cached.rows.len(),
                        self.factory.name()
                    );
                    self.scope.set_schema(cached.source_schema);
                    self.context.update_count(cached.rows.len() as u64);
                    self.context.remove_progress();
                    return Ok(SourceState::Replaying(cached.rows.into_iter()));
                }
            }
        }

        self.scope.schema()?;
        let recorded = self
            .cache
            .as_ref()
            .and_then(|policy| policy.max_store)
            .map(|_| Vec::new());
        Ok(SourceState::Streaming { source, recorded })
    }

    fn store(&self, rows: Vec<JsonValue>) {
        let Some(policy) = &self.cache else {
            return;
        };
        let schema = match self.scope.schema() {
            Ok(schema) => schema,
            Err(e) => {
                warn!("Not caching results: {}", e);
                return;
            }
        };
        let envelope = CachedResults {
            source_schema: schema,
            rows,
        };
        if let Err(e) = policy.cache.set(&policy.key, &envelope, policy.max_store) {
            warn!("Failed to store cached results: {}", e);
        }
    }

    fn row(&self, raw: JsonValue) -> ResultRow {
        ROWS_PULLED.inc();
        ResultRow::Single(SingleResult::new(self.factory.rehydrate(raw)))
    }
}

impl Iterator for SourceStage {
    type Item = Result<ResultRow>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match std::mem::replace(&mut self.state, SourceState::Done) {
                SourceState::Pending(source) => match self.start(source) {
                    Ok(state) => self.state = state,
                    Err(e) => return Some(Err(e)),
                },
                SourceState::Replaying(mut rows) => {
                    let raw = rows.next()?;
                    self.state = SourceState::Replaying(rows);
                    return Some(Ok(self.row(raw)));
                }
                SourceState::Streaming {
                    mut source,
                    mut recorded,
                } => match source.next() {
                    Some(Ok(raw)) => {
                        if let Some(rows) = recorded.as_mut() {
                            rows.push(raw.clone());
                        }
                        self.state = SourceState::Streaming { source, recorded };
                        return Some(Ok(self.row(raw)));
                    }
                    Some(Err(e)) => return Some(Err(e)),
                    None => {
                        if let Some(rows) = recorded {
                            self.store(rows);
                        }
                        return None;
                    }
                },
                SourceState::Done => return None,
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// calculate
// ═══════════════════════════════════════════════════════════════════════════

/// 逐行计算派生列, 写入行的覆盖值
pub struct CalculateStage {
    upstream: RowStream,
    columns: Vec<(String, String)>,
    scope: Rc<PipelineScope>,
    context: StageContext,
}

impl Iterator for CalculateStage {
    type Item = Result<ResultRow>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut row = match self.upstream.next()? {
            Ok(row) => row,
            Err(e) => return Some(Err(e)),
        };
        self.context.output.set(self.context.input.get());
        self.context.refresh_total();

        for (expression, column) in &self.columns {
            match self.scope.evaluate(&row, expression) {
                Ok(value) => row.set(column, value),
                Err(e) => return Some(Err(e)),
            }
        }

        self.context.advance();
        Some(Ok(row))
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// filter / having
// ═══════════════════════════════════════════════════════════════════════════

/// 丢弃任一表达式为假的行
pub struct FilterStage {
    upstream: RowStream,
    expressions: Vec<String>,
    scope: Rc<PipelineScope>,
    context: StageContext,
    started: bool,
}

impl FilterStage {
    pub fn new(
        upstream: RowStream,
        expressions: Vec<String>,
        scope: Rc<PipelineScope>,
        context: StageContext,
    ) -> Self {
        Self {
            upstream,
            expressions,
            scope,
            context,
            started: false,
        }
    }

    fn include(&self, row: &ResultRow) -> Result<bool> {
        for expression in &self.expressions {
            if !self.scope.evaluate(row, expression)?.is_truthy() {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

impl Iterator for FilterStage {
    type Item = Result<ResultRow>;

    fn next(&mut self) -> Option<Self::Item> {
        if !self.started {
            self.started = true;
            self.context.output.zero();
        }

        loop {
            let row = match self.upstream.next()? {
                Ok(row) => row,
                Err(e) => return Some(Err(e)),
            };
            self.context.refresh_total();

            let include = match self.include(&row) {
                Ok(include) => include,
                Err(e) => return Some(Err(e)),
            };
            self.context.advance();

            if include {
                self.context.output.increment();
                return Some(Ok(row));
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// group_by
// ═══════════════════════════════════════════════════════════════════════════

/// 分组: 读完全部上游后按首次出现顺序输出
///
/// 分组键为各分组表达式值的文本形式组成的元组, 按完整相等比较。
pub struct GroupByStage {
    upstream: Option<RowStream>,
    expressions: Vec<String>,
    scope: Rc<PipelineScope>,
    context: StageContext,
    groups: std::vec::IntoIter<GroupedResult>,
}

impl GroupByStage {
    pub fn new(
        upstream: RowStream,
        expressions: Vec<String>,
        scope: Rc<PipelineScope>,
        context: StageContext,
    ) -> Self {
        Self {
            upstream: Some(upstream),
            expressions,
            scope,
            context,
            groups: Vec::new().into_iter(),
        }
    }

    fn group_key(&self, row: &ResultRow) -> Result<Vec<String>> {
        self.expressions
            .iter()
            .map(|expression| Ok(self.scope.evaluate(row, expression)?.to_string()))
            .collect()
    }

    fn materialize(&mut self, upstream: RowStream) -> Result<()> {
        self.context.output.zero();
        let mut index: HashMap<Vec<String>, usize> = HashMap::new();
        let mut groups: Vec<GroupedResult> = Vec::new();

        for row in upstream {
            let row = row?;
            self.context.refresh_total();

            let key = self.group_key(&row)?;
            let single = match row {
                ResultRow::Single(single) => single,
                ResultRow::Grouped(group) => group.single().clone(),
            };
            match index.get(&key) {
                Some(&position) => groups[position].add(single),
                None => {
                    self.context.output.increment();
                    index.insert(key, groups.len());
                    groups.push(GroupedResult::new(single));
                }
            }

            self.context.advance();
        }

        debug!("Grouped rows into {} groups", groups.len());
        self.groups = groups.into_iter();
        Ok(())
    }
}

impl Iterator for GroupByStage {
    type Item = Result<ResultRow>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(upstream) = self.upstream.take() {
            if let Err(e) = self.materialize(upstream) {
                return Some(Err(e));
            }
        }
        self.groups.next().map(|group| Ok(ResultRow::Grouped(group)))
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// sort_by
// ═══════════════════════════════════════════════════════════════════════════

/// 排序: 全部读入后按声明的逆序逐个键做稳定排序, 第一个键成为主排序键
///
/// NULL 小于任何非 NULL 值。
pub struct SortByStage {
    upstream: Option<RowStream>,
    keys: Vec<(String, bool)>,
    scope: Rc<PipelineScope>,
    context: StageContext,
    rows: std::vec::IntoIter<ResultRow>,
}

impl SortByStage {
    pub fn new(
        upstream: RowStream,
        keys: Vec<(String, bool)>,
        scope: Rc<PipelineScope>,
        context: StageContext,
    ) -> Self {
        Self {
            upstream: Some(upstream),
            keys,
            scope,
            context,
            rows: Vec::new().into_iter(),
        }
    }

    fn materialize(&mut self, upstream: RowStream) -> Result<()> {
        let mut rows = upstream.collect::<Result<Vec<ResultRow>>>()?;
        self.context.output.set(rows.len() as u64);
        self.context.progress.update(
            self.context.task,
            ProgressUpdate::default().total(rows.len() as u64).visible(true),
        );

        for (expression, descending) in self.keys.iter().rev() {
            let mut keyed = Vec::with_capacity(rows.len());
            for row in rows {
                let key = self.scope.evaluate(&row, expression)?;
                self.context.advance();
                keyed.push((key, row));
            }
            if *descending {
                keyed.sort_by(|(a, _), (b, _)| b.sort_cmp(a));
            } else {
                keyed.sort_by(|(a, _), (b, _)| a.sort_cmp(b));
            }
            rows = keyed.into_iter().map(|(_, row)| row).collect();
        }

        self.rows = rows.into_iter();
        Ok(())
    }
}

impl Iterator for SortByStage {
    type Item = Result<ResultRow>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(upstream) = self.upstream.take() {
            if let Err(e) = self.materialize(upstream) {
                return Some(Err(e));
            }
        }
        self.rows.next().map(Ok)
    }
}
