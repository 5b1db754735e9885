// 查询执行器
//
// 执行顺序:
// 1. 校验全部表达式引用的参数 (任何 I/O 之前)
// 2. 查找数据源, 计算 static 列
// 3. 组装函数表 (内置 + subquery/field_by_name + 用户函数)
// 4. 按顺序创建进度任务, 打开数据源, 用计数通道串联各阶段
// 5. select: 每行写入 static 值, 按 select 列求值输出
//
// 所有阶段都是惰性的: `rows()` 只做校验, 第一次迭代时才开始拉取。

use std::rc::Rc;
use std::sync::Arc;

use log::{debug, info};
use serde::ser::{Serialize, SerializeMap, Serializer};
use serde_json::Value as JsonValue;

use crate::cache::MinimumRecencyCache;
use crate::dsl::executor::{ErrorMode, ExpressionEngine};
use crate::dsl::functions::{Function, FunctionRegistry};
use crate::dsl::interpolate::{find_missing_parameters, find_used_parameters};
use crate::dsl::value::{Bindings, Value};
use crate::observability::metrics::{Timer, QUERY_LATENCY, ROWS_EMITTED};
use crate::source::tracker::IssueTracker;
use crate::source::{all_fields, SourceContext, SourceRegistry};
use crate::{Result, SelectError, VERSION};

use super::channel::{CounterChannel, ParameterInterpolations, Parameters};
use super::definition::Query;
use super::functions;
use super::progress::{NullProgress, Progress, ProgressTracker, ProgressUpdate, TaskId};
use super::stages::{
    CachePolicy, PipelineScope, RowStream, SourceStage, StageContext, StageKind,
};
use super::types::{QueryDefinition, SchemaRow, SelectFieldDefinition, WhereClause};

// ═══════════════════════════════════════════════════════════════════════════
// 执行环境
// ═══════════════════════════════════════════════════════════════════════════

/// 执行环境 (子查询共享)
#[derive(Clone)]
pub(crate) struct Environment {
    pub tracker: Arc<dyn IssueTracker>,
    pub sources: SourceRegistry,
    pub cache: Option<MinimumRecencyCache>,
    pub enable_cache: bool,
    pub progress: Arc<dyn Progress>,
    pub functions: FunctionRegistry,
}

// ═══════════════════════════════════════════════════════════════════════════
// 执行器
// ═══════════════════════════════════════════════════════════════════════════

/// 查询执行器
pub struct Executor {
    query: Arc<Query>,
    parameters: Parameters,
    env: Environment,
    schema: Option<Vec<SchemaRow>>,
}

impl Executor {
    pub fn builder(tracker: Arc<dyn IssueTracker>, definition: QueryDefinition) -> ExecutorBuilder {
        ExecutorBuilder::new(tracker, definition)
    }

    /// 默认配置 (内置数据源, 无缓存, 不记录进度)
    pub fn new(tracker: Arc<dyn IssueTracker>, definition: QueryDefinition) -> Self {
        Self::builder(tracker, definition).build()
    }

    pub(crate) fn with_environment(query: Query, parameters: Parameters, env: Environment) -> Self {
        Self {
            query: Arc::new(query),
            parameters,
            env,
            schema: None,
        }
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    pub fn parameters(&self) -> &Parameters {
        &self.parameters
    }

    pub(crate) fn environment(&self) -> &Environment {
        &self.env
    }

    /// 缓存键: 版本 + 连接 + 影响数据源结果的子句 + where 中实际用到的参数
    pub fn cache_key(&self) -> String {
        let query = &self.query;
        let strings = |items: Vec<String>| Value::List(items.into_iter().map(Value::String).collect());

        let (where_text, used) = match query.where_clause() {
            WhereClause::Fragments(items) => {
                let fragments: Vec<String> = items.iter().map(|e| e.to_string()).collect();
                let used = find_used_parameters(&fragments.join(" "));
                (strings(fragments).to_string(), used)
            }
            WhereClause::Params(map) => (
                Value::from_json(&JsonValue::Object(map.clone())).to_string(),
                Vec::new(),
            ),
        };
        let used_params: Bindings = used
            .into_iter()
            .filter_map(|name| self.parameters.get(&name).map(|v| (name, v.clone())))
            .collect();

        [
            VERSION.to_string(),
            self.env.tracker.client_info(),
            query.source().to_string(),
            where_text,
            strings(query.order_by()).to_string(),
            query
                .limit()
                .map(|limit| limit.to_string())
                .unwrap_or_else(|| Value::Null.to_string()),
            strings(query.expand()).to_string(),
            Value::Map(used_params).to_string(),
        ]
        .join(":")
    }

    /// 全部需要求值的表达式 (参数校验用)
    fn expressions(&self) -> Vec<String> {
        let query = &self.query;
        let mut expressions: Vec<String> = query
            .select()
            .into_iter()
            .chain(query.static_columns())
            .chain(query.calculate())
            .map(|field| field.expression)
            .collect();
        expressions.extend(query.filter());
        expressions.extend(query.having());
        expressions.extend(query.group_by());
        expressions.extend(query.sort_by().into_iter().map(|(expression, _)| expression));
        if let WhereClause::Fragments(items) = query.where_clause() {
            expressions.extend(items.iter().map(|e| e.to_string()));
        }
        expressions
    }

    fn check_parameters(&self) -> Result<()> {
        let known: Vec<String> = self.parameters.keys().cloned().collect();
        for expression in self.expressions() {
            if let Some(missing) = find_missing_parameters(&expression, &known).into_iter().next() {
                return Err(SelectError::ParameterMissing(missing));
            }
        }
        Ok(())
    }

    /// static 列: 不绑定任何字段, 只能引用参数; 任何错误都中止查询
    fn static_values(&self, engine: &ExpressionEngine) -> Result<Vec<(String, Value)>> {
        let interpolations = ParameterInterpolations::new(&self.parameters);
        let empty = Bindings::new();
        self.query
            .static_columns()
            .into_iter()
            .map(|field| {
                let value =
                    engine.evaluate(&field.expression, &empty, Some(&interpolations), ErrorMode::Strict)?;
                Ok((field.column, value))
            })
            .collect()
    }

    fn function_registry(&self) -> FunctionRegistry {
        let mut registry = FunctionRegistry::builtin();
        functions::register(&mut registry, self);
        for name in self.env.functions.names() {
            if let Some(function) = self.env.functions.get(&name) {
                registry.register_arc(&name, function);
            }
        }
        registry
    }

    /// 校验并组装流水线, 返回惰性的输出行迭代器
    pub fn rows(&self) -> Result<Rows> {
        self.check_parameters()?;

        let factory = self.env.sources.get(self.query.source()).ok_or_else(|| {
            SelectError::Query(format!(
                "No search for source {} implemented.",
                self.query.source()
            ))
        })?;

        let engine = ExpressionEngine::new(Arc::new(self.function_registry()));
        let static_values = self.static_values(&engine)?;

        let progress = Arc::clone(&self.env.progress);
        let source_task = progress.add_task(factory.name(), false);
        let stages: Vec<(StageKind, TaskId)> = StageKind::PIPELINE
            .iter()
            .filter(|kind| kind.is_active(&self.query))
            .map(|kind| (*kind, progress.add_task(kind.label(), false)))
            .collect();
        let select_task = progress.add_task("select", false);

        let source_channel = CounterChannel::new();
        let context = SourceContext::new(
            Arc::clone(&self.query),
            Arc::clone(&self.env.tracker),
            self.parameters.clone(),
            Arc::clone(&progress),
            source_task,
            source_channel.clone(),
        );
        let source = factory.open(context.clone())?;

        let scope = Rc::new(PipelineScope::new(
            engine,
            self.query.group_by(),
            self.parameters.clone(),
            Arc::clone(&self.env.tracker),
            Arc::clone(&factory),
            self.schema.clone(),
        ));

        let cache = match (self.query.cache(), &self.env.cache) {
            (Some((min_recency, max_store)), Some(cache)) => Some(CachePolicy {
                cache: cache.clone(),
                key: self.cache_key(),
                read_recency: min_recency.filter(|_| self.env.enable_cache),
                max_store,
            }),
            _ => None,
        };

        let mut stream: RowStream = Box::new(SourceStage::new(
            source,
            context,
            Arc::clone(&factory),
            Rc::clone(&scope),
            cache,
        ));
        let mut channel = source_channel;
        for (kind, task) in stages {
            let output = CounterChannel::new();
            let stage_context = StageContext::new(Arc::clone(&progress), task, channel, output.clone());
            stream = kind.apply(stream, &self.query, Rc::clone(&scope), stage_context);
            channel = output;
        }

        info!(
            "Executing query against {} (cache: {})",
            self.query.source(),
            self.query.cache().is_some()
        );

        Ok(Rows {
            upstream: stream,
            scope,
            query: Arc::clone(&self.query),
            static_values,
            select: None,
            input: channel,
            progress,
            task: select_task,
            emitted: 0,
            timer: Some(Timer::new(QUERY_LATENCY.clone())),
            done: false,
        })
    }

    /// 执行并收集全部输出行
    pub fn collect_rows(&self) -> Result<Vec<OutputRow>> {
        self.rows()?.collect()
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// 构造器
// ═══════════════════════════════════════════════════════════════════════════

/// 执行器构造器
pub struct ExecutorBuilder {
    definition: QueryDefinition,
    parameters: Parameters,
    schema: Option<Vec<SchemaRow>>,
    env: Environment,
}

impl ExecutorBuilder {
    pub fn new(tracker: Arc<dyn IssueTracker>, definition: QueryDefinition) -> Self {
        Self {
            definition,
            parameters: Parameters::new(),
            schema: None,
            env: Environment {
                tracker,
                sources: SourceRegistry::builtin(),
                cache: None,
                enable_cache: true,
                progress: Arc::new(NullProgress::default()),
                functions: FunctionRegistry::new(),
            },
        }
    }

    /// 替换数据源注册表
    pub fn sources(mut self, sources: SourceRegistry) -> Self {
        self.env.sources = sources;
        self
    }

    pub fn cache(mut self, cache: MinimumRecencyCache) -> Self {
        self.env.cache = Some(cache);
        self
    }

    /// 关闭缓存读取 (写入不受影响)
    pub fn enable_cache(mut self, enabled: bool) -> Self {
        self.env.enable_cache = enabled;
        self
    }

    pub fn progress(mut self, progress: Arc<dyn Progress>) -> Self {
        self.env.progress = progress;
        self
    }

    /// 记录进度状态 / 不记录
    pub fn progress_bar(mut self, enabled: bool) -> Self {
        self.env.progress = if enabled {
            Arc::new(ProgressTracker::new())
        } else {
            Arc::new(NullProgress::default())
        };
        self
    }

    pub fn parameters(mut self, parameters: Parameters) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn parameter(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(name.into(), value.into());
        self
    }

    /// 预先给定 schema (跳过向连接查询字段定义)
    pub fn schema(mut self, schema: Vec<SchemaRow>) -> Self {
        self.schema = Some(schema);
        self
    }

    /// 注册用户函数 (覆盖同名内置函数)
    pub fn function<F>(mut self, name: &str, function: F) -> Self
    where
        F: Function + 'static,
    {
        self.env.functions.register(name, function);
        self
    }

    pub fn functions(mut self, functions: FunctionRegistry) -> Self {
        self.env.functions = functions;
        self
    }

    pub fn build(self) -> Executor {
        Executor {
            query: Arc::new(Query::new(self.definition)),
            parameters: self.parameters,
            env: self.env,
            schema: self.schema,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// 输出行
// ═══════════════════════════════════════════════════════════════════════════

/// 一行输出: 按 select 顺序排列的 (列名, 值); 同名列后者覆盖前者
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OutputRow {
    columns: Vec<(String, Value)>,
}

impl OutputRow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, column: impl Into<String>, value: Value) {
        let column = column.into();
        match self.columns.iter_mut().find(|(name, _)| *name == column) {
            Some(slot) => slot.1 = value,
            None => self.columns.push((column, value)),
        }
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.columns
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, value)| value)
    }

    pub fn columns(&self) -> Vec<&str> {
        self.columns.iter().map(|(name, _)| name.as_str()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(String, Value)> {
        self.columns.iter()
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn into_values(self) -> Vec<Value> {
        self.columns.into_iter().map(|(_, value)| value).collect()
    }

    pub fn to_json(&self) -> JsonValue {
        JsonValue::Object(
            self.columns
                .iter()
                .map(|(name, value)| (name.clone(), value.to_json()))
                .collect(),
        )
    }
}

impl Serialize for OutputRow {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.columns.len()))?;
        for (name, value) in &self.columns {
            map.serialize_entry(name, &value.to_json())?;
        }
        map.end()
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// select
// ═══════════════════════════════════════════════════════════════════════════

/// 输出行迭代器
///
/// 出错后不再产出; `cap` 达到后停止拉取上游。
pub struct Rows {
    upstream: RowStream,
    scope: Rc<PipelineScope>,
    query: Arc<Query>,
    static_values: Vec<(String, Value)>,
    select: Option<Vec<SelectFieldDefinition>>,
    input: CounterChannel,
    progress: Arc<dyn Progress>,
    task: TaskId,
    emitted: u64,
    timer: Option<Timer>,
    done: bool,
}

impl Rows {
    /// 首行到来时确定 select 列 (`*` 需要 schema)
    fn select_fields(&mut self) -> Result<&[SelectFieldDefinition]> {
        if self.select.is_none() {
            let fields = if self.query.selects_all_fields() {
                self.query.select_with(&all_fields(&self.scope.schema()?))
            } else {
                self.query.select()
            };
            self.select = Some(fields);
        }
        Ok(self.select.as_deref().unwrap_or_default())
    }

    fn finish(&mut self) {
        if self.done {
            return;
        }
        self.done = true;
        if let Some(timer) = self.timer.take() {
            timer.observe();
        }
        debug!("Query against {} emitted {} rows", self.query.source(), self.emitted);
    }

    fn emit(&mut self) -> Option<Result<OutputRow>> {
        let mut row = match self.upstream.next()? {
            Ok(row) => row,
            Err(e) => return Some(Err(e)),
        };
        self.progress.update(
            self.task,
            ProgressUpdate::default().total(self.input.get()).visible(true),
        );

        for (column, value) in &self.static_values {
            row.set(column, value.clone());
        }

        let scope = Rc::clone(&self.scope);
        let fields = match self.select_fields() {
            Ok(fields) => fields,
            Err(e) => return Some(Err(e)),
        };
        let mut output = OutputRow::new();
        for field in fields {
            match scope.evaluate(&row, &field.expression) {
                Ok(value) => output.insert(field.column.clone(), value),
                Err(e) => return Some(Err(e)),
            }
        }

        self.progress.update(self.task, ProgressUpdate::advance(1));
        Some(Ok(output))
    }
}

impl Iterator for Rows {
    type Item = Result<OutputRow>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if let Some(cap) = self.query.cap() {
            if self.emitted >= cap {
                self.finish();
                return None;
            }
        }

        match self.emit() {
            Some(Ok(row)) => {
                self.emitted += 1;
                ROWS_EMITTED.inc();
                Some(Ok(row))
            }
            Some(Err(e)) => {
                self.finish();
                Some(Err(e))
            }
            None => {
                self.finish();
                None
            }
        }
    }
}
