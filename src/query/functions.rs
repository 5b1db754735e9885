// 执行上下文函数
//
// - subquery(name, **params): 执行查询定义中的命名子查询
// - field_by_name(row, name): 按字段显示名取值
// - get_issue / get_sprint / get_sprint_by_id / get_sprint_by_name: 远端单条查找
// - get_issue_snapshot_on_date / interval_matching / intervals_matching: 按变更记录回溯
//
// 都依赖当前执行的连接与查询, 每次执行重新注册。

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::Utc;
use log::debug;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use serde_json::Value as JsonValue;

use crate::dsl::executor::{ExecutionError, ExecutionResult};
use crate::dsl::functions::dates::parse_datetime_str;
use crate::dsl::functions::intervals::{Instant, Interval};
use crate::dsl::functions::records::issue_snapshots;
use crate::dsl::functions::{int_arg, CallArgs, FunctionRegistry};
use crate::dsl::value::Value;
use crate::source::record::Record;
use crate::source::tracker::{BoardRequest, IssueTracker, SprintRequest};
use crate::{Result, SelectError};

use super::channel::Parameters;
use super::definition::Query;
use super::engine::{Environment, Executor};
use super::progress::NullProgress;

/// 看板 / 迭代列表的分页大小
const LOOKUP_PAGE_SIZE: u64 = 50;

/// 注册执行上下文函数
pub(crate) fn register(registry: &mut FunctionRegistry, executor: &Executor) {
    let subquery = Subquery {
        parent: executor.query().clone(),
        parameters: executor.parameters().clone(),
        env: executor.environment().clone(),
    };
    registry.register("subquery", move |_: &FunctionRegistry, args: CallArgs| {
        subquery.call(args)
    });

    let tracker = Arc::clone(&executor.environment().tracker);
    let fields = Arc::new(FieldCache::new(Arc::clone(&tracker)));
    {
        let fields = Arc::clone(&fields);
        registry.register("field_by_name", move |_: &FunctionRegistry, args: CallArgs| {
            fields.call(args)
        });
    }

    let lookups = Arc::new(Lookups::new(tracker));
    {
        let lookups = Arc::clone(&lookups);
        registry.register("get_issue", move |_: &FunctionRegistry, args: CallArgs| {
            lookups.issue(args)
        });
    }
    for name in ["get_sprint", "get_sprint_by_id"] {
        let lookups = Arc::clone(&lookups);
        registry.register(name, move |_: &FunctionRegistry, args: CallArgs| {
            lookups.sprint_by_id(name, args)
        });
    }
    registry.register("get_sprint_by_name", move |_: &FunctionRegistry, args: CallArgs| {
        lookups.sprint_by_name(args)
    });

    let history = Arc::new(History { fields });
    {
        let history = Arc::clone(&history);
        registry.register(
            "get_issue_snapshot_on_date",
            move |_: &FunctionRegistry, args: CallArgs| history.snapshot_on_date(args),
        );
    }
    for name in ["interval_matching", "intervals_matching"] {
        let history = Arc::clone(&history);
        registry.register(name, move |registry: &FunctionRegistry, args: CallArgs| {
            history.matching(registry, name, args)
        });
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// subquery
// ═══════════════════════════════════════════════════════════════════════════

struct Subquery {
    parent: Query,
    parameters: Parameters,
    env: Environment,
}

impl Subquery {
    fn call(&self, args: CallArgs) -> ExecutionResult<Value> {
        args.expect_count("subquery", 1, 1)?;
        let name = match args.required(0, "subquery")? {
            Value::String(name) => name.clone(),
            other => {
                return Err(ExecutionError::TypeError(format!(
                    "subquery() name must be a string, not '{}'",
                    other.type_name()
                )))
            }
        };

        let mut parameters = self.parameters.clone();
        parameters.extend(args.keywords.iter().cloned());

        self.run(&name, parameters).map_err(ExecutionError::from)
    }

    fn run(&self, name: &str, parameters: Parameters) -> Result<Value> {
        let mut definition = self.parent.subqueries().get(name).cloned().ok_or_else(|| {
            SelectError::Query(format!(
                "Subquery '{}' does not exist in query definition.",
                name
            ))
        })?;
        if definition.cache.is_none() {
            definition.cache = self.parent.definition().cache.clone();
        }

        let query = Query::new(definition);
        let single_column = !query.selects_all_fields() && query.select().len() == 1;
        debug!("Running subquery {} against {}", name, query.source());

        let mut env = self.env.clone();
        env.progress = Arc::new(NullProgress::default());
        let rows = Executor::with_environment(query, parameters, env).collect_rows()?;

        let values = rows
            .into_iter()
            .map(|row| {
                if single_column {
                    row.into_values().into_iter().next().unwrap_or(Value::Null)
                } else {
                    Value::List(row.into_values())
                }
            })
            .collect();
        Ok(Value::List(values))
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// field_by_name
// ═══════════════════════════════════════════════════════════════════════════

/// 字段定义 (每次执行最多向连接请求一次)
struct FieldCache {
    tracker: Arc<dyn IssueTracker>,
    fields: OnceCell<Vec<JsonValue>>,
}

impl FieldCache {
    fn new(tracker: Arc<dyn IssueTracker>) -> Self {
        Self {
            tracker,
            fields: OnceCell::new(),
        }
    }

    fn fields(&self) -> Result<&[JsonValue]> {
        self.fields
            .get_or_try_init(|| self.tracker.fields())
            .map(Vec::as_slice)
    }

    fn field_key(&self, name: &str) -> Result<Option<String>> {
        Ok(self
            .fields()?
            .iter()
            .find(|field| field.get("name").and_then(JsonValue::as_str) == Some(name))
            .and_then(field_id))
    }

    /// 显示名 → 字段 key (无 key 时为 id)
    fn name_map(&self) -> Result<BTreeMap<String, String>> {
        Ok(self
            .fields()?
            .iter()
            .filter_map(|field| {
                let name = field.get("name").and_then(JsonValue::as_str)?;
                Some((name.to_string(), field_id(field)?))
            })
            .collect())
    }

    fn call(&self, args: CallArgs) -> ExecutionResult<Value> {
        args.expect_count("field_by_name", 2, 2)?;
        let row = args.required(0, "field_by_name")?;
        let name = match args.required(1, "field_by_name")? {
            Value::String(name) => name,
            other => {
                return Err(ExecutionError::TypeError(format!(
                    "field_by_name() name must be a string, not '{}'",
                    other.type_name()
                )))
            }
        };

        match self.field_key(name)? {
            Some(key) => Ok(row.get_key(&key).cloned().unwrap_or(Value::Null)),
            None => Ok(Value::Null),
        }
    }
}

fn field_id(field: &JsonValue) -> Option<String> {
    field
        .get("key")
        .or_else(|| field.get("id"))
        .and_then(JsonValue::as_str)
        .map(str::to_string)
}

// ═══════════════════════════════════════════════════════════════════════════
// get_issue / get_sprint*
// ═══════════════════════════════════════════════════════════════════════════

/// 单条查找, 结果在本次执行内缓存
struct Lookups {
    tracker: Arc<dyn IssueTracker>,
    issues: Mutex<HashMap<String, Value>>,
    sprints: Mutex<HashMap<i64, Value>>,
    sprints_by_name: Mutex<HashMap<(String, String), Value>>,
}

impl Lookups {
    fn new(tracker: Arc<dyn IssueTracker>) -> Self {
        Self {
            tracker,
            issues: Mutex::new(HashMap::new()),
            sprints: Mutex::new(HashMap::new()),
            sprints_by_name: Mutex::new(HashMap::new()),
        }
    }

    /// `get_issue(key)`: 与查询行相同的字段映射; 空 key 为 None
    fn issue(&self, args: CallArgs) -> ExecutionResult<Value> {
        args.expect_count("get_issue", 1, 1)?;
        let key = match args.required(0, "get_issue")? {
            Value::Null => return Ok(Value::Null),
            other => other.to_string(),
        };
        if key.is_empty() {
            return Ok(Value::Null);
        }
        if let Some(hit) = self.issues.lock().get(&key) {
            return Ok(hit.clone());
        }

        debug!("Fetching issue {}", key);
        let record = Record::from_json(self.tracker.issue(&key)?);
        let issue = Value::Map(record.fields().clone());
        self.issues.lock().insert(key, issue.clone());
        Ok(issue)
    }

    fn sprint_by_id(&self, function: &str, args: CallArgs) -> ExecutionResult<Value> {
        args.expect_count(function, 1, 1)?;
        let sprint_id = match args.required(0, function)? {
            Value::Null => return Ok(Value::Null),
            other => int_arg(other, function)?,
        };
        if let Some(hit) = self.sprints.lock().get(&sprint_id) {
            return Ok(hit.clone());
        }

        let sprint = Value::hydrate(&self.tracker.sprint(sprint_id)?);
        self.sprints.lock().insert(sprint_id, sprint.clone());
        Ok(sprint)
    }

    /// `get_sprint_by_name(board_name_or_id, sprint_name)`
    ///
    /// 名称按不区分大小写的包含匹配; 看板名可匹配多个看板, 同一迭代只计一次。
    /// 没有或有多个匹配时报错。
    fn sprint_by_name(&self, args: CallArgs) -> ExecutionResult<Value> {
        args.expect_count("get_sprint_by_name", 2, 2)?;
        let board = args.required(0, "get_sprint_by_name")?;
        let sprint_name = args.required(1, "get_sprint_by_name")?.to_string();
        let cache_key = (board.to_string(), sprint_name.to_lowercase());
        if let Some(hit) = self.sprints_by_name.lock().get(&cache_key) {
            return Ok(hit.clone());
        }

        let board_ids = match board {
            Value::Integer(id) => vec![*id],
            Value::String(name) => self.board_ids(name)?,
            other => {
                return Err(ExecutionError::TypeError(format!(
                    "get_sprint_by_name() board must be a name or id, not '{}'",
                    other.type_name()
                )))
            }
        };

        let needle = sprint_name.to_lowercase();
        let mut found: Vec<JsonValue> = Vec::new();
        for board_id in board_ids {
            for sprint in self.board_sprints(board_id) {
                let matched = sprint
                    .get("name")
                    .and_then(JsonValue::as_str)
                    .map_or(false, |name| name.to_lowercase().contains(&needle));
                let seen = found.iter().any(|known| known.get("id") == sprint.get("id"));
                if matched && !seen {
                    found.push(sprint);
                }
            }
        }

        let sprint = match found.len() {
            0 => {
                return Err(SelectError::Query(format!(
                    "No sprint found on board {} named {}.",
                    board, sprint_name
                ))
                .into())
            }
            1 => Value::hydrate(&found[0]),
            _ => {
                let names: Vec<String> = found
                    .iter()
                    .filter_map(|sprint| sprint.get("name").and_then(JsonValue::as_str))
                    .map(|name| format!("'{}'", name))
                    .collect();
                return Err(SelectError::Query(format!(
                    "More than one sprint was found on {} having a name like {}: [{}]",
                    board,
                    sprint_name,
                    names.join(", ")
                ))
                .into());
            }
        };
        self.sprints_by_name.lock().insert(cache_key, sprint.clone());
        Ok(sprint)
    }

    /// 名称包含 `name` 的看板 id
    fn board_ids(&self, name: &str) -> Result<Vec<i64>> {
        let mut ids = Vec::new();
        let mut start_at = 0;
        loop {
            let page = self.tracker.boards(&BoardRequest {
                start_at,
                max_results: LOOKUP_PAGE_SIZE,
                board_type: None,
                name: Some(name.to_string()),
            })?;
            if page.values.is_empty() {
                break;
            }
            start_at += page.values.len() as u64;
            ids.extend(
                page.values
                    .iter()
                    .filter_map(|board| board.get("id").and_then(JsonValue::as_i64)),
            );
            if page.is_last {
                break;
            }
        }
        Ok(ids)
    }

    /// 看板上的全部迭代; 不支持迭代的看板 (kanban) 视为没有
    fn board_sprints(&self, board_id: i64) -> Vec<JsonValue> {
        let mut sprints = Vec::new();
        let mut start_at = 0;
        loop {
            let page = match self.tracker.sprints(&SprintRequest {
                board_id,
                start_at,
                max_results: LOOKUP_PAGE_SIZE,
                state: None,
            }) {
                Ok(page) => page,
                Err(e) => {
                    debug!("Skipping sprints of board {}: {}", board_id, e);
                    break;
                }
            };
            if page.values.is_empty() {
                break;
            }
            start_at += page.values.len() as u64;
            sprints.extend(page.values);
            if page.is_last {
                break;
            }
        }
        sprints
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// 快照与区间
// ═══════════════════════════════════════════════════════════════════════════

/// 按变更记录回溯工单字段 (需要 `expand: [changelog]`)
struct History {
    fields: Arc<FieldCache>,
}

impl History {
    /// `get_issue_snapshot_on_date(issue, date)`: 该时刻的字段值; 创建之前为空映射
    fn snapshot_on_date(&self, args: CallArgs) -> ExecutionResult<Value> {
        args.expect_count("get_issue_snapshot_on_date", 2, 2)?;
        let issue = args.required(0, "get_issue_snapshot_on_date")?;
        let at = instant_arg(
            args.required(1, "get_issue_snapshot_on_date")?,
            "get_issue_snapshot_on_date",
        )?;

        let created = issue
            .get_key("created")
            .and_then(Value::as_str)
            .and_then(|text| parse_datetime_str(text.trim()));
        if created.map_or(false, |created| at <= created) {
            return Ok(Value::Map(BTreeMap::new()));
        }

        let names = self.fields.name_map()?;
        let snapshots = issue_snapshots(issue, &names, Utc::now().fixed_offset())?;
        Ok(snapshots
            .iter()
            .find(|snapshot| snapshot.validity_start.map_or(true, |start| start <= at))
            .map(|snapshot| snapshot.to_value(&names))
            .unwrap_or_else(|| Value::Map(BTreeMap::new())))
    }

    /// `interval_matching(issue, **filters)`: 字段满足 `simple_filter` 条件的时间区间
    fn matching(
        &self,
        registry: &FunctionRegistry,
        function: &str,
        args: CallArgs,
    ) -> ExecutionResult<Value> {
        args.expect_count(function, 1, 1)?;
        let names = self.fields.name_map()?;
        let now = Utc::now().fixed_offset();
        let snapshots: Vec<Value> = issue_snapshots(&args.positional[0], &names, now)?
            .iter()
            .map(|snapshot| snapshot.to_value(&names))
            .collect();

        let matched = registry.call(
            "simple_filter",
            CallArgs::with_keywords(vec![Value::List(snapshots)], args.keywords.clone()),
        )?;

        let mut interval = Interval::empty();
        for snapshot in matched.iterate()? {
            let bound = |name: &str| {
                snapshot
                    .get_key(name)
                    .and_then(Value::as_str)
                    .and_then(|text| parse_datetime_str(text.trim()))
            };
            if let (Some(start), Some(end)) = (bound("validity_start"), bound("validity_end")) {
                interval = interval.union(&Interval::closed(start, end));
            }
        }
        Ok(interval.to_value())
    }
}

fn instant_arg(value: &Value, function: &str) -> ExecutionResult<Instant> {
    match value {
        Value::String(text) => parse_datetime_str(text.trim())
            .ok_or_else(|| ExecutionError::ValueError(format!("Unknown string format: {}", text))),
        other => Err(ExecutionError::TypeError(format!(
            "{}() requires a datetime string, not '{}'",
            function,
            other.type_name()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::types::QueryDefinition;
    use crate::source::tracker::{StaticTracker, TrackerRequest};
    use serde_json::json;

    fn tracker() -> Arc<StaticTracker> {
        Arc::new(
            StaticTracker::new("test")
                .with_fields(vec![json!({
                    "id": "customfield_10010",
                    "key": "customfield_10010",
                    "name": "Story Points",
                    "schema": {"type": "number"}
                })])
                .with_issues(vec![
                    json!({"key": "ALPHA-1", "fields": {"customfield_10010": 3, "issuetype": "Bug"}}),
                    json!({"key": "ALPHA-2", "fields": {"customfield_10010": 5, "issuetype": "Task"}}),
                ]),
        )
    }

    #[test]
    fn test_field_by_name() {
        let definition = QueryDefinition::from_yaml(
            "select:\n  - field_by_name(issue, 'Story Points') as \"points\"\n  - field_by_name(issue, 'Nope') as \"nope\"\nfrom: issues\n",
        )
        .unwrap();
        let rows = Executor::new(tracker(), definition).collect_rows().unwrap();
        assert_eq!(rows[1].get("points"), Some(&Value::Integer(5)));
        assert_eq!(rows[1].get("nope"), Some(&Value::Null));
    }

    #[test]
    fn test_subquery_single_column_and_missing() {
        let definition = QueryDefinition::from_yaml(
            r#"
select:
  - key
  - len(subquery('bugs')) as "bugs"
from: issues
subqueries:
  bugs:
    select: [key]
    from: issues
    filter:
      - issuetype == 'Bug'
"#,
        )
        .unwrap();
        let rows = Executor::new(tracker(), definition).collect_rows().unwrap();
        assert_eq!(rows[0].get("bugs"), Some(&Value::Integer(1)));

        let definition = QueryDefinition::from_yaml(
            "select:\n  - subquery('absent')\nfrom: issues\n",
        )
        .unwrap();
        match Executor::new(tracker(), definition).collect_rows() {
            Err(SelectError::Query(msg)) => {
                assert_eq!(msg, "Subquery 'absent' does not exist in query definition.")
            }
            other => panic!("unexpected {:?}", other.map(|rows| rows.len())),
        }
    }

    #[test]
    fn test_subquery_keyword_parameters() {
        let definition = QueryDefinition::from_yaml(
            r#"
select:
  - subquery('of_type', kind='Task') as "tasks"
from: issues
limit: 1
subqueries:
  of_type:
    select: [key, issuetype]
    from: issues
    filter:
      - issuetype == '{params.kind}'
"#,
        )
        .unwrap();
        let rows = Executor::new(tracker(), definition).collect_rows().unwrap();
        assert_eq!(
            rows[0].get("tasks"),
            Some(&Value::List(vec![Value::List(vec![
                Value::from("ALPHA-2"),
                Value::from("Task")
            ])]))
        );
    }

    fn history_tracker() -> Arc<StaticTracker> {
        Arc::new(
            StaticTracker::new("test")
                .with_fields(vec![json!({
                    "id": "customfield_10010",
                    "key": "customfield_10010",
                    "name": "Story Points"
                })])
                .with_issues(vec![json!({
                    "key": "ALPHA-1",
                    "fields": {
                        "created": "2024-01-01T08:00:00.000+0000",
                        "status": {"self": "https://alpha.example/status/5", "name": "Done"},
                        "customfield_10010": 5
                    },
                    "changelog": {"histories": [
                        {
                            "created": "2024-01-01T09:00:00.000+0000",
                            "id": "100",
                            "items": [{
                                "field": "status", "fieldtype": "jira",
                                "fromString": "Open", "toString": "In Progress"
                            }]
                        },
                        {
                            "created": "2024-01-03T13:00:00.000+0000",
                            "id": "101",
                            "items": [
                                {
                                    "field": "status", "fieldtype": "jira",
                                    "fromString": "In Progress", "toString": "Done"
                                },
                                {
                                    "field": "Story Points", "fieldtype": "custom",
                                    "fromString": "3", "toString": "5"
                                }
                            ]
                        }
                    ]}
                })])
                .with_boards(vec![
                    json!({"id": 1, "name": "Alpha board", "type": "scrum"}),
                    json!({"id": 2, "name": "Alpha kanban", "type": "kanban"}),
                ])
                .with_sprints(
                    1,
                    vec![
                        json!({"id": 10, "name": "Sprint 10", "state": "closed"}),
                        json!({"id": 11, "name": "Sprint 11", "state": "active"}),
                    ],
                ),
        )
    }

    fn query_error(tracker: Arc<StaticTracker>, yaml: &str) -> String {
        let definition = QueryDefinition::from_yaml(yaml).unwrap();
        match Executor::new(tracker, definition).collect_rows() {
            Err(SelectError::Query(msg)) => msg,
            other => panic!("unexpected {:?}", other.map(|rows| rows.len())),
        }
    }

    #[test]
    fn test_get_issue_is_cached_per_run() {
        let tracker = tracker();
        let definition = QueryDefinition::from_yaml(
            "select:\n  - get_issue('ALPHA-2').issuetype as \"kind\"\n  - get_issue('') as \"none\"\nfrom: issues\n",
        )
        .unwrap();
        let rows = Executor::new(tracker.clone(), definition).collect_rows().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].get("kind"), Some(&Value::from("Task")));
        assert_eq!(rows[1].get("none"), Some(&Value::Null));

        let lookups = tracker
            .requests()
            .into_iter()
            .filter(|request| matches!(request, TrackerRequest::Issue(_)))
            .count();
        assert_eq!(lookups, 1);
    }

    #[test]
    fn test_get_sprint_lookups() {
        let definition = QueryDefinition::from_yaml(
            r#"
select:
  - get_sprint(11).name as "by_id"
  - get_sprint_by_id(10).state as "state"
  - get_sprint_by_name('Alpha', 'sprint 11').id as "by_name"
  - get_sprint_by_name(1, 'SPRINT 10').id as "on_board"
from: issues
"#,
        )
        .unwrap();
        let rows = Executor::new(history_tracker(), definition).collect_rows().unwrap();
        assert_eq!(rows[0].get("by_id"), Some(&Value::from("Sprint 11")));
        assert_eq!(rows[0].get("state"), Some(&Value::from("closed")));
        assert_eq!(rows[0].get("by_name"), Some(&Value::Integer(11)));
        assert_eq!(rows[0].get("on_board"), Some(&Value::Integer(10)));
    }

    #[test]
    fn test_get_sprint_by_name_requires_single_match() {
        let msg = query_error(
            history_tracker(),
            "select:\n  - get_sprint_by_name('Alpha', 'sprint')\nfrom: issues\n",
        );
        assert_eq!(
            msg,
            "More than one sprint was found on Alpha having a name like sprint: ['Sprint 10', 'Sprint 11']"
        );

        let msg = query_error(
            history_tracker(),
            "select:\n  - get_sprint_by_name(1, 'nope')\nfrom: issues\n",
        );
        assert_eq!(msg, "No sprint found on board 1 named nope.");
    }

    #[test]
    fn test_issue_snapshot_on_date() {
        let definition = QueryDefinition::from_yaml(
            r#"
select:
  - get_issue_snapshot_on_date(issue, '2024-01-02').status as "status"
  - get_issue_snapshot_on_date(issue, '2024-01-02')['Story Points'] as "points"
  - get_issue_snapshot_on_date(issue, '2024-02-01').status as "now"
  - get_issue_snapshot_on_date(issue, '2023-12-31') as "before"
from: issues
"#,
        )
        .unwrap();
        let rows = Executor::new(history_tracker(), definition).collect_rows().unwrap();
        assert_eq!(rows[0].get("status"), Some(&Value::from("In Progress")));
        assert_eq!(rows[0].get("points"), Some(&Value::from("3")));
        assert_eq!(rows[0].get("now"), Some(&Value::from("Done")));
        assert_eq!(rows[0].get("before"), Some(&Value::Map(BTreeMap::new())));
    }

    #[test]
    fn test_interval_matching_status() {
        let definition = QueryDefinition::from_yaml(
            r#"
select:
  - interval_size(interval_matching(issue, status='In Progress')) as "in_progress"
  - interval_size(intervals_matching(issue, status='Blocked')) as "blocked"
from: issues
"#,
        )
        .unwrap();
        let rows = Executor::new(history_tracker(), definition).collect_rows().unwrap();
        // 01-01 09:00 → 01-03 13:00
        assert_eq!(rows[0].get("in_progress"), Some(&Value::Float(52.0 * 3600.0)));
        assert_eq!(rows[0].get("blocked"), Some(&Value::Null));
    }
}
