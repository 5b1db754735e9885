//! 工单数据辅助函数
//!
//! 变更记录展开 / 状态停留工时 / 关联工单 / 迭代描述解析 / 估时换算,
//! 以及按变更记录回溯的工单快照 (供执行器的快照与区间函数使用)。
//! 变更记录来自 `expand: [changelog]` 查询的 `changelog` 字段。

use std::collections::BTreeMap;

use chrono::{Duration, Utc};
use once_cell::sync::Lazy;
use regex::Regex;

use super::dates::parse_datetime_str;
use super::intervals::{date_arg, BusinessHours, Instant, Interval};
use super::{number_arg, CallArgs, FunctionRegistry};
use crate::dsl::executor::{ExecutionError, ExecutionResult};
use crate::dsl::value::Value;

/// `3w 2d 4h 30m` 中的一段
static ESTIMATE_PART: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?P<value>[\d.]+)(?P<unit>[^\d]+)").expect("valid estimate pattern")
});

/// `com.atlassian.greenhopper.service.sprint.Sprint@14b1c359[id=436,...]`
static SPRINT_FIELDS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[^\[]+\[(?P<fields>[^\]]*)\]").expect("valid sprint pattern")
});

/// 不参与快照的工单字段
const NON_SNAPSHOTTABLE: [&str; 13] = [
    "changelog",
    "components",
    "comment",
    "expand",
    "parent",
    "raw",
    "self",
    "subtasks",
    "timetracking",
    "updated",
    "votes",
    "watches",
    "worklog",
];

pub(super) fn register(registry: &mut FunctionRegistry) {
    registry.register("estimate_to_days", estimate_to_days);
    registry.register("get_linked_issue_keys", get_linked_issue_keys);
    registry.register("sprint_details", |_: &FunctionRegistry, args: CallArgs| {
        args.expect_count("sprint_details", 1, 1)?;
        sprint_details(&args.positional[0]).map(|details| details.unwrap_or(Value::Null))
    });
    registry.register("sprint_name", |_: &FunctionRegistry, args: CallArgs| {
        args.expect_count("sprint_name", 1, 1)?;
        Ok(sprint_details(&args.positional[0])?
            .and_then(|details| details.get_key("name").cloned())
            .unwrap_or(Value::Null))
    });
    registry.register("flatten_changelog", |_: &FunctionRegistry, args: CallArgs| {
        args.expect_count("flatten_changelog", 1, 1)?;
        let entries = flatten_changelog(&args.positional[0])?;
        Ok(Value::List(entries.iter().map(ChangelogEntry::to_value).collect()))
    });
    registry.register("workdays_in_state", workdays_in_state);
}

// ═══════════════════════════════════════════════════════════════════════════
// 变更记录
// ═══════════════════════════════════════════════════════════════════════════

/// 展开后的一条字段变更
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ChangelogEntry {
    pub author: String,
    pub created: Instant,
    pub id: i64,
    pub field: String,
    pub fieldtype: String,
    pub from_value: Value,
    pub from_string: Value,
    pub to_value: Value,
    pub to_string: Value,
}

impl ChangelogEntry {
    pub fn to_value(&self) -> Value {
        let mut map = BTreeMap::new();
        map.insert("author".to_string(), Value::String(self.author.clone()));
        map.insert("created".to_string(), Value::String(self.created.to_rfc3339()));
        map.insert("id".to_string(), Value::Integer(self.id));
        map.insert("field".to_string(), Value::String(self.field.clone()));
        map.insert("fieldtype".to_string(), Value::String(self.fieldtype.clone()));
        map.insert("fromValue".to_string(), self.from_value.clone());
        map.insert("fromString".to_string(), self.from_string.clone());
        map.insert("toValue".to_string(), self.to_value.clone());
        map.insert("toString".to_string(), self.to_string.clone());
        Value::Map(map)
    }
}

/// 人员等对象的展示文本
fn display_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Map(_) => value
            .get_key("displayName")
            .or_else(|| value.get_key("name"))
            .map(|v| v.to_string())
            .unwrap_or_else(|| value.to_string()),
        other => other.to_string(),
    }
}

fn text_of(value: Option<&Value>) -> String {
    value.map(display_text).unwrap_or_default()
}

/// 每个 history 的每个 item 展开为一条记录
pub(crate) fn flatten_changelog(changelog: &Value) -> ExecutionResult<Vec<ChangelogEntry>> {
    let histories = changelog.get_key("histories").ok_or_else(|| {
        ExecutionError::ValueError(
            "No changelog was provided; did you use the `expand` option of `changelog` in your query?"
                .into(),
        )
    })?;

    let mut entries = Vec::new();
    for history in histories.iterate()? {
        let created_text = text_of(history.get_key("created"));
        let created = parse_datetime_str(created_text.trim()).ok_or_else(|| {
            ExecutionError::ValueError(format!("Unknown string format: {}", created_text))
        })?;
        let author = text_of(history.get_key("author"));
        let id = match history.get_key("id") {
            Some(Value::String(s)) => s.trim().parse().unwrap_or(-1),
            Some(other) => other.as_i64().unwrap_or(-1),
            None => -1,
        };

        let items = history.get_key("items").cloned().unwrap_or(Value::List(vec![]));
        for item in items.iterate()? {
            let field = |name: &str| item.get_key(name).cloned().unwrap_or(Value::Null);
            entries.push(ChangelogEntry {
                author: author.clone(),
                created,
                id,
                field: text_of(item.get_key("field")),
                fieldtype: text_of(item.get_key("fieldtype")),
                from_value: field("from"),
                from_string: field("fromString"),
                to_value: field("to"),
                to_string: field("toString"),
            });
        }
    }
    Ok(entries)
}

/// `workdays_in_state(changelog, state, start_hour=9, end_hour=17, timezone_name=None,
/// work_days=[1..5], min_date=None, max_date=None)`: 在该状态停留的工作日数 (可为小数)
fn workdays_in_state(_: &FunctionRegistry, args: CallArgs) -> ExecutionResult<Value> {
    args.expect_count("workdays_in_state", 2, 8)?;
    let changelog = args.required(0, "workdays_in_state")?;
    let state = args.required(1, "workdays_in_state")?.to_string();
    let hours = BusinessHours::from_args(&args, "workdays_in_state")?;

    let mut entries = flatten_changelog(changelog)?;
    entries.retain(|entry| entry.field == "status");
    entries.sort_by(|a, b| a.created.cmp(&b.created));

    let now = Utc::now().fixed_offset();
    let mut spans = Vec::new();
    let mut entered: Option<Instant> = None;
    for entry in &entries {
        if let Some(start) = entered.take() {
            spans.push((start, entry.created));
        }
        if entry.to_string.to_string() == state {
            entered = Some(entry.created);
        }
    }
    if let Some(start) = entered {
        spans.push((start, now));
    }
    let in_state = Interval::from_spans(spans);

    // 停留区间之外没有贡献, 日期范围收缩到停留区间
    let (first, last) = match (in_state.spans().first(), in_state.spans().last()) {
        (Some(first), Some(last)) => (first.0.date_naive(), last.1.date_naive()),
        _ => return Ok(Value::Float(0.0)),
    };
    let start = date_arg(args.arg_or_keyword(6, "min_date"), "workdays_in_state")?
        .map_or(first - Duration::days(1), |d| d.max(first - Duration::days(1)));
    let end = date_arg(args.arg_or_keyword(7, "max_date"), "workdays_in_state")?
        .map_or(last + Duration::days(2), |d| d.min(last + Duration::days(2)));

    let seconds = in_state
        .intersection(&hours.between(start, end))
        .total_seconds()
        .unwrap_or(0.0);
    Ok(Value::Float(
        seconds / (3600.0 * f64::from(hours.hours_per_day())),
    ))
}

// ═══════════════════════════════════════════════════════════════════════════
// 关联工单 / 迭代 / 估时
// ═══════════════════════════════════════════════════════════════════════════

/// `get_linked_issue_keys(issuelinks, link_type=None)`
fn get_linked_issue_keys(_: &FunctionRegistry, args: CallArgs) -> ExecutionResult<Value> {
    args.expect_count("get_linked_issue_keys", 0, 2)?;
    let links = match args.arg_or_keyword(0, "issuelinks") {
        None | Some(Value::Null) => {
            return Err(ExecutionError::ValueError(
                "issuelinks should be passed as the first parameter of 'get_linked_issue_keys'"
                    .into(),
            ))
        }
        Some(links) => links,
    };
    let link_type = args
        .arg_or_keyword(1, "link_type")
        .filter(|v| !v.is_null())
        .map(|v| v.to_string());

    let direction_matches = |link: &Value, direction: &str| -> bool {
        match &link_type {
            None => true,
            Some(wanted) => link
                .get_key("type")
                .and_then(|t| t.get_key(direction))
                .map_or(false, |name| name.to_string() == *wanted),
        }
    };
    let linked_key = |link: &Value, side: &str| -> Option<Value> {
        link.get_key(side).and_then(|issue| issue.get_key("key")).cloned()
    };

    let mut keys = Vec::new();
    for link in links.iterate()? {
        if direction_matches(&link, "inward") {
            keys.extend(linked_key(&link, "inwardIssue"));
        }
        if direction_matches(&link, "outward") {
            keys.extend(linked_key(&link, "outwardIssue"));
        }
    }
    Ok(Value::List(keys))
}

/// 解析迭代描述串; 无法识别时为 None
pub(crate) fn sprint_details(blob: &Value) -> ExecutionResult<Option<Value>> {
    let text = match blob {
        Value::Null => return Ok(None),
        Value::String(text) => text,
        other => {
            return Err(ExecutionError::TypeError(format!(
                "sprint_details() requires a string, not '{}'",
                other.type_name()
            )))
        }
    };
    let raw_fields = match SPRINT_FIELDS.captures(text).and_then(|c| c.name("fields")) {
        Some(m) => m.as_str(),
        None => return Ok(None),
    };

    // 名称或目标中可能含有逗号: 不含 `=` 的片段并入上一个值
    let mut gathered: Vec<(String, String)> = Vec::new();
    for part in raw_fields.split(',').filter(|p| !p.is_empty()) {
        match part.split_once('=') {
            Some((key, value)) => gathered.push((key.to_string(), value.to_string())),
            None => {
                if let Some(last) = gathered.last_mut() {
                    last.1.push(',');
                    last.1.push_str(part);
                }
            }
        }
    }

    let mut details = BTreeMap::new();
    details.insert("id".to_string(), Value::Integer(-1));
    for key in ["name", "state", "goal"] {
        details.insert(key.to_string(), Value::String(String::new()));
    }
    for key in ["rapidViewId", "sequence", "startDate", "endDate", "completeDate"] {
        details.insert(key.to_string(), Value::Null);
    }

    for (key, value) in gathered {
        let converted = if value == "<null>" {
            Value::Null
        } else {
            match key.as_str() {
                "id" | "rapidViewId" | "sequence" => value
                    .trim()
                    .parse::<i64>()
                    .map(Value::Integer)
                    .map_err(|_| ExecutionError::ValueError(format!("invalid integer: {}", value)))?,
                "startDate" | "endDate" | "completeDate" => parse_datetime_str(value.trim())
                    .map(|dt| Value::String(dt.to_rfc3339()))
                    .ok_or_else(|| ExecutionError::ValueError(format!("Unknown string format: {}", value)))?,
                _ => Value::String(value),
            }
        };
        details.insert(key, converted);
    }
    Ok(Some(Value::Map(details)))
}

/// `estimate_to_days(value_str, day_hour_count=8)`: `1w 2d 4h` → 天数; 未知单位忽略
fn estimate_to_days(_: &FunctionRegistry, args: CallArgs) -> ExecutionResult<Value> {
    args.expect_count("estimate_to_days", 1, 2)?;
    let text = match args.required(0, "estimate_to_days")? {
        Value::Null => return Ok(Value::Null),
        Value::String(text) => text,
        other => {
            return Err(ExecutionError::TypeError(format!(
                "estimate_to_days() requires a string, not '{}'",
                other.type_name()
            )))
        }
    };
    let day_hours = match args.arg_or_keyword(1, "day_hour_count") {
        None | Some(Value::Null) => 8.0,
        Some(value) => number_arg(value, "estimate_to_days")?,
    };
    if day_hours == 0.0 {
        return Err(ExecutionError::DivisionByZero);
    }

    let mut total = 0.0;
    for part in text.split(' ') {
        let captures = ESTIMATE_PART
            .captures(part)
            .ok_or_else(|| ExecutionError::ValueError(text.clone()))?;
        let value: f64 = captures["value"]
            .parse()
            .map_err(|_| ExecutionError::ValueError(text.clone()))?;
        let factor = match &captures["unit"] {
            "w" => 5.0,
            "d" => 1.0,
            "h" => 1.0 / day_hours,
            "m" => 1.0 / day_hours / 60.0,
            _ => 0.0,
        };
        total += factor * value;
    }
    Ok(Value::Float(total))
}

// ═══════════════════════════════════════════════════════════════════════════
// 工单快照
// ═══════════════════════════════════════════════════════════════════════════

/// 某一时间段内的工单状态
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Snapshot {
    pub fields: BTreeMap<String, Value>,
    /// 最早的快照以工单创建时间为起点, 缺失时为 None
    pub validity_start: Option<Instant>,
    pub validity_end: Instant,
}

impl Snapshot {
    /// 快照字段 + 字段显示名别名 + 有效期
    pub fn to_value(&self, names: &BTreeMap<String, String>) -> Value {
        let mut map = self.fields.clone();
        for (name, id) in names {
            if !map.contains_key(name) {
                if let Some(value) = self.fields.get(id) {
                    map.insert(name.clone(), value.clone());
                }
            }
        }
        map.insert(
            "validity_start".to_string(),
            self.validity_start
                .map(|start| Value::String(start.to_rfc3339()))
                .unwrap_or(Value::Null),
        );
        map.insert(
            "validity_end".to_string(),
            Value::String(self.validity_end.to_rfc3339()),
        );
        Value::Map(map)
    }

    /// 有效期内是否包含该时刻
    pub fn covers(&self, at: Instant) -> bool {
        self.validity_start.map_or(true, |start| start <= at) && at < self.validity_end
    }
}

/// 由新到旧的工单快照
///
/// 从当前字段值出发, 按时间倒序回放变更记录 (恢复 `fromString`)。
/// `names` 为字段显示名 → 字段 id, 变更记录中的显示名据此写回对应 id。
pub(crate) fn issue_snapshots(
    issue: &Value,
    names: &BTreeMap<String, String>,
    now: Instant,
) -> ExecutionResult<Vec<Snapshot>> {
    let raw = match issue {
        Value::Map(map) => map.clone(),
        Value::Resource(resource) => resource.raw().clone(),
        other => {
            return Err(ExecutionError::TypeError(format!(
                "issue snapshots require an issue, not '{}'",
                other.type_name()
            )))
        }
    };

    let mut current: BTreeMap<String, Value> = raw
        .iter()
        .filter(|(key, value)| {
            !NON_SNAPSHOTTABLE.contains(&key.as_str()) && !matches!(value, Value::Function(_))
        })
        .map(|(key, value)| {
            let text = if value.is_null() {
                Value::Null
            } else {
                Value::String(value.to_string())
            };
            (key.clone(), text)
        })
        .collect();

    let changelog = raw.get("changelog").cloned().unwrap_or(Value::Null);
    let mut entries = flatten_changelog(&changelog)?;
    entries.sort_by(|a, b| b.created.cmp(&a.created));

    let mut snapshots = Vec::with_capacity(entries.len() + 1);
    let mut validity_end = now;
    for entry in entries {
        if NON_SNAPSHOTTABLE.contains(&entry.field.as_str()) {
            continue;
        }
        // 同一次变更的多个字段合并为一个快照
        if entry.created != validity_end {
            snapshots.push(Snapshot {
                fields: current.clone(),
                validity_start: Some(entry.created),
                validity_end,
            });
            validity_end = entry.created;
        }

        let key = if !current.contains_key(&entry.field) {
            names.get(&entry.field).cloned().unwrap_or(entry.field)
        } else {
            entry.field
        };
        let restored = if entry.from_string.is_null() {
            Value::Null
        } else {
            Value::String(entry.from_string.to_string())
        };
        current.insert(key, restored);
    }

    let created = raw
        .get("created")
        .and_then(Value::as_str)
        .and_then(|text| parse_datetime_str(text.trim()));
    snapshots.push(Snapshot {
        fields: current,
        validity_start: created,
        validity_end,
    });
    Ok(snapshots)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn call(name: &str, args: CallArgs) -> ExecutionResult<Value> {
        FunctionRegistry::builtin().call(name, args)
    }

    fn changelog() -> Value {
        Value::hydrate(&json!({
            "histories": [
                {
                    "author": {"self": "https://alpha.example/user/1", "displayName": "Ada"},
                    "created": "2024-01-01T09:00:00.000+0000",
                    "id": "100",
                    "items": [{
                        "field": "status", "fieldtype": "jira",
                        "from": "1", "fromString": "Open",
                        "to": "3", "toString": "In Progress"
                    }]
                },
                {
                    "author": {"self": "https://alpha.example/user/1", "displayName": "Ada"},
                    "created": "2024-01-03T13:00:00.000+0000",
                    "id": "101",
                    "items": [
                        {
                            "field": "status", "fieldtype": "jira",
                            "from": "3", "fromString": "In Progress",
                            "to": "5", "toString": "Done"
                        },
                        {
                            "field": "Story Points", "fieldtype": "custom",
                            "from": null, "fromString": "3",
                            "to": null, "toString": "5"
                        }
                    ]
                }
            ]
        }))
    }

    #[test]
    fn test_flatten_changelog() {
        let flat = call("flatten_changelog", CallArgs::new(vec![changelog()])).unwrap();
        assert_eq!(flat.len(), Some(3));
        let first = flat.index(&Value::Integer(0)).unwrap();
        assert_eq!(first.get_key("author"), Some(&Value::from("Ada")));
        assert_eq!(first.get_key("id"), Some(&Value::Integer(100)));
        assert_eq!(first.get_key("toString"), Some(&Value::from("In Progress")));
        assert_eq!(
            first.get_key("created"),
            Some(&Value::from("2024-01-01T09:00:00+00:00"))
        );

        assert!(matches!(
            call("flatten_changelog", CallArgs::new(vec![Value::Null])),
            Err(ExecutionError::ValueError(_))
        ));
    }

    #[test]
    fn test_workdays_in_state() {
        // 周一 09:00 进入, 周三 13:00 离开: 8h + 8h + 4h
        let args = CallArgs::with_keywords(
            vec![changelog(), Value::from("In Progress")],
            vec![("timezone_name".to_string(), Value::from("UTC"))],
        );
        assert_eq!(call("workdays_in_state", args).unwrap(), Value::Float(2.5));

        let args = CallArgs::with_keywords(
            vec![changelog(), Value::from("Blocked")],
            vec![("timezone_name".to_string(), Value::from("UTC"))],
        );
        assert_eq!(call("workdays_in_state", args).unwrap(), Value::Float(0.0));
    }

    #[test]
    fn test_workdays_in_state_respects_date_window() {
        let args = CallArgs::with_keywords(
            vec![changelog(), Value::from("In Progress")],
            vec![
                ("timezone_name".to_string(), Value::from("UTC")),
                ("min_date".to_string(), Value::from("2024-01-02")),
                ("max_date".to_string(), Value::from("2024-01-03")),
            ],
        );
        assert_eq!(call("workdays_in_state", args).unwrap(), Value::Float(1.0));
    }

    #[test]
    fn test_get_linked_issue_keys() {
        let links = Value::hydrate(&json!([
            {
                "type": {"inward": "is blocked by", "outward": "blocks"},
                "inwardIssue": {"key": "ALPHA-7"}
            },
            {
                "type": {"inward": "is cloned by", "outward": "clones"},
                "outwardIssue": {"key": "ALPHA-9"}
            }
        ]));
        assert_eq!(
            call("get_linked_issue_keys", CallArgs::new(vec![links.clone()])).unwrap(),
            Value::from_json(&json!(["ALPHA-7", "ALPHA-9"]))
        );
        assert_eq!(
            call(
                "get_linked_issue_keys",
                CallArgs::new(vec![links, Value::from("is blocked by")])
            )
            .unwrap(),
            Value::from_json(&json!(["ALPHA-7"]))
        );
        assert!(matches!(
            call("get_linked_issue_keys", CallArgs::new(vec![Value::Null])),
            Err(ExecutionError::ValueError(_))
        ));
    }

    #[test]
    fn test_sprint_details_and_name() {
        let blob = Value::from(
            "com.atlassian.greenhopper.service.sprint.Sprint@14b1c359[id=436,rapidViewId=153,\
             state=CLOSED,name=ORC #11 3/9-3/23,goal=Ship it, then rest,\
             startDate=2020-03-09T21:53:07.264Z,endDate=<null>,sequence=436]",
        );
        let details = call("sprint_details", CallArgs::new(vec![blob.clone()])).unwrap();
        assert_eq!(details.get_key("id"), Some(&Value::Integer(436)));
        assert_eq!(details.get_key("goal"), Some(&Value::from("Ship it, then rest")));
        assert_eq!(details.get_key("endDate"), Some(&Value::Null));
        assert_eq!(
            details.get_key("startDate"),
            Some(&Value::from("2020-03-09T21:53:07.264+00:00"))
        );
        assert_eq!(
            call("sprint_name", CallArgs::new(vec![blob])).unwrap(),
            Value::from("ORC #11 3/9-3/23")
        );
        assert!(call("sprint_name", CallArgs::new(vec![Value::from("no brackets")]))
            .unwrap()
            .is_null());
        assert!(call("sprint_details", CallArgs::new(vec![Value::Null])).unwrap().is_null());
    }

    #[test]
    fn test_estimate_to_days() {
        let days = call("estimate_to_days", CallArgs::new(vec![Value::from("1w 2d 4h")])).unwrap();
        assert_eq!(days, Value::Float(7.5));
        let days = call(
            "estimate_to_days",
            CallArgs::new(vec![Value::from("30m"), Value::Integer(6)]),
        )
        .unwrap();
        assert!((days.as_f64().unwrap() - 1.0 / 12.0).abs() < 1e-9);
        assert!(matches!(
            call("estimate_to_days", CallArgs::new(vec![Value::from("soon")])),
            Err(ExecutionError::ValueError(_))
        ));
    }

    #[test]
    fn test_issue_snapshots_replay_changes() {
        let mut names = BTreeMap::new();
        names.insert("Story Points".to_string(), "customfield_10010".to_string());
        let issue = Value::hydrate(&json!({
            "key": "ALPHA-1",
            "created": "2023-12-29T10:00:00.000+0000",
            "status": "Done",
            "customfield_10010": 5,
            "changelog": changelog().to_json()
        }));
        let now = parse_datetime_str("2024-02-01T00:00:00Z").unwrap();

        let snapshots = issue_snapshots(&issue, &names, now).unwrap();
        assert_eq!(snapshots.len(), 3);
        assert_eq!(snapshots[0].fields["status"], Value::from("Done"));
        assert_eq!(snapshots[0].fields["customfield_10010"], Value::from("5"));
        assert_eq!(snapshots[0].validity_end, now);
        assert_eq!(snapshots[1].fields["status"], Value::from("In Progress"));
        assert_eq!(snapshots[1].fields["customfield_10010"], Value::from("3"));

        let oldest = &snapshots[2];
        assert_eq!(oldest.fields["status"], Value::from("Open"));
        assert_eq!(
            oldest.validity_start,
            parse_datetime_str("2023-12-29T10:00:00Z")
        );
        assert!(oldest.covers(parse_datetime_str("2023-12-30T00:00:00Z").unwrap()));
        assert!(!oldest.covers(parse_datetime_str("2024-01-02T00:00:00Z").unwrap()));

        let value = oldest.to_value(&names);
        assert_eq!(value.get_key("Story Points"), Some(&Value::from("3")));
        assert!(value.get_key("changelog").is_none());
    }
}
