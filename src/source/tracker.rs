// 工单系统连接
//
// 数据源只通过 IssueTracker 与远端交互; 网络客户端在本 crate 之外实现。
// StaticTracker 是内存实现, 可从 JSON 导出文件加载, 分页行为与远端 API 一致。

use std::collections::BTreeMap;
use std::path::Path;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::{Result, SelectError};

/// 一页结果
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Page {
    /// 服务端报告的总数
    pub total: u64,
    pub values: Vec<JsonValue>,
    pub is_last: bool,
}

/// 工单搜索请求
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SearchRequest {
    pub jql: String,
    pub start_at: u64,
    pub max_results: u64,
    pub expand: String,
    pub fields: String,
}

/// 看板列表请求
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BoardRequest {
    pub start_at: u64,
    pub max_results: u64,
    pub board_type: Option<String>,
    pub name: Option<String>,
}

/// 迭代列表请求
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SprintRequest {
    pub board_id: i64,
    pub start_at: u64,
    pub max_results: u64,
    pub state: Option<String>,
}

/// 已发出的请求 (用于回放与断言)
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum TrackerRequest {
    Fields,
    Search(SearchRequest),
    Boards(BoardRequest),
    Sprints(SprintRequest),
    Issue(String),
    Sprint(i64),
}

/// 工单系统连接
#[cfg_attr(test, mockall::automock)]
pub trait IssueTracker: Send + Sync {
    /// 连接标识 (实例地址 + 用户), 参与缓存键
    fn client_info(&self) -> String;

    /// 字段定义 (`id`, `name`, `schema.type`)
    fn fields(&self) -> Result<Vec<JsonValue>>;

    fn search_issues(&self, request: &SearchRequest) -> Result<Page>;

    fn boards(&self, request: &BoardRequest) -> Result<Page>;

    fn sprints(&self, request: &SprintRequest) -> Result<Page>;

    /// 按 key 取单个工单 (含变更记录)
    fn issue(&self, key: &str) -> Result<JsonValue>;

    /// 按 id 取单个迭代
    fn sprint(&self, sprint_id: i64) -> Result<JsonValue>;
}

// ═══════════════════════════════════════════════════════════════════════════
// 内存实现
// ═══════════════════════════════════════════════════════════════════════════

/// 导出文件格式
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct TrackerExport {
    client_info: Option<String>,
    fields: Vec<JsonValue>,
    issues: Vec<JsonValue>,
    boards: Vec<JsonValue>,
    sprints: BTreeMap<String, Vec<JsonValue>>,
}

/// 内存工单系统
///
/// JQL 不做解释, 只记录; 看板按 type / name (包含) 过滤, 迭代按 state 过滤。
#[derive(Debug, Default)]
pub struct StaticTracker {
    client_info: String,
    fields: Vec<JsonValue>,
    issues: Vec<JsonValue>,
    boards: Vec<JsonValue>,
    sprints: BTreeMap<String, Vec<JsonValue>>,
    requests: Mutex<Vec<TrackerRequest>>,
}

impl StaticTracker {
    pub fn new(client_info: impl Into<String>) -> Self {
        Self {
            client_info: client_info.into(),
            ..Self::default()
        }
    }

    pub fn with_fields(mut self, fields: Vec<JsonValue>) -> Self {
        self.fields = fields;
        self
    }

    pub fn with_issues(mut self, issues: Vec<JsonValue>) -> Self {
        self.issues = issues;
        self
    }

    pub fn with_boards(mut self, boards: Vec<JsonValue>) -> Self {
        self.boards = boards;
        self
    }

    pub fn with_sprints(mut self, board_id: i64, sprints: Vec<JsonValue>) -> Self {
        self.sprints.insert(board_id.to_string(), sprints);
        self
    }

    /// 从导出 JSON 构建
    pub fn from_json(value: JsonValue) -> Result<Self> {
        let export: TrackerExport = serde_json::from_value(value)?;
        Ok(Self {
            client_info: export.client_info.unwrap_or_else(|| "static".to_string()),
            fields: export.fields,
            issues: export.issues,
            boards: export.boards,
            sprints: export.sprints,
            requests: Mutex::new(Vec::new()),
        })
    }

    /// 从导出文件加载
    pub fn from_export<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            SelectError::Source(format!("Failed to read export {}: {}", path.display(), e))
        })?;
        let value: JsonValue = serde_json::from_str(&content)?;
        Self::from_json(value)
    }

    /// 已发出的请求
    pub fn requests(&self) -> Vec<TrackerRequest> {
        self.requests.lock().clone()
    }

    fn record(&self, request: TrackerRequest) {
        self.requests.lock().push(request);
    }
}

fn paginate(items: &[&JsonValue], start_at: u64, max_results: u64) -> Page {
    let total = items.len() as u64;
    let start = start_at.min(total) as usize;
    let end = start_at.saturating_add(max_results).min(total) as usize;
    Page {
        total,
        values: items[start..end].iter().map(|v| (*v).clone()).collect(),
        is_last: end as u64 >= total,
    }
}

fn text_field<'a>(value: &'a JsonValue, name: &str) -> Option<&'a str> {
    value.get(name).and_then(JsonValue::as_str)
}

impl IssueTracker for StaticTracker {
    fn client_info(&self) -> String {
        self.client_info.clone()
    }

    fn fields(&self) -> Result<Vec<JsonValue>> {
        self.record(TrackerRequest::Fields);
        Ok(self.fields.clone())
    }

    fn search_issues(&self, request: &SearchRequest) -> Result<Page> {
        self.record(TrackerRequest::Search(request.clone()));
        let items: Vec<&JsonValue> = self.issues.iter().collect();
        Ok(paginate(&items, request.start_at, request.max_results))
    }

    fn boards(&self, request: &BoardRequest) -> Result<Page> {
        self.record(TrackerRequest::Boards(request.clone()));
        let items: Vec<&JsonValue> = self
            .boards
            .iter()
            .filter(|board| match &request.board_type {
                Some(t) => text_field(board, "type") == Some(t.as_str()),
                None => true,
            })
            .filter(|board| match &request.name {
                Some(n) => text_field(board, "name").map_or(false, |name| name.contains(n.as_str())),
                None => true,
            })
            .collect();
        Ok(paginate(&items, request.start_at, request.max_results))
    }

    fn sprints(&self, request: &SprintRequest) -> Result<Page> {
        self.record(TrackerRequest::Sprints(request.clone()));
        let sprints = self
            .sprints
            .get(&request.board_id.to_string())
            .ok_or_else(|| {
                SelectError::Source(format!(
                    "The board does not support sprints: {}",
                    request.board_id
                ))
            })?;
        let states: Option<Vec<&str>> = request
            .state
            .as_deref()
            .map(|s| s.split(',').map(str::trim).collect());
        let items: Vec<&JsonValue> = sprints
            .iter()
            .filter(|sprint| match &states {
                Some(states) => text_field(sprint, "state").map_or(false, |s| states.contains(&s)),
                None => true,
            })
            .collect();
        Ok(paginate(&items, request.start_at, request.max_results))
    }

    fn issue(&self, key: &str) -> Result<JsonValue> {
        self.record(TrackerRequest::Issue(key.to_string()));
        self.issues
            .iter()
            .find(|issue| text_field(issue, "key") == Some(key))
            .cloned()
            .ok_or_else(|| SelectError::Source(format!("Issue does not exist: {}", key)))
    }

    fn sprint(&self, sprint_id: i64) -> Result<JsonValue> {
        self.record(TrackerRequest::Sprint(sprint_id));
        self.sprints
            .values()
            .flatten()
            .find(|sprint| sprint.get("id").and_then(JsonValue::as_i64) == Some(sprint_id))
            .cloned()
            .ok_or_else(|| SelectError::Source(format!("Sprint does not exist: {}", sprint_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn search(start_at: u64, max_results: u64) -> SearchRequest {
        SearchRequest {
            jql: String::new(),
            start_at,
            max_results,
            expand: String::new(),
            fields: "*all".to_string(),
        }
    }

    #[test]
    fn test_search_paginates() {
        let tracker = StaticTracker::new("test").with_issues(
            (1..=5).map(|i| json!({"key": format!("A-{}", i)})).collect(),
        );
        let first = tracker.search_issues(&search(0, 2)).unwrap();
        assert_eq!(first.total, 5);
        assert_eq!(first.values.len(), 2);
        assert!(!first.is_last);

        let last = tracker.search_issues(&search(4, 2)).unwrap();
        assert_eq!(last.values, vec![json!({"key": "A-5"})]);
        assert!(last.is_last);

        let beyond = tracker.search_issues(&search(10, 2)).unwrap();
        assert!(beyond.values.is_empty());
        assert_eq!(tracker.requests().len(), 3);
    }

    #[test]
    fn test_board_and_sprint_filters() {
        let tracker = StaticTracker::from_json(json!({
            "boards": [
                {"id": 1, "name": "Alpha board", "type": "scrum"},
                {"id": 2, "name": "Beta board", "type": "kanban"}
            ],
            "sprints": {
                "1": [
                    {"id": 10, "name": "S1", "state": "closed"},
                    {"id": 11, "name": "S2", "state": "active"}
                ]
            }
        }))
        .unwrap();

        let boards = tracker
            .boards(&BoardRequest {
                max_results: 50,
                board_type: Some("scrum".into()),
                ..BoardRequest::default()
            })
            .unwrap();
        assert_eq!(boards.total, 1);

        let sprints = tracker
            .sprints(&SprintRequest {
                board_id: 1,
                start_at: 0,
                max_results: 50,
                state: Some("active".into()),
            })
            .unwrap();
        assert_eq!(sprints.values, vec![json!({"id": 11, "name": "S2", "state": "active"})]);

        let missing = tracker.sprints(&SprintRequest {
            board_id: 2,
            start_at: 0,
            max_results: 50,
            state: None,
        });
        assert!(matches!(missing, Err(SelectError::Source(_))));
    }

    #[test]
    fn test_single_issue_and_sprint_lookup() {
        let tracker = StaticTracker::new("test")
            .with_issues(vec![json!({"key": "A-1"}), json!({"key": "A-2"})])
            .with_sprints(3, vec![json!({"id": 30, "name": "S30"})]);

        assert_eq!(tracker.issue("A-2").unwrap(), json!({"key": "A-2"}));
        assert!(matches!(tracker.issue("A-9"), Err(SelectError::Source(_))));
        assert_eq!(tracker.sprint(30).unwrap()["name"], json!("S30"));
        assert!(matches!(tracker.sprint(31), Err(SelectError::Source(_))));
        assert_eq!(
            tracker.requests(),
            vec![
                TrackerRequest::Issue("A-2".into()),
                TrackerRequest::Issue("A-9".into()),
                TrackerRequest::Sprint(30),
                TrackerRequest::Sprint(31),
            ]
        );
    }

    #[test]
    fn test_export_defaults() {
        let tracker = StaticTracker::from_json(json!({})).unwrap();
        assert_eq!(tracker.client_info(), "static");
        assert!(tracker.fields().unwrap().is_empty());
    }
}
