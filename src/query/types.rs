// 查询定义类型 (序列化形式)
//
// 查询文件 (YAML / JSON) 的顶层键严格限定, 多余键在解析时拒绝。

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use serde::de::{Deserializer, MapAccess, Visitor};
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::dsl::value::format_float;
use crate::{Result, SelectError};

// ═══════════════════════════════════════════════════════════════════════════
// 表达式文本
// ═══════════════════════════════════════════════════════════════════════════

/// 表达式文本
///
/// 查询文件里 `group_by: [True]` 这类写法会被 YAML 解析成布尔/数字,
/// 统一转成表达式源码 (`True` / `1`)。
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "RawExpression", into = "String")]
pub struct ExpressionText(pub String);

#[derive(Deserialize)]
#[serde(untagged)]
enum RawExpression {
    Text(String),
    Flag(bool),
    Integer(i64),
    Float(f64),
}

impl From<RawExpression> for ExpressionText {
    fn from(raw: RawExpression) -> Self {
        ExpressionText(match raw {
            RawExpression::Text(s) => s,
            RawExpression::Flag(true) => "True".to_string(),
            RawExpression::Flag(false) => "False".to_string(),
            RawExpression::Integer(i) => i.to_string(),
            RawExpression::Float(f) => format_float(f),
        })
    }
}

impl From<ExpressionText> for String {
    fn from(text: ExpressionText) -> Self {
        text.0
    }
}

impl From<&str> for ExpressionText {
    fn from(s: &str) -> Self {
        ExpressionText(s.to_string())
    }
}

impl ExpressionText {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ExpressionText {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// 列映射 (保持声明顺序)
// ═══════════════════════════════════════════════════════════════════════════

/// 列名 → 表达式 (表达式为空时使用列名本身)
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ColumnMap(pub Vec<(String, Option<String>)>);

impl ColumnMap {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// (表达式, 列名) 对
    pub fn pairs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(column, expression)| {
            (expression.as_deref().unwrap_or(column.as_str()), column.as_str())
        })
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for ColumnMap {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        ColumnMap(
            iter.into_iter()
                .map(|(k, v)| (k.into(), Some(v.into())))
                .collect(),
        )
    }
}

impl Serialize for ColumnMap {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (column, expression) in &self.0 {
            map.serialize_entry(column, expression)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for ColumnMap {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct ColumnMapVisitor;

        impl<'de> Visitor<'de> for ColumnMapVisitor {
            type Value = ColumnMap;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a mapping of column names to expressions")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> std::result::Result<ColumnMap, A::Error> {
                let mut entries = Vec::with_capacity(access.size_hint().unwrap_or(0));
                while let Some((column, expression)) =
                    access.next_entry::<String, Option<ExpressionText>>()?
                {
                    entries.push((column, expression.map(String::from)));
                }
                Ok(ColumnMap(entries))
            }
        }

        deserializer.deserialize_map(ColumnMapVisitor)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// select / where / cache
// ═══════════════════════════════════════════════════════════════════════════

/// 显式 {expression, column} 字段
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SelectFieldDefinition {
    pub expression: String,
    pub column: String,
}

impl SelectFieldDefinition {
    pub fn new(expression: impl Into<String>, column: impl Into<String>) -> Self {
        Self {
            expression: expression.into(),
            column: column.into(),
        }
    }
}

/// select 列表中的一项
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldSpec {
    Text(String),
    Definition(SelectFieldDefinition),
}

/// select 子句的三种写法
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SelectSpec {
    /// `select: "*"` 或单个表达式
    Single(String),
    Fields(Vec<FieldSpec>),
    Columns(ColumnMap),
}

/// where 子句: 数据源原生查询片段 (AND 连接) 或参数映射
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WhereClause {
    Fragments(Vec<ExpressionText>),
    Params(serde_json::Map<String, JsonValue>),
}

impl Default for WhereClause {
    fn default() -> Self {
        WhereClause::Fragments(Vec::new())
    }
}

impl WhereClause {
    pub fn is_empty(&self) -> bool {
        match self {
            WhereClause::Fragments(items) => items.is_empty(),
            WhereClause::Params(map) => map.is_empty(),
        }
    }

    /// 片段文本 (参数映射形式返回空)
    pub fn fragments(&self) -> Vec<String> {
        match self {
            WhereClause::Fragments(items) => items.iter().map(|e| e.0.clone()).collect(),
            WhereClause::Params(_) => Vec::new(),
        }
    }
}

/// cache: 秒数, 或 (min_recency, max_store)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CacheSpec {
    Seconds(u64),
    Window(Option<u64>, Option<u64>),
}

impl CacheSpec {
    /// (min_recency, max_store)
    pub fn window(&self) -> (Option<u64>, Option<u64>) {
        match *self {
            CacheSpec::Seconds(n) => (Some(n), Some(n)),
            CacheSpec::Window(min_recency, max_store) => (min_recency, max_store),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// 查询定义
// ═══════════════════════════════════════════════════════════════════════════

/// 查询定义
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QueryDefinition {
    pub select: SelectSpec,

    #[serde(rename = "static", default, skip_serializing_if = "ColumnMap::is_empty")]
    pub static_columns: ColumnMap,

    #[serde(default, skip_serializing_if = "ColumnMap::is_empty")]
    pub calculate: ColumnMap,

    #[serde(rename = "from")]
    pub source: String,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub subqueries: BTreeMap<String, QueryDefinition>,

    #[serde(rename = "where", default)]
    pub where_clause: WhereClause,

    #[serde(default)]
    pub order_by: Vec<ExpressionText>,

    #[serde(rename = "filter", default)]
    pub filter: Vec<ExpressionText>,

    #[serde(default)]
    pub having: Vec<ExpressionText>,

    #[serde(default)]
    pub group_by: Vec<ExpressionText>,

    #[serde(default)]
    pub sort_by: Vec<ExpressionText>,

    #[serde(default)]
    pub expand: Vec<ExpressionText>,

    #[serde(default)]
    pub limit: Option<u64>,

    #[serde(default)]
    pub cap: Option<u64>,

    #[serde(default)]
    pub cache: Option<CacheSpec>,
}

impl QueryDefinition {
    /// 最小查询定义 (select + from)
    pub fn new(source: impl Into<String>, select: SelectSpec) -> Self {
        Self {
            select,
            static_columns: ColumnMap::default(),
            calculate: ColumnMap::default(),
            source: source.into(),
            subqueries: BTreeMap::new(),
            where_clause: WhereClause::default(),
            order_by: Vec::new(),
            filter: Vec::new(),
            having: Vec::new(),
            group_by: Vec::new(),
            sort_by: Vec::new(),
            expand: Vec::new(),
            limit: None,
            cap: None,
            cache: None,
        }
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// 从文件加载 (`.json` 按 JSON, 其余按 YAML)
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            SelectError::Query(format!("Failed to read query file {}: {}", path.display(), e))
        })?;
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Self::from_json(&content),
            _ => Self::from_yaml(&content),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// 数据源 schema
// ═══════════════════════════════════════════════════════════════════════════

/// 数据源字段描述
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaRow {
    pub id: String,
    #[serde(rename = "type")]
    pub field_type: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub raw: Option<JsonValue>,
}

impl SchemaRow {
    pub fn new(id: &str, field_type: &str, description: Option<&str>) -> Self {
        Self {
            id: id.to_string(),
            field_type: field_type.to_string(),
            description: description.map(str::to_string),
            raw: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_definition() {
        let definition = QueryDefinition::from_yaml(
            r#"
select:
  - key
  - "summary as \"Title\""
  - expression: len(labels)
    column: Labels
from: issues
where:
  - project = ALPHA
order_by:
  - created DESC
group_by:
  - True
sort_by:
  - key desc
limit: 10
cap: 5
cache: [60, null]
"#,
        )
        .unwrap();

        assert_eq!(definition.source, "issues");
        assert_eq!(definition.group_by, vec![ExpressionText::from("True")]);
        assert_eq!(definition.cache, Some(CacheSpec::Window(Some(60), None)));
        assert_eq!(definition.limit, Some(10));
        match &definition.select {
            SelectSpec::Fields(fields) => {
                assert_eq!(fields.len(), 3);
                assert_eq!(
                    fields[2],
                    FieldSpec::Definition(SelectFieldDefinition::new("len(labels)", "Labels"))
                );
            }
            other => panic!("unexpected select {:?}", other),
        }
    }

    #[test]
    fn test_unknown_key_rejected() {
        let result = QueryDefinition::from_yaml("select: [key]\nfrom: issues\norder: [key]\n");
        assert!(matches!(result, Err(SelectError::Serialization(_))));
    }

    #[test]
    fn test_from_is_required() {
        assert!(QueryDefinition::from_yaml("select: [key]\n").is_err());
    }

    #[test]
    fn test_column_mapping_keeps_order() {
        let definition = QueryDefinition::from_yaml(
            "select:\n  Zed: key\n  Alpha: null\n  Mid: summary\nfrom: issues\n",
        )
        .unwrap();
        let SelectSpec::Columns(columns) = definition.select else {
            panic!("expected column mapping");
        };
        let pairs: Vec<_> = columns.pairs().collect();
        assert_eq!(
            pairs,
            vec![("key", "Zed"), ("Alpha", "Alpha"), ("summary", "Mid")]
        );
    }

    #[test]
    fn test_where_params_and_cache_seconds() {
        let definition = QueryDefinition::from_json(
            r#"{"select": "*", "from": "boards", "where": {"type": "scrum"}, "cache": 300}"#,
        )
        .unwrap();
        assert!(matches!(definition.where_clause, WhereClause::Params(_)));
        assert_eq!(definition.cache.unwrap().window(), (Some(300), Some(300)));
        assert_eq!(definition.select, SelectSpec::Single("*".to_string()));
    }

    #[test]
    fn test_nested_subqueries() {
        let definition = QueryDefinition::from_yaml(
            r#"
select: [key]
from: issues
subqueries:
  children:
    select: [key]
    from: issues
    where:
      - parent = "{params.parent}"
"#,
        )
        .unwrap();
        let child = &definition.subqueries["children"];
        assert_eq!(child.where_clause.fragments(), vec!["parent = \"{params.parent}\""]);
    }
}
