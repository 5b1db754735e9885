// issues 数据源: JQL 搜索

use log::debug;
use serde_json::Value as JsonValue;

use crate::dsl::interpolate::{find_missing_parameters, interpolate, InterpolationError};
use crate::query::channel::ParameterInterpolations;
use crate::query::types::{SchemaRow, WhereClause};
use crate::{Result, SelectError};

use super::tracker::{IssueTracker, SearchRequest};
use super::{PagedSource, Source, SourceContext, SourceFactory};

/// 工单搜索
#[derive(Debug, Clone, Copy, Default)]
pub struct IssuesFactory;

impl IssuesFactory {
    /// 组装 JQL: 片段以 `(a) AND (b)` 连接, 替换参数, 追加 ORDER BY
    pub fn build_jql(context: &SourceContext) -> Result<String> {
        let fragments: Vec<String> = match context.query().where_clause() {
            WhereClause::Fragments(items) => items.iter().map(|e| e.to_string()).collect(),
            WhereClause::Params(map) if map.is_empty() => Vec::new(),
            WhereClause::Params(_) => {
                return Err(SelectError::Query(
                    "Issue queries 'where' should be a list of JQL expression strings.".into(),
                ))
            }
        };
        let query = fragments
            .iter()
            .map(|fragment| format!("({})", fragment))
            .collect::<Vec<_>>()
            .join(" AND ");

        let known: Vec<String> = context.parameters().keys().cloned().collect();
        if let Some(missing) = find_missing_parameters(&query, &known).into_iter().next() {
            return Err(SelectError::ParameterMissing(missing));
        }

        let interpolations = ParameterInterpolations::new(context.parameters());
        let mut jql = interpolate(&query, Some(&interpolations)).map_err(|e| match e {
            InterpolationError::ParameterMissing(name) => SelectError::ParameterMissing(name),
            InterpolationError::UnknownField(name) => SelectError::FieldName(name),
            InterpolationError::Malformed(msg) => SelectError::Query(format!("{}: {}", msg, query)),
        })?;

        let order_by = context.query().order_by();
        if !order_by.is_empty() {
            jql = format!("{} ORDER BY {}", jql, order_by.join(", "));
        }
        Ok(jql)
    }
}

impl SourceFactory for IssuesFactory {
    fn name(&self) -> &str {
        "issues"
    }

    fn base_schema(&self) -> Vec<SchemaRow> {
        vec![
            SchemaRow::new("key", "str", None),
            SchemaRow::new("id", "int", None),
        ]
    }

    /// 固定字段 + 连接上的全部字段定义
    fn schema(&self, tracker: &dyn IssueTracker) -> Result<Vec<SchemaRow>> {
        let mut schema = self.base_schema();
        for column in tracker.fields()? {
            let text = |path: &[&str]| {
                path.iter()
                    .try_fold(&column, |value, key| value.get(*key))
                    .and_then(JsonValue::as_str)
                    .unwrap_or_default()
                    .to_string()
            };
            schema.push(SchemaRow {
                id: text(&["id"]),
                field_type: text(&["schema", "type"]),
                description: Some(text(&["name"])),
                raw: Some(column.clone()),
            });
        }
        Ok(schema)
    }

    fn open(&self, context: SourceContext) -> Result<Box<dyn Source>> {
        let jql = Self::build_jql(&context)?;
        let expand = context.query().expand().join(",");
        debug!("Searching issues with JQL: {}", jql);

        let fetch = Box::new(move |tracker: &dyn IssueTracker, start_at: u64, max_results: u64| {
            tracker.search_issues(&SearchRequest {
                jql: jql.clone(),
                start_at,
                max_results,
                expand: expand.clone(),
                fields: "*all".to_string(),
            })
        });
        Ok(Box::new(PagedSource::new(context, fetch)))
    }
}
