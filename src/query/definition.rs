// 查询定义访问器
//
// 把 select/static/calculate 的多种写法统一成 (expression, column) 列表,
// 把 sort_by 解析成 (expression, descending)。

use once_cell::sync::Lazy;
use regex::Regex;

use super::types::{
    CacheSpec, ColumnMap, FieldSpec, QueryDefinition, SelectFieldDefinition, SelectSpec,
    WhereClause,
};

/// `expr as "Column"`
static FIELD_DISPLAY_DEFINITION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?s)^(?P<expression>.*) as "(?P<column>.*)"$"#).expect("valid select pattern")
});

/// 结尾的 ` desc` / ` asc` (不区分大小写)
static SORT_DIRECTION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)^(?P<expression>.*) (?P<direction>desc|asc)$").expect("valid sort pattern")
});

/// `*` 展开为数据源全部字段
pub const ALL_FIELDS: &str = "*";

/// 解析 `expr as "Column"` 简写; 无别名时列名即表达式
pub fn parse_select_definition(text: &str) -> SelectFieldDefinition {
    match FIELD_DISPLAY_DEFINITION.captures(text) {
        Some(caps) => SelectFieldDefinition::new(&caps["expression"], &caps["column"]),
        None => SelectFieldDefinition::new(text, text),
    }
}

/// 解析排序表达式, 返回 (表达式, 是否降序)
pub fn parse_sort_by_definition(text: &str) -> (String, bool) {
    match SORT_DIRECTION.captures(text) {
        Some(caps) => {
            let descending = caps["direction"].eq_ignore_ascii_case("desc");
            (caps["expression"].to_string(), descending)
        }
        None => (text.to_string(), false),
    }
}

/// 已校验的查询
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    definition: QueryDefinition,
}

impl Query {
    pub fn new(definition: QueryDefinition) -> Self {
        Self { definition }
    }

    pub fn definition(&self) -> &QueryDefinition {
        &self.definition
    }

    /// select 列; `*` 用 `all_fields` 展开
    pub fn select_with(&self, all_fields: &[SelectFieldDefinition]) -> Vec<SelectFieldDefinition> {
        let mut fields = Vec::new();
        match &self.definition.select {
            SelectSpec::Single(text) => push_field(&mut fields, text, all_fields),
            SelectSpec::Fields(items) => {
                for item in items {
                    match item {
                        FieldSpec::Text(text) => push_field(&mut fields, text, all_fields),
                        FieldSpec::Definition(definition) => fields.push(definition.clone()),
                    }
                }
            }
            SelectSpec::Columns(columns) => fields.extend(column_fields(columns)),
        }
        fields
    }

    /// select 列 (不展开 `*`)
    pub fn select(&self) -> Vec<SelectFieldDefinition> {
        self.select_with(&[])
    }

    /// select 中是否用到 `*`
    pub fn selects_all_fields(&self) -> bool {
        match &self.definition.select {
            SelectSpec::Single(text) => text == ALL_FIELDS,
            SelectSpec::Fields(items) => items
                .iter()
                .any(|item| matches!(item, FieldSpec::Text(text) if text == ALL_FIELDS)),
            SelectSpec::Columns(_) => false,
        }
    }

    pub fn static_columns(&self) -> Vec<SelectFieldDefinition> {
        column_fields(&self.definition.static_columns)
    }

    pub fn calculate(&self) -> Vec<SelectFieldDefinition> {
        column_fields(&self.definition.calculate)
    }

    pub fn source(&self) -> &str {
        &self.definition.source
    }

    pub fn subqueries(&self) -> &std::collections::BTreeMap<String, QueryDefinition> {
        &self.definition.subqueries
    }

    pub fn where_clause(&self) -> &WhereClause {
        &self.definition.where_clause
    }

    pub fn order_by(&self) -> Vec<String> {
        to_strings(&self.definition.order_by)
    }

    pub fn filter(&self) -> Vec<String> {
        to_strings(&self.definition.filter)
    }

    pub fn having(&self) -> Vec<String> {
        to_strings(&self.definition.having)
    }

    pub fn group_by(&self) -> Vec<String> {
        to_strings(&self.definition.group_by)
    }

    pub fn sort_by(&self) -> Vec<(String, bool)> {
        self.definition
            .sort_by
            .iter()
            .map(|e| parse_sort_by_definition(e.as_str()))
            .collect()
    }

    pub fn expand(&self) -> Vec<String> {
        to_strings(&self.definition.expand)
    }

    pub fn limit(&self) -> Option<u64> {
        self.definition.limit
    }

    pub fn cap(&self) -> Option<u64> {
        self.definition.cap
    }

    /// (min_recency, max_store); 单个整数 n 等价于 (n, n)
    pub fn cache(&self) -> Option<(Option<u64>, Option<u64>)> {
        self.definition.cache.as_ref().map(CacheSpec::window)
    }
}

impl From<QueryDefinition> for Query {
    fn from(definition: QueryDefinition) -> Self {
        Query::new(definition)
    }
}

fn push_field(fields: &mut Vec<SelectFieldDefinition>, text: &str, all: &[SelectFieldDefinition]) {
    if text == ALL_FIELDS {
        fields.extend(all.iter().cloned());
    } else {
        fields.push(parse_select_definition(text));
    }
}

fn column_fields(columns: &ColumnMap) -> Vec<SelectFieldDefinition> {
    columns
        .pairs()
        .map(|(expression, column)| SelectFieldDefinition::new(expression, column))
        .collect()
}

fn to_strings<T: ToString>(items: &[T]) -> Vec<String> {
    items.iter().map(ToString::to_string).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query(yaml: &str) -> Query {
        Query::new(QueryDefinition::from_yaml(yaml).unwrap())
    }

    #[test]
    fn test_select_shorthand() {
        assert_eq!(
            parse_select_definition(r#"len(key) as "Key Length""#),
            SelectFieldDefinition::new("len(key)", "Key Length")
        );
        assert_eq!(
            parse_select_definition("summary"),
            SelectFieldDefinition::new("summary", "summary")
        );
    }

    #[test]
    fn test_sort_by_direction() {
        assert_eq!(parse_sort_by_definition("story_points desc"), ("story_points".into(), true));
        assert_eq!(parse_sort_by_definition("key ASC"), ("key".into(), false));
        assert_eq!(parse_sort_by_definition("key"), ("key".into(), false));
        assert_eq!(parse_sort_by_definition("description"), ("description".into(), false));
    }

    #[test]
    fn test_star_expansion() {
        let q = query("select: ['*', 'len(key) as \"n\"']\nfrom: issues\n");
        assert!(q.selects_all_fields());
        let all = vec![
            SelectFieldDefinition::new("key", "key"),
            SelectFieldDefinition::new("summary", "Summary"),
        ];
        let fields = q.select_with(&all);
        assert_eq!(fields.len(), 3);
        assert_eq!(fields[2], SelectFieldDefinition::new("len(key)", "n"));
    }

    #[test]
    fn test_cache_window() {
        assert_eq!(
            query("select: [key]\nfrom: issues\ncache: 60\n").cache(),
            Some((Some(60), Some(60)))
        );
        assert_eq!(
            query("select: [key]\nfrom: issues\ncache: [null, 3600]\n").cache(),
            Some((None, Some(3600)))
        );
        assert_eq!(query("select: [key]\nfrom: issues\n").cache(), None);
    }

    #[test]
    fn test_static_and_calculate() {
        let q = query(
            "select: [key]\nfrom: issues\nstatic:\n  run: \"'{params.run}'\"\ncalculate:\n  double: story_points * 2\n",
        );
        assert_eq!(q.static_columns()[0], SelectFieldDefinition::new("'{params.run}'", "run"));
        assert_eq!(q.calculate()[0].column, "double");
    }
}
