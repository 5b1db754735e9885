// 结果模型
//
// 单条记录与分组记录统一提供 as_dict / single / evaluate_expression。
// 分组后, 每个字段变为成员值列表 (跳过 NULL, 与 SQL 聚合一致)。

use std::sync::Arc;

use once_cell::unsync::OnceCell;

use crate::dsl::executor::{ErrorMode, ExpressionEngine};
use crate::dsl::interpolate::find_missing_parameters;
use crate::dsl::value::{Bindings, Value};
use crate::source::record::Record;
use crate::{Result, SelectError};

use super::channel::FieldNameMap;

// ═══════════════════════════════════════════════════════════════════════════
// 单条结果
// ═══════════════════════════════════════════════════════════════════════════

/// 单条记录 + calculate 阶段写入的覆盖值
#[derive(Debug, Clone)]
pub struct SingleResult {
    record: Arc<Record>,
    overlay: Bindings,
    names: OnceCell<Bindings>,
}

impl SingleResult {
    pub fn new(record: Record) -> Self {
        Self {
            record: Arc::new(record),
            overlay: Bindings::new(),
            names: OnceCell::new(),
        }
    }

    pub fn record(&self) -> &Record {
        &self.record
    }

    pub fn as_dict(&self) -> &Bindings {
        self.names.get_or_init(|| {
            let mut names = self.record.fields().clone();
            names.extend(self.overlay.iter().map(|(k, v)| (k.clone(), v.clone())));
            names
        })
    }

    pub fn set(&mut self, name: &str, value: Value) {
        self.overlay.insert(name.to_string(), value);
        self.names.take();
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// 分组结果
// ═══════════════════════════════════════════════════════════════════════════

/// 共享同一分组键的记录
#[derive(Debug, Clone)]
pub struct GroupedResult {
    rows: Vec<SingleResult>,
    overlay: Bindings,
    names: OnceCell<Bindings>,
}

impl GroupedResult {
    pub fn new(first: SingleResult) -> Self {
        Self {
            rows: vec![first],
            overlay: Bindings::new(),
            names: OnceCell::new(),
        }
    }

    pub fn rows(&self) -> &[SingleResult] {
        &self.rows
    }

    pub fn add(&mut self, row: SingleResult) {
        self.rows.push(row);
        self.names.take();
    }

    pub fn single(&self) -> &SingleResult {
        &self.rows[0]
    }

    /// 所有成员出现过的字段名 (排序)
    pub fn all_fields(&self) -> Vec<String> {
        let mut fields: Vec<String> = self
            .rows
            .iter()
            .flat_map(|row| row.as_dict().keys().cloned())
            .collect();
        fields.sort();
        fields.dedup();
        fields
    }

    /// 字段 → 非空成员值列表
    pub fn as_dict(&self) -> &Bindings {
        self.names.get_or_init(|| {
            let mut names = self.overlay.clone();
            for field in self.all_fields() {
                let values = self
                    .rows
                    .iter()
                    .filter_map(|row| row.as_dict().get(&field))
                    .filter(|value| !value.is_null())
                    .cloned()
                    .collect();
                names.insert(field, Value::List(values));
            }
            names
        })
    }

    pub fn set(&mut self, name: &str, value: Value) {
        self.overlay.insert(name.to_string(), value);
        self.names.take();
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// 结果行
// ═══════════════════════════════════════════════════════════════════════════

/// 流水线中的一行
#[derive(Debug, Clone)]
pub enum ResultRow {
    Single(SingleResult),
    Grouped(GroupedResult),
}

impl ResultRow {
    pub fn as_dict(&self) -> &Bindings {
        match self {
            ResultRow::Single(row) => row.as_dict(),
            ResultRow::Grouped(group) => group.as_dict(),
        }
    }

    pub fn single(&self) -> &SingleResult {
        match self {
            ResultRow::Single(row) => row,
            ResultRow::Grouped(group) => group.single(),
        }
    }

    pub fn set(&mut self, name: &str, value: Value) {
        match self {
            ResultRow::Single(row) => row.set(name, value),
            ResultRow::Grouped(group) => group.set(name, value),
        }
    }

    /// 成员记录的 key (日志用)
    pub fn describe(&self) -> String {
        match self {
            ResultRow::Single(row) => row.record().key().unwrap_or_default(),
            ResultRow::Grouped(group) => group
                .rows()
                .iter()
                .filter_map(|row| row.record().key())
                .collect::<Vec<_>>()
                .join(", "),
        }
    }

    /// 对本行求值表达式
    ///
    /// 表达式文本包含某个分组表达式时, 改为对首个成员求值 (分组键只返回一次标量)。
    pub fn evaluate_expression(
        &self,
        expression: &str,
        group_by: &[String],
        names: &FieldNameMap,
        engine: &ExpressionEngine,
    ) -> Result<Value> {
        if let Some(missing) = find_missing_parameters(expression, &names.parameter_names())
            .into_iter()
            .next()
        {
            return Err(SelectError::ParameterMissing(missing));
        }

        let bindings = if includes_group_by(expression, group_by) {
            self.single().as_dict()
        } else {
            self.as_dict()
        };

        engine.evaluate(expression, bindings, Some(names), ErrorMode::Lenient)
    }
}

impl From<SingleResult> for ResultRow {
    fn from(row: SingleResult) -> Self {
        ResultRow::Single(row)
    }
}

/// 表达式文本是否包含任一分组表达式
pub fn includes_group_by(expression: &str, group_by: &[String]) -> bool {
    group_by.iter().any(|g| expression.contains(g.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dsl::functions::FunctionRegistry;
    use crate::query::channel::Parameters;
    use serde_json::json;

    fn single(value: serde_json::Value) -> SingleResult {
        SingleResult::new(Record::from_json(value))
    }

    fn engine() -> ExpressionEngine {
        ExpressionEngine::new(Arc::new(FunctionRegistry::builtin()))
    }

    #[test]
    fn test_overlay_wins() {
        let mut row = single(json!({"key": "A-1", "fields": {"points": 1}}));
        assert_eq!(row.as_dict().get("points"), Some(&Value::Integer(1)));
        row.set("points", Value::Integer(5));
        assert_eq!(row.as_dict().get("points"), Some(&Value::Integer(5)));
        assert_eq!(row.as_dict().get("key"), Some(&Value::from("A-1")));
    }

    #[test]
    fn test_grouped_skips_nulls() {
        let mut group = GroupedResult::new(single(json!({"fields": {"x": 1}})));
        group.add(single(json!({"fields": {"x": null}})));
        group.add(single(json!({"fields": {"x": 2, "y": "only"}})));

        assert_eq!(
            group.as_dict().get("x"),
            Some(&Value::List(vec![Value::Integer(1), Value::Integer(2)]))
        );
        assert_eq!(
            group.as_dict().get("y"),
            Some(&Value::List(vec![Value::from("only")]))
        );
        assert_eq!(group.all_fields(), vec!["x".to_string(), "y".to_string()]);
        assert_eq!(group.single().as_dict().get("x"), Some(&Value::Integer(1)));
    }

    #[test]
    fn test_group_key_forces_single() {
        let mut group = GroupedResult::new(single(json!({"fields": {"kind": "Issue", "n": 1}})));
        group.add(single(json!({"fields": {"kind": "Issue", "n": 2}})));
        let row = ResultRow::Grouped(group);
        let names = FieldNameMap::default();
        let group_by = vec!["kind".to_string()];
        let engine = engine();

        assert_eq!(
            row.evaluate_expression("kind", &group_by, &names, &engine).unwrap(),
            Value::from("Issue")
        );
        assert_eq!(
            row.evaluate_expression("sum(n)", &group_by, &names, &engine).unwrap(),
            Value::Integer(3)
        );
    }

    #[test]
    fn test_missing_parameter_checked_first() {
        let row = ResultRow::Single(single(json!({"fields": {}})));
        let names = FieldNameMap::new(&[], &Parameters::new());
        let result = row.evaluate_expression("'{params.ok}'", &[], &names, &engine());
        assert!(matches!(result, Err(SelectError::ParameterMissing(name)) if name == "ok"));
    }

    #[test]
    fn test_missing_field_is_null() {
        let row = ResultRow::Single(single(json!({"fields": {}})));
        let names = FieldNameMap::default();
        assert_eq!(
            row.evaluate_expression("nope.deeper", &[], &names, &engine()).unwrap(),
            Value::Null
        );
    }
}
