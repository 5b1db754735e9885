// 阶段间计数通道与占位符来源

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::dsl::interpolate::Placeholders;
use crate::dsl::value::Value;

use super::types::SchemaRow;

/// 执行参数
pub type Parameters = BTreeMap<String, Value>;

/// 计数初值: 总数未知时进度条不会显示为已完成
pub const COUNTER_SENTINEL: u64 = 1 << 32;

// ═══════════════════════════════════════════════════════════════════════════
// 计数通道
// ═══════════════════════════════════════════════════════════════════════════

/// 计数通道
///
/// 上一阶段写入 "下游最终会看到多少条", 下一阶段据此刷新进度总数。
/// 每次执行为每个阶段边界新建一个。
#[derive(Debug, Clone)]
pub struct CounterChannel {
    value: Arc<AtomicU64>,
}

impl CounterChannel {
    pub fn new() -> Self {
        Self {
            value: Arc::new(AtomicU64::new(COUNTER_SENTINEL)),
        }
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    pub fn set(&self, value: u64) {
        self.value.store(value, Ordering::Relaxed);
    }

    pub fn zero(&self) {
        self.set(0);
    }

    pub fn increment(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// 总数是否已知
    pub fn is_known(&self) -> bool {
        self.get() != COUNTER_SENTINEL
    }
}

impl Default for CounterChannel {
    fn default() -> Self {
        Self::new()
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// 占位符来源
// ═══════════════════════════════════════════════════════════════════════════

/// 字段别名表
///
/// `{Story Points}` → 字段 id, `{params.x}` → 参数值; 未知名称原样输出。
#[derive(Debug, Clone)]
pub struct FieldNameMap {
    names: BTreeMap<String, String>,
    params: Value,
}

impl Default for FieldNameMap {
    fn default() -> Self {
        Self {
            names: BTreeMap::new(),
            params: Value::Map(BTreeMap::new()),
        }
    }
}

impl FieldNameMap {
    pub fn new(schema: &[SchemaRow], parameters: &Parameters) -> Self {
        let names = schema
            .iter()
            .filter_map(|row| {
                row.description
                    .as_ref()
                    .map(|description| (description.clone(), row.id.clone()))
            })
            .collect();
        Self {
            names,
            params: Value::Map(parameters.clone()),
        }
    }

    /// 已提供的参数名
    pub fn parameter_names(&self) -> Vec<String> {
        match &self.params {
            Value::Map(map) => map.keys().cloned().collect(),
            _ => Vec::new(),
        }
    }

    /// 按描述查字段 id
    pub fn field_id(&self, description: &str) -> Option<&str> {
        self.names.get(description).map(String::as_str)
    }
}

impl Placeholders for FieldNameMap {
    fn resolve(&self, name: &str) -> Option<Value> {
        if name == "params" {
            return Some(self.params.clone());
        }
        self.names.get(name).map(|id| Value::String(id.clone()))
    }

    fn pass_through_unknown(&self) -> bool {
        true
    }
}

/// 仅含参数的插值来源 (static 列使用; 未知名称报错)
#[derive(Debug, Clone)]
pub struct ParameterInterpolations {
    params: Value,
}

impl ParameterInterpolations {
    pub fn new(parameters: &Parameters) -> Self {
        Self {
            params: Value::Map(parameters.clone()),
        }
    }
}

impl Placeholders for ParameterInterpolations {
    fn resolve(&self, name: &str) -> Option<Value> {
        (name == "params").then(|| self.params.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dsl::interpolate::{interpolate, InterpolationError};

    #[test]
    fn test_counter_channel_shared() {
        let channel = CounterChannel::new();
        assert!(!channel.is_known());
        let downstream = channel.clone();
        channel.zero();
        channel.increment();
        channel.increment();
        assert_eq!(downstream.get(), 2);
        assert!(downstream.is_known());
    }

    #[test]
    fn test_field_name_map_interpolation() {
        let schema = vec![
            SchemaRow::new("customfield_10010", "number", Some("Jellybean Guess")),
            SchemaRow::new("key", "str", None),
        ];
        let mut params = Parameters::new();
        params.insert("ok".to_string(), Value::from("yes"));
        let names = FieldNameMap::new(&schema, &params);

        assert_eq!(
            interpolate("{Jellybean Guess} + 1", Some(&names)).unwrap(),
            "customfield_10010 + 1"
        );
        assert_eq!(interpolate("'{params.ok}'", Some(&names)).unwrap(), "'yes'");
        assert_eq!(interpolate("{summary}", Some(&names)).unwrap(), "summary");
        assert_eq!(names.parameter_names(), vec!["ok".to_string()]);
    }

    #[test]
    fn test_default_field_name_map_has_empty_params() {
        let names = FieldNameMap::default();
        assert!(names.parameter_names().is_empty());
        assert!(names.field_id("Story Points").is_none());
        assert_eq!(interpolate("{summary}", Some(&names)).unwrap(), "summary");
    }

    #[test]
    fn test_parameter_interpolations_are_strict() {
        let params = Parameters::new();
        let interpolations = ParameterInterpolations::new(&params);
        assert_eq!(
            interpolate("{summary}", Some(&interpolations)),
            Err(InterpolationError::UnknownField("summary".to_string()))
        );
        assert_eq!(
            interpolate("{params.run}", Some(&interpolations)),
            Err(InterpolationError::ParameterMissing("run".to_string()))
        );
    }
}
