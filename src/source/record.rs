// 原始记录
//
// 数据源返回的 JSON 记录在进入流水线前转换为字段映射:
// `fields` 下的声明字段 + 顶层公开键 (如 `key`/`id`/展开字段)。

use serde_json::Value as JsonValue;

use crate::dsl::value::{Bindings, Value};

/// 展开后的记录
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    raw: JsonValue,
    fields: Bindings,
}

impl Record {
    /// 由原始 JSON 构建
    ///
    /// 跳过 `_` 开头的键与全大写键 (常量); 带 `self` 链接的嵌套对象转为资源。
    pub fn from_json(raw: JsonValue) -> Self {
        let mut fields = Bindings::new();

        if let Some(object) = raw.as_object() {
            if let Some(declared) = object.get("fields").and_then(JsonValue::as_object) {
                for (name, value) in declared {
                    if !name.starts_with('_') {
                        fields.insert(name.clone(), Value::hydrate(value));
                    }
                }
            }
            for (name, value) in object {
                if is_public_attribute(name) {
                    fields.insert(name.clone(), Value::hydrate(value));
                }
            }
        }

        Self { raw, fields }
    }

    pub fn raw(&self) -> &JsonValue {
        &self.raw
    }

    pub fn fields(&self) -> &Bindings {
        &self.fields
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// 记录的 `key` (日志用)
    pub fn key(&self) -> Option<String> {
        self.fields.get("key").map(|v| v.to_string())
    }
}

fn is_public_attribute(name: &str) -> bool {
    name != "fields" && !name.starts_with('_') && name.to_uppercase() != name
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_flattens_fields_and_top_level() {
        let record = Record::from_json(json!({
            "key": "ALPHA-1",
            "id": "10001",
            "_internal": true,
            "ID_CONSTANT": 1,
            "changelog": {"total": 0},
            "fields": {
                "summary": "My Ticket",
                "_hidden": 1,
                "status": {"self": "https://tracker/status/1", "name": "Open"}
            }
        }));

        assert_eq!(record.get("summary"), Some(&Value::from("My Ticket")));
        assert_eq!(record.get("key"), Some(&Value::from("ALPHA-1")));
        assert!(record.get("changelog").is_some());
        assert!(record.get("_internal").is_none());
        assert!(record.get("_hidden").is_none());
        assert!(record.get("ID_CONSTANT").is_none());
        assert!(record.get("fields").is_none());
        assert!(matches!(record.get("status"), Some(Value::Resource(_))));
        assert_eq!(record.key().as_deref(), Some("ALPHA-1"));
    }

    #[test]
    fn test_non_object_record_is_empty() {
        let record = Record::from_json(json!([1, 2]));
        assert!(record.fields().is_empty());
    }
}
