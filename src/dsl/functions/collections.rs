//! 集合与 JSON 工具函数

use std::io;

use serde::Serialize;

use super::{CallArgs, FunctionRegistry};
use crate::dsl::executor::{ExecutionError, ExecutionResult};
use crate::dsl::value::Value;

pub(super) fn register(registry: &mut FunctionRegistry) {
    registry.register("coalesce", |_: &FunctionRegistry, args: CallArgs| {
        Ok(args
            .positional
            .into_iter()
            .find(|v| !v.is_null())
            .unwrap_or(Value::Null))
    });
    registry.register("array_len", |_: &FunctionRegistry, args: CallArgs| {
        args.expect_count("array_len", 1, 1)?;
        match &args.positional[0] {
            Value::Null => Ok(Value::Null),
            other => other.len().map(|n| Value::Integer(n as i64)).ok_or_else(|| {
                ExecutionError::TypeError(format!(
                    "object of type '{}' has no len()",
                    other.type_name()
                ))
            }),
        }
    });
    registry.register("array_item", |_: &FunctionRegistry, args: CallArgs| {
        args.expect_count("array_item", 2, 2)?;
        match &args.positional[0] {
            Value::Null => Ok(Value::Null),
            array => match array.index(&args.positional[1]) {
                Err(ExecutionError::IndexError(_)) => Ok(Value::Null),
                other => other,
            },
        }
    });
    registry.register("flatten_list", |_: &FunctionRegistry, args: CallArgs| {
        args.expect_count("flatten_list", 1, 1)?;
        let mut flat = Vec::new();
        for sublist in args.positional[0].iterate()? {
            if !sublist.is_truthy() {
                continue;
            }
            flat.extend(sublist.iterate()?.into_iter().filter(Value::is_truthy));
        }
        Ok(Value::List(flat))
    });
    registry.register("extract", extract);
    registry.register("union", union);
    registry.register("simple_filter", |_: &FunctionRegistry, args: CallArgs| {
        simple_filter(args, "simple_filter", Combine::All)
    });
    registry.register("simple_filter_any", |_: &FunctionRegistry, args: CallArgs| {
        simple_filter(args, "simple_filter_any", Combine::Any)
    });
    registry.register("json_loads", |_: &FunctionRegistry, args: CallArgs| {
        args.expect_count("json_loads", 1, 1)?;
        let text = args.positional[0].as_str().ok_or_else(|| {
            ExecutionError::TypeError(format!(
                "the JSON object must be str, not {}",
                args.positional[0].type_name()
            ))
        })?;
        serde_json::from_str::<serde_json::Value>(text)
            .map(|json| Value::from_json(&json))
            .map_err(|e| ExecutionError::ValueError(e.to_string()))
    });
    registry.register("json_dumps", json_dumps);
}

/// 按点路径从每个成员中取值, 跳过取不到或为 NULL 的成员
fn extract(_: &FunctionRegistry, args: CallArgs) -> ExecutionResult<Value> {
    args.expect_count("extract", 2, 2)?;
    let path = args.positional[1].as_str().ok_or_else(|| {
        ExecutionError::TypeError("extract() path must be a string".into())
    })?;
    let parts: Vec<&str> = path.split('.').collect();

    let mut values = Vec::new();
    for item in args.positional[0].iterate()? {
        let mut cursor = Some(&item);
        for part in &parts {
            cursor = cursor.and_then(|c| c.get_key(part));
        }
        if let Some(found) = cursor.filter(|v| !v.is_null()) {
            values.push(found.clone());
        }
    }
    Ok(Value::List(values))
}

/// 合并映射或去重合并列表
fn union(_: &FunctionRegistry, args: CallArgs) -> ExecutionResult<Value> {
    args.expect_count("union", 1, 1)?;
    let mut items = args.positional[0].iterate()?.into_iter();
    let first = items.next().ok_or_else(|| {
        ExecutionError::TypeError("reduce() of empty iterable with no initial value".into())
    })?;

    items.try_fold(first, |acc, item| match (acc, item) {
        (Value::Map(mut merged), Value::Map(other)) => {
            merged.extend(other);
            Ok(Value::Map(merged))
        }
        (Value::List(mut merged), Value::List(other)) => {
            for v in other {
                if !merged.iter().any(|m| m.py_eq(&v)) {
                    merged.push(v);
                }
            }
            Ok(Value::List(merged))
        }
        (a, b) => Err(ExecutionError::TypeError(format!(
            "unsupported operand type(s) for |: '{}' and '{}'",
            a.type_name(),
            b.type_name()
        ))),
    })
}

// ═══════════════════════════════════════════════════════════════════════════
// simple_filter: `field__lookup=value` 形式的过滤
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Clone, Copy)]
enum Combine {
    All,
    Any,
}

const LOOKUPS: [&str; 11] = [
    "eq", "ne", "lt", "lte", "gt", "gte", "in", "notin", "contains", "icontains", "isnull",
];

fn simple_filter(args: CallArgs, function: &str, combine: Combine) -> ExecutionResult<Value> {
    args.expect_count(function, 1, 1)?;
    let conditions: Vec<(String, &str, &Value)> = args
        .keywords
        .iter()
        .map(|(key, value)| {
            let (field, lookup) = match key.rsplit_once("__") {
                Some((field, lookup)) if LOOKUPS.contains(&lookup) => (field.to_string(), lookup),
                _ => (key.clone(), "eq"),
            };
            (field, lookup, value)
        })
        .collect();

    let mut kept = Vec::new();
    for item in args.positional[0].iterate()? {
        let mut results = Vec::with_capacity(conditions.len());
        for (field, lookup, expected) in &conditions {
            let actual = item.get_key(field).cloned().unwrap_or(Value::Null);
            results.push(matches_lookup(&actual, lookup, expected)?);
        }
        let keep = match combine {
            Combine::All => results.iter().all(|r| *r),
            Combine::Any => results.iter().any(|r| *r),
        };
        if keep {
            kept.push(item);
        }
    }
    Ok(Value::List(kept))
}

fn matches_lookup(actual: &Value, lookup: &str, expected: &Value) -> ExecutionResult<bool> {
    use std::cmp::Ordering;

    let ordered = |wanted: &[Ordering]| -> bool {
        !actual.is_null()
            && actual
                .py_cmp(expected)
                .map(|o| wanted.contains(&o))
                .unwrap_or(false)
    };

    Ok(match lookup {
        "eq" => actual.py_eq(expected),
        "ne" => !actual.py_eq(expected),
        "lt" => ordered(&[Ordering::Less]),
        "lte" => ordered(&[Ordering::Less, Ordering::Equal]),
        "gt" => ordered(&[Ordering::Greater]),
        "gte" => ordered(&[Ordering::Greater, Ordering::Equal]),
        "in" => expected.contains(actual).unwrap_or(false),
        "notin" => !expected.contains(actual).unwrap_or(false),
        "contains" => actual.contains(expected).unwrap_or(false),
        "icontains" => match (actual, expected) {
            (Value::String(a), Value::String(e)) => a.to_lowercase().contains(&e.to_lowercase()),
            _ => actual.contains(expected).unwrap_or(false),
        },
        "isnull" => actual.is_null() == expected.is_truthy(),
        other => {
            return Err(ExecutionError::ArgumentError(format!(
                "Unsupported filter lookup: {}",
                other
            )))
        }
    })
}

// ═══════════════════════════════════════════════════════════════════════════
// json_dumps
// ═══════════════════════════════════════════════════════════════════════════

/// 紧凑输出但分隔符带空格 (`", "` / `": "`)
struct SpacedFormatter;

impl serde_json::ser::Formatter for SpacedFormatter {
    fn begin_array_value<W>(&mut self, writer: &mut W, first: bool) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        if first {
            Ok(())
        } else {
            writer.write_all(b", ")
        }
    }

    fn begin_object_key<W>(&mut self, writer: &mut W, first: bool) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        if first {
            Ok(())
        } else {
            writer.write_all(b", ")
        }
    }

    fn begin_object_value<W>(&mut self, writer: &mut W) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        writer.write_all(b": ")
    }
}

fn json_dumps(_: &FunctionRegistry, args: CallArgs) -> ExecutionResult<Value> {
    args.expect_count("json_dumps", 1, 1)?;
    let json = args.positional[0].to_json();
    let indent = match args.keyword("indent") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s.clone()),
        Some(other) => Some(" ".repeat(other.as_i64().unwrap_or(0).max(0) as usize)),
    };

    let mut buffer = Vec::new();
    let written = match &indent {
        Some(indent) => {
            let formatter = serde_json::ser::PrettyFormatter::with_indent(indent.as_bytes());
            let mut serializer = serde_json::Serializer::with_formatter(&mut buffer, formatter);
            json.serialize(&mut serializer)
        }
        None => {
            let mut serializer = serde_json::Serializer::with_formatter(&mut buffer, SpacedFormatter);
            json.serialize(&mut serializer)
        }
    };
    written.map_err(|e| ExecutionError::ValueError(e.to_string()))?;

    String::from_utf8(buffer)
        .map(Value::String)
        .map_err(|e| ExecutionError::ValueError(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn map(json: serde_json::Value) -> BTreeMap<String, Value> {
        match Value::from_json(&json) {
            Value::Map(m) => m,
            _ => BTreeMap::new(),
        }
    }

    fn call(name: &str, args: CallArgs) -> ExecutionResult<Value> {
        FunctionRegistry::builtin().call(name, args)
    }

    #[test]
    fn test_coalesce() {
        let args = CallArgs::new(vec![Value::Null, Value::Integer(0), Value::Integer(1)]);
        assert_eq!(call("coalesce", args).unwrap(), Value::Integer(0));
        assert!(call("coalesce", CallArgs::default()).unwrap().is_null());
    }

    #[test]
    fn test_array_helpers() {
        let list = Value::from_json(&json!([10, 20]));
        assert_eq!(
            call("array_item", CallArgs::new(vec![list.clone(), Value::Integer(5)])).unwrap(),
            Value::Null
        );
        assert_eq!(
            call("array_len", CallArgs::new(vec![list])).unwrap(),
            Value::Integer(2)
        );
        assert!(call("array_len", CallArgs::new(vec![Value::Null])).unwrap().is_null());
    }

    #[test]
    fn test_flatten_and_extract() {
        let nested = Value::from_json(&json!([
            [{"timespentSeconds": 60}],
            null,
            [{"timespentSeconds": 30}, {"timespentSeconds": 15}, {}]
        ]));
        let flat = call("flatten_list", CallArgs::new(vec![nested])).unwrap();
        let seconds = call(
            "extract",
            CallArgs::new(vec![flat, Value::from("timespentSeconds")]),
        )
        .unwrap();
        assert_eq!(seconds, Value::from_json(&json!([60, 30, 15])));
    }

    #[test]
    fn test_union() {
        let maps = Value::List(vec![
            Value::Map(map(json!({"a": 1}))),
            Value::Map(map(json!({"b": 2}))),
        ]);
        assert_eq!(
            call("union", CallArgs::new(vec![maps])).unwrap(),
            Value::from_json(&json!({"a": 1, "b": 2}))
        );
        assert!(matches!(
            call("union", CallArgs::new(vec![Value::List(vec![])])),
            Err(ExecutionError::TypeError(_))
        ));
    }

    #[test]
    fn test_simple_filter() {
        let rows = Value::from_json(&json!([
            {"name": "alpha", "points": 3},
            {"name": "beta", "points": 8},
            {"name": "Gamma", "points": null}
        ]));
        let args = CallArgs::with_keywords(
            vec![rows.clone()],
            vec![("points__gte".to_string(), Value::Integer(5))],
        );
        assert_eq!(
            call("simple_filter", args).unwrap(),
            Value::from_json(&json!([{"name": "beta", "points": 8}]))
        );

        let args = CallArgs::with_keywords(
            vec![rows],
            vec![
                ("name".to_string(), Value::from("alpha")),
                ("name__icontains".to_string(), Value::from("gam")),
            ],
        );
        let matched = call("simple_filter_any", args).unwrap();
        assert_eq!(matched.len(), Some(2));
    }

    #[test]
    fn test_json_round_trip_formatting() {
        let value = Value::from_json(&json!({"a": [1, 2], "b": "x"}));
        assert_eq!(
            call("json_dumps", CallArgs::new(vec![value])).unwrap(),
            Value::from("{\"a\": [1, 2], \"b\": \"x\"}")
        );
        let loaded = call("json_loads", CallArgs::new(vec![Value::from("[1, {\"k\": null}]")]))
            .unwrap();
        assert_eq!(loaded, Value::from_json(&json!([1, {"k": null}])));
    }
}
