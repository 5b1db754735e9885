//! 值方法白名单
//!
//! 只开放无副作用的字符串 / 映射 / 列表方法。
//! 不在白名单内的名称返回 `None`, 由调用方按属性访问处理。

use std::collections::BTreeMap;

use super::{ExecutionError, ExecutionResult};
use crate::dsl::functions::CallArgs;
use crate::dsl::value::Value;

pub(super) fn call_method(
    target: &Value,
    name: &str,
    args: &CallArgs,
) -> Option<ExecutionResult<Value>> {
    match target {
        Value::String(s) => string_method(s, name, args),
        Value::Map(map) => map_method(map, name, args),
        Value::Resource(resource) => map_method(resource.raw(), name, args),
        Value::List(items) => list_method(items, name, args),
        _ => None,
    }
}

fn string_method(s: &str, name: &str, args: &CallArgs) -> Option<ExecutionResult<Value>> {
    let result = match name {
        "lower" => Ok(Value::from(s.to_lowercase())),
        "upper" => Ok(Value::from(s.to_uppercase())),
        "strip" => strip(s, args, Side::Both),
        "lstrip" => strip(s, args, Side::Start),
        "rstrip" => strip(s, args, Side::End),
        "startswith" => affix(s, args, name, |s, p| s.starts_with(p)),
        "endswith" => affix(s, args, name, |s, p| s.ends_with(p)),
        "split" => split(s, args),
        "replace" => replace(s, args),
        "title" => Ok(Value::from(title(s))),
        "capitalize" => {
            let mut chars = s.chars();
            Ok(Value::from(match chars.next() {
                Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
                None => String::new(),
            }))
        }
        "count" => string_arg(args, name, 0).map(|sub| {
            if sub.is_empty() {
                Value::Integer(s.chars().count() as i64 + 1)
            } else {
                Value::Integer(s.matches(sub.as_str()).count() as i64)
            }
        }),
        "find" => string_arg(args, name, 0).map(|sub| {
            Value::Integer(
                s.find(sub.as_str())
                    .map(|byte| s[..byte].chars().count() as i64)
                    .unwrap_or(-1),
            )
        }),
        "join" => args
            .required(0, name)
            .and_then(|v| v.iterate())
            .and_then(|items| {
                items
                    .into_iter()
                    .map(|item| match item {
                        Value::String(part) => Ok(part),
                        other => Err(ExecutionError::TypeError(format!(
                            "sequence item: expected str instance, {} found",
                            other.type_name()
                        ))),
                    })
                    .collect::<ExecutionResult<Vec<_>>>()
            })
            .map(|parts| Value::from(parts.join(s))),
        "isdigit" => Ok(Value::Boolean(!s.is_empty() && s.chars().all(|c| c.is_ascii_digit()))),
        "zfill" => args.required(0, name).and_then(|width| {
            let width = width.as_i64().unwrap_or(0).max(0) as usize;
            let len = s.chars().count();
            if len >= width {
                return Ok(Value::from(s));
            }
            let padding = "0".repeat(width - len);
            Ok(Value::from(match s.strip_prefix(['-', '+']) {
                Some(rest) => format!("{}{}{}", &s[..1], padding, rest),
                None => format!("{}{}", padding, s),
            }))
        }),
        _ => return None,
    };
    Some(result)
}

fn map_method(
    map: &BTreeMap<String, Value>,
    name: &str,
    args: &CallArgs,
) -> Option<ExecutionResult<Value>> {
    let result = match name {
        "get" => args.required(0, name).map(|key| {
            key.as_str()
                .and_then(|k| map.get(k))
                .cloned()
                .unwrap_or_else(|| args.arg(1).cloned().unwrap_or(Value::Null))
        }),
        "keys" => Ok(Value::List(map.keys().cloned().map(Value::String).collect())),
        "values" => Ok(Value::List(map.values().cloned().collect())),
        "items" => Ok(Value::List(
            map.iter()
                .map(|(k, v)| Value::List(vec![Value::String(k.clone()), v.clone()]))
                .collect(),
        )),
        _ => return None,
    };
    Some(result)
}

fn list_method(items: &[Value], name: &str, args: &CallArgs) -> Option<ExecutionResult<Value>> {
    let result = match name {
        "count" => args
            .required(0, name)
            .map(|needle| Value::Integer(items.iter().filter(|v| v.py_eq(needle)).count() as i64)),
        "index" => args.required(0, name).and_then(|needle| {
            items
                .iter()
                .position(|v| v.py_eq(needle))
                .map(|i| Value::Integer(i as i64))
                .ok_or_else(|| {
                    ExecutionError::ValueError(format!("{} is not in list", needle.repr()))
                })
        }),
        _ => return None,
    };
    Some(result)
}

// ═══════════════════════════════════════════════════════════════════════════
// 辅助函数
// ═══════════════════════════════════════════════════════════════════════════

fn string_arg(args: &CallArgs, method: &str, index: usize) -> ExecutionResult<String> {
    match args.required(index, method)? {
        Value::String(s) => Ok(s.clone()),
        other => Err(ExecutionError::TypeError(format!(
            "{}() argument must be str, not {}",
            method,
            other.type_name()
        ))),
    }
}

#[derive(Clone, Copy)]
enum Side {
    Both,
    Start,
    End,
}

fn strip(s: &str, args: &CallArgs, side: Side) -> ExecutionResult<Value> {
    let stripped = match args.arg(0) {
        None | Some(Value::Null) => match side {
            Side::Both => s.trim(),
            Side::Start => s.trim_start(),
            Side::End => s.trim_end(),
        },
        Some(Value::String(chars)) => {
            let chars: Vec<char> = chars.chars().collect();
            let set = chars.as_slice();
            match side {
                Side::Both => s.trim_matches(set),
                Side::Start => s.trim_start_matches(set),
                Side::End => s.trim_end_matches(set),
            }
        }
        Some(other) => {
            return Err(ExecutionError::TypeError(format!(
                "strip arg must be None or str, not {}",
                other.type_name()
            )))
        }
    };
    Ok(Value::from(stripped))
}

fn affix(
    s: &str,
    args: &CallArgs,
    method: &str,
    test: impl Fn(&str, &str) -> bool,
) -> ExecutionResult<Value> {
    let candidates = match args.required(0, method)? {
        Value::String(p) => vec![p.clone()],
        Value::List(items) => items
            .iter()
            .map(|v| v.as_str().map(str::to_string))
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| {
                ExecutionError::TypeError(format!("{} first arg must be str or a tuple of str", method))
            })?,
        other => {
            return Err(ExecutionError::TypeError(format!(
                "{} first arg must be str or a tuple of str, not {}",
                method,
                other.type_name()
            )))
        }
    };
    Ok(Value::Boolean(candidates.iter().any(|p| test(s, p))))
}

fn split(s: &str, args: &CallArgs) -> ExecutionResult<Value> {
    let sep = args.arg(0).or_else(|| args.keyword("sep")).cloned().unwrap_or(Value::Null);
    let max_split = args
        .arg(1)
        .or_else(|| args.keyword("maxsplit"))
        .and_then(Value::as_i64)
        .unwrap_or(-1);

    let parts: Vec<String> = match sep {
        Value::Null => {
            let words = s.split_whitespace().map(str::to_string);
            if max_split < 0 {
                words.collect()
            } else {
                let mut out: Vec<String> = Vec::new();
                let mut rest = s.trim_start();
                while !rest.is_empty() && (out.len() as i64) < max_split {
                    let end = rest.find(char::is_whitespace).unwrap_or(rest.len());
                    out.push(rest[..end].to_string());
                    rest = rest[end..].trim_start();
                }
                if !rest.is_empty() {
                    out.push(rest.to_string());
                }
                out
            }
        }
        Value::String(sep) if sep.is_empty() => {
            return Err(ExecutionError::ValueError("empty separator".into()))
        }
        Value::String(sep) => {
            if max_split < 0 {
                s.split(sep.as_str()).map(str::to_string).collect()
            } else {
                s.splitn(max_split as usize + 1, sep.as_str())
                    .map(str::to_string)
                    .collect()
            }
        }
        other => {
            return Err(ExecutionError::TypeError(format!(
                "must be str or None, not {}",
                other.type_name()
            )))
        }
    };
    Ok(Value::List(parts.into_iter().map(Value::String).collect()))
}

fn replace(s: &str, args: &CallArgs) -> ExecutionResult<Value> {
    let old = string_arg(args, "replace", 0)?;
    let new = string_arg(args, "replace", 1)?;
    match args.arg(2).and_then(Value::as_i64) {
        Some(count) if count >= 0 => Ok(Value::from(s.replacen(old.as_str(), &new, count as usize))),
        _ => Ok(Value::from(s.replace(old.as_str(), &new))),
    }
}

fn title(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut previous_cased = false;
    for c in s.chars() {
        if c.is_alphabetic() {
            if previous_cased {
                out.extend(c.to_lowercase());
            } else {
                out.extend(c.to_uppercase());
            }
            previous_cased = true;
        } else {
            out.push(c);
            previous_cased = false;
        }
    }
    out
}
