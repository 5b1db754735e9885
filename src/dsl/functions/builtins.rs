//! 内置函数
//!
//! 常用转换、聚合与高阶函数。

use std::cell::RefCell;
use std::cmp::Ordering;
use std::collections::BTreeMap;

use super::{int_arg, number_arg, CallArgs, FunctionRegistry};
use crate::dsl::ast::BinaryOperator;
use crate::dsl::executor::{ExecutionError, ExecutionResult};
use crate::dsl::value::{arithmetic, Value};

/// range() 结果长度上限
pub const MAX_RANGE_LEN: i64 = 1_000_000;

pub(super) fn register(registry: &mut FunctionRegistry) {
    registry.register("abs", abs);
    registry.register("all", |_: &FunctionRegistry, args: CallArgs| {
        args.expect_count("all", 1, 1)?;
        Ok(Value::Boolean(args.positional[0].iterate()?.iter().all(Value::is_truthy)))
    });
    registry.register("any", |_: &FunctionRegistry, args: CallArgs| {
        args.expect_count("any", 1, 1)?;
        Ok(Value::Boolean(args.positional[0].iterate()?.iter().any(Value::is_truthy)))
    });
    registry.register("bin", |_: &FunctionRegistry, args: CallArgs| radix(args, "bin", "0b"));
    registry.register("hex", |_: &FunctionRegistry, args: CallArgs| radix(args, "hex", "0x"));
    registry.register("oct", |_: &FunctionRegistry, args: CallArgs| radix(args, "oct", "0o"));
    registry.register("bool", |_: &FunctionRegistry, args: CallArgs| {
        args.expect_count("bool", 0, 1)?;
        Ok(Value::Boolean(args.arg(0).map(Value::is_truthy).unwrap_or(false)))
    });
    registry.register("float", float);
    registry.register("int", int);
    registry.register("len", |_: &FunctionRegistry, args: CallArgs| {
        args.expect_count("len", 1, 1)?;
        let value = &args.positional[0];
        value.len().map(|n| Value::Integer(n as i64)).ok_or_else(|| {
            ExecutionError::TypeError(format!(
                "object of type '{}' has no len()",
                value.type_name()
            ))
        })
    });
    registry.register("max", |registry: &FunctionRegistry, args: CallArgs| {
        extreme(registry, args, "max", Ordering::Greater)
    });
    registry.register("min", |registry: &FunctionRegistry, args: CallArgs| {
        extreme(registry, args, "min", Ordering::Less)
    });
    registry.register("ord", |_: &FunctionRegistry, args: CallArgs| {
        args.expect_count("ord", 1, 1)?;
        let text = args.positional[0].as_str().unwrap_or_default();
        let mut chars = text.chars();
        match (chars.next(), chars.next()) {
            (Some(c), None) => Ok(Value::Integer(c as i64)),
            _ => Err(ExecutionError::TypeError(
                "ord() expected a character".to_string(),
            )),
        }
    });
    registry.register("pow", pow);
    registry.register("range", range);
    registry.register("reversed", |_: &FunctionRegistry, args: CallArgs| {
        args.expect_count("reversed", 1, 1)?;
        let mut items = args.positional[0].iterate()?;
        items.reverse();
        Ok(Value::List(items))
    });
    registry.register("round", round);
    registry.register("set", |_: &FunctionRegistry, args: CallArgs| {
        args.expect_count("set", 0, 1)?;
        let mut unique: Vec<Value> = Vec::new();
        for item in iterable_or_empty(&args)? {
            if !unique.iter().any(|u| u.py_eq(&item)) {
                unique.push(item);
            }
        }
        Ok(Value::List(unique))
    });
    registry.register("sorted", sorted);
    registry.register("str", |_: &FunctionRegistry, args: CallArgs| {
        args.expect_count("str", 0, 1)?;
        Ok(Value::String(
            args.arg(0).map(|v| v.to_string()).unwrap_or_default(),
        ))
    });
    registry.register("sum", |_: &FunctionRegistry, args: CallArgs| {
        args.expect_count("sum", 1, 2)?;
        let start = args
            .arg_or_keyword(1, "start")
            .cloned()
            .unwrap_or(Value::Integer(0));
        args.positional[0]
            .iterate()?
            .iter()
            .try_fold(start, |acc, item| arithmetic(BinaryOperator::Add, &acc, item))
    });
    registry.register("list", |_: &FunctionRegistry, args: CallArgs| {
        args.expect_count("list", 0, 1)?;
        Ok(Value::List(iterable_or_empty(&args)?))
    });
    registry.register("tuple", |_: &FunctionRegistry, args: CallArgs| {
        args.expect_count("tuple", 0, 1)?;
        Ok(Value::List(iterable_or_empty(&args)?))
    });
    registry.register("dict", dict);
    registry.register("map", map);
    registry.register("filter", filter);
    registry.register("type", |_: &FunctionRegistry, args: CallArgs| {
        args.expect_count("type", 1, 1)?;
        Ok(Value::from(args.positional[0].type_name()))
    });
}

fn iterable_or_empty(args: &CallArgs) -> ExecutionResult<Vec<Value>> {
    match args.arg(0) {
        Some(value) => value.iterate(),
        None => Ok(Vec::new()),
    }
}

fn abs(_: &FunctionRegistry, args: CallArgs) -> ExecutionResult<Value> {
    args.expect_count("abs", 1, 1)?;
    match &args.positional[0] {
        Value::Integer(i) => Ok(i
            .checked_abs()
            .map(Value::Integer)
            .unwrap_or(Value::Float((*i as f64).abs()))),
        Value::Boolean(b) => Ok(Value::Integer(*b as i64)),
        Value::Float(f) => Ok(Value::Float(f.abs())),
        other => Err(ExecutionError::TypeError(format!(
            "bad operand type for abs(): '{}'",
            other.type_name()
        ))),
    }
}

fn radix(args: CallArgs, function: &str, prefix: &str) -> ExecutionResult<Value> {
    args.expect_count(function, 1, 1)?;
    let n = int_arg(&args.positional[0], function)?;
    let magnitude = n.unsigned_abs();
    let digits = match prefix {
        "0b" => format!("{:b}", magnitude),
        "0x" => format!("{:x}", magnitude),
        _ => format!("{:o}", magnitude),
    };
    let sign = if n < 0 { "-" } else { "" };
    Ok(Value::String(format!("{}{}{}", sign, prefix, digits)))
}

fn float(_: &FunctionRegistry, args: CallArgs) -> ExecutionResult<Value> {
    args.expect_count("float", 0, 1)?;
    match args.arg(0) {
        None => Ok(Value::Float(0.0)),
        Some(Value::String(s)) => {
            let trimmed = s.trim();
            let parsed = match trimmed.to_ascii_lowercase().as_str() {
                "inf" | "+inf" | "infinity" => Some(f64::INFINITY),
                "-inf" | "-infinity" => Some(f64::NEG_INFINITY),
                "nan" => Some(f64::NAN),
                _ => trimmed.replace('_', "").parse::<f64>().ok(),
            };
            parsed.map(Value::Float).ok_or_else(|| {
                ExecutionError::ValueError(format!("could not convert string to float: '{}'", s))
            })
        }
        Some(other) => Ok(Value::Float(number_arg(other, "float")?)),
    }
}

fn int(_: &FunctionRegistry, args: CallArgs) -> ExecutionResult<Value> {
    args.expect_count("int", 0, 2)?;
    let base = match args.arg_or_keyword(1, "base") {
        Some(b) => int_arg(b, "int")?,
        None => 10,
    };
    match args.arg(0) {
        None => Ok(Value::Integer(0)),
        Some(Value::String(s)) => {
            let cleaned = s.trim().replace('_', "");
            let (negative, digits) = match cleaned.strip_prefix('-') {
                Some(rest) => (true, rest.to_string()),
                None => (false, cleaned.trim_start_matches('+').to_string()),
            };
            let digits = match base {
                16 => digits.trim_start_matches("0x").trim_start_matches("0X").to_string(),
                8 => digits.trim_start_matches("0o").trim_start_matches("0O").to_string(),
                2 => digits.trim_start_matches("0b").trim_start_matches("0B").to_string(),
                _ => digits,
            };
            let radix = u32::try_from(base).ok().filter(|r| (2..=36).contains(r));
            radix
                .and_then(|r| i64::from_str_radix(&digits, r).ok())
                .map(|n| Value::Integer(if negative { -n } else { n }))
                .ok_or_else(|| {
                    ExecutionError::ValueError(format!(
                        "invalid literal for int() with base {}: '{}'",
                        base, s
                    ))
                })
        }
        Some(Value::Float(f)) => {
            if !f.is_finite() {
                return Err(ExecutionError::ValueError(format!(
                    "cannot convert float {} to integer",
                    f
                )));
            }
            Ok(Value::Integer(f.trunc() as i64))
        }
        Some(other) => Ok(Value::Integer(int_arg(other, "int")?)),
    }
}

fn extreme(
    registry: &FunctionRegistry,
    args: CallArgs,
    function: &str,
    wanted: Ordering,
) -> ExecutionResult<Value> {
    let items = args.items_or_iterable(function)?;
    let key = args.keyword("key").filter(|k| !k.is_null()).cloned();

    let mut best: Option<(Value, Value)> = None;
    for item in items {
        let item_key = match &key {
            Some(f) => registry.call_value(f, CallArgs::new(vec![item.clone()]))?,
            None => item.clone(),
        };
        let replace = match &best {
            None => true,
            Some((_, best_key)) => item_key.py_cmp(best_key)? == wanted,
        };
        if replace {
            best = Some((item, item_key));
        }
    }

    match best {
        Some((item, _)) => Ok(item),
        None => args.keyword("default").cloned().ok_or_else(|| {
            ExecutionError::ValueError(format!("{}() arg is an empty sequence", function))
        }),
    }
}

fn pow(_: &FunctionRegistry, args: CallArgs) -> ExecutionResult<Value> {
    args.expect_count("pow", 2, 3)?;
    let (base, exp) = (&args.positional[0], &args.positional[1]);
    match args.arg(2) {
        None => arithmetic(BinaryOperator::Pow, base, exp),
        Some(modulus) => {
            let (b, e, m) = (
                int_arg(base, "pow")?,
                int_arg(exp, "pow")?,
                int_arg(modulus, "pow")?,
            );
            if m == 0 {
                return Err(ExecutionError::ValueError(
                    "pow() 3rd argument cannot be 0".into(),
                ));
            }
            if e < 0 {
                return Err(ExecutionError::ValueError(
                    "pow() negative exponent with modulus is not supported".into(),
                ));
            }
            let m128 = m as i128;
            let mut result: i128 = 1;
            let mut b128 = (b as i128).rem_euclid(m128);
            let mut e = e;
            while e > 0 {
                if e & 1 == 1 {
                    result = (result * b128).rem_euclid(m128);
                }
                b128 = (b128 * b128).rem_euclid(m128);
                e >>= 1;
            }
            if m < 0 && result != 0 {
                result += m128;
            }
            Ok(Value::Integer(result as i64))
        }
    }
}

fn range(_: &FunctionRegistry, args: CallArgs) -> ExecutionResult<Value> {
    args.expect_count("range", 1, 3)?;
    let ints = args
        .positional
        .iter()
        .map(|v| int_arg(v, "range"))
        .collect::<ExecutionResult<Vec<_>>>()?;
    let (start, stop, step) = match ints.as_slice() {
        [stop] => (0, *stop, 1),
        [start, stop] => (*start, *stop, 1),
        [start, stop, step] => (*start, *stop, *step),
        _ => unreachable!("argument count checked above"),
    };
    if step == 0 {
        return Err(ExecutionError::ValueError(
            "range() arg 3 must not be zero".into(),
        ));
    }

    let span = if step > 0 {
        (stop as i128 - start as i128 + step as i128 - 1) / step as i128
    } else {
        (start as i128 - stop as i128 - step as i128 - 1) / (-(step as i128))
    };
    let len = span.max(0);
    if len > MAX_RANGE_LEN as i128 {
        return Err(ExecutionError::RuntimeError(format!(
            "range() of length {} exceeds the limit of {}",
            len, MAX_RANGE_LEN
        )));
    }

    Ok(Value::List(
        (0..len as i64)
            .map(|i| Value::Integer(start + i * step))
            .collect(),
    ))
}

/// 银行家舍入 (四舍六入五成双)
fn round(_: &FunctionRegistry, args: CallArgs) -> ExecutionResult<Value> {
    args.expect_count("round", 1, 2)?;
    let value = &args.positional[0];
    let ndigits = match args.arg_or_keyword(1, "ndigits") {
        None | Some(Value::Null) => None,
        Some(n) => Some(int_arg(n, "round")?),
    };

    match (value, ndigits) {
        (Value::Integer(_) | Value::Boolean(_), None) => Ok(Value::Integer(int_arg(value, "round")?)),
        (Value::Integer(i), Some(n)) if n >= 0 => Ok(Value::Integer(*i)),
        (Value::Integer(i), Some(n)) => {
            let factor = 10f64.powi((-n) as i32);
            Ok(Value::Integer(
                ((*i as f64 / factor).round_ties_even() * factor) as i64,
            ))
        }
        (Value::Float(f), None) => {
            if !f.is_finite() {
                return Err(ExecutionError::ValueError(format!(
                    "cannot convert float {} to integer",
                    f
                )));
            }
            Ok(Value::Integer(f.round_ties_even() as i64))
        }
        (Value::Float(f), Some(n)) => {
            let factor = 10f64.powi(n.clamp(-308, 308) as i32);
            Ok(Value::Float((f * factor).round_ties_even() / factor))
        }
        (other, _) => Err(ExecutionError::TypeError(format!(
            "type {} doesn't define __round__ method",
            other.type_name()
        ))),
    }
}

fn sorted(registry: &FunctionRegistry, args: CallArgs) -> ExecutionResult<Value> {
    args.expect_count("sorted", 1, 1)?;
    let items = args.positional[0].iterate()?;
    let reverse = args.keyword("reverse").map(Value::is_truthy).unwrap_or(false);
    let key = args.keyword("key").filter(|k| !k.is_null()).cloned();

    let mut keyed = Vec::with_capacity(items.len());
    for item in items {
        let k = match &key {
            Some(f) => registry.call_value(f, CallArgs::new(vec![item.clone()]))?,
            None => item.clone(),
        };
        keyed.push((k, item));
    }

    let failure: RefCell<Option<ExecutionError>> = RefCell::new(None);
    keyed.sort_by(|(a, _), (b, _)| {
        let ordering = a.py_cmp(b).unwrap_or_else(|e| {
            failure.borrow_mut().get_or_insert(e);
            Ordering::Equal
        });
        if reverse {
            ordering.reverse()
        } else {
            ordering
        }
    });
    if let Some(e) = failure.into_inner() {
        return Err(e);
    }

    Ok(Value::List(keyed.into_iter().map(|(_, item)| item).collect()))
}

fn dict(_: &FunctionRegistry, args: CallArgs) -> ExecutionResult<Value> {
    args.expect_count("dict", 0, 1)?;
    let mut map = BTreeMap::new();
    if let Some(source) = args.arg(0) {
        match source {
            Value::Map(existing) => map.extend(existing.clone()),
            other => {
                for pair in other.iterate()? {
                    let parts = pair.iterate()?;
                    let [key, value] = parts.as_slice() else {
                        return Err(ExecutionError::ValueError(format!(
                            "dictionary update sequence element has length {}; 2 is required",
                            parts.len()
                        )));
                    };
                    let key = match key {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    map.insert(key, value.clone());
                }
            }
        }
    }
    for (k, v) in &args.keywords {
        map.insert(k.clone(), v.clone());
    }
    Ok(Value::Map(map))
}

fn map(registry: &FunctionRegistry, args: CallArgs) -> ExecutionResult<Value> {
    if args.len() < 2 {
        return Err(ExecutionError::ArgumentError(
            "map() must have at least two arguments.".into(),
        ));
    }
    let function = &args.positional[0];
    let iterables = args.positional[1..]
        .iter()
        .map(Value::iterate)
        .collect::<ExecutionResult<Vec<_>>>()?;
    let shortest = iterables.iter().map(Vec::len).min().unwrap_or(0);

    let mut results = Vec::with_capacity(shortest);
    for i in 0..shortest {
        let call_args = iterables.iter().map(|items| items[i].clone()).collect();
        results.push(registry.call_value(function, CallArgs::new(call_args))?);
    }
    Ok(Value::List(results))
}

fn filter(registry: &FunctionRegistry, args: CallArgs) -> ExecutionResult<Value> {
    args.expect_count("filter", 2, 2)?;
    let predicate = &args.positional[0];
    let mut kept = Vec::new();
    for item in args.positional[1].iterate()? {
        let keep = match predicate {
            Value::Null => item.is_truthy(),
            f => registry
                .call_value(f, CallArgs::new(vec![item.clone()]))?
                .is_truthy(),
        };
        if keep {
            kept.push(item);
        }
    }
    Ok(Value::List(kept))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(name: &str, args: Vec<Value>) -> ExecutionResult<Value> {
        FunctionRegistry::builtin().call(name, CallArgs::new(args))
    }

    fn ints(values: &[i64]) -> Value {
        Value::List(values.iter().map(|i| Value::Integer(*i)).collect())
    }

    #[test]
    fn test_sum_and_len() {
        assert_eq!(call("sum", vec![ints(&[1, 2, 3])]).unwrap(), Value::Integer(6));
        assert_eq!(call("len", vec![Value::from("abc")]).unwrap(), Value::Integer(3));
        assert!(matches!(
            call("len", vec![Value::Integer(1)]),
            Err(ExecutionError::TypeError(_))
        ));
    }

    #[test]
    fn test_max_min() {
        assert_eq!(call("max", vec![ints(&[3, 9, 1])]).unwrap(), Value::Integer(9));
        assert_eq!(
            call("min", vec![Value::Integer(4), Value::Integer(2)]).unwrap(),
            Value::Integer(2)
        );
        assert!(matches!(
            call("max", vec![ints(&[])]),
            Err(ExecutionError::ValueError(_))
        ));
    }

    #[test]
    fn test_round_half_even() {
        assert_eq!(call("round", vec![Value::Float(2.5)]).unwrap(), Value::Integer(2));
        assert_eq!(call("round", vec![Value::Float(3.5)]).unwrap(), Value::Integer(4));
        assert_eq!(
            call("round", vec![Value::Float(1.2345), Value::Integer(2)]).unwrap(),
            Value::Float(1.23)
        );
    }

    #[test]
    fn test_conversions() {
        assert_eq!(call("int", vec![Value::from(" 42 ")]).unwrap(), Value::Integer(42));
        assert_eq!(
            call("int", vec![Value::from("ff"), Value::Integer(16)]).unwrap(),
            Value::Integer(255)
        );
        assert_eq!(call("int", vec![Value::Float(-3.9)]).unwrap(), Value::Integer(-3));
        assert!(matches!(
            call("int", vec![Value::from("abc")]),
            Err(ExecutionError::ValueError(_))
        ));
        assert_eq!(call("hex", vec![Value::Integer(-255)]).unwrap(), Value::from("-0xff"));
        assert_eq!(call("str", vec![Value::Null]).unwrap(), Value::from("None"));
    }

    #[test]
    fn test_range_and_set() {
        assert_eq!(
            call("range", vec![Value::Integer(5), Value::Integer(0), Value::Integer(-2)]).unwrap(),
            ints(&[5, 3, 1])
        );
        assert_eq!(call("set", vec![ints(&[2, 1, 2, 3, 1])]).unwrap(), ints(&[2, 1, 3]));
        assert!(matches!(
            call("range", vec![Value::Integer(10_000_000)]),
            Err(ExecutionError::RuntimeError(_))
        ));
    }

    #[test]
    fn test_sorted_with_key_and_reverse() {
        let registry = FunctionRegistry::builtin();
        let args = CallArgs::with_keywords(
            vec![Value::List(vec![Value::from("ccc"), Value::from("a"), Value::from("bb")])],
            vec![
                ("key".to_string(), Value::Function("len".to_string())),
                ("reverse".to_string(), Value::Boolean(true)),
            ],
        );
        assert_eq!(
            registry.call("sorted", args).unwrap(),
            Value::List(vec![Value::from("ccc"), Value::from("bb"), Value::from("a")])
        );
        assert!(matches!(
            call("sorted", vec![Value::List(vec![Value::Integer(1), Value::from("a")])]),
            Err(ExecutionError::TypeError(_))
        ));
    }

    #[test]
    fn test_map_and_filter() {
        assert_eq!(
            call("map", vec![Value::Function("str".into()), ints(&[1, 2])]).unwrap(),
            Value::List(vec![Value::from("1"), Value::from("2")])
        );
        assert_eq!(
            call("filter", vec![Value::Null, ints(&[0, 1, 0, 2])]).unwrap(),
            ints(&[1, 2])
        );
    }

    #[test]
    fn test_pow_modulus() {
        assert_eq!(
            call("pow", vec![Value::Integer(3), Value::Integer(4), Value::Integer(5)]).unwrap(),
            Value::Integer(1)
        );
    }
}
