//! 日期函数
//!
//! 日期时间在表达式中以 RFC 3339 字符串表示, 日期以 `YYYY-MM-DD` 表示;
//! 两者都可直接按字符串比较大小。

use chrono::{DateTime, Datelike, FixedOffset, Local, NaiveDate, NaiveDateTime, TimeZone, Timelike, Utc};

use super::{int_arg, CallArgs, FunctionRegistry};
use crate::dsl::executor::{ExecutionError, ExecutionResult};
use crate::dsl::value::Value;

/// 带时区的解析格式
const ZONED_FORMATS: [&str; 3] = [
    "%Y-%m-%dT%H:%M:%S%.f%z",
    "%Y-%m-%dT%H:%M:%S%z",
    "%Y-%m-%d %H:%M:%S%.f%z",
];

/// 无时区的解析格式 (按 UTC 处理)
const NAIVE_FORMATS: [&str; 5] = [
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
];

pub(super) fn register(registry: &mut FunctionRegistry) {
    registry.register("now", now);
    registry.register("parse_datetime", |_: &FunctionRegistry, args: CallArgs| {
        args.expect_count("parse_datetime", 1, 1)?;
        let parsed = parse(&args.positional[0])?;
        Ok(Value::String(parsed.to_rfc3339()))
    });
    registry.register("parse_date", |_: &FunctionRegistry, args: CallArgs| {
        args.expect_count("parse_date", 1, 1)?;
        let parsed = parse(&args.positional[0])?;
        Ok(Value::String(parsed.date_naive().format("%Y-%m-%d").to_string()))
    });
}

/// 当前本地时间, 可用关键字参数替换各分量 (`now(hour=0, minute=0)`)
fn now(_: &FunctionRegistry, args: CallArgs) -> ExecutionResult<Value> {
    args.expect_count("now", 0, 0)?;
    let mut current = Local::now().fixed_offset();

    for (name, value) in &args.keywords {
        let n = int_arg(value, "now")?;
        let replaced = match name.as_str() {
            "year" => i32::try_from(n).ok().and_then(|y| current.with_year(y)),
            "month" => u32::try_from(n).ok().and_then(|m| current.with_month(m)),
            "day" => u32::try_from(n).ok().and_then(|d| current.with_day(d)),
            "hour" => u32::try_from(n).ok().and_then(|h| current.with_hour(h)),
            "minute" => u32::try_from(n).ok().and_then(|m| current.with_minute(m)),
            "second" => u32::try_from(n).ok().and_then(|s| current.with_second(s)),
            "microsecond" => u32::try_from(n)
                .ok()
                .and_then(|us| current.with_nanosecond(us.saturating_mul(1000))),
            other => {
                return Err(ExecutionError::ArgumentError(format!(
                    "'{}' is an invalid keyword argument for now()",
                    other
                )))
            }
        };
        current = replaced.ok_or_else(|| {
            ExecutionError::ValueError(format!("{} is out of range for {}", n, name))
        })?;
    }

    Ok(Value::String(current.to_rfc3339()))
}

fn parse(value: &Value) -> ExecutionResult<DateTime<FixedOffset>> {
    let text = value.as_str().ok_or_else(|| {
        ExecutionError::TypeError(format!(
            "Parser must be a string or character stream, not {}",
            value.type_name()
        ))
    })?;
    parse_datetime_str(text.trim())
        .ok_or_else(|| ExecutionError::ValueError(format!("Unknown string format: {}", text)))
}

/// 解析日期时间文本; 未带时区时按 UTC
pub fn parse_datetime_str(text: &str) -> Option<DateTime<FixedOffset>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(text) {
        return Some(parsed);
    }
    for format in ZONED_FORMATS {
        if let Ok(parsed) = DateTime::parse_from_str(text, format) {
            return Some(parsed);
        }
    }
    for format in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, format) {
            return Some(Utc.from_utc_datetime(&naive).fixed_offset());
        }
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| Utc.from_utc_datetime(&naive).fixed_offset())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(name: &str, args: CallArgs) -> ExecutionResult<Value> {
        FunctionRegistry::builtin().call(name, args)
    }

    #[test]
    fn test_parse_tracker_timestamp() {
        let parsed = call(
            "parse_datetime",
            CallArgs::new(vec![Value::from("2020-03-01T10:15:00.000+0000")]),
        )
        .unwrap();
        assert_eq!(parsed, Value::from("2020-03-01T10:15:00+00:00"));
    }

    #[test]
    fn test_naive_input_is_utc() {
        let parsed = call(
            "parse_datetime",
            CallArgs::new(vec![Value::from("2020-03-01 10:15:00")]),
        )
        .unwrap();
        assert_eq!(parsed, Value::from("2020-03-01T10:15:00+00:00"));
    }

    #[test]
    fn test_parse_date() {
        let parsed = call(
            "parse_date",
            CallArgs::new(vec![Value::from("2021-12-31T23:00:00-05:00")]),
        )
        .unwrap();
        assert_eq!(parsed, Value::from("2021-12-31"));
        assert!(matches!(
            call("parse_date", CallArgs::new(vec![Value::from("yesterday")])),
            Err(ExecutionError::ValueError(_))
        ));
    }

    #[test]
    fn test_now_replacements() {
        let args = CallArgs::with_keywords(
            vec![],
            vec![
                ("hour".to_string(), Value::Integer(0)),
                ("minute".to_string(), Value::Integer(0)),
                ("second".to_string(), Value::Integer(0)),
                ("microsecond".to_string(), Value::Integer(0)),
            ],
        );
        let value = call("now", args).unwrap();
        let parsed = parse_datetime_str(value.as_str().unwrap()).unwrap();
        assert_eq!(parsed.hour(), 0);
        assert_eq!(parsed.minute(), 0);
        assert!(matches!(
            call(
                "now",
                CallArgs::with_keywords(vec![], vec![("month".to_string(), Value::Integer(13))])
            ),
            Err(ExecutionError::ValueError(_))
        ));
    }
}
