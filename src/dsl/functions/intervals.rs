//! 时间区间函数
//!
//! 区间集合在表达式中表示为 `[{"lower": ..., "upper": ...}, ...]`:
//! 端点为 RFC 3339 字符串, 各段为闭区间, 按起点排序且互不重叠。

use std::collections::BTreeMap;

use chrono::{DateTime, Datelike, Duration, FixedOffset, Local, NaiveDate, TimeZone};

use super::dates::parse_datetime_str;
use super::{int_arg, CallArgs, FunctionRegistry};
use crate::dsl::executor::{ExecutionError, ExecutionResult};
use crate::dsl::value::Value;

pub(crate) type Instant = DateTime<FixedOffset>;

/// 默认工作日 (0 = 周日)
const DEFAULT_WORK_DAYS: [i64; 5] = [1, 2, 3, 4, 5];

pub(super) fn register(registry: &mut FunctionRegistry) {
    registry.register("interval_size", interval_size);
    registry.register("interval_business_hours", interval_business_hours);
}

// ═══════════════════════════════════════════════════════════════════════════
// 区间集合
// ═══════════════════════════════════════════════════════════════════════════

/// 闭区间的并集
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct Interval {
    spans: Vec<(Instant, Instant)>,
}

impl Interval {
    pub fn empty() -> Self {
        Self::default()
    }

    /// `[lower, upper]`; lower 晚于 upper 时为空集
    pub fn closed(lower: Instant, upper: Instant) -> Self {
        if lower > upper {
            Self::empty()
        } else {
            Self {
                spans: vec![(lower, upper)],
            }
        }
    }

    /// 任意顺序的区间段, 排序并合并重叠部分
    pub fn from_spans(mut spans: Vec<(Instant, Instant)>) -> Self {
        spans.retain(|(lower, upper)| lower <= upper);
        spans.sort_by(|a, b| a.0.cmp(&b.0));

        let mut merged: Vec<(Instant, Instant)> = Vec::with_capacity(spans.len());
        for (lower, upper) in spans {
            match merged.last_mut() {
                Some(last) if lower <= last.1 => {
                    if upper > last.1 {
                        last.1 = upper;
                    }
                }
                _ => merged.push((lower, upper)),
            }
        }
        Self { spans: merged }
    }

    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }

    pub fn spans(&self) -> &[(Instant, Instant)] {
        &self.spans
    }

    pub fn union(&self, other: &Interval) -> Self {
        let mut spans = self.spans.clone();
        spans.extend(other.spans.iter().copied());
        Self::from_spans(spans)
    }

    pub fn intersection(&self, other: &Interval) -> Self {
        let mut spans = Vec::new();
        let (mut i, mut j) = (0, 0);
        while i < self.spans.len() && j < other.spans.len() {
            let (a_lower, a_upper) = self.spans[i];
            let (b_lower, b_upper) = other.spans[j];
            let lower = a_lower.max(b_lower);
            let upper = a_upper.min(b_upper);
            if lower <= upper {
                spans.push((lower, upper));
            }
            if a_upper < b_upper {
                i += 1;
            } else {
                j += 1;
            }
        }
        Self { spans }
    }

    /// 各段长度之和 (秒); 空集为 None
    pub fn total_seconds(&self) -> Option<f64> {
        if self.spans.is_empty() {
            return None;
        }
        Some(
            self.spans
                .iter()
                .map(|(lower, upper)| (*upper - *lower).num_milliseconds() as f64 / 1000.0)
                .sum(),
        )
    }

    pub fn to_value(&self) -> Value {
        Value::List(
            self.spans
                .iter()
                .map(|(lower, upper)| {
                    let mut span = BTreeMap::new();
                    span.insert("lower".to_string(), Value::String(lower.to_rfc3339()));
                    span.insert("upper".to_string(), Value::String(upper.to_rfc3339()));
                    Value::Map(span)
                })
                .collect(),
        )
    }

    pub fn from_value(value: &Value, function: &str) -> ExecutionResult<Self> {
        let items = match value {
            Value::List(items) => items,
            other => {
                return Err(ExecutionError::TypeError(format!(
                    "{}() requires an interval list, not '{}'",
                    function,
                    other.type_name()
                )))
            }
        };

        let endpoint = |span: &Value, name: &str| -> ExecutionResult<Instant> {
            span.get_key(name)
                .and_then(Value::as_str)
                .and_then(|text| parse_datetime_str(text.trim()))
                .ok_or_else(|| {
                    ExecutionError::TypeError(format!(
                        "{}() interval spans need '{}' datetimes",
                        function, name
                    ))
                })
        };

        let spans = items
            .iter()
            .map(|span| Ok((endpoint(span, "lower")?, endpoint(span, "upper")?)))
            .collect::<ExecutionResult<Vec<_>>>()?;
        Ok(Self::from_spans(spans))
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// 时区与工作时间
// ═══════════════════════════════════════════════════════════════════════════

/// 时区: 本地时区或固定偏移 (`UTC`, `+08:00`, `-0500`)
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum Zone {
    Local,
    Fixed(FixedOffset),
}

impl Zone {
    pub fn from_arg(value: Option<&Value>) -> ExecutionResult<Self> {
        match value {
            None | Some(Value::Null) => Ok(Zone::Local),
            Some(Value::String(name)) => parse_offset(name)
                .map(Zone::Fixed)
                .ok_or_else(|| ExecutionError::ValueError(format!("Unknown timezone: {}", name))),
            Some(other) => Err(ExecutionError::TypeError(format!(
                "timezone_name must be a string, not '{}'",
                other.type_name()
            ))),
        }
    }

    /// 某日的某个整点; 夏令时重叠取较早者, 不存在的时刻为 None
    fn at(&self, date: NaiveDate, hour: u32) -> Option<Instant> {
        let naive = date.and_hms_opt(0, 0, 0)? + Duration::hours(i64::from(hour));
        match self {
            Zone::Local => Local
                .from_local_datetime(&naive)
                .earliest()
                .map(|dt| dt.fixed_offset()),
            Zone::Fixed(offset) => offset.from_local_datetime(&naive).single(),
        }
    }
}

fn parse_offset(name: &str) -> Option<FixedOffset> {
    let name = name.trim();
    if ["UTC", "utc", "Z", "GMT", "Etc/UTC"].contains(&name) {
        return FixedOffset::east_opt(0);
    }
    let (sign, rest) = match name.strip_prefix('+') {
        Some(rest) => (1, rest),
        None => (-1, name.strip_prefix('-')?),
    };
    let (hours, minutes) = match rest.split_once(':') {
        Some(parts) => parts,
        None if rest.len() == 4 => rest.split_at(2),
        None => (rest, "0"),
    };
    let seconds = hours.parse::<i32>().ok()? * 3600 + minutes.parse::<i32>().ok()? * 60;
    FixedOffset::east_opt(sign * seconds)
}

/// 每日工作时段
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct BusinessHours {
    pub start_hour: u32,
    pub end_hour: u32,
    pub zone: Zone,
    pub work_days: Vec<i64>,
}

impl BusinessHours {
    /// 位置参数 2..=5 (或同名关键字): start_hour, end_hour, timezone_name, work_days
    pub fn from_args(args: &CallArgs, function: &str) -> ExecutionResult<Self> {
        let start_hour = hour_arg(args.arg_or_keyword(2, "start_hour"), 9, function)?;
        let end_hour = hour_arg(args.arg_or_keyword(3, "end_hour"), 17, function)?;
        if start_hour >= end_hour {
            return Err(ExecutionError::ValueError(format!(
                "{}() start_hour must be earlier than end_hour",
                function
            )));
        }

        let zone = Zone::from_arg(args.arg_or_keyword(4, "timezone_name"))?;
        let work_days = match args.arg_or_keyword(5, "work_days") {
            None | Some(Value::Null) => DEFAULT_WORK_DAYS.to_vec(),
            Some(days) => days
                .iterate()?
                .iter()
                .map(|day| int_arg(day, function))
                .collect::<ExecutionResult<Vec<_>>>()?,
        };

        Ok(Self {
            start_hour,
            end_hour,
            zone,
            work_days,
        })
    }

    pub fn hours_per_day(&self) -> u32 {
        self.end_hour - self.start_hour
    }

    /// `[start, end)` 内每个工作日的工作时段
    pub fn between(&self, start: NaiveDate, end: NaiveDate) -> Interval {
        let mut spans = Vec::new();
        let mut cursor = start;
        while cursor < end {
            let weekday = i64::from(cursor.weekday().num_days_from_sunday());
            if self.work_days.contains(&weekday) {
                if let (Some(lower), Some(upper)) = (
                    self.zone.at(cursor, self.start_hour),
                    self.zone.at(cursor, self.end_hour),
                ) {
                    spans.push((lower, upper));
                }
            }
            cursor = match cursor.succ_opt() {
                Some(next) => next,
                None => break,
            };
        }
        Interval::from_spans(spans)
    }
}

fn hour_arg(value: Option<&Value>, default: u32, function: &str) -> ExecutionResult<u32> {
    match value {
        None | Some(Value::Null) => Ok(default),
        Some(value) => {
            let hour = int_arg(value, function)?;
            u32::try_from(hour).ok().filter(|h| *h <= 24).ok_or_else(|| {
                ExecutionError::ValueError(format!("{}() hour {} is out of range", function, hour))
            })
        }
    }
}

/// 日期参数 (日期或日期时间文本)
pub(crate) fn date_arg(value: Option<&Value>, function: &str) -> ExecutionResult<Option<NaiveDate>> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(text)) => parse_datetime_str(text.trim())
            .map(|parsed| Some(parsed.date_naive()))
            .ok_or_else(|| ExecutionError::ValueError(format!("Unknown string format: {}", text))),
        Some(other) => Err(ExecutionError::TypeError(format!(
            "{}() requires a date string, not '{}'",
            function,
            other.type_name()
        ))),
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// 函数
// ═══════════════════════════════════════════════════════════════════════════

/// 区间总长 (秒)
fn interval_size(_: &FunctionRegistry, args: CallArgs) -> ExecutionResult<Value> {
    args.expect_count("interval_size", 1, 1)?;
    if args.positional[0].is_null() {
        return Ok(Value::Null);
    }
    let interval = Interval::from_value(&args.positional[0], "interval_size")?;
    Ok(interval.total_seconds().map(Value::Float).unwrap_or(Value::Null))
}

/// `interval_business_hours(min_date=None, max_date=None, start_hour=9, end_hour=17,
/// timezone_name=None, work_days=[1..5])`; 默认范围为过去一年到明天
fn interval_business_hours(_: &FunctionRegistry, args: CallArgs) -> ExecutionResult<Value> {
    args.expect_count("interval_business_hours", 0, 6)?;
    let hours = BusinessHours::from_args(&args, "interval_business_hours")?;

    let today = Local::now().date_naive();
    let start = date_arg(args.arg_or_keyword(0, "min_date"), "interval_business_hours")?
        .unwrap_or(today - Duration::days(365));
    let end = date_arg(args.arg_or_keyword(1, "max_date"), "interval_business_hours")?
        .unwrap_or(today + Duration::days(1));

    Ok(hours.between(start, end).to_value())
}
