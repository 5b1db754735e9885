//! 表达式值模型
//!
//! 表达式求值的动态类型值。语义向查询作者熟悉的脚本语言靠拢:
//! 空容器为假、整数与浮点互相提升、`/` 为真除法、`//` 向下取整。
//!
//! 数据源返回的嵌套对象若带有 `self` 链接, 视为远端资源 ([`Resource`]),
//! 输出时转换为其展示值 (无展示字段时输出原始映射)。

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use serde_json::Value as JsonValue;

use super::ast::BinaryOperator;
use super::executor::{ExecutionError, ExecutionResult};

/// 行绑定 (字段名 → 值)
pub type Bindings = BTreeMap<String, Value>;

/// 资源展示字段优先级
pub const RESOURCE_DISPLAY_KEYS: [&str; 10] = [
    "displayName",
    "key",
    "name",
    "filename",
    "value",
    "scope",
    "votes",
    "id",
    "mimeType",
    "closed",
];

/// 序列重复 / 拼接的长度上限
pub const MAX_SEQUENCE_LEN: usize = 100_000;

/// 整数幂运算的指数上限
pub const MAX_POWER: i64 = 4_000_000;

// ═══════════════════════════════════════════════════════════════════════════
// 远端资源
// ═══════════════════════════════════════════════════════════════════════════

/// 远端资源 (带 `self` 链接的嵌套对象)
#[derive(Debug, Clone, PartialEq)]
pub struct Resource {
    raw: BTreeMap<String, Value>,
}

impl Resource {
    pub fn new(raw: BTreeMap<String, Value>) -> Self {
        Self { raw }
    }

    pub fn raw(&self) -> &BTreeMap<String, Value> {
        &self.raw
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.raw.get(name)
    }

    /// 首个存在的展示字段
    pub fn display(&self) -> Option<String> {
        RESOURCE_DISPLAY_KEYS
            .iter()
            .find_map(|key| self.raw.get(*key))
            .map(|v| v.to_string())
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// 值类型
// ═══════════════════════════════════════════════════════════════════════════

/// 值类型
#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Boolean(bool),
    Integer(i64),
    Float(f64),
    String(String),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
    Resource(Box<Resource>),
    /// 函数表中的函数引用 (可作为 `map`/`sorted(key=...)` 的参数)
    Function(String),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "NoneType",
            Value::Boolean(_) => "bool",
            Value::Integer(_) => "int",
            Value::Float(_) => "float",
            Value::String(_) => "str",
            Value::List(_) => "list",
            Value::Map(_) => "dict",
            Value::Resource(_) => "Resource",
            Value::Function(_) => "function",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Boolean(b) => *b,
            Value::Integer(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::String(s) => !s.is_empty(),
            Value::List(items) => !items.is_empty(),
            Value::Map(map) => !map.is_empty(),
            Value::Resource(_) | Value::Function(_) => true,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Boolean(b) => Some(if *b { 1.0 } else { 0.0 }),
            Value::Integer(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// 整数视图 (布尔视为 0/1, 浮点不隐式截断)
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Boolean(b) => Some(*b as i64),
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_number(&self) -> bool {
        matches!(self, Value::Boolean(_) | Value::Integer(_) | Value::Float(_))
    }

    /// 映射 / 资源的键查找
    pub fn get_key(&self, name: &str) -> Option<&Value> {
        match self {
            Value::Map(map) => map.get(name),
            Value::Resource(resource) => resource.get(name),
            _ => None,
        }
    }

    pub fn len(&self) -> Option<usize> {
        match self {
            Value::String(s) => Some(s.chars().count()),
            Value::List(items) => Some(items.len()),
            Value::Map(map) => Some(map.len()),
            Value::Resource(resource) => Some(resource.raw().len()),
            _ => None,
        }
    }

    /// 展开为可迭代元素 (字符串按字符, 映射按键)
    pub fn iterate(&self) -> ExecutionResult<Vec<Value>> {
        match self {
            Value::List(items) => Ok(items.clone()),
            Value::String(s) => Ok(s.chars().map(|c| Value::String(c.to_string())).collect()),
            Value::Map(map) => Ok(map.keys().cloned().map(Value::String).collect()),
            Value::Resource(resource) => {
                Ok(resource.raw().keys().cloned().map(Value::String).collect())
            }
            other => Err(ExecutionError::TypeError(format!(
                "'{}' object is not iterable",
                other.type_name()
            ))),
        }
    }

    // ───────────────────────────────────────────────────────────────────────
    // 相等与排序
    // ───────────────────────────────────────────────────────────────────────

    /// 值相等 (数值跨类型比较)
    pub fn py_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::List(a), Value::List(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.py_eq(y))
            }
            (Value::Map(a), Value::Map(b)) => {
                a.len() == b.len()
                    && a.iter().all(|(k, v)| b.get(k).map(|o| v.py_eq(o)).unwrap_or(false))
            }
            (Value::Resource(a), Value::Resource(b)) => a == b,
            (Value::Function(a), Value::Function(b)) => a == b,
            (a, b) if a.is_number() && b.is_number() => match (a.as_i64(), b.as_i64()) {
                (Some(x), Some(y)) => x == y,
                _ => a.as_f64() == b.as_f64(),
            },
            _ => false,
        }
    }

    /// 有序比较; 不可比较的类型组合返回 TypeError
    pub fn py_cmp(&self, other: &Value) -> ExecutionResult<Ordering> {
        match (self, other) {
            (a, b) if a.is_number() && b.is_number() => match (a.as_i64(), b.as_i64()) {
                (Some(x), Some(y)) => Ok(x.cmp(&y)),
                _ => {
                    let (x, y) = (a.as_f64().unwrap_or(0.0), b.as_f64().unwrap_or(0.0));
                    Ok(x.partial_cmp(&y).unwrap_or(Ordering::Equal))
                }
            },
            (Value::String(a), Value::String(b)) => Ok(a.cmp(b)),
            (Value::List(a), Value::List(b)) => {
                for (x, y) in a.iter().zip(b) {
                    if !x.py_eq(y) {
                        return x.py_cmp(y);
                    }
                }
                Ok(a.len().cmp(&b.len()))
            }
            (a, b) => Err(ExecutionError::TypeError(format!(
                "'<' not supported between instances of '{}' and '{}'",
                a.type_name(),
                b.type_name()
            ))),
        }
    }

    /// 排序用全序: NULL 最小, 不可比较时按类型分组后按文本比较
    pub fn sort_cmp(&self, other: &Value) -> Ordering {
        match (self, other) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Null, _) => Ordering::Less,
            (_, Value::Null) => Ordering::Greater,
            (a, b) => match a.py_cmp(b) {
                Ok(ordering) => ordering,
                Err(_) => a
                    .type_rank()
                    .cmp(&b.type_rank())
                    .then_with(|| a.to_string().cmp(&b.to_string())),
            },
        }
    }

    fn type_rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Boolean(_) | Value::Integer(_) | Value::Float(_) => 1,
            Value::String(_) => 2,
            Value::List(_) => 3,
            Value::Map(_) => 4,
            Value::Resource(_) => 5,
            Value::Function(_) => 6,
        }
    }

    /// `a is b`: 仅 None / 布尔 / 标量按值判定
    pub fn is_same(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Boolean(a), Value::Boolean(b)) => a == b,
            (Value::Integer(a), Value::Integer(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Function(a), Value::Function(b)) => a == b,
            _ => false,
        }
    }

    /// `item in self`
    pub fn contains(&self, item: &Value) -> ExecutionResult<bool> {
        match self {
            Value::String(haystack) => match item {
                Value::String(needle) => Ok(haystack.contains(needle.as_str())),
                other => Err(ExecutionError::TypeError(format!(
                    "'in <string>' requires string as left operand, not {}",
                    other.type_name()
                ))),
            },
            Value::List(items) => Ok(items.iter().any(|v| v.py_eq(item))),
            Value::Map(_) | Value::Resource(_) => Ok(item
                .as_str()
                .map(|key| self.get_key(key).is_some())
                .unwrap_or(false)),
            other => Err(ExecutionError::TypeError(format!(
                "argument of type '{}' is not iterable",
                other.type_name()
            ))),
        }
    }

    // ───────────────────────────────────────────────────────────────────────
    // 访问
    // ───────────────────────────────────────────────────────────────────────

    /// 属性访问
    ///
    /// 映射与资源按键查找; 列表对每个成员取属性, 跳过取不到或为 NULL 的成员
    /// (分组行上 `transactions.byCurrency.usd` 得到各成员值的列表)。
    pub fn attribute(&self, name: &str) -> ExecutionResult<Value> {
        match self {
            Value::Map(_) | Value::Resource(_) => {
                self.get_key(name).cloned().ok_or_else(|| {
                    ExecutionError::AttributeError(format!(
                        "'{}' object has no attribute '{}'",
                        self.type_name(),
                        name
                    ))
                })
            }
            Value::List(items) => Ok(Value::List(
                items
                    .iter()
                    .filter(|item| matches!(item, Value::Map(_) | Value::Resource(_)))
                    .filter_map(|item| item.attribute(name).ok())
                    .filter(|v| !v.is_null())
                    .collect(),
            )),
            other => Err(ExecutionError::AttributeError(format!(
                "'{}' object has no attribute '{}'",
                other.type_name(),
                name
            ))),
        }
    }

    /// 下标访问 (支持负索引)
    pub fn index(&self, index: &Value) -> ExecutionResult<Value> {
        match self {
            Value::List(items) => {
                let i = sequence_index(index, "list")?;
                resolve_index(i, items.len())
                    .map(|i| items[i].clone())
                    .ok_or_else(|| ExecutionError::IndexError("list index out of range".into()))
            }
            Value::String(s) => {
                let i = sequence_index(index, "string")?;
                let chars: Vec<char> = s.chars().collect();
                resolve_index(i, chars.len())
                    .map(|i| Value::String(chars[i].to_string()))
                    .ok_or_else(|| {
                        ExecutionError::IndexError("string index out of range".into())
                    })
            }
            Value::Map(_) | Value::Resource(_) => {
                let found = match index {
                    Value::String(key) => self.get_key(key),
                    _ => None,
                };
                found
                    .cloned()
                    .ok_or_else(|| ExecutionError::KeyError(index.repr()))
            }
            other => Err(ExecutionError::TypeError(format!(
                "'{}' object is not subscriptable",
                other.type_name()
            ))),
        }
    }

    /// 切片 (越界自动截断)
    pub fn slice(&self, lower: Option<i64>, upper: Option<i64>) -> ExecutionResult<Value> {
        match self {
            Value::List(items) => {
                let (start, end) = slice_bounds(lower, upper, items.len());
                Ok(Value::List(items[start..end].to_vec()))
            }
            Value::String(s) => {
                let chars: Vec<char> = s.chars().collect();
                let (start, end) = slice_bounds(lower, upper, chars.len());
                Ok(Value::String(chars[start..end].iter().collect()))
            }
            other => Err(ExecutionError::TypeError(format!(
                "'{}' object is not subscriptable",
                other.type_name()
            ))),
        }
    }

    // ───────────────────────────────────────────────────────────────────────
    // 文本表示
    // ───────────────────────────────────────────────────────────────────────

    /// 带引号的表示形式 (容器内元素使用)
    pub fn repr(&self) -> String {
        match self {
            Value::String(s) => {
                if s.contains('\'') && !s.contains('"') {
                    format!("\"{}\"", s)
                } else {
                    format!("'{}'", s.replace('\\', "\\\\").replace('\'', "\\'"))
                }
            }
            other => other.to_string(),
        }
    }

    // ───────────────────────────────────────────────────────────────────────
    // JSON 互转
    // ───────────────────────────────────────────────────────────────────────

    /// 普通 JSON 转换 (不识别资源)
    pub fn from_json(json: &JsonValue) -> Value {
        match json {
            JsonValue::Null => Value::Null,
            JsonValue::Bool(b) => Value::Boolean(*b),
            JsonValue::Number(n) => number_value(n),
            JsonValue::String(s) => Value::String(s.clone()),
            JsonValue::Array(items) => Value::List(items.iter().map(Value::from_json).collect()),
            JsonValue::Object(map) => Value::Map(
                map.iter()
                    .map(|(k, v)| (k.clone(), Value::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// 数据源记录转换: 带 `self` 链接的对象转为资源
    pub fn hydrate(json: &JsonValue) -> Value {
        match json {
            JsonValue::Array(items) => Value::List(items.iter().map(Value::hydrate).collect()),
            JsonValue::Object(map) => {
                let raw: BTreeMap<String, Value> = map
                    .iter()
                    .map(|(k, v)| (k.clone(), Value::hydrate(v)))
                    .collect();
                if map.contains_key("self") {
                    Value::Resource(Box::new(Resource::new(raw)))
                } else {
                    Value::Map(raw)
                }
            }
            other => Value::from_json(other),
        }
    }

    /// 输出规整: 资源转为展示值或原始映射, 容器递归处理
    pub fn normalize(self) -> Value {
        match self {
            Value::List(items) => Value::List(items.into_iter().map(Value::normalize).collect()),
            Value::Map(map) => {
                Value::Map(map.into_iter().map(|(k, v)| (k, v.normalize())).collect())
            }
            Value::Resource(resource) => match resource.display() {
                Some(display) => Value::String(display),
                None => Value::Map(
                    resource
                        .raw
                        .into_iter()
                        .map(|(k, v)| (k, v.normalize()))
                        .collect(),
                ),
            },
            other => other,
        }
    }

    pub fn to_json(&self) -> JsonValue {
        match self {
            Value::Null => JsonValue::Null,
            Value::Boolean(b) => JsonValue::Bool(*b),
            Value::Integer(i) => JsonValue::from(*i),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(JsonValue::Number)
                .unwrap_or(JsonValue::Null),
            Value::String(s) => JsonValue::String(s.clone()),
            Value::List(items) => JsonValue::Array(items.iter().map(Value::to_json).collect()),
            Value::Map(map) => JsonValue::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
            Value::Resource(_) => self.clone().normalize().to_json(),
            Value::Function(name) => JsonValue::String(name.clone()),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.py_eq(other)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "None"),
            Value::Boolean(true) => write!(f, "True"),
            Value::Boolean(false) => write!(f, "False"),
            Value::Integer(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{}", format_float(*x)),
            Value::String(s) => write!(f, "{}", s),
            Value::List(items) => {
                let parts: Vec<String> = items.iter().map(Value::repr).collect();
                write!(f, "[{}]", parts.join(", "))
            }
            Value::Map(map) => write!(f, "{}", format_map(map)),
            Value::Resource(resource) => match resource.display() {
                Some(display) => write!(f, "{}", display),
                None => write!(f, "{}", format_map(resource.raw())),
            },
            Value::Function(name) => write!(f, "<function {}>", name),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Integer(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::List(items)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// 算术运算
// ═══════════════════════════════════════════════════════════════════════════

/// 二元算术运算
pub fn arithmetic(op: BinaryOperator, left: &Value, right: &Value) -> ExecutionResult<Value> {
    match (op, left, right) {
        (BinaryOperator::Add, Value::String(a), Value::String(b)) => {
            check_length(a.len() + b.len())?;
            Ok(Value::String(format!("{}{}", a, b)))
        }
        (BinaryOperator::Add, Value::List(a), Value::List(b)) => {
            check_length(a.len() + b.len())?;
            let mut joined = a.clone();
            joined.extend(b.iter().cloned());
            Ok(Value::List(joined))
        }
        (BinaryOperator::Mul, Value::String(s), n) | (BinaryOperator::Mul, n, Value::String(s))
            if n.as_i64().is_some() =>
        {
            let times = n.as_i64().unwrap_or(0).max(0) as usize;
            check_length(s.len().saturating_mul(times))?;
            Ok(Value::String(s.repeat(times)))
        }
        (BinaryOperator::Mul, Value::List(items), n) | (BinaryOperator::Mul, n, Value::List(items))
            if n.as_i64().is_some() =>
        {
            let times = n.as_i64().unwrap_or(0).max(0) as usize;
            check_length(items.len().saturating_mul(times))?;
            let mut repeated = Vec::with_capacity(items.len() * times);
            for _ in 0..times {
                repeated.extend(items.iter().cloned());
            }
            Ok(Value::List(repeated))
        }
        (op, a, b) if a.is_number() && b.is_number() => match (a.as_i64(), b.as_i64()) {
            (Some(x), Some(y)) => integer_arithmetic(op, x, y),
            _ => float_arithmetic(
                op,
                a.as_f64().unwrap_or(0.0),
                b.as_f64().unwrap_or(0.0),
            ),
        },
        (op, a, b) => Err(ExecutionError::TypeError(format!(
            "unsupported operand type(s) for {}: '{}' and '{}'",
            op.symbol(),
            a.type_name(),
            b.type_name()
        ))),
    }
}

fn integer_arithmetic(op: BinaryOperator, a: i64, b: i64) -> ExecutionResult<Value> {
    let overflow = || float_arithmetic(op, a as f64, b as f64);

    match op {
        BinaryOperator::Add => a.checked_add(b).map(Value::Integer).map_or_else(overflow, Ok),
        BinaryOperator::Sub => a.checked_sub(b).map(Value::Integer).map_or_else(overflow, Ok),
        BinaryOperator::Mul => a.checked_mul(b).map(Value::Integer).map_or_else(overflow, Ok),
        BinaryOperator::Div => {
            if b == 0 {
                return Err(ExecutionError::DivisionByZero);
            }
            Ok(Value::Float(a as f64 / b as f64))
        }
        BinaryOperator::FloorDiv => {
            if b == 0 {
                return Err(ExecutionError::DivisionByZero);
            }
            match (a.checked_div(b), a.checked_rem(b)) {
                (Some(q), Some(r)) => {
                    let floored = if r != 0 && ((r < 0) != (b < 0)) { q - 1 } else { q };
                    Ok(Value::Integer(floored))
                }
                _ => overflow(),
            }
        }
        BinaryOperator::Mod => {
            if b == 0 {
                return Err(ExecutionError::DivisionByZero);
            }
            match a.checked_rem(b) {
                Some(r) if r != 0 && ((r < 0) != (b < 0)) => Ok(Value::Integer(r + b)),
                Some(r) => Ok(Value::Integer(r)),
                None => Ok(Value::Integer(0)),
            }
        }
        BinaryOperator::Pow => {
            if b > MAX_POWER {
                return Err(ExecutionError::RuntimeError(format!(
                    "Sorry! I don't want to evaluate {} ** {}",
                    a, b
                )));
            }
            if b < 0 {
                return float_arithmetic(op, a as f64, b as f64);
            }
            u32::try_from(b)
                .ok()
                .and_then(|exp| a.checked_pow(exp))
                .map(Value::Integer)
                .map_or_else(overflow, Ok)
        }
    }
}

fn float_arithmetic(op: BinaryOperator, a: f64, b: f64) -> ExecutionResult<Value> {
    let result = match op {
        BinaryOperator::Add => a + b,
        BinaryOperator::Sub => a - b,
        BinaryOperator::Mul => a * b,
        BinaryOperator::Div => {
            if b == 0.0 {
                return Err(ExecutionError::DivisionByZero);
            }
            a / b
        }
        BinaryOperator::FloorDiv => {
            if b == 0.0 {
                return Err(ExecutionError::DivisionByZero);
            }
            (a / b).floor()
        }
        BinaryOperator::Mod => {
            if b == 0.0 {
                return Err(ExecutionError::DivisionByZero);
            }
            let r = a % b;
            if r != 0.0 && ((r < 0.0) != (b < 0.0)) {
                r + b
            } else {
                r
            }
        }
        BinaryOperator::Pow => {
            if a < 0.0 && b.fract() != 0.0 {
                return Err(ExecutionError::ValueError(
                    "negative number cannot be raised to a fractional power".into(),
                ));
            }
            if a == 0.0 && b < 0.0 {
                return Err(ExecutionError::DivisionByZero);
            }
            a.powf(b)
        }
    };
    Ok(Value::Float(result))
}

fn check_length(len: usize) -> ExecutionResult<()> {
    if len > MAX_SEQUENCE_LEN {
        return Err(ExecutionError::RuntimeError(format!(
            "Sequence length {} exceeds the limit of {}",
            len, MAX_SEQUENCE_LEN
        )));
    }
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════════
// 辅助函数
// ═══════════════════════════════════════════════════════════════════════════

fn number_value(n: &serde_json::Number) -> Value {
    if let Some(i) = n.as_i64() {
        Value::Integer(i)
    } else {
        Value::Float(n.as_f64().unwrap_or(f64::NAN))
    }
}

fn sequence_index(index: &Value, kind: &str) -> ExecutionResult<i64> {
    index.as_i64().ok_or_else(|| {
        ExecutionError::TypeError(format!(
            "{} indices must be integers or slices, not {}",
            kind,
            index.type_name()
        ))
    })
}

fn resolve_index(index: i64, len: usize) -> Option<usize> {
    let len = len as i64;
    let resolved = if index < 0 { len + index } else { index };
    if resolved < 0 || resolved >= len {
        None
    } else {
        Some(resolved as usize)
    }
}

fn slice_bounds(lower: Option<i64>, upper: Option<i64>, len: usize) -> (usize, usize) {
    let len_i = len as i64;
    let clamp = |i: i64| -> usize {
        if i < 0 {
            (len_i + i).max(0) as usize
        } else {
            i.min(len_i) as usize
        }
    };
    let start = lower.map(clamp).unwrap_or(0);
    let end = upper.map(clamp).unwrap_or(len);
    if start >= end {
        (start, start)
    } else {
        (start, end)
    }
}

fn format_map(map: &BTreeMap<String, Value>) -> String {
    let parts: Vec<String> = map
        .iter()
        .map(|(k, v)| format!("{}: {}", Value::String(k.clone()).repr(), v.repr()))
        .collect();
    format!("{{{}}}", parts.join(", "))
}

/// 浮点数文本形式: 整值保留一位小数, 极大/极小值用科学计数法
pub fn format_float(x: f64) -> String {
    if x.is_nan() {
        return "nan".to_string();
    }
    if x.is_infinite() {
        return if x > 0.0 { "inf" } else { "-inf" }.to_string();
    }

    let magnitude = x.abs();
    if magnitude != 0.0 && !(1e-4..1e16).contains(&magnitude) {
        let formatted = format!("{:e}", x);
        return match formatted.split_once('e') {
            Some((mantissa, exponent)) => {
                let (sign, digits) = match exponent.strip_prefix('-') {
                    Some(d) => ('-', d),
                    None => ('+', exponent),
                };
                format!("{}e{}{:0>2}", mantissa, sign, digits)
            }
            None => formatted,
        };
    }

    if x.fract() == 0.0 {
        format!("{:.1}", x)
    } else {
        format!("{}", x)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// 测试
// ═══════════════════════════════════════════════════════════════════════════
