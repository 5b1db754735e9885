//! 表达式函数表
//!
//! 函数按名称注册, 每次执行组装一份 [`FunctionRegistry`]:
//! 内置函数 + 统计 + 集合/JSON 工具 + 日期与区间 + 工单数据辅助, 再由执行器追加
//! 上下文函数 (`subquery` / `field_by_name` / `get_issue` 等) 与用户注册的函数。

mod builtins;
mod collections;
pub(crate) mod dates;
pub(crate) mod intervals;
pub(crate) mod records;
mod statistics;

use std::collections::HashMap;
use std::sync::Arc;

use super::executor::{ExecutionError, ExecutionResult};
use super::value::Value;

// ═══════════════════════════════════════════════════════════════════════════
// 调用参数
// ═══════════════════════════════════════════════════════════════════════════

/// 调用参数 (位置参数 + 关键字参数)
#[derive(Debug, Clone, Default)]
pub struct CallArgs {
    pub positional: Vec<Value>,
    pub keywords: Vec<(String, Value)>,
}

impl CallArgs {
    pub fn new(positional: Vec<Value>) -> Self {
        Self {
            positional,
            keywords: Vec::new(),
        }
    }

    pub fn with_keywords(positional: Vec<Value>, keywords: Vec<(String, Value)>) -> Self {
        Self {
            positional,
            keywords,
        }
    }

    pub fn len(&self) -> usize {
        self.positional.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positional.is_empty()
    }

    pub fn arg(&self, index: usize) -> Option<&Value> {
        self.positional.get(index)
    }

    pub fn keyword(&self, name: &str) -> Option<&Value> {
        self.keywords.iter().find(|(k, _)| k == name).map(|(_, v)| v)
    }

    /// 位置参数, 缺失时同名关键字参数
    pub fn arg_or_keyword(&self, index: usize, name: &str) -> Option<&Value> {
        self.arg(index).or_else(|| self.keyword(name))
    }

    pub fn required(&self, index: usize, function: &str) -> ExecutionResult<&Value> {
        self.arg(index).ok_or_else(|| {
            ExecutionError::ArgumentError(format!(
                "{}() missing required positional argument {}",
                function,
                index + 1
            ))
        })
    }

    /// 校验位置参数个数
    pub fn expect_count(&self, function: &str, min: usize, max: usize) -> ExecutionResult<()> {
        let n = self.positional.len();
        if n < min || n > max {
            let expected = if min == max {
                format!("{}", min)
            } else {
                format!("{} to {}", min, max)
            };
            return Err(ExecutionError::ArgumentError(format!(
                "{}() takes {} positional arguments but {} were given",
                function, expected, n
            )));
        }
        Ok(())
    }

    /// 拒绝关键字参数
    pub fn no_keywords(&self, function: &str) -> ExecutionResult<()> {
        match self.keywords.first() {
            Some((name, _)) => Err(ExecutionError::ArgumentError(format!(
                "{}() got an unexpected keyword argument '{}'",
                function, name
            ))),
            None => Ok(()),
        }
    }

    /// 单个可迭代参数或多个位置参数 (max/min 的两种调用方式)
    pub fn items_or_iterable(&self, function: &str) -> ExecutionResult<Vec<Value>> {
        match self.positional.as_slice() {
            [] => Err(ExecutionError::ArgumentError(format!(
                "{} expected at least 1 argument, got 0",
                function
            ))),
            [single] => single.iterate(),
            many => Ok(many.to_vec()),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// 函数接口
// ═══════════════════════════════════════════════════════════════════════════

/// 可在表达式中调用的函数
///
/// 传入函数表以便高阶函数 (`map`/`filter`/`sorted(key=...)`) 回调其他函数。
pub trait Function: Send + Sync {
    fn call(&self, registry: &FunctionRegistry, args: CallArgs) -> ExecutionResult<Value>;
}

impl<F> Function for F
where
    F: Fn(&FunctionRegistry, CallArgs) -> ExecutionResult<Value> + Send + Sync,
{
    fn call(&self, registry: &FunctionRegistry, args: CallArgs) -> ExecutionResult<Value> {
        self(registry, args)
    }
}

/// 函数表
#[derive(Clone, Default)]
pub struct FunctionRegistry {
    functions: HashMap<String, Arc<dyn Function>>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 全部内置函数
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        builtins::register(&mut registry);
        statistics::register(&mut registry);
        collections::register(&mut registry);
        dates::register(&mut registry);
        intervals::register(&mut registry);
        records::register(&mut registry);
        registry
    }

    /// 注册函数 (同名覆盖)
    pub fn register<F>(&mut self, name: &str, function: F)
    where
        F: Function + 'static,
    {
        self.functions.insert(name.to_string(), Arc::new(function));
    }

    pub fn register_arc(&mut self, name: &str, function: Arc<dyn Function>) {
        self.functions.insert(name.to_string(), function);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Function>> {
        self.functions.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    pub fn call(&self, name: &str, args: CallArgs) -> ExecutionResult<Value> {
        match self.functions.get(name) {
            Some(function) => function.call(self, args),
            None => Err(ExecutionError::UndefinedFunction(name.to_string())),
        }
    }

    /// 调用一个值 (只有函数引用可调用)
    pub fn call_value(&self, callee: &Value, args: CallArgs) -> ExecutionResult<Value> {
        match callee {
            Value::Function(name) => self.call(name, args),
            other => Err(ExecutionError::TypeError(format!(
                "'{}' object is not callable",
                other.type_name()
            ))),
        }
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.functions.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

impl std::fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionRegistry")
            .field("functions", &self.names())
            .finish()
    }
}

/// 数值参数
pub(crate) fn number_arg(value: &Value, function: &str) -> ExecutionResult<f64> {
    value.as_f64().ok_or_else(|| {
        ExecutionError::TypeError(format!(
            "{}() requires a number, not '{}'",
            function,
            value.type_name()
        ))
    })
}

/// 整数参数
pub(crate) fn int_arg(value: &Value, function: &str) -> ExecutionResult<i64> {
    value.as_i64().ok_or_else(|| {
        ExecutionError::TypeError(format!(
            "'{}' object cannot be interpreted as an integer in {}()",
            value.type_name(),
            function
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_registry_contents() {
        let registry = FunctionRegistry::builtin();
        for name in [
            "len",
            "sum",
            "median",
            "coalesce",
            "json_dumps",
            "now",
            "randint",
            "interval_size",
            "flatten_changelog",
            "sprint_name",
        ] {
            assert!(registry.contains(name), "missing {}", name);
        }
    }

    #[test]
    fn test_register_closure() {
        let mut registry = FunctionRegistry::new();
        registry.register("double", |_: &FunctionRegistry, args: CallArgs| {
            let n = int_arg(args.required(0, "double")?, "double")?;
            Ok(Value::Integer(n * 2))
        });
        let result = registry
            .call("double", CallArgs::new(vec![Value::Integer(21)]))
            .unwrap();
        assert_eq!(result, Value::Integer(42));
    }

    #[test]
    fn test_unknown_function() {
        let registry = FunctionRegistry::new();
        assert!(matches!(
            registry.call("nope", CallArgs::default()),
            Err(ExecutionError::UndefinedFunction(_))
        ));
        assert!(matches!(
            registry.call_value(&Value::Integer(1), CallArgs::default()),
            Err(ExecutionError::TypeError(_))
        ));
    }
}
