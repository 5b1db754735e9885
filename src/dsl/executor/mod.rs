//! 表达式执行引擎
//!
//! 提供查询表达式的沙箱求值:
//! - 执行上下文 (行绑定 + 函数表)
//! - AST 解释执行 (无赋值、无 import、方法调用走白名单)
//! - [`ExpressionEngine`]: 插值 → 解析 (带缓存) → 求值 → 错误归类

mod methods;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use log::warn;
use once_cell::unsync::OnceCell;
use parking_lot::Mutex;

use super::ast::*;
use super::functions::{CallArgs, FunctionRegistry};
use super::interpolate::{interpolate, InterpolationError, Placeholders};
use super::parser::{parse_expression, ParseError};
use super::value::{arithmetic, Bindings, Value};
use crate::observability::metrics::EVALUATION_ERRORS;
use crate::SelectError;

/// 推导式结果数量上限
pub const MAX_COMPREHENSION_LEN: usize = 10_000;

// ═══════════════════════════════════════════════════════════════════════════
// 执行错误
// ═══════════════════════════════════════════════════════════════════════════

/// 执行错误
#[derive(Debug)]
pub enum ExecutionError {
    /// 未定义的变量
    UndefinedVariable(String),
    /// 未定义的函数
    UndefinedFunction(String),
    /// 类型错误
    TypeError(String),
    /// 参数错误
    ArgumentError(String),
    /// 属性不存在
    AttributeError(String),
    /// 键不存在
    KeyError(String),
    /// 下标越界
    IndexError(String),
    /// 值错误
    ValueError(String),
    /// 除零错误
    DivisionByZero,
    /// 运行时错误
    RuntimeError(String),
    /// 函数内部产生的查询级错误 (如子查询失败), 原样上抛
    Select(Box<SelectError>),
}

impl ExecutionError {
    /// 行数据缺失类错误: 宽松模式下该行结果为 NULL
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ExecutionError::UndefinedVariable(_)
                | ExecutionError::AttributeError(_)
                | ExecutionError::KeyError(_)
                | ExecutionError::IndexError(_)
                | ExecutionError::TypeError(_)
                | ExecutionError::ArgumentError(_)
        )
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ExecutionError::UndefinedVariable(_) => "NameNotDefined",
            ExecutionError::UndefinedFunction(_) => "FunctionNotDefined",
            ExecutionError::TypeError(_) => "TypeError",
            ExecutionError::ArgumentError(_) => "ArgumentError",
            ExecutionError::AttributeError(_) => "AttributeError",
            ExecutionError::KeyError(_) => "KeyError",
            ExecutionError::IndexError(_) => "IndexError",
            ExecutionError::ValueError(_) => "ValueError",
            ExecutionError::DivisionByZero => "ZeroDivisionError",
            ExecutionError::RuntimeError(_) => "RuntimeError",
            ExecutionError::Select(_) => "QueryError",
        }
    }
}

impl std::fmt::Display for ExecutionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionError::UndefinedVariable(name) => write!(f, "Undefined variable: {}", name),
            ExecutionError::UndefinedFunction(name) => write!(f, "Undefined function: {}", name),
            ExecutionError::TypeError(msg) => write!(f, "Type error: {}", msg),
            ExecutionError::ArgumentError(msg) => write!(f, "Argument error: {}", msg),
            ExecutionError::AttributeError(msg) => write!(f, "Attribute error: {}", msg),
            ExecutionError::KeyError(key) => write!(f, "Key error: {}", key),
            ExecutionError::IndexError(msg) => write!(f, "Index error: {}", msg),
            ExecutionError::ValueError(msg) => write!(f, "Value error: {}", msg),
            ExecutionError::DivisionByZero => write!(f, "Division by zero"),
            ExecutionError::RuntimeError(msg) => write!(f, "Runtime error: {}", msg),
            ExecutionError::Select(inner) => write!(f, "{}", inner),
        }
    }
}

impl std::error::Error for ExecutionError {}

impl From<SelectError> for ExecutionError {
    fn from(e: SelectError) -> Self {
        ExecutionError::Select(Box::new(e))
    }
}

pub type ExecutionResult<T> = Result<T, ExecutionError>;

// ═══════════════════════════════════════════════════════════════════════════
// 执行上下文
// ═══════════════════════════════════════════════════════════════════════════

/// 执行上下文
///
/// 除行字段外, `issue` 与 `_` 指向整行 (以映射形式, 首次访问时构建)。
pub struct ExecutionContext<'a> {
    variables: &'a Bindings,
    functions: &'a FunctionRegistry,
    row: OnceCell<Value>,
}

impl<'a> ExecutionContext<'a> {
    pub fn new(variables: &'a Bindings, functions: &'a FunctionRegistry) -> Self {
        Self {
            variables,
            functions,
            row: OnceCell::new(),
        }
    }

    pub fn get_variable(&self, name: &str) -> Option<&Value> {
        self.variables.get(name)
    }

    pub fn functions(&self) -> &FunctionRegistry {
        self.functions
    }

    fn row(&self) -> &Value {
        self.row.get_or_init(|| Value::Map(self.variables.clone()))
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// 求值器
// ═══════════════════════════════════════════════════════════════════════════

/// 推导式局部变量 (后绑定者优先)
type Locals = Vec<(String, Value)>;

/// 表达式求值器
pub struct Evaluator<'a> {
    context: &'a ExecutionContext<'a>,
}

impl<'a> Evaluator<'a> {
    pub fn new(context: &'a ExecutionContext<'a>) -> Self {
        Self { context }
    }

    /// 求值表达式
    pub fn evaluate(&self, expr: &Expression) -> ExecutionResult<Value> {
        self.eval(expr, &Vec::new())
    }

    fn eval(&self, expr: &Expression, locals: &Locals) -> ExecutionResult<Value> {
        match expr {
            Expression::Literal(lit) => Ok(self.eval_literal(lit)),
            Expression::Identifier(name) => self.eval_identifier(name, locals),
            Expression::BinaryOp(op) => {
                let left = self.eval(&op.left, locals)?;
                let right = self.eval(&op.right, locals)?;
                arithmetic(op.op, &left, &right)
            }
            Expression::UnaryOp(op) => self.eval_unary_op(op, locals),
            Expression::BoolOp(op) => self.eval_bool_op(op, locals),
            Expression::Compare(cmp) => self.eval_compare(cmp, locals),
            Expression::FunctionCall(call) => self.eval_function_call(call, locals),
            Expression::Attribute(attr) => self.eval(&attr.value, locals)?.attribute(&attr.name),
            Expression::Subscript(sub) => self.eval_subscript(sub, locals),
            Expression::List(items) | Expression::Tuple(items) => Ok(Value::List(
                items
                    .iter()
                    .map(|item| self.eval(item, locals))
                    .collect::<ExecutionResult<Vec<_>>>()?,
            )),
            Expression::Dict(entries) => {
                let mut map = BTreeMap::new();
                for (key, value) in entries {
                    let key = map_key(self.eval(key, locals)?);
                    map.insert(key, self.eval(value, locals)?);
                }
                Ok(Value::Map(map))
            }
            Expression::Comprehension(comp) => self.eval_comprehension(comp, locals),
            Expression::Conditional(cond) => {
                if self.eval(&cond.condition, locals)?.is_truthy() {
                    self.eval(&cond.then_branch, locals)
                } else {
                    self.eval(&cond.else_branch, locals)
                }
            }
        }
    }

    fn eval_literal(&self, lit: &Literal) -> Value {
        match lit {
            Literal::Integer(i) => Value::Integer(*i),
            Literal::Float(f) => Value::Float(*f),
            Literal::String(s) => Value::String(s.clone()),
            Literal::Boolean(b) => Value::Boolean(*b),
            Literal::Null => Value::Null,
        }
    }

    /// 名称解析: 局部变量 → 行字段 → issue/_ → 函数引用
    fn eval_identifier(&self, name: &str, locals: &Locals) -> ExecutionResult<Value> {
        if let Some((_, value)) = locals.iter().rev().find(|(n, _)| n == name) {
            return Ok(value.clone());
        }
        if let Some(value) = self.context.get_variable(name) {
            return Ok(value.clone());
        }
        if name == "issue" || name == "_" {
            return Ok(self.context.row().clone());
        }
        if self.context.functions().contains(name) {
            return Ok(Value::Function(name.to_string()));
        }
        Err(ExecutionError::UndefinedVariable(name.to_string()))
    }

    fn eval_unary_op(&self, op: &UnaryOp, locals: &Locals) -> ExecutionResult<Value> {
        let operand = self.eval(&op.operand, locals)?;
        match op.op {
            UnaryOperator::Not => Ok(Value::Boolean(!operand.is_truthy())),
            UnaryOperator::Neg => match operand {
                Value::Integer(i) => Ok(i
                    .checked_neg()
                    .map(Value::Integer)
                    .unwrap_or(Value::Float(-(i as f64)))),
                Value::Boolean(b) => Ok(Value::Integer(-(b as i64))),
                Value::Float(f) => Ok(Value::Float(-f)),
                other => Err(ExecutionError::TypeError(format!(
                    "bad operand type for unary -: '{}'",
                    other.type_name()
                ))),
            },
            UnaryOperator::Pos => match operand {
                Value::Boolean(b) => Ok(Value::Integer(b as i64)),
                Value::Integer(_) | Value::Float(_) => Ok(operand),
                other => Err(ExecutionError::TypeError(format!(
                    "bad operand type for unary +: '{}'",
                    other.type_name()
                ))),
            },
        }
    }

    /// and / or 返回决定结果的操作数本身
    fn eval_bool_op(&self, op: &BoolOp, locals: &Locals) -> ExecutionResult<Value> {
        let mut last = Value::Null;
        for (i, operand) in op.values.iter().enumerate() {
            last = self.eval(operand, locals)?;
            let is_last = i + 1 == op.values.len();
            if is_last {
                break;
            }
            match op.op {
                BoolOperator::And if !last.is_truthy() => return Ok(last),
                BoolOperator::Or if last.is_truthy() => return Ok(last),
                _ => {}
            }
        }
        Ok(last)
    }

    fn eval_compare(&self, cmp: &Compare, locals: &Locals) -> ExecutionResult<Value> {
        let mut left = self.eval(&cmp.left, locals)?;
        for (op, right_expr) in &cmp.comparisons {
            let right = self.eval(right_expr, locals)?;
            if !compare(*op, &left, &right)? {
                return Ok(Value::Boolean(false));
            }
            left = right;
        }
        Ok(Value::Boolean(true))
    }

    fn eval_function_call(&self, call: &FunctionCall, locals: &Locals) -> ExecutionResult<Value> {
        let positional = call
            .args
            .iter()
            .map(|arg| self.eval(arg, locals))
            .collect::<ExecutionResult<Vec<_>>>()?;
        let mut keywords = Vec::with_capacity(call.kwargs.len());
        for (name, expr) in &call.kwargs {
            keywords.push((name.clone(), self.eval(expr, locals)?));
        }
        let args = CallArgs::with_keywords(positional, keywords);
        let functions = self.context.functions();

        match &call.callee {
            // 直接调用只查函数表, 行字段不可调用
            Expression::Identifier(name) => functions.call(name, args),
            Expression::Attribute(attr) => {
                let target = self.eval(&attr.value, locals)?;
                match methods::call_method(&target, &attr.name, &args) {
                    Some(result) => result,
                    None => {
                        let callee = target.attribute(&attr.name)?;
                        functions.call_value(&callee, args)
                    }
                }
            }
            other => {
                let callee = self.eval(other, locals)?;
                functions.call_value(&callee, args)
            }
        }
    }

    fn eval_subscript(&self, sub: &Subscript, locals: &Locals) -> ExecutionResult<Value> {
        let value = self.eval(&sub.value, locals)?;
        match &sub.index {
            SubscriptIndex::Index(index) => value.index(&self.eval(index, locals)?),
            SubscriptIndex::Slice { lower, upper } => {
                let lower = self.slice_bound(lower.as_ref(), locals)?;
                let upper = self.slice_bound(upper.as_ref(), locals)?;
                value.slice(lower, upper)
            }
        }
    }

    fn slice_bound(
        &self,
        bound: Option<&Expression>,
        locals: &Locals,
    ) -> ExecutionResult<Option<i64>> {
        let Some(expr) = bound else {
            return Ok(None);
        };
        match self.eval(expr, locals)? {
            Value::Null => Ok(None),
            other => other.as_i64().map(Some).ok_or_else(|| {
                ExecutionError::TypeError(
                    "slice indices must be integers or None or have an __index__ method".into(),
                )
            }),
        }
    }

    // ───────────────────────────────────────────────────────────────────────
    // 推导式
    // ───────────────────────────────────────────────────────────────────────

    fn eval_comprehension(&self, comp: &Comprehension, locals: &Locals) -> ExecutionResult<Value> {
        match &comp.kind {
            ComprehensionKind::List(element) => {
                let mut items = Vec::new();
                self.run_clauses(&comp.clauses, 0, locals, &mut |scope: &Locals| {
                    items.push(self.eval(element, scope)?);
                    check_comprehension_len(items.len())
                })?;
                Ok(Value::List(items))
            }
            ComprehensionKind::Dict { key, value } => {
                let mut map = BTreeMap::new();
                self.run_clauses(&comp.clauses, 0, locals, &mut |scope: &Locals| {
                    let k = map_key(self.eval(key, scope)?);
                    map.insert(k, self.eval(value, scope)?);
                    check_comprehension_len(map.len())
                })?;
                Ok(Value::Map(map))
            }
        }
    }

    fn run_clauses(
        &self,
        clauses: &[ComprehensionClause],
        depth: usize,
        locals: &Locals,
        emit: &mut dyn FnMut(&Locals) -> ExecutionResult<()>,
    ) -> ExecutionResult<()> {
        let Some(clause) = clauses.get(depth) else {
            return emit(locals);
        };

        for item in self.eval(&clause.iter, locals)?.iterate()? {
            let mut scope = locals.clone();
            bind_targets(&clause.targets, item, &mut scope)?;

            let mut keep = true;
            for condition in &clause.conditions {
                if !self.eval(condition, &scope)?.is_truthy() {
                    keep = false;
                    break;
                }
            }
            if keep {
                self.run_clauses(clauses, depth + 1, &scope, emit)?;
            }
        }
        Ok(())
    }
}

fn compare(op: CompareOperator, left: &Value, right: &Value) -> ExecutionResult<bool> {
    use std::cmp::Ordering;

    Ok(match op {
        CompareOperator::Eq => left.py_eq(right),
        CompareOperator::Ne => !left.py_eq(right),
        CompareOperator::Lt => left.py_cmp(right)? == Ordering::Less,
        CompareOperator::Le => left.py_cmp(right)? != Ordering::Greater,
        CompareOperator::Gt => left.py_cmp(right)? == Ordering::Greater,
        CompareOperator::Ge => left.py_cmp(right)? != Ordering::Less,
        CompareOperator::In => right.contains(left)?,
        CompareOperator::NotIn => !right.contains(left)?,
        CompareOperator::Is => left.is_same(right),
        CompareOperator::IsNot => !left.is_same(right),
    })
}

fn bind_targets(targets: &[String], item: Value, scope: &mut Locals) -> ExecutionResult<()> {
    if let [single] = targets {
        scope.push((single.clone(), item));
        return Ok(());
    }

    let values = item.iterate()?;
    if values.len() < targets.len() {
        return Err(ExecutionError::ValueError(format!(
            "not enough values to unpack (expected {}, got {})",
            targets.len(),
            values.len()
        )));
    }
    if values.len() > targets.len() {
        return Err(ExecutionError::ValueError(format!(
            "too many values to unpack (expected {})",
            targets.len()
        )));
    }
    for (name, value) in targets.iter().zip(values) {
        scope.push((name.clone(), value));
    }
    Ok(())
}

fn check_comprehension_len(len: usize) -> ExecutionResult<()> {
    if len > MAX_COMPREHENSION_LEN {
        return Err(ExecutionError::RuntimeError(format!(
            "Comprehension generates more than {} items",
            MAX_COMPREHENSION_LEN
        )));
    }
    Ok(())
}

/// 映射键统一为字符串
fn map_key(key: Value) -> String {
    match key {
        Value::String(s) => s,
        other => other.to_string(),
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// 表达式引擎
// ═══════════════════════════════════════════════════════════════════════════

/// 行级错误处理模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorMode {
    /// 行数据缺失类错误记录告警并返回 NULL
    Lenient,
    /// 所有求值错误都中止查询
    Strict,
}

/// 表达式引擎: 插值 → 解析 → 求值
///
/// 解析结果按插值后的文本缓存, 同一查询内每个表达式只解析一次。
pub struct ExpressionEngine {
    functions: Arc<FunctionRegistry>,
    parsed: Mutex<HashMap<String, Arc<Expression>>>,
}

impl ExpressionEngine {
    pub fn new(functions: Arc<FunctionRegistry>) -> Self {
        Self {
            functions,
            parsed: Mutex::new(HashMap::new()),
        }
    }

    pub fn functions(&self) -> &Arc<FunctionRegistry> {
        &self.functions
    }

    /// 解析 (带缓存)
    pub fn parse(&self, text: &str) -> Result<Arc<Expression>, ParseError> {
        if let Some(expr) = self.parsed.lock().get(text) {
            return Ok(Arc::clone(expr));
        }
        let expr = Arc::new(parse_expression(text)?);
        self.parsed.lock().insert(text.to_string(), Arc::clone(&expr));
        Ok(expr)
    }

    /// 对一行绑定求值表达式
    ///
    /// 插值失败 (未知字段 / 缺参数) 与解析失败都是查询级错误;
    /// 行级错误按 `mode` 处理。返回值已规整 (资源转为展示值)。
    pub fn evaluate(
        &self,
        expression: &str,
        bindings: &Bindings,
        interpolations: Option<&dyn Placeholders>,
        mode: ErrorMode,
    ) -> crate::Result<Value> {
        let text = interpolate(expression, interpolations).map_err(|e| match e {
            InterpolationError::UnknownField(name) => SelectError::FieldName(name),
            InterpolationError::ParameterMissing(name) => SelectError::ParameterMissing(name),
            InterpolationError::Malformed(msg) => {
                SelectError::Query(format!("{}: {}", msg, expression))
            }
        })?;
        let parsed = self
            .parse(&text)
            .map_err(|e| SelectError::Query(format!("{}: {}", e, expression)))?;

        let context = ExecutionContext::new(bindings, &self.functions);
        let evaluator = Evaluator::new(&context);

        match evaluator.evaluate(&parsed) {
            Ok(value) => Ok(value.normalize()),
            Err(ExecutionError::Select(inner)) => Err(*inner),
            Err(e) if e.is_recoverable() && mode == ErrorMode::Lenient => {
                warn!(
                    "{} while evaluating expression {} for issue(s) {}: {}",
                    e.kind(),
                    expression,
                    describe_row(bindings),
                    e
                );
                EVALUATION_ERRORS.with_label_values(&[e.kind()]).inc();
                Ok(Value::Null)
            }
            Err(e) if e.is_recoverable() => {
                Err(SelectError::Evaluation(format!("{}: {}", e, expression)))
            }
            Err(e) => Err(SelectError::Query(format!("{}: {}", e, expression))),
        }
    }
}

fn describe_row(bindings: &Bindings) -> String {
    bindings
        .get("key")
        .map(|key| key.to_string())
        .unwrap_or_else(|| "<unknown>".to_string())
}

// ═══════════════════════════════════════════════════════════════════════════
// 测试
// ═══════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn bindings() -> Bindings {
        match Value::hydrate(&json!({
            "key": "ALPHA-1",
            "summary": "My Ticket",
            "story_points": 3,
            "labels": ["one", "two"],
            "status": {"self": "https://example/status/1", "name": "Open"},
            "worklogs": [{"seconds": 60}, {"seconds": 30}]
        })) {
            Value::Map(map) => map,
            _ => unreachable!(),
        }
    }

    fn eval(text: &str) -> ExecutionResult<Value> {
        let registry = FunctionRegistry::builtin();
        let vars = bindings();
        let context = ExecutionContext::new(&vars, &registry);
        let expr = parse_expression(text).unwrap();
        Evaluator::new(&context).evaluate(&expr)
    }

    #[test]
    fn test_basic_evaluation() {
        assert_eq!(eval("story_points * 2 + 1").unwrap(), Value::Integer(7));
        assert_eq!(eval("story_points / 2").unwrap(), Value::Float(1.5));
        assert_eq!(eval("summary == 'My Ticket'").unwrap(), Value::Boolean(true));
    }

    #[test]
    fn test_row_aliases() {
        assert_eq!(eval("issue.key").unwrap(), Value::from("ALPHA-1"));
        assert_eq!(eval("_.summary").unwrap(), Value::from("My Ticket"));
    }

    #[test]
    fn test_short_circuit_returns_operand() {
        assert_eq!(eval("None or 'fallback'").unwrap(), Value::from("fallback"));
        assert_eq!(eval("0 and undefined_name").unwrap(), Value::Integer(0));
    }

    #[test]
    fn test_comparison_chain_and_membership() {
        assert_eq!(eval("1 < story_points <= 3").unwrap(), Value::Boolean(true));
        assert_eq!(eval("'one' in labels").unwrap(), Value::Boolean(true));
        assert_eq!(eval("'three' not in labels").unwrap(), Value::Boolean(true));
        assert_eq!(eval("status is not None").unwrap(), Value::Boolean(true));
    }

    #[test]
    fn test_resource_attribute() {
        assert_eq!(eval("status.name").unwrap(), Value::from("Open"));
        assert!(matches!(
            eval("status.missing"),
            Err(ExecutionError::AttributeError(_))
        ));
    }

    #[test]
    fn test_comprehensions() {
        assert_eq!(
            eval("[w.seconds for w in worklogs if w.seconds > 40]").unwrap(),
            Value::List(vec![Value::Integer(60)])
        );
        assert_eq!(
            eval("sum(w.seconds for w in worklogs)").unwrap(),
            Value::Integer(90)
        );
        let dict = eval("{l: len(l) for l in labels}").unwrap();
        assert_eq!(dict.get_key("two"), Some(&Value::Integer(3)));
    }

    #[test]
    fn test_method_calls() {
        assert_eq!(eval("summary.upper()").unwrap(), Value::from("MY TICKET"));
        assert_eq!(
            eval("key.split('-')[0]").unwrap(),
            Value::from("ALPHA")
        );
    }

    #[test]
    fn test_error_classification() {
        let err = eval("nope + 1").unwrap_err();
        assert!(matches!(err, ExecutionError::UndefinedVariable(_)));
        assert!(err.is_recoverable());

        let err = eval("nope(1)").unwrap_err();
        assert!(matches!(err, ExecutionError::UndefinedFunction(_)));
        assert!(!err.is_recoverable());

        let err = eval("story_points / 0").unwrap_err();
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_engine_lenient_and_strict() {
        let engine = ExpressionEngine::new(Arc::new(FunctionRegistry::builtin()));
        let vars = bindings();

        let value = engine
            .evaluate("missing_field.name", &vars, None, ErrorMode::Lenient)
            .unwrap();
        assert!(value.is_null());

        let err = engine
            .evaluate("missing_field.name", &vars, None, ErrorMode::Strict)
            .unwrap_err();
        assert!(matches!(err, SelectError::Evaluation(_)));

        let err = engine
            .evaluate("1 +", &vars, None, ErrorMode::Lenient)
            .unwrap_err();
        assert!(matches!(err, SelectError::Query(_)));

        let err = engine
            .evaluate("{Unknown Field}", &vars, None, ErrorMode::Lenient)
            .unwrap_err();
        assert!(matches!(err, SelectError::FieldName(_)));
    }

    #[test]
    fn test_engine_normalizes_resources() {
        let engine = ExpressionEngine::new(Arc::new(FunctionRegistry::builtin()));
        let value = engine
            .evaluate("status", &bindings(), None, ErrorMode::Lenient)
            .unwrap();
        assert_eq!(value, Value::from("Open"));
    }
}
