//! 查询表达式解析器
//!
//! 基于 pest 的表达式解析器, 输出 [`Expression`] AST

use pest::iterators::Pair;
use pest::Parser;
use pest_derive::Parser;

use super::ast::*;

// ═══════════════════════════════════════════════════════════════════════════
// Pest 解析器定义
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Parser)]
#[grammar = "dsl/grammar.pest"]
pub struct ExpressionParser;

// ═══════════════════════════════════════════════════════════════════════════
// 解析错误
// ═══════════════════════════════════════════════════════════════════════════

/// 解析错误
#[derive(Debug, Clone, PartialEq)]
pub struct ParseError {
    pub message: String,
    pub line: usize,
    pub column: usize,
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Parse error at line {}, column {}: {}",
            self.line, self.column, self.message
        )
    }
}

impl std::error::Error for ParseError {}

pub type ParseResult<T> = Result<T, ParseError>;

impl ParseError {
    fn at(pair: &Pair<Rule>, message: impl Into<String>) -> Self {
        let (line, column) = pair.as_span().start_pos().line_col();
        ParseError {
            message: message.into(),
            line,
            column,
        }
    }
}

fn is_keyword(rule: Rule) -> bool {
    matches!(
        rule,
        Rule::kw_and
            | Rule::kw_or
            | Rule::kw_not
            | Rule::kw_in
            | Rule::kw_is
            | Rule::kw_if
            | Rule::kw_else
            | Rule::kw_for
    )
}

/// 取子节点并跳过关键字 token
fn children(pair: Pair<Rule>) -> impl Iterator<Item = Pair<Rule>> {
    pair.into_inner().filter(|p| !is_keyword(p.as_rule()))
}

// ═══════════════════════════════════════════════════════════════════════════
// AST 构建器
// ═══════════════════════════════════════════════════════════════════════════

/// AST 构建器
pub struct AstBuilder;

impl AstBuilder {
    /// 解析单个表达式 (必须完整消费输入)
    pub fn parse_expression(input: &str) -> ParseResult<Expression> {
        let mut pairs = ExpressionParser::parse(Rule::expression_root, input).map_err(|e| {
            let (line, column) = match e.line_col {
                pest::error::LineColLocation::Pos((l, c)) => (l, c),
                pest::error::LineColLocation::Span((l, c), _) => (l, c),
            };
            ParseError {
                message: e.variant.message().to_string(),
                line,
                column,
            }
        })?;

        let root = pairs.next().ok_or_else(|| ParseError {
            message: "Empty expression".to_string(),
            line: 0,
            column: 0,
        })?;

        let expression = root
            .into_inner()
            .find(|p| p.as_rule() == Rule::expression)
            .ok_or_else(|| ParseError {
                message: "Empty expression".to_string(),
                line: 0,
                column: 0,
            })?;

        Self::build(expression)
    }

    /// 按规则分派
    fn build(pair: Pair<Rule>) -> ParseResult<Expression> {
        match pair.as_rule() {
            Rule::expression => Self::build_conditional(pair),
            Rule::disjunction => Self::build_bool_op(pair, BoolOperator::Or),
            Rule::conjunction => Self::build_bool_op(pair, BoolOperator::And),
            Rule::inversion => Self::build_inversion(pair),
            Rule::comparison => Self::build_comparison(pair),
            Rule::sum | Rule::product => Self::build_binary_chain(pair),
            Rule::unary => Self::build_unary(pair),
            Rule::power => Self::build_power(pair),
            Rule::postfix => Self::build_postfix(pair),
            Rule::slice_lower | Rule::slice_upper => {
                let inner = Self::single_child(pair)?;
                Self::build(inner)
            }
            Rule::integer | Rule::float | Rule::string | Rule::kw_true | Rule::kw_false
            | Rule::kw_none => Self::build_literal(pair),
            Rule::identifier => Ok(Expression::Identifier(pair.as_str().to_string())),
            Rule::list | Rule::tuple => {
                let is_tuple = pair.as_rule() == Rule::tuple;
                let items = pair
                    .into_inner()
                    .map(Self::build)
                    .collect::<ParseResult<Vec<_>>>()?;
                Ok(if is_tuple {
                    Expression::Tuple(items)
                } else {
                    Expression::List(items)
                })
            }
            Rule::dict => {
                let entries = pair
                    .into_inner()
                    .map(Self::build_dict_entry)
                    .collect::<ParseResult<Vec<_>>>()?;
                Ok(Expression::Dict(entries))
            }
            Rule::list_comp | Rule::generator | Rule::generator_argument => {
                Self::build_list_comprehension(pair)
            }
            Rule::dict_comp => Self::build_dict_comprehension(pair),
            Rule::parenthesized => {
                let inner = Self::single_child(pair)?;
                Self::build(inner)
            }
            other => Err(ParseError::at(
                &pair,
                format!("Unexpected rule in expression: {:?}", other),
            )),
        }
    }

    fn single_child(pair: Pair<Rule>) -> ParseResult<Pair<Rule>> {
        let err = ParseError::at(&pair, "Expected sub-expression");
        children(pair).next().ok_or(err)
    }

    fn build_conditional(pair: Pair<Rule>) -> ParseResult<Expression> {
        let err = ParseError::at(&pair, "Malformed conditional expression");
        let mut inner = children(pair);

        let then_branch = Self::build(inner.next().ok_or_else(|| err.clone())?)?;
        let condition = match inner.next() {
            Some(c) => Self::build(c)?,
            None => return Ok(then_branch),
        };
        let else_branch = Self::build(inner.next().ok_or(err)?)?;

        Ok(Expression::Conditional(Box::new(Conditional {
            condition,
            then_branch,
            else_branch,
        })))
    }

    fn build_bool_op(pair: Pair<Rule>, op: BoolOperator) -> ParseResult<Expression> {
        let mut values = children(pair)
            .map(Self::build)
            .collect::<ParseResult<Vec<_>>>()?;

        if values.len() == 1 {
            return Ok(values.remove(0));
        }

        Ok(Expression::BoolOp(BoolOp { op, values }))
    }

    fn build_inversion(pair: Pair<Rule>) -> ParseResult<Expression> {
        let mut raw = pair.clone().into_inner().peekable();
        let negated = raw
            .peek()
            .map(|p| p.as_rule() == Rule::kw_not)
            .unwrap_or(false);

        let operand = Self::build(Self::single_child(pair)?)?;

        if negated {
            Ok(Expression::UnaryOp(Box::new(UnaryOp {
                op: UnaryOperator::Not,
                operand,
            })))
        } else {
            Ok(operand)
        }
    }

    fn build_comparison(pair: Pair<Rule>) -> ParseResult<Expression> {
        let err = ParseError::at(&pair, "Expected comparison operand");
        let mut inner = pair.into_inner();

        let left = Self::build(inner.next().ok_or_else(|| err.clone())?)?;
        let mut comparisons = Vec::new();

        while let Some(op_pair) = inner.next() {
            let op = Self::build_compare_op(op_pair)?;
            let right = Self::build(inner.next().ok_or_else(|| err.clone())?)?;
            comparisons.push((op, right));
        }

        if comparisons.is_empty() {
            return Ok(left);
        }

        Ok(Expression::Compare(Box::new(Compare { left, comparisons })))
    }

    fn build_compare_op(pair: Pair<Rule>) -> ParseResult<CompareOperator> {
        let inner = Self::single_child_raw(pair)?;
        let op = match inner.as_rule() {
            Rule::op_eq => CompareOperator::Eq,
            Rule::op_ne => CompareOperator::Ne,
            Rule::op_le => CompareOperator::Le,
            Rule::op_ge => CompareOperator::Ge,
            Rule::op_lt => CompareOperator::Lt,
            Rule::op_gt => CompareOperator::Gt,
            Rule::op_in => CompareOperator::In,
            Rule::op_not_in => CompareOperator::NotIn,
            Rule::op_is => CompareOperator::Is,
            Rule::op_is_not => CompareOperator::IsNot,
            other => {
                return Err(ParseError::at(
                    &inner,
                    format!("Unknown comparison operator: {:?}", other),
                ))
            }
        };
        Ok(op)
    }

    fn single_child_raw(pair: Pair<Rule>) -> ParseResult<Pair<Rule>> {
        let err = ParseError::at(&pair, "Expected operator");
        pair.into_inner().next().ok_or(err)
    }

    /// `a + b - c` / `a * b / c` 左结合
    fn build_binary_chain(pair: Pair<Rule>) -> ParseResult<Expression> {
        let err = ParseError::at(&pair, "Expected right operand");
        let mut inner = pair.into_inner();

        let mut left = Self::build(inner.next().ok_or_else(|| err.clone())?)?;

        while let Some(op_pair) = inner.next() {
            let op = BinaryOperator::from_str(op_pair.as_str()).ok_or_else(|| {
                ParseError::at(
                    &op_pair,
                    format!("Unknown binary operator: {}", op_pair.as_str()),
                )
            })?;
            let right = Self::build(inner.next().ok_or_else(|| err.clone())?)?;
            left = Expression::BinaryOp(Box::new(BinaryOp { op, left, right }));
        }

        Ok(left)
    }

    fn build_unary(pair: Pair<Rule>) -> ParseResult<Expression> {
        let err = ParseError::at(&pair, "Expected unary operand");
        let mut inner = pair.into_inner();
        let first = inner.next().ok_or_else(|| err.clone())?;

        if first.as_rule() != Rule::unary_op {
            return Self::build(first);
        }

        let op = match first.as_str() {
            "-" => UnaryOperator::Neg,
            "+" => UnaryOperator::Pos,
            other => {
                return Err(ParseError::at(
                    &first,
                    format!("Unknown unary operator: {}", other),
                ))
            }
        };
        let operand = Self::build(inner.next().ok_or(err)?)?;

        Ok(Expression::UnaryOp(Box::new(UnaryOp { op, operand })))
    }

    fn build_power(pair: Pair<Rule>) -> ParseResult<Expression> {
        let err = ParseError::at(&pair, "Expected exponent");
        let mut inner = pair.into_inner();
        let base = Self::build(inner.next().ok_or_else(|| err.clone())?)?;

        match inner.next() {
            Some(_pow) => {
                let exponent = Self::build(inner.next().ok_or(err)?)?;
                Ok(Expression::BinaryOp(Box::new(BinaryOp {
                    op: BinaryOperator::Pow,
                    left: base,
                    right: exponent,
                })))
            }
            None => Ok(base),
        }
    }

    /// primary 后接任意个 调用 / 下标 / 属性
    fn build_postfix(pair: Pair<Rule>) -> ParseResult<Expression> {
        let err = ParseError::at(&pair, "Expected primary expression");
        let mut inner = pair.into_inner();
        let mut value = Self::build(inner.next().ok_or(err)?)?;

        for trailer in inner {
            value = match trailer.as_rule() {
                Rule::call => Self::build_call(value, trailer)?,
                Rule::subscript => Self::build_subscript(value, trailer)?,
                Rule::attribute => {
                    let name = Self::single_child(trailer)?.as_str().to_string();
                    Expression::Attribute(Box::new(Attribute { value, name }))
                }
                other => {
                    return Err(ParseError::at(
                        &trailer,
                        format!("Unexpected trailer: {:?}", other),
                    ))
                }
            };
        }

        Ok(value)
    }

    fn build_call(callee: Expression, pair: Pair<Rule>) -> ParseResult<Expression> {
        let mut args = Vec::new();
        let mut kwargs = Vec::new();

        if let Some(arguments) = pair.into_inner().next() {
            for arg in arguments.into_inner() {
                match arg.as_rule() {
                    Rule::keyword_argument => {
                        let err = ParseError::at(&arg, "Expected keyword argument value");
                        let mut inner = arg.into_inner();
                        let name = inner.next().ok_or_else(|| err.clone())?.as_str().to_string();
                        let value = Self::build(inner.next().ok_or(err)?)?;
                        kwargs.push((name, value));
                    }
                    _ => {
                        if !kwargs.is_empty() {
                            return Err(ParseError::at(
                                &arg,
                                "positional argument follows keyword argument",
                            ));
                        }
                        args.push(Self::build(arg)?);
                    }
                }
            }
        }

        Ok(Expression::FunctionCall(Box::new(FunctionCall {
            callee,
            args,
            kwargs,
        })))
    }

    fn build_subscript(value: Expression, pair: Pair<Rule>) -> ParseResult<Expression> {
        let inner = Self::single_child(pair)?;

        let index = if inner.as_rule() == Rule::slice {
            let mut lower = None;
            let mut upper = None;
            for bound in inner.into_inner() {
                match bound.as_rule() {
                    Rule::slice_lower => lower = Some(Self::build(bound)?),
                    Rule::slice_upper => upper = Some(Self::build(bound)?),
                    _ => {}
                }
            }
            SubscriptIndex::Slice { lower, upper }
        } else {
            SubscriptIndex::Index(Self::build(inner)?)
        };

        Ok(Expression::Subscript(Box::new(Subscript { value, index })))
    }

    fn build_dict_entry(pair: Pair<Rule>) -> ParseResult<(Expression, Expression)> {
        let err = ParseError::at(&pair, "Expected dictionary entry");
        let mut inner = pair.into_inner();
        let key = Self::build(inner.next().ok_or_else(|| err.clone())?)?;
        let value = Self::build(inner.next().ok_or(err)?)?;
        Ok((key, value))
    }

    fn build_list_comprehension(pair: Pair<Rule>) -> ParseResult<Expression> {
        let err = ParseError::at(&pair, "Malformed comprehension");
        let mut inner = pair.into_inner();
        let element = Self::build(inner.next().ok_or_else(|| err.clone())?)?;
        let clauses = Self::build_clauses(inner.next().ok_or(err)?)?;

        Ok(Expression::Comprehension(Box::new(Comprehension {
            kind: ComprehensionKind::List(element),
            clauses,
        })))
    }

    fn build_dict_comprehension(pair: Pair<Rule>) -> ParseResult<Expression> {
        let err = ParseError::at(&pair, "Malformed dict comprehension");
        let mut inner = pair.into_inner();
        let (key, value) = Self::build_dict_entry(inner.next().ok_or_else(|| err.clone())?)?;
        let clauses = Self::build_clauses(inner.next().ok_or(err)?)?;

        Ok(Expression::Comprehension(Box::new(Comprehension {
            kind: ComprehensionKind::Dict { key, value },
            clauses,
        })))
    }

    fn build_clauses(pair: Pair<Rule>) -> ParseResult<Vec<ComprehensionClause>> {
        let mut clauses = Vec::new();

        for comp_for in pair.into_inner() {
            let err = ParseError::at(&comp_for, "Malformed for clause");
            let mut inner = children(comp_for);

            let targets = inner
                .next()
                .ok_or_else(|| err.clone())?
                .into_inner()
                .map(|t| t.as_str().to_string())
                .collect();
            let iter = Self::build(inner.next().ok_or(err)?)?;

            let mut conditions = Vec::new();
            for comp_if in inner {
                conditions.push(Self::build(Self::single_child(comp_if)?)?);
            }

            clauses.push(ComprehensionClause {
                targets,
                iter,
                conditions,
            });
        }

        Ok(clauses)
    }

    fn build_literal(pair: Pair<Rule>) -> ParseResult<Expression> {
        let lit = match pair.as_rule() {
            Rule::float => {
                let val: f64 = pair.as_str().parse().map_err(|_| {
                    ParseError::at(&pair, format!("Invalid float: {}", pair.as_str()))
                })?;
                Literal::Float(val)
            }
            Rule::integer => match pair.as_str().parse::<i64>() {
                Ok(val) => Literal::Integer(val),
                // 超出 i64 的整数退化为浮点
                Err(_) => Literal::Float(pair.as_str().parse().map_err(|_| {
                    ParseError::at(&pair, format!("Invalid integer: {}", pair.as_str()))
                })?),
            },
            Rule::string => {
                let inner = Self::single_child_raw(pair)?;
                Literal::String(unescape(inner.as_str()))
            }
            Rule::kw_true => Literal::Boolean(true),
            Rule::kw_false => Literal::Boolean(false),
            Rule::kw_none => Literal::Null,
            other => {
                return Err(ParseError::at(
                    &pair,
                    format!("Unknown literal type: {:?}", other),
                ))
            }
        };

        Ok(Expression::Literal(lit))
    }
}

/// 处理字符串字面量中的反斜杠转义
fn unescape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();

    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('0') => out.push('\0'),
            Some('\\') => out.push('\\'),
            Some('\'') => out.push('\''),
            Some('"') => out.push('"'),
            // 未知转义保持原样
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }

    out
}

// ═══════════════════════════════════════════════════════════════════════════
// 便捷函数
// ═══════════════════════════════════════════════════════════════════════════

/// 解析单个表达式
pub fn parse_expression(input: &str) -> ParseResult<Expression> {
    AstBuilder::parse_expression(input)
}

// ═══════════════════════════════════════════════════════════════════════════
// 测试
// ═══════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_identifier() {
        let expr = parse_expression("story_points").unwrap();
        assert_eq!(expr, Expression::Identifier("story_points".to_string()));
    }

    #[test]
    fn test_parse_arithmetic_precedence() {
        let expr = parse_expression("1 + 2 * 3").unwrap();
        if let Expression::BinaryOp(op) = expr {
            assert_eq!(op.op, BinaryOperator::Add);
            if let Expression::BinaryOp(right) = &op.right {
                assert_eq!(right.op, BinaryOperator::Mul);
            } else {
                panic!("Expected multiplication on the right");
            }
        } else {
            panic!("Expected binary operation");
        }
    }

    #[test]
    fn test_parse_power_binds_tighter_than_negation() {
        let expr = parse_expression("-2 ** 2").unwrap();
        if let Expression::UnaryOp(op) = expr {
            assert_eq!(op.op, UnaryOperator::Neg);
            assert!(matches!(op.operand, Expression::BinaryOp(_)));
        } else {
            panic!("Expected unary negation");
        }
    }

    #[test]
    fn test_parse_comparison_chain() {
        let expr = parse_expression("1 < x <= 3").unwrap();
        if let Expression::Compare(cmp) = expr {
            assert_eq!(cmp.comparisons.len(), 2);
            assert_eq!(cmp.comparisons[0].0, CompareOperator::Lt);
            assert_eq!(cmp.comparisons[1].0, CompareOperator::Le);
        } else {
            panic!("Expected comparison");
        }
    }

    #[test]
    fn test_parse_not_in_and_is_not() {
        let expr = parse_expression("a not in b").unwrap();
        assert!(matches!(
            expr,
            Expression::Compare(ref c) if c.comparisons[0].0 == CompareOperator::NotIn
        ));

        let expr = parse_expression("a is not None").unwrap();
        assert!(matches!(
            expr,
            Expression::Compare(ref c) if c.comparisons[0].0 == CompareOperator::IsNot
        ));
    }

    #[test]
    fn test_parse_keywords_are_not_identifiers() {
        let expr = parse_expression("not inactive").unwrap();
        if let Expression::UnaryOp(op) = expr {
            assert_eq!(op.op, UnaryOperator::Not);
            assert_eq!(op.operand, Expression::Identifier("inactive".to_string()));
        } else {
            panic!("Expected not");
        }

        let expr = parse_expression("Nonesuch").unwrap();
        assert_eq!(expr, Expression::Identifier("Nonesuch".to_string()));
    }

    #[test]
    fn test_parse_call_with_keywords() {
        let expr = parse_expression("sorted(values, reverse=True)").unwrap();
        if let Expression::FunctionCall(call) = expr {
            assert_eq!(call.callee, Expression::Identifier("sorted".to_string()));
            assert_eq!(call.args.len(), 1);
            assert_eq!(call.kwargs[0].0, "reverse");
        } else {
            panic!("Expected function call");
        }
    }

    #[test]
    fn test_parse_method_and_attribute_chain() {
        let expr = parse_expression("status.name.lower()").unwrap();
        if let Expression::FunctionCall(call) = expr {
            assert!(matches!(call.callee, Expression::Attribute(ref a) if a.name == "lower"));
        } else {
            panic!("Expected method call");
        }
    }

    #[test]
    fn test_parse_subscript_and_slice() {
        let expr = parse_expression("labels[0]").unwrap();
        assert!(matches!(
            expr,
            Expression::Subscript(ref s) if matches!(s.index, SubscriptIndex::Index(_))
        ));

        let expr = parse_expression("key[:5]").unwrap();
        if let Expression::Subscript(s) = expr {
            if let SubscriptIndex::Slice { lower, upper } = &s.index {
                assert!(lower.is_none());
                assert!(upper.is_some());
            } else {
                panic!("Expected slice");
            }
        } else {
            panic!("Expected subscript");
        }
    }

    #[test]
    fn test_parse_comprehensions() {
        let expr = parse_expression("[x * 2 for x in values if x > 1]").unwrap();
        if let Expression::Comprehension(comp) = expr {
            assert!(matches!(comp.kind, ComprehensionKind::List(_)));
            assert_eq!(comp.clauses[0].targets, vec!["x".to_string()]);
            assert_eq!(comp.clauses[0].conditions.len(), 1);
        } else {
            panic!("Expected comprehension");
        }

        let expr = parse_expression("sum(x for x in values)").unwrap();
        if let Expression::FunctionCall(call) = expr {
            assert!(matches!(call.args[0], Expression::Comprehension(_)));
        } else {
            panic!("Expected call");
        }

        let expr = parse_expression("{k: v for k, v in pairs}").unwrap();
        if let Expression::Comprehension(comp) = expr {
            assert!(matches!(comp.kind, ComprehensionKind::Dict { .. }));
            assert_eq!(comp.clauses[0].targets.len(), 2);
        } else {
            panic!("Expected dict comprehension");
        }
    }

    #[test]
    fn test_parse_literals() {
        assert_eq!(
            parse_expression("'it\\'s'").unwrap(),
            Expression::Literal(Literal::String("it's".to_string()))
        );
        assert_eq!(
            parse_expression("\"My Ticket #2\"").unwrap(),
            Expression::Literal(Literal::String("My Ticket #2".to_string()))
        );
        assert_eq!(
            parse_expression("1.5").unwrap(),
            Expression::Literal(Literal::Float(1.5))
        );
        assert_eq!(
            parse_expression("None").unwrap(),
            Expression::Literal(Literal::Null)
        );
        assert!(matches!(parse_expression("(1,)").unwrap(), Expression::Tuple(ref t) if t.len() == 1));
        assert!(matches!(parse_expression("(1)").unwrap(), Expression::Literal(_)));
    }

    #[test]
    fn test_parse_conditional() {
        let expr = parse_expression("'big' if story_points > 5 else 'small'").unwrap();
        assert!(matches!(expr, Expression::Conditional(_)));
    }

    #[test]
    fn test_parse_error_reports_position() {
        let err = parse_expression("key +").unwrap_err();
        assert_eq!(err.line, 1);
        assert!(err.column >= 5);

        assert!(parse_expression("import os").is_err());
        assert!(parse_expression("x = 1").is_err());
    }
}
