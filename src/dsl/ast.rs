//! 查询表达式 AST 定义
//!
//! 提供 select/filter/group_by 等子句所用表达式的抽象语法树

// ═══════════════════════════════════════════════════════════════════════════
// 表达式
// ═══════════════════════════════════════════════════════════════════════════

/// 表达式
#[derive(Debug, Clone, PartialEq)]
pub enum Expression {
    /// 字面量
    Literal(Literal),
    /// 标识符
    Identifier(String),
    /// 二元运算
    BinaryOp(Box<BinaryOp>),
    /// 一元运算
    UnaryOp(Box<UnaryOp>),
    /// 短路布尔运算 (and / or)
    BoolOp(BoolOp),
    /// 比较链 (a < b <= c)
    Compare(Box<Compare>),
    /// 函数调用
    FunctionCall(Box<FunctionCall>),
    /// 属性访问
    Attribute(Box<Attribute>),
    /// 下标 / 切片
    Subscript(Box<Subscript>),
    /// 列表字面量
    List(Vec<Expression>),
    /// 元组字面量 (求值为列表)
    Tuple(Vec<Expression>),
    /// 字典字面量
    Dict(Vec<(Expression, Expression)>),
    /// 推导式
    Comprehension(Box<Comprehension>),
    /// 条件表达式
    Conditional(Box<Conditional>),
}

/// 字面量
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Integer(i64),
    Float(f64),
    String(String),
    Boolean(bool),
    Null,
}

/// 二元运算
#[derive(Debug, Clone, PartialEq)]
pub struct BinaryOp {
    pub op: BinaryOperator,
    pub left: Expression,
    pub right: Expression,
}

/// 二元运算符 (仅算术, 比较与布尔运算见 Compare / BoolOp)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOperator {
    Add,
    Sub,
    Mul,
    Div,
    FloorDiv,
    Mod,
    Pow,
}

impl BinaryOperator {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "+" => Some(BinaryOperator::Add),
            "-" => Some(BinaryOperator::Sub),
            "*" => Some(BinaryOperator::Mul),
            "/" => Some(BinaryOperator::Div),
            "//" => Some(BinaryOperator::FloorDiv),
            "%" => Some(BinaryOperator::Mod),
            "**" => Some(BinaryOperator::Pow),
            _ => None,
        }
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            BinaryOperator::Add => "+",
            BinaryOperator::Sub => "-",
            BinaryOperator::Mul => "*",
            BinaryOperator::Div => "/",
            BinaryOperator::FloorDiv => "//",
            BinaryOperator::Mod => "%",
            BinaryOperator::Pow => "** or pow()",
        }
    }
}

/// 一元运算
#[derive(Debug, Clone, PartialEq)]
pub struct UnaryOp {
    pub op: UnaryOperator,
    pub operand: Expression,
}

/// 一元运算符
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOperator {
    Neg,
    Pos,
    Not,
}

/// 短路布尔运算
#[derive(Debug, Clone, PartialEq)]
pub struct BoolOp {
    pub op: BoolOperator,
    pub values: Vec<Expression>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoolOperator {
    And,
    Or,
}

/// 比较链: `left op1 c1 op2 c2 ...`, 各段之间为 and 关系
#[derive(Debug, Clone, PartialEq)]
pub struct Compare {
    pub left: Expression,
    pub comparisons: Vec<(CompareOperator, Expression)>,
}

/// 比较运算符
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOperator {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    NotIn,
    Is,
    IsNot,
}

impl CompareOperator {
    pub fn symbol(&self) -> &'static str {
        match self {
            CompareOperator::Eq => "==",
            CompareOperator::Ne => "!=",
            CompareOperator::Lt => "<",
            CompareOperator::Le => "<=",
            CompareOperator::Gt => ">",
            CompareOperator::Ge => ">=",
            CompareOperator::In => "in",
            CompareOperator::NotIn => "not in",
            CompareOperator::Is => "is",
            CompareOperator::IsNot => "is not",
        }
    }
}

/// 函数调用
///
/// `callee` 为标识符时按函数表查找; 为属性访问时视为方法调用 (白名单)。
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionCall {
    pub callee: Expression,
    pub args: Vec<Expression>,
    pub kwargs: Vec<(String, Expression)>,
}

/// 属性访问
#[derive(Debug, Clone, PartialEq)]
pub struct Attribute {
    pub value: Expression,
    pub name: String,
}

/// 下标访问
#[derive(Debug, Clone, PartialEq)]
pub struct Subscript {
    pub value: Expression,
    pub index: SubscriptIndex,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SubscriptIndex {
    Index(Expression),
    Slice {
        lower: Option<Expression>,
        upper: Option<Expression>,
    },
}

/// 推导式 (列表 / 字典; 生成器参数按列表求值)
#[derive(Debug, Clone, PartialEq)]
pub struct Comprehension {
    pub kind: ComprehensionKind,
    pub clauses: Vec<ComprehensionClause>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ComprehensionKind {
    List(Expression),
    Dict { key: Expression, value: Expression },
}

/// `for targets in iter if cond...`
#[derive(Debug, Clone, PartialEq)]
pub struct ComprehensionClause {
    pub targets: Vec<String>,
    pub iter: Expression,
    pub conditions: Vec<Expression>,
}

/// 条件表达式 `then_branch if condition else else_branch`
#[derive(Debug, Clone, PartialEq)]
pub struct Conditional {
    pub condition: Expression,
    pub then_branch: Expression,
    pub else_branch: Expression,
}
