//! 查询表达式 DSL 模块
//!
//! 提供 select/filter/group_by 等子句中表达式的完整实现：
//! - 语法定义 (grammar.pest)
//! - AST 结构 (ast.rs)
//! - 解析器 (parser.rs)
//! - 值模型 (value.rs)
//! - 占位符插值 (interpolate.rs)
//! - 沙箱执行引擎 (executor/)
//! - 函数表 (functions/)
//!
//! 求值分两步: 先做 `{name}` 插值, 再解析并在沙箱内求值。
//! 两步的错误类型互相独立 (插值失败 = 查询配置错误, 求值失败 = 行数据缺失)。

pub mod ast;
pub mod executor;
pub mod functions;
pub mod interpolate;
pub mod parser;
pub mod value;

pub use ast::*;
pub use executor::*;
pub use functions::{CallArgs, Function, FunctionRegistry};
pub use interpolate::{interpolate, InterpolationError, Placeholders};
pub use parser::*;
pub use value::{Bindings, Resource, Value};
