//! 占位符插值
//!
//! 表达式在解析前先做 `{name}` 文本替换:
//! - `{Story Points}` → 字段别名对应的字段 id
//! - `{params.ok}` → 查询参数值
//! - `{{` / `}}` → 字面花括号 (字典字面量需要这样书写)
//!
//! 替换来源由 [`Placeholders`] 提供; 未提供时任何占位符都视为未知字段。

use once_cell::sync::Lazy;
use regex::Regex;

use super::value::Value;

/// 表达式中引用参数的模式 `{params.<name>...}`
pub static PARAM_FINDER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\{params\.([^}.]+)(?:.[^}.]+)?\}").expect("valid parameter pattern")
});

/// 占位符来源
pub trait Placeholders {
    /// 按根名称查找
    fn resolve(&self, name: &str) -> Option<Value>;

    /// 未知名称是否按原名输出 (字段别名表允许直接写字段 id)
    fn pass_through_unknown(&self) -> bool {
        false
    }
}

/// 插值错误
#[derive(Debug, Clone, PartialEq)]
pub enum InterpolationError {
    /// 占位符名称不存在
    UnknownField(String),
    /// `{params.x}` 引用了未提供的参数
    ParameterMissing(String),
    /// 花括号不配对或格式说明不受支持
    Malformed(String),
}

impl std::fmt::Display for InterpolationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InterpolationError::UnknownField(name) => write!(f, "Unknown field: {}", name),
            InterpolationError::ParameterMissing(name) => {
                write!(f, "Parameter {{params.{}}} was not specified", name)
            }
            InterpolationError::Malformed(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for InterpolationError {}

#[derive(Debug, Clone, PartialEq)]
enum PathPart {
    Attr(String),
    Index(String),
}

/// 执行插值
pub fn interpolate(
    template: &str,
    placeholders: Option<&dyn Placeholders>,
) -> Result<String, InterpolationError> {
    let chars: Vec<char> = template.chars().collect();
    let mut out = String::with_capacity(template.len());
    let mut i = 0;

    while i < chars.len() {
        match chars[i] {
            '{' if chars.get(i + 1) == Some(&'{') => {
                out.push('{');
                i += 2;
            }
            '}' if chars.get(i + 1) == Some(&'}') => {
                out.push('}');
                i += 2;
            }
            '{' => {
                let close = chars[i + 1..]
                    .iter()
                    .position(|c| *c == '}')
                    .map(|offset| i + 1 + offset)
                    .ok_or_else(|| {
                        InterpolationError::Malformed(
                            "Single '{' encountered in format string".into(),
                        )
                    })?;
                let field: String = chars[i + 1..close].iter().collect();
                out.push_str(&replace_field(&field, placeholders)?);
                i = close + 1;
            }
            '}' => {
                return Err(InterpolationError::Malformed(
                    "Single '}' encountered in format string".into(),
                ))
            }
            c => {
                out.push(c);
                i += 1;
            }
        }
    }

    Ok(out)
}

fn replace_field(
    field: &str,
    placeholders: Option<&dyn Placeholders>,
) -> Result<String, InterpolationError> {
    let (name, conversion, spec) = split_field(field);

    if let Some(spec) = spec.filter(|s| !s.is_empty()) {
        return Err(InterpolationError::Malformed(format!(
            "Format specifier '{}' is not supported in expressions",
            spec
        )));
    }
    if name.is_empty() {
        return Err(InterpolationError::Malformed(
            "Format string contains positional fields".into(),
        ));
    }

    let (root, path) = parse_path(name)?;
    let resolved = placeholders.and_then(|p| p.resolve(&root));

    let value = match resolved {
        Some(value) => walk_path(&root, value, &path)?,
        None => {
            if root == "params" {
                let missing = match path.first() {
                    Some(PathPart::Attr(n)) | Some(PathPart::Index(n)) => n.clone(),
                    None => root.clone(),
                };
                return Err(InterpolationError::ParameterMissing(missing));
            }
            let pass_through = placeholders.map(|p| p.pass_through_unknown()).unwrap_or(false);
            if pass_through && path.is_empty() {
                return Ok(root);
            }
            return Err(InterpolationError::UnknownField(name.to_string()));
        }
    };

    match conversion {
        None | Some('s') => Ok(value.to_string()),
        Some('r') => Ok(value.repr()),
        Some(other) => Err(InterpolationError::Malformed(format!(
            "Unknown conversion specifier {}",
            other
        ))),
    }
}

/// 拆分 `name!conv:spec`; `[...]` 内的 `!` `:` 不作分隔
fn split_field(field: &str) -> (&str, Option<char>, Option<&str>) {
    let mut depth = 0usize;
    let mut name_end = field.len();
    for (idx, c) in field.char_indices() {
        match c {
            '[' => depth += 1,
            ']' => depth = depth.saturating_sub(1),
            '!' | ':' if depth == 0 => {
                name_end = idx;
                break;
            }
            _ => {}
        }
    }

    let name = &field[..name_end];
    let rest = &field[name_end..];
    if let Some(after_bang) = rest.strip_prefix('!') {
        let mut chars = after_bang.chars();
        let conversion = chars.next();
        let remainder = chars.as_str();
        let spec = remainder.strip_prefix(':');
        (name, conversion, spec)
    } else {
        (name, None, rest.strip_prefix(':'))
    }
}

fn parse_path(name: &str) -> Result<(String, Vec<PathPart>), InterpolationError> {
    let root_end = name.find(|c| c == '.' || c == '[').unwrap_or(name.len());
    let root = name[..root_end].to_string();
    let mut parts = Vec::new();
    let mut rest = &name[root_end..];

    while !rest.is_empty() {
        if let Some(after_dot) = rest.strip_prefix('.') {
            let end = after_dot.find(|c| c == '.' || c == '[').unwrap_or(after_dot.len());
            if end == 0 {
                return Err(InterpolationError::Malformed("Empty attribute in format string".into()));
            }
            parts.push(PathPart::Attr(after_dot[..end].to_string()));
            rest = &after_dot[end..];
        } else if let Some(after_bracket) = rest.strip_prefix('[') {
            let end = after_bracket.find(']').ok_or_else(|| {
                InterpolationError::Malformed("Missing ']' in format string".into())
            })?;
            parts.push(PathPart::Index(after_bracket[..end].to_string()));
            rest = &after_bracket[end + 1..];
        } else {
            return Err(InterpolationError::Malformed(
                "Only '.' or '[' may follow ']' in format field specifier".into(),
            ));
        }
    }

    Ok((root, parts))
}

fn walk_path(root: &str, value: Value, path: &[PathPart]) -> Result<Value, InterpolationError> {
    let mut current = value;
    for (depth, part) in path.iter().enumerate() {
        let next = match part {
            PathPart::Attr(name) => current.get_key(name).cloned(),
            PathPart::Index(key) => match key.parse::<i64>() {
                Ok(i) => current.index(&Value::Integer(i)).ok(),
                Err(_) => current.get_key(key).cloned(),
            },
        };
        current = match next {
            Some(v) => v,
            None => {
                let missing = match part {
                    PathPart::Attr(n) | PathPart::Index(n) => n.clone(),
                };
                if root == "params" && depth == 0 {
                    return Err(InterpolationError::ParameterMissing(missing));
                }
                return Err(InterpolationError::UnknownField(format!("{}.{}", root, missing)));
            }
        };
    }
    Ok(current)
}

// ═══════════════════════════════════════════════════════════════════════════
// 参数引用扫描
// ═══════════════════════════════════════════════════════════════════════════

/// 表达式中引用了但未提供的参数名 (按出现顺序)
pub fn find_missing_parameters(expression: &str, known: &[String]) -> Vec<String> {
    PARAM_FINDER
        .captures_iter(expression)
        .filter_map(|cap| cap.get(1).map(|m| m.as_str().to_string()))
        .filter(|name| !known.contains(name))
        .collect()
}

/// 表达式中引用的全部参数名
pub fn find_used_parameters(expression: &str) -> Vec<String> {
    let mut used: Vec<String> = Vec::new();
    for cap in PARAM_FINDER.captures_iter(expression) {
        if let Some(m) = cap.get(1) {
            if !used.iter().any(|u| u == m.as_str()) {
                used.push(m.as_str().to_string());
            }
        }
    }
    used
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    struct Fields {
        names: BTreeMap<String, Value>,
        pass_through: bool,
    }

    impl Placeholders for Fields {
        fn resolve(&self, name: &str) -> Option<Value> {
            self.names.get(name).cloned()
        }

        fn pass_through_unknown(&self) -> bool {
            self.pass_through
        }
    }

    fn fields(pass_through: bool) -> Fields {
        let mut names = BTreeMap::new();
        names.insert("Story Points".to_string(), Value::from("customfield10010"));
        let mut params = BTreeMap::new();
        params.insert("ok".to_string(), Value::from("yes"));
        names.insert("params".to_string(), Value::Map(params));
        Fields { names, pass_through }
    }

    #[test]
    fn test_field_alias() {
        let f = fields(false);
        assert_eq!(
            interpolate("{Story Points} > 3", Some(&f)).unwrap(),
            "customfield10010 > 3"
        );
    }

    #[test]
    fn test_escaped_braces() {
        assert_eq!(interpolate("{{'a': 1}}", None).unwrap(), "{'a': 1}");
    }

    #[test]
    fn test_unknown_field() {
        let f = fields(false);
        assert_eq!(
            interpolate("{Nope}", Some(&f)),
            Err(InterpolationError::UnknownField("Nope".into()))
        );
        assert!(matches!(
            interpolate("{anything}", None),
            Err(InterpolationError::UnknownField(_))
        ));
    }

    #[test]
    fn test_pass_through_unknown() {
        let f = fields(true);
        assert_eq!(interpolate("{customfield10011}", Some(&f)).unwrap(), "customfield10011");
    }

    #[test]
    fn test_params() {
        let f = fields(false);
        assert_eq!(interpolate("'{params.ok}'", Some(&f)).unwrap(), "'yes'");
        assert_eq!(interpolate("{params.ok!r}", Some(&f)).unwrap(), "'yes'");
        assert_eq!(
            interpolate("{params.nope}", Some(&f)),
            Err(InterpolationError::ParameterMissing("nope".into()))
        );
    }

    #[test]
    fn test_malformed() {
        assert!(matches!(
            interpolate("{unclosed", None),
            Err(InterpolationError::Malformed(_))
        ));
        assert!(matches!(
            interpolate("a } b", None),
            Err(InterpolationError::Malformed(_))
        ));
        let f = fields(false);
        assert!(matches!(
            interpolate("{Story Points:>10}", Some(&f)),
            Err(InterpolationError::Malformed(_))
        ));
    }

    #[test]
    fn test_parameter_scanning() {
        let known = vec!["ok".to_string()];
        assert_eq!(
            find_missing_parameters("{params.ok} and {params.other.deep}", &known),
            vec!["other".to_string()]
        );
        assert_eq!(
            find_used_parameters("project = {params.p} OR x = {params.p} OR y = {params.q}"),
            vec!["p".to_string(), "q".to_string()]
        );
    }
}
