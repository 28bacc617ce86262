//! Skip-rule predicates.
//!
//! A predicate is a single `{{ ... }}` expression over the named capture
//! groups of a rule's matcher:
//!
//! ```text
//! {{ (version == '4.18.0' and 492 <= (rpmrelver|int) <= 500) }}
//! {{ major|int > 6 or (major|int == 6 and minor|int >= 2) }}
//! ```
//!
//! Supported: integer and string literals, `true`/`false`/`none`,
//! identifiers, parentheses, `== != < <= > >=` (chainable), `and`, `or`,
//! `not`, the `|int` filter and `int(x)`. Nothing else is evaluated.
//!
//! A rule fires when the rendered value is non-empty and not `False`, so an
//! integer result counts as true and an unset capture group as false.

use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ExprError {
    #[error("syntax error at offset {offset}: {message}")]
    Syntax { offset: usize, message: String },

    #[error("cannot compare {left} {op} {right}")]
    Incomparable {
        left: &'static str,
        op: CmpOp,
        right: &'static str,
    },

    #[error("unknown function `{0}`")]
    UnknownFunction(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Capture group that did not participate, or an unknown name.
    Undefined,
    None,
    Bool(bool),
    Int(i64),
    Str(String),
}

impl Value {
    fn type_name(&self) -> &'static str {
        match self {
            Value::Undefined => "undefined",
            Value::None => "none",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Str(_) => "string",
        }
    }

    /// `x|int`: unparsable input becomes 0, floats are truncated.
    fn to_int(&self) -> i64 {
        match self {
            Value::Int(i) => *i,
            Value::Bool(b) => i64::from(*b),
            Value::Str(s) => {
                let s = s.trim();
                s.parse::<i64>()
                    .ok()
                    .or_else(|| s.parse::<f64>().ok().filter(|f| f.is_finite()).map(|f| f as i64))
                    .unwrap_or(0)
            }
            Value::Undefined | Value::None => 0,
        }
    }

    fn is_truthy(&self) -> bool {
        match self {
            Value::Undefined | Value::None => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Str(s) => !s.is_empty(),
        }
    }

    /// Text the expression renders to.
    pub fn rendered(&self) -> String {
        match self {
            Value::Undefined => String::new(),
            Value::None => "None".to_string(),
            Value::Bool(true) => "True".to_string(),
            Value::Bool(false) => "False".to_string(),
            Value::Int(i) => i.to_string(),
            Value::Str(s) => s.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl fmt::Display for CmpOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CmpOp::Eq => "==",
            CmpOp::Ne => "!=",
            CmpOp::Lt => "<",
            CmpOp::Le => "<=",
            CmpOp::Gt => ">",
            CmpOp::Ge => ">=",
        };
        f.write_str(s)
    }
}

fn compare(left: &Value, op: CmpOp, right: &Value) -> Result<bool, ExprError> {
    use std::cmp::Ordering;

    let ordering = match (left, right) {
        (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        (Value::Int(a), Value::Bool(b)) => Some(a.cmp(&i64::from(*b))),
        (Value::Bool(a), Value::Int(b)) => Some(i64::from(*a).cmp(b)),
        (Value::Str(a), Value::Str(b)) => Some(a.cmp(b)),
        _ => None,
    };

    match (op, ordering) {
        (CmpOp::Eq, Some(o)) => Ok(o == Ordering::Equal),
        (CmpOp::Ne, Some(o)) => Ok(o != Ordering::Equal),
        (CmpOp::Eq, None) => Ok(matches!(
            (left, right),
            (Value::None, Value::None) | (Value::Undefined, Value::Undefined)
        )),
        (CmpOp::Ne, None) => Ok(!matches!(
            (left, right),
            (Value::None, Value::None) | (Value::Undefined, Value::Undefined)
        )),
        (CmpOp::Lt, Some(o)) => Ok(o == Ordering::Less),
        (CmpOp::Le, Some(o)) => Ok(o != Ordering::Greater),
        (CmpOp::Gt, Some(o)) => Ok(o == Ordering::Greater),
        (CmpOp::Ge, Some(o)) => Ok(o != Ordering::Less),
        (op, None) => Err(ExprError::Incomparable {
            left: left.type_name(),
            op,
            right: right.type_name(),
        }),
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Int(i64),
    Str(String),
    Ident(String),
    Cmp(CmpOp),
    And,
    Or,
    Not,
    True,
    False,
    None,
    Pipe,
    LParen,
    RParen,
}

fn tokenize(src: &str) -> Result<Vec<(usize, Token)>, ExprError> {
    let bytes = src.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;

    let syntax = |offset: usize, message: String| ExprError::Syntax { offset, message };

    while i < bytes.len() {
        let c = bytes[i];
        let start = i;
        match c {
            b' ' | b'\t' | b'\n' | b'\r' => {
                i += 1;
                continue;
            }
            b'(' => {
                tokens.push((start, Token::LParen));
                i += 1;
            }
            b')' => {
                tokens.push((start, Token::RParen));
                i += 1;
            }
            b'|' => {
                tokens.push((start, Token::Pipe));
                i += 1;
            }
            b'=' | b'!' | b'<' | b'>' => {
                let next = bytes.get(i + 1).copied();
                let (op, len) = match (c, next) {
                    (b'=', Some(b'=')) => (CmpOp::Eq, 2),
                    (b'!', Some(b'=')) => (CmpOp::Ne, 2),
                    (b'<', Some(b'=')) => (CmpOp::Le, 2),
                    (b'>', Some(b'=')) => (CmpOp::Ge, 2),
                    (b'<', _) => (CmpOp::Lt, 1),
                    (b'>', _) => (CmpOp::Gt, 1),
                    _ => return Err(syntax(start, format!("unexpected `{}`", c as char))),
                };
                tokens.push((start, Token::Cmp(op)));
                i += len;
            }
            b'\'' | b'"' => {
                let quote = c;
                let mut value = String::new();
                i += 1;
                loop {
                    match bytes.get(i) {
                        None => return Err(syntax(start, "unterminated string".to_string())),
                        Some(&b) if b == quote => {
                            i += 1;
                            break;
                        }
                        Some(b'\\') => {
                            let escaped = src[i + 1..]
                                .chars()
                                .next()
                                .ok_or_else(|| syntax(i, "dangling escape".to_string()))?;
                            value.push(escaped);
                            i += 1 + escaped.len_utf8();
                        }
                        Some(_) => {
                            // copy a whole UTF-8 character
                            let ch = src[i..]
                                .chars()
                                .next()
                                .ok_or_else(|| syntax(i, "invalid character".to_string()))?;
                            value.push(ch);
                            i += ch.len_utf8();
                        }
                    }
                }
                tokens.push((start, Token::Str(value)));
            }
            b'0'..=b'9' => {
                while i < bytes.len() && bytes[i].is_ascii_digit() {
                    i += 1;
                }
                let n = src[start..i]
                    .parse()
                    .map_err(|_| syntax(start, format!("integer out of range: {}", &src[start..i])))?;
                tokens.push((start, Token::Int(n)));
            }
            c if c == b'_' || c.is_ascii_alphabetic() => {
                while i < bytes.len() && (bytes[i] == b'_' || bytes[i].is_ascii_alphanumeric()) {
                    i += 1;
                }
                let token = match &src[start..i] {
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    "true" | "True" => Token::True,
                    "false" | "False" => Token::False,
                    "none" | "None" => Token::None,
                    ident => Token::Ident(ident.to_string()),
                };
                tokens.push((start, token));
            }
            _ => {
                let ch = src[start..].chars().next().unwrap_or('?');
                return Err(syntax(start, format!("unexpected `{}`", ch)));
            }
        }
    }
    Ok(tokens)
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Literal(Value),
    Var(String),
    Int(Box<Expr>),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    /// `a < b <= c` holds when every adjacent pair does.
    Compare(Box<Expr>, Vec<(CmpOp, Expr)>),
}

struct Parser {
    tokens: Vec<(usize, Token)>,
    pos: usize,
    end: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(_, t)| t)
    }

    fn offset(&self) -> usize {
        self.tokens.get(self.pos).map(|(o, _)| *o).unwrap_or(self.end)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).map(|(_, t)| t.clone());
        self.pos += 1;
        token
    }

    fn error(&self, message: impl Into<String>) -> ExprError {
        ExprError::Syntax {
            offset: self.offset(),
            message: message.into(),
        }
    }

    fn expect(&mut self, expected: Token) -> Result<(), ExprError> {
        match self.peek() {
            Some(t) if *t == expected => {
                self.pos += 1;
                Ok(())
            }
            Some(t) => Err(self.error(format!("expected {:?}, found {:?}", expected, t))),
            None => Err(self.error(format!("expected {:?}, found end of expression", expected))),
        }
    }

    fn or(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.and()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            let right = self.and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn and(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.not()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            let right = self.not()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn not(&mut self) -> Result<Expr, ExprError> {
        if self.peek() == Some(&Token::Not) {
            self.pos += 1;
            return Ok(Expr::Not(Box::new(self.not()?)));
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Expr, ExprError> {
        let first = self.filtered()?;
        let mut rest = Vec::new();
        while let Some(Token::Cmp(op)) = self.peek() {
            let op = *op;
            self.pos += 1;
            rest.push((op, self.filtered()?));
        }
        if rest.is_empty() {
            Ok(first)
        } else {
            Ok(Expr::Compare(Box::new(first), rest))
        }
    }

    fn filtered(&mut self) -> Result<Expr, ExprError> {
        let mut expr = self.primary()?;
        while self.peek() == Some(&Token::Pipe) {
            self.pos += 1;
            match self.next() {
                Some(Token::Ident(name)) if name == "int" => expr = Expr::Int(Box::new(expr)),
                Some(Token::Ident(name)) => return Err(ExprError::UnknownFunction(name)),
                _ => return Err(self.error("expected filter name after `|`")),
            }
        }
        Ok(expr)
    }

    fn primary(&mut self) -> Result<Expr, ExprError> {
        let offset = self.offset();
        match self.next() {
            Some(Token::Int(n)) => Ok(Expr::Literal(Value::Int(n))),
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::Str(s))),
            Some(Token::True) => Ok(Expr::Literal(Value::Bool(true))),
            Some(Token::False) => Ok(Expr::Literal(Value::Bool(false))),
            Some(Token::None) => Ok(Expr::Literal(Value::None)),
            Some(Token::LParen) => {
                let inner = self.or()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Some(Token::Ident(name)) if self.peek() == Some(&Token::LParen) => {
                if name != "int" {
                    return Err(ExprError::UnknownFunction(name));
                }
                self.pos += 1;
                let arg = self.or()?;
                self.expect(Token::RParen)?;
                Ok(Expr::Int(Box::new(arg)))
            }
            Some(Token::Ident(name)) => Ok(Expr::Var(name)),
            Some(t) => Err(ExprError::Syntax {
                offset,
                message: format!("unexpected {:?}", t),
            }),
            None => Err(ExprError::Syntax {
                offset,
                message: "unexpected end of expression".to_string(),
            }),
        }
    }
}

impl Expr {
    fn eval(&self, vars: &HashMap<String, String>) -> Result<Value, ExprError> {
        Ok(match self {
            Expr::Literal(v) => v.clone(),
            Expr::Var(name) => vars.get(name).map(|s| Value::Str(s.clone())).unwrap_or(Value::Undefined),
            Expr::Int(inner) => Value::Int(inner.eval(vars)?.to_int()),
            Expr::Not(inner) => Value::Bool(!inner.eval(vars)?.is_truthy()),
            // `and`/`or` yield one of their operands, like Python
            Expr::And(l, r) => {
                let left = l.eval(vars)?;
                if left.is_truthy() {
                    r.eval(vars)?
                } else {
                    left
                }
            }
            Expr::Or(l, r) => {
                let left = l.eval(vars)?;
                if left.is_truthy() {
                    left
                } else {
                    r.eval(vars)?
                }
            }
            Expr::Compare(first, rest) => {
                let mut left = first.eval(vars)?;
                for (op, expr) in rest {
                    let right = expr.eval(vars)?;
                    if !compare(&left, *op, &right)? {
                        return Ok(Value::Bool(false));
                    }
                    left = right;
                }
                Value::Bool(true)
            }
        })
    }
}

/// A compiled skip predicate.
#[derive(Debug, Clone)]
pub struct Predicate {
    source: String,
    expr: Expr,
}

impl Predicate {
    /// Compile a `{{ expr }}` template (the braces are optional).
    pub fn parse(template: &str) -> Result<Self, ExprError> {
        let trimmed = template.trim();
        let body = trimmed
            .strip_prefix("{{")
            .and_then(|s| s.strip_suffix("}}"))
            .unwrap_or(trimmed);

        let tokens = tokenize(body)?;
        let mut parser = Parser {
            tokens,
            pos: 0,
            end: body.len(),
        };
        let expr = parser.or()?;
        if parser.peek().is_some() {
            return Err(parser.error("trailing input"));
        }
        Ok(Self {
            source: template.to_string(),
            expr,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluate to the value the template would render.
    pub fn eval(&self, vars: &HashMap<String, String>) -> Result<Value, ExprError> {
        self.expr.eval(vars)
    }

    /// Whether the rendered result counts as "skip".
    pub fn is_satisfied(&self, vars: &HashMap<String, String>) -> Result<bool, ExprError> {
        let rendered = self.eval(vars)?.rendered();
        Ok(!rendered.is_empty() && rendered != "False")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    fn holds(template: &str, pairs: &[(&str, &str)]) -> bool {
        Predicate::parse(template).unwrap().is_satisfied(&vars(pairs)).unwrap()
    }

    #[test]
    fn test_rhel_release_range() {
        let template = "{{ (version == '4.18.0' and 492<=(rpmrelver|int)<=500) }}";
        assert!(holds(template, &[("version", "4.18.0"), ("rpmrelver", "497")]));
        assert!(holds(template, &[("version", "4.18.0"), ("rpmrelver", "492")]));
        assert!(!holds(template, &[("version", "4.18.0"), ("rpmrelver", "477")]));
        assert!(!holds(template, &[("version", "4.18.0"), ("rpmrelver", "506")]));
        assert!(!holds(template, &[("version", "5.14.0"), ("rpmrelver", "497")]));
    }

    #[test]
    fn test_precedence_of_and_over_or() {
        let template = "{{ major|int >= 6 or major|int == 6 and minor|int >= 2 }}";
        assert!(holds(template, &[("major", "7"), ("minor", "0")]));
        assert!(holds(template, &[("major", "6"), ("minor", "0")]));
        assert!(!holds(template, &[("major", "5"), ("minor", "19")]));

        let template = "{{ (major|int > 6) or (major|int == 6 and minor|int >= 2) }}";
        assert!(holds(template, &[("major", "6"), ("minor", "2")]));
        assert!(!holds(template, &[("major", "6"), ("minor", "1")]));
    }

    #[test]
    fn test_int_coercion() {
        assert!(holds("{{ int(x) == 0 }}", &[("x", "")]));
        assert!(holds("{{ x|int == 4 }}", &[("x", "4.9")]));
        assert!(holds("{{ missing|int == 0 }}", &[]));
        assert!(holds("{{ not (x|int) }}", &[("x", "abc")]));
    }

    #[test]
    fn test_rendered_truthiness() {
        // integers render as non-empty text
        assert!(holds("{{ 0 }}", &[]));
        assert!(!holds("{{ false }}", &[]));
        assert!(!holds("{{ missing }}", &[]));
        assert!(holds("{{ missing or 'yes' }}", &[]));
        assert!(!holds("{{ x == 'a' and x }}", &[("x", "b")]));
    }

    #[test]
    fn test_not_binds_looser_than_comparison() {
        assert!(holds("{{ not x == 'a' }}", &[("x", "b")]));
        assert!(!holds("{{ not x == 'a' }}", &[("x", "a")]));
    }

    #[test]
    fn test_incomparable_types() {
        let p = Predicate::parse("{{ x < 3 }}").unwrap();
        let err = p.is_satisfied(&vars(&[("x", "2")])).unwrap_err();
        assert_eq!(
            err,
            ExprError::Incomparable {
                left: "string",
                op: CmpOp::Lt,
                right: "int"
            }
        );
        // equality across types is simply false
        assert!(!holds("{{ x == 2 }}", &[("x", "2")]));
    }

    #[test]
    fn test_syntax_errors() {
        assert!(matches!(Predicate::parse("{{ (a == 1 }}"), Err(ExprError::Syntax { .. })));
        assert!(matches!(Predicate::parse("{{ a = 1 }}"), Err(ExprError::Syntax { .. })));
        assert!(matches!(Predicate::parse("{{ 'open }}"), Err(ExprError::Syntax { .. })));
        assert!(matches!(Predicate::parse("{{ a b }}"), Err(ExprError::Syntax { .. })));
        assert_eq!(
            Predicate::parse("{{ a|upper }}").unwrap_err(),
            ExprError::UnknownFunction("upper".to_string())
        );
        assert_eq!(
            Predicate::parse("{{ len(a) }}").unwrap_err(),
            ExprError::UnknownFunction("len".to_string())
        );
    }

    #[test]
    fn test_escaped_characters() {
        assert!(holds("kernelrelease == '\\é'", &[("kernelrelease", "é")]));
        assert!(holds("{{ x == 'it\\'s' }}", &[("x", "it's")]));
        assert!(holds("{{ x == \"5.4\\ü-1\" }}", &[("x", "5.4ü-1")]));
        assert!(matches!(Predicate::parse("'a\\"), Err(ExprError::Syntax { .. })));
    }

    #[test]
    fn test_source_is_kept() {
        let p = Predicate::parse("{{ true }}").unwrap();
        assert_eq!(p.source(), "{{ true }}");
    }
}
