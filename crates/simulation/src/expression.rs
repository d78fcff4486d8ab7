//! Invariant expressions.
//!
//! Consistency and custom invariants are written in a small expression
//! language, compiled once before the run and evaluated against live
//! metrics:
//!
//! ```text
//! stale_reads(orders-db) == 0 && replication_lag(orders-db) < 500
//! api.error_rate <= 0.05
//! no_write_conflicts
//! checkDataIntegrity()
//! ```
//!
//! Identifiers may contain `-`, so subtraction needs surrounding spaces.
//! A metric without a value makes the whole expression indeterminate, which
//! is never a violation.

use archsim_types::{ComponentId, SimTime};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::snapshot::{Metric, MetricSource};

/// What a registered predicate can see.
pub struct PredicateContext<'a> {
    pub now: SimTime,
    /// The component named in the call, or the invariant's scope.
    pub scope: Option<&'a ComponentId>,
    pub metrics: &'a dyn MetricSource,
}

impl PredicateContext<'_> {
    pub fn metric(&self, metric: Metric) -> Option<f64> {
        self.metrics.metric(metric, self.scope)
    }
}

pub type Predicate = Arc<dyn Fn(&PredicateContext<'_>) -> bool + Send + Sync>;

/// Named predicates callable from expressions.
#[derive(Clone)]
pub struct Predicates {
    registered: BTreeMap<String, Predicate>,
}

impl Default for Predicates {
    fn default() -> Self {
        let mut predicates = Self {
            registered: BTreeMap::new(),
        };
        predicates.register("checkDataIntegrity", |ctx| {
            ctx.metric(Metric::WritesLost).unwrap_or(0.0) == 0.0
                && ctx.metric(Metric::WriteConflicts).unwrap_or(0.0) == 0.0
        });
        predicates.register("checkNoStaleReads", |ctx| {
            ctx.metric(Metric::StaleReads).unwrap_or(0.0) == 0.0
        });
        predicates
    }
}

impl fmt::Debug for Predicates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.registered.keys()).finish()
    }
}

impl Predicates {
    pub fn register(
        &mut self,
        name: impl Into<String>,
        predicate: impl Fn(&PredicateContext<'_>) -> bool + Send + Sync + 'static,
    ) {
        self.registered.insert(name.into(), Arc::new(predicate));
    }

    pub fn get(&self, name: &str) -> Option<&Predicate> {
        self.registered.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.registered.contains_key(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

impl CmpOp {
    fn holds(self, a: f64, b: f64) -> bool {
        match self {
            CmpOp::Lt => a < b,
            CmpOp::Le => a <= b,
            CmpOp::Gt => a > b,
            CmpOp::Ge => a >= b,
            CmpOp::Eq => (a - b).abs() < f64::EPSILON,
            CmpOp::Ne => (a - b).abs() >= f64::EPSILON,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
}

/// Compiled expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    Bool(bool),
    /// `None` reads the invariant's scope, or the system-wide value without
    /// one.
    Metric {
        metric: Metric,
        component: Option<ComponentId>,
    },
    Call {
        name: String,
        component: Option<ComponentId>,
    },
    Not(Box<Expr>),
    Neg(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Compare(CmpOp, Box<Expr>, Box<Expr>),
    Arith(ArithOp, Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Value {
    Number(f64),
    Bool(bool),
}

impl Value {
    fn number(self) -> f64 {
        match self {
            Value::Number(n) => n,
            Value::Bool(b) => f64::from(u8::from(b)),
        }
    }

    fn truthy(self) -> bool {
        match self {
            Value::Number(n) => n != 0.0,
            Value::Bool(b) => b,
        }
    }
}

impl Expr {
    /// Parse `source`, resolving metric and predicate names.
    pub fn compile(source: &str, predicates: &Predicates) -> Result<Self, String> {
        let tokens = lex(source)?;
        let mut parser = Parser {
            tokens,
            pos: 0,
            predicates,
        };
        let expr = parser.or()?;
        if let Some(token) = parser.peek() {
            return Err(format!("unexpected {token} after expression"));
        }
        Ok(expr)
    }

    /// Components named explicitly anywhere in the expression.
    pub fn components(&self) -> Vec<&ComponentId> {
        let mut out = Vec::new();
        self.collect_components(&mut out);
        out
    }

    fn collect_components<'a>(&'a self, out: &mut Vec<&'a ComponentId>) {
        match self {
            Expr::Metric {
                component: Some(c), ..
            }
            | Expr::Call {
                component: Some(c), ..
            } => out.push(c),
            Expr::Not(e) | Expr::Neg(e) => e.collect_components(out),
            Expr::And(a, b) | Expr::Or(a, b) | Expr::Compare(_, a, b) | Expr::Arith(_, a, b) => {
                a.collect_components(out);
                b.collect_components(out);
            }
            _ => {}
        }
    }

    /// `Some(true)` when the expression holds, `None` when a metric it reads
    /// has no value yet.
    pub fn holds(
        &self,
        now: SimTime,
        scope: Option<&ComponentId>,
        metrics: &dyn MetricSource,
        predicates: &Predicates,
    ) -> Option<bool> {
        self.eval(now, scope, metrics, predicates).map(Value::truthy)
    }

    fn eval(
        &self,
        now: SimTime,
        scope: Option<&ComponentId>,
        metrics: &dyn MetricSource,
        predicates: &Predicates,
    ) -> Option<Value> {
        let eval = |e: &Expr| e.eval(now, scope, metrics, predicates);
        Some(match self {
            Expr::Number(n) => Value::Number(*n),
            Expr::Bool(b) => Value::Bool(*b),
            Expr::Metric { metric, component } => {
                Value::Number(metrics.metric(*metric, component.as_ref().or(scope))?)
            }
            Expr::Call { name, component } => {
                let predicate = predicates.get(name)?;
                Value::Bool(predicate(&PredicateContext {
                    now,
                    scope: component.as_ref().or(scope),
                    metrics,
                }))
            }
            Expr::Not(e) => Value::Bool(!eval(e)?.truthy()),
            Expr::Neg(e) => Value::Number(-eval(e)?.number()),
            // Short-circuit so a decided side masks a missing one.
            Expr::And(a, b) => match (eval(a), eval(b)) {
                (Some(x), _) if !x.truthy() => Value::Bool(false),
                (_, Some(y)) if !y.truthy() => Value::Bool(false),
                (Some(_), Some(_)) => Value::Bool(true),
                _ => return None,
            },
            Expr::Or(a, b) => match (eval(a), eval(b)) {
                (Some(x), _) if x.truthy() => Value::Bool(true),
                (_, Some(y)) if y.truthy() => Value::Bool(true),
                (Some(_), Some(_)) => Value::Bool(false),
                _ => return None,
            },
            Expr::Compare(op, a, b) => Value::Bool(op.holds(eval(a)?.number(), eval(b)?.number())),
            Expr::Arith(op, a, b) => {
                let (x, y) = (eval(a)?.number(), eval(b)?.number());
                Value::Number(match op {
                    ArithOp::Add => x + y,
                    ArithOp::Sub => x - y,
                    ArithOp::Mul => x * y,
                    ArithOp::Div if y == 0.0 => return None,
                    ArithOp::Div => x / y,
                })
            }
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Ident(String),
    Str(String),
    LParen,
    RParen,
    Comma,
    Not,
    And,
    Or,
    Cmp(CmpOp),
    Arith(ArithOp),
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Number(n) => write!(f, "number {n}"),
            Token::Ident(s) => write!(f, "`{s}`"),
            Token::Str(s) => write!(f, "'{s}'"),
            Token::LParen => f.write_str("`(`"),
            Token::RParen => f.write_str("`)`"),
            Token::Comma => f.write_str("`,`"),
            Token::Not => f.write_str("`!`"),
            Token::And => f.write_str("`&&`"),
            Token::Or => f.write_str("`||`"),
            Token::Cmp(op) => write!(f, "comparison {op:?}"),
            Token::Arith(op) => write!(f, "operator {op:?}"),
        }
    }
}

fn lex(source: &str) -> Result<Vec<Token>, String> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        match c {
            c if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '&' if next == Some('&') => {
                tokens.push(Token::And);
                i += 2;
            }
            '|' if next == Some('|') => {
                tokens.push(Token::Or);
                i += 2;
            }
            '<' | '>' | '=' | '!' if next == Some('=') => {
                tokens.push(Token::Cmp(match c {
                    '<' => CmpOp::Le,
                    '>' => CmpOp::Ge,
                    '=' => CmpOp::Eq,
                    _ => CmpOp::Ne,
                }));
                i += 2;
            }
            '<' => {
                tokens.push(Token::Cmp(CmpOp::Lt));
                i += 1;
            }
            '>' => {
                tokens.push(Token::Cmp(CmpOp::Gt));
                i += 1;
            }
            '!' => {
                tokens.push(Token::Not);
                i += 1;
            }
            '+' | '-' | '*' | '/' => {
                tokens.push(Token::Arith(match c {
                    '+' => ArithOp::Add,
                    '-' => ArithOp::Sub,
                    '*' => ArithOp::Mul,
                    _ => ArithOp::Div,
                }));
                i += 1;
            }
            '\'' | '"' => {
                let start = i + 1;
                let end = chars[start..]
                    .iter()
                    .position(|ch| *ch == c)
                    .map(|offset| start + offset)
                    .ok_or_else(|| "unterminated string".to_string())?;
                tokens.push(Token::Str(chars[start..end].iter().collect()));
                i = end + 1;
            }
            c if c.is_ascii_digit() || (c == '.' && next.is_some_and(|n| n.is_ascii_digit())) => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let n = text
                    .parse::<f64>()
                    .map_err(|_| format!("bad number `{text}`"))?;
                tokens.push(Token::Number(n));
            }
            c if c.is_alphabetic() || c == '_' || c == '$' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_alphanumeric() || matches!(chars[i], '_' | '-' | '.' | '$'))
                {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            other => return Err(format!("unexpected character `{other}`")),
        }
    }
    Ok(tokens)
}

struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    predicates: &'a Predicates,
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn bump(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek() == Some(token) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: &Token) -> Result<(), String> {
        if self.eat(token) {
            Ok(())
        } else {
            Err(match self.peek() {
                Some(found) => format!("expected {token}, found {found}"),
                None => format!("expected {token} at end of expression"),
            })
        }
    }

    fn or(&mut self) -> Result<Expr, String> {
        let mut left = self.and()?;
        while self.eat(&Token::Or) {
            left = Expr::Or(Box::new(left), Box::new(self.and()?));
        }
        Ok(left)
    }

    fn and(&mut self) -> Result<Expr, String> {
        let mut left = self.not()?;
        while self.eat(&Token::And) {
            left = Expr::And(Box::new(left), Box::new(self.not()?));
        }
        Ok(left)
    }

    fn not(&mut self) -> Result<Expr, String> {
        if self.eat(&Token::Not) {
            return Ok(Expr::Not(Box::new(self.not()?)));
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Expr, String> {
        let left = self.sum()?;
        if let Some(Token::Cmp(op)) = self.peek().cloned() {
            self.pos += 1;
            let right = self.sum()?;
            return Ok(Expr::Compare(op, Box::new(left), Box::new(right)));
        }
        Ok(left)
    }

    fn sum(&mut self) -> Result<Expr, String> {
        let mut left = self.product()?;
        while let Some(Token::Arith(op @ (ArithOp::Add | ArithOp::Sub))) = self.peek().cloned() {
            self.pos += 1;
            left = Expr::Arith(op, Box::new(left), Box::new(self.product()?));
        }
        Ok(left)
    }

    fn product(&mut self) -> Result<Expr, String> {
        let mut left = self.unary()?;
        while let Some(Token::Arith(op @ (ArithOp::Mul | ArithOp::Div))) = self.peek().cloned() {
            self.pos += 1;
            left = Expr::Arith(op, Box::new(left), Box::new(self.unary()?));
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Expr, String> {
        if self.eat(&Token::Arith(ArithOp::Sub)) {
            return Ok(Expr::Neg(Box::new(self.unary()?)));
        }
        self.atom()
    }

    fn atom(&mut self) -> Result<Expr, String> {
        match self.bump() {
            Some(Token::Number(n)) => Ok(Expr::Number(n)),
            Some(Token::LParen) => {
                let inner = self.or()?;
                self.expect(&Token::RParen)?;
                Ok(inner)
            }
            Some(Token::Ident(name)) => {
                if self.eat(&Token::LParen) {
                    let component = self.argument()?;
                    self.expect(&Token::RParen)?;
                    self.resolve_call(&name, component)
                } else {
                    self.resolve_name(&name)
                }
            }
            Some(other) => Err(format!("unexpected {other}")),
            None => Err("unexpected end of expression".to_string()),
        }
    }

    fn argument(&mut self) -> Result<Option<ComponentId>, String> {
        match self.peek().cloned() {
            Some(Token::Ident(s)) | Some(Token::Str(s)) => {
                self.pos += 1;
                Ok(Some(ComponentId::new(s)))
            }
            Some(Token::RParen) => Ok(None),
            Some(other) => Err(format!("expected a component id, found {other}")),
            None => Err("unterminated call".to_string()),
        }
    }

    fn resolve_call(&self, name: &str, component: Option<ComponentId>) -> Result<Expr, String> {
        if self.predicates.contains(name) {
            return Ok(Expr::Call {
                name: name.to_string(),
                component,
            });
        }
        let metric =
            Metric::parse(name).map_err(|_| format!("unknown metric or predicate `{name}`"))?;
        Ok(Expr::Metric { metric, component })
    }

    fn resolve_name(&self, name: &str) -> Result<Expr, String> {
        match name {
            "true" => return Ok(Expr::Bool(true)),
            "false" => return Ok(Expr::Bool(false)),
            _ => {}
        }
        if let Some(metric) = named_check(name) {
            return Ok(Expr::Compare(
                CmpOp::Eq,
                Box::new(Expr::Metric {
                    metric,
                    component: None,
                }),
                Box::new(Expr::Number(0.0)),
            ));
        }
        if self.predicates.contains(name) {
            return Ok(Expr::Call {
                name: name.to_string(),
                component: None,
            });
        }
        if let Some((component, metric)) = name.rsplit_once('.') {
            if let Ok(metric) = Metric::parse(metric) {
                return Ok(Expr::Metric {
                    metric,
                    component: Some(ComponentId::new(component)),
                });
            }
        }
        Metric::parse(name)
            .map(|metric| Expr::Metric {
                metric,
                component: None,
            })
            .map_err(|_| format!("unknown name `{name}`"))
    }
}

/// Shorthands that assert a counter stayed at zero.
fn named_check(name: &str) -> Option<Metric> {
    match name {
        "no_write_conflicts" | "noWriteConflicts" => Some(Metric::WriteConflicts),
        "no_stale_reads" | "noStaleReads" => Some(Metric::StaleReads),
        "no_data_loss" | "noDataLoss" | "no_lost_writes" => Some(Metric::WritesLost),
        _ => None,
    }
}
