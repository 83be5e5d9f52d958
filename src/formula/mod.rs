//! Composite-metric formulas.
//!
//! Grammar (version 1):
//!
//! ```text
//! expr    := term (('+' | '-') term)*
//! term    := unary (('*' | '/') unary)*
//! unary   := '-' unary | primary
//! primary := NUMBER | '[' metric name ']' | '@' identifier | '(' expr ')'
//! ```
//!
//! `×`, `÷` and `−` are accepted as aliases. A formula is parsed once into a
//! flat arena of nodes addressed by index.

pub mod graph;

use crate::errors::{AppError, AppResult};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

const MAX_NESTING: usize = 64;

pub type NodeId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Subtract,
    Multiply,
    Divide,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Number(f64),
    /// Index into [`Formula::references`].
    Reference(usize),
    Negate(NodeId),
    Binary { op: BinaryOp, lhs: NodeId, rhs: NodeId },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Formula {
    source: String,
    nodes: Vec<Node>,
    root: NodeId,
    references: Vec<String>,
}

impl Formula {
    pub fn parse(source: &str) -> AppResult<Self> {
        let tokens = tokenize(source).map_err(|error| error.into_app_error(source))?;
        let mut parser = Parser {
            tokens,
            position: 0,
            nodes: Vec::new(),
            references: Vec::new(),
            depth: 0,
        };
        let root = parser
            .parse_expression()
            .map_err(|error| error.into_app_error(source))?;
        if let Some(token) = parser.tokens.get(parser.position) {
            return Err(FormulaError {
                message: "unexpected trailing input".to_string(),
                offset: token.offset,
            }
            .into_app_error(source));
        }
        Ok(Self {
            source: source.to_string(),
            nodes: parser.nodes,
            root,
            references: parser.references,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Distinct metric names referenced, in order of first appearance.
    pub fn references(&self) -> &[String] {
        &self.references
    }

    /// Evaluates with `resolve` supplying the value of each reference by index.
    /// A missing reference, a division by zero or a non-finite result yields `None`.
    pub fn evaluate<F>(&self, resolve: F) -> Option<f64>
    where
        F: Fn(usize) -> Option<f64>,
    {
        self.evaluate_node(self.root, &resolve)
            .filter(|value| value.is_finite())
    }

    fn evaluate_node<F>(&self, id: NodeId, resolve: &F) -> Option<f64>
    where
        F: Fn(usize) -> Option<f64>,
    {
        match &self.nodes[id] {
            Node::Number(value) => Some(*value),
            Node::Reference(index) => resolve(*index),
            Node::Negate(inner) => self.evaluate_node(*inner, resolve).map(|value| -value),
            Node::Binary { op, lhs, rhs } => {
                let lhs = self.evaluate_node(*lhs, resolve)?;
                let rhs = self.evaluate_node(*rhs, resolve)?;
                match op {
                    BinaryOp::Add => Some(lhs + rhs),
                    BinaryOp::Subtract => Some(lhs - rhs),
                    BinaryOp::Multiply => Some(lhs * rhs),
                    BinaryOp::Divide if rhs == 0.0 => None,
                    BinaryOp::Divide => Some(lhs / rhs),
                }
            }
        }
    }
}

/// Normalized form used to match formula references against definition names.
pub fn normalize_metric_name(raw: &str) -> String {
    raw.replace('_', " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Parsed formulas keyed by metric definition id.
#[derive(Debug, Default)]
pub struct FormulaCache {
    entries: RwLock<HashMap<String, Arc<Formula>>>,
}

impl FormulaCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_parse(&self, definition_id: &str, source: &str) -> AppResult<Arc<Formula>> {
        {
            let entries = self
                .entries
                .read()
                .map_err(|_| AppError::Internal("formula cache lock poisoned".to_string()))?;
            if let Some(formula) = entries.get(definition_id) {
                if formula.source() == source {
                    return Ok(formula.clone());
                }
            }
        }

        let formula = Arc::new(Formula::parse(source)?);
        let mut entries = self
            .entries
            .write()
            .map_err(|_| AppError::Internal("formula cache lock poisoned".to_string()))?;
        entries.insert(definition_id.to_string(), formula.clone());
        Ok(formula)
    }
}

#[derive(Debug)]
struct FormulaError {
    message: String,
    offset: usize,
}

impl FormulaError {
    fn into_app_error(self, source: &str) -> AppError {
        AppError::Configuration(format!(
            "formula '{}': {} at offset {}",
            source, self.message, self.offset
        ))
    }
}

#[derive(Debug, Clone, PartialEq)]
enum TokenKind {
    Number(f64),
    Reference(String),
    Plus,
    Minus,
    Star,
    Slash,
    LParen,
    RParen,
}

#[derive(Debug, Clone)]
struct Token {
    kind: TokenKind,
    offset: usize,
}

fn tokenize(source: &str) -> Result<Vec<Token>, FormulaError> {
    let mut tokens = Vec::new();
    let mut chars = source.char_indices().peekable();

    while let Some((offset, ch)) = chars.next() {
        let kind = match ch {
            c if c.is_whitespace() => continue,
            '+' => TokenKind::Plus,
            '-' | '−' => TokenKind::Minus,
            '*' | '×' => TokenKind::Star,
            '/' | '÷' => TokenKind::Slash,
            '(' => TokenKind::LParen,
            ')' => TokenKind::RParen,
            '[' => {
                let mut name = String::new();
                let mut closed = false;
                for (_, next) in chars.by_ref() {
                    if next == ']' {
                        closed = true;
                        break;
                    }
                    name.push(next);
                }
                if !closed {
                    return Err(FormulaError {
                        message: "unterminated metric reference".to_string(),
                        offset,
                    });
                }
                let name = name.trim();
                if name.is_empty() {
                    return Err(FormulaError {
                        message: "empty metric reference".to_string(),
                        offset,
                    });
                }
                TokenKind::Reference(name.to_string())
            }
            '@' => {
                let mut name = String::new();
                while let Some((_, next)) = chars.peek() {
                    if next.is_alphanumeric() || *next == '_' {
                        name.push(*next);
                        chars.next();
                    } else {
                        break;
                    }
                }
                if name.is_empty() {
                    return Err(FormulaError {
                        message: "'@' must be followed by a metric identifier".to_string(),
                        offset,
                    });
                }
                TokenKind::Reference(name)
            }
            c if c.is_ascii_digit() || c == '.' => {
                let mut literal = String::from(c);
                while let Some((_, next)) = chars.peek() {
                    if next.is_ascii_digit() || *next == '.' {
                        literal.push(*next);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let value = literal.parse::<f64>().map_err(|_| FormulaError {
                    message: format!("invalid number '{}'", literal),
                    offset,
                })?;
                TokenKind::Number(value)
            }
            other => {
                return Err(FormulaError {
                    message: format!("unexpected character '{}'", other),
                    offset,
                })
            }
        };
        tokens.push(Token { kind, offset });
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    position: usize,
    nodes: Vec<Node>,
    references: Vec<String>,
    depth: usize,
}

impl Parser {
    fn parse_expression(&mut self) -> Result<NodeId, FormulaError> {
        let mut lhs = self.parse_term()?;
        loop {
            let op = match self.peek_kind() {
                Some(TokenKind::Plus) => BinaryOp::Add,
                Some(TokenKind::Minus) => BinaryOp::Subtract,
                _ => return Ok(lhs),
            };
            self.position += 1;
            let rhs = self.parse_term()?;
            lhs = self.push(Node::Binary { op, lhs, rhs });
        }
    }

    fn parse_term(&mut self) -> Result<NodeId, FormulaError> {
        let mut lhs = self.parse_unary()?;
        loop {
            let op = match self.peek_kind() {
                Some(TokenKind::Star) => BinaryOp::Multiply,
                Some(TokenKind::Slash) => BinaryOp::Divide,
                _ => return Ok(lhs),
            };
            self.position += 1;
            let rhs = self.parse_unary()?;
            lhs = self.push(Node::Binary { op, lhs, rhs });
        }
    }

    fn parse_unary(&mut self) -> Result<NodeId, FormulaError> {
        if matches!(self.peek_kind(), Some(TokenKind::Minus)) {
            let offset = self.current_offset();
            self.position += 1;
            self.enter(offset)?;
            let inner = self.parse_unary()?;
            self.depth -= 1;
            return Ok(self.push(Node::Negate(inner)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<NodeId, FormulaError> {
        let offset = self.current_offset();
        let Some(token) = self.tokens.get(self.position).cloned() else {
            return Err(FormulaError {
                message: "unexpected end of formula".to_string(),
                offset,
            });
        };
        self.position += 1;

        match token.kind {
            TokenKind::Number(value) => Ok(self.push(Node::Number(value))),
            TokenKind::Reference(name) => {
                let index = match self.references.iter().position(|existing| {
                    normalize_metric_name(existing) == normalize_metric_name(&name)
                }) {
                    Some(index) => index,
                    None => {
                        self.references.push(name);
                        self.references.len() - 1
                    }
                };
                Ok(self.push(Node::Reference(index)))
            }
            TokenKind::LParen => {
                self.enter(token.offset)?;
                let inner = self.parse_expression()?;
                self.depth -= 1;
                match self.peek_kind() {
                    Some(TokenKind::RParen) => {
                        self.position += 1;
                        Ok(inner)
                    }
                    _ => Err(FormulaError {
                        message: "missing closing parenthesis".to_string(),
                        offset: token.offset,
                    }),
                }
            }
            other => Err(FormulaError {
                message: format!("unexpected token {:?}", other),
                offset: token.offset,
            }),
        }
    }

    fn enter(&mut self, offset: usize) -> Result<(), FormulaError> {
        self.depth += 1;
        if self.depth > MAX_NESTING {
            return Err(FormulaError {
                message: format!("nesting deeper than {}", MAX_NESTING),
                offset,
            });
        }
        Ok(())
    }

    fn peek_kind(&self) -> Option<&TokenKind> {
        self.tokens.get(self.position).map(|token| &token.kind)
    }

    fn current_offset(&self) -> usize {
        self.tokens
            .get(self.position)
            .or_else(|| self.tokens.last())
            .map(|token| token.offset)
            .unwrap_or(0)
    }

    fn push(&mut self, node: Node) -> NodeId {
        self.nodes.push(node);
        self.nodes.len() - 1
    }
}

#[cfg(test)]
mod tests {
    use super::{normalize_metric_name, Formula, FormulaCache};
    use std::sync::Arc;

    fn eval(source: &str, values: &[Option<f64>]) -> Option<f64> {
        let formula = Formula::parse(source).expect("parse");
        formula.evaluate(|index| values.get(index).copied().flatten())
    }

    #[test]
    fn respects_precedence_and_parentheses() {
        assert_eq!(eval("1 + 2 * 3", &[]), Some(7.0));
        assert_eq!(eval("(1 + 2) * 3", &[]), Some(9.0));
        assert_eq!(eval("10 - 4 - 3", &[]), Some(3.0));
        assert_eq!(eval("-2 * -3", &[]), Some(6.0));
        assert_eq!(eval("8 ÷ 2 × 3", &[]), Some(12.0));
    }

    #[test]
    fn collects_bracket_and_sigil_references() {
        let formula = Formula::parse("[Gross Revenue] / @Patient_Visits + [gross revenue]").expect("parse");
        assert_eq!(formula.references(), ["Gross Revenue", "Patient_Visits"]);
        assert_eq!(
            formula.evaluate(|index| [Some(1000.0), Some(40.0)][index]),
            Some(1025.0)
        );
    }

    #[test]
    fn missing_reference_and_division_by_zero_are_undefined() {
        assert_eq!(eval("[A] + [B]", &[Some(1.0), None]), None);
        assert_eq!(eval("[A] / [B]", &[Some(1.0), Some(0.0)]), None);
        assert_eq!(eval("[A] * 0", &[Some(5.0)]), Some(0.0));
    }

    #[test]
    fn rejects_malformed_formulas() {
        for source in ["", "1 +", "(1 + 2", "[Visits", "[]", "@", "1 ? 2", "1 2", "1..2"] {
            let error = Formula::parse(source).expect_err(source);
            assert!(error.to_string().starts_with("CONFIG_INVALID"), "{}", source);
        }
    }

    #[test]
    fn rejects_excessive_nesting() {
        let source = format!("{}1{}", "(".repeat(80), ")".repeat(80));
        assert!(Formula::parse(&source).is_err());
    }

    #[test]
    fn names_normalize_underscores_case_and_spacing() {
        assert_eq!(normalize_metric_name("Patient_Visits"), "patient visits");
        assert_eq!(normalize_metric_name("  Patient   Visits "), "patient visits");
    }

    #[test]
    fn cache_reparses_only_changed_source() {
        let cache = FormulaCache::new();
        let first = cache.get_or_parse("m1", "[A] + 1").expect("parse");
        let again = cache.get_or_parse("m1", "[A] + 1").expect("parse");
        assert!(Arc::ptr_eq(&first, &again));
        let changed = cache.get_or_parse("m1", "[A] + 2").expect("parse");
        assert!(!Arc::ptr_eq(&first, &changed));
    }
}
