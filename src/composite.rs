//! Composite-symbol evaluation (spec §4.4's supplemented composite
//! stage, enriching the distilled spec from `original_source/`'s
//! `composites.c` policy).
//!
//! A composite symbol carries a boolean expression over other symbols'
//! names (`&` and, `|` or, `!` not, parentheses for grouping). Composite
//! symbols never run inside the filters-stage scheduler (`scheduler.rs`
//! skips them outright, §4.4) — they are dispatched once, in
//! registration order, by the composites stage handler, after the
//! filters stage's cursor has reached the end. A term naming a symbol
//! that never activated is treated as absent/false, not an error,
//! mirroring rspamd's policy of never failing a composite over a
//! missing dependency.

use std::collections::HashSet;

use crate::aggregator::ResultSink;
use crate::error::CoreError;
use crate::symbol::registry::{SymbolCache, SymbolKind};
use crate::task::model::Task;

/// A parsed composite boolean expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompositeExpr {
    Symbol(String),
    Not(Box<CompositeExpr>),
    And(Box<CompositeExpr>, Box<CompositeExpr>),
    Or(Box<CompositeExpr>, Box<CompositeExpr>),
}

impl CompositeExpr {
    /// Evaluate against the set of symbol names activated so far in the
    /// task (across every metric). A name absent from `activated`
    /// evaluates its `Symbol` term as `false`.
    #[must_use]
    pub fn evaluate(&self, activated: &HashSet<&str>) -> bool {
        match self {
            Self::Symbol(name) => activated.contains(name.as_str()),
            Self::Not(inner) => !inner.evaluate(activated),
            Self::And(lhs, rhs) => lhs.evaluate(activated) && rhs.evaluate(activated),
            Self::Or(lhs, rhs) => lhs.evaluate(activated) || rhs.evaluate(activated),
        }
    }
}

/// Parse a composite expression.
///
/// Grammar (lowest to highest precedence): `or := and ('|' and)*`,
/// `and := unary ('&' unary)*`, `unary := '!' unary | atom`,
/// `atom := IDENT | '(' or ')'`. Identifiers are any run of
/// alphanumeric/`_`/`-` characters.
///
/// # Errors
/// Returns [`CoreError::InvalidCompositeExpression`] on malformed input
/// (unbalanced parens, empty atom, trailing tokens).
pub fn parse(symbol_name: &str, input: &str) -> Result<CompositeExpr, CoreError> {
    let tokens = tokenize(input);
    let mut parser = Parser { tokens: &tokens, pos: 0 };
    let expr = parser
        .parse_or()
        .map_err(|reason| CoreError::InvalidCompositeExpression(symbol_name.to_string(), reason))?;
    if parser.pos != parser.tokens.len() {
        return Err(CoreError::InvalidCompositeExpression(
            symbol_name.to_string(),
            format!("unexpected trailing input at token {}", parser.pos),
        ));
    }
    Ok(expr)
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    And,
    Or,
    Not,
    LParen,
    RParen,
    Ident(String),
}

fn tokenize(input: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            '&' => {
                tokens.push(Token::And);
                chars.next();
            }
            '|' => {
                tokens.push(Token::Or);
                chars.next();
            }
            '!' => {
                tokens.push(Token::Not);
                chars.next();
            }
            '(' => {
                tokens.push(Token::LParen);
                chars.next();
            }
            ')' => {
                tokens.push(Token::RParen);
                chars.next();
            }
            c if c.is_whitespace() => {
                chars.next();
            }
            _ => {
                let mut ident = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_alphanumeric() || c == '_' || c == '-' {
                        ident.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Ident(ident));
            }
        }
    }
    tokens
}

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn parse_or(&mut self) -> Result<CompositeExpr, String> {
        let mut lhs = self.parse_and()?;
        while matches!(self.peek(), Some(Token::Or)) {
            self.pos += 1;
            let rhs = self.parse_and()?;
            lhs = CompositeExpr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<CompositeExpr, String> {
        let mut lhs = self.parse_unary()?;
        while matches!(self.peek(), Some(Token::And)) {
            self.pos += 1;
            let rhs = self.parse_unary()?;
            lhs = CompositeExpr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<CompositeExpr, String> {
        if matches!(self.peek(), Some(Token::Not)) {
            self.pos += 1;
            let inner = self.parse_unary()?;
            return Ok(CompositeExpr::Not(Box::new(inner)));
        }
        self.parse_atom()
    }

    fn parse_atom(&mut self) -> Result<CompositeExpr, String> {
        match self.peek() {
            Some(Token::LParen) => {
                self.pos += 1;
                let inner = self.parse_or()?;
                match self.peek() {
                    Some(Token::RParen) => {
                        self.pos += 1;
                        Ok(inner)
                    }
                    _ => Err("unbalanced parentheses".to_string()),
                }
            }
            Some(Token::Ident(name)) => {
                let name = name.clone();
                self.pos += 1;
                Ok(CompositeExpr::Symbol(name))
            }
            other => Err(format!("expected symbol name or '(', found {other:?}")),
        }
    }
}

/// Dispatch every `Composite` symbol once, in registration (id) order,
/// evaluating its expression against every symbol name activated so far
/// in any metric. A matching composite inserts its own name as an
/// activation into every metric the task already has an accumulator for
/// (spec §4.4's composite stage: composites never run inside the
/// filters-stage scheduler loop).
///
/// Malformed expressions are logged and skipped rather than failing the
/// task — composite evaluation is a post-filters-stage, best-effort
/// pass (spec §4.3: "composites: non-fatal").
pub fn run(task: &mut Task, cache: &SymbolCache) {
    let activated: HashSet<&str> = task
        .results
        .values()
        .flat_map(|metric| metric.activations.keys().map(String::as_str))
        .collect();

    let metrics: Vec<String> = task.results.keys().cloned().collect();

    let mut composites: Vec<_> = cache
        .symbols
        .iter()
        .filter(|s| matches!(s.kind, SymbolKind::Composite))
        .collect();
    composites.sort_by_key(|s| s.id);

    for symbol in composites {
        let Some(expression) = &symbol.expression else {
            continue;
        };
        let expr = match parse(&symbol.name, expression) {
            Ok(expr) => expr,
            Err(err) => {
                tracing::warn!(composite = %symbol.name, error = %err, "skipping unparsable composite expression");
                continue;
            }
        };

        if expr.evaluate(&activated) {
            // One activation event per task, regardless of how many
            // metrics the composite's name is inserted into (spec §8:
            // frequency counts tasks-that-referenced-it, not calls).
            symbol.stats.record_activation(crate::scheduler::now_micros());
            for metric in &metrics {
                task.insert_result(metric, &symbol.name, 1.0, vec![]);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval(expr: &str, active: &[&str]) -> bool {
        let parsed = parse("TEST", expr).unwrap();
        let set: HashSet<&str> = active.iter().copied().collect();
        parsed.evaluate(&set)
    }

    #[test]
    fn single_symbol_true_when_activated() {
        assert!(eval("A", &["A"]));
        assert!(!eval("A", &[]));
    }

    #[test]
    fn and_requires_both() {
        assert!(eval("A & B", &["A", "B"]));
        assert!(!eval("A & B", &["A"]));
    }

    #[test]
    fn or_requires_either() {
        assert!(eval("A | B", &["A"]));
        assert!(eval("A | B", &["B"]));
        assert!(!eval("A | B", &[]));
    }

    #[test]
    fn not_negates() {
        assert!(eval("!A", &[]));
        assert!(!eval("!A", &["A"]));
    }

    #[test]
    fn parentheses_override_precedence() {
        // Without parens, `&` binds tighter than `|`: A | (B & C)
        assert!(eval("A | B & C", &["A"]));
        assert!(!eval("A | B & C", &["B"]));
        assert!(eval("A | B & C", &["B", "C"]));
        // With parens, grouping changes: (A | B) & C
        assert!(!eval("(A | B) & C", &["A"]));
        assert!(eval("(A | B) & C", &["A", "C"]));
    }

    #[test]
    fn missing_symbol_is_absent_not_error() {
        assert!(!eval("NEVER_REGISTERED", &["A"]));
    }

    #[test]
    fn unbalanced_parens_is_an_error() {
        assert!(parse("TEST", "(A & B").is_err());
    }

    #[test]
    fn empty_expression_is_an_error() {
        assert!(parse("TEST", "").is_err());
    }

    #[test]
    fn trailing_tokens_is_an_error() {
        assert!(parse("TEST", "A B").is_err());
    }

    #[test]
    fn matching_composite_bumps_its_own_frequency_once() {
        use crate::symbol::ordering;
        use crate::symbol::registry::SymbolRegistry;

        let mut reg = SymbolRegistry::new();
        reg.register("A", 0, 1.0, SymbolKind::Normal, false, None).unwrap();
        let composite = reg.register("COMP", 0, 1.0, SymbolKind::Composite, false, None).unwrap();
        reg.set_composite_expression(composite, "A").unwrap();
        let symbols = reg.post_load(true).unwrap();
        let order = ordering::build(&symbols);
        let names = symbols.iter().map(|s| (s.name.clone(), s.id)).collect();
        let cache = SymbolCache { symbols, names, order };

        let mut task = Task::new(vec![]);
        task.ensure_metric("default", crate::aggregator::MetricResult::new(Default::default(), None));
        task.ensure_metric("secondary", crate::aggregator::MetricResult::new(Default::default(), None));
        task.insert_result("default", "A", 1.0, vec![]);

        run(&mut task, &cache);

        assert!(task.results["default"].activations.contains_key("COMP"));
        assert!(task.results["secondary"].activations.contains_key("COMP"));
        assert_eq!(
            cache.symbols[composite].stats.frequency(),
            1,
            "one match across two metrics must count as a single activation"
        );
    }
}
