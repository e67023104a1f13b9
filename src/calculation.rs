//! Derived-score calculation rules.
//!
//! Rules are authored as `TARGET = expression` strings where the expression
//! is arithmetic over existing score ids. The engine is a single pass in
//! declared order with skip-if-missing-inputs: authors are responsible for
//! ordering rules so dependencies come first. There is no fixpoint iteration
//! and no reordering; a rule whose inputs never materialize is never applied.
//!
//! Expressions are evaluated by a small recursive-descent parser over
//! `+ - * /`, unary minus, parentheses, decimal literals, and identifiers
//! (`[A-Za-z_][A-Za-z0-9_.]*`, so dotted meta ids work). Nothing here ever
//! executes host-language code.

use std::collections::HashMap;

use thiserror::Error;
use tracing::{debug, warn};

/// One `target = expression` rule.
#[derive(Debug, Clone, PartialEq)]
pub struct CalculationRule {
    pub target: String,
    pub expression: String,
}

#[derive(Debug, Error, PartialEq)]
pub enum CalcError {
    #[error("rule has no '=': {0}")]
    MissingEquals(String),

    #[error("rule has an empty target: {0}")]
    EmptyTarget(String),

    #[error("invalid character '{ch}' at offset {offset}")]
    InvalidChar { ch: char, offset: usize },

    #[error("malformed number: {0}")]
    MalformedNumber(String),

    #[error("unexpected end of expression")]
    UnexpectedEnd,

    #[error("unexpected token: {0}")]
    UnexpectedToken(String),

    #[error("unknown variable: {0}")]
    UnknownVariable(String),
}

impl CalculationRule {
    /// Parse a single `TARGET = expression` line.
    pub fn parse(raw: &str) -> Result<Self, CalcError> {
        let (target, expression) = raw
            .split_once('=')
            .ok_or_else(|| CalcError::MissingEquals(raw.to_string()))?;
        let target = target.trim();
        let expression = expression.trim();
        if target.is_empty() || !is_identifier(target) {
            return Err(CalcError::EmptyTarget(raw.to_string()));
        }
        Ok(Self {
            target: target.to_string(),
            expression: expression.to_string(),
        })
    }

    /// Ids referenced by the expression, in first-appearance order.
    pub fn referenced_ids(&self) -> Result<Vec<String>, CalcError> {
        let tokens = tokenize(&self.expression)?;
        let mut ids = Vec::new();
        for token in tokens {
            if let Token::Ident(id) = token {
                if !ids.contains(&id) {
                    ids.push(id);
                }
            }
        }
        Ok(ids)
    }
}

/// Parse every rule line, skipping (and logging) malformed ones.
pub fn parse_rules(lines: &[String]) -> Vec<CalculationRule> {
    lines
        .iter()
        .filter(|l| !l.trim().is_empty())
        .filter_map(|line| match CalculationRule::parse(line) {
            Ok(rule) => Some(rule),
            Err(err) => {
                warn!(rule = line.as_str(), error = %err, "Skipping malformed calculation rule");
                None
            }
        })
        .collect()
}

/// Apply rules to a copy of `base`, in declared order.
///
/// A rule is skipped for this pass when any referenced id is absent from the
/// running mapping; that is not an error. Only finite results are committed.
pub fn apply(base: &HashMap<String, f64>, rules: &[CalculationRule]) -> HashMap<String, f64> {
    let mut scores = base.clone();

    for rule in rules {
        let ids = match rule.referenced_ids() {
            Ok(ids) => ids,
            Err(err) => {
                warn!(target = rule.target.as_str(), error = %err, "Skipping unparseable rule");
                continue;
            }
        };
        if let Some(missing) = ids.iter().find(|id| !scores.contains_key(*id)) {
            debug!(
                target = rule.target.as_str(),
                missing = missing.as_str(),
                "Rule inputs not yet available; skipping"
            );
            continue;
        }

        match evaluate(&rule.expression, &scores) {
            Ok(value) if value.is_finite() => {
                scores.insert(rule.target.clone(), value);
            }
            Ok(value) => {
                warn!(
                    target = rule.target.as_str(),
                    value, "Rule produced a non-finite result; skipping"
                );
            }
            Err(err) => {
                warn!(target = rule.target.as_str(), error = %err, "Rule evaluation failed; skipping");
            }
        }
    }

    scores
}

// =============================================================================
// Expression evaluation
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Ident(String),
    Plus,
    Minus,
    Star,
    Slash,
    LParen,
    RParen,
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
}

fn tokenize(expr: &str) -> Result<Vec<Token>, CalcError> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = expr.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' => i += 1,
            '+' => {
                tokens.push(Token::Plus);
                i += 1;
            }
            '-' => {
                tokens.push(Token::Minus);
                i += 1;
            }
            '*' => {
                tokens.push(Token::Star);
                i += 1;
            }
            '/' => {
                tokens.push(Token::Slash);
                i += 1;
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            c if c.is_ascii_digit() => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let value = text
                    .parse::<f64>()
                    .map_err(|_| CalcError::MalformedNumber(text.clone()))?;
                tokens.push(Token::Number(value));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_ascii_alphanumeric() || chars[i] == '_' || chars[i] == '.')
                {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            other => {
                return Err(CalcError::InvalidChar {
                    ch: other,
                    offset: i,
                })
            }
        }
    }

    Ok(tokens)
}

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
    vars: &'a HashMap<String, f64>,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&'a Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<&'a Token> {
        let t = self.tokens.get(self.pos);
        self.pos += 1;
        t
    }

    // expr := term (('+' | '-') term)*
    fn expr(&mut self) -> Result<f64, CalcError> {
        let mut value = self.term()?;
        while let Some(op) = self.peek() {
            match op {
                Token::Plus => {
                    self.pos += 1;
                    value += self.term()?;
                }
                Token::Minus => {
                    self.pos += 1;
                    value -= self.term()?;
                }
                _ => break,
            }
        }
        Ok(value)
    }

    // term := factor (('*' | '/') factor)*
    fn term(&mut self) -> Result<f64, CalcError> {
        let mut value = self.factor()?;
        while let Some(op) = self.peek() {
            match op {
                Token::Star => {
                    self.pos += 1;
                    value *= self.factor()?;
                }
                Token::Slash => {
                    self.pos += 1;
                    value /= self.factor()?;
                }
                _ => break,
            }
        }
        Ok(value)
    }

    // factor := '-' factor | number | ident | '(' expr ')'
    fn factor(&mut self) -> Result<f64, CalcError> {
        match self.next() {
            Some(Token::Minus) => Ok(-self.factor()?),
            Some(Token::Number(n)) => Ok(*n),
            Some(Token::Ident(id)) => self
                .vars
                .get(id)
                .copied()
                .ok_or_else(|| CalcError::UnknownVariable(id.clone())),
            Some(Token::LParen) => {
                let value = self.expr()?;
                match self.next() {
                    Some(Token::RParen) => Ok(value),
                    Some(t) => Err(CalcError::UnexpectedToken(format!("{t:?}"))),
                    None => Err(CalcError::UnexpectedEnd),
                }
            }
            Some(t) => Err(CalcError::UnexpectedToken(format!("{t:?}"))),
            None => Err(CalcError::UnexpectedEnd),
        }
    }
}

/// Evaluate an expression against the given score mapping.
pub fn evaluate(expr: &str, vars: &HashMap<String, f64>) -> Result<f64, CalcError> {
    let tokens = tokenize(expr)?;
    let mut parser = Parser {
        tokens: &tokens,
        pos: 0,
        vars,
    };
    let value = parser.expr()?;
    if parser.pos != tokens.len() {
        return Err(CalcError::UnexpectedToken(format!(
            "{:?}",
            tokens[parser.pos]
        )));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scores(pairs: &[(&str, f64)]) -> HashMap<String, f64> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn parses_target_and_expression() {
        let rule = CalculationRule::parse("TOTAL = A + B").unwrap();
        assert_eq!(rule.target, "TOTAL");
        assert_eq!(rule.expression, "A + B");
        assert_eq!(rule.referenced_ids().unwrap(), vec!["A", "B"]);
    }

    #[test]
    fn rejects_malformed_rules() {
        assert!(matches!(
            CalculationRule::parse("no equals here"),
            Err(CalcError::MissingEquals(_))
        ));
        assert!(matches!(
            CalculationRule::parse(" = A + B"),
            Err(CalcError::EmptyTarget(_))
        ));
        assert!(matches!(
            CalculationRule::parse("123 = A"),
            Err(CalcError::EmptyTarget(_))
        ));
    }

    #[test]
    fn evaluates_arithmetic_with_precedence() {
        let vars = scores(&[("A", 10.0), ("B", 4.0), ("MET.X", 2.0)]);
        assert_eq!(evaluate("A + B * 2", &vars).unwrap(), 18.0);
        assert_eq!(evaluate("(A + B) * 2", &vars).unwrap(), 28.0);
        assert_eq!(evaluate("-A + B", &vars).unwrap(), -6.0);
        assert_eq!(evaluate("A / MET.X", &vars).unwrap(), 5.0);
        assert_eq!(evaluate("A - B - MET.X", &vars).unwrap(), 4.0);
    }

    #[test]
    fn rule_applies_when_inputs_present() {
        let base = scores(&[("A", 40.0), ("B", 60.0)]);
        let rules = vec![CalculationRule::parse("TOTAL = A + B").unwrap()];
        let out = apply(&base, &rules);
        assert_eq!(out.get("TOTAL"), Some(&100.0));
        assert_eq!(out.get("A"), Some(&40.0));
        assert_eq!(out.get("B"), Some(&60.0));
    }

    #[test]
    fn rule_with_missing_input_is_skipped() {
        let base = scores(&[("A", 40.0)]);
        let rules = vec![CalculationRule::parse("TOTAL = A + B").unwrap()];
        let out = apply(&base, &rules);
        assert!(!out.contains_key("TOTAL"));
    }

    #[test]
    fn apply_is_idempotent() {
        let base = scores(&[("A", 40.0), ("B", 60.0)]);
        let rules = vec![
            CalculationRule::parse("TOTAL = A + B").unwrap(),
            CalculationRule::parse("AVG = TOTAL / 2").unwrap(),
        ];
        let once = apply(&base, &rules);
        let twice = apply(&once, &rules);
        assert_eq!(once, twice);
    }

    #[test]
    fn later_rule_sees_earlier_target_but_not_vice_versa() {
        let base = scores(&[("A", 40.0), ("B", 60.0)]);
        // AVG references TOTAL before TOTAL is declared: single pass, no
        // reordering, so AVG never resolves.
        let out_of_order = vec![
            CalculationRule::parse("AVG = TOTAL / 2").unwrap(),
            CalculationRule::parse("TOTAL = A + B").unwrap(),
        ];
        let out = apply(&base, &out_of_order);
        assert_eq!(out.get("TOTAL"), Some(&100.0));
        assert!(!out.contains_key("AVG"));
    }

    #[test]
    fn non_finite_result_is_not_committed() {
        let base = scores(&[("A", 40.0), ("ZERO", 0.0)]);
        let rules = vec![CalculationRule::parse("RATIO = A / ZERO").unwrap()];
        let out = apply(&base, &rules);
        assert!(!out.contains_key("RATIO"));
    }

    #[test]
    fn malformed_expression_skips_only_that_rule() {
        let base = scores(&[("A", 40.0), ("B", 60.0)]);
        let rules = vec![
            CalculationRule {
                target: "BAD".into(),
                expression: "A + ".into(),
            },
            CalculationRule::parse("TOTAL = A + B").unwrap(),
        ];
        let out = apply(&base, &rules);
        assert!(!out.contains_key("BAD"));
        assert_eq!(out.get("TOTAL"), Some(&100.0));
    }

    #[test]
    fn parse_rules_drops_malformed_lines() {
        let lines = vec![
            "TOTAL = A + B".to_string(),
            "not a rule".to_string(),
            "".to_string(),
        ];
        let rules = parse_rules(&lines);
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].target, "TOTAL");
    }
}
