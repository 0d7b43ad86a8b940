//! `term := identifier | identifier "=" value`
//! `expression := terms combined by & (intersection), | (union), \ (difference)`
//!
//! Precedence, tightest to loosest: `&`, `\`, `|`; all left-associative.
//! Parentheses override precedence. An unknown identifier evaluates to the
//! empty set rather than an error (§4.2); only a malformed expression raises
//! `ExpressionError::Invalid`.

use grid_models::Rse;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ExpressionError {
    #[error("invalid RSE expression: {0}")]
    Invalid(String),
}

/// Evaluate `expr` against `universe`, returning an ordered (by RSE name,
/// ascending), duplicate-free result so that downstream selection is
/// reproducible.
pub fn parse_expression(expr: &str, universe: &[Rse]) -> Result<Vec<Rse>, ExpressionError> {
    let tokens = tokenize(expr)?;
    let mut parser = Parser {
        tokens: &tokens,
        pos: 0,
        universe,
    };
    let result = parser.parse_union()?;
    if parser.pos != parser.tokens.len() {
        return Err(ExpressionError::Invalid(format!(
            "unexpected trailing input in {expr:?}"
        )));
    }
    let mut result: Vec<Rse> = result.into_iter().collect();
    result.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(result)
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Ident(String),
    Eq,
    And,
    Or,
    Diff,
    LParen,
    RParen,
}

fn tokenize(expr: &str) -> Result<Vec<Token>, ExpressionError> {
    let mut tokens = Vec::new();
    let mut chars = expr.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '&' => {
                chars.next();
                tokens.push(Token::And);
            }
            '|' => {
                chars.next();
                tokens.push(Token::Or);
            }
            '\\' => {
                chars.next();
                tokens.push(Token::Diff);
            }
            '=' => {
                chars.next();
                tokens.push(Token::Eq);
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            c if c.is_alphanumeric() || c == '_' || c == '.' || c == '-' || c == '*' => {
                let mut ident = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_alphanumeric() || c == '_' || c == '.' || c == '-' || c == '*' {
                        ident.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Ident(ident));
            }
            other => {
                return Err(ExpressionError::Invalid(format!(
                    "unexpected character {other:?} in expression"
                )));
            }
        }
    }
    Ok(tokens)
}

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
    universe: &'a [Rse],
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn bump(&mut self) -> Option<&Token> {
        let t = self.tokens.get(self.pos);
        self.pos += 1;
        t
    }

    // expr := diff ( '|' diff )*
    fn parse_union(&mut self) -> Result<Vec<Rse>, ExpressionError> {
        let mut acc = self.parse_diff()?;
        while matches!(self.peek(), Some(Token::Or)) {
            self.bump();
            let rhs = self.parse_diff()?;
            acc = union(acc, rhs);
        }
        Ok(acc)
    }

    // diff := band ( '\' band )*
    fn parse_diff(&mut self) -> Result<Vec<Rse>, ExpressionError> {
        let mut acc = self.parse_and()?;
        while matches!(self.peek(), Some(Token::Diff)) {
            self.bump();
            let rhs = self.parse_and()?;
            acc = difference(acc, rhs);
        }
        Ok(acc)
    }

    // band := atom ( '&' atom )*
    fn parse_and(&mut self) -> Result<Vec<Rse>, ExpressionError> {
        let mut acc = self.parse_atom()?;
        while matches!(self.peek(), Some(Token::And)) {
            self.bump();
            let rhs = self.parse_atom()?;
            acc = intersection(acc, rhs);
        }
        Ok(acc)
    }

    // atom := term | '(' expr ')'
    fn parse_atom(&mut self) -> Result<Vec<Rse>, ExpressionError> {
        match self.bump() {
            Some(Token::LParen) => {
                let inner = self.parse_union()?;
                match self.bump() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(ExpressionError::Invalid("unbalanced parentheses".into())),
                }
            }
            Some(Token::Ident(ident)) => {
                let ident = ident.clone();
                if matches!(self.peek(), Some(Token::Eq)) {
                    self.bump();
                    match self.bump() {
                        Some(Token::Ident(value)) => Ok(eval_term(self.universe, &ident, Some(value))),
                        _ => Err(ExpressionError::Invalid(format!(
                            "expected a value after '{ident}='"
                        ))),
                    }
                } else {
                    Ok(eval_term(self.universe, &ident, None))
                }
            }
            other => Err(ExpressionError::Invalid(format!(
                "expected a term, found {other:?}"
            ))),
        }
    }
}

fn eval_term(universe: &[Rse], identifier: &str, value: Option<&str>) -> Vec<Rse> {
    match value {
        None => universe
            .iter()
            .filter(|rse| {
                matches!(
                    rse.attribute(identifier),
                    Some(grid_models::AttributeValue::Bool(true))
                )
            })
            .cloned()
            .collect(),
        Some(value) if identifier == "rse" => universe
            .iter()
            .filter(|rse| rse.name == value)
            .cloned()
            .collect(),
        Some(value) => universe
            .iter()
            .filter(|rse| {
                rse.attribute(identifier)
                    .is_some_and(|a| a.to_string() == value)
            })
            .cloned()
            .collect(),
    }
}

fn union(mut a: Vec<Rse>, b: Vec<Rse>) -> Vec<Rse> {
    for rse in b {
        if !a.iter().any(|r| r.id == rse.id) {
            a.push(rse);
        }
    }
    a
}

fn intersection(a: Vec<Rse>, b: Vec<Rse>) -> Vec<Rse> {
    a.into_iter().filter(|r| b.iter().any(|o| o.id == r.id)).collect()
}

fn difference(a: Vec<Rse>, b: Vec<Rse>) -> Vec<Rse> {
    a.into_iter().filter(|r| !b.iter().any(|o| o.id == r.id)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use grid_models::{AttributeValue, Protocol, RseLimits};
    use std::collections::HashMap;

    fn rse(name: &str, tier: Option<&str>, analysis: bool) -> Rse {
        let mut attributes = HashMap::new();
        if let Some(tier) = tier {
            attributes.insert("tier".to_string(), AttributeValue::String(tier.to_string()));
        }
        attributes.insert("analysis".to_string(), AttributeValue::Bool(analysis));
        Rse {
            id: uuid::Uuid::new_v4(),
            name: name.to_string(),
            attributes,
            protocols: vec![Protocol {
                scheme: "gsiftp".into(),
                r#impl: "gfal.Default".into(),
                hostname: format!("{name}.example.org"),
                port: 0,
                prefix: "/data".into(),
                extended_attributes: Default::default(),
            }],
            limits: RseLimits::default(),
            usage: Default::default(),
            availability_delete: true,
            availability_write: true,
            blacklisted: false,
            weight: None,
        }
    }

    fn universe() -> Vec<Rse> {
        vec![
            rse("RSE_A", Some("1"), true),
            rse("RSE_B", Some("1"), false),
            rse("RSE_C", Some("2"), true),
        ]
    }

    #[test]
    fn tier_equality_matches_exact_value() {
        let result = parse_expression("tier=1", &universe()).unwrap();
        let names: Vec<_> = result.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["RSE_A", "RSE_B"]);
    }

    #[test]
    fn unknown_identifier_is_empty_not_an_error() {
        let result = parse_expression("nonexistent", &universe()).unwrap();
        assert!(result.is_empty());
    }

    #[test]
    fn and_binds_tighter_than_diff_binds_tighter_than_or() {
        // tier=1 & analysis \ tier=2 | rse=RSE_C
        // == ((tier=1 & analysis) \ tier=2) | rse=RSE_C
        // (tier=1 & analysis) -> {RSE_A}; \ tier=2 -> {RSE_A} (tier=2 is {RSE_C})
        // | rse=RSE_C -> {RSE_A, RSE_C}
        let result = parse_expression("tier=1&analysis\\tier=2|rse=RSE_C", &universe()).unwrap();
        let names: Vec<_> = result.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["RSE_A", "RSE_C"]);
    }

    #[test]
    fn parentheses_override_precedence() {
        // (tier=1 | tier=2) & analysis == {RSE_A, RSE_C}
        let result = parse_expression("(tier=1|tier=2)&analysis", &universe()).unwrap();
        let names: Vec<_> = result.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["RSE_A", "RSE_C"]);
    }

    #[test]
    fn unbalanced_parens_is_invalid() {
        assert!(matches!(
            parse_expression("(tier=1", &universe()),
            Err(ExpressionError::Invalid(_))
        ));
    }

    #[test]
    fn trailing_operator_is_invalid() {
        assert!(matches!(
            parse_expression("tier=1&", &universe()),
            Err(ExpressionError::Invalid(_))
        ));
    }

    #[test]
    fn result_is_ordered_by_name_regardless_of_clause_order() {
        let a = parse_expression("tier=1|tier=2", &universe()).unwrap();
        let b = parse_expression("tier=2|tier=1", &universe()).unwrap();
        let names_a: Vec<_> = a.iter().map(|r| r.name.clone()).collect();
        let names_b: Vec<_> = b.iter().map(|r| r.name.clone()).collect();
        assert_eq!(names_a, names_b);
        assert_eq!(names_a, vec!["RSE_A", "RSE_B", "RSE_C"]);
    }
}
