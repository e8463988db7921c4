//! Safe arithmetic expression evaluator.
//!
//! The translator hands back an expression string plus the value it claims
//! the expression has. The expression grammar is deliberately tiny:
//! numerals, parentheses, `+ - * / % **`, unary minus, and a fixed set of
//! one-argument functions. Any other identifier, attribute access,
//! subscript, or statement syntax is rejected before evaluation.

use serde::{Deserialize, Serialize};
use thiserror::Error;

const TOLERANCE: f64 = 1e-9;

const FUNCTIONS: &[&str] = &[
    "sqrt", "sin", "cos", "log", "exp", "abs", "floor", "ceil",
];

#[derive(Debug, Clone, PartialEq, Error)]
pub enum MathError {
    #[error("unexpected character {ch:?} at position {pos}")]
    UnexpectedChar { ch: char, pos: usize },
    #[error("identifier {name:?} is not a whitelisted function")]
    UnknownIdentifier { name: String },
    #[error("function {name} expects one argument")]
    BadCall { name: String },
    #[error("unexpected end of expression")]
    UnexpectedEnd,
    #[error("unbalanced parenthesis at position {pos}")]
    Unbalanced { pos: usize },
    #[error("expression does not evaluate to a finite number")]
    NotFinite,
    #[error("trailing input at position {pos}")]
    Trailing { pos: usize },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MathVerification {
    pub is_correct: bool,
    pub calculated_value: f64,
    pub claimed_value: f64,
    pub diff: f64,
}

/// Evaluate `expression` and compare against the claimed value.
pub fn verify_math(expression: &str, claimed: f64) -> Result<MathVerification, MathError> {
    let calculated = evaluate(expression)?;
    let diff = (calculated - claimed).abs();
    Ok(MathVerification {
        is_correct: diff <= TOLERANCE,
        calculated_value: calculated,
        claimed_value: claimed,
        diff,
    })
}

/// Evaluate the safe-subset expression deterministically.
pub fn evaluate(expression: &str) -> Result<f64, MathError> {
    let tokens = scan(expression)?;
    let mut parser = Parser { tokens, pos: 0 };
    let value = parser.expr(0)?;
    if parser.pos != parser.tokens.len() {
        return Err(MathError::Trailing {
            pos: parser.tokens[parser.pos].pos,
        });
    }
    if value.is_finite() {
        Ok(value)
    } else {
        Err(MathError::NotFinite)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Num(f64),
    Ident(String),
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    StarStar,
    LParen,
    RParen,
    Comma,
}

#[derive(Debug, Clone, PartialEq)]
struct Spanned {
    tok: Tok,
    pos: usize,
}

fn scan(input: &str) -> Result<Vec<Spanned>, MathError> {
    let mut out = Vec::new();
    let bytes: Vec<char> = input.chars().collect();
    let mut i = 0usize;
    while i < bytes.len() {
        let c = bytes[i];
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '+' => {
                out.push(Spanned { tok: Tok::Plus, pos: i });
                i += 1;
            }
            '-' => {
                out.push(Spanned { tok: Tok::Minus, pos: i });
                i += 1;
            }
            '*' => {
                if bytes.get(i + 1) == Some(&'*') {
                    out.push(Spanned { tok: Tok::StarStar, pos: i });
                    i += 2;
                } else {
                    out.push(Spanned { tok: Tok::Star, pos: i });
                    i += 1;
                }
            }
            '/' => {
                out.push(Spanned { tok: Tok::Slash, pos: i });
                i += 1;
            }
            '%' => {
                out.push(Spanned { tok: Tok::Percent, pos: i });
                i += 1;
            }
            '(' => {
                out.push(Spanned { tok: Tok::LParen, pos: i });
                i += 1;
            }
            ')' => {
                out.push(Spanned { tok: Tok::RParen, pos: i });
                i += 1;
            }
            ',' => {
                out.push(Spanned { tok: Tok::Comma, pos: i });
                i += 1;
            }
            '0'..='9' | '.' => {
                let start = i;
                while i < bytes.len()
                    && (bytes[i].is_ascii_digit()
                        || bytes[i] == '.'
                        || bytes[i] == 'e'
                        || bytes[i] == 'E'
                        || ((bytes[i] == '+' || bytes[i] == '-')
                            && matches!(bytes.get(i.wrapping_sub(1)), Some('e') | Some('E'))))
                {
                    i += 1;
                }
                let text: String = bytes[start..i].iter().collect();
                let value = text
                    .parse::<f64>()
                    .map_err(|_| MathError::UnexpectedChar { ch: c, pos: start })?;
                out.push(Spanned {
                    tok: Tok::Num(value),
                    pos: start,
                });
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == '_') {
                    i += 1;
                }
                let name: String = bytes[start..i].iter().collect();
                out.push(Spanned {
                    tok: Tok::Ident(name),
                    pos: start,
                });
            }
            other => return Err(MathError::UnexpectedChar { ch: other, pos: i }),
        }
    }
    Ok(out)
}

struct Parser {
    tokens: Vec<Spanned>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Tok> {
        self.tokens.get(self.pos).map(|s| &s.tok)
    }

    fn bump(&mut self) -> Result<Spanned, MathError> {
        let token = self
            .tokens
            .get(self.pos)
            .cloned()
            .ok_or(MathError::UnexpectedEnd)?;
        self.pos += 1;
        Ok(token)
    }

    /// Precedence climbing; `**` binds tightest and is right-associative.
    fn expr(&mut self, min_bp: u8) -> Result<f64, MathError> {
        let mut lhs = self.prefix()?;
        loop {
            let (bp, right_assoc, op) = match self.peek() {
                Some(Tok::Plus) => (1, false, Tok::Plus),
                Some(Tok::Minus) => (1, false, Tok::Minus),
                Some(Tok::Star) => (3, false, Tok::Star),
                Some(Tok::Slash) => (3, false, Tok::Slash),
                Some(Tok::Percent) => (3, false, Tok::Percent),
                Some(Tok::StarStar) => (5, true, Tok::StarStar),
                _ => break,
            };
            if bp < min_bp {
                break;
            }
            self.pos += 1;
            let next_bp = if right_assoc { bp } else { bp + 1 };
            let rhs = self.expr(next_bp)?;
            lhs = match op {
                Tok::Plus => lhs + rhs,
                Tok::Minus => lhs - rhs,
                Tok::Star => lhs * rhs,
                Tok::Slash => lhs / rhs,
                Tok::Percent => lhs.rem_euclid(rhs),
                Tok::StarStar => lhs.powf(rhs),
                _ => unreachable!(),
            };
        }
        Ok(lhs)
    }

    fn prefix(&mut self) -> Result<f64, MathError> {
        let token = self.bump()?;
        match token.tok {
            Tok::Num(value) => Ok(value),
            Tok::Minus => Ok(-self.expr(4)?),
            Tok::Plus => self.expr(4),
            Tok::LParen => {
                let value = self.expr(0)?;
                match self.bump()? {
                    Spanned {
                        tok: Tok::RParen, ..
                    } => Ok(value),
                    other => Err(MathError::Unbalanced { pos: other.pos }),
                }
            }
            Tok::Ident(name) => {
                if !FUNCTIONS.contains(&name.as_str()) {
                    return Err(MathError::UnknownIdentifier { name });
                }
                match self.bump()? {
                    Spanned {
                        tok: Tok::LParen, ..
                    } => {}
                    _ => return Err(MathError::BadCall { name }),
                }
                let arg = self.expr(0)?;
                match self.bump()? {
                    Spanned {
                        tok: Tok::RParen, ..
                    } => {}
                    _ => return Err(MathError::BadCall { name }),
                }
                Ok(apply(&name, arg))
            }
            Tok::RParen => Err(MathError::Unbalanced { pos: token.pos }),
            _ => Err(MathError::UnexpectedChar {
                ch: '?',
                pos: token.pos,
            }),
        }
    }
}

fn apply(name: &str, arg: f64) -> f64 {
    match name {
        "sqrt" => arg.sqrt(),
        "sin" => arg.sin(),
        "cos" => arg.cos(),
        "log" => arg.ln(),
        "exp" => arg.exp(),
        "abs" => arg.abs(),
        "floor" => arg.floor(),
        "ceil" => arg.ceil(),
        _ => unreachable!("whitelist checked"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evaluates_percent_of() {
        assert_eq!(evaluate("200 * 0.15").unwrap(), 30.0);
    }

    #[test]
    fn compound_interest() {
        let v = evaluate("1000 * (1 + 0.05) ** 2").unwrap();
        assert!((v - 1102.5).abs() < 1e-9);
    }

    #[test]
    fn correction_carries_diff() {
        let check = verify_math("1000 * (1 + 0.05) ** 2", 1100.0).unwrap();
        assert!(!check.is_correct);
        assert!((check.calculated_value - 1102.5).abs() < 1e-9);
        assert!((check.diff - 2.5).abs() < 1e-9);
    }

    #[test]
    fn exact_match_verifies() {
        let check = verify_math("2 + 2", 4.0).unwrap();
        assert!(check.is_correct);
    }

    #[test]
    fn whitelisted_functions() {
        assert!((evaluate("sqrt(16)").unwrap() - 4.0).abs() < 1e-12);
        assert!((evaluate("floor(2.9)").unwrap() - 2.0).abs() < 1e-12);
        assert!((evaluate("log(exp(1))").unwrap() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn foreign_identifiers_are_rejected() {
        assert!(matches!(
            evaluate("__import__('os')"),
            Err(MathError::UnknownIdentifier { .. }) | Err(MathError::UnexpectedChar { .. })
        ));
        assert!(matches!(
            evaluate("x + 1"),
            Err(MathError::UnknownIdentifier { .. })
        ));
        assert!(matches!(
            evaluate("open(1)"),
            Err(MathError::UnknownIdentifier { .. })
        ));
    }

    #[test]
    fn attribute_access_is_rejected() {
        assert!(evaluate("os.system").is_err());
        assert!(evaluate("a[0]").is_err());
    }

    #[test]
    fn unary_minus_and_precedence() {
        assert_eq!(evaluate("-3 + 5").unwrap(), 2.0);
        assert_eq!(evaluate("2 + 3 * 4").unwrap(), 14.0);
        assert_eq!(evaluate("2 ** 3 ** 2").unwrap(), 512.0);
        assert_eq!(evaluate("10 % 3").unwrap(), 1.0);
    }

    #[test]
    fn unbalanced_parens() {
        assert!(matches!(evaluate("(1 + 2"), Err(MathError::UnexpectedEnd)));
        assert!(evaluate("1 + 2)").is_err());
    }
}
