//! S-expression AST and the recursive-descent parser over the token stream.

use crate::error::DslError;
use crate::lexer::{tokenize, Token, TokenKind};

#[derive(Debug, Clone, PartialEq)]
pub struct Expr {
    pub kind: ExprKind,
    pub offset: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExprKind {
    Int(i64),
    Real(f64),
    Bool(bool),
    Str(String),
    Ident(String),
    List(Vec<Expr>),
}

impl Expr {
    pub fn as_ident(&self) -> Option<&str> {
        match &self.kind {
            ExprKind::Ident(name) => Some(name),
            _ => None,
        }
    }
}

/// Parse a single top-level expression. Trailing tokens are an error: the
/// translator must emit exactly one form (use `PROGRAM` to sequence).
pub fn parse(input: &str) -> Result<Expr, DslError> {
    let tokens = tokenize(input)?;
    let mut pos = 0usize;
    if tokens.is_empty() {
        return Err(DslError::EmptyForm { offset: 0 });
    }
    let expr = parse_expr(&tokens, &mut pos)?;
    if pos != tokens.len() {
        return Err(DslError::TrailingInput {
            offset: tokens[pos].offset,
        });
    }
    Ok(expr)
}

fn parse_expr(tokens: &[Token], pos: &mut usize) -> Result<Expr, DslError> {
    let token = tokens.get(*pos).ok_or_else(|| DslError::Unbalanced {
        offset: tokens.last().map(|t| t.offset).unwrap_or(0),
    })?;
    *pos += 1;

    let kind = match &token.kind {
        TokenKind::LParen => {
            let mut items = Vec::new();
            loop {
                match tokens.get(*pos) {
                    Some(next) if next.kind == TokenKind::RParen => {
                        *pos += 1;
                        break;
                    }
                    Some(_) => items.push(parse_expr(tokens, pos)?),
                    None => {
                        return Err(DslError::Unbalanced {
                            offset: token.offset,
                        })
                    }
                }
            }
            if items.is_empty() {
                return Err(DslError::EmptyForm {
                    offset: token.offset,
                });
            }
            ExprKind::List(items)
        }
        TokenKind::RParen => {
            return Err(DslError::Unbalanced {
                offset: token.offset,
            })
        }
        TokenKind::Int(value) => ExprKind::Int(*value),
        TokenKind::Real(value) => ExprKind::Real(*value),
        TokenKind::Bool(value) => ExprKind::Bool(*value),
        TokenKind::Ident(name) => ExprKind::Ident(name.clone()),
        TokenKind::Str(value) => ExprKind::Str(value.clone()),
    };

    Ok(Expr {
        kind,
        offset: token.offset,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_nested_lists() {
        let expr = parse("(AND (GT x 5) (LT x 10))").unwrap();
        let ExprKind::List(items) = &expr.kind else {
            panic!("expected list");
        };
        assert_eq!(items.len(), 3);
        assert_eq!(items[0].as_ident(), Some("AND"));
    }

    #[test]
    fn missing_close_paren() {
        let err = parse("(AND (GT x 5)").unwrap_err();
        assert!(matches!(err, DslError::Unbalanced { .. }));
    }

    #[test]
    fn extra_close_paren() {
        let err = parse("(EQ x 1))").unwrap_err();
        assert!(matches!(err, DslError::TrailingInput { .. }));
    }

    #[test]
    fn empty_form_rejected() {
        let err = parse("()").unwrap_err();
        assert!(matches!(err, DslError::EmptyForm { .. }));
    }

    #[test]
    fn bare_atom_parses() {
        let expr = parse("42").unwrap();
        assert_eq!(expr.kind, ExprKind::Int(42));
    }
}
