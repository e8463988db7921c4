//! Operator whitelist enforcement.
//!
//! Validation happens before typing or compilation: any form whose head is
//! not on the whitelist is rejected outright, as is any head that is not a
//! plain identifier. This is the single place where hostile DSL programs
//! (`(IMPORT os)`, `(__getattr__ ...)`, ...) are stopped.

use crate::ast::{Expr, ExprKind};
use crate::error::DslError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    And,
    Or,
    Not,
    Implies,
    Iff,
    Plus,
    Minus,
    Mul,
    Div,
    Mod,
    Pow,
    Neg,
    Eq,
    Neq,
    Lt,
    Le,
    Gt,
    Ge,
    Ite,
    Forall,
    Exists,
    Assert,
    Program,
}

impl Op {
    pub fn lookup(name: &str) -> Option<Op> {
        match name {
            "AND" => Some(Op::And),
            "OR" => Some(Op::Or),
            "NOT" => Some(Op::Not),
            "IMPLIES" => Some(Op::Implies),
            "IFF" => Some(Op::Iff),
            "PLUS" => Some(Op::Plus),
            "MINUS" => Some(Op::Minus),
            "MUL" => Some(Op::Mul),
            "DIV" => Some(Op::Div),
            "MOD" => Some(Op::Mod),
            "POW" => Some(Op::Pow),
            "NEG" => Some(Op::Neg),
            "EQ" => Some(Op::Eq),
            "NEQ" => Some(Op::Neq),
            "LT" => Some(Op::Lt),
            "LE" => Some(Op::Le),
            "GT" => Some(Op::Gt),
            "GE" => Some(Op::Ge),
            "ITE" => Some(Op::Ite),
            "FORALL" => Some(Op::Forall),
            "EXISTS" => Some(Op::Exists),
            "ASSERT" => Some(Op::Assert),
            "PROGRAM" => Some(Op::Program),
            _ => None,
        }
    }

    /// (min, max) argument count; `None` max means variadic.
    fn arity(self) -> (usize, Option<usize>) {
        match self {
            Op::And | Op::Or => (2, None),
            Op::Not | Op::Neg | Op::Assert => (1, Some(1)),
            Op::Implies | Op::Iff => (2, Some(2)),
            Op::Plus | Op::Mul => (2, None),
            Op::Minus | Op::Div | Op::Mod | Op::Pow => (2, Some(2)),
            Op::Eq | Op::Neq | Op::Lt | Op::Le | Op::Gt | Op::Ge => (2, Some(2)),
            Op::Ite => (3, Some(3)),
            Op::Forall | Op::Exists => (2, Some(2)),
            Op::Program => (1, None),
        }
    }

    fn arity_label(self) -> String {
        match self.arity() {
            (min, Some(max)) if min == max => format!("{min}"),
            (min, Some(max)) => format!("{min}..{max}"),
            (min, None) => format!("{min}+"),
        }
    }
}

/// Walk the AST and reject anything outside the whitelist.
pub fn validate(expr: &Expr) -> Result<(), DslError> {
    match &expr.kind {
        ExprKind::Int(_) | ExprKind::Real(_) | ExprKind::Bool(_) | ExprKind::Str(_) => Ok(()),
        ExprKind::Ident(name) => {
            // Bare operator names outside head position read as variables;
            // forbid those, and dunder names that smell like host internals.
            if Op::lookup(name).is_some() || name.starts_with("__") {
                return Err(DslError::UnsafeOperator {
                    op: name.clone(),
                    offset: expr.offset,
                });
            }
            Ok(())
        }
        ExprKind::List(items) => {
            let head = &items[0];
            let Some(name) = head.as_ident() else {
                return Err(DslError::BadFormHead {
                    offset: head.offset,
                });
            };
            let Some(op) = Op::lookup(name) else {
                return Err(DslError::UnsafeOperator {
                    op: name.to_string(),
                    offset: head.offset,
                });
            };

            let args = &items[1..];
            let (min, max) = op.arity();
            let ok = args.len() >= min && max.map_or(true, |m| args.len() <= m);
            if !ok {
                return Err(DslError::Arity {
                    op: name.to_string(),
                    expected: op.arity_label(),
                    got: args.len(),
                    offset: head.offset,
                });
            }

            if matches!(op, Op::Forall | Op::Exists) {
                validate_binder_list(&args[0])?;
                return validate(&args[1]);
            }

            for arg in args {
                validate(arg)?;
            }
            Ok(())
        }
    }
}

fn validate_binder_list(expr: &Expr) -> Result<(), DslError> {
    let ExprKind::List(vars) = &expr.kind else {
        return Err(DslError::BadBinderList {
            offset: expr.offset,
        });
    };
    for var in vars {
        match &var.kind {
            ExprKind::Ident(name) if Op::lookup(name).is_none() => {}
            _ => {
                return Err(DslError::BadBinderList {
                    offset: var.offset,
                })
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::parse;

    #[test]
    fn whitelisted_program_passes() {
        let expr = parse("(PROGRAM (ASSERT (AND (GT x 5) (LT x 10))))").unwrap();
        validate(&expr).unwrap();
    }

    #[test]
    fn import_form_is_unsafe() {
        let expr = parse("(IMPORT os)").unwrap();
        let err = validate(&expr).unwrap_err();
        assert_eq!(err.wire_code(), "UNSAFE_DSL");
    }

    #[test]
    fn non_ident_head_is_unsafe() {
        let expr = parse("((GT x 5) 1)").unwrap();
        let err = validate(&expr).unwrap_err();
        assert!(matches!(err, DslError::BadFormHead { .. }));
    }

    #[test]
    fn arity_is_enforced() {
        let expr = parse("(NOT a b)").unwrap();
        let err = validate(&expr).unwrap_err();
        assert!(matches!(err, DslError::Arity { .. }));
    }

    #[test]
    fn quantifier_binders_must_be_plain_idents() {
        let expr = parse("(FORALL (x (y)) (GT x 0))").unwrap();
        assert!(matches!(
            validate(&expr).unwrap_err(),
            DslError::BadBinderList { .. }
        ));

        let ok = parse("(FORALL (x) (GE x x))").unwrap();
        validate(&ok).unwrap();
    }

    #[test]
    fn unsafe_dsl_table() {
        // Every one of these must die in validation, never in the solver.
        let hostile = [
            "(IMPORT os)",
            "(EXEC \"rm -rf /\")",
            "(GETATTR obj name)",
            "(LAMBDA (x) x)",
            "(SUBSCRIPT xs 0)",
        ];
        for src in hostile {
            let expr = parse(src).unwrap();
            assert_eq!(
                validate(&expr).unwrap_err().wire_code(),
                "UNSAFE_DSL",
                "{src} must be UNSAFE_DSL"
            );
        }
    }
}
