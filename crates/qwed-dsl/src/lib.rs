//! QWED-DSL: a whitelist S-expression constraint language.
//!
//! Untrusted translators emit programs in this language; the pipeline here
//! is parse → validate (operator whitelist) → type inference → compile to a
//! [`SolverProgram`] → solve through the [`Solve`] binding. Every stage is
//! total: hostile input produces a structured [`DslError`] with a byte
//! offset, never a panic, and compilation touches neither the network, the
//! filesystem, nor any host evaluator.

mod ast;
mod compile;
mod error;
mod lexer;
mod solver;
mod validate;

pub use ast::{parse, Expr, ExprKind};
pub use compile::{compile, CmpOp, Constraint, SolverProgram, Term, Ty};
pub use error::DslError;
pub use solver::{BoundedSolver, ModelValue, Satisfiability, Solve};
pub use validate::{validate, Op};

use std::collections::BTreeMap;
use std::time::Duration;

/// One-call front end: parse, validate and compile a DSL source string.
pub fn parse_and_compile(
    source: &str,
    declared: &BTreeMap<String, Ty>,
) -> Result<SolverProgram, DslError> {
    let expr = parse(source)?;
    compile(&expr, declared)
}

/// Full pipeline with the default bounded solver.
pub fn check(
    source: &str,
    declared: &BTreeMap<String, Ty>,
    budget: Duration,
) -> Result<Satisfiability, DslError> {
    let program = parse_and_compile(source, declared)?;
    Ok(BoundedSolver::new().solve(&program, budget))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn end_to_end_sat() {
        let result = check("(AND (GT x 5) (LT x 10))", &BTreeMap::new(), Duration::from_secs(5))
            .unwrap();
        assert!(matches!(result, Satisfiability::Sat { .. }));
    }

    #[test]
    fn hostile_programs_never_reach_the_solver() {
        for src in ["(IMPORT os)", "(EQ __class__ 1)", "(EVAL \"x\")", "(EQ x 1"] {
            assert!(check(src, &BTreeMap::new(), Duration::from_secs(1)).is_err());
        }
    }
}
