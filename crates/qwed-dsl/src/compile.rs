//! Compiler from the validated AST to a solver program.
//!
//! The compiler is a pure function: no I/O, no evaluation of untrusted
//! strings, no host constructs. Identifiers are carried through unchanged so
//! solver models stay readable. Types are inferred at first use: arithmetic
//! and relational operators force a numeric sort, boolean connectives force
//! Bool. Conflicting uses are rejected.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::ast::{Expr, ExprKind};
use crate::error::DslError;
use crate::validate::{validate, Op};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Ty {
    Int,
    Real,
    Bool,
}

impl Ty {
    pub fn label(self) -> &'static str {
        match self {
            Ty::Int => "Int",
            Ty::Real => "Real",
            Ty::Bool => "Bool",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Term {
    IntConst(i64),
    RealConst(f64),
    Var(String),
    Add(Box<Term>, Box<Term>),
    Sub(Box<Term>, Box<Term>),
    Mul(Box<Term>, Box<Term>),
    Div(Box<Term>, Box<Term>),
    Mod(Box<Term>, Box<Term>),
    Pow(Box<Term>, Box<Term>),
    Neg(Box<Term>),
    Ite(Box<Constraint>, Box<Term>, Box<Term>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Neq,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Constraint {
    Const(bool),
    BoolVar(String),
    Not(Box<Constraint>),
    And(Vec<Constraint>),
    Or(Vec<Constraint>),
    Implies(Box<Constraint>, Box<Constraint>),
    Iff(Box<Constraint>, Box<Constraint>),
    Cmp(CmpOp, Term, Term),
    Quant {
        universal: bool,
        bound: Vec<String>,
        body: Box<Constraint>,
    },
}

/// Opaque program handed to a `Solve` binding.
#[derive(Debug, Clone, PartialEq)]
pub struct SolverProgram {
    pub constraints: Vec<Constraint>,
    pub vars: BTreeMap<String, Ty>,
}

/// Validate and compile one DSL expression, honoring caller-declared
/// variable sorts (which win over inference).
pub fn compile(expr: &Expr, declared: &BTreeMap<String, Ty>) -> Result<SolverProgram, DslError> {
    validate(expr)?;
    let mut compiler = Compiler {
        vars: declared.clone(),
        declared: declared.clone(),
    };
    let mut constraints = Vec::new();
    compiler.compile_top(expr, &mut constraints)?;
    Ok(SolverProgram {
        constraints,
        vars: compiler.vars,
    })
}

struct Compiler {
    vars: BTreeMap<String, Ty>,
    declared: BTreeMap<String, Ty>,
}

impl Compiler {
    fn compile_top(&mut self, expr: &Expr, out: &mut Vec<Constraint>) -> Result<(), DslError> {
        if let ExprKind::List(items) = &expr.kind {
            match items[0].as_ident().and_then(Op::lookup) {
                Some(Op::Program) => {
                    for stmt in &items[1..] {
                        self.compile_top(stmt, out)?;
                    }
                    return Ok(());
                }
                Some(Op::Assert) => {
                    out.push(self.compile_bool(&items[1])?);
                    return Ok(());
                }
                _ => {}
            }
        }
        out.push(self.compile_bool(expr)?);
        Ok(())
    }

    fn compile_bool(&mut self, expr: &Expr) -> Result<Constraint, DslError> {
        match &expr.kind {
            ExprKind::Bool(value) => Ok(Constraint::Const(*value)),
            ExprKind::Ident(name) => {
                self.bind(name, Ty::Bool, expr.offset)?;
                Ok(Constraint::BoolVar(name.clone()))
            }
            ExprKind::Int(_) | ExprKind::Real(_) | ExprKind::Str(_) => Err(DslError::TypeMismatch {
                expected: "Bool".into(),
                found: atom_label(&expr.kind).into(),
                offset: expr.offset,
            }),
            ExprKind::List(items) => {
                let op = items[0]
                    .as_ident()
                    .and_then(Op::lookup)
                    .expect("validated form head");
                let args = &items[1..];
                match op {
                    Op::And => Ok(Constraint::And(
                        args.iter()
                            .map(|a| self.compile_bool(a))
                            .collect::<Result<_, _>>()?,
                    )),
                    Op::Or => Ok(Constraint::Or(
                        args.iter()
                            .map(|a| self.compile_bool(a))
                            .collect::<Result<_, _>>()?,
                    )),
                    Op::Not => Ok(Constraint::Not(Box::new(self.compile_bool(&args[0])?))),
                    Op::Implies => Ok(Constraint::Implies(
                        Box::new(self.compile_bool(&args[0])?),
                        Box::new(self.compile_bool(&args[1])?),
                    )),
                    Op::Iff => Ok(Constraint::Iff(
                        Box::new(self.compile_bool(&args[0])?),
                        Box::new(self.compile_bool(&args[1])?),
                    )),
                    Op::Eq | Op::Neq => self.compile_equality(op, &args[0], &args[1]),
                    Op::Lt | Op::Le | Op::Gt | Op::Ge => {
                        let lhs = self.compile_term(&args[0])?;
                        let rhs = self.compile_term(&args[1])?;
                        Ok(Constraint::Cmp(cmp_of(op), lhs, rhs))
                    }
                    Op::Ite => {
                        let cond = self.compile_bool(&args[0])?;
                        let then = self.compile_bool(&args[1])?;
                        let other = self.compile_bool(&args[2])?;
                        Ok(Constraint::Or(vec![
                            Constraint::And(vec![cond.clone(), then]),
                            Constraint::And(vec![Constraint::Not(Box::new(cond)), other]),
                        ]))
                    }
                    Op::Forall | Op::Exists => {
                        let ExprKind::List(binders) = &args[0].kind else {
                            unreachable!("validated binder list");
                        };
                        let bound: Vec<String> = binders
                            .iter()
                            .map(|b| b.as_ident().expect("validated binder").to_string())
                            .collect();
                        for (name, binder) in bound.iter().zip(binders) {
                            self.bind(name, Ty::Int, binder.offset)?;
                        }
                        let body = self.compile_bool(&args[1])?;
                        // Bound names do not leak into the free-variable set.
                        for name in &bound {
                            if !self.declared.contains_key(name) {
                                self.vars.remove(name);
                            }
                        }
                        Ok(Constraint::Quant {
                            universal: op == Op::Forall,
                            bound,
                            body: Box::new(body),
                        })
                    }
                    Op::Assert => self.compile_bool(&args[0]),
                    Op::Program => Err(DslError::TypeMismatch {
                        expected: "Bool".into(),
                        found: "PROGRAM".into(),
                        offset: expr.offset,
                    }),
                    _ => Err(DslError::TypeMismatch {
                        expected: "Bool".into(),
                        found: "numeric term".into(),
                        offset: expr.offset,
                    }),
                }
            }
        }
    }

    fn compile_equality(&mut self, op: Op, lhs: &Expr, rhs: &Expr) -> Result<Constraint, DslError> {
        // String literals compare structurally and fold to a constant.
        if let (ExprKind::Str(a), ExprKind::Str(b)) = (&lhs.kind, &rhs.kind) {
            let equal = a == b;
            return Ok(Constraint::Const(if op == Op::Eq { equal } else { !equal }));
        }

        if self.is_boolish(lhs) || self.is_boolish(rhs) {
            let left = self.compile_bool(lhs)?;
            let right = self.compile_bool(rhs)?;
            let iff = Constraint::Iff(Box::new(left), Box::new(right));
            return Ok(if op == Op::Eq {
                iff
            } else {
                Constraint::Not(Box::new(iff))
            });
        }

        let left = self.compile_term(lhs)?;
        let right = self.compile_term(rhs)?;
        Ok(Constraint::Cmp(cmp_of(op), left, right))
    }

    fn compile_term(&mut self, expr: &Expr) -> Result<Term, DslError> {
        match &expr.kind {
            ExprKind::Int(value) => Ok(Term::IntConst(*value)),
            ExprKind::Real(value) => Ok(Term::RealConst(*value)),
            ExprKind::Ident(name) => {
                self.bind_numeric(name, expr.offset)?;
                Ok(Term::Var(name.clone()))
            }
            ExprKind::Bool(_) | ExprKind::Str(_) => Err(DslError::TypeMismatch {
                expected: "Int or Real".into(),
                found: atom_label(&expr.kind).into(),
                offset: expr.offset,
            }),
            ExprKind::List(items) => {
                let op = items[0]
                    .as_ident()
                    .and_then(Op::lookup)
                    .expect("validated form head");
                let args = &items[1..];
                let binary = |c: &mut Self,
                              ctor: fn(Box<Term>, Box<Term>) -> Term|
                 -> Result<Term, DslError> {
                    let mut acc = c.compile_term(&args[0])?;
                    for arg in &args[1..] {
                        acc = ctor(Box::new(acc), Box::new(c.compile_term(arg)?));
                    }
                    Ok(acc)
                };
                match op {
                    Op::Plus => binary(self, Term::Add),
                    Op::Minus => binary(self, Term::Sub),
                    Op::Mul => binary(self, Term::Mul),
                    Op::Div => binary(self, Term::Div),
                    Op::Mod => binary(self, Term::Mod),
                    Op::Pow => binary(self, Term::Pow),
                    Op::Neg => Ok(Term::Neg(Box::new(self.compile_term(&args[0])?))),
                    Op::Ite => {
                        let cond = self.compile_bool(&args[0])?;
                        let then = self.compile_term(&args[1])?;
                        let other = self.compile_term(&args[2])?;
                        Ok(Term::Ite(Box::new(cond), Box::new(then), Box::new(other)))
                    }
                    _ => Err(DslError::TypeMismatch {
                        expected: "Int or Real".into(),
                        found: "Bool".into(),
                        offset: expr.offset,
                    }),
                }
            }
        }
    }

    fn is_boolish(&self, expr: &Expr) -> bool {
        match &expr.kind {
            ExprKind::Bool(_) => true,
            ExprKind::Ident(name) => self.vars.get(name) == Some(&Ty::Bool),
            ExprKind::List(items) => matches!(
                items[0].as_ident().and_then(Op::lookup),
                Some(
                    Op::And
                        | Op::Or
                        | Op::Not
                        | Op::Implies
                        | Op::Iff
                        | Op::Eq
                        | Op::Neq
                        | Op::Lt
                        | Op::Le
                        | Op::Gt
                        | Op::Ge
                        | Op::Forall
                        | Op::Exists
                )
            ),
            _ => false,
        }
    }

    fn bind(&mut self, name: &str, ty: Ty, offset: usize) -> Result<(), DslError> {
        match self.vars.get(name) {
            None => {
                self.vars.insert(name.to_string(), ty);
                Ok(())
            }
            Some(existing) if *existing == ty => Ok(()),
            // Int and Real unify by widening to Real.
            Some(Ty::Int) if ty == Ty::Real => {
                self.vars.insert(name.to_string(), Ty::Real);
                Ok(())
            }
            Some(Ty::Real) if ty == Ty::Int => Ok(()),
            Some(existing) => Err(DslError::TypeMismatch {
                expected: existing.label().into(),
                found: ty.label().into(),
                offset,
            }),
        }
    }

    fn bind_numeric(&mut self, name: &str, offset: usize) -> Result<(), DslError> {
        match self.vars.get(name) {
            Some(Ty::Bool) => Err(DslError::TypeMismatch {
                expected: "Bool".into(),
                found: "Int".into(),
                offset,
            }),
            Some(_) => Ok(()),
            None => {
                self.vars.insert(name.to_string(), Ty::Int);
                Ok(())
            }
        }
    }
}

fn cmp_of(op: Op) -> CmpOp {
    match op {
        Op::Eq => CmpOp::Eq,
        Op::Neq => CmpOp::Neq,
        Op::Lt => CmpOp::Lt,
        Op::Le => CmpOp::Le,
        Op::Gt => CmpOp::Gt,
        Op::Ge => CmpOp::Ge,
        _ => unreachable!("not a comparison"),
    }
}

fn atom_label(kind: &ExprKind) -> &'static str {
    match kind {
        ExprKind::Int(_) => "Int",
        ExprKind::Real(_) => "Real",
        ExprKind::Bool(_) => "Bool",
        ExprKind::Str(_) => "Str",
        ExprKind::Ident(_) => "identifier",
        ExprKind::List(_) => "form",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::parse;

    fn compile_src(src: &str) -> Result<SolverProgram, DslError> {
        compile(&parse(src).unwrap(), &BTreeMap::new())
    }

    #[test]
    fn infers_int_for_relational_operands() {
        let program = compile_src("(AND (GT x 5) (LT x 10))").unwrap();
        assert_eq!(program.vars.get("x"), Some(&Ty::Int));
        assert_eq!(program.constraints.len(), 1);
    }

    #[test]
    fn real_literal_widens_variable() {
        let program = compile_src("(GT x 2.5)").unwrap();
        assert_eq!(program.vars.get("x"), Some(&Ty::Int));
        let program = compile_src("(AND (GT x 2.5) (EQ x (PLUS y 0.5)))").unwrap();
        // x stays numeric; widening happens during evaluation, not binding.
        assert!(matches!(
            program.vars.get("x"),
            Some(&Ty::Int) | Some(&Ty::Real)
        ));
        assert!(program.vars.contains_key("y"));
    }

    #[test]
    fn bool_equality_becomes_iff() {
        let program = compile_src("(IMPLIES (GT amount 10000) (EQ requires_approval true))").unwrap();
        assert_eq!(program.vars.get("amount"), Some(&Ty::Int));
        assert_eq!(program.vars.get("requires_approval"), Some(&Ty::Bool));
    }

    #[test]
    fn mixed_typing_is_rejected() {
        let err = compile_src("(AND flag (GT flag 3))").unwrap_err();
        assert!(matches!(err, DslError::TypeMismatch { .. }));
    }

    #[test]
    fn program_of_asserts_flattens() {
        let program = compile_src("(PROGRAM (ASSERT (GT x 0)) (ASSERT (LT x 4)))").unwrap();
        assert_eq!(program.constraints.len(), 2);
    }

    #[test]
    fn declared_sorts_override_inference() {
        let mut declared = BTreeMap::new();
        declared.insert("x".to_string(), Ty::Real);
        let program = compile(&parse("(GT x 5)").unwrap(), &declared).unwrap();
        assert_eq!(program.vars.get("x"), Some(&Ty::Real));
    }

    #[test]
    fn quantifier_bound_vars_do_not_leak() {
        let program = compile_src("(EXISTS (k) (EQ n (MUL k 2)))").unwrap();
        assert!(program.vars.contains_key("n"));
        assert!(!program.vars.contains_key("k"));
    }

    #[test]
    fn string_equality_folds() {
        let program = compile_src("(EQ \"a\" \"a\")").unwrap();
        assert_eq!(program.constraints[0], Constraint::Const(true));
    }
}
