//! Solver binding.
//!
//! `Solve` is the seam for an external SMT backend. The in-tree
//! `BoundedSolver` decides the fragment the translator actually emits,
//! boolean structure over integer/boolean variables compared against
//! constants, by exhaustive search over the constant hull, and degrades to
//! `Unknown` (never a wrong answer) outside that fragment or past its
//! deadline.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::compile::{CmpOp, Constraint, SolverProgram, Term, Ty};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ModelValue {
    Int(i64),
    Real(f64),
    Bool(bool),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "UPPERCASE")]
pub enum Satisfiability {
    Sat { model: BTreeMap<String, ModelValue> },
    Unsat,
    Unknown,
}

pub trait Solve: Send + Sync {
    fn solve(&self, program: &SolverProgram, budget: Duration) -> Satisfiability;
}

/// Exhaustive finite-domain search over the constraint constants.
#[derive(Debug, Clone, Default)]
pub struct BoundedSolver {
    /// Hard cap on enumerated assignments before giving up.
    pub max_assignments: u64,
}

impl BoundedSolver {
    pub fn new() -> Self {
        Self {
            max_assignments: 2_000_000,
        }
    }
}

impl Solve for BoundedSolver {
    fn solve(&self, program: &SolverProgram, budget: Duration) -> Satisfiability {
        let deadline = Instant::now() + budget;
        let max = if self.max_assignments == 0 {
            2_000_000
        } else {
            self.max_assignments
        };
        search(program, deadline, max)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Value {
    Int(i64),
    Real(f64),
    Bool(bool),
}

impl Value {
    fn as_f64(self) -> Option<f64> {
        match self {
            Value::Int(v) => Some(v as f64),
            Value::Real(v) => Some(v),
            Value::Bool(_) => None,
        }
    }
}

type Assignment = BTreeMap<String, Value>;

fn search(program: &SolverProgram, deadline: Instant, max_assignments: u64) -> Satisfiability {
    let consts = collect_constants(program);
    let domains: Vec<(String, Vec<Value>)> = program
        .vars
        .iter()
        .map(|(name, ty)| (name.clone(), domain_for(*ty, &consts)))
        .collect();

    // Whether exhausting the grid proves UNSAT: only in the fragment where
    // every atom compares a variable against a constant expression.
    let decisive = program.constraints.iter().all(constraint_decisive)
        && program.vars.values().all(|ty| *ty != Ty::Real);

    let total: u64 = domains
        .iter()
        .map(|(_, d)| d.len() as u64)
        .try_fold(1u64, |acc, n| acc.checked_mul(n.max(1)))
        .unwrap_or(u64::MAX);

    let mut saw_unknown = false;
    let mut indices = vec![0usize; domains.len()];
    let mut visited: u64 = 0;

    loop {
        if visited % 1024 == 0 && Instant::now() >= deadline {
            return Satisfiability::Unknown;
        }
        if visited >= max_assignments {
            return Satisfiability::Unknown;
        }

        let assignment: Assignment = domains
            .iter()
            .zip(&indices)
            .map(|((name, dom), &i)| (name.clone(), dom[i]))
            .collect();

        match eval_all(&program.constraints, &assignment, &consts, deadline) {
            Some(true) => {
                let model = assignment
                    .into_iter()
                    .map(|(name, value)| {
                        let out = match value {
                            Value::Int(v) => ModelValue::Int(v),
                            Value::Real(v) => ModelValue::Real(v),
                            Value::Bool(v) => ModelValue::Bool(v),
                        };
                        (name, out)
                    })
                    .collect();
                return Satisfiability::Sat { model };
            }
            Some(false) => {}
            None => saw_unknown = true,
        }

        visited += 1;
        if !advance(&mut indices, &domains) {
            break;
        }
    }

    if decisive && !saw_unknown && total <= max_assignments {
        Satisfiability::Unsat
    } else {
        Satisfiability::Unknown
    }
}

fn advance(indices: &mut [usize], domains: &[(String, Vec<Value>)]) -> bool {
    for i in (0..indices.len()).rev() {
        indices[i] += 1;
        if indices[i] < domains[i].1.len() {
            return true;
        }
        indices[i] = 0;
    }
    false
}

/// Candidate values for one variable, derived from the program constants.
fn domain_for(ty: Ty, consts: &[f64]) -> Vec<Value> {
    match ty {
        Ty::Bool => vec![Value::Bool(false), Value::Bool(true)],
        Ty::Int => int_hull(consts).into_iter().map(Value::Int).collect(),
        Ty::Real => {
            let mut candidates: Vec<f64> = Vec::new();
            let mut ints: Vec<f64> = consts.to_vec();
            ints.push(0.0);
            ints.sort_by(|a, b| a.partial_cmp(b).expect("finite constants"));
            ints.dedup();
            for window in ints.windows(2) {
                candidates.push((window[0] + window[1]) / 2.0);
            }
            for c in &ints {
                candidates.extend([*c - 1.0, *c, *c + 1.0]);
            }
            candidates.sort_by(|a, b| a.partial_cmp(b).expect("finite candidates"));
            candidates.dedup();
            candidates.into_iter().map(Value::Real).collect()
        }
    }
}

fn int_hull(consts: &[f64]) -> Vec<i64> {
    let ints: Vec<i64> = consts.iter().map(|c| *c as i64).collect();
    let lo = ints.iter().copied().min().unwrap_or(0).min(0) - 2;
    let hi = ints.iter().copied().max().unwrap_or(0).max(0) + 2;
    // Keep the grid bounded even for wild constants.
    let (lo, hi) = if hi - lo > 4096 {
        let mut pts: Vec<i64> = Vec::new();
        for c in &ints {
            pts.extend([c - 2, c - 1, *c, c + 1, c + 2]);
        }
        pts.extend([-2, -1, 0, 1, 2]);
        pts.sort_unstable();
        pts.dedup();
        return pts;
    } else {
        (lo, hi)
    };
    (lo..=hi).collect()
}

fn collect_constants(program: &SolverProgram) -> Vec<f64> {
    let mut out = Vec::new();
    for constraint in &program.constraints {
        constants_of_constraint(constraint, &mut out);
    }
    out.sort_by(|a, b| a.partial_cmp(b).expect("finite constants"));
    out.dedup();
    out
}

fn constants_of_constraint(constraint: &Constraint, out: &mut Vec<f64>) {
    match constraint {
        Constraint::Const(_) | Constraint::BoolVar(_) => {}
        Constraint::Not(inner) => constants_of_constraint(inner, out),
        Constraint::And(items) | Constraint::Or(items) => {
            for item in items {
                constants_of_constraint(item, out);
            }
        }
        Constraint::Implies(a, b) | Constraint::Iff(a, b) => {
            constants_of_constraint(a, out);
            constants_of_constraint(b, out);
        }
        Constraint::Cmp(_, lhs, rhs) => {
            constants_of_term(lhs, out);
            constants_of_term(rhs, out);
        }
        Constraint::Quant { body, .. } => constants_of_constraint(body, out),
    }
}

fn constants_of_term(term: &Term, out: &mut Vec<f64>) {
    match term {
        Term::IntConst(v) => out.push(*v as f64),
        Term::RealConst(v) => out.push(*v),
        Term::Var(_) => {}
        Term::Add(a, b)
        | Term::Sub(a, b)
        | Term::Mul(a, b)
        | Term::Div(a, b)
        | Term::Mod(a, b)
        | Term::Pow(a, b) => {
            constants_of_term(a, out);
            constants_of_term(b, out);
        }
        Term::Neg(a) => constants_of_term(a, out),
        Term::Ite(cond, a, b) => {
            constants_of_constraint(cond, out);
            constants_of_term(a, out);
            constants_of_term(b, out);
        }
    }
}

/// True when exhausting the grid is a proof of UNSAT: every comparison pits
/// a bare variable against a constant-only term.
fn constraint_decisive(constraint: &Constraint) -> bool {
    match constraint {
        Constraint::Const(_) | Constraint::BoolVar(_) => true,
        Constraint::Not(inner) => constraint_decisive(inner),
        Constraint::And(items) | Constraint::Or(items) => items.iter().all(constraint_decisive),
        Constraint::Implies(a, b) | Constraint::Iff(a, b) => {
            constraint_decisive(a) && constraint_decisive(b)
        }
        Constraint::Cmp(_, lhs, rhs) => {
            let lhs_simple = term_is_var(lhs) || term_is_const(lhs);
            let rhs_simple = term_is_var(rhs) || term_is_const(rhs);
            lhs_simple && rhs_simple
        }
        Constraint::Quant { .. } => false,
    }
}

fn term_is_var(term: &Term) -> bool {
    matches!(term, Term::Var(_))
}

fn term_is_const(term: &Term) -> bool {
    match term {
        Term::IntConst(_) | Term::RealConst(_) => true,
        Term::Neg(inner) => term_is_const(inner),
        Term::Add(a, b) | Term::Sub(a, b) | Term::Mul(a, b) => {
            term_is_const(a) && term_is_const(b)
        }
        _ => false,
    }
}

fn eval_all(
    constraints: &[Constraint],
    assignment: &Assignment,
    consts: &[f64],
    deadline: Instant,
) -> Option<bool> {
    let mut all_true = true;
    for constraint in constraints {
        match eval_constraint(constraint, assignment, consts, deadline) {
            Some(true) => {}
            Some(false) => return Some(false),
            None => all_true = false,
        }
    }
    if all_true {
        Some(true)
    } else {
        None
    }
}

fn eval_constraint(
    constraint: &Constraint,
    assignment: &Assignment,
    consts: &[f64],
    deadline: Instant,
) -> Option<bool> {
    match constraint {
        Constraint::Const(value) => Some(*value),
        Constraint::BoolVar(name) => match assignment.get(name) {
            Some(Value::Bool(value)) => Some(*value),
            _ => None,
        },
        Constraint::Not(inner) => eval_constraint(inner, assignment, consts, deadline).map(|v| !v),
        Constraint::And(items) => {
            let mut all = Some(true);
            for item in items {
                match eval_constraint(item, assignment, consts, deadline) {
                    Some(true) => {}
                    Some(false) => return Some(false),
                    None => all = None,
                }
            }
            all
        }
        Constraint::Or(items) => {
            let mut any = Some(false);
            for item in items {
                match eval_constraint(item, assignment, consts, deadline) {
                    Some(true) => return Some(true),
                    Some(false) => {}
                    None => any = None,
                }
            }
            any
        }
        Constraint::Implies(a, b) => {
            match (
                eval_constraint(a, assignment, consts, deadline),
                eval_constraint(b, assignment, consts, deadline),
            ) {
                (Some(false), _) | (_, Some(true)) => Some(true),
                (Some(true), Some(false)) => Some(false),
                _ => None,
            }
        }
        Constraint::Iff(a, b) => Some(
            eval_constraint(a, assignment, consts, deadline)?
                == eval_constraint(b, assignment, consts, deadline)?,
        ),
        Constraint::Cmp(op, lhs, rhs) => {
            let left = eval_term(lhs, assignment, consts, deadline)?;
            let right = eval_term(rhs, assignment, consts, deadline)?;
            compare(*op, left, right)
        }
        Constraint::Quant {
            universal,
            bound,
            body,
        } => eval_quant(*universal, bound, body, assignment, consts, deadline),
    }
}

fn eval_quant(
    universal: bool,
    bound: &[String],
    body: &Constraint,
    assignment: &Assignment,
    consts: &[f64],
    deadline: Instant,
) -> Option<bool> {
    // Bound variables range over the integer hull. A grid counterexample
    // soundly refutes FORALL and a grid witness soundly proves EXISTS;
    // the opposite directions are unbounded, so they stay unknown.
    let hull = int_hull(consts);
    let mut stack: Vec<Assignment> = vec![assignment.clone()];
    for name in bound {
        let mut next = Vec::new();
        for base in &stack {
            for v in &hull {
                let mut extended = base.clone();
                extended.insert(name.clone(), Value::Int(*v));
                next.push(extended);
            }
        }
        stack = next;
        if stack.len() > 65_536 {
            return None;
        }
    }

    for extended in &stack {
        if Instant::now() >= deadline {
            return None;
        }
        match eval_constraint(body, extended, consts, deadline) {
            Some(true) if !universal => return Some(true),
            Some(false) if universal => return Some(false),
            _ => {}
        }
    }
    None
}

fn eval_term(
    term: &Term,
    assignment: &Assignment,
    consts: &[f64],
    deadline: Instant,
) -> Option<Value> {
    match term {
        Term::IntConst(v) => Some(Value::Int(*v)),
        Term::RealConst(v) => Some(Value::Real(*v)),
        Term::Var(name) => assignment.get(name).copied(),
        Term::Add(a, b) => arith(term, a, b, assignment, consts, deadline),
        Term::Sub(a, b) => arith(term, a, b, assignment, consts, deadline),
        Term::Mul(a, b) => arith(term, a, b, assignment, consts, deadline),
        Term::Div(a, b) => arith(term, a, b, assignment, consts, deadline),
        Term::Mod(a, b) => arith(term, a, b, assignment, consts, deadline),
        Term::Pow(a, b) => arith(term, a, b, assignment, consts, deadline),
        Term::Neg(a) => match eval_term(a, assignment, consts, deadline)? {
            Value::Int(v) => Some(Value::Int(v.checked_neg()?)),
            Value::Real(v) => Some(Value::Real(-v)),
            Value::Bool(_) => None,
        },
        Term::Ite(cond, a, b) => {
            if eval_constraint(cond, assignment, consts, deadline)? {
                eval_term(a, assignment, consts, deadline)
            } else {
                eval_term(b, assignment, consts, deadline)
            }
        }
    }
}

fn arith(
    term: &Term,
    a: &Term,
    b: &Term,
    assignment: &Assignment,
    consts: &[f64],
    deadline: Instant,
) -> Option<Value> {
    let left = eval_term(a, assignment, consts, deadline)?;
    let right = eval_term(b, assignment, consts, deadline)?;

    if let (Value::Int(x), Value::Int(y)) = (left, right) {
        let result = match term {
            Term::Add(..) => x.checked_add(y),
            Term::Sub(..) => x.checked_sub(y),
            Term::Mul(..) => x.checked_mul(y),
            Term::Div(..) if y != 0 && x.checked_rem(y) == Some(0) => x.checked_div(y),
            Term::Div(..) => {
                return if y == 0 {
                    None
                } else {
                    Some(Value::Real(x as f64 / y as f64))
                }
            }
            Term::Mod(..) if y != 0 => x.checked_rem_euclid(y),
            Term::Mod(..) => None,
            Term::Pow(..) if (0..=32).contains(&y) => x.checked_pow(y as u32),
            Term::Pow(..) => None,
            _ => None,
        };
        return result.map(Value::Int);
    }

    let x = left.as_f64()?;
    let y = right.as_f64()?;
    let result = match term {
        Term::Add(..) => x + y,
        Term::Sub(..) => x - y,
        Term::Mul(..) => x * y,
        Term::Div(..) if y != 0.0 => x / y,
        Term::Mod(..) if y != 0.0 => x.rem_euclid(y),
        Term::Pow(..) => x.powf(y),
        _ => return None,
    };
    if result.is_finite() {
        Some(Value::Real(result))
    } else {
        None
    }
}

fn compare(op: CmpOp, left: Value, right: Value) -> Option<bool> {
    if let (Value::Bool(a), Value::Bool(b)) = (left, right) {
        return Some(match op {
            CmpOp::Eq => a == b,
            CmpOp::Neq => a != b,
            _ => return None,
        });
    }
    let a = left.as_f64()?;
    let b = right.as_f64()?;
    Some(match op {
        CmpOp::Eq => (a - b).abs() < f64::EPSILON,
        CmpOp::Neq => (a - b).abs() >= f64::EPSILON,
        CmpOp::Lt => a < b,
        CmpOp::Le => a <= b,
        CmpOp::Gt => a > b,
        CmpOp::Ge => a >= b,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::parse;
    use crate::compile::compile;

    fn solve_src(src: &str) -> Satisfiability {
        let program = compile(&parse(src).unwrap(), &BTreeMap::new()).unwrap();
        BoundedSolver::new().solve(&program, Duration::from_secs(5))
    }

    #[test]
    fn window_constraint_is_sat_with_model() {
        let Satisfiability::Sat { model } = solve_src("(AND (GT x 5) (LT x 10))") else {
            panic!("expected SAT");
        };
        let ModelValue::Int(x) = model["x"] else {
            panic!("expected integer model");
        };
        assert!(x > 5 && x < 10);
    }

    #[test]
    fn contradictory_window_is_unsat() {
        assert_eq!(solve_src("(AND (GT x 10) (LT x 5))"), Satisfiability::Unsat);
    }

    #[test]
    fn implication_with_boolean_var() {
        let result = solve_src("(IMPLIES (GT amount 10000) (EQ requires_approval true))");
        assert!(matches!(result, Satisfiability::Sat { .. }));
    }

    #[test]
    fn arithmetic_equality_finds_witness() {
        let Satisfiability::Sat { model } = solve_src("(EQ (PLUS x y) 10)") else {
            panic!("expected SAT");
        };
        let (ModelValue::Int(x), ModelValue::Int(y)) = (&model["x"], &model["y"]) else {
            panic!("expected integers");
        };
        assert_eq!(x + y, 10);
    }

    #[test]
    fn nonlinear_without_witness_is_unknown_not_unsat() {
        // x*x = 17 has no integer solution; the grid cannot prove that.
        assert_eq!(solve_src("(EQ (MUL x x) 17)"), Satisfiability::Unknown);
    }

    #[test]
    fn exists_finds_grid_witness() {
        let result = solve_src("(EXISTS (k) (EQ (MUL k 2) 6))");
        assert!(matches!(result, Satisfiability::Sat { .. }));
    }

    #[test]
    fn zero_budget_times_out_to_unknown() {
        let program = compile(
            &parse("(AND (GT x 5) (LT x 10))").unwrap(),
            &BTreeMap::new(),
        )
        .unwrap();
        let result = BoundedSolver::new().solve(&program, Duration::from_secs(0));
        assert_eq!(result, Satisfiability::Unknown);
    }

    #[test]
    fn unsat_core_shape_three_way() {
        assert_eq!(
            solve_src("(PROGRAM (ASSERT (GE x 1)) (ASSERT (LE x 0)))"),
            Satisfiability::Unsat
        );
    }
}
