//! Tabular statistics over a single preloaded frame.
//!
//! The translator emits a tiny chained-call DSL over one frame variable
//! (`df`), e.g. `df.filter(age, >, 30).mean(salary)`. The grammar has no
//! imports, no attribute access beyond the chain, no I/O forms at all, so
//! validating a program up front is what makes it sandboxable. Execution is
//! budgeted: a row×op budget caps work regardless of what the sandbox layer
//! additionally enforces.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum StatsError {
    #[error("statistics grammar violation: {0}")]
    Grammar(String),
    #[error("unknown column {0:?}")]
    UnknownColumn(String),
    #[error("column {0:?} is not numeric")]
    NotNumeric(String),
    #[error("empty result set")]
    EmptyResult,
    #[error("malformed CSV: {0}")]
    Csv(String),
    #[error("execution budget exhausted")]
    Budget,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Cell {
    Num(f64),
    Text(String),
    Null,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Cell>>,
}

impl Frame {
    /// Parse CSV with a header row. Quoted fields may contain commas and
    /// doubled quotes.
    pub fn from_csv(data: &str) -> Result<Frame, StatsError> {
        let mut records = Vec::new();
        for (idx, line) in data.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            records.push(
                parse_csv_record(line)
                    .map_err(|e| StatsError::Csv(format!("line {}: {e}", idx + 1)))?,
            );
        }
        let mut iter = records.into_iter();
        let columns = iter.next().ok_or_else(|| StatsError::Csv("no header row".into()))?;
        let width = columns.len();
        let rows = iter
            .map(|mut fields| {
                fields.resize(width, String::new());
                fields
                    .into_iter()
                    .map(|field| {
                        if field.is_empty() {
                            Cell::Null
                        } else if let Ok(value) = field.parse::<f64>() {
                            Cell::Num(value)
                        } else {
                            Cell::Text(field)
                        }
                    })
                    .collect()
            })
            .collect();
        Ok(Frame { columns, rows })
    }

    fn column_index(&self, name: &str) -> Result<usize, StatsError> {
        self.columns
            .iter()
            .position(|c| c == name)
            .ok_or_else(|| StatsError::UnknownColumn(name.to_string()))
    }

    fn numeric_column(&self, name: &str) -> Result<Vec<f64>, StatsError> {
        let idx = self.column_index(name)?;
        let mut out = Vec::new();
        for row in &self.rows {
            match &row[idx] {
                Cell::Num(v) => out.push(*v),
                Cell::Null => {}
                Cell::Text(_) => return Err(StatsError::NotNumeric(name.to_string())),
            }
        }
        Ok(out)
    }
}

fn parse_csv_record(line: &str) -> Result<Vec<String>, String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut chars = line.chars().peekable();
    let mut in_quotes = false;
    while let Some(c) = chars.next() {
        match c {
            '"' if in_quotes => {
                if chars.peek() == Some(&'"') {
                    chars.next();
                    current.push('"');
                } else {
                    in_quotes = false;
                }
            }
            '"' if current.is_empty() => in_quotes = true,
            '"' => return Err("stray quote".into()),
            ',' if !in_quotes => {
                fields.push(std::mem::take(&mut current));
            }
            _ => current.push(c),
        }
    }
    if in_quotes {
        return Err("unterminated quote".into());
    }
    fields.push(current);
    Ok(fields.into_iter().map(|f| f.trim().to_string()).collect())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Eq,
    Neq,
    Lt,
    Le,
    Gt,
    Ge,
}

impl FilterOp {
    fn parse(text: &str) -> Option<FilterOp> {
        Some(match text {
            "==" | "=" => FilterOp::Eq,
            "!=" => FilterOp::Neq,
            "<" => FilterOp::Lt,
            "<=" => FilterOp::Le,
            ">" => FilterOp::Gt,
            ">=" => FilterOp::Ge,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
enum StatsOp {
    Count,
    Sum(String),
    Mean(String),
    Min(String),
    Max(String),
    Median(String),
    Std(String),
    Filter(String, FilterOp, Literal),
    Select(String),
}

#[derive(Debug, Clone, PartialEq)]
enum Literal {
    Num(f64),
    Text(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct StatsProgram {
    ops: Vec<StatsOp>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StatsValue {
    Scalar(f64),
    Column(Vec<Cell>),
}

impl fmt::Display for StatsValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatsValue::Scalar(v) => write!(f, "{v}"),
            StatsValue::Column(cells) => write!(f, "{} values", cells.len()),
        }
    }
}

/// Grammar gate: parse without executing. Rejects everything outside the
/// chained-call form; this runs before any sandbox dispatch.
pub fn parse_program(code: &str) -> Result<StatsProgram, StatsError> {
    let code = code.trim();
    let rest = code
        .strip_prefix("df")
        .ok_or_else(|| StatsError::Grammar("program must start with `df`".into()))?;
    if rest.is_empty() {
        return Err(StatsError::Grammar("no operation on frame".into()));
    }

    let mut ops = Vec::new();
    let mut remaining = rest;
    while !remaining.is_empty() {
        let after_dot = remaining
            .strip_prefix('.')
            .ok_or_else(|| StatsError::Grammar(format!("expected `.`, found {remaining:?}")))?;
        let paren = after_dot
            .find('(')
            .ok_or_else(|| StatsError::Grammar("expected call".into()))?;
        let name = &after_dot[..paren];
        let close = matching_paren(after_dot, paren)
            .ok_or_else(|| StatsError::Grammar("unbalanced parenthesis".into()))?;
        let args_text = &after_dot[paren + 1..close];
        let args: Vec<&str> = if args_text.trim().is_empty() {
            Vec::new()
        } else {
            args_text.split(',').map(str::trim).collect()
        };
        ops.push(parse_op(name, &args)?);
        remaining = &after_dot[close + 1..];
    }
    if ops.is_empty() {
        return Err(StatsError::Grammar("no operation on frame".into()));
    }
    Ok(StatsProgram { ops })
}

fn matching_paren(text: &str, open: usize) -> Option<usize> {
    let mut depth = 0usize;
    for (i, c) in text[open..].char_indices() {
        match c {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth == 0 {
                    return Some(open + i);
                }
            }
            _ => {}
        }
    }
    None
}

fn parse_op(name: &str, args: &[&str]) -> Result<StatsOp, StatsError> {
    let column = |i: usize| -> Result<String, StatsError> {
        let raw = args
            .get(i)
            .ok_or_else(|| StatsError::Grammar(format!("{name} missing argument")))?;
        let ident = raw.trim_matches(&['"', '\''][..]);
        if ident.is_empty()
            || !ident
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == ' ')
        {
            return Err(StatsError::Grammar(format!("bad column name {raw:?}")));
        }
        Ok(ident.to_string())
    };

    match (name, args.len()) {
        ("count", 0) => Ok(StatsOp::Count),
        ("sum", 1) => Ok(StatsOp::Sum(column(0)?)),
        ("mean", 1) | ("avg", 1) => Ok(StatsOp::Mean(column(0)?)),
        ("min", 1) => Ok(StatsOp::Min(column(0)?)),
        ("max", 1) => Ok(StatsOp::Max(column(0)?)),
        ("median", 1) => Ok(StatsOp::Median(column(0)?)),
        ("std", 1) => Ok(StatsOp::Std(column(0)?)),
        ("select", 1) => Ok(StatsOp::Select(column(0)?)),
        ("filter", 3) => {
            let op = FilterOp::parse(args[1])
                .ok_or_else(|| StatsError::Grammar(format!("bad filter operator {:?}", args[1])))?;
            let lit_raw = args[2];
            let literal = if let Ok(value) = lit_raw.parse::<f64>() {
                Literal::Num(value)
            } else {
                Literal::Text(lit_raw.trim_matches(&['"', '\''][..]).to_string())
            };
            Ok(StatsOp::Filter(column(0)?, op, literal))
        }
        _ => Err(StatsError::Grammar(format!(
            "operation {name}/{} is not part of the statistics grammar",
            args.len()
        ))),
    }
}

/// Execute a parsed program with a row×op work budget.
pub fn execute(program: &StatsProgram, frame: &Frame, budget: u64) -> Result<StatsValue, StatsError> {
    let mut work: u64 = 0;
    let mut current = frame.clone();
    let mut result: Option<StatsValue> = None;

    for op in &program.ops {
        if result.is_some() {
            return Err(StatsError::Grammar(
                "scalar result cannot be chained further".into(),
            ));
        }
        work = work.saturating_add(current.rows.len() as u64 + 1);
        if work > budget {
            return Err(StatsError::Budget);
        }
        match op {
            StatsOp::Count => result = Some(StatsValue::Scalar(current.rows.len() as f64)),
            StatsOp::Sum(col) => {
                let values = current.numeric_column(col)?;
                result = Some(StatsValue::Scalar(values.iter().sum()));
            }
            StatsOp::Mean(col) => {
                let values = current.numeric_column(col)?;
                if values.is_empty() {
                    return Err(StatsError::EmptyResult);
                }
                result = Some(StatsValue::Scalar(
                    values.iter().sum::<f64>() / values.len() as f64,
                ));
            }
            StatsOp::Min(col) => {
                let values = current.numeric_column(col)?;
                let min = values
                    .iter()
                    .copied()
                    .fold(f64::INFINITY, f64::min);
                if min.is_infinite() {
                    return Err(StatsError::EmptyResult);
                }
                result = Some(StatsValue::Scalar(min));
            }
            StatsOp::Max(col) => {
                let values = current.numeric_column(col)?;
                let max = values
                    .iter()
                    .copied()
                    .fold(f64::NEG_INFINITY, f64::max);
                if max.is_infinite() {
                    return Err(StatsError::EmptyResult);
                }
                result = Some(StatsValue::Scalar(max));
            }
            StatsOp::Median(col) => {
                let mut values = current.numeric_column(col)?;
                if values.is_empty() {
                    return Err(StatsError::EmptyResult);
                }
                values.sort_by(|a, b| a.partial_cmp(b).expect("finite cells"));
                let mid = values.len() / 2;
                let median = if values.len() % 2 == 0 {
                    (values[mid - 1] + values[mid]) / 2.0
                } else {
                    values[mid]
                };
                result = Some(StatsValue::Scalar(median));
            }
            StatsOp::Std(col) => {
                let values = current.numeric_column(col)?;
                if values.len() < 2 {
                    return Err(StatsError::EmptyResult);
                }
                let mean = values.iter().sum::<f64>() / values.len() as f64;
                let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>()
                    / (values.len() - 1) as f64;
                result = Some(StatsValue::Scalar(var.sqrt()));
            }
            StatsOp::Select(col) => {
                let idx = current.column_index(col)?;
                result = Some(StatsValue::Column(
                    current.rows.iter().map(|row| row[idx].clone()).collect(),
                ));
            }
            StatsOp::Filter(col, op, literal) => {
                let idx = current.column_index(col)?;
                current.rows.retain(|row| cell_matches(&row[idx], *op, literal));
            }
        }
    }

    result.ok_or_else(|| StatsError::Grammar("program must end in an aggregate".into()))
}

fn cell_matches(cell: &Cell, op: FilterOp, literal: &Literal) -> bool {
    match (cell, literal) {
        (Cell::Num(v), Literal::Num(lit)) => match op {
            FilterOp::Eq => (v - lit).abs() < f64::EPSILON,
            FilterOp::Neq => (v - lit).abs() >= f64::EPSILON,
            FilterOp::Lt => v < lit,
            FilterOp::Le => v <= lit,
            FilterOp::Gt => v > lit,
            FilterOp::Ge => v >= lit,
        },
        (Cell::Text(v), Literal::Text(lit)) => match op {
            FilterOp::Eq => v == lit,
            FilterOp::Neq => v != lit,
            _ => false,
        },
        _ => false,
    }
}

/// Convenience used by the sandbox worker: validate, load, run.
pub fn run(code: &str, csv: &str, budget: u64) -> Result<StatsValue, StatsError> {
    let program = parse_program(code)?;
    let frame = Frame::from_csv(csv)?;
    execute(&program, &frame, budget)
}

#[cfg(test)]
mod tests {
    use super::*;

    const CSV: &str = "name,age,salary\nAda,36,120000\nBob,41,95000\nCmdr,29,87000\n";

    #[test]
    fn mean_of_column() {
        let value = run("df.mean(salary)", CSV, 10_000).unwrap();
        let StatsValue::Scalar(v) = value else {
            panic!("expected scalar");
        };
        assert!((v - 100_666.66666666667).abs() < 1e-6);
    }

    #[test]
    fn filter_then_aggregate() {
        let value = run("df.filter(age, >, 30).count()", CSV, 10_000).unwrap();
        assert_eq!(value, StatsValue::Scalar(2.0));
    }

    #[test]
    fn filter_on_text() {
        let value = run("df.filter(name, ==, Ada).sum(salary)", CSV, 10_000).unwrap();
        assert_eq!(value, StatsValue::Scalar(120_000.0));
    }

    #[test]
    fn median_and_std() {
        let StatsValue::Scalar(median) = run("df.median(age)", CSV, 10_000).unwrap() else {
            panic!();
        };
        assert_eq!(median, 36.0);
        let StatsValue::Scalar(std) = run("df.std(age)", CSV, 10_000).unwrap() else {
            panic!();
        };
        assert!(std > 0.0);
    }

    #[test]
    fn grammar_rejects_imports() {
        for code in [
            "import os",
            "df.__class__",
            "df.apply(lambda x: x)",
            "open('/etc/passwd')",
            "df.mean(salary); import os",
        ] {
            assert!(matches!(
                run(code, CSV, 10_000),
                Err(StatsError::Grammar(_)) | Err(StatsError::Csv(_))
            ), "{code} must be rejected");
        }
    }

    #[test]
    fn unknown_column_is_reported() {
        assert!(matches!(
            run("df.mean(bonus)", CSV, 10_000),
            Err(StatsError::UnknownColumn(_))
        ));
    }

    #[test]
    fn budget_is_enforced() {
        assert!(matches!(
            run("df.count()", CSV, 1),
            Err(StatsError::Budget)
        ));
    }

    #[test]
    fn quoted_csv_fields() {
        let csv = "name,notes\nAda,\"likes, commas\"\n";
        let frame = Frame::from_csv(csv).unwrap();
        assert_eq!(frame.rows[0][1], Cell::Text("likes, commas".to_string()));
    }

    #[test]
    fn scalar_cannot_be_chained() {
        assert!(matches!(
            run("df.count().sum(age)", CSV, 10_000),
            Err(StatsError::Grammar(_))
        ));
    }
}
