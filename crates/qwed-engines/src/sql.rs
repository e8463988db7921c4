//! SQL safety checker.
//!
//! The checker is structural, not a full dialect parser: statements are
//! split with quote- and comment-awareness, the leading keyword is matched
//! against an allow list, referenced tables and columns are resolved against
//! the declared schema, and classic injection shapes are flagged.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SqlViolation {
    MultipleStatements,
    DangerousStatement { statement: String },
    StatementNotAllowed { statement: String },
    UnknownTable { table: String },
    UnknownColumn { column: String },
    InjectionPattern { pattern: String },
    EmptyQuery,
}

impl fmt::Display for SqlViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SqlViolation::MultipleStatements => write!(f, "MULTIPLE_STATEMENTS"),
            SqlViolation::DangerousStatement { statement } => {
                write!(f, "DANGEROUS_STATEMENT({statement})")
            }
            SqlViolation::StatementNotAllowed { statement } => {
                write!(f, "STATEMENT_NOT_ALLOWED({statement})")
            }
            SqlViolation::UnknownTable { table } => write!(f, "UNKNOWN_TABLE({table})"),
            SqlViolation::UnknownColumn { column } => write!(f, "UNKNOWN_COLUMN({column})"),
            SqlViolation::InjectionPattern { pattern } => {
                write!(f, "INJECTION_PATTERN({pattern})")
            }
            SqlViolation::EmptyQuery => write!(f, "EMPTY_QUERY"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SqlReport {
    pub safe: bool,
    pub statements: usize,
    pub violations: Vec<SqlViolation>,
}

/// Declared schema: table name → ordered column set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Schema {
    tables: BTreeMap<String, BTreeSet<String>>,
}

impl Schema {
    /// Parse the `users(id,name,email); orders(id,total)` declaration form.
    pub fn parse(decl: &str) -> Schema {
        static TABLE_RE: Lazy<Regex> = Lazy::new(|| {
            Regex::new(r"(?P<table>[A-Za-z_][A-Za-z0-9_]*)\s*\((?P<cols>[^)]*)\)")
                .expect("static regex")
        });
        let mut tables = BTreeMap::new();
        for caps in TABLE_RE.captures_iter(decl) {
            let cols = caps["cols"]
                .split(',')
                .map(|c| c.trim().to_lowercase())
                .filter(|c| !c.is_empty())
                .collect();
            tables.insert(caps["table"].to_lowercase(), cols);
        }
        Schema { tables }
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    fn has_table(&self, name: &str) -> bool {
        self.tables.contains_key(&name.to_lowercase())
    }

    fn has_column(&self, tables: &[String], column: &str) -> bool {
        let column = column.to_lowercase();
        tables.iter().any(|t| {
            self.tables
                .get(&t.to_lowercase())
                .map(|cols| cols.contains(&column))
                .unwrap_or(false)
        })
    }
}

const DANGEROUS: &[&str] = &[
    "DROP", "DELETE", "TRUNCATE", "UPDATE", "ALTER", "GRANT", "REVOKE", "INSERT", "CREATE",
];

const SQL_KEYWORDS: &[&str] = &[
    "select", "from", "where", "and", "or", "not", "in", "is", "null", "like", "between",
    "group", "by", "order", "asc", "desc", "limit", "offset", "having", "join", "inner",
    "left", "right", "outer", "on", "as", "distinct", "union", "all", "case", "when",
    "then", "else", "end", "exists", "cast", "true", "false",
];

const SQL_FUNCTIONS: &[&str] = &[
    "count", "sum", "avg", "min", "max", "coalesce", "lower", "upper", "length", "round",
    "abs", "substr", "trim", "now", "date",
];

static INJECTION_PATTERNS: &[(&str, &str)] = &[
    (r"(?i)'\s*OR\s*'[^']*'\s*=\s*'", "OR_TAUTOLOGY"),
    (r"(?i)\bOR\s+1\s*=\s*1\b", "OR_TAUTOLOGY"),
    (r"(?i)\bUNION\s+(ALL\s+)?SELECT\b", "UNION_SELECT"),
    (r"(?i);\s*DROP\b", "CHAINED_DROP"),
    (r"'\s*;\s*--", "COMMENT_TAIL"),
];

/// Check one query against the allow list and declared schema.
pub fn verify_sql(query: &str, schema: &Schema, allowed: &[&str]) -> SqlReport {
    let mut violations = Vec::new();

    let statements = split_statements(query);
    if statements.is_empty() {
        return SqlReport {
            safe: false,
            statements: 0,
            violations: vec![SqlViolation::EmptyQuery],
        };
    }
    if statements.len() > 1 {
        violations.push(SqlViolation::MultipleStatements);
    }

    static PATTERNS: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
        INJECTION_PATTERNS
            .iter()
            .map(|(pattern, label)| (Regex::new(pattern).expect("static regex"), *label))
            .collect()
    });
    for (regex, label) in PATTERNS.iter() {
        if regex.is_match(query) {
            violations.push(SqlViolation::InjectionPattern {
                pattern: (*label).to_string(),
            });
        }
    }

    for statement in &statements {
        let keyword = leading_keyword(statement);
        if DANGEROUS.contains(&keyword.as_str()) && !allowed.contains(&keyword.as_str()) {
            violations.push(SqlViolation::DangerousStatement {
                statement: keyword.clone(),
            });
            continue;
        }
        if !allowed.contains(&keyword.as_str()) {
            violations.push(SqlViolation::StatementNotAllowed {
                statement: keyword.clone(),
            });
            continue;
        }
        if !schema.is_empty() {
            check_schema(statement, schema, &mut violations);
        }
    }

    SqlReport {
        safe: violations.is_empty(),
        statements: statements.len(),
        violations,
    }
}

/// Split on `;` outside quotes and comments; empty segments are dropped.
fn split_statements(query: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut chars = query.chars().peekable();
    let mut in_single = false;
    let mut in_double = false;
    let mut in_line_comment = false;
    let mut in_block_comment = false;

    while let Some(c) = chars.next() {
        if in_line_comment {
            if c == '\n' {
                in_line_comment = false;
            }
            continue;
        }
        if in_block_comment {
            if c == '*' && chars.peek() == Some(&'/') {
                chars.next();
                in_block_comment = false;
            }
            continue;
        }
        match c {
            '\'' if !in_double => {
                in_single = !in_single;
                current.push(c);
            }
            '"' if !in_single => {
                in_double = !in_double;
                current.push(c);
            }
            '-' if !in_single && !in_double && chars.peek() == Some(&'-') => {
                chars.next();
                in_line_comment = true;
            }
            '/' if !in_single && !in_double && chars.peek() == Some(&'*') => {
                chars.next();
                in_block_comment = true;
            }
            ';' if !in_single && !in_double => {
                if !current.trim().is_empty() {
                    out.push(current.trim().to_string());
                }
                current.clear();
            }
            _ => current.push(c),
        }
    }
    if !current.trim().is_empty() {
        out.push(current.trim().to_string());
    }
    out
}

fn leading_keyword(statement: &str) -> String {
    statement
        .split_whitespace()
        .next()
        .unwrap_or("")
        .trim_start_matches('(')
        .to_uppercase()
}

fn check_schema(statement: &str, schema: &Schema, violations: &mut Vec<SqlViolation>) {
    static FROM_RE: Lazy<Regex> = Lazy::new(|| {
        Regex::new(r"(?i)\b(?:FROM|JOIN)\s+(?P<table>[A-Za-z_][A-Za-z0-9_]*)")
            .expect("static regex")
    });
    static IDENT_RE: Lazy<Regex> = Lazy::new(|| {
        Regex::new(r"(?:(?P<qual>[A-Za-z_][A-Za-z0-9_]*)\.)?(?P<name>[A-Za-z_][A-Za-z0-9_]*)")
            .expect("static regex")
    });

    let mut tables: Vec<String> = Vec::new();
    for caps in FROM_RE.captures_iter(statement) {
        let table = caps["table"].to_string();
        if !schema.has_table(&table) {
            violations.push(SqlViolation::UnknownTable {
                table: table.clone(),
            });
        }
        tables.push(table);
    }

    // Column references live in the select list and the WHERE/ORDER tail.
    let upper = statement.to_uppercase();
    let select_list = match (upper.find("SELECT"), upper.find("FROM")) {
        (Some(s), Some(f)) if f > s => &statement[s + 6..f],
        _ => "",
    };
    let tail = upper
        .find("WHERE")
        .map(|w| &statement[w + 5..])
        .unwrap_or("");

    for segment in [select_list, tail] {
        let cleaned = strip_string_literals(segment);
        for caps in IDENT_RE.captures_iter(&cleaned) {
            let name = &caps["name"];
            let lower = name.to_lowercase();
            if name == "*"
                || SQL_KEYWORDS.contains(&lower.as_str())
                || SQL_FUNCTIONS.contains(&lower.as_str())
                || lower.chars().all(|c| c.is_ascii_digit())
            {
                continue;
            }
            if let Some(qualifier) = caps.name("qual") {
                let qualifier = qualifier.as_str().to_string();
                if !schema.has_table(&qualifier) {
                    violations.push(SqlViolation::UnknownTable { table: qualifier });
                    continue;
                }
                if !schema.has_column(&[qualifier], name) {
                    violations.push(SqlViolation::UnknownColumn {
                        column: name.to_string(),
                    });
                }
            } else if !tables.is_empty() && !schema.has_column(&tables, name) {
                violations.push(SqlViolation::UnknownColumn {
                    column: name.to_string(),
                });
            }
        }
    }
    violations.dedup();
}

fn strip_string_literals(segment: &str) -> String {
    let mut out = String::with_capacity(segment.len());
    let mut in_single = false;
    for c in segment.chars() {
        match c {
            '\'' => in_single = !in_single,
            _ if in_single => {}
            _ => out.push(c),
        }
    }
    out
}

pub const DEFAULT_ALLOWED: &[&str] = &["SELECT"];

#[cfg(test)]
mod tests {
    use super::*;

    fn users_schema() -> Schema {
        Schema::parse("users(id,name,email)")
    }

    #[test]
    fn plain_select_is_safe() {
        let report = verify_sql(
            "SELECT id, name FROM users WHERE email = 'a@b.c'",
            &users_schema(),
            DEFAULT_ALLOWED,
        );
        assert!(report.safe, "violations: {:?}", report.violations);
    }

    #[test]
    fn stacked_drop_is_flagged_twice() {
        let report = verify_sql(
            "SELECT * FROM users; DROP TABLE users;--",
            &users_schema(),
            DEFAULT_ALLOWED,
        );
        assert!(!report.safe);
        assert!(report.violations.contains(&SqlViolation::MultipleStatements));
        assert!(report.violations.contains(&SqlViolation::DangerousStatement {
            statement: "DROP".into()
        }));
    }

    #[test]
    fn union_select_injection() {
        let report = verify_sql(
            "SELECT name FROM users WHERE id = 1 UNION SELECT password FROM admins",
            &users_schema(),
            DEFAULT_ALLOWED,
        );
        assert!(report
            .violations
            .iter()
            .any(|v| matches!(v, SqlViolation::InjectionPattern { .. })));
    }

    #[test]
    fn or_tautology_injection() {
        let report = verify_sql(
            "SELECT * FROM users WHERE name = '' OR '1'='1'",
            &users_schema(),
            DEFAULT_ALLOWED,
        );
        assert!(report
            .violations
            .iter()
            .any(|v| matches!(v, SqlViolation::InjectionPattern { .. })));
    }

    #[test]
    fn unknown_table_and_column() {
        let report = verify_sql(
            "SELECT nickname FROM accounts",
            &users_schema(),
            DEFAULT_ALLOWED,
        );
        assert!(report
            .violations
            .contains(&SqlViolation::UnknownTable {
                table: "accounts".into()
            }));
    }

    #[test]
    fn unknown_column_on_known_table() {
        let report = verify_sql(
            "SELECT shoe_size FROM users",
            &users_schema(),
            DEFAULT_ALLOWED,
        );
        assert!(report
            .violations
            .contains(&SqlViolation::UnknownColumn {
                column: "shoe_size".into()
            }));
    }

    #[test]
    fn update_not_in_whitelist() {
        let report = verify_sql(
            "UPDATE users SET name = 'x'",
            &users_schema(),
            DEFAULT_ALLOWED,
        );
        assert!(report
            .violations
            .contains(&SqlViolation::DangerousStatement {
                statement: "UPDATE".into()
            }));
    }

    #[test]
    fn semicolon_inside_string_is_one_statement() {
        let report = verify_sql(
            "SELECT name FROM users WHERE email = 'a;b@c.d'",
            &users_schema(),
            DEFAULT_ALLOWED,
        );
        assert_eq!(report.statements, 1);
        assert!(!report
            .violations
            .contains(&SqlViolation::MultipleStatements));
    }

    #[test]
    fn empty_query() {
        let report = verify_sql("   ", &users_schema(), DEFAULT_ALLOWED);
        assert!(report.violations.contains(&SqlViolation::EmptyQuery));
    }
}
