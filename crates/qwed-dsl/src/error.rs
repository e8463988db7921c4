use thiserror::Error;

/// Every failure mode of the DSL front end. All variants carry the byte
/// offset of the offending input so callers can point at the exact spot.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DslError {
    #[error("unexpected character {ch:?} at byte {offset}")]
    UnexpectedChar { ch: char, offset: usize },

    #[error("unterminated string literal starting at byte {offset}")]
    UnterminatedString { offset: usize },

    #[error("dotted identifier {ident:?} at byte {offset} is not allowed")]
    DottedIdent { ident: String, offset: usize },

    #[error("unbalanced parenthesis at byte {offset}")]
    Unbalanced { offset: usize },

    #[error("empty form at byte {offset}")]
    EmptyForm { offset: usize },

    #[error("trailing input after expression at byte {offset}")]
    TrailingInput { offset: usize },

    #[error("operator {op:?} at byte {offset} is not whitelisted")]
    UnsafeOperator { op: String, offset: usize },

    #[error("operator {op} expects {expected} argument(s), got {got} (byte {offset})")]
    Arity {
        op: String,
        expected: String,
        got: usize,
        offset: usize,
    },

    #[error("form head at byte {offset} must be an operator identifier")]
    BadFormHead { offset: usize },

    #[error("type mismatch at byte {offset}: expected {expected}, found {found}")]
    TypeMismatch {
        expected: String,
        found: String,
        offset: usize,
    },

    #[error("quantifier at byte {offset} needs a parenthesized list of bound variables")]
    BadBinderList { offset: usize },

    #[error("number literal {text:?} at byte {offset} is out of range")]
    NumberRange { text: String, offset: usize },
}

impl DslError {
    /// Stable wire label for the failure class. Whitelist violations map to
    /// `UNSAFE_DSL`; everything else is a plain parse/type failure.
    pub fn wire_code(&self) -> &'static str {
        match self {
            DslError::UnsafeOperator { .. }
            | DslError::DottedIdent { .. }
            | DslError::BadFormHead { .. } => "UNSAFE_DSL",
            DslError::TypeMismatch { .. } => "TYPE_ERROR",
            _ => "PARSE_ERROR",
        }
    }

    pub fn offset(&self) -> usize {
        match self {
            DslError::UnexpectedChar { offset, .. }
            | DslError::UnterminatedString { offset }
            | DslError::DottedIdent { offset, .. }
            | DslError::Unbalanced { offset }
            | DslError::EmptyForm { offset }
            | DslError::TrailingInput { offset }
            | DslError::UnsafeOperator { offset, .. }
            | DslError::Arity { offset, .. }
            | DslError::BadFormHead { offset }
            | DslError::TypeMismatch { offset, .. }
            | DslError::BadBinderList { offset }
            | DslError::NumberRange { offset, .. } => *offset,
        }
    }
}
