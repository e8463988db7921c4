//! PII redaction for the audit path.
//!
//! Applied to anything serialized into audit or security-event rows. The
//! live request is never mutated.

use once_cell::sync::Lazy;
use regex::Regex;

static EMAIL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)[A-Z0-9._%+-]+@[A-Z0-9.-]+\.[A-Z]{2,}").expect("static regex")
});
static PHONE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\+?\d[\d\s().-]{7,}\d").expect("static regex")
});
static NATIONAL_ID_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b\d{3}-\d{2}-\d{4}\b|\b[A-Z]{2}\d{6,9}\b").expect("static regex")
});

/// Replace email-, phone-, and national-id-like tokens with `[REDACTED]`.
pub fn redact(text: &str) -> String {
    let masked = EMAIL_RE.replace_all(text, "[REDACTED]");
    let masked = PHONE_RE.replace_all(&masked, "[REDACTED]");
    NATIONAL_ID_RE.replace_all(&masked, "[REDACTED]").into_owned()
}

pub fn contains_pii(text: &str) -> bool {
    EMAIL_RE.is_match(text) || PHONE_RE.is_match(text) || NATIONAL_ID_RE.is_match(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masks_email() {
        let out = redact("reach me at ada@example.com please");
        assert!(!out.contains("ada@example.com"));
        assert!(out.contains("[REDACTED]"));
    }

    #[test]
    fn masks_phone() {
        let out = redact("call +1 (415) 555-0101 today");
        assert!(!out.contains("555-0101"));
    }

    #[test]
    fn masks_ssn_shape() {
        let out = redact("ssn 123-45-6789 on file");
        assert!(!out.contains("123-45-6789"));
    }

    #[test]
    fn plain_text_unchanged() {
        assert_eq!(redact("what is 15% of 200?"), "what is 15% of 200?");
    }
}
