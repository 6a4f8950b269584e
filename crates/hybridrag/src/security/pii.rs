//! Best-effort PII scrubbing for prompts leaving the machine
//!
//! Applied to remote-bound prompts when `security.pii_sanitization` is set.
//! This is pattern-based redaction, not anonymization: email addresses,
//! phone-like numbers and national-id-like patterns are replaced with
//! bracketed placeholders.

use regex::Regex;
use std::sync::OnceLock;

fn email_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}").expect("static regex")
    })
}

fn phone_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\+?\d{1,3}[-. (]{0,2}\d{3}[-. )]{0,2}\d{3}[-. ]?\d{2,4}").expect("static regex")
    })
}

fn national_id_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b\d{3}-\d{2}-\d{4}\b").expect("static regex"))
}

/// Replace likely PII with placeholders
pub fn sanitize_pii(text: &str) -> String {
    let out = email_re().replace_all(text, "[EMAIL]");
    let out = national_id_re().replace_all(&out, "[ID]");
    let out = phone_re().replace_all(&out, "[PHONE]");
    out.into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emails_are_redacted() {
        let out = sanitize_pii("Contact op.chief@example.org for scheduling.");
        assert!(!out.contains("example.org"));
        assert!(out.contains("[EMAIL]"));
    }

    #[test]
    fn id_like_numbers_are_redacted() {
        let out = sanitize_pii("Badge holder 123-45-6789 cleared the site.");
        assert!(out.contains("[ID]"));
        assert!(!out.contains("123-45-6789"));
    }

    #[test]
    fn technical_values_survive() {
        let out = sanitize_pii("The MUF is 14 MHz at 0400 UTC, tolerance ±5%.");
        assert!(out.contains("14 MHz"));
        assert!(out.contains("0400 UTC"));
    }
}
