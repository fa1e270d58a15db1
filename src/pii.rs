//! Deterministic PII masking.
//!
//! Applied at every boundary that leaves the process: LLM prompts, payload
//! logging and export rendering. Substitutions are fixed opaque tags so the
//! masked text is stable across calls.

use std::sync::OnceLock;

use regex::Regex;

const CPF_TAG: &str = "[CPF]";
const CNPJ_TAG: &str = "[CNPJ]";
const EMAIL_TAG: &str = "[EMAIL]";
const PHONE_TAG: &str = "[PHONE]";

struct Patterns {
    cpf: Regex,
    cnpj: Regex,
    email: Regex,
    phones: Vec<Regex>,
}

fn patterns() -> &'static Patterns {
    static PATTERNS: OnceLock<Patterns> = OnceLock::new();
    PATTERNS.get_or_init(|| Patterns {
        // 123.456.789-01 and bare 11-digit runs
        cpf: Regex::new(r"\b\d{3}\.\d{3}\.\d{3}-\d{2}\b").expect("cpf pattern"),
        // 12.345.678/0001-90
        cnpj: Regex::new(r"\b\d{2}\.\d{3}\.\d{3}/\d{4}-\d{2}\b").expect("cnpj pattern"),
        email: Regex::new(r"[A-Za-z0-9._%+\-]+@[A-Za-z0-9.\-]+\.[A-Za-z]{2,}")
            .expect("email pattern"),
        phones: vec![
            // +55 11 99999-9999 / +5511999999999
            Regex::new(r"\+\d{2}\s?\(?\d{2}\)?\s?9?\d{4}[\s\-]?\d{4}").expect("intl phone"),
            // (11) 99999-9999
            Regex::new(r"\(\d{2}\)\s?9?\d{4}-\d{4}").expect("br phone"),
            // bare 10-13 digit runs (wa_id style)
            Regex::new(r"\b\d{10,13}\b").expect("bare phone"),
        ],
    })
}

/// Mask CPF, CNPJ, email and phone substrings with fixed tags.
pub fn mask_text(text: &str) -> String {
    let p = patterns();
    let mut out = p.cnpj.replace_all(text, CNPJ_TAG).into_owned();
    out = p.cpf.replace_all(&out, CPF_TAG).into_owned();
    out = p.email.replace_all(&out, EMAIL_TAG).into_owned();
    for phone in &p.phones {
        out = phone.replace_all(&out, PHONE_TAG).into_owned();
    }
    out
}

/// Mask a history slice for LLM context: last `limit` entries, masked text.
pub fn mask_history(entries: &[String], limit: usize) -> Vec<String> {
    let start = entries.len().saturating_sub(limit);
    entries[start..].iter().map(|e| mask_text(e)).collect()
}

/// Keep only the last 4 digits of a phone number for logging.
pub fn redact_phone(phone: &str) -> String {
    let digits: Vec<char> = phone.chars().filter(char::is_ascii_digit).collect();
    if digits.len() <= 4 {
        return "***".to_string();
    }
    let tail: String = digits[digits.len() - 4..].iter().collect();
    format!("***{tail}")
}

/// True when the text still contains any maskable pattern. Used by tests and
/// by the pipeline's defense-in-depth assertion before prompts leave the
/// process.
pub fn contains_pii(text: &str) -> bool {
    let p = patterns();
    p.cpf.is_match(text)
        || p.cnpj.is_match(text)
        || p.email.is_match(text)
        || p.phones.iter().any(|r| r.is_match(text))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masks_cpf() {
        let masked = mask_text("meu cpf é 123.456.789-01, ok?");
        assert!(masked.contains("[CPF]"));
        assert!(!masked.contains("123.456.789-01"));
    }

    #[test]
    fn masks_cnpj() {
        let masked = mask_text("cnpj 12.345.678/0001-90");
        assert!(masked.contains("[CNPJ]"));
        assert!(!masked.contains("0001-90"));
    }

    #[test]
    fn masks_email() {
        let masked = mask_text("fale com joao.silva@example.com.br");
        assert!(masked.contains("[EMAIL]"));
        assert!(!masked.contains("@example"));
    }

    #[test]
    fn masks_br_phone_formats() {
        for text in [
            "liga no (11) 99999-9999",
            "meu zap +55 11 98888-7777",
            "número 5511999999999",
        ] {
            let masked = mask_text(text);
            assert!(masked.contains("[PHONE]"), "not masked: {masked}");
            assert!(!contains_pii(&masked), "still has pii: {masked}");
        }
    }

    #[test]
    fn masked_output_is_stable() {
        let text = "cpf 123.456.789-01 email a@b.com";
        assert_eq!(mask_text(text), mask_text(text));
    }

    #[test]
    fn plain_text_untouched() {
        assert_eq!(mask_text("Olá, tudo bem?"), "Olá, tudo bem?");
    }

    #[test]
    fn history_is_truncated_to_limit() {
        let entries: Vec<String> = (0..10).map(|i| format!("msg {i}")).collect();
        let masked = mask_history(&entries, 5);
        assert_eq!(masked.len(), 5);
        assert_eq!(masked[0], "msg 5");
    }

    #[test]
    fn redact_phone_keeps_last_four() {
        assert_eq!(redact_phone("+5511999998888"), "***8888");
        assert_eq!(redact_phone("123"), "***");
    }

    #[test]
    fn contains_pii_detects_masked_state() {
        assert!(contains_pii("call 5511999999999"));
        assert!(!contains_pii("call [PHONE]"));
    }
}
