//! Compiled extraction patterns for fiscal documents.
//!
//! Code patterns come in pairs: a keyword-anchored contextual pattern tried
//! first, and a looser fallback used only when the contextual one finds
//! nothing.

#![allow(clippy::expect_used)]

use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    // CFOP: tax-operation code, four digits, often written as 5.102
    pub static ref CFOP_CONTEXTUAL: Regex =
        Regex::new(r"(?i)\bCFOP\b[^\d\n]{0,20}(\d(?:\.?\d){2,4})")
            .expect("constant regex pattern is valid");
    pub static ref CFOP_FALLBACK: Regex =
        Regex::new(r"\b([1-7]\.\d{3})\b").expect("constant regex pattern is valid");

    // CST: tax-situation code, two or three digits
    pub static ref CST_CONTEXTUAL: Regex =
        Regex::new(r"(?i)\b(?:CST|CSOSN)\b[^\d\n]{0,20}(\d{1,5})")
            .expect("constant regex pattern is valid");
    pub static ref CST_FALLBACK: Regex =
        Regex::new(r"(?i)situa[çc][ãa]o\s+tribut[áa]ria[^\d\n]{0,20}(\d{1,5})")
            .expect("constant regex pattern is valid");

    // NCM: merchandise classification, eight digits, often 8471.30.12
    pub static ref NCM_CONTEXTUAL: Regex =
        Regex::new(r"(?i)\bNCM(?:/SH)?\b[^\d\n]{0,20}(\d(?:[\d.]{0,12}\d)?)")
            .expect("constant regex pattern is valid");
    pub static ref NCM_FALLBACK: Regex =
        Regex::new(r"\b(\d{4}\.\d{2}\.\d{2})\b").expect("constant regex pattern is valid");

    // ICMS labeled fields
    pub static ref ICMS_BASE: Regex = Regex::new(
        r"(?i)base\s*(?:de\s+)?c[áa]lculo\s*(?:do\s+)?icms[^\d\n]{0,20}(\d[\d.,]*)"
    )
    .expect("constant regex pattern is valid");
    pub static ref ICMS_RATE: Regex = Regex::new(
        r"(?i)al[íi]quota\s*(?:(?:do|de)\s+)?(?:icms)?[^\d\n]{0,20}(\d[\d.,]*)"
    )
    .expect("constant regex pattern is valid");
    pub static ref ICMS_VALUE: Regex =
        Regex::new(r"(?i)valor\s*(?:do\s+)?icms[^\d\n]{0,20}(\d[\d.,]*)")
            .expect("constant regex pattern is valid");

    // Document-level fields
    pub static ref INVOICE_TOTAL: Regex = Regex::new(
        r"(?i)valor\s+total\s*(?:da\s+)?(?:nota|nf-?e?)?[^\d\n]{0,20}(\d[\d.,]*)"
    )
    .expect("constant regex pattern is valid");
    pub static ref CNPJ: Regex =
        Regex::new(r"\b(\d{2}\.?\d{3}\.?\d{3}/?\d{4}-?\d{2})\b")
            .expect("constant regex pattern is valid");

    // Code format rules
    pub static ref CFOP_FORMAT: Regex =
        Regex::new(r"^[1-7]\d{3}$").expect("constant regex pattern is valid");
    pub static ref CST_FORMAT: Regex =
        Regex::new(r"^\d{2,3}$").expect("constant regex pattern is valid");
    pub static ref NCM_FORMAT: Regex =
        Regex::new(r"^\d{8}$").expect("constant regex pattern is valid");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contextual_cfop_accepts_dotted_form() {
        let caps = CFOP_CONTEXTUAL.captures("CFOP: 5.102 Venda").unwrap();
        assert_eq!(&caps[1], "5.102");
    }

    #[test]
    fn test_rate_with_and_without_icms_label() {
        let caps = ICMS_RATE.captures("Alíquota ICMS: 18%").unwrap();
        assert_eq!(&caps[1], "18");
        let caps = ICMS_RATE.captures("Aliquota: 12,5 %").unwrap();
        assert_eq!(&caps[1], "12,5");
    }

    #[test]
    fn test_icms_value_does_not_match_base_label() {
        assert!(ICMS_VALUE
            .captures("Base de Cálculo do ICMS: 1.000,00")
            .is_none());
        let caps = ICMS_BASE.captures("Base de Cálculo do ICMS: 1.000,00").unwrap();
        assert_eq!(&caps[1], "1.000,00");
    }

    #[test]
    fn test_format_rules() {
        assert!(CFOP_FORMAT.is_match("5102"));
        assert!(!CFOP_FORMAT.is_match("8102"));
        assert!(CST_FORMAT.is_match("060"));
        assert!(!CST_FORMAT.is_match("1"));
        assert!(NCM_FORMAT.is_match("84713012"));
    }
}
