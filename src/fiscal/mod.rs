//! Fiscal validation engine
//!
//! Deterministic, side-effect-free extraction and consistency checking of
//! tax fields from raw document text. No LLM involvement.

pub mod patterns;

use regex::Regex;
use serde::{Deserialize, Serialize};

use patterns::{
    CFOP_CONTEXTUAL, CFOP_FALLBACK, CFOP_FORMAT, CNPJ, CST_CONTEXTUAL, CST_FALLBACK, CST_FORMAT,
    ICMS_BASE, ICMS_RATE, ICMS_VALUE, INVOICE_TOTAL, NCM_CONTEXTUAL, NCM_FALLBACK, NCM_FORMAT,
};

/// Relative tolerance on the expected ICMS value
const ICMS_RELATIVE_TOLERANCE: f64 = 0.02;
/// Absolute tolerance floor, in currency units
const ICMS_MIN_TOLERANCE: f64 = 1.0;

/// Absorbs binary representation noise at the tolerance boundary
const FLOAT_EPSILON: f64 = 1e-9;

//
// ================= Output Types =================
//

/// Candidate tax codes found in a document, de-duplicated in order of appearance
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ExtractedCodes {
    pub cfops: Vec<String>,
    pub csts: Vec<String>,
    pub ncms: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IcmsFields {
    pub base: Option<f64>,
    pub rate: Option<f64>,
    pub reported: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IcmsAssessment {
    pub expected: Option<f64>,
    pub difference: Option<f64>,
    pub consistent: Option<bool>,
}

/// Per-document fiscal check
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FiscalCheckSummary {
    pub document: String,
    pub cfops: Vec<String>,
    pub csts: Vec<String>,
    pub ncms: Vec<String>,
    pub invalid_cfops: Vec<String>,
    pub invalid_csts: Vec<String>,
    pub invalid_ncms: Vec<String>,
    pub icms_base: Option<f64>,
    pub icms_rate: Option<f64>,
    pub icms_reported: Option<f64>,
    pub icms_expected: Option<f64>,
    pub icms_difference: Option<f64>,
    pub icms_consistent: Option<bool>,
    pub observations: Vec<String>,
}

impl FiscalCheckSummary {
    pub fn is_flagged(&self) -> bool {
        !self.observations.is_empty()
    }
}

/// Batch-level aggregate over per-document checks
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FiscalBatchSummary {
    pub documents: usize,
    pub missing_cfop: usize,
    pub missing_cst: usize,
    pub missing_ncm: usize,
    pub invalid_cfop: usize,
    pub invalid_cst: usize,
    pub invalid_ncm: usize,
    pub icms_consistent: usize,
    pub icms_inconsistent: usize,
    pub icms_undetermined: usize,
    pub flagged_documents: usize,
}

//
// ================= Parsing =================
//

/// Parse a localized numeric string (`.` thousands, `,` decimal).
///
/// Returns `None` on anything that does not parse to a finite number.
pub fn parse_localized_number(raw: &str) -> Option<f64> {
    let cleaned: String = raw
        .trim()
        .trim_start_matches("R$")
        .trim()
        .trim_end_matches(|c| c == '.' || c == ',')
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect();

    if cleaned.is_empty() {
        return None;
    }

    let normalized = cleaned.replace('.', "").replace(',', ".");
    normalized.parse::<f64>().ok().filter(|v| v.is_finite())
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn digits_only(raw: &str) -> String {
    raw.chars().filter(|c| c.is_ascii_digit()).collect()
}

fn push_unique(into: &mut Vec<String>, value: String) {
    if !value.is_empty() && !into.contains(&value) {
        into.push(value);
    }
}

/// Contextual pattern first; the fallback only runs when it finds nothing.
fn extract_with_fallback(text: &str, contextual: &Regex, fallback: &Regex) -> Vec<String> {
    let mut found = Vec::new();
    for caps in contextual.captures_iter(text) {
        push_unique(&mut found, digits_only(&caps[1]));
    }

    if found.is_empty() {
        for caps in fallback.captures_iter(text) {
            push_unique(&mut found, digits_only(&caps[1]));
        }
    }

    found
}

fn first_number(text: &str, pattern: &Regex) -> Option<f64> {
    pattern
        .captures_iter(text)
        .find_map(|caps| parse_localized_number(&caps[1]))
}

//
// ================= Extraction =================
//

pub fn extract_codes(text: &str) -> ExtractedCodes {
    ExtractedCodes {
        cfops: extract_with_fallback(text, &CFOP_CONTEXTUAL, &CFOP_FALLBACK),
        csts: extract_with_fallback(text, &CST_CONTEXTUAL, &CST_FALLBACK),
        ncms: extract_with_fallback(text, &NCM_CONTEXTUAL, &NCM_FALLBACK),
    }
}

pub fn extract_icms_fields(text: &str) -> IcmsFields {
    IcmsFields {
        base: first_number(text, &ICMS_BASE),
        rate: first_number(text, &ICMS_RATE),
        reported: first_number(text, &ICMS_VALUE),
    }
}

/// Distinct 14-digit CNPJ identifiers
pub fn extract_cnpjs(text: &str) -> Vec<String> {
    let mut found = Vec::new();
    for caps in CNPJ.captures_iter(text) {
        let digits = digits_only(&caps[1]);
        if digits.len() == 14 {
            push_unique(&mut found, digits);
        }
    }
    found
}

pub fn extract_invoice_total(text: &str) -> Option<f64> {
    first_number(text, &INVOICE_TOTAL)
}

//
// ================= Consistency =================
//

/// ICMS rule: expected = round(base * rate / 100, 2); consistent when
/// |expected - reported| <= max(1, expected * 2%).
pub fn assess_icms(fields: &IcmsFields) -> IcmsAssessment {
    let (Some(base), Some(rate)) = (fields.base, fields.rate) else {
        return IcmsAssessment::default();
    };

    let expected = round2(base * rate / 100.0);

    let Some(reported) = fields.reported else {
        return IcmsAssessment {
            expected: Some(expected),
            ..IcmsAssessment::default()
        };
    };

    // compare the raw difference; only the stored value is rounded
    let difference = (expected - reported).abs();
    let tolerance = ICMS_MIN_TOLERANCE.max(expected * ICMS_RELATIVE_TOLERANCE);

    IcmsAssessment {
        expected: Some(expected),
        difference: Some(round2(difference)),
        consistent: Some(difference <= tolerance + FLOAT_EPSILON),
    }
}

fn split_by_format(values: &[String], format: &Regex) -> (Vec<String>, Vec<String>) {
    values
        .iter()
        .cloned()
        .partition(|value| format.is_match(value))
}

/// Run every check against one document
pub fn check_document(name: &str, text: &str) -> FiscalCheckSummary {
    let codes = extract_codes(text);
    let fields = extract_icms_fields(text);
    let assessment = assess_icms(&fields);

    let (cfops, invalid_cfops) = split_by_format(&codes.cfops, &CFOP_FORMAT);
    let (csts, invalid_csts) = split_by_format(&codes.csts, &CST_FORMAT);
    let (ncms, invalid_ncms) = split_by_format(&codes.ncms, &NCM_FORMAT);

    let mut observations = Vec::new();

    for (label, found, invalid) in [
        ("CFOP", &codes.cfops, &invalid_cfops),
        ("CST", &codes.csts, &invalid_csts),
        ("NCM", &codes.ncms, &invalid_ncms),
    ] {
        if found.is_empty() {
            observations.push(format!("{} not found in document", label));
        } else if !invalid.is_empty() {
            observations.push(format!(
                "{} with invalid format: {}",
                label,
                invalid.join(", ")
            ));
        }
    }

    match (assessment.consistent, assessment.expected, assessment.difference) {
        (Some(false), Some(expected), Some(difference)) => {
            observations.push(format!(
                "ICMS divergence: expected {:.2}, reported {:.2} (difference {:.2})",
                expected,
                fields.reported.unwrap_or_default(),
                difference
            ));
        }
        (None, _, _) => {
            let mut missing = Vec::new();
            if fields.base.is_none() {
                missing.push("base");
            }
            if fields.rate.is_none() {
                missing.push("rate");
            }
            if fields.reported.is_none() {
                missing.push("reported value");
            }
            observations.push(format!(
                "Incomplete ICMS data for determination (missing {})",
                missing.join(", ")
            ));
        }
        _ => {}
    }

    FiscalCheckSummary {
        document: name.to_string(),
        cfops,
        csts,
        ncms,
        invalid_cfops,
        invalid_csts,
        invalid_ncms,
        icms_base: fields.base,
        icms_rate: fields.rate,
        icms_reported: fields.reported,
        icms_expected: assessment.expected,
        icms_difference: assessment.difference,
        icms_consistent: assessment.consistent,
        observations,
    }
}

/// Sum per-document flags into batch totals
pub fn aggregate(summaries: &[FiscalCheckSummary]) -> FiscalBatchSummary {
    summaries
        .iter()
        .fold(FiscalBatchSummary::default(), |mut batch, doc| {
            batch.documents += 1;

            let count = |values: &Vec<String>| usize::from(!values.is_empty());

            batch.invalid_cfop += count(&doc.invalid_cfops);
            batch.invalid_cst += count(&doc.invalid_csts);
            batch.invalid_ncm += count(&doc.invalid_ncms);

            batch.missing_cfop += usize::from(doc.cfops.is_empty() && doc.invalid_cfops.is_empty());
            batch.missing_cst += usize::from(doc.csts.is_empty() && doc.invalid_csts.is_empty());
            batch.missing_ncm += usize::from(doc.ncms.is_empty() && doc.invalid_ncms.is_empty());

            match doc.icms_consistent {
                Some(true) => batch.icms_consistent += 1,
                Some(false) => batch.icms_inconsistent += 1,
                None => batch.icms_undetermined += 1,
            }

            batch.flagged_documents += usize::from(doc.is_flagged());
            batch
        })
}

//
// ================= Tests =================
//
