//! Header normalization and ICCID cleaning
//!
//! Operator-supplied spreadsheets carry the same column under many spellings
//! ("Fecha De Activación ", "fecha_de_activacion", "FECHA-DE-ACTIVACION").
//! Everything downstream works on the canonical token produced here.

use anyhow::{anyhow, Result};
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

/// Normalize a header into its canonical token: lowercase, trimmed,
/// accent-folded, with spaces/dashes/dots/tabs collapsed to single
/// underscores. Idempotent: `normalize_header(normalize_header(x)) ==
/// normalize_header(x)`.
pub fn normalize_header(header: &str) -> String {
    let folded: String = header.nfd().filter(|c| !is_combining_mark(*c)).collect();

    let mut out = String::with_capacity(folded.len());
    let mut pending_underscore = false;
    for ch in folded.trim().chars().flat_map(|c| c.to_lowercase()) {
        match ch {
            ' ' | '-' | '.' | '\t' | '_' => pending_underscore = !out.is_empty(),
            c => {
                if pending_underscore {
                    out.push('_');
                    pending_underscore = false;
                }
                out.push(c);
            }
        }
    }
    out
}

/// Canonical token with underscores removed, for the loose comparisons the
/// type detector performs ("numero_de_telefono" vs "numerodetelefono")
pub fn squash_token(token: &str) -> String {
    token.chars().filter(|c| *c != '_').collect()
}

/// Clean and validate a raw ICCID cell.
///
/// Canonical ICCIDs are at most 20 digits. Some operator exports pad the
/// value with 2 leading and 1 trailing junk digit; those are stripped.
/// Short values are rejected rather than guessed at.
pub fn clean_iccid(raw: &str) -> Result<String> {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();

    if digits.len() > 20 {
        let stripped = &digits[2..digits.len() - 1];
        if (18..=20).contains(&stripped.len()) {
            return Ok(stripped.to_string());
        }
        return Err(anyhow!(
            "ICCID '{}' has unexpected length {}",
            raw,
            digits.len()
        ));
    }

    if (18..=20).contains(&digits.len()) {
        return Ok(digits);
    }

    Err(anyhow!(
        "ICCID '{}' is not a full-length identifier ({} digits)",
        raw,
        digits.len()
    ))
}
