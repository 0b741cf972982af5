//! Import type detection
//!
//! Classifies a spreadsheet by its header row. Each import type carries a
//! rule set over canonical column names; a file matching zero or more than
//! one type is a classification failure surfaced to the uploader, never a
//! silent default.

use crate::db::ImportType;
use crate::error::ImportError;
use crate::importers::headers::{normalize_header, squash_token};
use tracing::{debug, info};

/// Detection rules for one import type
enum DetectionRule {
    /// Loose threshold matching, tolerant of operator header drift
    Thresholds {
        required: &'static [&'static str],
        min_required: usize,
        optional: &'static [&'static str],
        min_optional: usize,
        exclude: &'static [&'static str],
    },
    /// Every listed header must be present. Used where the domain is small
    /// and drift-free, so stricter matching is safe.
    ExactSet { all_of: &'static [&'static str] },
}

fn rule_for(import_type: ImportType) -> DetectionRule {
    match import_type {
        ImportType::OperatorReport => DetectionRule::Thresholds {
            required: &["iccid", "comision_pagada_80", "comision_pagada_20"],
            min_required: 2,
            optional: &[
                "recarga",
                "porcentaje_pago",
                "codigo_ciudad",
                "numero_de_telefono",
            ],
            min_optional: 1,
            exclude: &[],
        },
        ImportType::Recharge => DetectionRule::Thresholds {
            required: &["iccid", "importe", "fecha_recarga"],
            min_required: 2,
            optional: &["numero_de_telefono", "operador"],
            min_optional: 1,
            // Sales-condition files also carry a phone column, and operator
            // reports carry a RECARGA column; these markers tell them apart.
            exclude: &["idpos", "residual", "comision"],
        },
        ImportType::SalesCondition => DetectionRule::ExactSet {
            all_of: &[
                "iccid",
                "numerodetelefono",
                "idpos",
                "valor",
                "residual",
                "poblacion",
                "fecha_venta",
            ],
        },
        ImportType::Store => DetectionRule::ExactSet {
            all_of: &["codigo_tienda", "nombre", "direccion", "poblacion", "provincia"],
        },
        ImportType::PointOfSale => DetectionRule::ExactSet {
            all_of: &["idpos", "nombre_punto_venta", "direccion", "poblacion"],
        },
    }
}

/// Loose header/candidate comparison: normalized equality, underscore-free
/// equality, or substring containment in either direction.
fn header_has(normalized: &str, candidate: &str) -> bool {
    if normalized == candidate {
        return true;
    }
    let squashed = squash_token(normalized);
    let squashed_candidate = squash_token(candidate);
    squashed == squashed_candidate
        || squashed.contains(&squashed_candidate)
        || squashed_candidate.contains(&squashed)
}

fn any_header_has(normalized: &[String], candidate: &str) -> bool {
    normalized.iter().any(|h| header_has(h, candidate))
}

fn matches_rule(normalized: &[String], rule: &DetectionRule) -> bool {
    match rule {
        DetectionRule::Thresholds {
            required,
            min_required,
            optional,
            min_optional,
            exclude,
        } => {
            if exclude.iter().any(|c| any_header_has(normalized, c)) {
                return false;
            }
            let required_hits = required
                .iter()
                .filter(|c| any_header_has(normalized, c))
                .count();
            if required_hits < *min_required {
                return false;
            }
            let optional_hits = optional
                .iter()
                .filter(|c| any_header_has(normalized, c))
                .count();
            optional_hits >= *min_optional
        }
        DetectionRule::ExactSet { all_of } => {
            all_of.iter().all(|c| any_header_has(normalized, c))
        }
    }
}

/// Decide which import type a header row represents.
///
/// Detection is a partition: exactly one type must match, otherwise the
/// file is rejected with a user-facing classification error.
pub fn detect_import_type(headers: &[String]) -> crate::error::Result<ImportType> {
    let normalized: Vec<String> = headers.iter().map(|h| normalize_header(h)).collect();
    debug!("Detecting import type from headers: {:?}", normalized);

    let matches: Vec<ImportType> = ImportType::all()
        .into_iter()
        .filter(|t| matches_rule(&normalized, &rule_for(*t)))
        .collect();

    match matches.as_slice() {
        [single] => {
            info!("Detected import type {} from headers", single.as_str());
            Ok(*single)
        }
        [] => Err(ImportError::Classification(format!(
            "no import type matches headers {:?}",
            headers
        ))
        .into()),
        several => Err(ImportError::Classification(format!(
            "headers {:?} ambiguously match {}",
            headers,
            several
                .iter()
                .map(|t| t.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        ))
        .into()),
    }
}
