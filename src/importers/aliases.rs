//! Column alias tables
//!
//! Each import type maps canonical header tokens to domain field names.
//! Operators rename columns between report versions, so every field carries
//! several known synonyms. Exact alias matches are preferred; bidirectional
//! substring matching is kept only as a documented last resort and every
//! such hit is logged, since short tokens make it ambiguous.

use crate::db::ImportType;
use crate::error::ImportError;
use crate::importers::headers::{normalize_header, squash_token};
use tracing::warn;

/// One domain field and the header spellings that feed it
pub struct FieldSpec {
    pub field: &'static str,
    /// User-facing label for mapping error messages
    pub label: &'static str,
    pub aliases: &'static [&'static str],
    pub required: bool,
}

pub struct AliasTable {
    pub fields: &'static [FieldSpec],
}

const OPERATOR_REPORT_FIELDS: &[FieldSpec] = &[
    FieldSpec {
        field: "iccid",
        label: "ICCID",
        aliases: &["iccid", "icc", "serial_sim"],
        required: true,
    },
    FieldSpec {
        field: "phone_number",
        label: "Número de teléfono",
        aliases: &["numero_de_telefono", "numerodetelefono", "telefono", "msisdn"],
        required: false,
    },
    FieldSpec {
        field: "city_code",
        label: "Código ciudad",
        aliases: &["codigo_ciudad", "cod_ciudad", "ciudad"],
        required: false,
    },
    FieldSpec {
        field: "commission_paid_80",
        label: "Comisión pagada 80",
        aliases: &["comision_pagada_80", "com_pagada_80", "comision_80"],
        required: true,
    },
    FieldSpec {
        field: "commission_paid_20",
        label: "Comisión pagada 20",
        aliases: &["comision_pagada_20", "com_pagada_20", "comision_20"],
        required: true,
    },
    FieldSpec {
        field: "total_commission",
        label: "Comisión total",
        aliases: &["comision_total", "total_comision"],
        required: false,
    },
    FieldSpec {
        field: "recharge_amount",
        label: "Recarga",
        aliases: &["recarga", "importe_recarga", "total_recarga"],
        required: false,
    },
    FieldSpec {
        field: "payment_percentage",
        label: "Porcentaje pago",
        aliases: &["porcentaje_pago", "pct_pago", "porcentaje"],
        required: false,
    },
    FieldSpec {
        field: "period_year",
        label: "Año",
        aliases: &["ano", "anio", "ejercicio"],
        required: true,
    },
    FieldSpec {
        field: "period_month",
        label: "Mes",
        aliases: &["mes", "periodo_mes"],
        required: true,
    },
    FieldSpec {
        field: "consolidated",
        label: "Consolidado",
        aliases: &["consolidado", "registro_consolidado"],
        required: false,
    },
];

const RECHARGE_FIELDS: &[FieldSpec] = &[
    FieldSpec {
        field: "iccid",
        label: "ICCID",
        aliases: &["iccid", "icc", "serial_sim"],
        required: true,
    },
    FieldSpec {
        field: "phone_number",
        label: "Número de teléfono",
        aliases: &["numero_de_telefono", "numerodetelefono", "telefono", "msisdn"],
        required: false,
    },
    FieldSpec {
        field: "amount",
        label: "Importe",
        aliases: &["importe", "importe_recarga", "recarga"],
        required: true,
    },
    FieldSpec {
        field: "recharge_date",
        label: "Fecha recarga",
        aliases: &["fecha_recarga", "fecha"],
        required: true,
    },
];

const SALES_CONDITION_FIELDS: &[FieldSpec] = &[
    FieldSpec {
        field: "iccid",
        label: "ICCID",
        aliases: &["iccid", "icc"],
        required: true,
    },
    FieldSpec {
        field: "phone_number",
        label: "Número de teléfono",
        aliases: &["numerodetelefono", "numero_de_telefono", "telefono"],
        required: false,
    },
    FieldSpec {
        field: "pos_code",
        label: "IDPOS",
        aliases: &["idpos", "id_pos", "pos"],
        required: true,
    },
    FieldSpec {
        field: "sale_price",
        label: "Valor",
        aliases: &["valor", "precio_venta"],
        required: true,
    },
    FieldSpec {
        field: "commission_percentage",
        label: "Residual",
        aliases: &["residual", "porcentaje_comision"],
        required: true,
    },
    FieldSpec {
        field: "population",
        label: "Población",
        aliases: &["poblacion", "municipio"],
        required: false,
    },
    FieldSpec {
        field: "sale_date",
        label: "Fecha venta",
        aliases: &["fecha_venta", "fecha"],
        required: true,
    },
];

const STORE_FIELDS: &[FieldSpec] = &[
    FieldSpec {
        field: "code",
        label: "Código tienda",
        aliases: &["codigo_tienda", "codigo"],
        required: true,
    },
    FieldSpec {
        field: "name",
        label: "Nombre",
        aliases: &["nombre"],
        required: true,
    },
    FieldSpec {
        field: "address",
        label: "Dirección",
        aliases: &["direccion"],
        required: false,
    },
    FieldSpec {
        field: "population",
        label: "Población",
        aliases: &["poblacion", "municipio"],
        required: false,
    },
    FieldSpec {
        field: "province",
        label: "Provincia",
        aliases: &["provincia"],
        required: false,
    },
];

const POINT_OF_SALE_FIELDS: &[FieldSpec] = &[
    FieldSpec {
        field: "code",
        label: "IDPOS",
        aliases: &["idpos", "id_pos"],
        required: true,
    },
    FieldSpec {
        field: "name",
        label: "Nombre punto venta",
        aliases: &["nombre_punto_venta", "nombre_pos", "nombre"],
        required: false,
    },
    FieldSpec {
        field: "address",
        label: "Dirección",
        aliases: &["direccion"],
        required: false,
    },
    FieldSpec {
        field: "population",
        label: "Población",
        aliases: &["poblacion", "municipio"],
        required: false,
    },
];

pub fn alias_table(import_type: ImportType) -> &'static AliasTable {
    static OPERATOR_REPORT: AliasTable = AliasTable {
        fields: OPERATOR_REPORT_FIELDS,
    };
    static RECHARGE: AliasTable = AliasTable {
        fields: RECHARGE_FIELDS,
    };
    static SALES_CONDITION: AliasTable = AliasTable {
        fields: SALES_CONDITION_FIELDS,
    };
    static STORE: AliasTable = AliasTable {
        fields: STORE_FIELDS,
    };
    static POINT_OF_SALE: AliasTable = AliasTable {
        fields: POINT_OF_SALE_FIELDS,
    };

    match import_type {
        ImportType::OperatorReport => &OPERATOR_REPORT,
        ImportType::Recharge => &RECHARGE,
        ImportType::SalesCondition => &SALES_CONDITION,
        ImportType::Store => &STORE,
        ImportType::PointOfSale => &POINT_OF_SALE,
    }
}

/// Per-column field assignment for one spreadsheet
#[derive(Debug)]
pub struct ColumnMap {
    /// Index-aligned with the header row; None = column ignored
    pub assignments: Vec<Option<&'static str>>,
}

/// Map a header row onto domain fields using the type's alias table.
///
/// First alias match wins and each field binds at most one column; unmapped
/// columns are ignored, not errors. Missing required fields abort with a
/// `ColumnMapping` error carrying user-facing labels, the headers actually
/// found, and best-effort suggestions.
pub fn map_columns(import_type: ImportType, headers: &[String]) -> crate::error::Result<ColumnMap> {
    let table = alias_table(import_type);
    let normalized: Vec<String> = headers.iter().map(|h| normalize_header(h)).collect();

    let mut assignments: Vec<Option<&'static str>> = vec![None; headers.len()];
    let mut bound: Vec<&'static str> = Vec::new();

    // Exact alias matches first
    for (col, token) in normalized.iter().enumerate() {
        let squashed = squash_token(token);
        for spec in table.fields {
            if bound.contains(&spec.field) {
                continue;
            }
            let exact = spec
                .aliases
                .iter()
                .any(|a| *a == token.as_str() || squash_token(a) == squashed);
            if exact {
                assignments[col] = Some(spec.field);
                bound.push(spec.field);
                break;
            }
        }
    }

    // Substring fallback for whatever is still unbound. Ambiguous for short
    // tokens, hence the warning on every hit.
    for (col, token) in normalized.iter().enumerate() {
        if assignments[col].is_some() {
            continue;
        }
        for spec in table.fields {
            if bound.contains(&spec.field) {
                continue;
            }
            let hit = spec
                .aliases
                .iter()
                .find(|a| token.contains(*a) || a.contains(token.as_str()));
            if let Some(alias) = hit {
                warn!(
                    header = %headers[col],
                    alias = *alias,
                    field = spec.field,
                    "column mapped by substring fallback"
                );
                assignments[col] = Some(spec.field);
                bound.push(spec.field);
                break;
            }
        }
    }

    let missing: Vec<&FieldSpec> = table
        .fields
        .iter()
        .filter(|spec| spec.required && !bound.contains(&spec.field))
        .collect();

    if !missing.is_empty() {
        let suggestions = suggest_similar(&missing, headers, &normalized);
        return Err(ImportError::ColumnMapping {
            missing: missing.iter().map(|s| s.label.to_string()).collect(),
            found_headers: headers.to_vec(),
            suggestions,
        }
        .into());
    }

    Ok(ColumnMap { assignments })
}

/// Best-effort "did you mean" hints for missing required fields: any header
/// sharing a 4+ character fragment with one of the field's aliases.
fn suggest_similar(
    missing: &[&FieldSpec],
    headers: &[String],
    normalized: &[String],
) -> Vec<String> {
    let mut suggestions = Vec::new();
    for spec in missing {
        for (col, token) in normalized.iter().enumerate() {
            let token = squash_token(token);
            let close = spec.aliases.iter().any(|alias| {
                let alias = squash_token(alias);
                shares_fragment(&alias, &token, 4)
            });
            if close {
                suggestions.push(format!("'{}' looks like {}", headers[col], spec.label));
            }
        }
    }
    suggestions
}

fn shares_fragment(a: &str, b: &str, min_len: usize) -> bool {
    if a.len() < min_len || b.len() < min_len {
        return false;
    }
    a.as_bytes()
        .windows(min_len)
        .any(|w| b.as_bytes().windows(min_len).any(|v| v == w))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_exact_alias_match_wins() {
        let map = map_columns(
            ImportType::SalesCondition,
            &headers(&[
                "ICCID",
                "NUMERODETELEFONO",
                "IDPOS",
                "VALOR",
                "RESIDUAL",
                "POBLACION",
                "FECHA VENTA",
            ]),
        )
        .unwrap();

        assert_eq!(
            map.assignments,
            vec![
                Some("iccid"),
                Some("phone_number"),
                Some("pos_code"),
                Some("sale_price"),
                Some("commission_percentage"),
                Some("population"),
                Some("sale_date"),
            ]
        );
    }

    #[test]
    fn test_unmapped_columns_are_ignored() {
        let map = map_columns(
            ImportType::Recharge,
            &headers(&["ICCID", "IMPORTE", "FECHA RECARGA", "COLUMNA MISTERIOSA"]),
        )
        .unwrap();
        assert_eq!(map.assignments[3], None);
    }

    #[test]
    fn test_substring_fallback_binds_drifted_header() {
        // "IMPORTE TOTAL RECARGA" is not an exact alias but contains one
        let map = map_columns(
            ImportType::Recharge,
            &headers(&["ICCID", "IMPORTE TOTAL RECARGA EUROS", "FECHA RECARGA"]),
        )
        .unwrap();
        assert_eq!(map.assignments[1], Some("amount"));
    }

    #[test]
    fn test_missing_required_field_reports_labels_and_suggestions() {
        let err = map_columns(
            ImportType::Recharge,
            &headers(&["ICCID", "IMPORTE", "FCHA RECARGA TYPO"]),
        )
        .unwrap_err();

        let err = err.downcast::<ImportError>().unwrap();
        match err {
            ImportError::ColumnMapping {
                missing,
                found_headers,
                suggestions,
            } => {
                assert_eq!(missing, vec!["Fecha recarga".to_string()]);
                assert_eq!(found_headers.len(), 3);
                assert!(suggestions
                    .iter()
                    .any(|s| s.contains("FCHA RECARGA TYPO") && s.contains("Fecha recarga")));
            }
            other => panic!("expected ColumnMapping, got {:?}", other),
        }
    }

    #[test]
    fn test_each_field_binds_one_column() {
        // Two columns both resembling the amount; only the first binds
        let map = map_columns(
            ImportType::Recharge,
            &headers(&["ICCID", "IMPORTE", "IMPORTE RECARGA", "FECHA RECARGA"]),
        )
        .unwrap();
        assert_eq!(map.assignments[1], Some("amount"));
        assert_eq!(map.assignments[2], None);
    }
}
