//! Error handling for the import and ledger core
//!
//! Defines the error taxonomy for batch-level failures and establishes a
//! unified Result type using anyhow for context chaining and propagation.
//! Row-level problems are not errors at this level; they are collected as
//! `RowIssue` entries on the import batch.

use thiserror::Error;

/// Batch-level error types for import operations
#[derive(Error, Debug)]
pub enum ImportError {
    /// The header row matched zero or more than one import type.
    /// Surfaced to the uploader immediately; no batch is started.
    #[error("cannot classify file: {0}")]
    Classification(String),

    /// A required domain field has no matching header. The batch fails
    /// fast before any row is processed.
    #[error("missing required columns: {}", missing.join(", "))]
    ColumnMapping {
        missing: Vec<String>,
        found_headers: Vec<String>,
        suggestions: Vec<String>,
    },

    /// The file itself could not be opened or parsed.
    #[error("unreadable file: {0}")]
    Unreadable(String),

    /// The prior running balance could not be determined (e.g. poisoned
    /// store lock). The calling workflow must treat this as a hard failure.
    #[error("ledger invariant violation for store {store_id}: {reason}")]
    LedgerInvariant { store_id: i64, reason: String },
}

/// Result type alias for import and ledger operations
pub type Result<T> = anyhow::Result<T>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification_error_is_user_readable() {
        let err = ImportError::Classification("no type matched headers".to_string());
        assert_eq!(
            err.to_string(),
            "cannot classify file: no type matched headers"
        );
    }

    #[test]
    fn test_column_mapping_error_lists_missing_fields() {
        let err = ImportError::ColumnMapping {
            missing: vec!["ICCID".to_string(), "Importe".to_string()],
            found_headers: vec!["TELEFONO".to_string()],
            suggestions: vec![],
        };
        let msg = err.to_string();
        assert!(msg.contains("ICCID"));
        assert!(msg.contains("Importe"));
    }

    #[test]
    fn test_anyhow_context_chains_errors() {
        use anyhow::Context;
        let result: Result<()> = Err(anyhow::anyhow!("disk full")).context("failed to open batch");
        let err = result.unwrap_err();
        assert!(err.to_string().contains("failed to open batch"));
        let debug_msg = format!("{:?}", err);
        assert!(debug_msg.contains("disk full"));
    }
}
