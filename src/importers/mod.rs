//! Spreadsheet ingestion
//!
//! Operator-supplied Excel/CSV files flow through here: header-based type
//! detection, column alias mapping, row conversion and batch bookkeeping.

pub mod aliases;
pub mod builder;
pub mod headers;
pub mod processor;
pub mod sheet;
pub mod type_detector;

pub use aliases::{map_columns, ColumnMap};
pub use headers::{clean_iccid, normalize_header};
pub use processor::{process_file, process_sheet, ImportSummary, RowOutcome};
pub use sheet::{read_sheet, SheetData};
pub use type_detector::detect_import_type;

use rusqlite::Connection;
use std::path::Path;
use tracing::info;

/// Import a file end to end: detect its type from the header row, create a
/// batch for it and process every row.
///
/// Detection runs before the batch exists, so an unclassifiable file leaves
/// no batch record behind.
pub fn import_file_auto<P: AsRef<Path>>(
    conn: &Connection,
    path: P,
    batch_key: Option<&str>,
) -> crate::error::Result<ImportSummary> {
    let path = path.as_ref();
    let sheet = read_sheet(path)?;
    let import_type = detect_import_type(&sheet.headers)?;

    let file_name = path.file_name().and_then(|n| n.to_str());
    let batch_id = crate::db::create_import_batch(conn, import_type, file_name, batch_key)?;
    info!(
        batch_id,
        import_type = import_type.as_str(),
        file = ?file_name,
        "created import batch"
    );

    process_sheet(conn, batch_id, &sheet)
}
