//! Row processing engine
//!
//! Drives one import batch end to end: classify the sheet, map its columns,
//! purge the batch's previous rows (for insert-only types), then walk every
//! data row, converting, deduplicating and persisting it. Row-level problems
//! never abort the batch; they are counted and logged on the batch record.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use calamine::Data;
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{info, warn};

use crate::db::{
    self, ImportType, PointOfSale, RowIssue, Store,
};
use crate::error::ImportError;
use crate::importers::aliases::{map_columns, ColumnMap};
use crate::importers::builder::{
    raw_payload_json, RechargeLineBuilder, ReportLineBuilder, SalesConditionBuilder,
};
use crate::importers::headers::clean_iccid;
use crate::importers::sheet::{
    cell_to_string, parse_date, parse_decimal, parse_flag, parse_integer, SheetData,
};
use crate::importers::type_detector::detect_import_type;
use rusqlite::Connection;

/// Counters flushed to the batch row every N processed rows
const PROGRESS_FLUSH_EVERY: usize = 25;

/// What happened to one data row
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowOutcome {
    Inserted,
    Updated,
    /// Identical to a row already seen in this batch
    Duplicate,
    /// Valid but not importable (e.g. unknown point of sale)
    Skipped(String),
    Error(String),
}

/// Final outcome of one batch
#[derive(Debug, Clone, Serialize)]
pub struct ImportSummary {
    pub import_type: ImportType,
    pub total: usize,
    pub inserted: usize,
    pub updated: usize,
    pub duplicates: usize,
    pub skipped: usize,
    pub errors: usize,
}

impl ImportSummary {
    fn new(import_type: ImportType, total: usize) -> Self {
        Self {
            import_type,
            total,
            inserted: 0,
            updated: 0,
            duplicates: 0,
            skipped: 0,
            errors: 0,
        }
    }
}

/// Mapped view over one data row: field name -> cell
struct RowValues<'a> {
    cells: HashMap<&'static str, &'a Data>,
}

impl<'a> RowValues<'a> {
    fn new(map: &ColumnMap, row: &'a [Data]) -> Self {
        let mut cells = HashMap::new();
        for (col, field) in map.assignments.iter().enumerate() {
            if let (Some(field), Some(cell)) = (field, row.get(col)) {
                // Blank cells count as absent, whatever the file format
                // represents them as
                let blank = match cell {
                    Data::Empty => true,
                    Data::String(s) => s.trim().is_empty(),
                    _ => false,
                };
                if !blank {
                    cells.insert(*field, cell);
                }
            }
        }
        Self { cells }
    }

    fn cell(&self, field: &'static str) -> Option<&Data> {
        self.cells.get(field).copied()
    }

    /// Non-empty trimmed text, or None
    fn string(&self, field: &'static str) -> Option<String> {
        self.cell(field)
            .map(cell_to_string)
            .filter(|s| !s.is_empty())
    }

    fn required_string(&self, field: &'static str, label: &str) -> Result<String, String> {
        self.string(field)
            .ok_or_else(|| format!("missing value for {}", label))
    }

    fn decimal(&self, field: &'static str) -> Result<Option<Decimal>, String> {
        match self.cell(field) {
            None => Ok(None),
            Some(cell) => parse_decimal(cell)
                .map(Some)
                .map_err(|e| format!("{}: {}", field, e)),
        }
    }

    fn required_decimal(&self, field: &'static str, label: &str) -> Result<Decimal, String> {
        self.decimal(field)?
            .ok_or_else(|| format!("missing value for {}", label))
    }

    fn required_date(
        &self,
        field: &'static str,
        label: &str,
    ) -> Result<chrono::NaiveDate, String> {
        let cell = self
            .cell(field)
            .ok_or_else(|| format!("missing value for {}", label))?;
        parse_date(cell).map_err(|e| format!("{}: {}", label, e))
    }

    fn integer(&self, field: &'static str) -> Result<Option<i64>, String> {
        match self.cell(field) {
            None => Ok(None),
            Some(cell) => parse_integer(cell)
                .map(Some)
                .map_err(|e| format!("{}: {}", field, e)),
        }
    }

    fn flag(&self, field: &'static str) -> bool {
        self.cell(field).map(parse_flag).unwrap_or(false)
    }
}

/// Import one file into an existing batch: read, then `process_sheet`.
/// Unreadable files fail the batch before any row work happens.
pub fn process_file<P: AsRef<Path>>(
    conn: &Connection,
    batch_id: i64,
    path: P,
) -> crate::error::Result<ImportSummary> {
    let sheet = match crate::importers::sheet::read_sheet(&path) {
        Ok(sheet) => sheet,
        Err(e) => {
            db::fail_batch(conn, batch_id, &e.to_string())?;
            return Err(ImportError::Unreadable(e.to_string()).into());
        }
    };
    process_sheet(conn, batch_id, &sheet)
}

/// Process an already-read sheet under the given batch.
///
/// The detected type must agree with the type the batch was created with;
/// a mismatch fails the batch rather than silently importing as the wrong
/// kind. Reruns are safe: counters reset and, for insert-only types, the
/// batch's previous rows are purged before reprocessing.
pub fn process_sheet(
    conn: &Connection,
    batch_id: i64,
    sheet: &SheetData,
) -> crate::error::Result<ImportSummary> {
    let batch = db::get_import_batch(conn, batch_id)?;

    let detected = match detect_import_type(&sheet.headers) {
        Ok(t) => t,
        Err(e) => {
            db::fail_batch(conn, batch_id, &e.to_string())?;
            return Err(e);
        }
    };
    if detected != batch.import_type {
        let reason = format!(
            "file classified as {} but batch was created for {}",
            detected.as_str(),
            batch.import_type.as_str()
        );
        db::fail_batch(conn, batch_id, &reason)?;
        return Err(ImportError::Classification(reason).into());
    }

    db::begin_batch(conn, batch_id)?;

    let map = match map_columns(detected, &sheet.headers) {
        Ok(map) => map,
        Err(e) => {
            db::fail_batch(conn, batch_id, &e.to_string())?;
            return Err(e);
        }
    };

    // Insert-only types get rerun idempotency by deleting this batch's own
    // earlier rows; other batches' rows are untouched.
    if matches!(detected, ImportType::OperatorReport | ImportType::Recharge) {
        let (reports, recharges) = db::purge_batch_rows(conn, batch_id)?;
        if reports + recharges > 0 {
            info!(
                batch_id,
                reports, recharges, "purged rows from a previous run of this batch"
            );
        }
    }

    db::set_batch_total(conn, batch_id, sheet.rows.len() as i64)?;

    let mut summary = ImportSummary::new(detected, sheet.rows.len());
    let mut issues: Vec<RowIssue> = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();

    for (idx, row) in sheet.rows.iter().enumerate() {
        // Header occupies row 1 of the spreadsheet
        let row_number = idx + 2;
        let values = RowValues::new(&map, row);

        let outcome = match detected {
            ImportType::OperatorReport => {
                process_report_row(conn, batch_id, &sheet.headers, row, &values, &mut seen)
            }
            ImportType::Recharge => process_recharge_row(conn, batch_id, &values, &mut seen),
            ImportType::SalesCondition => {
                process_sales_condition_row(conn, batch_id, &values, &mut seen)
            }
            ImportType::Store => process_store_row(conn, &values),
            ImportType::PointOfSale => process_pos_row(conn, &values),
        };

        match outcome {
            RowOutcome::Inserted => summary.inserted += 1,
            RowOutcome::Updated => summary.updated += 1,
            RowOutcome::Duplicate => summary.duplicates += 1,
            RowOutcome::Skipped(reason) => {
                summary.skipped += 1;
                issues.push(RowIssue {
                    row: row_number,
                    field: None,
                    reason,
                });
            }
            RowOutcome::Error(reason) => {
                warn!(batch_id, row = row_number, %reason, "row rejected");
                summary.errors += 1;
                issues.push(RowIssue {
                    row: row_number,
                    field: None,
                    reason,
                });
            }
        }

        if (idx + 1) % PROGRESS_FLUSH_EVERY == 0 {
            flush_progress(conn, batch_id, &summary)?;
        }
    }

    flush_progress(conn, batch_id, &summary)?;
    db::complete_batch(conn, batch_id, &issues)?;

    info!(
        batch_id,
        import_type = detected.as_str(),
        total = summary.total,
        inserted = summary.inserted,
        updated = summary.updated,
        duplicates = summary.duplicates,
        skipped = summary.skipped,
        errors = summary.errors,
        "batch completed"
    );

    Ok(summary)
}

fn flush_progress(
    conn: &Connection,
    batch_id: i64,
    summary: &ImportSummary,
) -> crate::error::Result<()> {
    let processed =
        summary.inserted + summary.updated + summary.duplicates + summary.skipped + summary.errors;
    db::update_batch_progress(
        conn,
        batch_id,
        processed as i64,
        (summary.errors + summary.skipped) as i64,
        summary.duplicates as i64,
    )?;
    Ok(())
}

fn process_report_row(
    conn: &Connection,
    batch_id: i64,
    headers: &[String],
    row: &[Data],
    values: &RowValues,
    seen: &mut HashSet<String>,
) -> RowOutcome {
    let result = (|| -> Result<RowOutcome, String> {
        let raw_iccid = values.required_string("iccid", "ICCID")?;
        let iccid = clean_iccid(&raw_iccid).map_err(|e| e.to_string())?;

        let c80 = values.required_decimal("commission_paid_80", "Comisión pagada 80")?;
        let c20 = values.required_decimal("commission_paid_20", "Comisión pagada 20")?;
        let year = values
            .integer("period_year")?
            .ok_or_else(|| "missing value for Año".to_string())? as i32;
        let month = values
            .integer("period_month")?
            .ok_or_else(|| "missing value for Mes".to_string())? as u32;
        if !(1..=12).contains(&month) {
            return Err(format!("month {} out of range", month));
        }

        let dup_key = format!("{}|{:04}-{:02}|{}|{}", iccid, year, month, c80, c20);
        if !seen.insert(dup_key) {
            return Ok(RowOutcome::Duplicate);
        }

        let phone = values.string("phone_number");
        let sim_id =
            db::resolve_sim(conn, &iccid, phone.as_deref()).map_err(|e| e.to_string())?;

        let mut builder = ReportLineBuilder::new(sim_id, batch_id)
            .commission_paid_80(c80)
            .commission_paid_20(c20)
            .period(year, month)
            .consolidated(values.flag("consolidated"))
            .raw_payload(raw_payload_json(headers, row));
        if let Some(phone) = phone {
            builder = builder.phone_number(phone);
        }
        if let Some(city) = values.string("city_code") {
            builder = builder.city_code(city);
        }
        if let Some(total) = values.decimal("total_commission")? {
            builder = builder.total_commission(total);
        }
        if let Some(amount) = values.decimal("recharge_amount")? {
            builder = builder.recharge_amount(amount);
        }
        if let Some(pct) = values.decimal("payment_percentage")? {
            builder = builder.payment_percentage(pct);
        }

        db::insert_report_line(conn, &builder.build()).map_err(|e| e.to_string())?;
        Ok(RowOutcome::Inserted)
    })();

    result.unwrap_or_else(RowOutcome::Error)
}

fn process_recharge_row(
    conn: &Connection,
    batch_id: i64,
    values: &RowValues,
    seen: &mut HashSet<String>,
) -> RowOutcome {
    let result = (|| -> Result<RowOutcome, String> {
        let raw_iccid = values.required_string("iccid", "ICCID")?;
        let iccid = clean_iccid(&raw_iccid).map_err(|e| e.to_string())?;
        let amount = values.required_decimal("amount", "Importe")?;
        let date = values.required_date("recharge_date", "Fecha recarga")?;

        let dup_key = format!("{}|{}|{}", iccid, date, amount);
        if !seen.insert(dup_key) {
            return Ok(RowOutcome::Duplicate);
        }

        let phone = values.string("phone_number");
        let sim_id =
            db::resolve_sim(conn, &iccid, phone.as_deref()).map_err(|e| e.to_string())?;

        let line = RechargeLineBuilder::new(sim_id, batch_id)
            .amount(amount)
            .recharge_date(date)
            .build();
        db::insert_recharge_line(conn, &line).map_err(|e| e.to_string())?;
        Ok(RowOutcome::Inserted)
    })();

    result.unwrap_or_else(RowOutcome::Error)
}

fn process_sales_condition_row(
    conn: &Connection,
    batch_id: i64,
    values: &RowValues,
    seen: &mut HashSet<String>,
) -> RowOutcome {
    let result = (|| -> Result<RowOutcome, String> {
        let raw_iccid = values.required_string("iccid", "ICCID")?;
        let iccid = clean_iccid(&raw_iccid).map_err(|e| e.to_string())?;
        let pos_code = values.required_string("pos_code", "IDPOS")?;
        let sale_price = values.required_decimal("sale_price", "Valor")?;
        let commission_pct = values.required_decimal("commission_percentage", "Residual")?;
        let sale_date = values.required_date("sale_date", "Fecha venta")?;

        // Unknown points of sale are skipped, not invented: POS master data
        // arrives through its own import.
        let pos_id = match db::find_pos_id_by_code(conn, &pos_code).map_err(|e| e.to_string())? {
            Some(id) => id,
            None => {
                return Ok(RowOutcome::Skipped(format!(
                    "unknown point of sale '{}'",
                    pos_code
                )))
            }
        };

        let phone = values.string("phone_number");
        let sim_id =
            db::resolve_sim(conn, &iccid, phone.as_deref()).map_err(|e| e.to_string())?;

        let mut builder = SalesConditionBuilder::new(sim_id, batch_id)
            .pos_id(pos_id)
            .sale_price(sale_price)
            .commission_percentage(commission_pct)
            .sale_date(sale_date);
        if let Some(population) = values.string("population") {
            builder = builder.population(population);
        }
        let line = builder.build();

        let dup_key = format!("{}|{}", iccid, line.period_label);
        if !seen.insert(dup_key) {
            return Ok(RowOutcome::Duplicate);
        }

        match db::find_sales_condition_id(conn, sim_id, &line.period_label)
            .map_err(|e| e.to_string())?
        {
            Some(existing_id) => {
                db::update_sales_condition(conn, existing_id, &line)
                    .map_err(|e| e.to_string())?;
                Ok(RowOutcome::Updated)
            }
            None => {
                db::insert_sales_condition(conn, &line).map_err(|e| e.to_string())?;
                Ok(RowOutcome::Inserted)
            }
        }
    })();

    result.unwrap_or_else(RowOutcome::Error)
}

fn process_store_row(conn: &Connection, values: &RowValues) -> RowOutcome {
    let result = (|| -> Result<RowOutcome, String> {
        let code = values.required_string("code", "Código tienda")?;
        let existed = db::find_store_id_by_code(conn, &code)
            .map_err(|e| e.to_string())?
            .is_some();

        let store = Store {
            id: None,
            code,
            name: values.string("name"),
            address: values.string("address"),
            population: values.string("population"),
            province: values.string("province"),
            user_id: None,
        };
        db::upsert_store(conn, &store).map_err(|e| e.to_string())?;

        Ok(if existed {
            RowOutcome::Updated
        } else {
            RowOutcome::Inserted
        })
    })();

    result.unwrap_or_else(RowOutcome::Error)
}

fn process_pos_row(conn: &Connection, values: &RowValues) -> RowOutcome {
    let result = (|| -> Result<RowOutcome, String> {
        let code = values.required_string("code", "IDPOS")?;
        let existed = db::find_pos_id_by_code(conn, &code)
            .map_err(|e| e.to_string())?
            .is_some();

        let pos = PointOfSale {
            id: None,
            code,
            name: values.string("name"),
            address: values.string("address"),
            population: values.string("population"),
        };
        db::upsert_point_of_sale(conn, &pos).map_err(|e| e.to_string())?;

        Ok(if existed {
            RowOutcome::Updated
        } else {
            RowOutcome::Inserted
        })
    })();

    result.unwrap_or_else(RowOutcome::Error)
}
