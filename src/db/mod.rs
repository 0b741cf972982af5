// Database module - SQLite connection and models

pub mod models;

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use rust_decimal::Decimal;
use std::path::PathBuf;
use std::str::FromStr;
use tracing::info;

pub use models::{
    BalanceMovement, ImportBatch, ImportStatus, ImportType, Liquidation, MovementStatus,
    MovementType, OperationKind, PointOfSale, RechargeLine, Redemption, ReportLine, RowIssue,
    SalesConditionLine, Sim, Store,
};

/// Get the default database path (~/.simledger/data.db)
pub fn get_default_db_path() -> Result<PathBuf> {
    let home = std::env::var("HOME").context("HOME environment variable not set")?;
    let simledger_dir = PathBuf::from(home).join(".simledger");

    std::fs::create_dir_all(&simledger_dir).context("Failed to create .simledger directory")?;

    Ok(simledger_dir.join("data.db"))
}

/// Open database connection
pub fn open_db(db_path: Option<PathBuf>) -> Result<Connection> {
    let path = db_path.unwrap_or(get_default_db_path()?);
    let conn = Connection::open(&path).context(format!("Failed to open database at {:?}", path))?;

    conn.execute("PRAGMA foreign_keys = ON", [])
        .context("Failed to enable foreign keys")?;

    Ok(conn)
}

/// Initialize the database with schema
pub fn init_database(db_path: Option<PathBuf>) -> Result<()> {
    let path = db_path.unwrap_or(get_default_db_path()?);

    info!("Initializing database at: {:?}", path);

    let conn = open_db(Some(path))?;

    let schema_sql = include_str!("schema.sql");
    conn.execute_batch(schema_sql)
        .context("Failed to execute schema")?;

    info!("Database initialized successfully");
    Ok(())
}

/// Apply the schema to an already-open connection (for in-memory databases)
pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(include_str!("schema.sql"))
        .context("Failed to execute schema")?;
    Ok(())
}

/// Helper to read Decimal from SQLite (handles INTEGER, REAL and TEXT)
pub fn get_decimal_value(row: &rusqlite::Row, idx: usize) -> Result<Decimal, rusqlite::Error> {
    use rusqlite::types::ValueRef;

    match row.get_ref(idx)? {
        ValueRef::Text(bytes) => {
            let s = std::str::from_utf8(bytes)
                .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
            Decimal::from_str(s).map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))
        }
        ValueRef::Integer(i) => Ok(Decimal::from(i)),
        ValueRef::Real(f) => {
            Decimal::try_from(f).map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))
        }
        _ => Err(rusqlite::Error::InvalidColumnType(
            idx,
            "decimal".to_string(),
            rusqlite::types::Type::Null,
        )),
    }
}

/// Helper to read optional Decimal from SQLite
pub fn get_optional_decimal_value(
    row: &rusqlite::Row,
    idx: usize,
) -> Result<Option<Decimal>, rusqlite::Error> {
    use rusqlite::types::ValueRef;

    match row.get_ref(idx)? {
        ValueRef::Null => Ok(None),
        _ => get_decimal_value(row, idx).map(Some),
    }
}

// ---------------------------------------------------------------------------
// SIM identity
// ---------------------------------------------------------------------------

/// Resolve a SIM by ICCID, creating it if absent. Returns sim_id.
///
/// A SIM is never deleted while referencing records exist; a later import
/// carrying a phone number fills it in on the existing row.
pub fn resolve_sim(conn: &Connection, iccid: &str, phone_number: Option<&str>) -> Result<i64> {
    let existing: Option<(i64, Option<String>)> = conn
        .query_row(
            "SELECT id, phone_number FROM sims WHERE iccid = ?1",
            [iccid],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;

    if let Some((id, current_phone)) = existing {
        if let Some(phone) = phone_number {
            if current_phone.as_deref() != Some(phone) {
                conn.execute(
                    "UPDATE sims SET phone_number = ?1, updated_at = datetime('now') WHERE id = ?2",
                    params![phone, id],
                )?;
            }
        }
        return Ok(id);
    }

    conn.execute(
        "INSERT INTO sims (iccid, phone_number) VALUES (?1, ?2)",
        params![iccid, phone_number],
    )?;

    Ok(conn.last_insert_rowid())
}

pub fn find_sim_by_iccid(conn: &Connection, iccid: &str) -> Result<Option<Sim>> {
    let sim = conn
        .query_row(
            "SELECT id, iccid, phone_number, created_at, updated_at FROM sims WHERE iccid = ?1",
            [iccid],
            |row| {
                Ok(Sim {
                    id: Some(row.get(0)?),
                    iccid: row.get(1)?,
                    phone_number: row.get(2)?,
                    created_at: row.get(3)?,
                    updated_at: row.get(4)?,
                })
            },
        )
        .optional()?;
    Ok(sim)
}

// ---------------------------------------------------------------------------
// Import batches
// ---------------------------------------------------------------------------

pub fn create_import_batch(
    conn: &Connection,
    import_type: ImportType,
    file_name: Option<&str>,
    batch_key: Option<&str>,
) -> Result<i64> {
    conn.execute(
        "INSERT INTO import_batches (import_type, status, file_name, batch_key)
         VALUES (?1, 'PENDING', ?2, ?3)",
        params![import_type.as_str(), file_name, batch_key],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn get_import_batch(conn: &Connection, batch_id: i64) -> Result<ImportBatch> {
    conn.query_row(
        "SELECT id, import_type, status, file_name, batch_key, total_rows, processed_rows,
                failed_rows, ignored_duplicates, error_log, created_at, updated_at
         FROM import_batches WHERE id = ?1",
        [batch_id],
        |row| {
            Ok(ImportBatch {
                id: Some(row.get(0)?),
                import_type: row
                    .get::<_, String>(1)?
                    .parse::<ImportType>()
                    .unwrap_or(ImportType::OperatorReport),
                status: row
                    .get::<_, String>(2)?
                    .parse::<ImportStatus>()
                    .unwrap_or(ImportStatus::Pending),
                file_name: row.get(3)?,
                batch_key: row.get(4)?,
                total_rows: row.get(5)?,
                processed_rows: row.get(6)?,
                failed_rows: row.get(7)?,
                ignored_duplicates: row.get(8)?,
                error_log: row.get(9)?,
                created_at: row.get(10)?,
                updated_at: row.get(11)?,
            })
        },
    )
    .context(format!("Import batch {} not found", batch_id))
}

/// Move a batch into PROCESSING, resetting its counters and error log.
///
/// Reruns of the same batch id are supported: the caller purges previously
/// inserted rows right after this call, so the batch restarts from a clean
/// slate without touching any other batch's rows.
pub fn begin_batch(conn: &Connection, batch_id: i64) -> Result<()> {
    conn.execute(
        "UPDATE import_batches
         SET status = 'PROCESSING', total_rows = 0, processed_rows = 0, failed_rows = 0,
             ignored_duplicates = 0, error_log = NULL, updated_at = datetime('now')
         WHERE id = ?1",
        [batch_id],
    )?;
    Ok(())
}

pub fn set_batch_total(conn: &Connection, batch_id: i64, total: i64) -> Result<()> {
    conn.execute(
        "UPDATE import_batches SET total_rows = ?1, updated_at = datetime('now') WHERE id = ?2",
        params![total, batch_id],
    )?;
    Ok(())
}

/// Flush running counters so progress is observable during long imports
pub fn update_batch_progress(
    conn: &Connection,
    batch_id: i64,
    processed: i64,
    failed: i64,
    ignored_duplicates: i64,
) -> Result<()> {
    conn.execute(
        "UPDATE import_batches
         SET processed_rows = ?1, failed_rows = ?2, ignored_duplicates = ?3,
             updated_at = datetime('now')
         WHERE id = ?4",
        params![processed, failed, ignored_duplicates, batch_id],
    )?;
    Ok(())
}

pub fn complete_batch(conn: &Connection, batch_id: i64, issues: &[RowIssue]) -> Result<()> {
    let error_log = if issues.is_empty() {
        None
    } else {
        Some(serde_json::to_string(issues)?)
    };
    conn.execute(
        "UPDATE import_batches
         SET status = 'COMPLETED', error_log = ?1, updated_at = datetime('now')
         WHERE id = ?2",
        params![error_log, batch_id],
    )?;
    Ok(())
}

/// Mark a batch failed, keeping the reason inspectable after restarts
pub fn fail_batch(conn: &Connection, batch_id: i64, reason: &str) -> Result<()> {
    let log = serde_json::to_string(&[RowIssue {
        row: 0,
        field: None,
        reason: reason.to_string(),
    }])?;
    conn.execute(
        "UPDATE import_batches
         SET status = 'FAILED', error_log = ?1, updated_at = datetime('now')
         WHERE id = ?2",
        params![log, batch_id],
    )?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Operator report lines
// ---------------------------------------------------------------------------

/// Insert one report line. Always a plain INSERT, never an upsert: upserting
/// across batches was found to steal import_id ownership from earlier
/// imports. Rerun dedup is handled by `purge_batch_rows` instead.
pub fn insert_report_line(conn: &Connection, line: &ReportLine) -> Result<i64> {
    conn.execute(
        "INSERT INTO operator_report_lines (
            sim_id, import_id, phone_number, city_code,
            commission_paid_80, commission_paid_20, total_commission,
            recharge_amount, payment_percentage,
            period_year, period_month, period_label, consolidated, raw_payload
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
        params![
            line.sim_id,
            line.import_id,
            line.phone_number,
            line.city_code,
            line.commission_paid_80.to_string(),
            line.commission_paid_20.to_string(),
            line.total_commission.as_ref().map(|d| d.to_string()),
            line.recharge_amount.as_ref().map(|d| d.to_string()),
            line.payment_percentage.as_ref().map(|d| d.to_string()),
            line.period_year,
            line.period_month,
            line.period_label,
            line.consolidated,
            line.raw_payload,
        ],
    )?;

    Ok(conn.last_insert_rowid())
}

/// Report lines for one period, across all imports
pub fn report_lines_for_period(
    conn: &Connection,
    year: i32,
    month: u32,
) -> Result<Vec<ReportLine>> {
    let mut stmt = conn.prepare(
        "SELECT id, sim_id, import_id, phone_number, city_code,
                commission_paid_80, commission_paid_20, total_commission,
                recharge_amount, payment_percentage,
                period_year, period_month, period_label, consolidated,
                raw_payload, created_at
         FROM operator_report_lines
         WHERE period_year = ?1 AND period_month = ?2
         ORDER BY id",
    )?;
    let lines = stmt
        .query_map(params![year, month], |row| {
            Ok(ReportLine {
                id: Some(row.get(0)?),
                sim_id: row.get(1)?,
                import_id: row.get(2)?,
                phone_number: row.get(3)?,
                city_code: row.get(4)?,
                commission_paid_80: get_decimal_value(row, 5)?,
                commission_paid_20: get_decimal_value(row, 6)?,
                total_commission: get_optional_decimal_value(row, 7)?,
                recharge_amount: get_optional_decimal_value(row, 8)?,
                payment_percentage: get_optional_decimal_value(row, 9)?,
                period_year: row.get(10)?,
                period_month: row.get(11)?,
                period_label: row.get(12)?,
                consolidated: row.get(13)?,
                raw_payload: row.get(14)?,
                created_at: row.get(15)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(lines)
}

/// Insert one recharge line (plain INSERT, same reasoning as report lines)
pub fn insert_recharge_line(conn: &Connection, line: &RechargeLine) -> Result<i64> {
    conn.execute(
        "INSERT INTO recharge_lines (
            sim_id, import_id, amount, recharge_date,
            period_year, period_month, period_label
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            line.sim_id,
            line.import_id,
            line.amount.to_string(),
            line.recharge_date,
            line.period_year,
            line.period_month,
            line.period_label,
        ],
    )?;

    Ok(conn.last_insert_rowid())
}

/// Delete rows previously inserted by this batch id, making batch processing
/// idempotent at batch granularity while preserving cross-batch isolation.
/// Returns (report rows deleted, recharge rows deleted).
pub fn purge_batch_rows(conn: &Connection, import_id: i64) -> Result<(usize, usize)> {
    let reports = conn.execute(
        "DELETE FROM operator_report_lines WHERE import_id = ?1",
        [import_id],
    )?;
    let recharges = conn.execute(
        "DELETE FROM recharge_lines WHERE import_id = ?1",
        [import_id],
    )?;
    Ok((reports, recharges))
}

// ---------------------------------------------------------------------------
// Sales condition lines
// ---------------------------------------------------------------------------

pub fn find_sales_condition_id(
    conn: &Connection,
    sim_id: i64,
    period_label: &str,
) -> Result<Option<i64>> {
    let id = conn
        .query_row(
            "SELECT id FROM sales_condition_lines WHERE sim_id = ?1 AND period_label = ?2",
            params![sim_id, period_label],
            |row| row.get(0),
        )
        .optional()?;
    Ok(id)
}

pub fn insert_sales_condition(conn: &Connection, line: &SalesConditionLine) -> Result<i64> {
    conn.execute(
        "INSERT INTO sales_condition_lines (
            sim_id, import_id, pos_id, sale_price, commission_percentage,
            population, period_year, period_month, period_label
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            line.sim_id,
            line.import_id,
            line.pos_id,
            line.sale_price.to_string(),
            line.commission_percentage.to_string(),
            line.population,
            line.period_year,
            line.period_month,
            line.period_label,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Update the terms in force for an existing (SIM, period) row. The row's
/// import_id moves to the importing batch on purpose: sales conditions are
/// current state, not an event log.
pub fn update_sales_condition(
    conn: &Connection,
    existing_id: i64,
    line: &SalesConditionLine,
) -> Result<()> {
    conn.execute(
        "UPDATE sales_condition_lines
         SET import_id = ?1, pos_id = ?2, sale_price = ?3, commission_percentage = ?4,
             population = ?5, updated_at = datetime('now')
         WHERE id = ?6",
        params![
            line.import_id,
            line.pos_id,
            line.sale_price.to_string(),
            line.commission_percentage.to_string(),
            line.population,
            existing_id,
        ],
    )?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Points of sale and stores
// ---------------------------------------------------------------------------

pub fn find_pos_id_by_code(conn: &Connection, code: &str) -> Result<Option<i64>> {
    let id = conn
        .query_row(
            "SELECT id FROM points_of_sale WHERE code = ?1",
            [code],
            |row| row.get(0),
        )
        .optional()?;
    Ok(id)
}

pub fn upsert_point_of_sale(conn: &Connection, pos: &PointOfSale) -> Result<i64> {
    if let Some(id) = find_pos_id_by_code(conn, &pos.code)? {
        conn.execute(
            "UPDATE points_of_sale SET name = ?1, address = ?2, population = ?3 WHERE id = ?4",
            params![pos.name, pos.address, pos.population, id],
        )?;
        return Ok(id);
    }
    conn.execute(
        "INSERT INTO points_of_sale (code, name, address, population) VALUES (?1, ?2, ?3, ?4)",
        params![pos.code, pos.name, pos.address, pos.population],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn find_store_id_by_code(conn: &Connection, code: &str) -> Result<Option<i64>> {
    let id = conn
        .query_row("SELECT id FROM stores WHERE code = ?1", [code], |r| {
            r.get(0)
        })
        .optional()?;
    Ok(id)
}

pub fn upsert_store(conn: &Connection, store: &Store) -> Result<i64> {
    if let Some(id) = find_store_id_by_code(conn, &store.code)? {
        conn.execute(
            "UPDATE stores SET name = ?1, address = ?2, population = ?3, province = ?4 WHERE id = ?5",
            params![store.name, store.address, store.population, store.province, id],
        )?;
        return Ok(id);
    }
    conn.execute(
        "INSERT INTO stores (code, name, address, population, province, user_id)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            store.code,
            store.name,
            store.address,
            store.population,
            store.province,
            store.user_id
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn add_store_user(conn: &Connection, store_id: i64, user_id: i64) -> Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO store_users (store_id, user_id) VALUES (?1, ?2)",
        params![store_id, user_id],
    )?;
    Ok(())
}

/// Stores a user is associated with: direct assignment or store_users link
pub fn store_ids_for_user(conn: &Connection, user_id: i64) -> Result<Vec<i64>> {
    let mut stmt = conn.prepare(
        "SELECT id FROM stores WHERE user_id = ?1
         UNION
         SELECT store_id FROM store_users WHERE user_id = ?1
         ORDER BY 1",
    )?;
    let ids = stmt
        .query_map([user_id], |row| row.get(0))?
        .collect::<Result<Vec<i64>, _>>()?;
    Ok(ids)
}

// ---------------------------------------------------------------------------
// Liquidations and redemptions (ledger sources)
// ---------------------------------------------------------------------------

pub fn insert_liquidation(conn: &Connection, liq: &Liquidation) -> Result<i64> {
    conn.execute(
        "INSERT INTO liquidations (store_id, status, net_amount, closed_at)
         VALUES (?1, ?2, ?3, ?4)",
        params![
            liq.store_id,
            liq.status,
            liq.net_amount.to_string(),
            liq.closed_at
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn insert_redemption(conn: &Connection, red: &Redemption) -> Result<i64> {
    conn.execute(
        "INSERT INTO redemptions (store_id, status, total_value) VALUES (?1, ?2, ?3)",
        params![red.store_id, red.status, red.total_value.to_string()],
    )?;
    Ok(conn.last_insert_rowid())
}
