//! End-to-end import tests: real .xlsx/.csv files on disk, auto-detected
//! and ingested through the public entry point.

use rusqlite::Connection;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use rust_xlsxwriter::Workbook;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

use simledger::db::{self, ImportStatus, ImportType, PointOfSale};
use simledger::importers::import_file_auto;

const ICCID_A: &str = "8934567890123456789";
const ICCID_B: &str = "8934567890123456780";

fn test_db() -> (TempDir, Connection) {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("test.db");
    db::init_database(Some(path.clone())).unwrap();
    let conn = db::open_db(Some(path)).unwrap();
    (dir, conn)
}

fn write_xlsx(dir: &Path, name: &str, headers: &[&str], rows: &[&[&str]]) -> PathBuf {
    let mut workbook = Workbook::new();
    let sheet = workbook.add_worksheet();
    for (col, header) in headers.iter().enumerate() {
        sheet.write_string(0, col as u16, *header).unwrap();
    }
    for (r, row) in rows.iter().enumerate() {
        for (c, cell) in row.iter().enumerate() {
            sheet.write_string((r + 1) as u32, c as u16, *cell).unwrap();
        }
    }
    let path = dir.join(name);
    workbook.save(&path).unwrap();
    path
}

fn seed_pos(conn: &Connection, code: &str) {
    db::upsert_point_of_sale(
        conn,
        &PointOfSale {
            id: None,
            code: code.to_string(),
            name: Some("Estanco Central".to_string()),
            address: None,
            population: Some("Madrid".to_string()),
        },
    )
    .unwrap();
}

#[test]
fn sales_condition_xlsx_imports_end_to_end() {
    let (dir, conn) = test_db();
    seed_pos(&conn, "P01");

    let path = write_xlsx(
        dir.path(),
        "condiciones.xlsx",
        &[
            "ICCID",
            "NUMERODETELEFONO",
            "IDPOS",
            "VALOR",
            "RESIDUAL",
            "POBLACION",
            "FECHA VENTA",
        ],
        &[&[ICCID_A, "612345678", "P01", "10000", "7%", "Madrid", "12/05/2026"]],
    );

    let summary = import_file_auto(&conn, &path, None).unwrap();
    assert_eq!(summary.import_type, ImportType::SalesCondition);
    assert_eq!(summary.inserted, 1);
    assert_eq!(summary.errors, 0);

    let (price, pct): (String, String) = conn
        .query_row(
            "SELECT sale_price, commission_percentage FROM sales_condition_lines LIMIT 1",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .unwrap();
    assert_eq!(price.parse::<Decimal>().unwrap(), dec!(10000));
    assert_eq!(pct.parse::<Decimal>().unwrap(), dec!(7));

    // The SIM was created on the fly with its phone number
    let sim = db::find_sim_by_iccid(&conn, ICCID_A).unwrap().unwrap();
    assert_eq!(sim.phone_number.as_deref(), Some("612345678"));
}

#[test]
fn operator_report_with_spanish_numbers() {
    let (dir, conn) = test_db();

    let path = write_xlsx(
        dir.path(),
        "informe.xlsx",
        &[
            "ICCID",
            "NUMERO DE TELEFONO",
            "COMISION PAGADA 80",
            "COMISION PAGADA 20",
            "RECARGA",
            "PORCENTAJE PAGO",
            "AÑO",
            "MES",
        ],
        &[
            &[ICCID_A, "612345678", "1.234,56", "308,64", "25,00 €", "85", "2026", "3"],
            &[ICCID_B, "699999999", "8,00", "2,00", "", "0,85", "2026", "3"],
        ],
    );

    let summary = import_file_auto(&conn, &path, Some("marzo-2026")).unwrap();
    assert_eq!(summary.import_type, ImportType::OperatorReport);
    assert_eq!(summary.inserted, 2);

    let (c80, pct): (String, String) = conn
        .query_row(
            "SELECT commission_paid_80, payment_percentage
             FROM operator_report_lines ORDER BY id LIMIT 1",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .unwrap();
    assert_eq!(c80.parse::<Decimal>().unwrap(), dec!(1234.56));
    // Whole-number percent normalized to a fraction
    assert_eq!(pct.parse::<Decimal>().unwrap(), dec!(0.85));

    let batch: String = conn
        .query_row(
            "SELECT batch_key FROM import_batches LIMIT 1",
            [],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(batch, "marzo-2026");
}

#[test]
fn operator_report_total_commission_override() {
    let (dir, conn) = test_db();

    let path = write_xlsx(
        dir.path(),
        "informe.xlsx",
        &[
            "ICCID",
            "COMISION PAGADA 80",
            "COMISION PAGADA 20",
            "COMISION TOTAL",
            "RECARGA",
            "AÑO",
            "MES",
        ],
        &[
            // Operator-supplied total that disagrees with 80 + 20
            &[ICCID_A, "8,00", "2,00", "9,50", "25,00", "2026", "3"],
            &[ICCID_B, "8,00", "2,00", "", "", "2026", "3"],
        ],
    );

    let summary = import_file_auto(&conn, &path, None).unwrap();
    assert_eq!(summary.inserted, 2);

    let lines = db::report_lines_for_period(&conn, 2026, 3).unwrap();
    assert_eq!(lines.len(), 2);

    // The stored override wins; without one the total falls back to 80 + 20
    assert_eq!(lines[0].total_commission, Some(dec!(9.50)));
    assert_eq!(lines[0].effective_total_commission(), dec!(9.50));
    assert_eq!(lines[0].recharge_amount, Some(dec!(25.00)));
    assert_eq!(lines[1].total_commission, None);
    assert_eq!(lines[1].effective_total_commission(), dec!(10.00));
}

#[test]
fn recharge_csv_with_semicolons() {
    let (dir, conn) = test_db();

    let path = dir.path().join("recargas.csv");
    let csv = format!(
        "ICCID;NUMERO DE TELEFONO;IMPORTE;FECHA RECARGA\n\
         {a};612345678;10,00;15/03/2026\n\
         {a};612345678;10,00;15/03/2026\n\
         {b};;5,50;16/03/2026\n",
        a = ICCID_A,
        b = ICCID_B,
    );
    std::fs::write(&path, csv).unwrap();

    let summary = import_file_auto(&conn, &path, None).unwrap();
    assert_eq!(summary.import_type, ImportType::Recharge);
    assert_eq!(summary.inserted, 2);
    assert_eq!(summary.duplicates, 1);

    let count: i64 = conn
        .query_row("SELECT COUNT(*) FROM recharge_lines", [], |row| row.get(0))
        .unwrap();
    assert_eq!(count, 2);
}

#[test]
fn unclassifiable_file_creates_no_batch() {
    let (dir, conn) = test_db();

    let path = write_xlsx(
        dir.path(),
        "misterio.xlsx",
        &["UNA", "COSA", "RARA"],
        &[&["1", "2", "3"]],
    );

    assert!(import_file_auto(&conn, &path, None).is_err());

    let batches: i64 = conn
        .query_row("SELECT COUNT(*) FROM import_batches", [], |row| row.get(0))
        .unwrap();
    assert_eq!(batches, 0);
}

#[test]
fn padded_iccids_are_cleaned_before_matching() {
    let (dir, conn) = test_db();
    seed_pos(&conn, "P01");

    // 2 junk digits in front, 1 behind the 19-digit ICCID
    let padded = format!("00{}7", ICCID_A);
    let path = write_xlsx(
        dir.path(),
        "condiciones.xlsx",
        &[
            "ICCID",
            "NUMERODETELEFONO",
            "IDPOS",
            "VALOR",
            "RESIDUAL",
            "POBLACION",
            "FECHA VENTA",
        ],
        &[&[&padded, "", "P01", "10000", "7%", "", "12/05/2026"]],
    );

    let summary = import_file_auto(&conn, &path, None).unwrap();
    assert_eq!(summary.inserted, 1);
    assert!(db::find_sim_by_iccid(&conn, ICCID_A).unwrap().is_some());
}

#[test]
fn row_problems_are_logged_on_the_batch() {
    let (dir, conn) = test_db();
    seed_pos(&conn, "P01");

    let path = write_xlsx(
        dir.path(),
        "condiciones.xlsx",
        &[
            "ICCID",
            "NUMERODETELEFONO",
            "IDPOS",
            "VALOR",
            "RESIDUAL",
            "POBLACION",
            "FECHA VENTA",
        ],
        &[
            &[ICCID_A, "", "P01", "10000", "7%", "", "12/05/2026"],
            &[ICCID_B, "", "DESCONOCIDO", "9000", "5%", "", "12/05/2026"],
            &["123", "", "P01", "8000", "5%", "", "12/05/2026"],
        ],
    );

    let summary = import_file_auto(&conn, &path, None).unwrap();
    assert_eq!(summary.inserted, 1);
    assert_eq!(summary.skipped, 1);
    assert_eq!(summary.errors, 1);

    let (status, failed, error_log): (String, i64, String) = conn
        .query_row(
            "SELECT status, failed_rows, error_log FROM import_batches LIMIT 1",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .unwrap();
    assert_eq!(status.parse::<ImportStatus>(), Ok(ImportStatus::Completed));
    assert_eq!(failed, 2);
    assert!(error_log.contains("DESCONOCIDO"));
}

#[test]
fn store_and_pos_master_data_round() {
    let (dir, conn) = test_db();

    let pos_path = write_xlsx(
        dir.path(),
        "puntos.xlsx",
        &["IDPOS", "NOMBRE PUNTO VENTA", "DIRECCION", "POBLACION"],
        &[
            &["P01", "Estanco Central", "Calle Mayor 1", "Madrid"],
            &["P02", "Kiosko Sur", "Av. Andalucía 9", "Sevilla"],
        ],
    );
    let summary = import_file_auto(&conn, &pos_path, None).unwrap();
    assert_eq!(summary.import_type, ImportType::PointOfSale);
    assert_eq!(summary.inserted, 2);

    let store_path = write_xlsx(
        dir.path(),
        "tiendas.xlsx",
        &["CODIGO TIENDA", "NOMBRE", "DIRECCION", "POBLACION", "PROVINCIA"],
        &[&["T001", "Tienda Uno", "Calle Mayor 1", "Madrid", "Madrid"]],
    );
    let summary = import_file_auto(&conn, &store_path, None).unwrap();
    assert_eq!(summary.import_type, ImportType::Store);
    assert_eq!(summary.inserted, 1);

    let (code, province): (String, String) = conn
        .query_row("SELECT code, province FROM stores LIMIT 1", [], |row| {
            Ok((row.get(0)?, row.get(1)?))
        })
        .unwrap();
    assert_eq!(code, "T001");
    assert_eq!(province, "Madrid");
}
