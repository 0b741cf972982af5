//! Spreadsheet reading
//!
//! Unifies Excel (.xlsx/.xls via calamine) and CSV (.csv/.txt, tolerant of
//! Windows-1252 operator exports) into one `SheetData` of a header row plus
//! data rows, and provides the cell parsing helpers shared by all import
//! types (Spanish-locale decimals like "1.234,56", percentages like "7%",
//! dates like "15/03/2026").

use anyhow::{anyhow, Context, Result};
use calamine::{open_workbook_auto, Data, Reader};
use chrono::NaiveDate;
use once_cell::sync::Lazy;
use regex::Regex;
use rust_decimal::Decimal;
use std::path::Path;
use std::str::FromStr;
use tracing::info;

/// One parsed spreadsheet: first row split off as headers
#[derive(Debug)]
pub struct SheetData {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<Data>>,
}

/// Read a spreadsheet file into headers + rows (first worksheet only;
/// ingestion is per-file, sequential)
pub fn read_sheet<P: AsRef<Path>>(path: P) -> Result<SheetData> {
    let path = path.as_ref();
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .ok_or_else(|| anyhow!("File has no extension"))?
        .to_lowercase();

    info!("Reading import file: {:?} (type: {})", path, extension);

    match extension.as_str() {
        "xlsx" | "xls" => read_excel(path),
        "csv" | "txt" => read_csv(path),
        _ => Err(anyhow!(
            "Unsupported file format: {}. Supported formats: .xlsx, .xls, .csv",
            extension
        )),
    }
}

fn read_excel(path: &Path) -> Result<SheetData> {
    let mut workbook = open_workbook_auto(path).context("Failed to open Excel file")?;

    let range = workbook
        .worksheet_range_at(0)
        .ok_or_else(|| anyhow!("Workbook has no sheets"))?
        .context("Failed to read first worksheet")?;

    let mut rows_iter = range.rows();
    let headers = rows_iter
        .next()
        .ok_or_else(|| anyhow!("Empty sheet"))?
        .iter()
        .map(cell_to_string)
        .collect::<Vec<_>>();

    let rows: Vec<Vec<Data>> = rows_iter
        .filter(|row| row.iter().any(|c| !matches!(c, Data::Empty)))
        .map(|row| row.to_vec())
        .collect();

    Ok(SheetData { headers, rows })
}

fn read_csv(path: &Path) -> Result<SheetData> {
    let bytes = std::fs::read(path).context("Failed to read CSV file")?;

    // Operator exports are frequently Windows-1252, not UTF-8
    let text: String = match std::str::from_utf8(&bytes) {
        Ok(s) => s.to_string(),
        Err(_) => {
            let (decoded, _, _) = encoding_rs::WINDOWS_1252.decode(&bytes);
            decoded.into_owned()
        }
    };

    let delimiter = sniff_delimiter(&text);
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .delimiter(delimiter)
        .from_reader(text.as_bytes());

    let mut records = reader.records();
    let headers = match records.next() {
        Some(record) => record
            .context("Failed to parse CSV header row")?
            .iter()
            .map(|s| s.trim().to_string())
            .collect(),
        None => return Err(anyhow!("Empty CSV file")),
    };

    let mut rows = Vec::new();
    for record in records {
        let record = record.context("Failed to parse CSV row")?;
        if record.iter().all(|c| c.trim().is_empty()) {
            continue;
        }
        rows.push(
            record
                .iter()
                .map(|c| Data::String(c.trim().to_string()))
                .collect(),
        );
    }

    Ok(SheetData { headers, rows })
}

fn sniff_delimiter(text: &str) -> u8 {
    let first_line = text.lines().next().unwrap_or("");
    let semicolons = first_line.matches(';').count();
    let commas = first_line.matches(',').count();
    if semicolons >= commas {
        b';'
    } else {
        b','
    }
}

/// Render a cell as trimmed text. Integral floats lose the ".0" Excel
/// appends, so numeric identifiers survive as identifiers.
pub fn cell_to_string(data: &Data) -> String {
    match data {
        Data::String(s) => s.trim().to_string(),
        Data::Int(i) => i.to_string(),
        Data::Float(f) => {
            if f.fract() == 0.0 && f.abs() < 9.0e15 {
                format!("{}", *f as i64)
            } else {
                f.to_string()
            }
        }
        Data::Bool(b) => b.to_string(),
        Data::Empty => String::new(),
        other => other.to_string().trim().to_string(),
    }
}

static SYMBOLS: Lazy<Regex> = Lazy::new(|| Regex::new(r"[€$%\s]").expect("valid regex"));

/// Parse a decimal from a cell, tolerating Spanish formatting: currency and
/// percent symbols, "." thousands separators and "," decimal comma.
pub fn parse_decimal(data: &Data) -> Result<Decimal> {
    match data {
        Data::Int(i) => Ok(Decimal::from(*i)),
        Data::Float(f) => Decimal::from_f64_retain(*f).ok_or_else(|| anyhow!("Invalid decimal")),
        Data::String(s) => parse_decimal_str(s),
        Data::Empty => Err(anyhow!("Empty value")),
        _ => Err(anyhow!("Unsupported cell type")),
    }
}

pub fn parse_decimal_str(s: &str) -> Result<Decimal> {
    let cleaned = SYMBOLS.replace_all(s, "").to_string();

    if cleaned.is_empty() || cleaned == "-" {
        return Err(anyhow!("Empty value"));
    }

    let cleaned = if cleaned.contains(',') {
        cleaned.replace('.', "").replace(',', ".")
    } else {
        cleaned
    };

    Decimal::from_str(&cleaned).with_context(|| format!("Failed to parse decimal '{}'", s))
}

/// Parse an integer cell (years, months)
pub fn parse_integer(data: &Data) -> Result<i64> {
    match data {
        Data::Int(i) => Ok(*i),
        Data::Float(f) if f.fract() == 0.0 => Ok(*f as i64),
        Data::String(s) => s
            .trim()
            .parse::<i64>()
            .with_context(|| format!("Failed to parse integer '{}'", s)),
        _ => Err(anyhow!("Unsupported cell type for integer")),
    }
}

/// Parse a date cell from Spanish (DD/MM/YYYY) or ISO formats
pub fn parse_date(data: &Data) -> Result<NaiveDate> {
    let date_str = cell_to_string(data);

    for format in ["%d/%m/%Y", "%Y-%m-%d", "%d-%m-%Y"] {
        if let Ok(date) = NaiveDate::parse_from_str(&date_str, format) {
            return Ok(date);
        }
    }

    Err(anyhow!("Invalid date format: '{}'", date_str))
}

/// Interpret a cell as a yes/no flag ("1", "SI", "X", "true")
pub fn parse_flag(data: &Data) -> bool {
    matches!(
        cell_to_string(data).to_lowercase().as_str(),
        "1" | "si" | "sí" | "s" | "x" | "true"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_parse_decimal_spanish_formats() {
        assert_eq!(
            parse_decimal(&Data::String("1.234,56".to_string())).unwrap(),
            dec!(1234.56)
        );
        assert_eq!(
            parse_decimal(&Data::String("10000".to_string())).unwrap(),
            dec!(10000)
        );
        assert_eq!(
            parse_decimal(&Data::String("12,50 €".to_string())).unwrap(),
            dec!(12.50)
        );
        assert_eq!(
            parse_decimal(&Data::String("7%".to_string())).unwrap(),
            dec!(7)
        );
        assert_eq!(parse_decimal(&Data::Float(8.5)).unwrap(), dec!(8.5));
    }

    #[test]
    fn test_parse_decimal_rejects_empty() {
        assert!(parse_decimal(&Data::String("-".to_string())).is_err());
        assert!(parse_decimal(&Data::String("  ".to_string())).is_err());
        assert!(parse_decimal(&Data::Empty).is_err());
    }

    #[test]
    fn test_cell_to_string_keeps_identifiers() {
        // 15-digit identifier arriving as an Excel float
        assert_eq!(cell_to_string(&Data::Float(123456789012345.0)), "123456789012345");
        assert_eq!(cell_to_string(&Data::String("  x  ".to_string())), "x");
        assert_eq!(cell_to_string(&Data::Empty), "");
    }

    #[test]
    fn test_parse_date_formats() {
        let expected = NaiveDate::from_ymd_opt(2026, 3, 15).unwrap();
        assert_eq!(
            parse_date(&Data::String("15/03/2026".to_string())).unwrap(),
            expected
        );
        assert_eq!(
            parse_date(&Data::String("2026-03-15".to_string())).unwrap(),
            expected
        );
        assert!(parse_date(&Data::String("not a date".to_string())).is_err());
    }

    #[test]
    fn test_parse_flag() {
        assert!(parse_flag(&Data::String("SI".to_string())));
        assert!(parse_flag(&Data::String("1".to_string())));
        assert!(!parse_flag(&Data::String("no".to_string())));
        assert!(!parse_flag(&Data::Empty));
    }

    #[test]
    fn test_sniff_delimiter() {
        assert_eq!(sniff_delimiter("a;b;c\n1;2;3"), b';');
        assert_eq!(sniff_delimiter("a,b,c\n1,2,3"), b',');
    }

    #[test]
    fn test_read_csv_windows_1252() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pos.csv");
        // "POBLACIÓN" in Windows-1252: Ó = 0xD3
        let mut bytes = b"IDPOS;POBLACI".to_vec();
        bytes.push(0xD3);
        bytes.extend_from_slice(b"N\nP01;Madrid\n");
        std::fs::write(&path, bytes).unwrap();

        let sheet = read_sheet(&path).unwrap();
        assert_eq!(sheet.headers, vec!["IDPOS", "POBLACIÓN"]);
        assert_eq!(sheet.rows.len(), 1);
        assert_eq!(cell_to_string(&sheet.rows[0][0]), "P01");
    }
}
