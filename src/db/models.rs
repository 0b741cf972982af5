use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Import types supported by the system
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ImportType {
    OperatorReport,
    Recharge,
    SalesCondition,
    Store,
    PointOfSale,
}

impl ImportType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImportType::OperatorReport => "OPERATOR_REPORT",
            ImportType::Recharge => "RECHARGE",
            ImportType::SalesCondition => "SALES_CONDITION",
            ImportType::Store => "STORE",
            ImportType::PointOfSale => "POINT_OF_SALE",
        }
    }

    /// All types, in the order the detector evaluates them
    pub fn all() -> [ImportType; 5] {
        [
            ImportType::OperatorReport,
            ImportType::Recharge,
            ImportType::SalesCondition,
            ImportType::Store,
            ImportType::PointOfSale,
        ]
    }
}

impl FromStr for ImportType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "OPERATOR_REPORT" => Ok(ImportType::OperatorReport),
            "RECHARGE" => Ok(ImportType::Recharge),
            "SALES_CONDITION" => Ok(ImportType::SalesCondition),
            "STORE" => Ok(ImportType::Store),
            "POINT_OF_SALE" => Ok(ImportType::PointOfSale),
            _ => Err(()),
        }
    }
}

/// Import batch lifecycle. Completed and Failed are terminal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ImportStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl ImportStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImportStatus::Pending => "PENDING",
            ImportStatus::Processing => "PROCESSING",
            ImportStatus::Completed => "COMPLETED",
            ImportStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ImportStatus::Completed | ImportStatus::Failed)
    }
}

impl FromStr for ImportStatus {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PENDING" => Ok(ImportStatus::Pending),
            "PROCESSING" => Ok(ImportStatus::Processing),
            "COMPLETED" => Ok(ImportStatus::Completed),
            "FAILED" => Ok(ImportStatus::Failed),
            _ => Err(()),
        }
    }
}

/// One uploaded file being ingested
#[derive(Debug, Clone)]
pub struct ImportBatch {
    pub id: Option<i64>,
    pub import_type: ImportType,
    pub status: ImportStatus,
    pub file_name: Option<String>,
    /// Groups multiple files uploaded together
    pub batch_key: Option<String>,
    pub total_rows: i64,
    pub processed_rows: i64,
    pub failed_rows: i64,
    pub ignored_duplicates: i64,
    /// JSON array of `RowIssue`
    pub error_log: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One problem row, persisted on the batch so it survives restarts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RowIssue {
    /// 1-based row number in the spreadsheet (header = row 1)
    pub row: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    pub reason: String,
}

/// A physical SIM/line, looked up or created during ingestion
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sim {
    pub id: Option<i64>,
    pub iccid: String,
    pub phone_number: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One commission-bearing event reported by the operator for a SIM in a period
#[derive(Debug, Clone)]
pub struct ReportLine {
    pub id: Option<i64>,
    pub sim_id: i64,
    pub import_id: i64,
    pub phone_number: Option<String>,
    pub city_code: Option<String>,
    pub commission_paid_80: Decimal,
    pub commission_paid_20: Decimal,
    /// Stored override; effective total falls back to 80 + 20
    pub total_commission: Option<Decimal>,
    pub recharge_amount: Option<Decimal>,
    /// 0..1 fraction
    pub payment_percentage: Option<Decimal>,
    pub period_year: i32,
    pub period_month: u32,
    pub period_label: String,
    /// Aggregate record vs raw row
    pub consolidated: bool,
    /// Opaque snapshot of the original row, for forensic/cleanup tooling
    pub raw_payload: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ReportLine {
    pub fn effective_total_commission(&self) -> Decimal {
        self.total_commission
            .unwrap_or(self.commission_paid_80 + self.commission_paid_20)
    }
}

/// A prepaid top-up event for a SIM
#[derive(Debug, Clone)]
pub struct RechargeLine {
    pub id: Option<i64>,
    pub sim_id: i64,
    pub import_id: i64,
    pub amount: Decimal,
    pub recharge_date: NaiveDate,
    pub period_year: i32,
    pub period_month: u32,
    pub period_label: String,
    pub created_at: DateTime<Utc>,
}

/// Commission terms for a SIM at a point of sale for a period.
/// Unique per (SIM, period); re-imports update in place.
#[derive(Debug, Clone)]
pub struct SalesConditionLine {
    pub id: Option<i64>,
    pub sim_id: i64,
    pub import_id: i64,
    pub pos_id: i64,
    pub sale_price: Decimal,
    /// Stored as the percent number itself ("7%" -> 7)
    pub commission_percentage: Decimal,
    pub population: Option<String>,
    pub period_year: i32,
    pub period_month: u32,
    pub period_label: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Point of sale where a SIM was sold
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PointOfSale {
    pub id: Option<i64>,
    pub code: String,
    pub name: Option<String>,
    pub address: Option<String>,
    pub population: Option<String>,
}

/// A retail store whose balance funds reward redemptions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Store {
    pub id: Option<i64>,
    pub code: String,
    pub name: Option<String>,
    pub address: Option<String>,
    pub population: Option<String>,
    pub province: Option<String>,
    /// Direct owner; additional users associate through store_users
    pub user_id: Option<i64>,
}

/// Periodic settlement crediting a store. Interface-level record for the
/// out-of-scope liquidation workflow.
#[derive(Debug, Clone)]
pub struct Liquidation {
    pub id: Option<i64>,
    pub store_id: i64,
    pub status: String, // 'OPEN' | 'CLOSED'
    pub net_amount: Decimal,
    pub closed_at: Option<NaiveDate>,
}

/// A store's request to spend balance on a reward
#[derive(Debug, Clone)]
pub struct Redemption {
    pub id: Option<i64>,
    pub store_id: i64,
    pub status: String, // 'PENDING' | 'APPROVED' | 'DELIVERED' | 'CANCELLED'
    pub total_value: Decimal,
}

/// Direction of a ledger movement
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum MovementType {
    Credit,
    Debit,
}

impl MovementType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MovementType::Credit => "CREDIT",
            MovementType::Debit => "DEBIT",
        }
    }
}

impl FromStr for MovementType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "CREDIT" => Ok(MovementType::Credit),
            "DEBIT" => Ok(MovementType::Debit),
            _ => Err(()),
        }
    }
}

/// Business operation that produced a movement
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum OperationKind {
    Liquidation,
    Redemption,
    Refund,
    Adjustment,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Liquidation => "LIQUIDATION",
            OperationKind::Redemption => "REDEMPTION",
            OperationKind::Refund => "REFUND",
            OperationKind::Adjustment => "ADJUSTMENT",
        }
    }
}

impl FromStr for OperationKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "LIQUIDATION" => Ok(OperationKind::Liquidation),
            "REDEMPTION" => Ok(OperationKind::Redemption),
            "REFUND" => Ok(OperationKind::Refund),
            "ADJUSTMENT" => Ok(OperationKind::Adjustment),
            _ => Err(()),
        }
    }
}

/// Movement lifecycle; voiding is the only permitted mutation
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum MovementStatus {
    Active,
    Voided,
}

impl MovementStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MovementStatus::Active => "ACTIVE",
            MovementStatus::Voided => "VOIDED",
        }
    }
}

impl FromStr for MovementStatus {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ACTIVE" => Ok(MovementStatus::Active),
            "VOIDED" => Ok(MovementStatus::Voided),
            _ => Err(()),
        }
    }
}

/// One signed entry in a store's balance history
#[derive(Debug, Clone)]
pub struct BalanceMovement {
    pub id: Option<i64>,
    pub store_id: i64,
    pub movement_type: MovementType,
    pub operation: OperationKind,
    /// Originating record; with store_id and movement_type this forms the
    /// natural idempotency key
    pub source_type: String,
    pub source_id: i64,
    /// Signed: debits negative, credits positive
    pub amount: Decimal,
    /// Materialized running balance after this movement
    pub balance_after: Decimal,
    pub status: MovementStatus,
    pub movement_date: NaiveDate,
    pub metadata: Option<String>,
    pub recorded_by: Option<String>,
    pub created_at: DateTime<Utc>,
}
