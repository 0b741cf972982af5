//! Entity builders
//!
//! Stepwise construction of one normalized domain record from a mapped row.
//! Every setter is independent and optional; `build()` validates nothing
//! (validation is the processor's job) and yields an immutable record.
//! Persistence stays separate so report and recharge lines can remain
//! strictly insert-only.

use calamine::Data;
use chrono::{Datelike, NaiveDate};
use rust_decimal::Decimal;

use crate::db::models::{RechargeLine, ReportLine, SalesConditionLine};
use crate::importers::sheet::cell_to_string;

/// Canonical "YYYY-MM" period label
pub fn period_label(year: i32, month: u32) -> String {
    format!("{:04}-{:02}", year, month)
}

/// Serialize the original row as an opaque JSON payload, keyed by the file's
/// own headers, for forensic/cleanup tooling
pub fn raw_payload_json(headers: &[String], row: &[Data]) -> String {
    let mut payload = serde_json::Map::new();
    for (idx, header) in headers.iter().enumerate() {
        let value = row.get(idx).map(cell_to_string).unwrap_or_default();
        payload.insert(header.clone(), serde_json::Value::String(value));
    }
    serde_json::Value::Object(payload).to_string()
}

/// Builder for one operator report line
#[derive(Debug, Default)]
pub struct ReportLineBuilder {
    sim_id: i64,
    import_id: i64,
    phone_number: Option<String>,
    city_code: Option<String>,
    commission_paid_80: Decimal,
    commission_paid_20: Decimal,
    total_commission: Option<Decimal>,
    recharge_amount: Option<Decimal>,
    payment_percentage: Option<Decimal>,
    period_year: i32,
    period_month: u32,
    consolidated: bool,
    raw_payload: Option<String>,
}

impl ReportLineBuilder {
    pub fn new(sim_id: i64, import_id: i64) -> Self {
        Self {
            sim_id,
            import_id,
            ..Default::default()
        }
    }

    pub fn phone_number(mut self, phone: impl Into<String>) -> Self {
        self.phone_number = Some(phone.into());
        self
    }

    pub fn city_code(mut self, code: impl Into<String>) -> Self {
        self.city_code = Some(code.into());
        self
    }

    pub fn commission_paid_80(mut self, amount: Decimal) -> Self {
        self.commission_paid_80 = amount;
        self
    }

    pub fn commission_paid_20(mut self, amount: Decimal) -> Self {
        self.commission_paid_20 = amount;
        self
    }

    pub fn total_commission(mut self, amount: Decimal) -> Self {
        self.total_commission = Some(amount);
        self
    }

    pub fn recharge_amount(mut self, amount: Decimal) -> Self {
        self.recharge_amount = Some(amount);
        self
    }

    /// Payment percentage normalized to a 0-1 fraction: stored values above
    /// 1 arrive as percents and are divided by 100
    pub fn payment_percentage(mut self, pct: Decimal) -> Self {
        let normalized = if pct > Decimal::ONE {
            pct / Decimal::from(100)
        } else {
            pct
        };
        self.payment_percentage = Some(normalized);
        self
    }

    pub fn period(mut self, year: i32, month: u32) -> Self {
        self.period_year = year;
        self.period_month = month;
        self
    }

    pub fn consolidated(mut self, flag: bool) -> Self {
        self.consolidated = flag;
        self
    }

    pub fn raw_payload(mut self, payload: String) -> Self {
        self.raw_payload = Some(payload);
        self
    }

    pub fn build(self) -> ReportLine {
        ReportLine {
            id: None,
            sim_id: self.sim_id,
            import_id: self.import_id,
            phone_number: self.phone_number,
            city_code: self.city_code,
            commission_paid_80: self.commission_paid_80,
            commission_paid_20: self.commission_paid_20,
            total_commission: self.total_commission,
            recharge_amount: self.recharge_amount,
            payment_percentage: self.payment_percentage,
            period_year: self.period_year,
            period_month: self.period_month,
            period_label: period_label(self.period_year, self.period_month),
            consolidated: self.consolidated,
            raw_payload: self.raw_payload,
            created_at: chrono::Utc::now(),
        }
    }
}

/// Builder for one recharge line
#[derive(Debug, Default)]
pub struct RechargeLineBuilder {
    sim_id: i64,
    import_id: i64,
    amount: Decimal,
    recharge_date: Option<NaiveDate>,
    period_year: Option<i32>,
    period_month: Option<u32>,
}

impl RechargeLineBuilder {
    pub fn new(sim_id: i64, import_id: i64) -> Self {
        Self {
            sim_id,
            import_id,
            ..Default::default()
        }
    }

    pub fn amount(mut self, amount: Decimal) -> Self {
        self.amount = amount;
        self
    }

    /// Sets the recharge date; the period derives from it unless `period`
    /// is called explicitly
    pub fn recharge_date(mut self, date: NaiveDate) -> Self {
        self.recharge_date = Some(date);
        self
    }

    pub fn period(mut self, year: i32, month: u32) -> Self {
        self.period_year = Some(year);
        self.period_month = Some(month);
        self
    }

    pub fn build(self) -> RechargeLine {
        let date = self
            .recharge_date
            .unwrap_or_else(|| NaiveDate::from_ymd_opt(1970, 1, 1).expect("valid date"));
        let year = self.period_year.unwrap_or_else(|| date.year());
        let month = self.period_month.unwrap_or_else(|| date.month());
        RechargeLine {
            id: None,
            sim_id: self.sim_id,
            import_id: self.import_id,
            amount: self.amount,
            recharge_date: date,
            period_year: year,
            period_month: month,
            period_label: period_label(year, month),
            created_at: chrono::Utc::now(),
        }
    }
}

/// Builder for one sales condition line
#[derive(Debug, Default)]
pub struct SalesConditionBuilder {
    sim_id: i64,
    import_id: i64,
    pos_id: i64,
    sale_price: Decimal,
    commission_percentage: Decimal,
    population: Option<String>,
    period_year: Option<i32>,
    period_month: Option<u32>,
    sale_date: Option<NaiveDate>,
}

impl SalesConditionBuilder {
    pub fn new(sim_id: i64, import_id: i64) -> Self {
        Self {
            sim_id,
            import_id,
            ..Default::default()
        }
    }

    pub fn pos_id(mut self, pos_id: i64) -> Self {
        self.pos_id = pos_id;
        self
    }

    pub fn sale_price(mut self, price: Decimal) -> Self {
        self.sale_price = price;
        self
    }

    /// Stored as the percent number itself ("7%" -> 7)
    pub fn commission_percentage(mut self, pct: Decimal) -> Self {
        self.commission_percentage = pct;
        self
    }

    pub fn population(mut self, population: impl Into<String>) -> Self {
        self.population = Some(population.into());
        self
    }

    pub fn sale_date(mut self, date: NaiveDate) -> Self {
        self.sale_date = Some(date);
        self
    }

    pub fn period(mut self, year: i32, month: u32) -> Self {
        self.period_year = Some(year);
        self.period_month = Some(month);
        self
    }

    pub fn build(self) -> SalesConditionLine {
        let (year, month) = match (self.period_year, self.period_month) {
            (Some(y), Some(m)) => (y, m),
            _ => self
                .sale_date
                .map(|d| (d.year(), d.month()))
                .unwrap_or((0, 0)),
        };
        SalesConditionLine {
            id: None,
            sim_id: self.sim_id,
            import_id: self.import_id,
            pos_id: self.pos_id,
            sale_price: self.sale_price,
            commission_percentage: self.commission_percentage,
            population: self.population,
            period_year: year,
            period_month: month,
            period_label: period_label(year, month),
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_period_label_zero_pads() {
        assert_eq!(period_label(2026, 3), "2026-03");
        assert_eq!(period_label(2026, 11), "2026-11");
    }

    #[test]
    fn test_report_builder_setters_are_independent() {
        let line = ReportLineBuilder::new(1, 2)
            .commission_paid_20(dec!(2.5))
            .period(2026, 7)
            .build();
        assert_eq!(line.sim_id, 1);
        assert_eq!(line.import_id, 2);
        assert_eq!(line.commission_paid_80, Decimal::ZERO);
        assert_eq!(line.commission_paid_20, dec!(2.5));
        assert_eq!(line.period_label, "2026-07");
        assert!(line.phone_number.is_none());
    }

    #[test]
    fn test_payment_percentage_normalized_to_fraction() {
        let as_percent = ReportLineBuilder::new(1, 1)
            .payment_percentage(dec!(85))
            .build();
        assert_eq!(as_percent.payment_percentage, Some(dec!(0.85)));

        let as_fraction = ReportLineBuilder::new(1, 1)
            .payment_percentage(dec!(0.85))
            .build();
        assert_eq!(as_fraction.payment_percentage, Some(dec!(0.85)));
    }

    #[test]
    fn test_recharge_period_derived_from_date() {
        let line = RechargeLineBuilder::new(1, 1)
            .amount(dec!(10))
            .recharge_date(NaiveDate::from_ymd_opt(2026, 2, 28).unwrap())
            .build();
        assert_eq!(line.period_year, 2026);
        assert_eq!(line.period_month, 2);
        assert_eq!(line.period_label, "2026-02");
    }

    #[test]
    fn test_sales_condition_period_from_sale_date() {
        let line = SalesConditionBuilder::new(1, 1)
            .pos_id(9)
            .sale_price(dec!(10000))
            .commission_percentage(dec!(7))
            .sale_date(NaiveDate::from_ymd_opt(2026, 5, 12).unwrap())
            .build();
        assert_eq!(line.period_label, "2026-05");
        assert_eq!(line.sale_price, dec!(10000));
        assert_eq!(line.commission_percentage, dec!(7));
    }

    #[test]
    fn test_raw_payload_preserves_original_headers() {
        let headers = vec!["VALOR".to_string(), "RESIDUAL".to_string()];
        let row = vec![
            Data::String("10000".to_string()),
            Data::String("7%".to_string()),
        ];
        let payload = raw_payload_json(&headers, &row);
        let parsed: serde_json::Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(parsed["VALOR"], "10000");
        assert_eq!(parsed["RESIDUAL"], "7%");
    }
}
