//! simledger - telecom retail commission tracking
//!
//! Ingests operator-supplied spreadsheets (commission reports, recharges,
//! sales conditions, store and point-of-sale master data) into SQLite,
//! reconciles recharges against confirmed operator reports, and keeps an
//! auditable balance ledger per retail store.

pub mod db;
pub mod error;
pub mod importers;
pub mod ledger;
pub mod orphans;

pub use error::{ImportError, Result};
