pub mod db;
pub mod domain;

pub use domain::{CellValue, Column, ColumnSelector, EnergyUsageRecord, UsageRow};
