pub mod energy_usage;

pub use energy_usage::{CellValue, Column, ColumnSelector, EnergyUsageRecord, UnknownColumn, UsageRow};
