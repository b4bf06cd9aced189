use std::fmt;

use time::{format_description::well_known::Rfc3339, OffsetDateTime};

/// One device's energy draw and attributed emission for a single sampling tick.
///
/// Identity is `(device, timestamp)`; the storage layer is expected to enforce
/// uniqueness. Records are never mutated once built.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct EnergyUsageRecord {
    pub device: String,
    #[cfg_attr(feature = "serde", serde(with = "time::serde::rfc3339"))]
    pub timestamp: OffsetDateTime,
    pub power_draw_watts: f64,
    #[cfg_attr(feature = "serde", serde(rename = "avg_emitted_mgco2e"))]
    pub avg_emitted_mg_co2e: Option<f64>,
    #[cfg_attr(feature = "serde", serde(rename = "grid_carbon_intensity_gco2perkwhr"))]
    pub grid_carbon_intensity_g_per_kwh: Option<f64>,
}

/// Storage columns of the `energy_usage` table, in schema order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Column {
    Device,
    Timestamp,
    PowerDrawWatts,
    AvgEmittedMgCo2e,
    GridCarbonIntensity,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown energy_usage column '{0}'")]
pub struct UnknownColumn(pub String);

impl Column {
    pub const ALL: [Column; 5] = [
        Column::Device,
        Column::Timestamp,
        Column::PowerDrawWatts,
        Column::AvgEmittedMgCo2e,
        Column::GridCarbonIntensity,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Column::Device => "device",
            Column::Timestamp => "timestamp",
            Column::PowerDrawWatts => "power_draw_watts",
            Column::AvgEmittedMgCo2e => "avg_emitted_mgco2e",
            Column::GridCarbonIntensity => "grid_carbon_intensity_gco2perkwhr",
        }
    }

    pub fn from_name(name: &str) -> Result<Self, UnknownColumn> {
        Column::ALL
            .into_iter()
            .find(|c| c.name() == name)
            .ok_or_else(|| UnknownColumn(name.to_string()))
    }
}

impl fmt::Display for Column {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Which columns a read should return.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ColumnSelector {
    #[default]
    All,
    Only(Vec<Column>),
}

impl ColumnSelector {
    /// Parse a list of column names; an empty list or `["*"]` selects everything.
    pub fn from_names<S: AsRef<str>>(names: &[S]) -> Result<Self, UnknownColumn> {
        if names.is_empty() || (names.len() == 1 && names[0].as_ref() == "*") {
            return Ok(ColumnSelector::All);
        }
        names
            .iter()
            .map(|n| Column::from_name(n.as_ref().trim()))
            .collect::<Result<Vec<_>, _>>()
            .map(ColumnSelector::Only)
    }

    pub fn columns(&self) -> Vec<Column> {
        match self {
            ColumnSelector::All => Column::ALL.to_vec(),
            ColumnSelector::Only(cols) => cols.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Text(String),
    Timestamp(OffsetDateTime),
    Float(f64),
    Null,
}

impl fmt::Display for CellValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CellValue::Text(s) => f.write_str(s),
            CellValue::Timestamp(ts) => match ts.format(&Rfc3339) {
                Ok(s) => f.write_str(&s),
                Err(_) => write!(f, "{ts}"),
            },
            CellValue::Float(v) => write!(f, "{v}"),
            CellValue::Null => f.write_str("NULL"),
        }
    }
}

impl From<Option<f64>> for CellValue {
    fn from(v: Option<f64>) -> Self {
        v.map(CellValue::Float).unwrap_or(CellValue::Null)
    }
}

/// A record projected onto a column selection, in selection order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct UsageRow {
    pub cells: Vec<(Column, CellValue)>,
}

impl UsageRow {
    pub fn get(&self, column: Column) -> Option<&CellValue> {
        self.cells.iter().find(|(c, _)| *c == column).map(|(_, v)| v)
    }
}

impl fmt::Display for UsageRow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (col, value)) in self.cells.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{col}={value}")?;
        }
        Ok(())
    }
}

impl EnergyUsageRecord {
    pub fn cell(&self, column: Column) -> CellValue {
        match column {
            Column::Device => CellValue::Text(self.device.clone()),
            Column::Timestamp => CellValue::Timestamp(self.timestamp),
            Column::PowerDrawWatts => CellValue::Float(self.power_draw_watts),
            Column::AvgEmittedMgCo2e => self.avg_emitted_mg_co2e.into(),
            Column::GridCarbonIntensity => self.grid_carbon_intensity_g_per_kwh.into(),
        }
    }

    pub fn project(&self, selector: &ColumnSelector) -> UsageRow {
        UsageRow {
            cells: selector
                .columns()
                .into_iter()
                .map(|c| (c, self.cell(c)))
                .collect(),
        }
    }
}
