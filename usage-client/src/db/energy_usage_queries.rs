use sqlx::{postgres::PgRow, PgPool, Row};
use time::OffsetDateTime;

use crate::domain::{CellValue, Column, ColumnSelector, EnergyUsageRecord, UsageRow};

/// Schema for the usage table. Floats are stored as DOUBLE PRECISION so they
/// decode straight into `f64`.
pub const CREATE_ENERGY_USAGE_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS energy_usage (
        device VARCHAR(255) NOT NULL,
        timestamp TIMESTAMPTZ NOT NULL,
        power_draw_watts DOUBLE PRECISION NOT NULL,
        avg_emitted_mgco2e DOUBLE PRECISION,
        grid_carbon_intensity_gco2perkwhr DOUBLE PRECISION,
        PRIMARY KEY (device, timestamp)
    )
"#;

pub fn insert_sql() -> String {
    let columns: Vec<&str> = Column::ALL.iter().map(|c| c.name()).collect();
    let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("${i}")).collect();
    format!(
        "INSERT INTO energy_usage ({}) VALUES ({})",
        columns.join(", "),
        placeholders.join(", ")
    )
}

/// Most-recent-first selection; the row limit is bound as `$1`.
pub fn select_latest_sql(selector: &ColumnSelector) -> String {
    let columns = match selector {
        ColumnSelector::All => "*".to_string(),
        ColumnSelector::Only(cols) => cols.iter().map(|c| c.name()).collect::<Vec<_>>().join(", "),
    };
    format!("SELECT {columns} FROM energy_usage ORDER BY timestamp DESC LIMIT $1")
}

pub async fn create_table(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::query(CREATE_ENERGY_USAGE_TABLE).execute(pool).await.map(|_| ())
}

pub async fn insert_usage(pool: &PgPool, record: &EnergyUsageRecord) -> Result<(), sqlx::Error> {
    sqlx::query(&insert_sql())
        .bind(&record.device)
        .bind(record.timestamp)
        .bind(record.power_draw_watts)
        .bind(record.avg_emitted_mg_co2e)
        .bind(record.grid_carbon_intensity_g_per_kwh)
        .execute(pool)
        .await
        .map(|_| ())
}

/// Fetch the latest `limit` rows restricted to the selected columns.
pub async fn latest_rows(
    pool: &PgPool,
    limit: i64,
    selector: &ColumnSelector,
) -> Result<Vec<UsageRow>, sqlx::Error> {
    let rows = sqlx::query(&select_latest_sql(selector))
        .bind(limit)
        .fetch_all(pool)
        .await?;

    let columns = selector.columns();
    rows.iter().map(|row| decode_row(row, &columns)).collect()
}

fn decode_row(row: &PgRow, columns: &[Column]) -> Result<UsageRow, sqlx::Error> {
    let mut cells = Vec::with_capacity(columns.len());
    for &col in columns {
        let value = match col {
            Column::Device => CellValue::Text(row.try_get::<String, _>(col.name())?),
            Column::Timestamp => CellValue::Timestamp(row.try_get::<OffsetDateTime, _>(col.name())?),
            Column::PowerDrawWatts => CellValue::Float(row.try_get::<f64, _>(col.name())?),
            Column::AvgEmittedMgCo2e | Column::GridCarbonIntensity => {
                row.try_get::<Option<f64>, _>(col.name())?.into()
            }
        };
        cells.push((col, value));
    }
    Ok(UsageRow { cells })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_sql_lists_every_column_with_positional_binds() {
        assert_eq!(
            insert_sql(),
            "INSERT INTO energy_usage (device, timestamp, power_draw_watts, avg_emitted_mgco2e, \
             grid_carbon_intensity_gco2perkwhr) VALUES ($1, $2, $3, $4, $5)"
        );
    }

    #[test]
    fn select_sql_orders_most_recent_first() {
        assert_eq!(
            select_latest_sql(&ColumnSelector::All),
            "SELECT * FROM energy_usage ORDER BY timestamp DESC LIMIT $1"
        );
        assert_eq!(
            select_latest_sql(&ColumnSelector::Only(vec![Column::Device, Column::PowerDrawWatts])),
            "SELECT device, power_draw_watts FROM energy_usage ORDER BY timestamp DESC LIMIT $1"
        );
    }
}
