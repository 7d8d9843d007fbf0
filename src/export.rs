use crate::aggregation::MasterTable;
use crate::engine::ForecastTable;
use crate::error::{PipelineError, Result};
use crate::ingestion::{RawRecord, RawValue};
use crate::schema::InputColumns;
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

pub const FORECAST_COLUMNS: [&str; 8] = [
    "month",
    "kpi_name",
    "actual",
    "predicted",
    "lower_bound",
    "upper_bound",
    "is_forecast",
    "confidence",
];

/// Reads raw export rows. Only the three configured columns are used;
/// empty value cells become `RawValue::Missing`.
pub fn read_raw_records<R: Read>(reader: R, columns: &InputColumns) -> Result<Vec<RawRecord>> {
    let mut csv_reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(reader);

    let headers = csv_reader.headers()?.clone();
    let position = |name: &str| headers.iter().position(|h| h == name);

    let (date_idx, label_idx, value_idx) = match (
        position(&columns.date),
        position(&columns.kpi_label),
        position(&columns.value),
    ) {
        (Some(d), Some(l), Some(v)) => (d, l, v),
        (d, l, v) => {
            let missing = [(d, &columns.date), (l, &columns.kpi_label), (v, &columns.value)]
                .into_iter()
                .filter(|(idx, _)| idx.is_none())
                .map(|(_, name)| name.clone())
                .collect();
            return Err(PipelineError::MissingColumns(missing));
        }
    };

    let mut records = Vec::new();
    for row in csv_reader.records() {
        let row = row?;
        let cell = |idx: usize| row.get(idx).unwrap_or("");

        let raw_value = match cell(value_idx) {
            "" => RawValue::Missing,
            text => RawValue::Text(text.to_string()),
        };

        records.push(RawRecord {
            raw_date: cell(date_idx).to_string(),
            kpi_label: cell(label_idx).to_string(),
            raw_value,
        });
    }

    Ok(records)
}

pub fn read_raw_records_from_path(
    path: impl AsRef<Path>,
    columns: &InputColumns,
) -> Result<Vec<RawRecord>> {
    read_raw_records(File::open(path)?, columns)
}

/// One row per month, one column per KPI; no-data cells are left empty.
pub fn write_master_table<W: Write>(writer: W, master: &MasterTable) -> Result<()> {
    let mut csv_writer = csv::Writer::from_writer(writer);

    let mut header = vec!["month".to_string()];
    header.extend(master.kpis.iter().cloned());
    csv_writer.write_record(&header)?;

    for row in &master.rows {
        let mut record = vec![row.month.format("%Y-%m-%d").to_string()];
        for kpi in &master.kpis {
            record.push(format_optional(row.values.get(kpi).copied().flatten()));
        }
        csv_writer.write_record(&record)?;
    }

    csv_writer.flush()?;
    Ok(())
}

pub fn write_forecast_table<W: Write>(writer: W, forecasts: &ForecastTable) -> Result<()> {
    let mut csv_writer = csv::Writer::from_writer(writer);
    csv_writer.write_record(FORECAST_COLUMNS)?;

    for point in &forecasts.points {
        let confidence = forecasts
            .diagnostics(&point.kpi_name)
            .map(|d| d.confidence.label())
            .unwrap_or("unknown");

        csv_writer.write_record([
            point.month.format("%Y-%m-%d").to_string(),
            point.kpi_name.clone(),
            format_optional(point.actual),
            point.predicted.to_string(),
            point.lower_bound.to_string(),
            point.upper_bound.to_string(),
            point.is_forecast.to_string(),
            confidence.to_string(),
        ])?;
    }

    csv_writer.flush()?;
    Ok(())
}

pub fn write_master_table_to_path(path: impl AsRef<Path>, master: &MasterTable) -> Result<()> {
    write_master_table(File::create(path)?, master)
}

pub fn write_forecast_table_to_path(
    path: impl AsRef<Path>,
    forecasts: &ForecastTable,
) -> Result<()> {
    write_forecast_table(File::create(path)?, forecasts)
}

fn format_optional(value: Option<f64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}
