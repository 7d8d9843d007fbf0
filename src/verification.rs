use crate::aggregation::MasterTable;
use crate::engine::ForecastTable;
use crate::error::{PipelineError, Result};
use crate::utils::first_of_month;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default)]
pub struct VerificationResult {
    pub warnings: Vec<String>,
}

/// Months strictly ascending and first-of-month, every KPI in every row.
pub fn verify_master_table(master: &MasterTable) -> Result<VerificationResult> {
    let mut result = VerificationResult::default();

    for window in master.rows.windows(2) {
        if window[1].month <= window[0].month {
            return Err(PipelineError::DataIntegrity(format!(
                "Months out of order: {} follows {}",
                window[1].month, window[0].month
            )));
        }
    }

    for row in &master.rows {
        if first_of_month(row.month) != row.month {
            return Err(PipelineError::DataIntegrity(format!(
                "Month {} is not the first day of its month",
                row.month
            )));
        }

        if let Some(missing) = master.kpis.iter().find(|k| !row.values.contains_key(*k)) {
            return Err(PipelineError::DataIntegrity(format!(
                "Row {} is missing KPI '{}'",
                row.month, missing
            )));
        }

        if row.values.len() != master.kpis.len() {
            return Err(PipelineError::DataIntegrity(format!(
                "Row {} holds {} KPIs, table declares {}",
                row.month,
                row.values.len(),
                master.kpis.len()
            )));
        }
    }

    for kpi in &master.kpis {
        if master.observed_count(kpi) == 0 {
            result
                .warnings
                .push(format!("KPI '{}' has no observed months", kpi));
        }
    }

    Ok(result)
}

/// Bounds bracket the prediction, actuals only on history, and intervals
/// never narrow further into the future.
pub fn verify_forecast_table(forecasts: &ForecastTable) -> Result<VerificationResult> {
    let mut result = VerificationResult::default();
    let mut last_width: BTreeMap<&str, f64> = BTreeMap::new();

    for point in &forecasts.points {
        if !(point.lower_bound <= point.predicted && point.predicted <= point.upper_bound) {
            return Err(PipelineError::DataIntegrity(format!(
                "{} {}: bounds [{}, {}] do not contain prediction {}",
                point.kpi_name, point.month, point.lower_bound, point.upper_bound, point.predicted
            )));
        }

        if point.is_forecast && point.actual.is_some() {
            return Err(PipelineError::DataIntegrity(format!(
                "{} {}: forecast month carries an actual value",
                point.kpi_name, point.month
            )));
        }

        if point.is_forecast {
            let width = point.upper_bound - point.lower_bound;
            if let Some(previous) = last_width.insert(point.kpi_name.as_str(), width) {
                if width + 1e-9 < previous {
                    return Err(PipelineError::DataIntegrity(format!(
                        "{} {}: interval narrowed from {} to {}",
                        point.kpi_name, point.month, previous, width
                    )));
                }
            }
        }
    }

    for (kpi, diagnostics) in &forecasts.diagnostics {
        if diagnostics.confidence.is_low() {
            result.warnings.push(format!(
                "KPI '{}' forecast is low confidence ({})",
                kpi,
                diagnostics.confidence.label()
            ));
        }
    }

    Ok(result)
}
