//! What-if projections between two KPIs.
//!
//! The impacted KPI responds to the driver through the historical
//! least-squares slope. This is a descriptive, linear, correlation-based
//! projection and not a causal simulation.

use crate::aggregation::MasterTable;
use crate::engine::ForecastTable;
use crate::error::{PipelineError, Result};
use crate::schema::ScenarioSettings;
use chrono::NaiveDate;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub const METHOD_NOTE: &str = "Linear projection from the historical correlation between the two KPIs. \
It describes how the KPIs moved together in the past and is not a causal estimate.";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrelationPair {
    pub driver_kpi: String,
    pub impacted_kpi: String,
    /// Pearson correlation, clamped to [-1, 1].
    pub correlation_coefficient: f64,
    /// Least-squares slope of impacted on driver.
    pub regression_slope: f64,
    pub overlapping_points: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioRequest {
    pub driver_kpi: String,
    pub impacted_kpi: String,
    /// Percentage change applied to the driver forecast; 10.0 means +10%.
    pub delta_percent: f64,
}

impl ScenarioRequest {
    pub fn new(driver_kpi: &str, impacted_kpi: &str, delta_percent: f64) -> Self {
        Self {
            driver_kpi: driver_kpi.to_string(),
            impacted_kpi: impacted_kpi.to_string(),
            delta_percent,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScenarioFlag {
    WeakCorrelation,
    DriverFallback,
    ImpactedFallback,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioPoint {
    pub month: NaiveDate,
    pub driver_baseline: f64,
    pub driver_adjusted: f64,
    pub driver_delta: f64,
    pub impacted_baseline: f64,
    pub impacted_adjustment: f64,
    pub impacted_adjusted: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioResult {
    pub request: ScenarioRequest,
    pub correlation: CorrelationPair,
    pub points: Vec<ScenarioPoint>,
    pub flags: Vec<ScenarioFlag>,
    pub method_note: String,
}

impl ScenarioResult {
    pub fn is_low_confidence(&self) -> bool {
        !self.flags.is_empty()
    }

    pub fn point(&self, month: NaiveDate) -> Option<&ScenarioPoint> {
        self.points.iter().find(|p| p.month == month)
    }
}

/// Computes correlations from the master table and applies scenarios to
/// the forecast table. Correlations are memoized for the model's lifetime.
pub struct ScenarioModel<'a> {
    master: &'a MasterTable,
    forecasts: &'a ForecastTable,
    settings: ScenarioSettings,
    cache: HashMap<(String, String), CorrelationPair>,
}

impl<'a> ScenarioModel<'a> {
    pub fn new(
        master: &'a MasterTable,
        forecasts: &'a ForecastTable,
        settings: ScenarioSettings,
    ) -> Self {
        Self {
            master,
            forecasts,
            settings,
            cache: HashMap::new(),
        }
    }

    pub fn clear_cache(&mut self) {
        self.cache.clear();
    }

    pub fn cached_pairs(&self) -> usize {
        self.cache.len()
    }

    pub fn correlation(&mut self, driver: &str, impacted: &str) -> Result<CorrelationPair> {
        let key = (driver.to_string(), impacted.to_string());
        if let Some(pair) = self.cache.get(&key) {
            return Ok(pair.clone());
        }

        let pair = correlate(self.master, driver, impacted, self.settings.min_overlap_points)?;
        debug!(
            "Correlation {} -> {}: r={:.4}, slope={:.4} over {} months",
            driver,
            impacted,
            pair.correlation_coefficient,
            pair.regression_slope,
            pair.overlapping_points
        );
        self.cache.insert(key, pair.clone());
        Ok(pair)
    }

    pub fn run(&mut self, request: &ScenarioRequest) -> Result<ScenarioResult> {
        if !request.delta_percent.is_finite() {
            return Err(PipelineError::InvalidScenario(format!(
                "Percentage change must be finite, got {}",
                request.delta_percent
            )));
        }

        let driver = request.driver_kpi.as_str();
        let impacted = request.impacted_kpi.as_str();
        for kpi in [driver, impacted] {
            if self.forecasts.diagnostics(kpi).is_none() {
                return Err(PipelineError::UnknownKpi(kpi.to_string()));
            }
        }

        let correlation = self.correlation(driver, impacted)?;
        let factor = request.delta_percent / 100.0;

        let mut points = Vec::new();
        for driver_point in self.forecasts.future_points(driver) {
            let impacted_point = self
                .forecasts
                .point(impacted, driver_point.month)
                .ok_or_else(|| {
                    PipelineError::InvalidScenario(format!(
                        "No forecast for '{}' in {}",
                        impacted, driver_point.month
                    ))
                })?;

            let driver_baseline = driver_point.predicted;
            let driver_delta = driver_baseline * factor;
            let impacted_adjustment = correlation.regression_slope * driver_delta;

            points.push(ScenarioPoint {
                month: driver_point.month,
                driver_baseline,
                driver_adjusted: driver_baseline + driver_delta,
                driver_delta,
                impacted_baseline: impacted_point.predicted,
                impacted_adjustment,
                impacted_adjusted: impacted_point.predicted + impacted_adjustment,
            });
        }

        let mut flags = Vec::new();
        if correlation.correlation_coefficient.abs() < self.settings.weak_correlation_threshold {
            warn!(
                "Weak correlation ({:.3}) between {} and {}",
                correlation.correlation_coefficient, driver, impacted
            );
            flags.push(ScenarioFlag::WeakCorrelation);
        }
        if self.is_fallback(driver) {
            flags.push(ScenarioFlag::DriverFallback);
        }
        if self.is_fallback(impacted) {
            flags.push(ScenarioFlag::ImpactedFallback);
        }

        Ok(ScenarioResult {
            request: request.clone(),
            correlation,
            points,
            flags,
            method_note: METHOD_NOTE.to_string(),
        })
    }

    fn is_fallback(&self, kpi: &str) -> bool {
        self.forecasts
            .diagnostics(kpi)
            .map(|d| d.confidence.is_fallback())
            .unwrap_or(false)
    }
}

/// Pearson correlation and regression slope over the months where both
/// KPIs have data.
pub fn correlate(
    master: &MasterTable,
    driver: &str,
    impacted: &str,
    min_overlap: usize,
) -> Result<CorrelationPair> {
    let driver_series = master
        .series(driver)
        .ok_or_else(|| PipelineError::UnknownKpi(driver.to_string()))?;
    let impacted_series = master
        .series(impacted)
        .ok_or_else(|| PipelineError::UnknownKpi(impacted.to_string()))?;

    let pairs: Vec<(f64, f64)> = driver_series
        .iter()
        .zip(impacted_series.iter())
        .filter_map(|((_, x), (_, y))| match (x, y) {
            (Some(x), Some(y)) => Some((*x, *y)),
            _ => None,
        })
        .collect();

    let insufficient = |details: String| PipelineError::InsufficientData {
        driver: driver.to_string(),
        impacted: impacted.to_string(),
        details,
    };

    if pairs.len() < min_overlap {
        return Err(insufficient(format!(
            "{} overlapping months, at least {} required",
            pairs.len(),
            min_overlap
        )));
    }

    let n = pairs.len() as f64;
    let x_mean = pairs.iter().map(|(x, _)| x).sum::<f64>() / n;
    let y_mean = pairs.iter().map(|(_, y)| y).sum::<f64>() / n;

    let mut sxx = 0.0;
    let mut syy = 0.0;
    let mut sxy = 0.0;
    for (x, y) in &pairs {
        sxx += (x - x_mean).powi(2);
        syy += (y - y_mean).powi(2);
        sxy += (x - x_mean) * (y - y_mean);
    }

    if sxx <= 0.0 || syy <= 0.0 {
        return Err(insufficient(
            "one of the series has no variance over the overlapping months".to_string(),
        ));
    }

    Ok(CorrelationPair {
        driver_kpi: driver.to_string(),
        impacted_kpi: impacted.to_string(),
        correlation_coefficient: (sxy / (sxx.sqrt() * syy.sqrt())).clamp(-1.0, 1.0),
        regression_slope: sxy / sxx,
        overlapping_points: pairs.len(),
    })
}
