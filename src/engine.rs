use crate::aggregation::MasterTable;
use crate::error::{PipelineError, Result};
use crate::schema::ForecastSettings;
use crate::seasonality::{estimate_seasonal_profile, SeasonalProfile};
use crate::utils::{add_months, months_between, normalize_label};
use chrono::{Datelike, NaiveDate};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastPoint {
    pub month: NaiveDate,
    pub kpi_name: String,
    /// Present only for historical months that had data.
    pub actual: Option<f64>,
    pub predicted: f64,
    pub lower_bound: f64,
    pub upper_bound: f64,
    pub is_forecast: bool,
    pub low_confidence: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ForecastConfidence {
    Normal,
    /// The fit succeeded but on less history than a full two-year cycle.
    LimitedHistory { observed: usize },
    /// Flat-line forecast after the model could not be fitted.
    Fallback { reason: String },
}

impl ForecastConfidence {
    pub fn is_low(&self) -> bool {
        !matches!(self, ForecastConfidence::Normal)
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self, ForecastConfidence::Fallback { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            ForecastConfidence::Normal => "normal",
            ForecastConfidence::LimitedHistory { .. } => "limited_history",
            ForecastConfidence::Fallback { .. } => "fallback",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastDiagnostics {
    pub kpi_name: String,
    pub confidence: ForecastConfidence,
    pub observed_points: usize,
    pub used_seasonality: bool,
    pub trend_slope: f64,
    pub residual_std_error: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KpiForecast {
    pub diagnostics: ForecastDiagnostics,
    pub points: Vec<ForecastPoint>,
}

/// Forecast points for every KPI, ordered by KPI name then month.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastTable {
    pub horizon_months: usize,
    pub points: Vec<ForecastPoint>,
    pub diagnostics: BTreeMap<String, ForecastDiagnostics>,
}

impl ForecastTable {
    pub fn kpi_names(&self) -> Vec<&str> {
        self.diagnostics.keys().map(String::as_str).collect()
    }

    pub fn find_kpi(&self, name: &str) -> Option<&str> {
        let wanted = normalize_label(name);
        self.diagnostics
            .keys()
            .find(|k| normalize_label(k) == wanted)
            .map(String::as_str)
    }

    pub fn series(&self, kpi: &str) -> Vec<&ForecastPoint> {
        self.points.iter().filter(|p| p.kpi_name == kpi).collect()
    }

    pub fn future_points(&self, kpi: &str) -> Vec<&ForecastPoint> {
        self.points
            .iter()
            .filter(|p| p.kpi_name == kpi && p.is_forecast)
            .collect()
    }

    /// The next `count` forecast months for a KPI.
    pub fn upcoming(&self, kpi: &str, count: usize) -> Vec<&ForecastPoint> {
        self.future_points(kpi).into_iter().take(count).collect()
    }

    pub fn point(&self, kpi: &str, month: NaiveDate) -> Option<&ForecastPoint> {
        self.points
            .iter()
            .find(|p| p.kpi_name == kpi && p.month == month)
    }

    pub fn diagnostics(&self, kpi: &str) -> Option<&ForecastDiagnostics> {
        self.diagnostics.get(kpi)
    }

    pub fn to_json(&self) -> std::result::Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

struct TrendFit {
    intercept: f64,
    slope: f64,
    t_mean: f64,
    sxx: f64,
}

impl TrendFit {
    fn at(&self, t: f64) -> f64 {
        self.intercept + self.slope * t
    }
}

// Ordinary least squares of y on t. None when every t is identical.
fn fit_trend(points: &[(f64, f64)]) -> Option<TrendFit> {
    let n = points.len() as f64;
    if points.is_empty() {
        return None;
    }

    let t_mean = points.iter().map(|(t, _)| t).sum::<f64>() / n;
    let y_mean = points.iter().map(|(_, y)| y).sum::<f64>() / n;

    let mut sxx = 0.0;
    let mut sxy = 0.0;
    for (t, y) in points {
        sxx += (t - t_mean).powi(2);
        sxy += (t - t_mean) * (y - y_mean);
    }

    if sxx <= 0.0 || !sxx.is_finite() {
        return None;
    }

    let slope = sxy / sxx;
    Some(TrendFit {
        intercept: y_mean - slope * t_mean,
        slope,
        t_mean,
        sxx,
    })
}

// Trend slope with each calendar month demeaned separately, i.e. the OLS
// slope of a regression with one dummy per calendar month.
fn within_month_slope<F>(observed: &[(NaiveDate, f64)], t_of: &F) -> Option<f64>
where
    F: Fn(NaiveDate) -> f64,
{
    let mut sums = [(0.0, 0.0, 0usize); 12];
    for (month, value) in observed {
        let slot = &mut sums[month.month0() as usize];
        slot.0 += t_of(*month);
        slot.1 += value;
        slot.2 += 1;
    }

    let mut sxx = 0.0;
    let mut sxy = 0.0;
    for (month, value) in observed {
        let (t_sum, y_sum, count) = sums[month.month0() as usize];
        let t = t_of(*month) - t_sum / count as f64;
        sxx += t * t;
        sxy += t * (value - y_sum / count as f64);
    }

    if sxx <= 0.0 || !sxx.is_finite() {
        return None;
    }
    Some(sxy / sxx)
}

/// Fits one additive trend + yearly seasonality model per KPI.
pub struct ForecastEngine {
    settings: ForecastSettings,
}

impl ForecastEngine {
    /// A negative or NaN z-score is clamped to zero so bounds never invert.
    pub fn new(mut settings: ForecastSettings) -> Self {
        if !(settings.interval_z_score >= 0.0) {
            warn!(
                "Interval z-score {} is not usable, falling back to 0",
                settings.interval_z_score
            );
            settings.interval_z_score = 0.0;
        }
        Self { settings }
    }

    pub fn settings(&self) -> &ForecastSettings {
        &self.settings
    }

    /// Fits the model to one KPI's history. Fails with `FitFailure` on
    /// degenerate input; see `forecast_kpi` for the recovering variant.
    pub fn fit_kpi(
        &self,
        kpi: &str,
        history: &[(NaiveDate, Option<f64>)],
        future_months: &[NaiveDate],
    ) -> Result<KpiForecast> {
        let fail = |reason: &str| PipelineError::FitFailure {
            kpi: kpi.to_string(),
            reason: reason.to_string(),
        };

        let origin = history
            .first()
            .map(|(month, _)| *month)
            .ok_or_else(|| fail("empty history"))?;

        let observed: Vec<(NaiveDate, f64)> = history
            .iter()
            .filter_map(|(month, value)| value.map(|v| (*month, v)))
            .collect();

        if observed.is_empty() {
            return Err(fail("no observations"));
        }
        if observed.iter().any(|(_, v)| !v.is_finite()) {
            return Err(fail("non-finite values in history"));
        }
        if observed.len() < 2 {
            return Err(fail("fewer than 2 observations"));
        }

        let min = observed.iter().map(|(_, v)| *v).fold(f64::INFINITY, f64::min);
        let max = observed.iter().map(|(_, v)| *v).fold(f64::NEG_INFINITY, f64::max);
        if max - min <= 1e-12 * max.abs().max(1.0) {
            return Err(fail("zero variance series"));
        }

        let t_of = |month: NaiveDate| months_between(origin, month) as f64;

        let n = observed.len();
        let seasonal_profile = if n >= self.settings.min_points_for_seasonality {
            within_month_slope(&observed, &t_of).map(|slope| {
                let residuals: Vec<(NaiveDate, f64)> = observed
                    .iter()
                    .map(|(m, v)| (*m, v - slope * t_of(*m)))
                    .collect();
                estimate_seasonal_profile(&residuals)
            })
        } else {
            None
        };
        let used_seasonality = seasonal_profile.is_some();
        let profile = seasonal_profile.unwrap_or_else(SeasonalProfile::flat);

        let deseasonalized: Vec<(f64, f64)> = profile
            .deseasonalize(&observed)
            .into_iter()
            .map(|(m, v)| (t_of(m), v))
            .collect();
        let trend = fit_trend(&deseasonalized).ok_or_else(|| fail("singular trend regression"))?;

        let fitted = |month: NaiveDate| trend.at(t_of(month)) + profile.offset(month);

        let sse: f64 = observed
            .iter()
            .map(|(m, v)| (v - fitted(*m)).powi(2))
            .sum();
        let covered_months = observed
            .iter()
            .map(|(m, _)| m.month0())
            .collect::<BTreeSet<_>>()
            .len();
        let parameters = if used_seasonality {
            2 + covered_months.saturating_sub(1)
        } else {
            2
        };
        let dof = if n > parameters { n - parameters } else { n };
        let sigma = (sse / dof as f64).sqrt();

        let z = self.settings.interval_z_score;
        let half_width = |month: NaiveDate| {
            let t = t_of(month);
            z * sigma * (1.0 + 1.0 / n as f64 + (t - trend.t_mean).powi(2) / trend.sxx).sqrt()
        };

        let confidence = if n < self.settings.full_confidence_points {
            ForecastConfidence::LimitedHistory { observed: n }
        } else {
            ForecastConfidence::Normal
        };
        let low_confidence = confidence.is_low();

        let mut result_points = Vec::with_capacity(history.len() + future_months.len());
        let months = history
            .iter()
            .map(|(m, actual)| (*m, *actual, false))
            .chain(future_months.iter().map(|m| (*m, None, true)));

        for (month, actual, is_forecast) in months {
            let predicted = fitted(month);
            let width = half_width(month);
            if !predicted.is_finite() || !width.is_finite() {
                return Err(fail("model produced non-finite values"));
            }
            result_points.push(ForecastPoint {
                month,
                kpi_name: kpi.to_string(),
                actual,
                predicted,
                lower_bound: predicted - width,
                upper_bound: predicted + width,
                is_forecast,
                low_confidence,
            });
        }

        debug!(
            "Fitted {}: {} points, slope {:.4}/month, sigma {:.4}, seasonal={}",
            kpi, n, trend.slope, sigma, used_seasonality
        );

        Ok(KpiForecast {
            diagnostics: ForecastDiagnostics {
                kpi_name: kpi.to_string(),
                confidence,
                observed_points: n,
                used_seasonality,
                trend_slope: trend.slope,
                residual_std_error: sigma,
            },
            points: result_points,
        })
    }

    /// Like `fit_kpi`, but a fit failure degrades to a flat-line forecast
    /// instead of an error.
    pub fn forecast_kpi(
        &self,
        kpi: &str,
        history: &[(NaiveDate, Option<f64>)],
        future_months: &[NaiveDate],
    ) -> KpiForecast {
        match self.fit_kpi(kpi, history, future_months) {
            Ok(forecast) => forecast,
            Err(err) => {
                let reason = match err {
                    PipelineError::FitFailure { reason, .. } => reason,
                    other => other.to_string(),
                };
                warn!("Using flat-line forecast for {}: {}", kpi, reason);
                flat_line(kpi, history, future_months, reason)
            }
        }
    }

    /// Forecasts a single series, computing the future months from its last
    /// historical month.
    pub fn forecast_series(
        &self,
        kpi: &str,
        history: &[(NaiveDate, Option<f64>)],
    ) -> Result<KpiForecast> {
        let last = history
            .last()
            .map(|(month, _)| *month)
            .ok_or_else(|| PipelineError::DateError(format!("Empty history for {}", kpi)))?;
        let future = self.future_months(last)?;
        Ok(self.forecast_kpi(kpi, history, &future))
    }

    /// Forecasts every KPI of the master table. One degenerate series never
    /// blocks the others.
    pub fn forecast_table(&self, master: &MasterTable) -> Result<ForecastTable> {
        let last = master.rows.last().map(|r| r.month).ok_or_else(|| {
            PipelineError::InsufficientHistory {
                months: 0,
                required: 2,
            }
        })?;
        let future = self.future_months(last)?;

        let mut points = Vec::new();
        let mut diagnostics = BTreeMap::new();
        let mut fallbacks = 0;

        for kpi in &master.kpis {
            let history = master.series(kpi).unwrap_or_default();
            let forecast = self.forecast_kpi(kpi, &history, &future);
            if forecast.diagnostics.confidence.is_fallback() {
                fallbacks += 1;
            }
            points.extend(forecast.points);
            diagnostics.insert(kpi.clone(), forecast.diagnostics);
        }

        info!(
            "Forecast {} KPIs over {} months ({} flat-line fallbacks)",
            diagnostics.len(),
            self.settings.horizon_months,
            fallbacks
        );

        Ok(ForecastTable {
            horizon_months: self.settings.horizon_months,
            points,
            diagnostics,
        })
    }

    fn future_months(&self, last_month: NaiveDate) -> Result<Vec<NaiveDate>> {
        (1..=self.settings.horizon_months as u32)
            .map(|step| add_months(last_month, step))
            .collect()
    }
}

/// Predicts the last observed value everywhere with a zero-width interval.
pub fn flat_line(
    kpi: &str,
    history: &[(NaiveDate, Option<f64>)],
    future_months: &[NaiveDate],
    reason: String,
) -> KpiForecast {
    let level = history
        .iter()
        .rev()
        .find_map(|(_, value)| value.filter(|v| v.is_finite()))
        .unwrap_or(0.0);
    let observed = history.iter().filter(|(_, v)| v.is_some()).count();

    let points = history
        .iter()
        .map(|(m, actual)| (*m, *actual, false))
        .chain(future_months.iter().map(|m| (*m, None, true)))
        .map(|(month, actual, is_forecast)| ForecastPoint {
            month,
            kpi_name: kpi.to_string(),
            actual,
            predicted: level,
            lower_bound: level,
            upper_bound: level,
            is_forecast,
            low_confidence: true,
        })
        .collect();

    KpiForecast {
        diagnostics: ForecastDiagnostics {
            kpi_name: kpi.to_string(),
            confidence: ForecastConfidence::Fallback { reason },
            observed_points: observed,
            used_seasonality: false,
            trend_slope: 0.0,
            residual_std_error: 0.0,
        },
        points,
    }
}

pub fn forecast_master_table(
    settings: &ForecastSettings,
    master: &MasterTable,
) -> Result<ForecastTable> {
    ForecastEngine::new(settings.clone()).forecast_table(master)
}
