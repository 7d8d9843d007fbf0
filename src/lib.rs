//! # Automotive KPI Forecast
//!
//! Turns raw monthly dealership financial records into a cleaned master
//! table, fits an independent forecast for every KPI, and projects how a
//! percentage change in one KPI's forecast carries over to a correlated KPI.
//!
//! ## Stages
//!
//! - **Normalizer** ([`ingestion`]): parses mixed date formats, maps raw labels
//!   onto the canonical KPI catalog and coerces values. Bad rows are counted,
//!   not raised.
//! - **Aggregator** ([`aggregation`]): one row per month, one column per KPI,
//!   using the rule configured for each KPI (sum, weighted average, last value).
//!   Missing data stays `None`.
//! - **Forecast Engine** ([`engine`]): additive linear trend plus yearly
//!   seasonality per KPI with widening uncertainty bounds. A series that cannot
//!   be fitted gets a flagged flat-line forecast and never blocks the others.
//! - **Scenario Model** ([`scenario`]): historical correlation and regression
//!   slope between two KPIs, applied to a percentage change of the driver's
//!   forecast. Descriptive only, not causal.
//!
//! ## Example
//!
//! ```rust,ignore
//! use automotive_kpi_forecast::*;
//!
//! let config = PipelineConfig::automotive_default();
//! let raw = vec![
//!     RawRecord::new("2023-01-31", "New Vehicles - Retail", 120.0),
//!     RawRecord::new("02/28/2023", "new vehicles - retail", "131"),
//!     // ...
//! ];
//!
//! let output = run_pipeline(&config, &raw).unwrap();
//! let mut scenarios = output.scenario_model(&config);
//! let result = scenarios
//!     .run(&ScenarioRequest::new("Total Vehicle Sales", "Total Gross Profit", 10.0))
//!     .unwrap();
//! ```

pub mod aggregation;
pub mod engine;
pub mod error;
pub mod export;
pub mod ingestion;
pub mod scenario;
pub mod schema;
pub mod seasonality;
pub mod utils;
pub mod verification;

pub use aggregation::{aggregate_records, Aggregator, MasterRow, MasterTable};
pub use engine::{
    flat_line, forecast_master_table, ForecastConfidence, ForecastDiagnostics, ForecastEngine,
    ForecastPoint, ForecastTable, KpiForecast,
};
pub use error::{PipelineError, Result};
pub use export::*;
pub use ingestion::*;
pub use scenario::{
    correlate, CorrelationPair, ScenarioFlag, ScenarioModel, ScenarioPoint, ScenarioRequest,
    ScenarioResult, METHOD_NOTE,
};
pub use schema::*;
pub use seasonality::{estimate_seasonal_profile, SeasonalProfile};
pub use verification::{verify_forecast_table, verify_master_table, VerificationResult};

use log::{debug, info};
use serde::{Deserialize, Serialize};

/// Everything one pipeline run produces.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineOutput {
    pub report: NormalizationReport,
    pub master: MasterTable,
    pub forecasts: ForecastTable,
}

impl PipelineOutput {
    pub fn scenario_model(&self, config: &PipelineConfig) -> ScenarioModel<'_> {
        ScenarioModel::new(&self.master, &self.forecasts, config.scenario.clone())
    }
}

pub struct ForecastPipeline;

impl ForecastPipeline {
    /// Normalizer → Aggregator → Forecast Engine. Only dataset-level
    /// failures abort the run.
    pub fn run(config: &PipelineConfig, raw: &[RawRecord]) -> Result<PipelineOutput> {
        config.validate()?;

        info!(
            "Running forecast pipeline over {} raw rows and {} catalog KPIs",
            raw.len(),
            config.kpis.len()
        );

        let (records, report) = Normalizer::new(config).normalize_batch(raw)?;
        let master = Aggregator::new(config).aggregate(&records)?;
        let forecasts = ForecastEngine::new(config.forecast.clone()).forecast_table(&master)?;

        Ok(PipelineOutput {
            report,
            master,
            forecasts,
        })
    }

    pub fn run_with_verification(
        config: &PipelineConfig,
        raw: &[RawRecord],
    ) -> Result<PipelineOutput> {
        let output = Self::run(config, raw)?;

        let master_check = verify_master_table(&output.master)?;
        let forecast_check = verify_forecast_table(&output.forecasts)?;

        for warning in master_check
            .warnings
            .iter()
            .chain(forecast_check.warnings.iter())
        {
            debug!("Verification note: {}", warning);
        }

        Ok(output)
    }
}

pub fn run_pipeline(config: &PipelineConfig, raw: &[RawRecord]) -> Result<PipelineOutput> {
    ForecastPipeline::run(config, raw)
}

pub fn run_pipeline_with_verification(
    config: &PipelineConfig,
    raw: &[RawRecord],
) -> Result<PipelineOutput> {
    ForecastPipeline::run_with_verification(config, raw)
}
