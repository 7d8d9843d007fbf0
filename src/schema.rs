use crate::error::{PipelineError, Result};
use crate::utils::normalize_label;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "PascalCase")]
pub enum KpiKind {
    #[schemars(description = "Unit counts such as vehicles retailed. Missing values are zero-filled.")]
    Volume,

    #[schemars(description = "Monetary amounts such as sales or gross profit. Missing values are zero-filled.")]
    Currency,

    #[schemars(
        description = "Rates, margins and percentages. A missing rate cannot be zero-filled, so the row is dropped."
    )]
    Rate,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "PascalCase")]
pub enum AggregationRule {
    #[schemars(description = "Total every record in the month (volumes, revenue, profit).")]
    Sum,

    #[schemars(
        description = "Average the month's records, weighted by the KPI named in weight_kpi. Falls back to a simple average when no weight is available."
    )]
    WeightedAverage,

    #[schemars(description = "Keep the chronologically latest record in the month (balances, stock levels).")]
    LastValue,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
pub struct KpiDefinition {
    #[schemars(description = "Canonical KPI identifier used in every output table")]
    pub name: String,

    #[serde(default)]
    #[schemars(description = "Alternative labels found in raw exports. Matching is case-insensitive.")]
    pub aliases: Vec<String>,

    pub kind: KpiKind,

    pub aggregation: AggregationRule,

    #[serde(default)]
    #[schemars(description = "Canonical name of the volume KPI used as weight for WeightedAverage")]
    pub weight_kpi: Option<String>,
}

impl KpiDefinition {
    pub fn new(name: &str, kind: KpiKind, aggregation: AggregationRule) -> Self {
        Self {
            name: name.to_string(),
            aliases: Vec::new(),
            kind,
            aggregation,
            weight_kpi: None,
        }
    }

    pub fn with_aliases(mut self, aliases: &[&str]) -> Self {
        self.aliases = aliases.iter().map(|a| a.to_string()).collect();
        self
    }

    pub fn weighted_by(mut self, weight_kpi: &str) -> Self {
        self.weight_kpi = Some(weight_kpi.to_string());
        self
    }
}

/// A KPI computed from the aggregated table as the sum of its components.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
pub struct DerivedKpi {
    pub name: String,
    pub components: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
pub struct InputColumns {
    pub date: String,
    pub kpi_label: String,
    pub value: String,
}

impl Default for InputColumns {
    fn default() -> Self {
        Self {
            date: "date".to_string(),
            kpi_label: "english_name".to_string(),
            value: "monthly_value".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
#[serde(default)]
pub struct ForecastSettings {
    #[schemars(description = "Number of future months to extrapolate")]
    pub horizon_months: usize,

    #[schemars(description = "Half-width of the uncertainty interval in residual standard errors (1.96 = 95%)")]
    pub interval_z_score: f64,

    #[schemars(description = "Observations required before yearly seasonality is estimated")]
    pub min_points_for_seasonality: usize,

    #[schemars(description = "Observations below which a forecast is flagged as limited history")]
    pub full_confidence_points: usize,
}

impl Default for ForecastSettings {
    fn default() -> Self {
        Self {
            horizon_months: 3,
            interval_z_score: 1.96,
            min_points_for_seasonality: 24,
            full_confidence_points: 24,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
#[serde(default)]
pub struct ScenarioSettings {
    #[schemars(description = "Absolute correlation below which a scenario is flagged as weak")]
    pub weak_correlation_threshold: f64,

    #[schemars(description = "Overlapping historical months required to estimate a correlation")]
    pub min_overlap_points: usize,
}

impl Default for ScenarioSettings {
    fn default() -> Self {
        Self {
            weak_correlation_threshold: 0.2,
            min_overlap_points: 3,
        }
    }
}

fn default_min_history_months() -> usize {
    2
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
pub struct PipelineConfig {
    #[schemars(description = "The fixed catalog of canonical KPIs and how each one aggregates")]
    pub kpis: Vec<KpiDefinition>,

    #[serde(default)]
    pub derived_kpis: Vec<DerivedKpi>,

    #[serde(default)]
    pub input_columns: InputColumns,

    #[serde(default)]
    pub forecast: ForecastSettings,

    #[serde(default)]
    pub scenario: ScenarioSettings,

    #[serde(default = "default_min_history_months")]
    #[schemars(description = "Months the aggregated table must span before forecasting is attempted")]
    pub min_history_months: usize,
}

impl PipelineConfig {
    pub fn new(kpis: Vec<KpiDefinition>) -> Self {
        Self {
            kpis,
            derived_kpis: Vec::new(),
            input_columns: InputColumns::default(),
            forecast: ForecastSettings::default(),
            scenario: ScenarioSettings::default(),
            min_history_months: default_min_history_months(),
        }
    }

    /// Dealership KPI catalog with explicit aggregation rules.
    pub fn automotive_default() -> Self {
        use AggregationRule::*;
        use KpiKind::*;

        let kpis = vec![
            KpiDefinition::new("New Vehicles - Retail", Volume, Sum)
                .with_aliases(&["New Retail Units", "New Vehicle Sales", "New Units Retailed"]),
            KpiDefinition::new("Used Vehicles - Retail", Volume, Sum)
                .with_aliases(&["Used Retail Units", "Used Vehicle Sales", "Used Units Retailed"]),
            KpiDefinition::new("Total Sales", Currency, Sum)
                .with_aliases(&["Sales", "Total Revenue", "Revenue"]),
            KpiDefinition::new("Gross Profit - New Vehicles", Currency, Sum)
                .with_aliases(&["New Vehicle Gross Profit", "GP New"]),
            KpiDefinition::new("Gross Profit - Used Vehicles", Currency, Sum)
                .with_aliases(&["Used Vehicle Gross Profit", "GP Used"]),
            KpiDefinition::new("Gross Profit - Service", Currency, Sum)
                .with_aliases(&["Service Gross Profit", "GP Service"]),
            KpiDefinition::new("Gross Profit - Parts", Currency, Sum)
                .with_aliases(&["Parts Gross Profit", "GP Parts"]),
            KpiDefinition::new("Profit or Loss Before Income Tax", Currency, Sum)
                .with_aliases(&["Net Profit Before Tax", "PBT", "Profit Before Tax"]),
            KpiDefinition::new("Gross Margin - New Vehicles", Rate, WeightedAverage)
                .with_aliases(&["New Vehicle Margin %", "GM New %"])
                .weighted_by("New Vehicles - Retail"),
            KpiDefinition::new("Gross Margin - Used Vehicles", Rate, WeightedAverage)
                .with_aliases(&["Used Vehicle Margin %", "GM Used %"])
                .weighted_by("Used Vehicles - Retail"),
            KpiDefinition::new("Service Absorption Rate", Rate, LastValue)
                .with_aliases(&["Absorption %", "Fixed Absorption"]),
            KpiDefinition::new("New Vehicle Inventory", Volume, LastValue)
                .with_aliases(&["New Stock Units", "New Inventory"]),
            KpiDefinition::new("Used Vehicle Inventory", Volume, LastValue)
                .with_aliases(&["Used Stock Units", "Used Inventory"]),
        ];

        let derived_kpis = vec![
            DerivedKpi {
                name: "Total Vehicle Sales".to_string(),
                components: vec![
                    "New Vehicles - Retail".to_string(),
                    "Used Vehicles - Retail".to_string(),
                ],
            },
            DerivedKpi {
                name: "Total Gross Profit".to_string(),
                components: vec![
                    "Gross Profit - New Vehicles".to_string(),
                    "Gross Profit - Used Vehicles".to_string(),
                ],
            },
        ];

        Self {
            derived_kpis,
            ..Self::new(kpis)
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    pub fn kpi(&self, name: &str) -> Option<&KpiDefinition> {
        self.kpis.iter().find(|k| k.name == name)
    }

    /// Lookup table from normalized label (name or alias) to canonical name.
    pub fn label_lookup(&self) -> BTreeMap<String, String> {
        let mut lookup = BTreeMap::new();
        for kpi in &self.kpis {
            lookup.insert(normalize_label(&kpi.name), kpi.name.clone());
            for alias in &kpi.aliases {
                lookup.insert(normalize_label(alias), kpi.name.clone());
            }
        }
        lookup
    }

    pub fn validate(&self) -> Result<()> {
        if self.kpis.is_empty() {
            return Err(PipelineError::InvalidConfig(
                "At least one KPI must be defined".to_string(),
            ));
        }

        let mut labels: BTreeMap<String, &str> = BTreeMap::new();
        for kpi in &self.kpis {
            if kpi.name.trim().is_empty() {
                return Err(PipelineError::InvalidConfig(
                    "KPI names must not be empty".to_string(),
                ));
            }
            for label in std::iter::once(&kpi.name).chain(kpi.aliases.iter()) {
                if let Some(owner) = labels.insert(normalize_label(label), &kpi.name) {
                    return Err(PipelineError::InvalidConfig(format!(
                        "Label '{}' is claimed by both '{}' and '{}'",
                        label, owner, kpi.name
                    )));
                }
            }
        }

        for kpi in &self.kpis {
            if let Some(weight) = &kpi.weight_kpi {
                if self.kpi(weight).is_none() {
                    return Err(PipelineError::InvalidConfig(format!(
                        "KPI '{}' is weighted by undefined KPI '{}'",
                        kpi.name, weight
                    )));
                }
                if weight == &kpi.name {
                    return Err(PipelineError::InvalidConfig(format!(
                        "KPI '{}' cannot be weighted by itself",
                        kpi.name
                    )));
                }
            }
        }

        let mut derived_names = BTreeSet::new();
        for derived in &self.derived_kpis {
            if derived.components.is_empty() {
                return Err(PipelineError::InvalidConfig(format!(
                    "Derived KPI '{}' has no components",
                    derived.name
                )));
            }
            if self.kpi(&derived.name).is_some() || !derived_names.insert(derived.name.as_str()) {
                return Err(PipelineError::InvalidConfig(format!(
                    "Derived KPI '{}' collides with another KPI name",
                    derived.name
                )));
            }
        }

        if self.forecast.horizon_months == 0 {
            return Err(PipelineError::InvalidConfig(
                "Forecast horizon must be at least one month".to_string(),
            ));
        }

        if !(self.forecast.interval_z_score >= 0.0) {
            return Err(PipelineError::InvalidConfig(format!(
                "Interval z-score must be non-negative, got {}",
                self.forecast.interval_z_score
            )));
        }

        if !(0.0..=1.0).contains(&self.scenario.weak_correlation_threshold) {
            return Err(PipelineError::InvalidConfig(format!(
                "Weak correlation threshold {} must be between 0.0 and 1.0",
                self.scenario.weak_correlation_threshold
            )));
        }

        if self.scenario.min_overlap_points < 3 {
            return Err(PipelineError::InvalidConfig(format!(
                "Scenario correlation needs at least 3 overlapping points, got {}",
                self.scenario.min_overlap_points
            )));
        }

        if self.min_history_months < 2 {
            return Err(PipelineError::InvalidConfig(format!(
                "Minimum history must be at least 2 months, got {}",
                self.min_history_months
            )));
        }

        Ok(())
    }

    pub fn generate_json_schema() -> schemars::schema::RootSchema {
        schemars::schema_for!(PipelineConfig)
    }

    pub fn schema_as_json() -> std::result::Result<String, serde_json::Error> {
        let schema = Self::generate_json_schema();
        serde_json::to_string_pretty(&schema)
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::automotive_default()
    }
}
