use crate::error::{PipelineError, Result};
use crate::ingestion::NormalizedRecord;
use crate::schema::{AggregationRule, PipelineConfig};
use crate::utils::{month_range, normalize_label};
use chrono::NaiveDate;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MasterRow {
    pub month: NaiveDate,
    /// Every KPI in the table; `None` means no data, not zero.
    pub values: BTreeMap<String, Option<f64>>,
}

/// The cleaned master table: one row per month, strictly ascending.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MasterTable {
    pub kpis: Vec<String>,
    pub rows: Vec<MasterRow>,
}

impl MasterTable {
    pub fn months(&self) -> Vec<NaiveDate> {
        self.rows.iter().map(|r| r.month).collect()
    }

    pub fn contains_kpi(&self, kpi: &str) -> bool {
        self.kpis.iter().any(|k| k == kpi)
    }

    /// Case-insensitive KPI lookup returning the table's spelling.
    pub fn find_kpi(&self, name: &str) -> Option<&str> {
        let wanted = normalize_label(name);
        self.kpis
            .iter()
            .find(|k| normalize_label(k) == wanted)
            .map(String::as_str)
    }

    pub fn series(&self, kpi: &str) -> Option<Vec<(NaiveDate, Option<f64>)>> {
        if !self.contains_kpi(kpi) {
            return None;
        }
        Some(
            self.rows
                .iter()
                .map(|r| (r.month, r.values.get(kpi).copied().flatten()))
                .collect(),
        )
    }

    pub fn value(&self, month: NaiveDate, kpi: &str) -> Option<f64> {
        self.rows
            .iter()
            .find(|r| r.month == month)
            .and_then(|r| r.values.get(kpi).copied().flatten())
    }

    pub fn observed_count(&self, kpi: &str) -> usize {
        self.rows
            .iter()
            .filter(|r| r.values.get(kpi).copied().flatten().is_some())
            .count()
    }

    pub fn to_json(&self) -> std::result::Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

type GroupKey = (NaiveDate, String);

/// Folds normalized records into the master table using each KPI's
/// configured aggregation rule.
pub struct Aggregator<'a> {
    config: &'a PipelineConfig,
}

impl<'a> Aggregator<'a> {
    pub fn new(config: &'a PipelineConfig) -> Self {
        Self { config }
    }

    pub fn aggregate(&self, records: &[NormalizedRecord]) -> Result<MasterTable> {
        let mut groups: BTreeMap<GroupKey, Vec<&NormalizedRecord>> = BTreeMap::new();
        let mut kpis: BTreeSet<String> = BTreeSet::new();

        for record in records {
            kpis.insert(record.kpi_name.clone());
            groups
                .entry((record.month, record.kpi_name.clone()))
                .or_default()
                .push(record);
        }

        let (first, last) = match (
            records.iter().map(|r| r.month).min(),
            records.iter().map(|r| r.month).max(),
        ) {
            (Some(first), Some(last)) => (first, last),
            _ => {
                return Err(PipelineError::InsufficientHistory {
                    months: 0,
                    required: self.config.min_history_months,
                })
            }
        };

        let months = month_range(first, last)?;
        if months.len() < self.config.min_history_months {
            return Err(PipelineError::InsufficientHistory {
                months: months.len(),
                required: self.config.min_history_months,
            });
        }

        let mut rows = Vec::with_capacity(months.len());
        for month in &months {
            let values = kpis
                .iter()
                .map(|kpi| {
                    let value = groups
                        .get(&(*month, kpi.clone()))
                        .map(|group| self.aggregate_group(kpi, *month, group, &groups));
                    (kpi.clone(), value)
                })
                .collect();
            rows.push(MasterRow {
                month: *month,
                values,
            });
        }

        let mut table = MasterTable {
            kpis: kpis.into_iter().collect(),
            rows,
        };
        self.add_derived_kpis(&mut table);

        info!(
            "Aggregated {} records into {} months x {} KPIs",
            records.len(),
            table.rows.len(),
            table.kpis.len()
        );

        Ok(table)
    }

    fn aggregate_group(
        &self,
        kpi: &str,
        month: NaiveDate,
        group: &[&NormalizedRecord],
        groups: &BTreeMap<GroupKey, Vec<&NormalizedRecord>>,
    ) -> f64 {
        let kpi_def = self.config.kpi(kpi);
        let rule = kpi_def
            .map(|k| k.aggregation)
            .unwrap_or(AggregationRule::Sum);

        match rule {
            AggregationRule::Sum => group.iter().map(|r| r.value).sum(),
            AggregationRule::LastValue => {
                let mut latest = group[0];
                for &record in &group[1..] {
                    if record.observed_on >= latest.observed_on {
                        latest = record;
                    }
                }
                latest.value
            }
            AggregationRule::WeightedAverage => {
                let weights = kpi_def
                    .and_then(|k| k.weight_kpi.as_ref())
                    .and_then(|w| groups.get(&(month, w.clone())));

                match weights {
                    Some(weight_records) => weighted_average(group, weight_records)
                        .unwrap_or_else(|| {
                            debug!(
                                "No usable weights for {} in {}, using simple average",
                                kpi, month
                            );
                            simple_average(group)
                        }),
                    None => simple_average(group),
                }
            }
        }
    }

    // A derived KPI is only added when every component exists in the table.
    fn add_derived_kpis(&self, table: &mut MasterTable) {
        for derived in &self.config.derived_kpis {
            if table.contains_kpi(&derived.name)
                || !derived.components.iter().all(|c| table.contains_kpi(c))
            {
                continue;
            }

            for row in &mut table.rows {
                let parts: Vec<f64> = derived
                    .components
                    .iter()
                    .filter_map(|c| row.values.get(c).copied().flatten())
                    .collect();
                let value = if parts.is_empty() {
                    None
                } else {
                    Some(parts.iter().sum::<f64>())
                };
                row.values.insert(derived.name.clone(), value);
            }

            debug!("Added derived KPI '{}'", derived.name);
            table.kpis.push(derived.name.clone());
        }

        table.kpis.sort();
    }
}

fn simple_average(group: &[&NormalizedRecord]) -> f64 {
    group.iter().map(|r| r.value).sum::<f64>() / group.len() as f64
}

// Each rate record is weighted by the weight KPI's total on the same day.
// None when any rate record has no weight on its day.
fn weighted_average(
    group: &[&NormalizedRecord],
    weight_records: &[&NormalizedRecord],
) -> Option<f64> {
    let mut by_day: BTreeMap<NaiveDate, f64> = BTreeMap::new();
    for record in weight_records {
        *by_day.entry(record.observed_on).or_insert(0.0) += record.value;
    }

    let mut weighted_sum = 0.0;
    let mut total_weight = 0.0;
    for record in group {
        let weight = by_day.get(&record.observed_on).copied()?;
        weighted_sum += weight * record.value;
        total_weight += weight;
    }

    if total_weight > 0.0 && total_weight.is_finite() {
        Some(weighted_sum / total_weight)
    } else {
        None
    }
}

pub fn aggregate_records(
    config: &PipelineConfig,
    records: &[NormalizedRecord],
) -> Result<MasterTable> {
    Aggregator::new(config).aggregate(records)
}
