use crate::error::{PipelineError, Result};
use crate::schema::{KpiKind, PipelineConfig};
use crate::utils::{first_of_month, normalize_label, parse_flexible_date, parse_numeric};
use chrono::NaiveDate;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawValue {
    Number(f64),
    Text(String),
    Missing,
}

impl RawValue {
    fn to_f64(&self) -> Option<f64> {
        match self {
            RawValue::Number(v) if v.is_finite() => Some(*v),
            RawValue::Number(_) | RawValue::Missing => None,
            RawValue::Text(text) => parse_numeric(text),
        }
    }
}

impl From<f64> for RawValue {
    fn from(value: f64) -> Self {
        RawValue::Number(value)
    }
}

impl From<&str> for RawValue {
    fn from(value: &str) -> Self {
        RawValue::Text(value.to_string())
    }
}

/// One ingested row, exactly as it appeared in the export.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    pub raw_date: String,
    pub kpi_label: String,
    pub raw_value: RawValue,
}

impl RawRecord {
    pub fn new(raw_date: &str, kpi_label: &str, raw_value: impl Into<RawValue>) -> Self {
        Self {
            raw_date: raw_date.to_string(),
            kpi_label: kpi_label.to_string(),
            raw_value: raw_value.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedRecord {
    /// Always the first day of the calendar month.
    pub month: NaiveDate,
    pub kpi_name: String,
    pub value: f64,
    /// The full parsed date, used to order and pair records within a month.
    pub observed_on: NaiveDate,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RowRejection {
    UnparseableDate(String),
    UnknownKpi(String),
    MissingRate { kpi_name: String },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NormalizationReport {
    pub total_rows: usize,
    pub accepted: usize,
    pub date_failures: usize,
    pub unknown_kpis: usize,
    pub missing_rates: usize,
    /// Accepted rows whose value was empty or non-numeric and set to 0.0.
    pub zero_filled: usize,
    pub unknown_labels: BTreeMap<String, usize>,
}

impl NormalizationReport {
    pub fn rejected(&self) -> usize {
        self.date_failures + self.unknown_kpis + self.missing_rates
    }

    pub fn failure_rate(&self) -> f64 {
        if self.total_rows == 0 {
            return 0.0;
        }
        self.rejected() as f64 / self.total_rows as f64
    }

    fn record(&mut self, outcome: &std::result::Result<NormalizedRecord, RowRejection>) {
        self.total_rows += 1;
        match outcome {
            Ok(_) => self.accepted += 1,
            Err(RowRejection::UnparseableDate(_)) => self.date_failures += 1,
            Err(RowRejection::UnknownKpi(label)) => {
                self.unknown_kpis += 1;
                *self.unknown_labels.entry(label.clone()).or_insert(0) += 1;
            }
            Err(RowRejection::MissingRate { .. }) => self.missing_rates += 1,
        }
    }
}

/// Maps raw export rows onto the canonical KPI catalog.
pub struct Normalizer<'a> {
    config: &'a PipelineConfig,
    lookup: BTreeMap<String, String>,
}

impl<'a> Normalizer<'a> {
    pub fn new(config: &'a PipelineConfig) -> Self {
        Self {
            config,
            lookup: config.label_lookup(),
        }
    }

    pub fn canonical_name(&self, label: &str) -> Option<&str> {
        self.lookup.get(&normalize_label(label)).map(String::as_str)
    }

    /// Normalizes a single row. The second element is true when the value
    /// was zero-filled.
    pub fn normalize(
        &self,
        record: &RawRecord,
    ) -> std::result::Result<(NormalizedRecord, bool), RowRejection> {
        let observed_on = parse_flexible_date(&record.raw_date)
            .map_err(|_| RowRejection::UnparseableDate(record.raw_date.clone()))?;

        let kpi_name = self
            .canonical_name(&record.kpi_label)
            .ok_or_else(|| RowRejection::UnknownKpi(record.kpi_label.trim().to_string()))?
            .to_string();

        let kind = self
            .config
            .kpi(&kpi_name)
            .map(|k| k.kind)
            .unwrap_or(KpiKind::Currency);

        let (value, zero_filled) = match record.raw_value.to_f64() {
            Some(v) => (v, false),
            None if kind == KpiKind::Rate => return Err(RowRejection::MissingRate { kpi_name }),
            None => (0.0, true),
        };

        Ok((
            NormalizedRecord {
                month: first_of_month(observed_on),
                kpi_name,
                value,
                observed_on,
            },
            zero_filled,
        ))
    }

    /// Normalizes a whole batch. Bad rows are counted, never raised; the
    /// batch fails only when nothing survives.
    pub fn normalize_batch(
        &self,
        records: &[RawRecord],
    ) -> Result<(Vec<NormalizedRecord>, NormalizationReport)> {
        let mut report = NormalizationReport::default();
        let mut normalized = Vec::with_capacity(records.len());

        for record in records {
            let outcome = self.normalize(record);
            let mapped = outcome.map(|(rec, zero_filled)| {
                if zero_filled {
                    report.zero_filled += 1;
                }
                rec
            });
            report.record(&mapped);
            if let Ok(rec) = mapped {
                normalized.push(rec);
            }
        }

        if report.rejected() > 0 {
            warn!(
                "Rejected {} of {} rows ({} bad dates, {} unknown KPIs, {} missing rates)",
                report.rejected(),
                report.total_rows,
                report.date_failures,
                report.unknown_kpis,
                report.missing_rates
            );
        }

        if normalized.is_empty() {
            return Err(PipelineError::NoValidRecords {
                total_rows: report.total_rows,
            });
        }

        info!(
            "Normalized {} of {} rows ({} zero-filled)",
            report.accepted, report.total_rows, report.zero_filled
        );

        Ok((normalized, report))
    }
}

pub fn normalize_records(
    config: &PipelineConfig,
    records: &[RawRecord],
) -> Result<(Vec<NormalizedRecord>, NormalizationReport)> {
    Normalizer::new(config).normalize_batch(records)
}
