use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};

pub const MONTHS_PER_YEAR: usize = 12;

/// Additive yearly seasonality: one offset per calendar month, January first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeasonalProfile {
    pub offsets: [f64; MONTHS_PER_YEAR],
}

impl SeasonalProfile {
    pub fn flat() -> Self {
        Self {
            offsets: [0.0; MONTHS_PER_YEAR],
        }
    }

    pub fn offset(&self, month: NaiveDate) -> f64 {
        self.offsets[month.month0() as usize]
    }

    /// Removes the seasonal offset from each observation.
    pub fn deseasonalize(&self, points: &[(NaiveDate, f64)]) -> Vec<(NaiveDate, f64)> {
        points
            .iter()
            .map(|(month, value)| (*month, value - self.offset(*month)))
            .collect()
    }
}

impl Default for SeasonalProfile {
    fn default() -> Self {
        Self::flat()
    }
}

/// Estimates calendar-month offsets from detrended residuals. Months with no
/// observations keep a zero offset; the observed offsets are centered so
/// they average to zero and the trend keeps the series level.
pub fn estimate_seasonal_profile(residuals: &[(NaiveDate, f64)]) -> SeasonalProfile {
    let mut sums = [0.0; MONTHS_PER_YEAR];
    let mut counts = [0usize; MONTHS_PER_YEAR];

    for (month, residual) in residuals {
        let idx = month.month0() as usize;
        sums[idx] += residual;
        counts[idx] += 1;
    }

    let mut offsets = [0.0; MONTHS_PER_YEAR];
    for idx in 0..MONTHS_PER_YEAR {
        if counts[idx] > 0 {
            offsets[idx] = sums[idx] / counts[idx] as f64;
        }
    }

    center_offsets(&mut offsets, &counts);

    SeasonalProfile { offsets }
}

fn center_offsets(offsets: &mut [f64; MONTHS_PER_YEAR], counts: &[usize; MONTHS_PER_YEAR]) {
    let covered = counts.iter().filter(|&&c| c > 0).count();
    if covered == 0 {
        return;
    }

    let mean = offsets
        .iter()
        .zip(counts.iter())
        .filter(|(_, &c)| c > 0)
        .map(|(o, _)| o)
        .sum::<f64>()
        / covered as f64;

    for (offset, &count) in offsets.iter_mut().zip(counts.iter()) {
        if count > 0 {
            *offset -= mean;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::add_months;

    fn months_from(start: NaiveDate, count: u32) -> Vec<NaiveDate> {
        (0..count).map(|i| add_months(start, i).unwrap()).collect()
    }

    #[test]
    fn test_recovers_known_pattern() {
        let pattern = [5.0, -5.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 10.0, -10.0];
        let start = NaiveDate::from_ymd_opt(2021, 1, 1).unwrap();
        let residuals: Vec<(NaiveDate, f64)> = months_from(start, 36)
            .into_iter()
            .map(|m| (m, pattern[m.month0() as usize]))
            .collect();

        let profile = estimate_seasonal_profile(&residuals);
        for (idx, expected) in pattern.iter().enumerate() {
            assert!((profile.offsets[idx] - expected).abs() < 1e-10);
        }
    }

    #[test]
    fn test_offsets_are_centered() {
        let start = NaiveDate::from_ymd_opt(2021, 1, 1).unwrap();
        let residuals: Vec<(NaiveDate, f64)> = months_from(start, 24)
            .into_iter()
            .map(|m| (m, 3.0 + m.month() as f64))
            .collect();

        let profile = estimate_seasonal_profile(&residuals);
        let sum: f64 = profile.offsets.iter().sum();
        assert!(sum.abs() < 1e-10);
    }

    #[test]
    fn test_uncovered_months_stay_zero() {
        let residuals = vec![
            (NaiveDate::from_ymd_opt(2023, 1, 1).unwrap(), 4.0),
            (NaiveDate::from_ymd_opt(2023, 2, 1).unwrap(), -2.0),
        ];

        let profile = estimate_seasonal_profile(&residuals);
        assert!((profile.offsets[0] - 3.0).abs() < 1e-12);
        assert!((profile.offsets[1] + 3.0).abs() < 1e-12);
        assert!(profile.offsets[2..].iter().all(|&o| o == 0.0));
    }

    #[test]
    fn test_flat_profile_is_identity() {
        let profile = SeasonalProfile::flat();
        assert!(profile.offsets.iter().all(|&o| o == 0.0));

        let points = vec![(NaiveDate::from_ymd_opt(2023, 5, 1).unwrap(), 7.5)];
        assert_eq!(profile.deseasonalize(&points), points);
    }
}
