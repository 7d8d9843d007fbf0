use automotive_kpi_forecast::utils::add_months;
use automotive_kpi_forecast::*;
use chrono::NaiveDate;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use std::collections::BTreeSet;

fn month_end(start: NaiveDate, offset: u32) -> String {
    let next = add_months(start, offset + 1).unwrap();
    next.pred_opt().unwrap().format("%Y-%m-%d").to_string()
}

fn series_rows(label: &str, values: &[f64]) -> Vec<RawRecord> {
    let start = NaiveDate::from_ymd_opt(2022, 1, 1).unwrap();
    values
        .iter()
        .enumerate()
        .map(|(i, v)| RawRecord::new(&month_end(start, i as u32), label, *v))
        .collect()
}

#[test]
fn test_two_year_dealership_scenario() {
    let config = PipelineConfig::automotive_default();

    let sales: Vec<f64> = (0..24).map(|i| 100.0 + 2.0 * i as f64).collect();
    let gross_profit: Vec<f64> = sales.iter().map(|s| s * 0.5).collect();

    let mut raw = series_rows("Total Sales", &sales);
    raw.extend(series_rows("Gross Profit - New Vehicles", &gross_profit));

    let output = run_pipeline_with_verification(&config, &raw).unwrap();

    assert_eq!(output.report.accepted, 48);
    assert_eq!(output.master.rows.len(), 24);
    assert_eq!(
        output.master.rows[0].month,
        NaiveDate::from_ymd_opt(2022, 1, 1).unwrap()
    );

    let diagnostics = output.forecasts.diagnostics("Total Sales").unwrap();
    assert_eq!(diagnostics.confidence, ForecastConfidence::Normal);
    assert!(diagnostics.used_seasonality);
    assert!((diagnostics.trend_slope - 2.0).abs() < 1e-6);

    let next = output.forecasts.upcoming("Total Sales", 1)[0];
    assert_eq!(next.month, NaiveDate::from_ymd_opt(2024, 1, 1).unwrap());
    assert!((next.predicted - 148.0).abs() < 1e-6);
    assert!(next.lower_bound <= next.predicted && next.predicted <= next.upper_bound);
    assert!(!next.low_confidence);

    let mut model = output.scenario_model(&config);
    let result = model
        .run(&ScenarioRequest::new(
            "Total Sales",
            "Gross Profit - New Vehicles",
            10.0,
        ))
        .unwrap();

    assert!((result.correlation.correlation_coefficient - 1.0).abs() < 1e-9);
    assert!((result.correlation.regression_slope - 0.5).abs() < 1e-9);
    assert_eq!(result.correlation.overlapping_points, 24);
    assert!(result.flags.is_empty());
    assert!(!result.is_low_confidence());
    assert_eq!(result.points.len(), config.forecast.horizon_months);

    let first = &result.points[0];
    assert!((first.driver_delta - 14.8).abs() < 1e-6);
    assert!((first.impacted_adjustment - 7.4).abs() < 1e-6);
    assert!((first.impacted_adjusted - (first.impacted_baseline + 7.4)).abs() < 1e-6);
    assert_eq!(result.method_note, METHOD_NOTE);
}

#[test]
fn test_derived_vehicle_sales_drive_total_gross_profit() {
    let config = PipelineConfig::automotive_default();

    let new_units: Vec<f64> = (0..24).map(|i| 50.0 + i as f64).collect();
    let used_units: Vec<f64> = (0..24).map(|i| 30.0 + i as f64).collect();
    let new_gp: Vec<f64> = new_units.iter().map(|u| u * 2_000.0).collect();
    let used_gp: Vec<f64> = used_units.iter().map(|u| u * 1_500.0).collect();

    let mut raw = series_rows("New Retail Units", &new_units);
    raw.extend(series_rows("Used Retail Units", &used_units));
    raw.extend(series_rows("GP New", &new_gp));
    raw.extend(series_rows("GP Used", &used_gp));

    let output = run_pipeline_with_verification(&config, &raw).unwrap();
    assert!(output.master.contains_kpi("Total Vehicle Sales"));
    assert!(output.master.contains_kpi("Total Gross Profit"));

    let jan = NaiveDate::from_ymd_opt(2022, 1, 1).unwrap();
    assert_eq!(output.master.value(jan, "Total Vehicle Sales"), Some(80.0));
    assert_eq!(output.master.value(jan, "Total Gross Profit"), Some(145_000.0));

    let mut model = output.scenario_model(&config);
    let result = model
        .run(&ScenarioRequest::new(
            "Total Vehicle Sales",
            "Total Gross Profit",
            10.0,
        ))
        .unwrap();

    assert!((result.correlation.correlation_coefficient - 1.0).abs() < 1e-9);
    assert!((result.correlation.regression_slope - 1_750.0).abs() < 1e-6);
    assert!(result.flags.is_empty());

    let first = &result.points[0];
    assert_eq!(first.month, NaiveDate::from_ymd_opt(2024, 1, 1).unwrap());
    assert!((first.driver_baseline - 128.0).abs() < 1e-6);
    assert!((first.driver_delta - 12.8).abs() < 1e-6);
    assert!((first.impacted_adjustment - 22_400.0).abs() < 1e-3);
}

#[test]
fn test_corrupted_rows_are_counted_not_fatal() {
    let config = PipelineConfig::automotive_default();
    let mut rng = StdRng::seed_from_u64(42);
    let noise = Normal::new(0.0, 5.0).unwrap();
    let start = NaiveDate::from_ymd_opt(2021, 1, 1).unwrap();
    let labels = ["Total Sales", "GP New", "New Retail Units", "GM New %"];

    let mut raw = Vec::new();
    let mut corrupted = 0;
    let mut bad_dates = 0;
    let mut bad_labels = 0;
    let mut zero_filled = 0;
    let mut dropped_rates = 0;

    for month in 0..36u32 {
        for (k, label) in labels.iter().enumerate() {
            let is_rate = *label == "GM New %";
            let value = if is_rate {
                0.12 + noise.sample(&mut rng) / 1_000.0
            } else {
                1_000.0 / (k as f64 + 1.0) + 3.0 * month as f64 + noise.sample(&mut rng)
            };
            let date = month_end(start, month);
            let index = month as usize * labels.len() + k;

            // Corrupt one row in nineteen, never in the first or last month.
            if index % 19 != 7 || month == 0 || month == 35 {
                raw.push(RawRecord::new(&date, label, value));
                continue;
            }

            let record = if is_rate || corrupted % 3 == 2 {
                if is_rate {
                    dropped_rates += 1;
                } else {
                    zero_filled += 1;
                }
                RawRecord::new(&date, label, "n/a")
            } else if corrupted % 3 == 1 {
                bad_labels += 1;
                RawRecord::new(&date, "Mystery Account", value)
            } else {
                bad_dates += 1;
                RawRecord::new("31/31/2022", label, value)
            };
            corrupted += 1;
            raw.push(record);
        }
    }

    let output = run_pipeline_with_verification(&config, &raw).unwrap();

    assert!(bad_dates > 0 && bad_labels > 0 && zero_filled > 0 && dropped_rates > 0);
    assert_eq!(output.report.total_rows, 144);
    assert_eq!(output.report.date_failures, bad_dates);
    assert_eq!(output.report.unknown_kpis, bad_labels);
    assert_eq!(output.report.missing_rates, dropped_rates);
    assert_eq!(output.report.zero_filled, zero_filled);
    assert_eq!(
        output.report.accepted,
        144 - bad_dates - bad_labels - dropped_rates
    );
    assert!(output.report.failure_rate() < 0.1);
    assert_eq!(
        output.report.unknown_labels.get("Mystery Account"),
        Some(&bad_labels)
    );

    let months = output.master.months();
    let unique: BTreeSet<_> = months.iter().collect();
    assert_eq!(months.len(), 36);
    assert_eq!(unique.len(), months.len());
    assert!(months.windows(2).all(|w| w[0] < w[1]));

    // A zero-filled amount stays in the table as 0, a dropped rate as null.
    let zeros = output
        .master
        .rows
        .iter()
        .filter(|row| {
            ["Total Sales", "Gross Profit - New Vehicles", "New Vehicles - Retail"]
                .iter()
                .any(|kpi| row.values.get(*kpi) == Some(&Some(0.0)))
        })
        .count();
    assert_eq!(zeros, zero_filled);
    assert_eq!(
        36 - output.master.observed_count("Gross Margin - New Vehicles"),
        dropped_rates
    );

    for kpi in &output.master.kpis {
        let diagnostics = output.forecasts.diagnostics(kpi).unwrap();
        assert!(!diagnostics.confidence.is_fallback(), "{} fell back", kpi);
        assert_eq!(output.forecasts.future_points(kpi).len(), 3);
    }
}

#[test]
fn test_csv_export_round_trip() -> anyhow::Result<()> {
    let config = PipelineConfig::automotive_default();
    let csv = "date,english_name,monthly_value\n\
               2023-01-31,New Vehicles - Retail,40\n\
               02/28/2023,new vehicles - retail,44\n\
               2023-03,New Vehicles - Retail,48\n\
               2023-01-31,Used Retail Units,\n\
               2023-03-31,Used Retail Units,\"1,020\"\n\
               2023-02-15,Service Absorption Rate,\n\
               unknown,New Vehicles - Retail,1\n";

    let raw = read_raw_records(csv.as_bytes(), &config.input_columns)?;
    assert_eq!(raw.len(), 7);

    let output = run_pipeline(&config, &raw)?;
    assert_eq!(output.report.date_failures, 1);
    assert_eq!(output.report.missing_rates, 1);
    assert_eq!(output.report.zero_filled, 1);

    let jan = NaiveDate::from_ymd_opt(2023, 1, 1).unwrap();
    let feb = NaiveDate::from_ymd_opt(2023, 2, 1).unwrap();
    let mar = NaiveDate::from_ymd_opt(2023, 3, 1).unwrap();
    assert_eq!(output.master.value(jan, "Used Vehicles - Retail"), Some(0.0));
    assert_eq!(output.master.value(feb, "Used Vehicles - Retail"), None);
    assert_eq!(output.master.value(mar, "Total Vehicle Sales"), Some(1_068.0));
    assert_eq!(output.master.value(feb, "Total Vehicle Sales"), Some(44.0));

    let mut master_csv = Vec::new();
    write_master_table(&mut master_csv, &output.master)?;
    let master_csv = String::from_utf8(master_csv)?;
    let lines: Vec<&str> = master_csv.lines().collect();
    assert_eq!(
        lines[0],
        "month,New Vehicles - Retail,Total Vehicle Sales,Used Vehicles - Retail"
    );
    assert_eq!(lines[2], "2023-02-01,44,44,");

    let path = std::env::temp_dir().join("automotive_kpi_forecast_round_trip.csv");
    write_forecast_table_to_path(&path, &output.forecasts)?;
    let written = std::fs::read_to_string(&path)?;
    std::fs::remove_file(&path)?;

    assert!(written.starts_with(&FORECAST_COLUMNS.join(",")));
    assert_eq!(written.lines().count(), 1 + 3 * (3 + 3));

    Ok(())
}

#[test]
fn test_weighted_margin_uses_unit_volumes() {
    let config = PipelineConfig::automotive_default();
    let raw = vec![
        RawRecord::new("2023-01-10", "New Retail Units", 10.0),
        RawRecord::new("2023-01-20", "New Retail Units", 30.0),
        RawRecord::new("2023-01-10", "GM New %", 0.10),
        RawRecord::new("2023-01-20", "GM New %", 0.20),
        RawRecord::new("2023-02-10", "GM New %", 0.12),
        RawRecord::new("2023-02-20", "GM New %", 0.18),
    ];

    let output = run_pipeline(&config, &raw).unwrap();
    let jan = NaiveDate::from_ymd_opt(2023, 1, 1).unwrap();
    let feb = NaiveDate::from_ymd_opt(2023, 2, 1).unwrap();

    let weighted = output
        .master
        .value(jan, "Gross Margin - New Vehicles")
        .unwrap();
    assert!((weighted - 0.175).abs() < 1e-12);

    // No units in February, so the simple average applies.
    let simple = output
        .master
        .value(feb, "Gross Margin - New Vehicles")
        .unwrap();
    assert!((simple - 0.15).abs() < 1e-12);
}

#[test]
fn test_constant_series_falls_back_without_blocking_others() {
    let config = PipelineConfig::automotive_default();
    let mut raw = series_rows("Total Sales", &[500.0; 8]);
    raw.extend(series_rows("PBT", &[10.0, 12.0, 11.0, 15.0, 14.0, 16.0, 18.0, 17.0]));

    let output = run_pipeline_with_verification(&config, &raw).unwrap();

    let flat = output.forecasts.diagnostics("Total Sales").unwrap();
    assert!(flat.confidence.is_fallback());
    for point in output.forecasts.future_points("Total Sales") {
        assert_eq!(point.predicted, 500.0);
        assert_eq!(point.lower_bound, point.upper_bound);
        assert!(point.low_confidence);
    }

    let fitted = output
        .forecasts
        .diagnostics("Profit or Loss Before Income Tax")
        .unwrap();
    assert!(!fitted.confidence.is_fallback());
    assert!(matches!(
        fitted.confidence,
        ForecastConfidence::LimitedHistory { observed: 8 }
    ));

    let mut model = output.scenario_model(&config);
    let result = model.run(&ScenarioRequest::new(
        "Total Sales",
        "Profit or Loss Before Income Tax",
        5.0,
    ));
    assert!(matches!(result, Err(PipelineError::InsufficientData { .. })));
}

#[test]
fn test_zero_change_scenario_is_identity() {
    let config = PipelineConfig::automotive_default();
    let mut raw = series_rows("Total Sales", &[100.0, 120.0, 115.0, 130.0, 128.0, 140.0]);
    raw.extend(series_rows("PBT", &[5.0, 4.0, 7.0, 6.0, 9.0, 8.0]));

    let output = run_pipeline(&config, &raw).unwrap();
    let mut model = output.scenario_model(&config);
    let result = model
        .run(&ScenarioRequest::new(
            "Total Sales",
            "Profit or Loss Before Income Tax",
            0.0,
        ))
        .unwrap();

    for point in &result.points {
        assert_eq!(point.driver_adjusted, point.driver_baseline);
        assert_eq!(point.impacted_adjusted, point.impacted_baseline);
    }

    // Identical request served from the memo.
    assert_eq!(model.cached_pairs(), 1);
    model
        .run(&ScenarioRequest::new(
            "Total Sales",
            "Profit or Loss Before Income Tax",
            20.0,
        ))
        .unwrap();
    assert_eq!(model.cached_pairs(), 1);
    model.clear_cache();
    assert_eq!(model.cached_pairs(), 0);
}

#[test]
fn test_nothing_usable_is_an_error() {
    let config = PipelineConfig::automotive_default();
    let raw = vec![
        RawRecord::new("garbage", "Total Sales", 1.0),
        RawRecord::new("2023-01-31", "Not A KPI", 1.0),
    ];

    assert!(matches!(
        run_pipeline(&config, &raw),
        Err(PipelineError::NoValidRecords { total_rows: 2 })
    ));

    let single_month = series_rows("Total Sales", &[1.0]);
    assert!(matches!(
        run_pipeline(&config, &single_month),
        Err(PipelineError::InsufficientHistory {
            months: 1,
            required: 2
        })
    ));
}

#[test]
fn test_config_from_json_and_schema() {
    let json = r#"{
        "kpis": [
            { "name": "Units", "aliases": ["Cars Sold"], "kind": "Volume", "aggregation": "Sum" },
            { "name": "Revenue", "kind": "Currency", "aggregation": "Sum" }
        ],
        "forecast": { "horizon_months": 6 }
    }"#;

    let config = PipelineConfig::from_json_str(json).unwrap();
    assert_eq!(config.forecast.horizon_months, 6);
    assert_eq!(config.forecast.min_points_for_seasonality, 24);
    assert_eq!(config.min_history_months, 2);

    let mut raw = series_rows("cars sold", &[10.0, 11.0, 13.0]);
    raw.extend(series_rows("Revenue", &[1_000.0, 1_100.0, 1_300.0]));
    let output = run_pipeline(&config, &raw).unwrap();
    assert_eq!(output.forecasts.future_points("Units").len(), 6);

    let schema = PipelineConfig::schema_as_json().unwrap();
    assert!(schema.contains("horizon_months"));
    assert!(schema.contains("WeightedAverage"));
}
