use automotive_kpi_forecast::utils::add_months;
use automotive_kpi_forecast::*;
use chrono::{Datelike, NaiveDate};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};

fn main() {
    let config = PipelineConfig::automotive_default();
    let mut rng = StdRng::seed_from_u64(7);
    let noise = Normal::new(0.0, 4.0).unwrap();
    let start = NaiveDate::from_ymd_opt(2022, 1, 1).unwrap();

    let mut raw = Vec::new();
    for i in 0..30u32 {
        let month = add_months(start, i).unwrap();
        let date = month.format("%m/%d/%Y").to_string();
        let season = if month.month() == 3 { 25.0 } else { 0.0 };

        let new_units = 80.0 + 1.5 * i as f64 + season + noise.sample(&mut rng);
        let used_units = 60.0 + 0.8 * i as f64 + noise.sample(&mut rng);

        raw.push(RawRecord::new(&date, "New Retail Units", new_units.round()));
        raw.push(RawRecord::new(&date, "Used Retail Units", used_units.round()));
        raw.push(RawRecord::new(&date, "GP New", format!("${:.2}", new_units * 2_100.0).as_str()));
        raw.push(RawRecord::new(&date, "GP Used", format!("${:.2}", used_units * 1_600.0).as_str()));
    }
    raw.push(RawRecord::new("sometime", "New Retail Units", 1.0));

    let output = run_pipeline_with_verification(&config, &raw).unwrap();

    println!(
        "Normalized {} of {} rows ({} rejected)",
        output.report.accepted,
        output.report.total_rows,
        output.report.rejected()
    );

    println!("\nForecast: Total Vehicle Sales");
    for point in output.forecasts.future_points("Total Vehicle Sales") {
        println!(
            "  {}  {:>8.1}  [{:>8.1}, {:>8.1}]",
            point.month.format("%Y-%m"),
            point.predicted,
            point.lower_bound,
            point.upper_bound
        );
    }

    let mut model = output.scenario_model(&config);
    let result = model
        .run(&ScenarioRequest::new(
            "Total Vehicle Sales",
            "Total Gross Profit",
            10.0,
        ))
        .unwrap();

    println!(
        "\nScenario +10% vehicle sales (r = {:.3}, slope = {:.1})",
        result.correlation.correlation_coefficient, result.correlation.regression_slope
    );
    for point in &result.points {
        println!(
            "  {}  gross profit {:>12.0} -> {:>12.0}",
            point.month.format("%Y-%m"),
            point.impacted_baseline,
            point.impacted_adjusted
        );
    }
    println!("\n{}", result.method_note);

    write_master_table_to_path("master_table.csv", &output.master).unwrap();
    write_forecast_table_to_path("forecasts.csv", &output.forecasts).unwrap();
    println!("\nWrote master_table.csv and forecasts.csv");
}
