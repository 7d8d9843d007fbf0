use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("No valid records after normalization ({total_rows} rows read)")]
    NoValidRecords { total_rows: usize },

    #[error("Data integrity error: aggregated table has {months} month(s), at least {required} required for forecasting")]
    InsufficientHistory { months: usize, required: usize },

    #[error("Data integrity error: {0}")]
    DataIntegrity(String),

    #[error("Forecast fit failed for KPI '{kpi}': {reason}")]
    FitFailure { kpi: String, reason: String },

    #[error("Insufficient data to correlate '{driver}' with '{impacted}': {details}")]
    InsufficientData {
        driver: String,
        impacted: String,
        details: String,
    },

    #[error("Unknown KPI: {0}")]
    UnknownKpi(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid scenario: {0}")]
    InvalidScenario(String),

    #[error("Date calculation error: {0}")]
    DateError(String),

    #[error("Input is missing required columns: {}", .0.join(", "))]
    MissingColumns(Vec<String>),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    CsvError(#[from] csv::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, PipelineError>;
