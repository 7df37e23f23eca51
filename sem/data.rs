//! # Survey Loading and Indicator Matrix Construction
//!
//! This module is the exclusive entry point for respondent-level survey data.
//! It reads a CSV keyed by `respondent_id`/`site_id` with one ordinal column
//! per indicator, validates every cell against the declared Likert range, and
//! produces the clean numeric matrix the estimators work on.
//!
//! Missing-data policy (explicit, never silent):
//! - a respondent whose missing-cell fraction exceeds the configured
//!   threshold is excluded, and the exclusion is counted in the audit;
//! - remaining missing cells are imputed with the indicator's mean over the
//!   retained respondents, and every imputation is counted in the audit.
//!
//! Reverse-coded items are flipped onto the common orientation
//! (`min + max - x`) before anything else looks at the values.

use crate::config::ModelSpec;
use ndarray::Array2;
use polars::prelude::*;
use std::fs::File;
use std::path::Path;
use thiserror::Error;

/// Column holding the respondent key.
pub const RESPONDENT_ID_COL: &str = "respondent_id";
/// Column holding the site key. May be empty for unmapped respondents.
pub const SITE_ID_COL: &str = "site_id";

/// One raw survey row, indicator cells in `ModelSpec::all_indicators` order.
#[derive(Debug, Clone)]
pub struct RespondentRow {
    pub respondent_id: String,
    pub site_id: Option<String>,
    pub cells: Vec<Option<f64>>,
}

/// Counts of every non-fatal decision the builder made, so callers can render
/// warnings without re-deriving them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DataAudit {
    /// Respondents excluded for exceeding the missingness threshold.
    pub respondents_excluded: usize,
    /// Individual cells filled with the indicator mean.
    pub cells_imputed: usize,
}

/// The validated respondent x indicator matrix plus its keys and audit trail.
#[derive(Debug, Clone)]
pub struct SurveyData {
    pub respondent_ids: Vec<String>,
    /// `None` marks a respondent with no usable site key; the aggregator
    /// drops (and counts) these.
    pub site_ids: Vec<Option<String>>,
    /// Indicator column names, in `ModelSpec::all_indicators` order.
    pub indicator_names: Vec<String>,
    /// Complete numeric matrix, shape [n_respondents, n_indicators].
    pub matrix: Array2<f64>,
    pub audit: DataAudit,
}

impl SurveyData {
    pub fn n_respondents(&self) -> usize {
        self.matrix.nrows()
    }
}

/// Schema and range failures. These are user-input errors and fail fast,
/// before any estimation starts.
#[derive(Error, Debug)]
pub enum DataError {
    #[error("Error from the underlying Polars DataFrame library: {0}")]
    Polars(#[from] PolarsError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("The required column '{0}' was not found in the survey file. Please check spelling and case.")]
    ColumnNotFound(String),
    #[error("Column '{column}' could not be read as numeric Likert values (found type: {found_type}).")]
    ColumnWrongType { column: String, found_type: String },
    #[error("Respondent '{respondent}', column '{column}': value {value} is outside the declared ordinal range [{min}, {max}]. Missing values must be encoded as empty cells, not sentinels.")]
    ValueOutOfRange {
        respondent: String,
        column: String,
        value: f64,
        min: f64,
        max: f64,
    },
    #[error("The survey file contains no data rows.")]
    EmptySurvey,
    #[error("All {total} respondents were excluded by the missingness threshold ({max_missing_fraction}); nothing left to estimate on.")]
    AllRespondentsExcluded {
        total: usize,
        max_missing_fraction: f64,
    },
    #[error("Indicator '{0}' is missing for every retained respondent; its mean is undefined and imputation is impossible.")]
    IndicatorEntirelyMissing(String),
}

/// Loads a survey CSV and builds the indicator matrix for `spec`.
pub fn load_survey(path: &Path, spec: &ModelSpec) -> Result<SurveyData, DataError> {
    let df = CsvReader::new(File::open(path)?)
        .with_options(CsvReadOptions::default().with_has_header(true))
        .finish()?;

    let column_names: Vec<String> = df
        .get_column_names()
        .into_iter()
        .map(|s| s.to_string())
        .collect();
    if !column_names.iter().any(|c| c == RESPONDENT_ID_COL) {
        return Err(DataError::ColumnNotFound(RESPONDENT_ID_COL.to_string()));
    }
    if !column_names.iter().any(|c| c == SITE_ID_COL) {
        return Err(DataError::ColumnNotFound(SITE_ID_COL.to_string()));
    }
    for indicator in spec.all_indicators() {
        if !column_names.iter().any(|c| c == indicator) {
            return Err(DataError::ColumnNotFound(indicator.to_string()));
        }
    }

    let n = df.height();
    if n == 0 {
        return Err(DataError::EmptySurvey);
    }

    let respondent_ids = extract_key_column(&df, RESPONDENT_ID_COL, n);
    let site_ids: Vec<Option<String>> = {
        let raw = extract_key_column(&df, SITE_ID_COL, n);
        raw.into_iter()
            .map(|s| if s.is_empty() { None } else { Some(s) })
            .collect()
    };

    let indicator_names: Vec<String> =
        spec.all_indicators().iter().map(|s| s.to_string()).collect();
    let mut columns: Vec<Vec<Option<f64>>> = Vec::with_capacity(indicator_names.len());
    for name in &indicator_names {
        columns.push(extract_ordinal_column(&df, name)?);
    }

    let rows: Vec<RespondentRow> = (0..n)
        .map(|i| RespondentRow {
            respondent_id: respondent_ids[i].clone(),
            site_id: site_ids[i].clone(),
            cells: columns.iter().map(|col| col[i]).collect(),
        })
        .collect();

    build_indicator_matrix(rows, spec)
}

/// Pure core of the builder: validation, reverse-coding, the missingness
/// policy, and mean imputation. Exposed separately so in-memory rows (tests,
/// callers with their own ingestion) go through the identical path.
pub fn build_indicator_matrix(
    rows: Vec<RespondentRow>,
    spec: &ModelSpec,
) -> Result<SurveyData, DataError> {
    if rows.is_empty() {
        return Err(DataError::EmptySurvey);
    }

    let indicator_names: Vec<String> =
        spec.all_indicators().iter().map(|s| s.to_string()).collect();
    let n_indicators = indicator_names.len();
    let likert = spec.likert;

    let reverse: Vec<bool> = {
        let mut flags = vec![false; n_indicators];
        let mut offset = 0;
        for construct in &spec.constructs {
            for (j, item) in construct.indicators.iter().enumerate() {
                if construct.reverse_coded.contains(item) {
                    flags[offset + j] = true;
                }
            }
            offset += construct.indicators.len();
        }
        flags
    };

    // Validate ranges and flip reverse-coded items in one pass.
    let mut oriented: Vec<RespondentRow> = Vec::with_capacity(rows.len());
    for mut row in rows {
        for (j, cell) in row.cells.iter_mut().enumerate() {
            if let Some(value) = *cell {
                if !value.is_finite() || value < likert.min || value > likert.max {
                    return Err(DataError::ValueOutOfRange {
                        respondent: row.respondent_id.clone(),
                        column: indicator_names[j].clone(),
                        value,
                        min: likert.min,
                        max: likert.max,
                    });
                }
                if reverse[j] {
                    *cell = Some(likert.min + likert.max - value);
                }
            }
        }
        oriented.push(row);
    }

    // Missingness threshold: exclude, never impute, past it.
    let total = oriented.len();
    let max_missing = spec.policy.max_missing_fraction;
    let retained: Vec<RespondentRow> = oriented
        .into_iter()
        .filter(|row| {
            let missing = row.cells.iter().filter(|c| c.is_none()).count();
            (missing as f64) / (n_indicators as f64) <= max_missing
        })
        .collect();
    let respondents_excluded = total - retained.len();
    if retained.is_empty() {
        return Err(DataError::AllRespondentsExcluded {
            total,
            max_missing_fraction: max_missing,
        });
    }
    if respondents_excluded > 0 {
        log::warn!(
            "Excluded {respondents_excluded} of {total} respondents above the missingness threshold ({max_missing})."
        );
    }

    // Mean-impute what remains, counting every filled cell.
    let mut means = vec![0.0f64; n_indicators];
    for (j, mean) in means.iter_mut().enumerate() {
        let present: Vec<f64> = retained.iter().filter_map(|row| row.cells[j]).collect();
        if present.is_empty() {
            return Err(DataError::IndicatorEntirelyMissing(
                indicator_names[j].clone(),
            ));
        }
        *mean = present.iter().sum::<f64>() / present.len() as f64;
    }

    let mut cells_imputed = 0usize;
    let mut matrix = Array2::zeros((retained.len(), n_indicators));
    for (i, row) in retained.iter().enumerate() {
        for (j, cell) in row.cells.iter().enumerate() {
            matrix[[i, j]] = match cell {
                Some(value) => *value,
                None => {
                    cells_imputed += 1;
                    means[j]
                }
            };
        }
    }
    if cells_imputed > 0 {
        log::warn!("Imputed {cells_imputed} missing indicator cells with column means.");
    }

    Ok(SurveyData {
        respondent_ids: retained.iter().map(|r| r.respondent_id.clone()).collect(),
        site_ids: retained.iter().map(|r| r.site_id.clone()).collect(),
        indicator_names,
        matrix,
        audit: DataAudit {
            respondents_excluded,
            cells_imputed,
        },
    })
}

/// Reads a key column as strings, tolerating integer-typed keys. Null cells
/// become empty strings (the caller decides what emptiness means).
fn extract_key_column(df: &DataFrame, name: &str, n: usize) -> Vec<String> {
    let mut out = Vec::with_capacity(n);
    match df.column(name) {
        Ok(series) => {
            for i in 0..n {
                let value = series.get(i).unwrap_or(AnyValue::Null);
                out.push(match value {
                    AnyValue::Null => String::new(),
                    other => {
                        let text = other.to_string();
                        text.trim_matches('"').to_string()
                    }
                });
            }
        }
        Err(_) => out.resize(n, String::new()),
    }
    out
}

/// Reads one ordinal indicator column as nullable f64.
fn extract_ordinal_column(df: &DataFrame, name: &str) -> Result<Vec<Option<f64>>, DataError> {
    let series = df.column(name)?;
    let casted = series
        .cast(&DataType::Float64)
        .map_err(|_| DataError::ColumnWrongType {
            column: name.to_string(),
            found_type: format!("{:?}", series.dtype()),
        })?;
    let chunked = casted.f64()?.rechunk();
    Ok(chunked.into_iter().collect())
}
