//! # Objective KPI Tables and Formative Indices
//!
//! The KPI-side counterpart to survey aggregation: loads objective
//! per-site (or per-site-per-period) metrics, averages them to one row per
//! site, and folds selected KPIs into formative composite indices
//! (`OE_HARD`, operational efficiency; `SAFETY_PERF`, safety performance).
//!
//! Each component is z-scored across sites with population variance;
//! low-is-better KPIs are sign-flipped so every component points the same
//! way. The "simple" method averages components equally; the "weighted"
//! method uses declared weights, renormalized over the components that carry
//! one.

use ndarray::Array2;
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::path::Path;
use thiserror::Error;

/// Column holding the site key in KPI files.
pub const SITE_ID_COL: &str = "site_id";

/// How a formative index combines its standardized components.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexMethod {
    Simple,
    Weighted,
}

/// Declaration of one formative index over named KPI columns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KpiIndexSpec {
    pub name: String,
    pub high_is_better: Vec<String>,
    pub low_is_better: Vec<String>,
    /// Weights for [`IndexMethod::Weighted`]; components without a weight
    /// are skipped under that method.
    #[serde(default)]
    pub weights: BTreeMap<String, f64>,
}

impl KpiIndexSpec {
    fn components(&self) -> impl Iterator<Item = (&str, f64)> {
        self.high_is_better
            .iter()
            .map(|k| (k.as_str(), 1.0))
            .chain(self.low_is_better.iter().map(|k| (k.as_str(), -1.0)))
    }
}

/// The two core indices of the GSCM model, as declared by the project.
pub fn default_indices() -> Vec<KpiIndexSpec> {
    let weights = |pairs: &[(&str, f64)]| -> BTreeMap<String, f64> {
        pairs.iter().map(|&(k, w)| (k.to_string(), w)).collect()
    };
    vec![
        KpiIndexSpec {
            name: "OE_HARD".to_string(),
            high_is_better: vec!["uptime_percent".to_string(), "tons_per_hour".to_string()],
            low_is_better: vec![
                "cost_per_ton".to_string(),
                "rework_rate_percent".to_string(),
                "energy_kwh_per_ton".to_string(),
                "water_m3_per_ton".to_string(),
                "maintenance_cost_per_ton".to_string(),
            ],
            weights: weights(&[
                ("uptime_percent", 0.30),
                ("tons_per_hour", 0.30),
                ("cost_per_ton", 0.20),
                ("energy_kwh_per_ton", 0.10),
                ("rework_rate_percent", 0.05),
                ("maintenance_cost_per_ton", 0.05),
            ]),
        },
        KpiIndexSpec {
            name: "SAFETY_PERF".to_string(),
            high_is_better: vec![
                "safety_audits_passed_percent".to_string(),
                "employees_competent_percent".to_string(),
            ],
            low_is_better: vec!["ltifr".to_string(), "trifr".to_string()],
            weights: weights(&[
                ("ltifr", 0.40),
                ("trifr", 0.30),
                ("safety_audits_passed_percent", 0.20),
                ("employees_competent_percent", 0.10),
            ]),
        },
    ]
}

#[derive(Error, Debug)]
pub enum KpiError {
    #[error("Error from the underlying Polars DataFrame library: {0}")]
    Polars(#[from] PolarsError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("The required KPI column '{0}' was not found in the KPI file.")]
    ColumnNotFound(String),
    #[error("KPI column '{0}' could not be read as numeric values.")]
    ColumnWrongType(String),
    #[error("The KPI file contains no data rows.")]
    EmptyTable,
    #[error("KPI '{kpi}' has missing values for site '{site}'. KPI inputs must be complete.")]
    MissingValue { kpi: String, site: String },
}

/// One row per site: raw KPI means plus the computed index values.
#[derive(Debug, Clone)]
pub struct SiteKpiTable {
    pub site_ids: Vec<String>,
    pub kpi_names: Vec<String>,
    /// Site x KPI means, aligned with `site_ids` x `kpi_names`.
    pub values: Array2<f64>,
    /// Index name -> per-site value, aligned with `site_ids`.
    pub indices: BTreeMap<String, Vec<f64>>,
}

impl SiteKpiTable {
    pub fn kpi(&self, site_id: &str, kpi: &str) -> Option<f64> {
        let row = self.site_ids.iter().position(|s| s == site_id)?;
        let col = self.kpi_names.iter().position(|k| k == kpi)?;
        Some(self.values[[row, col]])
    }

    pub fn index(&self, site_id: &str, index: &str) -> Option<f64> {
        let row = self.site_ids.iter().position(|s| s == site_id)?;
        self.indices.get(index).map(|v| v[row])
    }
}

/// Loads a KPI CSV, averages to one row per site, and computes the given
/// formative indices.
pub fn load_kpi_table(
    path: &Path,
    indices: &[KpiIndexSpec],
    method: IndexMethod,
) -> Result<SiteKpiTable, KpiError> {
    let df = CsvReader::new(File::open(path)?)
        .with_options(CsvReadOptions::default().with_has_header(true))
        .finish()?;
    if df.height() == 0 {
        return Err(KpiError::EmptyTable);
    }

    let names: Vec<String> = df
        .get_column_names()
        .into_iter()
        .map(|s| s.to_string())
        .collect();
    if !names.iter().any(|c| c == SITE_ID_COL) {
        return Err(KpiError::ColumnNotFound(SITE_ID_COL.to_string()));
    }
    for spec in indices {
        for (kpi, _) in spec.components() {
            if !names.iter().any(|c| c == kpi) {
                return Err(KpiError::ColumnNotFound(kpi.to_string()));
            }
        }
    }

    let kpi_names: Vec<String> = names.into_iter().filter(|c| c != SITE_ID_COL).collect();

    // site -> per-KPI (sum, count), so repeated site rows average.
    let site_col = df.column(SITE_ID_COL)?;
    let mut per_site: BTreeMap<String, (Vec<f64>, usize)> = BTreeMap::new();
    let mut columns: Vec<Vec<Option<f64>>> = Vec::with_capacity(kpi_names.len());
    for name in &kpi_names {
        let series = df.column(name.as_str())?;
        let casted = series
            .cast(&DataType::Float64)
            .map_err(|_| KpiError::ColumnWrongType(name.clone()))?;
        columns.push(casted.f64()?.rechunk().into_iter().collect());
    }
    for row in 0..df.height() {
        let site = match site_col.get(row).unwrap_or(AnyValue::Null) {
            AnyValue::Null => continue,
            other => other.to_string().trim_matches('"').to_string(),
        };
        let entry = per_site
            .entry(site.clone())
            .or_insert_with(|| (vec![0.0; kpi_names.len()], 0));
        entry.1 += 1;
        for (k, col) in columns.iter().enumerate() {
            match col[row] {
                Some(v) => entry.0[k] += v,
                None => {
                    return Err(KpiError::MissingValue {
                        kpi: kpi_names[k].clone(),
                        site,
                    })
                }
            }
        }
    }
    if per_site.is_empty() {
        return Err(KpiError::EmptyTable);
    }

    let site_ids: Vec<String> = per_site.keys().cloned().collect();
    let mut values = Array2::zeros((site_ids.len(), kpi_names.len()));
    for (row, (_, (sums, count))) in per_site.iter().enumerate() {
        for (k, sum) in sums.iter().enumerate() {
            values[[row, k]] = sum / *count as f64;
        }
    }

    let mut table = SiteKpiTable {
        site_ids,
        kpi_names,
        values,
        indices: BTreeMap::new(),
    };
    for spec in indices {
        let series = compute_index(&table, spec, method);
        table.indices.insert(spec.name.clone(), series);
    }
    Ok(table)
}

/// Computes one formative index over the site table. Exposed for callers
/// that build their tables in memory.
pub fn compute_index(table: &SiteKpiTable, spec: &KpiIndexSpec, method: IndexMethod) -> Vec<f64> {
    let n = table.site_ids.len();
    let mut components: Vec<(String, Vec<f64>)> = Vec::new();
    for (kpi, orientation) in spec.components() {
        let Some(col) = table.kpi_names.iter().position(|k| k == kpi) else {
            continue;
        };
        let raw: Vec<f64> = (0..n).map(|row| table.values[[row, col]]).collect();
        let z = zscore(&raw);
        components.push((kpi.to_string(), z.iter().map(|v| v * orientation).collect()));
    }

    match method {
        IndexMethod::Simple => (0..n)
            .map(|row| {
                components.iter().map(|(_, z)| z[row]).sum::<f64>() / components.len() as f64
            })
            .collect(),
        IndexMethod::Weighted => {
            let total: f64 = components
                .iter()
                .filter_map(|(kpi, _)| spec.weights.get(kpi))
                .sum();
            (0..n)
                .map(|row| {
                    let weighted: f64 = components
                        .iter()
                        .filter_map(|(kpi, z)| spec.weights.get(kpi).map(|w| w * z[row]))
                        .sum();
                    if total > 0.0 { weighted / total } else { weighted }
                })
                .collect()
        }
    }
}

/// Population z-scores across sites. Constant columns become zeros.
fn zscore(values: &[f64]) -> Vec<f64> {
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    let sd = var.sqrt();
    if sd > 0.0 {
        values.iter().map(|v| (v - mean) / sd).collect()
    } else {
        vec![0.0; values.len()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn small_index() -> KpiIndexSpec {
        KpiIndexSpec {
            name: "IDX".to_string(),
            high_is_better: vec!["uptime_percent".to_string()],
            low_is_better: vec!["cost_per_ton".to_string()],
            weights: [("uptime_percent".to_string(), 0.75), ("cost_per_ton".to_string(), 0.25)]
                .into_iter()
                .collect(),
        }
    }

    fn write_csv(lines: &[&str]) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        for line in lines {
            writeln!(file, "{line}").unwrap();
        }
        file.flush().unwrap();
        file
    }

    #[test]
    fn repeated_site_rows_average_and_sites_sort() {
        let file = write_csv(&[
            "site_id,uptime_percent,cost_per_ton",
            "s2,90,12",
            "s1,80,10",
            "s1,86,14",
        ]);
        let table = load_kpi_table(file.path(), &[small_index()], IndexMethod::Simple).unwrap();
        assert_eq!(table.site_ids, vec!["s1", "s2"]);
        assert_abs_diff_eq!(table.kpi("s1", "uptime_percent").unwrap(), 83.0);
        assert_abs_diff_eq!(table.kpi("s1", "cost_per_ton").unwrap(), 12.0);
    }

    #[test]
    fn low_is_better_components_flip_sign() {
        // s1 has better uptime and lower cost: it must top the index under
        // both methods.
        let file = write_csv(&[
            "site_id,uptime_percent,cost_per_ton",
            "s1,95,8",
            "s2,85,12",
        ]);
        let simple = load_kpi_table(file.path(), &[small_index()], IndexMethod::Simple).unwrap();
        let weighted =
            load_kpi_table(file.path(), &[small_index()], IndexMethod::Weighted).unwrap();
        assert!(simple.index("s1", "IDX").unwrap() > simple.index("s2", "IDX").unwrap());
        assert!(weighted.index("s1", "IDX").unwrap() > weighted.index("s2", "IDX").unwrap());
        // Two sites, symmetric z-scores: the simple index is +-1.
        assert_abs_diff_eq!(simple.index("s1", "IDX").unwrap(), 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(simple.index("s2", "IDX").unwrap(), -1.0, epsilon = 1e-12);
    }

    #[test]
    fn missing_kpi_column_is_reported() {
        let file = write_csv(&["site_id,uptime_percent", "s1,90"]);
        match load_kpi_table(file.path(), &[small_index()], IndexMethod::Simple) {
            Err(KpiError::ColumnNotFound(c)) => assert_eq!(c, "cost_per_ton"),
            other => panic!("expected ColumnNotFound, got {other:?}"),
        }
    }

    #[test]
    fn default_indices_cover_the_core_kpis() {
        let indices = default_indices();
        assert_eq!(indices.len(), 2);
        let oe = &indices[0];
        assert_eq!(oe.name, "OE_HARD");
        assert!(oe.high_is_better.contains(&"uptime_percent".to_string()));
        assert!(oe.low_is_better.contains(&"cost_per_ton".to_string()));
        // water_m3_per_ton is a component but deliberately carries no weight.
        assert!(!oe.weights.contains_key("water_m3_per_ton"));
    }
}
