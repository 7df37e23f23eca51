//! # Scenario Simulation
//!
//! Answers "what if this site's construct scores moved" questions: apply a
//! named set of construct deltas to a site's baseline scores, push the
//! perturbation through the structural path coefficients in one forward pass
//! over the cached topological order, and ask a KPI predictor for the
//! resulting KPI movement.
//!
//! The standardized path model is linear, so multiple simultaneous deltas
//! propagate additively and two scenarios applied separately sum to the
//! combined scenario. That linear superposition is a deliberate property of
//! the design, relied on by callers, and pinned by tests.
//!
//! Uncertainty bands come from the bootstrap: the forward pass and
//! prediction are repeated once per sampled replicate coefficient set, and
//! the resulting delta distribution is reported as mean plus a percentile
//! interval. A scenario construct that cannot reach any KPI-relevant
//! construct is reported with an explicit no-causal-path annotation rather
//! than a bare zero.

use crate::aggregate::SiteScoreTable;
use crate::bootstrap::{BootstrapResult, percentile};
use crate::config::ModelSpec;
use crate::inner::InnerModel;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use thiserror::Error;

/// Optional site descriptors handed through to the predictor untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SiteMetadata {
    pub site_id: String,
    #[serde(default)]
    pub fields: BTreeMap<String, f64>,
}

/// The capability the simulation engine needs from the external ML layer.
/// Any model shape works behind this: linear, tree ensemble, whatever.
pub trait KpiPredictor {
    /// KPI names this predictor produces, in a stable order.
    fn kpi_names(&self) -> Vec<String>;

    /// Predicted KPI values for one site's construct scores.
    fn predict(
        &self,
        construct_scores: &BTreeMap<String, f64>,
        site: &SiteMetadata,
    ) -> BTreeMap<String, f64>;

    /// Per-KPI construct contributions, when the model can explain itself.
    /// `None` means the engine must assume every construct is KPI-relevant.
    fn explain(
        &self,
        _construct_scores: &BTreeMap<String, f64>,
        _site: &SiteMetadata,
    ) -> Option<BTreeMap<String, BTreeMap<String, f64>>> {
        None
    }
}

/// A linear KPI model: intercept plus one coefficient per construct. This is
/// the persisted form the toolkit ships; fitting it is someone else's job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinearKpiPredictor {
    pub kpis: Vec<LinearKpiEquation>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinearKpiEquation {
    pub kpi: String,
    pub intercept: f64,
    pub coefficients: BTreeMap<String, f64>,
}

impl LinearKpiPredictor {
    pub fn from_toml_file(path: &Path) -> Result<Self, SimulationError> {
        let text = fs::read_to_string(path)?;
        Ok(toml::from_str(&text)?)
    }
}

impl KpiPredictor for LinearKpiPredictor {
    fn kpi_names(&self) -> Vec<String> {
        self.kpis.iter().map(|k| k.kpi.clone()).collect()
    }

    fn predict(
        &self,
        construct_scores: &BTreeMap<String, f64>,
        _site: &SiteMetadata,
    ) -> BTreeMap<String, f64> {
        self.kpis
            .iter()
            .map(|eq| {
                let value = eq.intercept
                    + eq.coefficients
                        .iter()
                        .map(|(c, coef)| coef * construct_scores.get(c).copied().unwrap_or(0.0))
                        .sum::<f64>();
                (eq.kpi.clone(), value)
            })
            .collect()
    }

    fn explain(
        &self,
        construct_scores: &BTreeMap<String, f64>,
        _site: &SiteMetadata,
    ) -> Option<BTreeMap<String, BTreeMap<String, f64>>> {
        Some(
            self.kpis
                .iter()
                .map(|eq| {
                    let contributions = eq
                        .coefficients
                        .iter()
                        .map(|(c, coef)| {
                            (
                                c.clone(),
                                coef * construct_scores.get(c).copied().unwrap_or(0.0),
                            )
                        })
                        .collect();
                    (eq.kpi.clone(), contributions)
                })
                .collect(),
        )
    }
}

/// A named, immutable set of construct perturbations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scenario {
    pub name: String,
    /// Construct code -> score delta.
    pub deltas: BTreeMap<String, f64>,
    /// Restrict reporting to these KPIs; empty means all the predictor has.
    #[serde(default)]
    pub target_kpis: Vec<String>,
}

/// On-disk scenario collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioFile {
    pub scenarios: Vec<Scenario>,
}

impl ScenarioFile {
    pub fn from_toml_file(path: &Path) -> Result<Self, SimulationError> {
        let text = fs::read_to_string(path)?;
        Ok(toml::from_str(&text)?)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SimulationSettings {
    /// How many bootstrap replicate coefficient sets feed the band.
    pub uncertainty_draws: usize,
    pub seed: u64,
    pub lower_percentile: f64,
    pub upper_percentile: f64,
}

impl Default for SimulationSettings {
    fn default() -> Self {
        Self {
            uncertainty_draws: 500,
            seed: 0x5eed,
            lower_percentile: 5.0,
            upper_percentile: 95.0,
        }
    }
}

#[derive(Error, Debug)]
pub enum SimulationError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Scenario '{scenario}' perturbs unknown construct '{construct}'.")]
    UnknownConstruct { scenario: String, construct: String },
    #[error("Scenario '{scenario}' targets KPI '{kpi}', which the predictor does not produce.")]
    UnknownKpi { scenario: String, kpi: String },
    #[error("Site '{0}' is not present in the baseline score table.")]
    UnknownSite(String),
}

/// Forecast for one KPI under one scenario.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KpiForecast {
    pub kpi: String,
    pub baseline: f64,
    /// Point forecast: perturbed minus baseline under the full-sample path
    /// coefficients.
    pub delta: f64,
    /// Mean delta over the bootstrap draws; NaN when no bootstrap was given.
    pub delta_mean: f64,
    pub ci_lower: f64,
    pub ci_upper: f64,
}

/// The full outcome of one scenario run at one site. Pure function of
/// (baseline, scenario, fitted model): rerunning it changes nothing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioResult {
    pub scenario: String,
    pub site_id: String,
    /// Propagated score change per construct, targeted and downstream.
    pub construct_deltas: BTreeMap<String, f64>,
    /// Path-diagram edges the effect actually flowed along.
    pub active_paths: Vec<(String, String)>,
    /// Targeted constructs with no directed path to any KPI-relevant
    /// construct. Their contribution is structurally zero, not computed
    /// zero.
    pub no_causal_path: Vec<String>,
    pub forecasts: Vec<KpiForecast>,
}

/// Runs one scenario against one site's baseline scores.
pub fn simulate(
    spec: &ModelSpec,
    inner: &InnerModel,
    bootstrap: Option<&BootstrapResult>,
    predictor: &dyn KpiPredictor,
    baseline: &SiteScoreTable,
    site_id: &str,
    scenario: &Scenario,
    settings: &SimulationSettings,
) -> Result<ScenarioResult, SimulationError> {
    let site = baseline
        .site(site_id)
        .ok_or_else(|| SimulationError::UnknownSite(site_id.to_string()))?;

    // Validate the scenario before touching anything.
    let mut targeted: Vec<(usize, f64)> = Vec::with_capacity(scenario.deltas.len());
    for (code, &delta) in &scenario.deltas {
        let index = spec
            .construct_index(code)
            .ok_or_else(|| SimulationError::UnknownConstruct {
                scenario: scenario.name.clone(),
                construct: code.clone(),
            })?;
        targeted.push((index, delta));
    }
    let kpi_names = predictor.kpi_names();
    for kpi in &scenario.target_kpis {
        if !kpi_names.contains(kpi) {
            return Err(SimulationError::UnknownKpi {
                scenario: scenario.name.clone(),
                kpi: kpi.clone(),
            });
        }
    }
    let report_kpis: Vec<String> = if scenario.target_kpis.is_empty() {
        kpi_names
    } else {
        scenario.target_kpis.clone()
    };

    let baseline_scores: BTreeMap<String, f64> = baseline
        .construct_codes
        .iter()
        .cloned()
        .zip(site.scores.iter().copied())
        .collect();
    let metadata = SiteMetadata {
        site_id: site_id.to_string(),
        ..SiteMetadata::default()
    };
    let baseline_prediction = predictor.predict(&baseline_scores, &metadata);

    // KPI-relevant constructs, from the predictor's own explanation when it
    // has one; otherwise assume everything matters (never a false
    // no-causal-path claim). Explanation is taken at a unit score vector so
    // relevance reflects the predictor's structure; a site whose current
    // score for a construct happens to be 0.0 must not erase that
    // construct's influence.
    let unit_scores: BTreeMap<String, f64> = spec
        .constructs
        .iter()
        .map(|c| (c.code.clone(), 1.0))
        .collect();
    let relevant: Vec<bool> = match predictor.explain(&unit_scores, &metadata) {
        Some(explanation) => {
            let mut flags = vec![false; spec.constructs.len()];
            for contributions in explanation.values() {
                for (code, contribution) in contributions {
                    if *contribution != 0.0 {
                        if let Some(i) = spec.construct_index(code) {
                            flags[i] = true;
                        }
                    }
                }
            }
            flags
        }
        None => vec![true; spec.constructs.len()],
    };

    let no_causal_path: Vec<String> = targeted
        .iter()
        .filter(|&&(index, _)| {
            !relevant[index] && !spec.reachable_from(index).iter().any(|&r| relevant[r])
        })
        .map(|&(index, _)| spec.constructs[index].code.clone())
        .collect();
    for code in &no_causal_path {
        log::info!(
            "Scenario '{}': construct '{code}' has no causal path to any KPI-relevant construct.",
            scenario.name
        );
    }

    let baseline_coefficients = inner.coefficient_vector();
    let deltas = propagate(spec, &baseline_coefficients, &targeted);

    let active_paths: Vec<(String, String)> = spec
        .paths
        .iter()
        .zip(&baseline_coefficients)
        .filter(|(&(source, _), &coef)| deltas[source] != 0.0 && coef != 0.0)
        .map(|(&(source, target), _)| {
            (
                spec.constructs[source].code.clone(),
                spec.constructs[target].code.clone(),
            )
        })
        .collect();

    let point_prediction = predict_with_deltas(predictor, &baseline_scores, &deltas, spec, &metadata);

    // One repeat of the forward pass + prediction per sampled replicate.
    let draw_deltas: Vec<BTreeMap<String, f64>> = match bootstrap {
        Some(result) if !result.replicates.is_empty() => {
            let chosen = choose_replicates(result.replicates.len(), settings);
            chosen
                .into_iter()
                .map(|r| {
                    let coefficients = &result.replicates[r];
                    let deltas = propagate(spec, coefficients, &targeted);
                    let prediction =
                        predict_with_deltas(predictor, &baseline_scores, &deltas, spec, &metadata);
                    prediction
                        .iter()
                        .map(|(kpi, value)| {
                            let base = baseline_prediction.get(kpi).copied().unwrap_or(0.0);
                            (kpi.clone(), value - base)
                        })
                        .collect()
                })
                .collect()
        }
        _ => Vec::new(),
    };

    let forecasts = report_kpis
        .into_iter()
        .map(|kpi| {
            let base = baseline_prediction.get(&kpi).copied().unwrap_or(0.0);
            let delta = point_prediction.get(&kpi).copied().unwrap_or(0.0) - base;
            let mut samples: Vec<f64> = draw_deltas
                .iter()
                .map(|d| d.get(&kpi).copied().unwrap_or(0.0))
                .collect();
            samples.sort_by(|a, b| a.total_cmp(b));
            let (delta_mean, ci_lower, ci_upper) = if samples.is_empty() {
                (f64::NAN, f64::NAN, f64::NAN)
            } else {
                (
                    samples.iter().sum::<f64>() / samples.len() as f64,
                    percentile(&samples, settings.lower_percentile),
                    percentile(&samples, settings.upper_percentile),
                )
            };
            KpiForecast {
                kpi,
                baseline: base,
                delta,
                delta_mean,
                ci_lower,
                ci_upper,
            }
        })
        .collect();

    let construct_deltas = spec
        .constructs
        .iter()
        .zip(&deltas)
        .filter(|(_, &d)| d != 0.0)
        .map(|(c, &d)| (c.code.clone(), d))
        .collect();

    Ok(ScenarioResult {
        scenario: scenario.name.clone(),
        site_id: site_id.to_string(),
        construct_deltas,
        active_paths,
        no_causal_path,
        forecasts,
    })
}

/// One forward pass over the topological order: each construct's delta is
/// its targeted delta plus the coefficient-weighted deltas of its upstream
/// constructs. `coefficients` is in spec edge order.
fn propagate(spec: &ModelSpec, coefficients: &[f64], targeted: &[(usize, f64)]) -> Vec<f64> {
    let mut deltas = vec![0.0f64; spec.constructs.len()];
    for &(index, delta) in targeted {
        deltas[index] += delta;
    }
    for &node in &spec.topo_order {
        if deltas[node] == 0.0 {
            continue;
        }
        for (edge, &(source, target)) in spec.paths.iter().enumerate() {
            if source == node {
                deltas[target] += coefficients[edge] * deltas[node];
            }
        }
    }
    deltas
}

fn predict_with_deltas(
    predictor: &dyn KpiPredictor,
    baseline_scores: &BTreeMap<String, f64>,
    deltas: &[f64],
    spec: &ModelSpec,
    metadata: &SiteMetadata,
) -> BTreeMap<String, f64> {
    let perturbed: BTreeMap<String, f64> = baseline_scores
        .iter()
        .map(|(code, &value)| {
            let shift = spec
                .construct_index(code)
                .map(|i| deltas[i])
                .unwrap_or(0.0);
            (code.clone(), value + shift)
        })
        .collect();
    predictor.predict(&perturbed, metadata)
}

/// Deterministic draw of replicate indices: everything when the pool fits
/// the budget, otherwise a seeded partial Fisher-Yates without replacement.
fn choose_replicates(available: usize, settings: &SimulationSettings) -> Vec<usize> {
    if available <= settings.uncertainty_draws {
        return (0..available).collect();
    }
    let mut indices: Vec<usize> = (0..available).collect();
    let mut rng = StdRng::seed_from_u64(settings.seed);
    for i in 0..settings.uncertainty_draws {
        let j = rng.gen_range(i..available);
        indices.swap(i, j);
    }
    indices.truncate(settings.uncertainty_draws);
    indices
}
