//! # Fitted Model Persistence
//!
//! The self-contained artifact a fit run leaves behind: the validated spec
//! snapshot, outer weights and loadings, inner path coefficients and R²,
//! reliability diagnostics, bootstrap summaries with their replicate
//! coefficient sets, and the site score table. Everything is keyed by
//! construct and edge names and serialized to TOML, so a scenario can be
//! simulated later without refitting anything.
//!
//! Replicate coefficient sets are persisted alongside the summaries on
//! purpose: the simulation engine's uncertainty bands replay them, and
//! without them a reload could only produce point forecasts.

use crate::aggregate::SiteScoreTable;
use crate::bootstrap::{BootstrapResult, BootstrapSettings, EdgeSummary};
use crate::config::{ModelSpec, RawSpec, SpecError};
use crate::inner::{InnerModel, PathEstimate};
use crate::outer::OuterModel;
use crate::reliability::ReliabilityReport;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Failed to read or write model file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse TOML model file: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Failed to serialize model to TOML format: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
    #[error("The specification stored in the model file is no longer valid: {0}")]
    InvalidStoredSpec(#[from] SpecError),
}

/// Outer-model parameters for one construct.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OuterConstructArtifact {
    pub code: String,
    pub indicators: Vec<String>,
    pub weights: Vec<f64>,
    pub loadings: Vec<f64>,
    pub iterations: usize,
    pub converged: bool,
}

/// One structural edge with its full-sample coefficient.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathArtifact {
    pub source: String,
    pub target: String,
    pub coefficient: f64,
}

/// Reliability diagnostics in persistable form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReliabilityArtifact {
    pub code: String,
    pub cronbach_alpha: Option<f64>,
    pub ave: Option<f64>,
    pub composite_reliability: Option<f64>,
    pub ave_pass: bool,
    pub cr_pass: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HtmtArtifact {
    pub a: String,
    pub b: String,
    pub value: f64,
    pub flagged: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeSummaryArtifact {
    pub source: String,
    pub target: String,
    pub baseline: f64,
    pub mean: f64,
    pub std_error: f64,
    pub t_statistic: f64,
    pub p_value: f64,
    pub ci_lower: f64,
    pub ci_upper: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootstrapArtifact {
    pub n_resamples: usize,
    pub seed: u64,
    pub excluded: usize,
    pub complete: bool,
    pub edges: Vec<EdgeSummaryArtifact>,
    /// Successful replicate coefficient sets, edge order matching `paths`.
    pub replicates: Vec<Vec<f64>>,
}

/// The top-level, self-contained fitted-model artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FittedModel {
    pub spec: RawSpec,
    pub outer: Vec<OuterConstructArtifact>,
    pub paths: Vec<PathArtifact>,
    /// R² per endogenous/mediator construct.
    pub r_squared: BTreeMap<String, f64>,
    pub reliability: Vec<ReliabilityArtifact>,
    pub htmt: Vec<HtmtArtifact>,
    pub bootstrap: Option<BootstrapArtifact>,
    pub site_scores: SiteScoreTable,
}

impl FittedModel {
    /// Assembles the artifact from the in-memory results of a fit run.
    pub fn assemble(
        spec: &ModelSpec,
        outer: &OuterModel,
        inner: &InnerModel,
        reliability: &ReliabilityReport,
        bootstrap: Option<(&BootstrapResult, &BootstrapSettings)>,
        site_scores: SiteScoreTable,
    ) -> Self {
        let outer_artifacts = spec
            .constructs
            .iter()
            .zip(&outer.constructs)
            .map(|(c, e)| OuterConstructArtifact {
                code: c.code.clone(),
                indicators: c.indicators.clone(),
                weights: e.weights.clone(),
                loadings: e.loadings.clone(),
                iterations: e.iterations,
                converged: e.converged,
            })
            .collect();
        let paths = inner
            .paths
            .iter()
            .map(|p| PathArtifact {
                source: p.source.clone(),
                target: p.target.clone(),
                coefficient: p.coefficient,
            })
            .collect();
        let r_squared = inner
            .equations
            .iter()
            .map(|e| (e.target.clone(), e.r_squared))
            .collect();
        let reliability_artifacts = reliability
            .constructs
            .iter()
            .map(|c| ReliabilityArtifact {
                code: c.code.clone(),
                cronbach_alpha: c.cronbach_alpha,
                ave: c.ave,
                composite_reliability: c.composite_reliability,
                ave_pass: c.ave_pass,
                cr_pass: c.cr_pass,
            })
            .collect();
        let htmt = reliability
            .htmt
            .iter()
            .map(|h| HtmtArtifact {
                a: h.a.clone(),
                b: h.b.clone(),
                value: h.value,
                flagged: h.flagged,
            })
            .collect();
        let bootstrap = bootstrap.map(|(result, settings)| BootstrapArtifact {
            n_resamples: settings.n_resamples,
            seed: settings.seed,
            excluded: result.excluded,
            complete: result.complete,
            edges: result
                .summaries
                .iter()
                .map(|s| EdgeSummaryArtifact {
                    source: s.source.clone(),
                    target: s.target.clone(),
                    baseline: s.baseline,
                    mean: s.mean,
                    std_error: s.std_error,
                    t_statistic: s.t_statistic,
                    p_value: s.p_value,
                    ci_lower: s.ci_lower,
                    ci_upper: s.ci_upper,
                })
                .collect(),
            replicates: result.replicates.clone(),
        });

        Self {
            spec: spec.raw(),
            outer: outer_artifacts,
            paths,
            r_squared,
            reliability: reliability_artifacts,
            htmt,
            bootstrap,
            site_scores,
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), ModelError> {
        let text = toml::to_string_pretty(self)?;
        let file = fs::File::create(path)?;
        let mut writer = BufWriter::new(file);
        writer.write_all(text.as_bytes())?;
        writer.flush()?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, ModelError> {
        let text = fs::read_to_string(path)?;
        Ok(toml::from_str(&text)?)
    }

    /// Re-validates the stored spec snapshot into the indexed form.
    pub fn model_spec(&self) -> Result<ModelSpec, ModelError> {
        Ok(ModelSpec::validate(self.spec.clone())?)
    }

    /// Reconstructs the inner model (coefficients only; residuals and VIF
    /// stay with the original fit run).
    pub fn inner_model(&self) -> InnerModel {
        InnerModel {
            paths: self
                .paths
                .iter()
                .map(|p| PathEstimate {
                    source: p.source.clone(),
                    target: p.target.clone(),
                    coefficient: p.coefficient,
                })
                .collect(),
            equations: vec![],
        }
    }

    /// Reconstructs the bootstrap result for uncertainty replay.
    pub fn bootstrap_result(&self) -> Option<BootstrapResult> {
        self.bootstrap.as_ref().map(|b| BootstrapResult {
            summaries: b
                .edges
                .iter()
                .map(|e| EdgeSummary {
                    source: e.source.clone(),
                    target: e.target.clone(),
                    baseline: e.baseline,
                    mean: e.mean,
                    std_error: e.std_error,
                    t_statistic: e.t_statistic,
                    p_value: e.p_value,
                    ci_lower: e.ci_lower,
                    ci_upper: e.ci_upper,
                })
                .collect(),
            replicates: b.replicates.clone(),
            excluded: b.excluded,
            skipped: b.n_resamples - b.excluded - b.replicates.len(),
            complete: b.complete,
        })
    }
}
