//! # Inner (Structural) Model Estimation
//!
//! One ordinary-least-squares equation per construct with incoming edges,
//! regressing its latent score on the scores of all constructs that point at
//! it. Latent scores arrive standardized (zero mean, unit variance), so the
//! fitted coefficients are already standardized path coefficients and no
//! intercept is needed.
//!
//! Collinearity among predictors is flagged, never silently repaired:
//! variance-inflation factors are attached to each equation and compared
//! against the configured threshold; the report decides what to do with them.

use crate::config::ModelSpec;
use crate::outer::EstimationError;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, s};
use ndarray_linalg::Solve;

/// A standardized coefficient on one path-diagram edge. The `paths` vector of
/// [`InnerModel`] is index-aligned with `ModelSpec::paths`.
#[derive(Debug, Clone)]
pub struct PathEstimate {
    pub source: String,
    pub target: String,
    pub coefficient: f64,
}

/// VIF of one predictor inside one equation.
#[derive(Debug, Clone)]
pub struct VifEntry {
    pub target: String,
    pub predictor: String,
    pub value: f64,
    /// True when the value exceeds the configured threshold.
    pub flagged: bool,
}

/// OLS fit of one endogenous/mediator construct's equation.
#[derive(Debug, Clone)]
pub struct EquationFit {
    pub target: String,
    pub r_squared: f64,
    pub residuals: Array1<f64>,
    pub vif: Vec<VifEntry>,
}

/// The fitted structural model for the full sample (or one bootstrap
/// resample).
#[derive(Debug, Clone)]
pub struct InnerModel {
    pub paths: Vec<PathEstimate>,
    pub equations: Vec<EquationFit>,
}

impl InnerModel {
    /// Coefficient on the edge `source -> target`, if the spec declares it.
    pub fn coefficient(&self, source: &str, target: &str) -> Option<f64> {
        self.paths
            .iter()
            .find(|p| p.source == source && p.target == target)
            .map(|p| p.coefficient)
    }

    /// Path coefficients in spec edge order, the shape the bootstrap engine
    /// collects.
    pub fn coefficient_vector(&self) -> Vec<f64> {
        self.paths.iter().map(|p| p.coefficient).collect()
    }

    /// Every VIF entry above threshold, across all equations.
    pub fn collinearity_warnings(&self) -> Vec<&VifEntry> {
        self.equations
            .iter()
            .flat_map(|eq| eq.vif.iter().filter(|v| v.flagged))
            .collect()
    }
}

/// Fits the structural equations on a respondent x construct score matrix
/// whose columns follow `spec.constructs` order.
pub fn fit_inner(
    scores: ArrayView2<'_, f64>,
    spec: &ModelSpec,
) -> Result<InnerModel, EstimationError> {
    let mut coefficients = vec![0.0f64; spec.paths.len()];
    let mut equations = Vec::new();

    for target in 0..spec.constructs.len() {
        let predictors = spec.predecessors(target);
        if predictors.is_empty() {
            continue;
        }

        let y = scores.column(target);
        let x = gather_columns(scores, &predictors);
        let beta = ols(x.view(), y)?;

        let fitted = x.dot(&beta);
        let residuals = &y - &fitted;
        let ss_res = residuals.dot(&residuals);
        let ss_tot = {
            let m = y.mean().unwrap_or(0.0);
            y.iter().map(|v| (v - m).powi(2)).sum::<f64>()
        };
        let r_squared = if ss_tot > 0.0 { 1.0 - ss_res / ss_tot } else { 0.0 };

        let target_code = spec.constructs[target].code.clone();
        let vif = variance_inflation(x.view(), &predictors, spec, &target_code)?;
        for entry in vif.iter().filter(|v| v.flagged) {
            log::warn!(
                "Collinearity: predictor '{}' in equation for '{}' has VIF {:.2} (threshold {}).",
                entry.predictor,
                entry.target,
                entry.value,
                spec.thresholds.vif
            );
        }

        for (k, &p) in predictors.iter().enumerate() {
            // Edge order is the spec's, not the equation's.
            let edge = spec
                .paths
                .iter()
                .position(|&(s_, t_)| s_ == p && t_ == target)
                .expect("predecessors come from spec.paths");
            coefficients[edge] = beta[k];
        }

        equations.push(EquationFit {
            target: target_code,
            r_squared,
            residuals,
            vif,
        });
    }

    let paths = spec
        .paths
        .iter()
        .zip(coefficients)
        .map(|(&(source, target), coefficient)| PathEstimate {
            source: spec.constructs[source].code.clone(),
            target: spec.constructs[target].code.clone(),
            coefficient,
        })
        .collect();

    Ok(InnerModel { paths, equations })
}

/// OLS via the normal equations. The predictor counts here are tiny (one
/// equation has at most a handful of incoming edges), so X'X is cheap and
/// well within f64 precision.
fn ols(x: ArrayView2<'_, f64>, y: ArrayView1<'_, f64>) -> Result<Array1<f64>, EstimationError> {
    let xtx = x.t().dot(&x);
    let xty = x.t().dot(&y);
    Ok(xtx.solve_into(xty)?)
}

fn gather_columns(scores: ArrayView2<'_, f64>, indices: &[usize]) -> Array2<f64> {
    let mut out = Array2::zeros((scores.nrows(), indices.len()));
    for (k, &i) in indices.iter().enumerate() {
        out.slice_mut(s![.., k]).assign(&scores.column(i));
    }
    out
}

/// VIF of each predictor: regress it on the other predictors in the same
/// equation; VIF = 1 / (1 - R²). A lone predictor has VIF 1 by definition.
fn variance_inflation(
    x: ArrayView2<'_, f64>,
    predictors: &[usize],
    spec: &ModelSpec,
    target_code: &str,
) -> Result<Vec<VifEntry>, EstimationError> {
    let k = predictors.len();
    let mut out = Vec::with_capacity(k);
    for (j, &p) in predictors.iter().enumerate() {
        let value = if k == 1 {
            1.0
        } else {
            let others: Vec<usize> = (0..k).filter(|&c| c != j).collect();
            let xj = x.column(j);
            let x_others = gather_columns(x, &others);
            let beta = ols(x_others.view(), xj)?;
            let fitted = x_others.dot(&beta);
            let resid = &xj - &fitted;
            let ss_res = resid.dot(&resid);
            let ss_tot = {
                let m = xj.mean().unwrap_or(0.0);
                xj.iter().map(|v| (v - m).powi(2)).sum::<f64>()
            };
            if ss_tot <= 0.0 {
                1.0
            } else {
                let r2 = (1.0 - ss_res / ss_tot).clamp(0.0, 1.0);
                if r2 >= 1.0 - 1e-12 {
                    f64::INFINITY
                } else {
                    1.0 / (1.0 - r2)
                }
            }
        };
        out.push(VifEntry {
            target: target_code.to_string(),
            predictor: spec.constructs[p].code.clone(),
            value,
            flagged: value > spec.thresholds.vif,
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConstructSpec, LikertScale, ModelSpec, PathSpec, RawSpec, Thresholds};
    use crate::outer::{population_std, standardize_columns};
    use approx::assert_abs_diff_eq;
    use ndarray::Array2;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    /// A three-construct chain spec: X -> M -> Y plus X -> Y. Constructs get
    /// dummy two-item indicator lists; the inner model only reads the paths.
    fn chain_spec(vif_threshold: f64) -> ModelSpec {
        let mk = |code: &str| ConstructSpec {
            code: code.to_string(),
            name: code.to_string(),
            indicators: vec![format!("{code}_1"), format!("{code}_2")],
            reverse_coded: vec![],
            single_item: false,
        };
        let p = |s: &str, t: &str| PathSpec {
            source: s.to_string(),
            target: t.to_string(),
        };
        ModelSpec::validate(RawSpec {
            likert: LikertScale::default(),
            thresholds: Thresholds {
                vif: vif_threshold,
                ..Thresholds::default()
            },
            policy: Default::default(),
            constructs: vec![mk("X"), mk("M"), mk("Y")],
            paths: vec![p("X", "M"), p("M", "Y"), p("X", "Y")],
        })
        .unwrap()
    }

    /// Standardized scores generated from a known linear structural model.
    fn known_scores(rng: &mut StdRng, n: usize, b_xm: f64, b_my: f64, b_xy: f64) -> Array2<f64> {
        let mut raw = Array2::zeros((n, 3));
        for i in 0..n {
            let x: f64 = rng.gen_range(-1.5..1.5);
            let m = b_xm * x + rng.gen_range(-0.5..0.5);
            let y = b_my * m + b_xy * x + rng.gen_range(-0.2..0.2);
            raw[[i, 0]] = x;
            raw[[i, 1]] = m;
            raw[[i, 2]] = y;
        }
        standardize_columns(raw.view())
    }

    #[test]
    fn recovers_known_path_coefficients() {
        let mut rng = StdRng::seed_from_u64(41);
        let spec = chain_spec(5.0);
        let scores = known_scores(&mut rng, 4000, 0.6, 0.5, 0.3);
        let inner = fit_inner(scores.view(), &spec).unwrap();

        // Standardized coefficients shrink by the ratio of predictor to
        // outcome dispersion; with weak noise they stay near the generating
        // values, and signs/ordering must be exact.
        let b_xm = inner.coefficient("X", "M").unwrap();
        let b_my = inner.coefficient("M", "Y").unwrap();
        let b_xy = inner.coefficient("X", "Y").unwrap();
        assert!(b_xm > 0.8, "X->M should dominate, got {b_xm}");
        assert!(b_my > 0.3 && b_xy > 0.1, "got M->Y {b_my}, X->Y {b_xy}");

        // Edge order follows the spec.
        assert_eq!(inner.paths[0].source, "X");
        assert_eq!(inner.paths[0].target, "M");
        assert_eq!(inner.coefficient_vector().len(), 3);

        // M's equation has a single predictor: VIF exactly 1, never flagged.
        let m_eq = inner.equations.iter().find(|e| e.target == "M").unwrap();
        assert_abs_diff_eq!(m_eq.vif[0].value, 1.0);
        assert!(!m_eq.vif[0].flagged);

        // Y is well explained.
        let y_eq = inner.equations.iter().find(|e| e.target == "Y").unwrap();
        assert!(y_eq.r_squared > 0.8);
        assert_eq!(y_eq.residuals.len(), 4000);
    }

    #[test]
    fn collinear_predictors_are_flagged_not_dropped() {
        let mut rng = StdRng::seed_from_u64(43);
        // X and M nearly duplicate each other, inflating VIF in Y's equation.
        let n = 500;
        let mut raw = Array2::zeros((n, 3));
        for i in 0..n {
            let x: f64 = rng.gen_range(-1.0..1.0);
            let m = x + rng.gen_range(-0.02..0.02);
            let y = x + m + rng.gen_range(-0.1..0.1);
            raw[[i, 0]] = x;
            raw[[i, 1]] = m;
            raw[[i, 2]] = y;
        }
        let scores = standardize_columns(raw.view());
        let spec = chain_spec(5.0);
        let inner = fit_inner(scores.view(), &spec).unwrap();

        let warnings = inner.collinearity_warnings();
        assert!(
            warnings.iter().any(|v| v.target == "Y"),
            "near-duplicate predictors must be flagged in Y's equation"
        );
        // Both predictors are still present in the fit.
        let y_eq = inner.equations.iter().find(|e| e.target == "Y").unwrap();
        assert_eq!(y_eq.vif.len(), 2);
    }

    #[test]
    fn exogenous_constructs_get_no_equation() {
        let mut rng = StdRng::seed_from_u64(47);
        let spec = chain_spec(5.0);
        let scores = known_scores(&mut rng, 200, 0.6, 0.5, 0.3);
        let inner = fit_inner(scores.view(), &spec).unwrap();
        assert!(inner.equations.iter().all(|e| e.target != "X"));
        assert_eq!(inner.equations.len(), 2);
    }

    #[test]
    fn standardized_scores_make_coefficients_standardized() {
        let mut rng = StdRng::seed_from_u64(53);
        let spec = chain_spec(5.0);
        let scores = known_scores(&mut rng, 1000, 0.5, 0.4, 0.2);
        for c in scores.columns() {
            assert_abs_diff_eq!(population_std(c), 1.0, epsilon = 1e-10);
        }
        let inner = fit_inner(scores.view(), &spec).unwrap();
        // A standardized coefficient can only leave [-1, 1] under heavy
        // collinearity, which this data does not have.
        for p in &inner.paths {
            assert!(p.coefficient.abs() <= 1.0 + 1e-9);
        }
    }
}
