//! # Site-Level Construct Score Aggregation
//!
//! The bridge from survey space to KPI space: respondent-level latent scores
//! become one numeric score per site per construct (arithmetic mean).
//!
//! Policy lives in the result, not in control flow: sites under the
//! configured minimum respondent count are produced anyway but marked
//! low-confidence, and respondents without a usable site key are dropped
//! with a count. Callers render the warnings; nothing here aborts.

use crate::config::ModelSpec;
use ndarray::ArrayView2;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Aggregated construct scores for one site.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteScore {
    pub site_id: String,
    pub n_respondents: usize,
    /// True when `n_respondents` is under the configured minimum.
    pub low_confidence: bool,
    /// Mean latent score per construct, in `ModelSpec::constructs` order.
    pub scores: Vec<f64>,
}

/// The site x construct score table, keyed by site id (sorted, so output is
/// deterministic).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteScoreTable {
    pub construct_codes: Vec<String>,
    pub sites: Vec<SiteScore>,
    /// Respondents dropped for having no site key.
    pub unmapped_respondents: usize,
}

impl SiteScoreTable {
    pub fn site(&self, site_id: &str) -> Option<&SiteScore> {
        self.sites.iter().find(|s| s.site_id == site_id)
    }

    /// One site's score on one construct.
    pub fn score(&self, site_id: &str, construct: &str) -> Option<f64> {
        let c = self.construct_codes.iter().position(|code| code == construct)?;
        self.site(site_id).map(|s| s.scores[c])
    }

    pub fn low_confidence_sites(&self) -> Vec<&str> {
        self.sites
            .iter()
            .filter(|s| s.low_confidence)
            .map(|s| s.site_id.as_str())
            .collect()
    }
}

/// Aggregates respondent x construct latent scores to site level.
/// `site_ids` is row-aligned with `scores`; `None` marks an unmapped
/// respondent.
pub fn aggregate_scores(
    scores: ArrayView2<'_, f64>,
    site_ids: &[Option<String>],
    spec: &ModelSpec,
) -> SiteScoreTable {
    let n_constructs = spec.constructs.len();
    let mut by_site: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
    let mut unmapped = 0usize;
    for (row, site) in site_ids.iter().enumerate() {
        match site {
            Some(id) => by_site.entry(id.as_str()).or_default().push(row),
            None => unmapped += 1,
        }
    }
    if unmapped > 0 {
        log::warn!("Dropped {unmapped} respondents with no site key during aggregation.");
    }

    let min_respondents = spec.policy.min_site_respondents;
    let sites = by_site
        .into_iter()
        .map(|(site_id, rows)| {
            let mut means = vec![0.0f64; n_constructs];
            for &row in &rows {
                for (c, mean) in means.iter_mut().enumerate() {
                    *mean += scores[[row, c]];
                }
            }
            for mean in &mut means {
                *mean /= rows.len() as f64;
            }
            let low_confidence = rows.len() < min_respondents;
            if low_confidence {
                log::warn!(
                    "Site '{site_id}' has only {} respondents (minimum {min_respondents}); scores are low-confidence.",
                    rows.len()
                );
            }
            SiteScore {
                site_id: site_id.to_string(),
                n_respondents: rows.len(),
                low_confidence,
                scores: means,
            }
        })
        .collect();

    SiteScoreTable {
        construct_codes: spec.constructs.iter().map(|c| c.code.clone()).collect(),
        sites,
        unmapped_respondents: unmapped,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelSpec;
    use approx::assert_abs_diff_eq;
    use ndarray::Array2;

    fn site(id: &str) -> Option<String> {
        Some(id.to_string())
    }

    #[test]
    fn site_mean_equals_mean_of_its_respondents() {
        let spec = ModelSpec::default_gscm();
        let n_constructs = spec.constructs.len();
        // Three respondents at s1, one at s2.
        let mut scores = Array2::zeros((4, n_constructs));
        for c in 0..n_constructs {
            scores[[0, c]] = 1.0 + c as f64;
            scores[[1, c]] = 2.0 + c as f64;
            scores[[2, c]] = 6.0 + c as f64;
            scores[[3, c]] = -1.0;
        }
        let site_ids = vec![site("s1"), site("s1"), site("s1"), site("s2")];
        let table = aggregate_scores(scores.view(), &site_ids, &spec);

        let s1 = table.site("s1").unwrap();
        assert_eq!(s1.n_respondents, 3);
        for c in 0..n_constructs {
            assert_abs_diff_eq!(s1.scores[c], 3.0 + c as f64, epsilon = 1e-12);
        }
        // A site with a single respondent reproduces that respondent.
        let s2 = table.site("s2").unwrap();
        assert_abs_diff_eq!(s2.scores[0], -1.0);
    }

    #[test]
    fn small_sites_are_marked_low_confidence_but_still_produced() {
        let spec = ModelSpec::default_gscm();
        let n_constructs = spec.constructs.len();
        let scores = Array2::zeros((5, n_constructs));
        let site_ids = vec![site("big"), site("big"), site("big"), site("tiny"), site("tiny")];
        let table = aggregate_scores(scores.view(), &site_ids, &spec);

        assert!(!table.site("big").unwrap().low_confidence);
        assert!(table.site("tiny").unwrap().low_confidence);
        assert_eq!(table.low_confidence_sites(), vec!["tiny"]);
        assert_eq!(table.sites.len(), 2);
    }

    #[test]
    fn unmapped_respondents_are_dropped_and_counted() {
        let spec = ModelSpec::default_gscm();
        let scores = Array2::zeros((3, spec.constructs.len()));
        let site_ids = vec![site("s1"), None, None];
        let table = aggregate_scores(scores.view(), &site_ids, &spec);
        assert_eq!(table.unmapped_respondents, 2);
        assert_eq!(table.site("s1").unwrap().n_respondents, 1);
    }

    #[test]
    fn sites_come_out_sorted_by_id() {
        let spec = ModelSpec::default_gscm();
        let scores = Array2::zeros((3, spec.constructs.len()));
        let site_ids = vec![site("zeta"), site("alpha"), site("mid")];
        let table = aggregate_scores(scores.view(), &site_ids, &spec);
        let ids: Vec<&str> = table.sites.iter().map(|s| s.site_id.as_str()).collect();
        assert_eq!(ids, vec!["alpha", "mid", "zeta"]);
    }
}
