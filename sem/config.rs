//! # Model Specification
//!
//! The single source of truth for all SEM "wiring": latent constructs and
//! their survey indicators, the structural path diagram, the Likert scale the
//! survey uses, and the measurement-quality thresholds every downstream stage
//! reads its policy from.
//!
//! A specification is validated once, at load time. Validation rejects the
//! structural problems that would make the model unidentifiable (a cycle in
//! the path diagram, a reflective construct with a single indicator that was
//! not explicitly declared single-item) so that the estimators never have to
//! re-check them. The topological order of the path diagram is computed here
//! and cached; the simulation engine walks it on every forward pass.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use thiserror::Error;

/// Declared ordinal range of the survey items.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LikertScale {
    pub min: f64,
    pub max: f64,
}

impl Default for LikertScale {
    fn default() -> Self {
        Self { min: 1.0, max: 5.0 }
    }
}

/// Measurement-quality and collinearity thresholds. These are policy, not
/// hard limits: evaluators flag violations, they never block the pipeline.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Thresholds {
    /// Minimum Average Variance Extracted per construct.
    pub ave: f64,
    /// Minimum composite reliability per construct.
    pub composite_reliability: f64,
    /// Maximum HTMT ratio per construct pair.
    pub htmt: f64,
    /// Maximum variance-inflation factor per inner-model predictor.
    pub vif: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            ave: 0.5,
            composite_reliability: 0.7,
            htmt: 0.90,
            vif: 5.0,
        }
    }
}

/// Row-level data policy applied by the indicator-matrix builder and the
/// site aggregator.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DataPolicy {
    /// A respondent whose fraction of missing indicator cells exceeds this
    /// is excluded (and counted) rather than imputed.
    pub max_missing_fraction: f64,
    /// Sites with fewer respondents than this are marked low-confidence.
    pub min_site_respondents: usize,
}

impl Default for DataPolicy {
    fn default() -> Self {
        Self {
            max_missing_fraction: 0.25,
            min_site_respondents: 3,
        }
    }
}

/// One latent construct and its reflective indicators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConstructSpec {
    /// Short code used everywhere as the construct's key (e.g. "GOPS").
    pub code: String,
    /// Human-readable name for reports.
    pub name: String,
    /// Ordered indicator column names (e.g. "GOPS_1", "GOPS_2").
    pub indicators: Vec<String>,
    /// Indicators whose scale is inverted relative to the construct; the
    /// matrix builder flips them onto the common orientation.
    #[serde(default)]
    pub reverse_coded: Vec<String>,
    /// Explicit opt-in for a single-indicator construct. Reflective
    /// measurement wants >= 2 items; a lone indicator is only accepted when
    /// the spec author says so.
    #[serde(default)]
    pub single_item: bool,
}

/// A directed edge of the path diagram: `source` influences `target`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PathSpec {
    pub source: String,
    pub target: String,
}

/// Structural role of a construct, derived from the path diagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstructRole {
    /// No incoming edges.
    Exogenous,
    /// Both incoming and outgoing edges.
    Mediator,
    /// Incoming edges only.
    Endogenous,
}

/// Errors that make a model specification unusable. All are rejected at load
/// time, before any data is touched.
#[derive(Error, Debug)]
pub enum SpecError {
    #[error("Failed to read or write model specification file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse TOML model specification: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Failed to serialize model specification to TOML: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
    #[error("The specification declares no constructs.")]
    EmptyModel,
    #[error("Construct code '{0}' is declared more than once.")]
    DuplicateConstruct(String),
    #[error("Indicator '{0}' is assigned to more than one construct. Each survey item belongs to exactly one construct.")]
    DuplicateIndicator(String),
    #[error("Construct '{construct}' has {found} indicator(s); reflective measurement requires at least 2 unless the construct is marked single_item.")]
    TooFewIndicators { construct: String, found: usize },
    #[error("Reverse-coded item '{item}' on construct '{construct}' is not one of that construct's indicators.")]
    UnknownReverseCodedItem { construct: String, item: String },
    #[error("Path references unknown construct '{0}'.")]
    UnknownConstructInPath(String),
    #[error("Path '{from}' -> '{to}' is declared more than once.")]
    DuplicatePath { from: String, to: String },
    #[error("The path diagram contains a cycle involving construct '{0}'. Structural models must be acyclic.")]
    CyclicPathDiagram(String),
    #[error("Likert scale is degenerate: min {min} must be strictly below max {max}.")]
    DegenerateLikertScale { min: f64, max: f64 },
}

/// On-disk form of a specification. Kept loose (names, not indices) so the
/// TOML stays human-editable; `ModelSpec::validate` turns it into the indexed
/// form the estimators use.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawSpec {
    #[serde(default)]
    pub likert: LikertScale,
    #[serde(default)]
    pub thresholds: Thresholds,
    #[serde(default)]
    pub policy: DataPolicy,
    pub constructs: Vec<ConstructSpec>,
    pub paths: Vec<PathSpec>,
}

/// A validated model specification. Paths are stored as construct indices and
/// the topological order of the diagram is precomputed.
#[derive(Debug, Clone)]
pub struct ModelSpec {
    pub likert: LikertScale,
    pub thresholds: Thresholds,
    pub policy: DataPolicy,
    pub constructs: Vec<ConstructSpec>,
    /// Edges as (source index, target index) into `constructs`.
    pub paths: Vec<(usize, usize)>,
    /// Construct indices in a topological order of the path diagram.
    pub topo_order: Vec<usize>,
    index: HashMap<String, usize>,
}

impl ModelSpec {
    /// Validates a raw specification and builds the indexed form.
    pub fn validate(raw: RawSpec) -> Result<Self, SpecError> {
        if raw.constructs.is_empty() {
            return Err(SpecError::EmptyModel);
        }
        if raw.likert.min >= raw.likert.max {
            return Err(SpecError::DegenerateLikertScale {
                min: raw.likert.min,
                max: raw.likert.max,
            });
        }

        let mut index = HashMap::with_capacity(raw.constructs.len());
        let mut seen_indicators: HashMap<&str, &str> = HashMap::new();
        for (i, construct) in raw.constructs.iter().enumerate() {
            if index.insert(construct.code.clone(), i).is_some() {
                return Err(SpecError::DuplicateConstruct(construct.code.clone()));
            }
            if construct.indicators.len() < 2 && !construct.single_item {
                return Err(SpecError::TooFewIndicators {
                    construct: construct.code.clone(),
                    found: construct.indicators.len(),
                });
            }
            for item in &construct.indicators {
                if seen_indicators.insert(item, &construct.code).is_some() {
                    return Err(SpecError::DuplicateIndicator(item.clone()));
                }
            }
            for item in &construct.reverse_coded {
                if !construct.indicators.contains(item) {
                    return Err(SpecError::UnknownReverseCodedItem {
                        construct: construct.code.clone(),
                        item: item.clone(),
                    });
                }
            }
        }

        let mut paths = Vec::with_capacity(raw.paths.len());
        for path in &raw.paths {
            let source = *index
                .get(&path.source)
                .ok_or_else(|| SpecError::UnknownConstructInPath(path.source.clone()))?;
            let target = *index
                .get(&path.target)
                .ok_or_else(|| SpecError::UnknownConstructInPath(path.target.clone()))?;
            if paths.contains(&(source, target)) {
                return Err(SpecError::DuplicatePath {
                    from: path.source.clone(),
                    to: path.target.clone(),
                });
            }
            paths.push((source, target));
        }

        let topo_order = topological_order(raw.constructs.len(), &paths)
            .map_err(|blocked| SpecError::CyclicPathDiagram(raw.constructs[blocked].code.clone()))?;

        Ok(Self {
            likert: raw.likert,
            thresholds: raw.thresholds,
            policy: raw.policy,
            constructs: raw.constructs,
            paths,
            topo_order,
            index,
        })
    }

    /// Loads and validates a specification from a TOML file.
    pub fn from_toml_file(path: &Path) -> Result<Self, SpecError> {
        let text = fs::read_to_string(path)?;
        let raw: RawSpec = toml::from_str(&text)?;
        Self::validate(raw)
    }

    /// Serializes the specification back to its raw TOML form.
    pub fn to_toml(&self) -> Result<String, SpecError> {
        Ok(toml::to_string_pretty(&self.raw())?)
    }

    /// Reconstructs the on-disk form (names instead of indices).
    pub fn raw(&self) -> RawSpec {
        RawSpec {
            likert: self.likert,
            thresholds: self.thresholds,
            policy: self.policy,
            constructs: self.constructs.clone(),
            paths: self
                .paths
                .iter()
                .map(|&(s, t)| PathSpec {
                    source: self.constructs[s].code.clone(),
                    target: self.constructs[t].code.clone(),
                })
                .collect(),
        }
    }

    /// Index of a construct by code.
    pub fn construct_index(&self, code: &str) -> Option<usize> {
        self.index.get(code).copied()
    }

    /// Construct codes in declaration order.
    pub fn construct_codes(&self) -> Vec<&str> {
        self.constructs.iter().map(|c| c.code.as_str()).collect()
    }

    /// All indicator column names, in construct declaration order.
    pub fn all_indicators(&self) -> Vec<&str> {
        self.constructs
            .iter()
            .flat_map(|c| c.indicators.iter().map(|s| s.as_str()))
            .collect()
    }

    /// Indices of constructs with an edge into `target`.
    pub fn predecessors(&self, target: usize) -> Vec<usize> {
        self.paths
            .iter()
            .filter(|&&(_, t)| t == target)
            .map(|&(s, _)| s)
            .collect()
    }

    /// Indices of constructs `source` has an edge into.
    pub fn successors(&self, source: usize) -> Vec<usize> {
        self.paths
            .iter()
            .filter(|&&(s, _)| s == source)
            .map(|&(_, t)| t)
            .collect()
    }

    /// Structural role derived from the path diagram.
    pub fn role(&self, construct: usize) -> ConstructRole {
        let has_in = self.paths.iter().any(|&(_, t)| t == construct);
        let has_out = self.paths.iter().any(|&(s, _)| s == construct);
        match (has_in, has_out) {
            (false, _) => ConstructRole::Exogenous,
            (true, true) => ConstructRole::Mediator,
            (true, false) => ConstructRole::Endogenous,
        }
    }

    /// The set of constructs reachable from `start` by following edges
    /// forward, excluding `start` itself.
    pub fn reachable_from(&self, start: usize) -> Vec<usize> {
        let mut seen = vec![false; self.constructs.len()];
        let mut stack = self.successors(start);
        let mut out = Vec::new();
        while let Some(node) = stack.pop() {
            if seen[node] {
                continue;
            }
            seen[node] = true;
            out.push(node);
            stack.extend(self.successors(node));
        }
        out
    }

    /// The built-in GSCM mining model: five green-supply-chain practice
    /// constructs, three mediators, two perceived outcomes, thirteen paths.
    pub fn default_gscm() -> Self {
        let constructs = vec![
            construct("GPUR", "Green Purchasing", &["GPUR_1", "GPUR_2", "GPUR_3", "GPUR_4"]),
            construct("GOPS", "Green Operations", &["GOPS_1", "GOPS_2", "GOPS_3", "GOPS_4"]),
            construct("GLOG", "Green Logistics", &["GLOG_1", "GLOG_2", "GLOG_3"]),
            construct("GTRN", "Green Training & Awareness", &["GTRN_1", "GTRN_2", "GTRN_3"]),
            construct("GCOL", "Green Collaboration", &["GCOL_1", "GCOL_2", "GCOL_3"]),
            construct("SUPINT", "Supplier Integration", &["SUPINT_1", "SUPINT_2", "SUPINT_3"]),
            construct("MAINT", "Maintenance Quality", &["MAINT_1", "MAINT_2", "MAINT_3"]),
            construct("COMP", "Employee Competence", &["COMP_1", "COMP_2", "COMP_3"]),
            construct(
                "OE",
                "Perceived Operational Efficiency",
                &["OE_1", "OE_2", "OE_3", "OE_4", "OE_5"],
            ),
            construct(
                "EP",
                "Perceived Enterprise Performance",
                &["EP_1", "EP_2", "EP_3", "EP_4", "EP_5"],
            ),
        ];
        let paths = [
            ("GPUR", "SUPINT"),
            ("GPUR", "MAINT"),
            ("GOPS", "MAINT"),
            ("GOPS", "COMP"),
            ("GLOG", "SUPINT"),
            ("GTRN", "COMP"),
            ("GTRN", "MAINT"),
            ("GCOL", "SUPINT"),
            ("GCOL", "GOPS"),
            ("SUPINT", "OE"),
            ("MAINT", "OE"),
            ("COMP", "OE"),
            ("OE", "EP"),
        ]
        .iter()
        .map(|&(s, t)| PathSpec {
            source: s.to_string(),
            target: t.to_string(),
        })
        .collect();

        let raw = RawSpec {
            likert: LikertScale::default(),
            thresholds: Thresholds::default(),
            policy: DataPolicy::default(),
            constructs,
            paths,
        };
        // The built-in model is static and acyclic.
        Self::validate(raw).expect("built-in GSCM model specification is valid")
    }
}

fn construct(code: &str, name: &str, indicators: &[&str]) -> ConstructSpec {
    ConstructSpec {
        code: code.to_string(),
        name: name.to_string(),
        indicators: indicators.iter().map(|s| s.to_string()).collect(),
        reverse_coded: Vec::new(),
        single_item: false,
    }
}

/// Kahn's algorithm. Returns a topological order of nodes `0..n`, or the
/// index of a node still blocked by in-degree when a cycle prevents
/// completion.
fn topological_order(n: usize, edges: &[(usize, usize)]) -> Result<Vec<usize>, usize> {
    let mut in_degree = vec![0usize; n];
    for &(_, target) in edges {
        in_degree[target] += 1;
    }
    let mut ready: Vec<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
    // Reverse so pop() visits lower indices first; the order is then stable
    // across runs for the same spec.
    ready.reverse();
    let mut order = Vec::with_capacity(n);
    while let Some(node) = ready.pop() {
        order.push(node);
        for &(source, target) in edges {
            if source == node {
                in_degree[target] -= 1;
                if in_degree[target] == 0 {
                    ready.push(target);
                }
            }
        }
    }
    if order.len() == n {
        Ok(order)
    } else {
        let blocked = (0..n)
            .find(|&i| in_degree[i] > 0)
            .unwrap_or(0);
        Err(blocked)
    }
}
