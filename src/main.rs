//! Thin CLI shell around the estimation and simulation core. All it does is
//! parse arguments, wire files to the library, and render the structured
//! results; every statistical decision lives in the library modules.

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process;
use std::time::Duration;

use gscm_impact::aggregate::aggregate_scores;
use gscm_impact::bootstrap::{BootstrapSettings, run_bootstrap};
use gscm_impact::config::ModelSpec;
use gscm_impact::data::load_survey;
use gscm_impact::inner::fit_inner;
use gscm_impact::kpi::{IndexMethod, default_indices, load_kpi_table};
use gscm_impact::model::FittedModel;
use gscm_impact::outer::{OuterSettings, fit_outer};
use gscm_impact::reliability::evaluate;
use gscm_impact::simulate::{
    LinearKpiPredictor, ScenarioFile, SimulationSettings, simulate,
};

#[derive(Parser)]
#[command(
    name = "gscm-impact",
    about = "Estimate GSCM construct effects from survey data and simulate KPI impact scenarios",
    long_about = "Fits a PLS-SEM measurement and structural model on Likert survey data, \
                  attaches bootstrap significance to every path, aggregates latent scores \
                  to site level, and forecasts KPI deltas for what-if scenarios."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write the built-in GSCM model specification as editable TOML
    #[command(about = "Write the built-in model specification (outputs: spec.toml)")]
    Spec {
        /// Output path for the specification
        #[arg(long, default_value = "spec.toml")]
        output: PathBuf,
    },

    /// Fit the full model on survey data
    #[command(about = "Fit outer+inner models with bootstrap (outputs: model.toml)")]
    Fit {
        /// Path to the survey CSV (respondent_id, site_id, indicator columns)
        survey: PathBuf,

        /// Model specification TOML; the built-in GSCM model when omitted
        #[arg(long)]
        spec: Option<PathBuf>,

        /// Output path for the fitted model
        #[arg(long, default_value = "model.toml")]
        output: PathBuf,

        /// Bootstrap resample count
        #[arg(long, default_value = "5000")]
        resamples: usize,

        /// Bootstrap random seed
        #[arg(long, default_value = "24301")]
        seed: u64,

        /// Wall-clock budget for the bootstrap, in seconds
        #[arg(long)]
        time_budget_secs: Option<u64>,

        /// Maximum outer-model iterations
        #[arg(long, default_value = "300")]
        max_iter: usize,

        /// Outer-model convergence tolerance
        #[arg(long, default_value = "1e-5")]
        tolerance: f64,

        /// Also write the site construct score table as CSV
        #[arg(long)]
        sites_out: Option<PathBuf>,
    },

    /// Build the site-level KPI table with formative indices
    #[command(about = "Aggregate KPI data and compute OE_HARD/SAFETY_PERF (outputs: CSV)")]
    Kpi {
        /// Path to the KPI CSV (site_id plus numeric KPI columns)
        kpis: PathBuf,

        /// Index method: equal weights or the declared weighting
        #[arg(long, value_enum, default_value = "weighted")]
        method: KpiMethod,

        /// Output CSV path
        #[arg(long, default_value = "site_kpis.csv")]
        output: PathBuf,
    },

    /// Simulate what-if scenarios against a fitted model
    #[command(about = "Forecast KPI deltas for construct perturbations")]
    Simulate {
        /// Fitted model TOML from `fit`
        #[arg(long)]
        model: PathBuf,

        /// Linear KPI predictor TOML
        #[arg(long)]
        predictor: PathBuf,

        /// Scenario definitions TOML
        #[arg(long)]
        scenarios: PathBuf,

        /// Site to simulate
        #[arg(long)]
        site: String,

        /// Bootstrap draws feeding the uncertainty band
        #[arg(long, default_value = "500")]
        draws: usize,

        /// Seed for the replicate subsample
        #[arg(long, default_value = "24301")]
        seed: u64,

        /// Optional CSV output for the forecasts
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum KpiMethod {
    Simple,
    Weighted,
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Spec { output } => spec_command(&output),
        Commands::Fit {
            survey,
            spec,
            output,
            resamples,
            seed,
            time_budget_secs,
            max_iter,
            tolerance,
            sites_out,
        } => fit_command(
            &survey,
            spec.as_deref(),
            &output,
            resamples,
            seed,
            time_budget_secs,
            max_iter,
            tolerance,
            sites_out.as_deref(),
        ),
        Commands::Kpi {
            kpis,
            method,
            output,
        } => kpi_command(&kpis, method, &output),
        Commands::Simulate {
            model,
            predictor,
            scenarios,
            site,
            draws,
            seed,
            output,
        } => simulate_command(
            &model,
            &predictor,
            &scenarios,
            &site,
            draws,
            seed,
            output.as_deref(),
        ),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn spec_command(output: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let spec = ModelSpec::default_gscm();
    std::fs::write(output, spec.to_toml()?)?;
    println!("Model specification written to: {}", output.display());
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn fit_command(
    survey_path: &Path,
    spec_path: Option<&Path>,
    output: &Path,
    resamples: usize,
    seed: u64,
    time_budget_secs: Option<u64>,
    max_iter: usize,
    tolerance: f64,
    sites_out: Option<&Path>,
) -> Result<(), Box<dyn std::error::Error>> {
    let spec = match spec_path {
        Some(path) => {
            println!("Loading model specification from: {}", path.display());
            ModelSpec::from_toml_file(path)?
        }
        None => {
            println!("Using the built-in GSCM model specification.");
            ModelSpec::default_gscm()
        }
    };

    println!("Loading survey data from: {}", survey_path.display());
    let survey = load_survey(survey_path, &spec)?;
    println!(
        "Loaded {} respondents x {} indicators ({} excluded, {} cells imputed).",
        survey.n_respondents(),
        survey.indicator_names.len(),
        survey.audit.respondents_excluded,
        survey.audit.cells_imputed
    );

    let outer_settings = OuterSettings {
        tolerance,
        max_iterations: max_iter,
    };
    println!("Fitting outer (measurement) model...");
    let outer = fit_outer(survey.matrix.view(), &spec, &outer_settings)?;
    let non_convergent = outer.non_convergent();
    if !non_convergent.is_empty() {
        println!("Warning: non-convergent constructs: {}", non_convergent.join(", "));
    }

    println!("Fitting inner (structural) model...");
    let inner = fit_inner(outer.scores.view(), &spec)?;
    for eq in &inner.equations {
        println!("  {} : R² = {:.3}", eq.target, eq.r_squared);
    }
    for vif in inner.collinearity_warnings() {
        println!(
            "Warning: VIF {:.2} for predictor {} in equation for {}.",
            vif.value, vif.predictor, vif.target
        );
    }

    println!("Evaluating measurement reliability...");
    let reliability = evaluate(&outer, &spec);
    for code in reliability.failing_constructs() {
        println!("Warning: construct {code} fails a reliability threshold.");
    }
    for pair in reliability.discriminant_validity_flags() {
        println!(
            "Warning: HTMT {:.3} between {} and {} exceeds the ceiling.",
            pair.value, pair.a, pair.b
        );
    }

    let bootstrap_settings = BootstrapSettings {
        n_resamples: resamples,
        seed,
        time_budget: time_budget_secs.map(Duration::from_secs),
        ..BootstrapSettings::default()
    };
    println!("Bootstrapping {resamples} resamples (seed {seed})...");
    let bootstrap = run_bootstrap(
        survey.matrix.view(),
        &spec,
        &outer_settings,
        &bootstrap_settings,
        &inner,
    )?;
    if !bootstrap.complete {
        println!(
            "Warning: time budget exhausted after {} replicates; significance is partial.",
            bootstrap.replicates.len()
        );
    }
    println!("Path significance:");
    for edge in &bootstrap.summaries {
        println!(
            "  {} -> {} : beta = {:+.3}, se = {:.3}, t = {:+.2}, p = {:.4}",
            edge.source, edge.target, edge.baseline, edge.std_error, edge.t_statistic, edge.p_value
        );
    }

    println!("Aggregating latent scores to site level...");
    let sites = aggregate_scores(outer.scores.view(), &survey.site_ids, &spec);
    if sites.unmapped_respondents > 0 {
        println!(
            "Warning: dropped {} respondents with no site key.",
            sites.unmapped_respondents
        );
    }
    for site in sites.low_confidence_sites() {
        println!("Warning: site {site} is below the minimum respondent count.");
    }

    if let Some(path) = sites_out {
        write_site_scores_csv(path, &sites)?;
        println!("Site construct scores written to: {}", path.display());
    }

    let model = FittedModel::assemble(
        &spec,
        &outer,
        &inner,
        &reliability,
        Some((&bootstrap, &bootstrap_settings)),
        sites,
    );
    model.save(output)?;
    println!("Fitted model saved to: {}", output.display());
    Ok(())
}

fn kpi_command(
    kpi_path: &Path,
    method: KpiMethod,
    output: &Path,
) -> Result<(), Box<dyn std::error::Error>> {
    let method = match method {
        KpiMethod::Simple => IndexMethod::Simple,
        KpiMethod::Weighted => IndexMethod::Weighted,
    };
    println!("Loading KPI data from: {}", kpi_path.display());
    let indices = default_indices();
    let table = load_kpi_table(kpi_path, &indices, method)?;
    println!("Aggregated {} sites.", table.site_ids.len());

    let mut writer = csv::Writer::from_path(output)?;
    let mut header = vec!["site_id".to_string()];
    header.extend(table.kpi_names.iter().cloned());
    header.extend(table.indices.keys().cloned());
    writer.write_record(&header)?;
    for (row, site_id) in table.site_ids.iter().enumerate() {
        let mut record = vec![site_id.clone()];
        for col in 0..table.kpi_names.len() {
            record.push(format!("{:.6}", table.values[[row, col]]));
        }
        for series in table.indices.values() {
            record.push(format!("{:.6}", series[row]));
        }
        writer.write_record(&record)?;
    }
    writer.flush()?;
    println!("Site KPI table written to: {}", output.display());
    Ok(())
}

fn simulate_command(
    model_path: &Path,
    predictor_path: &Path,
    scenarios_path: &Path,
    site: &str,
    draws: usize,
    seed: u64,
    output: Option<&Path>,
) -> Result<(), Box<dyn std::error::Error>> {
    println!("Loading fitted model from: {}", model_path.display());
    let model = FittedModel::load(model_path)?;
    let spec = model.model_spec()?;
    let inner = model.inner_model();
    let bootstrap = model.bootstrap_result();

    println!("Loading KPI predictor from: {}", predictor_path.display());
    let predictor = LinearKpiPredictor::from_toml_file(predictor_path)?;
    let scenarios = ScenarioFile::from_toml_file(scenarios_path)?;

    let settings = SimulationSettings {
        uncertainty_draws: draws,
        seed,
        ..SimulationSettings::default()
    };

    let mut rows: Vec<Vec<String>> = Vec::new();
    for scenario in &scenarios.scenarios {
        println!("\n=== Scenario '{}' at site '{site}' ===", scenario.name);
        let result = simulate(
            &spec,
            &inner,
            bootstrap.as_ref(),
            &predictor,
            &model.site_scores,
            site,
            scenario,
            &settings,
        )?;

        for code in &result.no_causal_path {
            println!("  note: {code} has no causal path to any KPI-relevant construct");
        }
        if !result.active_paths.is_empty() {
            let flow: Vec<String> = result
                .active_paths
                .iter()
                .map(|(s, t)| format!("{s} -> {t}"))
                .collect();
            println!("  effect flows along: {}", flow.join(", "));
        }
        for forecast in &result.forecasts {
            if forecast.delta_mean.is_nan() {
                println!(
                    "  {} : delta = {:+.4} (baseline {:.4}, no uncertainty band)",
                    forecast.kpi, forecast.delta, forecast.baseline
                );
            } else {
                println!(
                    "  {} : delta = {:+.4} [{:+.4}, {:+.4}] (baseline {:.4})",
                    forecast.kpi,
                    forecast.delta,
                    forecast.ci_lower,
                    forecast.ci_upper,
                    forecast.baseline
                );
            }
            rows.push(vec![
                scenario.name.clone(),
                site.to_string(),
                forecast.kpi.clone(),
                format!("{:.6}", forecast.baseline),
                format!("{:.6}", forecast.delta),
                format!("{:.6}", forecast.ci_lower),
                format!("{:.6}", forecast.ci_upper),
            ]);
        }
    }

    if let Some(path) = output {
        let mut writer = csv::Writer::from_path(path)?;
        writer.write_record([
            "scenario", "site_id", "kpi", "baseline", "delta", "ci_lower", "ci_upper",
        ])?;
        for row in rows {
            writer.write_record(&row)?;
        }
        writer.flush()?;
        println!("\nForecasts written to: {}", path.display());
    }
    Ok(())
}

fn write_site_scores_csv(
    path: &Path,
    sites: &gscm_impact::aggregate::SiteScoreTable,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut writer = csv::Writer::from_path(path)?;
    let mut header = vec!["site_id".to_string(), "n_respondents".to_string(), "low_confidence".to_string()];
    header.extend(sites.construct_codes.iter().cloned());
    writer.write_record(&header)?;
    for site in &sites.sites {
        let mut record = vec![
            site.site_id.clone(),
            site.n_respondents.to_string(),
            site.low_confidence.to_string(),
        ];
        for score in &site.scores {
            record.push(format!("{score:.6}"));
        }
        writer.write_record(&record)?;
    }
    writer.flush()?;
    Ok(())
}
