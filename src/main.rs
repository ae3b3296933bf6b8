//! Command-line surface for the model-comparison side of the engine.
//!
//! Fitting runs in-process through the library (models are live objects
//! behind the registry, so they cannot arrive via a file); what the binary
//! exposes is everything downstream of the persisted artifact: inspecting a
//! fit collection and comparing several models' collections into the report
//! tables.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process;

use hierfit::artifact::FitArtifact;
use hierfit::bms::{self, BmsConfig};
use hierfit::report;

#[derive(Parser)]
#[command(
    name = "hierfit",
    version,
    about = "Group-level Bayesian comparison of hierarchical model fits"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print a summary of one persisted fit artifact
    Inspect {
        /// Path to a fit artifact (TOML)
        artifact: PathBuf,
    },
    /// Compare two or more models' fit artifacts and write report tables
    Compare {
        /// Paths to the fit artifacts, one per model
        artifacts: Vec<PathBuf>,
        /// Approximate every evidence entry by -BIC/2 instead of the
        /// Laplace evidence at the MAP point
        #[arg(long)]
        use_bic: bool,
        /// Monte Carlo draws for the exceedance probabilities
        #[arg(long, default_value = "1000000")]
        samples: usize,
        /// Seed for the exceedance sampler
        #[arg(long, default_value = "71")]
        seed: u64,
        /// Report metrics relative to the first model
        #[arg(long)]
        relative: bool,
        /// Directory the report CSVs are written into
        #[arg(long, default_value = ".")]
        out_dir: PathBuf,
    },
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Inspect { artifact } => inspect(&artifact),
        Commands::Compare {
            artifacts,
            use_bic,
            samples,
            seed,
            relative,
            out_dir,
        } => compare(&artifacts, use_bic, samples, seed, relative, &out_dir),
    };
    if let Err(message) = result {
        eprintln!("Error: {message}");
        process::exit(1);
    }
}

fn inspect(path: &PathBuf) -> Result<(), String> {
    let artifact = FitArtifact::load(path).map_err(|e| e.to_string())?;
    println!("model:   {}", artifact.model);
    println!("version: {}", artifact.version);
    println!("units:   {}", artifact.fits.len());
    for (unit_id, fit) in &artifact.fits {
        println!(
            "  {unit_id}: log_post {:.4}, log_like {:.4}, aic {:.2}, bic {:.2}",
            fit.log_post, fit.log_like, fit.aic, fit.bic
        );
    }
    match &artifact.group {
        Some(group) => {
            println!("group LME: {:.4}", group.lme);
            println!("group mean: {:?}", group.mean);
            println!("group variance: {:?}", group.variance);
        }
        None => println!("group record: none (run did not complete)"),
    }
    Ok(())
}

fn compare(
    paths: &[PathBuf],
    use_bic: bool,
    samples: usize,
    seed: u64,
    relative: bool,
    out_dir: &PathBuf,
) -> Result<(), String> {
    if paths.len() < 2 {
        return Err("compare needs at least two artifact paths".to_string());
    }
    let artifacts: Vec<FitArtifact> = paths
        .iter()
        .map(|p| FitArtifact::load(p).map_err(|e| format!("{}: {e}", p.display())))
        .collect::<Result<_, _>>()?;

    let lme = bms::evidence_matrix(&artifacts, use_bic).map_err(|e| e.to_string())?;
    let config = BmsConfig {
        n_samples: samples,
        seed,
        ..BmsConfig::default()
    };
    let result = bms::compare(lme.view(), &config).map_err(|e| e.to_string())?;

    let metrics = report::metric_table(&artifacts, relative).map_err(|e| e.to_string())?;
    let selection = report::selection_table(&artifacts, &result).map_err(|e| e.to_string())?;
    let metrics_path = out_dir.join("metrics.csv");
    let selection_path = out_dir.join("selection.csv");
    report::write_csv(&metrics, &metrics_path).map_err(|e| e.to_string())?;
    report::write_csv(&selection, &selection_path).map_err(|e| e.to_string())?;

    println!("wrote {}", metrics_path.display());
    println!("wrote {}", selection_path.display());
    for row in &selection {
        println!(
            "{}: E[freq] {:.3}, xp {:.3}, pxp {:.3}",
            row.model, row.expected_frequency, row.exceedance, row.protected_exceedance
        );
    }
    println!("BOR: {:.4}", result.bor);
    Ok(())
}
