//! # Hierarchical Expectation-Maximization
//!
//! Empirical-Bayes estimation of a population of units under one model. The
//! group-level prior is an independent Gaussian per parameter; the outer
//! loop alternates between fitting every unit by MAP under the current prior
//! (E-step, multi-start per unit, units parallel on the rayon pool) and
//! re-estimating the prior's moments from the unit fits (M-step). The
//! procedure follows Huys et al. (2011).
//!
//! The group log model evidence (LME) is a per-unit Laplace approximation
//! around each MAP point, summed over units, and drives convergence: the
//! loop stops when |ΔLME| falls below tolerance or the iteration cap is hit.
//! Convergence is judged on the LME alone; two iterations can have nearly
//! equal LME while parameters still drift, and that is accepted behavior.
//!
//! After every iteration the complete per-unit fit collection is persisted,
//! so a crashed run can be resumed at full-iteration granularity. The
//! terminal checkpoint additionally carries the [`GroupRecord`].

use crate::artifact::{FitArtifact, FitResult, GroupRecord};
use crate::data::{Dataset, PriorSpec};
use crate::multistart::best_of;
use crate::numerics::log_det_symmetric;
use crate::optimize::{FitError, FitOptions};
use crate::registry::ModelContract;

use itertools::izip;
use ndarray::Array1;
use rayon::prelude::*;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Group variance entries never drop below this.
pub const VARIANCE_FLOOR: f64 = 1e-5;

/// Configuration of one hierarchical run.
#[derive(Debug, Clone)]
pub struct EmConfig {
    /// Restarts per unit per E-step.
    pub n_starts: usize,
    pub base_seed: u64,
    /// Convergence tolerance on |ΔLME|.
    pub tol: f64,
    pub max_iter: usize,
    pub options: FitOptions,
    /// Optional explicit initial (mean, variance) instead of the default
    /// diffuse initialization from the plausible bounds.
    pub init: Option<(Vec<f64>, Vec<f64>)>,
    /// Where each iteration's checkpoint is written.
    pub checkpoint: PathBuf,
}

impl EmConfig {
    pub fn new(checkpoint: &Path) -> Self {
        Self {
            n_starts: 20,
            base_seed: 2020,
            tol: 1e-4,
            max_iter: 10,
            options: FitOptions::default(),
            init: None,
            checkpoint: checkpoint.to_path_buf(),
        }
    }
}

/// How the loop terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmStatus {
    Converged,
    MaxIterReached,
}

/// Final state of a hierarchical run.
#[derive(Debug)]
pub struct EmOutcome {
    pub fits: BTreeMap<String, FitResult>,
    pub group: GroupRecord,
    pub iterations: usize,
    pub status: EmStatus,
}

/// Run the full EM loop for one model over one dataset.
pub fn fit_hierarchical(
    model: &dyn ModelContract,
    data: &Dataset,
    config: &EmConfig,
) -> Result<EmOutcome, FitError> {
    if data.n_units() == 0 {
        return Err(FitError::EmptyDataset);
    }

    let n_params = model.n_params();
    let plausible = model.plausible_bounds();

    // Deliberately diffuse starting prior: midpoint mean, full-width variance.
    let (mut mus, mut vs): (Vec<f64>, Vec<f64>) = match &config.init {
        Some((mus, vs)) => (mus.clone(), vs.clone()),
        None => plausible
            .iter()
            .map(|&(lo, hi)| (lo + 0.5 * (hi - lo), hi - lo))
            .unzip(),
    };

    let total_rows = data.total_rows() as f64;
    let mut lme = 0.0;
    let mut iteration = 0;
    loop {
        iteration += 1;
        let prev_lme = lme;
        log::info!("EM iteration {iteration}: fitting {} units", data.n_units());

        // E-step: per-unit MAP multi-start under the current group prior.
        // Units are embarrassingly parallel; results stay keyed by unit id.
        let priors = PriorSpec::from_moments(&mus, &vs);
        let fits: BTreeMap<String, FitResult> = data
            .iter()
            .collect::<Vec<_>>()
            .into_par_iter()
            .map(|(unit_id, table)| {
                best_of(
                    config.n_starts,
                    config.base_seed,
                    model,
                    table,
                    Some(&priors),
                    &config.options,
                    None,
                )
                .map(|fit| (unit_id.to_string(), fit))
            })
            .collect::<Result<_, _>>()?;

        // M-step: moment updates from the unit point estimates.
        let n_units = fits.len() as f64;
        let mut mean_acc = Array1::<f64>::zeros(n_params);
        for fit in fits.values() {
            mean_acc += &Array1::from(fit.params.clone());
        }
        mus = (mean_acc / n_units).to_vec();

        let mut var_acc = Array1::<f64>::zeros(n_params);
        for fit in fits.values() {
            let params = Array1::from(fit.params.clone());
            var_acc += &(&params * &params + &fit.posterior_variance_diag());
        }
        vs = izip!(var_acc.iter(), mus.iter())
            .map(|(&second_moment, &mu)| (second_moment / n_units - mu * mu).max(VARIANCE_FLOOR))
            .collect();

        // Group LME: Laplace evidence per unit, units with a degenerate
        // Hessian determinant dropped from the sum.
        let mut group_ll = 0.0;
        let mut n_good = 0usize;
        for (unit_id, fit) in &fits {
            let log_det = match &fit.hessian {
                Some(h) => log_det_symmetric(h.view()),
                None => f64::NAN,
            };
            let evidence =
                fit.log_post + 0.5 * (n_params as f64 * (2.0 * std::f64::consts::PI).ln() - log_det);
            if evidence.is_finite() {
                group_ll += evidence;
                n_good += 1;
            } else {
                log::warn!("unit '{unit_id}': Hessian determinant degenerate, dropped from LME");
            }
        }
        lme = group_ll - n_params as f64 * total_rows.ln();
        log::info!(
            "EM iteration {iteration}: LME {lme:.4} ({n_good}/{} units contributing)",
            fits.len()
        );

        // Durable checkpoint for this iteration; the final one also carries
        // the group record.
        let mut artifact = FitArtifact::new(model.name(), fits.clone());
        let done = (lme - prev_lme).abs() < config.tol || iteration >= config.max_iter;
        if done {
            let group = GroupRecord {
                lme,
                mean: mus.clone(),
                variance: vs.clone(),
            };
            artifact.group = Some(group.clone());
            artifact.save(&config.checkpoint)?;
            let status = if (lme - prev_lme).abs() < config.tol {
                EmStatus::Converged
            } else {
                EmStatus::MaxIterReached
            };
            return Ok(EmOutcome {
                fits,
                group,
                iterations: iteration,
                status,
            });
        }
        artifact.save(&config.checkpoint)?;
    }
}
