//! # Group-Level Bayesian Model Selection
//!
//! Random-effects comparison of competing models across a population of
//! units, after Stephan et al. (2009) and Rigoux et al. (2014). The input is
//! a units × models matrix of log model evidences assembled from persisted
//! fit artifacts; the output is the Dirichlet posterior over model
//! frequencies, per-unit model posteriors, Monte Carlo exceedance
//! probabilities, the Bayesian Omnibus Risk (BOR), and the protected
//! exceedance probabilities.
//!
//! Nothing in here aborts on numerical degeneracy: a unit whose evidence row
//! is non-finite is switched to a −½·BIC proxy, and Monte Carlo noise is
//! estimator variance, not failure. Structural problems — artifacts that
//! disagree about the unit population — are fatal and surface as errors
//! before any statistics run.

use crate::artifact::FitArtifact;
use crate::numerics::{PROB_EPS, digamma, ln_gamma, log_det_symmetric, softmax_rows};

use ndarray::{Array1, Array2, ArrayView2, Axis};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Gamma};
use rayon::prelude::*;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BmsError {
    #[error("Model comparison needs at least two models, got {0}.")]
    TooFewModels(usize),
    #[error("Model '{model}' was fitted on a different unit population (expected {expected:?}, found {found:?}).")]
    UnitMismatch {
        model: String,
        expected: Vec<String>,
        found: Vec<String>,
    },
    #[error("Evidence matrix is empty.")]
    EmptyEvidence,
}

/// Tuning for one `compare` invocation.
#[derive(Debug, Clone)]
pub struct BmsConfig {
    /// Convergence tolerance on ‖Δα‖ for the posterior fixed point.
    pub tol: f64,
    /// Total Monte Carlo draws for the exceedance estimate.
    pub n_samples: usize,
    /// Draws per sampling block; caps the memory of one block.
    pub block_size: usize,
    pub seed: u64,
}

impl Default for BmsConfig {
    fn default() -> Self {
        Self {
            tol: 1e-4,
            n_samples: 1_000_000,
            block_size: 100_000,
            seed: 71,
        }
    }
}

/// Everything `compare` produces.
#[derive(Debug, Clone)]
pub struct BmsResult {
    /// Dirichlet posterior pseudo-counts, one per model.
    pub alpha: Array1<f64>,
    /// Per-unit model posterior p(m | data), rows sum to one.
    pub model_posterior: Array2<f64>,
    /// Expected model frequencies E[r | data] = α / Σα.
    pub expected_frequency: Array1<f64>,
    /// P(model is the most frequent in the population).
    pub exceedance: Array1<f64>,
    /// Probability that observed frequency differences are spurious.
    pub bor: f64,
    /// Exceedance discounted toward uniform by the BOR.
    pub protected_exceedance: Array1<f64>,
}

/// Assemble the units × models log-evidence matrix from one artifact per
/// model.
///
/// With `use_bic` the evidence proxy is −½·BIC for every entry. Otherwise
/// each entry is the Laplace approximation at the unit's MAP point,
/// `log_post + ½(k·ln 2π − ln|H|)`; any unit whose row contains a non-finite
/// entry has the whole row replaced by its −½·BIC values so the matrix stays
/// well defined.
///
/// Artifacts must agree exactly on the unit id set; a mismatch is fatal.
pub fn evidence_matrix(
    artifacts: &[FitArtifact],
    use_bic: bool,
) -> Result<Array2<f64>, BmsError> {
    if artifacts.len() < 2 {
        return Err(BmsError::TooFewModels(artifacts.len()));
    }
    let unit_ids: Vec<String> = artifacts[0].unit_ids().iter().map(|s| s.to_string()).collect();
    if unit_ids.is_empty() {
        return Err(BmsError::EmptyEvidence);
    }
    for artifact in &artifacts[1..] {
        let found: Vec<String> = artifact.unit_ids().iter().map(|s| s.to_string()).collect();
        if found != unit_ids {
            return Err(BmsError::UnitMismatch {
                model: artifact.model.clone(),
                expected: unit_ids.clone(),
                found,
            });
        }
    }

    let (n_units, n_models) = (unit_ids.len(), artifacts.len());
    let mut lme = Array2::zeros((n_units, n_models));
    for (m, artifact) in artifacts.iter().enumerate() {
        for (u, unit_id) in unit_ids.iter().enumerate() {
            let fit = &artifact.fits[unit_id];
            lme[[u, m]] = if use_bic {
                -0.5 * fit.bic
            } else {
                let log_det = match &fit.hessian {
                    Some(h) => log_det_symmetric(h.view()),
                    None => f64::NAN,
                };
                fit.log_post
                    + 0.5 * (fit.n_params as f64 * (2.0 * std::f64::consts::PI).ln() - log_det)
            };
        }
    }

    // Degenerate rows fall back to the BIC proxy for every model.
    for (u, unit_id) in unit_ids.iter().enumerate() {
        if lme.row(u).iter().any(|v| !v.is_finite()) {
            log::warn!("unit '{unit_id}': degenerate evidence row, falling back to -BIC/2");
            for (m, artifact) in artifacts.iter().enumerate() {
                lme[[u, m]] = -0.5 * artifact.fits[unit_id].bic;
            }
        }
    }
    Ok(lme)
}

/// Run the full group-level comparison on a log-evidence matrix.
pub fn compare(lme: ArrayView2<f64>, config: &BmsConfig) -> Result<BmsResult, BmsError> {
    let (n_units, n_models) = lme.dim();
    if n_units == 0 || n_models == 0 {
        return Err(BmsError::EmptyEvidence);
    }
    if n_models < 2 {
        return Err(BmsError::TooFewModels(n_models));
    }

    let alpha0 = Array1::<f64>::ones(n_models);
    let (alpha, model_posterior) = dirichlet_fixed_point(lme, &alpha0, config.tol);

    let expected_frequency = &alpha / alpha.sum();
    let exceedance = dirichlet_exceedance(&alpha, config.n_samples, config.block_size, config.seed);
    let bor = omnibus_risk(lme, model_posterior.view(), &alpha, &alpha0);
    let protected_exceedance =
        exceedance.mapv(|xp| (1.0 - bor) * xp + bor / n_models as f64);

    Ok(BmsResult {
        alpha,
        model_posterior,
        expected_frequency,
        exceedance,
        bor,
        protected_exceedance,
    })
}

/// Variational fixed point for the Dirichlet posterior over model
/// frequencies. Returns (α, per-unit responsibilities).
fn dirichlet_fixed_point(
    lme: ArrayView2<f64>,
    alpha0: &Array1<f64>,
    tol: f64,
) -> (Array1<f64>, Array2<f64>) {
    let n_models = lme.ncols();
    let mut alpha = alpha0.clone();
    loop {
        let psi_sum = digamma(alpha.sum());
        // responsibility(u, m) ∝ exp(lme + ψ(α_m) − ψ(Σα)), normalized per
        // unit with the max trick.
        let mut log_u = lme.to_owned();
        for m in 0..n_models {
            let shift = digamma(alpha[m]) - psi_sum;
            log_u.column_mut(m).mapv_inplace(|v| v + shift);
        }
        let responsibility = softmax_rows(log_u.view());

        let beta = responsibility.sum_axis(Axis(0));
        let next: Array1<f64> = alpha0 + &beta;
        let delta = (&next - &alpha).mapv(|d| d * d).sum().sqrt();
        alpha = next;
        if delta < tol {
            return (alpha, responsibility);
        }
    }
}

/// Monte Carlo exceedance probabilities under Dirichlet(α).
///
/// Dirichlet draws are generated componentwise from Gamma(α_m, 1) (the
/// normalization cancels in the argmax), in blocks so memory stays bounded.
/// Blocks are independent, each with its own seeded generator, and partial
/// counts are summed; determinism across thread schedules follows from the
/// per-block seeding. A draw in which several models tie for the maximum at
/// exact float equality increments every tied model's count.
fn dirichlet_exceedance(
    alpha: &Array1<f64>,
    n_samples: usize,
    block_size: usize,
    seed: u64,
) -> Array1<f64> {
    let n_samples = n_samples.max(1);
    let block_size = block_size.clamp(1, n_samples);
    let n_models = alpha.len();
    let samplers: Vec<Gamma<f64>> = alpha
        .iter()
        .map(|&a| Gamma::new(a, 1.0).expect("alpha entries are strictly positive"))
        .collect();

    let n_blocks = n_samples.div_ceil(block_size);
    let counts: Vec<u64> = (0..n_blocks)
        .into_par_iter()
        .map(|block| {
            let mut rng = StdRng::seed_from_u64(seed.wrapping_add(block as u64));
            let start = block * block_size;
            let n_draws = block_size.min(n_samples - start);
            let mut local = vec![0u64; n_models];
            let mut draw = vec![0.0f64; n_models];
            for _ in 0..n_draws {
                for (value, sampler) in draw.iter_mut().zip(&samplers) {
                    *value = sampler.sample(&mut rng);
                }
                let max = draw.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
                for (count, &value) in local.iter_mut().zip(&draw) {
                    if value == max {
                        *count += 1;
                    }
                }
            }
            local
        })
        .reduce(
            || vec![0u64; n_models],
            |mut acc, local| {
                for (a, l) in acc.iter_mut().zip(local) {
                    *a += l;
                }
                acc
            },
        );

    Array1::from_iter(counts.iter().map(|&c| c as f64 / n_samples as f64))
}

/// Bayesian Omnibus Risk: posterior probability of the null hypothesis that
/// all models are equally frequent, BOR = 1 / (1 + exp(F1 − F0)).
fn omnibus_risk(
    lme: ArrayView2<f64>,
    responsibility: ArrayView2<f64>,
    alpha: &Array1<f64>,
    alpha0: &Array1<f64>,
) -> f64 {
    let f0 = null_free_energy(lme);
    let f1 = fitted_free_energy(lme, responsibility, alpha, alpha0);
    1.0 / (1.0 + (f1 - f0).exp())
}

/// Negative free energy of H0 (equal model frequencies).
fn null_free_energy(lme: ArrayView2<f64>) -> f64 {
    let n_models = lme.ncols() as f64;
    let qm = softmax_rows(lme);
    let mut f0 = 0.0;
    for (q_row, lme_row) in qm.axis_iter(Axis(0)).zip(lme.axis_iter(Axis(0))) {
        for (&q, &l) in q_row.iter().zip(lme_row.iter()) {
            f0 += q * (l - n_models.ln() - (q + PROB_EPS).ln());
        }
    }
    f0
}

/// Negative free energy of H1, the fitted random-effects alternative:
/// expected log-joint plus responsibility entropy plus Dirichlet entropy.
fn fitted_free_energy(
    lme: ArrayView2<f64>,
    responsibility: ArrayView2<f64>,
    alpha: &Array1<f64>,
    alpha0: &Array1<f64>,
) -> f64 {
    let psi_sum = digamma(alpha.sum());
    let e_log_r = alpha.mapv(|a| digamma(a) - psi_sum);

    let mut expected_log_joint = 0.0;
    for (r_row, lme_row) in responsibility.axis_iter(Axis(0)).zip(lme.axis_iter(Axis(0))) {
        for ((&r, &l), &elr) in r_row.iter().zip(lme_row.iter()).zip(e_log_r.iter()) {
            expected_log_joint += r * (l + elr);
        }
    }
    expected_log_joint += alpha0
        .iter()
        .zip(e_log_r.iter())
        .map(|(&a0, &elr)| (a0 - 1.0) * elr)
        .sum::<f64>();
    expected_log_joint += ln_gamma(alpha0.sum()) - alpha0.mapv(ln_gamma).sum();

    let responsibility_entropy = -responsibility
        .iter()
        .map(|&r| r * (r + PROB_EPS).ln())
        .sum::<f64>();

    let dirichlet_entropy = alpha.mapv(ln_gamma).sum() - ln_gamma(alpha.sum())
        - alpha
            .iter()
            .zip(e_log_r.iter())
            .map(|(&a, &elr)| (a - 1.0) * elr)
            .sum::<f64>();

    expected_log_joint + responsibility_entropy + dirichlet_entropy
}
