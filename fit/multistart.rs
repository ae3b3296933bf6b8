//! # Parallel Multi-Start
//!
//! The loss surfaces behind behavioral models are rarely unimodal, so a
//! single optimizer run is never trusted. [`best_of`] launches `n_starts`
//! fully independent [`estimate`](crate::optimize::estimate) calls on a
//! rayon pool — restart `i` gets seed `base_seed + 2·i`, keeping the random
//! streams of neighboring restarts from overlapping — and keeps the fit with
//! the highest log-posterior. Results are keyed by restart index, not
//! completion order, and a tie on log-posterior goes to the lowest index so
//! reruns are reproducible regardless of scheduling.

use crate::artifact::FitResult;
use crate::data::{ObservationTable, PriorSpec};
use crate::optimize::{FitError, FitOptions, estimate};
use crate::registry::ModelContract;

use rayon::prelude::*;

/// Restarts whose final loss is within this of the winner count as having
/// reached the same basin. Diagnostic only.
const STABILITY_TOL: f64 = 1e-2;

/// Run `n_starts` independent estimates and return the best.
///
/// All inputs are shared read-only across workers; there is no cross-restart
/// state. Individual restart failures (for example a malformed explicit
/// initial point) propagate, since they indicate a caller error rather than
/// optimizer noise.
pub fn best_of(
    n_starts: usize,
    base_seed: u64,
    model: &dyn ModelContract,
    data: &ObservationTable,
    priors: Option<&PriorSpec>,
    options: &FitOptions,
    init: Option<&[f64]>,
) -> Result<FitResult, FitError> {
    if n_starts == 0 {
        return Err(FitError::NoRestarts);
    }

    let results: Vec<(usize, FitResult)> = (0..n_starts)
        .into_par_iter()
        .map(|i| {
            let seed = base_seed + 2 * i as u64;
            estimate(model, data, priors, options, init, seed).map(|fit| (i, fit))
        })
        .collect::<Result<_, _>>()?;

    // Winner: maximum log-posterior, first restart index on exact ties.
    let mut best: Option<&(usize, FitResult)> = None;
    for entry in &results {
        let better = match best {
            None => true,
            Some((_, incumbent)) => entry.1.log_post > incumbent.log_post,
        };
        if better {
            best = Some(entry);
        }
    }
    let (best_index, best_fit) = best.map(|(i, f)| (*i, f.clone())).ok_or(FitError::NoRestarts)?;

    let best_loss = -best_fit.log_post;
    let n_stable = results
        .iter()
        .filter(|(_, fit)| (-fit.log_post - best_loss).abs() < STABILITY_TOL)
        .count();
    log::debug!(
        "multi-start: best restart {best_index}/{n_starts} with loss {best_loss:.6}; \
         {n_stable}/{n_starts} restarts within {STABILITY_TOL}"
    );

    Ok(best_fit)
}
