//! End-to-end exercise of the estimation → persistence → comparison chain
//! on synthetic Gaussian data with a known generating model.

use hierfit::artifact::FitArtifact;
use hierfit::bms::{self, BmsConfig};
use hierfit::data::{Dataset, ObservationTable, PriorSpec};
use hierfit::em::{self, EmConfig};
use hierfit::optimize::{self, FitOptions};
use hierfit::registry::{Bound, ModelContract, ModelRegistry};
use hierfit::report;

use approx::assert_abs_diff_eq;
use ndarray::{Array2, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use std::sync::Arc;

/// Free-mean Gaussian with unit observation noise.
struct FreeMean;

impl ModelContract for FreeMean {
    fn name(&self) -> &str {
        "free_mean"
    }
    fn param_names(&self) -> Vec<String> {
        vec!["mu".into()]
    }
    fn bounds(&self) -> Vec<Bound> {
        vec![(-50.0, 50.0)]
    }
    fn plausible_bounds(&self) -> Vec<Bound> {
        vec![(-5.0, 5.0)]
    }
    fn loss(&self, params: &[f64], data: &ObservationTable, priors: Option<&PriorSpec>) -> f64 {
        let mu = params[0];
        let y = data.column("y").expect("y column");
        let nll: f64 = y.iter().map(|&v| 0.5 * (v - mu) * (v - mu)).sum();
        match priors {
            Some(p) => nll - p.log_pdf(params),
            None => nll,
        }
    }
}

/// Zero-mean Gaussian with a free log-standard-deviation. Misspecified for
/// data whose true mean is far from zero.
struct ZeroMean;

impl ModelContract for ZeroMean {
    fn name(&self) -> &str {
        "zero_mean"
    }
    fn param_names(&self) -> Vec<String> {
        vec!["log_sd".into()]
    }
    fn bounds(&self) -> Vec<Bound> {
        vec![(-5.0, 5.0)]
    }
    fn plausible_bounds(&self) -> Vec<Bound> {
        vec![(-2.0, 2.0)]
    }
    fn transform(&self, _: usize, value: f64) -> f64 {
        value.exp()
    }
    fn loss(&self, params: &[f64], data: &ObservationTable, priors: Option<&PriorSpec>) -> f64 {
        let log_sd = params[0];
        let var = (2.0 * log_sd).exp();
        let y = data.column("y").expect("y column");
        let nll: f64 = y
            .iter()
            .map(|&v| 0.5 * v * v / var + log_sd + 0.5 * (2.0 * std::f64::consts::PI).ln())
            .sum();
        match priors {
            Some(p) => nll - p.log_pdf(params),
            None => nll,
        }
    }
}

fn gaussian_rows(rng: &mut StdRng, mean: f64, n: usize) -> ObservationTable {
    let rows: Vec<f64> = (0..n)
        .map(|_| mean + rng.sample::<f64, _>(StandardNormal))
        .collect();
    ObservationTable::new(
        vec!["y".into()],
        Array2::from_shape_vec((n, 1), rows).unwrap(),
    )
    .unwrap()
}

#[test]
fn mle_error_shrinks_with_sample_size() {
    let mut rng = StdRng::seed_from_u64(5);
    let true_mean = 1.5;
    for &n in &[25usize, 100, 400] {
        let table = gaussian_rows(&mut rng, true_mean, n);
        let fit = optimize::estimate(&FreeMean, &table, None, &FitOptions::default(), None, 9)
            .unwrap();
        let error = (fit.params[0] - true_mean).abs();
        // error < C/sqrt(N) with a generous constant
        assert!(
            error < 3.0 / (n as f64).sqrt(),
            "n = {n}: error {error} too large"
        );
    }
}

#[test]
fn hierarchical_fit_then_group_comparison_selects_the_generator() {
    // Population of 10 units, unit means drawn around 1.5.
    let mut rng = StdRng::seed_from_u64(21);
    let mut data = Dataset::new();
    for u in 0..10 {
        let unit_mean = 1.5 + 0.3 * rng.sample::<f64, _>(StandardNormal);
        data.insert(&format!("s{u:02}"), gaussian_rows(&mut rng, unit_mean, 60))
            .unwrap();
    }

    let mut registry = ModelRegistry::new();
    registry.register(Arc::new(FreeMean)).unwrap();
    registry.register(Arc::new(ZeroMean)).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let mut artifacts = Vec::new();
    for name in ["free_mean", "zero_mean"] {
        let model = registry.get(name).unwrap();
        let mut config = EmConfig::new(&dir.path().join(format!("{name}.toml")));
        config.n_starts = 4;
        let outcome = em::fit_hierarchical(model.as_ref(), &data, &config).unwrap();
        assert!(outcome.iterations <= config.max_iter);
        for &v in &outcome.group.variance {
            assert!(v >= em::VARIANCE_FLOOR);
        }
        // Reload from the checkpoint to exercise the persisted path.
        artifacts.push(FitArtifact::load(&config.checkpoint).unwrap());
    }

    // The generating model recovers the group mean.
    let free_group = artifacts[0].group.as_ref().unwrap();
    assert_abs_diff_eq!(free_group.mean[0], 1.5, epsilon = 0.4);

    let lme = bms::evidence_matrix(&artifacts, false).unwrap();
    let config = BmsConfig {
        n_samples: 200_000,
        ..BmsConfig::default()
    };
    let result = bms::compare(lme.view(), &config).unwrap();

    // Model frequencies overwhelmingly favor the generator.
    assert!(result.exceedance[0] > 0.9);
    assert!(result.protected_exceedance[0] > 0.8);
    assert!(result.bor < 0.5);
    for row in result.model_posterior.axis_iter(Axis(0)) {
        assert_abs_diff_eq!(row.sum(), 1.0, epsilon = 1e-6);
    }

    // Report tables line up with the comparison.
    let selection = report::selection_table(&artifacts, &result).unwrap();
    assert_eq!(selection[0].model, "free_mean");
    assert!(selection[0].exceedance > selection[1].exceedance);
    let metrics = report::metric_table(&artifacts, false).unwrap();
    assert_eq!(metrics.len(), 20);
}
