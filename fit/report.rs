//! # Comparison Report Assembly
//!
//! The documented shapes handed to external reporting and plotting
//! consumers: a per-model, per-unit metric table (NLL/AIC/BIC, optionally
//! relative to a reference model), a per-model selection table (expected
//! frequency, exceedance, protected exceedance, with the shared BOR on each
//! row), and per-unit fitted parameters mapped through the model's
//! interpretable-space transforms. Consumers perform no further statistics
//! on these tables; everything is written as plain CSV.

use crate::artifact::FitArtifact;
use crate::bms::{BmsError, BmsResult};
use crate::registry::ModelContract;

use serde::Serialize;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReportError {
    #[error("Failed to write report: {0}")]
    Csv(#[from] csv::Error),
    #[error("Report asked for {n_results} selection rows but {n_models} model artifacts were given.")]
    ModelCountMismatch { n_results: usize, n_models: usize },
    #[error(transparent)]
    Evidence(#[from] BmsError),
}

/// One row of the per-unit metric table.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct MetricRow {
    pub model: String,
    pub unit_id: String,
    pub nll: f64,
    pub aic: f64,
    pub bic: f64,
}

/// One row of the per-model selection table.
#[derive(Debug, Clone, Serialize)]
pub struct SelectionRow {
    pub model: String,
    pub expected_frequency: f64,
    pub exceedance: f64,
    pub protected_exceedance: f64,
    pub bor: f64,
}

/// Per-model, per-unit NLL/AIC/BIC rows.
///
/// With `relative_to_first`, every metric has the first model's value for
/// the same unit subtracted, so the reference model's rows read zero — the
/// convention the original tabling offered for side-by-side comparison.
pub fn metric_table(
    artifacts: &[FitArtifact],
    relative_to_first: bool,
) -> Result<Vec<MetricRow>, ReportError> {
    let mut rows = Vec::new();
    for artifact in artifacts {
        for (unit_id, fit) in &artifact.fits {
            let (mut nll, mut aic, mut bic) = (-fit.log_like, fit.aic, fit.bic);
            if relative_to_first {
                if let Some(reference) = artifacts[0].fits.get(unit_id) {
                    nll -= -reference.log_like;
                    aic -= reference.aic;
                    bic -= reference.bic;
                }
            }
            rows.push(MetricRow {
                model: artifact.model.clone(),
                unit_id: unit_id.clone(),
                nll,
                aic,
                bic,
            });
        }
    }
    Ok(rows)
}

/// Per-model selection rows from a finished comparison.
pub fn selection_table(
    artifacts: &[FitArtifact],
    result: &BmsResult,
) -> Result<Vec<SelectionRow>, ReportError> {
    if artifacts.len() != result.exceedance.len() {
        return Err(ReportError::ModelCountMismatch {
            n_results: result.exceedance.len(),
            n_models: artifacts.len(),
        });
    }
    Ok(artifacts
        .iter()
        .enumerate()
        .map(|(m, artifact)| SelectionRow {
            model: artifact.model.clone(),
            expected_frequency: result.expected_frequency[m],
            exceedance: result.exceedance[m],
            protected_exceedance: result.protected_exceedance[m],
            bor: result.bor,
        })
        .collect())
}

/// Fitted parameters for one model, mapped through the contract's
/// interpretable-space transforms: one CSV row per unit, one column per
/// parameter.
pub fn parameter_table(
    artifact: &FitArtifact,
    model: &dyn ModelContract,
    path: &Path,
) -> Result<(), ReportError> {
    let mut writer = csv::Writer::from_path(path)?;
    let names = model.param_names();
    let mut header = vec!["unit_id".to_string()];
    header.extend(names.iter().cloned());
    writer.write_record(&header)?;
    for (unit_id, fit) in &artifact.fits {
        let mut record = vec![unit_id.clone()];
        for (i, &value) in fit.params.iter().enumerate() {
            record.push(model.transform(i, value).to_string());
        }
        writer.write_record(&record)?;
    }
    writer.flush().map_err(csv::Error::from)?;
    Ok(())
}

/// Serialize a row collection to CSV (header derived from the row struct).
pub fn write_csv<R: Serialize>(rows: &[R], path: &Path) -> Result<(), ReportError> {
    let mut writer = csv::Writer::from_path(path)?;
    for row in rows {
        writer.serialize(row)?;
    }
    writer.flush().map_err(csv::Error::from)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::FitResult;
    use crate::bms::{BmsConfig, compare};
    use approx::assert_abs_diff_eq;
    use ndarray::Array2;
    use std::collections::BTreeMap;

    fn artifact(model: &str, log_like: f64) -> FitArtifact {
        let mut fits = BTreeMap::new();
        for unit in ["s1", "s2"] {
            fits.insert(
                unit.to_string(),
                FitResult {
                    log_post: log_like,
                    log_like,
                    params: vec![0.25],
                    param_names: vec!["rate".into()],
                    n_params: 1,
                    aic: 2.0 - 2.0 * log_like,
                    bic: 3.0 - 2.0 * log_like,
                    hessian: None,
                    hessian_inv: None,
                },
            );
        }
        FitArtifact::new(model, fits)
    }

    #[test]
    fn relative_metrics_zero_the_reference_model() {
        let artifacts = vec![artifact("base", -10.0), artifact("alt", -8.0)];
        let rows = metric_table(&artifacts, true).unwrap();
        assert_eq!(rows.len(), 4);
        let base_rows: Vec<&MetricRow> = rows.iter().filter(|r| r.model == "base").collect();
        for row in base_rows {
            assert_abs_diff_eq!(row.nll, 0.0, epsilon = 1e-12);
            assert_abs_diff_eq!(row.aic, 0.0, epsilon = 1e-12);
        }
        let alt = rows.iter().find(|r| r.model == "alt").unwrap();
        assert_abs_diff_eq!(alt.nll, -2.0, epsilon = 1e-12);
    }

    #[test]
    fn selection_table_carries_shared_bor() {
        let artifacts = vec![artifact("base", -10.0), artifact("alt", -8.0)];
        let lme = Array2::from_shape_fn((4, 2), |(_, m)| if m == 1 { 1.0 } else { 0.0 });
        let result = compare(
            lme.view(),
            &BmsConfig {
                n_samples: 10_000,
                block_size: 10_000,
                ..BmsConfig::default()
            },
        )
        .unwrap();
        let rows = selection_table(&artifacts, &result).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].bor.to_bits(), rows[1].bor.to_bits());
        assert!(rows[1].exceedance > rows[0].exceedance);
    }

    #[test]
    fn csv_files_are_written() {
        let dir = tempfile::tempdir().unwrap();
        let artifacts = vec![artifact("base", -10.0), artifact("alt", -8.0)];
        let rows = metric_table(&artifacts, false).unwrap();
        let path = dir.path().join("metrics.csv");
        write_csv(&rows, &path).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("model,unit_id,nll,aic,bic"));
        assert_eq!(text.lines().count(), 5);
    }

    struct Exp;
    impl ModelContract for Exp {
        fn name(&self) -> &str {
            "exp"
        }
        fn param_names(&self) -> Vec<String> {
            vec!["rate".into()]
        }
        fn bounds(&self) -> Vec<crate::registry::Bound> {
            vec![(f64::NEG_INFINITY, f64::INFINITY)]
        }
        fn plausible_bounds(&self) -> Vec<crate::registry::Bound> {
            vec![(-3.0, 3.0)]
        }
        fn transform(&self, _: usize, value: f64) -> f64 {
            value.exp()
        }
        fn loss(
            &self,
            _: &[f64],
            _: &crate::data::ObservationTable,
            _: Option<&crate::data::PriorSpec>,
        ) -> f64 {
            0.0
        }
    }

    #[test]
    fn parameter_table_applies_transforms() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("params.csv");
        parameter_table(&artifact("exp", -1.0), &Exp, &path).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        let mut lines = text.lines();
        assert_eq!(lines.next().unwrap(), "unit_id,rate");
        let first = lines.next().unwrap();
        // params stored as 0.25, reported as e^0.25
        assert!(first.starts_with("s1,"));
        let value: f64 = first.split(',').nth(1).unwrap().parse().unwrap();
        assert_abs_diff_eq!(value, 0.25f64.exp(), epsilon = 1e-12);
    }
}
