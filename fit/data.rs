//! # Dataset and Prior Containers
//!
//! This module holds the validated in-memory shapes the fitting core consumes:
//! per-unit observation tables with named columns, the population `Dataset`
//! keyed by unit id, and the independent Gaussian priors used for MAP fits.
//!
//! How the tables get here (CSV, database, simulation) is a caller concern;
//! the fitting engine only sees these structures. Validation is therefore
//! structural: column/row shape agreement and the reserved-key rule for the
//! unit id namespace. Failures here are user-input errors and the `DataError`
//! variants are written to be actionable.

use ndarray::{Array2, ArrayView1};
use std::collections::BTreeMap;
use thiserror::Error;

/// Unit key reserved for the group-level record inside persisted artifacts.
pub const GROUP_KEY: &str = "group";

/// Errors raised while assembling a [`Dataset`].
#[derive(Error, Debug)]
pub enum DataError {
    #[error("Observation table has {n_columns} column names but {n_values} value columns.")]
    ColumnCountMismatch { n_columns: usize, n_values: usize },
    #[error("Observation table column '{0}' does not exist.")]
    ColumnNotFound(String),
    #[error("Unit id '{0}' is reserved and cannot name an observation table.")]
    ReservedUnitId(String),
    #[error("Observation table for unit '{0}' has zero rows.")]
    EmptyUnit(String),
}

/// One unit's observations: ordered rows (trials) over named columns.
#[derive(Debug, Clone)]
pub struct ObservationTable {
    columns: Vec<String>,
    values: Array2<f64>,
}

impl ObservationTable {
    pub fn new(columns: Vec<String>, values: Array2<f64>) -> Result<Self, DataError> {
        if columns.len() != values.ncols() {
            return Err(DataError::ColumnCountMismatch {
                n_columns: columns.len(),
                n_values: values.ncols(),
            });
        }
        Ok(Self { columns, values })
    }

    /// Number of trials (rows).
    pub fn n_rows(&self) -> usize {
        self.values.nrows()
    }

    pub fn column_names(&self) -> &[String] {
        &self.columns
    }

    /// View of one named column over all trials.
    pub fn column(&self, name: &str) -> Result<ArrayView1<f64>, DataError> {
        let idx = self
            .columns
            .iter()
            .position(|c| c == name)
            .ok_or_else(|| DataError::ColumnNotFound(name.to_string()))?;
        Ok(self.values.column(idx))
    }
}

/// Population data: unit id → observation table.
///
/// A `BTreeMap` keeps unit iteration order deterministic, which the EM loop
/// relies on when pairing results back up with unit ids.
#[derive(Debug, Clone, Default)]
pub struct Dataset {
    units: BTreeMap<String, ObservationTable>,
}

impl Dataset {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert one unit's table. The id `"group"` is rejected because the
    /// persisted artifact reserves that key for the group record.
    pub fn insert(&mut self, unit_id: &str, table: ObservationTable) -> Result<(), DataError> {
        if unit_id == GROUP_KEY {
            return Err(DataError::ReservedUnitId(unit_id.to_string()));
        }
        if table.n_rows() == 0 {
            return Err(DataError::EmptyUnit(unit_id.to_string()));
        }
        self.units.insert(unit_id.to_string(), table);
        Ok(())
    }

    pub fn get(&self, unit_id: &str) -> Option<&ObservationTable> {
        self.units.get(unit_id)
    }

    pub fn n_units(&self) -> usize {
        self.units.len()
    }

    pub fn unit_ids(&self) -> impl Iterator<Item = &str> {
        self.units.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ObservationTable)> {
        self.units.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Total trial count summed over every unit.
    pub fn total_rows(&self) -> usize {
        self.units.values().map(ObservationTable::n_rows).sum()
    }
}

/// Independent Gaussian prior over one parameter.
#[derive(Debug, Clone, Copy)]
pub struct GaussianPrior {
    pub mean: f64,
    pub sd: f64,
}

impl GaussianPrior {
    pub fn log_pdf(&self, x: f64) -> f64 {
        let z = (x - self.mean) / self.sd;
        -0.5 * z * z - self.sd.ln() - 0.5 * (2.0 * std::f64::consts::PI).ln()
    }
}

/// Ordered list of independent Gaussian priors, one per parameter. Used only
/// for MAP fitting; `estimate` in MLE mode never sees one.
#[derive(Debug, Clone)]
pub struct PriorSpec {
    priors: Vec<GaussianPrior>,
}

impl PriorSpec {
    pub fn new(priors: Vec<GaussianPrior>) -> Self {
        Self { priors }
    }

    /// Build from per-parameter means and variances (the EM M-step output).
    pub fn from_moments(means: &[f64], variances: &[f64]) -> Self {
        let priors = means
            .iter()
            .zip(variances)
            .map(|(&mean, &var)| GaussianPrior { mean, sd: var.sqrt() })
            .collect();
        Self { priors }
    }

    pub fn len(&self) -> usize {
        self.priors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.priors.is_empty()
    }

    /// Joint log-density of an independent parameter vector.
    pub fn log_pdf(&self, params: &[f64]) -> f64 {
        self.priors
            .iter()
            .zip(params)
            .map(|(p, &x)| p.log_pdf(x))
            .sum()
    }
}
