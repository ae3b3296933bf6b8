//! # Model Contract and Registry
//!
//! Candidate models enter the engine through the [`ModelContract`] trait:
//! ordered parameter metadata (names, hard bounds, plausible bounds,
//! interpretable-space transforms) plus a scalar loss. The loss is a negative
//! log-likelihood; when a [`PriorSpec`] is supplied the implementation must
//! subtract the joint log-prior as well, which turns the minimized objective
//! into a negative log-posterior.
//!
//! Model lookup is an explicit registry populated at startup — a string key
//! maps to a live `Arc<dyn ModelContract>`. There is no reflection or dynamic
//! symbol resolution, and a contract whose metadata vectors disagree in
//! length is rejected at registration time rather than failing mid-fit.

use crate::data::{ObservationTable, PriorSpec};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// Inclusive lower/upper pair. Hard bounds may be infinite; plausible bounds
/// must be finite because initial points are drawn uniformly inside them.
pub type Bound = (f64, f64);

#[derive(Error, Debug)]
pub enum ContractError {
    #[error(
        "Model '{model}' metadata mismatch: {n_names} parameter names, {n_bounds} hard bounds, \
         {n_plausible} plausible bounds."
    )]
    MetadataMismatch {
        model: String,
        n_names: usize,
        n_bounds: usize,
        n_plausible: usize,
    },
    #[error("Model '{model}' parameter '{param}' has an invalid bound [{lo}, {hi}].")]
    InvalidBound {
        model: String,
        param: String,
        lo: f64,
        hi: f64,
    },
    #[error("Model '{0}' has no parameters.")]
    NoParameters(String),
    #[error("No model registered under the name '{0}'.")]
    UnknownModel(String),
    #[error("A model is already registered under the name '{0}'.")]
    DuplicateModel(String),
}

/// Capability set every candidate model exposes to the fitting engine.
pub trait ModelContract: Send + Sync {
    /// Stable identifier used for registry lookup and artifact labeling.
    fn name(&self) -> &str;

    /// Ordered parameter names. The order fixes the layout of every
    /// parameter vector, bound list, and prior list downstream.
    fn param_names(&self) -> Vec<String>;

    /// Hard box constraints, one per parameter.
    fn bounds(&self) -> Vec<Bound>;

    /// Plausible ranges used to draw random initial points.
    fn plausible_bounds(&self) -> Vec<Bound>;

    /// Map one optimizer-space parameter value to interpretable space.
    fn transform(&self, param_index: usize, value: f64) -> f64 {
        let _ = param_index;
        value
    }

    /// Negative log-likelihood of `params` given `data`; with `priors`
    /// supplied, additionally minus the joint log-prior.
    fn loss(&self, params: &[f64], data: &ObservationTable, priors: Option<&PriorSpec>) -> f64;

    fn n_params(&self) -> usize {
        self.param_names().len()
    }
}

fn validate(model: &dyn ModelContract) -> Result<(), ContractError> {
    let names = model.param_names();
    let bounds = model.bounds();
    let plausible = model.plausible_bounds();
    if names.is_empty() {
        return Err(ContractError::NoParameters(model.name().to_string()));
    }
    if names.len() != bounds.len() || names.len() != plausible.len() {
        return Err(ContractError::MetadataMismatch {
            model: model.name().to_string(),
            n_names: names.len(),
            n_bounds: bounds.len(),
            n_plausible: plausible.len(),
        });
    }
    for (name, &(lo, hi)) in names.iter().zip(plausible.iter()) {
        if !lo.is_finite() || !hi.is_finite() || lo >= hi {
            return Err(ContractError::InvalidBound {
                model: model.name().to_string(),
                param: name.clone(),
                lo,
                hi,
            });
        }
    }
    for (name, &(lo, hi)) in names.iter().zip(bounds.iter()) {
        if lo >= hi || lo.is_nan() || hi.is_nan() {
            return Err(ContractError::InvalidBound {
                model: model.name().to_string(),
                param: name.clone(),
                lo,
                hi,
            });
        }
    }
    Ok(())
}

/// Name → model map populated once at startup.
#[derive(Default)]
pub struct ModelRegistry {
    models: HashMap<String, Arc<dyn ModelContract>>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and register a model under its own name.
    pub fn register(&mut self, model: Arc<dyn ModelContract>) -> Result<(), ContractError> {
        validate(model.as_ref())?;
        let name = model.name().to_string();
        if self.models.contains_key(&name) {
            return Err(ContractError::DuplicateModel(name));
        }
        self.models.insert(name, model);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn ModelContract>, ContractError> {
        self.models
            .get(name)
            .cloned()
            .ok_or_else(|| ContractError::UnknownModel(name.to_string()))
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.models.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}
