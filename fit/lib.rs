#![deny(dead_code)]
#![deny(unused_imports)]

//! Hierarchical MAP estimation and group-level Bayesian model selection.
//!
//! The pipeline runs dataset + model contract → single-fit optimization →
//! parallel multi-start → hierarchical EM → persisted fit artifact →
//! group-level model comparison → report tables.

pub mod artifact;
pub mod bms;
pub mod data;
pub mod em;
pub mod multistart;
pub mod numerics;
pub mod optimize;
pub mod registry;
pub mod report;
