#![deny(dead_code)]
#![deny(unused_imports)]
//! Cross-validated benchmarking of survival models and feature selectors.

pub mod config;
pub mod data;
pub mod metrics;
pub mod orchestrator;
pub mod progress;
pub mod record;
pub mod scaler;
pub mod search;
pub mod split;
pub mod types;

#[path = "../catalog/mod.rs"]
pub mod catalog;
