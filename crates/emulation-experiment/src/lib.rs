//! Emulation Experiment: runs component-defined experiments on the kernel.
//!
//! This crate wires the kernel together for a single process:
//! - Loads component repositories and an experiment configuration file
//! - Provides the built-in `core.*` component units
//! - Resolves, constructs and launches handlers with the local process executor
//! - Collects status broadcasts into a results file

pub mod config;
pub mod driver;
pub mod experiment;
pub mod results;
pub mod units;
