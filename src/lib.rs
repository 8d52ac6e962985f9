// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 petflow contributors

//! # petflow - per-subject dataflow workflows
//!
//! `petflow` runs a graph of processing nodes once for every subject and
//! session of a BIDS dataset, and gathers the results into one output tree.
//!
//! ## Features
//!
//! - **Typed graphs** - ports carry kinds, edges are checked before anything runs
//! - **Parameter expansion** - subject x session cross product in stable order
//! - **Idempotent runs** - nodes whose inputs did not change are skipped
//! - **Failure isolation** - a failing node only stops its own descendants
//! - **PET preset** - motion correction, FreeSurfer segmentation, PVC and kinetic modelling
//!
//! ## Quick Start
//!
//! ```bash
//! # Check the configuration and the dataset
//! petflow validate
//!
//! # Run four subject/session pairs at a time
//! petflow run --workers 4
//!
//! # Show the workflow
//! petflow graph --format mermaid
//! ```

pub mod cache;
pub mod cli;
pub mod collector;
pub mod config;
pub mod errors;
pub mod executors;
pub mod params;
pub mod pipeline;
pub mod presets;
pub mod resolver;
pub mod utils;

// Re-export commonly used types
pub use collector::OutputCollector;
pub use config::RunConfig;
pub use errors::{FlowError, FlowResult};
pub use params::{ParameterSpace, RunInstance};
pub use pipeline::{Graph, Node, PipelineExecutor};
pub use resolver::Resolver;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
