// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 petflow contributors

//! Workflow graphs and their execution
//!
//! This module defines nodes, ports and edges, validates graphs into
//! executable form and schedules them over run instances.

mod cancellation;
mod dag;
mod definition;
mod executor;
mod validation;

pub use cancellation::Cancellation;
pub use dag::Dag;
pub use definition::*;
pub use executor::{ExecutionOptions, InstanceResult, PipelineExecutor, PipelineResult};
pub use validation::{GraphValidator, InputSource, ValidatedGraph, ValidationResult};
