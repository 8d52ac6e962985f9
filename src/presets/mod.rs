// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 petflow contributors

//! Built-in workflow presets
//!
//! A preset turns a typed configuration into a ready-made [`Graph`]
//! (see [`crate::pipeline::Graph`]), so common pipelines need no
//! hand-written workflow file.

pub mod pet;

pub use pet::PetConfig;
