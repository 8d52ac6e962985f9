// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 petflow contributors

//! Utility modules
//!
//! Terminal styling and progress helpers for the petflow CLI.

pub mod colors;
pub mod format;
pub mod spinner;

pub use colors::*;
pub use format::*;
pub use spinner::*;
