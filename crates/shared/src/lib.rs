#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Autumn Shared Types and Utilities
//!
//! This crate contains the billing domain model and database utilities
//! shared across the Autumn platform.

pub mod db;
pub mod types;

pub use db::*;
pub use types::*;
