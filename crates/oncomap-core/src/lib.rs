//! Core domain model and shared utilities for oncomap.

pub mod csv;
pub mod geo;
pub mod model;
pub mod text;
pub mod time;

pub use model::*;

pub const CRATE_NAME: &str = "oncomap-core";
