//! Core modules
//!
//! Contains configuration, critical sections, error and shared types.

pub mod config;
pub mod critical;
pub mod cs_cell;
pub mod error;
pub mod types;
