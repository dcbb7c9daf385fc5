//! Tenancy operator: configuration, startup and controller wiring

#![deny(missing_docs)]

/// Command-line configuration
pub mod config;
/// Controller construction and registration order
pub mod controller_runner;
/// Startup utilities (CRD install, default role templates)
pub mod startup;
