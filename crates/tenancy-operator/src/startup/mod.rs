//! Startup utilities for the tenancy operator

mod crds;
mod role_data;

pub use crds::{crd_manifests, ensure_crds_installed};
pub use role_data::{default_role_templates, ensure_default_role_templates};
