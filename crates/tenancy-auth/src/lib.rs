//! RBAC propagation for tenancy role templates
//!
//! Translates RoleTemplates and BusinessRoleTemplateBindings into Kubernetes
//! Roles, ClusterRoles and their bindings. The controllers here are plain
//! reconcile functions over an [`AuthContext`]; the operator binary wires
//! them into kube-runtime controllers.

#![deny(missing_docs)]

pub mod binding_controller;
pub mod business_controller;
pub mod client;
pub mod context;
pub mod identity;
pub mod index;
pub mod management_plane;
pub mod membership;
pub mod subject;
pub mod templates;

#[cfg(test)]
pub mod testing;

pub use client::{RbacClient, RbacClientImpl};
pub use context::{AuthConfig, AuthContext};
pub use identity::{IdentityStore, UserStore};
pub use index::BindingIndex;
pub use subject::Subject;
