//! Common types for the tenancy operator: CRDs, errors, and utilities

#![deny(missing_docs)]

pub mod crd;
pub mod error;
pub mod kube_utils;
pub mod leader_election;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// API group for all tenancy custom resources
pub const TENANCY_API_GROUP: &str = "tenancy.dev";

/// Namespace for operator-owned resources (leader lease)
pub const TENANCY_SYSTEM_NAMESPACE: &str = "tenancy-system";

/// Field manager used for server-side apply and status patches
pub const FIELD_MANAGER: &str = "tenancy-operator";

/// Annotation holding the ID of the user that created a Business
pub const CREATOR_ID_ANNOTATION: &str = "tenancy.dev/creator-id";

/// Annotation holding the display name of the principal on a binding
pub const PRINCIPAL_DISPLAY_NAME_ANNOTATION: &str = "tenancy.dev/principal-display-name";

/// Annotation marking a namespace as managed by the operator
pub const SYSTEM_NAMESPACE_ANNOTATION: &str = "tenancy.dev/system-namespace";

/// Label selecting membership ClusterRoles created for a Business
pub const MEMBERSHIP_ROLE_LABEL: &str = "tenancy.dev/membership-role";

/// Label on User objects holding a hash of their principal ID
pub const PRINCIPAL_HASH_LABEL: &str = "tenancy.dev/principal-hash";

/// Finalizer placed on bindings so removal can clean up RBAC objects
pub const BINDING_FINALIZER: &str = "tenancy.dev/binding-cleanup";

/// Finalizer placed on Businesses so removal can delete the backing namespace
pub const BUSINESS_FINALIZER: &str = "tenancy.dev/business-cleanup";
