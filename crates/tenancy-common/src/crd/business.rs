//! Business CRD: the tenant boundary backed by a namespace

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::Condition;

/// Condition set once the backing namespace exists
pub const CONDITION_BACKING_NAMESPACE_CREATED: &str = "BackingNamespaceCreated";

/// Sticky condition set once the creator has been granted ownership
pub const CONDITION_CREATOR_MADE_OWNER: &str = "CreatorMadeOwner";

/// Business is the tenant boundary. Every Business owns a namespace of the
/// same name that holds its bindings and management-plane RBAC objects.
///
/// Example:
/// ```yaml
/// apiVersion: tenancy.dev/v1alpha1
/// kind: Business
/// metadata:
///   name: acme
///   namespace: local
///   annotations:
///     tenancy.dev/creator-id: u-1
/// spec:
///   displayName: ACME Corp
/// ```
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "tenancy.dev",
    version = "v1alpha1",
    kind = "Business",
    namespaced,
    status = "BusinessStatus",
    printcolumn = r#"{"name":"Display Name","type":"string","jsonPath":".spec.displayName"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct BusinessSpec {
    /// Human-readable name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,

    /// Free-form description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Business status
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BusinessStatus {
    /// Lifecycle conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}
