//! User CRD: local identity record for an external principal

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// User is the local record created the first time an external principal
/// is granted access.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "tenancy.dev",
    version = "v1alpha1",
    kind = "User",
    printcolumn = r#"{"name":"Display Name","type":"string","jsonPath":".spec.displayName"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct UserSpec {
    /// Display name of the principal
    #[serde(default)]
    pub display_name: String,

    /// Login name for local users
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    /// External principal IDs mapped to this user
    #[serde(default)]
    pub principal_ids: Vec<String>,
}
