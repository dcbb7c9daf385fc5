//! RoleTemplate CRD: a named, composable unit of access rules
//!
//! Templates may include other templates by name through
//! `roleTemplateNames`, forming a DAG that the reconciler flattens.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::PolicyRule;

/// RoleTemplate defines a reusable set of access rules.
///
/// Example:
/// ```yaml
/// apiVersion: tenancy.dev/v1alpha1
/// kind: RoleTemplate
/// metadata:
///   name: business-member
/// spec:
///   displayName: Business Member
///   context: business
///   rules:
///     - apiGroups: ["tenancy.dev"]
///       resources: ["businessroletemplatebindings"]
///       verbs: ["get", "list", "watch"]
///   roleTemplateNames: ["events-view"]
/// ```
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "tenancy.dev",
    version = "v1alpha1",
    kind = "RoleTemplate",
    printcolumn = r#"{"name":"Display Name","type":"string","jsonPath":".spec.displayName"}"#,
    printcolumn = r#"{"name":"External","type":"boolean","jsonPath":".spec.external"}"#,
    printcolumn = r#"{"name":"Locked","type":"boolean","jsonPath":".spec.locked"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct RoleTemplateSpec {
    /// Human-readable name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,

    /// Scope the template is meant for (e.g. "business")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,

    /// Access rules granted by this template
    #[serde(default)]
    pub rules: Vec<PolicyRule>,

    /// Locked templates cannot be newly assigned
    #[serde(default)]
    pub locked: bool,

    /// Rules live in a ClusterRole of the same name instead of `rules`
    #[serde(default)]
    pub external: bool,

    /// Names of included templates
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub role_template_names: Vec<String>,
}

impl RoleTemplateSpec {
    /// Create a spec with the given rules
    pub fn with_rules(rules: Vec<PolicyRule>) -> Self {
        Self {
            rules,
            ..Default::default()
        }
    }

    /// Add an included template name
    pub fn include(mut self, name: impl Into<String>) -> Self {
        self.role_template_names.push(name.into());
        self
    }
}
