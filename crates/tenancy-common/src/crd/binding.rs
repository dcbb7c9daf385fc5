//! BusinessRoleTemplateBinding CRD: grants one subject a RoleTemplate
//! within one Business

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::Condition;
use crate::Error;

/// Separator of the composite `<cluster>:<business>` name
pub const BUSINESS_NAME_SEPARATOR: char = ':';

/// BusinessRoleTemplateBinding ties exactly one subject to one RoleTemplate
/// within one Business.
///
/// Example:
/// ```yaml
/// apiVersion: tenancy.dev/v1alpha1
/// kind: BusinessRoleTemplateBinding
/// metadata:
///   name: b1
///   namespace: acme
/// spec:
///   businessName: local:acme
///   roleTemplateName: business-member
///   userName: u-2
/// ```
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "tenancy.dev",
    version = "v1alpha1",
    kind = "BusinessRoleTemplateBinding",
    namespaced,
    status = "BindingStatus",
    printcolumn = r#"{"name":"Business","type":"string","jsonPath":".spec.businessName"}"#,
    printcolumn = r#"{"name":"Role","type":"string","jsonPath":".spec.roleTemplateName"}"#,
    printcolumn = r#"{"name":"User","type":"string","jsonPath":".spec.userName"}"#,
    printcolumn = r#"{"name":"Group","type":"string","jsonPath":".spec.groupName"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct BindingSpec {
    /// Composite `<cluster>:<business>` key of the target Business
    pub business_name: String,

    /// Name of the granted RoleTemplate
    pub role_template_name: String,

    /// Local user name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,

    /// External user principal, resolved into `userName`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_principal_name: Option<String>,

    /// Local group name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_name: Option<String>,

    /// External group principal
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_principal_name: Option<String>,
}

impl BindingSpec {
    /// Split `businessName` into its `(cluster, business)` parts
    pub fn business_ref(&self) -> Result<BusinessRef<'_>, Error> {
        BusinessRef::parse(&self.business_name)
    }
}

/// Parsed `<cluster>:<business>` reference
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BusinessRef<'a> {
    /// Cluster component, also the namespace the Business lives in
    pub cluster: &'a str,
    /// Business name, also the name of its backing namespace
    pub business: &'a str,
}

impl<'a> BusinessRef<'a> {
    /// Parse a composite business name
    pub fn parse(composite: &'a str) -> Result<Self, Error> {
        match composite.split_once(BUSINESS_NAME_SEPARATOR) {
            Some((cluster, business)) if !business.is_empty() => Ok(Self { cluster, business }),
            _ => Err(Error::validation_for(
                composite,
                "cannot determine cluster and business from businessName",
            )),
        }
    }
}

/// Binding status
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BindingStatus {
    /// Conditions (Ready)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Human-readable message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}
