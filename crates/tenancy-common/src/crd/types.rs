//! Shared types used across tenancy CRDs

use chrono::{DateTime, Utc};
use k8s_openapi::api::rbac::v1::PolicyRule as K8sPolicyRule;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A single access rule, mirroring `rbac.authorization.k8s.io/v1` PolicyRule
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PolicyRule {
    /// API groups the rule applies to ("*" for all)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub api_groups: Vec<String>,

    /// Resource kinds the rule applies to ("*" for all)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<String>,

    /// Restricts the rule to specific object names
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resource_names: Vec<String>,

    /// Allowed verbs ("*" for all)
    #[serde(default)]
    pub verbs: Vec<String>,

    /// Non-resource URLs (only meaningful in cluster-scoped roles)
    #[serde(
        default,
        rename = "nonResourceURLs",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub non_resource_urls: Vec<String>,
}

impl PolicyRule {
    /// Start a rule for the given API groups
    pub fn for_groups<I, S>(groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            api_groups: groups.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    /// Set the resources this rule targets
    pub fn resources<I, S>(mut self, resources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.resources = resources.into_iter().map(Into::into).collect();
        self
    }

    /// Set the verbs this rule grants
    pub fn verbs<I, S>(mut self, verbs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.verbs = verbs.into_iter().map(Into::into).collect();
        self
    }

    /// Set the non-resource URLs this rule targets
    pub fn non_resource_urls<I, S>(mut self, urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.non_resource_urls = urls.into_iter().map(Into::into).collect();
        self
    }
}

impl From<&K8sPolicyRule> for PolicyRule {
    fn from(rule: &K8sPolicyRule) -> Self {
        Self {
            api_groups: rule.api_groups.clone().unwrap_or_default(),
            resources: rule.resources.clone().unwrap_or_default(),
            resource_names: rule.resource_names.clone().unwrap_or_default(),
            verbs: rule.verbs.clone(),
            non_resource_urls: rule.non_resource_urls.clone().unwrap_or_default(),
        }
    }
}

/// Condition status following Kubernetes conventions
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Condition is true
    True,
    /// Condition is false
    False,
    /// Condition status is unknown
    #[default]
    Unknown,
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::True => write!(f, "True"),
            Self::False => write!(f, "False"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Kubernetes-style condition for status reporting
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct Condition {
    /// Type of condition (e.g., Ready, CreatorMadeOwner)
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition (True, False, Unknown)
    pub status: ConditionStatus,

    /// Machine-readable reason for the condition
    #[serde(default)]
    pub reason: String,

    /// Human-readable message
    #[serde(default)]
    pub message: String,

    /// Last time the condition transitioned
    #[serde(rename = "lastTransitionTime")]
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    /// Create a new condition with the current timestamp
    pub fn new(
        type_: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: Utc::now(),
        }
    }
}

/// Lookup and update helpers over a condition list
pub trait ConditionsExt {
    /// Find the condition of the given type
    fn find_condition(&self, type_: &str) -> Option<&Condition>;

    /// True if the condition exists with status True
    fn is_condition_true(&self, type_: &str) -> bool {
        self.find_condition(type_)
            .map(|c| c.status == ConditionStatus::True)
            .unwrap_or(false)
    }

    /// Insert or update a condition.
    ///
    /// The transition time only moves when the status changes, so setting
    /// an identical condition twice leaves the list equal.
    fn set_condition(
        &mut self,
        type_: &str,
        status: ConditionStatus,
        reason: &str,
        message: &str,
    );
}

impl ConditionsExt for Vec<Condition> {
    fn find_condition(&self, type_: &str) -> Option<&Condition> {
        self.iter().find(|c| c.type_ == type_)
    }

    fn set_condition(
        &mut self,
        type_: &str,
        status: ConditionStatus,
        reason: &str,
        message: &str,
    ) {
        match self.iter_mut().find(|c| c.type_ == type_) {
            Some(existing) => {
                if existing.status != status {
                    existing.last_transition_time = Utc::now();
                    existing.status = status;
                }
                existing.reason = reason.to_string();
                existing.message = message.to_string();
            }
            None => self.push(Condition::new(type_, status, reason, message)),
        }
    }
}
