//! Subject resolution for bindings
//!
//! A binding names its subject through four optional fields. [`Subject`]
//! collapses them into one validated value, and [`resolve_subject`] fills
//! `userName` from an external principal on first sight.

use k8s_openapi::api::rbac::v1::Subject as RbacSubject;
use tracing::info;

use tenancy_common::crd::BindingSpec;
use tenancy_common::Error;

use crate::identity::IdentityStore;

/// API group of RBAC User and Group subjects
pub const RBAC_API_GROUP: &str = "rbac.authorization.k8s.io";

/// The identity a binding grants access to
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Subject {
    /// Local user, by user name
    User(String),
    /// Local group, by name
    Group(String),
    /// External group, by principal
    GroupPrincipal(String),
}

impl Subject {
    /// Build the subject from a binding spec
    ///
    /// Exactly one of `userName`, `groupName` and `groupPrincipalName` must
    /// be set. `binding` names the object in the error.
    pub fn from_binding(spec: &BindingSpec, binding: &str) -> Result<Self, Error> {
        let set = |v: &Option<String>| v.as_deref().filter(|s| !s.is_empty()).map(str::to_string);
        let candidates = [
            set(&spec.user_name).map(Subject::User),
            set(&spec.group_principal_name).map(Subject::GroupPrincipal),
            set(&spec.group_name).map(Subject::Group),
        ];

        let mut found = candidates.into_iter().flatten();
        match (found.next(), found.next()) {
            (Some(subject), None) => Ok(subject),
            (Some(_), Some(_)) => Err(Error::validation_for(
                binding,
                "binding has more than one subject field set",
            )),
            (None, _) => Err(Error::validation_for(
                binding,
                "binding doesn't have any subject fields set",
            )),
        }
    }

    /// RBAC subject kind
    pub fn kind(&self) -> &'static str {
        match self {
            Subject::User(_) => "User",
            Subject::Group(_) | Subject::GroupPrincipal(_) => "Group",
        }
    }

    /// Subject name as written into RBAC objects
    pub fn name(&self) -> &str {
        match self {
            Subject::User(n) | Subject::Group(n) | Subject::GroupPrincipal(n) => n,
        }
    }

    /// Convert into an RBAC subject
    pub fn to_rbac(&self) -> RbacSubject {
        RbacSubject {
            api_group: Some(RBAC_API_GROUP.to_string()),
            kind: self.kind().to_string(),
            name: self.name().to_string(),
            namespace: None,
        }
    }

    /// Index key for this subject bound to `role`
    pub fn key(&self, role: &str) -> String {
        role_subject_key(role, self.kind(), self.name())
    }
}

/// Key of the by-role-and-subject index
pub fn role_subject_key(role: &str, kind: &str, name: &str) -> String {
    format!("{role}{kind}{name}")
}

/// Key for an existing RBAC subject bound to `role`
pub fn rbac_subject_key(role: &str, subject: &RbacSubject) -> String {
    role_subject_key(role, &subject.kind, &subject.name)
}

fn is_set(v: &Option<String>) -> bool {
    v.as_deref().is_some_and(|s| !s.is_empty())
}

/// Whether any of the concrete subject fields is set
pub fn has_subject(spec: &BindingSpec) -> bool {
    is_set(&spec.user_name) || is_set(&spec.group_name) || is_set(&spec.group_principal_name)
}

/// Fill `userName` from `userPrincipalName` if no subject is set yet
///
/// Returns the resolved user name when the spec changed and must be
/// persisted, `None` when it was already resolved.
pub async fn resolve_subject(
    spec: &mut BindingSpec,
    binding: &str,
    display_name: &str,
    identity: &dyn IdentityStore,
) -> Result<Option<String>, Error> {
    if has_subject(spec) {
        return Ok(None);
    }

    let Some(principal) = spec.user_principal_name.clone().filter(|p| !p.is_empty()) else {
        return Err(Error::validation_for(binding, "binding has no subject"));
    };

    let user = identity.ensure_user(&principal, display_name).await?;
    let user_name = user.metadata.name.clone().ok_or_else(|| {
        Error::internal_with_context("identity", format!("user for {principal} has no name"))
    })?;

    info!(binding = %binding, principal = %principal, user = %user_name, "resolved principal to user");
    spec.user_name = Some(user_name.clone());
    Ok(Some(user_name))
}
