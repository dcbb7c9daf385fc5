//! Management-plane privileges
//!
//! Some tenancy resources (bindings, for one) live in a Business namespace
//! but are governed by the Business's role templates. For each template in
//! a binding's closure that grants verbs on such a resource, this module
//! keeps a namespaced Role named after the template carrying exactly those
//! verbs, and a RoleBinding `<binding>-<template>` binding the subject to it.
//!
//! The same routine serves every namespace a grant lands in; a
//! [`PrivilegeScope`] picks the namespace, resource allow-list and how owned
//! RoleBindings are tracked.

use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::api::rbac::v1::{PolicyRule as RbacPolicyRule, Role, RoleBinding, RoleRef};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::ObjectMeta;
use kube::ResourceExt;
use tracing::{debug, info, instrument};

use tenancy_common::crd::{PolicyRule, RoleTemplate};
use tenancy_common::kube_utils::label_selector;
use tenancy_common::Error;

use crate::client::RbacClient;
use crate::index::BindingIndex;
use crate::subject::{Subject, RBAC_API_GROUP};
use crate::templates::{gather_and_dedupe_roles, template_name};

/// Resources in a Business namespace governed by Business role templates
pub const BUSINESS_MANAGEMENT_PLANE_RESOURCES: &[&str] = &["businessroletemplatebindings"];

/// Label marker for grants a binding makes in its cluster namespace
pub const BINDING_IN_CLUSTER_OWNER: &str = "prtb-in-cluster-binding-owner";

const WILDCARD: &str = "*";

/// How RoleBindings created for an owner are tracked
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Ownership {
    /// RoleBindings carry an owner reference to the binding, found through
    /// the by-owner index
    OwnerReference,
    /// RoleBindings carry a `{ownerUID: marker}` label, found by listing
    Label(String),
}

/// Where a grant lands and which resources it covers
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PrivilegeScope {
    /// Target namespace
    pub namespace: String,
    /// Management-plane resources considered
    pub resources: Vec<String>,
    /// Ownership tracking mode
    pub ownership: Ownership,
}

impl PrivilegeScope {
    /// The Business's own namespace with the Business resource list
    pub fn business(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            resources: BUSINESS_MANAGEMENT_PLANE_RESOURCES
                .iter()
                .map(|r| r.to_string())
                .collect(),
            ownership: Ownership::OwnerReference,
        }
    }

    /// A shared cluster namespace with a configured resource list
    pub fn cluster(namespace: impl Into<String>, resources: Vec<String>) -> Self {
        Self {
            namespace: namespace.into(),
            resources,
            ownership: Ownership::Label(BINDING_IN_CLUSTER_OWNER.to_string()),
        }
    }
}

/// The binding on whose behalf grants are made
#[derive(Clone, Debug)]
pub struct GrantOwner {
    /// Owner name, prefix of every RoleBinding name
    pub name: String,
    /// Owner UID
    pub uid: String,
    /// Owner reference placed on RoleBindings in `OwnerReference` mode
    pub reference: OwnerReference,
}

/// Verbs `template` grants on `resource`, or an empty set
///
/// External templates are read from the ClusterRole of the same name; a
/// missing ClusterRole counts as no rules. Rules restricted by
/// `resourceNames` never count.
pub async fn check_for_management_plane_rules(
    client: &dyn RbacClient,
    template: &RoleTemplate,
    resource: &str,
) -> Result<BTreeSet<String>, Error> {
    let rules: Vec<PolicyRule> = if template.spec.external {
        client
            .get_cluster_role(template_name(template))
            .await?
            .and_then(|cr| cr.rules)
            .unwrap_or_default()
            .iter()
            .map(PolicyRule::from)
            .collect()
    } else {
        template.spec.rules.clone()
    };

    Ok(verbs_for_resource(&rules, resource))
}

/// Union of verbs of the name-unscoped rules targeting `resource`
pub fn verbs_for_resource(rules: &[PolicyRule], resource: &str) -> BTreeSet<String> {
    rules
        .iter()
        .filter(|r| r.resource_names.is_empty())
        .filter(|r| r.resources.iter().any(|res| res == resource || res == WILDCARD))
        .flat_map(|r| r.verbs.iter().cloned())
        .collect()
}

fn build_rule(resource: &str, verbs: &BTreeSet<String>) -> RbacPolicyRule {
    RbacPolicyRule {
        api_groups: Some(vec![WILDCARD.to_string()]),
        resources: Some(vec![resource.to_string()]),
        verbs: verbs.iter().cloned().collect(),
        resource_names: None,
        non_resource_urls: None,
    }
}

fn targets(rule: &RbacPolicyRule, resource: &str) -> bool {
    rule.resources.as_deref().unwrap_or_default().iter().any(|r| r == resource)
}

/// Make the rule for `resource` in `role` carry exactly `verbs`
///
/// Returns the updated role, or `None` if it already matches.
fn with_resource_verbs(role: &Role, resource: &str, verbs: &BTreeSet<String>) -> Option<Role> {
    let rules = role.rules.as_deref().unwrap_or_default();
    let current: BTreeSet<String> = rules
        .iter()
        .filter(|r| targets(r, resource))
        .flat_map(|r| r.verbs.iter().cloned())
        .collect();
    if current == *verbs {
        return None;
    }

    let mut updated = role.clone();
    let mut replaced = false;
    let mut new_rules = Vec::with_capacity(rules.len() + 1);
    for rule in rules {
        if !targets(rule, resource) {
            new_rules.push(rule.clone());
        } else if !replaced {
            new_rules.push(build_rule(resource, verbs));
            replaced = true;
        }
    }
    if !replaced {
        new_rules.push(build_rule(resource, verbs));
    }
    updated.rules = Some(new_rules);
    Some(updated)
}

/// Ensure the Role named after `template` in `namespace` grants exactly
/// `verbs` on `resource`
pub async fn reconcile_management_plane_role(
    client: &dyn RbacClient,
    namespace: &str,
    resource: &str,
    template: &str,
    verbs: &BTreeSet<String>,
) -> Result<(), Error> {
    let existing = match client.get_role(namespace, template).await? {
        Some(role) => role,
        None => {
            let role = Role {
                metadata: ObjectMeta {
                    name: Some(template.to_string()),
                    namespace: Some(namespace.to_string()),
                    ..Default::default()
                },
                rules: Some(vec![build_rule(resource, verbs)]),
            };
            match client.create_role(namespace, &role).await {
                Ok(()) => {
                    info!(role = %template, namespace = %namespace, "created management-plane role");
                    return Ok(());
                }
                Err(e) if e.is_already_exists() => match client.get_role(namespace, template).await? {
                    Some(role) => role,
                    None => return Ok(()),
                },
                Err(e) => return Err(e),
            }
        }
    };

    if let Some(updated) = with_resource_verbs(&existing, resource, verbs) {
        client.replace_role(namespace, &updated).await?;
        debug!(role = %template, namespace = %namespace, resource = %resource, "updated management-plane role verbs");
    }
    Ok(())
}

fn desired_binding(
    scope: &PrivilegeScope,
    owner: &GrantOwner,
    template: &str,
    subject: &Subject,
) -> RoleBinding {
    let (owner_references, labels) = match &scope.ownership {
        Ownership::OwnerReference => (Some(vec![owner.reference.clone()]), None),
        Ownership::Label(marker) => (None, Some([(owner.uid.clone(), marker.clone())].into())),
    };
    RoleBinding {
        metadata: ObjectMeta {
            name: Some(format!("{}-{}", owner.name, template)),
            namespace: Some(scope.namespace.clone()),
            owner_references,
            labels,
            ..Default::default()
        },
        role_ref: RoleRef {
            api_group: RBAC_API_GROUP.to_string(),
            kind: "Role".to_string(),
            name: template.to_string(),
        },
        subjects: Some(vec![subject.to_rbac()]),
    }
}

/// RoleBindings currently held by `owner_uid` in the scope, keyed by name
pub async fn current_bindings(
    client: &dyn RbacClient,
    index: &BindingIndex,
    scope: &PrivilegeScope,
    owner_uid: &str,
) -> Result<BTreeMap<String, RoleBinding>, Error> {
    let found: Vec<RoleBinding> = match &scope.ownership {
        Ownership::OwnerReference => index
            .role_bindings_by_owner(owner_uid)
            .into_iter()
            .filter(|rb| rb.namespace().as_deref() == Some(scope.namespace.as_str()))
            .map(|rb| (*rb).clone())
            .collect(),
        Ownership::Label(marker) => {
            client
                .list_role_bindings(&scope.namespace, &label_selector(owner_uid, marker))
                .await?
        }
    };
    Ok(found.into_iter().map(|rb| (rb.name_any(), rb)).collect())
}

fn grants_same(current: &RoleBinding, desired: &RoleBinding) -> bool {
    current.role_ref == desired.role_ref && current.subjects == desired.subjects
}

/// Create desired bindings missing from `current`, delete current ones not
/// desired; bindings present in both are left untouched unless their role
/// or subjects drifted, in which case they are recreated
pub async fn reconcile_desired_bindings(
    client: &dyn RbacClient,
    namespace: &str,
    current: BTreeMap<String, RoleBinding>,
    mut desired: BTreeMap<String, RoleBinding>,
) -> Result<(), Error> {
    for (name, rb) in &current {
        match desired.get(name) {
            Some(want) if grants_same(rb, want) => {
                desired.remove(name);
            }
            Some(_) => {
                // roleRef is immutable, so drifted bindings are recreated
                client.delete_role_binding(namespace, name).await?;
                debug!(binding = %name, namespace = %namespace, "recreating drifted management-plane binding");
            }
            None => {
                client.delete_role_binding(namespace, name).await?;
                debug!(binding = %name, namespace = %namespace, "deleted management-plane binding");
            }
        }
    }

    for (name, rb) in desired {
        match client.create_role_binding(namespace, &rb).await {
            Ok(()) => debug!(binding = %name, namespace = %namespace, "created management-plane binding"),
            Err(e) if e.is_already_exists() => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Grant `subject` the management-plane privileges of `template` and its
/// closure within `scope`
#[instrument(skip(client, index, scope, owner, subject), fields(namespace = %scope.namespace, owner = %owner.name))]
pub async fn grant_management_plane_privileges(
    client: &dyn RbacClient,
    index: &BindingIndex,
    template: &str,
    scope: &PrivilegeScope,
    subject: &Subject,
    owner: &GrantOwner,
) -> Result<(), Error> {
    let roles = gather_and_dedupe_roles(client, template).await?;

    let mut desired = BTreeMap::new();
    for role in &roles {
        let role_name = template_name(role);
        for resource in &scope.resources {
            let verbs = check_for_management_plane_rules(client, role, resource).await?;
            if verbs.is_empty() {
                continue;
            }
            reconcile_management_plane_role(client, &scope.namespace, resource, role_name, &verbs)
                .await?;
            let rb = desired_binding(scope, owner, role_name, subject);
            desired.entry(rb.name_any()).or_insert(rb);
        }
    }

    let current = current_bindings(client, index, scope, &owner.uid).await?;
    reconcile_desired_bindings(client, &scope.namespace, current, desired).await
}

/// Remove every management-plane RoleBinding `owner_uid` holds in `scope`
pub async fn revoke_management_plane_privileges(
    client: &dyn RbacClient,
    index: &BindingIndex,
    scope: &PrivilegeScope,
    owner_uid: &str,
) -> Result<(), Error> {
    let current = current_bindings(client, index, scope, owner_uid).await?;
    reconcile_desired_bindings(client, &scope.namespace, current, BTreeMap::new()).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeRbacClient;
    use k8s_openapi::api::rbac::v1::ClusterRole;
    use tenancy_common::crd::RoleTemplateSpec;

    fn verbs(vs: &[&str]) -> BTreeSet<String> {
        vs.iter().map(|v| v.to_string()).collect()
    }

    fn owner(name: &str, uid: &str) -> GrantOwner {
        GrantOwner {
            name: name.into(),
            uid: uid.into(),
            reference: OwnerReference {
                api_version: "tenancy.dev/v1alpha1".into(),
                kind: "BusinessRoleTemplateBinding".into(),
                name: name.into(),
                uid: uid.into(),
                controller: Some(true),
                block_owner_deletion: Some(true),
            },
        }
    }

    fn member_template() -> RoleTemplate {
        RoleTemplate::new(
            "business-member",
            RoleTemplateSpec::with_rules(vec![PolicyRule::for_groups(["tenancy.dev"])
                .resources(["businessroletemplatebindings"])
                .verbs(["get", "list", "watch"])]),
        )
    }

    #[test]
    fn rule_matching_requires_resource_or_wildcard_and_no_names() {
        let rules = vec![
            PolicyRule::for_groups(["*"]).resources(["businessroletemplatebindings"]).verbs(["get"]),
            PolicyRule::for_groups(["*"]).resources(["*"]).verbs(["list"]),
            PolicyRule {
                resource_names: vec!["only-this".into()],
                ..PolicyRule::for_groups(["*"])
                    .resources(["businessroletemplatebindings"])
                    .verbs(["delete"])
            },
            PolicyRule::for_groups(["*"]).resources(["nodes"]).verbs(["update"]),
        ];
        assert_eq!(
            verbs_for_resource(&rules, "businessroletemplatebindings"),
            verbs(&["get", "list"])
        );
    }

    #[test]
    fn verb_comparison_is_order_insensitive() {
        let role = Role {
            metadata: ObjectMeta::default(),
            rules: Some(vec![RbacPolicyRule {
                resources: Some(vec!["brtbs".into()]),
                verbs: vec!["watch".into(), "get".into(), "list".into()],
                ..Default::default()
            }]),
        };
        assert!(with_resource_verbs(&role, "brtbs", &verbs(&["get", "list", "watch"])).is_none());
    }

    #[test]
    fn mismatched_rule_is_replaced_and_others_kept() {
        let role = Role {
            metadata: ObjectMeta::default(),
            rules: Some(vec![
                RbacPolicyRule {
                    resources: Some(vec!["other".into()]),
                    verbs: vec!["get".into()],
                    ..Default::default()
                },
                RbacPolicyRule {
                    resources: Some(vec!["brtbs".into()]),
                    verbs: vec!["get".into()],
                    ..Default::default()
                },
            ]),
        };
        let updated = with_resource_verbs(&role, "brtbs", &verbs(&["get", "list"])).unwrap();
        let rules = updated.rules.unwrap();
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].resources.as_deref(), Some(&["other".to_string()][..]));
        assert_eq!(rules[1].verbs, vec!["get", "list"]);
    }

    #[test]
    fn missing_rule_is_appended() {
        let role = Role {
            metadata: ObjectMeta::default(),
            rules: None,
        };
        let updated = with_resource_verbs(&role, "brtbs", &verbs(&["get"])).unwrap();
        assert_eq!(updated.rules.unwrap().len(), 1);
    }

    /// Story: b1 grants u-2 business-member in acme. The namespace gets a
    /// business-member Role with exactly get/list/watch and a RoleBinding
    /// b1-business-member for u-2.
    #[tokio::test]
    async fn story_member_grant_materializes_role_and_binding() {
        let fake = FakeRbacClient::new();
        fake.put_role_template(member_template());
        let index = fake.index();
        let scope = PrivilegeScope::business("acme");

        grant_management_plane_privileges(
            &fake,
            &index,
            "business-member",
            &scope,
            &Subject::User("u-2".into()),
            &owner("b1", "uid-b1"),
        )
        .await
        .unwrap();

        let role = fake.role("acme", "business-member").unwrap();
        let rules = role.rules.unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(
            rules[0].resources.as_deref(),
            Some(&["businessroletemplatebindings".to_string()][..])
        );
        let granted: BTreeSet<String> = rules[0].verbs.iter().cloned().collect();
        assert_eq!(granted, verbs(&["get", "list", "watch"]));

        let rb = fake.role_binding("acme", "b1-business-member").unwrap();
        assert_eq!(rb.role_ref.name, "business-member");
        let subjects = rb.subjects.unwrap();
        assert_eq!(subjects.len(), 1);
        assert_eq!(subjects[0].name, "u-2");
        assert_eq!(rb.metadata.owner_references.unwrap()[0].uid, "uid-b1");
    }

    /// Story: verbs come from the whole closure, one role per template
    #[tokio::test]
    async fn story_included_templates_get_their_own_roles() {
        let fake = FakeRbacClient::new();
        fake.put_role_template(member_template());
        fake.put_role_template(RoleTemplate::new(
            "binding-admin",
            RoleTemplateSpec::with_rules(vec![PolicyRule::for_groups(["*"])
                .resources(["*"])
                .verbs(["create", "delete"])])
            .include("business-member"),
        ));
        let index = fake.index();

        grant_management_plane_privileges(
            &fake,
            &index,
            "binding-admin",
            &PrivilegeScope::business("acme"),
            &Subject::Group("admins".into()),
            &owner("b9", "uid-b9"),
        )
        .await
        .unwrap();

        assert!(fake.role("acme", "binding-admin").is_some());
        assert!(fake.role("acme", "business-member").is_some());
        assert!(fake.role_binding("acme", "b9-binding-admin").is_some());
        assert!(fake.role_binding("acme", "b9-business-member").is_some());
    }

    #[tokio::test]
    async fn repeated_grant_writes_nothing() {
        let fake = FakeRbacClient::new();
        fake.put_role_template(member_template());
        let index = fake.index();
        let scope = PrivilegeScope::business("acme");
        let subject = Subject::User("u-2".into());
        let owner = owner("b1", "uid-b1");

        grant_management_plane_privileges(&fake, &index, "business-member", &scope, &subject, &owner)
            .await
            .unwrap();
        let after_first = fake.writes();
        grant_management_plane_privileges(&fake, &index, "business-member", &scope, &subject, &owner)
            .await
            .unwrap();
        assert_eq!(fake.writes(), after_first);
    }

    #[tokio::test]
    async fn external_template_reads_cluster_role_and_tolerates_absence() {
        let fake = FakeRbacClient::new();
        let mut external = RoleTemplate::new("ext", RoleTemplateSpec::default());
        external.spec.external = true;

        assert!(check_for_management_plane_rules(&fake, &external, "businessroletemplatebindings")
            .await
            .unwrap()
            .is_empty());

        fake.put_cluster_role(ClusterRole {
            metadata: ObjectMeta {
                name: Some("ext".into()),
                ..Default::default()
            },
            rules: Some(vec![RbacPolicyRule {
                resources: Some(vec!["businessroletemplatebindings".into()]),
                verbs: vec!["get".into()],
                ..Default::default()
            }]),
            aggregation_rule: None,
        });
        assert_eq!(
            check_for_management_plane_rules(&fake, &external, "businessroletemplatebindings")
                .await
                .unwrap(),
            verbs(&["get"])
        );
    }

    /// Story: a template losing its rules for a resource drops the binding
    #[tokio::test]
    async fn story_undesired_bindings_are_deleted() {
        let fake = FakeRbacClient::new();
        fake.put_role_template(member_template());
        let index = fake.index();
        let scope = PrivilegeScope::business("acme");
        let subject = Subject::User("u-2".into());
        let owner = owner("b1", "uid-b1");

        grant_management_plane_privileges(&fake, &index, "business-member", &scope, &subject, &owner)
            .await
            .unwrap();
        fake.put_role_template(RoleTemplate::new("business-member", RoleTemplateSpec::default()));
        grant_management_plane_privileges(&fake, &index, "business-member", &scope, &subject, &owner)
            .await
            .unwrap();

        assert!(fake.role_binding("acme", "b1-business-member").is_none());
    }

    /// Story: the binding now names u-3 instead of u-2. The RoleBinding
    /// with the same name is recreated for u-3; an unchanged pass after
    /// that writes nothing.
    #[tokio::test]
    async fn story_changed_subject_recreates_binding() {
        let fake = FakeRbacClient::new();
        fake.put_role_template(member_template());
        let index = fake.index();
        let scope = PrivilegeScope::business("acme");
        let owner = owner("b1", "uid-b1");

        grant_management_plane_privileges(
            &fake,
            &index,
            "business-member",
            &scope,
            &Subject::User("u-2".into()),
            &owner,
        )
        .await
        .unwrap();
        let u3 = Subject::User("u-3".into());
        grant_management_plane_privileges(&fake, &index, "business-member", &scope, &u3, &owner)
            .await
            .unwrap();

        let rb = fake.role_binding("acme", "b1-business-member").unwrap();
        assert_eq!(rb.subjects.unwrap(), vec![u3.to_rbac()]);
        assert_eq!(fake.calls("delete_role_binding"), 1);

        let writes = fake.writes();
        grant_management_plane_privileges(&fake, &index, "business-member", &scope, &u3, &owner)
            .await
            .unwrap();
        assert_eq!(fake.writes(), writes);
    }

    #[tokio::test]
    async fn label_scope_tracks_bindings_by_label() {
        let fake = FakeRbacClient::new();
        fake.put_role_template(member_template());
        let index = fake.index();
        let scope = PrivilegeScope::cluster("local", vec!["businessroletemplatebindings".into()]);
        let owner = owner("b1", "uid-b1");

        grant_management_plane_privileges(
            &fake,
            &index,
            "business-member",
            &scope,
            &Subject::User("u-2".into()),
            &owner,
        )
        .await
        .unwrap();

        let rb = fake.role_binding("local", "b1-business-member").unwrap();
        assert!(rb.metadata.owner_references.is_none());
        assert_eq!(
            rb.labels().get("uid-b1").map(String::as_str),
            Some(BINDING_IN_CLUSTER_OWNER)
        );

        revoke_management_plane_privileges(&fake, &index, &scope, "uid-b1")
            .await
            .unwrap();
        assert!(fake.role_binding("local", "b1-business-member").is_none());
    }
}
