//! Membership grants: visibility of the Business object itself
//!
//! Any subject bound into a Business gets a ClusterRoleBinding to a
//! per-Business ClusterRole allowing `get` (or `*` for owners) on that one
//! Business. Bindings may be shared by several owners, each recorded as a
//! `{ownerUID: marker}` label; an object is deleted only once its last owner
//! label is gone.

use std::collections::BTreeMap;

use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, PolicyRule, RoleRef};
use kube::api::ObjectMeta;
use kube::ResourceExt;
use tracing::{debug, info};

use tenancy_common::crd::Business;
use tenancy_common::kube_utils::{label_selector, owner_reference};
use tenancy_common::{Error, MEMBERSHIP_ROLE_LABEL, TENANCY_API_GROUP};

use crate::client::RbacClient;
use crate::index::{BindingIndex, RbacBinding};
use crate::subject::{rbac_subject_key, Subject, RBAC_API_GROUP};

/// Label value marking a membership binding owner
pub const MEMBERSHIP_BINDING_OWNER: &str = "membership-binding-owner";

/// Resource name of Businesses in RBAC rules
pub const BUSINESS_RESOURCE: &str = "businesses";

/// Template that makes its subject an owner of the Business
pub const BUSINESS_OWNER_TEMPLATE: &str = "business-owner";

/// Name of the membership ClusterRole for a Business
pub fn membership_role_name(business: &str, owner: bool) -> String {
    let suffix = if owner { "businessowner" } else { "businessmember" };
    format!("{business}-{suffix}").to_lowercase()
}

/// Build the membership ClusterRole for `business`
pub fn membership_role(role_name: &str, business: &Business, make_owner: bool) -> ClusterRole {
    let verb = if make_owner { "*" } else { "get" };
    ClusterRole {
        metadata: ObjectMeta {
            name: Some(role_name.to_string()),
            labels: Some([(MEMBERSHIP_ROLE_LABEL.to_string(), "true".to_string())].into()),
            owner_references: owner_reference(business).map(|r| vec![r]),
            ..Default::default()
        },
        rules: Some(vec![PolicyRule {
            api_groups: Some(vec![TENANCY_API_GROUP.to_string()]),
            resources: Some(vec![BUSINESS_RESOURCE.to_string()]),
            resource_names: Some(vec![business.name_any()]),
            verbs: vec![verb.to_string()],
            non_resource_urls: None,
        }]),
        aggregation_rule: None,
    }
}

/// Create the membership ClusterRole once; an existing role is left as is
pub async fn create_membership_role(
    client: &dyn RbacClient,
    role_name: &str,
    business: &Business,
    make_owner: bool,
) -> Result<(), Error> {
    if client.get_cluster_role(role_name).await?.is_some() {
        return Ok(());
    }
    match client
        .create_cluster_role(&membership_role(role_name, business, make_owner))
        .await
    {
        Ok(()) => {
            info!(role = %role_name, business = %business.name_any(), "created membership role");
            Ok(())
        }
        Err(e) if e.is_already_exists() => Ok(()),
        Err(e) => Err(e),
    }
}

fn owner_labels(owner_uid: &str) -> BTreeMap<String, String> {
    [(owner_uid.to_string(), MEMBERSHIP_BINDING_OWNER.to_string())].into()
}

/// Ensure `subject` holds a membership binding to `role_name`, owned by
/// `owner_uid`
///
/// Reuses an identical binding created for another owner by adding this
/// owner's label. Every other binding this owner holds (another role, a
/// former subject, a duplicate) is released the way
/// [`reconcile_bindings_for_delete`] releases it.
pub async fn ensure_membership_binding(
    client: &dyn RbacClient,
    index: &BindingIndex,
    role_name: &str,
    owner_uid: &str,
    business: &Business,
    make_owner: bool,
    subject: &Subject,
) -> Result<(), Error> {
    create_membership_role(client, role_name, business, make_owner).await?;

    let key = subject.key(role_name);
    let owned = client
        .list_cluster_role_bindings(&label_selector(owner_uid, MEMBERSHIP_BINDING_OWNER))
        .await?;

    let mut matched = false;
    for crb in owned {
        let grants_key = matches!(
            crb.subject_list(),
            [only] if rbac_subject_key(crb.role_name(), only) == key
        );
        if grants_key && !matched {
            matched = true;
        } else {
            release_owner(client, crb, owner_uid).await?;
        }
    }
    if matched {
        return Ok(());
    }

    let shared = index.cluster_role_bindings_by_role_and_subject(&key);
    let Some(existing) = shared.first() else {
        let crb = ClusterRoleBinding {
            metadata: ObjectMeta {
                generate_name: Some("membership-".to_string()),
                labels: Some(owner_labels(owner_uid)),
                ..Default::default()
            },
            role_ref: RoleRef {
                api_group: RBAC_API_GROUP.to_string(),
                kind: "ClusterRole".to_string(),
                name: role_name.to_string(),
            },
            subjects: Some(vec![subject.to_rbac()]),
        };
        client.create_cluster_role_binding(&crb).await?;
        info!(role = %role_name, subject = %subject.name(), "created membership binding");
        return Ok(());
    };

    if existing.labels().contains_key(owner_uid) {
        return Ok(());
    }

    let mut updated = (**existing).clone();
    updated
        .labels_mut()
        .insert(owner_uid.to_string(), MEMBERSHIP_BINDING_OWNER.to_string());
    client.replace_cluster_role_binding(&updated).await?;
    debug!(binding = %updated.name_any(), owner = %owner_uid, "joined shared membership binding");
    Ok(())
}

/// Strip `owner_uid` from its membership bindings except those to
/// `role_to_keep`, deleting bindings left with no owner
///
/// Pass an empty `role_to_keep` to release every binding of the owner.
pub async fn reconcile_bindings_for_delete(
    client: &dyn RbacClient,
    role_to_keep: &str,
    owner_uid: &str,
) -> Result<(), Error> {
    let owned = client
        .list_cluster_role_bindings(&label_selector(owner_uid, MEMBERSHIP_BINDING_OWNER))
        .await?;

    for crb in owned {
        if crb.role_name() == role_to_keep {
            continue;
        }
        release_owner(client, crb, owner_uid).await?;
    }
    Ok(())
}

/// Drop `owner_uid`'s label from `crb`, deleting it once no owner is left
async fn release_owner(
    client: &dyn RbacClient,
    mut crb: ClusterRoleBinding,
    owner_uid: &str,
) -> Result<(), Error> {
    let labels = crb.labels_mut();
    if labels.get(owner_uid).map(String::as_str) == Some(MEMBERSHIP_BINDING_OWNER) {
        labels.remove(owner_uid);
    }

    if crb.labels().is_empty() {
        client.delete_cluster_role_binding(&crb.name_any()).await?;
        debug!(binding = %crb.name_any(), owner = %owner_uid, "deleted membership binding");
    } else {
        client.replace_cluster_role_binding(&crb).await?;
        debug!(binding = %crb.name_any(), owner = %owner_uid, "released shared membership binding");
    }
    Ok(())
}
