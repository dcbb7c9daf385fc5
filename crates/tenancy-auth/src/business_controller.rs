//! Business controllers
//!
//! Two controllers watch Businesses. [`reconcile`] keeps the backing
//! namespace and the creator's owner binding in place, recording each step
//! as a status condition. [`reconcile_removal`] holds a finalizer and, once
//! the Business is deleted, removes its namespace and membership roles.

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::Namespace;
use kube::api::ObjectMeta;
use kube::runtime::controller::Action;
use kube::ResourceExt;
use tracing::{debug, error, info, instrument, warn};

use tenancy_common::crd::{
    BindingSpec, Business, BusinessRoleTemplateBinding, BusinessStatus, ConditionStatus,
    ConditionsExt, BUSINESS_NAME_SEPARATOR, CONDITION_BACKING_NAMESPACE_CREATED,
    CONDITION_CREATOR_MADE_OWNER,
};
use tenancy_common::kube_utils::{has_finalizer, is_deleting, is_owned_by, label_selector};
use tenancy_common::{
    Error, BUSINESS_FINALIZER, CREATOR_ID_ANNOTATION, MEMBERSHIP_ROLE_LABEL,
    SYSTEM_NAMESPACE_ANNOTATION,
};

use crate::context::AuthContext;
use crate::membership::BUSINESS_OWNER_TEMPLATE;

/// Name of the binding that makes the creator an owner
pub const CREATOR_BINDING_NAME: &str = "creator";

/// Condition reason when the backing namespace cannot be created
pub const NAMESPACE_CREATION_FAILURE: &str = "NamespaceCreationFailure";

const NAMESPACE_TERMINATING: &str = "Terminating";

/// Periodic resync so a deleted namespace is recreated
const RESYNC_INTERVAL: Duration = Duration::from_secs(300);

/// Requeue delay after a failed pass
const ERROR_REQUEUE: Duration = Duration::from_secs(5);

/// Sync a Business: backing namespace, then creator ownership
///
/// Deleted Businesses are left to [`reconcile_removal`].
#[instrument(skip(business, ctx), fields(business = %business.name_any()))]
pub async fn reconcile(business: Arc<Business>, ctx: Arc<AuthContext>) -> Result<Action, Error> {
    if is_deleting(business.as_ref()) {
        return Ok(Action::await_change());
    }

    let mut status = business.status.clone().unwrap_or_default();
    let outcome = sync_steps(&business, &ctx, &mut status).await;

    if business.status.as_ref() != Some(&status) {
        ctx.client
            .patch_business_status(
                &business.namespace().unwrap_or_default(),
                &business.name_any(),
                &status,
            )
            .await?;
    }

    outcome?;
    Ok(Action::requeue(RESYNC_INTERVAL))
}

async fn sync_steps(
    business: &Business,
    ctx: &AuthContext,
    status: &mut BusinessStatus,
) -> Result<(), Error> {
    match ensure_namespace(business, ctx).await {
        Ok(()) => status.conditions.set_condition(
            CONDITION_BACKING_NAMESPACE_CREATED,
            ConditionStatus::True,
            "",
            "",
        ),
        Err(e) => {
            status.conditions.set_condition(
                CONDITION_BACKING_NAMESPACE_CREATED,
                ConditionStatus::False,
                NAMESPACE_CREATION_FAILURE,
                &format!("failed to create namespace for Business {}: {e}", business.name_any()),
            );
            return Err(e);
        }
    }

    if status.conditions.is_condition_true(CONDITION_CREATOR_MADE_OWNER) {
        return Ok(());
    }
    match ensure_creator_binding(business, ctx).await {
        Ok(()) => {
            status.conditions.set_condition(
                CONDITION_CREATOR_MADE_OWNER,
                ConditionStatus::True,
                "",
                "",
            );
            Ok(())
        }
        Err(e) => {
            status.conditions.set_condition(
                CONDITION_CREATOR_MADE_OWNER,
                ConditionStatus::False,
                e.reason(),
                &e.to_string(),
            );
            Err(e)
        }
    }
}

/// Namespace backing `business`, marked as operator-managed
pub fn backing_namespace(business: &Business) -> Namespace {
    Namespace {
        metadata: ObjectMeta {
            name: Some(business.name_any()),
            annotations: Some([(SYSTEM_NAMESPACE_ANNOTATION.to_string(), "true".to_string())].into()),
            ..Default::default()
        },
        ..Default::default()
    }
}

async fn ensure_namespace(business: &Business, ctx: &AuthContext) -> Result<(), Error> {
    let name = business.name_any();
    if ctx.client.get_namespace(&name).await?.is_some() {
        return Ok(());
    }
    match ctx.client.create_namespace(&backing_namespace(business)).await {
        Ok(()) => {
            info!(namespace = %name, "created backing namespace");
            Ok(())
        }
        Err(e) if e.is_already_exists() => Ok(()),
        Err(e) => Err(e),
    }
}

/// Bind the creator to `business-owner`, once
///
/// A Business without a creator annotation has nobody to promote; that
/// counts as done.
async fn ensure_creator_binding(business: &Business, ctx: &AuthContext) -> Result<(), Error> {
    let name = business.name_any();
    let Some(creator) = business.annotations().get(CREATOR_ID_ANNOTATION) else {
        warn!(business = %name, "Business has no creator annotation, cannot add creator as owner");
        return Ok(());
    };

    if ctx.client.get_binding(&name, CREATOR_BINDING_NAME).await?.is_some() {
        return Ok(());
    }

    let mut binding = BusinessRoleTemplateBinding::new(
        CREATOR_BINDING_NAME,
        BindingSpec {
            business_name: format!(
                "{}{BUSINESS_NAME_SEPARATOR}{name}",
                business.namespace().unwrap_or_default()
            ),
            role_template_name: BUSINESS_OWNER_TEMPLATE.to_string(),
            user_name: Some(creator.clone()),
            ..Default::default()
        },
    );
    binding.metadata.namespace = Some(name.clone());

    match ctx.client.create_binding(&binding).await {
        Ok(()) => {
            info!(business = %name, creator = %creator, "made creator an owner");
            Ok(())
        }
        Err(e) if e.is_already_exists() => Ok(()),
        Err(e) => Err(e),
    }
}

/// Hold the cleanup finalizer; on deletion remove the namespace and the
/// membership roles owned by the Business
#[instrument(skip(business, ctx), fields(business = %business.name_any()))]
pub async fn reconcile_removal(
    business: Arc<Business>,
    ctx: Arc<AuthContext>,
) -> Result<Action, Error> {
    let name = business.name_any();
    let namespace = business.namespace().unwrap_or_default();

    if !is_deleting(business.as_ref()) {
        if !has_finalizer(business.as_ref(), BUSINESS_FINALIZER) {
            ctx.client.add_business_finalizer(&namespace, &name).await?;
        }
        return Ok(Action::await_change());
    }
    if !has_finalizer(business.as_ref(), BUSINESS_FINALIZER) {
        return Ok(Action::await_change());
    }

    delete_backing_namespace(&name, &ctx).await?;

    if let Some(uid) = business.uid() {
        let roles = ctx
            .client
            .list_cluster_roles(&label_selector(MEMBERSHIP_ROLE_LABEL, "true"))
            .await?;
        for role in roles.iter().filter(|r| is_owned_by(&r.metadata, &uid)) {
            ctx.client.delete_cluster_role(&role.name_any()).await?;
            debug!(role = %role.name_any(), "deleted membership role");
        }
    }

    ctx.client.remove_business_finalizer(&namespace, &name).await?;
    info!("released Business resources");
    Ok(Action::await_change())
}

async fn delete_backing_namespace(name: &str, ctx: &AuthContext) -> Result<(), Error> {
    let Some(ns) = ctx.client.get_namespace(name).await? else {
        return Ok(());
    };
    let phase = ns.status.as_ref().and_then(|s| s.phase.as_deref());
    if phase == Some(NAMESPACE_TERMINATING) {
        debug!(namespace = %name, "namespace already terminating");
        return Ok(());
    }
    ctx.client.delete_namespace(name).await?;
    info!(namespace = %name, "deleted backing namespace");
    Ok(())
}

/// Error policy for both Business controllers
pub fn error_policy(business: Arc<Business>, error: &Error, _ctx: Arc<AuthContext>) -> Action {
    error!(
        ?error,
        business = %business.name_any(),
        "Business reconciliation failed"
    );
    Action::requeue(ERROR_REQUEUE)
}
