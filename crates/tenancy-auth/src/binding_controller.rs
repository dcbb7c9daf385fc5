//! BusinessRoleTemplateBinding controller
//!
//! Each pass resolves the binding's subject, grants Business membership and
//! then the management-plane privileges of the binding's template closure.
//! A finalizer keeps the binding around until its grants are released.
//!
//! Terminal failures (malformed subject, bad business name, template cycle)
//! are written to the `Ready` condition and the binding waits for a spec
//! change, unless the operator runs with `retry_permanent_errors`.

use std::sync::Arc;
use std::time::Duration;

use kube::runtime::controller::Action;
use kube::ResourceExt;
use tracing::{debug, error, info, instrument, warn};

use tenancy_common::crd::{
    BindingStatus, BusinessRoleTemplateBinding, BusinessRef, ConditionStatus, ConditionsExt,
};
use tenancy_common::kube_utils::{has_finalizer, is_deleting, owner_reference};
use tenancy_common::{Error, BINDING_FINALIZER, PRINCIPAL_DISPLAY_NAME_ANNOTATION};

use crate::context::AuthContext;
use crate::management_plane::{
    grant_management_plane_privileges, revoke_management_plane_privileges, GrantOwner,
    PrivilegeScope,
};
use crate::membership::{
    ensure_membership_binding, membership_role_name, reconcile_bindings_for_delete,
    BUSINESS_OWNER_TEMPLATE,
};
use crate::subject::{resolve_subject, Subject};

/// Condition reporting whether the binding's grants are in place
pub const CONDITION_READY: &str = "Ready";

/// Periodic resync so template edits reach existing bindings
const RESYNC_INTERVAL: Duration = Duration::from_secs(300);

/// Requeue delay after a failed pass
const ERROR_REQUEUE: Duration = Duration::from_secs(5);

/// Reconcile a BusinessRoleTemplateBinding
#[instrument(
    skip(binding, ctx),
    fields(binding = %binding.name_any(), namespace = %binding.namespace().unwrap_or_default())
)]
pub async fn reconcile(
    binding: Arc<BusinessRoleTemplateBinding>,
    ctx: Arc<AuthContext>,
) -> Result<Action, Error> {
    let outcome = if is_deleting(binding.as_ref()) {
        remove(&binding, &ctx).await
    } else {
        apply(&binding, &ctx).await
    };

    match outcome {
        Ok(action) => Ok(action),
        Err(e) if e.is_retryable() || ctx.config.retry_permanent_errors => Err(e),
        Err(e) => {
            warn!(error = %e, "binding cannot converge until its spec changes");
            update_ready(&binding, &ctx, ConditionStatus::False, e.reason(), &e.to_string())
                .await?;
            Ok(Action::await_change())
        }
    }
}

/// Error policy for the binding controller
pub fn error_policy(
    binding: Arc<BusinessRoleTemplateBinding>,
    error: &Error,
    _ctx: Arc<AuthContext>,
) -> Action {
    error!(
        ?error,
        binding = %binding.name_any(),
        namespace = %binding.namespace().unwrap_or_default(),
        "binding reconciliation failed"
    );
    Action::requeue(ERROR_REQUEUE)
}

async fn apply(binding: &BusinessRoleTemplateBinding, ctx: &AuthContext) -> Result<Action, Error> {
    let name = binding.name_any();
    let namespace = binding.namespace().unwrap_or_default();

    if !has_finalizer(binding, BINDING_FINALIZER) {
        ctx.client.add_binding_finalizer(&namespace, &name).await?;
    }

    let mut spec = binding.spec.clone();
    let display_name = binding
        .annotations()
        .get(PRINCIPAL_DISPLAY_NAME_ANNOTATION)
        .cloned()
        .unwrap_or_default();
    if let Some(user) =
        resolve_subject(&mut spec, &name, &display_name, ctx.identity.as_ref()).await?
    {
        ctx.client.set_binding_user_name(&namespace, &name, &user).await?;
    }
    let subject = Subject::from_binding(&spec, &name)?;

    let business_ref = spec.business_ref()?;
    let business = ctx
        .client
        .get_business(business_ref.cluster, business_ref.business)
        .await?
        .ok_or_else(|| Error::not_found("Business", &spec.business_name))?;

    let owner = grant_owner(binding)?;
    let make_owner = spec.role_template_name == BUSINESS_OWNER_TEMPLATE;
    let role_name = membership_role_name(business_ref.business, make_owner);
    ensure_membership_binding(
        ctx.client.as_ref(),
        &ctx.index,
        &role_name,
        &owner.uid,
        &business,
        make_owner,
        &subject,
    )
    .await?;

    for scope in scopes(&namespace, &business_ref, ctx) {
        grant_management_plane_privileges(
            ctx.client.as_ref(),
            &ctx.index,
            &spec.role_template_name,
            &scope,
            &subject,
            &owner,
        )
        .await?;
    }

    update_ready(binding, ctx, ConditionStatus::True, "Reconciled", "").await?;
    debug!(subject = %subject.name(), role = %spec.role_template_name, "binding reconciled");
    Ok(Action::requeue(RESYNC_INTERVAL))
}

async fn remove(binding: &BusinessRoleTemplateBinding, ctx: &AuthContext) -> Result<Action, Error> {
    if !has_finalizer(binding, BINDING_FINALIZER) {
        return Ok(Action::await_change());
    }
    let name = binding.name_any();
    let namespace = binding.namespace().unwrap_or_default();

    let business_ref = binding.spec.business_ref()?;
    let owner_uid = binding.uid().ok_or_else(|| missing_uid(&name))?;

    reconcile_bindings_for_delete(ctx.client.as_ref(), "", &owner_uid).await?;
    for scope in scopes(&namespace, &business_ref, ctx) {
        revoke_management_plane_privileges(ctx.client.as_ref(), &ctx.index, &scope, &owner_uid)
            .await?;
    }

    ctx.client.remove_binding_finalizer(&namespace, &name).await?;
    info!("released binding grants");
    Ok(Action::await_change())
}

/// Namespaces a binding grants management-plane privileges in
fn scopes(namespace: &str, business_ref: &BusinessRef<'_>, ctx: &AuthContext) -> Vec<PrivilegeScope> {
    let mut scopes = vec![PrivilegeScope::business(namespace)];
    if !ctx.config.cluster_namespace_resources.is_empty() {
        scopes.push(PrivilegeScope::cluster(
            business_ref.cluster,
            ctx.config.cluster_namespace_resources.clone(),
        ));
    }
    scopes
}

fn missing_uid(name: &str) -> Error {
    Error::internal_with_context("binding", format!("binding {name} has no uid"))
}

fn grant_owner(binding: &BusinessRoleTemplateBinding) -> Result<GrantOwner, Error> {
    let name = binding.name_any();
    let uid = binding.uid().ok_or_else(|| missing_uid(&name))?;
    let reference = owner_reference(binding).ok_or_else(|| missing_uid(&name))?;
    Ok(GrantOwner {
        name,
        uid,
        reference,
    })
}

/// Set the Ready condition, writing only when the status changes
async fn update_ready(
    binding: &BusinessRoleTemplateBinding,
    ctx: &AuthContext,
    status: ConditionStatus,
    reason: &str,
    message: &str,
) -> Result<(), Error> {
    let mut updated: BindingStatus = binding.status.clone().unwrap_or_default();
    updated
        .conditions
        .set_condition(CONDITION_READY, status, reason, message);
    updated.message = (!message.is_empty()).then(|| message.to_string());

    if binding.status.as_ref() == Some(&updated) {
        return Ok(());
    }
    ctx.client
        .patch_binding_status(
            &binding.namespace().unwrap_or_default(),
            &binding.name_any(),
            &updated,
        )
        .await
}
