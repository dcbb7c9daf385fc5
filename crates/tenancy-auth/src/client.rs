//! Object-store access for the RBAC reconcilers
//!
//! Every read and write the reconcilers perform goes through [`RbacClient`],
//! so tests can swap the API server for a mock or an in-memory fake.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, Role, RoleBinding};
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, Resource};
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use tenancy_common::crd::{
    BindingStatus, Business, BusinessRoleTemplateBinding, BusinessStatus, RoleTemplate,
};
use tenancy_common::kube_utils::{add_finalizer_patch, is_not_found, remove_finalizer_patch};
use tenancy_common::{Error, BINDING_FINALIZER, BUSINESS_FINALIZER, FIELD_MANAGER};

/// Store operations needed by the binding and business reconcilers
///
/// Deletes treat a missing object as success.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RbacClient: Send + Sync {
    // --- tenancy resources -------------------------------------------------

    /// Get a RoleTemplate by name
    async fn get_role_template(&self, name: &str) -> Result<Option<RoleTemplate>, Error>;

    /// Get a Business by namespace and name
    async fn get_business(&self, namespace: &str, name: &str)
        -> Result<Option<Business>, Error>;

    /// Replace the status of a Business
    async fn patch_business_status(
        &self,
        namespace: &str,
        name: &str,
        status: &BusinessStatus,
    ) -> Result<(), Error>;

    /// Add the cleanup finalizer to a Business
    async fn add_business_finalizer(&self, namespace: &str, name: &str) -> Result<(), Error>;

    /// Remove the cleanup finalizer from a Business
    async fn remove_business_finalizer(&self, namespace: &str, name: &str) -> Result<(), Error>;

    /// Get a binding by namespace and name
    async fn get_binding(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BusinessRoleTemplateBinding>, Error>;

    /// Create a binding
    async fn create_binding(&self, binding: &BusinessRoleTemplateBinding) -> Result<(), Error>;

    /// Record the resolved user name on a binding
    async fn set_binding_user_name(
        &self,
        namespace: &str,
        name: &str,
        user_name: &str,
    ) -> Result<(), Error>;

    /// Replace the status of a binding
    async fn patch_binding_status(
        &self,
        namespace: &str,
        name: &str,
        status: &BindingStatus,
    ) -> Result<(), Error>;

    /// Add the cleanup finalizer to a binding
    async fn add_binding_finalizer(&self, namespace: &str, name: &str) -> Result<(), Error>;

    /// Remove the cleanup finalizer from a binding
    async fn remove_binding_finalizer(&self, namespace: &str, name: &str) -> Result<(), Error>;

    // --- namespaces --------------------------------------------------------

    /// Get a namespace by name
    async fn get_namespace(&self, name: &str) -> Result<Option<Namespace>, Error>;

    /// Create a namespace
    async fn create_namespace(&self, namespace: &Namespace) -> Result<(), Error>;

    /// Delete a namespace
    async fn delete_namespace(&self, name: &str) -> Result<(), Error>;

    // --- cluster-scoped RBAC -----------------------------------------------

    /// Get a ClusterRole by name
    async fn get_cluster_role(&self, name: &str) -> Result<Option<ClusterRole>, Error>;

    /// List ClusterRoles matching a label selector
    async fn list_cluster_roles(&self, selector: &str) -> Result<Vec<ClusterRole>, Error>;

    /// Create a ClusterRole
    async fn create_cluster_role(&self, role: &ClusterRole) -> Result<(), Error>;

    /// Delete a ClusterRole
    async fn delete_cluster_role(&self, name: &str) -> Result<(), Error>;

    /// List ClusterRoleBindings matching a label selector
    async fn list_cluster_role_bindings(
        &self,
        selector: &str,
    ) -> Result<Vec<ClusterRoleBinding>, Error>;

    /// Create a ClusterRoleBinding (name may be generated)
    async fn create_cluster_role_binding(&self, binding: &ClusterRoleBinding)
        -> Result<(), Error>;

    /// Replace a ClusterRoleBinding, guarded by its resourceVersion
    async fn replace_cluster_role_binding(
        &self,
        binding: &ClusterRoleBinding,
    ) -> Result<(), Error>;

    /// Delete a ClusterRoleBinding
    async fn delete_cluster_role_binding(&self, name: &str) -> Result<(), Error>;

    // --- namespaced RBAC ---------------------------------------------------

    /// Get a Role by namespace and name
    async fn get_role(&self, namespace: &str, name: &str) -> Result<Option<Role>, Error>;

    /// Create a Role
    async fn create_role(&self, namespace: &str, role: &Role) -> Result<(), Error>;

    /// Replace a Role, guarded by its resourceVersion
    async fn replace_role(&self, namespace: &str, role: &Role) -> Result<(), Error>;

    /// List RoleBindings in a namespace matching a label selector
    async fn list_role_bindings(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<RoleBinding>, Error>;

    /// Create a RoleBinding
    async fn create_role_binding(&self, namespace: &str, binding: &RoleBinding)
        -> Result<(), Error>;

    /// Delete a RoleBinding
    async fn delete_role_binding(&self, namespace: &str, name: &str) -> Result<(), Error>;
}

/// [`RbacClient`] backed by the Kubernetes API
pub struct RbacClientImpl {
    client: Client,
}

impl RbacClientImpl {
    /// Create a new RbacClientImpl wrapping the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

/// Get an object, mapping 404 to `None`
async fn get_opt<K>(api: &Api<K>, name: &str) -> Result<Option<K>, Error>
where
    K: Clone + DeserializeOwned + std::fmt::Debug,
{
    match api.get(name).await {
        Ok(obj) => Ok(Some(obj)),
        Err(e) if is_not_found(&e) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Delete an object, treating 404 as success
async fn delete_ignore_missing<K>(api: &Api<K>, name: &str) -> Result<(), Error>
where
    K: Clone + DeserializeOwned + std::fmt::Debug,
{
    match api.delete(name, &DeleteParams::default()).await {
        Ok(_) => Ok(()),
        Err(e) if is_not_found(&e) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Apply a finalizer patch computed from the current object
async fn patch_finalizers<K, F>(api: &Api<K>, name: &str, build: F) -> Result<(), Error>
where
    K: Resource + Clone + DeserializeOwned + std::fmt::Debug,
    F: FnOnce(&K) -> serde_json::Value,
{
    let Some(obj) = get_opt(api, name).await? else {
        return Ok(());
    };
    api.patch(name, &PatchParams::default(), &Patch::Merge(&build(&obj)))
        .await?;
    Ok(())
}

fn selector(selector: &str) -> ListParams {
    ListParams::default().labels(selector)
}

#[async_trait]
impl RbacClient for RbacClientImpl {
    async fn get_role_template(&self, name: &str) -> Result<Option<RoleTemplate>, Error> {
        get_opt(&Api::<RoleTemplate>::all(self.client.clone()), name).await
    }

    async fn get_business(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Business>, Error> {
        get_opt(&Api::<Business>::namespaced(self.client.clone(), namespace), name).await
    }

    async fn patch_business_status(
        &self,
        namespace: &str,
        name: &str,
        status: &BusinessStatus,
    ) -> Result<(), Error> {
        let api: Api<Business> = Api::namespaced(self.client.clone(), namespace);
        let status_patch = json!({ "status": status });
        api.patch_status(
            name,
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&status_patch),
        )
        .await?;
        Ok(())
    }

    async fn add_business_finalizer(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let api: Api<Business> = Api::namespaced(self.client.clone(), namespace);
        patch_finalizers(&api, name, |b| add_finalizer_patch(b, BUSINESS_FINALIZER)).await
    }

    async fn remove_business_finalizer(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let api: Api<Business> = Api::namespaced(self.client.clone(), namespace);
        patch_finalizers(&api, name, |b| remove_finalizer_patch(b, BUSINESS_FINALIZER)).await
    }

    async fn get_binding(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BusinessRoleTemplateBinding>, Error> {
        let api: Api<BusinessRoleTemplateBinding> =
            Api::namespaced(self.client.clone(), namespace);
        get_opt(&api, name).await
    }

    async fn create_binding(&self, binding: &BusinessRoleTemplateBinding) -> Result<(), Error> {
        let namespace = binding.metadata.namespace.as_deref().ok_or_else(|| {
            Error::validation_for(
                binding.metadata.name.clone().unwrap_or_default(),
                "binding has no namespace",
            )
        })?;
        let api: Api<BusinessRoleTemplateBinding> =
            Api::namespaced(self.client.clone(), namespace);
        api.create(&PostParams::default(), binding).await?;
        Ok(())
    }

    async fn set_binding_user_name(
        &self,
        namespace: &str,
        name: &str,
        user_name: &str,
    ) -> Result<(), Error> {
        let api: Api<BusinessRoleTemplateBinding> =
            Api::namespaced(self.client.clone(), namespace);
        let patch = json!({ "spec": { "userName": user_name } });
        api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn patch_binding_status(
        &self,
        namespace: &str,
        name: &str,
        status: &BindingStatus,
    ) -> Result<(), Error> {
        let api: Api<BusinessRoleTemplateBinding> =
            Api::namespaced(self.client.clone(), namespace);
        let status_patch = json!({ "status": status });
        api.patch_status(
            name,
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&status_patch),
        )
        .await?;
        Ok(())
    }

    async fn add_binding_finalizer(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let api: Api<BusinessRoleTemplateBinding> =
            Api::namespaced(self.client.clone(), namespace);
        patch_finalizers(&api, name, |b| add_finalizer_patch(b, BINDING_FINALIZER)).await
    }

    async fn remove_binding_finalizer(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let api: Api<BusinessRoleTemplateBinding> =
            Api::namespaced(self.client.clone(), namespace);
        patch_finalizers(&api, name, |b| remove_finalizer_patch(b, BINDING_FINALIZER)).await
    }

    async fn get_namespace(&self, name: &str) -> Result<Option<Namespace>, Error> {
        get_opt(&Api::<Namespace>::all(self.client.clone()), name).await
    }

    async fn create_namespace(&self, namespace: &Namespace) -> Result<(), Error> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        api.create(&PostParams::default(), namespace).await?;
        Ok(())
    }

    async fn delete_namespace(&self, name: &str) -> Result<(), Error> {
        delete_ignore_missing(&Api::<Namespace>::all(self.client.clone()), name).await
    }

    async fn get_cluster_role(&self, name: &str) -> Result<Option<ClusterRole>, Error> {
        get_opt(&Api::<ClusterRole>::all(self.client.clone()), name).await
    }

    async fn list_cluster_roles(&self, label_selector: &str) -> Result<Vec<ClusterRole>, Error> {
        let api: Api<ClusterRole> = Api::all(self.client.clone());
        Ok(api.list(&selector(label_selector)).await?.items)
    }

    async fn create_cluster_role(&self, role: &ClusterRole) -> Result<(), Error> {
        let api: Api<ClusterRole> = Api::all(self.client.clone());
        api.create(&PostParams::default(), role).await?;
        debug!(role = ?role.metadata.name, "created ClusterRole");
        Ok(())
    }

    async fn delete_cluster_role(&self, name: &str) -> Result<(), Error> {
        delete_ignore_missing(&Api::<ClusterRole>::all(self.client.clone()), name).await
    }

    async fn list_cluster_role_bindings(
        &self,
        label_selector: &str,
    ) -> Result<Vec<ClusterRoleBinding>, Error> {
        let api: Api<ClusterRoleBinding> = Api::all(self.client.clone());
        Ok(api.list(&selector(label_selector)).await?.items)
    }

    async fn create_cluster_role_binding(
        &self,
        binding: &ClusterRoleBinding,
    ) -> Result<(), Error> {
        let api: Api<ClusterRoleBinding> = Api::all(self.client.clone());
        let created = api.create(&PostParams::default(), binding).await?;
        debug!(binding = ?created.metadata.name, "created ClusterRoleBinding");
        Ok(())
    }

    async fn replace_cluster_role_binding(
        &self,
        binding: &ClusterRoleBinding,
    ) -> Result<(), Error> {
        let name = binding.metadata.name.as_deref().ok_or_else(|| {
            Error::internal_with_context("rbac", "ClusterRoleBinding has no name")
        })?;
        let api: Api<ClusterRoleBinding> = Api::all(self.client.clone());
        api.replace(name, &PostParams::default(), binding).await?;
        Ok(())
    }

    async fn delete_cluster_role_binding(&self, name: &str) -> Result<(), Error> {
        delete_ignore_missing(&Api::<ClusterRoleBinding>::all(self.client.clone()), name).await
    }

    async fn get_role(&self, namespace: &str, name: &str) -> Result<Option<Role>, Error> {
        get_opt(&Api::<Role>::namespaced(self.client.clone(), namespace), name).await
    }

    async fn create_role(&self, namespace: &str, role: &Role) -> Result<(), Error> {
        let api: Api<Role> = Api::namespaced(self.client.clone(), namespace);
        api.create(&PostParams::default(), role).await?;
        Ok(())
    }

    async fn replace_role(&self, namespace: &str, role: &Role) -> Result<(), Error> {
        let name = role
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| Error::internal_with_context("rbac", "Role has no name"))?;
        let api: Api<Role> = Api::namespaced(self.client.clone(), namespace);
        api.replace(name, &PostParams::default(), role).await?;
        Ok(())
    }

    async fn list_role_bindings(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<RoleBinding>, Error> {
        let api: Api<RoleBinding> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.list(&selector(label_selector)).await?.items)
    }

    async fn create_role_binding(
        &self,
        namespace: &str,
        binding: &RoleBinding,
    ) -> Result<(), Error> {
        let api: Api<RoleBinding> = Api::namespaced(self.client.clone(), namespace);
        api.create(&PostParams::default(), binding).await?;
        Ok(())
    }

    async fn delete_role_binding(&self, namespace: &str, name: &str) -> Result<(), Error> {
        delete_ignore_missing(&Api::<RoleBinding>::namespaced(self.client.clone(), namespace), name)
            .await
    }
}
