//! In-memory [`RbacClient`] for scenario tests
//!
//! Stores objects in maps, counts every write, and feeds the binding index
//! synchronously the way the watchers would. Replaces honour
//! resourceVersion so lost-update races surface as 409s.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, Role, RoleBinding};
use kube::error::ErrorResponse;
use kube::{Resource, ResourceExt};

use tenancy_common::crd::{
    BindingStatus, Business, BusinessRoleTemplateBinding, BusinessStatus, RoleTemplate,
};
use tenancy_common::{Error, BINDING_FINALIZER, BUSINESS_FINALIZER};

use crate::client::RbacClient;
use crate::index::BindingIndex;

type Key = (String, String);

#[derive(Default)]
struct State {
    role_templates: BTreeMap<String, RoleTemplate>,
    businesses: BTreeMap<Key, Business>,
    bindings: BTreeMap<Key, BusinessRoleTemplateBinding>,
    namespaces: BTreeMap<String, Namespace>,
    cluster_roles: BTreeMap<String, ClusterRole>,
    cluster_role_bindings: BTreeMap<String, ClusterRoleBinding>,
    roles: BTreeMap<Key, Role>,
    role_bindings: BTreeMap<Key, RoleBinding>,
    calls: Vec<&'static str>,
    failing: HashMap<&'static str, u16>,
    next_id: u64,
}

impl State {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

/// In-memory object store
#[derive(Default)]
pub struct FakeRbacClient {
    state: Mutex<State>,
    index: Arc<BindingIndex>,
}

fn api_error(code: u16, reason: &str) -> Error {
    Error::from(kube::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message: format!("fake store: {reason}"),
        reason: reason.to_string(),
        code,
    }))
}

fn key(ns: &str, name: &str) -> Key {
    (ns.to_string(), name.to_string())
}

fn matches_selector<K: ResourceExt>(obj: &K, selector: &str) -> bool {
    selector.split(',').filter(|s| !s.is_empty()).all(|term| {
        match term.split_once('=') {
            Some((k, v)) => obj.labels().get(k).map(String::as_str) == Some(v),
            None => obj.labels().contains_key(term),
        }
    })
}

impl FakeRbacClient {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Index fed by this store
    pub fn index(&self) -> Arc<BindingIndex> {
        Arc::clone(&self.index)
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record a call; errors if the operation was set to fail
    fn record(&self, state: &mut State, op: &'static str) -> Result<(), Error> {
        state.calls.push(op);
        if let Some(code) = state.failing.get(op) {
            return Err(api_error(*code, "Injected"));
        }
        Ok(())
    }

    /// Stamp metadata for a stored object
    fn stamp<K: Resource>(state: &mut State, obj: &mut K) {
        let id = state.next_id();
        let meta = obj.meta_mut();
        meta.resource_version = Some(id.to_string());
        if meta.uid.is_none() {
            meta.uid = Some(format!("uid-{id}"));
        }
    }

    /// Make every future call of `op` fail with a 500
    pub fn fail(&self, op: &'static str) {
        self.fail_with(op, 500);
    }

    /// Make every future call of `op` fail with the given status code
    pub fn fail_with(&self, op: &'static str, code: u16) {
        self.lock().failing.insert(op, code);
    }

    /// Stop failing `op`
    pub fn heal(&self, op: &'static str) {
        self.lock().failing.remove(op);
    }

    /// Number of write calls made so far
    pub fn writes(&self) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|c| !c.starts_with("get_") && !c.starts_with("list_"))
            .count()
    }

    /// Number of calls of `op`
    pub fn calls(&self, op: &str) -> usize {
        self.lock().calls.iter().filter(|c| **c == op).count()
    }

    // --- seeding -----------------------------------------------------------

    /// Store a RoleTemplate, replacing any with the same name
    pub fn put_role_template(&self, template: RoleTemplate) {
        let mut state = self.lock();
        state.role_templates.insert(template.name_any(), template);
    }

    /// Store a Business
    pub fn put_business(&self, mut business: Business) {
        let mut state = self.lock();
        Self::stamp(&mut state, &mut business);
        let k = key(&business.namespace().unwrap_or_default(), &business.name_any());
        state.businesses.insert(k, business);
    }

    /// Store a binding
    pub fn put_binding(&self, mut binding: BusinessRoleTemplateBinding) {
        let mut state = self.lock();
        Self::stamp(&mut state, &mut binding);
        let k = key(&binding.namespace().unwrap_or_default(), &binding.name_any());
        state.bindings.insert(k, binding);
    }

    /// Drop a binding without going through the finalizer
    pub fn remove_binding(&self, ns: &str, name: &str) {
        self.lock().bindings.remove(&key(ns, name));
    }

    /// Store a namespace
    pub fn put_namespace(&self, ns: Namespace) {
        self.lock().namespaces.insert(ns.name_any(), ns);
    }

    /// Store a ClusterRole
    pub fn put_cluster_role(&self, role: ClusterRole) {
        self.lock().cluster_roles.insert(role.name_any(), role);
    }

    /// Store a ClusterRoleBinding and index it
    pub fn put_cluster_role_binding(&self, mut crb: ClusterRoleBinding) {
        let mut state = self.lock();
        Self::stamp(&mut state, &mut crb);
        self.index.cluster_role_bindings.apply(crb.clone());
        state.cluster_role_bindings.insert(crb.name_any(), crb);
    }

    // --- inspection --------------------------------------------------------

    /// Stored Business
    pub fn business(&self, ns: &str, name: &str) -> Option<Business> {
        self.lock().businesses.get(&key(ns, name)).cloned()
    }

    /// Stored binding
    pub fn binding(&self, ns: &str, name: &str) -> Option<BusinessRoleTemplateBinding> {
        self.lock().bindings.get(&key(ns, name)).cloned()
    }

    /// Stored namespace
    pub fn namespace(&self, name: &str) -> Option<Namespace> {
        self.lock().namespaces.get(name).cloned()
    }

    /// All stored ClusterRoles
    pub fn cluster_roles(&self) -> Vec<ClusterRole> {
        self.lock().cluster_roles.values().cloned().collect()
    }

    /// All stored ClusterRoleBindings
    pub fn cluster_role_bindings(&self) -> Vec<ClusterRoleBinding> {
        self.lock().cluster_role_bindings.values().cloned().collect()
    }

    /// Stored Role
    pub fn role(&self, ns: &str, name: &str) -> Option<Role> {
        self.lock().roles.get(&key(ns, name)).cloned()
    }

    /// Stored RoleBinding
    pub fn role_binding(&self, ns: &str, name: &str) -> Option<RoleBinding> {
        self.lock().role_bindings.get(&key(ns, name)).cloned()
    }

    /// All RoleBindings in a namespace
    pub fn role_bindings(&self, ns: &str) -> Vec<RoleBinding> {
        self.lock()
            .role_bindings
            .iter()
            .filter(|((n, _), _)| n == ns)
            .map(|(_, rb)| rb.clone())
            .collect()
    }
}

/// Fail with 409 Conflict if `incoming` carries a stale resourceVersion
fn check_version<K: Resource>(stored: &K, incoming: &K) -> Result<(), Error> {
    match (&incoming.meta().resource_version, &stored.meta().resource_version) {
        (Some(a), Some(b)) if a != b => Err(api_error(409, "Conflict")),
        _ => Ok(()),
    }
}

fn set_finalizer<K: Resource>(obj: &mut K, finalizer: &str, present: bool) {
    let finalizers = obj.meta_mut().finalizers.get_or_insert_with(Vec::new);
    finalizers.retain(|f| f != finalizer);
    if present {
        finalizers.push(finalizer.to_string());
    }
}

#[async_trait]
impl RbacClient for FakeRbacClient {
    async fn get_role_template(&self, name: &str) -> Result<Option<RoleTemplate>, Error> {
        let mut state = self.lock();
        self.record(&mut state, "get_role_template")?;
        Ok(state.role_templates.get(name).cloned())
    }

    async fn get_business(&self, namespace: &str, name: &str) -> Result<Option<Business>, Error> {
        let mut state = self.lock();
        self.record(&mut state, "get_business")?;
        Ok(state.businesses.get(&key(namespace, name)).cloned())
    }

    async fn patch_business_status(
        &self,
        namespace: &str,
        name: &str,
        status: &BusinessStatus,
    ) -> Result<(), Error> {
        let mut state = self.lock();
        self.record(&mut state, "patch_business_status")?;
        let id = state.next_id();
        let business = state
            .businesses
            .get_mut(&key(namespace, name))
            .ok_or_else(|| api_error(404, "NotFound"))?;
        business.status = Some(status.clone());
        business.metadata.resource_version = Some(id.to_string());
        Ok(())
    }

    async fn add_business_finalizer(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let mut state = self.lock();
        self.record(&mut state, "add_business_finalizer")?;
        if let Some(b) = state.businesses.get_mut(&key(namespace, name)) {
            set_finalizer(b, BUSINESS_FINALIZER, true);
        }
        Ok(())
    }

    async fn remove_business_finalizer(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let mut state = self.lock();
        self.record(&mut state, "remove_business_finalizer")?;
        if let Some(b) = state.businesses.get_mut(&key(namespace, name)) {
            set_finalizer(b, BUSINESS_FINALIZER, false);
        }
        Ok(())
    }

    async fn get_binding(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BusinessRoleTemplateBinding>, Error> {
        let mut state = self.lock();
        self.record(&mut state, "get_binding")?;
        Ok(state.bindings.get(&key(namespace, name)).cloned())
    }

    async fn create_binding(&self, binding: &BusinessRoleTemplateBinding) -> Result<(), Error> {
        let mut state = self.lock();
        self.record(&mut state, "create_binding")?;
        let k = key(&binding.namespace().unwrap_or_default(), &binding.name_any());
        if state.bindings.contains_key(&k) {
            return Err(api_error(409, "AlreadyExists"));
        }
        let mut stored = binding.clone();
        Self::stamp(&mut state, &mut stored);
        state.bindings.insert(k, stored);
        Ok(())
    }

    async fn set_binding_user_name(
        &self,
        namespace: &str,
        name: &str,
        user_name: &str,
    ) -> Result<(), Error> {
        let mut state = self.lock();
        self.record(&mut state, "set_binding_user_name")?;
        let binding = state
            .bindings
            .get_mut(&key(namespace, name))
            .ok_or_else(|| api_error(404, "NotFound"))?;
        binding.spec.user_name = Some(user_name.to_string());
        Ok(())
    }

    async fn patch_binding_status(
        &self,
        namespace: &str,
        name: &str,
        status: &BindingStatus,
    ) -> Result<(), Error> {
        let mut state = self.lock();
        self.record(&mut state, "patch_binding_status")?;
        let binding = state
            .bindings
            .get_mut(&key(namespace, name))
            .ok_or_else(|| api_error(404, "NotFound"))?;
        binding.status = Some(status.clone());
        Ok(())
    }

    async fn add_binding_finalizer(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let mut state = self.lock();
        self.record(&mut state, "add_binding_finalizer")?;
        if let Some(b) = state.bindings.get_mut(&key(namespace, name)) {
            set_finalizer(b, BINDING_FINALIZER, true);
        }
        Ok(())
    }

    async fn remove_binding_finalizer(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let mut state = self.lock();
        self.record(&mut state, "remove_binding_finalizer")?;
        if let Some(b) = state.bindings.get_mut(&key(namespace, name)) {
            set_finalizer(b, BINDING_FINALIZER, false);
        }
        Ok(())
    }

    async fn get_namespace(&self, name: &str) -> Result<Option<Namespace>, Error> {
        let mut state = self.lock();
        self.record(&mut state, "get_namespace")?;
        Ok(state.namespaces.get(name).cloned())
    }

    async fn create_namespace(&self, namespace: &Namespace) -> Result<(), Error> {
        let mut state = self.lock();
        self.record(&mut state, "create_namespace")?;
        let name = namespace.name_any();
        if state.namespaces.contains_key(&name) {
            return Err(api_error(409, "AlreadyExists"));
        }
        state.namespaces.insert(name, namespace.clone());
        Ok(())
    }

    async fn delete_namespace(&self, name: &str) -> Result<(), Error> {
        let mut state = self.lock();
        self.record(&mut state, "delete_namespace")?;
        state.namespaces.remove(name);
        Ok(())
    }

    async fn get_cluster_role(&self, name: &str) -> Result<Option<ClusterRole>, Error> {
        let mut state = self.lock();
        self.record(&mut state, "get_cluster_role")?;
        Ok(state.cluster_roles.get(name).cloned())
    }

    async fn list_cluster_roles(&self, selector: &str) -> Result<Vec<ClusterRole>, Error> {
        let mut state = self.lock();
        self.record(&mut state, "list_cluster_roles")?;
        Ok(state
            .cluster_roles
            .values()
            .filter(|r| matches_selector(*r, selector))
            .cloned()
            .collect())
    }

    async fn create_cluster_role(&self, role: &ClusterRole) -> Result<(), Error> {
        let mut state = self.lock();
        self.record(&mut state, "create_cluster_role")?;
        let name = role.name_any();
        if state.cluster_roles.contains_key(&name) {
            return Err(api_error(409, "AlreadyExists"));
        }
        let mut stored = role.clone();
        Self::stamp(&mut state, &mut stored);
        state.cluster_roles.insert(name, stored);
        Ok(())
    }

    async fn delete_cluster_role(&self, name: &str) -> Result<(), Error> {
        let mut state = self.lock();
        self.record(&mut state, "delete_cluster_role")?;
        state.cluster_roles.remove(name);
        Ok(())
    }

    async fn list_cluster_role_bindings(
        &self,
        selector: &str,
    ) -> Result<Vec<ClusterRoleBinding>, Error> {
        let mut state = self.lock();
        self.record(&mut state, "list_cluster_role_bindings")?;
        Ok(state
            .cluster_role_bindings
            .values()
            .filter(|b| matches_selector(*b, selector))
            .cloned()
            .collect())
    }

    async fn create_cluster_role_binding(&self, binding: &ClusterRoleBinding) -> Result<(), Error> {
        let mut state = self.lock();
        self.record(&mut state, "create_cluster_role_binding")?;
        let mut stored = binding.clone();
        if stored.metadata.name.is_none() {
            let prefix = stored.metadata.generate_name.clone().unwrap_or_default();
            let id = state.next_id();
            stored.metadata.name = Some(format!("{prefix}{id:05}"));
        }
        let name = stored.name_any();
        if state.cluster_role_bindings.contains_key(&name) {
            return Err(api_error(409, "AlreadyExists"));
        }
        Self::stamp(&mut state, &mut stored);
        self.index.cluster_role_bindings.apply(stored.clone());
        state.cluster_role_bindings.insert(name, stored);
        Ok(())
    }

    async fn replace_cluster_role_binding(&self, binding: &ClusterRoleBinding) -> Result<(), Error> {
        let mut state = self.lock();
        self.record(&mut state, "replace_cluster_role_binding")?;
        let name = binding.name_any();
        let stored = state
            .cluster_role_bindings
            .get(&name)
            .ok_or_else(|| api_error(404, "NotFound"))?;
        check_version(stored, binding)?;
        let mut updated = binding.clone();
        Self::stamp(&mut state, &mut updated);
        self.index.cluster_role_bindings.apply(updated.clone());
        state.cluster_role_bindings.insert(name, updated);
        Ok(())
    }

    async fn delete_cluster_role_binding(&self, name: &str) -> Result<(), Error> {
        let mut state = self.lock();
        self.record(&mut state, "delete_cluster_role_binding")?;
        if let Some(crb) = state.cluster_role_bindings.remove(name) {
            self.index.cluster_role_bindings.delete(&crb);
        }
        Ok(())
    }

    async fn get_role(&self, namespace: &str, name: &str) -> Result<Option<Role>, Error> {
        let mut state = self.lock();
        self.record(&mut state, "get_role")?;
        Ok(state.roles.get(&key(namespace, name)).cloned())
    }

    async fn create_role(&self, namespace: &str, role: &Role) -> Result<(), Error> {
        let mut state = self.lock();
        self.record(&mut state, "create_role")?;
        let k = key(namespace, &role.name_any());
        if state.roles.contains_key(&k) {
            return Err(api_error(409, "AlreadyExists"));
        }
        let mut stored = role.clone();
        stored.metadata.namespace = Some(namespace.to_string());
        Self::stamp(&mut state, &mut stored);
        state.roles.insert(k, stored);
        Ok(())
    }

    async fn replace_role(&self, namespace: &str, role: &Role) -> Result<(), Error> {
        let mut state = self.lock();
        self.record(&mut state, "replace_role")?;
        let k = key(namespace, &role.name_any());
        let stored = state.roles.get(&k).ok_or_else(|| api_error(404, "NotFound"))?;
        check_version(stored, role)?;
        let mut updated = role.clone();
        Self::stamp(&mut state, &mut updated);
        state.roles.insert(k, updated);
        Ok(())
    }

    async fn list_role_bindings(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<RoleBinding>, Error> {
        let mut state = self.lock();
        self.record(&mut state, "list_role_bindings")?;
        Ok(state
            .role_bindings
            .iter()
            .filter(|((ns, _), rb)| ns == namespace && matches_selector(*rb, selector))
            .map(|(_, rb)| rb.clone())
            .collect())
    }

    async fn create_role_binding(&self, namespace: &str, binding: &RoleBinding) -> Result<(), Error> {
        let mut state = self.lock();
        self.record(&mut state, "create_role_binding")?;
        let k = key(namespace, &binding.name_any());
        if state.role_bindings.contains_key(&k) {
            return Err(api_error(409, "AlreadyExists"));
        }
        let mut stored = binding.clone();
        stored.metadata.namespace = Some(namespace.to_string());
        Self::stamp(&mut state, &mut stored);
        self.index.role_bindings.apply(stored.clone());
        state.role_bindings.insert(k, stored);
        Ok(())
    }

    async fn delete_role_binding(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let mut state = self.lock();
        self.record(&mut state, "delete_role_binding")?;
        if let Some(rb) = state.role_bindings.remove(&key(namespace, name)) {
            self.index.role_bindings.delete(&rb);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::rbac::v1::RoleRef;
    use kube::api::ObjectMeta;

    fn crb(labels: &[(&str, &str)]) -> ClusterRoleBinding {
        ClusterRoleBinding {
            metadata: ObjectMeta {
                generate_name: Some("membership-".into()),
                labels: Some(labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()),
                ..Default::default()
            },
            role_ref: RoleRef {
                api_group: "rbac.authorization.k8s.io".into(),
                kind: "ClusterRole".into(),
                name: "r".into(),
            },
            subjects: None,
        }
    }

    #[tokio::test]
    async fn generate_name_and_selector_listing() {
        let fake = FakeRbacClient::new();
        fake.create_cluster_role_binding(&crb(&[("uid-1", "m")])).await.unwrap();
        fake.create_cluster_role_binding(&crb(&[("uid-2", "m")])).await.unwrap();

        let listed = fake.list_cluster_role_bindings("uid-1=m").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert!(listed[0].name_any().starts_with("membership-"));
        assert_eq!(fake.writes(), 2);
        assert_eq!(fake.cluster_role_bindings().len(), 2);
    }

    #[tokio::test]
    async fn stale_replace_conflicts() {
        let fake = FakeRbacClient::new();
        fake.create_cluster_role_binding(&crb(&[("uid-1", "m")])).await.unwrap();
        let mut first = fake.cluster_role_bindings().remove(0);
        let second = first.clone();

        first.labels_mut().insert("uid-2".into(), "m".into());
        fake.replace_cluster_role_binding(&first).await.unwrap();

        let err = fake.replace_cluster_role_binding(&second).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(matches!(err, Error::Kube { .. }));
    }

    #[tokio::test]
    async fn failing_op_returns_server_error() {
        let fake = FakeRbacClient::new();
        fake.fail("get_namespace");
        assert!(fake.get_namespace("acme").await.is_err());
        fake.heal("get_namespace");
        assert!(fake.get_namespace("acme").await.unwrap().is_none());
    }
}
