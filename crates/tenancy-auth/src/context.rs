//! Controller context shared by the binding and business controllers

use std::sync::Arc;

use kube::Client;

use crate::client::{RbacClient, RbacClientImpl};
use crate::identity::{IdentityStore, UserStore};
use crate::index::BindingIndex;

/// Behaviour switches for the reconcilers
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AuthConfig {
    /// Requeue validation failures forever instead of waiting for a spec
    /// change
    pub retry_permanent_errors: bool,
    /// Management-plane resources granted in the cluster namespace. Empty
    /// disables that grant.
    pub cluster_namespace_resources: Vec<String>,
}

/// Controller context containing shared clients and the binding index
pub struct AuthContext {
    /// Object store access
    pub client: Arc<dyn RbacClient>,
    /// Principal to user resolution
    pub identity: Arc<dyn IdentityStore>,
    /// Secondary indexes over RoleBindings and ClusterRoleBindings
    pub index: Arc<BindingIndex>,
    /// Reconciler switches
    pub config: AuthConfig,
}

impl AuthContext {
    /// Create a context from its dependencies
    pub fn new(
        client: Arc<dyn RbacClient>,
        identity: Arc<dyn IdentityStore>,
        index: Arc<BindingIndex>,
        config: AuthConfig,
    ) -> Self {
        Self {
            client,
            identity,
            index,
            config,
        }
    }

    /// Create a context backed by the Kubernetes API
    ///
    /// The index is passed in so the caller can start its watchers before
    /// any controller runs.
    pub fn from_client(client: Client, index: Arc<BindingIndex>, config: AuthConfig) -> Self {
        Self::new(
            Arc::new(RbacClientImpl::new(client.clone())),
            Arc::new(UserStore::new(client)),
            index,
            config,
        )
    }

    /// Create a context for testing over an in-memory store
    #[cfg(test)]
    pub fn for_testing(
        fake: Arc<crate::testing::FakeRbacClient>,
        identity: Arc<dyn IdentityStore>,
    ) -> Self {
        let index = fake.index();
        Self::new(fake, identity, index, AuthConfig::default())
    }
}
