//! Identity store: maps external principals to local User records

use async_trait::async_trait;
use kube::api::{Api, ListParams, ObjectMeta, PostParams};
use kube::{Client, ResourceExt};
use tracing::info;

#[cfg(test)]
use mockall::automock;

use tenancy_common::crd::{User, UserSpec};
use tenancy_common::kube_utils::{deterministic_hash, label_selector};
use tenancy_common::{Error, PRINCIPAL_HASH_LABEL};

/// Create-or-get access to local users
#[cfg_attr(test, automock)]
#[async_trait]
pub trait IdentityStore: Send + Sync {
    /// Return the local user for `principal`, creating it on first sight
    async fn ensure_user(&self, principal: &str, display_name: &str) -> Result<User, Error>;
}

/// [`IdentityStore`] backed by the User custom resource
///
/// Users are found through a label holding a hash of the principal ID,
/// since principal IDs are not valid label values.
pub struct UserStore {
    client: Client,
}

impl UserStore {
    /// Create a store wrapping the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

/// Build the User record for a newly seen principal
pub fn new_user_for_principal(principal: &str, display_name: &str) -> User {
    let mut user = User::new(
        "",
        UserSpec {
            display_name: display_name.to_string(),
            username: None,
            principal_ids: vec![principal.to_string()],
        },
    );
    user.metadata = ObjectMeta {
        generate_name: Some("u-".to_string()),
        labels: Some(
            [(
                PRINCIPAL_HASH_LABEL.to_string(),
                deterministic_hash(principal),
            )]
            .into(),
        ),
        ..Default::default()
    };
    user
}

#[async_trait]
impl IdentityStore for UserStore {
    async fn ensure_user(&self, principal: &str, display_name: &str) -> Result<User, Error> {
        let api: Api<User> = Api::all(self.client.clone());
        let selector = label_selector(PRINCIPAL_HASH_LABEL, &deterministic_hash(principal));
        let existing = api.list(&ListParams::default().labels(&selector)).await?;

        if let Some(user) = existing
            .items
            .into_iter()
            .find(|u| u.spec.principal_ids.iter().any(|p| p == principal))
        {
            return Ok(user);
        }

        let created = api
            .create(&PostParams::default(), &new_user_for_principal(principal, display_name))
            .await?;
        info!(user = %created.name_any(), principal = %principal, "created user for principal");
        Ok(created)
    }
}
