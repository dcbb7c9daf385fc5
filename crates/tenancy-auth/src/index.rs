//! Secondary indexes over RBAC bindings
//!
//! The indexes are derived caches fed by watch streams. The watcher task is
//! the only writer; reconcilers only read. Two indexes are kept:
//!
//! - by owner: owner-reference UID -> RoleBindings carrying that owner
//! - by role and subject: `role + kind + name` -> bindings granting that pair
//!
//! Both are brought in line with the listing on every watch relist.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::StreamExt;
use k8s_openapi::api::rbac::v1::{ClusterRoleBinding, RoleBinding, Subject};
use kube::runtime::watcher::{self, Event};
use kube::runtime::WatchStreamExt;
use kube::{Api, Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::subject::rbac_subject_key;

/// Index of RoleBindings by owner-reference UID
pub const BY_OWNER: &str = "rb-by-owner";

/// Index of bindings by role name plus subject kind and name
pub const BY_ROLE_AND_SUBJECT: &str = "rb-by-role-and-subject";

/// `(namespace, name)` of an indexed object; namespace is empty for
/// cluster-scoped objects
pub type ObjectKey = (String, String);

/// Function computing the index values of an object
pub type IndexFn<K> = fn(&K) -> Vec<String>;

struct Index<K> {
    func: IndexFn<K>,
    buckets: DashMap<String, BTreeSet<ObjectKey>>,
}

/// A watch-fed object cache with named secondary indexes
pub struct Indexer<K> {
    objects: DashMap<ObjectKey, Arc<K>>,
    indexes: HashMap<&'static str, Index<K>>,
    synced: watch::Sender<bool>,
}

fn object_key<K: ResourceExt>(obj: &K) -> ObjectKey {
    (obj.namespace().unwrap_or_default(), obj.name_any())
}

fn unbucket<K>(index: &Index<K>, value: &str, key: &ObjectKey) {
    let now_empty = match index.buckets.get_mut(value) {
        Some(mut bucket) => {
            bucket.remove(key);
            bucket.is_empty()
        }
        None => false,
    };
    if now_empty {
        index.buckets.remove_if(value, |_, b| b.is_empty());
    }
}

impl<K: ResourceExt> Indexer<K> {
    /// Create an indexer with the given named index functions
    pub fn new(indexes: &[(&'static str, IndexFn<K>)]) -> Self {
        let (synced, _) = watch::channel(false);
        Self {
            objects: DashMap::new(),
            indexes: indexes
                .iter()
                .map(|(name, func)| {
                    (
                        *name,
                        Index {
                            func: *func,
                            buckets: DashMap::new(),
                        },
                    )
                })
                .collect(),
            synced,
        }
    }

    /// Insert or update an object
    ///
    /// The object is published and added to its new buckets before it
    /// leaves buckets it no longer belongs to, so a concurrent reader never
    /// misses an object that matches both before and after the update.
    pub fn apply(&self, obj: K) {
        let key = object_key(&obj);
        let obj = Arc::new(obj);
        let old = self.objects.insert(key.clone(), Arc::clone(&obj));

        for index in self.indexes.values() {
            let values: BTreeSet<String> = (index.func)(&obj).into_iter().collect();
            for value in &values {
                index.buckets.entry(value.clone()).or_default().insert(key.clone());
            }
            if let Some(old) = &old {
                for value in (index.func)(old) {
                    if !values.contains(&value) {
                        unbucket(index, &value, &key);
                    }
                }
            }
        }
    }

    /// Remove an object
    pub fn delete(&self, obj: &K) {
        self.remove_key(&object_key(obj));
    }

    fn remove_key(&self, key: &ObjectKey) {
        let Some(old) = self.objects.get(key).map(|o| Arc::clone(o.value())) else {
            return;
        };
        for index in self.indexes.values() {
            for value in (index.func)(&old) {
                unbucket(index, &value, key);
            }
        }
        self.objects.remove(key);
    }

    /// Bring the cache in line with a fresh listing and mark it synced
    ///
    /// Listed objects are upserted first and only then are objects missing
    /// from the listing pruned. The cache is never cleared, so readers see
    /// either the previous or the new state of each object during a relist.
    pub fn replace(&self, objs: Vec<K>) {
        let fresh: HashSet<ObjectKey> = objs.iter().map(object_key).collect();
        for obj in objs {
            self.apply(obj);
        }
        let stale: Vec<ObjectKey> = self
            .objects
            .iter()
            .filter(|entry| !fresh.contains(entry.key()))
            .map(|entry| entry.key().clone())
            .collect();
        for key in &stale {
            self.remove_key(key);
        }
        self.synced.send_replace(true);
    }

    /// Objects whose `index` values include `value`, ordered by key
    pub fn by_index(&self, index: &str, value: &str) -> Vec<Arc<K>> {
        let Some(index) = self.indexes.get(index) else {
            return Vec::new();
        };
        let keys: Vec<ObjectKey> = index
            .buckets
            .get(value)
            .map(|b| b.iter().cloned().collect())
            .unwrap_or_default();
        keys.iter()
            .filter_map(|k| self.objects.get(k).map(|o| Arc::clone(o.value())))
            .collect()
    }

    /// Whether the initial listing has completed
    pub fn is_synced(&self) -> bool {
        *self.synced.borrow()
    }

    /// Wait until the initial listing has completed
    pub async fn wait_synced(&self) {
        let mut rx = self.synced.subscribe();
        let _ = rx.wait_for(|synced| *synced).await;
    }
}

/// Read access to a binding's role reference and subjects
pub trait RbacBinding {
    /// Name of the referenced role
    fn role_name(&self) -> &str;
    /// Bound subjects
    fn subject_list(&self) -> &[Subject];
}

impl RbacBinding for RoleBinding {
    fn role_name(&self) -> &str {
        &self.role_ref.name
    }

    fn subject_list(&self) -> &[Subject] {
        self.subjects.as_deref().unwrap_or_default()
    }
}

impl RbacBinding for ClusterRoleBinding {
    fn role_name(&self) -> &str {
        &self.role_ref.name
    }

    fn subject_list(&self) -> &[Subject] {
        self.subjects.as_deref().unwrap_or_default()
    }
}

/// Owner-reference UIDs of an object
pub fn by_owner<K: Resource>(obj: &K) -> Vec<String> {
    obj.meta()
        .owner_references
        .as_deref()
        .unwrap_or_default()
        .iter()
        .map(|r| r.uid.clone())
        .collect()
}

/// One key per subject: role name + subject kind + subject name
pub fn by_role_and_subject<K: RbacBinding>(obj: &K) -> Vec<String> {
    obj.subject_list()
        .iter()
        .map(|s| rbac_subject_key(obj.role_name(), s))
        .collect()
}

/// Indexes consulted by the binding reconcilers
pub struct BindingIndex {
    /// RoleBindings, indexed by owner and by role+subject
    pub role_bindings: Indexer<RoleBinding>,
    /// ClusterRoleBindings, indexed by role+subject
    pub cluster_role_bindings: Indexer<ClusterRoleBinding>,
}

impl Default for BindingIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl BindingIndex {
    /// Create empty indexes
    pub fn new() -> Self {
        Self {
            role_bindings: Indexer::new(&[
                (BY_OWNER, by_owner::<RoleBinding> as IndexFn<RoleBinding>),
                (BY_ROLE_AND_SUBJECT, by_role_and_subject::<RoleBinding>),
            ]),
            cluster_role_bindings: Indexer::new(&[(
                BY_ROLE_AND_SUBJECT,
                by_role_and_subject::<ClusterRoleBinding> as IndexFn<ClusterRoleBinding>,
            )]),
        }
    }

    /// RoleBindings owned by `owner_uid`
    pub fn role_bindings_by_owner(&self, owner_uid: &str) -> Vec<Arc<RoleBinding>> {
        self.role_bindings.by_index(BY_OWNER, owner_uid)
    }

    /// ClusterRoleBindings granting the role+subject `key`
    pub fn cluster_role_bindings_by_role_and_subject(
        &self,
        key: &str,
    ) -> Vec<Arc<ClusterRoleBinding>> {
        self.cluster_role_bindings.by_index(BY_ROLE_AND_SUBJECT, key)
    }

    /// Wait until both caches finished their initial listing
    pub async fn wait_synced(&self) {
        self.role_bindings.wait_synced().await;
        self.cluster_role_bindings.wait_synced().await;
    }

    /// Start the watch tasks that feed the indexes
    pub fn spawn_watchers(self: &Arc<Self>, client: Client, timeout: Duration) -> Vec<JoinHandle<()>> {
        let config = watcher::Config::default().timeout(timeout.as_secs() as u32);

        let index = Arc::clone(self);
        let rb_api: Api<RoleBinding> = Api::all(client.clone());
        let rb_config = config.clone();
        let rb = tokio::spawn(async move {
            run_indexer(rb_api, rb_config, &index.role_bindings, "RoleBinding").await;
        });

        let index = Arc::clone(self);
        let crb_api: Api<ClusterRoleBinding> = Api::all(client);
        let crb = tokio::spawn(async move {
            run_indexer(crb_api, config, &index.cluster_role_bindings, "ClusterRoleBinding").await;
        });

        vec![rb, crb]
    }
}

/// Feed an indexer from a watch stream until the stream ends
pub async fn run_indexer<K>(api: Api<K>, config: watcher::Config, indexer: &Indexer<K>, kind: &str)
where
    K: Resource + Clone + DeserializeOwned + std::fmt::Debug + Send + 'static,
{
    info!(kind = %kind, "starting index watcher");
    let mut stream = watcher::watcher(api, config).default_backoff().boxed();
    let mut buffer: Vec<K> = Vec::new();

    while let Some(event) = stream.next().await {
        match event {
            Ok(event) => apply_event(indexer, &mut buffer, event, kind),
            Err(e) => warn!(kind = %kind, error = %e, "index watch error, backing off"),
        }
    }
    info!(kind = %kind, "index watcher stopped");
}

/// Apply one watch event to an indexer
///
/// Relist events are buffered and applied at `InitDone`; until then the
/// previous contents stay visible.
pub fn apply_event<K: ResourceExt>(
    indexer: &Indexer<K>,
    buffer: &mut Vec<K>,
    event: Event<K>,
    kind: &str,
) {
    match event {
        Event::Apply(obj) => indexer.apply(obj),
        Event::Delete(obj) => indexer.delete(&obj),
        Event::Init => buffer.clear(),
        Event::InitApply(obj) => buffer.push(obj),
        Event::InitDone => {
            let objs = std::mem::take(buffer);
            debug!(kind = %kind, count = objs.len(), "index relisted");
            indexer.replace(objs);
        }
    }
}
