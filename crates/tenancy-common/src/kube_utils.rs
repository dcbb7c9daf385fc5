//! Shared Kubernetes helpers for API error classification, owner
//! references, finalizers and stable hashing

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::{Resource, ResourceExt};
use serde_json::json;

/// Check whether a kube error is an API 404
pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 404)
}

/// Check whether a kube error is an API 409 (conflict or already exists)
pub fn is_conflict(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 409)
}

/// Check whether a kube error says the object already exists
pub fn is_already_exists(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 409 && ae.reason == "AlreadyExists")
}

/// Build a controller OwnerReference pointing at `owner`
///
/// Returns `None` if the owner has no UID yet (never persisted).
pub fn owner_reference<K>(owner: &K) -> Option<OwnerReference>
where
    K: Resource<DynamicType = ()>,
{
    let meta = owner.meta();
    Some(OwnerReference {
        api_version: K::api_version(&()).to_string(),
        kind: K::kind(&()).to_string(),
        name: meta.name.clone()?,
        uid: meta.uid.clone()?,
        controller: Some(true),
        block_owner_deletion: Some(true),
    })
}

/// Check whether `meta` carries an owner reference with the given UID
pub fn is_owned_by(meta: &ObjectMeta, owner_uid: &str) -> bool {
    meta.owner_references
        .as_deref()
        .unwrap_or_default()
        .iter()
        .any(|r| r.uid == owner_uid)
}

/// Label selector matching objects labelled `<key>=<value>`
pub fn label_selector(key: &str, value: &str) -> String {
    format!("{key}={value}")
}

/// Check whether the object has the given finalizer
pub fn has_finalizer<K: ResourceExt>(obj: &K, finalizer: &str) -> bool {
    obj.finalizers().iter().any(|f| f == finalizer)
}

/// Check whether the object is being deleted
pub fn is_deleting<K: ResourceExt>(obj: &K) -> bool {
    obj.meta().deletion_timestamp.is_some()
}

/// Merge patch body that sets the finalizer list to the current list plus
/// `finalizer`
///
/// The resourceVersion is included so concurrent edits fail with 409.
pub fn add_finalizer_patch<K: ResourceExt>(obj: &K, finalizer: &str) -> serde_json::Value {
    let mut finalizers = obj.finalizers().to_vec();
    if !finalizers.iter().any(|f| f == finalizer) {
        finalizers.push(finalizer.to_string());
    }
    json!({
        "metadata": {
            "finalizers": finalizers,
            "resourceVersion": obj.resource_version(),
        }
    })
}

/// Merge patch body that removes `finalizer` from the object
pub fn remove_finalizer_patch<K: ResourceExt>(obj: &K, finalizer: &str) -> serde_json::Value {
    let finalizers: Vec<&String> = obj.finalizers().iter().filter(|f| *f != finalizer).collect();
    json!({
        "metadata": {
            "finalizers": finalizers,
            "resourceVersion": obj.resource_version(),
        }
    })
}

/// Compute a deterministic hash of the input string, returning a 16-char
/// hex digest
///
/// Truncated SHA-256, stable across toolchains, safe to persist in labels.
pub fn deterministic_hash(input: &str) -> String {
    use aws_lc_rs::digest;
    let hash = digest::digest(&digest::SHA256, input.as_bytes());
    hash.as_ref()[..8]
        .iter()
        .fold(String::with_capacity(16), |mut s, b| {
            use std::fmt::Write;
            let _ = write!(s, "{:02x}", b);
            s
        })
}
