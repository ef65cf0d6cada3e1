//! Object identity and metadata helpers shared by every component.

use kube::api::DynamicObject;
use kube::ResourceExt;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Label set on every concrete object the engine creates in a member cluster.
///
/// Member-cluster watches select on this label, and the engine refuses to
/// touch objects that lack it.
pub const MANAGED_LABEL: &str = "fedsync.io/managed";

/// Value of [`MANAGED_LABEL`].
pub const MANAGED_LABEL_VALUE: &str = "true";

/// Annotation recording the federated kind that owns a concrete object.
pub const FEDERATED_KIND_ANNOTATION: &str = "fedsync.io/federated-kind";

/// Finalizer placed on federated objects so member-cluster cleanup happens
/// before the object disappears from the federation plane.
pub const SYNC_FINALIZER: &str = "fedsync.io/sync-controller";

/// Label selector matching managed objects.
pub fn managed_selector() -> String {
    format!("{}={}", MANAGED_LABEL, MANAGED_LABEL_VALUE)
}

/// Identity of a federated object (and of its concrete counterparts).
///
/// This is the unit of work queued for reconciliation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    /// Namespace, empty for cluster-scoped objects.
    pub namespace: String,
    /// Object name.
    pub name: String,
}

impl ObjectKey {
    /// Create a key.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Key of an existing object.
    pub fn of(obj: &DynamicObject) -> Self {
        Self {
            namespace: obj.namespace().unwrap_or_default(),
            name: obj.name_any(),
        }
    }

    /// Namespace as an option, `None` for cluster-scoped keys.
    pub fn namespace(&self) -> Option<&str> {
        if self.namespace.is_empty() {
            None
        } else {
            Some(&self.namespace)
        }
    }

    /// Parse a `namespace/name` or `name` string.
    pub fn parse(s: &str) -> Self {
        match s.split_once('/') {
            Some((ns, name)) => Self::new(ns, name),
            None => Self::new("", s),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}/{}", self.namespace, self.name)
        }
    }
}

/// Spec generation of an object, 0 when the server never set one.
pub fn generation(obj: &DynamicObject) -> i64 {
    obj.metadata.generation.unwrap_or(0)
}

/// True when the object carries the managed marker and was propagated from
/// the given federated kind.
pub fn is_managed(obj: &DynamicObject, federated_kind: &str) -> bool {
    obj.labels().get(MANAGED_LABEL).map(String::as_str) == Some(MANAGED_LABEL_VALUE)
        && obj.annotations().get(FEDERATED_KIND_ANNOTATION).map(String::as_str)
            == Some(federated_kind)
}

/// True when deletion of the object has been requested.
pub fn is_being_deleted(obj: &DynamicObject) -> bool {
    obj.metadata.deletion_timestamp.is_some()
}

/// True when the object carries the given finalizer.
pub fn has_finalizer(obj: &DynamicObject, finalizer: &str) -> bool {
    obj.finalizers().iter().any(|f| f == finalizer)
}

/// Fields populated by the API server that must never be propagated from a
/// template into a member cluster.
const SERVER_METADATA_FIELDS: &[&str] = &[
    "uid",
    "resourceVersion",
    "creationTimestamp",
    "deletionTimestamp",
    "deletionGracePeriodSeconds",
    "generation",
    "managedFields",
    "ownerReferences",
    "selfLink",
    "finalizers",
];

/// Remove server-populated metadata and status from a manifest in place.
pub fn strip_server_fields(manifest: &mut serde_json::Value) {
    if let Some(obj) = manifest.as_object_mut() {
        obj.remove("status");
        if let Some(meta) = obj.get_mut("metadata").and_then(|m| m.as_object_mut()) {
            for field in SERVER_METADATA_FIELDS {
                meta.remove(*field);
            }
        }
    }
}
