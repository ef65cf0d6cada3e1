//! The API-server boundary.
//!
//! The engine reaches the federation plane and every member cluster only
//! through [`ResourceClient`]. It keeps no private durable store: every
//! decision is made from what these calls return.

use crate::error::{SyncError, SyncResult};
use crate::object::ObjectKey;
use futures::stream::BoxStream;
use kube::api::DynamicObject;
use kube::core::ApiResource;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Type alias for async client futures.
pub type ClientFuture<'a, T> = Pin<Box<dyn Future<Output = SyncResult<T>> + Send + 'a>>;

/// Live stream of watch events. Ends (or yields an error) when the watch
/// drops; the consumer must relist before watching again.
pub type WatchStream = BoxStream<'static, SyncResult<WatchEvent>>;

/// A single change observed through a watch.
#[derive(Debug, Clone)]
pub enum WatchEvent {
    /// Object was created.
    Added(DynamicObject),
    /// Object was updated.
    Modified(DynamicObject),
    /// Object was removed.
    Deleted(DynamicObject),
    /// Progress marker carrying the latest resource version.
    Bookmark(String),
}

impl WatchEvent {
    /// The object carried by the event, if any.
    pub fn object(&self) -> Option<&DynamicObject> {
        match self {
            WatchEvent::Added(obj) | WatchEvent::Modified(obj) | WatchEvent::Deleted(obj) => {
                Some(obj)
            }
            WatchEvent::Bookmark(_) => None,
        }
    }
}

/// Scope of a list or watch call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListOptions {
    /// Restrict to a namespace, `None` for all namespaces.
    pub namespace: Option<String>,
    /// Label selector in `key=value,key2` form.
    pub label_selector: Option<String>,
}

impl ListOptions {
    /// All objects in all namespaces.
    pub fn all() -> Self {
        Self::default()
    }

    /// Restrict to objects matching a label selector.
    pub fn labels(mut self, selector: impl Into<String>) -> Self {
        self.label_selector = Some(selector.into());
        self
    }

    /// Restrict to a namespace.
    pub fn within(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }
}

/// Result of a list call.
#[derive(Debug, Clone, Default)]
pub struct ObjectList {
    /// Objects, ordered by namespace then name.
    pub items: Vec<DynamicObject>,
    /// Resource version to resume watching from.
    pub resource_version: String,
}

/// Patch flavours accepted by [`ResourceClient::patch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchType {
    /// RFC 7386 JSON merge patch.
    Merge,
    /// RFC 6902 JSON patch.
    Json,
}

/// Access to one resource kind on one API server.
///
/// # Errors
///
/// Implementations map server failures onto [`SyncError`]: 404 to
/// `NotFound`, 409 to `Conflict`/`AlreadyExists`, network failures, timeouts,
/// 429 and 5xx to `Transient`, other 4xx to `Rejected`.
pub trait ResourceClient: Send + Sync {
    /// The resource kind this client serves.
    fn resource(&self) -> &ApiResource;

    /// Fetch one object.
    fn get(&self, key: &ObjectKey) -> ClientFuture<'_, DynamicObject>;

    /// List objects in scope.
    fn list(&self, options: &ListOptions) -> ClientFuture<'_, ObjectList>;

    /// Watch objects in scope, starting after `resource_version`.
    fn watch(&self, options: &ListOptions, resource_version: &str)
    -> ClientFuture<'_, WatchStream>;

    /// Create an object.
    fn create(&self, obj: &DynamicObject) -> ClientFuture<'_, DynamicObject>;

    /// Replace an object. A set `resourceVersion` is checked for conflicts.
    fn update(&self, obj: &DynamicObject) -> ClientFuture<'_, DynamicObject>;

    /// Replace the status subresource.
    fn update_status(&self, obj: &DynamicObject) -> ClientFuture<'_, DynamicObject>;

    /// Patch an object.
    fn patch(
        &self,
        key: &ObjectKey,
        patch_type: PatchType,
        data: &serde_json::Value,
    ) -> ClientFuture<'_, DynamicObject>;

    /// Delete an object.
    fn delete(&self, key: &ObjectKey) -> ClientFuture<'_, ()>;

    /// Fetch one object, mapping `NotFound` to `None`.
    fn get_opt(&self, key: &ObjectKey) -> ClientFuture<'_, Option<DynamicObject>> {
        let fut = self.get(key);
        Box::pin(async move {
            match fut.await {
                Ok(obj) => Ok(Some(obj)),
                Err(e) if e.is_not_found() => Ok(None),
                Err(e) => Err(e),
            }
        })
    }
}

/// A connection to one API server (the federation plane, the host cluster,
/// or a member cluster).
pub trait ClusterConnection: Send + Sync {
    /// Client for a resource kind on this server.
    fn resource_client(&self, resource: &ApiResource) -> Arc<dyn ResourceClient>;

    /// Cheap reachability probe (e.g. `GET /version`).
    fn probe(&self) -> ClientFuture<'_, ()>;
}

/// Check that a label map satisfies a `key=value,key2,!key3` selector.
///
/// Supports equality (`=`, `==`), inequality (`!=`), existence (`key`) and
/// non-existence (`!key`) terms.
pub fn selector_matches(
    labels: &std::collections::BTreeMap<String, String>,
    selector: &str,
) -> bool {
    selector
        .split(',')
        .map(str::trim)
        .filter(|term| !term.is_empty())
        .all(|term| {
            if let Some((k, v)) = term.split_once("!=") {
                labels.get(k.trim()).map(String::as_str) != Some(v.trim())
            } else if let Some((k, v)) = term.split_once("==").or_else(|| term.split_once('=')) {
                labels.get(k.trim()).map(String::as_str) == Some(v.trim())
            } else if let Some(k) = term.strip_prefix('!') {
                !labels.contains_key(k.trim())
            } else {
                labels.contains_key(term)
            }
        })
}

/// Convert an untyped manifest into a `DynamicObject`.
pub fn to_object(manifest: serde_json::Value) -> SyncResult<DynamicObject> {
    serde_json::from_value(manifest).map_err(SyncError::from)
}

/// Convert a `DynamicObject` into its full untyped manifest.
pub fn to_manifest(obj: &DynamicObject) -> SyncResult<serde_json::Value> {
    serde_json::to_value(obj).map_err(SyncError::from)
}
