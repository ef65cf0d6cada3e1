//! Per-kind adapters.
//!
//! An [`Adapter`] bridges the kind-agnostic engine to one federated kind: it
//! extracts template, placement and overrides from the federated object,
//! decides when a concrete object already matches the desired one, and
//! renders the status document. The engine is written once against this
//! trait; concrete kinds plug in through the [`AdapterRegistry`].

mod equivalence;
mod template;

pub use equivalence::EquivalencePolicy;
pub use template::{federated_resource, TemplateAdapter, FEDERATION_GROUP, FEDERATION_VERSION};

use crate::error::{SyncError, SyncResult};
use crate::object::{
    strip_server_fields, ObjectKey, FEDERATED_KIND_ANNOTATION, MANAGED_LABEL, MANAGED_LABEL_VALUE,
};
use crate::status::FederatedStatus;
use kube::api::DynamicObject;
use kube::core::ApiResource;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Strategy for one federated kind.
pub trait Adapter: Send + Sync {
    /// The federated kind served on the federation plane.
    fn federated_resource(&self) -> &ApiResource;

    /// The concrete kind created in member clusters.
    fn target_resource(&self) -> &ApiResource;

    /// The base manifest to propagate.
    ///
    /// # Errors
    ///
    /// `InvalidTemplate` when the template is missing or malformed.
    fn template(&self, obj: &DynamicObject) -> SyncResult<Value>;

    /// The merge patch to apply atop the template for one cluster.
    ///
    /// # Errors
    ///
    /// `InvalidOverride` when any override entry is malformed.
    fn overrides(&self, obj: &DynamicObject, cluster: &str) -> SyncResult<Option<Value>>;

    /// Names of the clusters that should hold the concrete object.
    ///
    /// # Errors
    ///
    /// `InvalidPlacement` when the placement is malformed.
    fn placement(&self, obj: &DynamicObject) -> SyncResult<BTreeSet<String>>;

    /// Whether an observed concrete object already matches the desired one.
    fn equivalent(&self, desired: &Value, observed: &Value) -> bool;

    /// Copy fields owned by the member cluster from `observed` into `desired`
    /// before an update replaces the object.
    fn retain(&self, _desired: &mut Value, _observed: &Value) {}

    /// Render the status document written to the federated object.
    fn apply_status(&self, _obj: &DynamicObject, status: &FederatedStatus) -> SyncResult<Value> {
        serde_json::to_value(status).map_err(SyncError::from)
    }

    /// Kind name of the federated resource.
    fn kind(&self) -> &str {
        &self.federated_resource().kind
    }

    /// The fully materialized concrete object for one cluster: template,
    /// then override, then identity and the managed marker.
    fn desired(&self, obj: &DynamicObject, cluster: &str) -> SyncResult<Value> {
        let mut manifest = self.template(obj)?;
        if let Some(patch) = self.overrides(obj, cluster)? {
            json_patch::merge(&mut manifest, &patch);
        }
        stamp_identity(
            &mut manifest,
            self.target_resource(),
            &ObjectKey::of(obj),
            self.kind(),
        )?;
        Ok(manifest)
    }
}

/// Set identity, type and managed marker on a materialized manifest and
/// strip anything the API server owns.
fn stamp_identity(
    manifest: &mut Value,
    target: &ApiResource,
    key: &ObjectKey,
    federated_kind: &str,
) -> SyncResult<()> {
    strip_server_fields(manifest);
    let root = manifest
        .as_object_mut()
        .ok_or_else(|| SyncError::InvalidOverride("override turned the template into a non-object".into()))?;

    root.insert("apiVersion".into(), Value::String(target.api_version.clone()));
    root.insert("kind".into(), Value::String(target.kind.clone()));

    let metadata = root
        .entry("metadata")
        .or_insert_with(|| Value::Object(Default::default()));
    if !metadata.is_object() {
        *metadata = Value::Object(Default::default());
    }
    let Some(meta) = metadata.as_object_mut() else {
        return Err(SyncError::InvalidTemplate("metadata must be an object".into()));
    };

    meta.insert("name".into(), Value::String(key.name.clone()));
    match key.namespace() {
        Some(ns) => {
            meta.insert("namespace".into(), Value::String(ns.to_string()));
        }
        None => {
            meta.remove("namespace");
        }
    }
    meta.remove("generateName");

    insert_string(meta, "labels", MANAGED_LABEL, MANAGED_LABEL_VALUE);
    insert_string(meta, "annotations", FEDERATED_KIND_ANNOTATION, federated_kind);
    Ok(())
}

fn insert_string(meta: &mut serde_json::Map<String, Value>, field: &str, key: &str, value: &str) {
    let entry = meta
        .entry(field)
        .or_insert_with(|| Value::Object(Default::default()));
    if !entry.is_object() {
        *entry = Value::Object(Default::default());
    }
    if let Some(map) = entry.as_object_mut() {
        map.insert(key.to_string(), Value::String(value.to_string()));
    }
}

/// Constructor for an adapter.
pub type AdapterFactory = Arc<dyn Fn() -> Arc<dyn Adapter> + Send + Sync>;

/// Adapters keyed by federated kind name.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    factories: Arc<RwLock<BTreeMap<String, AdapterFactory>>>,
}

impl std::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}

impl AdapterRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in `FederatedJob`, `FederatedConfigMap` and
    /// `FederatedDeployment` adapters.
    pub fn with_builtin() -> Self {
        let registry = Self::new();
        registry.register("FederatedJob", Arc::new(|| Arc::new(TemplateAdapter::job())));
        registry.register(
            "FederatedConfigMap",
            Arc::new(|| Arc::new(TemplateAdapter::config_map())),
        );
        registry.register(
            "FederatedDeployment",
            Arc::new(|| Arc::new(TemplateAdapter::deployment())),
        );
        registry
    }

    /// Register a factory for a kind, replacing any previous one.
    pub fn register(&self, kind: impl Into<String>, factory: AdapterFactory) {
        self.factories.write().insert(kind.into(), factory);
    }

    /// Build the adapter for a kind.
    ///
    /// # Errors
    ///
    /// `UnknownKind` when no factory is registered for `kind`.
    pub fn get(&self, kind: &str) -> SyncResult<Arc<dyn Adapter>> {
        let factory = self
            .factories
            .read()
            .get(kind)
            .cloned()
            .ok_or_else(|| SyncError::UnknownKind(kind.to_string()))?;
        Ok(factory())
    }

    /// Registered kind names, sorted.
    pub fn kinds(&self) -> Vec<String> {
        self.factories.read().keys().cloned().collect()
    }
}
