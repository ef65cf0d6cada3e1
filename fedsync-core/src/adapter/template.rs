//! Generic adapter for federated kinds shaped as
//! `spec.template` / `spec.placement.clusterNames` / `spec.overrides`.

use super::{Adapter, EquivalencePolicy};
use crate::error::{SyncError, SyncResult};
use kube::api::DynamicObject;
use kube::core::{ApiResource, GroupVersionKind};
use serde_json::Value;
use std::collections::BTreeSet;

/// API group of the federated kinds.
pub const FEDERATION_GROUP: &str = "fedsync.io";

/// API version of the federated kinds.
pub const FEDERATION_VERSION: &str = "v1alpha1";

/// `ApiResource` of a federated kind in the fedsync group.
pub fn federated_resource(kind: &str) -> ApiResource {
    let plural = format!("{}s", kind.to_ascii_lowercase());
    ApiResource::from_gvk_with_plural(
        &GroupVersionKind::gvk(FEDERATION_GROUP, FEDERATION_VERSION, kind),
        &plural,
    )
}

/// Adapter reading the template, placement and overrides from the standard
/// federated spec layout.
#[derive(Debug, Clone)]
pub struct TemplateAdapter {
    federated: ApiResource,
    target: ApiResource,
    policy: EquivalencePolicy,
}

impl TemplateAdapter {
    /// Create an adapter for any federated/target kind pair.
    pub fn new(federated: ApiResource, target: ApiResource, policy: EquivalencePolicy) -> Self {
        Self {
            federated,
            target,
            policy,
        }
    }

    /// `FederatedJob` to `batch/v1 Job`.
    ///
    /// The job controller fills in the selector and pod template labels, so
    /// those are ignored and everything else compares as a subset. Updates
    /// carry the observed pod template labels over, since the pod template
    /// of a Job cannot change once created.
    pub fn job() -> Self {
        Self::new(
            federated_resource("FederatedJob"),
            ApiResource::from_gvk(&GroupVersionKind::gvk("batch", "v1", "Job")),
            EquivalencePolicy::new()
                .subset("/metadata/labels")
                .subset("/metadata/annotations")
                .subset("/spec")
                .ignore("/spec/selector")
                .ignore("/spec/manualSelector")
                .ignore("/spec/template/metadata/labels"),
        )
    }

    /// `FederatedConfigMap` to `v1 ConfigMap`. Data is compared exactly.
    pub fn config_map() -> Self {
        Self::new(
            federated_resource("FederatedConfigMap"),
            ApiResource::from_gvk(&GroupVersionKind::gvk("", "v1", "ConfigMap")),
            EquivalencePolicy::new()
                .exact("/data")
                .exact("/binaryData")
                .exact("/immutable")
                .exact("/metadata/labels")
                .exact("/metadata/annotations"),
        )
    }

    /// `FederatedDeployment` to `apps/v1 Deployment`.
    pub fn deployment() -> Self {
        Self::new(
            federated_resource("FederatedDeployment"),
            ApiResource::from_gvk(&GroupVersionKind::gvk("apps", "v1", "Deployment")),
            EquivalencePolicy::new()
                .exact("/metadata/labels")
                .exact("/metadata/annotations")
                .subset("/spec")
                .ignore("/metadata/annotations/deployment.kubernetes.io~1revision"),
        )
    }

    /// The equivalence policy in use.
    pub fn policy(&self) -> &EquivalencePolicy {
        &self.policy
    }
}

fn spec(obj: &DynamicObject) -> Option<&Value> {
    obj.data.get("spec").filter(|s| !s.is_null())
}

impl Adapter for TemplateAdapter {
    fn federated_resource(&self) -> &ApiResource {
        &self.federated
    }

    fn target_resource(&self) -> &ApiResource {
        &self.target
    }

    fn template(&self, obj: &DynamicObject) -> SyncResult<Value> {
        let template = spec(obj)
            .and_then(|s| s.get("template"))
            .filter(|t| !t.is_null())
            .ok_or_else(|| SyncError::InvalidTemplate("spec.template is missing".into()))?;

        let fields = template
            .as_object()
            .ok_or_else(|| SyncError::InvalidTemplate("spec.template must be an object".into()))?;

        if let Some(kind) = fields.get("kind") {
            if kind.as_str() != Some(self.target.kind.as_str()) {
                return Err(SyncError::InvalidTemplate(format!(
                    "template kind {} does not match {}",
                    kind, self.target.kind
                )));
            }
        }
        if let Some(api_version) = fields.get("apiVersion") {
            if api_version.as_str() != Some(self.target.api_version.as_str()) {
                return Err(SyncError::InvalidTemplate(format!(
                    "template apiVersion {} does not match {}",
                    api_version, self.target.api_version
                )));
            }
        }
        if let Some(meta) = fields.get("metadata") {
            if !meta.is_object() && !meta.is_null() {
                return Err(SyncError::InvalidTemplate(
                    "template metadata must be an object".into(),
                ));
            }
        }

        Ok(template.clone())
    }

    fn overrides(&self, obj: &DynamicObject, cluster: &str) -> SyncResult<Option<Value>> {
        let Some(entries) = spec(obj).and_then(|s| s.get("overrides")).filter(|o| !o.is_null())
        else {
            return Ok(None);
        };
        let entries = entries
            .as_array()
            .ok_or_else(|| SyncError::InvalidOverride("spec.overrides must be a list".into()))?;

        let mut seen = BTreeSet::new();
        let mut found = None;
        for (index, entry) in entries.iter().enumerate() {
            let name = entry
                .get("clusterName")
                .and_then(Value::as_str)
                .filter(|n| !n.is_empty())
                .ok_or_else(|| {
                    SyncError::InvalidOverride(format!(
                        "spec.overrides[{}].clusterName must be a non-empty string",
                        index
                    ))
                })?;
            if !seen.insert(name) {
                return Err(SyncError::InvalidOverride(format!(
                    "duplicate override for cluster '{}'",
                    name
                )));
            }
            let patch = match entry.get("patch") {
                None | Some(Value::Null) => continue,
                Some(patch @ Value::Object(_)) => patch,
                Some(_) => {
                    return Err(SyncError::InvalidOverride(format!(
                        "spec.overrides[{}].patch must be an object",
                        index
                    )));
                }
            };
            if name == cluster {
                found = Some(patch.clone());
            }
        }
        Ok(found)
    }

    fn placement(&self, obj: &DynamicObject) -> SyncResult<BTreeSet<String>> {
        let Some(names) = spec(obj)
            .and_then(|s| s.get("placement"))
            .filter(|p| !p.is_null())
            .map(|p| p.get("clusterNames").unwrap_or(&Value::Null))
        else {
            return Ok(BTreeSet::new());
        };

        if names.is_null() {
            return Ok(BTreeSet::new());
        }
        let names = names.as_array().ok_or_else(|| {
            SyncError::InvalidPlacement("spec.placement.clusterNames must be a list".into())
        })?;

        names
            .iter()
            .map(|n| {
                n.as_str()
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .ok_or_else(|| {
                        SyncError::InvalidPlacement(format!(
                            "cluster name {} must be a non-empty string",
                            n
                        ))
                    })
            })
            .collect()
    }

    fn equivalent(&self, desired: &Value, observed: &Value) -> bool {
        self.policy.equivalent(desired, observed)
    }

    fn retain(&self, desired: &mut Value, observed: &Value) {
        self.policy.retain_ignored(desired, observed);
    }
}
