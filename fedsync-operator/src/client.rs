//! `kube`-backed cluster access.
//!
//! [`KubeConnection`] implements the engine's API boundary over a
//! `kube::Client`, serving any kind through `Api<DynamicObject>`.

use crate::error::{OperatorError, OperatorResult};
use fedsync_core::client::{
    ClientFuture, ClusterConnection, ListOptions, ObjectList, PatchType, ResourceClient,
    WatchEvent, WatchStream,
};
use fedsync_core::{ObjectKey, SyncError, SyncResult};
use futures::StreamExt;
use kube::api::{
    Api, DeleteParams, DynamicObject, ListParams, Patch, PatchParams, PostParams,
    WatchEvent as KubeWatchEvent, WatchParams,
};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::core::{ApiResource, ErrorResponse};
use kube::{Client, Config};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Server-side watch timeout, in seconds.
const WATCH_TIMEOUT_SECS: u32 = 290;

/// Buffered watch events per stream.
const WATCH_BUFFER: usize = 64;

/// Timeout of a reachability probe.
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Map a `kube` error onto the engine's error taxonomy.
///
/// `kind` and `key` only label `NotFound` and `AlreadyExists` errors.
pub fn map_kube_error(err: kube::Error, kind: &str, key: &ObjectKey) -> SyncError {
    match err {
        kube::Error::Api(response) => map_error_response(response, kind, key),
        kube::Error::SerdeError(e) => SyncError::Serialization(e.to_string()),
        other => SyncError::Transient(other.to_string()),
    }
}

/// Map a status response from the API server.
pub fn map_error_response(response: ErrorResponse, kind: &str, key: &ObjectKey) -> SyncError {
    match response.code {
        404 => SyncError::not_found(kind, &key.namespace, &key.name),
        409 if response.reason == "AlreadyExists" => {
            SyncError::already_exists(kind, &key.namespace, &key.name)
        }
        409 => SyncError::Conflict(response.message),
        410 => SyncError::Transient(format!("resource version expired: {}", response.message)),
        429 | 500..=599 => SyncError::Transient(response.message),
        code => SyncError::Rejected {
            code,
            message: response.message,
        },
    }
}

/// [`ResourceClient`] for one kind on one API server.
#[derive(Clone)]
pub struct KubeResourceClient {
    client: Client,
    resource: ApiResource,
}

impl KubeResourceClient {
    /// Create a client for `resource`.
    pub fn new(client: Client, resource: ApiResource) -> Self {
        Self { client, resource }
    }

    fn api(&self, namespace: Option<&str>) -> Api<DynamicObject> {
        match namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &self.resource),
            None => Api::all_with(self.client.clone(), &self.resource),
        }
    }

    fn error(&self, err: kube::Error, key: &ObjectKey) -> SyncError {
        map_kube_error(err, &self.resource.kind, key)
    }

    fn scope_key(options: &ListOptions) -> ObjectKey {
        ObjectKey::new(options.namespace.clone().unwrap_or_default(), "")
    }
}

fn convert_event(
    event: Result<KubeWatchEvent<DynamicObject>, kube::Error>,
    kind: &str,
    scope: &ObjectKey,
) -> SyncResult<WatchEvent> {
    match event.map_err(|e| map_kube_error(e, kind, scope))? {
        KubeWatchEvent::Added(obj) => Ok(WatchEvent::Added(obj)),
        KubeWatchEvent::Modified(obj) => Ok(WatchEvent::Modified(obj)),
        KubeWatchEvent::Deleted(obj) => Ok(WatchEvent::Deleted(obj)),
        KubeWatchEvent::Bookmark(bookmark) => {
            Ok(WatchEvent::Bookmark(bookmark.metadata.resource_version))
        }
        KubeWatchEvent::Error(response) => Err(map_error_response(response, kind, scope)),
    }
}

impl ResourceClient for KubeResourceClient {
    fn resource(&self) -> &ApiResource {
        &self.resource
    }

    fn get(&self, key: &ObjectKey) -> ClientFuture<'_, DynamicObject> {
        let key = key.clone();
        Box::pin(async move {
            self.api(key.namespace())
                .get(&key.name)
                .await
                .map_err(|e| self.error(e, &key))
        })
    }

    fn list(&self, options: &ListOptions) -> ClientFuture<'_, ObjectList> {
        let options = options.clone();
        Box::pin(async move {
            let mut params = ListParams::default();
            if let Some(selector) = &options.label_selector {
                params = params.labels(selector);
            }
            let list = self
                .api(options.namespace.as_deref())
                .list(&params)
                .await
                .map_err(|e| self.error(e, &Self::scope_key(&options)))?;
            Ok(ObjectList {
                resource_version: list.metadata.resource_version.unwrap_or_default(),
                items: list.items,
            })
        })
    }

    fn watch(
        &self,
        options: &ListOptions,
        resource_version: &str,
    ) -> ClientFuture<'_, WatchStream> {
        let options = options.clone();
        let resource_version = resource_version.to_string();
        Box::pin(async move {
            let mut params = WatchParams::default().timeout(WATCH_TIMEOUT_SECS);
            if let Some(selector) = &options.label_selector {
                params = params.labels(selector);
            }
            let api = self.api(options.namespace.as_deref());
            let kind = self.resource.kind.clone();
            let scope = Self::scope_key(&options);

            // The kube stream borrows its `Api`, so a task owns both and
            // forwards events until the receiver goes away.
            let (tx, rx) = mpsc::channel(WATCH_BUFFER);
            tokio::spawn(async move {
                let stream = match api.watch(&params, &resource_version).await {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = tx.send(Err(map_kube_error(e, &kind, &scope))).await;
                        return;
                    }
                };
                let mut stream = stream.boxed();
                loop {
                    tokio::select! {
                        _ = tx.closed() => break,
                        next = stream.next() => match next {
                            Some(event) => {
                                let event = convert_event(event, &kind, &scope);
                                let failed = event.is_err();
                                if tx.send(event).await.is_err() || failed {
                                    break;
                                }
                            }
                            None => break,
                        }
                    }
                }
            });

            let events = futures::stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|event| (event, rx))
            });
            Ok(events.boxed())
        })
    }

    fn create(&self, obj: &DynamicObject) -> ClientFuture<'_, DynamicObject> {
        let obj = obj.clone();
        Box::pin(async move {
            let key = ObjectKey::of(&obj);
            self.api(key.namespace())
                .create(&PostParams::default(), &obj)
                .await
                .map_err(|e| self.error(e, &key))
        })
    }

    fn update(&self, obj: &DynamicObject) -> ClientFuture<'_, DynamicObject> {
        let obj = obj.clone();
        Box::pin(async move {
            let key = ObjectKey::of(&obj);
            self.api(key.namespace())
                .replace(&key.name, &PostParams::default(), &obj)
                .await
                .map_err(|e| self.error(e, &key))
        })
    }

    fn update_status(&self, obj: &DynamicObject) -> ClientFuture<'_, DynamicObject> {
        let obj = obj.clone();
        Box::pin(async move {
            let key = ObjectKey::of(&obj);
            let mut patch = json!({
                "status": obj.data.get("status").cloned().unwrap_or(Value::Null)
            });
            // A merge patch carrying resourceVersion is rejected when stale.
            if let Some(rv) = &obj.metadata.resource_version {
                patch["metadata"] = json!({ "resourceVersion": rv });
            }
            self.api(key.namespace())
                .patch_status(&key.name, &PatchParams::default(), &Patch::Merge(&patch))
                .await
                .map_err(|e| self.error(e, &key))
        })
    }

    fn patch(
        &self,
        key: &ObjectKey,
        patch_type: PatchType,
        data: &Value,
    ) -> ClientFuture<'_, DynamicObject> {
        let key = key.clone();
        let data = data.clone();
        Box::pin(async move {
            let api = self.api(key.namespace());
            let params = PatchParams::default();
            let result = match patch_type {
                PatchType::Merge => api.patch(&key.name, &params, &Patch::Merge(&data)).await,
                PatchType::Json => {
                    let operations = serde_json::from_value(data)?;
                    api.patch(&key.name, &params, &Patch::<Value>::Json(operations))
                        .await
                }
            };
            result.map_err(|e| self.error(e, &key))
        })
    }

    fn delete(&self, key: &ObjectKey) -> ClientFuture<'_, ()> {
        let key = key.clone();
        Box::pin(async move {
            self.api(key.namespace())
                .delete(&key.name, &DeleteParams::default())
                .await
                .map(|_| ())
                .map_err(|e| self.error(e, &key))
        })
    }
}

/// A connection to one API server.
#[derive(Clone)]
pub struct KubeConnection {
    name: String,
    client: Client,
}

impl KubeConnection {
    /// Wrap an existing client.
    pub fn new(name: impl Into<String>, client: Client) -> Self {
        Self {
            name: name.into(),
            client,
        }
    }

    /// Connect using a kubeconfig file, or the inferred in-cluster or
    /// default configuration when `path` is `None`.
    pub async fn from_path(name: impl Into<String>, path: Option<&str>) -> OperatorResult<Self> {
        let name = name.into();
        let client = match path {
            Some(path) => {
                let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                    OperatorError::Kubeconfig {
                        source_name: path.to_string(),
                        reason: e.to_string(),
                    }
                })?;
                client_from_kubeconfig(kubeconfig, path).await?
            }
            None => Client::try_default().await?,
        };
        Ok(Self::new(name, client))
    }

    /// Connection name, used in logs.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The underlying client.
    pub fn client(&self) -> &Client {
        &self.client
    }
}

impl ClusterConnection for KubeConnection {
    fn resource_client(&self, resource: &ApiResource) -> Arc<dyn ResourceClient> {
        Arc::new(KubeResourceClient::new(self.client.clone(), resource.clone()))
    }

    fn probe(&self) -> ClientFuture<'_, ()> {
        Box::pin(async move {
            match tokio::time::timeout(PROBE_TIMEOUT, self.client.apiserver_version()).await {
                Ok(Ok(_)) => Ok(()),
                Ok(Err(e)) => Err(SyncError::Transient(format!(
                    "cluster '{}' probe failed: {}",
                    self.name, e
                ))),
                Err(_) => Err(SyncError::Transient(format!(
                    "cluster '{}' probe timed out",
                    self.name
                ))),
            }
        })
    }
}

/// Parse kubeconfig YAML.
pub fn parse_kubeconfig(data: &[u8], source_name: &str) -> OperatorResult<Kubeconfig> {
    let text = std::str::from_utf8(data).map_err(|e| OperatorError::Kubeconfig {
        source_name: source_name.to_string(),
        reason: format!("invalid UTF-8: {}", e),
    })?;
    Kubeconfig::from_yaml(text).map_err(|e| OperatorError::Kubeconfig {
        source_name: source_name.to_string(),
        reason: format!("invalid YAML: {}", e),
    })
}

/// Build a client from a parsed kubeconfig, using its current context.
pub async fn client_from_kubeconfig(
    kubeconfig: Kubeconfig,
    source_name: &str,
) -> OperatorResult<Client> {
    let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|e| OperatorError::Kubeconfig {
            source_name: source_name.to_string(),
            reason: e.to_string(),
        })?;
    Ok(Client::try_from(config)?)
}
