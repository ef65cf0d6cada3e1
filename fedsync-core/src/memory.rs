//! In-memory API server.
//!
//! Implements [`ResourceClient`] and [`ClusterConnection`] with the semantics
//! the engine relies on: resource versions, optimistic concurrency, spec
//! generations, finalizers, status subresource and resumable watches. Useful
//! for:
//! - Tests, including fault injection and mutation accounting
//! - Running the controller without a real control plane

use crate::client::{
    selector_matches, ClientFuture, ClusterConnection, ListOptions, ObjectList, PatchType,
    ResourceClient, WatchEvent, WatchStream,
};
use crate::error::{SyncError, SyncResult};
use crate::object::ObjectKey;
use futures::StreamExt;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::DynamicObject;
use kube::core::ApiResource;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Number of past events kept per kind for resuming watches.
const HISTORY_LIMIT: usize = 1024;

/// Verbs recorded in the mutation log and matched by injected faults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    /// Read of a single object.
    Get,
    /// Object creation.
    Create,
    /// Full object replacement.
    Update,
    /// Status subresource replacement.
    UpdateStatus,
    /// Patch.
    Patch,
    /// Deletion.
    Delete,
}

impl Verb {
    /// True for verbs that change stored state.
    pub fn is_mutation(&self) -> bool {
        !matches!(self, Verb::Get)
    }
}

/// A failure injected into the next matching call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// Fail with a transient error.
    Transient,
    /// Fail with an optimistic concurrency conflict.
    Conflict,
    /// Fail with a non-retryable rejection.
    Rejected,
}

/// A recorded mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mutation {
    /// Resource kind.
    pub kind: String,
    /// Mutating verb.
    pub verb: Verb,
    /// Target object.
    pub key: ObjectKey,
}

#[derive(Debug, Clone)]
enum StoreEvent {
    Event(u64, WatchEvent),
    Disconnect,
}

struct StoreState {
    objects: BTreeMap<ObjectKey, DynamicObject>,
    history: VecDeque<(u64, WatchEvent)>,
}

struct KindStore {
    resource: ApiResource,
    state: Mutex<StoreState>,
    events: broadcast::Sender<StoreEvent>,
}

impl KindStore {
    fn new(resource: ApiResource) -> Self {
        let (events, _) = broadcast::channel(HISTORY_LIMIT);
        Self {
            resource,
            state: Mutex::new(StoreState {
                objects: BTreeMap::new(),
                history: VecDeque::new(),
            }),
            events,
        }
    }

    /// Record an event. Must be called with the state lock held so watchers
    /// never observe a gap between history and live events.
    fn emit(&self, state: &mut StoreState, rv: u64, event: WatchEvent) {
        if state.history.len() >= HISTORY_LIMIT {
            state.history.pop_front();
        }
        state.history.push_back((rv, event.clone()));
        let _ = self.events.send(StoreEvent::Event(rv, event));
    }
}

struct ClusterInner {
    name: String,
    resource_version: AtomicU64,
    reachable: AtomicBool,
    stores: Mutex<HashMap<String, Arc<KindStore>>>,
    faults: Mutex<VecDeque<(Option<Verb>, Fault)>>,
    standing_faults: Mutex<Vec<(Option<Verb>, Fault)>>,
    calls: Mutex<HashMap<Verb, usize>>,
    immutable: Mutex<Vec<(String, String)>>,
    mutations: Mutex<Vec<Mutation>>,
}

impl ClusterInner {
    fn next_rv(&self) -> u64 {
        self.resource_version.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn check(&self, verb: Verb, kind: &str, key: &ObjectKey) -> SyncResult<()> {
        *self.calls.lock().entry(verb).or_insert(0) += 1;
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(SyncError::Transient(format!(
                "cluster '{}' is unreachable",
                self.name
            )));
        }

        let fault = {
            let mut faults = self.faults.lock();
            let pos = faults
                .iter()
                .position(|(v, _)| v.map_or(true, |v| v == verb));
            pos.and_then(|p| faults.remove(p)).map(|(_, f)| f)
        };
        let fault = fault.or_else(|| {
            self.standing_faults
                .lock()
                .iter()
                .find(|(v, _)| v.map_or(true, |v| v == verb))
                .map(|(_, f)| f.clone())
        });

        match fault {
            None => Ok(()),
            Some(Fault::Transient) => Err(SyncError::Transient(format!(
                "injected transient failure on {:?} {}/{}",
                verb, kind, key
            ))),
            Some(Fault::Conflict) => Err(SyncError::Conflict(format!(
                "injected conflict on {:?} {}/{}",
                verb, kind, key
            ))),
            Some(Fault::Rejected) => Err(SyncError::Rejected {
                code: 422,
                message: format!("injected rejection on {:?} {}/{}", verb, kind, key),
            }),
        }
    }

    fn record(&self, kind: &str, verb: Verb, key: &ObjectKey) {
        self.mutations.lock().push(Mutation {
            kind: kind.to_string(),
            verb,
            key: key.clone(),
        });
    }
}

/// An in-memory API server standing in for one cluster.
#[derive(Clone)]
pub struct MemoryCluster {
    inner: Arc<ClusterInner>,
}

impl MemoryCluster {
    /// Create an empty, reachable cluster.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(ClusterInner {
                name: name.into(),
                resource_version: AtomicU64::new(0),
                reachable: AtomicBool::new(true),
                stores: Mutex::new(HashMap::new()),
                faults: Mutex::new(VecDeque::new()),
                standing_faults: Mutex::new(Vec::new()),
                calls: Mutex::new(HashMap::new()),
                immutable: Mutex::new(Vec::new()),
                mutations: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Cluster name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Typed access to one kind, for seeding and assertions.
    pub fn client(&self, resource: &ApiResource) -> MemoryResourceClient {
        let key = store_key(resource);
        let store = self
            .inner
            .stores
            .lock()
            .entry(key)
            .or_insert_with(|| Arc::new(KindStore::new(resource.clone())))
            .clone();
        MemoryResourceClient {
            cluster: Arc::clone(&self.inner),
            store,
        }
    }

    /// Make every call fail with a transient error (or stop doing so). Going
    /// unreachable also drops every open watch.
    pub fn set_reachable(&self, reachable: bool) {
        self.inner.reachable.store(reachable, Ordering::SeqCst);
        if !reachable {
            self.disconnect_watches();
        }
    }

    /// Whether the cluster currently answers calls.
    pub fn is_reachable(&self) -> bool {
        self.inner.reachable.load(Ordering::SeqCst)
    }

    /// Fail the next call with the given verb (any verb when `None`).
    pub fn inject_fault(&self, verb: Option<Verb>, fault: Fault) {
        self.inner.faults.lock().push_back((verb, fault));
    }

    /// Fail every call with the given verb until [`clear_faults`](Self::clear_faults).
    pub fn fail_always(&self, verb: Option<Verb>, fault: Fault) {
        self.inner.standing_faults.lock().push((verb, fault));
    }

    /// Drop every pending and standing fault.
    pub fn clear_faults(&self) {
        self.inner.faults.lock().clear();
        self.inner.standing_faults.lock().clear();
    }

    /// Calls made with a verb so far, failed ones included. Lists and
    /// watches are not counted.
    pub fn call_count(&self, verb: Verb) -> usize {
        self.inner.calls.lock().get(&verb).copied().unwrap_or(0)
    }

    /// Reject updates of `kind` that change the value at `pointer`, the way
    /// an API server guards immutable fields such as a Job's pod template.
    pub fn freeze(&self, kind: impl Into<String>, pointer: impl Into<String>) {
        self.inner.immutable.lock().push((kind.into(), pointer.into()));
    }

    /// Terminate every open watch stream with an error.
    pub fn disconnect_watches(&self) {
        for store in self.inner.stores.lock().values() {
            let _ = store.events.send(StoreEvent::Disconnect);
        }
    }

    /// All mutations performed so far.
    pub fn mutations(&self) -> Vec<Mutation> {
        self.inner.mutations.lock().clone()
    }

    /// Number of mutations performed so far.
    pub fn mutation_count(&self) -> usize {
        self.inner.mutations.lock().len()
    }

    /// Forget recorded mutations.
    pub fn clear_mutations(&self) {
        self.inner.mutations.lock().clear();
    }
}

impl ClusterConnection for MemoryCluster {
    fn resource_client(&self, resource: &ApiResource) -> Arc<dyn ResourceClient> {
        Arc::new(self.client(resource))
    }

    fn probe(&self) -> ClientFuture<'_, ()> {
        Box::pin(async move {
            if self.is_reachable() {
                Ok(())
            } else {
                Err(SyncError::Transient(format!(
                    "cluster '{}' is unreachable",
                    self.inner.name
                )))
            }
        })
    }
}

fn store_key(resource: &ApiResource) -> String {
    format!("{}/{}", resource.api_version, resource.kind)
}

/// [`ResourceClient`] over one kind of a [`MemoryCluster`].
#[derive(Clone)]
pub struct MemoryResourceClient {
    cluster: Arc<ClusterInner>,
    store: Arc<KindStore>,
}

impl MemoryResourceClient {
    /// Snapshot of a stored object, bypassing reachability and faults.
    pub fn peek(&self, key: &ObjectKey) -> Option<DynamicObject> {
        self.store.state.lock().objects.get(key).cloned()
    }

    /// Keys of all stored objects, bypassing reachability and faults.
    pub fn keys(&self) -> Vec<ObjectKey> {
        self.store.state.lock().objects.keys().cloned().collect()
    }

    fn kind(&self) -> &str {
        &self.store.resource.kind
    }

    fn get_sync(&self, key: &ObjectKey) -> SyncResult<DynamicObject> {
        self.cluster.check(Verb::Get, self.kind(), key)?;
        self.store
            .state
            .lock()
            .objects
            .get(key)
            .cloned()
            .ok_or_else(|| SyncError::not_found(self.kind(), &key.namespace, &key.name))
    }

    fn list_sync(&self, options: &ListOptions) -> SyncResult<ObjectList> {
        if !self.cluster.reachable.load(Ordering::SeqCst) {
            return Err(SyncError::Transient(format!(
                "cluster '{}' is unreachable",
                self.cluster.name
            )));
        }
        let state = self.store.state.lock();
        let items = state
            .objects
            .values()
            .filter(|obj| in_scope(obj, options))
            .cloned()
            .collect();
        Ok(ObjectList {
            items,
            resource_version: self
                .cluster
                .resource_version
                .load(Ordering::SeqCst)
                .to_string(),
        })
    }

    fn watch_sync(&self, options: &ListOptions, resource_version: &str) -> SyncResult<WatchStream> {
        if !self.cluster.reachable.load(Ordering::SeqCst) {
            return Err(SyncError::Transient(format!(
                "cluster '{}' is unreachable",
                self.cluster.name
            )));
        }
        let since: u64 = resource_version.parse().unwrap_or(0);

        let (backlog, receiver) = {
            let state = self.store.state.lock();
            if let Some((oldest, _)) = state.history.front() {
                if since + 1 < *oldest && state.history.len() >= HISTORY_LIMIT {
                    return Err(SyncError::Transient(format!(
                        "resource version {} is too old",
                        since
                    )));
                }
            }
            let backlog: Vec<WatchEvent> = state
                .history
                .iter()
                .filter(|(rv, _)| *rv > since)
                .map(|(_, event)| event.clone())
                .collect();
            (backlog, self.store.events.subscribe())
        };

        let filter_options = options.clone();
        let backlog = futures::stream::iter(backlog.into_iter().map(Ok));
        let live = futures::stream::unfold(
            (receiver, since, false),
            |(mut receiver, since, done)| async move {
                if done {
                    return None;
                }
                loop {
                    match receiver.recv().await {
                        Ok(StoreEvent::Event(rv, event)) if rv > since => {
                            return Some((Ok(event), (receiver, since, false)));
                        }
                        Ok(StoreEvent::Event(..)) => continue,
                        Ok(StoreEvent::Disconnect) => {
                            return Some((
                                Err(SyncError::Transient("watch disconnected".into())),
                                (receiver, since, true),
                            ));
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            return Some((
                                Err(SyncError::Transient(format!(
                                    "watch fell behind by {} events",
                                    n
                                ))),
                                (receiver, since, true),
                            ));
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            },
        );

        Ok(backlog
            .chain(live)
            .filter(move |event| {
                let keep = match event {
                    Ok(event) => event.object().map_or(true, |obj| in_scope(obj, &filter_options)),
                    Err(_) => true,
                };
                futures::future::ready(keep)
            })
            .boxed())
    }

    fn create_sync(&self, obj: &DynamicObject) -> SyncResult<DynamicObject> {
        let key = ObjectKey::of(obj);
        self.cluster.check(Verb::Create, self.kind(), &key)?;
        if key.name.is_empty() {
            return Err(SyncError::Rejected {
                code: 422,
                message: "metadata.name is required".into(),
            });
        }

        let mut state = self.store.state.lock();
        if state.objects.contains_key(&key) {
            return Err(SyncError::already_exists(
                self.kind(),
                &key.namespace,
                &key.name,
            ));
        }

        let rv = self.cluster.next_rv();
        let mut stored = obj.clone();
        stored.types = Some(kube::api::TypeMeta {
            api_version: self.store.resource.api_version.clone(),
            kind: self.store.resource.kind.clone(),
        });
        stored.metadata.uid = Some(format!("{}-{}", self.cluster.name, rv));
        stored.metadata.resource_version = Some(rv.to_string());
        stored.metadata.generation = Some(1);
        stored.metadata.creation_timestamp = Some(Time(chrono::Utc::now()));
        stored.metadata.deletion_timestamp = None;
        if let Some(data) = stored.data.as_object_mut() {
            data.remove("status");
        }

        state.objects.insert(key.clone(), stored.clone());
        self.store
            .emit(&mut state, rv, WatchEvent::Added(stored.clone()));
        drop(state);

        self.cluster.record(self.kind(), Verb::Create, &key);
        Ok(stored)
    }

    fn update_sync(&self, obj: &DynamicObject, verb: Verb) -> SyncResult<DynamicObject> {
        let key = ObjectKey::of(obj);
        self.cluster.check(verb, self.kind(), &key)?;

        let mut state = self.store.state.lock();
        let current = state
            .objects
            .get(&key)
            .cloned()
            .ok_or_else(|| SyncError::not_found(self.kind(), &key.namespace, &key.name))?;

        if let Some(rv) = &obj.metadata.resource_version {
            if Some(rv) != current.metadata.resource_version.as_ref() {
                return Err(SyncError::Conflict(format!(
                    "{} {} has been modified (have {}, stored {})",
                    self.kind(),
                    key,
                    rv,
                    current.metadata.resource_version.as_deref().unwrap_or("")
                )));
            }
        }

        if verb == Verb::Update {
            let immutable = self.cluster.immutable.lock();
            let changed = immutable
                .iter()
                .filter(|(kind, _)| kind == self.kind())
                .find(|(_, pointer)| obj.data.pointer(pointer) != current.data.pointer(pointer));
            if let Some((_, pointer)) = changed {
                return Err(SyncError::Rejected {
                    code: 422,
                    message: format!("{} {}: field {} is immutable", self.kind(), key, pointer),
                });
            }
        }

        let rv = self.cluster.next_rv();
        let mut stored = match verb {
            Verb::UpdateStatus => {
                let mut stored = current.clone();
                if let Some(data) = stored.data.as_object_mut() {
                    match obj.data.get("status") {
                        Some(status) => {
                            data.insert("status".into(), status.clone());
                        }
                        None => {
                            data.remove("status");
                        }
                    }
                }
                stored
            }
            _ => {
                let mut stored = obj.clone();
                stored.types = current.types.clone();
                stored.metadata.uid = current.metadata.uid.clone();
                stored.metadata.creation_timestamp = current.metadata.creation_timestamp.clone();
                stored.metadata.deletion_timestamp = current.metadata.deletion_timestamp.clone();
                stored.metadata.generation = current.metadata.generation;
                if let Some(data) = stored.data.as_object_mut() {
                    match current.data.get("status") {
                        Some(status) => {
                            data.insert("status".into(), status.clone());
                        }
                        None => {
                            data.remove("status");
                        }
                    }
                }
                if spec_of(&stored) != spec_of(&current) {
                    stored.metadata.generation = Some(current.metadata.generation.unwrap_or(0) + 1);
                }
                stored
            }
        };
        stored.metadata.resource_version = Some(rv.to_string());

        let finalized = stored.metadata.deletion_timestamp.is_some()
            && stored
                .metadata
                .finalizers
                .as_ref()
                .map_or(true, |f| f.is_empty());

        if finalized {
            state.objects.remove(&key);
            self.store
                .emit(&mut state, rv, WatchEvent::Deleted(stored.clone()));
        } else {
            state.objects.insert(key.clone(), stored.clone());
            self.store
                .emit(&mut state, rv, WatchEvent::Modified(stored.clone()));
        }
        drop(state);

        self.cluster.record(self.kind(), verb, &key);
        Ok(stored)
    }

    fn patch_sync(
        &self,
        key: &ObjectKey,
        patch_type: PatchType,
        data: &serde_json::Value,
    ) -> SyncResult<DynamicObject> {
        let current = self
            .store
            .state
            .lock()
            .objects
            .get(key)
            .cloned()
            .ok_or_else(|| SyncError::not_found(self.kind(), &key.namespace, &key.name))?;

        let mut doc = serde_json::to_value(&current)?;
        match patch_type {
            PatchType::Merge => json_patch::merge(&mut doc, data),
            PatchType::Json => {
                let patch: json_patch::Patch = serde_json::from_value(data.clone())?;
                json_patch::patch(&mut doc, &patch).map_err(|e| SyncError::Rejected {
                    code: 422,
                    message: e.to_string(),
                })?;
            }
        }

        let mut patched: DynamicObject = serde_json::from_value(doc)?;
        patched.metadata.resource_version = current.metadata.resource_version.clone();
        self.update_sync(&patched, Verb::Patch)
    }

    fn delete_sync(&self, key: &ObjectKey) -> SyncResult<()> {
        self.cluster.check(Verb::Delete, self.kind(), key)?;

        let mut state = self.store.state.lock();
        let current = state
            .objects
            .get(key)
            .cloned()
            .ok_or_else(|| SyncError::not_found(self.kind(), &key.namespace, &key.name))?;

        let rv = self.cluster.next_rv();
        let has_finalizers = current
            .metadata
            .finalizers
            .as_ref()
            .is_some_and(|f| !f.is_empty());

        if has_finalizers {
            if current.metadata.deletion_timestamp.is_none() {
                let mut stored = current;
                stored.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
                stored.metadata.generation = Some(stored.metadata.generation.unwrap_or(0) + 1);
                stored.metadata.resource_version = Some(rv.to_string());
                state.objects.insert(key.clone(), stored.clone());
                self.store
                    .emit(&mut state, rv, WatchEvent::Modified(stored));
            }
        } else {
            let mut removed = current;
            removed.metadata.resource_version = Some(rv.to_string());
            state.objects.remove(key);
            self.store
                .emit(&mut state, rv, WatchEvent::Deleted(removed));
        }
        drop(state);

        self.cluster.record(self.kind(), Verb::Delete, key);
        Ok(())
    }
}

impl ResourceClient for MemoryResourceClient {
    fn resource(&self) -> &ApiResource {
        &self.store.resource
    }

    fn get(&self, key: &ObjectKey) -> ClientFuture<'_, DynamicObject> {
        let result = self.get_sync(key);
        Box::pin(async move { result })
    }

    fn list(&self, options: &ListOptions) -> ClientFuture<'_, ObjectList> {
        let result = self.list_sync(options);
        Box::pin(async move { result })
    }

    fn watch(
        &self,
        options: &ListOptions,
        resource_version: &str,
    ) -> ClientFuture<'_, WatchStream> {
        let result = self.watch_sync(options, resource_version);
        Box::pin(async move { result })
    }

    fn create(&self, obj: &DynamicObject) -> ClientFuture<'_, DynamicObject> {
        let result = self.create_sync(obj);
        Box::pin(async move { result })
    }

    fn update(&self, obj: &DynamicObject) -> ClientFuture<'_, DynamicObject> {
        let result = self.update_sync(obj, Verb::Update);
        Box::pin(async move { result })
    }

    fn update_status(&self, obj: &DynamicObject) -> ClientFuture<'_, DynamicObject> {
        let result = self.update_sync(obj, Verb::UpdateStatus);
        Box::pin(async move { result })
    }

    fn patch(
        &self,
        key: &ObjectKey,
        patch_type: PatchType,
        data: &serde_json::Value,
    ) -> ClientFuture<'_, DynamicObject> {
        let result = self.patch_sync(key, patch_type, data);
        Box::pin(async move { result })
    }

    fn delete(&self, key: &ObjectKey) -> ClientFuture<'_, ()> {
        let result = self.delete_sync(key);
        Box::pin(async move { result })
    }
}

/// Everything except metadata and status; changes here bump the generation.
fn spec_of(obj: &DynamicObject) -> serde_json::Value {
    let mut data = obj.data.clone();
    if let Some(map) = data.as_object_mut() {
        map.remove("status");
    }
    data
}

fn in_scope(obj: &DynamicObject, options: &ListOptions) -> bool {
    if let Some(ns) = &options.namespace {
        if obj.metadata.namespace.as_deref().unwrap_or("") != ns {
            return false;
        }
    }
    match &options.label_selector {
        Some(selector) => {
            let empty = BTreeMap::new();
            selector_matches(obj.metadata.labels.as_ref().unwrap_or(&empty), selector)
        }
        None => true,
    }
}
