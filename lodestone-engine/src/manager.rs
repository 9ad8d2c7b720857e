use crate::admission::AdmissionQueue;
use crate::diagnostics::{DiagnosticsEvent, DiagnosticsEventKind, DiagnosticsHook};
use crate::operation::{
    ChainOperation, GroupOperation, OperationPayload, OperationState, ProviderOperation,
    ResultValue, Waiter,
};
use crate::pool::{FreeListPool, PayloadKind, PooledOperation, PoolPolicy};
use crate::provider::{ProvideHandle, Provider};
use crossbeam_channel::{Receiver, Sender};
use lodestone_base::hashing::{HashMap, HashSet};
use lodestone_base::location::{ManifestData, ManifestError};
use lodestone_base::{Handle, LoadError, OperationId, OperationStatus, ResourceLocation};
use std::any::{Any, TypeId};
use std::sync::Arc;
use thiserror::Error;

//
// The manager is the single owner of all engine state: the operation arena, the dedup
// cache, the provider registry, the pool and the deferred-completion queue. The whole
// engine is single-threaded and cooperative; the only thing that may touch it from
// another thread is the completion channel a ProvideHandle sends into, which is
// drained at the start of every tick.
//
// Completion listeners never run inside the call stack that produced the completion.
// They are queued and fired during the tick's flush step; anything queued while a
// flush is in progress lands in the incoming queue and fires on the next tick.
//

/// Deduplication key for the cache. Either "this location loaded as this type" or
/// "this exact list of dependency operations", so identical in-flight requests and
/// identical dependency groups collapse onto one operation.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub(crate) enum CacheKey {
    Location {
        location: Arc<ResourceLocation>,
        requested_type: TypeId,
    },
    DependencyGroup(Arc<[OperationId]>),
}

/// Events sent back to the manager by providers. Produced by `ProvideHandle` and
/// consumed at the start of `tick`, which is how off-thread providers marshal their
/// results onto the tick thread.
pub(crate) enum EngineEvent {
    ProvideSucceeded {
        operation: OperationId,
        provide_version: u32,
        result: Box<dyn Any + Send>,
    },
    ProvideFailed {
        operation: OperationId,
        provide_version: u32,
        error: LoadError,
    },
    ProvideProgress {
        operation: OperationId,
        provide_version: u32,
        downloaded_bytes: u64,
        total_bytes: u64,
    },
}

#[derive(Clone, Debug)]
pub struct ManagerConfig {
    /// Bound for the admission queue providers may route outbound requests through
    pub max_concurrent_requests: usize,
    /// When false, `wait_for_completion` fails with `SynchronousWaitUnsupported`
    /// instead of draining ticks. Set this for backends that cannot block.
    pub allow_synchronous_wait: bool,
    /// When true, a cached operation that completes `Failed` is evicted from the cache
    /// immediately so the key can be retried. Operations already sharing it keep their
    /// references either way.
    pub release_failed_from_cache: bool,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        ManagerConfig {
            max_concurrent_requests: crate::admission::DEFAULT_MAX_CONCURRENT_REQUESTS,
            allow_synchronous_wait: true,
            release_failed_from_cache: true,
        }
    }
}

#[derive(Copy, Clone, Debug)]
pub struct GroupOptions {
    /// Release all children when the group fails
    pub release_dependencies_on_failure: bool,
    /// Complete `Succeeded` even if some children failed (best-effort batch)
    pub allow_failed_dependencies: bool,
}

impl Default for GroupOptions {
    fn default() -> Self {
        GroupOptions {
            release_dependencies_on_failure: true,
            allow_failed_dependencies: false,
        }
    }
}

/// Aggregated download progress over an operation and everything it depends on.
#[derive(Copy, Clone, Debug, Default)]
pub struct DownloadStatus {
    pub downloaded_bytes: u64,
    pub total_bytes: u64,
    pub is_done: bool,
}

impl DownloadStatus {
    fn combine(
        &mut self,
        other: DownloadStatus,
    ) {
        self.downloaded_bytes += other.downloaded_bytes;
        self.total_bytes += other.total_bytes;
        self.is_done &= other.is_done;
    }
}

/// Information about a live operation.
///
/// **Note:** The information is true at the time the `OperationInfo` is retrieved. The
/// actual reference count may change.
#[derive(Debug)]
pub struct OperationInfo {
    pub id: OperationId,
    pub debug_name: Option<Arc<String>>,
    pub ref_count: u32,
    pub status: OperationStatus,
}

#[derive(Debug, Error)]
pub enum ManifestLoadError {
    #[error("manifest JSON could not be parsed")]
    Parse(#[from] serde_json::Error),
    #[error(transparent)]
    Manifest(#[from] ManifestError),
}

struct Slot {
    version: u32,
    state: Option<OperationState>,
}

pub struct ResourceManager {
    config: ManagerConfig,

    // Operation arena. A slot's version is bumped every time it is recycled, which is
    // what invalidates stale handles.
    slots: Vec<Slot>,
    free_slots: Vec<u32>,
    pool: Box<dyn PoolPolicy>,

    // At most one live operation per key
    cache: HashMap<CacheKey, OperationId>,

    providers: Vec<Box<dyn Provider>>,
    // Caches (provider id, requested type) resolution, including misses, to avoid
    // re-scanning the registry for every request
    provider_lookup: HashMap<(String, TypeId), Option<usize>>,

    manifest_types: HashMap<String, TypeId>,

    events_tx: Sender<EngineEvent>,
    events_rx: Receiver<EngineEvent>,

    // Deferred completion notifications. Incoming entries accumulate in `deferred`;
    // each tick swaps it with `deferred_flushing` and drains that, so entries queued
    // by callbacks during the flush fire on the next tick instead of being skipped or
    // run reentrantly.
    deferred: Vec<OperationId>,
    deferred_flushing: Vec<OperationId>,

    // Operations pumped once per tick, with two-phase add/remove so the list is never
    // mutated while it is being iterated
    update_receivers: Vec<OperationId>,
    update_receivers_pending_add: Vec<OperationId>,
    update_receivers_pending_remove: Vec<OperationId>,

    admission: AdmissionQueue,
    diagnostics: Option<DiagnosticsHook>,
    in_tick: bool,
}

impl Default for ResourceManager {
    fn default() -> Self {
        Self::new(ManagerConfig::default())
    }
}

impl ResourceManager {
    pub fn new(config: ManagerConfig) -> Self {
        let (events_tx, events_rx) = crossbeam_channel::unbounded();
        let admission = AdmissionQueue::new(config.max_concurrent_requests);
        ResourceManager {
            config,
            slots: Vec::default(),
            free_slots: Vec::default(),
            pool: Box::new(FreeListPool::default()),
            cache: HashMap::default(),
            providers: Vec::default(),
            provider_lookup: HashMap::default(),
            manifest_types: HashMap::default(),
            events_tx,
            events_rx,
            deferred: Vec::default(),
            deferred_flushing: Vec::default(),
            update_receivers: Vec::default(),
            update_receivers_pending_add: Vec::default(),
            update_receivers_pending_remove: Vec::default(),
            admission,
            diagnostics: None,
            in_tick: false,
        }
    }

    /// Replaces the operation recycler. Must be called before any operations are
    /// created.
    pub fn set_pool_policy(
        &mut self,
        pool: Box<dyn PoolPolicy>,
    ) {
        assert_eq!(self.active_operation_count(), 0);
        self.pool = pool;
    }

    pub fn set_diagnostics_hook(
        &mut self,
        hook: DiagnosticsHook,
    ) {
        self.diagnostics = Some(hook);
    }

    pub fn register_provider(
        &mut self,
        provider: Box<dyn Provider>,
    ) {
        log::debug!("register provider '{}'", provider.provider_id());
        self.providers.push(provider);
        self.provider_lookup.clear();
    }

    /// Shared gate for providers that need to bound concurrent outbound requests.
    pub fn admission_queue(&mut self) -> &mut AdmissionQueue {
        &mut self.admission
    }

    //
    // Manifest support. Locations usually come from configuration data; result types
    // are named by strings there and resolved against the registered names.
    //

    pub fn register_manifest_type<T: Any>(
        &mut self,
        name: impl Into<String>,
    ) {
        self.manifest_types.insert(name.into(), TypeId::of::<T>());
    }

    pub fn load_manifest_json(
        &self,
        json: &str,
    ) -> Result<HashMap<String, Arc<ResourceLocation>>, ManifestLoadError> {
        let data: ManifestData = serde_json::from_str(json)?;
        Ok(data.resolve(&self.manifest_types)?)
    }

    //
    // Public load API
    //

    /// Requests the resource at `location`, loaded as `T`. Always returns a handle
    /// owning one reference, even on failure: a load that cannot start (for example
    /// because no provider is registered) returns a valid handle that is already
    /// `Failed`, and the caller releases it like any other.
    #[profiling::function]
    pub fn provide<T: Any + Send>(
        &mut self,
        location: &Arc<ResourceLocation>,
    ) -> Handle {
        self.provide_with_type(location, TypeId::of::<T>())
    }

    pub fn provide_with_type(
        &mut self,
        location: &Arc<ResourceLocation>,
        requested_type: TypeId,
    ) -> Handle {
        let key = CacheKey::Location {
            location: location.clone(),
            requested_type,
        };
        if let Some(&existing) = self.cache.get(&key) {
            if let Some(state) = self.state(existing) {
                log::trace!(
                    "provide cache hit for '{}' -> {:?}",
                    location.internal_id(),
                    existing
                );
                let handle = Handle::new(existing, state.debug_name.clone());
                self.acquire_ref(existing);
                return handle;
            }
            self.cache.remove(&key);
        }

        let Some(provider_index) = self.find_provider(location, requested_type) else {
            log::error!(
                "no provider registered for location '{}' (provider id '{}')",
                location.internal_id(),
                location.provider_id()
            );
            return self.create_failed(
                LoadError::UnknownProvider {
                    location: location.internal_id().to_string(),
                },
                Some(location.clone()),
            );
        };

        // Resolve the location's dependencies bottom-up into a (deduplicated) group
        // the new operation is gated on
        let dependency = if location.dependencies().is_empty() {
            None
        } else {
            let children: Vec<Handle> = location
                .dependencies()
                .iter()
                .map(|dependency| self.provide_with_type(dependency, dependency.result_type()))
                .collect();
            Some(self.create_dependency_group(children))
        };

        let wants_update = self.providers[provider_index].needs_update();
        let payload = OperationPayload::Provider(ProviderOperation {
            provider_index,
            requested_type,
            provide_version: 0,
            downloaded_bytes: 0,
            total_bytes: 0,
            wants_update,
        });
        let handle = self.allocate_operation(
            payload,
            Some(location.clone()),
            None,
            Some(key.clone()),
            true,
        );
        self.cache.insert(key, handle.id());
        self.start(handle.id(), dependency);
        handle
    }

    /// Joins a fixed list of handles. The group takes ownership of the passed handles
    /// and releases them when it is destroyed (or immediately on failure, per
    /// `options`). Its result is the child handles in input order.
    pub fn create_group(
        &mut self,
        children: Vec<Handle>,
        options: GroupOptions,
    ) -> Handle {
        self.group_internal(children, options, None)
    }

    /// Maps `dependency`'s completion into a new operation via `callback` (the
    /// engine's flat-map). The chain takes ownership of `dependency` and of the handle
    /// the callback returns. If the dependency fails, the callback is never invoked
    /// and the chain fails wrapping the dependency's error.
    pub fn create_chain(
        &mut self,
        dependency: Handle,
        callback: impl FnOnce(&mut ResourceManager, Handle) -> Handle + 'static,
    ) -> Handle {
        let payload = OperationPayload::Chain(ChainOperation {
            callback: Some(Box::new(callback)),
            second: None,
        });
        let handle = self.allocate_operation(payload, None, None, None, true);
        self.start(handle.id(), Some(dependency));
        handle
    }

    /// Creates an operation that is already successfully completed with `value`.
    pub fn create_completed<T: Any + Send>(
        &mut self,
        value: T,
    ) -> Handle {
        let handle = self.allocate_operation(OperationPayload::Completed, None, None, None, true);
        self.complete_op(
            handle.id(),
            Some(ResultValue::Value(Box::new(value))),
            OperationStatus::Succeeded,
            None,
        );
        handle
    }

    /// Creates an operation that is already completed as `Failed` with `error`.
    pub fn create_failed(
        &mut self,
        error: LoadError,
        location: Option<Arc<ResourceLocation>>,
    ) -> Handle {
        let handle = self.allocate_operation(OperationPayload::Completed, location, None, None, true);
        self.complete_op(handle.id(), None, OperationStatus::Failed, Some(error));
        handle
    }

    /// Takes an additional reference on the operation, returning a handle that must be
    /// released independently of the original.
    pub fn acquire(
        &mut self,
        handle: &Handle,
    ) -> Result<Handle, LoadError> {
        if self.state(handle.id()).is_none() {
            return Err(LoadError::InvalidHandle);
        }
        self.acquire_ref(handle.id());
        Ok(handle.clone())
    }

    /// Gives up one reference. The operation is destroyed when the last reference is
    /// released.
    pub fn release(
        &mut self,
        handle: Handle,
    ) -> Result<(), LoadError> {
        self.release_ref(handle.id())
    }

    //
    // Accessors. All of these fail fast on a stale or null handle rather than reading
    // through it.
    //

    pub fn is_valid(
        &self,
        handle: &Handle,
    ) -> bool {
        self.state(handle.id()).is_some()
    }

    pub fn status(
        &self,
        handle: &Handle,
    ) -> Result<OperationStatus, LoadError> {
        self.state(handle.id())
            .map(|state| state.status)
            .ok_or(LoadError::InvalidHandle)
    }

    pub fn is_done(
        &self,
        handle: &Handle,
    ) -> bool {
        self.state(handle.id())
            .map(|state| state.is_done())
            .unwrap_or(false)
    }

    pub fn error(
        &self,
        handle: &Handle,
    ) -> Option<&LoadError> {
        self.state(handle.id()).and_then(|state| state.error.as_ref())
    }

    /// Typed access to a completed operation's product. Chains forward to their
    /// second-stage operation transparently.
    pub fn result<T: Any>(
        &self,
        handle: &Handle,
    ) -> Result<&T, LoadError> {
        let mut id = handle.id();
        loop {
            let state = self.state(id).ok_or(LoadError::InvalidHandle)?;
            if !state.is_done() {
                return Err(LoadError::NotComplete);
            }
            match &state.result {
                Some(ResultValue::Value(value)) => {
                    return value.downcast_ref::<T>().ok_or_else(|| {
                        LoadError::TypeMismatch {
                            location: state.describe(),
                        }
                    });
                }
                Some(ResultValue::Forward(inner)) => {
                    id = inner.id();
                }
                Some(ResultValue::Handles(_)) => {
                    return Err(LoadError::TypeMismatch {
                        location: state.describe(),
                    });
                }
                None => {
                    return Err(state.error.clone().unwrap_or(LoadError::NotComplete));
                }
            }
        }
    }

    /// The child handles of a completed group, in the order they were passed in.
    pub fn group_result(
        &self,
        handle: &Handle,
    ) -> Result<&[Handle], LoadError> {
        let state = self.state(handle.id()).ok_or(LoadError::InvalidHandle)?;
        if !state.is_done() {
            return Err(LoadError::NotComplete);
        }
        match &state.result {
            Some(ResultValue::Handles(handles)) => Ok(handles),
            _ => Err(state.error.clone().unwrap_or(LoadError::NotComplete)),
        }
    }

    /// Subscribes `callback` to the operation's completion. Listeners never run inside
    /// the completing call stack; a listener registered on an operation that is
    /// already complete still fires on the next tick.
    pub fn on_complete(
        &mut self,
        handle: &Handle,
        callback: impl FnOnce(&mut ResourceManager, Handle) + 'static,
    ) -> Result<(), LoadError> {
        if self.state(handle.id()).is_none() {
            return Err(LoadError::InvalidHandle);
        }
        self.add_waiter(handle.id(), Waiter::Listener(Box::new(callback)));
        Ok(())
    }

    /// Subscribes `callback` to the operation's destruction. Fires once, when the last
    /// reference is released.
    pub fn on_destroyed(
        &mut self,
        handle: &Handle,
        callback: impl FnOnce(&mut ResourceManager, Handle) + 'static,
    ) -> Result<(), LoadError> {
        let state = self
            .state_mut(handle.id())
            .ok_or(LoadError::InvalidHandle)?;
        state.destroyed_listeners.push(Box::new(callback));
        Ok(())
    }

    /// Download progress summed over the operation and its whole dependency graph.
    /// Diamond-shaped graphs are counted once via the visited set.
    pub fn download_progress(
        &self,
        handle: &Handle,
    ) -> Result<DownloadStatus, LoadError> {
        if self.state(handle.id()).is_none() {
            return Err(LoadError::InvalidHandle);
        }
        let mut visited = HashSet::default();
        Ok(self.download_status_recursive(handle.id(), &mut visited))
    }

    pub fn operation_info(
        &self,
        handle: &Handle,
    ) -> Option<OperationInfo> {
        self.state(handle.id()).map(|state| OperationInfo {
            id: handle.id(),
            debug_name: state.debug_name.clone(),
            ref_count: state.ref_count,
            status: state.status,
        })
    }

    pub fn active_operation_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.state.is_some()).count()
    }

    /// Ids of all live operations.
    pub fn active_operations(&self) -> Vec<OperationId> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.state.is_some())
            .map(|(index, slot)| OperationId {
                index: index as u32,
                version: slot.version,
            })
            .collect()
    }

    //
    // The tick. The only mutation entry point besides user calls. Step order matters:
    // pump update receivers, commit queued receiver additions then removals (two-phase
    // so the list is never mutated mid-iteration), then flush deferred completions.
    //

    #[profiling::function]
    pub fn tick(
        &mut self,
        delta_time: f32,
    ) {
        assert!(
            !self.in_tick,
            "ResourceManager::tick called re-entrantly (from a listener or provider)"
        );
        self.in_tick = true;

        // Marshal provider completions onto this thread
        while let Ok(event) = self.events_rx.try_recv() {
            self.handle_engine_event(event);
        }

        // 1. pump per-tick update subscribers
        for i in 0..self.update_receivers.len() {
            let id = self.update_receivers[i];
            let Some(state) = self.state(id) else {
                continue;
            };
            let OperationPayload::Provider(provider_op) = &state.payload else {
                continue;
            };
            let provider_index = provider_op.provider_index;
            self.providers[provider_index].update(delta_time);
        }

        // 2. commit queued registrations
        if !self.update_receivers_pending_add.is_empty() {
            let mut pending = std::mem::take(&mut self.update_receivers_pending_add);
            self.update_receivers.append(&mut pending);
            self.update_receivers_pending_add = pending;
        }

        // 3. drain queued removals. Registrations commit first so an operation whose
        // completion was drained above, before its registration landed, is still
        // removed instead of being pumped until destroy.
        if !self.update_receivers_pending_remove.is_empty() {
            let mut pending = std::mem::take(&mut self.update_receivers_pending_remove);
            self.update_receivers.retain(|id| !pending.contains(id));
            pending.clear();
            self.update_receivers_pending_remove = pending;
        }

        // 4. flush deferred completions. Entries queued by the callbacks we fire here
        // land in `deferred` and run next tick.
        std::mem::swap(&mut self.deferred, &mut self.deferred_flushing);
        let mut flushing = std::mem::take(&mut self.deferred_flushing);
        for id in flushing.drain(..) {
            let waiters = match self.state_mut(id) {
                Some(state) => std::mem::take(&mut state.completion_waiters),
                None => continue,
            };
            for waiter in waiters {
                self.fire_waiter(waiter, id);
            }
            // Drop the keep-alive reference transferred to the queue entry
            let _ = self.release_ref(id);
        }
        self.deferred_flushing = flushing;

        self.in_tick = false;
    }

    /// Blocking drain: ticks the manager until the operation completes. Fails
    /// explicitly when the configuration forbids synchronous waits or when called from
    /// inside a tick, rather than hanging or recursing.
    pub fn wait_for_completion(
        &mut self,
        handle: &Handle,
    ) -> Result<OperationStatus, LoadError> {
        if !self.config.allow_synchronous_wait || self.in_tick {
            return Err(LoadError::SynchronousWaitUnsupported);
        }
        loop {
            let state = self.state(handle.id()).ok_or(LoadError::InvalidHandle)?;
            if state.is_done() {
                return Ok(state.status);
            }
            let has_executed = state.has_executed;
            let dependency = state.dependency.clone();
            if !has_executed {
                // Force the dependency chain to completion so this operation can run
                // now instead of waiting for its deferred wakeup
                if let Some(dependency) = dependency {
                    self.wait_for_completion(&dependency)?;
                }
                self.execute(handle.id());
            }
            self.tick(0.0);
        }
    }

    //
    // Internals
    //

    fn state(
        &self,
        id: OperationId,
    ) -> Option<&OperationState> {
        let slot = self.slots.get(id.index as usize)?;
        if slot.version != id.version {
            return None;
        }
        slot.state.as_ref()
    }

    fn state_mut(
        &mut self,
        id: OperationId,
    ) -> Option<&mut OperationState> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.version != id.version {
            return None;
        }
        slot.state.as_mut()
    }

    fn emit_diagnostics(
        &self,
        kind: DiagnosticsEventKind,
        operation: OperationId,
        ref_count: u32,
    ) {
        if let Some(hook) = &self.diagnostics {
            (hook)(&DiagnosticsEvent {
                kind,
                operation,
                ref_count,
            });
        }
    }

    fn find_provider(
        &mut self,
        location: &ResourceLocation,
        requested_type: TypeId,
    ) -> Option<usize> {
        let key = (location.provider_id().to_string(), requested_type);
        if let Some(cached) = self.provider_lookup.get(&key) {
            return *cached;
        }
        let found = self.providers.iter().position(|provider| {
            provider.provider_id() == location.provider_id()
                && provider.can_provide(requested_type, location)
        });
        self.provider_lookup.insert(key, found);
        found
    }

    fn allocate_operation(
        &mut self,
        payload: OperationPayload,
        location: Option<Arc<ResourceLocation>>,
        debug_name: Option<Arc<String>>,
        cache_key: Option<CacheKey>,
        release_dependencies_on_failure: bool,
    ) -> Handle {
        let kind = payload.kind();
        let mut state = self
            .pool
            .acquire(kind)
            .map(|pooled| pooled.0)
            .unwrap_or_else(|| OperationState::new(OperationPayload::Completed));
        state.payload = payload;
        state.location = location;
        state.debug_name = debug_name.or_else(|| {
            state
                .location
                .as_ref()
                .map(|location| Arc::new(location.internal_id().to_string()))
        });
        state.cache_key = cache_key;
        state.release_dependencies_on_failure = release_dependencies_on_failure;
        let handle_debug_name = state.debug_name.clone();

        let index = self.free_slots.pop().unwrap_or_else(|| {
            self.slots.push(Slot {
                version: 1,
                state: None,
            });
            (self.slots.len() - 1) as u32
        });
        let slot = &mut self.slots[index as usize];
        debug_assert!(slot.state.is_none());
        slot.state = Some(state);
        let id = OperationId {
            index,
            version: slot.version,
        };

        log::debug!("allocate operation {:?} {:?}", id, handle_debug_name);
        self.emit_diagnostics(DiagnosticsEventKind::Created, id, 1);
        Handle::new(id, handle_debug_name)
    }

    fn acquire_ref(
        &mut self,
        id: OperationId,
    ) {
        let state = self
            .state_mut(id)
            .expect("acquire_ref on a dead operation");
        state.ref_count += 1;
        let ref_count = state.ref_count;
        self.emit_diagnostics(DiagnosticsEventKind::RefCountChanged, id, ref_count);
    }

    fn release_ref(
        &mut self,
        id: OperationId,
    ) -> Result<(), LoadError> {
        let Some(state) = self.state_mut(id) else {
            return Err(LoadError::InvalidHandle);
        };
        assert!(state.ref_count > 0, "release on an operation with no refs");
        state.ref_count -= 1;
        let ref_count = state.ref_count;
        self.emit_diagnostics(DiagnosticsEventKind::RefCountChanged, id, ref_count);
        if ref_count == 0 {
            self.destroy(id);
        }
        Ok(())
    }

    fn start(
        &mut self,
        id: OperationId,
        dependency: Option<Handle>,
    ) {
        {
            let state = self.state_mut(id).expect("start on a dead operation");
            state.is_running = true;
            state.dependency = dependency.clone();
        }
        // Keep-alive while in flight; dropped when the completion is flushed
        self.acquire_ref(id);

        match dependency {
            Some(dependency)
                if self.state(dependency.id()).is_some() && !self.is_done(&dependency) =>
            {
                self.add_waiter(dependency.id(), Waiter::Execute(id));
            }
            _ => self.execute(id),
        }
    }

    fn execute(
        &mut self,
        id: OperationId,
    ) {
        let Some(state) = self.state_mut(id) else {
            return;
        };
        if state.has_executed || state.is_done() {
            return;
        }
        state.has_executed = true;
        let kind = state.payload.kind();
        match kind {
            PayloadKind::Provider => self.execute_provider(id),
            PayloadKind::Group => self.execute_group(id),
            PayloadKind::Chain => self.execute_chain(id),
            PayloadKind::Completed => {}
        }
    }

    fn execute_provider(
        &mut self,
        id: OperationId,
    ) {
        let (location, requested_type, provider_index, provide_version, wants_update, dependency) = {
            let state = self.state(id).unwrap();
            let OperationPayload::Provider(provider_op) = &state.payload else {
                unreachable!()
            };
            (
                state
                    .location
                    .clone()
                    .expect("provider operation without a location"),
                provider_op.requested_type,
                provider_op.provider_index,
                provider_op.provide_version,
                provider_op.wants_update,
                state.dependency.clone(),
            )
        };

        // A failed dependency fails this operation without ever invoking the provider
        if let Some(dependency) = &dependency {
            let dependency_failed = self
                .state(dependency.id())
                .map(|state| state.status == OperationStatus::Failed)
                .unwrap_or(true);
            if dependency_failed {
                let source = self
                    .state(dependency.id())
                    .and_then(|state| state.error.clone())
                    .unwrap_or(LoadError::InvalidHandle);
                self.complete_op(
                    id,
                    None,
                    OperationStatus::Failed,
                    Some(LoadError::DependencyFailed {
                        context: location.internal_id().to_string(),
                        source: Box::new(source),
                    }),
                );
                return;
            }
        }

        if wants_update {
            self.update_receivers_pending_add.push(id);
        }

        log::debug!(
            "execute provider operation {:?} for '{}'",
            id,
            location.internal_id()
        );
        let provide_handle = ProvideHandle::new(
            self.events_tx.clone(),
            id,
            provide_version,
            location.clone(),
            requested_type,
        );
        let provide_result = self.providers[provider_index].provide(provide_handle);
        if let Err(error) = provide_result {
            log::error!(
                "provider '{}' failed for '{}': {}",
                location.provider_id(),
                location.internal_id(),
                error
            );
            self.complete_op(
                id,
                None,
                OperationStatus::Failed,
                Some(LoadError::ProviderFailed {
                    location: location.internal_id().to_string(),
                    message: error.to_string(),
                }),
            );
        }
    }

    fn execute_group(
        &mut self,
        id: OperationId,
    ) {
        let children: Vec<Handle> = {
            let state = self.state(id).unwrap();
            let OperationPayload::Group(group) = &state.payload else {
                unreachable!()
            };
            group.children.clone()
        };

        let mut already_done = 0;
        for child in &children {
            if self.state(child.id()).map(|s| s.is_done()).unwrap_or(true) {
                already_done += 1;
            } else {
                self.add_waiter(child.id(), Waiter::GroupChild { group: id });
            }
        }

        let complete_now = {
            let state = self.state_mut(id).unwrap();
            let OperationPayload::Group(group) = &mut state.payload else {
                unreachable!()
            };
            group.loaded_count += already_done;
            group.loaded_count == group.children.len()
        };
        if complete_now {
            self.complete_group(id);
        }
    }

    fn execute_chain(
        &mut self,
        id: OperationId,
    ) {
        let dependency = self
            .state(id)
            .unwrap()
            .dependency
            .clone()
            .expect("chain operation without a dependency");

        let dependency_error = match self.state(dependency.id()) {
            Some(state) if state.status == OperationStatus::Failed => Some(
                state
                    .error
                    .clone()
                    .unwrap_or(LoadError::InvalidHandle),
            ),
            Some(_) => None,
            None => Some(LoadError::InvalidHandle),
        };

        if let Some(source) = dependency_error {
            // The callback is never invoked when the first stage failed
            let context = {
                let state = self.state_mut(id).unwrap();
                let OperationPayload::Chain(chain) = &mut state.payload else {
                    unreachable!()
                };
                chain.callback = None;
                state.describe()
            };
            self.complete_op(
                id,
                None,
                OperationStatus::Failed,
                Some(LoadError::DependencyFailed {
                    context,
                    source: Box::new(source),
                }),
            );
            return;
        }

        let callback = {
            let state = self.state_mut(id).unwrap();
            let OperationPayload::Chain(chain) = &mut state.payload else {
                unreachable!()
            };
            chain.callback.take().expect("chain executed twice")
        };

        // The callback may itself issue loads; it runs with full manager access
        let second = (callback)(self, dependency);

        let second_valid = self.state(second.id()).is_some();
        {
            let state = self.state_mut(id).unwrap();
            let OperationPayload::Chain(chain) = &mut state.payload else {
                unreachable!()
            };
            chain.second = Some(second.clone());
        }

        if second_valid {
            self.add_waiter(second.id(), Waiter::ChainSecondStage { chain: id });
        } else {
            let context = self.state(id).unwrap().describe();
            self.complete_op(
                id,
                None,
                OperationStatus::Failed,
                Some(LoadError::DependencyFailed {
                    context,
                    source: Box::new(LoadError::InvalidHandle),
                }),
            );
        }
    }

    fn group_child_completed(
        &mut self,
        group: OperationId,
    ) {
        let complete_now = {
            let Some(state) = self.state_mut(group) else {
                return;
            };
            if state.is_done() {
                return;
            }
            let OperationPayload::Group(group_op) = &mut state.payload else {
                unreachable!()
            };
            group_op.loaded_count += 1;
            group_op.loaded_count == group_op.children.len()
        };
        if complete_now {
            self.complete_group(group);
        }
    }

    fn complete_group(
        &mut self,
        id: OperationId,
    ) {
        let (children, allow_failed, release_on_failure) = {
            let state = self.state(id).unwrap();
            let OperationPayload::Group(group) = &state.payload else {
                unreachable!()
            };
            (
                group.children.clone(),
                group.allow_failed_dependencies,
                state.release_dependencies_on_failure,
            )
        };

        let mut first_failed: Option<(Handle, LoadError)> = None;
        for child in &children {
            match self.state(child.id()) {
                Some(state) if state.status == OperationStatus::Failed => {
                    if first_failed.is_none() {
                        first_failed = Some((
                            child.clone(),
                            state.error.clone().unwrap_or(LoadError::InvalidHandle),
                        ));
                    }
                }
                Some(_) => {}
                None => {
                    if first_failed.is_none() {
                        first_failed = Some((child.clone(), LoadError::InvalidHandle));
                    }
                }
            }
        }

        match first_failed {
            Some((failed_child, source)) if !allow_failed => {
                let context = failed_child
                    .debug_name()
                    .map(|name| (**name).clone())
                    .unwrap_or_else(|| format!("{:?}", failed_child.id()));
                if release_on_failure {
                    // Release every child regardless of its individual status, and
                    // forget them so destroy doesn't release twice
                    let children = {
                        let state = self.state_mut(id).unwrap();
                        let OperationPayload::Group(group) = &mut state.payload else {
                            unreachable!()
                        };
                        std::mem::take(&mut group.children)
                    };
                    for child in children {
                        let _ = self.release_ref(child.id());
                    }
                }
                self.complete_op(
                    id,
                    None,
                    OperationStatus::Failed,
                    Some(LoadError::DependencyFailed {
                        context,
                        source: Box::new(source),
                    }),
                );
            }
            _ => {
                self.complete_op(
                    id,
                    Some(ResultValue::Handles(children)),
                    OperationStatus::Succeeded,
                    None,
                );
            }
        }
    }

    fn chain_second_completed(
        &mut self,
        chain: OperationId,
    ) {
        let Some(state) = self.state(chain) else {
            return;
        };
        if state.is_done() {
            return;
        }
        let OperationPayload::Chain(chain_op) = &state.payload else {
            unreachable!()
        };
        let second = chain_op.second.clone().expect("chain stage two without a handle");

        let second_error = match self.state(second.id()) {
            Some(state) if state.status == OperationStatus::Succeeded => None,
            Some(state) => Some(state.error.clone().unwrap_or(LoadError::InvalidHandle)),
            None => Some(LoadError::InvalidHandle),
        };

        match second_error {
            None => {
                self.complete_op(
                    chain,
                    Some(ResultValue::Forward(second)),
                    OperationStatus::Succeeded,
                    None,
                );
            }
            Some(source) => {
                let context = self.state(chain).unwrap().describe();
                self.complete_op(
                    chain,
                    None,
                    OperationStatus::Failed,
                    Some(LoadError::DependencyFailed {
                        context,
                        source: Box::new(source),
                    }),
                );
            }
        }
    }

    /// Idempotent: the first completion wins, later calls are ignored. If listeners
    /// are subscribed the notification is deferred to the next flush; the in-flight
    /// keep-alive reference is either transferred to the queue entry or dropped here.
    fn complete_op(
        &mut self,
        id: OperationId,
        result: Option<ResultValue>,
        status: OperationStatus,
        error: Option<LoadError>,
    ) {
        debug_assert!(status.is_done());
        let evict_failed = self.config.release_failed_from_cache;

        let Some(state) = self.state_mut(id) else {
            return;
        };
        if state.is_done() {
            log::debug!("operation {:?} already complete, ignoring", id);
            return;
        }
        let was_running = state.is_running;
        state.is_running = false;
        state.status = status;
        state.result = result;
        state.error = error;

        let describe = state.describe();
        let failed = status == OperationStatus::Failed;
        let mut to_release: Vec<Handle> = Vec::default();
        if failed && state.release_dependencies_on_failure {
            if let Some(dependency) = state.dependency.take() {
                to_release.push(dependency);
            }
            if let OperationPayload::Chain(chain) = &mut state.payload {
                if let Some(second) = chain.second.take() {
                    to_release.push(second);
                }
            }
        }
        let stop_updates = matches!(&state.payload, OperationPayload::Provider(p) if p.wants_update);
        let cache_key = if failed && evict_failed {
            state.cache_key.take()
        } else {
            None
        };
        let has_waiters = !state.completion_waiters.is_empty();
        let ref_count = state.ref_count;

        log::debug!("operation {:?} '{}' completed {:?}", id, describe, status);
        self.emit_diagnostics(
            if failed {
                DiagnosticsEventKind::Failed
            } else {
                DiagnosticsEventKind::Completed
            },
            id,
            ref_count,
        );

        if stop_updates {
            self.update_receivers_pending_remove.push(id);
        }

        // A failed cached operation leaves the cache immediately so the key can be
        // retried; anything already holding a reference keeps it
        if let Some(cache_key) = cache_key {
            if self.cache.get(&cache_key) == Some(&id) {
                self.cache.remove(&cache_key);
            }
        }

        for handle in to_release {
            let _ = self.release_ref(handle.id());
        }

        if has_waiters {
            if !was_running {
                // Never started, so there is no keep-alive to transfer; take one for
                // the queue entry
                self.acquire_ref(id);
            }
            self.deferred.push(id);
        } else if was_running {
            let _ = self.release_ref(id);
        }
    }

    /// Subscribes a continuation to `target`'s completion. Subscribing to an
    /// already-complete operation queues a deferred notification for the next flush
    /// rather than firing synchronously.
    fn add_waiter(
        &mut self,
        target: OperationId,
        waiter: Waiter,
    ) {
        let Some(state) = self.state_mut(target) else {
            debug_assert!(false, "add_waiter on a dead operation");
            return;
        };
        let was_done = state.is_done();
        state.completion_waiters.push(waiter);
        if was_done {
            self.acquire_ref(target);
            self.deferred.push(target);
        }
    }

    fn fire_waiter(
        &mut self,
        waiter: Waiter,
        source: OperationId,
    ) {
        match waiter {
            Waiter::Execute(dependent) => self.execute(dependent),
            Waiter::GroupChild { group } => self.group_child_completed(group),
            Waiter::ChainSecondStage { chain } => self.chain_second_completed(chain),
            Waiter::Listener(callback) => {
                let debug_name = self
                    .state(source)
                    .and_then(|state| state.debug_name.clone());
                (callback)(self, Handle::new(source, debug_name));
            }
        }
    }

    fn download_status_recursive(
        &self,
        id: OperationId,
        visited: &mut HashSet<OperationId>,
    ) -> DownloadStatus {
        let counted_elsewhere = DownloadStatus {
            downloaded_bytes: 0,
            total_bytes: 0,
            is_done: true,
        };
        if !visited.insert(id) {
            return counted_elsewhere;
        }
        let Some(state) = self.state(id) else {
            return counted_elsewhere;
        };

        let mut status = DownloadStatus {
            downloaded_bytes: 0,
            total_bytes: 0,
            is_done: state.is_done(),
        };
        match &state.payload {
            OperationPayload::Provider(provider_op) => {
                status.downloaded_bytes += provider_op.downloaded_bytes;
                status.total_bytes += provider_op.total_bytes;
            }
            OperationPayload::Group(group) => {
                for child in &group.children {
                    status.combine(self.download_status_recursive(child.id(), visited));
                }
            }
            OperationPayload::Chain(chain) => {
                if let Some(second) = &chain.second {
                    status.combine(self.download_status_recursive(second.id(), visited));
                }
            }
            OperationPayload::Completed => {}
        }
        if let Some(dependency) = &state.dependency {
            status.combine(self.download_status_recursive(dependency.id(), visited));
        }
        status
    }

    fn handle_engine_event(
        &mut self,
        event: EngineEvent,
    ) {
        match event {
            EngineEvent::ProvideSucceeded {
                operation,
                provide_version,
                result,
            } => {
                let Some((requested_type, wants_update)) =
                    self.validate_provide_event(operation, provide_version)
                else {
                    return;
                };
                if wants_update {
                    self.update_receivers_pending_remove.push(operation);
                }
                // The provider's product must actually be the requested type; a
                // mismatch is an explicit failure, not a silent cast
                if (*result).type_id() == requested_type {
                    self.complete_op(
                        operation,
                        Some(ResultValue::Value(result)),
                        OperationStatus::Succeeded,
                        None,
                    );
                } else {
                    let location = self
                        .state(operation)
                        .map(|state| state.describe())
                        .unwrap_or_default();
                    log::error!(
                        "provider produced a value of an unexpected type for '{}'",
                        location
                    );
                    self.complete_op(
                        operation,
                        None,
                        OperationStatus::Failed,
                        Some(LoadError::TypeMismatch { location }),
                    );
                }
            }
            EngineEvent::ProvideFailed {
                operation,
                provide_version,
                error,
            } => {
                let Some((_, wants_update)) =
                    self.validate_provide_event(operation, provide_version)
                else {
                    return;
                };
                if wants_update {
                    self.update_receivers_pending_remove.push(operation);
                }
                self.complete_op(operation, None, OperationStatus::Failed, Some(error));
            }
            EngineEvent::ProvideProgress {
                operation,
                provide_version,
                downloaded_bytes,
                total_bytes,
            } => {
                if let Some(state) = self.state_mut(operation) {
                    if let OperationPayload::Provider(provider_op) = &mut state.payload {
                        if provider_op.provide_version == provide_version {
                            provider_op.downloaded_bytes = downloaded_bytes;
                            provider_op.total_bytes = total_bytes;
                        }
                    }
                }
            }
        }
    }

    /// Checks an incoming provider completion against the operation's current provide
    /// version and bumps it. A completion for a destroyed operation, a recycled slot
    /// or a superseded provide attempt is discarded here.
    fn validate_provide_event(
        &mut self,
        operation: OperationId,
        provide_version: u32,
    ) -> Option<(TypeId, bool)> {
        let Some(state) = self.state_mut(operation) else {
            log::debug!(
                "discarding stale provider completion for {:?} (operation gone)",
                operation
            );
            return None;
        };
        let OperationPayload::Provider(provider_op) = &mut state.payload else {
            log::debug!(
                "discarding provider completion for non-provider operation {:?}",
                operation
            );
            return None;
        };
        if provider_op.provide_version != provide_version {
            log::debug!(
                "discarding stale provider completion for {:?} (version {} != {})",
                operation,
                provide_version,
                provider_op.provide_version
            );
            return None;
        }
        provider_op.provide_version = provider_op.provide_version.wrapping_add(1);
        Some((provider_op.requested_type, provider_op.wants_update))
    }

    fn create_dependency_group(
        &mut self,
        children: Vec<Handle>,
    ) -> Handle {
        let ids: Arc<[OperationId]> = children.iter().map(|child| child.id()).collect();
        let key = CacheKey::DependencyGroup(ids);
        if let Some(&existing) = self.cache.get(&key) {
            if let Some(state) = self.state(existing) {
                let handle = Handle::new(existing, state.debug_name.clone());
                self.acquire_ref(existing);
                // The existing group already owns its own child references; give back
                // the ones taken while resolving
                for child in children {
                    let _ = self.release_ref(child.id());
                }
                return handle;
            }
            self.cache.remove(&key);
        }
        let handle = self.group_internal(children, GroupOptions::default(), Some(key.clone()));
        self.cache.insert(key, handle.id());
        handle
    }

    fn group_internal(
        &mut self,
        children: Vec<Handle>,
        options: GroupOptions,
        cache_key: Option<CacheKey>,
    ) -> Handle {
        let payload = OperationPayload::Group(GroupOperation {
            children,
            loaded_count: 0,
            allow_failed_dependencies: options.allow_failed_dependencies,
        });
        let handle = self.allocate_operation(
            payload,
            None,
            None,
            cache_key,
            options.release_dependencies_on_failure,
        );
        self.start(handle.id(), None);
        handle
    }

    /// Destroy sequence: destroyed listeners fire, held handles are released, the
    /// cache entry is removed, and the zeroed instance goes back to the pool with the
    /// slot's version bumped so outstanding handles become stale.
    fn destroy(
        &mut self,
        id: OperationId,
    ) {
        let (listeners, debug_name) = {
            let Some(state) = self.state_mut(id) else {
                return;
            };
            debug_assert_eq!(state.ref_count, 0);
            (
                std::mem::take(&mut state.destroyed_listeners),
                state.debug_name.clone(),
            )
        };
        log::debug!("destroy operation {:?} {:?}", id, debug_name);
        for listener in listeners {
            (listener)(self, Handle::new(id, debug_name.clone()));
        }

        let slot = &mut self.slots[id.index as usize];
        let mut state = slot.state.take().expect("destroy on an empty slot");
        slot.version = slot.version.wrapping_add(1);
        self.free_slots.push(id.index);

        if let Some(cache_key) = state.cache_key.take() {
            if self.cache.get(&cache_key) == Some(&id) {
                self.cache.remove(&cache_key);
            }
        }
        self.update_receivers_pending_remove.push(id);

        let mut to_release: Vec<Handle> = Vec::default();
        if let Some(dependency) = state.dependency.take() {
            to_release.push(dependency);
        }
        match &mut state.payload {
            OperationPayload::Provider(provider_op) => {
                // Invalidate any provide handle still held by the provider
                provider_op.provide_version = provider_op.provide_version.wrapping_add(1);
            }
            OperationPayload::Group(group) => {
                to_release.append(&mut group.children);
            }
            OperationPayload::Chain(chain) => {
                if let Some(second) = chain.second.take() {
                    to_release.push(second);
                }
            }
            OperationPayload::Completed => {}
        }

        self.emit_diagnostics(DiagnosticsEventKind::Destroyed, id, 0);

        let kind = state.payload.kind();
        state.reset();
        self.pool.release(kind, PooledOperation(state));

        // Held handles are released last; this can destroy further operations
        for handle in to_release {
            let _ = self.release_ref(handle.id());
        }
    }
}
