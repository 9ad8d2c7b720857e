use crate::manager::{CacheKey, ResourceManager};
use lodestone_base::{Handle, LoadError, OperationId, OperationStatus};
use std::any::{Any, TypeId};
use std::sync::Arc;

use lodestone_base::ResourceLocation;

/// What an operation produced. Group operations own their child handles and expose
/// them as the result; chain operations complete by forwarding to the second-stage
/// handle so the payload never has to be cloned out of the inner operation.
pub(crate) enum ResultValue {
    Value(Box<dyn Any + Send>),
    Handles(Vec<Handle>),
    Forward(Handle),
}

/// A continuation subscribed to an operation's completion. Internal wiring (dependency
/// wakeups, group joins, chain stages) is enum-coded so it can be fired with `&mut
/// ResourceManager`; user callbacks ride along as boxed closures.
pub(crate) enum Waiter {
    /// `start()` subscribed a dependent operation's `execute` to this completion
    Execute(OperationId),
    /// A group is waiting on this child
    GroupChild { group: OperationId },
    /// A chain is waiting on its second-stage handle
    ChainSecondStage { chain: OperationId },
    /// User completion listener
    Listener(Box<dyn FnOnce(&mut ResourceManager, Handle)>),
}

pub(crate) struct ProviderOperation {
    pub provider_index: usize,
    pub requested_type: TypeId,
    /// Incremented every time the provider signals completion (and on destroy), so a
    /// late completion from a provider whose operation has moved on is discarded.
    pub provide_version: u32,
    pub downloaded_bytes: u64,
    pub total_bytes: u64,
    pub wants_update: bool,
}

pub(crate) struct GroupOperation {
    pub children: Vec<Handle>,
    pub loaded_count: usize,
    pub allow_failed_dependencies: bool,
}

pub(crate) struct ChainOperation {
    pub callback: Option<Box<dyn FnOnce(&mut ResourceManager, Handle) -> Handle>>,
    pub second: Option<Handle>,
}

pub(crate) enum OperationPayload {
    Provider(ProviderOperation),
    Group(GroupOperation),
    Chain(ChainOperation),
    Completed,
}

impl OperationPayload {
    pub fn kind(&self) -> crate::pool::PayloadKind {
        match self {
            OperationPayload::Provider(_) => crate::pool::PayloadKind::Provider,
            OperationPayload::Group(_) => crate::pool::PayloadKind::Group,
            OperationPayload::Chain(_) => crate::pool::PayloadKind::Chain,
            OperationPayload::Completed => crate::pool::PayloadKind::Completed,
        }
    }
}

/// Per-slot state for one live operation. Owned by the manager's arena; external code
/// only ever sees `Handle`s pointing at a slot.
pub(crate) struct OperationState {
    pub ref_count: u32,
    pub status: OperationStatus,
    pub result: Option<ResultValue>,
    pub error: Option<LoadError>,
    pub is_running: bool,
    pub has_executed: bool,
    pub release_dependencies_on_failure: bool,
    pub dependency: Option<Handle>,
    pub cache_key: Option<CacheKey>,
    pub completion_waiters: Vec<Waiter>,
    pub destroyed_listeners: Vec<Box<dyn FnOnce(&mut ResourceManager, Handle)>>,
    pub payload: OperationPayload,
    pub location: Option<Arc<ResourceLocation>>,
    pub debug_name: Option<Arc<String>>,
}

impl OperationState {
    pub fn new(payload: OperationPayload) -> Self {
        OperationState {
            ref_count: 1,
            status: OperationStatus::None,
            result: None,
            error: None,
            is_running: false,
            has_executed: false,
            release_dependencies_on_failure: true,
            dependency: None,
            cache_key: None,
            completion_waiters: Vec::default(),
            destroyed_listeners: Vec::default(),
            payload,
            location: None,
            debug_name: None,
        }
    }

    pub fn is_done(&self) -> bool {
        self.status.is_done()
    }

    /// Name used in log lines and wrapped errors.
    pub fn describe(&self) -> String {
        if let Some(debug_name) = &self.debug_name {
            (**debug_name).clone()
        } else if let Some(location) = &self.location {
            location.internal_id().to_string()
        } else {
            "<unnamed operation>".to_string()
        }
    }

    /// Clears everything back to the just-constructed shape, keeping list allocations
    /// so a recycled operation does not reallocate. Callers must have released any
    /// handles held by the payload first.
    pub fn reset(&mut self) {
        self.ref_count = 1;
        self.status = OperationStatus::None;
        self.result = None;
        self.error = None;
        self.is_running = false;
        self.has_executed = false;
        self.release_dependencies_on_failure = true;
        self.dependency = None;
        self.cache_key = None;
        self.completion_waiters.clear();
        self.destroyed_listeners.clear();
        self.location = None;
        self.debug_name = None;
        match &mut self.payload {
            OperationPayload::Provider(provider) => {
                provider.provide_version = provider.provide_version.wrapping_add(1);
                provider.downloaded_bytes = 0;
                provider.total_bytes = 0;
                provider.wants_update = false;
            }
            OperationPayload::Group(group) => {
                group.children.clear();
                group.loaded_count = 0;
                group.allow_failed_dependencies = false;
            }
            OperationPayload::Chain(chain) => {
                chain.callback = None;
                chain.second = None;
            }
            OperationPayload::Completed => {}
        }
    }
}
