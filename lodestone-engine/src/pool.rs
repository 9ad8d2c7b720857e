use crate::operation::OperationState;
use lodestone_base::hashing::HashMap;

/// Concrete operation type, used to bucket recycled instances.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum PayloadKind {
    Provider,
    Group,
    Chain,
    Completed,
}

/// An operation instance that has been torn down and is eligible for reuse. Opaque to
/// pool implementations; they only store and return it.
pub struct PooledOperation(pub(crate) OperationState);

/// Pluggable recycler for operation instances. The manager asks `acquire` for a
/// previously-released instance of the right concrete type before constructing a new
/// one, and hands destroyed instances back through `release`. Implementations may keep
/// everything, nothing, or a bounded amount.
pub trait PoolPolicy {
    fn acquire(
        &mut self,
        kind: PayloadKind,
    ) -> Option<PooledOperation>;

    fn release(
        &mut self,
        kind: PayloadKind,
        operation: PooledOperation,
    );
}

/// Default policy: keep every released instance on a per-type free list.
#[derive(Default)]
pub struct FreeListPool {
    free: HashMap<PayloadKind, Vec<PooledOperation>>,
}

impl PoolPolicy for FreeListPool {
    fn acquire(
        &mut self,
        kind: PayloadKind,
    ) -> Option<PooledOperation> {
        self.free.get_mut(&kind).and_then(|list| list.pop())
    }

    fn release(
        &mut self,
        kind: PayloadKind,
        operation: PooledOperation,
    ) {
        self.free.entry(kind).or_default().push(operation);
    }
}

/// Keeps at most `max_per_kind` released instances per concrete type, dropping the
/// rest. Useful when a load spike shouldn't pin its peak allocation forever.
pub struct BoundedPool {
    max_per_kind: usize,
    free: HashMap<PayloadKind, Vec<PooledOperation>>,
}

impl BoundedPool {
    pub fn new(max_per_kind: usize) -> Self {
        BoundedPool {
            max_per_kind,
            free: HashMap::default(),
        }
    }
}

impl PoolPolicy for BoundedPool {
    fn acquire(
        &mut self,
        kind: PayloadKind,
    ) -> Option<PooledOperation> {
        self.free.get_mut(&kind).and_then(|list| list.pop())
    }

    fn release(
        &mut self,
        kind: PayloadKind,
        operation: PooledOperation,
    ) {
        let list = self.free.entry(kind).or_default();
        if list.len() < self.max_per_kind {
            list.push(operation);
        }
    }
}

/// Never recycles anything; every operation is constructed fresh.
#[derive(Default)]
pub struct NullPool;

impl PoolPolicy for NullPool {
    fn acquire(
        &mut self,
        _kind: PayloadKind,
    ) -> Option<PooledOperation> {
        None
    }

    fn release(
        &mut self,
        _kind: PayloadKind,
        _operation: PooledOperation,
    ) {
    }
}
