use std::fmt::{Debug, Formatter};
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Identifies one incarnation of an operation slot. The index addresses the slot in the
/// manager's arena and the version is bumped every time the slot is recycled, so an id
/// held across a recycle can be detected as stale instead of aliasing the new occupant.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OperationId {
    pub index: u32,
    pub version: u32,
}

impl OperationId {
    pub const fn null() -> Self {
        OperationId {
            index: u32::MAX,
            version: 0,
        }
    }

    pub fn is_null(&self) -> bool {
        self.index == u32::MAX
    }
}

impl Debug for OperationId {
    fn fmt(
        &self,
        f: &mut Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_tuple("OperationId")
            .field(&self.index)
            .field(&self.version)
            .finish()
    }
}

/// Completion state of an operation. `None` combined with a running operation means
/// "in flight"; once the status leaves `None` the operation's result/error are frozen
/// until the slot is recycled.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum OperationStatus {
    None,
    Succeeded,
    Failed,
}

impl OperationStatus {
    pub fn is_done(self) -> bool {
        self != OperationStatus::None
    }
}

/// A cheap, clonable, versioned reference to an operation owned by a
/// `ResourceManager`. A handle is valid only while the operation it was created for is
/// still alive; all manager accessors check this and fail fast on stale handles.
///
/// Cloning a handle does NOT bump the operation's reference count. Use the manager's
/// `acquire`/`release` to take and give up ownership; each acquire must be paired with
/// exactly one release.
#[derive(Clone)]
pub struct Handle {
    id: OperationId,
    debug_name: Option<Arc<String>>,
}

impl Handle {
    pub fn new(
        id: OperationId,
        debug_name: Option<Arc<String>>,
    ) -> Self {
        Handle { id, debug_name }
    }

    pub fn null() -> Self {
        Handle {
            id: OperationId::null(),
            debug_name: None,
        }
    }

    pub fn id(&self) -> OperationId {
        self.id
    }

    pub fn is_null(&self) -> bool {
        self.id.is_null()
    }

    // for debugging/convenience, not actually required
    pub fn debug_name(&self) -> Option<&Arc<String>> {
        self.debug_name.as_ref()
    }
}

// Equality and hashing are over the (index, version) pair only, so a stale handle never
// compares equal to a handle for a different logical operation that reuses the slot.
impl PartialEq for Handle {
    fn eq(
        &self,
        other: &Self,
    ) -> bool {
        self.id == other.id
    }
}

impl Eq for Handle {}

impl Hash for Handle {
    fn hash<H: Hasher>(
        &self,
        state: &mut H,
    ) {
        self.id.hash(state);
    }
}

impl Debug for Handle {
    fn fmt(
        &self,
        f: &mut Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("Handle")
            .field("id", &self.id)
            .field("debug_name", &self.debug_name)
            .finish()
    }
}
