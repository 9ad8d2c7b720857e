use lodestone_base::OperationId;

/// Lifecycle notifications for external profiling/debug tooling. Purely
/// observational; nothing in the engine depends on a hook being installed, and a hook
/// must never be used for control flow.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum DiagnosticsEventKind {
    Created,
    Completed,
    Failed,
    RefCountChanged,
    Destroyed,
}

#[derive(Debug)]
pub struct DiagnosticsEvent {
    pub kind: DiagnosticsEventKind,
    pub operation: OperationId,
    pub ref_count: u32,
}

pub type DiagnosticsHook = Box<dyn Fn(&DiagnosticsEvent)>;
