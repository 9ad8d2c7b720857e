use crate::manager::EngineEvent;
use crossbeam_channel::Sender;
use lodestone_base::{LoadError, OperationId, ResourceLocation};
use std::any::{Any, TypeId};
use std::error::Error;
use std::sync::Arc;

/// External capability that performs the actual load for a location. Providers are
/// registered with the manager and looked up by `(provider_id, requested type)`.
///
/// `provide` must arrange for the [`ProvideHandle`] to be completed exactly once. A
/// provider may do that synchronously before returning, or hold the handle and
/// complete it later (including from another thread; the handle marshals the result
/// back onto the tick thread). Returning an `Err` from `provide` is reported as a
/// failed completion; it never unwinds into the caller.
pub trait Provider {
    fn provider_id(&self) -> &str;

    fn can_provide(
        &self,
        requested_type: TypeId,
        location: &ResourceLocation,
    ) -> bool;

    fn provide(
        &self,
        provide_handle: ProvideHandle,
    ) -> Result<(), Box<dyn Error>>;

    /// Providers that poll an external source can opt into a per-tick pump. The
    /// manager calls `update` once per tick for every in-flight operation bound to
    /// this provider.
    fn needs_update(&self) -> bool {
        false
    }

    fn update(
        &self,
        _delta_time: f32,
    ) {
    }
}

/// Completion token handed to a provider. Completing or failing consumes the token and
/// sends the outcome back to the manager's tick thread; dropping it without doing
/// either is detected and reported as a provider failure, so a buggy provider cannot
/// leave an operation in flight forever.
pub struct ProvideHandle {
    sender: Option<Sender<EngineEvent>>,
    operation: OperationId,
    provide_version: u32,
    location: Arc<ResourceLocation>,
    requested_type: TypeId,
}

impl ProvideHandle {
    pub(crate) fn new(
        sender: Sender<EngineEvent>,
        operation: OperationId,
        provide_version: u32,
        location: Arc<ResourceLocation>,
        requested_type: TypeId,
    ) -> Self {
        ProvideHandle {
            sender: Some(sender),
            operation,
            provide_version,
            location,
            requested_type,
        }
    }

    pub fn location(&self) -> &ResourceLocation {
        &self.location
    }

    pub fn requested_type(&self) -> TypeId {
        self.requested_type
    }

    /// Reports download progress for aggregation; safe to call repeatedly while the
    /// request is in flight.
    pub fn report_progress(
        &self,
        downloaded_bytes: u64,
        total_bytes: u64,
    ) {
        if let Some(sender) = &self.sender {
            let _ = sender.send(EngineEvent::ProvideProgress {
                operation: self.operation,
                provide_version: self.provide_version,
                downloaded_bytes,
                total_bytes,
            });
        }
    }

    /// Signals that the load succeeded. The value's runtime type is validated against
    /// the requested type on the tick thread before the operation completes.
    pub fn complete<T: Any + Send>(
        mut self,
        value: T,
    ) {
        log::debug!("provide complete for {:?}", self.operation);
        let _ = self
            .sender
            .take()
            .unwrap()
            .send(EngineEvent::ProvideSucceeded {
                operation: self.operation,
                provide_version: self.provide_version,
                result: Box::new(value),
            });
    }

    /// Signals that the load failed.
    pub fn error<E: Error>(
        mut self,
        error: E,
    ) {
        log::debug!("provide error for {:?}: {}", self.operation, error);
        let message = error.to_string();
        let location = self.location.internal_id().to_string();
        let _ = self
            .sender
            .take()
            .unwrap()
            .send(EngineEvent::ProvideFailed {
                operation: self.operation,
                provide_version: self.provide_version,
                error: LoadError::ProviderFailed { location, message },
            });
    }
}

impl Drop for ProvideHandle {
    fn drop(&mut self) {
        if let Some(sender) = self.sender.take() {
            log::error!(
                "provide handle for {:?} dropped without calling complete/error",
                self.operation
            );
            let _ = sender.send(EngineEvent::ProvideFailed {
                operation: self.operation,
                provide_version: self.provide_version,
                error: LoadError::ProviderFailed {
                    location: self.location.internal_id().to_string(),
                    message: "provider dropped the provide handle without completing".to_string(),
                },
            });
        }
    }
}
