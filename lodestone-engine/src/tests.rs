use crate::manager::{GroupOptions, ManagerConfig, ResourceManager};
use crate::provider::{ProvideHandle, Provider};
use lodestone_base::hashing::HashMap;
use lodestone_base::{Handle, LoadError, OperationStatus, ResourceLocation};
use std::any::TypeId;
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::Arc;

fn tick_until_done(
    manager: &mut ResourceManager,
    handle: &Handle,
    max_ticks: usize,
) -> OperationStatus {
    for _ in 0..max_ticks {
        manager.tick(0.0);
        if manager.is_done(handle) {
            return manager.status(handle).unwrap();
        }
    }
    panic!("operation did not complete within {} ticks", max_ticks);
}

/// Serves string contents from a fixed table, completing synchronously. Records which
/// locations it was asked for so tests can assert invocation order and dedup.
struct TextProvider {
    contents: HashMap<String, String>,
    served: Rc<RefCell<Vec<String>>>,
}

impl Provider for TextProvider {
    fn provider_id(&self) -> &str {
        "text"
    }

    fn can_provide(
        &self,
        requested_type: TypeId,
        _location: &ResourceLocation,
    ) -> bool {
        requested_type == TypeId::of::<String>()
    }

    fn provide(
        &self,
        provide_handle: ProvideHandle,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let id = provide_handle.location().internal_id().to_string();
        self.served.borrow_mut().push(id.clone());
        match self.contents.get(&id) {
            Some(text) => provide_handle.complete(text.clone()),
            None => provide_handle.error(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "no such entry",
            )),
        }
        Ok(())
    }
}

fn register_text_provider(
    manager: &mut ResourceManager,
    entries: &[(&str, &str)],
) -> Rc<RefCell<Vec<String>>> {
    let served = Rc::new(RefCell::new(Vec::default()));
    let contents = entries
        .iter()
        .map(|(id, text)| (id.to_string(), text.to_string()))
        .collect();
    manager.register_provider(Box::new(TextProvider {
        contents,
        served: served.clone(),
    }));
    served
}

/// Holds every provide handle it receives so the test decides when and how each
/// operation completes.
struct ManualProvider {
    pending: Rc<RefCell<Vec<ProvideHandle>>>,
}

impl Provider for ManualProvider {
    fn provider_id(&self) -> &str {
        "manual"
    }

    fn can_provide(
        &self,
        _requested_type: TypeId,
        _location: &ResourceLocation,
    ) -> bool {
        true
    }

    fn provide(
        &self,
        provide_handle: ProvideHandle,
    ) -> Result<(), Box<dyn std::error::Error>> {
        self.pending.borrow_mut().push(provide_handle);
        Ok(())
    }
}

fn register_manual_provider(manager: &mut ResourceManager) -> Rc<RefCell<Vec<ProvideHandle>>> {
    let pending = Rc::new(RefCell::new(Vec::default()));
    manager.register_provider(Box::new(ManualProvider {
        pending: pending.clone(),
    }));
    pending
}

/// Completes synchronously but opts into the per-tick pump, counting how often the
/// manager calls `update`.
struct PumpedProvider {
    updates: Rc<Cell<usize>>,
}

impl Provider for PumpedProvider {
    fn provider_id(&self) -> &str {
        "pumped"
    }

    fn can_provide(
        &self,
        requested_type: TypeId,
        _location: &ResourceLocation,
    ) -> bool {
        requested_type == TypeId::of::<String>()
    }

    fn provide(
        &self,
        provide_handle: ProvideHandle,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let id = provide_handle.location().internal_id().to_string();
        provide_handle.complete(id);
        Ok(())
    }

    fn needs_update(&self) -> bool {
        true
    }

    fn update(
        &self,
        _delta_time: f32,
    ) {
        self.updates.set(self.updates.get() + 1);
    }
}

/// Stashes every provide handle and then refuses to start, so the test ends up
/// holding completion tokens for operations that have already failed.
struct DefectiveProvider {
    stashed: Rc<RefCell<Vec<ProvideHandle>>>,
}

impl Provider for DefectiveProvider {
    fn provider_id(&self) -> &str {
        "defective"
    }

    fn can_provide(
        &self,
        _requested_type: TypeId,
        _location: &ResourceLocation,
    ) -> bool {
        true
    }

    fn provide(
        &self,
        provide_handle: ProvideHandle,
    ) -> Result<(), Box<dyn std::error::Error>> {
        self.stashed.borrow_mut().push(provide_handle);
        Err("refused to start".into())
    }
}

struct FailingProvider;

impl Provider for FailingProvider {
    fn provider_id(&self) -> &str {
        "failing"
    }

    fn can_provide(
        &self,
        _requested_type: TypeId,
        _location: &ResourceLocation,
    ) -> bool {
        true
    }

    fn provide(
        &self,
        provide_handle: ProvideHandle,
    ) -> Result<(), Box<dyn std::error::Error>> {
        provide_handle.error(std::io::Error::other("simulated failure"));
        Ok(())
    }
}

fn text_location(id: &str) -> Arc<ResourceLocation> {
    ResourceLocation::new(id, "text", TypeId::of::<String>(), vec![])
}

fn manual_location(id: &str) -> Arc<ResourceLocation> {
    ResourceLocation::new(id, "manual", TypeId::of::<String>(), vec![])
}

fn failing_location(id: &str) -> Arc<ResourceLocation> {
    ResourceLocation::new(id, "failing", TypeId::of::<String>(), vec![])
}

#[test]
fn provide_returns_value() {
    let mut manager = ResourceManager::default();
    register_text_provider(&mut manager, &[("greeting", "hello")]);

    let handle = manager.provide::<String>(&text_location("greeting"));
    assert!(!manager.is_done(&handle));
    assert!(matches!(
        manager.result::<String>(&handle),
        Err(LoadError::NotComplete)
    ));

    let status = tick_until_done(&mut manager, &handle, 10);
    assert_eq!(status, OperationStatus::Succeeded);
    assert_eq!(manager.result::<String>(&handle).unwrap(), "hello");

    manager.release(handle).unwrap();
    assert_eq!(manager.active_operation_count(), 0);
}

#[test]
fn acquire_release_refcounting() {
    let mut manager = ResourceManager::default();
    register_text_provider(&mut manager, &[("greeting", "hello")]);

    let handle = manager.provide::<String>(&text_location("greeting"));
    tick_until_done(&mut manager, &handle, 10);

    let destroyed = Rc::new(Cell::new(0u32));
    let destroyed_clone = destroyed.clone();
    manager
        .on_destroyed(&handle, move |_, _| destroyed_clone.set(destroyed_clone.get() + 1))
        .unwrap();

    let second = manager.acquire(&handle).unwrap();
    let third = manager.acquire(&handle).unwrap();
    assert_eq!(manager.operation_info(&handle).unwrap().ref_count, 3);

    manager.release(second).unwrap();
    manager.release(third).unwrap();
    assert!(manager.is_valid(&handle));
    assert_eq!(destroyed.get(), 0);

    manager.release(handle.clone()).unwrap();
    assert_eq!(destroyed.get(), 1);
    assert!(!manager.is_valid(&handle));
    assert_eq!(manager.active_operation_count(), 0);
}

#[test]
fn identical_requests_share_one_operation() {
    let mut manager = ResourceManager::default();
    let served = register_text_provider(&mut manager, &[("greeting", "hello")]);

    let location = text_location("greeting");
    let first = manager.provide::<String>(&location);
    let second = manager.provide::<String>(&location);
    assert_eq!(first.id(), second.id());

    tick_until_done(&mut manager, &first, 10);
    assert_eq!(served.borrow().len(), 1);

    manager.release(first).unwrap();
    assert!(manager.is_valid(&second));
    manager.release(second).unwrap();
    assert_eq!(manager.active_operation_count(), 0);

    // The cache entry died with the operation; the same request loads fresh
    let third = manager.provide::<String>(&location);
    tick_until_done(&mut manager, &third, 10);
    assert_eq!(served.borrow().len(), 2);
    manager.release(third).unwrap();
}

#[test]
fn stale_handle_does_not_alias_recycled_slot() {
    let mut manager = ResourceManager::default();
    register_text_provider(&mut manager, &[("first", "one"), ("second", "two")]);

    let first = manager.provide::<String>(&text_location("first"));
    tick_until_done(&mut manager, &first, 10);
    manager.release(first.clone()).unwrap();

    // The freed slot is reused for an unrelated operation
    let second = manager.provide::<String>(&text_location("second"));
    assert_eq!(first.id().index, second.id().index);
    assert_ne!(first.id(), second.id());

    assert!(!manager.is_valid(&first));
    assert!(matches!(manager.status(&first), Err(LoadError::InvalidHandle)));
    assert!(matches!(
        manager.result::<String>(&first),
        Err(LoadError::InvalidHandle)
    ));

    tick_until_done(&mut manager, &second, 10);
    assert_eq!(manager.result::<String>(&second).unwrap(), "two");
    manager.release(second).unwrap();
}

#[test]
fn group_preserves_input_order() {
    let mut manager = ResourceManager::default();
    let pending = register_manual_provider(&mut manager);

    let children: Vec<Handle> = (0..3)
        .map(|i| manager.provide::<String>(&manual_location(&format!("m{}", i))))
        .collect();
    let child_ids: Vec<_> = children.iter().map(|c| c.id()).collect();
    let group = manager.create_group(children, GroupOptions::default());

    // Complete out of order; the result order must still follow the input order
    let mut handles: Vec<ProvideHandle> = pending.borrow_mut().drain(..).collect();
    for index in [2, 0, 1] {
        let position = handles
            .iter()
            .position(|h| h.location().internal_id() == format!("m{}", index))
            .unwrap();
        let handle = handles.remove(position);
        let value = format!("value-{}", handle.location().internal_id());
        handle.complete(value);
    }

    let status = tick_until_done(&mut manager, &group, 10);
    assert_eq!(status, OperationStatus::Succeeded);

    let result = manager.group_result(&group).unwrap().to_vec();
    assert_eq!(
        result.iter().map(|h| h.id()).collect::<Vec<_>>(),
        child_ids
    );
    for (i, child) in result.iter().enumerate() {
        assert_eq!(
            manager.result::<String>(child).unwrap(),
            &format!("value-m{}", i)
        );
    }

    manager.release(group).unwrap();
    assert_eq!(manager.active_operation_count(), 0);
}

#[test]
fn group_failure_releases_children() {
    let mut manager = ResourceManager::default();
    register_text_provider(&mut manager, &[("a", "one"), ("b", "two")]);
    manager.register_provider(Box::new(FailingProvider));

    let children = vec![
        manager.provide::<String>(&text_location("a")),
        manager.provide::<String>(&failing_location("bad")),
        manager.provide::<String>(&text_location("b")),
    ];
    let child_handles = children.clone();
    let group = manager.create_group(children, GroupOptions::default());

    let status = tick_until_done(&mut manager, &group, 10);
    assert_eq!(status, OperationStatus::Failed);
    assert!(matches!(
        manager.error(&group),
        Some(LoadError::DependencyFailed { .. })
    ));

    // All children were released by the failing group, succeeded ones included
    for child in &child_handles {
        assert!(!manager.is_valid(child));
    }

    manager.release(group).unwrap();
    assert_eq!(manager.active_operation_count(), 0);
}

#[test]
fn group_can_tolerate_failed_children() {
    let mut manager = ResourceManager::default();
    register_text_provider(&mut manager, &[("a", "one")]);
    manager.register_provider(Box::new(FailingProvider));

    let children = vec![
        manager.provide::<String>(&text_location("a")),
        manager.provide::<String>(&failing_location("bad")),
    ];
    let group = manager.create_group(
        children,
        GroupOptions {
            allow_failed_dependencies: true,
            ..GroupOptions::default()
        },
    );

    let status = tick_until_done(&mut manager, &group, 10);
    assert_eq!(status, OperationStatus::Succeeded);

    let result = manager.group_result(&group).unwrap().to_vec();
    assert_eq!(result.len(), 2);
    assert_eq!(manager.status(&result[0]).unwrap(), OperationStatus::Succeeded);
    assert_eq!(manager.status(&result[1]).unwrap(), OperationStatus::Failed);
    assert!(manager.error(&result[1]).is_some());

    manager.release(group).unwrap();
    assert_eq!(manager.active_operation_count(), 0);
}

#[test]
fn chain_maps_completion() {
    let mut manager = ResourceManager::default();
    register_text_provider(&mut manager, &[("first", "one"), ("second", "two")]);

    let first = manager.provide::<String>(&text_location("first"));
    let chain = manager.create_chain(first, |manager, dependency| {
        // The dependency has completed by the time the callback runs
        assert_eq!(manager.result::<String>(&dependency).unwrap(), "one");
        manager.provide::<String>(&text_location("second"))
    });

    let status = tick_until_done(&mut manager, &chain, 10);
    assert_eq!(status, OperationStatus::Succeeded);
    assert_eq!(manager.result::<String>(&chain).unwrap(), "two");

    manager.release(chain).unwrap();
    assert_eq!(manager.active_operation_count(), 0);
}

#[test]
fn chain_skips_callback_when_dependency_fails() {
    let mut manager = ResourceManager::default();
    manager.register_provider(Box::new(FailingProvider));

    let invoked = Rc::new(Cell::new(false));
    let invoked_clone = invoked.clone();
    let first = manager.provide::<String>(&failing_location("bad"));
    let chain = manager.create_chain(first, move |manager, _| {
        invoked_clone.set(true);
        manager.create_completed(0u32)
    });

    let status = tick_until_done(&mut manager, &chain, 10);
    assert_eq!(status, OperationStatus::Failed);
    assert!(!invoked.get());

    match manager.error(&chain) {
        Some(LoadError::DependencyFailed { source, .. }) => {
            assert!(matches!(**source, LoadError::ProviderFailed { .. }));
        }
        other => panic!("unexpected error {:?}", other),
    }

    manager.release(chain).unwrap();
    assert_eq!(manager.active_operation_count(), 0);
}

#[test]
fn chain_fails_when_second_stage_fails() {
    let mut manager = ResourceManager::default();
    register_text_provider(&mut manager, &[("first", "one")]);
    manager.register_provider(Box::new(FailingProvider));

    let first = manager.provide::<String>(&text_location("first"));
    let chain = manager.create_chain(first, |manager, _| {
        manager.provide::<String>(&failing_location("bad"))
    });

    let status = tick_until_done(&mut manager, &chain, 10);
    assert_eq!(status, OperationStatus::Failed);
    assert!(matches!(
        manager.error(&chain),
        Some(LoadError::DependencyFailed { .. })
    ));

    manager.release(chain).unwrap();
    assert_eq!(manager.active_operation_count(), 0);
}

#[test]
fn completion_listeners_fire_on_the_next_tick() {
    let mut manager = ResourceManager::default();

    let handle = manager.create_completed("already here".to_string());
    assert_eq!(manager.status(&handle).unwrap(), OperationStatus::Succeeded);

    let fired = Rc::new(Cell::new(false));
    let fired_clone = fired.clone();
    manager
        .on_complete(&handle, move |manager, handle| {
            assert_eq!(manager.result::<String>(&handle).unwrap(), "already here");
            fired_clone.set(true);
        })
        .unwrap();

    // Never synchronously, even though the operation is already complete
    assert!(!fired.get());
    manager.tick(0.0);
    assert!(fired.get());

    manager.release(handle).unwrap();
    assert_eq!(manager.active_operation_count(), 0);
}

#[test]
fn unknown_provider_fails_like_any_other_load() {
    let mut manager = ResourceManager::default();

    let location = ResourceLocation::new("thing", "nobody", TypeId::of::<String>(), vec![]);
    let handle = manager.provide::<String>(&location);

    assert!(manager.is_valid(&handle));
    assert_eq!(manager.status(&handle).unwrap(), OperationStatus::Failed);
    assert!(matches!(
        manager.error(&handle),
        Some(LoadError::UnknownProvider { .. })
    ));

    manager.release(handle).unwrap();
    assert_eq!(manager.active_operation_count(), 0);
}

#[test]
fn dropped_provide_handle_reports_failure() {
    let mut manager = ResourceManager::default();
    let pending = register_manual_provider(&mut manager);

    let handle = manager.provide::<String>(&manual_location("m"));
    assert_eq!(pending.borrow().len(), 1);

    // A buggy provider that forgets its handle must not leave the operation in
    // flight forever
    pending.borrow_mut().clear();

    let status = tick_until_done(&mut manager, &handle, 10);
    assert_eq!(status, OperationStatus::Failed);
    match manager.error(&handle) {
        Some(LoadError::ProviderFailed { message, .. }) => {
            assert!(message.contains("dropped"));
        }
        other => panic!("unexpected error {:?}", other),
    }

    manager.release(handle).unwrap();
}

#[test]
fn download_progress_aggregates_children() {
    let mut manager = ResourceManager::default();
    let pending = register_manual_provider(&mut manager);

    let children = vec![
        manager.provide::<String>(&manual_location("m0")),
        manager.provide::<String>(&manual_location("m1")),
    ];
    let group = manager.create_group(children, GroupOptions::default());

    let handles: Vec<ProvideHandle> = pending.borrow_mut().drain(..).collect();
    handles[0].report_progress(25, 100);
    handles[1].report_progress(50, 100);
    manager.tick(0.0);

    let progress = manager.download_progress(&group).unwrap();
    assert_eq!(progress.downloaded_bytes, 75);
    assert_eq!(progress.total_bytes, 200);
    assert!(!progress.is_done);

    for handle in handles {
        handle.complete("done".to_string());
    }
    tick_until_done(&mut manager, &group, 10);
    assert!(manager.download_progress(&group).unwrap().is_done);

    manager.release(group).unwrap();
}

#[test]
fn dependencies_load_before_dependents() {
    let mut manager = ResourceManager::default();
    let served = register_text_provider(&mut manager, &[("a", "one"), ("b", "two")]);

    let a = text_location("a");
    let b = ResourceLocation::new("b", "text", TypeId::of::<String>(), vec![a]);

    let handle = manager.provide::<String>(&b);
    let status = tick_until_done(&mut manager, &handle, 10);
    assert_eq!(status, OperationStatus::Succeeded);
    assert_eq!(*served.borrow(), vec!["a".to_string(), "b".to_string()]);

    manager.release(handle).unwrap();
    assert_eq!(manager.active_operation_count(), 0);
}

#[test]
fn shared_dependencies_load_once() {
    let mut manager = ResourceManager::default();
    let served =
        register_text_provider(&mut manager, &[("shared", "s"), ("c", "three"), ("d", "four")]);

    let shared = text_location("shared");
    let c = ResourceLocation::new("c", "text", TypeId::of::<String>(), vec![shared.clone()]);
    let d = ResourceLocation::new("d", "text", TypeId::of::<String>(), vec![shared]);

    let c_handle = manager.provide::<String>(&c);
    let d_handle = manager.provide::<String>(&d);
    tick_until_done(&mut manager, &c_handle, 10);
    tick_until_done(&mut manager, &d_handle, 10);

    let shared_loads = served.borrow().iter().filter(|id| *id == "shared").count();
    assert_eq!(shared_loads, 1);

    manager.release(c_handle).unwrap();
    manager.release(d_handle).unwrap();
    assert_eq!(manager.active_operation_count(), 0);
}

#[test]
fn wait_for_completion_drains_the_dependency_chain() {
    let mut manager = ResourceManager::default();
    register_text_provider(&mut manager, &[("a", "one"), ("b", "two")]);

    let a = text_location("a");
    let b = ResourceLocation::new("b", "text", TypeId::of::<String>(), vec![a]);

    let handle = manager.provide::<String>(&b);
    let status = manager.wait_for_completion(&handle).unwrap();
    assert_eq!(status, OperationStatus::Succeeded);
    assert_eq!(manager.result::<String>(&handle).unwrap(), "two");
    manager.release(handle).unwrap();
}

#[test]
fn wait_for_completion_can_be_disabled() {
    let mut manager = ResourceManager::new(ManagerConfig {
        allow_synchronous_wait: false,
        ..ManagerConfig::default()
    });
    register_text_provider(&mut manager, &[("a", "one")]);

    let handle = manager.provide::<String>(&text_location("a"));
    assert!(matches!(
        manager.wait_for_completion(&handle),
        Err(LoadError::SynchronousWaitUnsupported)
    ));

    tick_until_done(&mut manager, &handle, 10);
    manager.release(handle).unwrap();
}

#[test]
fn manifest_locations_load_end_to_end() {
    let mut manager = ResourceManager::default();
    register_text_provider(&mut manager, &[("greeting", "hello"), ("message", "world")]);
    manager.register_manifest_type::<String>("text");

    let manifest = r#"{
        "locations": [
            { "id": "greeting", "provider": "text", "result_type": "text" },
            { "id": "message", "provider": "text", "result_type": "text", "dependencies": ["greeting"] }
        ]
    }"#;
    let locations = manager.load_manifest_json(manifest).unwrap();

    let handle = manager.provide::<String>(locations.get("message").unwrap());
    let status = tick_until_done(&mut manager, &handle, 10);
    assert_eq!(status, OperationStatus::Succeeded);
    assert_eq!(manager.result::<String>(&handle).unwrap(), "world");

    manager.release(handle).unwrap();
    assert_eq!(manager.active_operation_count(), 0);
}

#[test]
fn mismatched_provider_value_fails() {
    let mut manager = ResourceManager::default();
    let pending = register_manual_provider(&mut manager);

    let handle = manager.provide::<String>(&manual_location("m"));
    let provide_handle = pending.borrow_mut().pop().unwrap();
    provide_handle.complete(7u32);

    let status = tick_until_done(&mut manager, &handle, 10);
    assert_eq!(status, OperationStatus::Failed);
    assert!(matches!(
        manager.error(&handle),
        Some(LoadError::TypeMismatch { .. })
    ));

    manager.release(handle).unwrap();
}

#[test]
fn update_pump_stops_when_the_operation_completes() {
    let mut manager = ResourceManager::default();
    let updates = Rc::new(Cell::new(0usize));
    manager.register_provider(Box::new(PumpedProvider {
        updates: updates.clone(),
    }));

    let location = ResourceLocation::new("pumped", "pumped", TypeId::of::<String>(), vec![]);
    let handle = manager.provide::<String>(&location);
    tick_until_done(&mut manager, &handle, 10);

    // The operation is done; holding the handle must not keep the provider pumped
    let settled = updates.get();
    for _ in 0..5 {
        manager.tick(0.0);
    }
    assert_eq!(updates.get(), settled);

    manager.release(handle).unwrap();
    assert_eq!(manager.active_operation_count(), 0);
}

#[test]
fn stale_provider_completions_are_discarded() {
    let mut manager = ResourceManager::default();
    let stashed = Rc::new(RefCell::new(Vec::default()));
    manager.register_provider(Box::new(DefectiveProvider {
        stashed: stashed.clone(),
    }));

    let location =
        |id: &str| ResourceLocation::new(id, "defective", TypeId::of::<String>(), vec![]);

    let first = manager.provide::<String>(&location("one"));
    let first_id = first.id();
    assert_eq!(manager.status(&first).unwrap(), OperationStatus::Failed);
    manager.release(first).unwrap();

    // The freed slot is recycled for an unrelated operation
    let second = manager.provide::<String>(&location("two"));
    assert_eq!(first_id.index, second.id().index);
    assert_ne!(first_id, second.id());
    assert_eq!(manager.status(&second).unwrap(), OperationStatus::Failed);

    // A token for the destroyed operation lands on the recycled slot; it must be
    // discarded, not delivered to the new occupant
    let ghost = stashed.borrow_mut().remove(0);
    ghost.complete("ghost".to_string());
    manager.tick(0.0);
    assert_eq!(manager.status(&second).unwrap(), OperationStatus::Failed);
    assert!(matches!(
        manager.error(&second),
        Some(LoadError::ProviderFailed { .. })
    ));

    // A token for a live operation that already failed cannot resurrect it
    let late = stashed.borrow_mut().remove(0);
    late.complete("late".to_string());
    manager.tick(0.0);
    assert_eq!(manager.status(&second).unwrap(), OperationStatus::Failed);
    assert!(manager.result::<String>(&second).is_err());

    manager.release(second).unwrap();
    assert_eq!(manager.active_operation_count(), 0);
}

#[test]
fn diamond_dependency_progress_counts_shared_leaf_once() {
    let mut manager = ResourceManager::default();
    let pending = register_manual_provider(&mut manager);

    let shared = manual_location("shared");
    let left = ResourceLocation::new("left", "manual", TypeId::of::<String>(), vec![shared.clone()]);
    let right = ResourceLocation::new("right", "manual", TypeId::of::<String>(), vec![shared]);

    let children = vec![
        manager.provide::<String>(&left),
        manager.provide::<String>(&right),
    ];
    let group = manager.create_group(children, GroupOptions::default());

    // Only the shared leaf has started; both dependents are gated on it
    assert_eq!(pending.borrow().len(), 1);
    pending.borrow()[0].report_progress(40, 100);
    manager.tick(0.0);

    let progress = manager.download_progress(&group).unwrap();
    assert_eq!(progress.downloaded_bytes, 40);
    assert_eq!(progress.total_bytes, 100);
    assert!(!progress.is_done);

    let leaf = pending.borrow_mut().remove(0);
    leaf.complete("leaf".to_string());
    for _ in 0..5 {
        manager.tick(0.0);
        if pending.borrow().len() == 2 {
            break;
        }
    }
    assert_eq!(pending.borrow().len(), 2);

    for handle in pending.borrow().iter() {
        handle.report_progress(25, 50);
    }
    manager.tick(0.0);

    // The leaf is reachable through both dependents but contributes once
    let progress = manager.download_progress(&group).unwrap();
    assert_eq!(progress.downloaded_bytes, 90);
    assert_eq!(progress.total_bytes, 200);

    let handles: Vec<ProvideHandle> = pending.borrow_mut().drain(..).collect();
    for handle in handles {
        handle.complete("done".to_string());
    }
    tick_until_done(&mut manager, &group, 10);
    assert!(manager.download_progress(&group).unwrap().is_done);

    manager.release(group).unwrap();
    assert_eq!(manager.active_operation_count(), 0);
}

#[test]
fn diagnostics_hook_observes_the_operation_lifecycle() {
    use crate::diagnostics::DiagnosticsEventKind;

    let mut manager = ResourceManager::default();
    register_text_provider(&mut manager, &[("greeting", "hello")]);

    let events = Rc::new(RefCell::new(Vec::default()));
    let events_clone = events.clone();
    manager.set_diagnostics_hook(Box::new(move |event| {
        events_clone.borrow_mut().push(event.kind);
    }));

    let handle = manager.provide::<String>(&text_location("greeting"));
    tick_until_done(&mut manager, &handle, 10);
    manager.release(handle).unwrap();

    let events = events.borrow();
    assert_eq!(events.first(), Some(&DiagnosticsEventKind::Created));
    assert_eq!(events.last(), Some(&DiagnosticsEventKind::Destroyed));
    assert!(events.contains(&DiagnosticsEventKind::Completed));
    assert!(events.contains(&DiagnosticsEventKind::RefCountChanged));
    assert!(!events.contains(&DiagnosticsEventKind::Failed));
}

#[test]
fn failed_loads_are_retried_not_cached() {
    let mut manager = ResourceManager::default();
    manager.register_provider(Box::new(FailingProvider));

    let location = failing_location("bad");
    let first = manager.provide::<String>(&location);
    let status = tick_until_done(&mut manager, &first, 10);
    assert_eq!(status, OperationStatus::Failed);

    // The failed operation left the cache, so the same request starts over while the
    // first handle stays readable
    let second = manager.provide::<String>(&location);
    assert_ne!(first.id(), second.id());
    tick_until_done(&mut manager, &second, 10);

    assert!(manager.error(&first).is_some());
    manager.release(first).unwrap();
    manager.release(second).unwrap();
    assert_eq!(manager.active_operation_count(), 0);
}
