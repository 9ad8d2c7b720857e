use lodestone_engine::provider::ProvideHandle;
use lodestone_engine::{
    GroupOptions, Handle, OperationStatus, Provider, ResourceLocation, ResourceManager,
};
use std::any::TypeId;
use std::collections::HashMap;
use std::time::Duration;

const MANIFEST: &str = r#"{
    "locations": [
        { "id": "greeting", "provider": "memory", "result_type": "text" },
        { "id": "audience", "provider": "memory", "result_type": "text" },
        { "id": "banner", "provider": "download", "result_type": "text",
          "dependencies": ["greeting", "audience"] }
    ]
}"#;

/// Serves small strings from an in-memory table, completing before `provide` returns.
struct MemoryProvider {
    contents: HashMap<String, String>,
}

impl Provider for MemoryProvider {
    fn provider_id(&self) -> &str {
        "memory"
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
        match self.contents.get(provide_handle.location().internal_id()) {
            Some(text) => provide_handle.complete(text.clone()),
            None => provide_handle.error(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "no such entry",
            )),
        }
        Ok(())
    }
}

/// Simulates a download on a worker thread, reporting progress in chunks before
/// completing. The provide handle marshals everything back onto the tick thread.
struct DownloadProvider;

impl Provider for DownloadProvider {
    fn provider_id(&self) -> &str {
        "download"
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
        std::thread::spawn(move || {
            let total = 400u64;
            for chunk in 1..=4u64 {
                std::thread::sleep(Duration::from_millis(40));
                provide_handle.report_progress(chunk * 100, total);
            }
            provide_handle.complete(format!("downloaded contents of '{}'", id));
        });
        Ok(())
    }
}

fn tick_to_completion(
    manager: &mut ResourceManager,
    handle: &Handle,
) -> OperationStatus {
    loop {
        manager.tick(0.015);
        if let Ok(progress) = manager.download_progress(handle) {
            log::info!(
                "progress: {}/{} bytes",
                progress.downloaded_bytes,
                progress.total_bytes
            );
        }
        if manager.is_done(handle) {
            return manager.status(handle).unwrap();
        }
        std::thread::sleep(Duration::from_millis(15));
    }
}

fn main() {
    // Setup logging
    env_logger::Builder::default()
        .write_style(env_logger::WriteStyle::Always)
        .filter_level(log::LevelFilter::Debug)
        .init();

    let mut manager = ResourceManager::default();

    let mut contents = HashMap::default();
    contents.insert("greeting".to_string(), "hello".to_string());
    contents.insert("audience".to_string(), "world".to_string());
    manager.register_provider(Box::new(MemoryProvider { contents }));
    manager.register_provider(Box::new(DownloadProvider));

    manager.register_manifest_type::<String>("text");
    let locations = manager.load_manifest_json(MANIFEST).unwrap();

    // "banner" pulls in "greeting" and "audience" before its own download starts
    let banner = manager.provide::<String>(locations.get("banner").unwrap());

    // A group joining independent loads, and a chain deriving a value from one
    let group = {
        let children = vec![
            manager.provide::<String>(locations.get("greeting").unwrap()),
            manager.provide::<String>(locations.get("audience").unwrap()),
        ];
        manager.create_group(children, GroupOptions::default())
    };
    let banner_again = manager.acquire(&banner).unwrap();
    let shouted = manager.create_chain(banner_again, |manager, banner| {
        let text = manager.result::<String>(&banner).unwrap().to_uppercase();
        manager.create_completed(text)
    });

    let status = tick_to_completion(&mut manager, &banner);
    log::info!("banner finished: {:?}", status);
    println!("banner: {}", manager.result::<String>(&banner).unwrap());

    tick_to_completion(&mut manager, &group);
    for child in manager.group_result(&group).unwrap().to_vec() {
        println!("group member: {}", manager.result::<String>(&child).unwrap());
    }

    tick_to_completion(&mut manager, &shouted);
    println!("shouted: {}", manager.result::<String>(&shouted).unwrap());

    manager.release(banner).unwrap();
    manager.release(group).unwrap();
    manager.release(shouted).unwrap();
    assert_eq!(manager.active_operation_count(), 0);
}
