//! End-to-end host behavior over a fake image backend.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;

use plugrid_bus::{DeliveryMode, Message, MessageFilter, MessageHandler};
use plugrid_compose::{Composition, CompositionStrategy, MethodBinding, PluginRole};
use plugrid_core::{Document, ErrorKind, PluginId, PluginState};
use plugrid_host::{HostConfig, PluginHost};
use plugrid_lifecycle::{LifecycleConfig, LifecycleEvent, LifecycleEventKind};
use plugrid_test::{FakeImageBackend, MockPlugin};

fn host_over(backend: &FakeImageBackend) -> PluginHost {
    let config = HostConfig {
        verify_checksums: false,
        ..HostConfig::default()
    };
    PluginHost::with_backend(config, Arc::new(backend.clone())).unwrap()
}

fn plugin_metadata(id: &str, name: &str) -> Document {
    json!({ "id": id, "name": name, "version": "1.0.0", "author": "t" })
}

fn id(s: &str) -> PluginId {
    PluginId::from_static(s)
}

// Load, check, unload; a second unload is NotFound.
#[tokio::test(flavor = "multi_thread")]
async fn round_trip_load_and_unload() {
    let dir = tempfile::tempdir().unwrap();
    let backend = FakeImageBackend::default();
    let path = backend.install(dir.path(), "ex.qtplugin", plugin_metadata("p1", "P1"));
    let host = host_over(&backend);

    let plugin = host.load_plugin(&path).unwrap();
    assert_eq!(plugin.id().as_str(), "p1");
    assert_eq!(plugin.version().to_string(), "1.0.0");
    assert!(host.is_loaded(&id("p1")));
    assert_eq!(host.list_plugins(), vec![id("p1")]);
    drop(plugin);

    host.unload_plugin(&id("p1")).await.unwrap();
    assert!(!host.is_loaded(&id("p1")));

    let err = host.unload_plugin(&id("p1")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

// Pause before initialize is rejected without an event.
#[tokio::test(flavor = "multi_thread")]
async fn invalid_transition_is_silent() {
    let host = host_over(&FakeImageBackend::default());
    host.lifecycle()
        .register_plugin(
            MockPlugin::builder("p1").build_handle(),
            LifecycleConfig::default(),
        )
        .unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    host.register_event_callback(
        None,
        None,
        Arc::new(move |event: &LifecycleEvent| {
            sink.lock().unwrap().push(event.clone());
        }),
    );

    let err = host
        .lifecycle()
        .pause_plugin(&id("p1"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
    assert!(seen.lock().unwrap().is_empty());
}

// Initialization that overruns its budget is cancelled.
#[tokio::test(flavor = "multi_thread")]
async fn initialization_timeout_surfaces_as_cancelled() {
    let host = host_over(&FakeImageBackend::default());
    host.lifecycle()
        .register_plugin(
            MockPlugin::builder("sleepy")
                .init_delay(Duration::from_secs(2))
                .build_handle(),
            LifecycleConfig {
                initialization_timeout: Duration::from_millis(100),
                ..LifecycleConfig::default()
            },
        )
        .unwrap();

    let after_init = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&after_init);
    host.register_event_callback(
        None,
        Some(LifecycleEventKind::AfterInitialize),
        Arc::new(move |event: &LifecycleEvent| {
            sink.lock().unwrap().push(event.clone());
        }),
    );

    let err = host.initialize_plugin(&id("sleepy")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::OperationCancelled);
    assert_eq!(host.plugin_state(&id("sleepy")).unwrap(), PluginState::Error);

    let events = after_init.lock().unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].error, Some(ErrorKind::OperationCancelled));
}

// Fleet shutdown forces the slow plugin and names it.
#[tokio::test(flavor = "multi_thread")]
async fn graceful_fleet_shutdown_forces_stragglers() {
    let host = host_over(&FakeImageBackend::default());
    let tight = LifecycleConfig {
        shutdown_timeout: Duration::from_millis(50),
        ..LifecycleConfig::default()
    };
    for name in ["a", "b"] {
        host.lifecycle()
            .register_plugin(MockPlugin::builder(name).build_handle(), tight.clone())
            .unwrap();
    }
    host.lifecycle()
        .register_plugin(
            MockPlugin::builder("slow")
                .shutdown_delay(Duration::from_millis(200))
                .build_handle(),
            tight,
        )
        .unwrap();
    for name in ["a", "b", "slow"] {
        host.initialize_plugin(&id(name)).await.unwrap();
    }

    let err = host.shutdown(Duration::from_secs(1)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert!(err.message().contains("slow"));
    assert!(host.lifecycle().registered_plugins().is_empty());
    assert!(host.list_plugins().is_empty());
}

// A priority filter admits exactly the high and critical messages, in order.
#[tokio::test(flavor = "multi_thread")]
async fn bus_priority_filter() {
    let host = host_over(&FakeImageBackend::default());

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let handler: MessageHandler = Arc::new(move |message: &Message| {
        sink.lock().unwrap().push(message.payload["priority"].clone());
        Ok(())
    });
    let at_least_high: MessageFilter = Arc::new(|message: &Message| {
        matches!(
            message.payload["priority"].as_str(),
            Some("high" | "critical")
        )
    });
    host.bus()
        .subscribe("watcher", "system_event", Some(at_least_high), handler)
        .unwrap();

    for priority in ["low", "normal", "high", "critical"] {
        host.bus()
            .publish(
                Message::new("system_event", "host", json!({ "priority": priority })),
                DeliveryMode::Reliable,
            )
            .await
            .unwrap();
    }

    for _ in 0..200 {
        if seen.lock().unwrap().len() == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(*seen.lock().unwrap(), vec![json!("high"), json!("critical")]);
}

// A pipeline composite chains loaded plugins.
#[tokio::test(flavor = "multi_thread")]
async fn composition_pipeline_chains_loaded_plugins() {
    let dir = tempfile::tempdir().unwrap();
    let backend = FakeImageBackend::default();
    for name in ["a", "b", "c"] {
        backend.install(
            dir.path(),
            &format!("{name}.qtplugin"),
            plugin_metadata(name, name),
        );
    }
    let host = host_over(&backend);
    for path in host.loader().discover(dir.path(), false) {
        host.load_plugin(&path).unwrap();
    }
    assert_eq!(host.list_plugins().len(), 3);

    let composition = Composition::new(id("pipe"), "pipe", CompositionStrategy::Pipeline)
        .with_plugin(id("a"), PluginRole::Secondary)
        .with_plugin(id("b"), PluginRole::Secondary)
        .with_plugin(id("c"), PluginRole::Secondary)
        .with_binding(
            MethodBinding::new(id("a"), "echo", id("b"), "echo").map_parameter("x", "y"),
        )
        .with_binding(
            MethodBinding::new(id("b"), "echo", id("c"), "echo").map_parameter("y", "z"),
        );
    let composite = host.create_composition(composition).unwrap();
    composite.initialize().await.unwrap();

    let result = composite
        .execute_command("echo", json!({ "x": 5 }))
        .await
        .unwrap();
    assert_eq!(result, json!({ "z": 5 }));

    assert!(host.composition(&id("pipe")).is_some());
    assert!(host.remove_composition(&id("pipe")));
    assert!(host.composition(&id("pipe")).is_none());
}

// A failed validation returns SecurityViolation and registers nothing.
#[tokio::test(flavor = "multi_thread")]
async fn validation_failure_blocks_the_load() {
    let dir = tempfile::tempdir().unwrap();
    let backend = FakeImageBackend::default();
    // Standard level requires a checksum when verification is on; none
    // is provided.
    let path = backend.install(dir.path(), "p.qtplugin", plugin_metadata("p", "P"));
    let host = PluginHost::with_backend(
        HostConfig::default(),
        Arc::new(backend.clone()),
    )
    .unwrap();

    let report = host.validate_plugin(&path);
    assert!(!report.is_valid);

    let err = host.load_plugin(&path).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SecurityViolation);
    assert!(!host.is_loaded(&id("p")));
    assert!(!host.lifecycle().is_registered(&id("p")));
}

#[tokio::test(flavor = "multi_thread")]
async fn configure_reaches_the_plugin() {
    let dir = tempfile::tempdir().unwrap();
    let backend = FakeImageBackend::default();
    let path = backend.install(dir.path(), "cfg.qtplugin", plugin_metadata("cfg", "Cfg"));
    let host = host_over(&backend);

    let plugin = host.load_plugin(&path).unwrap();
    host.configure(&id("cfg"), json!({ "mode": "fast" })).unwrap();
    assert_eq!(plugin.current_configuration(), json!({ "mode": "fast" }));

    let err = host
        .configure(&id("missing"), Document::Null)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}
