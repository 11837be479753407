//! Apply protocol behaviour observed through the filesystem and the mocked process.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use common::{resource, service, MockProcess, Workspace};
use ingress_reload::lifecycle::StartupSupervisor;
use ingress_reload::proxy::{ApplyOutcome, ReloadError};
use ingress_reload::render::{Renderer, RenderedConfiguration};
use ingress_reload::resource::{ManifestStore, PathEntry};
use ingress_reload::{PassError, Shutdown};

#[tokio::test]
async fn test_same_fingerprint_writes_and_signals_nothing() {
    let workspace = Workspace::new();
    let process = Arc::new(MockProcess::default());
    let supervisor = workspace.supervisor(process.clone());
    let candidate = RenderedConfiguration::new("events {}\nhttp {}\n".to_string());

    supervisor.apply(&candidate).await.unwrap();
    let installed = &workspace.config.proxy.config_file;
    let modified = std::fs::metadata(installed).unwrap().modified().unwrap();

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(supervisor.apply(&candidate).await.unwrap(), ApplyOutcome::Unchanged);

    assert_eq!(std::fs::metadata(installed).unwrap().modified().unwrap(), modified);
    assert_eq!(process.tests(), 1);
    assert_eq!(process.signals(), 1);
}

#[tokio::test]
async fn test_config_test_failure_keeps_installed_file() {
    let workspace = Workspace::new();
    let process = Arc::new(MockProcess::default());
    let store = ManifestStore::new().with_service(service("web", 80, 8080));
    let supervisor = workspace.supervisor(process.clone());
    let reconciler = workspace.reconciler(store, supervisor.clone());

    reconciler
        .reconcile(&resource("site", "example.com", vec![PathEntry::new("/", "web", 80)]))
        .await
        .unwrap();
    let before = workspace.installed();
    let fingerprint = supervisor.installed_fingerprint().await;

    process.fail_test.store(true, Ordering::SeqCst);
    let err = reconciler
        .reconcile(&resource("site", "example.org", vec![PathEntry::new("/", "web", 80)]))
        .await
        .unwrap_err();
    assert!(matches!(err, PassError::Reload(ReloadError::ConfigTest(_))));

    assert_eq!(workspace.installed(), before);
    assert_eq!(supervisor.installed_fingerprint().await, fingerprint);
    assert!(!workspace.config.proxy.test_file().exists());
    assert_eq!(process.signals(), 1);
}

#[tokio::test]
async fn test_signal_failure_restores_backup_without_resignal() {
    let workspace = Workspace::new();
    let process = Arc::new(MockProcess::default());
    let supervisor = workspace.supervisor(process.clone());

    let good = RenderedConfiguration::new("events {}\n".to_string());
    supervisor.apply(&good).await.unwrap();

    process.fail_signal.store(true, Ordering::SeqCst);
    let err = supervisor
        .apply(&RenderedConfiguration::new("events { }\n".to_string()))
        .await
        .unwrap_err();
    assert!(matches!(err, ReloadError::RolledBack { .. }));
    assert!(!err.is_fatal());

    assert_eq!(workspace.installed(), "events {}\n");
    assert!(!workspace.config.proxy.backup_file().exists());
    assert_eq!(process.signals(), 2);
    assert_eq!(supervisor.installed_fingerprint().await, Some(good.fingerprint));
}

#[tokio::test]
async fn test_proxy_down_after_rollback_is_fatal() {
    let workspace = Workspace::new();
    let process = Arc::new(MockProcess::default());
    let shutdown = Shutdown::new();
    let mut stopped = shutdown.subscribe();
    let supervisor = workspace.supervisor_with_shutdown(process.clone(), shutdown.clone());
    let store = ManifestStore::new().with_service(service("web", 80, 8080));
    let reconciler = workspace.reconciler(store, supervisor.clone());

    reconciler
        .reconcile(&resource("site", "example.com", vec![PathEntry::new("/", "web", 80)]))
        .await
        .unwrap();

    process.dead.store(true, Ordering::SeqCst);
    let err = reconciler
        .reconcile(&resource("site", "example.org", vec![PathEntry::new("/", "web", 80)]))
        .await
        .unwrap_err();
    assert!(err.is_fatal());
    assert!(supervisor.is_halted());
    assert!(shutdown.is_triggered());
    assert!(stopped.recv().await.is_ok());
    assert!(workspace.installed().contains("example.com"));
}

#[tokio::test]
async fn test_concurrent_passes_compose_every_resource() {
    let workspace = Workspace::new();
    let process = Arc::new(MockProcess::default());
    let store = ManifestStore::new().with_service(service("web", 80, 8080));
    let reconciler = Arc::new(workspace.reconciler(store, workspace.supervisor(process)));

    let mut tasks = Vec::new();
    for i in 0..8 {
        let reconciler = reconciler.clone();
        tasks.push(tokio::spawn(async move {
            let host = format!("site{}.example.com", i);
            let site = resource(&format!("site{}", i), &host, vec![PathEntry::new("/", "web", 80)]);
            reconciler.reconcile(&site).await.unwrap();
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let installed = workspace.installed();
    for i in 0..8 {
        assert!(installed.contains(&format!("server_name site{}.example.com;", i)));
    }
    assert_eq!(reconciler.views().len(), 8);
}

#[tokio::test]
async fn test_startup_bootstraps_and_launches() {
    let workspace = Workspace::new();
    let process = Arc::new(MockProcess::default());
    process.dead.store(true, Ordering::SeqCst);
    let supervisor = workspace.supervisor(process.clone());
    let renderer = Renderer::embedded(&workspace.config.proxy.pid_file).unwrap();

    let waiter = {
        let process = process.clone();
        tokio::spawn(async move {
            while process.launches.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            process.dead.store(false, Ordering::SeqCst);
        })
    };

    StartupSupervisor::with_timing(Duration::from_secs(2), Duration::from_millis(5))
        .start(&supervisor, &renderer)
        .await
        .unwrap();
    waiter.await.unwrap();

    assert_eq!(process.launches.load(Ordering::SeqCst), 1);
    assert!(workspace.installed().contains("return 404;"));
    assert_eq!(process.signals(), 0);
}
