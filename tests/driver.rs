//! Manifest-directory driver against a mocked proxy.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{MockProcess, Workspace};
use ingress_reload::controller::driver::{Driver, LiveManifests};
use ingress_reload::render::Renderer;
use ingress_reload::{Reconciler, Shutdown};
use tokio::sync::mpsc;

const SERVICE: &str = r#"
kind: Service
metadata: {name: web, namespace: ns}
spec:
  ports:
    - {port: 80, targetPort: 8080}
"#;

fn ingress(name: &str, host: &str) -> String {
    format!(
        r#"
kind: Ingress
metadata: {{name: {name}, namespace: ns}}
spec:
  rules:
    - host: {host}
      http:
        paths:
          - path: /
            backend: {{service: {{name: web, port: {{number: 80}}}}}}
"#
    )
}

async fn wait_for(workspace: &Workspace, predicate: impl Fn(&str) -> bool) {
    for _ in 0..200 {
        if predicate(&workspace.installed()) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("installed configuration never matched:\n{}", workspace.installed());
}

#[tokio::test]
async fn test_driver_follows_manifest_directory() {
    let mut workspace = Workspace::new();
    workspace.config.watch.debounce_ms = 20;
    let manifest_dir = workspace.dir.path().join("manifests");
    std::fs::create_dir_all(&manifest_dir).unwrap();
    std::fs::write(manifest_dir.join("service.yaml"), SERVICE).unwrap();
    std::fs::write(manifest_dir.join("a.yaml"), ingress("a", "a.example.com")).unwrap();

    let process = Arc::new(MockProcess::default());
    let shutdown = Shutdown::new();
    let supervisor = workspace.supervisor_with_shutdown(process.clone(), shutdown.clone());
    let manifests = Arc::new(LiveManifests::load(&manifest_dir).unwrap());
    let renderer = Renderer::embedded(&workspace.config.proxy.pid_file).unwrap();
    let reconciler = Arc::new(Reconciler::new(
        &workspace.config,
        renderer,
        supervisor,
        manifests.clone(),
        manifests.clone(),
    ));

    let (resync_tx, resync_rx) = mpsc::unbounded_channel();
    let driver = Driver::new(reconciler, manifests, &workspace.config.watch, shutdown.clone());
    let handle = tokio::spawn(driver.run(resync_rx));

    wait_for(&workspace, |text| text.contains("server_name a.example.com;")).await;

    std::fs::write(manifest_dir.join("b.yaml"), ingress("b", "b.example.com")).unwrap();
    resync_tx.send(()).unwrap();
    wait_for(&workspace, |text| text.contains("server_name b.example.com;")).await;

    std::fs::remove_file(manifest_dir.join("a.yaml")).unwrap();
    resync_tx.send(()).unwrap();
    wait_for(&workspace, |text| {
        !text.contains("a.example.com") && text.contains("b.example.com")
    })
    .await;

    shutdown.trigger();
    let result = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();
    assert!(result.is_ok());
    assert!(process.signals() >= 3);
}
