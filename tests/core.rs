//! Server lifecycle and configuration tests.

mod common;

use common::{config_for, temp_test_dir, write_config};
use kubelite::core::config::{Config, ConfigOverrides, DeploymentMode};
use kubelite::core::error::ServerError;
use kubelite::core::lifecycle::LifecycleState;
use kubelite::server::Server;
use kubelite::storage::EndpointScheme;
use std::time::Duration;

// ============================================================================
// Config tests
// ============================================================================

#[test]
fn parse_yaml_config_file() {
    let file = write_config(
        r#"
server:
  mode: ha
  data_dir: /srv/k8s
storage:
  etcd_servers: ["http://10.0.0.1:2379"]
"#,
        ".yaml",
    );
    let config = Config::from_file(file.path()).unwrap();
    assert_eq!(config.mode().unwrap(), DeploymentMode::Ha);
    assert_eq!(config.server.data_dir, "/srv/k8s");
}

#[test]
fn parse_toml_config_file() {
    let file = write_config(
        r#"
[server]
mode = "single"
log_level = "debug"

[storage.embedded]
shared_cache = false
"#,
        ".toml",
    );
    let config = Config::from_file(file.path()).unwrap();
    assert_eq!(config.server.log_level, "debug");
    assert!(!config.storage.embedded.shared_cache);
}

#[test]
fn missing_config_file_uses_defaults() {
    let dir = temp_test_dir();
    let config = Config::load(&dir.path().join("absent.yaml"), &ConfigOverrides::default())
        .unwrap();
    assert_eq!(config.mode().unwrap(), DeploymentMode::Single);
    assert_eq!(config.server.data_dir, "/var/lib/k8s");
}

#[test]
fn flags_override_file() {
    let file = write_config("server:\n  mode: single\n", ".yaml");
    let overrides = ConfigOverrides {
        server_mode: Some("ha".to_string()),
        ..Default::default()
    };
    let config = Config::load(file.path(), &overrides).unwrap();
    assert_eq!(config.mode().unwrap(), DeploymentMode::Ha);
}

#[test]
fn malformed_config_file_fails() {
    let file = write_config("server: [not, a, map", ".yaml");
    assert!(Config::load(file.path(), &ConfigOverrides::default()).is_err());
}

// ============================================================================
// Server lifecycle tests
// ============================================================================

#[test]
fn invalid_mode_has_no_side_effects() {
    let dir = temp_test_dir();
    let data = dir.path().join("state");
    let err = Server::new(config_for("bogus", &data)).err().unwrap();
    assert!(matches!(err, ServerError::InvalidMode { .. }));
    assert!(!data.exists());
}

#[tokio::test]
async fn single_mode_publishes_unix_endpoint() {
    let dir = temp_test_dir();
    let mut server = Server::new(config_for("single", dir.path())).unwrap();
    server.start().await.unwrap();

    let endpoint = server.storage_endpoint().unwrap().clone();
    assert_eq!(endpoint.scheme(), EndpointScheme::Unix);
    assert_eq!(
        endpoint.to_string(),
        format!("unix://{}", dir.path().join("kine.sock").display())
    );

    let db_dir = dir.path().join("db");
    assert!(db_dir.is_dir());
    assert!(db_dir.join("state.db").exists());
    assert!(tokio::net::UnixStream::connect(dir.path().join("kine.sock"))
        .await
        .is_ok());

    server.shutdown().await;
    assert!(!dir.path().join("kine.sock").exists());
}

#[tokio::test]
async fn ha_mode_defaults_to_local_etcd() {
    let dir = temp_test_dir();
    let mut server = Server::new(config_for("ha", dir.path())).unwrap();
    server.start().await.unwrap();
    assert_eq!(
        server.storage_endpoint().unwrap().to_string(),
        "http://127.0.0.1:2379"
    );
    assert!(!dir.path().join("db").exists());
    server.shutdown().await;
}

#[tokio::test]
async fn ha_mode_uses_first_server() {
    let dir = temp_test_dir();
    let mut config = config_for("ha", dir.path());
    config.storage.etcd_servers = vec![
        "http://a:2379".to_string(),
        "http://b:2379".to_string(),
        "http://c:2379".to_string(),
    ];
    let mut server = Server::new(config).unwrap();
    server.start().await.unwrap();
    assert_eq!(server.storage_endpoint().unwrap().address(), "http://a:2379");
    server.shutdown().await;
}

#[tokio::test]
async fn shutdown_twice_is_harmless() {
    let dir = temp_test_dir();
    let mut server = Server::new(config_for("single", dir.path())).unwrap();
    server.start().await.unwrap();

    tokio::time::timeout(Duration::from_secs(10), async {
        server.shutdown().await;
        server.shutdown().await;
    })
    .await
    .expect("shutdown hung");

    assert_eq!(server.state(), LifecycleState::Stopped);
    assert_eq!(server.active_tasks(), 0);
    assert!(server.storage_endpoint().is_none());
}

#[tokio::test]
async fn run_returns_after_shutdown_request() {
    let dir = temp_test_dir();
    let mut server = Server::new(config_for("single", dir.path())).unwrap();
    let handle = server.shutdown_handle();

    let trigger = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        handle.trigger();
    });

    tokio::time::timeout(Duration::from_secs(10), server.run())
        .await
        .expect("run did not return")
        .unwrap();
    trigger.await.unwrap();

    assert_eq!(server.state(), LifecycleState::Stopped);
    assert_eq!(server.active_tasks(), 0);
}

#[tokio::test]
async fn bad_sqlite_path_fails_storage_start() {
    let dir = temp_test_dir();
    let blocker = dir.path().join("file");
    std::fs::write(&blocker, b"not a directory").unwrap();

    let mut config = config_for("single", &dir.path().join("data"));
    config.storage.sqlite_path = Some(blocker.join("state.db").display().to_string());
    let mut server = Server::new(config).unwrap();

    let err = server.start().await.unwrap_err();
    assert!(
        matches!(err, ServerError::Filesystem { .. } | ServerError::Storage(_)),
        "{err}"
    );
    assert_eq!(server.state(), LifecycleState::Stopped);
}
