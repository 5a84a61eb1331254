//! Lifecycle tests against the in-memory coordination backend.

use std::collections::HashMap;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use assert_matches::assert_matches;
use tempfile::NamedTempFile;
use tokio::task::JoinSet;
use warden_bootable::Bootable;
use warden_config::{
    CLIENT_CONFIG_PATH_KEY, LOCK_NAME_KEY, LOCK_TIMEOUT_KEY, SERVER_CONFIG_PATH_KEY,
};
use warden_coordination::Role;
use warden_coordination_memory::{DEFAULT_CLUSTER_NAME, MemoryBackend, MemoryNetwork};
use warden_lock::{Error, LockLifecycleManager};

fn properties(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
        .collect()
}

fn leader_properties() -> HashMap<String, String> {
    properties(&[(LOCK_NAME_KEY, "leader"), (LOCK_TIMEOUT_KEY, "5")])
}

fn role_file(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("failed to create temp file");
    file.write_all(contents.as_bytes())
        .expect("failed to write temp file");
    file
}

fn path_str(path: &Path) -> &str {
    path.to_str().expect("temp path is not utf-8")
}

async fn started(
    network: &MemoryNetwork,
) -> (MemoryBackend, LockLifecycleManager<MemoryBackend>) {
    let backend = MemoryBackend::new(network.clone());
    let manager = LockLifecycleManager::new(backend.clone(), leader_properties());
    manager.start().await.expect("failed to start lifecycle");
    (backend, manager)
}

#[tokio::test]
async fn test_second_instance_waits_for_release() {
    let _ = tracing_subscriber::fmt::try_init();

    let network = MemoryNetwork::new();
    let (_backend_a, a) = started(&network).await;
    let (_backend_b, b) = started(&network).await;

    let config = a.configuration().await.expect("a is running");
    assert_eq!(config.name(), "leader");
    assert_eq!(config.acquire_timeout_secs(), 5);

    assert!(a.acquire().await);
    assert!(a.is_alive().await);

    assert!(!b.acquire().await);
    assert!(!b.is_alive().await);

    a.release().await;
    assert!(!a.is_alive().await);

    assert!(b.acquire().await);
    assert!(b.is_alive().await);

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn test_connectivity_loss_steps_down_holder() {
    let network = MemoryNetwork::new();
    let (backend_a, a) = started(&network).await;
    let (_backend_b, b) = started(&network).await;

    assert!(a.acquire().await);
    assert!(!b.acquire().await);

    backend_a.sever().await;

    assert!(!a.is_alive().await);
    assert!(!a.acquire().await);
    assert!(b.acquire().await);
    assert!(b.is_alive().await);

    // A failed release on the severed instance does not stop its teardown.
    a.stop().await;
    assert!(!a.is_alive().await);
    assert_eq!(network.member_count(DEFAULT_CLUSTER_NAME).await, 1);
    assert!(b.is_alive().await);

    b.stop().await;
    assert_eq!(network.member_count(DEFAULT_CLUSTER_NAME).await, 0);
}

#[tokio::test]
async fn test_only_one_racing_instance_acquires() {
    let network = MemoryNetwork::new();
    let mut managers = Vec::new();
    for _ in 0..8 {
        let (_backend, manager) = started(&network).await;
        managers.push(Arc::new(manager));
    }

    let mut attempts = JoinSet::new();
    for manager in &managers {
        let manager = manager.clone();
        attempts.spawn(async move { manager.acquire().await });
    }

    let mut winners = 0;
    while let Some(result) = attempts.join_next().await {
        if result.expect("acquire task panicked") {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);

    let mut alive = 0;
    for manager in &managers {
        if manager.is_alive().await {
            alive += 1;
        }
    }
    assert_eq!(alive, 1);

    for manager in &managers {
        manager.stop().await;
    }
}

#[tokio::test]
async fn test_release_without_holding_leaves_holder_alone() {
    let network = MemoryNetwork::new();
    let (_backend_a, a) = started(&network).await;
    let (_backend_b, b) = started(&network).await;

    assert!(a.acquire().await);

    b.release().await;
    b.release().await;

    assert!(a.is_alive().await);
    assert!(!b.is_alive().await);
    assert!(network.holder(DEFAULT_CLUSTER_NAME, "leader").await.is_some());

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn test_stop_is_idempotent_and_releases() {
    let network = MemoryNetwork::new();
    let (_backend_a, a) = started(&network).await;
    let (_backend_b, b) = started(&network).await;

    assert!(a.acquire().await);

    a.stop().await;
    a.stop().await;
    Bootable::shutdown(&a).await.expect("shutdown failed");
    a.wait().await;

    assert!(!a.acquire().await);
    assert!(!a.is_alive().await);
    assert!(a.configuration().await.is_none());

    assert!(b.acquire().await);
    b.stop().await;
    assert_eq!(network.member_count(DEFAULT_CLUSTER_NAME).await, 0);
}

#[tokio::test]
async fn test_start_twice_is_rejected() {
    let network = MemoryNetwork::new();
    let (_backend, manager) = started(&network).await;

    assert_matches!(manager.start().await, Err(Error::AlreadyStarted));

    manager.stop().await;
    manager.start().await.expect("restart after stop failed");
    manager.stop().await;
}

#[tokio::test]
async fn test_invalid_timeout_fails_start() {
    let network = MemoryNetwork::new();
    let manager = LockLifecycleManager::new(
        MemoryBackend::new(network.clone()),
        properties(&[(LOCK_TIMEOUT_KEY, "soon")]),
    );

    assert_matches!(
        manager.start().await,
        Err(Error::Configuration(warden_config::Error::InvalidTimeout { .. }))
    );
    assert_eq!(network.member_count(DEFAULT_CLUSTER_NAME).await, 0);
}

#[tokio::test]
async fn test_missing_server_config_file_fails_start() {
    let network = MemoryNetwork::new();
    let manager = LockLifecycleManager::new(
        MemoryBackend::new(network.clone()),
        properties(&[(SERVER_CONFIG_PATH_KEY, "/nonexistent/warden/server.toml")]),
    );

    assert_matches!(
        manager.start().await,
        Err(Error::Coordination(warden_coordination::Error::ConfigurationFile {
            role: Role::Server,
            ..
        }))
    );
}

#[tokio::test]
async fn test_invalid_client_config_contents_fails_start() {
    let network = MemoryNetwork::new();
    let client_file = role_file("cluster_name = 42");
    let manager = LockLifecycleManager::new(
        MemoryBackend::new(network.clone()),
        properties(&[(CLIENT_CONFIG_PATH_KEY, path_str(client_file.path()))]),
    );

    assert_matches!(
        manager.start().await,
        Err(Error::Coordination(
            warden_coordination::Error::InvalidConfigurationFile {
                role: Role::Client,
                ..
            }
        ))
    );
    assert_eq!(network.member_count(DEFAULT_CLUSTER_NAME).await, 0);
}

#[tokio::test]
async fn test_unreachable_cluster_tears_down_server() {
    let network = MemoryNetwork::new();
    let server_file = role_file("cluster_name = \"east\"");
    let client_file = role_file("cluster_name = \"west\"");
    let manager = LockLifecycleManager::new(
        MemoryBackend::new(network.clone()),
        properties(&[
            (SERVER_CONFIG_PATH_KEY, path_str(server_file.path())),
            (CLIENT_CONFIG_PATH_KEY, path_str(client_file.path())),
        ]),
    );

    assert_matches!(
        manager.start().await,
        Err(Error::Coordination(
            warden_coordination::Error::CoordinationUnavailable {
                role: Role::Client,
                ..
            }
        ))
    );
    assert_eq!(network.member_count("east").await, 0);
    assert!(!manager.acquire().await);
}

#[tokio::test]
async fn test_custom_role_files_share_a_cluster() {
    let network = MemoryNetwork::new();
    let role = role_file("cluster_name = \"blue\"");
    let role_path = path_str(role.path()).to_string();

    let mut managers = Vec::new();
    for _ in 0..2 {
        let manager = LockLifecycleManager::new(
            MemoryBackend::new(network.clone()),
            properties(&[
                (LOCK_NAME_KEY, "blue-leader"),
                (SERVER_CONFIG_PATH_KEY, &role_path),
                (CLIENT_CONFIG_PATH_KEY, &role_path),
            ]),
        );
        manager.start().await.expect("failed to start lifecycle");
        managers.push(manager);
    }

    assert_eq!(network.member_count("blue").await, 2);
    assert!(managers[0].acquire().await);
    assert!(!managers[1].acquire().await);
    assert!(network.holder("blue", "blue-leader").await.is_some());

    for manager in &managers {
        manager.stop().await;
    }
    assert_eq!(network.member_count("blue").await, 0);
}
