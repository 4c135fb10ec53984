//! Integration tests for on-disk state: the file-backed response cache and
//! the configuration file.
//!
//! Config tests mutate process environment variables and share
//! `ENV_LOCK` to avoid racing each other.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use socket_call::plugin::cache::CacheStorage;
use socket_call::server::{Handlers, NamespaceServer, Server};
use socket_call::transport::MemoryTransport;
use socket_call::{CacheOptions, CachePlugin, Config, FileStorage, NamespaceOptions, SocketClient};
use tempfile::TempDir;

static ENV_LOCK: Mutex<()> = Mutex::new(());

const CONFIG_ENV_VARS: [&str; 6] = [
    "SOCKET_CALL_CONFIG_DIR",
    "SOCKET_CALL_SERVER_URL",
    "SOCKET_CALL_TOKEN",
    "SOCKET_CALL_TIMEOUT_MS",
    "SOCKET_CALL_CACHE_TTL_SECS",
    "SOCKET_CALL_CACHE_PATH",
];

fn clear_env() {
    for var in CONFIG_ENV_VARS {
        std::env::remove_var(var);
    }
}

#[tokio::test]
async fn test_file_storage_survives_reopen() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("cache/responses.json");

    let storage = FileStorage::open(&path).unwrap();
    storage
        .set("ns/get [1]", json!({ "v": 1 }), Duration::from_secs(60))
        .await
        .unwrap();
    storage
        .set("ns/get [2]", json!({ "v": 2 }), Duration::from_secs(60))
        .await
        .unwrap();
    storage.remove("ns/get [2]").await.unwrap();
    assert!(path.exists());

    let reopened = FileStorage::open(&path).unwrap();
    let entry = reopened
        .get("ns/get [1]", Some(Duration::from_secs(60)))
        .await
        .unwrap()
        .unwrap();
    assert!(entry.is_hit());
    assert_eq!(entry.data, json!({ "v": 1 }));
    assert_eq!(entry.ttl, Some(60_000));
    assert_eq!(reopened.get("ns/get [2]", None).await.unwrap(), None);
}

#[cfg(unix)]
#[tokio::test]
async fn test_file_storage_is_owner_only() {
    use std::os::unix::fs::PermissionsExt;

    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("responses.json");
    let storage = FileStorage::open(&path).unwrap();
    storage.set("k", json!(1), Duration::from_secs(1)).await.unwrap();

    let mode = std::fs::metadata(&path).unwrap().permissions().mode();
    assert_eq!(mode & 0o777, 0o600);
}

#[tokio::test]
async fn test_corrupt_cache_file_fails_to_open() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("responses.json");
    std::fs::write(&path, "not json").unwrap();

    assert!(FileStorage::open(&path).is_err());
}

/// A response cached by one process answers the same call in the next
/// process while offline.
#[tokio::test]
async fn test_persisted_response_answers_offline_call() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("responses.json");

    {
        let server = Arc::new(Server::new().with_namespace(NamespaceServer::new("/user", |_| {
            Handlers::new().on("profile", |args| async move { json!({ "id": args[0] }) })
        })));
        let client = SocketClient::with_transport("http://test.com", Arc::new(MemoryTransport::new(server)));
        let storage = Arc::new(FileStorage::open(&path).unwrap());
        let user = client.add_namespace(
            "/user",
            NamespaceOptions::new().plugin(CachePlugin::new(CacheOptions::new(storage))),
        );
        user.call("profile", vec![json!(7)]).await.unwrap();
    }

    let transport = MemoryTransport::unreachable();
    let client = SocketClient::with_transport("http://test.com", Arc::new(transport.clone()));
    let storage = Arc::new(FileStorage::open(&path).unwrap());
    let user = client.add_namespace(
        "/user",
        NamespaceOptions::new().plugin(CachePlugin::new(CacheOptions::new(storage))),
    );
    user.connect();
    let mut offline = user.offline_state();
    tokio::time::timeout(
        Duration::from_secs(5),
        offline.wait_for(|state| *state == Some(true)),
    )
    .await
    .expect("offline flag not set")
    .unwrap();

    let result = user.call("profile", vec![json!(7)]).await.unwrap();
    assert_eq!(result, json!({ "id": 7 }));
    assert_eq!(transport.emit_count(), 0);
}

#[test]
fn test_config_save_and_load_roundtrip() {
    let _lock = ENV_LOCK.lock().unwrap();
    clear_env();
    let temp_dir = TempDir::new().unwrap();
    std::env::set_var("SOCKET_CALL_CONFIG_DIR", temp_dir.path());

    let config = Config {
        server_url: "http://example.test:4000".to_string(),
        cache_ttl_secs: 30,
        cache_path: Some(temp_dir.path().join("cache.json")),
        token: Some("never-written".to_string()),
        ..Config::default()
    };
    config.save().unwrap();

    let written = std::fs::read_to_string(temp_dir.path().join("config.json")).unwrap();
    assert!(!written.contains("never-written"));

    let loaded = Config::load().unwrap();
    assert_eq!(loaded.server_url, "http://example.test:4000");
    assert_eq!(loaded.cache_ttl(), Duration::from_secs(30));
    assert_eq!(loaded.cache_path, config.cache_path);
    assert_eq!(loaded.token, None);

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(temp_dir.path().join("config.json"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    clear_env();
}

#[test]
fn test_env_overrides_win_over_file() {
    let _lock = ENV_LOCK.lock().unwrap();
    clear_env();
    let temp_dir = TempDir::new().unwrap();
    std::env::set_var("SOCKET_CALL_CONFIG_DIR", temp_dir.path());
    Config::default().save().unwrap();

    std::env::set_var("SOCKET_CALL_SERVER_URL", "http://override:1");
    std::env::set_var("SOCKET_CALL_TOKEN", "tok");
    std::env::set_var("SOCKET_CALL_TIMEOUT_MS", "250");
    std::env::set_var("SOCKET_CALL_CACHE_TTL_SECS", "not-a-number");

    let config = Config::load().unwrap();
    assert_eq!(config.server_url, "http://override:1");
    assert_eq!(config.token.as_deref(), Some("tok"));
    assert_eq!(config.timeout_ms, 250);
    assert_eq!(config.cache_ttl_secs, 300);
    assert_eq!(config.connect_options().timeout, Duration::from_millis(250));

    clear_env();
}

#[test]
fn test_missing_or_invalid_file_uses_defaults() {
    let _lock = ENV_LOCK.lock().unwrap();
    clear_env();
    let temp_dir = TempDir::new().unwrap();
    std::env::set_var("SOCKET_CALL_CONFIG_DIR", temp_dir.path());

    assert_eq!(Config::load().unwrap(), Config::default());

    std::fs::write(temp_dir.path().join("config.json"), "{ broken").unwrap();
    assert_eq!(Config::load().unwrap(), Config::default());

    clear_env();
}
