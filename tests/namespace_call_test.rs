//! Integration tests for namespace calls through the plugin pipeline.
//!
//! Clients talk to an in-process server over `MemoryTransport`, which
//! records every emission so tests can assert on what reached the wire.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use socket_call::error::ConnectionErrorKind;
use socket_call::plugin::cache::{CacheStorage, StorageState, StorageValue};
use socket_call::server::MiddlewareError;
use socket_call::signature::cache_key;
use socket_call::transport::MemoryTransport;
use socket_call::{
    BeforeEmit, CacheOptions, CachePlugin, CallContext, CallError, CallOptions, EventSchema,
    Handlers, HydrationMode, HydrationState, Hydrator, MemoryStorage, Namespace, NamespaceOptions,
    NamespaceServer, Plugin, RemoteError, Server, SocketClient, StaticSession,
};
use tokio::sync::Notify;

const ROOT_URL: &str = "http://test.com";
const NAMESPACE: &str = "test-namespace";
const WAIT: Duration = Duration::from_secs(5);

/// Server for `test-namespace` with a handful of handlers.
fn test_server(release: Arc<Notify>, live_calls: Arc<AtomicUsize>) -> Arc<Server> {
    Arc::new(Server::new().with_namespace(NamespaceServer::new(NAMESPACE, move |services| {
        let release = Arc::clone(&release);
        let live_calls = Arc::clone(&live_calls);
        let pusher = services.clone();
        Handlers::new()
            .on("testEvent", move |args| {
                let live_calls = Arc::clone(&live_calls);
                async move {
                    live_calls.fetch_add(1, Ordering::SeqCst);
                    json!({ "data": "server", "args": args })
                }
            })
            .on("failing", |_| async {
                json!({ "error": "X", "message": "m", "selector": "s" })
            })
            .on("invalidForm", |_| async {
                json!({
                    "error": "invalid_form",
                    "message": { "text": "bad input" },
                    "selector": "#email",
                    "field": "email",
                    "code": 42,
                })
            })
            .on("slow", move |args| {
                let release = Arc::clone(&release);
                async move {
                    release.notified().await;
                    Value::Array(args)
                }
            })
            .on("push", move |args| {
                let services = pusher.clone();
                async move {
                    services.emit("pushed", args).unwrap();
                    Value::Null
                }
            })
    })))
}

struct Fixture {
    transport: MemoryTransport,
    storage: Arc<MemoryStorage>,
    cache: CachePlugin,
    client: SocketClient,
    release: Arc<Notify>,
    live_calls: Arc<AtomicUsize>,
}

impl Fixture {
    fn new() -> Self {
        let release = Arc::new(Notify::new());
        let live_calls = Arc::new(AtomicUsize::new(0));
        let transport = MemoryTransport::new(test_server(Arc::clone(&release), Arc::clone(&live_calls)));
        Self::with_transport(transport, release, live_calls)
    }

    fn unreachable() -> Self {
        Self::with_transport(
            MemoryTransport::unreachable(),
            Arc::new(Notify::new()),
            Arc::new(AtomicUsize::new(0)),
        )
    }

    fn with_transport(
        transport: MemoryTransport,
        release: Arc<Notify>,
        live_calls: Arc<AtomicUsize>,
    ) -> Self {
        let storage = Arc::new(MemoryStorage::new());
        let cache = CachePlugin::new(CacheOptions::new(storage.clone()));
        let client = SocketClient::with_transport(ROOT_URL, Arc::new(transport.clone()));
        Self {
            transport,
            storage,
            cache,
            client,
            release,
            live_calls,
        }
    }

    fn namespace(&self) -> Namespace {
        self.client.add_namespace(
            NAMESPACE,
            NamespaceOptions::new().plugin(self.cache.clone()),
        )
    }
}

fn ancient(data: Value) -> StorageValue {
    StorageValue {
        state: StorageState::Cached,
        data,
        created_at: 1,
        ttl: Some(1),
    }
}

async fn wait_offline(namespace: &Namespace, expected: bool) {
    let mut offline = namespace.offline_state();
    tokio::time::timeout(WAIT, offline.wait_for(|state| *state == Some(expected)))
        .await
        .expect("offline flag not set in time")
        .unwrap();
}

#[tokio::test]
async fn test_cache_hit_suppresses_transport() {
    let fixture = Fixture::new();
    fixture.storage.insert(
        r#"test-namespace/testEvent ["arg2"]"#,
        StorageValue::cached(json!({ "data": "cached" }), Duration::from_secs(60)),
    );
    let namespace = fixture.namespace();

    let result = namespace.call("testEvent", vec![json!("arg2")]).await.unwrap();

    assert_eq!(result, json!({ "data": "cached" }));
    assert_eq!(fixture.transport.emit_count(), 0);
    assert_eq!(fixture.live_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_miss_goes_live_and_populates_cache() {
    let fixture = Fixture::new();
    let namespace = fixture.namespace();

    let first = namespace.call("testEvent", vec![json!("arg2")]).await.unwrap();
    let second = namespace.call("testEvent", vec![json!("arg2")]).await.unwrap();

    assert_eq!(first, json!({ "data": "server", "args": ["arg2"] }));
    assert_eq!(second, first);
    assert_eq!(fixture.transport.emit_count(), 1);
    assert_eq!(fixture.storage.len(), 1);
}

#[tokio::test]
async fn test_disable_cache_marker_bypasses_cache() {
    let fixture = Fixture::new();
    fixture.storage.insert(
        r#"test-namespace/testEvent ["arg2"]"#,
        StorageValue::cached(json!("cached"), Duration::from_secs(60)),
    );
    let namespace = fixture.namespace();

    let result = namespace
        .call("testEvent", vec![json!("arg2"), json!({ "disableCache": true })])
        .await
        .unwrap();

    assert_eq!(result, json!({ "data": "server", "args": ["arg2"] }));
    assert_eq!(
        fixture.transport.emitted(),
        vec![("testEvent".to_string(), vec![json!("arg2")])]
    );

    let options = CallOptions { disable_cache: true };
    namespace
        .call_with("testEvent", vec![json!("arg2")], options)
        .await
        .unwrap();
    assert_eq!(fixture.transport.emit_count(), 2);

    let stored = fixture
        .storage
        .get(r#"test-namespace/testEvent ["arg2"]"#, None)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.data, json!("cached"));
}

#[tokio::test]
async fn test_offline_serves_expired_entry() {
    let fixture = Fixture::unreachable();
    fixture
        .storage
        .insert(r#"test-namespace/testEvent ["arg2"]"#, ancient(json!("old")));
    let namespace = fixture.namespace();

    namespace.connect();
    wait_offline(&namespace, true).await;

    let result = namespace.call("testEvent", vec![json!("arg2")]).await.unwrap();
    assert_eq!(result, json!("old"));
    assert_eq!(fixture.transport.emit_count(), 0);
}

#[tokio::test]
async fn test_offline_without_cache_is_offline_no_cache() {
    let fixture = Fixture::unreachable();
    let namespace = fixture.namespace();

    let err = namespace
        .call("testEvent", vec![json!("arg2")])
        .await
        .unwrap_err();

    match err {
        CallError::Connection(e) => {
            assert_eq!(e.kind, ConnectionErrorKind::OfflineNoCache);
            assert_eq!(e.event.as_deref(), Some("testEvent"));
        }
        other => panic!("expected connection error, got {other:?}"),
    }
    assert_eq!(namespace.is_offline(), Some(true));
    assert!(namespace.ongoing_calls().is_empty());
}

#[tokio::test]
async fn test_expired_entry_goes_live_when_online() {
    let fixture = Fixture::new();
    fixture
        .storage
        .insert(r#"test-namespace/testEvent ["arg2"]"#, ancient(json!("old")));
    let namespace = fixture.namespace();

    let result = namespace.call("testEvent", vec![json!("arg2")]).await.unwrap();
    assert_eq!(result, json!({ "data": "server", "args": ["arg2"] }));
    assert_eq!(fixture.transport.emit_count(), 1);
}

#[tokio::test]
async fn test_hydration_accounting() {
    let fixture = Fixture::new();
    fixture
        .storage
        .insert(r#"test-namespace/testEvent ["arg2"]"#, ancient(json!("old")));
    let namespace = fixture.namespace();
    let hydrator = fixture.client.hydrator().expect("cache plugin attaches its hydrator");

    let cached = namespace.clone();
    let live = namespace.clone();
    hydrator
        .run(
            || async move {
                let result = cached.call("testEvent", vec![json!("arg2")]).await.unwrap();
                assert_eq!(result, json!("old"));
            },
            move || async move {
                live.call("testEvent", vec![json!("arg2")]).await.unwrap();
            },
        )
        .await;

    let state = hydrator.state().unwrap();
    assert_eq!(state.mode, HydrationMode::Hydrate);
    assert_eq!(
        state.cached_calls_done,
        vec![r#"test-namespace/testEvent("arg2")"#.to_string()]
    );

    let mut rx = hydrator.subscribe();
    let done = tokio::time::timeout(
        WAIT,
        rx.wait_for(|state| state.as_ref().is_some_and(|s| s.hydrated_calls_done_amount == 1)),
    )
    .await
    .expect("live loader did not finish")
    .unwrap()
    .clone()
    .unwrap();
    assert!(done.is_complete());
    assert_eq!(fixture.transport.emit_count(), 1);
}

async fn wait_hydrated(hydrator: &Hydrator, amount: usize) -> HydrationState {
    let mut rx = hydrator.subscribe();
    let state = tokio::time::timeout(
        WAIT,
        rx.wait_for(|state| {
            state
                .as_ref()
                .is_some_and(|s| s.hydrated_calls_done_amount == amount)
        }),
    )
    .await
    .expect("hydration counter not reached")
    .unwrap()
    .clone()
    .unwrap();
    state
}

#[tokio::test]
async fn test_hydration_tracks_long_arguments_separately() {
    let fixture = Fixture::new();
    let first = json!(format!("{}A", "x".repeat(60)));
    let second = json!(format!("{}B", "x".repeat(60)));
    for arg in [&first, &second] {
        fixture.storage.insert(
            &cache_key(NAMESPACE, "testEvent", std::slice::from_ref(arg)),
            ancient(json!("old")),
        );
    }
    let namespace = fixture.namespace();
    let hydrator = fixture.client.hydrator().unwrap();

    let cached = namespace.clone();
    let live = namespace.clone();
    let refreshed = first.clone();
    hydrator
        .run(
            || async move {
                cached.call("testEvent", vec![first]).await.unwrap();
                cached.call("testEvent", vec![second]).await.unwrap();
            },
            move || async move {
                live.call("testEvent", vec![refreshed]).await.unwrap();
            },
        )
        .await;

    let state = wait_hydrated(&hydrator, 1).await;
    assert_eq!(state.cached_calls_done.len(), 2);
    assert!(!state.is_complete());
    assert_eq!(fixture.transport.emit_count(), 1);
}

#[tokio::test]
async fn test_fresh_cache_hit_counts_during_hydrate() {
    let fixture = Fixture::new();
    fixture.storage.insert(
        r#"test-namespace/testEvent ["arg2"]"#,
        StorageValue::cached(json!("fresh"), Duration::from_secs(60)),
    );
    let namespace = fixture.namespace();
    let hydrator = fixture.client.hydrator().unwrap();

    let cached = namespace.clone();
    let live = namespace.clone();
    hydrator
        .run(
            || async move {
                let result = cached.call("testEvent", vec![json!("arg2")]).await.unwrap();
                assert_eq!(result, json!("fresh"));
            },
            move || async move {
                let result = live.call("testEvent", vec![json!("arg2")]).await.unwrap();
                assert_eq!(result, json!("fresh"));
            },
        )
        .await;

    let state = wait_hydrated(&hydrator, 1).await;
    assert_eq!(state.mode, HydrationMode::Hydrate);
    assert!(state.is_complete());
    assert_eq!(fixture.transport.emit_count(), 0);
}

#[tokio::test]
async fn test_structural_error_rejects_with_payload() {
    let fixture = Fixture::new();
    let namespace = fixture.namespace();

    let err = namespace.call("failing", vec![]).await.unwrap_err();

    assert_eq!(err.as_remote(), Some(&RemoteError::scoped("X", "m", "s")));
    assert!(fixture.storage.is_empty());
    assert!(namespace.ongoing_calls().is_empty());
}

#[tokio::test]
async fn test_structural_error_keeps_every_field() {
    let fixture = Fixture::new();
    let namespace = fixture.namespace();

    let err = namespace.call("invalidForm", vec![]).await.unwrap_err();

    let remote = err.as_remote().unwrap();
    assert_eq!(
        remote.to_value(),
        json!({
            "error": "invalid_form",
            "message": { "text": "bad input" },
            "selector": "#email",
            "field": "email",
            "code": 42,
        })
    );
    assert_eq!(remote.error(), "invalid_form");
    assert_eq!(remote.message(), None);
    assert_eq!(remote.get("code"), Some(&json!(42)));
    assert!(fixture.storage.is_empty());
}

/// Records hook calls; optionally answers every call itself.
struct Recorder {
    name: &'static str,
    log: Arc<Mutex<Vec<String>>>,
    answer: Option<Value>,
}

#[async_trait]
impl Plugin for Recorder {
    fn name(&self) -> &str {
        self.name
    }

    async fn before_emit(
        &self,
        _namespace: &str,
        _event: &str,
        _args: &[Value],
        _context: &mut CallContext,
    ) -> BeforeEmit {
        self.log.lock().unwrap().push(format!("before:{}", self.name));
        match &self.answer {
            Some(answer) => BeforeEmit::ShortCircuit(answer.clone()),
            None => BeforeEmit::Continue,
        }
    }

    async fn after_emit(
        &self,
        _namespace: &str,
        _event: &str,
        _args: &[Value],
        result: Value,
        _context: &mut CallContext,
    ) -> Value {
        self.log.lock().unwrap().push(format!("after:{}", self.name));
        result
    }
}

#[tokio::test]
async fn test_short_circuit_skips_later_plugins_and_transport() {
    let fixture = Fixture::new();
    let log = Arc::new(Mutex::new(Vec::new()));
    let namespace = fixture.client.add_namespace(
        NAMESPACE,
        NamespaceOptions::new()
            .plugin(Recorder {
                name: "first",
                log: Arc::clone(&log),
                answer: Some(json!("short")),
            })
            .plugin(Recorder {
                name: "second",
                log: Arc::clone(&log),
                answer: None,
            }),
    );

    let result = namespace.call("testEvent", vec![]).await.unwrap();

    assert_eq!(result, json!("short"));
    assert_eq!(*log.lock().unwrap(), vec!["before:first"]);
    assert_eq!(fixture.transport.emit_count(), 0);
}

#[tokio::test]
async fn test_after_emit_runs_in_order_on_success() {
    let fixture = Fixture::new();
    let log = Arc::new(Mutex::new(Vec::new()));
    let namespace = fixture.client.add_namespace(
        NAMESPACE,
        NamespaceOptions::new()
            .plugin(Recorder {
                name: "a",
                log: Arc::clone(&log),
                answer: None,
            })
            .plugin(Recorder {
                name: "b",
                log: Arc::clone(&log),
                answer: None,
            }),
    );

    namespace.call("testEvent", vec![]).await.unwrap();
    assert_eq!(
        *log.lock().unwrap(),
        vec!["before:a", "before:b", "after:a", "after:b"]
    );

    log.lock().unwrap().clear();
    namespace.call("failing", vec![]).await.unwrap_err();
    assert_eq!(*log.lock().unwrap(), vec!["before:a", "before:b"]);
}

#[tokio::test]
async fn test_duplicate_pending_calls_removed_one_at_a_time() {
    let fixture = Fixture::new();
    let namespace = fixture.namespace();
    let options = CallOptions { disable_cache: true };

    let first = {
        let namespace = namespace.clone();
        tokio::spawn(async move { namespace.call_with("slow", vec![json!(1)], options).await })
    };
    let second = {
        let namespace = namespace.clone();
        tokio::spawn(async move { namespace.call_with("slow", vec![json!(1)], options).await })
    };

    let mut calls = namespace.ongoing_calls().subscribe();
    tokio::time::timeout(WAIT, calls.wait_for(|calls| calls.len() == 2))
        .await
        .expect("calls never started")
        .unwrap();
    assert_eq!(namespace.ongoing_calls().snapshot(), vec!["slow(1)", "slow(1)"]);

    fixture.release.notify_one();
    tokio::time::timeout(WAIT, calls.wait_for(|calls| calls.len() == 1))
        .await
        .expect("first call never finished")
        .unwrap();
    assert_eq!(namespace.ongoing_calls().snapshot(), vec!["slow(1)"]);

    fixture.release.notify_one();
    first.await.unwrap().unwrap();
    second.await.unwrap().unwrap();
    assert!(namespace.ongoing_calls().is_empty());
}

#[tokio::test]
async fn test_subscription_assigned_before_connect_is_single_slot() {
    let fixture = Fixture::new();
    let namespace = fixture.namespace();
    let received = Arc::new(Mutex::new(Vec::new()));

    let old = Arc::clone(&received);
    namespace
        .subscribe("pushed", move |args| old.lock().unwrap().push(("old", args)))
        .unwrap();
    assert!(namespace.socket().is_none());

    namespace
        .call_with("push", vec![json!(1)], CallOptions { disable_cache: true })
        .await
        .unwrap();

    let new = Arc::clone(&received);
    namespace
        .subscribe("pushed", move |args| new.lock().unwrap().push(("new", args)))
        .unwrap();
    namespace
        .call_with("push", vec![json!(2)], CallOptions { disable_cache: true })
        .await
        .unwrap();

    assert_eq!(
        *received.lock().unwrap(),
        vec![("old", vec![json!(1)]), ("new", vec![json!(2)])]
    );

    assert!(namespace.unsubscribe("pushed"));
    namespace
        .call_with("push", vec![json!(3)], CallOptions { disable_cache: true })
        .await
        .unwrap();
    assert_eq!(received.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn test_connect_options_and_credentials() {
    let fixture = Fixture::new();
    let namespace = fixture.client.add_namespace(
        NAMESPACE,
        NamespaceOptions::new().session(StaticSession::new(Some("abc".into()))),
    );

    namespace.connect();
    namespace.connect();
    wait_offline(&namespace, false).await;

    let connects = fixture.transport.connects();
    assert_eq!(connects.len(), 1);
    let (url, options) = &connects[0];
    assert_eq!(url, "http://test.com/test-namespace");
    assert!(options
        .extra_headers
        .contains(&("X-Namespace".to_string(), NAMESPACE.to_string())));
    assert_eq!(options.timeout, Duration::from_millis(1000));
    assert_eq!(options.transports, vec!["websocket".to_string()]);
    assert!(!options.multiplex);

    let credentials = options.credentials().await;
    assert_eq!(credentials.get("token"), Some(&json!("abc")));
}

#[tokio::test]
async fn test_lifecycle_callbacks() {
    let connected = Arc::new(Mutex::new(Vec::new()));
    let errors = Arc::new(Mutex::new(Vec::new()));

    let online = Fixture::new();
    let seen = Arc::clone(&connected);
    let namespace = online.client.add_namespace(
        NAMESPACE,
        NamespaceOptions::new().on_connected(move |ns| seen.lock().unwrap().push(ns.to_string())),
    );
    namespace.connect();
    wait_offline(&namespace, false).await;
    assert_eq!(*connected.lock().unwrap(), vec![NAMESPACE.to_string()]);

    let offline = Fixture::unreachable();
    let seen = Arc::clone(&errors);
    let namespace = offline.client.add_namespace(
        NAMESPACE,
        NamespaceOptions::new().on_connect_error(move |e| seen.lock().unwrap().push(e.clone())),
    );
    namespace.connect();
    wait_offline(&namespace, true).await;

    let errors = errors.lock().unwrap();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].is_offline_no_cache());
    assert_eq!(errors[0].to_string(), "test-namespace: connect_error: offline_no_cache");
}

#[test]
#[should_panic(expected = "Tokio 1.x runtime")]
fn test_connect_outside_runtime_panics() {
    let fixture = Fixture::new();
    fixture.namespace().connect();
}

#[tokio::test]
async fn test_middleware_rejection_surfaces_as_connection_error() {
    let server = Arc::new(Server::new().with_namespace(
        NamespaceServer::new(NAMESPACE, |_| {
            Handlers::new().on("testEvent", |_| async { json!("ok") })
        })
        .middleware(|services| async move {
            let authorized = services.token() == Some("good");
            if authorized {
                Ok(())
            } else {
                Err(MiddlewareError::new("unauthorized"))
            }
        }),
    ));
    let transport = MemoryTransport::new(server);
    let client = SocketClient::with_transport(ROOT_URL, Arc::new(transport));

    let anonymous = client.add_namespace(NAMESPACE, NamespaceOptions::new());
    match anonymous.call("testEvent", vec![]).await.unwrap_err() {
        CallError::Connection(e) => {
            assert_eq!(e.kind, ConnectionErrorKind::Other("unauthorized".into()));
        }
        other => panic!("expected connection error, got {other:?}"),
    }

    let authorized = client.add_namespace(
        NAMESPACE,
        NamespaceOptions::new().session(StaticSession::new(Some("good".into()))),
    );
    assert_eq!(authorized.call("testEvent", vec![]).await.unwrap(), json!("ok"));
}

#[tokio::test]
async fn test_schema_rejects_undeclared_events() {
    let fixture = Fixture::new();
    let namespace = fixture.client.add_namespace(
        NAMESPACE,
        NamespaceOptions::new().schema(EventSchema::new().emits(["testEvent"]).listens(["pushed"])),
    );

    assert!(matches!(
        namespace.method("nope"),
        Err(CallError::UnknownEvent(event)) if event == "nope"
    ));
    assert!(namespace.subscribe("nope", |_| {}).is_err());
    assert!(namespace.socket().is_none());

    let method = namespace.method("testEvent").unwrap();
    let result: Value = method.call_as(vec![json!("x")]).await.unwrap();
    assert_eq!(result["data"], json!("server"));
}

#[tokio::test]
async fn test_unknown_server_event_is_structural_error() {
    let fixture = Fixture::new();
    let namespace = fixture.namespace();

    let err = namespace.call("missing", vec![]).await.unwrap_err();
    let remote = err.as_remote().unwrap();
    assert_eq!(remote.error(), "unknown_event");
    assert_eq!(remote.selector(), Some("missing"));
}
