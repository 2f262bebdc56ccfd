//! End-to-end worker scenarios over a scripted network.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use propan_cache::{CacheKey, CacheStore, EvictionPolicy, MemoryCacheStore, SqliteCacheStore};
use propan_net::{Destination, NetError, Request, ResponseSnapshot, ResponseSource};
use propan_sw::{
    ControlOutcome, EventOutcome, FetchEvent, LifecycleState, MessageEvent, NotificationPermission,
    PushEvent, RegistrationEvent, ReplyPort, SyncEvent, SyncOutcome, WorkerError, WorkerEvent,
    SYNC_ORDERS,
};
use propan_test::fixtures::{self, precache_body};
use propan_test::{init_test_logging, Scenario, ScriptedResponse};
use serde_json::json;

fn snapshot(path: &str, body: &'static str) -> ResponseSnapshot {
    ResponseSnapshot {
        url: fixtures::url(path).unwrap(),
        status: 200,
        status_text: "OK".to_string(),
        headers: vec![],
        body: Bytes::from_static(body.as_bytes()),
        response_type: Default::default(),
        redirected: false,
    }
}

async fn runtime_keys(store: &dyn CacheStore) -> Vec<String> {
    let handle = store.open("propan-runtime").await.unwrap();
    store
        .keys(&handle)
        .await
        .unwrap()
        .iter()
        .map(|key| key.url().to_string())
        .collect()
}

// ==================== Precache & Install ====================

#[tokio::test]
async fn precached_assets_are_served_offline_without_network() {
    init_test_logging();
    let harness = Scenario::new().installed().await.unwrap();
    harness.fetcher.set_offline(true);

    for (path, destination) in [
        ("/styles.css", Destination::Style),
        ("/app.js", Destination::Script),
        ("/images/pan2.png", Destination::Image),
    ] {
        let response = harness.fetch_as(path, destination).await.unwrap();
        assert_eq!(response.source, ResponseSource::Cache);
        assert_eq!(response.status.as_u16(), 200);
        assert_eq!(response.text().await.unwrap(), precache_body(path));
    }
    assert_eq!(harness.fetcher.call_count().await, 0);
}

#[tokio::test]
async fn install_twice_keeps_the_same_keys() {
    let harness = Scenario::new()
        .config(|c| c.skip_waiting_on_install = false)
        .build()
        .await
        .unwrap();

    harness.worker.install().await.unwrap();
    let handle = harness.store.open("propan-static-v1").await.unwrap();
    let first = harness.store.keys(&handle).await.unwrap();

    harness.worker.install().await.unwrap();
    let second = harness.store.keys(&handle).await.unwrap();

    assert_eq!(first.len(), harness.worker.config().precache_manifest.len());
    let mut first_sorted = first.clone();
    let mut second_sorted = second.clone();
    first_sorted.sort();
    second_sorted.sort();
    assert_eq!(first_sorted, second_sorted);
    assert_eq!(harness.worker.state().await, LifecycleState::Installed);
}

#[tokio::test]
async fn reinstalling_an_active_worker_keeps_the_same_keys() {
    let harness = Scenario::new().build().await.unwrap();

    let first_activation = harness.worker.install().await.unwrap();
    assert!(first_activation.is_some());
    let handle = harness.store.open("propan-static-v1").await.unwrap();
    let mut first = harness.store.keys(&handle).await.unwrap();

    let second_activation = harness.worker.install().await.unwrap();
    assert!(second_activation.is_none());
    let mut second = harness.store.keys(&handle).await.unwrap();

    first.sort();
    second.sort();
    assert_eq!(first, second);
    assert_eq!(harness.worker.state().await, LifecycleState::Activated);

    let response = harness.fetch_as("/styles.css", Destination::Style).await.unwrap();
    assert_eq!(response.source, ResponseSource::Cache);
}

#[tokio::test]
async fn failed_install_leaves_precache_empty() {
    let harness = Scenario::new().build().await.unwrap();
    harness.fetcher.fail("/app.js").await.unwrap();

    let result = harness.worker.install().await;
    assert!(matches!(result, Err(WorkerError::Lifecycle(_))));
    assert_eq!(harness.worker.state().await, LifecycleState::Redundant);

    if harness.store.has_namespace("propan-static-v1").await.unwrap() {
        let handle = harness.store.open("propan-static-v1").await.unwrap();
        assert!(harness.store.keys(&handle).await.unwrap().is_empty());
    }

    // Retry succeeds once the asset is back.
    harness.fetcher.recover("/app.js").await.unwrap();
    harness.worker.install().await.unwrap();
    assert_eq!(harness.worker.state().await, LifecycleState::Activated);
}

#[tokio::test]
async fn install_fails_on_missing_precache_asset() {
    let harness = Scenario::new()
        .config(|c| {
            c.precache_manifest.push("/missing.css".to_string());
        })
        .build()
        .await
        .unwrap();

    assert!(harness.worker.install().await.is_err());
    assert_eq!(harness.worker.state().await, LifecycleState::Redundant);
}

// ==================== Activation ====================

#[tokio::test]
async fn activation_removes_stale_namespaces() {
    let store: Arc<dyn CacheStore> = Arc::new(MemoryCacheStore::new());
    for (namespace, path) in [
        ("propan-static-v1", "/styles.css"),
        ("propan-runtime", "/api/menu"),
    ] {
        let handle = store.open(namespace).await.unwrap();
        store
            .put(
                &handle,
                CacheKey::get(&fixtures::url(path).unwrap()),
                snapshot(path, "old"),
            )
            .await
            .unwrap();
    }

    let harness = Scenario::new()
        .config(|c| c.version = "v2".to_string())
        .store(store.clone())
        .build()
        .await
        .unwrap();
    let report = harness.worker.install().await.unwrap().unwrap();

    assert_eq!(report.deleted_namespaces, vec!["propan-static-v1".to_string()]);
    let namespaces: Vec<String> = store.list_namespaces().await.unwrap().into_iter().collect();
    assert_eq!(namespaces, vec!["propan-runtime", "propan-static-v2"]);
}

#[tokio::test]
async fn activation_claims_open_pages() {
    let mut harness = Scenario::new()
        .config(|c| c.skip_waiting_on_install = false)
        .build()
        .await
        .unwrap();
    let (client, _rx) = harness
        .worker
        .connect_client(fixtures::url("/").unwrap())
        .await;
    assert!(!harness.worker.clients().get(&client).await.unwrap().controlled);

    harness.worker.install().await.unwrap();
    assert!(harness
        .drain_events()
        .contains(&RegistrationEvent::Waiting));

    let report = harness.worker.activate().await.unwrap();
    assert_eq!(report.claimed_clients, 1);
    assert!(harness.worker.clients().get(&client).await.unwrap().controlled);
    assert!(harness
        .drain_events()
        .contains(&RegistrationEvent::ControllerChange { client_id: client }));
}

#[tokio::test]
async fn skip_waiting_message_activates_installed_worker() {
    let harness = Scenario::new()
        .config(|c| c.skip_waiting_on_install = false)
        .build()
        .await
        .unwrap();
    harness.worker.install().await.unwrap();
    assert_eq!(harness.worker.state().await, LifecycleState::Installed);

    let outcome = harness
        .worker
        .post_message(MessageEvent::new(json!({ "type": "SKIP_WAITING" })))
        .await;

    assert_eq!(outcome, ControlOutcome::SkipWaiting);
    assert_eq!(harness.worker.state().await, LifecycleState::Activated);
}

// ==================== Fetch Policies ====================

#[tokio::test]
async fn stored_snapshot_matches_returned_response() {
    let harness = Scenario::new()
        .route(
            "/api/menu",
            ScriptedResponse::ok(r#"{"panes":["bolillo","concha"]}"#)
                .with_header("content-type", "application/json"),
        )
        .installed()
        .await
        .unwrap();

    let response = harness.fetch("/api/menu").await.unwrap();
    assert_eq!(response.source, ResponseSource::Network);
    let returned = response.into_snapshot().await.unwrap();

    let handle = harness.store.open("propan-runtime").await.unwrap();
    let key = CacheKey::get(&fixtures::url("/api/menu").unwrap());
    let stored = harness
        .store
        .match_entry(&handle, &key)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(stored.response.status, returned.status);
    assert_eq!(stored.response.body, returned.body);
    assert_eq!(stored.response.headers, returned.headers);
    assert_eq!(stored.response.header("content-type"), Some("application/json"));
}

#[tokio::test]
async fn offline_navigation_serves_offline_document() {
    let harness = Scenario::new().installed().await.unwrap();
    harness.fetcher.set_offline(true);

    let response = harness.navigate("/pedidos").await.unwrap();

    assert_eq!(response.status.as_u16(), 200);
    assert_eq!(response.source, ResponseSource::Fallback);
    assert_eq!(response.text().await.unwrap(), precache_body("/offline.html"));
}

#[tokio::test]
async fn navigation_under_api_prefix_is_a_navigation() {
    let harness = Scenario::new()
        .route("/api/menu", ScriptedResponse::ok("<html>menu</html>"))
        .installed()
        .await
        .unwrap();

    let response = harness.navigate("/api/menu").await.unwrap();
    assert_eq!(response.source, ResponseSource::Network);
    assert_eq!(runtime_keys(&*harness.store).await, vec!["https://propan.test/api/menu"]);

    // Offline, the navigation falls back to the offline page rather than the API entry.
    harness.fetcher.set_offline(true);
    let response = harness.navigate("/api/menu").await.unwrap();
    assert_eq!(response.text().await.unwrap(), precache_body("/offline.html"));
}

#[tokio::test]
async fn offline_api_request_uses_stale_runtime_entry() {
    let harness = Scenario::new()
        .route("/api/orders", ScriptedResponse::ok("[7]"))
        .installed()
        .await
        .unwrap();
    harness.fetch("/api/orders").await.unwrap();

    harness.fetcher.set_offline(true);
    let response = harness.fetch("/api/orders").await.unwrap();
    assert_eq!(response.source, ResponseSource::Fallback);
    assert_eq!(response.text().await.unwrap(), "[7]");

    let response = harness.fetch("/api/unknown").await.unwrap();
    assert_eq!(response.status.as_u16(), 503);
    assert_eq!(response.source, ResponseSource::Synthesized);
}

#[tokio::test]
async fn offline_image_uses_placeholder() {
    let harness = Scenario::new().installed().await.unwrap();
    harness.fetcher.set_offline(true);

    let response = harness
        .fetch_as("/images/nuevo.png", Destination::Image)
        .await
        .unwrap();
    assert_eq!(response.text().await.unwrap(), precache_body("/images/pan1.png"));
}

#[tokio::test]
async fn uncacheable_responses_are_returned_but_not_stored() {
    let harness = Scenario::new()
        .config(|c| c.cache_error_responses = false)
        .route("/login", ScriptedResponse::redirect("/entrar"))
        .route("/api/broken", ScriptedResponse::status(500, "boom"))
        .installed()
        .await
        .unwrap();

    let redirect = harness.fetch("/login").await.unwrap();
    assert!(redirect.is_opaque_redirect());

    let broken = harness.fetch("/api/broken").await.unwrap();
    assert_eq!(broken.status.as_u16(), 500);

    assert!(runtime_keys(&*harness.store).await.is_empty());
}

#[tokio::test]
async fn post_requests_are_not_cached() {
    let harness = Scenario::new()
        .route("/api/orders", ScriptedResponse::status(201, "created"))
        .installed()
        .await
        .unwrap();

    let request = Request::post(
        fixtures::url("/api/orders").unwrap(),
        Bytes::from_static(b"{\"pan\":\"concha\"}"),
    );
    let response = harness.worker.handle_fetch(FetchEvent::new(request)).await;
    assert_eq!(response.status.as_u16(), 201);
    assert!(runtime_keys(&*harness.store).await.is_empty());
}

#[tokio::test]
async fn quota_exhaustion_still_answers() {
    let harness = Scenario::new()
        .store(Arc::new(MemoryCacheStore::with_quota(4096)))
        .route("/images/gigante.png", ScriptedResponse::ok(vec![0u8; 16 * 1024]))
        .installed()
        .await
        .unwrap();

    let response = harness
        .fetch_as("/images/gigante.png", Destination::Image)
        .await
        .unwrap();

    assert_eq!(response.source, ResponseSource::Fallback);
    assert_eq!(response.text().await.unwrap(), precache_body("/images/pan1.png"));
}

#[tokio::test]
async fn runtime_eviction_drops_oldest_entries() {
    let harness = Scenario::new()
        .config(|c| {
            c.runtime_eviction = EvictionPolicy {
                max_entries: Some(2),
                max_age_secs: None,
            }
        })
        .route("/api/a", ScriptedResponse::ok("a"))
        .route("/api/b", ScriptedResponse::ok("b"))
        .route("/api/c", ScriptedResponse::ok("c"))
        .installed()
        .await
        .unwrap();

    for path in ["/api/a", "/api/b", "/api/c"] {
        harness.fetch(path).await.unwrap();
    }

    assert_eq!(
        runtime_keys(&*harness.store).await,
        vec!["https://propan.test/api/b", "https://propan.test/api/c"]
    );
}

#[tokio::test]
async fn navigation_preload_is_used_when_enabled() {
    let harness = Scenario::new()
        .config(|c| c.navigation_preload = true)
        .installed()
        .await
        .unwrap();
    assert!(harness.worker.navigation_preload_enabled());

    let url = fixtures::url("/").unwrap();
    let preload = propan_net::Response::new(url.clone(), http::StatusCode::OK, "preloaded");
    let event = FetchEvent::new(Request::navigate(url)).with_preload(Ok(preload));
    let response = harness.worker.handle_fetch(event).await;

    assert_eq!(response.text().await.unwrap(), "preloaded");
    assert_eq!(harness.fetcher.call_count().await, 0);
}

#[tokio::test]
async fn failed_preload_falls_back_offline() {
    let harness = Scenario::new()
        .config(|c| c.navigation_preload = true)
        .installed()
        .await
        .unwrap();

    let url = fixtures::url("/").unwrap();
    let event = FetchEvent::new(Request::navigate(url))
        .with_preload(Err(NetError::Offline("preload".to_string())));
    let response = harness.worker.handle_fetch(event).await;

    assert_eq!(response.text().await.unwrap(), precache_body("/offline.html"));
}

#[tokio::test]
async fn aborted_fetch_never_stores() {
    let harness = Scenario::new()
        .route("/api/lento", ScriptedResponse::ok("tarde"))
        .installed()
        .await
        .unwrap();
    harness
        .fetcher
        .set_latency(Some(Duration::from_millis(200)))
        .await;

    let request = Request::get(fixtures::url("/api/lento").unwrap());
    let pending = harness
        .worker
        .dispatch(WorkerEvent::Fetch(FetchEvent::new(request)));
    tokio::time::sleep(Duration::from_millis(20)).await;
    pending.abort();

    assert!(matches!(pending.wait().await, Err(WorkerError::Aborted)));
    harness.worker.wait_until_idle().await;
    tokio::time::sleep(Duration::from_millis(250)).await;

    assert_eq!(harness.worker.in_flight(), 0);
    assert!(runtime_keys(&*harness.store).await.is_empty());
}

#[tokio::test]
async fn dispatched_events_resolve_and_release_lifetime() {
    let harness = Scenario::new()
        .route("/api/menu", ScriptedResponse::ok("menu"))
        .installed()
        .await
        .unwrap();

    let request = Request::get(fixtures::url("/api/menu").unwrap());
    let pending = harness
        .worker
        .dispatch(WorkerEvent::Fetch(FetchEvent::new(request)));
    assert_eq!(pending.kind(), "fetch");

    match pending.wait().await.unwrap() {
        EventOutcome::Response(response) => {
            assert_eq!(response.text().await.unwrap(), "menu");
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    harness.worker.wait_until_idle().await;
    assert_eq!(harness.worker.in_flight(), 0);
}

// ==================== Control Channel ====================

#[tokio::test]
async fn generate_number_respects_limit() {
    let harness = Scenario::new().installed().await.unwrap();

    for (limite, bound) in [
        (json!("50"), 50.0),
        (json!(null), 100.0),
        (json!("abc"), 100.0),
        (json!(-3), 100.0),
    ] {
        for _ in 0..50 {
            let (port, mut rx) = ReplyPort::channel();
            let message = json!({ "type": "GENERATE_NUMBER", "limite": limite });
            let outcome = harness
                .worker
                .post_message(MessageEvent::new(message).with_port(port))
                .await;

            let ControlOutcome::Replied { numero } = outcome else {
                panic!("expected a reply, got {outcome:?}");
            };
            assert!((0.0..bound).contains(&numero), "{numero} outside [0, {bound})");

            let reply = rx.try_recv().unwrap();
            assert_eq!(reply["numero"].as_f64(), Some(numero));
            assert!(rx.try_recv().is_err());
        }
    }
}

#[tokio::test]
async fn generate_number_without_port_broadcasts_to_controlled_pages() {
    let harness = Scenario::new().installed().await.unwrap();
    let (_, mut first) = harness
        .worker
        .connect_client(fixtures::url("/").unwrap())
        .await;
    let (_, mut second) = harness
        .worker
        .connect_client(fixtures::url("/pedidos").unwrap())
        .await;

    let outcome = harness
        .worker
        .post_message(MessageEvent::new(json!({ "type": "GENERATE_NUMBER" })))
        .await;

    let ControlOutcome::Broadcast { numero, delivered } = outcome else {
        panic!("expected a broadcast, got {outcome:?}");
    };
    assert_eq!(delivered, 2);
    assert_eq!(first.try_recv().unwrap()["numero"].as_f64(), Some(numero));
    assert_eq!(second.try_recv().unwrap()["numero"].as_f64(), Some(numero));
}

#[tokio::test]
async fn unknown_message_is_ignored() {
    let harness = Scenario::new().installed().await.unwrap();
    let (port, mut rx) = ReplyPort::channel();

    let outcome = harness
        .worker
        .post_message(MessageEvent::new(json!({ "type": "NOOP_X" })).with_port(port))
        .await;

    assert_eq!(outcome, ControlOutcome::Ignored);
    assert!(rx.try_recv().is_err());
}

// ==================== Push & Sync ====================

#[tokio::test]
async fn push_requires_permission() {
    let mut harness = Scenario::new().installed().await.unwrap();

    let shown = harness
        .worker
        .push(PushEvent::new(Some(Bytes::from_static(b"{\"title\":\"Hola\"}"))))
        .await
        .unwrap();
    assert!(shown.is_none());
    assert!(harness.drain_notifications().is_empty());

    harness
        .worker
        .set_notification_permission(NotificationPermission::Granted)
        .await;
    let shown = harness
        .worker
        .push(PushEvent::new(Some(Bytes::from_static(
            b"{\"title\":\"Hola\",\"body\":\"Pan recien horneado\"}",
        ))))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(shown.title, "Hola");
    assert_eq!(shown.body, "Pan recien horneado");
    assert_eq!(shown.icon, "/images/pan1.png");
    assert_eq!(harness.drain_notifications(), vec![shown]);
}

#[tokio::test]
async fn malformed_push_uses_defaults() {
    let mut harness = Scenario::new().installed().await.unwrap();
    harness
        .worker
        .set_notification_permission(NotificationPermission::Granted)
        .await;

    let shown = harness
        .worker
        .push(PushEvent::new(Some(Bytes::from_static(b"\xff not json"))))
        .await
        .unwrap()
        .unwrap();

    let config = fixtures::config();
    assert_eq!(shown.title, config.default_push_title);
    assert_eq!(shown.body, config.default_push_body);
    assert_eq!(harness.drain_notifications().len(), 1);
}

#[tokio::test]
async fn sync_handles_orders_and_ignores_other_tags() {
    let harness = Scenario::new().installed().await.unwrap();

    assert_eq!(
        harness.worker.sync(SyncEvent::new(SYNC_ORDERS)).await,
        SyncOutcome::Completed
    );
    assert_eq!(
        harness.worker.sync(SyncEvent::new("sync-galletas")).await,
        SyncOutcome::Ignored
    );
}

// ==================== Durable Store ====================

#[tokio::test]
async fn sqlite_store_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("cache.db");

    {
        let store = Arc::new(SqliteCacheStore::open(&db).unwrap());
        let harness = Scenario::new()
            .route("/api/menu", ScriptedResponse::ok("menu"))
            .store(store)
            .installed()
            .await
            .unwrap();
        harness.fetch("/api/menu").await.unwrap();
    }

    let store = Arc::new(SqliteCacheStore::open(&db).unwrap());
    let harness = Scenario::new().store(store).build().await.unwrap();
    harness.fetcher.set_offline(true);

    let css = harness
        .fetch_as("/styles.css", Destination::Style)
        .await
        .unwrap();
    assert_eq!(css.source, ResponseSource::Cache);
    assert_eq!(css.text().await.unwrap(), precache_body("/styles.css"));

    let menu = harness.fetch("/api/menu").await.unwrap();
    assert_eq!(menu.text().await.unwrap(), "menu");
}
