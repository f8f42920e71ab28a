/// End-to-end HTTP API tests against a bound listener, with the serial
/// task running over an in-memory bus.
mod support;

use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use support::T0;
use tankhub::bus::MemoryBus;
use tankhub::http::{build_router, AppState};
use tankhub::state::{self, ServerState, SharedState};
use tempfile::TempDir;
use tokio::sync::{mpsc, RwLock};

struct TestServer {
    base: String,
    bus: Arc<MemoryBus>,
    state: SharedState,
    client: reqwest::Client,
    _dir: TempDir,
}

async fn spawn_server() -> TestServer {
    let dir = tempfile::tempdir().expect("temp dir");
    let mut server_state = ServerState::open(dir.path()).expect("open state");
    server_state.clock.mark_synced(T0);
    let state: SharedState = Arc::new(RwLock::new(server_state));

    let bus = Arc::new(MemoryBus::new());
    bus.set_time(T0);

    let (tx, rx) = mpsc::channel(16);
    tokio::spawn(state::run_serial_task(
        state.clone(),
        bus.clone(),
        rx,
        Duration::from_millis(25),
    ));

    let app = AppState {
        state: state.clone(),
        tx,
    };
    let router = build_router(app, None);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("serve");
    });

    TestServer {
        base: format!("http://{}", addr),
        bus,
        state,
        client: reqwest::Client::new(),
        _dir: dir,
    }
}

impl TestServer {
    async fn post(&self, path: &str, body: Value) -> reqwest::Response {
        self.client
            .post(format!("{}{}", self.base, path))
            .json(&body)
            .send()
            .await
            .expect("request")
    }

    async fn get(&self, path: &str) -> reqwest::Response {
        self.client
            .get(format!("{}{}", self.base, path))
            .send()
            .await
            .expect("request")
    }

    /// Configure the admin PIN through the API (initial set).
    async fn set_pin(&self, pin: &str) {
        let resp = self.post("/api/pin", json!({"newPin": pin})).await;
        assert_eq!(resp.status(), 200, "initial PIN set");
    }
}

// ---------------------------------------------------------------------------
// Liveness & routing
// ---------------------------------------------------------------------------

/// Test: the liveness endpoint always answers.
#[tokio::test]
async fn healthz_answers_ok() {
    let server = spawn_server().await;
    let resp = server.get("/healthz").await;
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.text().await.unwrap(), "ok");
}

/// Test: unknown paths answer 404 with the JSON envelope.
#[tokio::test]
async fn unknown_path_is_404() {
    let server = spawn_server().await;
    let resp = server.get("/api/nope").await;
    assert_eq!(resp.status(), 404);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["success"], false);
}

// ---------------------------------------------------------------------------
// PIN gate
// ---------------------------------------------------------------------------

/// Test: with no PIN configured every mutating endpoint refuses.
#[tokio::test]
async fn mutations_refuse_without_a_configured_pin() {
    let server = spawn_server().await;
    for path in [
        "/api/refresh",
        "/api/pause",
        "/api/relay",
        "/api/server-settings",
        "/api/serial-request",
    ] {
        let resp = server.post(path, json!({"pin": "1234"})).await;
        assert_eq!(resp.status(), 403, "{} must refuse", path);
    }
}

/// Test: set, verify, wrong-pin, and change flows.
#[tokio::test]
async fn pin_set_verify_and_change() {
    let server = spawn_server().await;
    server.set_pin("4217").await;

    let verify = server.post("/api/pin", json!({"pin": "4217"})).await;
    assert_eq!(verify.status(), 200);
    let wrong = server.post("/api/pin", json!({"pin": "0000"})).await;
    assert_eq!(wrong.status(), 403);

    // Change requires the current PIN.
    let denied = server
        .post("/api/pin", json!({"pin": "1111", "newPin": "9999"}))
        .await;
    assert_eq!(denied.status(), 403);
    let changed = server
        .post("/api/pin", json!({"pin": "4217", "newPin": "9999"}))
        .await;
    assert_eq!(changed.status(), 200);
    let verify = server.post("/api/pin", json!({"pin": "9999"})).await;
    assert_eq!(verify.status(), 200);

    // A malformed new PIN is a validation error.
    let bad = server
        .post("/api/pin", json!({"pin": "9999", "newPin": "12ab"}))
        .await;
    assert_eq!(bad.status(), 400);
}

// ---------------------------------------------------------------------------
// Body limits & malformed input
// ---------------------------------------------------------------------------

/// Test: bodies past 16 KiB answer 413.
#[tokio::test]
async fn oversize_body_is_413() {
    let server = spawn_server().await;
    let padding = "x".repeat(20 * 1024);
    let resp = server
        .post("/api/refresh", json!({"pin": "1234", "padding": padding}))
        .await;
    assert_eq!(resp.status(), 413);
}

/// Test: malformed JSON answers 400.
#[tokio::test]
async fn malformed_json_is_400() {
    let server = spawn_server().await;
    let resp = server
        .client
        .post(format!("{}/api/refresh", server.base))
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
}

// ---------------------------------------------------------------------------
// Ingest through the bus, read through the API
// ---------------------------------------------------------------------------

/// Test: a telemetry note seeded on the bus appears in /api/tanks after an
/// explicit refresh.
#[tokio::test]
async fn telemetry_flows_to_the_tanks_endpoint() {
    let server = spawn_server().await;
    server.set_pin("4217").await;
    server.bus.seed(
        "telemetry.qi",
        json!({"c": "dev:A", "s": "North", "n": "T1", "k": 1, "si": "analog", "vt": 4.0}),
        T0,
    );

    let refresh = server.post("/api/refresh", json!({"pin": "4217"})).await;
    assert_eq!(refresh.status(), 200);

    let resp = server.get("/api/tanks").await;
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    let tanks = body["tanks"].as_array().unwrap();
    assert_eq!(tanks.len(), 1);
    assert_eq!(tanks[0]["device"], "dev:A");
    assert_eq!(tanks[0]["site"], "North");
    assert_eq!(tanks[0]["level"], 40.0);
    assert_eq!(tanks[0]["lastUpdateEpoch"], T0);
}

/// Test: pause stops the drain loop; refresh still works and resume
/// catches up.
#[tokio::test]
async fn pause_gates_the_drain_loop() {
    let server = spawn_server().await;
    server.set_pin("4217").await;

    let resp = server
        .post("/api/pause", json!({"pin": "4217", "paused": true}))
        .await;
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["paused"], true);

    server.bus.seed(
        "telemetry.qi",
        json!({"c": "dev:B", "k": 1, "si": "analog", "vt": 5.0}),
        T0,
    );
    // Give the ticker a few cycles; paused ingest must not drain.
    tokio::time::sleep(Duration::from_millis(120)).await;
    assert_eq!(server.state.read().await.fleet.len(), 0);

    let resp = server
        .post("/api/pause", json!({"pin": "4217", "paused": false}))
        .await;
    assert_eq!(resp.status(), 200);
    // Resumed: the note lands within a few ticks.
    let mut found = false;
    for _ in 0..40 {
        tokio::time::sleep(Duration::from_millis(25)).await;
        if server.state.read().await.fleet.len() == 1 {
            found = true;
            break;
        }
    }
    assert!(found, "resumed ingest drains the queue");
}

// ---------------------------------------------------------------------------
// Calibration API
// ---------------------------------------------------------------------------

/// Test: two submitted readings converge and surface in the GET payload.
#[tokio::test]
async fn calibration_round_trips_through_the_api() {
    let server = spawn_server().await;
    server.set_pin("4217").await;

    let first = server
        .post(
            "/api/calibration",
            json!({"pin": "4217", "device": "dev:A", "tank": 1, "sensorReading": 4.0, "verifiedLevel": 0.0}),
        )
        .await;
    assert_eq!(first.status(), 200);
    let body: Value = first.json().await.unwrap();
    assert_eq!(body["calibration"]["hasLearnedCalibration"], false);

    let second = server
        .post(
            "/api/calibration",
            json!({"pin": "4217", "device": "dev:A", "tank": 1, "sensorReading": 20.0, "verifiedLevel": 100.0, "notes": "full"}),
        )
        .await;
    assert_eq!(second.status(), 200);
    let body: Value = second.json().await.unwrap();
    assert_eq!(body["calibration"]["hasLearnedCalibration"], true);
    assert_eq!(body["calibration"]["slope"], 6.25);

    let get = server.get("/api/calibration").await;
    let body: Value = get.json().await.unwrap();
    assert_eq!(body["params"][0]["hasLearnedCalibration"], true);
    assert_eq!(body["entries"].as_array().unwrap().len(), 2);

    // Out-of-range reading is rejected up front.
    let bad = server
        .post(
            "/api/calibration",
            json!({"pin": "4217", "device": "dev:A", "tank": 1, "sensorReading": 99.0, "verifiedLevel": 1.0}),
        )
        .await;
    assert_eq!(bad.status(), 400);
}

// ---------------------------------------------------------------------------
// Outbound commands
// ---------------------------------------------------------------------------

/// Test: relay set and clear land on the device-addressed queue.
#[tokio::test]
async fn relay_commands_reach_the_bus() {
    let server = spawn_server().await;
    server.set_pin("4217").await;

    let set = server
        .post(
            "/api/relay",
            json!({"pin": "4217", "device": "dev:A", "relay": 2, "state": true}),
        )
        .await;
    assert_eq!(set.status(), 200);
    let clear = server
        .post(
            "/api/relay/clear",
            json!({"pin": "4217", "device": "dev:A", "tank": 1}),
        )
        .await;
    assert_eq!(clear.status(), 200);

    let sent = server.bus.sent_to("device:dev:A:relay.qi");
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].body["relay"], 2);
    assert_eq!(sent[1].body["relay_reset_tank"], 1);

    let bad = server
        .post(
            "/api/relay",
            json!({"pin": "4217", "device": "dev:A", "relay": 99, "state": true}),
        )
        .await;
    assert_eq!(bad.status(), 400);
}

/// Test: config dispatch pushes to the device and the decoder sees the new
/// ranges on the next reading.
#[tokio::test]
async fn config_dispatch_updates_the_snapshot_cache() {
    let server = spawn_server().await;
    server.set_pin("4217").await;

    let resp = server
        .post(
            "/api/config",
            json!({
                "pin": "4217",
                "device": "dev:A",
                "config": {"site": "North", "tanks": [{"tank": 1, "subType": "pressure", "rangeMin": 0.0, "rangeMax": 5.0}]}
            }),
        )
        .await;
    assert_eq!(resp.status(), 200);
    assert_eq!(server.bus.sent_to("device:dev:A:config.qi").len(), 1);

    server.bus.seed(
        "telemetry.qi",
        json!({"c": "dev:A", "k": 1, "si": "currentLoop", "ma": 8.0}),
        T0,
    );
    server.post("/api/refresh", json!({"pin": "4217"})).await;
    let body: Value = server.get("/api/tanks").await.json().await.unwrap();
    assert_eq!(body["tanks"][0]["level"], 1.25);
}

/// Test: serial log request dispatches once, then throttles with 429.
#[tokio::test]
async fn serial_request_throttles_per_device() {
    let server = spawn_server().await;
    server.set_pin("4217").await;

    let first = server
        .post("/api/serial-request", json!({"pin": "4217", "device": "dev:A"}))
        .await;
    assert_eq!(first.status(), 200);
    assert_eq!(server.bus.sent_to("device:dev:A:serial_request.qi").len(), 1);

    let second = server
        .post("/api/serial-request", json!({"pin": "4217", "device": "dev:A"}))
        .await;
    assert_eq!(second.status(), 429);
    assert_eq!(server.bus.sent_to("device:dev:A:serial_request.qi").len(), 1);
}

// ---------------------------------------------------------------------------
// Serial logs & export
// ---------------------------------------------------------------------------

/// Test: serial entries list as JSON and export as CSV with a header row.
#[tokio::test]
async fn serial_logs_list_and_export() {
    let server = spawn_server().await;
    server.set_pin("4217").await;
    server.bus.seed(
        "serial_log.qi",
        json!({"client": "dev:A", "logs": [
            {"timestamp": T0, "message": "boot", "level": "info"},
            {"timestamp": T0 + 1.0, "message": "level, raw", "level": "warn"}
        ]}),
        T0 + 2.0,
    );
    server.post("/api/refresh", json!({"pin": "4217"})).await;

    let logs: Value = server
        .get("/api/serial-logs?source=client&client=dev:A")
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(logs["entries"].as_array().unwrap().len(), 2);
    assert_eq!(logs["entries"][1]["level"], "warn");

    let export = server
        .get("/api/serial-export?source=client&client=dev:A")
        .await;
    assert_eq!(export.status(), 200);
    assert!(export
        .headers()
        .get("content-type")
        .unwrap()
        .to_str()
        .unwrap()
        .starts_with("text/csv"));
    let csv = export.text().await.unwrap();
    let mut lines = csv.lines();
    assert_eq!(lines.next().unwrap(), "epoch,level,source,message");
    assert!(csv.contains("\"level, raw\""), "comma field is quoted");

    // Missing client for source=client is a validation error.
    let bad = server.get("/api/serial-logs?source=client").await;
    assert_eq!(bad.status(), 400);
}

// ---------------------------------------------------------------------------
// Settings & contacts
// ---------------------------------------------------------------------------

/// Test: server settings patch persists and surfaces in /api/clients.
#[tokio::test]
async fn settings_patch_round_trips() {
    let server = spawn_server().await;
    server.set_pin("4217").await;

    let resp = server
        .post(
            "/api/server-settings",
            json!({"pin": "4217", "smsOnClear": true, "dailyEmailHour": 9}),
        )
        .await;
    assert_eq!(resp.status(), 200);

    let clients: Value = server.get("/api/clients").await.json().await.unwrap();
    assert_eq!(clients["server"]["smsOnClear"], true);
    assert_eq!(clients["server"]["dailyEmailHour"], 9);
    assert_eq!(clients["server"]["pinConfigured"], true);
}

/// Test: contacts validate before persisting.
#[tokio::test]
async fn contacts_validate_and_persist() {
    let server = spawn_server().await;
    server.set_pin("4217").await;

    let bad = server
        .post(
            "/api/contacts",
            json!({"pin": "4217", "contacts": [{"name": "NoPhone"}]}),
        )
        .await;
    assert_eq!(bad.status(), 400);

    let bad_phone = server
        .post(
            "/api/contacts",
            json!({"pin": "4217", "contacts": [{"name": "Ops", "phone": "5551234"}]}),
        )
        .await;
    assert_eq!(bad_phone.status(), 400);

    let good = server
        .post(
            "/api/contacts",
            json!({"pin": "4217", "contacts": [{"name": "Ops", "phone": "+15550001111", "sites": ["North"]}]}),
        )
        .await;
    assert_eq!(good.status(), 200);

    let contacts: Value = server.get("/api/contacts").await.json().await.unwrap();
    assert_eq!(contacts["contacts"][0]["phone"], "+15550001111");
}

// ---------------------------------------------------------------------------
// History endpoints
// ---------------------------------------------------------------------------

/// Test: history serves the hot-tier series and unloads surface in their
/// endpoint.
#[tokio::test]
async fn history_and_unloads_serve_hot_tier_data() {
    let server = spawn_server().await;
    server.set_pin("4217").await;
    server.bus.seed(
        "telemetry.qi",
        json!({"c": "dev:A", "s": "North", "k": 1, "si": "analog", "vt": 4.0}),
        T0,
    );
    server.bus.seed(
        "unload.qi",
        json!({"c": "dev:A", "s": "North", "n": "T1", "k": 1, "pk": 48.0, "em": 6.5, "t": T0}),
        T0,
    );
    server.post("/api/refresh", json!({"pin": "4217"})).await;

    let history: Value = server.get("/api/history").await.json().await.unwrap();
    assert_eq!(history["tanks"][0]["device"], "dev:A");
    assert_eq!(history["tanks"][0]["series"][0]["level"], 40.0);

    let unloads: Value = server.get("/api/unloads").await.json().await.unwrap();
    assert_eq!(unloads["unloads"][0]["peakLevel"], 48.0);

    let compare: Value = server
        .get("/api/history/compare?current=202506&previous=202505")
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(compare["current"]["month"], 202506);
    assert_eq!(
        compare["previous"]["archiveHint"],
        "history/202505_history.json"
    );

    let yoy = server.get("/api/history/yoy?tank=dev:A:1&years=2").await;
    assert_eq!(yoy.status(), 200);
    let yoy: Value = yoy.json().await.unwrap();
    assert_eq!(yoy["device"], "dev:A");
    assert_eq!(yoy["months"].as_array().unwrap().len(), 3);

    let bad = server.get("/api/history/yoy?tank=missing-colon").await;
    assert_eq!(bad.status(), 400);
}
