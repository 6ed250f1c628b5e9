use pioreactor_devkit::{FakeBackend, MockBus, TestHarness};
use pioreactor_sync::api::{AutomationDefinition, Experiment, ExportedDataset};
use pioreactor_sync::bus::ConnectionState;
use pioreactor_sync::http::{build_router, AppState};
use pioreactor_sync::identity::IdentityMap;
use rumqttc::QoS;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::net::TcpListener;

struct Served {
    base: String,
    bus: Arc<MockBus>,
    backend: Arc<FakeBackend>,
    http: reqwest::Client,
}

async fn serve(backend: FakeBackend, api_key: Option<&str>) -> Served {
    let TestHarness {
        bus,
        backend,
        context,
    } = TestHarness::start_with("expA", backend).await;
    let app = build_router(AppState {
        context: Arc::new(context),
        api_key: api_key.map(str::to_string),
    });
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    Served {
        base: format!("http://{addr}"),
        bus,
        backend,
        http: reqwest::Client::new(),
    }
}

#[tokio::test]
async fn health_is_open_but_view_needs_key() {
    let s = serve(FakeBackend::new(), Some("secret")).await;

    let health = s.http.get(format!("{}/health", s.base)).send().await.unwrap();
    assert_eq!(health.status(), 200);

    let denied = s.http.get(format!("{}/view", s.base)).send().await.unwrap();
    assert_eq!(denied.status(), 401);

    let allowed = s
        .http
        .get(format!("{}/view", s.base))
        .header("x-api-key", "secret")
        .send()
        .await
        .unwrap();
    assert_eq!(allowed.status(), 200);
    let view: Value = allowed.json().await.unwrap();
    assert_eq!(view["experiment"], "expA");
    assert_eq!(view["connection"], "connected");
}

#[tokio::test]
async fn dosing_request_is_published_and_accepted() {
    let s = serve(FakeBackend::new(), None).await;

    let resp = s
        .http
        .post(format!("{}/dosing/u1", s.base))
        .json(&json!({
            "automation_key": "chemostat",
            "skip_first_run": false,
            "fields": {"volume": 0.5, "duration": 20}
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 202);
    let receipt: Value = resp.json().await.unwrap();
    let topic = "pioreactor/u1/expA/dosing_control/dosing_automation/set";
    assert_eq!(receipt["topic"], topic);

    let sent = s.bus.find_messages_by_topic(topic);
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].qos, QoS::ExactlyOnce);
    let body: Option<Value> = s.bus.last_json_message(topic).unwrap();
    assert_eq!(
        body,
        Some(json!({"automation_key": "chemostat", "skip_first_run": false, "volume": 0.5, "duration": 20}))
    );
}

#[tokio::test]
async fn dosing_while_disconnected_is_service_unavailable() {
    let s = serve(FakeBackend::new(), None).await;
    s.bus.set_state(ConnectionState::Disconnected);

    let resp = s
        .http
        .post(format!("{}/dosing/u1", s.base))
        .json(&json!({"automation_key": "silent"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 503);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["ok"], false);
    assert!(s.bus.published().is_empty());
}

#[tokio::test]
async fn units_carry_labels() {
    let backend = FakeBackend::new();
    backend.set_labels(Some(
        [("u1".to_string(), "Reactor A".to_string())]
            .into_iter()
            .collect::<IdentityMap>(),
    ));
    let s = serve(backend, None).await;
    s.bus
        .simulate_incoming("pioreactor/u1/expA/throughput_calculating/media_throughput", "2.0")
        .await
        .unwrap();

    let mut units = Value::Null;
    for _ in 0..100 {
        units = s
            .http
            .get(format!("{}/units", s.base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        if units[0]["label"] == "Reactor A" && units[0]["totals"]["primary_total"] == 2.0 {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert_eq!(units[0]["unit"], "u1");
    assert_eq!(units[0]["label"], "Reactor A");
    assert_eq!(units[0]["totals"]["primary_total"], 2.0);
    assert!(s.backend.label_calls() >= 1);
}

#[tokio::test]
async fn export_relays_leader_outcome() {
    let s = serve(FakeBackend::new(), None).await;
    let request = json!({"experimentSelection": "expA", "datasetCheckbox": {"dosing_events": true}});

    let failed = s
        .http
        .post(format!("{}/export", s.base))
        .json(&request)
        .send()
        .await
        .unwrap();
    assert_eq!(failed.status(), 502);

    s.backend.set_export(Ok(ExportedDataset {
        filename: "export_expA.zip".into(),
        url: "http://leader/public/export_expA.zip".into(),
    }));
    let ok: Value = s
        .http
        .post(format!("{}/export", s.base))
        .json(&request)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(ok["url"], "http://leader/public/export_expA.zip");
}

#[tokio::test]
async fn automation_catalogue_is_relayed() {
    let backend = FakeBackend::new().with_automations(vec![
        AutomationDefinition {
            key: "chemostat".into(),
            name: "Chemostat".into(),
            description: "Constant exchange".into(),
            fields: Vec::new(),
        },
        AutomationDefinition {
            key: "turbidostat".into(),
            name: "Turbidostat".into(),
            description: String::new(),
            fields: Vec::new(),
        },
    ]);
    let s = serve(backend, None).await;

    let resp = s.http.get(format!("{}/automations", s.base)).send().await.unwrap();
    assert_eq!(resp.status(), 200);
    let catalogue: Value = resp.json().await.unwrap();
    let keys: Vec<&str> = catalogue
        .as_array()
        .unwrap()
        .iter()
        .map(|a| a["key"].as_str().unwrap())
        .collect();
    assert_eq!(keys, ["chemostat", "turbidostat"]);
    assert_eq!(catalogue[0]["name"], "Chemostat");
}

#[tokio::test]
async fn experiments_keep_leader_order() {
    let experiment = |name: &str, created_at: &str| Experiment {
        experiment: name.into(),
        created_at: Some(created_at.into()),
        description: None,
    };
    let backend = FakeBackend::new().with_experiments(vec![
        experiment("expB", "2024-03-02T10:00:00Z"),
        experiment("expA", "2024-03-01T10:00:00Z"),
    ]);
    let s = serve(backend, Some("secret")).await;

    let denied = s.http.get(format!("{}/experiments", s.base)).send().await.unwrap();
    assert_eq!(denied.status(), 401);

    let resp = s
        .http
        .get(format!("{}/experiments", s.base))
        .header("x-api-key", "secret")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let experiments: Vec<Experiment> = resp.json().await.unwrap();
    let names: Vec<&str> = experiments.iter().map(|e| e.experiment.as_str()).collect();
    assert_eq!(names, ["expB", "expA"]);
    assert_eq!(experiments[0].created_at.as_deref(), Some("2024-03-02T10:00:00Z"));
}
