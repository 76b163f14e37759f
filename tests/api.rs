//! Integration tests for the management API
//!
//! Most tests drive the router in-process with `oneshot`. The client test
//! binds a real listener on a free port and talks to it over HTTP.

use std::net::TcpListener;
use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;

use fleetsim::cli::ControlPlaneClient;
use fleetsim::config::Manifest;
use fleetsim::fleet::{FleetController, ManualClock, ScalingRequest};
use fleetsim::network::GroupType;
use fleetsim::server::{create_router, AppState};

fn running_controller() -> Arc<FleetController> {
    let controller =
        FleetController::from_manifest(&Manifest::demo(), Arc::new(ManualClock::new())).unwrap();
    controller.start_all().unwrap();
    Arc::new(controller)
}

fn create_test_app() -> Router {
    create_router(AppState::new(running_controller()))
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn send(app: Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

/// Find an available port for testing
fn find_available_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .expect("Failed to bind to address")
        .local_addr()
        .expect("Failed to get local address")
        .port()
}

#[tokio::test]
async fn test_status_reports_fleet() {
    let (status, body) = send(create_test_app(), get("/v1/status")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["stats"]["groups"], 2);
    assert_eq!(body["stats"]["active_instances"], 4);
}

#[tokio::test]
async fn test_list_and_get_groups() {
    let app = create_test_app();

    let (status, body) = send(app.clone(), get("/v1/groups")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 2);
    assert_eq!(body[0]["name"], "web-servers-standard");

    let (status, body) = send(app.clone(), get("/v1/groups/web-servers-warm-pool")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["current_size"], 2);
    assert_eq!(body["warm_pool"]["current_size"], 1);

    let (status, body) = send(app, get("/v1/groups/missing")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].as_str().unwrap().contains("missing"));
}

#[tokio::test]
async fn test_scale_out_then_refused_at_max() {
    let app = create_test_app();
    let uri = "/v1/groups/web-servers-standard/scale";

    let (status, body) = send(app.clone(), post(uri, json!({"action": "scale_out"}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body,
        json!({
            "previous_capacity": 2,
            "new_capacity": 3,
            "min_size": 1,
            "max_size": 5,
            "success": true
        })
    );

    let (_, body) = send(app.clone(), post(uri, json!({"action": "set_capacity", "capacity": 5}))).await;
    assert_eq!(body["new_capacity"], 5);

    let (status, body) = send(app, post(uri, json!({"action": "scale_out"}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], false);
    assert_eq!(body["new_capacity"], 5);
    assert!(body["message"].as_str().unwrap().contains("maximum"));
}

#[tokio::test]
async fn test_invalid_scaling_requests() {
    let app = create_test_app();
    let uri = "/v1/groups/web-servers-standard/scale";

    let (status, _) = send(app.clone(), post(uri, json!({"action": "teleport"}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(app.clone(), post(uri, json!({"action": "set_capacity"}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (_, body) = send(app, get("/v1/groups/web-servers-standard")).await;
    assert_eq!(body["current_size"], 2);
}

#[tokio::test]
async fn test_traffic_then_evaluate_scales_out() {
    let app = create_test_app();

    let (status, body) = send(
        app.clone(),
        post("/v1/groups/web-servers-standard/traffic", json!({"load": 85.0})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["instances"][0]["cpu_utilization"], 85.0);

    let (status, body) = send(app, post("/v1/groups/web-servers-standard/evaluate", json!({}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["added"].as_array().unwrap().len(), 1);
    assert_eq!(body["policies_fired"], 1);
}

#[tokio::test]
async fn test_metrics_and_health_check() {
    let app = create_test_app();

    let (status, body) = send(
        app.clone(),
        post(
            "/v1/groups/web-servers-standard/metrics",
            json!({
                "metric": "cpu_utilization",
                "samples": {"web-servers-standard-instance-1": 12.5, "ghost": 99.0}
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["matched"], 1);

    let (status, body) = send(app, post("/v1/groups/web-servers-standard/health-check", json!({}))).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_group_that_never_started_is_409() {
    let controller =
        FleetController::from_manifest(&Manifest::demo(), Arc::new(ManualClock::new())).unwrap();
    let app = create_router(AppState::new(Arc::new(controller)));
    let base = "/v1/groups/web-servers-standard";

    for (path, body) in [
        ("evaluate", json!({})),
        ("health-check", json!({})),
        ("traffic", json!({"load": 10.0})),
        ("metrics", json!({"metric": "cpu_utilization", "samples": {}})),
    ] {
        let (status, body) = send(app.clone(), post(&format!("{}/{}", base, path), body)).await;
        assert_eq!(status, StatusCode::CONFLICT, "{}", path);
        assert!(body["error"].as_str().unwrap().contains("not running"));
    }

    let (_, body) = send(app, get(base)).await;
    assert_eq!(body["state"], "not_started");
    assert_eq!(body["current_size"], 0);
}

#[tokio::test]
async fn test_stopped_group_is_409_and_stays_empty() {
    let controller = running_controller();
    controller.stop_all();
    let app = create_router(AppState::new(controller));
    let base = "/v1/groups/web-servers-standard";

    let (status, _) = send(app.clone(), post(&format!("{}/evaluate", base), json!({}))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    let (status, _) = send(
        app.clone(),
        post(&format!("{}/scale", base), json!({"action": "scale_out"})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (_, body) = send(app, get(base)).await;
    assert_eq!(body["state"], "stopped");
    assert_eq!(body["current_size"], 0);
}

#[tokio::test]
async fn test_out_of_range_metric_samples_rejected() {
    let app = create_test_app();
    let uri = "/v1/groups/web-servers-standard/metrics";

    let (status, _) = send(
        app.clone(),
        post(
            uri,
            json!({
                "metric": "memory_utilization",
                "samples": {"web-servers-standard-instance-1": 250.0}
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = send(
        app,
        post(
            uri,
            json!({
                "metric": "network_in",
                "samples": {"web-servers-standard-instance-1": 250.0}
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["matched"], 1);
}

#[tokio::test]
async fn test_security_group_validation() {
    let app = create_test_app();

    let (status, body) = send(
        app.clone(),
        post("/v1/security-groups/validate", json!({"group_type": "secure"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body,
        json!({
            "group_id": "sg-secure",
            "group_type": "secure",
            "open_ports": [80],
            "is_correctly_configured": true
        })
    );

    let (_, body) = send(
        app.clone(),
        post("/v1/security-groups/validate", json!({"group_type": "open"})),
    )
    .await;
    assert_eq!(body["open_ports"], "all ports");

    let (status, body) = send(app, get("/v1/security-groups")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 6);
}

#[tokio::test]
async fn test_authorize_flows() {
    let app = create_test_app();
    let flow = |src: &str, port: u16| {
        json!({
            "direction": "inbound",
            "traffic": {
                "source_ip": src,
                "destination_ip": "10.0.0.5",
                "protocol": "tcp",
                "port": port
            }
        })
    };

    let (status, body) = send(
        app.clone(),
        post(
            "/v1/security-groups/sg-001/authorize",
            json!({"flows": [flow("203.0.113.10", 443), flow("203.0.113.10", 22)]}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["group_id"], "sg-001");
    assert_eq!(body["decisions"][0]["allowed"], true);
    assert_eq!(body["decisions"][1]["allowed"], false);

    let (status, _) = send(
        app,
        post("/v1/security-groups/sg-404/authorize", json!({"flows": []})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_client_against_live_server() {
    let port = find_available_port();
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", port)).await.unwrap();
    let app = create_test_app();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let client = ControlPlaneClient::new(format!("http://127.0.0.1:{}", port));

    let status = client.status().await.unwrap();
    assert_eq!(status.stats.running_groups, 2);

    let reply = client
        .scale("web-servers-standard", &ScalingRequest::new("scale_in", None))
        .await
        .unwrap();
    assert!(reply.success);
    assert_eq!(reply.new_capacity, 1);

    let group = client.get_group("web-servers-standard").await.unwrap();
    assert_eq!(group.current_size, 1);

    let report = client.validate_security_group(GroupType::Open).await.unwrap();
    assert!(report.is_correctly_configured);

    let err = client.get_group("nope").await.unwrap_err();
    assert!(err.to_string().contains("not found"));
}
