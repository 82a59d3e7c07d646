//! HTTP API tests against an in-process router.

mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use common::{at, observation, TestStore, TestStoreBuilder};
use kpistore_lib::api::{router, ApiConfig};
use kpistore_lib::registry::{KpiDefinition, StaticKpiRegistry};
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

fn app(t: &TestStore) -> Router {
    let registry = StaticKpiRegistry::new([KpiDefinition {
        code: "perfect_order_fulfillment".to_string(),
        name: "Perfect Order Fulfillment".to_string(),
        description: None,
        unit: Some("percentage".to_string()),
    }]);
    let config = ApiConfig {
        max_batch_size: 5,
        ..ApiConfig::default()
    };
    router(Arc::clone(&t.store), Arc::new(registry), config)
}

async fn send(app: Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body).unwrap()
    };
    (status, value)
}

fn post(uri: &str, body: Value) -> Request<Body> {
    Request::post(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::get(uri).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn test_health() {
    let t = TestStoreBuilder::new().build();
    let (status, body) = send(app(&t), get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
}

#[tokio::test]
async fn test_append_and_lookup() {
    let t = TestStoreBuilder::new().build();
    let (status, body) = send(
        app(&t),
        post(
            "/v1/observations",
            json!({
                "timestamp": "2024-03-15T10:05:00Z",
                "metric_id": "RL.1.1",
                "kpi_code": "perfect_order_fulfillment",
                "organization_id": 42,
                "value": 98.5,
                "context": {"region": "emea"}
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let id = body["id"].as_u64().unwrap();

    let (status, body) = send(app(&t), get(&format!("/v1/observations/{}", id))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["value"], 98.5);
    assert_eq!(body["organization_id"], "42");
    assert_eq!(body["kpi_name"], "Perfect Order Fulfillment");

    let (status, body) = send(app(&t), get(&format!("/v1/observations/{}", id + 1))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], 404);
}

#[tokio::test]
async fn test_invalid_observation_is_bad_request() {
    let t = TestStoreBuilder::new().build();
    let (status, body) = send(
        app(&t),
        post(
            "/v1/observations",
            json!({
                "timestamp": "2024-03-15T10:05:00Z",
                "metric_id": "RL.1.1",
                "organization_id": "42",
                "value": -5
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["field"], "value");
    assert_eq!(body["category"], "validation");
}

#[tokio::test]
async fn test_expired_window_is_conflict() {
    let t = TestStoreBuilder::new().retention(1, 1, 2).build();
    t.clock.set(at(25, 0, 0));
    let (status, _) = send(
        app(&t),
        post(
            "/v1/observations",
            json!({
                "timestamp": "2024-03-15T10:05:00Z",
                "metric_id": "RL.1.1",
                "organization_id": "42",
                "value": 1.0
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_batch_itemizes_results() {
    let t = TestStoreBuilder::new().build();
    let row = |value: f64| {
        json!({
            "timestamp": "2024-03-15T10:05:00Z",
            "metric_id": "RL.1.1",
            "organization_id": "42",
            "value": value
        })
    };
    let (status, body) = send(
        app(&t),
        post("/v1/observations/batch", json!([row(1.0), row(-1.0), row(3.0)])),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], 3);
    assert_eq!(body["failed"], 1);
    let results = body["results"].as_array().unwrap();
    assert_eq!(results[0]["ok"], true);
    assert_eq!(results[1]["ok"], false);
    assert_eq!(results[1]["error"]["field"], "value");
    assert_eq!(results[2]["ok"], true);

    let oversized: Vec<Value> = (0..6).map(|i| row(f64::from(i))).collect();
    let (status, _) = send(app(&t), post("/v1/observations/batch", Value::Array(oversized))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_batch_isolates_malformed_records() {
    let t = TestStoreBuilder::new().build();
    let row = |minute: u32, value: f64| {
        json!({
            "timestamp": format!("2024-03-15T10:{:02}:00Z", minute),
            "metric_id": "RL.1.1",
            "organization_id": "42",
            "value": value
        })
    };
    let malformed = json!({
        "timestamp": "2024-03-15T10:20:00Z",
        "organization_id": "42",
        "value": 2.0
    });
    let (status, body) = send(
        app(&t),
        post("/v1/observations/batch", json!([row(10, 1.0), malformed, row(30, 3.0)])),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], 3);
    assert_eq!(body["failed"], 1);
    let results = body["results"].as_array().unwrap();
    assert_eq!(results.len(), 3);
    assert_eq!(results[0]["ok"], true);
    assert_eq!(results[1]["ok"], false);
    assert_eq!(results[1]["error"]["category"], "validation");
    assert_eq!(results[1]["error"]["field"], "observation");
    assert_eq!(results[2]["ok"], true);

    // Both well-formed neighbours were stored
    t.store.drain_aggregator();
    let (status, body) = send(
        app(&t),
        get("/v1/observations?metric_id=RL.1.1&organization_id=42&from=2024-03-15T00:00:00Z&to=2024-03-16T00:00:00Z&granularity=hour"),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["buckets"][0]["count"], 2);
    assert_eq!(body["buckets"][0]["sum"], 4.0);
}

#[tokio::test]
async fn test_query_endpoint() {
    let t = TestStoreBuilder::new().build();
    for (minute, value) in [(5, 98.5), (25, 97.0), (45, 99.1)] {
        t.store.append(observation(at(15, 10, minute), "42", value)).unwrap();
    }
    t.store.drain_aggregator();

    let (status, body) = send(
        app(&t),
        get("/v1/observations?metric_id=RL.1.1&organization_id=42&from=2024-03-15T00:00:00Z&to=2024-03-16T00:00:00Z&granularity=hour"),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["plan"], "rollup");
    assert_eq!(body["complete"], true);
    let buckets = body["buckets"].as_array().unwrap();
    assert_eq!(buckets.len(), 1);
    assert_eq!(buckets[0]["count"], 3);
    assert_eq!(buckets[0]["min"], 97.0);
    assert_eq!(buckets[0]["max"], 99.1);

    let (status, body) = send(
        app(&t),
        get("/v1/observations?metric_id=RL.1.1&from=2024-03-15T00:00:00Z&to=2024-03-16T00:00:00Z"),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["field"], "organization_id");

    let (status, _) = send(
        app(&t),
        get("/v1/observations?metric_id=RL.1.1&organization_id=42&from=yesterday&to=2024-03-16T00:00:00Z"),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_status_reports_tiers() {
    let t = TestStoreBuilder::new().build();
    t.store.append(observation(at(15, 10, 0), "42", 1.0)).unwrap();
    let (status, body) = send(app(&t), get("/v1/status")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["partitions"]["hot"], 1);
    assert_eq!(body["stats"]["observations_written"], 1);
}
