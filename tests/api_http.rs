// tests/api_http.rs
//
// HTTP-level tests for the public API Router without opening sockets.
// We exercise the router directly via tower::ServiceExt::oneshot.

mod common;

use axum::{
    body::{self, Body},
    http::{Request, StatusCode},
    Router,
};
use chrono::Utc;
use serde_json::{json, Value as Json};
use tower::ServiceExt as _; // for `oneshot`

use common::{catalog_with, MockAdapter};
use fire_ingest_pipeline::api::{self, AppState};
use fire_ingest_pipeline::{Pipeline, PipelineConfig};

const BODY_LIMIT: usize = 1024 * 1024;

async fn test_router() -> Router {
    let pipeline = Pipeline::start(PipelineConfig::in_memory(), catalog_with(MockAdapter::ok()))
        .await
        .expect("pipeline starts");
    api::router(AppState::new(pipeline))
}

async fn call(app: &Router, method: &str, uri: &str, body: Option<Json>) -> (StatusCode, Json) {
    let mut req = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(v) => {
            req = req.header("content-type", "application/json");
            Body::from(v.to_string())
        }
        None => Body::empty(),
    };
    let resp = app.clone().oneshot(req.body(body).unwrap()).await.unwrap();
    let status = resp.status();
    let bytes = body::to_bytes(resp.into_body(), BODY_LIMIT).await.unwrap();
    let json = serde_json::from_slice(&bytes).unwrap_or(Json::Null);
    (status, json)
}

fn source(id: &str, name: &str, interval: u64) -> Json {
    json!({
        "id": id,
        "name": name,
        "source_type": "satellite-fire",
        "polling_interval_secs": interval,
        "connection": { "township": "Paradise" }
    })
}

#[tokio::test]
async fn health_returns_ok() {
    let app = test_router().await;
    let resp = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let bytes = body::to_bytes(resp.into_body(), BODY_LIMIT).await.unwrap();
    assert_eq!(String::from_utf8(bytes.to_vec()).unwrap().trim(), "OK");
}

#[tokio::test]
async fn source_registration_and_lifecycle() {
    let app = test_router().await;

    let (status, body) = call(&app, "POST", "/sources", Some(source("s1", "Camp fire feed", 0))).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["id"], "s1");

    let (status, body) = call(&app, "POST", "/sources", Some(source("s2", "camp FIRE feed", 0))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST, "duplicate name: {body}");

    let (status, body) = call(&app, "GET", "/sources", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 1);

    let (status, body) = call(&app, "POST", "/sources/s1/fetch", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["records_processed"], 1);

    let (status, body) = call(&app, "GET", "/sources/status", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["s1"]["total_fetches"], 1);

    let (status, _) = call(&app, "PUT", "/sources/s1", Some(source("ignored", "Camp fire feed", 3600))).await;
    assert_eq!(status, StatusCode::OK);
    let (_, body) = call(&app, "GET", "/sources/s1", None).await;
    assert_eq!(body["config"]["polling_interval_secs"], 3600.0);

    let (status, body) = call(&app, "POST", "/sources/s1/start", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["changed"], true);
    let (_, body) = call(&app, "POST", "/sources/s1/start", None).await;
    assert_eq!(body["changed"], false, "start is idempotent");
    let (_, body) = call(&app, "POST", "/sources/s1/stop", None).await;
    assert_eq!(body["changed"], true);

    let (status, _) = call(&app, "DELETE", "/sources/s1", None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _) = call(&app, "DELETE", "/sources/s1", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn unknown_source_ids_are_404() {
    let app = test_router().await;
    for (method, uri) in [
        ("POST", "/sources/nope/start"),
        ("POST", "/sources/nope/stop"),
        ("POST", "/sources/nope/fetch"),
        ("GET", "/sources/nope"),
    ] {
        let (status, body) = call(&app, method, uri, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND, "{method} {uri}");
        assert_eq!(body["error"], "not_found");
    }
    let (status, _) = call(&app, "PUT", "/sources/nope", Some(source("nope", "Nope", 0))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn webhooks_always_acknowledge() {
    let app = test_router().await;
    call(&app, "POST", "/sources", Some(source("hook", "Hook", 0))).await;

    let (status, body) = call(
        &app,
        "POST",
        "/webhooks/satellite_fire?source_id=hook",
        Some(json!({"latitude": 39.76, "longitude": -121.62, "frp": 12.5})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["result"]["outcome"], "accepted");

    // garbage payload: processing fails internally, HTTP still 200
    let req = Request::builder()
        .method("POST")
        .uri("/webhooks/satellite-fire")
        .body(Body::from("not json at all"))
        .unwrap();
    let resp = app.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let (status, body) = call(&app, "POST", "/webhooks/volcano", Some(json!({}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["accepted"], false);
}

#[tokio::test]
async fn township_events_filters_and_summary() {
    let app = test_router().await;
    let now = Utc::now().to_rfc3339();

    for (id, lon, lat, intensity, status) in [
        ("e1", -121.60, 39.75, 8.0, "active"),
        ("e2", -121.50, 39.80, 3.0, "contained"),
    ] {
        let (code, body) = call(
            &app,
            "POST",
            "/fire-events/township/Paradise",
            Some(json!({
                "id": id,
                "geometry": {"longitude": lon, "latitude": lat},
                "properties": {"timestamp": now, "intensity": intensity, "status": status, "acres": 120}
            })),
        )
        .await;
        assert_eq!(code, StatusCode::CREATED);
        assert_eq!(body["township"], "paradise");
    }

    let (_, body) = call(&app, "GET", "/fire-events/township/paradise", None).await;
    assert_eq!(body["totalCount"], 2);

    let (_, body) = call(&app, "GET", "/fire-events/township/Paradise?minIntensity=5", None).await;
    assert_eq!(body["totalCount"], 1);
    assert_eq!(body["events"][0]["id"], "e1");
    assert_eq!(body["events"][0]["properties"]["acres"], 120);

    let (_, body) = call(&app, "GET", "/fire-events/township/Paradise?status=contained", None).await;
    assert_eq!(body["totalCount"], 1);

    let (status, body) = call(&app, "GET", "/fire-events/township/Nowhere", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["totalCount"], 0);

    let (_, summary) = call(&app, "GET", "/fire-events/township/Paradise/summary", None).await;
    assert_eq!(summary["eventCount"], 2);
    assert_eq!(summary["averageIntensity"], 5.5);
    assert_eq!(summary["mostSevereStatus"], "active");

    let (_, today) = call(&app, "GET", "/fire-events/today", None).await;
    assert!(today
        .as_array()
        .unwrap()
        .iter()
        .any(|s| s["township"] == "paradise"));

    let (status, _) = call(&app, "DELETE", "/fire-events/township/Paradise/e2", None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _) = call(&app, "DELETE", "/fire-events/township/Paradise/e2", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = call(
        &app,
        "PUT",
        "/fire-events/township/Paradise/missing",
        Some(json!({
            "id": "missing",
            "geometry": {"longitude": 0.0, "latitude": 0.0},
            "properties": {"timestamp": now}
        })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn bbox_query_is_inclusive_and_validated() {
    let app = test_router().await;
    let now = Utc::now().to_rfc3339();
    for (township, id, lon, lat) in [("Alpha", "corner", -120.0, 38.0), ("Beta", "outside", -110.0, 30.0)] {
        call(
            &app,
            "POST",
            &format!("/fire-events/township/{township}"),
            Some(json!({
                "id": id,
                "geometry": {"longitude": lon, "latitude": lat},
                "properties": {"timestamp": now, "intensity": 4.0}
            })),
        )
        .await;
    }

    let (status, body) = call(
        &app,
        "GET",
        "/fire-events/bbox?minLon=-120&minLat=38&maxLon=-119&maxLat=39",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["totalCount"], 1);
    assert_eq!(body["events"][0]["id"], "corner");

    let (status, _) = call(&app, "GET", "/fire-events/bbox?minLon=-120&minLat=38", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let (status, _) = call(
        &app,
        "GET",
        "/fire-events/bbox?minLon=10&minLat=0&maxLon=-10&maxLat=1",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}
