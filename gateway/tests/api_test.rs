use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::http::{header, Method, Request, StatusCode};
use axum::response::Response;
use axum::Router;
use serde_json::{json, Value as Json};
use tower::ServiceExt;

use modelgate::test_util::{config_with_steps, create_test_state, script_step, test_config};
use modelgate::{build_router, AppState};
use modelgate_backends::BackendRegistry;

async fn state() -> Arc<AppState> {
    create_test_state(test_config(), BackendRegistry::with_builtin())
        .await
        .unwrap()
}

async fn call(app: &Router, method: Method, uri: &str, body: Body) -> Response {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(body)
        .unwrap();
    app.clone().oneshot(request).await.unwrap()
}

async fn body_json(response: Response) -> Json {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_healthcheck_when_warm() {
    let app = build_router(state().await);
    let response = call(&app, Method::GET, "/healthcheck", Body::empty()).await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn test_draining_refuses_requests() {
    let state = state().await;
    let app = build_router(state.clone());
    state.lifecycle.shutdown().await;

    let health = call(&app, Method::GET, "/healthcheck", Body::empty()).await;
    assert_eq!(health.status(), StatusCode::SERVICE_UNAVAILABLE);

    let response = call(&app, Method::POST, "/json/json", Body::from(r#"{"first":[1]}"#)).await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body_json(response).await["kind"], "NotReady");
}

#[tokio::test]
async fn test_config_describes_pipeline() {
    let app = build_router(state().await);
    let response = call(&app, Method::GET, "/config", Body::empty()).await;
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    assert_eq!(body["input"], json!([{"name": "first", "kind": "list"}]));
    assert_eq!(body["output"], json!([{"name": "second", "kind": "list"}]));
    assert_eq!(body["steps"][0]["name"], "add");
    assert_eq!(body["steps"][0]["type"], "script");
    assert_eq!(body["steps"][0]["state"], "RUNNING");
    assert_eq!(body["inputDataFormats"].as_array().unwrap().len(), 5);
}

#[tokio::test]
async fn test_metrics_count_requests() {
    let app = build_router(state().await);
    call(&app, Method::POST, "/json/json", Body::from(r#"{"first":[1]}"#)).await;

    let response = call(&app, Method::GET, "/metrics", Body::empty()).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers()[header::CONTENT_TYPE]
        .to_str()
        .unwrap()
        .starts_with("text/plain"));
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text.contains("modelgate_requests_total{route=\"/:out/:input\",status=\"2xx\"} 1"));
    assert!(text.contains("modelgate_stage_duration_seconds_count{stage=\"add\"} 1"));
}

#[tokio::test]
async fn test_unknown_encoding_is_unsupported_media() {
    let app = build_router(state().await);
    let response = call(&app, Method::POST, "/json/protobuf", Body::from("{}")).await;
    assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
    assert_eq!(body_json(response).await["kind"], "UnsupportedMedia");
}

#[tokio::test]
async fn test_configured_format_restricts_pair() {
    let mut config = test_config();
    config.input_data_format = Some(modelgate::Encoding::Json);
    let app = build_router(create_test_state(config, BackendRegistry::with_builtin()).await.unwrap());
    let response = call(&app, Method::POST, "/json/numpy", Body::from("x")).await;
    assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
}

#[tokio::test]
async fn test_body_limit_is_inclusive() {
    let body = r#"{"first":[1]}"#;
    let mut config = test_config();
    config.max_body_bytes = body.len();
    let app = build_router(create_test_state(config, BackendRegistry::with_builtin()).await.unwrap());

    let at_limit = call(&app, Method::POST, "/json/json", Body::from(body)).await;
    assert_eq!(at_limit.status(), StatusCode::OK);

    let over = call(&app, Method::POST, "/json/json", Body::from(format!("{} ", body))).await;
    assert_eq!(over.status(), StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(body_json(over).await["kind"], "PayloadTooLarge");
}

#[tokio::test]
async fn test_malformed_json_is_bad_request() {
    let app = build_router(state().await);
    let response = call(&app, Method::POST, "/json/json", Body::from("{first")).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let missing = call(&app, Method::POST, "/json/json", Body::from("{}")).await;
    assert_eq!(missing.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_script_error_is_unprocessable() {
    let mut step = script_step();
    step["code"] = json!(r#"if first.len() > 2 { throw "too many values"; } second = first"#);
    let state = create_test_state(config_with_steps(vec![step]), BackendRegistry::with_builtin())
        .await
        .unwrap();
    let app = build_router(state);

    let response = call(&app, Method::POST, "/json/json", Body::from(r#"{"first":[1,2,3]}"#)).await;
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let body = body_json(response).await;
    assert_eq!(body["kind"], "UserScriptError");
    assert!(body["message"].as_str().unwrap().contains("too many values"));
}

#[tokio::test]
async fn test_suffix_route_starts_at_step() {
    let second = json!({
        "type": "script",
        "name": "double",
        "code": "third = second * 2",
        "inputs": [{"name": "second", "kind": "list"}],
        "outputs": [{"name": "third", "kind": "list"}]
    });
    let state = create_test_state(
        config_with_steps(vec![script_step(), second]),
        BackendRegistry::with_builtin(),
    )
    .await
    .unwrap();
    let app = build_router(state);

    let full = call(&app, Method::POST, "/json/json", Body::from(r#"{"first":[1]}"#)).await;
    assert_eq!(body_json(full).await, json!({"third": [6]}));

    let suffix = call(&app, Method::POST, "/json/json/double", Body::from(r#"{"second":[1]}"#)).await;
    assert_eq!(suffix.status(), StatusCode::OK);
    assert_eq!(body_json(suffix).await, json!({"third": [2]}));

    let unknown = call(&app, Method::POST, "/json/json/nope", Body::from("{}")).await;
    assert_eq!(unknown.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_json_field_order_survives_round_trip() {
    let step = json!({
        "type": "script",
        "name": "shift",
        "code": "zeta = zeta + 1; alpha = alpha * 2; mid = \"m\"",
        "inputs": [{"name": "zeta", "kind": "int64"}, {"name": "alpha", "kind": "int64"}],
        "outputs": [
            {"name": "zeta", "kind": "int64"},
            {"name": "alpha", "kind": "int64"},
            {"name": "mid", "kind": "string"}
        ]
    });
    let state = create_test_state(config_with_steps(vec![step]), BackendRegistry::with_builtin())
        .await
        .unwrap();
    let app = build_router(state);

    let response = call(&app, Method::POST, "/json/json", Body::from(r#"{"zeta":1,"alpha":2}"#)).await;
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&bytes[..], br#"{"zeta":2,"alpha":4,"mid":"m"}"#);
}

#[tokio::test]
async fn test_response_carries_request_id() {
    let app = build_router(state().await);
    let response = call(&app, Method::POST, "/json/json", Body::from(r#"{"first":[1]}"#)).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key("x-request-id"));
}
