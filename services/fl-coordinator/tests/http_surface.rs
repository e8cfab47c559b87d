use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use fl_coordinator::{http::router, CoordinatorConfig, FederatedLearningService};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tower::ServiceExt;
use treefed_proto::{
    routes, GlobalModelRequest, GlobalModelResponse, JoinRequest, JoinResponse, ServerStatusResponse,
    SubmitWeightsRequest, SubmitWeightsResponse, WeightsMetadata,
};

async fn call<Req: Serialize, Resp: DeserializeOwned>(app: &Router, route: &str, body: &Req) -> Resp {
    let req = Request::builder()
        .method("POST")
        .uri(route)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_vec(body).unwrap()))
        .unwrap();
    let resp = app.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn app(expected: usize, dir: &tempfile::TempDir) -> Router {
    router(FederatedLearningService::new(CoordinatorConfig::new(expected, dir.path().join("model.json"))))
}

#[tokio::test]
async fn single_client_round_over_http() {
    let dir = tempfile::tempdir().unwrap();
    let app = app(1, &dir);

    let joined: JoinResponse =
        call(&app, routes::JOIN_TRAINING, &JoinRequest { client_id: "c1".into(), capabilities: Default::default() }).await;
    assert!(joined.accepted);

    let doc = br#"{"trees":[{"leaf":1},{"leaf":2}],"feature_importance":{"f1":0.5},"num_features":2}"#.to_vec();
    let stored: SubmitWeightsResponse = call(
        &app,
        routes::SEND_MODEL_WEIGHTS,
        &SubmitWeightsRequest {
            client_id: "c1".into(),
            session_id: joined.session_id.clone(),
            metadata: WeightsMetadata { model_size_bytes: doc.len() as u64, num_trees: 2 },
            model_weights: doc,
        },
    )
    .await;
    assert!(stored.success);

    let model: GlobalModelResponse = call(
        &app,
        routes::GET_GLOBAL_MODEL,
        &GlobalModelRequest { client_id: "c1".into(), session_id: joined.session_id.clone() },
    )
    .await;
    assert!(model.success);
    assert_eq!(model.metadata.num_trees, 2);
    let ensemble: serde_json::Value = serde_json::from_slice(&model.global_model).unwrap();
    assert_eq!(ensemble["trees"][1]["tree_structure"]["leaf"], 2);
    assert_eq!(ensemble["trees"][1]["client_id"], 1);
    assert_eq!(ensemble["feature_importance"]["f1"], 0.5);

    let status: ServerStatusResponse = call(&app, routes::GET_SERVER_STATUS, &serde_json::json!({})).await;
    assert!(status.running);
    assert_eq!(status.expected_clients, 1);
    assert!(!status.aggregation_in_progress);
}

#[tokio::test]
async fn stale_session_reported_in_body_not_status() {
    let dir = tempfile::tempdir().unwrap();
    let app = app(1, &dir);
    let resp: SubmitWeightsResponse = call(
        &app,
        routes::SEND_MODEL_WEIGHTS,
        &SubmitWeightsRequest {
            client_id: "c1".into(),
            session_id: "bogus".into(),
            model_weights: b"{}".to_vec(),
            metadata: WeightsMetadata::default(),
        },
    )
    .await;
    assert!(!resp.success);
    assert_eq!(resp.message, "Invalid session ID");
}

#[tokio::test]
async fn admin_routes_answer_without_body() {
    let dir = tempfile::tempdir().unwrap();
    let app = app(2, &dir);
    for route in [routes::GET_CONNECTED_CLIENTS, routes::GET_TRAINING_STATS, routes::GET_MODEL_INFO] {
        let req = Request::builder().method("POST").uri(route).body(Body::empty()).unwrap();
        let resp = app.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK, "{route}");
    }
}

#[tokio::test]
async fn unknown_route_returns_404() {
    let dir = tempfile::tempdir().unwrap();
    let app = app(1, &dir);
    let req = Request::builder().method("POST").uri("/federated.FederatedLearningService/Nope").body(Body::empty()).unwrap();
    let resp = app.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}
