use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::http::{header, Method, Request, StatusCode};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use quarks_statefulset::quarks::controller::runtime::ControllerRuntime;
use quarks_statefulset::quarks::k8s::memory::InMemoryCluster;
use quarks_statefulset::quarks::server::handlers::AdmissionReview;
use quarks_statefulset::quarks::server::{build_router, ServerState};
use serde_json::{json, Value};
use tower::ServiceExt;

fn router() -> axum::Router {
    build_router(ServerState {
        client: Arc::new(InMemoryCluster::new()),
        runtime: ControllerRuntime::new(),
        namespace: None,
    })
}

fn review(object: Value) -> Value {
    json!({
        "apiVersion": "admission.k8s.io/v1",
        "kind": "AdmissionReview",
        "request": {
            "uid": "705ab4f5-6393-11e8-b7cc-42010a800002",
            "namespace": "cf",
            "operation": "CREATE",
            "object": object,
        },
    })
}

async fn post(body: Value) -> (StatusCode, Vec<u8>) {
    let request = Request::builder()
        .method(Method::POST)
        .uri("/mutate-pods")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(serde_json::to_vec(&body).expect("encode")))
        .expect("request");
    let response = router().oneshot(request).await.expect("response");
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    (status, bytes.to_vec())
}

#[tokio::test]
async fn zoned_pod_gets_ordinal_zone_and_claim_patch() {
    let pod = json!({
        "metadata": {
            "name": "db-z1-v3-1",
            "labels": {
                "quarks.cloudfoundry.org/quarks-statefulset-name": "db",
                "quarks.cloudfoundry.org/az-index": "1",
            },
            "annotations": {
                "quarks.cloudfoundry.org/zones": "[\"z1\",\"z2\",\"z3\"]",
            },
        },
        "spec": {
            "containers": [{"name": "db", "image": "postgres:16"}],
            "volumes": [
                {"name": "data", "persistentVolumeClaim": {"claimName": "data-db-z1-v3-1"}},
                {"name": "scratch", "emptyDir": {}},
            ],
        },
    });

    let (status, body) = post(review(pod)).await;
    assert_eq!(status, StatusCode::OK);

    let answer: AdmissionReview = serde_json::from_slice(&body).expect("review");
    assert_eq!(answer.api_version, "admission.k8s.io/v1");
    assert_eq!(answer.kind, "AdmissionReview");
    let response = answer.response.expect("response");
    assert_eq!(response.uid, "705ab4f5-6393-11e8-b7cc-42010a800002");
    assert!(response.allowed);
    assert_eq!(response.patch_type.as_deref(), Some("JSONPatch"));

    let patch = STANDARD
        .decode(response.patch.expect("patch"))
        .expect("base64");
    let operations: Vec<Value> = serde_json::from_slice(&patch).expect("json patch");
    let labels = operations
        .iter()
        .find(|op| op["path"] == "/metadata/labels")
        .expect("labels op");
    assert_eq!(labels["op"], "add");
    assert_eq!(labels["value"]["quarks.cloudfoundry.org/pod-ordinal"], "4");
    assert_eq!(labels["value"]["quarks.cloudfoundry.org/az-name"], "z2");

    let volumes = operations
        .iter()
        .find(|op| op["path"] == "/spec/volumes")
        .expect("volumes op");
    assert_eq!(
        volumes["value"][0]["persistentVolumeClaim"]["claimName"],
        "data-db-4"
    );
    assert_eq!(volumes["value"][1]["name"], "scratch");
    assert!(volumes["value"][1].get("emptyDir").is_some());
}

#[tokio::test]
async fn foreign_pods_are_admitted_untouched() {
    let pod = json!({
        "metadata": {"name": "nginx-0", "labels": {"app": "nginx"}},
        "spec": {"containers": [{"name": "nginx"}]},
    });

    let (status, body) = post(review(pod)).await;
    assert_eq!(status, StatusCode::OK);

    let answer: Value = serde_json::from_slice(&body).expect("json");
    assert_eq!(answer["response"]["allowed"], true);
    assert!(answer["response"].get("patch").is_none());
    assert!(answer["response"].get("patchType").is_none());
}

#[tokio::test]
async fn review_without_request_is_rejected() {
    let (status, _) = post(json!({
        "apiVersion": "admission.k8s.io/v1",
        "kind": "AdmissionReview",
    }))
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn liveness_is_always_ok() {
    let response = router()
        .oneshot(Request::get("/livez").body(Body::empty()).expect("request"))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
}
