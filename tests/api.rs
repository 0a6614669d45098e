//! HTTP surface over the tool registry

mod common;

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use common::*;
use plaid_sync_tool::api::create_router;
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

async fn call(router: axum::Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let mut request = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(value) => {
            request = request.header("content-type", "application/json");
            Body::from(value.to_string())
        }
        None => Body::empty(),
    };

    let response = router.oneshot(request.body(body).unwrap()).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&bytes).unwrap())
}

#[tokio::test]
async fn test_health_and_tool_listing() {
    let h = harness(Backend::File).await;
    let router = create_router(Arc::new(h.app));

    let (status, body) = call(router.clone(), "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");

    let (status, body) = call(router, "GET", "/api/tools", None).await;
    assert_eq!(status, StatusCode::OK);
    let names: Vec<&str> = body
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["name"].as_str().unwrap())
        .collect();
    assert_eq!(
        names,
        vec![
            "get_balance",
            "get_transactions",
            "list_items",
            "register_item",
            "remove_item",
            "sync_transactions"
        ]
    );
}

#[tokio::test]
async fn test_sync_over_http() {
    let h = harness(Backend::Sqlite).await;
    h.aggregator.script(
        None,
        page(vec![txn("T1", "2024-03-01", 100)], vec![], &[], "c1", false),
    );
    let router = create_router(Arc::new(h.app));

    let (status, body) = call(
        router,
        "POST",
        "/api/tools/sync_transactions",
        Some(json!({ "item_id": ITEM, "days_requested": 30 })),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["data"]["added"], 1);
    assert_eq!(body["data"]["next_cursor"], "c1");
    assert_eq!(body["data"]["item_status"], "healthy");
    assert_eq!(body["data"]["summary"], "Added 1 transactions");
}

#[tokio::test]
async fn test_errors_map_to_status_codes() {
    let h = harness(Backend::File).await;
    let router = create_router(Arc::new(h.app));

    let (status, body) = call(
        router.clone(),
        "POST",
        "/api/tools/sync_transactions",
        Some(json!({ "item_id": ITEM, "days_requested": 0 })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["kind"], "invalid_input");

    let (status, body) = call(
        router.clone(),
        "POST",
        "/api/tools/get_balance",
        Some(json!({ "item_id": "it_unknown" })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["retryable"], false);

    let (status, body) = call(router, "POST", "/api/tools/exchange_public_token", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["success"], false);
}

#[tokio::test]
async fn test_register_and_list_never_echo_token() {
    let h = harness(Backend::File).await;
    let router = create_router(Arc::new(h.app));

    let (status, body) = call(
        router.clone(),
        "POST",
        "/api/tools/register_item",
        Some(json!({
            "item_id": "it_2",
            "access_token": TOKEN,
            "institution_name": "Tartan Bank"
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "unknown");
    assert!(!body.to_string().contains(TOKEN));

    let (status, body) = call(router, "POST", "/api/tools/list_items", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["count"], 2);
    assert!(!body.to_string().contains(TOKEN));
}

#[tokio::test]
async fn test_synced_transactions_are_readable() {
    let h = harness(Backend::File).await;
    h.aggregator.script(
        None,
        page(
            vec![
                txn("T2", "2024-03-05", 899),
                txn("T1", "2024-03-01", 1250),
                txn("T3", "2024-03-09", 400),
            ],
            vec![],
            &[],
            "c1",
            false,
        ),
    );
    h.aggregator
        .script(Some("c1"), page(vec![], vec![], &["T3"], "c2", false));
    let router = create_router(Arc::new(h.app));

    for _ in 0..2 {
        let (status, _) = call(
            router.clone(),
            "POST",
            "/api/tools/sync_transactions",
            Some(json!({ "item_id": ITEM })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }

    let (status, body) = call(
        router.clone(),
        "POST",
        "/api/tools/get_transactions",
        Some(json!({ "item_id": ITEM })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["count"], 2);
    let listed: Vec<&str> = body["data"]["transactions"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["transaction_id"].as_str().unwrap())
        .collect();
    assert_eq!(listed, vec!["T1", "T2"]);
    assert_eq!(body["data"]["transactions"][0]["amount"], "12.50");

    let (status, body) = call(
        router.clone(),
        "POST",
        "/api/tools/get_transactions",
        Some(json!({ "item_id": ITEM, "since": "2024-03-02" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["count"], 1);
    assert_eq!(body["data"]["transactions"][0]["transaction_id"], "T2");

    let (status, _) = call(
        router.clone(),
        "POST",
        "/api/tools/get_transactions",
        Some(json!({ "item_id": "it_unknown" })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = call(
        router,
        "POST",
        "/api/tools/get_transactions",
        Some(json!({ "item_id": ITEM, "since": "March" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["kind"], "invalid_input");
}
