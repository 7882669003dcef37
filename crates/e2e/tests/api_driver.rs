//! REST driver behaviour against the in-process backend

mod support;

use std::time::Duration;

use foodflow_e2e::models::{NewOrder, OrderItem, OrderStatus};
use foodflow_e2e::retry::CircuitState;
use foodflow_e2e::{ApiDriver, E2eError};

use support::{closed_url, test_config, FakeBackend, RESTAURANT_ID};

#[tokio::test]
async fn test_missing_order_is_not_found() {
    let backend = FakeBackend::start().await;
    let reports = tempfile::tempdir().unwrap();
    let api = ApiDriver::new(&test_config(&backend.api_url(), reports.path())).unwrap();

    let err = api.get_order(999).await.unwrap_err();
    assert!(matches!(err, E2eError::NotFound { .. }), "{:?}", err);
    assert_eq!(err.to_string(), "Order 999 not found");
}

#[tokio::test]
async fn test_missing_restaurant_list_names_what_was_missing() {
    let backend = FakeBackend::start().await;
    let reports = tempfile::tempdir().unwrap();
    // Wrong prefix: every route answers 404
    let url = format!("http://{}/wrong", backend.addr);
    let api = ApiDriver::new(&test_config(&url, reports.path())).unwrap();

    let err = api.get_restaurants().await.unwrap_err();
    assert!(matches!(err, E2eError::NotFound { .. }), "{:?}", err);
    assert_eq!(err.to_string(), "Restaurant list not found");
}

#[tokio::test]
async fn test_order_status_round_trip() {
    let backend = FakeBackend::start().await;
    let reports = tempfile::tempdir().unwrap();
    let api = ApiDriver::new(&test_config(&backend.api_url(), reports.path())).unwrap();

    let menu = api.get_menu_items(RESTAURANT_ID).await.unwrap();
    let order = api
        .create_order(&NewOrder {
            restaurant_id: RESTAURANT_ID,
            items: vec![OrderItem::new(menu[0].id, 2)],
        })
        .await
        .unwrap();
    assert_eq!(order.status, OrderStatus::EnAttente);
    assert_eq!(order.total_price, Some(28.0));

    api.update_order_status(order.id, OrderStatus::EnPreparation)
        .await
        .unwrap();
    let seen = api
        .wait_for_order_status(order.id, OrderStatus::EnPreparation, Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(seen.id, order.id);

    let err = api
        .wait_for_order_status(order.id, OrderStatus::Livree, Duration::from_millis(100))
        .await
        .unwrap_err();
    assert!(err.is_timeout());
}

#[tokio::test]
async fn test_reads_retry_through_server_errors() {
    let backend = FakeBackend::start().await;
    backend.state.lock().failing_gets = 2;
    let reports = tempfile::tempdir().unwrap();
    let api = ApiDriver::new(&test_config(&backend.api_url(), reports.path())).unwrap();

    let restaurants = api.get_restaurants().await.unwrap();
    assert_eq!(restaurants.len(), 1);
    assert_eq!(
        backend
            .state
            .lock()
            .requests
            .iter()
            .filter(|r| *r == "GET /restaurants")
            .count(),
        3
    );
    assert_eq!(api.circuit_breaker().state(), CircuitState::Closed);
}

#[tokio::test]
async fn test_health_and_wait_for_api() {
    let backend = FakeBackend::start().await;
    let reports = tempfile::tempdir().unwrap();
    let api = ApiDriver::new(&test_config(&backend.api_url(), reports.path())).unwrap();
    assert!(api.health_check().await);
    api.wait_for_api(Duration::from_secs(1)).await.unwrap();

    let down = ApiDriver::new(&test_config(&closed_url().await, reports.path())).unwrap();
    assert!(!down.health_check().await);
    let err = down.wait_for_api(Duration::from_millis(300)).await.unwrap_err();
    assert!(err.is_fatal());
}
