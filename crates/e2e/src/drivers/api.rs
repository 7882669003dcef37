//! REST API driver
//!
//! Every request goes through a shared circuit breaker. Idempotent GETs are
//! additionally retried with backoff; writes are sent once so a flaky network
//! never places the same order twice.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info};

use super::{Driver, Platform};
use crate::config::{ApiAuth, E2eConfig, TimeoutConfig};
use crate::error::{E2eError, E2eResult};
use crate::models::{
    MenuItem, MenuItemUpdate, NewMenuItem, NewOrder, Order, OrderStatus, Restaurant, StatusUpdate,
};
use crate::retry::{retry, RetryOptions, RetryWithCircuitBreaker};
use crate::wait::{wait_for_api_status, with_timeout, StatusWaitOptions};

/// Outcome of a raw API call. Never an error: transport failures are
/// reported with `status == 0`.
#[derive(Debug, Clone)]
pub struct ApiResponse<T> {
    pub ok: bool,
    pub status: u16,
    pub data: Option<T>,
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    fn failed(status: u16, error: impl Into<String>) -> Self {
        Self {
            ok: false,
            status,
            data: None,
            error: Some(error.into()),
        }
    }

    /// Map a failed response to `NotFound` (404) or `Api`.
    pub fn into_result(self, operation: &str, kind: &'static str, id: impl ToString) -> E2eResult<T> {
        match self {
            ApiResponse {
                ok: true,
                data: Some(data),
                ..
            } => Ok(data),
            ApiResponse { ok: true, status, .. } => Err(E2eError::Api {
                operation: operation.to_string(),
                status,
                message: "empty response body".to_string(),
            }),
            ApiResponse { status: 404, .. } => Err(E2eError::NotFound {
                kind,
                id: id.to_string(),
            }),
            ApiResponse { status, error, .. } => Err(E2eError::Api {
                operation: operation.to_string(),
                status,
                message: error.unwrap_or_else(|| "unknown error".to_string()),
            }),
        }
    }
}

pub struct ApiDriver {
    client: Client,
    base_url: String,
    health_path: String,
    auth: ApiAuth,
    retry: RetryOptions,
    breaker: Arc<RetryWithCircuitBreaker>,
    timeouts: TimeoutConfig,
}

impl ApiDriver {
    pub fn new(config: &E2eConfig) -> E2eResult<Self> {
        let client = Client::builder().timeout(config.timeouts.request()).build()?;
        let retry = RetryOptions::new(
            config.api.retry_attempts,
            Duration::from_millis(config.api.retry_delay_ms),
            config.api.retry_backoff,
        )
        .with_max_delay(Duration::from_secs(5));
        let breaker = RetryWithCircuitBreaker::new(
            retry.clone(),
            config.api.circuit_failure_threshold,
            Duration::from_millis(config.api.circuit_reset_ms),
        );

        Ok(Self {
            client,
            base_url: config.api.base_url.trim_end_matches('/').to_string(),
            health_path: config.api.health_path.clone(),
            auth: config.api.auth.clone(),
            retry,
            breaker: Arc::new(breaker),
            timeouts: config.timeouts.clone(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn circuit_breaker(&self) -> &RetryWithCircuitBreaker {
        &self.breaker
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn builder(&self, method: Method, url: &str, body: Option<&Value>) -> RequestBuilder {
        let mut builder = self.client.request(method, url);
        builder = match &self.auth {
            ApiAuth::None => builder,
            ApiAuth::Bearer { token } => builder.bearer_auth(token),
            ApiAuth::UserId { user_id } => builder.header("User-Id", user_id),
        };
        match body {
            Some(body) => builder.json(body),
            None => builder,
        }
    }

    /// Send a request and decode a JSON body into `T`.
    pub async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> ApiResponse<T> {
        let url = self.url(path);
        let operation = format!("{} {}", method, path);
        let options = if method == Method::GET {
            self.retry.clone()
        } else {
            RetryOptions {
                max_attempts: 1,
                ..self.retry.clone()
            }
        };

        debug!("API {}", operation);
        let outcome = self
            .breaker
            .execute_with(options, || {
                let request = self.builder(method.clone(), &url, body.as_ref());
                let operation = operation.clone();
                async move {
                    let response = request.send().await?;
                    let status = response.status();
                    let text = response.text().await?;
                    if status.is_server_error() {
                        return Err(E2eError::Api {
                            operation,
                            status: status.as_u16(),
                            message: error_message(&text),
                        });
                    }
                    Ok((status.as_u16(), text))
                }
            })
            .await;

        match outcome {
            Ok((status, text)) if (200..300).contains(&status) => {
                if text.trim().is_empty() {
                    return ApiResponse {
                        ok: true,
                        status,
                        data: None,
                        error: None,
                    };
                }
                match serde_json::from_str(&text) {
                    Ok(data) => ApiResponse {
                        ok: true,
                        status,
                        data: Some(data),
                        error: None,
                    },
                    Err(e) => ApiResponse::failed(status, format!("invalid response body: {}", e)),
                }
            }
            Ok((status, text)) => {
                debug!("API {} -> {}", operation, status);
                ApiResponse::failed(status, error_message(&text))
            }
            Err(e) => {
                debug!("API {} failed: {}", operation, e);
                ApiResponse::failed(error_status(&e), e.to_string())
            }
        }
    }

    async fn send<T: DeserializeOwned, B: Serialize>(
        &self,
        method: Method,
        path: &str,
        body: &B,
    ) -> E2eResult<ApiResponse<T>> {
        let body = serde_json::to_value(body)?;
        Ok(self.request(method, path, Some(body)).await)
    }

    /// True when the liveness endpoint answers 2xx. Bypasses the breaker.
    pub async fn health_check(&self) -> bool {
        let timeout = self.timeouts.request().min(Duration::from_secs(2));
        let result = self
            .builder(Method::GET, &self.url(&self.health_path), None)
            .timeout(timeout)
            .send()
            .await;
        match result {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!("Health check failed: {}", e);
                false
            }
        }
    }

    /// Block until the API is healthy, or fail the flow's prerequisites.
    pub async fn wait_for_api(&self, timeout: Duration) -> E2eResult<()> {
        let health = retry(
            || async move {
                if self.health_check().await {
                    Ok(())
                } else {
                    Err(E2eError::Timeout("health check not passing".into()))
                }
            },
            RetryOptions::new(u32::MAX, Duration::from_millis(250), 1.5)
                .with_max_delay(Duration::from_secs(2)),
        );

        with_timeout(health, timeout, "waiting for API health")
            .await
            .map_err(|e| {
                E2eError::FatalPrerequisite(format!("API at {} is not reachable: {}", self.base_url, e))
            })?;

        info!("API is healthy at {}", self.base_url);
        Ok(())
    }

    pub async fn get_restaurants(&self) -> E2eResult<Vec<Restaurant>> {
        self.request(Method::GET, "/restaurants", None)
            .await
            .into_result("get restaurants", "Restaurant", "list")
    }

    pub async fn get_restaurant(&self, id: i64) -> E2eResult<Restaurant> {
        self.request(Method::GET, &format!("/restaurants/{}", id), None)
            .await
            .into_result("get restaurant", "Restaurant", id)
    }

    pub async fn get_menu_items(&self, restaurant_id: i64) -> E2eResult<Vec<MenuItem>> {
        self.request(Method::GET, &format!("/menu-items/restaurant/{}", restaurant_id), None)
            .await
            .into_result("get menu items", "Restaurant", restaurant_id)
    }

    pub async fn get_menu_item(&self, id: i64) -> E2eResult<MenuItem> {
        self.request(Method::GET, &format!("/menu-items/{}", id), None)
            .await
            .into_result("get menu item", "Menu item", id)
    }

    pub async fn create_menu_item(&self, item: &NewMenuItem) -> E2eResult<MenuItem> {
        self.send(Method::POST, "/menu-items", item)
            .await?
            .into_result("create menu item", "Restaurant", item.restaurant_id)
    }

    pub async fn update_menu_item(&self, id: i64, update: &MenuItemUpdate) -> E2eResult<MenuItem> {
        self.send(Method::PUT, &format!("/menu-items/{}", id), update)
            .await?
            .into_result("update menu item", "Menu item", id)
    }

    pub async fn delete_menu_item(&self, id: i64) -> E2eResult<()> {
        let response: ApiResponse<Value> = self
            .request(Method::DELETE, &format!("/menu-items/{}", id), None)
            .await;
        if response.ok {
            return Ok(());
        }
        response
            .into_result("delete menu item", "Menu item", id)
            .map(|_| ())
    }

    pub async fn create_order(&self, order: &NewOrder) -> E2eResult<Order> {
        self.send(Method::POST, "/orders", order)
            .await?
            .into_result("create order", "Restaurant", order.restaurant_id)
    }

    pub async fn get_order(&self, id: i64) -> E2eResult<Order> {
        self.request(Method::GET, &format!("/orders/{}", id), None)
            .await
            .into_result("get order", "Order", id)
    }

    pub async fn get_restaurant_orders(&self, restaurant_id: i64) -> E2eResult<Vec<Order>> {
        self.request(Method::GET, &format!("/orders/restaurant/{}", restaurant_id), None)
            .await
            .into_result("get restaurant orders", "Restaurant", restaurant_id)
    }

    pub async fn update_order_status(&self, id: i64, status: OrderStatus) -> E2eResult<Order> {
        self.send(
            Method::PUT,
            &format!("/orders/{}/status", id),
            &StatusUpdate { status },
        )
        .await?
        .into_result("update order status", "Order", id)
    }

    /// Poll an order until it reaches `expected`.
    pub async fn wait_for_order_status(
        &self,
        id: i64,
        expected: OrderStatus,
        timeout: Duration,
    ) -> E2eResult<Order> {
        wait_for_api_status(
            || self.get_order(id),
            expected.as_str(),
            StatusWaitOptions {
                timeout,
                interval: self.timeouts.poll_interval(),
                ..Default::default()
            },
        )
        .await
    }
}

#[async_trait]
impl Driver for ApiDriver {
    fn name(&self) -> &'static str {
        "api"
    }

    fn platform(&self) -> Platform {
        Platform::Api
    }

    async fn start(&mut self) -> E2eResult<()> {
        self.wait_for_api(self.timeouts.api()).await
    }

    async fn stop(&mut self) -> E2eResult<()> {
        Ok(())
    }
}

/// Pull a human readable message out of an error body.
fn error_message(body: &str) -> String {
    if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(body) {
        for key in ["message", "error", "detail"] {
            if let Some(Value::String(msg)) = map.get(key) {
                return msg.clone();
            }
        }
    }
    let trimmed = body.trim();
    if trimmed.is_empty() {
        "no response body".to_string()
    } else {
        trimmed.chars().take(200).collect()
    }
}

fn error_status(err: &E2eError) -> u16 {
    match err {
        E2eError::Api { status, .. } => *status,
        E2eError::RetryExhausted { last, .. } => error_status(last),
        _ => 0,
    }
}
