//! In-process Foodflow backend and dashboard fakes for integration tests
//!
//! `FakeBackend` serves the REST surface with axum on an ephemeral port.
//! `FakeBrowser` plays the restaurant dashboard over the same state, so a
//! click on "accept" changes what the API returns.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::{Path as UrlPath, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use foodflow_e2e::drivers::playwright::{BrowserBackend, BrowserCommand};
use foodflow_e2e::drivers::web::selectors as sel;
use foodflow_e2e::models::{
    MenuItem, MenuItemUpdate, NewMenuItem, NewOrder, Order, OrderStatus, Restaurant, StatusUpdate,
};
use foodflow_e2e::{
    ApiDriver, DriverSet, E2eConfig, E2eError, E2eResult, FlowContext, MobileDriver, Reporter, WebDriver,
};

pub const RESTAURANT_ID: i64 = 1;

#[derive(Debug, Default)]
pub struct BackendState {
    pub restaurants: Vec<Restaurant>,
    pub menu_items: BTreeMap<i64, MenuItem>,
    pub orders: BTreeMap<i64, Order>,
    next_id: i64,
    /// Answer status updates with 400
    pub reject_status_updates: bool,
    /// Answer this many GET requests with 503 before serving normally
    pub failing_gets: u32,
    /// Dashboard renders order cards without accept/ready buttons
    pub hide_order_actions: bool,
    /// Dashboard menu page never lists items by name
    pub hide_menu_items: bool,
    /// Method and path of every request served
    pub requests: Vec<String>,
}

impl BackendState {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    pub fn add_menu_item(&mut self, name: &str, price: f64) -> i64 {
        let id = self.next_id();
        self.menu_items.insert(
            id,
            MenuItem {
                id,
                name: name.to_string(),
                description: None,
                price,
                category: Some("Plats".to_string()),
                available: true,
                restaurant_id: RESTAURANT_ID,
            },
        );
        id
    }

    pub fn item_named(&self, name: &str) -> Option<&MenuItem> {
        self.menu_items.values().find(|i| i.name == name)
    }
}

pub type SharedState = Arc<Mutex<BackendState>>;

pub struct FakeBackend {
    pub addr: SocketAddr,
    pub state: SharedState,
}

impl FakeBackend {
    /// One restaurant with two dishes on the menu.
    pub async fn start() -> Self {
        let mut state = BackendState::default();
        state.restaurants.push(Restaurant {
            id: RESTAURANT_ID,
            name: "Chez Test".to_string(),
            address: None,
            phone: None,
            description: None,
        });
        state.next_id = 100;
        state.add_menu_item("Couscous royal", 14.0);
        state.add_menu_item("Tajine poulet", 12.5);
        let state = Arc::new(Mutex::new(state));

        let api = Router::new()
            .route("/health", get(|| async { "ok" }))
            .route("/restaurants", get(list_restaurants))
            .route("/restaurants/:id", get(get_restaurant))
            .route("/menu-items", post(create_menu_item))
            .route("/menu-items/restaurant/:id", get(list_menu_items))
            .route(
                "/menu-items/:id",
                get(get_menu_item).put(update_menu_item).delete(delete_menu_item),
            )
            .route("/orders", post(create_order))
            .route("/orders/restaurant/:id", get(list_orders))
            .route("/orders/:id", get(get_order))
            .route("/orders/:id/status", put(update_order_status))
            .with_state(state.clone());
        let app = Router::new().nest("/api", api);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { addr, state }
    }

    pub fn api_url(&self) -> String {
        format!("http://{}/api", self.addr)
    }
}

/// Address nothing listens on
pub async fn closed_url() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{}/api", addr)
}

fn not_found(kind: &str, id: i64) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "message": format!("{} {} introuvable", kind, id) })),
    )
        .into_response()
}

/// Record the request and burn one of the scripted 503s.
fn served(state: &SharedState, request: String, is_get: bool) -> Option<Response> {
    let mut s = state.lock();
    s.requests.push(request);
    if is_get && s.failing_gets > 0 {
        s.failing_gets -= 1;
        return Some(
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "message": "temporarily unavailable" })),
            )
                .into_response(),
        );
    }
    None
}

async fn list_restaurants(State(state): State<SharedState>) -> Response {
    if let Some(r) = served(&state, "GET /restaurants".into(), true) {
        return r;
    }
    Json(state.lock().restaurants.clone()).into_response()
}

async fn get_restaurant(State(state): State<SharedState>, UrlPath(id): UrlPath<i64>) -> Response {
    if let Some(r) = served(&state, format!("GET /restaurants/{}", id), true) {
        return r;
    }
    let s = state.lock();
    match s.restaurants.iter().find(|r| r.id == id) {
        Some(r) => Json(r.clone()).into_response(),
        None => not_found("Restaurant", id),
    }
}

async fn list_menu_items(State(state): State<SharedState>, UrlPath(id): UrlPath<i64>) -> Response {
    if let Some(r) = served(&state, format!("GET /menu-items/restaurant/{}", id), true) {
        return r;
    }
    let s = state.lock();
    let items: Vec<MenuItem> = s
        .menu_items
        .values()
        .filter(|i| i.restaurant_id == id)
        .cloned()
        .collect();
    Json(items).into_response()
}

async fn get_menu_item(State(state): State<SharedState>, UrlPath(id): UrlPath<i64>) -> Response {
    if let Some(r) = served(&state, format!("GET /menu-items/{}", id), true) {
        return r;
    }
    match state.lock().menu_items.get(&id) {
        Some(item) => Json(item.clone()).into_response(),
        None => not_found("Plat", id),
    }
}

async fn create_menu_item(State(state): State<SharedState>, Json(new): Json<NewMenuItem>) -> Response {
    served(&state, "POST /menu-items".into(), false);
    let mut s = state.lock();
    let id = s.next_id();
    let item = MenuItem {
        id,
        name: new.name,
        description: new.description,
        price: new.price,
        category: new.category,
        available: new.available,
        restaurant_id: new.restaurant_id,
    };
    s.menu_items.insert(id, item.clone());
    (StatusCode::CREATED, Json(item)).into_response()
}

async fn update_menu_item(
    State(state): State<SharedState>,
    UrlPath(id): UrlPath<i64>,
    Json(update): Json<MenuItemUpdate>,
) -> Response {
    served(&state, format!("PUT /menu-items/{}", id), false);
    let mut s = state.lock();
    let Some(item) = s.menu_items.get_mut(&id) else {
        return not_found("Plat", id);
    };
    apply_update(item, update);
    Json(item.clone()).into_response()
}

fn apply_update(item: &mut MenuItem, update: MenuItemUpdate) {
    if let Some(name) = update.name {
        item.name = name;
    }
    if update.description.is_some() {
        item.description = update.description;
    }
    if let Some(price) = update.price {
        item.price = price;
    }
    if update.category.is_some() {
        item.category = update.category;
    }
    if let Some(available) = update.available {
        item.available = available;
    }
}

async fn delete_menu_item(State(state): State<SharedState>, UrlPath(id): UrlPath<i64>) -> Response {
    served(&state, format!("DELETE /menu-items/{}", id), false);
    match state.lock().menu_items.remove(&id) {
        Some(_) => StatusCode::NO_CONTENT.into_response(),
        None => not_found("Plat", id),
    }
}

async fn create_order(State(state): State<SharedState>, Json(new): Json<NewOrder>) -> Response {
    served(&state, "POST /orders".into(), false);
    let mut s = state.lock();
    if !s.restaurants.iter().any(|r| r.id == new.restaurant_id) {
        return not_found("Restaurant", new.restaurant_id);
    }
    let id = s.next_id();
    let total: f64 = new
        .items
        .iter()
        .filter_map(|i| s.menu_items.get(&i.menu_item_id).map(|m| m.price * i.quantity as f64))
        .sum();
    let order = Order {
        id,
        restaurant_id: new.restaurant_id,
        user_id: Some("e2e-user".to_string()),
        status: OrderStatus::EnAttente,
        items: new.items,
        total_price: Some(total),
        created_at: None,
    };
    s.orders.insert(id, order.clone());
    (StatusCode::CREATED, Json(order)).into_response()
}

async fn get_order(State(state): State<SharedState>, UrlPath(id): UrlPath<i64>) -> Response {
    if let Some(r) = served(&state, format!("GET /orders/{}", id), true) {
        return r;
    }
    match state.lock().orders.get(&id) {
        Some(order) => Json(order.clone()).into_response(),
        None => not_found("Commande", id),
    }
}

async fn list_orders(State(state): State<SharedState>, UrlPath(id): UrlPath<i64>) -> Response {
    if let Some(r) = served(&state, format!("GET /orders/restaurant/{}", id), true) {
        return r;
    }
    let s = state.lock();
    let orders: Vec<Order> = s
        .orders
        .values()
        .filter(|o| o.restaurant_id == id)
        .cloned()
        .collect();
    Json(orders).into_response()
}

async fn update_order_status(
    State(state): State<SharedState>,
    UrlPath(id): UrlPath<i64>,
    Json(update): Json<StatusUpdate>,
) -> Response {
    served(&state, format!("PUT /orders/{}/status", id), false);
    let mut s = state.lock();
    if s.reject_status_updates {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "message": "transition refusée" })),
        )
            .into_response();
    }
    let Some(order) = s.orders.get_mut(&id) else {
        return not_found("Commande", id);
    };
    order.status = update.status;
    Json(order.clone()).into_response()
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Form {
    Create,
    Edit(i64),
}

/// Dashboard stand-in answering bridge commands from the backend state
pub struct FakeBrowser {
    state: SharedState,
    page: String,
    form: Option<Form>,
    fields: HashMap<String, String>,
    pub commands: Arc<Mutex<Vec<BrowserCommand>>>,
}

impl FakeBrowser {
    pub fn new(state: SharedState) -> Self {
        Self {
            state,
            page: String::new(),
            form: None,
            fields: HashMap::new(),
            commands: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn visible(&self, selector: &str) -> bool {
        let s = self.state.lock();
        if selector == sel::SSO_USERNAME {
            return false;
        }
        if let Some(name) = text_filter(selector) {
            if selector.starts_with("[data-testid^='menu-item-']") {
                return !s.hide_menu_items && s.item_named(&name).is_some();
            }
        }
        if selector.contains("accept-order") || selector.contains("Accepter") {
            return !s.hide_order_actions && order_in(&s, selector, OrderStatus::EnAttente);
        }
        if selector.contains("mark-ready") || selector.contains("Prête") {
            return !s.hide_order_actions && order_in(&s, selector, OrderStatus::EnPreparation);
        }
        if selector.starts_with("[data-testid='order-") {
            return id_in(selector, "order-").is_some_and(|id| s.orders.contains_key(&id));
        }
        if selector.contains("toggle-availability']:checked") {
            let item = id_in(selector, "menu-item-").and_then(|id| s.menu_items.get(&id));
            return item.is_some_and(|i| i.available);
        }
        if selector.starts_with("[data-testid='menu-item-") {
            return id_in(selector, "menu-item-").is_some_and(|id| s.menu_items.contains_key(&id));
        }
        match selector {
            sel::ADD_MENU_ITEM => self.page.ends_with(sel::MENU_PAGE),
            sel::SAVE_MENU_ITEM => self.form.is_some(),
            _ => false,
        }
    }

    fn click(&mut self, selector: &str) -> E2eResult<()> {
        if selector == sel::ADD_MENU_ITEM || selector == sel::ADD_MENU_ITEM_TEXT {
            self.form = Some(Form::Create);
            self.fields.clear();
            return Ok(());
        }
        if selector == sel::SAVE_MENU_ITEM || (selector == sel::LOCAL_SUBMIT && self.form.is_some()) {
            return self.save_form();
        }
        if !selector.contains("[data-testid='") || self.visible(selector) || is_row_action(selector) {
            let mut s = self.state.lock();
            if selector.contains("accept-order") {
                set_status(&mut s, selector, OrderStatus::EnPreparation);
            } else if selector.contains("mark-ready") {
                set_status(&mut s, selector, OrderStatus::Prete);
            } else if selector.contains("edit-menu-item") {
                self.form = id_in(selector, "menu-item-").map(Form::Edit);
                self.fields.clear();
            } else if selector.contains("toggle-availability") {
                if let Some(item) = id_in(selector, "menu-item-").and_then(|id| s.menu_items.get_mut(&id)) {
                    item.available = !item.available;
                }
            } else if selector.contains("delete-menu-item") {
                if let Some(id) = id_in(selector, "menu-item-") {
                    s.menu_items.remove(&id);
                }
            }
            return Ok(());
        }
        Err(E2eError::Timeout(format!("'{}' not clickable", selector)))
    }

    fn save_form(&mut self) -> E2eResult<()> {
        let field = |fields: &HashMap<String, String>, key: &str| fields.get(key).cloned();
        let price = field(&self.fields, sel::ITEM_PRICE).and_then(|p| p.parse::<f64>().ok());
        let mut s = self.state.lock();
        match self.form.take() {
            Some(Form::Create) => {
                let id = s.next_id();
                let item = MenuItem {
                    id,
                    name: field(&self.fields, sel::ITEM_NAME).unwrap_or_default(),
                    description: field(&self.fields, sel::ITEM_DESCRIPTION),
                    price: price.unwrap_or_default(),
                    category: field(&self.fields, sel::ITEM_CATEGORY),
                    available: true,
                    restaurant_id: RESTAURANT_ID,
                };
                s.menu_items.insert(id, item);
            }
            Some(Form::Edit(id)) => {
                let update = MenuItemUpdate {
                    name: field(&self.fields, sel::ITEM_NAME),
                    description: field(&self.fields, sel::ITEM_DESCRIPTION),
                    price,
                    category: field(&self.fields, sel::ITEM_CATEGORY),
                    available: None,
                };
                if let Some(item) = s.menu_items.get_mut(&id) {
                    apply_update(item, update);
                }
            }
            None => {}
        }
        Ok(())
    }
}

fn is_row_action(selector: &str) -> bool {
    ["edit-menu-item", "toggle-availability", "delete-menu-item"]
        .iter()
        .any(|action| selector.contains(action))
}

/// Value of a `:has-text('...')` filter
fn text_filter(selector: &str) -> Option<String> {
    let start = selector.find(":has-text('")? + ":has-text('".len();
    let end = selector.rfind("')")?;
    (end >= start).then(|| selector[start..end].replace("\\'", "'"))
}

/// Numeric id following the first `prefix` in a selector
fn id_in(selector: &str, prefix: &str) -> Option<i64> {
    let start = selector.find(prefix)? + prefix.len();
    let digits: String = selector[start..].chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

fn order_in(state: &BackendState, selector: &str, status: OrderStatus) -> bool {
    id_in(selector, "order-")
        .and_then(|id| state.orders.get(&id))
        .is_some_and(|o| o.status == status)
}

fn set_status(state: &mut BackendState, selector: &str, status: OrderStatus) {
    if let Some(order) = id_in(selector, "order-").and_then(|id| state.orders.get_mut(&id)) {
        order.status = status;
    }
}

#[async_trait]
impl BrowserBackend for FakeBrowser {
    async fn execute(&mut self, command: BrowserCommand) -> E2eResult<Value> {
        self.commands.lock().push(command.clone());
        match command {
            BrowserCommand::Navigate { url, .. } => {
                self.page = url;
                self.form = None;
                Ok(Value::Null)
            }
            BrowserCommand::Fill { selector, value, .. } => {
                self.fields.insert(selector, value);
                Ok(Value::Null)
            }
            BrowserCommand::Click { selector, .. } => {
                self.click(&selector)?;
                Ok(Value::Null)
            }
            BrowserCommand::IsVisible { selector } => Ok(json!(self.visible(&selector))),
            BrowserCommand::WaitFor { selector, .. } => {
                let ready = selector == sel::DASHBOARD || selector == sel::ITEM_NAME || self.visible(&selector);
                if ready {
                    Ok(Value::Null)
                } else {
                    Err(E2eError::Timeout(format!("waiting for '{}'", selector)))
                }
            }
            BrowserCommand::Screenshot { path, .. } => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(&path, b"")?;
                Ok(Value::Null)
            }
            _ => Ok(Value::Null),
        }
    }

    async fn close(&mut self) -> E2eResult<()> {
        Ok(())
    }
}

/// Fast configuration against `api_url`, dashboard off.
pub fn test_config(api_url: &str, reports: &Path) -> E2eConfig {
    let mut config = E2eConfig::default();
    config.api.base_url = api_url.to_string();
    config.api.retry_attempts = 3;
    config.api.retry_delay_ms = 10;
    config.web.enabled = false;
    config.web.username = "chef@chez-test.fr".to_string();
    config.web.password = "secret".to_string();
    config.timeouts.api_ms = 2_000;
    config.timeouts.request_ms = 2_000;
    config.timeouts.web_ms = 1_000;
    config.timeouts.sync_ms = 1_000;
    config.timeouts.sync_delay_ms = 0;
    config.timeouts.poll_interval_ms = 20;
    config.reports.dir = reports.to_path_buf();
    config
}

/// Send driver logs through the test harness. Set `RUST_LOG=debug` to see
/// them with `--nocapture`.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_test_writer()
        .try_init();
}

/// Write an executable shell script into `dir` and return its path.
pub fn stub_tool(dir: &Path, name: &str, body: &str) -> String {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path.to_string_lossy().into_owned()
}

/// `adb` stand-in reporting one emulator
pub fn stub_adb(dir: &Path) -> String {
    stub_tool(
        dir,
        "adb",
        "printf 'List of devices attached\\nemulator-5554\\tdevice\\n\\n'",
    )
}

/// Maestro stand-in that installs fine but prints a failed assertion for
/// every flow while still exiting 0.
pub fn stub_maestro_failing_assertions(dir: &Path) -> String {
    stub_tool(
        dir,
        "maestro",
        "if [ \"$1\" = \"--version\" ]; then echo 1.39.0; exit 0; fi\n\
         echo 'Launch app... COMPLETED'\n\
         echo 'Assert that \"Prête\" is visible... FAILED'",
    )
}

/// Flow context without a dashboard.
pub fn api_context(config: E2eConfig) -> FlowContext {
    init_logging();
    let drivers = DriverSet::new(ApiDriver::new(&config).unwrap());
    let reporter = Reporter::new(config.reports.dir.clone()).quiet();
    FlowContext::new(config, drivers, reporter, CancellationToken::new())
}

/// Flow context whose dashboard is a [`FakeBrowser`] over `state`.
pub fn web_context(mut config: E2eConfig, state: SharedState) -> FlowContext {
    init_logging();
    config.web.enabled = true;
    let web = WebDriver::with_backend(&config, Box::new(FakeBrowser::new(state)));
    let drivers = DriverSet::new(ApiDriver::new(&config).unwrap()).with_web(web);
    let reporter = Reporter::new(config.reports.dir.clone()).quiet();
    FlowContext::new(config, drivers, reporter, CancellationToken::new())
}

/// Flow context with the mobile app driven by `tool`, devices listed by `adb`.
pub fn mobile_context(mut config: E2eConfig, tool: &str, adb: &str, flow_dir: &Path) -> FlowContext {
    init_logging();
    config.flow.use_maestro = true;
    config.mobile.tool = tool.to_string();
    config.mobile.adb_path = adb.to_string();
    config.mobile.app_id = "com.foodflow.test".to_string();
    let mobile = MobileDriver::new(&config).with_flow_dir(flow_dir);
    let drivers = DriverSet::new(ApiDriver::new(&config).unwrap()).with_mobile(mobile);
    let reporter = Reporter::new(config.reports.dir.clone()).quiet();
    FlowContext::new(config, drivers, reporter, CancellationToken::new())
}
