//! Restaurant dashboard driver

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, info};

use super::playwright::{BrowserBackend, BrowserCommand, LaunchOptions, PlaywrightBridge, WaitState};
use super::{Driver, Platform};
use crate::config::{E2eConfig, WebConfig};
use crate::error::{E2eError, E2eResult};
use crate::models::{MenuItemUpdate, NewMenuItem};
use crate::wait::with_timeout;

/// Dashboard routes and selectors
pub mod selectors {
    pub const LOGIN_PAGE: &str = "/login";
    pub const ORDERS_PAGE: &str = "/orders";
    pub const MENU_PAGE: &str = "/menu";

    pub const SSO_USERNAME: &str = "#username";
    pub const SSO_PASSWORD: &str = "#password";
    pub const SSO_SUBMIT: &str = "#kc-login";
    pub const LOCAL_EMAIL: &str = "input[type=email]";
    pub const LOCAL_PASSWORD: &str = "input[type=password]";
    pub const LOCAL_SUBMIT: &str = "button[type=submit]";
    pub const DASHBOARD: &str = "[data-testid='dashboard']";

    pub const ACCEPT_ORDER: &str = "[data-testid='accept-order']";
    pub const ACCEPT_ORDER_TEXT: &str = "button:has-text('Accepter')";
    pub const ORDER_READY: &str = "[data-testid='mark-ready']";
    pub const ORDER_READY_TEXT: &str = "button:has-text('Prête')";

    pub const ADD_MENU_ITEM: &str = "[data-testid='add-menu-item']";
    pub const ADD_MENU_ITEM_TEXT: &str = "button:has-text('Ajouter')";
    pub const ITEM_NAME: &str = "input[name='name']";
    pub const ITEM_DESCRIPTION: &str = "textarea[name='description']";
    pub const ITEM_PRICE: &str = "input[name='price']";
    pub const ITEM_CATEGORY: &str = "input[name='category']";
    pub const SAVE_MENU_ITEM: &str = "[data-testid='save-menu-item']";
    pub const EDIT_MENU_ITEM: &str = "[data-testid='edit-menu-item']";
    pub const TOGGLE_MENU_ITEM: &str = "[data-testid='toggle-availability']";
    pub const DELETE_MENU_ITEM: &str = "[data-testid='delete-menu-item']";
    pub const CONFIRM_DELETE: &str = "[data-testid='confirm-delete']";
    pub const CONFIRM_DELETE_TEXT: &str = "button:has-text('Confirmer')";

    pub fn order_card(order_id: i64) -> String {
        format!("[data-testid='order-{}']", order_id)
    }

    pub fn menu_item_row(item_id: i64) -> String {
        format!("[data-testid='menu-item-{}']", item_id)
    }

    pub fn menu_item_named(name: &str) -> String {
        format!("[data-testid^='menu-item-']:has-text('{}')", name.replace('\'', "\\'"))
    }

    /// `inner` scoped to the element matched by `outer`
    pub fn within(outer: &str, inner: &str) -> String {
        format!("{} {}", outer, inner)
    }
}

use selectors as sel;

pub struct WebDriver {
    config: WebConfig,
    timeout: Duration,
    poll_interval: Duration,
    screenshot_dir: PathBuf,
    backend: Option<Box<dyn BrowserBackend>>,
}

impl WebDriver {
    pub fn new(config: &E2eConfig) -> Self {
        Self {
            config: config.web.clone(),
            timeout: config.timeouts.web(),
            poll_interval: config.timeouts.poll_interval(),
            screenshot_dir: config.reports.screenshot_dir(),
            backend: None,
        }
    }

    /// Drive an already running backend instead of launching Playwright.
    pub fn with_backend(config: &E2eConfig, backend: Box<dyn BrowserBackend>) -> Self {
        Self {
            backend: Some(backend),
            ..Self::new(config)
        }
    }

    pub fn is_running(&self) -> bool {
        self.backend.is_some()
    }

    fn timeout_ms(&self) -> u64 {
        self.timeout.as_millis() as u64
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else {
            format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
        }
    }

    async fn exec(&mut self, operation: &str, target: &str, command: BrowserCommand) -> E2eResult<Value> {
        // Playwright enforces the operation timeout; the outer one catches a wedged bridge
        let budget = self.timeout + Duration::from_secs(2);
        let backend = self
            .backend
            .as_mut()
            .ok_or_else(|| E2eError::driver("web", operation, target, "browser not started"))?;

        with_timeout(backend.execute(command), budget, operation)
            .await
            .map_err(|e| match e {
                E2eError::Driver { .. } => e,
                other => E2eError::driver("web", operation, target, other),
            })
    }

    pub async fn navigate(&mut self, path: &str) -> E2eResult<()> {
        let url = self.url(path);
        let command = BrowserCommand::Navigate {
            url: url.clone(),
            timeout: self.timeout_ms(),
        };
        self.exec("navigate", &url, command).await?;
        Ok(())
    }

    pub async fn click(&mut self, selector: &str) -> E2eResult<()> {
        let command = BrowserCommand::Click {
            selector: selector.to_string(),
            timeout: self.timeout_ms(),
        };
        self.exec("click", selector, command).await?;
        Ok(())
    }

    /// Replace the content of an input.
    pub async fn type_text(&mut self, selector: &str, text: &str) -> E2eResult<()> {
        let command = BrowserCommand::Fill {
            selector: selector.to_string(),
            value: text.to_string(),
            timeout: self.timeout_ms(),
        };
        self.exec("type", selector, command).await?;
        Ok(())
    }

    pub async fn select(&mut self, selector: &str, value: &str) -> E2eResult<()> {
        let command = BrowserCommand::Select {
            selector: selector.to_string(),
            value: value.to_string(),
            timeout: self.timeout_ms(),
        };
        self.exec("select", selector, command).await?;
        Ok(())
    }

    pub async fn hover(&mut self, selector: &str) -> E2eResult<()> {
        let command = BrowserCommand::Hover {
            selector: selector.to_string(),
            timeout: self.timeout_ms(),
        };
        self.exec("hover", selector, command).await?;
        Ok(())
    }

    pub async fn is_visible(&mut self, selector: &str) -> E2eResult<bool> {
        let command = BrowserCommand::IsVisible {
            selector: selector.to_string(),
        };
        let value = self.exec("is visible", selector, command).await?;
        Ok(value.as_bool().unwrap_or(false))
    }

    pub async fn count(&mut self, selector: &str) -> E2eResult<usize> {
        let command = BrowserCommand::Count {
            selector: selector.to_string(),
        };
        let value = self.exec("count", selector, command).await?;
        Ok(value.as_u64().unwrap_or(0) as usize)
    }

    pub async fn wait_for_selector(&mut self, selector: &str, timeout: Option<Duration>) -> E2eResult<()> {
        let timeout = timeout.unwrap_or(self.timeout);
        let command = BrowserCommand::WaitFor {
            selector: selector.to_string(),
            state: WaitState::Visible,
            timeout: timeout.as_millis() as u64,
        };
        self.exec("wait for", selector, command).await?;
        Ok(())
    }

    pub async fn text_content(&mut self, selector: &str) -> E2eResult<Option<String>> {
        let command = BrowserCommand::TextContent {
            selector: selector.to_string(),
            timeout: self.timeout_ms(),
        };
        let value = self.exec("text content", selector, command).await?;
        Ok(value.as_str().map(str::to_string))
    }

    /// Full-page screenshot saved as `<reports>/screenshots/<name>-<stamp>.png`.
    pub async fn screenshot(&mut self, name: &str) -> E2eResult<PathBuf> {
        std::fs::create_dir_all(&self.screenshot_dir)?;
        let stamp = chrono::Utc::now().format("%Y%m%d-%H%M%S%3f");
        let file: String = name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect();
        let path = self.screenshot_dir.join(format!("{}-{}.png", file, stamp));
        let command = BrowserCommand::Screenshot {
            path: path.clone(),
            full_page: true,
        };
        self.exec("screenshot", name, command).await?;
        Ok(path)
    }

    /// First selector in `candidates` that is currently visible.
    pub async fn first_visible(&mut self, candidates: &[&str]) -> E2eResult<Option<String>> {
        for candidate in candidates {
            if self.is_visible(candidate).await? {
                return Ok(Some(candidate.to_string()));
            }
        }
        Ok(None)
    }

    async fn click_first(&mut self, operation: &str, candidates: &[&str]) -> E2eResult<()> {
        match self.first_visible(candidates).await? {
            Some(selector) => self.click(&selector).await,
            None => Err(E2eError::driver(
                "web",
                operation,
                candidates.join(" | "),
                "no candidate visible",
            )),
        }
    }

    /// Reload `path` until the visibility of `selector` equals `present`.
    async fn poll_page(&mut self, path: &str, selector: &str, present: bool, timeout: Duration) -> E2eResult<()> {
        let start = Instant::now();
        loop {
            self.navigate(path).await?;
            if self.is_visible(selector).await? == present {
                return Ok(());
            }
            let elapsed = start.elapsed();
            if elapsed >= timeout {
                return Err(E2eError::Timeout(format!(
                    "'{}' still {} on {} after {} ms",
                    selector,
                    if present { "missing" } else { "visible" },
                    path,
                    elapsed.as_millis()
                )));
            }
            tokio::time::sleep(self.poll_interval.min(timeout - elapsed)).await;
        }
    }

    /// Log into the dashboard, SSO form first, local form as fallback.
    pub async fn login_restaurant(&mut self) -> E2eResult<()> {
        let username = self.config.username.clone();
        let password = self.config.password.clone();
        self.navigate(sel::LOGIN_PAGE).await?;

        if self.is_visible(sel::SSO_USERNAME).await? {
            debug!("Using SSO login form");
            self.type_text(sel::SSO_USERNAME, &username).await?;
            self.type_text(sel::SSO_PASSWORD, &password).await?;
            self.click_first("login", &[sel::SSO_SUBMIT, sel::LOCAL_SUBMIT]).await?;
        } else {
            debug!("SSO form not found, using local login form");
            self.type_text(sel::LOCAL_EMAIL, &username).await?;
            self.type_text(sel::LOCAL_PASSWORD, &password).await?;
            self.click(sel::LOCAL_SUBMIT).await?;
        }

        self.wait_for_selector(sel::DASHBOARD, None).await?;
        info!("Logged into dashboard as {}", username);
        Ok(())
    }

    pub async fn order_exists(&mut self, order_id: i64) -> E2eResult<bool> {
        self.navigate(sel::ORDERS_PAGE).await?;
        self.is_visible(&sel::order_card(order_id)).await
    }

    /// Wait until the order appears on the orders page.
    pub async fn wait_for_order(&mut self, order_id: i64, timeout: Duration) -> E2eResult<()> {
        self.poll_page(sel::ORDERS_PAGE, &sel::order_card(order_id), true, timeout)
            .await
    }

    pub async fn accept_order(&mut self, order_id: i64) -> E2eResult<()> {
        let card = sel::order_card(order_id);
        self.navigate(sel::ORDERS_PAGE).await?;
        self.wait_for_selector(&card, None).await?;
        let by_id = sel::within(&card, sel::ACCEPT_ORDER);
        let by_text = sel::within(&card, sel::ACCEPT_ORDER_TEXT);
        self.click_first("accept order", &[by_id.as_str(), by_text.as_str()]).await
    }

    pub async fn mark_order_ready(&mut self, order_id: i64) -> E2eResult<()> {
        let card = sel::order_card(order_id);
        self.navigate(sel::ORDERS_PAGE).await?;
        self.wait_for_selector(&card, None).await?;
        let by_id = sel::within(&card, sel::ORDER_READY);
        let by_text = sel::within(&card, sel::ORDER_READY_TEXT);
        self.click_first("mark order ready", &[by_id.as_str(), by_text.as_str()]).await
    }

    async fn fill_menu_form(
        &mut self,
        name: Option<&str>,
        description: Option<&str>,
        price: Option<f64>,
        category: Option<&str>,
    ) -> E2eResult<()> {
        if let Some(name) = name {
            self.type_text(sel::ITEM_NAME, name).await?;
        }
        if let Some(description) = description {
            self.type_text(sel::ITEM_DESCRIPTION, description).await?;
        }
        if let Some(price) = price {
            self.type_text(sel::ITEM_PRICE, &format!("{:.2}", price)).await?;
        }
        if let Some(category) = category {
            self.type_text(sel::ITEM_CATEGORY, category).await?;
        }
        self.click_first("save menu item", &[sel::SAVE_MENU_ITEM, sel::LOCAL_SUBMIT])
            .await
    }

    pub async fn create_menu_item(&mut self, item: &NewMenuItem) -> E2eResult<()> {
        self.navigate(sel::MENU_PAGE).await?;
        self.click_first("open menu item form", &[sel::ADD_MENU_ITEM, sel::ADD_MENU_ITEM_TEXT])
            .await?;
        self.wait_for_selector(sel::ITEM_NAME, None).await?;
        self.fill_menu_form(
            Some(&item.name),
            item.description.as_deref(),
            Some(item.price),
            item.category.as_deref(),
        )
        .await
    }

    pub async fn update_menu_item(&mut self, item_id: i64, update: &MenuItemUpdate) -> E2eResult<()> {
        let row = sel::menu_item_row(item_id);
        self.navigate(sel::MENU_PAGE).await?;
        self.wait_for_selector(&row, None).await?;
        self.click(&sel::within(&row, sel::EDIT_MENU_ITEM)).await?;
        self.wait_for_selector(sel::ITEM_NAME, None).await?;
        self.fill_menu_form(
            update.name.as_deref(),
            update.description.as_deref(),
            update.price,
            update.category.as_deref(),
        )
        .await
    }

    pub async fn toggle_menu_item(&mut self, item_id: i64) -> E2eResult<()> {
        let row = sel::menu_item_row(item_id);
        self.navigate(sel::MENU_PAGE).await?;
        self.wait_for_selector(&row, None).await?;
        self.click(&sel::within(&row, sel::TOGGLE_MENU_ITEM)).await
    }

    pub async fn delete_menu_item(&mut self, item_id: i64) -> E2eResult<()> {
        let row = sel::menu_item_row(item_id);
        self.navigate(sel::MENU_PAGE).await?;
        self.wait_for_selector(&row, None).await?;
        self.click(&sel::within(&row, sel::DELETE_MENU_ITEM)).await?;
        if let Some(confirm) = self
            .first_visible(&[sel::CONFIRM_DELETE, sel::CONFIRM_DELETE_TEXT])
            .await?
        {
            self.click(&confirm).await?;
        }
        Ok(())
    }

    pub async fn menu_item_exists(&mut self, name: &str) -> E2eResult<bool> {
        self.navigate(sel::MENU_PAGE).await?;
        self.is_visible(&sel::menu_item_named(name)).await
    }

    /// Wait until a menu item with this name is listed.
    pub async fn wait_for_menu_item(&mut self, name: &str, timeout: Duration) -> E2eResult<()> {
        self.poll_page(sel::MENU_PAGE, &sel::menu_item_named(name), true, timeout)
            .await
    }

    /// Wait until the availability toggle of `item_id` shows `available`.
    pub async fn wait_for_menu_item_availability(
        &mut self,
        item_id: i64,
        available: bool,
        timeout: Duration,
    ) -> E2eResult<()> {
        let checked = format!("{}:checked", sel::within(&sel::menu_item_row(item_id), sel::TOGGLE_MENU_ITEM));
        self.poll_page(sel::MENU_PAGE, &checked, available, timeout).await
    }

    /// Wait until no menu item with this name is listed.
    pub async fn wait_for_menu_item_gone(&mut self, name: &str, timeout: Duration) -> E2eResult<()> {
        self.poll_page(sel::MENU_PAGE, &sel::menu_item_named(name), false, timeout)
            .await
    }
}

#[async_trait]
impl Driver for WebDriver {
    fn name(&self) -> &'static str {
        "web"
    }

    fn platform(&self) -> Platform {
        Platform::Web
    }

    async fn start(&mut self) -> E2eResult<()> {
        if self.backend.is_some() {
            return Ok(());
        }
        let options = LaunchOptions::from(&self.config);
        let bridge = with_timeout(
            PlaywrightBridge::launch(&options),
            self.timeout,
            "launching browser",
        )
        .await
        .map_err(|e| E2eError::FatalPrerequisite(format!("browser unavailable: {}", e)))?;
        self.backend = Some(Box::new(bridge));
        Ok(())
    }

    async fn stop(&mut self) -> E2eResult<()> {
        if let Some(mut backend) = self.backend.take() {
            backend.close().await?;
            info!("Browser closed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    /// Records commands; `#username` is the only invisible selector.
    struct Recorder {
        log: Arc<Mutex<Vec<BrowserCommand>>>,
        fail_on: Option<&'static str>,
    }

    #[async_trait]
    impl BrowserBackend for Recorder {
        async fn execute(&mut self, command: BrowserCommand) -> E2eResult<Value> {
            self.log.lock().push(command.clone());
            if let Some(fail) = self.fail_on {
                if command.label().contains(fail) {
                    return Err(E2eError::Playwright("element detached".into()));
                }
            }
            Ok(match command {
                BrowserCommand::IsVisible { selector } => Value::Bool(selector != sel::SSO_USERNAME),
                _ => Value::Null,
            })
        }

        async fn close(&mut self) -> E2eResult<()> {
            Ok(())
        }
    }

    fn driver(fail_on: Option<&'static str>) -> (WebDriver, Arc<Mutex<Vec<BrowserCommand>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let backend = Recorder {
            log: log.clone(),
            fail_on,
        };
        let mut config = E2eConfig::default();
        config.web.base_url = "http://dash.test/".into();
        (WebDriver::with_backend(&config, Box::new(backend)), log)
    }

    #[tokio::test]
    async fn test_login_falls_back_to_local_form() {
        let (mut web, log) = driver(None);
        web.login_restaurant().await.unwrap();

        let log = log.lock();
        assert_eq!(
            log[0],
            BrowserCommand::Navigate {
                url: "http://dash.test/login".into(),
                timeout: 15_000
            }
        );
        assert!(log.iter().any(|c| matches!(c,
            BrowserCommand::Fill { selector, .. } if selector == sel::LOCAL_EMAIL)));
        assert!(!log.iter().any(|c| matches!(c,
            BrowserCommand::Fill { selector, .. } if selector == sel::SSO_USERNAME)));
    }

    #[tokio::test]
    async fn test_driver_error_names_operation_and_selector() {
        let (mut web, _) = driver(Some("click:"));
        let err = web.click("#submit").await.unwrap_err();
        match err {
            E2eError::Driver {
                driver,
                operation,
                target,
                ..
            } => {
                assert_eq!(driver, "web");
                assert_eq!(operation, "click");
                assert_eq!(target, "#submit");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_accept_order_clicks_inside_card() {
        let (mut web, log) = driver(None);
        web.accept_order(42).await.unwrap();

        let expected = sel::within(&sel::order_card(42), sel::ACCEPT_ORDER);
        assert!(log.lock().iter().any(|c| matches!(c,
            BrowserCommand::Click { selector, .. } if *selector == expected)));
    }

    #[tokio::test]
    async fn test_not_started_is_a_driver_error() {
        let mut web = WebDriver::new(&E2eConfig::default());
        let err = web.navigate("/orders").await.unwrap_err();
        assert!(err.to_string().contains("browser not started"));
    }

    #[test]
    fn test_menu_item_named_escapes_quotes() {
        assert_eq!(
            sel::menu_item_named("Chef's special"),
            "[data-testid^='menu-item-']:has-text('Chef\\'s special')"
        );
    }
}
