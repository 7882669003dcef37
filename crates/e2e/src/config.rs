//! Engine configuration
//!
//! One `E2eConfig` is built per run (TOML file, then CLI overrides) and handed
//! to every driver and flow constructor.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::drivers::playwright::Browser;
use crate::error::{E2eError, E2eResult};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct E2eConfig {
    pub api: ApiConfig,
    pub web: WebConfig,
    pub mobile: MobileConfig,
    pub timeouts: TimeoutConfig,
    pub reports: ReportConfig,
    pub flow: FlowConfig,
}

/// Backend REST API
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Base URL every REST path is appended to
    pub base_url: String,

    /// Liveness endpoint, relative to `base_url`
    pub health_path: String,

    pub auth: ApiAuth,

    /// Attempts for idempotent requests
    pub retry_attempts: u32,
    pub retry_delay_ms: u64,
    pub retry_backoff: f64,

    /// Consecutive failed requests before the circuit opens
    pub circuit_failure_threshold: u32,
    pub circuit_reset_ms: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080/api".to_string(),
            health_path: "/health".to_string(),
            auth: ApiAuth::None,
            retry_attempts: 3,
            retry_delay_ms: 500,
            retry_backoff: 2.0,
            circuit_failure_threshold: 5,
            circuit_reset_ms: 30_000,
        }
    }
}

/// Authentication attached to every API request
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ApiAuth {
    #[default]
    None,
    Bearer { token: String },
    /// Test-only bypass understood by the backend
    UserId { user_id: String },
}

/// Restaurant dashboard driven through Playwright
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebConfig {
    pub enabled: bool,
    pub base_url: String,
    pub username: String,
    pub password: String,
    pub headless: bool,
    pub browser: Browser,
    pub viewport_width: u32,
    pub viewport_height: u32,
    /// Node binary running the Playwright bridge
    pub node_path: String,
    pub slow_mo_ms: u64,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: "http://localhost:3000".to_string(),
            username: "restaurant@foodflow.test".to_string(),
            password: "password".to_string(),
            headless: true,
            browser: Browser::Chromium,
            viewport_width: 1280,
            viewport_height: 720,
            node_path: "node".to_string(),
            slow_mo_ms: 0,
        }
    }
}

/// Mobile app driven through Maestro
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MobileConfig {
    pub tool: String,
    pub app_id: String,
    pub adb_path: String,
    /// Passed to every flow as `-e KEY=value`
    pub env: BTreeMap<String, String>,
}

impl Default for MobileConfig {
    fn default() -> Self {
        Self {
            tool: "maestro".to_string(),
            app_id: "com.foodflow.app".to_string(),
            adb_path: "adb".to_string(),
            env: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Fallback for operations without a dedicated budget
    pub default_ms: u64,
    /// Waiting for the API to come up
    pub api_ms: u64,
    /// A single HTTP request
    pub request_ms: u64,
    /// A single browser operation
    pub web_ms: u64,
    /// A whole Maestro flow
    pub mobile_ms: u64,
    /// Convergence window for cross-platform checks
    pub sync_ms: u64,
    /// Settle time before the first cross-platform check
    pub sync_delay_ms: u64,
    pub poll_interval_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            default_ms: 10_000,
            api_ms: 30_000,
            request_ms: 10_000,
            web_ms: 15_000,
            mobile_ms: 120_000,
            sync_ms: 10_000,
            sync_delay_ms: 2_000,
            poll_interval_ms: 500,
        }
    }
}

impl TimeoutConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_ms)
    }

    pub fn api(&self) -> Duration {
        Duration::from_millis(self.api_ms)
    }

    pub fn request(&self) -> Duration {
        Duration::from_millis(self.request_ms)
    }

    pub fn web(&self) -> Duration {
        Duration::from_millis(self.web_ms)
    }

    pub fn mobile(&self) -> Duration {
        Duration::from_millis(self.mobile_ms)
    }

    pub fn sync(&self) -> Duration {
        Duration::from_millis(self.sync_ms)
    }

    pub fn sync_delay(&self) -> Duration {
        Duration::from_millis(self.sync_delay_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportConfig {
    pub dir: PathBuf,
    /// Write the DataStore through to `<dir>/data/<flow>.json`
    pub persist_data: bool,
    pub screenshot_on_failure: bool,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("e2e-reports"),
            persist_data: false,
            screenshot_on_failure: true,
        }
    }
}

impl ReportConfig {
    pub fn screenshot_dir(&self) -> PathBuf {
        self.dir.join("screenshots")
    }

    pub fn data_path(&self, flow_name: &str) -> PathBuf {
        self.dir.join("data").join(format!("{}.json", flow_name))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowConfig {
    /// Restaurant to run against; first one returned by the API when unset
    pub restaurant_id: Option<i64>,
    /// Delete data created purely for the test
    pub cleanup: bool,
    pub use_maestro: bool,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            restaurant_id: None,
            cleanup: true,
            use_maestro: false,
        }
    }
}

impl E2eConfig {
    /// Load configuration from file, falling back to defaults when it does not exist.
    pub fn load(path: &Path) -> E2eResult<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> E2eResult<()> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> E2eResult<()> {
        if self.api.base_url.trim().is_empty() {
            return Err(E2eError::Config("api.base_url is empty".into()));
        }
        if self.web.enabled && self.web.base_url.trim().is_empty() {
            return Err(E2eError::Config("web.base_url is empty".into()));
        }
        if self.flow.use_maestro && self.mobile.app_id.trim().is_empty() {
            return Err(E2eError::Config("mobile.app_id is empty".into()));
        }

        let t = &self.timeouts;
        let budgets = [
            ("timeouts.default_ms", t.default_ms),
            ("timeouts.api_ms", t.api_ms),
            ("timeouts.request_ms", t.request_ms),
            ("timeouts.web_ms", t.web_ms),
            ("timeouts.mobile_ms", t.mobile_ms),
            ("timeouts.sync_ms", t.sync_ms),
            ("timeouts.poll_interval_ms", t.poll_interval_ms),
        ];
        if let Some((name, _)) = budgets.iter().find(|(_, ms)| *ms == 0) {
            return Err(E2eError::Config(format!("{} must be greater than zero", name)));
        }
        if self.api.retry_attempts == 0 {
            return Err(E2eError::Config("api.retry_attempts must be at least 1".into()));
        }
        Ok(())
    }
}
