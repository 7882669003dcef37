//! Platform drivers
//!
//! Each driver owns one live external resource (an HTTP client, a browser, a
//! mobile automation tool) for the duration of a flow. Flows receive them as
//! a [`DriverSet`], which remembers start order and stops drivers in reverse.

pub mod api;
pub mod mobile;
pub mod playwright;
pub mod web;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{E2eError, E2eResult};

pub use api::{ApiDriver, ApiResponse};
pub use mobile::{MobileDriver, MobileRunResult, MobileStep};
pub use web::WebDriver;

/// Execution surface a step or stored value belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Mobile,
    Web,
    Api,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Mobile => "mobile",
            Platform::Web => "web",
            Platform::Api => "api",
        }
    }

    pub fn icon(&self) -> &'static str {
        match self {
            Platform::Mobile => "📱",
            Platform::Web => "🌐",
            Platform::Api => "🔌",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle shared by all drivers
#[async_trait]
pub trait Driver: Send {
    fn name(&self) -> &'static str;

    fn platform(&self) -> Platform;

    /// Acquire the external resource. Errors here are prerequisite failures.
    async fn start(&mut self) -> E2eResult<()>;

    /// Release the external resource. Must be safe to call when not started.
    async fn stop(&mut self) -> E2eResult<()>;
}

/// Drivers injected into a flow
pub struct DriverSet {
    pub api: ApiDriver,
    pub web: Option<WebDriver>,
    pub mobile: Option<MobileDriver>,
    started: Vec<Platform>,
}

impl DriverSet {
    pub fn new(api: ApiDriver) -> Self {
        Self {
            api,
            web: None,
            mobile: None,
            started: Vec::new(),
        }
    }

    pub fn with_web(mut self, web: WebDriver) -> Self {
        self.web = Some(web);
        self
    }

    pub fn with_mobile(mut self, mobile: MobileDriver) -> Self {
        self.mobile = Some(mobile);
        self
    }

    fn driver_mut(&mut self, platform: Platform) -> Option<&mut dyn Driver> {
        match platform {
            Platform::Api => Some(&mut self.api),
            Platform::Web => self.web.as_mut().map(|d| d as &mut dyn Driver),
            Platform::Mobile => self.mobile.as_mut().map(|d| d as &mut dyn Driver),
        }
    }

    pub fn has(&self, platform: Platform) -> bool {
        match platform {
            Platform::Api => true,
            Platform::Web => self.web.is_some(),
            Platform::Mobile => self.mobile.is_some(),
        }
    }

    pub fn is_started(&self, platform: Platform) -> bool {
        self.started.contains(&platform)
    }

    /// Start the driver for `platform` and push it on the stop stack.
    pub async fn start(&mut self, platform: Platform) -> E2eResult<()> {
        if self.is_started(platform) {
            return Ok(());
        }
        let driver = self.driver_mut(platform).ok_or_else(|| {
            E2eError::Config(format!("no {} driver configured for this run", platform))
        })?;
        debug!("Starting {} driver", driver.name());
        driver.start().await?;
        self.started.push(platform);
        Ok(())
    }

    /// Stop every started driver, last started first. Keeps going past
    /// failures and returns them.
    pub async fn stop_all(&mut self) -> Vec<(Platform, E2eError)> {
        let mut failures = Vec::new();
        while let Some(platform) = self.started.pop() {
            let Some(driver) = self.driver_mut(platform) else {
                continue;
            };
            debug!("Stopping {} driver", driver.name());
            if let Err(e) = driver.stop().await {
                warn!("Failed to stop {} driver: {}", platform, e);
                failures.push((platform, e));
            }
        }
        failures
    }

    /// Platforms in start order
    pub fn started(&self) -> &[Platform] {
        &self.started
    }
}
