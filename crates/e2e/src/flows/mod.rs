//! Flow orchestration
//!
//! A flow is a fixed sequence of phases run against one [`FlowContext`]. Every
//! sub-action is a reported step. A failed step is recorded and the flow moves
//! on; only fatal errors (prerequisites, cancellation) abort the remaining
//! phases. Cleanup and the report always happen.

pub mod menu;
pub mod order;

use std::future::Future;

use serde::Serialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::E2eConfig;
use crate::drivers::{ApiDriver, DriverSet, MobileDriver, Platform, WebDriver};
use crate::error::{E2eError, E2eResult};
use crate::models::Restaurant;
use crate::reporter::{FlowReport, FlowStatus, Reporter};
use crate::store::DataStore;
use crate::wait::{wait, WaitOptions};

pub use menu::{run_menu_flow, MenuAction, MenuFlowResult};
pub use order::{run_order_flow, OrderFlowResult};

/// Run one step: open it, await `$op` (interruptible by the cancel token),
/// then record the outcome. Evaluates to `E2eResult<Option<T>>`, `Err` only
/// for fatal errors.
macro_rules! step {
    ($ctx:expr, $name:expr, $platform:expr, $op:expr) => {{
        $ctx.reporter.start_step(&$name, $platform);
        let result = $crate::flows::guard(&$ctx.cancel, $op).await;
        $ctx.end_step(result).await
    }};
}
pub(crate) use step;

/// Await `future` unless the run is cancelled first.
pub async fn guard<T>(cancel: &CancellationToken, future: impl Future<Output = E2eResult<T>>) -> E2eResult<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(E2eError::Cancelled),
        result = future => result,
    }
}

/// Everything one flow run owns
pub struct FlowContext {
    pub config: E2eConfig,
    pub drivers: DriverSet,
    pub store: DataStore,
    pub reporter: Reporter,
    pub cancel: CancellationToken,
}

impl FlowContext {
    pub fn new(config: E2eConfig, drivers: DriverSet, reporter: Reporter, cancel: CancellationToken) -> Self {
        Self {
            config,
            drivers,
            store: DataStore::new(),
            reporter,
            cancel,
        }
    }

    /// Build the drivers the configuration asks for.
    pub fn from_config(config: E2eConfig, cancel: CancellationToken) -> E2eResult<Self> {
        config.validate()?;
        let mut drivers = DriverSet::new(ApiDriver::new(&config)?);
        if config.web.enabled {
            drivers = drivers.with_web(WebDriver::new(&config));
        }
        if config.flow.use_maestro {
            drivers = drivers.with_mobile(MobileDriver::new(&config));
        }
        let reporter = Reporter::new(config.reports.dir.clone());
        Ok(Self::new(config, drivers, reporter, cancel))
    }

    /// Start the report and a fresh data store for `flow_name`.
    pub fn begin(&mut self, flow_name: &str) {
        self.store = if self.config.reports.persist_data {
            DataStore::persistent(self.config.reports.data_path(flow_name), flow_name)
        } else {
            DataStore::new()
        };
        self.reporter.start_flow(flow_name);
    }

    /// Record the outcome of the open step.
    pub async fn end_step<T: Serialize>(&mut self, result: E2eResult<T>) -> E2eResult<Option<T>> {
        match result {
            Ok(value) => {
                let data = serde_json::to_value(&value).ok().filter(|v| !v.is_null());
                self.reporter.pass_step(data);
                Ok(Some(value))
            }
            Err(e) => {
                let screenshot = self.failure_screenshot().await;
                self.reporter.fail_step(&e, screenshot);
                if e.is_fatal() {
                    Err(e)
                } else {
                    Ok(None)
                }
            }
        }
    }

    /// Record a step that could not run.
    pub fn skip(&mut self, name: &str, platform: Platform, reason: &str) {
        self.reporter.start_step(name, platform);
        self.reporter.skip_step(Some(reason));
    }

    async fn failure_screenshot(&mut self) -> Option<std::path::PathBuf> {
        if !self.config.reports.screenshot_on_failure || !self.drivers.is_started(Platform::Web) {
            return None;
        }
        let name = match self.reporter.current_step() {
            Some((name, Platform::Web)) => format!("failed-{}", name),
            _ => return None,
        };
        let web = self.drivers.web.as_mut()?;
        match web.screenshot(&name).await {
            Ok(path) => Some(path),
            Err(e) => {
                debug!("No failure screenshot: {}", e);
                None
            }
        }
    }

    /// Persist a value and log what went in.
    pub fn remember<T: Serialize>(&mut self, key: &str, value: T, platform: Platform) {
        if let Err(e) = self.store.set(key, value, Some(platform)) {
            warn!("Could not store '{}': {}", key, e);
        }
    }

    /// Wait options for a cross-platform convergence check
    pub fn sync_options(&self, message: impl Into<String>) -> WaitOptions {
        WaitOptions::new(self.config.timeouts.sync(), self.config.timeouts.poll_interval())
            .with_message(message)
    }

    /// Initial settle before cross-platform checks.
    pub async fn wait_for_sync(&self) {
        let delay = self.config.timeouts.sync_delay();
        if !delay.is_zero() {
            info!("Waiting {} ms for platforms to sync", delay.as_millis());
            wait(delay).await;
        }
    }

    /// Prerequisites shared by every flow. Fatal errors propagate; returns
    /// whether the dashboard is usable.
    pub async fn prerequisites(&mut self) -> E2eResult<bool> {
        self.reporter.start_phase("Prerequisites");
        step!(self, "API reachable", Platform::Api, self.drivers.start(Platform::Api))?;

        if self.config.flow.use_maestro {
            let drivers = &mut self.drivers;
            step!(self, "Maestro and device available", Platform::Mobile, async move {
                drivers.start(Platform::Mobile).await.map_err(|e| match e {
                    E2eError::MaestroNotFound(tool) => {
                        E2eError::FatalPrerequisite(format!("Maestro not available: {}", tool))
                    }
                    other => other,
                })
            })?;
        }

        if !self.drivers.has(Platform::Web) {
            return Ok(false);
        }

        // The dashboard is optional: flows fall back to the API without it
        let drivers = &mut self.drivers;
        let launched = step!(self, "Launch browser", Platform::Web, async move {
            drivers
                .start(Platform::Web)
                .await
                .map_err(|e| E2eError::StepFailed {
                    step: "launch browser".into(),
                    reason: e.to_string(),
                })
        })?;
        if launched.is_none() {
            return Ok(false);
        }

        let logged_in = match self.drivers.web.as_mut() {
            Some(web) => step!(self, "Log into dashboard", Platform::Web, web.login_restaurant())?,
            None => None,
        };
        Ok(logged_in.is_some())
    }

    /// Resolve the restaurant the flow runs against and store it.
    pub async fn prepare_restaurant(&mut self) -> E2eResult<Option<Restaurant>> {
        let configured = self.config.flow.restaurant_id;
        let api = &self.drivers.api;
        let restaurant = step!(self, "Fetch restaurant", Platform::Api, async move {
            match configured {
                Some(id) => api.get_restaurant(id).await,
                None => api
                    .get_restaurants()
                    .await?
                    .into_iter()
                    .next()
                    .ok_or(E2eError::NotFound {
                        kind: "Restaurant",
                        id: "(any)".into(),
                    }),
            }
        })?;

        if let Some(restaurant) = &restaurant {
            self.remember("restaurant", restaurant, Platform::Api);
            self.remember("restaurantId", restaurant.id, Platform::Api);
        }
        Ok(restaurant)
    }

    /// Stop drivers, then close the report. `outcome` is the result of the
    /// flow phases; an error there forces a failed flow.
    pub async fn finish(&mut self, outcome: E2eResult<()>) -> E2eResult<FlowReport> {
        let forced = match outcome {
            Ok(()) => None,
            Err(e) => {
                error!("Flow {} aborted: {}", self.reporter.flow_name(), e);
                if self.reporter.errors().is_empty() {
                    self.reporter.add_error(format!("[FLOW] aborted: {}", e));
                }
                Some(FlowStatus::Failed)
            }
        };

        for (platform, e) in self.drivers.stop_all().await {
            warn!("{} driver did not stop cleanly: {}", platform, e);
        }

        self.reporter.end_flow(self.store.snapshot(), forced)
    }
}

/// Compact view of a value for step data
pub(crate) fn summary(fields: &[(&str, Value)]) -> Value {
    let map: serde_json::Map<String, Value> = fields
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect();
    json!(map)
}
