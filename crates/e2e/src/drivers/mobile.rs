//! Mobile app driver backed by the Maestro CLI
//!
//! Steps are rendered to a Maestro YAML flow, written to a temp file and run
//! as `maestro test <file> -e KEY=value`. The file lives exactly as long as
//! the run.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Serialize;
use serde_yaml::{Mapping, Value};
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::{Driver, Platform};
use crate::config::{E2eConfig, MobileConfig};
use crate::error::{E2eError, E2eResult};

/// One Maestro command
#[derive(Debug, Clone, PartialEq)]
pub enum MobileStep {
    LaunchApp { clear_state: bool },
    /// Tap the element showing this text
    TapOn(String),
    /// Tap the element with this accessibility id
    TapOnId(String),
    InputText(String),
    AssertVisible(String),
    AssertNotVisible(String),
    Scroll,
    ScrollUntilVisible(String),
    /// Wait for animations to settle, up to this many milliseconds
    Wait(u64),
    Back,
    HideKeyboard,
    TakeScreenshot(String),
    StopApp,
}

impl MobileStep {
    fn to_yaml(&self) -> Value {
        match self {
            MobileStep::LaunchApp { clear_state: false } => bare("launchApp"),
            MobileStep::LaunchApp { clear_state: true } => {
                keyed("launchApp", mapping([("clearState", Value::Bool(true))]))
            }
            MobileStep::TapOn(text) => keyed("tapOn", text.as_str().into()),
            MobileStep::TapOnId(id) => keyed("tapOn", mapping([("id", id.as_str().into())])),
            MobileStep::InputText(text) => keyed("inputText", text.as_str().into()),
            MobileStep::AssertVisible(text) => keyed("assertVisible", text.as_str().into()),
            MobileStep::AssertNotVisible(text) => keyed("assertNotVisible", text.as_str().into()),
            MobileStep::Scroll => bare("scroll"),
            MobileStep::ScrollUntilVisible(text) => keyed(
                "scrollUntilVisible",
                mapping([("element", mapping([("text", text.as_str().into())]))]),
            ),
            MobileStep::Wait(ms) => keyed(
                "waitForAnimationToEnd",
                mapping([("timeout", Value::Number((*ms).into()))]),
            ),
            MobileStep::Back => keyed("pressKey", "back".into()),
            MobileStep::HideKeyboard => bare("hideKeyboard"),
            MobileStep::TakeScreenshot(name) => keyed("takeScreenshot", name.as_str().into()),
            MobileStep::StopApp => bare("stopApp"),
        }
    }
}

fn bare(command: &str) -> Value {
    Value::String(command.to_string())
}

fn keyed(command: &str, arg: Value) -> Value {
    mapping([(command, arg)])
}

fn mapping<const N: usize>(entries: [(&str, Value); N]) -> Value {
    let mut map = Mapping::new();
    for (k, v) in entries {
        map.insert(Value::String(k.to_string()), v);
    }
    Value::Mapping(map)
}

/// Render a Maestro flow: `appId` header, document separator, step list.
pub fn render_flow(app_id: &str, steps: &[MobileStep]) -> E2eResult<String> {
    let header = serde_yaml::to_string(&mapping([("appId", app_id.into())]))?;
    let body = serde_yaml::to_string(&Value::Sequence(
        steps.iter().map(MobileStep::to_yaml).collect(),
    ))?;
    Ok(format!("{}---\n{}", header, body))
}

/// Outcome of one Maestro invocation
#[derive(Debug, Clone, Serialize)]
pub struct MobileRunResult {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub duration: Duration,
}

impl MobileRunResult {
    /// Last lines of output, for error messages
    pub fn tail(&self, lines: usize) -> String {
        let text = if self.stderr.trim().is_empty() {
            &self.stdout
        } else {
            &self.stderr
        };
        let all: Vec<&str> = text.lines().collect();
        all[all.len().saturating_sub(lines)..].join("\n")
    }
}

fn output_reports_failure(stdout: &str) -> bool {
    stdout.lines().any(|line| {
        let line = line.trim_start();
        line.contains("FAILED") || line.starts_with('❌')
    })
}

pub struct MobileDriver {
    config: MobileConfig,
    timeout: Duration,
    flow_dir: Option<PathBuf>,
    started: bool,
}

impl MobileDriver {
    pub fn new(config: &E2eConfig) -> Self {
        Self {
            config: config.mobile.clone(),
            timeout: config.timeouts.mobile(),
            flow_dir: None,
            started: false,
        }
    }

    /// Write flow files under `dir` instead of the system temp dir.
    pub fn with_flow_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.flow_dir = Some(dir.into());
        self
    }

    pub fn app_id(&self) -> &str {
        &self.config.app_id
    }

    /// Check that the Maestro CLI is installed, returning its version.
    pub async fn check_installation(&self) -> E2eResult<String> {
        let output = Command::new(&self.config.tool)
            .arg("--version")
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();
        let output = match tokio::time::timeout(Duration::from_secs(30), output).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(E2eError::MaestroNotFound(format!("{}: {}", self.config.tool, e))),
            Err(_) => {
                return Err(E2eError::MaestroNotFound(format!(
                    "{} --version did not answer",
                    self.config.tool
                )))
            }
        };
        if !output.status.success() {
            return Err(E2eError::MaestroNotFound(format!(
                "{} --version exited with {}",
                self.config.tool, output.status
            )));
        }
        let version = String::from_utf8_lossy(&output.stdout).trim().to_string();
        debug!("Maestro version: {}", version);
        Ok(version)
    }

    /// Check that adb sees at least one device, returning their serials.
    pub async fn check_emulator(&self) -> E2eResult<Vec<String>> {
        let output = Command::new(&self.config.adb_path)
            .arg("devices")
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();
        let output = tokio::time::timeout(Duration::from_secs(30), output)
            .await
            .map_err(|_| E2eError::FatalPrerequisite("adb devices did not answer".into()))?
            .map_err(|e| {
                E2eError::FatalPrerequisite(format!("cannot run {}: {}", self.config.adb_path, e))
            })?;

        let devices = parse_adb_devices(&String::from_utf8_lossy(&output.stdout));
        if devices.is_empty() {
            return Err(E2eError::FatalPrerequisite(
                "no emulator or device connected (adb devices)".into(),
            ));
        }
        info!("Mobile devices: {}", devices.join(", "));
        Ok(devices)
    }

    /// Run `steps` as one Maestro flow.
    pub async fn run_flow(
        &self,
        name: &str,
        steps: &[MobileStep],
        env: &BTreeMap<String, String>,
    ) -> E2eResult<MobileRunResult> {
        let yaml = render_flow(&self.config.app_id, steps)?;
        let mut builder = tempfile::Builder::new();
        builder.prefix("foodflow-").suffix(".yaml");
        let mut flow_file = match &self.flow_dir {
            Some(dir) => builder.tempfile_in(dir)?,
            None => builder.tempfile()?,
        };
        flow_file.write_all(yaml.as_bytes())?;
        flow_file.flush()?;

        let mut cmd = Command::new(&self.config.tool);
        cmd.arg("test").arg(flow_file.path());
        for (key, value) in self.config.env.iter().chain(env.iter()) {
            cmd.arg("-e").arg(format!("{}={}", key, value));
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!("Running Maestro flow '{}' ({} steps)", name, steps.len());
        let start = Instant::now();
        let output = match tokio::time::timeout(self.timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(E2eError::MaestroNotFound(self.config.tool.clone()))
            }
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => {
                return Err(E2eError::Timeout(format!(
                    "Maestro flow '{}' exceeded {} ms",
                    name,
                    self.timeout.as_millis()
                )))
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        let result = MobileRunResult {
            success: output.status.success() && !output_reports_failure(&stdout),
            stdout,
            stderr,
            exit_code: output.status.code(),
            duration: start.elapsed(),
        };
        debug!(
            "Maestro flow '{}' finished in {} ms (success: {})",
            name,
            result.duration.as_millis(),
            result.success
        );
        Ok(result)
    }

    /// Run a flow and turn an unsuccessful run into a step failure.
    pub async fn run_checked(&self, name: &str, steps: &[MobileStep]) -> E2eResult<MobileRunResult> {
        let result = self.run_flow(name, steps, &BTreeMap::new()).await?;
        if result.success {
            Ok(result)
        } else {
            Err(E2eError::StepFailed {
                step: name.to_string(),
                reason: format!(
                    "maestro exited with {:?}: {}",
                    result.exit_code,
                    result.tail(5)
                ),
            })
        }
    }

    pub async fn launch_app(&self, clear_state: bool) -> E2eResult<MobileRunResult> {
        self.run_checked("launch app", &[MobileStep::LaunchApp { clear_state }])
            .await
    }

    pub async fn tap(&self, text: &str) -> E2eResult<MobileRunResult> {
        self.run_checked(&format!("tap {}", text), &[MobileStep::TapOn(text.to_string())])
            .await
    }

    pub async fn type_text(&self, text: &str) -> E2eResult<MobileRunResult> {
        self.run_checked("input text", &[MobileStep::InputText(text.to_string())])
            .await
    }

    pub async fn assert_visible(&self, text: &str) -> E2eResult<MobileRunResult> {
        self.run_checked(
            &format!("assert visible {}", text),
            &[MobileStep::AssertVisible(text.to_string())],
        )
        .await
    }

    pub async fn scroll(&self) -> E2eResult<MobileRunResult> {
        self.run_checked("scroll", &[MobileStep::Scroll]).await
    }

    pub async fn screenshot(&self, name: &str) -> E2eResult<MobileRunResult> {
        self.run_checked(
            &format!("screenshot {}", name),
            &[MobileStep::TakeScreenshot(name.to_string())],
        )
        .await
    }
}

fn parse_adb_devices(output: &str) -> Vec<String> {
    output
        .lines()
        .skip_while(|line| !line.starts_with("List of devices"))
        .skip(1)
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            match (parts.next(), parts.next()) {
                (Some(serial), Some("device")) => Some(serial.to_string()),
                _ => None,
            }
        })
        .collect()
}

#[async_trait]
impl Driver for MobileDriver {
    fn name(&self) -> &'static str {
        "mobile"
    }

    fn platform(&self) -> Platform {
        Platform::Mobile
    }

    async fn start(&mut self) -> E2eResult<()> {
        let version = self.check_installation().await?;
        self.check_emulator().await?;
        info!("Maestro {} ready for {}", version, self.config.app_id);
        self.started = true;
        Ok(())
    }

    async fn stop(&mut self) -> E2eResult<()> {
        if !self.started {
            return Ok(());
        }
        self.started = false;
        let result = self.run_flow("stop app", &[MobileStep::StopApp], &BTreeMap::new()).await?;
        if !result.success {
            warn!("stopApp failed: {}", result.tail(3));
        }
        Ok(())
    }
}
