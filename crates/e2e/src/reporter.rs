//! Step recording and flow reports
//!
//! A `Reporter` is owned by one flow run. It records every step, keeps the
//! flow-level error list that decides pass/fail, and always writes a JSON and
//! a Markdown report when the flow ends.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::time::Instant;

use chrono::{DateTime, Utc};
use colored::Colorize;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::drivers::Platform;
use crate::error::E2eResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Passed,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn icon(&self) -> &'static str {
        match self {
            StepStatus::Passed => "✅",
            StepStatus::Failed => "❌",
            StepStatus::Skipped => "⏭️",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowStatus {
    Passed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepResult {
    pub step_number: usize,
    pub name: String,
    pub platform: Platform,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    pub status: StepStatus,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screenshot_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowResult {
    pub flow_name: String,
    pub run_id: Uuid,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration_ms: u64,
    pub status: FlowStatus,
    pub steps: Vec<StepResult>,
    pub data_store_snapshot: Value,
    pub errors: Vec<String>,
    pub screenshots: Vec<PathBuf>,
}

impl FlowResult {
    pub fn passed(&self) -> bool {
        self.status == FlowStatus::Passed
    }

    pub fn count(&self, status: StepStatus) -> usize {
        self.steps.iter().filter(|s| s.status == status).count()
    }
}

/// A finished flow and where its reports were written
#[derive(Debug, Clone)]
pub struct FlowReport {
    pub result: FlowResult,
    pub json_path: PathBuf,
    pub markdown_path: PathBuf,
}

#[derive(Debug)]
struct OpenStep {
    number: usize,
    name: String,
    platform: Platform,
    phase: Option<String>,
    started: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReporterState {
    NotStarted,
    Running,
    Ended,
}

pub struct Reporter {
    reports_dir: PathBuf,
    console: bool,
    state: ReporterState,
    flow_name: String,
    run_id: Uuid,
    start_time: DateTime<Utc>,
    started: Instant,
    phase: Option<String>,
    steps: Vec<StepResult>,
    open: Option<OpenStep>,
    errors: Vec<String>,
    screenshots: Vec<PathBuf>,
}

impl Reporter {
    pub fn new(reports_dir: impl Into<PathBuf>) -> Self {
        Self {
            reports_dir: reports_dir.into(),
            console: true,
            state: ReporterState::NotStarted,
            flow_name: String::new(),
            run_id: Uuid::new_v4(),
            start_time: Utc::now(),
            started: Instant::now(),
            phase: None,
            steps: Vec::new(),
            open: None,
            errors: Vec::new(),
            screenshots: Vec::new(),
        }
    }

    /// Disable console output (logs are still emitted).
    pub fn quiet(mut self) -> Self {
        self.console = false;
        self
    }

    pub fn reports_dir(&self) -> &Path {
        &self.reports_dir
    }

    pub fn flow_name(&self) -> &str {
        &self.flow_name
    }

    pub fn is_running(&self) -> bool {
        self.state == ReporterState::Running
    }

    pub fn steps(&self) -> &[StepResult] {
        &self.steps
    }

    /// Name and platform of the step currently open
    pub fn current_step(&self) -> Option<(&str, Platform)> {
        self.open.as_ref().map(|o| (o.name.as_str(), o.platform))
    }

    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    pub fn start_flow(&mut self, name: &str) {
        if self.state == ReporterState::Running {
            warn!("start_flow('{}') while '{}' is still running", name, self.flow_name);
        }
        self.state = ReporterState::Running;
        self.flow_name = name.to_string();
        self.run_id = Uuid::new_v4();
        self.start_time = Utc::now();
        self.started = Instant::now();
        self.phase = None;
        self.steps.clear();
        self.open = None;
        self.errors.clear();
        self.screenshots.clear();

        info!("Starting flow {} ({})", name, self.run_id);
        if self.console {
            println!();
            println!("{}", format!("🚀 Flow: {}", name).bold());
            println!("{}", "═".repeat(60).dimmed());
        }
    }

    /// Group the following steps under `name`.
    pub fn start_phase(&mut self, name: &str) {
        self.phase = Some(name.to_string());
        info!("Phase: {}", name);
        if self.console {
            println!();
            println!("{}", format!("▶ {}", name).cyan().bold());
        }
    }

    /// Open a new step, closing a forgotten one as skipped. Returns its number.
    pub fn start_step(&mut self, name: &str, platform: Platform) -> usize {
        if self.open.is_some() {
            self.skip_step(Some("not finished"));
        }
        let number = self.steps.len() + 1;
        debug!("Step {} [{}] {}", number, platform, name);
        self.open = Some(OpenStep {
            number,
            name: name.to_string(),
            platform,
            phase: self.phase.clone(),
            started: Instant::now(),
        });
        number
    }

    pub fn pass_step(&mut self, data: Option<Value>) {
        self.close_step(StepStatus::Passed, None, None, None, data);
    }

    /// Record a failure and append `"[PLATFORM] name: message"` to the flow errors.
    pub fn fail_step(&mut self, error: impl std::fmt::Display, screenshot: Option<PathBuf>) {
        let message = error.to_string();
        if let Some(open) = &self.open {
            self.errors.push(format!(
                "[{}] {}: {}",
                open.platform.as_str().to_uppercase(),
                open.name,
                message
            ));
        }
        if let Some(path) = &screenshot {
            self.screenshots.push(path.clone());
        }
        self.close_step(StepStatus::Failed, Some(message), None, screenshot, None);
    }

    pub fn skip_step(&mut self, reason: Option<&str>) {
        self.close_step(
            StepStatus::Skipped,
            None,
            reason.map(str::to_string),
            None,
            None,
        );
    }

    pub fn add_screenshot(&mut self, path: PathBuf) {
        self.screenshots.push(path);
    }

    /// Record a failure that is not tied to a step (e.g. a fatal abort).
    pub fn add_error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
    }

    fn close_step(
        &mut self,
        status: StepStatus,
        error: Option<String>,
        skip_reason: Option<String>,
        screenshot_path: Option<PathBuf>,
        data: Option<Value>,
    ) {
        let Some(open) = self.open.take() else {
            warn!("{:?} recorded without an open step", status);
            return;
        };
        let step = StepResult {
            step_number: open.number,
            name: open.name,
            platform: open.platform,
            phase: open.phase,
            status,
            duration_ms: open.started.elapsed().as_millis() as u64,
            error,
            skip_reason,
            screenshot_path,
            data,
        };
        if self.console {
            print_step(&step);
        }
        match status {
            StepStatus::Failed => warn!(
                "Step {} failed: {}",
                step.step_number,
                step.error.as_deref().unwrap_or_default()
            ),
            _ => debug!("Step {} {:?}", step.step_number, status),
        }
        self.steps.push(step);
    }

    /// Close the run and write `<flow>-<stamp>.json` and `.md`.
    ///
    /// The status is failed when any error was recorded; `status` can only
    /// force a failure, never hide one.
    pub fn end_flow(&mut self, data_store_snapshot: Value, status: Option<FlowStatus>) -> E2eResult<FlowReport> {
        if self.open.is_some() {
            self.skip_step(Some("flow ended"));
        }
        let computed = if self.errors.is_empty() {
            FlowStatus::Passed
        } else {
            FlowStatus::Failed
        };
        let status = match status {
            Some(FlowStatus::Failed) => FlowStatus::Failed,
            _ => computed,
        };
        self.state = ReporterState::Ended;

        let result = FlowResult {
            flow_name: self.flow_name.clone(),
            run_id: self.run_id,
            start_time: self.start_time,
            end_time: Utc::now(),
            duration_ms: self.started.elapsed().as_millis() as u64,
            status,
            steps: self.steps.clone(),
            data_store_snapshot,
            errors: self.errors.clone(),
            screenshots: self.screenshots.clone(),
        };

        std::fs::create_dir_all(&self.reports_dir)?;
        let stamp = result.start_time.format("%Y%m%d-%H%M%S%3f");
        let base = format!("{}-{}", self.flow_name, stamp);
        let json_path = self.reports_dir.join(format!("{}.json", base));
        let markdown_path = self.reports_dir.join(format!("{}.md", base));
        std::fs::write(&json_path, serde_json::to_string_pretty(&result)?)?;
        std::fs::write(&markdown_path, render_markdown(&result)?)?;

        info!(
            "Flow {} {:?}: {} passed, {} failed, {} skipped ({} ms)",
            result.flow_name,
            result.status,
            result.count(StepStatus::Passed),
            result.count(StepStatus::Failed),
            result.count(StepStatus::Skipped),
            result.duration_ms
        );
        if self.console {
            print_summary(&result, &json_path);
        }

        Ok(FlowReport {
            result,
            json_path,
            markdown_path,
        })
    }
}

fn print_step(step: &StepResult) {
    let line = format!(
        "  {} {} [{}] {} ({} ms)",
        step.status.icon(),
        step.platform.icon(),
        step.step_number,
        step.name,
        step.duration_ms
    );
    match step.status {
        StepStatus::Passed => println!("{}", line.green()),
        StepStatus::Failed => {
            println!("{}", line.red());
            if let Some(error) = &step.error {
                println!("      {}", error.red().dimmed());
            }
        }
        StepStatus::Skipped => println!("{}", line.yellow()),
    }
}

fn print_summary(result: &FlowResult, report: &Path) {
    let headline = match result.status {
        FlowStatus::Passed => format!("✅ {} PASSED", result.flow_name).green().bold(),
        FlowStatus::Failed => format!("❌ {} FAILED", result.flow_name).red().bold(),
    };
    println!();
    println!("{}", "═".repeat(60).dimmed());
    println!("{}", headline);
    println!(
        "   {} passed, {} failed, {} skipped in {:.1}s",
        result.count(StepStatus::Passed).to_string().green(),
        result.count(StepStatus::Failed).to_string().red(),
        result.count(StepStatus::Skipped).to_string().yellow(),
        result.duration_ms as f64 / 1000.0
    );
    for error in &result.errors {
        println!("   {}", error.red());
    }
    println!("   Report: {}", report.display());
}

fn render_markdown(result: &FlowResult) -> E2eResult<String> {
    let mut md = String::new();
    let status = match result.status {
        FlowStatus::Passed => "✅ PASSED",
        FlowStatus::Failed => "❌ FAILED",
    };

    // fmt::Write into a String cannot fail
    let _ = writeln!(md, "# E2E Report: {}\n", result.flow_name);
    let _ = writeln!(md, "| | |\n|---|---|");
    let _ = writeln!(md, "| Status | {} |", status);
    let _ = writeln!(md, "| Run | `{}` |", result.run_id);
    let _ = writeln!(md, "| Started | {} |", result.start_time.to_rfc3339());
    let _ = writeln!(md, "| Duration | {} ms |", result.duration_ms);
    let _ = writeln!(
        md,
        "| Steps | {} passed, {} failed, {} skipped |\n",
        result.count(StepStatus::Passed),
        result.count(StepStatus::Failed),
        result.count(StepStatus::Skipped)
    );

    let _ = writeln!(md, "## Steps\n");
    let _ = writeln!(md, "| # | Phase | Platform | Step | Status | Duration | Details |");
    let _ = writeln!(md, "|---|---|---|---|---|---|---|");
    for step in &result.steps {
        let details = step
            .error
            .as_deref()
            .or(step.skip_reason.as_deref())
            .unwrap_or("")
            .replace('|', "\\|")
            .replace('\n', " ");
        let _ = writeln!(
            md,
            "| {} | {} | {} {} | {} | {} | {} ms | {} |",
            step.step_number,
            step.phase.as_deref().unwrap_or("-"),
            step.platform.icon(),
            step.platform,
            step.name,
            step.status.icon(),
            step.duration_ms,
            details
        );
    }

    if !result.errors.is_empty() {
        let _ = writeln!(md, "\n## Errors\n");
        for error in &result.errors {
            let _ = writeln!(md, "- {}", error);
        }
    }

    if !result.screenshots.is_empty() {
        let _ = writeln!(md, "\n## Screenshots\n");
        for shot in &result.screenshots {
            let _ = writeln!(md, "- `{}`", shot.display());
        }
    }

    let _ = writeln!(md, "\n## Data store\n");
    let _ = writeln!(
        md,
        "```json\n{}\n```",
        serde_json::to_string_pretty(&result.data_store_snapshot)?
    );
    Ok(md)
}
