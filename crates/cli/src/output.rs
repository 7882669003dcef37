//! Console output for flow results

use clap::ValueEnum;
use colored::Colorize;
use comfy_table::{presets::UTF8_FULL, Cell, Color, ContentArrangement, Table};
use foodflow_e2e::{FlowResult, StepResult, StepStatus};
use serde::Serialize;

/// Output format
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
pub enum OutputFormat {
    /// Step table
    #[default]
    Table,
    /// Full flow result as JSON
    Json,
    /// Full flow result as YAML
    Yaml,
    /// One line per step
    Plain,
}

/// Rows of a table view
pub trait TableDisplay {
    fn headers() -> Vec<&'static str>;
    fn row(&self) -> Vec<String>;
}

impl TableDisplay for StepResult {
    fn headers() -> Vec<&'static str> {
        vec!["#", "Step", "Platform", "Status", "Duration", "Details"]
    }

    fn row(&self) -> Vec<String> {
        let details = match self.status {
            StepStatus::Failed => self.error.clone().unwrap_or_default(),
            StepStatus::Skipped => self.skip_reason.clone().unwrap_or_default(),
            StepStatus::Passed => String::new(),
        };
        vec![
            self.step_number.to_string(),
            self.name.clone(),
            self.platform.to_string(),
            format!("{} {:?}", self.status.icon(), self.status),
            format!("{} ms", self.duration_ms),
            details,
        ]
    }
}

fn status_color(status: StepStatus) -> Color {
    match status {
        StepStatus::Passed => Color::Green,
        StepStatus::Failed => Color::Red,
        StepStatus::Skipped => Color::Yellow,
    }
}

/// Print the steps of a finished flow
pub fn print_flow(result: &FlowResult, format: OutputFormat) {
    match format {
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic);

            table.set_header(StepResult::headers());
            for step in &result.steps {
                let color = status_color(step.status);
                table.add_row(step.row().into_iter().map(|v| Cell::new(v).fg(color)));
            }

            println!("{table}");
        }
        OutputFormat::Json => print_serialized(result, format),
        OutputFormat::Yaml => print_serialized(result, format),
        OutputFormat::Plain => {
            for step in &result.steps {
                println!("{}", step.row().join(" | "));
            }
        }
    }
}

/// Serialize `value` as the only document written to stdout
fn render_serialized<T: Serialize>(value: &T, format: OutputFormat) -> Result<String, String> {
    match format {
        OutputFormat::Yaml => serde_yaml::to_string(value).map_err(|e| e.to_string()),
        _ => serde_json::to_string_pretty(value).map_err(|e| e.to_string()),
    }
}

fn print_serialized<T: Serialize>(value: &T, format: OutputFormat) {
    match render_serialized(value, format) {
        Ok(text) => println!("{}", text),
        Err(e) => print_error(&format!("Cannot render result: {}", e)),
    }
}

/// Machine-readable formats keep stdout free of console decoration
pub fn is_structured(format: OutputFormat) -> bool {
    matches!(format, OutputFormat::Json | OutputFormat::Yaml)
}

pub fn print_success(message: &str) {
    println!("✅ {}", message.green());
}

pub fn print_error(message: &str) {
    eprintln!("❌ {}", message.red());
}

pub fn print_warning(message: &str) {
    eprintln!("⚠️  {}", message.yellow());
}
