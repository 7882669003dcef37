//! Foodflow E2E CLI - Main Entry Point
//!
//! Runs one cross-platform flow against a Foodflow deployment and exits with
//! 0 when it passed, 1 when it failed and 2 when the run could not happen.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use foodflow_e2e::{run_menu_flow, run_order_flow, E2eConfig, FlowContext, FlowResult, MenuAction, Reporter};

mod output;

use output::OutputFormat;

/// Foodflow cross-platform E2E runner
#[derive(Parser, Debug)]
#[command(name = "foodflow")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Flow to run
    #[arg(long, value_enum, default_value_t = FlowKind::Order)]
    flow: FlowKind,

    /// Menu action (menu flow only)
    #[arg(long, value_enum, default_value_t = ActionArg::Create)]
    action: ActionArg,

    /// Drive the mobile app with Maestro
    #[arg(long)]
    maestro: bool,

    /// Show the browser window
    #[arg(long)]
    headed: bool,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file (TOML); missing file means defaults
    #[arg(long, env = "FOODFLOW_CONFIG", default_value = "foodflow-e2e.toml")]
    config: PathBuf,

    /// Backend API base URL
    #[arg(long, env = "FOODFLOW_API_URL")]
    api_url: Option<String>,

    /// API bearer token
    #[arg(long, env = "FOODFLOW_API_TOKEN", hide_env_values = true)]
    api_token: Option<String>,

    /// Restaurant dashboard URL
    #[arg(long, env = "FOODFLOW_WEB_URL")]
    web_url: Option<String>,

    /// Dashboard login
    #[arg(long, env = "FOODFLOW_WEB_USERNAME")]
    web_username: Option<String>,

    /// Dashboard password
    #[arg(long, env = "FOODFLOW_WEB_PASSWORD", hide_env_values = true)]
    web_password: Option<String>,

    /// Skip the dashboard and act through the API only
    #[arg(long)]
    no_web: bool,

    /// Directory for reports and screenshots
    #[arg(long, env = "FOODFLOW_REPORTS_DIR")]
    reports_dir: Option<PathBuf>,

    /// Persist the data store next to the reports
    #[arg(long)]
    persist_data: bool,

    /// Restaurant to run against (defaults to the first one)
    #[arg(long, env = "FOODFLOW_RESTAURANT_ID")]
    restaurant_id: Option<i64>,

    /// Keep the menu items a run creates
    #[arg(long)]
    no_cleanup: bool,

    /// Output format for the step summary
    #[arg(long, default_value = "table")]
    format: OutputFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum FlowKind {
    Order,
    Menu,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ActionArg {
    Create,
    Update,
    Toggle,
    Delete,
}

impl From<ActionArg> for MenuAction {
    fn from(action: ActionArg) -> Self {
        match action {
            ActionArg::Create => MenuAction::Create,
            ActionArg::Update => MenuAction::Update,
            ActionArg::Toggle => MenuAction::Toggle,
            ActionArg::Delete => MenuAction::Delete,
        }
    }
}

impl Cli {
    /// File configuration with command-line overrides on top.
    fn load_config(&self) -> anyhow::Result<E2eConfig> {
        let mut config = E2eConfig::load(&self.config)
            .with_context(|| format!("loading {}", self.config.display()))?;

        if let Some(url) = &self.api_url {
            config.api.base_url = url.clone();
        }
        if let Some(token) = &self.api_token {
            config.api.auth = foodflow_e2e::config::ApiAuth::Bearer { token: token.clone() };
        }
        if let Some(url) = &self.web_url {
            config.web.base_url = url.clone();
        }
        if let Some(username) = &self.web_username {
            config.web.username = username.clone();
        }
        if let Some(password) = &self.web_password {
            config.web.password = password.clone();
        }
        if self.no_web {
            config.web.enabled = false;
        }
        if self.headed {
            config.web.headless = false;
        }
        if let Some(dir) = &self.reports_dir {
            config.reports.dir = dir.clone();
        }
        if self.persist_data {
            config.reports.persist_data = true;
        }
        if self.restaurant_id.is_some() {
            config.flow.restaurant_id = self.restaurant_id;
        }
        if self.no_cleanup {
            config.flow.cleanup = false;
        }
        if self.maestro {
            config.flow.use_maestro = true;
        }

        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match run(&cli).await {
        Ok(result) => {
            output::print_flow(&result, cli.format);
            if result.passed() {
                if !output::is_structured(cli.format) {
                    output::print_success(&format!("{} passed", result.flow_name));
                }
                Ok(())
            } else {
                output::print_error(&format!(
                    "{} failed with {} error(s)",
                    result.flow_name,
                    result.errors.len()
                ));
                std::process::exit(1);
            }
        }
        Err(e) => {
            output::print_error(&format!("{:#}", e));
            std::process::exit(2);
        }
    }
}

async fn run(cli: &Cli) -> anyhow::Result<FlowResult> {
    let config = cli.load_config()?;
    info!("API: {}", config.api.base_url);
    if config.web.enabled {
        info!("Dashboard: {}", config.web.base_url);
    } else {
        info!("Dashboard disabled, acting through the API");
    }

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            output::print_warning("Interrupted, cleaning up");
            interrupt.cancel();
        }
    });

    let mut ctx = FlowContext::from_config(config, cancel)?;
    if output::is_structured(cli.format) {
        ctx.reporter = Reporter::new(ctx.config.reports.dir.clone()).quiet();
    }

    let result = match cli.flow {
        FlowKind::Order => {
            let outcome = run_order_flow(&mut ctx).await?;
            if let Some(id) = outcome.order_id {
                info!("Order {} used by this run", id);
            }
            info!("Report: {}", outcome.markdown_report.display());
            outcome.result
        }
        FlowKind::Menu => {
            let outcome = run_menu_flow(&mut ctx, cli.action.into()).await?;
            if let Some(name) = &outcome.menu_item_name {
                info!("Menu item '{}' ({})", name, outcome.action);
            }
            info!("Report: {}", outcome.markdown_report.display());
            outcome.result
        }
    };

    if ctx.cancel.is_cancelled() {
        warn!("Run was cancelled before completion");
    }
    Ok(result)
}
