//! Playwright browser automation
//!
//! A browser session has to survive across many flow steps (login once, then
//! accept and mark orders), so instead of generating one script per step the
//! driver keeps a small Node bridge alive and talks to it over stdio, one
//! JSON object per line:
//!
//! ```text
//! -> {"id":3,"op":"click","selector":"#accept","timeout":15000}
//! <- {"id":3,"ok":true,"value":null}
//! ```

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, info, warn};

use crate::config::WebConfig;
use crate::error::{E2eError, E2eResult};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Browser {
    #[default]
    Chromium,
    Firefox,
    Webkit,
}

impl Browser {
    pub fn as_str(&self) -> &'static str {
        match self {
            Browser::Chromium => "chromium",
            Browser::Firefox => "firefox",
            Browser::Webkit => "webkit",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WaitState {
    Visible,
    Hidden,
    Attached,
    Detached,
}

/// One browser operation. Timeouts are in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum BrowserCommand {
    Navigate {
        url: String,
        timeout: u64,
    },
    Click {
        selector: String,
        timeout: u64,
    },
    Fill {
        selector: String,
        value: String,
        timeout: u64,
    },
    Select {
        selector: String,
        value: String,
        timeout: u64,
    },
    Hover {
        selector: String,
        timeout: u64,
    },
    WaitFor {
        selector: String,
        state: WaitState,
        timeout: u64,
    },
    IsVisible {
        selector: String,
    },
    Count {
        selector: String,
    },
    TextContent {
        selector: String,
        timeout: u64,
    },
    Screenshot {
        path: PathBuf,
        #[serde(rename = "fullPage")]
        full_page: bool,
    },
    Close,
}

impl BrowserCommand {
    /// Short label used in logs, e.g. `click:#accept`
    pub fn label(&self) -> String {
        match self {
            BrowserCommand::Navigate { url, .. } => format!("navigate:{}", url),
            BrowserCommand::Click { selector, .. } => format!("click:{}", selector),
            BrowserCommand::Fill { selector, .. } => format!("fill:{}", selector),
            BrowserCommand::Select { selector, .. } => format!("select:{}", selector),
            BrowserCommand::Hover { selector, .. } => format!("hover:{}", selector),
            BrowserCommand::WaitFor { selector, .. } => format!("wait:{}", selector),
            BrowserCommand::IsVisible { selector } => format!("visible:{}", selector),
            BrowserCommand::Count { selector } => format!("count:{}", selector),
            BrowserCommand::TextContent { selector, .. } => format!("text:{}", selector),
            BrowserCommand::Screenshot { path, .. } => format!("screenshot:{}", path.display()),
            BrowserCommand::Close => "close".to_string(),
        }
    }
}

/// Something that can execute browser commands against a live page
#[async_trait]
pub trait BrowserBackend: Send {
    async fn execute(&mut self, command: BrowserCommand) -> E2eResult<Value>;

    async fn close(&mut self) -> E2eResult<()>;
}

/// Options for launching the bridge
#[derive(Debug, Clone)]
pub struct LaunchOptions {
    pub node_path: String,
    pub browser: Browser,
    pub headless: bool,
    pub viewport_width: u32,
    pub viewport_height: u32,
    pub slow_mo_ms: u64,
}

impl Default for LaunchOptions {
    fn default() -> Self {
        Self {
            node_path: "node".to_string(),
            browser: Browser::Chromium,
            headless: true,
            viewport_width: 1280,
            viewport_height: 720,
            slow_mo_ms: 0,
        }
    }
}

impl From<&WebConfig> for LaunchOptions {
    fn from(config: &WebConfig) -> Self {
        Self {
            node_path: config.node_path.clone(),
            browser: config.browser,
            headless: config.headless,
            viewport_width: config.viewport_width,
            viewport_height: config.viewport_height,
            slow_mo_ms: config.slow_mo_ms,
        }
    }
}

const BRIDGE_SCRIPT: &str = r#"
const { chromium, firefox, webkit } = require('playwright');
const readline = require('readline');

const opts = JSON.parse(process.argv[2]);
const engines = { chromium, firefox, webkit };
const reply = (msg) => process.stdout.write(JSON.stringify(msg) + '\n');

async function run(page, cmd) {
  switch (cmd.op) {
    case 'navigate':
      await page.goto(cmd.url, { timeout: cmd.timeout });
      return page.url();
    case 'click':
      await page.click(cmd.selector, { timeout: cmd.timeout });
      return null;
    case 'fill':
      await page.fill(cmd.selector, cmd.value, { timeout: cmd.timeout });
      return null;
    case 'select':
      await page.selectOption(cmd.selector, cmd.value, { timeout: cmd.timeout });
      return null;
    case 'hover':
      await page.hover(cmd.selector, { timeout: cmd.timeout });
      return null;
    case 'waitFor':
      await page.waitForSelector(cmd.selector, { state: cmd.state, timeout: cmd.timeout });
      return null;
    case 'isVisible':
      return await page.locator(cmd.selector).first().isVisible();
    case 'count':
      return await page.locator(cmd.selector).count();
    case 'textContent':
      return await page.textContent(cmd.selector, { timeout: cmd.timeout });
    case 'screenshot':
      await page.screenshot({ path: cmd.path, fullPage: cmd.fullPage });
      return cmd.path;
    case 'close':
      return null;
    default:
      throw new Error('unknown op ' + cmd.op);
  }
}

(async () => {
  let browser;
  let page;
  try {
    browser = await engines[opts.browser].launch({ headless: opts.headless, slowMo: opts.slowMo });
    const context = await browser.newContext({
      viewport: { width: opts.width, height: opts.height }
    });
    page = await context.newPage();
  } catch (error) {
    reply({ id: 0, ok: false, error: error.message });
    process.exit(1);
  }
  reply({ id: 0, ok: true, value: 'ready' });

  const rl = readline.createInterface({ input: process.stdin });
  for await (const line of rl) {
    if (!line.trim()) continue;
    const cmd = JSON.parse(line);
    try {
      const value = await run(page, cmd);
      reply({ id: cmd.id, ok: true, value: value === undefined ? null : value });
    } catch (error) {
      reply({ id: cmd.id, ok: false, error: error.message });
    }
    if (cmd.op === 'close') break;
  }
  await browser.close();
  process.exit(0);
})();
"#;

#[derive(Debug, Deserialize)]
struct BridgeReply {
    id: u64,
    ok: bool,
    #[serde(default)]
    value: Value,
    #[serde(default)]
    error: Option<String>,
}

/// Long-lived Node process driving one Playwright page
pub struct PlaywrightBridge {
    child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
    next_id: u64,
    _script_dir: TempDir,
}

impl PlaywrightBridge {
    /// Write the bridge script, start Node and wait for the browser to come up.
    pub async fn launch(options: &LaunchOptions) -> E2eResult<Self> {
        let script_dir = tempfile::tempdir()?;
        let script_path = script_dir.path().join("bridge.js");
        std::fs::write(&script_path, BRIDGE_SCRIPT)?;

        let launch = json!({
            "browser": options.browser.as_str(),
            "headless": options.headless,
            "width": options.viewport_width,
            "height": options.viewport_height,
            "slowMo": options.slow_mo_ms,
        });

        info!(
            "Launching {} via Playwright bridge (headless: {})",
            options.browser.as_str(),
            options.headless
        );

        let mut child = Command::new(&options.node_path)
            .arg(&script_path)
            .arg(launch.to_string())
            .env("NODE_PATH", node_path_env(&std::env::current_dir()?))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                E2eError::Playwright(format!("failed to spawn {}: {}", options.node_path, e))
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| E2eError::Playwright("bridge stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| E2eError::Playwright("bridge stdout unavailable".into()))?;

        let mut bridge = Self {
            child,
            stdin,
            stdout: BufReader::new(stdout).lines(),
            next_id: 1,
            _script_dir: script_dir,
        };

        let ready = bridge.read_reply(0).await?;
        if !ready.ok {
            return Err(E2eError::Playwright(format!(
                "browser launch failed: {}",
                ready.error.unwrap_or_default()
            )));
        }
        debug!("Playwright bridge ready");
        Ok(bridge)
    }

    async fn read_reply(&mut self, id: u64) -> E2eResult<BridgeReply> {
        loop {
            let line = self
                .stdout
                .next_line()
                .await?
                .ok_or_else(|| E2eError::Playwright("bridge exited unexpectedly".into()))?;
            if line.trim().is_empty() {
                continue;
            }
            let reply: BridgeReply = match serde_json::from_str(&line) {
                Ok(reply) => reply,
                Err(_) => {
                    debug!("bridge: {}", line);
                    continue;
                }
            };
            // Replies to requests abandoned after a timeout arrive late
            if reply.id < id {
                debug!("Discarding stale bridge reply {}", reply.id);
                continue;
            }
            return Ok(reply);
        }
    }
}

#[async_trait]
impl BrowserBackend for PlaywrightBridge {
    async fn execute(&mut self, command: BrowserCommand) -> E2eResult<Value> {
        let id = self.next_id;
        self.next_id += 1;

        let mut message = serde_json::to_value(&command)?;
        message["id"] = json!(id);
        let mut line = message.to_string();
        line.push('\n');

        debug!("bridge -> {}", command.label());
        self.stdin.write_all(line.as_bytes()).await?;
        self.stdin.flush().await?;

        let reply = self.read_reply(id).await?;
        if reply.ok {
            Ok(reply.value)
        } else {
            Err(E2eError::Playwright(
                reply.error.unwrap_or_else(|| "unknown bridge error".into()),
            ))
        }
    }

    async fn close(&mut self) -> E2eResult<()> {
        if let Err(e) = self.execute(BrowserCommand::Close).await {
            debug!("Bridge close command failed: {}", e);
        }
        match tokio::time::timeout(Duration::from_secs(5), self.child.wait()).await {
            Ok(status) => {
                debug!("Playwright bridge exited: {:?}", status?);
            }
            Err(_) => {
                warn!("Playwright bridge did not exit, killing it");
                self.child.kill().await?;
            }
        }
        Ok(())
    }
}

/// `NODE_PATH` letting the bridge resolve a `playwright` installed in the
/// working directory.
fn node_path_env(cwd: &Path) -> String {
    let local = cwd.join("node_modules").display().to_string();
    match std::env::var("NODE_PATH") {
        Ok(existing) if !existing.is_empty() => format!("{}:{}", local, existing),
        _ => local,
    }
}
