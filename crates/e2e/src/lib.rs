//! Foodflow E2E orchestration engine
//!
//! Drives the three Foodflow surfaces from one Rust process and checks that
//! an action taken on one of them shows up on the others:
//! - the REST API through `reqwest`, behind retry and a circuit breaker
//! - the restaurant dashboard through a Playwright bridge (Node subprocess)
//! - the customer app through Maestro flows
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       foodflow (CLI)                        │
//! ├─────────────────────────────────────────────────────────────┤
//! │  flows                                                      │
//! │    ├── run_order_flow(ctx)          order lifecycle         │
//! │    └── run_menu_flow(ctx, action)   menu management         │
//! │  FlowContext                                                │
//! │    ├── DriverSet { api, web?, mobile? }                     │
//! │    ├── DataStore   (values shared between steps)            │
//! │    └── Reporter    (steps -> JSON + Markdown reports)       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  wait / retry      polling, timeouts, circuit breaker       │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod drivers;
pub mod error;
pub mod flows;
pub mod models;
pub mod reporter;
pub mod retry;
pub mod store;
pub mod wait;

pub use config::E2eConfig;
pub use drivers::{ApiDriver, DriverSet, MobileDriver, Platform, WebDriver};
pub use error::{E2eError, E2eResult};
pub use flows::{run_menu_flow, run_order_flow, FlowContext, MenuAction, MenuFlowResult, OrderFlowResult};
pub use reporter::{FlowResult, FlowStatus, Reporter, StepResult, StepStatus};
pub use store::DataStore;
