//! Menu management flow
//!
//! The restaurant edits its menu on the dashboard (API when the dashboard is
//! not usable) and the change must converge in the API, and in the app when
//! Maestro is enabled.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::{step, FlowContext};
use crate::drivers::{MobileStep, Platform};
use crate::error::{E2eError, E2eResult};
use crate::models::{MenuItem, MenuItemUpdate, NewMenuItem};
use crate::reporter::FlowResult;
use crate::wait::wait_for_value;

pub const MENU_FLOW: &str = "menu-flow";

/// Key listing ids of menu items created by the run
const CREATED_ITEMS: &str = "createdItemIds";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MenuAction {
    #[default]
    Create,
    Update,
    Toggle,
    Delete,
}

impl fmt::Display for MenuAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MenuAction::Create => "create",
            MenuAction::Update => "update",
            MenuAction::Toggle => "toggle",
            MenuAction::Delete => "delete",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
pub struct MenuFlowResult {
    pub success: bool,
    pub action: MenuAction,
    /// Item the action was applied to
    pub menu_item_id: Option<i64>,
    pub menu_item_name: Option<String>,
    pub result: FlowResult,
    pub json_report: PathBuf,
    pub markdown_report: PathBuf,
}

/// What the API must eventually show after the action
#[derive(Debug, Clone)]
enum Expectation {
    NamedItem { name: String },
    Updated { id: i64, name: String, price: f64 },
    Availability { id: i64, available: bool },
    Gone { id: i64 },
}

pub fn test_item_name() -> String {
    format!("Test Plat {}", chrono::Utc::now().timestamp_millis())
}

fn new_test_item(restaurant_id: i64, name: String) -> NewMenuItem {
    NewMenuItem {
        name,
        description: Some("Créé par les tests E2E".to_string()),
        price: 12.5,
        category: Some("Plats".to_string()),
        available: true,
        restaurant_id,
    }
}

pub async fn run_menu_flow(ctx: &mut FlowContext, action: MenuAction) -> E2eResult<MenuFlowResult> {
    ctx.begin(MENU_FLOW);
    ctx.remember("action", action, Platform::Api);
    let outcome = menu_phases(ctx, action).await;

    ctx.reporter.start_phase("Cleanup");
    if ctx.config.flow.cleanup {
        delete_fixtures(ctx).await;
    }
    let report = ctx.finish(outcome).await?;

    Ok(MenuFlowResult {
        success: report.result.passed(),
        action,
        menu_item_id: ctx.store.get("menuItemId"),
        menu_item_name: ctx.store.get("menuItemName"),
        result: report.result,
        json_report: report.json_path,
        markdown_report: report.markdown_path,
    })
}

async fn menu_phases(ctx: &mut FlowContext, action: MenuAction) -> E2eResult<()> {
    let web_ready = ctx.prerequisites().await?;

    ctx.reporter.start_phase("Data preparation");
    let Some(restaurant) = ctx.prepare_restaurant().await? else {
        ctx.skip(&format!("{} menu item", action), Platform::Api, "no restaurant");
        return Ok(());
    };

    let fixture = match action {
        MenuAction::Create => None,
        _ => match create_fixture(ctx, restaurant.id).await? {
            Some(item) => Some(item),
            None => {
                ctx.skip(&format!("{} menu item", action), Platform::Api, "no fixture item");
                return Ok(());
            }
        },
    };

    ctx.reporter.start_phase("Menu action");
    let platform = if web_ready { Platform::Web } else { Platform::Api };
    let expectation = match (action, fixture) {
        (MenuAction::Create, _) => {
            let name = test_item_name();
            ctx.remember("menuItemName", &name, platform);
            let item = new_test_item(restaurant.id, name.clone());
            let created_via_api = if web_ready {
                let web = ctx.drivers.web.as_mut();
                step!(ctx, "Create menu item on dashboard", Platform::Web, async move {
                    web.ok_or_else(|| E2eError::Config("no web driver".into()))?
                        .create_menu_item(&item)
                        .await
                })?;
                None
            } else {
                step!(
                    ctx,
                    "Create menu item via API",
                    Platform::Api,
                    ctx.drivers.api.create_menu_item(&item)
                )?
            };
            if let Some(created) = created_via_api {
                track_created(ctx, created.id);
            }
            Expectation::NamedItem { name }
        }
        (MenuAction::Update, Some(fixture)) => {
            let name = format!("{} (modifié)", fixture.name);
            let price = fixture.price + 1.0;
            ctx.remember("menuItemName", &name, platform);
            let update = MenuItemUpdate {
                name: Some(name.clone()),
                price: Some(price),
                ..Default::default()
            };
            apply(ctx, web_ready, fixture.id, MenuChange::Update(update)).await?;
            Expectation::Updated {
                id: fixture.id,
                name,
                price,
            }
        }
        (MenuAction::Toggle, Some(fixture)) => {
            let available = !fixture.available;
            ctx.remember("menuItemName", &fixture.name, platform);
            apply(ctx, web_ready, fixture.id, MenuChange::Toggle { available }).await?;
            Expectation::Availability {
                id: fixture.id,
                available,
            }
        }
        (MenuAction::Delete, Some(fixture)) => {
            ctx.remember("menuItemName", &fixture.name, platform);
            apply(ctx, web_ready, fixture.id, MenuChange::Delete).await?;
            Expectation::Gone { id: fixture.id }
        }
        (_, None) => return Ok(()),
    };

    ctx.reporter.start_phase("Cross-platform verification");
    ctx.wait_for_sync().await;
    let converged = verify_via_api(ctx, restaurant.id, &expectation).await?;

    if web_ready && converged {
        verify_on_dashboard(ctx, &expectation).await?;
    }

    if ctx.config.flow.use_maestro {
        ctx.reporter.start_phase("Mobile verification");
        verify_in_app(ctx, &expectation).await?;
    }
    Ok(())
}

/// Mutation applied to an existing item
#[derive(Debug, Clone)]
enum MenuChange {
    Update(MenuItemUpdate),
    Toggle { available: bool },
    Delete,
}

impl MenuChange {
    fn label(&self) -> &'static str {
        match self {
            MenuChange::Update(_) => "Update menu item",
            MenuChange::Toggle { .. } => "Toggle availability",
            MenuChange::Delete => "Delete menu item",
        }
    }
}

/// Run a menu mutation on the dashboard when it is usable, else on the API.
async fn apply(ctx: &mut FlowContext, web_ready: bool, item_id: i64, change: MenuChange) -> E2eResult<()> {
    let web = if web_ready { ctx.drivers.web.as_mut() } else { None };
    let platform = if web.is_some() { Platform::Web } else { Platform::Api };
    let name = match platform {
        Platform::Web => format!("{} on dashboard", change.label()),
        _ => format!("{} via API", change.label()),
    };
    let api = &ctx.drivers.api;

    step!(ctx, name, platform, async move {
        match (web, change) {
            (Some(web), MenuChange::Update(update)) => web.update_menu_item(item_id, &update).await,
            (Some(web), MenuChange::Toggle { .. }) => web.toggle_menu_item(item_id).await,
            (Some(web), MenuChange::Delete) => web.delete_menu_item(item_id).await,
            (None, MenuChange::Update(update)) => api.update_menu_item(item_id, &update).await.map(|_| ()),
            (None, MenuChange::Toggle { available }) => {
                let update = MenuItemUpdate {
                    available: Some(available),
                    ..Default::default()
                };
                api.update_menu_item(item_id, &update).await.map(|_| ())
            }
            (None, MenuChange::Delete) => api.delete_menu_item(item_id).await,
        }
    })?;
    ctx.remember("menuItemId", item_id, platform);
    Ok(())
}

async fn create_fixture(ctx: &mut FlowContext, restaurant_id: i64) -> E2eResult<Option<MenuItem>> {
    let item = new_test_item(restaurant_id, test_item_name());
    let created = step!(
        ctx,
        "Create fixture menu item",
        Platform::Api,
        ctx.drivers.api.create_menu_item(&item)
    )?;
    if let Some(created) = &created {
        track_created(ctx, created.id);
        ctx.remember("fixture", created, Platform::Api);
    }
    Ok(created)
}

fn track_created(ctx: &mut FlowContext, item_id: i64) {
    if let Err(e) = ctx.store.push(CREATED_ITEMS, item_id) {
        warn!("Could not track created item {}: {}", item_id, e);
    }
}

/// Poll the restaurant menu until it reflects `expectation`. Returns whether
/// it converged; the matching item is remembered as `menuItem`.
async fn verify_via_api(
    ctx: &mut FlowContext,
    restaurant_id: i64,
    expectation: &Expectation,
) -> E2eResult<bool> {
    let api = &ctx.drivers.api;
    let options = ctx.sync_options(format!("menu did not converge to {:?}", expectation));
    let expected = expectation.clone();

    let outcome = step!(ctx, "Menu converged in API", Platform::Api, async move {
        wait_for_value(
            || {
                let expected = expected.clone();
                async move {
                    let items = api.get_menu_items(restaurant_id).await?;
                    Ok(match_expectation(&expected, items))
                }
            },
            options,
        )
        .await
    })?;

    let item = match outcome {
        Some(Some(item)) => item,
        Some(None) => return Ok(true),
        None => return Ok(false),
    };
    if let Expectation::NamedItem { .. } = expectation {
        info!("Menu item '{}' created with id {}", item.name, item.id);
        ctx.remember("menuItemId", item.id, Platform::Api);
        let already_tracked = ctx
            .store
            .get::<Vec<i64>>(CREATED_ITEMS)
            .unwrap_or_default()
            .contains(&item.id);
        if !already_tracked {
            track_created(ctx, item.id);
        }
    }
    ctx.remember("menuItem", &item, Platform::Api);
    Ok(true)
}

/// `Some(Some(item))` when satisfied by an item, `Some(None)` when satisfied
/// by an absence, `None` while not converged.
fn match_expectation(expected: &Expectation, items: Vec<MenuItem>) -> Option<Option<MenuItem>> {
    match expected {
        Expectation::NamedItem { name } => items.into_iter().find(|i| &i.name == name).map(Some),
        Expectation::Updated { id, name, price } => items
            .into_iter()
            .find(|i| i.id == *id && &i.name == name && (i.price - price).abs() < 0.005)
            .map(Some),
        Expectation::Availability { id, available } => items
            .into_iter()
            .find(|i| i.id == *id && i.available == *available)
            .map(Some),
        Expectation::Gone { id } => (!items.iter().any(|i| i.id == *id)).then_some(None),
    }
}

async fn verify_on_dashboard(ctx: &mut FlowContext, expectation: &Expectation) -> E2eResult<()> {
    let timeout = ctx.config.timeouts.sync();
    let fixture_name: Option<String> = ctx.store.get("menuItemName");
    let Some(web) = ctx.drivers.web.as_mut() else {
        return Ok(());
    };
    match expectation {
        Expectation::NamedItem { name } | Expectation::Updated { name, .. } => {
            step!(
                ctx,
                "Menu item shown on dashboard",
                Platform::Web,
                web.wait_for_menu_item(name, timeout)
            )?;
        }
        Expectation::Availability { id, available } => {
            let Some(name) = fixture_name else {
                return Ok(());
            };
            let (id, available) = (*id, *available);
            step!(ctx, "Dashboard lists the item", Platform::Web, async move {
                web.wait_for_menu_item(&name, timeout).await.map_err(|e| match e {
                    E2eError::Timeout(_) => {
                        E2eError::AssertionFailed(format!("'{}' not listed on the dashboard", name))
                    }
                    other => other,
                })?;
                web.wait_for_menu_item_availability(id, available, timeout)
                    .await
                    .map_err(|e| match e {
                        E2eError::Timeout(_) => E2eError::AssertionFailed(format!(
                            "'{}' shown as {} on the dashboard",
                            name,
                            if available { "unavailable" } else { "available" }
                        )),
                        other => other,
                    })
            })?;
        }
        Expectation::Gone { .. } => {
            let Some(name) = fixture_name else {
                return Ok(());
            };
            step!(ctx, "Menu item removed from dashboard", Platform::Web, async move {
                web.wait_for_menu_item_gone(&name, timeout).await.map_err(|e| match e {
                    E2eError::Timeout(_) => {
                        E2eError::AssertionFailed(format!("'{}' still listed on the dashboard", name))
                    }
                    other => other,
                })
            })?;
        }
    }
    Ok(())
}

async fn verify_in_app(ctx: &mut FlowContext, expectation: &Expectation) -> E2eResult<()> {
    let name: Option<String> = match expectation {
        Expectation::NamedItem { name } | Expectation::Updated { name, .. } => Some(name.clone()),
        _ => ctx.store.get::<MenuItem>("fixture").map(|f| f.name),
    };
    let Some(name) = name else {
        ctx.skip("Menu item in app", Platform::Mobile, "unknown item name");
        return Ok(());
    };

    let steps = match expectation {
        Expectation::Gone { .. } => vec![
            MobileStep::LaunchApp { clear_state: false },
            MobileStep::Wait(2_000),
            MobileStep::AssertNotVisible(name),
        ],
        _ => vec![
            MobileStep::LaunchApp { clear_state: false },
            MobileStep::ScrollUntilVisible(name.clone()),
            MobileStep::AssertVisible(name),
        ],
    };
    let mobile = ctx.drivers.mobile.as_ref();
    step!(ctx, "Menu change visible in app", Platform::Mobile, async move {
        let mobile = mobile.ok_or_else(|| E2eError::Config("no mobile driver".into()))?;
        mobile.run_checked("menu item in app", &steps).await
    })?;
    Ok(())
}

/// Delete menu items created by this run. Runs after cancellation too, so
/// steps are not guarded by the cancel token.
async fn delete_fixtures(ctx: &mut FlowContext) {
    let ids: Vec<i64> = ctx.store.get(CREATED_ITEMS).unwrap_or_default();
    for id in ids {
        ctx.reporter
            .start_step(&format!("Delete test item {}", id), Platform::Api);
        let result = match ctx.drivers.api.delete_menu_item(id).await {
            Err(E2eError::NotFound { .. }) => Ok(()),
            other => other,
        };
        if let Err(e) = ctx.end_step(result).await {
            warn!("Cleanup of item {} failed: {}", id, e);
        }
    }
}
