//! Order lifecycle flow
//!
//! An order is placed by a (simulated) mobile client, must show up for the
//! restaurant, is accepted and marked ready on the dashboard (API fallback),
//! and the final status is checked everywhere it is visible.

use std::path::PathBuf;

use serde_json::json;
use tracing::info;

use super::{step, summary, FlowContext};
use crate::drivers::{MobileStep, Platform};
use crate::error::{E2eError, E2eResult};
use crate::models::{MenuItem, NewOrder, Order, OrderItem, OrderStatus};
use crate::reporter::FlowResult;
use crate::wait::wait_for_value;

pub const ORDER_FLOW: &str = "order-flow";

#[derive(Debug, Clone)]
pub struct OrderFlowResult {
    pub success: bool,
    pub order_id: Option<i64>,
    pub result: FlowResult,
    pub json_report: PathBuf,
    pub markdown_report: PathBuf,
}

/// Run the order flow. Only a failure to write the report is an `Err`.
pub async fn run_order_flow(ctx: &mut FlowContext) -> E2eResult<OrderFlowResult> {
    ctx.begin(ORDER_FLOW);
    let outcome = order_phases(ctx).await;

    ctx.reporter.start_phase("Cleanup");
    let report = ctx.finish(outcome).await?;
    let order_id = ctx.store.get::<i64>("orderId");

    Ok(OrderFlowResult {
        success: report.result.passed(),
        order_id,
        result: report.result,
        json_report: report.json_path,
        markdown_report: report.markdown_path,
    })
}

async fn order_phases(ctx: &mut FlowContext) -> E2eResult<()> {
    let web_ready = ctx.prerequisites().await?;

    // Data preparation
    ctx.reporter.start_phase("Data preparation");
    let Some(restaurant) = ctx.prepare_restaurant().await? else {
        ctx.skip("Fetch menu", Platform::Api, "no restaurant");
        return Ok(());
    };
    let Some(item) = pick_menu_item(ctx, restaurant.id).await? else {
        ctx.skip("Create order", Platform::Api, "no menu item to order");
        return Ok(());
    };

    // Action
    ctx.reporter.start_phase("Create order");
    let Some(order) = create_order(ctx, restaurant.id, &item).await? else {
        return Ok(());
    };

    // Cross-platform verification
    ctx.reporter.start_phase("Cross-platform verification");
    ctx.wait_for_sync().await;
    verify_via_api(ctx, &order).await?;
    let visible_on_web = web_ready && verify_on_dashboard(ctx, order.id).await?;

    // State transitions
    ctx.reporter.start_phase("State transitions");
    transition(ctx, order.id, OrderStatus::EnPreparation, visible_on_web).await?;
    transition(ctx, order.id, OrderStatus::Prete, visible_on_web).await?;

    // Mobile verification
    if ctx.config.flow.use_maestro {
        ctx.reporter.start_phase("Mobile verification");
        let mobile = ctx.drivers.mobile.as_ref();
        let steps = vec![
            MobileStep::LaunchApp { clear_state: false },
            MobileStep::TapOn("Mes commandes".into()),
            MobileStep::ScrollUntilVisible(format!("Commande #{}", order.id)),
            MobileStep::AssertVisible("Prête".into()),
        ];
        step!(ctx, "Order shown as ready in app", Platform::Mobile, async move {
            let mobile = mobile.ok_or_else(|| E2eError::Config("no mobile driver".into()))?;
            mobile.run_checked("order status in app", &steps).await
        })?;
    }

    Ok(())
}

async fn pick_menu_item(ctx: &mut FlowContext, restaurant_id: i64) -> E2eResult<Option<MenuItem>> {
    let api = &ctx.drivers.api;
    let item = step!(ctx, "Fetch menu", Platform::Api, async move {
        let items = api.get_menu_items(restaurant_id).await?;
        items.into_iter().find(|i| i.available).ok_or_else(|| {
            E2eError::AssertionFailed(format!(
                "restaurant {} has no available menu item",
                restaurant_id
            ))
        })
    })?;

    if let Some(item) = &item {
        ctx.remember("menuItem", item, Platform::Api);
        ctx.remember("menuItemId", item.id, Platform::Api);
    }
    Ok(item)
}

async fn create_order(ctx: &mut FlowContext, restaurant_id: i64, item: &MenuItem) -> E2eResult<Option<Order>> {
    // Without a scriptable ordering screen the mobile client is simulated
    // through the same API call the app makes
    let (origin, name) = if ctx.config.flow.use_maestro {
        (Platform::Mobile, "Place order (simulated mobile client)")
    } else {
        (Platform::Api, "Place order via API")
    };
    let request = NewOrder {
        restaurant_id,
        items: vec![OrderItem::new(item.id, 1)],
    };

    let order = step!(ctx, name, origin, ctx.drivers.api.create_order(&request))?;
    let Some(order) = order else {
        return Ok(None);
    };
    info!("Created order {} ({})", order.id, order.status);
    ctx.remember("orderId", order.id, origin);
    ctx.remember("order", &order, origin);

    let status = order.status;
    step!(ctx, "Order starts pending", Platform::Api, async move {
        if status.is_pending() {
            Ok(summary(&[("status", json!(status))]))
        } else {
            Err(E2eError::AssertionFailed(format!(
                "expected {} after creation, got {}",
                OrderStatus::EnAttente,
                status
            )))
        }
    })?;
    Ok(Some(order))
}

async fn verify_via_api(ctx: &mut FlowContext, created: &Order) -> E2eResult<()> {
    let api = &ctx.drivers.api;
    let options = ctx.sync_options(format!("order {} not listed for its restaurant", created.id));
    let (id, restaurant_id) = (created.id, created.restaurant_id);

    let listed = step!(ctx, "Order listed for restaurant", Platform::Api, async move {
        wait_for_value(
            move || async move {
                let orders = api.get_restaurant_orders(restaurant_id).await?;
                Ok(orders.into_iter().find(|o| o.id == id))
            },
            options,
        )
        .await
    })?;

    if let Some(listed) = listed {
        let expected: Vec<i64> = created.items.iter().map(|i| i.menu_item_id).collect();
        let actual: Vec<i64> = listed.items.iter().map(|i| i.menu_item_id).collect();
        let status = created.status;
        step!(ctx, "Listed order matches created order", Platform::Api, async move {
            if listed.status != status {
                return Err(E2eError::AssertionFailed(format!(
                    "status differs: created {}, listed {}",
                    status, listed.status
                )));
            }
            if !actual.is_empty() && actual != expected {
                return Err(E2eError::AssertionFailed(format!(
                    "items differ: created {:?}, listed {:?}",
                    expected, actual
                )));
            }
            Ok(())
        })?;
    }
    Ok(())
}

/// True when the order card showed up on the dashboard.
async fn verify_on_dashboard(ctx: &mut FlowContext, order_id: i64) -> E2eResult<bool> {
    let timeout = ctx.config.timeouts.sync();
    let Some(web) = ctx.drivers.web.as_mut() else {
        return Ok(false);
    };
    let seen = step!(
        ctx,
        "Order visible on dashboard",
        Platform::Web,
        web.wait_for_order(order_id, timeout)
    )?;
    Ok(seen.is_some())
}

async fn transition(
    ctx: &mut FlowContext,
    order_id: i64,
    target: OrderStatus,
    use_dashboard: bool,
) -> E2eResult<()> {
    let action = match target {
        OrderStatus::EnPreparation => "Accept order",
        _ => "Mark order ready",
    };

    let web = if use_dashboard {
        ctx.drivers.web.as_mut()
    } else {
        None
    };
    let done_on_dashboard = match web {
        Some(web) => step!(ctx, format!("{} on dashboard", action), Platform::Web, async move {
            match target {
                OrderStatus::EnPreparation => web.accept_order(order_id).await,
                _ => web.mark_order_ready(order_id).await,
            }
        })?
        .is_some(),
        None => false,
    };

    // Dashboard unusable or the click failed: drive the status directly
    if !done_on_dashboard {
        let api = &ctx.drivers.api;
        step!(
            ctx,
            format!("{} via API", action),
            Platform::Api,
            api.update_order_status(order_id, target)
        )?;
    }

    let timeout = ctx.config.timeouts.sync();
    let api = &ctx.drivers.api;
    let order = step!(
        ctx,
        format!("Order reaches {}", target),
        Platform::Api,
        api.wait_for_order_status(order_id, target, timeout)
    )?;
    if let Some(order) = order {
        ctx.remember("orderStatus", order.status, Platform::Api);
    }
    Ok(())
}
