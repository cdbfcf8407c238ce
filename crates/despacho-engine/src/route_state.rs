// SPDX-License-Identifier: MIT OR Apache-2.0
//! The route-state manager: the derived visual color, the collector's
//! logical transitions, and the alerts they emit.

use crate::EngineError;
use chrono::Utc;
use despacho_bus::{EventBus, TxnEvents};
use despacho_core::{
    EventDraft, EventType, LogicalState, RouteDayId, UserId, VisualState,
};
use despacho_store::{Store, routes};
use serde_json::json;
use tracing::debug;

/// The visual transition function: a pure function of the unprinted
/// metric, the prior color, and the logical state.
pub fn next_visual(unprinted: i64, prior: VisualState, logical: LogicalState) -> VisualState {
    if unprinted == 0 {
        VisualState::Green
    } else if prior == VisualState::Green
        || prior == VisualState::Red
        || logical == LogicalState::Collected
    {
        VisualState::Red
    } else {
        VisualState::Blue
    }
}

/// Recompute and persist the visual state of one route; emits
/// `ROUTE_ALERT_RED` / `ROUTE_COMPLETE_GREEN` on the edge transitions.
///
/// Runs in its own transaction; the route-day row lock serializes
/// concurrent recomputations. Call after any commit that may have changed
/// the unprinted metric.
pub async fn sync_route_state(
    store: &Store,
    bus: &EventBus,
    route_day_id: RouteDayId,
) -> Result<VisualState, EngineError> {
    let mut tx = store.begin().await.map_err(EngineError::Store)?;
    let rd = routes::get(&mut tx, route_day_id)
        .await?
        .ok_or(EngineError::NotFound {
            what: "route",
            id: route_day_id,
        })?;
    let unprinted = routes::unprinted_count(&mut tx, route_day_id).await?;
    let next = next_visual(unprinted, rd.visual_state, rd.logical_state);

    let mut events = TxnEvents::new();
    if next != rd.visual_state {
        routes::set_visual(&mut tx, route_day_id, next, Utc::now()).await?;
        match next {
            VisualState::Red => {
                if rd.logical_state == LogicalState::Collected {
                    routes::increment_reactivations(&mut tx, route_day_id).await?;
                }
                events
                    .append(
                        &mut tx,
                        &EventDraft::new(EventType::RouteAlertRed, "route", route_day_id).payload(
                            json!({
                                "route": rd.route_norm,
                                "unprinted": unprinted,
                            }),
                        ),
                    )
                    .await?;
            }
            VisualState::Green => {
                events
                    .append(
                        &mut tx,
                        &EventDraft::new(EventType::RouteCompleteGreen, "route", route_day_id)
                            .payload(json!({ "route": rd.route_norm })),
                    )
                    .await?;
            }
            VisualState::Blue => {}
        }
        debug!(route_day_id, from = %rd.visual_state, to = %next, unprinted, "visual transition");
    }

    tx.commit().await.map_err(despacho_store::StoreError::from)?;
    events.flush(bus);
    Ok(next)
}

/// The collector action: flip the route to COLLECTED and publish
/// `ROUTE_COLLECTED`. Refused while unprinted work remains; enforced
/// against the collector binding when one exists.
pub async fn mark_collected(
    store: &Store,
    bus: &EventBus,
    route_day_id: RouteDayId,
    actor: Option<UserId>,
) -> Result<(), EngineError> {
    let mut tx = store.begin().await.map_err(EngineError::Store)?;
    let rd = routes::get(&mut tx, route_day_id)
        .await?
        .ok_or(EngineError::NotFound {
            what: "route",
            id: route_day_id,
        })?;

    if let Some(collector) = routes::collector_for(&mut tx, rd.shift_id, &rd.route_norm).await? {
        if actor != Some(collector) {
            return Err(EngineError::Forbidden);
        }
    }
    if rd.logical_state == LogicalState::Collected {
        return Ok(());
    }
    let unprinted = routes::unprinted_count(&mut tx, route_day_id).await?;
    if unprinted > 0 {
        return Err(EngineError::ValidationBlocked {
            reason: format!("{unprinted} lines are still unprinted"),
        });
    }

    routes::set_logical(&mut tx, route_day_id, LogicalState::Collected, Utc::now()).await?;
    let mut events = TxnEvents::new();
    let mut draft = EventDraft::new(EventType::RouteCollected, "route", route_day_id)
        .payload(json!({ "route": rd.route_norm }));
    if let Some(actor) = actor {
        draft = draft.actor(actor);
    }
    events.append(&mut tx, &draft).await?;
    tx.commit().await.map_err(despacho_store::StoreError::from)?;
    events.flush(bus);
    Ok(())
}

/// The explicit reactivation API: COLLECTED → ACTIVE. The visual color is
/// recomputed but no dedicated event exists for this edge.
pub async fn reactivate(
    store: &Store,
    bus: &EventBus,
    route_day_id: RouteDayId,
) -> Result<(), EngineError> {
    let mut tx = store.begin().await.map_err(EngineError::Store)?;
    let rd = routes::get(&mut tx, route_day_id)
        .await?
        .ok_or(EngineError::NotFound {
            what: "route",
            id: route_day_id,
        })?;
    if rd.logical_state == LogicalState::Active {
        return Ok(());
    }
    routes::set_logical(&mut tx, route_day_id, LogicalState::Active, Utc::now()).await?;
    tx.commit().await.map_err(despacho_store::StoreError::from)?;
    sync_route_state(store, bus, route_day_id).await?;
    Ok(())
}
