// SPDX-License-Identifier: MIT OR Apache-2.0
//! The shift manager: open/close, the 30 s auto-closer, and the carryover
//! it triggers on open.

use crate::{EngineError, carryover, route_state};
use chrono::{DateTime, NaiveDate, NaiveTime, TimeZone, Utc};
use despacho_bus::{EventBus, TxnEvents};
use despacho_core::{EventDraft, EventType, Shift, Slot, UserId};
use despacho_store::{Store, shifts};
use serde_json::json;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Auto-closer tick period.
pub const AUTO_CLOSE_PERIOD: Duration = Duration::from_secs(30);

/// Opens and closes shifts; owns the carryover trigger and the "poll now"
/// nudge toward the ingest worker.
#[derive(Debug, Clone)]
pub struct ShiftManager {
    store: Store,
    bus: EventBus,
    poll_nudge: Option<mpsc::Sender<()>>,
}

impl ShiftManager {
    /// Build a manager over the shared store and bus.
    pub fn new(store: Store, bus: EventBus) -> Self {
        Self {
            store,
            bus,
            poll_nudge: None,
        }
    }

    /// Wire the ingest worker's "poll now" channel; a shift open triggers
    /// one immediate poll through it.
    pub fn with_poll_nudge(mut self, nudge: mpsc::Sender<()>) -> Self {
        self.poll_nudge = Some(nudge);
        self
    }

    /// Open `(date, slot)`: refuses while another shift is active, without
    /// an active schedule, or when the row already exists. Carryover from
    /// the previous shift commits atomically with the activation; the
    /// backlog poll is triggered afterwards, best effort.
    pub async fn open_shift(
        &self,
        slot: Slot,
        date: NaiveDate,
        actor: Option<UserId>,
    ) -> Result<Shift, EngineError> {
        let mut tx = self.store.begin().await.map_err(EngineError::Store)?;

        if shifts::find_active(&mut tx).await?.is_some() {
            return Err(EngineError::ShiftAlreadyActive);
        }
        let schedule = shifts::find_schedule(&mut tx, slot)
            .await?
            .ok_or(EngineError::ScheduleNotFound { slot })?;
        if shifts::exists(&mut tx, date, slot).await? {
            return Err(EngineError::DuplicateShift { date, slot });
        }

        let now = Utc::now();
        let scheduled_end = scheduled_end_at(date, schedule.end_hour, schedule.end_minute, now);
        let shift_id = shifts::insert(&mut tx, date, slot).await?;
        shifts::activate(&mut tx, shift_id, now, scheduled_end).await?;

        let mut events = TxnEvents::new();
        let mut draft = EventDraft::new(EventType::ShiftStarted, "shift", shift_id).payload(json!({
            "date": date.to_string(),
            "slot": slot,
        }));
        if let Some(actor) = actor {
            draft = draft.actor(actor);
        }
        events.append(&mut tx, &draft).await?;

        let stats = carryover::run(&mut tx, &mut events, shift_id, now).await?;

        tx.commit().await.map_err(despacho_store::StoreError::from)?;
        events.flush(&self.bus);
        info!(shift_id, %slot, %date, carried_lotes = stats.lotes, "shift opened");

        for route_day_id in stats.route_days {
            route_state::sync_route_state(&self.store, &self.bus, route_day_id).await?;
        }

        // Backlog ingest: one immediate poll. Failure to nudge must not
        // block the activation.
        if let Some(nudge) = &self.poll_nudge {
            if nudge.try_send(()).is_err() {
                warn!("poll nudge dropped; ingest worker busy or gone");
            }
        }

        let mut conn = self
            .store
            .pool()
            .acquire()
            .await
            .map_err(despacho_store::StoreError::from)?;
        shifts::get(&mut conn, shift_id)
            .await?
            .ok_or(EngineError::NotFound {
                what: "shift",
                id: shift_id,
            })
    }

    /// Close the active shift.
    pub async fn close_shift(&self, actor: Option<UserId>) -> Result<Shift, EngineError> {
        let mut tx = self.store.begin().await.map_err(EngineError::Store)?;
        let active = shifts::find_active(&mut tx)
            .await?
            .ok_or(EngineError::NoActiveShift)?;

        let now = Utc::now();
        shifts::close(&mut tx, active.id, now).await?;
        let mut events = TxnEvents::new();
        let mut draft = EventDraft::new(EventType::ShiftClosed, "shift", active.id)
            .payload(json!({ "ended_at": now.to_rfc3339() }));
        if let Some(actor) = actor {
            draft = draft.actor(actor);
        }
        events.append(&mut tx, &draft).await?;
        tx.commit().await.map_err(despacho_store::StoreError::from)?;
        events.flush(&self.bus);
        info!(shift_id = active.id, "shift closed");

        let mut conn = self
            .store
            .pool()
            .acquire()
            .await
            .map_err(despacho_store::StoreError::from)?;
        shifts::get(&mut conn, active.id)
            .await?
            .ok_or(EngineError::NotFound {
                what: "shift",
                id: active.id,
            })
    }

    /// One auto-closer tick: close the active shift when its scheduled end
    /// has elapsed. Returns the closed shift, if any.
    pub async fn auto_close_tick(&self) -> Result<Option<Shift>, EngineError> {
        let mut tx = self.store.begin().await.map_err(EngineError::Store)?;
        let Some(active) = shifts::find_active(&mut tx).await? else {
            return Ok(None);
        };
        let now = Utc::now();
        let Some(scheduled_end) = active.scheduled_end_at else {
            return Ok(None);
        };
        if now < scheduled_end {
            return Ok(None);
        }

        shifts::close(&mut tx, active.id, now).await?;
        let mut events = TxnEvents::new();
        events
            .append(
                &mut tx,
                &EventDraft::new(EventType::ShiftClosedAuto, "shift", active.id).payload(json!({
                    "scheduled_end_at": scheduled_end.to_rfc3339(),
                    "ended_at": now.to_rfc3339(),
                })),
            )
            .await?;
        tx.commit().await.map_err(despacho_store::StoreError::from)?;
        events.flush(&self.bus);
        info!(shift_id = active.id, "shift auto-closed past schedule");

        let mut conn = self
            .store
            .pool()
            .acquire()
            .await
            .map_err(despacho_store::StoreError::from)?;
        Ok(shifts::get(&mut conn, active.id).await?)
    }
}

/// `date + end_of_schedule`, rolled to the next day when that instant is
/// not after the opening instant (overnight slots). Out-of-range schedule
/// rows are clamped into a valid wall-clock time.
fn scheduled_end_at(
    date: NaiveDate,
    end_hour: i64,
    end_minute: i64,
    started_at: DateTime<Utc>,
) -> DateTime<Utc> {
    let hour = end_hour.clamp(0, 23) as u32;
    let minute = end_minute.clamp(0, 59) as u32;
    let time = NaiveTime::from_hms_opt(hour, minute, 0).unwrap_or(NaiveTime::MIN);
    let mut end = Utc.from_utc_datetime(&date.and_time(time));
    if end <= started_at {
        end += chrono::Duration::days(1);
    }
    end
}

/// The auto-closer loop task: tick every 30 s until cancelled.
pub async fn auto_close_loop(manager: ShiftManager, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(AUTO_CLOSE_PERIOD);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("auto-closer stopping");
                return;
            }
            _ = ticker.tick() => {
                if let Err(err) = manager.auto_close_tick().await {
                    error!(error = %err, "auto-close tick failed");
                }
            }
        }
    }
}
