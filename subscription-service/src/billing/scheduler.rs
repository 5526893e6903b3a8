//! Anchored weekly scheduler.
//!
//! Until the first billing weekday after startup the scheduler polls once a
//! day. Reaching that weekday starts a new week and a sweep; from then on it
//! ticks every seven days. Sweeps run inline, so they never overlap, and ticks
//! missed while a sweep is running are skipped.
//!
//! The week counter is owned here and published through a watch channel;
//! [`WeekHandle`] only ever sees copies.

use crate::billing::calendar::{BillingCalendar, BILLING_WEEKDAY};
use crate::billing::sweep::ChargeSweep;
use crate::models::BillingRunStatus;
use crate::services::metrics::set_billing_week;
use crate::services::store::BillingRunStore;
use chrono::{DateTime, Datelike, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

const DAY: Duration = Duration::from_secs(24 * 60 * 60);
const WEEK: Duration = Duration::from_secs(7 * 24 * 60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerPhase {
    WaitingForAnchorWeekday,
    SteadyState,
}

impl SchedulerPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            SchedulerPhase::WaitingForAnchorWeekday => "waiting_for_anchor_weekday",
            SchedulerPhase::SteadyState => "steady_state",
        }
    }

    pub fn to_proto(&self) -> i32 {
        match self {
            SchedulerPhase::WaitingForAnchorWeekday => 1,
            SchedulerPhase::SteadyState => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WeekSnapshot {
    pub week_number: u64,
    pub phase: SchedulerPhase,
}

/// Read-only view of the scheduler's week counter.
#[derive(Debug, Clone)]
pub struct WeekHandle {
    rx: watch::Receiver<WeekSnapshot>,
}

impl WeekHandle {
    pub fn current(&self) -> WeekSnapshot {
        *self.rx.borrow()
    }

    /// Wait until the counter reaches `week_number`. `None` if the scheduler is gone first.
    pub async fn reached(&mut self, week_number: u64) -> Option<WeekSnapshot> {
        loop {
            let snapshot = *self.rx.borrow_and_update();
            if snapshot.week_number >= week_number {
                return Some(snapshot);
            }
            self.rx.changed().await.ok()?;
        }
    }
}

pub struct BillingScheduler {
    calendar: BillingCalendar,
    sweep: ChargeSweep,
    runs: Arc<dyn BillingRunStore>,
    started_at: DateTime<Utc>,
    week_tx: watch::Sender<WeekSnapshot>,
    shutdown: CancellationToken,
}

impl BillingScheduler {
    /// `started_at` is the wall-clock time matching the moment `run` is first polled.
    pub fn new(
        calendar: BillingCalendar,
        sweep: ChargeSweep,
        runs: Arc<dyn BillingRunStore>,
        started_at: DateTime<Utc>,
        shutdown: CancellationToken,
    ) -> (Self, WeekHandle) {
        let phase = if started_at.weekday() == BILLING_WEEKDAY {
            SchedulerPhase::SteadyState
        } else {
            SchedulerPhase::WaitingForAnchorWeekday
        };
        let initial = WeekSnapshot {
            week_number: calendar.week_number_at(started_at),
            phase,
        };
        set_billing_week(initial.week_number);

        let (week_tx, rx) = watch::channel(initial);
        let scheduler = Self {
            calendar,
            sweep,
            runs,
            started_at,
            week_tx,
            shutdown,
        };

        (scheduler, WeekHandle { rx })
    }

    pub fn handle(&self) -> WeekHandle {
        WeekHandle {
            rx: self.week_tx.subscribe(),
        }
    }

    pub async fn run(self) {
        let initial = *self.week_tx.borrow();
        tracing::info!(
            anchor = %self.calendar.anchor(),
            week_number = initial.week_number,
            phase = initial.phase.as_str(),
            "Billing scheduler started"
        );

        if initial.phase == SchedulerPhase::WaitingForAnchorWeekday {
            if !self.wait_for_billing_weekday().await {
                tracing::info!("Billing scheduler stopped before the first billing day");
                return;
            }
            self.tick().await;
        }

        let mut weekly = interval_at(Instant::now() + WEEK, WEEK);
        weekly.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                _ = weekly.tick() => self.tick().await,
            }
        }

        tracing::info!(
            week_number = self.week_tx.borrow().week_number,
            "Billing scheduler stopped"
        );
    }

    /// Day-granularity poll. Returns false when shut down while waiting.
    async fn wait_for_billing_weekday(&self) -> bool {
        let mut day = self.started_at.date_naive();
        let mut daily = interval_at(Instant::now() + DAY, DAY);

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return false,
                _ = daily.tick() => {}
            }

            day = match day.succ_opt() {
                Some(next) => next,
                None => return false,
            };
            if day.weekday() == BILLING_WEEKDAY {
                return true;
            }
            tracing::debug!(day = %day, "Waiting for the first billing day");
        }
    }

    /// Start the next week and sweep it. Once started, the sweep runs to completion.
    async fn tick(&self) {
        let week_number = self.week_tx.borrow().week_number + 1;
        self.week_tx.send_replace(WeekSnapshot {
            week_number,
            phase: SchedulerPhase::SteadyState,
        });
        set_billing_week(week_number);
        tracing::info!(week_number = week_number, "New billing week");

        let run = match self.runs.begin_run(week_number).await {
            Ok(Some(run)) => run,
            Ok(None) => {
                tracing::warn!(week_number = week_number, "Week already swept, skipping");
                return;
            }
            Err(e) => {
                tracing::error!(
                    week_number = week_number,
                    error = %e,
                    "Failed to record billing run, skipping sweep"
                );
                return;
            }
        };

        let report = self.sweep.run(week_number).await;
        if report.status == BillingRunStatus::Failed {
            tracing::warn!(week_number = week_number, "Sweep failed before charging");
        }
        if let Err(e) = self.runs.complete_run(run.run_id, &report).await {
            tracing::error!(
                run_id = %run.run_id,
                week_number = week_number,
                error = %e,
                "Failed to record sweep report"
            );
        }
    }
}
