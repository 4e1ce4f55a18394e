//! Schedule-driven irrigation: every tick, zones whose weekly slot matches the
//! current time are checked against the weather and either started or skipped.
//! Manual start/stop requests go through the same active-run registry, so a
//! zone never has more than one run in flight.
//!
//! Lock order is always registry, then shared state. The `closed` flag is only
//! written and read under the registry lock.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::config::SchedulerConfig;
use crate::db::{Db, HistoryEntry};
use crate::error::ControlError;
use crate::evaluator::{ConditionEvaluator, Decision};
use crate::runner::{Registry, ZoneRunner};
use crate::state::{SharedState, StatusResponse};
use crate::valve::ValveActuator;
use crate::zone::{parse_time_of_day, parse_weekday, weekday_label, ZoneConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum StartOutcome {
    Started { minutes: u32 },
    AlreadyRunning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum StopOutcome {
    Stopped,
    NotRunning,
}

#[derive(Debug, Default, PartialEq)]
pub struct TickSummary {
    pub due: usize,
    /// Zones started this tick with their (possibly shortened) minutes.
    pub started: Vec<(String, u32)>,
    pub skipped: Vec<String>,
}

/// Partial update of a zone's schedule fields.
#[derive(Debug, Default, Deserialize)]
pub struct ZonePatch {
    pub schedule: Option<String>,
    pub days: Option<Vec<String>>,
    #[serde(alias = "duration")]
    pub duration_min: Option<u32>,
    pub enabled: Option<bool>,
}

#[derive(Debug, Serialize)]
pub struct HistoryPoint {
    pub label: &'static str,
    pub day: String,
    pub water_used_l: f64,
    pub rainfall_mm: f64,
}

pub struct IrrigationScheduler {
    evaluator: ConditionEvaluator,
    runner: ZoneRunner,
    registry: Registry,
    /// Set by `shutdown`; no run starts afterwards.
    closed: AtomicBool,
    shared: SharedState,
    history: Db,
    clock: Clock,
    tolerance: Duration,
    flow_lpm: f64,
}

impl IrrigationScheduler {
    pub fn new(
        evaluator: ConditionEvaluator,
        valves: Arc<dyn ValveActuator>,
        history: Db,
        shared: SharedState,
        clock: Clock,
        cfg: &SchedulerConfig,
    ) -> Self {
        let registry = Registry::default();
        let runner = ZoneRunner::new(
            valves,
            history.clone(),
            shared.clone(),
            registry.clone(),
            clock,
            cfg.flow_lpm,
        );
        Self {
            evaluator,
            runner,
            registry,
            closed: AtomicBool::new(false),
            shared,
            history,
            clock,
            tolerance: Duration::seconds(cfg.tolerance_sec),
            flow_lpm: cfg.flow_lpm,
        }
    }

    #[cfg(test)]
    fn with_minute(mut self, minute: StdDuration) -> Self {
        self.runner = self.runner.with_minute(minute);
        self
    }

    // -----------------------------------------------------------------------
    // Zone control
    // -----------------------------------------------------------------------

    /// Start a run. `test_mode` forces a one-minute run; otherwise a missing
    /// or zero override falls back to the zone's configured duration.
    pub async fn start_zone(
        &self,
        name: &str,
        duration_override: Option<u32>,
        test_mode: bool,
    ) -> Result<StartOutcome, ControlError> {
        let mut registry = self.registry.lock().await;
        if self.closed.load(Ordering::SeqCst) {
            debug!(zone = name, "start refused, shutting down");
            return Err(ControlError::ShuttingDown);
        }
        let mut st = self.shared.write().await;

        let zone = st
            .zones
            .get(name)
            .ok_or_else(|| ControlError::ZoneNotFound(name.to_string()))?;
        if registry.contains_key(name) {
            debug!(zone = name, "start ignored, already running");
            return Ok(StartOutcome::AlreadyRunning);
        }

        let minutes = if test_mode {
            1
        } else {
            duration_override
                .filter(|m| *m > 0)
                .unwrap_or(zone.config.duration_min)
                .max(1)
        };
        let actuator = zone.config.actuator.clone();

        st.begin_run(name, minutes);
        drop(st);

        let run = self.runner.spawn(name, &actuator, minutes);
        registry.insert(name.to_string(), run);
        info!(zone = name, minutes, test_mode, "zone started");
        Ok(StartOutcome::Started { minutes })
    }

    /// Cancel a run and wait until its valve is closed.
    pub async fn stop_zone(&self, name: &str) -> StopOutcome {
        let handles = {
            let registry = self.registry.lock().await;
            registry
                .get(name)
                .map(|run| (run.cancel.clone(), run.done.clone()))
        };
        let Some((cancel, mut done)) = handles else {
            return StopOutcome::NotRunning;
        };

        cancel.cancel();
        while done.changed().await.is_ok() {}
        info!(zone = name, "zone stopped");
        StopOutcome::Stopped
    }

    /// Refuse further starts, stop every active run, then close all valves.
    pub async fn shutdown(&self) {
        let active: Vec<String> = {
            let registry = self.registry.lock().await;
            self.closed.store(true, Ordering::SeqCst);
            registry.keys().cloned().collect()
        };
        for name in &active {
            self.stop_zone(name).await;
        }
        self.runner.valves().all_off().await;
        self.shared
            .write()
            .await
            .record_system(format!("shutdown, {} run(s) stopped", active.len()));
        info!(stopped = active.len(), "scheduler shut down");
    }

    pub async fn update_zone(&self, name: &str, patch: ZonePatch) -> Result<ZoneConfig, ControlError> {
        let mut st = self.shared.write().await;
        let zone = st
            .zones
            .get_mut(name)
            .ok_or_else(|| ControlError::ZoneNotFound(name.to_string()))?;

        let mut cfg = zone.config.clone();
        if let Some(s) = &patch.schedule {
            cfg.schedule = parse_time_of_day(s)
                .ok_or_else(|| ControlError::InvalidUpdate(format!("bad schedule '{s}'")))?;
        }
        if let Some(days) = &patch.days {
            cfg.days = days
                .iter()
                .map(|d| {
                    parse_weekday(d)
                        .ok_or_else(|| ControlError::InvalidUpdate(format!("unknown day '{d}'")))
                })
                .collect::<Result<_, _>>()?;
        }
        if let Some(minutes) = patch.duration_min {
            if minutes == 0 {
                return Err(ControlError::InvalidUpdate(
                    "duration_min must be positive".to_string(),
                ));
            }
            cfg.duration_min = minutes;
        }
        if let Some(enabled) = patch.enabled {
            cfg.enabled = enabled;
        }

        zone.config = cfg.clone();
        st.record_system(format!("{name} schedule updated"));
        info!(zone = name, ?cfg, "zone updated");
        Ok(cfg)
    }

    // -----------------------------------------------------------------------
    // Scheduling
    // -----------------------------------------------------------------------

    /// Evaluate the weather now and remember the result.
    pub async fn check_weather(&self) -> Decision {
        let decision = self.evaluator.evaluate().await;
        self.shared.write().await.record_decision(&decision);
        decision
    }

    pub async fn tick(&self, now: OffsetDateTime) -> TickSummary {
        let today = now.date();
        let due: Vec<(String, u32)> = {
            let registry = self.registry.lock().await;
            let st = self.shared.read().await;
            st.zones
                .values()
                .filter(|z| {
                    z.config.is_due(now, self.tolerance)
                        && z.last_triggered != Some(today)
                        && !registry.contains_key(&z.config.name)
                })
                .map(|z| (z.config.name.clone(), z.config.duration_min))
                .collect()
        };

        let mut summary = TickSummary {
            due: due.len(),
            ..TickSummary::default()
        };
        if due.is_empty() {
            return summary;
        }

        let decision = self.evaluator.evaluate().await;
        {
            let mut st = self.shared.write().await;
            st.record_decision(&decision);
            if decision.skip {
                st.stats.weather_skip_count += 1;
            }
            for (name, _) in &due {
                if let Some(z) = st.zones.get_mut(name) {
                    z.last_triggered = Some(today);
                }
            }
            if decision.skip {
                for (name, minutes) in &due {
                    st.record_skip(name, f64::from(*minutes) * self.flow_lpm, &decision.reason);
                    summary.skipped.push(name.clone());
                }
            }
        }
        if decision.skip {
            info!(zones = ?summary.skipped, reason = %decision.reason, "scheduled runs skipped");
            return summary;
        }

        for (name, minutes) in due {
            let scaled = (f64::from(minutes) * decision.reduce_factor).round().max(1.0) as u32;
            match self.start_zone(&name, Some(scaled), false).await {
                Ok(StartOutcome::Started { minutes }) => summary.started.push((name, minutes)),
                Ok(StartOutcome::AlreadyRunning) => {
                    debug!(zone = %name, "scheduled start raced a manual run")
                }
                Err(ControlError::ShuttingDown) => {
                    debug!(zone = %name, "scheduled start dropped, shutting down")
                }
                Err(e) => warn!(zone = %name, error = %e, "scheduled start failed"),
            }
        }
        summary
    }

    /// Drive `tick` until `cancel` fires. A panicking tick is logged and the
    /// loop carries on.
    pub async fn run(self: Arc<Self>, every: StdDuration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let zones = self.shared.read().await.zones.len();
        info!(
            zones,
            tick_sec = every.as_secs(),
            tolerance_sec = self.tolerance.whole_seconds(),
            provider = self.evaluator.provider_name(),
            "scheduler started"
        );
        self.shared.write().await.record_scheduler("scheduler started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let now = self.clock.now();
            let this = Arc::clone(&self);
            match tokio::spawn(async move { this.tick(now).await }).await {
                Ok(summary) if summary.due > 0 => info!(
                    due = summary.due,
                    started = summary.started.len(),
                    skipped = summary.skipped.len(),
                    "scheduler tick"
                ),
                Ok(_) => {}
                Err(e) => {
                    error!(error = %e, "scheduler tick failed");
                    self.shared
                        .write()
                        .await
                        .record_error(format!("scheduler tick failed: {e}"));
                }
            }
        }
        info!("scheduler loop exited");
    }

    // -----------------------------------------------------------------------
    // Read side
    // -----------------------------------------------------------------------

    pub async fn status(&self) -> StatusResponse {
        self.shared.read().await.to_status()
    }

    /// The last `days` days of history, oldest first, labelled by weekday.
    pub async fn history(&self, days: u32) -> anyhow::Result<Vec<HistoryPoint>> {
        let rows = self.history.last_n_days(self.clock.today(), days).await?;
        Ok(rows
            .into_iter()
            .map(|d| HistoryPoint {
                label: weekday_label(d.date.weekday()),
                day: d.day,
                water_used_l: d.water_used_l,
                rainfall_mm: d.rainfall_mm,
            })
            .collect())
    }

    pub async fn export_history(&self) -> anyhow::Result<BTreeMap<String, HistoryEntry>> {
        self.history.export().await
    }
}

// ===========================================================================
// Tests
// ===========================================================================
