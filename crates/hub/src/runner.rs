//! Executes one zone's watering cycle as a cancellable task.
//!
//! ```text
//! idle ──start──▶ running ──timer──▶ completed
//!                   │ └───cancel───▶ stopped
//!                   └──valve ON fails──▶ failed
//! ```
//!
//! After a successful valve ON the valve is switched OFF exactly once,
//! whatever the outcome, before the run leaves the active-run registry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::clock::Clock;
use crate::db::Db;
use crate::state::{SharedState, ZoneStatus};
use crate::valve::ValveActuator;

/// Zones currently mid-run, keyed by zone name.
pub type Registry = Arc<Mutex<HashMap<String, ActiveRun>>>;

pub struct ActiveRun {
    pub id: u64,
    pub cancel: CancellationToken,
    /// Closed once the run has fully torn down.
    pub done: watch::Receiver<()>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RunOutcome {
    Completed { water_l: f64 },
    Stopped,
    Failed,
}

impl RunOutcome {
    fn status(self) -> ZoneStatus {
        match self {
            Self::Completed { .. } => ZoneStatus::Completed,
            Self::Stopped => ZoneStatus::Stopped,
            Self::Failed => ZoneStatus::Failed,
        }
    }

    fn water_l(self) -> f64 {
        match self {
            Self::Completed { water_l } => water_l,
            _ => 0.0,
        }
    }
}

#[derive(Clone)]
pub struct ZoneRunner {
    valves: Arc<dyn ValveActuator>,
    history: Db,
    shared: SharedState,
    registry: Registry,
    clock: Clock,
    flow_lpm: f64,
    minute: Duration,
    next_id: Arc<AtomicU64>,
}

impl ZoneRunner {
    pub fn new(
        valves: Arc<dyn ValveActuator>,
        history: Db,
        shared: SharedState,
        registry: Registry,
        clock: Clock,
        flow_lpm: f64,
    ) -> Self {
        Self {
            valves,
            history,
            shared,
            registry,
            clock,
            flow_lpm,
            minute: Duration::from_secs(60),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Shorten the length of a run minute.
    #[cfg(test)]
    pub fn with_minute(mut self, minute: Duration) -> Self {
        self.minute = minute;
        self
    }

    pub fn valves(&self) -> &Arc<dyn ValveActuator> {
        &self.valves
    }

    /// Spawn a run. The caller must hold the registry lock and insert the
    /// returned handle before releasing it.
    pub fn spawn(&self, zone: &str, actuator: &str, minutes: u32) -> ActiveRun {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let (done_tx, done_rx) = watch::channel(());

        let runner = self.clone();
        let zone = zone.to_string();
        let actuator = actuator.to_string();
        let token = cancel.clone();
        tokio::spawn(async move {
            let outcome = runner.execute(&zone, &actuator, minutes, token).await;
            runner.finish(&zone, id, outcome).await;
            drop(done_tx);
        });

        ActiveRun {
            id,
            cancel,
            done: done_rx,
        }
    }

    async fn execute(
        &self,
        zone: &str,
        actuator: &str,
        minutes: u32,
        cancel: CancellationToken,
    ) -> RunOutcome {
        if !self.valves.set(actuator, true).await {
            error!(zone, actuator, "valve ON failed");
            self.shared
                .write()
                .await
                .record_error(format!("{zone}: valve {actuator} did not open"));
            return RunOutcome::Failed;
        }
        self.shared.write().await.record_valve(actuator, true);
        info!(zone, actuator, minutes, "watering");

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => RunOutcome::Stopped,
            _ = tokio::time::sleep(self.minute * minutes) => RunOutcome::Completed {
                water_l: f64::from(minutes) * self.flow_lpm,
            },
        };

        if self.valves.set(actuator, false).await {
            self.shared.write().await.record_valve(actuator, false);
        } else {
            warn!(zone, actuator, "valve OFF failed");
            self.shared
                .write()
                .await
                .record_error(format!("{zone}: valve {actuator} did not close"));
        }

        if let RunOutcome::Completed { water_l } = outcome {
            if let Err(e) = self.history.add_water(self.clock.today(), water_l).await {
                error!(zone, error = %e, "failed to record water usage");
                self.shared
                    .write()
                    .await
                    .record_error(format!("{zone}: history write failed: {e}"));
            }
        }

        outcome
    }

    /// Deregister the run and publish its terminal status.
    async fn finish(&self, zone: &str, id: u64, outcome: RunOutcome) {
        let mut registry = self.registry.lock().await;
        if registry.get(zone).is_some_and(|run| run.id == id) {
            registry.remove(zone);
        }
        let mut st = self.shared.write().await;
        st.finish_run(zone, outcome.status(), outcome.water_l());
        info!(zone, ?outcome, "run finished");
    }
}

// ===========================================================================
// Tests
// ===========================================================================
