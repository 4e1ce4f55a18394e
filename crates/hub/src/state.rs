use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use time::{Date, OffsetDateTime};
use tokio::sync::RwLock;

use crate::clock::Clock;
use crate::evaluator::Decision;
use crate::zone::ZoneConfig;

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

pub type SharedState = Arc<RwLock<SystemState>>;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

pub struct SystemState {
    pub started_at: Instant,
    pub clock: Clock,
    pub weather_provider: &'static str,
    pub mqtt_connected: bool,
    pub zones: BTreeMap<String, Zone>,
    pub stats: Stats,
    pub events: VecDeque<SystemEvent>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ZoneStatus {
    Idle,
    Running,
    Completed,
    Stopped,
    Failed,
}

impl ZoneStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Stopped | Self::Failed)
    }
}

/// A zone's configuration plus everything that changes while the hub runs.
#[derive(Debug, Clone)]
pub struct Zone {
    pub config: ZoneConfig,
    pub status: ZoneStatus,
    pub last_run_at: Option<OffsetDateTime>,
    pub total_water_used_l: f64,
    /// Calendar day of the last scheduler trigger, run or skipped.
    pub last_triggered: Option<Date>,
}

impl Zone {
    pub fn new(config: ZoneConfig) -> Self {
        Self {
            config,
            status: ZoneStatus::Idle,
            last_run_at: None,
            total_water_used_l: 0.0,
            last_triggered: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Stats {
    /// Runs that reached natural completion.
    pub total_runs: u64,
    pub total_water_saved_l: f64,
    pub weather_skip_count: u64,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_weather_check: Option<OffsetDateTime>,
    pub last_decision: Option<Decision>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Weather,
    Valve,
    Run,
    Scheduler,
    Error,
    System,
}

// ---------------------------------------------------------------------------
// JSON response (what the API returns)
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct StatusResponse {
    pub uptime_secs: u64,
    pub weather_provider: &'static str,
    pub mqtt_connected: bool,
    pub zones: Vec<ZoneView>,
    pub stats: Stats,
    pub events: Vec<SystemEvent>,
}

#[derive(Serialize)]
pub struct ZoneView {
    #[serde(flatten)]
    pub config: ZoneConfig,
    pub status: ZoneStatus,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_run_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub next_scheduled_at: Option<OffsetDateTime>,
    pub total_water_used_l: f64,
}

// ---------------------------------------------------------------------------
// Construction & mutation
// ---------------------------------------------------------------------------

impl SystemState {
    pub fn new(zones: Vec<ZoneConfig>, weather_provider: &'static str, clock: Clock) -> Self {
        let zones = zones
            .into_iter()
            .map(|cfg| (cfg.name.clone(), Zone::new(cfg)))
            .collect();

        Self {
            started_at: Instant::now(),
            clock,
            weather_provider,
            mqtt_connected: false,
            zones,
            stats: Stats::default(),
            events: VecDeque::with_capacity(MAX_EVENTS),
        }
    }

    pub fn shared(self) -> SharedState {
        Arc::new(RwLock::new(self))
    }

    /// Move a zone into `running`. Returns `false` for unknown zones.
    pub fn begin_run(&mut self, name: &str, minutes: u32) -> bool {
        let now = self.clock.now();
        let Some(zone) = self.zones.get_mut(name) else {
            return false;
        };
        zone.status = ZoneStatus::Running;
        zone.last_run_at = Some(now);
        self.push_event(EventKind::Run, format!("{name} started for {minutes} min"));
        true
    }

    /// Settle a run in a terminal status, crediting `water_l` to the zone.
    pub fn finish_run(&mut self, name: &str, status: ZoneStatus, water_l: f64) {
        debug_assert!(status.is_terminal());
        let Some(zone) = self.zones.get_mut(name) else {
            return;
        };
        zone.status = status;
        zone.total_water_used_l += water_l.max(0.0);
        if status == ZoneStatus::Completed {
            self.stats.total_runs += 1;
        }

        let detail = match status {
            ZoneStatus::Completed => format!("{name} completed, {water_l:.1} L used"),
            ZoneStatus::Stopped => format!("{name} stopped"),
            _ => format!("{name} failed"),
        };
        let kind = if status == ZoneStatus::Failed {
            EventKind::Error
        } else {
            EventKind::Run
        };
        self.push_event(kind, detail);
    }

    pub fn record_decision(&mut self, decision: &Decision) {
        self.stats.last_weather_check = Some(self.clock.now());
        self.stats.last_decision = Some(decision.clone());
        self.push_event(EventKind::Weather, decision.reason.clone());
    }

    /// Record a scheduled run skipped for weather, crediting the water saved.
    pub fn record_skip(&mut self, name: &str, saved_l: f64, reason: &str) {
        self.stats.total_water_saved_l += saved_l;
        self.push_event(
            EventKind::Scheduler,
            format!("{name} skipped ({reason}), {saved_l:.1} L saved"),
        );
    }

    pub fn record_valve(&mut self, actuator: &str, on: bool) {
        let state_str = if on { "ON" } else { "OFF" };
        self.push_event(EventKind::Valve, format!("{actuator} set {state_str}"));
    }

    pub fn record_scheduler(&mut self, detail: impl Into<String>) {
        self.push_event(EventKind::Scheduler, detail.into());
    }

    pub fn record_error(&mut self, detail: impl Into<String>) {
        self.push_event(EventKind::Error, detail.into());
    }

    pub fn record_system(&mut self, detail: impl Into<String>) {
        self.push_event(EventKind::System, detail.into());
    }

    /// Build the JSON-serialisable status snapshot.
    pub fn to_status(&self) -> StatusResponse {
        let now = self.clock.now();
        StatusResponse {
            uptime_secs: self.started_at.elapsed().as_secs(),
            weather_provider: self.weather_provider,
            mqtt_connected: self.mqtt_connected,
            zones: self
                .zones
                .values()
                .map(|z| ZoneView {
                    config: z.config.clone(),
                    status: z.status,
                    last_run_at: z.last_run_at,
                    next_scheduled_at: z.config.next_scheduled_at(now),
                    total_water_used_l: z.total_water_used_l,
                })
                .collect(),
            stats: self.stats.clone(),
            events: self.events.iter().rev().cloned().collect(),
        }
    }

    fn push_event(&mut self, kind: EventKind, detail: String) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(SystemEvent {
            ts: self.clock.now(),
            kind,
            detail,
        });
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::zone;

    fn state() -> SystemState {
        SystemState::new(vec![zone("front"), zone("back")], "none", Clock::utc())
    }

    // -- run lifecycle ------------------------------------------------------

    #[test]
    fn begin_run_marks_running() {
        let mut st = state();
        assert!(st.begin_run("front", 10));
        let z = &st.zones["front"];
        assert_eq!(z.status, ZoneStatus::Running);
        assert!(z.last_run_at.is_some());
    }

    #[test]
    fn begin_run_unknown_zone() {
        let mut st = state();
        assert!(!st.begin_run("nope", 10));
        assert!(st.events.is_empty());
    }

    #[test]
    fn completed_run_credits_water_and_counts() {
        let mut st = state();
        st.begin_run("front", 10);
        st.finish_run("front", ZoneStatus::Completed, 150.0);
        assert_eq!(st.zones["front"].status, ZoneStatus::Completed);
        assert_eq!(st.zones["front"].total_water_used_l, 150.0);
        assert_eq!(st.stats.total_runs, 1);
    }

    #[test]
    fn stopped_run_gets_no_credit() {
        let mut st = state();
        st.begin_run("front", 10);
        st.finish_run("front", ZoneStatus::Stopped, 0.0);
        assert_eq!(st.zones["front"].status, ZoneStatus::Stopped);
        assert_eq!(st.zones["front"].total_water_used_l, 0.0);
        assert_eq!(st.stats.total_runs, 0);
    }

    #[test]
    fn failed_run_logs_error_event() {
        let mut st = state();
        st.begin_run("back", 5);
        st.finish_run("back", ZoneStatus::Failed, 0.0);
        assert_eq!(st.events.back().unwrap().kind, EventKind::Error);
    }

    // -- skips --------------------------------------------------------------

    #[test]
    fn skip_accumulates_saved_water() {
        let mut st = state();
        st.record_skip("front", 150.0, "forecast rain exceeds threshold");
        st.record_skip("back", 75.0, "forecast rain exceeds threshold");
        assert_eq!(st.stats.total_water_saved_l, 225.0);
    }

    // -- event ring buffer --------------------------------------------------

    #[test]
    fn events_are_capped() {
        let mut st = state();
        for i in 0..(MAX_EVENTS + 25) {
            st.record_system(format!("event {i}"));
        }
        assert_eq!(st.events.len(), MAX_EVENTS);
        assert_eq!(st.events.front().unwrap().detail, "event 25");
    }

    // -- status snapshot ----------------------------------------------------

    #[test]
    fn status_lists_zones_by_name_and_events_newest_first() {
        let mut st = state();
        st.record_system("first");
        st.record_system("second");
        let status = st.to_status();
        let names: Vec<_> = status.zones.iter().map(|z| z.config.name.as_str()).collect();
        assert_eq!(names, ["back", "front"]);
        assert_eq!(status.events[0].detail, "second");
        assert_eq!(status.weather_provider, "none");
    }

    #[test]
    fn status_serializes_lowercase_zone_status() {
        let st = state();
        let json = serde_json::to_value(st.to_status()).unwrap();
        assert_eq!(json["zones"][0]["status"], "idle");
        assert_eq!(json["zones"][0]["name"], "back");
        assert!(json["zones"][0]["last_run_at"].is_null());
    }
}
