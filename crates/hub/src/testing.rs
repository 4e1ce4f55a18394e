//! Test doubles shared by the unit tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use time::macros::time;
use time::Weekday;

use crate::clock::Clock;
use crate::config::{RainForecastConfig, RecentRainConfig, SchedulerConfig};
use crate::db::Db;
use crate::evaluator::ConditionEvaluator;
use crate::scheduler::IrrigationScheduler;
use crate::state::SystemState;
use crate::valve::ValveActuator;
use crate::weather::{WeatherError, WeatherGateway, WeatherSample};
use crate::zone::ZoneConfig;

pub async fn memory_db() -> Db {
    let db = Db::connect("sqlite::memory:").await.unwrap();
    db.migrate().await.unwrap();
    db
}

/// Enabled every day at 05:00 for 10 minutes; the actuator ref is the name.
pub fn zone(name: &str) -> ZoneConfig {
    ZoneConfig {
        name: name.to_string(),
        actuator: name.to_string(),
        schedule: time!(5:00),
        days: vec![
            Weekday::Monday,
            Weekday::Tuesday,
            Weekday::Wednesday,
            Weekday::Thursday,
            Weekday::Friday,
            Weekday::Saturday,
            Weekday::Sunday,
        ],
        duration_min: 10,
        enabled: true,
        zone_type: "lawn".to_string(),
        moisture_sensor: None,
        flow_sensor: None,
        moisture_threshold: None,
    }
}

/// Scheduler over zones "front" and "back" with dry weather and default
/// thresholds.
pub async fn scheduler() -> (Arc<IrrigationScheduler>, Arc<RecordingValves>) {
    let db = memory_db().await;
    let valves = Arc::new(RecordingValves::default());
    let shared = SystemState::new(vec![zone("front"), zone("back")], "stub", Clock::utc()).shared();
    let evaluator = ConditionEvaluator::new(
        Arc::new(StubWeather::dry()),
        db.clone(),
        Clock::utc(),
        RainForecastConfig::default(),
        RecentRainConfig::default(),
    );
    let scheduler = IrrigationScheduler::new(
        evaluator,
        valves.clone(),
        db,
        shared,
        Clock::utc(),
        &SchedulerConfig::default(),
    );
    (Arc::new(scheduler), valves)
}

// ---------------------------------------------------------------------------
// Valves
// ---------------------------------------------------------------------------

/// Records every command; `fail_on` makes ON commands fail.
#[derive(Default)]
pub struct RecordingValves {
    calls: Mutex<Vec<(String, bool)>>,
    fail_on: bool,
}

impl RecordingValves {
    pub fn failing_on() -> Self {
        Self {
            fail_on: true,
            ..Self::default()
        }
    }

    pub fn calls(&self) -> Vec<(String, bool)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, actuator: &str, on: bool) -> usize {
        self.calls()
            .iter()
            .filter(|(a, o)| a == actuator && *o == on)
            .count()
    }
}

#[async_trait]
impl ValveActuator for RecordingValves {
    async fn set(&self, actuator: &str, on: bool) -> bool {
        self.calls.lock().unwrap().push((actuator.to_string(), on));
        !(on && self.fail_on)
    }
}

// ---------------------------------------------------------------------------
// Weather
// ---------------------------------------------------------------------------

pub struct StubWeather {
    forecast: Option<(f64, Option<f64>)>,
    recent: Option<f64>,
    delay: Option<Duration>,
    panic_next: AtomicBool,
    pub forecast_calls: AtomicUsize,
    pub recent_calls: AtomicUsize,
}

impl StubWeather {
    pub fn dry() -> Self {
        Self {
            forecast: Some((0.0, Some(0.0))),
            recent: Some(0.0),
            delay: None,
            panic_next: AtomicBool::new(false),
            forecast_calls: AtomicUsize::new(0),
            recent_calls: AtomicUsize::new(0),
        }
    }

    pub fn with_forecast(mut self, mm: f64, chance: Option<f64>) -> Self {
        self.forecast = Some((mm, chance));
        self
    }

    pub fn with_recent(mut self, mm: f64) -> Self {
        self.recent = Some(mm);
        self
    }

    pub fn failing_forecast(mut self) -> Self {
        self.forecast = None;
        self
    }

    pub fn failing_recent(mut self) -> Self {
        self.recent = None;
        self
    }

    /// Forecast queries sleep for `delay` before answering.
    pub fn slow(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// The first forecast query panics; later ones answer normally.
    pub fn panicking_once(self) -> Self {
        self.panic_next.store(true, Ordering::SeqCst);
        self
    }
}

fn unavailable() -> WeatherError {
    WeatherError::Decode {
        provider: "stub",
        detail: "unavailable".to_string(),
    }
}

#[async_trait]
impl WeatherGateway for StubWeather {
    async fn fetch_forecast(&self, _hours_ahead: u32) -> Result<WeatherSample, WeatherError> {
        self.forecast_calls.fetch_add(1, Ordering::SeqCst);
        if self.panic_next.swap(false, Ordering::SeqCst) {
            panic!("stub weather blew up");
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let (mm, chance) = self.forecast.ok_or_else(unavailable)?;
        Ok(WeatherSample::success(mm, chance))
    }

    async fn fetch_recent(&self, _hours_back: u32) -> Result<WeatherSample, WeatherError> {
        self.recent_calls.fetch_add(1, Ordering::SeqCst);
        let mm = self.recent.ok_or_else(unavailable)?;
        Ok(WeatherSample::success(mm, None))
    }

    fn provider_name(&self) -> &'static str {
        "stub"
    }
}
