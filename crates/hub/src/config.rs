//! TOML config file loading and validation: weather provider, decision
//! thresholds, scheduler timing, valve transport and zones.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;

use crate::mqtt::PayloadStyle;
use crate::valve::parse_pin;
use crate::zone::{parse_time_of_day, parse_weekday, ZoneConfig};

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub weather: WeatherConfig,
    pub rain_forecast: RainForecastConfig,
    pub recent_rain: RecentRainConfig,
    pub scheduler: SchedulerConfig,
    pub valves: ValvesConfig,
    pub zones: Vec<ZoneEntry>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    OpenWeatherMap,
    WeatherApi,
    VisualCrossing,
    #[default]
    None,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct WeatherConfig {
    pub provider: Provider,
    pub api_key: String,
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RainForecastConfig {
    pub enabled: bool,
    pub threshold_mm: f64,
    pub hours_ahead: i64,
    /// Peak precipitation probability (percent) that skips outright.
    pub skip_percentage: f64,
}

impl Default for RainForecastConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold_mm: 5.0,
            hours_ahead: 24,
            skip_percentage: 70.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RecentRainConfig {
    pub enabled: bool,
    pub threshold_mm: f64,
    pub hours_back: i64,
    pub compensation_enabled: bool,
    /// Largest fraction of a run that recent rain may cut.
    pub compensation_ratio: f64,
}

impl Default for RecentRainConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold_mm: 10.0,
            hours_back: 48,
            compensation_enabled: false,
            compensation_ratio: 0.5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub tick_sec: u64,
    pub tolerance_sec: i64,
    /// Assumed flow for water accounting, litres per minute.
    pub flow_lpm: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_sec: 60,
            tolerance_sec: 60,
            flow_lpm: 15.0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValveKind {
    /// Relay board: GPIO with the `gpio` feature, in-memory mock without.
    #[default]
    Board,
    Mqtt,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ValvesConfig {
    pub kind: ValveKind,
    pub topic_prefix: String,
    pub payload: PayloadStyle,
}

impl Default for ValvesConfig {
    fn default() -> Self {
        Self {
            kind: ValveKind::Board,
            topic_prefix: "valve".to_string(),
            payload: PayloadStyle::Plain,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ZoneEntry {
    pub name: String,
    #[serde(alias = "entity_id")]
    pub actuator: String,
    /// "HH:MM", 24h.
    pub schedule: String,
    #[serde(default)]
    pub days: Vec<String>,
    #[serde(alias = "duration")]
    pub duration_min: u32,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_zone_type")]
    pub zone_type: String,
    #[serde(default)]
    pub moisture_sensor: Option<String>,
    #[serde(default)]
    pub flow_sensor: Option<String>,
    #[serde(default)]
    pub moisture_threshold: Option<f64>,
}

fn default_true() -> bool {
    true
}

fn default_zone_type() -> String {
    "lawn".to_string()
}

impl ZoneEntry {
    pub fn to_zone_config(&self) -> Result<ZoneConfig> {
        let schedule = parse_time_of_day(&self.schedule)
            .with_context(|| format!("zone '{}': bad schedule '{}'", self.name, self.schedule))?;
        let days = self
            .days
            .iter()
            .map(|d| {
                parse_weekday(d).with_context(|| format!("zone '{}': bad day '{d}'", self.name))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(ZoneConfig {
            name: self.name.clone(),
            actuator: self.actuator.clone(),
            schedule,
            days,
            duration_min: self.duration_min,
            enabled: self.enabled,
            zone_type: self.zone_type.clone(),
            moisture_sensor: self.moisture_sensor.clone(),
            flow_sensor: self.flow_sensor.clone(),
            moisture_threshold: self.moisture_threshold,
        })
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all config entries. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_weather(&mut errors);
        self.validate_thresholds(&mut errors);
        self.validate_zones(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_weather(&self, errors: &mut Vec<String>) {
        let w = &self.weather;
        if w.provider != Provider::None && w.api_key.trim().is_empty() {
            errors.push(format!("weather: api_key is required for {:?}", w.provider));
        }
        if !(-90.0..=90.0).contains(&w.latitude) {
            errors.push(format!("weather: latitude {} out of range", w.latitude));
        }
        if !(-180.0..=180.0).contains(&w.longitude) {
            errors.push(format!("weather: longitude {} out of range", w.longitude));
        }
    }

    fn validate_thresholds(&self, errors: &mut Vec<String>) {
        let f = &self.rain_forecast;
        if !(f.threshold_mm >= 0.0) {
            errors.push(format!("rain_forecast: threshold_mm must be >= 0, got {}", f.threshold_mm));
        }
        if !(0.0..=100.0).contains(&f.skip_percentage) {
            errors.push(format!(
                "rain_forecast: skip_percentage {} out of range [0, 100]",
                f.skip_percentage
            ));
        }

        let r = &self.recent_rain;
        if !(r.threshold_mm >= 0.0) {
            errors.push(format!("recent_rain: threshold_mm must be >= 0, got {}", r.threshold_mm));
        }
        if !(0.0..=1.0).contains(&r.compensation_ratio) {
            errors.push(format!(
                "recent_rain: compensation_ratio {} out of range [0, 1]",
                r.compensation_ratio
            ));
        }

        let s = &self.scheduler;
        if s.tick_sec == 0 {
            errors.push("scheduler: tick_sec must be positive".to_string());
        }
        if s.tolerance_sec < 0 {
            errors.push(format!("scheduler: tolerance_sec must be >= 0, got {}", s.tolerance_sec));
        }
        if !(s.flow_lpm > 0.0) || !s.flow_lpm.is_finite() {
            errors.push(format!("scheduler: flow_lpm must be positive, got {}", s.flow_lpm));
        }

        if self.valves.kind == ValveKind::Mqtt && self.valves.topic_prefix.trim().is_empty() {
            errors.push("valves: topic_prefix is empty".to_string());
        }
    }

    fn validate_zones(&self, errors: &mut Vec<String>) {
        let check_pins = cfg!(feature = "gpio") && self.valves.kind == ValveKind::Board;
        let mut seen_names: HashSet<&str> = HashSet::new();
        let mut seen_pins: HashSet<u8> = HashSet::new();

        for (i, z) in self.zones.iter().enumerate() {
            let ctx = || {
                if z.name.is_empty() {
                    format!("zones[{i}]")
                } else {
                    format!("zone '{}'", z.name)
                }
            };

            // ── Identity ────────────────────────────────────────
            if z.name.trim().is_empty() {
                errors.push(format!("{}: name is empty", ctx()));
            } else if !seen_names.insert(&z.name) {
                errors.push(format!("{}: duplicate name", ctx()));
            }
            if z.actuator.trim().is_empty() {
                errors.push(format!("{}: actuator is empty", ctx()));
            }

            // ── Schedule ────────────────────────────────────────
            if parse_time_of_day(&z.schedule).is_none() {
                errors.push(format!(
                    "{}: schedule '{}' is not a valid HH:MM time",
                    ctx(),
                    z.schedule
                ));
            }
            for d in &z.days {
                if parse_weekday(d).is_none() {
                    errors.push(format!("{}: unknown day '{d}'", ctx()));
                }
            }
            if z.duration_min == 0 {
                errors.push(format!("{}: duration_min must be positive", ctx()));
            }
            if let Some(t) = z.moisture_threshold {
                if !(0.0..=100.0).contains(&t) {
                    errors.push(format!(
                        "{}: moisture_threshold {t} out of range [0, 100]",
                        ctx()
                    ));
                }
            }

            // ── GPIO pin whitelist ──────────────────────────────
            if check_pins {
                match parse_pin(&z.actuator) {
                    None => errors.push(format!(
                        "{}: actuator '{}' is not a valid BCM GPIO pin (allowed: 2-27)",
                        ctx(),
                        z.actuator
                    )),
                    Some(pin) if !seen_pins.insert(pin) => errors.push(format!(
                        "{}: GPIO pin {pin} is already used by another zone",
                        ctx()
                    )),
                    Some(_) => {}
                }
            }
        }
    }

    /// Parsed zone configurations, in file order.
    pub fn zone_configs(&self) -> Result<Vec<ZoneConfig>> {
        self.zones.iter().map(ZoneEntry::to_zone_config).collect()
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file.
pub fn load(path: &str) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    parse(&contents).with_context(|| format!("invalid config: {path}"))
}

pub fn parse(contents: &str) -> Result<Config> {
    let config: Config = toml::from_str(contents).context("failed to parse config")?;
    config.validate()?;
    Ok(config)
}

// ===========================================================================
// Tests
// ===========================================================================
