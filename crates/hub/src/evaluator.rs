//! Weather decision for one scheduling cycle: skip, shorten or proceed.
//!
//! Checks run in a fixed order and the first skip wins:
//!
//! 1. forecast probability at or above `skip_percentage`
//! 2. forecast rainfall at or above the forecast threshold
//! 3. recent rainfall at or above the recent threshold, which either skips or,
//!    with compensation on, shortens the run
//!
//! A failing weather query counts as zero rain and the run goes ahead.

use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use crate::clock::Clock;
use crate::config::{RainForecastConfig, RecentRainConfig};
use crate::db::Db;
use crate::weather::{WeatherGateway, WeatherSample};

pub const REASON_PROBABILITY: &str = "forecast probability exceeds threshold";
pub const REASON_FORECAST: &str = "forecast rain exceeds threshold";
pub const REASON_RECENT: &str = "recent rain exceeds threshold";
pub const REASON_OK: &str = "conditions ok";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Decision {
    pub skip: bool,
    /// Fraction of the configured duration to run, in (0, 1].
    pub reduce_factor: f64,
    pub reason: String,
    pub forecast_rain_mm: f64,
    pub recent_rain_mm: f64,
    pub rain_chance_percent: Option<f64>,
    /// Weather queries that failed and were treated as dry.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

impl Decision {
    fn skip(&mut self, reason: &str) {
        self.skip = true;
        self.reason = reason.to_string();
    }
}

pub struct ConditionEvaluator {
    weather: Arc<dyn WeatherGateway>,
    history: Db,
    clock: Clock,
    forecast: RainForecastConfig,
    recent: RecentRainConfig,
}

impl ConditionEvaluator {
    pub fn new(
        weather: Arc<dyn WeatherGateway>,
        history: Db,
        clock: Clock,
        forecast: RainForecastConfig,
        recent: RecentRainConfig,
    ) -> Self {
        Self {
            weather,
            history,
            clock,
            forecast,
            recent,
        }
    }

    pub fn provider_name(&self) -> &'static str {
        self.weather.provider_name()
    }

    pub async fn evaluate(&self) -> Decision {
        let mut decision = Decision {
            skip: false,
            reduce_factor: 1.0,
            reason: REASON_OK.to_string(),
            forecast_rain_mm: 0.0,
            recent_rain_mm: 0.0,
            rain_chance_percent: None,
            errors: Vec::new(),
        };

        if self.forecast.enabled {
            let sample = self.weather.forecast(self.forecast.hours_ahead).await;
            note_error(&mut decision, "forecast", &sample);
            decision.forecast_rain_mm = sample.rain_mm;
            decision.rain_chance_percent = sample.rain_chance;

            if sample
                .rain_chance
                .is_some_and(|p| p >= self.forecast.skip_percentage)
            {
                decision.skip(REASON_PROBABILITY);
                return self.done(decision);
            }
            if sample.rain_mm >= self.forecast.threshold_mm {
                decision.skip(REASON_FORECAST);
                return self.done(decision);
            }
        }

        if self.recent.enabled {
            let sample = self.weather.recent(self.recent.hours_back).await;
            note_error(&mut decision, "recent", &sample);
            decision.recent_rain_mm = sample.rain_mm;

            if sample.is_success() {
                let today = self.clock.today();
                if let Err(e) = self.history.set_rainfall(today, sample.rain_mm).await {
                    warn!(error = %e, "failed to record rainfall");
                }
            }

            if sample.rain_mm >= self.recent.threshold_mm {
                self.apply_recent_rain(&mut decision);
            }
        }

        self.done(decision)
    }

    fn apply_recent_rain(&self, decision: &mut Decision) {
        if !self.recent.compensation_enabled {
            decision.skip(REASON_RECENT);
            return;
        }

        let reduction = if self.recent.threshold_mm > 0.0 {
            self.recent
                .compensation_ratio
                .min(decision.recent_rain_mm / (2.0 * self.recent.threshold_mm))
        } else {
            self.recent.compensation_ratio
        };
        let factor = 1.0 - reduction;
        if factor <= 0.0 {
            decision.skip(REASON_RECENT);
            return;
        }
        decision.reduce_factor = factor;
        decision.reason = format!("recent rain, duration reduced by {:.0}%", reduction * 100.0);
    }

    fn done(&self, decision: Decision) -> Decision {
        info!(
            skip = decision.skip,
            reduce_factor = decision.reduce_factor,
            forecast_mm = decision.forecast_rain_mm,
            recent_mm = decision.recent_rain_mm,
            chance = ?decision.rain_chance_percent,
            reason = %decision.reason,
            "weather decision"
        );
        decision
    }
}

fn note_error(decision: &mut Decision, query: &str, sample: &WeatherSample) {
    if let Some(detail) = &sample.error {
        decision.errors.push(format!("{query}: {detail}"));
    }
}

// ===========================================================================
// Tests
// ===========================================================================
