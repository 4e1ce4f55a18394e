//! Weather gateways. One implementation per vendor, chosen once at startup
//! from config. Every gateway reduces its vendor response to a normalized
//! [`WeatherSample`]; transport and decode failures are reported through the
//! sample's `outcome` instead of being propagated.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use time::macros::format_description;
use time::{Date, Duration, OffsetDateTime, PrimitiveDateTime};
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::config::{Provider, WeatherConfig};
use crate::db::day_key;

const HTTP_TIMEOUT_SEC: u64 = 20;

// ---------------------------------------------------------------------------
// Normalized sample
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WeatherSample {
    pub rain_mm: f64,
    /// Peak precipitation probability in percent, when the vendor reports it.
    pub rain_chance: Option<f64>,
    pub outcome: Outcome,
    pub error: Option<String>,
}

impl WeatherSample {
    pub fn success(rain_mm: f64, rain_chance: Option<f64>) -> Self {
        Self {
            rain_mm: sanitize_mm(rain_mm),
            rain_chance: rain_chance.map(sanitize_percent),
            outcome: Outcome::Success,
            error: None,
        }
    }

    /// Zero rainfall over an empty window.
    pub fn empty() -> Self {
        Self::success(0.0, None)
    }

    pub fn failed(detail: impl Into<String>) -> Self {
        Self {
            rain_mm: 0.0,
            rain_chance: None,
            outcome: Outcome::Error,
            error: Some(detail.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome == Outcome::Success
    }
}

fn sanitize_mm(v: f64) -> f64 {
    if v.is_finite() {
        v.max(0.0)
    } else {
        0.0
    }
}

fn sanitize_percent(v: f64) -> f64 {
    if v.is_finite() {
        v.clamp(0.0, 100.0)
    } else {
        0.0
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum WeatherError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{provider} returned HTTP {status}: {body}")]
    Status {
        provider: &'static str,
        status: u16,
        body: String,
    },

    #[error("unexpected {provider} response: {detail}")]
    Decode {
        provider: &'static str,
        detail: String,
    },
}

// ---------------------------------------------------------------------------
// Gateway trait
// ---------------------------------------------------------------------------

#[async_trait]
pub trait WeatherGateway: Send + Sync {
    /// Vendor query for the next `hours_ahead` hours (always > 0).
    async fn fetch_forecast(&self, hours_ahead: u32) -> Result<WeatherSample, WeatherError>;

    /// Vendor query for the last `hours_back` hours (always > 0).
    async fn fetch_recent(&self, hours_back: u32) -> Result<WeatherSample, WeatherError>;

    fn provider_name(&self) -> &'static str;

    /// Forecast rainfall. A non-positive window is empty; errors come back as
    /// an error sample.
    async fn forecast(&self, hours_ahead: i64) -> WeatherSample {
        let Some(hours) = window_hours(hours_ahead) else {
            return WeatherSample::empty();
        };
        match self.fetch_forecast(hours).await {
            Ok(sample) => {
                debug!(provider = self.provider_name(), hours, ?sample, "forecast fetched");
                sample
            }
            Err(e) => {
                warn!(provider = self.provider_name(), hours, error = %e, "forecast query failed");
                WeatherSample::failed(e.to_string())
            }
        }
    }

    /// Observed rainfall. Same window and error rules as [`forecast`](Self::forecast).
    async fn recent(&self, hours_back: i64) -> WeatherSample {
        let Some(hours) = window_hours(hours_back) else {
            return WeatherSample::empty();
        };
        match self.fetch_recent(hours).await {
            Ok(sample) => {
                debug!(provider = self.provider_name(), hours, ?sample, "recent rain fetched");
                sample
            }
            Err(e) => {
                warn!(provider = self.provider_name(), hours, error = %e, "recent rain query failed");
                WeatherSample::failed(e.to_string())
            }
        }
    }
}

fn window_hours(hours: i64) -> Option<u32> {
    if hours <= 0 {
        None
    } else {
        Some(u32::try_from(hours).unwrap_or(u32::MAX))
    }
}

/// Build the gateway selected in config.
pub fn build_gateway(cfg: &WeatherConfig, clock: Clock) -> anyhow::Result<Arc<dyn WeatherGateway>> {
    let gateway: Arc<dyn WeatherGateway> = match cfg.provider {
        Provider::None => Arc::new(NoWeather),
        Provider::OpenWeatherMap => Arc::new(OpenWeatherMap::new(cfg, clock)?),
        Provider::WeatherApi => Arc::new(WeatherApi::new(cfg, clock)?),
        Provider::VisualCrossing => Arc::new(VisualCrossing::new(cfg, clock)?),
    };
    Ok(gateway)
}

fn http_client() -> anyhow::Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(StdDuration::from_secs(HTTP_TIMEOUT_SEC))
        .build()?)
}

async fn get_json<T: DeserializeOwned>(
    provider: &'static str,
    request: reqwest::RequestBuilder,
) -> Result<T, WeatherError> {
    let response = request.send().await?;
    let status = response.status();
    let body = response.text().await?;
    if !status.is_success() {
        return Err(WeatherError::Status {
            provider,
            status: status.as_u16(),
            body,
        });
    }
    serde_json::from_str(&body).map_err(|e| WeatherError::Decode {
        provider,
        detail: e.to_string(),
    })
}

// ---------------------------------------------------------------------------
// No provider
// ---------------------------------------------------------------------------

/// Weather checks disabled: every window is dry.
pub struct NoWeather;

#[async_trait]
impl WeatherGateway for NoWeather {
    async fn fetch_forecast(&self, _hours_ahead: u32) -> Result<WeatherSample, WeatherError> {
        Ok(WeatherSample::empty())
    }

    async fn fetch_recent(&self, _hours_back: u32) -> Result<WeatherSample, WeatherError> {
        Ok(WeatherSample::empty())
    }

    fn provider_name(&self) -> &'static str {
        "none"
    }
}

// ---------------------------------------------------------------------------
// OpenWeatherMap
// ---------------------------------------------------------------------------

const OWM: &str = "openweathermap";

pub struct OpenWeatherMap {
    client: reqwest::Client,
    api_key: String,
    lat: f64,
    lon: f64,
    clock: Clock,
}

#[derive(Debug, Deserialize)]
struct OwmForecast {
    list: Vec<OwmSlot>,
}

#[derive(Debug, Deserialize)]
struct OwmSlot {
    dt: i64,
    #[serde(default)]
    rain: Option<OwmRain>,
    /// Probability of precipitation, 0..1.
    #[serde(default)]
    pop: f64,
}

#[derive(Debug, Default, Deserialize)]
struct OwmRain {
    #[serde(rename = "1h", default)]
    one_hour: f64,
    #[serde(rename = "3h", default)]
    three_hours: f64,
}

#[derive(Debug, Deserialize)]
struct OwmTimeMachine {
    #[serde(default)]
    data: Vec<OwmObservation>,
}

#[derive(Debug, Deserialize)]
struct OwmObservation {
    #[serde(default)]
    rain: Option<OwmRain>,
}

#[derive(Debug, Deserialize)]
struct OwmCurrent {
    #[serde(default)]
    rain: Option<OwmRain>,
}

/// Sum 3h rain buckets up to `until` (unix seconds) and take the peak pop.
fn summarize_owm_forecast(resp: &OwmForecast, until: i64) -> WeatherSample {
    let mut total = 0.0;
    let mut chance: f64 = 0.0;
    for slot in resp.list.iter().filter(|s| s.dt <= until) {
        total += slot.rain.as_ref().map_or(0.0, |r| r.three_hours);
        chance = chance.max(slot.pop * 100.0);
    }
    WeatherSample::success(total, Some(chance))
}

impl OpenWeatherMap {
    const FORECAST_URL: &'static str = "https://api.openweathermap.org/data/2.5/forecast";
    const TIMEMACHINE_URL: &'static str =
        "https://api.openweathermap.org/data/3.0/onecall/timemachine";
    const CURRENT_URL: &'static str = "https://api.openweathermap.org/data/2.5/weather";

    pub fn new(cfg: &WeatherConfig, clock: Clock) -> anyhow::Result<Self> {
        Ok(Self {
            client: http_client()?,
            api_key: cfg.api_key.clone(),
            lat: cfg.latitude,
            lon: cfg.longitude,
            clock,
        })
    }

    fn base_query(&self) -> Vec<(&'static str, String)> {
        vec![
            ("lat", self.lat.to_string()),
            ("lon", self.lon.to_string()),
            ("appid", self.api_key.clone()),
            ("units", "metric".to_string()),
        ]
    }

    /// Rain in the last hour from current conditions; used when the one-call
    /// history endpoint is unavailable on the account.
    async fn current_rain(&self) -> Result<WeatherSample, WeatherError> {
        let resp: OwmCurrent = get_json(
            OWM,
            self.client.get(Self::CURRENT_URL).query(&self.base_query()),
        )
        .await?;
        let rain = resp.rain.map_or(0.0, |r| r.one_hour);
        Ok(WeatherSample::success(rain, None))
    }
}

#[async_trait]
impl WeatherGateway for OpenWeatherMap {
    async fn fetch_forecast(&self, hours_ahead: u32) -> Result<WeatherSample, WeatherError> {
        let resp: OwmForecast = get_json(
            OWM,
            self.client.get(Self::FORECAST_URL).query(&self.base_query()),
        )
        .await?;
        let until = self.clock.now().unix_timestamp() + i64::from(hours_ahead) * 3600;
        Ok(summarize_owm_forecast(&resp, until))
    }

    async fn fetch_recent(&self, hours_back: u32) -> Result<WeatherSample, WeatherError> {
        let since = self.clock.now().unix_timestamp() - i64::from(hours_back) * 3600;
        let mut query = self.base_query();
        query.push(("dt", since.to_string()));

        match get_json::<OwmTimeMachine>(
            OWM,
            self.client.get(Self::TIMEMACHINE_URL).query(&query),
        )
        .await
        {
            Ok(resp) => {
                let rain = resp
                    .data
                    .first()
                    .and_then(|o| o.rain.as_ref())
                    .map_or(0.0, |r| r.one_hour);
                Ok(WeatherSample::success(rain, None))
            }
            Err(WeatherError::Status { status, .. }) => {
                debug!(status, "one-call history unavailable, using current conditions");
                self.current_rain().await
            }
            Err(e) => Err(e),
        }
    }

    fn provider_name(&self) -> &'static str {
        OWM
    }
}

// ---------------------------------------------------------------------------
// WeatherAPI.com
// ---------------------------------------------------------------------------

const WEATHERAPI: &str = "weatherapi";

pub struct WeatherApi {
    client: reqwest::Client,
    api_key: String,
    lat: f64,
    lon: f64,
    clock: Clock,
}

#[derive(Debug, Deserialize)]
struct WapiResponse {
    forecast: WapiForecast,
}

#[derive(Debug, Deserialize)]
struct WapiForecast {
    forecastday: Vec<WapiDay>,
}

#[derive(Debug, Deserialize)]
struct WapiDay {
    date: String,
    day: WapiDayTotals,
    #[serde(default)]
    hour: Vec<WapiHour>,
}

#[derive(Debug, Deserialize)]
struct WapiDayTotals {
    #[serde(default)]
    totalprecip_mm: f64,
}

#[derive(Debug, Deserialize)]
struct WapiHour {
    time: String,
    #[serde(default)]
    chance_of_rain: f64,
}

fn summarize_weatherapi_forecast(
    resp: &WapiResponse,
    end: PrimitiveDateTime,
) -> Result<WeatherSample, WeatherError> {
    let decode = |detail: String| WeatherError::Decode {
        provider: WEATHERAPI,
        detail,
    };

    let mut total = 0.0;
    let mut chance: f64 = 0.0;
    for day in &resp.forecast.forecastday {
        let date = Date::parse(&day.date, format_description!("[year]-[month]-[day]"))
            .map_err(|e| decode(format!("bad date '{}': {e}", day.date)))?;
        if date > end.date() {
            continue;
        }
        total += day.day.totalprecip_mm;
        for hour in &day.hour {
            let at = PrimitiveDateTime::parse(
                &hour.time,
                format_description!("[year]-[month]-[day] [hour]:[minute]"),
            )
            .map_err(|e| decode(format!("bad hour '{}': {e}", hour.time)))?;
            if at <= end {
                chance = chance.max(hour.chance_of_rain);
            }
        }
    }
    Ok(WeatherSample::success(total, Some(chance)))
}

impl WeatherApi {
    const FORECAST_URL: &'static str = "https://api.weatherapi.com/v1/forecast.json";
    const HISTORY_URL: &'static str = "https://api.weatherapi.com/v1/history.json";

    pub fn new(cfg: &WeatherConfig, clock: Clock) -> anyhow::Result<Self> {
        Ok(Self {
            client: http_client()?,
            api_key: cfg.api_key.clone(),
            lat: cfg.latitude,
            lon: cfg.longitude,
            clock,
        })
    }

    fn location(&self) -> String {
        format!("{},{}", self.lat, self.lon)
    }
}

#[async_trait]
impl WeatherGateway for WeatherApi {
    async fn fetch_forecast(&self, hours_ahead: u32) -> Result<WeatherSample, WeatherError> {
        // The free tier caps forecasts at three days.
        let days = (hours_ahead / 24 + 1).min(3);
        let resp: WapiResponse = get_json(
            WEATHERAPI,
            self.client.get(Self::FORECAST_URL).query(&[
                ("key", self.api_key.clone()),
                ("q", self.location()),
                ("days", days.to_string()),
            ]),
        )
        .await?;
        let end = local_naive(self.clock.now() + Duration::hours(i64::from(hours_ahead)));
        summarize_weatherapi_forecast(&resp, end)
    }

    async fn fetch_recent(&self, hours_back: u32) -> Result<WeatherSample, WeatherError> {
        let start = (self.clock.now() - Duration::hours(i64::from(hours_back))).date();
        let resp: WapiResponse = get_json(
            WEATHERAPI,
            self.client.get(Self::HISTORY_URL).query(&[
                ("key", self.api_key.clone()),
                ("q", self.location()),
                ("dt", day_key(start)),
            ]),
        )
        .await?;
        let day = resp
            .forecast
            .forecastday
            .first()
            .ok_or_else(|| WeatherError::Decode {
                provider: WEATHERAPI,
                detail: "history response has no days".to_string(),
            })?;
        Ok(WeatherSample::success(day.day.totalprecip_mm, None))
    }

    fn provider_name(&self) -> &'static str {
        WEATHERAPI
    }
}

fn local_naive(at: OffsetDateTime) -> PrimitiveDateTime {
    PrimitiveDateTime::new(at.date(), at.time())
}

// ---------------------------------------------------------------------------
// Visual Crossing
// ---------------------------------------------------------------------------

const VISUALCROSSING: &str = "visualcrossing";

pub struct VisualCrossing {
    client: reqwest::Client,
    api_key: String,
    lat: f64,
    lon: f64,
    clock: Clock,
}

#[derive(Debug, Deserialize)]
struct VcTimeline {
    #[serde(default)]
    days: Vec<VcDay>,
}

#[derive(Debug, Deserialize)]
struct VcDay {
    #[serde(default)]
    precip: Option<f64>,
    #[serde(default)]
    precipprob: Option<f64>,
}

fn summarize_visualcrossing(resp: &VcTimeline) -> WeatherSample {
    let total: f64 = resp.days.iter().filter_map(|d| d.precip).sum();
    let chance = resp
        .days
        .iter()
        .filter_map(|d| d.precipprob)
        .fold(0.0_f64, f64::max);
    WeatherSample::success(total, Some(chance))
}

impl VisualCrossing {
    const TIMELINE_URL: &'static str =
        "https://weather.visualcrossing.com/VisualCrossingWebServices/rest/services/timeline";

    pub fn new(cfg: &WeatherConfig, clock: Clock) -> anyhow::Result<Self> {
        Ok(Self {
            client: http_client()?,
            api_key: cfg.api_key.clone(),
            lat: cfg.latitude,
            lon: cfg.longitude,
            clock,
        })
    }

    fn timeline_url(&self, dates: &[Date]) -> String {
        let mut url = format!("{}/{},{}", Self::TIMELINE_URL, self.lat, self.lon);
        for d in dates {
            url.push('/');
            url.push_str(&day_key(*d));
        }
        url
    }
}

#[async_trait]
impl WeatherGateway for VisualCrossing {
    async fn fetch_forecast(&self, hours_ahead: u32) -> Result<WeatherSample, WeatherError> {
        let now = self.clock.now();
        let end = (now + Duration::hours(i64::from(hours_ahead))).date();
        let resp: VcTimeline = get_json(
            VISUALCROSSING,
            self.client
                .get(self.timeline_url(&[now.date(), end]))
                .query(&[
                    ("key", self.api_key.as_str()),
                    ("unitGroup", "metric"),
                    ("include", "days"),
                ]),
        )
        .await?;
        Ok(summarize_visualcrossing(&resp))
    }

    async fn fetch_recent(&self, hours_back: u32) -> Result<WeatherSample, WeatherError> {
        let start = (self.clock.now() - Duration::hours(i64::from(hours_back))).date();
        let resp: VcTimeline = get_json(
            VISUALCROSSING,
            self.client
                .get(self.timeline_url(&[start]))
                .query(&[("key", self.api_key.as_str()), ("unitGroup", "metric")]),
        )
        .await?;
        let rain = resp.days.first().and_then(|d| d.precip).unwrap_or(0.0);
        Ok(WeatherSample::success(rain, None))
    }

    fn provider_name(&self) -> &'static str {
        VISUALCROSSING
    }
}

// ===========================================================================
// Tests
// ===========================================================================
