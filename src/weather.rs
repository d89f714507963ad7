//! Weather adapter (OpenWeatherMap 2.5 API).
//!
//! Fetches current conditions and the 3-hourly forecast through the shared
//! [`RetryPolicy`]. Neither call ever fails outward: after retries run out
//! the adapter logs and returns `None`, because missing weather must not stop
//! a report.
//!
//! [`WeatherClient::check_severe_conditions`] turns the two feeds into
//! operator alerts:
//! - **wind**: current speed (m/s → km/h) above 30 km/h, checked only outside
//!   the 22:00–06:00 local quiet window;
//! - **rain**: the first of the next two forecast intervals whose
//!   probability of precipitation exceeds 50%.

use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, error};

use crate::config::{resolve_secret, WeatherConfig};
use crate::models::{CurrentWeather, Forecast};
use crate::period::SiteClock;
use crate::retry::{get_json, FetchError, RetryPolicy};
use crate::traits::WeatherSource;

/// Wind speed (km/h) above which a wind alert is raised.
pub const WIND_ALERT_KMH: f64 = 30.0;
/// Precipitation probability (percent) above which a rain alert is raised.
pub const RAIN_ALERT_PERCENT: f64 = 50.0;
/// Number of upcoming forecast intervals inspected for rain.
const RAIN_LOOKAHEAD: usize = 2;

pub struct WeatherClient {
    http: reqwest::Client,
    base_url: String,
    lat: f64,
    lon: f64,
    api_key: Option<String>,
    retry: RetryPolicy,
    clock: SiteClock,
}

impl WeatherClient {
    pub fn new(config: &WeatherConfig, retry: RetryPolicy, clock: SiteClock) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            lat: config.lat,
            lon: config.lon,
            api_key: resolve_secret(&config.api_key, &config.api_key_env),
            retry,
            clock,
        })
    }

    async fn fetch<T: serde::de::DeserializeOwned>(&self, endpoint: &str) -> Result<T, FetchError> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| FetchError::Config("weather API key not configured".into()))?;
        let url = format!("{}/{}", self.base_url, endpoint);
        let lat = self.lat.to_string();
        let lon = self.lon.to_string();

        self.retry
            .call(|| {
                let request = self.http.get(&url).query(&[
                    ("lat", lat.as_str()),
                    ("lon", lon.as_str()),
                    ("appid", api_key),
                    ("units", "metric"),
                ]);
                get_json::<T>(request)
            })
            .await
    }

    /// Current conditions, enriched with a localized description and icon URL.
    pub async fn get_current(&self) -> Option<CurrentWeather> {
        match self.fetch::<CurrentWeather>("weather").await {
            Ok(mut current) => {
                enrich(&mut current);
                Some(current)
            }
            Err(e) => {
                error!(error = %e, "Error fetching weather data");
                None
            }
        }
    }

    pub async fn get_forecast(&self) -> Option<Forecast> {
        match self.fetch::<Forecast>("forecast").await {
            Ok(forecast) => Some(forecast),
            Err(e) => {
                error!(error = %e, "Error fetching forecast data");
                None
            }
        }
    }

    /// Severe-condition alerts for the current local hour.
    pub async fn check_severe_conditions(&self) -> Option<String> {
        let hour = self.clock.local_hour(chrono::Utc::now());
        self.check_severe_conditions_at(hour).await
    }

    /// Severe-condition alerts as seen at `local_hour`.
    ///
    /// Current conditions are only fetched outside the quiet window.
    pub async fn check_severe_conditions_at(&self, local_hour: u32) -> Option<String> {
        let current = if in_quiet_window(local_hour) {
            debug!(local_hour, "quiet window, skipping wind check");
            None
        } else {
            self.get_current().await
        };
        let forecast = self.get_forecast().await;
        severe_alerts(current.as_ref(), forecast.as_ref(), local_hour)
    }
}

#[async_trait]
impl WeatherSource for WeatherClient {
    async fn current(&self) -> Option<CurrentWeather> {
        self.get_current().await
    }

    async fn severe_alert(&self) -> Option<String> {
        self.check_severe_conditions().await
    }
}

fn enrich(current: &mut CurrentWeather) {
    if let Some(condition) = current.weather.first_mut() {
        condition.description = describe_condition(condition.id).to_string();
        condition.icon_url = Some(icon_url(&condition.icon));
    }
}

/// Localized (Arabic) description for an OpenWeatherMap condition code.
pub fn describe_condition(code: i64) -> &'static str {
    match code {
        200..=299 => "عاصفة رعدية",
        300..=399 => "رذاذ",
        500..=599 => "مطر",
        600..=699 => "ثلوج",
        700..=799 => "ضباب",
        800 => "صافي",
        801..=899 => "غائم جزئياً",
        _ => "غير معروف",
    }
}

pub fn icon_url(icon: &str) -> String {
    format!("https://openweathermap.org/img/wn/{}@2x.png", icon)
}

/// 22:00 to 06:00 local: no wind alerts.
pub fn in_quiet_window(local_hour: u32) -> bool {
    local_hour >= 22 || local_hour < 6
}

pub fn mps_to_kmh(speed: f64) -> f64 {
    speed * 3.6
}

/// Compose alerts from already-fetched weather data.
///
/// Returns `None` when nothing crosses a threshold, otherwise the alerts
/// joined by newlines.
pub fn severe_alerts(
    current: Option<&CurrentWeather>,
    forecast: Option<&Forecast>,
    local_hour: u32,
) -> Option<String> {
    let mut alerts = Vec::new();

    if !in_quiet_window(local_hour) {
        if let Some(current) = current {
            let wind_kmh = mps_to_kmh(current.wind.speed);
            if wind_kmh > WIND_ALERT_KMH {
                alerts.push(format!(
                    "⚠️ High wind alert: wind speed is {:.1} km/h. Exercise caution and stop crane operations.",
                    wind_kmh
                ));
            }
        }
    }

    if let Some(forecast) = forecast {
        let rainy = forecast
            .list
            .iter()
            .take(RAIN_LOOKAHEAD)
            .map(|entry| entry.pop * 100.0)
            .find(|pop| *pop > RAIN_ALERT_PERCENT);
        if let Some(pop) = rainy {
            alerts.push(format!(
                "🌧️ Rain forecast: there is a {:.0}% chance of rain in the coming hours.",
                pop
            ));
        }
    }

    if alerts.is_empty() {
        None
    } else {
        Some(alerts.join("\n"))
    }
}
