//! Weather Tool
//!
//! Current conditions and optional 5-day forecast through Open-Meteo,
//! geocoding locations with Nominatim. No API key required.

use async_trait::async_trait;
use serde::Deserialize;
use std::fmt::Write as _;
use std::time::Duration;

use gateway_core::{
    error::Result,
    tool::{ParameterSchema, Tool, ToolCall, ToolResult, ToolSchema},
};

use super::{http_client, str_arg};

const GEOCODE_URL: &str = "https://nominatim.openstreetmap.org/search";
const FORECAST_URL: &str = "https://api.open-meteo.com/v1/forecast";

#[derive(Deserialize)]
struct GeocodeHit {
    lat: String,
    lon: String,
    #[serde(default)]
    display_name: Option<String>,
}

#[derive(Deserialize)]
struct WeatherResponse {
    current: CurrentWeather,
    #[serde(default)]
    daily: Option<DailyForecast>,
}

#[derive(Deserialize)]
struct CurrentWeather {
    temperature_2m: f64,
    relative_humidity_2m: f64,
    apparent_temperature: f64,
    weather_code: u32,
    surface_pressure: f64,
    wind_speed_10m: f64,
}

#[derive(Deserialize)]
struct DailyForecast {
    time: Vec<String>,
    temperature_2m_max: Vec<f64>,
    temperature_2m_min: Vec<f64>,
    precipitation_sum: Vec<f64>,
    weather_code: Vec<u32>,
}

/// WMO weather code to description
fn describe_weather_code(code: u32) -> &'static str {
    match code {
        0 => "Clear sky",
        1 => "Mainly clear",
        2 => "Partly cloudy",
        3 => "Overcast",
        45 => "Fog",
        48 => "Depositing rime fog",
        51 => "Light drizzle",
        53 => "Moderate drizzle",
        55 => "Dense drizzle",
        61 => "Slight rain",
        63 => "Moderate rain",
        65 => "Heavy rain",
        71 => "Slight snow",
        73 => "Moderate snow",
        75 => "Heavy snow",
        95 => "Thunderstorm",
        96 => "Thunderstorm with slight hail",
        99 => "Thunderstorm with heavy hail",
        _ => "Unknown conditions",
    }
}

/// `get_weather` tool
pub struct WeatherTool {
    http: reqwest::Client,
}

impl WeatherTool {
    pub fn new() -> Result<Self> {
        Ok(Self {
            http: http_client(Duration::from_secs(10))?,
        })
    }

    async fn geocode(&self, location: &str) -> std::result::Result<GeocodeHit, String> {
        let hits: Vec<GeocodeHit> = self
            .http
            .get(GEOCODE_URL)
            .query(&[
                ("q", location),
                ("format", "json"),
                ("limit", "1"),
                ("accept-language", "en"),
            ])
            .send()
            .await
            .map_err(|e| format!("Network error retrieving weather data: {e}"))?
            .error_for_status()
            .map_err(|e| format!("Geocoding failed: {e}"))?
            .json()
            .await
            .map_err(|e| format!("Error parsing geocoding data: {e}"))?;

        hits.into_iter().next().ok_or_else(|| {
            format!("Location '{location}' not found. Please try a more specific location.")
        })
    }

    async fn fetch_weather(
        &self,
        lat: &str,
        lon: &str,
        include_forecast: bool,
    ) -> std::result::Result<WeatherResponse, String> {
        let current_fields = "temperature_2m,relative_humidity_2m,apparent_temperature,\
                              weather_code,surface_pressure,wind_speed_10m";
        let mut query = vec![
            ("latitude".to_string(), lat.to_string()),
            ("longitude".to_string(), lon.to_string()),
            ("current".to_string(), current_fields.to_string()),
            ("timezone".to_string(), "auto".to_string()),
        ];
        if include_forecast {
            query.push((
                "daily".to_string(),
                "temperature_2m_max,temperature_2m_min,precipitation_sum,weather_code".to_string(),
            ));
            query.push(("forecast_days".to_string(), "5".to_string()));
        }

        self.http
            .get(FORECAST_URL)
            .query(&query)
            .send()
            .await
            .map_err(|e| format!("Network error retrieving weather data: {e}"))?
            .error_for_status()
            .map_err(|e| format!("Weather service error: {e}"))?
            .json()
            .await
            .map_err(|e| format!("Error parsing weather data: {e}"))
    }

    fn format_report(place: &str, weather: &WeatherResponse) -> String {
        let current = &weather.current;
        let mut report = format!(
            "Weather for {place}:\n\n\
             Conditions: {}\n\
             Temperature: {}°C (feels like {}°C)\n\
             Humidity: {}%\n\
             Wind Speed: {} m/s\n\
             Pressure: {} hPa",
            describe_weather_code(current.weather_code),
            current.temperature_2m,
            current.apparent_temperature,
            current.relative_humidity_2m,
            current.wind_speed_10m,
            current.surface_pressure,
        );

        if let Some(daily) = &weather.daily {
            report.push_str("\n\n5-Day Forecast:\n");
            for i in 0..daily.time.len() {
                let _ = write!(
                    report,
                    "{}: {}°C - {}°C, {}",
                    daily.time[i],
                    daily.temperature_2m_min.get(i).copied().unwrap_or_default(),
                    daily.temperature_2m_max.get(i).copied().unwrap_or_default(),
                    describe_weather_code(daily.weather_code.get(i).copied().unwrap_or_default()),
                );
                if daily.precipitation_sum.get(i).copied().unwrap_or_default() > 0.0 {
                    let _ = write!(report, ", {}mm rain", daily.precipitation_sum[i]);
                }
                report.push('\n');
            }
        }

        report.trim_end().to_string()
    }
}

#[async_trait]
impl Tool for WeatherTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "get_weather".into(),
            description: "Get current weather and optional 5-day forecast for a location".into(),
            parameters: vec![
                ParameterSchema {
                    name: "location".into(),
                    param_type: "string".into(),
                    description: "City or place name, e.g. 'Paris' or 'Austin, TX'".into(),
                    required: true,
                    default: None,
                },
                ParameterSchema {
                    name: "include_forecast".into(),
                    param_type: "boolean".into(),
                    description: "Include a 5-day forecast".into(),
                    required: false,
                    default: Some(serde_json::Value::Bool(false)),
                },
            ],
            timeout: Duration::from_secs(15),
            has_side_effects: false,
        }
    }

    async fn execute(&self, call: &ToolCall) -> Result<ToolResult> {
        let Some(location) = str_arg(call, "location") else {
            return Ok(ToolResult::failure(
                "get_weather",
                "Please provide a location.",
            ));
        };
        let include_forecast = call
            .arguments
            .get("include_forecast")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false);

        let hit = match self.geocode(location).await {
            Ok(hit) => hit,
            Err(msg) => return Ok(ToolResult::failure("get_weather", msg)),
        };

        let place = hit.display_name.as_deref().unwrap_or(location).to_string();
        match self.fetch_weather(&hit.lat, &hit.lon, include_forecast).await {
            Ok(weather) => Ok(ToolResult::success(
                "get_weather",
                Self::format_report(&place, &weather),
            )),
            Err(msg) => Ok(ToolResult::failure("get_weather", msg)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_weather_code_table() {
        assert_eq!(describe_weather_code(0), "Clear sky");
        assert_eq!(describe_weather_code(95), "Thunderstorm");
        assert_eq!(describe_weather_code(42), "Unknown conditions");
    }

    #[test]
    fn test_report_format() {
        let weather = WeatherResponse {
            current: CurrentWeather {
                temperature_2m: 12.5,
                relative_humidity_2m: 70.0,
                apparent_temperature: 11.0,
                weather_code: 2,
                surface_pressure: 1013.0,
                wind_speed_10m: 3.2,
            },
            daily: None,
        };

        let report = WeatherTool::format_report("Paris, France", &weather);
        assert!(report.contains("Weather for Paris, France"));
        assert!(report.contains("Partly cloudy"));
        assert!(report.contains("12.5°C (feels like 11°C)"));
    }

    #[tokio::test]
    async fn test_missing_location_is_a_failed_result() {
        let tool = WeatherTool::new().unwrap();
        let call = ToolCall {
            name: "get_weather".into(),
            arguments: Default::default(),
            id: None,
        };
        let result = tool.execute(&call).await.unwrap();
        assert!(!result.success);
    }
}
