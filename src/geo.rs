//! Wi-Fi based geolocation of devices from their neighbor scans.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::error::GeoError;

pub const DEFAULT_ENDPOINT: &str = "https://www.googleapis.com/geolocation/v1/geolocate";

/// One access point a device could hear.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessPoint {
    pub mac_address: String,
    pub signal_strength: f64,
    pub channel: i64,
    pub signal_to_noise_ratio: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Location {
    pub lat: f64,
    pub lng: f64,
    /// Radius in meters.
    pub accuracy: f64,
}

pub trait Geolocator: Send + Sync {
    fn geolocate(&self, serial: &str, access_points: &[AccessPoint]) -> Result<Location, GeoError>;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GeolocateRequest<'a> {
    consider_ip: bool,
    wifi_access_points: &'a [AccessPoint],
}

#[derive(Deserialize)]
struct GeolocateResponse {
    location: LatLng,
    accuracy: f64,
}

#[derive(Deserialize)]
struct LatLng {
    lat: f64,
    lng: f64,
}

/// Client for the Google Maps geolocation API.
pub struct GoogleGeolocator {
    api_key: Option<String>,
    endpoint: String,
    agent: ureq::Agent,
}

impl GoogleGeolocator {
    /// `timeout` of `None` leaves requests unbounded.
    pub fn new(api_key: Option<String>, timeout: Option<Duration>) -> Self {
        let mut builder = ureq::AgentBuilder::new();
        if let Some(t) = timeout {
            builder = builder.timeout_connect(t).timeout_read(t).timeout_write(t);
        }
        GoogleGeolocator {
            api_key: api_key.filter(|k| !k.is_empty()),
            endpoint: DEFAULT_ENDPOINT.to_string(),
            agent: builder.build(),
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }
}

impl Geolocator for GoogleGeolocator {
    fn geolocate(&self, serial: &str, access_points: &[AccessPoint]) -> Result<Location, GeoError> {
        let key = self.api_key.as_deref().ok_or(GeoError::NoCredential)?;

        debug!(serial, access_points = access_points.len(), "requesting geolocation");
        let body = GeolocateRequest {
            consider_ip: false,
            wifi_access_points: access_points,
        };
        let response = self
            .agent
            .post(&self.endpoint)
            .query("key", key)
            .set("Accept", "application/json")
            .send_json(&body)
            .map_err(|e| match e {
                ureq::Error::Status(code, _) => GeoError::Request(format!("http status {}", code)),
                ureq::Error::Transport(t) => GeoError::Request(t.to_string()),
            })?;

        let parsed: GeolocateResponse = response
            .into_json()
            .map_err(|e| GeoError::Response(e.to_string()))?;
        Ok(Location {
            lat: parsed.location.lat,
            lng: parsed.location.lng,
            accuracy: parsed.accuracy,
        })
    }
}
