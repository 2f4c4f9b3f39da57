use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::trace;

use crate::config::EngineConfig;
use crate::errors::{AppResult, ProviderError};
use crate::model::Coordinate;
use crate::provider::GeocodeProvider;

const RESULT_LIMIT: &str = "3";

/// Thin adapter over a Nominatim-compatible `/search` endpoint.
pub struct NominatimClient {
    http: Client,
    search_url: String,
    api_key: Option<SecretString>,
    country_codes: Option<String>,
    preferred_region: Option<String>,
    timeout_ms: u64,
}

#[derive(Debug, Deserialize)]
struct SearchHit {
    lat: String,
    lon: String,
    #[serde(default)]
    display_name: Option<String>,
}

impl NominatimClient {
    pub fn new(config: &EngineConfig) -> AppResult<Self> {
        let http = Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()?;
        Ok(Self {
            http,
            search_url: format!("{}/search", config.provider_base_url.trim_end_matches('/')),
            api_key: config.api_key.clone(),
            country_codes: config.country_codes.clone(),
            preferred_region: config
                .region_name
                .clone()
                .or_else(|| config.region_code.clone())
                .map(|r| r.to_lowercase()),
            timeout_ms: config.request_timeout_ms,
        })
    }

    fn pick<'a>(&self, hits: &'a [SearchHit]) -> Option<&'a SearchHit> {
        let preferred = self.preferred_region.as_ref().and_then(|region| {
            hits.iter().find(|hit| {
                hit.display_name
                    .as_ref()
                    .map(|name| name.to_lowercase().contains(region))
                    .unwrap_or(false)
            })
        });
        preferred.or_else(|| hits.first())
    }
}

#[async_trait]
impl GeocodeProvider for NominatimClient {
    async fn resolve_query(&self, query: &str) -> Result<Option<Coordinate>, ProviderError> {
        let mut params: Vec<(&str, &str)> = vec![
            ("q", query),
            ("format", "json"),
            ("limit", RESULT_LIMIT),
            ("addressdetails", "0"),
        ];
        if let Some(codes) = &self.country_codes {
            params.push(("countrycodes", codes.as_str()));
        }
        if let Some(key) = &self.api_key {
            params.push(("key", key.expose_secret()));
        }

        let response = self
            .http
            .get(&self.search_url)
            .query(&params)
            .send()
            .await
            .map_err(|err| match ProviderError::from(err) {
                ProviderError::Timeout(_) => ProviderError::Timeout(self.timeout_ms),
                other => other,
            })?;

        match response.status() {
            StatusCode::TOO_MANY_REQUESTS => return Err(ProviderError::RateLimited),
            status if !status.is_success() => {
                return Err(ProviderError::Transient(format!(
                    "provider answered with status {status}"
                )))
            }
            _ => {}
        }

        let hits: Vec<SearchHit> = response
            .json()
            .await
            .map_err(|err| ProviderError::Malformed(err.to_string()))?;
        trace!(query, hits = hits.len(), "provider search answered");

        let Some(hit) = self.pick(&hits) else {
            return Ok(None);
        };
        let lat = hit
            .lat
            .trim()
            .parse::<f64>()
            .map_err(|err| ProviderError::Malformed(format!("bad latitude {:?}: {err}", hit.lat)))?;
        let lon = hit
            .lon
            .trim()
            .parse::<f64>()
            .map_err(|err| ProviderError::Malformed(format!("bad longitude {:?}: {err}", hit.lon)))?;
        Ok(Some(Coordinate::new(lat, lon)))
    }
}
