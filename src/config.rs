use std::path::PathBuf;
use std::{env, io};

use secrecy::SecretString;
use serde::Serialize;
use tracing::debug;

use crate::mobile::DEFAULT_MOBILE_KEYWORDS;
use crate::model::BoundingBox;

const DEFAULT_PROVIDER_BASE_URL: &str = "https://nominatim.openstreetmap.org";
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_BACKOFF_BASE_MS: u64 = 1_000;
const DEFAULT_MAX_CONSECUTIVE_FAILURES: usize = 10;
const MAX_WORKERS: usize = 16;

#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub provider_base_url: String,
    pub user_agent: String,
    pub api_key: Option<SecretString>,
    pub country_codes: Option<String>,
    pub rate_limit_qps: u32,
    pub request_timeout_ms: u64,
    pub backoff_base_ms: u64,
    pub workers: usize,
    pub max_consecutive_failures: usize,
    pub region_code: Option<String>,
    pub region_name: Option<String>,
    pub bounding_box: Option<BoundingBox>,
    pub overrides_file: Option<PathBuf>,
    pub mobile_keywords: Vec<String>,
}

#[derive(Clone, Debug, Serialize)]
pub struct PublicEngineConfig {
    pub provider_base_url: String,
    pub user_agent: String,
    pub has_api_key: bool,
    pub country_codes: Option<String>,
    pub rate_limit_qps: u32,
    pub request_timeout_ms: u64,
    pub workers: usize,
    pub max_consecutive_failures: usize,
    pub region_code: Option<String>,
    pub bounding_box: Option<BoundingBox>,
    pub overrides_file: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            provider_base_url: DEFAULT_PROVIDER_BASE_URL.to_string(),
            user_agent: default_user_agent(),
            api_key: None,
            country_codes: Some("us".to_string()),
            rate_limit_qps: 1,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            backoff_base_ms: DEFAULT_BACKOFF_BASE_MS,
            workers: 1,
            max_consecutive_failures: DEFAULT_MAX_CONSECUTIVE_FAILURES,
            region_code: None,
            region_name: None,
            bounding_box: None,
            overrides_file: None,
            mobile_keywords: DEFAULT_MOBILE_KEYWORDS
                .iter()
                .map(|k| k.to_string())
                .collect(),
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        load_dotenv_if_applicable();
        let defaults = Self::default();
        Self {
            provider_base_url: env::var("GEOCODER_BASE_URL")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(|v| v.trim_end_matches('/').to_string())
                .unwrap_or(defaults.provider_base_url),
            user_agent: env::var("GEOCODER_USER_AGENT")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .unwrap_or(defaults.user_agent),
            api_key: env::var("GEOCODER_API_KEY")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(SecretString::from),
            country_codes: match env::var("GEOCODER_COUNTRY_CODES") {
                Ok(v) if v.trim().is_empty() => None,
                Ok(v) => Some(v.trim().to_string()),
                Err(_) => defaults.country_codes,
            },
            rate_limit_qps: parse_u32("GEOCODER_RATE_LIMIT_QPS", defaults.rate_limit_qps),
            request_timeout_ms: parse_u64("GEOCODER_TIMEOUT_MS", defaults.request_timeout_ms)
                .max(1),
            backoff_base_ms: parse_u64("GEOCODER_BACKOFF_BASE_MS", defaults.backoff_base_ms),
            workers: parse_usize("GEOCODER_WORKERS", defaults.workers).clamp(1, MAX_WORKERS),
            max_consecutive_failures: parse_usize(
                "GEOCODER_MAX_CONSECUTIVE_FAILURES",
                defaults.max_consecutive_failures,
            ),
            region_code: non_empty_var("GEOCODER_REGION_CODE"),
            region_name: non_empty_var("GEOCODER_REGION_NAME"),
            bounding_box: env::var("GEOCODER_BOUNDING_BOX")
                .ok()
                .and_then(|v| BoundingBox::parse(&v)),
            overrides_file: non_empty_var("MANUAL_OVERRIDES_FILE").map(PathBuf::from),
            mobile_keywords: non_empty_var("MOBILE_KEYWORDS")
                .map(|v| {
                    v.split(',')
                        .map(|k| k.trim().to_string())
                        .filter(|k| !k.is_empty())
                        .collect()
                })
                .unwrap_or(defaults.mobile_keywords),
        }
    }

    pub fn public_profile(&self) -> PublicEngineConfig {
        PublicEngineConfig {
            provider_base_url: self.provider_base_url.clone(),
            user_agent: self.user_agent.clone(),
            has_api_key: self.api_key.is_some(),
            country_codes: self.country_codes.clone(),
            rate_limit_qps: self.rate_limit_qps,
            request_timeout_ms: self.request_timeout_ms,
            workers: self.workers,
            max_consecutive_failures: self.max_consecutive_failures,
            region_code: self.region_code.clone(),
            bounding_box: self.bounding_box,
            overrides_file: self.overrides_file.clone(),
        }
    }
}

fn default_user_agent() -> String {
    format!("address-resolver/{}", env!("CARGO_PKG_VERSION"))
}

fn load_dotenv_if_applicable() {
    if !should_load_dotenv() {
        debug!("skipping .env load outside dev mode");
        return;
    }

    if let Err(err) = dotenvy::dotenv() {
        match &err {
            dotenvy::Error::Io(io_err) if io_err.kind() == io::ErrorKind::NotFound => {}
            _ => debug!(?err, "unable to load .env file"),
        }
    }
}

fn should_load_dotenv() -> bool {
    cfg!(debug_assertions) || parse_bool("ALLOW_DOTENV", false)
}

fn non_empty_var(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(default)
}

fn parse_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn parse_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(default)
}

fn parse_u32(key: &str, default: u32) -> u32 {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u32>().ok())
        .unwrap_or(default)
}
