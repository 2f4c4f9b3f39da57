use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::{rngs::StdRng, Rng, SeedableRng};
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::errors::{AppResult, ProviderError};
use crate::model::Coordinate;
use crate::nominatim::NominatimClient;

const MAX_BACKOFF_EXPONENT: u32 = 6;

/// The external geocoder: one query in, a coordinate, a miss, or an error out.
#[async_trait]
pub trait GeocodeProvider: Send + Sync {
    async fn resolve_query(&self, query: &str) -> Result<Option<Coordinate>, ProviderError>;
}

#[derive(Clone)]
pub struct GeocodingService {
    inner: Arc<dyn GeocodeProvider>,
}

impl GeocodingService {
    pub fn new(config: &EngineConfig) -> AppResult<Self> {
        let client = NominatimClient::new(config)?;
        Ok(Self {
            inner: Arc::new(client),
        })
    }

    pub fn from_provider(provider: Arc<dyn GeocodeProvider>) -> Self {
        Self { inner: provider }
    }

    pub async fn resolve_query(&self, query: &str) -> Result<Option<Coordinate>, ProviderError> {
        self.inner.resolve_query(query).await
    }
}

/// Process-wide throttle in front of the provider. Enforces a minimum spacing
/// between calls and, after a rate-limit answer, a shared cooldown that grows
/// exponentially until a call goes through again.
pub struct RateLimiter {
    min_interval: Duration,
    backoff_base_ms: u64,
    strikes: AtomicU32,
    last_tick: AsyncMutex<Option<Instant>>,
    cooldown_until: Mutex<Option<Instant>>,
    jitter_rng: Mutex<StdRng>,
}

impl RateLimiter {
    /// `qps == 0` disables spacing.
    pub fn new(qps: u32, backoff_base_ms: u64) -> Self {
        Self::with_rng(qps, backoff_base_ms, StdRng::from_entropy())
    }

    pub fn with_rng(qps: u32, backoff_base_ms: u64, rng: StdRng) -> Self {
        Self {
            min_interval: Self::interval_for(qps),
            backoff_base_ms,
            strikes: AtomicU32::new(0),
            last_tick: AsyncMutex::new(None),
            cooldown_until: Mutex::new(None),
            jitter_rng: Mutex::new(rng),
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.rate_limit_qps, config.backoff_base_ms)
    }

    fn interval_for(qps: u32) -> Duration {
        if qps == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis((1000_f64 / qps as f64).ceil() as u64)
    }

    pub async fn wait(&self) {
        let interval = self.min_interval;
        let mut guard = self.last_tick.lock().await;
        let cooldown = *self.cooldown_until.lock();
        if let Some(until) = cooldown {
            let now = Instant::now();
            if until > now {
                debug!(remaining = ?(until - now), "waiting out provider cooldown");
                sleep(until - now).await;
            }
        }
        if let Some(prev) = *guard {
            let elapsed = prev.elapsed();
            if elapsed < interval {
                sleep(interval - elapsed).await;
            }
        }
        *guard = Some(Instant::now());
    }

    /// Called after the provider answered with a rate-limit error.
    pub fn penalize(&self) -> Duration {
        let strikes = self.strikes.fetch_add(1, Ordering::SeqCst) + 1;
        let delay = self.backoff_delay(strikes);
        *self.cooldown_until.lock() = Some(Instant::now() + delay);
        warn!(strikes, ?delay, "provider rate limit hit; backing off");
        delay
    }

    /// Called after any call that reached the provider without a rate-limit error.
    pub fn relax(&self) {
        if self.strikes.swap(0, Ordering::SeqCst) > 0 {
            *self.cooldown_until.lock() = None;
        }
    }

    pub fn strikes(&self) -> u32 {
        self.strikes.load(Ordering::SeqCst)
    }

    fn backoff_delay(&self, strikes: u32) -> Duration {
        if self.backoff_base_ms == 0 {
            return Duration::ZERO;
        }
        let exponent = (strikes - 1).min(MAX_BACKOFF_EXPONENT);
        let base = Duration::from_millis(self.backoff_base_ms * (1 << exponent));
        let jitter = {
            let mut rng = self.jitter_rng.lock();
            Duration::from_millis(rng.gen_range(0..self.backoff_base_ms))
        };
        base + jitter
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn converts_qps_to_interval() {
        assert_eq!(RateLimiter::new(4, 100).min_interval, Duration::from_millis(250));
        assert_eq!(RateLimiter::new(3, 100).min_interval, Duration::from_millis(334));
        assert_eq!(RateLimiter::new(0, 100).min_interval, Duration::ZERO);
    }

    #[test]
    fn backoff_grows_and_resets() {
        let limiter = RateLimiter::with_rng(0, 100, StdRng::seed_from_u64(7));
        let first = limiter.penalize();
        let second = limiter.penalize();
        assert!(first >= Duration::from_millis(100) && first < Duration::from_millis(200));
        assert!(second >= Duration::from_millis(200) && second < Duration::from_millis(300));
        assert_eq!(limiter.strikes(), 2);

        limiter.relax();
        assert_eq!(limiter.strikes(), 0);
        assert!(limiter.cooldown_until.lock().is_none());
    }

    #[tokio::test]
    async fn spaces_consecutive_calls() {
        let limiter = RateLimiter::new(20, 0);
        let started = Instant::now();
        limiter.wait().await;
        limiter.wait().await;
        limiter.wait().await;
        assert!(started.elapsed() >= Duration::from_millis(100));
    }
}
