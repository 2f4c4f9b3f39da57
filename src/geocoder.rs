use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::errors::ProviderError;
use crate::model::{AddressCandidate, Coordinate, PlausibilityBound};
use crate::provider::{GeocodingService, RateLimiter};
use crate::report::{Attempt, AttemptOutcome};

#[derive(Debug, Clone, PartialEq)]
pub struct GeocodeOutcome {
    pub coordinate: Option<Coordinate>,
    /// 1-based position of the candidate that produced `coordinate`.
    pub position: Option<usize>,
    pub attempts: Vec<Attempt>,
}

/// Walks the candidates in order and stops at the first plausible answer.
///
/// Each candidate is tried once. Misses, implausible answers and provider
/// errors all move on to the next candidate.
pub struct FallbackGeocoder {
    service: GeocodingService,
    limiter: Arc<RateLimiter>,
    call_timeout: Duration,
    bound: PlausibilityBound,
}

impl FallbackGeocoder {
    pub fn new(
        service: GeocodingService,
        limiter: Arc<RateLimiter>,
        call_timeout: Duration,
        bound: PlausibilityBound,
    ) -> Self {
        Self {
            service,
            limiter,
            call_timeout,
            bound,
        }
    }

    pub fn from_config(service: GeocodingService, config: &EngineConfig) -> Self {
        Self::new(
            service,
            Arc::new(RateLimiter::from_config(config)),
            Duration::from_millis(config.request_timeout_ms),
            PlausibilityBound::new(config.bounding_box),
        )
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub async fn resolve(&self, candidates: &[AddressCandidate]) -> GeocodeOutcome {
        let mut attempts = Vec::with_capacity(candidates.len());
        for (idx, candidate) in candidates.iter().enumerate() {
            let position = idx + 1;
            let outcome = match self.call(candidate.as_str()).await {
                Ok(Some(coordinate)) if self.bound.accepts(&coordinate) => {
                    AttemptOutcome::Found { coordinate }
                }
                Ok(Some(coordinate)) => {
                    debug!(position, query = %candidate, %coordinate, "rejecting implausible coordinate");
                    AttemptOutcome::Implausible { coordinate }
                }
                Ok(None) => AttemptOutcome::NotFound,
                Err(err) => {
                    warn!(position, query = %candidate, error = %err, "provider call failed; trying next candidate");
                    AttemptOutcome::from_error(&err)
                }
            };
            debug!(position, query = %candidate, ?outcome, "candidate attempted");

            let found = match &outcome {
                AttemptOutcome::Found { coordinate } => Some(*coordinate),
                _ => None,
            };
            attempts.push(Attempt {
                query: candidate.clone(),
                outcome,
            });
            if let Some(coordinate) = found {
                return GeocodeOutcome {
                    coordinate: Some(coordinate),
                    position: Some(position),
                    attempts,
                };
            }
        }

        GeocodeOutcome {
            coordinate: None,
            position: None,
            attempts,
        }
    }

    async fn call(&self, query: &str) -> Result<Option<Coordinate>, ProviderError> {
        self.limiter.wait().await;
        let result = match timeout(self.call_timeout, self.service.resolve_query(query)).await {
            Ok(result) => result,
            Err(_) => Err(ProviderError::Timeout(self.call_timeout.as_millis() as u64)),
        };
        // Only an actual answer proves the provider stopped throttling us.
        match &result {
            Ok(_) => self.limiter.relax(),
            Err(ProviderError::RateLimited) => {
                self.limiter.penalize();
            }
            Err(_) => {}
        }
        result
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::VecDeque;

    use async_trait::async_trait;
    use parking_lot::Mutex;

    use super::*;
    use crate::provider::GeocodeProvider;

    /// Provider double that answers from a script and records every query.
    pub(crate) struct ScriptedProvider {
        script: Mutex<VecDeque<Result<Option<Coordinate>, ProviderError>>>,
        fallback: Result<Option<Coordinate>, ProviderError>,
        pub(crate) calls: Mutex<Vec<String>>,
        delay: Option<Duration>,
    }

    impl ScriptedProvider {
        pub(crate) fn new(
            script: Vec<Result<Option<Coordinate>, ProviderError>>,
            fallback: Result<Option<Coordinate>, ProviderError>,
        ) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                fallback,
                calls: Mutex::new(Vec::new()),
                delay: None,
            })
        }

        pub(crate) fn slow(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(VecDeque::new()),
                fallback: Ok(Some(Coordinate::new(38.0, -84.5))),
                calls: Mutex::new(Vec::new()),
                delay: Some(delay),
            })
        }

        pub(crate) fn call_count(&self) -> usize {
            self.calls.lock().len()
        }
    }

    #[async_trait]
    impl GeocodeProvider for ScriptedProvider {
        async fn resolve_query(&self, query: &str) -> Result<Option<Coordinate>, ProviderError> {
            self.calls.lock().push(query.to_string());
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let next = self.script.lock().pop_front();
            next.unwrap_or_else(|| self.fallback.clone())
        }
    }

    pub(crate) fn geocoder_for(provider: Arc<ScriptedProvider>) -> FallbackGeocoder {
        FallbackGeocoder::new(
            GeocodingService::from_provider(provider),
            Arc::new(RateLimiter::new(0, 0)),
            Duration::from_millis(200),
            PlausibilityBound::default(),
        )
    }

    fn candidates(queries: &[&str]) -> Vec<AddressCandidate> {
        queries.iter().map(|q| AddressCandidate::new(*q)).collect()
    }

    #[tokio::test]
    async fn stops_at_first_success() {
        let lexington = Coordinate::new(38.0406, -84.5037);
        let provider = ScriptedProvider::new(vec![Ok(None), Ok(Some(lexington))], Ok(None));
        let geocoder = geocoder_for(provider.clone());

        let outcome = geocoder.resolve(&candidates(&["a", "b", "c"])).await;
        assert_eq!(outcome.coordinate, Some(lexington));
        assert_eq!(outcome.position, Some(2));
        assert_eq!(provider.call_count(), 2);
        assert_eq!(*provider.calls.lock(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn provider_errors_move_on_to_next_candidate() {
        let paris = Coordinate::new(38.2098, -84.2530);
        let provider = ScriptedProvider::new(
            vec![
                Err(ProviderError::Transient("connection reset".into())),
                Err(ProviderError::Malformed("not json".into())),
                Ok(Some(paris)),
            ],
            Ok(None),
        );
        let geocoder = geocoder_for(provider.clone());

        let outcome = geocoder.resolve(&candidates(&["a", "b", "c"])).await;
        assert_eq!(outcome.position, Some(3));
        assert!(outcome.attempts[0].outcome.is_error());
        assert!(outcome.attempts[1].outcome.is_error());
    }

    #[tokio::test]
    async fn rejects_implausible_coordinates() {
        let provider = ScriptedProvider::new(vec![Ok(Some(Coordinate::new(999.0, 999.0)))], Ok(None));
        let geocoder = geocoder_for(provider.clone());

        let outcome = geocoder.resolve(&candidates(&["a", "b"])).await;
        assert_eq!(outcome.coordinate, None);
        assert_eq!(
            outcome.attempts[0].outcome,
            AttemptOutcome::Implausible {
                coordinate: Coordinate::new(999.0, 999.0)
            }
        );
        assert_eq!(outcome.attempts[1].outcome, AttemptOutcome::NotFound);
    }

    #[tokio::test]
    async fn slow_provider_is_cut_off_by_timeout() {
        let provider = ScriptedProvider::slow(Duration::from_secs(5));
        let geocoder = geocoder_for(provider.clone());

        let outcome = geocoder.resolve(&candidates(&["a"])).await;
        assert_eq!(outcome.coordinate, None);
        assert!(matches!(
            &outcome.attempts[0].outcome,
            AttemptOutcome::Error { kind, .. } if kind == "timeout"
        ));
    }

    #[tokio::test]
    async fn rate_limit_answers_penalize_the_shared_limiter() {
        let provider = ScriptedProvider::new(vec![Err(ProviderError::RateLimited)], Ok(None));
        let geocoder = geocoder_for(provider);

        geocoder.resolve(&candidates(&["a"])).await;
        assert_eq!(geocoder.limiter().strikes(), 1);
        geocoder.resolve(&candidates(&["b"])).await;
        assert_eq!(geocoder.limiter().strikes(), 0);
    }

    #[tokio::test]
    async fn failed_calls_keep_the_rate_limit_cooldown() {
        let provider = ScriptedProvider::new(
            vec![
                Err(ProviderError::RateLimited),
                Err(ProviderError::Transient("connection reset".into())),
            ],
            Ok(None),
        );
        let geocoder = geocoder_for(provider);

        geocoder.resolve(&candidates(&["a", "b"])).await;
        assert_eq!(geocoder.limiter().strikes(), 1);

        let slow = geocoder_for(ScriptedProvider::slow(Duration::from_secs(5)));
        slow.limiter().penalize();
        slow.resolve(&candidates(&["a"])).await;
        assert_eq!(slow.limiter().strikes(), 1);
    }
}
