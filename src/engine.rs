use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use futures_util::stream::{self, StreamExt};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::{EngineConfig, PublicEngineConfig};
use crate::errors::AppResult;
use crate::geocoder::FallbackGeocoder;
use crate::mobile::MobileVendorFilter;
use crate::model::Record;
use crate::normalizer::{AddressNormalizer, RegionHint, DEFAULT_STREET_TYPES};
use crate::overrides::ManualOverrideStore;
use crate::provider::GeocodingService;
use crate::report::{
    BatchReport, BatchStatus, FailureDetail, Method, Resolution, ResolutionReport,
};

const CANCELLED_NOTE: &str = "cancelled";
const ABORTED_NOTE: &str = "aborted";

#[derive(Debug, Clone)]
pub struct BatchProgress {
    pub total: usize,
    pub processed: usize,
    pub placed: usize,
}

pub type ProgressObserver = Arc<dyn Fn(BatchProgress) + Send + Sync>;

/// Drives records through override lookup, mobile filtering, normalization
/// and fallback geocoding.
pub struct ResolutionEngine {
    filter: MobileVendorFilter,
    overrides: ManualOverrideStore,
    normalizer: AddressNormalizer,
    geocoder: FallbackGeocoder,
    workers: usize,
    consecutive_failure_limit: usize,
    profile: Option<PublicEngineConfig>,
}

/// Shared per-run state for the consecutive-failure circuit.
struct RunState {
    total: usize,
    processed: AtomicUsize,
    placed: AtomicUsize,
    consecutive_failures: AtomicUsize,
    abort_reason: Mutex<Option<String>>,
    cancelled: AtomicBool,
}

impl ResolutionEngine {
    pub fn new(
        filter: MobileVendorFilter,
        overrides: ManualOverrideStore,
        normalizer: AddressNormalizer,
        geocoder: FallbackGeocoder,
    ) -> Self {
        Self {
            filter,
            overrides,
            normalizer,
            geocoder,
            workers: 1,
            consecutive_failure_limit: 0,
            profile: None,
        }
    }

    /// Builds the full engine from configuration. Overrides are read from
    /// `overrides_file` when no store is passed in.
    pub fn from_config(
        config: &EngineConfig,
        service: GeocodingService,
        overrides: Option<ManualOverrideStore>,
    ) -> AppResult<Self> {
        let overrides = match (overrides, &config.overrides_file) {
            (Some(store), _) => store,
            (None, Some(path)) => ManualOverrideStore::load(path)?,
            (None, None) => ManualOverrideStore::default(),
        };
        let region = config
            .region_code
            .as_ref()
            .map(|code| RegionHint::new(code.clone(), config.region_name.clone()))
            .transpose()?;
        let normalizer = AddressNormalizer::new(DEFAULT_STREET_TYPES, region)?;
        let geocoder = FallbackGeocoder::from_config(service, config);

        Ok(Self::new(
            MobileVendorFilter::new(&config.mobile_keywords),
            overrides,
            normalizer,
            geocoder,
        )
        .with_workers(config.workers)
        .with_consecutive_failure_limit(config.max_consecutive_failures)
        .with_profile(config.public_profile()))
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// `0` disables the batch abort.
    pub fn with_consecutive_failure_limit(mut self, limit: usize) -> Self {
        self.consecutive_failure_limit = limit;
        self
    }

    pub fn with_profile(mut self, profile: PublicEngineConfig) -> Self {
        self.profile = Some(profile);
        self
    }

    /// Resolves a single record through the full decision chain.
    pub async fn resolve_record(&self, record: Record) -> Resolution {
        if let Some(coordinate) = self.overrides.lookup(&record.raw_address) {
            debug!(name = %record.name, "manual override hit");
            let mut resolution = Resolution::new(record, Method::Override);
            resolution.coordinate = Some(coordinate);
            return resolution;
        }

        if self.filter.is_mobile(&record) {
            debug!(name = %record.name, "skipping mobile vendor");
            return Resolution::new(record, Method::SkippedMobile);
        }

        if !record.has_address() {
            debug!(name = %record.name, "skipping record without address");
            return Resolution::new(record, Method::SkippedNoAddress);
        }

        let candidates = self.normalizer.candidates_for(&record);
        let outcome = self.geocoder.resolve(&candidates).await;
        let method = outcome
            .position
            .map(Method::for_candidate)
            .unwrap_or(Method::Failed);

        let mut resolution = Resolution::new(record, method);
        resolution.coordinate = outcome.coordinate;
        resolution.attempts = outcome.attempts;
        resolution
    }

    pub async fn run(
        &self,
        records: Vec<Record>,
        observer: Option<ProgressObserver>,
        cancel_flag: Option<Arc<AtomicBool>>,
    ) -> BatchReport {
        let report = ResolutionReport::new();
        let state = RunState {
            total: records.len(),
            processed: AtomicUsize::new(0),
            placed: AtomicUsize::new(0),
            consecutive_failures: AtomicUsize::new(0),
            abort_reason: Mutex::new(None),
            cancelled: AtomicBool::new(false),
        };
        info!(records = state.total, workers = self.workers, "starting resolution batch");

        stream::iter(records.into_iter().enumerate())
            .for_each_concurrent(self.workers, |(index, record)| {
                let report = &report;
                let state = &state;
                let cancel_flag = cancel_flag.clone();
                let observer = observer.clone();
                async move {
                    let resolution = self
                        .process(index, record, state, cancel_flag.as_deref())
                        .await;
                    if resolution.coordinate.is_some() {
                        state.placed.fetch_add(1, Ordering::SeqCst);
                    }
                    report.record(resolution);
                    let processed = state.processed.fetch_add(1, Ordering::SeqCst) + 1;
                    if let Some(callback) = &observer {
                        callback(BatchProgress {
                            total: state.total,
                            processed,
                            placed: state.placed.load(Ordering::SeqCst),
                        });
                    }
                }
            })
            .await;

        let status = match state.abort_reason.lock().clone() {
            Some(reason) => BatchStatus::Aborted { reason },
            None if state.cancelled.load(Ordering::SeqCst) => BatchStatus::Cancelled,
            None => BatchStatus::Completed,
        };

        let summary = report.summary();
        info!(
            total = summary.total,
            overridden = summary.overridden,
            resolved = summary.resolved,
            skipped = summary.skipped,
            failed = summary.failed,
            success_rate = summary.success_rate,
            ?status,
            "resolution batch finished"
        );
        report.finish(status, self.profile.clone())
    }

    async fn process(
        &self,
        index: usize,
        record: Record,
        state: &RunState,
        cancel_flag: Option<&AtomicBool>,
    ) -> Resolution {
        if state.abort_reason.lock().is_some() {
            return Resolution::new(record, Method::Failed)
                .at(index)
                .with_note(ABORTED_NOTE);
        }
        if cancel_flag.map(|f| f.load(Ordering::SeqCst)).unwrap_or(false) {
            state.cancelled.store(true, Ordering::SeqCst);
            return Resolution::new(record, Method::Failed)
                .at(index)
                .with_note(CANCELLED_NOTE);
        }

        let resolution = self.resolve_record(record).await.at(index);
        match resolution.method {
            Method::Override | Method::Direct | Method::Fallback(_) => {
                info!(row = resolution.record.row_number, name = %resolution.record.name, method = %resolution.method, "record placed");
            }
            Method::Failed => {
                warn!(
                    row = resolution.record.row_number,
                    name = %resolution.record.name,
                    address = %resolution.record.raw_address,
                    attempts = resolution.attempts.len(),
                    "record could not be geocoded; consider a manual override"
                );
            }
            Method::SkippedMobile | Method::SkippedNoAddress => {
                info!(row = resolution.record.row_number, name = %resolution.record.name, method = %resolution.method, "record skipped");
            }
        }
        self.track_provider_health(&resolution, state);
        resolution
    }

    fn track_provider_health(&self, resolution: &Resolution, state: &RunState) {
        if resolution.attempts.is_empty() {
            return;
        }
        if !resolution.provider_unreachable() {
            state.consecutive_failures.store(0, Ordering::SeqCst);
            return;
        }
        let failures = state.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        if self.consecutive_failure_limit > 0 && failures >= self.consecutive_failure_limit {
            let mut reason = state.abort_reason.lock();
            if reason.is_none() {
                let last_error = FailureDetail::from(resolution)
                    .last_error
                    .unwrap_or_else(|| "unknown error".into());
                let message = format!(
                    "geocoding provider failed on every attempt for {failures} consecutive records \
                     (last: {last_error}); check provider address, network and quota"
                );
                warn!(%message, "aborting resolution batch");
                *reason = Some(message);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::errors::ProviderError;
    use crate::geocoder::tests::{geocoder_for, ScriptedProvider};
    use crate::model::Coordinate;

    const LOUDON: &str = "101 W Loudon Ave Suite 160 Lexington, KY 40508";
    const BETHEL: &str = "121 Bethel Harvest Dr Nicholasville, KY 40356";

    fn engine(provider: Arc<ScriptedProvider>, overrides: ManualOverrideStore) -> ResolutionEngine {
        ResolutionEngine::new(
            MobileVendorFilter::default(),
            overrides,
            AddressNormalizer::default(),
            geocoder_for(provider),
        )
    }

    fn bethel_override() -> ManualOverrideStore {
        ManualOverrideStore::new([(BETHEL, Coordinate::new(37.8814, -84.5730))]).unwrap()
    }

    #[tokio::test]
    async fn override_short_circuits_the_provider() {
        let provider = ScriptedProvider::new(vec![], Ok(Some(Coordinate::new(1.0, 1.0))));
        let engine = engine(provider.clone(), bethel_override());

        let resolution = engine.resolve_record(Record::new("Harvest Coffee", BETHEL)).await;
        assert_eq!(resolution.method, Method::Override);
        assert_eq!(resolution.coordinate, Some(Coordinate::new(37.8814, -84.5730)));
        assert!(resolution.attempts.is_empty());
        assert_eq!(provider.call_count(), 0);
    }

    #[tokio::test]
    async fn mobile_vendors_never_reach_the_provider() {
        let provider = ScriptedProvider::new(vec![], Ok(Some(Coordinate::new(38.0, -84.5))));
        let engine = engine(provider.clone(), ManualOverrideStore::default());

        let by_name = engine
            .resolve_record(Record::new("Rolling Bean Truck", "300 E Main St, Lexington, KY"))
            .await;
        let by_address = engine
            .resolve_record(Record::new("Rolling Bean", "Food TRUCK - various"))
            .await;
        assert_eq!(by_name.method, Method::SkippedMobile);
        assert_eq!(by_address.method, Method::SkippedMobile);
        assert_eq!(provider.call_count(), 0);
    }

    #[tokio::test]
    async fn blank_address_is_skipped() {
        let provider = ScriptedProvider::new(vec![], Ok(None));
        let engine = engine(provider.clone(), ManualOverrideStore::default());
        let resolution = engine.resolve_record(Record::new("Corner Cafe", "  ")).await;
        assert_eq!(resolution.method, Method::SkippedNoAddress);
        assert_eq!(provider.call_count(), 0);
    }

    #[tokio::test]
    async fn second_candidate_success_is_fallback_2() {
        let provider = ScriptedProvider::new(
            vec![Ok(None), Ok(Some(Coordinate::new(38.0447, -84.4989)))],
            Ok(Some(Coordinate::new(1.0, 1.0))),
        );
        let engine = engine(provider.clone(), ManualOverrideStore::default());

        let resolution = engine.resolve_record(Record::new("Loudon Roasters", LOUDON)).await;
        assert_eq!(resolution.method, Method::Fallback(2));
        assert_eq!(resolution.method.label(), "fallback_2");
        assert_eq!(provider.call_count(), 2);
        assert_eq!(resolution.attempts.len(), 2);
        assert_eq!(
            resolution.attempts[0].query.as_str(),
            "101 W Loudon Ave, Suite 160, Lexington, KY 40508"
        );
    }

    #[tokio::test]
    async fn exhausted_candidates_fail_the_record() {
        let provider = ScriptedProvider::new(vec![], Ok(None));
        let engine = engine(provider.clone(), ManualOverrideStore::default());
        let resolution = engine.resolve_record(Record::new("Loudon Roasters", LOUDON)).await;
        let expected = AddressNormalizer::default().generate_candidates(LOUDON).len();
        assert_eq!(resolution.method, Method::Failed);
        assert_eq!(resolution.coordinate, None);
        assert_eq!(provider.call_count(), expected);
    }

    #[tokio::test]
    async fn transient_failures_do_not_stop_the_batch() {
        let unreachable = AddressNormalizer::default().generate_candidates(LOUDON).len();
        let mut script: Vec<Result<Option<Coordinate>, ProviderError>> = (0..unreachable)
            .map(|_| Err(ProviderError::Transient("503".into())))
            .collect();
        script.push(Ok(Some(Coordinate::new(38.2, -84.25))));
        let provider = ScriptedProvider::new(script, Ok(None));
        let engine = engine(provider.clone(), ManualOverrideStore::default())
            .with_consecutive_failure_limit(3);

        let report = engine
            .run(
                vec![
                    Record::new("Loudon Roasters", LOUDON),
                    Record::new("Paris Perk", "701 Main St, Paris, KY 40361"),
                ],
                None,
                None,
            )
            .await;

        assert_eq!(report.status, BatchStatus::Completed);
        assert_eq!(report.resolutions[0].method, Method::Failed);
        assert!(report.resolutions[0].provider_unreachable());
        assert_eq!(report.resolutions[1].method, Method::Direct);
        assert_eq!(report.summary.failed, 1);
        assert_eq!(report.summary.resolved, 1);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].queries.len(), unreachable);
    }

    #[tokio::test]
    async fn repeated_provider_failures_abort_the_batch() {
        let provider = ScriptedProvider::new(vec![], Err(ProviderError::Transient("refused".into())));
        let engine = engine(provider.clone(), bethel_override()).with_consecutive_failure_limit(2);

        let records = vec![
            Record::new("A", "1 Main St, Paris, KY"),
            Record::new("B", "2 Main St, Paris, KY"),
            Record::new("C", "3 Main St, Paris, KY"),
            Record::new("D", BETHEL),
        ];
        let report = engine.run(records, None, None).await;

        assert!(matches!(report.status, BatchStatus::Aborted { .. }));
        assert_eq!(report.resolutions.len(), 4);
        assert_eq!(report.resolutions[2].note.as_deref(), Some(ABORTED_NOTE));
        assert_eq!(report.resolutions[3].method, Method::Failed);
        assert_eq!(report.summary.failed, 4);
    }

    #[tokio::test]
    async fn cancellation_marks_remaining_records_failed() {
        let provider = ScriptedProvider::new(vec![], Ok(Some(Coordinate::new(38.0, -84.5))));
        let engine = engine(provider.clone(), ManualOverrideStore::default());
        let cancel = Arc::new(AtomicBool::new(false));
        let flag = cancel.clone();
        let observer: ProgressObserver = Arc::new(move |progress: BatchProgress| {
            if progress.processed == 1 {
                flag.store(true, Ordering::SeqCst);
            }
        });

        let records = (1..=3)
            .map(|n| Record::new(format!("Shop {n}"), format!("{n} Main St, Paris, KY")))
            .collect();
        let report = engine.run(records, Some(observer), Some(cancel)).await;

        assert_eq!(report.status, BatchStatus::Cancelled);
        assert_eq!(report.summary.resolved, 1);
        assert_eq!(report.summary.failed, 2);
        assert_eq!(provider.call_count(), 1);
        assert_eq!(report.resolutions[1].note.as_deref(), Some(CANCELLED_NOTE));
    }

    #[tokio::test]
    async fn identical_batches_produce_identical_reports() {
        let records = vec![
            Record::new("Harvest Coffee", BETHEL),
            Record::new("Loudon Roasters", LOUDON),
            Record::new("Bean Cart", ""),
            Record::new("Quiet Corner", "77 Nowhere Ln"),
        ];
        let run = || {
            let records = records.clone();
            async move {
                let provider = ScriptedProvider::new(
                    vec![Ok(None), Ok(Some(Coordinate::new(38.0447, -84.4989)))],
                    Ok(None),
                );
                engine(provider, bethel_override())
                    .run(records, None, None)
                    .await
            }
        };
        let first = run().await;
        let second = run().await;
        assert_eq!(first.summary, second.summary);
        assert_eq!(first.resolutions, second.resolutions);
        assert_eq!(first.failures, second.failures);
    }

    #[tokio::test]
    async fn worker_pool_keeps_batch_order() {
        let provider = ScriptedProvider::slow(Duration::from_millis(20));
        let engine = engine(provider.clone(), ManualOverrideStore::default()).with_workers(4);
        let records: Vec<Record> = (0..8)
            .map(|n| Record::new(format!("Shop {n}"), format!("{n}0 Elm Way, Paris, KY")))
            .collect();

        let report = engine.run(records.clone(), None, None).await;
        let names: Vec<&str> = report.resolutions.iter().map(|r| r.record.name.as_str()).collect();
        let expected: Vec<&str> = records.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, expected);
        assert_eq!(report.summary.resolved, 8);
        assert_eq!(provider.call_count(), 8);
    }
}
