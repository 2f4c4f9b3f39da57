mod config;
mod engine;
mod errors;
mod feed;
mod geocoder;
mod mobile;
mod model;
mod nominatim;
mod normalizer;
mod overrides;
mod provider;
mod report;

use once_cell::sync::OnceCell;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub use config::{EngineConfig, PublicEngineConfig};
pub use engine::{BatchProgress, ProgressObserver, ResolutionEngine};
pub use errors::{AppError, AppResult, ProviderError};
pub use feed::{load_feed, parse_feed};
pub use geocoder::{FallbackGeocoder, GeocodeOutcome};
pub use mobile::{MobileVendorFilter, DEFAULT_MOBILE_KEYWORDS};
pub use model::{AddressCandidate, BoundingBox, Coordinate, PlausibilityBound, Record};
pub use nominatim::NominatimClient;
pub use normalizer::{AddressNormalizer, RegionHint, DEFAULT_STREET_TYPES};
pub use overrides::ManualOverrideStore;
pub use provider::{GeocodeProvider, GeocodingService, RateLimiter};
pub use report::{
    Attempt, AttemptOutcome, BatchReport, BatchStatus, FailureDetail, Method, Resolution,
    ResolutionReport, Summary,
};

pub fn init_tracing() {
    static INIT: OnceCell<()> = OnceCell::new();
    let _ = INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info,address_resolver=debug"));
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    });
}
