//! Normalization, ingestion, review and scheduled feed runs on top of a [`JobStore`].
//!
//! [`JobStore`]: jobdesk_storage::JobStore

pub mod config;
pub mod ingest;
pub mod normalize;
pub mod review;
pub mod schedule;

pub use config::{GeocoderKind, PipelineConfig};
pub use ingest::{BatchReport, IngestError, IngestPipeline};
pub use normalize::{
    parse_salary, DateParser, FuzzyDateParser, GeoPoint, GeocodeError, Geocoder, NoopGeocoder,
    NominatimGeocoder, Normalizer, TagRule, TagRules, TagScope,
};
pub use review::{ReviewError, ReviewWorkflow, AUDIT_TARGET};
pub use schedule::{FeedRunSummary, FeedScheduler};

pub const CRATE_NAME: &str = "jobdesk-pipeline";
