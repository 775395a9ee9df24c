//! Upstream clients and element normalization.
//!
//! Two external collaborators live here behind `async_trait` seams so the
//! refresh engine can take scripted stubs in tests: the Overpass tag-store
//! (office discovery) and the Wikidata entity API (enrichment).

mod normalize;
mod overpass;
mod wikidata;

pub use normalize::normalize_elements;
pub use overpass::{
    build_radius_query, ElementCenter, HttpOverpassClient, OverpassApi, OverpassError,
    RawElement, DEFAULT_OVERPASS_URL,
};
pub use wikidata::{
    HttpWikidataClient, WikidataApi, WikidataError, DEFAULT_WIKIDATA_API_URL,
};

use std::time::Duration;

/// Backoff before retry `attempt` (1-based): 400 ms, 800 ms, ...
pub(crate) fn retry_delay(attempt: u32) -> Duration {
    Duration::from_millis(400 * u64::from(attempt))
}

pub const CRATE_NAME: &str = "oncomap-adapters";
