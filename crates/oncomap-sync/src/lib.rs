//! Refresh engine and scheduler.
//!
//! Composes the Overpass client, element normalizer, company matcher,
//! Wikidata enrichment, and the store into the per-center refresh pipeline,
//! plus the cursor-driven batch walk the scheduler triggers.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

use oncomap_adapters::{
    normalize_elements, HttpOverpassClient, HttpWikidataClient, OverpassApi, WikidataApi,
    DEFAULT_OVERPASS_URL, DEFAULT_WIKIDATA_API_URL,
};
use oncomap_core::geo::haversine_meters;
use oncomap_core::time::now_iso;
use oncomap_core::{Center, CenterOfficeLink, Office, OfficeKey};
use oncomap_match::{filter_offices_with_known_companies, CompanyIndex};
use oncomap_storage::Store;

pub const CRATE_NAME: &str = "oncomap-sync";

/// Radii an operator may request, in kilometers.
pub const ALLOWED_RADII_KM: [u32; 4] = [10, 25, 50, 100];
pub const MAX_OFFICES_CAP: usize = 10_000;

const THROTTLE_MS_MAX: u64 = 15_000;
const RETRY_DELAY_MS_MAX: u64 = 60_000;
const BATCH_SIZE_MIN: i64 = 1;
const BATCH_SIZE_MAX: i64 = 200;

/// Environment-driven engine configuration.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub overpass_urls: Vec<String>,
    pub overpass_timeout_secs: u64,
    pub default_radius_m: u32,
    pub batch_centers_per_run: i64,
    pub overpass_throttle_ms: u64,
    pub center_retry_count: u32,
    pub center_retry_delay_ms: u64,
    pub stale_link_days: i64,
    pub wikidata_api_url: String,
    pub wikidata_timeout_secs: u64,
    pub wikidata_enrich_enabled: bool,
    pub wikidata_max_ids_per_center: usize,
    pub wikidata_stale_days: i64,
    pub wikidata_throttle_ms: u64,
    pub scheduler_enabled: bool,
    pub refresh_cron: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            overpass_urls: vec![DEFAULT_OVERPASS_URL.to_string()],
            overpass_timeout_secs: 30,
            default_radius_m: 100_000,
            batch_centers_per_run: 10,
            overpass_throttle_ms: 1200,
            center_retry_count: 3,
            center_retry_delay_ms: 2000,
            stale_link_days: 30,
            wikidata_api_url: DEFAULT_WIKIDATA_API_URL.to_string(),
            wikidata_timeout_secs: 30,
            wikidata_enrich_enabled: true,
            wikidata_max_ids_per_center: 30,
            wikidata_stale_days: 14,
            wikidata_throttle_ms: 250,
            scheduler_enabled: false,
            refresh_cron: "0 0 * * * *".to_string(),
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            overpass_urls: std::env::var("OVERPASS_URL")
                .map(|raw| HttpOverpassClient::parse_endpoint_list(&raw))
                .ok()
                .filter(|urls| !urls.is_empty())
                .unwrap_or(defaults.overpass_urls),
            overpass_timeout_secs: env_u64("OVERPASS_TIMEOUT_SECS", defaults.overpass_timeout_secs),
            default_radius_m: env_u64("DEFAULT_RADIUS_M", u64::from(defaults.default_radius_m))
                as u32,
            batch_centers_per_run: env_i64(
                "BATCH_CENTERS_PER_RUN",
                defaults.batch_centers_per_run,
            )
            .clamp(BATCH_SIZE_MIN, BATCH_SIZE_MAX),
            overpass_throttle_ms: env_u64("OVERPASS_THROTTLE_MS", defaults.overpass_throttle_ms)
                .min(THROTTLE_MS_MAX),
            center_retry_count: env_u64(
                "REFRESH_CENTER_RETRY_COUNT",
                u64::from(defaults.center_retry_count),
            ) as u32,
            center_retry_delay_ms: env_u64(
                "REFRESH_CENTER_RETRY_DELAY_MS",
                defaults.center_retry_delay_ms,
            )
            .min(RETRY_DELAY_MS_MAX),
            stale_link_days: env_i64("STALE_LINK_DAYS", defaults.stale_link_days),
            wikidata_api_url: std::env::var("WIKIDATA_API_URL")
                .unwrap_or(defaults.wikidata_api_url),
            wikidata_timeout_secs: env_u64("WIKIDATA_TIMEOUT_SECS", defaults.wikidata_timeout_secs),
            wikidata_enrich_enabled: env_bool(
                "WIKIDATA_ENRICH_ENABLED",
                defaults.wikidata_enrich_enabled,
            ),
            wikidata_max_ids_per_center: env_u64(
                "WIKIDATA_ENRICH_MAX_IDS_PER_CENTER",
                defaults.wikidata_max_ids_per_center as u64,
            ) as usize,
            wikidata_stale_days: env_i64(
                "WIKIDATA_ENRICH_STALE_DAYS",
                defaults.wikidata_stale_days,
            ),
            wikidata_throttle_ms: env_u64(
                "WIKIDATA_ENRICH_THROTTLE_MS",
                defaults.wikidata_throttle_ms,
            ),
            scheduler_enabled: env_bool("REFRESH_SCHEDULER_ENABLED", defaults.scheduler_enabled),
            refresh_cron: std::env::var("REFRESH_CRON").unwrap_or(defaults.refresh_cron),
        }
    }
}

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_i64(name: &str, default: i64) -> i64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_bool(name: &str, default: bool) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(default)
}

/// Per-center options supplied by the admin API.
#[derive(Debug, Clone, Copy, Default)]
pub struct RefreshCenterOptions {
    pub radius_m: Option<u32>,
    pub max_offices: Option<usize>,
}

/// Options for the full sweep.
#[derive(Debug, Clone, Copy, Default)]
pub struct RefreshAllOptions {
    pub throttle_ms: Option<u64>,
    pub batch_size: Option<i64>,
    pub radius_km: Option<u32>,
    pub max_offices: Option<usize>,
    pub full_clean: bool,
    pub center_retry_count: Option<u32>,
    pub retry_delay_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RefreshCenterSummary {
    pub center_id: i64,
    pub center_code: String,
    pub offices_fetched: usize,
    pub offices_matched: usize,
    pub offices_filtered_out_no_company_match: usize,
    pub links_upserted: u64,
    pub pruned_links: u64,
    pub wikidata_entities_fetched: usize,
    pub wikidata_offices_updated: u64,
}

/// Aggregate of per-center counts across a batch or sweep.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct RefreshTotals {
    pub offices_fetched: usize,
    pub offices_matched: usize,
    pub offices_filtered_out_no_company_match: usize,
    pub links_upserted: u64,
    pub pruned_links: u64,
    pub wikidata_entities_fetched: usize,
    pub wikidata_offices_updated: u64,
}

impl RefreshTotals {
    fn absorb(&mut self, summary: &RefreshCenterSummary) {
        self.offices_fetched += summary.offices_fetched;
        self.offices_matched += summary.offices_matched;
        self.offices_filtered_out_no_company_match +=
            summary.offices_filtered_out_no_company_match;
        self.links_upserted += summary.links_upserted;
        self.pruned_links += summary.pruned_links;
        self.wikidata_entities_fetched += summary.wikidata_entities_fetched;
        self.wikidata_offices_updated += summary.wikidata_offices_updated;
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ScheduledRefreshSummary {
    pub centers_processed: usize,
    pub centers_failed: usize,
    pub cursor: i64,
    pub cursor_reset: bool,
    #[serde(flatten)]
    pub totals: RefreshTotals,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RefreshAllSummary {
    pub ok: bool,
    pub centers_processed: usize,
    pub centers_failed: usize,
    #[serde(flatten)]
    pub totals: RefreshTotals,
}

/// The per-center refresh pipeline plus its batch drivers.
pub struct RefreshEngine {
    store: Store,
    overpass: Arc<dyn OverpassApi>,
    wikidata: Arc<dyn WikidataApi>,
    config: SyncConfig,
}

impl RefreshEngine {
    pub fn new(
        store: Store,
        overpass: Arc<dyn OverpassApi>,
        wikidata: Arc<dyn WikidataApi>,
        config: SyncConfig,
    ) -> Self {
        Self {
            store,
            overpass,
            wikidata,
            config,
        }
    }

    /// Wire up production HTTP clients from the config.
    pub fn from_config(store: Store, config: SyncConfig) -> Result<Self> {
        let overpass = HttpOverpassClient::new(
            config.overpass_urls.clone(),
            Duration::from_secs(config.overpass_timeout_secs),
        )
        .context("building overpass client")?;
        let wikidata = HttpWikidataClient::new(
            config.wikidata_api_url.clone(),
            Duration::from_secs(config.wikidata_timeout_secs),
            Duration::from_millis(config.wikidata_throttle_ms),
        )
        .context("building wikidata client")?;
        Ok(Self::new(store, Arc::new(overpass), Arc::new(wikidata), config))
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Refresh one center: fetch, normalize, cap, match, ban-filter, upsert,
    /// enrich, prune.
    pub async fn refresh_center(
        &self,
        center: &Center,
        opts: RefreshCenterOptions,
        company_index: &CompanyIndex,
        banned: &HashSet<OfficeKey>,
    ) -> Result<RefreshCenterSummary> {
        let radius_m = opts.radius_m.unwrap_or(self.config.default_radius_m);
        let max_offices = opts.max_offices.map(|m| m.clamp(1, MAX_OFFICES_CAP));

        let elements = self
            .overpass
            .fetch_elements(center.lat, center.lon, radius_m)
            .await
            .with_context(|| format!("fetching offices for center {}", center.center_code))?;
        let mut offices = normalize_elements(elements);
        let offices_fetched = offices.len();

        if let Some(max) = max_offices {
            if offices.len() > max {
                offices.sort_by(|a, b| {
                    let da = haversine_meters(center.lat, center.lon, a.lat, a.lon);
                    let db = haversine_meters(center.lat, center.lon, b.lat, b.lon);
                    da.total_cmp(&db)
                });
                offices.truncate(max);
            }
        }

        let filtered = filter_offices_with_known_companies(company_index, offices);
        let offices_matched = filtered.matched_count;
        let offices_filtered_out = filtered.filtered_out_count;

        let survivors: Vec<Office> = filtered
            .matched
            .into_iter()
            .map(|(office, _)| office)
            .filter(|office| !banned.contains(&office.key()))
            .collect();

        let seen_at = now_iso();
        let mut links_upserted = 0u64;
        let mut wikidata_entities_fetched = 0usize;
        let mut wikidata_offices_updated = 0u64;

        if !survivors.is_empty() {
            let links: Vec<CenterOfficeLink> = survivors
                .iter()
                .map(|office| CenterOfficeLink {
                    center_id: center.id,
                    osm_type: office.osm_type,
                    osm_id: office.osm_id,
                    distance_m: haversine_meters(center.lat, center.lon, office.lat, office.lon),
                    last_seen: seen_at.clone(),
                })
                .collect();
            links_upserted = self.store.upsert_offices_and_links(&survivors, &links).await?;

            // Enrichment failures are logged and swallowed; they never fail
            // the center.
            match self.enrich_survivors(&survivors).await {
                Ok((fetched, updated)) => {
                    wikidata_entities_fetched = fetched;
                    wikidata_offices_updated = updated;
                }
                Err(err) => {
                    warn!(
                        center_code = %center.center_code,
                        error = %err,
                        "wikidata enrichment failed"
                    );
                }
            }
        }

        let mut pruned_links = self
            .store
            .prune_center_links_not_seen_since(center.id, &seen_at)
            .await?;
        pruned_links += self
            .store
            .prune_stale_center_links(center.id, self.config.stale_link_days)
            .await?;

        let summary = RefreshCenterSummary {
            center_id: center.id,
            center_code: center.center_code.clone(),
            offices_fetched,
            offices_matched,
            offices_filtered_out_no_company_match: offices_filtered_out,
            links_upserted,
            pruned_links,
            wikidata_entities_fetched,
            wikidata_offices_updated,
        };
        info!(
            center_code = %summary.center_code,
            offices_fetched = summary.offices_fetched,
            offices_matched = summary.offices_matched,
            filtered_out = summary.offices_filtered_out_no_company_match,
            links_upserted = summary.links_upserted,
            pruned_links = summary.pruned_links,
            wikidata_entities = summary.wikidata_entities_fetched,
            "center refreshed"
        );
        Ok(summary)
    }

    async fn enrich_survivors(&self, survivors: &[Office]) -> Result<(usize, u64)> {
        if !self.config.wikidata_enrich_enabled {
            return Ok((0, 0));
        }
        let mut candidate_ids: Vec<String> = survivors
            .iter()
            .filter_map(|office| office.wikidata_entity_id.clone())
            .collect();
        candidate_ids.sort();
        candidate_ids.dedup();
        if candidate_ids.is_empty() {
            return Ok((0, 0));
        }

        let stale_ids = self
            .store
            .list_stale_wikidata_entity_ids(
                &candidate_ids,
                self.config.wikidata_stale_days,
                self.config.wikidata_max_ids_per_center,
            )
            .await?;
        if stale_ids.is_empty() {
            return Ok((0, 0));
        }

        let facts = self
            .wikidata
            .fetch_entity_facts(&stale_ids)
            .await
            .context("fetching wikidata claims")?;
        let updated = self.store.apply_wikidata_enrichment(&facts, &now_iso()).await?;
        Ok((facts.len(), updated))
    }

    /// Refresh one center by id for the admin API. `Ok(None)` when the
    /// center is missing or inactive.
    pub async fn refresh_center_by_id(
        &self,
        center_id: i64,
        opts: RefreshCenterOptions,
    ) -> Result<Option<RefreshCenterSummary>> {
        let Some(center) = self.store.get_center_by_id(center_id).await? else {
            return Ok(None);
        };
        if !center.is_active {
            return Ok(None);
        }
        let (index, banned) = self.load_matching_snapshot().await?;
        let summary = self.refresh_center(&center, opts, &index, &banned).await?;
        Ok(Some(summary))
    }

    /// One scheduled batch: resume at the cursor, process up to
    /// `batch_centers_per_run` active centers, advance the cursor last.
    pub async fn run_scheduled_refresh(&self) -> Result<ScheduledRefreshSummary> {
        let cursor = self.store.get_refresh_cursor().await?;
        let centers = self
            .store
            .list_active_centers_after(cursor, self.config.batch_centers_per_run)
            .await?;

        if centers.is_empty() {
            self.store.set_refresh_cursor(0).await?;
            info!(cursor, "scheduled refresh wrapped; cursor reset");
            return Ok(ScheduledRefreshSummary {
                cursor: 0,
                cursor_reset: true,
                ..ScheduledRefreshSummary::default()
            });
        }

        let (index, banned) = self.load_matching_snapshot().await?;
        let mut summary = ScheduledRefreshSummary::default();
        let center_count = centers.len();

        for (position, center) in centers.iter().enumerate() {
            match self
                .refresh_center(center, RefreshCenterOptions::default(), &index, &banned)
                .await
            {
                Ok(center_summary) => {
                    summary.centers_processed += 1;
                    summary.totals.absorb(&center_summary);
                }
                Err(err) => {
                    summary.centers_failed += 1;
                    error!(
                        center_code = %center.center_code,
                        error = %err,
                        "center refresh failed; continuing batch"
                    );
                }
            }
            if position + 1 < center_count {
                self.throttle(self.config.overpass_throttle_ms).await;
            }
        }

        let last_id = centers.last().map(|c| c.id).unwrap_or(cursor);
        self.store.set_refresh_cursor(last_id).await?;
        summary.cursor = last_id;
        Ok(summary)
    }

    /// Full sweep over every active center with per-center retries.
    pub async fn run_refresh_all(&self, opts: RefreshAllOptions) -> Result<RefreshAllSummary> {
        let throttle_ms = opts
            .throttle_ms
            .unwrap_or(self.config.overpass_throttle_ms)
            .min(THROTTLE_MS_MAX);
        let batch_size = opts
            .batch_size
            .unwrap_or(self.config.batch_centers_per_run)
            .clamp(BATCH_SIZE_MIN, BATCH_SIZE_MAX);
        let retry_count = opts
            .center_retry_count
            .unwrap_or(self.config.center_retry_count);
        let retry_delay_ms = opts
            .retry_delay_ms
            .unwrap_or(self.config.center_retry_delay_ms)
            .min(RETRY_DELAY_MS_MAX);
        let center_opts = RefreshCenterOptions {
            radius_m: opts.radius_km.map(|km| km * 1000),
            max_offices: opts.max_offices,
        };

        if opts.full_clean {
            info!("full-clean refresh: purging all office points");
            self.store.purge_all_office_points().await?;
        }

        let mut summary = RefreshAllSummary::default();
        let mut cursor = 0i64;

        loop {
            let centers = self
                .store
                .list_active_centers_after(cursor, batch_size)
                .await?;
            if centers.is_empty() {
                break;
            }
            let (index, banned) = self.load_matching_snapshot().await?;
            let center_count = centers.len();

            for (position, center) in centers.iter().enumerate() {
                let mut succeeded = false;
                for attempt in 1..=retry_count + 1 {
                    match self.refresh_center(center, center_opts, &index, &banned).await {
                        Ok(center_summary) => {
                            summary.centers_processed += 1;
                            summary.totals.absorb(&center_summary);
                            succeeded = true;
                            break;
                        }
                        Err(err) => {
                            warn!(
                                center_code = %center.center_code,
                                attempt,
                                error = %err,
                                "center refresh attempt failed"
                            );
                            if attempt < retry_count + 1 {
                                self.throttle(retry_delay_ms).await;
                            }
                        }
                    }
                }
                if !succeeded {
                    summary.centers_failed += 1;
                    error!(
                        center_code = %center.center_code,
                        "center refresh exhausted retries"
                    );
                }
                if position + 1 < center_count {
                    self.throttle(throttle_ms).await;
                }
            }

            cursor = centers.last().map(|c| c.id).unwrap_or(cursor);
            self.store.set_refresh_cursor(cursor).await?;
        }

        summary.ok = summary.centers_failed == 0;
        Ok(summary)
    }

    /// Company index and banned set, loaded once per batch and treated as
    /// immutable snapshots for its duration.
    async fn load_matching_snapshot(&self) -> Result<(CompanyIndex, HashSet<OfficeKey>)> {
        let companies = self.store.list_companies(None).await?;
        let index = CompanyIndex::build(&companies);
        let banned = self.store.banned_office_keys().await?;
        Ok((index, banned))
    }

    async fn throttle(&self, ms: u64) {
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }
}

/// Build (but do not start) the periodic refresh job when enabled.
pub async fn maybe_build_scheduler(engine: Arc<RefreshEngine>) -> Result<Option<JobScheduler>> {
    if !engine.config().scheduler_enabled {
        return Ok(None);
    }

    let cron = engine.config().refresh_cron.clone();
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async(cron.as_str(), move |_uuid, _lock| {
        let engine = engine.clone();
        Box::pin(async move {
            match engine.run_scheduled_refresh().await {
                Ok(summary) => info!(
                    centers_processed = summary.centers_processed,
                    centers_failed = summary.centers_failed,
                    cursor = summary.cursor,
                    "scheduled refresh batch complete"
                ),
                Err(err) => error!(error = %err, "scheduled refresh batch failed"),
            }
        })
    })
    .with_context(|| format!("creating refresh job for cron `{cron}`"))?;
    sched.add(job).await.context("adding refresh job")?;
    Ok(Some(sched))
}
