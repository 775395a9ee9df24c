//! SQLite persistence for oncomap.
//!
//! Every operation is a prepared statement or a transactional batch over
//! one shared [`SqlitePool`]. Statements bind at call time; multi-statement
//! writes always run inside `BEGIN … COMMIT` and roll back on error.

mod migrations;


use std::collections::HashSet;
use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Row, SqlitePool};
use thiserror::Error;
use tracing::info;

use oncomap_core::csv::{CenterCsvRow, CompanyCsvRow};
use oncomap_core::time::{iso_days_ago, now_iso};
use oncomap_core::{
    Center, CenterOfficeLink, CenterUpsertOutcome, Company, CompanyInsertOutcome,
    FlagDecisionOutcome, FlagStatus, FlagSubmitOutcome, Office, OfficeDeletionFlag, OfficeKey,
    OsmType, WikidataFacts,
};

pub const CURSOR_KEY: &str = "center_cursor";

/// Rows per multi-row VALUES statement in batched upserts.
const UPSERT_CHUNK: usize = 80;
const SEARCH_MAX_CHARS: usize = 120;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("corrupt row: {0}")]
    InvalidRow(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// An office joined with its link distance for one center.
#[derive(Debug, Clone, PartialEq)]
pub struct OfficeWithDistance {
    pub office: Office,
    pub distance_m: f64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StatusCounts {
    pub centers_total: i64,
    pub active_centers: i64,
    pub offices_total: Option<i64>,
    pub center_office_links_total: Option<i64>,
}

/// Shared handle over the database. Cloning is cheap.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub async fn open(path: &str) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5))
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        info!(path, "database pool created");
        Ok(Self { pool })
    }

    /// Single-connection in-memory store for tests.
    pub async fn open_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    /// Apply pending migrations in lexical order; returns how many ran.
    pub async fn migrate(&self) -> Result<usize> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS applied_migrations (\
             name TEXT PRIMARY KEY, applied_at TEXT NOT NULL)",
        )
        .execute(&self.pool)
        .await?;

        let mut applied = 0;
        for migration in migrations::MIGRATIONS {
            let already: Option<i64> =
                sqlx::query_scalar("SELECT 1 FROM applied_migrations WHERE name = ?")
                    .bind(migration.name)
                    .fetch_optional(&self.pool)
                    .await?;
            if already.is_some() {
                continue;
            }
            let mut tx = self.pool.begin().await?;
            sqlx::raw_sql(migration.sql).execute(&mut *tx).await?;
            sqlx::query("INSERT INTO applied_migrations (name, applied_at) VALUES (?, ?)")
                .bind(migration.name)
                .bind(now_iso())
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            info!(name = migration.name, "applied migration");
            applied += 1;
        }
        Ok(applied)
    }

    // ── centers ──────────────────────────────────────────────────────────

    pub async fn list_centers(
        &self,
        tier: Option<&str>,
        active_only: bool,
    ) -> Result<Vec<Center>> {
        let mut sql = String::from("SELECT * FROM centers WHERE 1=1");
        if active_only {
            sql.push_str(" AND is_active = 1");
        }
        if tier.is_some() {
            sql.push_str(" AND tier = ?");
        }
        sql.push_str(" ORDER BY name ASC");

        let mut query = sqlx::query(&sql);
        if let Some(tier) = tier {
            query = query.bind(tier);
        }
        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(center_from_row).collect()
    }

    pub async fn get_center_by_id(&self, id: i64) -> Result<Option<Center>> {
        let row = sqlx::query("SELECT * FROM centers WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(center_from_row).transpose()
    }

    /// Active centers with `id > cursor`, in id order.
    pub async fn list_active_centers_after(
        &self,
        cursor: i64,
        limit: i64,
    ) -> Result<Vec<Center>> {
        let rows = sqlx::query(
            "SELECT * FROM centers WHERE is_active = 1 AND id > ? ORDER BY id ASC LIMIT ?",
        )
        .bind(cursor)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(center_from_row).collect()
    }

    /// Upsert by `center_code`, re-activating and stamping the sync token.
    pub async fn upsert_center_from_csv(
        &self,
        row: &CenterCsvRow,
        sync_token: &str,
    ) -> Result<CenterUpsertOutcome> {
        let now = now_iso();
        let mut tx = self.pool.begin().await?;
        let existing: Option<i64> = sqlx::query_scalar("SELECT id FROM centers WHERE center_code = ?")
            .bind(&row.center_code)
            .fetch_optional(&mut *tx)
            .await?;

        let outcome = match existing {
            Some(id) => {
                sqlx::query(
                    "UPDATE centers SET name = ?, tier = ?, lat = ?, lon = ?, country = ?, \
                     region = ?, source_url = ?, is_active = 1, last_csv_sync_token = ?, \
                     updated_at = ? WHERE id = ?",
                )
                .bind(&row.name)
                .bind(&row.tier)
                .bind(row.lat)
                .bind(row.lon)
                .bind(&row.country)
                .bind(&row.region)
                .bind(&row.source_url)
                .bind(sync_token)
                .bind(&now)
                .bind(id)
                .execute(&mut *tx)
                .await?;
                CenterUpsertOutcome::Updated
            }
            None => {
                sqlx::query(
                    "INSERT INTO centers (center_code, name, tier, lat, lon, country, region, \
                     source_url, is_active, last_csv_sync_token, created_at, updated_at) \
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?, 1, ?, ?, ?)",
                )
                .bind(&row.center_code)
                .bind(&row.name)
                .bind(&row.tier)
                .bind(row.lat)
                .bind(row.lon)
                .bind(&row.country)
                .bind(&row.region)
                .bind(&row.source_url)
                .bind(sync_token)
                .bind(&now)
                .bind(&now)
                .execute(&mut *tx)
                .await?;
                CenterUpsertOutcome::Inserted
            }
        };
        tx.commit().await?;
        Ok(outcome)
    }

    /// Soft-disable every active center the current sync did not touch.
    pub async fn disable_centers_missing_from_sync(&self, sync_token: &str) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE centers SET is_active = 0, updated_at = ? \
             WHERE is_active = 1 \
             AND (last_csv_sync_token IS NULL OR last_csv_sync_token != ?)",
        )
        .bind(now_iso())
        .bind(sync_token)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    // ── companies ────────────────────────────────────────────────────────

    pub async fn insert_company_from_csv(
        &self,
        row: &CompanyCsvRow,
    ) -> Result<CompanyInsertOutcome> {
        let result = sqlx::query(
            "INSERT INTO companies (company_name, company_name_normalized, known_aliases, \
             hq_country, description, company_type, geography, industry, suitability_tier) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(company_name_normalized) DO NOTHING",
        )
        .bind(&row.company_name)
        .bind(&row.company_name_normalized)
        .bind(&row.known_aliases)
        .bind(&row.hq_country)
        .bind(&row.description)
        .bind(&row.company_type)
        .bind(&row.geography)
        .bind(&row.industry)
        .bind(&row.suitability_tier)
        .execute(&self.pool)
        .await?;
        Ok(if result.rows_affected() == 0 {
            CompanyInsertOutcome::Skipped
        } else {
            CompanyInsertOutcome::Inserted
        })
    }

    pub async fn list_companies(&self, limit: Option<i64>) -> Result<Vec<Company>> {
        let mut sql = String::from("SELECT * FROM companies ORDER BY company_name ASC");
        if limit.is_some() {
            sql.push_str(" LIMIT ?");
        }
        let mut query = sqlx::query(&sql);
        if let Some(limit) = limit {
            query = query.bind(limit);
        }
        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(company_from_row).collect()
    }

    // ── offices & links ──────────────────────────────────────────────────

    /// Batched transactional upsert. Office conflicts update the refresh
    /// fields only, leaving enrichment columns intact; link conflicts
    /// overwrite `distance_m` and `last_seen`.
    pub async fn upsert_offices_and_links(
        &self,
        offices: &[Office],
        links: &[CenterOfficeLink],
    ) -> Result<u64> {
        let now = now_iso();
        let mut tx = self.pool.begin().await?;

        for chunk in offices.chunks(UPSERT_CHUNK) {
            let placeholders = vec!["(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"; chunk.len()];
            let sql = format!(
                "INSERT INTO offices (osm_type, osm_id, name, brand, operator, website, \
                 wikidata, wikidata_entity_id, lat, lon, low_confidence, tags_json, updated_at) \
                 VALUES {} \
                 ON CONFLICT(osm_type, osm_id) DO UPDATE SET \
                 name = excluded.name, brand = excluded.brand, operator = excluded.operator, \
                 website = excluded.website, wikidata = excluded.wikidata, \
                 wikidata_entity_id = excluded.wikidata_entity_id, lat = excluded.lat, \
                 lon = excluded.lon, low_confidence = excluded.low_confidence, \
                 tags_json = excluded.tags_json, updated_at = excluded.updated_at",
                placeholders.join(", ")
            );
            let mut query = sqlx::query(&sql);
            for office in chunk {
                query = query
                    .bind(office.osm_type.as_str())
                    .bind(office.osm_id)
                    .bind(&office.name)
                    .bind(&office.brand)
                    .bind(&office.operator)
                    .bind(&office.website)
                    .bind(&office.wikidata)
                    .bind(&office.wikidata_entity_id)
                    .bind(office.lat)
                    .bind(office.lon)
                    .bind(office.low_confidence as i64)
                    .bind(&office.tags_json)
                    .bind(&now);
            }
            query.execute(&mut *tx).await?;
        }

        let mut links_upserted = 0u64;
        for chunk in links.chunks(UPSERT_CHUNK) {
            let placeholders = vec!["(?, ?, ?, ?, ?)"; chunk.len()];
            let sql = format!(
                "INSERT INTO center_office (center_id, osm_type, osm_id, distance_m, last_seen) \
                 VALUES {} \
                 ON CONFLICT(center_id, osm_type, osm_id) DO UPDATE SET \
                 distance_m = excluded.distance_m, last_seen = excluded.last_seen",
                placeholders.join(", ")
            );
            let mut query = sqlx::query(&sql);
            for link in chunk {
                query = query
                    .bind(link.center_id)
                    .bind(link.osm_type.as_str())
                    .bind(link.osm_id)
                    .bind(link.distance_m)
                    .bind(&link.last_seen);
            }
            query.execute(&mut *tx).await?;
            links_upserted += chunk.len() as u64;
        }

        tx.commit().await?;
        Ok(links_upserted)
    }

    /// Offices linked to a center within `radius_m`, nearest first, with
    /// banned offices excluded and near-identical duplicates collapsed.
    pub async fn list_offices_for_center(
        &self,
        center_id: i64,
        radius_m: f64,
        limit: Option<i64>,
        high_confidence_only: bool,
        search: Option<&str>,
    ) -> Result<Vec<OfficeWithDistance>> {
        let mut sql = String::from(
            "SELECT o.*, l.distance_m AS link_distance_m FROM center_office l \
             JOIN offices o ON o.osm_type = l.osm_type AND o.osm_id = l.osm_id \
             WHERE l.center_id = ? AND l.distance_m <= ? \
             AND o.name IS NOT NULL AND o.name != '' \
             AND NOT EXISTS (SELECT 1 FROM banned_offices b \
                             WHERE b.osm_type = o.osm_type AND b.osm_id = o.osm_id)",
        );
        if high_confidence_only {
            sql.push_str(" AND o.low_confidence = 0");
        }
        if search.is_some() {
            sql.push_str(" AND o.name LIKE ? ESCAPE '\\' COLLATE NOCASE");
        }
        sql.push_str(" ORDER BY l.distance_m ASC");
        if limit.is_some() {
            sql.push_str(" LIMIT ?");
        }

        let mut query = sqlx::query(&sql).bind(center_id).bind(radius_m);
        if let Some(search) = search {
            query = query.bind(escape_like_prefix(search));
        }
        if let Some(limit) = limit {
            query = query.bind(limit);
        }

        let rows = query.fetch_all(&self.pool).await?;
        let mut out: Vec<OfficeWithDistance> = Vec::with_capacity(rows.len());
        let mut seen: HashSet<(String, String, String)> = HashSet::new();
        for row in &rows {
            let office = office_from_row(row)?;
            let distance_m: f64 = row.try_get("link_distance_m")?;
            let key = (
                oncomap_core::text::normalized_name_key(office.name.as_deref().unwrap_or("")),
                oncomap_core::geo::coord_key(office.lat),
                oncomap_core::geo::coord_key(office.lon),
            );
            if seen.insert(key) {
                out.push(OfficeWithDistance { office, distance_m });
            }
        }
        Ok(out)
    }

    /// Delete a center's links that the current refresh did not observe.
    pub async fn prune_center_links_not_seen_since(
        &self,
        center_id: i64,
        seen_at: &str,
    ) -> Result<u64> {
        let result =
            sqlx::query("DELETE FROM center_office WHERE center_id = ? AND last_seen < ?")
                .bind(center_id)
                .bind(seen_at)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected())
    }

    /// Delete a center's links older than `stale_days`.
    pub async fn prune_stale_center_links(
        &self,
        center_id: i64,
        stale_days: i64,
    ) -> Result<u64> {
        let result =
            sqlx::query("DELETE FROM center_office WHERE center_id = ? AND last_seen < ?")
                .bind(center_id)
                .bind(iso_days_ago(stale_days))
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected())
    }

    /// Full-clean wipe: all links, all offices, cursor back to zero.
    pub async fn purge_all_office_points(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM center_office").execute(&mut *tx).await?;
        sqlx::query("DELETE FROM offices").execute(&mut *tx).await?;
        sqlx::query(
            "INSERT INTO refresh_state (key, value, updated_at) VALUES (?, '0', ?) \
             ON CONFLICT(key) DO UPDATE SET value = '0', updated_at = excluded.updated_at",
        )
        .bind(CURSOR_KEY)
        .bind(now_iso())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    // ── enrichment ───────────────────────────────────────────────────────

    /// Of `candidate_ids`, the entity ids some office still needs enriched:
    /// never enriched, or enriched longer than `stale_days` ago. Capped at
    /// `max_ids`.
    pub async fn list_stale_wikidata_entity_ids(
        &self,
        candidate_ids: &[String],
        stale_days: i64,
        max_ids: usize,
    ) -> Result<Vec<String>> {
        if candidate_ids.is_empty() || max_ids == 0 {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; candidate_ids.len()].join(", ");
        let sql = format!(
            "SELECT DISTINCT wikidata_entity_id FROM offices \
             WHERE wikidata_entity_id IN ({placeholders}) \
             AND (wikidata_enriched_at IS NULL OR wikidata_enriched_at < ?) \
             ORDER BY wikidata_entity_id ASC LIMIT ?"
        );
        let mut query = sqlx::query_scalar::<_, String>(&sql);
        for id in candidate_ids {
            query = query.bind(id);
        }
        query = query.bind(iso_days_ago(stale_days)).bind(max_ids as i64);
        Ok(query.fetch_all(&self.pool).await?)
    }

    /// Write enrichment results onto every office bearing each entity id.
    /// Returns the number of office rows updated.
    pub async fn apply_wikidata_enrichment(
        &self,
        facts: &[WikidataFacts],
        enriched_at: &str,
    ) -> Result<u64> {
        let mut updated = 0u64;
        let mut tx = self.pool.begin().await?;
        for fact in facts {
            let result = sqlx::query(
                "UPDATE offices SET employee_count = ?, employee_count_as_of = ?, \
                 market_cap = ?, market_cap_currency_qid = ?, market_cap_as_of = ?, \
                 wikidata_enriched_at = ? WHERE wikidata_entity_id = ?",
            )
            .bind(fact.employee_count)
            .bind(&fact.employee_count_as_of)
            .bind(fact.market_cap)
            .bind(&fact.market_cap_currency_qid)
            .bind(&fact.market_cap_as_of)
            .bind(enriched_at)
            .bind(&fact.entity_id)
            .execute(&mut *tx)
            .await?;
            updated += result.rows_affected();
        }
        tx.commit().await?;
        Ok(updated)
    }

    // ── banned offices & deletion flags ──────────────────────────────────

    pub async fn banned_office_keys(&self) -> Result<HashSet<OfficeKey>> {
        let rows = sqlx::query("SELECT osm_type, osm_id FROM banned_offices")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| -> Result<OfficeKey> {
                let osm_type = osm_type_from_row(row)?;
                let osm_id: i64 = row.try_get("osm_id")?;
                Ok((osm_type, osm_id))
            })
            .collect()
    }

    pub async fn is_banned(&self, osm_type: OsmType, osm_id: i64) -> Result<bool> {
        let found: Option<i64> =
            sqlx::query_scalar("SELECT 1 FROM banned_offices WHERE osm_type = ? AND osm_id = ?")
                .bind(osm_type.as_str())
                .bind(osm_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(found.is_some())
    }

    pub async fn link_exists(
        &self,
        center_id: i64,
        osm_type: OsmType,
        osm_id: i64,
    ) -> Result<bool> {
        let found: Option<i64> = sqlx::query_scalar(
            "SELECT 1 FROM center_office WHERE center_id = ? AND osm_type = ? AND osm_id = ?",
        )
        .bind(center_id)
        .bind(osm_type.as_str())
        .bind(osm_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(found.is_some())
    }

    /// Flag-submission state machine: banned wins, then an existing pending
    /// flag, then a fresh `pending` row.
    pub async fn submit_deletion_flag(
        &self,
        center_id: Option<i64>,
        osm_type: OsmType,
        osm_id: i64,
        reason: Option<&str>,
    ) -> Result<FlagSubmitOutcome> {
        let mut tx = self.pool.begin().await?;

        let banned: Option<i64> = sqlx::query_scalar(
            "SELECT 1 FROM banned_offices WHERE osm_type = ? AND osm_id = ?",
        )
        .bind(osm_type.as_str())
        .bind(osm_id)
        .fetch_optional(&mut *tx)
        .await?;
        if banned.is_some() {
            tx.commit().await?;
            return Ok(FlagSubmitOutcome::AlreadyBanned);
        }

        let pending: Option<i64> = sqlx::query_scalar(
            "SELECT id FROM office_deletion_flags \
             WHERE osm_type = ? AND osm_id = ? AND status = 'pending'",
        )
        .bind(osm_type.as_str())
        .bind(osm_id)
        .fetch_optional(&mut *tx)
        .await?;
        if let Some(flag_id) = pending {
            tx.commit().await?;
            return Ok(FlagSubmitOutcome::AlreadyPending { flag_id });
        }

        let result = sqlx::query(
            "INSERT INTO office_deletion_flags \
             (center_id, osm_type, osm_id, reason, status, submitted_at) \
             VALUES (?, ?, ?, ?, 'pending', ?)",
        )
        .bind(center_id)
        .bind(osm_type.as_str())
        .bind(osm_id)
        .bind(reason)
        .bind(now_iso())
        .execute(&mut *tx)
        .await?;
        let flag_id = result.last_insert_rowid();
        tx.commit().await?;
        Ok(FlagSubmitOutcome::Created { flag_id })
    }

    pub async fn list_deletion_flags(
        &self,
        status: Option<FlagStatus>,
        limit: i64,
    ) -> Result<Vec<OfficeDeletionFlag>> {
        let mut sql = String::from("SELECT * FROM office_deletion_flags");
        if status.is_some() {
            sql.push_str(" WHERE status = ?");
        }
        sql.push_str(" ORDER BY id DESC LIMIT ?");

        let mut query = sqlx::query(&sql);
        if let Some(status) = status {
            query = query.bind(status.as_str());
        }
        query = query.bind(limit);
        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(flag_from_row).collect()
    }

    pub async fn get_deletion_flag(&self, flag_id: i64) -> Result<Option<OfficeDeletionFlag>> {
        let row = sqlx::query("SELECT * FROM office_deletion_flags WHERE id = ?")
            .bind(flag_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(flag_from_row).transpose()
    }

    /// Decision state machine. Approval bans the office and deletes its
    /// links and row inside the same transaction.
    pub async fn decide_deletion_flag(
        &self,
        flag_id: i64,
        approve: bool,
    ) -> Result<FlagDecisionOutcome> {
        let now = now_iso();
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT * FROM office_deletion_flags WHERE id = ?")
            .bind(flag_id)
            .fetch_optional(&mut *tx)
            .await?;
        let Some(row) = row else {
            return Ok(FlagDecisionOutcome::NotFound);
        };
        let flag = flag_from_row(&row)?;

        match (flag.status, approve) {
            (FlagStatus::Approved, _) => Ok(FlagDecisionOutcome::AlreadyApproved),
            (FlagStatus::Rejected, false) => Ok(FlagDecisionOutcome::AlreadyRejected),
            (FlagStatus::Pending, false) => {
                sqlx::query(
                    "UPDATE office_deletion_flags SET status = 'rejected', reviewed_at = ? \
                     WHERE id = ?",
                )
                .bind(&now)
                .bind(flag_id)
                .execute(&mut *tx)
                .await?;
                tx.commit().await?;
                Ok(FlagDecisionOutcome::Rejected)
            }
            // Pending -> approved, and the allowed rejected -> approved flip.
            (FlagStatus::Pending, true) | (FlagStatus::Rejected, true) => {
                sqlx::query(
                    "UPDATE office_deletion_flags SET status = 'approved', reviewed_at = ? \
                     WHERE id = ?",
                )
                .bind(&now)
                .bind(flag_id)
                .execute(&mut *tx)
                .await?;
                sqlx::query(
                    "INSERT INTO banned_offices (osm_type, osm_id, approved_flag_id, approved_at) \
                     VALUES (?, ?, ?, ?) \
                     ON CONFLICT(osm_type, osm_id) DO UPDATE SET \
                     approved_flag_id = excluded.approved_flag_id, \
                     approved_at = excluded.approved_at",
                )
                .bind(flag.osm_type.as_str())
                .bind(flag.osm_id)
                .bind(flag_id)
                .bind(&now)
                .execute(&mut *tx)
                .await?;
                let deleted_links = sqlx::query(
                    "DELETE FROM center_office WHERE osm_type = ? AND osm_id = ?",
                )
                .bind(flag.osm_type.as_str())
                .bind(flag.osm_id)
                .execute(&mut *tx)
                .await?
                .rows_affected();
                let deleted_offices =
                    sqlx::query("DELETE FROM offices WHERE osm_type = ? AND osm_id = ?")
                        .bind(flag.osm_type.as_str())
                        .bind(flag.osm_id)
                        .execute(&mut *tx)
                        .await?
                        .rows_affected();
                tx.commit().await?;
                Ok(FlagDecisionOutcome::Approved {
                    deleted_links,
                    deleted_offices,
                })
            }
        }
    }

    // ── refresh state ────────────────────────────────────────────────────

    pub async fn get_refresh_cursor(&self) -> Result<i64> {
        let value: Option<String> =
            sqlx::query_scalar("SELECT value FROM refresh_state WHERE key = ?")
                .bind(CURSOR_KEY)
                .fetch_optional(&self.pool)
                .await?;
        Ok(value.and_then(|v| v.parse().ok()).unwrap_or(0))
    }

    pub async fn set_refresh_cursor(&self, value: i64) -> Result<()> {
        sqlx::query(
            "INSERT INTO refresh_state (key, value, updated_at) VALUES (?, ?, ?) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, \
             updated_at = excluded.updated_at",
        )
        .bind(CURSOR_KEY)
        .bind(value.to_string())
        .bind(now_iso())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// When the cursor row was last written; the health check's freshness
    /// signal.
    pub async fn refresh_state_updated_at(&self) -> Result<Option<String>> {
        Ok(
            sqlx::query_scalar("SELECT updated_at FROM refresh_state WHERE key = ?")
                .bind(CURSOR_KEY)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    // ── status ───────────────────────────────────────────────────────────

    pub async fn status_counts(&self, exact: bool) -> Result<StatusCounts> {
        let centers_total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM centers")
            .fetch_one(&self.pool)
            .await?;
        let active_centers: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM centers WHERE is_active = 1")
                .fetch_one(&self.pool)
                .await?;
        let mut counts = StatusCounts {
            centers_total,
            active_centers,
            ..StatusCounts::default()
        };
        if exact {
            counts.offices_total = Some(
                sqlx::query_scalar("SELECT COUNT(*) FROM offices")
                    .fetch_one(&self.pool)
                    .await?,
            );
            counts.center_office_links_total = Some(
                sqlx::query_scalar("SELECT COUNT(*) FROM center_office")
                    .fetch_one(&self.pool)
                    .await?,
            );
        }
        Ok(counts)
    }
}

/// Escape `%`, `_`, and `\` for a LIKE prefix pattern, capping the input
/// length first.
fn escape_like_prefix(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len() + 1);
    for c in raw.chars().take(SEARCH_MAX_CHARS) {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('%');
    out
}

fn osm_type_from_row(row: &SqliteRow) -> Result<OsmType> {
    let raw: String = row.try_get("osm_type")?;
    raw.parse()
        .map_err(|_| StoreError::InvalidRow(format!("unknown osm_type `{raw}`")))
}

fn center_from_row(row: &SqliteRow) -> Result<Center> {
    Ok(Center {
        id: row.try_get("id")?,
        center_code: row.try_get("center_code")?,
        name: row.try_get("name")?,
        tier: row.try_get("tier")?,
        lat: row.try_get("lat")?,
        lon: row.try_get("lon")?,
        country: row.try_get("country")?,
        region: row.try_get("region")?,
        source_url: row.try_get("source_url")?,
        is_active: row.try_get::<i64, _>("is_active")? != 0,
        last_csv_sync_token: row.try_get("last_csv_sync_token")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn office_from_row(row: &SqliteRow) -> Result<Office> {
    Ok(Office {
        osm_type: osm_type_from_row(row)?,
        osm_id: row.try_get("osm_id")?,
        name: row.try_get("name")?,
        brand: row.try_get("brand")?,
        operator: row.try_get("operator")?,
        website: row.try_get("website")?,
        wikidata: row.try_get("wikidata")?,
        wikidata_entity_id: row.try_get("wikidata_entity_id")?,
        lat: row.try_get("lat")?,
        lon: row.try_get("lon")?,
        low_confidence: row.try_get::<i64, _>("low_confidence")? != 0,
        tags_json: row.try_get("tags_json")?,
        employee_count: row.try_get("employee_count")?,
        employee_count_as_of: row.try_get("employee_count_as_of")?,
        market_cap: row.try_get("market_cap")?,
        market_cap_currency_qid: row.try_get("market_cap_currency_qid")?,
        market_cap_as_of: row.try_get("market_cap_as_of")?,
        wikidata_enriched_at: row.try_get("wikidata_enriched_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn company_from_row(row: &SqliteRow) -> Result<Company> {
    Ok(Company {
        id: row.try_get("id")?,
        company_name: row.try_get("company_name")?,
        company_name_normalized: row.try_get("company_name_normalized")?,
        known_aliases: row.try_get("known_aliases")?,
        hq_country: row.try_get("hq_country")?,
        description: row.try_get("description")?,
        company_type: row.try_get("company_type")?,
        geography: row.try_get("geography")?,
        industry: row.try_get("industry")?,
        suitability_tier: row.try_get("suitability_tier")?,
    })
}

fn flag_from_row(row: &SqliteRow) -> Result<OfficeDeletionFlag> {
    let status_raw: String = row.try_get("status")?;
    let status = status_raw
        .parse()
        .map_err(|_| StoreError::InvalidRow(format!("unknown flag status `{status_raw}`")))?;
    Ok(OfficeDeletionFlag {
        id: row.try_get("id")?,
        center_id: row.try_get("center_id")?,
        osm_type: osm_type_from_row(row)?,
        osm_id: row.try_get("osm_id")?,
        reason: row.try_get("reason")?,
        status,
        submitted_at: row.try_get("submitted_at")?,
        reviewed_at: row.try_get("reviewed_at")?,
    })
}
