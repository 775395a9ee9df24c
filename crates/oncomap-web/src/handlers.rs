//! Route handlers.

use std::collections::HashMap;

use anyhow::Context;
use axum::body::Bytes;
use axum::extract::{Multipart, Path, Query, State};
use axum::http::StatusCode;
use axum::response::Response;
use serde::Serialize;
use serde_json::{json, Value};
use uuid::Uuid;

use oncomap_core::csv::{parse_centers_csv, parse_companies_csv};
use oncomap_core::text::{parse_bounded_int, sanitize_text};
use oncomap_core::time::{minutes_since, now_iso};
use oncomap_core::{
    Center, CompanyInsertOutcome, CenterUpsertOutcome, FlagDecisionOutcome, FlagStatus,
    FlagSubmitOutcome, OsmType,
};
use oncomap_match::CompanyIndex;
use oncomap_storage::OfficeWithDistance;
use oncomap_sync::{RefreshAllOptions, RefreshCenterOptions, ALLOWED_RADII_KM};

use crate::error::{json_response, ApiError, ApiResult};
use crate::AppState;

const DEFAULT_READ_RADIUS_KM: i64 = 25;
const READ_LIMIT_MAX: i64 = 5000;
const FLAG_REASON_MAX: usize = 500;

// ── response DTOs ────────────────────────────────────────────────────────

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CenterDto {
    id: i64,
    center_code: String,
    name: String,
    tier: Option<String>,
    lat: f64,
    lon: f64,
    country: Option<String>,
    region: Option<String>,
}

impl From<&Center> for CenterDto {
    fn from(center: &Center) -> Self {
        Self {
            id: center.id,
            center_code: center.center_code.clone(),
            name: center.name.clone(),
            tier: center.tier.clone(),
            lat: center.lat,
            lon: center.lon,
            country: center.country.clone(),
            region: center.region.clone(),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct OfficeDto {
    osm_type: String,
    osm_id: i64,
    name: Option<String>,
    brand: Option<String>,
    operator: Option<String>,
    website: Option<String>,
    wikidata: Option<String>,
    wikidata_entity_id: Option<String>,
    employee_count: Option<i64>,
    employee_count_as_of: Option<String>,
    market_cap: Option<f64>,
    market_cap_currency_qid: Option<String>,
    market_cap_as_of: Option<String>,
    wikidata_enriched_at: Option<String>,
    lat: f64,
    lon: f64,
    low_confidence: bool,
    distance_m: f64,
    linked_company_id: Option<i64>,
    linked_company_name: Option<String>,
}

impl OfficeDto {
    fn build(row: &OfficeWithDistance, index: &CompanyIndex) -> Self {
        let office = &row.office;
        let linked = index.match_office(office);
        Self {
            osm_type: office.osm_type.as_str().to_string(),
            osm_id: office.osm_id,
            name: office.name.clone(),
            brand: office.brand.clone(),
            operator: office.operator.clone(),
            website: office.website.clone(),
            wikidata: office.wikidata.clone(),
            wikidata_entity_id: office.wikidata_entity_id.clone(),
            employee_count: office.employee_count,
            employee_count_as_of: office.employee_count_as_of.clone(),
            market_cap: office.market_cap,
            market_cap_currency_qid: office.market_cap_currency_qid.clone(),
            market_cap_as_of: office.market_cap_as_of.clone(),
            wikidata_enriched_at: office.wikidata_enriched_at.clone(),
            lat: office.lat,
            lon: office.lon,
            low_confidence: office.low_confidence,
            distance_m: row.distance_m,
            linked_company_id: linked.as_ref().map(|m| m.company_id),
            linked_company_name: linked.map(|m| m.company_name),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct FlagDto {
    id: i64,
    center_id: Option<i64>,
    osm_type: String,
    osm_id: i64,
    reason: Option<String>,
    status: String,
    submitted_at: String,
    reviewed_at: Option<String>,
}

// ── small parsing helpers ────────────────────────────────────────────────

fn parse_bool_param(raw: Option<&String>, name: &str, default: bool) -> ApiResult<bool> {
    match raw.map(|s| s.trim()) {
        None | Some("") => Ok(default),
        Some("true") | Some("1") => Ok(true),
        Some("false") | Some("0") => Ok(false),
        Some(_) => Err(ApiError::bad_request(format!("{name} must be true or false"))),
    }
}

fn parse_json_body(bytes: &Bytes) -> ApiResult<Value> {
    if bytes.is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_slice(bytes).map_err(|_| ApiError::bad_request("body must be valid json"))
}

/// Accepts a JSON number or a numeric string; blank and null mean absent.
fn opt_int_field(body: &Value, key: &str) -> ApiResult<Option<i64>> {
    match body.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_i64()
            .map(Some)
            .ok_or_else(|| ApiError::bad_request(format!("{key} must be an integer"))),
        Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(Value::String(s)) => s
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ApiError::bad_request(format!("{key} must be an integer"))),
        Some(_) => Err(ApiError::bad_request(format!("{key} must be an integer"))),
    }
}

fn opt_bool_field(body: &Value, key: &str) -> ApiResult<Option<bool>> {
    match body.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Bool(b)) => Ok(Some(*b)),
        Some(Value::String(s)) => match s.trim() {
            "" => Ok(None),
            "true" | "1" => Ok(Some(true)),
            "false" | "0" => Ok(Some(false)),
            _ => Err(ApiError::bad_request(format!("{key} must be true or false"))),
        },
        Some(_) => Err(ApiError::bad_request(format!("{key} must be true or false"))),
    }
}

fn opt_str_field<'a>(body: &'a Value, key: &str) -> Option<&'a str> {
    body.get(key).and_then(Value::as_str)
}

fn parse_admin_radius_km(body: &Value) -> ApiResult<Option<u32>> {
    match opt_int_field(body, "radiusKm")? {
        None => Ok(None),
        Some(km) if km > 0 && ALLOWED_RADII_KM.contains(&(km as u32)) => Ok(Some(km as u32)),
        Some(_) => Err(ApiError::bad_request("radiusKm must be one of 10, 25, 50, 100")),
    }
}

fn parse_max_offices(body: &Value) -> ApiResult<Option<usize>> {
    match opt_int_field(body, "maxOffices")? {
        None => Ok(None),
        Some(m) if (1..=10_000).contains(&m) => Ok(Some(m as usize)),
        Some(_) => Err(ApiError::bad_request("maxOffices must be between 1 and 10000")),
    }
}

fn parse_osm_type(raw: Option<&str>) -> ApiResult<OsmType> {
    raw.unwrap_or("")
        .parse()
        .map_err(|_| ApiError::bad_request("osmType must be node, way, or relation"))
}

/// Merge `ok` into a serialized summary object.
fn summary_with_ok<T: Serialize>(summary: &T, ok: bool) -> ApiResult<Value> {
    let mut value = serde_json::to_value(summary).context("serializing summary")?;
    if let Value::Object(map) = &mut value {
        map.insert("ok".to_string(), Value::Bool(ok));
    }
    Ok(value)
}

async fn company_index(state: &AppState) -> ApiResult<CompanyIndex> {
    let companies = state.store.list_companies(None).await?;
    Ok(CompanyIndex::build(&companies))
}

// ── public routes ────────────────────────────────────────────────────────

pub async fn health() -> Response {
    json_response(StatusCode::OK, json!({ "ok": true }))
}

pub async fn not_found() -> ApiError {
    ApiError::not_found("not found")
}

pub async fn list_centers(
    State(state): State<AppState>,
    Query(query): Query<HashMap<String, String>>,
) -> ApiResult<Response> {
    let active_only = parse_bool_param(query.get("activeOnly"), "activeOnly", true)?;
    let tier = query.get("tier").map(String::as_str).filter(|t| !t.is_empty());
    let centers = state.store.list_centers(tier, active_only).await?;
    let rows: Vec<CenterDto> = centers.iter().map(CenterDto::from).collect();
    Ok(json_response(
        StatusCode::OK,
        serde_json::to_value(rows).context("serializing centers")?,
    ))
}

pub async fn get_center(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Response> {
    let center = state
        .store
        .get_center_by_id(id)
        .await?
        .ok_or_else(|| ApiError::not_found("center not found"))?;
    Ok(json_response(
        StatusCode::OK,
        serde_json::to_value(CenterDto::from(&center)).context("serializing center")?,
    ))
}

pub async fn list_center_offices(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(query): Query<HashMap<String, String>>,
) -> ApiResult<Response> {
    let center = state
        .store
        .get_center_by_id(id)
        .await?
        .filter(|c| c.is_active)
        .ok_or_else(|| ApiError::not_found("center not found"))?;

    let max_radius_km = i64::from(state.engine.config().default_radius_m / 1000).max(1);
    let radius_km = match query.get("radiusKm").map(|s| s.trim()).filter(|s| !s.is_empty()) {
        None => DEFAULT_READ_RADIUS_KM.min(max_radius_km),
        Some(raw) => raw
            .parse::<i64>()
            .map_err(|_| ApiError::bad_request("radiusKm must be an integer"))?
            .clamp(1, max_radius_km),
    };

    let limit = match query.get("limit").map(|s| s.trim()).filter(|s| !s.is_empty()) {
        None => None,
        Some(raw) => {
            let value: i64 = raw
                .parse()
                .map_err(|_| ApiError::bad_request("limit must be a positive integer"))?;
            if value < 1 {
                return Err(ApiError::bad_request("limit must be a positive integer"));
            }
            Some(value.min(READ_LIMIT_MAX))
        }
    };

    let high_confidence_only =
        parse_bool_param(query.get("highConfidenceOnly"), "highConfidenceOnly", false)?;
    let search = query.get("search").map(String::as_str).filter(|s| !s.is_empty());

    let rows = state
        .store
        .list_offices_for_center(
            center.id,
            (radius_km * 1000) as f64,
            limit,
            high_confidence_only,
            search,
        )
        .await?;
    let index = company_index(&state).await?;
    let offices: Vec<OfficeDto> = rows.iter().map(|row| OfficeDto::build(row, &index)).collect();

    Ok(json_response(
        StatusCode::OK,
        json!({
            "center": {
                "id": center.id,
                "centerCode": center.center_code,
                "name": center.name,
                "lat": center.lat,
                "lon": center.lon,
            },
            "radiusKm": radius_km,
            "offices": serde_json::to_value(offices).context("serializing offices")?,
        }),
    ))
}

pub async fn flag_deletion(State(state): State<AppState>, body: Bytes) -> ApiResult<Response> {
    let body = parse_json_body(&body)?;
    let center_id = opt_int_field(&body, "centerId")?
        .filter(|id| *id >= 1)
        .ok_or_else(|| ApiError::bad_request("centerId must be a positive integer"))?;
    let osm_type = parse_osm_type(opt_str_field(&body, "osmType"))?;
    let osm_id = opt_int_field(&body, "osmId")?
        .filter(|id| *id >= 1)
        .ok_or_else(|| ApiError::bad_request("osmId must be a positive integer"))?;
    let reason = opt_str_field(&body, "reason").and_then(|r| sanitize_text(r, FLAG_REASON_MAX));

    state
        .store
        .get_center_by_id(center_id)
        .await?
        .ok_or_else(|| ApiError::not_found("center not found"))?;

    // A banned office no longer has a link row, so the ban check comes
    // before requiring the link to exist.
    if !state.store.is_banned(osm_type, osm_id).await?
        && !state.store.link_exists(center_id, osm_type, osm_id).await?
    {
        return Err(ApiError::not_found("office not found for this center"));
    }
    let outcome = state
        .store
        .submit_deletion_flag(Some(center_id), osm_type, osm_id, reason.as_deref())
        .await?;

    let value = match outcome {
        FlagSubmitOutcome::Created { flag_id } => {
            json!({ "outcome": "created", "flagId": flag_id })
        }
        FlagSubmitOutcome::AlreadyPending { flag_id } => {
            json!({ "outcome": "already_pending", "flagId": flag_id })
        }
        FlagSubmitOutcome::AlreadyBanned => json!({ "outcome": "already_banned" }),
    };
    Ok(json_response(StatusCode::OK, value))
}

// ── admin: CSV uploads ───────────────────────────────────────────────────

async fn read_csv_upload(mut multipart: Multipart) -> ApiResult<String> {
    loop {
        let field = multipart.next_field().await.map_err(|err| {
            if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
                ApiError::PayloadTooLarge
            } else {
                ApiError::bad_request("invalid multipart body")
            }
        })?;
        let Some(field) = field else {
            return Err(ApiError::bad_request("missing `file` field"));
        };
        if field.name() != Some("file") {
            continue;
        }
        let bytes = field.bytes().await.map_err(|err| {
            if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
                ApiError::PayloadTooLarge
            } else {
                ApiError::bad_request("could not read uploaded file")
            }
        })?;
        return String::from_utf8(bytes.to_vec())
            .map_err(|_| ApiError::bad_request("file must be valid utf-8"));
    }
}

pub async fn upload_centers_csv(
    State(state): State<AppState>,
    multipart: Multipart,
) -> ApiResult<Response> {
    let body = read_csv_upload(multipart).await?;
    let parsed = parse_centers_csv(&body).map_err(|err| ApiError::bad_request(err.to_string()))?;
    if parsed.rows.is_empty() {
        return Err(ApiError::bad_request("csv contained no acceptable rows"));
    }

    let sync_token = Uuid::new_v4().to_string();
    let mut inserted = 0u64;
    let mut updated = 0u64;
    for row in &parsed.rows {
        match state.store.upsert_center_from_csv(row, &sync_token).await? {
            CenterUpsertOutcome::Inserted => inserted += 1,
            CenterUpsertOutcome::Updated => updated += 1,
        }
    }
    let disabled = state
        .store
        .disable_centers_missing_from_sync(&sync_token)
        .await?;

    Ok(json_response(
        StatusCode::OK,
        json!({
            "inserted": inserted,
            "updated": updated,
            "disabled": disabled,
            "issues": serde_json::to_value(&parsed.issues).context("serializing issues")?,
        }),
    ))
}

pub async fn upload_companies_csv(
    State(state): State<AppState>,
    multipart: Multipart,
) -> ApiResult<Response> {
    let body = read_csv_upload(multipart).await?;
    let parsed =
        parse_companies_csv(&body).map_err(|err| ApiError::bad_request(err.to_string()))?;
    if parsed.rows.is_empty() {
        return Err(ApiError::bad_request("csv contained no acceptable rows"));
    }

    let mut inserted = 0u64;
    let mut skipped = 0u64;
    for row in &parsed.rows {
        match state.store.insert_company_from_csv(row).await? {
            CompanyInsertOutcome::Inserted => inserted += 1,
            CompanyInsertOutcome::Skipped => skipped += 1,
        }
    }

    Ok(json_response(
        StatusCode::OK,
        json!({
            "inserted": inserted,
            "skipped": skipped,
            "issues": serde_json::to_value(&parsed.issues).context("serializing issues")?,
        }),
    ))
}

pub async fn list_companies(
    State(state): State<AppState>,
    Query(query): Query<HashMap<String, String>>,
) -> ApiResult<Response> {
    let limit = match query.get("limit").map(|s| s.trim()).filter(|s| !s.is_empty()) {
        None => 200,
        Some(raw) => parse_bounded_int(raw, 1, 1000)
            .ok_or_else(|| ApiError::bad_request("limit must be between 1 and 1000"))?,
    };
    let companies = state.store.list_companies(Some(limit)).await?;
    let rows: Vec<Value> = companies
        .iter()
        .map(|company| {
            json!({
                "id": company.id,
                "companyName": company.company_name,
                "companyNameNormalized": company.company_name_normalized,
                "aliasCount": company
                    .known_aliases
                    .as_deref()
                    .map(|a| a.split('|').filter(|s| !s.trim().is_empty()).count())
                    .unwrap_or(0),
            })
        })
        .collect();
    Ok(json_response(StatusCode::OK, json!({ "companies": rows })))
}

// ── admin: refresh triggers ──────────────────────────────────────────────

pub async fn refresh_center(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    body: Bytes,
) -> ApiResult<Response> {
    let body = parse_json_body(&body)?;
    let opts = RefreshCenterOptions {
        radius_m: parse_admin_radius_km(&body)?.map(|km| km * 1000),
        max_offices: parse_max_offices(&body)?,
    };
    let summary = state
        .engine
        .refresh_center_by_id(id, opts)
        .await
        .context("refreshing center")?
        .ok_or_else(|| ApiError::not_found("center not found or inactive"))?;
    Ok(json_response(StatusCode::OK, summary_with_ok(&summary, true)?))
}

pub async fn refresh_batch(State(state): State<AppState>) -> ApiResult<Response> {
    let summary = state
        .engine
        .run_scheduled_refresh()
        .await
        .context("running scheduled refresh batch")?;
    Ok(json_response(StatusCode::OK, summary_with_ok(&summary, true)?))
}

pub async fn refresh_all(State(state): State<AppState>, body: Bytes) -> ApiResult<Response> {
    let body = parse_json_body(&body)?;
    let opts = RefreshAllOptions {
        throttle_ms: opt_int_field(&body, "delayMs")?.map(|v| v.clamp(0, 15_000) as u64),
        batch_size: opt_int_field(&body, "batchSize")?.map(|v| v.clamp(1, 200)),
        radius_km: parse_admin_radius_km(&body)?,
        max_offices: parse_max_offices(&body)?,
        full_clean: opt_bool_field(&body, "fullClean")?.unwrap_or(false),
        center_retry_count: match opt_int_field(&body, "centerRetryCount")? {
            None => None,
            Some(v) if (0..=10).contains(&v) => Some(v as u32),
            Some(_) => {
                return Err(ApiError::bad_request("centerRetryCount must be between 0 and 10"))
            }
        },
        retry_delay_ms: opt_int_field(&body, "retryDelayMs")?.map(|v| v.clamp(0, 60_000) as u64),
    };
    let summary = state
        .engine
        .run_refresh_all(opts)
        .await
        .context("running full refresh")?;
    let ok = summary.ok;
    Ok(json_response(StatusCode::OK, summary_with_ok(&summary, ok)?))
}

// ── admin: deletion-flag review ──────────────────────────────────────────

pub async fn list_deletion_flags(
    State(state): State<AppState>,
    Query(query): Query<HashMap<String, String>>,
) -> ApiResult<Response> {
    let status = match query.get("status").map(|s| s.trim()).filter(|s| !s.is_empty()) {
        None => Some(FlagStatus::Pending),
        Some("all") => None,
        Some(raw) => Some(
            raw.parse::<FlagStatus>()
                .map_err(|_| ApiError::bad_request("status must be pending, approved, rejected, or all"))?,
        ),
    };
    let limit = match query.get("limit").map(|s| s.trim()).filter(|s| !s.is_empty()) {
        None => 100,
        Some(raw) => parse_bounded_int(raw, 1, 1000)
            .ok_or_else(|| ApiError::bad_request("limit must be between 1 and 1000"))?,
    };

    let flags = state.store.list_deletion_flags(status, limit).await?;
    let rows: Vec<FlagDto> = flags
        .iter()
        .map(|flag| FlagDto {
            id: flag.id,
            center_id: flag.center_id,
            osm_type: flag.osm_type.as_str().to_string(),
            osm_id: flag.osm_id,
            reason: flag.reason.clone(),
            status: flag.status.as_str().to_string(),
            submitted_at: flag.submitted_at.clone(),
            reviewed_at: flag.reviewed_at.clone(),
        })
        .collect();
    Ok(json_response(
        StatusCode::OK,
        json!({ "flags": serde_json::to_value(rows).context("serializing flags")? }),
    ))
}

pub async fn decide_deletion_flag(
    State(state): State<AppState>,
    Path(flag_id): Path<i64>,
    body: Bytes,
) -> ApiResult<Response> {
    let body = parse_json_body(&body)?;
    let approve = match opt_str_field(&body, "decision") {
        Some("approve") => true,
        Some("reject") => false,
        _ => return Err(ApiError::bad_request("decision must be approve or reject")),
    };

    let value = match state.store.decide_deletion_flag(flag_id, approve).await? {
        FlagDecisionOutcome::NotFound => {
            return Err(ApiError::not_found("deletion flag not found"))
        }
        FlagDecisionOutcome::Approved {
            deleted_links,
            deleted_offices,
        } => json!({
            "outcome": "approved",
            "deletedLinks": deleted_links,
            "deletedOffices": deleted_offices,
        }),
        FlagDecisionOutcome::Rejected => json!({ "outcome": "rejected" }),
        FlagDecisionOutcome::AlreadyApproved if approve => {
            json!({ "outcome": "already_approved" })
        }
        FlagDecisionOutcome::AlreadyApproved => {
            return Err(ApiError::Conflict("flag already approved".to_string()))
        }
        FlagDecisionOutcome::AlreadyRejected => json!({ "outcome": "already_rejected" }),
    };
    Ok(json_response(StatusCode::OK, value))
}

// ── admin: status ────────────────────────────────────────────────────────

pub async fn admin_status(
    State(state): State<AppState>,
    Query(query): Query<HashMap<String, String>>,
) -> ApiResult<Response> {
    let include_counts = parse_bool_param(query.get("includeCounts"), "includeCounts", false)?;
    let counts = state.store.status_counts(include_counts).await?;
    let cursor = state.store.get_refresh_cursor().await?;
    let updated_at = state.store.refresh_state_updated_at().await?;

    let now = chrono_now();
    let age_minutes = updated_at.as_deref().and_then(|at| minutes_since(at, now));
    let max_age = state.config.refresh_health_max_age_minutes;

    let active_ok = counts.active_centers >= 1;
    let state_present = updated_at.is_some();
    let recent_enough = age_minutes.map_or(false, |age| age <= max_age);
    let ok = active_ok && state_present && recent_enough;

    let mut metrics = json!({
        "exactCounts": include_counts,
        "centersTotal": counts.centers_total,
        "activeCenters": counts.active_centers,
    });
    if include_counts {
        metrics["officesTotal"] = json!(counts.offices_total);
        metrics["centerOfficeLinksTotal"] = json!(counts.center_office_links_total);
    }

    Ok(json_response(
        StatusCode::OK,
        json!({
            "ok": ok,
            "generatedAt": now_iso(),
            "checks": {
                "activeCentersAtLeastOne": active_ok,
                "refreshStatePresent": state_present,
                "refreshRecentEnough": recent_enough,
            },
            "thresholds": { "maxRefreshAgeMinutes": max_age },
            "metrics": metrics,
            "refresh": {
                "cursor": cursor,
                "updatedAt": updated_at,
                "ageMinutes": age_minutes,
            },
        }),
    ))
}

fn chrono_now() -> chrono::DateTime<chrono::Utc> {
    chrono::Utc::now()
}
