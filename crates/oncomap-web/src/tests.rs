use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use oncomap_adapters::{ElementCenter, OverpassApi, OverpassError, RawElement, WikidataApi, WikidataError};
use oncomap_core::WikidataFacts;
use oncomap_storage::Store;
use oncomap_sync::{RefreshEngine, SyncConfig};

use super::*;

const ADMIN_TOKEN: &str = "secret-token";
const BOUNDARY: &str = "oncomap-test-boundary";

struct FixedOverpass {
    elements: Vec<RawElement>,
}

#[async_trait]
impl OverpassApi for FixedOverpass {
    async fn fetch_elements(
        &self,
        _lat: f64,
        _lon: f64,
        _radius_m: u32,
    ) -> Result<Vec<RawElement>, OverpassError> {
        Ok(self.elements.clone())
    }
}

struct EmptyWikidata;

#[async_trait]
impl WikidataApi for EmptyWikidata {
    async fn fetch_entity_facts(
        &self,
        _ids: &[String],
    ) -> Result<Vec<WikidataFacts>, WikidataError> {
        Ok(Vec::new())
    }
}

/// The canonical stubbed upstream: a matchable node, an unmatchable way,
/// and a nameless element.
fn smoke_elements() -> Vec<RawElement> {
    let named = |name: &str| {
        Some(
            [("name".to_string(), name.to_string())]
                .into_iter()
                .collect::<std::collections::BTreeMap<_, _>>(),
        )
    };
    vec![
        RawElement {
            element_type: "node".to_string(),
            id: 1,
            lat: Some(43.66),
            lon: Some(-79.39),
            center: None,
            tags: named("Acme Corp"),
        },
        RawElement {
            element_type: "way".to_string(),
            id: 2,
            lat: None,
            lon: None,
            center: Some(ElementCenter {
                lat: 43.67,
                lon: -79.38,
            }),
            tags: named("Zeta Holdings"),
        },
        RawElement {
            element_type: "node".to_string(),
            id: 3,
            lat: Some(43.68),
            lon: Some(-79.37),
            center: None,
            tags: Some(
                [("office".to_string(), "company".to_string())]
                    .into_iter()
                    .collect(),
            ),
        },
    ]
}

async fn test_app() -> Router {
    test_app_with_elements(smoke_elements()).await
}

async fn test_app_with_elements(elements: Vec<RawElement>) -> Router {
    let store = Store::open_in_memory().await.unwrap();
    store.migrate().await.unwrap();
    let config = SyncConfig {
        overpass_throttle_ms: 0,
        center_retry_delay_ms: 0,
        wikidata_throttle_ms: 0,
        ..SyncConfig::default()
    };
    let engine = Arc::new(RefreshEngine::new(
        store.clone(),
        Arc::new(FixedOverpass { elements }),
        Arc::new(EmptyWikidata),
        config,
    ));
    let state = AppState::new(
        store,
        engine,
        WebConfig {
            admin_token: Some(ADMIN_TOKEN.to_string()),
            ..WebConfig::default()
        },
    );
    app(state)
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn get_admin(uri: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header(header::AUTHORIZATION, format!("Bearer {ADMIN_TOKEN}"))
        .body(Body::empty())
        .unwrap()
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn post_json_admin(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::AUTHORIZATION, format!("Bearer {ADMIN_TOKEN}"))
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn upload_csv(uri: &str, csv: &str) -> Request<Body> {
    let body = format!(
        "--{BOUNDARY}\r\n\
         Content-Disposition: form-data; name=\"file\"; filename=\"upload.csv\"\r\n\
         Content-Type: text/csv\r\n\r\n\
         {csv}\r\n\
         --{BOUNDARY}--\r\n"
    );
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::AUTHORIZATION, format!("Bearer {ADMIN_TOKEN}"))
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .body(Body::from(body))
        .unwrap()
}

const PM_CENTERS_CSV: &str = "center_code,name,lat,lon,country,region,tier,source_url\n\
                              PM,Princess Margaret,43.6582,-79.3907,Canada,ON,,\n";
const ACME_COMPANIES_CSV: &str =
    "company_name,known_aliases\nAcme,Acme Corp|Acme Ltd\n";

async fn seed_pm_and_acme(app: &Router) {
    let (status, body) = send(
        app,
        upload_csv("/api/admin/centers/upload-csv", PM_CENTERS_CSV),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["inserted"], 1);

    let (status, body) = send(
        app,
        upload_csv("/api/admin/companies/upload-csv", ACME_COMPANIES_CSV),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["inserted"], 1);
}

#[tokio::test]
async fn health_is_public_and_carries_cors_headers() {
    let app = test_app().await;
    let response = app.clone().oneshot(get("/api/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()["access-control-allow-origin"].to_str().unwrap(),
        "*"
    );
    assert_eq!(
        response.headers()[header::CONTENT_TYPE].to_str().unwrap(),
        "application/json; charset=utf-8"
    );
}

#[tokio::test]
async fn options_short_circuits_to_204() {
    let app = test_app().await;
    let request = Request::builder()
        .method("OPTIONS")
        .uri("/api/centers")
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert_eq!(
        response.headers()["access-control-allow-methods"].to_str().unwrap(),
        "GET,POST,OPTIONS"
    );
}

#[tokio::test]
async fn unknown_routes_return_json_404() {
    let app = test_app().await;
    let (status, body) = send(&app, get("/api/nope")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "not found");
}

#[tokio::test]
async fn admin_routes_require_the_bearer_token() {
    let app = test_app().await;

    let (status, _) = send(&app, get("/api/admin/status")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let bad = Request::builder()
        .uri("/api/admin/status")
        .header(header::AUTHORIZATION, "Bearer wrong-token!")
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(&app, bad).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = send(&app, get_admin("/api/admin/status")).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn happy_refresh_end_to_end() {
    let app = test_app().await;
    seed_pm_and_acme(&app).await;

    let (status, body) = send(
        &app,
        post_json_admin("/api/admin/refresh-center/1", json!({ "radiusKm": 25 })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["ok"], true);
    assert_eq!(body["offices_fetched"], 2);
    assert_eq!(body["offices_matched"], 1);
    assert_eq!(body["offices_filtered_out_no_company_match"], 1);
    assert_eq!(body["links_upserted"], 1);

    let (status, body) = send(&app, get("/api/centers/1/offices?radiusKm=25")).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["radiusKm"], 25);
    assert_eq!(body["center"]["centerCode"], "PM");
    let offices = body["offices"].as_array().unwrap();
    assert_eq!(offices.len(), 1);
    assert_eq!(offices[0]["name"], "Acme Corp");
    assert_eq!(offices[0]["linkedCompanyName"], "Acme");
    assert_eq!(offices[0]["osmType"], "node");
    let distance = offices[0]["distanceM"].as_f64().unwrap();
    let expected = oncomap_core::geo::haversine_meters(43.6582, -79.3907, 43.66, -79.39);
    assert!((distance - expected).abs() < 1.0, "distance {distance}");
}

#[tokio::test]
async fn ban_propagation_end_to_end() {
    let app = test_app().await;
    seed_pm_and_acme(&app).await;
    send(
        &app,
        post_json_admin("/api/admin/refresh-center/1", json!({ "radiusKm": 25 })),
    )
    .await;

    let (status, body) = send(
        &app,
        post_json(
            "/api/offices/flag-deletion",
            json!({ "centerId": 1, "osmType": "node", "osmId": 1, "reason": "not an office" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["outcome"], "created");
    let flag_id = body["flagId"].as_i64().unwrap();

    let (status, body) = send(
        &app,
        post_json_admin(
            &format!("/api/admin/offices/deletion-flags/{flag_id}/decision"),
            json!({ "decision": "approve" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["outcome"], "approved");
    assert_eq!(body["deletedLinks"], 1);
    assert_eq!(body["deletedOffices"], 1);

    let (_, body) = send(&app, get("/api/centers/1/offices?radiusKm=25")).await;
    assert!(body["offices"].as_array().unwrap().is_empty());

    // Re-running the refresh with the unchanged upstream keeps it out.
    let (_, body) = send(
        &app,
        post_json_admin("/api/admin/refresh-center/1", json!({ "radiusKm": 25 })),
    )
    .await;
    assert_eq!(body["offices_fetched"], 2);
    assert_eq!(body["links_upserted"], 0);

    // Flagging again reports the standing ban.
    let (status, body) = send(
        &app,
        post_json(
            "/api/offices/flag-deletion",
            json!({ "centerId": 1, "osmType": "node", "osmId": 1 }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["outcome"], "already_banned");

    // Approving the same flag again changes nothing; rejecting conflicts.
    let (status, body) = send(
        &app,
        post_json_admin(
            &format!("/api/admin/offices/deletion-flags/{flag_id}/decision"),
            json!({ "decision": "approve" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["outcome"], "already_approved");
    let (status, _) = send(
        &app,
        post_json_admin(
            &format!("/api/admin/offices/deletion-flags/{flag_id}/decision"),
            json!({ "decision": "reject" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn soft_disable_on_second_centers_upload() {
    let app = test_app().await;
    seed_pm_and_acme(&app).await;

    let df_csv = "center_code,name,lat,lon,country,region,tier,source_url\n\
                  DF,Dana-Farber,42.3375,-71.1073,USA,MA,,\n";
    let (status, body) = send(&app, upload_csv("/api/admin/centers/upload-csv", df_csv)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["inserted"], 1);
    assert_eq!(body["disabled"], 1);

    let (_, body) = send(&app, get("/api/centers?activeOnly=true")).await;
    let codes: Vec<&str> = body
        .as_array()
        .unwrap()
        .iter()
        .map(|c| c["centerCode"].as_str().unwrap())
        .collect();
    assert_eq!(codes, vec!["DF"]);

    let (_, body) = send(&app, get("/api/centers?activeOnly=false")).await;
    assert_eq!(body.as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn center_reads_validate_inputs() {
    let app = test_app().await;
    seed_pm_and_acme(&app).await;

    let (status, _) = send(&app, get("/api/centers?activeOnly=banana")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(&app, get("/api/centers/1/offices?limit=0")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let (status, _) = send(&app, get("/api/centers/1/offices?limit=-3")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let (status, _) = send(&app, get("/api/centers/1/offices?radiusKm=abc")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // Out-of-range radius clamps instead of failing on the public read.
    let (status, body) = send(&app, get("/api/centers/1/offices?radiusKm=500")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["radiusKm"], 100);

    let (status, _) = send(&app, get("/api/centers/999/offices")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = send(&app, get("/api/centers/999")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn admin_refresh_rejects_off_menu_radius() {
    let app = test_app().await;
    seed_pm_and_acme(&app).await;

    let (status, _) = send(
        &app,
        post_json_admin("/api/admin/refresh-center/1", json!({ "radiusKm": 101 })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(
        &app,
        post_json_admin("/api/admin/refresh-center/1", json!({ "radiusKm": 100 })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = send(
        &app,
        post_json_admin("/api/admin/refresh-center/1", json!({ "maxOffices": 0 })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(
        &app,
        post_json_admin("/api/admin/refresh-center/999", json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn csv_uploads_reject_bad_files() {
    let app = test_app().await;

    let unterminated = "center_code,name,lat,lon,country,region,tier,source_url\n\
                        PM,\"Princess Margaret,43.6,-79.3,,,,\n";
    let (status, body) = send(
        &app,
        upload_csv("/api/admin/centers/upload-csv", unterminated),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("unterminated"));

    let header_only = "center_code,name,lat,lon,country,region,tier,source_url\n";
    let (status, _) = send(&app, upload_csv("/api/admin/centers/upload-csv", header_only)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let missing_header = "code,name\nPM,x\n";
    let (status, _) = send(
        &app,
        upload_csv("/api/admin/centers/upload-csv", missing_header),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn csv_upload_reports_row_issues_but_succeeds() {
    let app = test_app().await;
    let csv = "center_code,name,lat,lon,country,region,tier,source_url\n\
               PM,Princess Margaret,43.6582,-79.3907,,,,\n\
               bad code,Nope,1,2,,,,\n";
    let (status, body) = send(&app, upload_csv("/api/admin/centers/upload-csv", csv)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["inserted"], 1);
    let issues = body["issues"].as_array().unwrap();
    assert_eq!(issues.len(), 1);
    assert_eq!(issues[0]["row"], 3);
}

#[tokio::test]
async fn company_reupload_skips_existing_rows() {
    let app = test_app().await;
    // `Acme Ltd` collapses to the company name and is dropped; `Zenith
    // Widgets` survives as the one real alias.
    let csv = "company_name,known_aliases\nAcme,Acme Ltd|Zenith Widgets\n";
    let (_, first) = send(&app, upload_csv("/api/admin/companies/upload-csv", csv)).await;
    assert_eq!(first["inserted"], 1);
    let (_, second) = send(&app, upload_csv("/api/admin/companies/upload-csv", csv)).await;
    assert_eq!(second["inserted"], 0);
    assert_eq!(second["skipped"], 1);

    let (_, listing) = send(&app, get_admin("/api/admin/companies")).await;
    let companies = listing["companies"].as_array().unwrap();
    assert_eq!(companies.len(), 1);
    assert_eq!(companies[0]["companyName"], "Acme");
    assert_eq!(companies[0]["aliasCount"], 1);
}

#[tokio::test]
async fn flag_submission_validates_and_404s() {
    let app = test_app().await;
    seed_pm_and_acme(&app).await;

    let (status, _) = send(
        &app,
        post_json("/api/offices/flag-deletion", json!({ "centerId": 1 })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(
        &app,
        post_json(
            "/api/offices/flag-deletion",
            json!({ "centerId": 1, "osmType": "area", "osmId": 1 }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // No refresh has run, so no link exists yet.
    let (status, _) = send(
        &app,
        post_json(
            "/api/offices/flag-deletion",
            json!({ "centerId": 1, "osmType": "node", "osmId": 1 }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(
        &app,
        post_json(
            "/api/offices/flag-deletion",
            json!({ "centerId": 42, "osmType": "node", "osmId": 1 }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn duplicate_flags_return_the_pending_id() {
    let app = test_app().await;
    seed_pm_and_acme(&app).await;
    send(
        &app,
        post_json_admin("/api/admin/refresh-center/1", json!({ "radiusKm": 25 })),
    )
    .await;

    let flag = json!({ "centerId": 1, "osmType": "node", "osmId": 1 });
    let (_, first) = send(&app, post_json("/api/offices/flag-deletion", flag.clone())).await;
    assert_eq!(first["outcome"], "created");
    let (_, second) = send(&app, post_json("/api/offices/flag-deletion", flag)).await;
    assert_eq!(second["outcome"], "already_pending");
    assert_eq!(second["flagId"], first["flagId"]);

    let (_, flags) = send(
        &app,
        get_admin("/api/admin/offices/deletion-flags?status=pending"),
    )
    .await;
    assert_eq!(flags["flags"].as_array().unwrap().len(), 1);

    let (status, _) = send(
        &app,
        get_admin("/api/admin/offices/deletion-flags?status=bogus"),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn flag_decisions_validate_and_404() {
    let app = test_app().await;

    let (status, _) = send(
        &app,
        post_json_admin(
            "/api/admin/offices/deletion-flags/1/decision",
            json!({ "decision": "maybe" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(
        &app,
        post_json_admin(
            "/api/admin/offices/deletion-flags/1/decision",
            json!({ "decision": "approve" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn status_reflects_refresh_recency_and_counts() {
    let app = test_app().await;
    seed_pm_and_acme(&app).await;

    let (_, before) = send(&app, get_admin("/api/admin/status")).await;
    assert_eq!(before["ok"], false);
    assert_eq!(before["checks"]["refreshStatePresent"], false);
    assert_eq!(before["checks"]["activeCentersAtLeastOne"], true);
    assert_eq!(before["metrics"]["exactCounts"], false);
    assert!(before["metrics"].get("officesTotal").is_none());

    let (status, body) = send(
        &app,
        post_json_admin("/api/admin/refresh-batch", json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");

    let (_, after) = send(&app, get_admin("/api/admin/status?includeCounts=true")).await;
    assert_eq!(after["ok"], true, "{after}");
    assert_eq!(after["checks"]["refreshRecentEnough"], true);
    assert_eq!(after["metrics"]["exactCounts"], true);
    assert_eq!(after["metrics"]["officesTotal"], 1);
    assert_eq!(after["metrics"]["centerOfficeLinksTotal"], 1);
    assert_eq!(after["refresh"]["cursor"], 1);
}

#[tokio::test]
async fn refresh_all_returns_summary_with_ok() {
    let app = test_app().await;
    seed_pm_and_acme(&app).await;

    let (status, body) = send(
        &app,
        post_json_admin(
            "/api/admin/refresh-all",
            json!({ "delayMs": 0, "batchSize": 5, "fullClean": false }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["ok"], true);
    assert_eq!(body["centers_processed"], 1);
    assert_eq!(body["centers_failed"], 0);

    let (status, _) = send(
        &app,
        post_json_admin("/api/admin/refresh-all", json!({ "radiusKm": 33 })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn office_search_and_confidence_filters_pass_through() {
    let mut elements = smoke_elements();
    // Give the low-signal node identifying tags so both offices match Acme.
    if let Some(tags) = &mut elements[1].tags {
        tags.insert("name".to_string(), "Acme Ltd".to_string());
        tags.insert("brand".to_string(), "Acme".to_string());
    }
    let app = test_app_with_elements(elements).await;
    seed_pm_and_acme(&app).await;
    send(
        &app,
        post_json_admin("/api/admin/refresh-center/1", json!({ "radiusKm": 25 })),
    )
    .await;

    let (_, all) = send(&app, get("/api/centers/1/offices?radiusKm=25")).await;
    assert_eq!(all["offices"].as_array().unwrap().len(), 2);

    let (_, searched) = send(
        &app,
        get("/api/centers/1/offices?radiusKm=25&search=acme%20c"),
    )
    .await;
    let offices = searched["offices"].as_array().unwrap();
    assert_eq!(offices.len(), 1);
    assert_eq!(offices[0]["name"], "Acme Corp");

    let (_, high) = send(
        &app,
        get("/api/centers/1/offices?radiusKm=25&highConfidenceOnly=true"),
    )
    .await;
    // The bare node has no identifying tags; only the branded way remains.
    assert_eq!(high["offices"].as_array().unwrap().len(), 1);
    assert_eq!(high["offices"][0]["name"], "Acme Ltd");
}
