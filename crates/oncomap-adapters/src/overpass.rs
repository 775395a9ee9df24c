//! Overpass query construction and the failover POST client.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tracing::warn;

use crate::retry_delay;

pub const DEFAULT_OVERPASS_URL: &str = "https://overpass-api.de/api/interpreter";

const MAX_ATTEMPTS_PER_URL: u32 = 3;

/// One element from an Overpass JSON response. Ways and relations carry
/// their centroid under `center`; nodes carry top-level coordinates.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RawElement {
    #[serde(rename = "type")]
    pub element_type: String,
    pub id: i64,
    #[serde(default)]
    pub lat: Option<f64>,
    #[serde(default)]
    pub lon: Option<f64>,
    #[serde(default)]
    pub center: Option<ElementCenter>,
    #[serde(default)]
    pub tags: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ElementCenter {
    pub lat: f64,
    pub lon: f64,
}

#[derive(Debug, Deserialize)]
struct OverpassResponse {
    #[serde(default)]
    elements: Vec<RawElement>,
}

#[derive(Debug, Error)]
pub enum OverpassError {
    #[error("overpass {url} returned http {status}")]
    HttpStatus { status: u16, url: String },
    #[error("overpass request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("overpass {url} returned unparseable json: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("no overpass endpoints configured")]
    NoEndpoints,
}

/// Radius query for office points around one center.
pub fn build_radius_query(lat: f64, lon: f64, radius_m: u32) -> String {
    format!(
        "[out:json][timeout:25];\n\
         ( nwr(around:{radius_m}, {lat}, {lon})[\"office\"];\n  \
         nwr(around:{radius_m}, {lat}, {lon})[\"building\"=\"office\"]; );\n\
         out center tags;"
    )
}

#[async_trait]
pub trait OverpassApi: Send + Sync {
    async fn fetch_elements(
        &self,
        lat: f64,
        lon: f64,
        radius_m: u32,
    ) -> Result<Vec<RawElement>, OverpassError>;
}

/// Production client: POSTs the query to each configured endpoint in turn,
/// retrying retryable failures per endpoint before failing over.
#[derive(Debug, Clone)]
pub struct HttpOverpassClient {
    client: reqwest::Client,
    endpoints: Vec<String>,
}

impl HttpOverpassClient {
    pub fn new(endpoints: Vec<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().gzip(true).timeout(timeout).build()?;
        Ok(Self { client, endpoints })
    }

    /// Split a comma-separated endpoint list, dropping empty entries.
    pub fn parse_endpoint_list(raw: &str) -> Vec<String> {
        raw.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }
}

#[async_trait]
impl OverpassApi for HttpOverpassClient {
    async fn fetch_elements(
        &self,
        lat: f64,
        lon: f64,
        radius_m: u32,
    ) -> Result<Vec<RawElement>, OverpassError> {
        let query = build_radius_query(lat, lon, radius_m);
        let mut last_error = OverpassError::NoEndpoints;

        'urls: for url in &self.endpoints {
            for attempt in 1..=MAX_ATTEMPTS_PER_URL {
                let sent = self
                    .client
                    .post(url)
                    .header(reqwest::header::CONTENT_TYPE, "text/plain; charset=utf-8")
                    .body(query.clone())
                    .send()
                    .await;

                match sent {
                    Ok(resp) => {
                        let status = resp.status();
                        if status.is_success() {
                            let text = match resp.text().await {
                                Ok(text) => text,
                                Err(source) => {
                                    last_error = OverpassError::Request {
                                        url: url.clone(),
                                        source,
                                    };
                                    continue 'urls;
                                }
                            };
                            match serde_json::from_str::<OverpassResponse>(&text) {
                                Ok(parsed) => return Ok(parsed.elements),
                                Err(source) => {
                                    last_error = OverpassError::Decode {
                                        url: url.clone(),
                                        source,
                                    };
                                    continue 'urls;
                                }
                            }
                        }

                        let retryable =
                            status.as_u16() == 429 || status.is_server_error();
                        last_error = OverpassError::HttpStatus {
                            status: status.as_u16(),
                            url: url.clone(),
                        };
                        if retryable && attempt < MAX_ATTEMPTS_PER_URL {
                            warn!(url = %url, status = status.as_u16(), attempt, "overpass retryable status");
                            tokio::time::sleep(retry_delay(attempt)).await;
                            continue;
                        }
                        continue 'urls;
                    }
                    Err(source) => {
                        warn!(url = %url, attempt, error = %source, "overpass transport error");
                        last_error = OverpassError::Request {
                            url: url.clone(),
                            source,
                        };
                        if attempt < MAX_ATTEMPTS_PER_URL {
                            tokio::time::sleep(retry_delay(attempt)).await;
                            continue;
                        }
                        continue 'urls;
                    }
                }
            }
        }

        Err(last_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn radius_query_has_both_office_selectors() {
        let q = build_radius_query(43.6582, -79.3907, 25000);
        assert!(q.starts_with("[out:json][timeout:25];"));
        assert!(q.contains("nwr(around:25000, 43.6582, -79.3907)[\"office\"];"));
        assert!(q.contains("nwr(around:25000, 43.6582, -79.3907)[\"building\"=\"office\"];"));
        assert!(q.ends_with("out center tags;"));
    }

    #[test]
    fn endpoint_list_splits_on_commas() {
        let urls = HttpOverpassClient::parse_endpoint_list(
            "https://a.example/api, https://b.example/api ,,",
        );
        assert_eq!(urls, vec!["https://a.example/api", "https://b.example/api"]);
    }

    #[test]
    fn elements_deserialize_node_and_way_shapes() {
        let body = serde_json::json!({
            "elements": [
                {"type": "node", "id": 1, "lat": 43.66, "lon": -79.39,
                 "tags": {"name": "Acme Corp", "office": "company"}},
                {"type": "way", "id": 2, "center": {"lat": 43.67, "lon": -79.38},
                 "tags": {"name": "Zeta Holdings"}},
                {"type": "node", "id": 3}
            ]
        });
        let parsed: OverpassResponse = serde_json::from_value(body).unwrap();
        assert_eq!(parsed.elements.len(), 3);
        assert_eq!(parsed.elements[0].tags.as_ref().unwrap()["name"], "Acme Corp");
        assert_eq!(parsed.elements[1].center.as_ref().unwrap().lat, 43.67);
        assert!(parsed.elements[2].tags.is_none());
    }

    #[test]
    fn retry_delay_scales_linearly() {
        assert_eq!(crate::retry_delay(1).as_millis(), 400);
        assert_eq!(crate::retry_delay(2).as_millis(), 800);
    }
}
