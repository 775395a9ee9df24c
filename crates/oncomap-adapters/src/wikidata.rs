//! Wikidata entity-claims client for office enrichment.
//!
//! Looks up employee count (`P1128`) and market cap (`P2226`) for batches of
//! Q-ids, picking the best-ranked, most recently qualified claim per
//! property.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

use oncomap_core::WikidataFacts;

use crate::retry_delay;

pub const DEFAULT_WIKIDATA_API_URL: &str = "https://www.wikidata.org/w/api.php";

const EMPLOYEE_COUNT_PROP: &str = "P1128";
const MARKET_CAP_PROP: &str = "P2226";
const AS_OF_PROP: &str = "P585";
const CHUNK_SIZE: usize = 30;
const MAX_ATTEMPTS: u32 = 3;

#[derive(Debug, Error)]
pub enum WikidataError {
    #[error("wikidata returned http {status}")]
    HttpStatus { status: u16 },
    #[error("wikidata request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("wikidata returned unparseable json: {0}")]
    Decode(#[from] serde_json::Error),
}

#[async_trait]
pub trait WikidataApi: Send + Sync {
    async fn fetch_entity_facts(&self, ids: &[String]) -> Result<Vec<WikidataFacts>, WikidataError>;
}

#[derive(Debug, Clone)]
pub struct HttpWikidataClient {
    client: reqwest::Client,
    api_url: String,
    chunk_throttle: Duration,
}

impl HttpWikidataClient {
    pub fn new(
        api_url: String,
        timeout: Duration,
        chunk_throttle: Duration,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().gzip(true).timeout(timeout).build()?;
        Ok(Self {
            client,
            api_url,
            chunk_throttle,
        })
    }

    async fn fetch_chunk(&self, ids: &[String]) -> Result<Value, WikidataError> {
        let joined = ids.join("|");
        let mut last_error: Option<WikidataError> = None;

        for attempt in 1..=MAX_ATTEMPTS {
            let sent = self
                .client
                .get(&self.api_url)
                .query(&[
                    ("action", "wbgetentities"),
                    ("format", "json"),
                    ("props", "claims"),
                    ("ids", joined.as_str()),
                ])
                .send()
                .await;

            match sent {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        let text = resp.text().await.map_err(WikidataError::Request)?;
                        return Ok(serde_json::from_str(&text)?);
                    }
                    last_error = Some(WikidataError::HttpStatus {
                        status: status.as_u16(),
                    });
                    if (status.as_u16() == 429 || status.is_server_error())
                        && attempt < MAX_ATTEMPTS
                    {
                        warn!(status = status.as_u16(), attempt, "wikidata retryable status");
                        tokio::time::sleep(retry_delay(attempt)).await;
                        continue;
                    }
                    break;
                }
                Err(source) => {
                    warn!(attempt, error = %source, "wikidata transport error");
                    last_error = Some(WikidataError::Request(source));
                    if attempt < MAX_ATTEMPTS {
                        tokio::time::sleep(retry_delay(attempt)).await;
                        continue;
                    }
                }
            }
        }

        Err(last_error.expect("attempt loop records an error before exiting"))
    }
}

#[async_trait]
impl WikidataApi for HttpWikidataClient {
    async fn fetch_entity_facts(&self, ids: &[String]) -> Result<Vec<WikidataFacts>, WikidataError> {
        let mut facts = Vec::with_capacity(ids.len());
        let chunks: Vec<&[String]> = ids.chunks(CHUNK_SIZE).collect();
        let chunk_count = chunks.len();

        for (index, chunk) in chunks.into_iter().enumerate() {
            let body = self.fetch_chunk(chunk).await?;
            facts.extend(parse_entities(&body));
            if index + 1 < chunk_count && !self.chunk_throttle.is_zero() {
                tokio::time::sleep(self.chunk_throttle).await;
            }
        }

        Ok(facts)
    }
}

/// Extract facts for every non-missing entity in a `wbgetentities` body.
pub fn parse_entities(body: &Value) -> Vec<WikidataFacts> {
    let Some(entities) = body.get("entities").and_then(Value::as_object) else {
        return Vec::new();
    };

    let mut out = Vec::with_capacity(entities.len());
    for (entity_id, entity) in entities {
        if entity.get("missing").is_some() {
            continue;
        }
        let mut facts = WikidataFacts {
            entity_id: entity_id.clone(),
            ..WikidataFacts::default()
        };
        if let Some(claim) = best_quantity_claim(entity, EMPLOYEE_COUNT_PROP) {
            let rounded = claim.amount.round();
            if rounded >= 0.0 {
                facts.employee_count = Some(rounded as i64);
                facts.employee_count_as_of = claim.as_of;
            }
        }
        if let Some(claim) = best_quantity_claim(entity, MARKET_CAP_PROP) {
            facts.market_cap = Some(claim.amount);
            facts.market_cap_currency_qid = claim.unit_qid;
            facts.market_cap_as_of = claim.as_of;
        }
        out.push(facts);
    }
    out
}

struct QuantityClaim {
    amount: f64,
    unit_qid: Option<String>,
    as_of: Option<String>,
    rank: u8,
}

fn rank_order(rank: &str) -> u8 {
    match rank {
        "preferred" => 0,
        "normal" => 1,
        _ => 2,
    }
}

/// Best non-deprecated quantity claim for `prop`: rank first, then the most
/// recent `P585` qualifier.
fn best_quantity_claim(entity: &Value, prop: &str) -> Option<QuantityClaim> {
    let claims = entity.get("claims")?.get(prop)?.as_array()?;

    let mut best: Option<QuantityClaim> = None;
    for claim in claims {
        let rank_str = claim.get("rank").and_then(Value::as_str).unwrap_or("normal");
        if rank_str == "deprecated" {
            continue;
        }
        let Some((amount, unit_qid)) = parse_quantity_snak(claim.get("mainsnak")) else {
            continue;
        };
        let candidate = QuantityClaim {
            amount,
            unit_qid,
            as_of: most_recent_as_of(claim),
            rank: rank_order(rank_str),
        };
        let better = match &best {
            None => true,
            Some(current) => {
                candidate.rank < current.rank
                    || (candidate.rank == current.rank && candidate.as_of > current.as_of)
            }
        };
        if better {
            best = Some(candidate);
        }
    }
    best
}

fn parse_quantity_snak(mainsnak: Option<&Value>) -> Option<(f64, Option<String>)> {
    let value = mainsnak?.get("datavalue")?.get("value")?;
    let amount: f64 = value.get("amount")?.as_str()?.parse().ok()?;
    let unit_qid = value
        .get("unit")
        .and_then(Value::as_str)
        .and_then(|unit| unit.rsplit('/').next())
        .filter(|segment| segment.starts_with('Q'))
        .map(str::to_string);
    Some((amount, unit_qid))
}

fn most_recent_as_of(claim: &Value) -> Option<String> {
    let snaks = claim.get("qualifiers")?.get(AS_OF_PROP)?.as_array()?;
    snaks
        .iter()
        .filter_map(|snak| {
            snak.get("datavalue")?
                .get("value")?
                .get("time")?
                .as_str()
                .and_then(canonicalize_wikidata_time)
        })
        .max()
}

/// `+2023-00-00T00:00:00Z` -> `2023-01-01`: strip the sign, keep the date
/// part, and rewrite zeroed month/day (reduced precision) to `01`.
fn canonicalize_wikidata_time(raw: &str) -> Option<String> {
    let date = raw.trim_start_matches('+').split('T').next()?;
    let mut parts = date.split('-');
    let year = parts.next()?;
    let month = parts.next()?;
    let day = parts.next()?;
    if year.len() != 4 || year.parse::<u32>().is_err() {
        return None;
    }
    let month = if month == "00" { "01" } else { month };
    let day = if day == "00" { "01" } else { day };
    Some(format!("{year}-{month}-{day}"))
}
