//! Entity records persisted by the store and passed between pipeline stages.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Upstream element kind. Offices are identified by `(osm_type, osm_id)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OsmType {
    Node,
    Way,
    Relation,
}

impl OsmType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OsmType::Node => "node",
            OsmType::Way => "way",
            OsmType::Relation => "relation",
        }
    }
}

impl fmt::Display for OsmType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OsmType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "node" => Ok(OsmType::Node),
            "way" => Ok(OsmType::Way),
            "relation" => Ok(OsmType::Relation),
            _ => Err(()),
        }
    }
}

/// Composite office identity.
pub type OfficeKey = (OsmType, i64);

/// A curated geographic point of interest around which offices are searched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Center {
    pub id: i64,
    pub center_code: String,
    pub name: String,
    pub tier: Option<String>,
    pub lat: f64,
    pub lon: f64,
    pub country: Option<String>,
    pub region: Option<String>,
    pub source_url: Option<String>,
    pub is_active: bool,
    pub last_csv_sync_token: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// An office point drawn from the upstream tag-store, plus enrichment fields.
///
/// Born by refresh with the enrichment fields empty; a later Wikidata pass
/// fills them in under `wikidata_enriched_at`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Office {
    pub osm_type: OsmType,
    pub osm_id: i64,
    pub name: Option<String>,
    pub brand: Option<String>,
    pub operator: Option<String>,
    pub website: Option<String>,
    pub wikidata: Option<String>,
    pub wikidata_entity_id: Option<String>,
    pub lat: f64,
    pub lon: f64,
    pub low_confidence: bool,
    pub tags_json: Option<String>,
    pub employee_count: Option<i64>,
    pub employee_count_as_of: Option<String>,
    pub market_cap: Option<f64>,
    pub market_cap_currency_qid: Option<String>,
    pub market_cap_as_of: Option<String>,
    pub wikidata_enriched_at: Option<String>,
    pub updated_at: Option<String>,
}

impl Office {
    pub fn key(&self) -> OfficeKey {
        (self.osm_type, self.osm_id)
    }
}

/// Association of one center with one office plus the precomputed distance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CenterOfficeLink {
    pub center_id: i64,
    pub osm_type: OsmType,
    pub osm_id: i64,
    pub distance_m: f64,
    pub last_seen: String,
}

/// A curated known company with optional pipe-delimited aliases.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Company {
    pub id: i64,
    pub company_name: String,
    pub company_name_normalized: String,
    pub known_aliases: Option<String>,
    pub hq_country: Option<String>,
    pub description: Option<String>,
    pub company_type: Option<String>,
    pub geography: Option<String>,
    pub industry: Option<String>,
    pub suitability_tier: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlagStatus {
    Pending,
    Approved,
    Rejected,
}

impl FlagStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlagStatus::Pending => "pending",
            FlagStatus::Approved => "approved",
            FlagStatus::Rejected => "rejected",
        }
    }
}

impl FromStr for FlagStatus {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(FlagStatus::Pending),
            "approved" => Ok(FlagStatus::Approved),
            "rejected" => Ok(FlagStatus::Rejected),
            _ => Err(()),
        }
    }
}

/// A user request to remove an office point, reviewed by an admin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfficeDeletionFlag {
    pub id: i64,
    pub center_id: Option<i64>,
    pub osm_type: OsmType,
    pub osm_id: i64,
    pub reason: Option<String>,
    pub status: FlagStatus,
    pub submitted_at: String,
    pub reviewed_at: Option<String>,
}

/// Enrichment claims resolved for one Wikidata entity.
///
/// A row exists for every entity the enrichment API returned, even when
/// both properties came back empty, so applying it clears stale values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WikidataFacts {
    pub entity_id: String,
    pub employee_count: Option<i64>,
    pub employee_count_as_of: Option<String>,
    pub market_cap: Option<f64>,
    pub market_cap_currency_qid: Option<String>,
    pub market_cap_as_of: Option<String>,
}

/// Outcome of upserting one center CSV row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CenterUpsertOutcome {
    Inserted,
    Updated,
}

/// Outcome of inserting one company CSV row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompanyInsertOutcome {
    Inserted,
    Skipped,
}

/// Outcome of submitting a deletion flag for `(osm_type, osm_id)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlagSubmitOutcome {
    Created { flag_id: i64 },
    AlreadyPending { flag_id: i64 },
    AlreadyBanned,
}

/// Outcome of an admin decision on a deletion flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlagDecisionOutcome {
    Approved {
        deleted_links: u64,
        deleted_offices: u64,
    },
    Rejected,
    AlreadyApproved,
    AlreadyRejected,
    NotFound,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn osm_type_round_trips_through_str() {
        for t in [OsmType::Node, OsmType::Way, OsmType::Relation] {
            assert_eq!(t.as_str().parse::<OsmType>(), Ok(t));
        }
        assert!("area".parse::<OsmType>().is_err());
    }

    #[test]
    fn flag_status_parses_known_values_only() {
        assert_eq!("pending".parse::<FlagStatus>(), Ok(FlagStatus::Pending));
        assert!("open".parse::<FlagStatus>().is_err());
    }
}
