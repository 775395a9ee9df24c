//! Raw Overpass elements -> canonical [`Office`] records.

use std::collections::HashMap;

use oncomap_core::geo::{coord_key, normalize_wikidata};
use oncomap_core::text::{normalized_name_key, sanitize_text};
use oncomap_core::{Office, OsmType};

use crate::overpass::RawElement;

const NAME_MAX: usize = 250;
const BRAND_MAX: usize = 250;
const OPERATOR_MAX: usize = 250;
const WEBSITE_MAX: usize = 500;
const WIKIDATA_TAG_MAX: usize = 250;

/// Turn raw elements into deduplicated offices.
///
/// Drops elements with an unknown type, no coordinate, or no usable name.
/// Duplicates (same collapsed name at the same six-decimal coordinate) keep
/// the variant with the richer tag evidence.
pub fn normalize_elements(elements: Vec<RawElement>) -> Vec<Office> {
    let mut offices: Vec<Office> = Vec::new();
    let mut by_key: HashMap<(String, String, String), usize> = HashMap::new();

    for element in elements {
        let Some(office) = normalize_element(element) else {
            continue;
        };
        let key = (
            normalized_name_key(office.name.as_deref().unwrap_or("")),
            coord_key(office.lat),
            coord_key(office.lon),
        );
        match by_key.get(&key) {
            Some(existing) => {
                if evidence_score(&office) > evidence_score(&offices[*existing]) {
                    offices[*existing] = office;
                }
            }
            None => {
                by_key.insert(key, offices.len());
                offices.push(office);
            }
        }
    }

    offices
}

fn normalize_element(element: RawElement) -> Option<Office> {
    let osm_type: OsmType = element.element_type.parse().ok()?;
    let (lat, lon) = match (element.lat, element.lon, &element.center) {
        (Some(lat), Some(lon), _) => (lat, lon),
        (_, _, Some(center)) => (center.lat, center.lon),
        _ => return None,
    };

    let tags = element.tags.unwrap_or_default();
    let name = sanitize_text(tags.get("name").map(String::as_str).unwrap_or(""), NAME_MAX)?;

    let brand = tag(&tags, "brand", BRAND_MAX);
    let operator = tag(&tags, "operator", OPERATOR_MAX);
    let website = tag(&tags, "website", WEBSITE_MAX);
    let wikidata = tag(&tags, "wikidata", WIKIDATA_TAG_MAX);
    let wikidata_entity_id = wikidata.as_deref().and_then(normalize_wikidata);

    let low_confidence =
        website.is_none() && wikidata.is_none() && brand.is_none() && operator.is_none();
    let tags_json = serde_json::to_string(&tags).ok();

    Some(Office {
        osm_type,
        osm_id: element.id,
        name: Some(name),
        brand,
        operator,
        website,
        wikidata,
        wikidata_entity_id,
        lat,
        lon,
        low_confidence,
        tags_json,
        employee_count: None,
        employee_count_as_of: None,
        market_cap: None,
        market_cap_currency_qid: None,
        market_cap_as_of: None,
        wikidata_enriched_at: None,
        updated_at: None,
    })
}

fn tag(
    tags: &std::collections::BTreeMap<String, String>,
    key: &str,
    max_len: usize,
) -> Option<String> {
    tags.get(key).and_then(|value| sanitize_text(value, max_len))
}

/// Richness of a duplicate's identifying tags; higher wins the dedupe.
fn evidence_score(office: &Office) -> u32 {
    let mut score = 0;
    if office.website.is_some() {
        score += 4;
    }
    if office.wikidata.is_some() {
        score += 3;
    }
    if office.brand.is_some() {
        score += 2;
    }
    if office.operator.is_some() {
        score += 1;
    }
    score
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn element(
        element_type: &str,
        id: i64,
        coords: Option<(f64, f64)>,
        center: Option<(f64, f64)>,
        tags: &[(&str, &str)],
    ) -> RawElement {
        RawElement {
            element_type: element_type.to_string(),
            id,
            lat: coords.map(|c| c.0),
            lon: coords.map(|c| c.1),
            center: center.map(|c| crate::overpass::ElementCenter { lat: c.0, lon: c.1 }),
            tags: if tags.is_empty() {
                None
            } else {
                Some(
                    tags.iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect::<BTreeMap<_, _>>(),
                )
            },
        }
    }

    #[test]
    fn unnamed_and_coordinate_free_elements_are_dropped() {
        let offices = normalize_elements(vec![
            element("node", 1, Some((43.66, -79.39)), None, &[("name", "Acme Corp")]),
            element("node", 2, Some((43.67, -79.38)), None, &[("office", "company")]),
            element("way", 3, None, None, &[("name", "No Coordinates")]),
            element("area", 4, Some((1.0, 2.0)), None, &[("name", "Bad Type")]),
        ]);
        assert_eq!(offices.len(), 1);
        assert_eq!(offices[0].name.as_deref(), Some("Acme Corp"));
    }

    #[test]
    fn ways_take_their_centroid_coordinate() {
        let offices = normalize_elements(vec![element(
            "way",
            2,
            None,
            Some((43.67, -79.38)),
            &[("name", "Zeta Holdings")],
        )]);
        assert_eq!(offices.len(), 1);
        assert_eq!(offices[0].osm_type, OsmType::Way);
        assert_eq!(offices[0].lat, 43.67);
    }

    #[test]
    fn low_confidence_marks_offices_without_identifying_tags() {
        let offices = normalize_elements(vec![
            element("node", 1, Some((1.0, 1.0)), None, &[("name", "Bare Name")]),
            element(
                "node",
                2,
                Some((2.0, 2.0)),
                None,
                &[("name", "Tagged"), ("brand", "Tagged Brand")],
            ),
        ]);
        assert!(offices[0].low_confidence);
        assert!(!offices[1].low_confidence);
    }

    #[test]
    fn wikidata_tag_is_normalized_to_an_entity_id() {
        let offices = normalize_elements(vec![element(
            "node",
            1,
            Some((1.0, 1.0)),
            None,
            &[("name", "Acme"), ("wikidata", "q12345")],
        )]);
        assert_eq!(offices[0].wikidata.as_deref(), Some("q12345"));
        assert_eq!(offices[0].wikidata_entity_id.as_deref(), Some("Q12345"));
    }

    #[test]
    fn duplicates_keep_the_richer_variant() {
        let offices = normalize_elements(vec![
            element("node", 1, Some((43.660000, -79.390000)), None, &[("name", "Acme Corp")]),
            element(
                "node",
                2,
                Some((43.6600001, -79.3900004)),
                None,
                &[("name", "ACME  corp"), ("website", "https://acme.example")],
            ),
        ]);
        assert_eq!(offices.len(), 1);
        assert_eq!(offices[0].osm_id, 2);
        assert!(offices[0].website.is_some());
    }

    #[test]
    fn duplicate_tie_keeps_the_first_seen() {
        let offices = normalize_elements(vec![
            element("node", 1, Some((1.0, 1.0)), None, &[("name", "Acme")]),
            element("node", 2, Some((1.0, 1.0)), None, &[("name", "acme")]),
        ]);
        assert_eq!(offices.len(), 1);
        assert_eq!(offices[0].osm_id, 1);
    }

    #[test]
    fn tags_json_round_trips_the_raw_map() {
        let offices = normalize_elements(vec![element(
            "node",
            1,
            Some((1.0, 1.0)),
            None,
            &[("name", "Acme"), ("office", "company")],
        )]);
        let parsed: BTreeMap<String, String> =
            serde_json::from_str(offices[0].tags_json.as_deref().unwrap()).unwrap();
        assert_eq!(parsed["office"], "company");
    }
}
