//! Geographic primitives shared by the refresh pipeline and the read path.

use std::sync::LazyLock;

use regex::Regex;

const EARTH_RADIUS_M: f64 = 6_371_000.0;

static WIKIDATA_QID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bQ[1-9]\d*\b").expect("valid Q-id regex"));

/// Great-circle distance in meters between two WGS-84 points.
pub fn haversine_meters(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let phi1 = lat1.to_radians();
    let phi2 = lat2.to_radians();
    let d_phi = (lat2 - lat1).to_radians();
    let d_lambda = (lon2 - lon1).to_radians();

    let a = (d_phi / 2.0).sin().powi(2)
        + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
    EARTH_RADIUS_M * c
}

/// Extract a canonical `Q<digits>` entity id from a raw `wikidata` tag.
///
/// The upstream tag is free-form; values like `q42`, `Q42;Q7` or
/// `https://www.wikidata.org/wiki/Q42` all carry a usable id. Returns the
/// first id found, uppercased, or `None`.
pub fn normalize_wikidata(raw: &str) -> Option<String> {
    WIKIDATA_QID
        .find(raw)
        .map(|m| m.as_str().to_ascii_uppercase())
}

/// Key fragment for coordinate-based dedupe: fixed six decimal places.
pub fn coord_key(value: f64) -> String {
    format!("{value:.6}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn haversine_of_identical_points_is_zero() {
        assert_eq!(haversine_meters(43.6582, -79.3907, 43.6582, -79.3907), 0.0);
    }

    #[test]
    fn haversine_toronto_sample_is_about_208m() {
        // Princess Margaret -> a nearby downtown node, the canonical smoke
        // pair used across the integration tests.
        let d = haversine_meters(43.6582, -79.3907, 43.66, -79.39);
        assert!((d - 208.0).abs() < 5.0, "got {d}");
    }

    #[test]
    fn haversine_one_degree_longitude_at_equator() {
        let d = haversine_meters(0.0, 0.0, 0.0, 1.0);
        assert!((d - 111_195.0).abs() < 100.0, "got {d}");
    }

    #[test]
    fn wikidata_normalization_accepts_common_shapes() {
        assert_eq!(normalize_wikidata("Q42").as_deref(), Some("Q42"));
        assert_eq!(normalize_wikidata("q42").as_deref(), Some("Q42"));
        assert_eq!(
            normalize_wikidata("https://www.wikidata.org/wiki/Q95").as_deref(),
            Some("Q95")
        );
        assert_eq!(normalize_wikidata("Q42;Q7").as_deref(), Some("Q42"));
    }

    #[test]
    fn wikidata_normalization_rejects_non_ids() {
        assert_eq!(normalize_wikidata("Q0"), None);
        assert_eq!(normalize_wikidata("FAQ12"), None);
        assert_eq!(normalize_wikidata("quarter 9"), None);
        assert_eq!(normalize_wikidata(""), None);
    }

    #[test]
    fn coord_key_is_stable_at_six_decimals() {
        assert_eq!(coord_key(43.66), "43.660000");
        assert_eq!(coord_key(-79.3907001), "-79.390700");
    }
}
