//! Company-name matching engine.
//!
//! Builds an in-memory index over curated company names and their aliases,
//! then decides whether an office's `name`/`brand`/`operator` belongs to a
//! known company. Scores blend token containment, Jaccard overlap, and edit
//! similarity; a hard acceptance threshold keeps low-signal names out.

use std::collections::{HashMap, HashSet};

use serde::Serialize;
use strsim::levenshtein;

use oncomap_core::text::{normalize_company_name, normalized_tokens};
use oncomap_core::{Company, Office};

/// Hard acceptance threshold; anything below is treated as no match.
pub const MIN_ACCEPT: f64 = 0.86;

const PHRASE_CONTAINMENT_FLOOR: f64 = 0.91;
const STRONG_CONTAINMENT_FLOOR: f64 = 0.90;

const CONTAINMENT_WEIGHT: f64 = 0.5;
const JACCARD_WEIGHT: f64 = 0.2;
const EDIT_WEIGHT: f64 = 0.3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VariantSource {
    CompanyName,
    Alias,
}

impl VariantSource {
    fn rank(self) -> u8 {
        match self {
            VariantSource::CompanyName => 0,
            VariantSource::Alias => 1,
        }
    }
}

/// Which office field produced the match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchedField {
    Name,
    Brand,
    Operator,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompanyMatch {
    pub company_id: i64,
    pub company_name: String,
    pub matched_field: MatchedField,
    pub matched_variant: String,
    pub variant_source: VariantSource,
    pub score: f64,
}

#[derive(Debug)]
struct Variant {
    company_idx: usize,
    raw: String,
    normalized: String,
    tokens: HashSet<String>,
    source: VariantSource,
}

/// Immutable matching index; rebuilt per refresh batch.
#[derive(Debug, Default)]
pub struct CompanyIndex {
    companies: Vec<(i64, String)>,
    variants: Vec<Variant>,
    exact: HashMap<String, Vec<usize>>,
    by_token: HashMap<String, Vec<usize>>,
}

impl CompanyIndex {
    pub fn build(companies: &[Company]) -> Self {
        let mut index = CompanyIndex::default();

        for company in companies {
            let company_idx = index.companies.len();
            index
                .companies
                .push((company.id, company.company_name.clone()));

            let mut seen = HashSet::new();
            let aliases = company
                .known_aliases
                .as_deref()
                .unwrap_or("")
                .split('|')
                .filter(|a| !a.trim().is_empty());
            let raw_variants = std::iter::once((company.company_name.as_str(), VariantSource::CompanyName))
                .chain(aliases.map(|a| (a, VariantSource::Alias)));

            for (raw, source) in raw_variants {
                let normalized = normalize_company_name(raw);
                if normalized.is_empty() || !seen.insert(normalized.clone()) {
                    continue;
                }
                let variant_idx = index.variants.len();
                index
                    .exact
                    .entry(normalized.clone())
                    .or_default()
                    .push(variant_idx);
                let tokens: HashSet<String> = normalized_tokens(&normalized)
                    .into_iter()
                    .map(str::to_string)
                    .collect();
                for token in &tokens {
                    index
                        .by_token
                        .entry(token.clone())
                        .or_default()
                        .push(variant_idx);
                }
                index.variants.push(Variant {
                    company_idx,
                    raw: raw.trim().to_string(),
                    normalized,
                    tokens,
                    source,
                });
            }
        }

        index
    }

    pub fn company_count(&self) -> usize {
        self.companies.len()
    }

    pub fn variant_count(&self) -> usize {
        self.variants.len()
    }

    /// Best match for one candidate string, if any clears the threshold.
    fn match_candidate(&self, candidate_normalized: &str) -> Option<(usize, f64)> {
        if let Some(hits) = self.exact.get(candidate_normalized) {
            let best = hits
                .iter()
                .copied()
                .min_by_key(|idx| self.variants[*idx].source.rank())?;
            return Some((best, 1.0));
        }

        let candidate_tokens: HashSet<&str> =
            normalized_tokens(candidate_normalized).into_iter().collect();
        let mut shortlist: Vec<usize> = candidate_tokens
            .iter()
            .filter_map(|token| self.by_token.get(*token))
            .flatten()
            .copied()
            .collect();
        shortlist.sort_unstable();
        shortlist.dedup();

        let mut best: Option<(usize, f64)> = None;
        for variant_idx in shortlist {
            let variant = &self.variants[variant_idx];
            let score = score_pair(candidate_normalized, &candidate_tokens, variant);
            if score < MIN_ACCEPT {
                continue;
            }
            let better = match best {
                None => true,
                Some((best_idx, best_score)) => {
                    score > best_score
                        || (score == best_score
                            && variant.source.rank() < self.variants[best_idx].source.rank())
                }
            };
            if better {
                best = Some((variant_idx, score));
            }
        }
        best
    }

    /// Match an office by its `name`, `brand`, then `operator`.
    pub fn match_office(&self, office: &Office) -> Option<CompanyMatch> {
        let candidates = [
            (MatchedField::Name, office.name.as_deref()),
            (MatchedField::Brand, office.brand.as_deref()),
            (MatchedField::Operator, office.operator.as_deref()),
        ];

        let mut seen = HashSet::new();
        let mut best: Option<(MatchedField, usize, f64)> = None;

        for (field, raw) in candidates {
            let Some(raw) = raw else { continue };
            let normalized = normalize_company_name(raw);
            if normalized.is_empty() || !seen.insert(normalized.clone()) {
                continue;
            }
            let Some((variant_idx, score)) = self.match_candidate(&normalized) else {
                continue;
            };
            let better = match &best {
                None => true,
                Some((_, best_idx, best_score)) => {
                    score > *best_score
                        || (score == *best_score
                            && self.variants[variant_idx].source.rank()
                                < self.variants[*best_idx].source.rank())
                }
            };
            if better {
                best = Some((field, variant_idx, score));
            }
        }

        best.map(|(field, variant_idx, score)| {
            let variant = &self.variants[variant_idx];
            let (company_id, company_name) = &self.companies[variant.company_idx];
            CompanyMatch {
                company_id: *company_id,
                company_name: company_name.clone(),
                matched_field: field,
                matched_variant: variant.raw.clone(),
                variant_source: variant.source,
                score,
            }
        })
    }
}

fn score_pair(candidate: &str, candidate_tokens: &HashSet<&str>, variant: &Variant) -> f64 {
    let variant_tokens: HashSet<&str> = variant.tokens.iter().map(String::as_str).collect();
    let shared = candidate_tokens.intersection(&variant_tokens).count();
    let min_len = candidate_tokens.len().min(variant_tokens.len());
    let union = candidate_tokens.len() + variant_tokens.len() - shared;
    if min_len == 0 || union == 0 {
        return 0.0;
    }

    let containment = shared as f64 / min_len as f64;
    let jaccard = shared as f64 / union as f64;
    let edit_similarity = edit_similarity(candidate, &variant.normalized);

    let mut score = CONTAINMENT_WEIGHT * containment
        + JACCARD_WEIGHT * jaccard
        + EDIT_WEIGHT * edit_similarity;

    if phrase_contains(candidate, &variant.normalized) {
        score = score.max(PHRASE_CONTAINMENT_FLOOR);
    }
    if (containment - 1.0).abs() < f64::EPSILON && min_len >= 2 && edit_similarity >= 0.8 {
        score = score.max(STRONG_CONTAINMENT_FLOOR);
    }
    if candidate_tokens.len() == 1 && variant_tokens.len() == 1 && candidate == variant.normalized {
        score = 1.0;
    }

    score
}

fn edit_similarity(a: &str, b: &str) -> f64 {
    let max_len = a.chars().count().max(b.chars().count());
    if max_len == 0 {
        return 0.0;
    }
    1.0 - levenshtein(a, b) as f64 / max_len as f64
}

/// True when either normalized string contains the other as a whole-token
/// phrase and the shorter one has at least four characters.
fn phrase_contains(a: &str, b: &str) -> bool {
    let (shorter, longer) = if a.chars().count() <= b.chars().count() {
        (a, b)
    } else {
        (b, a)
    };
    if shorter.chars().count() < 4 {
        return false;
    }
    let short_tokens = normalized_tokens(shorter);
    let long_tokens = normalized_tokens(longer);
    if short_tokens.is_empty() || short_tokens.len() > long_tokens.len() {
        return false;
    }
    long_tokens
        .windows(short_tokens.len())
        .any(|window| window == short_tokens.as_slice())
}

/// Result of running the matcher over a refresh batch.
#[derive(Debug, Default)]
pub struct FilterOutcome {
    pub matched: Vec<(Office, CompanyMatch)>,
    pub matched_count: usize,
    pub filtered_out_count: usize,
}

/// Keep only offices that match some known company.
pub fn filter_offices_with_known_companies(
    index: &CompanyIndex,
    offices: Vec<Office>,
) -> FilterOutcome {
    let mut outcome = FilterOutcome::default();
    for office in offices {
        match index.match_office(&office) {
            Some(matched) => {
                outcome.matched_count += 1;
                outcome.matched.push((office, matched));
            }
            None => outcome.filtered_out_count += 1,
        }
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;

    fn company(id: i64, name: &str, aliases: Option<&str>) -> Company {
        Company {
            id,
            company_name: name.to_string(),
            company_name_normalized: normalize_company_name(name),
            known_aliases: aliases.map(str::to_string),
            hq_country: None,
            description: None,
            company_type: None,
            geography: None,
            industry: None,
            suitability_tier: None,
        }
    }

    fn office_named(name: &str) -> Office {
        Office {
            osm_type: oncomap_core::OsmType::Node,
            osm_id: 1,
            name: Some(name.to_string()),
            brand: None,
            operator: None,
            website: None,
            wikidata: None,
            wikidata_entity_id: None,
            lat: 0.0,
            lon: 0.0,
            low_confidence: false,
            tags_json: None,
            employee_count: None,
            employee_count_as_of: None,
            market_cap: None,
            market_cap_currency_qid: None,
            market_cap_as_of: None,
            wikidata_enriched_at: None,
            updated_at: None,
        }
    }

    #[test]
    fn suffixed_name_matches_exactly_after_normalization() {
        let index = CompanyIndex::build(&[company(1, "Google", None)]);
        let m = index.match_office(&office_named("Google LLC")).unwrap();
        assert!(m.score >= 0.91, "score {}", m.score);
        assert_eq!(m.company_name, "Google");
        assert_eq!(m.matched_field, MatchedField::Name);
    }

    #[test]
    fn near_miss_single_token_does_not_match() {
        let index = CompanyIndex::build(&[company(1, "Google", None)]);
        assert!(index.match_office(&office_named("Googly")).is_none());
    }

    #[test]
    fn alias_matches_and_reports_source() {
        let index = CompanyIndex::build(&[company(
            7,
            "International Business Machines",
            Some("IBM|Big Blue"),
        )]);
        let m = index.match_office(&office_named("IBM")).unwrap();
        assert_eq!(m.score, 1.0);
        assert_eq!(m.variant_source, VariantSource::Alias);
        assert_eq!(m.matched_variant, "IBM");
        assert_eq!(m.company_id, 7);
    }

    #[test]
    fn phrase_containment_lifts_long_suffixes() {
        let index = CompanyIndex::build(&[company(1, "Acme Health Partners", None)]);
        let m = index
            .match_office(&office_named("Acme Health Partners Toronto"))
            .unwrap();
        assert!(m.score >= 0.91, "score {}", m.score);
    }

    #[test]
    fn strong_containment_requires_two_tokens_and_close_edit() {
        let index = CompanyIndex::build(&[company(1, "Zeta Dynamics Research", None)]);
        let m = index
            .match_office(&office_named("Zeta Dynamics Research Labs"))
            .unwrap();
        assert!(m.score >= 0.90, "score {}", m.score);
    }

    #[test]
    fn one_shared_low_value_token_is_rejected() {
        let index = CompanyIndex::build(&[company(1, "Acme Widgets", None)]);
        assert!(index.match_office(&office_named("Acme Gadgets")).is_none());
    }

    #[test]
    fn brand_is_tried_when_name_fails() {
        let index = CompanyIndex::build(&[company(1, "Novalink", None)]);
        let mut office = office_named("Suite 400");
        office.brand = Some("Novalink".to_string());
        let m = index.match_office(&office).unwrap();
        assert_eq!(m.matched_field, MatchedField::Brand);
    }

    #[test]
    fn company_name_source_wins_ties() {
        // Both companies expose the identical normalized variant; the one
        // carrying it as its primary name must win.
        let index = CompanyIndex::build(&[
            company(1, "Helios Group", Some("Vantage")),
            company(2, "Vantage", None),
        ]);
        let m = index.match_office(&office_named("Vantage")).unwrap();
        assert_eq!(m.company_id, 2);
        assert_eq!(m.variant_source, VariantSource::CompanyName);
    }

    #[test]
    fn filter_splits_matched_from_unmatched() {
        let index = CompanyIndex::build(&[company(1, "Acme", Some("Acme Corp"))]);
        let offices = vec![office_named("Acme Corp"), office_named("Zeta Holdings")];
        let outcome = filter_offices_with_known_companies(&index, offices);
        assert_eq!(outcome.matched_count, 1);
        assert_eq!(outcome.filtered_out_count, 1);
        assert_eq!(outcome.matched[0].1.company_name, "Acme");
    }

    #[test]
    fn empty_index_matches_nothing() {
        let index = CompanyIndex::build(&[]);
        assert!(index.match_office(&office_named("Anything")).is_none());
        assert_eq!(index.company_count(), 0);
        assert_eq!(index.variant_count(), 0);
    }
}
