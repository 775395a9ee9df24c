//! Streaming, quote-aware CSV parsing for the curated upload formats.
//!
//! RFC-4180 flavored: `"` quoting with doubled `""` escape, embedded commas
//! and newlines inside quotes, CR/LF/CRLF record endings. An unterminated
//! quote fails the whole file; everything row-level becomes a per-row issue
//! and parsing continues.

use std::collections::{HashMap, HashSet};
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;
use thiserror::Error;

use crate::text::{normalize_company_name, sanitize_text};

static CENTER_CODE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]+$").expect("valid center-code regex"));

const CENTER_HEADERS: [&str; 8] = [
    "center_code",
    "name",
    "lat",
    "lon",
    "country",
    "region",
    "tier",
    "source_url",
];

const NAME_MAX: usize = 250;
const TIER_MAX: usize = 50;
const COUNTRY_REGION_MAX: usize = 100;
const URL_MAX: usize = 500;
const ALIAS_MAX: usize = 250;
const DESCRIPTIVE_MAX: usize = 250;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CsvError {
    #[error("unterminated quoted field")]
    UnterminatedQuote,
    #[error("missing required header `{0}`")]
    MissingHeader(String),
    #[error("file contains no header row")]
    Empty,
}

/// One rejected row: 1-based file row number (header row is 1) and reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CsvIssue {
    pub row: usize,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CenterCsvRow {
    pub center_code: String,
    pub name: String,
    pub tier: Option<String>,
    pub lat: f64,
    pub lon: f64,
    pub country: Option<String>,
    pub region: Option<String>,
    pub source_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompanyCsvRow {
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

#[derive(Debug, Default)]
pub struct ParsedCenters {
    pub rows: Vec<CenterCsvRow>,
    pub issues: Vec<CsvIssue>,
}

#[derive(Debug, Default)]
pub struct ParsedCompanies {
    pub rows: Vec<CompanyCsvRow>,
    pub issues: Vec<CsvIssue>,
}

/// Split `input` into records of fields. Blank lines are skipped.
pub fn parse_records(input: &str) -> Result<Vec<Vec<String>>, CsvError> {
    let mut records: Vec<Vec<String>> = Vec::new();
    let mut record: Vec<String> = Vec::new();
    let mut field = String::new();
    let mut chars = input.chars().peekable();

    fn end_record(records: &mut Vec<Vec<String>>, record: &mut Vec<String>, field: &mut String) {
        record.push(std::mem::take(field));
        let blank = record.len() == 1 && record[0].is_empty();
        if blank {
            record.clear();
        } else {
            records.push(std::mem::take(record));
        }
    }

    while let Some(c) = chars.next() {
        match c {
            '"' => loop {
                match chars.next() {
                    None => return Err(CsvError::UnterminatedQuote),
                    Some('"') => {
                        if chars.peek() == Some(&'"') {
                            chars.next();
                            field.push('"');
                        } else {
                            break;
                        }
                    }
                    Some(inner) => field.push(inner),
                }
            },
            ',' => record.push(std::mem::take(&mut field)),
            '\r' => {
                if chars.peek() == Some(&'\n') {
                    chars.next();
                }
                end_record(&mut records, &mut record, &mut field);
            }
            '\n' => end_record(&mut records, &mut record, &mut field),
            other => field.push(other),
        }
    }
    if !field.is_empty() || !record.is_empty() {
        end_record(&mut records, &mut record, &mut field);
    }

    Ok(records)
}

struct HeaderIndex {
    by_name: HashMap<String, usize>,
}

impl HeaderIndex {
    fn from_record(header: &[String]) -> Self {
        let by_name = header
            .iter()
            .enumerate()
            .map(|(idx, name)| (name.trim().to_lowercase(), idx))
            .collect();
        Self { by_name }
    }

    fn require(&self, names: &[&str]) -> Result<(), CsvError> {
        for name in names {
            if !self.by_name.contains_key(*name) {
                return Err(CsvError::MissingHeader((*name).to_string()));
            }
        }
        Ok(())
    }

    fn cell<'a>(&self, row: &'a [String], name: &str) -> &'a str {
        self.by_name
            .get(name)
            .and_then(|idx| row.get(*idx))
            .map(String::as_str)
            .unwrap_or("")
    }
}

fn parse_coordinate(raw: &str, min: f64, max: f64) -> Option<f64> {
    let value: f64 = raw.trim().parse().ok()?;
    (value.is_finite() && (min..=max).contains(&value)).then_some(value)
}

/// Parse and validate a centers CSV body.
///
/// Within a single file, later rows with the same `center_code` overwrite
/// earlier ones.
pub fn parse_centers_csv(input: &str) -> Result<ParsedCenters, CsvError> {
    let records = parse_records(input)?;
    let mut records = records.into_iter();
    let header = records.next().ok_or(CsvError::Empty)?;
    let index = HeaderIndex::from_record(&header);
    index.require(&CENTER_HEADERS)?;

    let mut parsed = ParsedCenters::default();
    let mut by_code: HashMap<String, usize> = HashMap::new();

    for (offset, record) in records.enumerate() {
        let row_no = offset + 2;
        match validate_center_row(&index, &record) {
            Ok(row) => match by_code.get(&row.center_code) {
                Some(existing) => parsed.rows[*existing] = row,
                None => {
                    by_code.insert(row.center_code.clone(), parsed.rows.len());
                    parsed.rows.push(row);
                }
            },
            Err(reason) => parsed.issues.push(CsvIssue {
                row: row_no,
                reason: reason.to_string(),
            }),
        }
    }

    Ok(parsed)
}

fn validate_center_row(
    index: &HeaderIndex,
    record: &[String],
) -> std::result::Result<CenterCsvRow, &'static str> {
    let center_code = index.cell(record, "center_code").trim().to_string();
    if !CENTER_CODE.is_match(&center_code) {
        return Err("center_code must match [A-Za-z0-9_-]+");
    }
    let name =
        sanitize_text(index.cell(record, "name"), NAME_MAX).ok_or("name is required")?;
    let lat = parse_coordinate(index.cell(record, "lat"), -90.0, 90.0)
        .ok_or("lat must be a finite number in [-90, 90]")?;
    let lon = parse_coordinate(index.cell(record, "lon"), -180.0, 180.0)
        .ok_or("lon must be a finite number in [-180, 180]")?;
    let source_url = sanitize_text(index.cell(record, "source_url"), URL_MAX);
    if let Some(url) = &source_url {
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err("source_url must start with http:// or https://");
        }
    }

    Ok(CenterCsvRow {
        center_code,
        name,
        tier: sanitize_text(index.cell(record, "tier"), TIER_MAX),
        lat,
        lon,
        country: sanitize_text(index.cell(record, "country"), COUNTRY_REGION_MAX),
        region: sanitize_text(index.cell(record, "region"), COUNTRY_REGION_MAX),
        source_url,
    })
}

/// Parse and validate a companies CSV body.
///
/// Duplicates within the file collapse on the normalized name; the first
/// occurrence wins, matching the insert-skip-existing database semantics.
pub fn parse_companies_csv(input: &str) -> Result<ParsedCompanies, CsvError> {
    let records = parse_records(input)?;
    let mut records = records.into_iter();
    let header = records.next().ok_or(CsvError::Empty)?;
    let index = HeaderIndex::from_record(&header);
    index.require(&["company_name"])?;

    let mut parsed = ParsedCompanies::default();
    let mut seen_normalized = HashSet::new();

    for (offset, record) in records.enumerate() {
        let row_no = offset + 2;

        let Some(company_name) = sanitize_text(index.cell(&record, "company_name"), NAME_MAX)
        else {
            parsed.issues.push(CsvIssue {
                row: row_no,
                reason: "company_name is required".to_string(),
            });
            continue;
        };
        let normalized = normalize_company_name(&company_name);
        if normalized.is_empty() {
            parsed.issues.push(CsvIssue {
                row: row_no,
                reason: "company_name normalizes to nothing".to_string(),
            });
            continue;
        }
        if !seen_normalized.insert(normalized.clone()) {
            continue;
        }

        let known_aliases = clean_aliases(index.cell(&record, "known_aliases"), &normalized);

        parsed.rows.push(CompanyCsvRow {
            company_name,
            company_name_normalized: normalized,
            known_aliases,
            hq_country: sanitize_text(index.cell(&record, "hq_country"), DESCRIPTIVE_MAX),
            description: sanitize_text(index.cell(&record, "desc"), DESCRIPTIVE_MAX),
            company_type: sanitize_text(index.cell(&record, "type"), DESCRIPTIVE_MAX),
            geography: sanitize_text(index.cell(&record, "geography"), DESCRIPTIVE_MAX),
            industry: sanitize_text(index.cell(&record, "industry"), DESCRIPTIVE_MAX),
            suitability_tier: sanitize_text(index.cell(&record, "suitability_tier"), DESCRIPTIVE_MAX),
        });
    }

    Ok(parsed)
}

/// Split raw aliases on `|`, sanitize each, and drop aliases that collapse
/// to the company name itself. Returns the re-joined remainder.
fn clean_aliases(raw: &str, company_normalized: &str) -> Option<String> {
    let kept: Vec<String> = raw
        .split('|')
        .filter_map(|alias| sanitize_text(alias, ALIAS_MAX))
        .filter(|alias| normalize_company_name(alias) != company_normalized)
        .collect();
    if kept.is_empty() {
        None
    } else {
        Some(kept.join("|"))
    }
}
