//! Text sanitization and the shared company-name normalization.

use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

/// Corporate suffix tokens carrying no matching signal.
pub const CORPORATE_SUFFIXES: [&str; 19] = [
    "inc",
    "incorporated",
    "llc",
    "ltd",
    "limited",
    "corp",
    "corporation",
    "co",
    "company",
    "plc",
    "gmbh",
    "sa",
    "ag",
    "nv",
    "bv",
    "sarl",
    "spa",
    "holdings",
    "holding",
];

/// Low-signal words dropped from normalized company names.
pub const LOW_SIGNAL_WORDS: [&str; 26] = [
    "the", "of", "and", "for", "to", "in", "on", "at", "by", "from", "with", "de", "la", "le",
    "el", "da", "do", "di", "du", "del", "des", "van", "von", "y", "a", "an",
];

/// Trim, drop empty, truncate to `max_len` characters.
pub fn sanitize_text(raw: &str, max_len: usize) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(trimmed.chars().take(max_len).collect())
}

/// Parse a trimmed decimal integer, rejecting values outside `[min, max]`.
pub fn parse_bounded_int(raw: &str, min: i64, max: i64) -> Option<i64> {
    let value: i64 = raw.trim().parse().ok()?;
    (min..=max).contains(&value).then_some(value)
}

/// Dedupe key fragment for office names: lowercased, whitespace-collapsed.
pub fn normalized_name_key(name: &str) -> String {
    name.to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn is_low_signal_token(token: &str) -> bool {
    CORPORATE_SUFFIXES.contains(&token) || LOW_SIGNAL_WORDS.contains(&token)
}

/// Canonical form used everywhere company names are compared.
///
/// Lowercase, NFKD with combining marks stripped, `&` spelled out,
/// apostrophes removed, remaining punctuation folded to spaces, and
/// corporate-suffix / low-signal tokens dropped. Returns the empty string
/// when nothing survives.
pub fn normalize_company_name(raw: &str) -> String {
    let lowered = raw.to_lowercase();
    let decomposed: String = lowered.nfkd().filter(|c| !is_combining_mark(*c)).collect();
    let spelled = decomposed.replace('&', " and ");
    let no_apostrophes: String = spelled.chars().filter(|c| *c != '\'' && *c != '\u{2019}').collect();
    let spaced: String = no_apostrophes
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();
    spaced
        .split_whitespace()
        .filter(|token| !is_low_signal_token(token))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Tokens of an already-normalized name.
pub fn normalized_tokens(normalized: &str) -> Vec<&str> {
    normalized.split_whitespace().collect()
}
