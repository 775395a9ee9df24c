//! Embedded schema migrations, applied in lexical order exactly once.

pub struct Migration {
    pub name: &'static str,
    pub sql: &'static str,
}

pub const MIGRATIONS: &[Migration] = &[Migration {
    name: "0001_init",
    sql: r#"
CREATE TABLE IF NOT EXISTS centers (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    center_code TEXT NOT NULL UNIQUE,
    name TEXT NOT NULL,
    tier TEXT,
    lat REAL NOT NULL,
    lon REAL NOT NULL,
    country TEXT,
    region TEXT,
    source_url TEXT,
    is_active INTEGER NOT NULL DEFAULT 1,
    last_csv_sync_token TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS offices (
    osm_type TEXT NOT NULL,
    osm_id INTEGER NOT NULL,
    name TEXT,
    brand TEXT,
    operator TEXT,
    website TEXT,
    wikidata TEXT,
    wikidata_entity_id TEXT,
    lat REAL NOT NULL,
    lon REAL NOT NULL,
    low_confidence INTEGER NOT NULL DEFAULT 0,
    tags_json TEXT,
    employee_count INTEGER,
    employee_count_as_of TEXT,
    market_cap REAL,
    market_cap_currency_qid TEXT,
    market_cap_as_of TEXT,
    wikidata_enriched_at TEXT,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (osm_type, osm_id)
);
CREATE INDEX IF NOT EXISTS idx_offices_wikidata_entity
    ON offices(wikidata_entity_id) WHERE wikidata_entity_id IS NOT NULL;

CREATE TABLE IF NOT EXISTS center_office (
    center_id INTEGER NOT NULL REFERENCES centers(id) ON DELETE CASCADE,
    osm_type TEXT NOT NULL,
    osm_id INTEGER NOT NULL,
    distance_m REAL NOT NULL,
    last_seen TEXT NOT NULL,
    PRIMARY KEY (center_id, osm_type, osm_id),
    FOREIGN KEY (osm_type, osm_id)
        REFERENCES offices(osm_type, osm_id) ON DELETE CASCADE
);
CREATE INDEX IF NOT EXISTS idx_center_office_office ON center_office(osm_type, osm_id);
CREATE INDEX IF NOT EXISTS idx_center_office_last_seen ON center_office(center_id, last_seen);

CREATE TABLE IF NOT EXISTS companies (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    company_name TEXT NOT NULL,
    company_name_normalized TEXT NOT NULL UNIQUE,
    known_aliases TEXT,
    hq_country TEXT,
    description TEXT,
    company_type TEXT,
    geography TEXT,
    industry TEXT,
    suitability_tier TEXT
);

CREATE TABLE IF NOT EXISTS refresh_state (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS office_deletion_flags (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    center_id INTEGER,
    osm_type TEXT NOT NULL,
    osm_id INTEGER NOT NULL,
    reason TEXT,
    status TEXT NOT NULL DEFAULT 'pending',
    submitted_at TEXT NOT NULL,
    reviewed_at TEXT
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_flags_one_pending_per_office
    ON office_deletion_flags(osm_type, osm_id) WHERE status = 'pending';

CREATE TABLE IF NOT EXISTS banned_offices (
    osm_type TEXT NOT NULL,
    osm_id INTEGER NOT NULL,
    approved_flag_id INTEGER,
    approved_at TEXT NOT NULL,
    PRIMARY KEY (osm_type, osm_id)
);
"#,
}];
