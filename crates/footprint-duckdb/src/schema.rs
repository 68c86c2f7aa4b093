/// DuckDB initialization SQL, run on every open.
///
/// Every statement is `IF NOT EXISTS`, so re-running it is a no-op.
/// An explicit memory limit is always set; DuckDB's default of 80% of system
/// RAM is too much for a long-running worker.
///
/// `sessions.fingerprint` is the current-owner projection of the merge log and
/// is rewritten by merges. `identity_merges` is append-only.
/// `fingerprint_aliases` maps every absorbed fingerprint straight to its
/// current canonical owner so resolution is a single lookup.
pub fn init_sql(memory_limit: &str) -> String {
    format!(
        r#"SET memory_limit = '{memory_limit}';
SET threads = 2;

-- ===========================================
-- SESSIONS
-- ===========================================
CREATE TABLE IF NOT EXISTS sessions (
    id                  VARCHAR PRIMARY KEY,       -- sha256(site, fingerprint, entry, first_ms)[0:16]
    site_id             BIGINT NOT NULL,
    fingerprint         VARCHAR NOT NULL,          -- current owner
    origin_fingerprint  VARCHAR NOT NULL,          -- fingerprint at creation
    first_visit         TIMESTAMP NOT NULL,
    last_activity       TIMESTAMP NOT NULL,
    entry_page          VARCHAR NOT NULL,
    exit_page           VARCHAR NOT NULL,
    page_count          BIGINT NOT NULL DEFAULT 0,
    is_bounce           BOOLEAN NOT NULL DEFAULT TRUE,
    device_type         VARCHAR,
    browser             VARCHAR,
    os                  VARCHAR,
    country             VARCHAR
);
-- Latest-session lookup during ingestion and per-person journeys
CREATE INDEX IF NOT EXISTS idx_sessions_site_fingerprint
    ON sessions(site_id, fingerprint, last_activity DESC);
-- Live window
CREATE INDEX IF NOT EXISTS idx_sessions_site_activity
    ON sessions(site_id, last_activity DESC);
-- Funnel cohorts
CREATE INDEX IF NOT EXISTS idx_sessions_site_first_visit
    ON sessions(site_id, first_visit, id);

-- ===========================================
-- PAGEVIEWS
-- ===========================================
CREATE TABLE IF NOT EXISTS pageviews (
    id              VARCHAR PRIMARY KEY,           -- UUID v4
    session_id      VARCHAR NOT NULL,
    site_id         BIGINT NOT NULL,
    url             VARCHAR NOT NULL,
    referrer        VARCHAR,
    merged_from     VARCHAR,                       -- re-owned from, NULL if never merged
    created_at      TIMESTAMP NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_pageviews_session
    ON pageviews(session_id, created_at);

-- ===========================================
-- CUSTOM EVENTS
-- ===========================================
CREATE TABLE IF NOT EXISTS events (
    id              VARCHAR PRIMARY KEY,           -- UUID v4
    session_id      VARCHAR NOT NULL,
    site_id         BIGINT NOT NULL,
    url             VARCHAR NOT NULL,
    name            VARCHAR NOT NULL,
    category        VARCHAR,
    action          VARCHAR,
    label           VARCHAR,
    value           DOUBLE,
    data            VARCHAR,                       -- JSON identity signals, NULL when empty
    merged_from     VARCHAR,
    created_at      TIMESTAMP NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_events_session
    ON events(session_id, created_at);
CREATE INDEX IF NOT EXISTS idx_events_site_name
    ON events(site_id, name, created_at);

-- ===========================================
-- IDENTITY
-- ===========================================
CREATE TABLE IF NOT EXISTS identity_merges (
    id                      VARCHAR PRIMARY KEY,
    site_id                 BIGINT NOT NULL,
    primary_fingerprint     VARCHAR NOT NULL,
    secondary_fingerprint   VARCHAR NOT NULL,
    reason                  VARCHAR NOT NULL,
    merged_at               TIMESTAMP NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_identity_merges_site
    ON identity_merges(site_id, merged_at);

CREATE TABLE IF NOT EXISTS fingerprint_aliases (
    site_id         BIGINT NOT NULL,
    fingerprint     VARCHAR NOT NULL,
    canonical       VARCHAR NOT NULL,
    PRIMARY KEY (site_id, fingerprint)
);
"#
    )
}
