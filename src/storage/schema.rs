//! Database schema constants.
//!
//! Timestamps are stored as integer epoch milliseconds so staleness checks
//! compare numbers rather than formatted strings.

/// Discovery queue: one row per repository id.
pub const CREATE_WORK_ITEMS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS work_items (
    external_id     INTEGER PRIMARY KEY,
    external_name   TEXT    NOT NULL,
    status          TEXT    NOT NULL DEFAULT 'pending',
    activity_score  INTEGER NOT NULL DEFAULT 0,
    retry_count     INTEGER NOT NULL DEFAULT 0,
    retryable       INTEGER NOT NULL DEFAULT 1,
    last_error      TEXT,
    claimed_by      TEXT,
    discovered_at   INTEGER NOT NULL,
    updated_at      INTEGER NOT NULL,
    last_attempt_at INTEGER
)
"#;

/// Secondary queue of source files/pages to harvest (e.g. GH Archive hours).
pub const CREATE_SOURCE_REFS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS source_refs (
    locator    TEXT    PRIMARY KEY,
    done       INTEGER NOT NULL DEFAULT 0,
    claimed_at INTEGER,
    scraped_at INTEGER,
    created_at INTEGER NOT NULL
)
"#;

pub const CREATE_REPOSITORIES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS repositories (
    external_id          INTEGER PRIMARY KEY,
    full_name            TEXT    NOT NULL,
    stars                INTEGER NOT NULL DEFAULT 0,
    forks                INTEGER NOT NULL DEFAULT 0,
    open_issues          INTEGER NOT NULL DEFAULT 0,
    closed_issues        INTEGER NOT NULL DEFAULT 0,
    subscribers          INTEGER NOT NULL DEFAULT 0,
    commits_last_30_days INTEGER NOT NULL DEFAULT 0,
    contributors_count   INTEGER NOT NULL DEFAULT 0,
    activity_score       INTEGER NOT NULL DEFAULT 0,
    first_enriched_at    INTEGER NOT NULL,
    enriched_at          INTEGER NOT NULL
)
"#;

pub const CREATE_REPOSITORY_LANGUAGES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS repository_languages (
    external_id   INTEGER NOT NULL,
    language_name TEXT    NOT NULL,
    size_bytes    INTEGER NOT NULL,
    percentage    REAL    NOT NULL,
    PRIMARY KEY (external_id, language_name)
)
"#;

pub const CREATE_REPOSITORY_TOPICS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS repository_topics (
    external_id INTEGER NOT NULL,
    topic_name  TEXT    NOT NULL,
    PRIMARY KEY (external_id, topic_name)
)
"#;

pub const CREATE_REPOSITORY_DEPENDENCIES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS repository_dependencies (
    id                INTEGER PRIMARY KEY AUTOINCREMENT,
    external_id       INTEGER NOT NULL,
    package_name      TEXT    NOT NULL,
    requirements      TEXT    NOT NULL DEFAULT '',
    manifest_filename TEXT    NOT NULL DEFAULT ''
)
"#;

pub const CREATE_INDEXES: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_work_items_claim ON work_items(status, activity_score DESC)",
    "CREATE INDEX IF NOT EXISTS idx_source_refs_done ON source_refs(done, created_at)",
    "CREATE INDEX IF NOT EXISTS idx_repositories_stars ON repositories(stars DESC)",
    "CREATE INDEX IF NOT EXISTS idx_repository_dependencies_external_id ON repository_dependencies(external_id)",
];

/// Returns all schema creation statements in the correct order.
pub fn all_schema_statements() -> Vec<&'static str> {
    let mut statements = vec![
        CREATE_WORK_ITEMS_TABLE,
        CREATE_SOURCE_REFS_TABLE,
        CREATE_REPOSITORIES_TABLE,
        CREATE_REPOSITORY_LANGUAGES_TABLE,
        CREATE_REPOSITORY_TOPICS_TABLE,
        CREATE_REPOSITORY_DEPENDENCIES_TABLE,
    ];
    statements.extend_from_slice(CREATE_INDEXES);
    statements
}

/// Table names in the schema.
pub mod tables {
    pub const WORK_ITEMS: &str = "work_items";
    pub const SOURCE_REFS: &str = "source_refs";
    pub const REPOSITORIES: &str = "repositories";
    pub const REPOSITORY_LANGUAGES: &str = "repository_languages";
    pub const REPOSITORY_TOPICS: &str = "repository_topics";
    pub const REPOSITORY_DEPENDENCIES: &str = "repository_dependencies";

    /// Child collections replaced wholesale on every enrichment.
    pub const CHILD_TABLES: [&str; 3] = [
        REPOSITORY_LANGUAGES,
        REPOSITORY_TOPICS,
        REPOSITORY_DEPENDENCIES,
    ];
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_schema_statements_order() {
        let statements = all_schema_statements();
        assert_eq!(statements.len(), 6 + CREATE_INDEXES.len());
        assert!(statements[0].contains("work_items"));
        assert!(statements
            .iter()
            .skip(6)
            .all(|stmt| stmt.contains("CREATE INDEX")));
    }

    #[test]
    fn test_child_tables_are_defined() {
        let statements = all_schema_statements().join("\n");
        for table in tables::CHILD_TABLES {
            assert!(statements.contains(&format!("CREATE TABLE IF NOT EXISTS {table}")));
        }
    }
}
