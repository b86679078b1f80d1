//! Cached read-only query layer.
//!
//! A question is fingerprinted and looked up in an LRU cache. On a miss the
//! [`SqlTranslator`] turns it into SQL, which must be a single `SELECT`
//! without any write or DDL keyword before it reaches the store.

use std::sync::{Arc, Mutex, OnceLock};

use async_trait::async_trait;
use regex::Regex;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::cache::{CacheStats, Fingerprint, LruCache};
use crate::error::StorageError;
use crate::metrics::MetricsCollector;
use crate::pipeline::PipelineConfig;
use crate::storage::{QueryRows, Store};

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("Translation failed: {0}")]
    Translation(String),

    #[error("Refusing to execute statement: {0}")]
    Unsafe(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Turns a natural-language question into SQL over the record tables.
#[async_trait]
pub trait SqlTranslator: Send + Sync {
    async fn translate(&self, question: &str) -> Result<String, QueryError>;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryAnswer {
    /// The statement actually executed, limit included.
    pub sql: String,
    pub rows: QueryRows,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryOutcome {
    pub answer: QueryAnswer,
    pub cached: bool,
}

type CacheKey = (Fingerprint, u32);

const FORBIDDEN_KEYWORDS: &[&str] = &[
    "INSERT", "UPDATE", "DELETE", "DROP", "ALTER", "CREATE", "REPLACE", "ATTACH", "DETACH",
    "PRAGMA", "VACUUM", "REINDEX", "TRUNCATE", "GRANT", "REVOKE",
];

fn forbidden_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| {
            Regex::new(&format!(r"(?i)\b(?:{})\b", FORBIDDEN_KEYWORDS.join("|"))).ok()
        })
        .as_ref()
}

fn limit_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"(?i)\blimit\s+\d+").ok())
        .as_ref()
}

/// Vet `sql` as a single read-only statement and return it normalised.
///
/// Surrounding whitespace and one trailing `;` are removed. The statement
/// must start with `SELECT` (or `WITH`), contain no further `;` and no
/// denylisted keyword as a whole word.
pub fn is_safe_to_execute(sql: &str) -> Result<String, QueryError> {
    let trimmed = sql.trim();
    let statement = trimmed.strip_suffix(';').unwrap_or(trimmed).trim_end();

    if statement.is_empty() {
        return Err(QueryError::Unsafe("empty statement".to_string()));
    }
    if statement.contains(';') {
        return Err(QueryError::Unsafe("multiple statements".to_string()));
    }

    let first_word = statement
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .to_ascii_uppercase();
    if first_word != "SELECT" && first_word != "WITH" {
        return Err(QueryError::Unsafe(format!(
            "only SELECT statements are allowed, got {first_word}"
        )));
    }

    let pattern = forbidden_pattern()
        .ok_or_else(|| QueryError::Unsafe("keyword filter unavailable".to_string()))?;
    if let Some(found) = pattern.find(statement) {
        return Err(QueryError::Unsafe(format!(
            "forbidden keyword {}",
            found.as_str().to_ascii_uppercase()
        )));
    }

    Ok(statement.to_string())
}

/// Append `LIMIT n` unless the statement already carries one.
pub fn apply_limit(sql: &str, limit: u32) -> String {
    let has_limit = limit_pattern().is_some_and(|re| re.is_match(sql));
    if has_limit {
        sql.to_string()
    } else {
        format!("{sql} LIMIT {limit}")
    }
}

pub struct QueryEngine {
    store: Store,
    translator: Arc<dyn SqlTranslator>,
    cache: Mutex<LruCache<CacheKey, QueryAnswer>>,
    metrics: MetricsCollector,
}

impl QueryEngine {
    pub fn new(store: Store, translator: Arc<dyn SqlTranslator>, cache_capacity: usize) -> Self {
        Self {
            store,
            translator,
            cache: Mutex::new(LruCache::new(cache_capacity)),
            metrics: MetricsCollector::new(),
        }
    }

    /// Build an engine whose cache holds `config.cache_capacity` answers.
    pub fn from_config(
        store: Store,
        translator: Arc<dyn SqlTranslator>,
        config: &PipelineConfig,
    ) -> Self {
        Self::new(store, translator, config.cache_capacity)
    }

    pub fn cache_capacity(&self) -> usize {
        self.lock_cache().capacity()
    }

    /// Answer `question` with at most `limit` rows.
    ///
    /// Identical questions (after trimming and case-folding) with the same
    /// limit are served from the cache. Failed answers are never cached.
    pub async fn ask(&self, question: &str, limit: u32) -> Result<QueryOutcome, QueryError> {
        if question.trim().is_empty() {
            return Err(QueryError::Translation("question is empty".to_string()));
        }
        let limit = limit.max(1);
        let key = (Fingerprint::from_request(question), limit);

        let hit = self.lock_cache().get(&key).cloned();
        self.metrics.record_cache_lookup(hit.is_some());
        if let Some(answer) = hit {
            debug!(fingerprint = %key.0, "Query served from cache");
            return Ok(QueryOutcome {
                answer,
                cached: true,
            });
        }

        let raw = self.translator.translate(question).await?;
        let statement = is_safe_to_execute(&raw).inspect_err(|err| {
            warn!(fingerprint = %key.0, error = %err, "Rejected translated statement");
        })?;
        let sql = apply_limit(&statement, limit);
        let rows = self.store.fetch_rows(&sql).await?;

        let answer = QueryAnswer { sql, rows };
        self.lock_cache().put(key, answer.clone());
        Ok(QueryOutcome {
            answer,
            cached: false,
        })
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.lock_cache().stats()
    }

    pub fn clear_cache(&self) {
        self.lock_cache().clear();
    }

    fn lock_cache(&self) -> std::sync::MutexGuard<'_, LruCache<CacheKey, QueryAnswer>> {
        self.cache.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::test_support::temp_store;
    use crate::storage::{EnrichedRecord, RecordStore};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CannedTranslator {
        sql: String,
        calls: AtomicUsize,
    }

    impl CannedTranslator {
        fn new(sql: &str) -> Arc<Self> {
            Arc::new(Self {
                sql: sql.to_string(),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl SqlTranslator for CannedTranslator {
        async fn translate(&self, _question: &str) -> Result<String, QueryError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.sql.clone())
        }
    }

    #[test]
    fn test_safe_select_is_normalised() {
        assert_eq!(
            is_safe_to_execute("  SELECT * FROM repositories;  ").unwrap(),
            "SELECT * FROM repositories"
        );
        assert!(is_safe_to_execute("with t as (select 1) select * from t").is_ok());
        // Keywords embedded in identifiers are fine.
        assert!(is_safe_to_execute("SELECT updated_count, created_by FROM x").is_ok());
    }

    #[test]
    fn test_unsafe_statements_rejected() {
        for sql in [
            "",
            "DELETE FROM repositories",
            "SELECT 1; DROP TABLE repositories",
            "select * from repositories where 1=1 union select * from x; --",
            "SELECT * FROM (SELECT 1) WHERE 0 OR (INSERT INTO x VALUES (1))",
            "PRAGMA table_info(repositories)",
            "SELECT * FROM repositories -- update later",
        ] {
            assert!(
                matches!(is_safe_to_execute(sql), Err(QueryError::Unsafe(_))),
                "accepted {sql:?}"
            );
        }
    }

    #[test]
    fn test_apply_limit() {
        assert_eq!(apply_limit("SELECT 1", 10), "SELECT 1 LIMIT 10");
        assert_eq!(
            apply_limit("SELECT 1 limit 5", 10),
            "SELECT 1 limit 5"
        );
    }

    #[tokio::test]
    async fn test_ask_caches_normalised_questions() {
        let (_dir, store) = temp_store().await;
        RecordStore::new(store.clone())
            .store(&[EnrichedRecord::new(1, "a/x"), EnrichedRecord::new(2, "a/y")])
            .await
            .unwrap();

        let translator = CannedTranslator::new(
            "SELECT external_id, full_name FROM repositories ORDER BY external_id",
        );
        let engine = QueryEngine::new(store, translator.clone(), 4);

        let first = engine.ask("Which repos exist?", 10).await.unwrap();
        assert!(!first.cached);
        assert_eq!(first.answer.rows.columns, vec!["external_id", "full_name"]);
        assert_eq!(first.answer.rows.rows.len(), 2);
        assert!(first.answer.sql.ends_with("LIMIT 10"));

        let second = engine.ask("  which REPOS exist?", 10).await.unwrap();
        assert!(second.cached);
        assert_eq!(second.answer, first.answer);
        assert_eq!(translator.calls.load(Ordering::SeqCst), 1);

        // A different limit is a different answer.
        let limited = engine.ask("which repos exist?", 1).await.unwrap();
        assert!(!limited.cached);
        assert_eq!(limited.answer.rows.rows.len(), 1);

        let stats = engine.cache_stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 2);
    }

    #[tokio::test]
    async fn test_from_config_sizes_cache() {
        let (_dir, store) = temp_store().await;
        let translator = CannedTranslator::new("SELECT COUNT(*) AS n FROM repositories");
        let config = PipelineConfig::default().with_cache_capacity(1);
        let engine = QueryEngine::from_config(store, translator.clone(), &config);
        assert_eq!(engine.cache_capacity(), 1);

        engine.ask("how many repos?", 10).await.unwrap();
        engine.ask("how many stars?", 10).await.unwrap();
        // The first answer was evicted by the second.
        let again = engine.ask("how many repos?", 10).await.unwrap();
        assert!(!again.cached);
        assert_eq!(translator.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_unsafe_translation_not_cached() {
        let (_dir, store) = temp_store().await;
        let translator = CannedTranslator::new("DROP TABLE repositories");
        let engine = QueryEngine::new(store, translator.clone(), 4);

        for _ in 0..2 {
            assert!(matches!(
                engine.ask("drop everything", 10).await,
                Err(QueryError::Unsafe(_))
            ));
        }
        assert_eq!(translator.calls.load(Ordering::SeqCst), 2);
    }
}
