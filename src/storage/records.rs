//! Enriched repository records and their idempotent bulk persistence.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use sqlx::{QueryBuilder, Sqlite};
use tracing::{debug, info};

use super::schema::tables;
use super::{now_millis, Store};
use crate::error::StorageError;

/// Rows per multi-value INSERT. Keeps bound parameters well under SQLite's limit.
const INSERT_CHUNK: usize = 500;

/// Share of a repository's code written in one language.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct LanguageShare {
    #[sqlx(rename = "language_name")]
    pub name: String,
    #[sqlx(rename = "size_bytes")]
    pub size: i64,
    pub percentage: f64,
}

impl LanguageShare {
    /// Build shares from raw `(name, size)` pairs.
    ///
    /// Duplicate names keep the first size seen. Percentages are recomputed
    /// from the sizes and rounded to two decimals; they sum to ~100 unless
    /// every size is zero.
    pub fn from_sizes<I, S>(sizes: I) -> Vec<LanguageShare>
    where
        I: IntoIterator<Item = (S, i64)>,
        S: Into<String>,
    {
        let mut seen = HashSet::new();
        let mut shares: Vec<LanguageShare> = Vec::new();
        for (name, size) in sizes {
            let name = name.into();
            if seen.insert(name.clone()) {
                shares.push(LanguageShare {
                    name,
                    size: size.max(0),
                    percentage: 0.0,
                });
            }
        }

        let total: i64 = shares.iter().map(|s| s.size).sum();
        if total > 0 {
            for share in &mut shares {
                let pct = share.size as f64 * 100.0 / total as f64;
                share.percentage = (pct * 100.0).round() / 100.0;
            }
        }
        shares
    }
}

/// One package requirement found in a dependency manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Dependency {
    pub package_name: String,
    pub requirements: String,
    pub manifest_filename: String,
}

/// Parsed enrichment result for one work item.
///
/// Child collections are a full snapshot: persisting a record replaces
/// whatever languages, topics and dependencies were stored before.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichedRecord {
    pub external_id: i64,
    pub full_name: String,
    pub stars: i64,
    pub forks: i64,
    pub open_issues: i64,
    pub closed_issues: i64,
    pub subscribers: i64,
    pub commits_last_30_days: i64,
    pub contributors_count: i64,
    pub activity_score: i64,
    pub languages: Vec<LanguageShare>,
    pub topics: Vec<String>,
    pub dependencies: Vec<Dependency>,
}

impl EnrichedRecord {
    pub fn new(external_id: i64, full_name: impl Into<String>) -> Self {
        Self {
            external_id,
            full_name: full_name.into(),
            stars: 0,
            forks: 0,
            open_issues: 0,
            closed_issues: 0,
            subscribers: 0,
            commits_last_30_days: 0,
            contributors_count: 0,
            activity_score: 0,
            languages: Vec::new(),
            topics: Vec::new(),
            dependencies: Vec::new(),
        }
    }

    pub fn with_languages<I, S>(mut self, sizes: I) -> Self
    where
        I: IntoIterator<Item = (S, i64)>,
        S: Into<String>,
    {
        self.languages = LanguageShare::from_sizes(sizes);
        self
    }

    pub fn with_topics<I, S>(mut self, topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.topics = topics.into_iter().map(Into::into).collect();
        self
    }

    /// Drop duplicate languages/topics so the child primary keys hold.
    fn normalized(&self) -> EnrichedRecord {
        let mut record = self.clone();
        record.languages = LanguageShare::from_sizes(
            self.languages.iter().map(|l| (l.name.clone(), l.size)),
        );
        let mut seen = HashSet::new();
        record.topics.retain(|t| seen.insert(t.clone()));
        record
    }
}

/// Scalar columns of a stored repository.
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct RepositoryRow {
    pub external_id: i64,
    pub full_name: String,
    pub stars: i64,
    pub forks: i64,
    pub open_issues: i64,
    pub closed_issues: i64,
    pub subscribers: i64,
    pub commits_last_30_days: i64,
    pub contributors_count: i64,
    pub activity_score: i64,
    pub first_enriched_at: i64,
    pub enriched_at: i64,
}

/// A stored repository with its child collections.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredRecord {
    pub repository: RepositoryRow,
    pub languages: Vec<LanguageShare>,
    pub topics: Vec<String>,
    pub dependencies: Vec<Dependency>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoreSummary {
    pub total_records: i64,
    pub average_stars: f64,
    pub top_language: Option<String>,
}

/// Counts written by one `store` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PersistReport {
    pub records: usize,
    pub languages: usize,
    pub topics: usize,
    pub dependencies: usize,
}

/// Persistence for enriched records.
#[derive(Clone, Debug)]
pub struct RecordStore {
    store: Store,
}

impl RecordStore {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Upsert `records` and replace their child collections in one transaction.
    ///
    /// A record id appearing twice in the batch keeps the last occurrence.
    /// Either every record in the batch is written with its new children or
    /// nothing is.
    pub async fn store(&self, records: &[EnrichedRecord]) -> Result<PersistReport, StorageError> {
        if records.is_empty() {
            return Ok(PersistReport::default());
        }

        let mut by_id: HashMap<i64, usize> = HashMap::new();
        for (idx, record) in records.iter().enumerate() {
            by_id.insert(record.external_id, idx);
        }
        let mut batch: Vec<EnrichedRecord> = records
            .iter()
            .enumerate()
            .filter(|(idx, r)| by_id.get(&r.external_id) == Some(idx))
            .map(|(_, r)| r.normalized())
            .collect();
        batch.sort_by_key(|r| r.external_id);

        let ids: Vec<i64> = batch.iter().map(|r| r.external_id).collect();
        let now = now_millis();
        let mut report = PersistReport {
            records: batch.len(),
            ..PersistReport::default()
        };

        let mut tx = self.store.pool().begin().await?;

        for chunk in batch.chunks(INSERT_CHUNK) {
            let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
                "INSERT INTO {} (external_id, full_name, stars, forks, open_issues, closed_issues, \
                 subscribers, commits_last_30_days, contributors_count, activity_score, \
                 first_enriched_at, enriched_at) ",
                tables::REPOSITORIES
            ));
            qb.push_values(chunk, |mut row, r| {
                row.push_bind(r.external_id)
                    .push_bind(&r.full_name)
                    .push_bind(r.stars)
                    .push_bind(r.forks)
                    .push_bind(r.open_issues)
                    .push_bind(r.closed_issues)
                    .push_bind(r.subscribers)
                    .push_bind(r.commits_last_30_days)
                    .push_bind(r.contributors_count)
                    .push_bind(r.activity_score)
                    .push_bind(now)
                    .push_bind(now);
            });
            qb.push(
                " ON CONFLICT(external_id) DO UPDATE SET \
                 full_name = excluded.full_name, \
                 stars = excluded.stars, \
                 forks = excluded.forks, \
                 open_issues = excluded.open_issues, \
                 closed_issues = excluded.closed_issues, \
                 subscribers = excluded.subscribers, \
                 commits_last_30_days = excluded.commits_last_30_days, \
                 contributors_count = excluded.contributors_count, \
                 activity_score = excluded.activity_score, \
                 enriched_at = excluded.enriched_at",
            );
            qb.build().execute(&mut *tx).await?;
        }

        // Children are replaced for every id in the batch, including records
        // whose new snapshot has no children at all.
        for id_chunk in ids.chunks(INSERT_CHUNK) {
            for table in tables::CHILD_TABLES {
                let mut qb: QueryBuilder<Sqlite> =
                    QueryBuilder::new(format!("DELETE FROM {table} WHERE external_id IN ("));
                let mut separated = qb.separated(", ");
                for id in id_chunk {
                    separated.push_bind(*id);
                }
                separated.push_unseparated(")");
                qb.build().execute(&mut *tx).await?;
            }
        }

        let languages: Vec<(i64, &LanguageShare)> = batch
            .iter()
            .flat_map(|r| r.languages.iter().map(move |l| (r.external_id, l)))
            .collect();
        for chunk in languages.chunks(INSERT_CHUNK) {
            let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
                "INSERT INTO {} (external_id, language_name, size_bytes, percentage) ",
                tables::REPOSITORY_LANGUAGES
            ));
            qb.push_values(chunk, |mut row, (id, lang)| {
                row.push_bind(*id)
                    .push_bind(&lang.name)
                    .push_bind(lang.size)
                    .push_bind(lang.percentage);
            });
            qb.build().execute(&mut *tx).await?;
        }
        report.languages = languages.len();

        let topics: Vec<(i64, &String)> = batch
            .iter()
            .flat_map(|r| r.topics.iter().map(move |t| (r.external_id, t)))
            .collect();
        for chunk in topics.chunks(INSERT_CHUNK) {
            let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
                "INSERT INTO {} (external_id, topic_name) ",
                tables::REPOSITORY_TOPICS
            ));
            qb.push_values(chunk, |mut row, (id, topic)| {
                row.push_bind(*id).push_bind(*topic);
            });
            qb.build().execute(&mut *tx).await?;
        }
        report.topics = topics.len();

        let dependencies: Vec<(i64, &Dependency)> = batch
            .iter()
            .flat_map(|r| r.dependencies.iter().map(move |d| (r.external_id, d)))
            .collect();
        for chunk in dependencies.chunks(INSERT_CHUNK) {
            let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
                "INSERT INTO {} (external_id, package_name, requirements, manifest_filename) ",
                tables::REPOSITORY_DEPENDENCIES
            ));
            qb.push_values(chunk, |mut row, (id, dep)| {
                row.push_bind(*id)
                    .push_bind(&dep.package_name)
                    .push_bind(&dep.requirements)
                    .push_bind(&dep.manifest_filename);
            });
            qb.build().execute(&mut *tx).await?;
        }
        report.dependencies = dependencies.len();

        tx.commit().await?;

        info!(
            records = report.records,
            languages = report.languages,
            topics = report.topics,
            dependencies = report.dependencies,
            "Bulk saved enriched records"
        );
        Ok(report)
    }

    /// Fetch one stored repository with its children.
    pub async fn get(&self, external_id: i64) -> Result<Option<StoredRecord>, StorageError> {
        let repository: Option<RepositoryRow> =
            sqlx::query_as("SELECT * FROM repositories WHERE external_id = ?")
                .bind(external_id)
                .fetch_optional(self.store.pool())
                .await?;
        let Some(repository) = repository else {
            return Ok(None);
        };

        let languages: Vec<LanguageShare> = sqlx::query_as(
            "SELECT language_name, size_bytes, percentage FROM repository_languages \
             WHERE external_id = ? ORDER BY size_bytes DESC, language_name",
        )
        .bind(external_id)
        .fetch_all(self.store.pool())
        .await?;

        let topics: Vec<String> = sqlx::query_scalar(
            "SELECT topic_name FROM repository_topics WHERE external_id = ? ORDER BY topic_name",
        )
        .bind(external_id)
        .fetch_all(self.store.pool())
        .await?;

        let dependencies: Vec<Dependency> = sqlx::query_as(
            "SELECT package_name, requirements, manifest_filename FROM repository_dependencies \
             WHERE external_id = ? ORDER BY id",
        )
        .bind(external_id)
        .fetch_all(self.store.pool())
        .await?;

        debug!(external_id, "Loaded stored record");
        Ok(Some(StoredRecord {
            repository,
            languages,
            topics,
            dependencies,
        }))
    }

    /// Most-starred repositories first.
    pub async fn list_top(&self, limit: u32) -> Result<Vec<RepositoryRow>, StorageError> {
        let rows = sqlx::query_as(
            "SELECT * FROM repositories ORDER BY stars DESC, external_id LIMIT ?",
        )
        .bind(i64::from(limit))
        .fetch_all(self.store.pool())
        .await?;
        Ok(rows)
    }

    pub async fn summary(&self) -> Result<StoreSummary, StorageError> {
        let (total_records, average_stars): (i64, Option<f64>) =
            sqlx::query_as("SELECT COUNT(*), AVG(stars) FROM repositories")
                .fetch_one(self.store.pool())
                .await?;

        let top_language: Option<String> = sqlx::query_scalar(
            "SELECT language_name FROM repository_languages \
             GROUP BY language_name ORDER BY COUNT(*) DESC, language_name LIMIT 1",
        )
        .fetch_optional(self.store.pool())
        .await?;

        Ok(StoreSummary {
            total_records,
            average_stars: average_stars.unwrap_or(0.0),
            top_language,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::test_support::temp_store;

    fn record(id: i64, languages: &[(&str, i64)], topics: &[&str]) -> EnrichedRecord {
        let mut r = EnrichedRecord::new(id, format!("owner/repo-{id}"))
            .with_languages(languages.iter().map(|(n, s)| (*n, *s)))
            .with_topics(topics.iter().copied());
        r.stars = id * 10;
        r
    }

    #[test]
    fn test_language_percentages_sum_to_hundred() {
        let shares = LanguageShare::from_sizes([("Rust", 300), ("Go", 100), ("Rust", 999)]);
        assert_eq!(shares.len(), 2);
        assert_eq!(shares[0].size, 300);
        assert_eq!(shares[0].percentage, 75.0);
        assert_eq!(shares[1].percentage, 25.0);

        let thirds = LanguageShare::from_sizes([("A", 1), ("B", 1), ("C", 1)]);
        let sum: f64 = thirds.iter().map(|s| s.percentage).sum();
        assert!((sum - 100.0).abs() < 0.05);
    }

    #[test]
    fn test_zero_sizes_have_zero_percentage() {
        let shares = LanguageShare::from_sizes([("A", 0)]);
        assert_eq!(shares[0].percentage, 0.0);
    }

    #[tokio::test]
    async fn test_store_empty_batch_is_noop() {
        let (_dir, store) = temp_store().await;
        let records = RecordStore::new(store);
        assert_eq!(records.store(&[]).await.unwrap(), PersistReport::default());
        assert_eq!(records.summary().await.unwrap().total_records, 0);
    }

    #[tokio::test]
    async fn test_store_single_language_gets_full_share() {
        let (_dir, store) = temp_store().await;
        let records = RecordStore::new(store);
        records.store(&[record(1, &[("Go", 100)], &[])]).await.unwrap();

        let stored = records.get(1).await.unwrap().unwrap();
        assert_eq!(
            stored.languages,
            vec![LanguageShare {
                name: "Go".into(),
                size: 100,
                percentage: 100.0
            }]
        );
    }

    #[tokio::test]
    async fn test_reenrichment_replaces_children() {
        let (_dir, store) = temp_store().await;
        let records = RecordStore::new(store);

        let mut first = record(7, &[("A", 10), ("B", 30)], &["cli", "db"]);
        first.dependencies.push(Dependency {
            package_name: "serde".into(),
            requirements: "^1".into(),
            manifest_filename: "Cargo.toml".into(),
        });
        records.store(&[first]).await.unwrap();
        let before = records.get(7).await.unwrap().unwrap();

        let mut second = record(7, &[("C", 5)], &[]);
        second.stars = 999;
        records.store(&[second]).await.unwrap();

        let stored = records.get(7).await.unwrap().unwrap();
        let names: Vec<_> = stored.languages.iter().map(|l| l.name.as_str()).collect();
        assert_eq!(names, vec!["C"]);
        assert!(stored.topics.is_empty());
        assert!(stored.dependencies.is_empty());
        assert_eq!(stored.repository.stars, 999);
        assert_eq!(
            stored.repository.first_enriched_at,
            before.repository.first_enriched_at
        );
    }

    #[tokio::test]
    async fn test_store_leaves_other_records_untouched() {
        let (_dir, store) = temp_store().await;
        let records = RecordStore::new(store);
        records
            .store(&[record(1, &[("Rust", 1)], &["x"]), record(2, &[("Go", 1)], &["y"])])
            .await
            .unwrap();

        records.store(&[record(1, &[("C", 1)], &[])]).await.unwrap();

        let other = records.get(2).await.unwrap().unwrap();
        assert_eq!(other.languages[0].name, "Go");
        assert_eq!(other.topics, vec!["y".to_string()]);
    }

    #[tokio::test]
    async fn test_duplicate_ids_in_batch_keep_last() {
        let (_dir, store) = temp_store().await;
        let records = RecordStore::new(store);
        let report = records
            .store(&[
                record(3, &[("A", 1)], &["t", "t"]),
                record(3, &[("B", 1)], &["u", "u"]),
            ])
            .await
            .unwrap();
        assert_eq!(report.records, 1);

        let stored = records.get(3).await.unwrap().unwrap();
        assert_eq!(stored.languages[0].name, "B");
        assert_eq!(stored.topics, vec!["u".to_string()]);
    }

    #[tokio::test]
    async fn test_read_paths() {
        let (_dir, store) = temp_store().await;
        let records = RecordStore::new(store);
        records
            .store(&[
                record(1, &[("Rust", 1)], &[]),
                record(2, &[("Rust", 1), ("Go", 1)], &[]),
                record(3, &[("Go", 1), ("Rust", 2)], &[]),
            ])
            .await
            .unwrap();

        let top = records.list_top(2).await.unwrap();
        let ids: Vec<_> = top.iter().map(|r| r.external_id).collect();
        assert_eq!(ids, vec![3, 2]);

        let summary = records.summary().await.unwrap();
        assert_eq!(summary.total_records, 3);
        assert!((summary.average_stars - 20.0).abs() < f64::EPSILON);
        assert_eq!(summary.top_language.as_deref(), Some("Rust"));

        assert!(records.get(42).await.unwrap().is_none());
    }
}
