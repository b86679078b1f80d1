//! Detail response parsing.

use serde_json::Value;

use crate::error::FetchError;
use crate::storage::{Dependency, EnrichedRecord, LanguageShare};

/// Build an [`EnrichedRecord`] from a GraphQL detail response.
///
/// Returns `Ok(None)` when the response is well formed but carries no
/// repository. Missing counters default to zero; a missing or non-numeric
/// star or fork count is a parse error. Errors never include the payload.
pub fn parse_repository(
    external_id: i64,
    external_name: &str,
    payload: &Value,
) -> Result<Option<EnrichedRecord>, FetchError> {
    let data = payload
        .get("data")
        .ok_or_else(|| FetchError::Parse("response has no 'data' field".to_string()))?;
    let repo = match data.get("repository") {
        None | Some(Value::Null) => return Ok(None),
        Some(repo) if repo.is_object() => repo,
        Some(_) => {
            return Err(FetchError::Parse(
                "'repository' is not an object".to_string(),
            ))
        }
    };

    let full_name = repo
        .get("nameWithOwner")
        .and_then(Value::as_str)
        .unwrap_or(external_name);

    let mut record = EnrichedRecord::new(external_id, full_name);
    record.stars = required_count(repo, "stargazerCount")?;
    record.forks = required_count(repo, "forkCount")?;
    record.open_issues = total_count(repo, "/openIssues/totalCount");
    record.closed_issues = total_count(repo, "/closedIssues/totalCount");
    record.subscribers = total_count(repo, "/watchers/totalCount");
    record.contributors_count = total_count(repo, "/mentionableUsers/totalCount");
    record.commits_last_30_days = recent_commits(repo);

    let sizes = repo
        .pointer("/languages/edges")
        .and_then(Value::as_array)
        .map(|edges| {
            edges
                .iter()
                .filter_map(|edge| {
                    let name = edge.pointer("/node/name").and_then(Value::as_str)?;
                    let size = edge.get("size").and_then(Value::as_i64).unwrap_or(0);
                    Some((name.to_string(), size))
                })
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();
    record.languages = LanguageShare::from_sizes(sizes);

    let mut topics: Vec<String> = Vec::new();
    for node in repo
        .pointer("/repositoryTopics/nodes")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
    {
        if let Some(name) = node.pointer("/topic/name").and_then(Value::as_str) {
            if !topics.iter().any(|t| t == name) {
                topics.push(name.to_string());
            }
        }
    }
    record.topics = topics;

    for manifest in repo
        .pointer("/dependencyGraphManifests/nodes")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
    {
        let filename = manifest
            .get("filename")
            .and_then(Value::as_str)
            .unwrap_or_default();
        for dep in manifest
            .pointer("/dependencies/nodes")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
        {
            let Some(package) = dep.get("packageName").and_then(Value::as_str) else {
                continue;
            };
            record.dependencies.push(Dependency {
                package_name: package.to_string(),
                requirements: dep
                    .get("requirements")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                manifest_filename: filename.to_string(),
            });
        }
    }

    Ok(Some(record))
}

fn required_count(repo: &Value, field: &str) -> Result<i64, FetchError> {
    repo.get(field)
        .and_then(Value::as_i64)
        .ok_or_else(|| FetchError::Parse(format!("missing or non-numeric '{field}'")))
}

fn total_count(repo: &Value, pointer: &str) -> i64 {
    repo.pointer(pointer).and_then(Value::as_i64).unwrap_or(0)
}

/// Commits on the default branch in the recent window. Falls back to the
/// number of history nodes when only nodes were requested.
fn recent_commits(repo: &Value) -> i64 {
    let Some(history) = repo.pointer("/defaultBranchRef/target/history") else {
        return 0;
    };
    history
        .get("totalCount")
        .and_then(Value::as_i64)
        .or_else(|| {
            history
                .get("nodes")
                .and_then(Value::as_array)
                .map(|nodes| nodes.len() as i64)
        })
        .unwrap_or(0)
}
