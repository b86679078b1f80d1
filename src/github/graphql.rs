//! GitHub GraphQL detail client.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};

use super::{retry_after, DetailApi, USER_AGENT};
use crate::error::FetchError;

const GRAPHQL_URL: &str = "https://api.github.com/graphql";

/// Days of commit history counted as recent activity.
pub const RECENT_COMMIT_DAYS: i64 = 30;

const REPOSITORY_QUERY: &str = r#"
query RepositoryDetail($owner: String!, $name: String!, $since: GitTimestamp!) {
  repository(owner: $owner, name: $name) {
    nameWithOwner
    stargazerCount
    forkCount
    openIssues: issues(states: OPEN) { totalCount }
    closedIssues: issues(states: CLOSED) { totalCount }
    watchers { totalCount }
    mentionableUsers { totalCount }
    defaultBranchRef {
      target {
        ... on Commit {
          history(since: $since) { totalCount }
        }
      }
    }
    languages(first: 25, orderBy: { field: SIZE, direction: DESC }) {
      edges { size node { name } }
    }
    repositoryTopics(first: 25) {
      nodes { topic { name } }
    }
    dependencyGraphManifests(first: 10) {
      nodes {
        filename
        dependencies(first: 100) {
          nodes { packageName requirements }
        }
      }
    }
  }
}
"#;

#[derive(Debug, Clone)]
pub struct GraphQlClient {
    client: Client,
    endpoint: String,
    token: Option<String>,
}

impl GraphQlClient {
    pub fn new(token: Option<String>, timeout: Duration) -> Self {
        Self {
            client: Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_else(|_| Client::new()),
            endpoint: GRAPHQL_URL.to_string(),
            token,
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn has_token(&self) -> bool {
        self.token.is_some()
    }
}

#[async_trait]
impl DetailApi for GraphQlClient {
    async fn fetch_detail(&self, owner: &str, name: &str) -> Result<Value, FetchError> {
        let since = (Utc::now() - chrono::Duration::days(RECENT_COMMIT_DAYS))
            .format("%Y-%m-%dT%H:%M:%SZ")
            .to_string();
        let body = json!({
            "query": REPOSITORY_QUERY,
            "variables": { "owner": owner, "name": name, "since": since },
        });

        let mut request = self
            .client
            .post(&self.endpoint)
            .header("User-Agent", USER_AGENT)
            // Dependency graph manifests are still a preview field.
            .header("Accept", "application/vnd.github.hawkgirl-preview+json")
            .json(&body);
        if let Some(ref token) = self.token {
            request = request.header("Authorization", format!("Bearer {token}"));
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let retry = retry_after(response.headers());
            let message = response.text().await.unwrap_or_default();
            return Err(classify_status(status, retry, &message));
        }

        let payload: Value = response.json().await?;
        check_errors(&payload)?;
        Ok(payload)
    }
}

/// Map a non-success HTTP status to a fetch error.
pub fn classify_status(status: StatusCode, retry_after: Option<u64>, body: &str) -> FetchError {
    match status.as_u16() {
        403 | 429 => FetchError::RateLimited { retry_after },
        404 => FetchError::NotFound,
        code @ 500..=599 => FetchError::Server { status: code },
        code => FetchError::Rejected {
            status: code,
            message: body.chars().take(200).collect(),
        },
    }
}

/// Inspect GraphQL-level `errors`, which arrive with HTTP 200.
///
/// `NOT_FOUND` and `RATE_LIMITED` are classified. Other errors are tolerated
/// when a repository object came back (e.g. no access to the dependency
/// graph) and rejected otherwise.
pub fn check_errors(payload: &Value) -> Result<(), FetchError> {
    let Some(errors) = payload.get("errors").and_then(Value::as_array) else {
        return Ok(());
    };
    if errors.is_empty() {
        return Ok(());
    }

    for error in errors {
        match error.get("type").and_then(Value::as_str) {
            Some("NOT_FOUND") => return Err(FetchError::NotFound),
            Some("RATE_LIMITED") => return Err(FetchError::RateLimited { retry_after: None }),
            _ => {}
        }
    }

    let has_repository = payload
        .pointer("/data/repository")
        .is_some_and(|repo| !repo.is_null());
    if has_repository {
        tracing::debug!(errors = errors.len(), "Ignoring partial GraphQL errors");
        return Ok(());
    }

    let message = errors
        .iter()
        .filter_map(|e| e.get("message").and_then(Value::as_str))
        .collect::<Vec<_>>()
        .join("; ");
    Err(FetchError::Rejected {
        status: 200,
        message,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_status_mapping() {
        let unauthorized = classify_status(StatusCode::UNAUTHORIZED, None, "Bad credentials");
        assert_eq!(unauthorized.kind(), ErrorKind::Permanent);

        assert!(matches!(
            classify_status(StatusCode::FORBIDDEN, Some(60), ""),
            FetchError::RateLimited {
                retry_after: Some(60)
            }
        ));
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, None, ""),
            FetchError::RateLimited { .. }
        ));
        assert!(matches!(
            classify_status(StatusCode::NOT_FOUND, None, ""),
            FetchError::NotFound
        ));
        let bad_gateway = classify_status(StatusCode::BAD_GATEWAY, None, "");
        assert!(matches!(bad_gateway, FetchError::Server { status: 502 }));
        assert_eq!(bad_gateway.kind(), ErrorKind::Transient);
    }

    #[test]
    fn test_graphql_not_found() {
        let payload = json!({
            "data": { "repository": null },
            "errors": [{ "type": "NOT_FOUND", "message": "Could not resolve to a Repository" }]
        });
        assert!(matches!(check_errors(&payload), Err(FetchError::NotFound)));
    }

    #[test]
    fn test_graphql_rate_limited() {
        let payload = json!({ "errors": [{ "type": "RATE_LIMITED", "message": "slow down" }] });
        let err = check_errors(&payload).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transient);
    }

    #[test]
    fn test_graphql_partial_errors_tolerated() {
        let payload = json!({
            "data": { "repository": { "stargazerCount": 1, "forkCount": 0 } },
            "errors": [{ "type": "FORBIDDEN", "message": "dependency graph disabled" }]
        });
        assert!(check_errors(&payload).is_ok());

        let payload = json!({
            "data": null,
            "errors": [{ "message": "Field 'x' doesn't exist" }]
        });
        assert!(matches!(
            check_errors(&payload),
            Err(FetchError::Rejected { status: 200, .. })
        ));
    }

    #[test]
    fn test_no_errors() {
        assert!(check_errors(&json!({ "data": { "repository": null } })).is_ok());
    }
}
