//! GitHub REST v3 issue tracker.
//!
//! GitHub issues have no counter field, so the occurrence counter and the
//! similarity key travel in an HTML comment appended to the issue body:
//!
//! ```text
//! <!-- patchctl:occurrences=3 key=5f0c2a19d4e8b7a1 -->
//! ```

use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::record::{IssueCategory, IssueRecord};
use super::similarity::similarity_key;
use super::tracker::IssueTracker;
use crate::error::{PatchError, Result};

pub const DEFAULT_API_URL: &str = "https://api.github.com";
const API_VERSION: &str = "2022-11-28";
const API_TIMEOUT_SECS: u64 = 30;
const PER_PAGE: usize = 100;
/// Search stops after this many pages; older duplicates are then missed.
const MAX_SEARCH_PAGES: u32 = 10;
const MAX_ERROR_BODY_LEN: usize = 200;

fn marker_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\n*<!-- patchctl:occurrences=(\d+)(?: key=([0-9a-f]+))? -->\s*$")
            .expect("valid marker regex")
    })
}

/// Render the trailing body marker.
pub fn render_marker(occurrences: u32, key: &str) -> String {
    format!("<!-- patchctl:occurrences={occurrences} key={key} -->")
}

/// Split a stored body into the visible text and the marker's counter and key.
pub fn parse_marker(body: &str) -> (String, Option<u32>, Option<String>) {
    match marker_regex().captures(body) {
        Some(caps) => {
            let start = caps.get(0).map_or(body.len(), |m| m.start());
            let counter = caps.get(1).and_then(|m| m.as_str().parse().ok());
            let key = caps.get(2).map(|m| m.as_str().to_string());
            (body[..start].to_string(), counter, key)
        }
        None => (body.to_string(), None, None),
    }
}

fn body_with_marker(body: &str, occurrences: u32, key: &str) -> String {
    let (visible, _, _) = parse_marker(body);
    format!("{}\n\n{}", visible.trim_end(), render_marker(occurrences, key))
}

fn sanitize_error_body(body: &str) -> String {
    const SECRET_PATTERNS: &[&str] = &["token", "secret", "password", "bearer", "ghp_", "github_pat_"];
    let lower = body.to_lowercase();
    if SECRET_PATTERNS.iter().any(|p| lower.contains(p)) {
        return "(error details redacted)".to_string();
    }
    crate::process::truncate_output(body, MAX_ERROR_BODY_LEN)
}

#[derive(Debug, Deserialize)]
struct ApiLabel {
    name: String,
}

#[derive(Debug, Deserialize)]
struct ApiIssue {
    number: u64,
    title: String,
    #[serde(default)]
    body: Option<String>,
    created_at: DateTime<Utc>,
    #[serde(default)]
    labels: Vec<ApiLabel>,
    #[serde(default)]
    pull_request: Option<serde_json::Value>,
}

impl ApiIssue {
    fn into_record(self, fallback: IssueCategory) -> IssueRecord {
        let labels: Vec<String> = self.labels.into_iter().map(|l| l.name).collect();
        let category = labels
            .iter()
            .find_map(|l| IssueCategory::from_label(l))
            .unwrap_or(fallback);
        let (body, counter, key) = parse_marker(self.body.as_deref().unwrap_or_default());
        IssueRecord {
            id: Some(self.number.to_string()),
            similarity_key: key.unwrap_or_else(|| similarity_key(category, &self.title)),
            title: self.title,
            body,
            category,
            created_at: self.created_at,
            occurrence_counter: counter.unwrap_or(1),
            environment_snapshot: Default::default(),
            labels,
        }
    }
}

#[derive(Debug, Serialize)]
struct CreateIssueRequest<'a> {
    title: &'a str,
    body: String,
    labels: &'a [String],
}

#[derive(Debug, Serialize)]
struct UpdateIssueRequest {
    body: String,
}

#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    message: String,
}

/// Issue tracker backed by one GitHub repository.
pub struct GitHubIssueTracker {
    api_url: String,
    owner: String,
    repo: String,
    token: String,
    http_client: reqwest::Client,
}

impl GitHubIssueTracker {
    /// `repository` is `owner/name`.
    pub fn new(repository: &str, token: impl Into<String>) -> Result<Self> {
        let (owner, repo) = repository
            .split_once('/')
            .filter(|(o, r)| !o.is_empty() && !r.is_empty() && !r.contains('/'))
            .ok_or_else(|| PatchError::InvalidConfig(format!("expected owner/name, got '{repository}'")))?;

        let http_client = reqwest::Client::builder()
            .user_agent(concat!("patchctl/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(API_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            api_url: DEFAULT_API_URL.to_string(),
            owner: owner.to_string(),
            repo: repo.to_string(),
            token: token.into(),
            http_client,
        })
    }

    /// Build from `GITHUB_TOKEN`.
    pub fn from_env(repository: &str) -> Result<Self> {
        let token = std::env::var("GITHUB_TOKEN")
            .ok()
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| PatchError::InvalidConfig("GITHUB_TOKEN is not set".to_string()))?;
        Self::new(repository, token)
    }

    /// Point at a GitHub Enterprise API root.
    pub fn with_api_url(mut self, url: impl Into<String>) -> Self {
        self.api_url = url.into().trim_end_matches('/').to_string();
        self
    }

    fn issues_url(&self) -> String {
        format!("{}/repos/{}/{}/issues", self.api_url, self.owner, self.repo)
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        self.http_client
            .request(method, url)
            .header("Accept", "application/vnd.github+json")
            .header("Authorization", format!("Bearer {}", self.token))
            .header("X-GitHub-Api-Version", API_VERSION)
    }

    async fn send<T: serde::de::DeserializeOwned>(&self, request: reqwest::RequestBuilder) -> Result<T> {
        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response.json().await?);
        }
        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ApiErrorResponse>(&body)
            .map(|e| e.message)
            .unwrap_or_else(|_| sanitize_error_body(&body));
        Err(PatchError::Tracker {
            status: Some(status.as_u16()),
            message,
        })
    }

    async fn fetch(&self, id: &str) -> Result<ApiIssue> {
        let url = format!("{}/{id}", self.issues_url());
        self.send(self.request(reqwest::Method::GET, &url)).await
    }
}

#[async_trait]
impl IssueTracker for GitHubIssueTracker {
    async fn search_open(&self, category: IssueCategory, since: DateTime<Utc>) -> Result<Vec<IssueRecord>> {
        let label = category.label();
        let since_param = since.to_rfc3339();
        let per_page = PER_PAGE.to_string();
        let mut records = Vec::new();

        for page in 1..=MAX_SEARCH_PAGES {
            let page_param = page.to_string();
            let request = self.request(reqwest::Method::GET, &self.issues_url()).query(&[
                ("state", "open"),
                ("labels", label.as_str()),
                ("since", since_param.as_str()),
                ("per_page", per_page.as_str()),
                ("page", page_param.as_str()),
            ]);
            let issues: Vec<ApiIssue> = self.send(request).await?;
            let last_page = issues.len() < PER_PAGE;

            // `since` filters on update time; the window is on creation time.
            records.extend(
                issues
                    .into_iter()
                    .filter(|i| i.pull_request.is_none() && i.created_at >= since)
                    .map(|i| i.into_record(category)),
            );
            if last_page {
                return Ok(records);
            }
        }

        tracing::warn!(
            category = %category,
            pages = MAX_SEARCH_PAGES,
            "issue search truncated; older duplicates may be missed"
        );
        Ok(records)
    }

    async fn create(&self, record: &IssueRecord) -> Result<IssueRecord> {
        let payload = CreateIssueRequest {
            title: &record.title,
            body: body_with_marker(&record.rendered_body(), record.occurrence_counter, &record.similarity_key),
            labels: &record.labels,
        };
        let created: ApiIssue = self
            .send(self.request(reqwest::Method::POST, &self.issues_url()).json(&payload))
            .await?;
        tracing::info!(number = created.number, title = %record.title, "created issue");
        Ok(created.into_record(record.category))
    }

    async fn update(&self, id: &str, body: &str, occurrence_counter: u32) -> Result<IssueRecord> {
        let current = self.fetch(id).await?;
        let (_, stored_counter, stored_key) = parse_marker(current.body.as_deref().unwrap_or_default());
        let counter = occurrence_counter.max(stored_counter.unwrap_or(1));
        let key = stored_key.unwrap_or_else(|| {
            let category = current
                .labels
                .iter()
                .find_map(|l| IssueCategory::from_label(&l.name))
                .unwrap_or(IssueCategory::Other);
            similarity_key(category, &current.title)
        });

        let url = format!("{}/{id}", self.issues_url());
        let payload = UpdateIssueRequest {
            body: body_with_marker(body, counter, &key),
        };
        let updated: ApiIssue = self
            .send(self.request(reqwest::Method::PATCH, &url).json(&payload))
            .await?;
        tracing::info!(number = updated.number, occurrences = counter, "updated issue");
        Ok(updated.into_record(IssueCategory::Other))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn issue_json(number: usize, created_at: &str, pull_request: bool) -> String {
        let pr = if pull_request { r#","pull_request":{}"# } else { "" };
        format!(
            r#"{{"number":{number},"title":"Import failure {number}","body":null,"created_at":"{created_at}","labels":[{{"name":"category:module-import"}}]{pr}}}"#
        )
    }

    /// Serve `pages` of issues over plain HTTP, one connection per request,
    /// and return the base URL.
    async fn serve_pages(pages: Vec<String>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                let mut head = Vec::new();
                let mut buf = [0u8; 1024];
                while !head.windows(4).any(|w| w == &b"\r\n\r\n"[..]) {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => head.extend_from_slice(&buf[..n]),
                    }
                }
                let head = String::from_utf8_lossy(&head);
                let page: usize = head
                    .split_whitespace()
                    .nth(1)
                    .and_then(|path| path.split(['?', '&']).find_map(|kv| kv.strip_prefix("page=")))
                    .and_then(|n| n.parse().ok())
                    .unwrap_or(1);
                let body = pages.get(page - 1).cloned().unwrap_or_else(|| "[]".to_string());
                let response = format!(
                    "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn search_follows_pages_until_a_short_one() {
        let recent = "2026-10-01T12:00:00Z";
        let first: Vec<String> = (1..=PER_PAGE).map(|n| issue_json(n, recent, false)).collect();
        let second = [
            issue_json(101, recent, false),
            issue_json(102, recent, true),
            issue_json(103, "2026-01-01T00:00:00Z", false),
        ];
        let base = serve_pages(vec![format!("[{}]", first.join(",")), format!("[{}]", second.join(","))]).await;

        let tracker = GitHubIssueTracker::new("stevedores-org/patchctl", "t")
            .unwrap()
            .with_api_url(base);
        let since: DateTime<Utc> = "2026-09-30T00:00:00Z".parse().unwrap();
        let records = tracker.search_open(IssueCategory::ModuleImport, since).await.unwrap();

        assert_eq!(records.len(), PER_PAGE + 1);
        assert!(records.iter().any(|r| r.id.as_deref() == Some("101")));
        assert!(records.iter().all(|r| r.id.as_deref() != Some("102")));
        assert!(records.iter().all(|r| r.id.as_deref() != Some("103")));
    }

    #[test]
    fn marker_round_trips_through_body() {
        let body = body_with_marker("Import failed\n", 4, "abcdef0123456789");
        assert!(body.ends_with("<!-- patchctl:occurrences=4 key=abcdef0123456789 -->"));
        let (visible, counter, key) = parse_marker(&body);
        assert_eq!(visible, "Import failed");
        assert_eq!(counter, Some(4));
        assert_eq!(key.as_deref(), Some("abcdef0123456789"));
    }

    #[test]
    fn rewriting_replaces_existing_marker() {
        let once = body_with_marker("text", 2, "aa");
        let twice = body_with_marker(&once, 3, "aa");
        assert_eq!(twice.matches("patchctl:occurrences").count(), 1);
        assert_eq!(parse_marker(&twice).1, Some(3));
    }

    #[test]
    fn body_without_marker_is_untouched() {
        let (visible, counter, key) = parse_marker("plain body");
        assert_eq!(visible, "plain body");
        assert!(counter.is_none() && key.is_none());
    }

    #[test]
    fn api_issue_maps_labels_and_counter() {
        let json = r#"{
            "number": 42,
            "title": "No module named yaml (#4)",
            "body": "trace\n\n<!-- patchctl:occurrences=4 key=0011223344556677 -->",
            "created_at": "2026-10-01T12:00:00Z",
            "labels": [{"name": "automated"}, {"name": "category:module-import"}]
        }"#;
        let issue: ApiIssue = serde_json::from_str(json).unwrap();
        let record = issue.into_record(IssueCategory::Other);
        assert_eq!(record.id.as_deref(), Some("42"));
        assert_eq!(record.category, IssueCategory::ModuleImport);
        assert_eq!(record.occurrence_counter, 4);
        assert_eq!(record.similarity_key, "0011223344556677");
        assert_eq!(record.body, "trace");
    }

    #[test]
    fn repository_must_be_owner_slash_name() {
        assert!(GitHubIssueTracker::new("stevedores-org/patchctl", "t").is_ok());
        assert!(matches!(
            GitHubIssueTracker::new("patchctl", "t"),
            Err(PatchError::InvalidConfig(_))
        ));
        assert!(GitHubIssueTracker::new("a/b/c", "t").is_err());
    }

    #[test]
    fn secrets_in_error_bodies_are_redacted() {
        assert_eq!(sanitize_error_body("bad token ghp_xxx"), "(error details redacted)");
        assert_eq!(sanitize_error_body("Not Found"), "Not Found");
    }
}
