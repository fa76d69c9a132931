//! External adapters: repo host, ticketing, and chat.
//!
//! The core talks to these through capability traits; the concrete
//! implementations wrap the provider HTTP APIs. Everything here is
//! replaceable in tests with trait mocks.

pub mod describe;
pub mod github;
pub mod linear;
pub mod slack;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Errors surfaced by adapters.
#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("auth error: {0}")]
    Auth(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("provider error ({status}): {message}")]
    Provider { status: u16, message: String },

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

pub type AdapterResult<T> = Result<T, AdapterError>;

/// Basic repository facts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoInfo {
    pub full_name: String,
    pub default_branch: String,
    pub private: bool,
}

/// A created pull request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullRequest {
    pub number: u64,
    pub url: String,
    pub head_branch: String,
    pub base_branch: String,
}

/// Details of an existing pull request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullRequestDetails {
    pub number: u64,
    pub title: String,
    pub state: String,
    pub author: String,
    pub url: String,
}

/// Repository host capability (GitHub in production).
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RepoHost: Send + Sync {
    async fn verify_connection(&self) -> AdapterResult<()>;

    async fn get_repo_info(&self, repo: &str) -> AdapterResult<RepoInfo>;

    /// `None` for a missing file; a 404 on an optional read is not an
    /// error.
    async fn get_file_contents(
        &self,
        repo: &str,
        path: &str,
        git_ref: &str,
    ) -> AdapterResult<Option<String>>;

    /// File paths under `path` (repo root when empty), bounded by depth,
    /// with build/cache directories skipped. Implementations cache per
    /// (repo, path, ref, depth).
    async fn get_repo_structure(
        &self,
        repo: &str,
        path: &str,
        git_ref: &str,
        max_depth: u32,
    ) -> AdapterResult<Vec<String>>;

    async fn search_code(&self, repo: &str, query: &str) -> AdapterResult<Vec<String>>;

    async fn create_or_update_file(
        &self,
        repo: &str,
        path: &str,
        content: &str,
        message: &str,
        branch: &str,
    ) -> AdapterResult<()>;

    #[allow(clippy::too_many_arguments)]
    async fn create_pr(
        &self,
        repo: &str,
        title: &str,
        body: &str,
        head_branch: &str,
        base_branch: &str,
        changes: &std::collections::BTreeMap<String, String>,
        draft: bool,
    ) -> AdapterResult<PullRequest>;

    async fn get_pr_details(&self, repo: &str, number: u64) -> AdapterResult<PullRequestDetails>;

    async fn comment_on_pr(&self, repo: &str, number: u64, body: &str) -> AdapterResult<()>;

    async fn request_pr_changes(&self, repo: &str, number: u64, body: &str) -> AdapterResult<()>;

    async fn approve_pr(&self, repo: &str, number: u64) -> AdapterResult<()>;

    async fn list_prs_by_author(
        &self,
        repo: &str,
        author: &str,
    ) -> AdapterResult<Vec<PullRequestDetails>>;
}

/// A ticket as the core reads it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TicketIssue {
    pub id: String,
    pub identifier: String,
    pub title: String,
    pub url: String,
    pub state: String,
    pub priority: u8,
    pub assignee: Option<String>,
    pub labels: Vec<String>,
}

/// Ticketing capability (Linear in production).
#[async_trait]
pub trait TicketHost: Send + Sync {
    async fn create_issue(
        &self,
        title: &str,
        description: &str,
        team_id: Option<&str>,
        priority: u8,
    ) -> AdapterResult<TicketIssue>;

    async fn get_issue(&self, issue_id: &str) -> AdapterResult<TicketIssue>;

    async fn update_issue(
        &self,
        issue_id: &str,
        title: Option<&str>,
        description: Option<&str>,
    ) -> AdapterResult<()>;

    async fn update_issue_state(&self, issue_id: &str, state: &str) -> AdapterResult<()>;

    async fn add_comment_to_issue(&self, issue_id: &str, body: &str) -> AdapterResult<()>;

    /// Open issues the bot may try to resolve: assigned to the bot,
    /// optionally filtered to teams, with excluded labels post-filtered
    /// and priorities above `max_priority` dropped.
    async fn get_open_resolvable_issues(
        &self,
        team_ids: Option<&[String]>,
        exclude_labels: Option<&[String]>,
        max_priority: Option<u8>,
    ) -> AdapterResult<Vec<TicketIssue>>;
}

/// Chat capability (Slack in production).
#[async_trait]
pub trait ChatHost: Send + Sync {
    /// Returns the posted message timestamp (thread key).
    async fn post_message(
        &self,
        channel: &str,
        text: &str,
        thread_ts: Option<&str>,
    ) -> AdapterResult<String>;

    /// Post a "thinking" indicator; returns its ts for later deletion.
    async fn post_thinking_indicator(&self, channel: &str, thread_ts: Option<&str>)
        -> AdapterResult<String>;

    async fn delete_message(&self, channel: &str, ts: &str) -> AdapterResult<()>;
}
