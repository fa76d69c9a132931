//! GitHub repo-host adapter.
//!
//! Bearer-token REST client. For root-scoped requests `get_repo_structure`
//! prefers one recursive tree fetch, falling back to manual traversal when
//! GitHub marks the tree truncated; path-scoped requests always traverse
//! the contents API, which bounds the subtree. Results are cached for five
//! minutes per (repo, path, ref, depth). Build and dependency directories
//! never make it into the index.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{AdapterError, AdapterResult, PullRequest, PullRequestDetails, RepoHost, RepoInfo};

/// Structure-cache time to live.
const STRUCTURE_CACHE_TTL: Duration = Duration::from_secs(300);

/// Directories skipped while indexing repo structure.
const SKIP_DIRS: [&str; 10] = [
    "node_modules",
    "__pycache__",
    ".git",
    ".next",
    "dist",
    "build",
    "target",
    "vendor",
    "coverage",
    ".venv",
];

struct CachedStructure {
    fetched_at: Instant,
    paths: Vec<String>,
}

/// GitHub REST adapter.
pub struct GithubAdapter {
    client: reqwest::Client,
    base_url: String,
    token: String,
    /// Keyed by (repo, path, ref, depth).
    structure_cache: Mutex<HashMap<(String, String, String, u32), CachedStructure>>,
}

#[derive(Deserialize)]
struct RepoReply {
    full_name: String,
    default_branch: String,
    private: bool,
}

#[derive(Deserialize)]
struct TreeReply {
    #[serde(default)]
    tree: Vec<TreeEntry>,
    #[serde(default)]
    truncated: bool,
}

#[derive(Deserialize)]
struct TreeEntry {
    path: String,
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Deserialize)]
struct ContentsEntry {
    path: String,
    name: String,
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Deserialize)]
struct FileContentsReply {
    #[serde(default)]
    content: String,
    #[serde(default)]
    encoding: String,
    #[serde(default)]
    sha: String,
}

#[derive(Deserialize)]
struct RefReply {
    object: RefObject,
}

#[derive(Deserialize)]
struct RefObject {
    sha: String,
}

#[derive(Deserialize)]
struct PrReply {
    number: u64,
    html_url: String,
}

#[derive(Deserialize)]
struct PrDetailsReply {
    number: u64,
    title: String,
    state: String,
    html_url: String,
    user: PrUser,
}

#[derive(Deserialize)]
struct PrUser {
    login: String,
}

#[derive(Deserialize)]
struct SearchReply {
    #[serde(default)]
    items: Vec<SearchItem>,
}

#[derive(Deserialize)]
struct SearchItem {
    path: String,
}

fn decode_base64(data: &str) -> Option<Vec<u8>> {
    use base64::Engine;
    // GitHub wraps base64 at 60 columns; strip all whitespace first.
    let cleaned: String = data.chars().filter(|c| !c.is_whitespace()).collect();
    base64::engine::general_purpose::STANDARD.decode(cleaned).ok()
}

impl GithubAdapter {
    pub fn new(token: &str, timeout: Duration) -> AdapterResult<Self> {
        Self::with_base_url(token, timeout, "https://api.github.com")
    }

    /// Test hook: point at a stub server.
    pub fn with_base_url(token: &str, timeout: Duration, base_url: &str) -> AdapterResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent("healops-agents")
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            structure_cache: Mutex::new(HashMap::new()),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> AdapterResult<T> {
        let response = self
            .client
            .get(self.url(path))
            .bearer_auth(&self.token)
            .header("Accept", "application/vnd.github+json")
            .send()
            .await?;
        Self::parse_response(response).await
    }

    async fn parse_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> AdapterResult<T> {
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(AdapterError::NotFound("github resource".into()));
        }
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(AdapterError::Auth(format!("github returned {status}")));
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(AdapterError::Provider {
                status: status.as_u16(),
                message: message.chars().take(200).collect(),
            });
        }
        Ok(response.json::<T>().await?)
    }

    async fn post_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        body: serde_json::Value,
    ) -> AdapterResult<T> {
        let response = self
            .client
            .post(self.url(path))
            .bearer_auth(&self.token)
            .header("Accept", "application/vnd.github+json")
            .json(&body)
            .send()
            .await?;
        Self::parse_response(response).await
    }

    fn is_skipped(path: &str) -> bool {
        path.split('/').any(|seg| SKIP_DIRS.contains(&seg))
    }

    /// Manual traversal fallback for truncated trees.
    async fn traverse_contents(
        &self,
        repo: &str,
        path: &str,
        git_ref: &str,
        depth_left: u32,
        out: &mut Vec<String>,
    ) -> AdapterResult<()> {
        let encoded = path.trim_start_matches('/');
        let entries: Vec<ContentsEntry> = self
            .get_json(&format!("/repos/{repo}/contents/{encoded}?ref={git_ref}"))
            .await?;
        for entry in entries {
            if SKIP_DIRS.contains(&entry.name.as_str()) {
                continue;
            }
            match entry.kind.as_str() {
                "file" => out.push(entry.path),
                "dir" if depth_left > 0 => {
                    // Per-directory failures don't abort the walk.
                    if let Err(e) = Box::pin(self.traverse_contents(
                        repo,
                        &entry.path,
                        git_ref,
                        depth_left - 1,
                        out,
                    ))
                    .await
                    {
                        warn!(path = %entry.path, error = %e, "directory traversal failed");
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    async fn branch_sha(&self, repo: &str, branch: &str) -> AdapterResult<String> {
        let reply: RefReply = self
            .get_json(&format!("/repos/{repo}/git/ref/heads/{branch}"))
            .await?;
        Ok(reply.object.sha)
    }
}

#[async_trait]
impl RepoHost for GithubAdapter {
    async fn verify_connection(&self) -> AdapterResult<()> {
        let _: serde_json::Value = self.get_json("/user").await?;
        Ok(())
    }

    async fn get_repo_info(&self, repo: &str) -> AdapterResult<RepoInfo> {
        let reply: RepoReply = self.get_json(&format!("/repos/{repo}")).await?;
        Ok(RepoInfo {
            full_name: reply.full_name,
            default_branch: reply.default_branch,
            private: reply.private,
        })
    }

    async fn get_file_contents(
        &self,
        repo: &str,
        path: &str,
        git_ref: &str,
    ) -> AdapterResult<Option<String>> {
        let encoded = path.trim_start_matches('/');
        let result: AdapterResult<FileContentsReply> = self
            .get_json(&format!("/repos/{repo}/contents/{encoded}?ref={git_ref}"))
            .await;
        match result {
            Ok(reply) => {
                if reply.encoding == "base64" {
                    let decoded = decode_base64(&reply.content)
                        .and_then(|bytes| String::from_utf8(bytes).ok());
                    Ok(decoded)
                } else {
                    Ok(Some(reply.content))
                }
            }
            Err(AdapterError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn get_repo_structure(
        &self,
        repo: &str,
        path: &str,
        git_ref: &str,
        max_depth: u32,
    ) -> AdapterResult<Vec<String>> {
        let scope = path.trim_matches('/').to_string();
        let cache_key = (
            repo.to_string(),
            scope.clone(),
            git_ref.to_string(),
            max_depth,
        );
        {
            let cache = self.structure_cache.lock().await;
            if let Some(cached) = cache.get(&cache_key) {
                if cached.fetched_at.elapsed() < STRUCTURE_CACHE_TTL {
                    debug!(repo, path = %scope, git_ref, "repo structure cache hit");
                    return Ok(cached.paths.clone());
                }
            }
        }

        // The bulk recursive tree fetch covers the whole repo, so only
        // root-scoped requests may take it; a scoped request walks the
        // contents API, which bounds both the subtree and the depth.
        let mut paths = if scope.is_empty() {
            let reply: AdapterResult<TreeReply> = self
                .get_json(&format!("/repos/{repo}/git/trees/{git_ref}?recursive=1"))
                .await;
            match reply {
                Ok(tree) if !tree.truncated => {
                    let mut paths: Vec<String> = tree
                        .tree
                        .into_iter()
                        .filter(|e| e.kind == "blob")
                        .map(|e| e.path)
                        .filter(|p| !Self::is_skipped(p))
                        .collect();
                    paths.retain(|p| p.matches('/').count() <= max_depth as usize);
                    paths
                }
                Ok(_) | Err(_) => {
                    info!(repo, "tree fetch truncated or failed, traversing contents");
                    let mut out = Vec::new();
                    self.traverse_contents(repo, "", git_ref, max_depth, &mut out)
                        .await?;
                    out
                }
            }
        } else {
            let mut out = Vec::new();
            self.traverse_contents(repo, &scope, git_ref, max_depth, &mut out)
                .await?;
            out
        };
        paths.sort();

        let mut cache = self.structure_cache.lock().await;
        cache.insert(
            cache_key,
            CachedStructure {
                fetched_at: Instant::now(),
                paths: paths.clone(),
            },
        );
        Ok(paths)
    }

    async fn search_code(&self, repo: &str, query: &str) -> AdapterResult<Vec<String>> {
        let reply: SearchReply = self
            .get_json(&format!("/search/code?q={query}+repo:{repo}&per_page=10"))
            .await?;
        Ok(reply.items.into_iter().map(|i| i.path).collect())
    }

    async fn create_or_update_file(
        &self,
        repo: &str,
        path: &str,
        content: &str,
        message: &str,
        branch: &str,
    ) -> AdapterResult<()> {
        let encoded = path.trim_start_matches('/');
        // Need the current sha for updates; absent for creates.
        let existing: AdapterResult<FileContentsReply> = self
            .get_json(&format!("/repos/{repo}/contents/{encoded}?ref={branch}"))
            .await;
        let sha = match existing {
            Ok(reply) => Some(reply.sha),
            Err(AdapterError::NotFound(_)) => None,
            Err(e) => return Err(e),
        };
        let mut body = json!({
            "message": message,
            "content": encode_base64(content.as_bytes()),
            "branch": branch,
        });
        if let Some(sha) = sha {
            body["sha"] = json!(sha);
        }
        let response = self
            .client
            .put(self.url(&format!("/repos/{repo}/contents/{encoded}")))
            .bearer_auth(&self.token)
            .header("Accept", "application/vnd.github+json")
            .json(&body)
            .send()
            .await?;
        let _: serde_json::Value = Self::parse_response(response).await?;
        Ok(())
    }

    async fn create_pr(
        &self,
        repo: &str,
        title: &str,
        body: &str,
        head_branch: &str,
        base_branch: &str,
        changes: &BTreeMap<String, String>,
        draft: bool,
    ) -> AdapterResult<PullRequest> {
        // Branch off the base, push the changed files, open the PR.
        let base_sha = self.branch_sha(repo, base_branch).await?;
        let _: serde_json::Value = self
            .post_json(
                &format!("/repos/{repo}/git/refs"),
                json!({ "ref": format!("refs/heads/{head_branch}"), "sha": base_sha }),
            )
            .await?;

        for (path, content) in changes {
            self.create_or_update_file(
                repo,
                path,
                content,
                &format!("fix: update {path}"),
                head_branch,
            )
            .await?;
        }

        let reply: PrReply = self
            .post_json(
                &format!("/repos/{repo}/pulls"),
                json!({
                    "title": title,
                    "body": body,
                    "head": head_branch,
                    "base": base_branch,
                    "draft": draft,
                }),
            )
            .await?;
        info!(repo, number = reply.number, "pull request created");
        Ok(PullRequest {
            number: reply.number,
            url: reply.html_url,
            head_branch: head_branch.to_string(),
            base_branch: base_branch.to_string(),
        })
    }

    async fn get_pr_details(&self, repo: &str, number: u64) -> AdapterResult<PullRequestDetails> {
        let reply: PrDetailsReply = self
            .get_json(&format!("/repos/{repo}/pulls/{number}"))
            .await?;
        Ok(PullRequestDetails {
            number: reply.number,
            title: reply.title,
            state: reply.state,
            author: reply.user.login,
            url: reply.html_url,
        })
    }

    async fn comment_on_pr(&self, repo: &str, number: u64, body: &str) -> AdapterResult<()> {
        let _: serde_json::Value = self
            .post_json(
                &format!("/repos/{repo}/issues/{number}/comments"),
                json!({ "body": body }),
            )
            .await?;
        Ok(())
    }

    async fn request_pr_changes(&self, repo: &str, number: u64, body: &str) -> AdapterResult<()> {
        let _: serde_json::Value = self
            .post_json(
                &format!("/repos/{repo}/pulls/{number}/reviews"),
                json!({ "event": "REQUEST_CHANGES", "body": body }),
            )
            .await?;
        Ok(())
    }

    async fn approve_pr(&self, repo: &str, number: u64) -> AdapterResult<()> {
        let _: serde_json::Value = self
            .post_json(
                &format!("/repos/{repo}/pulls/{number}/reviews"),
                json!({ "event": "APPROVE" }),
            )
            .await?;
        Ok(())
    }

    async fn list_prs_by_author(
        &self,
        repo: &str,
        author: &str,
    ) -> AdapterResult<Vec<PullRequestDetails>> {
        let replies: Vec<PrDetailsReply> = self
            .get_json(&format!("/repos/{repo}/pulls?state=open&per_page=50"))
            .await?;
        Ok(replies
            .into_iter()
            .filter(|r| r.user.login == author)
            .map(|r| PullRequestDetails {
                number: r.number,
                title: r.title,
                state: r.state,
                author: r.user.login,
                url: r.html_url,
            })
            .collect())
    }
}

fn encode_base64(bytes: &[u8]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base64_round_trips() {
        for input in ["", "a", "ab", "abc", "hello healops!", "línea con acentos"] {
            let encoded = encode_base64(input.as_bytes());
            let decoded = decode_base64(&encoded).unwrap();
            assert_eq!(String::from_utf8(decoded).unwrap(), input);
        }
    }

    #[test]
    fn base64_decodes_wrapped_github_payloads() {
        let encoded = "aGVsbG8g\nd29ybGQ=\n";
        assert_eq!(
            String::from_utf8(decode_base64(encoded).unwrap()).unwrap(),
            "hello world"
        );
    }

    #[test]
    fn skip_list_filters_dependency_trees() {
        assert!(GithubAdapter::is_skipped("node_modules/lodash/index.js"));
        assert!(GithubAdapter::is_skipped("apps/web/.next/server/page.js"));
        assert!(GithubAdapter::is_skipped("target/debug/build.rs"));
        assert!(!GithubAdapter::is_skipped("src/targets/list.rs"));
    }
}
