//! Linear ticket-host adapter.
//!
//! GraphQL over HTTPS with OAuth 2.0 access + refresh tokens. The access
//! token is refreshed automatically five minutes before expiry, behind a
//! mutex so concurrent callers refresh once.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::info;

use super::{AdapterError, AdapterResult, TicketHost, TicketIssue};
use pipeline::reducer::{TicketCreator, TicketIdentity};

/// Refresh the access token this long before it expires.
const REFRESH_MARGIN: Duration = Duration::from_secs(300);

/// OAuth token state.
#[derive(Debug, Clone)]
pub struct OauthTokens {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Deserialize)]
struct TokenReply {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

/// Assignees whose issues count as bot-owned and therefore resolvable.
const BOT_ASSIGNEE_MARKERS: [&str; 3] = ["healops", "bot", "agent"];

/// Linear GraphQL adapter.
pub struct LinearAdapter {
    client: reqwest::Client,
    api_url: String,
    token_url: String,
    client_id: String,
    client_secret: String,
    tokens: Mutex<OauthTokens>,
}

impl LinearAdapter {
    pub fn new(
        tokens: OauthTokens,
        client_id: &str,
        client_secret: &str,
        timeout: Duration,
    ) -> AdapterResult<Self> {
        Self::with_urls(
            tokens,
            client_id,
            client_secret,
            timeout,
            "https://api.linear.app/graphql",
            "https://api.linear.app/oauth/token",
        )
    }

    /// Test hook: point at stub endpoints.
    pub fn with_urls(
        tokens: OauthTokens,
        client_id: &str,
        client_secret: &str,
        timeout: Duration,
        api_url: &str,
        token_url: &str,
    ) -> AdapterResult<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            api_url: api_url.to_string(),
            token_url: token_url.to_string(),
            client_id: client_id.to_string(),
            client_secret: client_secret.to_string(),
            tokens: Mutex::new(tokens),
        })
    }

    /// Current access token, refreshing when within the expiry margin.
    async fn access_token(&self) -> AdapterResult<String> {
        let mut tokens = self.tokens.lock().await;
        let margin = chrono::Duration::from_std(REFRESH_MARGIN)
            .unwrap_or_else(|_| chrono::Duration::seconds(300));
        if Utc::now() + margin < tokens.expires_at {
            return Ok(tokens.access_token.clone());
        }
        info!("linear access token near expiry, refreshing");
        let response = self
            .client
            .post(&self.token_url)
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", tokens.refresh_token.as_str()),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
            ])
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response.text().await.unwrap_or_default();
            return Err(AdapterError::Auth(format!(
                "token refresh failed ({status}): {}",
                message.chars().take(200).collect::<String>()
            )));
        }
        let reply: TokenReply = response.json().await?;
        tokens.access_token = reply.access_token.clone();
        if let Some(refresh) = reply.refresh_token {
            tokens.refresh_token = refresh;
        }
        let lifetime = reply.expires_in.unwrap_or(3600);
        tokens.expires_at = Utc::now() + chrono::Duration::seconds(lifetime);
        Ok(reply.access_token)
    }

    async fn graphql(&self, query: &str, variables: Value) -> AdapterResult<Value> {
        let token = self.access_token().await?;
        let response = self
            .client
            .post(&self.api_url)
            .header("Authorization", token)
            .json(&json!({ "query": query, "variables": variables }))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(AdapterError::Provider {
                status: status.as_u16(),
                message: message.chars().take(200).collect(),
            });
        }
        let body: Value = response.json().await?;
        if let Some(errors) = body.get("errors").and_then(Value::as_array) {
            if !errors.is_empty() {
                return Err(AdapterError::Provider {
                    status: 200,
                    message: errors[0]
                        .get("message")
                        .and_then(Value::as_str)
                        .unwrap_or("graphql error")
                        .to_string(),
                });
            }
        }
        Ok(body["data"].clone())
    }

    fn issue_from_node(node: &Value) -> TicketIssue {
        TicketIssue {
            id: node["id"].as_str().unwrap_or_default().to_string(),
            identifier: node["identifier"].as_str().unwrap_or_default().to_string(),
            title: node["title"].as_str().unwrap_or_default().to_string(),
            url: node["url"].as_str().unwrap_or_default().to_string(),
            state: node["state"]["name"].as_str().unwrap_or_default().to_string(),
            priority: node["priority"].as_u64().unwrap_or(0) as u8,
            assignee: node["assignee"]["name"].as_str().map(str::to_string),
            labels: node["labels"]["nodes"]
                .as_array()
                .map(|nodes| {
                    nodes
                        .iter()
                        .filter_map(|n| n["name"].as_str().map(str::to_string))
                        .collect()
                })
                .unwrap_or_default(),
        }
    }

    fn assignee_is_bot(issue: &TicketIssue) -> bool {
        issue
            .assignee
            .as_deref()
            .map(|name| {
                let lower = name.to_lowercase();
                BOT_ASSIGNEE_MARKERS.iter().any(|m| lower.contains(m))
            })
            .unwrap_or(false)
    }
}

#[async_trait]
impl TicketHost for LinearAdapter {
    async fn create_issue(
        &self,
        title: &str,
        description: &str,
        team_id: Option<&str>,
        priority: u8,
    ) -> AdapterResult<TicketIssue> {
        let query = "mutation IssueCreate($input: IssueCreateInput!) { \
                     issueCreate(input: $input) { success issue { id identifier title url \
                     priority state { name } assignee { name } labels { nodes { name } } } } }";
        let mut input = json!({
            "title": title,
            "description": description,
            "priority": priority,
        });
        if let Some(team_id) = team_id {
            input["teamId"] = json!(team_id);
        }
        let data = self.graphql(query, json!({ "input": input })).await?;
        let issue_node = &data["issueCreate"]["issue"];
        if issue_node.is_null() {
            return Err(AdapterError::Provider {
                status: 200,
                message: "issueCreate returned no issue".into(),
            });
        }
        info!(identifier = issue_node["identifier"].as_str().unwrap_or(""), "linear issue created");
        Ok(Self::issue_from_node(issue_node))
    }

    async fn get_issue(&self, issue_id: &str) -> AdapterResult<TicketIssue> {
        let query = "query Issue($id: String!) { issue(id: $id) { id identifier title url \
                     priority state { name } assignee { name } labels { nodes { name } } } }";
        let data = self.graphql(query, json!({ "id": issue_id })).await?;
        let node = &data["issue"];
        if node.is_null() {
            return Err(AdapterError::NotFound(issue_id.to_string()));
        }
        Ok(Self::issue_from_node(node))
    }

    async fn update_issue(
        &self,
        issue_id: &str,
        title: Option<&str>,
        description: Option<&str>,
    ) -> AdapterResult<()> {
        let query = "mutation IssueUpdate($id: String!, $input: IssueUpdateInput!) { \
                     issueUpdate(id: $id, input: $input) { success } }";
        let mut input = json!({});
        if let Some(title) = title {
            input["title"] = json!(title);
        }
        if let Some(description) = description {
            input["description"] = json!(description);
        }
        self.graphql(query, json!({ "id": issue_id, "input": input }))
            .await?;
        Ok(())
    }

    async fn update_issue_state(&self, issue_id: &str, state: &str) -> AdapterResult<()> {
        let query = "mutation IssueUpdate($id: String!, $input: IssueUpdateInput!) { \
                     issueUpdate(id: $id, input: $input) { success } }";
        self.graphql(
            query,
            json!({ "id": issue_id, "input": { "stateId": state } }),
        )
        .await?;
        Ok(())
    }

    async fn add_comment_to_issue(&self, issue_id: &str, body: &str) -> AdapterResult<()> {
        let query = "mutation CommentCreate($input: CommentCreateInput!) { \
                     commentCreate(input: $input) { success } }";
        self.graphql(
            query,
            json!({ "input": { "issueId": issue_id, "body": body } }),
        )
        .await?;
        Ok(())
    }

    async fn get_open_resolvable_issues(
        &self,
        team_ids: Option<&[String]>,
        exclude_labels: Option<&[String]>,
        max_priority: Option<u8>,
    ) -> AdapterResult<Vec<TicketIssue>> {
        let query = "query Issues($filter: IssueFilter) { issues(filter: $filter, first: 50) { \
                     nodes { id identifier title url priority state { name } \
                     assignee { name } labels { nodes { name } } } } }";
        let mut filter = json!({ "state": { "type": { "eq": "unstarted" } } });
        if let Some(team_ids) = team_ids {
            filter["team"] = json!({ "id": { "in": team_ids } });
        }
        let data = self.graphql(query, json!({ "filter": filter })).await?;
        let nodes = data["issues"]["nodes"].as_array().cloned().unwrap_or_default();

        let mut issues: Vec<TicketIssue> = nodes.iter().map(Self::issue_from_node).collect();
        issues.retain(Self::assignee_is_bot);
        if let Some(exclude) = exclude_labels {
            issues.retain(|issue| {
                !issue
                    .labels
                    .iter()
                    .any(|label| exclude.iter().any(|e| e.eq_ignore_ascii_case(label)))
            });
        }
        if let Some(max_priority) = max_priority {
            issues.retain(|issue| issue.priority <= max_priority);
        }
        Ok(issues)
    }
}

/// Bridge: the reducer's `TicketCreator` seam over this adapter.
#[async_trait]
impl TicketCreator for LinearAdapter {
    async fn create_ticket(
        &self,
        title: &str,
        description: &str,
        team_id: Option<&str>,
        priority: u8,
    ) -> anyhow::Result<TicketIdentity> {
        let issue = self
            .create_issue(title, description, team_id, priority)
            .await?;
        Ok(TicketIdentity {
            id: issue.id,
            identifier: issue.identifier,
            url: issue.url,
            title: issue.title,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn issue(assignee: Option<&str>, labels: Vec<&str>, priority: u8) -> TicketIssue {
        TicketIssue {
            id: "i".into(),
            identifier: "HEA-1".into(),
            title: "t".into(),
            url: "u".into(),
            state: "Todo".into(),
            priority,
            assignee: assignee.map(str::to_string),
            labels: labels.into_iter().map(str::to_string).collect(),
        }
    }

    #[test]
    fn bot_assignee_detection() {
        assert!(LinearAdapter::assignee_is_bot(&issue(Some("HealOps Agent"), vec![], 1)));
        assert!(LinearAdapter::assignee_is_bot(&issue(Some("fix-bot"), vec![], 1)));
        assert!(!LinearAdapter::assignee_is_bot(&issue(Some("Jordan"), vec![], 1)));
        assert!(!LinearAdapter::assignee_is_bot(&issue(None, vec![], 1)));
    }

    #[test]
    fn issue_parsing_from_graphql_node() {
        let node = json!({
            "id": "abc",
            "identifier": "HEA-12",
            "title": "Crash",
            "url": "https://linear.app/x",
            "priority": 2,
            "state": { "name": "Todo" },
            "assignee": { "name": "healops" },
            "labels": { "nodes": [{ "name": "auto" }, { "name": "backend" }] }
        });
        let issue = LinearAdapter::issue_from_node(&node);
        assert_eq!(issue.identifier, "HEA-12");
        assert_eq!(issue.priority, 2);
        assert_eq!(issue.labels, vec!["auto", "backend"]);
        assert_eq!(issue.state, "Todo");
    }
}
