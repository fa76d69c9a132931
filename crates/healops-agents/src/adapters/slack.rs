//! Slack chat adapter: message posting, request verification, and mention
//! routing.
//!
//! Event payloads are verified with HMAC-SHA-256 against a configured set
//! of signing secrets; requests older than 300 seconds are rejected.
//! URL-verification challenges are answered before any signature check.
//! Mention resolution scores candidate agents and deliberately refuses to
//! fall back to a default agent when an explicit mention matched nobody.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{AdapterError, AdapterResult, ChatHost};

type HmacSha256 = Hmac<Sha256>;

/// Max age of an acceptable request timestamp.
const MAX_TIMESTAMP_AGE_SECS: i64 = 300;
/// TTL for the dedup caches.
const DEDUP_TTL: Duration = Duration::from_secs(600);

/// Verify a request signature (`v0=<hex>`) against any of the configured
/// signing secrets. Rejects stale timestamps before any crypto.
pub fn verify_signature(
    secrets: &[String],
    timestamp: &str,
    body: &str,
    signature: &str,
    now_epoch: i64,
) -> bool {
    let Ok(ts) = timestamp.parse::<i64>() else {
        return false;
    };
    if (now_epoch - ts).abs() > MAX_TIMESTAMP_AGE_SECS {
        warn!(timestamp, "rejecting stale chat request");
        return false;
    }
    let Some(provided_hex) = signature.strip_prefix("v0=") else {
        return false;
    };
    let Ok(provided) = hex::decode(provided_hex) else {
        return false;
    };
    let base = format!("v0:{timestamp}:{body}");
    for secret in secrets {
        let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
            continue;
        };
        mac.update(base.as_bytes());
        if mac.verify_slice(&provided).is_ok() {
            return true;
        }
    }
    false
}

/// Answer a `url_verification` challenge payload, if that's what this is.
/// Must run before signature verification.
pub fn answer_url_verification(payload: &Value) -> Option<Value> {
    if payload.get("type").and_then(Value::as_str) == Some("url_verification") {
        let challenge = payload.get("challenge").and_then(Value::as_str)?;
        return Some(json!({ "challenge": challenge }));
    }
    None
}

/// A routable agent profile for mention matching.
#[derive(Debug, Clone)]
pub struct AgentProfile {
    pub user_id: String,
    pub display_name: String,
    pub full_name: String,
    pub nicknames: Vec<String>,
    pub role_keywords: Vec<String>,
}

/// Score-based mention resolution:
/// exact user-id match wins outright, then display-name match, then a
/// keyword score (full name 100, nickname 60, first name 50, role keyword
/// 10 to 20). Explicit-but-unmatched mentions return `None`, never a default.
pub fn match_mention<'a>(
    agents: &'a [AgentProfile],
    mentioned_user_ids: &[String],
    text: &str,
) -> Option<&'a AgentProfile> {
    for id in mentioned_user_ids {
        if let Some(agent) = agents.iter().find(|a| &a.user_id == id) {
            return Some(agent);
        }
    }
    let lower = text.to_lowercase();
    if let Some(agent) = agents
        .iter()
        .find(|a| !a.display_name.is_empty() && lower.contains(&a.display_name.to_lowercase()))
    {
        return Some(agent);
    }

    let mut best: Option<(&AgentProfile, u32)> = None;
    for agent in agents {
        let mut score = 0u32;
        if !agent.full_name.is_empty() && lower.contains(&agent.full_name.to_lowercase()) {
            score += 100;
        }
        for nickname in &agent.nicknames {
            if lower.contains(&nickname.to_lowercase()) {
                score += 60;
            }
        }
        if let Some(first) = agent.full_name.split_whitespace().next() {
            if !first.is_empty() && lower.contains(&first.to_lowercase()) {
                score += 50;
            }
        }
        for (i, keyword) in agent.role_keywords.iter().enumerate() {
            if lower.contains(&keyword.to_lowercase()) {
                // Earlier keywords weigh more, 20 down to 10.
                score += 20u32.saturating_sub((i as u32).min(10));
            }
        }
        if score > 0 && best.map(|(_, s)| score > s).unwrap_or(true) {
            best = Some((agent, score));
        }
    }

    match best {
        Some((agent, _)) => Some(agent),
        None if !mentioned_user_ids.is_empty() => {
            // Mentions were present but matched nobody: do not guess.
            None
        }
        None => None,
    }
}

/// Bounded TTL cache for dedup (recently posted messages, recently
/// responded threads). Eviction is lazy, on access.
pub struct TtlCache {
    entries: Mutex<HashMap<String, Instant>>,
    ttl: Duration,
    max_entries: usize,
}

impl TtlCache {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
            max_entries,
        }
    }

    /// Record a key; returns `false` when it was already present (a
    /// duplicate within the TTL).
    pub async fn insert(&self, key: &str) -> bool {
        self.insert_at(key, Instant::now()).await
    }

    /// Test hook: insert with an explicit clock.
    pub async fn insert_at(&self, key: &str, now: Instant) -> bool {
        let mut entries = self.entries.lock().await;
        entries.retain(|_, inserted| now.duration_since(*inserted) < self.ttl);
        if entries.contains_key(key) {
            return false;
        }
        if entries.len() >= self.max_entries {
            // Drop the oldest entry to stay bounded.
            if let Some(oldest) = entries
                .iter()
                .min_by_key(|(_, at)| **at)
                .map(|(k, _)| k.clone())
            {
                entries.remove(&oldest);
            }
        }
        entries.insert(key.to_string(), now);
        true
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}

/// Conversation context kept per thread so follow-up questions land in the
/// same incident discussion.
#[derive(Debug, Clone, Default)]
pub struct ThreadContext {
    pub incident_id: Option<i64>,
    pub last_user_message: String,
}

/// Slack Web API adapter.
pub struct SlackAdapter {
    client: reqwest::Client,
    base_url: String,
    bot_token: String,
    thread_contexts: Mutex<HashMap<String, ThreadContext>>,
    posted_dedup: TtlCache,
}

impl SlackAdapter {
    pub fn new(bot_token: &str, timeout: Duration) -> AdapterResult<Self> {
        Self::with_base_url(bot_token, timeout, "https://slack.com/api")
    }

    pub fn with_base_url(bot_token: &str, timeout: Duration, base_url: &str) -> AdapterResult<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            bot_token: bot_token.to_string(),
            thread_contexts: Mutex::new(HashMap::new()),
            posted_dedup: TtlCache::new(DEDUP_TTL, 500),
        })
    }

    async fn call(&self, method: &str, body: Value) -> AdapterResult<Value> {
        let response = self
            .client
            .post(format!("{}/{method}", self.base_url))
            .bearer_auth(&self.bot_token)
            .json(&body)
            .send()
            .await?;
        let parsed: Value = response.json().await?;
        if parsed.get("ok").and_then(Value::as_bool) != Some(true) {
            let error = parsed
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("unknown_error");
            return Err(AdapterError::Provider {
                status: 200,
                message: format!("{method}: {error}"),
            });
        }
        Ok(parsed)
    }

    pub async fn store_thread_context(&self, thread_ts: &str, context: ThreadContext) {
        self.thread_contexts
            .lock()
            .await
            .insert(thread_ts.to_string(), context);
    }

    pub async fn thread_context(&self, thread_ts: &str) -> Option<ThreadContext> {
        self.thread_contexts.lock().await.get(thread_ts).cloned()
    }
}

#[async_trait]
impl ChatHost for SlackAdapter {
    async fn post_message(
        &self,
        channel: &str,
        text: &str,
        thread_ts: Option<&str>,
    ) -> AdapterResult<String> {
        // Duplicate suppression keyed by channel + content hash.
        let dedup_key = format!("{channel}:{}", hex::encode(Sha256::digest(text.as_bytes())));
        if !self.posted_dedup.insert(&dedup_key).await {
            debug!(channel, "suppressing duplicate chat message");
            return Ok(String::new());
        }
        let mut body = json!({ "channel": channel, "text": text });
        if let Some(thread_ts) = thread_ts {
            body["thread_ts"] = json!(thread_ts);
        }
        let reply = self.call("chat.postMessage", body).await?;
        Ok(reply["ts"].as_str().unwrap_or_default().to_string())
    }

    async fn post_thinking_indicator(
        &self,
        channel: &str,
        thread_ts: Option<&str>,
    ) -> AdapterResult<String> {
        let mut body = json!({ "channel": channel, "text": "_thinking..._" });
        if let Some(thread_ts) = thread_ts {
            body["thread_ts"] = json!(thread_ts);
        }
        let reply = self.call("chat.postMessage", body).await?;
        Ok(reply["ts"].as_str().unwrap_or_default().to_string())
    }

    async fn delete_message(&self, channel: &str, ts: &str) -> AdapterResult<()> {
        self.call("chat.delete", json!({ "channel": channel, "ts": ts }))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sign(secret: &str, timestamp: &str, body: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(format!("v0:{timestamp}:{body}").as_bytes());
        format!("v0={}", hex::encode(mac.finalize().into_bytes()))
    }

    #[test]
    fn valid_signature_verifies_against_any_secret() {
        let secrets = vec!["old-secret".to_string(), "new-secret".to_string()];
        let body = r#"{"type":"event_callback"}"#;
        let ts = "1700000000";
        let sig = sign("new-secret", ts, body);
        assert!(verify_signature(&secrets, ts, body, &sig, 1_700_000_010));
    }

    #[test]
    fn wrong_secret_and_stale_timestamp_fail() {
        let secrets = vec!["right".to_string()];
        let body = "{}";
        let ts = "1700000000";
        let bad = sign("wrong", ts, body);
        assert!(!verify_signature(&secrets, ts, body, &bad, 1_700_000_010));

        let good = sign("right", ts, body);
        // 301 seconds later: stale.
        assert!(!verify_signature(&secrets, ts, body, &good, 1_700_000_301));
        assert!(verify_signature(&secrets, ts, body, &good, 1_700_000_299));
    }

    #[test]
    fn url_verification_is_answered_before_signature() {
        let payload = json!({"type": "url_verification", "challenge": "abc123"});
        let answer = answer_url_verification(&payload).unwrap();
        assert_eq!(answer["challenge"], "abc123");
        assert!(answer_url_verification(&json!({"type": "event_callback"})).is_none());
    }

    fn agents() -> Vec<AgentProfile> {
        vec![
            AgentProfile {
                user_id: "U111".into(),
                display_name: "healops".into(),
                full_name: "HealOps Fixer".into(),
                nicknames: vec!["fixer".into()],
                role_keywords: vec!["incident".into(), "fix".into()],
            },
            AgentProfile {
                user_id: "U222".into(),
                display_name: "oncall-helper".into(),
                full_name: "Oncall Helper".into(),
                nicknames: vec![],
                role_keywords: vec!["oncall".into(), "pager".into()],
            },
        ]
    }

    #[test]
    fn exact_user_id_wins() {
        let agents = agents();
        let found = match_mention(&agents, &["U222".to_string()], "hey whoever").unwrap();
        assert_eq!(found.user_id, "U222");
    }

    #[test]
    fn display_name_then_keyword_scoring() {
        let agents = agents();
        let by_display = match_mention(&agents, &[], "ping oncall-helper please").unwrap();
        assert_eq!(by_display.user_id, "U222");

        let by_nickname = match_mention(&agents, &[], "can the fixer take a look?").unwrap();
        assert_eq!(by_nickname.user_id, "U111");

        let by_keyword = match_mention(&agents, &[], "who's on the pager rotation?").unwrap();
        assert_eq!(by_keyword.user_id, "U222");
    }

    #[test]
    fn unmatched_explicit_mention_has_no_fallback() {
        let agents = agents();
        assert!(match_mention(&agents, &["U999".to_string()], "hello").is_none());
    }

    #[tokio::test]
    async fn ttl_cache_dedups_within_ttl_and_stays_bounded() {
        let cache = TtlCache::new(Duration::from_secs(60), 2);
        assert!(cache.insert("a").await);
        assert!(!cache.insert("a").await);
        assert!(cache.insert("b").await);
        assert!(cache.insert("c").await);
        assert!(cache.len().await <= 2);
    }

    #[tokio::test]
    async fn ttl_cache_expires_entries() {
        let cache = TtlCache::new(Duration::from_millis(10), 10);
        let t0 = Instant::now();
        assert!(cache.insert_at("a", t0).await);
        // Fast-forward past the TTL via the explicit clock.
        let later = t0 + Duration::from_millis(50);
        assert!(cache.insert_at("a", later).await);
    }
}
