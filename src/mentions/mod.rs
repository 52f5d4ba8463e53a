//! Mention extraction and the AI-enrichment collaborator boundary.
//!
//! Mention tokens are `@` followed by alphanumerics, hyphens or underscores.
//! The dispatcher is best-effort: a failed or slow enrichment call is logged
//! by the pipeline and never blocks delivery.

use crate::model::Message;
use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::OnceLock;
use std::time::Duration;

fn mention_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"@([A-Za-z0-9_-]+)").expect("static mention pattern"))
}

/// Scan content for mention tokens, returning the mentioned ids (without the
/// `@` prefix) in first-occurrence order, deduplicated.
pub fn extract_mentions(content: &str) -> Vec<String> {
    let mut mentions: Vec<String> = Vec::new();
    for capture in mention_pattern().captures_iter(content) {
        let id = &capture[1];
        if !mentions.iter().any(|m| m == id) {
            mentions.push(id.to_string());
        }
    }
    mentions
}

/// Enrichment returned by the mention collaborator; merged into the message
/// metadata on success.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EnrichedMetadata {
    pub ai_context: BTreeMap<String, serde_json::Value>,
    pub formatting: BTreeMap<String, String>,
}

/// Boundary to the external AI/mention processor.
#[async_trait]
pub trait MentionDispatcher: Send + Sync {
    async fn process(&self, message: &Message) -> anyhow::Result<EnrichedMetadata>;
}

/// HTTP adapter posting the message to the collaborator service.
pub struct HttpMentionDispatcher {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpMentionDispatcher {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }
}

#[async_trait]
impl MentionDispatcher for HttpMentionDispatcher {
    async fn process(&self, message: &Message) -> anyhow::Result<EnrichedMetadata> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(message)
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json::<EnrichedMetadata>().await?)
    }
}

/// Dispatcher used when no collaborator endpoint is configured.
pub struct NoopMentionDispatcher;

#[async_trait]
impl MentionDispatcher for NoopMentionDispatcher {
    async fn process(&self, _message: &Message) -> anyhow::Result<EnrichedMetadata> {
        Ok(EnrichedMetadata::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::MessageMetadata;
    use chrono::Utc;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn extracts_ordered_unique_mentions() {
        assert_eq!(
            extract_mentions("@foodie best pasta? cc @planner and @foodie"),
            vec!["foodie", "planner"]
        );
    }

    #[test]
    fn mention_token_charset() {
        assert_eq!(
            extract_mentions("hey @agent-2, @under_score! not an email a@b"),
            vec!["agent-2", "under_score", "b"]
        );
        assert!(extract_mentions("no mentions here").is_empty());
        assert!(extract_mentions("@ alone does not count").is_empty());
    }

    fn sample_message() -> Message {
        Message {
            id: "m1".into(),
            chat_id: "c1".into(),
            sender_id: "u1".into(),
            content: "@foodie best pasta?".into(),
            thread_id: None,
            created_at: Utc::now(),
            metadata: MessageMetadata::default(),
        }
    }

    #[tokio::test]
    async fn http_dispatcher_decodes_enrichment() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/process"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "aiContext": {"model": "foodie-v2", "confidence": 0.87},
                "formatting": {"style": "card"}
            })))
            .mount(&server)
            .await;

        let dispatcher = HttpMentionDispatcher::new(
            format!("{}/process", server.uri()),
            Duration::from_secs(2),
        )
        .unwrap();
        let enriched = dispatcher.process(&sample_message()).await.unwrap();
        assert_eq!(
            enriched.ai_context.get("model"),
            Some(&serde_json::json!("foodie-v2"))
        );
        assert_eq!(enriched.formatting.get("style").map(String::as_str), Some("card"));
    }

    #[tokio::test]
    async fn http_dispatcher_surfaces_server_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let dispatcher =
            HttpMentionDispatcher::new(server.uri(), Duration::from_secs(2)).unwrap();
        assert!(dispatcher.process(&sample_message()).await.is_err());
    }
}
