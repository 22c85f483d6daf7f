//! Generative helpers for naming groups and splitting nodes.
//!
//! The assistant only ever produces the same typed parameters a manual action
//! would (`String` name, [`SplitPlan`]); it never touches diagram text.

use std::future::Future;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Value, json};
use thiserror::Error;

use crate::EdgeKind;
use crate::config::AssistConfig;
use crate::edit::{SplitLink, SplitPart, SplitPlan};
use crate::utils::truncate_chars;

pub const MAX_GROUP_LABELS: usize = 10;
pub const MAX_SPLIT_TEXT_CHARS: usize = 1000;

#[derive(Debug, Error)]
pub enum AssistError {
    #[error("AI assistance is not configured (set GEMINI_API_KEY)")]
    Disabled,
    #[error("nothing to send: {0}")]
    EmptyInput(&'static str),
    #[error("request to the generative API failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("generative API returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("reply was cut short (finish reason {0})")]
    Truncated(String),
    #[error("reply could not be understood: {0}")]
    Malformed(String),
    #[error("the assistant could not find a sensible split for this node")]
    CannotSplit,
}

/// Labels of the nodes around the one being split.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitContext {
    #[serde(default)]
    pub incoming: Vec<String>,
    #[serde(default)]
    pub outgoing: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuggestedSplit {
    pub name: String,
    #[serde(default)]
    pub sequence_order: i64,
    #[serde(default)]
    pub receives_input: Option<bool>,
    #[serde(default)]
    pub provides_output: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuggestedLink {
    pub from_index: usize,
    pub to_index: usize,
    #[serde(default, deserialize_with = "lenient_kind")]
    pub kind: EdgeKind,
}

/// Reply to a split request, as the model returns it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SplitSuggestion {
    pub can_split: bool,
    #[serde(default)]
    pub splits: Vec<SuggestedSplit>,
    #[serde(default)]
    pub internal_connections: Option<Vec<SuggestedLink>>,
}

impl SplitSuggestion {
    /// Orders the parts by `sequenceOrder`. Link indices point into the reply's
    /// `splits` array and are remapped to the new order.
    pub fn into_plan(self) -> Result<SplitPlan, AssistError> {
        if !self.can_split || self.splits.is_empty() {
            return Err(AssistError::CannotSplit);
        }

        let count = self.splits.len();
        let mut order: Vec<usize> = (0..count).collect();
        order.sort_by_key(|&idx| self.splits[idx].sequence_order);
        let mut position = vec![0; count];
        for (new_idx, &old_idx) in order.iter().enumerate() {
            position[old_idx] = new_idx;
        }

        let links = match self.internal_connections {
            Some(links) if !links.is_empty() => {
                let mut mapped = Vec::with_capacity(links.len());
                for link in links {
                    if link.from_index >= count || link.to_index >= count {
                        return Err(AssistError::Malformed(format!(
                            "connection {} -> {} refers to a missing split",
                            link.from_index, link.to_index
                        )));
                    }
                    mapped.push(SplitLink {
                        from_index: position[link.from_index],
                        to_index: position[link.to_index],
                        kind: link.kind,
                    });
                }
                Some(mapped)
            }
            _ => None,
        };

        let parts = order
            .into_iter()
            .map(|idx| {
                let split = &self.splits[idx];
                SplitPart {
                    name: split.name.trim().to_string(),
                    receives_input: split.receives_input.unwrap_or(false),
                    provides_output: split.provides_output.unwrap_or(false),
                }
            })
            .collect();

        Ok(SplitPlan { parts, links })
    }
}

fn lenient_kind<'de, D>(deserializer: D) -> Result<EdgeKind, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    Ok(raw
        .and_then(|value| value.parse().ok())
        .unwrap_or_default())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GroupNameReply {
    group_name: String,
}

pub trait Assistant {
    fn request_group_name(
        &self,
        labels: &[String],
    ) -> impl Future<Output = Result<String, AssistError>> + Send;

    fn request_node_split(
        &self,
        node_text: &str,
        context: &SplitContext,
    ) -> impl Future<Output = Result<SplitSuggestion, AssistError>> + Send;
}

pub fn group_name_prompt(labels: &[String]) -> Result<String, AssistError> {
    let labels: Vec<&str> = labels
        .iter()
        .map(|label| label.trim())
        .filter(|label| !label.is_empty())
        .take(MAX_GROUP_LABELS)
        .collect();
    if labels.is_empty() {
        return Err(AssistError::EmptyInput("no node labels"));
    }

    Ok(format!(
        "You name groups of steps in a flowchart.\n\
         Suggest one short name (at most 20 characters) that summarises these steps, \
         in the same language as the steps.\n\
         Steps:\n{}\n\n\
         Respond with JSON only: {{\"groupName\": \"<name>\"}}",
        labels
            .iter()
            .map(|label| format!("- {label}"))
            .collect::<Vec<_>>()
            .join("\n")
    ))
}

pub fn split_prompt(node_text: &str, context: &SplitContext) -> Result<String, AssistError> {
    let text = truncate_chars(node_text.trim(), MAX_SPLIT_TEXT_CHARS);
    if text.is_empty() {
        return Err(AssistError::EmptyInput("node text is empty"));
    }

    let describe = |labels: &[String]| {
        if labels.is_empty() {
            "(none)".to_string()
        } else {
            labels
                .iter()
                .take(MAX_GROUP_LABELS)
                .map(|label| truncate_chars(label, 100))
                .collect::<Vec<_>>()
                .join(", ")
        }
    };

    Ok(format!(
        "You refine flowcharts. Decide whether the step below bundles several actions \
         and, if so, split it into 2 to 5 smaller sequential steps.\n\
         Step: {text}\n\
         Preceding steps: {}\n\
         Following steps: {}\n\n\
         Respond with JSON only, in this shape:\n\
         {{\"canSplit\": true, \"splits\": [{{\"name\": \"...\", \"sequenceOrder\": 1, \
         \"receivesInput\": true, \"providesOutput\": false}}], \
         \"internalConnections\": [{{\"fromIndex\": 0, \"toIndex\": 1, \"kind\": \"plain\"}}]}}\n\
         Use \"kind\": \"conditional\" for branches. Omit internalConnections for a simple sequence. \
         Use {{\"canSplit\": false}} when the step is already atomic.",
        describe(&context.incoming),
        describe(&context.outgoing),
    ))
}

/// Pulls the candidate text out of a `generateContent` reply.
pub fn extract_reply_text(body: &Value) -> Result<String, AssistError> {
    let candidate = body
        .get("candidates")
        .and_then(|c| c.get(0))
        .ok_or_else(|| AssistError::Malformed("reply has no candidates".to_string()))?;

    if let Some(reason) = candidate.get("finishReason").and_then(|r| r.as_str()) {
        if reason != "STOP" {
            return Err(AssistError::Truncated(reason.to_string()));
        }
    }

    candidate
        .get("content")
        .and_then(|c| c.get("parts"))
        .and_then(|p| p.get(0))
        .and_then(|p| p.get("text"))
        .and_then(|t| t.as_str())
        .map(str::to_string)
        .ok_or_else(|| AssistError::Malformed("candidate has no text part".to_string()))
}

fn strip_fences(text: &str) -> &str {
    text.trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim()
}

pub fn parse_group_name(text: &str) -> Result<String, AssistError> {
    let reply: GroupNameReply = serde_json::from_str(strip_fences(text))
        .map_err(|err| AssistError::Malformed(err.to_string()))?;
    let name = reply.group_name.trim();
    if name.is_empty() {
        return Err(AssistError::Malformed("group name is empty".to_string()));
    }
    Ok(name.to_string())
}

pub fn parse_split(text: &str) -> Result<SplitSuggestion, AssistError> {
    serde_json::from_str(strip_fences(text)).map_err(|err| AssistError::Malformed(err.to_string()))
}

/// Talks to Google's `generateContent` endpoint.
#[derive(Debug, Clone)]
pub struct GeminiAssistant {
    client: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl GeminiAssistant {
    pub fn new(config: &AssistConfig) -> Result<Self, AssistError> {
        let api_key = config.api_key.clone().ok_or(AssistError::Disabled)?;
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()?;
        Ok(Self {
            client,
            api_key,
            model: config.model.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    async fn generate(&self, prompt: String) -> Result<String, AssistError> {
        let url = format!("{}/models/{}:generateContent", self.base_url, self.model);
        let request_body = json!({
            "contents": [{
                "parts": [{"text": prompt}]
            }],
            "generationConfig": {
                "responseMimeType": "application/json"
            }
        });

        let response = self
            .client
            .post(&url)
            .query(&[("key", self.api_key.as_str())])
            .json(&request_body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(status, "generative API request failed");
            return Err(AssistError::Status { status, body });
        }

        let body: Value = response.json().await?;
        extract_reply_text(&body)
    }
}

impl Assistant for GeminiAssistant {
    async fn request_group_name(&self, labels: &[String]) -> Result<String, AssistError> {
        let prompt = group_name_prompt(labels)?;
        let text = self.generate(prompt).await?;
        parse_group_name(&text)
    }

    async fn request_node_split(
        &self,
        node_text: &str,
        context: &SplitContext,
    ) -> Result<SplitSuggestion, AssistError> {
        let prompt = split_prompt(node_text, context)?;
        let text = self.generate(prompt).await?;
        parse_split(&text)
    }
}
