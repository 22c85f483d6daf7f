use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("import file is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("import file is missing required field '{0}'")]
    MissingField(&'static str),
}

/// Exported chart: `{ title, mermaidCode, exportedAt }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub title: String,
    pub mermaid_code: String,
    pub exported_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawEnvelope {
    title: Option<String>,
    mermaid_code: Option<String>,
    exported_at: Option<DateTime<Utc>>,
}

impl Envelope {
    pub fn new(title: &str, mermaid_code: &str) -> Self {
        Self {
            title: title.to_string(),
            mermaid_code: mermaid_code.to_string(),
            exported_at: Utc::now(),
        }
    }

    pub fn to_json(&self) -> Result<String, EnvelopeError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Reads an export. `exportedAt` is informational and may be absent.
    pub fn from_json(input: &str) -> Result<Self, EnvelopeError> {
        let raw: RawEnvelope = serde_json::from_str(input)?;
        let title = raw.title.ok_or(EnvelopeError::MissingField("title"))?;
        let mermaid_code = raw
            .mermaid_code
            .ok_or(EnvelopeError::MissingField("mermaidCode"))?;
        Ok(Self {
            title,
            mermaid_code,
            exported_at: raw.exported_at.unwrap_or_else(Utc::now),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn export_uses_camel_case_fields() {
        let json = Envelope::new("Flow", "graph TD\n    A\n").to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["title"], "Flow");
        assert_eq!(value["mermaidCode"], "graph TD\n    A\n");
        assert!(value["exportedAt"].is_string());
    }

    #[test]
    fn import_requires_title_and_code() {
        assert!(matches!(
            Envelope::from_json(r#"{"mermaidCode": "graph TD"}"#),
            Err(EnvelopeError::MissingField("title"))
        ));
        assert!(matches!(
            Envelope::from_json(r#"{"title": "x"}"#),
            Err(EnvelopeError::MissingField("mermaidCode"))
        ));
        assert!(matches!(Envelope::from_json("not json"), Err(EnvelopeError::Json(_))));

        let envelope = Envelope::from_json(r#"{"title": "x", "mermaidCode": "graph LR"}"#).unwrap();
        assert_eq!(envelope.mermaid_code, "graph LR");
    }
}
