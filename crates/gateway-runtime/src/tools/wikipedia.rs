//! Wikipedia Tool
//!
//! Article summaries through the Wikipedia REST API, with an opensearch
//! fallback that suggests close titles when the exact page is missing.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

use gateway_core::{
    error::Result,
    tool::{ParameterSchema, Tool, ToolCall, ToolResult, ToolSchema},
};

use super::{http_client, str_arg};

const SUMMARY_URL: &str = "https://en.wikipedia.org/api/rest_v1/page/summary";
const OPENSEARCH_URL: &str = "https://en.wikipedia.org/w/api.php";

#[derive(Deserialize)]
struct PageSummary {
    #[serde(default)]
    title: String,
    #[serde(default)]
    extract: String,
}

/// `wikipedia_lookup` tool
pub struct WikipediaTool {
    http: reqwest::Client,
}

impl WikipediaTool {
    pub fn new() -> Result<Self> {
        Ok(Self {
            http: http_client(Duration::from_secs(10))?,
        })
    }

    async fn summary(&self, title: &str) -> std::result::Result<Option<PageSummary>, String> {
        let encoded = title.replace(' ', "_");
        let response = self
            .http
            .get(format!("{SUMMARY_URL}/{encoded}"))
            .query(&[("redirect", "true")])
            .send()
            .await
            .map_err(|e| format!("Error accessing Wikipedia: {e}"))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let summary: PageSummary = response
            .error_for_status()
            .map_err(|e| format!("Error accessing Wikipedia: {e}"))?
            .json()
            .await
            .map_err(|e| format!("Error parsing Wikipedia response: {e}"))?;

        if summary.extract.is_empty() {
            Ok(None)
        } else {
            Ok(Some(summary))
        }
    }

    /// Close-title suggestions for a missing page
    async fn suggest(&self, title: &str) -> std::result::Result<Vec<String>, String> {
        // opensearch returns [query, [titles], [descriptions], [urls]]
        let raw: serde_json::Value = self
            .http
            .get(OPENSEARCH_URL)
            .query(&[
                ("action", "opensearch"),
                ("search", title),
                ("limit", "5"),
                ("format", "json"),
            ])
            .send()
            .await
            .map_err(|e| format!("Error accessing Wikipedia: {e}"))?
            .json()
            .await
            .map_err(|e| format!("Error parsing Wikipedia response: {e}"))?;

        Ok(raw
            .get(1)
            .and_then(serde_json::Value::as_array)
            .map(|titles| {
                titles
                    .iter()
                    .filter_map(|t| t.as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[async_trait]
impl Tool for WikipediaTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "wikipedia_lookup".into(),
            description: "Get a Wikipedia article summary for a topic".into(),
            parameters: vec![ParameterSchema {
                name: "title".into(),
                param_type: "string".into(),
                description: "Article title, e.g. 'Alan Turing'".into(),
                required: true,
                default: None,
            }],
            timeout: Duration::from_secs(15),
            has_side_effects: false,
        }
    }

    async fn execute(&self, call: &ToolCall) -> Result<ToolResult> {
        let Some(title) = str_arg(call, "title") else {
            return Ok(ToolResult::failure(
                "wikipedia_lookup",
                "Please provide an article title.",
            ));
        };

        match self.summary(title).await {
            Ok(Some(summary)) => Ok(ToolResult::success(
                "wikipedia_lookup",
                format!("{}\n\n{}", summary.title, summary.extract),
            )),
            Ok(None) => match self.suggest(title).await {
                Ok(options) if !options.is_empty() => Ok(ToolResult::success(
                    "wikipedia_lookup",
                    format!(
                        "Multiple articles found for '{title}'. Did you mean: {}",
                        options.join(", ")
                    ),
                )),
                _ => Ok(ToolResult::failure(
                    "wikipedia_lookup",
                    format!(
                        "No Wikipedia article found for '{title}'. Please check spelling or \
                         try a different search term."
                    ),
                )),
            },
            Err(msg) => Ok(ToolResult::failure("wikipedia_lookup", msg)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_parsing() {
        let raw = r#"{"title": "Alan Turing", "extract": "English mathematician."}"#;
        let summary: PageSummary = serde_json::from_str(raw).unwrap();
        assert_eq!(summary.title, "Alan Turing");
        assert!(!summary.extract.is_empty());
    }

    #[tokio::test]
    async fn test_missing_title_is_a_failed_result() {
        let tool = WikipediaTool::new().unwrap();
        let call = ToolCall {
            name: "wikipedia_lookup".into(),
            arguments: Default::default(),
            id: None,
        };
        let result = tool.execute(&call).await.unwrap();
        assert!(!result.success);
    }
}
