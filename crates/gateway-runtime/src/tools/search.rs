//! Search Tools
//!
//! Web search and news headlines through the DuckDuckGo instant-answer
//! API. Keyless, best-effort: thin topics produce fewer results.

use async_trait::async_trait;
use serde::Deserialize;
use std::fmt::Write as _;
use std::time::Duration;

use gateway_core::{
    error::Result,
    tool::{ParameterSchema, Tool, ToolCall, ToolResult, ToolSchema},
};

use super::{http_client, str_arg};

const SEARCH_URL: &str = "https://api.duckduckgo.com/";
const MAX_RESULTS_CAP: usize = 10;

#[derive(Deserialize)]
struct InstantAnswer {
    #[serde(rename = "Heading", default)]
    heading: String,
    #[serde(rename = "AbstractText", default)]
    abstract_text: String,
    #[serde(rename = "AbstractURL", default)]
    abstract_url: String,
    #[serde(rename = "RelatedTopics", default)]
    related_topics: Vec<RelatedTopic>,
}

#[derive(Deserialize)]
struct RelatedTopic {
    #[serde(rename = "Text", default)]
    text: String,
    #[serde(rename = "FirstURL", default)]
    first_url: String,
    /// Category nodes nest their topics one level down
    #[serde(rename = "Topics", default)]
    topics: Vec<RelatedTopic>,
}

struct SearchHit {
    text: String,
    url: String,
}

impl InstantAnswer {
    fn hits(&self, limit: usize) -> Vec<SearchHit> {
        let mut hits = Vec::new();
        if !self.abstract_text.is_empty() {
            hits.push(SearchHit {
                text: format!("{}: {}", self.heading, self.abstract_text),
                url: self.abstract_url.clone(),
            });
        }
        flatten_topics(&self.related_topics, &mut hits, limit);
        hits.truncate(limit);
        hits
    }
}

fn flatten_topics(topics: &[RelatedTopic], out: &mut Vec<SearchHit>, limit: usize) {
    for topic in topics {
        if out.len() >= limit {
            return;
        }
        if !topic.text.is_empty() {
            out.push(SearchHit {
                text: topic.text.clone(),
                url: topic.first_url.clone(),
            });
        }
        flatten_topics(&topic.topics, out, limit);
    }
}

fn max_results_arg(call: &ToolCall, default: usize) -> usize {
    call.arguments
        .get("max_results")
        .and_then(serde_json::Value::as_u64)
        .map_or(default, |n| (n as usize).min(MAX_RESULTS_CAP))
}

async fn instant_answer(
    http: &reqwest::Client,
    query: &str,
) -> std::result::Result<InstantAnswer, String> {
    http.get(SEARCH_URL)
        .query(&[
            ("q", query),
            ("format", "json"),
            ("no_html", "1"),
            ("skip_disambig", "1"),
        ])
        .send()
        .await
        .map_err(|e| format!("Search error: {e}"))?
        .error_for_status()
        .map_err(|e| format!("Search error: {e}"))?
        .json()
        .await
        .map_err(|e| format!("Search error: {e}"))
}

/// `web_search` tool
pub struct WebSearchTool {
    http: reqwest::Client,
}

impl WebSearchTool {
    pub fn new() -> Result<Self> {
        Ok(Self {
            http: http_client(Duration::from_secs(10))?,
        })
    }
}

#[async_trait]
impl Tool for WebSearchTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "web_search".into(),
            description: "Search the web for a query and return the top results".into(),
            parameters: vec![
                ParameterSchema {
                    name: "query".into(),
                    param_type: "string".into(),
                    description: "Search query".into(),
                    required: true,
                    default: None,
                },
                ParameterSchema {
                    name: "max_results".into(),
                    param_type: "integer".into(),
                    description: "Maximum number of results (up to 10)".into(),
                    required: false,
                    default: Some(serde_json::json!(3)),
                },
            ],
            timeout: Duration::from_secs(15),
            has_side_effects: false,
        }
    }

    async fn execute(&self, call: &ToolCall) -> Result<ToolResult> {
        let Some(query) = str_arg(call, "query") else {
            return Ok(ToolResult::failure(
                "web_search",
                "Please provide a search query.",
            ));
        };
        let limit = max_results_arg(call, 3);

        let answer = match instant_answer(&self.http, query).await {
            Ok(answer) => answer,
            Err(msg) => return Ok(ToolResult::failure("web_search", msg)),
        };

        let hits = answer.hits(limit);
        if hits.is_empty() {
            return Ok(ToolResult::success(
                "web_search",
                format!("No search results found for '{query}'"),
            ));
        }

        let mut formatted = String::new();
        for (i, hit) in hits.iter().enumerate() {
            let _ = write!(formatted, "{}. {}", i + 1, hit.text);
            if !hit.url.is_empty() {
                let _ = write!(formatted, "\n   Source: {}", hit.url);
            }
            formatted.push_str("\n\n");
        }

        Ok(ToolResult::success(
            "web_search",
            formatted.trim_end().to_string(),
        ))
    }
}

/// `latest_news` tool
pub struct LatestNewsTool {
    http: reqwest::Client,
}

impl LatestNewsTool {
    pub fn new() -> Result<Self> {
        Ok(Self {
            http: http_client(Duration::from_secs(10))?,
        })
    }
}

#[async_trait]
impl Tool for LatestNewsTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "latest_news".into(),
            description: "Get latest news headlines for a topic".into(),
            parameters: vec![
                ParameterSchema {
                    name: "topic".into(),
                    param_type: "string".into(),
                    description: "News topic".into(),
                    required: true,
                    default: None,
                },
                ParameterSchema {
                    name: "max_results".into(),
                    param_type: "integer".into(),
                    description: "Maximum number of headlines (up to 10)".into(),
                    required: false,
                    default: Some(serde_json::json!(5)),
                },
            ],
            timeout: Duration::from_secs(15),
            has_side_effects: false,
        }
    }

    async fn execute(&self, call: &ToolCall) -> Result<ToolResult> {
        let Some(topic) = str_arg(call, "topic") else {
            return Ok(ToolResult::failure(
                "latest_news",
                "Please provide a news topic.",
            ));
        };
        let limit = max_results_arg(call, 5);

        let answer = match instant_answer(&self.http, &format!("{topic} news")).await {
            Ok(answer) => answer,
            Err(msg) => return Ok(ToolResult::failure("latest_news", msg)),
        };

        let hits = answer.hits(limit);
        if hits.is_empty() {
            return Ok(ToolResult::success(
                "latest_news",
                format!("No recent news found for '{topic}'"),
            ));
        }

        let lines: Vec<String> = hits
            .iter()
            .map(|hit| {
                if hit.url.is_empty() {
                    hit.text.clone()
                } else {
                    format!("{} ({})", hit.text, hit.url)
                }
            })
            .collect();

        Ok(ToolResult::success("latest_news", lines.join("\n")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hits_flatten_nested_topics() {
        let raw = r#"{
            "Heading": "Rust",
            "AbstractText": "A systems language.",
            "AbstractURL": "https://example.org/rust",
            "RelatedTopics": [
                {"Text": "Cargo", "FirstURL": "https://example.org/cargo"},
                {"Topics": [
                    {"Text": "Clippy", "FirstURL": "https://example.org/clippy"}
                ]}
            ]
        }"#;
        let answer: InstantAnswer = serde_json::from_str(raw).unwrap();
        let hits = answer.hits(10);
        assert_eq!(hits.len(), 3);
        assert!(hits[0].text.starts_with("Rust:"));
        assert_eq!(hits[2].text, "Clippy");
    }

    #[test]
    fn test_hits_honor_limit() {
        let answer = InstantAnswer {
            heading: "x".into(),
            abstract_text: "y".into(),
            abstract_url: String::new(),
            related_topics: (0..8)
                .map(|i| RelatedTopic {
                    text: format!("topic {i}"),
                    first_url: String::new(),
                    topics: Vec::new(),
                })
                .collect(),
        };
        assert_eq!(answer.hits(3).len(), 3);
    }

    #[tokio::test]
    async fn test_empty_query_is_a_failed_result() {
        let tool = WebSearchTool::new().unwrap();
        let call = ToolCall {
            name: "web_search".into(),
            arguments: [("query".to_string(), serde_json::json!("   "))]
                .into_iter()
                .collect(),
            id: None,
        };
        let result = tool.execute(&call).await.unwrap();
        assert!(!result.success);
    }
}
