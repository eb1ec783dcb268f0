//! OpenAI analysis generator
//!
//! Asks the chat-completions endpoint for a structured JSON analysis of a
//! repository and validates it into a `RepoAnalysis`. A strict-retry mode lowers
//! temperature, tightens the instructions, and accepts a relaxed schema that
//! defaults the non-critical fields.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::github::RepoAttributes;

const OPENAI_CHAT_URL: &str = "https://api.openai.com/v1/chat/completions";
const DEFAULT_MODEL: &str = "gpt-4o-mini";

/// A suggested alternative to the analyzed repository
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alternative {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub github_url: Option<String>,
    #[serde(default)]
    pub stars: Option<u64>,
    #[serde(default)]
    pub category: Option<String>,
    pub reasoning: String,
}

/// Validated analysis of a repository
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RepoAnalysis {
    pub category: String,
    pub summary: String,
    pub strengths: Vec<String>,
    pub considerations: Vec<String>,
    pub use_case: String,
    pub audience: String,
    pub alternatives: Vec<Alternative>,
}

impl RepoAnalysis {
    /// Single prose field for display consumers that predate the structured shape
    pub fn legacy_text(&self) -> String {
        let mut out = String::new();
        out.push_str(&self.summary);
        if !self.strengths.is_empty() {
            out.push_str("\n\nStrengths: ");
            out.push_str(&self.strengths.join("; "));
        }
        if !self.use_case.is_empty() {
            out.push_str("\n\nUse case: ");
            out.push_str(&self.use_case);
        }
        out
    }
}

#[derive(Debug, Error)]
pub enum GenerateError {
    #[error("analysis failed validation: {0}")]
    Validation(String),
    #[error("generator request failed: {0}")]
    Transport(String),
}

/// Generation settings: Standard for the first attempt, StrictRetry after a
/// validation failure (lower variance, tighter instructions, relaxed schema)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationMode {
    Standard,
    StrictRetry,
}

/// Seam for the analysis generator so tests can substitute a fake.
#[async_trait]
pub trait AnalysisGenerator: Send + Sync {
    async fn generate(
        &self,
        attrs: &RepoAttributes,
        mode: GenerationMode,
    ) -> Result<RepoAnalysis, GenerateError>;
}

// === Wire types ===

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    response_format: ResponseFormat,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: String,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    content: String,
}

/// What the model actually returns, before validation. Everything defaults so a
/// partially filled object still parses in relaxed mode.
#[derive(Debug, Default, Deserialize)]
struct RawAnalysis {
    #[serde(default)]
    category: String,
    #[serde(default)]
    summary: String,
    #[serde(default)]
    strengths: Vec<String>,
    #[serde(default)]
    considerations: Vec<String>,
    #[serde(default)]
    use_case: String,
    #[serde(default)]
    audience: String,
    #[serde(default)]
    alternatives: Vec<RawAlternative>,
}

#[derive(Debug, Deserialize)]
struct RawAlternative {
    #[serde(default)]
    name: String,
    #[serde(default)]
    url: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    github_url: Option<String>,
    #[serde(default)]
    stars: Option<u64>,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    reasoning: String,
}

/// OpenAI-backed generator
pub struct OpenAiGenerator {
    api_key: String,
    model: String,
    client: reqwest::Client,
    debug: bool,
}

impl OpenAiGenerator {
    pub fn new(api_key: String, debug: bool) -> Self {
        Self {
            api_key,
            model: DEFAULT_MODEL.to_string(),
            client: reqwest::Client::new(),
            debug,
        }
    }

    fn build_messages(attrs: &RepoAttributes, mode: GenerationMode) -> Vec<ChatMessage<'static>> {
        let system = match mode {
            GenerationMode::Standard => {
                "You are a software analyst. Analyze the GitHub repository described by \
                 the user and respond with a single JSON object with these keys: \
                 category (short label), summary (2-3 sentences), strengths (array of \
                 short strings), considerations (array of short strings), use_case \
                 (prose), audience (prose), alternatives (array of objects with name, \
                 url, reasoning, and optionally description, github_url, stars, \
                 category). Include at least two alternatives."
                    .to_string()
            }
            GenerationMode::StrictRetry => {
                "Respond with ONLY a JSON object, no prose and no markdown fences. \
                 Required keys: category (non-empty string), summary (non-empty string), \
                 alternatives (non-empty array). Every alternative MUST have a non-empty \
                 name, a full http(s) url, and a non-empty reasoning string. Optional \
                 keys: strengths, considerations, use_case, audience. If unsure about an \
                 optional key, use an empty array or empty string."
                    .to_string()
            }
        };

        let topics = if attrs.topics.is_empty() {
            "none".to_string()
        } else {
            attrs.topics.join(", ")
        };
        let user = format!(
            "Repository: {}\nDescription: {}\nPrimary language: {}\nStars: {}\nForks: {}\n\
             Open issues: {}\nTopics: {}\nLicense: {}\nArchived: {}",
            attrs.full_name,
            attrs.description.as_deref().unwrap_or("(none)"),
            attrs.language.as_deref().unwrap_or("(unknown)"),
            attrs.stargazers_count,
            attrs.forks_count,
            attrs.open_issues_count,
            topics,
            attrs
                .license
                .as_ref()
                .and_then(|l| l.name.as_deref())
                .unwrap_or("(none)"),
            attrs.archived,
        );

        vec![
            ChatMessage {
                role: "system",
                content: system,
            },
            ChatMessage {
                role: "user",
                content: user,
            },
        ]
    }

    /// Send one chat request, retrying transient errors with backoff
    async fn complete(&self, request: &ChatRequest<'_>) -> Result<String, GenerateError> {
        let max_retries = 3;
        let mut last_error = String::new();

        for attempt in 0..max_retries {
            if attempt > 0 {
                let delay_ms = 1000 * (1 << attempt.min(3));
                tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
            }

            let start = std::time::Instant::now();

            let response = match self
                .client
                .post(OPENAI_CHAT_URL)
                .header("Authorization", format!("Bearer {}", self.api_key))
                .header("Content-Type", "application/json")
                .json(request)
                .send()
                .await
            {
                Ok(r) => r,
                Err(e) => {
                    last_error = format!("Request failed: {}", e);
                    continue;
                }
            };

            let status = response.status();

            if status.is_success() {
                let result: ChatResponse = response
                    .json()
                    .await
                    .map_err(|e| GenerateError::Transport(format!("parse error: {}", e)))?;

                if self.debug {
                    let now = chrono::Local::now().format("%H:%M:%S%.3f");
                    eprintln!(
                        "\x1b[90m[{}] POST {} ... {}ms\x1b[0m",
                        now,
                        OPENAI_CHAT_URL,
                        start.elapsed().as_millis()
                    );
                }

                return result
                    .choices
                    .into_iter()
                    .next()
                    .map(|c| c.message.content)
                    .ok_or_else(|| GenerateError::Transport("empty choices".to_string()));
            }

            let is_transient = status == reqwest::StatusCode::BAD_GATEWAY
                || status == reqwest::StatusCode::SERVICE_UNAVAILABLE
                || status == reqwest::StatusCode::GATEWAY_TIMEOUT
                || status == reqwest::StatusCode::TOO_MANY_REQUESTS;

            if !is_transient {
                let body = response.text().await.unwrap_or_default();
                return Err(GenerateError::Transport(format!(
                    "OpenAI API error ({}): {}",
                    status, body
                )));
            }

            last_error = format!("OpenAI API error ({})", status);
        }

        Err(GenerateError::Transport(format!(
            "OpenAI API failed after {} retries: {}",
            max_retries, last_error
        )))
    }
}

#[async_trait]
impl AnalysisGenerator for OpenAiGenerator {
    async fn generate(
        &self,
        attrs: &RepoAttributes,
        mode: GenerationMode,
    ) -> Result<RepoAnalysis, GenerateError> {
        let temperature = match mode {
            GenerationMode::Standard => 0.7,
            GenerationMode::StrictRetry => 0.0,
        };

        let request = ChatRequest {
            model: &self.model,
            messages: Self::build_messages(attrs, mode),
            temperature,
            response_format: ResponseFormat {
                kind: "json_object",
            },
        };

        let content = self.complete(&request).await?;
        parse_and_validate(&content, mode)
    }
}

/// Extract the JSON object from the model output (tolerating markdown fences
/// and surrounding prose) and validate it into a `RepoAnalysis`.
pub fn parse_and_validate(
    content: &str,
    mode: GenerationMode,
) -> Result<RepoAnalysis, GenerateError> {
    let json = extract_json_object(content)
        .ok_or_else(|| GenerateError::Validation("no JSON object in output".to_string()))?;

    let raw: RawAnalysis = serde_json::from_str(json)
        .map_err(|e| GenerateError::Validation(format!("malformed JSON: {}", e)))?;

    validate(raw, mode)
}

fn extract_json_object(content: &str) -> Option<&str> {
    let start = content.find('{')?;
    let end = content.rfind('}')?;
    if end < start {
        return None;
    }
    Some(&content[start..=end])
}

fn valid_url(s: &str) -> bool {
    url::Url::parse(s)
        .map(|u| u.scheme() == "http" || u.scheme() == "https")
        .unwrap_or(false)
}

fn validate(raw: RawAnalysis, mode: GenerationMode) -> Result<RepoAnalysis, GenerateError> {
    if raw.category.trim().is_empty() {
        return Err(GenerateError::Validation("empty category".to_string()));
    }
    if raw.summary.trim().is_empty() {
        return Err(GenerateError::Validation("empty summary".to_string()));
    }

    let mut alternatives = Vec::with_capacity(raw.alternatives.len());
    for alt in raw.alternatives {
        let ok = !alt.name.trim().is_empty()
            && valid_url(&alt.url)
            && !alt.reasoning.trim().is_empty();

        if ok {
            alternatives.push(Alternative {
                name: alt.name,
                url: alt.url,
                description: alt.description,
                github_url: alt.github_url.filter(|u| valid_url(u)),
                stars: alt.stars,
                category: alt.category,
                reasoning: alt.reasoning,
            });
        } else if mode == GenerationMode::Standard {
            // Standard mode treats any broken alternative as a failed generation;
            // the strict retry drops it and keeps the valid ones
            return Err(GenerateError::Validation(format!(
                "invalid alternative: name={:?} url={:?}",
                alt.name, alt.url
            )));
        }
    }

    if alternatives.is_empty() {
        return Err(GenerateError::Validation("no valid alternatives".to_string()));
    }

    match mode {
        GenerationMode::Standard => {
            // Full schema expected on the first attempt
            if raw.strengths.is_empty() {
                return Err(GenerateError::Validation("empty strengths".to_string()));
            }
            if raw.use_case.trim().is_empty() || raw.audience.trim().is_empty() {
                return Err(GenerateError::Validation(
                    "missing use_case or audience".to_string(),
                ));
            }
            Ok(RepoAnalysis {
                category: raw.category,
                summary: raw.summary,
                strengths: raw.strengths,
                considerations: raw.considerations,
                use_case: raw.use_case,
                audience: raw.audience,
                alternatives,
            })
        }
        GenerationMode::StrictRetry => {
            // Relaxed schema: default the non-critical fields
            let use_case = if raw.use_case.trim().is_empty() {
                "General software development.".to_string()
            } else {
                raw.use_case
            };
            let audience = if raw.audience.trim().is_empty() {
                "Developers evaluating this project.".to_string()
            } else {
                raw.audience
            };
            Ok(RepoAnalysis {
                category: raw.category,
                summary: raw.summary,
                strengths: raw.strengths,
                considerations: raw.considerations,
                use_case,
                audience,
                alternatives,
            })
        }
    }
}

#[cfg(test)]
pub mod test_fixtures {
    use super::*;
    use crate::github::{LicenseInfo, OwnerInfo, RepoAttributes};

    pub fn sample_attrs(full_name: &str, stars: u64) -> RepoAttributes {
        let name = full_name.split('/').nth(1).unwrap_or(full_name);
        RepoAttributes {
            full_name: full_name.to_string(),
            description: Some(format!("{} does things", name)),
            html_url: format!("https://github.com/{}", full_name),
            owner: OwnerInfo {
                avatar_url: "https://avatars.githubusercontent.com/u/1".to_string(),
            },
            language: Some("Rust".to_string()),
            stargazers_count: stars,
            forks_count: 3,
            open_issues_count: 1,
            size: 120,
            topics: vec!["tool".to_string()],
            license: Some(LicenseInfo {
                name: Some("MIT License".to_string()),
            }),
            archived: false,
            disabled: false,
            default_branch: Some("main".to_string()),
            created_at: Some("2020-01-01T00:00:00Z".to_string()),
            updated_at: Some("2024-01-01T00:00:00Z".to_string()),
            pushed_at: Some("2024-01-01T00:00:00Z".to_string()),
        }
    }

    pub fn sample_analysis() -> RepoAnalysis {
        RepoAnalysis {
            category: "CLI Tool".to_string(),
            summary: "A command line tool that does things.".to_string(),
            strengths: vec!["fast".to_string(), "small".to_string()],
            considerations: vec!["young project".to_string()],
            use_case: "Doing things from the terminal.".to_string(),
            audience: "Terminal users.".to_string(),
            alternatives: vec![Alternative {
                name: "other-tool".to_string(),
                url: "https://github.com/other/other-tool".to_string(),
                description: Some("Another tool".to_string()),
                github_url: Some("https://github.com/other/other-tool".to_string()),
                stars: Some(99),
                category: Some("CLI Tool".to_string()),
                reasoning: "Covers the same workflow.".to_string(),
            }],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL_JSON: &str = r#"{
        "category": "CLI Tool",
        "summary": "Does things.",
        "strengths": ["fast"],
        "considerations": [],
        "use_case": "Terminal work.",
        "audience": "Developers.",
        "alternatives": [
            {"name": "alt", "url": "https://example.com/alt", "reasoning": "similar"}
        ]
    }"#;

    #[test]
    fn test_parse_full_output() {
        let analysis = parse_and_validate(FULL_JSON, GenerationMode::Standard).unwrap();
        assert_eq!(analysis.category, "CLI Tool");
        assert_eq!(analysis.alternatives.len(), 1);
    }

    #[test]
    fn test_parse_strips_markdown_fences() {
        let fenced = format!("```json\n{}\n```", FULL_JSON);
        let analysis = parse_and_validate(&fenced, GenerationMode::Standard).unwrap();
        assert_eq!(analysis.summary, "Does things.");
    }

    #[test]
    fn test_parse_rejects_non_json() {
        let err = parse_and_validate("I cannot help with that.", GenerationMode::Standard);
        assert!(matches!(err, Err(GenerateError::Validation(_))));
    }

    #[test]
    fn test_standard_rejects_missing_use_case() {
        let json = r#"{
            "category": "CLI Tool",
            "summary": "Does things.",
            "strengths": ["fast"],
            "alternatives": [
                {"name": "alt", "url": "https://example.com", "reasoning": "similar"}
            ]
        }"#;
        assert!(parse_and_validate(json, GenerationMode::Standard).is_err());
    }

    #[test]
    fn test_strict_retry_defaults_non_critical_fields() {
        let json = r#"{
            "category": "CLI Tool",
            "summary": "Does things.",
            "alternatives": [
                {"name": "alt", "url": "https://example.com", "reasoning": "similar"}
            ]
        }"#;
        let analysis = parse_and_validate(json, GenerationMode::StrictRetry).unwrap();
        assert!(analysis.strengths.is_empty());
        assert!(!analysis.use_case.is_empty());
        assert!(!analysis.audience.is_empty());
    }

    #[test]
    fn test_standard_rejects_invalid_alternative_url() {
        let json = r#"{
            "category": "CLI Tool",
            "summary": "Does things.",
            "strengths": ["fast"],
            "use_case": "x",
            "audience": "y",
            "alternatives": [
                {"name": "alt", "url": "not a url", "reasoning": "similar"}
            ]
        }"#;
        assert!(parse_and_validate(json, GenerationMode::Standard).is_err());
    }

    #[test]
    fn test_strict_retry_drops_invalid_alternatives_keeps_valid() {
        let json = r#"{
            "category": "CLI Tool",
            "summary": "Does things.",
            "alternatives": [
                {"name": "", "url": "https://example.com", "reasoning": "x"},
                {"name": "good", "url": "https://example.com/good", "reasoning": "solid"}
            ]
        }"#;
        let analysis = parse_and_validate(json, GenerationMode::StrictRetry).unwrap();
        assert_eq!(analysis.alternatives.len(), 1);
        assert_eq!(analysis.alternatives[0].name, "good");
    }

    #[test]
    fn test_strict_retry_fails_when_no_valid_alternatives() {
        let json = r#"{
            "category": "CLI Tool",
            "summary": "Does things.",
            "alternatives": [
                {"name": "", "url": "", "reasoning": ""}
            ]
        }"#;
        assert!(parse_and_validate(json, GenerationMode::StrictRetry).is_err());
    }

    #[test]
    fn test_empty_category_rejected_in_both_modes() {
        let json = r#"{
            "category": "  ",
            "summary": "Does things.",
            "alternatives": [
                {"name": "alt", "url": "https://example.com", "reasoning": "similar"}
            ]
        }"#;
        assert!(parse_and_validate(json, GenerationMode::Standard).is_err());
        assert!(parse_and_validate(json, GenerationMode::StrictRetry).is_err());
    }

    #[test]
    fn test_invalid_github_url_field_dropped_not_fatal() {
        let json = r#"{
            "category": "CLI Tool",
            "summary": "Does things.",
            "alternatives": [
                {"name": "alt", "url": "https://example.com", "github_url": "nope", "reasoning": "similar"}
            ]
        }"#;
        let analysis = parse_and_validate(json, GenerationMode::StrictRetry).unwrap();
        assert!(analysis.alternatives[0].github_url.is_none());
    }

    #[test]
    fn test_legacy_text_concatenates_display_fields() {
        let analysis = super::test_fixtures::sample_analysis();
        let text = analysis.legacy_text();
        assert!(text.contains("A command line tool"));
        assert!(text.contains("Strengths: fast; small"));
        assert!(text.contains("Use case:"));
    }
}
