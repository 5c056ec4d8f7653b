use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};

use crate::core::config::{LlmProvider, Settings};
use crate::resilience::PipelineError;
use crate::services::retrieval::ContextSnippet;

const SCORING_SYSTEM_PROMPT: &str = r#"You are an experienced programming instructor grading a student's code.
Grade the submission strictly against the rubric. Reference solutions for the same theme are
provided as context; use them to calibrate expectations, not as the only accepted answer.

Answer with a single JSON object and nothing else:
{
  "score": <number>,
  "feedback": "overall feedback for the student",
  "criteria": [
    {"name": "criterion", "score": <number>, "max_score": <number>, "comment": "why"}
  ]
}
"#;

#[derive(Debug, Clone)]
pub(crate) struct ScoreRequest {
    pub(crate) task_id: String,
    pub(crate) theme: String,
    pub(crate) language: String,
    pub(crate) rubric: Value,
    pub(crate) submission: String,
    pub(crate) context: Vec<ContextSnippet>,
    pub(crate) model: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ScoreOutcome {
    pub(crate) score: f64,
    pub(crate) feedback: Value,
    pub(crate) model: String,
}

/// Grades one submission. Errors are already classified for retry and
/// breaker accounting.
#[async_trait]
pub(crate) trait Scorer: Send + Sync {
    async fn score(&self, request: &ScoreRequest) -> Result<ScoreOutcome, PipelineError>;

    /// Model used when a request does not name one.
    fn default_model(&self) -> &str;
}

#[derive(Debug, Clone)]
pub(crate) struct HttpScorer {
    client: Client,
    provider: LlmProvider,
    api_key: String,
    base_url: String,
    model: String,
    max_tokens: u32,
    temperature: f32,
}

impl HttpScorer {
    pub(crate) fn from_settings(settings: &Settings) -> Result<Self> {
        let llm = settings.llm();
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .timeout(Duration::from_secs(llm.request_timeout))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            provider: llm.provider,
            api_key: llm.api_key.clone(),
            base_url: llm.base_url.trim_end_matches('/').to_string(),
            model: llm.model.clone(),
            max_tokens: llm.max_tokens,
            temperature: llm.temperature,
        })
    }

    fn endpoint(&self) -> String {
        match self.provider {
            LlmProvider::OpenAi => format!("{}/chat/completions", self.base_url),
            LlmProvider::Ollama => format!("{}/api/chat", self.base_url),
        }
    }

    fn payload(&self, model: &str, request: &ScoreRequest) -> Value {
        let messages = json!([
            {"role": "system", "content": SCORING_SYSTEM_PROMPT},
            {"role": "user", "content": user_prompt(request)}
        ]);

        match self.provider {
            LlmProvider::OpenAi => json!({
                "model": model,
                "messages": messages,
                "max_completion_tokens": self.max_tokens,
                "temperature": self.temperature,
                "response_format": {"type": "json_object"}
            }),
            LlmProvider::Ollama => json!({
                "model": model,
                "messages": messages,
                "stream": false,
                "format": "json",
                "options": {"temperature": self.temperature, "num_predict": self.max_tokens}
            }),
        }
    }
}

#[async_trait]
impl Scorer for HttpScorer {
    async fn score(&self, request: &ScoreRequest) -> Result<ScoreOutcome, PipelineError> {
        let model = request
            .model
            .as_deref()
            .filter(|model| !model.trim().is_empty())
            .unwrap_or(&self.model)
            .to_string();
        let timer = Instant::now();

        tracing::info!(
            task_id = %request.task_id,
            provider = self.provider.as_str(),
            model = %model,
            context_snippets = request.context.len(),
            "Sending scoring request"
        );

        let mut call = self.client.post(self.endpoint()).json(&self.payload(&model, request));
        if !self.api_key.is_empty() {
            call = call.bearer_auth(&self.api_key);
        }

        let response = call.send().await.map_err(classify_transport)?;
        let status = response.status();
        let body: Value = response.json().await.unwrap_or(Value::Null);
        if !status.is_success() {
            return Err(classify_status(status, &body));
        }

        let content = extract_content(self.provider, &body)?;
        let (score, feedback) = parse_answer(content)?;

        tracing::info!(
            task_id = %request.task_id,
            model = %model,
            score,
            duration_seconds = timer.elapsed().as_secs_f64(),
            "Scoring completed"
        );

        Ok(ScoreOutcome { score, feedback, model })
    }

    fn default_model(&self) -> &str {
        &self.model
    }
}

fn user_prompt(request: &ScoreRequest) -> String {
    let mut prompt = format!(
        "Theme: {}\nProgramming language: {}\n\nRubric:\n{}\n",
        request.theme,
        request.language,
        render_rubric(&request.rubric)
    );

    if !request.context.is_empty() {
        prompt.push_str("\nReference examples:\n");
        for snippet in &request.context {
            prompt.push_str(&format!(
                "--- example {} (similarity {:.2}) ---\n{}\n",
                snippet.id, snippet.similarity, snippet.code
            ));
        }
    }

    prompt.push_str(&format!(
        "\nStudent submission:\n```{}\n{}\n```\n",
        request.language, request.submission
    ));
    prompt
}

/// Renders `{"name": {"criteria": [...], "weight": n}}` rubrics as headed
/// lists; anything else is passed through as JSON.
fn render_rubric(rubric: &Value) -> String {
    let Some(sections) = rubric.as_object() else {
        return serde_json::to_string_pretty(rubric).unwrap_or_default();
    };

    let structured = sections
        .values()
        .all(|section| section.get("criteria").and_then(Value::as_array).is_some());
    if !structured || sections.is_empty() {
        return serde_json::to_string_pretty(rubric).unwrap_or_default();
    }

    let mut rendered = String::new();
    for (name, section) in sections {
        rendered.push_str(&format!("## Criteria {name}\n"));
        for criterion in section["criteria"].as_array().into_iter().flatten() {
            match criterion.as_str() {
                Some(text) => rendered.push_str(&format!("- {text}\n")),
                None => rendered.push_str(&format!("- {criterion}\n")),
            }
        }
        if let Some(weight) = section.get("weight") {
            rendered.push_str(&format!("### Weight = {weight}\n"));
        }
    }
    rendered
}

fn classify_transport(err: reqwest::Error) -> PipelineError {
    if err.is_builder() {
        return PipelineError::Validation(format!("invalid scoring request: {err}"));
    }
    PipelineError::Transient(format!("scoring request failed: {err}"))
}

fn classify_status(status: StatusCode, body: &Value) -> PipelineError {
    let detail = format!("LLM provider returned {status}: {body}");
    if status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
    {
        PipelineError::Transient(detail)
    } else {
        PipelineError::Validation(detail)
    }
}

fn extract_content(provider: LlmProvider, body: &Value) -> Result<&str, PipelineError> {
    let content = match provider {
        LlmProvider::OpenAi => body
            .get("choices")
            .and_then(|choices| choices.get(0))
            .and_then(|choice| choice.get("message"))
            .and_then(|message| message.get("content")),
        LlmProvider::Ollama => body.get("message").and_then(|message| message.get("content")),
    };

    content
        .and_then(Value::as_str)
        .ok_or_else(|| PipelineError::Transient("missing content in LLM response".to_string()))
}

/// Parses the model's JSON answer into a score and the full feedback object.
fn parse_answer(content: &str) -> Result<(f64, Value), PipelineError> {
    let cleaned = strip_code_fence(content);
    let answer: Value = serde_json::from_str(cleaned)
        .map_err(|err| PipelineError::Transient(format!("unparsable model output: {err}")))?;

    if !answer.is_object() {
        return Err(PipelineError::Transient("model output is not a JSON object".to_string()));
    }

    let score = ["score", "grade", "total_score"]
        .iter()
        .find_map(|key| answer.get(*key).and_then(numeric))
        .filter(|score| score.is_finite())
        .ok_or_else(|| PipelineError::Validation("model answer has no numeric score".to_string()))?;

    Ok((score, answer))
}

fn numeric(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

fn strip_code_fence(content: &str) -> &str {
    let trimmed = content.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}
