use serde::Serialize;
use validator::ValidationError;

pub(crate) mod evaluation;
pub(crate) mod example;

pub(crate) const SUPPORTED_LANGUAGES: [&str; 5] = ["python", "java", "javascript", "cpp", "c"];

#[derive(Debug, Serialize)]
pub(crate) struct RootResponse {
    pub(crate) message: String,
    pub(crate) version: String,
    pub(crate) docs_url: String,
}

/// Lower-cases a language tag; `None` if it is not one we grade.
pub(crate) fn normalize_language(value: &str) -> Option<String> {
    let normalized = value.trim().to_ascii_lowercase();
    SUPPORTED_LANGUAGES.contains(&normalized.as_str()).then_some(normalized)
}

pub(crate) fn validate_language(value: &str) -> Result<(), ValidationError> {
    if normalize_language(value).is_some() {
        return Ok(());
    }
    let mut error = ValidationError::new("unsupported_language");
    error.message = Some(
        format!("language must be one of: {}", SUPPORTED_LANGUAGES.join(", ")).into(),
    );
    Err(error)
}
