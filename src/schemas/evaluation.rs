use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

use crate::core::time::format_primitive;
use crate::db::types::TaskStatus;
use crate::repositories::TaskWithResult;
use crate::resilience::ErrorKind;
use crate::schemas::{normalize_language, validate_language};
use crate::tasks::dispatcher::EvaluationRequest;

#[derive(Debug, Deserialize, Validate)]
pub(crate) struct EvaluationCreate {
    #[validate(length(min = 1, message = "theme must not be empty"))]
    pub(crate) theme: String,
    #[validate(custom(function = "language_tag"))]
    pub(crate) language: String,
    #[validate(length(min = 1, message = "submission_ref must not be empty"))]
    pub(crate) submission_ref: String,
    #[validate(length(min = 1, message = "rubric_ref must not be empty"))]
    pub(crate) rubric_ref: String,
    #[serde(default)]
    pub(crate) model: Option<String>,
}

fn language_tag(value: &str) -> Result<(), ValidationError> {
    validate_language(value)
}

impl EvaluationCreate {
    pub(crate) fn into_request(self) -> EvaluationRequest {
        let language = normalize_language(&self.language).unwrap_or(self.language);
        EvaluationRequest {
            theme: self.theme.trim().to_string(),
            language,
            submission_ref: self.submission_ref,
            rubric_ref: self.rubric_ref,
            model: self.model,
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct EvaluationAccepted {
    pub(crate) task_id: String,
    pub(crate) status: TaskStatus,
}

#[derive(Debug, Serialize)]
pub(crate) struct EvaluationResultResponse {
    pub(crate) score: Option<f64>,
    pub(crate) feedback: serde_json::Value,
    pub(crate) model: String,
    pub(crate) error_kind: Option<ErrorKind>,
    pub(crate) error_detail: Option<String>,
    pub(crate) attempts: i32,
    pub(crate) created_at: String,
}

#[derive(Debug, Serialize)]
pub(crate) struct EvaluationResponse {
    pub(crate) task_id: String,
    pub(crate) theme: String,
    pub(crate) language: String,
    pub(crate) submission_ref: String,
    pub(crate) rubric_ref: String,
    pub(crate) model: String,
    pub(crate) status: TaskStatus,
    pub(crate) created_at: String,
    pub(crate) started_at: Option<String>,
    pub(crate) completed_at: Option<String>,
    pub(crate) result: Option<EvaluationResultResponse>,
}

impl EvaluationResponse {
    pub(crate) fn from_db(stored: TaskWithResult) -> Self {
        let TaskWithResult { task, result } = stored;
        Self {
            task_id: task.id,
            theme: task.theme,
            language: task.language,
            submission_ref: task.submission_ref,
            rubric_ref: task.rubric_ref,
            model: task.model,
            status: task.status,
            created_at: format_primitive(task.created_at),
            started_at: task.started_at.map(format_primitive),
            completed_at: task.completed_at.map(format_primitive),
            result: result.map(|result| EvaluationResultResponse {
                score: result.score,
                feedback: result.feedback.0,
                model: result.model,
                error_kind: result.error_kind,
                error_detail: result.error_detail,
                attempts: result.attempts,
                created_at: format_primitive(result.created_at),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(language: &str) -> EvaluationCreate {
        EvaluationCreate {
            theme: "python_basics".to_string(),
            language: language.to_string(),
            submission_ref: "subs/main.py".to_string(),
            rubric_ref: "rubrics/basics.json".to_string(),
            model: None,
        }
    }

    #[test]
    fn accepts_mixed_case_language_and_normalises_it() {
        let create = payload("JavaScript");
        assert!(create.validate().is_ok());
        assert_eq!(create.into_request().language, "javascript");
    }

    #[test]
    fn rejects_unknown_language_and_empty_refs() {
        assert!(payload("brainfuck").validate().is_err());

        let mut create = payload("python");
        create.submission_ref = String::new();
        let err = create.validate().unwrap_err();
        assert!(err.to_string().contains("submission_ref must not be empty"));
    }
}
