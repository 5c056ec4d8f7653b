use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

use crate::repositories::{ExampleFilter, NewExample};
use crate::schemas::{normalize_language, validate_language};

#[derive(Debug, Serialize, Deserialize, Validate)]
pub(crate) struct ExampleItem {
    #[validate(length(min = 1, message = "example id must not be empty"))]
    pub(crate) id: String,
    #[validate(length(min = 1, message = "example code must not be empty"))]
    pub(crate) code: String,
    #[serde(default)]
    pub(crate) language: Option<String>,
    #[serde(default)]
    pub(crate) embedding: Option<Vec<f32>>,
}

#[derive(Debug, Deserialize, Validate)]
#[validate(schema(function = "populate_languages"))]
pub(crate) struct ExamplesPopulate {
    #[validate(length(min = 1, message = "theme must not be empty"))]
    pub(crate) theme: String,
    /// Applied to items that carry no language of their own.
    #[serde(default)]
    pub(crate) language: Option<String>,
    #[validate(length(min = 1, message = "examples must not be empty"), nested)]
    pub(crate) examples: Vec<ExampleItem>,
}

fn populate_languages(payload: &ExamplesPopulate) -> Result<(), ValidationError> {
    let tags = payload
        .language
        .iter()
        .chain(payload.examples.iter().filter_map(|item| item.language.as_ref()));
    for tag in tags {
        validate_language(tag)?;
    }
    Ok(())
}

impl ExamplesPopulate {
    pub(crate) fn into_examples(self) -> (String, Vec<NewExample>) {
        let default_language = self.language.as_deref().and_then(normalize_language);
        let examples = self
            .examples
            .into_iter()
            .map(|item| NewExample {
                id: item.id,
                language: item
                    .language
                    .as_deref()
                    .and_then(normalize_language)
                    .or_else(|| default_language.clone()),
                code: item.code,
                embedding: item.embedding,
            })
            .collect();
        (self.theme.trim().to_string(), examples)
    }
}

#[derive(Debug, Deserialize, Validate)]
#[validate(schema(function = "delete_language"))]
pub(crate) struct ExamplesDelete {
    #[validate(length(min = 1, message = "theme must not be empty"))]
    pub(crate) theme: String,
    #[serde(default)]
    pub(crate) example_id: Option<String>,
    #[serde(default)]
    pub(crate) language: Option<String>,
}

fn delete_language(payload: &ExamplesDelete) -> Result<(), ValidationError> {
    match payload.language.as_deref() {
        Some(tag) => validate_language(tag),
        None => Ok(()),
    }
}

impl ExamplesDelete {
    pub(crate) fn into_filter(self) -> (String, ExampleFilter) {
        let filter = ExampleFilter {
            example_id: self.example_id.filter(|id| !id.trim().is_empty()),
            language: self.language.as_deref().and_then(normalize_language),
        };
        (self.theme.trim().to_string(), filter)
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct ExamplesPopulated {
    pub(crate) theme: String,
    pub(crate) inserted: u64,
}

#[derive(Debug, Serialize)]
pub(crate) struct ExamplesDeleted {
    pub(crate) theme: String,
    pub(crate) removed: u64,
}
