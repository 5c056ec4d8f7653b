use std::io::ErrorKind as IoErrorKind;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use serde_json::Value;

use crate::db::models::Task;
use crate::resilience::PipelineError;
use crate::services::storage::{s3_key, StorageService};

#[derive(Debug, Clone)]
pub(crate) struct SubmissionBundle {
    pub(crate) submission: String,
    pub(crate) rubric: Value,
}

/// Resolves a task's stored submission and rubric references.
#[async_trait]
pub(crate) trait SubmissionSource: Send + Sync {
    async fn load(&self, task: &Task) -> Result<SubmissionBundle, PipelineError>;
}

/// Local files under the resources directory, or `s3://` objects.
pub(crate) struct StoredSubmissionSource {
    resources_dir: PathBuf,
    storage: Option<StorageService>,
}

impl StoredSubmissionSource {
    pub(crate) fn new(resources_dir: PathBuf, storage: Option<StorageService>) -> Self {
        Self { resources_dir, storage }
    }

    async fn fetch_text(&self, reference: &str) -> Result<String, PipelineError> {
        if let Some(key) = s3_key(reference) {
            let storage = self.storage.as_ref().ok_or_else(|| {
                PipelineError::Validation(format!("{reference}: S3 storage is not configured"))
            })?;
            let bytes = storage.fetch_bytes(key).await?;
            return into_text(reference, bytes);
        }

        let path = resolve_local(&self.resources_dir, reference)?;
        let metadata = tokio::fs::metadata(&path).await.map_err(|err| io_error(reference, err))?;
        if metadata.is_dir() {
            return read_directory(reference, &path).await;
        }

        let bytes = tokio::fs::read(&path).await.map_err(|err| io_error(reference, err))?;
        into_text(reference, bytes)
    }
}

#[async_trait]
impl SubmissionSource for StoredSubmissionSource {
    async fn load(&self, task: &Task) -> Result<SubmissionBundle, PipelineError> {
        let submission = self.fetch_text(&task.submission_ref).await?;
        let rubric_text = self.fetch_text(&task.rubric_ref).await?;
        let rubric = serde_json::from_str(&rubric_text).map_err(|err| {
            PipelineError::Validation(format!("rubric {} is not valid JSON: {err}", task.rubric_ref))
        })?;

        tracing::debug!(
            task_id = %task.id,
            submission_bytes = submission.len(),
            "Submission and rubric loaded"
        );
        Ok(SubmissionBundle { submission, rubric })
    }
}

/// Joins `reference` onto `root`, rejecting anything that could escape it.
fn resolve_local(root: &Path, reference: &str) -> Result<PathBuf, PipelineError> {
    let relative = Path::new(reference);
    if reference.trim().is_empty() {
        return Err(PipelineError::Validation("empty resource reference".to_string()));
    }

    let escapes = relative
        .components()
        .any(|component| !matches!(component, Component::Normal(_) | Component::CurDir));
    if escapes {
        return Err(PipelineError::Validation(format!(
            "resource reference {reference} must stay inside the resources directory"
        )));
    }

    Ok(root.join(relative))
}

/// Concatenates every file of an unpacked submission, in path order.
async fn read_directory(reference: &str, root: &Path) -> Result<String, PipelineError> {
    let mut files = Vec::new();
    let mut pending = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let mut entries =
            tokio::fs::read_dir(&dir).await.map_err(|err| io_error(reference, err))?;
        while let Some(entry) = entries.next_entry().await.map_err(|err| io_error(reference, err))? {
            let file_type = entry.file_type().await.map_err(|err| io_error(reference, err))?;
            if file_type.is_dir() {
                pending.push(entry.path());
            } else if file_type.is_file() {
                files.push(entry.path());
            }
        }
    }
    files.sort();

    if files.is_empty() {
        return Err(PipelineError::NotFound(format!("{reference} contains no files")));
    }

    let mut combined = String::new();
    for path in files {
        let bytes = tokio::fs::read(&path).await.map_err(|err| io_error(reference, err))?;
        let name = path.strip_prefix(root).unwrap_or(&path).display().to_string();
        combined.push_str(&format!("// file: {name}\n"));
        combined.push_str(&into_text(reference, bytes)?);
        if !combined.ends_with('\n') {
            combined.push('\n');
        }
    }
    Ok(combined)
}

fn into_text(reference: &str, bytes: Vec<u8>) -> Result<String, PipelineError> {
    String::from_utf8(bytes)
        .map_err(|_| PipelineError::Validation(format!("{reference} is not valid UTF-8 text")))
}

fn io_error(reference: &str, err: std::io::Error) -> PipelineError {
    match err.kind() {
        IoErrorKind::NotFound => PipelineError::NotFound(reference.to_string()),
        _ => PipelineError::Transient(format!("failed to read {reference}: {err}")),
    }
}
