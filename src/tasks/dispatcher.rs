use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::Instant;
use uuid::Uuid;

use crate::db::types::TaskStatus;
use crate::repositories::{NewTask, TaskStore};
use crate::resilience::PipelineError;

/// A validated request to grade one submission.
#[derive(Debug, Clone)]
pub(crate) struct EvaluationRequest {
    pub(crate) theme: String,
    pub(crate) language: String,
    pub(crate) submission_ref: String,
    pub(crate) rubric_ref: String,
    pub(crate) model: Option<String>,
}

#[derive(Debug, Clone)]
pub(crate) struct EvaluationJob {
    pub(crate) task_id: String,
    pub(crate) enqueued_at: Instant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Dispatched {
    pub(crate) task_id: String,
    pub(crate) status: TaskStatus,
}

#[derive(Debug, Error)]
pub(crate) enum DispatchError {
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error("evaluation queue is closed")]
    QueueClosed,
    #[error("evaluation queue is full")]
    QueueFull,
}

/// Creates pending tasks and hands them to the worker queue without waiting
/// for them to run.
pub(crate) struct TaskDispatcher {
    tasks: Arc<dyn TaskStore>,
    queue: mpsc::Sender<EvaluationJob>,
    default_model: String,
}

impl TaskDispatcher {
    pub(crate) fn new(
        tasks: Arc<dyn TaskStore>,
        queue: mpsc::Sender<EvaluationJob>,
        default_model: impl Into<String>,
    ) -> Self {
        Self { tasks, queue, default_model: default_model.into() }
    }

    pub(crate) async fn dispatch(
        &self,
        request: EvaluationRequest,
    ) -> Result<Dispatched, DispatchError> {
        let required = [
            ("theme", &request.theme),
            ("language", &request.language),
            ("submission_ref", &request.submission_ref),
            ("rubric_ref", &request.rubric_ref),
        ];
        if let Some((field, _)) = required.iter().find(|(_, value)| value.trim().is_empty()) {
            return Err(PipelineError::Validation(format!("{field} is required")).into());
        }

        // Reserve queue capacity first so a task is never created without a job.
        let permit = self.queue.try_reserve().map_err(|err| match err {
            TrySendError::Full(()) => DispatchError::QueueFull,
            TrySendError::Closed(()) => DispatchError::QueueClosed,
        })?;

        let model = request
            .model
            .filter(|model| !model.trim().is_empty())
            .unwrap_or_else(|| self.default_model.clone());
        let task = self
            .tasks
            .create_task(NewTask {
                id: Uuid::new_v4().to_string(),
                theme: request.theme,
                language: request.language,
                submission_ref: request.submission_ref,
                rubric_ref: request.rubric_ref,
                model,
            })
            .await?;

        permit.send(EvaluationJob { task_id: task.id.clone(), enqueued_at: Instant::now() });
        tracing::info!(task_id = %task.id, theme = %task.theme, model = %task.model, "Evaluation dispatched");

        Ok(Dispatched { task_id: task.id, status: task.status })
    }
}

/// Task ids currently held by a worker.
#[derive(Debug, Clone, Default)]
pub(crate) struct InFlight {
    ids: Arc<Mutex<HashSet<String>>>,
}

#[derive(Debug)]
pub(crate) struct InFlightGuard {
    ids: Arc<Mutex<HashSet<String>>>,
    task_id: String,
}

impl InFlight {
    /// Claims `task_id`; `None` while another execution holds it.
    pub(crate) fn claim(&self, task_id: &str) -> Option<InFlightGuard> {
        let mut ids = self.ids.lock().unwrap_or_else(|err| err.into_inner());
        if !ids.insert(task_id.to_string()) {
            return None;
        }
        Some(InFlightGuard { ids: self.ids.clone(), task_id: task_id.to_string() })
    }

    pub(crate) fn len(&self) -> usize {
        self.ids.lock().unwrap_or_else(|err| err.into_inner()).len()
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.ids.lock().unwrap_or_else(|err| err.into_inner()).remove(&self.task_id);
    }
}
