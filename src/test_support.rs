use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use sqlx::types::Json;
use tokio::sync::{mpsc, Mutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::core::config::Settings;
use crate::core::state::AppState;
use crate::core::time::primitive_now_utc;
use crate::db::models::{RetrievalExample, Task, TaskResult};
use crate::db::types::TaskStatus;
use crate::repositories::{
    CompletionOutcome, ExampleFilter, ExampleStore, NewExample, NewTask, TaskCompletion,
    TaskStore, TaskWithResult,
};
use crate::resilience::{BreakerConfig, CircuitBreaker, PipelineError, RetryPolicy};
use crate::services::health::HealthReporter;
use crate::services::llm_scoring::{ScoreOutcome, ScoreRequest, Scorer};
use crate::services::notifier::ResultNotifier;
use crate::services::resource_cache::ResourceCache;
use crate::services::submissions::{SubmissionBundle, SubmissionSource};
use crate::tasks::dispatcher::{EvaluationJob, TaskDispatcher};
use crate::tasks::evaluation::{EvaluationWorker, WorkerDeps};

pub(crate) async fn env_lock() -> OwnedMutexGuard<()> {
    static LOCK: OnceLock<Arc<Mutex<()>>> = OnceLock::new();
    let lock = LOCK.get_or_init(|| Arc::new(Mutex::new(()))).clone();
    lock.lock_owned().await
}

/// Every variable a settings test may set. Call with the env lock held.
pub(crate) fn clear_settings_env() {
    const KEYS: &[&str] = &[
        "AUTOGRADER_PORT",
        "AUTOGRADER_ENV",
        "ENVIRONMENT",
        "AUTOGRADER_STRICT_CONFIG",
        "PROJECT_NAME",
        "API_V1_STR",
        "LLM_PROVIDER",
        "LLM_API_KEY",
        "LLM_BASE_URL",
        "LLM_BREAKER_THRESHOLD",
        "RETRY_MAX_ATTEMPTS",
        "WORKER_CONCURRENCY",
        "QUEUE_CAPACITY",
        "PERSIST_TIMEOUT_SECONDS",
        "RAG_CACHE_CAPACITY",
        "DATABASE_URL",
        "POSTGRES_PASSWORD",
        "PROMETHEUS_ENABLED",
    ];
    for key in KEYS {
        std::env::remove_var(key);
    }
}

fn locked<T>(mutex: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|err| err.into_inner())
}

pub(crate) fn new_example(id: &str, code: &str) -> NewExample {
    NewExample {
        id: id.to_string(),
        language: Some("python".to_string()),
        code: code.to_string(),
        embedding: None,
    }
}

pub(crate) fn pending_task(id: &str, submission_ref: &str, rubric_ref: &str) -> Task {
    Task {
        id: id.to_string(),
        theme: "python_basics".to_string(),
        language: "python".to_string(),
        submission_ref: submission_ref.to_string(),
        rubric_ref: rubric_ref.to_string(),
        model: "gpt-4o-mini".to_string(),
        status: TaskStatus::Pending,
        created_at: primitive_now_utc(),
        started_at: None,
        completed_at: None,
    }
}

/// Scratch directory removed on drop.
pub(crate) struct TempDir {
    path: PathBuf,
}

impl TempDir {
    pub(crate) fn new() -> Self {
        let path = std::env::temp_dir().join(format!("autograder-test-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&path).expect("create temp dir");
        Self { path }
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn write(&self, relative: &str, contents: &str) {
        let target = self.path.join(relative);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent).expect("create parent dir");
        }
        std::fs::write(target, contents).expect("write file");
    }
}

impl Drop for TempDir {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.path);
    }
}

#[derive(Default)]
struct TaskRows {
    tasks: HashMap<String, Task>,
    results: Vec<TaskResult>,
}

#[derive(Default)]
pub(crate) struct MemoryTaskStore {
    rows: StdMutex<TaskRows>,
    failing_completions: AtomicUsize,
    stalled_completions: AtomicUsize,
    stall: StdMutex<Duration>,
    ping_fails: AtomicBool,
}

impl MemoryTaskStore {
    pub(crate) fn task(&self, task_id: &str) -> Option<Task> {
        locked(&self.rows).tasks.get(task_id).cloned()
    }

    pub(crate) fn task_count(&self) -> usize {
        locked(&self.rows).tasks.len()
    }

    pub(crate) fn result(&self, task_id: &str) -> Option<TaskResult> {
        locked(&self.rows).results.iter().find(|result| result.task_id == task_id).cloned()
    }

    pub(crate) fn result_count(&self, task_id: &str) -> usize {
        locked(&self.rows).results.iter().filter(|result| result.task_id == task_id).count()
    }

    /// The next `count` completions fail without touching the task.
    pub(crate) fn fail_completions(&self, count: usize) {
        self.failing_completions.store(count, Ordering::SeqCst);
    }

    /// The next `count` completions hang for `delay` before touching the task.
    pub(crate) fn stall_completions(&self, count: usize, delay: Duration) {
        *locked(&self.stall) = delay;
        self.stalled_completions.store(count, Ordering::SeqCst);
    }

    pub(crate) fn set_ping_failure(&self, failing: bool) {
        self.ping_fails.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn create_task(&self, task: NewTask) -> Result<Task, PipelineError> {
        let created = Task {
            id: task.id,
            theme: task.theme,
            language: task.language,
            submission_ref: task.submission_ref,
            rubric_ref: task.rubric_ref,
            model: task.model,
            status: TaskStatus::Pending,
            created_at: primitive_now_utc(),
            started_at: None,
            completed_at: None,
        };
        locked(&self.rows).tasks.insert(created.id.clone(), created.clone());
        Ok(created)
    }

    async fn mark_running(&self, task_id: &str) -> Result<Option<Task>, PipelineError> {
        let mut rows = locked(&self.rows);
        let Some(task) = rows.tasks.get_mut(task_id) else {
            return Ok(None);
        };
        if task.status != TaskStatus::Pending {
            return Ok(None);
        }
        task.status = TaskStatus::Running;
        task.started_at = Some(primitive_now_utc());
        Ok(Some(task.clone()))
    }

    async fn complete(&self, completion: TaskCompletion) -> Result<(), PipelineError> {
        let stalled = self.stalled_completions.load(Ordering::SeqCst);
        if stalled > 0 {
            self.stalled_completions.store(stalled - 1, Ordering::SeqCst);
            let delay = *locked(&self.stall);
            tokio::time::sleep(delay).await;
        }

        let remaining = self.failing_completions.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failing_completions.store(remaining - 1, Ordering::SeqCst);
            return Err(PipelineError::Persistence("connection reset by peer".to_string()));
        }

        let mut rows = locked(&self.rows);
        let status = completion.status();
        let task = rows.tasks.get_mut(&completion.task_id).ok_or_else(|| {
            PipelineError::Persistence(format!("task {} not found", completion.task_id))
        })?;
        if task.status != TaskStatus::Running {
            return Err(PipelineError::Persistence(format!(
                "task {} is not running",
                completion.task_id
            )));
        }
        let now = primitive_now_utc();
        task.status = status;
        task.completed_at = Some(now);

        let (score, feedback, error_kind, error_detail) = match completion.outcome {
            CompletionOutcome::Succeeded { score, feedback } => (Some(score), feedback, None, None),
            CompletionOutcome::Failed { kind, detail } => {
                (None, Value::Null, Some(kind), Some(detail))
            }
        };
        rows.results.push(TaskResult {
            task_id: completion.task_id,
            score,
            feedback: Json(feedback),
            model: completion.model,
            error_kind,
            error_detail,
            attempts: completion.attempts as i32,
            created_at: now,
        });
        Ok(())
    }

    async fn find_with_result(
        &self,
        task_id: &str,
    ) -> Result<Option<TaskWithResult>, PipelineError> {
        let rows = locked(&self.rows);
        Ok(rows.tasks.get(task_id).map(|task| TaskWithResult {
            task: task.clone(),
            result: rows.results.iter().find(|result| result.task_id == task_id).cloned(),
        }))
    }

    async fn ping(&self) -> Result<(), PipelineError> {
        if self.ping_fails.load(Ordering::SeqCst) {
            return Err(PipelineError::Transient("database unreachable".to_string()));
        }
        Ok(())
    }
}

#[derive(Default)]
pub(crate) struct MemoryExampleStore {
    themes: StdMutex<HashMap<String, BTreeMap<String, RetrievalExample>>>,
    delay: StdMutex<Duration>,
    list_calls: AtomicUsize,
    failing_lists: AtomicUsize,
}

impl MemoryExampleStore {
    pub(crate) fn seed(&self, theme: &str, examples: Vec<NewExample>) {
        let mut themes = locked(&self.themes);
        let stored = themes.entry(theme.to_string()).or_default();
        for example in examples {
            stored.insert(example.id.clone(), stored_example(theme, example));
        }
    }

    pub(crate) fn count(&self, theme: &str) -> usize {
        locked(&self.themes).get(theme).map_or(0, BTreeMap::len)
    }

    pub(crate) fn set_delay(&self, delay: Duration) {
        *locked(&self.delay) = delay;
    }

    pub(crate) fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    /// The next `count` loads fail transiently.
    pub(crate) fn fail_lists(&self, count: usize) {
        self.failing_lists.store(count, Ordering::SeqCst);
    }
}

fn stored_example(theme: &str, example: NewExample) -> RetrievalExample {
    let now = primitive_now_utc();
    RetrievalExample {
        theme: theme.to_string(),
        id: example.id,
        language: example.language,
        code: example.code,
        embedding: example.embedding.map(Json),
        created_at: now,
        updated_at: now,
    }
}

#[async_trait]
impl ExampleStore for MemoryExampleStore {
    async fn upsert(&self, theme: &str, examples: &[NewExample]) -> Result<u64, PipelineError> {
        let mut themes = locked(&self.themes);
        let stored = themes.entry(theme.to_string()).or_default();
        let mut inserted = 0;
        for example in examples {
            if stored.insert(example.id.clone(), stored_example(theme, example.clone())).is_none() {
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn remove(&self, theme: &str, filter: &ExampleFilter) -> Result<u64, PipelineError> {
        let mut themes = locked(&self.themes);
        let Some(stored) = themes.get_mut(theme) else {
            return Ok(0);
        };
        let before = stored.len();
        stored.retain(|id, example| !filter.matches(id, example.language.as_deref()));
        Ok((before - stored.len()) as u64)
    }

    async fn list(&self, theme: &str) -> Result<Vec<RetrievalExample>, PipelineError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *locked(&self.delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let failing = self.failing_lists.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_lists.store(failing.saturating_sub(1), Ordering::SeqCst);
            return Err(PipelineError::Transient("vector store unavailable".to_string()));
        }

        Ok(locked(&self.themes)
            .get(theme)
            .map(|stored| stored.values().cloned().collect())
            .unwrap_or_default())
    }
}

/// Scorer that replays scripted results, then falls back to a fixed answer.
pub(crate) struct ScriptedScorer {
    script: StdMutex<VecDeque<Result<ScoreOutcome, PipelineError>>>,
    fallback: Result<ScoreOutcome, PipelineError>,
    delay: Duration,
    panics: bool,
    calls: AtomicUsize,
    last_request: StdMutex<Option<ScoreRequest>>,
}

impl ScriptedScorer {
    pub(crate) fn new(script: Vec<Result<ScoreOutcome, PipelineError>>) -> Self {
        Self {
            script: StdMutex::new(script.into()),
            fallback: Ok(passing_outcome()),
            delay: Duration::ZERO,
            panics: false,
            calls: AtomicUsize::new(0),
            last_request: StdMutex::new(None),
        }
    }

    pub(crate) fn always(result: Result<ScoreOutcome, PipelineError>) -> Self {
        let mut scorer = Self::new(Vec::new());
        scorer.fallback = result;
        scorer
    }

    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Every call panics instead of answering.
    pub(crate) fn panicking(mut self) -> Self {
        self.panics = true;
        self
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn last_request(&self) -> Option<ScoreRequest> {
        locked(&self.last_request).clone()
    }
}

fn passing_outcome() -> ScoreOutcome {
    ScoreOutcome {
        score: 8.0,
        feedback: json!({"score": 8.0, "feedback": "well done"}),
        model: "gpt-4o-mini".to_string(),
    }
}

#[async_trait]
impl Scorer for ScriptedScorer {
    async fn score(&self, request: &ScoreRequest) -> Result<ScoreOutcome, PipelineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *locked(&self.last_request) = Some(request.clone());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.panics {
            panic!("scorer crashed on task {}", request.task_id);
        }

        let next = locked(&self.script).pop_front();
        let mut result = next.unwrap_or_else(|| self.fallback.clone());
        if let (Ok(outcome), Some(model)) = (&mut result, &request.model) {
            outcome.model = model.clone();
        }
        result
    }

    fn default_model(&self) -> &str {
        "gpt-4o-mini"
    }
}

pub(crate) struct StaticSubmissionSource {
    submission: String,
    rubric: Value,
    missing: StdMutex<HashSet<String>>,
}

impl Default for StaticSubmissionSource {
    fn default() -> Self {
        Self {
            submission: "def add(a, b):\n    return a + b\n".to_string(),
            rubric: json!({"correctness": {"criteria": ["adds two numbers"], "weight": 10}}),
            missing: StdMutex::new(HashSet::new()),
        }
    }
}

impl StaticSubmissionSource {
    pub(crate) fn mark_missing(&self, reference: &str) {
        locked(&self.missing).insert(reference.to_string());
    }
}

#[async_trait]
impl SubmissionSource for StaticSubmissionSource {
    async fn load(&self, task: &Task) -> Result<SubmissionBundle, PipelineError> {
        let missing = locked(&self.missing);
        for reference in [&task.submission_ref, &task.rubric_ref] {
            if missing.contains(reference) {
                return Err(PipelineError::NotFound(reference.clone()));
            }
        }
        Ok(SubmissionBundle { submission: self.submission.clone(), rubric: self.rubric.clone() })
    }
}

#[derive(Default)]
pub(crate) struct RecordingNotifier {
    seen: StdMutex<Vec<TaskCompletion>>,
}

#[async_trait]
impl ResultNotifier for RecordingNotifier {
    async fn notify(&self, completion: &TaskCompletion) -> anyhow::Result<()> {
        locked(&self.seen).push(completion.clone());
        Ok(())
    }
}

/// A fully wired evaluation pipeline backed by in-memory collaborators.
pub(crate) struct Pipeline {
    pub(crate) tasks: Arc<MemoryTaskStore>,
    pub(crate) examples: Arc<MemoryExampleStore>,
    pub(crate) scorer: Arc<ScriptedScorer>,
    pub(crate) source: Arc<StaticSubmissionSource>,
    pub(crate) cache: Arc<ResourceCache>,
    pub(crate) llm_breaker: Arc<CircuitBreaker>,
    pub(crate) retrieval_breaker: Arc<CircuitBreaker>,
    pub(crate) worker: Arc<EvaluationWorker>,
    notifier: Option<Arc<RecordingNotifier>>,
}

impl Pipeline {
    pub(crate) fn seed_examples(&self, theme: &str, examples: &[(&str, &str)]) {
        self.examples
            .seed(theme, examples.iter().map(|(id, code)| new_example(id, code)).collect());
    }

    pub(crate) async fn create_task(&self, theme: &str) -> String {
        self.create_task_with_submission(theme, "subs/main.py").await
    }

    pub(crate) async fn create_task_with_submission(&self, theme: &str, submission: &str) -> String {
        let task = self
            .tasks
            .create_task(NewTask {
                id: Uuid::new_v4().to_string(),
                theme: theme.to_string(),
                language: "python".to_string(),
                submission_ref: submission.to_string(),
                rubric_ref: "rubrics/basics.json".to_string(),
                model: "gpt-4o-mini".to_string(),
            })
            .await
            .expect("create task");
        task.id
    }

    pub(crate) fn dispatcher(
        &self,
        capacity: usize,
    ) -> (TaskDispatcher, mpsc::Receiver<EvaluationJob>) {
        let (tx, rx) = mpsc::channel(capacity);
        (TaskDispatcher::new(self.tasks.clone(), tx, "gpt-4o-mini"), rx)
    }

    /// Application state over this pipeline, with health probing the task store.
    pub(crate) fn app_state(
        &self,
        settings: Settings,
        capacity: usize,
    ) -> (AppState, mpsc::Receiver<EvaluationJob>) {
        let (dispatcher, receiver) = self.dispatcher(capacity);
        let health = HealthReporter::new(
            vec![self.llm_breaker.clone(), self.retrieval_breaker.clone()],
            self.cache.clone(),
        )
        .with_database(self.tasks.clone());
        let state = AppState::new(settings, self.tasks.clone(), dispatcher, self.cache.clone(), health);
        (state, receiver)
    }

    pub(crate) async fn wait_for_terminal(&self, task_id: &str) -> TaskStatus {
        for _ in 0..10_000 {
            if let Some(task) = self.tasks.task(task_id) {
                if task.status.is_terminal() {
                    return task.status;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("task {task_id} never reached a terminal state");
    }

    pub(crate) fn notifications(&self) -> Vec<TaskCompletion> {
        self.notifier.as_ref().map(|notifier| locked(&notifier.seen).clone()).unwrap_or_default()
    }
}

pub(crate) struct PipelineBuilder {
    scorer: ScriptedScorer,
    llm_threshold: u32,
    retry_attempts: u32,
    task_timeout: Duration,
    persist_timeout: Duration,
    notifier: bool,
}

impl PipelineBuilder {
    pub(crate) fn new() -> Self {
        Self {
            scorer: ScriptedScorer::new(Vec::new()),
            llm_threshold: 5,
            retry_attempts: 3,
            task_timeout: Duration::from_secs(900),
            persist_timeout: Duration::from_secs(30),
            notifier: false,
        }
    }

    pub(crate) fn scorer(mut self, scorer: ScriptedScorer) -> Self {
        self.scorer = scorer;
        self
    }

    pub(crate) fn llm_threshold(mut self, threshold: u32) -> Self {
        self.llm_threshold = threshold;
        self
    }

    pub(crate) fn retry_attempts(mut self, attempts: u32) -> Self {
        self.retry_attempts = attempts;
        self
    }

    pub(crate) fn task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = timeout;
        self
    }

    pub(crate) fn persist_timeout(mut self, timeout: Duration) -> Self {
        self.persist_timeout = timeout;
        self
    }

    pub(crate) fn with_notifier(mut self) -> Self {
        self.notifier = true;
        self
    }

    pub(crate) fn build(self) -> Pipeline {
        let tasks = Arc::new(MemoryTaskStore::default());
        let examples = Arc::new(MemoryExampleStore::default());
        let scorer = Arc::new(self.scorer);
        let source = Arc::new(StaticSubmissionSource::default());
        let retry = RetryPolicy::new(
            self.retry_attempts,
            Duration::from_millis(10),
            Duration::from_millis(100),
        );

        let llm_breaker = Arc::new(CircuitBreaker::new(
            "llm",
            BreakerConfig {
                failure_threshold: self.llm_threshold,
                open_duration: Duration::from_secs(60),
            },
        ));
        let retrieval_breaker = Arc::new(CircuitBreaker::new(
            "retrieval",
            BreakerConfig { failure_threshold: 5, open_duration: Duration::from_secs(30) },
        ));
        let cache = Arc::new(ResourceCache::new(
            examples.clone(),
            retrieval_breaker.clone(),
            retry,
            8,
            3,
        ));

        let notifier = self.notifier.then(|| Arc::new(RecordingNotifier::default()));
        let worker = Arc::new(EvaluationWorker::new(WorkerDeps {
            tasks: tasks.clone(),
            source: source.clone(),
            cache: cache.clone(),
            scorer: scorer.clone(),
            llm_breaker: llm_breaker.clone(),
            retry,
            notifier: notifier.clone().map(|notifier| notifier as Arc<dyn ResultNotifier>),
            task_timeout: self.task_timeout,
            persist_timeout: self.persist_timeout,
        }));

        Pipeline {
            tasks,
            examples,
            scorer,
            source,
            cache,
            llm_breaker,
            retrieval_breaker,
            worker,
            notifier,
        }
    }
}
