use std::sync::Arc;

use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

use crate::tasks::dispatcher::{EvaluationJob, InFlight};
use crate::tasks::evaluation::EvaluationWorker;

pub(crate) fn job_queue(capacity: usize) -> (mpsc::Sender<EvaluationJob>, mpsc::Receiver<EvaluationJob>) {
    mpsc::channel(capacity.max(1))
}

/// Fixed set of workers draining the job queue. Each job is owned by the
/// worker that dequeued it.
pub(crate) struct WorkerPool {
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
    in_flight: InFlight,
}

impl WorkerPool {
    pub(crate) fn spawn(
        worker: Arc<EvaluationWorker>,
        receiver: mpsc::Receiver<EvaluationJob>,
        concurrency: usize,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let receiver = Arc::new(Mutex::new(receiver));
        let in_flight = InFlight::default();

        let handles = (0..concurrency.max(1))
            .map(|worker_id| {
                tokio::spawn(worker_loop(
                    worker_id,
                    worker.clone(),
                    receiver.clone(),
                    in_flight.clone(),
                    shutdown_rx.clone(),
                ))
            })
            .collect();

        tracing::info!(concurrency, "Evaluation workers started");
        Self { shutdown_tx, handles, in_flight }
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Stops taking jobs and waits for the ones in progress.
    pub(crate) async fn shutdown(self) {
        tracing::info!(in_flight = self.in_flight(), "Stopping evaluation workers");
        if self.shutdown_tx.send(true).is_err() {
            tracing::warn!("Failed to broadcast shutdown signal to evaluation workers");
        }

        for handle in self.handles {
            if let Err(err) = handle.await {
                tracing::error!(error = %err, "Evaluation worker join failed");
            }
        }
        tracing::info!("Evaluation workers stopped");
    }
}

async fn worker_loop(
    worker_id: usize,
    worker: Arc<EvaluationWorker>,
    receiver: Arc<Mutex<mpsc::Receiver<EvaluationJob>>>,
    in_flight: InFlight,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }

        let job = tokio::select! {
            _ = shutdown.changed() => break,
            job = next_job(&receiver) => job,
        };
        let Some(job) = job else {
            break;
        };

        let Some(_claim) = in_flight.claim(&job.task_id) else {
            tracing::warn!(worker_id, task_id = %job.task_id, "Task already in flight, dropping job");
            continue;
        };

        metrics::histogram!("evaluation_queue_latency_seconds")
            .record(job.enqueued_at.elapsed().as_secs_f64());

        // Run on its own task so a panic is contained to this job.
        let task_id = job.task_id.clone();
        let handle = tokio::spawn({
            let worker = worker.clone();
            async move { worker.process(&job.task_id).await }
        });
        match handle.await {
            Ok(Ok(_)) => {}
            Ok(Err(err)) => {
                tracing::error!(worker_id, task_id = %task_id, error = %err, "Evaluation job failed");
            }
            Err(err) => {
                tracing::error!(worker_id, task_id = %task_id, error = %err, "Evaluation job panicked");
                if let Err(fail_err) = worker.fail_abandoned(&task_id, &err.to_string()).await {
                    tracing::error!(
                        worker_id,
                        task_id = %task_id,
                        error = %fail_err,
                        "Task left running; it needs reconciliation"
                    );
                }
            }
        }
    }

    tracing::debug!(worker_id, "Evaluation worker exiting");
}

async fn next_job(receiver: &Mutex<mpsc::Receiver<EvaluationJob>>) -> Option<EvaluationJob> {
    receiver.lock().await.recv().await
}
