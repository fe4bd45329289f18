//! Fans instances out over a fixed pool of workers and persists one
//! prediction per instance.

use super::record::{Prediction, Resolution};
use crate::dataset::BenchmarkInstance;
use crate::store::ResultStore;
use crate::util::panic_message;
use anyhow::{anyhow, Result};
use futures::future::join_all;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Full pipeline for one instance. `solve` always yields a prediction.
pub trait InstanceSolver: Send + Sync + 'static {
    fn solve(&self, instance: &BenchmarkInstance) -> Prediction;

    /// Entry recorded when `solve` itself blew up.
    fn placeholder(&self, instance: &BenchmarkInstance, error: &str) -> Prediction;
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunSummary {
    pub requested: usize,
    pub skipped: usize,
    pub processed: usize,
    pub plausible: usize,
    pub fallback: usize,
    pub no_winner: usize,
    pub total_cost: f64,
}

impl RunSummary {
    fn record(&mut self, prediction: &Prediction) {
        self.processed += 1;
        self.total_cost += prediction.cost;
        match prediction.resolution {
            Resolution::Plausible => self.plausible += 1,
            Resolution::Fallback => self.fallback += 1,
            Resolution::NoWinner => self.no_winner += 1,
        }
    }
}

type SharedReceiver = Arc<tokio::sync::Mutex<mpsc::Receiver<BenchmarkInstance>>>;

pub struct Dispatcher {
    solver: Arc<dyn InstanceSolver>,
    store: Arc<ResultStore>,
    concurrency: usize,
    finished: HashSet<String>,
}

struct WorkerContext {
    solver: Arc<dyn InstanceSolver>,
    store: Arc<ResultStore>,
    queue: SharedReceiver,
    abort: Arc<AtomicBool>,
    summary: Arc<Mutex<RunSummary>>,
    completed: Arc<AtomicUsize>,
    total: usize,
}

impl Dispatcher {
    pub fn new(solver: Arc<dyn InstanceSolver>, store: Arc<ResultStore>, concurrency: usize) -> Self {
        Self {
            solver,
            store,
            concurrency: concurrency.max(1),
            finished: HashSet::new(),
        }
    }

    /// Instance ids that already have a result and must not run again.
    pub fn with_finished(mut self, finished: HashSet<String>) -> Self {
        self.finished = finished;
        self
    }

    /// Process `instances` with `concurrency` workers. Returns an error only
    /// when a prediction could not be persisted; the run stops taking new
    /// instances in that case.
    pub async fn run(&self, instances: Vec<BenchmarkInstance>) -> Result<RunSummary> {
        let mut summary = RunSummary {
            requested: instances.len(),
            ..Default::default()
        };
        let mut queued: HashSet<String> = HashSet::new();
        let mut pending = Vec::with_capacity(instances.len());
        for instance in instances {
            if self.finished.contains(&instance.instance_id) {
                info!(instance_id = %instance.instance_id, "already finished, skipping");
                summary.skipped += 1;
                continue;
            }
            if !queued.insert(instance.instance_id.clone()) {
                warn!(instance_id = %instance.instance_id, "duplicate instance, skipping");
                summary.skipped += 1;
                continue;
            }
            pending.push(instance);
        }
        info!(
            pending = pending.len(),
            skipped = summary.skipped,
            concurrency = self.concurrency,
            "dispatching instances"
        );

        let total = pending.len();
        let summary = Arc::new(Mutex::new(summary));
        let abort = Arc::new(AtomicBool::new(false));
        let completed = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = mpsc::channel::<BenchmarkInstance>(self.concurrency);
        let queue: SharedReceiver = Arc::new(tokio::sync::Mutex::new(rx));

        let workers: Vec<_> = (0..self.concurrency)
            .map(|worker| {
                let ctx = WorkerContext {
                    solver: Arc::clone(&self.solver),
                    store: Arc::clone(&self.store),
                    queue: Arc::clone(&queue),
                    abort: Arc::clone(&abort),
                    summary: Arc::clone(&summary),
                    completed: Arc::clone(&completed),
                    total,
                };
                tokio::spawn(worker_loop(worker, ctx))
            })
            .collect();
        // Only workers hold the receiver, so sends fail once they have all stopped.
        drop(queue);

        for instance in pending {
            if abort.load(Ordering::SeqCst) {
                break;
            }
            if tx.send(instance).await.is_err() {
                break;
            }
        }
        drop(tx);

        let mut failure: Option<anyhow::Error> = None;
        for joined in join_all(workers).await {
            let outcome = joined.map_err(|err| anyhow!("worker task failed: {}", err));
            if let Err(err) = outcome.and_then(|result| result) {
                failure.get_or_insert(err);
            }
        }

        let summary = summary
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match failure {
            Some(err) => Err(err),
            None => Ok(summary),
        }
    }
}

async fn worker_loop(worker: usize, ctx: WorkerContext) -> Result<()> {
    loop {
        if ctx.abort.load(Ordering::SeqCst) {
            return Ok(());
        }
        let next = ctx.queue.lock().await.recv().await;
        let Some(instance) = next else {
            return Ok(());
        };
        let instance_id = instance.instance_id.clone();

        let prediction = solve_isolated(Arc::clone(&ctx.solver), instance).await;
        ctx.summary
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .record(&prediction);

        let store = Arc::clone(&ctx.store);
        let persisted = tokio::task::spawn_blocking(move || store.append_with_retry(&prediction))
            .await
            .map_err(|err| anyhow!("persistence task failed: {}", err))
            .and_then(|result| result);
        if let Err(err) = persisted {
            ctx.abort.store(true, Ordering::SeqCst);
            error!(worker, instance_id = %instance_id, error = %format!("{:#}", err), "stopping run");
            return Err(err);
        }

        let done = ctx.completed.fetch_add(1, Ordering::SeqCst) + 1;
        info!(worker, instance_id = %instance_id, done, total = ctx.total, "prediction saved");
    }
}

/// Run the solver on the blocking pool; a panic becomes a placeholder prediction.
async fn solve_isolated(solver: Arc<dyn InstanceSolver>, instance: BenchmarkInstance) -> Prediction {
    let task_solver = Arc::clone(&solver);
    let task_instance = instance.clone();
    match tokio::task::spawn_blocking(move || task_solver.solve(&task_instance)).await {
        Ok(prediction) => prediction,
        Err(err) => {
            let message = if err.is_panic() {
                format!("instance pipeline panicked: {}", panic_message(&*err.into_panic()))
            } else {
                format!("instance pipeline was cancelled: {}", err)
            };
            error!(instance_id = %instance.instance_id, error = %message, "instance failed");
            solver.placeholder(&instance, &message)
        }
    }
}
