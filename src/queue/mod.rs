pub mod task;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::server::AppState;

use task::Task;

/// Pending runs per entity.
///
/// Runs for one entity are handed out one at a time; a new run for the entity is
/// only released after `finish` is called for the previous one.
pub struct TaskQueue {
    queues: HashMap<String, VecDeque<Task>>,
    /// Entities with a run currently executing.
    running: HashSet<String>,
    /// Notification channel for the processor.
    notify: Option<tokio::sync::mpsc::UnboundedSender<()>>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self {
            queues: HashMap::new(),
            running: HashSet::new(),
            notify: None,
        }
    }

    pub fn set_notifier(&mut self, tx: tokio::sync::mpsc::UnboundedSender<()>) {
        self.notify = Some(tx);
    }

    pub fn enqueue(&mut self, task: Task) {
        tracing::info!(entity_id = task.entity_id(), task = %task.description(), "Enqueuing run");
        self.queues
            .entry(task.entity_id().to_string())
            .or_default()
            .push_back(task);
        self.wake();
    }

    /// Drop all pending runs for an entity. Returns how many were removed.
    pub fn cancel_entity(&mut self, entity_id: &str) -> usize {
        let removed = self.queues.remove(entity_id).map_or(0, |q| q.len());
        if removed > 0 {
            tracing::info!(entity_id, removed, "Cancelled queued runs");
        }
        removed
    }

    /// Take the next run whose entity has nothing executing.
    pub fn take_next(&mut self) -> Option<Task> {
        let entity = self
            .queues
            .iter()
            .find(|(entity, q)| !q.is_empty() && !self.running.contains(*entity))
            .map(|(k, _)| k.clone())?;

        let task = self.queues.get_mut(&entity).and_then(|q| q.pop_front());
        // Clean up empty queues
        if self.queues.get(&entity).map_or(false, |q| q.is_empty()) {
            self.queues.remove(&entity);
        }
        if task.is_some() {
            self.running.insert(entity);
        }
        task
    }

    /// Mark the entity's run as done so its next run can start.
    pub fn finish(&mut self, entity_id: &str) {
        self.running.remove(entity_id);
        if self.queues.contains_key(entity_id) {
            self.wake();
        }
    }

    pub fn pending(&self) -> usize {
        self.queues.values().map(VecDeque::len).sum()
    }

    fn wake(&self) {
        if let Some(ref tx) = self.notify {
            let _ = tx.send(());
        }
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Run the background queue processor until shutdown.
pub async fn run_queue_processor(state: Arc<AppState>) {
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<()>();

    {
        let mut queue = state.task_queue.write().await;
        queue.set_notifier(tx);
        // Runs enqueued before the processor started.
        queue.wake();
    }

    let permits = Arc::new(Semaphore::new(state.config.runs.max_concurrent));
    tracing::info!(
        max_concurrent = state.config.runs.max_concurrent,
        "Queue processor started"
    );

    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => break,
            received = rx.recv() => {
                if received.is_none() {
                    break;
                }
            }
        }

        // Start every run that is ready
        loop {
            let permit = tokio::select! {
                _ = state.shutdown.cancelled() => break,
                permit = Arc::clone(&permits).acquire_owned() => match permit {
                    Ok(p) => p,
                    Err(_) => break,
                },
            };

            // Track the run before the queue lock is released, so a cancel
            // request either drops it from the queue or finds its token.
            let next = {
                let mut queue = state.task_queue.write().await;
                match queue.take_next() {
                    Some(task) => {
                        let cancel = state.track(task.entity_id()).await;
                        Some((task, cancel))
                    }
                    None => None,
                }
            };

            let (task, cancel) = match next {
                Some(next) => next,
                None => break,
            };

            let run_state = Arc::clone(&state);
            tokio::spawn(async move {
                process_task(&run_state, task, cancel).await;
                drop(permit);
            });
        }
    }

    tracing::info!("Queue processor stopped");
}

async fn process_task(state: &AppState, task: Task, cancel: CancellationToken) {
    let entity_id = task.entity_id().to_string();

    tracing::info!(task = %task.description(), "Processing run");

    match state.engine.execute(&task, &cancel).await {
        Ok(result) => {
            tracing::info!(
                task = %task.description(),
                result = %serde_json::to_string(&result).unwrap_or_default(),
                "Run completed"
            );
        }
        Err(e) if e.is_business_outcome() => {
            tracing::warn!(
                task = %task.description(),
                kind = e.kind(),
                error = %e,
                "Run ended in a terminal state"
            );
        }
        Err(e) => {
            tracing::error!(
                task = %task.description(),
                kind = e.kind(),
                error = %e,
                "Run failed"
            );
        }
    }

    state.untrack(&entity_id).await;
    state.task_queue.write().await.finish(&entity_id);
}
