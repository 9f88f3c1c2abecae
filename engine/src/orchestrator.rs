//! The execution orchestrator: owns the queue, the worker pool, the task
//! registry and the persistent record transitions.
//!
//! Errors inside a task never escape the worker loop; they are materialized
//! as a terminal state transition on the record. Cancellation is cooperative
//! for store and vault calls and forceful for the sandbox.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex as StdMutex, RwLock,
    },
    time::Duration,
};

use chrono::Utc;
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use oscar_lib::{parse_progress, ExecutionRecord, ExecutionStatus};
use oscar_sandbox::{LogSink, SandboxConfig, SandboxDriver, SandboxExit};
use oscar_store::{ConnectionStore, CredentialVault, RecordStore, StoreError};

use crate::{
    broadcaster::{EventBroadcaster, ProgressEvent},
    queue::{ExecutionQueue, QueueFull},
    task::{RunningTask, TaskSnapshot},
};

/// The host the sandbox uses to reach a database listening on the
/// orchestrator's loopback interface.
const SANDBOX_LOOPBACK_HOST: &str = "host.docker.internal";

/// Placeholder the builder leaves in the persisted command; replaced with an
/// environment reference at launch.
const PASSWORD_PLACEHOLDER: &str = "--password=***";
const PASSWORD_ENV_REF: &str = "--password=$MYSQL_PWD";

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub worker_count: usize,
    pub queue_capacity: usize,
    pub sandbox_cpu_limit: f64,
    pub sandbox_memory_bytes: u64,
    pub sandbox_network_mode: String,
    pub sandbox_working_dir: String,
    /// Grace period for a stop before the sandbox is killed
    pub stop_grace: Duration,
    pub shutdown_timeout: Duration,
    /// Upper bound on captured logs, persisted and in memory
    pub log_buffer_limit: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            worker_count: 10,
            queue_capacity: 100,
            sandbox_cpu_limit: oscar_sandbox::DEFAULT_CPU_LIMIT,
            sandbox_memory_bytes: oscar_sandbox::DEFAULT_MEMORY_BYTES,
            sandbox_network_mode: "bridge".to_string(),
            sandbox_working_dir: "/tmp".to_string(),
            stop_grace: Duration::from_secs(10),
            shutdown_timeout: Duration::from_secs(30),
            log_buffer_limit: 64 * 1024,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    QueueFull(#[from] QueueFull),
    #[error("orchestrator is shutting down")]
    ShuttingDown,
    #[error("execution {id} cannot {action} from status {status}")]
    InvalidState {
        id: String,
        action: &'static str,
        status: ExecutionStatus,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("shutdown timed out, remaining tasks were force-stopped")]
    ShutdownTimeout,
}

/// Failure of one task attempt. Caught at the worker boundary and turned
/// into a terminal record state, never propagated further.
#[derive(Debug, thiserror::Error)]
enum TaskError {
    #[error("credential materialization failed: {0}")]
    Credential(String),
    #[error("sandbox error: {0}")]
    Sandbox(#[from] oscar_sandbox::SandboxError),
    #[error("tool execution failed, exit code: {code}, stderr: {stderr}")]
    ToolExit { code: i64, stderr: String },
    #[error("cancelled")]
    Cancelled,
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Byte-bounded line buffer; keeps the tail, drops the oldest lines.
struct LogBuffer {
    lines: VecDeque<String>,
    bytes: usize,
    limit: usize,
}

impl LogBuffer {
    fn new(limit: usize) -> Self {
        Self {
            lines: VecDeque::new(),
            bytes: 0,
            limit,
        }
    }

    fn push(&mut self, line: &str) {
        self.bytes += line.len() + 1;
        self.lines.push_back(line.to_string());
        while self.bytes > self.limit {
            match self.lines.pop_front() {
                Some(dropped) => self.bytes -= dropped.len() + 1,
                None => break,
            }
        }
    }

    fn contents(&self) -> String {
        let mut out = String::with_capacity(self.bytes);
        for line in &self.lines {
            out.push_str(line);
            out.push('\n');
        }
        out
    }
}

/// Keep the trailing `limit` bytes of `text`, on a character boundary.
fn clip_tail(text: &str, limit: usize) -> String {
    if text.len() <= limit {
        return text.to_string();
    }
    let mut start = text.len() - limit;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    text[start..].to_string()
}

pub struct Orchestrator {
    config: OrchestratorConfig,
    store: Arc<dyn RecordStore>,
    connections: Arc<dyn ConnectionStore>,
    vault: Arc<CredentialVault>,
    sandbox: Arc<dyn SandboxDriver>,
    broadcaster: Arc<EventBroadcaster>,

    queue: Mutex<ExecutionQueue>,
    notifier: Notify,
    registry: RwLock<HashMap<String, Arc<RunningTask>>>,
    root: CancellationToken,
    workers: Mutex<Vec<tokio::task::JoinHandle<()>>>,
    accepting: AtomicBool,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn RecordStore>,
        connections: Arc<dyn ConnectionStore>,
        vault: Arc<CredentialVault>,
        sandbox: Arc<dyn SandboxDriver>,
        broadcaster: Arc<EventBroadcaster>,
        config: OrchestratorConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            queue: Mutex::new(ExecutionQueue::new(config.queue_capacity)),
            config,
            store,
            connections,
            vault,
            sandbox,
            broadcaster,
            notifier: Notify::new(),
            registry: RwLock::new(HashMap::new()),
            root: CancellationToken::new(),
            workers: Mutex::new(Vec::new()),
            accepting: AtomicBool::new(true),
        })
    }

    /// Start the fixed worker pool.
    pub async fn serve(self: &Arc<Self>) {
        let mut workers = self.workers.lock().await;
        for index in 0..self.config.worker_count {
            let this = self.clone();
            workers.push(tokio::spawn(async move {
                worker_loop(this, index).await;
            }));
        }
        info!(workers = self.config.worker_count, "orchestrator serving");
    }

    /// Persist a validated record and enqueue it. The capacity check and the
    /// insert happen under the queue lock, so a rejected submission never
    /// creates a record.
    pub async fn submit(&self, record: &ExecutionRecord) -> Result<(), OrchestratorError> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(OrchestratorError::ShuttingDown);
        }
        let mut queue = self.queue.lock().await;
        if queue.is_at_capacity() {
            oscar_metrics::EXECUTIONS_REJECTED_COUNT
                .with_label_values(&["queue_full"])
                .inc();
            return Err(QueueFull.into());
        }
        self.store.insert(record).await?;
        queue.push(&record.id)?;
        drop(queue);

        oscar_metrics::EXECUTIONS_SUBMITTED_COUNT.inc();
        self.notifier.notify_one();
        debug!(id = %record.id, "execution submitted");
        Ok(())
    }

    /// Cancel a running execution: cancel the task, stop the sandbox with a
    /// grace period, persist `cancelled`. Falls back to a store-only
    /// transition when the task is not in the registry.
    pub async fn stop(&self, id: &str) -> Result<(), OrchestratorError> {
        let task = self.registry.read().unwrap().get(id).cloned();
        let Some(task) = task else {
            let mut record = self.store.get(id).await?;
            if record.status != ExecutionStatus::Running {
                return Err(OrchestratorError::InvalidState {
                    id: id.to_string(),
                    action: "stop",
                    status: record.status,
                });
            }
            record.mark_terminal(ExecutionStatus::Cancelled, Utc::now(), None);
            self.store.update(&record).await?;
            return Ok(());
        };

        info!(%id, "stopping execution");
        task.cancel.cancel();
        if let Some(sandbox_id) = task.sandbox_id() {
            if let Err(err) = self.sandbox.stop(&sandbox_id, self.config.stop_grace).await {
                warn!(%id, %err, "failed to stop sandbox, it will be force-removed");
            }
        }
        task.set_status(ExecutionStatus::Cancelled);

        let mut record = self.store.get(id).await?;
        if !record.status.is_terminal() {
            record.mark_terminal(ExecutionStatus::Cancelled, Utc::now(), None);
            self.store.update(&record).await?;
        }
        Ok(())
    }

    /// Reset a failed or cancelled record to `pending` and requeue it.
    pub async fn retry(&self, id: &str) -> Result<ExecutionRecord, OrchestratorError> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(OrchestratorError::ShuttingDown);
        }
        let mut record = self.store.get(id).await?;
        if !record.can_retry() {
            return Err(OrchestratorError::InvalidState {
                id: id.to_string(),
                action: "retry",
                status: record.status,
            });
        }
        record.reset_for_retry(Utc::now());
        self.store.update(&record).await?;

        self.queue.lock().await.push(id)?;
        self.notifier.notify_one();
        info!(%id, "execution reset and requeued");
        Ok(record)
    }

    /// Live state of one running task, if any.
    pub fn task_snapshot(&self, id: &str) -> Option<TaskSnapshot> {
        self.registry
            .read()
            .unwrap()
            .get(id)
            .map(|task| task.snapshot())
    }

    pub fn running_tasks(&self) -> Vec<TaskSnapshot> {
        self.registry
            .read()
            .unwrap()
            .values()
            .map(|task| task.snapshot())
            .collect()
    }

    pub fn running_count(&self) -> usize {
        self.registry.read().unwrap().len()
    }

    /// Stop accepting work, wait for running tasks to drain, then join the
    /// workers. Remaining tasks are force-stopped once the timeout passes.
    pub async fn shutdown(&self) -> Result<(), OrchestratorError> {
        info!("orchestrator shutting down");
        self.accepting.store(false, Ordering::SeqCst);
        self.root.cancel();
        self.notifier.notify_waiters();

        let deadline = tokio::time::Instant::now() + self.config.shutdown_timeout;
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        loop {
            ticker.tick().await;
            if self.running_count() == 0 {
                let handles: Vec<_> = self.workers.lock().await.drain(..).collect();
                for handle in handles {
                    let _ = handle.await;
                }
                if let Err(err) = self.sandbox.close().await {
                    warn!(%err, "failed to close sandbox driver");
                }
                info!("orchestrator shut down cleanly");
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                let ids: Vec<String> = self.registry.read().unwrap().keys().cloned().collect();
                warn!(remaining = ids.len(), "shutdown timeout, force-stopping tasks");
                for id in ids {
                    if let Err(err) = self.stop(&id).await {
                        warn!(%id, %err, "failed to force-stop task");
                    }
                }
                return Err(OrchestratorError::ShutdownTimeout);
            }
        }
    }

    fn remove_task(&self, id: &str) {
        let mut registry = self.registry.write().unwrap();
        registry.remove(id);
        oscar_metrics::RUNNING_TASKS.set(registry.len() as i64);
    }

    /// Record a stage transition: visible on the task snapshot and as an
    /// `execution_log` event, never as synthetic progress.
    fn stage(&self, task: &RunningTask, stage: &str) {
        task.set_stage(stage);
        let line = format!("[{}] {}", Utc::now().format("%H:%M:%S"), stage);
        self.broadcaster.publish_log(&task.id, &line);
    }

    /// Drive one pending record to a terminal state.
    async fn run_one(&self, id: &str) {
        if self.registry.read().unwrap().contains_key(id) {
            warn!(%id, "already running, skipping duplicate queue entry");
            return;
        }
        let mut record = match self.store.get(id).await {
            Ok(record) => record,
            Err(err) => {
                warn!(%id, %err, "dropping queued id");
                return;
            }
        };
        if record.status != ExecutionStatus::Pending {
            debug!(%id, status = %record.status, "not pending, skipping");
            return;
        }

        let task = Arc::new(RunningTask::new(id, self.root.child_token()));
        {
            let mut registry = self.registry.write().unwrap();
            registry.insert(id.to_string(), task.clone());
            oscar_metrics::RUNNING_TASKS.set(registry.len() as i64);
        }

        record.mark_running(Utc::now());
        if let Err(err) = self.store.update(&record).await {
            error!(%id, %err, "failed to persist running status");
            self.remove_task(id);
            return;
        }

        let log_buffer = Arc::new(StdMutex::new(LogBuffer::new(self.config.log_buffer_limit)));
        let result = self.execute(&mut record, &task, &log_buffer).await;
        self.finalize(record, &task, &log_buffer, result).await;
        self.remove_task(id);
    }

    /// The supervised part of a task: credentials, sandbox lifecycle, log
    /// streaming, wait.
    async fn execute(
        &self,
        record: &mut ExecutionRecord,
        task: &Arc<RunningTask>,
        log_buffer: &Arc<StdMutex<LogBuffer>>,
    ) -> Result<SandboxExit, TaskError> {
        self.stage(task, "preparing execution environment");

        let connection = self.connections.get(&record.connection_id).await?;
        let password = self
            .vault
            .decrypt(&connection.encrypted_password)
            .map_err(|err| TaskError::Credential(err.to_string()))?;
        if task.cancel.is_cancelled() {
            return Err(TaskError::Cancelled);
        }

        // Materialize the executable command. The persisted form is the
        // redacted preview; the plaintext goes only into the sandbox env.
        let mut command = record.generated_command.clone();
        let host = connection.host.to_lowercase();
        if host == "localhost" || host == "127.0.0.1" {
            command = command.replacen(
                &format!("--host={}", connection.host),
                &format!("--host={SANDBOX_LOOPBACK_HOST}"),
                1,
            );
        }
        command = command.replace(PASSWORD_PLACEHOLDER, PASSWORD_ENV_REF);

        self.stage(task, "creating sandbox");
        let mut env = HashMap::new();
        env.insert("MYSQL_PWD".to_string(), password);
        let sandbox_config = SandboxConfig {
            command,
            env,
            cpu_limit: self.config.sandbox_cpu_limit,
            memory_bytes: self.config.sandbox_memory_bytes,
            network_mode: self.config.sandbox_network_mode.clone(),
            working_dir: self.config.sandbox_working_dir.clone(),
            auto_remove: false,
        };
        let sandbox_id = self.sandbox.create(&sandbox_config).await?;
        task.set_sandbox_id(&sandbox_id);
        record.sandbox_id = Some(sandbox_id.clone());
        if let Err(err) = self.store.update(record).await {
            warn!(id = %record.id, %err, "failed to persist sandbox id");
        }
        if task.cancel.is_cancelled() {
            return Err(TaskError::Cancelled);
        }

        self.stage(task, "starting sandbox");
        self.sandbox.start(&sandbox_id).await?;

        self.stage(task, "executing DDL operation");
        let sink = self.log_sink(record, task, log_buffer);
        if let Err(err) = self.sandbox.stream_logs(&sandbox_id, sink).await {
            // A broken follower degrades observability but not the run.
            let line = format!("log streaming unavailable: {err}");
            log_buffer.lock().unwrap().push(&line);
            self.broadcaster.publish_log(&record.id, &line);
        }

        let exit = self.sandbox.wait(&sandbox_id).await?;
        Ok(exit)
    }

    /// The concrete per-task log callback: buffer, broadcast, parse.
    fn log_sink(
        &self,
        record: &ExecutionRecord,
        task: &Arc<RunningTask>,
        log_buffer: &Arc<StdMutex<LogBuffer>>,
    ) -> LogSink {
        let id = record.id.clone();
        let task = task.clone();
        let broadcaster = self.broadcaster.clone();
        let log_buffer = log_buffer.clone();
        Arc::new(move |line: String| {
            log_buffer.lock().unwrap().push(&line);
            broadcaster.publish_log(&id, &line);

            let (percent, rate) = parse_progress(&line);
            if percent > 0.0 || rate > 0.0 {
                task.set_progress(percent, rate);
                let snapshot = task.snapshot();
                broadcaster.publish_progress(ProgressEvent {
                    execution_id: id.clone(),
                    status: snapshot.status,
                    percent: snapshot.percent,
                    rate: snapshot.rate,
                    stage: snapshot.stage,
                    timestamp: Utc::now(),
                });
            }
        })
    }

    /// Persist the terminal state and release the sandbox. A cancelled task
    /// keeps the status set by `stop`; whatever logs were captured are
    /// attached either way.
    async fn finalize(
        &self,
        mut record: ExecutionRecord,
        task: &Arc<RunningTask>,
        log_buffer: &Arc<StdMutex<LogBuffer>>,
        result: Result<SandboxExit, TaskError>,
    ) {
        let now = Utc::now();
        let was_cancelled =
            task.status() == ExecutionStatus::Cancelled || task.cancel.is_cancelled();

        // An external stop may have persisted the terminal transition while
        // we were waiting; pick it up instead of overwriting it.
        if let Ok(stored) = self.store.get(&record.id).await {
            if stored.status.is_terminal() {
                record = stored;
            }
        }

        let mut captured: Option<String> = None;
        let (status, error_message) = match &result {
            Ok(exit) => {
                captured = Some(exit.output.clone());
                if was_cancelled {
                    (ExecutionStatus::Cancelled, None)
                } else if exit.exit_code == 0 {
                    (ExecutionStatus::Completed, None)
                } else {
                    let err = TaskError::ToolExit {
                        code: exit.exit_code,
                        stderr: clip_tail(&exit.error, 1024),
                    };
                    (ExecutionStatus::Failed, Some(err.to_string()))
                }
            }
            Err(TaskError::Cancelled) => (ExecutionStatus::Cancelled, None),
            Err(err) if was_cancelled => {
                debug!(id = %record.id, %err, "task error after cancellation");
                (ExecutionStatus::Cancelled, None)
            }
            Err(err) => (ExecutionStatus::Failed, Some(err.to_string())),
        };

        let logs = captured.unwrap_or_else(|| log_buffer.lock().unwrap().contents());
        if !logs.is_empty() {
            record.execution_logs = Some(clip_tail(&logs, self.config.log_buffer_limit));
        }

        let snapshot = task.snapshot();
        if status == ExecutionStatus::Completed {
            record.processed_rows = record.total_rows;
        } else if snapshot.percent > 0.0 && record.total_rows > 0 {
            record.processed_rows =
                ((snapshot.percent / 100.0) * record.total_rows as f64) as u64;
        }
        if snapshot.rate > 0.0 {
            record.avg_speed = Some(snapshot.rate);
        }

        if !record.status.is_terminal() {
            record.mark_terminal(status, now, error_message);
        }
        task.set_status(record.status);

        if let Err(err) = self.store.update(&record).await {
            error!(id = %record.id, %err, "failed to persist terminal status");
        }

        match record.status {
            ExecutionStatus::Completed => {
                info!(id = %record.id, "execution completed");
                self.broadcaster.publish_log(&record.id, "execution completed");
            }
            ExecutionStatus::Failed => {
                let message = record.error_message.as_deref().unwrap_or("unknown error");
                error!(id = %record.id, error = message, "execution failed");
                self.broadcaster
                    .publish_log(&record.id, &format!("execution failed: {message}"));
            }
            _ => {
                info!(id = %record.id, "execution cancelled");
                self.broadcaster.publish_log(&record.id, "execution cancelled");
            }
        }

        let final_percent = if record.status == ExecutionStatus::Completed {
            100.0
        } else {
            snapshot.percent
        };
        self.broadcaster.publish_progress(ProgressEvent {
            execution_id: record.id.clone(),
            status: record.status,
            percent: final_percent,
            rate: snapshot.rate,
            stage: snapshot.stage,
            timestamp: now,
        });

        oscar_metrics::observe_execution_finished(
            record.status.as_str(),
            Duration::from_secs(record.duration_seconds.unwrap_or(0).max(0) as u64),
        );

        if let Some(sandbox_id) = task.sandbox_id() {
            let force = record.status != ExecutionStatus::Completed;
            if let Err(err) = self.sandbox.remove(&sandbox_id, force).await {
                warn!(id = %record.id, %sandbox_id, %err, "failed to remove sandbox");
            }
        }
    }
}

async fn worker_loop(this: Arc<Orchestrator>, index: usize) {
    debug!(worker = index, "worker started");
    loop {
        if this.root.is_cancelled() {
            break;
        }
        let next = { this.queue.lock().await.try_next() };
        let Some(id) = next else {
            tokio::select! {
                _ = this.root.cancelled() => break,
                _ = this.notifier.notified() => continue,
            }
        };
        this.run_one(&id).await;
        this.queue.lock().await.complete(&id);
    }
    debug!(worker = index, "worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_buffer_keeps_the_tail() {
        let mut buffer = LogBuffer::new(32);
        for i in 0..10 {
            buffer.push(&format!("line number {i}"));
        }
        let contents = buffer.contents();
        assert!(contents.len() <= 32 + "line number 9".len());
        assert!(contents.contains("line number 9"));
        assert!(!contents.contains("line number 0"));
    }

    #[test]
    fn clip_tail_respects_char_boundaries() {
        assert_eq!(clip_tail("hello", 100), "hello");
        assert_eq!(clip_tail("hello world", 5), "world");
        // Multi-byte characters are not split.
        let clipped = clip_tail("ééééé", 3);
        assert!(clipped.chars().all(|c| c == 'é'));
    }
}
