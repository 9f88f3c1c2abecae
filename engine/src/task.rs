use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use utoipa::ToSchema;

use oscar_lib::ExecutionStatus;

/// Live, mutable state of one running task. Guarded by the task's own lock;
/// the registry lock is never held while touching it.
#[derive(Debug, Clone)]
struct LiveState {
    status: ExecutionStatus,
    stage: String,
    percent: f64,
    rate: f64,
    sandbox_id: Option<String>,
}

/// One actively-executing record. Created when a worker accepts a queue item,
/// dropped from the registry on the terminal transition.
#[derive(Debug)]
pub(crate) struct RunningTask {
    pub id: String,
    pub cancel: CancellationToken,
    pub started_at: DateTime<Utc>,
    live: Mutex<LiveState>,
}

impl RunningTask {
    pub fn new(id: &str, cancel: CancellationToken) -> Self {
        Self {
            id: id.to_string(),
            cancel,
            started_at: Utc::now(),
            live: Mutex::new(LiveState {
                status: ExecutionStatus::Running,
                stage: "accepted".to_string(),
                percent: 0.0,
                rate: 0.0,
                sandbox_id: None,
            }),
        }
    }

    pub fn status(&self) -> ExecutionStatus {
        self.live.lock().unwrap().status
    }

    pub fn set_status(&self, status: ExecutionStatus) {
        self.live.lock().unwrap().status = status;
    }

    pub fn set_stage(&self, stage: &str) {
        self.live.lock().unwrap().stage = stage.to_string();
    }

    pub fn set_progress(&self, percent: f64, rate: f64) {
        let mut live = self.live.lock().unwrap();
        if percent > 0.0 {
            live.percent = percent;
        }
        if rate > 0.0 {
            live.rate = rate;
        }
    }

    pub fn set_sandbox_id(&self, sandbox_id: &str) {
        self.live.lock().unwrap().sandbox_id = Some(sandbox_id.to_string());
    }

    pub fn sandbox_id(&self) -> Option<String> {
        self.live.lock().unwrap().sandbox_id.clone()
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        let live = self.live.lock().unwrap();
        TaskSnapshot {
            id: self.id.clone(),
            status: live.status,
            stage: live.stage.clone(),
            percent: live.percent,
            rate: live.rate,
            sandbox_id: live.sandbox_id.clone(),
            started_at: self.started_at,
        }
    }
}

/// Point-in-time copy of a task's live state, safe to hand to API callers.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct TaskSnapshot {
    pub id: String,
    pub status: ExecutionStatus,
    pub stage: String,
    pub percent: f64,
    pub rate: f64,
    pub sandbox_id: Option<String>,
    pub started_at: DateTime<Utc>,
}
