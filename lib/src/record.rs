use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// The kind of DDL intent behind an execution.
#[derive(PartialEq, Eq, Debug, Clone, Copy, Deserialize, Serialize, ToSchema, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DdlType {
    /// Table rebuild through a no-op copy, reclaims storage and compacts indexes
    Fragment,
    AddColumn,
    ModifyColumn,
    DropColumn,
    AddIndex,
    DropIndex,
    Other,
}

impl DdlType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DdlType::Fragment => "fragment",
            DdlType::AddColumn => "add_column",
            DdlType::ModifyColumn => "modify_column",
            DdlType::DropColumn => "drop_column",
            DdlType::AddIndex => "add_index",
            DdlType::DropIndex => "drop_index",
            DdlType::Other => "other",
        }
    }
}

/// Lifecycle state of an execution record.
#[derive(PartialEq, Eq, Debug, Clone, Copy, Deserialize, Serialize, ToSchema, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Persisted and waiting in the queue
    Pending,
    /// A worker is driving the sandboxed tool
    Running,
    /// The tool exited with code 0
    Completed,
    /// Build, credential, sandbox or tool failure
    Failed,
    /// Stopped by an operator or by shutdown
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }

    /// Whether `next` is a legal successor within one attempt. Retry
    /// (`failed|cancelled -> pending`) is the only edge that leaves a
    /// terminal state.
    pub fn can_transition_to(&self, next: ExecutionStatus) -> bool {
        use ExecutionStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Failed, Pending)
                | (Cancelled, Pending)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Deployment environment of a managed connection.
#[derive(PartialEq, Eq, Debug, Clone, Copy, Deserialize, Serialize, ToSchema, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    Prod,
    Test,
    Dev,
}

/// Tunables forwarded to the external tool. Zero / empty fields are omitted
/// from the generated command.
#[derive(PartialEq, Debug, Clone, Deserialize, Serialize, ToSchema)]
#[serde(default)]
pub struct ExecutionParams {
    pub chunk_size: u32,
    pub max_load: String,
    pub critical_load: String,
    pub charset: String,
    pub lock_wait_timeout: u32,
    /// Extra flags appended verbatim to the invocation
    pub other_params: String,
}

impl Default for ExecutionParams {
    fn default() -> Self {
        Self {
            chunk_size: 1000,
            max_load: "Threads_running=25".to_string(),
            critical_load: "Threads_running=50".to_string(),
            charset: "utf8mb4".to_string(),
            lock_wait_timeout: 0,
            other_params: String::new(),
        }
    }
}

/// The durable unit of work: one scheduled or attempted schema change.
#[derive(PartialEq, Debug, Clone, Deserialize, Serialize, ToSchema)]
pub struct ExecutionRecord {
    /// Opaque globally-unique id
    pub id: String,
    pub connection_id: String,
    pub database_name: String,
    pub table_name: String,
    pub ddl_type: DdlType,
    /// The operator-supplied ALTER clause, when the intent is not a rebuild
    pub original_ddl: Option<String>,
    /// Redacted tool invocation (the password value is always `***`)
    pub generated_command: String,
    pub execution_params: ExecutionParams,
    pub status: ExecutionStatus,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_seconds: Option<i64>,
    pub sandbox_id: Option<String>,
    pub processed_rows: u64,
    pub total_rows: u64,
    pub avg_speed: Option<f64>,
    /// Captured tool output, bounded to the trailing portion
    pub execution_logs: Option<String>,
    pub error_message: Option<String>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ExecutionRecord {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: String,
        connection_id: String,
        database_name: String,
        table_name: String,
        ddl_type: DdlType,
        original_ddl: Option<String>,
        generated_command: String,
        execution_params: ExecutionParams,
        created_by: String,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            connection_id,
            database_name,
            table_name,
            ddl_type,
            original_ddl,
            generated_command,
            execution_params,
            status: ExecutionStatus::Pending,
            start_time: None,
            end_time: None,
            duration_seconds: None,
            sandbox_id: None,
            processed_rows: 0,
            total_rows: 0,
            avg_speed: None,
            execution_logs: None,
            error_message: None,
            created_by,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_running(&self) -> bool {
        self.status == ExecutionStatus::Running
    }

    pub fn can_cancel(&self) -> bool {
        matches!(
            self.status,
            ExecutionStatus::Pending | ExecutionStatus::Running
        )
    }

    pub fn can_retry(&self) -> bool {
        matches!(
            self.status,
            ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }

    /// Transition to `running` and stamp the start time.
    pub fn mark_running(&mut self, now: DateTime<Utc>) {
        self.status = ExecutionStatus::Running;
        self.start_time = Some(now);
        self.updated_at = now;
    }

    /// Transition to a terminal status, stamping `end_time` and
    /// `duration_seconds`. `error` is recorded only for failures; cancelled
    /// records carry no error message.
    pub fn mark_terminal(
        &mut self,
        status: ExecutionStatus,
        now: DateTime<Utc>,
        error: Option<String>,
    ) {
        debug_assert!(status.is_terminal());
        self.status = status;
        self.end_time = Some(now);
        if let Some(start) = self.start_time {
            self.duration_seconds = Some((now - start).num_seconds());
        }
        self.error_message = if status == ExecutionStatus::Failed {
            error
        } else {
            None
        };
        self.updated_at = now;
    }

    /// Reset a failed or cancelled record so it can run again. Clears the
    /// previous attempt's timing, error and sandbox binding.
    pub fn reset_for_retry(&mut self, now: DateTime<Utc>) {
        debug_assert!(self.can_retry());
        self.status = ExecutionStatus::Pending;
        self.start_time = None;
        self.end_time = None;
        self.duration_seconds = None;
        self.error_message = None;
        self.sandbox_id = None;
        self.processed_rows = 0;
        self.avg_speed = None;
        self.updated_at = now;
    }
}

/// A managed database connection, as consumed by the orchestrator. The
/// password is held encrypted; only the vault can recover the plaintext.
#[derive(PartialEq, Debug, Clone, Deserialize, Serialize, ToSchema)]
pub struct ConnectionDescriptor {
    pub id: String,
    pub name: String,
    pub environment: Environment,
    pub host: String,
    pub port: u16,
    pub username: String,
    /// Vault-encrypted, base64-encoded password
    pub encrypted_password: String,
    pub database_name: String,
    pub connect_timeout: u32,
    pub charset: String,
    pub use_ssl: bool,
}
