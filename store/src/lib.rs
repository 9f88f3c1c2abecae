//! Persistence interfaces consumed by the orchestrator, plus the credential
//! vault. The orchestrator only ever talks to the traits in this module; the
//! in-memory implementation backs tests and single-node deployments.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use oscar_lib::{ConnectionDescriptor, ExecutionRecord, ExecutionStatus, RiskLevel};

mod mem_store;
pub mod vault;

pub use mem_store::InMemoryStore;
pub use vault::{CredentialVault, VaultError};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("record {0} not found")]
    RecordNotFound(String),
    #[error("connection {0} not found")]
    ConnectionNotFound(String),
    #[error("record {0} already exists")]
    Duplicate(String),
    #[error("store backend error: {0}")]
    Backend(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Filters for listing execution records. All fields are conjunctive.
#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
pub struct ListFilter {
    pub status: Option<ExecutionStatus>,
    pub connection_id: Option<String>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    /// Substring match on id, database name and table name
    pub keyword: Option<String>,
}

/// 1-based pagination with a clamped page size.
#[derive(PartialEq, Eq, Debug, Clone, Copy, Deserialize, ToSchema)]
pub struct Page {
    pub page: u32,
    pub size: u32,
}

impl Default for Page {
    fn default() -> Self {
        Self { page: 1, size: 20 }
    }
}

impl Page {
    pub const MAX_SIZE: u32 = 200;

    /// Clamp to `page >= 1`, `size in 1..=200`.
    pub fn normalized(self) -> Self {
        Self {
            page: self.page.max(1),
            size: self.size.clamp(1, Self::MAX_SIZE),
        }
    }

    pub fn offset(self) -> usize {
        let page = self.normalized();
        ((page.page - 1) * page.size) as usize
    }
}

/// Durable storage for execution records. Implementations must be safe to
/// share across worker tasks.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn insert(&self, record: &ExecutionRecord) -> StoreResult<()>;
    async fn update(&self, record: &ExecutionRecord) -> StoreResult<()>;
    async fn get(&self, id: &str) -> StoreResult<ExecutionRecord>;
    /// Returns the matching page ordered by `created_at` descending, plus the
    /// total number of matches before pagination.
    async fn list(&self, filter: &ListFilter, page: Page)
        -> StoreResult<(Vec<ExecutionRecord>, u64)>;
    async fn select_logs(&self, id: &str) -> StoreResult<Option<String>>;
}

/// Lookup of managed connections.
#[async_trait]
pub trait ConnectionStore: Send + Sync {
    async fn get(&self, id: &str) -> StoreResult<ConnectionDescriptor>;
    async fn insert(&self, connection: &ConnectionDescriptor) -> StoreResult<()>;
    async fn list(&self) -> StoreResult<Vec<ConnectionDescriptor>>;
}

/// Outcome recorded with an audit entry.
#[derive(PartialEq, Eq, Debug, Clone, Copy, Deserialize, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum AuditStatus {
    Success,
    Failed,
    Blocked,
}

/// One append-only audit event.
#[derive(Debug, Clone, Deserialize, Serialize, ToSchema)]
pub struct AuditEntry {
    pub id: String,
    pub user: String,
    pub action: String,
    pub resource_type: Option<String>,
    pub resource_id: Option<String>,
    pub risk_level: Option<RiskLevel>,
    pub status: AuditStatus,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl AuditEntry {
    pub fn new(user: &str, action: &str, status: AuditStatus) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user: user.to_string(),
            action: action.to_string(),
            resource_type: None,
            resource_id: None,
            risk_level: None,
            status,
            error: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_resource(mut self, resource_type: &str, resource_id: &str) -> Self {
        self.resource_type = Some(resource_type.to_string());
        self.resource_id = Some(resource_id.to_string());
        self
    }

    pub fn with_risk_level(mut self, level: RiskLevel) -> Self {
        self.risk_level = Some(level);
        self
    }

    pub fn with_error(mut self, error: String) -> Self {
        self.error = Some(error);
        self
    }
}

/// Append-only audit trail. Writes are best-effort from the caller's point of
/// view; a failed audit insert must never fail the audited operation.
#[async_trait]
pub trait AuditStore: Send + Sync {
    async fn insert(&self, entry: &AuditEntry) -> StoreResult<()>;
    /// Entries by one user since a point in time, newest first. Feeds the
    /// operator-frequency risk rule.
    async fn recent_by_user(
        &self,
        user: &str,
        since: DateTime<Utc>,
    ) -> StoreResult<Vec<AuditEntry>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_normalization_clamps_bounds() {
        assert_eq!(
            Page { page: 0, size: 0 }.normalized(),
            Page { page: 1, size: 1 }
        );
        assert_eq!(
            Page { page: 3, size: 500 }.normalized(),
            Page {
                page: 3,
                size: Page::MAX_SIZE,
            }
        );
        let default = Page::default();
        assert_eq!(default.page, 1);
        assert_eq!(default.size, 20);
    }

    #[test]
    fn page_offset_is_zero_based() {
        assert_eq!(Page { page: 1, size: 20 }.offset(), 0);
        assert_eq!(Page { page: 3, size: 20 }.offset(), 40);
    }
}
